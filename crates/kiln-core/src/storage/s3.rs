//! S3-style object store client (path-style addressing, SigV4 auth).
//!
//! Works against MinIO or any S3-compatible endpoint. Download URLs are
//! either presigned (bounded by the configured expiry) or stable direct URLs
//! composed from the public endpoint when the expiry is zero.

use std::path::Path;

use chrono::Utc;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use url::Url;

use super::sigv4::{sha256_hex, uri_encode, SigningContext};
use crate::config::StorageSettings;
use crate::error::{KilnError, Result};

/// Payload hash constant for requests signed without a body.
const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

pub struct S3Client {
    settings: StorageSettings,
    http: reqwest::Client,
    /// `host[:port]` used for the Host header and canonical request.
    host: String,
    /// `scheme://host[:port]` with no trailing slash.
    base: String,
}

impl S3Client {
    pub fn new(settings: StorageSettings) -> Result<Self> {
        let parsed = Url::parse(&settings.endpoint).map_err(|e| KilnError::Config {
            message: format!("Invalid object store endpoint {}: {e}", settings.endpoint),
        })?;
        let host = parsed
            .host_str()
            .map(|h| match parsed.port() {
                Some(port) => format!("{h}:{port}"),
                None => h.to_string(),
            })
            .ok_or_else(|| KilnError::Config {
                message: format!("Object store endpoint has no host: {}", settings.endpoint),
            })?;
        let base = format!("{}://{host}", parsed.scheme());

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(settings.timeout_sec))
            .user_agent("kiln-storage")
            .build()
            .expect("failed to build reqwest client");

        Ok(Self {
            settings,
            http,
            host,
            base,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.settings.bucket
    }

    pub fn settings(&self) -> &StorageSettings {
        &self.settings
    }

    fn signer(&self) -> SigningContext<'_> {
        SigningContext {
            access_key: &self.settings.access_key,
            secret_key: &self.settings.secret_key,
            region: &self.settings.region,
            timestamp: Utc::now(),
        }
    }

    fn object_path(&self, key: &str) -> String {
        format!(
            "/{}/{}",
            uri_encode(&self.settings.bucket, false),
            uri_encode(key, false)
        )
    }

    async fn send_signed(
        &self,
        method: reqwest::Method,
        canonical_path: &str,
        payload: Option<Vec<u8>>,
    ) -> Result<reqwest::Response> {
        let payload_hash = match &payload {
            Some(body) => sha256_hex(body),
            None => EMPTY_PAYLOAD_SHA256.to_string(),
        };
        let headers =
            self.signer()
                .sign_headers(method.as_str(), &self.host, canonical_path, &[], &payload_hash);

        let mut request = self.http.request(method, format!("{}{canonical_path}", self.base));
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if let Some(body) = payload {
            request = request.body(body);
        }
        Ok(request.send().await?)
    }

    /// Create the configured bucket if it does not exist. An
    /// already-owned-bucket conflict is treated as success.
    pub async fn ensure_bucket(&self) -> Result<()> {
        let path = format!("/{}", uri_encode(&self.settings.bucket, false));
        let response = self.send_signed(reqwest::Method::PUT, &path, Some(Vec::new())).await?;
        let status = response.status();
        if status.is_success() || status.as_u16() == 409 {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(KilnError::Upstream {
            service: "object-store".into(),
            status: status.as_u16(),
            body,
        })
    }

    /// Download an object to a local file, streaming.
    pub async fn get_object(&self, key: &str, dest: &Path) -> Result<()> {
        let response = self
            .send_signed(reqwest::Method::GET, &self.object_path(key), None)
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(KilnError::Upstream {
                service: "object-store".into(),
                status: status.as_u16(),
                body,
            });
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| KilnError::io_with_path(e, parent))?;
        }
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| KilnError::io_with_path(e, dest))?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| KilnError::io_with_path(e, dest))?;
        }
        file.flush()
            .await
            .map_err(|e| KilnError::io_with_path(e, dest))?;
        debug!("Downloaded {key} to {}", dest.display());
        Ok(())
    }

    /// Upload a local file under the given key.
    pub async fn put_object(&self, path: &Path, key: &str) -> Result<()> {
        let body = tokio::fs::read(path)
            .await
            .map_err(|e| KilnError::io_with_path(e, path))?;
        let response = self
            .send_signed(reqwest::Method::PUT, &self.object_path(key), Some(body))
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(KilnError::Upstream {
                service: "object-store".into(),
                status: status.as_u16(),
                body,
            });
        }
        debug!("Uploaded {} as {key}", path.display());
        Ok(())
    }

    /// Presigned GET URL bounded by `expires_sec`.
    pub fn presigned_get(&self, key: &str, expires_sec: u64) -> String {
        let path = self.object_path(key);
        let query = self.signer().presign_query("GET", &self.host, &path, expires_sec);
        format!("{}{path}?{query}", self.base)
    }

    /// Stable direct URL composed from the public endpoint (or the storage
    /// endpoint when no public one is configured).
    pub fn stable_url(&self, key: &str) -> String {
        let base = self
            .settings
            .public_endpoint
            .as_deref()
            .unwrap_or(&self.settings.endpoint)
            .trim_end_matches('/');
        format!("{base}/{}/{key}", self.settings.bucket)
    }

    /// Download URL for a converted artifact: presigned when the configured
    /// expiry is positive, stable otherwise.
    pub fn download_url(&self, key: &str) -> String {
        if self.settings.presign_expiry_sec > 0 {
            self.presigned_get(key, self.settings.presign_expiry_sec)
        } else {
            self.stable_url(key)
        }
    }

    /// Reachability probe for health reporting: HEAD the bucket.
    pub async fn probe(&self) -> String {
        let path = format!("/{}", uri_encode(&self.settings.bucket, false));
        match self.send_signed(reqwest::Method::HEAD, &path, None).await {
            Ok(response) if response.status().is_success() => "ok".into(),
            Ok(response) if response.status().as_u16() == 404 => "missing-bucket".into(),
            Ok(response) => format!("error:status-{}", response.status().as_u16()),
            Err(err) => {
                warn!("Object store health check failed: {err}");
                "error:unreachable".into()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> S3Client {
        S3Client::new(StorageSettings::default()).unwrap()
    }

    #[test]
    fn test_host_parsing() {
        let client = test_client();
        assert_eq!(client.host, "localhost:9000");
        assert_eq!(client.base, "http://localhost:9000");
    }

    #[test]
    fn test_stable_url_prefers_public_endpoint() {
        let mut settings = StorageSettings::default();
        settings.public_endpoint = Some("https://files.example.com/".into());
        let client = S3Client::new(settings).unwrap();
        assert_eq!(
            client.stable_url("converted/t1/a.pdf"),
            "https://files.example.com/qadata/converted/t1/a.pdf"
        );
    }

    #[test]
    fn test_download_url_stable_when_expiry_zero() {
        let client = test_client();
        assert_eq!(
            client.download_url("x.pdf"),
            "http://localhost:9000/qadata/x.pdf"
        );
    }

    #[test]
    fn test_download_url_presigned_when_expiry_positive() {
        let mut settings = StorageSettings::default();
        settings.presign_expiry_sec = 600;
        let client = S3Client::new(settings).unwrap();
        let url = client.download_url("x.pdf");
        assert!(url.contains("X-Amz-Signature="));
        assert!(url.contains("X-Amz-Expires=600"));
    }

    #[test]
    fn test_object_path_encodes_key() {
        let client = test_client();
        assert_eq!(
            client.object_path("converted/a b.pdf"),
            "/qadata/converted/a%20b.pdf"
        );
    }
}
