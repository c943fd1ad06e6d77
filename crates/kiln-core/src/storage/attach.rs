//! Client for the legacy attach-id file server.
//!
//! The server addresses files by an opaque attach id, authenticates with a
//! header token, and answers uploads with a JSON envelope that is not always
//! strict JSON (some deployments wrap it in HTML or log noise). The parser
//! therefore tries a strict parse first and then the first balanced
//! `{…}` slice of the body.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use reqwest::multipart;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use url::Url;

use crate::config::AttachStoreSettings;
use crate::error::{KilnError, Result};

/// Upload codes the server reports as success.
const SUCCESS_CODES: [&str; 3] = ["success", "0", "200"];

/// Envelope returned by a successful upload.
#[derive(Debug, Clone)]
pub struct FileUploadResult {
    pub code: String,
    pub msg: Option<String>,
    pub fileid: Option<String>,
    pub file_size: Option<String>,
    pub file_type: Option<String>,
    pub preview_url: Option<String>,
    pub download_url: Option<String>,
    pub raw: Value,
}

impl FileUploadResult {
    pub fn succeeded(&self) -> bool {
        SUCCESS_CODES.contains(&self.code.as_str())
    }

    fn from_payload(payload: Value) -> Self {
        let text = |key: &str| {
            payload
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        Self {
            code: payload
                .get("code")
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default(),
            msg: text("msg"),
            fileid: text("fileid"),
            file_size: text("fileSize"),
            file_type: text("fileType"),
            preview_url: text("filePreviewUrl"),
            download_url: text("fileDownloadUrl"),
            raw: payload,
        }
    }
}

pub struct AttachClient {
    settings: AttachStoreSettings,
    http: reqwest::Client,
}

impl AttachClient {
    pub fn new(settings: AttachStoreSettings) -> Self {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        for (name, value) in &settings.extra_headers {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                reqwest::header::HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
        if let Some(token) = &settings.auth_token {
            let full = format!("{}{token}", settings.token_prefix);
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(settings.auth_header.as_bytes()),
                reqwest::header::HeaderValue::from_str(&full),
            ) {
                headers.insert(name, value);
            }
        }

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(settings.timeout_sec))
            .default_headers(headers)
            .user_agent("kiln-storage")
            .build()
            .expect("failed to build reqwest client");

        Self { settings, http }
    }

    fn build_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.settings.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// If a remote URL targets this server's download endpoint with the
    /// attach-id parameter present, return the attach id so the caller can
    /// route through the authenticated client instead of a plain GET.
    pub fn attach_id_from_url(&self, raw_url: &str) -> Option<String> {
        let url = Url::parse(raw_url).ok()?;
        let own = Url::parse(&self.settings.base_url).ok()?;
        let same_host = url.host_str()?.eq_ignore_ascii_case(own.host_str()?);
        let same_path = url.path().trim_end_matches('/')
            == self.settings.download_path.trim_end_matches('/');
        if !(same_host && same_path) {
            return None;
        }
        url.query_pairs()
            .find(|(key, _)| key == self.settings.attach_id_param.as_str())
            .map(|(_, value)| value.into_owned())
    }

    /// Download the file behind an attach id, streaming to `dest`.
    pub async fn download(&self, attach_id: &str, dest: &Path) -> Result<PathBuf> {
        let url = self.build_url(&self.settings.download_path);
        let response = self
            .http
            .get(&url)
            .query(&[(self.settings.attach_id_param.as_str(), attach_id)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(KilnError::Upstream {
                service: "attach-store".into(),
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
        Ok(dest.to_path_buf())
    }

    /// Upload a file and return the parsed envelope. Fails when the server
    /// reports a non-success code.
    pub async fn upload(&self, path: &Path, filename: Option<&str>) -> Result<FileUploadResult> {
        let upload_name = filename
            .map(str::to_string)
            .or_else(|| path.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "upload.bin".into());

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| KilnError::io_with_path(e, path))?;
        let mut form = multipart::Form::new();
        for (field, value) in &self.settings.default_form_fields {
            form = form.text(field.clone(), value.clone());
        }
        form = form.part(
            self.settings.file_field.clone(),
            multipart::Part::bytes(bytes).file_name(upload_name.clone()),
        );

        let url = self.build_url(&self.settings.upload_path);
        debug!("Uploading {} to {url} as {upload_name}", path.display());
        let response = self.http.post(&url).multipart(form).send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !(200..300).contains(&status.as_u16()) {
            return Err(KilnError::Upstream {
                service: "attach-store".into(),
                status: status.as_u16(),
                body,
            });
        }

        let payload = parse_json_loose(&body)?;
        let result = FileUploadResult::from_payload(payload);
        if !result.succeeded() {
            return Err(KilnError::Upstream {
                service: "attach-store".into(),
                status: status.as_u16(),
                body: format!("upload failed with code={}: {}", result.code, result.raw),
            });
        }
        Ok(result)
    }
}

/// Parse JSON even when the response is wrapped in extra characters.
///
/// Strict parse first, then the slice between the first `{` and the last `}`.
pub fn parse_json_loose(body: &str) -> Result<Value> {
    let trimmed = body.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return Ok(value);
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            if let Ok(value) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                return Ok(value);
            }
        }
    }

    let snippet: String = trimmed.chars().take(200).collect::<String>().replace('\n', " ");
    Err(KilnError::UpstreamFormat {
        service: "attach-store".into(),
        snippet,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with(base_url: &str) -> AttachClient {
        AttachClient::new(AttachStoreSettings {
            base_url: base_url.into(),
            ..Default::default()
        })
    }

    #[test]
    fn test_parse_json_loose_strict() {
        let value = parse_json_loose(r#"{"code":"success","fileid":"f1"}"#).unwrap();
        assert_eq!(value["fileid"], "f1");
    }

    #[test]
    fn test_parse_json_loose_wrapped() {
        let value =
            parse_json_loose("<html>ok {\"code\":\"0\",\"fileid\":\"f2\"} trailer</html>").unwrap();
        assert_eq!(value["code"], "0");
    }

    #[test]
    fn test_parse_json_loose_garbage() {
        let err = parse_json_loose("not json at all");
        assert!(matches!(err, Err(KilnError::UpstreamFormat { .. })));
    }

    #[test]
    fn test_success_code_set() {
        for code in ["success", "0", "200"] {
            let result = FileUploadResult::from_payload(serde_json::json!({ "code": code }));
            assert!(result.succeeded(), "code {code} should succeed");
        }
        let result = FileUploadResult::from_payload(serde_json::json!({ "code": "500" }));
        assert!(!result.succeeded());
    }

    #[test]
    fn test_numeric_code_is_normalized() {
        let result = FileUploadResult::from_payload(serde_json::json!({ "code": 0 }));
        assert!(result.succeeded());
    }

    #[test]
    fn test_attach_id_from_url_same_host() {
        let client = client_with("http://fm.internal:8300");
        let id = client
            .attach_id_from_url("http://fm.internal:8300/filemanager/download?attachId=abc123");
        assert_eq!(id.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_attach_id_from_url_other_host() {
        let client = client_with("http://fm.internal:8300");
        assert!(client
            .attach_id_from_url("http://elsewhere/filemanager/download?attachId=abc123")
            .is_none());
        assert!(client
            .attach_id_from_url("http://fm.internal:8300/other/path?attachId=abc123")
            .is_none());
        assert!(client
            .attach_id_from_url("http://fm.internal:8300/filemanager/download?other=1")
            .is_none());
    }
}
