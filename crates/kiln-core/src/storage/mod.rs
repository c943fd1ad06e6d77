//! Object store gateway: uniform get/put/presign across the S3-style store
//! and the legacy attach-id file server.

mod attach;
mod s3;
mod sigv4;

pub use attach::{parse_json_loose, AttachClient, FileUploadResult};
pub use s3::S3Client;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use base64::Engine;
use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::config::{AttachStoreSettings, StorageOverride, StorageSettings};
use crate::error::{KilnError, Result};
use crate::job::FileSpec;

/// Facade over both physical backends plus the client cache.
///
/// Clients are cached in a map keyed by their full settings, so a per-job
/// storage override can never observe the cached default client: the derived
/// settings form a different key, and override clients are not cached at all.
pub struct StoreGateway {
    default_storage: StorageSettings,
    attach: Arc<AttachClient>,
    work_dir: PathBuf,
    cache: Mutex<HashMap<StorageSettings, Arc<S3Client>>>,
    http: reqwest::Client,
}

impl StoreGateway {
    pub fn new(
        storage: StorageSettings,
        attach: AttachStoreSettings,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .user_agent("kiln-storage")
            .build()
            .expect("failed to build reqwest client");
        Self {
            default_storage: storage,
            attach: Arc::new(AttachClient::new(attach)),
            work_dir: work_dir.into(),
            cache: Mutex::new(HashMap::new()),
            http,
        }
    }

    pub fn attach_client(&self) -> Arc<AttachClient> {
        Arc::clone(&self.attach)
    }

    pub fn default_storage(&self) -> &StorageSettings {
        &self.default_storage
    }

    /// Client for the default settings, cached process-wide.
    pub fn default_client(&self) -> Result<Arc<S3Client>> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = cache.get(&self.default_storage) {
            return Ok(Arc::clone(client));
        }
        let client = Arc::new(S3Client::new(self.default_storage.clone())?);
        cache.insert(self.default_storage.clone(), Arc::clone(&client));
        Ok(client)
    }

    /// Client for a job: the cached default, or a fresh short-lived client
    /// when a storage override is present.
    pub fn client_for(&self, storage_override: Option<&StorageOverride>) -> Result<Arc<S3Client>> {
        match storage_override {
            None => self.default_client(),
            Some(over) if over.is_empty() => self.default_client(),
            Some(over) => {
                let derived = over.apply(&self.default_storage);
                Ok(Arc::new(S3Client::new(derived)?))
            }
        }
    }

    fn workspace_file(&self, filename: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.work_dir)
            .map_err(|e| KilnError::io_with_path(e, &self.work_dir))?;
        Ok(self.work_dir.join(format!("{}_{filename}", Uuid::new_v4().simple())))
    }

    /// Resolve a file's locator into a local file path.
    pub async fn materialize(&self, spec: &FileSpec, client: &S3Client) -> Result<PathBuf> {
        if let Some(attach_id) = &spec.attach_id {
            let filename = spec.filename.clone().unwrap_or_else(|| attach_id.clone());
            let dest = self.workspace_file(&filename)?;
            self.attach.download(attach_id, &dest).await?;
            return unwrap_download(dest);
        }

        if let Some(raw) = &spec.inline_base64 {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(raw.trim())
                .map_err(|e| KilnError::Validation {
                    field: "inline_base64".into(),
                    message: format!("Invalid base64 payload: {e}"),
                })?;
            let filename = spec.filename.clone().unwrap_or_else(|| {
                let ext = spec
                    .source_format
                    .rsplit('/')
                    .next()
                    .filter(|s| !s.is_empty())
                    .unwrap_or("bin");
                format!("inline.{ext}")
            });
            let dest = self.workspace_file(&filename)?;
            tokio::fs::write(&dest, decoded)
                .await
                .map_err(|e| KilnError::io_with_path(e, &dest))?;
            return Ok(dest);
        }

        if let Some(local_path) = &spec.local_path {
            let path = PathBuf::from(local_path);
            if !path.exists() {
                return Err(KilnError::FileNotFound(path));
            }
            return Ok(path);
        }

        if let Some(object_key) = &spec.object_key {
            let filename = Path::new(object_key)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("input_{}", Uuid::new_v4().simple()));
            let dest = self.workspace_file(&filename)?;
            client.get_object(object_key, &dest).await?;
            return unwrap_download(dest);
        }

        if let Some(input_url) = &spec.input_url {
            // Same-host attach URLs go through the authenticated client.
            if let Some(attach_id) = self.attach.attach_id_from_url(input_url) {
                let filename = spec
                    .filename
                    .clone()
                    .or_else(|| url_basename(input_url))
                    .unwrap_or_else(|| attach_id.clone());
                let dest = self.workspace_file(&filename)?;
                match self.attach.download(&attach_id, &dest).await {
                    Ok(path) => return unwrap_download(path),
                    Err(err) => {
                        warn!("Attach download for {input_url} failed, falling back to plain GET: {err}");
                    }
                }
            }

            let filename = url_basename(input_url).unwrap_or_else(|| "input.bin".into());
            let dest = self.workspace_file(&filename)?;
            let response = self.http.get(input_url).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(KilnError::Upstream {
                    service: "download".into(),
                    status: status.as_u16(),
                    body: format!("GET {input_url} failed"),
                });
            }
            let bytes = response.bytes().await?;
            tokio::fs::write(&dest, &bytes)
                .await
                .map_err(|e| KilnError::io_with_path(e, &dest))?;
            return unwrap_download(dest);
        }

        Err(KilnError::InputPreparation {
            locator: spec.locator_label(),
            message: "No input source provided (object_key or input_url required)".into(),
        })
    }
}

fn url_basename(raw_url: &str) -> Option<String> {
    let parsed = url::Url::parse(raw_url).ok()?;
    let name = Path::new(parsed.path()).file_name()?.to_string_lossy().into_owned();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// If a download produced a directory, unwrap to the single contained file;
/// anything else fails with the first few entry names for context.
pub fn unwrap_download(path: PathBuf) -> Result<PathBuf> {
    if !path.is_dir() {
        return Ok(path);
    }

    let files: Vec<PathBuf> = WalkDir::new(&path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();
    if files.len() == 1 {
        debug!("Unwrapped downloaded directory {} to {}", path.display(), files[0].display());
        return Ok(files.into_iter().next().unwrap_or(path));
    }

    let entries: Vec<String> = std::fs::read_dir(&path)
        .map(|it| {
            it.filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    let shown = entries.iter().take(5).cloned().collect::<Vec<_>>().join(", ");
    let more = if entries.len() > 5 {
        format!(" (+{} more)", entries.len() - 5)
    } else {
        String::new()
    };
    Err(KilnError::InputPreparation {
        locator: path.display().to_string(),
        message: format!("Downloaded path is a directory; entries={shown}{more}"),
    })
}
