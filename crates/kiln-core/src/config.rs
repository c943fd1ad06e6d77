//! Centralized settings for the conversion engine plus the shared loader used
//! by every subsystem.
//!
//! Each subsystem owns a settings struct loaded through [`load_settings`]:
//! struct defaults, then an optional YAML file, then environment variables
//! with the subsystem prefix and `__` as the nesting separator
//! (e.g. `RAG_STORAGE__ENDPOINT` → `storage.endpoint`).

use std::collections::HashMap;
use std::path::Path;

use config::{Config, Environment, File};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Load a settings struct from defaults, an optional config file, and
/// `PREFIX_`-scoped environment variables.
pub fn load_settings<T>(prefix: &str, config_file: Option<&Path>) -> Result<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    let mut builder = Config::builder().add_source(Config::try_from(&T::default())?);
    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path.to_path_buf()));
    }
    let cfg = builder
        .add_source(Environment::with_prefix(prefix).separator("__"))
        .build()?;
    Ok(cfg.try_deserialize()?)
}

/// Copy `LEGACY_PREFIX*` environment variables to `NEW_PREFIX*` unless the
/// new name is already set. Call before [`load_settings`] for subsystems that
/// renamed their prefix.
pub fn alias_env_prefix(legacy_prefix: &str, new_prefix: &str) {
    let pairs: Vec<(String, String)> = std::env::vars()
        .filter(|(key, _)| key.starts_with(legacy_prefix))
        .map(|(key, value)| {
            let mapped = format!("{new_prefix}{}", &key[legacy_prefix.len()..]);
            (mapped, value)
        })
        .collect();
    for (mapped, value) in pairs {
        if std::env::var_os(&mapped).is_none() {
            std::env::set_var(&mapped, value);
        }
    }
}

/// Per-format and aggregate upload limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLimitSettings {
    pub default_max_size_mb: u64,
    pub per_format_max_size_mb: HashMap<String, u64>,
    pub max_total_upload_size_mb: u64,
    pub max_files_per_task: usize,
}

impl Default for FileLimitSettings {
    fn default() -> Self {
        Self {
            default_max_size_mb: 100,
            per_format_max_size_mb: HashMap::new(),
            max_total_upload_size_mb: 500,
            max_files_per_task: 10,
        }
    }
}

impl FileLimitSettings {
    /// Per-format limit with fallback to the default.
    pub fn limit_for(&self, fmt: &str) -> u64 {
        self.per_format_max_size_mb
            .get(fmt)
            .copied()
            .unwrap_or(self.default_max_size_mb)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
    pub log_dir: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            log_dir: "./logs".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringSettings {
    pub prometheus_port: u16,
    pub metrics_interval_sec: u64,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            prometheus_port: 9091,
            metrics_interval_sec: 15,
        }
    }
}

/// S3-style object store connection settings.
///
/// `presign_expiry_sec == 0` means download URLs are stable direct URLs
/// composed from `public_endpoint` (or `endpoint`) instead of presigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageSettings {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
    pub public_endpoint: Option<String>,
    pub presign_expiry_sec: u64,
    pub timeout_sec: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000".into(),
            access_key: "minioadmin".into(),
            secret_key: "minioadmin".into(),
            bucket: "qadata".into(),
            region: "us-east-1".into(),
            public_endpoint: None,
            presign_expiry_sec: 0,
            timeout_sec: 30,
        }
    }
}

/// Per-job storage override carried on a conversion job.
///
/// Merged shallowly over [`StorageSettings`]; the merge never touches global
/// state and the resulting settings never reuse the cached default client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageOverride {
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub bucket: Option<String>,
}

impl StorageOverride {
    pub fn is_empty(&self) -> bool {
        self.endpoint.is_none()
            && self.access_key.is_none()
            && self.secret_key.is_none()
            && self.bucket.is_none()
    }

    /// Apply this override on top of base settings, returning a derived copy.
    pub fn apply(&self, base: &StorageSettings) -> StorageSettings {
        let mut derived = base.clone();
        if let Some(endpoint) = &self.endpoint {
            derived.endpoint = endpoint.clone();
        }
        if let Some(access_key) = &self.access_key {
            derived.access_key = access_key.clone();
        }
        if let Some(secret_key) = &self.secret_key {
            derived.secret_key = secret_key.clone();
        }
        if let Some(bucket) = &self.bucket {
            derived.bucket = bucket.clone();
        }
        derived
    }
}

/// Legacy attach-id file server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachStoreSettings {
    pub base_url: String,
    pub download_path: String,
    pub upload_path: String,
    pub attach_id_param: String,
    pub file_field: String,
    pub default_form_fields: HashMap<String, String>,
    pub auth_header: String,
    pub auth_token: Option<String>,
    pub token_prefix: String,
    pub extra_headers: HashMap<String, String>,
    pub timeout_sec: u64,
}

impl Default for AttachStoreSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8300".into(),
            download_path: "/filemanager/download".into(),
            upload_path: "/filemanager/upload".into(),
            attach_id_param: "attachId".into(),
            file_field: "file".into(),
            default_form_fields: HashMap::new(),
            auth_header: "Authorization".into(),
            auth_token: None,
            token_prefix: "Bearer ".into(),
            extra_headers: HashMap::new(),
            timeout_sec: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiAuthSettings {
    pub required: bool,
    pub app_secrets_path: String,
    pub header_appid: String,
    pub header_key: String,
}

impl Default for ApiAuthSettings {
    fn default() -> Self {
        Self {
            required: true,
            app_secrets_path: "./secrets/appkeys.json".into(),
            header_appid: "X-Appid".into(),
            header_key: "X-Key".into(),
        }
    }
}

/// Worker-pool tuning shared by every logical queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    pub default_queue: String,
    pub task_time_limit_sec: u64,
    pub prefetch_multiplier: usize,
    pub workers_per_queue: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            default_queue: "conversion".into(),
            task_time_limit_sec: 300,
            prefetch_multiplier: 4,
            workers_per_queue: 2,
        }
    }
}

/// A configured (source, target) conversion mapping used when the plugin
/// registry has no pairing for a source format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionFormat {
    pub source: String,
    pub target: String,
    pub plugin: Option<String>,
}

/// Chat-completion collaborator settings (shared by the LLM, metadata, and
/// vision workers, each under its own env prefix).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSettings {
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub request_timeout_sec: u64,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            api_base: "https://dashscope.aliyuncs.com/compatible-mode/v1".into(),
            api_key: None,
            model: "qwen-plus".into(),
            request_timeout_sec: 60,
        }
    }
}

/// Top-level settings for the conversion engine (`RAG_` prefix).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConverterSettings {
    pub service_name: String,
    pub environment: String,
    pub api_version: String,
    pub base_url: String,
    pub host: String,
    pub port: u16,
    pub work_dir: String,
    pub test_artifacts_dir: Option<String>,
    pub file_limits: FileLimitSettings,
    pub logging: LoggingSettings,
    pub monitoring: MonitoringSettings,
    pub storage: StorageSettings,
    pub attach_store: AttachStoreSettings,
    pub convert_formats: Vec<ConversionFormat>,
    pub plugin_modules: Vec<String>,
    pub plugin_modules_file: Option<String>,
    pub api_auth: ApiAuthSettings,
    pub queues: QueueSettings,
}

impl Default for ConverterSettings {
    fn default() -> Self {
        Self {
            service_name: "kiln-conversion-engine".into(),
            environment: "dev".into(),
            api_version: "v1".into(),
            base_url: "/api/v1".into(),
            host: "0.0.0.0".into(),
            port: 8080,
            work_dir: std::env::temp_dir()
                .join("kiln_converter")
                .to_string_lossy()
                .into_owned(),
            test_artifacts_dir: None,
            file_limits: FileLimitSettings::default(),
            logging: LoggingSettings::default(),
            monitoring: MonitoringSettings::default(),
            storage: StorageSettings::default(),
            attach_store: AttachStoreSettings::default(),
            convert_formats: Vec::new(),
            plugin_modules: Vec::new(),
            plugin_modules_file: Some("./config/plugins.yaml".into()),
            api_auth: ApiAuthSettings::default(),
            queues: QueueSettings::default(),
        }
    }
}

impl ConverterSettings {
    /// Load from `RAG_*` environment on top of defaults and the optional
    /// file named by `RAG_CONFIG_FILE`.
    pub fn from_env() -> Result<Self> {
        let file = std::env::var("RAG_CONFIG_FILE").ok();
        load_settings("RAG", file.as_deref().map(Path::new))
    }
}
