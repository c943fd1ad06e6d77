//! appid/key authentication against a JSON secrets file.
//!
//! Credentials arrive as headers or query parameters. The secrets file is a
//! JSON object of `{appid: key}` and reloads whenever its mtime changes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::SystemTime;

use axum::http::HeaderMap;
use tracing::warn;

use kiln_core::config::ApiAuthSettings;

use crate::errors::ApiError;

struct ValidatorCache {
    keys: HashMap<String, String>,
    last_mtime: Option<SystemTime>,
}

pub struct AppKeyValidator {
    settings: ApiAuthSettings,
    path: PathBuf,
    cache: Mutex<ValidatorCache>,
}

impl AppKeyValidator {
    pub fn new(settings: ApiAuthSettings) -> Self {
        let path = PathBuf::from(&settings.app_secrets_path);
        let validator = Self {
            settings,
            path,
            cache: Mutex::new(ValidatorCache {
                keys: HashMap::new(),
                last_mtime: None,
            }),
        };
        validator.reload_if_changed();
        validator
    }

    fn reload_if_changed(&self) {
        let mtime = std::fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .ok();
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if mtime.is_none() {
            cache.keys.clear();
            cache.last_mtime = None;
            return;
        }
        if cache.last_mtime == mtime {
            return;
        }

        match std::fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, String>>(&raw) {
                Ok(keys) => {
                    cache.keys = keys;
                    cache.last_mtime = mtime;
                }
                Err(err) => {
                    warn!("App secrets file {} is not a {{appid: key}} object: {err}", self.path.display());
                }
            },
            Err(err) => warn!("Failed to read app secrets {}: {err}", self.path.display()),
        }
    }

    pub fn is_valid(&self, appid: &str, key: &str) -> bool {
        self.reload_if_changed();
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.keys.get(appid).map(String::as_str) == Some(key)
    }

    /// Validate a request's credentials from headers or query parameters.
    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        query: &HashMap<String, String>,
    ) -> Result<(), ApiError> {
        if !self.settings.required {
            return Ok(());
        }

        let header_value = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let appid = header_value(&self.settings.header_appid)
            .or_else(|| query.get("appid").cloned());
        let key = header_value(&self.settings.header_key).or_else(|| query.get("key").cloned());

        let (Some(appid), Some(key)) = (appid, key) else {
            return Err(ApiError::new("ERR_AUTH_MISSING"));
        };
        if !self.is_valid(&appid, &key) {
            return Err(ApiError::new("ERR_AUTH_INVALID"));
        }
        Ok(())
    }
}
