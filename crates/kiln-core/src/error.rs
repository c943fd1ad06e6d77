//! Error types for the Kiln platform.
//!
//! One enum covers every subsystem so that workers and HTTP handlers can
//! convert any failure into a structured result record without downcasting.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Kiln operations.
#[derive(Debug, Error)]
pub enum KilnError {
    // Upstream services (object store, attach store, search endpoint, LLM,
    // ASR, vision): either no response arrived, the response was a non-2xx,
    // or the body was unusable.
    #[error("Request to {service} could not complete: {message}")]
    Transport { service: String, message: String },

    #[error("Upstream {service} returned {status}: {body}")]
    Upstream {
        service: String,
        status: u16,
        body: String,
    },

    #[error("Upstream {service} returned a malformed body: {snippet}")]
    UpstreamFormat { service: String, snippet: String },

    // Request validation
    #[error("Unsupported format {source_format}->{target_format} (source={locator})")]
    UnsupportedFormat {
        source_format: String,
        target_format: String,
        locator: String,
    },

    #[error("Input preparation failed (source={locator}): {message}")]
    InputPreparation { locator: String, message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Conversion / task execution
    #[error("Conversion failed: {message}")]
    ConversionFailed { message: String },

    #[error("Subprocess `{program}` failed: {message}")]
    Subprocess { program: String, message: String },

    #[error("Task {task_id} failed: {message}")]
    TaskFailed { task_id: String, message: String },

    /// A bounded wait on queued work elapsed. The work itself keeps
    /// running; callers poll by task id.
    #[error("Gave up on {what} after {waited:?}; the task was not revoked")]
    WaitTimeout {
        what: String,
        waited: std::time::Duration,
    },

    #[error("Task {0} not found")]
    TaskNotFound(String),

    #[error("No worker registered for task {task_name} on queue {queue}")]
    UnknownTask { queue: String, task_name: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Plugin already registered for {source_format}->{target_format}")]
    PluginAlreadyRegistered {
        source_format: String,
        target_format: String,
    },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Kiln operations.
pub type Result<T> = std::result::Result<T, KilnError>;

// Conversion implementations for common error types

impl From<std::io::Error> for KilnError {
    fn from(err: std::io::Error) -> Self {
        KilnError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        KilnError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for KilnError {
    fn from(err: reqwest::Error) -> Self {
        let service = err
            .url()
            .and_then(|url| url.host_str())
            .unwrap_or("remote endpoint")
            .to_string();
        KilnError::Transport {
            service,
            message: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for KilnError {
    fn from(err: config::ConfigError) -> Self {
        KilnError::Config {
            message: err.to_string(),
        }
    }
}

impl KilnError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        KilnError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Whether a retry at the caller could plausibly succeed. Wait timeouts
    /// are excluded: the queued work is still running, so the right move is
    /// to poll, not resubmit.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KilnError::Transport { .. } | KilnError::Upstream { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KilnError::UnsupportedFormat {
            source_format: "doc".into(),
            target_format: "mp4".into(),
            locator: "https://h/in.doc".into(),
        };
        assert_eq!(
            err.to_string(),
            "Unsupported format doc->mp4 (source=https://h/in.doc)"
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(KilnError::Transport {
            service: "object-store".into(),
            message: "connection refused".into(),
        }
        .is_retryable());
        // A timed-out wait means the task is still in flight; resubmitting
        // would duplicate it.
        assert!(!KilnError::WaitTimeout {
            what: "task abc".into(),
            waited: std::time::Duration::from_secs(5),
        }
        .is_retryable());
        assert!(!KilnError::Config {
            message: "bad".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_unsupported_format_carries_locator() {
        let err = KilnError::InputPreparation {
            locator: "inline.doc".into(),
            message: "no bytes".into(),
        };
        assert!(err.to_string().contains("inline.doc"));
    }
}
