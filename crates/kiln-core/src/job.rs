//! Wire types for conversion jobs and their results.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::StorageOverride;
use crate::error::{KilnError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

/// One file inside a conversion job.
///
/// Exactly one of the five locators must be present: `inline_base64`,
/// `local_path`, `object_key`, `input_url`, `attach_id`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileSpec {
    #[serde(default)]
    pub source_format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_format: Option<String>,
    #[serde(default)]
    pub size_mb: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attach_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Only meaningful for paged documents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_limit: Option<u32>,
    /// Only meaningful for audio/video sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u32>,
}

impl FileSpec {
    /// Human-readable source locator echoed in error messages.
    pub fn locator_label(&self) -> String {
        self.input_url
            .clone()
            .or_else(|| self.object_key.clone())
            .or_else(|| self.attach_id.clone())
            .or_else(|| self.local_path.clone())
            .or_else(|| self.filename.clone())
            .unwrap_or_else(|| {
                let fmt = if self.source_format.is_empty() {
                    "bin"
                } else {
                    &self.source_format
                };
                format!("inline.{fmt}")
            })
    }

    /// Enforce the exactly-one-locator invariant.
    pub fn validate_locator(&self) -> Result<()> {
        let present = [
            self.inline_base64.is_some(),
            self.local_path.is_some(),
            self.object_key.is_some(),
            self.input_url.is_some(),
            self.attach_id.is_some(),
        ]
        .iter()
        .filter(|p| **p)
        .count();
        match present {
            1 => Ok(()),
            0 => Err(KilnError::Validation {
                field: "files".into(),
                message: "No input source provided (inline_base64, local_path, object_key, input_url or attach_id required)"
                    .into(),
            }),
            n => Err(KilnError::Validation {
                field: "files".into(),
                message: format!("Ambiguous input source: {n} locators present, expected exactly one"),
            }),
        }
    }
}

/// A batch of files to convert, with optional per-job storage override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversionJob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub files: Vec<FileSpec>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageOverride>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Failed,
    Ignored,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Success => "success",
            ResultStatus::Failed => "failed",
            ResultStatus::Ignored => "ignored",
        }
    }
}

/// Per-file conversion outcome. The job envelope succeeds as long as the
/// batch ran; failures are recorded here, per file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileResult {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    /// Attach-store id of the original input, when mirrored there.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_fileid: Option<String>,
    /// Attach-store id of the converted output, when mirrored there.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_output_fileid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl FileResult {
    pub fn failed(source: &str, target: Option<&str>, reason: String, filename: Option<String>) -> Self {
        Self {
            source: source.to_string(),
            target: target.map(str::to_string),
            status: ResultStatus::Failed,
            output_path: None,
            object_key: None,
            download_url: None,
            external_fileid: None,
            external_output_fileid: None,
            filename,
            metadata: Value::Null,
            reason: Some(reason),
        }
    }

    pub fn ignored(source: &str, target: Option<&str>, reason: String, filename: Option<String>) -> Self {
        Self {
            status: ResultStatus::Ignored,
            ..Self::failed(source, target, reason, filename)
        }
    }
}

/// Result of a `conversion.handle_batch` task: ordered per-file records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub results: Vec<FileResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_one_locator() {
        let mut spec = FileSpec {
            source_format: "doc".into(),
            ..Default::default()
        };
        assert!(spec.validate_locator().is_err());

        spec.input_url = Some("https://h/in.doc".into());
        assert!(spec.validate_locator().is_ok());

        spec.object_key = Some("in.doc".into());
        assert!(spec.validate_locator().is_err());
    }

    #[test]
    fn test_locator_label_priority() {
        let spec = FileSpec {
            source_format: "doc".into(),
            object_key: Some("k.doc".into()),
            filename: Some("orig.doc".into()),
            ..Default::default()
        };
        assert_eq!(spec.locator_label(), "k.doc");

        let inline = FileSpec {
            source_format: "doc".into(),
            inline_base64: Some("AAAA".into()),
            ..Default::default()
        };
        assert_eq!(inline.locator_label(), "inline.doc");
    }

    #[test]
    fn test_priority_serde() {
        let p: Priority = serde_json::from_str("\"high\"").unwrap();
        assert_eq!(p, Priority::High);
        assert_eq!(serde_json::to_string(&Priority::Normal).unwrap(), "\"normal\"");
    }
}
