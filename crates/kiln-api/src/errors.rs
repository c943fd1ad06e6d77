//! Central error-code registry for client-facing responses.
//!
//! Every client error renders as
//! `{status:"failure", error_code, error_status, message, zh_message}` with
//! a bilingual message pair.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// One registered error code.
#[derive(Debug, Clone, Copy)]
pub struct ErrorCodeSpec {
    pub code: &'static str,
    pub zh: &'static str,
    pub en: &'static str,
    pub status: u32,
    pub http_status: StatusCode,
}

/// The full registry, indexed by code.
pub const ERROR_CODES: [ErrorCodeSpec; 6] = [
    ErrorCodeSpec {
        code: "ERR_AUTH_MISSING",
        zh: "认证信息缺失",
        en: "Missing authentication information",
        status: 4010,
        http_status: StatusCode::UNAUTHORIZED,
    },
    ErrorCodeSpec {
        code: "ERR_AUTH_INVALID",
        zh: "认证失败，appid或key错误",
        en: "Authentication failed: invalid appid or key",
        status: 4011,
        http_status: StatusCode::UNAUTHORIZED,
    },
    ErrorCodeSpec {
        code: "ERR_FILE_TOO_LARGE",
        zh: "单个文件大小超出限制",
        en: "File exceeds per-format size limit",
        status: 4201,
        http_status: StatusCode::BAD_REQUEST,
    },
    ErrorCodeSpec {
        code: "ERR_BATCH_LIMIT_EXCEEDED",
        zh: "批量任务超出数量或体积限制",
        en: "Batch exceeds allowed number or total size",
        status: 4202,
        http_status: StatusCode::BAD_REQUEST,
    },
    ErrorCodeSpec {
        code: "ERR_FORMAT_UNSUPPORTED",
        zh: "文件格式暂不支持",
        en: "Unsupported source format",
        status: 4203,
        http_status: StatusCode::BAD_REQUEST,
    },
    ErrorCodeSpec {
        code: "ERR_TASK_FAILED",
        zh: "任务执行失败",
        en: "Conversion task failed",
        status: 5001,
        http_status: StatusCode::INTERNAL_SERVER_ERROR,
    },
];

pub fn spec_for(code: &str) -> Option<&'static ErrorCodeSpec> {
    ERROR_CODES.iter().find(|spec| spec.code == code)
}

/// A client-facing API error: a registered code plus an optional English
/// detail overriding the default message.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub code: &'static str,
    pub detail: Option<String>,
}

impl ApiError {
    pub fn new(code: &'static str) -> Self {
        Self { code, detail: None }
    }

    pub fn with_detail(code: &'static str, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: Some(detail.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let spec = spec_for(self.code).unwrap_or(&ERROR_CODES[5]);
        let body = json!({
            "status": "failure",
            "error_code": spec.code,
            "error_status": spec.status,
            "message": self.detail.as_deref().unwrap_or(spec.en),
            "zh_message": spec.zh,
        });
        (spec.http_status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_codes_are_unique() {
        for (i, a) in ERROR_CODES.iter().enumerate() {
            for b in ERROR_CODES.iter().skip(i + 1) {
                assert_ne!(a.code, b.code);
                assert_ne!(a.status, b.status);
            }
        }
    }

    #[test]
    fn test_spec_lookup() {
        let spec = spec_for("ERR_BATCH_LIMIT_EXCEEDED").unwrap();
        assert_eq!(spec.status, 4202);
        assert_eq!(spec.http_status, StatusCode::BAD_REQUEST);
        assert!(spec_for("ERR_NOPE").is_none());
    }

    #[test]
    fn test_auth_codes_are_401() {
        assert_eq!(
            spec_for("ERR_AUTH_MISSING").unwrap().http_status,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            spec_for("ERR_AUTH_INVALID").unwrap().http_status,
            StatusCode::UNAUTHORIZED
        );
    }
}
