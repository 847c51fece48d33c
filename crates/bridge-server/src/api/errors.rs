//! Error handling for the bridge server API
//!
//! This module contains standardized error handling for the API.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use bridge_bitrix::CrmError;

use crate::error::ServerError;

/// API error type for returning standard error responses
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error_code: &'static str,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error_code: "ERR_BAD_REQUEST",
            message: message.into(),
        }
    }
}

impl From<ServerError> for ApiError {
    fn from(err: ServerError) -> Self {
        let (status, error_code) = match &err {
            ServerError::UnknownForm => (StatusCode::BAD_REQUEST, "ERR_UNKNOWN_FORM"),
            ServerError::MalformedSubmission(_) => {
                (StatusCode::BAD_REQUEST, "ERR_MALFORMED_SUBMISSION")
            }
            ServerError::Crm(CrmError::Timeout(_)) => {
                (StatusCode::GATEWAY_TIMEOUT, "ERR_CRM_TIMEOUT")
            }
            ServerError::Crm(CrmError::Rejected(_)) => (StatusCode::BAD_GATEWAY, "ERR_CRM_REJECTED"),
            ServerError::Crm(CrmError::Unavailable(_)) => {
                (StatusCode::BAD_GATEWAY, "ERR_CRM_UNAVAILABLE")
            }
            ServerError::FormPlatformError(_) => (StatusCode::BAD_GATEWAY, "ERR_FORM_PLATFORM"),
            ServerError::ConfigError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ERR_CONFIG_ERROR"),
            ServerError::MappingError(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "ERR_MAPPING_ERROR")
            }
            ServerError::EventLogError(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "ERR_EVENT_LOG_ERROR")
            }
            ServerError::InternalError(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "ERR_INTERNAL_SERVER_ERROR")
            }
        };

        Self {
            status,
            error_code,
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_code, self.message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(json!({
            "error": self.message,
            "errorDetails": {
                "errorCode": self.error_code,
                "errorMessage": self.message,
            }
        }));

        (self.status, body).into_response()
    }
}
