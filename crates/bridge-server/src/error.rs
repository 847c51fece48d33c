//! Error types for the bridge server
//!
//! This module contains the error types used throughout the server.

use bridge_bitrix::CrmError;
use thiserror::Error;

/// Server error types
#[derive(Error, Debug)]
pub enum ServerError {
    /// Configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Mapping file failed to load or validate (fatal at startup)
    #[error("Mapping error: {0}")]
    MappingError(String),

    /// No form identifier could be determined for an inbound submission
    #[error("Cannot determine form identifier")]
    UnknownForm,

    /// The request body could not be parsed as a form submission
    #[error("Malformed submission: {0}")]
    MalformedSubmission(String),

    /// A CRM gateway call failed
    #[error("CRM error: {0}")]
    Crm(#[from] CrmError),

    /// The form platform (Tilda) API failed or is unconfigured
    #[error("Form platform error: {0}")]
    FormPlatformError(String),

    /// The append-only event log could not be written
    #[error("Event log error: {0}")]
    EventLogError(String),

    /// Internal server error
    #[error("Internal server error: {0}")]
    InternalError(String),
}

/// Result type for server operations
pub type ServerResult<T> = Result<T, ServerError>;

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::MalformedSubmission(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::InternalError(format!("IO error: {}", err))
    }
}

impl From<reqwest::Error> for ServerError {
    fn from(err: reqwest::Error) -> Self {
        ServerError::InternalError(format!("HTTP request error: {}", err))
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(err: anyhow::Error) -> Self {
        ServerError::InternalError(format!("Error: {}", err))
    }
}

impl ServerError {
    /// Errors that reject the request before any pipeline run
    pub fn is_rejection(&self) -> bool {
        matches!(self, ServerError::UnknownForm | ServerError::MalformedSubmission(_))
    }
}
