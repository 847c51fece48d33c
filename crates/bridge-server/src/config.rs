//! Configuration for the bridge server
//!
//! This module contains the configuration types and loading functionality.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use tracing::warn;

use crate::error::{ServerError, ServerResult};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub bind_address: String,

    /// Bitrix24 inbound-webhook base URL (carries the auth token)
    pub bitrix_webhook_base_url: String,

    /// Target URL for relaying Bitrix-originated webhooks
    #[serde(default)]
    pub outbound_webhook_url: Option<String>,

    /// Payload fields to relay; empty means the whole payload
    #[serde(default)]
    pub forward_fields: Vec<String>,

    /// Tilda API base URL
    #[serde(default = "default_tilda_api_base_url")]
    pub tilda_api_base_url: String,

    /// Tilda API public key
    #[serde(default)]
    pub tilda_public_key: Option<String>,

    /// Tilda API secret key
    #[serde(default)]
    pub tilda_secret_key: Option<String>,

    /// Default Tilda project for form listings
    #[serde(default)]
    pub tilda_project_id: Option<i64>,

    /// Path to the per-form mapping file
    #[serde(default = "default_mapping_file")]
    pub mapping_file: PathBuf,

    /// Path to the append-only event log
    #[serde(default = "default_event_log_file")]
    pub event_log_file: PathBuf,

    /// Directory for spooled upload files
    #[serde(default = "default_upload_tmp_dir")]
    pub upload_tmp_dir: PathBuf,

    /// Timeout for every outbound HTTP call, in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Pipeline category holding base deals
    #[serde(default = "default_category_base_id")]
    pub category_base_id: i64,

    /// Pipeline category holding per-label application deals
    #[serde(default = "default_category_applications_id")]
    pub category_applications_id: i64,

    /// Pipeline category for secondary-kind forms
    #[serde(default = "default_category_secondary_id")]
    pub category_secondary_id: i64,

    /// Stage a found base deal is moved to
    #[serde(default = "default_stage_base_won")]
    pub stage_base_won: String,

    /// Stage for newly created application deals
    #[serde(default = "default_stage_applications_new")]
    pub stage_applications_new: String,

    /// Stage for newly created secondary deals
    #[serde(default = "default_stage_secondary_new")]
    pub stage_secondary_new: String,

    /// Deal field code holding the company tax number
    #[serde(default = "default_inn_field")]
    pub inn_field: String,

    /// Deal field code holding the company name
    #[serde(default = "default_title_field")]
    pub title_field: String,

    /// Deal field code scoping a deal to one participation label
    #[serde(default = "default_participation_field_code")]
    pub participation_field_code: String,

    /// Bitrix user owning the Disk storage for uploads
    #[serde(default = "default_disk_user_id")]
    pub disk_user_id: i64,

    /// Disk folder all uploads land under
    #[serde(default = "default_disk_root_folder")]
    pub disk_root_folder: String,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_tilda_api_base_url() -> String {
    "https://api.tilda.cc/".to_string()
}

fn default_mapping_file() -> PathBuf {
    PathBuf::from("mapping.json")
}

fn default_event_log_file() -> PathBuf {
    PathBuf::from("data/events.log")
}

fn default_upload_tmp_dir() -> PathBuf {
    PathBuf::from("data/tmp_uploads")
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_category_base_id() -> i64 {
    6
}

fn default_category_applications_id() -> i64 {
    8
}

fn default_category_secondary_id() -> i64 {
    12
}

fn default_stage_base_won() -> String {
    "C6:WON".to_string()
}

fn default_stage_applications_new() -> String {
    "C8:NEW".to_string()
}

fn default_stage_secondary_new() -> String {
    "C12:NEW".to_string()
}

fn default_inn_field() -> String {
    "UF_INN".to_string()
}

fn default_title_field() -> String {
    "TITLE".to_string()
}

fn default_participation_field_code() -> String {
    "UF_CRM_PARTICIPATION".to_string()
}

fn default_disk_user_id() -> i64 {
    1
}

fn default_disk_root_folder() -> String {
    "TildaUploads".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn load() -> ServerResult<Self> {
        let mut config = Self::default();

        if let Ok(port) = env::var("BRIDGE_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.port = port;
            } else {
                warn!("Invalid BRIDGE_PORT value: {}", port);
            }
        }

        if let Ok(host) = env::var("BRIDGE_BIND_ADDRESS") {
            config.bind_address = host;
        }

        if let Ok(base_url) = env::var("BRIDGE_BITRIX_WEBHOOK_BASE_URL") {
            config.bitrix_webhook_base_url = base_url;
        }

        if let Ok(url) = env::var("BRIDGE_OUTBOUND_WEBHOOK_URL") {
            config.outbound_webhook_url = Some(url);
        }

        if let Ok(fields) = env::var("BRIDGE_FORWARD_FIELDS") {
            config.forward_fields = fields
                .split(',')
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect();
        }

        if let Ok(url) = env::var("BRIDGE_TILDA_API_BASE_URL") {
            config.tilda_api_base_url = url;
        }

        if let Ok(key) = env::var("BRIDGE_TILDA_PUBLIC_KEY") {
            config.tilda_public_key = Some(key);
        }

        if let Ok(key) = env::var("BRIDGE_TILDA_SECRET_KEY") {
            config.tilda_secret_key = Some(key);
        }

        if let Ok(project) = env::var("BRIDGE_TILDA_PROJECT_ID") {
            if let Ok(project) = project.parse::<i64>() {
                config.tilda_project_id = Some(project);
            } else {
                warn!("Invalid BRIDGE_TILDA_PROJECT_ID value: {}", project);
            }
        }

        if let Ok(path) = env::var("BRIDGE_MAPPING_FILE") {
            config.mapping_file = PathBuf::from(path);
        }

        if let Ok(path) = env::var("BRIDGE_EVENT_LOG_FILE") {
            config.event_log_file = PathBuf::from(path);
        }

        if let Ok(path) = env::var("BRIDGE_UPLOAD_TMP_DIR") {
            config.upload_tmp_dir = PathBuf::from(path);
        }

        if let Ok(timeout) = env::var("BRIDGE_REQUEST_TIMEOUT_SECS") {
            if let Ok(timeout) = timeout.parse::<u64>() {
                config.request_timeout_secs = timeout;
            } else {
                warn!("Invalid BRIDGE_REQUEST_TIMEOUT_SECS value: {}", timeout);
            }
        }

        Self::load_i64(&mut config.category_base_id, "BRIDGE_CATEGORY_BASE_ID");
        Self::load_i64(&mut config.category_applications_id, "BRIDGE_CATEGORY_APPLICATIONS_ID");
        Self::load_i64(&mut config.category_secondary_id, "BRIDGE_CATEGORY_SECONDARY_ID");
        Self::load_string(&mut config.stage_base_won, "BRIDGE_STAGE_BASE_WON");
        Self::load_string(&mut config.stage_applications_new, "BRIDGE_STAGE_APPLICATIONS_NEW");
        Self::load_string(&mut config.stage_secondary_new, "BRIDGE_STAGE_SECONDARY_NEW");
        Self::load_string(&mut config.inn_field, "BRIDGE_BITRIX_INN_FIELD");
        Self::load_string(&mut config.title_field, "BRIDGE_BITRIX_TITLE_FIELD");
        Self::load_string(&mut config.participation_field_code, "BRIDGE_BITRIX_PARTICIPATION_FIELD");
        Self::load_i64(&mut config.disk_user_id, "BRIDGE_BITRIX_DISK_USER_ID");
        Self::load_string(&mut config.disk_root_folder, "BRIDGE_BITRIX_DISK_ROOT_FOLDER");
        Self::load_string(&mut config.log_level, "BRIDGE_LOG_LEVEL");

        // Validate required fields
        if config.bitrix_webhook_base_url.is_empty() {
            return Err(ServerError::ConfigError(
                "Bitrix webhook base URL is required".to_string(),
            ));
        }

        if config.tilda_public_key.is_none() || config.tilda_secret_key.is_none() {
            warn!("No Tilda API keys provided - form metadata endpoints will be unavailable");
        }

        if config.outbound_webhook_url.is_none() {
            warn!("No BRIDGE_OUTBOUND_WEBHOOK_URL provided - Bitrix webhooks will only be logged");
        }

        Ok(config)
    }

    fn load_string(target: &mut String, var: &str) {
        if let Ok(value) = env::var(var) {
            *target = value;
        }
    }

    fn load_i64(target: &mut i64, var: &str) {
        if let Ok(value) = env::var(var) {
            if let Ok(value) = value.parse::<i64>() {
                *target = value;
            } else {
                warn!("Invalid {} value: {}", var, value);
            }
        }
    }

    /// Timeout for outbound HTTP calls
    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_host(),
            bitrix_webhook_base_url: String::new(),
            outbound_webhook_url: None,
            forward_fields: Vec::new(),
            tilda_api_base_url: default_tilda_api_base_url(),
            tilda_public_key: None,
            tilda_secret_key: None,
            tilda_project_id: None,
            mapping_file: default_mapping_file(),
            event_log_file: default_event_log_file(),
            upload_tmp_dir: default_upload_tmp_dir(),
            request_timeout_secs: default_request_timeout_secs(),
            category_base_id: default_category_base_id(),
            category_applications_id: default_category_applications_id(),
            category_secondary_id: default_category_secondary_id(),
            stage_base_won: default_stage_base_won(),
            stage_applications_new: default_stage_applications_new(),
            stage_secondary_new: default_stage_secondary_new(),
            inn_field: default_inn_field(),
            title_field: default_title_field(),
            participation_field_code: default_participation_field_code(),
            disk_user_id: default_disk_user_id(),
            disk_root_folder: default_disk_root_folder(),
            log_level: default_log_level(),
        }
    }
}
