//!
//! Bridge Server - webhook bridge between Tilda forms and the Bitrix24 CRM
//!
//! This module exports all the components of the bridge server.

use std::sync::Arc;

/// API module
pub mod api;

/// Configuration module
pub mod config;

/// Error module
pub mod error;

/// Event log module
pub mod event_log;

/// Webhook relay module
pub mod forwarder;

/// Form mapping module
pub mod mapping;

/// Deal pipeline module
pub mod pipeline;

/// CRM schema cache module
pub mod schema_cache;

/// Server module
pub mod server;

/// Submission normalization module
pub mod submission;

/// Upload spool module
pub mod tempstore;

/// Tilda API client module
pub mod tilda;

// Re-export key types
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use mapping::{MappingEntry, MappingRegistry};
pub use pipeline::{Pipeline, PipelineOutcome, PipelineReport};
pub use server::BridgeServer;

use bridge_bitrix::{CrmGateway, HttpCrmGateway, InMemoryCrmGateway};

/// Run function
pub async fn run(config: ServerConfig) -> ServerResult<()> {
    // Initialize logging
    init_logging(&config);

    // Create dependencies
    let gateway = create_crm_gateway(&config)?;
    let registry = MappingRegistry::load(&config.mapping_file, &config)?;
    let tilda = tilda::TildaClient::new(&config)?;
    let event_log = event_log::EventLog::new(config.event_log_file.clone());
    let temp_store = tempstore::TempFileStore::new(config.upload_tmp_dir.clone()).await?;

    // Create and run server
    let server = BridgeServer::new(config, gateway, registry, tilda, event_log, temp_store)?;
    server.run().await
}

/// Initialize logging
fn init_logging(config: &ServerConfig) {
    use tracing_subscriber::{fmt, EnvFilter};

    // Create filter based on config
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    // Initialize subscriber
    fmt().with_env_filter(filter).with_target(true).init();
}

/// Create the CRM gateway client
pub fn create_crm_gateway(config: &ServerConfig) -> ServerResult<Arc<dyn CrmGateway>> {
    if config.bitrix_webhook_base_url.starts_with("memory://") {
        // In-memory gateway for development and testing
        tracing::info!("Using in-memory CRM gateway");
        return Ok(Arc::new(InMemoryCrmGateway::new()));
    }

    let gateway = HttpCrmGateway::new(
        config.bitrix_webhook_base_url.clone(),
        config.request_timeout(),
        config.disk_user_id,
        config.disk_root_folder.clone(),
    )?;
    Ok(Arc::new(gateway))
}
