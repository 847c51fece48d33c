//! Health check endpoint for the bridge server
//!
//! This module contains the health check handler.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::server::BridgeServer;

/// Health check handler
///
/// Reports the state of the local subsystems. No remote call is made here;
/// the CRM is only reached on real submissions.
pub async fn health_check(State(server): State<Arc<BridgeServer>>) -> impl IntoResponse {
    debug!("Health check requested");

    let response = json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION"),
        "dependencies": {
            "mapping": {
                "status": if server.registry().is_empty() { "DEGRADED" } else { "UP" },
                "forms": server.registry().len(),
            },
            "dealFieldsCache": {
                "status": if server.schema_cache_warm().await { "WARM" } else { "COLD" },
            },
        },
    });

    (StatusCode::OK, Json(response))
}
