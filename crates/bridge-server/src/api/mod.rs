//! API module for the bridge server
//!
//! This module contains the API routes and handlers.

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;

pub mod errors;
pub mod health;

use crate::server::BridgeServer;
use errors::ApiError;

/// Build the router for API endpoints
pub fn build_router(server: Arc<BridgeServer>) -> Router {
    Router::new()
        // Inbound form submissions
        .route("/webhook/tilda", post(handle_tilda_webhook))
        .route("/webhook/tilda/:form_key", post(handle_keyed_tilda_webhook))
        // CRM-originated events
        .route("/webhook/b24", post(handle_crm_webhook))
        // Mapping maintenance
        .route("/bitrix/fields", get(handle_deal_fields))
        .route("/tilda/forms", get(handle_list_tilda_forms))
        .route("/tilda/forms/:form_id", get(handle_get_tilda_form))
        // Health check
        .route("/health", get(health::health_check))
        // Shared state
        .with_state(server)
}

/// Handler for submissions carrying their form identifier in the payload
async fn handle_tilda_webhook(
    State(server): State<Arc<BridgeServer>>,
    request: Request,
) -> Result<impl IntoResponse, ApiError> {
    let reply = server.process_submission(request, None).await?;
    Ok((reply.status_code(), Json(reply.to_body())))
}

/// Handler for submissions addressed to a specific form by path
async fn handle_keyed_tilda_webhook(
    State(server): State<Arc<BridgeServer>>,
    Path(form_key): Path<String>,
    request: Request,
) -> Result<impl IntoResponse, ApiError> {
    let reply = server.process_submission(request, Some(form_key)).await?;
    Ok((reply.status_code(), Json(reply.to_body())))
}

/// Handler for webhooks sent by the CRM itself
async fn handle_crm_webhook(
    State(server): State<Arc<BridgeServer>>,
    request: Request,
) -> Result<impl IntoResponse, ApiError> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let body = axum::body::to_bytes(request.into_body(), 1024 * 1024)
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let reply = server.process_crm_webhook(&content_type, &body).await;
    Ok((StatusCode::OK, Json(reply)))
}

#[derive(Debug, Deserialize)]
struct DealFieldsParams {
    #[serde(default)]
    refresh: bool,
}

/// Handler exposing the CRM deal-field schema for mapping maintenance
async fn handle_deal_fields(
    State(server): State<Arc<BridgeServer>>,
    Query(params): Query<DealFieldsParams>,
) -> Result<impl IntoResponse, ApiError> {
    let fields = server.deal_fields(params.refresh).await?;
    Ok((StatusCode::OK, Json(fields)))
}

#[derive(Debug, Deserialize)]
struct ListFormsParams {
    project_id: Option<i64>,
}

/// Handler listing the forms of a Tilda project
async fn handle_list_tilda_forms(
    State(server): State<Arc<BridgeServer>>,
    Query(params): Query<ListFormsParams>,
) -> Result<impl IntoResponse, ApiError> {
    let forms = server.list_tilda_forms(params.project_id).await?;
    Ok((StatusCode::OK, Json(forms)))
}

/// Handler fetching one Tilda form's field descriptions
async fn handle_get_tilda_form(
    State(server): State<Arc<BridgeServer>>,
    Path(form_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let form = server.get_tilda_form(form_id).await?;
    Ok((StatusCode::OK, Json(form)))
}
