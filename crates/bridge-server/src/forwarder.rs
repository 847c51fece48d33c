//! Outbound webhook forwarder
//!
//! Relays Bitrix-originated payloads to a configured external URL. The relay
//! is fire-and-forget: the inbound webhook's own success never depends on the
//! outbound POST, so every failure here is logged and swallowed.

use reqwest::Client;
use serde_json::Value;
use tracing::{debug, error};

/// Forward a payload (or its configured field subset) to the target URL
pub async fn forward(client: &Client, target_url: &str, forward_fields: &[String], payload: &Value) {
    let body = select_fields(payload, forward_fields);

    let result = client
        .post(target_url)
        .json(&body)
        .send()
        .await
        .and_then(|response| response.error_for_status());

    match result {
        Ok(response) => {
            debug!(status = %response.status(), target_url, "Forwarded Bitrix webhook")
        }
        Err(err) => error!(%err, target_url, "Failed to forward Bitrix webhook"),
    }
}

/// Project the payload onto the configured field list; an empty list relays
/// the whole payload.
fn select_fields(payload: &Value, forward_fields: &[String]) -> Value {
    if forward_fields.is_empty() {
        return payload.clone();
    }
    let Value::Object(map) = payload else {
        return payload.clone();
    };

    let mut subset = serde_json::Map::new();
    for field in forward_fields {
        if let Some(value) = map.get(field) {
            subset.insert(field.clone(), value.clone());
        }
    }
    Value::Object(subset)
}
