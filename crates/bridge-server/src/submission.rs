//! Form submission normalization
//!
//! Converts a raw inbound request into a NormalizedSubmission: a flat map of
//! field values plus the spooled file parts. Values are taken as-is (no type
//! coercion); duplicate field names keep the last value, matching form
//! encoding semantics. File parts and urlencoded bodies share the same
//! buffering cap.

use axum::extract::{FromRequest, Multipart, Request};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use crate::error::{ServerError, ServerResult};
use crate::tempstore::{SpooledFile, TempFileStore};

/// Payload keys Tilda may carry the form identifier under, in lookup order
pub const FORM_IDENTIFIER_KEYS: [&str; 7] = [
    "formname",
    "formid",
    "tildaformid",
    "tilda_form_id",
    "form_uid",
    "form_id",
    "lable",
];

/// Upper bound on a buffered request body
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// One uploaded file part, spooled to the temp store
#[derive(Debug)]
pub struct SubmissionFile {
    /// Form field the file arrived under
    pub field_name: String,
    /// Original client-side filename
    pub filename: String,
    pub spooled: SpooledFile,
}

/// A parsed submission, one per inbound webhook call
#[derive(Debug)]
pub struct NormalizedSubmission {
    pub form_id: String,
    pub fields: HashMap<String, String>,
    /// File parts in arrival order
    pub files: Vec<SubmissionFile>,
}

impl NormalizedSubmission {
    /// Trimmed, non-empty value of a form field
    pub fn value(&self, field: &str) -> Option<&str> {
        self.fields
            .get(field)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// The raw payload as a JSON object, for event logging
    pub fn payload_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (key, value) in &self.fields {
            map.insert(key.clone(), Value::String(value.clone()));
        }
        for file in &self.files {
            map.insert(
                file.field_name.clone(),
                Value::String(format!("<file: {}>", file.filename)),
            );
        }
        Value::Object(map)
    }
}

/// Parse an inbound request into a normalized submission.
///
/// `route_form_id` wins over any identifier in the payload. Fails with
/// `MalformedSubmission` when the body cannot be parsed as form data, and
/// with `UnknownForm` when no identifier can be determined at all.
pub async fn normalize(
    request: Request,
    route_form_id: Option<String>,
    temp_store: &TempFileStore,
) -> ServerResult<NormalizedSubmission> {
    let content_type = request
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let mut fields: HashMap<String, String> = HashMap::new();
    let mut files: Vec<SubmissionFile> = Vec::new();

    if content_type.starts_with("multipart/form-data") {
        let mut multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| ServerError::MalformedSubmission(e.to_string()))?;

        while let Some(mut field) = multipart
            .next_field()
            .await
            .map_err(|e| ServerError::MalformedSubmission(e.to_string()))?
        {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            if let Some(filename) = field.file_name().map(str::to_string) {
                let mut bytes: Vec<u8> = Vec::new();
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| ServerError::MalformedSubmission(e.to_string()))?
                {
                    if bytes.len() + chunk.len() > MAX_BODY_BYTES {
                        return Err(ServerError::MalformedSubmission(format!(
                            "File part '{}' exceeds the {} byte limit",
                            filename, MAX_BODY_BYTES
                        )));
                    }
                    bytes.extend_from_slice(&chunk);
                }
                if bytes.is_empty() {
                    continue;
                }
                let spooled = temp_store.spool(&bytes).await?;
                files.push(SubmissionFile {
                    field_name: name,
                    filename,
                    spooled,
                });
            } else {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ServerError::MalformedSubmission(e.to_string()))?;
                fields.insert(name, text);
            }
        }
    } else if content_type.is_empty() || content_type.starts_with("application/x-www-form-urlencoded") {
        let bytes = axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES)
            .await
            .map_err(|e| ServerError::MalformedSubmission(e.to_string()))?;
        for (key, value) in form_urlencoded::parse(&bytes) {
            fields.insert(key.into_owned(), value.into_owned());
        }
    } else {
        return Err(ServerError::MalformedSubmission(format!(
            "Unsupported content type: {}",
            content_type
        )));
    }

    let form_id = match route_form_id.filter(|id| !id.trim().is_empty()) {
        Some(id) => id,
        None => detect_form_id(&fields).ok_or(ServerError::UnknownForm)?,
    };

    debug!(%form_id, fields = fields.len(), files = files.len(), "Normalized submission");
    Ok(NormalizedSubmission {
        form_id,
        fields,
        files,
    })
}

/// Find the form identifier in the payload, if any
fn detect_form_id(fields: &HashMap<String, String>) -> Option<String> {
    FORM_IDENTIFIER_KEYS
        .iter()
        .find_map(|key| fields.get(*key))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a loosely typed webhook body: JSON object first, urlencoded fallback
pub fn parse_loose_payload(content_type: &str, bytes: &[u8]) -> Value {
    let first_byte = bytes.iter().copied().find(|b| !b.is_ascii_whitespace());
    if content_type.starts_with("application/json") || first_byte == Some(b'{') {
        if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
            return value;
        }
    }
    let mut map = serde_json::Map::new();
    for (key, value) in form_urlencoded::parse(bytes) {
        map.insert(key.into_owned(), Value::String(value.into_owned()));
    }
    Value::Object(map)
}
