//! HTTP implementation of the CrmGateway against a Bitrix24 inbound webhook
//!
//! All requests go to `{base_url}/{method}` where the base URL already carries
//! the webhook token. Responses are checked both for HTTP status and for the
//! Bitrix `{"error": ..., "error_description": ...}` envelope.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    ContactId, CrmError, CrmGateway, CrmResult, DealId, FieldMap, FileId, FoundDeal, SearchGroup,
    SearchQuery,
};

/// Bitrix24 REST implementation of CrmGateway
#[derive(Debug)]
pub struct HttpCrmGateway {
    /// Inbound webhook base URL, e.g. `https://example.bitrix24.ru/rest/1/token`
    base_url: String,

    /// Disk owner whose storage hosts the upload folders
    disk_user_id: i64,

    /// Name of the folder all bridge uploads land under
    disk_root_folder: String,

    /// HTTP client
    client: Client,

    /// Resolved folder ids, keyed by `parent_id:name`
    folder_cache: RwLock<HashMap<String, String>>,

    /// Root object id of the user storage, resolved once
    uploads_parent_id: RwLock<Option<String>>,
}

impl HttpCrmGateway {
    /// Create a new gateway for a webhook base URL
    pub fn new(base_url: String, timeout: Duration, disk_user_id: i64, disk_root_folder: String) -> CrmResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CrmError::Unavailable(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            disk_user_id,
            disk_root_folder,
            client,
            folder_cache: RwLock::new(HashMap::new()),
            uploads_parent_id: RwLock::new(None),
        })
    }

    /// URL for a REST method
    fn method_url(&self, method: &str) -> String {
        format!("{}/{}", self.base_url, method)
    }

    /// Issue one REST call with a JSON payload and unwrap the Bitrix envelope
    async fn call(&self, method: &str, payload: Value) -> CrmResult<Value> {
        let response = self
            .client
            .post(self.method_url(method))
            .json(&payload)
            .send()
            .await
            .map_err(CrmError::from)?;

        Self::unwrap_envelope(method, response).await
    }

    /// Issue one REST call with a multipart form (file uploads)
    async fn call_multipart(&self, method: &str, form: reqwest::multipart::Form) -> CrmResult<Value> {
        let response = self
            .client
            .post(self.method_url(method))
            .multipart(form)
            .send()
            .await
            .map_err(CrmError::from)?;

        Self::unwrap_envelope(method, response).await
    }

    /// Map HTTP status and the Bitrix error envelope onto CrmError
    async fn unwrap_envelope(method: &str, response: reqwest::Response) -> CrmResult<Value> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return if status.is_client_error() {
                Err(CrmError::Rejected(format!("{} returned {}: {}", method, status, body)))
            } else {
                Err(CrmError::Unavailable(format!("{} returned {}: {}", method, status, body)))
            };
        }

        let payload: Value = response.json().await.map_err(CrmError::from)?;
        if payload.get("error").is_some() {
            let detail = payload
                .get("error_description")
                .or_else(|| payload.get("error"))
                .and_then(Value::as_str)
                .unwrap_or("unknown Bitrix error")
                .to_string();
            return Err(CrmError::Rejected(format!("{}: {}", method, detail)));
        }

        Ok(payload)
    }

    /// Run `crm.deal.list` with a filter and return the newest row, if any
    async fn list_first_deal(&self, filter: Map<String, Value>) -> CrmResult<Option<FoundDeal>> {
        let payload = json!({
            "filter": filter,
            "order": { "ID": "DESC" },
            "select": ["ID", "STAGE_ID"],
            "start": -1,
        });
        let data = self.call("crm.deal.list", payload).await?;
        let rows = data.get("result").and_then(Value::as_array);
        let Some(row) = rows.and_then(|r| r.first()) else {
            return Ok(None);
        };

        let id = Self::parse_id(row.get("ID"))
            .ok_or_else(|| CrmError::Rejected("crm.deal.list row without a numeric ID".to_string()))?;
        let stage_id = row
            .get("STAGE_ID")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(Some(FoundDeal {
            id: DealId(id),
            stage_id,
        }))
    }

    /// Find the newest contact matching one multifield value (PHONE or EMAIL)
    async fn first_contact_by(&self, group: &SearchGroup) -> CrmResult<Option<ContactId>> {
        for value in &group.values {
            let mut filter = Map::new();
            filter.insert(group.field_code.clone(), json!(value));
            let payload = json!({
                "filter": filter,
                "order": { "ID": "DESC" },
                "select": ["ID"],
            });
            let data = self.call("crm.contact.list", payload).await?;
            if let Some(row) = data.get("result").and_then(Value::as_array).and_then(|r| r.first()) {
                if let Some(id) = Self::parse_id(row.get("ID")) {
                    return Ok(Some(ContactId(id)));
                }
            }
        }
        Ok(None)
    }

    /// Build the base deal filter for a category, with the optional label constraint
    fn deal_filter(category_id: i64, query: &SearchQuery) -> Map<String, Value> {
        let mut filter = Map::new();
        filter.insert("CATEGORY_ID".to_string(), json!(category_id));
        if let Some((code, label)) = &query.participation {
            filter.insert(code.clone(), Value::String(label.clone()));
        }
        filter
    }

    /// Bitrix returns ids as numbers or numeric strings depending on the method
    fn parse_id(value: Option<&Value>) -> Option<i64> {
        match value {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    /// Extract an integer `result` from an add/update envelope
    fn result_id(data: &Value, method: &str) -> CrmResult<i64> {
        Self::parse_id(data.get("result"))
            .ok_or_else(|| CrmError::Rejected(format!("{} returned no entity id", method)))
    }

    /// Resolve (and cache) the parent folder all uploads go under
    async fn ensure_uploads_parent(&self) -> CrmResult<String> {
        if let Some(id) = self.uploads_parent_id.read().await.clone() {
            return Ok(id);
        }

        let data = self
            .call("disk.storage.getforuser", json!({ "id": self.disk_user_id }))
            .await?;
        let root_id = data
            .get("result")
            .and_then(|r| r.get("rootObjectId"))
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .ok_or_else(|| {
                CrmError::Rejected("Unable to resolve Bitrix Disk storage for the configured user".to_string())
            })?;

        let folder_id = self.ensure_folder(&root_id, &self.disk_root_folder).await?;
        *self.uploads_parent_id.write().await = Some(folder_id.clone());
        Ok(folder_id)
    }

    /// Find or create a child folder, caching the resolved id
    async fn ensure_folder(&self, parent_id: &str, name: &str) -> CrmResult<String> {
        let cache_key = format!("{}:{}", parent_id, name);
        if let Some(id) = self.folder_cache.read().await.get(&cache_key) {
            return Ok(id.clone());
        }

        let children = self
            .call("disk.folder.getchildren", json!({ "id": parent_id }))
            .await?;
        if let Some(entries) = children.get("result").and_then(Value::as_array) {
            for entry in entries {
                let is_folder = entry.get("TYPE").and_then(Value::as_str) == Some("folder");
                let matches = entry.get("NAME").and_then(Value::as_str) == Some(name);
                if is_folder && matches {
                    if let Some(id) = entry.get("ID").map(Self::id_string) {
                        self.folder_cache.write().await.insert(cache_key, id.clone());
                        return Ok(id);
                    }
                }
            }
        }

        let created = self
            .call(
                "disk.folder.add",
                json!({ "data": { "NAME": name, "PARENT_ID": parent_id } }),
            )
            .await?;
        let id = created
            .get("result")
            .and_then(|r| r.get("ID"))
            .map(Self::id_string)
            .ok_or_else(|| CrmError::Rejected("disk.folder.add returned no folder id".to_string()))?;

        debug!(folder = %name, folder_id = %id, "Created Disk folder");
        self.folder_cache.write().await.insert(cache_key, id.clone());
        Ok(id)
    }

    fn id_string(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[async_trait]
impl CrmGateway for HttpCrmGateway {
    async fn find_deal(&self, category_id: i64, query: &SearchQuery) -> CrmResult<Option<FoundDeal>> {
        // Deal-level groups filter directly on deal fields.
        for group in [&query.inn, &query.company] {
            if group.is_empty() {
                continue;
            }
            let mut filter = Self::deal_filter(category_id, query);
            filter.insert(group.field_code.clone(), group.filter_value());
            if let Some(deal) = self.list_first_deal(filter).await? {
                debug!(deal_id = %deal.id, field = %group.field_code, "Deal search hit");
                return Ok(Some(deal));
            }
        }

        // Contact-level groups resolve to a contact first.
        for group in [&query.phone, &query.email] {
            if group.is_empty() {
                continue;
            }
            let Some(contact_id) = self.first_contact_by(group).await? else {
                continue;
            };
            let mut filter = Self::deal_filter(category_id, query);
            filter.insert("CONTACT_ID".to_string(), json!(contact_id.0));
            if let Some(deal) = self.list_first_deal(filter).await? {
                debug!(deal_id = %deal.id, %contact_id, "Deal search hit via contact");
                return Ok(Some(deal));
            }
        }

        Ok(None)
    }

    async fn create_deal(&self, category_id: i64, stage_id: &str, fields: &FieldMap) -> CrmResult<DealId> {
        let mut fields = fields.clone();
        fields.insert("CATEGORY_ID".to_string(), json!(category_id));
        fields.insert("STAGE_ID".to_string(), json!(stage_id));

        let payload = json!({
            "fields": fields,
            "params": { "REGISTER_SONET_EVENT": "N" },
        });
        let data = self.call("crm.deal.add", payload).await?;
        let deal_id = DealId(Self::result_id(&data, "crm.deal.add")?);
        info!(%deal_id, category_id, stage_id, "Created deal");
        Ok(deal_id)
    }

    async fn update_deal(&self, deal_id: DealId, fields: &FieldMap) -> CrmResult<()> {
        let payload = json!({
            "id": deal_id.0,
            "fields": fields,
            "params": { "REGISTER_SONET_EVENT": "N" },
        });
        self.call("crm.deal.update", payload).await?;
        debug!(%deal_id, "Updated deal");
        Ok(())
    }

    async fn move_stage(&self, deal_id: DealId, stage_id: &str) -> CrmResult<()> {
        let payload = json!({
            "id": deal_id.0,
            "fields": { "STAGE_ID": stage_id },
            "params": { "REGISTER_SONET_EVENT": "N" },
        });
        self.call("crm.deal.update", payload).await?;
        info!(%deal_id, stage_id, "Moved deal stage");
        Ok(())
    }

    async fn find_or_create_contact(&self, query: &SearchQuery, fields: &FieldMap) -> CrmResult<ContactId> {
        for group in [&query.phone, &query.email] {
            if group.is_empty() {
                continue;
            }
            if let Some(contact_id) = self.first_contact_by(group).await? {
                debug!(%contact_id, field = %group.field_code, "Contact search hit");
                return Ok(contact_id);
            }
        }

        let payload = json!({
            "fields": fields,
            "params": { "REGISTER_SONET_EVENT": "N" },
        });
        let data = self.call("crm.contact.add", payload).await?;
        let contact_id = ContactId(Self::result_id(&data, "crm.contact.add")?);
        info!(%contact_id, "Created contact");
        Ok(contact_id)
    }

    async fn upload_file(&self, folder_name: &str, filename: &str, content: &[u8]) -> CrmResult<FileId> {
        let parent_id = self.ensure_uploads_parent().await?;
        let folder_id = self.ensure_folder(&parent_id, folder_name).await?;

        let part = reqwest::multipart::Part::bytes(content.to_vec())
            .file_name(filename.to_string())
            .mime_str("application/octet-stream")
            .map_err(|e| CrmError::Rejected(format!("Invalid upload part: {}", e)))?;
        let form = reqwest::multipart::Form::new()
            .text("id", folder_id)
            .text("generateUniqueName", "true")
            .part("file", part);

        let data = self.call_multipart("disk.folder.uploadfile", form).await?;
        let file_id = data
            .get("result")
            .and_then(|r| r.get("ID"))
            .map(Self::id_string)
            .ok_or_else(|| CrmError::Rejected("disk.folder.uploadfile returned no file id".to_string()))?;

        info!(file_id = %file_id, filename, "Uploaded file to Disk");
        Ok(FileId(file_id))
    }

    async fn describe_deal_fields(&self) -> CrmResult<Value> {
        let data = self.call("crm.deal.fields", json!({})).await?;
        data.get("result")
            .cloned()
            .ok_or_else(|| {
                warn!("crm.deal.fields returned no result");
                CrmError::Rejected("crm.deal.fields returned no result".to_string())
            })
    }
}
