//! In-memory implementation of CrmGateway
//!
//! This implementation is primarily intended for testing and development
//! purposes. All data is lost when the instance is dropped.

use crate::{
    ContactId, CrmError, CrmGateway, CrmResult, DealId, FieldMap, FileId, FoundDeal, SearchGroup,
    SearchQuery,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct StoredDeal {
    category_id: i64,
    stage_id: String,
    fields: FieldMap,
}

#[derive(Debug, Default)]
struct Inner {
    deals: HashMap<i64, StoredDeal>,
    contacts: HashMap<i64, FieldMap>,
    files: HashMap<String, Vec<u8>>,
    next_deal_id: i64,
    next_contact_id: i64,
    next_file_id: i64,
    calls: HashMap<String, usize>,
    failing: HashSet<String>,
}

/// In-memory implementation of CrmGateway
///
/// Stores deals, contacts and uploaded files in maps, implements the same
/// search semantics as the HTTP gateway over the stored field maps, and counts
/// calls per operation so tests can assert exactly which remote writes a
/// pipeline run performed.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCrmGateway {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryCrmGateway {
    /// Create a new empty in-memory gateway
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a deal directly, bypassing call counting
    pub async fn seed_deal(&self, category_id: i64, stage_id: &str, fields: FieldMap) -> DealId {
        let mut inner = self.inner.write().await;
        inner.next_deal_id += 1;
        let id = inner.next_deal_id;
        inner.deals.insert(
            id,
            StoredDeal {
                category_id,
                stage_id: stage_id.to_string(),
                fields,
            },
        );
        DealId(id)
    }

    /// Make every call to the named operation fail with `Unavailable`
    pub async fn set_failing(&self, operation: &str, failing: bool) {
        let mut inner = self.inner.write().await;
        if failing {
            inner.failing.insert(operation.to_string());
        } else {
            inner.failing.remove(operation);
        }
    }

    /// Number of calls made to the named operation
    pub async fn calls(&self, operation: &str) -> usize {
        self.inner.read().await.calls.get(operation).copied().unwrap_or(0)
    }

    /// Total number of write operations performed
    pub async fn write_calls(&self) -> usize {
        let inner = self.inner.read().await;
        ["create_deal", "update_deal", "move_stage", "create_contact", "upload_file"]
            .iter()
            .map(|op| inner.calls.get(*op).copied().unwrap_or(0))
            .sum()
    }

    /// Current stage of a stored deal
    pub async fn deal_stage(&self, deal_id: DealId) -> Option<String> {
        self.inner.read().await.deals.get(&deal_id.0).map(|d| d.stage_id.clone())
    }

    /// Field map of a stored deal
    pub async fn deal_fields(&self, deal_id: DealId) -> Option<FieldMap> {
        self.inner.read().await.deals.get(&deal_id.0).map(|d| d.fields.clone())
    }

    pub async fn deal_count(&self) -> usize {
        self.inner.read().await.deals.len()
    }

    pub async fn contact_count(&self) -> usize {
        self.inner.read().await.contacts.len()
    }

    pub async fn file_count(&self) -> usize {
        self.inner.read().await.files.len()
    }

    /// Record a call and honor injected failures
    async fn enter(&self, operation: &str) -> CrmResult<()> {
        let mut inner = self.inner.write().await;
        *inner.calls.entry(operation.to_string()).or_insert(0) += 1;
        if inner.failing.contains(operation) {
            return Err(CrmError::Unavailable(format!("injected failure for {}", operation)));
        }
        Ok(())
    }

    /// True when a stored field value matches a wanted search value.
    ///
    /// Values may be flat strings or Bitrix multifield arrays of
    /// `{"VALUE": ...}` objects.
    fn value_matches(stored: &Value, wanted: &str) -> bool {
        match stored {
            Value::String(s) => s == wanted,
            Value::Number(n) => n.to_string() == wanted,
            Value::Array(items) => items.iter().any(|item| {
                item.get("VALUE")
                    .and_then(Value::as_str)
                    .map(|v| v == wanted)
                    .unwrap_or(false)
            }),
            _ => false,
        }
    }

    fn group_matches(fields: &FieldMap, group: &SearchGroup) -> bool {
        fields
            .get(&group.field_code)
            .map(|stored| group.values.iter().any(|wanted| Self::value_matches(stored, wanted)))
            .unwrap_or(false)
    }

    fn label_matches(deal: &StoredDeal, query: &SearchQuery) -> bool {
        match &query.participation {
            None => true,
            Some((code, label)) => deal
                .fields
                .get(code)
                .and_then(Value::as_str)
                .map(|v| v == label)
                .unwrap_or(false),
        }
    }

    /// Newest deal in a category matching the predicate
    fn newest_deal<F>(inner: &Inner, category_id: i64, predicate: F) -> Option<FoundDeal>
    where
        F: Fn(&StoredDeal) -> bool,
    {
        let mut ids: Vec<i64> = inner
            .deals
            .iter()
            .filter(|(_, deal)| deal.category_id == category_id && predicate(deal))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids.first().map(|id| FoundDeal {
            id: DealId(*id),
            stage_id: inner.deals[id].stage_id.clone(),
        })
    }

    /// Newest contact whose multifield matches any value of the group
    fn newest_contact(inner: &Inner, group: &SearchGroup) -> Option<ContactId> {
        let mut ids: Vec<i64> = inner
            .contacts
            .iter()
            .filter(|(_, fields)| Self::group_matches(fields, group))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids.first().map(|id| ContactId(*id))
    }
}

#[async_trait]
impl CrmGateway for InMemoryCrmGateway {
    async fn find_deal(&self, category_id: i64, query: &SearchQuery) -> CrmResult<Option<FoundDeal>> {
        self.enter("find_deal").await?;
        let inner = self.inner.read().await;

        for group in [&query.inn, &query.company] {
            if group.is_empty() {
                continue;
            }
            let hit = Self::newest_deal(&inner, category_id, |deal| {
                Self::label_matches(deal, query) && Self::group_matches(&deal.fields, group)
            });
            if hit.is_some() {
                return Ok(hit);
            }
        }

        for group in [&query.phone, &query.email] {
            if group.is_empty() {
                continue;
            }
            let Some(contact_id) = Self::newest_contact(&inner, group) else {
                continue;
            };
            let hit = Self::newest_deal(&inner, category_id, |deal| {
                Self::label_matches(deal, query)
                    && deal
                        .fields
                        .get("CONTACT_ID")
                        .map(|v| Self::value_matches(v, &contact_id.0.to_string()))
                        .unwrap_or(false)
            });
            if hit.is_some() {
                return Ok(hit);
            }
        }

        Ok(None)
    }

    async fn create_deal(&self, category_id: i64, stage_id: &str, fields: &FieldMap) -> CrmResult<DealId> {
        self.enter("create_deal").await?;
        let mut inner = self.inner.write().await;
        inner.next_deal_id += 1;
        let id = inner.next_deal_id;
        inner.deals.insert(
            id,
            StoredDeal {
                category_id,
                stage_id: stage_id.to_string(),
                fields: fields.clone(),
            },
        );
        Ok(DealId(id))
    }

    async fn update_deal(&self, deal_id: DealId, fields: &FieldMap) -> CrmResult<()> {
        self.enter("update_deal").await?;
        let mut inner = self.inner.write().await;
        let deal = inner
            .deals
            .get_mut(&deal_id.0)
            .ok_or_else(|| CrmError::Rejected(format!("deal {} not found", deal_id)))?;
        for (key, value) in fields {
            deal.fields.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn move_stage(&self, deal_id: DealId, stage_id: &str) -> CrmResult<()> {
        self.enter("move_stage").await?;
        let mut inner = self.inner.write().await;
        let deal = inner
            .deals
            .get_mut(&deal_id.0)
            .ok_or_else(|| CrmError::Rejected(format!("deal {} not found", deal_id)))?;
        deal.stage_id = stage_id.to_string();
        Ok(())
    }

    async fn find_or_create_contact(&self, query: &SearchQuery, fields: &FieldMap) -> CrmResult<ContactId> {
        self.enter("find_contact").await?;
        {
            let inner = self.inner.read().await;
            for group in [&query.phone, &query.email] {
                if group.is_empty() {
                    continue;
                }
                if let Some(contact_id) = Self::newest_contact(&inner, group) {
                    return Ok(contact_id);
                }
            }
        }

        self.enter("create_contact").await?;
        let mut inner = self.inner.write().await;
        inner.next_contact_id += 1;
        let id = inner.next_contact_id;
        inner.contacts.insert(id, fields.clone());
        Ok(ContactId(id))
    }

    async fn upload_file(&self, folder_name: &str, filename: &str, content: &[u8]) -> CrmResult<FileId> {
        self.enter("upload_file").await?;
        let mut inner = self.inner.write().await;
        inner.next_file_id += 1;
        let id = format!("{}/{}-{}", folder_name, inner.next_file_id, filename);
        inner.files.insert(id.clone(), content.to_vec());
        Ok(FileId(id))
    }

    async fn describe_deal_fields(&self) -> CrmResult<Value> {
        self.enter("describe_fields").await?;
        Ok(serde_json::json!({
            "TITLE": { "type": "string" },
            "STAGE_ID": { "type": "crm_status" },
            "CATEGORY_ID": { "type": "crm_category" },
        }))
    }
}
