//! Cached Bitrix deal-field schema
//!
//! A single shared value with lazy load and explicit refresh. Reads of a
//! stale value are always acceptable; refresh is last-writer-wins, so no
//! locking beyond the RwLock is needed.

use bridge_bitrix::CrmGateway;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::ServerResult;

/// Read-through cache of the remote deal-field schema
#[derive(Debug, Clone, Default)]
pub struct DealFieldsCache {
    inner: Arc<RwLock<Option<Value>>>,
}

impl DealFieldsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached schema, fetching it on first use
    pub async fn get(&self, gateway: &dyn CrmGateway) -> ServerResult<Value> {
        if let Some(schema) = self.inner.read().await.clone() {
            return Ok(schema);
        }
        self.refresh(gateway).await
    }

    /// Fetch the schema and replace the cached value
    pub async fn refresh(&self, gateway: &dyn CrmGateway) -> ServerResult<Value> {
        let schema = gateway.describe_deal_fields().await?;
        info!(fields = schema.as_object().map(|o| o.len()).unwrap_or(0), "Refreshed deal field schema");
        *self.inner.write().await = Some(schema.clone());
        Ok(schema)
    }

    /// True when a schema has been loaded
    pub async fn is_warm(&self) -> bool {
        self.inner.read().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_bitrix::InMemoryCrmGateway;

    #[tokio::test]
    async fn first_get_fetches_then_serves_from_cache() {
        let gateway = InMemoryCrmGateway::new();
        let cache = DealFieldsCache::new();
        assert!(!cache.is_warm().await);

        cache.get(&gateway).await.unwrap();
        cache.get(&gateway).await.unwrap();
        assert_eq!(gateway.calls("describe_fields").await, 1);
        assert!(cache.is_warm().await);
    }

    #[tokio::test]
    async fn refresh_always_hits_the_gateway() {
        let gateway = InMemoryCrmGateway::new();
        let cache = DealFieldsCache::new();

        cache.refresh(&gateway).await.unwrap();
        cache.refresh(&gateway).await.unwrap();
        assert_eq!(gateway.calls("describe_fields").await, 2);
    }
}
