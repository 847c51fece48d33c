//! Bitrix24 CRM gateway
//!
//! Provides the abstraction and implementations for the remote CRM used by the
//! Tilda bridge. The CrmGateway trait defines the contract for the entity
//! operations the pipeline performs (deal search/create/update, stage moves,
//! contact find-or-create, file uploads, field introspection).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{Debug, Display};
use thiserror::Error;

/// Remote identifier of a CRM deal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DealId(pub i64);

impl Display for DealId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Remote identifier of a CRM contact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContactId(pub i64);

impl Display for ContactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Remote identifier of an uploaded file on Bitrix Disk
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId(pub String);

impl FileId {
    /// Get the string representation of the file id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entity field payload sent to the CRM, keyed by CRM field code.
///
/// `serde_json::Map` preserves insertion order, which keeps request payloads
/// deterministic for logging and tests.
pub type FieldMap = serde_json::Map<String, Value>;

/// One named group of search values, all filtering the same CRM field code.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchGroup {
    /// CRM field code the values filter on (e.g. `UF_INN`, `TITLE`, `PHONE`)
    pub field_code: String,
    /// Candidate values collected from the submission
    pub values: Vec<String>,
}

impl SearchGroup {
    /// Create a group for a field code with the given values
    pub fn new(field_code: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            field_code: field_code.into(),
            values,
        }
    }

    /// A group with no values never participates in a search
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Filter value for a list request: scalar for one value, array for many
    pub fn filter_value(&self) -> Value {
        if self.values.len() == 1 {
            Value::String(self.values[0].clone())
        } else {
            Value::Array(self.values.iter().cloned().map(Value::String).collect())
        }
    }
}

/// Search terms for locating an existing deal or contact before creating one.
///
/// Groups are consulted in priority order: inn, company, phone, email. The
/// phone and email groups identify contacts; deal searches resolve them to a
/// contact first and then filter deals by `CONTACT_ID`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchQuery {
    pub inn: SearchGroup,
    pub company: SearchGroup,
    pub phone: SearchGroup,
    pub email: SearchGroup,
    /// Optional participation-label constraint: (CRM field code, label)
    pub participation: Option<(String, String)>,
}

impl SearchQuery {
    /// True when no group carries any value
    pub fn is_empty(&self) -> bool {
        self.inn.is_empty() && self.company.is_empty() && self.phone.is_empty() && self.email.is_empty()
    }

    /// Copy of this query constrained to one participation label
    pub fn with_label(&self, field_code: &str, label: &str) -> Self {
        let mut query = self.clone();
        query.participation = Some((field_code.to_string(), label.to_string()));
        query
    }
}

/// A deal located by a search, with enough context to decide on a stage move
#[derive(Debug, Clone, PartialEq)]
pub struct FoundDeal {
    pub id: DealId,
    pub stage_id: String,
}

/// Errors produced by gateway operations.
///
/// Every operation is a single remote call with fail-fast semantics; the
/// caller decides whether a failure aborts the run or is absorbed into a
/// partial result.
#[derive(Error, Debug)]
pub enum CrmError {
    /// Network failure or a 5xx from the CRM
    #[error("CRM unavailable: {0}")]
    Unavailable(String),

    /// 4xx or a Bitrix error envelope (validation, bad field codes, auth)
    #[error("CRM rejected the request: {0}")]
    Rejected(String),

    /// The transport-level timeout elapsed
    #[error("CRM request timed out: {0}")]
    Timeout(String),
}

impl From<reqwest::Error> for CrmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CrmError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            if status.is_client_error() {
                CrmError::Rejected(err.to_string())
            } else {
                CrmError::Unavailable(err.to_string())
            }
        } else {
            CrmError::Unavailable(err.to_string())
        }
    }
}

/// Result type for gateway operations
pub type CrmResult<T> = Result<T, CrmError>;

/// Trait defining the contract for CRM gateway implementations.
///
/// No operation retries internally; blind retries against a search-then-create
/// idempotency model risk duplicate entities.
#[async_trait]
pub trait CrmGateway: Send + Sync + Debug {
    /// Search for an existing deal in a category.
    ///
    /// Groups are tried in priority order (inn, company, phone, email); a
    /// non-empty group that matches nothing falls through to the next group.
    /// Returns the newest match, or `None` when every group misses.
    async fn find_deal(&self, category_id: i64, query: &SearchQuery) -> CrmResult<Option<FoundDeal>>;

    /// Create a deal in the given category and stage
    async fn create_deal(&self, category_id: i64, stage_id: &str, fields: &FieldMap) -> CrmResult<DealId>;

    /// Partially update a deal; unspecified fields are untouched
    async fn update_deal(&self, deal_id: DealId, fields: &FieldMap) -> CrmResult<()>;

    /// Move a deal to a different stage
    async fn move_stage(&self, deal_id: DealId, stage_id: &str) -> CrmResult<()>;

    /// Find a contact by phone/email, creating it when absent
    async fn find_or_create_contact(&self, query: &SearchQuery, fields: &FieldMap) -> CrmResult<ContactId>;

    /// Upload a file into a named folder of the bridge's Disk area
    async fn upload_file(&self, folder_name: &str, filename: &str, content: &[u8]) -> CrmResult<FileId>;

    /// Fetch the deal field schema (inspection endpoints only)
    async fn describe_deal_fields(&self) -> CrmResult<Value>;
}

pub mod http;
pub mod memory;

pub use http::HttpCrmGateway;
pub use memory::InMemoryCrmGateway;
