//! Deal pipeline orchestration
//!
//! A submission resolved to a mapping entry runs through one of two
//! strategies. The primary pipeline fans a submission out into one deal per
//! selected participation label, attaches uploaded files, and links a contact
//! to every deal it touched. The secondary pipeline creates a single deal in
//! its own category and stops there. Both record every remote write in the
//! event log and tolerate partial failure: one broken step never rolls back
//! or aborts the steps around it.

mod primary;
mod secondary;

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

use bridge_bitrix::{ContactId, CrmGateway, DealId, FieldMap, FileId, SearchGroup, SearchQuery};

use crate::config::ServerConfig;
use crate::event_log::EventLog;
use crate::mapping::{MappingEntry, MappingKind};
use crate::submission::NormalizedSubmission;

/// Aggregate outcome of one pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineOutcome {
    /// Every deal step succeeded
    Success,
    /// Some deal steps succeeded, some failed
    PartialFailure,
    /// No deal was created or updated
    Failed,
}

/// One deal the run created or updated
#[derive(Debug, Clone, Serialize)]
pub struct DealCreationResult {
    pub deal_id: DealId,
    pub category_id: i64,
    /// False when an existing deal was updated instead
    pub created: bool,
    /// Participation label -> remote file identifier, for attached uploads
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub uploaded_files: BTreeMap<String, FileId>,
}

/// Per-label result of the primary pipeline's fan-out
#[derive(Debug, Serialize)]
pub struct LabelOutcome {
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deal: Option<DealCreationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub file_errors: Vec<String>,
}

impl LabelOutcome {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            deal: None,
            error: None,
            file_errors: Vec::new(),
        }
    }
}

/// Full report of one pipeline run, returned to the caller and logged
#[derive(Debug, Serialize)]
pub struct PipelineReport {
    pub form_id: String,
    pub kind: &'static str,
    pub outcome: PipelineOutcome,
    /// The single deal of a secondary run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deal: Option<DealCreationResult>,
    /// One entry per selected participation label, in declaration order
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<LabelOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_deal_id: Option<DealId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<ContactId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_error: Option<String>,
    /// Terminal failure reason when nothing was written
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineReport {
    fn new(form_id: &str, kind: &'static str) -> Self {
        Self {
            form_id: form_id.to_string(),
            kind,
            outcome: PipelineOutcome::Failed,
            deal: None,
            labels: Vec::new(),
            base_deal_id: None,
            contact_id: None,
            contact_error: None,
            error: None,
        }
    }

    /// Count of deals this run created or updated
    pub fn deals_written(&self) -> usize {
        self.deal.iter().count() + self.labels.iter().filter(|l| l.deal.is_some()).count()
    }
}

/// Pipeline runner borrowing the server's shared services
pub struct Pipeline<'a> {
    pub gateway: &'a dyn CrmGateway,
    pub config: &'a ServerConfig,
    pub event_log: &'a EventLog,
}

impl<'a> Pipeline<'a> {
    pub fn new(gateway: &'a dyn CrmGateway, config: &'a ServerConfig, event_log: &'a EventLog) -> Self {
        Self {
            gateway,
            config,
            event_log,
        }
    }

    /// Run the strategy the mapping entry selects
    pub async fn run(
        &self,
        entry: &MappingEntry,
        submission: &mut NormalizedSubmission,
    ) -> PipelineReport {
        match entry.kind {
            MappingKind::Primary => primary::run(self, entry, submission).await,
            MappingKind::Secondary => secondary::run(self, entry, submission).await,
        }
    }
}

/// Deal field payload built from the mapping, skipping empty form values
pub(crate) fn build_deal_fields(entry: &MappingEntry, submission: &NormalizedSubmission) -> FieldMap {
    let mut fields = FieldMap::new();
    for (form_field, code) in &entry.deal_fields {
        if let Some(value) = submission.value(form_field) {
            fields.insert(code.clone(), Value::String(value.to_string()));
        }
    }
    fields
}

/// Contact field payload; PHONE and EMAIL become Bitrix multifield arrays
pub(crate) fn build_contact_fields(
    entry: &MappingEntry,
    submission: &NormalizedSubmission,
) -> FieldMap {
    let mut fields = FieldMap::new();
    for (form_field, code) in &entry.contact_fields {
        let Some(value) = submission.value(form_field) else {
            continue;
        };
        if code == "PHONE" || code == "EMAIL" {
            fields.insert(code.clone(), multifield(value));
        } else {
            fields.insert(code.clone(), Value::String(value.to_string()));
        }
    }
    fields
}

/// One-element Bitrix multifield value
fn multifield(value: &str) -> Value {
    Value::Array(vec![serde_json::json!({
        "VALUE": value,
        "VALUE_TYPE": "WORK",
    })])
}

/// Collect the search query from the submission's identifying fields
pub(crate) fn build_search_query(
    entry: &MappingEntry,
    submission: &NormalizedSubmission,
    config: &ServerConfig,
) -> SearchQuery {
    let collect = |keys: &[String]| -> Vec<String> {
        keys.iter()
            .filter_map(|field| submission.value(field))
            .map(str::to_string)
            .collect()
    };

    SearchQuery {
        inn: SearchGroup::new(config.inn_field.clone(), collect(&entry.search.inn)),
        company: SearchGroup::new(config.title_field.clone(), collect(&entry.search.company)),
        phone: SearchGroup::new("PHONE", collect(&entry.search.phone)),
        email: SearchGroup::new("EMAIL", collect(&entry.search.email)),
        participation: None,
    }
}

/// Parse the participation-label selection from the submission.
///
/// The field value is split on `,` and `;`, trimmed, and deduplicated.
/// Labels with no configured file field are dropped with a warning. An empty
/// selection falls back to the single configured label when the mapping
/// defines exactly one.
pub(crate) fn parse_participation(
    entry: &MappingEntry,
    submission: &NormalizedSubmission,
) -> Vec<String> {
    let raw = submission.value(&entry.participation_field).unwrap_or("");

    let mut selected: Vec<String> = Vec::new();
    for label in raw.split([',', ';']) {
        let label = label.trim();
        if label.is_empty() || selected.iter().any(|s| s == label) {
            continue;
        }
        if entry.file_field_code(label).is_some() {
            selected.push(label.to_string());
        } else {
            warn!(form = %entry.name, %label, "Ignoring unknown participation label");
        }
    }

    if selected.is_empty() && entry.file_fields.len() == 1 {
        selected.push(entry.file_fields[0].0.clone());
    }

    // Stable order: the mapping's declaration order, not the payload's.
    entry
        .file_fields
        .iter()
        .map(|(label, _)| label)
        .filter(|label| selected.iter().any(|s| &s == label))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests;
