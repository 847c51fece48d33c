//! Secondary pipeline: one deal, no fan-out
//!
//! Forms of this kind collect follow-up requests rather than applications.
//! Name and reachability go straight onto the deal, so no contact entity is
//! created and no file handling runs.

use serde_json::Value;
use tracing::{error, info};

use super::{build_deal_fields, DealCreationResult, Pipeline, PipelineOutcome, PipelineReport};
use crate::event_log::EventRecord;
use crate::mapping::MappingEntry;
use crate::submission::NormalizedSubmission;

pub(super) async fn run(
    p: &Pipeline<'_>,
    entry: &MappingEntry,
    submission: &mut NormalizedSubmission,
) -> PipelineReport {
    let mut report = PipelineReport::new(&entry.name, "secondary");

    let mut fields = build_deal_fields(entry, submission);
    // Contact-mapped fields land on the deal itself as plain strings; no
    // contact entity exists to carry multifield values.
    for (form_field, code) in &entry.contact_fields {
        if fields.contains_key(code) {
            continue;
        }
        if let Some(value) = submission.value(form_field) {
            fields.insert(code.clone(), Value::String(value.to_string()));
        }
    }

    let category_id = p.config.category_secondary_id;
    match p
        .gateway
        .create_deal(category_id, &p.config.stage_secondary_new, &fields)
        .await
    {
        Ok(deal_id) => {
            info!(form = %entry.name, %deal_id, "Created secondary deal");
            p.event_log
                .append(
                    EventRecord::new(&entry.name, "deal.create")
                        .entity("deal", Some(deal_id.to_string())),
                )
                .await;
            report.deal = Some(DealCreationResult {
                deal_id,
                category_id,
                created: true,
                uploaded_files: Default::default(),
            });
            report.outcome = PipelineOutcome::Success;
        }
        Err(err) => {
            error!(form = %entry.name, %err, "Secondary deal creation failed");
            p.event_log
                .append(EventRecord::new(&entry.name, "deal.create").failed(&err))
                .await;
            report.outcome = PipelineOutcome::Failed;
            report.error = Some(err.to_string());
        }
    }

    report
}
