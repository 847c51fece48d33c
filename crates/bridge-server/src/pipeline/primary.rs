//! Primary pipeline: per-label fan-out with base-deal promotion
//!
//! Steps, in order: parse the participation selection, promote the base deal,
//! create or update one application deal per label, upload and attach files,
//! then link a contact to every deal that exists. Each label and each file is
//! isolated; a failure is recorded on its own outcome and the run continues.

use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

use bridge_bitrix::{CrmResult, DealId, FieldMap, SearchQuery};

use super::{
    build_contact_fields, build_deal_fields, build_search_query, parse_participation,
    DealCreationResult, LabelOutcome, Pipeline, PipelineOutcome, PipelineReport,
};
use crate::event_log::EventRecord;
use crate::mapping::MappingEntry;
use crate::submission::NormalizedSubmission;

pub(super) async fn run(
    p: &Pipeline<'_>,
    entry: &MappingEntry,
    submission: &mut NormalizedSubmission,
) -> PipelineReport {
    let mut report = PipelineReport::new(&entry.name, "primary");

    let selection = parse_participation(entry, submission);
    // An entry without file fields (the shorthand mapping form) has no labels
    // to fan out over; it still gets the base-deal promotion below. Only an
    // entry that declares labels and selected none of them fails here.
    if selection.is_empty() && !entry.file_fields.is_empty() {
        warn!(form = %entry.name, field = %entry.participation_field, "No participation labels selected");
        p.event_log
            .append(
                EventRecord::new(&entry.name, "participation.parse")
                    .failed("no participation labels selected"),
            )
            .await;
        report.error = Some("no participation labels selected".to_string());
        return report;
    }

    let query = build_search_query(entry, submission, p.config);
    promote_base_deal(p, entry, &query, &mut report).await;

    let deal_fields = build_deal_fields(entry, submission);
    for label in &selection {
        let outcome = run_label(p, entry, submission, &query, &deal_fields, label).await;
        report.labels.push(outcome);
    }

    link_contact(p, entry, submission, &query, &mut report).await;

    let succeeded = report.labels.iter().filter(|l| l.deal.is_some()).count();
    report.outcome = if succeeded == report.labels.len() {
        PipelineOutcome::Success
    } else if succeeded > 0 {
        PipelineOutcome::PartialFailure
    } else {
        PipelineOutcome::Failed
    };
    info!(
        form = %entry.name,
        outcome = ?report.outcome,
        labels = report.labels.len(),
        deals = succeeded,
        "Primary pipeline finished"
    );
    report
}

/// Locate the base deal and move it to the won stage if it is not there yet.
/// A missing base deal or a failed move never aborts the run.
async fn promote_base_deal(
    p: &Pipeline<'_>,
    entry: &MappingEntry,
    query: &SearchQuery,
    report: &mut PipelineReport,
) {
    match p.gateway.find_deal(p.config.category_base_id, query).await {
        Ok(Some(found)) => {
            report.base_deal_id = Some(found.id);
            if found.stage_id == p.config.stage_base_won {
                debug!(deal_id = %found.id, "Base deal already in the won stage");
                return;
            }
            match p.gateway.move_stage(found.id, &p.config.stage_base_won).await {
                Ok(()) => {
                    info!(deal_id = %found.id, stage = %p.config.stage_base_won, "Moved base deal");
                    p.event_log
                        .append(
                            EventRecord::new(&entry.name, "base.stage")
                                .entity("deal", Some(found.id.to_string())),
                        )
                        .await;
                }
                Err(err) => {
                    warn!(deal_id = %found.id, %err, "Base deal stage move failed");
                    p.event_log
                        .append(
                            EventRecord::new(&entry.name, "base.stage")
                                .entity("deal", Some(found.id.to_string()))
                                .failed(&err),
                        )
                        .await;
                }
            }
        }
        Ok(None) => debug!(form = %entry.name, "No base deal matched the submission"),
        Err(err) => {
            warn!(form = %entry.name, %err, "Base deal search failed");
            p.event_log
                .append(EventRecord::new(&entry.name, "base.search").failed(&err))
                .await;
        }
    }
}

/// Create or update the application deal for one label, then attach its files
async fn run_label(
    p: &Pipeline<'_>,
    entry: &MappingEntry,
    submission: &mut NormalizedSubmission,
    query: &SearchQuery,
    deal_fields: &FieldMap,
    label: &str,
) -> LabelOutcome {
    let mut outcome = LabelOutcome::new(label);

    let (deal_id, created) =
        match upsert_deal(p, entry, query, deal_fields, label).await {
            Ok(result) => result,
            Err(err) => {
                error!(form = %entry.name, %label, %err, "Application deal step failed");
                p.event_log
                    .append(
                        EventRecord::new(&entry.name, "deal.upsert")
                            .extra(serde_json::json!({ "label": label }))
                            .failed(&err),
                    )
                    .await;
                outcome.error = Some(err.to_string());
                return outcome;
            }
        };

    let step = if created { "deal.create" } else { "deal.update" };
    info!(form = %entry.name, %label, %deal_id, created, "Application deal ready");
    p.event_log
        .append(
            EventRecord::new(&entry.name, step)
                .entity("deal", Some(deal_id.to_string()))
                .extra(serde_json::json!({ "label": label })),
        )
        .await;

    let uploaded = attach_files(p, entry, submission, deal_id, label, &mut outcome).await;
    outcome.deal = Some(DealCreationResult {
        deal_id,
        category_id: p.config.category_applications_id,
        created,
        uploaded_files: uploaded,
    });
    outcome
}

/// Update the label's existing deal or create a new one in the applications
/// category. The participation field scopes both the search and the payload.
async fn upsert_deal(
    p: &Pipeline<'_>,
    entry: &MappingEntry,
    query: &SearchQuery,
    deal_fields: &FieldMap,
    label: &str,
) -> CrmResult<(DealId, bool)> {
    let labeled = query.with_label(&p.config.participation_field_code, label);
    let mut fields = deal_fields.clone();
    fields.insert(
        p.config.participation_field_code.clone(),
        Value::String(label.to_string()),
    );

    if let Some(found) = p
        .gateway
        .find_deal(p.config.category_applications_id, &labeled)
        .await?
    {
        p.gateway.update_deal(found.id, &fields).await?;
        return Ok((found.id, false));
    }

    let deal_id = p
        .gateway
        .create_deal(
            p.config.category_applications_id,
            &p.config.stage_applications_new,
            &fields,
        )
        .await?;
    Ok((deal_id, true))
}

/// Upload the label's files and attach each to the configured UF field.
/// Every file is its own unit of failure; the spooled copy is deleted only
/// after a successful attach.
async fn attach_files(
    p: &Pipeline<'_>,
    entry: &MappingEntry,
    submission: &mut NormalizedSubmission,
    deal_id: DealId,
    label: &str,
    outcome: &mut LabelOutcome,
) -> BTreeMap<String, bridge_bitrix::FileId> {
    let mut uploaded = BTreeMap::new();
    let Some(uf_code) = entry.file_field_code(label).map(str::to_string) else {
        return uploaded;
    };

    for file in submission
        .files
        .iter_mut()
        .filter(|f| f.field_name == label)
    {
        let filename = file.filename.clone();
        match upload_one(p, entry, deal_id, &uf_code, file).await {
            Ok(file_id) => {
                info!(%deal_id, %label, %filename, %file_id, "Uploaded and attached file");
                p.event_log
                    .append(
                        EventRecord::new(&entry.name, "file.upload")
                            .entity("file", Some(file_id.to_string()))
                            .extra(serde_json::json!({ "label": label, "filename": filename })),
                    )
                    .await;
                uploaded.insert(label.to_string(), file_id);
            }
            Err(err) => {
                error!(%deal_id, %label, %filename, %err, "File upload failed");
                p.event_log
                    .append(
                        EventRecord::new(&entry.name, "file.upload")
                            .extra(serde_json::json!({ "label": label, "filename": filename }))
                            .failed(&err),
                    )
                    .await;
                outcome.file_errors.push(format!("{}: {}", filename, err));
            }
        }
    }
    uploaded
}

async fn upload_one(
    p: &Pipeline<'_>,
    entry: &MappingEntry,
    deal_id: DealId,
    uf_code: &str,
    file: &mut crate::submission::SubmissionFile,
) -> crate::error::ServerResult<bridge_bitrix::FileId> {
    let content = file.spooled.read().await?;
    let file_id = p
        .gateway
        .upload_file(&entry.name, &file.filename, &content)
        .await?;

    let mut attach = FieldMap::new();
    attach.insert(uf_code.to_string(), Value::String(file_id.to_string()));
    p.gateway.update_deal(deal_id, &attach).await?;

    file.spooled.remove().await;
    Ok(file_id)
}

/// Find or create the contact and link it to every deal the run produced
async fn link_contact(
    p: &Pipeline<'_>,
    entry: &MappingEntry,
    submission: &NormalizedSubmission,
    query: &SearchQuery,
    report: &mut PipelineReport,
) {
    let deal_ids: Vec<DealId> = report
        .labels
        .iter()
        .filter_map(|l| l.deal.as_ref().map(|d| d.deal_id))
        .collect();
    if deal_ids.is_empty() || entry.contact_fields.is_empty() {
        return;
    }

    let contact_fields = build_contact_fields(entry, submission);
    let contact_id = match p.gateway.find_or_create_contact(query, &contact_fields).await {
        Ok(id) => id,
        Err(err) => {
            warn!(form = %entry.name, %err, "Contact resolution failed");
            p.event_log
                .append(EventRecord::new(&entry.name, "contact.resolve").failed(&err))
                .await;
            report.contact_error = Some(err.to_string());
            return;
        }
    };
    report.contact_id = Some(contact_id);
    p.event_log
        .append(
            EventRecord::new(&entry.name, "contact.resolve")
                .entity("contact", Some(contact_id.to_string())),
        )
        .await;

    let mut link = FieldMap::new();
    link.insert("CONTACT_ID".to_string(), Value::Number(contact_id.0.into()));
    for deal_id in deal_ids {
        match p.gateway.update_deal(deal_id, &link).await {
            Ok(()) => {
                p.event_log
                    .append(
                        EventRecord::new(&entry.name, "contact.link")
                            .entity("deal", Some(deal_id.to_string()))
                            .extra(serde_json::json!({ "contact_id": contact_id.0 })),
                    )
                    .await;
            }
            Err(err) => {
                warn!(%deal_id, %contact_id, %err, "Contact link failed");
                p.event_log
                    .append(
                        EventRecord::new(&entry.name, "contact.link")
                            .entity("deal", Some(deal_id.to_string()))
                            .failed(&err),
                    )
                    .await;
            }
        }
    }
}
