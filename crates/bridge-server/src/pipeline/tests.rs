use std::collections::HashMap;

use async_trait::async_trait;
use mockall::mock;
use mockall::predicate::{always, eq};
use serde_json::{json, Value};

use bridge_bitrix::{
    ContactId, CrmError, CrmGateway, CrmResult, DealId, FieldMap, FileId, FoundDeal,
    InMemoryCrmGateway, SearchQuery,
};

use super::{Pipeline, PipelineOutcome};
use crate::config::ServerConfig;
use crate::event_log::EventLog;
use crate::mapping::{MappingEntry, MappingRegistry};
use crate::submission::{NormalizedSubmission, SubmissionFile};
use crate::tempstore::TempFileStore;

mock! {
    pub Gateway {}

    #[async_trait]
    impl CrmGateway for Gateway {
        async fn find_deal(&self, category_id: i64, query: &SearchQuery) -> CrmResult<Option<FoundDeal>>;
        async fn create_deal(&self, category_id: i64, stage_id: &str, fields: &FieldMap) -> CrmResult<DealId>;
        async fn update_deal(&self, deal_id: DealId, fields: &FieldMap) -> CrmResult<()>;
        async fn move_stage(&self, deal_id: DealId, stage_id: &str) -> CrmResult<()>;
        async fn find_or_create_contact(&self, query: &SearchQuery, fields: &FieldMap) -> CrmResult<ContactId>;
        async fn upload_file(&self, folder_name: &str, filename: &str, content: &[u8]) -> CrmResult<FileId>;
        async fn describe_deal_fields(&self) -> CrmResult<Value>;
    }
}

impl std::fmt::Debug for MockGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MockGateway")
    }
}

fn config() -> ServerConfig {
    ServerConfig::default()
}

fn event_log(dir: &tempfile::TempDir) -> EventLog {
    EventLog::new(dir.path().join("events.log"))
}

fn entry(config: &ServerConfig, raw: Value) -> MappingEntry {
    let registry = MappingRegistry::from_value(json!({ "exhibitors": raw }), config).unwrap();
    registry.resolve("exhibitors").unwrap().clone()
}

fn exhibitors_entry(config: &ServerConfig) -> MappingEntry {
    entry(
        config,
        json!({
            "kind": "primary",
            "deal_fields": { "company": "TITLE", "inn": "UF_INN" },
            "contact_fields": { "name": "NAME", "phone": "PHONE", "email": "EMAIL" },
            "file_fields": {
                "Показ": "UF_CRM_SHOW_FILE",
                "Маркет": "UF_CRM_MARKET_FILE",
                "Выставка": "UF_CRM_EXPO_FILE",
            },
            "participation_field": "format",
        }),
    )
}

fn submission(form_id: &str, pairs: &[(&str, &str)]) -> NormalizedSubmission {
    NormalizedSubmission {
        form_id: form_id.to_string(),
        fields: pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>(),
        files: Vec::new(),
    }
}

async fn spool_file(store: &TempFileStore, field: &str, filename: &str, content: &[u8]) -> SubmissionFile {
    SubmissionFile {
        field_name: field.to_string(),
        filename: filename.to_string(),
        spooled: store.spool(content).await.unwrap(),
    }
}

#[tokio::test]
async fn secondary_form_issues_exactly_one_write() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let gateway = InMemoryCrmGateway::new();
    let log = event_log(&dir);
    let entry = entry(
        &config,
        json!({
            "kind": "secondary",
            "deal_fields": { "company": "TITLE" },
            "contact_fields": { "phone": "PHONE" },
        }),
    );
    let mut sub = submission("exhibitors", &[("company", "Acme"), ("phone", "+7900")]);

    let report = Pipeline::new(&gateway, &config, &log).run(&entry, &mut sub).await;

    assert_eq!(report.outcome, PipelineOutcome::Success);
    assert_eq!(gateway.write_calls().await, 1);
    assert_eq!(gateway.calls("create_deal").await, 1);
    assert_eq!(gateway.calls("find_contact").await, 0);

    let deal = report.deal.unwrap();
    assert!(deal.created);
    let fields = gateway.deal_fields(deal.deal_id).await.unwrap();
    assert_eq!(fields["TITLE"], "Acme");
    // Contact-mapped fields fold into the deal payload as plain strings.
    assert_eq!(fields["PHONE"], "+7900");
    assert_eq!(
        gateway.deal_stage(deal.deal_id).await.unwrap(),
        config.stage_secondary_new
    );
}

#[tokio::test]
async fn empty_participation_fails_before_any_write() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let gateway = InMemoryCrmGateway::new();
    let log = event_log(&dir);
    let entry = exhibitors_entry(&config);
    let mut sub = submission("exhibitors", &[("company", "Acme"), ("format", "  ")]);

    let report = Pipeline::new(&gateway, &config, &log).run(&entry, &mut sub).await;

    assert_eq!(report.outcome, PipelineOutcome::Failed);
    assert!(report.labels.is_empty());
    assert_eq!(gateway.write_calls().await, 0);
    assert_eq!(gateway.calls("find_deal").await, 0);
}

#[tokio::test]
async fn single_file_field_is_an_implicit_label() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let gateway = InMemoryCrmGateway::new();
    let log = event_log(&dir);
    let entry = entry(
        &config,
        json!({
            "kind": "primary",
            "deal_fields": { "company": "TITLE" },
            "file_fields": { "Показ": "UF_CRM_SHOW_FILE" },
        }),
    );
    let mut sub = submission("exhibitors", &[("company", "Acme")]);

    let report = Pipeline::new(&gateway, &config, &log).run(&entry, &mut sub).await;

    assert_eq!(report.outcome, PipelineOutcome::Success);
    assert_eq!(report.labels.len(), 1);
    assert_eq!(report.labels[0].label, "Показ");
}

#[tokio::test]
async fn unknown_labels_are_dropped_from_the_selection() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let gateway = InMemoryCrmGateway::new();
    let log = event_log(&dir);
    let entry = exhibitors_entry(&config);
    let mut sub = submission(
        "exhibitors",
        &[("company", "Acme"), ("format", "Показ, Кино, Показ")],
    );

    let report = Pipeline::new(&gateway, &config, &log).run(&entry, &mut sub).await;

    assert_eq!(report.labels.len(), 1);
    assert_eq!(report.labels[0].label, "Показ");
    assert_eq!(gateway.calls("create_deal").await, 1);
}

#[tokio::test]
async fn two_labels_fan_out_into_two_scoped_deals() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let gateway = InMemoryCrmGateway::new();
    let log = event_log(&dir);
    let store = TempFileStore::new(dir.path().join("spool")).await.unwrap();
    let entry = exhibitors_entry(&config);

    let mut sub = submission(
        "exhibitors",
        &[
            ("company", "Acme"),
            ("inn", "7701234567"),
            ("name", "Ivan"),
            ("phone", "+79001234567"),
            ("format", "Показ; Маркет"),
        ],
    );
    sub.files.push(spool_file(&store, "Показ", "show.pdf", b"show").await);
    sub.files.push(spool_file(&store, "Маркет", "market.pdf", b"market").await);

    let report = Pipeline::new(&gateway, &config, &log).run(&entry, &mut sub).await;

    assert_eq!(report.outcome, PipelineOutcome::Success);
    assert_eq!(report.labels.len(), 2);
    assert_eq!(gateway.calls("create_deal").await, 2);
    assert_eq!(gateway.calls("upload_file").await, 2);
    assert_eq!(gateway.file_count().await, 2);
    // One contact, linked to both deals.
    assert_eq!(gateway.contact_count().await, 1);
    let contact_id = report.contact_id.unwrap();

    for outcome in &report.labels {
        let deal = outcome.deal.as_ref().unwrap();
        assert!(deal.created);
        let fields = gateway.deal_fields(deal.deal_id).await.unwrap();
        assert_eq!(fields[&config.participation_field_code], outcome.label.as_str());
        assert_eq!(fields["CONTACT_ID"], contact_id.0);
        let file_id = outcome.deal.as_ref().unwrap().uploaded_files[&outcome.label].clone();
        let uf_code = entry.file_field_code(&outcome.label).unwrap();
        assert_eq!(fields[uf_code], file_id.as_str());
    }

    // The spooled copies are gone after the attach.
    assert_eq!(std::fs::read_dir(store.dir()).unwrap().count(), 0);
    // The third configured label was never selected.
    assert!(report.labels.iter().all(|l| l.label != "Выставка"));
}

#[tokio::test]
async fn resubmission_updates_the_scoped_deal_instead_of_duplicating() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let gateway = InMemoryCrmGateway::new();
    let log = event_log(&dir);
    let entry = exhibitors_entry(&config);
    let mut first = submission(
        "exhibitors",
        &[("company", "Acme"), ("inn", "7701234567"), ("format", "Показ")],
    );
    let mut second = submission(
        "exhibitors",
        &[("company", "Acme renamed"), ("inn", "7701234567"), ("format", "Показ")],
    );

    let pipeline = Pipeline::new(&gateway, &config, &log);
    let report = pipeline.run(&entry, &mut first).await;
    let deal_id = report.labels[0].deal.as_ref().unwrap().deal_id;

    let report = pipeline.run(&entry, &mut second).await;

    assert_eq!(gateway.deal_count().await, 1);
    let deal = report.labels[0].deal.as_ref().unwrap();
    assert_eq!(deal.deal_id, deal_id);
    assert!(!deal.created);
    let fields = gateway.deal_fields(deal_id).await.unwrap();
    assert_eq!(fields["TITLE"], "Acme renamed");
}

#[tokio::test]
async fn matching_base_deal_is_moved_to_the_won_stage() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let gateway = InMemoryCrmGateway::new();
    let log = event_log(&dir);
    let entry = exhibitors_entry(&config);

    let mut seed = FieldMap::new();
    seed.insert("UF_INN".to_string(), Value::String("7701234567".to_string()));
    let base_id = gateway.seed_deal(config.category_base_id, "C6:NEW", seed).await;

    let mut sub = submission(
        "exhibitors",
        &[("inn", "7701234567"), ("format", "Показ")],
    );
    let report = Pipeline::new(&gateway, &config, &log).run(&entry, &mut sub).await;

    assert_eq!(report.base_deal_id, Some(base_id));
    assert_eq!(gateway.deal_stage(base_id).await.unwrap(), config.stage_base_won);
    assert_eq!(gateway.calls("move_stage").await, 1);

    // A second run finds the deal already won and does not move it again.
    let mut again = submission(
        "exhibitors",
        &[("inn", "7701234567"), ("format", "Показ")],
    );
    Pipeline::new(&gateway, &config, &log).run(&entry, &mut again).await;
    assert_eq!(gateway.calls("move_stage").await, 1);
}

#[tokio::test]
async fn shorthand_entry_without_file_fields_still_promotes_the_base_deal() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let gateway = InMemoryCrmGateway::new();
    let log = event_log(&dir);
    // Flat mapping entries carry deal fields only, so there is nothing to
    // fan out over.
    let entry = entry(&config, json!({ "company": "TITLE", "inn": "UF_INN" }));

    let mut seed = FieldMap::new();
    seed.insert("UF_INN".to_string(), Value::String("7701234567".to_string()));
    let base_id = gateway.seed_deal(config.category_base_id, "C6:NEW", seed).await;

    let mut sub = submission("exhibitors", &[("company", "Acme"), ("inn", "7701234567")]);
    let report = Pipeline::new(&gateway, &config, &log).run(&entry, &mut sub).await;

    assert_eq!(report.outcome, PipelineOutcome::Success);
    assert!(report.labels.is_empty());
    assert_eq!(report.base_deal_id, Some(base_id));
    assert_eq!(gateway.deal_stage(base_id).await.unwrap(), config.stage_base_won);
    assert_eq!(gateway.calls("move_stage").await, 1);
    assert_eq!(gateway.calls("create_deal").await, 0);
}

#[tokio::test]
async fn one_failing_label_leaves_the_other_intact() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let log = event_log(&dir);
    let cfg = config.clone();

    let mut gateway = MockGateway::new();
    gateway.expect_find_deal().returning(|_, _| Ok(None));
    gateway
        .expect_create_deal()
        .withf(|_, _, fields| fields["UF_CRM_PARTICIPATION"] == "Показ")
        .returning(|_, _, _| Ok(DealId(101)));
    gateway
        .expect_create_deal()
        .withf(|_, _, fields| fields["UF_CRM_PARTICIPATION"] == "Маркет")
        .returning(|_, _, _| Err(CrmError::Unavailable("boom".to_string())));
    gateway
        .expect_find_or_create_contact()
        .returning(|_, _| Ok(ContactId(55)));
    gateway
        .expect_update_deal()
        .with(eq(DealId(101)), always())
        .times(1)
        .returning(|_, _| Ok(()));

    let entry = exhibitors_entry(&cfg);
    let mut sub = submission(
        "exhibitors",
        &[("company", "Acme"), ("name", "Ivan"), ("format", "Показ, Маркет")],
    );
    let report = Pipeline::new(&gateway, &cfg, &log).run(&entry, &mut sub).await;

    assert_eq!(report.outcome, PipelineOutcome::PartialFailure);
    assert_eq!(report.labels.len(), 2);
    let show = report.labels.iter().find(|l| l.label == "Показ").unwrap();
    assert!(show.deal.is_some());
    let market = report.labels.iter().find(|l| l.label == "Маркет").unwrap();
    assert!(market.deal.is_none());
    assert!(market.error.as_ref().unwrap().contains("unavailable"));
}

#[tokio::test]
async fn all_labels_failing_is_a_failed_run_without_contact_calls() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let log = event_log(&dir);

    let mut gateway = MockGateway::new();
    gateway.expect_find_deal().returning(|_, _| Ok(None));
    gateway
        .expect_create_deal()
        .returning(|_, _, _| Err(CrmError::Timeout("deadline".to_string())));
    gateway.expect_find_or_create_contact().times(0);
    gateway.expect_update_deal().times(0);

    let entry = exhibitors_entry(&config);
    let mut sub = submission(
        "exhibitors",
        &[("company", "Acme"), ("name", "Ivan"), ("format", "Показ")],
    );
    let report = Pipeline::new(&gateway, &config, &log).run(&entry, &mut sub).await;

    assert_eq!(report.outcome, PipelineOutcome::Failed);
    assert!(report.contact_id.is_none());
}

#[tokio::test]
async fn file_upload_failure_keeps_the_deal_and_the_spooled_copy() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let log = event_log(&dir);
    let store = TempFileStore::new(dir.path().join("spool")).await.unwrap();

    let mut gateway = MockGateway::new();
    gateway.expect_find_deal().returning(|_, _| Ok(None));
    gateway.expect_create_deal().returning(|_, _, _| Ok(DealId(7)));
    gateway
        .expect_upload_file()
        .returning(|_, _, _| Err(CrmError::Unavailable("disk down".to_string())));
    gateway.expect_update_deal().times(0);

    let entry = entry(
        &config,
        json!({
            "kind": "primary",
            "deal_fields": { "company": "TITLE" },
            "file_fields": { "Показ": "UF_CRM_SHOW_FILE" },
        }),
    );
    let mut sub = submission("exhibitors", &[("company", "Acme"), ("format", "Показ")]);
    sub.files.push(spool_file(&store, "Показ", "brief.pdf", b"pdf").await);

    let report = Pipeline::new(&gateway, &config, &log).run(&entry, &mut sub).await;

    // A deal write went through, so the run still counts as a success.
    assert_eq!(report.outcome, PipelineOutcome::Success);
    let outcome = &report.labels[0];
    assert!(outcome.deal.is_some());
    assert_eq!(outcome.file_errors.len(), 1);
    assert!(outcome.deal.as_ref().unwrap().uploaded_files.is_empty());
    // The spooled copy survives for manual retry.
    assert_eq!(std::fs::read_dir(store.dir()).unwrap().count(), 1);
}

#[tokio::test]
async fn base_deal_search_failure_does_not_abort_the_fan_out() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let log = event_log(&dir);
    let base_category = config.category_base_id;

    let mut gateway = MockGateway::new();
    gateway
        .expect_find_deal()
        .withf(move |category, _| *category == base_category)
        .returning(|_, _| Err(CrmError::Unavailable("list failed".to_string())));
    gateway
        .expect_find_deal()
        .withf(move |category, _| *category != base_category)
        .returning(|_, _| Ok(None));
    gateway.expect_create_deal().returning(|_, _, _| Ok(DealId(9)));

    let entry = entry(
        &config,
        json!({
            "kind": "primary",
            "deal_fields": { "company": "TITLE" },
            "file_fields": { "Показ": "UF_CRM_SHOW_FILE" },
        }),
    );
    let mut sub = submission("exhibitors", &[("company", "Acme"), ("format", "Показ")]);
    let report = Pipeline::new(&gateway, &config, &log).run(&entry, &mut sub).await;

    assert_eq!(report.outcome, PipelineOutcome::Success);
    assert!(report.base_deal_id.is_none());
    assert_eq!(report.labels[0].deal.as_ref().unwrap().deal_id, DealId(9));
}

#[tokio::test]
async fn contact_failure_is_recorded_but_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let log = event_log(&dir);

    let mut gateway = MockGateway::new();
    gateway.expect_find_deal().returning(|_, _| Ok(None));
    gateway.expect_create_deal().returning(|_, _, _| Ok(DealId(3)));
    gateway
        .expect_find_or_create_contact()
        .returning(|_, _| Err(CrmError::Rejected("bad phone".to_string())));
    gateway.expect_update_deal().times(0);

    let entry = exhibitors_entry(&config);
    let mut sub = submission(
        "exhibitors",
        &[("company", "Acme"), ("name", "Ivan"), ("format", "Показ")],
    );
    let report = Pipeline::new(&gateway, &config, &log).run(&entry, &mut sub).await;

    assert_eq!(report.outcome, PipelineOutcome::Success);
    assert!(report.contact_id.is_none());
    assert!(report.contact_error.as_ref().unwrap().contains("bad phone"));
}
