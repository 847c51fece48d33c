//! HTTP API tests exercising the router with an in-memory CRM gateway

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use bridge_bitrix::InMemoryCrmGateway;
use bridge_server::api::build_router;
use bridge_server::config::ServerConfig;
use bridge_server::event_log::EventLog;
use bridge_server::mapping::MappingRegistry;
use bridge_server::server::BridgeServer;
use bridge_server::tempstore::TempFileStore;
use bridge_server::tilda::TildaClient;

fn mapping() -> Value {
    json!({
        "exhibitors": {
            "kind": "primary",
            "deal_fields": { "company": "TITLE", "inn": "UF_INN" },
            "contact_fields": { "name": "NAME", "phone": "PHONE" },
            "file_fields": { "Показ": "UF_CRM_SHOW_FILE", "Маркет": "UF_CRM_MARKET_FILE" },
            "participation_field": "format",
        },
        "aftersale": {
            "kind": "secondary",
            "deal_fields": { "company": "TITLE" },
            "contact_fields": { "phone": "PHONE" },
        },
    })
}

async fn test_app(gateway: Arc<InMemoryCrmGateway>) -> (Router, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        bitrix_webhook_base_url: "memory://".to_string(),
        event_log_file: dir.path().join("events.log"),
        upload_tmp_dir: dir.path().join("spool"),
        ..Default::default()
    };

    let registry = MappingRegistry::from_value(mapping(), &config).unwrap();
    let tilda = TildaClient::new(&config).unwrap();
    let event_log = EventLog::new(config.event_log_file.clone());
    let temp_store = TempFileStore::new(config.upload_tmp_dir.clone()).await.unwrap();

    let server =
        BridgeServer::new(config, gateway, registry, tilda, event_log, temp_store).unwrap();
    (build_router(Arc::new(server)), dir)
}

fn form_post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn health_endpoint_reports_mapping_state() {
    let (app, _dir) = test_app(Arc::new(InMemoryCrmGateway::new())).await;

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "UP");
    assert_eq!(body["dependencies"]["mapping"]["forms"], 2);
}

#[tokio::test]
async fn submission_without_identifier_is_rejected() {
    let gateway = Arc::new(InMemoryCrmGateway::new());
    let (app, _dir) = test_app(gateway.clone()).await;

    let response = app
        .oneshot(form_post("/webhook/tilda", "name=Acme"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["errorDetails"]["errorCode"], "ERR_UNKNOWN_FORM");
    assert_eq!(gateway.write_calls().await, 0);
}

#[tokio::test]
async fn identified_but_unmapped_form_is_accepted_and_ignored() {
    let gateway = Arc::new(InMemoryCrmGateway::new());
    let (app, _dir) = test_app(gateway.clone()).await;

    let response = app
        .oneshot(form_post("/webhook/tilda", "formname=mystery&name=Acme"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ignored");
    assert_eq!(body["form_id"], "mystery");
    assert_eq!(gateway.write_calls().await, 0);
}

#[tokio::test]
async fn secondary_submission_creates_one_deal() {
    let gateway = Arc::new(InMemoryCrmGateway::new());
    let (app, _dir) = test_app(gateway.clone()).await;

    let response = app
        .oneshot(form_post(
            "/webhook/tilda",
            "formname=aftersale&company=Acme&phone=%2B79001234567",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert!(body["report"]["deal"]["created"].as_bool().unwrap());
    assert_eq!(gateway.deal_count().await, 1);
}

#[tokio::test]
async fn keyed_route_overrides_the_payload_identifier() {
    let gateway = Arc::new(InMemoryCrmGateway::new());
    let (app, _dir) = test_app(gateway.clone()).await;

    // The payload claims another form; the path wins.
    let response = app
        .oneshot(form_post(
            "/webhook/tilda/aftersale",
            "formname=exhibitors&company=Acme",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["report"]["form_id"], "aftersale");
    assert_eq!(body["report"]["kind"], "secondary");
}

#[tokio::test]
async fn primary_submission_fans_out_and_logs_events() {
    let gateway = Arc::new(InMemoryCrmGateway::new());
    let (app, dir) = test_app(gateway.clone()).await;

    let response = app
        .oneshot(form_post(
            "/webhook/tilda",
            "formname=exhibitors&company=Acme&inn=7701234567&name=Ivan&phone=%2B79001234567&format=%D0%9F%D0%BE%D0%BA%D0%B0%D0%B7",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["report"]["labels"].as_array().unwrap().len(), 1);
    assert_eq!(body["report"]["labels"][0]["label"], "Показ");
    assert_eq!(gateway.deal_count().await, 1);
    assert_eq!(gateway.contact_count().await, 1);

    let log = std::fs::read_to_string(dir.path().join("events.log")).unwrap();
    let steps: Vec<String> = log
        .lines()
        .map(|l| serde_json::from_str::<Value>(l).unwrap()["step"].as_str().unwrap().to_string())
        .collect();
    assert!(steps.contains(&"submission.received".to_string()));
    assert!(steps.contains(&"deal.create".to_string()));
    assert!(steps.contains(&"contact.resolve".to_string()));
}

#[tokio::test]
async fn primary_submission_with_empty_selection_reports_failed() {
    let gateway = Arc::new(InMemoryCrmGateway::new());
    let (app, _dir) = test_app(gateway.clone()).await;

    let response = app
        .oneshot(form_post("/webhook/tilda", "formname=exhibitors&company=Acme"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = json_body(response).await;
    assert_eq!(body["status"], "failed");
    assert_eq!(gateway.write_calls().await, 0);
}

#[tokio::test]
async fn crm_webhook_is_accepted_and_logged() {
    let gateway = Arc::new(InMemoryCrmGateway::new());
    let (app, dir) = test_app(gateway).await;

    let response = app
        .oneshot(form_post("/webhook/b24", "event=ONCRMDEALADD&data%5BFIELDS%5D%5BID%5D=42"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["event"], "ONCRMDEALADD");

    let log = std::fs::read_to_string(dir.path().join("events.log")).unwrap();
    assert!(log.contains("webhook.received"));
}

#[tokio::test]
async fn deal_fields_endpoint_serves_the_cached_schema() {
    let gateway = Arc::new(InMemoryCrmGateway::new());
    let (app, _dir) = test_app(gateway.clone()).await;

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/bitrix/fields").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert!(body.get("TITLE").is_some());
    assert_eq!(gateway.calls("describe_fields").await, 1);

    // A second request without refresh hits the cache.
    let response = app
        .oneshot(Request::builder().uri("/bitrix/fields").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(gateway.calls("describe_fields").await, 1);
}

#[tokio::test]
async fn tilda_endpoints_fail_cleanly_without_keys() {
    let (app, _dir) = test_app(Arc::new(InMemoryCrmGateway::new())).await;

    let response = app
        .oneshot(Request::builder().uri("/tilda/forms").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = json_body(response).await;
    assert_eq!(body["errorDetails"]["errorCode"], "ERR_FORM_PLATFORM");
}
