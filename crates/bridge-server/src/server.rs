//! Main bridge server implementation
//!
//! This module contains the BridgeServer implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Request;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{info, warn};

use bridge_bitrix::CrmGateway;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::event_log::{EventLog, EventRecord};
use crate::forwarder;
use crate::mapping::MappingRegistry;
use crate::pipeline::{Pipeline, PipelineOutcome, PipelineReport};
use crate::schema_cache::DealFieldsCache;
use crate::submission::{self, NormalizedSubmission};
use crate::tempstore::TempFileStore;
use crate::tilda::TildaClient;

/// Reply to an accepted form submission
#[derive(Debug)]
pub enum SubmissionReply {
    /// The form was mapped and a pipeline ran
    Processed(PipelineReport),
    /// The form carried an identifier no mapping covers; accepted and logged
    /// so the form platform does not retry the delivery
    Unmapped { form_id: String },
}

impl SubmissionReply {
    /// Status returned to the webhook caller. Only a run with no deal
    /// written at all answers non-2xx; partial results are a 200 so the
    /// form platform does not redeliver and duplicate the successful part.
    pub fn status_code(&self) -> axum::http::StatusCode {
        match self {
            SubmissionReply::Processed(report) if report.outcome == PipelineOutcome::Failed => {
                axum::http::StatusCode::BAD_GATEWAY
            }
            _ => axum::http::StatusCode::OK,
        }
    }

    /// JSON body returned to the webhook caller
    pub fn to_body(&self) -> Value {
        match self {
            SubmissionReply::Processed(report) => {
                let status = match report.outcome {
                    PipelineOutcome::Success => "ok",
                    PipelineOutcome::PartialFailure => "partial",
                    PipelineOutcome::Failed => "failed",
                };
                json!({ "status": status, "report": report })
            }
            SubmissionReply::Unmapped { form_id } => json!({
                "status": "ignored",
                "form_id": form_id,
                "note": "no mapping configured for this form",
            }),
        }
    }
}

/// Main server implementation
#[derive(Clone)]
pub struct BridgeServer {
    /// Configuration
    pub config: ServerConfig,

    /// CRM gateway client
    gateway: Arc<dyn CrmGateway>,

    /// Per-form mapping registry, read-only after startup
    registry: Arc<MappingRegistry>,

    /// Tilda API client for form metadata
    tilda: TildaClient,

    /// Cached crm.deal.fields schema
    deal_fields_cache: DealFieldsCache,

    /// Append-only record of remote writes
    event_log: EventLog,

    /// Spool directory for uploaded files
    temp_store: TempFileStore,

    /// Client for relaying CRM-originated webhooks
    http_client: reqwest::Client,
}

/// Manual Debug implementation that doesn't try to debug the trait object
impl std::fmt::Debug for BridgeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeServer")
            .field("config", &self.config)
            .field("forms", &self.registry.len())
            .finish()
    }
}

impl BridgeServer {
    /// Create a new BridgeServer
    pub fn new(
        config: ServerConfig,
        gateway: Arc<dyn CrmGateway>,
        registry: MappingRegistry,
        tilda: TildaClient,
        event_log: EventLog,
        temp_store: TempFileStore,
    ) -> ServerResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            config,
            gateway,
            registry: Arc::new(registry),
            tilda,
            deal_fields_cache: DealFieldsCache::new(),
            event_log,
            temp_store,
            http_client,
        })
    }

    /// Run the server
    pub async fn run(self) -> ServerResult<()> {
        info!("Starting bridge server");

        // Warm the deal-field schema cache up front; a cold cache is not
        // fatal, the first /bitrix/fields request retries the fetch.
        if let Err(e) = self.deal_fields_cache.refresh(self.gateway.as_ref()).await {
            warn!("Deal-field schema warm-up failed: {}", e);
        }

        let port = self.config.port;
        let bind_address = self.config.bind_address.clone();
        let app = crate::api::build_router(Arc::new(self));

        let addr: SocketAddr = format!("{}:{}", bind_address, port)
            .parse()
            .map_err(|e| ServerError::ConfigError(format!("Invalid bind address: {}", e)))?;
        let listener = TcpListener::bind(addr).await?;
        info!("Listening on {}", listener.local_addr()?);

        axum::serve(listener, app).await?;
        Ok(())
    }

    pub fn registry(&self) -> &MappingRegistry {
        &self.registry
    }

    /// Process one inbound form submission end to end
    pub async fn process_submission(
        &self,
        request: Request,
        route_form_id: Option<String>,
    ) -> ServerResult<SubmissionReply> {
        let mut sub = submission::normalize(request, route_form_id, &self.temp_store).await?;

        let Some(entry) = self.registry.resolve(&sub.form_id) else {
            warn!(form_id = %sub.form_id, "Submission for a form with no mapping");
            self.event_log
                .append(
                    EventRecord::new(&sub.form_id, "submission.unmapped")
                        .extra(sub.payload_json()),
                )
                .await;
            let form_id = sub.form_id.clone();
            return Ok(SubmissionReply::Unmapped { form_id });
        };
        let entry = entry.clone();

        self.log_received(&sub).await;
        let report = Pipeline::new(self.gateway.as_ref(), &self.config, &self.event_log)
            .run(&entry, &mut sub)
            .await;
        Ok(SubmissionReply::Processed(report))
    }

    async fn log_received(&self, sub: &NormalizedSubmission) {
        self.event_log
            .append(
                EventRecord::new(&sub.form_id, "submission.received").extra(sub.payload_json()),
            )
            .await;
    }

    /// Accept a CRM-originated webhook: log it and relay it if a target is
    /// configured. Always succeeds so the CRM does not disable the handler.
    pub async fn process_crm_webhook(&self, content_type: &str, body: &[u8]) -> Value {
        let payload = submission::parse_loose_payload(content_type, body);
        let event = payload
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        info!(%event, "Received CRM webhook");

        if let Some(target) = &self.config.outbound_webhook_url {
            // Fire and forget: the CRM's delivery must not wait on the relay.
            let client = self.http_client.clone();
            let target = target.clone();
            let forward_fields = self.config.forward_fields.clone();
            let relayed = payload.clone();
            tokio::spawn(async move {
                forwarder::forward(&client, &target, &forward_fields, &relayed).await;
            });
        }

        self.event_log
            .append(
                EventRecord::new("bitrix", "webhook.received")
                    .extra(json!({ "event": event.clone(), "payload": payload })),
            )
            .await;

        json!({ "status": "accepted", "event": event })
    }

    /// The crm.deal.fields schema, from cache unless a refresh is forced
    pub async fn deal_fields(&self, refresh: bool) -> ServerResult<Value> {
        if refresh {
            self.deal_fields_cache.refresh(self.gateway.as_ref()).await
        } else {
            self.deal_fields_cache.get(self.gateway.as_ref()).await
        }
    }

    /// Forms of a Tilda project, for mapping maintenance
    pub async fn list_tilda_forms(&self, project_id: Option<i64>) -> ServerResult<Vec<Value>> {
        self.tilda.list_forms(project_id).await
    }

    /// One Tilda form's field descriptions
    pub async fn get_tilda_form(&self, form_id: i64) -> ServerResult<Value> {
        self.tilda.get_form(form_id).await
    }

    /// Whether the deal-fields cache has been populated
    pub async fn schema_cache_warm(&self) -> bool {
        self.deal_fields_cache.is_warm().await
    }
}
