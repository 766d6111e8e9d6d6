//! Webhook delivery: replays inbound messages to the developer's endpoint.
//!
//! One call to [`WebhookService::deliver`] is one logical delivery. Transport
//! failures and timeouts are retried with exponential backoff. Any HTTP
//! response, success or not, ends the attempt sequence. The outcome is always
//! recorded in the bounded history and broadcast to every viewer.

use crate::error::SimError;
use crate::hub::BroadcastHub;
use crate::signing::{sign_body, SIGNATURE_HEADER};
use crate::types::{
    DeliveryStatus, HubEvent, Message, WebhookConfig, WebhookConfigUpdate, WebhookConfigView,
    WebhookEvent, WebhookPayload,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

pub const HISTORY_LIMIT: usize = 100;
pub const MARKER_HEADER: &str = "X-Sms-Simulator";
pub const ATTEMPT_HEADER: &str = "X-Sms-Simulator-Attempt";
pub const NOT_CONFIGURED: &str = "Webhook URL not configured";
pub const DISABLED: &str = "Webhooks are disabled";

/// One HTTP POST as handed to a transport.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub attempt: u32,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl OutboundRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// Send one request and return the response status code.
    /// Only transport-level failures are errors.
    async fn post(&self, request: &OutboundRequest) -> Result<u16, SimError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookTransport for ReqwestTransport {
    async fn post(&self, request: &OutboundRequest) -> Result<u16, SimError> {
        let mut builder = self
            .client
            .post(&request.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| SimError::Transport(e.to_string()))?;
        Ok(resp.status().as_u16())
    }
}

pub struct WebhookService {
    config: watch::Sender<WebhookConfig>,
    history: RwLock<VecDeque<WebhookEvent>>,
    transport: Arc<dyn WebhookTransport>,
    hub: Arc<BroadcastHub>,
    backoff_base: Duration,
}

impl WebhookService {
    pub fn new(
        config: WebhookConfig,
        transport: Arc<dyn WebhookTransport>,
        hub: Arc<BroadcastHub>,
    ) -> Self {
        let (config, _) = watch::channel(config);
        Self {
            config,
            history: RwLock::new(VecDeque::with_capacity(HISTORY_LIMIT)),
            transport,
            hub,
            backoff_base: Duration::from_secs(1),
        }
    }

    /// Redacted view of the live config.
    pub fn get_config(&self) -> WebhookConfigView {
        self.config.borrow().view()
    }

    /// Merge `update` into the live config in one step and return the new view.
    pub fn update_config(&self, update: WebhookConfigUpdate) -> WebhookConfigView {
        self.config.send_modify(|cfg| cfg.apply(update));
        let view = self.get_config();
        info!(
            url_configured = view.url_configured,
            enabled = view.enabled,
            retries = view.retries,
            timeout_ms = view.timeout_ms,
            "webhook config updated"
        );
        view
    }

    /// Newest first.
    pub async fn history(&self) -> Vec<WebhookEvent> {
        self.history.read().await.iter().cloned().collect()
    }

    pub async fn clear_history(&self) {
        self.history.write().await.clear();
        self.hub.publish_global(HubEvent::WebhookHistoryCleared).await;
    }

    pub async fn deliver(&self, message: &Message) -> WebhookEvent {
        // Snapshot so one delivery sees one config throughout its retries.
        let config = self.config.borrow().clone();
        let timestamp = Utc::now();
        let started = Instant::now();
        let payload = WebhookPayload::from(message);

        let (status, attempts, error) = match config.target() {
            Some(url) => self.attempt_all(url, &config, &payload).await,
            None => {
                let reason = if config.enabled { NOT_CONFIGURED } else { DISABLED };
                let err = SimError::Configuration(reason.to_string());
                info!(message_id = %message.id, "webhook skipped: {err}");
                (DeliveryStatus::Skipped, 0, Some(err.to_string()))
            }
        };

        let event = WebhookEvent {
            id: format!("wh_{}", Uuid::new_v4().simple()),
            url: config.target().map(str::to_string),
            payload,
            status,
            attempts,
            duration_ms: started.elapsed().as_millis() as u64,
            error,
            timestamp,
        };

        self.record(event.clone()).await;
        self.hub
            .publish_global(HubEvent::WebhookDelivery(event.clone()))
            .await;
        event
    }

    async fn attempt_all(
        &self,
        url: &str,
        config: &WebhookConfig,
        payload: &WebhookPayload,
    ) -> (DeliveryStatus, u32, Option<String>) {
        let body = match serde_json::to_vec(payload) {
            Ok(b) => b,
            Err(e) => return (DeliveryStatus::NoResponse, 0, Some(e.to_string())),
        };
        let signature = config.secret.as_deref().map(|s| sign_body(s, &body));
        let timeout = Duration::from_millis(config.timeout_ms);
        let retries = config.retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=retries {
            let mut headers = vec![
                (
                    MARKER_HEADER.to_string(),
                    concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
                ),
                (ATTEMPT_HEADER.to_string(), attempt.to_string()),
            ];
            if let Some(sig) = &signature {
                headers.push((SIGNATURE_HEADER.to_string(), sig.clone()));
            }
            let request = OutboundRequest {
                url: url.to_string(),
                attempt,
                headers,
                body: body.clone(),
            };

            match tokio::time::timeout(timeout, self.transport.post(&request)).await {
                Ok(Ok(code)) => {
                    let status = DeliveryStatus::Http(code);
                    if status.is_success() {
                        info!(payload_id = %payload.id, attempt, code, "webhook delivered");
                        return (status, attempt, None);
                    }
                    warn!(
                        payload_id = %payload.id,
                        attempt,
                        code,
                        "webhook endpoint returned an error"
                    );
                    return (status, attempt, Some(format!("HTTP {code}")));
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("request timed out after {}ms", config.timeout_ms)
                }
            }
            warn!(
                payload_id = %payload.id,
                attempt,
                retries,
                error = %last_error,
                "webhook attempt failed"
            );

            if attempt < retries {
                tokio::time::sleep(self.backoff_delay(attempt)).await;
            }
        }

        (DeliveryStatus::NoResponse, retries, Some(last_error))
    }

    /// Wait after failed attempt `attempt` (1-based): 1s, 2s, 4s, ...
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(factor)
    }

    async fn record(&self, event: WebhookEvent) {
        let mut history = self.history.write().await;
        history.push_front(event);
        history.truncate(HISTORY_LIMIT);
    }
}
