use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SimError;

/// Maximum SMS body length accepted at ingress (10 concatenated segments).
pub const MAX_BODY_LEN: usize = 1600;

/// Simulated per-message price in USD.
pub const MESSAGE_COST: f64 = 0.0075;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Queued,
    Sent,
    Delivered,
    Failed,
}

impl MessageStatus {
    fn rank(self) -> u8 {
        match self {
            MessageStatus::Queued => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered | MessageStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Delivered | MessageStatus::Failed)
    }

    /// Statuses only move forward; terminal statuses never change.
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Queued => "queued",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Some(MessageStatus::Queued),
            "sent" => Some(MessageStatus::Sent),
            "delivered" => Some(MessageStatus::Delivered),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Sent by the developer's application through the API.
    Outbound,
    /// Typed by a viewer on behalf of the simulated handset.
    Inbound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub to: String,
    pub from: String,
    pub body: String,
    pub status: MessageStatus,
    pub direction: Direction,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub cost: f64,
}

/// Ingress request for an outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub to: String,
    #[serde(default)]
    pub from: Option<String>,
    pub body: String,
}

impl NewMessage {
    pub fn new(to: impl Into<String>, from: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            from: Some(from.into()),
            body: body.into(),
        }
    }

    pub fn validate(&self) -> Result<(), SimError> {
        validate_parts(&self.to, &self.body)
    }
}

/// A reply typed by a viewer, relayed into the system as an inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyRequest {
    pub to: String,
    pub from: String,
    pub body: String,
}

impl ReplyRequest {
    pub fn validate(&self) -> Result<(), SimError> {
        validate_parts(&self.to, &self.body)?;
        if self.from.trim().is_empty() {
            return Err(SimError::Validation("missing required field: from".into()));
        }
        Ok(())
    }
}

fn validate_parts(to: &str, body: &str) -> Result<(), SimError> {
    if to.trim().is_empty() {
        return Err(SimError::Validation("missing required field: to".into()));
    }
    if body.trim().is_empty() {
        return Err(SimError::Validation("missing required field: body".into()));
    }
    let len = body.chars().count();
    if len > MAX_BODY_LEN {
        return Err(SimError::Validation(format!(
            "body is {len} characters, maximum is {MAX_BODY_LEN}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageFilter {
    /// Case-insensitive substring over `to`, `from` and `body`.
    pub search: Option<String>,
    pub status: Option<MessageStatus>,
    /// Substring matched against either party.
    pub phone: Option<String>,
    /// Inclusive lower bound on `created_at`.
    pub date_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`.
    pub date_to: Option<DateTime<Utc>>,
}

impl MessageFilter {
    pub fn matches(&self, msg: &Message) -> bool {
        if let Some(search) = self.search.as_deref().filter(|s| !s.is_empty()) {
            let needle = search.to_lowercase();
            let hit = msg.to.to_lowercase().contains(&needle)
                || msg.from.to_lowercase().contains(&needle)
                || msg.body.to_lowercase().contains(&needle);
            if !hit {
                return false;
            }
        }
        if let Some(status) = self.status {
            if msg.status != status {
                return false;
            }
        }
        if let Some(phone) = self.phone.as_deref().filter(|s| !s.is_empty()) {
            if !msg.to.contains(phone) && !msg.from.contains(phone) {
                return false;
            }
        }
        if let Some(from) = self.date_from {
            if msg.created_at < from {
                return false;
            }
        }
        if let Some(to) = self.date_to {
            if msg.created_at > to {
                return false;
            }
        }
        true
    }
}

pub const MAX_PAGE_LIMIT: usize = 100;
pub const DEFAULT_PAGE_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pagination {
    pub limit: usize,
    pub offset: usize,
}

impl Pagination {
    /// Clamps `limit` into `1..=100`.
    pub fn new(limit: usize, offset: usize) -> Self {
        Self {
            limit: limit.clamp(1, MAX_PAGE_LIMIT),
            offset,
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_LIMIT, 0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MessagePage {
    pub items: Vec<Message>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
    pub has_more: bool,
}

/// Messages grouped by counterparty number. Rebuilt from the store on every read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conversation {
    pub phone_number: String,
    pub messages: Vec<Message>,
    pub last_activity: DateTime<Utc>,
}

// ─── Webhooks ────────────────────────────────────────────────────────────────

pub const DEFAULT_WEBHOOK_RETRIES: u32 = 3;
pub const DEFAULT_WEBHOOK_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: Option<String>,
    pub enabled: bool,
    pub retries: u32,
    pub timeout_ms: u64,
    pub secret: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            enabled: true,
            retries: DEFAULT_WEBHOOK_RETRIES,
            timeout_ms: DEFAULT_WEBHOOK_TIMEOUT_MS,
            secret: None,
        }
    }
}

impl WebhookConfig {
    /// The URL to deliver to, if delivery is currently possible.
    pub fn target(&self) -> Option<&str> {
        if !self.enabled {
            return None;
        }
        self.url.as_deref().filter(|u| !u.trim().is_empty())
    }

    /// Merge a partial update. An empty string clears `url` or `secret`.
    pub fn apply(&mut self, update: WebhookConfigUpdate) {
        if let Some(url) = update.url {
            self.url = Some(url).filter(|u| !u.trim().is_empty());
        }
        if let Some(enabled) = update.enabled {
            self.enabled = enabled;
        }
        if let Some(retries) = update.retries {
            self.retries = retries.max(1);
        }
        if let Some(timeout_ms) = update.timeout_ms {
            self.timeout_ms = timeout_ms.max(1);
        }
        if let Some(secret) = update.secret {
            self.secret = Some(secret).filter(|s| !s.is_empty());
        }
    }

    pub fn view(&self) -> WebhookConfigView {
        WebhookConfigView {
            url_configured: self.url.is_some(),
            enabled: self.enabled,
            retries: self.retries,
            timeout_ms: self.timeout_ms,
            secret_configured: self.secret.is_some(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfigUpdate {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub secret: Option<String>,
}

/// Outward-facing config: reports presence of the URL and secret, never their values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookConfigView {
    pub url_configured: bool,
    pub enabled: bool,
    pub retries: u32,
    pub timeout_ms: u64,
    pub secret_configured: bool,
}

/// JSON body POSTed to the developer's endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub id: String,
    pub to: String,
    pub from: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
}

impl From<&Message> for WebhookPayload {
    fn from(msg: &Message) -> Self {
        Self {
            id: msg.id.clone(),
            to: msg.to.clone(),
            from: msg.from.clone(),
            body: msg.body.clone(),
            received_at: msg.delivered_at.unwrap_or(msg.created_at),
            kind: "sms".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Delivery disabled or no URL configured; nothing was sent.
    Skipped,
    /// Every attempt failed at the transport level or timed out.
    NoResponse,
    /// The endpoint answered with this HTTP status code.
    Http(u16),
}

impl DeliveryStatus {
    pub fn is_success(self) -> bool {
        matches!(self, DeliveryStatus::Http(code) if (200..300).contains(&code))
    }
}

/// One logical delivery, covering all of its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    pub url: Option<String>,
    pub payload: WebhookPayload,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// ─── Hub events ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum HubEvent {
    #[serde(rename = "message:new")]
    MessageNew(Message),
    #[serde(rename = "message:updated")]
    MessageUpdated(Message),
    #[serde(rename = "webhook:delivery")]
    WebhookDelivery(WebhookEvent),
    #[serde(rename = "webhook:history_cleared")]
    WebhookHistoryCleared,
    #[serde(rename = "messages:cleared")]
    MessagesCleared,
}
