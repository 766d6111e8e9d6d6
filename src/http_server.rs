use crate::engine::Simulator;
use crate::error::SimError;
use crate::hub::{SubscriberId, Subscription};
use crate::types::{
    Message, MessageFilter, MessageStatus, NewMessage, Pagination, ReplyRequest,
    WebhookConfigUpdate, DEFAULT_PAGE_LIMIT,
};
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type AppState = Arc<Simulator>;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "validation_error",
            message: message.into(),
        }
    }
}

impl From<SimError> for ApiError {
    fn from(err: SimError) -> Self {
        let status = match &err {
            SimError::Validation(_) => StatusCode::BAD_REQUEST,
            SimError::NotFound { .. } | SimError::ConversationNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            SimError::Transport(_) => StatusCode::BAD_GATEWAY,
            SimError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "kind": self.kind,
                "message": self.message,
                "timestamp": Utc::now().to_rfc3339(),
            }
        });
        (self.status, Json(body)).into_response()
    }
}

// ─── Server ──────────────────────────────────────────────────────────────────

pub fn router(sim: Arc<Simulator>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route(
            "/api/messages",
            post(create_message).get(list_messages).delete(clear_messages),
        )
        .route("/api/messages/export", get(export_messages))
        .route("/api/messages/{id}", get(get_message).delete(delete_message))
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations/{phone}", get(get_conversation))
        .route("/api/replies", post(submit_reply))
        .route(
            "/api/webhook/config",
            get(get_webhook_config).put(update_webhook_config),
        )
        .route(
            "/api/webhook/history",
            get(get_webhook_history).delete(clear_webhook_history),
        )
        .route("/api/webhook/test", post(test_webhook))
        .route("/ws", get(ws_upgrade))
        .with_state(sim)
}

/// Bind `addr` and serve in the background. Returns the bound address.
pub async fn start(
    sim: Arc<Simulator>,
    addr: SocketAddr,
) -> Result<(SocketAddr, JoinHandle<()>), String> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| format!("failed to bind HTTP server on {addr}: {e}"))?;
    let local = listener
        .local_addr()
        .map_err(|e| format!("failed to read bound address: {e}"))?;
    info!(%local, "HTTP server bound");

    let app = router(sim);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {e}");
        }
    });
    Ok((local, handle))
}

// ─── Query parsing ───────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    search: Option<String>,
    status: Option<String>,
    phone: Option<String>,
    date_from: Option<String>,
    date_to: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
    format: Option<String>,
}

impl ListParams {
    fn filter(&self) -> Result<MessageFilter, ApiError> {
        let status = match self.status.as_deref().filter(|s| !s.is_empty()) {
            Some(s) => Some(
                MessageStatus::parse(s)
                    .ok_or_else(|| ApiError::bad_request(format!("unknown status: {s}")))?,
            ),
            None => None,
        };
        Ok(MessageFilter {
            search: self.search.clone().filter(|s| !s.is_empty()),
            status,
            phone: self.phone.clone().filter(|s| !s.is_empty()),
            date_from: parse_date(self.date_from.as_deref(), false)?,
            date_to: parse_date(self.date_to.as_deref(), true)?,
        })
    }

    fn pagination(&self) -> Pagination {
        Pagination::new(
            self.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
            self.offset.unwrap_or(0),
        )
    }
}

/// Accepts RFC 3339 or a bare `YYYY-MM-DD`. A bare upper bound covers the whole day.
fn parse_date(raw: Option<&str>, end_of_day: bool) -> Result<Option<DateTime<Utc>>, ApiError> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(Some(dt.with_timezone(&Utc)));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ApiError::bad_request(format!("invalid date: {raw}")))?;
    let time = if end_of_day {
        date.and_hms_milli_opt(23, 59, 59, 999)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    Ok(time.map(|t| t.and_utc()))
}

// ─── Handlers ────────────────────────────────────────────────────────────────

async fn health(State(sim): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "messages": sim.store().len().await,
        "subscribers": sim.hub().subscriber_count().await,
        "webhook": sim.webhooks().get_config(),
    }))
}

async fn create_message(
    State(sim): State<AppState>,
    body: Result<Json<NewMessage>, JsonRejection>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    let Json(req) = body?;
    let msg = sim.send_message(req).await?;
    Ok((StatusCode::CREATED, Json(msg)))
}

async fn list_messages(
    State(sim): State<AppState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Query(params) = params?;
    let filter = params.filter()?;
    let page = sim.store().list(&filter, params.pagination()).await;
    Ok(Json(json!(page)))
}

async fn export_messages(
    State(sim): State<AppState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = params?;
    let filter = params.filter()?;
    let messages = sim.store().export(&filter).await;
    match params.format.as_deref().unwrap_or("json") {
        "json" => Ok(Json(messages).into_response()),
        "csv" => Ok((
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"messages.csv\"",
                ),
            ],
            to_csv(&messages),
        )
            .into_response()),
        other => Err(ApiError::bad_request(format!("unknown export format: {other}"))),
    }
}

async fn get_message(
    State(sim): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Message>, ApiError> {
    Ok(Json(sim.store().get(&id).await?))
}

async fn delete_message(
    State(sim): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Message>, ApiError> {
    Ok(Json(sim.delete_message(&id).await?))
}

async fn clear_messages(State(sim): State<AppState>) -> Json<serde_json::Value> {
    let removed = sim.clear_messages().await;
    Json(json!({ "deleted": removed }))
}

async fn list_conversations(State(sim): State<AppState>) -> Json<serde_json::Value> {
    let conversations = sim.conversations().list_conversations().await;
    Json(json!({ "conversations": conversations, "count": conversations.len() }))
}

async fn get_conversation(
    State(sim): State<AppState>,
    Path(phone): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conversation = sim.conversations().conversation(&phone).await;
    match conversation {
        Some(conv) => Ok(Json(json!(conv))),
        None => Err(SimError::ConversationNotFound { phone }.into()),
    }
}

async fn submit_reply(
    State(sim): State<AppState>,
    body: Result<Json<ReplyRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    let Json(req) = body?;
    let msg = sim.submit_reply(req, None).await?;
    Ok((StatusCode::CREATED, Json(msg)))
}

async fn get_webhook_config(State(sim): State<AppState>) -> Json<serde_json::Value> {
    Json(json!(sim.webhooks().get_config()))
}

async fn update_webhook_config(
    State(sim): State<AppState>,
    body: Result<Json<WebhookConfigUpdate>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(update) = body?;
    if let Some(url) = update.url.as_deref().filter(|u| !u.is_empty()) {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ApiError::bad_request(format!(
                "webhook url must start with http:// or https://, got {url}"
            )));
        }
    }
    Ok(Json(json!(sim.webhooks().update_config(update))))
}

async fn get_webhook_history(State(sim): State<AppState>) -> Json<serde_json::Value> {
    let events = sim.webhooks().history().await;
    Json(json!({ "events": events, "count": events.len() }))
}

async fn clear_webhook_history(State(sim): State<AppState>) -> StatusCode {
    sim.webhooks().clear_history().await;
    StatusCode::NO_CONTENT
}

async fn test_webhook(State(sim): State<AppState>) -> Json<serde_json::Value> {
    Json(json!(sim.send_test_webhook().await))
}

// ─── CSV ─────────────────────────────────────────────────────────────────────

const CSV_HEADER: &str = "id,to,from,body,status,direction,created_at,delivered_at,cost";

fn to_csv(messages: &[Message]) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push_str("\r\n");
    for m in messages {
        let direction = serde_json::to_value(m.direction)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let row = [
            csv_field(&m.id),
            csv_field(&m.to),
            csv_field(&m.from),
            csv_field(&m.body),
            m.status.as_str().to_string(),
            direction,
            m.created_at.to_rfc3339(),
            m.delivered_at.map(|d| d.to_rfc3339()).unwrap_or_default(),
            m.cost.to_string(),
        ];
        out.push_str(&row.join(","));
        out.push_str("\r\n");
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

// ─── Viewer socket ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Join { phone: String },
    Leave { phone: String },
    Reply { to: String, from: String, body: String },
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(sim): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| viewer_session(socket, sim))
}

async fn viewer_session(socket: WebSocket, sim: Arc<Simulator>) {
    let Subscription { id, mut events } = sim.hub().connect().await;
    let (mut sink, mut stream) = socket.split();

    let forward = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(t) => t,
                Err(e) => {
                    warn!(subscriber = id, "failed to encode hub event: {e}");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = stream.next().await {
        match frame {
            WsMessage::Text(text) => {
                if let Err(e) = handle_frame(&sim, id, text.as_str()).await {
                    warn!(subscriber = id, "rejected viewer frame: {e}");
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    sim.hub().disconnect(id).await;
    forward.abort();
    debug!(subscriber = id, "viewer session ended");
}

async fn handle_frame(sim: &Simulator, id: SubscriberId, text: &str) -> Result<(), SimError> {
    let frame: ClientFrame = serde_json::from_str(text)
        .map_err(|e| SimError::Validation(format!("malformed frame: {e}")))?;
    match frame {
        ClientFrame::Join { phone } => {
            sim.hub().join(id, &phone).await;
        }
        ClientFrame::Leave { phone } => sim.hub().leave(id, &phone).await,
        ClientFrame::Reply { to, from, body } => {
            sim.submit_reply(ReplyRequest { to, from, body }, Some(id))
                .await?;
        }
    }
    Ok(())
}
