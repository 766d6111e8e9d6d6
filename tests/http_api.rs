use axum::{extract::State, http::HeaderMap, http::StatusCode, routing::post, Router};
use nexus_sms_simulator::lifecycle::LifecycleTiming;
use nexus_sms_simulator::types::{DeliveryStatus, WebhookConfig};
use nexus_sms_simulator::webhook::ATTEMPT_HEADER;
use nexus_sms_simulator::{http_server, Simulator, SimulatorConfig};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

fn fast_config(webhook: WebhookConfig) -> SimulatorConfig {
    SimulatorConfig {
        lifecycle: LifecycleTiming {
            sent_after: Duration::from_millis(20),
            delivered_after: Duration::from_millis(20),
            failure_rate: 0.0,
        },
        webhook,
        ..Default::default()
    }
}

async fn spawn_simulator(config: SimulatorConfig) -> (String, Arc<Simulator>) {
    let sim = Arc::new(Simulator::new(config));
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let (local, _handle) = http_server::start(sim.clone(), addr).await.unwrap();
    (format!("http://{local}"), sim)
}

#[derive(Clone, Default)]
struct Receiver {
    hits: Arc<Mutex<Vec<(HeaderMap, Value)>>>,
}

/// Local endpoint standing in for the developer's application.
async fn spawn_receiver(status: StatusCode) -> (String, Receiver) {
    let receiver = Receiver::default();
    let app = Router::new()
        .route(
            "/sms",
            post(
                move |State(r): State<Receiver>,
                      headers: HeaderMap,
                      body: axum::Json<Value>| async move {
                    r.hits.lock().unwrap().push((headers, body.0));
                    status
                },
            ),
        )
        .with_state(receiver.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://127.0.0.1:{port}/sms"), receiver)
}

#[tokio::test]
async fn send_returns_queued_then_delivers() {
    let (base, _sim) = spawn_simulator(fast_config(WebhookConfig::default())).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/api/messages"))
        .json(&json!({ "to": "+15550001111", "from": "+15551234567", "body": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let created: Value = resp.json().await.unwrap();
    assert_eq!(created["status"], "queued");
    let id = created["id"].as_str().unwrap().to_string();

    let mut status = String::new();
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let msg: Value = client
            .get(format!("{base}/api/messages/{id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        status = msg["status"].as_str().unwrap().to_string();
        if status == "delivered" {
            assert!(msg["delivered_at"].is_string());
            break;
        }
    }
    assert_eq!(status, "delivered");
}

#[tokio::test]
async fn invalid_send_returns_structured_error() {
    let (base, _sim) = spawn_simulator(fast_config(WebhookConfig::default())).await;
    let resp = reqwest::Client::new()
        .post(format!("{base}/api/messages"))
        .json(&json!({ "to": "", "body": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "validation_error");
    assert!(body["error"]["timestamp"].is_string());

    let resp = reqwest::Client::new()
        .get(format!("{base}/api/messages/SMnope"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "not_found");
}

#[tokio::test]
async fn listing_paginates_and_exports() {
    let (base, _sim) = spawn_simulator(fast_config(WebhookConfig::default())).await;
    let client = reqwest::Client::new();
    for i in 0..3 {
        client
            .post(format!("{base}/api/messages"))
            .json(&json!({ "to": "+15550001111", "body": format!("msg, {i}") }))
            .send()
            .await
            .unwrap();
    }

    let page: Value = client
        .get(format!("{base}/api/messages?limit=2&offset=0"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["total"], 3);
    assert_eq!(page["has_more"], true);
    assert_eq!(page["items"][0]["body"], "msg, 2");

    let csv = client
        .get(format!("{base}/api/messages/export?format=csv"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with("id,to,from,body"));
    assert!(lines[1].contains("\"msg, 0\""));

    let convs: Value = client
        .get(format!("{base}/api/conversations"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(convs["count"], 1);
    assert_eq!(convs["conversations"][0]["phone_number"], "+15550001111");
}

#[tokio::test]
async fn malformed_query_and_unknown_conversation_are_structured() {
    let (base, _sim) = spawn_simulator(fast_config(WebhookConfig::default())).await;
    let client = reqwest::Client::new();

    for path in ["/api/messages?limit=abc", "/api/messages/export?offset=-1"] {
        let resp = client.get(format!("{base}{path}")).send().await.unwrap();
        assert_eq!(resp.status(), 400, "{path}");
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["kind"], "validation_error");
        assert!(body["error"]["timestamp"].is_string());
    }

    let resp = client
        .get(format!("{base}/api/conversations/+15550009999"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "not_found");
    let message = body["error"]["message"].as_str().unwrap();
    assert!(message.starts_with("conversation not found"), "{message}");
    assert!(message.contains("+15550009999"));
}

#[tokio::test]
async fn webhook_http_error_is_recorded_without_retry() {
    let (url, receiver) = spawn_receiver(StatusCode::INTERNAL_SERVER_ERROR).await;
    let (base, sim) = spawn_simulator(fast_config(WebhookConfig::default())).await;
    let client = reqwest::Client::new();

    let view: Value = client
        .put(format!("{base}/api/webhook/config"))
        .json(&json!({ "url": url, "timeout_ms": 1000 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(view["url_configured"], true);
    assert!(!view.to_string().contains("127.0.0.1"));

    let event: Value = client
        .post(format!("{base}/api/webhook/test"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(event["status"]["http"], 500);
    assert_eq!(event["attempts"], 1);
    assert!(event["error"].is_string());

    let hits = receiver.hits.lock().unwrap().clone();
    assert_eq!(hits.len(), 1);
    let (headers, body) = &hits[0];
    assert_eq!(headers[ATTEMPT_HEADER], "1");
    assert_eq!(headers["content-type"], "application/json");
    assert_eq!(body["type"], "sms");
    assert_eq!(sim.webhooks().history().await.len(), 1);
}

#[tokio::test]
async fn reply_is_delivered_to_webhook() {
    let (url, receiver) = spawn_receiver(StatusCode::OK).await;
    let (base, sim) = spawn_simulator(fast_config(WebhookConfig {
        url: Some(url),
        ..Default::default()
    }))
    .await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/api/replies"))
        .json(&json!({ "to": "+15550001111", "from": "+15551234567", "body": "YES" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let reply: Value = resp.json().await.unwrap();
    assert_eq!(reply["status"], "delivered");

    let mut history = Vec::new();
    for _ in 0..50 {
        history = sim.webhooks().history().await;
        if !history.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, DeliveryStatus::Http(200));
    assert_eq!(receiver.hits.lock().unwrap()[0].1["body"], "YES");
}

#[tokio::test]
async fn unreachable_webhook_gives_no_response() {
    // Bind then drop so the port refuses connections.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let (_base, sim) = spawn_simulator(fast_config(WebhookConfig {
        url: Some(format!("http://127.0.0.1:{port}/sms")),
        retries: 2,
        timeout_ms: 500,
        ..Default::default()
    }))
    .await;

    let event = sim.send_test_webhook().await;
    assert_eq!(event.status, DeliveryStatus::NoResponse);
    assert_eq!(event.attempts, 2);
    assert!(event.error.is_some());
    assert!(event.duration_ms >= 1000);
}
