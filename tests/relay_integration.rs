//! Integration tests for the gateway, hub and bindings.
//!
//! Each test starts the gateway on a random port and talks to it over real
//! HTTP. The Telegram tests point the binding at an in-process fake Bot API.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::Uri;
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use channel_relay::channels::{Binding, MemoryBinding, TelegramBinding};
use channel_relay::config::RenderPolicy;
use channel_relay::engine::EchoEngine;
use channel_relay::gateway::{Gateway, GatewayHandle};
use channel_relay::hub::{ChannelHub, WebhookRoute};
use channel_relay::render::{RenderInstruction, Renderer};
use channel_relay::router::{ChannelPattern, CrossChannelRouter, SEND_SECRET_HEADER, SendRoute};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const SECRET: &str = "s3cret";

fn hub() -> Arc<ChannelHub> {
    ChannelHub::new(Arc::new(EchoEngine::new()), RenderPolicy::default(), 5)
}

async fn start(gateway: &Gateway) -> (String, GatewayHandle) {
    let handle = gateway.start(0).await.unwrap();
    let base = format!("http://127.0.0.1:{}", handle.local_addr().port());
    (base, handle)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(TEST_TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ── Fake Bot API ────────────────────────────────────────────────────

const TELEGRAM_LIMIT: usize = 4096;

#[derive(Clone, Default)]
struct FakeApi {
    calls: Arc<Mutex<Vec<(String, Value)>>>,
    next_id: Arc<AtomicI64>,
    /// Messages currently in the chat, by message id.
    live: Arc<Mutex<BTreeMap<i64, String>>>,
}

impl FakeApi {
    fn count(&self, method: &str) -> usize {
        self.methods().iter().filter(|m| *m == method).count()
    }

    fn live_messages(&self) -> Vec<String> {
        self.live.lock().unwrap().values().cloned().collect()
    }

    fn live_chars(&self, ch: char) -> usize {
        self.live_messages()
            .iter()
            .map(|m| m.chars().filter(|c| *c == ch).count())
            .sum()
    }

    fn methods(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(m, _)| m.clone()).collect()
    }

    fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

async fn fake_method(State(api): State<FakeApi>, uri: Uri, body: Bytes) -> Json<Value> {
    let method = uri.path().rsplit('/').next().unwrap_or_default().to_string();
    let payload: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    api.calls.lock().unwrap().push((method.clone(), payload.clone()));

    let text = payload["text"].as_str().unwrap_or_default().to_string();
    if text.chars().count() > TELEGRAM_LIMIT {
        return Json(json!({ "ok": false, "description": "Bad Request: message is too long" }));
    }
    let message_id = match &payload["message_id"] {
        Value::String(s) => s.parse::<i64>().ok(),
        other => other.as_i64(),
    };

    match method.as_str() {
        "sendMessage" | "sendDocument" => {
            let id = api.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            api.live.lock().unwrap().insert(id, text);
            Json(json!({ "ok": true, "result": { "message_id": id } }))
        }
        "editMessageText" => {
            let mut live = api.live.lock().unwrap();
            match message_id.and_then(|id| live.get_mut(&id)) {
                Some(current) => {
                    *current = text;
                    Json(json!({ "ok": true, "result": true }))
                }
                None => Json(json!({ "ok": false, "description": "Bad Request: message to edit not found" })),
            }
        }
        "deleteMessage" => {
            let removed = message_id.and_then(|id| api.live.lock().unwrap().remove(&id));
            match removed {
                Some(_) => Json(json!({ "ok": true, "result": true })),
                None => Json(json!({ "ok": false, "description": "Bad Request: message to delete not found" })),
            }
        }
        "getMe" => Json(json!({ "ok": true, "result": { "username": "relay_bot" } })),
        _ => Json(json!({ "ok": true, "result": true })),
    }
}

async fn start_fake_api() -> (String, FakeApi) {
    let api = FakeApi::default();
    let app = axum::Router::new().fallback(fake_method).with_state(api.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://127.0.0.1:{port}"), api)
}

fn private_update(chat_id: i64, text: &str) -> Value {
    json!({
        "update_id": 1,
        "message": {
            "message_id": 10,
            "date": 1_700_000_000,
            "from": { "id": 7, "username": "alice", "is_bot": false },
            "chat": { "id": chat_id, "type": "private" },
            "text": text,
        }
    })
}

fn telegram_renderer(api_base: String) -> Renderer {
    let binding: Arc<dyn Binding> = Arc::new(
        TelegramBinding::new(SecretString::from("test-token"), vec!["*".to_string()])
            .with_api_base(api_base),
    );
    Renderer::spawn(binding, "tg:42", RenderPolicy::default())
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn local_webhook_is_unavailable_until_ready() {
    let hub = hub();
    let local = Arc::new(MemoryBinding::new("local"));
    let mut gateway = Gateway::new("relay", 64 * 1024).with_coordinator(Arc::clone(hub.coordinator()));
    gateway
        .register("/hooks/local", Arc::new(WebhookRoute::new(local.clone(), hub.clone())))
        .unwrap();
    let (base, handle) = start(&gateway).await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["routes"]["/hooks/local"], false);

    let body = json!({ "channel_id": "dev", "text": "hi" });
    let resp = client
        .post(format!("{base}/hooks/local"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);

    gateway.mark_ready("/hooks/local");
    let resp = client
        .post(format!("{base}/hooks/local"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let reply: Value = resp.json().await.unwrap();
    assert_eq!(reply["dispatch"], "queued");

    eventually(|| local.visible_messages() == vec!["You said: hi"]).await;
    eventually(|| !hub.coordinator().is_running("dev")).await;

    let resp = client
        .post(format!("{base}/hooks/local"))
        .body("{ not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    handle.shutdown();
}

#[tokio::test]
async fn telegram_webhook_runs_end_to_end() {
    let (api_base, api) = start_fake_api().await;
    let hub = hub();
    let telegram = Arc::new(
        TelegramBinding::new(SecretString::from("test-token"), vec!["*".to_string()])
            .with_webhook_secret(SecretString::from(SECRET))
            .with_api_base(api_base),
    );
    telegram.connect().await.unwrap();

    let mut gateway = Gateway::new("relay", 64 * 1024);
    gateway
        .register("/hooks/telegram", Arc::new(WebhookRoute::new(telegram.clone(), hub.clone())))
        .unwrap();
    gateway.mark_ready("/hooks/telegram");
    let (base, handle) = start(&gateway).await;
    let client = reqwest::Client::new();
    let url = format!("{base}/hooks/telegram");

    // Wrong secret never reaches the queue.
    let resp = client
        .post(&url)
        .header("X-Telegram-Bot-Api-Secret-Token", "wrong")
        .json(&private_update(42, "hello"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .post(&url)
        .header("X-Telegram-Bot-Api-Secret-Token", SECRET)
        .body("garbage")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(&url)
        .header("X-Telegram-Bot-Api-Secret-Token", SECRET)
        .json(&private_update(42, "hello"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    eventually(|| api.methods().iter().any(|m| m == "deleteMessage")).await;
    eventually(|| !hub.coordinator().is_running("tg:42")).await;

    let calls = api.calls();
    let methods: Vec<&str> = calls.iter().map(|(m, _)| m.as_str()).collect();
    assert_eq!(
        methods,
        vec!["getMe", "sendChatAction", "sendMessage", "sendMessage", "deleteMessage"]
    );
    let (_, answer) = &calls[3];
    assert_eq!(answer["chat_id"], "42");
    assert_eq!(answer["text"], "You said: hello");

    handle.shutdown();
}

#[tokio::test]
async fn send_route_reports_structured_outcomes() {
    let local = Arc::new(MemoryBinding::new("local"));
    let router = Arc::new(
        CrossChannelRouter::new().with_rule(ChannelPattern::Prefix("dev:".into()), local.clone()),
    );
    let mut gateway = Gateway::new("relay", 64 * 1024);
    gateway
        .register(
            "/send",
            Arc::new(SendRoute::new(router).with_secret(SecretString::from(SECRET))),
        )
        .unwrap();
    gateway.mark_ready("/send");
    let (base, handle) = start(&gateway).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/send"))
        .json(&json!({ "channel_id": "dev:ops", "text": "unauthenticated" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    assert!(local.operations().is_empty());

    let sent: Value = client
        .post(format!("{base}/send"))
        .header(SEND_SECRET_HEADER, SECRET)
        .json(&json!({ "channel_id": "dev:ops", "text": "deploy finished" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(sent["status"], "sent");
    assert_eq!(sent["destination"], "dev:ops");
    assert_eq!(local.visible_messages(), vec!["deploy finished"]);

    let failed: Value = client
        .post(format!("{base}/send"))
        .header(SEND_SECRET_HEADER, SECRET)
        .json(&json!({ "channel_id": "elsewhere", "text": "hi" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(failed["status"], "failed");

    handle.shutdown();
}

#[tokio::test]
async fn bind_failure_is_reported() {
    let taken = TcpListener::bind("0.0.0.0:0").await.unwrap();
    let port = taken.local_addr().unwrap().port();

    let gateway = Gateway::new("relay", 1024);
    let err = gateway.start(port).await.err().expect("port already in use");
    assert!(err.to_string().contains(&port.to_string()));
}

// ── Telegram size limits ────────────────────────────────────────────

#[tokio::test]
async fn telegram_long_answer_is_chunked_and_delete_removes_every_chunk() {
    let (api_base, api) = start_fake_api().await;
    let renderer = telegram_renderer(api_base);

    renderer.apply(RenderInstruction::Replace("word ".repeat(1200)));
    renderer.settled().await;
    assert_eq!(api.count("sendMessage"), 2);
    let words: usize = api
        .live_messages()
        .iter()
        .map(|m| m.split_whitespace().count())
        .sum();
    assert_eq!(words, 1200);

    renderer.apply(RenderInstruction::Delete);
    timeout(TEST_TIMEOUT, renderer.finalize()).await.unwrap();

    assert_eq!(api.count("deleteMessage"), 2);
    assert!(api.live_messages().is_empty());
}

#[tokio::test]
async fn telegram_long_answer_over_live_stream_is_delivered_in_full() {
    let (api_base, api) = start_fake_api().await;
    let renderer = telegram_renderer(api_base);

    renderer.apply(RenderInstruction::ContentAppend("x".repeat(100)));
    renderer.apply(RenderInstruction::Replace("y".repeat(6000)));
    timeout(TEST_TIMEOUT, renderer.finalize()).await.unwrap();

    assert_eq!(
        api.methods(),
        vec!["sendMessage", "editMessageText", "sendMessage"]
    );
    assert_eq!(api.live_chars('y'), 6000);
    assert_eq!(api.live_chars('x'), 0);
}

#[tokio::test]
async fn telegram_demoted_stream_is_delivered_in_full() {
    let (api_base, api) = start_fake_api().await;
    let renderer = telegram_renderer(api_base);

    renderer.apply(RenderInstruction::StatusUpdate("thinking".into()));
    renderer.apply(RenderInstruction::ContentAppend("z".repeat(5000)));
    timeout(TEST_TIMEOUT, renderer.finalize()).await.unwrap();

    assert_eq!(api.live_chars('z'), 5000);
    // The status message only carried progress, so it is gone.
    assert!(!api.live_messages().iter().any(|m| m.contains("thinking")));
    assert!(
        api.calls()
            .iter()
            .all(|(_, body)| body["text"].as_str().map_or(0, |t| t.chars().count()) <= TELEGRAM_LIMIT)
    );
}
