#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use chatflow_core::adapters::{AdapterFactory, ApiEndpoints, HttpAdapterFactory};
use chatflow_core::cache::MemoryCache;
use chatflow_core::composer::SuccessStatusPolicy;
use chatflow_core::config::Config;
use chatflow_core::executor::ReqwestClient;
use chatflow_core::management::{BotLifecycle, Manager};
use chatflow_core::models::db::{Bot, Platform, PlatformBinding};
use chatflow_core::processors;
use chatflow_core::queue::{JobQueue, MemoryQueue};
use chatflow_core::storage::MemoryStorage;
use chatflow_core::template::Renderer;
use chatflow_core::{AppState, webhook};

pub const TELEGRAM_TOKEN: &str = "123:abc";
pub const KIK_USERNAME: &str = "permabot";
pub const KIK_API_KEY: &str = "api-key";
pub const MESSENGER_SECRET: &str = "app-secret";

/// An engine wired to in-memory storage, cache and queue, with every platform
/// API and third-party endpoint served by one mock server.
pub struct Harness {
    pub server: MockServer,
    pub state: Arc<AppState>,
    pub storage: Arc<MemoryStorage>,
    pub cache: Arc<MemoryCache>,
    pub queue: Arc<MemoryQueue>,
}

impl Harness {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        // Platform send and webhook calls all succeed.
        Mock::given(method("POST"))
            .and(path_regex(r"^/(bot[^/]+/|v1/|v2\.6/).*"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true, "result": {}})))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path_regex(r"^/v2\.6/.*"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .mount(&server)
            .await;

        let storage = Arc::new(MemoryStorage::new());
        let cache = Arc::new(MemoryCache::new());
        let queue = Arc::new(MemoryQueue::new(Duration::from_millis(10)));
        let http = reqwest::Client::new();
        let endpoints = ApiEndpoints::all(&server.uri());
        let adapters: Arc<dyn AdapterFactory> = Arc::new(
            HttpAdapterFactory::new(http.clone(), endpoints.clone())
                .with_messenger_app_secret(Some(MESSENGER_SECRET.to_string())),
        );

        let config = Config {
            public_base_url: Some("https://bots.example.com".to_string()),
            endpoints,
            messenger_app_secret: Some(MESSENGER_SECRET.to_string()),
            ..Config::default()
        };
        let state = Arc::new(AppState {
            config,
            storage: storage.clone(),
            cache: cache.clone(),
            queue: queue.clone(),
            http: Arc::new(ReqwestClient::from_client(http)),
            adapters,
            policy: Arc::new(SuccessStatusPolicy),
            renderer: Renderer::new(),
        });

        Self {
            server,
            state,
            storage,
            cache,
            queue,
        }
    }

    pub fn manager(&self) -> Manager<'_> {
        Manager::new(self.state.storage.as_ref(), &self.state.renderer)
    }

    /// Lifecycle without a public URL, so creating bindings does not call
    /// the platforms.
    pub fn quiet_lifecycle(&self) -> BotLifecycle {
        BotLifecycle::new(self.state.adapters.clone(), None)
    }

    pub fn api_url(&self, path: &str) -> String {
        format!("{}{path}", self.server.uri())
    }

    pub async fn bot_with_binding(&self, platform: Platform) -> (Bot, PlatformBinding) {
        let manager = self.manager();
        let bot = manager.create_bot("owner-1", "library").await.unwrap();
        let (token, username) = match platform {
            Platform::Telegram => (TELEGRAM_TOKEN, None),
            Platform::Kik => (KIK_API_KEY, Some(KIK_USERNAME)),
            Platform::Messenger => ("page-token", None),
        };
        let binding = manager
            .create_binding(&self.quiet_lifecycle(), &bot.id, platform, token, username)
            .await
            .unwrap();
        (bot, binding)
    }

    /// Runs every queued job to completion.
    pub async fn drain(&self) {
        loop {
            let batch = self.queue.next_batch().await.unwrap();
            if batch.is_empty() {
                break;
            }
            for delivery in batch {
                processors::process_delivery(self.state.clone(), delivery).await;
            }
        }
    }

    /// Sends a POST through the webhook router and returns the status with
    /// the JSON body (`Null` when the body is not JSON).
    pub async fn post(&self, uri: &str, headers: &[(&str, &str)], body: impl Into<Vec<u8>>) -> (StatusCode, Value) {
        let mut request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let request = request.body(Body::from(body.into())).unwrap();
        let response = webhook::router(self.state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    pub async fn post_json(&self, uri: &str, payload: &Value) -> (StatusCode, Value) {
        self.post(uri, &[], serde_json::to_vec(payload).unwrap()).await
    }

    /// Delivers a Telegram update through the webhook and runs the worker.
    pub async fn telegram(&self, binding: &PlatformBinding, payload: &Value) {
        let (status, _) = self.post_json(&format!("/telegram/{}/", binding.id), payload).await;
        assert_eq!(status, StatusCode::OK);
        self.drain().await;
    }

    /// Bodies of the requests the engine made to `path`, oldest first.
    pub async fn requests_to(&self, path: &str) -> Vec<Value> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|r| r.url.path() == path)
            .map(|r| serde_json::from_slice(&r.body).unwrap_or(Value::Null))
            .collect()
    }

    pub async fn telegram_sends(&self) -> Vec<Value> {
        self.requests_to(&format!("/bot{TELEGRAM_TOKEN}/sendMessage")).await
    }

    pub async fn telegram_texts(&self) -> Vec<String> {
        self.telegram_sends()
            .await
            .iter()
            .map(|b| b["text"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

pub fn telegram_update(update_id: i64, text: &str) -> Value {
    telegram_update_from(update_id, 100, 7, text)
}

pub fn telegram_update_from(update_id: i64, chat_id: i64, user_id: i64, text: &str) -> Value {
    json!({
        "update_id": update_id,
        "message": {
            "message_id": update_id * 10,
            "date": 1441645532,
            "from": {"id": user_id, "first_name": "John", "username": "john"},
            "chat": {"id": chat_id, "type": "private", "first_name": "John"},
            "text": text
        }
    })
}

pub fn kik_payload(id: &str, body: &str) -> Value {
    json!({
        "messages": [{
            "type": "text",
            "id": id,
            "chatId": "chat-kik-1",
            "from": "laura",
            "body": body,
            "timestamp": 1439576628405u64
        }]
    })
}

pub fn messenger_payload(mid: &str, text: &str) -> Value {
    json!({
        "object": "page",
        "entry": [{
            "id": "page-1",
            "time": 1458692752478u64,
            "messaging": [{
                "sender": {"id": "user-1"},
                "recipient": {"id": "page-1"},
                "timestamp": 1458692752478u64,
                "message": {"mid": mid, "text": text}
            }]
        }]
    })
}
