use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use sqlgate_model::{
    ModelError, ModelProvider, ModelSettings, Prompt, PromptPurpose, build_models,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

#[derive(Clone, Default)]
struct Captured {
    last_body: Arc<Mutex<Option<serde_json::Value>>>,
    last_headers: Arc<Mutex<Option<HeaderMap>>>,
    last_model_path: Arc<Mutex<Option<String>>>,
}

impl Captured {
    fn record(&self, headers: HeaderMap, body: serde_json::Value) {
        *self.last_headers.lock().expect("lock") = Some(headers);
        *self.last_body.lock().expect("lock") = Some(body);
    }

    fn body(&self) -> serde_json::Value {
        self.last_body.lock().expect("lock").clone().expect("body captured")
    }

    fn header(&self, name: &str) -> Option<String> {
        self.last_headers
            .lock()
            .expect("lock")
            .as_ref()
            .and_then(|h| h.get(name))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

async fn spawn_mock_provider(
    captured: Captured,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    async fn openai_chat(
        State(captured): State<Captured>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> Json<serde_json::Value> {
        captured.record(headers, body);
        Json(serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "SELECT 1" } }]
        }))
    }

    async fn anthropic_messages(
        State(captured): State<Captured>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> Json<serde_json::Value> {
        captured.record(headers, body);
        Json(serde_json::json!({
            "content": [
                { "type": "text", "text": "SAFE" },
                { "type": "text", "text": "" }
            ]
        }))
    }

    async fn google_generate(
        State(captured): State<Captured>,
        Path(model_action): Path<String>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> Json<serde_json::Value> {
        *captured.last_model_path.lock().expect("lock") = Some(model_action);
        captured.record(headers, body);
        Json(serde_json::json!({
            "candidates": [{ "content": { "parts": [{ "text": "YES" }] } }]
        }))
    }

    async fn overloaded() -> StatusCode {
        StatusCode::SERVICE_UNAVAILABLE
    }

    async fn slow() -> Json<serde_json::Value> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Json(serde_json::json!({ "choices": [] }))
    }

    let app = Router::new()
        .route("/openai/chat/completions", post(openai_chat))
        .route("/anthropic/messages", post(anthropic_messages))
        .route("/google/models/{model_action}", post(google_generate))
        .route("/down/chat/completions", post(overloaded))
        .route("/slow/chat/completions", post(slow))
        .with_state(captured);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind should succeed");
    let addr = listener.local_addr().expect("local_addr should succeed");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
    });

    (addr, shutdown_tx, handle)
}

fn settings(provider: ModelProvider, base_url: String) -> ModelSettings {
    ModelSettings {
        provider,
        api_key: Some("test-key".to_string()),
        chat_model: Some("chat-model".to_string()),
        fast_model: Some("fast-model".to_string()),
        base_url: Some(base_url),
        timeout: Duration::from_secs(5),
        temperature: 0.0,
        max_tokens: 128,
    }
}

fn prompt() -> Prompt {
    Prompt::new(PromptPurpose::Generate, "system text", "user text")
}

#[tokio::test]
async fn openai_sends_system_and_user_messages_with_bearer_auth() {
    let captured = Captured::default();
    let (addr, shutdown, task) = spawn_mock_provider(captured.clone()).await;

    let models = build_models(&settings(
        ModelProvider::OpenAi,
        format!("http://{}/openai/", addr),
    ))
    .expect("models should build");
    let text = models.chat.generate(&prompt()).await.expect("generate");

    shutdown.send(()).ok();
    let _ = task.await;

    assert_eq!(text, "SELECT 1");
    let body = captured.body();
    assert_eq!(body["model"], "chat-model");
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][0]["content"], "system text");
    assert_eq!(body["messages"][1]["content"], "user text");
    assert_eq!(body["max_tokens"], 128);
    assert_eq!(
        captured.header("authorization").as_deref(),
        Some("Bearer test-key")
    );
}

#[tokio::test]
async fn anthropic_joins_text_blocks_and_sends_version_header() {
    let captured = Captured::default();
    let (addr, shutdown, task) = spawn_mock_provider(captured.clone()).await;

    let models = build_models(&settings(
        ModelProvider::Anthropic,
        format!("http://{}/anthropic", addr),
    ))
    .expect("models should build");
    let text = models.fast.generate(&prompt()).await.expect("generate");

    shutdown.send(()).ok();
    let _ = task.await;

    assert_eq!(text, "SAFE");
    let body = captured.body();
    assert_eq!(body["model"], "fast-model");
    assert_eq!(body["system"], "system text");
    assert_eq!(body["messages"][0]["role"], "user");
    assert_eq!(captured.header("x-api-key").as_deref(), Some("test-key"));
    assert_eq!(
        captured.header("anthropic-version").as_deref(),
        Some("2023-06-01")
    );
}

#[tokio::test]
async fn google_targets_model_path_and_keeps_key_out_of_url() {
    let captured = Captured::default();
    let (addr, shutdown, task) = spawn_mock_provider(captured.clone()).await;

    let models = build_models(&settings(
        ModelProvider::Google,
        format!("http://{}/google", addr),
    ))
    .expect("models should build");
    let text = models.chat.generate(&prompt()).await.expect("generate");

    shutdown.send(()).ok();
    let _ = task.await;

    assert_eq!(text, "YES");
    assert_eq!(
        captured.last_model_path.lock().expect("lock").as_deref(),
        Some("chat-model:generateContent")
    );
    let body = captured.body();
    assert_eq!(body["systemInstruction"]["parts"][0]["text"], "system text");
    assert_eq!(body["contents"][0]["parts"][0]["text"], "user text");
    assert_eq!(body["generationConfig"]["maxOutputTokens"], 128);
    assert_eq!(captured.header("x-goog-api-key").as_deref(), Some("test-key"));
}

#[tokio::test]
async fn non_success_status_is_reported() {
    let (addr, shutdown, task) = spawn_mock_provider(Captured::default()).await;

    let models = build_models(&settings(
        ModelProvider::OpenAi,
        format!("http://{}/down", addr),
    ))
    .expect("models should build");
    let err = models.chat.generate(&prompt()).await.unwrap_err();

    shutdown.send(()).ok();
    let _ = task.await;

    assert!(matches!(err, ModelError::BadStatus(503)));
}

#[tokio::test]
async fn slow_provider_times_out() {
    let (addr, shutdown, task) = spawn_mock_provider(Captured::default()).await;

    let mut s = settings(ModelProvider::OpenAi, format!("http://{}/slow", addr));
    s.timeout = Duration::from_millis(50);
    let models = build_models(&s).expect("models should build");
    let err = models.chat.generate(&prompt()).await.unwrap_err();

    shutdown.send(()).ok();
    let _ = task.await;

    assert!(matches!(err, ModelError::Timeout));
}
