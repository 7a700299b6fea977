//! HTTP / SSE 集成测试（Mock 推理后端）

use std::path::Path;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use harmony_serve::engine::MockEngine;
use harmony_serve::model_store::ModelStore;
use harmony_serve::server::{router, AppState};
use harmony_serve::{ModelRuntime, RuntimeOptions};

struct TestApp {
    engine: MockEngine,
    state: Arc<AppState>,
    router: Router,
    _dir: tempfile::TempDir,
}

fn setup(with_model_file: bool) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    if with_model_file {
        std::fs::write(dir.path().join("model.gguf"), b"gguf").unwrap();
    }
    let engine = MockEngine::new();
    let runtime = Arc::new(ModelRuntime::new(
        Arc::new(engine.clone()),
        RuntimeOptions::default(),
    ));
    let store = ModelStore::new(dir.path(), "model.gguf", None).unwrap();
    let state = Arc::new(AppState::new(runtime, store, 1024));
    TestApp {
        engine,
        router: router(Arc::clone(&state)),
        state,
        _dir: dir,
    }
}

async fn send(app: &TestApp, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, String) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

/// 取出 SSE 中所有 `data:` 行并解析为 JSON
fn sse_events(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim_start()).unwrap())
        .collect()
}

fn joined_tokens(events: &[Value]) -> String {
    events
        .iter()
        .filter_map(|e| e.get("token").and_then(Value::as_str))
        .collect()
}

#[tokio::test]
async fn test_health() {
    let app = setup(false);
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!({"status": "ok"}));
}

#[tokio::test]
async fn test_validation_error_is_400() {
    let app = setup(true);
    let (status, body) = send(&app, "POST", "/chat/stream", Some(json!({"messages": []}))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        serde_json::from_str::<Value>(&body).unwrap(),
        json!({"error": "Messages array cannot be empty"})
    );
    assert_eq!(app.engine.loads(), 0);
}

#[tokio::test]
async fn test_malformed_body_is_400_with_error_field() {
    let app = setup(true);
    let request = Request::builder()
        .method("POST")
        .uri("/chat/stream")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();

    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    let error = body["error"].as_str().unwrap();
    assert!(error.starts_with("Invalid request body: "), "{error}");
    assert_eq!(app.engine.loads(), 0);
}

#[tokio::test]
async fn test_missing_model_is_503() {
    let app = setup(false);
    let (status, body) = send(
        &app,
        "POST",
        "/chat/stream",
        Some(json!({"messages": [{"role": "user", "content": "Hi"}]})),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        serde_json::from_str::<Value>(&body).unwrap(),
        json!({"error": "Model not downloaded"})
    );
    assert!(!app.state.runtime.is_ready());
}

#[tokio::test]
async fn test_stream_loads_model_and_streams_echo() {
    let app = setup(true);

    let (_, body) = send(&app, "GET", "/chat/context", None).await;
    assert_eq!(
        serde_json::from_str::<Value>(&body).unwrap(),
        json!({"contextSize": 4096, "ready": false})
    );

    let (status, body) = send(
        &app,
        "POST",
        "/chat/stream",
        Some(json!({
            "messages": [
                {"role": "system", "content": "Be helpful"},
                {"role": "user", "content": "Hi"}
            ]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let events = sse_events(&body);
    assert_eq!(joined_tokens(&events), "Echo: Hi");
    assert_eq!(events.last(), Some(&json!({"done": true})));
    assert!(events.iter().all(|e| e.get("phase").is_none()));

    let (_, body) = send(&app, "GET", "/chat/context", None).await;
    assert_eq!(
        serde_json::from_str::<Value>(&body).unwrap(),
        json!({"contextSize": 4096, "ready": true})
    );
    assert_eq!(app.engine.loads(), 1);
}

#[tokio::test]
async fn test_reasoning_continuation_over_sse() {
    let app = setup(true);
    app.state
        .runtime
        .ensure_ready(app.state.store.model_path())
        .await
        .unwrap();
    app.engine
        .push_pieces(&["<|channel|>", "analysis", "<|message|>", "thinking", "<|e", "nd|>"]);
    app.engine.push_pieces(&["The answer", " is 4", "<|end|>"]);

    let (status, body) = send(
        &app,
        "POST",
        "/chat/stream",
        Some(json!({
            "messages": [{"role": "user", "content": "2+2?"}],
            "params": {"reasoningMode": "medium", "temperature": 0.5}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let events = sse_events(&body);
    let phases: Vec<&Value> = events.iter().filter(|e| e.get("phase").is_some()).collect();
    assert_eq!(
        phases,
        vec![
            &json!({"phase": "reasoning_complete"}),
            &json!({"phase": "final_answer"})
        ]
    );
    assert_eq!(
        joined_tokens(&events),
        "<|channel|>analysis<|message|>thinkingThe answer is 4"
    );
    assert_eq!(events.last(), Some(&json!({"done": true})));

    let samplers = app.engine.samplers();
    assert_eq!(samplers.len(), 3);
    assert_eq!(samplers[1].temperature, 0.5);
    assert_eq!(samplers[2].temperature, 0.5);
}

#[tokio::test]
async fn test_max_tokens_reason() {
    let app = setup(true);
    app.state
        .runtime
        .ensure_ready(app.state.store.model_path())
        .await
        .unwrap();
    app.engine.push_pieces(&["one", " two", " three", "<|end|>"]);

    let (_, body) = send(
        &app,
        "POST",
        "/chat/stream",
        Some(json!({
            "messages": [{"role": "user", "content": "count"}],
            "params": {"maxTokens": 2}
        })),
    )
    .await;

    let events = sse_events(&body);
    assert_eq!(joined_tokens(&events), "one two");
    assert_eq!(events.last(), Some(&json!({"done": true, "reason": "max_tokens"})));
}

#[tokio::test]
async fn test_stop_and_model_status() {
    let app = setup(true);

    let (status, body) = send(&app, "POST", "/chat/stop", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        serde_json::from_str::<Value>(&body).unwrap(),
        json!({"message": "Chat stopped"})
    );

    let (status, body) = send(&app, "GET", "/model/status", None).await;
    assert_eq!(status, StatusCode::OK);
    let status: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(status["present"], json!(true));
    assert_eq!(status["size"], json!(4));
    assert_eq!(status["checksumOk"], json!(true));
    assert_eq!(status["progress"], json!(100));
}

#[tokio::test]
async fn test_model_path_is_under_cache_dir() {
    let app = setup(false);
    assert!(app.state.store.model_path().ends_with(Path::new("model.gguf")));
}
