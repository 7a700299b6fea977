//! HTTP 适配层（axum）
//!
//! - POST /chat/stream：SSE，每个事件一行 `data: {json}`
//! - POST /chat/stop、GET /chat/context、GET /model/status、GET /health

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};

use crate::chat::ChatOrchestrator;
use crate::core::ChatError;
use crate::model_store::{ModelStatus, ModelStore};
use crate::runtime::{ContextInfo, ModelRuntime};
use crate::validation::validate_request;

/// 路由共享状态
pub struct AppState {
    pub runtime: Arc<ModelRuntime>,
    pub store: ModelStore,
    pub orchestrator: ChatOrchestrator,
}

impl AppState {
    pub fn new(runtime: Arc<ModelRuntime>, store: ModelStore, default_max_tokens: u32) -> Self {
        Self {
            orchestrator: ChatOrchestrator::new(Arc::clone(&runtime), default_max_tokens),
            runtime,
            store,
        }
    }
}

/// 错误响应：`{error}`，状态码按错误种类区分
pub struct ApiError(ChatError);

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ChatError::Validation(_) | ChatError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            ChatError::ModelNotDownloaded => StatusCode::SERVICE_UNAVAILABLE,
            ChatError::Engine(_) | ChatError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/chat/stream", post(chat_stream))
        .route("/chat/stop", post(chat_stop))
        .route("/chat/context", get(chat_context))
        .route("/model/status", get(model_status))
        .route("/health", get(|| async { Json(json!({ "status": "ok" })) }))
        .with_state(state)
}

/// POST /chat/stream：校验 → 确认模型文件 → 加载 / 预热 → SSE 事件流
async fn chat_stream(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    tracing::info!("Received chat request");
    let Json(body) = body.map_err(|e| {
        tracing::warn!("Rejected request body: {}", e);
        ChatError::InvalidBody(e.body_text())
    })?;
    let request = validate_request(&body).map_err(|e| {
        tracing::warn!("Validation error: {}", e);
        ChatError::from(e)
    })?;

    if !state.store.is_present().await {
        tracing::warn!(path = %state.store.model_path().display(), "Model not downloaded");
        return Err(ChatError::ModelNotDownloaded.into());
    }
    state
        .runtime
        .ensure_ready(state.store.model_path())
        .await
        .map_err(ChatError::from)?;

    let events = state.orchestrator.stream(request).map(|event| {
        let sse = Event::default().json_data(&event).unwrap_or_else(|e| {
            tracing::warn!("Failed to serialize stream event: {}", e);
            Event::default().comment("serialization failed")
        });
        Ok::<_, Infallible>(sse)
    });

    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    ))
}

/// POST /chat/stop：取消所有进行中的生成
async fn chat_stop(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.runtime.stop();
    Json(json!({ "message": "Chat stopped" }))
}

async fn chat_context(State(state): State<Arc<AppState>>) -> Json<ContextInfo> {
    Json(state.runtime.context_info())
}

async fn model_status(State(state): State<Arc<AppState>>) -> Result<Json<ModelStatus>, ApiError> {
    Ok(Json(state.store.status().await?))
}
