//! Harmony Serve
//!
//! 入口：初始化日志、加载配置、构造模型运行时并启动 HTTP 服务，收到关闭信号后停止所有生成。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use harmony_serve::{
    config::{load_config, AppConfig},
    core::{GenerationDrain, ShutdownManager},
    engine::InferenceBackend,
    model_store::ModelStore,
    observability,
    server::{router, AppState},
    ModelRuntime, RuntimeOptions,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config(None).context("Failed to load config")?;
    let store = ModelStore::from_config(&cfg.model).context("Invalid model config")?;
    let checksum = if cfg.model.sha256.is_some() {
        "configured"
    } else {
        "not configured"
    };
    tracing::info!(model = %store.model_path().display(), checksum, "Model store ready");

    let runtime = Arc::new(ModelRuntime::new(
        inference_backend(&cfg)?,
        RuntimeOptions::from(&cfg),
    ));

    let state = Arc::new(AppState::new(
        Arc::clone(&runtime),
        store,
        cfg.generation.default_max_tokens,
    ));
    let app = router(state);

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();
    let drain = GenerationDrain::new(
        Arc::clone(&runtime),
        Duration::from_secs(cfg.server.shutdown_timeout_secs),
    );

    let addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Server listening on http://{}", addr);

    // 先取消进行中的生成，SSE 流随之结束，服务才能退出
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.wait_for_shutdown().await;
            drain.run().await;
        })
        .await
        .context("Server error")?;

    tracing::info!("Server stopped");
    Ok(())
}

#[cfg(feature = "llama")]
fn inference_backend(cfg: &AppConfig) -> anyhow::Result<Arc<dyn InferenceBackend>> {
    use harmony_serve::engine::llama::{LlamaEngine, LlamaOptions};

    let options = LlamaOptions::from(&cfg.model);
    let engine = LlamaEngine::new(options).context("Failed to initialize llama.cpp backend")?;
    tracing::info!(gpu_layers = options.gpu_layers, "Using llama.cpp inference backend");
    Ok(Arc::new(engine))
}

/// 未启用 llama 特性时使用 Mock（回显最后一条 user 消息）
#[cfg(not(feature = "llama"))]
fn inference_backend(_cfg: &AppConfig) -> anyhow::Result<Arc<dyn InferenceBackend>> {
    tracing::warn!("Using mock inference backend; build with --features llama for GGUF inference");
    Ok(Arc::new(harmony_serve::engine::MockEngine::new()))
}
