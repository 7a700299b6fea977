//! 模型运行时：启动时显式构造、通过 Arc 共享的引擎句柄
//!
//! - 模型只加载一次（OnceCell），预热只做一次
//! - 持有 Sequence 池与所有进行中生成的取消 token
//! - stop 取消全部进行中的生成并清空集合
//! - close 之后新登记的生成一开始就是已取消状态（服务关闭中）

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::EngineError;
use crate::engine::{
    GenerationPass, InferenceBackend, SamplerDefaults, SamplerParams, SequencePool,
};
use crate::harmony::{encode_prompt, Message, ReasoningMode};

/// 模型未声明训练上下文长度时使用的值
pub const DEFAULT_CONTEXT_SIZE: usize = 4096;

/// 运行时参数（来自 [model] 与 [generation] 段）
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeOptions {
    /// 上下文长度上限
    pub max_context_size: usize,
    /// Sequence 池大小（预热 + 并发请求）
    pub sequences: usize,
    /// 预热生成的 token 数
    pub warmup_tokens: u32,
    pub sampler: SamplerDefaults,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_context_size: 8192,
            sequences: 4,
            warmup_tokens: 2,
            sampler: SamplerDefaults::default(),
        }
    }
}

impl From<&AppConfig> for RuntimeOptions {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            max_context_size: cfg.model.max_context_size,
            sequences: cfg.model.sequences,
            warmup_tokens: cfg.generation.warmup_tokens,
            sampler: SamplerDefaults {
                temperature: cfg.generation.temperature,
                top_p: cfg.generation.top_p,
                repeat_penalty: cfg.generation.repeat_penalty,
            },
        }
    }
}

/// GET /chat/context 的返回体
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextInfo {
    pub context_size: usize,
    pub ready: bool,
}

struct LoadedState {
    pool: SequencePool,
    context_size: usize,
}

pub struct ModelRuntime {
    backend: Arc<dyn InferenceBackend>,
    options: RuntimeOptions,
    loaded: OnceCell<LoadedState>,
    warmed_up: tokio::sync::Mutex<bool>,
    active: Mutex<HashMap<u64, CancellationToken>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl ModelRuntime {
    pub fn new(backend: Arc<dyn InferenceBackend>, options: RuntimeOptions) -> Self {
        Self {
            backend,
            options,
            loaded: OnceCell::new(),
            warmed_up: tokio::sync::Mutex::new(false),
            active: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// 加载模型并预热；重复调用不会重复加载或预热
    pub async fn ensure_ready(&self, model_path: &Path) -> Result<(), EngineError> {
        self.loaded
            .get_or_try_init(|| self.load(model_path))
            .await?;

        let mut warmed_up = self.warmed_up.lock().await;
        if !*warmed_up {
            self.warmup().await?;
            *warmed_up = true;
        }
        Ok(())
    }

    async fn load(&self, model_path: &Path) -> Result<LoadedState, EngineError> {
        tracing::info!(path = %model_path.display(), "Loading model...");
        let model = self.backend.load_model(model_path).await?;

        let context_size = model
            .train_context_size()
            .unwrap_or(DEFAULT_CONTEXT_SIZE)
            .min(self.options.max_context_size);
        let pool = SequencePool::new(model, self.options.sequences);
        tracing::info!(
            context_size,
            sequences = pool.capacity(),
            "Model loaded"
        );
        Ok(LoadedState { pool, context_size })
    }

    /// 用一条极短的生成预热模型（输出丢弃）
    async fn warmup(&self) -> Result<(), EngineError> {
        tracing::info!("Starting model warmup...");
        let prompt = encode_prompt(&[Message::user("Hi")], ReasoningMode::Low);
        let generation = self.track();
        let mut pass = self
            .start_pass(
                &prompt,
                &SamplerParams::default(),
                self.options.warmup_tokens,
                generation.token().clone(),
            )
            .await?;
        while pass.next_delta().await?.is_some() {}
        tracing::info!(tokens = pass.token_count(), "Model warmup complete");
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.loaded.initialized()
    }

    pub fn context_info(&self) -> ContextInfo {
        ContextInfo {
            context_size: self
                .loaded
                .get()
                .map(|s| s.context_size)
                .unwrap_or(DEFAULT_CONTEXT_SIZE),
            ready: self.is_ready(),
        }
    }

    /// 空闲 sequence 数；模型未加载时为 None
    pub fn available_sequences(&self) -> Option<usize> {
        self.loaded.get().map(|s| s.pool.available())
    }

    /// 基于当前模型开始一次生成
    pub async fn start_pass(
        &self,
        prompt: &str,
        params: &SamplerParams,
        max_tokens: u32,
        cancel: CancellationToken,
    ) -> Result<GenerationPass, EngineError> {
        let state = self.loaded.get().ok_or(EngineError::ModelNotLoaded)?;
        GenerationPass::start(
            &state.pool,
            prompt,
            params,
            &self.options.sampler,
            max_tokens,
            cancel,
        )
        .await
    }

    /// 登记一次生成，返回的守卫 Drop 时自动注销
    pub fn track(&self) -> TrackedGeneration<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        if self.is_closed() {
            token.cancel();
        } else {
            self.active().insert(id, token.clone());
        }
        TrackedGeneration {
            runtime: self,
            id,
            token,
        }
    }

    /// 进行中的生成数
    pub fn active_generations(&self) -> usize {
        self.active().len()
    }

    /// 取消所有进行中的生成，返回被取消的数量
    pub fn stop(&self) -> usize {
        let drained: Vec<CancellationToken> =
            self.active().drain().map(|(_, token)| token).collect();
        for token in &drained {
            token.cancel();
        }
        tracing::info!(count = drained.len(), "Stopped active generations");
        drained.len()
    }

    /// 不再接受新的生成，并取消所有进行中的生成
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        self.stop()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 所有 sequence 都已归还（模型未加载时视为空闲）
    pub fn is_idle(&self) -> bool {
        self.loaded
            .get()
            .map_or(true, |s| s.pool.available() == s.pool.capacity())
    }

    fn active(&self) -> MutexGuard<'_, HashMap<u64, CancellationToken>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 一次已登记的生成；持有其取消 token
pub struct TrackedGeneration<'a> {
    runtime: &'a ModelRuntime,
    id: u64,
    token: CancellationToken,
}

impl TrackedGeneration<'_> {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for TrackedGeneration<'_> {
    fn drop(&mut self) {
        self.runtime.active().remove(&self.id);
    }
}
