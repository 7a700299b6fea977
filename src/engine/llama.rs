//! llama.cpp 推理后端（`--features llama`）
//!
//! 每次 generate 新建一个 LlamaContext，在阻塞线程中预填充 Prompt 并逐 token 采样，
//! token 经 mpsc 送回异步侧；接收端被丢弃（取消 / 生成结束）后采样循环随之退出。

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::stream;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use tokio::sync::mpsc;

use super::{
    GenerationSequence, InferenceBackend, LoadedModel, SamplerConfig, TokenId, TokenStream,
};
use crate::config::ModelSection;
use crate::core::EngineError;

/// 采样线程与异步侧之间的 token 缓冲
const TOKEN_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LlamaOptions {
    pub gpu_layers: u32,
    /// 上下文长度上限；实际值取 min(训练长度, 上限)
    pub max_context_size: u32,
}

impl From<&ModelSection> for LlamaOptions {
    fn from(section: &ModelSection) -> Self {
        Self {
            gpu_layers: section.gpu_layers,
            max_context_size: u32::try_from(section.max_context_size).unwrap_or(u32::MAX),
        }
    }
}

/// llama.cpp 后端；进程内只能初始化一次
pub struct LlamaEngine {
    backend: Arc<LlamaBackend>,
    options: LlamaOptions,
}

impl LlamaEngine {
    pub fn new(options: LlamaOptions) -> Result<Self, EngineError> {
        let backend = LlamaBackend::init()
            .map_err(|e| EngineError::Load(format!("Failed to init llama backend: {e}")))?;
        Ok(Self {
            backend: Arc::new(backend),
            options,
        })
    }
}

#[async_trait]
impl InferenceBackend for LlamaEngine {
    async fn load_model(&self, path: &Path) -> Result<Arc<dyn LoadedModel>, EngineError> {
        let backend = Arc::clone(&self.backend);
        let options = self.options;
        let path = path.to_path_buf();

        let model = tokio::task::spawn_blocking(move || {
            let params = LlamaModelParams::default().with_n_gpu_layers(options.gpu_layers);
            LlamaModel::load_from_file(&backend, &path, &params)
                .map(|model| LlamaShared::new(model, backend, options))
                .map_err(|e| EngineError::Load(e.to_string()))
        })
        .await
        .map_err(|e| EngineError::Load(format!("Model load task failed: {e}")))??;

        tracing::debug!(
            n_ctx_train = model.model.n_ctx_train(),
            n_ctx = model.n_ctx,
            gpu_layers = options.gpu_layers,
            "llama model loaded"
        );
        Ok(Arc::new(LlamaLoadedModel {
            shared: Arc::new(model),
        }))
    }
}

/// 模型与 backend；字段顺序保证模型先于 backend 释放
struct LlamaShared {
    model: LlamaModel,
    backend: Arc<LlamaBackend>,
    n_ctx: u32,
}

impl LlamaShared {
    fn new(model: LlamaModel, backend: Arc<LlamaBackend>, options: LlamaOptions) -> Self {
        let n_ctx = model.n_ctx_train().min(options.max_context_size).max(1);
        Self {
            model,
            backend,
            n_ctx,
        }
    }
}

pub struct LlamaLoadedModel {
    shared: Arc<LlamaShared>,
}

impl LoadedModel for LlamaLoadedModel {
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, EngineError> {
        let tokens = self
            .shared
            .model
            .str_to_token(text, AddBos::Never)
            .map_err(|e| EngineError::Tokenize(e.to_string()))?;
        Ok(tokens.into_iter().map(to_token_id).collect())
    }

    /// 整段解码；末尾不完整的 UTF-8 留在解码器中，不会输出
    fn detokenize(&self, tokens: &[TokenId]) -> Result<String, EngineError> {
        let mut decoder = encoding_rs::UTF_8.new_decoder();
        let mut text = String::new();
        for &id in tokens {
            let piece = self
                .shared
                .model
                .token_to_piece(to_llama_token(id), &mut decoder, true, None)
                .map_err(|e| EngineError::Detokenize(e.to_string()))?;
            text.push_str(&piece);
        }
        Ok(text)
    }

    fn train_context_size(&self) -> Option<usize> {
        Some(self.shared.model.n_ctx_train() as usize)
    }

    fn create_sequence(&self) -> Result<Box<dyn GenerationSequence>, EngineError> {
        Ok(Box::new(LlamaSequence {
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct LlamaSequence {
    shared: Arc<LlamaShared>,
}

impl GenerationSequence for LlamaSequence {
    fn generate(&mut self, prompt: &[TokenId], sampler: &SamplerConfig) -> TokenStream {
        let (tx, rx) = mpsc::channel(TOKEN_BUFFER);
        let shared = Arc::clone(&self.shared);
        let prompt: Vec<LlamaToken> = prompt.iter().copied().map(to_llama_token).collect();
        let sampler = sampler.clone();

        tokio::task::spawn_blocking(move || {
            if let Err(e) = run_generation(&shared, &prompt, &sampler, &tx) {
                let _ = tx.blocking_send(Err(e));
            }
        });

        Box::pin(stream::unfold(rx, |mut rx| async move {
            let item = rx.recv().await?;
            Some((item, rx))
        }))
    }

    fn dispose(&mut self) -> Result<(), EngineError> {
        // 上下文归采样线程所有，随接收端关闭而释放
        Ok(())
    }
}

/// 预填充 Prompt 后逐 token 采样，直到 EOG、上下文写满或接收端关闭
fn run_generation(
    shared: &LlamaShared,
    prompt: &[LlamaToken],
    config: &SamplerConfig,
    tx: &mpsc::Sender<Result<TokenId, EngineError>>,
) -> Result<(), EngineError> {
    let n_ctx = shared.n_ctx as usize;
    if prompt.len() >= n_ctx {
        return Err(EngineError::Generation(format!(
            "Prompt ({} tokens) exceeds context size ({})",
            prompt.len(),
            n_ctx
        )));
    }

    let params = LlamaContextParams::default().with_n_ctx(NonZeroU32::new(shared.n_ctx));
    let mut ctx = shared
        .model
        .new_context(&shared.backend, params)
        .map_err(generation_error)?;

    let n_batch = (ctx.n_batch() as usize).max(1);
    for chunk in prompt.chunks(n_batch) {
        let mut batch = LlamaBatch::get_one(chunk).map_err(generation_error)?;
        ctx.decode(&mut batch).map_err(generation_error)?;
    }

    let mut sampler = build_sampler(config);
    for &token in prompt {
        sampler.accept(token);
    }

    for _ in prompt.len()..n_ctx {
        let token = sampler.sample(&ctx, -1);
        sampler.accept(token);
        if shared.model.is_eog_token(token) {
            break;
        }
        if tx.blocking_send(Ok(to_token_id(token))).is_err() {
            tracing::trace!("token receiver closed, stopping sampling");
            break;
        }

        let next = [token];
        let mut batch = LlamaBatch::get_one(&next).map_err(generation_error)?;
        ctx.decode(&mut batch).map_err(generation_error)?;
    }
    Ok(())
}

/// 重复惩罚（窗口覆盖 Prompt token）→ top_p → 温度 → 随机采样
fn build_sampler(config: &SamplerConfig) -> LlamaSampler {
    let penalty_window = i32::try_from(config.punish_tokens.len()).unwrap_or(i32::MAX);
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);

    LlamaSampler::chain_simple([
        LlamaSampler::penalties(penalty_window, config.repeat_penalty, 0.0, 0.0),
        LlamaSampler::top_p(config.top_p, 1),
        LlamaSampler::temp(config.temperature),
        LlamaSampler::dist(seed),
    ])
}

fn generation_error(e: impl std::fmt::Display) -> EngineError {
    EngineError::Generation(e.to_string())
}

fn to_token_id(token: LlamaToken) -> TokenId {
    token.0 as TokenId
}

fn to_llama_token(id: TokenId) -> LlamaToken {
    LlamaToken::new(id as i32)
}
