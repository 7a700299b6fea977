//! 推理引擎抽象
//!
//! 后端只需提供：加载模型、分词 / 反分词、创建生成序列（sequence）。
//! 每个 sequence 同一时刻只服务一次生成，由 SequencePool 控制并发数量。

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;

use super::{SamplerConfig, TokenId};
use crate::core::EngineError;

/// 生成的 token 流：惰性、有限，结束即表示模型停止输出
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<TokenId, EngineError>> + Send>>;

/// 推理后端：负责把模型文件加载为可用的模型句柄
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn load_model(&self, path: &Path) -> Result<Arc<dyn LoadedModel>, EngineError>;
}

/// 已加载的模型
pub trait LoadedModel: Send + Sync {
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, EngineError>;

    fn detokenize(&self, tokens: &[TokenId]) -> Result<String, EngineError>;

    /// 模型训练时的上下文长度；未知时返回 None
    fn train_context_size(&self) -> Option<usize> {
        None
    }

    fn create_sequence(&self) -> Result<Box<dyn GenerationSequence>, EngineError>;
}

/// 一个独占的生成会话
pub trait GenerationSequence: Send {
    /// 基于 Prompt token 开始生成；返回的流与 sequence 生命周期解耦
    fn generate(&mut self, prompt: &[TokenId], sampler: &SamplerConfig) -> TokenStream;

    /// 释放底层资源
    fn dispose(&mut self) -> Result<(), EngineError>;
}
