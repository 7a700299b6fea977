//! 错误类型：校验错误 / 推理引擎错误 / 对话请求错误
//!
//! 与 HTTP 层配合：ValidationError → 400，ModelNotDownloaded → 503，EngineError → 流内 error 事件。

use thiserror::Error;

/// 消息列表校验失败（在任何模型交互之前拒绝）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Messages must be an array")]
    NotAnArray,

    #[error("Messages array cannot be empty")]
    Empty,

    #[error("Too many messages. Maximum is {max}")]
    TooMany { max: usize },

    #[error("Message at index {index} is not an object")]
    NotAnObject { index: usize },

    #[error("Message at index {index} has invalid role: {role}. Valid roles are: system, user, assistant, tool")]
    InvalidRole { index: usize, role: String },

    #[error("Message at index {index} has invalid content: must be a string")]
    InvalidContent { index: usize },

    #[error("Message at index {index} has empty content")]
    EmptyContent { index: usize },

    #[error("System message must be the first message if present (found at index {index})")]
    SystemNotFirst { index: usize },

    #[error("Consecutive {role} messages at index {index}. Messages should alternate between roles.")]
    ConsecutiveRole { index: usize, role: String },

    #[error("Tool message at index {index} must follow an assistant message")]
    ToolWithoutAssistant { index: usize },
}

/// 推理引擎错误（加载、分词、生成）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Model not loaded. Call ensure_ready first.")]
    ModelNotLoaded,

    #[error("Failed to load model: {0}")]
    Load(String),

    #[error("Tokenization failed: {0}")]
    Tokenize(String),

    /// 单步反分词失败：生成过程内部跳过该步，不中断
    #[error("Detokenization failed: {0}")]
    Detokenize(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Sequence pool closed")]
    PoolClosed,
}

/// 一次对话请求可能出现的错误
#[derive(Error, Debug)]
pub enum ChatError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    /// 请求体不是合法 JSON（在校验之前被拒绝）
    #[error("Invalid request body: {0}")]
    InvalidBody(String),

    #[error("Model not downloaded")]
    ModelNotDownloaded,

    #[error("Model store error: {0}")]
    Store(#[from] std::io::Error),
}
