//! Harmony 协议层：控制 token、Prompt 编码、响应频道解析
//!
//! 轮次由 `<|start|>` / `<|end|>` 包裹，assistant 轮次内以 `<|channel|>名称<|message|>` 切分频道。

pub mod encoder;
pub mod message;
pub mod parser;

pub use encoder::{encode_prompt, FINAL_CHANNEL_DIRECTIVE};
pub use message::{Channel, Message, ReasoningMode, Role};
pub use parser::{parse_response, ParsedResponse};

/// 轮次开始
pub const START: &str = "<|start|>";
/// 轮次结束（生成时的 end-of-turn 标记）
pub const END: &str = "<|end|>";
/// 频道名开始
pub const CHANNEL: &str = "<|channel|>";
/// 正文开始
pub const MESSAGE: &str = "<|message|>";
