//! 对话层：流式事件与续写编排

pub mod events;
pub mod orchestrator;

pub use events::{DoneReason, Phase, StreamEvent};
pub use orchestrator::{ChatOrchestrator, DEFAULT_MAX_TOKENS};
