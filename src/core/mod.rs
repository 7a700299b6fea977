//! 核心基础设施：错误类型与优雅关闭

pub mod error;
pub mod shutdown;

pub use error::{ChatError, EngineError, ValidationError};
pub use shutdown::{GenerationDrain, ShutdownManager, ShutdownReason};
