//! Harmony Serve - 本地 LLM 推理服务
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、优雅关闭
//! - **harmony**: Harmony 协议（控制 token、Prompt 编码、频道解析）
//! - **validation**: 请求校验与参数钳制
//! - **engine**: 推理后端抽象、Sequence 池、单次生成（增量解码）
//! - **runtime**: 模型运行时（加载、预热、停止）
//! - **chat**: 流式事件与分析 → 最终回答的续写编排
//! - **model_store**: 模型文件状态与校验
//! - **server**: axum HTTP / SSE 适配层

pub mod chat;
pub mod config;
pub mod core;
pub mod engine;
pub mod harmony;
pub mod model_store;
pub mod observability;
pub mod runtime;
pub mod server;
pub mod validation;

pub use chat::{ChatOrchestrator, StreamEvent};
pub use runtime::{ModelRuntime, RuntimeOptions};
