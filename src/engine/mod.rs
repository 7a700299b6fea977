//! 推理引擎层：后端抽象、采样配置、Sequence 池、单次生成（GenerationPass）
//!
//! 后端实现：MockEngine（默认），llama.cpp（`--features llama`）

#[cfg(feature = "llama")]
pub mod llama;
pub mod mock;
pub mod pass;
pub mod pool;
pub mod sampler;
pub mod traits;

/// 词表中的 token id
pub type TokenId = u32;

pub use mock::{MockEngine, ScriptStep};
pub use pass::{GenerationPass, PassOutcome};
pub use pool::{SequenceLease, SequencePool};
pub use sampler::{SamplerConfig, SamplerDefaults, SamplerParams};
pub use traits::{GenerationSequence, InferenceBackend, LoadedModel, TokenStream};
