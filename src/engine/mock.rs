//! Mock 推理后端（用于测试与本地开发，无需模型文件）
//!
//! - 字符级分词：每个字符一个 token，Harmony 控制 token 使用保留 id
//! - 可注册多字符 piece，用于模拟 token 边界与字符 / 标签边界不对齐
//! - 每次 generate 消费一个预置脚本；没有脚本时回显 Prompt 中最后一条 user 消息

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::stream;

use super::{
    GenerationSequence, InferenceBackend, LoadedModel, SamplerConfig, TokenId, TokenStream,
};
use crate::core::EngineError;
use crate::harmony::{CHANNEL, END, MESSAGE, START};

/// 控制 token 的保留 id 起点（超出 Unicode 范围，不与字符冲突）
pub const SPECIAL_TOKEN_BASE: TokenId = 0x0011_0000;
/// 多字符 piece 的 id 起点
pub const PIECE_TOKEN_BASE: TokenId = 0x0012_0000;

const SPECIAL_TOKENS: [&str; 4] = [START, END, CHANNEL, MESSAGE];

/// 脚本中的一步
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Token(TokenId),
    /// 引擎在此处报错
    Fail(String),
    /// 永远不再产出（用于测试取消）
    Hang,
}

#[derive(Default)]
struct Inner {
    pieces: Mutex<Vec<String>>,
    scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
    prompts: Mutex<Vec<String>>,
    samplers: Mutex<Vec<SamplerConfig>>,
    detokenize_failures: AtomicUsize,
    detokenize_rewrites: Mutex<VecDeque<String>>,
    load_failure: Mutex<Option<String>>,
    train_context_size: AtomicUsize,
    loads: AtomicUsize,
    created: AtomicUsize,
    disposed: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Mock 引擎：同时充当后端与已加载模型
#[derive(Clone, Default)]
pub struct MockEngine {
    inner: Arc<Inner>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_train_context_size(self, size: usize) -> Self {
        self.inner.train_context_size.store(size, Ordering::SeqCst);
        self
    }

    /// 把一段文本映射为单个 token id（控制 token / 单字符 / 注册新 piece）
    pub fn piece(&self, text: &str) -> TokenId {
        if let Some(i) = SPECIAL_TOKENS.iter().position(|s| *s == text) {
            return SPECIAL_TOKEN_BASE + i as TokenId;
        }
        let mut chars = text.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            return c as TokenId;
        }
        let mut pieces = lock(&self.inner.pieces);
        if let Some(i) = pieces.iter().position(|p| p == text) {
            return PIECE_TOKEN_BASE + i as TokenId;
        }
        pieces.push(text.to_string());
        PIECE_TOKEN_BASE + (pieces.len() - 1) as TokenId
    }

    /// 预置下一次 generate 的输出
    pub fn push_script(&self, steps: Vec<ScriptStep>) {
        lock(&self.inner.scripts).push_back(steps);
    }

    /// 预置下一次 generate 的输出：每个 piece 作为一个 token
    pub fn push_pieces(&self, pieces: &[&str]) {
        let steps = pieces.iter().map(|p| ScriptStep::Token(self.piece(p))).collect();
        self.push_script(steps);
    }

    /// 同 push_pieces，但输出完后挂起不结束
    pub fn push_pieces_then_hang(&self, pieces: &[&str]) {
        let mut steps: Vec<ScriptStep> =
            pieces.iter().map(|p| ScriptStep::Token(self.piece(p))).collect();
        steps.push(ScriptStep::Hang);
        self.push_script(steps);
    }

    /// 接下来 n 次反分词调用失败
    pub fn fail_next_detokenize(&self, n: usize) {
        self.inner.detokenize_failures.store(n, Ordering::SeqCst);
    }

    /// 下一次加载模型失败
    pub fn fail_next_load(&self, message: &str) {
        *lock(&self.inner.load_failure) = Some(message.to_string());
    }

    /// 接下来几次反分词按顺序直接返回给定文本（模拟改写已输出前缀的分词器）
    pub fn rewrite_next_detokenize(&self, texts: &[&str]) {
        let mut rewrites = lock(&self.inner.detokenize_rewrites);
        rewrites.extend(texts.iter().map(|t| t.to_string()));
    }

    /// 每次 generate 收到的 Prompt（已还原为文本）
    pub fn prompts(&self) -> Vec<String> {
        lock(&self.inner.prompts).clone()
    }

    pub fn samplers(&self) -> Vec<SamplerConfig> {
        lock(&self.inner.samplers).clone()
    }

    pub fn loads(&self) -> usize {
        self.inner.loads.load(Ordering::SeqCst)
    }

    pub fn created_sequences(&self) -> usize {
        self.inner.created.load(Ordering::SeqCst)
    }

    pub fn disposed_sequences(&self) -> usize {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<String, EngineError> {
        let pieces = lock(&self.inner.pieces);
        let mut text = String::new();
        for &id in tokens {
            if id >= PIECE_TOKEN_BASE {
                let piece = pieces
                    .get((id - PIECE_TOKEN_BASE) as usize)
                    .ok_or_else(|| EngineError::Detokenize(format!("unknown token {id}")))?;
                text.push_str(piece);
            } else if id >= SPECIAL_TOKEN_BASE {
                let special = SPECIAL_TOKENS
                    .get((id - SPECIAL_TOKEN_BASE) as usize)
                    .ok_or_else(|| EngineError::Detokenize(format!("unknown token {id}")))?;
                text.push_str(special);
            } else {
                let c = char::from_u32(id)
                    .ok_or_else(|| EngineError::Detokenize(format!("invalid char token {id}")))?;
                text.push(c);
            }
        }
        Ok(text)
    }

    /// 无脚本时的默认输出：`Echo: <最后一条 user 消息>` + 轮次结束
    fn echo_script(&self, prompt: &str) -> Vec<ScriptStep> {
        let marker = format!("{START}user{MESSAGE}\n");
        let last_user = prompt
            .rfind(&marker)
            .map(|i| &prompt[i + marker.len()..])
            .and_then(|rest| rest.find(&format!("\n{END}")).map(|end| &rest[..end]))
            .unwrap_or("(no input)");

        let mut steps: Vec<ScriptStep> = format!("Echo: {last_user}")
            .chars()
            .map(|c| ScriptStep::Token(c as TokenId))
            .collect();
        steps.push(ScriptStep::Token(self.piece(END)));
        steps
    }
}

#[async_trait]
impl InferenceBackend for MockEngine {
    async fn load_model(&self, path: &Path) -> Result<Arc<dyn LoadedModel>, EngineError> {
        if let Some(message) = lock(&self.inner.load_failure).take() {
            return Err(EngineError::Load(message));
        }
        self.inner.loads.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(path = %path.display(), "mock model loaded");
        Ok(Arc::new(self.clone()))
    }
}

impl LoadedModel for MockEngine {
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, EngineError> {
        let mut tokens = Vec::with_capacity(text.len());
        let mut rest = text;
        'outer: while let Some(c) = rest.chars().next() {
            for (i, special) in SPECIAL_TOKENS.iter().enumerate() {
                if rest.starts_with(special) {
                    tokens.push(SPECIAL_TOKEN_BASE + i as TokenId);
                    rest = &rest[special.len()..];
                    continue 'outer;
                }
            }
            tokens.push(c as TokenId);
            rest = &rest[c.len_utf8()..];
        }
        Ok(tokens)
    }

    fn detokenize(&self, tokens: &[TokenId]) -> Result<String, EngineError> {
        let injected = self
            .inner
            .detokenize_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(EngineError::Detokenize("injected failure".to_string()));
        }
        if let Some(text) = lock(&self.inner.detokenize_rewrites).pop_front() {
            return Ok(text);
        }
        self.decode(tokens)
    }

    fn train_context_size(&self) -> Option<usize> {
        match self.inner.train_context_size.load(Ordering::SeqCst) {
            0 => None,
            n => Some(n),
        }
    }

    fn create_sequence(&self) -> Result<Box<dyn GenerationSequence>, EngineError> {
        self.inner.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSequence {
            engine: self.clone(),
            disposed: false,
        }))
    }
}

struct MockSequence {
    engine: MockEngine,
    disposed: bool,
}

impl GenerationSequence for MockSequence {
    fn generate(&mut self, prompt: &[TokenId], sampler: &SamplerConfig) -> TokenStream {
        let prompt_text = self.engine.decode(prompt).unwrap_or_default();
        let inner = &self.engine.inner;
        lock(&inner.samplers).push(sampler.clone());

        let scripted = lock(&inner.scripts).pop_front();
        let steps = scripted.unwrap_or_else(|| self.engine.echo_script(&prompt_text));
        lock(&inner.prompts).push(prompt_text);

        Box::pin(stream::unfold(steps.into_iter(), |mut steps| async move {
            match steps.next()? {
                ScriptStep::Token(id) => Some((Ok(id), steps)),
                ScriptStep::Fail(msg) => Some((Err(EngineError::Generation(msg)), steps)),
                ScriptStep::Hang => {
                    futures_util::future::pending::<()>().await;
                    None
                }
            }
        }))
    }

    fn dispose(&mut self) -> Result<(), EngineError> {
        if !self.disposed {
            self.disposed = true;
            self.engine.inner.disposed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
