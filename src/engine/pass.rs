//! 单次生成：逐 token 拉取、整体反分词、计算增量文本、检测 `<|end|>`
//!
//! 每一步只扫描尚未输出的尾部文本；尾部若可能是 `<|end|>` 的前缀，或以 U+FFFD
//! （不完整的 UTF-8）结尾，则暂扣不发，直到下一步能判定。
//! 所有输出增量拼接起来，等于去掉结束标记及其后内容的完整文本。

use std::sync::Arc;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{
    LoadedModel, SamplerDefaults, SamplerParams, SequenceLease, SequencePool, TokenId,
    TokenStream,
};
use crate::core::EngineError;
use crate::harmony::END;

/// 一次生成如何结束
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// 遇到 `<|end|>`
    EndOfTurn,
    /// 引擎不再产出
    Exhausted,
    /// 达到本次生成的 token 上限
    MaxTokens,
    Cancelled,
}

enum PassState {
    Running,
    Finished(PassOutcome),
    Failed,
}

/// 独占一个 sequence 的生成过程；结束（或 Drop）时释放 sequence
pub struct GenerationPass {
    model: Arc<dyn LoadedModel>,
    stream: Option<TokenStream>,
    lease: Option<SequenceLease>,
    cancel: CancellationToken,
    tokens: Vec<TokenId>,
    /// 上一步成功反分词得到的文本
    previous_text: String,
    /// previous_text 中已输出的字节数
    emitted: usize,
    max_tokens: usize,
    state: PassState,
}

impl GenerationPass {
    /// 分词、申请 sequence 并开始生成；等待 sequence 时被取消则直接以 Cancelled 结束
    pub async fn start(
        pool: &SequencePool,
        prompt: &str,
        params: &SamplerParams,
        defaults: &SamplerDefaults,
        max_tokens: u32,
        cancel: CancellationToken,
    ) -> Result<Self, EngineError> {
        let model = pool.model().clone();
        let prompt_tokens = model.tokenize(prompt)?;

        let mut pass = Self {
            model,
            stream: None,
            lease: None,
            cancel,
            tokens: Vec::new(),
            previous_text: String::new(),
            emitted: 0,
            max_tokens: max_tokens as usize,
            state: PassState::Running,
        };

        let Some(mut lease) = pool.acquire(&pass.cancel).await? else {
            pass.state = PassState::Finished(PassOutcome::Cancelled);
            return Ok(pass);
        };

        let sampler = params.resolve(defaults, prompt_tokens.clone());
        tracing::debug!(
            prompt_tokens = prompt_tokens.len(),
            max_tokens,
            temperature = sampler.temperature,
            "generation pass started"
        );
        pass.stream = Some(lease.sequence().generate(&prompt_tokens, &sampler));
        pass.lease = Some(lease);
        Ok(pass)
    }

    /// 拉取下一段非空增量文本；Ok(None) 表示本次生成已结束（见 outcome）
    pub async fn next_delta(&mut self) -> Result<Option<String>, EngineError> {
        loop {
            if !matches!(self.state, PassState::Running) {
                return Ok(None);
            }
            if self.tokens.len() >= self.max_tokens {
                return Ok(self.finish(PassOutcome::MaxTokens));
            }

            let Some(stream) = self.stream.as_mut() else {
                return Ok(self.finish(PassOutcome::Exhausted));
            };
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                next = stream.next() => Some(next),
            };
            let Some(next) = next else {
                self.finish(PassOutcome::Cancelled);
                return Ok(None);
            };

            let token = match next {
                None => return Ok(self.finish(PassOutcome::Exhausted)),
                Some(Err(e)) => {
                    tracing::debug!(tokens = self.tokens.len(), "generation pass failed: {}", e);
                    self.release();
                    self.state = PassState::Failed;
                    return Err(e);
                }
                Some(Ok(token)) => token,
            };
            self.tokens.push(token);
            tracing::trace!(token, count = self.tokens.len(), "token generated");

            let full_text = match self.model.detokenize(&self.tokens) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(step = self.tokens.len(), "skipping step: {}", e);
                    continue;
                }
            };
            let extends_emitted = full_text.as_bytes().get(..self.emitted)
                == self.previous_text.as_bytes().get(..self.emitted);
            let pending = match full_text.get(self.emitted..) {
                Some(pending) if extends_emitted => pending,
                _ => {
                    tracing::warn!(
                        step = self.tokens.len(),
                        "skipping step: detokenized text no longer extends emitted text"
                    );
                    continue;
                }
            };

            if let Some(pos) = pending.find(END) {
                let delta = pending[..pos].to_string();
                self.emitted += pos;
                self.finish(PassOutcome::EndOfTurn);
                return Ok(Some(delta).filter(|d| !d.is_empty()));
            }

            let ready = pending.len() - holdback_len(pending);
            let delta = pending[..ready].to_string();
            self.emitted += ready;
            self.previous_text = full_text;

            if !delta.is_empty() {
                return Ok(Some(delta));
            }
        }
    }

    /// 结束原因；仍在生成或因错误中止时为 None
    pub fn outcome(&self) -> Option<PassOutcome> {
        match self.state {
            PassState::Finished(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// 已从引擎拉取的 token 数
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// 结束生成并释放 sequence；耗尽 / 到达上限时返回暂扣的尾部文本
    fn finish(&mut self, outcome: PassOutcome) -> Option<String> {
        self.release();
        self.state = PassState::Finished(outcome);
        tracing::debug!(?outcome, tokens = self.tokens.len(), "generation pass finished");

        match outcome {
            PassOutcome::Exhausted | PassOutcome::MaxTokens => {
                let held = self.previous_text.get(self.emitted..).unwrap_or_default();
                let held = held.to_string();
                self.emitted = self.previous_text.len();
                Some(held).filter(|h| !h.is_empty())
            }
            PassOutcome::EndOfTurn | PassOutcome::Cancelled => None,
        }
    }

    fn release(&mut self) {
        self.stream = None;
        self.lease = None;
    }
}

/// 尾部需要暂扣的字节数：连续的 U+FFFD，或 `<|end|>` 的真前缀
fn holdback_len(text: &str) -> usize {
    let replacement: usize = text
        .chars()
        .rev()
        .take_while(|c| *c == char::REPLACEMENT_CHARACTER)
        .map(char::len_utf8)
        .sum();
    if replacement > 0 {
        return replacement;
    }

    (1..END.len())
        .rev()
        .find(|&k| text.ends_with(&END[..k]))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MockEngine, ScriptStep};

    fn pool(engine: &MockEngine, capacity: usize) -> SequencePool {
        SequencePool::new(Arc::new(engine.clone()), capacity)
    }

    async fn start(pool: &SequencePool, max_tokens: u32, cancel: CancellationToken) -> GenerationPass {
        GenerationPass::start(
            pool,
            "<|start|>user<|message|>\nHi\n<|end|>\n\n",
            &SamplerParams::default(),
            &SamplerDefaults::default(),
            max_tokens,
            cancel,
        )
        .await
        .unwrap()
    }

    async fn collect(pass: &mut GenerationPass) -> Vec<String> {
        let mut deltas = Vec::new();
        while let Some(delta) = pass.next_delta().await.unwrap() {
            deltas.push(delta);
        }
        deltas
    }

    #[tokio::test]
    async fn test_deltas_concatenate_to_text() {
        let engine = MockEngine::new();
        engine.push_pieces(&["Hel", "lo", " wor", "ld", "<|end|>", "after"]);
        let pool = pool(&engine, 2);

        let mut pass = start(&pool, 64, CancellationToken::new()).await;
        let deltas = collect(&mut pass).await;

        assert_eq!(deltas, vec!["Hel", "lo", " wor", "ld"]);
        assert_eq!(pass.outcome(), Some(PassOutcome::EndOfTurn));
        assert_eq!(pool.available(), 2);
        assert_eq!(engine.disposed_sequences(), 1);
    }

    #[tokio::test]
    async fn test_end_marker_split_across_tokens() {
        let engine = MockEngine::new();
        engine.push_pieces(&["Hi", " there", "<|e", "nd|>", "ignored"]);
        let pool = pool(&engine, 1);

        let mut pass = start(&pool, 64, CancellationToken::new()).await;
        let deltas = collect(&mut pass).await;

        assert_eq!(deltas.concat(), "Hi there");
        assert!(deltas.iter().all(|d| !d.contains("<|")));
        assert_eq!(pass.outcome(), Some(PassOutcome::EndOfTurn));
        assert_eq!(pass.token_count(), 4);
    }

    #[tokio::test]
    async fn test_held_prefix_released_when_not_marker() {
        let engine = MockEngine::new();
        engine.push_pieces(&["a<|", "b"]);
        let pool = pool(&engine, 1);

        let mut pass = start(&pool, 64, CancellationToken::new()).await;
        let deltas = collect(&mut pass).await;

        assert_eq!(deltas, vec!["a", "<|b"]);
        assert_eq!(pass.outcome(), Some(PassOutcome::Exhausted));
    }

    #[tokio::test]
    async fn test_held_text_flushed_on_exhaustion() {
        let engine = MockEngine::new();
        engine.push_pieces(&["done <|"]);
        let pool = pool(&engine, 1);

        let mut pass = start(&pool, 64, CancellationToken::new()).await;
        assert_eq!(collect(&mut pass).await.concat(), "done <|");
    }

    #[tokio::test]
    async fn test_token_cap() {
        let engine = MockEngine::new();
        engine.push_pieces(&["a", "b", "c", "d", "e"]);
        let pool = pool(&engine, 1);

        let mut pass = start(&pool, 3, CancellationToken::new()).await;
        assert_eq!(collect(&mut pass).await.concat(), "abc");
        assert_eq!(pass.outcome(), Some(PassOutcome::MaxTokens));
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_without_further_output() {
        let engine = MockEngine::new();
        engine.push_pieces_then_hang(&["a", "b"]);
        let pool = pool(&engine, 2);
        let cancel = CancellationToken::new();

        let mut pass = start(&pool, 64, cancel.clone()).await;
        assert_eq!(pass.next_delta().await.unwrap(), Some("a".to_string()));
        assert_eq!(pass.next_delta().await.unwrap(), Some("b".to_string()));
        assert_eq!(pool.available(), 1);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            canceller.cancel();
        });
        assert_eq!(pass.next_delta().await.unwrap(), None);
        assert_eq!(pass.outcome(), Some(PassOutcome::Cancelled));
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_while_waiting_for_sequence() {
        let engine = MockEngine::new();
        let pool = pool(&engine, 1);
        let _held = pool.acquire(&CancellationToken::new()).await.unwrap().unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut pass = start(&pool, 64, cancel).await;

        assert_eq!(pass.outcome(), Some(PassOutcome::Cancelled));
        assert_eq!(pass.next_delta().await.unwrap(), None);
        assert_eq!(engine.created_sequences(), 1);
    }

    #[tokio::test]
    async fn test_detokenize_failure_skips_step() {
        let engine = MockEngine::new();
        engine.push_pieces(&["a", "b", "c"]);
        engine.fail_next_detokenize(1);
        let pool = pool(&engine, 1);

        let mut pass = start(&pool, 64, CancellationToken::new()).await;
        let deltas = collect(&mut pass).await;

        assert_eq!(deltas, vec!["ab", "c"]);
        assert_eq!(pass.outcome(), Some(PassOutcome::Exhausted));
    }

    #[tokio::test]
    async fn test_rewritten_prefix_skips_step() {
        let engine = MockEngine::new();
        engine.push_pieces(&["ab", "c", "d"]);
        engine.rewrite_next_detokenize(&["ab", "xbc"]);
        let pool = pool(&engine, 1);

        let mut pass = start(&pool, 64, CancellationToken::new()).await;
        let deltas = collect(&mut pass).await;

        assert_eq!(deltas, vec!["ab", "cd"]);
        assert_eq!(pass.outcome(), Some(PassOutcome::Exhausted));
        assert_eq!(pass.token_count(), 3);
    }

    #[tokio::test]
    async fn test_generation_error_releases_sequence() {
        let engine = MockEngine::new();
        engine.push_script(vec![
            ScriptStep::Token('a' as TokenId),
            ScriptStep::Fail("boom".to_string()),
        ]);
        let pool = pool(&engine, 1);

        let mut pass = start(&pool, 64, CancellationToken::new()).await;
        assert_eq!(pass.next_delta().await.unwrap(), Some("a".to_string()));
        assert_eq!(
            pass.next_delta().await,
            Err(EngineError::Generation("boom".to_string()))
        );
        assert_eq!(pass.outcome(), None);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_prompt_tokens_are_punished() {
        let engine = MockEngine::new();
        engine.push_pieces(&["<|end|>"]);
        let pool = pool(&engine, 1);

        let mut pass = start(&pool, 64, CancellationToken::new()).await;
        assert!(collect(&mut pass).await.is_empty());

        let sampler = &engine.samplers()[0];
        let prompt = engine.tokenize("<|start|>user<|message|>\nHi\n<|end|>\n\n").unwrap();
        assert_eq!(sampler.punish_tokens, prompt);
        assert_eq!(sampler.temperature, 0.3);
    }

    #[test]
    fn test_holdback_len() {
        assert_eq!(holdback_len("hello"), 0);
        assert_eq!(holdback_len("hello<"), 1);
        assert_eq!(holdback_len("hello<|en"), 4);
        assert_eq!(holdback_len("hello<|end|"), 6);
        assert_eq!(holdback_len("caf\u{FFFD}"), 3);
        assert_eq!(holdback_len("<|x"), 0);
    }
}
