//! 续写编排：分析生成 → 判定 → [最终回答生成] → 结束
//!
//! 非 low 模式下，若第一次生成只有分析（或完全没有频道结构），
//! 则把分析内容作为 assistant 消息追加到原始对话，强制以 final 频道再生成一次。
//! 两次生成的 token 事件共同计入外层预算（baseCap × 2 或 baseCap）。

use std::sync::Arc;

use futures_util::{stream, Stream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::{DoneReason, Phase, StreamEvent};
use crate::core::EngineError;
use crate::engine::{PassOutcome, SamplerParams};
use crate::harmony::encoder::{channel_segment, open_assistant_turn};
use crate::harmony::{encode_prompt, parse_response, Channel, Message, ReasoningMode, CHANNEL, END};
use crate::runtime::ModelRuntime;
use crate::validation::ValidatedRequest;

/// 请求未指定 maxTokens 时的基础上限
pub const DEFAULT_MAX_TOKENS: u32 = 1024;

/// 事件通道容量
const EVENT_BUFFER: usize = 64;

/// 一次生成的结束方式（相对于外层请求）
enum PassEnd {
    Complete,
    CapReached,
    Stopped,
}

/// 单个请求的生成状态：外层预算、已发 token 事件数、累计文本
struct Turn<'a> {
    events: &'a mpsc::Sender<StreamEvent>,
    cancel: &'a CancellationToken,
    params: SamplerParams,
    budget: usize,
    emitted: usize,
    full_response: String,
}

impl Turn<'_> {
    /// 发送事件；对端已断开时视为取消
    async fn send(&mut self, event: StreamEvent) -> bool {
        if self.events.send(event).await.is_err() {
            tracing::info!("Client disconnected, stopping generation");
            self.cancel.cancel();
            return false;
        }
        true
    }
}

#[derive(Clone)]
pub struct ChatOrchestrator {
    runtime: Arc<ModelRuntime>,
    default_max_tokens: u32,
}

impl ChatOrchestrator {
    pub fn new(runtime: Arc<ModelRuntime>, default_max_tokens: u32) -> Self {
        Self {
            runtime,
            default_max_tokens,
        }
    }

    pub fn runtime(&self) -> &Arc<ModelRuntime> {
        &self.runtime
    }

    /// 在后台任务中运行请求，返回事件流；流在 done / error 之后结束
    pub fn stream(&self, request: ValidatedRequest) -> impl Stream<Item = StreamEvent> + Send + 'static {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let orchestrator = self.clone();
        let span = tracing::info_span!("chat", request_id = %Uuid::new_v4());
        tokio::spawn(
            async move {
                orchestrator.run(request, tx).await;
            }
            .instrument(span),
        );

        stream::unfold(rx, |mut rx| async move {
            let event = rx.recv().await?;
            Some((event, rx))
        })
    }

    /// 运行完整的请求状态机，事件写入 `events`；恰好发送一个终止事件
    pub async fn run(&self, request: ValidatedRequest, events: mpsc::Sender<StreamEvent>) {
        let generation = self.runtime.track();
        let cancel = generation.token().clone();

        let terminal = match self.generate(&request, &events, &cancel).await {
            Ok(reason) => {
                tracing::info!(?reason, "Generation complete");
                StreamEvent::Done(reason)
            }
            Err(e) => {
                tracing::warn!("Generation failed: {}", e);
                StreamEvent::Error(e.to_string())
            }
        };
        let _ = events.send(terminal).await;
    }

    async fn generate(
        &self,
        request: &ValidatedRequest,
        events: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<Option<DoneReason>, EngineError> {
        let mode = request.reasoning_mode;
        let base_cap = request.params.max_tokens.unwrap_or(self.default_max_tokens);
        let first_cap = if mode.is_reasoning() {
            base_cap.saturating_mul(2)
        } else {
            base_cap
        };
        tracing::info!(
            messages = request.messages.len(),
            mode = %mode,
            max_tokens = first_cap,
            "Starting generation"
        );

        let mut turn = Turn {
            events,
            cancel,
            params: request.params,
            budget: first_cap as usize,
            emitted: 0,
            full_response: String::new(),
        };

        let prompt = encode_prompt(&request.messages, mode);
        let mut hit_cap = match self.run_pass(&mut turn, &prompt, first_cap).await? {
            PassEnd::Stopped => return Ok(Some(DoneReason::Stopped)),
            PassEnd::CapReached => true,
            PassEnd::Complete => false,
        };
        if turn.emitted >= turn.budget {
            return Ok(Some(DoneReason::MaxTokens));
        }

        if !needs_continuation(mode, &turn.full_response) {
            return Ok(hit_cap.then_some(DoneReason::MaxTokens));
        }
        if cancel.is_cancelled() {
            return Ok(Some(DoneReason::Stopped));
        }

        tracing::info!("Analysis without final answer, continuing with final channel");
        if !turn.send(StreamEvent::Phase(Phase::ReasoningComplete)).await {
            return Ok(Some(DoneReason::Stopped));
        }
        let continuation = continuation_messages(&request.messages, &turn.full_response);
        if !turn.send(StreamEvent::Phase(Phase::FinalAnswer)).await {
            return Ok(Some(DoneReason::Stopped));
        }

        let prompt = encode_prompt(&continuation, ReasoningMode::Low);
        match self.run_pass(&mut turn, &prompt, base_cap).await? {
            PassEnd::Stopped => return Ok(Some(DoneReason::Stopped)),
            PassEnd::CapReached => hit_cap = true,
            PassEnd::Complete => {}
        }

        let parsed = parse_response(&turn.full_response);
        tracing::debug!(
            has_channels = parsed.has_channels,
            channels = ?parsed.channels.keys().collect::<Vec<_>>(),
            tokens = turn.emitted,
            "Final response parsed"
        );
        Ok(hit_cap.then_some(DoneReason::MaxTokens))
    }

    /// 运行一次生成，把增量作为 token 事件发出并累计到 full_response
    async fn run_pass(
        &self,
        turn: &mut Turn<'_>,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<PassEnd, EngineError> {
        let mut pass = self
            .runtime
            .start_pass(prompt, &turn.params, max_tokens, turn.cancel.clone())
            .await?;

        while let Some(delta) = pass.next_delta().await? {
            turn.full_response.push_str(&delta);
            if !turn.send(StreamEvent::Token(delta)).await {
                return Ok(PassEnd::Stopped);
            }
            turn.emitted += 1;
            if turn.emitted >= turn.budget {
                tracing::info!(max_tokens = turn.budget, "Max tokens reached");
                return Ok(PassEnd::CapReached);
            }
        }

        Ok(match pass.outcome() {
            Some(PassOutcome::Cancelled) => PassEnd::Stopped,
            Some(PassOutcome::MaxTokens) => PassEnd::CapReached,
            _ => PassEnd::Complete,
        })
    }
}

/// 非 low 模式下，只有分析而没有最终回答（或完全没有频道结构）时需要续写
pub fn needs_continuation(mode: ReasoningMode, full_response: &str) -> bool {
    if !mode.is_reasoning() {
        return false;
    }
    let parsed = parse_response(full_response);
    let analysis_only = parsed.reasoning().is_some() && parsed.final_answer().is_none();
    let unstructured = !parsed.has_channels && !full_response.is_empty();
    analysis_only || unstructured
}

/// 原始消息 + 一条合成的 assistant 消息（分析内容 + 打开 final 频道）
pub fn continuation_messages(messages: &[Message], analysis: &str) -> Vec<Message> {
    let tagged = if analysis.contains(CHANNEL) {
        format!("{analysis}{END}\n\n")
    } else {
        format!("{}{END}\n\n", channel_segment(Channel::Analysis, analysis))
    };

    let mut continuation = messages.to_vec();
    continuation.push(Message::assistant(tagged + &open_assistant_turn(Channel::Final)));
    continuation
}
