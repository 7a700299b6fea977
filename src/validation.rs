//! 输入校验：消息结构、内容清洗、采样参数钳制
//!
//! 所有检查都发生在模型交互之前；失败即返回 ValidationError，不会开始任何流式输出。

use serde_json::Value;

use crate::core::ValidationError;
use crate::engine::SamplerParams;
use crate::harmony::{Channel, Message, ReasoningMode, Role};

/// 单条消息内容上限（字符数）
pub const MAX_MESSAGE_LENGTH: usize = 10_000;
/// 单次请求消息条数上限
pub const MAX_MESSAGES: usize = 100;

/// 已通过校验的对话请求
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    pub messages: Vec<Message>,
    pub params: SamplerParams,
    pub reasoning_mode: ReasoningMode,
}

/// 去除 ASCII 控制字符（保留 \t \n \r），并截断到 MAX_MESSAGE_LENGTH
pub fn sanitize_input(input: &str) -> String {
    input
        .chars()
        .filter(|c| !is_stripped_control(*c))
        .take(MAX_MESSAGE_LENGTH)
        .collect()
}

fn is_stripped_control(c: char) -> bool {
    matches!(c, '\x00'..='\x08' | '\x0B' | '\x0C' | '\x0E'..='\x1F' | '\x7F')
}

/// 校验整条请求体：`{messages, params?: {..., reasoningMode?}}`
pub fn validate_request(body: &Value) -> Result<ValidatedRequest, ValidationError> {
    let messages = validate_messages(body.get("messages").unwrap_or(&Value::Null))?;
    let params_value = body.get("params");
    Ok(ValidatedRequest {
        messages,
        params: validate_sampler_params(params_value),
        reasoning_mode: reasoning_mode(params_value),
    })
}

/// 校验并清洗消息列表
///
/// 按下标顺序检查：对象、角色、内容类型、清洗后非空、system 仅在首位、
/// 相邻角色不重复、tool 必须紧跟 assistant。
pub fn validate_messages(value: &Value) -> Result<Vec<Message>, ValidationError> {
    let items = value.as_array().ok_or(ValidationError::NotAnArray)?;
    if items.is_empty() {
        return Err(ValidationError::Empty);
    }
    if items.len() > MAX_MESSAGES {
        return Err(ValidationError::TooMany { max: MAX_MESSAGES });
    }

    let mut messages: Vec<Message> = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let obj = item
            .as_object()
            .ok_or(ValidationError::NotAnObject { index })?;

        let role = match obj.get("role") {
            Some(Value::String(s)) => Role::parse(s).ok_or_else(|| ValidationError::InvalidRole {
                index,
                role: s.clone(),
            })?,
            other => {
                return Err(ValidationError::InvalidRole {
                    index,
                    role: other.map(Value::to_string).unwrap_or_else(|| "undefined".to_string()),
                })
            }
        };

        let content = obj
            .get("content")
            .and_then(Value::as_str)
            .ok_or(ValidationError::InvalidContent { index })?;
        let content = sanitize_input(content);
        if content.is_empty() {
            return Err(ValidationError::EmptyContent { index });
        }

        if role == Role::System && index != 0 {
            return Err(ValidationError::SystemNotFirst { index });
        }

        let last_role = messages.last().map(|m| m.role);
        if last_role == Some(role) {
            return Err(ValidationError::ConsecutiveRole {
                index,
                role: role.to_string(),
            });
        }
        if role == Role::Tool && last_role != Some(Role::Assistant) {
            return Err(ValidationError::ToolWithoutAssistant { index });
        }

        let channel = obj.get("channel").and_then(Value::as_str).and_then(Channel::parse);
        messages.push(Message {
            role,
            content,
            channel,
        });
    }

    if let Some(last) = messages.last() {
        if !matches!(last.role, Role::User | Role::Tool) {
            tracing::warn!(
                role = %last.role,
                "Last message is not from user or tool - this may not generate a response"
            );
        }
    }

    Ok(messages)
}

/// 钳制采样参数：非数字或缺失的字段直接忽略，未知字段忽略
pub fn validate_sampler_params(value: Option<&Value>) -> SamplerParams {
    let Some(obj) = value.and_then(Value::as_object) else {
        return SamplerParams::default();
    };

    let mut params = SamplerParams::default();
    if let Some(v) = obj.get("temperature").and_then(Value::as_f64) {
        params = params.with_temperature(v);
    }
    if let Some(v) = obj.get("topP").and_then(Value::as_f64) {
        params = params.with_top_p(v);
    }
    if let Some(v) = obj.get("repeatPenalty").and_then(Value::as_f64) {
        params = params.with_repeat_penalty(v);
    }
    if let Some(v) = obj.get("maxTokens").and_then(Value::as_f64) {
        params = params.with_max_tokens(v);
    }
    params
}

/// 读取 params.reasoningMode，缺失或无法识别时为 low
pub fn reasoning_mode(value: Option<&Value>) -> ReasoningMode {
    value
        .and_then(|v| v.get("reasoningMode"))
        .and_then(Value::as_str)
        .map(ReasoningMode::parse_lenient)
        .unwrap_or_default()
}
