//! Prompt 编码：消息列表 + 推理模式 → 单条线性 Prompt
//!
//! 纯函数：相同输入永远得到相同字符串。

use super::{Channel, Message, ReasoningMode, Role, CHANNEL, END, MESSAGE, START};

/// 非 low 模式下注入 system 轮次的指令
pub const FINAL_CHANNEL_DIRECTIVE: &str =
    "# Always provide your final answer in the 'final' channel after any analysis";

/// 将已校验的消息渲染为 Harmony Prompt，并以 assistant 轮次开头结尾
///
/// - 仅首条 system 消息生效，并携带 `Reasoning: <mode>` 指令
/// - user 轮次为纯文本；assistant 轮次若指定频道则打上频道标签
/// - tool 消息不渲染（仅参与结构校验）
/// - 结尾：low 直接打开 final 频道，否则打开 analysis 频道
pub fn encode_prompt(messages: &[Message], mode: ReasoningMode) -> String {
    let mut prompt = String::new();

    if let Some(system) = messages.first().filter(|m| m.role == Role::System) {
        prompt.push_str(START);
        prompt.push_str("system");
        prompt.push_str(MESSAGE);
        prompt.push('\n');
        prompt.push_str(&format!("Reasoning: {}\n", mode));
        if mode.is_reasoning() {
            prompt.push_str(FINAL_CHANNEL_DIRECTIVE);
            prompt.push('\n');
        }
        prompt.push_str(&system.content);
        prompt.push('\n');
        prompt.push_str(END);
        prompt.push_str("\n\n");
    }

    for message in messages {
        match message.role {
            Role::System | Role::Tool => continue,
            Role::User => push_turn(&mut prompt, "user", None, &message.content),
            Role::Assistant => {
                push_turn(&mut prompt, "assistant", message.channel, &message.content)
            }
        }
    }

    let open_channel = if mode.is_reasoning() {
        Channel::Analysis
    } else {
        Channel::Final
    };
    prompt.push_str(&open_assistant_turn(open_channel));

    prompt
}

/// 打开一个 assistant 轮次并直接进入指定频道（不闭合）
pub fn open_assistant_turn(channel: Channel) -> String {
    format!("{START}assistant{CHANNEL}{}{MESSAGE}", channel.as_str())
}

/// 以频道标签包裹一段文本（不含轮次边界）
pub fn channel_segment(channel: Channel, text: &str) -> String {
    format!("{CHANNEL}{}{MESSAGE}{text}", channel.as_str())
}

fn push_turn(prompt: &mut String, role: &str, channel: Option<Channel>, content: &str) {
    prompt.push_str(START);
    prompt.push_str(role);
    if let Some(channel) = channel {
        prompt.push_str(CHANNEL);
        prompt.push_str(channel.as_str());
    }
    prompt.push_str(MESSAGE);
    prompt.push('\n');
    prompt.push_str(content);
    prompt.push('\n');
    prompt.push_str(END);
    prompt.push_str("\n\n");
}
