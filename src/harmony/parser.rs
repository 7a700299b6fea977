//! 响应解析：从累积文本中提取 `<|channel|>名称<|message|>正文` 频道片段
//!
//! 正文截止于下一个 `<|channel|>`、`<|end|>` 或文本末尾；无任何频道标记时整段文本视为 final。
//! 单次前向扫描，不回溯。

use std::collections::BTreeMap;

use serde::Serialize;

use super::{CHANNEL, END, MESSAGE};

/// 解析结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedResponse {
    /// 频道名 → 正文（已 trim；同名频道后者覆盖前者）
    pub channels: BTreeMap<String, String>,
    pub has_channels: bool,
    /// final 频道正文；无频道时为整段文本
    pub content: String,
}

impl ParsedResponse {
    pub fn channel(&self, name: &str) -> Option<&str> {
        self.channels.get(name).map(String::as_str)
    }

    /// analysis 频道（推理过程），空串视为不存在
    pub fn reasoning(&self) -> Option<&str> {
        self.channel("analysis").filter(|s| !s.is_empty())
    }

    pub fn commentary(&self) -> Option<&str> {
        self.channel("commentary").filter(|s| !s.is_empty())
    }

    /// final 频道正文，空串视为不存在
    pub fn final_answer(&self) -> Option<&str> {
        self.channel("final").filter(|s| !s.is_empty())
    }
}

pub fn parse_response(text: &str) -> ParsedResponse {
    let mut channels = BTreeMap::new();
    let mut has_channels = false;
    let mut pos = 0;

    while let Some(rel) = text[pos..].find(CHANNEL) {
        let tag_start = pos + rel;
        let name_start = tag_start + CHANNEL.len();
        let name_len = text[name_start..]
            .bytes()
            .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
            .count();
        let name_end = name_start + name_len;

        if name_len == 0 || !text[name_end..].starts_with(MESSAGE) {
            // 不是完整的频道头，跳过这个 `<` 继续找
            pos = tag_start + 1;
            continue;
        }

        let content_start = name_end + MESSAGE.len();
        let rest = &text[content_start..];
        let content_len = [rest.find(CHANNEL), rest.find(END)]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(rest.len());

        channels.insert(
            text[name_start..name_end].to_string(),
            rest[..content_len].trim().to_string(),
        );
        has_channels = true;
        pos = content_start + content_len;
    }

    let content = match channels.get("final") {
        Some(final_text) => final_text.clone(),
        None if has_channels => String::new(),
        None => text.trim().to_string(),
    };

    ParsedResponse {
        channels,
        has_channels,
        content,
    }
}
