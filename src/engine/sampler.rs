//! 采样参数：请求侧（可选字段，已钳制）与引擎侧（已解析的具体值）

use serde::Serialize;

use super::TokenId;

pub const MIN_TEMPERATURE: f64 = 0.0;
pub const MAX_TEMPERATURE: f64 = 2.0;
pub const MIN_TOP_P: f64 = 0.0;
pub const MAX_TOP_P: f64 = 1.0;
pub const MIN_REPEAT_PENALTY: f64 = 0.1;
pub const MAX_REPEAT_PENALTY: f64 = 2.0;
pub const MIN_TOKENS: u32 = 1;
pub const MAX_TOKENS: u32 = 4096;

/// 请求携带的采样参数：每个字段独立可选，出现时已钳制到合法区间
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplerParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl SamplerParams {
    pub fn with_temperature(mut self, value: f64) -> Self {
        self.temperature = Some(value.clamp(MIN_TEMPERATURE, MAX_TEMPERATURE) as f32);
        self
    }

    pub fn with_top_p(mut self, value: f64) -> Self {
        self.top_p = Some(value.clamp(MIN_TOP_P, MAX_TOP_P) as f32);
        self
    }

    pub fn with_repeat_penalty(mut self, value: f64) -> Self {
        self.repeat_penalty = Some(value.clamp(MIN_REPEAT_PENALTY, MAX_REPEAT_PENALTY) as f32);
        self
    }

    /// 先向下取整再钳制到 [1, 4096]
    pub fn with_max_tokens(mut self, value: f64) -> Self {
        let floored = value.floor().clamp(MIN_TOKENS as f64, MAX_TOKENS as f64);
        self.max_tokens = Some(floored as u32);
        self
    }

    /// 结合默认值与 Prompt token（重复惩罚对象）得到引擎使用的采样配置
    pub fn resolve(&self, defaults: &SamplerDefaults, punish_tokens: Vec<TokenId>) -> SamplerConfig {
        SamplerConfig {
            temperature: self.temperature.unwrap_or(defaults.temperature),
            top_p: self.top_p.unwrap_or(defaults.top_p),
            repeat_penalty: self.repeat_penalty.unwrap_or(defaults.repeat_penalty),
            punish_tokens,
        }
    }
}

/// 未指定时使用的采样默认值
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDefaults {
    pub temperature: f32,
    pub top_p: f32,
    pub repeat_penalty: f32,
}

impl Default for SamplerDefaults {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            top_p: 0.9,
            repeat_penalty: 1.1,
        }
    }
}

/// 单次生成使用的采样配置
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub repeat_penalty: f32,
    /// 受重复惩罚的 token（即 Prompt 自身的 token）
    pub punish_tokens: Vec<TokenId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamping() {
        let params = SamplerParams::default()
            .with_temperature(5.0)
            .with_top_p(-1.0)
            .with_repeat_penalty(0.0)
            .with_max_tokens(99_999.0);

        assert_eq!(params.temperature, Some(2.0));
        assert_eq!(params.top_p, Some(0.0));
        assert_eq!(params.repeat_penalty, Some(0.1));
        assert_eq!(params.max_tokens, Some(4096));
    }

    #[test]
    fn test_max_tokens_is_floored() {
        let params = SamplerParams::default().with_max_tokens(12.9);
        assert_eq!(params.max_tokens, Some(12));

        let params = SamplerParams::default().with_max_tokens(0.5);
        assert_eq!(params.max_tokens, Some(1));
    }

    #[test]
    fn test_resolve_uses_defaults() {
        let config = SamplerParams::default()
            .with_temperature(1.0)
            .resolve(&SamplerDefaults::default(), vec![1, 2, 3]);

        assert_eq!(config.temperature, 1.0);
        assert_eq!(config.top_p, 0.9);
        assert_eq!(config.repeat_penalty, 1.1);
        assert_eq!(config.punish_tokens, vec![1, 2, 3]);
    }
}
