//! 流式事件：`{token}` / `{phase}` / `{done, reason?}` / `{error}`

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// 分析阶段与最终回答之间的带外标记
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    ReasoningComplete,
    FinalAnswer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    MaxTokens,
    Stopped,
}

/// 编排器产出、调用方只读的事件；done / error 之后不再有事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Token(String),
    Phase(Phase),
    Done(Option<DoneReason>),
    Error(String),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done(_) | StreamEvent::Error(_))
    }
}

impl Serialize for StreamEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            StreamEvent::Token(token) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("token", token)?;
                map.end()
            }
            StreamEvent::Phase(phase) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("phase", phase)?;
                map.end()
            }
            StreamEvent::Done(reason) => {
                let mut map = serializer.serialize_map(Some(1 + reason.is_some() as usize))?;
                map.serialize_entry("done", &true)?;
                if let Some(reason) = reason {
                    map.serialize_entry("reason", reason)?;
                }
                map.end()
            }
            StreamEvent::Error(message) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("error", message)?;
                map.end()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format() {
        let cases = [
            (StreamEvent::Token("Hi".into()), json!({"token": "Hi"})),
            (
                StreamEvent::Phase(Phase::ReasoningComplete),
                json!({"phase": "reasoning_complete"}),
            ),
            (StreamEvent::Phase(Phase::FinalAnswer), json!({"phase": "final_answer"})),
            (StreamEvent::Done(None), json!({"done": true})),
            (
                StreamEvent::Done(Some(DoneReason::MaxTokens)),
                json!({"done": true, "reason": "max_tokens"}),
            ),
            (
                StreamEvent::Done(Some(DoneReason::Stopped)),
                json!({"done": true, "reason": "stopped"}),
            ),
            (StreamEvent::Error("boom".into()), json!({"error": "boom"})),
        ];

        for (event, expected) in cases {
            assert_eq!(serde_json::to_value(&event).unwrap(), expected);
        }
    }

    #[test]
    fn test_terminal_events() {
        assert!(StreamEvent::Done(None).is_terminal());
        assert!(StreamEvent::Error("x".into()).is_terminal());
        assert!(!StreamEvent::Token("x".into()).is_terminal());
        assert!(!StreamEvent::Phase(Phase::FinalAnswer).is_terminal());
    }
}
