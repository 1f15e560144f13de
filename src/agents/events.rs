//! 外部 Agent 后端的原始事件及其到 `AgentEvent` 的转换
//!
//! 支持三种形状：
//! - `{"type": "node", "data": {"messages": [...]}}`
//! - `{"generate" | "tools" | "retrieve": {"messages": [...]}}`（无 type 字段）
//! - `{"type": "error", "error": ...}`

use futures_util::{stream, Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::agents::{AgentEvent, AgentEventStream};
use crate::llm::Role;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessagesPayload {
    #[serde(default)]
    pub messages: Vec<RawMessage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaggedEvent {
    Node {
        #[serde(default)]
        data: MessagesPayload,
    },
    Error {
        #[serde(default)]
        error: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StepEvent {
    pub generate: Option<MessagesPayload>,
    pub tools: Option<MessagesPayload>,
    pub retrieve: Option<MessagesPayload>,
}

/// 原始事件；先尝试带 type 的形状，再退回按步骤名分组的形状
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawAgentEvent {
    Tagged(TaggedEvent),
    Step(StepEvent),
}

fn parse_role(role: &str) -> Option<Role> {
    match role.to_lowercase().as_str() {
        "assistant" | "ai" => Some(Role::Assistant),
        "user" | "human" => Some(Role::User),
        "system" => Some(Role::System),
        _ => None,
    }
}

/// content 可能是字符串，也可能是 `[{"type": "text", "text": ...}]` 形式的分段
fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| match p {
                Value::String(s) => Some(s.as_str()),
                other => other.get("text").and_then(Value::as_str),
            })
            .collect::<Vec<_>>()
            .join(""),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn error_text(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Null => "unknown agent error".to_string(),
        other => other
            .get("message")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| other.to_string()),
    }
}

fn messages_to_events(payload: MessagesPayload) -> impl Iterator<Item = AgentEvent> {
    payload.messages.into_iter().filter_map(|m| {
        let role = parse_role(&m.role)?;
        Some(AgentEvent::Message {
            role,
            content: content_text(&m.content),
        })
    })
}

impl RawAgentEvent {
    pub fn normalize(self) -> Vec<AgentEvent> {
        match self {
            RawAgentEvent::Tagged(TaggedEvent::Node { data }) => messages_to_events(data).collect(),
            RawAgentEvent::Tagged(TaggedEvent::Error { error }) => vec![AgentEvent::Error {
                message: error_text(&error),
            }],
            RawAgentEvent::Tagged(TaggedEvent::Other) => Vec::new(),
            RawAgentEvent::Step(step) => [step.generate, step.tools, step.retrieve]
                .into_iter()
                .flatten()
                .flat_map(messages_to_events)
                .collect(),
        }
    }
}

/// 把外部后端的 JSON 事件流转换成规范事件流；无法识别的事件丢弃
pub fn adapt_json_stream<S>(raw: S) -> AgentEventStream
where
    S: Stream<Item = Value> + Send + 'static,
{
    Box::pin(raw.flat_map(|value| {
        let events = match serde_json::from_value::<RawAgentEvent>(value) {
            Ok(event) => event.normalize(),
            Err(e) => {
                debug!("Dropping unrecognized agent event: {}", e);
                Vec::new()
            }
        };
        stream::iter(events)
    }))
}
