//! Agent 执行层：Cowork 把单个任务交给 AgentBackend 执行
//!
//! 后端统一输出规范化的 `AgentEvent`；外部后端的异构事件（node / generate|tools|retrieve / error）
//! 由 `events::adapt_json_stream` 在边界处转换，调度器只认一种形状。

pub mod direct;
pub mod events;
pub mod llm_agent;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::Result;
use crate::cowork::types::{CODING_AGENT, WEB_RESEARCH_AGENT};
use crate::llm::{Message, Role};

pub use direct::{DirectResponder, LlmDirectResponder};
pub use events::{adapt_json_stream, RawAgentEvent};
pub use llm_agent::LlmAgentBackend;

/// 执行模式（由任务的 agentType 决定）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThinkingMode {
    Agent,
    CodingAgent,
    DeepWebResearch,
}

impl ThinkingMode {
    pub fn from_agent_type(agent_type: &str) -> Self {
        match agent_type {
            CODING_AGENT => ThinkingMode::CodingAgent,
            WEB_RESEARCH_AGENT => ThinkingMode::DeepWebResearch,
            _ => ThinkingMode::Agent,
        }
    }
}

/// 后端配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub thinking_mode: ThinkingMode,
    pub enable_tools: bool,
    pub enable_rag: bool,
}

impl AgentConfig {
    /// 编码与调研模式需要工具；通用模式只做推理
    pub fn for_agent_type(agent_type: &str) -> Self {
        let thinking_mode = ThinkingMode::from_agent_type(agent_type);
        Self {
            thinking_mode,
            enable_tools: thinking_mode != ThinkingMode::Agent,
            enable_rag: false,
        }
    }
}

/// 单次执行的选项
#[derive(Debug, Clone)]
pub struct AgentRunOptions {
    pub conversation_id: String,
    pub max_iterations: usize,
    pub cancel: CancellationToken,
}

/// 规范化后的 Agent 事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// 一条完整消息；调度器取最后一条 assistant 消息作为任务结果
    Message { role: Role, content: String },
    /// 中间进度（仅记录日志）
    Progress { message: String },
    /// 执行失败
    Error { message: String },
}

impl AgentEvent {
    pub fn assistant(content: impl Into<String>) -> Self {
        AgentEvent::Message {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

pub type AgentEventStream = Pin<Box<dyn Stream<Item = AgentEvent> + Send>>;

/// 任务执行后端
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn stream_with_config(
        &self,
        config: &AgentConfig,
        messages: &[Message],
        options: AgentRunOptions,
    ) -> Result<AgentEventStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thinking_mode_lookup() {
        assert_eq!(ThinkingMode::from_agent_type(CODING_AGENT), ThinkingMode::CodingAgent);
        assert_eq!(
            ThinkingMode::from_agent_type(WEB_RESEARCH_AGENT),
            ThinkingMode::DeepWebResearch
        );
        assert_eq!(ThinkingMode::from_agent_type("agent"), ThinkingMode::Agent);
        assert_eq!(ThinkingMode::from_agent_type("unknown"), ThinkingMode::Agent);
    }

    #[test]
    fn test_tools_enabled_for_tool_modes() {
        assert!(AgentConfig::for_agent_type(CODING_AGENT).enable_tools);
        assert!(!AgentConfig::for_agent_type("agent").enable_tools);
    }
}
