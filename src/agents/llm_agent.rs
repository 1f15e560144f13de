//! 基于 LlmClient 的 Agent 后端：每种执行模式一段 system prompt，单次调用得到结果
//!
//! 没有外部 Agent 服务时由二进制使用，也便于本地端到端运行。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use tracing::debug;

use crate::agents::{AgentBackend, AgentConfig, AgentEvent, AgentEventStream, AgentRunOptions, ThinkingMode};
use crate::core::{CoworkError, Result};
use crate::llm::{complete_with_timeout, LlmClient, Message};

const AGENT_PROMPT: &str = "You are a capable assistant completing one task of a larger plan. \
Work only on the task you are given and reply with the finished result.";

const CODING_AGENT_PROMPT: &str = "You are a senior software engineer completing one task of a larger plan. \
Produce complete, working code and any files the task asks for. \
Reply with the code and a short summary of what was done.";

const RESEARCH_AGENT_PROMPT: &str = "You are a research analyst completing one task of a larger plan. \
Gather the relevant facts, compare sources where possible and reply with a structured summary of findings.";

fn system_prompt(mode: ThinkingMode) -> &'static str {
    match mode {
        ThinkingMode::Agent => AGENT_PROMPT,
        ThinkingMode::CodingAgent => CODING_AGENT_PROMPT,
        ThinkingMode::DeepWebResearch => RESEARCH_AGENT_PROMPT,
    }
}

pub struct LlmAgentBackend {
    llm: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl LlmAgentBackend {
    pub fn new(llm: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }
}

#[async_trait]
impl AgentBackend for LlmAgentBackend {
    async fn stream_with_config(
        &self,
        config: &AgentConfig,
        messages: &[Message],
        options: AgentRunOptions,
    ) -> Result<AgentEventStream> {
        debug!(
            conversation_id = %options.conversation_id,
            mode = ?config.thinking_mode,
            "LLM agent run"
        );
        let mut prompt = vec![Message::system(system_prompt(config.thinking_mode))];
        prompt.extend_from_slice(messages);

        let outcome = tokio::select! {
            biased;
            _ = options.cancel.cancelled() => Err(CoworkError::Cancelled),
            r = complete_with_timeout(self.llm.as_ref(), &prompt, self.timeout) => r,
        };

        let events = match outcome {
            Ok(content) => vec![
                AgentEvent::Progress {
                    message: format!("{:?} finished", config.thinking_mode),
                },
                AgentEvent::assistant(content),
            ],
            Err(CoworkError::Cancelled) => return Err(CoworkError::Cancelled),
            Err(e) => vec![AgentEvent::Error {
                message: e.to_string(),
            }],
        };
        Ok(Box::pin(stream::iter(events)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cowork::types::CODING_AGENT;
    use crate::llm::ScriptedLlmClient;
    use futures_util::StreamExt;
    use tokio_util::sync::CancellationToken;

    fn options() -> AgentRunOptions {
        AgentRunOptions {
            conversation_id: "conv".into(),
            max_iterations: 5,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_mode_prompt_and_result() {
        let llm = Arc::new(ScriptedLlmClient::with_replies(["fn main() {}"]));
        let backend = LlmAgentBackend::new(llm.clone(), Duration::from_secs(5));
        let events: Vec<AgentEvent> = backend
            .stream_with_config(
                &AgentConfig::for_agent_type(CODING_AGENT),
                &[Message::user("write main")],
                options(),
            )
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(events.last(), Some(&AgentEvent::assistant("fn main() {}")));
        assert_eq!(llm.calls()[0][0].content, CODING_AGENT_PROMPT);
    }

    #[tokio::test]
    async fn test_llm_error_becomes_error_event() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![Err("down".into())]));
        let backend = LlmAgentBackend::new(llm, Duration::from_secs(5));
        let events: Vec<AgentEvent> = backend
            .stream_with_config(&AgentConfig::for_agent_type("agent"), &[], options())
            .await
            .unwrap()
            .collect()
            .await;
        assert!(matches!(&events[0], AgentEvent::Error { message } if message.contains("down")));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let llm = Arc::new(ScriptedLlmClient::with_replies(["never"]));
        let backend = LlmAgentBackend::new(llm, Duration::from_secs(5));
        let opts = options();
        opts.cancel.cancel();
        let result = backend
            .stream_with_config(&AgentConfig::for_agent_type("agent"), &[], opts)
            .await;
        assert!(matches!(result, Err(CoworkError::Cancelled)));
    }
}
