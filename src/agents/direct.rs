//! 直接回复：分类结果为 direct（或规划失败）时使用，流式输出 message_chunk

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::core::{CoworkError, Result};
use crate::cowork::events::StreamEvent;
use crate::llm::{LlmClient, Message, Role};

const DIRECT_PROMPT: &str = "You are a helpful assistant. Answer the user's latest message directly and concisely.";

/// 简单应答者：把回复以 `MessageChunk` 事件写入 event_tx，返回完整文本
#[async_trait]
pub trait DirectResponder: Send + Sync {
    async fn respond(
        &self,
        messages: &[Message],
        event_tx: &UnboundedSender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<String>;
}

pub struct LlmDirectResponder {
    llm: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl LlmDirectResponder {
    pub fn new(llm: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    async fn stream_reply(
        &self,
        prompt: &[Message],
        event_tx: &UnboundedSender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let mut stream = self
            .llm
            .complete_stream(prompt)
            .await
            .map_err(CoworkError::Llm)?;
        let mut full = String::new();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CoworkError::Cancelled),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(text)) => {
                    if text.is_empty() {
                        continue;
                    }
                    full.push_str(&text);
                    let _ = event_tx.send(StreamEvent::MessageChunk { text });
                }
                Some(Err(e)) => return Err(CoworkError::Llm(e)),
                None => break,
            }
        }
        Ok(full)
    }
}

#[async_trait]
impl DirectResponder for LlmDirectResponder {
    async fn respond(
        &self,
        messages: &[Message],
        event_tx: &UnboundedSender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let mut prompt = vec![Message::system(DIRECT_PROMPT)];
        prompt.extend(messages.iter().filter(|m| m.role != Role::System).cloned());

        tokio::time::timeout(self.timeout, self.stream_reply(&prompt, event_tx, cancel))
            .await
            .map_err(|_| CoworkError::LlmTimeout(self.timeout.as_secs()))?
    }
}
