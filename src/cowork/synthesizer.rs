//! Synthesizer：根据目标与各任务结果生成最终报告
//!
//! LLM 调用失败、超时或返回空文本时退回到一行计数摘要，保证输出非空。

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::cowork::dispatcher::truncate_chars;
use crate::cowork::types::{Plan, TaskStatus};
use crate::llm::{complete_with_timeout, LlmClient, Message};

const SYNTHESIS_PROMPT: &str = "You are writing the final report for a multi-step task that several agents worked on. \
Combine the task results into one coherent answer for the user. \
Lead with what was accomplished, mention failed or skipped steps briefly, and do not invent results that are not listed.";

fn status_glyph(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Completed => "✅",
        TaskStatus::Failed => "❌",
        TaskStatus::Skipped => "⏭️",
        _ => "⏳",
    }
}

/// 每个任务一行：状态符号 + 标题 + 截断后的结果
pub fn task_summary(plan: &Plan, result_chars: usize) -> String {
    plan.tasks
        .iter()
        .map(|t| {
            let result = t.result.as_deref().unwrap_or("(no result)");
            format!(
                "{} [{}] {}: {}",
                status_glyph(t.status),
                t.id,
                t.title,
                truncate_chars(result, result_chars)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// 兜底摘要：`completed: N, failed: M, skipped: K / total T`
pub fn fallback_summary(plan: &Plan) -> String {
    let c = plan.counts();
    format!(
        "completed: {}, failed: {}, skipped: {} / total {}",
        c.completed, c.failed, c.skipped, c.total
    )
}

pub struct Synthesizer {
    llm: Arc<dyn LlmClient>,
    timeout: Duration,
    result_chars: usize,
}

impl Synthesizer {
    pub fn new(llm: Arc<dyn LlmClient>, timeout: Duration, result_chars: usize) -> Self {
        Self {
            llm,
            timeout,
            result_chars,
        }
    }

    pub async fn synthesize(&self, plan: &Plan) -> String {
        let prompt = vec![
            Message::system(SYNTHESIS_PROMPT),
            Message::user(format!(
                "Objective: {}\n\nTask results:\n{}",
                plan.objective,
                task_summary(plan, self.result_chars)
            )),
        ];

        match complete_with_timeout(self.llm.as_ref(), &prompt, self.timeout).await {
            Ok(report) if !report.trim().is_empty() => report,
            Ok(_) => {
                warn!("Synthesis returned empty text, using summary");
                fallback_summary(plan)
            }
            Err(e) => {
                warn!("Synthesis failed, using summary: {}", e);
                fallback_summary(plan)
            }
        }
    }
}
