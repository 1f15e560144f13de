//! Cowork 过程事件：引擎唯一的输出通道
//!
//! 序列化为 `{"type": "...", ...}`；反序列化时未知类型落入 `Unknown`，消费方应直接忽略。

use serde::{Deserialize, Serialize};

use crate::cowork::types::Plan;

/// 单个过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// 通用进度：阶段名、人类可读的状态行与迭代计数
    Node {
        node: String,
        status: String,
        iteration: usize,
        max_iterations: usize,
    },
    /// 直接回复或最终报告的一段文本
    MessageChunk { text: String },
    /// 完整计划
    CoworkPlan { plan: Plan },
    /// 从磁盘恢复了上次未完成的会话
    CoworkResumed {
        conversation_id: String,
        cached_results: usize,
    },
    CoworkTaskStart {
        task_id: String,
        title: String,
        agent_type: String,
    },
    CoworkTaskComplete { task_id: String, result: String },
    CoworkTaskFailed { task_id: String, error: String },
    /// 因依赖未满足、预算不足或取消而跳过
    CoworkTaskSkipped { task_id: String, reason: String },
    CoworkSynthesizing,
    /// 汇总报告全文
    CoworkReport { content: String },
    End,
    /// 流水线级错误；之后不再有事件
    Error { message: String },
    #[serde(other)]
    Unknown,
}

impl StreamEvent {
    pub fn node(
        node: impl Into<String>,
        status: impl Into<String>,
        iteration: usize,
        max_iterations: usize,
    ) -> Self {
        StreamEvent::Node {
            node: node.into(),
            status: status.into(),
            iteration,
            max_iterations,
        }
    }

    /// 是否为终止事件（end / error）
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::End | StreamEvent::Error { .. })
    }
}
