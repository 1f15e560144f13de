//! Dispatcher：把计划中的每个任务推进到终态
//!
//! 就绪队列调度：依赖全部处于 completed / failed 的 pending 任务即为就绪，按计划声明顺序派发，
//! 同时在途任务数不超过 `max_parallel_tasks`（默认 1，即逐个执行）。
//!
//! - 依赖为 skipped 或不存在于计划中：任务直接 skipped（依赖未满足），不重试
//! - 派发前预留预算；不足时 skipped 且不扣费；已预留的预算即使任务失败也不退还
//! - 已完成依赖的结果截断后作为 system 消息注入到任务指令之前
//! - 单个任务失败不会中止计划；取消时在途任务 failed、剩余任务 skipped
//! - 同一 id 只对应一个任务：后出现的重复任务直接 skipped

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agents::{AgentBackend, AgentConfig, AgentEvent, AgentRunOptions};
use crate::config::CoworkSettings;
use crate::core::{CoworkError, Result};
use crate::cowork::budget::TokenBudget;
use crate::cowork::events::StreamEvent;
use crate::cowork::store::{PersistencePolicy, SessionStore};
use crate::cowork::types::{Plan, SessionMeta, Task, TaskResultRecord, TaskStatus};
use crate::llm::{Message, Role};

pub const DEPENDENCY_NOT_MET: &str = "Skipped: dependency not met";
pub const BUDGET_EXCEEDED: &str = "Skipped: estimated token cost exceeds the remaining session budget";
pub const CANCELLED: &str = "cancelled";
pub const DUPLICATE_TASK_ID: &str = "Skipped: duplicate task id";

const DISPATCH_NODE: &str = "cowork_dispatch";

/// 按字符截断（不会切断多字节字符）
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...[truncated]", &text[..idx]),
        None => text.to_string(),
    }
}

/// 一次调度所需的外部句柄
pub struct DispatchContext<'a> {
    pub conversation_id: &'a str,
    pub store: &'a SessionStore,
    pub event_tx: &'a UnboundedSender<StreamEvent>,
    pub cancel: &'a CancellationToken,
}

impl DispatchContext<'_> {
    fn emit(&self, event: StreamEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// 调度结束后的统计
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub budget: TokenBudget,
    /// 实际交给 Agent 执行的任务数
    pub executed: usize,
    /// 从缓存恢复的任务数
    pub restored: usize,
}

/// 用缓存结果恢复计划：缓存为 completed 的任务直接标记完成，其余非 pending 任务重置后重跑
pub fn apply_cached_results(plan: &mut Plan, cached: &HashMap<String, TaskResultRecord>) -> usize {
    let mut restored = 0;
    for task in &mut plan.tasks {
        match cached.get(&task.id) {
            Some(record) if record.status == TaskStatus::Completed => {
                task.restore_completed(record.result.clone(), record.completed_at);
                restored += 1;
            }
            _ if task.status != TaskStatus::Pending => task.reset(),
            _ => {}
        }
    }
    restored
}

/// 依赖是否阻塞：依赖 skipped 或不存在则永远无法满足
fn is_blocked(plan: &Plan, task: &Task) -> bool {
    task.dependencies.iter().any(|dep| match plan.task(dep) {
        Some(d) => d.status == TaskStatus::Skipped,
        None => true,
    })
}

fn is_ready(plan: &Plan, task: &Task) -> bool {
    task.status == TaskStatus::Pending
        && task
            .dependencies
            .iter()
            .all(|dep| plan.task(dep).is_some_and(|d| d.status.satisfies_dependency()))
}

/// 任务消息：已完成依赖的结果（system）+ 任务指令（user）
pub fn build_task_messages(plan: &Plan, task: &Task, context_chars: usize) -> Vec<Message> {
    let mut messages = Vec::new();
    for dep_id in &task.dependencies {
        let Some(dep) = plan.task(dep_id) else { continue };
        if dep.status != TaskStatus::Completed {
            continue;
        }
        let Some(result) = dep.result.as_deref() else { continue };
        messages.push(Message::system(format!(
            "Result of prerequisite task \"{}\" ({}):\n{}",
            dep.title,
            dep.id,
            truncate_chars(result, context_chars)
        )));
    }

    let mut instruction = format!(
        "Overall objective: {}\n\nYour task: {}\n\n{}",
        plan.objective, task.title, task.description
    );
    if !messages.is_empty() {
        instruction.push_str(
            "\n\nThe results of the prerequisite tasks are provided above as context. \
Use that context directly instead of trying to read those results from files.",
        );
    }
    messages.push(Message::user(instruction));
    messages
}

/// 消费 Agent 事件流，返回最后一条非空 assistant 消息
async fn execute_task(
    agents: Arc<dyn AgentBackend>,
    config: AgentConfig,
    messages: Vec<Message>,
    options: AgentRunOptions,
    timeout: Duration,
) -> Result<String> {
    let run = async {
        let mut stream = agents.stream_with_config(&config, &messages, options).await?;
        let mut last_assistant = None;
        while let Some(event) = stream.next().await {
            match event {
                AgentEvent::Message {
                    role: Role::Assistant,
                    content,
                } if !content.trim().is_empty() => last_assistant = Some(content),
                AgentEvent::Message { .. } => {}
                AgentEvent::Progress { message } => debug!("Agent progress: {}", message),
                AgentEvent::Error { message } => return Err(CoworkError::Agent(message)),
            }
        }
        last_assistant
            .ok_or_else(|| CoworkError::Agent("agent finished without an assistant message".into()))
    };
    tokio::time::timeout(timeout, run)
        .await
        .map_err(|_| CoworkError::TaskTimeout(timeout.as_secs()))?
}

pub struct Dispatcher {
    agents: Arc<dyn AgentBackend>,
    settings: CoworkSettings,
}

impl Dispatcher {
    pub fn new(agents: Arc<dyn AgentBackend>, settings: CoworkSettings) -> Self {
        Self { agents, settings }
    }

    fn policy(&self) -> PersistencePolicy {
        PersistencePolicy::from_required(self.settings.require_persistence)
    }

    /// 保存任务结果、同步并保存 meta 与计划
    async fn persist(
        &self,
        ctx: &DispatchContext<'_>,
        plan: &Plan,
        meta: &mut SessionMeta,
        task_id: &str,
    ) -> Result<()> {
        if let Some(task) = plan.task(task_id) {
            if matches!(task.status, TaskStatus::Completed | TaskStatus::Failed) {
                let saved = ctx.store.save_task_result(&TaskResultRecord::from_task(task)).await;
                self.policy().apply(saved, "task result")?;
            }
        }
        self.sync_meta(ctx, plan, meta).await
    }

    async fn sync_meta(
        &self,
        ctx: &DispatchContext<'_>,
        plan: &Plan,
        meta: &mut SessionMeta,
    ) -> Result<()> {
        meta.sync_from_plan(plan);
        let saved = ctx.store.save_session_meta(meta).await;
        self.policy().apply(saved, "session meta")?;
        let saved = ctx.store.save_plan(plan).await;
        self.policy().apply(saved, "plan")
    }

    async fn skip_task(
        &self,
        ctx: &DispatchContext<'_>,
        plan: &mut Plan,
        meta: &mut SessionMeta,
        task_id: &str,
        reason: &str,
    ) -> Result<()> {
        let skipped = plan.task_mut(task_id).is_some_and(|t| t.skip(reason));
        if skipped {
            info!(task_id = %task_id, "{}", reason);
            ctx.emit(StreamEvent::CoworkTaskSkipped {
                task_id: task_id.to_string(),
                reason: reason.to_string(),
            });
            self.persist(ctx, plan, meta, task_id).await?;
        }
        Ok(())
    }

    async fn record_outcome(
        &self,
        ctx: &DispatchContext<'_>,
        plan: &mut Plan,
        meta: &mut SessionMeta,
        task_id: &str,
        outcome: Result<String>,
    ) -> Result<()> {
        let Some(task) = plan.task_mut(task_id) else {
            return Ok(());
        };
        match outcome {
            Ok(result) => {
                if task.complete(result.clone()) {
                    info!(task_id = %task_id, "Task completed");
                    ctx.emit(StreamEvent::CoworkTaskComplete {
                        task_id: task_id.to_string(),
                        result,
                    });
                }
            }
            Err(e) => {
                let error = e.to_string();
                if task.fail(error.clone()) {
                    warn!(task_id = %task_id, "Task failed: {}", error);
                    ctx.emit(StreamEvent::CoworkTaskFailed {
                        task_id: task_id.to_string(),
                        error,
                    });
                }
            }
        }
        self.persist(ctx, plan, meta, task_id).await
    }

    /// 依赖被阻塞的 pending 任务逐轮标记为 skipped，直到没有新的跳过
    async fn propagate_blocked(
        &self,
        ctx: &DispatchContext<'_>,
        plan: &mut Plan,
        meta: &mut SessionMeta,
    ) -> Result<()> {
        loop {
            let blocked: Vec<String> = plan
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Pending && is_blocked(plan, t))
                .map(|t| t.id.clone())
                .collect();
            if blocked.is_empty() {
                return Ok(());
            }
            for id in blocked {
                self.skip_task(ctx, plan, meta, &id, DEPENDENCY_NOT_MET).await?;
            }
        }
    }

    /// 按 id 查找只能命中第一个任务，后出现的同 id 任务在开始前全部跳过
    async fn skip_duplicate_ids(
        &self,
        ctx: &DispatchContext<'_>,
        plan: &mut Plan,
        meta: &mut SessionMeta,
    ) -> Result<()> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut duplicates = Vec::new();
        for task in &mut plan.tasks {
            if !seen.insert(task.id.clone()) && task.skip(DUPLICATE_TASK_ID) {
                duplicates.push(task.id.clone());
            }
        }
        if duplicates.is_empty() {
            return Ok(());
        }
        warn!(tasks = ?duplicates, "Plan contains duplicate task ids");
        for task_id in duplicates {
            ctx.emit(StreamEvent::CoworkTaskSkipped {
                task_id,
                reason: DUPLICATE_TASK_ID.to_string(),
            });
        }
        self.sync_meta(ctx, plan, meta).await
    }

    /// 取消：在途任务 failed，剩余 pending 任务 skipped
    async fn abort(
        &self,
        ctx: &DispatchContext<'_>,
        plan: &mut Plan,
        meta: &mut SessionMeta,
        running: &HashSet<String>,
    ) -> Result<()> {
        warn!(conversation_id = %ctx.conversation_id, "Dispatch cancelled");
        let running_ids: Vec<String> = plan
            .tasks
            .iter()
            .filter(|t| running.contains(&t.id))
            .map(|t| t.id.clone())
            .collect();
        for id in running_ids {
            self.record_outcome(ctx, plan, meta, &id, Err(CoworkError::Cancelled))
                .await?;
        }
        let pending: Vec<String> = plan
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .map(|t| t.id.clone())
            .collect();
        for id in pending {
            self.skip_task(ctx, plan, meta, &id, CANCELLED).await?;
        }
        Ok(())
    }

    /// 驱动计划直到所有任务进入终态；取消时返回 `CoworkError::Cancelled`
    pub async fn run(
        &self,
        ctx: &DispatchContext<'_>,
        plan: &mut Plan,
        meta: &mut SessionMeta,
    ) -> Result<DispatchReport> {
        let total = plan.tasks.len();
        let restored = plan
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        if restored > 0 {
            info!(restored, "Reusing cached task results");
        }

        self.skip_duplicate_ids(ctx, plan, meta).await?;

        let mut budget = TokenBudget::new(self.settings.total_token_budget);
        let mut executed = 0usize;
        let mut running: HashSet<String> = HashSet::new();
        let mut in_flight = FuturesUnordered::new();
        let max_parallel = self.settings.max_parallel_tasks.max(1);

        loop {
            if ctx.cancel.is_cancelled() {
                drop(in_flight);
                self.abort(ctx, plan, meta, &running).await?;
                return Err(CoworkError::Cancelled);
            }

            self.propagate_blocked(ctx, plan, meta).await?;

            let ready: Vec<String> = plan
                .tasks
                .iter()
                .filter(|t| !running.contains(&t.id) && is_ready(plan, t))
                .map(|t| t.id.clone())
                .collect();

            for task_id in ready {
                if running.len() >= max_parallel {
                    break;
                }
                let Some(task) = plan.task(&task_id).filter(|t| t.status == TaskStatus::Pending)
                else {
                    continue;
                };
                let cost = self.settings.task_costs.cost(task.task_type);
                if !budget.try_reserve(cost) {
                    debug!(task_id = %task_id, cost, remaining = budget.remaining(), "Budget gate");
                    self.skip_task(ctx, plan, meta, &task_id, BUDGET_EXCEEDED).await?;
                    continue;
                }

                let messages = build_task_messages(plan, task, self.settings.dependency_context_chars);
                let config = AgentConfig::for_agent_type(&task.agent_type);
                let title = task.title.clone();
                let agent_type = task.agent_type.clone();
                if !plan.task_mut(&task_id).is_some_and(Task::start) {
                    warn!(task_id = %task_id, "Task could not be started, not dispatching");
                    continue;
                }

                executed += 1;
                ctx.emit(StreamEvent::CoworkTaskStart {
                    task_id: task_id.clone(),
                    title: title.clone(),
                    agent_type,
                });
                ctx.emit(StreamEvent::node(
                    DISPATCH_NODE,
                    format!("[{}/{}] {}: {}", executed + restored, total, task_id, title),
                    executed + restored,
                    total,
                ));
                info!(task_id = %task_id, cost, "Dispatching task: {}", title);

                let options = AgentRunOptions {
                    conversation_id: ctx.conversation_id.to_string(),
                    max_iterations: self.settings.agent_max_iterations as usize,
                    cancel: ctx.cancel.child_token(),
                };
                let agents = Arc::clone(&self.agents);
                let timeout = self.settings.task_timeout;
                let id = task_id.clone();
                in_flight.push(async move {
                    let outcome = execute_task(agents, config, messages, options, timeout).await;
                    (id, outcome)
                });
                running.insert(task_id);
            }

            if in_flight.is_empty() {
                // 既无在途也无就绪：剩下的只可能是环上的任务
                let stuck: Vec<String> = plan
                    .tasks
                    .iter()
                    .filter(|t| t.status == TaskStatus::Pending)
                    .map(|t| t.id.clone())
                    .collect();
                if !stuck.is_empty() {
                    warn!(tasks = ?stuck, "Tasks can never become ready");
                }
                for id in stuck {
                    self.skip_task(ctx, plan, meta, &id, DEPENDENCY_NOT_MET).await?;
                }
                break;
            }

            let next = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => None,
                next = in_flight.next() => next,
            };
            let Some((task_id, outcome)) = next else { continue };
            running.remove(&task_id);
            let outcome = match outcome {
                Err(_) if ctx.cancel.is_cancelled() => Err(CoworkError::Cancelled),
                other => other,
            };
            self.record_outcome(ctx, plan, meta, &task_id, outcome).await?;
        }

        self.sync_meta(ctx, plan, meta).await?;
        let counts = plan.counts();
        info!(
            completed = counts.completed,
            failed = counts.failed,
            skipped = counts.skipped,
            consumed = budget.consumed(),
            "Dispatch finished"
        );
        Ok(DispatchReport {
            budget,
            executed,
            restored,
        })
    }
}
