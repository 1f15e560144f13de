//! CoworkEngine：分类 -> 恢复 / 规划 -> 派发 -> 汇总 -> 清理
//!
//! 所有进度通过 `StreamEvent` 写入 event_tx。正常结束以 `end` 收尾；流水线级错误
//! （取消、必须持久化时的写入失败、直接回复失败）只发出一个 `error` 事件，会话 meta 尽力标记为 failed 以便下次恢复。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agents::{AgentBackend, DirectResponder};
use crate::config::CoworkSettings;
use crate::core::{CoworkError, Result};
use crate::cowork::dispatcher::{apply_cached_results, DispatchContext, Dispatcher};
use crate::cowork::events::StreamEvent;
use crate::cowork::planner::Planner;
use crate::cowork::store::{PersistencePolicy, ResumableSession, SessionStore};
use crate::cowork::supervisor::Supervisor;
use crate::cowork::synthesizer::Synthesizer;
use crate::cowork::types::{
    Decision, Plan, PlanCounts, SessionMeta, SessionStatus, TaskResultRecord,
};
use crate::llm::{last_user_content, LlmClient, Message};

/// 工作目录下的会话根目录
pub const WORKING_DIR_SESSION_ROOT: &str = ".cowork/sessions";

/// 一次 Cowork 请求
#[derive(Debug, Clone)]
pub struct CoworkRequest {
    pub conversation_id: String,
    pub messages: Vec<Message>,
    /// 指定时会话存放在 `{working_dir}/.cowork/sessions`
    pub working_dir: Option<PathBuf>,
}

impl CoworkRequest {
    pub fn new(conversation_id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            messages,
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// 运行结果（事件流之外的汇总，便于嵌入方直接使用）
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Direct { reply: String },
    Report { content: String, counts: PlanCounts },
    Failed { message: String },
}

pub struct CoworkEngine {
    agents: Arc<dyn AgentBackend>,
    direct: Arc<dyn DirectResponder>,
    settings: CoworkSettings,
    supervisor: Supervisor,
    planner: Planner,
    synthesizer: Synthesizer,
}

impl CoworkEngine {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        agents: Arc<dyn AgentBackend>,
        direct: Arc<dyn DirectResponder>,
        settings: CoworkSettings,
    ) -> Self {
        Self {
            supervisor: Supervisor::new(Arc::clone(&llm), settings.llm_timeout),
            planner: Planner::new(Arc::clone(&llm), settings.llm_timeout),
            synthesizer: Synthesizer::new(llm, settings.llm_timeout, settings.synthesis_result_chars),
            agents,
            direct,
            settings,
        }
    }

    pub fn settings(&self) -> &CoworkSettings {
        &self.settings
    }

    fn policy(&self) -> PersistencePolicy {
        PersistencePolicy::from_required(self.settings.require_persistence)
    }

    /// 请求对应的会话存储
    pub fn store_for(&self, request: &CoworkRequest) -> SessionStore {
        let root = match &request.working_dir {
            Some(dir) => dir.join(WORKING_DIR_SESSION_ROOT),
            None => self.settings.session_root.clone(),
        };
        SessionStore::new(root, &request.conversation_id)
    }

    /// 在后台任务中运行，返回事件接收端与结果句柄
    pub fn spawn(
        self: Arc<Self>,
        request: CoworkRequest,
        cancel: CancellationToken,
    ) -> (UnboundedReceiver<StreamEvent>, JoinHandle<RunOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move { self.run(request, &tx, cancel).await });
        (rx, handle)
    }

    pub async fn run(
        &self,
        request: CoworkRequest,
        event_tx: &UnboundedSender<StreamEvent>,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let store = self.store_for(&request);
        info!(conversation_id = %request.conversation_id, "Cowork run started");

        match self.run_pipeline(&request, &store, event_tx, &cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(conversation_id = %request.conversation_id, "Cowork run failed: {}", e);
                let message = e.to_string();
                let _ = event_tx.send(StreamEvent::Error {
                    message: message.clone(),
                });
                RunOutcome::Failed { message }
            }
        }
    }

    async fn run_pipeline(
        &self,
        request: &CoworkRequest,
        store: &SessionStore,
        event_tx: &UnboundedSender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        if cancel.is_cancelled() {
            return Err(CoworkError::Cancelled);
        }
        let decision = self.supervisor.classify(&request.messages).await;
        info!(decision = ?decision, "Request classified");
        if decision == Decision::Direct {
            return self.respond_directly(request, event_tx, cancel).await;
        }

        let resumable = self.check_resumable(store).await?;
        let request_text = last_user_content(&request.messages).unwrap_or_default();
        let continuing = resumable.resumable
            && resumable
                .meta
                .as_ref()
                .is_some_and(|m| m.matches_request(request_text));
        if !continuing {
            if resumable.resumable {
                info!("Saved session belongs to a different request, starting over");
            }
            self.policy()
                .apply(store.cleanup_session().await, "stale session cleanup")?;
        }

        let ResumableSession {
            meta,
            plan: saved_plan,
            task_results,
            ..
        } = resumable;
        let mut meta = match meta.filter(|_| continuing) {
            Some(meta) => meta,
            None => SessionMeta::new(&request.conversation_id).with_request(request_text),
        };
        let (saved_plan, task_results) = if continuing {
            (saved_plan, task_results)
        } else {
            (None, HashMap::new())
        };

        let prepared = self
            .prepare_plan(request, store, &mut meta, saved_plan, &task_results, event_tx, cancel)
            .await;
        let mut plan = match prepared {
            Ok(Some(plan)) => plan,
            Ok(None) => {
                if !continuing {
                    if let Err(e) = store.cleanup_session().await {
                        warn!("Failed to remove unused session: {}", e);
                    }
                }
                info!("No usable plan, falling back to a direct reply");
                return self.respond_directly(request, event_tx, cancel).await;
            }
            Err(e) => {
                self.mark_failed(store, &mut meta).await;
                return Err(e);
            }
        };

        let ctx = DispatchContext {
            conversation_id: &request.conversation_id,
            store,
            event_tx,
            cancel,
        };
        match self.execute_plan(&ctx, &mut plan, &mut meta).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.mark_failed(store, &mut meta).await;
                Err(e)
            }
        }
    }

    async fn check_resumable(&self, store: &SessionStore) -> Result<ResumableSession> {
        match store.check_resumable_session().await {
            Ok(resumable) => Ok(resumable),
            Err(e) => {
                self.policy().apply(Err(e), "resumable session check")?;
                Ok(ResumableSession::default())
            }
        }
    }

    /// 复用已保存的计划，或先落盘 planning 状态再调用 Planner；随后合并缓存结果。
    /// Planner 无结果时返回 None
    #[allow(clippy::too_many_arguments)]
    async fn prepare_plan(
        &self,
        request: &CoworkRequest,
        store: &SessionStore,
        meta: &mut SessionMeta,
        saved_plan: Option<Plan>,
        task_results: &HashMap<String, TaskResultRecord>,
        event_tx: &UnboundedSender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<Option<Plan>> {
        let resumed = saved_plan.is_some();
        let mut plan = match saved_plan {
            Some(plan) => plan,
            None => {
                meta.set_status(SessionStatus::Planning);
                self.policy()
                    .apply(store.save_session_meta(meta).await, "session meta")?;
                let _ = event_tx.send(StreamEvent::node("cowork_planner", "Planning tasks", 0, 0));
                let planned = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(CoworkError::Cancelled),
                    plan = self.planner.plan(&request.messages) => plan,
                };
                match planned {
                    Some(plan) => plan,
                    None => return Ok(None),
                }
            }
        };

        let restored = apply_cached_results(&mut plan, task_results);
        if resumed {
            info!(restored, "Resuming saved session");
            let _ = event_tx.send(StreamEvent::CoworkResumed {
                conversation_id: request.conversation_id.clone(),
                cached_results: restored,
            });
        }
        Ok(Some(plan))
    }

    async fn execute_plan(
        &self,
        ctx: &DispatchContext<'_>,
        plan: &mut Plan,
        meta: &mut SessionMeta,
    ) -> Result<RunOutcome> {
        let _ = ctx.event_tx.send(StreamEvent::CoworkPlan { plan: plan.clone() });

        meta.set_status(SessionStatus::Executing);
        meta.sync_from_plan(plan);
        self.policy().apply(ctx.store.save_plan(plan).await, "plan")?;
        self.policy()
            .apply(ctx.store.save_session_meta(meta).await, "session meta")?;

        let dispatcher = Dispatcher::new(Arc::clone(&self.agents), self.settings.clone());
        let report = dispatcher.run(ctx, plan, meta).await?;
        info!(
            executed = report.executed,
            restored = report.restored,
            tokens = report.budget.consumed(),
            "Tasks finished"
        );

        meta.set_status(SessionStatus::Synthesizing);
        self.policy()
            .apply(ctx.store.save_session_meta(meta).await, "session meta")?;
        let _ = ctx.event_tx.send(StreamEvent::CoworkSynthesizing);

        let content = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(CoworkError::Cancelled),
            report = self.synthesizer.synthesize(plan) => report,
        };
        let _ = ctx.event_tx.send(StreamEvent::MessageChunk {
            text: content.clone(),
        });
        let _ = ctx.event_tx.send(StreamEvent::CoworkReport {
            content: content.clone(),
        });

        meta.set_status(SessionStatus::Completed);
        self.policy()
            .apply(ctx.store.save_session_meta(meta).await, "session meta")?;
        self.policy()
            .apply(ctx.store.cleanup_session().await, "session cleanup")?;

        let _ = ctx.event_tx.send(StreamEvent::End);
        info!(conversation_id = %ctx.conversation_id, "Cowork run completed");
        Ok(RunOutcome::Report {
            content,
            counts: plan.counts(),
        })
    }

    async fn respond_directly(
        &self,
        request: &CoworkRequest,
        event_tx: &UnboundedSender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let reply = self
            .direct
            .respond(&request.messages, event_tx, cancel)
            .await?;
        let _ = event_tx.send(StreamEvent::End);
        Ok(RunOutcome::Direct { reply })
    }

    /// 尽力把会话标记为 failed（下次仍可恢复）
    async fn mark_failed(&self, store: &SessionStore, meta: &mut SessionMeta) {
        meta.set_status(SessionStatus::Failed);
        if let Err(e) = store.save_session_meta(meta).await {
            warn!("Failed to mark session as failed: {}", e);
        }
    }
}
