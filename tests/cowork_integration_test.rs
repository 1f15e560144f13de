//! Cowork 集成测试：脚本化 LLM + 脚本化 Agent 后端驱动完整流水线

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cowork::agents::{
    AgentBackend, AgentConfig, AgentEvent, AgentEventStream, AgentRunOptions, DirectResponder,
};
use cowork::config::CoworkSettings;
use cowork::core::{CoworkError, Result};
use cowork::cowork::dispatcher::{DispatchContext, Dispatcher, BUDGET_EXCEEDED, DEPENDENCY_NOT_MET};
use cowork::cowork::{
    Plan, SessionMeta, SessionStatus, SessionStore, Task, TaskResultRecord, TaskStatus, TaskType,
};
use cowork::llm::{LlmClient, Message, ScriptedLlmClient};
use cowork::{CoworkEngine, CoworkRequest, RunOutcome, StreamEvent};
use futures_util::stream;
use tempfile::TempDir;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::sync::CancellationToken;

/// 根据任务标题返回结果；`failing` 中的标题返回错误事件，`hang` 为 true 时永不结束
#[derive(Default)]
struct ScriptedAgents {
    failing: Vec<String>,
    hang: bool,
    executed: Mutex<Vec<String>>,
}

impl ScriptedAgents {
    fn failing(titles: &[&str]) -> Self {
        Self {
            failing: titles.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    fn hanging() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }

    fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentBackend for ScriptedAgents {
    async fn stream_with_config(
        &self,
        _config: &AgentConfig,
        messages: &[Message],
        _options: AgentRunOptions,
    ) -> Result<AgentEventStream> {
        let instruction = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        let title = instruction
            .lines()
            .find_map(|l| l.strip_prefix("Your task: "))
            .unwrap_or_default()
            .to_string();
        self.executed.lock().unwrap().push(title.clone());

        if self.hang {
            return Ok(Box::pin(stream::pending()));
        }
        let events = if self.failing.contains(&title) {
            vec![AgentEvent::Error {
                message: format!("{} exploded", title),
            }]
        } else {
            vec![AgentEvent::assistant(format!("{} output", title))]
        };
        Ok(Box::pin(stream::iter(events)))
    }
}

/// 直接回复桩：记录调用次数
#[derive(Default)]
struct CannedReply {
    calls: Mutex<usize>,
}

#[async_trait]
impl DirectResponder for CannedReply {
    async fn respond(
        &self,
        _messages: &[Message],
        event_tx: &UnboundedSender<StreamEvent>,
        _cancel: &CancellationToken,
    ) -> Result<String> {
        *self.calls.lock().unwrap() += 1;
        let _ = event_tx.send(StreamEvent::MessageChunk {
            text: "canned".into(),
        });
        Ok("canned".into())
    }
}

const PLAN_DECISION: &str = r#"{"decision": "plan", "reason": "multi-step"}"#;
const TWO_TASK_PLAN: &str = r#"```json
{"objective": "ship", "tasks": [
  {"id": "task-1", "title": "A", "description": "first", "type": "research"},
  {"id": "task-2", "title": "B", "description": "second", "type": "coding", "dependencies": ["task-1"]}
]}
```"#;

fn task(id: &str, title: &str, deps: &[&str]) -> Task {
    Task::new(id, title, format!("do {}", title), TaskType::General)
        .with_dependencies(deps.iter().copied())
}

fn drain(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Ok(e) = rx.try_recv() {
        events.push(e);
    }
    events
}

fn build_engine(
    llm: Arc<dyn LlmClient>,
    agents: Arc<dyn AgentBackend>,
    direct: Arc<dyn DirectResponder>,
    settings: CoworkSettings,
) -> CoworkEngine {
    CoworkEngine::new(llm, agents, direct, settings)
}

async fn dispatch(
    store: &SessionStore,
    agents: Arc<ScriptedAgents>,
    settings: CoworkSettings,
    plan: &mut Plan,
) -> SessionMeta {
    let (tx, _rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let ctx = DispatchContext {
        conversation_id: "conv",
        store,
        event_tx: &tx,
        cancel: &cancel,
    };
    let mut meta = SessionMeta::new("conv");
    Dispatcher::new(agents, settings)
        .run(&ctx, plan, &mut meta)
        .await
        .unwrap();
    meta
}

#[tokio::test]
async fn test_dependent_tasks_complete_in_order() {
    let dir = TempDir::new().unwrap();
    let store = SessionStore::new(dir.path(), "conv");
    let agents = Arc::new(ScriptedAgents::default());
    let mut plan = Plan::new("o", vec![task("A", "A", &[]), task("B", "B", &["A"])]);

    let meta = dispatch(&store, agents.clone(), CoworkSettings::new(dir.path()), &mut plan).await;
    assert_eq!(meta.completed_task_ids, vec!["A", "B"]);
    assert_eq!(agents.executed(), vec!["A", "B"]);

    let persisted = store.load_session_meta().await.unwrap().unwrap();
    assert_eq!(persisted.completed_task_ids, vec!["A", "B"]);
}

#[tokio::test]
async fn test_failed_dependency_still_satisfies_gate() {
    let dir = TempDir::new().unwrap();
    let store = SessionStore::new(dir.path(), "conv");
    let agents = Arc::new(ScriptedAgents::failing(&["A"]));
    let mut plan = Plan::new("o", vec![task("A", "A", &[]), task("B", "B", &["A"])]);

    let meta = dispatch(&store, agents.clone(), CoworkSettings::new(dir.path()), &mut plan).await;
    assert_eq!(plan.tasks[0].status, TaskStatus::Failed);
    assert_eq!(plan.tasks[1].status, TaskStatus::Completed);
    assert_eq!(meta.failed_task_ids, vec!["A"]);
    assert_eq!(agents.executed(), vec!["A", "B"]);
}

#[tokio::test]
async fn test_skipped_predecessor_blocks_dependents() {
    let dir = TempDir::new().unwrap();
    let store = SessionStore::new(dir.path(), "conv");
    let agents = Arc::new(ScriptedAgents::default());
    let settings = CoworkSettings::new(dir.path()).with_token_budget(4_000);
    let mut plan = Plan::new(
        "o",
        vec![task("A", "A", &[]), task("B", "B", &["A"]), task("C", "C", &["B"])],
    );

    let meta = dispatch(&store, agents.clone(), settings, &mut plan).await;
    assert_eq!(agents.executed(), vec!["A"]);
    assert_eq!(plan.tasks[1].result.as_deref(), Some(BUDGET_EXCEEDED));
    assert_eq!(plan.tasks[2].result.as_deref(), Some(DEPENDENCY_NOT_MET));
    assert_eq!(meta.skipped_task_ids, vec!["B", "C"]);
    assert!(plan.tasks.iter().all(|t| t.status.is_terminal()));
}

#[tokio::test]
async fn test_full_run_emits_events_and_cleans_up() {
    let dir = TempDir::new().unwrap();
    let llm = Arc::new(ScriptedLlmClient::with_replies([PLAN_DECISION, TWO_TASK_PLAN, "# Report"]));
    let agents = Arc::new(ScriptedAgents::default());
    let engine = build_engine(
        llm,
        agents.clone(),
        Arc::new(CannedReply::default()),
        CoworkSettings::new(dir.path().join("sessions")),
    );
    let request = CoworkRequest::new("conv-1", vec![Message::user("research then build")]);
    let store = engine.store_for(&request);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let outcome = engine.run(request, &tx, CancellationToken::new()).await;
    assert!(matches!(outcome, RunOutcome::Report { ref content, .. } if content == "# Report"));

    let events = drain(&mut rx);
    let starts: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::CoworkTaskStart { task_id, .. } => Some(task_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(starts, vec!["task-1", "task-2"]);
    assert!(events.iter().any(|e| matches!(e, StreamEvent::CoworkSynthesizing)));
    assert!(events
        .iter()
        .any(|e| matches!(e, StreamEvent::CoworkReport { content } if content == "# Report")));
    assert_eq!(events.last(), Some(&StreamEvent::End));
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::Error { .. })));

    assert!(!store.session_dir().exists());
    assert!(!dir.path().join("sessions").exists());
}

#[tokio::test]
async fn test_resume_skips_cached_task() {
    let dir = TempDir::new().unwrap();
    let settings = CoworkSettings::new(dir.path().join("sessions"));
    let request = CoworkRequest::new("conv-resume", vec![Message::user("research then build")]);

    let llm = Arc::new(ScriptedLlmClient::with_replies([PLAN_DECISION, "# Resumed report"]));
    let agents = Arc::new(ScriptedAgents::default());
    let engine = build_engine(
        llm.clone(),
        agents.clone(),
        Arc::new(CannedReply::default()),
        settings,
    );

    // 上次运行在 task-2 执行前中断
    let store = engine.store_for(&request);
    let plan = Plan::new(
        "ship",
        vec![
            Task::new("task-1", "A", "first", TaskType::Research),
            Task::new("task-2", "B", "second", TaskType::Coding).with_dependencies(["task-1"]),
        ],
    );
    let mut meta = SessionMeta::new("conv-resume").with_request("research then build");
    meta.set_status(SessionStatus::Executing);
    store.save_plan(&plan).await.unwrap();
    store.save_session_meta(&meta).await.unwrap();
    store
        .save_task_result(&TaskResultRecord {
            task_id: "task-1".into(),
            status: TaskStatus::Completed,
            result: "cached research".into(),
            completed_at: None,
        })
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let outcome = engine.run(request, &tx, CancellationToken::new()).await;
    assert!(matches!(outcome, RunOutcome::Report { .. }));
    assert_eq!(agents.executed(), vec!["B"]);
    // 分类 + 汇总，没有 Planner 调用
    assert_eq!(llm.call_count(), 2);

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        StreamEvent::CoworkResumed { cached_results: 1, .. }
    )));
}

#[tokio::test]
async fn test_new_request_replaces_saved_session() {
    let dir = TempDir::new().unwrap();
    let settings = CoworkSettings::new(dir.path().join("sessions"));
    let new_plan = r#"{"objective": "translate", "tasks": [{"id": "task-1", "title": "NEW", "type": "document"}]}"#;
    let llm = Arc::new(ScriptedLlmClient::with_replies([PLAN_DECISION, new_plan, "# Translated"]));
    let agents = Arc::new(ScriptedAgents::default());
    let engine = build_engine(
        llm.clone(),
        agents.clone(),
        Arc::new(CannedReply::default()),
        settings,
    );

    // 上一个请求失败后留下的会话
    let old_request = CoworkRequest::new("conv-switch", vec![Message::user("build a website")]);
    let store = engine.store_for(&old_request);
    let mut meta = SessionMeta::new("conv-switch").with_request("build a website");
    meta.set_status(SessionStatus::Failed);
    store
        .save_plan(&Plan::new("website", vec![task("task-1", "OLD website task", &[])]))
        .await
        .unwrap();
    store.save_session_meta(&meta).await.unwrap();
    store
        .save_task_result(&TaskResultRecord {
            task_id: "task-1".into(),
            status: TaskStatus::Completed,
            result: "old html".into(),
            completed_at: None,
        })
        .await
        .unwrap();

    let request = CoworkRequest::new(
        "conv-switch",
        vec![
            Message::user("build a website"),
            Message::assistant("that failed"),
            Message::user("translate my README to French"),
        ],
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    let outcome = engine.run(request, &tx, CancellationToken::new()).await;
    assert!(matches!(outcome, RunOutcome::Report { ref content, .. } if content == "# Translated"));
    assert_eq!(agents.executed(), vec!["NEW"]);
    // 分类 + 规划 + 汇总
    assert_eq!(llm.call_count(), 3);

    let events = drain(&mut rx);
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::CoworkResumed { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        StreamEvent::CoworkTaskComplete { result, .. } if result == "NEW output"
    )));
}

#[tokio::test]
async fn test_required_persistence_failure_stops_run() {
    let dir = TempDir::new().unwrap();
    // 会话根目录的位置被普通文件占用，任何写入都会失败
    let blocked_root = dir.path().join("sessions");
    std::fs::write(&blocked_root, "not a directory").unwrap();

    let llm = Arc::new(ScriptedLlmClient::with_replies([PLAN_DECISION, TWO_TASK_PLAN, "# Report"]));
    let agents = Arc::new(ScriptedAgents::default());
    let engine = build_engine(
        llm,
        agents.clone(),
        Arc::new(CannedReply::default()),
        CoworkSettings::new(&blocked_root).with_require_persistence(true),
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let outcome = engine
        .run(
            CoworkRequest::new("conv", vec![Message::user("research then build")]),
            &tx,
            CancellationToken::new(),
        )
        .await;
    assert!(matches!(outcome, RunOutcome::Failed { ref message } if message.starts_with("Persistence failed")));
    assert!(agents.executed().is_empty());

    let events = drain(&mut rx);
    let errors = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::Error { .. }))
        .count();
    assert_eq!(errors, 1);
    assert!(!events.contains(&StreamEvent::End));
}

#[tokio::test]
async fn test_best_effort_persistence_failure_still_completes() {
    let dir = TempDir::new().unwrap();
    let blocked_root = dir.path().join("sessions");
    std::fs::write(&blocked_root, "not a directory").unwrap();

    let llm = Arc::new(ScriptedLlmClient::with_replies([PLAN_DECISION, TWO_TASK_PLAN, "# Report"]));
    let agents = Arc::new(ScriptedAgents::default());
    let engine = build_engine(
        llm,
        agents.clone(),
        Arc::new(CannedReply::default()),
        CoworkSettings::new(&blocked_root),
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let outcome = engine
        .run(
            CoworkRequest::new("conv", vec![Message::user("research then build")]),
            &tx,
            CancellationToken::new(),
        )
        .await;
    assert!(matches!(outcome, RunOutcome::Report { .. }));
    assert_eq!(agents.executed(), vec!["A", "B"]);
    assert_eq!(drain(&mut rx).last(), Some(&StreamEvent::End));
}

/// 每次调用都比请求超时慢
struct SlowLlm;

#[async_trait]
impl LlmClient for SlowLlm {
    async fn complete(&self, _messages: &[Message]) -> std::result::Result<String, String> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(PLAN_DECISION.into())
    }

    async fn complete_stream(
        &self,
        _messages: &[Message],
    ) -> std::result::Result<cowork::llm::TokenStream, String> {
        Err("unsupported".into())
    }
}

#[tokio::test]
async fn test_classifier_timeout_falls_back_to_direct() {
    let dir = TempDir::new().unwrap();
    let direct = Arc::new(CannedReply::default());
    let agents = Arc::new(ScriptedAgents::default());
    let engine = build_engine(
        Arc::new(SlowLlm),
        agents.clone(),
        direct.clone(),
        CoworkSettings::new(dir.path()).with_llm_timeout(Duration::from_millis(20)),
    );

    let (tx, _rx) = mpsc::unbounded_channel();
    let outcome = engine
        .run(
            CoworkRequest::new("c", vec![Message::user("compare two crates")]),
            &tx,
            CancellationToken::new(),
        )
        .await;
    assert_eq!(
        outcome,
        RunOutcome::Direct {
            reply: "canned".into()
        }
    );
    assert!(agents.executed().is_empty());
}

#[tokio::test]
async fn test_completed_session_is_not_resumable() {
    let dir = TempDir::new().unwrap();
    let store = SessionStore::new(dir.path(), "done");
    let mut meta = SessionMeta::new("done");
    meta.set_status(SessionStatus::Completed);
    store.save_session_meta(&meta).await.unwrap();

    let check = store.check_resumable_session().await.unwrap();
    assert!(!check.resumable);
}

#[tokio::test]
async fn test_synthesis_failure_falls_back_to_counts() {
    let dir = TempDir::new().unwrap();
    let llm = Arc::new(ScriptedLlmClient::new(vec![
        Ok(PLAN_DECISION.into()),
        Ok(TWO_TASK_PLAN.into()),
        Err("synthesis model unavailable".into()),
    ]));
    let engine = build_engine(
        llm,
        Arc::new(ScriptedAgents::failing(&["B"])),
        Arc::new(CannedReply::default()),
        CoworkSettings::new(dir.path()),
    );

    let (tx, _rx) = mpsc::unbounded_channel();
    let outcome = engine
        .run(
            CoworkRequest::new("c", vec![Message::user("go")]),
            &tx,
            CancellationToken::new(),
        )
        .await;
    match outcome {
        RunOutcome::Report { content, .. } => {
            assert_eq!(content, "completed: 1, failed: 1, skipped: 0 / total 2")
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_unparseable_plan_falls_back_to_direct() {
    let dir = TempDir::new().unwrap();
    let llm = Arc::new(ScriptedLlmClient::with_replies([PLAN_DECISION, "I cannot plan this"]));
    let direct = Arc::new(CannedReply::default());
    let agents = Arc::new(ScriptedAgents::default());
    let engine = build_engine(llm, agents.clone(), direct.clone(), CoworkSettings::new(dir.path()));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let outcome = engine
        .run(
            CoworkRequest::new("c", vec![Message::user("go")]),
            &tx,
            CancellationToken::new(),
        )
        .await;
    assert_eq!(
        outcome,
        RunOutcome::Direct {
            reply: "canned".into()
        }
    );
    assert_eq!(*direct.calls.lock().unwrap(), 1);
    assert!(agents.executed().is_empty());
    assert_eq!(drain(&mut rx).last(), Some(&StreamEvent::End));
}

#[tokio::test]
async fn test_document_request_skips_classifier_llm() {
    let dir = TempDir::new().unwrap();
    // 没有分类回复：第一条脚本直接就是计划
    let llm = Arc::new(ScriptedLlmClient::with_replies([TWO_TASK_PLAN, "report"]));
    let engine = build_engine(
        llm.clone(),
        Arc::new(ScriptedAgents::default()),
        Arc::new(CannedReply::default()),
        CoworkSettings::new(dir.path()),
    );

    let (tx, _rx) = mpsc::unbounded_channel();
    let outcome = engine
        .run(
            CoworkRequest::new("c", vec![Message::user("Create a PowerPoint presentation on Q3")]),
            &tx,
            CancellationToken::new(),
        )
        .await;
    assert!(matches!(outcome, RunOutcome::Report { .. }));
    assert_eq!(llm.call_count(), 2);
}

#[tokio::test]
async fn test_cancellation_keeps_failed_session_on_disk() {
    let dir = TempDir::new().unwrap();
    let llm = Arc::new(ScriptedLlmClient::with_replies([PLAN_DECISION, TWO_TASK_PLAN]));
    let engine = Arc::new(build_engine(
        llm,
        Arc::new(ScriptedAgents::hanging()),
        Arc::new(CannedReply::default()),
        CoworkSettings::new(dir.path()).with_task_timeout(Duration::from_secs(30)),
    ));
    let request = CoworkRequest::new("cancel-me", vec![Message::user("go")]);
    let store = engine.store_for(&request);

    let cancel = CancellationToken::new();
    let (mut rx, handle) = Arc::clone(&engine).spawn(request, cancel.clone());

    // 等到第一个任务开始后再取消
    loop {
        match rx.recv().await {
            Some(StreamEvent::CoworkTaskStart { .. }) => break,
            Some(_) => continue,
            None => panic!("stream ended before any task started"),
        }
    }
    cancel.cancel();

    let outcome = handle.await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Failed {
            message: CoworkError::Cancelled.to_string()
        }
    );

    let rest = drain(&mut rx);
    let errors = rest
        .iter()
        .filter(|e| matches!(e, StreamEvent::Error { .. }))
        .count();
    assert_eq!(errors, 1);
    assert!(matches!(rest.last(), Some(StreamEvent::Error { .. })));
    assert!(!rest.iter().any(|e| matches!(e, StreamEvent::CoworkSynthesizing)));

    let meta = store.load_session_meta().await.unwrap().unwrap();
    assert_eq!(meta.status, SessionStatus::Failed);
    assert_eq!(meta.failed_task_ids, vec!["task-1"]);
    assert_eq!(meta.skipped_task_ids, vec!["task-2"]);

    // 失败会话可恢复：task-1 的失败结果不会被当作缓存复用
    let resumable = store.check_resumable_session().await.unwrap();
    assert!(resumable.resumable);
    let cached: HashMap<_, _> = resumable.task_results;
    assert_eq!(cached["task-1"].status, TaskStatus::Failed);
}
