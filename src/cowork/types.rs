//! Cowork 数据模型：Plan / Task / SessionMeta / 任务结果记录
//!
//! 状态机：pending -> in_progress -> {completed | failed | skipped}；终态不可再迁移，
//! startedAt / completedAt 只写一次。持久化字段统一 camelCase。

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 具备工具能力的编码 Agent
pub const CODING_AGENT: &str = "coding-agent";
/// 深度网页调研 Agent
pub const WEB_RESEARCH_AGENT: &str = "deep-web-research";
/// 通用 Agent
pub const GENERIC_AGENT: &str = "agent";

/// 分类器结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// 直接交给简单应答者
    Direct,
    /// 进入规划
    Plan,
}

/// 任务类型（决定估算成本与 Agent 类型）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Coding,
    Research,
    Review,
    Test,
    Document,
    General,
}

impl TaskType {
    pub const ALL: [TaskType; 6] = [
        TaskType::Coding,
        TaskType::Research,
        TaskType::Review,
        TaskType::Test,
        TaskType::Document,
        TaskType::General,
    ];

    /// 宽松解析 LLM 给出的类型名，未知类型归为 General
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "coding" | "code" => TaskType::Coding,
            "research" => TaskType::Research,
            "review" => TaskType::Review,
            "test" | "testing" => TaskType::Test,
            "document" | "documentation" | "doc" => TaskType::Document,
            _ => TaskType::General,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Coding => "coding",
            TaskType::Research => "research",
            TaskType::Review => "review",
            TaskType::Test => "test",
            TaskType::Document => "document",
            TaskType::General => "general",
        }
    }

    /// 任务类型 -> 外部执行后端的 Agent 标识
    pub fn agent_type(&self) -> &'static str {
        match self {
            TaskType::Coding | TaskType::Document => CODING_AGENT,
            TaskType::Research => WEB_RESEARCH_AGENT,
            _ => GENERIC_AGENT,
        }
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    /// 能否满足后继任务的依赖：只有 completed / failed；skipped 会永久阻塞后继
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// 单个任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub agent_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        task_type: TaskType,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            task_type,
            status: TaskStatus::Pending,
            dependencies: Vec::new(),
            agent_type: task_type.agent_type().to_string(),
            result: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// pending -> in_progress；非 pending 时不做任何改动并返回 false
    pub fn start(&mut self) -> bool {
        if self.status != TaskStatus::Pending {
            return false;
        }
        self.status = TaskStatus::InProgress;
        self.started_at.get_or_insert_with(Utc::now);
        true
    }

    pub fn complete(&mut self, result: impl Into<String>) -> bool {
        self.finish(TaskStatus::Completed, result.into(), None)
    }

    /// 失败时错误信息同时写入 result，下游任务与汇总仍有内容可引用
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        let error = error.into();
        self.finish(TaskStatus::Failed, error.clone(), Some(error))
    }

    pub fn skip(&mut self, reason: impl Into<String>) -> bool {
        self.finish(TaskStatus::Skipped, reason.into(), None)
    }

    /// 恢复会话：用缓存结果直接把任务标记为 completed
    pub fn restore_completed(&mut self, result: impl Into<String>, completed_at: Option<DateTime<Utc>>) {
        self.status = TaskStatus::Completed;
        self.result = Some(result.into());
        self.error = None;
        self.completed_at = completed_at.or(self.completed_at).or_else(|| Some(Utc::now()));
    }

    /// 恢复会话：未完成的任务回到 pending 重新执行
    pub fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.result = None;
        self.error = None;
        self.started_at = None;
        self.completed_at = None;
    }

    fn finish(&mut self, status: TaskStatus, result: String, error: Option<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.result = Some(result);
        self.error = error;
        self.completed_at.get_or_insert_with(Utc::now);
        true
    }
}

/// 各状态计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanCounts {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub unfinished: usize,
    pub total: usize,
}

/// 计划：目标 + 有序任务列表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub objective: String,
    pub tasks: Vec<Task>,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(objective: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            objective: objective.into(),
            tasks,
            created_at: Utc::now(),
        }
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    pub fn counts(&self) -> PlanCounts {
        let mut counts = PlanCounts {
            total: self.tasks.len(),
            ..Default::default()
        };
        for task in &self.tasks {
            match task.status {
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Skipped => counts.skipped += 1,
                _ => counts.unfinished += 1,
            }
        }
        counts
    }

    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }

    /// 依赖环检测（DFS）；返回环上的任务 ID 路径
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let by_id: HashMap<&str, &Task> = self.tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let mut done: HashSet<&str> = HashSet::new();

        for task in &self.tasks {
            let mut path: Vec<&str> = Vec::new();
            if Self::dfs_cycle(&task.id, &by_id, &mut done, &mut path) {
                return Some(path.into_iter().map(String::from).collect());
            }
        }
        None
    }

    fn dfs_cycle<'a>(
        id: &'a str,
        by_id: &HashMap<&'a str, &'a Task>,
        done: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> bool {
        if let Some(pos) = path.iter().position(|p| *p == id) {
            path.drain(..pos);
            path.push(id);
            return true;
        }
        if done.contains(id) {
            return false;
        }
        path.push(id);
        if let Some(task) = by_id.get(id).copied() {
            for dep in &task.dependencies {
                if Self::dfs_cycle(dep, by_id, done, path) {
                    return true;
                }
            }
        }
        path.pop();
        done.insert(id);
        false
    }
}

/// 会话状态；`completed` 之外的状态都可恢复
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Planning,
    Executing,
    Synthesizing,
    Completed,
    Failed,
}

/// 每个会话一条的元信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub conversation_id: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_task_ids: Vec<String>,
    #[serde(default)]
    pub failed_task_ids: Vec<String>,
    #[serde(default)]
    pub skipped_task_ids: Vec<String>,
    /// 发起本会话的用户请求；只有同一请求才复用已保存的计划
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
}

impl SessionMeta {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            conversation_id: conversation_id.into(),
            status: SessionStatus::Planning,
            started_at: now,
            updated_at: now,
            completed_task_ids: Vec::new(),
            failed_task_ids: Vec::new(),
            skipped_task_ids: Vec::new(),
            request: None,
        }
    }

    pub fn with_request(mut self, request: impl Into<String>) -> Self {
        self.request = Some(request.into());
        self
    }

    pub fn matches_request(&self, request: &str) -> bool {
        self.request.as_deref() == Some(request)
    }

    pub fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// 按计划顺序重建三个 ID 列表
    pub fn sync_from_plan(&mut self, plan: &Plan) {
        let ids = |status: TaskStatus| -> Vec<String> {
            plan.tasks
                .iter()
                .filter(|t| t.status == status)
                .map(|t| t.id.clone())
                .collect()
        };
        self.completed_task_ids = ids(TaskStatus::Completed);
        self.failed_task_ids = ids(TaskStatus::Failed);
        self.skipped_task_ids = ids(TaskStatus::Skipped);
        self.updated_at = Utc::now();
    }
}

/// 单个任务结果（task-results/{taskId}.json）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResultRecord {
    pub task_id: String,
    pub status: TaskStatus,
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskResultRecord {
    /// 从终态任务生成记录
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            status: task.status,
            result: task.result.clone().unwrap_or_default(),
            completed_at: task.completed_at,
        }
    }
}
