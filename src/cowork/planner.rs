//! Planner：把对话拆成带依赖的任务计划
//!
//! 调用一次 LLM，回复中应包含 `{"objective": ..., "tasks": [...]}`（代码块或任意位置的对象均可）。
//! 每个任务宽松解析后归一化：缺失 id 按序号补 `task-{n}`，重复 id 改名，status 一律重置为 pending，
//! agentType 由 type 查表得到。解析失败或任务为空时返回 None，调用方应退回直接回复。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cowork::json::{extract_fenced_block, objects_with_key};
use crate::cowork::types::{Plan, Task, TaskType};
use crate::llm::{complete_with_timeout, last_user_content, LlmClient, Message, Role};

const PLANNER_PROMPT: &str = r#"You are the planner of a multi-agent assistant. Break the user's request into a small number of concrete tasks that specialised agents can execute one after another.

Task types:
- coding: write or modify code, run commands, produce files
- research: search the web and collect information
- review: review code or documents produced by earlier tasks
- test: write or run tests
- document: write documentation, reports or other files
- general: anything else

Rules:
- Use between 1 and 8 tasks. Prefer fewer, larger tasks.
- Give each task a short id such as "task-1".
- "dependencies" lists ids of tasks whose results this task needs. Never create cycles.
- Each description must be self-contained: the agent only sees the description and the results of its dependencies.

Respond with a single JSON object in a ```json code block:
{"objective": "<overall goal>", "tasks": [{"id": "task-1", "title": "...", "description": "...", "type": "coding", "dependencies": []}]}"#;

const DEFAULT_TITLE: &str = "Untitled task";

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    objective: Option<String>,
    #[serde(default)]
    tasks: Vec<RawTask>,
}

/// LLM 给出的任务：所有字段都可能缺失或类型不对
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawTask {
    id: Option<Value>,
    title: Option<String>,
    description: Option<String>,
    #[serde(rename = "type")]
    task_type: Option<String>,
    dependencies: Option<Value>,
}

/// 字符串或数字都当作 ID
fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_dependencies(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(value_as_id).collect(),
        Some(other) => value_as_id(other).into_iter().collect(),
        None => Vec::new(),
    }
}

fn normalize_task(index: usize, raw: RawTask) -> Task {
    let id = raw
        .id
        .as_ref()
        .and_then(value_as_id)
        .unwrap_or_else(|| format!("task-{}", index + 1));
    let title = raw
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_TITLE.to_string());
    let description = raw
        .description
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| title.clone());
    let task_type = raw
        .task_type
        .as_deref()
        .map(TaskType::from_label)
        .unwrap_or(TaskType::General);

    Task::new(id, title, description, task_type)
        .with_dependencies(parse_dependencies(raw.dependencies.as_ref()))
}

/// 后出现的重复 id 改为 `task-{n}`（n 为序号），并避开计划中已有的全部 id
fn dedupe_ids(tasks: &mut [Task]) {
    let declared: HashSet<String> = tasks.iter().map(|t| t.id.clone()).collect();
    let mut seen: HashSet<String> = HashSet::new();
    for (i, task) in tasks.iter_mut().enumerate() {
        if seen.insert(task.id.clone()) {
            continue;
        }
        let base = format!("task-{}", i + 1);
        let mut candidate = base.clone();
        let mut suffix = 2;
        while declared.contains(&candidate) || seen.contains(&candidate) {
            candidate = format!("{}-{}", base, suffix);
            suffix += 1;
        }
        warn!(duplicate = %task.id, renamed = %candidate, "Planner returned a duplicate task id");
        task.id = candidate.clone();
        seen.insert(candidate);
    }
}

/// 依次尝试代码块和每个含 `"tasks"` 的对象，取第一个能解析且任务非空的
fn parse_raw_plan(output: &str) -> Option<RawPlan> {
    extract_fenced_block(output)
        .into_iter()
        .chain(objects_with_key(output, "tasks"))
        .find_map(|json| match serde_json::from_str::<RawPlan>(json) {
            Ok(raw) if !raw.tasks.is_empty() => Some(raw),
            Ok(_) => {
                debug!("Plan candidate has no tasks");
                None
            }
            Err(e) => {
                debug!("Plan JSON parse failed: {}", e);
                None
            }
        })
}

/// 解析 Planner 输出；`fallback_objective` 用于 LLM 未给出 objective 的情况
pub fn parse_plan(output: &str, fallback_objective: &str) -> Option<Plan> {
    let raw = parse_raw_plan(output)?;

    let objective = raw
        .objective
        .filter(|o| !o.trim().is_empty())
        .unwrap_or_else(|| fallback_objective.to_string());
    let mut tasks: Vec<Task> = raw
        .tasks
        .into_iter()
        .enumerate()
        .map(|(i, raw)| normalize_task(i, raw))
        .collect();
    dedupe_ids(&mut tasks);

    let plan = Plan::new(objective, tasks);
    if let Some(cycle) = plan.find_cycle() {
        warn!(cycle = ?cycle, "Plan contains a dependency cycle; affected tasks will be skipped");
    }
    Some(plan)
}

pub struct Planner {
    llm: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    /// 生成计划；LLM 失败、超时或输出无法解析时返回 None
    pub async fn plan(&self, messages: &[Message]) -> Option<Plan> {
        let fallback_objective = last_user_content(messages).unwrap_or_default().to_string();

        let mut prompt = vec![Message::system(PLANNER_PROMPT)];
        prompt.extend(messages.iter().filter(|m| m.role != Role::System).cloned());

        let output = match complete_with_timeout(self.llm.as_ref(), &prompt, self.timeout).await {
            Ok(output) => output,
            Err(e) => {
                warn!("Planner call failed: {}", e);
                return None;
            }
        };

        let plan = parse_plan(&output, &fallback_objective);
        match &plan {
            Some(plan) => info!(tasks = plan.tasks.len(), "Plan created: {}", plan.objective),
            None => warn!("Planner output could not be parsed into a plan"),
        }
        plan
    }
}
