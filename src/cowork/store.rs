//! 会话持久化：`{root}/{conversationId}/` 下的 session.json、plan.json 与 task-results/
//!
//! 所有操作返回 Result，由引擎决定是记录日志继续还是上抛（见 `require_persistence`）。
//! 读取时文件不存在返回 `Ok(None)`；写入先写临时文件再 rename，避免中途崩溃留下半个 JSON。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tracing::{debug, warn};

use crate::core::{CoworkError, Result};
use crate::cowork::types::{Plan, SessionMeta, SessionStatus, TaskResultRecord};

const SESSION_FILE: &str = "session.json";
const PLAN_FILE: &str = "plan.json";
const TASK_RESULTS_DIR: &str = "task-results";

/// 只保留字母数字、`-`、`_`，其余字符直接去掉；结果为空时用 `_`，保证不会落到根目录本身
pub fn sanitize_id(id: &str) -> String {
    let sanitized: String = id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if sanitized.is_empty() {
        "_".to_string()
    } else {
        sanitized
    }
}

/// 先写 `.tmp` 再 rename
async fn atomic_write(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, content).await?;
    fs::rename(&temp_path, path).await?;
    Ok(())
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    atomic_write(path, &content).await
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// 持久化失败时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistencePolicy {
    /// 记录 warn 日志后继续
    BestEffort,
    /// 转为 `CoworkError::Persistence` 上抛
    Required,
}

impl PersistencePolicy {
    pub fn from_required(required: bool) -> Self {
        if required {
            PersistencePolicy::Required
        } else {
            PersistencePolicy::BestEffort
        }
    }

    pub fn apply(self, result: Result<()>, what: &str) -> Result<()> {
        match (result, self) {
            (Ok(()), _) => Ok(()),
            (Err(e), PersistencePolicy::BestEffort) => {
                warn!("Failed to persist {}: {}", what, e);
                Ok(())
            }
            (Err(e), PersistencePolicy::Required) => {
                Err(CoworkError::Persistence(format!("{}: {}", what, e)))
            }
        }
    }
}

/// `check_resumable_session` 的结果
#[derive(Debug, Clone, Default)]
pub struct ResumableSession {
    pub resumable: bool,
    pub meta: Option<SessionMeta>,
    pub plan: Option<Plan>,
    pub task_results: HashMap<String, TaskResultRecord>,
}

/// 单个会话的存储句柄
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
    session_dir: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>, conversation_id: &str) -> Self {
        let root = root.into();
        let session_dir = root.join(sanitize_id(conversation_id));
        Self { root, session_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    fn task_result_path(&self, task_id: &str) -> PathBuf {
        self.session_dir
            .join(TASK_RESULTS_DIR)
            .join(format!("{}.json", sanitize_id(task_id)))
    }

    pub async fn save_session_meta(&self, meta: &SessionMeta) -> Result<()> {
        write_json(&self.session_dir.join(SESSION_FILE), meta).await
    }

    pub async fn load_session_meta(&self) -> Result<Option<SessionMeta>> {
        read_json(&self.session_dir.join(SESSION_FILE)).await
    }

    pub async fn save_plan(&self, plan: &Plan) -> Result<()> {
        write_json(&self.session_dir.join(PLAN_FILE), plan).await
    }

    pub async fn load_plan(&self) -> Result<Option<Plan>> {
        read_json(&self.session_dir.join(PLAN_FILE)).await
    }

    /// 每个任务一个文件，重复保存直接覆盖
    pub async fn save_task_result(&self, record: &TaskResultRecord) -> Result<()> {
        write_json(&self.task_result_path(&record.task_id), record).await
    }

    /// 读取全部任务结果；单个文件损坏时跳过，目录不存在时返回空表
    pub async fn load_all_task_results(&self) -> HashMap<String, TaskResultRecord> {
        let mut results = HashMap::new();
        let dir = self.session_dir.join(TASK_RESULTS_DIR);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => return results,
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to enumerate {}: {}", dir.display(), e);
                    break;
                }
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<TaskResultRecord>(&path).await {
                Ok(Some(record)) => {
                    results.insert(record.task_id.clone(), record);
                }
                Ok(None) => {}
                Err(e) => debug!("Skipping unreadable task result {}: {}", path.display(), e),
            }
        }
        results
    }

    /// 无 meta 或 meta 已 completed 时不可恢复；否则带上计划与缓存结果
    pub async fn check_resumable_session(&self) -> Result<ResumableSession> {
        let Some(meta) = self.load_session_meta().await? else {
            return Ok(ResumableSession::default());
        };
        if meta.status == SessionStatus::Completed {
            return Ok(ResumableSession {
                resumable: false,
                meta: Some(meta),
                ..Default::default()
            });
        }

        let plan = match self.load_plan().await {
            Ok(plan) => plan,
            Err(e) => {
                warn!("Saved plan is unreadable, it will be regenerated: {}", e);
                None
            }
        };
        let task_results = self.load_all_task_results().await;
        Ok(ResumableSession {
            resumable: true,
            meta: Some(meta),
            plan,
            task_results,
        })
    }

    /// 删除会话目录；根目录为空时一并删除。根目录的删除失败（例如另一个会话刚好在写）直接忽略
    pub async fn cleanup_session(&self) -> Result<()> {
        match fs::remove_dir_all(&self.session_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Ok(mut entries) = fs::read_dir(&self.root).await {
            if let Ok(None) = entries.next_entry().await {
                if let Err(e) = fs::remove_dir(&self.root).await {
                    debug!("Session root not removed: {}", e);
                }
            }
        }
        Ok(())
    }
}
