//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `COWORK__*` 覆盖（双下划线表示嵌套，如 `COWORK__COWORK__TOTAL_TOKEN_BUDGET=50000`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::Result;
use crate::cowork::budget::TaskCostTable;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub cowork: CoworkSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock；优先级由 API Key 与 provider 共同决定
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub deepseek: LlmModelSection,
    #[serde(default)]
    pub openai: LlmModelSection,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            deepseek: LlmModelSection::default(),
            openai: LlmModelSection::default(),
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmModelSection {
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_request_timeout")]
    pub request: u64,
    #[serde(default = "default_stream_timeout")]
    pub stream: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
            stream: default_stream_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

fn default_stream_timeout() -> u64 {
    120
}

/// [cowork] 段：会话目录、Token 预算、并发与截断长度
#[derive(Debug, Clone, Deserialize)]
pub struct CoworkSection {
    /// 会话持久化根目录
    #[serde(default = "default_session_root")]
    pub session_root: PathBuf,
    #[serde(default = "default_total_token_budget")]
    pub total_token_budget: u64,
    /// 同时执行的任务数上限；1 表示按计划顺序串行
    #[serde(default = "default_max_parallel_tasks")]
    pub max_parallel_tasks: usize,
    /// 单个子 Agent 的最大迭代数
    #[serde(default = "default_agent_max_iterations")]
    pub agent_max_iterations: u32,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// 注入依赖结果时每条的最大字符数
    #[serde(default = "default_dependency_context_chars")]
    pub dependency_context_chars: usize,
    /// 汇总报告中每个任务结果的最大字符数
    #[serde(default = "default_synthesis_result_chars")]
    pub synthesis_result_chars: usize,
    /// 为 true 时持久化失败会终止流水线
    #[serde(default)]
    pub require_persistence: bool,
    /// 覆盖默认的任务类型估算成本，键为任务类型（coding / research / ...）
    #[serde(default)]
    pub task_costs: HashMap<String, u64>,
}

impl Default for CoworkSection {
    fn default() -> Self {
        Self {
            session_root: default_session_root(),
            total_token_budget: default_total_token_budget(),
            max_parallel_tasks: default_max_parallel_tasks(),
            agent_max_iterations: default_agent_max_iterations(),
            task_timeout_secs: default_task_timeout_secs(),
            dependency_context_chars: default_dependency_context_chars(),
            synthesis_result_chars: default_synthesis_result_chars(),
            require_persistence: false,
            task_costs: HashMap::new(),
        }
    }
}

fn default_session_root() -> PathBuf {
    PathBuf::from(".cowork/sessions")
}

fn default_total_token_budget() -> u64 {
    100_000
}

fn default_max_parallel_tasks() -> usize {
    1
}

fn default_agent_max_iterations() -> u32 {
    15
}

fn default_task_timeout_secs() -> u64 {
    600
}

fn default_dependency_context_chars() -> usize {
    4000
}

fn default_synthesis_result_chars() -> usize {
    1500
}

/// 引擎运行参数（由 [cowork] 与 [llm.timeouts] 组合而来）
#[derive(Debug, Clone)]
pub struct CoworkSettings {
    pub session_root: PathBuf,
    pub total_token_budget: u64,
    pub max_parallel_tasks: usize,
    pub agent_max_iterations: u32,
    pub task_timeout: Duration,
    pub llm_timeout: Duration,
    pub dependency_context_chars: usize,
    pub synthesis_result_chars: usize,
    pub require_persistence: bool,
    pub task_costs: TaskCostTable,
}

impl CoworkSettings {
    /// 以指定会话根目录构造默认参数（测试与嵌入场景）
    pub fn new(session_root: impl Into<PathBuf>) -> Self {
        let mut section = CoworkSection::default();
        section.session_root = session_root.into();
        Self::from_sections(&section, &LlmTimeoutsSection::default())
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::from_sections(&cfg.cowork, &cfg.llm.timeouts)
    }

    fn from_sections(cowork: &CoworkSection, timeouts: &LlmTimeoutsSection) -> Self {
        Self {
            session_root: cowork.session_root.clone(),
            total_token_budget: cowork.total_token_budget,
            max_parallel_tasks: cowork.max_parallel_tasks.max(1),
            agent_max_iterations: cowork.agent_max_iterations,
            task_timeout: Duration::from_secs(cowork.task_timeout_secs),
            llm_timeout: Duration::from_secs(timeouts.request),
            dependency_context_chars: cowork.dependency_context_chars,
            synthesis_result_chars: cowork.synthesis_result_chars,
            require_persistence: cowork.require_persistence,
            task_costs: TaskCostTable::with_overrides(&cowork.task_costs),
        }
    }

    pub fn with_token_budget(mut self, budget: u64) -> Self {
        self.total_token_budget = budget;
        self
    }

    pub fn with_max_parallel_tasks(mut self, n: usize) -> Self {
        self.max_parallel_tasks = n.max(1);
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_llm_timeout(mut self, timeout: Duration) -> Self {
        self.llm_timeout = timeout;
        self
    }

    pub fn with_require_persistence(mut self, required: bool) -> Self {
        self.require_persistence = required;
        self
    }
}

/// 从 config 目录加载配置，环境变量 COWORK__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 COWORK__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("COWORK")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    Ok(c.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cowork::TaskType;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.cowork.total_token_budget, 100_000);
        assert_eq!(cfg.cowork.max_parallel_tasks, 1);
        assert_eq!(cfg.llm.timeouts.request, 60);
        assert_eq!(cfg.cowork.session_root, PathBuf::from(".cowork/sessions"));
    }

    #[test]
    fn test_load_from_file_with_cost_override() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cowork.toml");
        std::fs::write(
            &path,
            r#"
[llm]
provider = "mock"

[cowork]
total_token_budget = 20000
max_parallel_tasks = 0

[cowork.task_costs]
coding = 12000
"#,
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.llm.provider, "mock");
        assert_eq!(cfg.cowork.total_token_budget, 20000);

        let settings = CoworkSettings::from_config(&cfg);
        assert_eq!(settings.max_parallel_tasks, 1);
        assert_eq!(settings.task_costs.cost(TaskType::Coding), 12000);
        assert_eq!(settings.llm_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[cowork\ntotal_token_budget = ").unwrap();

        let err = load_config(Some(path)).unwrap_err();
        assert!(matches!(err, crate::core::CoworkError::Config(_)));
    }
}
