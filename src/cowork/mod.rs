//! Cowork：多 Agent 任务编排
//!
//! - **supervisor**: 判断直接回复还是进入规划
//! - **planner**: 生成带依赖的任务计划
//! - **store**: 会话持久化与恢复
//! - **budget**: Token 预算与任务成本表
//! - **dispatcher**: 就绪队列调度、依赖注入、任务执行
//! - **synthesizer**: 汇总报告
//! - **engine**: 串起整个流水线并输出 StreamEvent

pub mod budget;
pub mod dispatcher;
pub mod engine;
pub mod events;
pub mod json;
pub mod planner;
pub mod store;
pub mod supervisor;
pub mod synthesizer;
pub mod types;

pub use budget::{TaskCostTable, TokenBudget};
pub use dispatcher::{DispatchContext, DispatchReport, Dispatcher};
pub use engine::{CoworkEngine, CoworkRequest, RunOutcome};
pub use events::StreamEvent;
pub use planner::Planner;
pub use store::{PersistencePolicy, ResumableSession, SessionStore};
pub use supervisor::Supervisor;
pub use synthesizer::Synthesizer;
pub use types::{
    Decision, Plan, PlanCounts, SessionMeta, SessionStatus, Task, TaskResultRecord, TaskStatus,
    TaskType,
};
