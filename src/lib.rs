//! Cowork - 多 Agent 任务编排引擎
//!
//! 模块划分：
//! - **agents**: 任务执行后端抽象（AgentBackend）、事件规范化、直接回复
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、会话取消
//! - **cowork**: 分类、规划、持久化、调度、汇总与引擎
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **observability**: 日志初始化

pub mod agents;
pub mod config;
pub mod core;
pub mod cowork;
pub mod llm;
pub mod observability;

pub use cowork::{CoworkEngine, CoworkRequest, RunOutcome, StreamEvent};
