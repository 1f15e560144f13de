//! Cowork 错误类型
//!
//! 引擎内部统一使用 CoworkError；LLM 客户端边界仍保持 `Result<String, String>`，由调用方包装为 `CoworkError::Llm`。

use thiserror::Error;

/// 编排过程中可能出现的错误（LLM、子 Agent、持久化、取消、超时等）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoworkError {
    #[error("LLM error: {0}")]
    Llm(String),

    #[error("LLM call timed out after {0}s")]
    LlmTimeout(u64),

    #[error("Agent execution failed: {0}")]
    Agent(String),

    #[error("Task timed out after {0}s")]
    TaskTimeout(u64),

    #[error("Cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Config error: {0}")]
    Config(String),

    /// 仅在 `require_persistence` 开启时由引擎上抛
    #[error("Persistence failed: {0}")]
    Persistence(String),
}

impl CoworkError {
    /// 是否属于调用方主动取消
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoworkError::Cancelled)
    }
}

impl From<std::io::Error> for CoworkError {
    fn from(e: std::io::Error) -> Self {
        CoworkError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for CoworkError {
    fn from(e: serde_json::Error) -> Self {
        CoworkError::Serialization(e.to_string())
    }
}

impl From<::config::ConfigError> for CoworkError {
    fn from(e: ::config::ConfigError) -> Self {
        CoworkError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoworkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: CoworkError = io.into();
        assert!(matches!(err, CoworkError::Io(ref m) if m.contains("missing")));
    }

    #[test]
    fn test_is_cancelled() {
        assert!(CoworkError::Cancelled.is_cancelled());
        assert!(!CoworkError::Agent("boom".into()).is_cancelled());
    }

    #[test]
    fn test_display() {
        assert_eq!(CoworkError::LlmTimeout(60).to_string(), "LLM call timed out after 60s");
    }
}
