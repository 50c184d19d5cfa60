//! 编排错误类型与标准化任务失败
//!
//! 组件内部错误（探针失败、单个插件加载失败、订阅回调异常）就地记录并降级；
//! 只有任务关键路径上的错误（校验、超时、工作流执行失败）会以 TaskFailure 形式交给调用方。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// 编排核心的错误分类
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// 任务格式错误、描述文件缺字段等，单次操作致命，不重试
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// 服务存在但最近一次探针失败；走 select_services 的调用方不会见到
    #[error("Service unhealthy: {0}")]
    UnhealthyService(String),

    /// 插件依赖成环，整个发现批次作废
    #[error("Circular dependency detected: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    /// 能力提供者或工作流的失败，始终携带原始原因
    #[error("Execution failed: {message}")]
    Execution {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Capacity exceeded: {active} of {limit} task slots in use")]
    CapacityExceeded { active: usize, limit: usize },

    #[error("Task cancelled")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl OrchestratorError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            source: None,
        }
    }

    pub fn execution_with<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Execution {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// 稳定错误码
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::UnhealthyService(_) => ErrorCode::ServiceUnhealthy,
            Self::CircularDependency(_) => ErrorCode::CircularDependency,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Execution { .. } => ErrorCode::ExecutionError,
            Self::CapacityExceeded { .. } => ErrorCode::CapacityExceeded,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Storage(_) => ErrorCode::StorageError,
            Self::Config(_) => ErrorCode::ConfigError,
        }
    }
}

/// 对外暴露的稳定错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    NotFound,
    ServiceUnhealthy,
    CircularDependency,
    Timeout,
    ExecutionError,
    CapacityExceeded,
    Cancelled,
    StorageError,
    ConfigError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::ServiceUnhealthy => "SERVICE_UNHEALTHY",
            Self::CircularDependency => "CIRCULAR_DEPENDENCY",
            Self::Timeout => "TIMEOUT",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::CapacityExceeded => "CAPACITY_EXCEEDED",
            Self::Cancelled => "CANCELLED",
            Self::StorageError => "STORAGE_ERROR",
            Self::ConfigError => "CONFIG_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 标准化任务失败：process_task 永远返回它而不是裸错误
#[derive(Error, Debug, Clone, Serialize)]
#[error("[{code}] task {task_id}: {message}")]
pub struct TaskFailure {
    pub task_id: String,
    pub code: ErrorCode,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// 原始错误链（最外层除外）
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

impl TaskFailure {
    pub fn from_error(task_id: impl Into<String>, err: &OrchestratorError) -> Self {
        let mut details = Vec::new();
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            details.push(cause.to_string());
            source = cause.source();
        }
        Self {
            task_id: task_id.into(),
            code: err.code(),
            message: err.to_string(),
            timestamp: Utc::now(),
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(
            OrchestratorError::Validation("x".into()).code().as_str(),
            "VALIDATION_ERROR"
        );
        assert_eq!(OrchestratorError::Timeout(5).code(), ErrorCode::Timeout);
        assert_eq!(
            OrchestratorError::CircularDependency(vec!["a".into(), "b".into(), "a".into()])
                .to_string(),
            "Circular dependency detected: a -> b -> a"
        );
    }

    #[test]
    fn test_task_failure_keeps_cause_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = OrchestratorError::execution_with("provider crashed", io);
        let failure = TaskFailure::from_error("t1", &err);

        assert_eq!(failure.task_id, "t1");
        assert_eq!(failure.code, ErrorCode::ExecutionError);
        assert_eq!(failure.details, vec!["disk on fire".to_string()]);

        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["code"], "EXECUTION_ERROR");
    }
}
