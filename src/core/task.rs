//! 任务类型：调用方请求、规范化后的任务、阶段与结果

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::OrchestratorError;

/// 调用方提交的原始请求；content / message / input 三选一
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "type")]
    pub task_type: Option<String>,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl TaskRequest {
    pub fn new(content: impl Into<Value>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// 规范化：从 content → message → input 中取第一个非空字段作为 content
    pub fn normalize(self, task_id: String) -> Result<Task, OrchestratorError> {
        let content = self
            .content
            .filter(|v| !is_blank(v))
            .or_else(|| {
                self.message
                    .filter(|m| !m.trim().is_empty())
                    .map(Value::String)
            })
            .or_else(|| self.input.filter(|v| !is_blank(v)))
            .ok_or_else(|| {
                OrchestratorError::Validation(
                    "task requires one of `content`, `message` or `input`".to_string(),
                )
            })?;

        Ok(Task {
            id: task_id,
            task_type: self.task_type.unwrap_or_else(|| "general".to_string()),
            content,
            declared_tools: self.tools,
            participants: self.participants,
            metadata: self.metadata,
        })
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// 规范化后的任务，创建后不可变
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub content: Value,
    pub declared_tools: Vec<String>,
    pub participants: Vec<String>,
    pub metadata: HashMap<String, Value>,
}

impl Task {
    /// 用于能力推断的文本视图
    pub fn content_text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// 任务阶段：线性推进，cancelled 可从任意非终态进入
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Received,
    Preprocessing,
    WorkflowSelecting,
    WorkflowExecuting,
    Postprocessing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// 任务最终状态（成功路径）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Cancelled,
}

/// process_task 的成功返回
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    pub workflow_id: Option<String>,
    pub result: Option<Value>,
    pub duration_ms: u64,
}

/// 活跃任务视图（get_active_tasks）
#[derive(Debug, Clone, Serialize)]
pub struct ActiveTaskInfo {
    pub task_id: String,
    pub phase: TaskPhase,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_prefers_content() {
        let req = TaskRequest {
            content: Some(json!("from content")),
            message: Some("from message".into()),
            ..Default::default()
        };
        let task = req.normalize("t1".into()).unwrap();
        assert_eq!(task.content, json!("from content"));
        assert_eq!(task.task_type, "general");
    }

    #[test]
    fn test_normalize_falls_back_to_message_then_input() {
        let req = TaskRequest {
            content: Some(json!("   ")),
            message: Some("hello".into()),
            ..Default::default()
        };
        assert_eq!(req.normalize("t".into()).unwrap().content, json!("hello"));

        let req = TaskRequest {
            input: Some(json!({"q": 1})),
            ..Default::default()
        };
        assert_eq!(req.normalize("t".into()).unwrap().content, json!({"q": 1}));
    }

    #[test]
    fn test_normalize_rejects_empty_request() {
        let err = TaskRequest::default().normalize("t".into()).unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[test]
    fn test_terminal_phases() {
        assert!(TaskPhase::Cancelled.is_terminal());
        assert!(!TaskPhase::WorkflowExecuting.is_terminal());
    }
}
