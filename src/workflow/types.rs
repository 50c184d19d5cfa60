//! 工作流定义
//!
//! 定义只描述"按什么能力、用什么策略、按什么顺序"调用服务；
//! 插件可以用 TOML 或 JSON 文件提供定义。

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::OrchestratorError;
use crate::registry::SelectionStrategy;

pub type WorkflowId = String;

/// 工作流中的一步
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    /// 为空时按任务内容推断
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub strategy: SelectionStrategy,
}

impl WorkflowStep {
    pub fn new(name: impl Into<String>, capabilities: Vec<String>) -> Self {
        Self {
            name: name.into(),
            capabilities,
            strategy: SelectionStrategy::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// 工作流定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// 适用的任务类型
    #[serde(default)]
    pub task_types: Vec<String>,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            task_types: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    pub fn for_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_types.push(task_type.into());
        self
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.id.trim().is_empty() {
            return Err(OrchestratorError::Validation("workflow id must not be empty".into()));
        }
        if self.steps.is_empty() {
            return Err(OrchestratorError::Validation(format!(
                "workflow {} has no steps",
                self.id
            )));
        }
        if let Some(step) = self.steps.iter().find(|s| s.name.trim().is_empty()) {
            return Err(OrchestratorError::Validation(format!(
                "workflow {} has a step without a name (capabilities: {:?})",
                self.id, step.capabilities
            )));
        }
        Ok(())
    }

    /// 从 `.toml` 或 `.json` 文件读取
    pub fn from_file(path: &Path) -> Result<Self, OrchestratorError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Validation(format!("cannot read workflow file {}: {}", path.display(), e))
        })?;
        let parsed: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&raw)
                .map_err(|e| OrchestratorError::Validation(format!("{}: {}", path.display(), e)))?,
            _ => toml::from_str(&raw)
                .map_err(|e| OrchestratorError::Validation(format!("{}: {}", path.display(), e)))?,
        };
        parsed.validate()?;
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml_definition() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflow.toml");
        std::fs::write(
            &path,
            r#"
id = "research-report"
name = "Research report"
task_types = ["research"]

[[steps]]
name = "gather"
capabilities = ["search"]

[[steps]]
name = "write"
capabilities = ["summarization"]
strategy = "least-loaded"
"#,
        )
        .unwrap();

        let def = WorkflowDefinition::from_file(&path).unwrap();
        assert_eq!(def.id, "research-report");
        assert_eq!(def.steps.len(), 2);
        assert_eq!(def.steps[0].strategy, SelectionStrategy::BestMatch);
        assert_eq!(def.steps[1].strategy, SelectionStrategy::LeastLoaded);
    }

    #[test]
    fn test_validate_rejects_empty_workflow() {
        let def = WorkflowDefinition::new("w", "W");
        assert!(matches!(def.validate(), Err(OrchestratorError::Validation(_))));
        let def = def.with_step(WorkflowStep::new("s", vec![]));
        assert!(def.validate().is_ok());
    }
}
