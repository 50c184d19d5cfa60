//! 工作流协作方：选择器、执行器、目录
//!
//! 编排器只依赖这里的 trait；默认实现是基于目录的确定性选择器和按步骤串行调用服务的执行器。

mod executor;
mod selector;
pub mod types;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::context::{ExecutionContext, ExecutionContextTracker};
use crate::core::error::OrchestratorError;
use crate::core::task::Task;
use crate::registry::ServiceRegistry;
use crate::state::StateStore;

pub use executor::ServiceChainExecutor;
pub use selector::{CatalogWorkflowSelector, ADHOC_WORKFLOW_ID};
pub use types::{WorkflowDefinition, WorkflowId, WorkflowStep};

/// 执行器可用的运行时资源
#[derive(Clone)]
pub struct WorkflowContext {
    pub task_id: String,
    pub registry: Arc<ServiceRegistry>,
    pub contexts: Arc<ExecutionContextTracker>,
    pub state: Arc<StateStore>,
    /// 任务被取消或超时时触发
    pub cancel: CancellationToken,
}

/// 工作流选择器：相同输入必须得到相同结果
#[async_trait]
pub trait WorkflowSelector: Send + Sync {
    async fn select_workflow(
        &self,
        task: &Task,
        context: &ExecutionContext,
    ) -> Result<WorkflowDefinition, OrchestratorError>;
}

/// 工作流执行器
#[async_trait]
pub trait WorkflowExecutor: Send + Sync {
    async fn execute(
        &self,
        workflow: &WorkflowDefinition,
        task: &Task,
        ctx: &WorkflowContext,
    ) -> Result<Value, OrchestratorError>;
}

/// 工作流目录（插件加载器把 workflow 类插件发布到这里）
pub trait WorkflowCatalog: Send + Sync {
    fn register(&self, definition: WorkflowDefinition) -> Result<(), OrchestratorError>;

    fn unregister(&self, id: &str) -> Option<WorkflowDefinition>;

    fn get(&self, id: &str) -> Option<WorkflowDefinition>;

    /// 按 id 排序
    fn list(&self) -> Vec<WorkflowDefinition>;
}

/// 内存目录
#[derive(Default)]
pub struct InMemoryWorkflowCatalog {
    workflows: RwLock<BTreeMap<WorkflowId, WorkflowDefinition>>,
}

impl InMemoryWorkflowCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowCatalog for InMemoryWorkflowCatalog {
    fn register(&self, definition: WorkflowDefinition) -> Result<(), OrchestratorError> {
        definition.validate()?;
        let mut workflows = self.workflows.write();
        if workflows.contains_key(&definition.id) {
            return Err(OrchestratorError::Validation(format!(
                "workflow already registered: {}",
                definition.id
            )));
        }
        tracing::info!("Workflow registered: {}", definition.id);
        workflows.insert(definition.id.clone(), definition);
        Ok(())
    }

    fn unregister(&self, id: &str) -> Option<WorkflowDefinition> {
        let removed = self.workflows.write().remove(id);
        if removed.is_some() {
            tracing::info!("Workflow unregistered: {}", id);
        }
        removed
    }

    fn get(&self, id: &str) -> Option<WorkflowDefinition> {
        self.workflows.read().get(id).cloned()
    }

    fn list(&self) -> Vec<WorkflowDefinition> {
        self.workflows.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(id: &str) -> WorkflowDefinition {
        WorkflowDefinition::new(id, id).with_step(WorkflowStep::new("only", vec!["search".into()]))
    }

    #[test]
    fn test_catalog_register_and_list_sorted() {
        let catalog = InMemoryWorkflowCatalog::new();
        catalog.register(def("b")).unwrap();
        catalog.register(def("a")).unwrap();
        assert!(catalog.register(def("a")).is_err());

        let ids: Vec<_> = catalog.list().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(catalog.unregister("a").is_some());
        assert!(catalog.unregister("a").is_none());
        assert!(catalog.get("a").is_none());
    }
}
