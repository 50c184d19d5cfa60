//! 基于目录的工作流选择

use std::sync::Arc;

use async_trait::async_trait;

use super::{WorkflowCatalog, WorkflowDefinition, WorkflowSelector, WorkflowStep};
use crate::context::ExecutionContext;
use crate::core::error::OrchestratorError;
use crate::core::task::Task;
use crate::registry::{infer_task_capabilities, SelectionStrategy};

/// 目录里没有匹配时使用的临时单步工作流 id
pub const ADHOC_WORKFLOW_ID: &str = "adhoc";

/// 取目录中（按 id 排序）第一个声明支持该任务类型的工作流；
/// 没有时按任务内容推断能力，生成单步工作流
pub struct CatalogWorkflowSelector {
    catalog: Arc<dyn WorkflowCatalog>,
}

impl CatalogWorkflowSelector {
    pub fn new(catalog: Arc<dyn WorkflowCatalog>) -> Self {
        Self { catalog }
    }

    fn adhoc(task: &Task) -> WorkflowDefinition {
        let capabilities = infer_task_capabilities(&task.task_type, &task.content_text(), &task.declared_tools);
        WorkflowDefinition::new(ADHOC_WORKFLOW_ID, "Direct dispatch")
            .with_step(WorkflowStep::new("dispatch", capabilities).with_strategy(SelectionStrategy::BestMatch))
    }
}

#[async_trait]
impl WorkflowSelector for CatalogWorkflowSelector {
    async fn select_workflow(
        &self,
        task: &Task,
        _context: &ExecutionContext,
    ) -> Result<WorkflowDefinition, OrchestratorError> {
        let chosen = self
            .catalog
            .list()
            .into_iter()
            .find(|w| w.task_types.iter().any(|t| t.eq_ignore_ascii_case(&task.task_type)));

        match chosen {
            Some(workflow) => {
                tracing::debug!("Task {} matched workflow {}", task.id, workflow.id);
                Ok(workflow)
            }
            None => {
                tracing::debug!("Task {} has no catalog workflow; using direct dispatch", task.id);
                Ok(Self::adhoc(task))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CallerMetadata;
    use crate::core::task::TaskRequest;
    use crate::workflow::InMemoryWorkflowCatalog;

    fn task(task_type: &str, content: &str) -> Task {
        TaskRequest::new(content)
            .with_type(task_type)
            .normalize("t1".into())
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_matching_workflow_by_id() {
        let catalog = Arc::new(InMemoryWorkflowCatalog::new());
        for id in ["zeta", "alpha"] {
            catalog
                .register(
                    WorkflowDefinition::new(id, id)
                        .for_task_type("research")
                        .with_step(WorkflowStep::new("s", vec!["search".into()])),
                )
                .unwrap();
        }
        let selector = CatalogWorkflowSelector::new(catalog);
        let ctx = ExecutionContext::new("t1", CallerMetadata::default());

        let first = selector.select_workflow(&task("research", "x"), &ctx).await.unwrap();
        let second = selector.select_workflow(&task("research", "x"), &ctx).await.unwrap();
        assert_eq!(first.id, "alpha");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_falls_back_to_adhoc() {
        let selector = CatalogWorkflowSelector::new(Arc::new(InMemoryWorkflowCatalog::new()));
        let ctx = ExecutionContext::new("t1", CallerMetadata::default());
        let wf = selector
            .select_workflow(&task("general", "please translate this"), &ctx)
            .await
            .unwrap();
        assert_eq!(wf.id, ADHOC_WORKFLOW_ID);
        assert_eq!(wf.steps.len(), 1);
        assert!(wf.steps[0].capabilities.contains(&"translation".to_string()));
    }
}
