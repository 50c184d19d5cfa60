//! 串行服务链执行器
//!
//! 每一步按能力选服务、经注册表调用（注册表负责超时、审计与 record_outcome），
//! 并把调用记录写入执行上下文。第一步的输入是任务 content，之后每步的输入是上一步的输出；
//! `all` 策略会依次调用全部匹配服务，输出为数组。

use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{WorkflowContext, WorkflowDefinition, WorkflowExecutor, WorkflowStep};
use crate::context::{ServiceCallRecord, StepRecord};
use crate::core::error::OrchestratorError;
use crate::core::task::Task;
use crate::registry::{infer_task_capabilities, SelectionStrategy, ServiceCallContext};

#[derive(Debug, Default, Clone, Copy)]
pub struct ServiceChainExecutor;

impl ServiceChainExecutor {
    pub fn new() -> Self {
        Self
    }

    async fn run_step(
        &self,
        step: &WorkflowStep,
        task: &Task,
        input: Value,
        ctx: &WorkflowContext,
    ) -> Result<Value, OrchestratorError> {
        let required = if step.capabilities.is_empty() {
            infer_task_capabilities(&task.task_type, &task.content_text(), &task.declared_tools)
        } else {
            step.capabilities.clone()
        };

        let count = if step.strategy == SelectionStrategy::All { usize::MAX } else { 1 };
        let matches = ctx.registry.select_services(&required, step.strategy, count).await;
        if matches.is_empty() {
            return Err(OrchestratorError::execution(format!(
                "no provider available for step '{}' (capabilities: [{}])",
                step.name,
                required.join(", ")
            )));
        }

        let call_ctx = ServiceCallContext::new(step.name.clone())
            .for_task(ctx.task_id.clone())
            .with_cancel(ctx.cancel.clone());

        let mut outputs = Vec::with_capacity(matches.len());
        for chosen in &matches {
            let started = Instant::now();
            let result = ctx.registry.execute(chosen.id(), input.clone(), &call_ctx).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            ctx.contexts.add_service_call(
                &ctx.task_id,
                ServiceCallRecord::new(chosen.id(), step.name.clone(), elapsed_ms, result.is_ok()),
            );
            outputs.push(result?);
        }

        if step.strategy == SelectionStrategy::All {
            Ok(Value::Array(outputs))
        } else {
            Ok(outputs.pop().unwrap_or(Value::Null))
        }
    }
}

#[async_trait]
impl WorkflowExecutor for ServiceChainExecutor {
    async fn execute(
        &self,
        workflow: &WorkflowDefinition,
        task: &Task,
        ctx: &WorkflowContext,
    ) -> Result<Value, OrchestratorError> {
        let mut payload = task.content.clone();

        for step in &workflow.steps {
            if ctx.cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
            let started = Instant::now();
            match self.run_step(step, task, payload, ctx).await {
                Ok(output) => {
                    ctx.contexts.add_step(
                        &ctx.task_id,
                        StepRecord::new(format!("step:{}", step.name))
                            .with_duration(started.elapsed().as_millis() as u64)
                            .with_detail(json!({ "workflow": workflow.id })),
                    );
                    payload = output;
                }
                Err(e) => {
                    ctx.contexts.add_step(
                        &ctx.task_id,
                        StepRecord::new(format!("step:{}", step.name))
                            .failed()
                            .with_duration(started.elapsed().as_millis() as u64)
                            .with_detail(json!({ "workflow": workflow.id, "error": e.to_string() })),
                    );
                    return Err(e);
                }
            }
        }

        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::context::{CallerMetadata, ExecutionContextTracker};
    use crate::core::task::TaskRequest;
    use crate::registry::tests::{registry, StubService};
    use crate::state::StateStore;

    async fn setup() -> (WorkflowContext, Task) {
        let reg = Arc::new(registry());
        reg.register(StubService::new("searcher", &["search"])).await.unwrap();
        reg.register(StubService::new("writer", &["summarization"])).await.unwrap();
        let contexts = Arc::new(ExecutionContextTracker::default());
        contexts.create("t1", CallerMetadata::default()).unwrap();
        let ctx = WorkflowContext {
            task_id: "t1".into(),
            registry: reg,
            contexts,
            state: Arc::new(StateStore::new()),
            cancel: CancellationToken::new(),
        };
        let task = TaskRequest::new("rust async").normalize("t1".into()).unwrap();
        (ctx, task)
    }

    #[tokio::test]
    async fn test_steps_chain_outputs_and_record_calls() {
        let (ctx, task) = setup().await;
        let wf = WorkflowDefinition::new("w", "w")
            .with_step(WorkflowStep::new("gather", vec!["search".into()]))
            .with_step(WorkflowStep::new("write", vec!["summarization".into()]));

        let out = ServiceChainExecutor::new().execute(&wf, &task, &ctx).await.unwrap();
        assert_eq!(out["service"], "writer");
        assert_eq!(out["echo"]["service"], "searcher");
        assert_eq!(out["echo"]["echo"], "rust async");

        let record = ctx.contexts.get("t1").unwrap();
        assert_eq!(record.service_calls.len(), 2);
        assert_eq!(record.steps.len(), 2);
        assert_eq!(record.resources.network_calls, 2);
        assert_eq!(ctx.registry.status("writer").await.unwrap().metrics.request_count, 1);
    }

    #[tokio::test]
    async fn test_missing_provider_is_execution_error() {
        let (ctx, task) = setup().await;
        let wf = WorkflowDefinition::new("w", "w").with_step(WorkflowStep::new("send", vec!["messaging".into()]));
        let err = ServiceChainExecutor::new().execute(&wf, &task, &ctx).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Execution { .. }));
        let record = ctx.contexts.get("t1").unwrap();
        assert!(!record.steps[0].success);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (ctx, task) = setup().await;
        ctx.cancel.cancel();
        let wf = WorkflowDefinition::new("w", "w").with_step(WorkflowStep::new("gather", vec!["search".into()]));
        let err = ServiceChainExecutor::new().execute(&wf, &task, &ctx).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled));
    }
}
