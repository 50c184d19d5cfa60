//! 任务编排器：接收任务 → 创建执行上下文 → 选择工作流 → 在并发上限与超时内执行 → 收尾
//!
//! 阶段线性推进：received → preprocessing → workflow_selecting → workflow_executing → postprocessing，
//! 终态为 completed / failed / cancelled。无论结果如何，任务都会离开活跃集合，
//! 上下文在宽限期后清理，便于调用方稍后查询。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::context::{CallerMetadata, ExecutionContextTracker, StepRecord, WorkflowRunRecord};
use crate::core::error::{OrchestratorError, TaskFailure};
use crate::core::events::{EventBus, LifecycleEvent};
use crate::core::supervisor::TaskSupervisor;
use crate::core::task::{ActiveTaskInfo, TaskOutcome, TaskPhase, TaskRequest, TaskStatus};
use crate::plugins::{LoadReport, LoadedPluginInfo, PluginLoader, PollingNotifier};
use crate::registry::{ServiceRegistry, ServiceStatus};
use crate::state::{StateStats, StateStore};
use crate::workflow::{WorkflowCatalog, WorkflowContext, WorkflowExecutor, WorkflowSelector};

struct ActiveTask {
    phase: TaskPhase,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct TaskCounters {
    completed: u64,
    failed: u64,
    cancelled: u64,
    rejected: u64,
    completed_duration_ms: u64,
}

/// get_status 中的任务计数
#[derive(Debug, Clone, Serialize)]
pub struct TaskStats {
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceStats {
    pub total_processed: u64,
    /// 没有处理过任务时为 1.0
    pub success_rate: f64,
    /// 仅统计成功任务
    pub average_duration_ms: f64,
}

/// 编排器整体状态
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub services: Vec<ServiceStatus>,
    pub tasks: TaskStats,
    pub performance: PerformanceStats,
    pub plugins: Vec<LoadedPluginInfo>,
    pub state: StateStats,
    pub contexts: usize,
}

/// process_task 结束时把任务移出活跃集合（含 panic / future 被丢弃的情况）
struct ActiveGuard<'a> {
    active: &'a Mutex<HashMap<String, ActiveTask>>,
    supervisor: &'a TaskSupervisor,
    task_id: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.lock().remove(&self.task_id);
        self.supervisor.release(&self.task_id);
    }
}

/// 任务编排器
pub struct TaskOrchestrator {
    config: AppConfig,
    events: EventBus,
    registry: Arc<ServiceRegistry>,
    plugins: Arc<PluginLoader>,
    state: Arc<StateStore>,
    contexts: Arc<ExecutionContextTracker>,
    catalog: Arc<dyn WorkflowCatalog>,
    selector: Arc<dyn WorkflowSelector>,
    executor: Arc<dyn WorkflowExecutor>,
    supervisor: TaskSupervisor,
    active: Mutex<HashMap<String, ActiveTask>>,
    counters: Mutex<TaskCounters>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: AppConfig,
        events: EventBus,
        registry: Arc<ServiceRegistry>,
        plugins: Arc<PluginLoader>,
        state: Arc<StateStore>,
        contexts: Arc<ExecutionContextTracker>,
        catalog: Arc<dyn WorkflowCatalog>,
        selector: Arc<dyn WorkflowSelector>,
        executor: Arc<dyn WorkflowExecutor>,
    ) -> Self {
        Self {
            config,
            events,
            registry,
            plugins,
            state,
            contexts,
            catalog,
            selector,
            executor,
            supervisor: TaskSupervisor::new(),
            active: Mutex::new(HashMap::new()),
            counters: Mutex::new(TaskCounters::default()),
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn plugins(&self) -> &Arc<PluginLoader> {
        &self.plugins
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub fn contexts(&self) -> &Arc<ExecutionContextTracker> {
        &self.contexts
    }

    pub fn catalog(&self) -> &Arc<dyn WorkflowCatalog> {
        &self.catalog
    }

    /// 恢复持久化状态、按依赖顺序加载插件，并启动后台循环
    ///
    /// 插件依赖成环时整个加载批次作废，返回 CircularDependency，后台循环不会启动。
    pub async fn init(&self) -> Result<LoadReport, OrchestratorError> {
        let restored = self.state.init().await?;
        if restored.restored > 0 || restored.discarded > 0 {
            tracing::info!(
                "State restored: {} scopes, {} expired scopes discarded",
                restored.restored,
                restored.discarded
            );
        }

        let report = self.plugins.discover_and_load().await?;

        let token = self.supervisor.root_token();
        let mut handles = Vec::new();
        handles.push(
            self.registry
                .spawn_health_monitor(self.config.registry.health_check_interval(), token.clone()),
        );
        handles.push(
            self.state
                .spawn_cleanup(self.config.state.cleanup_interval(), token.clone()),
        );
        handles.push(
            self.contexts
                .spawn_sweeper(self.config.context.sweep_interval(), token.clone()),
        );
        if self.config.plugins.hot_reload {
            let notifier = PollingNotifier::new(
                self.plugins.directories().to_vec(),
                self.config.plugins.poll_interval(),
            );
            handles.push(self.plugins.spawn_hot_reload(Box::new(notifier), token));
        }
        self.background.lock().extend(handles);

        tracing::info!(
            "Orchestrator initialized: {} services, {} plugins loaded",
            self.registry.len().await,
            report.loaded.len()
        );
        Ok(report)
    }

    /// 停止后台循环、取消在途任务、逆序卸载插件、落盘状态
    pub async fn shutdown(&self) {
        tracing::info!("Orchestrator shutting down");
        self.supervisor.cancel_all();
        let handles: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Background loop ended abnormally: {}", e);
            }
        }
        self.plugins.shutdown().await;
        self.state.shutdown().await;
        tracing::info!("Orchestrator shut down");
    }

    /// 处理一个任务；失败时总是返回标准化的 TaskFailure
    pub async fn process_task(&self, request: TaskRequest, caller: CallerMetadata) -> Result<TaskOutcome, TaskFailure> {
        let task_id = request
            .id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        self.admit(&task_id).map_err(|e| TaskFailure::from_error(&task_id, &e))?;
        let _guard = ActiveGuard {
            active: &self.active,
            supervisor: &self.supervisor,
            task_id: task_id.clone(),
        };
        self.events.publish(LifecycleEvent::TaskReceived {
            task_id: task_id.clone(),
        });
        tracing::info!("Task {} received", task_id);

        let started = Instant::now();
        let token = self.supervisor.child_token(&task_id);

        if let Err(e) = self.contexts.create(&task_id, caller) {
            self.counters.lock().failed += 1;
            return Err(TaskFailure::from_error(&task_id, &e));
        }

        let mut workflow_id = None;
        let result = self.run_pipeline(&task_id, request, &token, &mut workflow_id).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        let grace = self.config.orchestrator.cleanup_grace();

        match result {
            Ok(value) => {
                self.set_phase(&task_id, TaskPhase::Completed);
                {
                    let mut counters = self.counters.lock();
                    counters.completed += 1;
                    counters.completed_duration_ms += duration_ms;
                }
                self.events.publish(LifecycleEvent::TaskCompleted {
                    task_id: task_id.clone(),
                    duration_ms,
                });
                tracing::info!("Task {} completed in {}ms", task_id, duration_ms);
                self.contexts.schedule_cleanup(&task_id, grace);
                Ok(TaskOutcome {
                    task_id,
                    status: TaskStatus::Completed,
                    workflow_id,
                    result: Some(value),
                    duration_ms,
                })
            }
            Err(OrchestratorError::Cancelled) => {
                self.set_phase(&task_id, TaskPhase::Cancelled);
                self.counters.lock().cancelled += 1;
                self.contexts.mark_cancelled(&task_id);
                self.events.publish(LifecycleEvent::TaskCancelled {
                    task_id: task_id.clone(),
                });
                tracing::info!("Task {} cancelled after {}ms", task_id, duration_ms);
                self.contexts.schedule_cleanup(&task_id, grace);
                Ok(TaskOutcome {
                    task_id,
                    status: TaskStatus::Cancelled,
                    workflow_id,
                    result: None,
                    duration_ms,
                })
            }
            Err(e) => {
                let code = e.code();
                self.contexts.add_error(&task_id, e.to_string(), Some(code.as_str()));
                self.set_phase(&task_id, TaskPhase::Failed);
                self.counters.lock().failed += 1;
                self.events.publish(LifecycleEvent::TaskFailed {
                    task_id: task_id.clone(),
                    code: code.to_string(),
                });
                tracing::warn!("Task {} failed [{}]: {}", task_id, code, e);
                self.contexts.schedule_cleanup(&task_id, grace);
                Err(TaskFailure::from_error(&task_id, &e))
            }
        }
    }

    /// 原子地检查并占用一个任务槽位；被拒绝时不创建任何上下文
    fn admit(&self, task_id: &str) -> Result<(), OrchestratorError> {
        if self.supervisor.is_shutdown() {
            return Err(OrchestratorError::execution("orchestrator is shutting down"));
        }
        let limit = self.config.orchestrator.max_concurrent_tasks;
        let mut active = self.active.lock();
        if active.len() >= limit {
            let active_count = active.len();
            drop(active);
            self.counters.lock().rejected += 1;
            self.events.publish(LifecycleEvent::TaskRejected {
                task_id: task_id.to_string(),
                reason: "capacity exceeded".to_string(),
            });
            tracing::warn!(
                "Task {} rejected: {} of {} task slots in use",
                task_id,
                active_count,
                limit
            );
            return Err(OrchestratorError::CapacityExceeded {
                active: active_count,
                limit,
            });
        }
        if active.contains_key(task_id) {
            return Err(OrchestratorError::Validation(format!(
                "task {} is already in progress",
                task_id
            )));
        }
        active.insert(
            task_id.to_string(),
            ActiveTask {
                phase: TaskPhase::Received,
                started_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn run_pipeline(
        &self,
        task_id: &str,
        request: TaskRequest,
        token: &CancellationToken,
        workflow_id: &mut Option<String>,
    ) -> Result<Value, OrchestratorError> {
        self.set_phase(task_id, TaskPhase::Preprocessing);
        let phase_started = Instant::now();
        let task = request.normalize(task_id.to_string())?;
        self.contexts.add_step(
            task_id,
            StepRecord::new("preprocessing")
                .with_duration(phase_started.elapsed().as_millis() as u64)
                .with_detail(json!({ "type": task.task_type })),
        );
        ensure_active(token)?;

        self.set_phase(task_id, TaskPhase::WorkflowSelecting);
        let phase_started = Instant::now();
        let snapshot = self
            .contexts
            .get(task_id)
            .ok_or_else(|| OrchestratorError::not_found("execution context", task_id))?;
        let workflow = self.selector.select_workflow(&task, &snapshot).await?;
        *workflow_id = Some(workflow.id.clone());
        self.contexts.add_step(
            task_id,
            StepRecord::new("workflow_selection")
                .with_duration(phase_started.elapsed().as_millis() as u64)
                .with_detail(json!({ "workflow": workflow.id })),
        );
        ensure_active(token)?;

        self.set_phase(task_id, TaskPhase::WorkflowExecuting);
        let ctx = WorkflowContext {
            task_id: task_id.to_string(),
            registry: Arc::clone(&self.registry),
            contexts: Arc::clone(&self.contexts),
            state: Arc::clone(&self.state),
            cancel: token.clone(),
        };
        let timeout = self.config.orchestrator.task_timeout();
        let exec_started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(OrchestratorError::Cancelled),
            r = tokio::time::timeout(timeout, self.executor.execute(&workflow, &task, &ctx)) => match r {
                Ok(r) => r,
                Err(_) => {
                    token.cancel();
                    Err(OrchestratorError::Timeout(timeout.as_millis() as u64))
                }
            },
        };
        self.contexts.add_workflow_run(
            task_id,
            WorkflowRunRecord::new(&workflow.id, outcome.is_ok(), exec_started.elapsed().as_millis() as u64),
        );
        let result = outcome?;
        ensure_active(token)?;

        self.set_phase(task_id, TaskPhase::Postprocessing);
        self.contexts.add_step(task_id, StepRecord::new("postprocessing"));
        Ok(result)
    }

    fn set_phase(&self, task_id: &str, phase: TaskPhase) {
        if let Some(task) = self.active.lock().get_mut(task_id) {
            task.phase = phase;
        }
        tracing::debug!("Task {} entered phase {:?}", task_id, phase);
        self.events.publish(LifecycleEvent::TaskPhaseChanged {
            task_id: task_id.to_string(),
            phase,
        });
    }

    /// 请求取消；返回任务是否在途
    ///
    /// 已发出的服务调用不会被强行打断，其结果会被丢弃。
    pub fn cancel_task(&self, task_id: &str) -> bool {
        if !self.supervisor.cancel(task_id) {
            return false;
        }
        self.contexts.mark_cancelled(task_id);
        self.contexts
            .schedule_cleanup(task_id, self.config.orchestrator.cleanup_grace());
        tracing::info!("Cancellation requested for task {}", task_id);
        true
    }

    /// 按开始时间排序
    pub fn get_active_tasks(&self) -> Vec<ActiveTaskInfo> {
        let now = Utc::now();
        let mut tasks: Vec<ActiveTaskInfo> = self
            .active
            .lock()
            .iter()
            .map(|(id, t)| ActiveTaskInfo {
                task_id: id.clone(),
                phase: t.phase,
                started_at: t.started_at,
                elapsed_ms: (now - t.started_at).num_milliseconds().max(0) as u64,
            })
            .collect();
        tasks.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.task_id.cmp(&b.task_id)));
        tasks
    }

    pub async fn get_status(&self) -> OrchestratorStatus {
        let active = self.active.lock().len();
        let (tasks, performance) = {
            let c = self.counters.lock();
            let total_processed = c.completed + c.failed + c.cancelled;
            let success_rate = if total_processed == 0 {
                1.0
            } else {
                c.completed as f64 / total_processed as f64
            };
            let average_duration_ms = if c.completed == 0 {
                0.0
            } else {
                c.completed_duration_ms as f64 / c.completed as f64
            };
            (
                TaskStats {
                    active,
                    completed: c.completed,
                    failed: c.failed,
                    cancelled: c.cancelled,
                    rejected: c.rejected,
                },
                PerformanceStats {
                    total_processed,
                    success_rate,
                    average_duration_ms,
                },
            )
        };

        OrchestratorStatus {
            services: self.registry.health_status().await,
            tasks,
            performance,
            plugins: self.plugins.list_loaded().await,
            state: self.state.stats(),
            contexts: self.contexts.active_count(),
        }
    }
}

fn ensure_active(token: &CancellationToken) -> Result<(), OrchestratorError> {
    if token.is_cancelled() {
        Err(OrchestratorError::Cancelled)
    } else {
        Ok(())
    }
}
