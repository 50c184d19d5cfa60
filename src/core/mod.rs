//! 核心编排层：错误分类、事件总线、任务类型、取消监管、编排器与构建器

pub mod builder;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod supervisor;
pub mod task;

pub use builder::OrchestratorBuilder;
pub use error::{ErrorCode, OrchestratorError, TaskFailure};
pub use events::{EventBus, EventEnvelope, LifecycleEvent};
pub use orchestrator::{OrchestratorStatus, PerformanceStats, TaskOrchestrator, TaskStats};
pub use supervisor::TaskSupervisor;
pub use task::{ActiveTaskInfo, Task, TaskOutcome, TaskPhase, TaskRequest, TaskStatus};
