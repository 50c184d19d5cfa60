//! 插件系统
//!
//! 发现描述符 → 依赖排序 → 按类型加载：
//! - service：工厂构造服务并注册到服务注册表
//! - workflow：把定义发布到工作流目录
//! - adapter：工厂构造适配器并运行其初始化钩子
//!
//! Rust 不能在运行时加载代码，所以描述符里的 `main` 指向一个预先注册的 [`PluginFactory`]。

mod descriptor;
pub mod discovery;
pub mod graph;
mod loader;
mod watcher;

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::error::OrchestratorError;
use crate::registry::Service;
use crate::workflow::WorkflowDefinition;

pub use descriptor::{PluginDescriptor, PluginType};
pub use discovery::discover;
pub use graph::resolve_load_order;
pub use loader::{LoadReport, LoadedPluginInfo, PluginLoader};
pub use watcher::{ChangeNotifier, PollingNotifier};

/// 适配器插件：只有生命周期钩子
#[async_trait]
pub trait Adapter: Send + Sync {
    fn id(&self) -> &str;

    async fn initialize(&self) -> anyhow::Result<()>;

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 工厂产出的插件实例
pub enum PluginInstance {
    Service(Arc<dyn Service>),
    Workflow(WorkflowDefinition),
    Adapter(Arc<dyn Adapter>),
}

impl PluginInstance {
    pub fn plugin_type(&self) -> PluginType {
        match self {
            Self::Service(_) => PluginType::Service,
            Self::Workflow(_) => PluginType::Workflow,
            Self::Adapter(_) => PluginType::Adapter,
        }
    }
}

/// 插件工厂：按描述符构造实例
pub trait PluginFactory: Send + Sync {
    fn create(&self, descriptor: &PluginDescriptor) -> Result<PluginInstance, PluginError>;
}

impl<F> PluginFactory for F
where
    F: Fn(&PluginDescriptor) -> Result<PluginInstance, PluginError> + Send + Sync,
{
    fn create(&self, descriptor: &PluginDescriptor) -> Result<PluginInstance, PluginError> {
        self(descriptor)
    }
}

/// 插件错误
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Invalid plugin descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Plugin initialization failed: {0}")]
    InitializationFailed(String),

    #[error("No factory registered for plugin {0}")]
    FactoryMissing(String),

    #[error("Plugin already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("Circular plugin dependency: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PluginError> for OrchestratorError {
    fn from(e: PluginError) -> Self {
        match e {
            PluginError::NotFound(id) => OrchestratorError::not_found("plugin", id),
            PluginError::CircularDependency(path) => OrchestratorError::CircularDependency(path),
            PluginError::InvalidDescriptor(msg) => OrchestratorError::Validation(msg),
            other => OrchestratorError::execution_with("plugin operation failed", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let e: OrchestratorError = PluginError::CircularDependency(vec!["a".into(), "b".into(), "a".into()]).into();
        assert!(matches!(e, OrchestratorError::CircularDependency(ref p) if p.len() == 3));
        let e: OrchestratorError = PluginError::NotFound("x".into()).into();
        assert!(matches!(e, OrchestratorError::NotFound { kind: "plugin", .. }));
        assert_eq!(
            PluginError::CircularDependency(vec!["a".into(), "b".into(), "a".into()]).to_string(),
            "Circular plugin dependency: a -> b -> a"
        );
    }
}
