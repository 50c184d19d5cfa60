//! 编排器构建器：统一的组件装配逻辑
//!
//! 所有组件显式构造并以 Arc 注入，不使用全局单例；未指定的协作方使用默认实现。

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::context::ExecutionContextTracker;
use crate::core::error::OrchestratorError;
use crate::core::events::EventBus;
use crate::core::orchestrator::TaskOrchestrator;
use crate::plugins::{PluginFactory, PluginLoader};
use crate::registry::{Service, ServiceRegistry};
use crate::state::{DurableStorage, StateStore};
use crate::workflow::{
    CatalogWorkflowSelector, InMemoryWorkflowCatalog, ServiceChainExecutor, WorkflowCatalog, WorkflowDefinition,
    WorkflowExecutor, WorkflowSelector,
};

/// 编排器构建器
pub struct OrchestratorBuilder {
    config: AppConfig,
    events: Option<EventBus>,
    storage: Option<Arc<dyn DurableStorage>>,
    catalog: Option<Arc<dyn WorkflowCatalog>>,
    selector: Option<Arc<dyn WorkflowSelector>>,
    executor: Option<Arc<dyn WorkflowExecutor>>,
    services: Vec<Arc<dyn Service>>,
    workflows: Vec<WorkflowDefinition>,
    factories: Vec<(String, Arc<dyn PluginFactory>)>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            events: None,
            storage: None,
            catalog: None,
            selector: None,
            executor: None,
            services: Vec::new(),
            workflows: Vec::new(),
            factories: Vec::new(),
        }
    }

    /// 从默认路径加载配置；加载失败时使用默认值
    pub fn from_config_path(config_path: Option<PathBuf>) -> Self {
        let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
            tracing::warn!("Config load failed ({}), using defaults", e);
            AppConfig::default()
        });
        Self::new(config)
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// 指定持久化后端（优先于配置里的文件存储）
    pub fn with_storage(mut self, storage: Arc<dyn DurableStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn WorkflowCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_selector(mut self, selector: Arc<dyn WorkflowSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn WorkflowExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// 构建时直接注册的服务（不经插件）
    pub fn with_service(mut self, service: Arc<dyn Service>) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_workflow(mut self, workflow: WorkflowDefinition) -> Self {
        self.workflows.push(workflow);
        self
    }

    /// 插件工厂，按描述符的 `main` 或 id 匹配
    pub fn with_factory(mut self, name: impl Into<String>, factory: Arc<dyn PluginFactory>) -> Self {
        self.factories.push((name.into(), factory));
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 装配全部组件；插件在 `TaskOrchestrator::init` 时才加载
    pub async fn build(self) -> Result<Arc<TaskOrchestrator>, OrchestratorError> {
        let config = self.config;
        let events = self.events.unwrap_or_default();

        let registry = Arc::new(ServiceRegistry::new(&config.registry, events.clone()));

        let mut state = StateStore::from_config(&config.state).with_events(events.clone());
        if let Some(storage) = self.storage {
            state = state.with_storage(storage);
        }
        let state = Arc::new(state);

        let contexts = Arc::new(ExecutionContextTracker::from_config(&config.context));

        let catalog: Arc<dyn WorkflowCatalog> = match self.catalog {
            Some(catalog) => catalog,
            None => Arc::new(InMemoryWorkflowCatalog::new()),
        };
        for workflow in self.workflows {
            catalog.register(workflow)?;
        }

        let selector: Arc<dyn WorkflowSelector> = match self.selector {
            Some(selector) => selector,
            None => Arc::new(CatalogWorkflowSelector::new(Arc::clone(&catalog))),
        };
        let executor: Arc<dyn WorkflowExecutor> = match self.executor {
            Some(executor) => executor,
            None => Arc::new(ServiceChainExecutor::new()),
        };

        let plugins = PluginLoader::new(Arc::clone(&registry), Arc::clone(&catalog), events.clone())
            .with_directories(config.plugins.directories.clone());
        for (name, factory) in self.factories {
            plugins.register_factory(name, factory);
        }

        for service in self.services {
            registry.register(service).await?;
        }

        tracing::debug!(
            "Orchestrator assembled: max {} concurrent tasks, timeout {}s",
            config.orchestrator.max_concurrent_tasks,
            config.orchestrator.task_timeout_secs
        );

        Ok(Arc::new(TaskOrchestrator::new(
            config,
            events,
            registry,
            Arc::new(plugins),
            state,
            contexts,
            catalog,
            selector,
            executor,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::StubService;
    use crate::state::MemoryStorage;
    use crate::workflow::WorkflowStep;

    #[tokio::test]
    async fn test_build_registers_services_and_workflows() {
        let orch = OrchestratorBuilder::new(AppConfig::default())
            .with_service(StubService::new("a", &["research"]))
            .with_workflow(
                WorkflowDefinition::new("deep", "Deep research")
                    .for_task_type("research")
                    .with_step(WorkflowStep::new("gather", vec!["research".into()])),
            )
            .build()
            .await
            .unwrap();

        assert!(orch.registry().get("a").await.is_ok());
        assert!(orch.catalog().get("deep").is_some());
        assert!(!orch.state().persistence_enabled());
    }

    #[tokio::test]
    async fn test_invalid_workflow_fails_build() {
        let result = OrchestratorBuilder::new(AppConfig::default())
            .with_workflow(WorkflowDefinition::new("empty", "No steps"))
            .build()
            .await;
        assert!(matches!(result, Err(OrchestratorError::Validation(_))));
    }

    #[tokio::test]
    async fn test_with_storage_enables_persistence() {
        let orch = OrchestratorBuilder::new(AppConfig::default())
            .with_storage(Arc::new(MemoryStorage::new()))
            .build()
            .await
            .unwrap();
        assert!(orch.state().persistence_enabled());
    }
}
