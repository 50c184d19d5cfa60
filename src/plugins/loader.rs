//! 插件加载器：批量加载、卸载、重载、热重载
//!
//! 单个插件失败只影响它自己和依赖它的插件；依赖环会中止整个批次（一个都不加载）。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::descriptor::{PluginDescriptor, PluginType};
use super::discovery::{self, read_plugin_dir};
use super::graph::resolve_load_order;
use super::watcher::ChangeNotifier;
use super::{Adapter, PluginError, PluginFactory, PluginInstance};
use crate::core::events::{EventBus, LifecycleEvent};
use crate::registry::{Service, ServiceRegistry};
use crate::workflow::{WorkflowCatalog, WorkflowDefinition};

/// 一次批量加载的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// (插件 id, 失败原因)
    pub failed: Vec<(String, String)>,
    /// (插件 id, 阻塞它的依赖 id)
    pub skipped: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadedPluginInfo {
    pub id: String,
    pub plugin_type: PluginType,
    pub version: Option<String>,
    pub loaded_at: DateTime<Utc>,
}

/// 已加载插件在下游注册的位置
enum LoadedHandle {
    Service(Arc<dyn Service>),
    Workflow(String),
    Adapter(Arc<dyn Adapter>),
}

struct LoadedPlugin {
    descriptor: PluginDescriptor,
    handle: LoadedHandle,
    loaded_at: DateTime<Utc>,
}

#[derive(Default)]
struct LoaderState {
    loaded: HashMap<String, LoadedPlugin>,
    /// 加载顺序（shutdown 时逆序卸载）
    order: Vec<String>,
    /// 最近一次发现 / 加载时的描述符
    known: BTreeMap<String, PluginDescriptor>,
}

/// 插件加载器
pub struct PluginLoader {
    registry: Arc<ServiceRegistry>,
    catalog: Arc<dyn WorkflowCatalog>,
    events: EventBus,
    factories: parking_lot::RwLock<HashMap<String, Arc<dyn PluginFactory>>>,
    state: RwLock<LoaderState>,
    directories: Vec<String>,
}

impl PluginLoader {
    pub fn new(registry: Arc<ServiceRegistry>, catalog: Arc<dyn WorkflowCatalog>, events: EventBus) -> Self {
        Self {
            registry,
            catalog,
            events,
            factories: parking_lot::RwLock::new(HashMap::new()),
            state: RwLock::new(LoaderState::default()),
            directories: Vec::new(),
        }
    }

    pub fn with_directories(mut self, directories: Vec<String>) -> Self {
        self.directories = directories;
        self
    }

    pub fn directories(&self) -> &[String] {
        &self.directories
    }

    /// 注册工厂；描述符的 `main`（或 id）按此名称查找
    pub fn register_factory(&self, name: impl Into<String>, factory: Arc<dyn PluginFactory>) {
        let name = name.into();
        tracing::debug!("Plugin factory registered: {}", name);
        self.factories.write().insert(name, factory);
    }

    /// 在配置的位置发现插件
    pub async fn discover(&self) -> BTreeMap<String, PluginDescriptor> {
        self.discover_in(&self.directories).await
    }

    pub async fn discover_in(&self, directories: &[String]) -> BTreeMap<String, PluginDescriptor> {
        let dirs = directories.to_vec();
        let found = match tokio::task::spawn_blocking(move || discovery::discover(&dirs)).await {
            Ok(found) => found,
            Err(e) => {
                tracing::error!("Plugin discovery task failed: {}", e);
                BTreeMap::new()
            }
        };
        let mut state = self.state.write().await;
        for (id, d) in &found {
            state.known.insert(id.clone(), d.clone());
        }
        found
    }

    /// 发现并加载
    pub async fn discover_and_load(&self) -> Result<LoadReport, PluginError> {
        let descriptors = self.discover().await;
        self.load_all(&descriptors).await
    }

    /// 按依赖顺序加载一批插件
    pub async fn load_all(&self, descriptors: &BTreeMap<String, PluginDescriptor>) -> Result<LoadReport, PluginError> {
        let order = resolve_load_order(descriptors).map_err(|e| {
            tracing::error!("Plugin load pass aborted, nothing loaded: {}", e);
            e
        })?;

        {
            let mut state = self.state.write().await;
            for (id, d) in descriptors {
                state.known.insert(id.clone(), d.clone());
            }
        }

        let mut report = LoadReport::default();
        let mut unavailable: HashSet<String> = HashSet::new();

        for id in order {
            let Some(descriptor) = descriptors.get(&id) else {
                continue;
            };

            if let Some(blocker) = descriptor.dependencies.iter().find(|d| unavailable.contains(*d)) {
                tracing::warn!("Skipping plugin {}: dependency {} is unavailable", id, blocker);
                self.events.publish(LifecycleEvent::PluginSkipped {
                    plugin_id: id.clone(),
                    blocked_by: blocker.clone(),
                });
                report.skipped.push((id.clone(), blocker.clone()));
                unavailable.insert(id);
                continue;
            }

            if self.is_loaded(&id).await {
                report.loaded.push(id);
                continue;
            }

            match self.load(descriptor).await {
                Ok(()) => report.loaded.push(id),
                Err(e) => {
                    tracing::warn!("Plugin {} failed to load: {}", id, e);
                    self.events.publish(LifecycleEvent::PluginFailed {
                        plugin_id: id.clone(),
                        reason: e.to_string(),
                    });
                    report.failed.push((id.clone(), e.to_string()));
                    unavailable.insert(id);
                }
            }
        }

        tracing::info!(
            "Plugin load pass finished: {} loaded, {} failed, {} skipped",
            report.loaded.len(),
            report.failed.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    /// 加载单个插件
    pub async fn load(&self, descriptor: &PluginDescriptor) -> Result<(), PluginError> {
        descriptor.validate()?;
        let id = descriptor.id.as_str();
        if self.is_loaded(id).await {
            return Err(PluginError::AlreadyLoaded(id.to_string()));
        }

        let instance = self.instantiate(descriptor)?;
        if instance.plugin_type() != descriptor.plugin_type {
            return Err(PluginError::InvalidDescriptor(format!(
                "plugin {} is declared as {} but its factory produced a {}",
                id,
                descriptor.plugin_type,
                instance.plugin_type()
            )));
        }

        let handle = match instance {
            PluginInstance::Service(service) => {
                self.registry
                    .register(Arc::clone(&service))
                    .await
                    .map_err(|e| PluginError::InitializationFailed(format!("{}: {}", id, e)))?;
                for tag in &descriptor.capabilities {
                    if let Err(e) = self.registry.add_capability(service.id(), tag).await {
                        tracing::warn!("Could not add capability {} to {}: {}", tag, service.id(), e);
                    }
                }
                LoadedHandle::Service(service)
            }
            PluginInstance::Workflow(definition) => {
                let workflow_id = definition.id.clone();
                self.catalog
                    .register(definition)
                    .map_err(|e| PluginError::InitializationFailed(format!("{}: {}", id, e)))?;
                LoadedHandle::Workflow(workflow_id)
            }
            PluginInstance::Adapter(adapter) => {
                adapter
                    .initialize()
                    .await
                    .map_err(|e| PluginError::InitializationFailed(format!("{}: {:#}", id, e)))?;
                LoadedHandle::Adapter(adapter)
            }
        };

        {
            let mut state = self.state.write().await;
            if state.loaded.contains_key(id) {
                drop(state);
                release(&self.registry, self.catalog.as_ref(), id, &handle).await;
                return Err(PluginError::AlreadyLoaded(id.to_string()));
            }
            state.loaded.insert(
                id.to_string(),
                LoadedPlugin {
                    descriptor: descriptor.clone(),
                    handle,
                    loaded_at: Utc::now(),
                },
            );
            state.order.push(id.to_string());
            state.known.insert(id.to_string(), descriptor.clone());
        }

        tracing::info!("Plugin loaded: {} ({})", id, descriptor.plugin_type);
        self.events.publish(LifecycleEvent::PluginLoaded {
            plugin_id: id.to_string(),
            plugin_type: descriptor.plugin_type.to_string(),
        });
        Ok(())
    }

    /// 卸载：先调用 shutdown 钩子，再从下游注册处移除
    pub async fn unload(&self, id: &str) -> Result<(), PluginError> {
        let plugin = {
            let mut state = self.state.write().await;
            let plugin = state
                .loaded
                .remove(id)
                .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
            state.order.retain(|x| x != id);
            plugin
        };

        release(&self.registry, self.catalog.as_ref(), id, &plugin.handle).await;
        tracing::info!("Plugin unloaded: {}", id);
        self.events.publish(LifecycleEvent::PluginUnloaded {
            plugin_id: id.to_string(),
        });
        Ok(())
    }

    /// 重新读取描述符后卸载再加载
    pub async fn reload(&self, id: &str) -> Result<(), PluginError> {
        let previous = {
            let state = self.state.read().await;
            state
                .known
                .get(id)
                .cloned()
                .or_else(|| state.loaded.get(id).map(|p| p.descriptor.clone()))
        };
        let previous = previous.ok_or_else(|| PluginError::NotFound(id.to_string()))?;

        let descriptor = match previous.dir.as_deref() {
            Some(dir) => match read_plugin_dir(dir)? {
                Some(d) if d.id == id => d,
                Some(d) => {
                    return Err(PluginError::InvalidDescriptor(format!(
                        "plugin in {} changed id from {} to {}",
                        dir.display(),
                        id,
                        d.id
                    )))
                }
                None => return Err(PluginError::NotFound(id.to_string())),
            },
            None => previous,
        };

        if self.is_loaded(id).await {
            self.unload(id).await?;
        }
        self.load(&descriptor).await?;

        tracing::info!("Plugin reloaded: {}", id);
        self.events.publish(LifecycleEvent::PluginReloaded {
            plugin_id: id.to_string(),
        });
        Ok(())
    }

    pub async fn is_loaded(&self, id: &str) -> bool {
        self.state.read().await.loaded.contains_key(id)
    }

    /// 按加载顺序列出
    pub async fn list_loaded(&self) -> Vec<LoadedPluginInfo> {
        let state = self.state.read().await;
        state
            .order
            .iter()
            .filter_map(|id| state.loaded.get(id))
            .map(|p| LoadedPluginInfo {
                id: p.descriptor.id.clone(),
                plugin_type: p.descriptor.plugin_type,
                version: p.descriptor.version.clone(),
                loaded_at: p.loaded_at,
            })
            .collect()
    }

    /// 逆序卸载全部插件
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.state.read().await.order.iter().rev().cloned().collect();
        for id in ids {
            if let Err(e) = self.unload(&id).await {
                tracing::warn!("Failed to unload plugin {} during shutdown: {}", id, e);
            }
        }
    }

    /// 处理一批发生变化的插件目录
    pub async fn handle_changes(&self, dirs: Vec<PathBuf>) {
        for dir in dirs {
            let owner = {
                let state = self.state.read().await;
                state
                    .known
                    .values()
                    .find(|d| d.dir.as_deref() == Some(dir.as_path()))
                    .map(|d| d.id.clone())
            };

            match owner {
                Some(id) if !dir.exists() => {
                    if self.is_loaded(&id).await {
                        if let Err(e) = self.unload(&id).await {
                            tracing::warn!("Failed to unload removed plugin {}: {}", id, e);
                        }
                    }
                    self.state.write().await.known.remove(&id);
                }
                Some(id) => {
                    if let Err(e) = self.reload(&id).await {
                        tracing::warn!("Hot reload of plugin {} failed: {}", id, e);
                        self.events.publish(LifecycleEvent::PluginFailed {
                            plugin_id: id,
                            reason: e.to_string(),
                        });
                    }
                }
                None if dir.exists() => self.load_new_dir(&dir).await,
                None => {}
            }
        }
    }

    async fn load_new_dir(&self, dir: &Path) {
        match read_plugin_dir(dir) {
            Ok(Some(descriptor)) => {
                let id = descriptor.id.clone();
                if let Err(e) = self.load(&descriptor).await {
                    tracing::warn!("New plugin {} failed to load: {}", id, e);
                    self.events.publish(LifecycleEvent::PluginFailed {
                        plugin_id: id.clone(),
                        reason: e.to_string(),
                    });
                }
                self.state.write().await.known.insert(id, descriptor);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Ignoring new plugin directory {}: {}", dir.display(), e),
        }
    }

    /// 启动热重载循环（仅开发模式使用）
    pub fn spawn_hot_reload(
        self: &Arc<Self>,
        mut notifier: Box<dyn ChangeNotifier>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let loader = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!("Plugin hot reload enabled");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = notifier.changed() => {
                        if !changed.is_empty() {
                            tracing::debug!("Plugin directories changed: {:?}", changed);
                            loader.handle_changes(changed).await;
                        }
                    }
                }
            }
            tracing::debug!("Plugin hot reload stopped");
        })
    }

    fn instantiate(&self, descriptor: &PluginDescriptor) -> Result<PluginInstance, PluginError> {
        let factory = {
            let factories = self.factories.read();
            descriptor
                .factory_keys()
                .into_iter()
                .find_map(|key| factories.get(key).cloned())
        };
        if let Some(factory) = factory {
            return factory.create(descriptor);
        }

        if descriptor.plugin_type == PluginType::Workflow {
            if let Some(path) = workflow_file(descriptor) {
                return WorkflowDefinition::from_file(&path)
                    .map(PluginInstance::Workflow)
                    .map_err(|e| PluginError::InitializationFailed(format!("{}: {}", descriptor.id, e)));
            }
        }
        Err(PluginError::FactoryMissing(descriptor.id.clone()))
    }
}

/// workflow 插件的定义文件：main 指向的文件，否则 workflow.toml / workflow.json
fn workflow_file(descriptor: &PluginDescriptor) -> Option<PathBuf> {
    let dir = descriptor.dir.as_deref()?;
    let candidates = descriptor
        .main
        .iter()
        .map(|m| dir.join(m))
        .chain(["workflow.toml", "workflow.json"].iter().map(|f| dir.join(f)));
    candidates.into_iter().find(|p| p.is_file())
}

async fn release(registry: &ServiceRegistry, catalog: &dyn WorkflowCatalog, id: &str, handle: &LoadedHandle) {
    match handle {
        LoadedHandle::Service(service) => {
            if let Err(e) = service.shutdown().await {
                tracing::warn!("Shutdown hook of plugin {} failed: {:#}", id, e);
            }
            registry.unregister(service.id()).await;
        }
        LoadedHandle::Workflow(workflow_id) => {
            catalog.unregister(workflow_id);
        }
        LoadedHandle::Adapter(adapter) => {
            if let Err(e) = adapter.shutdown().await {
                tracing::warn!("Shutdown hook of plugin {} failed: {:#}", id, e);
            }
        }
    }
}
