//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__ORCHESTRATOR__MAX_CONCURRENT_TASKS=20`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub orchestrator: OrchestratorSection,
    pub registry: RegistrySection,
    pub plugins: PluginsSection,
    pub state: StateSection,
    pub context: ContextSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [orchestrator] 段：并发上限、单任务超时、结果保留宽限期
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// 任务结束后延迟清理上下文的秒数（便于调用方晚些取结果）
    #[serde(default = "default_cleanup_grace_secs")]
    pub cleanup_grace_secs: u64,
}

fn default_max_concurrent_tasks() -> usize {
    10
}

fn default_task_timeout_secs() -> u64 {
    300
}

fn default_cleanup_grace_secs() -> u64 {
    60
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            task_timeout_secs: default_task_timeout_secs(),
            cleanup_grace_secs: default_cleanup_grace_secs(),
        }
    }
}

impl OrchestratorSection {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_secs(self.cleanup_grace_secs)
    }
}

/// [registry] 段：健康检查周期与超时、调用超时、负载评分参数
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrySection {
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_health_check_timeout_secs")]
    pub health_check_timeout_secs: u64,
    #[serde(default = "default_invocation_timeout_secs")]
    pub invocation_timeout_secs: u64,
    /// 平均延迟达到该值时负载约为 63%
    #[serde(default = "default_latency_scale_ms")]
    pub latency_scale_ms: f64,
    /// 最近一次请求之后的延迟衰减窗口
    #[serde(default = "default_load_decay_secs")]
    pub load_decay_secs: f64,
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_health_check_timeout_secs() -> u64 {
    10
}

fn default_invocation_timeout_secs() -> u64 {
    30
}

fn default_latency_scale_ms() -> f64 {
    1000.0
}

fn default_load_decay_secs() -> f64 {
    60.0
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_check_interval_secs(),
            health_check_timeout_secs: default_health_check_timeout_secs(),
            invocation_timeout_secs: default_invocation_timeout_secs(),
            latency_scale_ms: default_latency_scale_ms(),
            load_decay_secs: default_load_decay_secs(),
        }
    }
}

impl RegistrySection {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

/// [plugins] 段：扫描目录（支持通配段）、开发模式热重载
#[derive(Debug, Clone, Deserialize)]
pub struct PluginsSection {
    #[serde(default = "default_plugin_directories")]
    pub directories: Vec<String>,
    #[serde(default)]
    pub hot_reload: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_plugin_directories() -> Vec<String> {
    vec!["plugins".into()]
}

fn default_poll_interval_secs() -> u64 {
    2
}

impl Default for PluginsSection {
    fn default() -> Self {
        Self {
            directories: default_plugin_directories(),
            hot_reload: false,
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl PluginsSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// [state] 段：会话 / 任务作用域最大存活时间、清理周期、可选持久化
#[derive(Debug, Clone, Deserialize)]
pub struct StateSection {
    #[serde(default = "default_session_max_age_secs")]
    pub session_max_age_secs: u64,
    #[serde(default = "default_task_max_age_secs")]
    pub task_max_age_secs: u64,
    #[serde(default = "default_state_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default)]
    pub persistence_enabled: bool,
    #[serde(default = "default_persistence_dir")]
    pub persistence_dir: PathBuf,
}

fn default_session_max_age_secs() -> u64 {
    24 * 3600
}

fn default_task_max_age_secs() -> u64 {
    3600
}

fn default_state_cleanup_interval_secs() -> u64 {
    300
}

fn default_persistence_dir() -> PathBuf {
    PathBuf::from("data/state")
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            session_max_age_secs: default_session_max_age_secs(),
            task_max_age_secs: default_task_max_age_secs(),
            cleanup_interval_secs: default_state_cleanup_interval_secs(),
            persistence_enabled: false,
            persistence_dir: default_persistence_dir(),
        }
    }
}

impl StateSection {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// [context] 段：执行上下文强制回收时间、清扫周期、导出截断长度
#[derive(Debug, Clone, Deserialize)]
pub struct ContextSection {
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_export_max_entries")]
    pub export_max_entries: usize,
}

fn default_max_lifetime_secs() -> u64 {
    30 * 60
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_export_max_entries() -> usize {
    100
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            max_lifetime_secs: default_max_lifetime_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            export_max_entries: default_export_max_entries(),
        }
    }
}

impl ContextSection {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
