//! 插件描述符
//!
//! 来源：插件目录下的 `plugin.toml`（`[plugin]` 表）或 `plugin.json`；
//! 没有描述文件时由 discovery 按目录内容推断。

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::PluginError;

/// 插件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    /// 构造服务并注册到服务注册表
    Service,
    /// 向工作流目录发布定义
    Workflow,
    /// 运行自身的初始化钩子
    Adapter,
}

impl PluginType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::Workflow => "workflow",
            Self::Adapter => "adapter",
        }
    }
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 插件描述符
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// 入口：工厂名，或 workflow 插件的定义文件名
    #[serde(default)]
    pub main: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// 插件所在目录（discovery 填写）
    #[serde(skip)]
    pub dir: Option<PathBuf>,
    /// 是否由目录内容推断而来
    #[serde(skip)]
    pub inferred: bool,
}

/// plugin.toml 的外层结构
#[derive(Debug, Deserialize)]
struct PluginToml {
    plugin: PluginDescriptor,
}

impl PluginDescriptor {
    pub fn new(id: impl Into<String>, plugin_type: PluginType) -> Self {
        Self {
            id: id.into(),
            name: None,
            version: None,
            plugin_type,
            dependencies: Vec::new(),
            main: None,
            capabilities: Vec::new(),
            description: None,
            dir: None,
            inferred: false,
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_main(mut self, main: impl Into<String>) -> Self {
        self.main = Some(main.into());
        self
    }

    pub fn with_capabilities(mut self, caps: Vec<String>) -> Self {
        self.capabilities = caps;
        self
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// 工厂查找键：优先 main，其次 id
    pub fn factory_keys(&self) -> Vec<&str> {
        let mut keys = Vec::with_capacity(2);
        if let Some(main) = self.main.as_deref() {
            keys.push(main);
        }
        keys.push(self.id.as_str());
        keys
    }

    pub fn validate(&self) -> Result<(), PluginError> {
        if self.id.trim().is_empty() {
            return Err(PluginError::InvalidDescriptor("plugin id must not be empty".into()));
        }
        if self.id.chars().any(char::is_whitespace) {
            return Err(PluginError::InvalidDescriptor(format!(
                "plugin id must not contain whitespace: {:?}",
                self.id
            )));
        }
        if self.dependencies.iter().any(|d| d.trim().is_empty()) {
            return Err(PluginError::InvalidDescriptor(format!(
                "plugin {} declares an empty dependency id",
                self.id
            )));
        }
        Ok(())
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, PluginError> {
        let parsed: PluginToml = toml::from_str(raw).map_err(|e| PluginError::InvalidDescriptor(e.to_string()))?;
        parsed.plugin.validate()?;
        Ok(parsed.plugin)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, PluginError> {
        let parsed: Self = serde_json::from_str(raw).map_err(|e| PluginError::InvalidDescriptor(e.to_string()))?;
        parsed.validate()?;
        Ok(parsed)
    }
}
