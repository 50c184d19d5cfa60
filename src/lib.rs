//! Hive - Rust 编排核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、事件总线、任务编排器与构建器
//! - **registry**: 服务注册表（能力匹配、负载评分、健康检查）
//! - **plugins**: 插件发现、依赖排序、加载 / 卸载 / 热重载
//! - **state**: 全局 / 会话 / 任务三级状态与变更订阅
//! - **context**: 每任务执行上下文与分析指标
//! - **workflow**: 工作流选择器 / 执行器 / 目录的契约与默认实现
//! - **observability**: tracing 初始化

pub mod config;
pub mod context;
pub mod core;
pub mod observability;
pub mod plugins;
pub mod registry;
pub mod state;
pub mod workflow;

pub use crate::core::{OrchestratorBuilder, OrchestratorError, TaskFailure, TaskOrchestrator};
