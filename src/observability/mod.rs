//! 可观测性：tracing 订阅器初始化
//!
//! 默认 info 级别，可通过 RUST_LOG 覆盖；嵌入方若已有订阅器则不要调用。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// 人类可读格式
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(default_filter())
        .with(fmt::layer())
        .try_init();
}

/// JSON 行格式（便于日志采集）
pub fn init_json() {
    let _ = tracing_subscriber::registry()
        .with(default_filter())
        .with(fmt::layer().json())
        .try_init();
}
