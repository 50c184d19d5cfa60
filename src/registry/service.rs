//! 能力提供者契约与注册表内的服务记录

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// 能力提供者（外部实现）：初始化、执行、健康检查、能力声明、可选关闭
#[async_trait]
pub trait Service: Send + Sync {
    /// 全局唯一 ID
    fn id(&self) -> &str;

    /// 展示名，默认同 ID
    fn name(&self) -> &str {
        self.id()
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute(&self, input: Value, ctx: &ServiceCallContext) -> anyhow::Result<Value>;

    async fn health_check(&self) -> bool;

    /// 声明的能力标签；为空时注册表按名称推断
    fn capabilities(&self) -> Vec<String>;

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 单次服务调用的上下文
#[derive(Debug, Clone)]
pub struct ServiceCallContext {
    pub task_id: Option<String>,
    pub operation: String,
    pub cancel: CancellationToken,
}

impl ServiceCallContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            task_id: None,
            operation: operation.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn for_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// 健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

/// 滚动性能指标（仅由真实调用结果更新，与健康探针无关）
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceMetrics {
    pub request_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// 增量均值
    pub avg_latency_ms: f64,
    pub last_request_at: Option<DateTime<Utc>>,
}

impl ServiceMetrics {
    pub fn record(&mut self, success: bool, latency_ms: f64) {
        self.request_count += 1;
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        self.avg_latency_ms += (latency_ms - self.avg_latency_ms) / self.request_count as f64;
        self.last_request_at = Some(Utc::now());
    }

    pub fn success_rate(&self) -> f64 {
        if self.request_count == 0 {
            1.0
        } else {
            self.success_count as f64 / self.request_count as f64
        }
    }
}

/// 对外的服务快照（health_status / get_status）
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub id: String,
    pub name: String,
    pub capabilities: Vec<String>,
    pub health: HealthStatus,
    pub metrics: ServiceMetrics,
    pub load: f64,
    pub registered_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incremental_mean() {
        let mut m = ServiceMetrics::default();
        m.record(true, 100.0);
        m.record(false, 300.0);
        m.record(true, 200.0);
        assert_eq!(m.request_count, 3);
        assert_eq!(m.success_count, 2);
        assert_eq!(m.failure_count, 1);
        assert!((m.avg_latency_ms - 200.0).abs() < 1e-9);
        assert!((m.success_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_metrics_success_rate() {
        assert_eq!(ServiceMetrics::default().success_rate(), 1.0);
    }
}
