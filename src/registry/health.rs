//! 健康监控：单服务探活、全量并发探活、周期性后台巡检
//!
//! 探针超时、panic 或返回 false 都视为失败：标记 unhealthy 并发 ServiceFailed，但不注销；
//! 下一次探活成功即自动恢复（ServiceRecovered）。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::{HealthStatus, ServiceRegistry};
use crate::core::error::OrchestratorError;
use crate::core::events::LifecycleEvent;

impl ServiceRegistry {
    /// 探活单个服务，返回探活后的健康状态
    pub async fn check_health(&self, id: &str) -> Result<HealthStatus, OrchestratorError> {
        let service = self.get(id).await?;

        let check = AssertUnwindSafe(service.health_check()).catch_unwind();
        let probe = match timeout(self.health_timeout, check).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err("health check reported unhealthy".to_string()),
            Ok(Err(panic)) => Err(format!("health check panicked: {}", super::panic_message(&*panic))),
            Err(_) => Err(format!(
                "health check timed out after {}ms",
                self.health_timeout.as_millis()
            )),
        };

        let (previous, current) = {
            let mut inner = self.inner.write().await;
            // 探活期间可能已被注销
            let Some(entry) = inner.services.get_mut(id) else {
                return Err(OrchestratorError::not_found("service", id));
            };
            let previous = entry.health;
            entry.last_checked_at = Some(Utc::now());
            match &probe {
                Ok(()) => {
                    entry.health = HealthStatus::Healthy;
                    entry.last_error = None;
                }
                Err(reason) => {
                    entry.health = HealthStatus::Unhealthy;
                    entry.last_error = Some(reason.clone());
                }
            }
            (previous, entry.health)
        };

        match (previous, current, probe) {
            (HealthStatus::Unhealthy, HealthStatus::Healthy, _) => {
                tracing::info!("Service {} recovered", id);
                self.events.publish(LifecycleEvent::ServiceRecovered {
                    service_id: id.to_string(),
                });
            }
            (prev, HealthStatus::Unhealthy, Err(reason)) if prev != HealthStatus::Unhealthy => {
                tracing::warn!("Service {} failed health check: {}", id, reason);
                self.events.publish(LifecycleEvent::ServiceFailed {
                    service_id: id.to_string(),
                    reason,
                });
            }
            _ => {}
        }

        Ok(current)
    }

    /// 并发探活所有服务，返回 (id, 状态)；探活期间被注销的服务不出现在结果里
    pub async fn check_all(&self) -> Vec<(String, HealthStatus)> {
        let ids: Vec<String> = self.inner.read().await.services.keys().cloned().collect();
        let results = join_all(ids.iter().map(|id| self.check_health(id))).await;
        ids.into_iter()
            .zip(results)
            .filter_map(|(id, r)| r.ok().map(|status| (id, status)))
            .collect()
    }

    /// 启动周期性健康巡检，token 取消后退出
    pub fn spawn_health_monitor(self: &Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval 首次 tick 立即返回；注册时已探活过，跳过
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("Health monitor stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let results = registry.check_all().await;
                        let unhealthy = results
                            .iter()
                            .filter(|(_, s)| *s == HealthStatus::Unhealthy)
                            .count();
                        tracing::debug!(
                            "Health sweep finished: {} services, {} unhealthy",
                            results.len(),
                            unhealthy
                        );
                    }
                }
            }
        })
    }
}
