//! 事件总线：进程内生命周期事件广播
//!
//! 所有组件通过同一个 EventBus 宣告服务注册 / 失败 / 恢复、插件加载 / 卸载、任务状态迁移、状态变更。
//! 无持久化，无订阅者时发布直接丢弃。

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::task::TaskPhase;

/// 生命周期事件（可序列化为 JSON 供监控端消费）
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    ServiceRegistered { service_id: String, capabilities: Vec<String> },
    ServiceUnregistered { service_id: String },
    /// 健康探针失败或超时
    ServiceFailed { service_id: String, reason: String },
    ServiceRecovered { service_id: String },

    PluginLoaded { plugin_id: String, plugin_type: String },
    PluginFailed { plugin_id: String, reason: String },
    /// 因依赖加载失败而跳过
    PluginSkipped { plugin_id: String, blocked_by: String },
    PluginUnloaded { plugin_id: String },
    PluginReloaded { plugin_id: String },

    TaskReceived { task_id: String },
    TaskRejected { task_id: String, reason: String },
    TaskPhaseChanged { task_id: String, phase: TaskPhase },
    TaskCompleted { task_id: String, duration_ms: u64 },
    TaskFailed { task_id: String, code: String },
    TaskCancelled { task_id: String },

    StateChanged { scope: String, key: String },
    ScopeEvicted { scope: String },
}

/// 带时间戳的事件
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: LifecycleEvent,
}

/// 事件总线（Clone 后共享同一通道）
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// 发布事件；没有订阅者不算错误
    pub fn publish(&self, event: LifecycleEvent) {
        tracing::debug!(?event, "lifecycle event");
        let _ = self.sender.send(EventEnvelope {
            at: Utc::now(),
            event,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::default();
        bus.publish(LifecycleEvent::ServiceRecovered {
            service_id: "a".into(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(LifecycleEvent::TaskReceived { task_id: "t".into() });
        bus.publish(LifecycleEvent::TaskCancelled { task_id: "t".into() });

        assert_eq!(
            rx.recv().await.unwrap().event,
            LifecycleEvent::TaskReceived { task_id: "t".into() }
        );
        assert_eq!(
            rx.recv().await.unwrap().event,
            LifecycleEvent::TaskCancelled { task_id: "t".into() }
        );
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let envelope = EventEnvelope {
            at: Utc::now(),
            event: LifecycleEvent::PluginSkipped {
                plugin_id: "b".into(),
                blocked_by: "a".into(),
            },
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "plugin_skipped");
        assert_eq!(json["blocked_by"], "a");
        assert!(json.get("at").is_some());
    }
}
