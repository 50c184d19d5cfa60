//! 服务注册表
//!
//! 维护能力提供者目录：注册时校验并立即探活，按能力匹配 + 负载排序选择服务，
//! 记录每次真实调用结果（滚动平均延迟、成功 / 失败计数），周期性健康检查见 health.rs。

pub mod capability;
mod health;
pub mod selection;
pub mod service;

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::timeout;

use crate::config::RegistrySection;
use crate::core::error::OrchestratorError;
use crate::core::events::{EventBus, LifecycleEvent};

pub use capability::{infer_capabilities, infer_task_capabilities};
pub use selection::{Ranked, SelectionStrategy};
pub use service::{HealthStatus, Service, ServiceCallContext, ServiceMetrics, ServiceStatus};

/// 注册表内的一条服务记录
struct ServiceEntry {
    service: Arc<dyn Service>,
    seq: u64,
    capabilities: Vec<String>,
    health: HealthStatus,
    metrics: ServiceMetrics,
    registered_at: DateTime<Utc>,
    last_checked_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

#[derive(Default)]
struct RegistryInner {
    services: HashMap<String, ServiceEntry>,
    next_seq: u64,
    /// 候选集合签名 -> 下一次轮询偏移
    round_robin: HashMap<String, usize>,
}

/// 选择结果：服务句柄 + 可解释的评分
#[derive(Clone)]
pub struct ServiceMatch {
    pub service: Arc<dyn Service>,
    pub ranking: Ranked,
}

impl ServiceMatch {
    pub fn id(&self) -> &str {
        &self.ranking.id
    }
}

impl std::fmt::Debug for ServiceMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceMatch").field("ranking", &self.ranking).finish()
    }
}

/// 服务注册表（进程内单例，以 Arc 注入各组件）
pub struct ServiceRegistry {
    inner: RwLock<RegistryInner>,
    events: EventBus,
    health_timeout: Duration,
    invocation_timeout: Duration,
    latency_scale_ms: f64,
    load_decay_secs: f64,
}

impl ServiceRegistry {
    pub fn new(config: &RegistrySection, events: EventBus) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            events,
            health_timeout: Duration::from_secs(config.health_check_timeout_secs),
            invocation_timeout: Duration::from_secs(config.invocation_timeout_secs),
            latency_scale_ms: config.latency_scale_ms,
            load_decay_secs: config.load_decay_secs,
        }
    }

    /// 覆盖探针超时（测试或嵌入方微调）
    pub fn with_health_timeout(mut self, health_timeout: Duration) -> Self {
        self.health_timeout = health_timeout;
        self
    }

    pub fn with_invocation_timeout(mut self, invocation_timeout: Duration) -> Self {
        self.invocation_timeout = invocation_timeout;
        self
    }

    /// 注册服务：校验 → initialize → 入表 → 立即探活
    ///
    /// 探活失败不阻止注册，只是标记为 unhealthy（不参与选择）。
    pub async fn register(&self, service: Arc<dyn Service>) -> Result<ServiceStatus, OrchestratorError> {
        let id = service.id().trim().to_string();
        if id.is_empty() {
            return Err(OrchestratorError::Validation("service id must not be empty".into()));
        }
        if service.name().trim().is_empty() {
            return Err(OrchestratorError::Validation(format!(
                "service {} has an empty name",
                id
            )));
        }
        if self.inner.read().await.services.contains_key(&id) {
            return Err(OrchestratorError::Validation(format!(
                "service {} is already registered",
                id
            )));
        }

        service.initialize().await.map_err(|e| OrchestratorError::Execution {
            message: format!("service {} failed to initialize", id),
            source: Some(e.into()),
        })?;

        let mut capabilities = capability::normalize_tags(service.capabilities());
        if capabilities.is_empty() {
            capabilities = infer_capabilities(&format!("{} {}", id, service.name()));
        }
        if capabilities.is_empty() {
            capabilities.push(capability::GENERAL.to_string());
        }

        {
            let mut inner = self.inner.write().await;
            if inner.services.contains_key(&id) {
                return Err(OrchestratorError::Validation(format!(
                    "service {} is already registered",
                    id
                )));
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.services.insert(
                id.clone(),
                ServiceEntry {
                    service,
                    seq,
                    capabilities: capabilities.clone(),
                    health: HealthStatus::Unknown,
                    metrics: ServiceMetrics::default(),
                    registered_at: Utc::now(),
                    last_checked_at: None,
                    last_error: None,
                },
            );
        }

        tracing::info!("Registered service {} with capabilities {:?}", id, capabilities);
        self.events.publish(LifecycleEvent::ServiceRegistered {
            service_id: id.clone(),
            capabilities,
        });

        self.check_health(&id).await?;
        self.status(&id).await
    }

    /// 注销服务；重复注销是 no-op，不会再次发事件
    pub async fn unregister(&self, id: &str) -> Option<Arc<dyn Service>> {
        let removed = {
            let mut inner = self.inner.write().await;
            let removed = inner.services.remove(id);
            if removed.is_some() {
                inner.round_robin.retain(|signature, _| !signature.split(',').any(|member| member == id));
            }
            removed
        };
        match removed {
            Some(entry) => {
                tracing::info!("Unregistered service {}", id);
                self.events.publish(LifecycleEvent::ServiceUnregistered {
                    service_id: id.to_string(),
                });
                Some(entry.service)
            }
            None => None,
        }
    }

    pub async fn get(&self, id: &str) -> Result<Arc<dyn Service>, OrchestratorError> {
        self.inner
            .read()
            .await
            .services
            .get(id)
            .map(|e| Arc::clone(&e.service))
            .ok_or_else(|| OrchestratorError::not_found("service", id))
    }

    pub async fn status(&self, id: &str) -> Result<ServiceStatus, OrchestratorError> {
        let inner = self.inner.read().await;
        inner
            .services
            .get(id)
            .map(|e| self.snapshot(id, e, Utc::now()))
            .ok_or_else(|| OrchestratorError::not_found("service", id))
    }

    /// 所有服务的健康与指标快照，按注册顺序
    pub async fn health_status(&self) -> Vec<ServiceStatus> {
        let inner = self.inner.read().await;
        let now = Utc::now();
        let mut entries: Vec<(&String, &ServiceEntry)> = inner.services.iter().collect();
        entries.sort_by_key(|(_, e)| e.seq);
        entries
            .into_iter()
            .map(|(id, e)| self.snapshot(id, e, now))
            .collect()
    }

    /// 已注册服务 ID，按注册顺序
    pub async fn list(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut ids: Vec<(u64, String)> = inner.services.iter().map(|(id, e)| (e.seq, id.clone())).collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.services.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 声明了某能力（精确匹配）的服务 ID，按注册顺序
    pub async fn services_by_capability(&self, tag: &str) -> Vec<String> {
        let tag = capability::normalize_tag(tag);
        let inner = self.inner.read().await;
        let mut hits: Vec<(u64, String)> = inner
            .services
            .iter()
            .filter(|(_, e)| e.capabilities.contains(&tag))
            .map(|(id, e)| (e.seq, id.clone()))
            .collect();
        hits.sort();
        hits.into_iter().map(|(_, id)| id).collect()
    }

    /// 显式追加能力
    pub async fn add_capability(&self, id: &str, tag: &str) -> Result<(), OrchestratorError> {
        let tag = capability::normalize_tag(tag);
        if tag.is_empty() {
            return Err(OrchestratorError::Validation("capability tag must not be empty".into()));
        }
        let mut inner = self.inner.write().await;
        let entry = inner
            .services
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::not_found("service", id))?;
        if !entry.capabilities.contains(&tag) {
            entry.capabilities.push(tag);
        }
        Ok(())
    }

    /// 显式移除能力；返回是否存在
    pub async fn remove_capability(&self, id: &str, tag: &str) -> Result<bool, OrchestratorError> {
        let tag = capability::normalize_tag(tag);
        let mut inner = self.inner.write().await;
        let entry = inner
            .services
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::not_found("service", id))?;
        let before = entry.capabilities.len();
        entry.capabilities.retain(|c| c != &tag);
        Ok(entry.capabilities.len() != before)
    }

    /// 按能力需求与策略选择健康服务；没有匹配时返回空（表示无可用提供者，不是错误）
    pub async fn select_services(
        &self,
        required: &[String],
        strategy: SelectionStrategy,
        count: usize,
    ) -> Vec<ServiceMatch> {
        let required = capability::normalize_tags(required);
        let now = Utc::now();

        let mut inner = self.inner.write().await;
        let candidates: Vec<selection::Candidate> = inner
            .services
            .iter()
            .filter(|(_, e)| e.health == HealthStatus::Healthy)
            .map(|(id, e)| selection::Candidate {
                id: id.clone(),
                seq: e.seq,
                capabilities: e.capabilities.clone(),
                load: self.load_of(&e.metrics, now),
            })
            .collect();

        let ranked = selection::rank(&required, &candidates);
        if ranked.is_empty() {
            tracing::debug!("No healthy service matches {:?}", required);
            return Vec::new();
        }

        let offset = if strategy == SelectionStrategy::RoundRobin {
            let slot = inner.round_robin.entry(selection::signature(&ranked)).or_insert(0);
            let current = *slot;
            *slot = slot.wrapping_add(1);
            current
        } else {
            0
        };

        selection::apply_strategy(ranked, strategy, count, offset)
            .into_iter()
            .filter_map(|ranking| {
                inner.services.get(&ranking.id).map(|e| ServiceMatch {
                    service: Arc::clone(&e.service),
                    ranking,
                })
            })
            .collect()
    }

    /// 记录一次真实调用结果
    pub async fn record_outcome(&self, id: &str, success: bool, latency_ms: f64) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .services
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::not_found("service", id))?;
        entry.metrics.record(success, latency_ms.max(0.0));
        Ok(())
    }

    /// 经注册表调用服务：拒绝 unhealthy，施加调用超时，自动记录结果并输出 JSON 审计日志
    ///
    /// 超时与 panic 都按 Execution 错误返回。
    pub async fn execute(
        &self,
        id: &str,
        input: Value,
        ctx: &ServiceCallContext,
    ) -> Result<Value, OrchestratorError> {
        let service = {
            let inner = self.inner.read().await;
            let entry = inner
                .services
                .get(id)
                .ok_or_else(|| OrchestratorError::not_found("service", id))?;
            if entry.health == HealthStatus::Unhealthy {
                return Err(OrchestratorError::UnhealthyService(id.to_string()));
            }
            Arc::clone(&entry.service)
        };

        let start = Instant::now();
        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            r = timeout(self.invocation_timeout, AssertUnwindSafe(service.execute(input, ctx)).catch_unwind()) => r,
        };
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        let outcome = match &result {
            Ok(Ok(Ok(_))) => "ok",
            Ok(Ok(Err(_))) => "error",
            Ok(Err(_)) => "panic",
            Err(_) => "timeout",
        };
        let audit = serde_json::json!({
            "event": "service_audit",
            "service": id,
            "operation": ctx.operation,
            "task_id": ctx.task_id,
            "outcome": outcome,
            "duration_ms": latency_ms as u64,
        });
        tracing::info!(audit = %audit.to_string(), "service");

        // 服务可能在调用期间被注销，此时没有指标可记
        let _ = self.record_outcome(id, outcome == "ok", latency_ms).await;

        match result {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(OrchestratorError::Execution {
                message: format!("service {} failed during {}", id, ctx.operation),
                source: Some(e.into()),
            }),
            Ok(Err(panic)) => {
                tracing::error!("Service {} panicked during {}", id, ctx.operation);
                Err(OrchestratorError::execution(format!(
                    "service {} panicked during {}: {}",
                    id,
                    ctx.operation,
                    panic_message(&*panic)
                )))
            }
            Err(elapsed) => Err(OrchestratorError::execution_with(
                format!(
                    "service {} timed out after {}ms during {}",
                    id,
                    self.invocation_timeout.as_millis(),
                    ctx.operation
                ),
                elapsed,
            )),
        }
    }

    fn load_of(&self, metrics: &ServiceMetrics, now: DateTime<Utc>) -> f64 {
        selection::load_score(metrics, now, self.latency_scale_ms, self.load_decay_secs)
    }

    fn snapshot(&self, id: &str, e: &ServiceEntry, now: DateTime<Utc>) -> ServiceStatus {
        ServiceStatus {
            id: id.to_string(),
            name: e.service.name().to_string(),
            capabilities: e.capabilities.clone(),
            health: e.health,
            metrics: e.metrics.clone(),
            load: self.load_of(&e.metrics, now),
            registered_at: e.registered_at,
            last_checked_at: e.last_checked_at,
            last_error: e.last_error.clone(),
        }
    }
}

/// 从 panic 负载中取出可读信息
fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    /// 可切换健康状态的测试服务
    pub(crate) struct StubService {
        pub id: String,
        pub caps: Vec<String>,
        pub healthy: AtomicBool,
        pub delay: Duration,
    }

    impl StubService {
        pub(crate) fn new(id: &str, caps: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                caps: caps.iter().map(|c| c.to_string()).collect(),
                healthy: AtomicBool::new(true),
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl Service for StubService {
        fn id(&self) -> &str {
            &self.id
        }

        async fn execute(&self, input: Value, _ctx: &ServiceCallContext) -> anyhow::Result<Value> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if input == Value::String("boom".into()) {
                anyhow::bail!("stub exploded");
            }
            Ok(serde_json::json!({ "service": self.id, "echo": input }))
        }

        async fn health_check(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }

        fn capabilities(&self) -> Vec<String> {
            self.caps.clone()
        }
    }

    pub(crate) fn registry() -> ServiceRegistry {
        ServiceRegistry::new(&RegistrySection::default(), EventBus::default())
            .with_health_timeout(Duration::from_millis(200))
    }

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn ids(matches: &[ServiceMatch]) -> Vec<String> {
        matches.iter().map(|m| m.id().to_string()).collect()
    }

    #[tokio::test]
    async fn test_best_match_prefers_full_coverage() {
        let reg = registry();
        reg.register(StubService::new("a", &["research"])).await.unwrap();
        reg.register(StubService::new("b", &["research", "analysis"])).await.unwrap();

        let picked = reg
            .select_services(&tags(&["research", "analysis"]), SelectionStrategy::BestMatch, 1)
            .await;
        assert_eq!(ids(&picked), vec!["b"]);
        assert_eq!(picked[0].ranking.compatibility, 1.0);
    }

    #[tokio::test]
    async fn test_unhealthy_service_is_excluded() {
        let reg = registry();
        let svc = StubService::new("a", &["research"]);
        svc.healthy.store(false, Ordering::SeqCst);
        let status = reg.register(svc.clone()).await.unwrap();
        assert_eq!(status.health, HealthStatus::Unhealthy);

        let picked = reg
            .select_services(&tags(&["research"]), SelectionStrategy::All, 0)
            .await;
        assert!(picked.is_empty());

        svc.healthy.store(true, Ordering::SeqCst);
        reg.check_health("a").await.unwrap();
        let picked = reg
            .select_services(&tags(&["research"]), SelectionStrategy::All, 0)
            .await;
        assert_eq!(ids(&picked), vec!["a"]);
    }

    #[tokio::test]
    async fn test_duplicate_and_empty_id_rejected() {
        let reg = registry();
        reg.register(StubService::new("a", &["x"])).await.unwrap();
        assert!(matches!(
            reg.register(StubService::new("a", &["x"])).await,
            Err(OrchestratorError::Validation(_))
        ));
        assert!(matches!(
            reg.register(StubService::new(" ", &["x"])).await,
            Err(OrchestratorError::Validation(_))
        ));
        reg.register(StubService::new("b", &["x"])).await.unwrap();
        assert_eq!(reg.list().await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_capabilities_inferred_when_missing() {
        let reg = registry();
        let status = reg.register(StubService::new("web-search", &[])).await.unwrap();
        assert_eq!(status.capabilities, vec!["search".to_string()]);

        let status = reg.register(StubService::new("misc", &[])).await.unwrap();
        assert_eq!(status.capabilities, vec!["general".to_string()]);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let reg = registry();
        let mut rx = reg.events.subscribe();
        reg.register(StubService::new("a", &["x"])).await.unwrap();

        assert!(reg.unregister("a").await.is_some());
        assert!(reg.unregister("a").await.is_none());
        assert!(matches!(reg.get("a").await, Err(OrchestratorError::NotFound { .. })));

        let mut unregistered = 0;
        while let Ok(env) = rx.try_recv() {
            if matches!(env.event, LifecycleEvent::ServiceUnregistered { .. }) {
                unregistered += 1;
            }
        }
        assert_eq!(unregistered, 1);
    }

    #[tokio::test]
    async fn test_execute_records_outcome() {
        let reg = registry();
        reg.register(StubService::new("a", &["x"])).await.unwrap();
        let ctx = ServiceCallContext::new("run").for_task("t1");

        let out = reg.execute("a", serde_json::json!("hi"), &ctx).await.unwrap();
        assert_eq!(out["echo"], "hi");
        let err = reg.execute("a", serde_json::json!("boom"), &ctx).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Execution { .. }));

        let status = reg.status("a").await.unwrap();
        assert_eq!(status.metrics.request_count, 2);
        assert_eq!(status.metrics.success_count, 1);
        assert_eq!(status.metrics.failure_count, 1);
    }

    #[tokio::test]
    async fn test_execute_rejects_unhealthy() {
        let reg = registry();
        let svc = StubService::new("a", &["x"]);
        svc.healthy.store(false, Ordering::SeqCst);
        reg.register(svc).await.unwrap();
        let err = reg
            .execute("a", Value::Null, &ServiceCallContext::new("run"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnhealthyService(_)));
    }

    #[tokio::test]
    async fn test_round_robin_cycles_per_candidate_set() {
        let reg = registry();
        reg.register(StubService::new("a", &["search"])).await.unwrap();
        reg.register(StubService::new("b", &["search"])).await.unwrap();

        let req = tags(&["search"]);
        let mut seen = Vec::new();
        for _ in 0..3 {
            let picked = reg.select_services(&req, SelectionStrategy::RoundRobin, 1).await;
            seen.push(picked[0].id().to_string());
        }
        assert_eq!(seen, vec!["a", "b", "a"]);
    }

    #[tokio::test]
    async fn test_round_robin_stays_cyclic_after_calls() {
        let reg = registry();
        for id in ["a", "b"] {
            reg.register(Arc::new(StubService {
                id: id.to_string(),
                caps: vec!["search".into()],
                healthy: AtomicBool::new(true),
                delay: Duration::from_millis(20),
            }))
            .await
            .unwrap();
        }

        let req = tags(&["search"]);
        let ctx = ServiceCallContext::new("run");
        let mut seen = Vec::new();
        for _ in 0..4 {
            let picked = reg.select_services(&req, SelectionStrategy::RoundRobin, 1).await;
            let id = picked[0].id().to_string();
            reg.execute(&id, Value::Null, &ctx).await.unwrap();
            seen.push(id);
        }
        assert_eq!(seen, vec!["a", "b", "a", "b"]);
    }

    #[tokio::test]
    async fn test_unregister_drops_round_robin_offsets() {
        let reg = registry();
        reg.register(StubService::new("a", &["search"])).await.unwrap();
        reg.register(StubService::new("b", &["search"])).await.unwrap();
        reg.register(StubService::new("c", &["archive"])).await.unwrap();

        reg.select_services(&tags(&["search"]), SelectionStrategy::RoundRobin, 1).await;
        reg.select_services(&tags(&["archive"]), SelectionStrategy::RoundRobin, 1).await;
        assert_eq!(reg.inner.read().await.round_robin.len(), 2);

        reg.unregister("a").await;
        let inner = reg.inner.read().await;
        assert_eq!(inner.round_robin.len(), 1);
        assert!(inner.round_robin.contains_key("c"));
    }

    /// execute 直接 panic 的服务
    struct PanickingService;

    #[async_trait]
    impl Service for PanickingService {
        fn id(&self) -> &str {
            "crashy"
        }

        async fn execute(&self, _input: Value, _ctx: &ServiceCallContext) -> anyhow::Result<Value> {
            panic!("index out of range");
        }

        async fn health_check(&self) -> bool {
            true
        }

        fn capabilities(&self) -> Vec<String> {
            vec!["search".into()]
        }
    }

    #[tokio::test]
    async fn test_execute_panic_becomes_execution_error() {
        let reg = registry();
        reg.register(Arc::new(PanickingService)).await.unwrap();

        let err = reg
            .execute("crashy", Value::Null, &ServiceCallContext::new("run"))
            .await
            .unwrap_err();
        assert!(matches!(&err, OrchestratorError::Execution { message, .. } if message.contains("index out of range")));

        let status = reg.status("crashy").await.unwrap();
        assert_eq!(status.metrics.failure_count, 1);
        assert_eq!(status.health, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_invocation_timeout_is_execution_error() {
        let reg = registry().with_invocation_timeout(Duration::from_millis(20));
        reg.register(Arc::new(StubService {
            id: "slow".into(),
            caps: vec!["search".into()],
            healthy: AtomicBool::new(true),
            delay: Duration::from_millis(500),
        }))
        .await
        .unwrap();

        let err = reg
            .execute("slow", Value::Null, &ServiceCallContext::new("run"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::core::error::ErrorCode::ExecutionError);
        assert!(err.to_string().contains("timed out after 20ms"));
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(reg.status("slow").await.unwrap().metrics.failure_count, 1);
    }

    #[tokio::test]
    async fn test_explicit_capability_changes() {
        let reg = registry();
        reg.register(StubService::new("a", &["search"])).await.unwrap();
        reg.add_capability("a", "Translation").await.unwrap();
        assert_eq!(reg.services_by_capability("translation").await, vec!["a"]);
        assert!(reg.remove_capability("a", "translation").await.unwrap());
        assert!(!reg.remove_capability("a", "translation").await.unwrap());
        assert!(reg.services_by_capability("translation").await.is_empty());
    }
}
