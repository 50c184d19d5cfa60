//! 执行上下文追踪：每个在途任务一份记录
//!
//! 创建时即安排一次强制清理（max_lifetime 后），保证被遗弃的上下文不会常驻内存。
//! 内存 map 由 parking_lot 锁保护，锁内不做任何 await。

mod analytics;
mod types;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ContextSection;
use crate::core::error::OrchestratorError;

pub use analytics::{AnalyticsReport, ContextMetrics, PerformanceSummary, TimelineEntry, TimelineKind};
pub use types::{
    is_sensitive_header, AnalyticsInfo, CallerMetadata, ExecutionContext, LogEntry, RequestInfo,
    ResourceCounters, ResourceKind, ResourceOp, RiskLevel, SecurityInfo, ServiceCallRecord, StepRecord,
    WorkflowRunRecord, SENSITIVE_HEADERS,
};

struct Slot {
    ctx: ExecutionContext,
    /// 同一 task id 重建后，旧的定时清理不应误删新上下文
    generation: u64,
}

type ContextMap = RwLock<HashMap<String, Slot>>;

/// 执行上下文追踪器
pub struct ExecutionContextTracker {
    contexts: Arc<ContextMap>,
    next_generation: AtomicU64,
    max_lifetime: Duration,
    export_max_entries: usize,
}

impl ExecutionContextTracker {
    pub fn new(max_lifetime: Duration) -> Self {
        Self {
            contexts: Arc::new(RwLock::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            max_lifetime,
            export_max_entries: 100,
        }
    }

    pub fn from_config(config: &ContextSection) -> Self {
        Self::new(Duration::from_secs(config.max_lifetime_secs)).with_export_limit(config.export_max_entries)
    }

    pub fn with_export_limit(mut self, max_entries: usize) -> Self {
        self.export_max_entries = max_entries;
        self
    }

    /// 创建上下文；同 id 的上下文已存在时报错
    pub fn create(&self, task_id: &str, caller: CallerMetadata) -> Result<ExecutionContext, OrchestratorError> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let ctx = ExecutionContext::new(task_id, caller);
        {
            let mut map = self.contexts.write();
            if map.contains_key(task_id) {
                return Err(OrchestratorError::Validation(format!(
                    "execution context already exists for task {}",
                    task_id
                )));
            }
            map.insert(
                task_id.to_string(),
                Slot {
                    ctx: ctx.clone(),
                    generation,
                },
            );
        }
        tracing::debug!("Execution context created for task {}", task_id);
        self.spawn_removal(task_id.to_string(), generation, self.max_lifetime);
        Ok(ctx)
    }

    pub fn get(&self, task_id: &str) -> Option<ExecutionContext> {
        self.contexts.read().get(task_id).map(|s| s.ctx.clone())
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.contexts.read().contains_key(task_id)
    }

    pub fn active_count(&self) -> usize {
        self.contexts.read().len()
    }

    /// 在只读上下文上执行闭包，避免整份克隆
    pub fn with_context<R>(&self, task_id: &str, f: impl FnOnce(&ExecutionContext) -> R) -> Option<R> {
        self.contexts.read().get(task_id).map(|s| f(&s.ctx))
    }

    /// 修改上下文；已取消的上下文忽略追加类写入
    fn append(&self, task_id: &str, f: impl FnOnce(&mut ExecutionContext)) -> bool {
        let mut map = self.contexts.write();
        match map.get_mut(task_id) {
            Some(slot) if !slot.ctx.cancelled => {
                f(&mut slot.ctx);
                true
            }
            Some(_) => {
                tracing::debug!("Ignoring write to cancelled context {}", task_id);
                false
            }
            None => false,
        }
    }

    pub fn add_step(&self, task_id: &str, mut step: StepRecord) -> bool {
        step.at = Utc::now();
        self.append(task_id, |ctx| ctx.steps.push(step))
    }

    /// 记录一次服务调用：网络调用数 +1，带缓存信息时同时累计命中 / 未命中
    pub fn add_service_call(&self, task_id: &str, mut call: ServiceCallRecord) -> bool {
        call.at = Utc::now();
        self.append(task_id, |ctx| {
            ctx.resources.apply(ResourceKind::NetworkCalls, 1, ResourceOp::Add);
            match call.cache_hit {
                Some(true) => ctx.resources.apply(ResourceKind::CacheHits, 1, ResourceOp::Add),
                Some(false) => ctx.resources.apply(ResourceKind::CacheMisses, 1, ResourceOp::Add),
                None => {}
            }
            ctx.service_calls.push(call);
        })
    }

    pub fn add_workflow_run(&self, task_id: &str, mut run: WorkflowRunRecord) -> bool {
        run.at = Utc::now();
        self.append(task_id, |ctx| ctx.workflow_runs.push(run))
    }

    pub fn add_error(&self, task_id: &str, message: impl Into<String>, code: Option<&str>) -> bool {
        let entry = LogEntry::new(message, code);
        self.append(task_id, |ctx| ctx.errors.push(entry))
    }

    pub fn add_warning(&self, task_id: &str, message: impl Into<String>) -> bool {
        let entry = LogEntry::new(message, None);
        self.append(task_id, |ctx| ctx.warnings.push(entry))
    }

    pub fn update_resource(&self, task_id: &str, kind: ResourceKind, value: i64, op: ResourceOp) -> bool {
        self.append(task_id, |ctx| ctx.resources.apply(kind, value, op))
    }

    pub fn set_dynamic(&self, task_id: &str, key: impl Into<String>, value: Value) -> bool {
        let key = key.into();
        self.append(task_id, |ctx| {
            ctx.dynamic.insert(key, value);
        })
    }

    pub fn get_dynamic(&self, task_id: &str, key: &str) -> Option<Value> {
        self.with_context(task_id, |ctx| ctx.dynamic.get(key).cloned()).flatten()
    }

    pub fn add_tag(&self, task_id: &str, tag: impl Into<String>) -> bool {
        let tag = tag.into();
        self.append(task_id, |ctx| {
            ctx.analytics.tags.insert(tag);
        })
    }

    pub fn escalate_risk(&self, task_id: &str, level: RiskLevel) -> bool {
        let mut escalated = false;
        self.append(task_id, |ctx| escalated = ctx.escalate_risk(level));
        if escalated {
            tracing::info!("Risk level of task {} escalated to {:?}", task_id, level);
        }
        escalated
    }

    pub fn set_debug(&self, task_id: &str, enabled: bool) -> bool {
        let mut map = self.contexts.write();
        match map.get_mut(task_id) {
            Some(slot) => {
                slot.ctx.analytics.debug = enabled;
                true
            }
            None => false,
        }
    }

    /// 标记取消：此后的追加写入一律忽略
    pub fn mark_cancelled(&self, task_id: &str) -> bool {
        let mut map = self.contexts.write();
        match map.get_mut(task_id) {
            Some(slot) => {
                slot.ctx.cancelled = true;
                true
            }
            None => false,
        }
    }

    pub fn metrics(&self, task_id: &str) -> Option<ContextMetrics> {
        let now = Utc::now();
        self.with_context(task_id, |ctx| ctx.metrics_at(now))
    }

    pub fn analytics_report(&self, task_id: &str) -> Option<AnalyticsReport> {
        let now = Utc::now();
        self.with_context(task_id, |ctx| ctx.analytics_report_at(now))
    }

    /// 调试时间线；仅对开启了 debug 的上下文可用
    pub fn timeline(&self, task_id: &str) -> Result<Vec<TimelineEntry>, OrchestratorError> {
        self.debug_view(task_id, |ctx| ctx.timeline())
    }

    /// 脱敏导出；仅对开启了 debug 的上下文可用
    pub fn sanitized_export(&self, task_id: &str) -> Result<Value, OrchestratorError> {
        let limit = self.export_max_entries;
        self.debug_view(task_id, |ctx| ctx.sanitized_export(limit))
    }

    fn debug_view<R>(&self, task_id: &str, f: impl FnOnce(&ExecutionContext) -> R) -> Result<R, OrchestratorError> {
        let map = self.contexts.read();
        let slot = map
            .get(task_id)
            .ok_or_else(|| OrchestratorError::not_found("context", task_id))?;
        if !slot.ctx.analytics.debug {
            return Err(OrchestratorError::Validation(format!(
                "debug mode is not enabled for task {}",
                task_id
            )));
        }
        Ok(f(&slot.ctx))
    }

    /// 立即删除
    pub fn cleanup(&self, task_id: &str) -> bool {
        let removed = self.contexts.write().remove(task_id).is_some();
        if removed {
            tracing::debug!("Execution context for task {} cleaned up", task_id);
        }
        removed
    }

    /// 延迟删除（保留一段时间供结果查询）
    pub fn schedule_cleanup(&self, task_id: &str, delay: Duration) -> bool {
        let generation = match self.contexts.read().get(task_id) {
            Some(slot) => slot.generation,
            None => return false,
        };
        if delay.is_zero() {
            return self.cleanup(task_id);
        }
        self.spawn_removal(task_id.to_string(), generation, delay);
        true
    }

    /// 删除存活超过 max_lifetime 的上下文
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let max = self.max_lifetime;
        let mut map = self.contexts.write();
        let before = map.len();
        map.retain(|_, slot| match (now - slot.ctx.created_at).to_std() {
            Ok(age) => age <= max,
            Err(_) => true,
        });
        let removed = before - map.len();
        if removed > 0 {
            tracing::info!("Swept {} expired execution contexts", removed);
        }
        removed
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        tracker.sweep_expired();
                    }
                }
            }
        })
    }

    fn spawn_removal(&self, task_id: String, generation: u64, delay: Duration) {
        // 没有运行时（同步测试）时交给 sweep_expired 兜底
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let contexts: Weak<ContextMap> = Arc::downgrade(&self.contexts);
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(contexts) = contexts.upgrade() else {
                return;
            };
            let mut map = contexts.write();
            if map.get(&task_id).is_some_and(|s| s.generation == generation) {
                map.remove(&task_id);
                tracing::debug!("Execution context for task {} removed after {:?}", task_id, delay);
            }
        });
    }
}

impl Default for ExecutionContextTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(1800))
    }
}
