//! 派生指标：按需计算，不缓存

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::types::{is_sensitive_header, ExecutionContext, ResourceCounters, RiskLevel};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextMetrics {
    pub total_duration_ms: u64,
    pub step_count: usize,
    pub service_call_count: usize,
    pub workflow_count: usize,
    pub error_count: usize,
    pub warning_count: usize,
    /// 没有服务调用时为 1.0
    pub service_success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSummary {
    /// 服务调用耗时占总耗时的比例，0..=1
    pub efficiency: f64,
    pub cache_hit_ratio: f64,
    pub errors_per_step: f64,
    pub warnings_per_step: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsReport {
    pub task_id: String,
    pub trace_id: String,
    pub metrics: ContextMetrics,
    pub performance: PerformanceSummary,
    pub resources: ResourceCounters,
    pub risk_level: RiskLevel,
    pub tags: BTreeSet<String>,
    pub experiment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineKind {
    Step,
    ServiceCall,
    Error,
}

/// 调试时间线中的一项，offset 相对上下文创建时刻
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEntry {
    pub kind: TimelineKind,
    pub label: String,
    pub at: DateTime<Utc>,
    pub offset_ms: i64,
    pub duration_ms: Option<u64>,
    pub success: bool,
}

fn ratio(num: f64, den: f64) -> f64 {
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

impl ExecutionContext {
    pub fn metrics_at(&self, now: DateTime<Utc>) -> ContextMetrics {
        let calls = self.service_calls.len();
        let succeeded = self.service_calls.iter().filter(|c| c.success).count();
        ContextMetrics {
            total_duration_ms: (now - self.created_at).num_milliseconds().max(0) as u64,
            step_count: self.steps.len(),
            service_call_count: calls,
            workflow_count: self.workflow_runs.len(),
            error_count: self.errors.len(),
            warning_count: self.warnings.len(),
            service_success_rate: if calls == 0 {
                1.0
            } else {
                succeeded as f64 / calls as f64
            },
        }
    }

    pub fn performance_at(&self, now: DateTime<Utc>) -> PerformanceSummary {
        let total_ms = (now - self.created_at).num_milliseconds().max(0) as f64;
        let service_ms: u64 = self.service_calls.iter().map(|c| c.duration_ms).sum();
        let hits = self.resources.cache_hits.max(0) as f64;
        let misses = self.resources.cache_misses.max(0) as f64;
        let steps = self.steps.len().max(1) as f64;

        PerformanceSummary {
            efficiency: ratio(service_ms as f64, total_ms).min(1.0),
            cache_hit_ratio: ratio(hits, hits + misses),
            errors_per_step: self.errors.len() as f64 / steps,
            warnings_per_step: self.warnings.len() as f64 / steps,
        }
    }

    pub fn analytics_report_at(&self, now: DateTime<Utc>) -> AnalyticsReport {
        AnalyticsReport {
            task_id: self.task_id.clone(),
            trace_id: self.analytics.trace_id.clone(),
            metrics: self.metrics_at(now),
            performance: self.performance_at(now),
            resources: self.resources,
            risk_level: self.security.risk_level,
            tags: self.analytics.tags.clone(),
            experiment: self.analytics.experiment.clone(),
        }
    }

    /// 步骤、服务调用、错误按时间交织
    pub fn timeline(&self) -> Vec<TimelineEntry> {
        let offset = |at: DateTime<Utc>| (at - self.created_at).num_milliseconds();

        let steps = self.steps.iter().map(|s| TimelineEntry {
            kind: TimelineKind::Step,
            label: s.name.clone(),
            at: s.at,
            offset_ms: offset(s.at),
            duration_ms: s.duration_ms,
            success: s.success,
        });
        let calls = self.service_calls.iter().map(|c| TimelineEntry {
            kind: TimelineKind::ServiceCall,
            label: format!("{}::{}", c.service_id, c.operation),
            at: c.at,
            offset_ms: offset(c.at),
            duration_ms: Some(c.duration_ms),
            success: c.success,
        });
        let errors = self.errors.iter().map(|e| TimelineEntry {
            kind: TimelineKind::Error,
            label: e.message.clone(),
            at: e.at,
            offset_ms: offset(e.at),
            duration_ms: None,
            success: false,
        });

        let mut entries: Vec<TimelineEntry> = steps.chain(calls).chain(errors).collect();
        entries.sort_by_key(|e| e.at);
        entries
    }

    /// 对外导出：去掉认证相关请求头，日志数组只保留最近 `max_entries` 条
    pub fn sanitized_export(&self, max_entries: usize) -> Value {
        let mut value = match serde_json::to_value(self) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Failed to serialize context {}: {}", self.task_id, e);
                return Value::Null;
            }
        };

        if let Some(headers) = value.pointer_mut("/request/headers").and_then(Value::as_object_mut) {
            headers.retain(|name, _| !is_sensitive_header(name));
        }

        let mut truncated = serde_json::Map::new();
        for field in ["steps", "service_calls", "workflow_runs", "errors", "warnings"] {
            if let Some(Value::Array(items)) = value.get_mut(field) {
                if items.len() > max_entries {
                    let dropped = items.len() - max_entries;
                    items.drain(..dropped);
                    truncated.insert(field.to_string(), Value::from(dropped));
                }
            }
        }
        if let Some(obj) = value.as_object_mut() {
            obj.insert("truncated".to_string(), Value::Object(truncated));
        }
        value
    }
}
