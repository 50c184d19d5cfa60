//! 执行上下文数据结构

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 创建上下文时丢弃的请求头（小写比较）
pub const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "proxy-authorization",
];

pub fn is_sensitive_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SENSITIVE_HEADERS.contains(&lower.as_str())
}

/// 调用方元数据（随 process_task 传入）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallerMetadata {
    #[serde(default)]
    pub caller_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub authenticated: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub experiment: Option<String>,
}

impl CallerMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_caller(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = Some(caller_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }

    pub fn authenticated(mut self, authenticated: bool) -> Self {
        self.authenticated = authenticated;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_experiment(mut self, experiment: impl Into<String>) -> Self {
        self.experiment = Some(experiment.into());
        self
    }
}

/// 上下文中保存的请求信息（已去除敏感头）
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestInfo {
    pub caller_id: Option<String>,
    pub session_id: Option<String>,
    pub origin: Option<String>,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub name: String,
    pub success: bool,
    pub duration_ms: Option<u64>,
    pub detail: Option<Value>,
    pub at: DateTime<Utc>,
}

impl StepRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            success: true,
            duration_ms: None,
            detail: None,
            at: Utc::now(),
        }
    }

    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceCallRecord {
    pub service_id: String,
    pub operation: String,
    pub duration_ms: u64,
    pub success: bool,
    /// None 表示调用方没有缓存信息
    pub cache_hit: Option<bool>,
    pub at: DateTime<Utc>,
}

impl ServiceCallRecord {
    pub fn new(service_id: impl Into<String>, operation: impl Into<String>, duration_ms: u64, success: bool) -> Self {
        Self {
            service_id: service_id.into(),
            operation: operation.into(),
            duration_ms,
            success,
            cache_hit: None,
            at: Utc::now(),
        }
    }

    pub fn with_cache_hit(mut self, hit: bool) -> Self {
        self.cache_hit = Some(hit);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowRunRecord {
    pub workflow_id: String,
    pub success: bool,
    pub duration_ms: u64,
    pub at: DateTime<Utc>,
}

impl WorkflowRunRecord {
    pub fn new(workflow_id: impl Into<String>, success: bool, duration_ms: u64) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            success,
            duration_ms,
            at: Utc::now(),
        }
    }
}

/// errors / warnings 日志条目
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub message: String,
    pub code: Option<String>,
    pub at: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(message: impl Into<String>, code: Option<&str>) -> Self {
        Self {
            message: message.into(),
            code: code.map(str::to_string),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    NetworkCalls,
    MemoryDelta,
    DiskOps,
    CacheHits,
    CacheMisses,
}

/// 资源计数的更新方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceOp {
    /// 累加
    Add,
    /// 覆盖
    Set,
    /// 取运行最大值
    Max,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceCounters {
    pub network_calls: i64,
    pub memory_delta: i64,
    pub disk_ops: i64,
    pub cache_hits: i64,
    pub cache_misses: i64,
}

impl ResourceCounters {
    pub fn get(&self, kind: ResourceKind) -> i64 {
        match kind {
            ResourceKind::NetworkCalls => self.network_calls,
            ResourceKind::MemoryDelta => self.memory_delta,
            ResourceKind::DiskOps => self.disk_ops,
            ResourceKind::CacheHits => self.cache_hits,
            ResourceKind::CacheMisses => self.cache_misses,
        }
    }

    pub fn apply(&mut self, kind: ResourceKind, value: i64, op: ResourceOp) {
        let slot = match kind {
            ResourceKind::NetworkCalls => &mut self.network_calls,
            ResourceKind::MemoryDelta => &mut self.memory_delta,
            ResourceKind::DiskOps => &mut self.disk_ops,
            ResourceKind::CacheHits => &mut self.cache_hits,
            ResourceKind::CacheMisses => &mut self.cache_misses,
        };
        *slot = match op {
            ResourceOp::Add => slot.saturating_add(value),
            ResourceOp::Set => value,
            ResourceOp::Max => (*slot).max(value),
        };
    }
}

/// 风险等级：创建后只能升级
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SecurityInfo {
    pub authenticated: bool,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsInfo {
    pub tags: BTreeSet<String>,
    pub trace_id: String,
    pub debug: bool,
    pub experiment: Option<String>,
}

/// 单个任务的执行上下文
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionContext {
    pub task_id: String,
    pub created_at: DateTime<Utc>,
    pub request: RequestInfo,
    /// 跨步骤通信用的可变数据
    pub dynamic: HashMap<String, Value>,
    pub steps: Vec<StepRecord>,
    pub service_calls: Vec<ServiceCallRecord>,
    pub workflow_runs: Vec<WorkflowRunRecord>,
    pub errors: Vec<LogEntry>,
    pub warnings: Vec<LogEntry>,
    pub resources: ResourceCounters,
    pub security: SecurityInfo,
    pub analytics: AnalyticsInfo,
    pub cancelled: bool,
}

impl ExecutionContext {
    pub fn new(task_id: impl Into<String>, caller: CallerMetadata) -> Self {
        let headers = caller
            .headers
            .into_iter()
            .filter(|(name, _)| !is_sensitive_header(name))
            .collect();

        Self {
            task_id: task_id.into(),
            created_at: Utc::now(),
            request: RequestInfo {
                caller_id: caller.caller_id,
                session_id: caller.session_id,
                origin: caller.origin,
                headers,
            },
            dynamic: HashMap::new(),
            steps: Vec::new(),
            service_calls: Vec::new(),
            workflow_runs: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            resources: ResourceCounters::default(),
            security: SecurityInfo {
                authenticated: caller.authenticated,
                roles: caller.roles,
                permissions: caller.permissions,
                risk_level: RiskLevel::Low,
            },
            analytics: AnalyticsInfo {
                tags: caller.tags.into_iter().collect(),
                trace_id: uuid::Uuid::new_v4().to_string(),
                debug: caller.debug,
                experiment: caller.experiment,
            },
            cancelled: false,
        }
    }

    /// 只升不降，返回是否发生了变化
    pub fn escalate_risk(&mut self, level: RiskLevel) -> bool {
        if level > self.security.risk_level {
            self.security.risk_level = level;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_headers_dropped() {
        let caller = CallerMetadata::new()
            .with_header("Authorization", "Bearer x")
            .with_header("Cookie", "a=b")
            .with_header("X-Api-Key", "k")
            .with_header("Accept", "application/json");
        let ctx = ExecutionContext::new("t", caller);
        assert_eq!(ctx.request.headers.len(), 1);
        assert_eq!(ctx.request.headers.get("Accept").map(String::as_str), Some("application/json"));
    }

    #[test]
    fn test_resource_ops() {
        let mut r = ResourceCounters::default();
        r.apply(ResourceKind::DiskOps, 2, ResourceOp::Add);
        r.apply(ResourceKind::DiskOps, 3, ResourceOp::Add);
        r.apply(ResourceKind::MemoryDelta, 100, ResourceOp::Max);
        r.apply(ResourceKind::MemoryDelta, 40, ResourceOp::Max);
        r.apply(ResourceKind::NetworkCalls, 9, ResourceOp::Set);
        r.apply(ResourceKind::NetworkCalls, 1, ResourceOp::Set);
        assert_eq!(r.get(ResourceKind::DiskOps), 5);
        assert_eq!(r.get(ResourceKind::MemoryDelta), 100);
        assert_eq!(r.get(ResourceKind::NetworkCalls), 1);
    }

    #[test]
    fn test_risk_only_escalates() {
        let mut ctx = ExecutionContext::new("t", CallerMetadata::default());
        assert!(ctx.escalate_risk(RiskLevel::High));
        assert!(!ctx.escalate_risk(RiskLevel::Medium));
        assert_eq!(ctx.security.risk_level, RiskLevel::High);
        assert!(ctx.escalate_risk(RiskLevel::Critical));
    }
}
