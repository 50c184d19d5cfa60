//! 状态作用域与作用域容器

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 状态作用域：全局 / 会话 / 任务，键互不冲突
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum StateScope {
    Global,
    Session(String),
    Task(String),
}

impl StateScope {
    /// 持久化键："global"、"session:<id>"、"task:<id>"
    pub fn storage_id(&self) -> String {
        match self {
            Self::Global => "global".to_string(),
            Self::Session(id) => format!("session:{}", id),
            Self::Task(id) => format!("task:{}", id),
        }
    }

    pub fn from_storage_id(raw: &str) -> Option<Self> {
        if raw == "global" {
            return Some(Self::Global);
        }
        let (kind, id) = raw.split_once(':')?;
        if id.is_empty() {
            return None;
        }
        match kind {
            "session" => Some(Self::Session(id.to_string())),
            "task" => Some(Self::Task(id.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for StateScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_id())
    }
}

/// 订阅作用域：可订阅某个具体实例，也可订阅一类作用域的全部实例
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchScope {
    Global,
    AnySession,
    Session(String),
    AnyTask,
    Task(String),
}

impl WatchScope {
    pub fn covers(&self, scope: &StateScope) -> bool {
        match (self, scope) {
            (Self::Global, StateScope::Global) => true,
            (Self::AnySession, StateScope::Session(_)) => true,
            (Self::Session(a), StateScope::Session(b)) => a == b,
            (Self::AnyTask, StateScope::Task(_)) => true,
            (Self::Task(a), StateScope::Task(b)) => a == b,
            _ => false,
        }
    }
}

/// 作用域元数据（会话 / 任务按 created_at 做过期回收）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeMeta {
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub operation_count: u64,
}

impl ScopeMeta {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            last_accessed: now,
            operation_count: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_accessed = Utc::now();
        self.operation_count += 1;
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

impl Default for ScopeMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// 单个作用域实例的数据
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeData {
    pub entries: BTreeMap<String, Value>,
    pub meta: ScopeMeta,
}

/// 一次状态变更（推送给订阅者）
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub scope: StateScope,
    pub key: String,
    /// 删除时为 None
    pub new_value: Option<Value>,
    pub old_value: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_id_roundtrip() {
        for scope in [
            StateScope::Global,
            StateScope::Session("s:1".into()),
            StateScope::Task("t".into()),
        ] {
            assert_eq!(StateScope::from_storage_id(&scope.storage_id()), Some(scope));
        }
        assert_eq!(StateScope::from_storage_id("session:"), None);
        assert_eq!(StateScope::from_storage_id("bogus:1"), None);
    }

    #[test]
    fn test_watch_scope_coverage() {
        let s1 = StateScope::Session("1".into());
        assert!(WatchScope::AnySession.covers(&s1));
        assert!(WatchScope::Session("1".into()).covers(&s1));
        assert!(!WatchScope::Session("2".into()).covers(&s1));
        assert!(!WatchScope::Global.covers(&s1));
        assert!(!WatchScope::AnyTask.covers(&s1));
    }
}
