//! 状态存储：全局 / 会话 / 任务三级作用域的键值状态
//!
//! - 同步 API，数据锁（parking_lot）从不跨 `.await` 持有
//! - 每次变更按 glob 模式通知订阅者；回调出错或 panic 只记日志
//! - 可选持久化：变更后把整个作用域快照交给后台写入任务
//! - 会话 / 任务作用域按创建时间过期回收

mod pattern;
mod persistence;
mod scope;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::StateSection;
use crate::core::error::OrchestratorError;
use crate::core::events::{EventBus, LifecycleEvent};

pub use pattern::KeyPattern;
pub use persistence::{DurableStorage, FileSnapshotStorage, MemoryStorage};
pub use scope::{ScopeData, ScopeMeta, StateChange, StateScope, WatchScope};

use persistence::{PersistOp, ScopeFile};

/// 状态存储错误
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Invalid watch pattern: {0}")]
    InvalidPattern(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StateError> for OrchestratorError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::InvalidPattern(msg) => OrchestratorError::Validation(msg),
            other => OrchestratorError::Storage(other.to_string()),
        }
    }
}

/// 订阅回调
pub type WatchCallback = Arc<dyn Fn(&StateChange) -> anyhow::Result<()> + Send + Sync>;

struct Watcher {
    id: u64,
    scope: WatchScope,
    pattern: KeyPattern,
    callback: WatchCallback,
}

type WatcherList = Arc<Mutex<Vec<Watcher>>>;

/// 订阅句柄；unsubscribe 幂等。丢弃句柄不会取消订阅
pub struct WatchHandle {
    id: u64,
    watchers: Weak<Mutex<Vec<Watcher>>>,
}

impl WatchHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 取消订阅，返回本次是否真正移除了订阅
    pub fn unsubscribe(&self) -> bool {
        let Some(watchers) = self.watchers.upgrade() else {
            return false;
        };
        let mut list = watchers.lock();
        let before = list.len();
        list.retain(|w| w.id != self.id);
        before != list.len()
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle").field("id", &self.id).finish()
    }
}

/// 导出 / 导入用的完整快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub global: ScopeData,
    pub sessions: HashMap<String, ScopeData>,
    pub tasks: HashMap<String, ScopeData>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateStats {
    pub global_keys: usize,
    pub sessions: usize,
    pub tasks: usize,
    pub watchers: usize,
}

/// 一次过期回收的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub sessions: Vec<String>,
    pub tasks: Vec<String>,
}

impl EvictionReport {
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.tasks.is_empty()
    }
}

/// 启动时从持久化存储恢复的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: usize,
    pub discarded: usize,
}

#[derive(Default)]
struct StateInner {
    global: ScopeData,
    sessions: HashMap<String, ScopeData>,
    tasks: HashMap<String, ScopeData>,
}

impl StateInner {
    fn scope(&self, scope: &StateScope) -> Option<&ScopeData> {
        match scope {
            StateScope::Global => Some(&self.global),
            StateScope::Session(id) => self.sessions.get(id),
            StateScope::Task(id) => self.tasks.get(id),
        }
    }

    fn scope_mut(&mut self, scope: &StateScope, create: bool) -> Option<&mut ScopeData> {
        let (map, id) = match scope {
            StateScope::Global => return Some(&mut self.global),
            StateScope::Session(id) => (&mut self.sessions, id),
            StateScope::Task(id) => (&mut self.tasks, id),
        };
        if create {
            Some(map.entry(id.clone()).or_default())
        } else {
            map.get_mut(id)
        }
    }
}

enum Mutation {
    Set(Value),
    Delete,
}

/// 三级作用域状态存储
pub struct StateStore {
    inner: Mutex<StateInner>,
    watchers: WatcherList,
    /// 通知门：同一线程内回调里再写状态不会死锁
    notify_gate: ReentrantMutex<()>,
    next_watcher_id: AtomicU64,
    events: Option<EventBus>,
    storage: Option<Arc<dyn DurableStorage>>,
    writer: Mutex<Option<mpsc::UnboundedSender<PersistOp>>>,
    session_max_age: Duration,
    task_max_age: Duration,
}

impl StateStore {
    pub fn new() -> Self {
        Self::with_limits(Duration::from_secs(86_400), Duration::from_secs(3_600))
    }

    pub fn with_limits(session_max_age: Duration, task_max_age: Duration) -> Self {
        Self {
            inner: Mutex::new(StateInner::default()),
            watchers: Arc::new(Mutex::new(Vec::new())),
            notify_gate: ReentrantMutex::new(()),
            next_watcher_id: AtomicU64::new(1),
            events: None,
            storage: None,
            writer: Mutex::new(None),
            session_max_age,
            task_max_age,
        }
    }

    pub fn from_config(config: &StateSection) -> Self {
        let store = Self::with_limits(
            Duration::from_secs(config.session_max_age_secs),
            Duration::from_secs(config.task_max_age_secs),
        );
        if config.persistence_enabled {
            store.with_storage(Arc::new(FileSnapshotStorage::new(&config.persistence_dir)))
        } else {
            store
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn DurableStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn persistence_enabled(&self) -> bool {
        self.storage.is_some()
    }

    /// 启动持久化写入任务并恢复已保存的作用域；未配置存储时直接返回
    pub async fn init(&self) -> Result<RestoreReport, StateError> {
        let Some(storage) = self.storage.clone() else {
            return Ok(RestoreReport::default());
        };
        {
            let mut writer = self.writer.lock();
            if writer.is_none() {
                *writer = Some(persistence::spawn_writer(Arc::clone(&storage)));
            }
        }
        self.restore_from(storage.as_ref()).await
    }

    async fn restore_from(&self, storage: &dyn DurableStorage) -> Result<RestoreReport, StateError> {
        let now = Utc::now();
        let mut report = RestoreReport::default();

        for scope_id in storage.list().await? {
            let Some(blob) = storage.read_snapshot(&scope_id).await? else {
                continue;
            };
            let file: ScopeFile = match serde_json::from_slice(&blob) {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!("Skipping unreadable state snapshot {}: {}", scope_id, e);
                    report.discarded += 1;
                    continue;
                }
            };
            let Some(scope) = StateScope::from_storage_id(&file.scope) else {
                tracing::warn!("Skipping snapshot with unknown scope {}", file.scope);
                report.discarded += 1;
                continue;
            };

            if self.is_expired(&scope, &file.data.meta, now) {
                tracing::debug!("Discarding expired persisted scope {}", scope);
                storage.delete(&scope_id).await?;
                report.discarded += 1;
                continue;
            }

            {
                let mut inner = self.inner.lock();
                match scope {
                    StateScope::Global => inner.global = file.data,
                    StateScope::Session(id) => {
                        inner.sessions.insert(id, file.data);
                    }
                    StateScope::Task(id) => {
                        inner.tasks.insert(id, file.data);
                    }
                }
            }
            report.restored += 1;
        }

        tracing::info!(
            "State restored: {} scopes loaded, {} discarded",
            report.restored,
            report.discarded
        );
        Ok(report)
    }

    /// 等待已排队的持久化写入全部完成
    pub async fn flush(&self) {
        let sender = self.writer.lock().clone();
        if let Some(tx) = sender {
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(PersistOp::Flush(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
        }
    }

    /// 刷盘后停止写入任务
    pub async fn shutdown(&self) {
        self.flush().await;
        self.writer.lock().take();
    }

    // ---------- 全局作用域 ----------

    pub fn set_global(&self, key: &str, value: Value) -> Option<Value> {
        self.mutate(StateScope::Global, key, Mutation::Set(value))
    }

    pub fn get_global(&self, key: &str) -> Option<Value> {
        self.get(&StateScope::Global, key)
    }

    pub fn get_global_or(&self, key: &str, default: Value) -> Value {
        self.get_global(key).unwrap_or(default)
    }

    pub fn delete_global(&self, key: &str) -> Option<Value> {
        self.mutate(StateScope::Global, key, Mutation::Delete)
    }

    // ---------- 会话作用域 ----------

    pub fn set_session(&self, session_id: &str, key: &str, value: Value) -> Option<Value> {
        self.mutate(StateScope::Session(session_id.to_string()), key, Mutation::Set(value))
    }

    pub fn get_session(&self, session_id: &str, key: &str) -> Option<Value> {
        self.get(&StateScope::Session(session_id.to_string()), key)
    }

    pub fn get_session_or(&self, session_id: &str, key: &str, default: Value) -> Value {
        self.get_session(session_id, key).unwrap_or(default)
    }

    pub fn delete_session(&self, session_id: &str, key: &str) -> Option<Value> {
        self.mutate(StateScope::Session(session_id.to_string()), key, Mutation::Delete)
    }

    /// 整体清除一个会话（不逐键通知订阅者）
    pub fn clear_session(&self, session_id: &str) -> bool {
        self.clear_scope(StateScope::Session(session_id.to_string()))
    }

    // ---------- 任务作用域 ----------

    pub fn set_task(&self, task_id: &str, key: &str, value: Value) -> Option<Value> {
        self.mutate(StateScope::Task(task_id.to_string()), key, Mutation::Set(value))
    }

    pub fn get_task(&self, task_id: &str, key: &str) -> Option<Value> {
        self.get(&StateScope::Task(task_id.to_string()), key)
    }

    pub fn get_task_or(&self, task_id: &str, key: &str, default: Value) -> Value {
        self.get_task(task_id, key).unwrap_or(default)
    }

    pub fn delete_task(&self, task_id: &str, key: &str) -> Option<Value> {
        self.mutate(StateScope::Task(task_id.to_string()), key, Mutation::Delete)
    }

    pub fn clear_task(&self, task_id: &str) -> bool {
        self.clear_scope(StateScope::Task(task_id.to_string()))
    }

    // ---------- 通用 ----------

    pub fn get(&self, scope: &StateScope, key: &str) -> Option<Value> {
        self.inner.lock().scope(scope).and_then(|d| d.entries.get(key).cloned())
    }

    pub fn keys(&self, scope: &StateScope) -> Vec<String> {
        self.inner
            .lock()
            .scope(scope)
            .map(|d| d.entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn scope_meta(&self, scope: &StateScope) -> Option<ScopeMeta> {
        self.inner.lock().scope(scope).map(|d| d.meta.clone())
    }

    /// 订阅匹配 `pattern` 的键变更
    pub fn watch<F>(&self, scope: WatchScope, pattern: &str, callback: F) -> Result<WatchHandle, StateError>
    where
        F: Fn(&StateChange) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let pattern = KeyPattern::new(pattern)?;
        let id = self.next_watcher_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Watcher {} registered for {:?} {}", id, scope, pattern.as_str());
        self.watchers.lock().push(Watcher {
            id,
            scope,
            pattern,
            callback: Arc::new(callback),
        });
        Ok(WatchHandle {
            id,
            watchers: Arc::downgrade(&self.watchers),
        })
    }

    /// 导出全部状态（深拷贝）
    pub fn export_state(&self) -> StateSnapshot {
        let inner = self.inner.lock();
        StateSnapshot {
            global: inner.global.clone(),
            sessions: inner.sessions.clone(),
            tasks: inner.tasks.clone(),
        }
    }

    /// 用快照整体替换当前状态；不触发订阅回调
    pub fn import_state(&self, snapshot: StateSnapshot) {
        let _gate = self.notify_gate.lock();
        let (stale, fresh): (Vec<String>, Vec<(String, Vec<u8>)>) = {
            let mut inner = self.inner.lock();
            let mut stale: Vec<String> = inner
                .sessions
                .keys()
                .map(|id| StateScope::Session(id.clone()).storage_id())
                .chain(inner.tasks.keys().map(|id| StateScope::Task(id.clone()).storage_id()))
                .collect();

            inner.global = snapshot.global;
            inner.sessions = snapshot.sessions;
            inner.tasks = snapshot.tasks;

            let mut fresh = Vec::new();
            if self.storage.is_some() {
                fresh.extend(encode_scope(&StateScope::Global, &inner.global));
                for (id, data) in &inner.sessions {
                    fresh.extend(encode_scope(&StateScope::Session(id.clone()), data));
                }
                for (id, data) in &inner.tasks {
                    fresh.extend(encode_scope(&StateScope::Task(id.clone()), data));
                }
            }
            stale.retain(|sid| !fresh.iter().any(|(f, _)| f == sid));
            (stale, fresh)
        };

        for sid in stale {
            self.persist(PersistOp::Delete(sid));
        }
        for (sid, blob) in fresh {
            self.persist(PersistOp::Write(sid, blob));
        }
        tracing::info!("State imported");
    }

    /// 回收过期的会话 / 任务作用域
    pub fn sweep_expired(&self) -> EvictionReport {
        let now = Utc::now();
        let _gate = self.notify_gate.lock();
        let report = {
            let mut inner = self.inner.lock();
            let mut report = EvictionReport::default();
            inner.sessions.retain(|id, data| {
                let expired = age_exceeds(&data.meta, now, self.session_max_age);
                if expired {
                    report.sessions.push(id.clone());
                }
                !expired
            });
            inner.tasks.retain(|id, data| {
                let expired = age_exceeds(&data.meta, now, self.task_max_age);
                if expired {
                    report.tasks.push(id.clone());
                }
                !expired
            });
            report
        };

        let evicted = report
            .sessions
            .iter()
            .map(|id| StateScope::Session(id.clone()))
            .chain(report.tasks.iter().map(|id| StateScope::Task(id.clone())));
        for scope in evicted {
            self.persist(PersistOp::Delete(scope.storage_id()));
            self.publish(LifecycleEvent::ScopeEvicted {
                scope: scope.storage_id(),
            });
        }
        if !report.is_empty() {
            tracing::info!(
                "Evicted {} sessions and {} tasks",
                report.sessions.len(),
                report.tasks.len()
            );
        }
        report
    }

    /// 周期性过期回收
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        store.sweep_expired();
                    }
                }
            }
            tracing::debug!("State cleanup loop stopped");
        })
    }

    pub fn stats(&self) -> StateStats {
        let inner = self.inner.lock();
        StateStats {
            global_keys: inner.global.entries.len(),
            sessions: inner.sessions.len(),
            tasks: inner.tasks.len(),
            watchers: self.watchers.lock().len(),
        }
    }

    // ---------- 内部 ----------

    fn mutate(&self, scope: StateScope, key: &str, mutation: Mutation) -> Option<Value> {
        let _gate = self.notify_gate.lock();

        let (change, blob) = {
            let mut inner = self.inner.lock();
            let create = matches!(mutation, Mutation::Set(_));
            let data = inner.scope_mut(&scope, create)?;
            let (old, new) = match mutation {
                Mutation::Set(value) => (data.entries.insert(key.to_string(), value.clone()), Some(value)),
                Mutation::Delete => (data.entries.remove(key), None),
            };
            data.meta.touch();
            // 删除不存在的键不算变更
            if new.is_none() && old.is_none() {
                return None;
            }
            let blob = if self.storage.is_some() {
                encode_scope(&scope, data)
            } else {
                None
            };
            (
                StateChange {
                    scope,
                    key: key.to_string(),
                    new_value: new,
                    old_value: old,
                },
                blob,
            )
        };

        if let Some((sid, bytes)) = blob {
            self.persist(PersistOp::Write(sid, bytes));
        }
        self.notify(&change);
        self.publish(LifecycleEvent::StateChanged {
            scope: change.scope.storage_id(),
            key: change.key.clone(),
        });
        change.old_value
    }

    fn clear_scope(&self, scope: StateScope) -> bool {
        let _gate = self.notify_gate.lock();
        let removed = {
            let mut inner = self.inner.lock();
            match &scope {
                StateScope::Global => {
                    inner.global.entries.clear();
                    inner.global.meta.touch();
                    true
                }
                StateScope::Session(id) => inner.sessions.remove(id).is_some(),
                StateScope::Task(id) => inner.tasks.remove(id).is_some(),
            }
        };
        if removed {
            self.persist(PersistOp::Delete(scope.storage_id()));
            self.publish(LifecycleEvent::StateChanged {
                scope: scope.storage_id(),
                key: "*".to_string(),
            });
        }
        removed
    }

    fn notify(&self, change: &StateChange) {
        // 先复制出匹配的回调再调用，回调内可以自由订阅 / 退订
        let callbacks: Vec<(u64, WatchCallback)> = self
            .watchers
            .lock()
            .iter()
            .filter(|w| w.scope.covers(&change.scope) && w.pattern.matches(&change.key))
            .map(|w| (w.id, Arc::clone(&w.callback)))
            .collect();

        for (id, callback) in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(change))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!("Watcher {} failed on {} {}: {}", id, change.scope, change.key, e);
                }
                Err(_) => {
                    tracing::error!("Watcher {} panicked on {} {}", id, change.scope, change.key);
                }
            }
        }
    }

    fn persist(&self, op: PersistOp) {
        if let Some(tx) = self.writer.lock().as_ref() {
            if tx.send(op).is_err() {
                tracing::warn!("State persistence writer is gone; change kept in memory only");
            }
        }
    }

    fn publish(&self, event: LifecycleEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    fn is_expired(&self, scope: &StateScope, meta: &ScopeMeta, now: DateTime<Utc>) -> bool {
        match scope {
            StateScope::Global => false,
            StateScope::Session(_) => age_exceeds(meta, now, self.session_max_age),
            StateScope::Task(_) => age_exceeds(meta, now, self.task_max_age),
        }
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

fn age_exceeds(meta: &ScopeMeta, now: DateTime<Utc>, max_age: Duration) -> bool {
    match meta.age(now).to_std() {
        Ok(age) => age > max_age,
        // created_at 在未来（时钟回拨）
        Err(_) => false,
    }
}

fn encode_scope(scope: &StateScope, data: &ScopeData) -> Option<(String, Vec<u8>)> {
    let file = ScopeFile {
        scope: scope.storage_id(),
        data: data.clone(),
    };
    match serde_json::to_vec(&file) {
        Ok(bytes) => Some((scope.storage_id(), bytes)),
        Err(e) => {
            tracing::warn!("Failed to encode scope {}: {}", scope, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_scopes_are_isolated() {
        let store = StateStore::new();
        store.set_global("k", json!(1));
        store.set_session("s1", "k", json!(2));
        store.set_task("t1", "k", json!(3));

        assert_eq!(store.get_global("k"), Some(json!(1)));
        assert_eq!(store.get_session("s1", "k"), Some(json!(2)));
        assert_eq!(store.get_task("t1", "k"), Some(json!(3)));
        assert_eq!(store.get_session("s2", "k"), None);
        assert_eq!(store.get_task_or("t2", "k", json!("d")), json!("d"));
    }

    #[test]
    fn test_set_returns_previous_and_counts_operations() {
        let store = StateStore::new();
        assert_eq!(store.set_session("s", "a", json!(1)), None);
        assert_eq!(store.set_session("s", "a", json!(2)), Some(json!(1)));
        assert_eq!(store.delete_session("s", "a"), Some(json!(2)));
        assert_eq!(store.delete_session("s", "a"), None);

        let meta = store.scope_meta(&StateScope::Session("s".into())).unwrap();
        assert_eq!(meta.operation_count, 4);
        assert!(meta.last_accessed >= meta.created_at);
    }

    #[test]
    fn test_delete_on_missing_scope_does_not_create_it() {
        let store = StateStore::new();
        assert_eq!(store.delete_task("nope", "k"), None);
        assert_eq!(store.stats().tasks, 0);
    }

    #[test]
    fn test_watcher_pattern_and_scope_filtering() {
        let store = StateStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _h = store
            .watch(WatchScope::AnySession, "user:*", move |c| {
                sink.lock().push((c.key.clone(), c.new_value.clone(), c.old_value.clone()));
                Ok(())
            })
            .unwrap();

        store.set_session("s1", "user:42", json!({"name": "x"}));
        store.set_session("s1", "order:1", json!(1));
        store.set_global("user:7", json!(1));
        store.delete_session("s1", "user:42");

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ("user:42".into(), Some(json!({"name": "x"})), None));
        assert_eq!(seen[1], ("user:42".into(), None, Some(json!({"name": "x"}))));
    }

    #[test]
    fn test_failing_and_panicking_watchers_are_isolated() {
        let store = StateStore::new();
        let hits = Arc::new(AtomicUsize::new(0));
        store
            .watch(WatchScope::Global, "*", |_| anyhow::bail!("nope"))
            .unwrap();
        store
            .watch(WatchScope::Global, "*", |_| panic!("watcher blew up"))
            .unwrap();
        let counter = Arc::clone(&hits);
        store
            .watch(WatchScope::Global, "*", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        store.set_global("a", json!(1));
        assert_eq!(store.get_global("a"), Some(json!(1)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let store = StateStore::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let handle = store
            .watch(WatchScope::Global, "k", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        store.set_global("k", json!(1));
        assert!(handle.unsubscribe());
        assert!(!handle.unsubscribe());
        store.set_global("k", json!(2));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_watcher_may_write_state_reentrantly() {
        let store = Arc::new(StateStore::new());
        let inner = Arc::downgrade(&store);
        store
            .watch(WatchScope::Global, "source", move |c| {
                if let Some(store) = inner.upgrade() {
                    store.set_global("mirror", c.new_value.clone().unwrap_or(Value::Null));
                }
                Ok(())
            })
            .unwrap();

        store.set_global("source", json!("v"));
        assert_eq!(store.get_global("mirror"), Some(json!("v")));
    }

    #[test]
    fn test_export_import_roundtrip_without_notifications() {
        let store = StateStore::new();
        store.set_global("g", json!(true));
        store.set_session("s", "k", json!([1, 2]));
        store.set_task("t", "k", json!({"a": 1}));
        let snapshot = store.export_state();

        let restored = StateStore::new();
        restored.set_session("old", "x", json!(0));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        restored
            .watch(WatchScope::AnySession, "*", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        restored.import_state(snapshot.clone());

        assert_eq!(restored.export_state(), snapshot);
        assert_eq!(restored.get_session("old", "x"), None);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_sweep_evicts_expired_scopes_only() {
        let store = StateStore::with_limits(Duration::from_millis(30), Duration::from_secs(60));
        store.set_session("old", "k", json!(1));
        std::thread::sleep(Duration::from_millis(60));
        store.set_session("new", "k", json!(1));
        store.set_task("t", "k", json!(1));
        store.set_global("g", json!(1));

        let report = store.sweep_expired();
        assert_eq!(report.sessions, vec!["old".to_string()]);
        assert!(report.tasks.is_empty());
        assert_eq!(store.get_session("old", "k"), None);
        assert_eq!(store.get_session("new", "k"), Some(json!(1)));
        assert_eq!(store.get_global("g"), Some(json!(1)));
    }

    #[test]
    fn test_clear_session() {
        let store = StateStore::new();
        store.set_session("s", "a", json!(1));
        assert!(store.clear_session("s"));
        assert!(!store.clear_session("s"));
        assert!(store.keys(&StateScope::Session("s".into())).is_empty());
    }

    #[tokio::test]
    async fn test_persistence_survives_restart() {
        let storage = MemoryStorage::new();
        let store = StateStore::new().with_storage(Arc::new(storage.clone()));
        store.init().await.unwrap();
        store.set_global("g", json!(1));
        store.set_session("s", "k", json!("v"));
        store.set_task("t", "k", json!(2));
        store.clear_task("t");
        store.flush().await;

        let reopened = StateStore::new().with_storage(Arc::new(storage.clone()));
        let report = reopened.init().await.unwrap();
        assert_eq!(report.restored, 2);
        assert_eq!(reopened.get_global("g"), Some(json!(1)));
        assert_eq!(reopened.get_session("s", "k"), Some(json!("v")));
        assert_eq!(reopened.get_task("t", "k"), None);
    }

    #[tokio::test]
    async fn test_restore_discards_expired_sessions() {
        let storage = MemoryStorage::new();
        let store = StateStore::new().with_storage(Arc::new(storage.clone()));
        store.init().await.unwrap();
        store.set_session("s", "k", json!(1));
        store.flush().await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let reopened = StateStore::with_limits(Duration::from_millis(10), Duration::from_secs(60))
            .with_storage(Arc::new(storage.clone()));
        let report = reopened.init().await.unwrap();
        assert_eq!(report.discarded, 1);
        assert_eq!(reopened.get_session("s", "k"), None);
        assert!(storage.list().await.unwrap().is_empty());
    }

    #[test]
    fn test_mutations_publish_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let store = StateStore::new().with_events(bus);
        store.set_task("t", "step", json!(1));

        let env = rx.try_recv().unwrap();
        assert_eq!(
            env.event,
            LifecycleEvent::StateChanged {
                scope: "task:t".into(),
                key: "step".into(),
            }
        );
    }
}
