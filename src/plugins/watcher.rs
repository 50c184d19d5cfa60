//! 插件目录变更通知（开发模式热重载）

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use walkdir::WalkDir;

use super::discovery::{expand_roots, plugin_dirs};

/// 变更来源；`changed` 阻塞直到有插件目录发生变化
#[async_trait]
pub trait ChangeNotifier: Send {
    async fn changed(&mut self) -> Vec<PathBuf>;
}

type Snapshot = HashMap<PathBuf, Option<SystemTime>>;

/// 轮询实现：比较每个插件目录内最新的修改时间
pub struct PollingNotifier {
    patterns: Vec<String>,
    interval: Duration,
    snapshot: Snapshot,
}

impl PollingNotifier {
    pub fn new(patterns: Vec<String>, interval: Duration) -> Self {
        let snapshot = scan(&patterns);
        Self {
            patterns,
            interval,
            snapshot,
        }
    }

    /// 立即比较一次，返回变化的目录（新增、修改、删除）
    pub fn poll_now(&mut self) -> Vec<PathBuf> {
        let current = scan(&self.patterns);
        self.diff(current)
    }

    fn diff(&mut self, current: Snapshot) -> Vec<PathBuf> {
        let mut changed: Vec<PathBuf> = current
            .iter()
            .filter(|(dir, mtime)| self.snapshot.get(*dir) != Some(*mtime))
            .map(|(dir, _)| dir.clone())
            .collect();
        changed.extend(self.snapshot.keys().filter(|d| !current.contains_key(*d)).cloned());
        changed.sort();
        self.snapshot = current;
        changed
    }
}

#[async_trait]
impl ChangeNotifier for PollingNotifier {
    async fn changed(&mut self) -> Vec<PathBuf> {
        loop {
            tokio::time::sleep(self.interval).await;
            let patterns = self.patterns.clone();
            let current = match tokio::task::spawn_blocking(move || scan(&patterns)).await {
                Ok(current) => current,
                Err(e) => {
                    tracing::warn!("Plugin directory scan failed: {}", e);
                    continue;
                }
            };
            let changed = self.diff(current);
            if !changed.is_empty() {
                return changed;
            }
        }
    }
}

fn scan(patterns: &[String]) -> Snapshot {
    let roots = expand_roots(patterns);
    plugin_dirs(&roots)
        .into_iter()
        .map(|dir| {
            let newest = WalkDir::new(&dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter_map(|e| e.metadata().ok())
                .filter_map(|m| m.modified().ok())
                .max();
            (dir, newest)
        })
        .collect()
}
