//! 状态快照持久化
//!
//! DurableStorage 是外部存储契约（任何键 / blob 存储都可以满足）；
//! 这里提供文件实现（每个作用域一个 JSON 文件）与内存实现。写入由单个后台任务按变更顺序串行执行。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{mpsc, oneshot};

use super::scope::ScopeData;
use super::StateError;

/// 持久化存储契约
#[async_trait]
pub trait DurableStorage: Send + Sync {
    async fn write_snapshot(&self, scope_id: &str, blob: Vec<u8>) -> Result<(), StateError>;

    /// 不存在时返回 None
    async fn read_snapshot(&self, scope_id: &str) -> Result<Option<Vec<u8>>, StateError>;

    /// 删除不存在的快照不算错误
    async fn delete(&self, scope_id: &str) -> Result<(), StateError>;

    async fn list(&self) -> Result<Vec<String>, StateError>;
}

/// 单个作用域的落盘格式
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ScopeFile {
    pub scope: String,
    #[serde(flatten)]
    pub data: ScopeData,
}

/// 文件存储：`<dir>/<编码后的 scope id>.json`
#[derive(Debug, Clone)]
pub struct FileSnapshotStorage {
    dir: PathBuf,
}

impl FileSnapshotStorage {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, scope_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_file_stem(scope_id)))
    }
}

#[async_trait]
impl DurableStorage for FileSnapshotStorage {
    async fn write_snapshot(&self, scope_id: &str, blob: Vec<u8>) -> Result<(), StateError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(scope_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, blob).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read_snapshot(&self, scope_id: &str) -> Result<Option<Vec<u8>>, StateError> {
        match fs::read(self.path_for(scope_id)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, scope_id: &str) -> Result<(), StateError> {
        match fs::remove_file(self.path_for(scope_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>, StateError> {
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Some(id) = decode_file_stem(stem) {
                    out.push(id);
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

/// 内存存储（测试与无盘环境）
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStorage for MemoryStorage {
    async fn write_snapshot(&self, scope_id: &str, blob: Vec<u8>) -> Result<(), StateError> {
        self.blobs.lock().insert(scope_id.to_string(), blob);
        Ok(())
    }

    async fn read_snapshot(&self, scope_id: &str) -> Result<Option<Vec<u8>>, StateError> {
        Ok(self.blobs.lock().get(scope_id).cloned())
    }

    async fn delete(&self, scope_id: &str) -> Result<(), StateError> {
        self.blobs.lock().remove(scope_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StateError> {
        let mut ids: Vec<String> = self.blobs.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// scope id → 文件名：字母数字与 `-` `_` 原样保留，其余字节写成 `%XX`
fn encode_file_stem(scope_id: &str) -> String {
    let mut out = String::with_capacity(scope_id.len());
    for b in scope_id.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn decode_file_stem(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// 后台写入队列中的操作
pub(crate) enum PersistOp {
    Write(String, Vec<u8>),
    Delete(String),
    Flush(oneshot::Sender<()>),
}

/// 启动串行写入任务：失败只记日志，不影响内存状态
pub(crate) fn spawn_writer(storage: Arc<dyn DurableStorage>) -> mpsc::UnboundedSender<PersistOp> {
    let (tx, mut rx) = mpsc::unbounded_channel::<PersistOp>();
    tokio::spawn(async move {
        while let Some(op) = rx.recv().await {
            match op {
                PersistOp::Write(scope_id, blob) => {
                    if let Err(e) = storage.write_snapshot(&scope_id, blob).await {
                        tracing::warn!("Failed to persist state scope {}: {}", scope_id, e);
                    }
                }
                PersistOp::Delete(scope_id) => {
                    if let Err(e) = storage.delete(&scope_id).await {
                        tracing::warn!("Failed to delete persisted scope {}: {}", scope_id, e);
                    }
                }
                PersistOp::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        tracing::debug!("State persistence writer stopped");
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_stem_encoding() {
        for id in ["global", "session:abc", "task:a/b c", "session:用户"] {
            let stem = encode_file_stem(id);
            assert!(!stem.contains(':') && !stem.contains('/'));
            assert_eq!(decode_file_stem(&stem).as_deref(), Some(id));
        }
        assert_eq!(decode_file_stem("bad%Z"), None);
    }

    #[tokio::test]
    async fn test_file_storage_crud() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileSnapshotStorage::new(dir.path().join("state"));

        assert!(storage.list().await.unwrap().is_empty());
        storage.write_snapshot("session:s1", b"{}".to_vec()).await.unwrap();
        storage.write_snapshot("global", b"[]".to_vec()).await.unwrap();

        assert_eq!(storage.list().await.unwrap(), vec!["global", "session:s1"]);
        assert_eq!(
            storage.read_snapshot("session:s1").await.unwrap(),
            Some(b"{}".to_vec())
        );
        storage.delete("session:s1").await.unwrap();
        storage.delete("session:s1").await.unwrap();
        assert_eq!(storage.read_snapshot("session:s1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_writer_applies_in_order() {
        let storage = MemoryStorage::new();
        let tx = spawn_writer(Arc::new(storage.clone()));
        tx.send(PersistOp::Write("global".into(), b"1".to_vec())).unwrap();
        tx.send(PersistOp::Write("global".into(), b"2".to_vec())).unwrap();
        tx.send(PersistOp::Delete("task:x".into())).unwrap();
        let (done_tx, done_rx) = oneshot::channel();
        tx.send(PersistOp::Flush(done_tx)).unwrap();
        done_rx.await.unwrap();

        assert_eq!(storage.read_snapshot("global").await.unwrap(), Some(b"2".to_vec()));
    }
}
