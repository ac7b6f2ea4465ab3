//! KV 存储模块 - 基于 sled 的键值存储
//!
//! 本模块提供：
//! - 进程重启后仍然可用的持久化键值存储
//! - 单 key 写入相对进程崩溃是原子的（不会出现"看似有效却被截断"的值）
//! - 读取到无法反序列化的值时按"不存在"处理，而不是硬失败

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};
use tracing::warn;

use crate::error::{Result, VitalSyncError};

/// 同步引擎专用 Tree 名称
const SYNC_TREE: &str = "sync";

/// KV 存储组件
#[derive(Debug, Clone)]
pub struct KvStore {
    #[allow(dead_code)]
    base_path: PathBuf,
    /// 主数据库实例
    db: Arc<Db>,
    /// 同步引擎专属的 Tree 实例
    tree: Tree,
}

impl KvStore {
    /// 打开 KV 存储实例
    pub async fn open(base_path: &Path) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("kv");

        // 创建 KV 存储目录
        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| VitalSyncError::Io(format!("创建 KV 存储目录失败: {}", e)))?;

        // 打开 sled 数据库（上一个进程实例可能刚释放锁，重试多次带退避）
        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut db_opt: Option<sled::Db> = None;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(d) => {
                    db_opt = Some(d);
                    break;
                }
                Err(e) => {
                    let msg = format!("{}", e);
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            VitalSyncError::KvStore(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        let tree = db
            .open_tree(SYNC_TREE)
            .map_err(|e| VitalSyncError::KvStore(format!("打开 Tree 失败: {}", e)))?;

        Ok(Self {
            base_path,
            db: Arc::new(db),
            tree,
        })
    }

    /// 写入键值对（serde_json 序列化）
    pub async fn set<K, V>(&self, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let value_bytes = serde_json::to_vec(value)
            .map_err(|e| VitalSyncError::Serialization(format!("序列化失败: {}", e)))?;

        self.tree
            .insert(key.as_ref(), value_bytes)
            .map_err(|e| VitalSyncError::KvStore(format!("写入失败: {}", e)))?;

        Ok(())
    }

    /// 读取键值对
    ///
    /// 值存在但无法反序列化时（磁盘损坏、版本不兼容）记录日志并返回 `None`，
    /// 调用方按"不存在"处理。
    pub async fn get<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: DeserializeOwned,
    {
        let value_bytes = self
            .tree
            .get(key.as_ref())
            .map_err(|e| VitalSyncError::KvStore(format!("读取失败: {}", e)))?;

        match value_bytes {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    warn!(
                        "KV 值反序列化失败，按不存在处理: key={}, error={}",
                        String::from_utf8_lossy(key.as_ref()),
                        e
                    );
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// 删除键值对
    pub async fn remove<K>(&self, key: K) -> Result<()>
    where
        K: AsRef<[u8]>,
    {
        self.tree
            .remove(key.as_ref())
            .map_err(|e| VitalSyncError::KvStore(format!("删除失败: {}", e)))?;
        Ok(())
    }

    /// 检查键是否存在
    pub async fn contains<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        self.tree
            .contains_key(key.as_ref())
            .map_err(|e| VitalSyncError::KvStore(format!("查询失败: {}", e)))
    }

    /// 落盘（关键断点写入后调用，保证崩溃后可恢复）
    pub async fn flush(&self) -> Result<()> {
        let tree = self.tree.clone();
        tokio::task::spawn_blocking(move || tree.flush())
            .await
            .map_err(|e| VitalSyncError::Other(format!("flush 任务失败: {}", e)))?
            .map_err(|e| VitalSyncError::KvStore(format!("flush 失败: {}", e)))?;
        Ok(())
    }
}
