//! 存储模块 - 同步引擎的数据持久化层
//!
//! 分层设计：
//! - KvStore: 基于 sled 的底层键值存储
//! - SyncStore: 面向同步引擎的类型化门面（水位线、冷却时间戳、断点状态、进度快照）
//!
//! 同步会话是这些 key 的唯一写入方；时间字段一律以 UTC 毫秒时间戳（i64）落盘。

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use crate::error::Result;
use crate::progress::ProgressState;
use crate::sync::{ResumableSyncState, SyncType};

pub mod kv;

pub use kv::KvStore;

/// 存储键常量
pub mod keys {
    /// 各同步类型的水位线键前缀（后跟 SyncType 的稳定字符串键）
    pub const LAST_SYNC_TIME_PREFIX: &str = "last_sync_time:";
    /// 冷却：最近一次同步尝试的时间戳（进程级，不区分同步类型）
    pub const SYNC_COOLDOWN_LAST_ATTEMPT: &str = "sync_cooldown_last_attempt";
    /// 可恢复同步断点
    pub const RESUMABLE_SYNC_STATE: &str = "resumable_sync_state";
    /// 进度快照（进程被杀后下次启动可报告"上次正在同步"）
    pub const SYNC_PROGRESS_STATE: &str = "sync_progress_state";
}

/// 同步引擎存储门面
#[derive(Debug, Clone)]
pub struct SyncStore {
    kv: KvStore,
}

impl SyncStore {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    /// 落盘（关停前调用）
    pub async fn flush(&self) -> Result<()> {
        self.kv.flush().await
    }

    // ============================================================
    // 水位线
    // ============================================================

    /// 获取指定同步类型的水位线（最近一次成功同步覆盖到的时间点）
    pub async fn last_sync_time(&self, sync_type: SyncType) -> Result<Option<DateTime<Utc>>> {
        let key = watermark_key(sync_type);
        let millis: Option<i64> = self.kv.get(key).await?;
        Ok(millis.and_then(from_millis))
    }

    /// 更新水位线
    pub async fn set_last_sync_time(&self, sync_type: SyncType, at: DateTime<Utc>) -> Result<()> {
        let key = watermark_key(sync_type);
        self.kv.set(key, &at.timestamp_millis()).await
    }

    // ============================================================
    // 冷却
    // ============================================================

    /// 记录一次同步尝试（无论成败都要记，冷却与结果无关）
    pub async fn record_sync_attempt(&self, at: DateTime<Utc>) -> Result<()> {
        self.kv
            .set(keys::SYNC_COOLDOWN_LAST_ATTEMPT, &at.timestamp_millis())
            .await
    }

    /// 最近一次同步尝试时间
    pub async fn last_sync_attempt(&self) -> Result<Option<DateTime<Utc>>> {
        let millis: Option<i64> = self.kv.get(keys::SYNC_COOLDOWN_LAST_ATTEMPT).await?;
        Ok(millis.and_then(from_millis))
    }

    /// 是否仍在冷却期内
    pub async fn is_sync_on_cooldown(&self, interval: Duration) -> Result<bool> {
        Ok(self.cooldown_remaining(interval).await?.is_some())
    }

    /// 冷却剩余时长；不在冷却期内返回 `None`
    pub async fn cooldown_remaining(&self, interval: Duration) -> Result<Option<Duration>> {
        let last = match self.last_sync_attempt().await? {
            Some(at) => at,
            None => return Ok(None),
        };
        let elapsed_ms = (Utc::now() - last).num_milliseconds();
        if elapsed_ms < 0 {
            // 时钟回拨：按刚刚尝试过处理
            return Ok(Some(interval));
        }
        let elapsed = Duration::from_millis(elapsed_ms as u64);
        if elapsed >= interval {
            Ok(None)
        } else {
            Ok(Some(interval - elapsed))
        }
    }

    // ============================================================
    // 可恢复断点
    // ============================================================

    /// 保存同步断点并强制落盘（崩溃后必须能恢复）
    pub async fn save_resumable_state(&self, state: &ResumableSyncState) -> Result<()> {
        self.kv.set(keys::RESUMABLE_SYNC_STATE, state).await?;
        self.kv.flush().await
    }

    /// 加载同步断点；损坏的断点按不存在处理
    pub async fn load_resumable_state(&self) -> Result<Option<ResumableSyncState>> {
        self.kv.get(keys::RESUMABLE_SYNC_STATE).await
    }

    /// 清除同步断点（仅在终态成功或显式重置时调用）
    pub async fn clear_resumable_state(&self) -> Result<()> {
        self.kv.remove(keys::RESUMABLE_SYNC_STATE).await?;
        self.kv.flush().await
    }

    // ============================================================
    // 进度快照
    // ============================================================

    pub async fn save_progress_state(&self, state: &ProgressState) -> Result<()> {
        self.kv.set(keys::SYNC_PROGRESS_STATE, state).await
    }

    pub async fn load_progress_state(&self) -> Result<Option<ProgressState>> {
        self.kv.get(keys::SYNC_PROGRESS_STATE).await
    }

    pub async fn clear_progress_state(&self) -> Result<()> {
        self.kv.remove(keys::SYNC_PROGRESS_STATE).await
    }
}

fn watermark_key(sync_type: SyncType) -> String {
    format!("{}{}", keys::LAST_SYNC_TIME_PREFIX, sync_type.as_key())
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}
