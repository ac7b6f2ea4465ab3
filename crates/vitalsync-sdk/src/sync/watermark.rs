//! 水位线管理器
//!
//! 职责：
//! - 存储和更新各同步类型的水位线（最近一次成功同步覆盖到的时间点）
//! - 提供查询接口，供间隙分析计算最小未同步窗口
//!
//! 水位线只信本地持久化值，从不采信服务端上报的时间（容忍后端时钟偏移）。

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::storage::SyncStore;
use crate::sync::SyncType;

/// 水位线管理器
#[derive(Debug, Clone)]
pub struct WatermarkManager {
    /// 存储门面
    store: Arc<SyncStore>,

    /// 内存缓存：sync_type -> 水位线
    cache: Arc<RwLock<HashMap<SyncType, DateTime<Utc>>>>,
}

impl WatermarkManager {
    pub fn new(store: Arc<SyncStore>) -> Self {
        Self {
            store,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 获取指定同步类型的水位线
    pub async fn get(&self, sync_type: SyncType) -> Result<Option<DateTime<Utc>>> {
        // 先查缓存
        {
            let cache = self.cache.read().await;
            if let Some(&at) = cache.get(&sync_type) {
                return Ok(Some(at));
            }
        }

        // 缓存未命中，查询存储
        let at = self.store.last_sync_time(sync_type).await?;

        // 更新缓存
        if let Some(at) = at {
            let mut cache = self.cache.write().await;
            cache.insert(sync_type, at);
        }

        Ok(at)
    }

    /// 更新水位线（仅在会话终态成功后调用）
    pub async fn update(&self, sync_type: SyncType, at: DateTime<Utc>) -> Result<()> {
        debug!("更新水位线: sync_type={}, at={}", sync_type, at);

        // 先更新存储，再更新缓存
        self.store.set_last_sync_time(sync_type, at).await?;

        {
            let mut cache = self.cache.write().await;
            cache.insert(sync_type, at);
        }

        Ok(())
    }

    /// 清理缓存（用于测试或重置）
    pub async fn clear_cache(&self) {
        let mut cache = self.cache.write().await;
        cache.clear();
    }
}
