//! 网络状态监控
//!
//! 职责：
//! - 观察连接状态变化并广播事件
//! - 记录"有失败同步等待重试"的状态，把"数据已就绪"与"同步正在运行"解耦
//!
//! 离线 → 在线 的恢复触发由 SDK 装配层订阅本模块事件后发起；
//! 单飞约束始终由编排器检查，本模块不会自行启动第二个会话。

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::info;

use crate::error::Result;
use crate::sync::SyncType;

/// 网络状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// 在线
    Online,
    /// 离线
    Offline,
    /// 连接中
    Connecting,
    /// 网络受限
    Limited,
}

/// 网络状态变化事件
#[derive(Debug, Clone)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    pub timestamp: i64,
}

impl NetworkStatusEvent {
    /// 是否为 离线 → 在线 的恢复转变
    pub fn is_restore(&self) -> bool {
        !matches!(self.old_status, NetworkStatus::Online | NetworkStatus::Limited)
            && matches!(self.new_status, NetworkStatus::Online | NetworkStatus::Limited)
    }
}

/// 网络状态监听器 trait（由平台层实现，如 Android/iOS）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    /// 获取当前网络状态
    async fn current_status(&self) -> NetworkStatus;

    /// 开始监听网络状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 等待重试的失败同步记录
#[derive(Debug, Clone)]
pub struct PendingRetry {
    /// 失败会话的同步类型
    pub sync_type: SyncType,
    /// 失败时间（UTC 毫秒）
    pub failed_at: i64,
}

/// 网络监控管理器
#[derive(Debug)]
pub struct NetworkMonitor {
    listener: Arc<dyn NetworkStatusListener>,
    status_sender: broadcast::Sender<NetworkStatusEvent>,
    current_status: Arc<RwLock<NetworkStatus>>,
    /// 上次同步以可重试方式失败后的待重试记录
    pending_retry: Arc<RwLock<Option<PendingRetry>>>,
}

impl NetworkMonitor {
    pub fn new(listener: Arc<dyn NetworkStatusListener>, buffer_size: usize) -> Self {
        let (status_sender, _) = broadcast::channel(buffer_size.max(1));

        Self {
            listener,
            status_sender,
            current_status: Arc::new(RwLock::new(NetworkStatus::Offline)),
            pending_retry: Arc::new(RwLock::new(None)),
        }
    }

    /// 启动网络监控
    pub async fn start(&self) -> Result<()> {
        let initial = self.listener.current_status().await;
        *self.current_status.write().await = initial;

        let mut receiver = self.listener.start_monitoring().await?;
        let status_sender = self.status_sender.clone();
        let current_status = self.current_status.clone();

        // 启动监听任务：平台事件 → 内部状态 + 对外广播
        tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                {
                    let mut status = current_status.write().await;
                    *status = event.new_status.clone();
                }
                let _ = status_sender.send(event);
            }
        });

        Ok(())
    }

    /// 停止监听平台事件
    pub async fn stop(&self) {
        self.listener.stop_monitoring().await;
    }

    /// 获取当前网络状态
    pub async fn status(&self) -> NetworkStatus {
        self.current_status.read().await.clone()
    }

    /// 手动设置网络状态（用于进程内状态推进）
    pub async fn set_status(&self, new_status: NetworkStatus) {
        let old_status = {
            let mut status = self.current_status.write().await;
            let old = status.clone();
            *status = new_status.clone();
            old
        };

        let event = NetworkStatusEvent {
            old_status,
            new_status,
            timestamp: Utc::now().timestamp_millis(),
        };
        let _ = self.status_sender.send(event);
    }

    /// 订阅网络状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStatusEvent> {
        self.status_sender.subscribe()
    }

    /// 当前是否可联网（在线或受限都算可用）
    pub async fn is_network_available(&self) -> bool {
        let status = self.status().await;
        matches!(status, NetworkStatus::Online | NetworkStatus::Limited)
    }

    // ============================================================
    // 失败重试状态
    // ============================================================

    /// 记录一次可重试的同步失败，网络恢复后据此触发重试
    pub async fn mark_sync_failed(&self, sync_type: SyncType) {
        let mut pending = self.pending_retry.write().await;
        *pending = Some(PendingRetry {
            sync_type,
            failed_at: Utc::now().timestamp_millis(),
        });
        info!("已登记待重试同步: sync_type={}", sync_type);
    }

    /// 是否存在等待重试的失败同步
    pub async fn has_failed_sync_pending_retry(&self) -> bool {
        self.pending_retry.read().await.is_some()
    }

    /// 待重试同步的类型
    pub async fn pending_retry_sync_type(&self) -> Option<SyncType> {
        self.pending_retry.read().await.as_ref().map(|p| p.sync_type)
    }

    /// 清除重试状态（同步成功或操作员显式重置后调用）
    pub async fn clear_retry_state(&self) {
        let mut pending = self.pending_retry.write().await;
        if pending.take().is_some() {
            info!("待重试同步状态已清除");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_helpers::DummyNetworkStatusListener;
    use super::*;

    #[tokio::test]
    async fn test_restore_transition_detection() {
        let event = NetworkStatusEvent {
            old_status: NetworkStatus::Offline,
            new_status: NetworkStatus::Online,
            timestamp: 0,
        };
        assert!(event.is_restore());

        let event = NetworkStatusEvent {
            old_status: NetworkStatus::Online,
            new_status: NetworkStatus::Limited,
            timestamp: 0,
        };
        // 在线 → 受限 不算恢复
        assert!(!event.is_restore());
    }

    #[tokio::test]
    async fn test_monitor_tracks_listener_events() {
        let listener = Arc::new(DummyNetworkStatusListener::default());
        let monitor = NetworkMonitor::new(listener.clone(), 16);
        monitor.start().await.unwrap();

        assert!(monitor.is_network_available().await);

        let mut events = monitor.subscribe();
        listener.push_status(NetworkStatus::Offline).await;
        let event = events.recv().await.unwrap();
        assert_eq!(event.new_status, NetworkStatus::Offline);

        // 转发任务需要先于断言处理事件
        tokio::task::yield_now().await;
        assert!(!monitor.is_network_available().await);
    }

    #[tokio::test]
    async fn test_pending_retry_state() {
        let listener = Arc::new(DummyNetworkStatusListener::default());
        let monitor = NetworkMonitor::new(listener, 16);

        assert!(!monitor.has_failed_sync_pending_retry().await);

        monitor.mark_sync_failed(SyncType::Initial).await;
        assert!(monitor.has_failed_sync_pending_retry().await);
        assert_eq!(
            monitor.pending_retry_sync_type().await,
            Some(SyncType::Initial)
        );

        monitor.clear_retry_state().await;
        assert!(!monitor.has_failed_sync_pending_retry().await);
    }
}
