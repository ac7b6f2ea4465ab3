//! 同步进度跟踪
//!
//! "现在正在发生什么"与"上次发生了什么"的唯一权威来源，与触发方无关。
//!
//! 所有更新在同一把写锁内完成状态变更、持久化与广播，
//! 订阅者因此观察到全序的不可变快照流，即使更新来自不同任务也不会乱序。

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use crate::error::Result;
use crate::storage::SyncStore;

/// 同步进度快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    /// 是否正在同步
    pub is_syncing: bool,
    /// 当前进度（已上报条数）
    pub current: usize,
    /// 总条数
    pub total: usize,
    /// 用户可见消息
    pub message: String,
    /// 本次会话的数据点总数
    pub total_data_points: usize,
    /// 已同步数据点数
    pub synced_data_points: usize,
    /// 正在同步的指标类型
    pub current_metric: Option<String>,
    /// 失败时的错误消息
    pub error_message: Option<String>,
}

impl ProgressState {
    /// 空闲状态
    pub fn idle() -> Self {
        Self {
            is_syncing: false,
            current: 0,
            total: 0,
            message: String::new(),
            total_data_points: 0,
            synced_data_points: 0,
            current_metric: None,
            error_message: None,
        }
    }

    /// 进度比例 0.0–1.0
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        (self.current as f32 / self.total as f32).clamp(0.0, 1.0)
    }
}

impl Default for ProgressState {
    fn default() -> Self {
        Self::idle()
    }
}

/// 进度跟踪器
#[derive(Debug)]
pub struct ProgressTracker {
    state: Arc<RwLock<ProgressState>>,
    sender: broadcast::Sender<ProgressState>,
    store: Arc<SyncStore>,
}

impl ProgressTracker {
    pub fn new(store: Arc<SyncStore>, buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size.max(1));
        Self {
            state: Arc::new(RwLock::new(ProgressState::idle())),
            sender,
            store,
        }
    }

    /// 开始一次同步会话：重置计数并标记 is_syncing
    pub async fn start_sync_progress(&self, total: usize, message: impl Into<String>) {
        let mut state = self.state.write().await;
        *state = ProgressState {
            is_syncing: true,
            current: 0,
            total,
            message: message.into(),
            total_data_points: total,
            synced_data_points: 0,
            current_metric: None,
            error_message: None,
        };
        self.persist_and_publish(&state).await;
    }

    /// 会话内进度更新
    ///
    /// `current` 在一次会话内必须单调不减；出现回退说明上游有缺陷，
    /// 这里夹紧到已有值并告警，保证订阅者观察到的序列不回退。
    pub async fn update_sync_progress(
        &self,
        current: usize,
        total: usize,
        message: impl Into<String>,
        current_metric: Option<String>,
    ) {
        let mut state = self.state.write().await;
        let clamped = if current < state.current {
            warn!(
                "进度回退被夹紧: current={}, previous={}",
                current, state.current
            );
            state.current
        } else {
            current
        };
        state.current = clamped;
        state.total = total;
        state.message = message.into();
        state.total_data_points = total;
        state.synced_data_points = clamped;
        state.current_metric = current_metric;
        self.persist_and_publish(&state).await;
    }

    /// 终态转换：结束会话
    pub async fn complete_sync_progress(&self, success: bool, message: impl Into<String>) {
        let message = message.into();
        let mut state = self.state.write().await;
        state.is_syncing = false;
        if success {
            // 成功终态进度必须到满
            state.current = state.total;
            state.synced_data_points = state.total_data_points;
            state.error_message = None;
        } else {
            state.error_message = Some(message.clone());
        }
        state.message = message;
        state.current_metric = None;
        self.persist_and_publish(&state).await;
    }

    /// 进程重启后发现上次会话被中断时调用：保留计数，标记非运行态
    pub async fn mark_interrupted(&self, message: impl Into<String>) {
        let message = message.into();
        let mut state = self.state.write().await;
        state.is_syncing = false;
        state.error_message = Some(message.clone());
        state.message = message;
        self.persist_and_publish(&state).await;
    }

    /// 当前快照
    pub async fn snapshot(&self) -> ProgressState {
        self.state.read().await.clone()
    }

    /// 订阅进度快照流
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressState> {
        self.sender.subscribe()
    }

    /// 启动时恢复持久化的进度快照（只调用一次）
    ///
    /// 恢复出的状态若 `is_syncing == true`，调用方（编排器）必须走续传路径，
    /// 而不是当作已完成。
    pub async fn restore_progress_state(&self) -> Result<Option<ProgressState>> {
        let restored = self.store.load_progress_state().await?;
        if let Some(ref snapshot) = restored {
            debug!(
                "恢复进度快照: is_syncing={}, current={}/{}",
                snapshot.is_syncing, snapshot.current, snapshot.total
            );
            let mut state = self.state.write().await;
            *state = snapshot.clone();
            let _ = self.sender.send(state.clone());
        }
        Ok(restored)
    }

    /// 显式清空：内存与持久化的进度一并重置
    pub async fn clear_persisted_progress_state(&self) -> Result<()> {
        let mut state = self.state.write().await;
        *state = ProgressState::idle();
        self.store.clear_progress_state().await?;
        let _ = self.sender.send(state.clone());
        Ok(())
    }

    /// 写锁内完成持久化与广播，保证快照全序
    async fn persist_and_publish(&self, state: &ProgressState) {
        if let Err(e) = self.store.save_progress_state(state).await {
            warn!("进度快照持久化失败: error={}", e);
        }
        let _ = self.sender.send(state.clone());
    }
}
