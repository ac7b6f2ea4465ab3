//! 同步编排器
//!
//! 职责：
//! - 暴露公开同步操作，逐项检查前置条件（授权、单飞、冷却）
//! - 驱动状态机：Idle → Running → {Completed, FailedRetryable, FailedFatal}
//! - 进程重启后检查持久化状态，走续传路径而不是重新同步
//! - 装配并独占持有各子组件（单向所有权，无全局单例）
//!
//! 并发触发方（网络恢复、前台切换、定时器、手动调用）竞争发起同步时，
//! 至多一个进入 Running，其余为静默空操作。

use chrono::Utc;
use futures::FutureExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, VitalSyncError};
use crate::network::NetworkMonitor;
use crate::progress::ProgressTracker;
use crate::provider::HealthDataProvider;
use crate::sdk::VitalSyncConfig;
use crate::storage::SyncStore;
use crate::sync::processor::{DataProcessor, ProgressCallback, SubmitReport};
use crate::sync::{
    default_window, PreconditionRejection, ResumableSyncState, SyncOutcome, SyncSession,
    SyncStats, SyncType, WatermarkManager,
};

/// 同步触发来源，决定前置条件的豁免规则
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncOrigin {
    /// 直接调用公开操作
    Direct,
    /// 操作员手动重试：豁免冷却，不豁免单飞
    ManualRetry,
    /// 网络恢复 / 启动续传触发
    NetworkRestore,
}

impl SyncOrigin {
    /// 该来源是否优先续传断点
    fn tries_resume(&self) -> bool {
        !matches!(self, SyncOrigin::Direct)
    }
}

/// 同步编排器
#[derive(Debug)]
pub struct SyncManager {
    config: Arc<VitalSyncConfig>,
    provider: Arc<dyn HealthDataProvider>,
    store: Arc<SyncStore>,
    watermarks: Arc<WatermarkManager>,
    progress: Arc<ProgressTracker>,
    network: Arc<NetworkMonitor>,
    processor: Arc<DataProcessor>,
    /// 单飞守卫：try_lock 失败即已有会话进行中
    session_lock: Mutex<()>,
    /// 当前会话的取消令牌（clear_sync_progress 取消在途 I/O）
    cancel: RwLock<CancellationToken>,
}

impl SyncManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<VitalSyncConfig>,
        provider: Arc<dyn HealthDataProvider>,
        store: Arc<SyncStore>,
        watermarks: Arc<WatermarkManager>,
        progress: Arc<ProgressTracker>,
        network: Arc<NetworkMonitor>,
        processor: Arc<DataProcessor>,
    ) -> Self {
        Self {
            config,
            provider,
            store,
            watermarks,
            progress,
            network,
            processor,
            session_lock: Mutex::new(()),
            cancel: RwLock::new(CancellationToken::new()),
        }
    }

    // ============================================================
    // 公开同步操作
    // ============================================================

    /// 初始同步：最近 30 天，首次授权使用时执行
    pub async fn perform_initial_sync(&self) -> Result<SyncOutcome> {
        self.start_sync(SyncType::Initial, SyncOrigin::Direct).await
    }

    /// 历史同步：从数据源最早可用时间开始的一次性回填
    pub async fn perform_historical_sync(&self) -> Result<SyncOutcome> {
        self.start_sync(SyncType::Historical, SyncOrigin::Direct).await
    }

    /// 增量同步：间隙分析计算最小未同步窗口
    pub async fn perform_incremental_sync(&self) -> Result<SyncOutcome> {
        self.start_sync(SyncType::Incremental, SyncOrigin::Direct).await
    }

    /// 最近 24 小时同步
    pub async fn perform_last_24_hours_sync(&self) -> Result<SyncOutcome> {
        self.start_sync(SyncType::Last24Hours, SyncOrigin::Direct).await
    }

    /// 手动重试：优先续传断点，否则转增量；豁免冷却，不豁免单飞
    pub async fn manual_retry_sync(&self) -> Result<SyncOutcome> {
        self.start_sync(SyncType::NetworkRetry, SyncOrigin::ManualRetry)
            .await
    }

    /// 网络恢复 / 启动续传触发的重试
    pub async fn network_retry_sync(&self) -> Result<SyncOutcome> {
        self.start_sync(SyncType::NetworkRetry, SyncOrigin::NetworkRestore)
            .await
    }

    /// 显式重置：取消在途会话，清空内存与持久化的进度、断点、重试状态
    pub async fn clear_sync_progress(&self) -> Result<()> {
        // 先取消在途 I/O
        self.cancel.read().await.cancel();
        // 等在途会话观察到取消并退出后再清理，避免清理之后还有断点落盘
        let _guard = self.session_lock.lock().await;
        self.progress.clear_persisted_progress_state().await?;
        self.store.clear_resumable_state().await?;
        self.network.clear_retry_state().await;
        self.watermarks.clear_cache().await;
        info!("同步进度与断点已重置");
        Ok(())
    }

    /// 取消在途会话但保留断点与进度（关停用；下次启动走续传）
    pub async fn cancel_in_flight(&self) {
        self.cancel.read().await.cancel();
    }

    /// 启动时检查持久化状态
    ///
    /// 上个进程生命周期内有会话中断时：恢复进度快照、登记待重试，
    /// 返回 `true` 由装配层决定何时发起续传（`network_retry_sync`）。
    pub async fn restore_on_launch(&self) -> Result<bool> {
        let restored = self.progress.restore_progress_state().await?;
        let was_syncing = restored.map(|p| p.is_syncing).unwrap_or(false);

        match self.store.load_resumable_state().await? {
            Some(state) => {
                info!(
                    "检测到中断的同步会话: sync_type={}, pending={}, completed_chunks={}",
                    state.sync_type,
                    state.pending_submissions.len(),
                    state.completed_chunks
                );
                self.progress.mark_interrupted("上次同步被中断，等待续传").await;
                self.network.mark_sync_failed(state.sync_type).await;
                Ok(true)
            }
            None => {
                if was_syncing {
                    // 拉取阶段被杀，没有形成断点：宣告中断即可，无须续传
                    self.progress.mark_interrupted("上次同步未完成").await;
                }
                Ok(false)
            }
        }
    }

    // ============================================================
    // 状态机
    // ============================================================

    async fn start_sync(&self, requested: SyncType, origin: SyncOrigin) -> Result<SyncOutcome> {
        // 前置检查 1: 授权（未授权应走授权流程，而不是同步）
        if !self.provider.is_authorized().await {
            info!("同步被拒绝：未获得数据源授权");
            return Ok(SyncOutcome::Rejected(PreconditionRejection::NotAuthorized));
        }

        // 前置检查 2: 单飞（并发触发者至多一个成功，其余静默空操作）
        let _guard = match self.session_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("同步被拒绝：已有会话进行中（静默忽略）");
                return Ok(SyncOutcome::Rejected(PreconditionRejection::AlreadySyncing));
            }
        };

        // 加锁之后再读断点，避免与刚结束会话的清理写入竞争
        let resume_state = if origin.tries_resume() {
            self.store.load_resumable_state().await?
        } else {
            None
        };

        // 前置检查 3: 冷却。手动重试始终豁免；
        // 断点续传延续的是既有尝试而非新尝试，同样豁免
        let bypass_cooldown =
            matches!(origin, SyncOrigin::ManualRetry) || resume_state.is_some();
        if !bypass_cooldown {
            if let Some(remaining) = self
                .store
                .cooldown_remaining(Duration::from_secs(self.config.cooldown_secs))
                .await?
            {
                let remaining_secs = remaining.as_secs().max(1);
                info!("同步被拒绝：冷却中 remaining_secs={}", remaining_secs);
                return Ok(SyncOutcome::Rejected(PreconditionRejection::OnCooldown {
                    remaining_secs,
                }));
            }
        }

        // 进入 Running：记录尝试时间（冷却与结果无关），换发取消令牌
        self.store.record_sync_attempt(Utc::now()).await?;
        let token = CancellationToken::new();
        *self.cancel.write().await = token.clone();

        let effective = resume_state
            .as_ref()
            .map(|s| s.sync_type)
            .unwrap_or(match requested {
                SyncType::NetworkRetry => SyncType::Incremental,
                other => other,
            });

        let result = match resume_state {
            Some(state) => self.run_resume(state, token).await,
            None => self.run_fresh(effective, token).await,
        };

        // 终态映射
        match result {
            Ok(outcome) => Ok(outcome),
            Err(VitalSyncError::Cancelled) => {
                // 断点保持原样：显式重置会在会话退出后自行清理，
                // 关停取消则依赖断点在下次启动续传
                self.progress.mark_interrupted("同步已中断").await;
                info!("同步会话已取消: sync_type={}", effective);
                Err(VitalSyncError::Cancelled)
            }
            Err(e) if e.is_retryable() => {
                // FailedRetryable：断点保持原样，登记待重试，网络恢复后自动续传
                self.network.mark_sync_failed(effective).await;
                self.progress
                    .complete_sync_progress(
                        false,
                        format!("同步失败，网络恢复后将自动重试: {}", e),
                    )
                    .await;
                warn!("同步失败（可重试）: sync_type={}, error={}", effective, e);
                Err(e)
            }
            Err(e) => {
                // FailedFatal（授权类等）：不安排自动重试，远端数据保持原样
                self.progress
                    .complete_sync_progress(false, format!("同步失败: {}", e))
                    .await;
                warn!("同步失败（不可自动重试）: sync_type={}, error={}", effective, e);
                Err(e)
            }
        }
    }

    /// 全新会话：确定窗口 → 拉取 → 上报 → 终态成功
    async fn run_fresh(
        &self,
        sync_type: SyncType,
        token: CancellationToken,
    ) -> Result<SyncOutcome> {
        let started = Instant::now();
        let now = Utc::now();

        let (fetched, window) = match sync_type {
            SyncType::Incremental => {
                match self.processor.fetch_vital_data_with_gap_analysis().await? {
                    None => return self.finish_no_data().await,
                    Some((fetched, window)) => (fetched, window),
                }
            }
            SyncType::Historical => {
                let Some((earliest, _latest)) = self.provider.availability_range().await? else {
                    return self.finish_no_data().await;
                };
                let fetched = self.processor.fetch_vital_data(earliest, now).await?;
                (fetched, (earliest, now))
            }
            _ => {
                let (start, end) = default_window(sync_type, now, self.config.initial_sync_days);
                let fetched = self.processor.fetch_vital_data(start, end).await?;
                (fetched, (start, end))
            }
        };

        if fetched.submissions.is_empty() {
            return self.finish_no_data().await;
        }

        let session = SyncSession::new(sync_type, window.0, window.1);
        let total = fetched.submissions.len();
        info!(
            "同步会话开始: sync_type={}, session_id={}, total={}",
            sync_type, session.id, total
        );
        self.progress
            .start_sync_progress(total, format!("{}：正在上报 {} 条数据", sync_type, total))
            .await;

        let report = self
            .processor
            .submit_all_data(&session, fetched.submissions, token, self.progress_callback())
            .await?;

        self.finalize_success(&session, report, total, fetched.skipped_invalid, started)
            .await
    }

    /// 续传会话：不重新分析、不重新拉取，只上报断点内剩余的块
    async fn run_resume(
        &self,
        state: ResumableSyncState,
        token: CancellationToken,
    ) -> Result<SyncOutcome> {
        let started = Instant::now();
        let chunk_size = self.config.chunk_size.max(1);
        let total = state.pending_submissions.len();
        let already = state.acknowledged_points(chunk_size);
        let session = SyncSession::new(state.sync_type, state.sync_start_date, state.sync_end_date);

        info!(
            "续传同步会话: sync_type={}, session_id={}, already={}/{}",
            state.sync_type, session.id, already, total
        );
        self.progress
            .start_sync_progress(
                total,
                format!("{}：继续上报剩余 {} 条数据", state.sync_type, total - already),
            )
            .await;
        if already > 0 {
            self.progress
                .update_sync_progress(
                    already,
                    total,
                    format!("已同步 {}/{} 条数据", already, total),
                    None,
                )
                .await;
        }

        let report = self
            .processor
            .resume_pending(state, token, self.progress_callback())
            .await?;

        self.finalize_success(&session, report, total, 0, started).await
    }

    /// 没有需要同步的数据：视为立即成功
    async fn finish_no_data(&self) -> Result<SyncOutcome> {
        self.network.clear_retry_state().await;
        self.progress
            .complete_sync_progress(true, "没有需要同步的数据")
            .await;
        Ok(SyncOutcome::NoData)
    }

    /// 终态成功：推水位线 → 清断点 → 清重试状态 → 触发聚合
    async fn finalize_success(
        &self,
        session: &SyncSession,
        report: SubmitReport,
        total: usize,
        skipped_invalid: usize,
        started: Instant,
    ) -> Result<SyncOutcome> {
        self.watermarks
            .update(session.sync_type, session.end_date)
            .await?;
        self.store.clear_resumable_state().await?;
        self.network.clear_retry_state().await;

        self.progress
            .complete_sync_progress(true, format!("同步完成，共上报 {} 条数据", report.submitted))
            .await;

        // 数据已入库，聚合最终一致，失败不回滚本次同步
        self.processor.trigger_aggregation().await;

        let stats = SyncStats {
            sync_type: session.sync_type,
            total_samples: total + skipped_invalid,
            submitted: report.submitted,
            skipped_invalid,
            chunks: report.chunks,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            "✅ 同步完成: sync_type={}, submitted={}, chunks={}, duration_ms={}",
            stats.sync_type, stats.submitted, stats.chunks, stats.duration_ms
        );
        Ok(SyncOutcome::Completed(stats))
    }

    /// 上报进度 → 进度跟踪器的桥接回调
    fn progress_callback(&self) -> ProgressCallback {
        let progress = self.progress.clone();
        Arc::new(move |current, total, metric| {
            let progress = progress.clone();
            async move {
                progress
                    .update_sync_progress(
                        current,
                        total,
                        format!("已同步 {}/{} 条数据", current, total),
                        metric,
                    )
                    .await;
            }
            .boxed()
        })
    }
}
