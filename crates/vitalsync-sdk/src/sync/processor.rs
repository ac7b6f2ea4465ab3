//! 数据处理器
//!
//! 职责：
//! - 从本地数据源拉取原始样本并转换为上报记录
//! - 间隙分析：对比水位线与本地可用范围，计算最小未同步窗口
//! - 分块顺序上报，每块成功后推进并持久化断点
//! - 上报完成后触发服务端聚合（尽力而为）

use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, VitalSyncError};
use crate::ingest::IngestClient;
use crate::provider::HealthDataProvider;
use crate::sdk::VitalSyncConfig;
use crate::storage::SyncStore;
use crate::sync::{ResumableSyncState, SyncSession, SyncType, VitalDataSubmission, WatermarkManager};

/// 进度回调：(已上报条数, 总条数, 当前指标)
pub type ProgressCallback =
    Arc<dyn Fn(usize, usize, Option<String>) -> BoxFuture<'static, ()> + Send + Sync>;

/// 拉取转换结果
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub submissions: Vec<VitalDataSubmission>,
    /// 校验失败被跳过的样本数
    pub skipped_invalid: usize,
}

impl FetchResult {
    pub fn empty() -> Self {
        Self {
            submissions: Vec::new(),
            skipped_invalid: 0,
        }
    }
}

/// 上报结果
#[derive(Debug, Clone, Copy)]
pub struct SubmitReport {
    /// 会话内累计确认上报的条数
    pub submitted: usize,
    /// 会话总块数
    pub chunks: usize,
}

/// 数据处理器
#[derive(Debug)]
pub struct DataProcessor {
    provider: Arc<dyn HealthDataProvider>,
    ingest: Arc<dyn IngestClient>,
    store: Arc<SyncStore>,
    watermarks: Arc<WatermarkManager>,
    config: Arc<VitalSyncConfig>,
}

impl DataProcessor {
    pub fn new(
        provider: Arc<dyn HealthDataProvider>,
        ingest: Arc<dyn IngestClient>,
        store: Arc<SyncStore>,
        watermarks: Arc<WatermarkManager>,
        config: Arc<VitalSyncConfig>,
    ) -> Self {
        Self {
            provider,
            ingest,
            store,
            watermarks,
            config,
        }
    }

    /// 拉取指定日期范围的原始样本并转换为上报记录
    ///
    /// 单条转换失败只跳过并记录日志，不影响整批。
    pub async fn fetch_vital_data(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<FetchResult> {
        let samples = self
            .provider
            .fetch_samples(&self.config.metric_types, from, to)
            .await?;

        let total = samples.len();
        let mut submissions = Vec::with_capacity(total);
        let mut skipped_invalid = 0usize;
        for sample in samples {
            match VitalDataSubmission::from_raw(sample) {
                Ok(submission) => submissions.push(submission),
                Err(e) => {
                    skipped_invalid += 1;
                    warn!("样本转换失败，已跳过: error={}", e);
                }
            }
        }

        debug!(
            "拉取完成: from={}, to={}, samples={}, converted={}, skipped={}",
            from,
            to,
            total,
            submissions.len(),
            skipped_invalid
        );

        Ok(FetchResult {
            submissions,
            skipped_invalid,
        })
    }

    /// 间隙分析模式拉取
    ///
    /// 未同步窗口为 `[max(水位线, 本地最早可用), 本地最晚可用]`；
    /// 水位线缺失（首次运行）时回退到默认回看窗口。
    /// 本地没有任何数据返回 `None`；窗口为空返回空序列（调用方视为立即成功）。
    pub async fn fetch_vital_data_with_gap_analysis(
        &self,
    ) -> Result<Option<(FetchResult, (DateTime<Utc>, DateTime<Utc>))>> {
        let Some((earliest, latest)) = self.provider.availability_range().await? else {
            debug!("本地数据源为空，无需同步");
            return Ok(None);
        };

        let watermark = self.watermarks.get(SyncType::Incremental).await?;
        let start = match watermark {
            Some(w) => w.max(earliest),
            None => {
                let fallback =
                    Utc::now() - Duration::days(self.config.incremental_fallback_days);
                fallback.max(earliest)
            }
        };

        if start >= latest {
            debug!(
                "无间隙，跳过拉取: watermark={:?}, earliest={}, latest={}",
                watermark, earliest, latest
            );
            return Ok(Some((FetchResult::empty(), (start, latest))));
        }

        info!(
            "检测到未同步窗口: start={}, end={}, watermark={:?}",
            start, latest, watermark
        );
        let fetched = self.fetch_vital_data(start, latest).await?;
        Ok(Some((fetched, (start, latest))))
    }

    /// 分块顺序上报全部数据
    ///
    /// 开始前持久化完整断点，每块确认后推进 `completed_chunks` 并再次落盘；
    /// 块失败时剩余工作已在断点内，错误按可重试向上传播。
    /// 取消令牌在块间与块内（与请求并发竞争）都被观察。
    pub async fn submit_all_data(
        &self,
        session: &SyncSession,
        submissions: Vec<VitalDataSubmission>,
        cancel: CancellationToken,
        on_progress: ProgressCallback,
    ) -> Result<SubmitReport> {
        if submissions.is_empty() {
            return Ok(SubmitReport {
                submitted: 0,
                chunks: 0,
            });
        }

        let mut state = ResumableSyncState {
            pending_submissions: submissions,
            completed_chunks: 0,
            sync_start_date: session.start_date,
            sync_end_date: session.end_date,
            sync_type: session.sync_type,
        };
        // 第一块发出前先落盘：此后任意时刻崩溃都能恢复
        self.store.save_resumable_state(&state).await?;

        self.submit_chunks(&mut state, cancel, on_progress).await
    }

    /// 续传路径
    ///
    /// 不重新做间隙分析、不重新拉取：裁掉已确认前缀后继续上报剩余块。
    /// source_id 幂等保证即使重叠上报也不会产生重复记录。
    pub async fn resume_pending(
        &self,
        mut state: ResumableSyncState,
        cancel: CancellationToken,
        on_progress: ProgressCallback,
    ) -> Result<SubmitReport> {
        info!(
            "续传中断的同步: sync_type={}, pending={}, completed_chunks={}",
            state.sync_type,
            state.pending_submissions.len(),
            state.completed_chunks
        );
        self.submit_chunks(&mut state, cancel, on_progress).await
    }

    /// 顺序上报：第 k 块只在第 k−1 块成功后才发出
    async fn submit_chunks(
        &self,
        state: &mut ResumableSyncState,
        cancel: CancellationToken,
        on_progress: ProgressCallback,
    ) -> Result<SubmitReport> {
        let chunk_size = self.config.chunk_size.max(1);
        let total = state.pending_submissions.len();
        let total_chunks = total.div_ceil(chunk_size);

        for idx in state.completed_chunks..total_chunks {
            if cancel.is_cancelled() {
                return Err(VitalSyncError::Cancelled);
            }

            let chunk_start = idx * chunk_size;
            let chunk_end = (chunk_start + chunk_size).min(total);
            let current_metric = {
                let chunk = &state.pending_submissions[chunk_start..chunk_end];
                let metric = chunk.first().map(|s| s.metric_type.clone());

                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(VitalSyncError::Cancelled);
                    }
                    result = self.ingest.submit_batch(chunk) => {
                        if let Err(e) = result {
                            warn!(
                                "数据块上报失败: chunk={}/{}, error={}",
                                idx + 1,
                                total_chunks,
                                e
                            );
                            return Err(e);
                        }
                    }
                }
                metric
            };

            state.completed_chunks = idx + 1;
            // 断点推进必须先落盘，再对外报告进度
            self.store.save_resumable_state(state).await?;

            let submitted = state.acknowledged_points(chunk_size);
            debug!(
                "数据块上报成功: chunk={}/{}, submitted={}/{}",
                idx + 1,
                total_chunks,
                submitted,
                total
            );
            on_progress(submitted, total, current_metric).await;
        }

        Ok(SubmitReport {
            submitted: total,
            chunks: total_chunks,
        })
    }

    /// 触发服务端聚合重算
    ///
    /// 数据已入库，聚合是最终一致的：失败只记日志，不影响本次同步结果。
    pub async fn trigger_aggregation(&self) {
        if let Err(e) = self
            .ingest
            .trigger_aggregation(&self.config.user_scope)
            .await
        {
            warn!("聚合触发失败（下次同步成功后会再次触发）: error={}", e);
        }
    }
}
