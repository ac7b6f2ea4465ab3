//! 同步模块
//!
//! 职责：
//! - 定义同步类型与会话上下文
//! - 定义上报数据单元（VitalDataSubmission，带幂等 source_id）
//! - 定义可恢复断点（ResumableSyncState）
//! - 管理各同步类型的水位线
//! - 执行拉取 → 转换 → 分块上报 → 触发聚合的完整流水线

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Result, VitalSyncError};
use crate::provider::RawSample;

pub mod manager;
pub mod processor;
pub mod watermark;

pub use manager::SyncManager;
pub use processor::DataProcessor;
pub use watermark::WatermarkManager;

/// 同步类型
///
/// 决定默认日期范围，以及是否走间隙分析。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    /// 初始同步：最近 30 天，首次授权使用时执行
    Initial,
    /// 历史同步：从数据源最早可用时间开始的一次性回填
    Historical,
    /// 增量同步：间隙分析计算最小未同步窗口
    Incremental,
    /// 最近 24 小时
    Last24Hours,
    /// 网络恢复重试：优先续传断点，否则转增量
    NetworkRetry,
}

impl SyncType {
    /// 稳定字符串键（用于 KV 水位线键，禁止改动既有值）
    pub fn as_key(&self) -> &'static str {
        match self {
            SyncType::Initial => "initial",
            SyncType::Historical => "historical",
            SyncType::Incremental => "incremental",
            SyncType::Last24Hours => "last24h",
            SyncType::NetworkRetry => "network_retry",
        }
    }
}

impl std::fmt::Display for SyncType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncType::Initial => write!(f, "初始同步"),
            SyncType::Historical => write!(f, "历史同步"),
            SyncType::Incremental => write!(f, "增量同步"),
            SyncType::Last24Hours => write!(f, "近24小时同步"),
            SyncType::NetworkRetry => write!(f, "网络恢复重试"),
        }
    }
}

/// 一次同步尝试的临时执行上下文
///
/// 由编排器独占持有，完成或失败后即销毁。
#[derive(Debug, Clone)]
pub struct SyncSession {
    pub id: Uuid,
    pub sync_type: SyncType,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl SyncSession {
    pub fn new(sync_type: SyncType, start_date: DateTime<Utc>, end_date: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sync_type,
            start_date,
            end_date,
            created_at: Utc::now(),
        }
    }
}

/// 一条待上报的健康数据
///
/// 创建后不可变。`source_id` 是稳定的幂等键：服务端据此去重，
/// 重复上报同一条数据不会产生重复记录。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VitalDataSubmission {
    /// 指标类型（heart_rate、blood_oxygen 等，SDK 不解析具体语义）
    pub metric_type: String,
    /// 数值
    pub value: f64,
    /// 单位
    pub unit: String,
    /// 测量时间
    pub timestamp: DateTime<Utc>,
    /// 幂等键：数据源记录的稳定标识
    pub source_id: String,
}

impl VitalDataSubmission {
    /// 从原始样本转换
    ///
    /// 校验失败返回 `Validation` 错误，调用方跳过该条并记录日志，不影响整批。
    pub fn from_raw(sample: RawSample) -> Result<Self> {
        if sample.metric_type.trim().is_empty() {
            return Err(VitalSyncError::Validation("样本缺少指标类型".to_string()));
        }
        if !sample.value.is_finite() {
            return Err(VitalSyncError::Validation(format!(
                "样本数值非法: metric_type={}, value={}",
                sample.metric_type, sample.value
            )));
        }

        let source_id = match sample.source_record_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => derive_source_id(
                &sample.metric_type,
                sample.measured_at,
                sample.value,
                &sample.unit,
            ),
        };

        Ok(Self {
            metric_type: sample.metric_type,
            value: sample.value,
            unit: sample.unit,
            timestamp: sample.measured_at,
            source_id,
        })
    }
}

/// 数据源未提供稳定记录 ID 时，从样本内容派生幂等键
///
/// 同一条样本无论何时转换都得到同一个 source_id，保证重复上报可被服务端去重。
fn derive_source_id(metric_type: &str, measured_at: DateTime<Utc>, value: f64, unit: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(metric_type.as_bytes());
    hasher.update(b"|");
    hasher.update(measured_at.timestamp_millis().to_le_bytes());
    hasher.update(b"|");
    hasher.update(value.to_le_bytes());
    hasher.update(b"|");
    hasher.update(unit.as_bytes());
    hex::encode(hasher.finalize())
}

/// 可恢复同步断点
///
/// 同步中断（进程终止、网络丢失）时持久化；仅在终态成功或显式重置后清除。
/// 全局至多存在一份，代表唯一的进行中/已中断会话。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumableSyncState {
    /// 尚未确认完成的上报序列（含已完成前缀，按 completed_chunks 裁剪）
    pub pending_submissions: Vec<VitalDataSubmission>,
    /// 已确认完成的块数
    pub completed_chunks: usize,
    pub sync_start_date: DateTime<Utc>,
    pub sync_end_date: DateTime<Utc>,
    pub sync_type: SyncType,
}

impl ResumableSyncState {
    /// 已被服务端确认的条数（按块换算，最后一块可能不满）
    pub fn acknowledged_points(&self, chunk_size: usize) -> usize {
        (self.completed_chunks * chunk_size).min(self.pending_submissions.len())
    }

    /// 续传时剩余待上报的切片（裁掉已确认前缀，避免冗余网络调用；
    /// 即使不裁剪，幂等 source_id 也保证重复上报安全）
    pub fn remaining(&self, chunk_size: usize) -> &[VitalDataSubmission] {
        &self.pending_submissions[self.acknowledged_points(chunk_size)..]
    }

    pub fn is_fully_submitted(&self, chunk_size: usize) -> bool {
        self.remaining(chunk_size).is_empty()
    }
}

/// 前置条件拒绝
///
/// 这些不是错误，而是信息性状态：调用是有记录的空操作。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreconditionRejection {
    /// 已有同步正在进行（静默忽略）
    AlreadySyncing,
    /// 冷却期未过
    OnCooldown { remaining_secs: u64 },
    /// 未获得数据源授权（应先走授权流程）
    NotAuthorized,
}

impl std::fmt::Display for PreconditionRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreconditionRejection::AlreadySyncing => write!(f, "已有同步正在进行"),
            PreconditionRejection::OnCooldown { remaining_secs } => {
                write!(f, "同步冷却中，请稍后再试（剩余 {} 秒）", remaining_secs)
            }
            PreconditionRejection::NotAuthorized => write!(f, "未获得健康数据访问授权"),
        }
    }
}

/// 公开同步操作的返回结果
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// 同步完成
    Completed(SyncStats),
    /// 没有需要同步的数据（视为立即成功）
    NoData,
    /// 前置条件未满足，本次调用为空操作
    Rejected(PreconditionRejection),
}

/// 一次成功同步的统计信息
#[derive(Debug, Clone)]
pub struct SyncStats {
    pub sync_type: SyncType,
    /// 从数据源取到的样本总数
    pub total_samples: usize,
    /// 成功上报条数
    pub submitted: usize,
    /// 校验失败被跳过的条数
    pub skipped_invalid: usize,
    /// 上报块数
    pub chunks: usize,
    pub duration_ms: u64,
}

/// 各同步类型的默认回看窗口
pub fn default_window(
    sync_type: SyncType,
    now: DateTime<Utc>,
    initial_sync_days: i64,
) -> (DateTime<Utc>, DateTime<Utc>) {
    match sync_type {
        SyncType::Initial => (now - Duration::days(initial_sync_days), now),
        SyncType::Last24Hours => (now - Duration::days(1), now),
        // Historical / Incremental / NetworkRetry 的窗口由可用范围或间隙分析决定，
        // 这里仅作兜底
        _ => (now - Duration::days(initial_sync_days), now),
    }
}
