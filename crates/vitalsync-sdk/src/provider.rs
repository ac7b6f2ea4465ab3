//! 本地健康数据源接入
//!
//! 数据源（HealthKit / Health Connect 等）由平台层实现，SDK 只消费其契约：
//! 按时间范围拉取原始样本、报告可用范围、授权检查与授权请求入口。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Debug;

use crate::error::Result;

/// 数据源返回的原始样本
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    /// 指标类型（heart_rate、blood_oxygen 等）
    pub metric_type: String,
    /// 数值
    pub value: f64,
    /// 单位
    pub unit: String,
    /// 测量时间
    pub measured_at: DateTime<Utc>,
    /// 数据源记录的稳定标识（可选；缺失时 SDK 从内容派生幂等键）
    pub source_record_id: Option<String>,
}

/// 健康数据源 trait（由平台层实现，如 iOS/Android）
#[async_trait]
pub trait HealthDataProvider: Send + Sync + Debug {
    /// 当前是否已获得数据访问授权
    async fn is_authorized(&self) -> bool;

    /// 发起授权请求；返回授权是否通过
    async fn request_authorization(&self) -> Result<bool>;

    /// 拉取指定指标在 [from, to] 范围内的原始样本（含区间端点）
    async fn fetch_samples(
        &self,
        metric_types: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RawSample>>;

    /// 数据源报告的本地数据可用范围 (最早, 最晚)；没有任何数据时返回 `None`
    async fn availability_range(&self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>>;
}

#[cfg(test)]
pub mod test_helpers {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::RwLock;

    use crate::error::VitalSyncError;

    /// 测试用：内存健康数据源
    #[derive(Debug, Default)]
    pub struct MockHealthProvider {
        samples: Arc<RwLock<Vec<RawSample>>>,
        authorized: AtomicBool,
        /// 设置后 fetch_samples 返回该错误（取出后清空）
        fail_fetch_with_auth_error: AtomicBool,
    }

    impl MockHealthProvider {
        pub fn new() -> Self {
            let provider = Self::default();
            provider.authorized.store(true, Ordering::SeqCst);
            provider
        }

        pub fn set_authorized(&self, authorized: bool) {
            self.authorized.store(authorized, Ordering::SeqCst);
        }

        /// 下一次 fetch 返回授权错误（模拟中途被撤销授权）
        pub fn fail_next_fetch_with_auth_error(&self) {
            self.fail_fetch_with_auth_error.store(true, Ordering::SeqCst);
        }

        pub async fn set_samples(&self, samples: Vec<RawSample>) {
            *self.samples.write().await = samples;
        }

        /// 在 [from, to) 内均匀生成 count 条样本
        pub fn make_samples(
            metric_type: &str,
            count: usize,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Vec<RawSample> {
            let span_ms = (to - from).num_milliseconds().max(1);
            (0..count)
                .map(|i| {
                    let offset_ms = span_ms * i as i64 / count.max(1) as i64;
                    RawSample {
                        metric_type: metric_type.to_string(),
                        value: 60.0 + (i % 40) as f64,
                        unit: "bpm".to_string(),
                        measured_at: from + chrono::Duration::milliseconds(offset_ms),
                        source_record_id: Some(format!("{}-{}", metric_type, i)),
                    }
                })
                .collect()
        }
    }

    #[async_trait]
    impl HealthDataProvider for MockHealthProvider {
        async fn is_authorized(&self) -> bool {
            self.authorized.load(Ordering::SeqCst)
        }

        async fn request_authorization(&self) -> Result<bool> {
            self.authorized.store(true, Ordering::SeqCst);
            Ok(true)
        }

        async fn fetch_samples(
            &self,
            metric_types: &[String],
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<Vec<RawSample>> {
            if self.fail_fetch_with_auth_error.swap(false, Ordering::SeqCst) {
                return Err(VitalSyncError::Auth("数据访问授权已被撤销".to_string()));
            }
            let samples = self.samples.read().await;
            Ok(samples
                .iter()
                .filter(|s| {
                    metric_types.iter().any(|m| m == &s.metric_type)
                        && s.measured_at >= from
                        && s.measured_at <= to
                })
                .cloned()
                .collect())
        }

        async fn availability_range(&self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
            let samples = self.samples.read().await;
            let earliest = samples.iter().map(|s| s.measured_at).min();
            let latest = samples.iter().map(|s| s.measured_at).max();
            Ok(earliest.zip(latest))
        }
    }
}
