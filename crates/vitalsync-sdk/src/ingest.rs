//! 远端数据上报客户端
//!
//! 本模块定义上报契约（IngestClient），并提供基于 reqwest 的默认实现。
//! 上报接口以 `source_id` 为幂等键：同一条数据重复提交，服务端只保留一条记录，
//! 因此断点续传时重复上报是安全的。

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::fmt::Debug;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Result, VitalSyncError};
use crate::sdk::HttpClientConfig;
use crate::sync::VitalDataSubmission;

/// 远端上报契约
#[async_trait]
pub trait IngestClient: Send + Sync + Debug {
    /// 提交一批数据；以 source_id 幂等
    async fn submit_batch(&self, batch: &[VitalDataSubmission]) -> Result<()>;

    /// 请求服务端重算派生聚合（尽力而为，失败不影响已入库数据）
    async fn trigger_aggregation(&self, user_scope: &str) -> Result<()>;
}

#[derive(Serialize)]
struct BatchSubmitRequest<'a> {
    submissions: &'a [VitalDataSubmission],
}

#[derive(Serialize)]
struct AggregationRequest<'a> {
    user_scope: &'a str,
}

/// 基于 HTTP 的上报客户端
#[derive(Debug)]
pub struct HttpIngestClient {
    client: Client,
    base_url: String,
}

impl HttpIngestClient {
    /// 创建 HTTP 上报客户端
    pub fn new(config: &HttpClientConfig, base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into();
        if base_url.trim().is_empty() {
            return Err(VitalSyncError::Config("ingest base_url 不能为空".to_string()));
        }

        let mut builder = Client::builder();
        if let Some(timeout) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }
        if let Some(timeout) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }

        let client = builder
            .build()
            .map_err(|e| VitalSyncError::Other(format!("创建 HTTP 客户端失败: {}", e)))?;

        info!("✅ 上报客户端已创建: base_url={}", base_url);

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// 统一的响应状态映射
    async fn check_response(response: reqwest::Response) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let code = status.as_u16();
        let message = response.text().await.unwrap_or_default();
        if code == 401 || code == 403 {
            return Err(VitalSyncError::Auth(format!(
                "服务端拒绝当前凭证 [{}]: {}",
                code, message
            )));
        }
        Err(VitalSyncError::Server {
            status: code,
            message,
        })
    }
}

#[async_trait]
impl IngestClient for HttpIngestClient {
    async fn submit_batch(&self, batch: &[VitalDataSubmission]) -> Result<()> {
        let url = format!("{}/api/vitals/batch", self.base_url);
        debug!("提交数据块: count={}, url={}", batch.len(), url);

        let response = self
            .client
            .post(&url)
            .json(&BatchSubmitRequest { submissions: batch })
            .send()
            .await?;

        Self::check_response(response).await
    }

    async fn trigger_aggregation(&self, user_scope: &str) -> Result<()> {
        let url = format!("{}/api/vitals/aggregate", self.base_url);
        debug!("触发服务端聚合: user_scope={}, url={}", user_scope, url);

        let response = self
            .client
            .post(&url)
            .json(&AggregationRequest { user_scope })
            .send()
            .await?;

        Self::check_response(response).await
    }
}

#[cfg(test)]
pub mod test_helpers {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// 注入的失败类型
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum InjectedFailure {
        /// 连接类失败（可重试）
        Network,
        /// 授权失败（不可重试）
        Auth,
    }

    /// 测试用：内存上报端，按 source_id 跟踪已见数据以验证幂等性
    #[derive(Debug, Default)]
    pub struct MockIngestClient {
        seen_source_ids: Mutex<HashSet<String>>,
        accepted_batches: AtomicUsize,
        submitted_total: AtomicUsize,
        /// 接受 n 块之后开始失败；清除前持续失败
        fail_after_batches: Mutex<Option<(usize, InjectedFailure)>>,
        aggregation_calls: AtomicUsize,
        fail_aggregation: AtomicBool,
        /// 每块提交前的人工延迟（毫秒），用于并发测试
        delay_ms: AtomicUsize,
    }

    impl MockIngestClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_delay_ms(&self, delay_ms: usize) {
            self.delay_ms.store(delay_ms, Ordering::SeqCst);
        }

        /// 接受 n 块后开始注入失败
        pub async fn fail_after_batches(&self, n: usize, failure: InjectedFailure) {
            *self.fail_after_batches.lock().await = Some((n, failure));
        }

        /// 清除注入的失败（模拟网络恢复）
        pub async fn clear_failure(&self) {
            *self.fail_after_batches.lock().await = None;
        }

        pub fn set_fail_aggregation(&self, fail: bool) {
            self.fail_aggregation.store(fail, Ordering::SeqCst);
        }

        /// 服务端逻辑记录数（按 source_id 去重后）
        pub async fn unique_record_count(&self) -> usize {
            self.seen_source_ids.lock().await.len()
        }

        /// 成功接受的块数
        pub fn batch_count(&self) -> usize {
            self.accepted_batches.load(Ordering::SeqCst)
        }

        /// 收到的总条数（含重复上报）
        pub fn total_submitted(&self) -> usize {
            self.submitted_total.load(Ordering::SeqCst)
        }

        pub fn aggregation_count(&self) -> usize {
            self.aggregation_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl IngestClient for MockIngestClient {
        async fn submit_batch(&self, batch: &[VitalDataSubmission]) -> Result<()> {
            let delay_ms = self.delay_ms.load(Ordering::SeqCst);
            if delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms as u64)).await;
            }
            if let Some((n, failure)) = *self.fail_after_batches.lock().await {
                if self.accepted_batches.load(Ordering::SeqCst) >= n {
                    return Err(match failure {
                        InjectedFailure::Network => {
                            VitalSyncError::NetworkUnavailable("网络连接中断".to_string())
                        }
                        InjectedFailure::Auth => {
                            VitalSyncError::Auth("凭证已失效".to_string())
                        }
                    });
                }
            }

            let mut seen = self.seen_source_ids.lock().await;
            for submission in batch {
                seen.insert(submission.source_id.clone());
            }
            self.submitted_total.fetch_add(batch.len(), Ordering::SeqCst);
            self.accepted_batches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn trigger_aggregation(&self, _user_scope: &str) -> Result<()> {
            if self.fail_aggregation.load(Ordering::SeqCst) {
                return Err(VitalSyncError::Server {
                    status: 503,
                    message: "聚合服务暂不可用".to_string(),
                });
            }
            self.aggregation_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_mock_ingest_is_idempotent_by_source_id() {
        use crate::provider::RawSample;
        use chrono::Utc;

        let ingest = MockIngestClient::new();
        let submission = VitalDataSubmission::from_raw(RawSample {
            metric_type: "heart_rate".to_string(),
            value: 70.0,
            unit: "bpm".to_string(),
            measured_at: Utc::now(),
            source_record_id: Some("rec-1".to_string()),
        })
        .unwrap();

        // 同一条数据提交两次，服务端只有一条逻辑记录
        ingest.submit_batch(&[submission.clone()]).await.unwrap();
        ingest.submit_batch(&[submission]).await.unwrap();

        assert_eq!(ingest.unique_record_count().await, 1);
        assert_eq!(ingest.total_submitted(), 2);
    }
}
