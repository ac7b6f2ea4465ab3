//! VitalSync SDK 装配层
//!
//! 配置、构建器与 SDK 门面。组件采用显式构造与单向所有权：
//! SDK 持有编排器，编排器持有各子组件，没有全局可变单例；
//! 网络恢复触发、启动续传、前台补偿同步都在这里接线，
//! 单飞约束始终由编排器裁决。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Result, VitalSyncError};
use crate::ingest::{HttpIngestClient, IngestClient};
use crate::lifecycle::{LifecycleHook, LifecycleManager};
use crate::network::{NetworkMonitor, NetworkStatusEvent, NetworkStatusListener};
use crate::progress::{ProgressState, ProgressTracker};
use crate::provider::HealthDataProvider;
use crate::storage::{KvStore, SyncStore};
use crate::sync::{DataProcessor, SyncManager, SyncOutcome, WatermarkManager};
use crate::version::SDK_VERSION;

/// HTTP 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 请求超时（秒）
    pub request_timeout_secs: Option<u64>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(10),
            request_timeout_secs: Some(30),
        }
    }
}

/// VitalSync SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VitalSyncConfig {
    /// 数据存储目录
    pub data_dir: PathBuf,
    /// 上报服务 API 基础 URL（使用内置 HTTP 客户端时必填）
    ///
    /// 例如：https://ingest.example.com
    pub ingest_base_url: Option<String>,
    /// 用户作用域（聚合重算的范围标识）
    pub user_scope: String,
    /// 要同步的指标类型列表
    pub metric_types: Vec<String>,
    /// 单块上报条数上限
    pub chunk_size: usize,
    /// 两次同步尝试之间的最小间隔（秒）
    pub cooldown_secs: u64,
    /// 初始同步回看天数
    pub initial_sync_days: i64,
    /// 增量同步无水位线时的回退回看天数
    pub incremental_fallback_days: i64,
    /// 进度/网络事件广播缓冲区大小
    pub event_buffer_size: usize,
    /// HTTP 客户端配置
    pub http_config: HttpClientConfig,
    /// 调试模式
    pub debug_mode: bool,
}

impl Default for VitalSyncConfig {
    fn default() -> Self {
        Self {
            data_dir: get_default_data_dir(),
            ingest_base_url: None,
            user_scope: "default".to_string(),
            metric_types: vec![
                "heart_rate".to_string(),
                "blood_oxygen".to_string(),
                "body_temperature".to_string(),
                "respiratory_rate".to_string(),
                "step_count".to_string(),
            ],
            chunk_size: 50,
            cooldown_secs: 30,
            initial_sync_days: 30,
            incremental_fallback_days: 30,
            event_buffer_size: 64,
            http_config: HttpClientConfig::default(),
            debug_mode: false,
        }
    }
}

/// 获取默认数据目录 ~/.vitalsync/
fn get_default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".vitalsync")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        // Windows 支持
        home_dir.join(".vitalsync")
    } else {
        // 无法获取用户主目录时回退到当前目录
        PathBuf::from("./vitalsync_data")
    }
}

impl VitalSyncConfig {
    pub fn builder() -> VitalSyncConfigBuilder {
        VitalSyncConfigBuilder::new()
    }

    /// 配置合法性检查
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(VitalSyncError::Config("chunk_size 必须大于 0".to_string()));
        }
        if self.initial_sync_days <= 0 || self.incremental_fallback_days <= 0 {
            return Err(VitalSyncError::Config("回看天数必须大于 0".to_string()));
        }
        if self.metric_types.is_empty() {
            return Err(VitalSyncError::Config("metric_types 不能为空".to_string()));
        }
        Ok(())
    }
}

/// VitalSync SDK 配置构建器
pub struct VitalSyncConfigBuilder {
    config: VitalSyncConfig,
}

impl VitalSyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: VitalSyncConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn ingest_base_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.ingest_base_url = Some(url.into());
        self
    }

    pub fn user_scope<S: Into<String>>(mut self, scope: S) -> Self {
        self.config.user_scope = scope.into();
        self
    }

    /// 设置要同步的指标类型列表
    pub fn metric_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.metric_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// 追加一个指标类型
    pub fn add_metric_type<S: Into<String>>(mut self, metric: S) -> Self {
        self.config.metric_types.push(metric.into());
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.config.chunk_size = chunk_size;
        self
    }

    pub fn cooldown_secs(mut self, secs: u64) -> Self {
        self.config.cooldown_secs = secs;
        self
    }

    pub fn initial_sync_days(mut self, days: i64) -> Self {
        self.config.initial_sync_days = days;
        self
    }

    pub fn incremental_fallback_days(mut self, days: i64) -> Self {
        self.config.incremental_fallback_days = days;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn http_config(mut self, http_config: HttpClientConfig) -> Self {
        self.config.http_config = http_config;
        self
    }

    pub fn debug_mode(mut self, debug: bool) -> Self {
        self.config.debug_mode = debug;
        self
    }

    pub fn build(self) -> VitalSyncConfig {
        self.config
    }
}

impl Default for VitalSyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// VitalSync SDK
///
/// 顶层门面：装配并持有同步引擎的全部组件。
pub struct VitalSyncSDK {
    config: Arc<VitalSyncConfig>,
    store: Arc<SyncStore>,
    progress: Arc<ProgressTracker>,
    network: Arc<NetworkMonitor>,
    manager: Arc<SyncManager>,
    provider: Arc<dyn HealthDataProvider>,
    lifecycle: RwLock<LifecycleManager>,
}

impl VitalSyncSDK {
    /// 初始化 SDK
    ///
    /// 装配存储、网络监控、进度跟踪、数据处理与编排器；
    /// 启动网络恢复触发任务；检查上个进程生命周期的中断会话并安排续传。
    pub async fn initialize(
        config: VitalSyncConfig,
        provider: Arc<dyn HealthDataProvider>,
        ingest: Arc<dyn IngestClient>,
        listener: Arc<dyn NetworkStatusListener>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        info!(
            "🚀 初始化 VitalSync SDK: version={}, data_dir={}",
            SDK_VERSION,
            config.data_dir.display()
        );
        let config = Arc::new(config);

        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .map_err(|e| VitalSyncError::Io(format!("创建数据目录失败: {}", e)))?;

        let kv = KvStore::open(&config.data_dir).await?;
        let store = Arc::new(SyncStore::new(kv));
        let watermarks = Arc::new(WatermarkManager::new(store.clone()));
        let progress = Arc::new(ProgressTracker::new(store.clone(), config.event_buffer_size));
        let network = Arc::new(NetworkMonitor::new(listener, config.event_buffer_size));
        network.start().await?;

        let processor = Arc::new(DataProcessor::new(
            provider.clone(),
            ingest,
            store.clone(),
            watermarks.clone(),
            config.clone(),
        ));
        let manager = Arc::new(SyncManager::new(
            config.clone(),
            provider.clone(),
            store.clone(),
            watermarks,
            progress.clone(),
            network.clone(),
            processor,
        ));

        // 网络恢复触发：离线 → 在线 且存在待重试同步时续传
        Self::spawn_restore_trigger(network.clone(), manager.clone());

        // 生命周期：回到前台时补一次待重试同步
        let mut lifecycle = LifecycleManager::new();
        lifecycle.register_hook(Arc::new(ForegroundSyncHook {
            network: network.clone(),
            manager: manager.clone(),
        }));

        // 启动恢复：上个进程中断的会话优先续传，而不是重新同步
        let has_pending = manager.restore_on_launch().await?;
        if has_pending && network.is_network_available().await {
            Self::spawn_retry(manager.clone());
        }

        Ok(Arc::new(Self {
            config,
            store,
            progress,
            network,
            manager,
            provider,
            lifecycle: RwLock::new(lifecycle),
        }))
    }

    /// 使用内置 HTTP 上报客户端初始化
    pub async fn initialize_with_http(
        config: VitalSyncConfig,
        provider: Arc<dyn HealthDataProvider>,
        listener: Arc<dyn NetworkStatusListener>,
    ) -> Result<Arc<Self>> {
        let base_url = config.ingest_base_url.clone().ok_or_else(|| {
            VitalSyncError::Config("使用内置 HTTP 上报客户端必须配置 ingest_base_url".to_string())
        })?;
        let ingest = Arc::new(HttpIngestClient::new(&config.http_config, base_url)?);
        Self::initialize(config, provider, ingest, listener).await
    }

    /// 订阅网络恢复事件并发起续传
    fn spawn_restore_trigger(network: Arc<NetworkMonitor>, manager: Arc<SyncManager>) {
        let mut receiver = network.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                if event.is_restore() && network.has_failed_sync_pending_retry().await {
                    info!("📡 网络已恢复，尝试续传待重试同步");
                    Self::retry_with_jitter(&manager).await;
                }
            }
        });
    }

    fn spawn_retry(manager: Arc<SyncManager>) {
        tokio::spawn(async move {
            Self::retry_with_jitter(&manager).await;
        });
    }

    /// 带随机退避的重试，避免大量设备同一时刻恢复网络造成惊群
    async fn retry_with_jitter(manager: &SyncManager) {
        let jitter_ms = 500 + rand::random::<u64>() % 1500;
        tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
        match manager.network_retry_sync().await {
            Ok(outcome) => debug!("重试同步结束: outcome={:?}", outcome),
            Err(e) => warn!("重试同步失败: error={}", e),
        }
    }

    // ============================================================
    // 同步操作（全部委托给编排器）
    // ============================================================

    /// 初始同步：最近 30 天
    pub async fn perform_initial_sync(&self) -> Result<SyncOutcome> {
        self.manager.perform_initial_sync().await
    }

    /// 历史同步：从数据源最早可用时间开始回填
    pub async fn perform_historical_sync(&self) -> Result<SyncOutcome> {
        self.manager.perform_historical_sync().await
    }

    /// 增量同步：间隙分析
    pub async fn perform_incremental_sync(&self) -> Result<SyncOutcome> {
        self.manager.perform_incremental_sync().await
    }

    /// 最近 24 小时同步
    pub async fn perform_last_24_hours_sync(&self) -> Result<SyncOutcome> {
        self.manager.perform_last_24_hours_sync().await
    }

    /// 手动重试（豁免冷却，不豁免单飞）
    pub async fn manual_retry_sync(&self) -> Result<SyncOutcome> {
        self.manager.manual_retry_sync().await
    }

    /// 重置同步进度与断点（取消在途 I/O）
    pub async fn clear_sync_progress(&self) -> Result<()> {
        self.manager.clear_sync_progress().await
    }

    // ============================================================
    // 可观测状态
    // ============================================================

    /// 当前进度快照
    pub async fn progress_state(&self) -> ProgressState {
        self.progress.snapshot().await
    }

    /// 订阅进度快照流（全序）
    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressState> {
        self.progress.subscribe()
    }

    /// 当前网络是否可用
    pub async fn is_network_available(&self) -> bool {
        self.network.is_network_available().await
    }

    /// 订阅网络状态变化
    pub fn subscribe_network(&self) -> broadcast::Receiver<NetworkStatusEvent> {
        self.network.subscribe()
    }

    /// 是否存在等待重试的失败同步
    pub async fn has_failed_sync_pending_retry(&self) -> bool {
        self.network.has_failed_sync_pending_retry().await
    }

    /// 数据源是否已授权
    pub async fn is_authorized(&self) -> bool {
        self.provider.is_authorized().await
    }

    /// 发起数据源授权流程
    pub async fn request_authorization(&self) -> Result<bool> {
        self.provider.request_authorization().await
    }

    pub fn config(&self) -> &VitalSyncConfig {
        &self.config
    }

    // ============================================================
    // 生命周期
    // ============================================================

    /// App 切换到前台
    pub async fn on_foreground(&self) {
        self.lifecycle.read().await.notify_foreground().await;
    }

    /// App 切换到后台
    pub async fn on_background(&self) {
        self.lifecycle.read().await.notify_background().await;
    }

    /// 关停 SDK：取消在途 I/O（断点保留，下次启动续传）并落盘
    pub async fn shutdown(&self) -> Result<()> {
        info!("🛑 VitalSync SDK 关停中");
        self.manager.cancel_in_flight().await;
        self.network.stop().await;
        self.store.flush().await?;
        Ok(())
    }
}

/// 回到前台时补偿待重试同步的 Hook
struct ForegroundSyncHook {
    network: Arc<NetworkMonitor>,
    manager: Arc<SyncManager>,
}

#[async_trait::async_trait]
impl LifecycleHook for ForegroundSyncHook {
    async fn on_background(&self) -> Result<()> {
        Ok(())
    }

    async fn on_foreground(&self) -> Result<()> {
        if self.network.is_network_available().await
            && self.network.has_failed_sync_pending_retry().await
        {
            info!("前台恢复，补偿待重试同步");
            VitalSyncSDK::spawn_retry(self.manager.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::test_helpers::MockIngestClient;
    use crate::network::test_helpers::DummyNetworkStatusListener;
    use crate::provider::test_helpers::MockHealthProvider;
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn test_builder_defaults() {
        let config = VitalSyncConfig::builder().build();
        assert_eq!(config.chunk_size, 50);
        assert_eq!(config.cooldown_secs, 30);
        assert_eq!(config.initial_sync_days, 30);
        assert!(!config.metric_types.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_overrides() {
        let config = VitalSyncConfig::builder()
            .data_dir("/tmp/vitalsync-test")
            .ingest_base_url("https://ingest.example.com")
            .user_scope("user-42")
            .metric_types(["heart_rate"])
            .add_metric_type("blood_oxygen")
            .chunk_size(25)
            .cooldown_secs(60)
            .build();
        assert_eq!(config.chunk_size, 25);
        assert_eq!(config.cooldown_secs, 60);
        assert_eq!(config.metric_types, vec!["heart_rate", "blood_oxygen"]);
        assert_eq!(
            config.ingest_base_url.as_deref(),
            Some("https://ingest.example.com")
        );
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        let config = VitalSyncConfig::builder().chunk_size(0).build();
        assert!(config.validate().is_err());

        let config = VitalSyncConfig::builder()
            .metric_types(Vec::<String>::new())
            .build();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_initialize_and_sync_through_facade() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(MockHealthProvider::new());
        let now = Utc::now();
        provider
            .set_samples(MockHealthProvider::make_samples(
                "heart_rate",
                20,
                now - chrono::Duration::days(5),
                now - chrono::Duration::hours(1),
            ))
            .await;
        let ingest = Arc::new(MockIngestClient::new());
        let listener = Arc::new(DummyNetworkStatusListener::default());

        let config = VitalSyncConfig::builder()
            .data_dir(dir.path())
            .chunk_size(10)
            .cooldown_secs(0)
            .build();
        let sdk = VitalSyncSDK::initialize(config, provider, ingest.clone(), listener)
            .await
            .unwrap();

        assert!(sdk.is_authorized().await);
        assert!(sdk.is_network_available().await);

        let outcome = sdk.perform_initial_sync().await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Completed(_)));
        assert_eq!(ingest.unique_record_count().await, 20);

        let progress = sdk.progress_state().await;
        assert!(!progress.is_syncing);
        assert_eq!(progress.current, 20);

        sdk.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_restore_triggers_resume() {
        use crate::ingest::test_helpers::InjectedFailure;
        use crate::network::NetworkStatus;

        let dir = TempDir::new().unwrap();
        let provider = Arc::new(MockHealthProvider::new());
        let now = Utc::now();
        provider
            .set_samples(MockHealthProvider::make_samples(
                "heart_rate",
                20,
                now - chrono::Duration::days(5),
                now - chrono::Duration::hours(1),
            ))
            .await;
        let ingest = Arc::new(MockIngestClient::new());
        let listener = Arc::new(DummyNetworkStatusListener::default());

        let config = VitalSyncConfig::builder()
            .data_dir(dir.path())
            .chunk_size(10)
            .cooldown_secs(0)
            .build();
        let sdk = VitalSyncSDK::initialize(
            config,
            provider,
            ingest.clone(),
            listener.clone(),
        )
        .await
        .unwrap();

        // 第一块成功后网络中断，会话以可重试方式失败
        ingest.fail_after_batches(1, InjectedFailure::Network).await;
        sdk.perform_initial_sync().await.unwrap_err();
        assert!(sdk.has_failed_sync_pending_retry().await);

        // 网络恢复：离线 → 在线 触发自动续传
        ingest.clear_failure().await;
        listener.push_status(NetworkStatus::Offline).await;
        listener.push_status(NetworkStatus::Online).await;

        // 等待触发任务完成续传（paused 时钟下 sleep 自动快进）
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if !sdk.has_failed_sync_pending_retry().await
                && ingest.unique_record_count().await == 20
            {
                break;
            }
        }
        assert_eq!(ingest.unique_record_count().await, 20);
        assert!(!sdk.has_failed_sync_pending_retry().await);
        let progress = sdk.progress_state().await;
        assert!(!progress.is_syncing);
        assert!(progress.error_message.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreground_compensates_pending_retry() {
        use crate::ingest::test_helpers::InjectedFailure;

        let dir = TempDir::new().unwrap();
        let provider = Arc::new(MockHealthProvider::new());
        let now = Utc::now();
        provider
            .set_samples(MockHealthProvider::make_samples(
                "heart_rate",
                10,
                now - chrono::Duration::days(2),
                now - chrono::Duration::hours(1),
            ))
            .await;
        let ingest = Arc::new(MockIngestClient::new());
        let listener = Arc::new(DummyNetworkStatusListener::default());

        let config = VitalSyncConfig::builder()
            .data_dir(dir.path())
            .chunk_size(5)
            .cooldown_secs(0)
            .build();
        let sdk = VitalSyncSDK::initialize(config, provider, ingest.clone(), listener)
            .await
            .unwrap();

        ingest.fail_after_batches(1, InjectedFailure::Network).await;
        sdk.perform_initial_sync().await.unwrap_err();
        assert!(sdk.has_failed_sync_pending_retry().await);

        // 回到前台时补偿待重试同步
        ingest.clear_failure().await;
        sdk.on_foreground().await;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if ingest.unique_record_count().await == 10 {
                break;
            }
        }
        assert_eq!(ingest.unique_record_count().await, 10);
        assert!(!sdk.has_failed_sync_pending_retry().await);
    }

    #[tokio::test]
    async fn test_initialize_with_http_requires_base_url() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(MockHealthProvider::new());
        let listener = Arc::new(DummyNetworkStatusListener::default());
        let config = VitalSyncConfig::builder().data_dir(dir.path()).build();

        let result = VitalSyncSDK::initialize_with_http(config, provider, listener).await;
        assert!(matches!(result, Err(VitalSyncError::Config(_))));
    }
}
