//! VitalSync SDK - 健康数据同步 SDK
//!
//! 把设备本地的时间序列健康指标可靠地搬运到远端入库服务，提供：
//! - 🔁 可恢复同步：断点持久化，进程被杀、网络中断后从中断处续传
//! - 📡 网络状态监控：离线 → 在线自动触发重试
//! - 🔒 不重不漏：以 source_id 为幂等键，重复上报不产生重复记录
//! - ⏱️ 冷却与单飞：同一时刻至多一个同步会话，尝试间隔有下限
//! - 📊 进度事件：全序的不可变进度快照流，可恢复"上次正在同步"状态
//! - 🧵 并发安全：异步优先设计，显式取消令牌
//!
//! # 快速开始
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vitalsync_sdk::{VitalSyncConfig, VitalSyncSDK};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 配置 SDK
//!     let config = VitalSyncConfig::builder()
//!         .data_dir("/path/to/data")
//!         .ingest_base_url("https://ingest.example.com")
//!         .user_scope("user-42")
//!         .build();
//!
//!     // my_provider / my_listener 由平台层实现
//!     // （HealthDataProvider / NetworkStatusListener trait）
//!     let sdk = VitalSyncSDK::initialize_with_http(
//!         config,
//!         Arc::new(my_provider),
//!         Arc::new(my_listener),
//!     )
//!     .await?;
//!
//!     // 订阅进度
//!     let mut progress = sdk.subscribe_progress();
//!     tokio::spawn(async move {
//!         while let Ok(state) = progress.recv().await {
//!             println!("同步进度: {:.0}%", state.fraction() * 100.0);
//!         }
//!     });
//!
//!     // 发起初始同步
//!     sdk.perform_initial_sync().await?;
//!
//!     sdk.shutdown().await?;
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod error;
pub mod ingest;
pub mod lifecycle;
pub mod network;
pub mod progress;
pub mod provider;
pub mod sdk;
pub mod storage;
pub mod sync;
pub mod version;

// 重新导出核心类型，方便使用
pub use error::{Result, VitalSyncError};
pub use ingest::{HttpIngestClient, IngestClient};
pub use lifecycle::{LifecycleHook, LifecycleManager};
pub use network::{NetworkMonitor, NetworkStatus, NetworkStatusEvent, NetworkStatusListener};
pub use progress::{ProgressState, ProgressTracker};
pub use provider::{HealthDataProvider, RawSample};
pub use sdk::{HttpClientConfig, VitalSyncConfig, VitalSyncConfigBuilder, VitalSyncSDK};
pub use sync::{
    PreconditionRejection, ResumableSyncState, SyncManager, SyncOutcome, SyncSession, SyncStats,
    SyncType, VitalDataSubmission,
};
pub use version::SDK_VERSION;
