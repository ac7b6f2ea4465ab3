//! 错误类型定义
//!
//! 全 SDK 统一使用 `VitalSyncError`，并按"可否重试"分类：
//! - 连接类错误（超时、网络不可用、5xx）可重试，同步引擎保留断点并等待网络恢复
//! - 授权类错误不可自动重试，必须重新授权后再发起同步
//! - 单条数据校验错误只跳过该条，不影响整批

use thiserror::Error;

pub type Result<T> = std::result::Result<T, VitalSyncError>;

#[derive(Debug, Error)]
pub enum VitalSyncError {
    /// 网络超时 - 等待恢复后重试
    #[error("Network timeout: {0}")]
    NetworkTimeout(String),
    /// 网络不可用 - 等待恢复后重试
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),
    /// 服务端错误 - 根据状态码决定是否重试
    #[error("Server error [{status}]: {message}")]
    Server { status: u16, message: String },
    /// 授权失败 - 需要重新授权，不自动重试
    #[error("Authorization error: {0}")]
    Auth(String),
    /// 单条数据校验失败 - 跳过该条并记录日志
    #[error("Validation error: {0}")]
    Validation(String),
    /// KV 存储错误
    #[error("KV store error: {0}")]
    KvStore(String),
    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// IO 错误
    #[error("IO error: {0}")]
    Io(String),
    /// 配置错误
    #[error("Config error: {0}")]
    Config(String),
    /// 同步被主动取消（clear_sync_progress 等）
    #[error("Sync cancelled")]
    Cancelled,
    /// 其他错误
    #[error("Other error: {0}")]
    Other(String),
}

impl From<sled::Error> for VitalSyncError {
    fn from(error: sled::Error) -> Self {
        VitalSyncError::KvStore(error.to_string())
    }
}

impl From<serde_json::Error> for VitalSyncError {
    fn from(error: serde_json::Error) -> Self {
        VitalSyncError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for VitalSyncError {
    fn from(error: std::io::Error) -> Self {
        VitalSyncError::Io(error.to_string())
    }
}

impl From<reqwest::Error> for VitalSyncError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return VitalSyncError::NetworkTimeout(error.to_string());
        }
        if error.is_connect() {
            return VitalSyncError::NetworkUnavailable(error.to_string());
        }
        if let Some(status) = error.status() {
            let code = status.as_u16();
            if code == 401 || code == 403 {
                return VitalSyncError::Auth(error.to_string());
            }
            return VitalSyncError::Server {
                status: code,
                message: error.to_string(),
            };
        }
        VitalSyncError::Other(error.to_string())
    }
}

impl VitalSyncError {
    /// 判断是否可以重试
    pub fn is_retryable(&self) -> bool {
        match self {
            VitalSyncError::NetworkTimeout(_) => true,
            VitalSyncError::NetworkUnavailable(_) => true,
            VitalSyncError::Server { status, .. } => {
                // 5xx 服务端错误可重试，429 限流可延迟重试，其余 4xx 不重试
                (*status >= 500 && *status < 600) || *status == 429
            }
            VitalSyncError::Auth(_) => false,
            VitalSyncError::Validation(_) => false,
            VitalSyncError::Cancelled => false,
            VitalSyncError::KvStore(_) => false,
            VitalSyncError::Serialization(_) => false,
            VitalSyncError::Io(_) => false,
            VitalSyncError::Config(_) => false,
            VitalSyncError::Other(_) => true, // 保守策略：未知错误可重试
        }
    }

    /// 获取重试延迟倍数
    pub fn retry_delay_multiplier(&self) -> f64 {
        match self {
            VitalSyncError::NetworkTimeout(_) => 1.0,
            VitalSyncError::NetworkUnavailable(_) => 2.0,
            VitalSyncError::Server { status, .. } if *status == 429 => 3.0, // 限流需要更长延迟
            VitalSyncError::Server { .. } => 1.5,
            _ => 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(VitalSyncError::NetworkTimeout("t".into()).is_retryable());
        assert!(VitalSyncError::NetworkUnavailable("n".into()).is_retryable());
        assert!(VitalSyncError::Server {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(VitalSyncError::Server {
            status: 429,
            message: "rate limited".into()
        }
        .is_retryable());

        assert!(!VitalSyncError::Server {
            status: 400,
            message: "bad request".into()
        }
        .is_retryable());
        assert!(!VitalSyncError::Auth("expired".into()).is_retryable());
        assert!(!VitalSyncError::Validation("bad sample".into()).is_retryable());
        assert!(!VitalSyncError::Cancelled.is_retryable());
    }

    #[test]
    fn test_delay_multiplier() {
        let rate_limited = VitalSyncError::Server {
            status: 429,
            message: "slow down".into(),
        };
        assert!(rate_limited.retry_delay_multiplier() > 2.0);
        assert_eq!(
            VitalSyncError::NetworkTimeout("t".into()).retry_delay_multiplier(),
            1.0
        );
    }
}
