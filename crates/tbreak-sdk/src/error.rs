//! 错误类型定义
//!
//! SDK 的统一错误分类。写路由与重放引擎依赖这里的连接类/拒绝类
//! 划分来决定"入队等待"还是"原样抛出"。

use std::fmt;

/// T-Break SDK 错误类型
#[derive(Debug)]
pub enum TBreakSDKError {
    /// 本地存储错误（sled）
    Store(String),
    /// 序列化/反序列化错误
    Serialization(String),
    /// IO 错误
    IO(String),
    /// 本地存储架构版本不兼容
    Migration(String),
    /// 本地存储空间耗尽
    QuotaExceeded(String),
    /// 当前离线，无法直达远端
    NotConnected,
    /// 网络层故障（连接失败、断网）
    Transport(String),
    /// 请求超时
    Timeout(String),
    /// 远端拒绝（非 2xx 响应）
    Rejected { status: u16, message: String },
    /// 配置错误
    Config(String),
    /// 输入参数非法
    InvalidInput(String),
    /// SDK 正在关停
    ShuttingDown(String),
    /// 其他错误
    Other(String),
}

impl fmt::Display for TBreakSDKError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TBreakSDKError::Store(msg) => write!(f, "Store error: {}", msg),
            TBreakSDKError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            TBreakSDKError::IO(msg) => write!(f, "IO error: {}", msg),
            TBreakSDKError::Migration(msg) => write!(f, "Migration error: {}", msg),
            TBreakSDKError::QuotaExceeded(msg) => write!(f, "Quota exceeded: {}", msg),
            TBreakSDKError::NotConnected => write!(f, "Not connected"),
            TBreakSDKError::Transport(msg) => write!(f, "Transport error: {}", msg),
            TBreakSDKError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            TBreakSDKError::Rejected { status, message } => {
                write!(f, "Rejected by remote [{}]: {}", status, message)
            }
            TBreakSDKError::Config(msg) => write!(f, "Config error: {}", msg),
            TBreakSDKError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            TBreakSDKError::ShuttingDown(msg) => write!(f, "Shutting down: {}", msg),
            TBreakSDKError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for TBreakSDKError {}

impl TBreakSDKError {
    /// 是否为连接类错误
    ///
    /// 连接类错误意味着请求"尚未到达远端"，写路由会把这类失败降级
    /// 为入队；拒绝类错误（[`Rejected`](Self::Rejected)）则原样抛出。
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            TBreakSDKError::NotConnected
                | TBreakSDKError::Transport(_)
                | TBreakSDKError::Timeout(_)
        )
    }

    /// 是否为本地存储空间耗尽
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, TBreakSDKError::QuotaExceeded(_))
    }
}

impl From<serde_json::Error> for TBreakSDKError {
    fn from(error: serde_json::Error) -> Self {
        TBreakSDKError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for TBreakSDKError {
    fn from(error: std::io::Error) -> Self {
        if is_disk_full(&error) {
            TBreakSDKError::QuotaExceeded(error.to_string())
        } else {
            TBreakSDKError::IO(error.to_string())
        }
    }
}

impl From<sled::Error> for TBreakSDKError {
    fn from(error: sled::Error) -> Self {
        if let sled::Error::Io(io_error) = &error {
            if is_disk_full(io_error) {
                return TBreakSDKError::QuotaExceeded(error.to_string());
            }
        }
        TBreakSDKError::Store(error.to_string())
    }
}

impl From<reqwest::Error> for TBreakSDKError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            TBreakSDKError::Timeout(error.to_string())
        } else {
            TBreakSDKError::Transport(error.to_string())
        }
    }
}

/// ENOSPC 判定：磁盘满时 sled/std 的 IO 错误都会带上这个 os error
fn is_disk_full(error: &std::io::Error) -> bool {
    error.raw_os_error() == Some(28) || error.to_string().contains("No space left")
}

/// SDK 统一的 Result 类型
pub type Result<T> = std::result::Result<T, TBreakSDKError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_classification() {
        assert!(TBreakSDKError::NotConnected.is_connectivity());
        assert!(TBreakSDKError::Transport("connection refused".to_string()).is_connectivity());
        assert!(TBreakSDKError::Timeout("30s".to_string()).is_connectivity());

        let rejected = TBreakSDKError::Rejected {
            status: 400,
            message: "bad request".to_string(),
        };
        assert!(!rejected.is_connectivity());
        assert!(!TBreakSDKError::Store("broken".to_string()).is_connectivity());
    }

    #[test]
    fn test_disk_full_maps_to_quota_exceeded() {
        let io_error = std::io::Error::from_raw_os_error(28);
        let error = TBreakSDKError::from(io_error);
        assert!(error.is_quota_exceeded());

        let sled_error = sled::Error::Io(std::io::Error::from_raw_os_error(28));
        let error = TBreakSDKError::from(sled_error);
        assert!(error.is_quota_exceeded());
    }

    #[test]
    fn test_display_includes_status() {
        let rejected = TBreakSDKError::Rejected {
            status: 409,
            message: "conflict".to_string(),
        };
        let text = rejected.to_string();
        assert!(text.contains("409"));
        assert!(text.contains("conflict"));
    }
}
