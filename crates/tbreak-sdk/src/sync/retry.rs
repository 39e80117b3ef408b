//! 重试策略 - 重放失败分类与退避参数
//!
//! 两级预算：
//! - 单条变更的累计重放次数（超限后放弃该条，避免毒丸卡死队列）
//! - 单次排空的重试轮数（队列未排净时按指数退避再来一轮）

use crate::error::TBreakSDKError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 重放失败原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayFailureReason {
    /// 请求超时
    NetworkTimeout,
    /// 连接不可达（断网、DNS、拒绝连接）
    NetworkUnavailable,
    /// 远端 5xx
    ServerError(u16),
    /// 远端限流（429）
    RateLimited,
    /// 其他未归类失败
    Unknown(String),
}

impl ReplayFailureReason {
    /// 是否值得保留在队列里等下一轮重放
    ///
    /// 连接类故障和服务端故障都是暂时的；4xx 说明变更本身有问题，
    /// 重放多少次都不会变好。
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplayFailureReason::NetworkTimeout => true,
            ReplayFailureReason::NetworkUnavailable => true,
            ReplayFailureReason::ServerError(status) => (500..600).contains(status),
            ReplayFailureReason::RateLimited => true,
            ReplayFailureReason::Unknown(_) => true,
        }
    }
}

impl From<&TBreakSDKError> for ReplayFailureReason {
    fn from(error: &TBreakSDKError) -> Self {
        match error {
            TBreakSDKError::Timeout(_) => ReplayFailureReason::NetworkTimeout,
            TBreakSDKError::Transport(_) | TBreakSDKError::NotConnected => {
                ReplayFailureReason::NetworkUnavailable
            }
            TBreakSDKError::Rejected { status: 429, .. } => ReplayFailureReason::RateLimited,
            TBreakSDKError::Rejected { status, .. } => ReplayFailureReason::ServerError(*status),
            other => ReplayFailureReason::Unknown(other.to_string()),
        }
    }
}

impl std::fmt::Display for ReplayFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplayFailureReason::NetworkTimeout => write!(f, "network timeout"),
            ReplayFailureReason::NetworkUnavailable => write!(f, "network unavailable"),
            ReplayFailureReason::ServerError(status) => write!(f, "server error ({})", status),
            ReplayFailureReason::RateLimited => write!(f, "rate limited"),
            ReplayFailureReason::Unknown(msg) => write!(f, "unknown failure: {}", msg),
        }
    }
}

/// 重试策略参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 单条变更的累计重放次数上限，超过即放弃
    pub max_replay_attempts: u32,
    /// 单次排空的重试轮数上限
    pub max_cycles: u32,
    /// 轮间退避基础延迟（秒）
    pub base_delay_seconds: u64,
    /// 轮间退避延迟上限（秒）
    pub max_delay_seconds: u64,
    /// 退避倍率
    pub backoff_factor: f64,
    /// 抖动系数（0.1 表示在 ±5% 内摆动）
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_replay_attempts: 10,
            max_cycles: 5,
            base_delay_seconds: 1,
            max_delay_seconds: 300,
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// 该变更的累计重放次数是否已到上限
    pub fn is_over_attempt_budget(&self, attempts: u32) -> bool {
        attempts >= self.max_replay_attempts
    }

    /// 是否允许再来一轮排空
    pub fn should_retry_cycle(&self, cycles_done: u32) -> bool {
        cycles_done < self.max_cycles
    }

    /// 第 `cycle` 轮（从 0 计）之后的退避延迟
    pub fn cycle_delay(&self, cycle: u32) -> Duration {
        let base = self.base_delay_seconds as f64 * self.backoff_factor.powf(cycle as f64);
        let capped = base.min(self.max_delay_seconds as f64);
        let jitter = capped * self.jitter_factor * (rand::thread_rng().gen::<f64>() - 0.5);
        let delayed = (capped + jitter).max(0.0);
        Duration::from_millis((delayed * 1000.0) as u64)
    }
}

/// 放弃重放的记录（写进日志，方便排查毒丸变更）
#[derive(Debug, thiserror::Error)]
#[error("replay abandoned: {change_id} after {attempts} attempts (limit {limit})")]
pub struct ReplayAbandoned {
    pub change_id: String,
    pub attempts: u32,
    pub limit: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ReplayFailureReason::NetworkTimeout.is_retryable());
        assert!(ReplayFailureReason::NetworkUnavailable.is_retryable());
        assert!(ReplayFailureReason::RateLimited.is_retryable());
        assert!(ReplayFailureReason::ServerError(500).is_retryable());
        assert!(ReplayFailureReason::ServerError(503).is_retryable());
        assert!(!ReplayFailureReason::ServerError(400).is_retryable());
        assert!(!ReplayFailureReason::ServerError(404).is_retryable());
        assert!(!ReplayFailureReason::ServerError(409).is_retryable());
        assert!(ReplayFailureReason::Unknown("?".to_string()).is_retryable());
    }

    #[test]
    fn test_reason_from_error() {
        assert_eq!(
            ReplayFailureReason::from(&TBreakSDKError::Timeout("t".to_string())),
            ReplayFailureReason::NetworkTimeout
        );
        assert_eq!(
            ReplayFailureReason::from(&TBreakSDKError::Transport("t".to_string())),
            ReplayFailureReason::NetworkUnavailable
        );
        assert_eq!(
            ReplayFailureReason::from(&TBreakSDKError::NotConnected),
            ReplayFailureReason::NetworkUnavailable
        );
        assert_eq!(
            ReplayFailureReason::from(&TBreakSDKError::Rejected {
                status: 429,
                message: String::new()
            }),
            ReplayFailureReason::RateLimited
        );
        assert_eq!(
            ReplayFailureReason::from(&TBreakSDKError::Rejected {
                status: 502,
                message: String::new()
            }),
            ReplayFailureReason::ServerError(502)
        );
        assert!(matches!(
            ReplayFailureReason::from(&TBreakSDKError::Store("s".to_string())),
            ReplayFailureReason::Unknown(_)
        ));
    }

    #[test]
    fn test_attempt_budget() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_over_attempt_budget(0));
        assert!(!policy.is_over_attempt_budget(9));
        assert!(policy.is_over_attempt_budget(10));
        assert!(policy.is_over_attempt_budget(11));
    }

    #[test]
    fn test_cycle_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry_cycle(0));
        assert!(policy.should_retry_cycle(4));
        assert!(!policy.should_retry_cycle(5));
    }

    #[test]
    fn test_cycle_delay_grows_and_caps() {
        let policy = RetryPolicy {
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.cycle_delay(0), Duration::from_secs(1));
        assert_eq!(policy.cycle_delay(1), Duration::from_secs(2));
        assert_eq!(policy.cycle_delay(3), Duration::from_secs(8));
        // 2^10 = 1024 秒，封顶在 300 秒
        assert_eq!(policy.cycle_delay(10), Duration::from_secs(300));
    }

    #[test]
    fn test_cycle_delay_jitter_stays_in_band() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let delay = policy.cycle_delay(0);
            // 1 秒 ±5%
            assert!(delay >= Duration::from_millis(900), "delay={:?}", delay);
            assert!(delay <= Duration::from_millis(1100), "delay={:?}", delay);
        }
    }
}
