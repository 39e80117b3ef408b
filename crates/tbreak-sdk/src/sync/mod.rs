//! 同步子系统 - 队列排空、退避重试与后台触发

pub mod background;
pub mod engine;
pub mod retry;

pub use background::{BackgroundSync, BackgroundSyncCapability, UnsupportedBackgroundSync, SYNC_TAG};
pub use engine::{DrainReport, SyncEngine};
pub use retry::{ReplayAbandoned, ReplayFailureReason, RetryPolicy};
