//! 同步引擎 - 待同步队列的排空与重放
//!
//! 排空流程：按入队顺序逐条把变更重放到远端，成功即出队；
//! 失败分两类处理：
//! - 可重试（连接故障、5xx、限流）：留在队列并累计重放次数
//! - 不可重试（4xx 拒绝）：直接出队，重放多少次都不会变好
//!
//! 同一时刻只允许一次排空在跑（`drain_lock`），重复触发会排队等待，
//! 拿到锁后看到的是上一次排空后的队列，不会重复投递。

use crate::error::Result;
use crate::events::{event_builders, EventManager};
use crate::storage::{OfflineStore, PendingChange};
use crate::sync::retry::{ReplayAbandoned, ReplayFailureReason, RetryPolicy};
use crate::transport::{ApiRequest, RemoteTransport};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// 一次排空的成败计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// 重放成功并出队的条数
    pub synced: usize,
    /// 本轮处理失败的条数（含被放弃的）
    pub failed: usize,
}

impl DrainReport {
    /// 队列是否已排净（没有失败残留）
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// 同步引擎
#[derive(Debug)]
pub struct SyncEngine {
    store: Arc<OfflineStore>,
    transport: Arc<dyn RemoteTransport>,
    events: Arc<EventManager>,
    policy: RetryPolicy,
    drain_lock: Mutex<()>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<OfflineStore>,
        transport: Arc<dyn RemoteTransport>,
        events: Arc<EventManager>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            transport,
            events,
            policy,
            drain_lock: Mutex::new(()),
        }
    }

    /// 排空一轮待同步队列
    ///
    /// 单条失败不会中断排空，剩余变更继续处理；
    /// 返回值只在队列无法读取等存储故障时为 `Err`。
    pub async fn sync_pending_changes(&self) -> Result<DrainReport> {
        let _guard = self.drain_lock.lock().await;

        let pending = match self.store.pending_changes().await {
            Ok(pending) => pending,
            Err(error) => {
                self.events
                    .emit(event_builders::sync_failed(error.to_string()))
                    .await;
                return Err(error);
            }
        };
        if pending.is_empty() {
            debug!("待同步队列为空，跳过本轮排空");
            return Ok(DrainReport::default());
        }

        info!("🔄 开始排空待同步队列: {} 条", pending.len());
        self.events
            .emit(event_builders::sync_started(pending.len()))
            .await;

        let mut report = DrainReport::default();
        for change in pending {
            if self.policy.is_over_attempt_budget(change.attempts) {
                let abandoned = ReplayAbandoned {
                    change_id: change.id.clone(),
                    attempts: change.attempts,
                    limit: self.policy.max_replay_attempts,
                };
                warn!("⚠️ {}", abandoned);
                if let Err(e) = self.store.remove_change(&change.id).await {
                    warn!("⚠️ 移除已放弃的变更失败: {}", e);
                }
                report.failed += 1;
                continue;
            }

            match self.replay_change(&change).await {
                Ok(()) => report.synced += 1,
                Err(error) => {
                    let reason = ReplayFailureReason::from(&error);
                    if reason.is_retryable() {
                        warn!("⚠️ 变更重放失败，留队待重试: {} ({})", change.id, reason);
                        if let Err(e) = self.store.record_attempt(&change.id).await {
                            warn!("⚠️ 累计重放次数失败: {}", e);
                        }
                    } else {
                        warn!("❌ 变更被远端拒绝，放弃重放: {} ({})", change.id, reason);
                        if let Err(e) = self.store.remove_change(&change.id).await {
                            warn!("⚠️ 移除被拒绝的变更失败: {}", e);
                        }
                    }
                    report.failed += 1;
                }
            }
        }

        info!("✅ 排空完成: {} 成功, {} 失败", report.synced, report.failed);
        self.events
            .emit(event_builders::sync_completed(report.synced, report.failed))
            .await;
        Ok(report)
    }

    /// 重放单条变更
    async fn replay_change(&self, change: &PendingChange) -> Result<()> {
        let request = ApiRequest::from(change);
        self.transport.execute(&request).await?;
        debug!(
            "📤 变更已重放: {} {} ({})",
            change.method, change.endpoint, change.id
        );

        if let Err(e) = self.store.remove_change(&change.id).await {
            // 远端已确认，本地出队失败只能记日志；重放是幂等的，
            // 下一轮再投一次不会破坏数据
            error!("❌ 远端已确认但出队失败: {} ({})", change.id, e);
        }
        if let Some(record_key) = &change.record_key {
            if let Err(e) = self.store.mark_record_synced(record_key).await {
                warn!("⚠️ 标记镜像记录已同步失败: {} ({})", record_key, e);
            }
        }
        Ok(())
    }

    /// 当前待同步条数
    pub async fn pending_count(&self) -> Result<usize> {
        self.store.pending_count().await
    }
}
