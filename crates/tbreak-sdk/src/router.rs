//! 写入路由 - 在线直发，离线入队
//!
//! 所有业务写入都走 [`WriteRouter::perform_write`]：
//! - 在线：执行远端调用，成功后把镜像记录标记为已同步
//! - 离线（或在线但遇到连接故障）：把变更持久化进待同步队列，
//!   本地镜像以 `_synced=false` 写入，等网络恢复后由同步引擎重放
//! - 在线但远端明确拒绝（4xx/5xx）：原样上抛，不入队
//!
//! 入队先于镜像写入，保证任何时刻未同步的本地记录都有对应的队列条目。

use crate::error::Result;
use crate::events::{event_builders, EventManager};
use crate::network::NetworkMonitor;
use crate::storage::{keys, ChangeMethod, DailyEntry, OfflineStore};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// 离线回退描述：写入无法直达远端时要入队的内容
#[derive(Debug, Clone)]
pub struct QueuedWrite {
    pub endpoint: String,
    pub method: ChangeMethod,
    pub payload: serde_json::Value,
    /// 需要同步镜像到本地缓存的域记录
    pub entry_mirror: Option<DailyEntry>,
}

impl QueuedWrite {
    pub fn new(endpoint: impl Into<String>, method: ChangeMethod, payload: serde_json::Value) -> Self {
        Self {
            endpoint: endpoint.into(),
            method,
            payload,
            entry_mirror: None,
        }
    }

    pub fn with_entry_mirror(mut self, entry: DailyEntry) -> Self {
        self.entry_mirror = Some(entry);
        self
    }
}

/// 写入结果
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome<T> {
    /// 远端已确认
    Completed(T),
    /// 已转入待同步队列
    Queued { change_id: String },
}

impl<T> WriteOutcome<T> {
    pub fn is_queued(&self) -> bool {
        matches!(self, WriteOutcome::Queued { .. })
    }
}

/// 写入路由器
#[derive(Debug)]
pub struct WriteRouter {
    store: Arc<OfflineStore>,
    monitor: Arc<NetworkMonitor>,
    events: Arc<EventManager>,
}

impl WriteRouter {
    pub fn new(
        store: Arc<OfflineStore>,
        monitor: Arc<NetworkMonitor>,
        events: Arc<EventManager>,
    ) -> Self {
        Self {
            store,
            monitor,
            events,
        }
    }

    /// 执行一次可离线的写入
    ///
    /// `remote` 是实际的远端调用；`fallback` 描述失败时入队的内容。
    /// 远端明确拒绝（非连接类错误）时原样返回错误，由调用方处理。
    pub async fn perform_write<T, F, Fut>(
        &self,
        remote: F,
        fallback: QueuedWrite,
    ) -> Result<WriteOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.monitor.is_online() {
            match remote().await {
                Ok(value) => {
                    if let Some(entry) = &fallback.entry_mirror {
                        if let Err(e) = self.store.put_entry(entry, true).await {
                            warn!("⚠️ 写入成功后镜像本地缓存失败: {}", e);
                        }
                    }
                    return Ok(WriteOutcome::Completed(value));
                }
                Err(error) => {
                    if !error.is_connectivity() {
                        return Err(error);
                    }
                    warn!("⚠️ 在线写入遇到连接故障，转入离线队列: {}", error);
                }
            }
        }

        let QueuedWrite {
            endpoint,
            method,
            payload,
            entry_mirror,
        } = fallback;

        let change_id = match entry_mirror {
            Some(entry) => {
                let key = keys::entry_key(&entry.user_id, &entry.date, &entry.id);
                let id = self
                    .store
                    .enqueue_linked_change(&endpoint, method, payload, Some(key))
                    .await?;
                if let Err(e) = self.store.put_entry(&entry, false).await {
                    warn!("⚠️ 入队后镜像本地缓存失败: {}", e);
                }
                id
            }
            None => self.store.enqueue_change(&endpoint, method, payload).await?,
        };

        info!("📥 离线写入已入队: {} {} -> {}", method, endpoint, change_id);
        self.events
            .emit(event_builders::change_queued(change_id.clone(), endpoint))
            .await;
        Ok(WriteOutcome::Queued { change_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TBreakSDKError;
    use crate::network::test_helpers::ManualNetworkStatusListener;
    use crate::network::{NetworkStatus, NetworkStatusListener};
    use crate::sync::background::test_helpers::RecordingCapability;
    use crate::sync::background::BackgroundSync;
    use crate::sync::engine::SyncEngine;
    use crate::sync::retry::RetryPolicy;
    use crate::transport::test_helpers::MockTransport;
    use crate::transport::RemoteTransport;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Rig {
        _temp: TempDir,
        store: Arc<OfflineStore>,
        router: WriteRouter,
        events: Arc<EventManager>,
    }

    async fn build_rig(initial: NetworkStatus) -> Rig {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(OfflineStore::open(temp.path().join("store")).await.unwrap());
        let events = Arc::new(EventManager::new(64));
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&store),
            Arc::new(MockTransport::new()) as Arc<dyn RemoteTransport>,
            Arc::clone(&events),
            RetryPolicy::default(),
        ));
        let background_sync = Arc::new(BackgroundSync::new(
            Arc::new(RecordingCapability::new()) as _,
            engine,
            RetryPolicy::default(),
        ));
        let listener = Arc::new(ManualNetworkStatusListener::new(initial));
        let monitor = Arc::new(NetworkMonitor::new(
            listener as Arc<dyn NetworkStatusListener>,
            Arc::clone(&store),
            background_sync,
            Arc::clone(&events),
        ));
        monitor.start().await.unwrap();
        let router = WriteRouter::new(Arc::clone(&store), monitor, Arc::clone(&events));
        Rig {
            _temp: temp,
            store,
            router,
            events,
        }
    }

    fn sample_entry() -> DailyEntry {
        DailyEntry {
            id: "u1-5".to_string(),
            user_id: "u1".to_string(),
            day_number: 5,
            date: "2025-01-05".to_string(),
            morning_mood: Some("🙂".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_offline_write_queues_without_calling_remote() {
        let rig = build_rig(NetworkStatus::Offline).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        let entry = sample_entry();
        let fallback = QueuedWrite::new(
            "/dailyEntries/u1-5",
            ChangeMethod::Put,
            serde_json::to_value(&entry).unwrap(),
        )
        .with_entry_mirror(entry.clone());

        let outcome = rig
            .router
            .perform_write(
                move || async move {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                fallback,
            )
            .await
            .unwrap();

        // 离线时远端调用完全不触发
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(outcome.is_queued());

        let pending = rig.store.pending_changes().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].endpoint, "/dailyEntries/u1-5");
        assert_eq!(
            pending[0].record_key.as_deref(),
            Some("u1:2025-01-05:u1-5")
        );

        let cached = rig.store.entry_by_id("u1", "u1-5").await.unwrap().unwrap();
        assert!(!cached.synced);
        assert_eq!(rig.events.get_stats().await.change_queued, 1);
    }

    #[tokio::test]
    async fn test_online_success_mirrors_synced() {
        let rig = build_rig(NetworkStatus::Online).await;
        let entry = sample_entry();
        let fallback = QueuedWrite::new(
            "/dailyEntries/u1-5",
            ChangeMethod::Put,
            serde_json::to_value(&entry).unwrap(),
        )
        .with_entry_mirror(entry.clone());

        let outcome = rig
            .router
            .perform_write(|| async { Ok(()) }, fallback)
            .await
            .unwrap();

        assert_eq!(outcome, WriteOutcome::Completed(()));
        assert_eq!(rig.store.pending_count().await.unwrap(), 0);
        let cached = rig.store.entry_by_id("u1", "u1-5").await.unwrap().unwrap();
        assert!(cached.synced);
    }

    #[tokio::test]
    async fn test_online_rejection_propagates_without_queueing() {
        let rig = build_rig(NetworkStatus::Online).await;
        let fallback = QueuedWrite::new("/donations/initiate", ChangeMethod::Post, json!({}));

        let result: Result<WriteOutcome<()>> = rig
            .router
            .perform_write(
                || async {
                    Err(TBreakSDKError::Rejected {
                        status: 400,
                        message: "invalid amount".to_string(),
                    })
                },
                fallback,
            )
            .await;

        match result.unwrap_err() {
            TBreakSDKError::Rejected { status, .. } => assert_eq!(status, 400),
            other => panic!("意外错误: {:?}", other),
        }
        assert_eq!(rig.store.pending_count().await.unwrap(), 0);
        assert_eq!(rig.events.get_stats().await.change_queued, 0);
    }

    #[tokio::test]
    async fn test_online_connectivity_failure_falls_back_to_queue() {
        let rig = build_rig(NetworkStatus::Online).await;
        let fallback = QueuedWrite::new("/chatMessages", ChangeMethod::Post, json!({"message": "hi"}));

        let outcome: WriteOutcome<()> = rig
            .router
            .perform_write(
                || async {
                    Err(TBreakSDKError::Transport(
                        "连接失败: connection reset".to_string(),
                    ))
                },
                fallback,
            )
            .await
            .unwrap();

        assert!(outcome.is_queued());
        assert_eq!(rig.store.pending_count().await.unwrap(), 1);
    }
}
