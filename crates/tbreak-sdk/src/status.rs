//! 离线状态聚合 - 给 UI 的单一状态快照
//!
//! 把网络状态、待同步计数和同步进行中标志聚合成一个
//! [`OfflineStatus`]，UI 只消费这一个结构：
//! - 事件驱动：网络翻转、入队、排空事件即刻反映
//! - 周期轮询：兜底刷新待同步计数，防止事件丢失后状态漂移
//!
//! `is_syncing` 仅供展示，不参与任何调度决策。

use crate::events::{EventManager, SyncEvent};
use crate::network::NetworkMonitor;
use crate::storage::OfflineStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// 离线状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineStatus {
    pub is_online: bool,
    pub pending_changes_count: usize,
    pub is_syncing: bool,
}

impl Default for OfflineStatus {
    fn default() -> Self {
        Self {
            is_online: true,
            pending_changes_count: 0,
            is_syncing: false,
        }
    }
}

/// 离线状态聚合器
#[derive(Debug)]
pub struct OfflineStatusManager {
    store: Arc<OfflineStore>,
    monitor: Arc<NetworkMonitor>,
    events: Arc<EventManager>,
    state: Arc<parking_lot::RwLock<OfflineStatus>>,
    publisher: watch::Sender<OfflineStatus>,
    /// 自持一个接收端，保证发布永远有订阅者
    state_receiver: watch::Receiver<OfflineStatus>,
    poll_interval: Duration,
    shutdown: Arc<Notify>,
    running: Arc<RwLock<bool>>,
}

impl OfflineStatusManager {
    pub fn new(
        store: Arc<OfflineStore>,
        monitor: Arc<NetworkMonitor>,
        events: Arc<EventManager>,
        poll_interval: Duration,
    ) -> Self {
        let initial = OfflineStatus::default();
        let (publisher, state_receiver) = watch::channel(initial);
        Self {
            store,
            monitor,
            events,
            state: Arc::new(parking_lot::RwLock::new(initial)),
            publisher,
            state_receiver,
            poll_interval,
            shutdown: Arc::new(Notify::new()),
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// 当前状态快照（同步读取）
    pub fn snapshot(&self) -> OfflineStatus {
        *self.state.read()
    }

    /// 订阅状态流，订阅即可读到最近一次快照
    pub fn subscribe(&self) -> watch::Receiver<OfflineStatus> {
        self.state_receiver.clone()
    }

    /// 启动聚合：播种初始状态，拉起事件泵与轮询泵
    pub async fn start(self: &Arc<Self>) {
        {
            let mut running = self.running.write().await;
            if *running {
                warn!("⚠️ 状态聚合器已在运行");
                return;
            }
            *running = true;
        }

        let is_online = self.monitor.is_online();
        let pending = self.store.pending_count().await.unwrap_or(0);
        self.update(|status| {
            status.is_online = is_online;
            status.pending_changes_count = pending;
            status.is_syncing = false;
        });
        info!(
            "📊 状态聚合器已启动: online={} pending={}",
            is_online, pending
        );

        // 事件泵
        let this = Arc::clone(self);
        let mut receiver = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                if !*this.running.read().await {
                    break;
                }
                tokio::select! {
                    event = receiver.recv() => {
                        match event {
                            Ok(event) => this.apply_event(&event).await,
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                warn!("⚠️ 状态聚合滞后，丢失 {} 个事件，强制刷新计数", missed);
                                this.refresh_pending_count().await;
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = this.shutdown.notified() => break,
                }
            }
        });

        // 轮询泵：兜底刷新待同步计数
        let this = Arc::clone(self);
        let poll_interval = self.poll_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                if !*this.running.read().await {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => this.refresh_pending_count().await,
                    _ = this.shutdown.notified() => break,
                }
            }
        });
    }

    async fn apply_event(&self, event: &SyncEvent) {
        match event {
            SyncEvent::SyncStarted { .. } => {
                self.update(|status| status.is_syncing = true);
            }
            SyncEvent::SyncCompleted { .. } => {
                self.update(|status| status.is_syncing = false);
                self.refresh_pending_count().await;
            }
            SyncEvent::SyncFailed { .. } => {
                self.update(|status| status.is_syncing = false);
            }
            SyncEvent::NetworkStatusChanged { is_online, .. } => {
                self.update(|status| status.is_online = *is_online);
            }
            SyncEvent::ChangeQueued { .. } => {
                self.refresh_pending_count().await;
            }
        }
    }

    /// 应用一次变更，状态真正变化时才发布
    fn update(&self, mutate: impl FnOnce(&mut OfflineStatus)) {
        let (changed, snapshot) = {
            let mut guard = self.state.write();
            let before = *guard;
            mutate(&mut guard);
            (*guard != before, *guard)
        };
        if changed {
            if self.publisher.send(snapshot).is_err() {
                debug!("状态流无订阅者");
            }
        }
    }

    async fn refresh_pending_count(&self) {
        match self.store.pending_count().await {
            Ok(count) => self.update(|status| status.pending_changes_count = count),
            Err(e) => debug!("刷新待同步计数失败: {}", e),
        }
    }

    /// 停止聚合
    pub async fn stop(&self) {
        {
            let mut running = self.running.write().await;
            if !*running {
                return;
            }
            *running = false;
        }
        self.shutdown.notify_waiters();
        info!("🛑 状态聚合器已停止");
    }
}
