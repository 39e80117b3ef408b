//! 事件系统 - 同步与网络状态的广播通道
//!
//! 两条投递路径并存：
//! - `broadcast::Sender`：给异步订阅者（状态聚合器、上层 UI 桥接）
//! - 回调监听器表：给平台侧同步钩子（按事件类型注册）
//!
//! 事件只描述已发生的事实，发射端不关心有没有人在听。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// 同步事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// 队列排空开始
    #[serde(rename_all = "camelCase")]
    SyncStarted { pending: usize, timestamp: u64 },
    /// 队列排空结束（附带成败计数）
    #[serde(rename_all = "camelCase")]
    SyncCompleted {
        synced: usize,
        failed: usize,
        timestamp: u64,
    },
    /// 队列排空因存储故障等原因未能执行
    #[serde(rename_all = "camelCase")]
    SyncFailed { error: String, timestamp: u64 },
    /// 网络状态翻转
    #[serde(rename_all = "camelCase")]
    NetworkStatusChanged { is_online: bool, timestamp: u64 },
    /// 一条写入被转入待同步队列
    #[serde(rename_all = "camelCase")]
    ChangeQueued {
        change_id: String,
        endpoint: String,
        timestamp: u64,
    },
}

impl SyncEvent {
    /// 事件类型名（用于监听器注册）
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::SyncStarted { .. } => "sync_started",
            SyncEvent::SyncCompleted { .. } => "sync_completed",
            SyncEvent::SyncFailed { .. } => "sync_failed",
            SyncEvent::NetworkStatusChanged { .. } => "network_status_changed",
            SyncEvent::ChangeQueued { .. } => "change_queued",
        }
    }

    /// 事件发生时刻（毫秒时间戳）
    pub fn timestamp(&self) -> u64 {
        match self {
            SyncEvent::SyncStarted { timestamp, .. }
            | SyncEvent::SyncCompleted { timestamp, .. }
            | SyncEvent::SyncFailed { timestamp, .. }
            | SyncEvent::NetworkStatusChanged { timestamp, .. }
            | SyncEvent::ChangeQueued { timestamp, .. } => *timestamp,
        }
    }
}

/// 事件监听器回调
pub type EventListener = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// 事件统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventStats {
    pub total_emitted: u64,
    pub sync_started: u64,
    pub sync_completed: u64,
    pub sync_failed: u64,
    pub network_status_changed: u64,
    pub change_queued: u64,
}

/// 事件管理器
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    listeners: Arc<RwLock<HashMap<String, Vec<EventListener>>>>,
    stats: Arc<RwLock<EventStats>>,
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("subscriber_count", &self.sender.receiver_count())
            .finish()
    }
}

impl EventManager {
    /// 创建事件管理器，`buffer` 为广播通道容量
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self {
            sender,
            listeners: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(EventStats::default())),
        }
    }

    /// 发射一个事件
    ///
    /// 先记统计，再逐个调用回调监听器，最后广播给异步订阅者。
    /// 没有订阅者时广播失败，只记 debug。
    pub async fn emit(&self, event: SyncEvent) {
        {
            let mut stats = self.stats.write().await;
            stats.total_emitted += 1;
            match &event {
                SyncEvent::SyncStarted { .. } => stats.sync_started += 1,
                SyncEvent::SyncCompleted { .. } => stats.sync_completed += 1,
                SyncEvent::SyncFailed { .. } => stats.sync_failed += 1,
                SyncEvent::NetworkStatusChanged { .. } => stats.network_status_changed += 1,
                SyncEvent::ChangeQueued { .. } => stats.change_queued += 1,
            }
        }

        {
            let listeners = self.listeners.read().await;
            if let Some(callbacks) = listeners.get(event.event_type()) {
                for callback in callbacks {
                    callback(&event);
                }
            }
        }

        if self.sender.send(event.clone()).is_err() {
            debug!("事件无订阅者，跳过广播: {}", event.event_type());
        }
    }

    /// 订阅事件广播
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 注册某个事件类型的回调监听器
    pub async fn add_listener(&self, event_type: &str, listener: EventListener) {
        let mut listeners = self.listeners.write().await;
        listeners
            .entry(event_type.to_string())
            .or_insert_with(Vec::new)
            .push(listener);
    }

    /// 移除某个事件类型的全部回调监听器
    pub async fn remove_listeners(&self, event_type: &str) {
        let mut listeners = self.listeners.write().await;
        listeners.remove(event_type);
    }

    /// 当前事件统计快照
    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    /// 当前异步订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// 事件构造辅助：统一打当前时间戳
pub mod event_builders {
    use super::SyncEvent;
    use chrono::Utc;

    fn now_ms() -> u64 {
        Utc::now().timestamp_millis() as u64
    }

    pub fn sync_started(pending: usize) -> SyncEvent {
        SyncEvent::SyncStarted {
            pending,
            timestamp: now_ms(),
        }
    }

    pub fn sync_completed(synced: usize, failed: usize) -> SyncEvent {
        SyncEvent::SyncCompleted {
            synced,
            failed,
            timestamp: now_ms(),
        }
    }

    pub fn sync_failed(error: impl Into<String>) -> SyncEvent {
        SyncEvent::SyncFailed {
            error: error.into(),
            timestamp: now_ms(),
        }
    }

    pub fn network_status_changed(is_online: bool) -> SyncEvent {
        SyncEvent::NetworkStatusChanged {
            is_online,
            timestamp: now_ms(),
        }
    }

    pub fn change_queued(change_id: impl Into<String>, endpoint: impl Into<String>) -> SyncEvent {
        SyncEvent::ChangeQueued {
            change_id: change_id.into(),
            endpoint: endpoint.into(),
            timestamp: now_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_broadcast_reaches_subscriber() {
        let manager = EventManager::new(16);
        let mut receiver = manager.subscribe();

        manager.emit(event_builders::sync_started(3)).await;

        match receiver.recv().await.unwrap() {
            SyncEvent::SyncStarted { pending, .. } => assert_eq!(pending, 3),
            other => panic!("意外事件: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_listener_called_for_matching_type_only() {
        let manager = EventManager::new(16);
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);
        manager
            .add_listener(
                "sync_completed",
                Box::new(move |_| {
                    counter_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await;

        manager.emit(event_builders::sync_started(1)).await;
        manager.emit(event_builders::sync_completed(1, 0)).await;
        manager.emit(event_builders::sync_completed(2, 1)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_remove_listeners() {
        let manager = EventManager::new(16);
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);
        manager
            .add_listener(
                "change_queued",
                Box::new(move |_| {
                    counter_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await;

        manager
            .emit(event_builders::change_queued("c1", "/dailyEntries/u1-1"))
            .await;
        manager.remove_listeners("change_queued").await;
        manager
            .emit(event_builders::change_queued("c2", "/dailyEntries/u1-2"))
            .await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let manager = EventManager::new(16);
        // 没有订阅者也不报错
        manager.emit(event_builders::sync_failed("存储故障")).await;

        let stats = manager.get_stats().await;
        assert_eq!(stats.total_emitted, 1);
        assert_eq!(stats.sync_failed, 1);
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let event = SyncEvent::SyncCompleted {
            synced: 2,
            failed: 1,
            timestamp: 1736072400000,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "syncCompleted");
        assert_eq!(json["synced"], 2);
        assert_eq!(json["failed"], 1);

        let queued = event_builders::change_queued("c1", "/chatMessages");
        let json = serde_json::to_value(&queued).unwrap();
        assert_eq!(json["type"], "changeQueued");
        assert_eq!(json["changeId"], "c1");
    }
}
