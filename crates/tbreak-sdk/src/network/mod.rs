//! 网络状态监听 - 平台探测与状态翻转广播
//!
//! 平台侧只负责上报原始状态（浏览器 online/offline、系统网络探针等），
//! 允许重复上报；[`NetworkMonitor`] 负责去重、持久化镜像、广播翻转事件，
//! 并在离线转在线的瞬间请求一次后台同步。

use crate::error::Result;
use crate::events::{event_builders, EventManager};
use crate::storage::OfflineStore;
use crate::sync::background::BackgroundSync;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{broadcast, Notify, RwLock};
use tracing::{debug, info, warn};

/// 网络状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Online,
    Offline,
}

impl NetworkStatus {
    pub fn is_online(&self) -> bool {
        matches!(self, NetworkStatus::Online)
    }
}

impl std::fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkStatus::Online => write!(f, "online"),
            NetworkStatus::Offline => write!(f, "offline"),
        }
    }
}

/// 网络状态翻转事件（只在状态真正变化时发出）
#[derive(Debug, Clone, Copy)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    pub timestamp: u64,
}

/// 平台网络状态监听器
///
/// 实现方上报的是原始状态流，可以包含连续的重复值；
/// 去重由 [`NetworkMonitor`] 完成。
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    /// 即时查询当前网络状态
    async fn current_status(&self) -> NetworkStatus;

    /// 开始上报，返回原始状态通道
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatus>>;

    /// 停止上报
    async fn stop_monitoring(&self);
}

/// 网络监听器
///
/// 持有平台监听器，维护当前状态快照，翻转时：
/// 1. 镜像到离线存储（重启后状态聚合器能恢复最近值）
/// 2. 发射 `NetworkStatusChanged` 事件
/// 3. 广播 [`NetworkStatusEvent`] 给订阅者
/// 4. 离线转在线时请求后台同步
#[derive(Debug)]
pub struct NetworkMonitor {
    listener: Arc<dyn NetworkStatusListener>,
    store: Arc<OfflineStore>,
    background_sync: Arc<BackgroundSync>,
    events: Arc<EventManager>,
    current: Arc<parking_lot::RwLock<NetworkStatus>>,
    status_sender: broadcast::Sender<NetworkStatusEvent>,
    shutdown: Arc<Notify>,
    running: Arc<RwLock<bool>>,
}

impl NetworkMonitor {
    pub fn new(
        listener: Arc<dyn NetworkStatusListener>,
        store: Arc<OfflineStore>,
        background_sync: Arc<BackgroundSync>,
        events: Arc<EventManager>,
    ) -> Self {
        let (status_sender, _) = broadcast::channel(100);
        Self {
            listener,
            store,
            background_sync,
            events,
            current: Arc::new(parking_lot::RwLock::new(NetworkStatus::Online)),
            status_sender,
            shutdown: Arc::new(Notify::new()),
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// 当前是否在线（同步快照，写入路由的热路径调用）
    pub fn is_online(&self) -> bool {
        self.current.read().is_online()
    }

    /// 当前网络状态
    pub fn current_status(&self) -> NetworkStatus {
        *self.current.read()
    }

    /// 订阅网络状态翻转事件
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStatusEvent> {
        self.status_sender.subscribe()
    }

    /// 启动监听循环
    pub async fn start(&self) -> Result<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                warn!("⚠️ 网络监听已在运行");
                return Ok(());
            }
            *running = true;
        }

        let initial = self.listener.current_status().await;
        *self.current.write() = initial;
        if let Err(e) = self.store.set_online_status(initial.is_online()).await {
            warn!("⚠️ 持久化初始网络状态失败: {}", e);
        }
        info!("🌐 网络监听已启动，初始状态: {}", initial);

        let mut reports = self.listener.start_monitoring().await?;

        let current = Arc::clone(&self.current);
        let store = Arc::clone(&self.store);
        let background_sync = Arc::clone(&self.background_sync);
        let events = Arc::clone(&self.events);
        let status_sender = self.status_sender.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let running = Arc::clone(&self.running);

        tokio::spawn(async move {
            loop {
                if !*running.read().await {
                    break;
                }
                tokio::select! {
                    report = reports.recv() => {
                        match report {
                            Ok(new_status) => {
                                let old_status = {
                                    let mut guard = current.write();
                                    let old = *guard;
                                    *guard = new_status;
                                    old
                                };
                                // 重复上报不是翻转，静默吞掉
                                if old_status == new_status {
                                    continue;
                                }
                                info!("🌐 网络状态翻转: {} -> {}", old_status, new_status);

                                if let Err(e) = store.set_online_status(new_status.is_online()).await {
                                    warn!("⚠️ 持久化网络状态失败: {}", e);
                                }
                                events
                                    .emit(event_builders::network_status_changed(
                                        new_status.is_online(),
                                    ))
                                    .await;

                                let event = NetworkStatusEvent {
                                    old_status,
                                    new_status,
                                    timestamp: Utc::now().timestamp_millis() as u64,
                                };
                                if status_sender.send(event).is_err() {
                                    debug!("网络状态翻转无订阅者");
                                }

                                if old_status == NetworkStatus::Offline
                                    && new_status == NetworkStatus::Online
                                {
                                    info!("🔄 网络恢复，请求后台同步");
                                    background_sync.request_sync().await;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                warn!("⚠️ 网络状态上报滞后，丢弃 {} 条", missed);
                                continue;
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                debug!("网络状态上报通道已关闭，监听退出");
                                break;
                            }
                        }
                    }
                    _ = shutdown.notified() => {
                        debug!("网络监听收到停止信号");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// 停止监听
    pub async fn stop(&self) {
        {
            let mut running = self.running.write().await;
            if !*running {
                return;
            }
            *running = false;
        }
        self.shutdown.notify_waiters();
        self.listener.stop_monitoring().await;
        info!("🛑 网络监听已停止");
    }
}
