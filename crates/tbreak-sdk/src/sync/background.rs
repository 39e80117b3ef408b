//! 后台同步触发 - 平台注册与进程内调度
//!
//! 平台支持后台同步时（如浏览器 SyncManager），注册 [`SYNC_TAG`] 标签，
//! 由平台在合适的时机回调 [`BackgroundSync::handle_sync_event`]；
//! 不支持时回退到进程内调度器：收到唤醒就排空一轮队列，排不净则按
//! [`RetryPolicy`](crate::sync::retry::RetryPolicy) 退避重试。
//!
//! 两条路径并不互斥：注册成功后进程内调度器照常唤醒，排空引擎
//! 自会把重复触发串行化。

use crate::error::Result;
use crate::sync::engine::{DrainReport, SyncEngine};
use crate::sync::retry::RetryPolicy;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

/// 后台同步注册标签
pub const SYNC_TAG: &str = "sync-offline-data";

/// 平台后台同步能力
#[async_trait]
pub trait BackgroundSyncCapability: Send + Sync + std::fmt::Debug {
    /// 平台是否支持后台同步
    fn is_supported(&self) -> bool;

    /// 注册一次后台同步
    async fn register(&self, tag: &str) -> Result<()>;
}

/// 无后台同步能力的平台（默认实现）
#[derive(Debug, Default)]
pub struct UnsupportedBackgroundSync;

#[async_trait]
impl BackgroundSyncCapability for UnsupportedBackgroundSync {
    fn is_supported(&self) -> bool {
        false
    }

    async fn register(&self, _tag: &str) -> Result<()> {
        Ok(())
    }
}

/// 后台同步协调器
#[derive(Debug)]
pub struct BackgroundSync {
    capability: Arc<dyn BackgroundSyncCapability>,
    engine: Arc<SyncEngine>,
    policy: RetryPolicy,
    wakeup: Arc<Notify>,
    shutdown: Arc<Notify>,
    running: Arc<RwLock<bool>>,
}

impl BackgroundSync {
    pub fn new(
        capability: Arc<dyn BackgroundSyncCapability>,
        engine: Arc<SyncEngine>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            capability,
            engine,
            policy,
            wakeup: Arc::new(Notify::new()),
            shutdown: Arc::new(Notify::new()),
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// 请求一次后台同步
    ///
    /// 永不失败：平台注册失败只降级为进程内调度，不影响调用方。
    pub async fn request_sync(&self) {
        if self.capability.is_supported() {
            match self.capability.register(SYNC_TAG).await {
                Ok(()) => info!("📡 后台同步已注册: {}", SYNC_TAG),
                Err(e) => warn!("⚠️ 后台同步注册失败，回退进程内调度: {}", e),
            }
        } else {
            debug!("平台不支持后台同步，使用进程内调度");
        }
        self.wakeup.notify_one();
    }

    /// 处理平台回调的同步事件
    ///
    /// 标签不匹配时静默返回空报告，平台可能复用同一回调分发多种事件。
    pub async fn handle_sync_event(&self, tag: &str) -> Result<DrainReport> {
        if tag != SYNC_TAG {
            debug!("忽略未知同步标签: {}", tag);
            return Ok(DrainReport::default());
        }
        info!("⏰ 收到平台同步事件: {}", tag);
        self.engine.sync_pending_changes().await
    }

    /// 启动进程内调度器
    pub async fn start(self: &Arc<Self>) {
        {
            let mut running = self.running.write().await;
            if *running {
                warn!("⚠️ 后台同步调度器已在运行");
                return;
            }
            *running = true;
        }
        info!("⏰ 后台同步调度器已启动");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if !*this.running.read().await {
                    break;
                }
                tokio::select! {
                    _ = this.wakeup.notified() => {
                        this.drain_with_backoff().await;
                    }
                    _ = this.shutdown.notified() => break,
                }
            }
            debug!("后台同步调度器退出");
        });
    }

    /// 排空队列，排不净则按退避策略重试若干轮
    async fn drain_with_backoff(&self) {
        let mut cycles: u32 = 0;
        loop {
            match self.engine.sync_pending_changes().await {
                Ok(report) if report.is_clean() => return,
                Ok(report) => {
                    if !self.policy.should_retry_cycle(cycles) {
                        warn!(
                            "⚠️ 重试轮数耗尽，仍有 {} 条未同步，等待下次触发",
                            report.failed
                        );
                        return;
                    }
                }
                Err(error) => {
                    if !self.policy.should_retry_cycle(cycles) {
                        warn!("⚠️ 重试轮数耗尽，排空仍然失败: {}", error);
                        return;
                    }
                }
            }

            let delay = self.policy.cycle_delay(cycles);
            debug!("⏳ {}ms 后重试排空 (第 {} 轮)", delay.as_millis(), cycles + 1);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.notified() => return,
            }
            cycles += 1;
        }
    }

    /// 停止进程内调度器
    pub async fn stop(&self) {
        {
            let mut running = self.running.write().await;
            if !*running {
                return;
            }
            *running = false;
        }
        self.shutdown.notify_waiters();
        info!("🛑 后台同步调度器已停止");
    }
}

#[cfg(test)]
pub mod test_helpers {
    use super::*;
    use crate::error::TBreakSDKError;

    /// 记录注册调用的平台能力桩
    #[derive(Debug)]
    pub struct RecordingCapability {
        registrations: parking_lot::Mutex<Vec<String>>,
        supported: bool,
        fail_register: bool,
    }

    impl RecordingCapability {
        pub fn new() -> Self {
            Self {
                registrations: parking_lot::Mutex::new(Vec::new()),
                supported: true,
                fail_register: false,
            }
        }

        /// 注册总是失败的变体
        pub fn failing() -> Self {
            Self {
                fail_register: true,
                ..Self::new()
            }
        }

        pub fn registrations(&self) -> Vec<String> {
            self.registrations.lock().clone()
        }
    }

    #[async_trait]
    impl BackgroundSyncCapability for RecordingCapability {
        fn is_supported(&self) -> bool {
            self.supported
        }

        async fn register(&self, tag: &str) -> Result<()> {
            self.registrations.lock().push(tag.to_string());
            if self.fail_register {
                return Err(TBreakSDKError::Other("registration denied".to_string()));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_helpers::RecordingCapability;
    use super::*;
    use crate::events::EventManager;
    use crate::storage::{ChangeMethod, OfflineStore};
    use crate::transport::test_helpers::MockTransport;
    use crate::transport::RemoteTransport;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::time::{sleep, Duration};

    struct Rig {
        _temp: TempDir,
        store: Arc<OfflineStore>,
        transport: Arc<MockTransport>,
        engine: Arc<SyncEngine>,
    }

    async fn build_rig() -> Rig {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(OfflineStore::open(temp.path().join("store")).await.unwrap());
        let transport = Arc::new(MockTransport::new());
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&store),
            Arc::clone(&transport) as Arc<dyn RemoteTransport>,
            Arc::new(EventManager::new(64)),
            RetryPolicy::default(),
        ));
        Rig {
            _temp: temp,
            store,
            transport,
            engine,
        }
    }

    /// 退避为零的策略，测试里不等真实延迟
    fn instant_policy(max_cycles: u32) -> RetryPolicy {
        RetryPolicy {
            max_cycles,
            base_delay_seconds: 0,
            ..RetryPolicy::default()
        }
    }

    #[tokio::test]
    async fn test_request_sync_registers_platform_tag() {
        let rig = build_rig().await;
        let capability = Arc::new(RecordingCapability::new());
        let background = BackgroundSync::new(
            Arc::clone(&capability) as _,
            Arc::clone(&rig.engine),
            RetryPolicy::default(),
        );

        background.request_sync().await;
        background.request_sync().await;

        assert_eq!(
            capability.registrations(),
            vec![SYNC_TAG.to_string(), SYNC_TAG.to_string()]
        );
    }

    #[tokio::test]
    async fn test_registration_failure_is_swallowed() {
        let rig = build_rig().await;
        let capability = Arc::new(RecordingCapability::failing());
        let background = BackgroundSync::new(
            Arc::clone(&capability) as _,
            Arc::clone(&rig.engine),
            RetryPolicy::default(),
        );

        // 注册失败不上抛，调用依旧完成
        background.request_sync().await;
        assert_eq!(capability.registrations().len(), 1);
    }

    #[tokio::test]
    async fn test_handle_sync_event_ignores_unknown_tag() {
        let rig = build_rig().await;
        rig.store
            .enqueue_change("/chatMessages", ChangeMethod::Post, json!({}))
            .await
            .unwrap();
        let background = BackgroundSync::new(
            Arc::new(UnsupportedBackgroundSync) as _,
            Arc::clone(&rig.engine),
            RetryPolicy::default(),
        );

        let report = background.handle_sync_event("periodic-cleanup").await.unwrap();
        assert_eq!(report, DrainReport::default());
        assert_eq!(rig.transport.call_count(), 0);

        let report = background.handle_sync_event(SYNC_TAG).await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(rig.transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_scheduler_drains_after_request() {
        let rig = build_rig().await;
        rig.store
            .enqueue_change("/dailyEntries/u1-1", ChangeMethod::Put, json!({}))
            .await
            .unwrap();
        let background = Arc::new(BackgroundSync::new(
            Arc::new(UnsupportedBackgroundSync) as _,
            Arc::clone(&rig.engine),
            RetryPolicy::default(),
        ));
        background.start().await;

        background.request_sync().await;
        sleep(Duration::from_millis(150)).await;

        assert_eq!(rig.store.pending_count().await.unwrap(), 0);
        assert_eq!(rig.transport.call_count(), 1);

        background.stop().await;
    }

    #[tokio::test]
    async fn test_scheduler_retries_until_cycle_budget() {
        let rig = build_rig().await;
        rig.store
            .enqueue_change("/dailyEntries/u1-1", ChangeMethod::Put, json!({}))
            .await
            .unwrap();
        rig.transport.reject_endpoint("/dailyEntries/u1-1", 500);
        let background = Arc::new(BackgroundSync::new(
            Arc::new(UnsupportedBackgroundSync) as _,
            Arc::clone(&rig.engine),
            instant_policy(2),
        ));
        background.start().await;

        background.request_sync().await;
        sleep(Duration::from_millis(200)).await;

        // 首轮加两轮重试共 3 次投递，之后放弃等待下次触发
        assert_eq!(rig.transport.call_count(), 3);
        let pending = rig.store.pending_changes().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 3);

        background.stop().await;
    }
}
