//! SDK 入口 - 配置、分层初始化与统一门面
//!
//! 采用分层架构：
//! - 存储层：OfflineStore（sled 持久化）
//! - 事件层：EventManager
//! - 传输层：HttpTransport
//! - 同步层：SyncEngine + BackgroundSync
//! - 网络层：NetworkMonitor
//! - 路由层：WriteRouter
//! - 缓存层：ResponseCache
//! - 业务层：Entries / Chat / Donations / Status

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, info, warn};

use crate::cache::{HttpResourceFetcher, ResponseCache, CACHE_VERSION};
use crate::chat::ChatManager;
use crate::donations::DonationsManager;
use crate::entries::EntriesManager;
use crate::error::{Result, TBreakSDKError};
use crate::events::{EventManager, SyncEvent};
use crate::network::{NetworkMonitor, NetworkStatus, NetworkStatusListener};
use crate::router::WriteRouter;
use crate::status::{OfflineStatus, OfflineStatusManager};
use crate::storage::OfflineStore;
use crate::sync::{
    BackgroundSync, BackgroundSyncCapability, DrainReport, RetryPolicy, SyncEngine,
    UnsupportedBackgroundSync,
};
use crate::transport::{HttpTransport, RemoteTransport};
use crate::version;

/// 默认网络状态监听器（内部使用，假设网络始终在线）
/// 实际应用应该由平台层（Web/移动端）提供真实的网络状态监听
#[derive(Debug)]
struct DefaultNetworkStatusListener {
    sender: parking_lot::Mutex<Option<broadcast::Sender<NetworkStatus>>>,
}

impl Default for DefaultNetworkStatusListener {
    fn default() -> Self {
        Self {
            sender: parking_lot::Mutex::new(None),
        }
    }
}

#[async_trait]
impl NetworkStatusListener for DefaultNetworkStatusListener {
    async fn current_status(&self) -> NetworkStatus {
        NetworkStatus::Online
    }

    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatus>> {
        // 持有发送端让通道保持打开，但永不上报（状态恒为在线）
        let (sender, receiver) = broadcast::channel(16);
        *self.sender.lock() = Some(sender);
        Ok(receiver)
    }

    async fn stop_monitoring(&self) {
        *self.sender.lock() = None;
    }
}

/// HTTP 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 请求超时（秒）
    pub request_timeout_secs: Option<u64>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(10),
            request_timeout_secs: Some(30),
        }
    }
}

/// T-Break SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TBreakConfig {
    /// 数据存储目录
    pub data_dir: PathBuf,
    /// 云函数 API 基础 URL
    pub api_base_url: String,
    /// HTTP 客户端配置
    pub http_client_config: HttpClientConfig,
    /// 队列重放的重试策略
    pub retry_policy: RetryPolicy,
    /// 事件缓冲区大小
    pub event_buffer_size: usize,
    /// 状态聚合器轮询间隔（毫秒）
    pub status_poll_interval_ms: u64,
    /// 缓存版本号（版本变化时激活会清除旧版本段）
    pub cache_version: String,
    /// 调试模式
    pub debug_mode: bool,
}

impl Default for TBreakConfig {
    fn default() -> Self {
        Self {
            data_dir: get_default_data_dir(),
            api_base_url: "https://us-central1-tbreak.cloudfunctions.net".to_string(),
            http_client_config: HttpClientConfig::default(),
            retry_policy: RetryPolicy::default(),
            event_buffer_size: 1000,
            status_poll_interval_ms: 5000,
            cache_version: CACHE_VERSION.to_string(),
            debug_mode: false,
        }
    }
}

/// 获取默认数据目录 ~/.tbreak/
fn get_default_data_dir() -> PathBuf {
    // 尝试获取用户主目录
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".tbreak")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        // Windows 支持
        home_dir.join(".tbreak")
    } else {
        // 如果无法获取用户主目录，则回退到当前目录
        PathBuf::from("./tbreak_data")
    }
}

/// T-Break SDK 配置构建器
pub struct TBreakConfigBuilder {
    config: TBreakConfig,
}

impl TBreakConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: TBreakConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    /// 设置云函数 API 基础 URL
    pub fn api_base_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.api_base_url = url.into();
        self
    }

    /// 设置 HTTP 客户端配置
    pub fn http_client_config(mut self, config: HttpClientConfig) -> Self {
        self.config.http_client_config = config;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = policy;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    /// 设置状态聚合器轮询间隔（毫秒）
    pub fn status_poll_interval_ms(mut self, interval: u64) -> Self {
        self.config.status_poll_interval_ms = interval;
        self
    }

    /// 设置缓存版本号（如 "v2"，激活时清除其他版本的缓存段）
    pub fn cache_version<S: Into<String>>(mut self, version: S) -> Self {
        self.config.cache_version = version.into();
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> TBreakConfig {
        self.config
    }
}

impl Default for TBreakConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TBreakConfig {
    pub fn builder() -> TBreakConfigBuilder {
        TBreakConfigBuilder::new()
    }
}

/// 统一 SDK 主接口
///
/// 所有组件在 [`TBreakSDK::initialize`] 中按依赖顺序构建并启动，
/// 对外只暴露门面方法与各管理器的只读访问。
pub struct TBreakSDK {
    /// SDK 配置
    config: TBreakConfig,

    /// 离线存储（条目镜像 + 待同步队列 + 元数据）
    store: Arc<OfflineStore>,

    /// 事件管理器
    events: Arc<EventManager>,

    /// 远程传输
    transport: Arc<dyn RemoteTransport>,

    /// 队列排空引擎
    engine: Arc<SyncEngine>,

    /// 后台同步调度器
    background_sync: Arc<BackgroundSync>,

    /// 网络监控
    network: Arc<NetworkMonitor>,

    /// 写路由器
    router: Arc<WriteRouter>,

    /// 响应缓存
    cache: Arc<ResponseCache>,

    /// 每日记录管理器
    entries: Arc<EntriesManager>,

    /// 社区消息管理器
    chat: Arc<ChatManager>,

    /// 捐赠管理器
    donations: Arc<DonationsManager>,

    /// 离线状态聚合器
    status: Arc<OfflineStatusManager>,

    /// 是否正在关闭
    shutting_down: Arc<RwLock<bool>>,
}

impl TBreakSDK {
    /// 初始化 SDK（使用默认平台能力）
    ///
    /// 默认假设网络始终在线且平台不支持后台同步注册；
    /// 真实平台接入请用 [`TBreakSDK::initialize_with_platform`]。
    pub async fn initialize(config: TBreakConfig) -> Result<Arc<Self>> {
        Self::initialize_with_platform(
            config,
            Arc::new(DefaultNetworkStatusListener::default()),
            Arc::new(UnsupportedBackgroundSync),
        )
        .await
    }

    /// 初始化 SDK，由平台层提供网络监听与后台同步能力
    pub async fn initialize_with_platform(
        config: TBreakConfig,
        network_listener: Arc<dyn NetworkStatusListener>,
        sync_capability: Arc<dyn BackgroundSyncCapability>,
    ) -> Result<Arc<Self>> {
        info!("🚀 正在初始化 TBreakSDK v{}...", version::SDK_VERSION);

        // 验证配置
        Self::validate_config(&config)?;
        if config.debug_mode {
            info!("ℹ️ 调试模式已开启");
        }

        // === 第1层：离线存储 ===
        let store = Arc::new(OfflineStore::open(&config.data_dir).await?);
        info!("存储层初始化完成: {:?}", config.data_dir);

        // === 第2层：事件系统 ===
        let events = Arc::new(EventManager::new(config.event_buffer_size));
        info!("事件系统初始化完成");

        // === 第3层：远程传输 ===
        let transport: Arc<dyn RemoteTransport> = Arc::new(HttpTransport::new(
            &config.api_base_url,
            &config.http_client_config,
        )?);
        info!("传输层初始化完成: {}", config.api_base_url);

        // === 第4层：同步引擎与后台调度 ===
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&store),
            Arc::clone(&transport),
            Arc::clone(&events),
            config.retry_policy.clone(),
        ));
        let background_sync = Arc::new(BackgroundSync::new(
            sync_capability,
            Arc::clone(&engine),
            config.retry_policy.clone(),
        ));
        background_sync.start().await;
        info!("同步层初始化完成");

        // === 第5层：网络监控 ===
        let network = Arc::new(NetworkMonitor::new(
            network_listener,
            Arc::clone(&store),
            Arc::clone(&background_sync),
            Arc::clone(&events),
        ));
        network.start().await?;
        info!("网络监控初始化完成");

        // === 第6层：写路由器 ===
        let router = Arc::new(WriteRouter::new(
            Arc::clone(&store),
            Arc::clone(&network),
            Arc::clone(&events),
        ));

        // === 第7层：响应缓存 ===
        let fetcher = Arc::new(HttpResourceFetcher::new(
            &config.api_base_url,
            &config.http_client_config,
        )?);
        let cache = Arc::new(
            ResponseCache::open(&config.data_dir, &config.cache_version, fetcher).await?,
        );
        cache.activate()?;
        info!("✅ 响应缓存已激活（版本 {}）", config.cache_version);

        // === 第8层：业务管理器 ===
        let entries = Arc::new(EntriesManager::new(
            Arc::clone(&store),
            Arc::clone(&transport),
            Arc::clone(&router),
            Arc::clone(&network),
        ));
        let chat = Arc::new(ChatManager::new(
            Arc::clone(&router),
            Arc::clone(&transport),
        ));
        let donations = Arc::new(DonationsManager::new(
            Arc::clone(&router),
            Arc::clone(&transport),
        ));
        let status = Arc::new(OfflineStatusManager::new(
            Arc::clone(&store),
            Arc::clone(&network),
            Arc::clone(&events),
            Duration::from_millis(config.status_poll_interval_ms),
        ));
        status.start().await;

        let sdk = Arc::new(Self {
            config,
            store,
            events,
            transport,
            engine,
            background_sync,
            network,
            router,
            cache,
            entries,
            chat,
            donations,
            status,
            shutting_down: Arc::new(RwLock::new(false)),
        });

        info!("✅ TBreakSDK 初始化完成");
        Ok(sdk)
    }

    /// 验证配置
    fn validate_config(config: &TBreakConfig) -> Result<()> {
        if config.data_dir.as_os_str().is_empty() {
            return Err(TBreakSDKError::Config("数据目录不能为空".to_string()));
        }

        if config.api_base_url.trim().is_empty() {
            return Err(TBreakSDKError::Config("API 基础 URL 不能为空".to_string()));
        }

        if config.cache_version.trim().is_empty() {
            return Err(TBreakSDKError::Config("缓存版本号不能为空".to_string()));
        }

        if config.event_buffer_size == 0 {
            return Err(TBreakSDKError::Config(
                "事件缓冲区大小不能为0".to_string(),
            ));
        }

        if config.status_poll_interval_ms == 0 {
            return Err(TBreakSDKError::Config(
                "状态轮询间隔不能为0".to_string(),
            ));
        }

        Ok(())
    }

    // ========== 同步操作 ==========

    /// 立即排空一次待同步队列
    pub async fn sync_now(&self) -> Result<DrainReport> {
        self.ensure_ready().await?;
        self.engine.sync_pending_changes().await
    }

    /// 请求一次后台同步（注册平台标签并唤醒进程内调度器）
    pub async fn request_background_sync(&self) -> Result<()> {
        self.ensure_ready().await?;
        self.background_sync.request_sync().await;
        Ok(())
    }

    /// 处理平台投递的后台同步事件
    pub async fn handle_background_sync(&self, tag: &str) -> Result<DrainReport> {
        self.ensure_ready().await?;
        self.background_sync.handle_sync_event(tag).await
    }

    // ========== 缓存操作 ==========

    /// 预缓存应用外壳资源，返回成功缓存的资源数
    pub async fn precache_critical_assets(&self) -> Result<usize> {
        self.ensure_ready().await?;
        self.cache.precache_critical_assets().await
    }

    // ========== 状态查询 ==========

    /// 当前离线状态快照
    pub fn offline_status(&self) -> OfflineStatus {
        self.status.snapshot()
    }

    /// 订阅离线状态流
    pub fn subscribe_status(&self) -> watch::Receiver<OfflineStatus> {
        self.status.subscribe()
    }

    /// 订阅同步事件流
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// 检查 SDK 是否正在关闭
    pub async fn is_shutting_down(&self) -> bool {
        *self.shutting_down.read().await
    }

    // ========== 生命周期 ==========

    /// 清空本地离线数据（条目镜像 + 待同步队列），登出时调用
    pub async fn clear_offline_data(&self) -> Result<()> {
        self.ensure_ready().await?;
        self.store.clear_all().await
    }

    /// 异步关闭 SDK
    ///
    /// 重复调用是幂等的。
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut shutting_down = self.shutting_down.write().await;
            if *shutting_down {
                debug!("TBreakSDK 已在关闭中");
                return Ok(());
            }
            *shutting_down = true;
        }

        info!("🛑 正在关闭 TBreakSDK...");

        self.status.stop().await;
        self.network.stop().await;
        self.background_sync.stop().await;

        if let Err(e) = self.store.flush().await {
            warn!("⚠️ 关闭时存储落盘失败: {}", e);
        }
        if let Err(e) = self.cache.flush().await {
            warn!("⚠️ 关闭时缓存落盘失败: {}", e);
        }

        info!("✅ TBreakSDK 关闭完成");
        Ok(())
    }

    async fn ensure_ready(&self) -> Result<()> {
        if *self.shutting_down.read().await {
            return Err(TBreakSDKError::ShuttingDown("SDK 正在关闭".to_string()));
        }
        Ok(())
    }

    // ========== 组件访问 ==========

    pub fn config(&self) -> &TBreakConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<OfflineStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub fn transport(&self) -> &Arc<dyn RemoteTransport> {
        &self.transport
    }

    pub fn sync_engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn background_sync(&self) -> &Arc<BackgroundSync> {
        &self.background_sync
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub fn router(&self) -> &Arc<WriteRouter> {
        &self.router
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn entries(&self) -> &Arc<EntriesManager> {
        &self.entries
    }

    pub fn chat(&self) -> &Arc<ChatManager> {
        &self.chat
    }

    pub fn donations(&self) -> &Arc<DonationsManager> {
        &self.donations
    }

    pub fn status(&self) -> &Arc<OfflineStatusManager> {
        &self.status
    }
}
