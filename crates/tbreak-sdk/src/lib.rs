//! T-Break SDK - 离线优先数据同步 SDK
//!
//! 为打卡类 PWA 提供完整的离线优先数据层，包括：
//! - 💾 持久化待同步队列：离线写入不丢失，重启后继续重放
//! - 🌐 网络感知写路由：在线直达远端，离线自动入队
//! - 🔄 队列排空引擎：按入队顺序重放，部分失败不中断
//! - 📡 后台同步调度：平台后台同步注册 + 进程内退避重试
//! - 🎯 响应缓存：缓存优先 / 网络优先 / 过期重验证三种策略
//! - 📊 离线状态聚合：在线状态、积压数量、同步进行中一览
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use tbreak_sdk::{DailyEntry, TBreakConfig, TBreakSDK};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 配置 SDK
//!     let config = TBreakConfig::builder()
//!         .data_dir("/path/to/data")
//!         .api_base_url("https://us-central1-tbreak.cloudfunctions.net")
//!         .build();
//!
//!     // 初始化 SDK
//!     let sdk = TBreakSDK::initialize(config).await?;
//!
//!     // 保存一条打卡记录（离线时自动入队，网络恢复后重放）
//!     let entry = DailyEntry {
//!         id: "user123-5".to_string(),
//!         user_id: "user123".to_string(),
//!         day_number: 5,
//!         date: "2024-06-01".to_string(),
//!         night_mood: Some("🙂".to_string()),
//!         ..Default::default()
//!     };
//!     sdk.entries().save_entry(&entry).await?;
//!
//!     // 查看离线状态
//!     let status = sdk.offline_status();
//!     println!("在线: {}, 待同步: {}", status.is_online, status.pending_changes_count);
//!
//!     // 关闭 SDK
//!     sdk.shutdown().await?;
//!
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod cache;
pub mod chat;
pub mod donations;
pub mod entries;
pub mod error;
pub mod events;
pub mod network;
pub mod router;
pub mod sdk;
pub mod status;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod version;

// 重新导出核心类型，方便使用
pub use error::{Result, TBreakSDKError};
pub use sdk::{HttpClientConfig, TBreakConfig, TBreakConfigBuilder, TBreakSDK};
pub use storage::{
    CachedRecord, ChangeMethod, DailyEntry, MetadataRecord, OfflineStore, PendingChange,
    StoreStats, SymptomFlags,
};
pub use transport::{ApiRequest, ApiResponse, HttpMethod, HttpTransport, RemoteTransport};
pub use network::{NetworkMonitor, NetworkStatus, NetworkStatusEvent, NetworkStatusListener};
pub use events::{EventListener, EventManager, EventStats, SyncEvent};
pub use router::{QueuedWrite, WriteOutcome, WriteRouter};
pub use sync::{
    BackgroundSync, BackgroundSyncCapability, DrainReport, ReplayAbandoned, ReplayFailureReason,
    RetryPolicy, SyncEngine, UnsupportedBackgroundSync, SYNC_TAG,
};
pub use cache::{
    CacheStats, CacheStrategy, HttpResource, HttpResourceFetcher, ResourceFetcher, ResponseCache,
    CACHE_VERSION, CRITICAL_ASSETS,
};
pub use entries::EntriesManager;
pub use chat::{ChatManager, ChatMessage, ChatMessageDraft};
pub use donations::{DonationKind, DonationRequest, DonationResponse, DonationsManager};
pub use status::{OfflineStatus, OfflineStatusManager};
