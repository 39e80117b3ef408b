//! 响应缓存 - 按请求类别选择策略的资源缓存
//!
//! 三个带版本号的缓存段：
//! - `tbreak-cache-{v}`：关键静态资源（含安装期预缓存的外壳文档）
//! - `tbreak-dynamic-{v}`：文档类资源（stale-while-revalidate 的刷新目标）
//! - `tbreak-api-{v}`：API 响应（network-first 的回退来源）
//!
//! 旧版本段只在 [`ResponseCache::activate`] 里清除，运行期不做淘汰；
//! 升级缓存版本号即可让全部旧内容在下次激活时被回收。
//!
//! 策略选择见 [`ResponseCache::classify`]；写入请求不经过缓存，
//! 由写入路由负责。

use crate::error::{Result, TBreakSDKError};
use crate::sdk::HttpClientConfig;
use crate::transport::{map_reqwest_error, HttpMethod};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 当前缓存版本，升级后旧段在激活时被清除
pub const CACHE_VERSION: &str = "v1";

/// 安装期预缓存的关键资源清单
pub const CRITICAL_ASSETS: [&str; 4] = ["/", "/index.html", "/manifest.json", "/favicon.ico"];

/// 缓存策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStrategy {
    /// 先查缓存，未命中才走网络（静态资源）
    CacheFirst,
    /// 先走网络，失败回退缓存（API 与未归类路径）
    NetworkFirst,
    /// 先回缓存副本，后台刷新（文档）
    StaleWhileRevalidate,
}

impl std::fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheStrategy::CacheFirst => write!(f, "cache-first"),
            CacheStrategy::NetworkFirst => write!(f, "network-first"),
            CacheStrategy::StaleWhileRevalidate => write!(f, "stale-while-revalidate"),
        }
    }
}

/// 一个 HTTP 资源响应
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResource {
    pub status: u16,
    pub content_type: String,
    pub body: Bytes,
}

impl HttpResource {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// 缓存段内的持久化形态（bincode）
#[derive(Debug, Serialize, Deserialize)]
struct StoredResponse {
    status: u16,
    content_type: String,
    body: Vec<u8>,
    /// 写入毫秒时间戳，排查用
    stored_at: i64,
}

impl StoredResponse {
    fn from_resource(resource: &HttpResource) -> Self {
        Self {
            status: resource.status,
            content_type: resource.content_type.clone(),
            body: resource.body.to_vec(),
            stored_at: Utc::now().timestamp_millis(),
        }
    }

    fn into_resource(self) -> HttpResource {
        HttpResource {
            status: self.status,
            content_type: self.content_type,
            body: Bytes::from(self.body),
        }
    }
}

/// 资源获取器
///
/// 与 [`RemoteTransport`](crate::transport::RemoteTransport) 的约定不同：
/// 非 2xx 也按 `Ok` 返回（策略要原样透传 404 之类的响应），
/// 只有网络层失败才是 `Err`。
#[async_trait]
pub trait ResourceFetcher: Send + Sync + std::fmt::Debug {
    /// GET 一个资源
    async fn fetch(&self, path: &str) -> Result<HttpResource>;
}

/// 基于 reqwest 的资源获取器
#[derive(Debug, Clone)]
pub struct HttpResourceFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpResourceFetcher {
    pub fn new(base_url: impl Into<String>, config: &HttpClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(secs) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder
            .build()
            .map_err(|e| TBreakSDKError::Config(format!("构建资源获取客户端失败: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ResourceFetcher for HttpResourceFetcher {
    async fn fetch(&self, path: &str) -> Result<HttpResource> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let body = response.bytes().await.map_err(map_reqwest_error)?;
        Ok(HttpResource {
            status,
            content_type,
            body,
        })
    }
}

/// 缓存统计
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub version: String,
    pub critical_entries: usize,
    pub dynamic_entries: usize,
    pub api_entries: usize,
}

/// 响应缓存
#[derive(Debug)]
pub struct ResponseCache {
    db: sled::Db,
    version: String,
    critical: sled::Tree,
    dynamic: sled::Tree,
    api: sled::Tree,
    fetcher: Arc<dyn ResourceFetcher>,
    asset_pattern: Regex,
}

/// 某个版本的三个缓存段名
fn segment_names(version: &str) -> [String; 3] {
    [
        format!("tbreak-cache-{}", version),
        format!("tbreak-dynamic-{}", version),
        format!("tbreak-api-{}", version),
    ]
}

/// 请求标识：`{METHOD} {PATH}` 的 SHA-256
fn request_key(method: HttpMethod, path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.to_string().as_bytes());
    hasher.update(b" ");
    hasher.update(path.as_bytes());
    hex::encode(hasher.finalize())
}

fn write_segment(tree: &sled::Tree, key: &str, resource: &HttpResource) -> Result<()> {
    let stored = StoredResponse::from_resource(resource);
    let raw = bincode::serialize(&stored)
        .map_err(|e| TBreakSDKError::Serialization(format!("序列化缓存响应失败: {}", e)))?;
    tree.insert(key.as_bytes(), raw)
        .map_err(|e| TBreakSDKError::Store(format!("写入缓存段失败: {}", e)))?;
    Ok(())
}

/// 静态资源完全不可达时的离线占位响应
pub fn offline_asset_response() -> HttpResource {
    HttpResource {
        status: 503,
        content_type: "text/plain".to_string(),
        body: Bytes::from_static(b"Offline - Resource not available"),
    }
}

/// API 不可达且无缓存副本时的离线占位响应
pub fn offline_api_response() -> HttpResource {
    HttpResource {
        status: 503,
        content_type: "application/json".to_string(),
        body: Bytes::from_static(br#"{"error":"Offline - cached data unavailable"}"#),
    }
}

impl ResponseCache {
    /// 打开响应缓存
    pub async fn open(
        base_path: impl AsRef<Path>,
        version: impl Into<String>,
        fetcher: Arc<dyn ResourceFetcher>,
    ) -> Result<Self> {
        let base_path = base_path.as_ref();
        tokio::fs::create_dir_all(base_path)
            .await
            .map_err(|e| TBreakSDKError::IO(format!("创建缓存目录失败: {}", e)))?;
        let db = sled::open(base_path.join("cache"))
            .map_err(|e| TBreakSDKError::Store(format!("打开响应缓存失败: {}", e)))?;

        let version = version.into();
        let [critical_name, dynamic_name, api_name] = segment_names(&version);
        let critical = db
            .open_tree(&critical_name)
            .map_err(|e| TBreakSDKError::Store(format!("打开关键资源段失败: {}", e)))?;
        let dynamic = db
            .open_tree(&dynamic_name)
            .map_err(|e| TBreakSDKError::Store(format!("打开文档段失败: {}", e)))?;
        let api = db
            .open_tree(&api_name)
            .map_err(|e| TBreakSDKError::Store(format!("打开 API 段失败: {}", e)))?;

        let asset_pattern = Regex::new(r"\.(js|css|png|jpe?g|gif|svg|ico|woff2?)$")
            .map_err(|e| TBreakSDKError::Other(format!("编译资源匹配正则失败: {}", e)))?;

        info!("✅ 响应缓存已打开: 版本 {}", version);
        Ok(Self {
            db,
            version,
            critical,
            dynamic,
            api,
            fetcher,
            asset_pattern,
        })
    }

    /// 激活当前版本：清除所有旧版本的缓存段，返回清除个数
    ///
    /// 这是唯一的淘汰路径，运行期不按条目回收。
    pub fn activate(&self) -> Result<usize> {
        let current = segment_names(&self.version);
        let mut dropped = 0;
        for name in self.db.tree_names() {
            if &*name == b"__sled__default" {
                continue;
            }
            let name_str = String::from_utf8_lossy(&name).to_string();
            if current.iter().any(|segment| segment.as_str() == name_str) {
                continue;
            }
            match self.db.drop_tree(&name) {
                Ok(true) => {
                    info!("🗑️ 旧缓存段已清除: {}", name_str);
                    dropped += 1;
                }
                Ok(false) => {}
                Err(e) => warn!("⚠️ 清除旧缓存段失败: {} ({})", name_str, e),
            }
        }
        if dropped > 0 {
            info!("🧹 缓存激活完成，共清除 {} 个旧段", dropped);
        }
        Ok(dropped)
    }

    /// 按路径选择缓存策略
    ///
    /// `/api` 前缀优先判定，`/api/styles.css` 也按 network-first 处理。
    pub fn classify(&self, path: &str) -> CacheStrategy {
        if path.starts_with("/api") {
            return CacheStrategy::NetworkFirst;
        }
        if self.asset_pattern.is_match(path) {
            return CacheStrategy::CacheFirst;
        }
        if path == "/" || path.ends_with(".html") {
            return CacheStrategy::StaleWhileRevalidate;
        }
        CacheStrategy::NetworkFirst
    }

    /// 处理一个 GET 资源请求
    ///
    /// 写入请求不经过缓存（应走写入路由），传入非 GET 视为调用方错误。
    pub async fn handle_request(&self, method: HttpMethod, path: &str) -> Result<HttpResource> {
        if method != HttpMethod::Get {
            return Err(TBreakSDKError::InvalidInput(format!(
                "响应缓存只处理 GET 请求: {} {}",
                method, path
            )));
        }
        let key = request_key(method, path);
        match self.classify(path) {
            CacheStrategy::CacheFirst => self.cache_first(&key, path).await,
            CacheStrategy::NetworkFirst => self.network_first(&key, path).await,
            CacheStrategy::StaleWhileRevalidate => self.stale_while_revalidate(&key, path).await,
        }
    }

    async fn cache_first(&self, key: &str, path: &str) -> Result<HttpResource> {
        if let Some(hit) = self.lookup(&self.critical, key)? {
            debug!("🎯 缓存命中 (cache-first): {}", path);
            return Ok(hit);
        }
        match self.fetcher.fetch(path).await {
            Ok(resource) => {
                if resource.is_success() {
                    write_segment(&self.critical, key, &resource)?;
                    debug!("💾 资源已缓存 (cache-first): {}", path);
                }
                Ok(resource)
            }
            Err(error) => {
                debug!("📴 资源不可达，返回离线占位响应: {} ({})", path, error);
                Ok(offline_asset_response())
            }
        }
    }

    async fn network_first(&self, key: &str, path: &str) -> Result<HttpResource> {
        match self.fetcher.fetch(path).await {
            Ok(resource) => {
                if resource.is_success() {
                    write_segment(&self.api, key, &resource)?;
                }
                Ok(resource)
            }
            Err(error) => {
                if let Some(hit) = self.lookup(&self.api, key)? {
                    debug!("🎯 网络失败，回退缓存副本 (network-first): {} ({})", path, error);
                    return Ok(hit);
                }
                debug!("📴 网络失败且无缓存副本: {} ({})", path, error);
                Ok(offline_api_response())
            }
        }
    }

    async fn stale_while_revalidate(&self, key: &str, path: &str) -> Result<HttpResource> {
        // 预缓存的外壳文档落在关键段，文档段未命中时兜底查一次
        let cached = match self.lookup(&self.dynamic, key)? {
            Some(hit) => Some(hit),
            None => self.lookup(&self.critical, key)?,
        };

        if let Some(stale) = cached {
            debug!("🎯 返回缓存副本并后台刷新: {}", path);
            let fetcher = Arc::clone(&self.fetcher);
            let tree = self.dynamic.clone();
            let key = key.to_string();
            let path = path.to_string();
            tokio::spawn(async move {
                match fetcher.fetch(&path).await {
                    Ok(resource) if resource.is_success() => {
                        if let Err(e) = write_segment(&tree, &key, &resource) {
                            debug!("后台刷新写入失败: {} ({})", path, e);
                        }
                    }
                    Ok(resource) => {
                        debug!("后台刷新收到非 2xx，保留旧副本: {} ({})", path, resource.status)
                    }
                    Err(e) => debug!("后台刷新失败，保留旧副本: {} ({})", path, e),
                }
            });
            return Ok(stale);
        }

        // 无缓存副本时直接透传网络结果，网络失败原样上抛
        let resource = self.fetcher.fetch(path).await?;
        if resource.is_success() {
            write_segment(&self.dynamic, key, &resource)?;
        }
        Ok(resource)
    }

    fn lookup(&self, tree: &sled::Tree, key: &str) -> Result<Option<HttpResource>> {
        let raw = match tree
            .get(key.as_bytes())
            .map_err(|e| TBreakSDKError::Store(format!("读取缓存段失败: {}", e)))?
        {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let stored: StoredResponse = bincode::deserialize(&raw)
            .map_err(|e| TBreakSDKError::Serialization(format!("解析缓存响应失败: {}", e)))?;
        Ok(Some(stored.into_resource()))
    }

    /// 并发预缓存关键资源清单，返回成功缓存的条数
    pub async fn precache_critical_assets(&self) -> Result<usize> {
        let fetches = CRITICAL_ASSETS.iter().map(|path| {
            let fetcher = Arc::clone(&self.fetcher);
            async move { (*path, fetcher.fetch(path).await) }
        });
        let results = futures::future::join_all(fetches).await;

        let mut cached = 0;
        for (path, result) in results {
            match result {
                Ok(resource) if resource.is_success() => {
                    let key = request_key(HttpMethod::Get, path);
                    write_segment(&self.critical, &key, &resource)?;
                    cached += 1;
                }
                Ok(resource) => warn!("⚠️ 预缓存收到非 2xx: {} ({})", path, resource.status),
                Err(e) => warn!("⚠️ 预缓存失败: {} ({})", path, e),
            }
        }
        info!("✅ 关键资源预缓存完成: {}/{}", cached, CRITICAL_ASSETS.len());
        Ok(cached)
    }

    /// 缓存统计（各段条数）
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            version: self.version.clone(),
            critical_entries: self.critical.len(),
            dynamic_entries: self.dynamic.len(),
            api_entries: self.api.len(),
        }
    }

    /// 当前缓存版本
    pub fn version(&self) -> &str {
        &self.version
    }

    /// 把挂起的写入落盘
    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| TBreakSDKError::Store(format!("缓存落盘失败: {}", e)))?;
        Ok(())
    }
}
