//! 离线存储层 - 基于 sled 的本地持久化
//!
//! 三棵树对应三个存储域：
//! - `daily-entries`：域记录缓存（带 `_synced` / `_pendingDelete` 标记）
//! - `pending-changes`：待同步变更队列（键按入队顺序排列）
//! - `metadata`：架构版本、在线状态等少量键值
//!
//! 变更队列的键是补零毫秒时间戳加进程内序号，sled 的字典序遍历
//! 天然等于入队顺序，重放引擎无需额外排序。

pub mod entities;

pub use entities::{
    CachedRecord, ChangeMethod, DailyEntry, MetadataRecord, PendingChange, SymptomFlags,
};

use crate::error::{Result, TBreakSDKError};
use chrono::Utc;
use serde::Serialize;
use sled::transaction::TransactionResult;
use sled::Transactional;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// 当前本地存储架构版本
pub const STORE_SCHEMA_VERSION: u32 = 1;

/// sled 打开重试次数（上一个实例尚未释放文件锁时）
const MAX_OPEN_RETRIES: usize = 8;
/// 打开重试基础延迟（毫秒），逐次翻倍
const RETRY_DELAY_MS: u64 = 300;

/// 树名与键约定
pub mod keys {
    /// 域记录缓存树
    pub const DAILY_ENTRIES_TREE: &str = "daily-entries";
    /// 待同步变更队列树
    pub const PENDING_CHANGES_TREE: &str = "pending-changes";
    /// 元数据树
    pub const METADATA_TREE: &str = "metadata";

    /// 本地存储架构版本
    pub const SCHEMA_VERSION: &str = "schema-version";
    /// 最近一次观察到的在线状态
    pub const ONLINE_STATUS: &str = "online-status";

    /// 域记录键：`{userId}:{date}:{id}`，支持按用户前缀扫描
    pub fn entry_key(user_id: &str, date: &str, id: &str) -> String {
        format!("{}:{}:{}", user_id, date, id)
    }

    /// 某个用户全部记录的键前缀
    pub fn user_prefix(user_id: &str) -> String {
        format!("{}:", user_id)
    }

    /// 变更队列键：毫秒时间戳补零到 13 位，字典序即入队序
    pub fn change_key(timestamp_ms: i64, suffix: &str) -> String {
        format!("{:013}:{}", timestamp_ms, suffix)
    }
}

/// 存储统计信息
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub entry_count: usize,
    pub pending_count: usize,
    pub metadata_count: usize,
}

/// 离线存储
///
/// 所有方法对并发调用安全；sled 单条操作自带原子性，
/// [`clear_all`](Self::clear_all) 用多树事务保证全清或全不清。
#[derive(Debug)]
pub struct OfflineStore {
    base_path: PathBuf,
    db: sled::Db,
    entries: sled::Tree,
    changes: sled::Tree,
    metadata: sled::Tree,
    /// 进程内单调序号，保证同一毫秒内入队的变更仍按顺序排列
    change_seq: AtomicU64,
}

impl OfflineStore {
    /// 打开（或创建）离线存储
    pub async fn open(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&base_path)
            .await
            .map_err(|e| TBreakSDKError::IO(format!("创建离线存储目录失败: {}", e)))?;

        let db_path = base_path.join("offline");
        let db = Self::open_with_retry(&db_path).await?;

        let entries = db
            .open_tree(keys::DAILY_ENTRIES_TREE)
            .map_err(|e| store_error("打开域记录树失败", e))?;
        let changes = db
            .open_tree(keys::PENDING_CHANGES_TREE)
            .map_err(|e| store_error("打开变更队列树失败", e))?;
        let metadata = db
            .open_tree(keys::METADATA_TREE)
            .map_err(|e| store_error("打开元数据树失败", e))?;

        let store = Self {
            base_path,
            db,
            entries,
            changes,
            metadata,
            change_seq: AtomicU64::new(0),
        };
        store.check_schema_version()?;

        info!("✅ 离线存储已打开: {:?}", store.base_path);
        Ok(store)
    }

    /// 带退避的 sled 打开
    ///
    /// 上一个进程实例退出时文件锁可能尚未释放，按指数退避重试。
    async fn open_with_retry(db_path: &Path) -> Result<sled::Db> {
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(db_path) {
                Ok(db) => {
                    if attempt > 0 {
                        info!("✅ sled 数据库在第 {} 次重试后打开成功", attempt);
                    }
                    return Ok(db);
                }
                Err(e) => {
                    let msg = e.to_string();
                    let lock_contention = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if lock_contention && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        warn!(
                            "⚠️ sled 数据库被占用，{}ms 后重试 ({}/{})",
                            delay_ms,
                            attempt + 1,
                            MAX_OPEN_RETRIES
                        );
                        sleep(Duration::from_millis(delay_ms)).await;
                        continue;
                    }
                    return Err(store_error("打开 sled 数据库失败", e));
                }
            }
        }
        Err(TBreakSDKError::Store(
            "打开 sled 数据库失败: 重试次数耗尽".to_string(),
        ))
    }

    /// 校验（必要时升级）本地存储架构版本
    fn check_schema_version(&self) -> Result<()> {
        let stamped: Option<u32> = self
            .metadata
            .get(keys::SCHEMA_VERSION)
            .map_err(|e| store_error("读取架构版本失败", e))?
            .and_then(|raw| serde_json::from_slice::<MetadataRecord>(&raw).ok())
            .and_then(|record| serde_json::from_value(record.value).ok());

        match stamped {
            Some(v) if v == STORE_SCHEMA_VERSION => Ok(()),
            Some(v) if v > STORE_SCHEMA_VERSION => Err(TBreakSDKError::Migration(format!(
                "本地存储架构版本 v{} 高于当前支持的 v{}，请升级应用",
                v, STORE_SCHEMA_VERSION
            ))),
            Some(v) => {
                // 预留升级路径：v1 之前没有历史版本，重新打标即可
                info!("本地存储架构从 v{} 升级到 v{}", v, STORE_SCHEMA_VERSION);
                self.stamp_schema_version()
            }
            None => self.stamp_schema_version(),
        }
    }

    fn stamp_schema_version(&self) -> Result<()> {
        let record = MetadataRecord {
            value: serde_json::json!(STORE_SCHEMA_VERSION),
            timestamp: Utc::now().timestamp_millis(),
        };
        let raw = serde_json::to_vec(&record)
            .map_err(|e| TBreakSDKError::Serialization(format!("序列化架构版本失败: {}", e)))?;
        self.metadata
            .insert(keys::SCHEMA_VERSION, raw)
            .map_err(|e| store_error("写入架构版本失败", e))?;
        Ok(())
    }

    // ==================== 域记录缓存 ====================

    /// 写入（或覆盖）一条域记录缓存
    ///
    /// `synced` 表示该记录是否已与远端一致。离线写入的本地副本应传
    /// false，并配合 [`enqueue_linked_change`](Self::enqueue_linked_change)
    /// 保证未同步记录总有对应的队列条目。
    pub async fn put_entry(&self, entry: &DailyEntry, synced: bool) -> Result<()> {
        let record = CachedRecord::new(entry.clone(), synced);
        let raw = serde_json::to_vec(&record)
            .map_err(|e| TBreakSDKError::Serialization(format!("序列化域记录失败: {}", e)))?;
        let key = keys::entry_key(&entry.user_id, &entry.date, &entry.id);
        self.entries
            .insert(key.as_bytes(), raw)
            .map_err(|e| store_error("写入域记录失败", e))?;
        debug!("💾 域记录已缓存: {} (synced={})", entry.id, synced);
        Ok(())
    }

    /// 按记录ID查找某个用户的域记录
    pub async fn entry_by_id(
        &self,
        user_id: &str,
        entry_id: &str,
    ) -> Result<Option<CachedRecord<DailyEntry>>> {
        let prefix = keys::user_prefix(user_id);
        for item in self.entries.scan_prefix(prefix.as_bytes()) {
            let (_, raw) = item.map_err(|e| store_error("扫描域记录失败", e))?;
            let record: CachedRecord<DailyEntry> = serde_json::from_slice(&raw)
                .map_err(|e| TBreakSDKError::Serialization(format!("解析域记录失败: {}", e)))?;
            if record.record.id == entry_id {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// 某个用户的全部域记录（按日期键序）
    pub async fn entries_for_user(&self, user_id: &str) -> Result<Vec<CachedRecord<DailyEntry>>> {
        let prefix = keys::user_prefix(user_id);
        let mut result = Vec::new();
        for item in self.entries.scan_prefix(prefix.as_bytes()) {
            let (_, raw) = item.map_err(|e| store_error("扫描域记录失败", e))?;
            let record: CachedRecord<DailyEntry> = serde_json::from_slice(&raw)
                .map_err(|e| TBreakSDKError::Serialization(format!("解析域记录失败: {}", e)))?;
            result.push(record);
        }
        Ok(result)
    }

    /// 某个用户在 ISO 日期区间内的域记录（闭区间，字符串比较）
    pub async fn entries_in_date_range(
        &self,
        user_id: &str,
        from: &str,
        to: &str,
    ) -> Result<Vec<CachedRecord<DailyEntry>>> {
        let all = self.entries_for_user(user_id).await?;
        Ok(all
            .into_iter()
            .filter(|record| {
                let date = record.record.date.as_str();
                date >= from && date <= to
            })
            .collect())
    }

    /// 把指定键的域记录标记为已同步（重放成功后调用）
    ///
    /// 记录不存在时静默返回，不视为错误。
    pub async fn mark_record_synced(&self, record_key: &str) -> Result<()> {
        let raw = match self
            .entries
            .get(record_key.as_bytes())
            .map_err(|e| store_error("读取域记录失败", e))?
        {
            Some(raw) => raw,
            None => return Ok(()),
        };
        let mut record: CachedRecord<DailyEntry> = serde_json::from_slice(&raw)
            .map_err(|e| TBreakSDKError::Serialization(format!("解析域记录失败: {}", e)))?;
        if record.synced {
            return Ok(());
        }
        record.synced = true;
        let updated = serde_json::to_vec(&record)
            .map_err(|e| TBreakSDKError::Serialization(format!("序列化域记录失败: {}", e)))?;
        self.entries
            .insert(record_key.as_bytes(), updated)
            .map_err(|e| store_error("更新域记录失败", e))?;
        debug!("✅ 域记录已标记为同步: {}", record_key);
        Ok(())
    }

    // ==================== 待同步变更队列 ====================

    /// 追加一条待同步变更，返回变更ID
    ///
    /// ID 形如 `{endpoint}-{timestampMs}-{suffix}`。suffix 由进程内
    /// 单调序号加随机尾注组成，同一毫秒内多次入队既不互相覆盖，
    /// 也不会打乱顺序。
    pub async fn enqueue_change(
        &self,
        endpoint: &str,
        method: ChangeMethod,
        data: serde_json::Value,
    ) -> Result<String> {
        self.enqueue_linked_change(endpoint, method, data, None).await
    }

    /// 同 [`enqueue_change`](Self::enqueue_change)，并关联一条本地缓存记录键
    pub async fn enqueue_linked_change(
        &self,
        endpoint: &str,
        method: ChangeMethod,
        data: serde_json::Value,
        record_key: Option<String>,
    ) -> Result<String> {
        let timestamp = Utc::now().timestamp_millis();
        let seq = self.change_seq.fetch_add(1, Ordering::SeqCst);
        let suffix = format!("{:06x}{:04x}", seq & 0xff_ffff, rand::random::<u16>());
        let id = format!("{}-{}-{}", endpoint, timestamp, suffix);

        let change = PendingChange {
            id: id.clone(),
            endpoint: endpoint.to_string(),
            method,
            data,
            timestamp,
            synced: false,
            attempts: 0,
            record_key,
        };
        let raw = serde_json::to_vec(&change)
            .map_err(|e| TBreakSDKError::Serialization(format!("序列化待同步变更失败: {}", e)))?;
        let key = keys::change_key(timestamp, &suffix);
        self.changes
            .insert(key.as_bytes(), raw)
            .map_err(|e| store_error("写入待同步变更失败", e))?;

        info!("📤 变更已入队: {} {} -> {}", method, endpoint, id);
        Ok(id)
    }

    /// 按入队顺序返回全部待同步变更
    pub async fn pending_changes(&self) -> Result<Vec<PendingChange>> {
        let mut result = Vec::new();
        for item in self.changes.iter() {
            let (_, raw) = item.map_err(|e| store_error("遍历变更队列失败", e))?;
            let change: PendingChange = serde_json::from_slice(&raw).map_err(|e| {
                TBreakSDKError::Serialization(format!("解析待同步变更失败: {}", e))
            })?;
            result.push(change);
        }
        Ok(result)
    }

    /// 待同步变更数量
    pub async fn pending_count(&self) -> Result<usize> {
        Ok(self.changes.len())
    }

    /// 移除一条待同步变更（重放成功或放弃后调用）
    ///
    /// 重复移除是幂等的：变更不存在时静默返回。
    pub async fn remove_change(&self, change_id: &str) -> Result<()> {
        if let Some(key) = derived_change_key(change_id) {
            let removed = self
                .changes
                .remove(key.as_bytes())
                .map_err(|e| store_error("移除待同步变更失败", e))?;
            if removed.is_some() {
                debug!("🗑️ 变更已出队: {}", change_id);
                return Ok(());
            }
        }
        // ID 格式异常的兜底路径：按存储的 id 字段扫描
        if let Some(key) = self.locate_change_key(change_id)? {
            self.changes
                .remove(&key)
                .map_err(|e| store_error("移除待同步变更失败", e))?;
            debug!("🗑️ 变更已出队: {}", change_id);
        }
        Ok(())
    }

    /// 累加一条变更的重放尝试次数，返回新的次数
    ///
    /// 变更已不存在（并发排空移除了它）时返回 0。
    pub async fn record_attempt(&self, change_id: &str) -> Result<u32> {
        let key: sled::IVec = match derived_change_key(change_id) {
            Some(k)
                if self
                    .changes
                    .contains_key(k.as_bytes())
                    .map_err(|e| store_error("读取待同步变更失败", e))? =>
            {
                sled::IVec::from(k.as_bytes())
            }
            _ => match self.locate_change_key(change_id)? {
                Some(k) => k,
                None => return Ok(0),
            },
        };

        let raw = match self
            .changes
            .get(&key)
            .map_err(|e| store_error("读取待同步变更失败", e))?
        {
            Some(raw) => raw,
            None => return Ok(0),
        };
        let mut change: PendingChange = serde_json::from_slice(&raw)
            .map_err(|e| TBreakSDKError::Serialization(format!("解析待同步变更失败: {}", e)))?;
        change.attempts += 1;
        let updated = serde_json::to_vec(&change)
            .map_err(|e| TBreakSDKError::Serialization(format!("序列化待同步变更失败: {}", e)))?;
        self.changes
            .insert(&key, updated)
            .map_err(|e| store_error("更新待同步变更失败", e))?;
        Ok(change.attempts)
    }

    fn locate_change_key(&self, change_id: &str) -> Result<Option<sled::IVec>> {
        for item in self.changes.iter() {
            let (key, raw) = item.map_err(|e| store_error("遍历变更队列失败", e))?;
            if let Ok(change) = serde_json::from_slice::<PendingChange>(&raw) {
                if change.id == change_id {
                    return Ok(Some(key));
                }
            }
        }
        Ok(None)
    }

    // ==================== 元数据 ====================

    /// 写入一条元数据
    pub async fn set_metadata<V: Serialize>(&self, key: &str, value: &V) -> Result<()> {
        let record = MetadataRecord {
            value: serde_json::to_value(value)
                .map_err(|e| TBreakSDKError::Serialization(format!("序列化元数据失败: {}", e)))?,
            timestamp: Utc::now().timestamp_millis(),
        };
        let raw = serde_json::to_vec(&record)
            .map_err(|e| TBreakSDKError::Serialization(format!("序列化元数据失败: {}", e)))?;
        self.metadata
            .insert(key.as_bytes(), raw)
            .map_err(|e| store_error("写入元数据失败", e))?;
        Ok(())
    }

    /// 读取一条元数据的值
    pub async fn get_metadata(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let raw = match self
            .metadata
            .get(key.as_bytes())
            .map_err(|e| store_error("读取元数据失败", e))?
        {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let record: MetadataRecord = serde_json::from_slice(&raw)
            .map_err(|e| TBreakSDKError::Serialization(format!("解析元数据失败: {}", e)))?;
        Ok(Some(record.value))
    }

    /// 持久化最近一次观察到的在线状态
    pub async fn set_online_status(&self, is_online: bool) -> Result<()> {
        self.set_metadata(keys::ONLINE_STATUS, &is_online).await
    }

    /// 读取最近一次持久化的在线状态；缺失或读取失败时默认在线
    pub async fn online_status(&self) -> bool {
        match self.get_metadata(keys::ONLINE_STATUS).await {
            Ok(Some(value)) => value.as_bool().unwrap_or(true),
            _ => true,
        }
    }

    // ==================== 维护操作 ====================

    /// 一次性清空域记录与变更队列（登出时调用）
    ///
    /// 两棵树在同一个 sled 事务里批量删除，要么全部成功要么全部回滚。
    /// metadata 树保留，架构版本与在线状态不随登出丢失。
    pub async fn clear_all(&self) -> Result<()> {
        let entry_keys = collect_keys(&self.entries)?;
        let change_keys = collect_keys(&self.changes)?;

        let mut entry_batch = sled::Batch::default();
        for key in &entry_keys {
            entry_batch.remove(key.as_ref());
        }
        let mut change_batch = sled::Batch::default();
        for key in &change_keys {
            change_batch.remove(key.as_ref());
        }

        let result: TransactionResult<(), sled::Error> = (&self.entries, &self.changes).transaction(
            move |(entries_tx, changes_tx)| {
                entries_tx.apply_batch(&entry_batch)?;
                changes_tx.apply_batch(&change_batch)?;
                Ok(())
            },
        );
        result.map_err(|e| TBreakSDKError::Store(format!("清空离线数据失败: {}", e)))?;

        info!(
            "🗑️ 离线数据已清空: {} 条域记录, {} 条待同步变更",
            entry_keys.len(),
            change_keys.len()
        );
        Ok(())
    }

    /// 存储统计（各树的记录条数）
    pub async fn stats(&self) -> StoreStats {
        StoreStats {
            entry_count: self.entries.len(),
            pending_count: self.changes.len(),
            metadata_count: self.metadata.len(),
        }
    }

    /// 把挂起的写入落盘（关停前调用）
    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| store_error("落盘失败", e))?;
        Ok(())
    }

    /// 存储根目录
    pub fn path(&self) -> &Path {
        &self.base_path
    }
}

/// 从变更ID反推队列键
///
/// endpoint 自身可能包含 `-`，从右侧切分出时间戳和尾注。
fn derived_change_key(change_id: &str) -> Option<String> {
    let mut parts = change_id.rsplitn(3, '-');
    let suffix = parts.next()?;
    let timestamp: i64 = parts.next()?.parse().ok()?;
    parts.next()?;
    Some(keys::change_key(timestamp, suffix))
}

fn collect_keys(tree: &sled::Tree) -> Result<Vec<sled::IVec>> {
    tree.iter()
        .keys()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| store_error("收集树键失败", e))
}

/// sled 错误归类：磁盘满映射为 QuotaExceeded，其余为 Store
fn store_error(context: &str, error: sled::Error) -> TBreakSDKError {
    match TBreakSDKError::from(error) {
        TBreakSDKError::QuotaExceeded(msg) => {
            TBreakSDKError::QuotaExceeded(format!("{}: {}", context, msg))
        }
        TBreakSDKError::Store(msg) => TBreakSDKError::Store(format!("{}: {}", context, msg)),
        other => other,
    }
}
