//! 每日记录管理 - 打卡记录的保存与查询
//!
//! 保存走写入路由（离线自动入队），查询先远端后本地：
//! 在线时远端结果会镜像进本地缓存，离线时退回缓存副本。

use crate::error::{Result, TBreakSDKError};
use crate::network::NetworkMonitor;
use crate::router::{QueuedWrite, WriteOutcome, WriteRouter};
use crate::storage::{CachedRecord, ChangeMethod, DailyEntry, OfflineStore};
use crate::transport::{ApiRequest, HttpMethod, RemoteTransport};
use chrono::NaiveDate;
use std::sync::Arc;
use tracing::{debug, warn};

/// 每日记录管理器
#[derive(Debug)]
pub struct EntriesManager {
    store: Arc<OfflineStore>,
    transport: Arc<dyn RemoteTransport>,
    router: Arc<WriteRouter>,
    monitor: Arc<NetworkMonitor>,
}

impl EntriesManager {
    pub fn new(
        store: Arc<OfflineStore>,
        transport: Arc<dyn RemoteTransport>,
        router: Arc<WriteRouter>,
        monitor: Arc<NetworkMonitor>,
    ) -> Self {
        Self {
            store,
            transport,
            router,
            monitor,
        }
    }

    /// 保存（新建或覆盖）一条每日记录
    ///
    /// 记录按 `id` 整条 PUT，远端以最后写入为准；离线时入队等待重放。
    pub async fn save_entry(&self, entry: &DailyEntry) -> Result<WriteOutcome<()>> {
        if entry.id.is_empty() || entry.user_id.is_empty() {
            return Err(TBreakSDKError::InvalidInput(
                "每日记录缺少 id 或 userId".to_string(),
            ));
        }

        let endpoint = format!("/dailyEntries/{}", entry.id);
        let payload = serde_json::to_value(entry)
            .map_err(|e| TBreakSDKError::Serialization(format!("序列化每日记录失败: {}", e)))?;
        let request = ApiRequest::new(&endpoint, HttpMethod::Put).with_body(payload.clone());

        let transport = Arc::clone(&self.transport);
        let remote = move || async move { transport.execute(&request).await.map(|_| ()) };
        let fallback = QueuedWrite::new(endpoint, ChangeMethod::Put, payload)
            .with_entry_mirror(entry.clone());

        self.router.perform_write(remote, fallback).await
    }

    /// 查询某个用户第 `day_number` 天的记录
    ///
    /// 在线时查远端并镜像到本地；远端 404 视为不存在；
    /// 连接故障或离线时退回本地缓存。
    pub async fn get_entry(&self, user_id: &str, day_number: u32) -> Result<Option<DailyEntry>> {
        if user_id.is_empty() {
            return Err(TBreakSDKError::InvalidInput("userId 不能为空".to_string()));
        }
        let entry_id = format!("{}-{}", user_id, day_number);

        if self.monitor.is_online() {
            let request =
                ApiRequest::new(format!("/dailyEntries/{}", entry_id), HttpMethod::Get);
            match self.transport.execute(&request).await {
                Ok(response) => {
                    if response.body.is_null() {
                        return Ok(None);
                    }
                    let entry: DailyEntry = serde_json::from_value(response.body).map_err(|e| {
                        TBreakSDKError::Serialization(format!("解析每日记录响应失败: {}", e))
                    })?;
                    if let Err(e) = self.store.put_entry(&entry, true).await {
                        warn!("⚠️ 镜像远端记录失败: {} ({})", entry_id, e);
                    }
                    return Ok(Some(entry));
                }
                Err(TBreakSDKError::Rejected { status: 404, .. }) => return Ok(None),
                Err(error) if error.is_connectivity() => {
                    debug!("📴 远端查询失败，回退本地缓存: {} ({})", entry_id, error);
                }
                Err(error) => return Err(error),
            }
        } else {
            debug!("📴 离线状态，直接读本地缓存: {}", entry_id);
        }

        let cached = self.store.entry_by_id(user_id, &entry_id).await?;
        Ok(cached.map(|record| record.record))
    }

    /// 查询某个用户某个自然月的全部记录
    pub async fn entries_for_month(
        &self,
        user_id: &str,
        year: i32,
        month: u32,
    ) -> Result<Vec<DailyEntry>> {
        if user_id.is_empty() {
            return Err(TBreakSDKError::InvalidInput("userId 不能为空".to_string()));
        }
        let (from, to) = month_range(year, month)?;

        if self.monitor.is_online() {
            let request = ApiRequest::new(
                format!("/dailyEntries?userId={}&from={}&to={}", user_id, from, to),
                HttpMethod::Get,
            );
            match self.transport.execute(&request).await {
                Ok(response) => {
                    if response.body.is_null() {
                        return Ok(Vec::new());
                    }
                    let entries: Vec<DailyEntry> = serde_json::from_value(response.body)
                        .map_err(|e| {
                            TBreakSDKError::Serialization(format!(
                                "解析月度记录响应失败: {}",
                                e
                            ))
                        })?;
                    for entry in &entries {
                        if let Err(e) = self.store.put_entry(entry, true).await {
                            warn!("⚠️ 镜像远端记录失败: {} ({})", entry.id, e);
                        }
                    }
                    return Ok(entries);
                }
                Err(error) if error.is_connectivity() => {
                    debug!(
                        "📴 月度查询失败，回退本地缓存: {}-{:02} ({})",
                        year, month, error
                    );
                }
                Err(error) => return Err(error),
            }
        } else {
            debug!("📴 离线状态，月度查询直接读本地缓存: {}-{:02}", year, month);
        }

        let cached = self.store.entries_in_date_range(user_id, &from, &to).await?;
        Ok(cached.into_iter().map(|record| record.record).collect())
    }

    /// 直接读本地缓存副本（含 `_synced` 标记），不碰网络
    pub async fn get_entry_offline(
        &self,
        user_id: &str,
        entry_id: &str,
    ) -> Result<Option<CachedRecord<DailyEntry>>> {
        self.store.entry_by_id(user_id, entry_id).await
    }
}

/// 自然月的查询区间：首日日期与末日的当天末尾时刻
fn month_range(year: i32, month: u32) -> Result<(String, String)> {
    let invalid = || TBreakSDKError::InvalidInput(format!("非法年月: {}-{}", year, month));
    let first = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(invalid)?;
    let next_month = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    let last = next_month.and_then(|d| d.pred_opt()).ok_or_else(invalid)?;
    Ok((first.to_string(), format!("{}T23:59:59.999Z", last)))
}
