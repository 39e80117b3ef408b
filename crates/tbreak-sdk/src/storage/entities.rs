//! 离线数据实体定义 - 对应本地 sled 树中的存储结构
//!
//! 这里定义了离线存储的所有记录结构体，用于：
//! - 类型安全的数据传输
//! - 与服务端 JSON 文档保持字段一致（camelCase）
//! - 序列化/反序列化支持

use serde::{Deserialize, Serialize};
use std::fmt;

/// 每日打卡记录 - 对应服务端 dailyEntries 集合
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyEntry {
    /// 记录ID，约定为 `{userId}-{dayNumber}`
    pub id: String,
    pub user_id: String,
    pub day_number: u32,
    /// ISO 日期字符串（范围查询按字符串比较）
    pub date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub morning_mood: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noon_mood: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub night_mood: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_today: Option<bool>,
    /// 渴求程度 0-10
    #[serde(skip_serializing_if = "Option::is_none")]
    pub craving_level: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_since_last_use: Option<u32>,
    /// 代谢清除百分比估算
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metabolite_clear_percent: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symptoms: Option<SymptomFlags>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal: Option<String>,
}

/// 戒断症状勾选项
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SymptomFlags {
    pub anxiety: bool,
    pub irritability: bool,
    pub insomnia: bool,
    pub headache: bool,
    pub appetite: bool,
    pub sweating: bool,
}

/// 本地缓存记录包装 - 在域记录之上附加同步标记
///
/// `_synced` / `_pendingDelete` 与域字段平铺存储在同一个 JSON 文档里；
/// 读取缺失标记的旧文档时按默认值补齐。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRecord<T> {
    #[serde(flatten)]
    pub record: T,
    /// 是否已与远端一致；false 时变更队列里必须有对应条目
    #[serde(rename = "_synced", default = "default_synced")]
    pub synced: bool,
    /// 删除墓碑标记（预留字段，目前不会被写为 true）
    #[serde(rename = "_pendingDelete", default)]
    pub pending_delete: bool,
}

fn default_synced() -> bool {
    true
}

impl<T> CachedRecord<T> {
    pub fn new(record: T, synced: bool) -> Self {
        Self {
            record,
            synced,
            pending_delete: false,
        }
    }
}

/// 待同步变更的 HTTP 方法（只收录变更类方法）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeMethod {
    Post,
    Put,
    Delete,
}

impl fmt::Display for ChangeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeMethod::Post => write!(f, "POST"),
            ChangeMethod::Put => write!(f, "PUT"),
            ChangeMethod::Delete => write!(f, "DELETE"),
        }
    }
}

/// 待同步变更 - 对应 pending-changes 树中的一条记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    /// 形如 `{endpoint}-{timestampMs}-{suffix}`，全局唯一
    pub id: String,
    /// 重放目标端点（相对路径）
    pub endpoint: String,
    pub method: ChangeMethod,
    /// 重放请求体；服务端生成的字段在入队前已就地解析
    pub data: serde_json::Value,
    /// 入队毫秒时间戳，决定重放顺序
    pub timestamp: i64,
    /// 入队即为 false；成功重放后整条记录从队列移除
    pub synced: bool,
    /// 已尝试重放次数，超出预算后放弃
    #[serde(default)]
    pub attempts: u32,
    /// 关联的本地缓存记录键，重放成功后把该记录标记为已同步
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_key: Option<String>,
}

/// metadata 树中的一条键值记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub value: serde_json::Value,
    /// 写入毫秒时间戳
    pub timestamp: i64,
}
