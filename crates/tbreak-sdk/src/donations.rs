//! 捐赠支持 - 发起捐赠会话与补录捐赠记录
//!
//! 发起捐赠需要远端返回支付会话，离线时入队后用户下次在线才会
//! 真正创建会话；补录记录是纯追加写，离线入队完全等价。

use crate::error::{Result, TBreakSDKError};
use crate::router::{QueuedWrite, WriteOutcome, WriteRouter};
use crate::storage::ChangeMethod;
use crate::transport::{ApiRequest, HttpMethod, RemoteTransport};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 捐赠渠道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DonationKind {
    Stripe,
    Revenuecat,
    Manual,
}

impl std::fmt::Display for DonationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DonationKind::Stripe => write!(f, "stripe"),
            DonationKind::Revenuecat => write!(f, "revenuecat"),
            DonationKind::Manual => write!(f, "manual"),
        }
    }
}

/// 发起捐赠的请求
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonationRequest {
    #[serde(rename = "type")]
    pub kind: DonationKind,
    pub user_id: String,
    pub amount: f64,
    pub tier_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stripe_price: Option<String>,
}

/// 发起捐赠的远端响应
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonationResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub session_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// 补录的捐赠记录
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DonationRecord {
    user_id: String,
    amount: f64,
    #[serde(rename = "type")]
    kind: DonationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    transaction_id: Option<String>,
    /// RFC3339 时间戳，补录时刻
    timestamp: String,
}

/// 捐赠管理器
#[derive(Debug)]
pub struct DonationsManager {
    router: Arc<WriteRouter>,
    transport: Arc<dyn RemoteTransport>,
}

impl DonationsManager {
    pub fn new(router: Arc<WriteRouter>, transport: Arc<dyn RemoteTransport>) -> Self {
        Self { router, transport }
    }

    /// 发起一次捐赠
    ///
    /// 在线时返回远端创建的支付会话；离线入队后返回 `Queued`，
    /// 调用方应提示用户稍后在线完成支付。
    pub async fn initiate_donation(
        &self,
        request: &DonationRequest,
    ) -> Result<WriteOutcome<DonationResponse>> {
        if request.amount <= 0.0 {
            return Err(TBreakSDKError::InvalidInput(format!(
                "捐赠金额必须为正数: {}",
                request.amount
            )));
        }
        if request.user_id.is_empty() {
            return Err(TBreakSDKError::InvalidInput("userId 不能为空".to_string()));
        }

        let payload = serde_json::to_value(request)
            .map_err(|e| TBreakSDKError::Serialization(format!("序列化捐赠请求失败: {}", e)))?;
        let api_request =
            ApiRequest::new("/donations/initiate", HttpMethod::Post).with_body(payload.clone());

        let transport = Arc::clone(&self.transport);
        let remote = move || async move {
            let response = transport.execute(&api_request).await?;
            // 远端响应结构不规范时退回空响应，由调用方按 success 判断
            Ok(serde_json::from_value(response.body).unwrap_or_default())
        };
        let fallback = QueuedWrite::new("/donations/initiate", ChangeMethod::Post, payload);

        self.router.perform_write(remote, fallback).await
    }

    /// 补录一笔已完成的捐赠
    pub async fn record_donation(
        &self,
        user_id: &str,
        amount: f64,
        kind: DonationKind,
        transaction_id: Option<String>,
    ) -> Result<WriteOutcome<()>> {
        if amount <= 0.0 {
            return Err(TBreakSDKError::InvalidInput(format!(
                "捐赠金额必须为正数: {}",
                amount
            )));
        }
        if user_id.is_empty() {
            return Err(TBreakSDKError::InvalidInput("userId 不能为空".to_string()));
        }

        let record = DonationRecord {
            user_id: user_id.to_string(),
            amount,
            kind,
            transaction_id,
            timestamp: Utc::now().to_rfc3339(),
        };
        let payload = serde_json::to_value(&record)
            .map_err(|e| TBreakSDKError::Serialization(format!("序列化捐赠记录失败: {}", e)))?;
        let request =
            ApiRequest::new("/donations/record", HttpMethod::Post).with_body(payload.clone());

        let transport = Arc::clone(&self.transport);
        let remote = move || async move { transport.execute(&request).await.map(|_| ()) };
        let fallback = QueuedWrite::new("/donations/record", ChangeMethod::Post, payload);

        self.router.perform_write(remote, fallback).await
    }
}
