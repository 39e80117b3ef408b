//! 远端传输层 - API 请求的统一出口
//!
//! [`RemoteTransport`] 是唯一的远端调用缝：写入路由、同步引擎和各
//! 业务管理器都通过它发请求，测试时换成内存 Mock 即可完全脱网。
//!
//! 约定：2xx 才返回 `Ok`；非 2xx 一律映射为 [`TBreakSDKError::Rejected`]，
//! 调用方按状态码决定重试还是放弃。

use crate::error::{Result, TBreakSDKError};
use crate::sdk::HttpClientConfig;
use crate::storage::{ChangeMethod, PendingChange};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP 方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpMethod::Get => write!(f, "GET"),
            HttpMethod::Post => write!(f, "POST"),
            HttpMethod::Put => write!(f, "PUT"),
            HttpMethod::Delete => write!(f, "DELETE"),
        }
    }
}

impl From<ChangeMethod> for HttpMethod {
    fn from(method: ChangeMethod) -> Self {
        match method {
            ChangeMethod::Post => HttpMethod::Post,
            ChangeMethod::Put => HttpMethod::Put,
            ChangeMethod::Delete => HttpMethod::Delete,
        }
    }
}

/// API 请求
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    /// 以 `/` 开头的相对路径，可带查询串
    pub endpoint: String,
    pub method: HttpMethod,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(endpoint: impl Into<String>, method: HttpMethod) -> Self {
        Self {
            endpoint: endpoint.into(),
            method,
            body: None,
        }
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

impl From<&PendingChange> for ApiRequest {
    fn from(change: &PendingChange) -> Self {
        let method = HttpMethod::from(change.method);
        // DELETE 不带请求体，入队时存的 data 只是留档
        let body = match method {
            HttpMethod::Delete => None,
            _ => Some(change.data.clone()),
        };
        Self {
            endpoint: change.endpoint.clone(),
            method,
            body,
        }
    }
}

/// API 响应（只承载 2xx；非 2xx 走错误通道）
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// 远端传输
#[async_trait]
pub trait RemoteTransport: Send + Sync + std::fmt::Debug {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse>;
}

/// 基于 reqwest 的 HTTP 传输
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
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
            .map_err(|e| TBreakSDKError::Config(format!("构建 HTTP 客户端失败: {}", e)))?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let url = format!("{}{}", self.base_url, request.endpoint);
        debug!("📤 {} {}", request.method, url);

        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Post => self.client.post(&url),
            HttpMethod::Put => self.client.put(&url),
            HttpMethod::Delete => self.client.delete(&url),
        };
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let text = response.text().await.map_err(map_reqwest_error)?;

        if !status.is_success() {
            warn!("❌ 远端拒绝: {} {} -> {}", request.method, url, status);
            return Err(TBreakSDKError::Rejected {
                status: status.as_u16(),
                message: text,
            });
        }

        let body = if text.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
        };
        Ok(ApiResponse {
            status: status.as_u16(),
            body,
        })
    }
}

/// reqwest 错误归类：超时、连接失败与其他传输错误分开
pub(crate) fn map_reqwest_error(error: reqwest::Error) -> TBreakSDKError {
    if error.is_timeout() {
        TBreakSDKError::Timeout(format!("请求超时: {}", error))
    } else if error.is_connect() {
        TBreakSDKError::Transport(format!("连接失败: {}", error))
    } else {
        TBreakSDKError::Transport(format!("网络请求失败: {}", error))
    }
}

#[cfg(test)]
pub mod test_helpers {
    use super::*;
    use serde_json::json;
    use std::collections::{HashMap, HashSet};

    /// 内存传输：记录每个请求，可按 endpoint 配置响应、拒绝或断连
    #[derive(Debug, Default)]
    pub struct MockTransport {
        recorded: parking_lot::Mutex<Vec<ApiRequest>>,
        responses: parking_lot::Mutex<HashMap<String, serde_json::Value>>,
        rejections: parking_lot::Mutex<HashMap<String, u16>>,
        unreachable_endpoints: parking_lot::Mutex<HashSet<String>>,
        offline: parking_lot::Mutex<bool>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// 该 endpoint 返回 200 与指定响应体
        pub fn set_response(&self, endpoint: &str, body: serde_json::Value) {
            self.responses.lock().insert(endpoint.to_string(), body);
        }

        /// 该 endpoint 的请求返回指定状态码的 Rejected
        pub fn reject_endpoint(&self, endpoint: &str, status: u16) {
            self.rejections.lock().insert(endpoint.to_string(), status);
        }

        /// 该 endpoint 的请求返回连接失败
        pub fn cut_endpoint(&self, endpoint: &str) {
            self.unreachable_endpoints
                .lock()
                .insert(endpoint.to_string());
        }

        /// 全局断网
        pub fn set_offline(&self, offline: bool) {
            *self.offline.lock() = offline;
        }

        /// 已记录的请求快照
        pub fn recorded(&self) -> Vec<ApiRequest> {
            self.recorded.lock().clone()
        }

        pub fn call_count(&self) -> usize {
            self.recorded.lock().len()
        }
    }

    #[async_trait]
    impl RemoteTransport for MockTransport {
        async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse> {
            self.recorded.lock().push(request.clone());

            if *self.offline.lock() {
                return Err(TBreakSDKError::Transport(
                    "连接失败: connection refused".to_string(),
                ));
            }
            if self.unreachable_endpoints.lock().contains(&request.endpoint) {
                return Err(TBreakSDKError::Transport(
                    "连接失败: connection refused".to_string(),
                ));
            }
            if let Some(status) = self.rejections.lock().get(&request.endpoint) {
                return Err(TBreakSDKError::Rejected {
                    status: *status,
                    message: "mock rejection".to_string(),
                });
            }
            if let Some(body) = self.responses.lock().get(&request.endpoint) {
                return Ok(ApiResponse {
                    status: 200,
                    body: body.clone(),
                });
            }
            Ok(ApiResponse {
                status: 200,
                body: json!({ "ok": true }),
            })
        }
    }
}
