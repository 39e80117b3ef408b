//! 社区聊天 - 打卡社区消息的发送与拉取
//!
//! 发送前在本地补齐消息ID与时间戳（离线入队的载荷必须完整，
//! 重放时不再做任何解析），拉取是纯网络操作，不做本地缓存。

use crate::error::{Result, TBreakSDKError};
use crate::router::{QueuedWrite, WriteOutcome, WriteRouter};
use crate::storage::ChangeMethod;
use crate::transport::{ApiRequest, HttpMethod, RemoteTransport};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// 待发送的消息草稿
#[derive(Debug, Clone)]
pub struct ChatMessageDraft {
    pub user_id: String,
    pub avatar_type: String,
    pub message: String,
    pub streak_days: u32,
    pub relapse: bool,
    pub medals: Vec<String>,
    pub coins: u32,
}

/// 一条社区消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub user_id: String,
    pub avatar_type: String,
    pub message: String,
    /// 发送毫秒时间戳
    pub created_at: i64,
    pub streak_days: u32,
    pub relapse: bool,
    pub medals: Vec<String>,
    pub coins: u32,
}

/// 社区聊天管理器
#[derive(Debug)]
pub struct ChatManager {
    router: Arc<WriteRouter>,
    transport: Arc<dyn RemoteTransport>,
}

impl ChatManager {
    pub fn new(router: Arc<WriteRouter>, transport: Arc<dyn RemoteTransport>) -> Self {
        Self { router, transport }
    }

    /// 发送一条社区消息
    ///
    /// 消息ID与时间戳在发送端解析，离线入队的就是最终载荷。
    pub async fn send_message(&self, draft: &ChatMessageDraft) -> Result<WriteOutcome<ChatMessage>> {
        if draft.message.trim().is_empty() {
            return Err(TBreakSDKError::InvalidInput("消息内容不能为空".to_string()));
        }
        if draft.user_id.is_empty() {
            return Err(TBreakSDKError::InvalidInput("userId 不能为空".to_string()));
        }

        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            user_id: draft.user_id.clone(),
            avatar_type: draft.avatar_type.clone(),
            message: draft.message.clone(),
            created_at: Utc::now().timestamp_millis(),
            streak_days: draft.streak_days,
            relapse: draft.relapse,
            medals: draft.medals.clone(),
            coins: draft.coins,
        };
        let payload = serde_json::to_value(&message)
            .map_err(|e| TBreakSDKError::Serialization(format!("序列化社区消息失败: {}", e)))?;
        let request = ApiRequest::new("/chatMessages", HttpMethod::Post).with_body(payload.clone());

        let transport = Arc::clone(&self.transport);
        let remote = move || async move { transport.execute(&request).await.map(|_| ()) };
        let fallback = QueuedWrite::new("/chatMessages", ChangeMethod::Post, payload);

        let outcome = self.router.perform_write(remote, fallback).await?;
        Ok(match outcome {
            WriteOutcome::Completed(()) => WriteOutcome::Completed(message),
            WriteOutcome::Queued { change_id } => {
                debug!("消息已入队等待同步: {} -> {}", message.id, change_id);
                WriteOutcome::Queued { change_id }
            }
        })
    }

    /// 拉取最近的社区消息
    pub async fn recent_messages(&self, limit: usize) -> Result<Vec<ChatMessage>> {
        let request = ApiRequest::new(format!("/chatMessages?limit={}", limit), HttpMethod::Get);
        let response = self.transport.execute(&request).await?;
        if response.body.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(response.body)
            .map_err(|e| TBreakSDKError::Serialization(format!("解析社区消息列表失败: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventManager;
    use crate::network::test_helpers::ManualNetworkStatusListener;
    use crate::network::{NetworkMonitor, NetworkStatus, NetworkStatusListener};
    use crate::storage::OfflineStore;
    use crate::sync::background::test_helpers::RecordingCapability;
    use crate::sync::background::BackgroundSync;
    use crate::sync::engine::SyncEngine;
    use crate::sync::retry::RetryPolicy;
    use crate::transport::test_helpers::MockTransport;
    use serde_json::json;
    use tempfile::TempDir;

    struct Rig {
        _temp: TempDir,
        store: Arc<OfflineStore>,
        transport: Arc<MockTransport>,
        chat: ChatManager,
    }

    async fn build_rig(initial: NetworkStatus) -> Rig {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(OfflineStore::open(temp.path().join("store")).await.unwrap());
        let events = Arc::new(EventManager::new(64));
        let transport = Arc::new(MockTransport::new());
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&store),
            Arc::clone(&transport) as Arc<dyn RemoteTransport>,
            Arc::clone(&events),
            RetryPolicy::default(),
        ));
        let background_sync = Arc::new(BackgroundSync::new(
            Arc::new(RecordingCapability::new()) as _,
            engine,
            RetryPolicy::default(),
        ));
        let listener = Arc::new(ManualNetworkStatusListener::new(initial));
        let monitor = Arc::new(NetworkMonitor::new(
            listener as Arc<dyn NetworkStatusListener>,
            Arc::clone(&store),
            background_sync,
            Arc::clone(&events),
        ));
        monitor.start().await.unwrap();
        let router = Arc::new(WriteRouter::new(
            Arc::clone(&store),
            monitor,
            Arc::clone(&events),
        ));
        let chat = ChatManager::new(router, Arc::clone(&transport) as Arc<dyn RemoteTransport>);
        Rig {
            _temp: temp,
            store,
            transport,
            chat,
        }
    }

    fn sample_draft() -> ChatMessageDraft {
        ChatMessageDraft {
            user_id: "u1".to_string(),
            avatar_type: "panda".to_string(),
            message: "第五天，大家加油！".to_string(),
            streak_days: 5,
            relapse: false,
            medals: vec!["week-one".to_string()],
            coins: 120,
        }
    }

    #[tokio::test]
    async fn test_offline_send_queues_fully_resolved_payload() {
        let rig = build_rig(NetworkStatus::Offline).await;

        let outcome = rig.chat.send_message(&sample_draft()).await.unwrap();
        assert!(outcome.is_queued());
        assert_eq!(rig.transport.call_count(), 0);

        let pending = rig.store.pending_changes().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].endpoint, "/chatMessages");
        assert_eq!(pending[0].method, ChangeMethod::Post);
        // 入队载荷已补齐ID与时间戳
        assert_eq!(pending[0].data["id"].as_str().unwrap().len(), 36);
        assert!(pending[0].data["createdAt"].as_i64().unwrap() > 0);
        assert_eq!(pending[0].data["message"], "第五天，大家加油！");
        assert_eq!(pending[0].data["streakDays"], 5);
        assert_eq!(pending[0].data["avatarType"], "panda");
    }

    #[tokio::test]
    async fn test_online_send_returns_resolved_message() {
        let rig = build_rig(NetworkStatus::Online).await;

        let outcome = rig.chat.send_message(&sample_draft()).await.unwrap();
        let message = match outcome {
            WriteOutcome::Completed(message) => message,
            other => panic!("意外结果: {:?}", other),
        };
        assert_eq!(message.id.len(), 36);
        assert!(message.created_at > 0);

        let recorded = rig.transport.recorded();
        assert_eq!(recorded.len(), 1);
        assert_eq!(
            recorded[0].body,
            Some(serde_json::to_value(&message).unwrap())
        );
    }

    #[tokio::test]
    async fn test_blank_message_is_rejected() {
        let rig = build_rig(NetworkStatus::Online).await;
        let draft = ChatMessageDraft {
            message: "   ".to_string(),
            ..sample_draft()
        };
        let error = rig.chat.send_message(&draft).await.unwrap_err();
        assert!(matches!(error, TBreakSDKError::InvalidInput(_)));
        assert_eq!(rig.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_recent_messages_parses_list() {
        let rig = build_rig(NetworkStatus::Online).await;
        rig.transport.set_response(
            "/chatMessages?limit=20",
            json!([{
                "id": "m1",
                "userId": "u2",
                "avatarType": "fox",
                "message": "第十天打卡",
                "createdAt": 1736072400000i64,
                "streakDays": 10,
                "relapse": false,
                "medals": [],
                "coins": 300
            }]),
        );

        let messages = rig.chat.recent_messages(20).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].user_id, "u2");
        assert_eq!(messages[0].streak_days, 10);
    }
}
