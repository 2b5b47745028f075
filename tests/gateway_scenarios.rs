// 端到端场景：认证、确认顺序、离线补发、群聊扇出、重试耗尽、幂等持久化、序列号顺序
mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use im_gateway_core::domain::model::{
    ChatMessage, DeliveryStatus, FrameStatus, MessageType, private_conversation_id,
};
use im_gateway_core::domain::repository::{MessageBroker, MessageRepository, OfflineStore};
use im_gateway_core::infrastructure::auth::IdentityClaims;
use im_gateway_core::{Adapters, BrokerAdapter, Gateway, ImError};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::json;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use common::{TestClient, eventually, start_gateway, test_config};

/// 始终失败的 MQ
#[derive(Default)]
struct DownBroker {
    attempts: AtomicU32,
}

#[async_trait]
impl MessageBroker for DownBroker {
    async fn publish(
        &self,
        topic: &str,
        _key: &str,
        _payload: &[u8],
    ) -> im_gateway_core::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(ImError::Broker(format!("{topic} unavailable")))
    }
}

/// 发送阻塞直到放行
#[derive(Default)]
struct GatedBroker {
    gate: Notify,
    published: AtomicU32,
}

#[async_trait]
impl MessageBroker for GatedBroker {
    async fn publish(
        &self,
        _topic: &str,
        _key: &str,
        _payload: &[u8],
    ) -> im_gateway_core::Result<()> {
        self.gate.notified().await;
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn gateway_with_broker(broker: Arc<dyn MessageBroker>) -> Result<Gateway> {
    let config = test_config();
    let mut adapters = Adapters::in_memory(&config)?;
    adapters.broker = BrokerAdapter::Producer(broker);
    Ok(Gateway::assemble(&config, adapters, CancellationToken::new()))
}

#[tokio::test]
async fn offline_message_is_replayed_once_after_login() -> Result<()> {
    let gateway = start_gateway(&test_config())?;
    let offline = gateway.adapters().offline.clone();

    let mut alice = TestClient::connect(&gateway);
    alice.login(1).await?;
    alice.send_chat(1001, 2, "are you there?").await?;

    let ack = alice.recv().await?;
    assert_eq!(ack.message_type, MessageType::ChatAck);
    assert_eq!(ack.status, FrameStatus::Delivered);
    assert_eq!(ack.message_id, 1001);

    eventually("message queued for bob", || {
        let offline = offline.clone();
        async move { offline.pending_count(2).await.unwrap_or(0) == 1 }
    })
    .await?;

    let mut bob = TestClient::connect(&gateway);
    let auth = bob.login(2).await?;
    assert_eq!(auth.status, FrameStatus::Success);

    let push = bob.recv().await?;
    assert_eq!(push.message_type, MessageType::ChatMessage);
    assert_eq!(push.message_id, 1001);
    let message: ChatMessage = push.decode_json()?;
    assert_eq!(message.sender_id, 1);
    assert_eq!(message.content, "are you there?");
    assert_eq!(message.sequence_number, Some(1));

    bob.expect_silence(Duration::from_millis(200)).await?;
    assert_eq!(offline.pending_count(2).await?, 0);

    gateway.stop().await;
    Ok(())
}

#[tokio::test]
async fn online_recipient_receives_message() -> Result<()> {
    let gateway = start_gateway(&test_config())?;
    let mut alice = TestClient::connect(&gateway);
    let mut bob = TestClient::connect(&gateway);
    alice.login(1).await?;
    bob.login(2).await?;

    alice.send_chat(2001, 2, "hi bob").await?;
    assert_eq!(alice.recv().await?.message_type, MessageType::ChatAck);

    // 本地直推和管线投递都可能到达，客户端按 messageId 去重
    let first = bob.recv().await?;
    assert_eq!(first.message_id, 2001);
    assert_eq!(first.message_type, MessageType::ChatMessage);

    let pipeline = gateway.pipeline.clone();
    eventually("delivery status reaches PUSHED", || {
        let pipeline = pipeline.clone();
        async move { pipeline.delivery_status(2001) == Some(DeliveryStatus::Pushed) }
    })
    .await?;

    // 客户端确认送达
    bob.send_json(MessageType::ChatAck, 2001, json!(null)).await?;
    eventually("delivery confirmed", || {
        let pipeline = pipeline.clone();
        async move { pipeline.delivery_status(2001) == Some(DeliveryStatus::Delivered) }
    })
    .await?;

    gateway.stop().await;
    Ok(())
}

#[tokio::test]
async fn group_message_fans_out_to_members_except_sender() -> Result<()> {
    let mut config = test_config();
    config
        .groups
        .static_members
        .insert("100".to_string(), vec![1, 2, 3]);
    let gateway = start_gateway(&config)?;

    let mut alice = TestClient::connect(&gateway);
    let mut bob = TestClient::connect(&gateway);
    alice.login(1).await?;
    bob.login(2).await?;

    alice
        .send_json(
            MessageType::GroupMessage,
            3001,
            json!({ "receiverId": 100, "contentType": 1, "content": "hello group" }),
        )
        .await?;

    assert_eq!(alice.recv().await?.message_type, MessageType::ChatAck);
    let push = bob.recv().await?;
    assert_eq!(push.message_type, MessageType::GroupMessage);
    let message: ChatMessage = push.decode_json()?;
    assert_eq!(message.conversation_id, "group_100");
    assert_eq!(message.receiver_id, 100);

    alice.expect_silence(Duration::from_millis(200)).await?;

    // 离线成员通过离线队列补发
    let mut carol = TestClient::connect(&gateway);
    carol.login(3).await?;
    let replayed = carol.recv().await?;
    assert_eq!(replayed.message_type, MessageType::GroupMessage);
    assert_eq!(replayed.message_id, 3001);

    gateway.stop().await;
    Ok(())
}

#[tokio::test]
async fn broker_outage_exhausts_retries_and_marks_failed() -> Result<()> {
    let broker = Arc::new(DownBroker::default());
    let mut config = test_config();
    config.delivery.retry_step_secs = 0;
    let mut adapters = Adapters::in_memory(&config)?;
    adapters.broker = BrokerAdapter::Producer(broker.clone());
    let gateway = Gateway::assemble(&config, adapters, CancellationToken::new());

    let mut alice = TestClient::connect(&gateway);
    alice.login(1).await?;
    alice.send_chat(4001, 2, "lost in transit").await?;

    // 发送方仍然立即收到服务端确认
    assert_eq!(alice.recv().await?.message_type, MessageType::ChatAck);
    gateway.executor.wait_idle().await;
    assert_eq!(broker.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(gateway.pipeline.delivery_status(4001), Some(DeliveryStatus::Sending));

    assert_eq!(gateway.pipeline.process_due_retries(Utc::now()).await, 1);
    assert_eq!(gateway.pipeline.process_due_retries(Utc::now()).await, 1);
    assert_eq!(broker.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(gateway.pipeline.delivery_status(4001), Some(DeliveryStatus::Failed));
    assert!(gateway.pipeline.retry_tracker().is_empty());

    // 终态后不再自动重试
    assert_eq!(gateway.pipeline.process_due_retries(Utc::now()).await, 0);
    assert_eq!(broker.attempts.load(Ordering::SeqCst), 3);

    gateway.stop().await;
    Ok(())
}

#[tokio::test]
async fn ack_is_sent_before_broker_hand_off_completes() -> Result<()> {
    let broker = Arc::new(GatedBroker::default());
    let gateway = gateway_with_broker(broker.clone())?;

    let mut alice = TestClient::connect(&gateway);
    alice.login(1).await?;
    alice.send_chat(5001, 2, "quick ack").await?;

    let ack = alice.recv().await?;
    assert_eq!(ack.message_type, MessageType::ChatAck);
    assert_eq!(broker.published.load(Ordering::SeqCst), 0);

    broker.gate.notify_one();
    gateway.executor.wait_idle().await;
    assert_eq!(broker.published.load(Ordering::SeqCst), 1);

    gateway.stop().await;
    Ok(())
}

#[tokio::test]
async fn failed_authentication_keeps_connection_unauthenticated() -> Result<()> {
    let mut config = test_config();
    config.auth.mode = im_gateway_core::config::AuthMode::Jwt;
    config.auth.jwt_secret = Some("integration-secret".to_string());
    let gateway = start_gateway(&config)?;

    let mut client = TestClient::connect(&gateway);
    client
        .send_json(MessageType::AuthRequest, 1, json!({ "token": "forged" }))
        .await?;
    let reply = client.recv().await?;
    assert_eq!(reply.message_type, MessageType::AuthResponse);
    assert_eq!(reply.status, FrameStatus::Fail);

    // 未认证连接上的聊天消息被静默丢弃
    client.send_chat(6001, 2, "sneaky").await?;
    client.expect_silence(Duration::from_millis(200)).await?;
    assert!(!gateway.registry.is_online_local(7));

    let claims = IdentityClaims {
        sub: "7".to_string(),
        exp: Utc::now().timestamp() + 3600,
        iss: None,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"integration-secret"),
    )?;
    client
        .send_json(MessageType::AuthRequest, 2, json!({ "token": token }))
        .await?;
    let reply = client.recv().await?;
    assert_eq!(reply.status, FrameStatus::Success);
    assert!(gateway.registry.is_online_local(7));

    gateway.stop().await;
    Ok(())
}

#[test]
fn jwt_mode_without_secret_refuses_to_start() {
    let mut config = test_config();
    config.auth.mode = im_gateway_core::config::AuthMode::Jwt;
    config.auth.jwt_secret = None;
    assert!(Adapters::in_memory(&config).is_err());

    config.auth.jwt_secret = Some(String::new());
    assert!(Adapters::in_memory(&config).is_err());
}

#[tokio::test]
async fn duplicate_message_id_is_persisted_once() -> Result<()> {
    let gateway = start_gateway(&test_config())?;
    let repository = gateway.adapters().repository.clone();

    let mut alice = TestClient::connect(&gateway);
    alice.login(1).await?;
    alice.send_chat(7001, 2, "once").await?;
    alice.send_chat(7001, 2, "once").await?;
    assert_eq!(alice.recv().await?.message_id, 7001);
    assert_eq!(alice.recv().await?.message_id, 7001);

    let conversation = private_conversation_id(1, 2);
    eventually("message persisted", || {
        let repository = repository.clone();
        async move { repository.find_message(7001).await.ok().flatten().is_some() }
    })
    .await?;
    gateway.executor.wait_idle().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stored = repository.list_recent(&conversation, 10).await?;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].sequence_number, Some(1));

    gateway.stop().await;
    Ok(())
}

#[tokio::test]
async fn concurrent_senders_get_strictly_increasing_sequences() -> Result<()> {
    let gateway = start_gateway(&test_config())?;
    let repository = gateway.adapters().repository.clone();

    let mut alice = TestClient::connect(&gateway);
    let mut bob = TestClient::connect(&gateway);
    alice.login(1).await?;
    bob.login(2).await?;

    for i in 0..10 {
        alice.send_chat(8000 + i, 2, "from alice").await?;
        bob.send_chat(9000 + i, 1, "from bob").await?;
    }

    let conversation = private_conversation_id(1, 2);
    eventually("all twenty messages persisted", || {
        let repository = repository.clone();
        let conversation = conversation.clone();
        async move {
            repository
                .list_recent(&conversation, 100)
                .await
                .is_ok_and(|messages| messages.len() == 20)
        }
    })
    .await?;

    let sequences: Vec<i64> = repository
        .list_recent(&conversation, 100)
        .await?
        .iter()
        .filter_map(|message| message.sequence_number)
        .collect();
    assert_eq!(sequences, (1..=20).collect::<Vec<_>>());

    let latest: Vec<i64> = gateway
        .sequencer
        .latest(&conversation, 5)
        .await?
        .iter()
        .filter_map(|message| message.sequence_number)
        .collect();
    assert_eq!(latest.len(), 5);
    assert!(latest.windows(2).all(|pair| pair[0] < pair[1]));

    gateway.stop().await;
    Ok(())
}
