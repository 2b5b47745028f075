// 集成测试公共工具：内存适配器装配网关，通过 tokio::io::duplex 驱动真实的连接循环
#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use anyhow::{Result, anyhow};
use futures::{SinkExt, StreamExt};
use im_gateway_core::domain::model::{Frame, FrameStatus, MessageType};
use im_gateway_core::infrastructure::codec::{DEFAULT_MAX_FRAME_LENGTH, FrameCodec, Inbound};
use im_gateway_core::{Adapters, Gateway, GatewayConfig};
use serde_json::{Value, json};
use tokio::io::DuplexStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

pub fn test_config() -> GatewayConfig {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut config = GatewayConfig::default();
    config.server.node_id = "node-test".to_string();
    config.delivery.retry_scan_interval_ms = 50;
    config
}

/// 内存适配器 + 后台任务已启动
pub fn start_gateway(config: &GatewayConfig) -> Result<Gateway> {
    let adapters = Adapters::in_memory(config)?;
    let gateway = Gateway::assemble(config, adapters, CancellationToken::new());
    gateway.start_background()?;
    Ok(gateway)
}

pub struct TestClient {
    framed: Framed<DuplexStream, FrameCodec>,
}

impl TestClient {
    pub fn connect(gateway: &Gateway) -> Self {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let handler = gateway.connections.clone();
        let shutdown = gateway.shutdown.clone();
        tokio::spawn(async move { handler.serve(server, None, shutdown).await });
        Self {
            framed: Framed::new(client, FrameCodec::new(DEFAULT_MAX_FRAME_LENGTH)),
        }
    }

    pub async fn send(&mut self, frame: Frame) -> Result<()> {
        self.framed.send(frame).await?;
        Ok(())
    }

    pub async fn send_json(
        &mut self,
        message_type: MessageType,
        id: i64,
        body: Value,
    ) -> Result<()> {
        let frame = Frame::json(message_type, id, FrameStatus::Success, &body)?;
        self.send(frame).await
    }

    /// 下一个帧；超时或连接关闭时报错
    pub async fn recv(&mut self) -> Result<Frame> {
        match tokio::time::timeout(RECV_TIMEOUT, self.framed.next()).await {
            Ok(Some(Ok(Inbound::Frame(frame)))) => Ok(frame),
            Ok(Some(Ok(other))) => Err(anyhow!("unexpected inbound {other:?}")),
            Ok(Some(Err(err))) => Err(err.into()),
            Ok(None) => Err(anyhow!("connection closed")),
            Err(_) => Err(anyhow!("timed out waiting for a frame")),
        }
    }

    /// 在给定时间内没有任何帧到达
    pub async fn expect_silence(&mut self, wait: Duration) -> Result<()> {
        match tokio::time::timeout(wait, self.framed.next()).await {
            Err(_) => Ok(()),
            Ok(Some(Ok(inbound))) => Err(anyhow!("unexpected frame {inbound:?}")),
            Ok(other) => Err(anyhow!("connection ended: {other:?}")),
        }
    }

    /// 等待服务端关闭连接
    pub async fn closed_within(&mut self, wait: Duration) -> bool {
        loop {
            match tokio::time::timeout(wait, self.framed.next()).await {
                Ok(None) | Ok(Some(Err(_))) => return true,
                Ok(Some(Ok(_))) => continue,
                Err(_) => return false,
            }
        }
    }

    pub async fn login(&mut self, user_id: i64) -> Result<Frame> {
        self.send_json(MessageType::AuthRequest, 1, json!({ "userId": user_id }))
            .await?;
        let reply = self.recv().await?;
        anyhow::ensure!(
            reply.message_type == MessageType::AuthResponse,
            "expected AUTH_RESPONSE, got {}",
            reply.message_type
        );
        Ok(reply)
    }

    pub async fn send_chat(&mut self, id: i64, receiver_id: i64, content: &str) -> Result<()> {
        self.send_json(
            MessageType::ChatMessage,
            id,
            json!({ "receiverId": receiver_id, "contentType": 1, "content": content }),
        )
        .await
    }
}

/// 轮询直到条件成立
pub async fn eventually<F, Fut>(what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Err(anyhow!("condition not met in time: {what}"))
}
