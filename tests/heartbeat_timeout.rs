// 心跳超时：使用暂停的 tokio 时钟，空闲计时自动推进
mod common;

use std::time::Duration;

use anyhow::Result;
use im_gateway_core::domain::model::MessageType;
use serde_json::json;

use common::{TestClient, eventually, start_gateway, test_config};

#[tokio::test(start_paused = true)]
async fn silent_connection_is_closed_after_three_reader_idle_periods() -> Result<()> {
    let config = test_config();
    let gateway = start_gateway(&config)?;

    let mut client = TestClient::connect(&gateway);
    client.login(42).await?;
    assert!(gateway.registry.is_online_local(42));

    // 两个读空闲周期后连接仍然存活
    assert!(!client.closed_within(Duration::from_secs(125)).await);

    // 第三个周期到期后关闭
    assert!(client.closed_within(Duration::from_secs(60)).await);
    let registry = gateway.registry.clone();
    eventually("session unbound", || {
        let registry = registry.clone();
        async move { !registry.is_online_local(42) }
    })
    .await?;
    assert_eq!(gateway.metrics.heartbeat_timeout_total.get(), 1);

    gateway.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn heartbeats_keep_connection_alive() -> Result<()> {
    let gateway = start_gateway(&test_config())?;

    let mut client = TestClient::connect(&gateway);
    client.login(43).await?;
    let bound_at = gateway.registry.last_heartbeat(43);

    for id in 1..=6 {
        tokio::time::sleep(Duration::from_secs(50)).await;
        client
            .send_json(MessageType::HeartbeatRequest, id, json!(null))
            .await?;
        let pong = client.recv().await?;
        assert_eq!(pong.message_type, MessageType::HeartbeatResponse);
        assert_eq!(pong.message_id, id);
    }

    // 300 秒过去，远超过三个读空闲周期
    assert!(gateway.registry.is_online_local(43));
    assert!(gateway.registry.last_heartbeat(43) >= bound_at);
    assert_eq!(gateway.metrics.heartbeat_timeout_total.get(), 0);

    gateway.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn chat_frames_do_not_reset_strikes_by_default() -> Result<()> {
    let gateway = start_gateway(&test_config())?;

    let mut client = TestClient::connect(&gateway);
    client.login(44).await?;

    // 每 70 秒发一条聊天消息：读计时被重置前已经累计一次空闲
    for id in 1..=3 {
        tokio::time::sleep(Duration::from_secs(70)).await;
        if client.send_chat(100 + id, 45, "still here").await.is_err() {
            break;
        }
    }

    assert!(client.closed_within(Duration::from_secs(120)).await);
    gateway.stop().await;
    Ok(())
}
