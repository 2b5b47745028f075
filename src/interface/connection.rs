//! 单连接读写循环
//!
//! 一个任务同时负责：解码入站帧并分发、写出下行队列、空闲检测与心跳判定。
//! 连接的任何传输错误都在这里结束（记录日志并关闭），不会向上传播。

use std::future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::idle::IdleTimer;
use crate::application::{ConnectionContext, MessageDispatcher};
use crate::config::HeartbeatConfig;
use crate::domain::model::{ConnectionHandle, Frame, MessageType, next_connection_id};
use crate::domain::service::{HeartbeatMonitor, IdleAction};
use crate::infrastructure::{FrameCodec, Inbound};
use crate::metrics::GatewayMetrics;

pub struct ConnectionHandler {
    dispatcher: Arc<MessageDispatcher>,
    heartbeat: HeartbeatConfig,
    max_frame_length: usize,
    outbound_buffer: usize,
    metrics: Arc<GatewayMetrics>,
}

impl ConnectionHandler {
    pub fn new(
        dispatcher: Arc<MessageDispatcher>,
        heartbeat: HeartbeatConfig,
        max_frame_length: usize,
        outbound_buffer: usize,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            dispatcher,
            heartbeat,
            max_frame_length,
            outbound_buffer: outbound_buffer.max(1),
            metrics,
        }
    }

    /// 处理一个连接直到对端断开、心跳超时、被顶替关闭或停机
    pub async fn serve<S>(
        &self,
        stream: S,
        remote_addr: Option<SocketAddr>,
        shutdown: CancellationToken,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(self.outbound_buffer);
        let close = shutdown.child_token();
        let handle =
            ConnectionHandle::new(next_connection_id(), remote_addr, outbound_tx, close.clone());
        let connection_id = handle.id();
        let mut ctx = ConnectionContext::new(handle);

        let mut framed = Framed::new(stream, FrameCodec::new(self.max_frame_length));
        let mut monitor = HeartbeatMonitor::new(
            self.heartbeat.max_idle_strikes,
            self.heartbeat.reset_on_any_frame,
        );
        let mut idle = IdleTimer::from_config(&self.heartbeat, Instant::now());

        self.metrics.connections_active.inc();
        debug!(connection_id, ?remote_addr, "connection opened");

        let reason = loop {
            let deadline = idle.next_deadline();
            tokio::select! {
                biased;

                _ = close.cancelled() => break "closed",

                inbound = framed.next() => match inbound {
                    Some(Ok(inbound)) => {
                        idle.on_read(Instant::now());
                        match &inbound {
                            Inbound::Frame(frame)
                                if frame.message_type == MessageType::HeartbeatRequest =>
                            {
                                monitor.on_heartbeat()
                            }
                            _ => monitor.on_frame(),
                        }
                        self.dispatcher.dispatch(&mut ctx, inbound).await;
                    }
                    Some(Err(err)) => {
                        warn!(connection_id, error = %err, "protocol error, closing connection");
                        break "protocol_error";
                    }
                    None => break "peer_closed",
                },

                Some(frame) = outbound_rx.recv() => {
                    if let Err(err) = write_batch(&mut framed, &mut outbound_rx, frame).await {
                        warn!(connection_id, error = %err, "write failed, closing connection");
                        break "write_error";
                    }
                    idle.on_write(Instant::now());
                }

                _ = sleep_until(deadline) => {
                    let mut timed_out = false;
                    for kind in idle.fire(Instant::now()) {
                        if monitor.on_idle(kind) == IdleAction::Close {
                            timed_out = true;
                        }
                    }
                    if timed_out {
                        self.metrics.heartbeat_timeout_total.inc();
                        info!(
                            connection_id,
                            user_id = ?ctx.user_id,
                            strikes = monitor.strikes(),
                            "heartbeat timeout, closing connection"
                        );
                        break "heartbeat_timeout";
                    }
                }
            }
        };

        // 已排队的下行帧尽量写出（例如认证失败响应）
        if reason != "write_error" && reason != "protocol_error" {
            if let Err(err) = flush_pending(&mut framed, &mut outbound_rx).await {
                debug!(connection_id, error = %err, "failed to flush pending frames");
            }
        }
        let _ = SinkExt::<Frame>::close(&mut framed).await;

        close.cancel();
        let unbound = self.dispatcher.registry().unbind(connection_id);
        self.metrics.connections_active.dec();
        info!(connection_id, user_id = ?unbound, reason, "connection closed");
    }
}

/// 写出一帧以及队列中已就绪的后续帧，最后统一 flush
async fn write_batch<S>(
    framed: &mut Framed<S, FrameCodec>,
    outbound_rx: &mut mpsc::Receiver<Frame>,
    first: Frame,
) -> crate::error::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.feed(first).await?;
    flush_pending(framed, outbound_rx).await
}

async fn flush_pending<S>(
    framed: &mut Framed<S, FrameCodec>,
    outbound_rx: &mut mpsc::Receiver<Frame>,
) -> crate::error::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Ok(frame) = outbound_rx.try_recv() {
        framed.feed(frame).await?;
    }
    SinkExt::<Frame>::flush(framed).await?;
    Ok(())
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
