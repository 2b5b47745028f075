//! TCP 监听

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::connection::ConnectionHandler;
use crate::error::Result;

pub struct GatewayServer {
    listener: TcpListener,
    handler: Arc<ConnectionHandler>,
    connections: TaskTracker,
}

impl GatewayServer {
    pub async fn bind(addr: &str, handler: Arc<ConnectionHandler>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            handler,
            connections: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 接受连接直到停机，随后等待所有连接任务结束
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(%local_addr, "gateway listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        if let Err(err) = stream.set_nodelay(true) {
                            debug!(%remote_addr, error = %err, "failed to set TCP_NODELAY");
                        }
                        let handler = Arc::clone(&self.handler);
                        let shutdown = shutdown.clone();
                        self.connections.spawn(async move {
                            handler.serve(stream, Some(remote_addr), shutdown).await;
                        });
                    }
                    Err(err) => {
                        // 多为文件描述符耗尽，稍后重试
                        warn!(error = %err, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        self.connections.close();
        info!(open = self.connections.len(), "listener stopped, draining connections");
        self.connections.wait().await;
        info!("all connections closed");
        Ok(())
    }
}
