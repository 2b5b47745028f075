//! IM 网关
//!
//! 用法：`im-gateway [--config <path>]`
//!
//! 配置路径也可以通过 `IM_GATEWAY_CONFIG` 指定；节点 ID、监听地址、Redis / Postgres / Kafka
//! 地址可以用环境变量覆盖（见 `ConfigManager`）。

use anyhow::{Result, bail};
use im_gateway_core::tracing::init_tracing_from_config;
use im_gateway_core::{ApplicationBootstrap, load_config};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

fn config_path() -> Result<Option<String>> {
    let mut args = std::env::args().skip(1);
    let mut path = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => match args.next() {
                Some(value) => path = Some(value),
                None => bail!("--config requires a path"),
            },
            other => {
                if let Some(value) = other.strip_prefix("--config=") {
                    path = Some(value.to_string());
                } else {
                    bail!("unknown argument: {other}");
                }
            }
        }
    }
    Ok(path)
}

#[tokio::main]
async fn main() -> Result<()> {
    let path = config_path()?;
    let config = load_config(path.as_deref());
    init_tracing_from_config(Some(&config.logging));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("正在停止服务器...");
                signal.cancel();
            }
            Err(err) => error!(error = %err, "failed to listen for shutdown signal"),
        }
    });

    ApplicationBootstrap::run(config, shutdown).await?;
    info!("✅ 服务器已停止");
    Ok(())
}
