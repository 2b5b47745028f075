//! IM 实时投递核心
//!
//! 自定义二进制协议的长连接网关：连接认证、私聊与群聊路由、基于 MQ 的至少一次投递、
//! 离线消息缓存与补发、心跳检测。

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod interface;
pub mod metrics;
pub mod service;
pub mod tracing;
pub mod utils;

pub use config::{ConfigManager, GatewayConfig, app_config, load_config, parse_config};
pub use error::{ImError, Result};
pub use service::{Adapters, ApplicationBootstrap, BrokerAdapter, Gateway};
