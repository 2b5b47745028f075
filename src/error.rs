//! IM 网关统一错误模块
//!
//! - 库内部统一使用 [`ImError`]，按协议、认证、投递、存储等类别区分
//! - 基础设施错误（Redis / Postgres / Kafka / IO）通过 `From` 自动转换

use thiserror::Error;

use crate::infrastructure::codec::CodecError;

/// 网关错误类型
#[derive(Debug, Error)]
pub enum ImError {
    /// 配置错误
    #[error("configuration error: {0}")]
    Config(String),

    /// 协议错误（帧格式非法，连接级致命）
    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),

    /// 认证失败
    #[error("authentication failed: {0}")]
    Auth(String),

    /// 消息队列不可用 / 投递失败
    #[error("broker error: {0}")]
    Broker(String),

    /// 存储错误
    #[error("storage error: {0}")]
    Storage(String),

    /// 在线状态存储错误
    #[error("presence error: {0}")]
    Presence(String),

    /// 外部服务调用失败（群成员查询等）
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ImError {
    /// 该错误是否应当关闭当前连接
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, ImError::Protocol(_) | ImError::Io(_))
    }
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, ImError>;
