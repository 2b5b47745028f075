//! 基础设施层：线路编解码、会话注册表、消息队列与存储适配器、外部协作方客户端

pub mod auth;
pub mod broker;
pub mod codec;
pub mod group_directory;
pub mod persistence;
pub mod session_registry;

pub use auth::{JwtIdentityValidator, TrustedIdentityValidator};
pub use broker::{InMemoryBroker, KafkaMessageBroker, KafkaRecordConsumer};
pub use codec::{CodecError, FrameCodec, Inbound};
pub use group_directory::{HttpGroupDirectory, StaticGroupDirectory};
pub use session_registry::SessionRegistry;
