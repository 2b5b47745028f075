//! 领域层：帧、消息、会话、重试票据模型，心跳状态机，以及协作方接口

pub mod model;
pub mod repository;
pub mod service;

pub use model::*;
pub use repository::*;
pub use service::*;
