//! 服务装配与启动

pub mod bootstrap;

pub use bootstrap::{Adapters, ApplicationBootstrap, BrokerAdapter, Gateway};
