//! 接入层：TCP 监听与单连接读写循环

pub mod connection;
pub mod idle;
pub mod server;

pub use connection::ConnectionHandler;
pub use idle::IdleTimer;
pub use server::GatewayServer;
