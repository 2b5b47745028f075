pub mod frame;
pub mod message;
pub mod retry;
pub mod session;

pub use frame::*;
pub use message::*;
pub use retry::*;
pub use session::*;
