mod handler;
mod keepalive;
mod message;

pub use handler::{ws_handler, ConnectionExit};
pub use keepalive::{KeepAlive, PingTracker};
pub use message::RelayMessage;
