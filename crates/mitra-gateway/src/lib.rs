//! Realtime side of the service: room broker, socket connection loop, and
//! the chat/attendance actions shared with the REST handlers.

pub mod actions;
pub mod connection;
pub mod dispatcher;
pub mod error;

pub use actions::{Actions, Caller};
pub use connection::Heartbeat;
pub use dispatcher::{ConnId, Dispatcher, RoomKey};
pub use error::ActionError;
