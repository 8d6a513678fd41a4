//! Reader-side client for a chat relay: the connection state machine, its
//! transports, and the local message history.

pub mod connection;
pub mod error;
pub mod event_source;
pub mod history;
pub mod href;
pub mod http_poll;
pub mod transport;

pub use connection::{ClientConnection, ConnectStatus, ConnectionConfig, ConnectionGuard};
pub use error::Error;
pub use history::MessageHistory;
