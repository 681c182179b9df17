//! Connector management
//!
//! This module handles:
//! * Transport abstraction (TCP with optional TLS vs Unix socket)
//! * Connector lifecycle (open, user actions, reset, break, close)
//! * The message read loop with cancellation escalation
//! * Keepalive and multiplexing background tasks

mod cancel;
mod conn;
mod io;
mod keepalive;
mod multiplex;
mod settings;
mod state;
mod tls;
mod transport;
mod url;
mod user_action;

pub use cancel::send_cancel_request;
pub use conn::{BackendKey, Connector, SimpleQueryMessage};
pub use io::{ReadOptions, RowMode};
pub use multiplex::MultiplexedResponse;
pub use settings::{
    NoticeHandler, NotificationHandler, PasswordProvider, Settings, SettingsBuilder,
    DEFAULT_BUFFER_SIZE, DEFAULT_PORT,
};
pub use state::ConnectorState;
pub use tls::SslMode;
pub use transport::Stream;
pub use user_action::{ActionOptions, UserAction};

pub(crate) use conn::ConnectorCore;
pub(crate) use io::{ReadSide, WriteSide};
