//! Postgres wire-protocol connector
//!
//! One [`Connector`] is one physical session to a server. It owns the
//! framed transport, authenticates during [`Connector::open`], and then
//! serves *user actions*: exclusive, cancellable uses of the wire that read
//! messages through a single demultiplexing loop. Out-of-band traffic
//! (notices, notifications, parameter changes) is dispatched as it arrives,
//! server errors surface once the server is back in sync, and any transport
//! or protocol failure breaks the connector for good.
//!
//! ```ignore
//! use fraiseql_connector::{Connector, Settings, SimpleQueryMessage};
//!
//! let settings = Settings::builder()
//!     .host("localhost")
//!     .user("app")
//!     .password("secret")
//!     .build()?;
//! let connector = Connector::open(settings).await?;
//! for msg in connector.simple_query("SELECT 1").await? {
//!     if let SimpleQueryMessage::Row(fields) = msg {
//!         println!("{:?}", fields);
//!     }
//! }
//! connector.close().await?;
//! ```
//!
//! Cancellation is two-tiered: a triggered token or an elapsed command
//! timeout first sends a CancelRequest over a separate connection and keeps
//! reading for `cancellation_timeout`; if the server does not respond in
//! time the connector is broken.

#![warn(missing_docs)]

pub mod auth;
pub mod blocking;
pub mod buffer;
pub mod cluster;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod protocol;

pub use cluster::{
    ClusterState, ClusterStateCache, ConnectorContext, ConnectorId, ConnectorSource,
    DatabaseInfo, DatabaseInfoCache, DatabaseKey,
};
pub use connection::{
    ActionOptions, BackendKey, ConnectorState, Connector, MultiplexedResponse, ReadOptions,
    RowMode, Settings, SettingsBuilder, SimpleQueryMessage, SslMode, UserAction,
};
pub use error::{BoxError, Error, Result, ServerError};
