//! Error types

use crate::protocol::ErrorFields;
use std::io;
use std::sync::Arc;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error returned by user-supplied callbacks
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Connector error
///
/// Errors are `Clone` so the first fatal error can be stored as the sticky
/// break reason and handed to every later caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Socket or stream I/O failure
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Peer closed the connection
    #[error("connection closed by server")]
    ConnectionClosed,

    /// TLS setup or handshake failure
    #[error("{context}: {source}")]
    Tls {
        /// What was being attempted
        context: String,
        /// Underlying failure
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    /// Protocol desync (unexpected message, bad framing)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Authentication failed
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Server requested something this client does not implement
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Server asked for a password and none could be resolved
    #[error("no password provided for user '{user}' but the server requires one")]
    NoPassword {
        /// Username being authenticated
        user: String,
    },

    /// User supplied password provider failed
    #[error("password provider failed: {0}")]
    PasswordProvider(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid state transition requested
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// Another operation already holds the connector
    #[error("{}", in_progress_message(.command))]
    OperationInProgress {
        /// Command text of the operation in progress, if known
        command: Option<String>,
    },

    /// Server reported an error
    #[error("server error: {0}")]
    Server(Box<ServerError>),

    /// Read or write exceeded its deadline
    #[error("operation timed out")]
    Timeout,

    /// Operation cancelled at the caller's request
    #[error("operation cancelled")]
    Cancelled,

    /// Connector is broken; carries the original break reason
    #[error("connector is broken: {0}")]
    Broken(Box<Error>),
}

fn in_progress_message(command: &Option<String>) -> String {
    match command {
        Some(c) => format!("an operation is already in progress: {}", c),
        None => "an operation is already in progress".to_string(),
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Error::ConnectionClosed;
        }
        Error::Io(Arc::new(err))
    }
}

impl Error {
    pub(crate) fn tls(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Tls {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    /// SQLSTATE of a server error, if this is one
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Error::Server(e) => Some(e.code()),
            Error::Broken(inner) => inner.sql_state(),
            _ => None,
        }
    }

    /// Whether this failure suggests the server itself is unreachable or unhealthy
    ///
    /// Transient failures mark the server offline in the cluster state cache
    /// and clear the pool for that target.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(_) | Error::ConnectionClosed | Error::Timeout | Error::Tls { .. } => true,
            Error::Server(e) => e.is_critical(),
            Error::Broken(inner) => inner.is_transient(),
            _ => false,
        }
    }

    /// Whether this error is a caller-side configuration/programming fault
    ///
    /// These never break the connector.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Error::OperationInProgress { .. } | Error::InvalidState { .. } | Error::Config(_)
        )
    }

    /// Whether the connector must be broken after observing this error
    pub fn is_fatal_to_connector(&self) -> bool {
        match self {
            Error::Io(_)
            | Error::ConnectionClosed
            | Error::Tls { .. }
            | Error::Protocol(_)
            | Error::Broken(_) => true,
            Error::Server(e) => e.is_critical() || e.terminates_session(),
            _ => false,
        }
    }

    /// Whether the server rejected the credentials or authorization
    pub(crate) fn is_authorization_failure(&self) -> bool {
        match self {
            Error::Server(e) => e.code().starts_with("28"),
            Error::Authentication(_) => true,
            _ => false,
        }
    }
}

/// Error reported by the server in an ErrorResponse
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    fields: ErrorFields,
}

impl ServerError {
    pub(crate) fn new(fields: ErrorFields) -> Self {
        Self { fields }
    }

    /// SQLSTATE code (empty if the server omitted it)
    pub fn code(&self) -> &str {
        self.fields.code.as_deref().unwrap_or("")
    }

    /// Severity (ERROR, FATAL, PANIC)
    pub fn severity(&self) -> &str {
        self.fields.severity.as_deref().unwrap_or("")
    }

    /// Primary message
    pub fn message(&self) -> &str {
        self.fields.message.as_deref().unwrap_or("")
    }

    /// All decoded fields
    pub fn fields(&self) -> &ErrorFields {
        &self.fields
    }

    /// Whether the server closes the session after this error
    ///
    /// FATAL and PANIC errors are never followed by ReadyForQuery.
    pub fn terminates_session(&self) -> bool {
        matches!(self.severity(), "FATAL" | "PANIC")
    }

    /// Whether this error indicates a failure of the server rather than of
    /// the command (resource exhaustion, shutdown, internal errors).
    pub fn is_critical(&self) -> bool {
        let code = self.code();
        code.starts_with("53")
            || code.starts_with("58")
            || code.starts_with("XX")
            || matches!(code, "57P01" | "57P02" | "57P03")
    }

    /// Whether the server cancelled the running statement
    pub fn is_query_canceled(&self) -> bool {
        self.code() == crate::protocol::constants::sqlstate::QUERY_CANCELED
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.severity(), self.fields)
    }
}

impl std::error::Error for ServerError {}
