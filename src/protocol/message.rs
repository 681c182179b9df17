//! Protocol message types

use super::constants::tx_status;
use bytes::Bytes;

/// Frontend message (client → server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    /// Startup message
    Startup {
        /// Protocol version
        version: i32,
        /// Connection parameters
        params: Vec<(String, String)>,
    },

    /// SSLRequest message (TLS negotiation)
    SslRequest,

    /// CancelRequest, sent on its own connection
    CancelRequest {
        /// Target backend process ID
        process_id: i32,
        /// Target backend secret key
        secret_key: i32,
    },

    /// Password response; payload is sent verbatim followed by a NUL
    Password(Vec<u8>),

    /// Simple query
    Query(String),

    /// Parse (extended query)
    Parse {
        /// Prepared statement name ("" = unnamed)
        name: String,
        /// SQL text
        query: String,
        /// Parameter type OIDs (0 = unspecified)
        param_types: Vec<u32>,
    },

    /// Bind (extended query)
    Bind {
        /// Destination portal ("" = unnamed)
        portal: String,
        /// Source prepared statement
        statement: String,
        /// Parameter format codes
        param_formats: Vec<i16>,
        /// Parameter values (None = NULL)
        params: Vec<Option<Bytes>>,
        /// Result column format codes
        result_formats: Vec<i16>,
    },

    /// Describe a statement or portal
    Describe {
        /// Statement or portal
        target: Target,
        /// Name
        name: String,
    },

    /// Execute a portal
    Execute {
        /// Portal name
        portal: String,
        /// Row limit (0 = no limit)
        max_rows: i32,
    },

    /// Close a statement or portal
    Close {
        /// Statement or portal
        target: Target,
        /// Name
        name: String,
    },

    /// Sync
    Sync,

    /// Flush
    Flush,

    /// Copy data (COPY FROM STDIN)
    CopyData(Bytes),

    /// Copy done
    CopyDone,

    /// Copy fail with an error message
    CopyFail(String),

    /// Terminate message
    Terminate,
}

/// Describe/Close target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Prepared statement
    Statement,
    /// Portal
    Portal,
}

impl Target {
    pub(crate) fn code(self) -> u8 {
        match self {
            Target::Statement => b'S',
            Target::Portal => b'P',
        }
    }
}

/// Backend message (server → client)
///
/// `DataRow` only carries the row header; its fields stay in the read buffer
/// and are accessed through a [`DataRowView`](crate::buffer::DataRowView).
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    /// Authentication request
    Authentication(AuthenticationMessage),

    /// Backend key data (for cancellation)
    BackendKeyData {
        /// Process ID
        process_id: i32,
        /// Secret key
        secret_key: i32,
    },

    /// Bind complete
    BindComplete,

    /// Close complete
    CloseComplete,

    /// Command complete
    CommandComplete(String),

    /// Copy data
    CopyData(Bytes),

    /// Copy done
    CopyDone,

    /// Copy in response
    CopyInResponse(CopyResponse),

    /// Copy out response
    CopyOutResponse(CopyResponse),

    /// Copy both response
    CopyBothResponse(CopyResponse),

    /// Data row header
    DataRow(DataRowHeader),

    /// Empty query response
    EmptyQueryResponse,

    /// Error response
    ErrorResponse(ErrorFields),

    /// No data
    NoData,

    /// Notice response
    NoticeResponse(ErrorFields),

    /// Asynchronous notification
    NotificationResponse(Notification),

    /// Parameter description
    ParameterDescription(Vec<u32>),

    /// Parameter status
    ParameterStatus {
        /// Parameter name
        name: String,
        /// Parameter value
        value: String,
    },

    /// Parse complete
    ParseComplete,

    /// Portal suspended
    PortalSuspended,

    /// Ready for query
    ReadyForQuery(TransactionStatus),

    /// Row description
    RowDescription(Vec<FieldDescription>),
}

impl BackendMessage {
    /// Short name used in logs and protocol errors
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "Authentication",
            Self::BackendKeyData { .. } => "BackendKeyData",
            Self::BindComplete => "BindComplete",
            Self::CloseComplete => "CloseComplete",
            Self::CommandComplete(_) => "CommandComplete",
            Self::CopyData(_) => "CopyData",
            Self::CopyDone => "CopyDone",
            Self::CopyInResponse(_) => "CopyInResponse",
            Self::CopyOutResponse(_) => "CopyOutResponse",
            Self::CopyBothResponse(_) => "CopyBothResponse",
            Self::DataRow(_) => "DataRow",
            Self::EmptyQueryResponse => "EmptyQueryResponse",
            Self::ErrorResponse(_) => "ErrorResponse",
            Self::NoData => "NoData",
            Self::NoticeResponse(_) => "NoticeResponse",
            Self::NotificationResponse(_) => "NotificationResponse",
            Self::ParameterDescription(_) => "ParameterDescription",
            Self::ParameterStatus { .. } => "ParameterStatus",
            Self::ParseComplete => "ParseComplete",
            Self::PortalSuspended => "PortalSuspended",
            Self::ReadyForQuery(_) => "ReadyForQuery",
            Self::RowDescription(_) => "RowDescription",
        }
    }
}

/// Authentication message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationMessage {
    /// Authentication OK
    Ok,

    /// Cleartext password required
    CleartextPassword,

    /// MD5 password required
    Md5Password {
        /// Salt for MD5 hash
        salt: [u8; 4],
    },

    /// PBKDF2/HMAC-SHA256 password challenge
    Sha256Password(PasswordChallenge),

    /// Any other sub-type; rejected by the authenticator
    Other(i32),
}

/// Server-issued password challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordChallenge {
    /// How the server stored the password
    pub stored_method: i32,
    /// 64 hex characters, used as the PBKDF2 salt once decoded
    pub random_code: String,
    /// 8 hex characters
    pub token: String,
    /// PBKDF2 iteration count
    pub iterations: u32,
}

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    /// Not in a transaction block
    #[default]
    Idle,
    /// In a transaction block
    InTransactionBlock,
    /// In a failed transaction block
    InFailedTransactionBlock,
    /// Transaction begin queued locally, not yet confirmed by the server
    Pending,
}

impl TransactionStatus {
    /// Map a ReadyForQuery indicator byte; `Pending` is never produced here
    pub fn from_indicator(indicator: u8) -> Option<Self> {
        match indicator {
            tx_status::IDLE => Some(Self::Idle),
            tx_status::IN_TRANSACTION => Some(Self::InTransactionBlock),
            tx_status::FAILED => Some(Self::InFailedTransactionBlock),
            _ => None,
        }
    }

    /// Wire indicator, `None` for the client-only `Pending`
    pub fn indicator(self) -> Option<u8> {
        match self {
            Self::Idle => Some(tx_status::IDLE),
            Self::InTransactionBlock => Some(tx_status::IN_TRANSACTION),
            Self::InFailedTransactionBlock => Some(tx_status::FAILED),
            Self::Pending => None,
        }
    }
}

/// Data row header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRowHeader {
    /// Number of fields in the row
    pub field_count: u16,
    /// Body length in bytes, excluding the 2-byte field count
    pub len: usize,
}

/// Copy response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyResponse {
    /// Overall format (0 = text, 1 = binary)
    pub format: i8,
    /// Per-column format codes
    pub column_formats: Vec<i16>,
}

/// Asynchronous notification (LISTEN/NOTIFY)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Notifying backend process ID
    pub process_id: i32,
    /// Channel name
    pub channel: String,
    /// Payload
    pub payload: String,
}

/// Field description (column metadata)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    /// Column name
    pub name: String,
    /// Table OID (0 if not a table column)
    pub table_oid: i32,
    /// Column attribute number (0 if not a table column)
    pub column_attr: i16,
    /// Data type OID
    pub type_oid: u32,
    /// Data type size
    pub type_size: i16,
    /// Type modifier
    pub type_modifier: i32,
    /// Format code (0 = text, 1 = binary)
    pub format_code: i16,
}

/// Error/notice fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    /// Severity (ERROR, WARNING, etc.)
    pub severity: Option<String>,
    /// SQLSTATE code
    pub code: Option<String>,
    /// Human-readable message
    pub message: Option<String>,
    /// Additional detail
    pub detail: Option<String>,
    /// Hint
    pub hint: Option<String>,
    /// Position in query string
    pub position: Option<String>,
    /// Call stack context
    pub where_: Option<String>,
    /// Schema name
    pub schema: Option<String>,
    /// Table name
    pub table: Option<String>,
    /// Column name
    pub column: Option<String>,
    /// Constraint name
    pub constraint: Option<String>,
}

impl std::fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref msg) = self.message {
            write!(f, "{}", msg)?;
        }
        if let Some(ref code) = self.code {
            write!(f, " ({})", code)?;
        }
        Ok(())
    }
}
