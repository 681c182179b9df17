//! Postgres protocol constants

/// Protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 0x0003_0000;

/// SSLRequest code (80877103 = 1234 << 16 | 5679)
pub const SSL_REQUEST_CODE: i32 = 0x04D2_162F;

/// CancelRequest code (80877102 = 1234 << 16 | 5678)
pub const CANCEL_REQUEST_CODE: i32 = 0x04D2_162E;

/// Maximum message length (1 GB), matching PostgreSQL's own `PQ_LARGE_MESSAGE_LIMIT`.
///
/// Any message whose length field exceeds this value is rejected before allocation
/// to prevent denial-of-service via crafted length headers.
pub const MAX_MESSAGE_LENGTH: usize = 1_073_741_824;

/// Backend message type tags
pub mod tags {
    /// Authentication request
    pub const AUTHENTICATION: u8 = b'R';

    /// Backend key data
    pub const BACKEND_KEY_DATA: u8 = b'K';

    /// Bind complete
    pub const BIND_COMPLETE: u8 = b'2';

    /// Close complete
    pub const CLOSE_COMPLETE: u8 = b'3';

    /// Command complete
    pub const COMMAND_COMPLETE: u8 = b'C';

    /// Copy data
    pub const COPY_DATA: u8 = b'd';

    /// Copy done
    pub const COPY_DONE: u8 = b'c';

    /// Copy in response
    pub const COPY_IN_RESPONSE: u8 = b'G';

    /// Copy out response
    pub const COPY_OUT_RESPONSE: u8 = b'H';

    /// Copy both response (replication)
    pub const COPY_BOTH_RESPONSE: u8 = b'W';

    /// Data row
    pub const DATA_ROW: u8 = b'D';

    /// Empty query response
    pub const EMPTY_QUERY_RESPONSE: u8 = b'I';

    /// Error response
    pub const ERROR_RESPONSE: u8 = b'E';

    /// No data
    pub const NO_DATA: u8 = b'n';

    /// Notice response
    pub const NOTICE_RESPONSE: u8 = b'N';

    /// Notification response (LISTEN/NOTIFY)
    pub const NOTIFICATION_RESPONSE: u8 = b'A';

    /// Parameter description
    pub const PARAMETER_DESCRIPTION: u8 = b't';

    /// Parameter status
    pub const PARAMETER_STATUS: u8 = b'S';

    /// Parse complete
    pub const PARSE_COMPLETE: u8 = b'1';

    /// Portal suspended
    pub const PORTAL_SUSPENDED: u8 = b's';

    /// Ready for query
    pub const READY_FOR_QUERY: u8 = b'Z';

    /// Row description
    pub const ROW_DESCRIPTION: u8 = b'T';
}

/// Frontend message type tags
pub mod frontend {
    pub const BIND: u8 = b'B';
    pub const CLOSE: u8 = b'C';
    pub const COPY_DATA: u8 = b'd';
    pub const COPY_DONE: u8 = b'c';
    pub const COPY_FAIL: u8 = b'f';
    pub const DESCRIBE: u8 = b'D';
    pub const EXECUTE: u8 = b'E';
    pub const FLUSH: u8 = b'H';
    pub const PARSE: u8 = b'P';
    pub const PASSWORD: u8 = b'p';
    pub const QUERY: u8 = b'Q';
    pub const SYNC: u8 = b'S';
    pub const TERMINATE: u8 = b'X';
}

/// Authentication request sub-types
pub mod auth {
    /// Authentication successful
    pub const OK: i32 = 0;

    /// Cleartext password required
    pub const CLEARTEXT_PASSWORD: i32 = 3;

    /// MD5 password required
    pub const MD5_PASSWORD: i32 = 5;

    /// PBKDF2/HMAC-SHA256 password challenge
    pub const SHA256_PASSWORD: i32 = 10;

    /// Iteration count assumed when the challenge omits it
    pub const DEFAULT_ITERATIONS: u32 = 2048;

    /// Length of the hex random code in a password challenge
    pub const RANDOM_CODE_LEN: usize = 64;

    /// Length of the hex token in a password challenge
    pub const TOKEN_LEN: usize = 8;
}

/// Transaction status indicators carried by ReadyForQuery
pub mod tx_status {
    /// Idle (not in transaction)
    pub const IDLE: u8 = b'I';

    /// In transaction block
    pub const IN_TRANSACTION: u8 = b'T';

    /// Failed transaction (queries will be rejected until END)
    pub const FAILED: u8 = b'E';
}

/// SQLSTATE codes the connector reacts to
pub mod sqlstate {
    /// Statement cancelled by a cancel request
    pub const QUERY_CANCELED: &str = "57014";

    /// Administrator-initiated shutdown
    pub const ADMIN_SHUTDOWN: &str = "57P01";

    /// Invalid password
    pub const INVALID_PASSWORD: &str = "28P01";

    /// Invalid authorization specification
    pub const INVALID_AUTHORIZATION_SPECIFICATION: &str = "28000";
}
