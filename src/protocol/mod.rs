//! Postgres wire protocol implementation
//!
//! This module implements the subset of the Postgres protocol 3.0 the
//! connector needs: startup, authentication, simple and extended query,
//! copy, notifications and cancellation.

pub mod constants;
pub mod decode;
pub mod encode;
pub mod message;
pub mod pregenerated;

pub use decode::{decode_body, decode_data_row_header, decode_message, validate_header};
pub use encode::{encode_into, encode_message, encoded_len, pregenerate};
pub use message::{
    AuthenticationMessage, BackendMessage, CopyResponse, DataRowHeader, ErrorFields,
    FieldDescription, FrontendMessage, Notification, PasswordChallenge, Target,
    TransactionStatus,
};
