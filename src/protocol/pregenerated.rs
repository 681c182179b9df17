//! Housekeeping commands encoded once and replayed verbatim
//!
//! Each blob is a simple query; the connector counts one ReadyForQuery per
//! blob when it prepends them ahead of a user command.

use super::encode::pregenerate;
use super::message::FrontendMessage;
use bytes::Bytes;
use std::sync::LazyLock;

/// `BEGIN`
pub static BEGIN: LazyLock<Bytes> =
    LazyLock::new(|| pregenerate(&[FrontendMessage::Query("BEGIN".into())]));

/// `ROLLBACK`
pub static ROLLBACK: LazyLock<Bytes> =
    LazyLock::new(|| pregenerate(&[FrontendMessage::Query("ROLLBACK".into())]));

/// `DISCARD ALL`: drops prepared statements, advisory locks, temp tables and session settings
pub static DISCARD_ALL: LazyLock<Bytes> =
    LazyLock::new(|| pregenerate(&[FrontendMessage::Query("DISCARD ALL".into())]));

/// Bare `Sync`, used as the keepalive round-trip
pub static SYNC: LazyLock<Bytes> = LazyLock::new(|| pregenerate(&[FrontendMessage::Sync]));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_blob_is_a_simple_query() {
        assert_eq!(ROLLBACK[0], b'Q');
        assert_eq!(&ROLLBACK[5..], b"ROLLBACK\0");
    }

    #[test]
    fn test_sync_blob() {
        assert_eq!(&SYNC[..], &[b'S', 0, 0, 0, 4]);
    }
}
