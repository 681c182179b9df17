//! Server-side cancellation over a separate connection

use super::conn::BackendKey;
use super::settings::Settings;
use super::transport::Stream;
use crate::metrics::{counters, labels};
use crate::protocol::{encode_message, FrontendMessage};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::Instrument;

/// How long to wait for the server to close the cancel connection
const CLOSE_WAIT: Duration = Duration::from_secs(1);

/// Send a CancelRequest for `key` in the background
///
/// Failures are logged and never reach the connector: the read that asked
/// for cancellation keeps its own deadline.
pub(crate) fn spawn(settings: Arc<Settings>, key: BackendKey, secure: bool) {
    let span = tracing::debug_span!("cancel_request", process_id = key.process_id);
    tokio::spawn(
        async move {
            match send_cancel_request(&settings, key, secure).await {
                Ok(()) => {
                    tracing::debug!("cancel request delivered");
                    counters::cancel_request(labels::OUTCOME_OK);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "cancel request failed");
                    counters::cancel_request(labels::OUTCOME_ERROR);
                }
            }
        }
        .instrument(span),
    );
}

/// Open a fresh connection and deliver a CancelRequest
///
/// Uses TLS when the session being cancelled does. The server answers by
/// closing the connection.
pub async fn send_cancel_request(settings: &Settings, key: BackendKey, secure: bool) -> Result<()> {
    let deliver = async {
        let mut stream = Stream::connect(settings).await?;
        if secure {
            stream = stream.negotiate_tls(settings, true).await?;
        }
        let request = encode_message(&FrontendMessage::CancelRequest {
            process_id: key.process_id,
            secret_key: key.secret_key,
        });
        stream.write_all(&request).await?;
        stream.flush().await?;

        let mut byte = [0u8; 1];
        let _ = tokio::time::timeout(CLOSE_WAIT, stream.read(&mut byte)).await;
        Ok::<(), Error>(())
    };

    tokio::time::timeout(settings.connect_timeout, deliver)
        .await
        .map_err(|_| Error::Timeout)?
}
