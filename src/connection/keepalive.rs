//! Idle keepalive round-trips

use super::conn::ConnectorCore;
use super::io::ReadOptions;
use super::state::ConnectorState;
use crate::metrics::{counters, labels};
use crate::protocol::{pregenerated, BackendMessage};
use crate::Result;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Run a keepalive probe every `interval` of idleness
///
/// The task holds a weak reference so a dropped connector is not kept alive.
/// Every released user action restarts the timer.
pub(crate) fn spawn(core: Weak<ConnectorCore>, interval: Duration) -> JoinHandle<()> {
    let id = core.upgrade().map(|c| c.id()).unwrap_or_default();
    tokio::spawn(run(core, interval).instrument(tracing::debug_span!("keepalive", connector = id)))
}

async fn run(core: Weak<ConnectorCore>, interval: Duration) {
    loop {
        let Some(strong) = core.upgrade() else {
            return;
        };
        let shutdown = strong.shutdown_token().clone();
        let rearm = strong.keepalive_rearm.clone();
        drop(strong);

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = rearm.notified() => continue,
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(core) = core.upgrade() else {
            return;
        };
        probe(&core).await;
    }
}

/// One Sync/ReadyForQuery round-trip; any failure breaks the connector
pub(crate) async fn probe(core: &ConnectorCore) {
    if core.state() != ConnectorState::Ready {
        return;
    }
    // A user action owns the wire
    let Ok(mut writer) = core.writer.try_lock() else {
        return;
    };
    let Ok(mut reader) = core.reader.try_lock() else {
        return;
    };
    if core.state() != ConnectorState::Ready {
        return;
    }
    let (Some(write), Some(read)) = (writer.as_mut(), reader.as_mut()) else {
        return;
    };

    read.begin_action(None, core.settings().command_timeout);
    let result: Result<()> = async {
        read.drain_abandoned(core).await?;
        write.write_raw(core, &pregenerated::SYNC).await?;
        core.expect_response();
        write.flush(core).await?;
        loop {
            if let BackendMessage::ReadyForQuery(_) =
                read.read_message(core, ReadOptions::skip_rows()).await?
            {
                return Ok(());
            }
        }
    }
    .await;

    match result {
        Ok(()) => {
            tracing::trace!("keepalive ok");
            counters::keepalive_probe(labels::OUTCOME_OK);
        }
        Err(e) => {
            tracing::warn!(error = %e, "keepalive failed");
            counters::keepalive_probe(labels::OUTCOME_ERROR);
            core.break_with(e);
            writer.take();
            reader.take();
        }
    }
}
