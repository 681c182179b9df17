//! Multiplexing: many callers pipelining commands over one connector
//!
//! Writers append their messages under the write lock and enqueue a pending
//! command in the same critical section, so queue order equals wire order.
//! A single read loop hands each queued command the read side once its
//! response starts arriving, then drains whatever the caller left unread.

use super::conn::{Connector, ConnectorCore};
use super::io::{ReadOptions, ReadSide, WriteSide};
use crate::buffer::DataRowView;
use crate::metrics::counters;
use crate::protocol::{BackendMessage, FrontendMessage};
use crate::{Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, MutexGuard, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::Instrument;

struct PendingCommand {
    respond: oneshot::Sender<Result<MultiplexedResponse>>,
}

/// Queue of commands whose responses are still on the wire
pub(crate) struct Handle {
    queue: mpsc::UnboundedSender<PendingCommand>,
    in_flight: AtomicUsize,
}

impl Handle {
    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Start the read loop for a multiplexing connector
pub(crate) fn spawn(core: Arc<ConnectorCore>) -> JoinHandle<()> {
    let (queue, commands) = mpsc::unbounded_channel();
    let _ = core.multiplexer.set(Handle {
        queue,
        in_flight: AtomicUsize::new(0),
    });
    let span = tracing::debug_span!("multiplexing", connector = core.id());
    tokio::spawn(read_loop(core, commands).instrument(span))
}

async fn read_loop(core: Arc<ConnectorCore>, mut commands: mpsc::UnboundedReceiver<PendingCommand>) {
    loop {
        let command = tokio::select! {
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
            _ = core.shutdown_token().cancelled() => break,
        };
        if let Err(e) = serve(&core, command).await {
            tracing::warn!(error = %e, "multiplexing read loop stopped");
            break;
        }
    }

    // Everything still queued fails with the recorded break reason
    commands.close();
    let reason = if core.is_broken() {
        core.broken_error()
    } else {
        Error::ConnectionClosed
    };
    while let Ok(command) = commands.try_recv() {
        complete(&core);
        let _ = command.respond.send(Err(reason.clone()));
    }
    if let Some(source) = &core.context().source {
        source.return_connector(core.id());
    }
}

async fn serve(core: &Arc<ConnectorCore>, command: PendingCommand) -> Result<()> {
    let mut reader = core.reader.clone().lock_owned().await;
    let started = match reader.as_mut() {
        Some(read) => {
            read.begin_action(None, core.settings().command_timeout);
            let start = read.ready_count();
            read.wait_readable(core).await.map(|()| start)
        }
        None => Err(core.broken_error()),
    };
    let start = match started {
        Ok(start) => start,
        Err(e) => {
            let reason = if core.is_broken() {
                reader.take();
                core.broken_error()
            } else {
                e.clone()
            };
            complete(core);
            let _ = command.respond.send(Err(reason));
            return Err(e);
        }
    };

    let (done, finished) = oneshot::channel();
    let response = MultiplexedResponse {
        core: core.clone(),
        reader,
        done: Some(done),
    };
    // A caller that went away drops the response, which signals `done`
    let _ = command.respond.send(Ok(response));
    let _ = finished.await;

    let mut reader = core.reader.lock().await;
    let drained = match reader.as_mut() {
        Some(read) => read.drain_until_ready(core, start).await,
        None => Err(core.broken_error()),
    };
    if core.is_broken() {
        reader.take();
    }
    complete(core);
    drained
}

fn complete(core: &ConnectorCore) {
    let Some(handle) = core.multiplexer.get() else {
        return;
    };
    if handle.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 && !core.is_broken() {
        tracing::trace!("multiplexed connector idle");
        if let Some(source) = &core.context().source {
            source.return_connector(core.id());
        }
    }
}

/// Exclusive read access to one multiplexed command's response
///
/// Messages past the command's ReadyForQuery belong to the next caller;
/// reading stops there. Dropping the response early is fine: the read loop
/// discards what is left.
pub struct MultiplexedResponse {
    core: Arc<ConnectorCore>,
    reader: OwnedMutexGuard<Option<ReadSide>>,
    done: Option<oneshot::Sender<()>>,
}

impl std::fmt::Debug for MultiplexedResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexedResponse")
            .field("connector", &self.core.id())
            .finish_non_exhaustive()
    }
}

impl MultiplexedResponse {
    fn read_side(&mut self) -> Result<&mut ReadSide> {
        self.core.ensure_not_broken()?;
        match self.reader.as_mut() {
            Some(read) => Ok(read),
            None => Err(self.core.broken_error()),
        }
    }

    /// Read the next message of this response
    pub async fn read_message(&mut self) -> Result<BackendMessage> {
        let core = self.core.clone();
        self.read_side()?
            .read_message(&core, ReadOptions::default())
            .await
    }

    /// Fields of the DataRow just returned
    pub async fn data_row(&mut self) -> Result<DataRowView<'_>> {
        let core = self.core.clone();
        self.read_side()?.data_row(&core).await
    }
}

impl Drop for MultiplexedResponse {
    fn drop(&mut self) {
        if self.core.is_broken() {
            self.reader.take();
        }
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

/// The write half of a queued command
///
/// If the command does not reach the wire in full (an I/O error, or the
/// caller dropping the future mid-write) the queue no longer matches the
/// responses on the wire, so the connector is broken.
struct QueuedWrite<'a> {
    core: &'a ConnectorCore,
    writer: MutexGuard<'a, Option<WriteSide>>,
    flushed: bool,
}

impl QueuedWrite<'_> {
    async fn write_all(&mut self, messages: &[FrontendMessage]) -> Result<()> {
        let core = self.core;
        let Some(write) = self.writer.as_mut() else {
            return Err(core.broken_error());
        };
        for msg in messages {
            write.write(core, msg).await?;
        }
        write.flush(core).await?;
        self.flushed = true;
        Ok(())
    }
}

impl Drop for QueuedWrite<'_> {
    fn drop(&mut self) {
        if self.flushed {
            return;
        }
        // Partially written bytes must not be followed by another command
        self.writer.take();
        if self.core.break_with(Error::Cancelled) {
            tracing::warn!(
                connector = self.core.id(),
                "multiplexed command abandoned before reaching the wire"
            );
        }
    }
}

impl Connector {
    /// Pipeline `messages` and wait for this command's turn to read
    ///
    /// `messages` must produce exactly one ReadyForQuery: a simple query, or
    /// an extended-query batch ending in Sync.
    pub async fn multiplexed(&self, messages: &[FrontendMessage]) -> Result<MultiplexedResponse> {
        let core = self.core();
        let Some(handle) = core.multiplexer.get() else {
            return Err(Error::Config("connector is not multiplexing".into()));
        };
        core.ensure_usable()?;

        let (respond, response) = oneshot::channel();
        {
            let writer = core.writer.lock().await;
            if writer.is_none() {
                return Err(core.broken_error());
            }
            handle.in_flight.fetch_add(1, Ordering::AcqRel);
            if handle.queue.send(PendingCommand { respond }).is_err() {
                handle.in_flight.fetch_sub(1, Ordering::AcqRel);
                return Err(core.broken_error());
            }
            counters::multiplexed_command();

            // From here on the queue expects a response for this command
            let mut queued = QueuedWrite {
                core,
                writer,
                flushed: false,
            };
            queued.write_all(messages).await?;
        }

        response.await.map_err(|_| core.broken_error())?
    }

    /// Pipeline a simple query
    pub async fn multiplexed_query(&self, sql: &str) -> Result<MultiplexedResponse> {
        self.multiplexed(&[FrontendMessage::Query(sql.to_string())])
            .await
    }

    /// Commands whose responses have not been fully consumed
    pub fn in_flight(&self) -> usize {
        self.core().multiplexer.get().map_or(0, Handle::in_flight)
    }
}
