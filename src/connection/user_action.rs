//! Exclusive use of a connector's wire

use super::conn::ConnectorCore;
use super::io::{ReadOptions, ReadSide, WriteSide};
use super::state::ConnectorState;
use crate::buffer::DataRowView;
use crate::protocol::{BackendMessage, FrontendMessage};
use crate::{Error, Result};
use std::time::Duration;
use tokio::sync::MutexGuard;
use tokio_util::sync::CancellationToken;

/// Per-action options
#[derive(Debug, Clone, Default)]
pub struct ActionOptions {
    /// Command text reported by `OperationInProgress`
    pub command: Option<String>,
    /// Cancels the running statement when triggered
    pub cancel: Option<CancellationToken>,
    /// Overrides `command_timeout` for this action
    pub timeout: Option<Duration>,
}

impl ActionOptions {
    /// Options carrying only a cancellation token
    pub fn with_cancel(token: CancellationToken) -> Self {
        Self {
            cancel: Some(token),
            ..Self::default()
        }
    }
}

/// Guard over an in-progress user action
///
/// Holds both sides of the connector. Dropping it returns the connector to
/// `Ready` unless it broke meanwhile, and re-arms the keepalive timer.
pub struct UserAction<'a> {
    core: &'a ConnectorCore,
    writer: MutexGuard<'a, Option<WriteSide>>,
    reader: MutexGuard<'a, Option<ReadSide>>,
}

impl std::fmt::Debug for UserAction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserAction")
            .field("connector", &self.core.id())
            .field("state", &self.core.state())
            .finish_non_exhaustive()
    }
}

impl<'a> UserAction<'a> {
    pub(crate) async fn start(
        core: &'a ConnectorCore,
        state: ConnectorState,
        options: ActionOptions,
    ) -> Result<UserAction<'a>> {
        if !state.is_action_state() {
            return Err(Error::InvalidState {
                expected: "an action state".into(),
                actual: state.to_string(),
            });
        }
        if core.settings().multiplexing {
            return Err(Error::Config(
                "connector is multiplexing; send commands with Connector::multiplexed".into(),
            ));
        }

        match core.state_cell().transition(ConnectorState::Ready, state) {
            Ok(()) => {}
            Err(ConnectorState::Broken) => return Err(core.broken_error()),
            Err(actual @ (ConnectorState::Closed | ConnectorState::Connecting)) => {
                return Err(Error::InvalidState {
                    expected: ConnectorState::Ready.to_string(),
                    actual: actual.to_string(),
                })
            }
            Err(_) => {
                return Err(Error::OperationInProgress {
                    command: core.current_command(),
                })
            }
        }

        // Visible to competing callers while the locks are awaited
        core.set_current_command(options.command);
        let pending = PendingStart { core, armed: true };

        // Waits out a keepalive round-trip in flight
        let writer = core.writer.lock().await;
        let reader = core.reader.lock().await;
        let mut action = UserAction {
            core,
            writer,
            reader,
        };
        pending.disarm();

        let timeout = options.timeout.or(core.settings().command_timeout);
        let read = action.read_side()?;
        read.begin_action(options.cancel, timeout);
        read.drain_abandoned(core).await?;
        tracing::trace!(connector = core.id(), %state, "user action started");
        Ok(action)
    }

    fn read_side(&mut self) -> Result<&mut ReadSide> {
        self.core.ensure_not_broken()?;
        match self.reader.as_mut() {
            Some(side) => Ok(side),
            None => Err(self.core.broken_error()),
        }
    }

    fn write_side(&mut self) -> Result<&mut WriteSide> {
        self.core.ensure_not_broken()?;
        match self.writer.as_mut() {
            Some(side) => Ok(side),
            None => Err(self.core.broken_error()),
        }
    }

    /// Current connector state
    pub fn state(&self) -> ConnectorState {
        self.core.state()
    }

    /// Move between action states (e.g. Executing to Fetching)
    pub fn set_state(&mut self, state: ConnectorState) {
        let current = self.core.state();
        if current.is_action_state() && state.is_action_state() {
            let _ = self.core.state_cell().transition(current, state);
        }
    }

    /// Buffer a message
    pub async fn write_message(&mut self, msg: &FrontendMessage) -> Result<()> {
        let core = self.core;
        self.write_side()?.write(core, msg).await
    }

    /// Flush buffered messages
    pub async fn flush(&mut self) -> Result<()> {
        let core = self.core;
        self.write_side()?.flush(core).await
    }

    /// Write and flush one message
    pub async fn send(&mut self, msg: &FrontendMessage) -> Result<()> {
        let core = self.core;
        self.write_side()?.send(core, msg).await
    }

    /// Read the next message
    ///
    /// A server error is returned when its ReadyForQuery arrives, so the
    /// connector is back in sync whenever an `Error::Server` surfaces.
    pub async fn read_message(&mut self) -> Result<BackendMessage> {
        self.read_message_with(ReadOptions::default()).await
    }

    /// Read the next message with explicit options
    pub async fn read_message_with(&mut self, options: ReadOptions) -> Result<BackendMessage> {
        let core = self.core;
        self.read_side()?.read_message(core, options).await
    }

    /// Fields of the DataRow just returned by `read_message`
    ///
    /// Valid until the next read. A row larger than the read buffer is
    /// staged in a temporary arena that is released by that read.
    pub async fn data_row(&mut self) -> Result<DataRowView<'_>> {
        let core = self.core;
        self.read_side()?.data_row(core).await
    }

    pub(crate) async fn wait_idle(&mut self, deadline: Option<tokio::time::Instant>) -> Result<bool> {
        let core = self.core;
        self.read_side()?.wait_idle(core, deadline).await
    }

    /// Break the connector and return the error to raise
    pub fn fail(&self, err: Error) -> Error {
        self.core.fail(err)
    }

    /// Capacity of the read arena in use
    pub fn read_buffer_capacity(&self) -> usize {
        self.reader.as_ref().map_or(0, |r| r.buffer().capacity())
    }

    /// Whether the read side is staged in an oversize arena
    pub fn read_buffer_oversized(&self) -> bool {
        self.reader.as_ref().is_some_and(|r| r.buffer().is_oversized())
    }

    /// Identity of the read arena in use, stable across reuse
    pub fn read_buffer_id(&self) -> usize {
        self.reader.as_ref().map_or(0, |r| r.buffer().arena_id())
    }
}

/// Returns the connector to `Ready` if `start` is dropped before the
/// action guard exists
struct PendingStart<'a> {
    core: &'a ConnectorCore,
    armed: bool,
}

impl PendingStart<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingStart<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.core.set_current_command(None);
        let current = self.core.state();
        if current.is_action_state() {
            let _ = self
                .core
                .state_cell()
                .transition(current, ConnectorState::Ready);
        }
        tracing::debug!(
            connector = self.core.id(),
            "user action abandoned while waiting for the wire"
        );
    }
}

impl Drop for UserAction<'_> {
    fn drop(&mut self) {
        self.core.set_current_command(None);
        if self.core.is_broken() {
            self.writer.take();
            self.reader.take();
            return;
        }
        let current = self.core.state();
        if current.is_action_state() {
            let _ = self
                .core
                .state_cell()
                .transition(current, ConnectorState::Ready);
        }
        self.core.keepalive_rearm.notify_one();
        tracing::trace!(connector = self.core.id(), "user action released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ConnectorContext;
    use crate::connection::Settings;
    use std::sync::Arc;
    use std::time::Duration;

    fn ready_core() -> ConnectorCore {
        let settings = Settings::builder().host("127.0.0.1").user("app").build().unwrap();
        let core = ConnectorCore::new(Arc::new(settings), ConnectorContext::new());
        core.state_cell()
            .transition(ConnectorState::Connecting, ConnectorState::Ready)
            .unwrap();
        core
    }

    fn select_one() -> ActionOptions {
        ActionOptions {
            command: Some("SELECT 1".into()),
            ..ActionOptions::default()
        }
    }

    #[tokio::test]
    async fn test_start_dropped_while_waiting_for_wire_restores_ready() {
        let core = ready_core();
        let held = core.writer.lock().await;

        let mut waiting = Box::pin(UserAction::start(&core, ConnectorState::Executing, select_one()));
        assert!(tokio::time::timeout(Duration::from_millis(20), &mut waiting)
            .await
            .is_err());
        assert_eq!(core.state(), ConnectorState::Executing);

        // A competing caller sees the waiting caller's command
        let err = UserAction::start(&core, ConnectorState::Executing, ActionOptions::default())
            .await
            .unwrap_err();
        match err {
            Error::OperationInProgress { command } => assert_eq!(command.as_deref(), Some("SELECT 1")),
            other => panic!("expected OperationInProgress, got {other:?}"),
        }

        drop(waiting);
        assert_eq!(core.state(), ConnectorState::Ready);
        assert_eq!(core.current_command(), None);
        drop(held);

        // The wire is free again; the connector has no sides, so the start
        // gets past the state check and fails on the missing stream
        let err = UserAction::start(&core, ConnectorState::Executing, select_one())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Broken(_)), "got {err:?}");
        assert_eq!(core.state(), ConnectorState::Ready);
    }
}
