//! Connector state machine

use crate::{Error, Result};
use std::sync::atomic::{AtomicU8, Ordering};

/// Connector state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectorState {
    /// Not connected
    Closed = 0,

    /// Connecting, negotiating TLS or authenticating
    Connecting = 1,

    /// Idle and ready for a user action
    Ready = 2,

    /// Sending a command
    Executing = 3,

    /// Reading results
    Fetching = 4,

    /// Waiting for asynchronous notifications
    Waiting = 5,

    /// In the copy sub-protocol
    Copy = 6,

    /// Streaming replication
    Replication = 7,

    /// Failed permanently; must be discarded
    Broken = 8,
}

impl ConnectorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Closed,
            1 => Self::Connecting,
            2 => Self::Ready,
            3 => Self::Executing,
            4 => Self::Fetching,
            5 => Self::Waiting,
            6 => Self::Copy,
            7 => Self::Replication,
            _ => Self::Broken,
        }
    }

    /// Whether a user action may move the connector into this state
    pub fn is_action_state(&self) -> bool {
        matches!(
            self,
            Self::Executing | Self::Fetching | Self::Waiting | Self::Copy | Self::Replication
        )
    }

    /// Whether the connector can never be used again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Broken)
    }

    /// Whether the connector holds a live connection
    pub fn is_connected(&self) -> bool {
        !matches!(self, Self::Closed | Self::Broken | Self::Connecting)
    }
}

impl std::fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Connecting => write!(f, "connecting"),
            Self::Ready => write!(f, "ready"),
            Self::Executing => write!(f, "executing"),
            Self::Fetching => write!(f, "fetching"),
            Self::Waiting => write!(f, "waiting"),
            Self::Copy => write!(f, "copy"),
            Self::Replication => write!(f, "replication"),
            Self::Broken => write!(f, "broken"),
        }
    }
}

/// Lock-free connector state cell
///
/// `Broken` is absorbing: once stored, no other transition succeeds.
#[derive(Debug)]
pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    pub(crate) fn new(state: ConnectorState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> ConnectorState {
        ConnectorState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`, failing with the observed state
    pub(crate) fn transition(
        &self,
        from: ConnectorState,
        to: ConnectorState,
    ) -> std::result::Result<(), ConnectorState> {
        if from == ConnectorState::Broken {
            return Err(ConnectorState::Broken);
        }
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ConnectorState::from_u8)
    }

    /// Store `to` unless the connector is already terminal
    pub(crate) fn set_unless_terminal(&self, to: ConnectorState) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if ConnectorState::from_u8(current).is_terminal() {
                    None
                } else {
                    Some(to as u8)
                }
            })
            .is_ok()
    }

    /// Mark broken; returns false if already broken or closed
    pub(crate) fn mark_broken(&self) -> bool {
        self.set_unless_terminal(ConnectorState::Broken)
    }

    /// Fail unless the connector is in `expected`
    pub(crate) fn expect(&self, expected: ConnectorState) -> Result<()> {
        let actual = self.get();
        if actual != expected {
            return Err(Error::InvalidState {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }
}
