//! Synchronous wrapper over [`crate::Connector`]
//!
//! Each wrapper owns a current-thread runtime. Background work (keepalive,
//! cancel requests) only makes progress while a call is blocked on it.

use crate::connection::{Settings, SimpleQueryMessage};
use crate::protocol::{Notification, TransactionStatus};
use crate::{ConnectorState, Result};
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};

/// Blocking connector
#[derive(Debug)]
pub struct Connector {
    inner: crate::Connector,
    runtime: Runtime,
}

impl Connector {
    /// Open a connector, blocking until it is ready
    pub fn open(settings: Settings) -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let inner = runtime.block_on(crate::Connector::open(settings))?;
        Ok(Self { inner, runtime })
    }

    /// Run a simple query
    pub fn simple_query(&self, sql: &str) -> Result<Vec<SimpleQueryMessage>> {
        self.runtime.block_on(self.inner.simple_query(sql))
    }

    /// Queue `BEGIN` ahead of the next command
    pub fn begin_transaction(&self) -> Result<()> {
        self.runtime.block_on(self.inner.begin_transaction())
    }

    /// Wait for a notification
    pub fn wait_for_notification(&self, timeout: Option<Duration>) -> Result<Option<Notification>> {
        self.runtime
            .block_on(self.inner.wait_for_notification(timeout))
    }

    /// Prepare for reuse
    pub fn reset(&self) -> Result<()> {
        self.runtime.block_on(self.inner.reset())
    }

    /// Close the session
    pub fn close(&self) -> Result<()> {
        self.runtime.block_on(self.inner.close())
    }

    /// Current state
    pub fn state(&self) -> ConnectorState {
        self.inner.state()
    }

    /// Transaction status
    pub fn transaction_status(&self) -> TransactionStatus {
        self.inner.transaction_status()
    }

    /// The wrapped async connector
    pub fn get_ref(&self) -> &crate::Connector {
        &self.inner
    }
}
