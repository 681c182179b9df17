//! Connector: one physical session to a server

use super::io::{ReadOptions, ReadSide, WriteSide};
use super::settings::Settings;
use super::state::{AtomicState, ConnectorState};
use super::tls::SslMode;
use super::transport::Stream;
use super::user_action::{ActionOptions, UserAction};
use super::{keepalive, multiplex};
use crate::cluster::{next_connector_id, ClusterState, ConnectorContext, ConnectorId, DatabaseInfo, DatabaseKey};
use crate::metrics::{self, counters, histograms};
use crate::protocol::constants::PROTOCOL_VERSION;
use crate::protocol::pregenerated;
use crate::protocol::{BackendMessage, ErrorFields, FieldDescription, FrontendMessage, Notification, TransactionStatus};
use crate::{auth, Error, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Key identifying a backend for cancel requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKey {
    /// Backend process ID
    pub process_id: i32,
    /// Secret key
    pub secret_key: i32,
}

/// One message of a simple-query result
#[derive(Debug, Clone, PartialEq)]
pub enum SimpleQueryMessage {
    /// Columns of the rows that follow
    RowDescription(Vec<FieldDescription>),
    /// One row, `None` for SQL NULL
    Row(Vec<Option<Bytes>>),
    /// Command tag
    CommandComplete(String),
}

const TX_IDLE: u8 = 0;
const TX_IN_BLOCK: u8 = 1;
const TX_FAILED: u8 = 2;
const TX_PENDING: u8 = 3;

fn tx_to_u8(status: TransactionStatus) -> u8 {
    match status {
        TransactionStatus::Idle => TX_IDLE,
        TransactionStatus::InTransactionBlock => TX_IN_BLOCK,
        TransactionStatus::InFailedTransactionBlock => TX_FAILED,
        TransactionStatus::Pending => TX_PENDING,
    }
}

fn tx_from_u8(value: u8) -> TransactionStatus {
    match value {
        TX_IN_BLOCK => TransactionStatus::InTransactionBlock,
        TX_FAILED => TransactionStatus::InFailedTransactionBlock,
        TX_PENDING => TransactionStatus::Pending,
        _ => TransactionStatus::Idle,
    }
}

/// State shared between the connector handle and its background tasks
pub(crate) struct ConnectorCore {
    id: ConnectorId,
    settings: Arc<Settings>,
    context: ConnectorContext,
    state: AtomicState,
    tx_status: AtomicU8,
    break_reason: OnceLock<Error>,
    backend_key: OnceLock<BackendKey>,
    secure: AtomicBool,
    parameters: Mutex<HashMap<String, String>>,
    current_command: Mutex<Option<String>>,
    /// Pregenerated commands written but not yet answered
    prepended: AtomicUsize,
    /// ReadyForQuery-producing messages written but not yet answered
    outstanding: AtomicUsize,
    /// Transaction opened through `begin_transaction`
    api_transaction: AtomicBool,
    pub(crate) reader: Arc<tokio::sync::Mutex<Option<ReadSide>>>,
    pub(crate) writer: tokio::sync::Mutex<Option<WriteSide>>,
    pub(crate) keepalive_rearm: Arc<Notify>,
    shutdown: CancellationToken,
    pub(crate) multiplexer: OnceLock<multiplex::Handle>,
}

impl ConnectorCore {
    pub(crate) fn new(settings: Arc<Settings>, context: ConnectorContext) -> Self {
        Self {
            id: next_connector_id(),
            settings,
            context,
            state: AtomicState::new(ConnectorState::Connecting),
            tx_status: AtomicU8::new(TX_IDLE),
            break_reason: OnceLock::new(),
            backend_key: OnceLock::new(),
            secure: AtomicBool::new(false),
            parameters: Mutex::new(HashMap::new()),
            current_command: Mutex::new(None),
            prepended: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            api_transaction: AtomicBool::new(false),
            reader: Arc::new(tokio::sync::Mutex::new(None)),
            writer: tokio::sync::Mutex::new(None),
            keepalive_rearm: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            multiplexer: OnceLock::new(),
        }
    }

    pub(crate) fn id(&self) -> ConnectorId {
        self.id
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.settings
    }

    pub(crate) fn settings_arc(&self) -> Arc<Settings> {
        self.settings.clone()
    }

    pub(crate) fn context(&self) -> &ConnectorContext {
        &self.context
    }

    pub(crate) fn state(&self) -> ConnectorState {
        self.state.get()
    }

    pub(crate) fn state_cell(&self) -> &AtomicState {
        &self.state
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.state.get() == ConnectorState::Broken
    }

    pub(crate) fn is_secure(&self) -> bool {
        self.secure.load(Ordering::Acquire)
    }

    pub(crate) fn backend_key(&self) -> Option<BackendKey> {
        self.backend_key.get().copied()
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn transaction_status(&self) -> TransactionStatus {
        tx_from_u8(self.tx_status.load(Ordering::Acquire))
    }

    fn set_transaction_status(&self, status: TransactionStatus) {
        self.tx_status.store(tx_to_u8(status), Ordering::Release);
    }

    pub(crate) fn current_command(&self) -> Option<String> {
        lock(&self.current_command).clone()
    }

    pub(crate) fn set_current_command(&self, command: Option<String>) {
        *lock(&self.current_command) = command;
    }

    pub(crate) fn parameter(&self, name: &str) -> Option<String> {
        lock(&self.parameters).get(name).cloned()
    }

    pub(crate) fn parameters(&self) -> HashMap<String, String> {
        lock(&self.parameters).clone()
    }

    pub(crate) fn set_parameter(&self, name: String, value: String) {
        tracing::trace!(%name, %value, "parameter status");
        lock(&self.parameters).insert(name, value);
    }

    pub(crate) fn on_notice(&self, fields: &ErrorFields) {
        tracing::debug!(
            severity = fields.severity.as_deref().unwrap_or(""),
            code = fields.code.as_deref().unwrap_or(""),
            "server notice: {}",
            fields.message.as_deref().unwrap_or("")
        );
        if let Some(handler) = &self.settings.notice_handler {
            handler(fields);
        }
    }

    pub(crate) fn on_notification(&self, notification: &Notification) {
        tracing::debug!(channel = %notification.channel, pid = notification.process_id, "notification");
        if let Some(handler) = &self.settings.notification_handler {
            handler(notification);
        }
    }

    pub(crate) fn has_prepended(&self) -> bool {
        self.prepended.load(Ordering::Acquire) > 0
    }

    pub(crate) fn complete_prepended(&self) {
        let _ = self
            .prepended
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub(crate) fn expect_response(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn enter_copy(&self) {
        let current = self.state.get();
        if current.is_action_state() {
            let _ = self.state.transition(current, ConnectorState::Copy);
        }
    }

    /// Apply a user-level ReadyForQuery
    pub(crate) fn on_ready_for_query(&self, status: TransactionStatus) -> Result<()> {
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.set_transaction_status(status);
        if status == TransactionStatus::Idle {
            self.api_transaction.store(false, Ordering::Release);
        }
        if self.settings.multiplexing
            && status != TransactionStatus::Idle
            && !self.api_transaction.load(Ordering::Acquire)
        {
            return Err(self.fail(Error::Config(
                "transaction opened by SQL on a multiplexing connector; use begin_transaction".into(),
            )));
        }
        let current = self.state.get();
        if current == ConnectorState::Copy {
            let _ = self.state.transition(current, ConnectorState::Fetching);
        }
        Ok(())
    }

    pub(crate) fn write_timeout(&self) -> Option<Duration> {
        match self.state.get() {
            ConnectorState::Connecting => None,
            _ => self.settings.command_timeout,
        }
    }

    /// Error returned by operations on a broken connector
    pub(crate) fn broken_error(&self) -> Error {
        Error::Broken(Box::new(
            self.break_reason
                .get()
                .cloned()
                .unwrap_or(Error::ConnectionClosed),
        ))
    }

    pub(crate) fn ensure_not_broken(&self) -> Result<()> {
        if self.is_broken() {
            return Err(self.broken_error());
        }
        Ok(())
    }

    /// Fail unless the connector can start new work
    pub(crate) fn ensure_usable(&self) -> Result<()> {
        match self.state.get() {
            ConnectorState::Broken => Err(self.broken_error()),
            ConnectorState::Closed | ConnectorState::Connecting => Err(Error::InvalidState {
                expected: ConnectorState::Ready.to_string(),
                actual: self.state.get().to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Route an I/O or protocol failure through `break_with`
    ///
    /// Returns `err` itself when this call recorded it as the break reason,
    /// `Broken(first reason)` otherwise. During startup nothing is broken
    /// here: `open` decides between retrying and failing.
    pub(crate) fn fail(&self, err: Error) -> Error {
        if self.state.get() == ConnectorState::Connecting {
            return err;
        }
        if self.break_with(err.clone()) {
            err
        } else {
            self.broken_error()
        }
    }

    /// Break the connector; returns false if it was already broken or closed
    pub(crate) fn break_with(&self, reason: Error) -> bool {
        let previous = self.state.get();
        if !self.state.mark_broken() {
            return false;
        }
        let _ = self.break_reason.set(reason.clone());
        tracing::error!(connector = self.id, error = %reason, %previous, "connector broken");
        counters::connector_broken(metrics::error_kind(&reason));

        self.shutdown.cancel();
        lock(&self.parameters).clear();
        self.set_current_command(None);
        self.prepended.store(0, Ordering::Release);
        self.outstanding.store(0, Ordering::Release);

        // Holders of either side release them when their guard drops
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }

        if reason.is_transient() {
            self.context.cluster.update(
                &self.settings.host,
                self.settings.port,
                ClusterState::Offline,
                Instant::now(),
            );
            if let Some(source) = &self.context.source {
                source.clear();
            }
        }
        true
    }

    /// Connect, negotiate TLS and authenticate, retrying once per sslmode policy
    async fn establish(&self) -> Result<()> {
        let mode = self.settings.ssl_mode;
        let first = if mode.attempts_tls_first() && !self.settings.is_unix_socket() {
            TlsAttempt::Negotiate {
                required: mode.requires_tls(),
            }
        } else {
            TlsAttempt::Plain
        };

        match self.attempt(first).await {
            Err(e) if e.is_authorization_failure() && mode == SslMode::Prefer && self.is_secure() => {
                tracing::info!(error = %e, "authorization failed over TLS, retrying without TLS");
                self.attempt(TlsAttempt::Plain).await
            }
            Err(e)
                if e.is_authorization_failure()
                    && mode == SslMode::Allow
                    && !self.is_secure()
                    && !self.settings.is_unix_socket() =>
            {
                tracing::info!(error = %e, "authorization failed in plaintext, retrying with TLS");
                self.attempt(TlsAttempt::Negotiate { required: true }).await
            }
            result => result,
        }
    }

    async fn attempt(&self, tls: TlsAttempt) -> Result<()> {
        lock(&self.parameters).clear();
        self.secure.store(false, Ordering::Release);

        let mut stream = Stream::connect(&self.settings).await?;
        if let TlsAttempt::Negotiate { required } = tls {
            stream = stream.negotiate_tls(&self.settings, required).await?;
        }
        self.secure.store(stream.is_secure(), Ordering::Release);

        let (read_half, write_half) = tokio::io::split(stream);
        let mut read = ReadSide::new(read_half, self.settings.read_buffer_size);
        let mut write = WriteSide::new(write_half, self.settings.write_buffer_size);

        write
            .send(
                self,
                &FrontendMessage::Startup {
                    version: PROTOCOL_VERSION,
                    params: self.settings.startup_params(),
                },
            )
            .await?;
        auth::authenticate(self, &mut read, &mut write).await?;

        loop {
            match read.read_message(self, ReadOptions::default()).await? {
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    tracing::debug!(process_id, "backend key data received");
                    let _ = self.backend_key.set(BackendKey {
                        process_id,
                        secret_key,
                    });
                }
                BackendMessage::ReadyForQuery(_) => break,
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected {} during startup",
                        other.name()
                    )))
                }
            }
        }

        *self.reader.lock().await = Some(read);
        *self.writer.lock().await = Some(write);
        Ok(())
    }

    async fn record_database_info(&self) {
        let key = DatabaseKey {
            host: self.settings.host.clone(),
            port: self.settings.port,
            database: self.settings.database.clone(),
        };
        let params = self.parameters();
        let loaded = self
            .context
            .databases
            .get_or_load(&key, || async { Ok(DatabaseInfo::from_parameters(&params)) })
            .await;
        if let Ok(info) = loaded {
            tracing::debug!(server_version = %info.server_version, "database info recorded");
        }
    }

    /// Spawn a cancel request for the running statement; false if impossible
    pub(crate) fn request_cancel(&self) -> bool {
        if !self.settings.server_side_cancel || self.state.get() == ConnectorState::Connecting {
            return false;
        }
        let Some(key) = self.backend_key() else {
            return false;
        };
        super::cancel::spawn(self.settings_arc(), key, self.is_secure());
        true
    }

    /// Prepend `ROLLBACK`/`DISCARD ALL` and restore buffers for reuse
    async fn reset(&self) -> Result<()> {
        self.ensure_usable()?;
        let mut writer = self.writer.lock().await;
        let mut reader = self.reader.lock().await;
        self.ensure_not_broken()?;
        self.state.expect(ConnectorState::Ready)?;
        let (Some(write), Some(read)) = (writer.as_mut(), reader.as_mut()) else {
            return Err(self.broken_error());
        };

        read.begin_action(None, self.settings.command_timeout);
        read.drain_abandoned(self).await?;
        read.restore_buffer();

        // Unsent BEGIN goes away with the buffer
        write.clear();
        self.prepended.store(0, Ordering::Release);
        if self.transaction_status() == TransactionStatus::Pending {
            self.set_transaction_status(TransactionStatus::Idle);
        }

        if self.transaction_status() != TransactionStatus::Idle {
            write.write_raw(self, &pregenerated::ROLLBACK).await?;
            self.prepended.fetch_add(1, Ordering::AcqRel);
            self.set_transaction_status(TransactionStatus::Idle);
        }
        if self.settings.reset_on_release {
            write.write_raw(self, &pregenerated::DISCARD_ALL).await?;
            self.prepended.fetch_add(1, Ordering::AcqRel);
        }
        self.api_transaction.store(false, Ordering::Release);
        tracing::debug!(connector = self.id, prepended = self.prepended.load(Ordering::Acquire), "connector reset");
        Ok(())
    }

    async fn begin_transaction(&self) -> Result<()> {
        self.ensure_usable()?;
        let mut writer = self.writer.lock().await;
        self.ensure_not_broken()?;
        let Some(write) = writer.as_mut() else {
            return Err(self.broken_error());
        };
        if self.transaction_status() != TransactionStatus::Idle {
            return Err(Error::InvalidState {
                expected: "no transaction in progress".into(),
                actual: format!("{:?}", self.transaction_status()),
            });
        }
        write.write_raw(self, &pregenerated::BEGIN).await?;
        self.prepended.fetch_add(1, Ordering::AcqRel);
        self.set_transaction_status(TransactionStatus::Pending);
        self.api_transaction.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        match self.state.transition(ConnectorState::Ready, ConnectorState::Closed) {
            Ok(()) => {}
            Err(ConnectorState::Broken | ConnectorState::Closed) => return Ok(()),
            Err(ConnectorState::Connecting) => {
                return Err(Error::InvalidState {
                    expected: ConnectorState::Ready.to_string(),
                    actual: ConnectorState::Connecting.to_string(),
                })
            }
            Err(_) => {
                return Err(Error::OperationInProgress {
                    command: self.current_command(),
                })
            }
        }

        self.shutdown.cancel();
        if let Some(mut write) = self.writer.lock().await.take() {
            write.terminate().await;
        }
        self.reader.lock().await.take();
        lock(&self.parameters).clear();
        tracing::info!(connector = self.id, "connector closed");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum TlsAttempt {
    Plain,
    Negotiate { required: bool },
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A physical connection to a server
///
/// Opened with [`Connector::open`]. Work happens inside user actions
/// ([`Connector::start_user_action`]) which hold exclusive use of the wire.
/// On a connector opened with `multiplexing`, commands go through
/// [`Connector::multiplexed`] instead and may be pipelined by many tasks.
pub struct Connector {
    core: Arc<ConnectorCore>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("id", &self.core.id)
            .field("state", &self.core.state())
            .field("host", &self.core.settings.host)
            .field("port", &self.core.settings.port)
            .finish()
    }
}

impl Connector {
    /// Open a connector with fresh cluster and database caches
    pub async fn open(settings: Settings) -> Result<Self> {
        Self::open_with(settings, ConnectorContext::new()).await
    }

    /// Open a connector sharing the caches and pool of `context`
    ///
    /// Runs connect, TLS negotiation, startup and authentication under
    /// `connect_timeout`. Any failure breaks the connector and is returned.
    pub async fn open_with(settings: Settings, context: ConnectorContext) -> Result<Self> {
        let settings = Arc::new(settings);
        let span = tracing::info_span!(
            "open",
            host = %settings.host,
            port = settings.port,
            database = %settings.database,
            user = %settings.user
        );

        async move {
            let started = Instant::now();
            let core = Arc::new(ConnectorCore::new(settings.clone(), context));

            let result = match tokio::time::timeout(settings.connect_timeout, core.establish()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout),
            };
            if let Err(e) = result {
                core.break_with(e.clone());
                return Err(e);
            }
            if let Err(actual) = core
                .state
                .transition(ConnectorState::Connecting, ConnectorState::Ready)
            {
                return Err(Error::InvalidState {
                    expected: ConnectorState::Connecting.to_string(),
                    actual: actual.to_string(),
                });
            }

            core.context.cluster.update(
                &settings.host,
                settings.port,
                ClusterState::Online,
                Instant::now(),
            );
            core.record_database_info().await;
            counters::connector_opened(core.is_secure());
            histograms::open_duration(started.elapsed().as_millis() as u64);

            let mut tasks = Vec::new();
            if let Some(interval) = settings.keepalive {
                tasks.push(keepalive::spawn(Arc::downgrade(&core), interval));
            }
            if settings.multiplexing {
                tasks.push(multiplex::spawn(core.clone()));
            }

            tracing::info!(connector = core.id, secure = core.is_secure(), "connector ready");
            Ok(Connector { core, tasks })
        }
        .instrument(span)
        .await
    }

    pub(crate) fn core(&self) -> &Arc<ConnectorCore> {
        &self.core
    }

    /// Process-unique identifier
    pub fn id(&self) -> ConnectorId {
        self.core.id
    }

    /// Current state
    pub fn state(&self) -> ConnectorState {
        self.core.state()
    }

    /// Transaction status from the last ReadyForQuery
    pub fn transaction_status(&self) -> TransactionStatus {
        self.core.transaction_status()
    }

    /// Backend key used for cancel requests
    pub fn backend_key(&self) -> Option<BackendKey> {
        self.core.backend_key()
    }

    /// Whether the session runs over TLS
    pub fn is_secure(&self) -> bool {
        self.core.is_secure()
    }

    /// Last value reported for a server parameter
    pub fn parameter(&self, name: &str) -> Option<String> {
        self.core.parameter(name)
    }

    /// All server parameters reported so far
    pub fn parameters(&self) -> HashMap<String, String> {
        self.core.parameters()
    }

    /// Reason the connector broke, if it did
    pub fn break_reason(&self) -> Option<&Error> {
        self.core.break_reason.get()
    }

    /// Whether the connector is broken
    pub fn is_broken(&self) -> bool {
        self.core.is_broken()
    }

    /// Settings the connector was opened with
    pub fn settings(&self) -> &Settings {
        self.core.settings()
    }

    /// Metadata of the connected database
    pub fn database_info(&self) -> Option<Arc<DatabaseInfo>> {
        self.core.context.databases.get(&DatabaseKey {
            host: self.core.settings.host.clone(),
            port: self.core.settings.port,
            database: self.core.settings.database.clone(),
        })
    }

    /// Acquire exclusive use of the connector
    ///
    /// Fails with [`Error::OperationInProgress`] if another action holds it.
    pub async fn start_user_action(
        &self,
        state: ConnectorState,
        options: ActionOptions,
    ) -> Result<UserAction<'_>> {
        UserAction::start(&self.core, state, options).await
    }

    /// Run a simple query and collect its results
    pub async fn simple_query(&self, sql: &str) -> Result<Vec<SimpleQueryMessage>> {
        self.simple_query_with(sql, ActionOptions::default()).await
    }

    /// Run a simple query with a cancellation token or timeout override
    pub async fn simple_query_with(
        &self,
        sql: &str,
        mut options: ActionOptions,
    ) -> Result<Vec<SimpleQueryMessage>> {
        options.command.get_or_insert_with(|| sql.to_string());
        let mut action = self
            .start_user_action(ConnectorState::Executing, options)
            .await?;
        action.send(&FrontendMessage::Query(sql.to_string())).await?;
        action.set_state(ConnectorState::Fetching);

        let mut results = Vec::new();
        loop {
            match action.read_message().await? {
                BackendMessage::RowDescription(fields) => {
                    results.push(SimpleQueryMessage::RowDescription(fields));
                }
                BackendMessage::DataRow(_) => {
                    let row = action.data_row().await?.to_owned_fields()?;
                    results.push(SimpleQueryMessage::Row(row));
                }
                BackendMessage::CommandComplete(tag) => {
                    results.push(SimpleQueryMessage::CommandComplete(tag));
                }
                BackendMessage::ReadyForQuery(_) => return Ok(results),
                BackendMessage::CopyInResponse(_) => {
                    let reason = "COPY FROM STDIN is not supported by simple_query";
                    action.send(&FrontendMessage::CopyFail(reason.into())).await?;
                }
                _ => {}
            }
        }
    }

    /// Wait for a LISTEN/NOTIFY notification
    ///
    /// Returns `Ok(None)` once `timeout` elapses with nothing received.
    pub async fn wait_for_notification(&self, timeout: Option<Duration>) -> Result<Option<Notification>> {
        let mut action = self
            .start_user_action(ConnectorState::Waiting, ActionOptions::default())
            .await?;
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        if !action.wait_idle(deadline).await? {
            return Ok(None);
        }
        let options = ReadOptions {
            notifications: true,
            ..ReadOptions::default()
        };
        match action.read_message_with(options).await? {
            BackendMessage::NotificationResponse(notification) => Ok(Some(notification)),
            other => Err(action.fail(Error::Protocol(format!(
                "unexpected {} while waiting for notifications",
                other.name()
            )))),
        }
    }

    /// Queue `BEGIN` ahead of the next command
    ///
    /// Costs no round-trip; the transaction status is `Pending` until the
    /// server confirms.
    pub async fn begin_transaction(&self) -> Result<()> {
        self.core.begin_transaction().await
    }

    /// Prepare the connector for reuse by another client
    pub async fn reset(&self) -> Result<()> {
        self.core.reset().await
    }

    /// Break the connector with `reason`
    ///
    /// Idempotent: the first reason sticks.
    pub fn break_connector(&self, reason: Error) {
        self.core.break_with(reason);
    }

    /// Send Terminate and close the session
    pub async fn close(&self) -> Result<()> {
        self.core.close().await
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.core.shutdown.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}
