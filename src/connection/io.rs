//! Read and write halves of a connector
//!
//! The read side owns the message loop: it drains prepended responses,
//! dispatches out-of-band messages, stashes server errors until their
//! ReadyForQuery and escalates timeouts and cancellation.

use super::conn::ConnectorCore;
use super::state::ConnectorState;
use super::transport::Stream;
use crate::buffer::{DataRowView, FillError, ReadBuffer, ReadLimits, WriteBuffer};
use crate::error::ServerError;
use crate::protocol::constants::tags;
use crate::protocol::{
    decode_body, validate_header, BackendMessage, DataRowHeader, FrontendMessage,
};
use crate::{Error, Result};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How data rows are delivered by `read_message`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RowMode {
    /// Return each DataRow header; fields are read with `data_row`
    #[default]
    Default,
    /// Skip data rows without materializing them
    Skip,
}

/// Options for one `read_message` call
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Row delivery
    pub rows: RowMode,
    /// Return NotificationResponse to the caller instead of the handler
    pub notifications: bool,
}

impl ReadOptions {
    /// Skip data rows
    pub fn skip_rows() -> Self {
        Self {
            rows: RowMode::Skip,
            notifications: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Cancelled,
    Timeout,
}

impl Interrupt {
    fn into_error(self) -> Error {
        match self {
            Interrupt::Cancelled => Error::Cancelled,
            Interrupt::Timeout => Error::Timeout,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum CancelPhase {
    Idle,
    /// A cancel request went out; the read is aborted at `deadline`
    Requested { reason: Interrupt, deadline: Instant },
}

/// Cancellation state of the operation currently using the read side
#[derive(Debug)]
struct ActionCtx {
    token: Option<CancellationToken>,
    timeout: Option<Duration>,
    phase: CancelPhase,
}

impl Default for ActionCtx {
    fn default() -> Self {
        Self {
            token: None,
            timeout: None,
            phase: CancelPhase::Idle,
        }
    }
}

enum Need {
    Bytes(usize),
    PendingRow,
}

/// Read half of a connector
pub(crate) struct ReadSide {
    stream: ReadHalf<Stream>,
    buf: ReadBuffer,
    /// Unconsumed field bytes of the last DataRow
    pending_row: usize,
    /// Field count of the last DataRow while its fields are still readable
    row_fields: Option<u16>,
    stashed: Option<Error>,
    /// User-level ReadyForQuery messages seen so far
    ready_count: u64,
    action: ActionCtx,
}

impl ReadSide {
    pub(crate) fn new(stream: ReadHalf<Stream>, buffer_size: usize) -> Self {
        Self {
            stream,
            buf: ReadBuffer::new(buffer_size),
            pending_row: 0,
            row_fields: None,
            stashed: None,
            ready_count: 0,
            action: ActionCtx::default(),
        }
    }

    /// Reset per-operation cancellation state
    pub(crate) fn begin_action(&mut self, token: Option<CancellationToken>, timeout: Option<Duration>) {
        self.action = ActionCtx {
            token,
            timeout,
            phase: CancelPhase::Idle,
        };
        self.stashed = None;
    }

    pub(crate) fn ready_count(&self) -> u64 {
        self.ready_count
    }

    pub(crate) fn buffer(&self) -> &ReadBuffer {
        &self.buf
    }

    /// Return to the regular arena; buffered bytes are kept
    pub(crate) fn restore_buffer(&mut self) {
        self.buf.restore();
    }

    /// Read the next message addressed to the caller
    pub(crate) async fn read_message(
        &mut self,
        core: &ConnectorCore,
        options: ReadOptions,
    ) -> Result<BackendMessage> {
        core.ensure_not_broken()?;
        loop {
            self.finish_pending_row(core).await?;

            self.wait_for(core, Need::Bytes(5)).await?;
            let tag = self.buf.read_u8();
            let len = self.buf.read_i32();
            let body_len = validate_header(tag, len).map_err(|e| core.fail(e))?;
            let prepended = core.has_prepended();

            if tag == tags::DATA_ROW {
                if body_len < 2 {
                    return Err(core.fail(Error::Protocol(format!(
                        "data row body of {} bytes is too short",
                        body_len
                    ))));
                }
                self.wait_for(core, Need::Bytes(2)).await?;
                let field_count = self.buf.read_i16();
                if field_count < 0 {
                    return Err(core.fail(Error::Protocol(format!(
                        "negative field count {} in data row",
                        field_count
                    ))));
                }
                self.pending_row = body_len - 2;
                if prepended || options.rows == RowMode::Skip {
                    continue;
                }
                self.row_fields = Some(field_count as u16);
                return Ok(BackendMessage::DataRow(DataRowHeader {
                    field_count: field_count as u16,
                    len: self.pending_row,
                }));
            }

            self.wait_for(core, Need::Bytes(body_len)).await?;
            let msg = decode_body(tag, self.buf.peek(body_len)).map_err(|e| core.fail(e))?;
            self.buf.consume(body_len);

            match msg {
                BackendMessage::NoticeResponse(fields) => core.on_notice(&fields),
                BackendMessage::NotificationResponse(notification) => {
                    if options.notifications && !prepended {
                        return Ok(BackendMessage::NotificationResponse(notification));
                    }
                    core.on_notification(&notification);
                }
                BackendMessage::ParameterStatus { name, value } => {
                    core.set_parameter(name, value);
                }
                BackendMessage::ErrorResponse(fields) => {
                    let err = ServerError::new(fields);
                    if prepended {
                        tracing::error!(error = %err, "prepended command failed");
                        return Err(core.fail(Error::Server(Box::new(err))));
                    }
                    if let Some(err) = self.on_server_error(core, err) {
                        return Err(err);
                    }
                }
                BackendMessage::ReadyForQuery(status) => {
                    if prepended {
                        core.complete_prepended();
                        continue;
                    }
                    core.on_ready_for_query(status)?;
                    self.ready_count += 1;
                    if let Some(err) = self.stashed.take() {
                        return Err(err);
                    }
                    return Ok(BackendMessage::ReadyForQuery(status));
                }
                _ if prepended => {}
                msg @ (BackendMessage::CopyInResponse(_)
                | BackendMessage::CopyOutResponse(_)
                | BackendMessage::CopyBothResponse(_)) => {
                    core.enter_copy();
                    return Ok(msg);
                }
                msg => return Ok(msg),
            }
        }
    }

    /// Handle an ErrorResponse; returns the error to raise now, if any
    fn on_server_error(&mut self, core: &ConnectorCore, err: ServerError) -> Option<Error> {
        tracing::debug!(code = err.code(), severity = err.severity(), "server error: {}", err.message());

        let cancelled = match self.action.phase {
            CancelPhase::Requested { reason, .. } if err.is_query_canceled() => Some(reason),
            _ => None,
        };
        let err = Error::Server(Box::new(err));

        // No ReadyForQuery follows during startup or after FATAL/PANIC
        if core.state() == ConnectorState::Connecting || err.is_fatal_to_connector() {
            return Some(if err.is_fatal_to_connector() {
                core.fail(err)
            } else {
                err
            });
        }

        let err = match cancelled {
            Some(reason) => {
                tracing::debug!("statement cancelled at our request");
                reason.into_error()
            }
            None => err,
        };
        if self.stashed.is_none() {
            self.stashed = Some(err);
        }
        None
    }

    /// Fields of the DataRow most recently returned
    pub(crate) async fn data_row(&mut self, core: &ConnectorCore) -> Result<DataRowView<'_>> {
        core.ensure_not_broken()?;
        let Some(field_count) = self.row_fields else {
            return Err(Error::InvalidState {
                expected: "positioned on a data row".into(),
                actual: "no current data row".into(),
            });
        };
        let len = self.pending_row;
        self.wait_for(core, Need::Bytes(len)).await?;
        Ok(DataRowView::new(self.buf.peek(len), field_count))
    }

    /// Wait until at least one byte is readable
    pub(crate) async fn wait_readable(&mut self, core: &ConnectorCore) -> Result<()> {
        self.finish_pending_row(core).await?;
        self.wait_for(core, Need::Bytes(1)).await
    }

    /// Wait for data until `deadline`; `Ok(false)` when nothing arrived
    ///
    /// No cancel request is sent on expiry: nothing is running server-side.
    pub(crate) async fn wait_idle(&mut self, core: &ConnectorCore, deadline: Option<Instant>) -> Result<bool> {
        self.finish_pending_row(core).await?;
        let limits = ReadLimits {
            deadline,
            cancel: self.action.token.as_ref(),
            abort: Some(core.shutdown_token()),
        };
        match self.buf.ensure(&mut self.stream, 1, &limits).await {
            Ok(()) => Ok(true),
            Err(FillError::Timeout) => Ok(false),
            Err(FillError::Cancelled) => Err(Error::Cancelled),
            Err(e) => Err(fill_failure(core, e)),
        }
    }

    /// Discard messages until `ready_count` moves past `start`
    pub(crate) async fn drain_until_ready(&mut self, core: &ConnectorCore, start: u64) -> Result<()> {
        while self.ready_count == start {
            if let Err(e) = self.read_message(core, ReadOptions::skip_rows()).await {
                if core.is_broken() {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Discard responses of commands an earlier operation abandoned
    pub(crate) async fn drain_abandoned(&mut self, core: &ConnectorCore) -> Result<()> {
        while core.outstanding() > 0 {
            tracing::debug!(outstanding = core.outstanding(), "draining abandoned responses");
            let start = self.ready_count;
            self.drain_until_ready(core, start).await?;
        }
        Ok(())
    }

    async fn finish_pending_row(&mut self, core: &ConnectorCore) -> Result<()> {
        self.row_fields = None;
        if self.pending_row > 0 {
            self.wait_for(core, Need::PendingRow).await?;
        }
        self.buf.restore();
        Ok(())
    }

    async fn wait_for(&mut self, core: &ConnectorCore, need: Need) -> Result<()> {
        loop {
            let (deadline, cancel) = match self.action.phase {
                CancelPhase::Idle => (
                    self.action.timeout.map(|t| Instant::now() + t),
                    self.action.token.as_ref(),
                ),
                CancelPhase::Requested { deadline, .. } => (Some(deadline), None),
            };
            let limits = ReadLimits {
                deadline,
                cancel,
                abort: Some(core.shutdown_token()),
            };
            let result = match need {
                Need::Bytes(n) => self.buf.ensure(&mut self.stream, n, &limits).await,
                Need::PendingRow => {
                    self.buf
                        .skip(&mut self.stream, &mut self.pending_row, &limits)
                        .await
                }
            };

            let interrupt = match result {
                Ok(()) => return Ok(()),
                Err(FillError::Cancelled) => Interrupt::Cancelled,
                Err(FillError::Timeout) => match self.action.phase {
                    CancelPhase::Idle => Interrupt::Timeout,
                    CancelPhase::Requested { reason, .. } => {
                        tracing::warn!("no response to cancel request, aborting read");
                        return Err(core.fail(reason.into_error()));
                    }
                },
                Err(e) => return Err(fill_failure(core, e)),
            };
            self.interrupt(core, interrupt)?;
        }
    }

    /// First tier: ask the server to cancel, then keep reading for a grace period
    fn interrupt(&mut self, core: &ConnectorCore, reason: Interrupt) -> Result<()> {
        if core.request_cancel() {
            tracing::info!(?reason, "cancel request sent");
            self.action.phase = CancelPhase::Requested {
                reason,
                deadline: Instant::now() + core.settings().cancellation_timeout,
            };
            Ok(())
        } else {
            Err(core.fail(reason.into_error()))
        }
    }
}

fn fill_failure(core: &ConnectorCore, err: FillError) -> Error {
    match err {
        FillError::Aborted => core.broken_error(),
        FillError::Eof => core.fail(Error::ConnectionClosed),
        FillError::Io(e) => core.fail(e.into()),
        FillError::Timeout => core.fail(Error::Timeout),
        FillError::Cancelled => core.fail(Error::Cancelled),
    }
}

/// Write half of a connector
pub(crate) struct WriteSide {
    stream: WriteHalf<Stream>,
    buf: WriteBuffer,
}

impl WriteSide {
    pub(crate) fn new(stream: WriteHalf<Stream>, buffer_size: usize) -> Self {
        Self {
            stream,
            buf: WriteBuffer::new(buffer_size),
        }
    }

    /// Buffer a message, flushing first when the buffer is full
    pub(crate) async fn write(&mut self, core: &ConnectorCore, msg: &FrontendMessage) -> Result<()> {
        core.ensure_not_broken()?;
        if matches!(msg, FrontendMessage::Query(_) | FrontendMessage::Sync) {
            core.expect_response();
        }
        let timeout = core.write_timeout();
        let result = with_timeout(timeout, self.buf.write_message(&mut self.stream, msg)).await;
        result.map_err(|e| core.fail(e))
    }

    /// Buffer a pregenerated blob
    pub(crate) async fn write_raw(&mut self, core: &ConnectorCore, bytes: &[u8]) -> Result<()> {
        core.ensure_not_broken()?;
        let timeout = core.write_timeout();
        let result = with_timeout(timeout, self.buf.write_raw(&mut self.stream, bytes)).await;
        result.map_err(|e| core.fail(e))
    }

    /// Write out everything buffered
    pub(crate) async fn flush(&mut self, core: &ConnectorCore) -> Result<()> {
        core.ensure_not_broken()?;
        let timeout = core.write_timeout();
        let result = with_timeout(timeout, self.buf.flush(&mut self.stream)).await;
        result.map_err(|e| core.fail(e))
    }

    /// Write and flush one message
    pub(crate) async fn send(&mut self, core: &ConnectorCore, msg: &FrontendMessage) -> Result<()> {
        self.write(core, msg).await?;
        self.flush(core).await
    }

    /// Drop buffered, unsent bytes
    pub(crate) fn clear(&mut self) {
        self.buf.clear();
    }

    /// Send Terminate and shut the stream down, ignoring failures
    pub(crate) async fn terminate(&mut self) {
        self.buf.clear();
        let _ = self
            .buf
            .write_message(&mut self.stream, &FrontendMessage::Terminate)
            .await;
        let _ = self.buf.flush(&mut self.stream).await;
        let _ = self.stream.shutdown().await;
    }
}

async fn with_timeout<F>(timeout: Option<Duration>, fut: F) -> Result<()>
where
    F: Future<Output = io::Result<()>>,
{
    match timeout {
        Some(t) => tokio::time::timeout(t, fut)
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(Error::from),
        None => fut.await.map_err(Error::from),
    }
}
