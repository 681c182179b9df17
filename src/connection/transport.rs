//! Transport abstraction (TCP with optional TLS vs Unix socket)

use super::settings::Settings;
use super::tls;
use crate::protocol::{encode_message, FrontendMessage};
use crate::{Error, Result};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

/// Byte stream to the server
#[allow(clippy::large_enum_variant)]
pub enum Stream {
    /// Plain TCP connection
    Plain(TcpStream),
    /// TLS-encrypted TCP connection
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
    /// Unix domain socket
    #[cfg(unix)]
    Unix(UnixStream),
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stream::Plain(_) => f.write_str("Stream::Plain(TcpStream)"),
            Stream::Tls(_) => f.write_str("Stream::Tls(TlsStream)"),
            #[cfg(unix)]
            Stream::Unix(_) => f.write_str("Stream::Unix(UnixStream)"),
        }
    }
}

impl Stream {
    /// Open the raw connection described by `settings`
    ///
    /// TCP sockets get `TCP_NODELAY` plus any configured keepalive and
    /// buffer-size tuning before use.
    pub async fn connect(settings: &Settings) -> Result<Self> {
        if settings.is_unix_socket() {
            return Self::connect_unix(settings).await;
        }

        let stream = TcpStream::connect((settings.host.as_str(), settings.port)).await?;
        configure_socket(&stream, settings);
        tracing::debug!(host = %settings.host, port = settings.port, "TCP connection established");
        Ok(Stream::Plain(stream))
    }

    #[cfg(unix)]
    async fn connect_unix(settings: &Settings) -> Result<Self> {
        let path = format!(
            "{}/.s.PGSQL.{}",
            settings.host.trim_end_matches('/'),
            settings.port
        );
        let stream = UnixStream::connect(&path).await?;
        tracing::debug!(path, "Unix socket connection established");
        Ok(Stream::Unix(stream))
    }

    #[cfg(not(unix))]
    async fn connect_unix(_settings: &Settings) -> Result<Self> {
        Err(Error::NotSupported(
            "Unix domain sockets on this platform".into(),
        ))
    }

    /// Whether the stream is TLS-encrypted
    pub fn is_secure(&self) -> bool {
        matches!(self, Stream::Tls(_))
    }

    /// Negotiate TLS via the SSLRequest protocol.
    ///
    /// Sends the 8-byte SSLRequest and reads the server's single-byte
    /// response. `S` upgrades the stream; `N` keeps it plain unless
    /// `required`, in which case the connection fails.
    pub async fn negotiate_tls(self, settings: &Settings, required: bool) -> Result<Self> {
        let mut tcp = match self {
            Stream::Plain(tcp) => tcp,
            Stream::Tls(_) => {
                return Err(Error::Config("transport is already TLS-encrypted".into()))
            }
            #[cfg(unix)]
            Stream::Unix(_) => {
                return Err(Error::Config("cannot upgrade Unix socket to TLS".into()))
            }
        };

        tcp.write_all(&encode_message(&FrontendMessage::SslRequest))
            .await?;
        tcp.flush().await?;

        match tcp.read_u8().await? {
            b'S' => {
                tracing::debug!("server accepted TLS, upgrading connection");
                let config = tls::client_config(settings)?;
                let server_name = tls::server_name(&settings.host)?;
                let connector = tokio_rustls::TlsConnector::from(config);
                let tls_stream = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| Error::tls("exception while performing SSL handshake", e))?;
                tracing::info!("TLS connection established");
                Ok(Stream::Tls(tls_stream))
            }
            b'N' if !required => {
                tracing::debug!("server rejected TLS, continuing in plaintext");
                Ok(Stream::Plain(tcp))
            }
            b'N' => Err(Error::Config(format!(
                "server does not support TLS (sslmode={})",
                settings.ssl_mode
            ))),
            other => Err(Error::Protocol(format!(
                "unexpected SSLRequest response byte: 0x{:02X}",
                other
            ))),
        }
    }
}

fn configure_socket(stream: &TcpStream, settings: &Settings) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!("failed to set TCP_NODELAY: {}", e);
    }

    let socket = socket2::SockRef::from(stream);

    if let Some(time) = settings.tcp_keepalive_time {
        let mut keepalive = socket2::TcpKeepalive::new().with_time(time);
        if let Some(interval) = settings.tcp_keepalive_interval {
            keepalive = keepalive.with_interval(interval);
        }
        if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
            tracing::warn!("failed to configure TCP keepalive: {}", e);
        }
    }
    if let Some(size) = settings.socket_recv_buffer {
        if let Err(e) = socket.set_recv_buffer_size(size) {
            tracing::warn!("failed to set socket receive buffer: {}", e);
        }
    }
    if let Some(size) = settings.socket_send_buffer {
        if let Err(e) = socket.set_send_buffer_size(size) {
            tracing::warn!("failed to set socket send buffer: {}", e);
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
