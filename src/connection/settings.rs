//! Connector settings

use super::tls::SslMode;
use crate::auth::PasswordRequest;
use crate::protocol::{ErrorFields, Notification};
use crate::{BoxError, Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Callback resolving a password when none is configured
pub type PasswordProvider =
    Arc<dyn Fn(&PasswordRequest<'_>) -> std::result::Result<String, BoxError> + Send + Sync>;

/// Callback invoked for every NoticeResponse
pub type NoticeHandler = Arc<dyn Fn(&ErrorFields) + Send + Sync>;

/// Callback invoked for every NotificationResponse not explicitly waited for
pub type NotificationHandler = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Default port
pub const DEFAULT_PORT: u16 = 5432;

/// Default read/write buffer size
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Connector settings
///
/// Built with [`Settings::builder`]. Fields are public for inspection; the
/// builder validates combinations.
#[derive(Clone)]
pub struct Settings {
    /// Host name, IP address, or Unix socket directory (starts with `/`)
    pub host: String,
    /// Port
    pub port: u16,
    /// Database
    pub database: String,
    /// Username
    pub user: String,
    /// Password
    pub password: Option<String>,
    /// Password callback, consulted when `password` is unset
    pub password_provider: Option<PasswordProvider>,
    /// Password file (default `PGPASSFILE` or `~/.pgpass`)
    pub passfile: Option<PathBuf>,
    /// `application_name` startup parameter
    pub application_name: Option<String>,
    /// `search_path` startup parameter
    pub search_path: Option<String>,
    /// `TimeZone` startup parameter
    pub timezone: Option<String>,
    /// `options` startup parameter
    pub options: Option<String>,
    /// `replication` startup parameter
    pub replication: Option<String>,
    /// Client encoding (default `UTF8`)
    pub client_encoding: String,
    /// TLS mode
    pub ssl_mode: SslMode,
    /// Root certificate (PEM) used to verify the server
    pub ssl_root_cert: Option<PathBuf>,
    /// Client certificate (PEM)
    pub ssl_cert: Option<PathBuf>,
    /// Client private key (PEM)
    pub ssl_key: Option<PathBuf>,
    /// Client private key passphrase
    pub ssl_key_password: Option<String>,
    /// Read buffer size
    pub read_buffer_size: usize,
    /// Write buffer size
    pub write_buffer_size: usize,
    /// Timeout for the whole open sequence
    pub connect_timeout: Duration,
    /// Per-read timeout while a command runs (`None` = wait forever)
    pub command_timeout: Option<Duration>,
    /// Grace period after a cancel request before the read is aborted
    pub cancellation_timeout: Duration,
    /// Send a server-side cancel request before aborting
    pub server_side_cancel: bool,
    /// Idle keepalive probe interval (`None` = disabled)
    pub keepalive: Option<Duration>,
    /// TCP keepalive idle time
    pub tcp_keepalive_time: Option<Duration>,
    /// TCP keepalive probe interval
    pub tcp_keepalive_interval: Option<Duration>,
    /// Socket receive buffer size
    pub socket_recv_buffer: Option<usize>,
    /// Socket send buffer size
    pub socket_send_buffer: Option<usize>,
    /// Share the connector between many logical commands
    pub multiplexing: bool,
    /// Queue `DISCARD ALL` when the connector is reset for reuse
    pub reset_on_release: bool,
    /// Notice callback
    pub notice_handler: Option<NoticeHandler>,
    /// Notification callback
    pub notification_handler: Option<NotificationHandler>,
}

impl Settings {
    /// Create a builder with defaults
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let settings = Settings::builder()
    ///     .host("db.internal")
    ///     .database("app")
    ///     .user("app")
    ///     .ssl_mode(SslMode::Prefer)
    ///     .build()?;
    /// ```
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::default()
    }

    /// Whether the host names a Unix socket directory
    pub fn is_unix_socket(&self) -> bool {
        self.host.starts_with('/')
    }

    /// Startup message parameters
    pub(crate) fn startup_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("user".to_string(), self.user.clone()),
            ("client_encoding".to_string(), self.client_encoding.clone()),
            ("database".to_string(), self.database.clone()),
        ];
        let optional = [
            ("application_name", &self.application_name),
            ("search_path", &self.search_path),
            ("TimeZone", &self.timezone),
            ("options", &self.options),
            ("replication", &self.replication),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                params.push((name.to_string(), value.clone()));
            }
        }
        params
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("ssl_mode", &self.ssl_mode)
            .field("read_buffer_size", &self.read_buffer_size)
            .field("write_buffer_size", &self.write_buffer_size)
            .field("command_timeout", &self.command_timeout)
            .field("keepalive", &self.keepalive)
            .field("multiplexing", &self.multiplexing)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Settings`]
#[derive(Clone)]
pub struct SettingsBuilder {
    settings: Settings,
    database_set: bool,
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        let user = whoami::username();
        Self {
            settings: Settings {
                host: "localhost".into(),
                port: DEFAULT_PORT,
                database: user.clone(),
                user,
                password: None,
                password_provider: None,
                passfile: None,
                application_name: None,
                search_path: None,
                timezone: None,
                options: None,
                replication: None,
                client_encoding: "UTF8".into(),
                ssl_mode: SslMode::default(),
                ssl_root_cert: None,
                ssl_cert: None,
                ssl_key: None,
                ssl_key_password: None,
                read_buffer_size: DEFAULT_BUFFER_SIZE,
                write_buffer_size: DEFAULT_BUFFER_SIZE,
                connect_timeout: Duration::from_secs(15),
                command_timeout: Some(Duration::from_secs(30)),
                cancellation_timeout: Duration::from_secs(2),
                server_side_cancel: true,
                keepalive: None,
                tcp_keepalive_time: None,
                tcp_keepalive_interval: None,
                socket_recv_buffer: None,
                socket_send_buffer: None,
                multiplexing: false,
                reset_on_release: true,
                notice_handler: None,
                notification_handler: None,
            },
            database_set: false,
        }
    }
}

impl SettingsBuilder {
    /// Host name, IP address, or Unix socket directory
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.settings.host = host.into();
        self
    }

    /// Port (default 5432)
    pub fn port(mut self, port: u16) -> Self {
        self.settings.port = port;
        self
    }

    /// Database (defaults to the username)
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.settings.database = database.into();
        self.database_set = true;
        self
    }

    /// Username (defaults to the OS user)
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.settings.user = user.into();
        self
    }

    /// Password
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.settings.password = Some(password.into());
        self
    }

    /// Password callback, used when no password is configured
    pub fn password_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn(&PasswordRequest<'_>) -> std::result::Result<String, BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.settings.password_provider = Some(Arc::new(provider));
        self
    }

    /// Password file location
    pub fn passfile(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.passfile = Some(path.into());
        self
    }

    /// Application name reported to the server
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.settings.application_name = Some(name.into());
        self
    }

    /// Initial `search_path`
    pub fn search_path(mut self, path: impl Into<String>) -> Self {
        self.settings.search_path = Some(path.into());
        self
    }

    /// Session time zone
    pub fn timezone(mut self, tz: impl Into<String>) -> Self {
        self.settings.timezone = Some(tz.into());
        self
    }

    /// Command-line options sent to the backend
    pub fn options(mut self, options: impl Into<String>) -> Self {
        self.settings.options = Some(options.into());
        self
    }

    /// Replication mode (`true`, `database`)
    pub fn replication(mut self, mode: impl Into<String>) -> Self {
        self.settings.replication = Some(mode.into());
        self
    }

    /// Client encoding
    pub fn client_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.settings.client_encoding = encoding.into();
        self
    }

    /// TLS mode
    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.settings.ssl_mode = mode;
        self
    }

    /// Root certificate file (PEM)
    pub fn ssl_root_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.ssl_root_cert = Some(path.into());
        self
    }

    /// Client certificate and key files (PEM)
    pub fn ssl_client_cert(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.settings.ssl_cert = Some(cert.into());
        self.settings.ssl_key = Some(key.into());
        self
    }

    /// Client certificate file alone; `build` fails unless a key is set too
    pub fn ssl_cert_path(mut self, cert: impl Into<PathBuf>) -> Self {
        self.settings.ssl_cert = Some(cert.into());
        self
    }

    /// Client key file alone; `build` fails unless a certificate is set too
    pub fn ssl_key_path(mut self, key: impl Into<PathBuf>) -> Self {
        self.settings.ssl_key = Some(key.into());
        self
    }

    /// Client key passphrase
    pub fn ssl_key_password(mut self, password: impl Into<String>) -> Self {
        self.settings.ssl_key_password = Some(password.into());
        self
    }

    /// Read buffer size
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.settings.read_buffer_size = size;
        self
    }

    /// Write buffer size
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.settings.write_buffer_size = size;
        self
    }

    /// Timeout for connecting, TLS negotiation and authentication
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.settings.connect_timeout = timeout;
        self
    }

    /// Per-read command timeout (`None` = no timeout)
    pub fn command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.settings.command_timeout = timeout;
        self
    }

    /// Grace period between a cancel request and aborting the read
    pub fn cancellation_timeout(mut self, timeout: Duration) -> Self {
        self.settings.cancellation_timeout = timeout;
        self
    }

    /// Whether to send a server-side cancel request before aborting
    pub fn server_side_cancel(mut self, enabled: bool) -> Self {
        self.settings.server_side_cancel = enabled;
        self
    }

    /// Idle keepalive probe interval
    pub fn keepalive(mut self, interval: Duration) -> Self {
        self.settings.keepalive = Some(interval);
        self
    }

    /// TCP keepalive idle time and probe interval
    pub fn tcp_keepalive(mut self, time: Duration, interval: Duration) -> Self {
        self.settings.tcp_keepalive_time = Some(time);
        self.settings.tcp_keepalive_interval = Some(interval);
        self
    }

    /// Socket receive and send buffer sizes
    pub fn socket_buffers(mut self, recv: usize, send: usize) -> Self {
        self.settings.socket_recv_buffer = Some(recv);
        self.settings.socket_send_buffer = Some(send);
        self
    }

    /// Enable multiplexing
    pub fn multiplexing(mut self, enabled: bool) -> Self {
        self.settings.multiplexing = enabled;
        self
    }

    /// Queue `DISCARD ALL` on reset (default true)
    pub fn reset_on_release(mut self, enabled: bool) -> Self {
        self.settings.reset_on_release = enabled;
        self
    }

    /// Notice callback
    pub fn notice_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ErrorFields) + Send + Sync + 'static,
    {
        self.settings.notice_handler = Some(Arc::new(handler));
        self
    }

    /// Notification callback
    pub fn notification_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.settings.notification_handler = Some(Arc::new(handler));
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<Settings> {
        let mut settings = self.settings;
        if !self.database_set {
            settings.database = settings.user.clone();
        }
        if settings.host.is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        if settings.user.is_empty() {
            return Err(Error::Config("user must not be empty".into()));
        }
        if settings.is_unix_socket() && settings.ssl_mode.requires_tls() {
            return Err(Error::Config(format!(
                "sslmode={} cannot be used with a Unix socket",
                settings.ssl_mode
            )));
        }
        if settings.ssl_cert.is_some() != settings.ssl_key.is_some() {
            return Err(Error::Config(
                "client certificate and key must be configured together".into(),
            ));
        }
        if settings.multiplexing && settings.keepalive.is_some() {
            return Err(Error::Config(
                "keepalive cannot be combined with multiplexing".into(),
            ));
        }
        if settings.keepalive == Some(Duration::ZERO) {
            return Err(Error::Config("keepalive interval must be positive".into()));
        }
        Ok(settings)
    }
}
