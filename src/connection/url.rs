//! Connection URL parsing
//!
//! Supports:
//! * `postgres://[user[:password]@][host][:port][/database][?params]`
//! * `postgres:///database?host=/socket/dir` (Unix socket)
//!
//! Recognized parameters: `host`, `port`, `sslmode`, `sslrootcert`,
//! `sslcert`, `sslkey`, `application_name`, `options`, `connect_timeout`
//! (seconds), `keepalive` (seconds) and `multiplexing` (`true`/`false`).

use super::settings::SettingsBuilder;
use super::tls::SslMode;
use super::Settings;
use crate::{Error, Result};
use std::path::Path;
use std::time::Duration;

/// Default Unix socket directory, if one exists
fn default_socket_dir() -> Option<String> {
    ["/run/postgresql", "/var/run/postgresql", "/tmp"]
        .iter()
        .find(|dir| Path::new(dir).is_dir())
        .map(|dir| dir.to_string())
}

fn split_query(rest: &str) -> (&str, Vec<(&str, &str)>) {
    match rest.split_once('?') {
        Some((path, query)) => (
            path,
            query
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .collect(),
        ),
        None => (rest, Vec::new()),
    }
}

fn parse_port(value: &str) -> Result<u16> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("invalid port: {}", value)))
}

fn parse_seconds(name: &str, value: &str) -> Result<Duration> {
    value
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| Error::Config(format!("invalid {}: {}", name, value)))
}

impl SettingsBuilder {
    /// Start from a `postgres://` URL; later setters override URL values
    pub fn from_url(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("postgres://")
            .or_else(|| url.strip_prefix("postgresql://"))
            .ok_or_else(|| {
                Error::Config("connection URL must start with postgres://".into())
            })?;

        let mut builder = Settings::builder();
        let (path, params) = split_query(rest);

        let (auth, location) = match path.rsplit_once('@') {
            Some((auth, location)) => (Some(auth), location),
            None => (None, path),
        };
        if let Some(auth) = auth {
            builder = match auth.split_once(':') {
                Some((user, password)) => builder.user(user).password(password),
                None => builder.user(auth),
            };
        }

        let (host_port, database) = match location.split_once('/') {
            Some((host_port, database)) => (host_port, Some(database)),
            None => (location, None),
        };
        if let Some(database) = database.filter(|d| !d.is_empty()) {
            builder = builder.database(database);
        }

        if host_port.is_empty() {
            if let Some(dir) = default_socket_dir() {
                builder = builder.host(dir).ssl_mode(SslMode::Disable);
            }
        } else {
            builder = match host_port.rsplit_once(':') {
                Some((host, port)) => builder.host(host).port(parse_port(port)?),
                None => builder.host(host_port),
            };
        }

        for (key, value) in params {
            builder = match key {
                "host" => {
                    let builder = builder.host(value);
                    if value.starts_with('/') {
                        builder.ssl_mode(SslMode::Disable)
                    } else {
                        builder
                    }
                }
                "port" => builder.port(parse_port(value)?),
                "sslmode" => builder.ssl_mode(value.parse()?),
                "sslrootcert" => builder.ssl_root_cert(value),
                "sslcert" => builder.ssl_cert_path(value),
                "sslkey" => builder.ssl_key_path(value),
                "application_name" => builder.application_name(value),
                "options" => builder.options(value),
                "connect_timeout" => builder.connect_timeout(parse_seconds(key, value)?),
                "keepalive" => builder.keepalive(parse_seconds(key, value)?),
                "multiplexing" => builder.multiplexing(value == "true" || value == "1"),
                other => {
                    tracing::debug!(parameter = other, "ignoring unknown connection URL parameter");
                    builder
                }
            };
        }
        Ok(builder)
    }
}

impl std::str::FromStr for Settings {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SettingsBuilder::from_url(s)?.build()
    }
}
