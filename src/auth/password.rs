//! Password resolution
//!
//! Only consulted when the server actually asks for a password. Sources are
//! tried in order: the configured password, the password provider callback,
//! `PGPASSWORD`, then the password file.

use crate::connection::Settings;
use crate::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;

/// Connection details handed to a password provider
#[derive(Debug, Clone, Copy)]
pub struct PasswordRequest<'a> {
    /// Host (or Unix socket directory)
    pub host: &'a str,
    /// Port
    pub port: u16,
    /// Database
    pub database: &'a str,
    /// Username
    pub user: &'a str,
}

/// Resolve the password for `settings`
pub(crate) fn resolve_password(settings: &Settings) -> Result<String> {
    resolve_with(settings, |name| std::env::var(name).ok())
}

fn resolve_with(settings: &Settings, env: impl Fn(&str) -> Option<String>) -> Result<String> {
    if let Some(password) = &settings.password {
        return Ok(password.clone());
    }

    if let Some(provider) = &settings.password_provider {
        let request = PasswordRequest {
            host: &settings.host,
            port: settings.port,
            database: &settings.database,
            user: &settings.user,
        };
        return provider(&request).map_err(|e| Error::PasswordProvider(Arc::from(e)));
    }

    if let Some(password) = env("PGPASSWORD") {
        tracing::debug!("using password from PGPASSWORD");
        return Ok(password);
    }

    let passfile = settings
        .passfile
        .clone()
        .or_else(|| env("PGPASSFILE").map(PathBuf::from))
        .or_else(|| default_passfile(&env));

    if let Some(path) = passfile {
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let host = passfile_host(&settings.host);
                if let Some(password) = lookup_passfile(
                    &contents,
                    host,
                    settings.port,
                    &settings.database,
                    &settings.user,
                ) {
                    tracing::debug!(path = %path.display(), "using password from password file");
                    return Ok(password);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "could not read password file");
            }
        }
    }

    Err(Error::NoPassword {
        user: settings.user.clone(),
    })
}

#[cfg(windows)]
fn default_passfile(env: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    env("APPDATA").map(|dir| PathBuf::from(dir).join("postgresql").join("pgpass.conf"))
}

#[cfg(not(windows))]
fn default_passfile(env: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    env("HOME").map(|dir| PathBuf::from(dir).join(".pgpass"))
}

/// Unix socket connections match `localhost` entries
fn passfile_host(host: &str) -> &str {
    if host.starts_with('/') {
        "localhost"
    } else {
        host
    }
}

/// Find the first password file entry matching the connection
///
/// Lines are `host:port:database:username:password`; `*` matches anything
/// and `\:` / `\\` escape separators.
pub(crate) fn lookup_passfile(
    contents: &str,
    host: &str,
    port: u16,
    database: &str,
    user: &str,
) -> Option<String> {
    let port = port.to_string();
    contents
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(split_entry)
        .find(|fields| {
            matches(&fields[0], host)
                && matches(&fields[1], &port)
                && matches(&fields[2], database)
                && matches(&fields[3], user)
        })
        .map(|mut fields| fields.swap_remove(4))
}

fn matches(pattern: &str, value: &str) -> bool {
    pattern == "*" || pattern == value
}

fn split_entry(line: &str) -> Option<Vec<String>> {
    let mut fields = Vec::with_capacity(5);
    let mut current = String::new();
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            ':' if fields.len() < 4 => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);

    (fields.len() == 5).then_some(fields)
}
