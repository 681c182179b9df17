//! Startup authentication
//!
//! Supported server requests: no password (Ok), cleartext password and the
//! PBKDF2/HMAC-SHA256 password challenge. Anything else fails with
//! [`Error::NotSupported`] naming the request type.

mod password;
mod sha256;

pub use password::PasswordRequest;
pub use sha256::{compute_proof, derive_proof};

pub(crate) use password::resolve_password;

use crate::connection::{ConnectorCore, ReadOptions, ReadSide, WriteSide};
use crate::metrics::{counters, histograms, labels};
use crate::protocol::{AuthenticationMessage, BackendMessage, FrontendMessage};
use crate::{Error, Result};
use std::time::Instant;

/// Drive the authentication exchange up to AuthenticationOk
///
/// BackendKeyData, ParameterStatus and ReadyForQuery are left for the caller.
pub(crate) async fn authenticate(
    core: &ConnectorCore,
    read: &mut ReadSide,
    write: &mut WriteSide,
) -> Result<()> {
    let started = Instant::now();
    let mut mechanism = labels::MECHANISM_NONE;

    let result = run(core, read, write, &mut mechanism).await;
    match &result {
        Ok(()) => {
            tracing::debug!(mechanism, "authentication successful");
            counters::auth_successful(mechanism);
            histograms::auth_duration(mechanism, started.elapsed().as_millis() as u64);
        }
        Err(e) => {
            let reason = match e {
                Error::Server(_) => "server_error",
                Error::NoPassword { .. } | Error::PasswordProvider(_) => "no_password",
                Error::NotSupported(_) => "not_supported",
                _ => "protocol",
            };
            counters::auth_failed(mechanism, reason);
        }
    }
    result
}

async fn run(
    core: &ConnectorCore,
    read: &mut ReadSide,
    write: &mut WriteSide,
    mechanism: &mut &'static str,
) -> Result<()> {
    loop {
        let msg = read.read_message(core, ReadOptions::default()).await?;
        let auth = match msg {
            BackendMessage::Authentication(auth) => auth,
            other => {
                return Err(core.fail(Error::Protocol(format!(
                    "unexpected {} during authentication",
                    other.name()
                ))));
            }
        };

        match auth {
            AuthenticationMessage::Ok => return Ok(()),
            AuthenticationMessage::CleartextPassword => {
                *mechanism = labels::MECHANISM_CLEARTEXT;
                counters::auth_attempted(*mechanism);

                let password = resolve_password(core.settings())?;
                write
                    .send(core, &FrontendMessage::Password(password.into_bytes()))
                    .await?;
            }
            AuthenticationMessage::Sha256Password(challenge) => {
                *mechanism = labels::MECHANISM_SHA256;
                counters::auth_attempted(*mechanism);
                tracing::debug!(
                    iterations = challenge.iterations,
                    stored_method = challenge.stored_method,
                    "received password challenge"
                );

                let password = resolve_password(core.settings())?;
                let proof = derive_proof(&password, &challenge)?;
                write
                    .send(core, &FrontendMessage::Password(proof.into_bytes()))
                    .await?;

                return match read.read_message(core, ReadOptions::default()).await? {
                    BackendMessage::Authentication(AuthenticationMessage::Ok) => Ok(()),
                    other => Err(Error::Authentication(format!(
                        "expected AuthenticationOk after password challenge, got {}",
                        other.name()
                    ))),
                };
            }
            AuthenticationMessage::Md5Password { .. } => {
                return Err(Error::NotSupported(
                    "authentication request type 5 (MD5 password)".into(),
                ));
            }
            AuthenticationMessage::Other(code) => {
                return Err(Error::NotSupported(format!(
                    "authentication request type {}",
                    code
                )));
            }
        }
    }
}
