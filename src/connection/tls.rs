//! TLS configuration for secure connections to Postgres.
//!
//! The validation policy follows the libpq `sslmode` values:
//!
//! * `allow`, `prefer`, `require`: encrypt without validating the server
//!   certificate, unless a root certificate is configured, in which case the
//!   chain is verified as for `verify-ca`
//! * `verify-ca`: the chain must lead to a trusted root; the host name is not checked
//! * `verify-full`: chain and host name are both verified

use super::settings::Settings;
use crate::{Error, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pemfile::Item;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// SSL/TLS connection mode matching PostgreSQL `sslmode` parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SslMode {
    /// No TLS (plaintext connection)
    Disable,
    /// Plaintext first; TLS only when the server rejects the plaintext login
    Allow,
    /// TLS when the server supports it, plaintext otherwise
    #[default]
    Prefer,
    /// TLS required
    Require,
    /// TLS required, server certificate must be signed by a trusted CA
    VerifyCa,
    /// TLS required, server certificate must be signed by a trusted CA and hostname must match
    VerifyFull,
}

impl SslMode {
    /// Whether this mode requires certificate verification (CA or full)
    pub fn requires_verification(&self) -> bool {
        matches!(self, Self::VerifyCa | Self::VerifyFull)
    }

    /// Whether the connection fails when TLS is unavailable
    pub fn requires_tls(&self) -> bool {
        matches!(self, Self::Require | Self::VerifyCa | Self::VerifyFull)
    }

    /// Whether the first connection attempt sends an SSLRequest
    pub fn attempts_tls_first(&self) -> bool {
        !matches!(self, Self::Disable | Self::Allow)
    }
}

impl std::fmt::Display for SslMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disable => write!(f, "disable"),
            Self::Allow => write!(f, "allow"),
            Self::Prefer => write!(f, "prefer"),
            Self::Require => write!(f, "require"),
            Self::VerifyCa => write!(f, "verify-ca"),
            Self::VerifyFull => write!(f, "verify-full"),
        }
    }
}

impl std::str::FromStr for SslMode {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "disable" => Ok(Self::Disable),
            "allow" => Ok(Self::Allow),
            "prefer" => Ok(Self::Prefer),
            "require" => Ok(Self::Require),
            "verify-ca" => Ok(Self::VerifyCa),
            "verify-full" => Ok(Self::VerifyFull),
            _ => Err(Error::Config(format!(
                "invalid sslmode '{}': expected disable, allow, prefer, require, verify-ca, or verify-full",
                s
            ))),
        }
    }
}

/// Build the rustls client configuration for `settings`
pub(crate) fn client_config(settings: &Settings) -> Result<Arc<ClientConfig>> {
    let verifier: Arc<dyn ServerCertVerifier> = match (settings.ssl_mode, &settings.ssl_root_cert) {
        (SslMode::VerifyFull, root) => webpki_verifier(root.as_deref())?,
        (SslMode::VerifyCa, root) => Arc::new(IgnoreHostname(webpki_verifier(root.as_deref())?)),
        (_, Some(root)) => Arc::new(IgnoreHostname(webpki_verifier(Some(root))?)),
        (_, None) => Arc::new(AcceptAnyCertificate(webpki_verifier(None)?)),
    };

    let builder = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier);

    let config = match (&settings.ssl_cert, &settings.ssl_key) {
        (Some(cert), Some(key)) => {
            if settings.ssl_key_password.is_some() {
                return Err(Error::NotSupported(
                    "password-protected client keys".into(),
                ));
            }
            let certs = load_certs(cert)?;
            let key = load_key(key)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| Error::tls("invalid client certificate", e))?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(Arc::new(config))
}

/// Server name for SNI and host name verification
pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>> {
    let host = host.trim_end_matches('.');
    ServerName::try_from(host.to_owned())
        .map_err(|_| Error::Config(format!("invalid hostname for TLS: '{}'", host)))
}

fn webpki_verifier(root_cert: Option<&Path>) -> Result<Arc<WebPkiServerVerifier>> {
    let roots = match root_cert {
        Some(path) => load_custom_ca(path)?,
        None => system_roots(),
    };
    WebPkiServerVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| Error::tls("failed to build certificate verifier", e))
}

/// System roots, falling back to the bundled Mozilla roots
fn system_roots() -> RootCertStore {
    let result = rustls_native_certs::load_native_certs();
    let mut store = RootCertStore::empty();
    let (added, _) = store.add_parsable_certificates(result.certs);
    if added == 0 {
        if !result.errors.is_empty() {
            tracing::debug!(errors = result.errors.len(), "no usable system root certificates");
        }
        store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    store
}

/// Load a custom CA certificate from a PEM file.
fn load_custom_ca(path: &Path) -> Result<RootCertStore> {
    let data = fs::read(path).map_err(|e| {
        Error::Config(format!(
            "failed to read root certificate file '{}': {}",
            path.display(),
            e
        ))
    })?;

    let mut reader = std::io::Cursor::new(&data);
    let mut root_store = RootCertStore::empty();
    let mut found_certs = 0;

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(Item::X509Certificate(cert))) => {
                let _ = root_store.add_parsable_certificates(std::iter::once(cert));
                found_certs += 1;
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => {
                return Err(Error::Config(format!(
                    "failed to parse root certificate from '{}'",
                    path.display()
                )));
            }
        }
    }

    if found_certs == 0 {
        return Err(Error::Config(format!(
            "no valid certificates found in '{}'",
            path.display()
        )));
    }

    Ok(root_store)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let data = fs::read(path).map_err(|e| {
        Error::Config(format!(
            "failed to read client certificate '{}': {}",
            path.display(),
            e
        ))
    })?;
    let certs = rustls_pemfile::certs(&mut std::io::Cursor::new(&data))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            Error::Config(format!(
                "failed to parse client certificate '{}': {}",
                path.display(),
                e
            ))
        })?;
    if certs.is_empty() {
        return Err(Error::Config(format!(
            "no certificates found in '{}'",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let data = fs::read(path).map_err(|e| {
        Error::Config(format!(
            "failed to read client key '{}': {}",
            path.display(),
            e
        ))
    })?;
    rustls_pemfile::private_key(&mut std::io::Cursor::new(&data))
        .map_err(|e| {
            Error::Config(format!(
                "failed to parse client key '{}': {}",
                path.display(),
                e
            ))
        })?
        .ok_or_else(|| {
            Error::Config(format!(
                "no unencrypted private key found in '{}'",
                path.display()
            ))
        })
}

/// Accepts any server certificate; handshake signatures are still checked
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<WebPkiServerVerifier>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.0.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.0.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.supported_verify_schemes()
    }
}

/// Verifies the chain but not the host name
#[derive(Debug)]
struct IgnoreHostname(Arc<WebPkiServerVerifier>);

impl ServerCertVerifier for IgnoreHostname {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self
            .0
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(e)) if is_name_mismatch(&e) => {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.0.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.0.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.supported_verify_schemes()
    }
}

// Newer rustls releases carry context in a separate `NotValidForNameContext` variant
fn is_name_mismatch(e: &rustls::CertificateError) -> bool {
    matches!(e, rustls::CertificateError::NotValidForName)
        || format!("{:?}", e).starts_with("NotValidForName")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssl_mode_from_str() {
        assert_eq!("disable".parse::<SslMode>().unwrap(), SslMode::Disable);
        assert_eq!("allow".parse::<SslMode>().unwrap(), SslMode::Allow);
        assert_eq!("prefer".parse::<SslMode>().unwrap(), SslMode::Prefer);
        assert_eq!("require".parse::<SslMode>().unwrap(), SslMode::Require);
        assert_eq!("verify-ca".parse::<SslMode>().unwrap(), SslMode::VerifyCa);
        assert_eq!(
            "verify-full".parse::<SslMode>().unwrap(),
            SslMode::VerifyFull
        );
    }

    #[test]
    fn test_ssl_mode_from_str_invalid() {
        assert!("invalid".parse::<SslMode>().is_err());
        assert!("Require".parse::<SslMode>().is_err());
    }

    #[test]
    fn test_ssl_mode_display_round_trips() {
        for mode in [
            SslMode::Disable,
            SslMode::Allow,
            SslMode::Prefer,
            SslMode::Require,
            SslMode::VerifyCa,
            SslMode::VerifyFull,
        ] {
            assert_eq!(mode.to_string().parse::<SslMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_ssl_mode_policies() {
        assert_eq!(SslMode::default(), SslMode::Prefer);
        assert!(!SslMode::Prefer.requires_tls());
        assert!(SslMode::Require.requires_tls());
        assert!(SslMode::VerifyCa.requires_verification());
        assert!(!SslMode::Require.requires_verification());
        assert!(!SslMode::Allow.attempts_tls_first());
        assert!(SslMode::Prefer.attempts_tls_first());
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("localhost").is_ok());
        assert!(server_name("db.example.com.").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("not a host").is_err());
    }

    #[test]
    fn test_client_config_builds_for_every_mode() {
        for mode in [SslMode::Require, SslMode::VerifyCa, SslMode::VerifyFull] {
            let settings = Settings::builder().ssl_mode(mode).build().unwrap();
            assert!(client_config(&settings).is_ok(), "mode {}", mode);
        }
    }

    #[test]
    fn test_missing_root_cert_is_config_error() {
        let settings = Settings::builder()
            .ssl_mode(SslMode::VerifyFull)
            .ssl_root_cert("/nonexistent/root.crt")
            .build()
            .unwrap();
        assert!(matches!(client_config(&settings), Err(Error::Config(_))));
    }

    #[test]
    fn test_encrypted_key_not_supported() {
        let settings = Settings::builder()
            .ssl_mode(SslMode::Require)
            .ssl_client_cert("/tmp/client.crt", "/tmp/client.key")
            .ssl_key_password("pass")
            .build()
            .unwrap();
        assert!(matches!(client_config(&settings), Err(Error::NotSupported(_))));
    }
}
