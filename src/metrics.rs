//! Metrics emitted through the `metrics` facade
//!
//! Nothing is recorded unless the application installs a recorder.
//! All metric names share the `fraiseql_connector_` prefix.

/// Label values
pub mod labels {
    /// No password was requested
    pub const MECHANISM_NONE: &str = "none";
    /// Cleartext password
    pub const MECHANISM_CLEARTEXT: &str = "cleartext";
    /// PBKDF2/HMAC-SHA256 password challenge
    pub const MECHANISM_SHA256: &str = "sha256";

    /// Outcome: success
    pub const OUTCOME_OK: &str = "ok";
    /// Outcome: failure
    pub const OUTCOME_ERROR: &str = "error";
}

/// Counters
pub mod counters {
    use metrics::counter;

    /// Authentication started with `mechanism`
    pub fn auth_attempted(mechanism: &'static str) {
        counter!("fraiseql_connector_auth_attempts_total", "mechanism" => mechanism).increment(1);
    }

    /// Authentication succeeded
    pub fn auth_successful(mechanism: &'static str) {
        counter!("fraiseql_connector_auth_successes_total", "mechanism" => mechanism)
            .increment(1);
    }

    /// Authentication failed
    pub fn auth_failed(mechanism: &'static str, reason: &'static str) {
        counter!(
            "fraiseql_connector_auth_failures_total",
            "mechanism" => mechanism,
            "reason" => reason
        )
        .increment(1);
    }

    /// Connector opened
    pub fn connector_opened(secure: bool) {
        counter!(
            "fraiseql_connector_opened_total",
            "tls" => if secure { "true" } else { "false" }
        )
        .increment(1);
    }

    /// Connector broken, labelled with the error kind
    pub fn connector_broken(kind: &'static str) {
        counter!("fraiseql_connector_breaks_total", "kind" => kind).increment(1);
    }

    /// Server-side cancel request sent
    pub fn cancel_request(outcome: &'static str) {
        counter!("fraiseql_connector_cancel_requests_total", "outcome" => outcome).increment(1);
    }

    /// Keepalive probe completed
    pub fn keepalive_probe(outcome: &'static str) {
        counter!("fraiseql_connector_keepalive_probes_total", "outcome" => outcome).increment(1);
    }

    /// Command dispatched over a multiplexed connector
    pub fn multiplexed_command() {
        counter!("fraiseql_connector_multiplexed_commands_total").increment(1);
    }
}

/// Histograms
pub mod histograms {
    use metrics::histogram;

    /// Authentication duration in milliseconds
    pub fn auth_duration(mechanism: &'static str, millis: u64) {
        histogram!("fraiseql_connector_auth_duration_ms", "mechanism" => mechanism)
            .record(millis as f64);
    }

    /// Open duration (connect through ReadyForQuery) in milliseconds
    pub fn open_duration(millis: u64) {
        histogram!("fraiseql_connector_open_duration_ms").record(millis as f64);
    }
}

/// Kind label for a break reason
pub(crate) fn error_kind(err: &crate::Error) -> &'static str {
    use crate::Error;
    match err {
        Error::Io(_) | Error::ConnectionClosed => "io",
        Error::Tls { .. } => "tls",
        Error::Protocol(_) => "protocol",
        Error::Server(_) => "server",
        Error::Timeout => "timeout",
        Error::Cancelled => "cancelled",
        Error::Authentication(_) | Error::NoPassword { .. } | Error::PasswordProvider(_) => {
            "authentication"
        }
        Error::Broken(inner) => error_kind(inner),
        _ => "other",
    }
}
