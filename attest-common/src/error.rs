//! Error types shared across the attest crates.

use std::io;

use thiserror::Error;

/// Errors raised while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No configuration file found. Tried ATTEST_CONFIG, ./attest.config.ron, /etc/attest/attest.config.ron")]
    NotFound,

    #[error("Failed to read configuration from {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid connection specification {spec:?}: {reason}")]
    InvalidConnection { spec: String, reason: String },

    #[error("Metrics listener {0} collides with a data listener; refusing to start")]
    MetricPortCollision(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid configuration for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

/// Errors raised by a protocol engine while talking to the MTA.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unexpected command {command:?} in state {state}")]
    UnexpectedCommand { command: char, state: String },

    #[error("Frame of {0} bytes exceeds the negotiated maximum")]
    Oversized(usize),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors that end a single connection's session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection error: {0}")]
    Connection(#[from] io::Error),

    #[error("Session timed out after {0} seconds")]
    Timeout(u64),

    #[error("Shutdown requested")]
    Shutdown,
}

impl SessionError {
    /// `true` when the session ended because the daemon is going down,
    /// not because of anything the peer did.
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    /// `true` when the peer misbehaved (bad frames, stalled socket).
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as StdError;

    use super::*;

    #[test]
    fn config_error_display() {
        let err = ConfigError::MissingField("connection");
        assert_eq!(err.to_string(), "Missing required field: connection");

        let err = ConfigError::MetricPortCollision("inet:8642@localhost".to_string());
        assert_eq!(
            err.to_string(),
            "Metrics listener inet:8642@localhost collides with a data listener; refusing to start"
        );
    }

    #[test]
    fn session_error_classification() {
        assert!(SessionError::Shutdown.is_shutdown());
        assert!(!SessionError::Shutdown.is_client_error());

        let err = SessionError::Timeout(30);
        assert!(err.is_client_error());
        assert!(!err.is_shutdown());

        let err = SessionError::Protocol(ProtocolError::Oversized(1 << 20));
        assert!(err.is_client_error());
    }

    #[test]
    fn error_source_chain() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = ConfigError::Read {
            path: "/etc/attest/attest.config.ron".to_string(),
            source: io_err,
        };

        assert!(err.source().is_some());
        assert_eq!(
            err.to_string(),
            "Failed to read configuration from /etc/attest/attest.config.ron: access denied"
        );
    }
}
