//! Error taxonomy for single transfers.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

/// Errors produced by a transfer attempt.
///
/// None of these are fatal on their own; the retry layer decides whether an
/// attempt is repeated against the same or another URL.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("connect to {host}:{port} failed: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    #[error("local file {}: {source}", path.display())]
    LocalFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no progress for {0:?}")]
    Timeout(Duration),

    #[error("server responded with HTTP {0}")]
    Http(u16),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("cancelled")]
    Cancelled,
}

impl TransferError {
    pub(crate) fn local(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::LocalFile {
            path: path.into(),
            source,
        }
    }

    /// Returns the plain-data code for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connect { .. } => ErrorKind::Connect,
            Self::Io(_) => ErrorKind::Io,
            Self::LocalFile { .. } => ErrorKind::LocalFile,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Http(status) => ErrorKind::Http(*status),
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::InvalidUrl(_) => ErrorKind::InvalidUrl,
            Self::UnsupportedScheme(_) => ErrorKind::UnsupportedScheme,
            Self::ChecksumMismatch => ErrorKind::ChecksumMismatch,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Result code surfaced to callers in place of the full error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "status", rename_all = "snake_case")]
pub enum ErrorKind {
    Connect,
    Io,
    LocalFile,
    Timeout,
    Http(u16),
    Protocol,
    InvalidUrl,
    UnsupportedScheme,
    ChecksumMismatch,
    Cancelled,
    /// Cumulative retry time ran out before any attempt succeeded.
    GiveUp,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Connect => f.write_str("connect"),
            ErrorKind::Io => f.write_str("io"),
            ErrorKind::LocalFile => f.write_str("local_file"),
            ErrorKind::Timeout => f.write_str("timeout"),
            ErrorKind::Http(status) => write!(f, "http_{status}"),
            ErrorKind::Protocol => f.write_str("protocol"),
            ErrorKind::InvalidUrl => f.write_str("invalid_url"),
            ErrorKind::UnsupportedScheme => f.write_str("unsupported_scheme"),
            ErrorKind::ChecksumMismatch => f.write_str("checksum_mismatch"),
            ErrorKind::Cancelled => f.write_str("cancelled"),
            ErrorKind::GiveUp => f.write_str("give_up"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_maps_every_variant() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        let err = TransferError::Connect {
            host: "example.org".into(),
            port: 80,
            source: refused,
        };
        assert_eq!(err.kind(), ErrorKind::Connect);
        assert_eq!(TransferError::Http(503).kind(), ErrorKind::Http(503));
        assert_eq!(
            TransferError::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(TransferError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn kind_display_is_stable() {
        assert_eq!(ErrorKind::Http(404).to_string(), "http_404");
        assert_eq!(ErrorKind::Timeout.to_string(), "timeout");
        assert_eq!(ErrorKind::GiveUp.to_string(), "give_up");
    }

    #[test]
    fn connect_error_message_names_endpoint() {
        let err = TransferError::Connect {
            host: "mirror.example.org".into(),
            port: 8080,
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert!(err.to_string().contains("mirror.example.org:8080"));
    }
}
