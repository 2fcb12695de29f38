use thiserror::Error;

/// Errors raised by the duplex transport.
///
/// Duplicate connections are not represented here: the registry reports them
/// through its own outcome type instead of failing.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("Failed to dial {address}: {reason}")]
    Dial { address: String, reason: String },

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Reconnect to {address} failed after {attempts} attempts")]
    ReconnectExhausted { address: String, attempts: u32 },

    #[error("Server-side connection from {0} cannot reconnect; the peer must dial again")]
    ReconnectUnsupported(String),

    #[error("Peer mismatch: expected {expected}, got {actual}")]
    PeerMismatch { expected: String, actual: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection closed")]
    Closed,

    #[error("Frame handler error: {0}")]
    Handler(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TransportError {
    /// Maps a socket error to the transport taxonomy.
    ///
    /// Errors meaning the peer or the local side tore the socket down become
    /// [`TransportError::ConnectionLost`]; everything else stays an I/O error.
    pub fn from_io(err: std::io::Error, context: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected => {
                TransportError::ConnectionLost(format!("{}: {}", context, err))
            }
            _ => TransportError::Io(err),
        }
    }

    /// True when the error means the socket underneath is no longer usable.
    pub fn is_connection_fault(&self) -> bool {
        matches!(self, TransportError::ConnectionLost(_) | TransportError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn test_eof_maps_to_connection_lost() {
        let err = TransportError::from_io(Error::new(ErrorKind::UnexpectedEof, "eof"), "reading length prefix");
        assert!(matches!(err, TransportError::ConnectionLost(_)));
        assert!(err.to_string().contains("reading length prefix"));
    }

    #[test]
    fn test_other_io_error_is_kept() {
        let err = TransportError::from_io(Error::new(ErrorKind::PermissionDenied, "nope"), "writing");
        assert!(matches!(err, TransportError::Io(_)));
        assert!(err.is_connection_fault());
    }

    #[test]
    fn test_closed_is_not_a_fault() {
        assert!(!TransportError::Closed.is_connection_fault());
        assert!(!TransportError::FrameTooLarge { size: 2, max: 1 }.is_connection_fault());
        assert!(!TransportError::Handshake("bad magic".into()).is_connection_fault());
    }

    #[test]
    fn test_dial_error_names_address() {
        let err = TransportError::Dial {
            address: "10.0.0.1:9000".into(),
            reason: "refused".into(),
        };
        assert_eq!(err.to_string(), "Failed to dial 10.0.0.1:9000: refused");
    }
}
