//! Error types for blaze-client.

use thiserror::Error;

/// Main error type for all Blaze client operations.
#[derive(Debug, Error)]
pub enum BlazeError {
    /// I/O error on the underlying socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Socket/TLS/transport failure, or a write on a non-writable connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A request exceeded its deadline without a matching response.
    #[error("Timeout waiting for response to packet ID: {correlation_id}")]
    Timeout {
        /// Correlation id of the abandoned request.
        correlation_id: u32,
    },

    /// A complete frame could not be decoded.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// The remote session is no longer valid.
    #[error("Session expired, re-authentication required")]
    SessionExpired,

    /// Login handshake rejected or incomplete.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// TLS configuration or handshake error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// JSON conversion error (typed views over packet bodies).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Connection was explicitly closed.
    #[error("Connection closed")]
    Closed,
}

/// Result type alias using BlazeError.
pub type Result<T> = std::result::Result<T, BlazeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_packet() {
        let err = BlazeError::Timeout { correlation_id: 42 };
        assert_eq!(
            err.to_string(),
            "Timeout waiting for response to packet ID: 42"
        );
    }

    #[test]
    fn test_io_error_converts() {
        let err: BlazeError = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert!(matches!(err, BlazeError::Io(_)));
    }
}
