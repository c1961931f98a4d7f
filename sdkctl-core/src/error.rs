//! Domain-specific error types for the SDK controller protocol.
//!
//! Synchronous entry points return `Result<T, SdkCtlError>`. The
//! asynchronous engine reports through callbacks instead and carries the
//! underlying `io::ErrorKind` alongside the callback state.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the SDK controller protocol.
#[derive(Debug, Error)]
pub enum SdkCtlError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// A packet header did not start with the `SDKC` signature.
    #[error("invalid packet signature: {0:#010x}")]
    InvalidSignature(i32),

    /// A field in a packet header could not be parsed.
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value}")]
    UnknownVariant { type_name: &'static str, value: i64 },

    /// A packet violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    // ── Packet Errors ────────────────────────────────────────────
    /// The declared packet size exceeds the protocol limit.
    #[error("packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },

    /// The buffer is shorter or longer than the header claims.
    #[error("invalid packet length: expected {expected}, got {actual}")]
    InvalidPacketLength { expected: usize, actual: usize },

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    /// The operation needs a socket that has not been created yet.
    #[error("not connected")]
    NotConnected,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl SdkCtlError {
    /// The `io::ErrorKind` the engine reports for this error when it has
    /// to surface it through an I/O callback.
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            SdkCtlError::Connection(e) => e.kind(),
            SdkCtlError::NotConnected => io::ErrorKind::NotConnected,
            SdkCtlError::Timeout(_) => io::ErrorKind::TimedOut,
            SdkCtlError::Other(_) => io::ErrorKind::Other,
            _ => io::ErrorKind::InvalidData,
        }
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for SdkCtlError {
    fn from(s: String) -> Self {
        SdkCtlError::Other(s)
    }
}

impl From<&str> for SdkCtlError {
    fn from(s: &str) -> Self {
        SdkCtlError::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = SdkCtlError::InvalidSignature(0x1234_5678);
        assert!(e.to_string().contains("0x12345678"));

        let e = SdkCtlError::PacketTooLarge {
            size: 1000,
            max: 500,
        };
        assert!(e.to_string().contains("1000"));
        assert!(e.to_string().contains("500"));
    }

    #[test]
    fn from_string() {
        let e: SdkCtlError = "something broke".into();
        assert!(matches!(e, SdkCtlError::Other(_)));
    }

    #[test]
    fn from_io() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe broke");
        let e: SdkCtlError = io_err.into();
        assert!(matches!(e, SdkCtlError::Connection(_)));
        assert_eq!(e.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn protocol_errors_map_to_invalid_data() {
        assert_eq!(
            SdkCtlError::InvalidSignature(0).kind(),
            io::ErrorKind::InvalidData
        );
        assert_eq!(
            SdkCtlError::ProtocolViolation("short").kind(),
            io::ErrorKind::InvalidData
        );
    }
}
