//! Error types for the WebSocket engine
//!
//! Every way a connection can fail is a variant of [`Error`]. Protocol,
//! payload and size violations carry the short human-readable reason that
//! goes on the wire; [`Error::close_reason`] is the one place that decides
//! which close code (if any) a failure is reported with.

use std::io;

use thiserror::Error;

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket error types
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
    /// Peer closed the transport (EOF or broken pipe)
    #[error("Connection closed")]
    ConnectionClosed,
    /// Connection reset by peer
    #[error("Connection reset by peer")]
    ConnectionReset,
    /// Malformed HTTP upgrade request
    #[error("Invalid HTTP: {0}")]
    InvalidHttp(&'static str),
    /// Upgrade request was well-formed but could not be accepted
    #[error("Handshake failed: {0}")]
    HandshakeFailed(&'static str),
    /// Framing or sequencing violation (close code 1002)
    #[error("Protocol error: {0}")]
    Protocol(&'static str),
    /// Opcode outside the RFC 6455 set (close code 1003)
    #[error("Unsupported opcode 0x{0:X}")]
    UnsupportedOpcode(u8),
    /// Text payload or close reason is not UTF-8 (close code 1007)
    #[error("{0}")]
    InvalidUtf8(&'static str),
    /// Message exceeds the configured maximum size (close code 1009)
    #[error("Message too large")]
    MessageTooLarge,
    /// Compressed payload could not be inflated (close code 1002)
    #[error("Invalid compressed payload: {0}")]
    InvalidCompressedData(String),
    /// Compressor or decompressor failed internally (close code 1011)
    #[error("Compression error: {0}")]
    Compression(String),
    /// Admission control refused a connection, or a session's outbound
    /// backlog went over budget
    #[error("Capacity exceeded: {0}")]
    Capacity(&'static str),
}

impl Error {
    /// The close frame this error is reported with.
    ///
    /// `None` means no close frame is attempted: either the WebSocket
    /// protocol was never established (handshake failures) or the transport
    /// is already gone.
    pub fn close_reason(&self) -> Option<CloseReason> {
        match self {
            Error::Io(_)
            | Error::ConnectionClosed
            | Error::ConnectionReset
            | Error::InvalidHttp(_)
            | Error::HandshakeFailed(_)
            | Error::Capacity(_) => None,
            Error::Protocol(reason) => Some(CloseReason::new(CloseReason::PROTOCOL_ERROR, *reason)),
            Error::UnsupportedOpcode(_) => {
                Some(CloseReason::new(CloseReason::UNSUPPORTED, "Unsupported opcode"))
            }
            Error::InvalidUtf8(reason) => {
                Some(CloseReason::new(CloseReason::INVALID_PAYLOAD, *reason))
            }
            Error::MessageTooLarge => Some(CloseReason::new(CloseReason::TOO_BIG, "Message too large")),
            Error::InvalidCompressedData(_) => Some(CloseReason::new(
                CloseReason::PROTOCOL_ERROR,
                "Invalid compressed payload",
            )),
            Error::Compression(_) => Some(CloseReason::new(CloseReason::INTERNAL, "Internal error")),
        }
    }

    /// True when the failure means the peer is simply gone.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed | Error::ConnectionReset | Error::Io(_)
        )
    }
}

/// Close frame status: a 16-bit code plus optional UTF-8 reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g., server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const UNSUPPORTED: u16 = 1003;
    /// Invalid frame payload
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Internal server error
    pub const INTERNAL: u16 = 1011;

    /// Longest reason that fits a control frame next to the 2-byte code
    pub const MAX_REASON_LEN: usize = crate::MAX_CONTROL_PAYLOAD - 2;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Normal closure without a reason
    pub fn normal() -> Self {
        Self::new(Self::NORMAL, "")
    }

    /// Serialize as a close frame payload.
    ///
    /// The reason is cut at the last character boundary that keeps the
    /// payload within 125 bytes, so the result is always valid UTF-8.
    pub fn to_payload(&self) -> Vec<u8> {
        let mut end = self.reason.len().min(Self::MAX_REASON_LEN);
        while !self.reason.is_char_boundary(end) {
            end -= 1;
        }

        let mut payload = Vec::with_capacity(2 + end);
        payload.extend_from_slice(&self.code.to_be_bytes());
        payload.extend_from_slice(&self.reason.as_bytes()[..end]);
        payload
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                Error::ConnectionReset
            }
            io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            _ => Error::Io(e),
        }
    }
}
