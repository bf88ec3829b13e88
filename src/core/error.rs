//! Error types for the SEGLINK protocol stack.

use thiserror::Error;

/// Errors that can occur when decoding a wire segment or a session
/// advertisement.
///
/// A segment that fails to decode is a malformed segment: it is dropped
/// silently by the transport, no acknowledgment is sent, and connection state
/// is not altered.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer shorter than the minimum required size.
    #[error("segment too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected size.
        expected: usize,
        /// Actual size received.
        actual: usize,
    },

    /// The declared payload length disagrees with the bytes available.
    #[error("payload length mismatch: header says {expected}, but {actual} bytes available")]
    LengthMismatch {
        /// Payload length declared in the header.
        expected: usize,
        /// Actual payload bytes present.
        actual: usize,
    },

    /// Checksum verification failed.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// Reserved header bits were set.
    #[error("reserved header bits set: 0x{0:02x}")]
    ReservedBits(u8),

    /// The peer advertised an unsupported protocol version.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),
}

/// Connection-level errors surfaced to the application.
///
/// Transient faults (malformed segments, single channel I/O errors,
/// duplicate or out-of-order segments) are absorbed inside the stack and
/// never appear here. Only connection-level failure does, as a single clear
/// signal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The operation requires an established connection.
    #[error("link is not connected")]
    NotConnected,

    /// The connection was reset: peer RST, retransmission limit exceeded, or
    /// missed-heartbeat limit exceeded.
    #[error("connection lost")]
    ConnectionLost,

    /// The handshake did not complete within the configured timeout and
    /// retry budget.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The frame carried an upstream error flag and was refused.
    #[error("frame flagged in error by upstream validation")]
    ErroredFrame,

    /// The transport was stopped. This is a clean shutdown signal, not a
    /// failure.
    #[error("link closed")]
    Closed,
}

impl From<QueueClosed> for LinkError {
    fn from(_: QueueClosed) -> Self {
        LinkError::Closed
    }
}

/// Raised to any caller blocked on a bounded queue when the queue is closed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("queue closed")]
pub struct QueueClosed;
