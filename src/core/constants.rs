//! Protocol constants and defaults.
//!
//! The wire-level values (header layout, flag bits, version) are a contract
//! with the peer implementation and MUST NOT be changed. The session defaults
//! are starting points that each side advertises during the handshake; the
//! effective session values are the per-field minimum of both advertisements.

use std::time::Duration;

// =============================================================================
// WIRE CONTRACT
// =============================================================================

/// Protocol version carried in the SYN advertisement.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the fixed segment header on the wire.
pub const HEADER_LEN: usize = 8;

/// Size of the session advertisement carried in SYN / SYN+ACK payloads.
pub const ADVERT_LEN: usize = 9;

/// Largest datagram the receive loop will accept.
pub const MAX_DATAGRAM: usize = 65535;

// =============================================================================
// SESSION DEFAULTS
// =============================================================================

/// Default maximum segment payload size.
pub const DEFAULT_MSS: u16 = 1024;

/// Default maximum number of outstanding (unacknowledged) segments.
pub const DEFAULT_WINDOW: u8 = 8;

/// Largest negotiable window. Half the 8-bit sequence space, so wrap-around
/// comparisons stay unambiguous.
pub const MAX_WINDOW: u8 = 127;

/// Default retransmission timeout for an outstanding segment.
pub const DEFAULT_RTO: Duration = Duration::from_millis(100);

/// Ceiling for the per-segment exponential backoff applied after each
/// retransmission.
pub const MAX_BACKOFF_RTO: Duration = Duration::from_secs(1);

/// Default keep-alive interval: a NUL heartbeat is sent after this much idle
/// time, and silence for this long counts as one missed heartbeat.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(3);

/// Default retransmission limit before the connection is reset.
pub const DEFAULT_MAX_RETRIES: u8 = 15;

/// Default number of missed heartbeats tolerated before the peer is declared
/// dead.
pub const DEFAULT_MISSED_HEARTBEAT_LIMIT: u32 = 3;

// =============================================================================
// TRANSPORT BOUNDARY
// =============================================================================

/// Default depth of the inbound, outbound, and delivery queues.
pub const DEFAULT_QUEUE_DEPTH: usize = 4;

/// Default channel read timeout. The receive loop wakes at least this often
/// even when no traffic arrives.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Default period of the timer sweep (retransmission and keep-alive checks).
pub const DEFAULT_TICK: Duration = Duration::from_millis(10);

/// Default overall handshake timeout for `connect`.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
