//! Session parameters and handshake negotiation.

use std::time::Duration;

use crate::core::DecodeError;
use crate::core::constants::{ADVERT_LEN, MAX_WINDOW, PROTOCOL_VERSION};

/// The session constants negotiated during the handshake.
///
/// Each side advertises its capability in its SYN (or SYN+ACK) payload; the
/// effective session value is the per-field minimum of the two
/// advertisements. Once the connection is established the parameters are
/// immutable; they are renegotiated only by a fresh handshake after a reset.
///
/// # Advertisement wire format (9 bytes, big-endian)
///
/// ```text
/// version(1) window(1) mss(2) rto_ms(2) keepalive_ms(2) max_retries(1)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParams {
    /// Maximum segment payload size.
    pub mss: u16,
    /// Maximum number of outstanding segments.
    pub window: u8,
    /// Retransmission timeout.
    pub rto: Duration,
    /// Keep-alive interval.
    pub keepalive: Duration,
    /// Retransmission limit before reset.
    pub max_retries: u8,
}

impl SessionParams {
    /// Per-field minimum of two advertisements.
    pub fn negotiate(local: &Self, peer: &Self) -> Self {
        Self {
            mss: local.mss.min(peer.mss),
            window: local.window.min(peer.window),
            rto: local.rto.min(peer.rto),
            keepalive: local.keepalive.min(peer.keepalive),
            max_retries: local.max_retries.min(peer.max_retries),
        }
    }

    /// Serialize the advertisement for a SYN / SYN+ACK payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ADVERT_LEN);
        buf.push(PROTOCOL_VERSION);
        buf.push(self.window.min(MAX_WINDOW));
        buf.extend_from_slice(&self.mss.to_be_bytes());
        buf.extend_from_slice(&(self.rto.as_millis().min(u16::MAX as u128) as u16).to_be_bytes());
        buf.extend_from_slice(
            &(self.keepalive.as_millis().min(u16::MAX as u128) as u16).to_be_bytes(),
        );
        buf.push(self.max_retries);
        buf
    }

    /// Parse an advertisement from a SYN / SYN+ACK payload.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < ADVERT_LEN {
            return Err(DecodeError::TooShort {
                expected: ADVERT_LEN,
                actual: buf.len(),
            });
        }
        if buf[0] != PROTOCOL_VERSION {
            return Err(DecodeError::UnsupportedVersion(buf[0]));
        }
        Ok(Self {
            window: buf[1].min(MAX_WINDOW),
            mss: u16::from_be_bytes([buf[2], buf[3]]),
            rto: Duration::from_millis(u16::from_be_bytes([buf[4], buf[5]]) as u64),
            keepalive: Duration::from_millis(u16::from_be_bytes([buf[6], buf[7]]) as u64),
            max_retries: buf[8],
        })
    }
}
