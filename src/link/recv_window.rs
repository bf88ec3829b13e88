//! Receive-side reassembly window.
//!
//! Tracks the next expected sequence number, accumulates in-order payload
//! into the in-progress frame, and buffers out-of-order segments (bounded by
//! the negotiated window) until the gap fills. Anything at or behind the
//! cumulative point is a duplicate and is not retained.

use std::collections::HashMap;

use crate::core::Frame;
use crate::wire::{Segment, seq_dist};

/// Classification of one received data segment.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RecvOutcome {
    /// The segment (and possibly buffered successors) advanced the cumulative
    /// point. Zero or more frames completed.
    Accepted(Vec<Frame>),
    /// Ahead of the expected sequence; buffered pending the gap.
    Buffered,
    /// At or behind the cumulative point, or already buffered. Dropped, but
    /// the caller still (re)sends an acknowledgment.
    Duplicate,
    /// Ahead by more than the window allows: a protocol violation.
    TooFarAhead,
}

#[derive(Debug)]
pub(crate) struct RecvWindow {
    /// Last in-order sequence number consumed (the cumulative ack value).
    cumulative: u8,
    /// Bytes of the frame currently being reassembled.
    partial: Vec<u8>,
    /// Out-of-order segments keyed by sequence number.
    pending: HashMap<u8, Segment>,
    /// Negotiated window: bound on how far ahead a segment may run.
    window: u8,
}

impl RecvWindow {
    /// Create a window expecting `initial.wrapping_add(1)` next.
    ///
    /// `initial` is the peer's SYN sequence number, which the handshake
    /// consumed.
    pub fn new(initial: u8, window: u8) -> Self {
        Self {
            cumulative: initial,
            partial: Vec::new(),
            pending: HashMap::new(),
            window,
        }
    }

    /// The cumulative acknowledgment value to advertise.
    pub fn cumulative(&self) -> u8 {
        self.cumulative
    }

    /// Accept one data segment.
    pub fn accept(&mut self, seg: Segment) -> RecvOutcome {
        let next = self.cumulative.wrapping_add(1);
        let dist = seq_dist(next, seg.seq);

        if dist >= 128 {
            // At or behind the cumulative point: the peer missed our ack.
            return RecvOutcome::Duplicate;
        }
        if dist > 0 {
            if dist >= self.window {
                return RecvOutcome::TooFarAhead;
            }
            if self.pending.contains_key(&seg.seq) {
                return RecvOutcome::Duplicate;
            }
            self.pending.insert(seg.seq, seg);
            return RecvOutcome::Buffered;
        }

        // In order: consume it, then drain any contiguous run it unblocked.
        let mut frames = Vec::new();
        self.consume(seg, &mut frames);
        loop {
            let succ = self.cumulative.wrapping_add(1);
            match self.pending.remove(&succ) {
                Some(buffered) => self.consume(buffered, &mut frames),
                None => break,
            }
        }
        RecvOutcome::Accepted(frames)
    }

    fn consume(&mut self, seg: Segment, frames: &mut Vec<Frame>) {
        self.cumulative = seg.seq;
        let eof = seg.flags.eof();
        self.partial.extend_from_slice(&seg.payload);
        if eof {
            frames.push(Frame::new(std::mem::take(&mut self.partial)));
        }
    }

    /// Drop all reassembly state (connection reset). A partially assembled
    /// frame is discarded, never delivered.
    pub fn clear(&mut self) {
        self.partial.clear();
        self.pending.clear();
    }
}
