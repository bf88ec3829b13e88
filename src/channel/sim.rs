//! Simulated channels for deterministic testing.
//!
//! Real networks drop and duplicate packets at inconvenient moments. To
//! exercise the reliability machinery without depending on actual network
//! conditions, [`channel_pair`] builds a lossless in-process link and
//! [`FaultyChannel`] wraps any channel with a deterministic fault plan keyed
//! by datagram index, so a failing test replays identically every run.

use std::collections::HashSet;
use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use log::debug;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use super::RawChannel;

/// One end of an in-process datagram link.
///
/// Lossless and order-preserving on its own; compose with [`FaultyChannel`]
/// to inject faults.
#[derive(Debug)]
pub struct SimChannel {
    tx: mpsc::Sender<Vec<u8>>,
    rx: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
}

/// Create a connected pair of in-process channels.
///
/// `depth` bounds the number of datagrams buffered in each direction.
pub fn channel_pair(depth: usize) -> (SimChannel, SimChannel) {
    let (a_tx, b_rx) = mpsc::channel(depth);
    let (b_tx, a_rx) = mpsc::channel(depth);
    (
        SimChannel {
            tx: a_tx,
            rx: AsyncMutex::new(a_rx),
        },
        SimChannel {
            tx: b_tx,
            rx: AsyncMutex::new(b_rx),
        },
    )
}

#[async_trait]
impl RawChannel for SimChannel {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        self.tx
            .send(datagram.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer channel closed"))
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(datagram) => {
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "peer channel closed",
            )),
        }
    }
}

/// Deterministic fault plan for a [`FaultyChannel`].
///
/// Datagrams are counted from zero in send order; an index listed in `drop`
/// is silently discarded, an index listed in `duplicate` is sent twice.
#[derive(Debug, Default, Clone)]
pub struct FaultPlan {
    /// Send indices to discard.
    pub drop: Vec<u64>,
    /// Send indices to deliver twice.
    pub duplicate: Vec<u64>,
}

impl FaultPlan {
    /// A plan that drops the given send indices.
    pub fn dropping(indices: impl IntoIterator<Item = u64>) -> Self {
        Self {
            drop: indices.into_iter().collect(),
            duplicate: Vec::new(),
        }
    }

    /// A plan that duplicates the given send indices.
    pub fn duplicating(indices: impl IntoIterator<Item = u64>) -> Self {
        Self {
            drop: Vec::new(),
            duplicate: indices.into_iter().collect(),
        }
    }
}

/// A fault-injecting wrapper around any [`RawChannel`].
///
/// Only the send side is intercepted; receives pass straight through.
#[derive(Debug)]
pub struct FaultyChannel<C> {
    inner: C,
    drop: HashSet<u64>,
    duplicate: HashSet<u64>,
    sent: AtomicU64,
    dropped: Mutex<Vec<u64>>,
}

impl<C: RawChannel> FaultyChannel<C> {
    /// Wrap `inner` with the given fault plan.
    pub fn new(inner: C, plan: FaultPlan) -> Self {
        Self {
            inner,
            drop: plan.drop.into_iter().collect(),
            duplicate: plan.duplicate.into_iter().collect(),
            sent: AtomicU64::new(0),
            dropped: Mutex::new(Vec::new()),
        }
    }

    /// Send indices that were actually discarded so far.
    pub fn dropped(&self) -> Vec<u64> {
        self.dropped
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl<C: RawChannel> RawChannel for FaultyChannel<C> {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        let idx = self.sent.fetch_add(1, Ordering::Relaxed);
        if self.drop.contains(&idx) {
            debug!("[sim] dropping datagram #{idx} ({} bytes)", datagram.len());
            self.dropped
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(idx);
            return Ok(());
        }
        self.inner.send(datagram).await?;
        if self.duplicate.contains(&idx) {
            debug!("[sim] duplicating datagram #{idx}");
            self.inner.send(datagram).await?;
        }
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.recv(buf).await
    }
}
