//! The transport boundary adapter.
//!
//! [`Transport::start`] spawns three loop tasks over an unreliable
//! [`RawChannel`]:
//!
//! - the **receive loop** reads raw datagrams (with a timeout so a silent
//!   link cannot stall it), decodes them, and pushes segments onto the
//!   bounded inbound queue;
//! - the **dispatch loop** pops the inbound queue into
//!   [`Controller::process_segment`] and runs the periodic timer sweep;
//! - the **transmit loop** drains the outbound queue onto the channel.
//!
//! The transport owns no protocol state. A channel I/O fault is logged and
//! the loop retries the next operation; a lossy, noisy link is the expected
//! operating environment. Every suspension point also observes a
//! cancellation token so [`stop`](Transport::stop) completes in bounded time.

use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, timeout};

use crate::channel::RawChannel;
use crate::core::constants::MAX_DATAGRAM;
use crate::core::{Frame, LinkError};
use crate::queue::BoundedQueue;
use crate::wire::Segment;

use super::controller::Controller;

/// The boundary adapter between a [`Controller`] and its raw channel.
///
/// Holds the loop tasks' join handles; the controller has no reference back,
/// so lifetime is single-directional and destruction order deterministic.
#[derive(Debug)]
pub struct Transport {
    controller: Arc<Controller>,
    inbound: Arc<BoundedQueue<Segment>>,
    cancel: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Transport {
    /// Spawn the receive, dispatch, and transmit loops.
    ///
    /// The loops run until [`stop`](Transport::stop) is called or the
    /// transport is dropped.
    pub fn start(channel: Arc<dyn RawChannel>, controller: Arc<Controller>) -> Self {
        let cfg = controller.config();
        let inbound = Arc::new(BoundedQueue::new(cfg.queue_depth));
        let outbound = controller.outbound();
        let (cancel, _) = watch::channel(false);

        let rx_task = tokio::spawn(recv_loop(
            Arc::clone(&channel),
            Arc::clone(&controller),
            Arc::clone(&inbound),
            cfg.read_timeout,
            cancel.subscribe(),
        ));
        let dispatch_task = tokio::spawn(dispatch_loop(
            Arc::clone(&controller),
            Arc::clone(&inbound),
            cfg.tick,
            cancel.subscribe(),
        ));
        let tx_task = tokio::spawn(send_loop(channel, outbound, cancel.subscribe()));

        Self {
            controller,
            inbound,
            cancel,
            tasks: vec![rx_task, dispatch_task, tx_task],
        }
    }

    /// The controller this transport feeds.
    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Entry point from the upstream layer: forward a frame for
    /// segmentation and transmission.
    ///
    /// Frames flagged in error by upstream validation are dropped here.
    pub async fn accept_frame(&self, frame: Frame) -> Result<(), LinkError> {
        if frame.is_error() {
            warn!("dropping frame flagged in error ({} bytes)", frame.len());
            return Ok(());
        }
        self.controller.send_frame(frame).await
    }

    /// Signal cancellation to all loop tasks and wait for their termination.
    ///
    /// No background work survives this call. Blocked queue callers are
    /// woken with a clean `QueueClosed`-derived shutdown signal.
    pub async fn stop(mut self) {
        let _ = self.cancel.send(true);
        self.controller.shutdown().await;
        self.inbound.close();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("transport task ended abnormally: {e}");
                }
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        // An async join is impossible here; cancel at the next suspension
        // point and abort so nothing outlives the transport.
        let _ = self.cancel.send(true);
        self.controller.shutdown_now();
        self.inbound.close();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn recv_loop(
    channel: Arc<dyn RawChannel>,
    controller: Arc<Controller>,
    inbound: Arc<BoundedQueue<Segment>>,
    read_timeout: std::time::Duration,
    mut cancel: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = cancel.changed() => break,
            read = timeout(read_timeout, channel.recv(&mut buf)) => match read {
                // Timeout: nothing arrived; loop so the dispatch tick keeps
                // the timers honest even on a silent link.
                Err(_) => continue,
                Ok(Ok(n)) => match Segment::decode(&buf[..n]) {
                    Ok(seg) => {
                        if inbound.push(seg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("dropping malformed segment: {e}");
                        controller.note_malformed().await;
                    }
                },
                Ok(Err(e)) => {
                    warn!("channel read fault: {e}");
                }
            },
        }
    }
}

async fn dispatch_loop(
    controller: Arc<Controller>,
    inbound: Arc<BoundedQueue<Segment>>,
    tick: std::time::Duration,
    mut cancel: watch::Receiver<bool>,
) {
    let mut timer = tokio::time::interval(tick);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.changed() => break,
            seg = inbound.pop() => match seg {
                Ok(seg) => controller.process_segment(seg).await,
                Err(_) => break,
            },
            _ = timer.tick() => controller.on_tick().await,
        }
    }
}

async fn send_loop(
    channel: Arc<dyn RawChannel>,
    outbound: Arc<BoundedQueue<Segment>>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = cancel.changed() => break,
            seg = outbound.pop() => {
                let seg = match seg {
                    Ok(seg) => seg,
                    Err(_) => break,
                };
                let datagram = seg.encode();
                // The write itself also observes cancellation, so a wedged
                // channel cannot stall shutdown.
                tokio::select! {
                    _ = cancel.changed() => break,
                    sent = channel.send(&datagram) => {
                        if let Err(e) = sent {
                            warn!("channel write fault: {e}");
                        }
                    }
                }
            },
        }
    }
}
