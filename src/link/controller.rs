//! The protocol state machine.
//!
//! One [`Controller`] owns one logical connection: lifecycle, windowing,
//! retransmission, segmentation and reassembly. It consumes decoded segments
//! from the transport's inbound queue, produces segments into the outbound
//! queue, and exposes frame-level send/receive to the application.
//!
//! All protocol state lives behind a single internal lock; whichever task
//! calls in (the application sending, the dispatch loop processing a
//! segment, the timer sweep) is serialized through it. The ordering and
//! single-outstanding-window properties depend on that exclusion.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use tokio::sync::{Mutex, Notify, watch};

use crate::core::constants::{
    DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_KEEPALIVE, DEFAULT_MAX_RETRIES,
    DEFAULT_MISSED_HEARTBEAT_LIMIT, DEFAULT_MSS, DEFAULT_QUEUE_DEPTH, DEFAULT_READ_TIMEOUT,
    DEFAULT_RTO, DEFAULT_TICK, DEFAULT_WINDOW, MAX_BACKOFF_RTO, MAX_WINDOW,
};
use crate::core::{Frame, LinkError, QueueClosed};
use crate::queue::BoundedQueue;
use crate::wire::Segment;

use super::recv_window::{RecvOutcome, RecvWindow};
use super::send_window::SendWindow;
use super::session::SessionParams;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No connection. The handshake starts from here.
    Closed,
    /// SYN sent, waiting for the peer's SYN+ACK (initiator role).
    SynSent,
    /// SYN received and SYN+ACK sent, waiting for the final ACK
    /// (responder role).
    SynReceived,
    /// Handshake complete, data transfer active.
    Established,
    /// Teardown in progress: draining the send window before the farewell.
    Closing,
}

/// Running counters for one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Frames accepted from the application.
    pub tx_frames: u64,
    /// Frames delivered to the application.
    pub rx_frames: u64,
    /// Segments queued for transmission (first transmissions and replies).
    pub tx_segments: u64,
    /// Segments processed from the channel.
    pub rx_segments: u64,
    /// Segments retransmitted after a timer expiry.
    pub retransmits: u64,
    /// Segments dropped: malformed, duplicate, or stray.
    pub drops: u64,
    /// Connection resets, local and remote.
    pub resets: u64,
}

/// Configuration for one link.
///
/// The session fields (`mss`, `window`, `rto`, `keepalive`, `max_retries`)
/// are this side's advertisement; the effective values are negotiated down
/// to the per-field minimum during the handshake.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Advertised maximum segment payload size.
    pub mss: u16,
    /// Advertised maximum number of outstanding segments (clamped to 127).
    pub window: u8,
    /// Advertised retransmission timeout.
    pub rto: Duration,
    /// Advertised keep-alive interval.
    pub keepalive: Duration,
    /// Advertised retransmission limit.
    pub max_retries: u8,
    /// Missed heartbeats tolerated before the peer is declared dead.
    pub max_missed_heartbeats: u32,
    /// Depth of the inbound, outbound, and delivery queues.
    pub queue_depth: usize,
    /// Channel read timeout for the receive loop.
    pub read_timeout: Duration,
    /// Period of the retransmission / keep-alive timer sweep.
    pub tick: Duration,
    /// Overall handshake timeout for `connect`, and the grace period for a
    /// draining teardown.
    pub handshake_timeout: Duration,
    /// First sequence number used by this side's SYN.
    pub initial_seq: u8,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            mss: DEFAULT_MSS,
            window: DEFAULT_WINDOW,
            rto: DEFAULT_RTO,
            keepalive: DEFAULT_KEEPALIVE,
            max_retries: DEFAULT_MAX_RETRIES,
            max_missed_heartbeats: DEFAULT_MISSED_HEARTBEAT_LIMIT,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            read_timeout: DEFAULT_READ_TIMEOUT,
            tick: DEFAULT_TICK,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            initial_seq: 0,
        }
    }
}

impl LinkConfig {
    /// This side's session advertisement.
    pub fn session(&self) -> SessionParams {
        SessionParams {
            mss: self.mss,
            window: self.window.min(MAX_WINDOW),
            rto: self.rto,
            keepalive: self.keepalive,
            max_retries: self.max_retries,
        }
    }
}

/// Why the machine fell back to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResetReason {
    PeerReset,
    PeerRestart,
    RetryLimit,
    PeerDead,
    Violation,
    HandshakeFailure,
    LocalClose,
}

impl ResetReason {
    /// Whether an established connection ending this way is a loss the
    /// application must hear about.
    fn is_failure(self) -> bool {
        !matches!(self, ResetReason::LocalClose)
    }
}

/// Everything the state-machine lock protects.
struct Machine {
    state: LinkState,
    /// Our advertisement.
    local: SessionParams,
    /// Effective session values (equals `local` until negotiated).
    params: SessionParams,
    /// Sequence number our SYN consumes.
    syn_seq: u8,
    send: SendWindow,
    /// Peer advertised BUSY in its latest segment; hold off new data.
    peer_busy: bool,
    recv: RecvWindow,
    last_rx: Instant,
    last_tx: Instant,
    missed_beats: u32,
    hs_last_tx: Instant,
    hs_retries: u8,
    closing_since: Option<Instant>,
    lost_reported: bool,
    stats: LinkStats,
}

impl Machine {
    fn new(cfg: &LinkConfig) -> Self {
        let local = cfg.session();
        let now = Instant::now();
        Self {
            state: LinkState::Closed,
            local,
            params: local,
            syn_seq: cfg.initial_seq,
            send: SendWindow::new(cfg.initial_seq.wrapping_add(1)),
            peer_busy: false,
            recv: RecvWindow::new(0, local.window),
            last_rx: now,
            last_tx: now,
            missed_beats: 0,
            hs_last_tx: now,
            hs_retries: 0,
            closing_since: None,
            lost_reported: false,
            stats: LinkStats::default(),
        }
    }

    /// Start the handshake: `Closed -> SynSent`, returning the SYN to send.
    fn begin_connect(&mut self, now: Instant) -> Segment {
        self.state = LinkState::SynSent;
        self.hs_last_tx = now;
        self.hs_retries = 0;
        self.send = SendWindow::new(self.syn_seq.wrapping_add(1));
        Segment::syn(self.syn_seq, self.local.encode())
    }

    fn establish(&mut self, now: Instant) {
        self.state = LinkState::Established;
        self.missed_beats = 0;
        self.lost_reported = false;
        self.closing_since = None;
        self.last_rx = now;
        self.last_tx = now;
    }

    /// Fall back to `Closed`, destroying all window state.
    ///
    /// Returns the connection-lost error to surface, at most once per
    /// established connection.
    fn reset(&mut self, reason: ResetReason) -> Option<LinkError> {
        let prior = self.state;
        self.state = LinkState::Closed;
        self.send = SendWindow::new(self.syn_seq.wrapping_add(1));
        self.recv.clear();
        self.peer_busy = false;
        self.missed_beats = 0;
        self.hs_retries = 0;
        self.closing_since = None;
        self.stats.resets += 1;
        if prior == LinkState::Established && reason.is_failure() && !self.lost_reported {
            self.lost_reported = true;
            Some(LinkError::ConnectionLost)
        } else {
            None
        }
    }
}

/// Side effects gathered while the state-machine lock is held, executed
/// after it is released.
#[derive(Default)]
struct Actions {
    replies: Vec<Segment>,
    frames: Vec<Frame>,
    lost: Option<LinkError>,
    clean_close: bool,
    wake_senders: bool,
}

/// The reliable-delivery protocol state machine.
///
/// One instance owns one logical connection. Create it, hand it to
/// [`Transport::start`](super::Transport::start), and use
/// [`send_frame`](Controller::send_frame) / [`recv_frame`](Controller::recv_frame)
/// from the application side. The convenience wrapper [`Link`](super::Link)
/// does this wiring for you.
pub struct Controller {
    cfg: LinkConfig,
    machine: Mutex<Machine>,
    outbound: Arc<BoundedQueue<Segment>>,
    delivery: Arc<BoundedQueue<Result<Frame, LinkError>>>,
    window_open: Notify,
    state_tx: watch::Sender<LinkState>,
    shut: AtomicBool,
}

impl Controller {
    /// Create a controller in the `Closed` state.
    pub fn new(cfg: LinkConfig) -> Self {
        let machine = Machine::new(&cfg);
        let (state_tx, _) = watch::channel(LinkState::Closed);
        Self {
            outbound: Arc::new(BoundedQueue::new(cfg.queue_depth)),
            delivery: Arc::new(BoundedQueue::new(cfg.queue_depth)),
            machine: Mutex::new(machine),
            window_open: Notify::new(),
            state_tx,
            shut: AtomicBool::new(false),
            cfg,
        }
    }

    /// This link's configuration.
    pub fn config(&self) -> &LinkConfig {
        &self.cfg
    }

    /// Current connection state.
    pub fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    /// Subscribe to connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    /// Snapshot of the connection counters.
    pub async fn stats(&self) -> LinkStats {
        self.machine.lock().await.stats.clone()
    }

    /// Handle to the outbound segment queue, for the transmit loop.
    pub(crate) fn outbound(&self) -> Arc<BoundedQueue<Segment>> {
        Arc::clone(&self.outbound)
    }

    /// Record a segment dropped before reaching the state machine.
    pub(crate) async fn note_malformed(&self) {
        self.machine.lock().await.stats.drops += 1;
    }

    fn publish(&self, state: LinkState) {
        self.state_tx.send_if_modified(|s| {
            if *s != state {
                *s = state;
                true
            } else {
                false
            }
        });
    }

    /// Initiate the handshake and wait until the connection is established.
    ///
    /// Idempotent: returns immediately when already established, and joins a
    /// handshake already in flight instead of starting a second one.
    pub async fn connect(&self) -> Result<(), LinkError> {
        if self.shut.load(Ordering::Acquire) {
            return Err(LinkError::Closed);
        }
        let syn = {
            let mut m = self.machine.lock().await;
            match m.state {
                LinkState::Established => return Ok(()),
                LinkState::Closing => return Err(LinkError::NotConnected),
                LinkState::Closed => {
                    let seg = m.begin_connect(Instant::now());
                    m.stats.tx_segments += 1;
                    self.publish(LinkState::SynSent);
                    debug!("connecting: SYN seq={}", seg.seq);
                    Some(seg)
                }
                _ => None,
            }
        };
        let mut rx = self.state_tx.subscribe();
        if let Some(seg) = syn {
            self.outbound.push(seg).await?;
        }

        let wait = async {
            loop {
                match *rx.borrow_and_update() {
                    LinkState::Established => return Ok(()),
                    LinkState::Closed => {
                        return Err(if self.shut.load(Ordering::Acquire) {
                            LinkError::Closed
                        } else {
                            LinkError::HandshakeTimeout
                        });
                    }
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(LinkError::Closed);
                }
            }
        };
        match tokio::time::timeout(self.cfg.handshake_timeout, wait).await {
            Ok(res) => res,
            Err(_) => Err(LinkError::HandshakeTimeout),
        }
    }

    async fn ensure_established(&self) -> Result<(), LinkError> {
        {
            let m = self.machine.lock().await;
            match m.state {
                LinkState::Established => return Ok(()),
                LinkState::Closing => return Err(LinkError::NotConnected),
                _ => {}
            }
        }
        self.connect().await
    }

    /// Send one frame, segmenting it at the negotiated MSS.
    ///
    /// Only permitted once established; a closed controller connects first,
    /// so the first send on a fresh link implicitly opens it. Suspends while
    /// the send window is full; this is the flow-control mechanism.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), LinkError> {
        if frame.is_error() {
            return Err(LinkError::ErroredFrame);
        }
        if self.shut.load(Ordering::Acquire) {
            return Err(LinkError::Closed);
        }
        self.ensure_established().await?;

        let mss = {
            let m = self.machine.lock().await;
            (m.params.mss as usize).max(1)
        };
        let payload = frame.payload();
        let nsegs = payload.len().div_ceil(mss).max(1);
        for i in 0..nsegs {
            let chunk = &payload[i * mss..payload.len().min((i + 1) * mss)];
            let eof = i == nsegs - 1;
            let seg = self.stage_segment(chunk, eof).await?;
            self.outbound.push(seg).await?;
        }

        self.machine.lock().await.stats.tx_frames += 1;
        Ok(())
    }

    /// Reserve a window slot and number one outgoing segment, suspending
    /// while the window is full or the peer advertises BUSY.
    async fn stage_segment(&self, chunk: &[u8], eof: bool) -> Result<Segment, LinkError> {
        loop {
            let notified = self.window_open.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut m = self.machine.lock().await;
                if self.shut.load(Ordering::Acquire) {
                    return Err(LinkError::Closed);
                }
                match m.state {
                    LinkState::Established => {
                        if (m.send.len() as u8) < m.params.window && !m.peer_busy {
                            let now = Instant::now();
                            let seq = m.send.next_seq();
                            let seg = Segment::data(
                                seq,
                                m.recv.cumulative(),
                                chunk.to_vec(),
                                eof,
                                self.delivery.is_full(),
                            );
                            let rto = m.params.rto;
                            m.send.record(seg.clone(), now, rto);
                            m.last_tx = now;
                            m.stats.tx_segments += 1;
                            return Ok(seg);
                        }
                    }
                    LinkState::Closed => {
                        return Err(if self.shut.load(Ordering::Acquire) {
                            LinkError::Closed
                        } else {
                            LinkError::ConnectionLost
                        });
                    }
                    LinkState::Closing => return Err(LinkError::NotConnected),
                    // A handshake restarted underneath us; wait it out.
                    _ => {}
                }
            }

            notified.await;
        }
    }

    /// Receive the next frame delivered in order by the peer.
    ///
    /// Frames are delivered whole or not at all. After a connection loss the
    /// terminal error appears here exactly once; after a clean shutdown the
    /// remaining frames drain and then [`LinkError::Closed`] is returned.
    pub async fn recv_frame(&self) -> Result<Frame, LinkError> {
        match self.delivery.pop().await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(err)) => Err(err),
            Err(QueueClosed) => Err(LinkError::Closed),
        }
    }

    /// Graceful teardown: drain the send window, send the farewell, end in
    /// `Closed`.
    pub async fn close(&self) -> Result<(), LinkError> {
        {
            let mut m = self.machine.lock().await;
            match m.state {
                LinkState::Closed => return Ok(()),
                LinkState::Established => {
                    debug!("closing: draining {} outstanding segment(s)", m.send.len());
                    m.state = LinkState::Closing;
                    m.closing_since = Some(Instant::now());
                    self.publish(LinkState::Closing);
                }
                LinkState::Closing => {}
                LinkState::SynSent | LinkState::SynReceived => {
                    let _ = m.reset(ResetReason::LocalClose);
                    self.publish(LinkState::Closed);
                    self.delivery.close();
                    return Ok(());
                }
            }
        }
        self.window_open.notify_waiters();

        let mut rx = self.state_tx.subscribe();
        let drained = async {
            loop {
                if *rx.borrow_and_update() == LinkState::Closed {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        // The timer sweep finishes the teardown; this is only a hard stop.
        let _ = tokio::time::timeout(self.cfg.handshake_timeout * 2, drained).await;
        Ok(())
    }

    /// Process one decoded segment from the transport's inbound queue.
    pub async fn process_segment(&self, seg: Segment) {
        let now = Instant::now();
        let mut actions = Actions::default();
        {
            let mut m = self.machine.lock().await;
            m.stats.rx_segments += 1;
            m.last_rx = now;
            m.missed_beats = 0;
            let was_busy = m.peer_busy;
            m.peer_busy = seg.flags.busy();
            if was_busy && !m.peer_busy {
                actions.wake_senders = true;
            }

            if seg.flags.rst() {
                self.on_rst(&mut m, &mut actions);
            } else if seg.flags.syn() {
                self.on_syn(&mut m, seg, now, &mut actions);
            } else {
                self.on_regular(&mut m, seg, now, &mut actions);
            }

            if !actions.replies.is_empty() {
                m.last_tx = now;
                m.stats.tx_segments += actions.replies.len() as u64;
            }
            m.stats.rx_frames += actions.frames.len() as u64;
        }
        self.finish(actions).await;
    }

    fn on_rst(&self, m: &mut Machine, actions: &mut Actions) {
        if m.state == LinkState::Closed {
            return;
        }
        warn!("received RST in {:?}", m.state);
        let prior = m.state;
        actions.lost = m.reset(ResetReason::PeerReset);
        if prior == LinkState::Closing {
            actions.clean_close = true;
        }
        self.publish(LinkState::Closed);
        actions.wake_senders = true;
    }

    fn on_syn(&self, m: &mut Machine, seg: Segment, now: Instant, actions: &mut Actions) {
        if seg.flags.ack() {
            // SYN+ACK: the responder's half of the handshake.
            match m.state {
                LinkState::SynSent | LinkState::SynReceived if seg.ack == m.syn_seq => {
                    let peer = match SessionParams::decode(&seg.payload) {
                        Ok(p) => p,
                        Err(e) => {
                            debug!("dropping SYN+ACK with bad advertisement: {e}");
                            m.stats.drops += 1;
                            return;
                        }
                    };
                    m.params = SessionParams::negotiate(&m.local, &peer);
                    m.recv = RecvWindow::new(seg.seq, m.params.window);
                    m.establish(now);
                    self.publish(LinkState::Established);
                    debug!(
                        "established (initiator): mss={} window={} rto={:?}",
                        m.params.mss, m.params.window, m.params.rto
                    );
                    actions.wake_senders = true;
                    actions
                        .replies
                        .push(Segment::ack(m.send.last_seq(), seg.seq, false));
                }
                LinkState::Established => {
                    // Our final ACK was lost; answer again.
                    actions.replies.push(Segment::ack(
                        m.send.last_seq(),
                        m.recv.cumulative(),
                        self.delivery.is_full(),
                    ));
                }
                _ => {
                    m.stats.drops += 1;
                }
            }
        } else {
            // Plain SYN: we are the responder.
            match m.state {
                LinkState::Closed | LinkState::SynSent => {
                    let peer = match SessionParams::decode(&seg.payload) {
                        Ok(p) => p,
                        Err(e) => {
                            debug!("dropping SYN with bad advertisement: {e}");
                            m.stats.drops += 1;
                            return;
                        }
                    };
                    m.params = SessionParams::negotiate(&m.local, &peer);
                    m.send = SendWindow::new(m.syn_seq.wrapping_add(1));
                    m.recv = RecvWindow::new(seg.seq, m.params.window);
                    m.state = LinkState::SynReceived;
                    m.hs_last_tx = now;
                    m.hs_retries = 0;
                    self.publish(LinkState::SynReceived);
                    debug!("SYN received (seq={}); answering SYN+ACK", seg.seq);
                    actions
                        .replies
                        .push(Segment::syn_ack(m.syn_seq, seg.seq, m.local.encode()));
                }
                LinkState::SynReceived => {
                    // Duplicate SYN: our SYN+ACK was lost.
                    actions.replies.push(Segment::syn_ack(
                        m.syn_seq,
                        m.recv.cumulative(),
                        m.local.encode(),
                    ));
                }
                LinkState::Established | LinkState::Closing => {
                    warn!("SYN on an active connection; peer restarted");
                    let prior = m.state;
                    actions.lost = m.reset(ResetReason::PeerRestart);
                    if prior == LinkState::Closing {
                        actions.clean_close = true;
                    }
                    self.publish(LinkState::Closed);
                    actions.wake_senders = true;
                }
            }
        }
    }

    fn on_regular(&self, m: &mut Machine, seg: Segment, now: Instant, actions: &mut Actions) {
        if seg.flags.ack() {
            if m.state == LinkState::SynReceived && seg.ack == m.syn_seq {
                m.establish(now);
                self.publish(LinkState::Established);
                debug!(
                    "established (responder): mss={} window={} rto={:?}",
                    m.params.mss, m.params.window, m.params.rto
                );
                actions.wake_senders = true;
            }
            let cleared = m.send.ack_up_to(seg.ack);
            if cleared > 0 {
                trace!("ack {} cleared {} segment(s)", seg.ack, cleared);
                actions.wake_senders = true;
                if m.state == LinkState::Closing && m.send.is_empty() {
                    self.finish_close(m, actions);
                    return;
                }
            }
            // A non-advancing acknowledgment is a deliberate no-op: no
            // fast retransmit in this protocol.
        }

        if seg.flags.nul() {
            if !seg.payload.is_empty() {
                warn!("NUL segment with payload");
                self.violation(m, actions);
                return;
            }
            if matches!(m.state, LinkState::Established | LinkState::Closing) {
                trace!("heartbeat from peer");
                actions.replies.push(Segment::ack(
                    m.send.last_seq(),
                    m.recv.cumulative(),
                    self.delivery.is_full(),
                ));
            }
            return;
        }

        if !seg.is_data() {
            return;
        }

        match m.state {
            LinkState::Established | LinkState::Closing => {
                if seg.payload.len() > m.params.mss as usize {
                    warn!(
                        "segment payload {} exceeds negotiated mss {}",
                        seg.payload.len(),
                        m.params.mss
                    );
                    self.violation(m, actions);
                    return;
                }
                let busy = self.delivery.is_full();
                match m.recv.accept(seg) {
                    RecvOutcome::Accepted(frames) => {
                        actions.frames = frames;
                        actions.replies.push(Segment::ack(
                            m.send.last_seq(),
                            m.recv.cumulative(),
                            busy,
                        ));
                    }
                    RecvOutcome::Buffered => {
                        actions.replies.push(Segment::ack(
                            m.send.last_seq(),
                            m.recv.cumulative(),
                            busy,
                        ));
                    }
                    RecvOutcome::Duplicate => {
                        // The peer may have missed our ack; repeat it.
                        m.stats.drops += 1;
                        actions.replies.push(Segment::ack(
                            m.send.last_seq(),
                            m.recv.cumulative(),
                            busy,
                        ));
                    }
                    RecvOutcome::TooFarAhead => {
                        warn!("sequence gap beyond window capacity");
                        self.violation(m, actions);
                    }
                }
            }
            LinkState::Closed => {
                // Stray traffic from a dead session: tell the peer.
                m.stats.drops += 1;
                actions.replies.push(Segment::rst(m.send.last_seq(), 0));
            }
            _ => {
                m.stats.drops += 1;
            }
        }
    }

    fn violation(&self, m: &mut Machine, actions: &mut Actions) {
        let prior = m.state;
        let last = m.send.last_seq();
        let cum = m.recv.cumulative();
        actions.lost = m.reset(ResetReason::Violation);
        if prior == LinkState::Closing {
            actions.clean_close = true;
        }
        self.publish(LinkState::Closed);
        actions.wake_senders = true;
        actions.replies.push(Segment::rst(last, cum));
    }

    fn finish_close(&self, m: &mut Machine, actions: &mut Actions) {
        let last = m.send.last_seq();
        let cum = m.recv.cumulative();
        let _ = m.reset(ResetReason::LocalClose);
        self.publish(LinkState::Closed);
        debug!("close complete");
        actions.clean_close = true;
        actions.wake_senders = true;
        actions.replies.push(Segment::rst(last, cum));
    }

    /// Periodic timer sweep: handshake retries, retransmissions, keep-alive,
    /// dead-peer detection, and teardown completion.
    ///
    /// Driven by the transport's dispatch loop so that timer work and
    /// segment processing serialize through the same lock.
    pub async fn on_tick(&self) {
        let now = Instant::now();
        let mut actions = Actions::default();
        {
            let mut m = self.machine.lock().await;
            match m.state {
                LinkState::Closed => {}
                LinkState::SynSent | LinkState::SynReceived => {
                    self.tick_handshake(&mut m, now, &mut actions);
                }
                LinkState::Established | LinkState::Closing => {
                    self.tick_active(&mut m, now, &mut actions);
                }
            }
            if !actions.replies.is_empty() {
                m.last_tx = now;
                m.stats.tx_segments += actions.replies.len() as u64;
            }
        }
        self.finish(actions).await;
    }

    fn tick_handshake(&self, m: &mut Machine, now: Instant, actions: &mut Actions) {
        if now.duration_since(m.hs_last_tx) < m.local.rto {
            return;
        }
        if m.hs_retries >= m.local.max_retries {
            warn!("handshake retry limit exceeded in {:?}", m.state);
            let _ = m.reset(ResetReason::HandshakeFailure);
            self.publish(LinkState::Closed);
            actions.wake_senders = true;
            return;
        }
        m.hs_retries += 1;
        m.hs_last_tx = now;
        let seg = match m.state {
            LinkState::SynSent => Segment::syn(m.syn_seq, m.local.encode()),
            _ => Segment::syn_ack(m.syn_seq, m.recv.cumulative(), m.local.encode()),
        };
        debug!("handshake retry {}/{}", m.hs_retries, m.local.max_retries);
        actions.replies.push(seg);
    }

    fn tick_active(&self, m: &mut Machine, now: Instant, actions: &mut Actions) {
        let busy = self.delivery.is_full();
        let cum = m.recv.cumulative();
        let max_retries = m.params.max_retries;
        let sweep = m.send.sweep(now, max_retries, MAX_BACKOFF_RTO, cum, busy);
        if sweep.exhausted {
            warn!("retransmission limit exceeded");
            let prior = m.state;
            let last = m.send.last_seq();
            actions.lost = m.reset(ResetReason::RetryLimit);
            if prior == LinkState::Closing {
                actions.clean_close = true;
            }
            self.publish(LinkState::Closed);
            actions.wake_senders = true;
            actions.replies.push(Segment::rst(last, cum));
            return;
        }
        if !sweep.resend.is_empty() {
            debug!("retransmitting {} segment(s)", sweep.resend.len());
            m.stats.retransmits += sweep.resend.len() as u64;
            actions.replies.extend(sweep.resend);
        }

        if m.state == LinkState::Established {
            if now.duration_since(m.last_tx) >= m.params.keepalive {
                trace!("link idle; sending heartbeat");
                actions
                    .replies
                    .push(Segment::nul(m.send.last_seq(), m.recv.cumulative()));
            }
            let silent = now.duration_since(m.last_rx);
            if silent >= m.params.keepalive * (m.missed_beats + 1) {
                m.missed_beats += 1;
                warn!(
                    "missed heartbeat {}/{}",
                    m.missed_beats, self.cfg.max_missed_heartbeats
                );
                if m.missed_beats > self.cfg.max_missed_heartbeats {
                    let last = m.send.last_seq();
                    actions.lost = m.reset(ResetReason::PeerDead);
                    self.publish(LinkState::Closed);
                    actions.wake_senders = true;
                    actions.replies.push(Segment::rst(last, cum));
                }
            }
        } else {
            // Closing: finish once drained or after the grace period.
            let expired = m
                .closing_since
                .map(|t| now.duration_since(t) >= self.cfg.handshake_timeout)
                .unwrap_or(true);
            if m.send.is_empty() || expired {
                self.finish_close(m, actions);
            }
        }
    }

    /// Execute the side effects gathered under the lock.
    async fn finish(&self, actions: Actions) {
        if actions.wake_senders {
            self.window_open.notify_waiters();
        }
        for seg in actions.replies {
            if self.outbound.push(seg).await.is_err() {
                return;
            }
        }
        for frame in actions.frames {
            if self.delivery.push(Ok(frame)).await.is_err() {
                return;
            }
        }
        if let Some(err) = actions.lost {
            let _ = self.delivery.push(Err(err)).await;
            self.delivery.close();
        } else if actions.clean_close {
            self.delivery.close();
        }
    }

    /// Synchronous part of shutdown, safe to call from `Drop`.
    pub(crate) fn shutdown_now(&self) {
        self.shut.store(true, Ordering::Release);
        self.outbound.close();
        self.delivery.close();
        self.window_open.notify_waiters();
    }

    /// Stop the controller for good: close the queues, wake every waiter,
    /// and drop all connection state.
    pub(crate) async fn shutdown(&self) {
        self.shutdown_now();
        {
            let mut m = self.machine.lock().await;
            if m.state != LinkState::Closed {
                let _ = m.reset(ResetReason::LocalClose);
            }
        }
        // Force a state notification even if the machine was already closed,
        // and wake window waiters that checked before `shut` was visible.
        let _ = self.state_tx.send(LinkState::Closed);
        self.window_open.notify_waiters();
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn cfg() -> LinkConfig {
        LinkConfig {
            rto: Duration::from_millis(50),
            handshake_timeout: Duration::from_millis(500),
            ..LinkConfig::default()
        }
    }

    async fn pop_outbound(c: &Controller) -> Segment {
        c.outbound().pop().await.unwrap()
    }

    #[tokio::test]
    async fn responder_handshake_reaches_established() {
        let c = Controller::new(cfg());
        assert_eq!(c.state(), LinkState::Closed);

        let advert = LinkConfig::default().session().encode();
        c.process_segment(Segment::syn(9, advert)).await;
        assert_eq!(c.state(), LinkState::SynReceived);

        let syn_ack = pop_outbound(&c).await;
        assert!(syn_ack.flags.syn() && syn_ack.flags.ack());
        assert_eq!(syn_ack.ack, 9);

        c.process_segment(Segment::ack(9, syn_ack.seq, false)).await;
        assert_eq!(c.state(), LinkState::Established);
    }

    #[tokio::test]
    async fn initiator_handshake_reaches_established() {
        let c = Arc::new(Controller::new(cfg()));
        let c2 = c.clone();
        let connecting = tokio::spawn(async move { c2.connect().await });

        let syn = pop_outbound(&c).await;
        assert!(syn.flags.syn() && !syn.flags.ack());

        let advert = LinkConfig::default().session().encode();
        c.process_segment(Segment::syn_ack(40, syn.seq, advert))
            .await;
        connecting.await.unwrap().unwrap();
        assert_eq!(c.state(), LinkState::Established);

        // The final ACK of the handshake went out.
        let ack = pop_outbound(&c).await;
        assert!(ack.flags.ack() && !ack.flags.syn());
        assert_eq!(ack.ack, 40);
    }

    #[tokio::test]
    async fn session_params_negotiated_to_minimum() {
        let mut local = cfg();
        local.mss = 2048;
        local.window = 16;
        let c = Controller::new(local);

        let peer = SessionParams {
            mss: 256,
            window: 4,
            rto: Duration::from_millis(50),
            keepalive: Duration::from_secs(3),
            max_retries: 15,
        };
        c.process_segment(Segment::syn(0, peer.encode())).await;
        let _ = pop_outbound(&c).await;
        c.process_segment(Segment::ack(0, 0, false)).await;
        assert_eq!(c.state(), LinkState::Established);

        let m = c.machine.lock().await;
        assert_eq!(m.params.mss, 256);
        assert_eq!(m.params.window, 4);
    }

    async fn established_responder() -> Arc<Controller> {
        let c = Arc::new(Controller::new(cfg()));
        let advert = LinkConfig::default().session().encode();
        c.process_segment(Segment::syn(0, advert)).await;
        let syn_ack = pop_outbound(&c).await;
        c.process_segment(Segment::ack(0, syn_ack.seq, false)).await;
        assert_eq!(c.state(), LinkState::Established);
        c
    }

    #[tokio::test]
    async fn in_order_data_is_delivered_and_acked() {
        let c = established_responder().await;

        c.process_segment(Segment::data(1, 0, b"hi".to_vec(), true, false))
            .await;
        let frame = c.recv_frame().await.unwrap();
        assert_eq!(frame.payload(), b"hi");

        let ack = pop_outbound(&c).await;
        assert!(ack.flags.ack());
        assert_eq!(ack.ack, 1);
    }

    #[tokio::test]
    async fn duplicate_data_dropped_but_reacked() {
        let c = established_responder().await;

        c.process_segment(Segment::data(1, 0, b"x".to_vec(), true, false))
            .await;
        let _ = c.recv_frame().await.unwrap();
        let _first_ack = pop_outbound(&c).await;

        // Redelivery of the same segment: no second frame, but a fresh ack.
        c.process_segment(Segment::data(1, 0, b"x".to_vec(), true, false))
            .await;
        let ack = pop_outbound(&c).await;
        assert_eq!(ack.ack, 1);
        assert!(c.delivery.is_empty());
        assert_eq!(c.stats().await.rx_frames, 1);
    }

    #[tokio::test]
    async fn rst_surfaces_connection_lost_exactly_once() {
        let c = established_responder().await;

        c.process_segment(Segment::rst(0, 0)).await;
        assert_eq!(c.state(), LinkState::Closed);
        assert_eq!(c.recv_frame().await, Err(LinkError::ConnectionLost));
        // Afterwards the queue is just closed.
        assert_eq!(c.recv_frame().await, Err(LinkError::Closed));
    }

    #[tokio::test]
    async fn duplicate_ack_is_noop() {
        let c = established_responder().await;

        let send_task = {
            let c = c.clone();
            tokio::spawn(async move { c.send_frame(Frame::new(b"abc".to_vec())).await })
        };
        let data = pop_outbound(&c).await;
        assert!(data.is_data());
        send_task.await.unwrap().unwrap();

        c.process_segment(Segment::ack(0, data.seq, false)).await;
        let cleared = { c.machine.lock().await.send.len() };
        assert_eq!(cleared, 0);

        // The same ack again changes nothing and produces no reply.
        c.process_segment(Segment::ack(0, data.seq, false)).await;
        assert!(c.outbound.is_empty());
    }

    #[tokio::test]
    async fn window_full_blocks_sender_until_ack() {
        let mut config = cfg();
        config.window = 2;
        // A large rto keeps the sweep quiet during the test.
        config.rto = Duration::from_secs(5);
        let c = Arc::new(Controller::new(config));
        let advert = SessionParams {
            window: 2,
            ..LinkConfig::default().session()
        }
        .encode();
        c.process_segment(Segment::syn(0, advert)).await;
        let syn_ack = pop_outbound(&c).await;
        c.process_segment(Segment::ack(0, syn_ack.seq, false)).await;

        // Three single-segment frames against a window of two.
        let sender = {
            let c = c.clone();
            tokio::spawn(async move {
                for _ in 0..3 {
                    c.send_frame(Frame::new(b"p".to_vec())).await.unwrap();
                }
            })
        };

        let first = pop_outbound(&c).await;
        let _second = pop_outbound(&c).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        {
            let m = c.machine.lock().await;
            assert_eq!(m.send.len(), 2, "window bound exceeded");
        }
        assert!(!sender.is_finished());

        // Ack the first segment; the blocked sender proceeds.
        c.process_segment(Segment::ack(0, first.seq, false)).await;
        let _third = pop_outbound(&c).await;
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn errored_frame_refused() {
        let c = established_responder().await;
        assert_eq!(
            c.send_frame(Frame::with_error(b"bad".to_vec())).await,
            Err(LinkError::ErroredFrame)
        );
    }

    #[tokio::test]
    async fn connect_times_out_without_peer() {
        let mut config = cfg();
        config.handshake_timeout = Duration::from_millis(100);
        let c = Controller::new(config);
        assert_eq!(c.connect().await, Err(LinkError::HandshakeTimeout));
    }

    #[tokio::test]
    async fn peer_busy_gates_new_data() {
        let c = established_responder().await;

        // Peer advertises BUSY.
        c.process_segment(Segment::ack(0, 0, true)).await;

        let sender = {
            let c = c.clone();
            tokio::spawn(async move { c.send_frame(Frame::new(b"q".to_vec())).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!sender.is_finished(), "sender ignored BUSY");

        // BUSY clears.
        c.process_segment(Segment::ack(0, 0, false)).await;
        sender.await.unwrap().unwrap();
    }
}
