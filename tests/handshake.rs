//! Integration tests for connection establishment and teardown.
//!
//! Each test wires two in-process endpoints through a simulated channel
//! pair. Both sides run as separate tokio tasks so they make progress
//! concurrently.

use std::time::Duration;

use seglink::channel::sim::{FaultPlan, FaultyChannel, channel_pair};
use seglink::{Link, LinkConfig, LinkError, LinkState};

fn test_cfg() -> LinkConfig {
    LinkConfig {
        rto: Duration::from_millis(40),
        read_timeout: Duration::from_millis(20),
        tick: Duration::from_millis(5),
        handshake_timeout: Duration::from_secs(2),
        keepalive: Duration::from_secs(60),
        ..LinkConfig::default()
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ---------------------------------------------------------------------------
// Establishment
// ---------------------------------------------------------------------------

#[tokio::test]
async fn handshake_over_lossless_pair() {
    init_logging();
    let (a, b) = channel_pair(32);

    let (server, client) = tokio::join!(
        Link::accept(a, test_cfg()),
        Link::connect(b, test_cfg()),
    );
    let (server, client) = (server.unwrap(), client.unwrap());

    assert_eq!(server.state(), LinkState::Established);
    assert_eq!(client.state(), LinkState::Established);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn handshake_survives_syn_loss() {
    init_logging();
    let (a, b) = channel_pair(32);
    // Datagram #0 from the initiator is the SYN; drop it once.
    let b = FaultyChannel::new(b, FaultPlan::dropping([0]));

    let (server, client) = tokio::join!(
        Link::accept(a, test_cfg()),
        Link::connect(b, test_cfg()),
    );
    let (server, client) = (server.unwrap(), client.unwrap());

    assert_eq!(client.state(), LinkState::Established);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn handshake_survives_final_ack_loss() {
    init_logging();
    let (a, b) = channel_pair(32);
    // Datagram #1 from the initiator is the final ACK of the handshake; the
    // responder recovers via its SYN+ACK retry.
    let b = FaultyChannel::new(b, FaultPlan::dropping([1]));

    let (server, client) = tokio::join!(
        Link::accept(a, test_cfg()),
        Link::connect(b, test_cfg()),
    );
    let (server, client) = (server.unwrap(), client.unwrap());

    assert_eq!(server.state(), LinkState::Established);
    assert_eq!(client.state(), LinkState::Established);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn connect_without_peer_times_out() {
    init_logging();
    let (a, _b) = channel_pair(32);

    let mut cfg = test_cfg();
    cfg.handshake_timeout = Duration::from_millis(300);
    let err = Link::connect(a, cfg).await.err();
    assert_eq!(err, Some(LinkError::HandshakeTimeout));
}

#[tokio::test]
async fn auto_connect_on_first_send() {
    init_logging();
    let (a, b) = channel_pair(32);

    // Neither side dials explicitly; the first send runs the handshake.
    let server = Link::attach(a, test_cfg());
    let client = Link::attach(b, test_cfg());

    client.send(b"implicit open".to_vec()).await.unwrap();
    let frame = server.recv().await.unwrap();
    assert_eq!(frame.payload(), b"implicit open");
    assert_eq!(client.state(), LinkState::Established);

    client.shutdown().await;
    server.shutdown().await;
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn peer_close_surfaces_connection_lost_exactly_once() {
    init_logging();
    let (a, b) = channel_pair(32);

    let (server, client) = tokio::join!(
        Link::accept(a, test_cfg()),
        Link::connect(b, test_cfg()),
    );
    let (server, client) = (server.unwrap(), client.unwrap());

    client.close().await.unwrap();
    assert_eq!(client.state(), LinkState::Closed);

    // The passive side sees the farewell RST as a connection loss,
    // surfaced exactly once; afterwards the inbound queue is just closed.
    assert_eq!(server.recv().await, Err(LinkError::ConnectionLost));
    assert_eq!(server.recv().await, Err(LinkError::Closed));
    assert_eq!(server.state(), LinkState::Closed);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn close_delivers_outstanding_data_first() {
    init_logging();
    let (a, b) = channel_pair(32);

    let (server, client) = tokio::join!(
        Link::accept(a, test_cfg()),
        Link::connect(b, test_cfg()),
    );
    let (server, client) = (server.unwrap(), client.unwrap());

    client.send(b"last words".to_vec()).await.unwrap();
    client.close().await.unwrap();

    // The frame sent before close must still arrive whole.
    let frame = server.recv().await.unwrap();
    assert_eq!(frame.payload(), b"last words");
    assert_eq!(server.recv().await, Err(LinkError::ConnectionLost));

    client.shutdown().await;
    server.shutdown().await;
}
