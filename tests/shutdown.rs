//! Integration tests for cancellation, shutdown, and dead-peer detection.

use std::sync::Arc;
use std::time::Duration;

use seglink::channel::sim::channel_pair;
use seglink::{BoundedQueue, Frame, Link, LinkConfig, LinkError, LinkState, QueueClosed};

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
// Shutdown unblocks every waiter in bounded time
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_unblocks_blocked_send_and_recv() {
    init_logging();
    let (a, b) = channel_pair(64);

    let mut cfg = test_cfg();
    cfg.window = 2;
    // Retransmissions would otherwise hit the retry limit while the peer is
    // wedged; keep the sweep quiet for the duration of the test.
    cfg.rto = Duration::from_secs(30);
    let (server, client) = tokio::join!(
        Link::accept(a, cfg.clone()),
        Link::connect(b, cfg),
    );
    let (server, client) = (server.unwrap(), client.unwrap());

    // Blocked receiver: nothing is ever delivered to the client.
    let receiver = {
        let ctl = client.controller().clone();
        tokio::spawn(async move { ctl.recv_frame().await })
    };

    // Blocked sender: the server application never reads, so the server's
    // delivery queue saturates, its dispatch loop stalls, acknowledgments
    // stop, and the client's send window fills.
    let sender = {
        let ctl = client.controller().clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = ctl.send_frame(Frame::new(vec![0u8; 8])).await {
                    return e;
                }
            }
        })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!sender.is_finished(), "sender never hit backpressure");
    assert!(!receiver.is_finished());

    // Both blocked callers must unblock with a clean shutdown signal within
    // bounded time.
    let (recv_err, send_err) = tokio::time::timeout(Duration::from_secs(2), async {
        client.shutdown().await;
        (receiver.await.unwrap(), sender.await.unwrap())
    })
    .await
    .expect("shutdown did not unblock waiters in bounded time");

    assert_eq!(recv_err, Err(LinkError::Closed));
    assert_eq!(send_err, LinkError::Closed);

    server.shutdown().await;
}

#[tokio::test]
async fn queue_waiters_unblock_on_close() {
    init_logging();
    let q = Arc::new(BoundedQueue::new(4));
    for i in 0..4u32 {
        q.push(i).await.unwrap();
    }

    let qp = q.clone();
    let blocked_push = tokio::spawn(async move { qp.push(99).await });
    let empty = Arc::new(BoundedQueue::<u32>::new(4));
    let qe = empty.clone();
    let blocked_pop = tokio::spawn(async move { qe.pop().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    q.close();
    empty.close();

    let results = tokio::time::timeout(Duration::from_secs(1), async {
        (blocked_push.await.unwrap(), blocked_pop.await.unwrap())
    })
    .await
    .expect("close did not wake blocked queue callers");

    assert_eq!(results.0, Err(QueueClosed));
    assert_eq!(results.1, Err(QueueClosed));
}

// ---------------------------------------------------------------------------
// Stopped transports stay stopped
// ---------------------------------------------------------------------------

#[tokio::test]
async fn peer_of_stopped_transport_sees_connection_lost() {
    init_logging();
    let (a, b) = channel_pair(64);

    let mut cfg = test_cfg();
    cfg.max_retries = 3;
    cfg.rto = Duration::from_millis(30);
    let (server, client) = tokio::join!(
        Link::accept(a, cfg.clone()),
        Link::connect(b, cfg),
    );
    let (server, client) = (server.unwrap(), client.unwrap());

    // Kill the client outright; no farewell is sent.
    client.shutdown().await;

    // The server's next frame goes unacknowledged until the retry limit
    // forces a reset, surfaced as a single connection-lost event.
    server.send(b"anyone there?".to_vec()).await.unwrap();
    let err = tokio::time::timeout(Duration::from_secs(5), server.recv())
        .await
        .expect("retry limit never tripped");
    assert_eq!(err, Err(LinkError::ConnectionLost));
    assert_eq!(server.state(), LinkState::Closed);

    server.shutdown().await;
}

// ---------------------------------------------------------------------------
// Keep-alive
// ---------------------------------------------------------------------------

#[tokio::test]
async fn heartbeats_keep_idle_link_alive() {
    init_logging();
    let mut cfg = test_cfg();
    cfg.keepalive = Duration::from_millis(100);
    cfg.max_missed_heartbeats = 2;

    let (a, b) = channel_pair(64);
    let (server, client) = tokio::join!(
        Link::accept(a, cfg.clone()),
        Link::connect(b, cfg),
    );
    let (server, client) = (server.unwrap(), client.unwrap());

    // Well past several keep-alive intervals with no data traffic.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(server.state(), LinkState::Established);
    assert_eq!(client.state(), LinkState::Established);

    // The link still works.
    client.send(b"still here".to_vec()).await.unwrap();
    assert_eq!(server.recv().await.unwrap().payload(), b"still here");

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn silent_peer_detected_by_missed_heartbeats() {
    init_logging();
    let mut cfg = test_cfg();
    cfg.keepalive = Duration::from_millis(100);
    cfg.max_missed_heartbeats = 2;

    let (a, b) = channel_pair(64);
    let (server, client) = tokio::join!(
        Link::accept(a, cfg.clone()),
        Link::connect(b, cfg),
    );
    let (server, client) = (server.unwrap(), client.unwrap());

    // Silence one side without any farewell.
    client.shutdown().await;

    let err = tokio::time::timeout(Duration::from_secs(5), server.recv())
        .await
        .expect("dead peer never detected");
    assert_eq!(err, Err(LinkError::ConnectionLost));

    server.shutdown().await;
}
