//! Bridge behaviour against a scripted decision process
//!
//! The decision process is the far end of a `UnixDatagram::pair()`; the
//! kernel-facing side runs on plain threads calling `Bridge::decide`.

use nfbridge::bridge::{Bridge, DecisionChannel, Dispatcher, Gate};
use nfbridge::capture::CapturedPacket;
use nfbridge::config::{ChannelConfig, FallbackVerdict, VerdictConfig};
use nfbridge::wire::frame::{FRAME_SIZE, PAYLOAD_CAPACITY};
use nfbridge::wire::{PacketRecord, RequestFrame, ResponseFrame, Timeval, Verdict, VerdictCode};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::net::UnixDatagram;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

struct Packet {
    id: u32,
    payload: Vec<u8>,
}

impl Packet {
    fn new(id: u32, payload: &[u8]) -> Self {
        Self {
            id,
            payload: payload.to_vec(),
        }
    }
}

impl CapturedPacket for Packet {
    fn packet_id(&self) -> u32 {
        self.id
    }

    fn indev(&self) -> u32 {
        2
    }

    fn timestamp(&self) -> Option<Timeval> {
        Some(Timeval::new(1_700_000_000, 500))
    }

    fn payload(&self) -> Option<&[u8]> {
        Some(&self.payload)
    }
}

fn make_bridge(timeout_ms: u64, fallback: FallbackVerdict) -> Arc<Bridge> {
    Arc::new(Bridge::new(VerdictConfig {
        timeout_ms,
        fallback,
    }))
}

/// Bridge plus running dispatcher; returns the decision process socket
fn start(bridge: &Arc<Bridge>) -> (UnixDatagram, JoinHandle<nfbridge::Result<()>>) {
    let (bridge_side, decider) = UnixDatagram::pair().unwrap();
    let channel = DecisionChannel::from_connected(bridge_side);
    let dispatcher = tokio::spawn(Dispatcher::new(bridge.clone(), channel).run());
    (decider, dispatcher)
}

/// Run `decide` on its own thread, like a kernel callback would
fn decide_async(bridge: &Arc<Bridge>, packet: Packet) -> JoinHandle<Verdict> {
    let bridge = bridge.clone();
    tokio::task::spawn_blocking(move || bridge.decide(&packet))
}

async fn recv_request(decider: &UnixDatagram) -> PacketRecord {
    let mut buf = vec![0u8; FRAME_SIZE + 64];
    let len = tokio::time::timeout(WAIT, decider.recv(&mut buf))
        .await
        .expect("request within timeout")
        .unwrap();
    RequestFrame::parse(&buf[..len]).unwrap().to_record()
}

async fn respond(decider: &UnixDatagram, uid: u32, code: impl Into<VerdictCode>) {
    let frame = ResponseFrame::new(uid, code);
    decider.send(&frame.encode()).await.unwrap();
}

async fn join<T>(handle: JoinHandle<T>) -> T {
    tokio::time::timeout(WAIT, handle)
        .await
        .expect("finished within timeout")
        .unwrap()
}

#[tokio::test]
async fn test_drop_verdict_round_trip() {
    let bridge = make_bridge(5000, FallbackVerdict::Accept);
    let (decider, dispatcher) = start(&bridge);

    let waiter = decide_async(&bridge, Packet::new(7, b"GET /"));

    let request = recv_request(&decider).await;
    assert_eq!(request.uid, 7);
    assert_eq!(request.indev, 2);
    assert_eq!(request.timestamp, Timeval::new(1_700_000_000, 500));
    assert_eq!(request.payload(), b"GET /");

    respond(&decider, 7, Verdict::Drop).await;
    assert_eq!(join(waiter).await, Verdict::Drop);

    assert!(!bridge.table().contains(7));
    assert!(bridge.backlog().is_empty());
    assert_eq!(bridge.metrics().dropped.get(), 1);

    bridge.liveness().shutdown();
    join(dispatcher).await.unwrap();
}

#[tokio::test]
async fn test_requests_sent_in_fifo_order() {
    let bridge = make_bridge(5000, FallbackVerdict::Accept);

    // Queue before the dispatcher exists
    let gates: Vec<Arc<Gate>> = (10..15)
        .map(|uid| {
            bridge
                .submit(PacketRecord::new(uid, 0, Timeval::default(), b"x"))
                .unwrap()
        })
        .collect();
    let (decider, dispatcher) = start(&bridge);

    for uid in 10..15 {
        assert_eq!(recv_request(&decider).await.uid, uid);
    }

    // Answer out of order; matching is by uid only
    for uid in (10..15).rev() {
        let verdict = if uid % 2 == 0 {
            Verdict::Accept
        } else {
            Verdict::Drop
        };
        respond(&decider, uid, verdict).await;
    }

    for (uid, gate) in (10..15).zip(&gates) {
        let gate = gate.clone();
        let verdict = join(tokio::task::spawn_blocking(move || gate.wait())).await;
        let expected = if uid % 2 == 0 {
            Verdict::Accept
        } else {
            Verdict::Drop
        };
        assert_eq!(verdict, expected, "uid {}", uid);
    }

    bridge.liveness().shutdown();
    join(dispatcher).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_submitters_get_their_own_verdicts() {
    let bridge = make_bridge(5000, FallbackVerdict::Accept);
    let (decider, dispatcher) = start(&bridge);

    let waiters: Vec<_> = (100..132)
        .map(|uid| decide_async(&bridge, Packet::new(uid, &uid.to_ne_bytes())))
        .collect();

    let mut seen = Vec::new();
    for _ in 100..132 {
        let request = recv_request(&decider).await;
        assert_eq!(request.payload(), &request.uid.to_ne_bytes());
        seen.push(request.uid);
    }
    seen.sort();
    assert_eq!(seen, (100..132).collect::<Vec<u32>>());

    for uid in seen.iter().rev() {
        let verdict = if uid % 3 == 0 {
            Verdict::Drop
        } else {
            Verdict::Accept
        };
        respond(&decider, *uid, verdict).await;
    }

    for (uid, waiter) in (100..132u32).zip(waiters) {
        let expected = if uid % 3 == 0 {
            Verdict::Drop
        } else {
            Verdict::Accept
        };
        assert_eq!(join(waiter).await, expected, "uid {}", uid);
    }

    let metrics = bridge.metrics();
    assert_eq!(metrics.submitted.get(), 32);
    assert_eq!(metrics.dispatched.get(), 32);
    assert_eq!(metrics.accepted.get() + metrics.dropped.get(), 32);
    assert!(bridge.table().is_empty());

    bridge.liveness().shutdown();
    join(dispatcher).await.unwrap();
}

#[tokio::test]
async fn test_stale_response_is_ignored() {
    let bridge = make_bridge(5000, FallbackVerdict::Accept);
    let (decider, dispatcher) = start(&bridge);

    respond(&decider, 99, Verdict::Drop).await;

    // Dispatcher is still healthy afterwards
    let waiter = decide_async(&bridge, Packet::new(1, b"ping"));
    assert_eq!(recv_request(&decider).await.uid, 1);
    respond(&decider, 1, Verdict::Accept).await;
    assert_eq!(join(waiter).await, Verdict::Accept);

    // Duplicate answer for an already settled uid
    respond(&decider, 1, Verdict::Drop).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(bridge.metrics().stale_responses.get(), 2);
    assert!(bridge.liveness().is_alive());

    bridge.liveness().shutdown();
    join(dispatcher).await.unwrap();
}

#[tokio::test]
async fn test_invalid_verdict_code_fails_open() {
    let bridge = make_bridge(5000, FallbackVerdict::Drop);
    let (decider, dispatcher) = start(&bridge);

    let waiter = decide_async(&bridge, Packet::new(5, b"x"));
    assert_eq!(recv_request(&decider).await.uid, 5);
    respond(&decider, 5, VerdictCode::Invalid(42)).await;

    assert_eq!(join(waiter).await, Verdict::Accept);
    assert_eq!(bridge.metrics().protocol_violations.get(), 1);

    bridge.liveness().shutdown();
    join(dispatcher).await.unwrap();
}

#[tokio::test]
async fn test_no_verdict_keeps_packet_in_flight() {
    let bridge = make_bridge(5000, FallbackVerdict::Accept);
    let (decider, dispatcher) = start(&bridge);

    let waiter = decide_async(&bridge, Packet::new(8, b"x"));
    assert_eq!(recv_request(&decider).await.uid, 8);

    respond(&decider, 8, VerdictCode::None).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bridge.table().contains(8));
    assert!(!waiter.is_finished());

    respond(&decider, 8, Verdict::Drop).await;
    assert_eq!(join(waiter).await, Verdict::Drop);

    bridge.liveness().shutdown();
    join(dispatcher).await.unwrap();
}

#[tokio::test]
async fn test_malformed_response_is_discarded() {
    let bridge = make_bridge(5000, FallbackVerdict::Accept);
    let (decider, dispatcher) = start(&bridge);

    decider.send(&[1, 2, 3]).await.unwrap();
    decider.send(&[0u8; 64]).await.unwrap();

    let waiter = decide_async(&bridge, Packet::new(3, b"x"));
    assert_eq!(recv_request(&decider).await.uid, 3);
    respond(&decider, 3, Verdict::Drop).await;
    assert_eq!(join(waiter).await, Verdict::Drop);
    assert_eq!(bridge.metrics().protocol_violations.get(), 2);

    bridge.liveness().shutdown();
    join(dispatcher).await.unwrap();
}

#[tokio::test]
async fn test_timeout_falls_back_and_late_answer_is_stale() {
    let bridge = make_bridge(50, FallbackVerdict::Drop);
    let (decider, dispatcher) = start(&bridge);

    let waiter = decide_async(&bridge, Packet::new(21, b"slow"));
    assert_eq!(recv_request(&decider).await.uid, 21);

    assert_eq!(join(waiter).await, Verdict::Drop);
    assert!(!bridge.table().contains(21));
    assert_eq!(bridge.metrics().timeouts.get(), 1);

    respond(&decider, 21, Verdict::Accept).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bridge.metrics().stale_responses.get(), 1);

    bridge.liveness().shutdown();
    join(dispatcher).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_releases_pending_gates() {
    let bridge = make_bridge(0, FallbackVerdict::Drop);
    let (decider, dispatcher) = start(&bridge);

    let waiters: Vec<_> = (1..=4)
        .map(|uid| decide_async(&bridge, Packet::new(uid, b"never answered")))
        .collect();
    for _ in 1..=4 {
        recv_request(&decider).await;
    }

    // One more that never reaches the table
    let queued = bridge
        .submit(PacketRecord::new(50, 0, Timeval::default(), b""))
        .unwrap();

    bridge.liveness().shutdown();
    join(dispatcher).await.unwrap();

    for waiter in waiters {
        assert_eq!(join(waiter).await, Verdict::Accept);
    }
    assert_eq!(queued.state(), Some(Verdict::Accept));
    assert!(bridge.table().is_empty());
    assert!(bridge.backlog().is_empty());
    assert_eq!(bridge.metrics().released.get(), 5);

    // Anything after shutdown is accepted without waiting
    let late = decide_async(&bridge, Packet::new(60, b"late"));
    assert_eq!(join(late).await, Verdict::Accept);
}

#[tokio::test]
async fn test_send_without_peer_fails_open() {
    let path = std::env::temp_dir().join(format!("nfbridge-nopeer-{}.sock", std::process::id()));
    let config = ChannelConfig {
        socket_path: path.clone(),
        peer_path: None,
    };

    let bridge = make_bridge(5000, FallbackVerdict::Drop);
    let channel = DecisionChannel::bind(&config).unwrap();
    let dispatcher = tokio::spawn(Dispatcher::new(bridge.clone(), channel).run());

    let verdict = join(decide_async(&bridge, Packet::new(4, b"x"))).await;
    assert_eq!(verdict, Verdict::Accept);
    assert_eq!(bridge.metrics().send_failures.get(), 1);
    assert!(bridge.table().is_empty());

    bridge.liveness().shutdown();
    join(dispatcher).await.unwrap();
    assert!(!path.exists());
}

#[tokio::test]
async fn test_oversized_payload_truncated_on_the_wire() {
    let bridge = make_bridge(5000, FallbackVerdict::Accept);
    let (decider, dispatcher) = start(&bridge);

    let payload = vec![0x5au8; PAYLOAD_CAPACITY + 1000];
    let waiter = decide_async(&bridge, Packet::new(77, &payload));

    let request = recv_request(&decider).await;
    assert_eq!(request.payload().len(), PAYLOAD_CAPACITY);
    respond(&decider, 77, Verdict::Accept).await;
    assert_eq!(join(waiter).await, Verdict::Accept);

    bridge.liveness().shutdown();
    join(dispatcher).await.unwrap();
}

#[test]
fn test_capture_failure_skips_backlog() {
    struct NoTimestamp;

    impl CapturedPacket for NoTimestamp {
        fn packet_id(&self) -> u32 {
            1
        }
        fn indev(&self) -> u32 {
            0
        }
        fn timestamp(&self) -> Option<Timeval> {
            None
        }
        fn payload(&self) -> Option<&[u8]> {
            Some(b"data")
        }
    }

    // No dispatcher at all: a capture failure must not wait for one
    let bridge = make_bridge(0, FallbackVerdict::Drop);
    let handle = {
        let bridge = bridge.clone();
        thread::spawn(move || bridge.decide(&NoTimestamp))
    };

    assert_eq!(handle.join().unwrap(), Verdict::Accept);
    assert!(bridge.backlog().is_empty());
    assert_eq!(bridge.metrics().capture_failures.get(), 1);
}

#[tokio::test]
async fn test_responses_collected_while_decider_backed_up() {
    let bridge = make_bridge(5000, FallbackVerdict::Accept);
    let (decider, dispatcher) = start(&bridge);

    let waiter = decide_async(&bridge, Packet::new(1, b"first"));
    assert_eq!(recv_request(&decider).await.uid, 1);

    // Far more than the socket buffers hold, none of it read
    let unread: Vec<Arc<Gate>> = (2..200)
        .map(|uid| {
            bridge
                .submit(PacketRecord::new(uid, 0, Timeval::default(), &[0u8; 1500]))
                .unwrap()
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(bridge.metrics().dispatched.get() < 199);

    respond(&decider, 1, Verdict::Drop).await;
    assert_eq!(join(waiter).await, Verdict::Drop);
    assert_eq!(bridge.metrics().send_failures.get(), 0);

    bridge.liveness().shutdown();
    join(dispatcher).await.unwrap();
    assert!(unread
        .iter()
        .all(|gate| gate.state() == Some(Verdict::Accept)));
}

#[tokio::test]
async fn test_shutdown_with_unread_requests() {
    let bridge = make_bridge(0, FallbackVerdict::Drop);
    let (_decider, dispatcher) = start(&bridge);

    let gates: Vec<Arc<Gate>> = (1..100)
        .map(|uid| {
            bridge
                .submit(PacketRecord::new(uid, 0, Timeval::default(), b"unread"))
                .unwrap()
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(100)).await;

    bridge.liveness().shutdown();
    join(dispatcher).await.unwrap();

    assert!(gates
        .iter()
        .all(|gate| gate.state() == Some(Verdict::Accept)));
    assert!(bridge.table().is_empty());
    assert!(bridge.backlog().is_empty());
    assert_eq!(bridge.metrics().released.get(), 99);
}

#[tokio::test]
async fn test_duplicate_uid_keeps_first_request() {
    let bridge = make_bridge(5000, FallbackVerdict::Drop);
    let first = bridge
        .submit(PacketRecord::new(9, 0, Timeval::default(), b"first"))
        .unwrap();
    let second = bridge
        .submit(PacketRecord::new(9, 0, Timeval::default(), b"second"))
        .unwrap();
    let (decider, dispatcher) = start(&bridge);

    let request = recv_request(&decider).await;
    assert_eq!(request.uid, 9);
    assert_eq!(request.payload(), b"first");

    let settled = {
        let second = second.clone();
        tokio::task::spawn_blocking(move || second.wait())
    };
    assert_eq!(join(settled).await, Verdict::Accept);
    assert_eq!(bridge.metrics().duplicate_uids.get(), 1);
    assert_eq!(first.state(), None);

    respond(&decider, 9, Verdict::Drop).await;
    let settled = {
        let first = first.clone();
        tokio::task::spawn_blocking(move || first.wait())
    };
    assert_eq!(join(settled).await, Verdict::Drop);
    assert!(!bridge.table().contains(9));

    bridge.liveness().shutdown();
    join(dispatcher).await.unwrap();
}
