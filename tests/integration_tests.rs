//! End-to-end tests over real loopback sockets

use peerlink::{Event, Node, ReconnectPolicy};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn start_node(call_sign: &str) -> Node {
    init_tracing();
    let mut node = Node::builder()
        .call_sign(call_sign)
        .listen_addr("127.0.0.1:0".parse().unwrap())
        .reconnect(ReconnectPolicy::disabled())
        .build()
        .unwrap();
    node.start().await.unwrap();
    node
}

fn watch(node: &Node) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    node.on_event(move |event| {
        let _ = tx.send(event);
    });
    rx
}

async fn wait_for<F>(events: &mut mpsc::UnboundedReceiver<Event>, mut matches: F) -> Event
where
    F: FnMut(&Event) -> bool,
{
    loop {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event bus closed");
        if matches(&event) {
            return event;
        }
    }
}

/// A bare protocol client speaking raw JSON lines, standing in for a
/// remote node
struct WireClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl WireClient {
    async fn connect(node: &Node) -> Self {
        let stream = TcpStream::connect(node.local_addr().unwrap())
            .await
            .unwrap();
        let (read, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn recv(&mut self) -> String {
        let mut line = String::new();
        timeout(WAIT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for frame")
            .unwrap();
        line.trim_end().to_string()
    }
}

#[tokio::test]
async fn test_register_then_discover_scenario() {
    let mut alice = start_node("alice").await;
    let alice_port = alice.local_addr().unwrap().port();

    let mut bob = WireClient::connect(&alice).await;
    bob.send(r#"{"type":"register","callSign":"bob","ip":"10.0.0.2","port":4301}"#)
        .await;

    // Registration is answered with the full snapshot, registrant
    // included.
    let reply = bob.recv().await;
    assert_eq!(
        reply,
        format!(
            r#"{{"type":"nodes","nodes":[{{"callSign":"alice","ip":"127.0.0.1","port":{}}},{{"callSign":"bob","ip":"10.0.0.2","port":4301}}]}}"#,
            alice_port
        )
    );

    // Discover returns exactly the registered call-signs with their
    // latest endpoints.
    bob.send(r#"{"type":"discover"}"#).await;
    let reply = bob.recv().await;
    assert_eq!(
        reply,
        format!(
            r#"{{"type":"nodes","nodes":[{{"callSign":"alice","ip":"127.0.0.1","port":{}}},{{"callSign":"bob","ip":"10.0.0.2","port":4301}}]}}"#,
            alice_port
        )
    );

    alice.stop().await.unwrap();
}

#[tokio::test]
async fn test_reregistration_overwrites_endpoint() {
    let mut alice = start_node("alice").await;

    let mut bob = WireClient::connect(&alice).await;
    bob.send(r#"{"type":"register","callSign":"bob","ip":"10.0.0.2","port":4301}"#)
        .await;
    bob.recv().await;
    bob.send(r#"{"type":"register","callSign":"bob","ip":"10.0.0.9","port":4400}"#)
        .await;
    bob.recv().await;

    let nodes = alice.known_nodes().await.unwrap();
    let record = nodes.iter().find(|r| r.call_sign == "bob").unwrap();
    assert_eq!(record.ip, "10.0.0.9");
    assert_eq!(record.port, 4400);
    assert_eq!(nodes.iter().filter(|r| r.call_sign == "bob").count(), 1);

    alice.stop().await.unwrap();
}

#[tokio::test]
async fn test_add_peer_confirms_both_ends() {
    let mut alice = start_node("alice").await;
    let mut bob = start_node("bob").await;
    let bob_port = bob.local_addr().unwrap().port();

    let mut alice_events = watch(&alice);
    let mut bob_events = watch(&bob);

    alice.add_peer("bob", "127.0.0.1", bob_port).unwrap();

    // Alice sees the peer added once her outbound link is confirmed.
    let added = wait_for(&mut alice_events, |e| {
        matches!(e, Event::UserAdded { call_sign, .. } if call_sign == "bob")
    })
    .await;
    match added {
        Event::UserAdded { port, .. } => assert_eq!(port, bob_port),
        _ => unreachable!(),
    }

    // Bob sees the confirmation pairing the two call-signs.
    wait_for(&mut bob_events, |e| {
        matches!(e, Event::UserAddedBy { call_sign, .. } if call_sign == "alice")
    })
    .await;

    // Both ends hold a record for the other.
    let alice_nodes = alice.known_nodes().await.unwrap();
    assert!(alice_nodes.iter().any(|r| r.call_sign == "bob"));
    let bob_nodes = bob.known_nodes().await.unwrap();
    assert!(bob_nodes.iter().any(|r| r.call_sign == "alice"));

    alice.stop().await.unwrap();
    bob.stop().await.unwrap();
}

#[tokio::test]
async fn test_message_relay_between_nodes() {
    let mut alice = start_node("alice").await;
    let mut bob = start_node("bob").await;
    let bob_port = bob.local_addr().unwrap().port();

    let mut alice_events = watch(&alice);
    let mut bob_events = watch(&bob);

    alice.add_peer("bob", "127.0.0.1", bob_port).unwrap();
    wait_for(&mut alice_events, |e| {
        matches!(e, Event::UserAdded { call_sign, .. } if call_sign == "bob")
    })
    .await;

    alice.send_message("bob", "hello bob").unwrap();

    let received = wait_for(&mut bob_events, |e| {
        matches!(e, Event::MessageReceived { .. })
    })
    .await;
    match received {
        Event::MessageReceived { sender, content } => {
            assert_eq!(sender, "alice");
            assert_eq!(content, "hello bob");
        }
        _ => unreachable!(),
    }

    alice.stop().await.unwrap();
    bob.stop().await.unwrap();
}

#[tokio::test]
async fn test_messages_arrive_in_submission_order() {
    let mut alice = start_node("alice").await;
    let mut bob = start_node("bob").await;
    let bob_port = bob.local_addr().unwrap().port();

    let mut alice_events = watch(&alice);
    let mut bob_events = watch(&bob);

    alice.add_peer("bob", "127.0.0.1", bob_port).unwrap();
    wait_for(&mut alice_events, |e| {
        matches!(e, Event::UserAdded { call_sign, .. } if call_sign == "bob")
    })
    .await;

    for i in 0..5 {
        alice.send_message("bob", format!("msg-{}", i)).unwrap();
    }

    for i in 0..5 {
        let event = wait_for(&mut bob_events, |e| {
            matches!(e, Event::MessageReceived { .. })
        })
        .await;
        match event {
            Event::MessageReceived { content, .. } => {
                assert_eq!(content, format!("msg-{}", i));
            }
            _ => unreachable!(),
        }
    }

    alice.stop().await.unwrap();
    bob.stop().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_recipient_fails_exactly_once() {
    let mut alice = start_node("alice").await;
    let mut events = watch(&alice);

    alice.send_message("ghost", "anyone there?").unwrap();

    let failed = wait_for(&mut events, |e| matches!(e, Event::MessageFailed { .. })).await;
    match failed {
        Event::MessageFailed {
            recipient_call_sign,
            ..
        } => assert_eq!(recipient_call_sign, "ghost"),
        _ => unreachable!(),
    }

    // No retry and no duplicate failure report.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut extra = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, Event::MessageFailed { .. }) {
            extra += 1;
        }
    }
    assert_eq!(extra, 0);

    alice.stop().await.unwrap();
}

#[tokio::test]
async fn test_one_hop_relay_through_registry_node() {
    let mut alice = start_node("alice").await;
    let mut charlie = start_node("charlie").await;
    let alice_port = alice.local_addr().unwrap().port();

    let mut alice_events = watch(&alice);
    let mut charlie_events = watch(&charlie);

    // Charlie links up with alice so alice can reach him; wait until
    // alice has bound his link.
    charlie.add_peer("alice", "127.0.0.1", alice_port).unwrap();
    wait_for(&mut alice_events, |e| {
        matches!(e, Event::UserAdded { call_sign, .. } if call_sign == "charlie")
    })
    .await;

    // Bob talks to alice over the raw wire and asks her to relay.
    let mut bob = WireClient::connect(&alice).await;
    bob.send(r#"{"type":"register","callSign":"bob","ip":"10.0.0.2","port":4301}"#)
        .await;
    bob.recv().await;
    bob.send(
        r#"{"type":"message","sender":"bob","recipientCallSign":"charlie","content":"via alice"}"#,
    )
    .await;

    let received = wait_for(&mut charlie_events, |e| {
        matches!(e, Event::MessageReceived { .. })
    })
    .await;
    match received {
        Event::MessageReceived { sender, content } => {
            assert_eq!(sender, "bob");
            assert_eq!(content, "via alice");
        }
        _ => unreachable!(),
    }

    alice.stop().await.unwrap();
    charlie.stop().await.unwrap();
}

#[tokio::test]
async fn test_link_close_removes_peer_exactly_once() {
    let mut alice = start_node("alice").await;
    let mut events = watch(&alice);

    let mut bob = WireClient::connect(&alice).await;
    bob.send(r#"{"type":"register","callSign":"bob","ip":"10.0.0.2","port":4301}"#)
        .await;
    bob.recv().await;

    drop(bob);

    let removed = wait_for(&mut events, |e| matches!(e, Event::UserRemoved { .. })).await;
    match removed {
        Event::UserRemoved { call_sign } => assert_eq!(call_sign, "bob"),
        _ => unreachable!(),
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut extra = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, Event::UserRemoved { .. }) {
            extra += 1;
        }
    }
    assert_eq!(extra, 0);

    let nodes = alice.known_nodes().await.unwrap();
    assert!(nodes.iter().all(|r| r.call_sign != "bob"));

    alice.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_frames_do_not_kill_the_link() {
    let mut alice = start_node("alice").await;

    let mut bob = WireClient::connect(&alice).await;
    bob.send("this is not json").await;
    bob.send(r#"{"type":"ping"}"#).await;
    bob.send(r#"{"type":"register","callSign":"","ip":"x","port":1}"#)
        .await;

    // The link survived all three; a valid envelope still gets through.
    bob.send(r#"{"type":"discover"}"#).await;
    let reply = bob.recv().await;
    assert!(reply.starts_with(r#"{"type":"nodes""#));

    alice.stop().await.unwrap();
}

#[tokio::test]
async fn test_outbound_link_reconnects_after_drop() {
    init_tracing();

    // A listener standing in for a flaky peer: kills the first
    // connection, answers the second.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_port = listener.local_addr().unwrap().port();

    let mut alice = Node::builder()
        .call_sign("alice")
        .listen_addr("127.0.0.1:0".parse().unwrap())
        .reconnect(ReconnectPolicy::fixed(Duration::from_millis(100)))
        .build()
        .unwrap();
    alice.start().await.unwrap();

    alice.add_peer("bob", "127.0.0.1", peer_port).unwrap();

    let (first, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    drop(first);

    // The redial carries a fresh handshake.
    let (second, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let (read, _write) = second.into_split();
    let mut reader = BufReader::new(read);
    let mut line = String::new();
    timeout(WAIT, reader.read_line(&mut line))
        .await
        .unwrap()
        .unwrap();
    assert!(line.contains(r#""type":"register""#));
    assert!(line.contains(r#""callSign":"alice""#));

    // The record dropped with the first link is back.
    let nodes = alice.known_nodes().await.unwrap();
    let bob = nodes.iter().find(|r| r.call_sign == "bob").unwrap();
    assert_eq!(bob.port, peer_port);

    alice.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_releases_listen_port() {
    let mut alice = start_node("alice").await;
    let addr = alice.local_addr().unwrap();

    alice.stop().await.unwrap();

    // The exact address rebinds immediately; nothing holds the socket.
    let mut successor = Node::builder()
        .call_sign("alice")
        .listen_addr(addr)
        .reconnect(ReconnectPolicy::disabled())
        .build()
        .unwrap();
    successor.start().await.unwrap();
    assert_eq!(successor.local_addr(), Some(addr));
    successor.stop().await.unwrap();
}
