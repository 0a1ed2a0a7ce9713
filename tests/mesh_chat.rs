//! End-to-end mesh behavior over the in-memory collaborators: manual
//! pairing, chat delivery, multi-hop forwarding, and name changes.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use weft::node::{MeshNode, NodeConfig, NodeEvent};
use weft::reconnect::{ReconnectConfig, StaticProbe};
use weft::storage::MemoryStorage;
use weft::swarm::MemorySwarm;
use weft::transport::MemoryConnector;

const WAIT: Duration = Duration::from_secs(5);

struct World {
    connector: Arc<MemoryConnector>,
    swarm: Arc<MemorySwarm>,
    probe: Arc<StaticProbe>,
}

impl World {
    fn new() -> Self {
        Self {
            connector: Arc::new(MemoryConnector::new()),
            swarm: Arc::new(MemorySwarm::new()),
            probe: Arc::new(StaticProbe::new("198.51.100.1")),
        }
    }

    async fn node(&self, name: &str) -> MeshNode {
        self.node_with_storage(name, Arc::new(MemoryStorage::new())).await
    }

    async fn node_with_storage(&self, name: &str, storage: Arc<MemoryStorage>) -> MeshNode {
        let mut config = NodeConfig::new(name, "test-passphrase");
        config.reconnect = ReconnectConfig {
            layer_timeouts: [
                Duration::from_millis(200),
                Duration::from_secs(3),
                Duration::from_secs(3),
            ],
            announce_interval: Duration::from_secs(300),
            network_check_interval: Duration::from_secs(300),
            ..ReconnectConfig::default()
        };
        MeshNode::new(
            config,
            self.connector.clone(),
            self.swarm.clone(),
            storage,
            self.probe.clone(),
        )
        .await
        .expect("node assembly failed")
    }
}

/// Manually pair two nodes and wait until both see each other connected.
async fn pair(a: &MeshNode, b: &MeshNode) {
    let (offer, pending) = a.begin_pairing().await.expect("offer failed");
    let answer = b.accept_pairing(offer).await.expect("answer failed");
    pending.complete(answer).await.expect("pairing completion failed");

    assert!(
        wait_until(WAIT, || async {
            let a_sees = a.connected_peers().await.unwrap_or_default();
            let b_sees = b.connected_peers().await.unwrap_or_default();
            a_sees.iter().any(|p| p.peer_id == b.peer_id())
                && b_sees.iter().any(|p| p.peer_id == a.peer_id())
        })
        .await,
        "pairing did not reach connected state"
    );
}

async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn manual_pairing_delivers_chat() {
    let world = World::new();
    let alice = world.node("Peer 1").await;
    let bob = world.node("Peer 2").await;

    let mut bob_events = bob.take_events().await.expect("events already taken");
    pair(&alice, &bob).await;

    let reached = alice.send_chat("Hello from Peer 1!").await.expect("send failed");
    assert_eq!(reached, 1);

    let received = timeout(WAIT, async {
        loop {
            match bob_events.recv().await {
                Some(NodeEvent::Chat { from, from_name, text }) => break (from, from_name, text),
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        }
    })
    .await
    .expect("chat did not arrive in time");

    assert_eq!(received.0, alice.peer_id());
    assert_eq!(received.1, "Peer 1");
    assert_eq!(received.2, "Hello from Peer 1!");

    let log = bob.chat_messages().await;
    assert!(log.iter().any(|m| m.text == "Hello from Peer 1!"));

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn pairing_pins_identities_tofu() {
    let world = World::new();
    let alice = world.node("alice").await;
    let bob = world.node("bob").await;

    pair(&alice, &bob).await;

    assert!(alice.trust().is_trusted(&bob.peer_id()).await);
    assert!(bob.trust().is_trusted(&alice.peer_id()).await);

    // Peer records are mirrored on connect.
    assert!(alice.peer_store().get(&bob.peer_id()).await.is_some());
    assert!(bob.peer_store().get(&alice.peer_id()).await.is_some());

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn broadcast_forwards_across_hops() {
    let world = World::new();
    let alice = world.node("alice").await;
    let bob = world.node("bob").await;
    let carol = world.node("carol").await;

    // Line topology: alice - bob - carol.
    pair(&alice, &bob).await;
    pair(&bob, &carol).await;

    let mut carol_events = carol.take_events().await.expect("events already taken");
    alice.send_chat("across the mesh").await.expect("send failed");

    let text = timeout(WAIT, async {
        loop {
            match carol_events.recv().await {
                Some(NodeEvent::Chat { text, .. }) => break text,
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        }
    })
    .await
    .expect("multi-hop chat did not arrive");
    assert_eq!(text, "across the mesh");

    alice.shutdown().await;
    bob.shutdown().await;
    carol.shutdown().await;
}

#[tokio::test]
async fn chat_is_sanitized_before_broadcast() {
    let world = World::new();
    let alice = world.node("alice").await;
    let bob = world.node("bob").await;

    pair(&alice, &bob).await;
    alice.send_chat("<b>hi</b>").await.expect("send failed");

    assert!(
        wait_until(WAIT, || async {
            bob.chat_messages()
                .await
                .iter()
                .any(|m| m.text == "&lt;b&gt;hi&lt;/b&gt;")
        })
        .await,
        "sanitized chat not delivered"
    );

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn name_change_propagates() {
    let world = World::new();
    let alice = world.node("alice").await;
    let bob = world.node("bob").await;

    let mut bob_events = bob.take_events().await.expect("events already taken");
    pair(&alice, &bob).await;

    alice.set_display_name("alicia").await.expect("rename failed");

    let renamed = timeout(WAIT, async {
        loop {
            match bob_events.recv().await {
                Some(NodeEvent::NameChanged { peer_id, new_name }) => break (peer_id, new_name),
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        }
    })
    .await
    .expect("name change did not arrive");

    assert_eq!(renamed.0, alice.peer_id());
    assert_eq!(renamed.1, "alicia");

    alice.shutdown().await;
    bob.shutdown().await;
}
