//! # DHT Swarm Collaborator Boundary
//!
//! Peers sharing a passphrase-derived key join the same swarm and discover
//! wires to each other. weft depends only on this seam:
//!
//! - [`SwarmConnector::join`] enters the swarm for a derived key and returns
//!   a handle plus its event stream
//! - [`SwarmHandle`] sends JSON [`SwarmMessage`]s over a discovered wire or
//!   broadcasts to all wires; `leave` exits the swarm
//! - [`SwarmEvent`] delivers `WireUp`, `WireDown`, and inbound `Message`s
//!
//! [`MemorySwarm`] is the in-process implementation: every member joined
//! under the same key gets a wire to every other member.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::crypto::SwarmKey;
use crate::messages::{self, SwarmMessage};

/// Identifier of one discovered swarm wire. Both endpoints of a wire observe
/// the same id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WireId(pub u64);

impl std::fmt::Display for WireId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "wire-{}", self.0)
    }
}

/// Events from one swarm membership.
#[derive(Clone, Debug)]
pub enum SwarmEvent {
    /// A wire to another swarm member became available.
    WireUp(WireId),
    /// A wire went away (remote member left).
    WireDown(WireId),
    /// An inbound message on a wire.
    Message { wire: WireId, message: SwarmMessage },
}

/// One swarm membership.
#[async_trait]
pub trait SwarmHandle: Send + Sync {
    /// Send a message over a specific wire.
    async fn send(&self, wire: WireId, message: &SwarmMessage) -> anyhow::Result<()>;
    /// Send to every current wire. Returns the number of wires reached.
    async fn broadcast(&self, message: &SwarmMessage) -> anyhow::Result<usize>;
    /// Leave the swarm; counterpart members observe `WireDown`.
    async fn leave(&self);
}

/// Factory for swarm memberships.
#[async_trait]
pub trait SwarmConnector: Send + Sync {
    async fn join(
        &self,
        swarm_key: SwarmKey,
    ) -> anyhow::Result<(Arc<dyn SwarmHandle>, mpsc::Receiver<SwarmEvent>)>;
}

// ============================================================================
// In-Memory Swarm
// ============================================================================

const EVENT_CHANNEL_CAPACITY: usize = 64;

struct Member {
    key: SwarmKey,
    event_tx: mpsc::Sender<SwarmEvent>,
}

struct SwarmHub {
    members: Mutex<HashMap<u64, Member>>,
    /// wire id -> the two member ids it links.
    wires: Mutex<HashMap<u64, (u64, u64)>>,
    next_id: AtomicU64,
}

/// In-process swarm hub shared by clones.
#[derive(Clone)]
pub struct MemorySwarm {
    hub: Arc<SwarmHub>,
}

impl Default for MemorySwarm {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySwarm {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(SwarmHub {
                members: Mutex::new(HashMap::new()),
                wires: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }
}

struct MemorySwarmHandle {
    hub: Arc<SwarmHub>,
    member_id: u64,
}

impl SwarmHub {
    /// Deliver an event to one member; reports whether the member was
    /// present and still receiving.
    async fn emit(&self, member_id: u64, event: SwarmEvent) -> bool {
        let tx = {
            let members = self.members.lock().await;
            members.get(&member_id).map(|m| m.event_tx.clone())
        };
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Wires belonging to one member, with the counterpart for each.
    async fn wires_of(&self, member_id: u64) -> Vec<(WireId, u64)> {
        self.wires
            .lock()
            .await
            .iter()
            .filter_map(|(&wire, &(a, b))| {
                if a == member_id {
                    Some((WireId(wire), b))
                } else if b == member_id {
                    Some((WireId(wire), a))
                } else {
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl SwarmConnector for MemorySwarm {
    async fn join(
        &self,
        swarm_key: SwarmKey,
    ) -> anyhow::Result<(Arc<dyn SwarmHandle>, mpsc::Receiver<SwarmEvent>)> {
        let member_id = self.hub.next_id.fetch_add(1, Ordering::Relaxed);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        // Wire up to every member already on this key.
        let existing: Vec<u64> = {
            let mut members = self.hub.members.lock().await;
            let same_key = members
                .iter()
                .filter(|(_, m)| m.key == swarm_key)
                .map(|(&id, _)| id)
                .collect();
            members.insert(member_id, Member { key: swarm_key, event_tx });
            same_key
        };

        for other in existing {
            let wire = self.hub.next_id.fetch_add(1, Ordering::Relaxed);
            self.hub.wires.lock().await.insert(wire, (member_id, other));
            self.hub.emit(member_id, SwarmEvent::WireUp(WireId(wire))).await;
            self.hub.emit(other, SwarmEvent::WireUp(WireId(wire))).await;
        }
        debug!(member = member_id, "joined in-memory swarm");

        let handle = Arc::new(MemorySwarmHandle { hub: self.hub.clone(), member_id });
        Ok((handle, event_rx))
    }
}

#[async_trait]
impl SwarmHandle for MemorySwarmHandle {
    async fn send(&self, wire: WireId, message: &SwarmMessage) -> anyhow::Result<()> {
        // Round-trip through the JSON wire form so size limits apply.
        let bytes = messages::serialize(message)?;
        let decoded: SwarmMessage = messages::deserialize_bounded(&bytes)?;

        let counterpart = {
            let wires = self.hub.wires.lock().await;
            match wires.get(&wire.0) {
                Some(&(a, b)) if a == self.member_id => b,
                Some(&(a, b)) if b == self.member_id => a,
                _ => anyhow::bail!("{} is not a wire of this member", wire),
            }
        };
        if !self
            .hub
            .emit(counterpart, SwarmEvent::Message { wire, message: decoded })
            .await
        {
            anyhow::bail!("counterpart of {} is gone", wire);
        }
        Ok(())
    }

    async fn broadcast(&self, message: &SwarmMessage) -> anyhow::Result<usize> {
        // One dead wire must not suppress the remaining sends.
        let mut reached = 0;
        for (wire, _) in self.hub.wires_of(self.member_id).await {
            match self.send(wire, message).await {
                Ok(()) => reached += 1,
                Err(e) => debug!(%wire, error = %e, "broadcast skipped a dead wire"),
            }
        }
        Ok(reached)
    }

    async fn leave(&self) {
        self.hub.members.lock().await.remove(&self.member_id);
        let dropped: Vec<(WireId, u64)> = self.hub.wires_of(self.member_id).await;
        {
            let mut wires = self.hub.wires.lock().await;
            for (wire, _) in &dropped {
                wires.remove(&wire.0);
            }
        }
        for (wire, counterpart) in dropped {
            self.hub.emit(counterpart, SwarmEvent::WireDown(wire)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_swarm_key;
    use crate::identity::PeerId;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_event(rx: &mut mpsc::Receiver<SwarmEvent>) -> SwarmEvent {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for swarm event")
            .expect("event stream closed")
    }

    #[tokio::test]
    async fn same_key_members_get_wires() {
        let swarm = MemorySwarm::new();
        let key = derive_swarm_key("meadow-7");

        let (_a, mut a_rx) = swarm.join(key).await.unwrap();
        let (b, mut b_rx) = swarm.join(key).await.unwrap();

        let wire_a = match next_event(&mut a_rx).await {
            SwarmEvent::WireUp(w) => w,
            other => panic!("expected WireUp, got {:?}", other),
        };
        let wire_b = match next_event(&mut b_rx).await {
            SwarmEvent::WireUp(w) => w,
            other => panic!("expected WireUp, got {:?}", other),
        };
        assert_eq!(wire_a, wire_b, "both sides observe the same wire id");

        let knock = SwarmMessage::Knock {
            peer_id: PeerId::from_bytes([3u8; 16]),
            display_name: "carol".to_string(),
        };
        b.send(wire_b, &knock).await.unwrap();
        match next_event(&mut a_rx).await {
            SwarmEvent::Message { wire, message } => {
                assert_eq!(wire, wire_a);
                assert_eq!(message, knock);
            }
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn different_keys_are_isolated() {
        let swarm = MemorySwarm::new();
        let (_a, mut a_rx) = swarm.join(derive_swarm_key("alpha")).await.unwrap();
        let (_b, _b_rx) = swarm.join(derive_swarm_key("beta")).await.unwrap();

        assert!(
            timeout(Duration::from_millis(100), a_rx.recv()).await.is_err(),
            "no wire must form across different swarm keys"
        );
    }

    #[tokio::test]
    async fn leave_emits_wire_down() {
        let swarm = MemorySwarm::new();
        let key = derive_swarm_key("gamma");
        let (a, mut a_rx) = swarm.join(key).await.unwrap();
        let (_b, mut b_rx) = swarm.join(key).await.unwrap();

        let _ = next_event(&mut a_rx).await;
        let wire_b = match next_event(&mut b_rx).await {
            SwarmEvent::WireUp(w) => w,
            other => panic!("expected WireUp, got {:?}", other),
        };

        a.leave().await;
        match next_event(&mut b_rx).await {
            SwarmEvent::WireDown(w) => assert_eq!(w, wire_b),
            other => panic!("expected WireDown, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_all_wires() {
        let swarm = MemorySwarm::new();
        let key = derive_swarm_key("delta");
        let (_a, mut a_rx) = swarm.join(key).await.unwrap();
        let (_b, mut b_rx) = swarm.join(key).await.unwrap();
        let (c, mut c_rx) = swarm.join(key).await.unwrap();

        // Drain wire-up events.
        let _ = next_event(&mut a_rx).await;
        let _ = next_event(&mut a_rx).await;
        let _ = next_event(&mut b_rx).await;
        let _ = next_event(&mut b_rx).await;
        let _ = next_event(&mut c_rx).await;
        let _ = next_event(&mut c_rx).await;

        let knock = SwarmMessage::Knock {
            peer_id: PeerId::from_bytes([9u8; 16]),
            display_name: "dan".to_string(),
        };
        let reached = c.broadcast(&knock).await.unwrap();
        assert_eq!(reached, 2);

        assert!(matches!(next_event(&mut a_rx).await, SwarmEvent::Message { .. }));
        assert!(matches!(next_event(&mut b_rx).await, SwarmEvent::Message { .. }));
    }

    #[tokio::test]
    async fn broadcast_survives_a_dead_wire() {
        let swarm = MemorySwarm::new();
        let key = derive_swarm_key("epsilon");
        let (_a, a_rx) = swarm.join(key).await.unwrap();
        let (_b, mut b_rx) = swarm.join(key).await.unwrap();
        let (c, mut c_rx) = swarm.join(key).await.unwrap();

        let _ = next_event(&mut b_rx).await;
        let _ = next_event(&mut b_rx).await;
        let _ = next_event(&mut c_rx).await;
        let _ = next_event(&mut c_rx).await;

        // One member stops receiving without leaving; its wire is dead.
        drop(a_rx);

        let knock = SwarmMessage::Knock {
            peer_id: PeerId::from_bytes([5u8; 16]),
            display_name: "eve".to_string(),
        };
        let reached = c.broadcast(&knock).await.unwrap();
        assert_eq!(reached, 1, "the dead wire must not abort the rest");
        assert!(matches!(next_event(&mut b_rx).await, SwarmEvent::Message { .. }));
    }
}
