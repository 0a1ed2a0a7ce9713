//! # Mesh Node
//!
//! [`MeshNode`] wires the whole stack together: identity and trust, the
//! router actor, the introduction manager, the security manager, peer
//! persistence, and the reconnection orchestrator — all over injected
//! transport, swarm, and storage collaborators, so several independent
//! nodes can run in one process.
//!
//! Mesh happenings surface as [`NodeEvent`]s on a take-once receiver
//! ([`MeshNode::take_events`]); the chat log is also kept node-side for
//! direct inspection.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::crypto::derive_swarm_key;
use crate::identity::{now_ms, PeerId, PeerIdentity, TrustStore};
use crate::introduction::IntroductionManager;
use crate::messages::Announcement;
use crate::persistence::{PeerStore, DEFAULT_MAX_STORED_PEERS};
use crate::quality::{QualityConfig, QualityManager};
use crate::reconnect::{
    ConnectivityProbe, OrchestratorDeps, ReconnectConfig, ReconnectOrchestrator, ReconnectPhase,
    ReconnectStats,
};
use crate::router::{MessageRouter, PeerInfo, RouterDeps, RouterEvent, RouterHandle};
use crate::security::SecurityManager;
use crate::storage::KvStorage;
use crate::swarm::SwarmConnector;
use crate::transport::{TransportConfig, TransportConnector, TransportEvent, TransportHandle};

const NODE_EVENT_CAPACITY: usize = 256;

// ============================================================================
// Configuration and Events
// ============================================================================

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub display_name: String,
    /// Pairing passphrase; peers sharing it land in the same swarm.
    pub passphrase: String,
    pub max_stored_peers: usize,
    pub quality: QualityConfig,
    pub reconnect: ReconnectConfig,
}

impl NodeConfig {
    pub fn new(display_name: &str, passphrase: &str) -> Self {
        Self {
            display_name: display_name.to_string(),
            passphrase: passphrase.to_string(),
            max_stored_peers: DEFAULT_MAX_STORED_PEERS,
            quality: QualityConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Mesh happenings surfaced to the embedding application.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    PeerConnected { peer_id: PeerId, display_name: String },
    PeerDisconnected { peer_id: PeerId },
    Chat { from: PeerId, from_name: String, text: String },
    NameChanged { peer_id: PeerId, new_name: String },
    AnnouncementVerified { announcement: Announcement },
    /// TOFU violation; the connection was already destroyed.
    KeyMismatch { peer_id: PeerId },
}

/// One received chat line.
#[derive(Clone, Debug)]
pub struct ChatMessage {
    pub from: PeerId,
    pub from_name: String,
    pub text: String,
    pub received_at_ms: u64,
}

// ============================================================================
// Manual Pairing
// ============================================================================

/// The initiator half of a manual pairing, waiting for the remote answer.
pub struct PendingPairing {
    router: RouterHandle,
    handle: Arc<dyn TransportHandle>,
    events: mpsc::Receiver<TransportEvent>,
}

impl PendingPairing {
    /// Feed the answer blob in and hand the transport to the router.
    pub async fn complete(self, answer: Value) -> anyhow::Result<()> {
        self.handle.signal(answer).await?;
        self.router.attach_transport(self.handle, self.events).await
    }
}

// ============================================================================
// Node
// ============================================================================

pub struct MeshNode {
    identity: Arc<Mutex<PeerIdentity>>,
    peer_id: PeerId,
    display_name: String,
    trust: Arc<TrustStore>,
    security: Arc<SecurityManager>,
    peers: Arc<PeerStore>,
    router: RouterHandle,
    intro: Arc<IntroductionManager>,
    orchestrator: ReconnectOrchestrator,
    connector: Arc<dyn TransportConnector>,
    chat_log: Arc<Mutex<Vec<ChatMessage>>>,
    events_rx: Mutex<Option<mpsc::Receiver<NodeEvent>>>,
    pump: JoinHandle<()>,
}

impl MeshNode {
    /// Assemble a node over the given collaborators. The identity (and with
    /// it the peer id) is loaded from storage or generated and persisted,
    /// so a node rebuilt over the same storage keeps its identity.
    pub async fn new(
        config: NodeConfig,
        connector: Arc<dyn TransportConnector>,
        swarm: Arc<dyn SwarmConnector>,
        storage: Arc<dyn KvStorage>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> anyhow::Result<Self> {
        let identity = PeerIdentity::load_or_generate(storage.as_ref()).await?;
        let peer_id = identity.peer_id();
        let identity = Arc::new(Mutex::new(identity));

        let trust = Arc::new(TrustStore::load(storage.clone()).await?);
        let security = Arc::new(SecurityManager::load(storage.clone()).await?);
        let peers = Arc::new(PeerStore::load(storage.clone(), config.max_stored_peers).await?);

        let (router, router_events) = MessageRouter::spawn(RouterDeps {
            identity: identity.clone(),
            trust: trust.clone(),
            security: security.clone(),
            peers: peers.clone(),
            quality: QualityManager::new(config.quality),
            storage: storage.clone(),
            display_name: config.display_name.clone(),
        });

        let intro = Arc::new(IntroductionManager::new(
            connector.clone(),
            router.clone(),
            security.clone(),
        ));

        let (connected_tx, connected_rx) = watch::channel(0usize);
        let (node_event_tx, node_event_rx) = mpsc::channel(NODE_EVENT_CAPACITY);
        let chat_log = Arc::new(Mutex::new(Vec::new()));
        let pump = tokio::spawn(event_pump(
            router_events,
            intro.clone(),
            connected_tx,
            node_event_tx,
            chat_log.clone(),
        ));

        let orchestrator = ReconnectOrchestrator::new(OrchestratorDeps {
            config: config.reconnect,
            router: router.clone(),
            peers: peers.clone(),
            trust: trust.clone(),
            connector: connector.clone(),
            swarm,
            swarm_key: derive_swarm_key(&config.passphrase),
            probe,
            intro: intro.clone(),
            connected_count: connected_rx,
            local_peer_id: peer_id,
            display_name: config.display_name.clone(),
        });

        info!(peer_id = %peer_id, name = %config.display_name, "mesh node assembled");
        Ok(Self {
            identity,
            peer_id,
            display_name: config.display_name,
            trust,
            security,
            peers,
            router,
            intro,
            orchestrator,
            connector,
            chat_log,
            events_rx: Mutex::new(Some(node_event_rx)),
            pump,
        })
    }

    /// Join the swarm and run the cold/warm start decision.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.orchestrator.start().await
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// The node event stream. Take-once: the first caller gets it.
    pub async fn take_events(&self) -> Option<mpsc::Receiver<NodeEvent>> {
        self.events_rx.lock().await.take()
    }

    // ------------------------------------------------------------------
    // Manual pairing
    // ------------------------------------------------------------------

    /// Start a manual pairing as the initiator. Returns the offer blob to
    /// hand to the other side and the pending half to complete with their
    /// answer.
    pub async fn begin_pairing(&self) -> anyhow::Result<(Value, PendingPairing)> {
        let (handle, mut events) = self
            .connector
            .create_connection(true, TransportConfig::default())
            .await?;
        let offer = next_signal(&mut events).await?;
        Ok((
            offer,
            PendingPairing {
                router: self.router.clone(),
                handle,
                events,
            },
        ))
    }

    /// Accept a manual pairing offer. Returns the answer blob for the
    /// initiator; the transport is handed to the router immediately.
    pub async fn accept_pairing(&self, offer: Value) -> anyhow::Result<Value> {
        let (handle, mut events) = self
            .connector
            .create_connection(false, TransportConfig::default())
            .await?;
        handle.signal(offer).await?;
        let answer = next_signal(&mut events).await?;
        self.router.attach_transport(handle, events).await?;
        Ok(answer)
    }

    // ------------------------------------------------------------------
    // Messaging and state
    // ------------------------------------------------------------------

    /// Sanitize and broadcast a chat message. Returns peers reached.
    pub async fn send_chat(&self, text: &str) -> anyhow::Result<usize> {
        self.router.broadcast_chat(text).await
    }

    pub async fn set_display_name(&self, name: &str) -> anyhow::Result<()> {
        self.router.set_display_name(name).await
    }

    /// Ask the mesh for a direct connection to a known peer via relays.
    pub async fn request_introduction(&self, target: PeerId) -> anyhow::Result<()> {
        self.intro.request_introduction(target).await
    }

    pub async fn connected_peers(&self) -> anyhow::Result<Vec<PeerInfo>> {
        self.router.connected_peers().await
    }

    /// Every chat line received so far, in arrival order.
    pub async fn chat_messages(&self) -> Vec<ChatMessage> {
        self.chat_log.lock().await.clone()
    }

    pub async fn reconnect_stats(&self) -> ReconnectStats {
        self.orchestrator.stats().await
    }

    pub async fn reconnect_phase(&self) -> ReconnectPhase {
        self.orchestrator.phase().await
    }

    pub fn trust(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    pub fn security(&self) -> &Arc<SecurityManager> {
        &self.security
    }

    pub fn peer_store(&self) -> &Arc<PeerStore> {
        &self.peers
    }

    /// Current announcement sequence counter, for diagnostics.
    pub async fn sequence(&self) -> u64 {
        self.identity.lock().await.sequence()
    }

    /// Orderly teardown: orchestrator first, then the router and the pump.
    pub async fn shutdown(&self) {
        self.orchestrator.shutdown().await;
        self.router.shutdown().await;
        self.pump.abort();
    }
}

/// Wait for the next signaling blob from a fresh transport.
async fn next_signal(events: &mut mpsc::Receiver<TransportEvent>) -> anyhow::Result<Value> {
    tokio::time::timeout(std::time::Duration::from_secs(10), async {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Signal(blob) => return Ok(blob),
                TransportEvent::Error(e) => anyhow::bail!("transport failed: {}", e),
                TransportEvent::Close => anyhow::bail!("transport closed before signaling"),
                _ => {}
            }
        }
        anyhow::bail!("transport event stream ended")
    })
    .await
    .map_err(|_| anyhow::anyhow!("timed out waiting for signaling data"))?
}

/// Translate router events into node events, keep the live count watch
/// current, and feed relay signals to the introduction manager.
async fn event_pump(
    mut router_events: mpsc::Receiver<RouterEvent>,
    intro: Arc<IntroductionManager>,
    connected_tx: watch::Sender<usize>,
    node_event_tx: mpsc::Sender<NodeEvent>,
    chat_log: Arc<Mutex<Vec<ChatMessage>>>,
) {
    let mut connected: HashSet<PeerId> = HashSet::new();
    while let Some(event) = router_events.recv().await {
        let node_event = match event {
            RouterEvent::PeerConnected { peer_id, display_name } => {
                connected.insert(peer_id);
                let _ = connected_tx.send(connected.len());
                Some(NodeEvent::PeerConnected { peer_id, display_name })
            }
            RouterEvent::PeerDisconnected { peer_id } => {
                connected.remove(&peer_id);
                let _ = connected_tx.send(connected.len());
                Some(NodeEvent::PeerDisconnected { peer_id })
            }
            RouterEvent::ChatReceived { from, from_name, text } => {
                chat_log.lock().await.push(ChatMessage {
                    from,
                    from_name: from_name.clone(),
                    text: text.clone(),
                    received_at_ms: now_ms(),
                });
                Some(NodeEvent::Chat { from, from_name, text })
            }
            RouterEvent::NameChanged { peer_id, new_name } => {
                Some(NodeEvent::NameChanged { peer_id, new_name })
            }
            RouterEvent::AnnouncementVerified { announcement } => {
                Some(NodeEvent::AnnouncementVerified { announcement })
            }
            RouterEvent::KeyMismatch { peer_id } => {
                Some(NodeEvent::KeyMismatch { peer_id })
            }
            RouterEvent::TopologyDiscovered { peers } => {
                debug!(count = peers.len(), "topology discovered");
                None
            }
            RouterEvent::RelaySignalReceived { from, intro_id, kind, signal } => {
                let intro = intro.clone();
                tokio::spawn(async move {
                    if let Err(e) = intro.handle_relay_signal(from, intro_id, kind, signal).await {
                        debug!(error = %e, "relay signal handling failed");
                    }
                });
                None
            }
        };
        if let Some(event) = node_event {
            // A lagging consumer must not stall the mesh.
            let _ = node_event_tx.try_send(event);
        }
    }
}
