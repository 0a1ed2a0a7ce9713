//! # Message Router
//!
//! The router actor owns the live connection set and everything that flows
//! over it:
//!
//! - identity exchange immediately after a transport connects (TOFU gate)
//! - admission control through the quality manager
//! - routed message pipeline: rate limit, dedup, structural validation,
//!   hop accounting, typed dispatch, broadcast/targeted forwarding
//! - announcement verification and relayed forwarding
//! - ping/pong latency probing and periodic rebalancing
//!
//! ## Architecture
//!
//! [`RouterHandle`] is a cheap-to-clone facade sending [`RouterCommand`]s
//! over a channel to the private actor task; replies come back on oneshot
//! channels. Transport event streams are pumped into the actor by small
//! forwarder tasks, one per connection, so all state lives on one task and
//! needs no locking.
//!
//! Mesh-level happenings surface as [`RouterEvent`]s on the stream returned
//! by [`MessageRouter::spawn`].

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use lru::LruCache;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::announce::{self, AnnouncementProtocol};
use crate::crypto;
use crate::identity::{now_ms, PeerId, PeerIdentity, TrustError, TrustStore};
use crate::messages::{
    self, Announcement, Payload, PeerSummary, RoutingHint, RoutingMessage, SignalKind, DEFAULT_TTL,
    MAX_HOP_COUNT, MAX_PATH_LENGTH,
};
use crate::persistence::{PeerRecord, PeerStore};
use crate::quality::{calculate_quality_score, AdmissionDecision, QualityInputs, QualityManager};
use crate::security::{sanitize_message, SecurityManager};
use crate::storage::KvStorage;
use crate::transport::{PathType, TransportEvent, TransportHandle};

// ============================================================================
// Intervals and Bounds
// ============================================================================

/// Latency probe cadence.
const PING_INTERVAL_SECS: u64 = 15;

/// Rebalance pass cadence.
const REBALANCE_INTERVAL_SECS: u64 = 30;

/// Recently seen message ids, for forwarding dedup.
const SEEN_MESSAGE_CAPACITY: usize = 4096;

const COMMAND_CHANNEL_CAPACITY: usize = 128;
const EVENT_CHANNEL_CAPACITY: usize = 256;
const TRANSPORT_EVENT_CAPACITY: usize = 512;

// ============================================================================
// Public Surface
// ============================================================================

/// Live connection status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Failed,
}

/// Snapshot of one live connection.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub display_name: String,
    pub status: ConnectionStatus,
    pub latency_ms: Option<u32>,
    pub path: PathType,
    pub uptime_secs: u64,
    pub score: u8,
}

/// Mesh happenings surfaced to the node layer.
#[derive(Clone, Debug)]
pub enum RouterEvent {
    PeerConnected { peer_id: PeerId, display_name: String },
    PeerDisconnected { peer_id: PeerId },
    ChatReceived { from: PeerId, from_name: String, text: String },
    NameChanged { peer_id: PeerId, new_name: String },
    AnnouncementVerified { announcement: Announcement },
    TopologyDiscovered { peers: Vec<PeerSummary> },
    RelaySignalReceived { from: PeerId, intro_id: String, kind: SignalKind, signal: Value },
    /// TOFU failure: the claimed peer id is pinned to a different key.
    /// The offending connection was already destroyed.
    KeyMismatch { peer_id: PeerId },
}

enum RouterCommand {
    AttachTransport {
        handle: Arc<dyn TransportHandle>,
        events: mpsc::Receiver<TransportEvent>,
        reply: oneshot::Sender<()>,
    },
    BroadcastChat {
        text: String,
        reply: oneshot::Sender<anyhow::Result<usize>>,
    },
    BroadcastPayload {
        payload: Payload,
        reply: oneshot::Sender<anyhow::Result<usize>>,
    },
    SendTo {
        target: PeerId,
        payload: Payload,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    BroadcastAnnouncement {
        ip_change: bool,
        reply: oneshot::Sender<anyhow::Result<usize>>,
    },
    SetDisplayName {
        name: String,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    Disconnect {
        peer_id: PeerId,
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Cheap-to-clone router facade.
#[derive(Clone)]
pub struct RouterHandle {
    cmd_tx: mpsc::Sender<RouterCommand>,
}

macro_rules! router_call {
    ($self:expr, $variant:ident { $($field:ident : $value:expr),* $(,)? }) => {{
        let (reply, rx) = oneshot::channel();
        $self
            .cmd_tx
            .send(RouterCommand::$variant { $($field: $value,)* reply })
            .await
            .map_err(|_| anyhow::anyhow!("router is shut down"))?;
        rx.await.map_err(|_| anyhow::anyhow!("router dropped reply"))
    }};
}

impl RouterHandle {
    /// Hand a freshly signaled transport to the router. Identity exchange
    /// and admission happen inside the actor.
    pub async fn attach_transport(
        &self,
        handle: Arc<dyn TransportHandle>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> anyhow::Result<()> {
        router_call!(self, AttachTransport { handle: handle, events: events })
    }

    /// Sanitize and broadcast a chat message. Returns peers reached.
    pub async fn broadcast_chat(&self, text: &str) -> anyhow::Result<usize> {
        router_call!(self, BroadcastChat { text: text.to_string() })?
    }

    /// Broadcast an arbitrary payload to all connected peers.
    pub async fn broadcast_payload(&self, payload: Payload) -> anyhow::Result<usize> {
        router_call!(self, BroadcastPayload { payload: payload })?
    }

    /// Route a payload toward one peer.
    pub async fn send_to(&self, target: PeerId, payload: Payload) -> anyhow::Result<()> {
        router_call!(self, SendTo { target: target, payload: payload })?
    }

    /// Build, sign, and broadcast a fresh announcement.
    pub async fn broadcast_announcement(&self, ip_change: bool) -> anyhow::Result<usize> {
        router_call!(self, BroadcastAnnouncement { ip_change: ip_change })?
    }

    /// Change the local display name and propagate it mesh-wide.
    pub async fn set_display_name(&self, name: &str) -> anyhow::Result<()> {
        router_call!(self, SetDisplayName { name: name.to_string() })?
    }

    pub async fn connected_peers(&self) -> anyhow::Result<Vec<PeerInfo>> {
        router_call!(self, ConnectedPeers {})
    }

    pub async fn disconnect(&self, peer_id: PeerId) -> anyhow::Result<()> {
        router_call!(self, Disconnect { peer_id: peer_id })
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(RouterCommand::Shutdown).await;
    }
}

// ============================================================================
// Hop Accounting
// ============================================================================

/// Advance a received message one hop: append this node to the path,
/// decrement ttl, increment hop count. Returns whether the message may
/// still be forwarded.
fn advance_hop(msg: &mut RoutingMessage, self_id: PeerId) -> bool {
    if !msg.path.contains(&self_id) {
        msg.path.push(self_id);
    }
    msg.ttl -= 1;
    msg.hop_count += 1;
    msg.ttl >= 0 && msg.hop_count <= MAX_HOP_COUNT && msg.path.len() <= MAX_PATH_LENGTH
}

// ============================================================================
// Actor
// ============================================================================

type ConnId = u64;

struct PendingConn {
    handle: Arc<dyn TransportHandle>,
    connected: bool,
}

struct LiveConn {
    conn_id: ConnId,
    handle: Arc<dyn TransportHandle>,
    status: ConnectionStatus,
    display_name: String,
    latency_ms: Option<u32>,
    connected_at: Instant,
    path: PathType,
}

impl LiveConn {
    fn quality_inputs(&self) -> QualityInputs {
        QualityInputs {
            latency_ms: self.latency_ms,
            path: self.path,
            uptime_secs: self.connected_at.elapsed().as_secs(),
        }
    }
}

/// Everything the router needs, injected at spawn.
pub struct RouterDeps {
    pub identity: Arc<Mutex<PeerIdentity>>,
    pub trust: Arc<TrustStore>,
    pub security: Arc<SecurityManager>,
    pub peers: Arc<PeerStore>,
    pub quality: QualityManager,
    pub storage: Arc<dyn KvStorage>,
    pub display_name: String,
}

pub struct MessageRouter;

impl MessageRouter {
    /// Spawn the router actor. Returns the handle and the mesh event stream.
    pub fn spawn(deps: RouterDeps) -> (RouterHandle, mpsc::Receiver<RouterEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (transport_tx, transport_rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);

        let actor = RouterActor {
            deps,
            announcements: AnnouncementProtocol::new(),
            event_tx,
            transport_tx,
            pending: HashMap::new(),
            live: HashMap::new(),
            conn_to_peer: HashMap::new(),
            seen_ids: LruCache::new(
                NonZeroUsize::new(SEEN_MESSAGE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            ),
            next_conn_id: 1,
        };
        tokio::spawn(actor.run(cmd_rx, transport_rx));
        (RouterHandle { cmd_tx }, event_rx)
    }
}

struct RouterActor {
    deps: RouterDeps,
    announcements: AnnouncementProtocol,
    event_tx: mpsc::Sender<RouterEvent>,
    transport_tx: mpsc::Sender<(ConnId, TransportEvent)>,
    pending: HashMap<ConnId, PendingConn>,
    live: HashMap<PeerId, LiveConn>,
    conn_to_peer: HashMap<ConnId, PeerId>,
    seen_ids: LruCache<String, ()>,
    next_conn_id: ConnId,
}

impl RouterActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<RouterCommand>,
        mut transport_rx: mpsc::Receiver<(ConnId, TransportEvent)>,
    ) {
        let mut ping_tick =
            tokio::time::interval(std::time::Duration::from_secs(PING_INTERVAL_SECS));
        let mut rebalance_tick =
            tokio::time::interval(std::time::Duration::from_secs(REBALANCE_INTERVAL_SECS));

        loop {
            tokio::select! {
                Some(cmd) = cmd_rx.recv() => {
                    if self.handle_command(cmd).await {
                        break;
                    }
                }
                Some((conn_id, event)) = transport_rx.recv() => {
                    self.handle_transport_event(conn_id, event).await;
                }
                _ = ping_tick.tick() => {
                    self.probe_latency().await;
                }
                _ = rebalance_tick.tick() => {
                    self.rebalance().await;
                }
                else => break,
            }
        }

        // Tear down every transport on exit.
        for (_, conn) in self.pending.drain() {
            conn.handle.destroy().await;
        }
        for (_, conn) in self.live.drain() {
            conn.handle.destroy().await;
        }
        info!("router stopped");
    }

    /// Returns true when the actor should stop.
    async fn handle_command(&mut self, cmd: RouterCommand) -> bool {
        match cmd {
            RouterCommand::AttachTransport { handle, events, reply } => {
                self.attach(handle, events).await;
                let _ = reply.send(());
            }
            RouterCommand::BroadcastChat { text, reply } => {
                let sanitized = sanitize_message(&text);
                let result = self
                    .broadcast(Payload::Chat { text: sanitized }, &[])
                    .await;
                let _ = reply.send(result);
            }
            RouterCommand::BroadcastPayload { payload, reply } => {
                let _ = reply.send(self.broadcast(payload, &[]).await);
            }
            RouterCommand::SendTo { target, payload, reply } => {
                let _ = reply.send(self.send_targeted(target, payload).await);
            }
            RouterCommand::BroadcastAnnouncement { ip_change, reply } => {
                let _ = reply.send(self.broadcast_announcement(ip_change).await);
            }
            RouterCommand::SetDisplayName { name, reply } => {
                self.deps.display_name = name.clone();
                let result = self
                    .broadcast(Payload::NameChange { new_name: name }, &[])
                    .await
                    .map(|_| ());
                let _ = reply.send(result);
            }
            RouterCommand::ConnectedPeers { reply } => {
                let _ = reply.send(self.peer_snapshot());
            }
            RouterCommand::Disconnect { peer_id, reply } => {
                self.drop_peer(peer_id, true).await;
                let _ = reply.send(());
            }
            RouterCommand::Shutdown => return true,
        }
        false
    }

    async fn attach(
        &mut self,
        handle: Arc<dyn TransportHandle>,
        mut events: mpsc::Receiver<TransportEvent>,
    ) {
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        self.pending.insert(conn_id, PendingConn { handle, connected: false });

        // Forwarder task: one per connection, ends when the stream closes.
        let tx = self.transport_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send((conn_id, event)).await.is_err() {
                    break;
                }
            }
            let _ = tx.send((conn_id, TransportEvent::Close)).await;
        });
        debug!(conn_id, "transport attached, awaiting handshake");
    }

    async fn handle_transport_event(&mut self, conn_id: ConnId, event: TransportEvent) {
        match event {
            TransportEvent::Connect => {
                let handle = match self.pending.get_mut(&conn_id) {
                    Some(conn) => {
                        conn.connected = true;
                        conn.handle.clone()
                    }
                    None => return,
                };
                if let Err(e) = self.send_identity_exchange(&handle).await {
                    warn!(conn_id, error = %e, "identity exchange send failed");
                }
            }
            TransportEvent::Data(bytes) => {
                self.handle_data(conn_id, &bytes).await;
            }
            TransportEvent::Close => {
                self.handle_close(conn_id, true).await;
            }
            TransportEvent::Error(err) => {
                warn!(conn_id, error = %err, "transport error");
                self.handle_close(conn_id, false).await;
            }
            TransportEvent::Signal(_) => {
                // Signaling is complete once a transport reaches the router.
            }
        }
    }

    async fn send_identity_exchange(
        &mut self,
        handle: &Arc<dyn TransportHandle>,
    ) -> anyhow::Result<()> {
        let identity = self.deps.identity.lock().await;
        let payload = announce::build_identity_exchange(&identity);
        let msg = self.new_message(identity.peer_id(), payload, None, RoutingHint::Direct)?;
        drop(identity);
        handle.send(messages::serialize(&msg)?).await
    }

    async fn handle_data(&mut self, conn_id: ConnId, bytes: &[u8]) {
        let msg: RoutingMessage = match messages::deserialize_bounded(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(conn_id, error = %e, "undecodable frame dropped");
                if let Some(&peer_id) = self.conn_to_peer.get(&conn_id) {
                    self.punish(peer_id, "undecodable frame").await;
                }
                return;
            }
        };

        if self.conn_to_peer.contains_key(&conn_id) {
            self.handle_routed(conn_id, msg).await;
        } else {
            self.handle_handshake(conn_id, msg).await;
        }
    }

    /// First frame on a pending connection must be the identity exchange.
    async fn handle_handshake(&mut self, conn_id: ConnId, msg: RoutingMessage) {
        let Payload::IdentityExchange { public_key, algorithm, .. } = &msg.payload else {
            warn!(conn_id, kind = msg.payload.kind(), "non-handshake frame before identity");
            self.destroy_pending(conn_id).await;
            return;
        };
        let peer_id = msg.sender_id;

        if self.deps.security.is_banned(&peer_id).await {
            info!(peer_id = %peer_id, "rejected connection from banned peer");
            self.destroy_pending(conn_id).await;
            return;
        }

        match announce::apply_identity_exchange(&self.deps.trust, peer_id, public_key, algorithm)
            .await
        {
            Ok(()) => {}
            Err(e) if e.downcast_ref::<TrustError>().is_some_and(|t| {
                matches!(t, TrustError::KeyMismatch { .. })
            }) =>
            {
                warn!(peer_id = %peer_id, "key mismatch, destroying connection");
                self.destroy_pending(conn_id).await;
                self.emit(RouterEvent::KeyMismatch { peer_id }).await;
                return;
            }
            Err(e) => {
                warn!(peer_id = %peer_id, error = %e, "identity exchange failed");
                self.destroy_pending(conn_id).await;
                return;
            }
        }

        let Some(pending) = self.pending.remove(&conn_id) else { return };

        // Duplicate link to an already connected peer: keep the old one.
        if self.live.contains_key(&peer_id) {
            debug!(peer_id = %peer_id, "duplicate connection discarded");
            pending.handle.destroy().await;
            return;
        }

        // Admission control on the fresh connection's projected score.
        let candidate = calculate_quality_score(&QualityInputs {
            latency_ms: None,
            path: pending.handle.path_type(),
            uptime_secs: 0,
        });
        let current = self.score_snapshot();
        match self.deps.quality.should_accept(candidate, &current) {
            AdmissionDecision::Accept => {}
            AdmissionDecision::AcceptReplacing(victim) => {
                info!(victim = %victim, "evicting worst connection for better candidate");
                self.drop_peer(victim, true).await;
            }
            AdmissionDecision::Reject => {
                info!(peer_id = %peer_id, candidate, "admission rejected");
                pending.handle.destroy().await;
                return;
            }
        }

        let path = pending.handle.path_type();
        self.live.insert(
            peer_id,
            LiveConn {
                conn_id,
                handle: pending.handle,
                status: ConnectionStatus::Connected,
                display_name: msg.sender_name.clone(),
                latency_ms: None,
                connected_at: Instant::now(),
                path,
            },
        );
        self.conn_to_peer.insert(conn_id, peer_id);

        // Mirror into the durable peer store.
        let mut record = self
            .deps
            .peers
            .get(&peer_id)
            .await
            .unwrap_or_else(|| PeerRecord::new(peer_id, msg.sender_name.clone()));
        record.display_name = msg.sender_name.clone();
        record.public_key = Some(public_key.clone());
        record.last_seen_ms = now_ms();
        if let Err(e) = self.deps.peers.store_peer(record).await {
            warn!(error = %e, "peer record upsert failed");
        }

        info!(peer_id = %peer_id, name = %msg.sender_name, "peer connected");
        self.emit(RouterEvent::PeerConnected {
            peer_id,
            display_name: msg.sender_name,
        })
        .await;
    }

    async fn handle_routed(&mut self, conn_id: ConnId, mut msg: RoutingMessage) {
        let Some(&link_peer) = self.conn_to_peer.get(&conn_id) else { return };

        if self.deps.security.check_rate_limit(link_peer).await.is_err() {
            self.after_violation(link_peer).await;
            return;
        }
        if let Err(e) = self.deps.security.validate_message_structure(&msg) {
            debug!(peer_id = %link_peer, error = %e, "structurally invalid message dropped");
            self.punish(link_peer, "invalid structure").await;
            return;
        }
        if self.seen_ids.put(msg.id.clone(), ()).is_some() {
            return; // already processed
        }

        let self_id = self.deps.identity.lock().await.peer_id();
        let forwardable = advance_hop(&mut msg, self_id);

        // Targeted message not for us: forward only.
        if let Some(target) = msg.target_peer_id {
            if target != self_id {
                if forwardable {
                    self.forward(&msg, target).await;
                } else {
                    debug!(id = %msg.id, "targeted message expired in transit");
                }
                return;
            }
        }

        self.dispatch(link_peer, &msg).await;

        if msg.routing_hint == RoutingHint::Broadcast && forwardable {
            if let Err(e) = self.fan_out(&msg, &msg.path).await {
                debug!(error = %e, "broadcast forward failed");
            }
        }
    }

    /// Typed dispatch of a message addressed to (or broadcast past) us.
    async fn dispatch(&mut self, from: PeerId, msg: &RoutingMessage) {
        match &msg.payload {
            Payload::IdentityExchange { .. } => {
                // Handshake already done on this link; ignore repeats.
            }
            Payload::Chat { text } => {
                self.touch(msg.sender_id).await;
                self.emit(RouterEvent::ChatReceived {
                    from: msg.sender_id,
                    from_name: msg.sender_name.clone(),
                    text: text.clone(),
                })
                .await;
            }
            Payload::NameChange { new_name } => {
                if let Some(conn) = self.live.get_mut(&msg.sender_id) {
                    conn.display_name = new_name.clone();
                }
                self.emit(RouterEvent::NameChanged {
                    peer_id: msg.sender_id,
                    new_name: new_name.clone(),
                })
                .await;
            }
            Payload::PeerIntroduction { peers } => {
                self.emit(RouterEvent::TopologyDiscovered { peers: peers.clone() }).await;
            }
            Payload::RelaySignal { intro_id, kind, signal } => {
                self.emit(RouterEvent::RelaySignalReceived {
                    from: msg.sender_id,
                    intro_id: intro_id.clone(),
                    kind: *kind,
                    signal: signal.clone(),
                })
                .await;
            }
            Payload::Ping { nonce, sent_at_ms } => {
                let pong = Payload::Pong { nonce: *nonce, sent_at_ms: *sent_at_ms };
                if let Err(e) = self.send_targeted(msg.sender_id, pong).await {
                    debug!(error = %e, "pong send failed");
                }
            }
            Payload::Pong { sent_at_ms, .. } => {
                // sent_at_ms is peer-controlled; clamp instead of wrapping.
                let rtt = u32::try_from(now_ms().saturating_sub(*sent_at_ms))
                    .unwrap_or(u32::MAX);
                if let Some(conn) = self.live.get_mut(&from) {
                    conn.latency_ms = Some(rtt);
                }
            }
            Payload::Announcement { announcement }
            | Payload::IpChangeAnnouncement { announcement } => {
                self.verify_and_report(announcement).await;
            }
            Payload::RelayedAnnouncement { envelope } => {
                match self
                    .announcements
                    .verify_relayed_announcement(&self.deps.trust, envelope)
                    .await
                {
                    Ok(()) => {
                        self.touch(envelope.announcement.peer_id).await;
                        self.emit(RouterEvent::AnnouncementVerified {
                            announcement: envelope.announcement.clone(),
                        })
                        .await;
                    }
                    Err(e) => {
                        debug!(relay = %envelope.relayed_by, error = %e, "relayed announcement rejected");
                    }
                }
            }
        }
    }

    async fn verify_and_report(&mut self, announcement: &Announcement) {
        match self
            .announcements
            .verify_announcement(&self.deps.trust, announcement)
            .await
        {
            Ok(()) => {
                self.touch(announcement.peer_id).await;
                self.emit(RouterEvent::AnnouncementVerified {
                    announcement: announcement.clone(),
                })
                .await;
            }
            Err(e) => {
                // Rejection is local; the session stays up.
                debug!(peer_id = %announcement.peer_id, error = %e, "announcement rejected");
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    fn new_message(
        &self,
        self_id: PeerId,
        payload: Payload,
        target: Option<PeerId>,
        hint: RoutingHint,
    ) -> anyhow::Result<RoutingMessage> {
        let id = hex::encode(crypto::generate_correlation_id()?);
        Ok(RoutingMessage {
            id,
            sender_id: self_id,
            sender_name: self.deps.display_name.clone(),
            payload,
            path: vec![],
            ttl: DEFAULT_TTL,
            hop_count: 0,
            target_peer_id: target,
            routing_hint: hint,
        })
    }

    /// Broadcast to every connected peer not in `exclude`. Marks the id as
    /// seen so our own message cannot loop back through us.
    async fn broadcast(&mut self, payload: Payload, exclude: &[PeerId]) -> anyhow::Result<usize> {
        let self_id = self.deps.identity.lock().await.peer_id();
        let msg = self.new_message(self_id, payload, None, RoutingHint::Broadcast)?;
        self.seen_ids.put(msg.id.clone(), ());
        self.fan_out(&msg, exclude).await
    }

    async fn fan_out(&self, msg: &RoutingMessage, exclude: &[PeerId]) -> anyhow::Result<usize> {
        let bytes = messages::serialize(msg)?;
        let mut reached = 0;
        for (peer_id, conn) in &self.live {
            if exclude.contains(peer_id) || msg.sender_id == *peer_id {
                continue;
            }
            if conn.handle.send(bytes.clone()).await.is_ok() {
                reached += 1;
            }
        }
        Ok(reached)
    }

    async fn send_targeted(&mut self, target: PeerId, payload: Payload) -> anyhow::Result<()> {
        let self_id = self.deps.identity.lock().await.peer_id();
        let msg = self.new_message(self_id, payload, Some(target), RoutingHint::Direct)?;
        self.seen_ids.put(msg.id.clone(), ());
        self.forward(&msg, target).await;
        Ok(())
    }

    /// Deliver toward `target`: directly when connected, otherwise through
    /// every connected peer not already on the path.
    async fn forward(&self, msg: &RoutingMessage, target: PeerId) {
        let bytes = match messages::serialize(msg) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "forward serialization failed");
                return;
            }
        };
        if let Some(conn) = self.live.get(&target) {
            if conn.handle.send(bytes).await.is_err() {
                debug!(target = %target, "direct forward failed");
            }
            return;
        }
        for (peer_id, conn) in &self.live {
            if msg.path.contains(peer_id) {
                continue;
            }
            let _ = conn.handle.send(bytes.clone()).await;
        }
    }

    async fn broadcast_announcement(&mut self, ip_change: bool) -> anyhow::Result<usize> {
        let previous: Vec<PeerId> = self.live.keys().copied().collect();
        let announcement = {
            let mut identity = self.deps.identity.lock().await;
            let ann = self.announcements.create_announcement(
                &mut identity,
                &self.deps.display_name,
                previous,
            )?;
            // Persist so a reload cannot reuse the sequence number.
            identity.persist(self.deps.storage.as_ref()).await?;
            ann
        };
        let payload = if ip_change {
            Payload::IpChangeAnnouncement { announcement }
        } else {
            Payload::Announcement { announcement }
        };
        self.broadcast(payload, &[]).await
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    async fn probe_latency(&mut self) {
        let peers: Vec<PeerId> = self.live.keys().copied().collect();
        for peer_id in peers {
            let ping = Payload::Ping {
                nonce: rand::random(),
                sent_at_ms: now_ms(),
            };
            if let Err(e) = self.send_targeted(peer_id, ping).await {
                debug!(peer_id = %peer_id, error = %e, "ping failed");
            }
        }
    }

    async fn rebalance(&mut self) {
        let snapshot = self.score_snapshot();
        let report = self.deps.quality.rebalance(&snapshot);
        if let Some(victim) = report.evict {
            info!(victim = %victim, "rebalance pruning worst connection");
            self.drop_peer(victim, true).await;
        }
        // Low-quality connections between target and max are report-only.
    }

    fn score_snapshot(&self) -> Vec<(PeerId, u8)> {
        self.live
            .iter()
            .map(|(&id, conn)| (id, calculate_quality_score(&conn.quality_inputs())))
            .collect()
    }

    fn peer_snapshot(&self) -> Vec<PeerInfo> {
        self.live
            .iter()
            .map(|(&peer_id, conn)| PeerInfo {
                peer_id,
                display_name: conn.display_name.clone(),
                status: conn.status,
                latency_ms: conn.latency_ms,
                path: conn.path,
                uptime_secs: conn.connected_at.elapsed().as_secs(),
                score: calculate_quality_score(&conn.quality_inputs()),
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Teardown and Bookkeeping
    // ------------------------------------------------------------------

    async fn destroy_pending(&mut self, conn_id: ConnId) {
        if let Some(conn) = self.pending.remove(&conn_id) {
            conn.handle.destroy().await;
        }
    }

    async fn handle_close(&mut self, conn_id: ConnId, clean: bool) {
        self.pending.remove(&conn_id);
        if let Some(peer_id) = self.conn_to_peer.remove(&conn_id) {
            if let Some(conn) = self.live.remove(&peer_id) {
                let uptime = conn.connected_at.elapsed().as_secs_f64();
                if let Err(e) = self
                    .deps
                    .peers
                    .record_connection_outcome(&peer_id, clean, uptime, conn.latency_ms, conn.path)
                    .await
                {
                    warn!(error = %e, "connection outcome record failed");
                }
                info!(peer_id = %peer_id, clean, "peer disconnected");
                self.emit(RouterEvent::PeerDisconnected { peer_id }).await;
            }
        }
    }

    async fn drop_peer(&mut self, peer_id: PeerId, clean: bool) {
        if let Some(conn) = self.live.remove(&peer_id) {
            self.conn_to_peer.remove(&conn.conn_id);
            conn.handle.destroy().await;
            let uptime = conn.connected_at.elapsed().as_secs_f64();
            let _ = self
                .deps
                .peers
                .record_connection_outcome(&peer_id, clean, uptime, conn.latency_ms, conn.path)
                .await;
            self.emit(RouterEvent::PeerDisconnected { peer_id }).await;
        }
    }

    async fn punish(&mut self, peer_id: PeerId, reason: &str) {
        self.deps.security.record_violation(peer_id, reason).await;
        self.after_violation(peer_id).await;
    }

    /// Banned peers lose their live connection immediately.
    async fn after_violation(&mut self, peer_id: PeerId) {
        if self.deps.security.is_banned(&peer_id).await && self.live.contains_key(&peer_id) {
            info!(peer_id = %peer_id, "disconnecting banned peer");
            self.drop_peer(peer_id, false).await;
        }
    }

    async fn touch(&self, peer_id: PeerId) {
        let _ = self.deps.peers.update_last_seen(&peer_id).await;
    }

    async fn emit(&self, event: RouterEvent) {
        if self.event_tx.send(event).await.is_err() {
            debug!("router event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(seed: u8) -> PeerId {
        PeerId::from_bytes([seed; 16])
    }

    fn message(ttl: i32, hop_count: u32) -> RoutingMessage {
        RoutingMessage {
            id: "aa".repeat(16),
            sender_id: peer(1),
            sender_name: "alice".to_string(),
            payload: Payload::Chat { text: "hi".to_string() },
            path: vec![peer(1)],
            ttl,
            hop_count,
            target_peer_id: None,
            routing_hint: RoutingHint::Broadcast,
        }
    }

    #[test]
    fn advance_hop_appends_self_and_counts() {
        let mut msg = message(5, 0);
        assert!(advance_hop(&mut msg, peer(2)));
        assert_eq!(msg.ttl, 4);
        assert_eq!(msg.hop_count, 1);
        assert_eq!(msg.path, vec![peer(1), peer(2)]);
    }

    #[test]
    fn zero_ttl_never_forwardable() {
        let mut msg = message(0, 3);
        assert!(!advance_hop(&mut msg, peer(2)), "ttl 0 must not be forwarded");
        assert_eq!(msg.ttl, -1);
    }

    #[test]
    fn hop_cap_stops_forwarding() {
        let mut msg = message(9, MAX_HOP_COUNT);
        assert!(!advance_hop(&mut msg, peer(2)));
    }

    #[test]
    fn self_not_duplicated_in_path() {
        let mut msg = message(5, 0);
        advance_hop(&mut msg, peer(1));
        assert_eq!(msg.path, vec![peer(1)]);
    }
}
