//! # Reconnection Orchestrator
//!
//! The master strategy: on startup or network change, decide cold start vs
//! warm start and drive the layered fallback.
//!
//! ## State machine
//!
//! `Idle -> Initializing -> {ColdStart | WarmStart} -> Reconnecting ->
//! {Succeeded | FallbackRequired}`
//!
//! Cold-start layers, each with its own timeout, stopping at the first
//! layer producing at least one live connection:
//!
//! 1. recently connected peers, reusing cached signaling blobs
//! 2. a knock broadcast over the DHT swarm to previously known peers
//! 3. all known peers regardless of recency
//! 4. `FallbackRequired` — manual pairing is the only way forward
//!
//! Warm start (connections already live): broadcast a fresh announcement,
//! share topology, and reconnect to missing candidates through
//! introduction relays.
//!
//! Progress is observed through a `watch` channel of the live connection
//! count fed by the node's event pump, so layer completion is an awaited
//! condition rather than a poll loop. A network-change detector watches the
//! public IP and triggers the warm path plus an `ip_change_announcement`
//! mesh-wide.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::crypto::{self, SwarmKey};
use crate::identity::{PeerId, TrustStore};
use crate::introduction::IntroductionManager;
use crate::messages::{Payload, PeerSummary, SignalKind, SwarmMessage};
use crate::persistence::PeerStore;
use crate::router::RouterHandle;
use crate::swarm::{SwarmConnector, SwarmEvent, SwarmHandle, WireId};
use crate::transport::{TransportConfig, TransportConnector, TransportEvent, TransportHandle};

// ============================================================================
// Configuration and Observability
// ============================================================================

#[derive(Clone, Debug)]
pub struct ReconnectConfig {
    /// Per-layer timeouts: cached signaling, swarm knock, all known peers.
    pub layer_timeouts: [Duration; 3],
    /// Candidates considered per layer.
    pub candidate_limit: usize,
    /// Age cutoff for "recent" candidates in layer 1.
    pub candidate_max_age_ms: u64,
    /// Cadence of periodic announcements while connected.
    pub announce_interval: Duration,
    /// Cadence of the network-change detector.
    pub network_check_interval: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            layer_timeouts: [
                Duration::from_secs(8),
                Duration::from_secs(10),
                Duration::from_secs(10),
            ],
            candidate_limit: 5,
            candidate_max_age_ms: 24 * 3600 * 1000,
            announce_interval: Duration::from_secs(60),
            network_check_interval: Duration::from_secs(20),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectPhase {
    Idle,
    Initializing,
    ColdStart,
    WarmStart,
    Reconnecting,
    Succeeded,
    FallbackRequired,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectMethod {
    CachedSignal,
    SwarmKnock,
    AllKnownPeers,
    WarmAnnounce,
    Manual,
}

/// Outcome of the last orchestrated run.
#[derive(Clone, Debug)]
pub struct ReconnectOutcome {
    pub method: ReconnectMethod,
    pub peers_connected: usize,
    pub duration_ms: u64,
}

#[derive(Clone, Debug, Default)]
pub struct ReconnectStats {
    pub total_reconnection_attempts: u64,
    pub successful_reconnections: u64,
    pub failed_reconnections: u64,
    pub last_result: Option<ReconnectOutcome>,
}

// ============================================================================
// Connectivity Probe
// ============================================================================

/// Network-change detection collaborator: online state and apparent public
/// IP, as the host environment reports them.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_online(&self) -> bool;
    async fn public_ip(&self) -> Option<String>;
}

/// Fixed probe for tests and the demo binary; the reported IP can be
/// swapped to simulate a network change.
#[derive(Default)]
pub struct StaticProbe {
    ip: std::sync::Mutex<Option<String>>,
}

impl StaticProbe {
    pub fn new(ip: &str) -> Self {
        Self {
            ip: std::sync::Mutex::new(Some(ip.to_string())),
        }
    }

    pub fn set_ip(&self, ip: &str) {
        if let Ok(mut guard) = self.ip.lock() {
            *guard = Some(ip.to_string());
        }
    }
}

#[async_trait]
impl ConnectivityProbe for StaticProbe {
    async fn is_online(&self) -> bool {
        true
    }

    async fn public_ip(&self) -> Option<String> {
        self.ip.lock().ok().and_then(|g| g.clone())
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

const SEEN_SWARM_INTRO_CAPACITY: usize = 256;
const SWARM_SIGNAL_TIMEOUT: Duration = Duration::from_secs(8);

/// Everything the orchestrator needs, injected at construction.
pub struct OrchestratorDeps {
    pub config: ReconnectConfig,
    pub router: RouterHandle,
    pub peers: Arc<PeerStore>,
    pub trust: Arc<TrustStore>,
    pub connector: Arc<dyn TransportConnector>,
    pub swarm: Arc<dyn SwarmConnector>,
    pub swarm_key: SwarmKey,
    pub probe: Arc<dyn ConnectivityProbe>,
    pub intro: Arc<IntroductionManager>,
    /// Live connection count, fed by the node's event pump.
    pub connected_count: watch::Receiver<usize>,
    pub local_peer_id: PeerId,
    pub display_name: String,
}

struct OrchState {
    phase: ReconnectPhase,
    stats: ReconnectStats,
    swarm_handle: Option<Arc<dyn SwarmHandle>>,
    /// Swarm-mediated signaling: intro id -> answer resolver.
    pending_answers: HashMap<String, oneshot::Sender<Value>>,
    seen_intros: LruCache<String, ()>,
    last_ip: Option<String>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct ReconnectOrchestrator {
    deps: Arc<OrchestratorDeps>,
    state: Arc<Mutex<OrchState>>,
}

impl ReconnectOrchestrator {
    pub fn new(deps: OrchestratorDeps) -> Self {
        Self {
            deps: Arc::new(deps),
            state: Arc::new(Mutex::new(OrchState {
                phase: ReconnectPhase::Idle,
                stats: ReconnectStats::default(),
                swarm_handle: None,
                pending_answers: HashMap::new(),
                seen_intros: LruCache::new(
                    NonZeroUsize::new(SEEN_SWARM_INTRO_CAPACITY).unwrap_or(NonZeroUsize::MIN),
                ),
                last_ip: None,
                tasks: Vec::new(),
            })),
        }
    }

    /// Join the swarm, start background timers, and run the cold/warm
    /// decision. Returns once the orchestrated run is underway; progress is
    /// observable via [`Self::phase`] and [`Self::stats`].
    pub async fn start(&self) -> anyhow::Result<()> {
        set_phase(&self.state, ReconnectPhase::Initializing).await;

        let (swarm_handle, swarm_events) = self.deps.swarm.join(self.deps.swarm_key).await?;
        {
            let mut state = self.state.lock().await;
            state.swarm_handle = Some(swarm_handle);
            state.last_ip = self.deps.probe.public_ip().await;

            state.tasks.push(tokio::spawn(swarm_pump(
                self.deps.clone(),
                self.state.clone(),
                swarm_events,
            )));
            state.tasks.push(tokio::spawn(announce_loop(self.deps.clone())));
            state.tasks.push(tokio::spawn(network_detector(
                self.deps.clone(),
                self.state.clone(),
            )));
            state.tasks.push(tokio::spawn(run_reconnection(
                self.deps.clone(),
                self.state.clone(),
            )));
        }
        Ok(())
    }

    /// Force the warm-start path, as the network-change detector would.
    pub async fn trigger_warm_start(&self) {
        let deps = self.deps.clone();
        let state = self.state.clone();
        let handle = tokio::spawn(run_reconnection(deps, state));
        self.state.lock().await.tasks.push(handle);
    }

    pub async fn phase(&self) -> ReconnectPhase {
        self.state.lock().await.phase
    }

    pub async fn stats(&self) -> ReconnectStats {
        self.state.lock().await.stats.clone()
    }

    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        for task in state.tasks.drain(..) {
            task.abort();
        }
        if let Some(swarm) = state.swarm_handle.take() {
            swarm.leave().await;
        }
        state.phase = ReconnectPhase::Idle;
    }
}

async fn set_phase(state: &Arc<Mutex<OrchState>>, phase: ReconnectPhase) {
    let mut guard = state.lock().await;
    if guard.phase != phase {
        debug!(?phase, "orchestrator phase");
        guard.phase = phase;
    }
}

// ============================================================================
// The Orchestrated Run
// ============================================================================

async fn run_reconnection(deps: Arc<OrchestratorDeps>, state: Arc<Mutex<OrchState>>) {
    let started = Instant::now();
    {
        let mut guard = state.lock().await;
        guard.stats.total_reconnection_attempts += 1;
    }

    let baseline = *deps.connected_count.borrow();
    let outcome = if baseline == 0 {
        set_phase(&state, ReconnectPhase::ColdStart).await;
        cold_start(&deps, &state).await
    } else {
        set_phase(&state, ReconnectPhase::WarmStart).await;
        warm_start(&deps).await
    };

    let connected = *deps.connected_count.borrow();
    let mut guard = state.lock().await;
    match outcome {
        Some(method) => {
            guard.stats.successful_reconnections += 1;
            guard.stats.last_result = Some(ReconnectOutcome {
                method,
                peers_connected: connected,
                duration_ms: started.elapsed().as_millis() as u64,
            });
            guard.phase = ReconnectPhase::Succeeded;
            info!(?method, connected, "reconnection succeeded");
        }
        None => {
            guard.stats.failed_reconnections += 1;
            guard.stats.last_result = Some(ReconnectOutcome {
                method: ReconnectMethod::Manual,
                peers_connected: connected,
                duration_ms: started.elapsed().as_millis() as u64,
            });
            guard.phase = ReconnectPhase::FallbackRequired;
            warn!("cold start failed, manual pairing required");
        }
    }
}

/// Await the live count rising above `baseline`, bounded by `timeout`.
async fn wait_for_growth(
    rx: &mut watch::Receiver<usize>,
    baseline: usize,
    timeout: Duration,
) -> bool {
    tokio::time::timeout(timeout, rx.wait_for(|&n| n > baseline))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

async fn cold_start(
    deps: &Arc<OrchestratorDeps>,
    state: &Arc<Mutex<OrchState>>,
) -> Option<ReconnectMethod> {
    set_phase(state, ReconnectPhase::Reconnecting).await;
    let mut count_rx = deps.connected_count.clone();
    let baseline = *count_rx.borrow();

    // Layer 1: recent peers with cached signaling data.
    let recent = deps
        .peers
        .reconnection_candidates(deps.config.candidate_limit, deps.config.candidate_max_age_ms)
        .await;
    let attempted = attempt_cached_signals(deps, &recent).await;
    if attempted > 0
        && wait_for_growth(&mut count_rx, baseline, deps.config.layer_timeouts[0]).await
    {
        return Some(ReconnectMethod::CachedSignal);
    }

    // Layer 2: knock over the swarm; known peers initiate offers back.
    if knock(deps, state).await
        && wait_for_growth(&mut count_rx, baseline, deps.config.layer_timeouts[1]).await
    {
        return Some(ReconnectMethod::SwarmKnock);
    }

    // Layer 3: every known peer, age ignored.
    let all = deps
        .peers
        .reconnection_candidates(usize::MAX, u64::MAX)
        .await;
    let attempted = attempt_cached_signals(deps, &all).await;
    let knocked = knock(deps, state).await;
    if (attempted > 0 || knocked)
        && wait_for_growth(&mut count_rx, baseline, deps.config.layer_timeouts[2]).await
    {
        return Some(ReconnectMethod::AllKnownPeers);
    }

    None
}

/// Try candidates with cached signaling blobs; returns how many attempts
/// were launched. Stale blobs fail fast and are just logged.
async fn attempt_cached_signals(
    deps: &Arc<OrchestratorDeps>,
    candidates: &[crate::persistence::PeerRecord],
) -> usize {
    let mut launched = 0;
    for record in candidates {
        let Some(cached) = record.cached_signal.clone() else { continue };
        let _ = deps.peers.increment_reconnection_attempts(&record.peer_id).await;
        launched += 1;

        let deps = deps.clone();
        let peer_id = record.peer_id;
        tokio::spawn(async move {
            if let Err(e) = reuse_cached_signal(&deps, cached).await {
                debug!(peer_id = %peer_id, error = %e, "cached signaling reuse failed");
            }
        });
    }
    launched
}

async fn reuse_cached_signal(deps: &OrchestratorDeps, cached: Value) -> anyhow::Result<()> {
    let (handle, mut events) = deps
        .connector
        .create_connection(true, TransportConfig::default())
        .await?;
    // Our own fresh offer is not needed; the cached blob drives the link.
    let _ = wait_for_signal(&mut events).await?;
    if let Err(e) = handle.signal(cached).await {
        handle.destroy().await;
        return Err(e);
    }
    deps.router.attach_transport(handle, events).await
}

async fn knock(deps: &Arc<OrchestratorDeps>, state: &Arc<Mutex<OrchState>>) -> bool {
    let swarm = state.lock().await.swarm_handle.clone();
    let Some(swarm) = swarm else { return false };
    let message = SwarmMessage::Knock {
        peer_id: deps.local_peer_id,
        display_name: deps.display_name.clone(),
    };
    match swarm.broadcast(&message).await {
        Ok(reached) => {
            info!(reached, "knock broadcast over swarm");
            reached > 0
        }
        Err(e) => {
            warn!(error = %e, "knock broadcast failed");
            false
        }
    }
}

async fn warm_start(deps: &Arc<OrchestratorDeps>) -> Option<ReconnectMethod> {
    if let Err(e) = deps.router.broadcast_announcement(false).await {
        warn!(error = %e, "warm-start announcement failed");
    }

    // Topology discovery: share our connected peers mesh-wide.
    match deps.router.connected_peers().await {
        Ok(peers) => {
            let summaries: Vec<PeerSummary> = peers
                .iter()
                .map(|p| PeerSummary {
                    peer_id: p.peer_id,
                    display_name: p.display_name.clone(),
                })
                .collect();
            let connected: Vec<PeerId> = peers.iter().map(|p| p.peer_id).collect();
            if let Err(e) = deps
                .router
                .broadcast_payload(Payload::PeerIntroduction { peers: summaries })
                .await
            {
                debug!(error = %e, "topology broadcast failed");
            }

            // Reconnect to known candidates we are not currently linked to,
            // through introduction relays.
            let candidates = deps
                .peers
                .reconnection_candidates(deps.config.candidate_limit, deps.config.candidate_max_age_ms)
                .await;
            for candidate in candidates {
                if connected.contains(&candidate.peer_id)
                    || candidate.peer_id == deps.local_peer_id
                {
                    continue;
                }
                let intro = deps.intro.clone();
                let target = candidate.peer_id;
                tokio::spawn(async move {
                    if let Err(e) = intro.request_introduction(target).await {
                        debug!(target = %target, error = %e, "warm-start introduction failed");
                    }
                });
            }
        }
        Err(e) => warn!(error = %e, "connected peer snapshot failed"),
    }
    Some(ReconnectMethod::WarmAnnounce)
}

// ============================================================================
// Background Tasks
// ============================================================================

async fn announce_loop(deps: Arc<OrchestratorDeps>) {
    let mut tick = tokio::time::interval(deps.config.announce_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        if *deps.connected_count.borrow() == 0 {
            continue;
        }
        if let Err(e) = deps.router.broadcast_announcement(false).await {
            debug!(error = %e, "periodic announcement failed");
        }
    }
}

async fn network_detector(deps: Arc<OrchestratorDeps>, state: Arc<Mutex<OrchState>>) {
    let mut tick = tokio::time::interval(deps.config.network_check_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        if !deps.probe.is_online().await {
            continue;
        }
        let current = deps.probe.public_ip().await;
        let changed = {
            let mut guard = state.lock().await;
            let changed = guard.last_ip.is_some() && current.is_some() && guard.last_ip != current;
            guard.last_ip = current;
            changed
        };
        if changed {
            info!("public ip changed, announcing and re-running warm start");
            if let Err(e) = deps.router.broadcast_announcement(true).await {
                debug!(error = %e, "ip change announcement failed");
            }
            tokio::spawn(run_reconnection(deps.clone(), state.clone()));
        }
    }
}

/// Pump swarm events: answer knocks from known peers and run the
/// offer/answer signaling that rides on swarm wires during bootstrap.
async fn swarm_pump(
    deps: Arc<OrchestratorDeps>,
    state: Arc<Mutex<OrchState>>,
    mut events: mpsc::Receiver<SwarmEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SwarmEvent::WireUp(wire) => {
                debug!(%wire, "swarm wire up");
            }
            SwarmEvent::WireDown(wire) => {
                debug!(%wire, "swarm wire down");
            }
            SwarmEvent::Message { wire, message } => {
                handle_swarm_message(&deps, &state, wire, message).await;
            }
        }
    }
}

async fn handle_swarm_message(
    deps: &Arc<OrchestratorDeps>,
    state: &Arc<Mutex<OrchState>>,
    wire: WireId,
    message: SwarmMessage,
) {
    match message {
        SwarmMessage::Knock { peer_id, display_name } => {
            if peer_id == deps.local_peer_id {
                return;
            }
            // Answer knocks from peers we know; the trust bootstrap lets a
            // completely fresh profile answer its first contact too.
            let known = deps.trust.is_trusted(&peer_id).await
                || deps.peers.get(&peer_id).await.is_some()
                || deps.trust.is_empty().await;
            if !known {
                debug!(peer_id = %peer_id, "ignoring knock from unknown peer");
                return;
            }
            info!(peer_id = %peer_id, name = %display_name, "answering knock with an offer");
            if let Err(e) = offer_over_swarm(deps, state, wire, peer_id).await {
                debug!(peer_id = %peer_id, error = %e, "swarm offer failed");
            }
        }
        SwarmMessage::SwarmSignal { intro_id, from_peer, target_peer, kind, signal } => {
            if target_peer != deps.local_peer_id {
                return;
            }
            match kind {
                SignalKind::Answer => {
                    let resolver = state.lock().await.pending_answers.remove(&intro_id);
                    match resolver {
                        Some(tx) => {
                            let _ = tx.send(signal);
                        }
                        None => debug!(intro_id = %intro_id, "swarm answer for unknown intro discarded"),
                    }
                }
                SignalKind::Offer => {
                    let duplicate = state
                        .lock()
                        .await
                        .seen_intros
                        .put(intro_id.clone(), ())
                        .is_some();
                    if duplicate {
                        debug!(intro_id = %intro_id, "duplicate swarm offer discarded");
                        return;
                    }
                    if let Err(e) =
                        answer_over_swarm(deps, state, wire, from_peer, intro_id, signal).await
                    {
                        debug!(from = %from_peer, error = %e, "swarm answer failed");
                    }
                }
            }
        }
    }
}

/// Knock answerer side: initiate a transport and send its offer over the
/// swarm wire the knock arrived on.
async fn offer_over_swarm(
    deps: &Arc<OrchestratorDeps>,
    state: &Arc<Mutex<OrchState>>,
    wire: WireId,
    target: PeerId,
) -> anyhow::Result<()> {
    let swarm = state
        .lock()
        .await
        .swarm_handle
        .clone()
        .ok_or_else(|| anyhow::anyhow!("not joined to a swarm"))?;

    let intro_id = hex::encode(crypto::generate_correlation_id()?);
    let (handle, mut events) = deps
        .connector
        .create_connection(true, TransportConfig::default())
        .await?;
    let offer = wait_for_signal(&mut events).await?;

    let (answer_tx, answer_rx) = oneshot::channel();
    state
        .lock()
        .await
        .pending_answers
        .insert(intro_id.clone(), answer_tx);

    swarm
        .send(
            wire,
            &SwarmMessage::SwarmSignal {
                intro_id: intro_id.clone(),
                from_peer: deps.local_peer_id,
                target_peer: target,
                kind: SignalKind::Offer,
                signal: offer,
            },
        )
        .await?;

    // Finish asynchronously so the pump keeps draining events.
    let deps = deps.clone();
    let state = state.clone();
    tokio::spawn(async move {
        let answer = match tokio::time::timeout(SWARM_SIGNAL_TIMEOUT, answer_rx).await {
            Ok(Ok(answer)) => answer,
            _ => {
                state.lock().await.pending_answers.remove(&intro_id);
                handle.destroy().await;
                debug!(intro_id = %intro_id, "no swarm answer, attempt abandoned");
                return;
            }
        };
        if let Err(e) = handle.signal(answer).await {
            debug!(error = %e, "swarm answer rejected by transport");
            handle.destroy().await;
            return;
        }
        if let Err(e) = deps.router.attach_transport(handle, events).await {
            warn!(error = %e, "router attach failed");
        }
    });
    Ok(())
}

/// Knocker side: respond to an inbound swarm offer with an answer.
async fn answer_over_swarm(
    deps: &Arc<OrchestratorDeps>,
    state: &Arc<Mutex<OrchState>>,
    wire: WireId,
    from: PeerId,
    intro_id: String,
    offer: Value,
) -> anyhow::Result<()> {
    let swarm = state
        .lock()
        .await
        .swarm_handle
        .clone()
        .ok_or_else(|| anyhow::anyhow!("not joined to a swarm"))?;

    let (handle, mut events) = deps
        .connector
        .create_connection(false, TransportConfig::default())
        .await?;
    handle.signal(offer).await?;
    let answer = wait_for_signal(&mut events).await?;

    swarm
        .send(
            wire,
            &SwarmMessage::SwarmSignal {
                intro_id,
                from_peer: deps.local_peer_id,
                target_peer: from,
                kind: SignalKind::Answer,
                signal: answer,
            },
        )
        .await?;

    deps.router.attach_transport(handle, events).await
}

/// Next `Signal` from a fresh transport, bounded.
async fn wait_for_signal(
    events: &mut mpsc::Receiver<TransportEvent>,
) -> anyhow::Result<Value> {
    tokio::time::timeout(SWARM_SIGNAL_TIMEOUT, async {
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
