//! # Peer Introduction Manager
//!
//! Negotiates a brand-new direct connection between two peers already
//! connected to a common third peer, without a manual offer/answer
//! exchange.
//!
//! Sequence:
//!
//! 1. requester creates a fresh initiator transport and captures its offer
//! 2. the offer travels as a `relay_signal` routed message addressed to the
//!    target, forwarded through the common peer
//! 3. the target creates a responder transport, feeds it the offer, and
//!    sends the resulting answer back the same way
//! 4. the requester feeds the answer in; both transports complete the
//!    handshake directly and are handed to the router
//!
//! The answer is awaited on a oneshot resolved by the signal handler, not
//! polled. Concurrent introductions to the same target are deduplicated by
//! introduction id; superseded attempts are discarded without signaling.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::crypto;
use crate::identity::PeerId;
use crate::messages::{Payload, SignalKind};
use crate::router::RouterHandle;
use crate::security::SecurityManager;
use crate::transport::{TransportConfig, TransportConnector, TransportEvent, TransportHandle};

/// How long one introduction may take end to end.
const INTRODUCTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Introduction ids already handled; repeats are superseded attempts.
const SEEN_INTRO_CAPACITY: usize = 256;

/// Relay-mediated connection negotiation.
///
/// One instance per mesh node; the node feeds inbound `relay_signal`
/// payloads into [`IntroductionManager::handle_relay_signal`].
pub struct IntroductionManager {
    connector: Arc<dyn TransportConnector>,
    router: RouterHandle,
    security: Arc<SecurityManager>,
    /// Requester side: intro id -> resolver for the awaited answer.
    pending_answers: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    /// Targets with an introduction already in flight.
    in_flight: Mutex<HashSet<PeerId>>,
    seen_intros: Mutex<LruCache<String, ()>>,
}

impl IntroductionManager {
    pub fn new(
        connector: Arc<dyn TransportConnector>,
        router: RouterHandle,
        security: Arc<SecurityManager>,
    ) -> Self {
        Self {
            connector,
            router,
            security,
            pending_answers: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            seen_intros: Mutex::new(LruCache::new(
                NonZeroUsize::new(SEEN_INTRO_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    /// Request a direct connection to `target` through the mesh.
    ///
    /// Returns once the new transport is handed to the router (or the
    /// attempt timed out). A second call while one is in flight for the
    /// same target is a no-op.
    pub async fn request_introduction(&self, target: PeerId) -> anyhow::Result<()> {
        if !self.in_flight.lock().await.insert(target) {
            debug!(target = %target, "introduction already in flight");
            return Ok(());
        }
        let result = tokio::time::timeout(
            INTRODUCTION_TIMEOUT,
            self.run_requester(target),
        )
        .await
        .map_err(|_| anyhow::anyhow!("introduction to {} timed out", target))
        .and_then(|r| r);

        self.in_flight.lock().await.remove(&target);
        result
    }

    async fn run_requester(&self, target: PeerId) -> anyhow::Result<()> {
        let intro_id = hex::encode(crypto::generate_correlation_id()?);
        let (handle, mut events) = self
            .connector
            .create_connection(true, TransportConfig::default())
            .await?;

        let offer = wait_for_signal(&mut events).await?;

        let (answer_tx, answer_rx) = oneshot::channel();
        self.pending_answers.lock().await.insert(intro_id.clone(), answer_tx);

        let send_result = self
            .router
            .send_to(
                target,
                Payload::RelaySignal {
                    intro_id: intro_id.clone(),
                    kind: SignalKind::Offer,
                    signal: offer,
                },
            )
            .await;
        if let Err(e) = send_result {
            self.pending_answers.lock().await.remove(&intro_id);
            handle.destroy().await;
            return Err(e);
        }

        // Resolved directly by the relay-signal handler; no polling.
        let answer = match answer_rx.await {
            Ok(answer) => answer,
            Err(_) => {
                handle.destroy().await;
                anyhow::bail!("introduction {} superseded", intro_id);
            }
        };
        handle.signal(answer).await?;

        info!(target = %target, intro_id = %intro_id, "introduction handshake complete");
        self.router.attach_transport(handle, events).await
    }

    /// Feed an inbound `relay_signal` payload in. Offers start the responder
    /// flow; answers resolve the matching requester future. Signals for
    /// unknown or already handled introductions are discarded silently.
    pub async fn handle_relay_signal(
        &self,
        from: PeerId,
        intro_id: String,
        kind: SignalKind,
        signal: Value,
    ) -> anyhow::Result<()> {
        match kind {
            SignalKind::Answer => {
                match self.pending_answers.lock().await.remove(&intro_id) {
                    Some(tx) => {
                        // Receiver gone means the requester timed out.
                        let _ = tx.send(signal);
                    }
                    None => debug!(intro_id = %intro_id, "answer for unknown introduction discarded"),
                }
                Ok(())
            }
            SignalKind::Offer => {
                if self.seen_intros.lock().await.put(intro_id.clone(), ()).is_some() {
                    debug!(intro_id = %intro_id, "duplicate introduction offer discarded");
                    return Ok(());
                }
                if self.security.is_banned(&from).await {
                    info!(from = %from, "introduction offer from banned peer rejected");
                    return Ok(());
                }
                self.run_responder(from, intro_id, signal).await
            }
        }
    }

    async fn run_responder(
        &self,
        from: PeerId,
        intro_id: String,
        offer: Value,
    ) -> anyhow::Result<()> {
        let (handle, mut events) = self
            .connector
            .create_connection(false, TransportConfig::default())
            .await?;
        handle.signal(offer).await?;

        let answer = wait_for_signal(&mut events).await?;
        self.router
            .send_to(
                from,
                Payload::RelaySignal {
                    intro_id: intro_id.clone(),
                    kind: SignalKind::Answer,
                    signal: answer,
                },
            )
            .await?;

        debug!(from = %from, intro_id = %intro_id, "introduction answered");
        self.router.attach_transport(handle, events).await
    }
}

/// Wait for the next `Signal` event from a fresh transport.
async fn wait_for_signal(
    events: &mut mpsc::Receiver<TransportEvent>,
) -> anyhow::Result<Value> {
    let deadline = tokio::time::timeout(INTRODUCTION_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Signal(blob) => return Ok(blob),
                TransportEvent::Error(e) => anyhow::bail!("transport failed: {}", e),
                TransportEvent::Close => anyhow::bail!("transport closed before signaling"),
                other => {
                    warn!(?other, "unexpected transport event before signal");
                }
            }
        }
        anyhow::bail!("transport event stream ended")
    });
    deadline
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for signaling data"))?
}
