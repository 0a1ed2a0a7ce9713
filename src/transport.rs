//! # Transport Collaborator Boundary
//!
//! The raw bidirectional peer connection is an external collaborator. weft
//! only depends on this seam:
//!
//! - [`TransportConnector::create_connection`] creates one endpoint of an
//!   offer/answer handshake and returns a handle plus its event stream
//! - [`TransportHandle`] exposes `signal`, `send`, `destroy`
//! - [`TransportEvent`] delivers `Signal`, `Connect`, `Data`, `Close`,
//!   `Error` with strict per-connection ordering
//!
//! Offer and answer values are opaque JSON blobs exchanged out-of-band:
//! manually (copy/paste pairing), over a DHT swarm wire, or relayed through
//! an already-connected peer.
//!
//! [`MemoryConnector`] is the in-process implementation used by tests and
//! the demo binary: a hub links two endpoints once their offer and answer
//! blobs have been delivered to the opposite sides.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Transport path classification, as reported by the transport collaborator.
/// Feeds the quality manager's path component.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathType {
    /// Host-to-host connection.
    Direct,
    /// NAT-reflexive (STUN-discovered) path.
    Reflexive,
    /// Traffic forwarded through a relay server.
    Relay,
    /// Path not yet classified.
    #[default]
    Unknown,
}

/// Events emitted by one transport connection, in strict order:
/// `Signal*` then `Connect`, then any number of `Data`, then `Close`.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// An offer or answer blob to deliver to the remote side out-of-band.
    Signal(Value),
    /// Handshake complete; `send` is now valid.
    Connect,
    /// Payload bytes from the remote peer.
    Data(Vec<u8>),
    /// Connection closed (either side).
    Close,
    /// Connection failed.
    Error(String),
}

/// Connector configuration, opaque to weft.
#[derive(Clone, Debug, Default)]
pub struct TransportConfig {
    /// Relay/STUN endpoints handed through to the collaborator.
    pub ice_servers: Vec<String>,
}

/// One endpoint of a transport connection.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// Deliver a signaling blob produced by the remote endpoint.
    async fn signal(&self, blob: Value) -> anyhow::Result<()>;
    /// Send payload bytes. Valid only after `Connect`.
    async fn send(&self, bytes: Vec<u8>) -> anyhow::Result<()>;
    /// Tear down the connection; the remote side observes `Close`.
    async fn destroy(&self);
    /// Current path classification.
    fn path_type(&self) -> PathType;
}

/// Factory for transport connections.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Create one endpoint. The initiator emits its offer as a `Signal`
    /// event; the responder emits its answer after the offer is delivered
    /// via [`TransportHandle::signal`].
    async fn create_connection(
        &self,
        initiator: bool,
        config: TransportConfig,
    ) -> anyhow::Result<(Arc<dyn TransportHandle>, mpsc::Receiver<TransportEvent>)>;
}

// ============================================================================
// In-Memory Connector
// ============================================================================

const EVENT_CHANNEL_CAPACITY: usize = 64;

struct Endpoint {
    event_tx: mpsc::Sender<TransportEvent>,
    peer: Option<u64>,
    connected: bool,
}

struct Hub {
    endpoints: Mutex<HashMap<u64, Endpoint>>,
    next_id: AtomicU64,
}

/// In-process transport hub.
///
/// All endpoints created from clones of one `MemoryConnector` share a hub,
/// so several mesh nodes in one process can pair with each other. The
/// offer/answer dance mirrors the real collaborator:
///
/// 1. initiator endpoint emits `Signal(offer)` on creation
/// 2. `responder.signal(offer)` links the pair and the responder emits
///    `Signal(answer)`
/// 3. `initiator.signal(answer)` completes the handshake; both sides
///    emit `Connect`
#[derive(Clone)]
pub struct MemoryConnector {
    hub: Arc<Hub>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Hub {
                endpoints: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }
}

struct MemoryHandle {
    hub: Arc<Hub>,
    id: u64,
}

impl Hub {
    async fn emit(&self, endpoint_id: u64, event: TransportEvent) {
        let tx = {
            let endpoints = self.endpoints.lock().await;
            endpoints.get(&endpoint_id).map(|e| e.event_tx.clone())
        };
        if let Some(tx) = tx {
            // Receiver dropped means the endpoint is being torn down.
            let _ = tx.send(event).await;
        }
    }

    async fn link(&self, a: u64, b: u64) -> anyhow::Result<()> {
        let mut endpoints = self.endpoints.lock().await;
        if !endpoints.contains_key(&a) || !endpoints.contains_key(&b) {
            anyhow::bail!("signaling blob references a destroyed endpoint");
        }
        if let Some(ep) = endpoints.get_mut(&a) {
            ep.peer = Some(b);
        }
        if let Some(ep) = endpoints.get_mut(&b) {
            ep.peer = Some(a);
        }
        Ok(())
    }

    async fn mark_connected(&self, a: u64, b: u64) {
        let mut endpoints = self.endpoints.lock().await;
        for id in [a, b] {
            if let Some(ep) = endpoints.get_mut(&id) {
                ep.connected = true;
            }
        }
    }
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    async fn create_connection(
        &self,
        initiator: bool,
        _config: TransportConfig,
    ) -> anyhow::Result<(Arc<dyn TransportHandle>, mpsc::Receiver<TransportEvent>)> {
        let id = self.hub.next_id.fetch_add(1, Ordering::Relaxed);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        self.hub.endpoints.lock().await.insert(
            id,
            Endpoint {
                event_tx,
                peer: None,
                connected: false,
            },
        );

        if initiator {
            self.hub.emit(id, TransportEvent::Signal(json!({ "mem_offer": id }))).await;
        }
        debug!(endpoint = id, initiator, "created in-memory transport endpoint");

        let handle = Arc::new(MemoryHandle { hub: self.hub.clone(), id });
        Ok((handle, event_rx))
    }
}

#[async_trait]
impl TransportHandle for MemoryHandle {
    async fn signal(&self, blob: Value) -> anyhow::Result<()> {
        if let Some(offer_id) = blob.get("mem_offer").and_then(Value::as_u64) {
            // Responder side: link to the offering endpoint, emit answer.
            self.hub.link(self.id, offer_id).await?;
            self.hub
                .emit(self.id, TransportEvent::Signal(json!({ "mem_answer": self.id })))
                .await;
            return Ok(());
        }
        if let Some(answer_id) = blob.get("mem_answer").and_then(Value::as_u64) {
            // Initiator side: handshake complete, both sides connect.
            self.hub.link(self.id, answer_id).await?;
            self.hub.mark_connected(self.id, answer_id).await;
            self.hub.emit(self.id, TransportEvent::Connect).await;
            self.hub.emit(answer_id, TransportEvent::Connect).await;
            return Ok(());
        }
        anyhow::bail!("unrecognized signaling blob")
    }

    async fn send(&self, bytes: Vec<u8>) -> anyhow::Result<()> {
        let peer = {
            let endpoints = self.hub.endpoints.lock().await;
            let ep = endpoints
                .get(&self.id)
                .ok_or_else(|| anyhow::anyhow!("endpoint destroyed"))?;
            if !ep.connected {
                anyhow::bail!("send before handshake completion");
            }
            ep.peer
                .ok_or_else(|| anyhow::anyhow!("endpoint has no linked peer"))?
        };
        self.hub.emit(peer, TransportEvent::Data(bytes)).await;
        Ok(())
    }

    async fn destroy(&self) {
        let peer = {
            let mut endpoints = self.hub.endpoints.lock().await;
            endpoints.remove(&self.id).and_then(|ep| ep.peer)
        };
        if let Some(peer) = peer {
            let mut endpoints = self.hub.endpoints.lock().await;
            if let Some(ep) = endpoints.get_mut(&peer) {
                ep.peer = None;
                ep.connected = false;
            }
            drop(endpoints);
            self.hub.emit(peer, TransportEvent::Close).await;
        }
    }

    fn path_type(&self) -> PathType {
        PathType::Direct
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_event(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event stream closed")
    }

    /// Complete the offer/answer dance between two endpoints of one hub.
    async fn pair(
        connector: &MemoryConnector,
    ) -> (
        Arc<dyn TransportHandle>,
        mpsc::Receiver<TransportEvent>,
        Arc<dyn TransportHandle>,
        mpsc::Receiver<TransportEvent>,
    ) {
        let (init, mut init_rx) = connector
            .create_connection(true, TransportConfig::default())
            .await
            .unwrap();
        let (resp, mut resp_rx) = connector
            .create_connection(false, TransportConfig::default())
            .await
            .unwrap();

        let offer = match next_event(&mut init_rx).await {
            TransportEvent::Signal(blob) => blob,
            other => panic!("expected offer signal, got {:?}", other),
        };
        resp.signal(offer).await.unwrap();

        let answer = match next_event(&mut resp_rx).await {
            TransportEvent::Signal(blob) => blob,
            other => panic!("expected answer signal, got {:?}", other),
        };
        init.signal(answer).await.unwrap();

        assert!(matches!(next_event(&mut init_rx).await, TransportEvent::Connect));
        assert!(matches!(next_event(&mut resp_rx).await, TransportEvent::Connect));

        (init, init_rx, resp, resp_rx)
    }

    #[tokio::test]
    async fn offer_answer_handshake_connects_both_sides() {
        let connector = MemoryConnector::new();
        let (init, _init_rx, _resp, mut resp_rx) = pair(&connector).await;

        init.send(b"hello".to_vec()).await.unwrap();
        match next_event(&mut resp_rx).await {
            TransportEvent::Data(bytes) => assert_eq!(bytes, b"hello"),
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_before_connect_fails() {
        let connector = MemoryConnector::new();
        let (handle, _rx) = connector
            .create_connection(true, TransportConfig::default())
            .await
            .unwrap();
        assert!(handle.send(b"early".to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn destroy_closes_remote_side() {
        let connector = MemoryConnector::new();
        let (init, _init_rx, resp, mut resp_rx) = pair(&connector).await;

        init.destroy().await;
        assert!(matches!(next_event(&mut resp_rx).await, TransportEvent::Close));
        assert!(resp.send(b"x".to_vec()).await.is_err());
    }
}
