//! # weft
//!
//! Resilient peer-to-peer mesh chat networking.
//!
//! Peers discover each other through a DHT-style swarm, establish direct
//! transport connections via an offer/answer handshake, authenticate with
//! TOFU-pinned Ed25519 identities, route TTL-bounded messages across hops,
//! and automatically recover connectivity after a restart or IP change.
//!
//! ## Layers
//!
//! | Module | Concern |
//! |--------|---------|
//! | [`identity`] | peer ids, local keypairs, TOFU trust store |
//! | [`crypto`] | domain-separated signatures, swarm keys, nonces |
//! | [`messages`] | closed tagged-union JSON wire schema |
//! | [`announce`] | signed replay-protected announcements |
//! | [`persistence`] | durable peer records and candidate ranking |
//! | [`quality`] | connection scoring and admission/eviction |
//! | [`security`] | rate limiting, validation, ban list |
//! | [`router`] | live connections and routed message dispatch |
//! | [`introduction`] | relay-mediated connection negotiation |
//! | [`reconnect`] | cold/warm start orchestration |
//! | [`transport`], [`swarm`], [`storage`] | collaborator boundaries with in-memory implementations |
//! | [`node`] | the [`node::MeshNode`] facade |
//!
//! The transport, swarm, and storage collaborators are trait seams, so a
//! host environment supplies real implementations while tests and the demo
//! binary run entire meshes in-process.

pub mod announce;
pub mod crypto;
pub mod identity;
pub mod introduction;
pub mod messages;
pub mod node;
pub mod persistence;
pub mod quality;
pub mod reconnect;
pub mod router;
pub mod security;
pub mod storage;
pub mod swarm;
pub mod transport;

pub use announce::{AnnounceError, AnnouncementProtocol};
pub use identity::{PeerId, PeerIdentity, TrustError, TrustStore};
pub use messages::{Announcement, Payload, RelayEnvelope, RoutingMessage};
pub use node::{MeshNode, NodeConfig, NodeEvent};
pub use quality::{QualityConfig, QualityManager};
pub use reconnect::{ReconnectConfig, ReconnectPhase, ReconnectStats};
pub use router::{RouterEvent, RouterHandle};
pub use security::SecurityManager;
pub use storage::{KvStorage, MemoryStorage};
pub use swarm::{MemorySwarm, SwarmConnector};
pub use transport::{MemoryConnector, TransportConnector};
