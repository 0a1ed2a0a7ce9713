//! # Wire Message Schema
//!
//! Every weft message is JSON with a `type` discriminator. The schema is a
//! closed tagged union: an unknown `type` fails deserialization instead of
//! flowing through untyped dispatch.
//!
//! Three wire surfaces:
//!
//! | Union | Carried over | Purpose |
//! |-------|--------------|---------|
//! | [`RoutingMessage`] + [`Payload`] | transport links | routed mesh traffic |
//! | [`SwarmMessage`] | DHT swarm wires | knock discovery, signaling |
//! | [`Announcement`] / [`RelayEnvelope`] | embedded in payloads | signed reachability |
//!
//! ## Size Limits
//!
//! SECURITY: All deserialization is bounded. [`deserialize_bounded`] checks
//! the raw byte length *before* parsing so an oversized frame is rejected
//! without allocating proportional to attacker input.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

// ============================================================================
// Wire Limits
// ============================================================================

/// Maximum serialized message size (100 KB).
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024;

/// Maximum routing path length before a message is dropped.
pub const MAX_PATH_LENGTH: usize = 20;

/// Maximum hop count before a message is dropped.
pub const MAX_HOP_COUNT: u32 = 20;

/// Maximum permitted TTL on any message.
pub const MAX_TTL: i32 = 10;

/// TTL assigned to fresh outbound messages.
pub const DEFAULT_TTL: i32 = 7;

// ============================================================================
// Wire Errors
// ============================================================================

/// Error type for wire decoding failures.
#[derive(Debug)]
pub enum WireError {
    /// Raw frame exceeds [`MAX_MESSAGE_SIZE`].
    TooLarge { size: usize },
    /// Frame is not valid JSON for the expected closed union.
    Malformed(serde_json::Error),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::TooLarge { size } => {
                write!(f, "frame of {} bytes exceeds {} byte limit", size, MAX_MESSAGE_SIZE)
            }
            WireError::Malformed(e) => write!(f, "malformed frame: {}", e),
        }
    }
}

impl std::error::Error for WireError {}

/// Deserialize a JSON frame with a size check before parsing.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(WireError::TooLarge { size: bytes.len() });
    }
    serde_json::from_slice(bytes).map_err(WireError::Malformed)
}

/// Serialize a message to its JSON wire form.
pub fn serialize<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(msg)
}

// ============================================================================
// Announcements
// ============================================================================

/// A signed "I am reachable" record.
///
/// The signature covers the canonical key-sorted JSON of every field except
/// `signature` itself (see `announce::canonical_payload`). Binary fields are
/// hex strings on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub peer_id: PeerId,
    pub display_name: String,
    pub timestamp_ms: u64,
    /// 32-byte random nonce, hex-encoded. Never reused by an honest peer.
    pub nonce: String,
    /// Strictly increasing per peer.
    pub sequence: u64,
    /// Peers the announcer was recently connected to, for topology recovery.
    pub previous_connections: Vec<PeerId>,
    /// 64-byte Ed25519 signature, hex-encoded.
    pub signature: String,
}

/// A relayed announcement: a third party vouches for delivery with its own
/// signature without touching the embedded announcement's validity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub announcement: Announcement,
    pub relayed_by: PeerId,
    /// Relay's signature over the announcement's canonical form plus
    /// `relayed_by`, hex-encoded.
    pub relay_signature: String,
}

// ============================================================================
// Routed Mesh Traffic
// ============================================================================

/// How the router should propagate a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingHint {
    /// Forward to every connected peer not already in `path`.
    Broadcast,
    /// Deliver toward `target_peer_id`, forwarding through any connected peer.
    Direct,
}

/// Offer/answer discriminator for introduction signaling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
}

/// A peer listed in topology discovery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub peer_id: PeerId,
    pub display_name: String,
}

/// The closed set of routed message kinds.
///
/// Flattened into [`RoutingMessage`] so the wire form is a single JSON
/// object carrying `type` alongside the envelope fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// One-time identity handshake sent immediately after a link connects.
    /// Never forwarded; populates the trust store before any announcement
    /// can be verified.
    IdentityExchange {
        /// Hex-encoded Ed25519 public key.
        public_key: String,
        /// Hex-encoded X25519 key-exchange public key.
        exchange_key: String,
        algorithm: String,
    },
    Chat {
        text: String,
    },
    NameChange {
        new_name: String,
    },
    /// Topology discovery: peers the sender is currently connected to.
    PeerIntroduction {
        peers: Vec<PeerSummary>,
    },
    /// Introduction signaling relayed through a common peer.
    RelaySignal {
        /// Hex-encoded 16-byte introduction id correlating offer and answer.
        intro_id: String,
        kind: SignalKind,
        /// Opaque transport signaling blob.
        signal: serde_json::Value,
    },
    Ping {
        nonce: u64,
        sent_at_ms: u64,
    },
    Pong {
        nonce: u64,
        sent_at_ms: u64,
    },
    Announcement {
        announcement: Announcement,
    },
    RelayedAnnouncement {
        envelope: RelayEnvelope,
    },
    IpChangeAnnouncement {
        announcement: Announcement,
    },
}

impl Payload {
    /// Stable name of the message kind, for logs and dispatch counters.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::IdentityExchange { .. } => "identity_exchange",
            Payload::Chat { .. } => "chat",
            Payload::NameChange { .. } => "name_change",
            Payload::PeerIntroduction { .. } => "peer_introduction",
            Payload::RelaySignal { .. } => "relay_signal",
            Payload::Ping { .. } => "ping",
            Payload::Pong { .. } => "pong",
            Payload::Announcement { .. } => "announcement",
            Payload::RelayedAnnouncement { .. } => "relayed_announcement",
            Payload::IpChangeAnnouncement { .. } => "ip_change_announcement",
        }
    }
}

/// The routed message envelope.
///
/// Created by the router on send; `path` grows, `ttl` shrinks, and
/// `hop_count` grows at every hop. Dropped when `ttl < 0`,
/// `hop_count > MAX_HOP_COUNT`, or `path.len() > MAX_PATH_LENGTH`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingMessage {
    /// Hex-encoded 16-byte unique message id.
    pub id: String,
    pub sender_id: PeerId,
    pub sender_name: String,
    #[serde(flatten)]
    pub payload: Payload,
    pub path: Vec<PeerId>,
    pub ttl: i32,
    pub hop_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_peer_id: Option<PeerId>,
    pub routing_hint: RoutingHint,
}

// ============================================================================
// Swarm Wire Traffic
// ============================================================================

/// Messages exchanged over DHT swarm wires (not routed, single wire hop).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SwarmMessage {
    /// Cold-start broadcast: "does anyone on this swarm know me?"
    Knock {
        peer_id: PeerId,
        display_name: String,
    },
    /// Offer/answer signaling carried over a swarm wire during bootstrap.
    SwarmSignal {
        intro_id: String,
        from_peer: PeerId,
        target_peer: PeerId,
        kind: SignalKind,
        signal: serde_json::Value,
    },
}
