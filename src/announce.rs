//! # Announcement Protocol
//!
//! Signed, replay-protected "I am reachable" records and their relayed form.
//!
//! ## Replay Defense (layered)
//!
//! 1. **Signature**: canonical key-sorted JSON of every field except the
//!    signature, signed under the announcement domain prefix
//! 2. **Freshness window**: reject older than 5 minutes or further than 30
//!    seconds in the future
//! 3. **Monotonic sequence**: strictly increasing per peer, tracked
//!    independently of nonce history. Primary defense against replay of an
//!    old, differently-nonced announcement
//! 4. **Nonce history**: bounded per-peer LRU of seen nonces, catching exact
//!    replays within the window
//!
//! Check order on verification: unknown peer, signature, timestamp window,
//! sequence, nonce. Replaying the identical announcement reports
//! `ReplayedNonce`; any other non-incremented sequence reports
//! `SequenceNotIncremented`.
//!
//! Verification failures reject the announcement only. They never tear down
//! an existing session.

use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::debug;

use crate::crypto::{
    self, SignatureError, ANNOUNCEMENT_SIGNATURE_DOMAIN, RELAY_ENVELOPE_SIGNATURE_DOMAIN,
};
use crate::identity::{now_ms, PeerId, PeerIdentity, TrustStore};
use crate::messages::{Announcement, Payload, RelayEnvelope};

// ============================================================================
// Freshness and History Bounds
// ============================================================================

/// Reject announcements older than this (5 minutes).
pub const MAX_ANNOUNCEMENT_AGE_MS: u64 = 5 * 60 * 1000;

/// Clock-skew tolerance for future timestamps (30 seconds).
pub const MAX_FUTURE_SKEW_MS: u64 = 30 * 1000;

/// Nonces remembered per peer. Bounded: the sequence counter, not the nonce
/// history, is the durable replay defense.
const NONCE_HISTORY_PER_PEER: usize = 64;

/// Peers with tracked replay state. LRU-bounded against id churn.
const MAX_TRACKED_PEERS: usize = 1024;

// ============================================================================
// Errors
// ============================================================================

/// Announcement verification failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnounceError {
    /// No trust entry for the claimed peer; identity exchange must happen
    /// before any announcement can be verified.
    UnknownPeer { peer_id: PeerId },
    /// Signature malformed or cryptographically invalid.
    Signature(SignatureError),
    /// Timestamp outside the freshness window.
    TimestampOutOfRange { timestamp_ms: u64, now_ms: u64 },
    /// Sequence number not strictly greater than the last accepted value.
    SequenceNotIncremented { last: u64, got: u64 },
    /// Nonce already seen for this peer.
    ReplayedNonce,
    /// A field could not be encoded or decoded (malformed hex and the like).
    Malformed(String),
}

impl std::fmt::Display for AnnounceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnnounceError::UnknownPeer { peer_id } => {
                write!(f, "no trust entry for peer {}", peer_id)
            }
            AnnounceError::Signature(e) => write!(f, "announcement signature invalid: {}", e),
            AnnounceError::TimestampOutOfRange { timestamp_ms, now_ms } => {
                write!(f, "timestamp {} outside freshness window (now {})", timestamp_ms, now_ms)
            }
            AnnounceError::SequenceNotIncremented { last, got } => {
                write!(f, "sequence {} not greater than last accepted {}", got, last)
            }
            AnnounceError::ReplayedNonce => write!(f, "nonce already seen"),
            AnnounceError::Malformed(msg) => write!(f, "malformed announcement: {}", msg),
        }
    }
}

impl std::error::Error for AnnounceError {}

impl From<SignatureError> for AnnounceError {
    fn from(e: SignatureError) -> Self {
        AnnounceError::Signature(e)
    }
}

// ============================================================================
// Canonical Form
// ============================================================================

/// Canonical signing payload: key-sorted JSON of all fields except the
/// signature. serde_json's default map is ordered, so re-encoding through
/// `Value` yields a deterministic byte string on every peer.
pub(crate) fn canonical_payload(ann: &Announcement) -> Result<Vec<u8>, AnnounceError> {
    let mut value = serde_json::to_value(ann)
        .map_err(|e| AnnounceError::Malformed(e.to_string()))?;
    if let Some(obj) = value.as_object_mut() {
        obj.remove("signature");
    }
    serde_json::to_vec(&value).map_err(|e| AnnounceError::Malformed(e.to_string()))
}

/// Relay signing payload: the announcement's canonical form plus the relay's
/// own peer id.
fn relay_payload(ann: &Announcement, relayed_by: PeerId) -> Result<Vec<u8>, AnnounceError> {
    let mut payload = canonical_payload(ann)?;
    payload.extend_from_slice(relayed_by.to_hex().as_bytes());
    Ok(payload)
}

// ============================================================================
// Protocol State
// ============================================================================

struct PeerReplayState {
    last_sequence: u64,
    nonces: LruCache<String, ()>,
}

impl PeerReplayState {
    fn new() -> Self {
        Self {
            last_sequence: 0,
            nonces: LruCache::new(
                NonZeroUsize::new(NONCE_HISTORY_PER_PEER).unwrap_or(NonZeroUsize::MIN),
            ),
        }
    }
}

/// Builds outbound announcements and verifies inbound ones.
///
/// Owns per-peer replay state; injected into the router and orchestrator
/// rather than shared globally.
pub struct AnnouncementProtocol {
    seen: LruCache<PeerId, PeerReplayState>,
}

impl Default for AnnouncementProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl AnnouncementProtocol {
    pub fn new() -> Self {
        Self {
            seen: LruCache::new(
                NonZeroUsize::new(MAX_TRACKED_PEERS).unwrap_or(NonZeroUsize::MIN),
            ),
        }
    }

    /// Build and sign a fresh announcement.
    ///
    /// Increments the identity's sequence counter; the caller persists the
    /// identity afterwards so a reload cannot reuse the sequence.
    pub fn create_announcement(
        &self,
        identity: &mut PeerIdentity,
        display_name: &str,
        previous_connections: Vec<PeerId>,
    ) -> Result<Announcement, AnnounceError> {
        let nonce = crypto::generate_nonce()
            .map_err(|e| AnnounceError::Malformed(e.to_string()))?;
        let mut ann = Announcement {
            peer_id: identity.peer_id(),
            display_name: display_name.to_string(),
            timestamp_ms: now_ms(),
            nonce: hex::encode(nonce),
            sequence: identity.next_sequence(),
            previous_connections,
            signature: String::new(),
        };
        let payload = canonical_payload(&ann)?;
        ann.signature = hex::encode(crypto::sign_with_domain(
            identity,
            ANNOUNCEMENT_SIGNATURE_DOMAIN,
            &payload,
        ));
        Ok(ann)
    }

    /// Verify an inbound announcement against the trust store and the
    /// per-peer replay state. Accepting records the sequence and nonce.
    pub async fn verify_announcement(
        &mut self,
        trust: &TrustStore,
        ann: &Announcement,
    ) -> Result<(), AnnounceError> {
        let entry = trust
            .get_peer(&ann.peer_id)
            .await
            .ok_or(AnnounceError::UnknownPeer { peer_id: ann.peer_id })?;
        let public_key = entry
            .public_key_bytes()
            .ok_or(AnnounceError::Signature(SignatureError::InvalidPublicKey))?;

        let payload = canonical_payload(ann)?;
        let signature = hex::decode(&ann.signature)
            .map_err(|_| AnnounceError::Signature(SignatureError::InvalidLength))?;
        crypto::verify_with_domain(
            &public_key,
            ANNOUNCEMENT_SIGNATURE_DOMAIN,
            &payload,
            &signature,
        )?;

        // Saturating arithmetic: the timestamp is attacker-controlled and a
        // signed frame with u64::MAX must not overflow here.
        let now = now_ms();
        let too_old = ann.timestamp_ms < now.saturating_sub(MAX_ANNOUNCEMENT_AGE_MS);
        let too_future = ann.timestamp_ms > now.saturating_add(MAX_FUTURE_SKEW_MS);
        if too_old || too_future {
            return Err(AnnounceError::TimestampOutOfRange {
                timestamp_ms: ann.timestamp_ms,
                now_ms: now,
            });
        }

        let state = self.seen.get_or_insert_mut(ann.peer_id, PeerReplayState::new);
        let nonce_seen = state.nonces.contains(&ann.nonce);
        if ann.sequence <= state.last_sequence {
            // An exact replay reports the nonce; any other stale sequence
            // reports the counter.
            if nonce_seen && ann.sequence == state.last_sequence {
                return Err(AnnounceError::ReplayedNonce);
            }
            return Err(AnnounceError::SequenceNotIncremented {
                last: state.last_sequence,
                got: ann.sequence,
            });
        }
        if nonce_seen {
            return Err(AnnounceError::ReplayedNonce);
        }

        state.last_sequence = ann.sequence;
        state.nonces.put(ann.nonce.clone(), ());
        debug!(peer_id = %ann.peer_id, sequence = ann.sequence, "announcement verified");
        Ok(())
    }

    /// Wrap a verified announcement for forwarding, vouching with the local
    /// relay signature. The embedded announcement is untouched.
    pub fn create_relay_envelope(
        &self,
        identity: &PeerIdentity,
        announcement: Announcement,
    ) -> Result<RelayEnvelope, AnnounceError> {
        let relayed_by = identity.peer_id();
        let payload = relay_payload(&announcement, relayed_by)?;
        let relay_signature = hex::encode(crypto::sign_with_domain(
            identity,
            RELAY_ENVELOPE_SIGNATURE_DOMAIN,
            &payload,
        ));
        Ok(RelayEnvelope {
            announcement,
            relayed_by,
            relay_signature,
        })
    }

    /// Verify a relayed announcement: the relay's vouching signature first,
    /// then the embedded announcement. Trust in the relay is separate from
    /// trust in the announcer; both must be pinned.
    pub async fn verify_relayed_announcement(
        &mut self,
        trust: &TrustStore,
        envelope: &RelayEnvelope,
    ) -> Result<(), AnnounceError> {
        let relay_entry = trust
            .get_peer(&envelope.relayed_by)
            .await
            .ok_or(AnnounceError::UnknownPeer { peer_id: envelope.relayed_by })?;
        let relay_key = relay_entry
            .public_key_bytes()
            .ok_or(AnnounceError::Signature(SignatureError::InvalidPublicKey))?;

        let payload = relay_payload(&envelope.announcement, envelope.relayed_by)?;
        let relay_sig = hex::decode(&envelope.relay_signature)
            .map_err(|_| AnnounceError::Signature(SignatureError::InvalidLength))?;
        crypto::verify_with_domain(
            &relay_key,
            RELAY_ENVELOPE_SIGNATURE_DOMAIN,
            &payload,
            &relay_sig,
        )?;

        self.verify_announcement(trust, &envelope.announcement).await
    }
}

// ============================================================================
// Identity Exchange
// ============================================================================

/// Build the one-time identity handshake frame sent right after a link
/// connects.
pub fn build_identity_exchange(identity: &PeerIdentity) -> Payload {
    Payload::IdentityExchange {
        public_key: hex::encode(identity.public_key_bytes()),
        exchange_key: hex::encode(identity.exchange_public_bytes()),
        algorithm: identity.algorithm().to_string(),
    }
}

/// Apply a received identity exchange: decode the key and pin it (TOFU).
/// A key mismatch must abort the connection; the caller handles that.
pub async fn apply_identity_exchange(
    trust: &TrustStore,
    sender_id: PeerId,
    public_key_hex: &str,
    algorithm: &str,
) -> anyhow::Result<()> {
    let key_bytes: [u8; 32] = hex::decode(public_key_hex)
        .map_err(|e| anyhow::anyhow!("identity exchange key not hex: {}", e))?
        .try_into()
        .map_err(|_| anyhow::anyhow!("identity exchange key has wrong length"))?;
    trust.add_peer(sender_id, &key_bytes, algorithm).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ALGORITHM_ED25519;
    use crate::storage::MemoryStorage;
    use std::sync::Arc;

    async fn trusted_pair() -> (PeerIdentity, TrustStore) {
        let identity = PeerIdentity::generate();
        let trust = TrustStore::load(Arc::new(MemoryStorage::new())).await.unwrap();
        trust
            .add_peer(identity.peer_id(), &identity.public_key_bytes(), ALGORITHM_ED25519)
            .await
            .unwrap();
        (identity, trust)
    }

    #[tokio::test]
    async fn create_then_verify_succeeds() {
        let (mut alice, trust) = trusted_pair().await;
        let mut proto = AnnouncementProtocol::new();

        let ann = proto.create_announcement(&mut alice, "alice", vec![]).unwrap();
        proto
            .verify_announcement(&trust, &ann)
            .await
            .expect("fresh announcement must verify");
    }

    #[tokio::test]
    async fn same_announcement_twice_fails_replayed_nonce() {
        let (mut alice, trust) = trusted_pair().await;
        let mut proto = AnnouncementProtocol::new();

        let ann = proto.create_announcement(&mut alice, "alice", vec![]).unwrap();
        proto.verify_announcement(&trust, &ann).await.unwrap();
        assert_eq!(
            proto.verify_announcement(&trust, &ann).await,
            Err(AnnounceError::ReplayedNonce)
        );
    }

    #[tokio::test]
    async fn old_sequence_after_newer_fails_sequence_check() {
        let (mut alice, trust) = trusted_pair().await;
        let mut proto = AnnouncementProtocol::new();

        let older = proto.create_announcement(&mut alice, "alice", vec![]).unwrap();
        let newer = proto.create_announcement(&mut alice, "alice", vec![]).unwrap();

        proto.verify_announcement(&trust, &newer).await.unwrap();
        assert!(matches!(
            proto.verify_announcement(&trust, &older).await,
            Err(AnnounceError::SequenceNotIncremented { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_peer_rejected_before_signature() {
        let mut alice = PeerIdentity::generate();
        let trust = TrustStore::load(Arc::new(MemoryStorage::new())).await.unwrap();
        let mut proto = AnnouncementProtocol::new();

        let ann = proto.create_announcement(&mut alice, "alice", vec![]).unwrap();
        assert_eq!(
            proto.verify_announcement(&trust, &ann).await,
            Err(AnnounceError::UnknownPeer { peer_id: alice.peer_id() })
        );
    }

    #[tokio::test]
    async fn tampered_field_fails_signature() {
        let (mut alice, trust) = trusted_pair().await;
        let mut proto = AnnouncementProtocol::new();

        let mut ann = proto.create_announcement(&mut alice, "alice", vec![]).unwrap();
        ann.display_name = "mallory".to_string();
        assert!(matches!(
            proto.verify_announcement(&trust, &ann).await,
            Err(AnnounceError::Signature(SignatureError::VerificationFailed))
        ));
    }

    #[tokio::test]
    async fn stale_and_future_timestamps_rejected() {
        let (mut alice, trust) = trusted_pair().await;
        let mut proto = AnnouncementProtocol::new();

        // Build manually so the timestamp can be forced. The extremes are
        // properly signed, so they reach the freshness check; they must be
        // rejected there, not overflow the age arithmetic.
        for forced_ts in [
            now_ms() - MAX_ANNOUNCEMENT_AGE_MS - 10_000,
            now_ms() + MAX_FUTURE_SKEW_MS + 10_000,
            0,
            u64::MAX,
        ] {
            let nonce = crypto::generate_nonce().unwrap();
            let mut ann = Announcement {
                peer_id: alice.peer_id(),
                display_name: "alice".to_string(),
                timestamp_ms: forced_ts,
                nonce: hex::encode(nonce),
                sequence: alice.next_sequence(),
                previous_connections: vec![],
                signature: String::new(),
            };
            let payload = canonical_payload(&ann).unwrap();
            ann.signature = hex::encode(crypto::sign_with_domain(
                &alice,
                ANNOUNCEMENT_SIGNATURE_DOMAIN,
                &payload,
            ));
            assert!(matches!(
                proto.verify_announcement(&trust, &ann).await,
                Err(AnnounceError::TimestampOutOfRange { .. })
            ));
        }
    }

    #[tokio::test]
    async fn relay_envelope_roundtrip_and_relay_trust() {
        let (mut alice, trust) = trusted_pair().await;
        let relay = PeerIdentity::generate();
        let mut proto = AnnouncementProtocol::new();

        let ann = proto.create_announcement(&mut alice, "alice", vec![]).unwrap();
        let envelope = proto.create_relay_envelope(&relay, ann).unwrap();

        // Relay not yet trusted.
        assert_eq!(
            proto.verify_relayed_announcement(&trust, &envelope).await,
            Err(AnnounceError::UnknownPeer { peer_id: relay.peer_id() })
        );

        trust
            .add_peer(relay.peer_id(), &relay.public_key_bytes(), ALGORITHM_ED25519)
            .await
            .unwrap();
        proto
            .verify_relayed_announcement(&trust, &envelope)
            .await
            .expect("trusted relay envelope must verify");
    }

    #[tokio::test]
    async fn relay_signature_tamper_rejected() {
        let (mut alice, trust) = trusted_pair().await;
        let relay = PeerIdentity::generate();
        trust
            .add_peer(relay.peer_id(), &relay.public_key_bytes(), ALGORITHM_ED25519)
            .await
            .unwrap();
        let mut proto = AnnouncementProtocol::new();

        let ann = proto.create_announcement(&mut alice, "alice", vec![]).unwrap();
        let mut envelope = proto.create_relay_envelope(&relay, ann).unwrap();
        envelope.relay_signature = "00".repeat(64);

        assert!(matches!(
            proto.verify_relayed_announcement(&trust, &envelope).await,
            Err(AnnounceError::Signature(_))
        ));
    }

    #[tokio::test]
    async fn identity_exchange_pins_key() {
        let alice = PeerIdentity::generate();
        let trust = TrustStore::load(Arc::new(MemoryStorage::new())).await.unwrap();

        let payload = build_identity_exchange(&alice);
        let Payload::IdentityExchange { public_key, algorithm, .. } = payload else {
            panic!("wrong payload kind");
        };
        apply_identity_exchange(&trust, alice.peer_id(), &public_key, &algorithm)
            .await
            .unwrap();
        assert!(trust.is_trusted(&alice.peer_id()).await);
    }
}
