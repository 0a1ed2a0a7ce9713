//! # Peer Identity and Trust Store
//!
//! This module defines the identity types used throughout weft:
//!
//! - [`PeerId`]: random 16-byte peer identifier (stable per profile)
//! - [`PeerIdentity`]: the local identity — Ed25519 signing keypair, X25519
//!   key-exchange keypair, and the persisted announcement sequence counter
//! - [`TrustStore`]: trust-on-first-use (TOFU) pinning of remote public keys
//!
//! ## Identity Model
//!
//! Unlike content-addressed systems, a weft peer id is *not* its public key.
//! The id is generated randomly once per profile; the Ed25519 public key is
//! bound to it by the trust store on first verified contact. This separation
//! is what makes key-mismatch detection meaningful: a later contact claiming
//! a known peer id with a different key is a possible impersonation and is
//! rejected, never silently re-pinned.
//!
//! ## Security Invariants
//!
//! - A `TrustEntry`'s public key is immutable once created
//! - `add_peer` with the same key is idempotent; with a different key it
//!   fails with [`TrustError::KeyMismatch`] and the caller must abort
//! - The local identity is created once and persisted; it is regenerated
//!   only on explicit reset

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use x25519_dalek::{PublicKey as ExchangePublicKey, StaticSecret};

use crate::storage::KvStorage;

/// Algorithm identifier recorded with every pinned key.
pub const ALGORITHM_ED25519: &str = "ed25519";

/// Storage key for the local identity record.
const IDENTITY_STORAGE_KEY: &str = "weft/identity";

/// Storage key for the pinned trust entries.
const TRUST_STORAGE_KEY: &str = "weft/trust";

/// Returns current time as milliseconds since Unix epoch.
/// Used for timestamp generation in signed records.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ============================================================================
// PeerId
// ============================================================================

/// A 16-byte random peer identifier, hex-encoded on the wire and in storage.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId([u8; 16]);

impl PeerId {
    /// Generate a fresh random peer id.
    pub fn generate() -> Result<Self, crate::crypto::CryptoError> {
        Ok(Self(crate::crypto::generate_correlation_id()?))
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 16 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 16];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl TryFrom<String> for PeerId {
    type Error = hex::FromHexError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_hex(&s)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.to_hex()
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", &self.to_hex()[..8])
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// ============================================================================
// PeerIdentity (local-only)
// ============================================================================

/// The local peer's cryptographic identity.
///
/// Holds the Ed25519 signing keypair, the X25519 key-exchange keypair, the
/// algorithm identifier, and the monotonically increasing announcement
/// sequence counter. Created once per profile and persisted; never
/// regenerated except on explicit reset.
pub struct PeerIdentity {
    peer_id: PeerId,
    signing_key: SigningKey,
    exchange_secret: StaticSecret,
    algorithm: String,
    sequence: u64,
}

/// Serialized form of the local identity.
#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    peer_id: PeerId,
    signing_key: String,
    exchange_secret: String,
    algorithm: String,
    sequence: u64,
}

impl PeerIdentity {
    /// Generate a fresh identity with both keypairs and a zeroed sequence.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let exchange_secret = StaticSecret::random_from_rng(OsRng);
        let peer_id = PeerId::generate()
            .unwrap_or_else(|_| PeerId::from_bytes(signing_key.to_bytes()[..16].try_into().unwrap()));
        Self {
            peer_id,
            signing_key,
            exchange_secret,
            algorithm: ALGORITHM_ED25519.to_string(),
            sequence: 0,
        }
    }

    /// Load the persisted identity, or generate and persist a new one.
    ///
    /// This is what makes a "page reload" keep the same peer id: the keypairs
    /// and sequence counter round-trip through the storage collaborator.
    pub async fn load_or_generate(storage: &dyn KvStorage) -> anyhow::Result<Self> {
        if let Some(raw) = storage.get(IDENTITY_STORAGE_KEY).await? {
            let stored: StoredIdentity = serde_json::from_str(&raw)?;
            let signing_bytes: [u8; 32] = hex::decode(&stored.signing_key)?
                .try_into()
                .map_err(|_| anyhow::anyhow!("stored signing key has wrong length"))?;
            let exchange_bytes: [u8; 32] = hex::decode(&stored.exchange_secret)?
                .try_into()
                .map_err(|_| anyhow::anyhow!("stored exchange key has wrong length"))?;
            debug!(peer_id = %stored.peer_id, sequence = stored.sequence, "loaded persisted identity");
            return Ok(Self {
                peer_id: stored.peer_id,
                signing_key: SigningKey::from_bytes(&signing_bytes),
                exchange_secret: StaticSecret::from(exchange_bytes),
                algorithm: stored.algorithm,
                sequence: stored.sequence,
            });
        }

        let identity = Self::generate();
        identity.persist(storage).await?;
        info!(peer_id = %identity.peer_id, "generated new identity");
        Ok(identity)
    }

    /// Persist the identity, including the current sequence counter.
    pub async fn persist(&self, storage: &dyn KvStorage) -> anyhow::Result<()> {
        let stored = StoredIdentity {
            peer_id: self.peer_id,
            signing_key: hex::encode(self.signing_key.to_bytes()),
            exchange_secret: hex::encode(self.exchange_secret.to_bytes()),
            algorithm: self.algorithm.clone(),
            sequence: self.sequence,
        };
        storage
            .set(IDENTITY_STORAGE_KEY, serde_json::to_string(&stored)?)
            .await
    }

    /// Explicitly reset: delete the persisted identity and generate a new one.
    pub async fn reset(storage: &dyn KvStorage) -> anyhow::Result<Self> {
        storage.delete(IDENTITY_STORAGE_KEY).await?;
        let identity = Self::generate();
        identity.persist(storage).await?;
        Ok(identity)
    }

    #[inline]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    #[inline]
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    #[inline]
    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    #[inline]
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    #[inline]
    pub fn exchange_public_bytes(&self) -> [u8; 32] {
        ExchangePublicKey::from(&self.exchange_secret).to_bytes()
    }

    /// Current sequence counter value (last used).
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Increment and return the next announcement sequence number.
    ///
    /// Strictly increasing across the identity's lifetime; the caller is
    /// responsible for persisting after incrementing so a reload cannot
    /// reuse a sequence number.
    pub fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}

impl std::fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerIdentity")
            .field("peer_id", &self.peer_id)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Trust Store (TOFU)
// ============================================================================

/// Error type for trust operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustError {
    /// The peer id is already pinned to a *different* public key.
    /// Possible impersonation — the caller must abort the connection.
    KeyMismatch { peer_id: PeerId },
    /// The trust store could not be persisted.
    Storage(String),
}

impl std::fmt::Display for TrustError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrustError::KeyMismatch { peer_id } => {
                write!(f, "key mismatch for peer {} (possible impersonation)", peer_id)
            }
            TrustError::Storage(msg) => write!(f, "trust store persistence failed: {}", msg),
        }
    }
}

impl std::error::Error for TrustError {}

/// A pinned remote peer key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustEntry {
    pub peer_id: PeerId,
    /// Hex-encoded Ed25519 public key. Immutable once pinned.
    pub public_key: String,
    pub algorithm: String,
    pub first_seen_ms: u64,
}

impl TrustEntry {
    /// Decode the pinned public key bytes.
    pub fn public_key_bytes(&self) -> Option<[u8; 32]> {
        let bytes = hex::decode(&self.public_key).ok()?;
        bytes.try_into().ok()
    }
}

/// Trust-on-first-use store of remote peer keys.
///
/// No network I/O. Entries are persisted through the storage collaborator on
/// every mutation so trust survives a reload.
pub struct TrustStore {
    storage: Arc<dyn KvStorage>,
    entries: Mutex<HashMap<PeerId, TrustEntry>>,
}

impl TrustStore {
    /// Load pinned entries from storage (empty store if none persisted).
    pub async fn load(storage: Arc<dyn KvStorage>) -> anyhow::Result<Self> {
        let entries = match storage.get(TRUST_STORAGE_KEY).await? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => HashMap::new(),
        };
        Ok(Self {
            storage,
            entries: Mutex::new(entries),
        })
    }

    /// TOFU: pin a peer's public key on first contact.
    ///
    /// - No entry: create one and persist.
    /// - Entry with the same key: idempotent success.
    /// - Entry with a different key: [`TrustError::KeyMismatch`]; the pinned
    ///   key is never overwritten.
    pub async fn add_peer(
        &self,
        peer_id: PeerId,
        public_key: &[u8; 32],
        algorithm: &str,
    ) -> Result<(), TrustError> {
        let key_hex = hex::encode(public_key);
        let snapshot = {
            let mut entries = self.entries.lock().await;
            if let Some(existing) = entries.get(&peer_id) {
                if existing.public_key == key_hex {
                    return Ok(());
                }
                return Err(TrustError::KeyMismatch { peer_id });
            }
            entries.insert(
                peer_id,
                TrustEntry {
                    peer_id,
                    public_key: key_hex,
                    algorithm: algorithm.to_string(),
                    first_seen_ms: now_ms(),
                },
            );
            debug!(peer_id = %peer_id, "pinned new peer key (TOFU)");
            entries.clone()
        };
        self.persist(&snapshot).await
    }

    pub async fn is_trusted(&self, peer_id: &PeerId) -> bool {
        self.entries.lock().await.contains_key(peer_id)
    }

    pub async fn get_peer(&self, peer_id: &PeerId) -> Option<TrustEntry> {
        self.entries.lock().await.get(peer_id).cloned()
    }

    /// True when no peer has ever been pinned.
    ///
    /// Used for the probationary trust bootstrap: the very first contact of
    /// a fresh profile is accepted without prior knowledge. This is a known
    /// Sybil-susceptible first-contact behavior, preserved deliberately.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn trusted_peer_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    async fn persist(&self, snapshot: &HashMap<PeerId, TrustEntry>) -> Result<(), TrustError> {
        let raw = serde_json::to_string(snapshot)
            .map_err(|e| TrustError::Storage(e.to_string()))?;
        self.storage
            .set(TRUST_STORAGE_KEY, raw)
            .await
            .map_err(|e| TrustError::Storage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn test_key(seed: u8) -> [u8; 32] {
        let mut key = [0u8; 32];
        key[0] = seed;
        key
    }

    #[test]
    fn peer_id_hex_roundtrip() {
        for _ in 0..50 {
            let id = PeerId::generate().expect("CSPRNG failure");
            let hex = id.to_hex();
            assert_eq!(hex.len(), 32);
            assert_eq!(PeerId::from_hex(&hex).expect("decode failed"), id);
        }
    }

    #[test]
    fn peer_id_hex_rejects_invalid() {
        assert!(PeerId::from_hex("abcd").is_err());
        assert!(PeerId::from_hex(&"a".repeat(40)).is_err());
        assert!(PeerId::from_hex(&"g".repeat(32)).is_err());
    }

    #[test]
    fn identity_sequence_strictly_increases() {
        let mut identity = PeerIdentity::generate();
        let a = identity.next_sequence();
        let b = identity.next_sequence();
        let c = identity.next_sequence();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn identity_persists_across_reload() {
        let storage = Arc::new(MemoryStorage::new());

        let (peer_id, sequence) = {
            let mut identity = PeerIdentity::load_or_generate(storage.as_ref())
                .await
                .expect("load failed");
            identity.next_sequence();
            identity.next_sequence();
            identity.persist(storage.as_ref()).await.expect("persist failed");
            (identity.peer_id(), identity.sequence())
        };

        let reloaded = PeerIdentity::load_or_generate(storage.as_ref())
            .await
            .expect("reload failed");
        assert_eq!(reloaded.peer_id(), peer_id, "peer id must survive reload");
        assert_eq!(reloaded.sequence(), sequence, "sequence must survive reload");
    }

    #[tokio::test]
    async fn identity_reset_regenerates() {
        let storage = Arc::new(MemoryStorage::new());
        let first = PeerIdentity::load_or_generate(storage.as_ref()).await.unwrap();
        let reset = PeerIdentity::reset(storage.as_ref()).await.unwrap();
        assert_ne!(first.peer_id(), reset.peer_id());
    }

    #[tokio::test]
    async fn tofu_pins_first_key() {
        let store = TrustStore::load(Arc::new(MemoryStorage::new())).await.unwrap();
        let peer = PeerId::generate().unwrap();

        assert!(!store.is_trusted(&peer).await);
        store
            .add_peer(peer, &test_key(1), ALGORITHM_ED25519)
            .await
            .expect("first pin must succeed");
        assert!(store.is_trusted(&peer).await);

        let entry = store.get_peer(&peer).await.expect("entry must exist");
        assert_eq!(entry.public_key_bytes(), Some(test_key(1)));
        assert_eq!(entry.algorithm, ALGORITHM_ED25519);
    }

    #[tokio::test]
    async fn tofu_same_key_is_idempotent() {
        let store = TrustStore::load(Arc::new(MemoryStorage::new())).await.unwrap();
        let peer = PeerId::generate().unwrap();

        store.add_peer(peer, &test_key(1), ALGORITHM_ED25519).await.unwrap();
        store
            .add_peer(peer, &test_key(1), ALGORITHM_ED25519)
            .await
            .expect("same key re-pin must be idempotent");
        assert_eq!(store.trusted_peer_count().await, 1);
    }

    #[tokio::test]
    async fn tofu_different_key_fails_key_mismatch() {
        let store = TrustStore::load(Arc::new(MemoryStorage::new())).await.unwrap();
        let peer = PeerId::generate().unwrap();

        store.add_peer(peer, &test_key(1), ALGORITHM_ED25519).await.unwrap();
        let err = store
            .add_peer(peer, &test_key(2), ALGORITHM_ED25519)
            .await
            .expect_err("different key must be rejected");
        assert_eq!(err, TrustError::KeyMismatch { peer_id: peer });

        // The original key must remain pinned.
        let entry = store.get_peer(&peer).await.unwrap();
        assert_eq!(entry.public_key_bytes(), Some(test_key(1)));
    }

    #[tokio::test]
    async fn trust_survives_reload() {
        let storage = Arc::new(MemoryStorage::new());
        let peer = PeerId::generate().unwrap();

        {
            let store = TrustStore::load(storage.clone()).await.unwrap();
            store.add_peer(peer, &test_key(7), ALGORITHM_ED25519).await.unwrap();
        }

        let reloaded = TrustStore::load(storage).await.unwrap();
        assert!(reloaded.is_trusted(&peer).await);
        let err = reloaded
            .add_peer(peer, &test_key(8), ALGORITHM_ED25519)
            .await
            .expect_err("mismatch must survive reload");
        assert!(matches!(err, TrustError::KeyMismatch { .. }));
    }
}
