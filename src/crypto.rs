//! # Cryptographic Infrastructure
//!
//! This module provides the cryptographic primitives for weft:
//!
//! - **Signatures**: Domain-separated Ed25519 signing and verification
//! - **Swarm Keys**: BLAKE3 derivation of swarm keys from pairing passphrases
//! - **Randomness**: CSPRNG-backed nonces and introduction/pairing ids
//!
//! ## Security Properties
//!
//! - Only Ed25519 signatures are accepted (no algorithm negotiation)
//! - Domain separation prevents cross-protocol signature replay
//! - Swarm keys are one-way derived; the passphrase never appears on the wire

use ed25519_dalek::{Signature, Signer, VerifyingKey};

use crate::identity::PeerIdentity;

// ============================================================================
// Signature Error Types
// ============================================================================

/// Error type for signature verification failures.
/// Used across all weft signature verification (announcements, envelopes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Domain Separation Prefixes
// ============================================================================
//
// SECURITY: Domain separation prevents cross-protocol signature replay.
// Each signed data type uses a unique prefix so a signature produced in one
// context can never validate in another.

/// Domain separation prefix for announcement signatures.
pub const ANNOUNCEMENT_SIGNATURE_DOMAIN: &[u8] = b"weft-announce-v1:";

/// Domain separation prefix for relay envelope signatures.
pub const RELAY_ENVELOPE_SIGNATURE_DOMAIN: &[u8] = b"weft-relay-envelope-v1:";

/// Domain separation prefix for swarm key derivation.
const SWARM_KEY_DOMAIN: &[u8] = b"weft-swarm-v1:";

// ============================================================================
// Domain-Separated Signature Helpers
// ============================================================================

/// Sign data with domain separation.
///
/// Prepends the domain prefix to the data before signing, preventing
/// cross-protocol signature replay attacks.
///
/// # Returns
/// 64-byte Ed25519 signature as a `Vec<u8>`.
pub fn sign_with_domain(identity: &PeerIdentity, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    identity.signing_key().sign(&prefixed).to_bytes().to_vec()
}

/// Verify a signature with domain separation.
///
/// Reconstructs the prefixed data and verifies the Ed25519 signature against
/// the given public key bytes.
pub fn verify_with_domain(
    public_key: &[u8; 32],
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    if signature.len() != 64 {
        return Err(SignatureError::InvalidLength);
    }

    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|_| SignatureError::InvalidPublicKey)?;

    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

// ============================================================================
// Swarm Key Derivation
// ============================================================================

/// A 32-byte swarm key derived from a pairing passphrase.
pub type SwarmKey = [u8; 32];

/// Derive the swarm key for a pairing passphrase.
///
/// Peers sharing a passphrase land in the same swarm and can discover each
/// other through it. The derivation is one-way: the passphrase itself is
/// never sent over the wire.
pub fn derive_swarm_key(passphrase: &str) -> SwarmKey {
    let mut hasher = blake3::Hasher::new();
    hasher.update(SWARM_KEY_DOMAIN);
    hasher.update(passphrase.as_bytes());
    *hasher.finalize().as_bytes()
}

// ============================================================================
// Randomness
// ============================================================================

/// Error type for CSPRNG failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoError {
    pub code: Option<u32>,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "CSPRNG unavailable (error code {})", code),
            None => write!(f, "CSPRNG unavailable"),
        }
    }
}

impl std::error::Error for CryptoError {}

impl From<getrandom::Error> for CryptoError {
    fn from(err: getrandom::Error) -> Self {
        Self { code: Some(err.code().get()) }
    }
}

/// Generate a fresh 32-byte announcement nonce.
pub fn generate_nonce() -> Result<[u8; 32], CryptoError> {
    let mut nonce = [0u8; 32];
    getrandom::getrandom(&mut nonce)?;
    Ok(nonce)
}

/// Generate a 16-byte correlation id for introductions and pairings.
pub fn generate_correlation_id() -> Result<[u8; 16], CryptoError> {
    let mut id = [0u8; 16];
    getrandom::getrandom(&mut id)?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerIdentity;

    #[test]
    fn sign_verify_roundtrip() {
        let identity = PeerIdentity::generate();
        let data = b"announcement payload";

        let sig = sign_with_domain(&identity, ANNOUNCEMENT_SIGNATURE_DOMAIN, data);
        assert_eq!(sig.len(), 64);

        assert!(verify_with_domain(
            &identity.public_key_bytes(),
            ANNOUNCEMENT_SIGNATURE_DOMAIN,
            data,
            &sig
        )
        .is_ok());
    }

    #[test]
    fn domain_separation_prevents_cross_context_reuse() {
        let identity = PeerIdentity::generate();
        let data = b"payload";

        let sig = sign_with_domain(&identity, ANNOUNCEMENT_SIGNATURE_DOMAIN, data);

        assert_eq!(
            verify_with_domain(
                &identity.public_key_bytes(),
                RELAY_ENVELOPE_SIGNATURE_DOMAIN,
                data,
                &sig
            ),
            Err(SignatureError::VerificationFailed),
            "signature must not validate under a different domain"
        );
    }

    #[test]
    fn wrong_signer_rejected() {
        let alice = PeerIdentity::generate();
        let mallory = PeerIdentity::generate();
        let data = b"payload";

        let sig = sign_with_domain(&alice, ANNOUNCEMENT_SIGNATURE_DOMAIN, data);

        assert!(verify_with_domain(
            &mallory.public_key_bytes(),
            ANNOUNCEMENT_SIGNATURE_DOMAIN,
            data,
            &sig
        )
        .is_err());
    }

    #[test]
    fn malformed_signatures_rejected() {
        let identity = PeerIdentity::generate();

        assert_eq!(
            verify_with_domain(&identity.public_key_bytes(), ANNOUNCEMENT_SIGNATURE_DOMAIN, b"x", &[]),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            verify_with_domain(
                &identity.public_key_bytes(),
                ANNOUNCEMENT_SIGNATURE_DOMAIN,
                b"x",
                &[0u8; 32]
            ),
            Err(SignatureError::InvalidLength)
        );
    }

    #[test]
    fn swarm_key_is_deterministic_and_passphrase_bound() {
        let a = derive_swarm_key("blue-fox-42");
        let b = derive_swarm_key("blue-fox-42");
        let c = derive_swarm_key("blue-fox-43");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn nonces_are_unique() {
        use std::collections::HashSet;
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let nonce = generate_nonce().expect("CSPRNG failure");
            assert!(seen.insert(nonce), "nonce collision");
        }
    }
}
