//! # Security Manager
//!
//! Abuse containment for the mesh:
//!
//! - per-peer sliding-window rate limiting (50 messages / 1 s)
//! - structural validation of routed messages (size, path, ttl, hops)
//! - violation tracking with a persisted ban list (ban at 3 violations)
//! - chat text sanitation before broadcast
//!
//! Rate-limit and structure failures drop the message and record a
//! violation; they never propagate as an error to the remote peer.
//! `is_banned` gates every new incoming offer or answer.

use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::identity::{now_ms, PeerId};
use crate::messages::{self, RoutingMessage, MAX_HOP_COUNT, MAX_MESSAGE_SIZE, MAX_PATH_LENGTH, MAX_TTL};
use crate::storage::KvStorage;

// ============================================================================
// Limits
// ============================================================================

/// Sliding rate-limit window.
pub const RATE_LIMIT_WINDOW_MS: u64 = 1000;

/// Messages permitted per peer per window.
pub const RATE_LIMIT_MAX_MESSAGES: usize = 50;

/// Violations before a peer is banned.
pub const BAN_THRESHOLD: u32 = 3;

/// Maximum chat text length after sanitation.
pub const MAX_CHAT_LENGTH: usize = 5000;

/// Peers with tracked rate-limit windows.
const MAX_TRACKED_WINDOWS: usize = 1024;

/// Storage key for the persisted ban list.
const BAN_LIST_STORAGE_KEY: &str = "weft/banned";

// ============================================================================
// Errors
// ============================================================================

/// Security rejection. The message is dropped; the session survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityError {
    RateLimitExceeded,
    InvalidMessageStructure(&'static str),
    Banned,
}

impl std::fmt::Display for SecurityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecurityError::RateLimitExceeded => write!(f, "rate limit exceeded"),
            SecurityError::InvalidMessageStructure(reason) => {
                write!(f, "invalid message structure: {}", reason)
            }
            SecurityError::Banned => write!(f, "peer is banned"),
        }
    }
}

impl std::error::Error for SecurityError {}

// ============================================================================
// Manager
// ============================================================================

/// Per-mesh security state; injected, not global.
pub struct SecurityManager {
    storage: Arc<dyn KvStorage>,
    windows: Mutex<LruCache<PeerId, VecDeque<u64>>>,
    violations: Mutex<HashMap<PeerId, u32>>,
    banned: Mutex<HashSet<PeerId>>,
}

impl SecurityManager {
    /// Load with the persisted ban list.
    pub async fn load(storage: Arc<dyn KvStorage>) -> anyhow::Result<Self> {
        let banned: HashSet<PeerId> = match storage.get(BAN_LIST_STORAGE_KEY).await? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => HashSet::new(),
        };
        Ok(Self {
            storage,
            windows: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_TRACKED_WINDOWS).unwrap_or(NonZeroUsize::MIN),
            )),
            violations: Mutex::new(HashMap::new()),
            banned: Mutex::new(banned),
        })
    }

    /// Sliding-window rate check. Exceeding the limit records a violation
    /// and rejects the message.
    pub async fn check_rate_limit(&self, peer_id: PeerId) -> Result<(), SecurityError> {
        self.check_rate_limit_at(peer_id, now_ms()).await
    }

    async fn check_rate_limit_at(&self, peer_id: PeerId, now: u64) -> Result<(), SecurityError> {
        let exceeded = {
            let mut windows = self.windows.lock().await;
            let window = windows.get_or_insert_mut(peer_id, VecDeque::new);
            while window
                .front()
                .is_some_and(|&t| t + RATE_LIMIT_WINDOW_MS <= now)
            {
                window.pop_front();
            }
            if window.len() >= RATE_LIMIT_MAX_MESSAGES {
                true
            } else {
                window.push_back(now);
                false
            }
        };
        if exceeded {
            self.record_violation(peer_id, "rate limit exceeded").await;
            return Err(SecurityError::RateLimitExceeded);
        }
        Ok(())
    }

    /// Structural bounds check. Pure; the router records the violation.
    pub fn validate_message_structure(&self, msg: &RoutingMessage) -> Result<(), SecurityError> {
        let size = messages::serialize(msg)
            .map(|b| b.len())
            .map_err(|_| SecurityError::InvalidMessageStructure("unserializable"))?;
        if size > MAX_MESSAGE_SIZE {
            return Err(SecurityError::InvalidMessageStructure("oversized payload"));
        }
        if msg.path.len() > MAX_PATH_LENGTH {
            return Err(SecurityError::InvalidMessageStructure("path too long"));
        }
        if msg.ttl < 0 || msg.ttl > MAX_TTL {
            return Err(SecurityError::InvalidMessageStructure("ttl out of range"));
        }
        if msg.hop_count > MAX_HOP_COUNT {
            return Err(SecurityError::InvalidMessageStructure("hop count out of range"));
        }
        Ok(())
    }

    /// Count a violation; at the threshold the peer joins the persisted ban
    /// list. Returns true when this call caused the ban.
    pub async fn record_violation(&self, peer_id: PeerId, reason: &str) -> bool {
        let count = {
            let mut violations = self.violations.lock().await;
            let count = violations.entry(peer_id).or_insert(0);
            *count += 1;
            *count
        };
        warn!(peer_id = %peer_id, reason, count, "security violation");
        if count >= BAN_THRESHOLD {
            let newly = self.banned.lock().await.insert(peer_id);
            if newly {
                warn!(peer_id = %peer_id, "peer banned");
                if let Err(e) = self.persist_ban_list().await {
                    warn!(error = %e, "failed to persist ban list");
                }
            }
            return newly;
        }
        false
    }

    pub async fn is_banned(&self, peer_id: &PeerId) -> bool {
        self.banned.lock().await.contains(peer_id)
    }

    pub async fn violation_count(&self, peer_id: &PeerId) -> u32 {
        self.violations.lock().await.get(peer_id).copied().unwrap_or(0)
    }

    async fn persist_ban_list(&self) -> anyhow::Result<()> {
        let snapshot = self.banned.lock().await.clone();
        self.storage
            .set(BAN_LIST_STORAGE_KEY, serde_json::to_string(&snapshot)?)
            .await
    }
}

/// HTML-escape and truncate chat text before it is ever broadcast.
pub fn sanitize_message(text: &str) -> String {
    let truncated: String = text.chars().take(MAX_CHAT_LENGTH).collect();
    if truncated.len() < text.len() {
        debug!(original_chars = text.chars().count(), "chat text truncated");
    }
    let mut out = String::with_capacity(truncated.len());
    for c in truncated.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}
