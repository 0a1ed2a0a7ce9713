//! # Peer Persistence
//!
//! Durable record of every peer ever connected, with connection-quality
//! history. The store ranks reconnection candidates and feeds the
//! orchestrator's cold-start layers.
//!
//! Capacity is capped; eviction is hybrid: staleness and poor historical
//! quality both push a record toward eviction, so one very old good peer
//! does not crowd out several recent mediocre ones (or vice versa).

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::identity::{now_ms, PeerId};
use crate::storage::KvStorage;
use crate::transport::PathType;

/// Storage key for the serialized peer map.
const PEERS_STORAGE_KEY: &str = "weft/peers";

/// Record schema version, bumped on incompatible changes.
pub const PEER_DATA_VERSION: u32 = 1;

/// Default cap on stored peer records.
pub const DEFAULT_MAX_STORED_PEERS: usize = 100;

/// A poor success rate weighs like this many seconds of staleness during
/// eviction ranking.
const QUALITY_STALENESS_EQUIVALENT_SECS: f64 = 3600.0;

// ============================================================================
// Records
// ============================================================================

/// Historical connection quality for one peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QualityHistory {
    pub latency_ms: Option<u32>,
    /// successful_connections / total_connections, in [0,1].
    pub success_rate: f64,
    pub connection_type: PathType,
    pub last_measured_ms: u64,
    pub total_connections: u32,
    pub successful_connections: u32,
    pub avg_uptime_secs: f64,
}

impl Default for QualityHistory {
    fn default() -> Self {
        Self {
            latency_ms: None,
            success_rate: 0.0,
            connection_type: PathType::Unknown,
            last_measured_ms: 0,
            total_connections: 0,
            successful_connections: 0,
            avg_uptime_secs: 0.0,
        }
    }
}

/// Durable record of a known peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub display_name: String,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    pub last_connected_ms: Option<u64>,
    /// Hex-encoded pinned public key, mirrored from the trust store for
    /// candidate display without a trust lookup.
    pub public_key: Option<String>,
    /// Last known signaling blob, reused during cold-start layer 1.
    pub cached_signal: Option<serde_json::Value>,
    pub quality: QualityHistory,
    pub reconnection_attempts: u32,
    pub data_version: u32,
}

impl PeerRecord {
    pub fn new(peer_id: PeerId, display_name: String) -> Self {
        let now = now_ms();
        Self {
            peer_id,
            display_name,
            first_seen_ms: now,
            last_seen_ms: now,
            last_connected_ms: None,
            public_key: None,
            cached_signal: None,
            quality: QualityHistory::default(),
            reconnection_attempts: 0,
            data_version: PEER_DATA_VERSION,
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// Durable peer store backed by the storage collaborator.
pub struct PeerStore {
    storage: Arc<dyn KvStorage>,
    records: Mutex<HashMap<PeerId, PeerRecord>>,
    max_peers: usize,
}

impl PeerStore {
    pub async fn load(storage: Arc<dyn KvStorage>, max_peers: usize) -> anyhow::Result<Self> {
        let records: HashMap<PeerId, PeerRecord> = match storage.get(PEERS_STORAGE_KEY).await? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => HashMap::new(),
        };
        Ok(Self {
            storage,
            records: Mutex::new(records),
            max_peers,
        })
    }

    /// Upsert a record, evicting under the hybrid policy if over the cap.
    pub async fn store_peer(&self, record: PeerRecord) -> anyhow::Result<()> {
        let snapshot = {
            let mut records = self.records.lock().await;
            records.insert(record.peer_id, record);
            while records.len() > self.max_peers {
                if let Some(victim) = Self::eviction_victim(&records) {
                    debug!(peer_id = %victim, "evicting stale peer record");
                    records.remove(&victim);
                } else {
                    break;
                }
            }
            records.clone()
        };
        self.persist(&snapshot).await
    }

    /// Hybrid eviction rank: seconds of staleness plus a penalty that maps
    /// a 0% success rate to an extra hour of apparent staleness.
    fn eviction_victim(records: &HashMap<PeerId, PeerRecord>) -> Option<PeerId> {
        let now = now_ms();
        records
            .values()
            .map(|r| {
                let staleness_secs = now.saturating_sub(r.last_seen_ms) as f64 / 1000.0;
                let quality_penalty =
                    (1.0 - r.quality.success_rate) * QUALITY_STALENESS_EQUIVALENT_SECS;
                (r.peer_id, staleness_secs + quality_penalty)
            })
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id)
    }

    pub async fn get(&self, peer_id: &PeerId) -> Option<PeerRecord> {
        self.records.lock().await.get(peer_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    pub async fn update_last_seen(&self, peer_id: &PeerId) -> anyhow::Result<()> {
        self.mutate(peer_id, |r| r.last_seen_ms = now_ms()).await
    }

    pub async fn increment_reconnection_attempts(&self, peer_id: &PeerId) -> anyhow::Result<()> {
        self.mutate(peer_id, |r| r.reconnection_attempts += 1).await
    }

    pub async fn update_cached_signal(
        &self,
        peer_id: &PeerId,
        signal: serde_json::Value,
    ) -> anyhow::Result<()> {
        self.mutate(peer_id, |r| r.cached_signal = Some(signal)).await
    }

    /// Record a completed connection attempt and fold the outcome into the
    /// quality history.
    pub async fn record_connection_outcome(
        &self,
        peer_id: &PeerId,
        success: bool,
        uptime_secs: f64,
        latency_ms: Option<u32>,
        path: PathType,
    ) -> anyhow::Result<()> {
        self.mutate(peer_id, |r| {
            let q = &mut r.quality;
            q.total_connections += 1;
            if success {
                q.successful_connections += 1;
                r.last_connected_ms = Some(now_ms());
                // Running average over successful connections.
                let n = q.successful_connections as f64;
                q.avg_uptime_secs = q.avg_uptime_secs + (uptime_secs - q.avg_uptime_secs) / n;
            }
            q.success_rate = q.successful_connections as f64 / q.total_connections as f64;
            if latency_ms.is_some() {
                q.latency_ms = latency_ms;
            }
            q.connection_type = path;
            q.last_measured_ms = now_ms();
            r.last_seen_ms = now_ms();
        })
        .await
    }

    /// True when storage pressure warrants a cleanup pass.
    pub async fn needs_cleanup(&self) -> bool {
        let len = self.records.lock().await.len();
        len * 10 >= self.max_peers * 9
    }

    /// Reconnection candidates within `max_age_ms`, best first.
    ///
    /// Composite score: recency of last_seen (weight 0.5), historical
    /// success rate (0.3), average uptime capped at 10 minutes (0.2).
    pub async fn reconnection_candidates(
        &self,
        limit: usize,
        max_age_ms: u64,
    ) -> Vec<PeerRecord> {
        let now = now_ms();
        let records = self.records.lock().await;
        let mut scored: Vec<(f64, PeerRecord)> = records
            .values()
            .filter(|r| now.saturating_sub(r.last_seen_ms) <= max_age_ms)
            .map(|r| {
                let age = now.saturating_sub(r.last_seen_ms) as f64;
                let recency = 1.0 - (age / max_age_ms.max(1) as f64);
                let uptime = (r.quality.avg_uptime_secs / 600.0).min(1.0);
                let score = 0.5 * recency + 0.3 * r.quality.success_rate + 0.2 * uptime;
                (score, r.clone())
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.into_iter().take(limit).map(|(_, r)| r).collect()
    }

    async fn mutate(
        &self,
        peer_id: &PeerId,
        f: impl FnOnce(&mut PeerRecord),
    ) -> anyhow::Result<()> {
        let snapshot = {
            let mut records = self.records.lock().await;
            match records.get_mut(peer_id) {
                Some(record) => f(record),
                None => return Ok(()), // unknown peer, nothing to update
            }
            records.clone()
        };
        self.persist(&snapshot).await
    }

    async fn persist(&self, snapshot: &HashMap<PeerId, PeerRecord>) -> anyhow::Result<()> {
        self.storage
            .set(PEERS_STORAGE_KEY, serde_json::to_string(snapshot)?)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn peer(seed: u8) -> PeerId {
        PeerId::from_bytes([seed; 16])
    }

    async fn store(max: usize) -> PeerStore {
        PeerStore::load(Arc::new(MemoryStorage::new()), max).await.unwrap()
    }

    #[tokio::test]
    async fn upsert_and_reload() {
        let storage = Arc::new(MemoryStorage::new());
        {
            let store = PeerStore::load(storage.clone(), 10).await.unwrap();
            store.store_peer(PeerRecord::new(peer(1), "alice".into())).await.unwrap();
            store.increment_reconnection_attempts(&peer(1)).await.unwrap();
        }
        let reloaded = PeerStore::load(storage, 10).await.unwrap();
        let record = reloaded.get(&peer(1)).await.expect("record must survive reload");
        assert_eq!(record.display_name, "alice");
        assert_eq!(record.reconnection_attempts, 1);
    }

    #[tokio::test]
    async fn cap_evicts_stale_low_quality_first() {
        let store = store(3).await;

        for seed in 1..=3u8 {
            let mut record = PeerRecord::new(peer(seed), format!("peer-{}", seed));
            record.quality.success_rate = 0.9;
            // Distinct ages so the ranking has no ties.
            record.last_seen_ms = now_ms() - 1000 * seed as u64;
            store.store_peer(record).await.unwrap();
        }
        // A record with terrible history is the hybrid victim even though it
        // is fresher than every good record.
        let mut bad = PeerRecord::new(peer(4), "flaky".into());
        bad.quality.success_rate = 0.0;
        store.store_peer(bad).await.unwrap();

        let mut good = PeerRecord::new(peer(5), "solid".into());
        good.quality.success_rate = 0.9;
        store.store_peer(good).await.unwrap();

        assert_eq!(store.len().await, 3);
        assert!(store.get(&peer(4)).await.is_none(), "flaky peer evicted");
        assert!(store.get(&peer(5)).await.is_some());
        assert!(store.get(&peer(3)).await.is_none(), "oldest good record evicted next");
    }

    #[tokio::test]
    async fn outcome_updates_quality_history() {
        let store = store(10).await;
        store.store_peer(PeerRecord::new(peer(1), "alice".into())).await.unwrap();

        store
            .record_connection_outcome(&peer(1), true, 120.0, Some(80), PathType::Direct)
            .await
            .unwrap();
        store
            .record_connection_outcome(&peer(1), false, 0.0, None, PathType::Direct)
            .await
            .unwrap();

        let record = store.get(&peer(1)).await.unwrap();
        assert_eq!(record.quality.total_connections, 2);
        assert_eq!(record.quality.successful_connections, 1);
        assert!((record.quality.success_rate - 0.5).abs() < f64::EPSILON);
        assert!((record.quality.avg_uptime_secs - 120.0).abs() < f64::EPSILON);
        assert_eq!(record.quality.latency_ms, Some(80), "failed probe must not clear latency");
    }

    #[tokio::test]
    async fn candidates_ranked_by_composite_score() {
        let store = store(10).await;

        let mut strong = PeerRecord::new(peer(1), "strong".into());
        strong.quality.success_rate = 1.0;
        strong.quality.avg_uptime_secs = 600.0;
        store.store_peer(strong).await.unwrap();

        let mut weak = PeerRecord::new(peer(2), "weak".into());
        weak.quality.success_rate = 0.1;
        store.store_peer(weak).await.unwrap();

        let mut ancient = PeerRecord::new(peer(3), "ancient".into());
        ancient.last_seen_ms = now_ms().saturating_sub(7 * 24 * 3600 * 1000);
        store.store_peer(ancient).await.unwrap();

        let candidates = store.reconnection_candidates(10, 24 * 3600 * 1000).await;
        let ids: Vec<PeerId> = candidates.iter().map(|r| r.peer_id).collect();
        assert_eq!(ids, vec![peer(1), peer(2)], "ranked by score, aged-out excluded");
    }

    #[tokio::test]
    async fn candidate_limit_respected() {
        let store = store(20).await;
        for seed in 1..=8u8 {
            store.store_peer(PeerRecord::new(peer(seed), "p".into())).await.unwrap();
        }
        assert_eq!(store.reconnection_candidates(3, u64::MAX).await.len(), 3);
    }

    #[tokio::test]
    async fn needs_cleanup_near_cap() {
        let store = store(10).await;
        assert!(!store.needs_cleanup().await);
        for seed in 1..=9u8 {
            store.store_peer(PeerRecord::new(peer(seed), "p".into())).await.unwrap();
        }
        assert!(store.needs_cleanup().await);
    }
}
