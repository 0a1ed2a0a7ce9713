//! # Connection Quality Manager
//!
//! Scores live connections into [0,100] and decides admission and eviction
//! under capacity limits.
//!
//! | Component | Max | Tiers |
//! |-----------|-----|-------|
//! | latency   | 40  | 100 / 200 / 500 / 1000 ms |
//! | path      | 30  | direct > reflexive > relay |
//! | stability | 30  | 60 / 300 / 600 s uptime |
//!
//! Unknown latency and unclassified paths earn partial credit so brand-new
//! connections are not starved out of admission.

use tracing::{debug, warn};

use crate::identity::PeerId;
use crate::transport::PathType;

// ============================================================================
// Capacity Configuration
// ============================================================================

#[derive(Clone, Copy, Debug)]
pub struct QualityConfig {
    /// Below this count every candidate is admitted.
    pub target_connections: usize,
    /// Hard cap on simultaneous connections.
    pub max_connections: usize,
    /// Minimum score for admission between target and max.
    pub min_quality_threshold: u8,
    /// At max capacity a candidate must beat the worst connection by this
    /// margin to replace it.
    pub replacement_margin: u8,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            target_connections: 5,
            max_connections: 8,
            min_quality_threshold: 40,
            replacement_margin: 20,
        }
    }
}

// ============================================================================
// Scoring
// ============================================================================

/// Observed inputs for one connection's score.
#[derive(Clone, Copy, Debug, Default)]
pub struct QualityInputs {
    /// Last measured round-trip latency; `None` until the first probe.
    pub latency_ms: Option<u32>,
    pub path: PathType,
    pub uptime_secs: u64,
}

/// Score a connection into [0,100].
pub fn calculate_quality_score(inputs: &QualityInputs) -> u8 {
    let latency = match inputs.latency_ms {
        None => 20,
        Some(ms) if ms <= 100 => 40,
        Some(ms) if ms <= 200 => 30,
        Some(ms) if ms <= 500 => 20,
        Some(ms) if ms <= 1000 => 10,
        Some(_) => 0,
    };
    let path = match inputs.path {
        PathType::Direct => 30,
        PathType::Reflexive => 20,
        PathType::Relay => 10,
        PathType::Unknown => 15,
    };
    let stability = match inputs.uptime_secs {
        s if s >= 600 => 30,
        s if s >= 300 => 20,
        s if s >= 60 => 10,
        _ => 0,
    };
    latency + path + stability
}

// ============================================================================
// Admission and Rebalancing
// ============================================================================

/// Outcome of an admission check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdmissionDecision {
    Accept,
    /// Accept, evicting the named connection first.
    AcceptReplacing(PeerId),
    Reject,
}

/// What a periodic rebalance pass found.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RebalanceReport {
    /// Worst connection to prune, only set when over max capacity.
    pub evict: Option<PeerId>,
    /// Connections scoring below threshold while between target and max.
    /// Reported only; not acted upon.
    pub low_quality: Vec<PeerId>,
}

/// Stateless policy over scored connections; the router owns the actual
/// connection set and passes snapshots in.
pub struct QualityManager {
    config: QualityConfig,
}

impl QualityManager {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    /// Admission policy:
    /// - below target: accept unconditionally
    /// - between target and max: accept when the score clears the threshold
    /// - at max: accept only as a replacement beating the worst connection
    ///   by the configured margin
    pub fn should_accept(
        &self,
        candidate_score: u8,
        current: &[(PeerId, u8)],
    ) -> AdmissionDecision {
        if current.len() < self.config.target_connections {
            return AdmissionDecision::Accept;
        }
        if current.len() < self.config.max_connections {
            if candidate_score >= self.config.min_quality_threshold {
                return AdmissionDecision::Accept;
            }
            debug!(candidate_score, "candidate below quality threshold");
            return AdmissionDecision::Reject;
        }

        let Some(&(worst_peer, worst_score)) = current.iter().min_by_key(|(_, s)| *s) else {
            return AdmissionDecision::Accept;
        };
        if candidate_score > worst_score.saturating_add(self.config.replacement_margin) {
            return AdmissionDecision::AcceptReplacing(worst_peer);
        }
        AdmissionDecision::Reject
    }

    /// Periodic rebalance: prune the worst connection when over max; report
    /// (without acting on) low-quality connections between target and max.
    pub fn rebalance(&self, current: &[(PeerId, u8)]) -> RebalanceReport {
        let mut report = RebalanceReport::default();

        if current.len() > self.config.max_connections {
            report.evict = current.iter().min_by_key(|(_, s)| *s).map(|&(p, _)| p);
        }

        if current.len() > self.config.target_connections
            && current.len() <= self.config.max_connections
        {
            for &(peer, score) in current {
                if score < self.config.min_quality_threshold {
                    warn!(peer_id = %peer, score, "low-quality connection (report only)");
                    report.low_quality.push(peer);
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(seed: u8) -> PeerId {
        PeerId::from_bytes([seed; 16])
    }

    #[test]
    fn score_always_within_bounds() {
        let latencies = [None, Some(0), Some(100), Some(101), Some(200), Some(500), Some(1000), Some(5000)];
        let paths = [PathType::Direct, PathType::Reflexive, PathType::Relay, PathType::Unknown];
        let uptimes = [0u64, 59, 60, 299, 300, 599, 600, 100_000];

        for &latency_ms in &latencies {
            for &path in &paths {
                for &uptime_secs in &uptimes {
                    let score = calculate_quality_score(&QualityInputs { latency_ms, path, uptime_secs });
                    assert!(score <= 100, "score {} out of range", score);
                }
            }
        }
    }

    #[test]
    fn best_case_scores_full_marks() {
        let score = calculate_quality_score(&QualityInputs {
            latency_ms: Some(50),
            path: PathType::Direct,
            uptime_secs: 700,
        });
        assert_eq!(score, 100);
    }

    #[test]
    fn unknown_latency_gets_partial_credit() {
        let unknown = calculate_quality_score(&QualityInputs {
            latency_ms: None,
            path: PathType::Relay,
            uptime_secs: 0,
        });
        let terrible = calculate_quality_score(&QualityInputs {
            latency_ms: Some(3000),
            path: PathType::Relay,
            uptime_secs: 0,
        });
        assert!(unknown > terrible);
    }

    #[test]
    fn below_target_always_accepts() {
        let mgr = QualityManager::new(QualityConfig::default());
        let current = vec![(peer(1), 90), (peer(2), 90)];
        assert_eq!(mgr.should_accept(0, &current), AdmissionDecision::Accept);
    }

    #[test]
    fn between_target_and_max_requires_threshold() {
        let mgr = QualityManager::new(QualityConfig::default());
        let current: Vec<_> = (1..=5).map(|i| (peer(i), 80)).collect();

        assert_eq!(mgr.should_accept(39, &current), AdmissionDecision::Reject);
        assert_eq!(mgr.should_accept(40, &current), AdmissionDecision::Accept);
    }

    #[test]
    fn at_max_requires_replacement_margin() {
        let mgr = QualityManager::new(QualityConfig::default());
        let mut current: Vec<_> = (1..=7).map(|i| (peer(i), 80)).collect();
        current.push((peer(8), 50)); // worst

        assert_eq!(mgr.should_accept(70, &current), AdmissionDecision::Reject);
        assert_eq!(
            mgr.should_accept(71, &current),
            AdmissionDecision::AcceptReplacing(peer(8))
        );
    }

    #[test]
    fn rebalance_evicts_only_over_max() {
        let mgr = QualityManager::new(QualityConfig::default());

        let over: Vec<_> = (1..=9).map(|i| (peer(i), 100 - i as u8)).collect();
        let report = mgr.rebalance(&over);
        assert_eq!(report.evict, Some(peer(9)), "worst connection pruned when over max");

        let at_max: Vec<_> = (1..=8).map(|i| (peer(i), 80)).collect();
        assert_eq!(mgr.rebalance(&at_max).evict, None);
    }

    #[test]
    fn rebalance_reports_low_quality_without_acting() {
        let mgr = QualityManager::new(QualityConfig::default());
        let mut current: Vec<_> = (1..=6).map(|i| (peer(i), 80)).collect();
        current.push((peer(7), 10));

        let report = mgr.rebalance(&current);
        assert_eq!(report.evict, None);
        assert_eq!(report.low_quality, vec![peer(7)]);
    }
}
