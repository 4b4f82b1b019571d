//! Phi-accrual failure detection, per §4.2.
//!
//! Rather than a binary up/down view of a peer, each heartbeat arrival updates a sliding window
//! of inter-arrival times and produces a continuous suspicion level `phi`; a peer is considered
//! available while `phi` stays under a threshold. The math is a direct port of the standard
//! phi-accrual formulation (Hayashibara et al.), including the normal-CDF approximation used in
//! place of the error function.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::time::Instant;

use raft::NodeId;

const DEFAULT_THRESHOLD: f64 = 8.0;
const DEFAULT_WINDOW_SIZE: usize = 100;
const DEFAULT_MIN_STD_DEV: f64 = 0.5;

struct PeerState {
    history: VecDeque<f64>,
    last_heartbeat: Option<Instant>,
}

impl PeerState {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            last_heartbeat: None,
        }
    }
}

/// Tracks heartbeat arrival history for every known peer and derives a phi suspicion value from
/// it. Not thread-safe by itself; callers that share a detector across tasks wrap it in a mutex.
pub struct FailureDetector {
    threshold: f64,
    window_size: usize,
    min_std_dev: f64,
    peers: BTreeMap<NodeId, PeerState>,
    suspected: std::collections::BTreeSet<NodeId>,
}

impl FailureDetector {
    pub fn new(threshold: f64, window_size: usize, min_std_dev: f64) -> Self {
        Self {
            threshold,
            window_size,
            min_std_dev,
            peers: BTreeMap::new(),
            suspected: std::collections::BTreeSet::new(),
        }
    }

    /// Record a heartbeat received from `peer` at `now`. Clears any existing suspicion.
    pub fn heartbeat_at(&mut self, peer: NodeId, now: Instant) {
        let state = self.peers.entry(peer).or_insert_with(PeerState::new);
        if let Some(prev) = state.last_heartbeat {
            let interval = now.saturating_duration_since(prev).as_secs_f64();
            if state.history.len() >= self.window_size {
                state.history.pop_front();
            }
            state.history.push_back(interval);
        }
        state.last_heartbeat = Some(now);

        if self.suspected.remove(&peer) {
            tracing::info!(peer, "peer recovered");
        }
    }

    pub fn heartbeat(&mut self, peer: NodeId) {
        self.heartbeat_at(peer, Instant::now())
    }

    /// The current suspicion level for `peer`. `f64::INFINITY` if no heartbeat has ever been
    /// observed; `0.0` until at least two samples have accumulated.
    pub fn phi(&self, peer: NodeId) -> f64 {
        self.phi_at(peer, Instant::now())
    }

    fn phi_at(&self, peer: NodeId, now: Instant) -> f64 {
        let state = match self.peers.get(&peer) {
            Some(s) => s,
            None => return f64::INFINITY,
        };
        let last = match state.last_heartbeat {
            Some(t) => t,
            None => return f64::INFINITY,
        };
        if state.history.len() < 2 {
            return 0.0;
        }

        let mean = state.history.iter().sum::<f64>() / state.history.len() as f64;
        let variance = state.history.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / state.history.len() as f64;
        let std_dev = variance.sqrt().max(self.min_std_dev);

        let elapsed = now.saturating_duration_since(last).as_secs_f64();
        let p = normal_cdf(elapsed, mean, std_dev);
        if p <= 0.0 {
            return f64::INFINITY;
        }
        -(1.0 - p).log10()
    }

    /// Whether `peer` is currently believed available, updating the suspected set and emitting
    /// a one-shot event on first detection of unavailability.
    pub fn is_available(&mut self, peer: NodeId) -> bool {
        let phi = self.phi(peer);
        let available = phi < self.threshold;
        if !available && self.suspected.insert(peer) {
            tracing::warn!(peer, phi, "peer suspected unavailable");
        }
        available
    }

    pub fn available_peers(&mut self) -> Vec<NodeId> {
        let peers: Vec<NodeId> = self.peers.keys().copied().collect();
        peers.into_iter().filter(|&p| self.is_available(p)).collect()
    }

    pub fn suspected_peers(&self) -> Vec<NodeId> {
        self.suspected.iter().copied().collect()
    }

    pub fn reset(&mut self) {
        self.peers.clear();
        self.suspected.clear();
    }
}

impl Default for FailureDetector {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD, DEFAULT_WINDOW_SIZE, DEFAULT_MIN_STD_DEV)
    }
}

/// Abramowitz & Stegun 26.2.17: a polynomial approximation to the standard normal CDF, applied
/// to `x` after standardizing by `mean`/`std_dev`. Accurate to about 7.5e-8.
fn normal_cdf(x: f64, mean: f64, std_dev: f64) -> f64 {
    let z = (x - mean) / std_dev;
    let t = 1.0 / (1.0 + 0.2316419 * z.abs());
    let d = 0.3989423 * (-z * z / 2.0).exp();
    let p = d * t * (0.3193815 + t * (-0.3565638 + t * (1.781478 + t * (-1.821256 + t * 1.330274))));
    if z > 0.0 {
        1.0 - p
    } else {
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn unknown_peer_is_infinitely_suspicious() {
        let fd = FailureDetector::default();
        assert_eq!(fd.phi(1), f64::INFINITY);
    }

    #[test]
    fn single_heartbeat_is_not_yet_suspicious() {
        let mut fd = FailureDetector::default();
        fd.heartbeat(1);
        assert_eq!(fd.phi(1), 0.0);
    }

    #[test]
    fn regular_heartbeats_keep_phi_low() {
        let mut fd = FailureDetector::default();
        let start = Instant::now();
        for i in 0..20 {
            fd.heartbeat_at(1, start + Duration::from_millis(i * 100));
        }
        let phi = fd.phi_at(1, start + Duration::from_millis(19 * 100 + 110));
        assert!(phi < 8.0, "phi was {}", phi);
    }

    #[test]
    fn a_long_silence_raises_phi_past_threshold() {
        let mut fd = FailureDetector::default();
        let start = Instant::now();
        for i in 0..20 {
            fd.heartbeat_at(1, start + Duration::from_millis(i * 100));
        }
        let phi = fd.phi_at(1, start + Duration::from_secs(30));
        assert!(phi > 8.0, "phi was {}", phi);
        assert!(!fd.is_available(1));
    }

    #[test]
    fn recovering_clears_suspicion() {
        let mut fd = FailureDetector::default();
        let start = Instant::now();
        for i in 0..20 {
            fd.heartbeat_at(1, start + Duration::from_millis(i * 100));
        }
        fd.phi_at(1, start + Duration::from_secs(30));
        assert!(!fd.is_available(1));
        fd.heartbeat_at(1, start + Duration::from_secs(31));
        assert!(fd.suspected_peers().is_empty());
    }
}
