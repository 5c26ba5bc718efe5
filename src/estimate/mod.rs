//! Protocol Latency Estimation
//!
//! Closed-form latency bounds for majority-quorum voting, leader consensus
//! and the optimistic fast/slow path protocol, computed per peer from the
//! geographic latency model.

mod fast_slow;

pub use fast_slow::FastSlowQuorums;

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::config::{validate_weight, EstimatorConfig};
use crate::error::{Error, Result};
use crate::geo::{GeoLatencyModel, GeoPoint};
use crate::quorum::{QuorumSelector, QuorumSpec};

/// Replication protocol family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Majority-quorum reads and writes
    QuorumMajority,
    /// Multi-phase leader consensus
    LeaderConsensus,
    /// Optimistic fast path with a slow-path fallback
    FastSlowPath,
}

impl Protocol {
    /// All protocol families
    pub const ALL: [Protocol; 3] = [
        Protocol::QuorumMajority,
        Protocol::LeaderConsensus,
        Protocol::FastSlowPath,
    ];
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::QuorumMajority => write!(f, "quorum"),
            Protocol::LeaderConsensus => write!(f, "paxos"),
            Protocol::FastSlowPath => write!(f, "accord"),
        }
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "quorum" | "majority" => Ok(Protocol::QuorumMajority),
            "paxos" | "leader" => Ok(Protocol::LeaderConsensus),
            "accord" | "fast-slow" | "fast_slow" => Ok(Protocol::FastSlowPath),
            other => Err(Error::Config(format!(
                "unknown protocol '{}' (expected quorum, paxos or accord)",
                other
            ))),
        }
    }
}

/// Per-call estimation options
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimateOptions {
    /// Replace the majority quorum (quorum and leader families only)
    pub quorum_override: Option<usize>,
    /// Weight of the best case in the reported mean, in (0, 1]
    pub best_case_weight: f64,
}

impl Default for EstimateOptions {
    fn default() -> Self {
        Self {
            quorum_override: None,
            best_case_weight: 1.0,
        }
    }
}

/// Estimated latencies of one protocol over one topology.
///
/// `None` entries mark peers without coordinates; aggregates skip them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyEstimate {
    /// Protocol family
    pub protocol: Protocol,
    /// Topology size
    pub peers: usize,
    /// Cheapest operation per peer (read / fast path), in ms
    pub per_peer_best_ms: Vec<Option<f64>>,
    /// Most expensive operation per peer (write / slow path), in ms
    pub per_peer_worst_ms: Vec<Option<f64>>,
    /// Mean of the blended per-peer value
    pub mean_ms: Option<f64>,
    /// Mean best case
    pub mean_best_ms: Option<f64>,
    /// Mean worst case
    pub mean_worst_ms: Option<f64>,
}

impl LatencyEstimate {
    /// Blended value of one peer: `w * best + (1 - w) * worst`
    pub fn blended(&self, slot: usize, weight: f64) -> Option<f64> {
        let best = (*self.per_peer_best_ms.get(slot)?)?;
        let worst = (*self.per_peer_worst_ms.get(slot)?)?;
        Some(weight * best + (1.0 - weight) * worst)
    }
}

/// Mean of the present values
fn mean(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    let (sum, count) = values
        .flatten()
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Estimator for the three protocol families
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolLatencyEstimator {
    model: GeoLatencyModel,
    config: EstimatorConfig,
}

impl ProtocolLatencyEstimator {
    /// Create a new estimator
    pub fn new(model: GeoLatencyModel, config: EstimatorConfig) -> Self {
        Self { model, config }
    }

    /// Get the latency model
    pub fn model(&self) -> &GeoLatencyModel {
        &self.model
    }

    /// Estimate `protocol` over a topology of the first `topology` points.
    ///
    /// Slots beyond the available points are reported as `None`.
    pub fn estimate(
        &self,
        protocol: Protocol,
        points: &[GeoPoint],
        topology: usize,
        options: EstimateOptions,
    ) -> Result<LatencyEstimate> {
        validate_weight(options.best_case_weight)?;

        let known = &points[..topology.min(points.len())];
        if known.len() < topology {
            tracing::debug!(
                "Topology of {} peers has coordinates for only {}",
                topology,
                known.len()
            );
        }

        let per_peer: Vec<Option<(f64, f64)>> = (0..topology)
            .map(|slot| {
                (slot < known.len()).then(|| {
                    let sorted = self.model.sorted_latencies(known, slot);
                    self.peer_bounds(protocol, &sorted, topology, options.quorum_override)
                })
            })
            .collect();

        let per_peer_best_ms: Vec<Option<f64>> = per_peer.iter().map(|b| b.map(|(best, _)| best)).collect();
        let per_peer_worst_ms: Vec<Option<f64>> = per_peer.iter().map(|b| b.map(|(_, worst)| worst)).collect();
        let weight = options.best_case_weight;

        let estimate = LatencyEstimate {
            protocol,
            peers: topology,
            mean_ms: mean(per_peer.iter().map(|b| b.map(|(best, worst)| weight * best + (1.0 - weight) * worst))),
            mean_best_ms: mean(per_peer_best_ms.iter().copied()),
            mean_worst_ms: mean(per_peer_worst_ms.iter().copied()),
            per_peer_best_ms,
            per_peer_worst_ms,
        };

        tracing::debug!(
            protocol = %protocol,
            peers = topology,
            mean_ms = ?estimate.mean_ms,
            "Estimated protocol latency"
        );

        Ok(estimate)
    }

    /// Estimate every protocol family over the same topology
    pub fn estimate_all(
        &self,
        points: &[GeoPoint],
        topology: usize,
        options: EstimateOptions,
    ) -> Result<Vec<LatencyEstimate>> {
        Protocol::ALL
            .iter()
            .map(|protocol| self.estimate(*protocol, points, topology, options))
            .collect()
    }

    /// Best and worst case of one peer, given its sorted one-way latencies
    fn peer_bounds(
        &self,
        protocol: Protocol,
        sorted: &[u64],
        topology: usize,
        quorum_override: Option<usize>,
    ) -> (f64, f64) {
        match protocol {
            Protocol::QuorumMajority => {
                let rtt = self.majority_round_trip(sorted, topology, quorum_override);
                (rtt, rtt * self.config.quorum_write_rounds)
            }
            Protocol::LeaderConsensus => {
                let rtt = self.majority_round_trip(sorted, topology, quorum_override);
                (rtt, rtt * self.config.leader_write_multiplier)
            }
            Protocol::FastSlowPath => {
                if quorum_override.is_some() {
                    tracing::debug!("Quorum override ignored for derived fast/slow path quorums");
                }
                let quorums = FastSlowQuorums::for_topology(topology);
                let execute = 2 * QuorumSelector::nearest(sorted, self.config.execute_peers);
                let fast = QuorumSelector::round_trip(sorted, quorums.fast);
                let slow = QuorumSelector::round_trip(sorted, quorums.slow);

                let best = (fast + execute) as f64;
                let worst = self.config.slow_path_rounds * slow as f64 + execute as f64;
                (best, worst)
            }
        }
    }

    fn majority_round_trip(&self, sorted: &[u64], topology: usize, quorum_override: Option<usize>) -> f64 {
        let quorum = match quorum_override {
            Some(requested) => QuorumSpec::clamped(requested, topology),
            None => QuorumSpec::majority(topology),
        };
        QuorumSelector::round_trip(sorted, quorum) as f64
    }
}
