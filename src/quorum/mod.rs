//! Quorum Selection Module
//!
//! Picks the latency bound for reaching a quorum from one peer's point of view.

use serde::{Deserialize, Serialize};

/// Requested quorum size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumSpec {
    /// Number of peers, including the local one, that must acknowledge
    pub size: usize,
}

impl QuorumSpec {
    /// Create a quorum of the given size
    pub fn new(size: usize) -> Self {
        Self { size }
    }

    /// Majority quorum for a topology of `peers` peers
    pub fn majority(peers: usize) -> Self {
        Self::new(peers / 2 + 1)
    }

    /// Quorum of the requested size, clamped to the topology.
    ///
    /// A request larger than the topology cannot be satisfied and falls back
    /// to the minimum valid quorum of one peer.
    pub fn clamped(requested: usize, peers: usize) -> Self {
        if requested > peers {
            tracing::warn!(
                "Requested quorum of {} exceeds {} peers, clamping to 1",
                requested,
                peers
            );
            return Self::new(1);
        }
        Self::new(requested.max(1))
    }

    /// Number of remote peers that must answer
    pub fn remote_acks(&self) -> usize {
        self.size.saturating_sub(1).max(1)
    }
}

/// Quorum latency selection over ascending per-peer latencies.
///
/// The local peer counts toward its own quorum, so only `size - 1` remote
/// peers are needed. The slowest of the nearest remote peers is the bottleneck.
pub struct QuorumSelector;

impl QuorumSelector {
    /// Latency bound to reach `quorum` from a peer whose remote latencies
    /// are `sorted` (ascending).
    ///
    /// A quorum of one still selects the single nearest peer; no peers yield 0.
    pub fn select(sorted: &[u64], quorum: QuorumSpec) -> u64 {
        Self::nearest(sorted, quorum.remote_acks())
    }

    /// Largest latency among the `count` nearest peers.
    ///
    /// Never reads past the available peers.
    pub fn nearest(sorted: &[u64], count: usize) -> u64 {
        debug_assert!(sorted.windows(2).all(|w| w[0] <= w[1]), "latencies must be sorted");
        let take = count.max(1).min(sorted.len());
        if take == 0 {
            return 0;
        }
        sorted[take - 1]
    }

    /// Round trip to reach `quorum`
    pub fn round_trip(sorted: &[u64], quorum: QuorumSpec) -> u64 {
        2 * Self::select(sorted, quorum)
    }
}
