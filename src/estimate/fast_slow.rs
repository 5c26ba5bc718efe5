//! Fast/Slow Path Quorums
//!
//! Quorum sizes of the optimistic protocol for a given topology size.

use serde::{Deserialize, Serialize};

use crate::quorum::QuorumSpec;

/// Derived quorum sizes for a topology of `peers` peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastSlowQuorums {
    /// Topology size
    pub peers: usize,
    /// Tolerated failures, `(n - 1) / 2`
    pub failures: usize,
    /// Electorate reduction allowed on the fast path
    pub fast_reduction: usize,
    /// Fast-path quorum, `n - e`
    pub fast: QuorumSpec,
    /// Slow-path quorum, `n - f`
    pub slow: QuorumSpec,
}

impl FastSlowQuorums {
    /// Compute the quorums for a topology of `peers` peers
    pub fn for_topology(peers: usize) -> Self {
        let failures = peers.saturating_sub(1) / 2;
        let fast_reduction = largest_reduction(peers, failures);

        Self {
            peers,
            failures,
            fast_reduction,
            fast: QuorumSpec::new(peers.saturating_sub(fast_reduction).max(1)),
            slow: QuorumSpec::new(peers.saturating_sub(failures).max(1)),
        }
    }
}

/// Largest `e` in `0..=n` with `n >= max(2e + f - 1, 2f + 1)`
fn largest_reduction(n: usize, f: usize) -> usize {
    let n = n as i64;
    let f = f as i64;
    let mut e = 0;
    for candidate in 0..=n {
        if n >= (2 * candidate + f - 1).max(2 * f + 1) {
            e = candidate;
        }
    }
    e as usize
}
