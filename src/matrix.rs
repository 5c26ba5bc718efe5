//! Ping Matrix
//!
//! Pairwise round-trip times between every peer of a placement, and the
//! distribution of nearest-neighbour round trips.

use std::fmt;
use serde::{Deserialize, Serialize};

use crate::geo::{GeoLatencyModel, GeoPoint};

/// Column width used when rendering the matrix
const CELL_WIDTH: usize = 12;

/// Round-trip matrix in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyMatrix {
    /// Location labels in slot order
    pub labels: Vec<String>,
    /// `rtt_ms[i][j]` is the modeled ping from `i` to `j`; the diagonal is 0
    pub rtt_ms: Vec<Vec<u64>>,
}

impl LatencyMatrix {
    /// Compute the matrix for a placement
    pub fn compute(points: &[GeoPoint], model: &GeoLatencyModel) -> Self {
        let rtt_ms = points
            .iter()
            .enumerate()
            .map(|(i, a)| {
                points
                    .iter()
                    .enumerate()
                    .map(|(j, b)| if i == j { 0 } else { model.round_trip(a, b) })
                    .collect()
            })
            .collect();

        Self {
            labels: points.iter().map(|p| p.label.clone()).collect(),
            rtt_ms,
        }
    }

    /// Number of peers
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the matrix is empty
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Round trip between two slots
    pub fn get(&self, from: usize, to: usize) -> Option<u64> {
        self.rtt_ms.get(from)?.get(to).copied()
    }
}

impl fmt::Display for LatencyMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:width$}", "", width = CELL_WIDTH)?;
        for label in &self.labels {
            write!(f, "{:>width$}", label, width = CELL_WIDTH)?;
        }
        writeln!(f)?;

        for (label, row) in self.labels.iter().zip(&self.rtt_ms) {
            write!(f, "{:<width$}", label, width = CELL_WIDTH)?;
            for rtt in row {
                write!(f, "{:>width$}", rtt, width = CELL_WIDTH)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Sorted round trips from every peer to its nearest neighbour.
///
/// This is the optimum a protocol reaching the closest single replica
/// could achieve; a lone peer contributes nothing.
pub fn nearest_neighbor_cdf(points: &[GeoPoint], model: &GeoLatencyModel) -> Vec<u64> {
    let mut rtts: Vec<u64> = (0..points.len())
        .filter_map(|i| model.sorted_latencies(points, i).first().map(|l| 2 * l))
        .collect();
    rtts.sort_unstable();
    rtts
}
