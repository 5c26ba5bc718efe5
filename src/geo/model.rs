//! Geographic Latency Model
//!
//! Converts pairs of coordinates into one-way propagation latency.

use serde::{Deserialize, Serialize};

use super::points::{GeoPoint, PeerSet};
use crate::config::ModelConfig;

/// A directed path between two peers of a [`PeerSet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectedPath {
    /// Sending peer slot
    pub source: usize,
    /// Receiving peer slot
    pub destination: usize,
    /// One-way delay applied to traffic from `source` to `destination`
    pub delay_ms: u64,
}

/// Great-circle distance to latency model.
///
/// Latency is floored per direction before any doubling, so a round trip
/// is always an even number of milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoLatencyModel {
    earth_radius_km: f64,
    fiber_speed_km_per_ms: f64,
}

impl Default for GeoLatencyModel {
    fn default() -> Self {
        Self::new(&ModelConfig::default())
    }
}

impl GeoLatencyModel {
    /// Create a model from validated configuration
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            earth_radius_km: config.earth_radius_km,
            fiber_speed_km_per_ms: config.fiber_speed_km_per_ms,
        }
    }

    /// Haversine distance between two points, in kilometers
    pub fn distance(&self, a: &GeoPoint, b: &GeoPoint) -> f64 {
        let lat1 = a.latitude.to_radians();
        let lat2 = b.latitude.to_radians();
        let dlat = (b.latitude - a.latitude).to_radians();
        let dlon = (b.longitude - a.longitude).to_radians();

        let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
        self.earth_radius_km * c
    }

    /// One-way latency for a distance, in whole milliseconds (floored)
    pub fn latency(&self, distance_km: f64) -> u64 {
        if !distance_km.is_finite() || distance_km <= 0.0 {
            return 0;
        }
        (distance_km / self.fiber_speed_km_per_ms).floor() as u64
    }

    /// One-way latency between two points
    pub fn one_way(&self, a: &GeoPoint, b: &GeoPoint) -> u64 {
        self.latency(self.distance(a, b))
    }

    /// Round-trip time between two points
    pub fn round_trip(&self, a: &GeoPoint, b: &GeoPoint) -> u64 {
        2 * self.one_way(a, b)
    }

    /// One-way latencies from `origin` to every other peer, sorted ascending
    pub fn sorted_latencies(&self, points: &[GeoPoint], origin: usize) -> Vec<u64> {
        let Some(from) = points.get(origin) else {
            return Vec::new();
        };
        let mut latencies: Vec<u64> = points
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != origin)
            .map(|(_, to)| self.one_way(from, to))
            .collect();
        latencies.sort_unstable();
        latencies
    }

    /// Every directed path between distinct peers of the set
    pub fn directed_paths(&self, peers: &PeerSet) -> Vec<DirectedPath> {
        let points = peers.points();
        let mut paths = Vec::with_capacity(points.len() * points.len().saturating_sub(1));
        for (i, a) in points.iter().enumerate() {
            for (j, b) in points.iter().enumerate() {
                if i != j {
                    paths.push(DirectedPath {
                        source: i,
                        destination: j,
                        delay_ms: self.one_way(a, b),
                    });
                }
            }
        }
        paths
    }
}
