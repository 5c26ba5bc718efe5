//! GeoQuorum - Geo-Distributed Replication Latency Modeling and Emulation
//!
//! Models wide-area network latency between replicas placed at real
//! coordinates, estimates the client-perceived latency of quorum-based
//! replication protocols over those placements, and reproduces the modeled
//! latencies on sandboxed peers through traffic shaping.
//!
//! # Architecture
//!
//! A single [`GeoLatencyModel`] turns great-circle distance into one-way
//! latency. The [`QuorumSelector`] picks order statistics from a peer's
//! sorted latencies, and the [`ProtocolLatencyEstimator`] composes both into
//! closed-form estimates for three protocol families. The
//! [`NetworkEmulationOrchestrator`] installs the same latencies as directed
//! per-pair shaping rules.
//!
//! # Features
//!
//! - Haversine distance with a configurable fiber propagation speed
//! - Majority-quorum, leader-consensus and fast/slow path estimates
//! - Pairwise ping matrix and nearest-neighbour distribution
//! - Incremental shaping as peers join, with bounded concurrency
//!   and per-command timeouts

pub mod config;
pub mod error;
pub mod geo;
pub mod quorum;
pub mod estimate;
pub mod matrix;
pub mod emulation;

pub use config::Config;
pub use error::{Error, Result};
pub use geo::GeoLatencyModel;
pub use quorum::QuorumSelector;
pub use estimate::ProtocolLatencyEstimator;
pub use emulation::NetworkEmulationOrchestrator;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::geo::{GeoLatencyModel, GeoPoint, PeerSet};
    pub use crate::quorum::{QuorumSelector, QuorumSpec};
    pub use crate::estimate::{EstimateOptions, LatencyEstimate, Protocol, ProtocolLatencyEstimator};
    pub use crate::matrix::LatencyMatrix;
    pub use crate::emulation::{EmulatedPeer, NetworkEmulationOrchestrator, PairResult};
}
