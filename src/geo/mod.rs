//! Geography Module
//!
//! Peer coordinates and the distance-to-latency model built on them.

mod model;
mod points;

pub use model::{GeoLatencyModel, DirectedPath};
pub use points::{GeoPoint, PeerSet, load_points, parse_points};
