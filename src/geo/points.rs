//! Peer Coordinates
//!
//! GeoPoints and the append-only PeerSet, plus the `lat,lon,loc` table loader.

use std::path::Path;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A peer location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
    /// Human-readable location name
    pub label: String,
}

impl GeoPoint {
    /// Create a new point
    pub fn new(latitude: f64, longitude: f64, label: impl Into<String>) -> Self {
        Self {
            latitude,
            longitude,
            label: label.into(),
        }
    }
}

/// Ordered, append-only set of peer locations.
///
/// The index of a point is the identity of the peer placed there.
#[derive(Debug, Clone, Default)]
pub struct PeerSet {
    points: Vec<GeoPoint>,
}

impl PeerSet {
    /// Create an empty peer set
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a peer set from an ordered list of points
    pub fn from_points(points: Vec<GeoPoint>) -> Self {
        Self { points }
    }

    /// Append a joining peer and return its slot
    pub fn push(&mut self, point: GeoPoint) -> usize {
        self.points.push(point);
        self.points.len() - 1
    }

    /// Get the point of a slot
    pub fn get(&self, slot: usize) -> Option<&GeoPoint> {
        self.points.get(slot)
    }

    /// Number of peers
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the set has no peers
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// All points in slot order
    pub fn points(&self) -> &[GeoPoint] {
        &self.points
    }

    /// The first `count` points (fewer if the set is smaller)
    pub fn prefix(&self, count: usize) -> &[GeoPoint] {
        &self.points[..count.min(self.points.len())]
    }

    /// Labels in slot order
    pub fn labels(&self) -> Vec<String> {
        self.points.iter().map(|p| p.label.clone()).collect()
    }
}

/// Load a coordinate table from a file
pub fn load_points(path: &Path) -> Result<PeerSet> {
    let content = std::fs::read_to_string(path)?;
    let peers = parse_points(&content)?;
    tracing::info!("Loaded {} peer locations from {:?}", peers.len(), path);
    Ok(peers)
}

/// Parse a comma separated table with a `lat,lon,loc` header.
///
/// Columns may appear in any order and a leading byte order mark is
/// ignored. Fields are split on every comma, so labels must not be quoted
/// or contain commas. Rows that cannot be parsed are skipped with a
/// warning; a missing header is an error.
pub fn parse_points(content: &str) -> Result<PeerSet> {
    let mut lines = content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty());

    let (header_line, header) = lines.next().ok_or_else(|| Error::Input {
        line: 1,
        reason: "empty coordinate table".into(),
    })?;
    let header = header.strip_prefix('\u{feff}').unwrap_or(header);
    let columns: Vec<&str> = header.split(',').map(|c| c.trim()).collect();
    let column = |name: &str| {
        columns.iter().position(|c| *c == name).ok_or_else(|| Error::Input {
            line: header_line + 1,
            reason: format!("header is missing the '{}' column", name),
        })
    };
    let (lat_col, lon_col, loc_col) = (column("lat")?, column("lon")?, column("loc")?);

    let mut peers = PeerSet::new();
    for (index, line) in lines {
        match parse_row(line, lat_col, lon_col, loc_col, index + 1) {
            Ok(point) => {
                peers.push(point);
            }
            Err(e) => tracing::warn!("Skipping coordinate row: {}", e),
        }
    }

    Ok(peers)
}

fn parse_row(line: &str, lat_col: usize, lon_col: usize, loc_col: usize, line_no: usize) -> Result<GeoPoint> {
    let fields: Vec<&str> = line.split(',').map(|f| f.trim()).collect();
    let field = |col: usize, name: &'static str| {
        fields.get(col).copied().ok_or_else(|| Error::Input {
            line: line_no,
            reason: format!("missing '{}' field", name),
        })
    };
    let number = |col: usize, name: &'static str| -> Result<f64> {
        let raw = field(col, name)?;
        raw.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| Error::Input {
                line: line_no,
                reason: format!("invalid {} '{}'", name, raw),
            })
    };

    let latitude = number(lat_col, "lat")?;
    let longitude = number(lon_col, "lon")?;
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return Err(Error::Input {
            line: line_no,
            reason: format!("coordinates out of range ({}, {})", latitude, longitude),
        });
    }
    let label = field(loc_col, "loc")?;

    Ok(GeoPoint::new(latitude, longitude, label))
}
