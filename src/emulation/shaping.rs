//! Traffic Shaping Commands
//!
//! Renders the `tc` commands that build the per-peer shaping hierarchy:
//! an `htb` root with a default class, and one child class per remote
//! peer carrying a `netem` delay leaf and a `u32` destination classifier.

use std::fmt;
use std::net::IpAddr;
use serde::{Deserialize, Serialize};

use crate::config::EmulationConfig;
use crate::error::{Error, Result};

/// Largest 1-based slot whose class minor (`<slot>0`) still fits 16 bits of hex
pub const MAX_SLOT_NUMBER: usize = 999;

/// Commands shaping one directed path: class, delay leaf, classifier
pub const PATH_COMMANDS: usize = 3;

/// Direction of a shaped path relative to its pair `(a, b)` with `a < b`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Traffic from `a` to `b`, shaped on `a`
    Forward,
    /// Traffic from `b` to `a`, shaped on `b`
    Reverse,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => write!(f, "FORWARD"),
            Direction::Reverse => write!(f, "REVERSE"),
        }
    }
}

/// Traffic class identifier of a remote peer.
///
/// Derived from the remote peer's 1-based slot in the global ordering, so the
/// same remote always maps to the same class on every peer regardless of the
/// order in which peers joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClassId {
    minor: usize,
}

impl ClassId {
    /// Class of the peer in 0-based `slot`
    pub fn for_slot(slot: usize) -> Result<Self> {
        let number = slot + 1;
        if number > MAX_SLOT_NUMBER {
            return Err(Error::Topology(format!(
                "peer slot {} exceeds the {} shaping classes available",
                number, MAX_SLOT_NUMBER
            )));
        }
        Ok(Self { minor: number * 10 })
    }

    /// Handle of the netem leaf attached under this class
    pub fn leaf_handle(&self) -> String {
        format!("{}:", self.minor)
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "1:{}", self.minor)
    }
}

/// Command renderer for one shaped device
#[derive(Debug, Clone)]
pub struct ShapingCommands {
    device: String,
    root_rate: String,
    class_rate: String,
}

impl ShapingCommands {
    /// Create a renderer from the emulation configuration
    pub fn new(config: &EmulationConfig) -> Self {
        Self {
            device: config.device.clone(),
            root_rate: config.root_rate.clone(),
            class_rate: config.class_rate.clone(),
        }
    }

    /// Remove any existing root discipline
    pub fn reset(&self) -> String {
        format!("tc qdisc del dev {} root", self.device)
    }

    /// Root hierarchical token bucket, unclassified traffic goes to `1:1`
    pub fn root(&self) -> String {
        format!("tc qdisc add dev {} root handle 1: htb default 1", self.device)
    }

    /// Default class at full link rate
    pub fn default_class(&self) -> String {
        format!(
            "tc class add dev {} parent 1: classid 1:1 htb rate {}",
            self.device, self.root_rate
        )
    }

    /// Dedicated child class for one remote peer
    pub fn class(&self, class: ClassId) -> String {
        format!(
            "tc class add dev {} parent 1:1 classid {} htb rate {}",
            self.device, class, self.class_rate
        )
    }

    /// Delay leaf under a child class
    pub fn delay(&self, class: ClassId, delay_ms: u64) -> String {
        format!(
            "tc qdisc add dev {} parent {} handle {} netem delay {}ms",
            self.device,
            class,
            class.leaf_handle(),
            delay_ms
        )
    }

    /// Classifier steering packets for `destination` into a child class
    pub fn filter(&self, class: ClassId, destination: IpAddr) -> String {
        let (protocol, matcher) = match destination {
            IpAddr::V4(_) => ("ip", "ip"),
            IpAddr::V6(_) => ("ipv6", "ip6"),
        };
        format!(
            "tc filter add dev {} protocol {} parent 1:0 prio 1 u32 match {} dst {} flowid {}",
            self.device, protocol, matcher, destination, class
        )
    }

    /// Full command sequence for one directed path
    pub fn path(&self, class: ClassId, delay_ms: u64, destination: IpAddr) -> [String; PATH_COMMANDS] {
        [
            self.class(class),
            self.delay(class, delay_ms),
            self.filter(class, destination),
        ]
    }
}
