//! Network Emulation
//!
//! Turns modeled latencies into real traffic shaping inside sandboxed
//! peers, one dedicated class per remote peer.

pub mod directory;
pub mod executor;
pub mod orchestrator;
pub mod shaping;

pub use directory::{DockerDirectory, PeerDirectory, StaticDirectory};
pub use executor::{CommandExecutor, CommandOutput, DockerExecutor};
pub use orchestrator::{EmulatedPeer, EmulationRule, NetworkEmulationOrchestrator, PairResult, ShapingPhase};
pub use shaping::{ClassId, Direction, ShapingCommands, MAX_SLOT_NUMBER};
