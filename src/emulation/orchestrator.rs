//! Network Emulation Orchestrator
//!
//! Installs directed per-pair latency shaping across a growing set of
//! emulated peers. Pair installs run on a bounded worker pool; commands
//! against one peer's shaping hierarchy are serialized by that peer's lock.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, OnceCell, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::directory::PeerDirectory;
use super::executor::CommandExecutor;
use super::shaping::{ClassId, Direction, ShapingCommands, PATH_COMMANDS};
use crate::config::EmulationConfig;
use crate::error::{Error, Result};
use crate::geo::{DirectedPath, GeoLatencyModel, GeoPoint, PeerSet};

/// A peer taking part in the emulation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmulatedPeer {
    /// 0-based slot in the global ordering
    pub slot: usize,
    /// Sandbox hosting the peer
    pub sandbox: String,
    /// Peer location
    pub location: GeoPoint,
}

impl EmulatedPeer {
    /// Create a new emulated peer
    pub fn new(slot: usize, sandbox: impl Into<String>, location: GeoPoint) -> Self {
        Self {
            slot,
            sandbox: sandbox.into(),
            location,
        }
    }

    /// The first `count` peers of a placement, named after the configured prefix
    pub fn from_peer_set(peers: &PeerSet, count: usize, config: &EmulationConfig) -> Vec<Self> {
        peers
            .prefix(count)
            .iter()
            .enumerate()
            .map(|(slot, location)| Self::new(slot, config.sandbox_name(slot), location.clone()))
            .collect()
    }
}

/// Lifecycle of one peer's shaping hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShapingPhase {
    /// No root discipline installed by us
    Unconfigured,
    /// Root discipline and default class in place
    RootInstalled,
    /// Some per-peer classes installed
    ClassesInstalled,
    /// Classes installed for every known peer
    Ready,
}

impl fmt::Display for ShapingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapingPhase::Unconfigured => write!(f, "UNCONFIGURED"),
            ShapingPhase::RootInstalled => write!(f, "ROOT_INSTALLED"),
            ShapingPhase::ClassesInstalled => write!(f, "CLASSES_INSTALLED"),
            ShapingPhase::Ready => write!(f, "READY"),
        }
    }
}

/// One installed shaping rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmulationRule {
    /// Peer whose egress is shaped
    pub peer: usize,
    /// Remote peer matched by the classifier
    pub remote: usize,
    /// Direction relative to the pair
    pub direction: Direction,
    /// Traffic class on `peer`
    pub class: ClassId,
    /// Destination address matched by the classifier
    pub classifier: IpAddr,
    /// One-way delay
    pub delay_ms: u64,
    /// When the rule was installed
    pub installed_at: DateTime<Utc>,
}

/// Outcome of one attempted pair install
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairResult {
    /// Lower slot of the pair
    pub peer_a: usize,
    /// Higher slot of the pair
    pub peer_b: usize,
    /// Both directions installed
    pub ok: bool,
    /// One-way delay applied in each direction
    pub delay_ms: u64,
    /// Failure description when `ok` is false
    pub error: Option<String>,
}

impl PairResult {
    /// Emulated ping between the pair
    pub fn round_trip_ms(&self) -> u64 {
        2 * self.delay_ms
    }
}

#[derive(Debug)]
struct PeerShaping {
    phase: ShapingPhase,
    /// Completed path commands per remote slot
    paths: BTreeMap<usize, usize>,
    /// Why the peer could not be prepared, if it could not
    failure: Option<String>,
}

#[derive(Debug)]
struct PeerHandle {
    peer: EmulatedPeer,
    address: OnceCell<IpAddr>,
    state: Mutex<PeerShaping>,
}

impl PeerHandle {
    fn new(peer: EmulatedPeer, phase: ShapingPhase) -> Self {
        Self {
            peer,
            address: OnceCell::new(),
            state: Mutex::new(PeerShaping {
                phase,
                paths: BTreeMap::new(),
                failure: None,
            }),
        }
    }
}

type RuleKey = (usize, usize, Direction);

/// Network emulation orchestrator
pub struct NetworkEmulationOrchestrator {
    config: EmulationConfig,
    model: GeoLatencyModel,
    commands: ShapingCommands,
    executor: Arc<dyn CommandExecutor>,
    directory: Arc<dyn PeerDirectory>,
    /// Known peers by slot
    peers: RwLock<BTreeMap<usize, Arc<PeerHandle>>>,
    /// Installed rules keyed by (peer, remote, direction)
    rules: RwLock<BTreeMap<RuleKey, EmulationRule>>,
    cancel: CancellationToken,
}

impl NetworkEmulationOrchestrator {
    /// Create a new orchestrator from validated configuration
    pub fn new(
        config: EmulationConfig,
        model: GeoLatencyModel,
        executor: Arc<dyn CommandExecutor>,
        directory: Arc<dyn PeerDirectory>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            commands: ShapingCommands::new(&config),
            config,
            model,
            executor,
            directory,
            peers: RwLock::new(BTreeMap::new()),
            rules: RwLock::new(BTreeMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Token that stops issuing new pair installs when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Shape every pair of `peers` from scratch.
    ///
    /// Each peer is reset and given a fresh root discipline, then both
    /// directions of every pair are installed. Always returns one result per
    /// attempted pair; failures never stop the remaining pairs.
    pub async fn emulate(self: &Arc<Self>, peers: &[EmulatedPeer]) -> Vec<PairResult> {
        if !self.config.enabled {
            tracing::info!("Latency emulation disabled, skipping {} peers", peers.len());
            return Vec::new();
        }
        if self.cancel.is_cancelled() {
            tracing::warn!("Emulation cancelled before start");
            return Vec::new();
        }

        let mut handles = Vec::with_capacity(peers.len());
        for peer in peers {
            handles.push(self.register(peer, ShapingPhase::Unconfigured).await);
        }

        self.prepare_all(handles.clone(), true).await;

        let mut pairs = Vec::new();
        for (i, a) in handles.iter().enumerate() {
            for b in &handles[i + 1..] {
                pairs.push(ordered(a, b));
            }
        }

        tracing::info!(
            "Installing latency for {} pairs across {} peers",
            pairs.len(),
            handles.len()
        );
        self.run_pairs(pairs).await
    }

    /// Shape the paths between a joining peer and every existing peer.
    ///
    /// Only the new peer is reset; existing peers keep their other classes and
    /// filters. Existing peers not seen before are assumed to carry a root
    /// discipline from an earlier emulation.
    pub async fn add_peer(
        self: &Arc<Self>,
        new_peer: &EmulatedPeer,
        existing: &[EmulatedPeer],
    ) -> Vec<PairResult> {
        if !self.config.enabled {
            tracing::info!("Latency emulation disabled, not shaping '{}'", new_peer.sandbox);
            return Vec::new();
        }
        if self.cancel.is_cancelled() {
            tracing::warn!("Emulation cancelled, not adding '{}'", new_peer.sandbox);
            return Vec::new();
        }

        let new_handle = self.register(new_peer, ShapingPhase::Unconfigured).await;
        let mut existing_handles = Vec::with_capacity(existing.len());
        for peer in existing.iter().filter(|p| p.slot != new_peer.slot) {
            existing_handles.push(self.register(peer, ShapingPhase::RootInstalled).await);
        }

        if let Err(e) = self.prepare(&new_handle, true).await {
            tracing::warn!("Failed to prepare joining peer '{}': {}", new_peer.sandbox, e);
        }
        let unresolved = existing_handles
            .iter()
            .filter(|h| h.address.get().is_none())
            .cloned()
            .collect();
        self.prepare_all(unresolved, false).await;

        let pairs = existing_handles
            .iter()
            .map(|existing| ordered(existing, &new_handle))
            .collect::<Vec<_>>();

        tracing::info!(
            "Peer '{}' joining: installing latency for {} new pairs",
            new_peer.sandbox,
            pairs.len()
        );
        self.run_pairs(pairs).await
    }

    /// Consume peer join events until the channel closes or emulation is cancelled
    pub async fn watch_joins(self: &Arc<Self>, mut joins: mpsc::Receiver<EmulatedPeer>) -> Vec<PairResult> {
        let mut results = Vec::new();

        loop {
            let peer = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                joined = joins.recv() => match joined {
                    Some(peer) => peer,
                    None => break,
                },
            };

            let existing: Vec<EmulatedPeer> = self
                .peers
                .read()
                .await
                .values()
                .filter(|h| h.peer.slot != peer.slot)
                .map(|h| h.peer.clone())
                .collect();
            results.extend(self.add_peer(&peer, &existing).await);
        }

        results
    }

    /// Reset a peer and install the root discipline with its default class
    pub async fn initialize(&self, peer: &EmulatedPeer) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let handle = self.register(peer, ShapingPhase::Unconfigured).await;
        self.initialize_handle(&handle).await
    }

    /// Install both directions of the path between two peers
    pub async fn install_path(&self, a: &EmulatedPeer, b: &EmulatedPeer) -> PairResult {
        let a = self.register(a, ShapingPhase::Unconfigured).await;
        let b = self.register(b, ShapingPhase::Unconfigured).await;
        let (a, b) = ordered(&a, &b);
        self.install_pair(&a, &b).await
    }

    /// Installed rules, ordered by (peer, remote, direction)
    pub async fn rules(&self) -> Vec<EmulationRule> {
        self.rules.read().await.values().cloned().collect()
    }

    /// Directed paths currently shaped
    pub async fn directed_paths(&self) -> Vec<DirectedPath> {
        self.rules
            .read()
            .await
            .values()
            .map(|rule| DirectedPath {
                source: rule.peer,
                destination: rule.remote,
                delay_ms: rule.delay_ms,
            })
            .collect()
    }

    /// Shaping phase of a known peer
    pub async fn phase(&self, slot: usize) -> Option<ShapingPhase> {
        let handle = self.peers.read().await.get(&slot).cloned()?;
        let phase = handle.state.lock().await.phase;
        Some(phase)
    }

    async fn register(&self, peer: &EmulatedPeer, phase: ShapingPhase) -> Arc<PeerHandle> {
        let mut peers = self.peers.write().await;
        Arc::clone(
            peers
                .entry(peer.slot)
                .or_insert_with(|| Arc::new(PeerHandle::new(peer.clone(), phase))),
        )
    }

    async fn address(&self, handle: &PeerHandle) -> Result<IpAddr> {
        handle
            .address
            .get_or_try_init(|| async {
                let sandbox = &handle.peer.sandbox;
                match timeout(self.config.command_timeout(), self.directory.resolve(sandbox)).await {
                    Ok(resolved) => resolved,
                    Err(_) => Err(Error::Resolution {
                        sandbox: sandbox.clone(),
                        reason: "timed out".into(),
                    }),
                }
            })
            .await
            .copied()
    }

    /// Run one shaping command under the per-command timeout
    async fn run(&self, sandbox: &str, command: &str) -> Result<String> {
        tracing::debug!("{} {}", sandbox, command);

        match timeout(self.config.command_timeout(), self.executor.exec(sandbox, command)).await {
            Err(_) => Err(Error::CommandTimeout {
                sandbox: sandbox.to_string(),
                command: command.to_string(),
            }),
            Ok(Err(e)) => Err(e),
            Ok(Ok(output)) if output.success => Ok(output.output),
            Ok(Ok(output)) => Err(Error::Command {
                sandbox: sandbox.to_string(),
                command: command.to_string(),
                output: output.output,
            }),
        }
    }

    async fn initialize_handle(&self, handle: &PeerHandle) -> Result<()> {
        let sandbox = &handle.peer.sandbox;
        let mut state = handle.state.lock().await;

        // Nothing to delete on a fresh sandbox
        if let Err(e) = self.run(sandbox, &self.commands.reset()).await {
            tracing::debug!("No previous shaping state on '{}': {}", sandbox, e);
        }
        state.phase = ShapingPhase::Unconfigured;
        state.paths.clear();
        self.rules
            .write()
            .await
            .retain(|(peer, _, _), _| *peer != handle.peer.slot);

        self.run(sandbox, &self.commands.root()).await?;
        self.run(sandbox, &self.commands.default_class()).await?;
        state.phase = ShapingPhase::RootInstalled;

        tracing::debug!("Installed root shaping discipline on '{}'", sandbox);
        Ok(())
    }

    /// Resolve a peer's address and optionally reset its shaping state,
    /// remembering any failure for the pairs that involve it
    async fn prepare(&self, handle: &PeerHandle, initialize: bool) -> Result<()> {
        let result: Result<()> = async {
            self.address(handle).await?;
            if initialize {
                self.initialize_handle(handle).await?;
            }
            Ok(())
        }
        .await;

        handle.state.lock().await.failure = result.as_ref().err().map(|e| e.to_string());
        result
    }

    async fn prepare_all(self: &Arc<Self>, handles: Vec<Arc<PeerHandle>>, initialize: bool) {
        let semaphore = Arc::new(Semaphore::new(self.config.workers));
        let mut tasks = JoinSet::new();

        for handle in handles {
            let Some(permit) = self.acquire(&semaphore).await else {
                break;
            };
            let this = Arc::clone(self);
            tasks.spawn(async move {
                let _permit = permit;
                if let Err(e) = this.prepare(&handle, initialize).await {
                    tracing::warn!("Failed to prepare '{}': {}", handle.peer.sandbox, e);
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Peer preparation task failed: {}", e);
            }
        }
    }

    /// Wait for a worker slot unless emulation is cancelled first
    async fn acquire(&self, semaphore: &Arc<Semaphore>) -> Option<tokio::sync::OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::warn!("Emulation cancelled, not issuing remaining installs");
                None
            }
            permit = Arc::clone(semaphore).acquire_owned() => permit.ok(),
        }
    }

    async fn run_pairs(self: &Arc<Self>, pairs: Vec<(Arc<PeerHandle>, Arc<PeerHandle>)>) -> Vec<PairResult> {
        let semaphore = Arc::new(Semaphore::new(self.config.workers));
        let mut tasks = JoinSet::new();

        for (a, b) in pairs {
            let Some(permit) = self.acquire(&semaphore).await else {
                break;
            };
            let this = Arc::clone(self);
            tasks.spawn(async move {
                let _permit = permit;
                this.install_pair(&a, &b).await
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!("Pair install task failed: {}", e),
            }
        }
        results.sort_by_key(|r| (r.peer_a, r.peer_b));

        self.refresh_phases().await;

        let failed = results.iter().filter(|r| !r.ok).count();
        tracing::info!(
            "Latency emulation finished: {} pairs installed, {} failed",
            results.len() - failed,
            failed
        );
        results
    }

    async fn install_pair(&self, a: &PeerHandle, b: &PeerHandle) -> PairResult {
        let delay_ms = self.model.one_way(&a.peer.location, &b.peer.location);
        let mut result = PairResult {
            peer_a: a.peer.slot,
            peer_b: b.peer.slot,
            ok: false,
            delay_ms,
            error: None,
        };

        for handle in [a, b] {
            let failure = handle.state.lock().await.failure.clone();
            if let Some(failure) = failure {
                tracing::warn!(
                    "Skipping latency between '{}' and '{}': {}",
                    a.peer.sandbox,
                    b.peer.sandbox,
                    failure
                );
                result.error = Some(failure);
                return result;
            }
        }

        let mut errors = Vec::new();
        if let Err(e) = self.install_direction(a, b, Direction::Forward, delay_ms).await {
            errors.push(e.to_string());
        }
        if let Err(e) = self.install_direction(b, a, Direction::Reverse, delay_ms).await {
            errors.push(e.to_string());
        }

        if errors.is_empty() {
            result.ok = true;
            tracing::info!(
                "Added {}ms ping latency between '{}' and '{}'",
                result.round_trip_ms(),
                a.peer.sandbox,
                b.peer.sandbox
            );
        } else {
            let error = errors.join("; ");
            tracing::warn!(
                "Error adding latency between '{}' and '{}': {}",
                a.peer.sandbox,
                b.peer.sandbox,
                error
            );
            result.error = Some(error);
        }
        result
    }

    /// Shape traffic from `local` to `remote`, holding only `local`'s lock
    async fn install_direction(
        &self,
        local: &PeerHandle,
        remote: &PeerHandle,
        direction: Direction,
        delay_ms: u64,
    ) -> Result<()> {
        let class = ClassId::for_slot(remote.peer.slot)?;
        let destination = self.address(remote).await?;

        let mut state = local.state.lock().await;
        if state.phase == ShapingPhase::Unconfigured {
            return Err(Error::NotInitialized(local.peer.sandbox.clone()));
        }
        let done = state.paths.get(&remote.peer.slot).copied().unwrap_or(0);
        if done == PATH_COMMANDS {
            tracing::debug!("'{}' already shapes traffic to '{}'", local.peer.sandbox, remote.peer.sandbox);
            return Ok(());
        }

        // Resume after the last command that went through
        let commands = self.commands.path(class, delay_ms, destination);
        for (step, command) in commands.iter().enumerate().skip(done) {
            self.run(&local.peer.sandbox, command).await?;
            state.paths.insert(remote.peer.slot, step + 1);
            state.phase = ShapingPhase::ClassesInstalled;
        }

        self.rules.write().await.insert(
            (local.peer.slot, remote.peer.slot, direction),
            EmulationRule {
                peer: local.peer.slot,
                remote: remote.peer.slot,
                direction,
                class,
                classifier: destination,
                delay_ms,
                installed_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Mark peers whose classes cover every other known peer as ready
    async fn refresh_phases(&self) {
        let peers = self.peers.read().await;
        let known = peers.len();

        for handle in peers.values() {
            let mut state = handle.state.lock().await;
            if state.phase == ShapingPhase::Unconfigured {
                continue;
            }
            let shaped = state.paths.values().filter(|done| **done == PATH_COMMANDS).count();
            let complete = shaped + 1 >= known;
            state.phase = match (complete, state.paths.is_empty()) {
                (true, _) => ShapingPhase::Ready,
                (false, true) => ShapingPhase::RootInstalled,
                (false, false) => ShapingPhase::ClassesInstalled,
            };
        }
    }
}

fn ordered(a: &Arc<PeerHandle>, b: &Arc<PeerHandle>) -> (Arc<PeerHandle>, Arc<PeerHandle>) {
    if a.peer.slot <= b.peer.slot {
        (Arc::clone(a), Arc::clone(b))
    } else {
        (Arc::clone(b), Arc::clone(a))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use async_trait::async_trait;

    use crate::emulation::directory::StaticDirectory;
    use crate::emulation::executor::CommandOutput;

    /// Executor that records every command and fails or hangs on request
    #[derive(Default)]
    struct RecordingExecutor {
        log: StdMutex<Vec<(String, String)>>,
        fail: Option<(String, String)>,
        /// Failures left for `fail`, unlimited when `None`
        fail_budget: StdMutex<Option<usize>>,
        hang: Option<(String, String)>,
        cancel_on: Option<(String, String)>,
        token: StdMutex<Option<CancellationToken>>,
        in_flight: StdMutex<HashMap<String, usize>>,
        max_in_flight: StdMutex<usize>,
    }

    impl RecordingExecutor {
        fn failing(sandbox: &str, needle: &str) -> Self {
            Self {
                fail: Some((sandbox.to_string(), needle.to_string())),
                ..Default::default()
            }
        }

        fn failing_once(sandbox: &str, needle: &str) -> Self {
            Self {
                fail_budget: StdMutex::new(Some(1)),
                ..Self::failing(sandbox, needle)
            }
        }

        fn cancelling(sandbox: &str, needle: &str) -> Self {
            Self {
                cancel_on: Some((sandbox.to_string(), needle.to_string())),
                ..Default::default()
            }
        }

        fn take_failure(&self) -> bool {
            match self.fail_budget.lock().unwrap().as_mut() {
                None => true,
                Some(0) => false,
                Some(left) => {
                    *left -= 1;
                    true
                }
            }
        }

        fn hanging(sandbox: &str, needle: &str) -> Self {
            Self {
                hang: Some((sandbox.to_string(), needle.to_string())),
                ..Default::default()
            }
        }

        fn commands(&self) -> Vec<(String, String)> {
            self.log.lock().unwrap().clone()
        }

        fn commands_on(&self, sandbox: &str) -> Vec<String> {
            self.commands()
                .into_iter()
                .filter(|(s, _)| s == sandbox)
                .map(|(_, c)| c)
                .collect()
        }
    }

    fn matches(rule: &Option<(String, String)>, sandbox: &str, command: &str) -> bool {
        matches!(rule, Some((s, needle)) if s == sandbox && command.contains(needle.as_str()))
    }

    #[async_trait]
    impl CommandExecutor for RecordingExecutor {
        async fn exec(&self, sandbox: &str, command: &str) -> Result<CommandOutput> {
            self.log.lock().unwrap().push((sandbox.to_string(), command.to_string()));
            if matches(&self.cancel_on, sandbox, command) {
                if let Some(token) = self.token.lock().unwrap().as_ref() {
                    token.cancel();
                }
            }
            {
                let mut in_flight = self.in_flight.lock().unwrap();
                let count = in_flight.entry(sandbox.to_string()).or_insert(0);
                *count += 1;
                let mut max = self.max_in_flight.lock().unwrap();
                *max = (*max).max(*count);
            }

            if matches(&self.hang, sandbox, command) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            } else {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            *self.in_flight.lock().unwrap().get_mut(sandbox).unwrap() -= 1;

            if command.starts_with("tc qdisc del") {
                // fresh sandboxes have no root discipline to delete
                return Ok(CommandOutput::failed("Error: Cannot delete qdisc with handle of zero."));
            }
            if matches(&self.fail, sandbox, command) && self.take_failure() {
                return Ok(CommandOutput::failed("RTNETLINK answers: File exists"));
            }
            Ok(CommandOutput::ok(""))
        }
    }

    fn config() -> EmulationConfig {
        EmulationConfig {
            node_prefix: "node".to_string(),
            workers: 4,
            command_timeout_ms: 200,
            ..Default::default()
        }
    }

    /// Peers every 10 degrees along the equator
    fn peers(count: usize) -> Vec<EmulatedPeer> {
        let placement = PeerSet::from_points(
            (0..count)
                .map(|i| GeoPoint::new(0.0, 10.0 * i as f64, format!("p{}", i)))
                .collect(),
        );
        EmulatedPeer::from_peer_set(&placement, count, &config())
    }

    fn directory(count: usize) -> StaticDirectory {
        StaticDirectory::new((0..count).map(|i| {
            (format!("node{}", i + 1), format!("10.0.0.{}", i + 1).parse::<IpAddr>().unwrap())
        }))
    }

    /// Directory that never answers for one sandbox
    struct HangingDirectory {
        inner: StaticDirectory,
        stuck: String,
    }

    #[async_trait]
    impl PeerDirectory for HangingDirectory {
        async fn resolve(&self, sandbox: &str) -> Result<IpAddr> {
            if sandbox == self.stuck {
                std::future::pending::<()>().await;
            }
            self.inner.resolve(sandbox).await
        }
    }

    fn orchestrator(
        config: EmulationConfig,
        executor: Arc<RecordingExecutor>,
        directory: StaticDirectory,
    ) -> Arc<NetworkEmulationOrchestrator> {
        Arc::new(
            NetworkEmulationOrchestrator::new(config, GeoLatencyModel::default(), executor, Arc::new(directory))
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_emulate_installs_full_closure() {
        let executor = Arc::new(RecordingExecutor::default());
        let emulator = orchestrator(config(), Arc::clone(&executor), directory(3));
        let peers = peers(3);

        let results = emulator.emulate(&peers).await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.ok && r.error.is_none()));
        let delays: Vec<(usize, usize, u64)> =
            results.iter().map(|r| (r.peer_a, r.peer_b, r.delay_ms)).collect();
        assert_eq!(delays, vec![(0, 1, 5), (0, 2, 10), (1, 2, 5)]);

        // 3 root commands per peer plus 3 commands per direction
        assert_eq!(executor.commands().len(), 3 * 3 + 6 * 3);

        let node1 = executor.commands_on("node1");
        assert!(node1.contains(&"tc qdisc add dev eth0 root handle 1: htb default 1".to_string()));
        assert!(node1.contains(&"tc class add dev eth0 parent 1:1 classid 1:20 htb rate 100mbit".to_string()));
        assert!(node1.contains(&"tc qdisc add dev eth0 parent 1:30 handle 30: netem delay 10ms".to_string()));
        assert!(node1.iter().any(|c| c.ends_with("match ip dst 10.0.0.2 flowid 1:20")));

        let mut paths = emulator.directed_paths().await;
        let mut expected = GeoLatencyModel::default()
            .directed_paths(&PeerSet::from_points(peers.iter().map(|p| p.location.clone()).collect()));
        paths.sort_by_key(|p| (p.source, p.destination));
        expected.sort_by_key(|p| (p.source, p.destination));
        assert_eq!(paths, expected);

        for slot in 0..3 {
            assert_eq!(emulator.phase(slot).await, Some(ShapingPhase::Ready));
        }
    }

    #[tokio::test]
    async fn test_add_peer_only_touches_new_paths() {
        let executor = Arc::new(RecordingExecutor::default());
        let emulator = orchestrator(config(), Arc::clone(&executor), directory(3));
        let peers = peers(3);

        let initial = emulator.emulate(&peers[..2]).await;
        assert_eq!(initial.len(), 1);
        let issued_before = executor.commands().len();

        let results = emulator.add_peer(&peers[2], &peers[..2]).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.ok));
        assert_eq!(
            results.iter().map(|r| (r.peer_a, r.peer_b)).collect::<Vec<_>>(),
            vec![(0, 2), (1, 2)]
        );

        let new_commands = &executor.commands()[issued_before..];
        for (sandbox, command) in new_commands {
            if sandbox == "node1" || sandbox == "node2" {
                assert!(command.contains("1:30"), "unexpected command on {}: {}", sandbox, command);
                assert!(!command.contains("1:10 ") && !command.ends_with("1:10"));
                assert!(!command.contains("1:20 ") && !command.ends_with("1:20"));
                assert!(!command.contains("qdisc del"));
            }
        }
        assert!(new_commands
            .iter()
            .any(|(s, c)| s == "node3" && c == "tc qdisc add dev eth0 root handle 1: htb default 1"));

        assert_eq!(emulator.rules().await.len(), 6);
        assert_eq!(emulator.phase(0).await, Some(ShapingPhase::Ready));
    }

    #[tokio::test]
    async fn test_add_peer_to_three_peer_topology() {
        let executor = Arc::new(RecordingExecutor::default());
        let emulator = orchestrator(config(), Arc::clone(&executor), directory(4));
        let peers = peers(4);

        assert_eq!(emulator.emulate(&peers[..3]).await.len(), 3);
        let results = emulator.add_peer(&peers[3], &peers[..3]).await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.ok && r.peer_b == 3));
        assert_eq!(emulator.rules().await.len(), 12);
    }

    #[tokio::test]
    async fn test_one_failing_pair_is_isolated() {
        let executor = Arc::new(RecordingExecutor::failing("node3", "tc filter"));
        let emulator = orchestrator(config(), Arc::clone(&executor), directory(6));
        let peers = peers(6);

        let results = emulator.add_peer(&peers[5], &peers[..5]).await;
        assert_eq!(results.len(), 5);
        assert_eq!(results.iter().filter(|r| r.ok).count(), 4);

        let failed: Vec<&PairResult> = results.iter().filter(|r| !r.ok).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!((failed[0].peer_a, failed[0].peer_b), (2, 5));
        let error = failed[0].error.as_deref().unwrap();
        assert!(error.contains("node3"));
        assert!(error.contains("File exists"));

        // the healthy direction of the failed pair is kept
        let rules = emulator.rules().await;
        assert!(rules.iter().any(|r| r.peer == 5 && r.remote == 2 && r.direction == Direction::Reverse));
        assert!(!rules.iter().any(|r| r.peer == 2 && r.remote == 5));
        // partial configuration of the failed direction is not rolled back
        assert!(executor
            .commands_on("node3")
            .iter()
            .any(|c| c.contains("netem delay")));
    }

    #[tokio::test]
    async fn test_resolution_failure_aborts_only_that_peer() {
        let executor = Arc::new(RecordingExecutor::default());
        let directory = StaticDirectory::new([
            ("node1".to_string(), "10.0.0.1".parse::<IpAddr>().unwrap()),
            ("node3".to_string(), "10.0.0.3".parse::<IpAddr>().unwrap()),
        ]);
        let emulator = orchestrator(config(), Arc::clone(&executor), directory);

        let results = emulator.emulate(&peers(3)).await;
        assert_eq!(results.len(), 3);
        let outcome: Vec<(usize, usize, bool)> = results.iter().map(|r| (r.peer_a, r.peer_b, r.ok)).collect();
        assert_eq!(outcome, vec![(0, 1, false), (0, 2, true), (1, 2, false)]);
        assert!(results[0].error.as_deref().unwrap().contains("node2"));
        assert!(executor.commands_on("node2").is_empty());
    }

    #[tokio::test]
    async fn test_command_timeout_marks_pair_failed() {
        let executor = Arc::new(RecordingExecutor::hanging("node2", "netem"));
        let emulator = orchestrator(config(), Arc::clone(&executor), directory(2));

        let results = emulator.emulate(&peers(2)).await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].ok);
        assert!(results[0].error.as_deref().unwrap().contains("timed out"));

        // the forward direction on node1 still went through
        let rules = emulator.rules().await;
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].peer, 0);
    }

    #[tokio::test]
    async fn test_cancelled_emulation_issues_nothing() {
        let executor = Arc::new(RecordingExecutor::default());
        let emulator = orchestrator(config(), Arc::clone(&executor), directory(3));

        emulator.cancellation_token().cancel();
        assert!(emulator.emulate(&peers(3)).await.is_empty());
        assert!(matches!(emulator.initialize(&peers(1)[0]).await, Err(Error::Cancelled)));
        assert!(executor.commands().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_emulation_installs_nothing() {
        let executor = Arc::new(RecordingExecutor::default());
        let config = EmulationConfig {
            enabled: false,
            ..config()
        };
        let emulator = orchestrator(config, Arc::clone(&executor), directory(3));

        assert!(emulator.emulate(&peers(3)).await.is_empty());
        assert!(executor.commands().is_empty());
    }

    #[tokio::test]
    async fn test_commands_on_a_peer_never_interleave() {
        let executor = Arc::new(RecordingExecutor::default());
        let config = EmulationConfig {
            workers: 8,
            ..config()
        };
        let emulator = orchestrator(config, Arc::clone(&executor), directory(6));

        let results = emulator.emulate(&peers(6)).await;
        assert_eq!(results.len(), 15);
        assert!(results.iter().all(|r| r.ok));
        assert_eq!(*executor.max_in_flight.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let executor = Arc::new(RecordingExecutor::default());
        let emulator = orchestrator(config(), Arc::clone(&executor), directory(1));
        let peer = &peers(1)[0];

        emulator.initialize(peer).await.unwrap();
        emulator.initialize(peer).await.unwrap();
        assert_eq!(emulator.phase(0).await, Some(ShapingPhase::RootInstalled));

        let commands = executor.commands_on("node1");
        assert_eq!(commands.len(), 6);
        assert_eq!(commands.iter().filter(|c| c.starts_with("tc qdisc del")).count(), 2);
    }

    #[tokio::test]
    async fn test_install_path_requires_root() {
        let executor = Arc::new(RecordingExecutor::default());
        let emulator = orchestrator(config(), Arc::clone(&executor), directory(2));
        let peers = peers(2);

        let result = emulator.install_path(&peers[1], &peers[0]).await;
        assert_eq!((result.peer_a, result.peer_b), (0, 1));
        assert!(!result.ok);
        assert!(result.error.unwrap().contains("no root shaping discipline"));

        emulator.initialize(&peers[0]).await.unwrap();
        emulator.initialize(&peers[1]).await.unwrap();
        let result = emulator.install_path(&peers[0], &peers[1]).await;
        assert!(result.ok);
        assert_eq!(result.round_trip_ms(), 10);
    }

    #[tokio::test]
    async fn test_watch_joins() {
        let executor = Arc::new(RecordingExecutor::default());
        let emulator = orchestrator(config(), Arc::clone(&executor), directory(4));
        let peers = peers(4);
        emulator.emulate(&peers[..2]).await;

        let (tx, rx) = mpsc::channel(4);
        tx.send(peers[2].clone()).await.unwrap();
        tx.send(peers[3].clone()).await.unwrap();
        drop(tx);

        let results = emulator.watch_joins(rx).await;
        assert_eq!(results.len(), 2 + 3);
        assert!(results.iter().all(|r| r.ok));
        assert_eq!(emulator.rules().await.len(), 12);
    }

    #[tokio::test]
    async fn test_hanging_resolution_fails_only_that_peer() {
        let executor = Arc::new(RecordingExecutor::default());
        let directory = HangingDirectory {
            inner: directory(3),
            stuck: "node2".to_string(),
        };
        let emulator = Arc::new(
            NetworkEmulationOrchestrator::new(
                config(),
                GeoLatencyModel::default(),
                Arc::clone(&executor) as Arc<dyn CommandExecutor>,
                Arc::new(directory),
            )
            .unwrap(),
        );

        let results = tokio::time::timeout(Duration::from_secs(3), emulator.emulate(&peers(3)))
            .await
            .expect("emulation must finish despite a stuck lookup");
        let outcome: Vec<(usize, usize, bool)> = results.iter().map(|r| (r.peer_a, r.peer_b, r.ok)).collect();
        assert_eq!(outcome, vec![(0, 1, false), (0, 2, true), (1, 2, false)]);
        assert!(results[0].error.as_deref().unwrap().contains("timed out"));
        assert!(executor.commands_on("node2").is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_run_keeps_installed_rules() {
        let executor = Arc::new(RecordingExecutor::cancelling("node2", "flowid 1:10"));
        let config = EmulationConfig {
            workers: 1,
            ..config()
        };
        let emulator = orchestrator(config, Arc::clone(&executor), directory(4));
        *executor.token.lock().unwrap() = Some(emulator.cancellation_token());

        let results = emulator.emulate(&peers(4)).await;
        // the pair in flight finishes, no further pair is dispatched
        assert_eq!(results.len(), 1);
        assert!(results[0].ok);
        assert_eq!((results[0].peer_a, results[0].peer_b), (0, 1));

        let rules = emulator.rules().await;
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().all(|r| (r.peer, r.remote) == (0, 1) || (r.peer, r.remote) == (1, 0)));
        assert!(emulator.cancellation_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_retry_resumes_partially_installed_path() {
        let executor = Arc::new(RecordingExecutor::failing_once("node1", "tc filter"));
        let emulator = orchestrator(config(), Arc::clone(&executor), directory(2));
        let peers = peers(2);
        emulator.initialize(&peers[0]).await.unwrap();
        emulator.initialize(&peers[1]).await.unwrap();

        let first = emulator.install_path(&peers[0], &peers[1]).await;
        assert!(!first.ok);
        assert_eq!(emulator.phase(0).await, Some(ShapingPhase::ClassesInstalled));

        let second = emulator.install_path(&peers[0], &peers[1]).await;
        assert!(second.ok, "{:?}", second.error);
        assert_eq!(emulator.rules().await.len(), 2);

        let node1 = executor.commands_on("node1");
        let count = |needle: &str| node1.iter().filter(|c| c.starts_with(needle)).count();
        assert_eq!(count("tc class add dev eth0 parent 1:1 classid 1:20"), 1);
        assert_eq!(count("tc qdisc add dev eth0 parent 1:20"), 1);
        assert_eq!(count("tc filter add"), 2);

        // a fully installed path is not issued again
        let issued = executor.commands().len();
        assert!(emulator.install_path(&peers[0], &peers[1]).await.ok);
        assert_eq!(executor.commands().len(), issued);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = EmulationConfig {
            workers: 0,
            ..config()
        };
        let result = NetworkEmulationOrchestrator::new(
            config,
            GeoLatencyModel::default(),
            Arc::new(RecordingExecutor::default()),
            Arc::new(directory(1)),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
