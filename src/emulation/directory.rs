//! Peer Directory
//!
//! Resolves sandbox names to the network addresses used by the classifiers.

use std::collections::HashMap;
use std::net::IpAddr;
use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// Resolves peer identity to network address
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Address of the peer living in `sandbox`
    async fn resolve(&self, sandbox: &str) -> Result<IpAddr>;
}

/// In-memory directory
#[derive(Debug, Default)]
pub struct StaticDirectory {
    addresses: RwLock<HashMap<String, IpAddr>>,
}

impl StaticDirectory {
    /// Create a directory from known addresses
    pub fn new(addresses: impl IntoIterator<Item = (String, IpAddr)>) -> Self {
        Self {
            addresses: RwLock::new(addresses.into_iter().collect()),
        }
    }

    /// Register or replace a sandbox address
    pub async fn insert(&self, sandbox: impl Into<String>, address: IpAddr) {
        self.addresses.write().await.insert(sandbox.into(), address);
    }
}

#[async_trait]
impl PeerDirectory for StaticDirectory {
    async fn resolve(&self, sandbox: &str) -> Result<IpAddr> {
        self.addresses
            .read()
            .await
            .get(sandbox)
            .copied()
            .ok_or_else(|| Error::Resolution {
                sandbox: sandbox.to_string(),
                reason: "unknown sandbox".into(),
            })
    }
}

/// Directory backed by `docker inspect` on a named network
#[derive(Debug, Clone)]
pub struct DockerDirectory {
    docker: String,
    network: String,
}

impl DockerDirectory {
    /// Create a directory resolving addresses on `network`
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            docker: "docker".to_string(),
            network: network.into(),
        }
    }

    fn address_template(&self) -> String {
        format!("{{{{(index .NetworkSettings.Networks \"{}\").IPAddress}}}}", self.network)
    }
}

#[async_trait]
impl PeerDirectory for DockerDirectory {
    async fn resolve(&self, sandbox: &str) -> Result<IpAddr> {
        let resolution_error = |reason: String| Error::Resolution {
            sandbox: sandbox.to_string(),
            reason,
        };

        let output = Command::new(&self.docker)
            .arg("inspect")
            .arg("-f")
            .arg(self.address_template())
            .arg(sandbox)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| resolution_error(format!("failed to run {}: {}", self.docker, e)))?;

        if !output.status.success() {
            return Err(resolution_error(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let raw = String::from_utf8_lossy(&output.stdout);
        let raw = raw.trim();
        raw.parse().map_err(|_| {
            resolution_error(format!("no address on network '{}' (got '{}')", self.network, raw))
        })
    }
}
