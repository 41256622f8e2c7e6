//! Mesh configuration
//!
//! Every field has a default, so an empty JSON object is a valid config file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, MeshResult};

/// How a simultaneous-offer race ("glare") is resolved
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GlarePolicy {
    /// Every side discards incoming offers while it has its own outstanding
    LocalWins,
    /// The lexicographically smaller identity yields and answers
    IdentityOrder,
}

impl Default for GlarePolicy {
    fn default() -> Self {
        GlarePolicy::IdentityOrder
    }
}

/// Timers, limits and endpoints of one mesh node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub relay_url: String,
    pub heartbeat_interval_ms: u64,
    /// A non-connected peer younger than this is reused by `connect_to`
    pub liveness_window_ms: u64,
    /// Negotiations still unconnected after this long are presumed dead
    pub stuck_grace_ms: u64,
    pub negotiation_timeout_ms: u64,
    pub lookup_timeout_ms: u64,
    /// Largest content (in bytes) the dispatcher accepts
    pub max_wire_size: usize,
    pub glare_policy: GlarePolicy,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://localhost:3001".to_string(),
            heartbeat_interval_ms: 5_000,
            liveness_window_ms: 10_000,
            stuck_grace_ms: 10,
            negotiation_timeout_ms: 15_000,
            lookup_timeout_ms: 10_000,
            max_wire_size: 1_000_000,
            glare_policy: GlarePolicy::default(),
        }
    }
}

impl MeshConfig {
    /// Load a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> MeshResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        tracing::info!("Loaded mesh config from {}", path.as_ref().display());
        Ok(config)
    }

    /// Apply `PEERMESH_*` environment overrides
    pub fn with_env_overrides(self) -> MeshResult<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> MeshResult<Self> {
        if let Some(url) = lookup("PEERMESH_RELAY_URL") {
            self.relay_url = url;
        }
        if let Some(ms) = lookup("PEERMESH_HEARTBEAT_MS") {
            self.heartbeat_interval_ms = ms
                .parse()
                .map_err(|_| MeshError::Config(format!("PEERMESH_HEARTBEAT_MS is not a number: {}", ms)))?;
        }
        if let Some(size) = lookup("PEERMESH_MAX_WIRE_SIZE") {
            self.max_wire_size = size
                .parse()
                .map_err(|_| MeshError::Config(format!("PEERMESH_MAX_WIRE_SIZE is not a number: {}", size)))?;
        }
        Ok(self)
    }

    /// Reject zero timers and limits
    pub fn validate(&self) -> MeshResult<()> {
        let checks = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("liveness_window_ms", self.liveness_window_ms),
            ("negotiation_timeout_ms", self.negotiation_timeout_ms),
            ("lookup_timeout_ms", self.lookup_timeout_ms),
            ("max_wire_size", self.max_wire_size as u64),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(MeshError::Config(format!("{} must be greater than zero", name)));
            }
        }
        if self.relay_url.is_empty() {
            return Err(MeshError::Config("relay_url must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.liveness_window_ms)
    }

    pub fn stuck_grace(&self) -> Duration {
        Duration::from_millis(self.stuck_grace_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
}
