//! Node configuration.

use crate::domain::protocol::{Location, TrackerInfo};
use crate::domain::stream_part::NodeId;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Propagation engine settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    /// Messages that reached fewer targets than this are kept for late joiners.
    pub min_propagation_targets: usize,
    /// How long a kept message stays deliverable, in milliseconds.
    pub ttl_ms: u64,
    /// Upper bound on kept messages.
    pub max_messages: usize,
    /// Consecutive send failures after which a neighbor is dropped.
    pub max_consecutive_failures: u32,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            min_propagation_targets: 2,
            ttl_ms: 30_000,
            max_messages: 10_000,
            max_consecutive_failures: 100,
        }
    }
}

impl PropagationConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Configuration for a stream node.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node ID (generated if not provided).
    pub node_id: Option<NodeId>,
    pub trackers: Vec<TrackerInfo>,
    pub node_connect_timeout_ms: u64,
    pub proxy_response_timeout_ms: u64,
    pub disconnection_wait_time_ms: u64,
    pub disconnection_sweep_interval_ms: u64,
    pub tracker_connection_maintenance_interval_ms: u64,
    pub status_interval_ms: u64,
    pub rtt_update_interval_ms: u64,
    pub instruction_retry_interval_ms: u64,
    pub proxy_reconnection_interval_ms: u64,
    /// Whether other nodes may open publish/subscribe-only connections to this one.
    pub accept_proxy_connections: bool,
    pub propagation: PropagationConfig,
    pub location: Option<Location>,
    pub extra_metadata: serde_json::Map<String, serde_json::Value>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            trackers: Vec::new(),
            node_connect_timeout_ms: 15_000,
            proxy_response_timeout_ms: 15_000,
            disconnection_wait_time_ms: 30_000,
            disconnection_sweep_interval_ms: 120_000,
            tracker_connection_maintenance_interval_ms: 5_000,
            status_interval_ms: 30_000,
            rtt_update_interval_ms: 15_000,
            instruction_retry_interval_ms: 180_000,
            proxy_reconnection_interval_ms: 10_000,
            accept_proxy_connections: false,
            propagation: PropagationConfig::default(),
            location: None,
            extra_metadata: serde_json::Map::new(),
        }
    }
}

impl NodeConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse node configuration")
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json_str(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn node_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.node_connect_timeout_ms)
    }

    pub fn proxy_response_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy_response_timeout_ms)
    }

    pub fn disconnection_wait_time(&self) -> Duration {
        Duration::from_millis(self.disconnection_wait_time_ms)
    }

    pub fn disconnection_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.disconnection_sweep_interval_ms)
    }

    pub fn tracker_connection_maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.tracker_connection_maintenance_interval_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    pub fn rtt_update_interval(&self) -> Duration {
        Duration::from_millis(self.rtt_update_interval_ms)
    }

    pub fn instruction_retry_interval(&self) -> Duration {
        Duration::from_millis(self.instruction_retry_interval_ms)
    }

    pub fn proxy_reconnection_interval(&self) -> Duration {
        Duration::from_millis(self.proxy_reconnection_interval_ms)
    }
}
