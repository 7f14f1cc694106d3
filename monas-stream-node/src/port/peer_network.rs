//! PeerNetwork trait - Abstract interface for node-to-node transport

use crate::domain::protocol::NodeMessage;
use crate::domain::stream_part::{NodeId, TrackerId};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;

/// Connection lifecycle and inbound traffic reported by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerNetworkEvent {
    NodeConnected(NodeId),
    NodeDisconnected(NodeId),
    MessageReceived { from: NodeId, message: NodeMessage },
}

/// Abstract interface for the wire transport between nodes.
///
/// Connection establishment, reliable delivery and NAT traversal are the
/// implementation's concern. The node only relies on these primitives and
/// on the lifecycle events from [`PeerNetwork::subscribe_events`].
#[async_trait]
pub trait PeerNetwork: Send + Sync {
    /// Open (or reuse) a connection to a node.
    ///
    /// `via_tracker` names the tracker that introduced the node, for
    /// transports that signal through it. Callers bound the attempt with
    /// their own timeout; `timeout_hint` lets the transport give up earlier.
    async fn connect_to_node(
        &self,
        node_id: &NodeId,
        via_tracker: &TrackerId,
        timeout_hint: Duration,
    ) -> Result<()>;

    /// Send a message over an established connection.
    async fn send(&self, node_id: &NodeId, message: NodeMessage) -> Result<()>;

    /// Close the connection to a node. Closing an unknown connection is a no-op.
    async fn disconnect_from_node(&self, node_id: &NodeId, reason: &str) -> Result<()>;

    /// Latest round-trip time samples in milliseconds.
    fn get_rtts(&self) -> HashMap<NodeId, u64>;

    fn get_all_connection_node_ids(&self) -> Vec<NodeId>;

    fn subscribe_events(&self) -> broadcast::Receiver<PeerNetworkEvent>;

    /// Close every connection and stop emitting events.
    async fn stop(&self) -> Result<()>;
}
