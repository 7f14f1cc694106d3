//! Test utilities and mock implementations for unit testing.
//!
//! Mocks record what the component under test asked of them so tests can
//! assert on it afterwards.

use crate::application_service::tracker_manager::StreamSubscriber;
use crate::application_service::SharedStreamManager;
use crate::domain::protocol::{NodeMessage, StatusMessage, TrackerInfo};
use crate::domain::stream_part::{NodeId, StreamPartId, TrackerId};
use crate::port::peer_network::{PeerNetwork, PeerNetworkEvent};
use crate::port::tracker_network::{TrackerNetwork, TrackerNetworkEvent};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

// ============================================================================
// MockPeerNetwork
// ============================================================================

/// Type alias for recorded outbound messages.
pub type SentMessages = Arc<Mutex<Vec<(NodeId, NodeMessage)>>>;

/// Mock implementation of PeerNetwork for testing.
pub struct MockPeerNetwork {
    pub sent_messages: SentMessages,
    pub connect_calls: Arc<Mutex<Vec<(NodeId, TrackerId)>>>,
    pub disconnect_calls: Arc<Mutex<Vec<(NodeId, String)>>>,
    connections: parking_lot::Mutex<HashSet<NodeId>>,
    failing_sends: parking_lot::Mutex<HashSet<NodeId>>,
    unreachable: parking_lot::Mutex<HashSet<NodeId>>,
    rtts: HashMap<NodeId, u64>,
    events: broadcast::Sender<PeerNetworkEvent>,
}

impl Default for MockPeerNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPeerNetwork {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            sent_messages: Arc::new(Mutex::new(Vec::new())),
            connect_calls: Arc::new(Mutex::new(Vec::new())),
            disconnect_calls: Arc::new(Mutex::new(Vec::new())),
            connections: parking_lot::Mutex::new(HashSet::new()),
            failing_sends: parking_lot::Mutex::new(HashSet::new()),
            unreachable: parking_lot::Mutex::new(HashSet::new()),
            rtts: HashMap::new(),
            events,
        }
    }

    /// Sends to these nodes fail until reset with `set_send_failure`.
    pub fn with_failing_sends(self, nodes: &[&str]) -> Self {
        self.failing_sends
            .lock()
            .extend(nodes.iter().map(|n| n.to_string()));
        self
    }

    /// Connecting to these nodes fails.
    pub fn with_unreachable(self, nodes: &[&str]) -> Self {
        self.unreachable
            .lock()
            .extend(nodes.iter().map(|n| n.to_string()));
        self
    }

    pub fn with_rtts(self, rtts: &[(&str, u64)]) -> Self {
        Self {
            rtts: rtts.iter().map(|(n, r)| (n.to_string(), *r)).collect(),
            ..self
        }
    }

    pub fn set_send_failure(&self, node: &str, failing: bool) {
        let mut failing_sends = self.failing_sends.lock();
        if failing {
            failing_sends.insert(node.to_string());
        } else {
            failing_sends.remove(node);
        }
    }

    pub fn set_unreachable(&self, node: &str, unreachable: bool) {
        let mut nodes = self.unreachable.lock();
        if unreachable {
            nodes.insert(node.to_string());
        } else {
            nodes.remove(node);
        }
    }

    pub fn add_connection(&self, node: &str) {
        self.connections.lock().insert(node.to_string());
    }

    /// Injects a transport event as if it came from the wire.
    pub fn emit(&self, event: PeerNetworkEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl PeerNetwork for MockPeerNetwork {
    async fn connect_to_node(
        &self,
        node_id: &NodeId,
        via_tracker: &TrackerId,
        _timeout_hint: Duration,
    ) -> Result<()> {
        self.connect_calls
            .lock()
            .await
            .push((node_id.clone(), via_tracker.clone()));
        if self.unreachable.lock().contains(node_id) {
            return Err(anyhow!("node {} is unreachable", node_id));
        }
        self.connections.lock().insert(node_id.clone());
        Ok(())
    }

    async fn send(&self, node_id: &NodeId, message: NodeMessage) -> Result<()> {
        if self.failing_sends.lock().contains(node_id) {
            return Err(anyhow!("send to {} failed", node_id));
        }
        self.sent_messages
            .lock()
            .await
            .push((node_id.clone(), message));
        Ok(())
    }

    async fn disconnect_from_node(&self, node_id: &NodeId, reason: &str) -> Result<()> {
        self.connections.lock().remove(node_id);
        self.disconnect_calls
            .lock()
            .await
            .push((node_id.clone(), reason.to_string()));
        Ok(())
    }

    fn get_rtts(&self) -> HashMap<NodeId, u64> {
        self.rtts.clone()
    }

    fn get_all_connection_node_ids(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.connections.lock().iter().cloned().collect();
        nodes.sort();
        nodes
    }

    fn subscribe_events(&self) -> broadcast::Receiver<PeerNetworkEvent> {
        self.events.subscribe()
    }

    async fn stop(&self) -> Result<()> {
        self.connections.lock().clear();
        Ok(())
    }
}

// ============================================================================
// MockTrackerNetwork
// ============================================================================

/// Mock implementation of TrackerNetwork for testing.
pub struct MockTrackerNetwork {
    pub statuses: Arc<Mutex<Vec<(TrackerId, StatusMessage)>>>,
    pub disconnected: Arc<Mutex<Vec<TrackerId>>>,
    pub stopped: Arc<Mutex<bool>>,
    unreachable: parking_lot::Mutex<HashSet<TrackerId>>,
    events: broadcast::Sender<TrackerNetworkEvent>,
}

impl Default for MockTrackerNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTrackerNetwork {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            statuses: Arc::new(Mutex::new(Vec::new())),
            disconnected: Arc::new(Mutex::new(Vec::new())),
            stopped: Arc::new(Mutex::new(false)),
            unreachable: parking_lot::Mutex::new(HashSet::new()),
            events,
        }
    }

    pub fn set_unreachable(&self, tracker_id: &str, unreachable: bool) {
        let mut trackers = self.unreachable.lock();
        if unreachable {
            trackers.insert(tracker_id.to_string());
        } else {
            trackers.remove(tracker_id);
        }
    }

    pub fn emit(&self, event: TrackerNetworkEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl TrackerNetwork for MockTrackerNetwork {
    async fn connect_to_tracker(&self, tracker: &TrackerInfo) -> Result<()> {
        if self.unreachable.lock().contains(&tracker.id) {
            return Err(anyhow!("tracker {} is unreachable", tracker.id));
        }
        Ok(())
    }

    async fn disconnect_from_tracker(&self, tracker_id: &TrackerId) -> Result<()> {
        self.disconnected.lock().await.push(tracker_id.clone());
        Ok(())
    }

    async fn send_status(&self, tracker_id: &TrackerId, status: StatusMessage) -> Result<()> {
        self.statuses
            .lock()
            .await
            .push((tracker_id.clone(), status));
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TrackerNetworkEvent> {
        self.events.subscribe()
    }

    async fn stop(&self) -> Result<()> {
        *self.stopped.lock().await = true;
        Ok(())
    }
}

// ============================================================================
// RecordingStreamSubscriber
// ============================================================================

/// StreamSubscriber that applies instructions straight to a stream manager.
pub struct RecordingStreamSubscriber {
    streams: SharedStreamManager,
    pub unsubscribed: Arc<Mutex<Vec<(NodeId, StreamPartId)>>>,
    unreachable: parking_lot::Mutex<HashSet<NodeId>>,
    leave_on_connect: parking_lot::Mutex<Option<StreamPartId>>,
}

impl RecordingStreamSubscriber {
    pub fn new(streams: SharedStreamManager) -> Self {
        Self {
            streams,
            unsubscribed: Arc::new(Mutex::new(Vec::new())),
            unreachable: parking_lot::Mutex::new(HashSet::new()),
            leave_on_connect: parking_lot::Mutex::new(None),
        }
    }

    pub fn set_unreachable(&self, node: &str) {
        self.unreachable.lock().insert(node.to_string());
    }

    pub fn set_reachable(&self, node: &str) {
        self.unreachable.lock().remove(node);
    }

    /// The next connection attempt tears the stream part down before returning.
    pub fn unsubscribe_during_connect(&self, spid: &StreamPartId) {
        *self.leave_on_connect.lock() = Some(spid.clone());
    }
}

#[async_trait]
impl StreamSubscriber for RecordingStreamSubscriber {
    async fn subscribe_to_stream_if_have_not_yet(&self, spid: &StreamPartId) {
        let mut streams = self.streams.lock();
        if !streams.is_set_up(spid) {
            let _ = streams.set_up_stream(spid, false);
        }
    }

    async fn connect_to_node(&self, node_id: &NodeId, _tracker_id: &TrackerId) -> Result<()> {
        if let Some(spid) = self.leave_on_connect.lock().take() {
            self.streams.lock().remove_stream(&spid);
        }
        if self.unreachable.lock().contains(node_id) {
            return Err(anyhow!("node {} is unreachable", node_id));
        }
        Ok(())
    }

    async fn subscribe_to_stream_on_node(&self, node_id: &NodeId, spid: &StreamPartId) {
        let _ = self.streams.lock().add_neighbor(spid, node_id);
    }

    async fn unsubscribe_from_stream_on_node(&self, node_id: &NodeId, spid: &StreamPartId) {
        self.streams.lock().remove_node_from_stream(spid, node_id);
        self.unsubscribed
            .lock()
            .await
            .push((node_id.clone(), spid.clone()));
    }
}
