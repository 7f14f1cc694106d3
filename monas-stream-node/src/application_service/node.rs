//! Stream Node - orchestrator wiring the overlay components together.

use super::config::NodeConfig;
use super::disconnection_manager::DisconnectionManager;
use super::propagation::Propagation;
use super::proxy_connection_manager::{
    ProxyConnectionConfig, ProxyConnectionError, ProxyStreamConnectionManager,
};
use super::tracker_manager::{StatusDescriptor, StreamSubscriber, TrackerManager};
use super::SharedStreamManager;
use crate::domain::duplicate_detector::{DuplicateCheck, SequenceError};
use crate::domain::events::NodeEvent;
use crate::domain::message::StreamMessage;
use crate::domain::protocol::{NodeMessage, ProxyDirection};
use crate::domain::stream_manager::StreamManager;
use crate::domain::stream_part::{InvalidStreamPartId, NodeId, StreamPartId, TrackerId};
use crate::infrastructure::metrics::{Metrics, MetricsContext, MetricsReport};
use crate::port::peer_discovery::PeerDiscovery;
use crate::port::peer_network::{PeerNetwork, PeerNetworkEvent};
use crate::port::tracker_network::{TrackerNetwork, TrackerNetworkEvent};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const LATENCY_SMOOTHING: f64 = 0.8;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node is stopped")]
    Stopped,
    #[error(transparent)]
    InvalidStreamPart(#[from] InvalidStreamPartId),
    #[error("stream part {0} is handled through a proxy connection")]
    StreamBehindProxy(StreamPartId),
    #[error(transparent)]
    Proxy(#[from] ProxyConnectionError),
}

/// How an inbound data message was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataReceivedOutcome {
    Unseen,
    /// Delivered, but its predecessor was not the last accepted message.
    GapMismatch,
    Duplicate,
    InvalidNumbering,
    /// Proxy-only stream part and the sender holds no inbound relation.
    RejectedSender,
    /// The stream part went away while the message was being handled.
    NotSetUp,
    InvalidStreamPart,
    Stopped,
}

/// An overlay node.
///
/// Cheap to clone; all clones drive the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    node_id: NodeId,
    config: NodeConfig,
    streams: SharedStreamManager,
    network: Arc<dyn PeerNetwork>,
    tracker_network: Arc<dyn TrackerNetwork>,
    tracker_manager: Arc<TrackerManager>,
    discovery: Arc<dyn PeerDiscovery>,
    propagation: Propagation,
    disconnection_manager: DisconnectionManager,
    proxy_manager: Arc<ProxyStreamConnectionManager>,
    events: broadcast::Sender<NodeEvent>,
    metrics_context: MetricsContext,
    metrics: Arc<Metrics>,
    extra_metadata: Arc<Mutex<serde_json::Map<String, serde_json::Value>>>,
    average_latency: Mutex<Option<f64>>,
    started: AtomicBool,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Node {
    /// Create a node that discovers peers through its trackers.
    pub fn new(
        config: NodeConfig,
        network: Arc<dyn PeerNetwork>,
        tracker_network: Arc<dyn TrackerNetwork>,
    ) -> Self {
        Self::build(config, network, tracker_network, None)
    }

    /// Create a node with an alternative peer discovery strategy.
    pub fn with_discovery(
        config: NodeConfig,
        network: Arc<dyn PeerNetwork>,
        tracker_network: Arc<dyn TrackerNetwork>,
        discovery: Arc<dyn PeerDiscovery>,
    ) -> Self {
        Self::build(config, network, tracker_network, Some(discovery))
    }

    fn build(
        config: NodeConfig,
        network: Arc<dyn PeerNetwork>,
        tracker_network: Arc<dyn TrackerNetwork>,
        discovery: Option<Arc<dyn PeerDiscovery>>,
    ) -> Self {
        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let streams: SharedStreamManager = Arc::new(Mutex::new(StreamManager::new()));
        let metrics_context = MetricsContext::new();
        let extra_metadata = Arc::new(Mutex::new(config.extra_metadata.clone()));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let tracker_manager = Arc::new(TrackerManager::new(
            node_id.clone(),
            config.trackers.clone(),
            tracker_network.clone(),
            network.clone(),
            streams.clone(),
            StatusDescriptor {
                started: now_millis(),
                location: config.location.clone(),
                extra: extra_metadata.clone(),
            },
            config.rtt_update_interval(),
            metrics_context.create("tracker_manager"),
        ));
        let discovery: Arc<dyn PeerDiscovery> = match discovery {
            Some(discovery) => discovery,
            None => tracker_manager.clone(),
        };
        let propagation = Propagation::new(
            streams.clone(),
            network.clone(),
            config.propagation.clone(),
            metrics_context.create("propagation"),
        );
        let disconnection_manager = DisconnectionManager::new(
            streams.clone(),
            network.clone(),
            config.disconnection_wait_time(),
            config.disconnection_sweep_interval(),
        );
        let proxy_manager = Arc::new(ProxyStreamConnectionManager::new(
            node_id.clone(),
            streams.clone(),
            network.clone(),
            tracker_manager.clone(),
            events.clone(),
            ProxyConnectionConfig {
                accept_proxy_connections: config.accept_proxy_connections,
                node_connect_timeout: config.node_connect_timeout(),
                response_timeout: config.proxy_response_timeout(),
                reconnection_interval: config.proxy_reconnection_interval(),
            },
        ));

        Self {
            inner: Arc::new(NodeInner {
                metrics: metrics_context.create("node"),
                node_id,
                config,
                streams,
                network,
                tracker_network,
                tracker_manager,
                discovery,
                propagation,
                disconnection_manager,
                proxy_manager,
                events,
                metrics_context,
                extra_metadata,
                average_latency: Mutex::new(None),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Get the node ID.
    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    /// Start event handling, tracker sessions and background maintenance.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Starting stream node {}", self.inner.node_id);
        self.inner.disconnection_manager.start();

        let handles = vec![
            self.spawn_network_event_loop(),
            self.spawn_tracker_event_loop(),
            self.spawn_tracker_maintenance(),
            self.spawn_status_reporting(),
            self.spawn_instruction_retries(),
        ];
        self.inner.tasks.lock().extend(handles);
    }

    fn spawn_network_event_loop(&self) -> JoinHandle<()> {
        let mut event_rx = self.inner.network.subscribe_events();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tracing::debug!("Started network event handler");
            loop {
                match event_rx.recv().await {
                    Ok(event) => inner.handle_network_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Network event handler lagged, missed {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::debug!("Network event channel closed, stopping handler");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_tracker_event_loop(&self) -> JoinHandle<()> {
        let mut event_rx = self.inner.tracker_network.subscribe_events();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tracing::debug!("Started tracker event handler");
            loop {
                match event_rx.recv().await {
                    Ok(event) => inner.handle_tracker_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Tracker event handler lagged, missed {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::debug!("Tracker event channel closed, stopping handler");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_tracker_maintenance(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let period = self.inner.config.tracker_connection_maintenance_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                inner.tracker_manager.connect_to_trackers().await;
            }
        })
    }

    fn spawn_status_reporting(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let period = self.inner.config.status_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                tracing::trace!("Sending periodic status");
                inner.tracker_manager.send_all_statuses().await;
            }
        })
    }

    fn spawn_instruction_retries(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let period = self.inner.config.instruction_retry_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                for (instruction, tracker_id) in inner.tracker_manager.pending_retries() {
                    let outcome = inner
                        .tracker_manager
                        .handle_tracker_instruction(&instruction, &tracker_id, &*inner, true)
                        .await;
                    tracing::debug!(
                        "Re-applied instruction for {}: {:?}",
                        instruction.stream_part,
                        outcome
                    );
                }
            }
        })
    }

    /// Subscribe to a stream part and announce it to the owning tracker.
    pub async fn subscribe(&self, spid: &StreamPartId) -> Result<(), NodeError> {
        self.inner.ensure_running()?;
        spid.validate()?;
        if self.inner.streams.lock().is_behind_proxy(spid) {
            return Err(NodeError::StreamBehindProxy(spid.clone()));
        }
        if self.inner.set_up_stream_if_needed(spid) {
            tracing::info!("Subscribed to {}", spid);
            if let Err(e) = self.inner.discovery.discover_and_connect(spid).await {
                tracing::warn!("Peer discovery for {} failed: {}", spid, e);
            }
        }
        Ok(())
    }

    /// Leave a stream part. Former neighbors are disconnected after the wait time
    /// unless they share another stream part.
    pub async fn unsubscribe(&self, spid: &StreamPartId) -> Result<(), NodeError> {
        self.inner.ensure_running()?;
        spid.validate()?;
        let removed = {
            let mut streams = self.inner.streams.lock();
            if !streams.is_set_up(spid) {
                return Ok(());
            }
            if streams.is_behind_proxy(spid) {
                return Err(NodeError::StreamBehindProxy(spid.clone()));
            }
            streams.remove_stream(spid)
        };
        tracing::info!("Unsubscribed from {}", spid);
        self.inner.propagation.forget_stream_part(spid);
        self.inner.tracker_manager.on_unsubscribe_from_stream(spid);
        self.inner.tracker_manager.send_stream_status(spid).await;
        for node in removed {
            self.inner
                .disconnection_manager
                .schedule_disconnection_if_no_shared_streams(&node);
        }
        Ok(())
    }

    /// Publish a locally originated message.
    pub async fn publish(&self, message: StreamMessage) -> Result<DataReceivedOutcome, NodeError> {
        self.inner.ensure_running()?;
        message.validate()?;
        Ok(self.inner.on_data_received(message, None).await)
    }

    pub async fn join_as_pure_publisher(
        &self,
        spid: &StreamPartId,
        target: &NodeId,
    ) -> Result<(), NodeError> {
        self.join_proxy(spid, target, ProxyDirection::Publish).await
    }

    pub async fn leave_pure_publishing(
        &self,
        spid: &StreamPartId,
        target: &NodeId,
    ) -> Result<(), NodeError> {
        self.leave_proxy(spid, target).await
    }

    pub async fn join_as_pure_subscriber(
        &self,
        spid: &StreamPartId,
        target: &NodeId,
    ) -> Result<(), NodeError> {
        self.join_proxy(spid, target, ProxyDirection::Subscribe).await
    }

    pub async fn leave_pure_subscribing(
        &self,
        spid: &StreamPartId,
        target: &NodeId,
    ) -> Result<(), NodeError> {
        self.leave_proxy(spid, target).await
    }

    async fn join_proxy(
        &self,
        spid: &StreamPartId,
        target: &NodeId,
        direction: ProxyDirection,
    ) -> Result<(), NodeError> {
        self.inner.ensure_running()?;
        spid.validate()?;
        self.inner
            .proxy_manager
            .open_connection(spid, target, direction)
            .await?;
        self.inner
            .disconnection_manager
            .cancel_scheduled_disconnection(target);
        Ok(())
    }

    async fn leave_proxy(&self, spid: &StreamPartId, target: &NodeId) -> Result<(), NodeError> {
        self.inner.ensure_running()?;
        self.inner
            .proxy_manager
            .close_connection(spid, target)
            .await?;
        if !self.inner.streams.lock().is_set_up(spid) {
            self.inner.propagation.forget_stream_part(spid);
        }
        self.inner
            .disconnection_manager
            .schedule_disconnection_if_no_shared_streams(target);
        Ok(())
    }

    /// Inbound data callback of the transport.
    pub async fn on_data_received(
        &self,
        message: StreamMessage,
        source: Option<NodeId>,
    ) -> DataReceivedOutcome {
        self.inner.on_data_received(message, source).await
    }

    /// Cleans up every relation with a node whose connection went away.
    pub async fn on_peer_disconnected(&self, node: &NodeId) {
        self.inner.on_peer_disconnected(node).await;
    }

    pub fn get_spids(&self) -> Vec<StreamPartId> {
        self.inner.streams.lock().get_spids()
    }

    pub fn is_subscribed(&self, spid: &StreamPartId) -> bool {
        self.inner.streams.lock().is_set_up(spid)
    }

    pub fn is_behind_proxy(&self, spid: &StreamPartId) -> bool {
        self.inner.streams.lock().is_behind_proxy(spid)
    }

    pub fn get_neighbors(&self, spid: &StreamPartId) -> Vec<NodeId> {
        self.inner.streams.lock().get_neighbors(spid)
    }

    pub fn get_inbound_only_nodes(&self, spid: &StreamPartId) -> Vec<NodeId> {
        self.inner.streams.lock().get_inbound_only_nodes(spid)
    }

    pub fn get_outbound_only_nodes(&self, spid: &StreamPartId) -> Vec<NodeId> {
        self.inner.streams.lock().get_outbound_only_nodes(spid)
    }

    pub fn get_all_nodes(&self) -> Vec<NodeId> {
        self.inner.streams.lock().get_all_nodes()
    }

    pub fn set_extra_metadata(&self, key: &str, value: serde_json::Value) {
        self.inner
            .extra_metadata
            .lock()
            .insert(key.to_string(), value);
    }

    pub fn metrics_report(&self) -> MetricsReport {
        self.inner.metrics_context.report()
    }

    /// Stop the node: proxies, scheduled disconnects, transport, then trackers.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Stopping stream node {}", self.inner.node_id);
        for handle in self.inner.tasks.lock().drain(..) {
            handle.abort();
        }
        self.inner.proxy_manager.stop();
        self.inner.disconnection_manager.stop();
        if let Err(e) = self.inner.network.stop().await {
            tracing::warn!("Failed to stop peer network: {}", e);
        }
        self.inner.tracker_manager.stop().await;
    }
}

impl NodeInner {
    fn ensure_running(&self) -> Result<(), NodeError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(NodeError::Stopped);
        }
        Ok(())
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    /// Returns true if the stream part was newly set up.
    fn set_up_stream_if_needed(&self, spid: &StreamPartId) -> bool {
        let mut streams = self.streams.lock();
        if streams.is_set_up(spid) {
            return false;
        }
        streams.set_up_stream(spid, false).is_ok()
    }

    async fn handle_network_event(&self, event: PeerNetworkEvent) {
        match event {
            PeerNetworkEvent::NodeConnected(node_id) => {
                tracing::debug!("Node {} connected", node_id);
                self.emit(NodeEvent::NodeConnected { node_id });
            }
            PeerNetworkEvent::NodeDisconnected(node_id) => {
                self.on_peer_disconnected(&node_id).await;
            }
            PeerNetworkEvent::MessageReceived { from, message } => match message {
                NodeMessage::Data(data) => {
                    self.on_data_received(data, Some(from)).await;
                }
                NodeMessage::ProxyConnectionRequest(request) => {
                    self.proxy_manager.process_request(&from, request).await;
                    self.disconnection_manager
                        .schedule_disconnection_if_no_shared_streams(&from);
                }
                NodeMessage::ProxyConnectionResponse(response) => {
                    self.proxy_manager.process_response(&from, response);
                }
                NodeMessage::LeaveRequest(request) => {
                    self.proxy_manager.process_leave_request(&from, &request);
                    self.disconnection_manager
                        .schedule_disconnection_if_no_shared_streams(&from);
                }
            },
        }
    }

    async fn handle_tracker_event(self: &Arc<Self>, event: TrackerNetworkEvent) {
        match event {
            TrackerNetworkEvent::ConnectedToTracker(tracker_id) => {
                self.tracker_manager.on_connected_to_tracker(&tracker_id).await;
            }
            TrackerNetworkEvent::TrackerDisconnected(tracker_id) => {
                self.tracker_manager.on_tracker_disconnected(&tracker_id);
            }
            TrackerNetworkEvent::InstructionReceived {
                tracker_id,
                instruction,
            } => {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    let outcome = inner
                        .tracker_manager
                        .handle_tracker_instruction(&instruction, &tracker_id, &*inner, false)
                        .await;
                    tracing::debug!(
                        "Instruction {} for {} from {}: {:?}",
                        instruction.counter,
                        instruction.stream_part,
                        tracker_id,
                        outcome
                    );
                });
            }
        }
    }

    async fn on_data_received(
        &self,
        message: StreamMessage,
        source: Option<NodeId>,
    ) -> DataReceivedOutcome {
        if self.stopped.load(Ordering::SeqCst) {
            return DataReceivedOutcome::Stopped;
        }
        self.metrics.record("data_received", 1.0);
        if let Err(e) = message.validate() {
            tracing::warn!("Dropping message with invalid stream part: {}", e);
            return DataReceivedOutcome::InvalidStreamPart;
        }
        let spid = message.stream_part().clone();
        self.emit(NodeEvent::MessageReceived {
            message: message.clone(),
            source: source.clone(),
        });

        let newly_set_up = {
            let mut streams = self.streams.lock();
            if let Some(sender) = &source {
                if streams.is_behind_proxy(&spid) && !streams.has_inbound_connection(&spid, sender)
                {
                    tracing::warn!(
                        "Dropping message for proxied {} from {} without an inbound connection",
                        spid,
                        sender
                    );
                    return DataReceivedOutcome::RejectedSender;
                }
            }
            !streams.is_set_up(&spid) && streams.set_up_stream(&spid, false).is_ok()
        };
        if newly_set_up {
            tracing::info!("Joining {} after receiving data for it", spid);
            let discovery = self.discovery.clone();
            let lazily_joined = spid.clone();
            tokio::spawn(async move {
                if let Err(e) = discovery.discover_and_connect(&lazily_joined).await {
                    tracing::warn!("Peer discovery for {} failed: {}", lazily_joined, e);
                }
            });
        }

        let check = self
            .streams
            .lock()
            .mark_and_check_duplicate(&message.message_id, message.prev_msg_ref.as_ref());
        let check = match check {
            Ok(check) => check,
            Err(e) => {
                tracing::debug!("Dropping message: {}", e);
                return DataReceivedOutcome::NotSetUp;
            }
        };
        let outcome = match &check {
            DuplicateCheck::New => DataReceivedOutcome::Unseen,
            DuplicateCheck::Duplicate => {
                self.metrics.record("ignored_duplicate", 1.0);
                tracing::trace!("Ignoring duplicate {}", message.message_id);
                DataReceivedOutcome::Duplicate
            }
            DuplicateCheck::Error(error @ SequenceError::InvalidNumbering { .. }) => {
                self.metrics.record("invalid_numbering", 1.0);
                tracing::warn!("Dropping {}: {}", message.message_id, error);
                DataReceivedOutcome::InvalidNumbering
            }
            DuplicateCheck::Error(error @ SequenceError::GapMismatch { .. }) => {
                self.metrics.record("gap_mismatch", 1.0);
                tracing::warn!("Gap before {}: {}", message.message_id, error);
                self.emit(NodeEvent::GapDetected {
                    message: message.clone(),
                    source: source.clone(),
                    error: error.clone(),
                });
                DataReceivedOutcome::GapMismatch
            }
        };
        if !check.is_deliverable() {
            return outcome;
        }

        self.record_latency(&message);
        self.emit(NodeEvent::UnseenMessageReceived {
            message: message.clone(),
            source: source.clone(),
        });
        let unreachable = self
            .propagation
            .feed_unseen_message(&message, source.as_ref())
            .await;
        self.drop_unreachable(unreachable).await;
        outcome
    }

    fn record_latency(&self, message: &StreamMessage) {
        let sample = now_millis().saturating_sub(message.timestamp()) as f64;
        let mut average = self.average_latency.lock();
        let updated = match *average {
            Some(previous) => LATENCY_SMOOTHING * previous + (1.0 - LATENCY_SMOOTHING) * sample,
            None => sample,
        };
        *average = Some(updated);
        self.metrics.set("latency_ms", updated);
    }

    /// Forced cleanup of neighbors that kept failing delivery.
    async fn drop_unreachable(&self, nodes: Vec<NodeId>) {
        for node in nodes {
            tracing::warn!("Dropping unresponsive node {}", node);
            self.on_peer_disconnected(&node).await;
            if let Err(e) = self.network.disconnect_from_node(&node, "unresponsive").await {
                tracing::debug!("Failed to disconnect {}: {}", node, e);
            }
        }
    }

    async fn on_peer_disconnected(&self, node: &NodeId) {
        self.metrics.record("node_disconnect", 1.0);
        let (spids, proxied) = self.streams.lock().remove_node_from_all_streams(node);
        self.propagation.forget_node(node);
        self.disconnection_manager.cancel_scheduled_disconnection(node);
        tracing::info!(
            "Node {} disconnected, affected stream parts: {:?}",
            node,
            spids
        );
        for spid in &spids {
            self.tracker_manager.send_stream_status(spid).await;
        }
        for spid in &proxied {
            self.proxy_manager.reconnect(node, spid);
        }
        self.emit(NodeEvent::NodeDisconnected {
            node_id: node.clone(),
        });
    }
}

#[async_trait]
impl StreamSubscriber for NodeInner {
    async fn subscribe_to_stream_if_have_not_yet(&self, spid: &StreamPartId) {
        if self.streams.lock().is_behind_proxy(spid) {
            tracing::warn!("Ignoring instruction for proxied {}", spid);
            return;
        }
        if self.set_up_stream_if_needed(spid) {
            tracing::info!("Subscribed to {} on tracker instruction", spid);
        }
    }

    async fn connect_to_node(&self, node_id: &NodeId, tracker_id: &TrackerId) -> Result<()> {
        let timeout = self.config.node_connect_timeout();
        match tokio::time::timeout(
            timeout,
            self.network.connect_to_node(node_id, tracker_id, timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "connecting to {} timed out after {:?}",
                node_id,
                timeout
            )),
        }
    }

    async fn subscribe_to_stream_on_node(&self, node_id: &NodeId, spid: &StreamPartId) {
        self.disconnection_manager
            .cancel_scheduled_disconnection(node_id);
        if let Err(e) = self.streams.lock().add_neighbor(spid, node_id) {
            tracing::debug!("Could not add neighbor {}: {}", node_id, e);
            return;
        }
        let unreachable = self.propagation.on_neighbor_joined(node_id, spid).await;
        self.drop_unreachable(unreachable).await;
        self.emit(NodeEvent::NodeSubscribed {
            node_id: node_id.clone(),
            stream_part: spid.clone(),
        });
    }

    async fn unsubscribe_from_stream_on_node(&self, node_id: &NodeId, spid: &StreamPartId) {
        self.streams.lock().remove_node_from_stream(spid, node_id);
        tracing::debug!("Node {} unsubscribed from {}", node_id, spid);
        self.emit(NodeEvent::NodeUnsubscribed {
            node_id: node_id.clone(),
            stream_part: spid.clone(),
        });
        self.disconnection_manager
            .schedule_disconnection_if_no_shared_streams(node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::{MessageId, MessageRef};
    use crate::domain::protocol::{InstructionMessage, TrackerInfo};
    use crate::test_utils::{MockPeerNetwork, MockTrackerNetwork};

    fn spid() -> StreamPartId {
        StreamPartId::new("stream", 0).unwrap()
    }

    fn message(timestamp: u64, sequence_number: u32, prev: Option<(u64, u32)>) -> StreamMessage {
        StreamMessage::new(
            MessageId::new(spid(), timestamp, sequence_number, "publisher", "chain"),
            prev.map(|(t, s)| MessageRef::new(t, s)),
            b"hello".to_vec(),
        )
    }

    fn node_with(network: Arc<MockPeerNetwork>) -> (Node, Arc<MockTrackerNetwork>) {
        let tracker_network = Arc::new(MockTrackerNetwork::new());
        let config = NodeConfig {
            node_id: Some("node".to_string()),
            trackers: vec![TrackerInfo {
                id: "tracker".to_string(),
                address: "memory://tracker".to_string(),
            }],
            ..NodeConfig::default()
        };
        let node = Node::new(config, network, tracker_network.clone());
        (node, tracker_network)
    }

    fn drain(events: &mut broadcast::Receiver<NodeEvent>) -> Vec<NodeEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }

    fn unseen_count(events: &[NodeEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, NodeEvent::UnseenMessageReceived { .. }))
            .count()
    }

    #[tokio::test]
    async fn unseen_messages_are_emitted_once_and_propagated() {
        let network = Arc::new(MockPeerNetwork::new());
        let (node, _) = node_with(network.clone());
        let mut events = node.subscribe_events();
        node.subscribe(&spid()).await.unwrap();
        node.inner
            .streams
            .lock()
            .add_neighbor(&spid(), &"a".to_string())
            .unwrap();
        node.inner
            .streams
            .lock()
            .add_neighbor(&spid(), &"b".to_string())
            .unwrap();

        let first = message(1, 0, None);
        assert_eq!(
            node.on_data_received(first.clone(), Some("a".to_string())).await,
            DataReceivedOutcome::Unseen
        );
        for _ in 0..3 {
            assert_eq!(
                node.on_data_received(first.clone(), Some("b".to_string())).await,
                DataReceivedOutcome::Duplicate
            );
        }
        assert_eq!(
            node.on_data_received(message(2, 0, Some((1, 0))), Some("a".to_string()))
                .await,
            DataReceivedOutcome::Unseen
        );

        assert_eq!(unseen_count(&drain(&mut events)), 2);
        let sent = network.sent_messages.lock().await.clone();
        assert!(sent.iter().all(|(to, _)| to == "b"));
        assert_eq!(sent.len(), 2);
        let report = node.metrics_report();
        assert_eq!(report.recorded("node", "ignored_duplicate").unwrap().count, 3);
        assert!(report.fixed("node", "latency_ms").is_some());
    }

    #[tokio::test]
    async fn gap_mismatch_is_delivered_and_flagged() {
        let (node, _) = node_with(Arc::new(MockPeerNetwork::new()));
        let mut events = node.subscribe_events();
        node.publish(message(1, 0, None)).await.unwrap();
        let outcome = node.publish(message(5, 0, Some((4, 0)))).await.unwrap();
        assert_eq!(outcome, DataReceivedOutcome::GapMismatch);

        let emitted = drain(&mut events);
        assert_eq!(unseen_count(&emitted), 2);
        assert!(emitted
            .iter()
            .any(|e| matches!(e, NodeEvent::GapDetected { .. })));
    }

    #[tokio::test]
    async fn invalid_numbering_is_dropped() {
        let network = Arc::new(MockPeerNetwork::new());
        let (node, _) = node_with(network.clone());
        node.subscribe(&spid()).await.unwrap();
        node.inner
            .streams
            .lock()
            .add_neighbor(&spid(), &"a".to_string())
            .unwrap();
        let mut events = node.subscribe_events();
        let outcome = node.publish(message(3, 0, Some((3, 0)))).await.unwrap();
        assert_eq!(outcome, DataReceivedOutcome::InvalidNumbering);
        assert_eq!(unseen_count(&drain(&mut events)), 0);
        assert!(network.sent_messages.lock().await.is_empty());
    }

    #[tokio::test]
    async fn data_for_unknown_stream_joins_it() {
        let (node, _) = node_with(Arc::new(MockPeerNetwork::new()));
        assert!(!node.is_subscribed(&spid()));
        let outcome = node
            .on_data_received(message(1, 0, None), Some("a".to_string()))
            .await;
        assert_eq!(outcome, DataReceivedOutcome::Unseen);
        assert!(node.is_subscribed(&spid()));
    }

    #[tokio::test]
    async fn proxied_stream_drops_data_from_unrelated_sender() {
        let (node, _) = node_with(Arc::new(MockPeerNetwork::new()));
        node.inner
            .streams
            .lock()
            .set_up_stream(&spid(), true)
            .unwrap();
        let outcome = node
            .on_data_received(message(1, 0, None), Some("stranger".to_string()))
            .await;
        assert_eq!(outcome, DataReceivedOutcome::RejectedSender);

        node.inner
            .streams
            .lock()
            .add_inbound_node(&spid(), &"proxy".to_string())
            .unwrap();
        let outcome = node
            .on_data_received(message(1, 0, None), Some("proxy".to_string()))
            .await;
        assert_eq!(outcome, DataReceivedOutcome::Unseen);
    }

    #[tokio::test]
    async fn peer_disconnect_cleans_up_and_reports_status() {
        let network = Arc::new(MockPeerNetwork::new());
        let (node, tracker_network) = node_with(network);
        node.inner.tracker_manager.connect_to_trackers().await;
        node.subscribe(&spid()).await.unwrap();
        node.inner
            .streams
            .lock()
            .add_neighbor(&spid(), &"a".to_string())
            .unwrap();
        let statuses_before = tracker_network.statuses.lock().await.len();
        let mut events = node.subscribe_events();

        node.on_peer_disconnected(&"a".to_string()).await;

        assert!(node.get_neighbors(&spid()).is_empty());
        assert!(node.is_subscribed(&spid()));
        assert_eq!(
            tracker_network.statuses.lock().await.len(),
            statuses_before + 1
        );
        assert!(drain(&mut events)
            .iter()
            .any(|e| matches!(e, NodeEvent::NodeDisconnected { node_id } if node_id == "a")));
    }

    #[tokio::test]
    async fn repeated_send_failures_force_disconnect() {
        let network = Arc::new(MockPeerNetwork::new().with_failing_sends(&["dead"]));
        let (node, _) = node_with(network.clone());
        node.subscribe(&spid()).await.unwrap();
        node.inner
            .streams
            .lock()
            .add_neighbor(&spid(), &"dead".to_string())
            .unwrap();

        let mut prev = None;
        for seq in 0..100u32 {
            node.publish(message(1, seq, prev)).await.unwrap();
            prev = Some((1, seq));
        }
        assert!(node.get_neighbors(&spid()).is_empty());
        let disconnects = network.disconnect_calls.lock().await.clone();
        assert_eq!(disconnects, vec![("dead".to_string(), "unresponsive".to_string())]);
    }

    #[tokio::test]
    async fn instruction_applied_through_node_emits_subscribed() {
        let (node, _) = node_with(Arc::new(MockPeerNetwork::new()));
        let mut events = node.subscribe_events();
        let instruction = InstructionMessage {
            request_id: "req".to_string(),
            stream_part: spid(),
            node_ids: vec!["a".to_string()],
            counter: 1,
        };
        node.inner
            .tracker_manager
            .handle_tracker_instruction(&instruction, &"tracker".to_string(), &*node.inner, false)
            .await;
        assert_eq!(node.get_neighbors(&spid()), vec!["a"]);
        assert!(drain(&mut events).iter().any(|e| matches!(
            e,
            NodeEvent::NodeSubscribed { node_id, .. } if node_id == "a"
        )));
    }

    #[tokio::test]
    async fn unsubscribe_schedules_disconnects_for_former_neighbors() {
        let (node, _) = node_with(Arc::new(MockPeerNetwork::new()));
        node.subscribe(&spid()).await.unwrap();
        node.inner
            .streams
            .lock()
            .add_neighbor(&spid(), &"a".to_string())
            .unwrap();
        node.unsubscribe(&spid()).await.unwrap();
        assert!(!node.is_subscribed(&spid()));
        assert!(node
            .inner
            .disconnection_manager
            .is_scheduled(&"a".to_string()));
    }

    #[tokio::test]
    async fn unsubscribe_drops_retained_messages() {
        let (node, _) = node_with(Arc::new(MockPeerNetwork::new()));
        node.subscribe(&spid()).await.unwrap();
        node.publish(message(1, 0, None)).await.unwrap();
        assert_eq!(node.inner.propagation.retained_task_count(), 1);

        node.unsubscribe(&spid()).await.unwrap();
        assert_eq!(node.inner.propagation.retained_task_count(), 0);
    }

    #[tokio::test]
    async fn stopped_node_rejects_operations() {
        let (node, tracker_network) = node_with(Arc::new(MockPeerNetwork::new()));
        node.start();
        node.stop().await;
        assert!(matches!(node.subscribe(&spid()).await, Err(NodeError::Stopped)));
        assert!(matches!(
            node.publish(message(1, 0, None)).await,
            Err(NodeError::Stopped)
        ));
        assert!(*tracker_network.stopped.lock().await);
    }

    #[tokio::test]
    async fn subscribing_to_proxied_stream_is_local_misuse() {
        let (node, _) = node_with(Arc::new(MockPeerNetwork::new()));
        node.inner
            .streams
            .lock()
            .set_up_stream(&spid(), true)
            .unwrap();
        assert!(matches!(
            node.subscribe(&spid()).await,
            Err(NodeError::StreamBehindProxy(_))
        ));
    }
}
