//! Shared harness for multi-node tests over the in-process transport.

#![allow(dead_code)]

use monas_stream_node::infrastructure::{
    MemoryNetwork, MemoryTracker, MemoryTrackerClient, MemoryTransport,
};
use monas_stream_node::{
    MessageId, MessageRef, Node, NodeConfig, NodeEvent, StreamMessage, StreamPartId, TrackerInfo,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub struct TestNet {
    pub network: Arc<MemoryNetwork>,
    pub trackers: Vec<Arc<MemoryTracker>>,
}

pub struct TestNode {
    pub node: Node,
    pub transport: Arc<MemoryTransport>,
    pub tracker_client: Arc<MemoryTrackerClient>,
    pub events: Arc<Mutex<Vec<NodeEvent>>>,
}

impl TestNet {
    pub fn new(trackers: usize) -> Self {
        Self {
            network: MemoryNetwork::new(),
            trackers: (0..trackers)
                .map(|i| MemoryTracker::new(format!("tracker-{i}")))
                .collect(),
        }
    }

    pub fn tracker_infos(&self) -> Vec<TrackerInfo> {
        self.trackers.iter().map(|t| t.info().clone()).collect()
    }

    /// Short timers so that tests settle quickly.
    pub fn config(&self, node_id: &str) -> NodeConfig {
        NodeConfig {
            node_id: Some(node_id.to_string()),
            trackers: self.tracker_infos(),
            node_connect_timeout_ms: 1_000,
            proxy_response_timeout_ms: 1_000,
            disconnection_wait_time_ms: 200,
            tracker_connection_maintenance_interval_ms: 200,
            status_interval_ms: 1_000,
            instruction_retry_interval_ms: 1_000,
            proxy_reconnection_interval_ms: 200,
            ..NodeConfig::default()
        }
    }

    pub fn start_node(&self, node_id: &str) -> TestNode {
        self.start_node_with(self.config(node_id))
    }

    pub fn start_node_with(&self, config: NodeConfig) -> TestNode {
        let node_id = config.node_id.clone().unwrap_or_default();
        let transport = self.network.transport(node_id.clone());
        let tracker_client = MemoryTrackerClient::new(node_id, &self.trackers);
        let node = Node::new(config, transport.clone(), tracker_client.clone());
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut rx = node.subscribe_events();
        let recorded = events.clone();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                recorded.lock().push(event);
            }
        });
        node.start();
        TestNode {
            node,
            transport,
            tracker_client,
            events,
        }
    }
}

impl TestNode {
    pub fn id(&self) -> String {
        self.node.node_id().to_string()
    }

    /// Messages delivered for the first time on this node.
    pub fn received(&self, spid: &StreamPartId) -> Vec<StreamMessage> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                NodeEvent::UnseenMessageReceived { message, .. }
                    if message.stream_part() == spid =>
                {
                    Some(message.clone())
                }
                _ => None,
            })
            .collect()
    }

    pub fn has_event(&self, predicate: impl Fn(&NodeEvent) -> bool) -> bool {
        self.events.lock().iter().any(predicate)
    }
}

pub fn spid(stream: &str, partition: u32) -> StreamPartId {
    StreamPartId::new(stream, partition).unwrap()
}

/// Message `seq` of a single publisher chain, linked to its predecessor.
pub fn message(spid: &StreamPartId, publisher: &str, seq: u32) -> StreamMessage {
    StreamMessage::new(
        MessageId::new(spid.clone(), 1_000, seq, publisher, "chain"),
        seq.checked_sub(1).map(|prev| MessageRef::new(1_000, prev)),
        format!("payload {seq}").into_bytes(),
    )
}

/// Polls `condition` until it holds, panicking after five seconds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
