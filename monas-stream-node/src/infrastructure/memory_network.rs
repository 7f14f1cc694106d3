//! In-process transport.
//!
//! A [`MemoryNetwork`] hub hands out one [`MemoryTransport`] per node. Each
//! transport implements [`PeerNetwork`]: connections are symmetric, both ends
//! observe connect and disconnect events, and messages are delivered only over
//! an open connection. Used by the simulation binary and integration tests.

use crate::domain::protocol::NodeMessage;
use crate::domain::stream_part::{NodeId, TrackerId};
use crate::port::peer_network::{PeerNetwork, PeerNetworkEvent};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, trace};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
struct Endpoint {
    events: broadcast::Sender<PeerNetworkEvent>,
    connections: Arc<Mutex<HashSet<NodeId>>>,
}

/// Registry of every transport attached to the same in-process network.
#[derive(Default)]
pub struct MemoryNetwork {
    endpoints: Mutex<HashMap<NodeId, Endpoint>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attaches a node and returns its transport.
    pub fn transport(self: &Arc<Self>, node_id: impl Into<NodeId>) -> Arc<MemoryTransport> {
        let node_id = node_id.into();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let endpoint = Endpoint {
            events,
            connections: Arc::new(Mutex::new(HashSet::new())),
        };
        self.endpoints
            .lock()
            .insert(node_id.clone(), endpoint.clone());
        Arc::new(MemoryTransport {
            node_id,
            hub: Arc::clone(self),
            endpoint,
            stopped: AtomicBool::new(false),
        })
    }

    fn endpoint(&self, node_id: &NodeId) -> Option<Endpoint> {
        self.endpoints.lock().get(node_id).cloned()
    }

    fn detach(&self, node_id: &NodeId) {
        self.endpoints.lock().remove(node_id);
    }
}

pub struct MemoryTransport {
    node_id: NodeId,
    hub: Arc<MemoryNetwork>,
    endpoint: Endpoint,
    stopped: AtomicBool,
}

impl MemoryTransport {
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn is_connected(&self, node_id: &NodeId) -> bool {
        self.endpoint.connections.lock().contains(node_id)
    }

    /// Drops the connection on both ends, emitting a disconnect event to each.
    fn sever(&self, peer_id: &NodeId) -> bool {
        if !self.endpoint.connections.lock().remove(peer_id) {
            return false;
        }
        let _ = self
            .endpoint
            .events
            .send(PeerNetworkEvent::NodeDisconnected(peer_id.clone()));
        if let Some(peer) = self.hub.endpoint(peer_id) {
            if peer.connections.lock().remove(&self.node_id) {
                let _ = peer
                    .events
                    .send(PeerNetworkEvent::NodeDisconnected(self.node_id.clone()));
            }
        }
        true
    }
}

#[async_trait]
impl PeerNetwork for MemoryTransport {
    async fn connect_to_node(
        &self,
        node_id: &NodeId,
        _via_tracker: &TrackerId,
        _timeout_hint: Duration,
    ) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(anyhow!("transport of {} is stopped", self.node_id));
        }
        if *node_id == self.node_id {
            return Err(anyhow!("refusing to connect {} to itself", node_id));
        }
        let peer = self
            .hub
            .endpoint(node_id)
            .ok_or_else(|| anyhow!("node {} is not reachable", node_id))?;
        if !self.endpoint.connections.lock().insert(node_id.clone()) {
            return Ok(());
        }
        peer.connections.lock().insert(self.node_id.clone());
        debug!(from = %self.node_id, to = %node_id, "Memory connection opened");
        let _ = self
            .endpoint
            .events
            .send(PeerNetworkEvent::NodeConnected(node_id.clone()));
        let _ = peer
            .events
            .send(PeerNetworkEvent::NodeConnected(self.node_id.clone()));
        Ok(())
    }

    async fn send(&self, node_id: &NodeId, message: NodeMessage) -> Result<()> {
        if !self.is_connected(node_id) {
            return Err(anyhow!("not connected to {}", node_id));
        }
        let peer = self
            .hub
            .endpoint(node_id)
            .ok_or_else(|| anyhow!("node {} left the network", node_id))?;
        trace!(from = %self.node_id, to = %node_id, kind = message.kind(), "Memory send");
        peer.events
            .send(PeerNetworkEvent::MessageReceived {
                from: self.node_id.clone(),
                message,
            })
            .map_err(|_| anyhow!("node {} is not listening", node_id))?;
        Ok(())
    }

    async fn disconnect_from_node(&self, node_id: &NodeId, reason: &str) -> Result<()> {
        if self.sever(node_id) {
            debug!(from = %self.node_id, to = %node_id, reason, "Memory connection closed");
        }
        Ok(())
    }

    fn get_rtts(&self) -> HashMap<NodeId, u64> {
        self.endpoint
            .connections
            .lock()
            .iter()
            .map(|node| (node.clone(), 0))
            .collect()
    }

    fn get_all_connection_node_ids(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.endpoint.connections.lock().iter().cloned().collect();
        nodes.sort();
        nodes
    }

    fn subscribe_events(&self) -> broadcast::Receiver<PeerNetworkEvent> {
        self.endpoint.events.subscribe()
    }

    async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for peer in self.get_all_connection_node_ids() {
            self.sever(&peer);
        }
        self.hub.detach(&self.node_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::{MessageId, StreamMessage};
    use crate::domain::stream_part::StreamPartId;

    fn data() -> NodeMessage {
        NodeMessage::Data(StreamMessage::new(
            MessageId::new(StreamPartId::new("s", 0).unwrap(), 1, 0, "p", "c"),
            None,
            vec![1, 2, 3],
        ))
    }

    #[tokio::test]
    async fn connect_is_symmetric_and_observed_by_both_ends() {
        let hub = MemoryNetwork::new();
        let a = hub.transport("a");
        let b = hub.transport("b");
        let mut a_events = a.subscribe_events();
        let mut b_events = b.subscribe_events();

        a.connect_to_node(&"b".to_string(), &String::new(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(b.is_connected(&"a".to_string()));
        assert_eq!(
            a_events.recv().await.unwrap(),
            PeerNetworkEvent::NodeConnected("b".to_string())
        );
        assert_eq!(
            b_events.recv().await.unwrap(),
            PeerNetworkEvent::NodeConnected("a".to_string())
        );

        a.connect_to_node(&"b".to_string(), &String::new(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(a_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_requires_connection() {
        let hub = MemoryNetwork::new();
        let a = hub.transport("a");
        let b = hub.transport("b");
        let mut b_events = b.subscribe_events();
        assert!(a.send(&"b".to_string(), data()).await.is_err());

        a.connect_to_node(&"b".to_string(), &String::new(), Duration::from_secs(1))
            .await
            .unwrap();
        a.send(&"b".to_string(), data()).await.unwrap();
        let _connected = b_events.recv().await.unwrap();
        match b_events.recv().await.unwrap() {
            PeerNetworkEvent::MessageReceived { from, message } => {
                assert_eq!(from, "a");
                assert_eq!(message, data());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_node_is_unreachable() {
        let hub = MemoryNetwork::new();
        let a = hub.transport("a");
        assert!(a
            .connect_to_node(&"ghost".to_string(), &String::new(), Duration::from_secs(1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn stop_disconnects_peers_and_detaches() {
        let hub = MemoryNetwork::new();
        let a = hub.transport("a");
        let b = hub.transport("b");
        a.connect_to_node(&"b".to_string(), &String::new(), Duration::from_secs(1))
            .await
            .unwrap();
        let mut b_events = b.subscribe_events();

        a.stop().await.unwrap();
        assert_eq!(
            b_events.recv().await.unwrap(),
            PeerNetworkEvent::NodeDisconnected("a".to_string())
        );
        assert!(b.get_all_connection_node_ids().is_empty());
        assert!(b
            .connect_to_node(&"a".to_string(), &String::new(), Duration::from_secs(1))
            .await
            .is_err());
    }
}
