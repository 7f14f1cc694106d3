//! Debounced disconnection of peers that no longer share any stream part.

use super::SharedStreamManager;
use crate::domain::stream_part::NodeId;
use crate::port::peer_network::PeerNetwork;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const DISCONNECTION_REASON: &str = "no shared streams";

pub struct DisconnectionManager {
    streams: SharedStreamManager,
    network: Arc<dyn PeerNetwork>,
    disconnection_delay: Duration,
    sweep_interval: Duration,
    timeouts: Arc<Mutex<HashMap<NodeId, JoinHandle<()>>>>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl DisconnectionManager {
    pub fn new(
        streams: SharedStreamManager,
        network: Arc<dyn PeerNetwork>,
        disconnection_delay: Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            streams,
            network,
            disconnection_delay,
            sweep_interval,
            timeouts: Arc::new(Mutex::new(HashMap::new())),
            sweep_task: Mutex::new(None),
        }
    }

    /// Starts the periodic sweep over every open connection.
    ///
    /// A connection is dropped once it has shared no stream part for at least
    /// the disconnection delay. Nodes with a pending scheduled disconnection
    /// are left to their timer.
    pub fn start(&self) {
        let streams = self.streams.clone();
        let network = self.network.clone();
        let timeouts = self.timeouts.clone();
        let interval = self.sweep_interval;
        let delay = self.disconnection_delay;
        let handle = tokio::spawn(async move {
            let mut idle_since: HashMap<NodeId, Instant> = HashMap::new();
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let expired: Vec<NodeId> = {
                    let streams = streams.lock();
                    let timeouts = timeouts.lock();
                    let connected = network.get_all_connection_node_ids();
                    idle_since.retain(|node, _| connected.contains(node));
                    connected
                        .into_iter()
                        .filter(|node| {
                            if streams.has_shared_streams(node) {
                                idle_since.remove(node);
                                return false;
                            }
                            if timeouts.contains_key(node) {
                                return false;
                            }
                            let since = *idle_since.entry(node.clone()).or_insert(now);
                            now.duration_since(since) >= delay
                        })
                        .collect()
                };
                for node in expired {
                    idle_since.remove(&node);
                    info!(node_id = %node, "Sweep disconnecting idle node");
                    if let Err(e) = network
                        .disconnect_from_node(&node, DISCONNECTION_REASON)
                        .await
                    {
                        warn!(node_id = %node, error = %e, "Failed to disconnect idle node");
                    }
                }
            }
        });
        if let Some(previous) = self.sweep_task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Schedules a disconnect unless the node still shares a stream part.
    ///
    /// Scheduling a node that already has a pending disconnect restarts its
    /// timer.
    pub fn schedule_disconnection_if_no_shared_streams(&self, node: &NodeId) {
        if self.streams.lock().has_shared_streams(node) {
            return;
        }
        let streams = self.streams.clone();
        let network = self.network.clone();
        let registry = self.timeouts.clone();
        let delay = self.disconnection_delay;
        let target = node.clone();
        let mut timeouts = self.timeouts.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            registry.lock().remove(&target);
            if streams.lock().has_shared_streams(&target) {
                debug!(node_id = %target, "Node regained shared streams, keeping connection");
                return;
            }
            info!(node_id = %target, "Disconnecting node with no shared streams");
            if let Err(e) = network
                .disconnect_from_node(&target, DISCONNECTION_REASON)
                .await
            {
                warn!(node_id = %target, error = %e, "Failed to disconnect node");
            }
        });
        if let Some(previous) = timeouts.insert(node.clone(), handle) {
            previous.abort();
        }
        debug!(node_id = %node, ?delay, "Scheduled disconnection");
    }

    pub fn cancel_scheduled_disconnection(&self, node: &NodeId) {
        if let Some(handle) = self.timeouts.lock().remove(node) {
            handle.abort();
            debug!(node_id = %node, "Cancelled scheduled disconnection");
        }
    }

    pub fn is_scheduled(&self, node: &NodeId) -> bool {
        self.timeouts.lock().contains_key(node)
    }

    pub fn stop(&self) {
        if let Some(handle) = self.sweep_task.lock().take() {
            handle.abort();
        }
        for (_, handle) in self.timeouts.lock().drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::stream_manager::StreamManager;
    use crate::domain::stream_part::StreamPartId;
    use crate::test_utils::MockPeerNetwork;

    const DELAY: Duration = Duration::from_secs(30);

    fn setup(network: Arc<MockPeerNetwork>) -> (DisconnectionManager, SharedStreamManager) {
        let streams: SharedStreamManager = Arc::new(Mutex::new(StreamManager::new()));
        let manager =
            DisconnectionManager::new(streams.clone(), network, DELAY, Duration::from_secs(120));
        (manager, streams)
    }

    fn spid() -> StreamPartId {
        StreamPartId::new("stream", 0).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn disconnects_exactly_once_after_delay() {
        let network = Arc::new(MockPeerNetwork::new());
        let (manager, _streams) = setup(network.clone());
        let node = "n".to_string();

        manager.schedule_disconnection_if_no_shared_streams(&node);
        manager.schedule_disconnection_if_no_shared_streams(&node);
        tokio::time::sleep(DELAY - Duration::from_secs(1)).await;
        assert!(network.disconnect_calls.lock().await.is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let calls = network.disconnect_calls.lock().await.clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, node);
        assert!(!manager.is_scheduled(&node));
    }

    #[tokio::test(start_paused = true)]
    async fn regained_interest_prevents_disconnect() {
        let network = Arc::new(MockPeerNetwork::new());
        let (manager, streams) = setup(network.clone());
        let node = "n".to_string();

        manager.schedule_disconnection_if_no_shared_streams(&node);
        tokio::time::sleep(Duration::from_secs(5)).await;
        {
            let mut streams = streams.lock();
            streams.set_up_stream(&spid(), false).unwrap();
            streams.add_neighbor(&spid(), &node).unwrap();
        }
        tokio::time::sleep(DELAY * 2).await;
        assert!(network.disconnect_calls.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_disconnect() {
        let network = Arc::new(MockPeerNetwork::new());
        let (manager, _streams) = setup(network.clone());
        let node = "n".to_string();

        manager.schedule_disconnection_if_no_shared_streams(&node);
        manager.cancel_scheduled_disconnection(&node);
        tokio::time::sleep(DELAY * 2).await;
        assert!(network.disconnect_calls.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_scheduled_while_streams_are_shared() {
        let network = Arc::new(MockPeerNetwork::new());
        let (manager, streams) = setup(network.clone());
        let node = "n".to_string();
        {
            let mut streams = streams.lock();
            streams.set_up_stream(&spid(), false).unwrap();
            streams.add_inbound_node(&spid(), &node).unwrap();
        }
        manager.schedule_disconnection_if_no_shared_streams(&node);
        assert!(!manager.is_scheduled(&node));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_disconnects_idle_connections() {
        let network = Arc::new(MockPeerNetwork::new());
        network.add_connection("idle");
        network.add_connection("busy");
        let (manager, streams) = setup(network.clone());
        {
            let mut streams = streams.lock();
            streams.set_up_stream(&spid(), false).unwrap();
            streams.add_neighbor(&spid(), &"busy".to_string()).unwrap();
        }

        manager.start();
        // First seen idle at the first tick, old enough by the second.
        tokio::time::sleep(Duration::from_secs(121)).await;
        assert!(network.disconnect_calls.lock().await.is_empty());
        tokio::time::sleep(Duration::from_secs(120)).await;
        let calls = network.disconnect_calls.lock().await.clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "idle");
        manager.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_leaves_scheduled_node_to_its_timer() {
        let network = Arc::new(MockPeerNetwork::new());
        network.add_connection("n");
        let (manager, streams) = setup(network.clone());
        let node = "n".to_string();

        manager.start();
        tokio::time::sleep(Duration::from_secs(119)).await;
        manager.schedule_disconnection_if_no_shared_streams(&node);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(network.disconnect_calls.lock().await.is_empty());

        {
            let mut streams = streams.lock();
            streams.set_up_stream(&spid(), false).unwrap();
            streams.add_neighbor(&spid(), &node).unwrap();
        }
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(network.disconnect_calls.lock().await.is_empty());
        manager.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_forgets_idleness_once_streams_are_shared_again() {
        let network = Arc::new(MockPeerNetwork::new());
        network.add_connection("n");
        let (manager, streams) = setup(network.clone());
        let node = "n".to_string();

        manager.start();
        tokio::time::sleep(Duration::from_secs(121)).await;
        {
            let mut streams = streams.lock();
            streams.set_up_stream(&spid(), false).unwrap();
            streams.add_neighbor(&spid(), &node).unwrap();
        }
        tokio::time::sleep(Duration::from_secs(120)).await;
        streams.lock().remove_node_from_stream(&spid(), &node);

        // Idle again from the third tick on, so only the fourth may drop it.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(network.disconnect_calls.lock().await.is_empty());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(network.disconnect_calls.lock().await.len(), 1);
        manager.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_restarts_the_timer() {
        let network = Arc::new(MockPeerNetwork::new());
        let (manager, _streams) = setup(network.clone());
        let node = "n".to_string();

        manager.schedule_disconnection_if_no_shared_streams(&node);
        tokio::time::sleep(Duration::from_secs(20)).await;
        manager.schedule_disconnection_if_no_shared_streams(&node);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(network.disconnect_calls.lock().await.is_empty());
        assert!(manager.is_scheduled(&node));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(network.disconnect_calls.lock().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_aborts_pending_disconnects() {
        let network = Arc::new(MockPeerNetwork::new());
        let (manager, _streams) = setup(network.clone());
        manager.schedule_disconnection_if_no_shared_streams(&"n".to_string());
        manager.stop();
        tokio::time::sleep(DELAY * 2).await;
        assert!(network.disconnect_calls.lock().await.is_empty());
    }
}
