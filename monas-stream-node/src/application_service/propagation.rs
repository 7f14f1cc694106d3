//! Propagation engine.
//!
//! Fans a freshly seen message out to every node that receives the stream part
//! from us, except the one it came from. Messages that reached fewer targets
//! than the configured minimum are kept for a short while so that neighbors
//! joining right after still get them.

use super::config::PropagationConfig;
use super::SharedStreamManager;
use crate::domain::message::{MessageId, StreamMessage};
use crate::domain::protocol::NodeMessage;
use crate::domain::stream_part::{NodeId, StreamPartId};
use crate::infrastructure::metrics::Metrics;
use crate::port::peer_network::PeerNetwork;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone)]
struct PropagationTask {
    message: StreamMessage,
    source: Option<NodeId>,
    handled_neighbors: HashSet<NodeId>,
    expires_at: Instant,
}

/// Bounded FIFO of recently propagated messages with a time-to-live.
#[derive(Debug)]
struct PropagationTaskStore {
    tasks: HashMap<MessageId, PropagationTask>,
    order: VecDeque<MessageId>,
    ttl: Duration,
    max_tasks: usize,
}

impl PropagationTaskStore {
    fn new(ttl: Duration, max_tasks: usize) -> Self {
        Self {
            tasks: HashMap::new(),
            order: VecDeque::new(),
            ttl,
            max_tasks,
        }
    }

    fn add(&mut self, message: StreamMessage, source: Option<NodeId>, handled: HashSet<NodeId>) {
        if self.max_tasks == 0 {
            return;
        }
        self.evict_expired();
        let id = message.message_id.clone();
        if self.tasks.contains_key(&id) {
            return;
        }
        while self.tasks.len() >= self.max_tasks {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.tasks.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(id.clone());
        self.tasks.insert(
            id,
            PropagationTask {
                message,
                source,
                handled_neighbors: handled,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Claims every live task of the stream part not yet handled by `node`.
    fn claim_for(
        &mut self,
        spid: &StreamPartId,
        node: &NodeId,
        min_targets: usize,
    ) -> Vec<StreamMessage> {
        self.evict_expired();
        let mut claimed = Vec::new();
        let mut finished = Vec::new();
        for id in &self.order {
            let Some(task) = self.tasks.get_mut(id) else {
                continue;
            };
            if task.message.stream_part() != spid
                || task.source.as_ref() == Some(node)
                || task.handled_neighbors.contains(node)
            {
                continue;
            }
            task.handled_neighbors.insert(node.clone());
            claimed.push(task.message.clone());
            if task.handled_neighbors.len() >= min_targets {
                finished.push(id.clone());
            }
        }
        for id in finished {
            self.remove(&id);
        }
        claimed
    }

    fn remove(&mut self, id: &MessageId) {
        if self.tasks.remove(id).is_some() {
            self.order.retain(|queued| queued != id);
        }
    }

    fn remove_stream_part(&mut self, spid: &StreamPartId) {
        let stale: Vec<MessageId> = self
            .order
            .iter()
            .filter(|id| {
                self.tasks
                    .get(id)
                    .is_some_and(|task| task.message.stream_part() == spid)
            })
            .cloned()
            .collect();
        for id in stale {
            self.remove(&id);
        }
    }

    fn evict_expired(&mut self) {
        let now = Instant::now();
        while let Some(front) = self.order.front() {
            let expired = self
                .tasks
                .get(front)
                .map(|task| task.expires_at <= now)
                .unwrap_or(true);
            if !expired {
                break;
            }
            if let Some(id) = self.order.pop_front() {
                self.tasks.remove(&id);
            }
        }
    }

    fn len(&self) -> usize {
        self.tasks.len()
    }
}

pub struct Propagation {
    streams: SharedStreamManager,
    network: Arc<dyn PeerNetwork>,
    config: PropagationConfig,
    tasks: Mutex<PropagationTaskStore>,
    consecutive_failures: Mutex<HashMap<NodeId, u32>>,
    metrics: Arc<Metrics>,
}

impl Propagation {
    pub fn new(
        streams: SharedStreamManager,
        network: Arc<dyn PeerNetwork>,
        config: PropagationConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let tasks = PropagationTaskStore::new(config.ttl(), config.max_messages);
        Self {
            streams,
            network,
            config,
            tasks: Mutex::new(tasks),
            consecutive_failures: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Sends the message to every outbound node of its stream part except `source`.
    ///
    /// Returns the nodes that crossed the consecutive failure threshold; the
    /// caller must treat them as disconnected.
    pub async fn feed_unseen_message(
        &self,
        message: &StreamMessage,
        source: Option<&NodeId>,
    ) -> Vec<NodeId> {
        let spid = message.stream_part();
        let targets: Vec<NodeId> = self
            .streams
            .lock()
            .get_outbound_nodes(spid)
            .into_iter()
            .filter(|node| Some(node) != source)
            .collect();

        let results = join_all(targets.iter().map(|target| async move {
            let result = self
                .network
                .send(target, NodeMessage::Data(message.clone()))
                .await;
            (target, result)
        }))
        .await;

        let mut delivered = HashSet::new();
        let mut unreachable = Vec::new();
        for (target, result) in results {
            match result {
                Ok(()) => {
                    self.record_success(target);
                    delivered.insert(target.clone());
                }
                Err(e) => {
                    warn!(node_id = %target, spid = %spid, error = %e, "Failed to propagate message");
                    if self.record_failure(target) {
                        unreachable.push(target.clone());
                    }
                }
            }
        }
        self.metrics.record("propagate_message", 1.0);
        trace!(
            message_id = %message.message_id,
            targets = delivered.len(),
            "Propagated message"
        );

        if delivered.len() < self.config.min_propagation_targets {
            self.metrics.record("below_min_targets", 1.0);
            let mut tasks = self.tasks.lock();
            tasks.add(message.clone(), source.cloned(), delivered);
            self.metrics.set("retained_tasks", tasks.len() as f64);
        }
        unreachable
    }

    /// Delivers retained messages of the stream part to a newly joined neighbor.
    ///
    /// Returns the nodes that crossed the consecutive failure threshold.
    pub async fn on_neighbor_joined(&self, node: &NodeId, spid: &StreamPartId) -> Vec<NodeId> {
        let pending = {
            let mut tasks = self.tasks.lock();
            let pending = tasks.claim_for(spid, node, self.config.min_propagation_targets);
            self.metrics.set("retained_tasks", tasks.len() as f64);
            pending
        };
        if pending.is_empty() {
            return Vec::new();
        }
        debug!(node_id = %node, spid = %spid, count = pending.len(), "Sending retained messages to new neighbor");

        let mut unreachable = Vec::new();
        for message in pending {
            match self.network.send(node, NodeMessage::Data(message)).await {
                Ok(()) => self.record_success(node),
                Err(e) => {
                    warn!(node_id = %node, spid = %spid, error = %e, "Failed to send retained message");
                    if self.record_failure(node) {
                        unreachable.push(node.clone());
                        break;
                    }
                }
            }
        }
        unreachable
    }

    /// Drops retained messages of a stream part this node left.
    pub fn forget_stream_part(&self, spid: &StreamPartId) {
        let mut tasks = self.tasks.lock();
        tasks.remove_stream_part(spid);
        self.metrics.set("retained_tasks", tasks.len() as f64);
    }

    /// Clears failure bookkeeping for a node that went away.
    pub fn forget_node(&self, node: &NodeId) {
        self.consecutive_failures.lock().remove(node);
    }

    pub fn consecutive_failures(&self, node: &NodeId) -> u32 {
        self.consecutive_failures
            .lock()
            .get(node)
            .copied()
            .unwrap_or(0)
    }

    pub fn retained_task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    fn record_success(&self, node: &NodeId) {
        self.consecutive_failures.lock().remove(node);
    }

    fn record_failure(&self, node: &NodeId) -> bool {
        self.metrics.record("send_failures", 1.0);
        let mut failures = self.consecutive_failures.lock();
        let count = failures.entry(node.clone()).or_insert(0);
        *count += 1;
        if *count >= self.config.max_consecutive_failures {
            failures.remove(node);
            self.metrics.record("forced_disconnects", 1.0);
            warn!(node_id = %node, "Neighbor reached consecutive failure limit");
            return true;
        }
        false
    }
}
