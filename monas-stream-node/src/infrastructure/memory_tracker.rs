//! In-process tracker.
//!
//! A [`MemoryTracker`] keeps the member set of every stream part reported to
//! it and answers membership changes with fresh instructions for all members.
//! Members are arranged on a ring ordered by node id and each one is told to
//! neighbor the nearest members on both sides, so the resulting topology is
//! symmetric. Nodes reach trackers through a [`MemoryTrackerClient`], which
//! implements [`TrackerNetwork`].

use crate::domain::protocol::{InstructionMessage, StatusMessage, TrackerInfo};
use crate::domain::stream_part::{NodeId, StreamPartId, TrackerId};
use crate::port::tracker_network::{TrackerNetwork, TrackerNetworkEvent};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

pub const DEFAULT_MAX_NEIGHBORS: usize = 4;
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct TrackerState {
    members: HashMap<StreamPartId, BTreeSet<NodeId>>,
    counters: HashMap<StreamPartId, u64>,
    clients: HashMap<NodeId, broadcast::Sender<TrackerNetworkEvent>>,
}

pub struct MemoryTracker {
    info: TrackerInfo,
    max_neighbors: usize,
    state: Mutex<TrackerState>,
}

impl MemoryTracker {
    pub fn new(id: impl Into<TrackerId>) -> Arc<Self> {
        Self::with_max_neighbors(id, DEFAULT_MAX_NEIGHBORS)
    }

    pub fn with_max_neighbors(id: impl Into<TrackerId>, max_neighbors: usize) -> Arc<Self> {
        let id = id.into();
        Arc::new(Self {
            info: TrackerInfo {
                address: format!("memory://{id}"),
                id,
            },
            max_neighbors,
            state: Mutex::new(TrackerState::default()),
        })
    }

    pub fn info(&self) -> &TrackerInfo {
        &self.info
    }

    pub fn id(&self) -> &TrackerId {
        &self.info.id
    }

    /// Sorted members of a stream part.
    pub fn members(&self, spid: &StreamPartId) -> Vec<NodeId> {
        self.state
            .lock()
            .members
            .get(spid)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn counter(&self, spid: &StreamPartId) -> u64 {
        self.state.lock().counters.get(spid).copied().unwrap_or(0)
    }

    fn attach(&self, node_id: &NodeId, events: broadcast::Sender<TrackerNetworkEvent>) {
        self.state.lock().clients.insert(node_id.clone(), events);
        debug!(tracker_id = %self.info.id, node_id = %node_id, "Node attached to tracker");
    }

    /// Forgets a node entirely and re-instructs the stream parts it was in.
    fn detach(&self, node_id: &NodeId) {
        let mut state = self.state.lock();
        state.clients.remove(node_id);
        let changed: Vec<StreamPartId> = state
            .members
            .iter_mut()
            .filter_map(|(spid, members)| members.remove(node_id).then(|| spid.clone()))
            .collect();
        for spid in changed {
            self.reinstruct(&mut state, &spid);
        }
    }

    fn on_status(&self, node_id: &NodeId, status: &StatusMessage) -> Result<()> {
        let spid = StreamPartId::new(status.stream.id.clone(), status.stream.partition)?;
        let mut state = self.state.lock();
        let changed = if status.stream.subscribed {
            state
                .members
                .entry(spid.clone())
                .or_default()
                .insert(node_id.clone())
        } else {
            state
                .members
                .get_mut(&spid)
                .map(|members| members.remove(node_id))
                .unwrap_or(false)
        };
        if changed {
            info!(
                tracker_id = %self.info.id,
                spid = %spid,
                node_id = %node_id,
                subscribed = status.stream.subscribed,
                "Stream part membership changed"
            );
            self.reinstruct(&mut state, &spid);
        }
        Ok(())
    }

    fn reinstruct(&self, state: &mut TrackerState, spid: &StreamPartId) {
        let members: Vec<NodeId> = state
            .members
            .get(spid)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        if members.is_empty() {
            state.members.remove(spid);
            return;
        }
        let counter = {
            let counter = state.counters.entry(spid.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        for (index, node_id) in members.iter().enumerate() {
            let Some(events) = state.clients.get(node_id) else {
                continue;
            };
            let instruction = InstructionMessage {
                request_id: Uuid::new_v4().to_string(),
                stream_part: spid.clone(),
                node_ids: ring_neighbors(&members, index, self.max_neighbors),
                counter,
            };
            let _ = events.send(TrackerNetworkEvent::InstructionReceived {
                tracker_id: self.info.id.clone(),
                instruction,
            });
        }
    }
}

/// Nearest members on both sides of `index` on the ring, at most `max` of them.
fn ring_neighbors(members: &[NodeId], index: usize, max: usize) -> Vec<NodeId> {
    let len = members.len();
    if len <= max + 1 {
        return members
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(_, node)| node.clone())
            .collect();
    }
    let mut neighbors = BTreeSet::new();
    for offset in 1..=max / 2 {
        neighbors.insert(members[(index + offset) % len].clone());
        neighbors.insert(members[(index + len - offset) % len].clone());
    }
    neighbors.into_iter().collect()
}

/// One node's sessions towards a set of in-process trackers.
pub struct MemoryTrackerClient {
    node_id: NodeId,
    trackers: HashMap<TrackerId, Arc<MemoryTracker>>,
    connected: Mutex<HashSet<TrackerId>>,
    events: broadcast::Sender<TrackerNetworkEvent>,
}

impl MemoryTrackerClient {
    pub fn new(node_id: impl Into<NodeId>, trackers: &[Arc<MemoryTracker>]) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            node_id: node_id.into(),
            trackers: trackers
                .iter()
                .map(|t| (t.id().clone(), Arc::clone(t)))
                .collect(),
            connected: Mutex::new(HashSet::new()),
            events,
        })
    }

    fn tracker(&self, tracker_id: &TrackerId) -> Result<&Arc<MemoryTracker>> {
        self.trackers
            .get(tracker_id)
            .ok_or_else(|| anyhow!("unknown tracker {}", tracker_id))
    }

    /// Simulates the tracker dropping this session.
    pub fn drop_session(&self, tracker_id: &TrackerId) {
        if self.connected.lock().remove(tracker_id) {
            if let Some(tracker) = self.trackers.get(tracker_id) {
                tracker.detach(&self.node_id);
            }
            let _ = self
                .events
                .send(TrackerNetworkEvent::TrackerDisconnected(tracker_id.clone()));
        }
    }
}

#[async_trait]
impl TrackerNetwork for MemoryTrackerClient {
    async fn connect_to_tracker(&self, tracker: &TrackerInfo) -> Result<()> {
        let target = self.tracker(&tracker.id)?;
        target.attach(&self.node_id, self.events.clone());
        self.connected.lock().insert(tracker.id.clone());
        Ok(())
    }

    async fn disconnect_from_tracker(&self, tracker_id: &TrackerId) -> Result<()> {
        if self.connected.lock().remove(tracker_id) {
            self.tracker(tracker_id)?.detach(&self.node_id);
        }
        Ok(())
    }

    async fn send_status(&self, tracker_id: &TrackerId, status: StatusMessage) -> Result<()> {
        if !self.connected.lock().contains(tracker_id) {
            return Err(anyhow!("not connected to tracker {}", tracker_id));
        }
        self.tracker(tracker_id)?.on_status(&self.node_id, &status)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TrackerNetworkEvent> {
        self.events.subscribe()
    }

    async fn stop(&self) -> Result<()> {
        let connected: Vec<TrackerId> = self.connected.lock().drain().collect();
        for tracker_id in connected {
            if let Some(tracker) = self.trackers.get(&tracker_id) {
                tracker.detach(&self.node_id);
            }
        }
        Ok(())
    }
}
