//! Tracker session manager.
//!
//! Keeps one session per configured tracker, reports stream part status to the
//! tracker owning each stream, and applies the neighbor instructions it gets
//! back. Instructions are validated twice: before anything is applied (owner
//! tracker, counter) and again after every awaited connection attempt, since
//! the stream may have been left or a newer instruction may have arrived in
//! the meantime.

use super::SharedStreamManager;
use crate::domain::protocol::{InstructionMessage, Location, StatusMessage, TrackerInfo};
use crate::domain::stream_part::{NodeId, StreamPartId, TrackerId};
use crate::infrastructure::metrics::Metrics;
use crate::infrastructure::placement::TrackerRegistry;
use crate::port::peer_discovery::PeerDiscovery;
use crate::port::peer_network::PeerNetwork;
use crate::port::tracker_network::TrackerNetwork;
use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerSessionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstructionOutcome {
    Applied {
        connected: Vec<NodeId>,
        failed: Vec<NodeId>,
        removed: Vec<NodeId>,
    },
    /// Sent by a tracker that does not own the stream.
    UnexpectedTracker { expected: Option<TrackerId> },
    /// Counter not newer than the last applied one.
    Stale { last_counter: u64 },
    /// The stream was left or a newer instruction arrived while connecting.
    Superseded,
    InvalidStreamPart,
    Stopped,
}

/// Node-side operations driven by instruction handling.
#[async_trait]
pub trait StreamSubscriber: Send + Sync {
    async fn subscribe_to_stream_if_have_not_yet(&self, spid: &StreamPartId);

    /// Opens a connection bounded by the node connect timeout.
    async fn connect_to_node(&self, node_id: &NodeId, tracker_id: &TrackerId) -> Result<()>;

    async fn subscribe_to_stream_on_node(&self, node_id: &NodeId, spid: &StreamPartId);

    async fn unsubscribe_from_stream_on_node(&self, node_id: &NodeId, spid: &StreamPartId);
}

/// Static and mutable descriptor fields attached to every status.
#[derive(Debug, Clone)]
pub struct StatusDescriptor {
    pub started: u64,
    pub location: Option<Location>,
    pub extra: Arc<Mutex<serde_json::Map<String, serde_json::Value>>>,
}

pub struct TrackerManager {
    node_id: NodeId,
    tracker_network: Arc<dyn TrackerNetwork>,
    peer_network: Arc<dyn PeerNetwork>,
    streams: SharedStreamManager,
    registry: TrackerRegistry,
    descriptor: StatusDescriptor,
    rtt_update_interval: Duration,
    sessions: Mutex<HashMap<TrackerId, TrackerSessionState>>,
    instruction_counters: Mutex<HashMap<(StreamPartId, TrackerId), u64>>,
    latest_instructions: Mutex<HashMap<StreamPartId, (InstructionMessage, TrackerId)>>,
    rtts_sent_at: Mutex<HashMap<TrackerId, Instant>>,
    stopped: AtomicBool,
    metrics: Arc<Metrics>,
}

impl TrackerManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        trackers: Vec<TrackerInfo>,
        tracker_network: Arc<dyn TrackerNetwork>,
        peer_network: Arc<dyn PeerNetwork>,
        streams: SharedStreamManager,
        descriptor: StatusDescriptor,
        rtt_update_interval: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        let sessions = trackers
            .iter()
            .map(|t| (t.id.clone(), TrackerSessionState::Disconnected))
            .collect();
        Self {
            node_id,
            tracker_network,
            peer_network,
            streams,
            registry: TrackerRegistry::new(trackers),
            descriptor,
            rtt_update_interval,
            sessions: Mutex::new(sessions),
            instruction_counters: Mutex::new(HashMap::new()),
            latest_instructions: Mutex::new(HashMap::new()),
            rtts_sent_at: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn tracker_id_for(&self, spid: &StreamPartId) -> Option<TrackerId> {
        self.registry.tracker_for(spid).map(|t| t.id.clone())
    }

    pub fn session_state(&self, tracker_id: &str) -> Option<TrackerSessionState> {
        self.sessions.lock().get(tracker_id).copied()
    }

    /// Connects every session that is currently disconnected.
    pub async fn connect_to_trackers(&self) {
        let trackers: Vec<TrackerInfo> = self.registry.trackers().to_vec();
        join_all(trackers.iter().map(|info| self.connect_to_tracker(info))).await;
    }

    /// Returns true when this call completed the connection (statuses already sent).
    async fn connect_to_tracker(&self, info: &TrackerInfo) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        {
            let mut sessions = self.sessions.lock();
            let state = sessions
                .entry(info.id.clone())
                .or_insert(TrackerSessionState::Disconnected);
            if *state != TrackerSessionState::Disconnected {
                return false;
            }
            *state = TrackerSessionState::Connecting;
        }
        debug!(tracker_id = %info.id, address = %info.address, "Connecting to tracker");
        match self.tracker_network.connect_to_tracker(info).await {
            Ok(()) => self.on_connected_to_tracker(&info.id).await,
            Err(e) => {
                warn!(tracker_id = %info.id, error = %e, "Failed to connect to tracker");
                let mut sessions = self.sessions.lock();
                if sessions.get(&info.id) == Some(&TrackerSessionState::Connecting) {
                    sessions.insert(info.id.clone(), TrackerSessionState::Disconnected);
                }
                false
            }
        }
    }

    /// Marks the session connected and reports every stream part it owns.
    ///
    /// Returns false if the session was already connected.
    pub async fn on_connected_to_tracker(&self, tracker_id: &TrackerId) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        let previous = self
            .sessions
            .lock()
            .insert(tracker_id.clone(), TrackerSessionState::Connected);
        if previous == Some(TrackerSessionState::Connected) {
            return false;
        }
        info!(tracker_id = %tracker_id, "Connected to tracker");
        let owned: Vec<StreamPartId> = self
            .streams
            .lock()
            .get_spids()
            .into_iter()
            .filter(|spid| self.tracker_id_for(spid).as_ref() == Some(tracker_id))
            .collect();
        for spid in owned {
            self.send_stream_status(&spid).await;
        }
        true
    }

    pub fn on_tracker_disconnected(&self, tracker_id: &TrackerId) {
        let previous = self
            .sessions
            .lock()
            .insert(tracker_id.clone(), TrackerSessionState::Disconnected);
        self.rtts_sent_at.lock().remove(tracker_id);
        if previous == Some(TrackerSessionState::Connected) {
            warn!(tracker_id = %tracker_id, "Tracker disconnected");
        }
    }

    /// Makes sure the session of the tracker owning `spid` is up.
    ///
    /// Returns true if the status of `spid` was sent as part of connecting.
    pub async fn on_new_stream(&self, spid: &StreamPartId) -> bool {
        let Some(info) = self.registry.tracker_for(spid).cloned() else {
            trace!(spid = %spid, "No tracker configured for stream part");
            return false;
        };
        self.connect_to_tracker(&info).await
    }

    pub fn on_unsubscribe_from_stream(&self, spid: &StreamPartId) {
        self.instruction_counters
            .lock()
            .retain(|(stream_part, _), _| stream_part != spid);
        self.latest_instructions.lock().remove(spid);
    }

    pub async fn send_all_statuses(&self) {
        let spids = self.streams.lock().get_spids();
        for spid in spids {
            self.send_stream_status(&spid).await;
        }
    }

    /// Sends the status of one stream part to the tracker owning it.
    ///
    /// Behind-proxy stream parts are never reported.
    pub async fn send_stream_status(&self, spid: &StreamPartId) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let Some(tracker_id) = self.tracker_id_for(spid) else {
            return;
        };
        let (behind_proxy, stream) = {
            let streams = self.streams.lock();
            (streams.is_behind_proxy(spid), streams.stream_status(spid))
        };
        if behind_proxy {
            return;
        }
        if self.session_state(&tracker_id) != Some(TrackerSessionState::Connected) {
            debug!(spid = %spid, tracker_id = %tracker_id, "Tracker not connected, status deferred");
            return;
        }
        let status = StatusMessage {
            request_id: Uuid::new_v4().to_string(),
            stream,
            rtts: self.rtts_if_due(&tracker_id),
            started: self.descriptor.started,
            location: self.descriptor.location.clone(),
            extra: self.descriptor.extra.lock().clone(),
        };
        match self.tracker_network.send_status(&tracker_id, status).await {
            Ok(()) => {
                self.metrics.record("status_sent", 1.0);
                trace!(spid = %spid, tracker_id = %tracker_id, "Sent status");
            }
            Err(e) => {
                warn!(spid = %spid, tracker_id = %tracker_id, error = %e, "Failed to send status");
            }
        }
    }

    fn rtts_if_due(&self, tracker_id: &TrackerId) -> Option<HashMap<NodeId, u64>> {
        let now = Instant::now();
        let mut sent_at = self.rtts_sent_at.lock();
        let due = sent_at
            .get(tracker_id)
            .map(|last| now.duration_since(*last) >= self.rtt_update_interval)
            .unwrap_or(true);
        if !due {
            return None;
        }
        sent_at.insert(tracker_id.clone(), now);
        Some(self.peer_network.get_rtts())
    }

    fn is_current(&self, spid: &StreamPartId, tracker_id: &TrackerId, counter: u64) -> bool {
        !self.stopped.load(Ordering::SeqCst)
            && self.streams.lock().is_set_up(spid)
            && self
                .instruction_counters
                .lock()
                .get(&(spid.clone(), tracker_id.clone()))
                == Some(&counter)
    }

    /// Validates and applies a neighbor instruction.
    ///
    /// `reattempt` re-applies the latest instruction: an equal counter is then
    /// accepted and status is only re-sent if some target failed.
    pub async fn handle_tracker_instruction(
        &self,
        instruction: &InstructionMessage,
        tracker_id: &TrackerId,
        subscriber: &dyn StreamSubscriber,
        reattempt: bool,
    ) -> InstructionOutcome {
        if self.stopped.load(Ordering::SeqCst) {
            return InstructionOutcome::Stopped;
        }
        let spid = &instruction.stream_part;
        let counter = instruction.counter;
        if let Err(e) = spid.validate() {
            warn!(tracker_id = %tracker_id, error = %e, "Instruction for invalid stream part");
            return InstructionOutcome::InvalidStreamPart;
        }

        let expected = self.tracker_id_for(spid);
        if expected.as_ref() != Some(tracker_id) {
            self.metrics.record("unexpected_tracker_instruction", 1.0);
            warn!(
                spid = %spid,
                tracker_id = %tracker_id,
                expected = ?expected,
                "Ignoring instruction from unexpected tracker"
            );
            return InstructionOutcome::UnexpectedTracker { expected };
        }

        {
            let mut counters = self.instruction_counters.lock();
            let key = (spid.clone(), tracker_id.clone());
            if let Some(&last_counter) = counters.get(&key) {
                if counter < last_counter || (counter == last_counter && !reattempt) {
                    self.metrics.record("stale_instruction", 1.0);
                    debug!(spid = %spid, counter, last_counter, "Discarding stale instruction");
                    return InstructionOutcome::Stale { last_counter };
                }
            }
            counters.insert(key, counter);
        }
        self.latest_instructions
            .lock()
            .insert(spid.clone(), (instruction.clone(), tracker_id.clone()));
        self.metrics.record("instructions_applied", 1.0);
        debug!(
            spid = %spid,
            counter,
            nodes = ?instruction.node_ids,
            reattempt,
            "Applying tracker instruction"
        );

        subscriber.subscribe_to_stream_if_have_not_yet(spid).await;
        if !self.is_current(spid, tracker_id, counter) {
            return InstructionOutcome::Superseded;
        }

        let (removed, targets) = {
            let streams = self.streams.lock();
            let removed: Vec<NodeId> = streams
                .get_neighbors(spid)
                .into_iter()
                .filter(|node| !instruction.node_ids.contains(node))
                .collect();
            let targets: Vec<NodeId> = instruction
                .node_ids
                .iter()
                .filter(|node| **node != self.node_id && !streams.is_neighbor(spid, node))
                .cloned()
                .collect();
            (removed, targets)
        };
        for node in &removed {
            subscriber.unsubscribe_from_stream_on_node(node, spid).await;
        }

        let results = join_all(targets.iter().map(|node| async move {
            (node, subscriber.connect_to_node(node, tracker_id).await)
        }))
        .await;

        let mut connected = Vec::new();
        let mut failed = Vec::new();
        for (node, result) in results {
            match result {
                Ok(()) => {
                    if !self.is_current(spid, tracker_id, counter) {
                        debug!(spid = %spid, counter, "Instruction superseded while connecting");
                        return InstructionOutcome::Superseded;
                    }
                    subscriber.subscribe_to_stream_on_node(node, spid).await;
                    connected.push(node.clone());
                }
                Err(e) => {
                    warn!(node_id = %node, spid = %spid, error = %e, "Failed to connect to instructed node");
                    failed.push(node.clone());
                }
            }
        }

        if let Err(e) = self.streams.lock().update_counter(spid, counter) {
            debug!(error = %e, "Stream part left before counter update");
        }
        if !reattempt || !failed.is_empty() {
            self.send_stream_status(spid).await;
        }
        InstructionOutcome::Applied {
            connected,
            failed,
            removed,
        }
    }

    /// Latest accepted instruction per stream part, for periodic re-application.
    pub fn pending_retries(&self) -> Vec<(InstructionMessage, TrackerId)> {
        let mut retries: Vec<_> = self.latest_instructions.lock().values().cloned().collect();
        retries.sort_by(|a, b| a.0.stream_part.cmp(&b.0.stream_part));
        retries
    }

    /// Detaches from every tracker and refuses further instructions.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let connected: Vec<TrackerId> = {
            let mut sessions = self.sessions.lock();
            let connected = sessions
                .iter()
                .filter(|(_, state)| **state != TrackerSessionState::Disconnected)
                .map(|(id, _)| id.clone())
                .collect();
            for state in sessions.values_mut() {
                *state = TrackerSessionState::Disconnected;
            }
            connected
        };
        for tracker_id in connected {
            if let Err(e) = self.tracker_network.disconnect_from_tracker(&tracker_id).await {
                warn!(tracker_id = %tracker_id, error = %e, "Failed to disconnect from tracker");
            }
        }
        if let Err(e) = self.tracker_network.stop().await {
            warn!(error = %e, "Failed to stop tracker network");
        }
        self.latest_instructions.lock().clear();
    }
}

#[async_trait]
impl PeerDiscovery for TrackerManager {
    async fn discover_and_connect(&self, stream_part: &StreamPartId) -> Result<()> {
        if !self.on_new_stream(stream_part).await {
            self.send_stream_status(stream_part).await;
        }
        Ok(())
    }
}
