//! Stream membership table.
//!
//! Pure in-memory bookkeeping of which peers relate to which stream part:
//! bidirectional neighbors, one-way proxy relations in either direction, the
//! behind-proxy flag, the last applied tracker counter and the per-chain
//! duplicate detector. Nothing here performs I/O.

use super::duplicate_detector::{DuplicateCheck, DuplicateMessageDetector};
use super::message::{MessageId, MessageRef};
use super::stream_part::{NodeId, StreamPartId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamManagerError {
    #[error("stream part {0} is not set up")]
    NotSetUp(StreamPartId),
    #[error("stream part {0} is already set up")]
    AlreadySetUp(StreamPartId),
}

/// Snapshot of one stream part as reported to its tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPartStatus {
    pub id: String,
    pub partition: u32,
    pub neighbors: Vec<NodeId>,
    pub counter: u64,
    pub subscribed: bool,
}

#[derive(Debug, Default)]
struct StreamState {
    detector: DuplicateMessageDetector,
    neighbors: BTreeSet<NodeId>,
    inbound_nodes: BTreeSet<NodeId>,
    outbound_nodes: BTreeSet<NodeId>,
    counter: u64,
    behind_proxy: bool,
}

impl StreamState {
    fn touches(&self, node: &NodeId) -> bool {
        self.neighbors.contains(node)
            || self.inbound_nodes.contains(node)
            || self.outbound_nodes.contains(node)
    }

    fn all_nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.neighbors
            .iter()
            .chain(self.inbound_nodes.iter())
            .chain(self.outbound_nodes.iter())
    }
}

#[derive(Debug, Default)]
pub struct StreamManager {
    streams: HashMap<StreamPartId, StreamState>,
}

impl StreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_up_stream(
        &mut self,
        spid: &StreamPartId,
        behind_proxy: bool,
    ) -> Result<(), StreamManagerError> {
        if self.streams.contains_key(spid) {
            return Err(StreamManagerError::AlreadySetUp(spid.clone()));
        }
        self.streams.insert(
            spid.clone(),
            StreamState {
                behind_proxy,
                ..StreamState::default()
            },
        );
        Ok(())
    }

    /// Tears the stream part down and returns every node it related to.
    pub fn remove_stream(&mut self, spid: &StreamPartId) -> Vec<NodeId> {
        let Some(state) = self.streams.remove(spid) else {
            return Vec::new();
        };
        let nodes: BTreeSet<NodeId> = state.all_nodes().cloned().collect();
        nodes.into_iter().collect()
    }

    pub fn is_set_up(&self, spid: &StreamPartId) -> bool {
        self.streams.contains_key(spid)
    }

    pub fn is_behind_proxy(&self, spid: &StreamPartId) -> bool {
        self.streams
            .get(spid)
            .map(|state| state.behind_proxy)
            .unwrap_or(false)
    }

    pub fn update_counter(
        &mut self,
        spid: &StreamPartId,
        counter: u64,
    ) -> Result<(), StreamManagerError> {
        self.state_mut(spid)?.counter = counter;
        Ok(())
    }

    /// Classifies an incoming message against the stream's chain ledgers.
    pub fn mark_and_check_duplicate(
        &mut self,
        message_id: &MessageId,
        prev_msg_ref: Option<&MessageRef>,
    ) -> Result<DuplicateCheck, StreamManagerError> {
        let state = self.state_mut(&message_id.stream_part)?;
        Ok(state.detector.mark_and_check(message_id, prev_msg_ref))
    }

    /// Adds a bidirectional neighbor, replacing any one-way relation with it.
    pub fn add_neighbor(
        &mut self,
        spid: &StreamPartId,
        node: &NodeId,
    ) -> Result<(), StreamManagerError> {
        let state = self.state_mut(spid)?;
        state.inbound_nodes.remove(node);
        state.outbound_nodes.remove(node);
        state.neighbors.insert(node.clone());
        Ok(())
    }

    /// Adds a push-only target, replacing any other relation with it.
    pub fn add_outbound_node(
        &mut self,
        spid: &StreamPartId,
        node: &NodeId,
    ) -> Result<(), StreamManagerError> {
        let state = self.state_mut(spid)?;
        state.neighbors.remove(node);
        state.inbound_nodes.remove(node);
        state.outbound_nodes.insert(node.clone());
        Ok(())
    }

    /// Adds a receive-only source, replacing any other relation with it.
    pub fn add_inbound_node(
        &mut self,
        spid: &StreamPartId,
        node: &NodeId,
    ) -> Result<(), StreamManagerError> {
        let state = self.state_mut(spid)?;
        state.neighbors.remove(node);
        state.outbound_nodes.remove(node);
        state.inbound_nodes.insert(node.clone());
        Ok(())
    }

    pub fn remove_outbound_node(&mut self, spid: &StreamPartId, node: &NodeId) -> bool {
        self.streams
            .get_mut(spid)
            .map(|state| state.outbound_nodes.remove(node))
            .unwrap_or(false)
    }

    pub fn remove_inbound_node(&mut self, spid: &StreamPartId, node: &NodeId) -> bool {
        self.streams
            .get_mut(spid)
            .map(|state| state.inbound_nodes.remove(node))
            .unwrap_or(false)
    }

    /// Removes every relation between the node and the stream part.
    pub fn remove_node_from_stream(&mut self, spid: &StreamPartId, node: &NodeId) -> bool {
        let Some(state) = self.streams.get_mut(spid) else {
            return false;
        };
        let neighbor = state.neighbors.remove(node);
        let inbound = state.inbound_nodes.remove(node);
        let outbound = state.outbound_nodes.remove(node);
        neighbor || inbound || outbound
    }

    /// Removes the node everywhere.
    ///
    /// Returns every stream part the node related to, and separately the
    /// behind-proxy stream parts in which it was a proxy peer.
    pub fn remove_node_from_all_streams(
        &mut self,
        node: &NodeId,
    ) -> (Vec<StreamPartId>, Vec<StreamPartId>) {
        let mut affected = Vec::new();
        let mut affected_proxies = Vec::new();
        for (spid, state) in self.streams.iter_mut() {
            let neighbor = state.neighbors.remove(node);
            let inbound = state.inbound_nodes.remove(node);
            let outbound = state.outbound_nodes.remove(node);
            if neighbor || inbound || outbound {
                affected.push(spid.clone());
                if state.behind_proxy && (inbound || outbound) {
                    affected_proxies.push(spid.clone());
                }
            }
        }
        affected.sort();
        affected_proxies.sort();
        (affected, affected_proxies)
    }

    pub fn is_neighbor(&self, spid: &StreamPartId, node: &NodeId) -> bool {
        self.streams
            .get(spid)
            .map(|state| state.neighbors.contains(node))
            .unwrap_or(false)
    }

    pub fn has_outbound_connection(&self, spid: &StreamPartId, node: &NodeId) -> bool {
        self.streams
            .get(spid)
            .map(|state| state.outbound_nodes.contains(node))
            .unwrap_or(false)
    }

    pub fn has_inbound_connection(&self, spid: &StreamPartId, node: &NodeId) -> bool {
        self.streams
            .get(spid)
            .map(|state| state.inbound_nodes.contains(node))
            .unwrap_or(false)
    }

    /// Whether the node still relates to any stream part in any direction.
    pub fn has_shared_streams(&self, node: &NodeId) -> bool {
        self.streams.values().any(|state| state.touches(node))
    }

    pub fn get_neighbors(&self, spid: &StreamPartId) -> Vec<NodeId> {
        self.streams
            .get(spid)
            .map(|state| state.neighbors.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Nodes that receive data of the stream part from this node.
    pub fn get_outbound_nodes(&self, spid: &StreamPartId) -> Vec<NodeId> {
        self.streams
            .get(spid)
            .map(|state| {
                state
                    .neighbors
                    .union(&state.outbound_nodes)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_outbound_only_nodes(&self, spid: &StreamPartId) -> Vec<NodeId> {
        self.streams
            .get(spid)
            .map(|state| state.outbound_nodes.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_inbound_only_nodes(&self, spid: &StreamPartId) -> Vec<NodeId> {
        self.streams
            .get(spid)
            .map(|state| state.inbound_nodes.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_spids(&self) -> Vec<StreamPartId> {
        let mut spids: Vec<StreamPartId> = self.streams.keys().cloned().collect();
        spids.sort();
        spids
    }

    pub fn get_all_nodes(&self) -> Vec<NodeId> {
        let nodes: BTreeSet<NodeId> = self
            .streams
            .values()
            .flat_map(|state| state.all_nodes().cloned())
            .collect();
        nodes.into_iter().collect()
    }

    /// Status of the stream part; a part that is not set up reports itself as unsubscribed.
    pub fn stream_status(&self, spid: &StreamPartId) -> StreamPartStatus {
        let (neighbors, counter, subscribed) = match self.streams.get(spid) {
            Some(state) => (state.neighbors.iter().cloned().collect(), state.counter, true),
            None => (Vec::new(), 0, false),
        };
        StreamPartStatus {
            id: spid.stream_id().to_string(),
            partition: spid.partition(),
            neighbors,
            counter,
            subscribed,
        }
    }

    fn state_mut(&mut self, spid: &StreamPartId) -> Result<&mut StreamState, StreamManagerError> {
        self.streams
            .get_mut(spid)
            .ok_or_else(|| StreamManagerError::NotSetUp(spid.clone()))
    }
}
