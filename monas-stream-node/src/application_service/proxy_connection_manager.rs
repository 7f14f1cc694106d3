//! One-way proxy connections.
//!
//! A node that does not want to join the gossip mesh of a stream part can ask a
//! subscribed node to accept a publish-only or subscribe-only relation. The
//! requester marks the stream part as behind proxy and keeps one
//! [`ProxyConnection`] record per target; the record outlives transport
//! disconnects so that the requester can restore the relation.

use super::tracker_manager::TrackerManager;
use super::SharedStreamManager;
use crate::domain::events::NodeEvent;
use crate::domain::protocol::{
    LeaveRequest, NodeMessage, ProxyConnectionRequest, ProxyConnectionResponse, ProxyDirection,
    RejectionReason,
};
use crate::domain::stream_part::{NodeId, StreamPartId};
use crate::port::peer_network::PeerNetwork;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyConnectionError {
    #[error("already subscribed to {0}, cannot open a proxy connection")]
    AlreadySubscribed(StreamPartId),
    #[error("proxy connection rejected: {0}")]
    Rejected(RejectionReason),
    #[error("failed to connect to {0}: {1}")]
    Connect(NodeId, String),
    #[error("no response from {0} in time")]
    Timeout(NodeId),
    #[error("no proxy connection to {1} for {0}")]
    NotConnected(StreamPartId, NodeId),
    #[error("proxy connection manager stopped")]
    Stopped,
}

impl ProxyConnectionError {
    pub fn reason(&self) -> RejectionReason {
        match self {
            ProxyConnectionError::AlreadySubscribed(_) => RejectionReason::AlreadySubscribed,
            ProxyConnectionError::Rejected(reason) => *reason,
            _ => RejectionReason::Unreachable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyConnectionState {
    Negotiating,
    Accepted,
    Retrying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyConnection {
    pub direction: ProxyDirection,
    pub state: ProxyConnectionState,
}

#[derive(Debug, Clone)]
pub struct ProxyConnectionConfig {
    pub accept_proxy_connections: bool,
    pub node_connect_timeout: Duration,
    pub response_timeout: Duration,
    pub reconnection_interval: Duration,
}

type JoinKey = (StreamPartId, NodeId);
type JoinResult = Option<Result<(), ProxyConnectionError>>;

pub struct ProxyStreamConnectionManager {
    node_id: NodeId,
    streams: SharedStreamManager,
    network: Arc<dyn PeerNetwork>,
    tracker_manager: Arc<TrackerManager>,
    events: broadcast::Sender<NodeEvent>,
    config: ProxyConnectionConfig,
    connections: Mutex<HashMap<StreamPartId, HashMap<NodeId, ProxyConnection>>>,
    in_flight: Mutex<HashMap<JoinKey, watch::Receiver<JoinResult>>>,
    pending_responses: Mutex<HashMap<String, oneshot::Sender<ProxyConnectionResponse>>>,
    reconnect_tasks: Mutex<HashMap<JoinKey, JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ProxyStreamConnectionManager {
    pub fn new(
        node_id: NodeId,
        streams: SharedStreamManager,
        network: Arc<dyn PeerNetwork>,
        tracker_manager: Arc<TrackerManager>,
        events: broadcast::Sender<NodeEvent>,
        config: ProxyConnectionConfig,
    ) -> Self {
        Self {
            node_id,
            streams,
            network,
            tracker_manager,
            events,
            config,
            connections: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            pending_responses: Mutex::new(HashMap::new()),
            reconnect_tasks: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn connection(&self, spid: &StreamPartId, target: &NodeId) -> Option<ProxyConnection> {
        self.connections
            .lock()
            .get(spid)
            .and_then(|targets| targets.get(target))
            .copied()
    }

    pub fn has_connection(&self, spid: &StreamPartId, target: &NodeId) -> bool {
        self.connection(spid, target).is_some()
    }

    /// Opens a one-way connection to `target`.
    ///
    /// Concurrent calls for the same (stream part, target), reconnection
    /// attempts included, wait for the single attempt in flight and share its
    /// result.
    pub async fn open_connection(
        &self,
        spid: &StreamPartId,
        target: &NodeId,
        direction: ProxyDirection,
    ) -> Result<(), ProxyConnectionError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ProxyConnectionError::Stopped);
        }
        if let Some(existing) = self.connection(spid, target) {
            if existing.state == ProxyConnectionState::Accepted && existing.direction == direction {
                return Ok(());
            }
        }
        let subscribed = {
            let streams = self.streams.lock();
            streams.is_set_up(spid) && !streams.is_behind_proxy(spid)
        };
        if subscribed {
            let error = ProxyConnectionError::AlreadySubscribed(spid.clone());
            warn!(spid = %spid, node_id = %target, "Cannot open proxy connection on a subscribed stream");
            self.emit_rejected(spid, target, direction, error.reason());
            return Err(error);
        }
        self.shared_attempt(spid, target, direction).await
    }

    /// Leads a negotiation for (stream part, target) or waits for the one in
    /// flight.
    async fn shared_attempt(
        &self,
        spid: &StreamPartId,
        target: &NodeId,
        direction: ProxyDirection,
    ) -> Result<(), ProxyConnectionError> {
        let key = (spid.clone(), target.clone());
        loop {
            let joinable = {
                let mut in_flight = self.in_flight.lock();
                // A closed sender means the leading attempt was cancelled.
                let joinable = in_flight
                    .get(&key)
                    .filter(|receiver| receiver.has_changed().is_ok())
                    .cloned();
                match joinable {
                    Some(receiver) => Err(receiver),
                    None => {
                        let (sender, receiver) = watch::channel(None);
                        in_flight.insert(key.clone(), receiver);
                        Ok(sender)
                    }
                }
            };
            match joinable {
                Ok(sender) => return self.lead_attempt(key, direction, sender).await,
                Err(receiver) => {
                    debug!(spid = %spid, node_id = %target, "Joining in-flight proxy connection attempt");
                    if let Some(result) = Self::await_in_flight(receiver).await {
                        return result;
                    }
                }
            }
        }
    }

    async fn lead_attempt(
        &self,
        key: JoinKey,
        direction: ProxyDirection,
        sender: watch::Sender<JoinResult>,
    ) -> Result<(), ProxyConnectionError> {
        let (spid, target) = (&key.0, &key.1);
        let fresh = {
            let mut connections = self.connections.lock();
            let targets = connections.entry(spid.clone()).or_default();
            match targets.get(target) {
                Some(existing) if existing.direction == direction => false,
                _ => {
                    targets.insert(
                        target.clone(),
                        ProxyConnection {
                            direction,
                            state: ProxyConnectionState::Negotiating,
                        },
                    );
                    true
                }
            }
        };
        let mut slot = InFlightSlot {
            manager: self,
            key: &key,
            settled: false,
        };

        let result = match self.negotiate(spid, target, direction).await {
            Ok(()) => self.on_accepted(spid, target, direction),
            // The target already holds the relation, typically installed by an
            // earlier attempt whose response was lost.
            Err(ProxyConnectionError::Rejected(RejectionReason::AlreadyConnected)) => {
                self.on_accepted(spid, target, direction)
            }
            Err(error) => {
                warn!(spid = %spid, node_id = %target, error = %error, "Proxy connection attempt failed");
                let negotiating = self
                    .connection(spid, target)
                    .is_some_and(|c| c.state == ProxyConnectionState::Negotiating);
                if fresh && negotiating {
                    self.remove_connection(spid, target);
                    self.emit_rejected(spid, target, direction, error.reason());
                }
                Err(error)
            }
        };

        slot.settled = true;
        drop(slot);
        let _ = sender.send(Some(result.clone()));
        result
    }

    /// Resolves to `None` when the leading attempt was dropped before finishing.
    async fn await_in_flight(mut receiver: watch::Receiver<JoinResult>) -> JoinResult {
        loop {
            let current = receiver.borrow_and_update().clone();
            if current.is_some() {
                return current;
            }
            if receiver.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Connects to the target and runs the request/response exchange.
    async fn negotiate(
        &self,
        spid: &StreamPartId,
        target: &NodeId,
        direction: ProxyDirection,
    ) -> Result<(), ProxyConnectionError> {
        let via_tracker = self.tracker_manager.tracker_id_for(spid).unwrap_or_default();
        let timeout = self.config.node_connect_timeout;
        match tokio::time::timeout(
            timeout,
            self.network.connect_to_node(target, &via_tracker, timeout),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(ProxyConnectionError::Connect(target.clone(), e.to_string())),
            Err(_) => return Err(ProxyConnectionError::Timeout(target.clone())),
        }

        let request_id = Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending_responses
            .lock()
            .insert(request_id.clone(), reply_tx);
        let _pending = PendingResponse {
            pending: &self.pending_responses,
            request_id: &request_id,
        };
        let request = NodeMessage::ProxyConnectionRequest(ProxyConnectionRequest {
            request_id: request_id.clone(),
            sender_id: self.node_id.clone(),
            stream_part: spid.clone(),
            direction,
        });
        if let Err(e) = self.network.send(target, request).await {
            return Err(ProxyConnectionError::Connect(target.clone(), e.to_string()));
        }

        let response = match tokio::time::timeout(self.config.response_timeout, reply_rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(ProxyConnectionError::Stopped),
            Err(_) => return Err(ProxyConnectionError::Timeout(target.clone())),
        };
        if response.accepted {
            Ok(())
        } else {
            Err(ProxyConnectionError::Rejected(
                response.reason.unwrap_or(RejectionReason::NoSuchStream),
            ))
        }
    }

    /// Installs the relation once the target accepted, unless the connection
    /// was left or the manager stopped in the meantime.
    fn on_accepted(
        &self,
        spid: &StreamPartId,
        target: &NodeId,
        direction: ProxyDirection,
    ) -> Result<(), ProxyConnectionError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ProxyConnectionError::Stopped);
        }
        {
            let mut connections = self.connections.lock();
            let Some(connection) = connections
                .get_mut(spid)
                .and_then(|targets| targets.get_mut(target))
            else {
                return Err(ProxyConnectionError::NotConnected(spid.clone(), target.clone()));
            };
            connection.state = ProxyConnectionState::Accepted;
        }
        {
            let mut streams = self.streams.lock();
            if !streams.is_set_up(spid) {
                let _ = streams.set_up_stream(spid, true);
            }
            let added = match direction {
                ProxyDirection::Publish => streams.add_outbound_node(spid, target),
                ProxyDirection::Subscribe => streams.add_inbound_node(spid, target),
            };
            if let Err(e) = added {
                warn!(spid = %spid, node_id = %target, error = %e, "Failed to install proxy relation");
            }
        }
        info!(spid = %spid, node_id = %target, direction = %direction, "Proxy connection accepted");
        let _ = self.events.send(NodeEvent::ProxyConnectionAccepted {
            node_id: target.clone(),
            stream_part: spid.clone(),
            direction,
        });
        Ok(())
    }

    /// Sends a leave request and drops the relation.
    pub async fn close_connection(
        &self,
        spid: &StreamPartId,
        target: &NodeId,
    ) -> Result<(), ProxyConnectionError> {
        let Some(connection) = self.connection(spid, target) else {
            return Err(ProxyConnectionError::NotConnected(spid.clone(), target.clone()));
        };
        self.remove_connection(spid, target);
        let leave = NodeMessage::LeaveRequest(LeaveRequest {
            request_id: Uuid::new_v4().to_string(),
            sender_id: self.node_id.clone(),
            stream_part: spid.clone(),
            direction: connection.direction,
        });
        if let Err(e) = self.network.send(target, leave).await {
            warn!(spid = %spid, node_id = %target, error = %e, "Failed to send leave request");
        }
        info!(spid = %spid, node_id = %target, "Closed proxy connection");
        Ok(())
    }

    /// Drops the record, its relation and, once no proxy is left, the stream part.
    fn remove_connection(&self, spid: &StreamPartId, target: &NodeId) {
        let key = (spid.clone(), target.clone());
        if let Some(handle) = self.reconnect_tasks.lock().remove(&key) {
            handle.abort();
        }
        let remaining = {
            let mut connections = self.connections.lock();
            let remaining = match connections.get_mut(spid) {
                Some(targets) => {
                    targets.remove(target);
                    targets.len()
                }
                None => 0,
            };
            if remaining == 0 {
                connections.remove(spid);
            }
            remaining
        };
        let torn_down = {
            let mut streams = self.streams.lock();
            if !streams.is_behind_proxy(spid) {
                false
            } else {
                streams.remove_node_from_stream(spid, target);
                if remaining == 0 {
                    streams.remove_stream(spid);
                    true
                } else {
                    false
                }
            }
        };
        if torn_down {
            self.tracker_manager.on_unsubscribe_from_stream(spid);
            debug!(spid = %spid, "Last proxy connection removed, stream part torn down");
        }
    }

    /// Answers a proxy connection request from `from`.
    pub async fn process_request(&self, from: &NodeId, request: ProxyConnectionRequest) {
        let spid = request.stream_part.clone();
        let rejection = {
            let mut streams = self.streams.lock();
            let existing = match request.direction {
                ProxyDirection::Publish => streams.has_inbound_connection(&spid, from),
                ProxyDirection::Subscribe => streams.has_outbound_connection(&spid, from),
            };
            if spid.validate().is_err()
                || !streams.is_set_up(&spid)
                || streams.is_behind_proxy(&spid)
            {
                Some(RejectionReason::NoSuchStream)
            } else if !self.config.accept_proxy_connections {
                Some(RejectionReason::NotAContact)
            } else if existing {
                Some(RejectionReason::AlreadyConnected)
            } else {
                let added = match request.direction {
                    ProxyDirection::Publish => streams.add_inbound_node(&spid, from),
                    ProxyDirection::Subscribe => streams.add_outbound_node(&spid, from),
                };
                added.err().map(|_| RejectionReason::NoSuchStream)
            }
        };

        match rejection {
            None => info!(
                spid = %spid,
                node_id = %from,
                direction = %request.direction,
                "Accepted proxy connection"
            ),
            Some(reason) => warn!(
                spid = %spid,
                node_id = %from,
                reason = %reason,
                "Rejected proxy connection"
            ),
        }
        let response = NodeMessage::ProxyConnectionResponse(ProxyConnectionResponse {
            request_id: request.request_id,
            sender_id: self.node_id.clone(),
            stream_part: spid.clone(),
            direction: request.direction,
            accepted: rejection.is_none(),
            reason: rejection,
        });
        if let Err(e) = self.network.send(from, response).await {
            warn!(spid = %spid, node_id = %from, error = %e, "Failed to send proxy connection response");
        }
    }

    pub fn process_response(&self, from: &NodeId, response: ProxyConnectionResponse) {
        match self.pending_responses.lock().remove(&response.request_id) {
            Some(reply) => {
                let _ = reply.send(response);
            }
            None => debug!(
                node_id = %from,
                request_id = %response.request_id,
                "Dropping response to unknown proxy request"
            ),
        }
    }

    /// Handles a leave request on the target side.
    ///
    /// Only the one-way relation with `from` is removed; the stream part stays
    /// subscribed.
    pub fn process_leave_request(&self, from: &NodeId, request: &LeaveRequest) -> bool {
        let spid = &request.stream_part;
        let removed = {
            let mut streams = self.streams.lock();
            match request.direction {
                ProxyDirection::Publish => streams.remove_inbound_node(spid, from),
                ProxyDirection::Subscribe => streams.remove_outbound_node(spid, from),
            }
        };
        if removed {
            info!(spid = %spid, node_id = %from, "One-way connection closed by peer");
            let _ = self.events.send(NodeEvent::OneWayConnectionClosed {
                node_id: from.clone(),
                stream_part: spid.clone(),
            });
        }
        removed
    }

    /// Restores a proxy relation after its transport connection dropped.
    ///
    /// Retries until accepted, left or stopped. Attempts go through the same
    /// in-flight slot as [`Self::open_connection`].
    pub fn reconnect(self: &Arc<Self>, target: &NodeId, spid: &StreamPartId) {
        let direction = {
            let mut connections = self.connections.lock();
            let Some(connection) = connections
                .get_mut(spid)
                .and_then(|targets| targets.get_mut(target))
            else {
                return;
            };
            connection.state = ProxyConnectionState::Retrying;
            connection.direction
        };
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let key = (spid.clone(), target.clone());
        let mut tasks = self.reconnect_tasks.lock();
        if tasks.get(&key).is_some_and(|task| !task.is_finished()) {
            return;
        }

        let manager = Arc::clone(self);
        let spid = spid.clone();
        let target = target.clone();
        let handle = tokio::spawn(async move {
            loop {
                let retrying = manager
                    .connection(&spid, &target)
                    .is_some_and(|c| c.state == ProxyConnectionState::Retrying);
                if manager.stopped.load(Ordering::SeqCst) || !retrying {
                    break;
                }
                info!(spid = %spid, node_id = %target, "Reconnecting proxy connection");
                match manager.shared_attempt(&spid, &target, direction).await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(spid = %spid, node_id = %target, error = %e, "Proxy reconnection failed");
                    }
                }
                tokio::time::sleep(manager.config.reconnection_interval).await;
            }
            manager
                .reconnect_tasks
                .lock()
                .remove(&(spid.clone(), target.clone()));
        });
        tasks.insert(key, handle);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        for (_, handle) in self.reconnect_tasks.lock().drain() {
            handle.abort();
        }
        self.pending_responses.lock().clear();
        self.connections.lock().clear();
    }

    fn emit_rejected(
        &self,
        spid: &StreamPartId,
        target: &NodeId,
        direction: ProxyDirection,
        reason: RejectionReason,
    ) {
        let _ = self.events.send(NodeEvent::ProxyConnectionRejected {
            node_id: target.clone(),
            stream_part: spid.clone(),
            direction,
            reason,
        });
    }
}

/// Clears the in-flight entry when the leading attempt finishes or is dropped.
struct InFlightSlot<'a> {
    manager: &'a ProxyStreamConnectionManager,
    key: &'a JoinKey,
    settled: bool,
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        self.manager.in_flight.lock().remove(self.key);
        if self.settled {
            return;
        }
        let (spid, target) = self.key;
        let mut connections = self.manager.connections.lock();
        if let Some(targets) = connections.get_mut(spid) {
            if targets
                .get(target)
                .is_some_and(|c| c.state == ProxyConnectionState::Negotiating)
            {
                targets.remove(target);
            }
            if targets.is_empty() {
                connections.remove(spid);
            }
        }
    }
}

struct PendingResponse<'a> {
    pending: &'a Mutex<HashMap<String, oneshot::Sender<ProxyConnectionResponse>>>,
    request_id: &'a str,
}

impl Drop for PendingResponse<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(self.request_id);
    }
}
