//! Node-to-node and node-to-tracker message kinds.
//!
//! Transport framing is left to the adapters; these types only fix the
//! payloads. Every response carries the `request_id` of its request.

use super::message::StreamMessage;
use super::stream_manager::StreamPartStatus;
use super::stream_part::{NodeId, StreamPartId, TrackerId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Direction of a one-way proxy relation, seen from the requesting node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyDirection {
    /// The requester pushes data into the target.
    Publish,
    /// The requester receives data from the target.
    Subscribe,
}

impl fmt::Display for ProxyDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyDirection::Publish => write!(f, "publish"),
            ProxyDirection::Subscribe => write!(f, "subscribe"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// Target is not subscribed to the stream part, or only proxies it.
    NoSuchStream,
    /// Target does not accept proxy connections.
    NotAContact,
    /// Target already holds this relation with the requester.
    AlreadyConnected,
    /// Requester is itself subscribed to the stream part.
    AlreadySubscribed,
    /// Target could not be reached or did not answer in time.
    Unreachable,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RejectionReason::NoSuchStream => "no such stream",
            RejectionReason::NotAContact => "not a contact",
            RejectionReason::AlreadyConnected => "already connected",
            RejectionReason::AlreadySubscribed => "already subscribed",
            RejectionReason::Unreachable => "unreachable",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConnectionRequest {
    pub request_id: String,
    pub sender_id: NodeId,
    pub stream_part: StreamPartId,
    pub direction: ProxyDirection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConnectionResponse {
    pub request_id: String,
    pub sender_id: NodeId,
    pub stream_part: StreamPartId,
    pub direction: ProxyDirection,
    pub accepted: bool,
    pub reason: Option<RejectionReason>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub request_id: String,
    pub sender_id: NodeId,
    pub stream_part: StreamPartId,
    pub direction: ProxyDirection,
}

/// Messages exchanged directly between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeMessage {
    Data(StreamMessage),
    ProxyConnectionRequest(ProxyConnectionRequest),
    ProxyConnectionResponse(ProxyConnectionResponse),
    LeaveRequest(LeaveRequest),
}

impl NodeMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            NodeMessage::Data(_) => "data",
            NodeMessage::ProxyConnectionRequest(_) => "proxy_connection_request",
            NodeMessage::ProxyConnectionResponse(_) => "proxy_connection_response",
            NodeMessage::LeaveRequest(_) => "leave_request",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub country: Option<String>,
    pub city: Option<String>,
}

/// Status report sent to the tracker owning `stream`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub request_id: String,
    pub stream: StreamPartStatus,
    /// Round-trip times in milliseconds, present at most once per RTT interval.
    pub rtts: Option<HashMap<NodeId, u64>>,
    /// Start time of the node, milliseconds since the Unix epoch.
    pub started: u64,
    pub location: Option<Location>,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Neighbor assignment from a tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionMessage {
    pub request_id: String,
    pub stream_part: StreamPartId,
    pub node_ids: Vec<NodeId>,
    pub counter: u64,
}

/// Static description of a configured tracker endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackerInfo {
    pub id: TrackerId,
    pub address: String,
}
