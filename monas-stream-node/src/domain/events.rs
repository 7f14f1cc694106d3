//! Events a node emits to its observers.

use super::duplicate_detector::SequenceError;
use super::message::StreamMessage;
use super::protocol::{ProxyDirection, RejectionReason};
use super::stream_part::{NodeId, StreamPartId};

/// Observable events emitted by a node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    NodeConnected {
        node_id: NodeId,
    },
    NodeDisconnected {
        node_id: NodeId,
    },
    /// Any data message handed to the node, including duplicates.
    MessageReceived {
        message: StreamMessage,
        source: Option<NodeId>,
    },
    /// A data message seen for the first time.
    UnseenMessageReceived {
        message: StreamMessage,
        source: Option<NodeId>,
    },
    GapDetected {
        message: StreamMessage,
        source: Option<NodeId>,
        error: SequenceError,
    },
    NodeSubscribed {
        node_id: NodeId,
        stream_part: StreamPartId,
    },
    NodeUnsubscribed {
        node_id: NodeId,
        stream_part: StreamPartId,
    },
    ProxyConnectionAccepted {
        node_id: NodeId,
        stream_part: StreamPartId,
        direction: ProxyDirection,
    },
    ProxyConnectionRejected {
        node_id: NodeId,
        stream_part: StreamPartId,
        direction: ProxyDirection,
        reason: RejectionReason,
    },
    OneWayConnectionClosed {
        node_id: NodeId,
        stream_part: StreamPartId,
    },
}
