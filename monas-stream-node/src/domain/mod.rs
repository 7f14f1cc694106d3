//! Domain layer - pure overlay state with no I/O.

pub mod duplicate_detector;
pub mod events;
pub mod message;
pub mod protocol;
pub mod stream_manager;
pub mod stream_part;

pub use duplicate_detector::{DuplicateCheck, DuplicateMessageDetector, SequenceError};
pub use events::NodeEvent;
pub use message::{EncryptionType, MessageId, MessageRef, SignatureType, StreamMessage};
pub use protocol::{
    InstructionMessage, LeaveRequest, Location, NodeMessage, ProxyConnectionRequest,
    ProxyConnectionResponse, ProxyDirection, RejectionReason, StatusMessage, TrackerInfo,
};
pub use stream_manager::{StreamManager, StreamManagerError, StreamPartStatus};
pub use stream_part::{InvalidStreamPartId, NodeId, StreamPartId, TrackerId};
