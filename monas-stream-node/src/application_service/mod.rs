//! Application layer - components orchestrating the overlay node.

pub mod config;
pub mod disconnection_manager;
pub mod node;
pub mod propagation;
pub mod proxy_connection_manager;
pub mod tracker_manager;

use crate::domain::stream_manager::StreamManager;
use parking_lot::Mutex;
use std::sync::Arc;

/// Membership table shared by the node's components.
///
/// The lock is never held across an await point.
pub type SharedStreamManager = Arc<Mutex<StreamManager>>;

pub use config::{NodeConfig, PropagationConfig};
pub use disconnection_manager::DisconnectionManager;
pub use node::{DataReceivedOutcome, Node, NodeError};
pub use propagation::Propagation;
pub use proxy_connection_manager::{
    ProxyConnection, ProxyConnectionError, ProxyConnectionState, ProxyStreamConnectionManager,
};
pub use tracker_manager::{
    InstructionOutcome, StatusDescriptor, StreamSubscriber, TrackerManager, TrackerSessionState,
};
