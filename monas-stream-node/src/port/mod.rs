//! Port layer - Abstract interfaces for infrastructure dependencies
//!
//! This module defines traits that abstract away the transport and tracker
//! sessions, allowing the application layer to remain independent of
//! specific implementations.

pub mod peer_discovery;
pub mod peer_network;
pub mod tracker_network;

pub use peer_discovery::PeerDiscovery;
pub use peer_network::{PeerNetwork, PeerNetworkEvent};
pub use tracker_network::{TrackerNetwork, TrackerNetworkEvent};
