//! Infrastructure layer - concrete adapters behind the ports.

pub mod memory_network;
pub mod memory_tracker;
pub mod metrics;
pub mod placement;

pub use memory_network::{MemoryNetwork, MemoryTransport};
pub use memory_tracker::{MemoryTracker, MemoryTrackerClient};
pub use metrics::{Metrics, MetricsContext, MetricsReport};
pub use placement::{tracker_index_for_stream, TrackerRegistry};
