//! PeerDiscovery trait - strategy for finding peers of a new stream part

use crate::domain::stream_part::StreamPartId;
use anyhow::Result;
use async_trait::async_trait;

/// Invoked whenever the node sets up a stream part it was not handling yet.
///
/// The default strategy registers the stream part with the tracker owning it
/// and lets the tracker's instructions connect the neighbors.
#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    async fn discover_and_connect(&self, stream_part: &StreamPartId) -> Result<()>;
}
