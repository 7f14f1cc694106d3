//! Tracker placement utilities.
//!
//! Every stream is owned by exactly one configured tracker. The owner is a pure
//! function of the stream id and the ordered tracker list, so nodes and
//! trackers agree on it without negotiation. All partitions of a stream share
//! the same tracker.

use crate::domain::protocol::TrackerInfo;
use crate::domain::stream_part::StreamPartId;
use sha2::{Digest, Sha256};

/// Deterministic index into a list of `len` trackers for a stream id.
pub fn tracker_index_for_stream(stream_id: &str, len: usize) -> Option<usize> {
    if len == 0 {
        return None;
    }
    let digest = Sha256::digest(stream_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    Some((u64::from_be_bytes(prefix) % len as u64) as usize)
}

/// Ordered set of configured trackers.
#[derive(Debug, Clone, Default)]
pub struct TrackerRegistry {
    trackers: Vec<TrackerInfo>,
}

impl TrackerRegistry {
    pub fn new(trackers: Vec<TrackerInfo>) -> Self {
        Self { trackers }
    }

    pub fn tracker_for(&self, spid: &StreamPartId) -> Option<&TrackerInfo> {
        tracker_index_for_stream(spid.stream_id(), self.trackers.len())
            .and_then(|index| self.trackers.get(index))
    }

    pub fn trackers(&self) -> &[TrackerInfo] {
        &self.trackers
    }
}
