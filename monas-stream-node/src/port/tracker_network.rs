//! TrackerNetwork trait - Abstract interface for tracker sessions

use crate::domain::protocol::{InstructionMessage, StatusMessage, TrackerInfo};
use crate::domain::stream_part::TrackerId;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq)]
pub enum TrackerNetworkEvent {
    ConnectedToTracker(TrackerId),
    TrackerDisconnected(TrackerId),
    InstructionReceived {
        tracker_id: TrackerId,
        instruction: InstructionMessage,
    },
}

/// Session layer towards the configured trackers.
///
/// One logical session exists per tracker endpoint. How a tracker picks
/// neighbors is outside the node; it only has to answer statuses with
/// [`InstructionMessage`]s.
#[async_trait]
pub trait TrackerNetwork: Send + Sync {
    async fn connect_to_tracker(&self, tracker: &TrackerInfo) -> Result<()>;

    async fn disconnect_from_tracker(&self, tracker_id: &TrackerId) -> Result<()>;

    async fn send_status(&self, tracker_id: &TrackerId, status: StatusMessage) -> Result<()>;

    fn subscribe_events(&self) -> broadcast::Receiver<TrackerNetworkEvent>;

    async fn stop(&self) -> Result<()>;
}
