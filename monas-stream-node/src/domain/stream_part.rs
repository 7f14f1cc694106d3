//! Stream-partition identifiers and peer identity aliases.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Opaque identifier of a peer node.
pub type NodeId = String;

/// Identifier of a tracker endpoint.
pub type TrackerId = String;

const KEY_SEPARATOR: char = '#';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidStreamPartId {
    #[error("stream id must not be empty")]
    EmptyStreamId,
    #[error("stream id must not contain '#': {0}")]
    ReservedCharacter(String),
    #[error("malformed stream part key: {0}")]
    MalformedKey(String),
}

/// Immutable (stream id, partition) pair. The unit of subscription and propagation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamPartId {
    stream_id: String,
    partition: u32,
}

impl StreamPartId {
    pub fn new(stream_id: impl Into<String>, partition: u32) -> Result<Self, InvalidStreamPartId> {
        let stream_id = stream_id.into();
        if stream_id.is_empty() {
            return Err(InvalidStreamPartId::EmptyStreamId);
        }
        if stream_id.contains(KEY_SEPARATOR) {
            return Err(InvalidStreamPartId::ReservedCharacter(stream_id));
        }
        Ok(Self {
            stream_id,
            partition,
        })
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Textual key in the form `"{stream_id}#{partition}"`.
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Re-checks the invariants of a value that was deserialized from the wire.
    pub fn validate(&self) -> Result<(), InvalidStreamPartId> {
        Self::new(self.stream_id.clone(), self.partition).map(|_| ())
    }
}

impl fmt::Display for StreamPartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.stream_id, KEY_SEPARATOR, self.partition)
    }
}

impl FromStr for StreamPartId {
    type Err = InvalidStreamPartId;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let (stream_id, partition) = key
            .rsplit_once(KEY_SEPARATOR)
            .ok_or_else(|| InvalidStreamPartId::MalformedKey(key.to_string()))?;
        let partition = partition
            .parse::<u32>()
            .map_err(|_| InvalidStreamPartId::MalformedKey(key.to_string()))?;
        Self::new(stream_id, partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_form_is_stream_and_partition() {
        let spid = StreamPartId::new("stream-1", 3).unwrap();
        assert_eq!(spid.key(), "stream-1#3");
        assert_eq!("stream-1#3".parse::<StreamPartId>().unwrap(), spid);
    }

    #[test]
    fn rejects_empty_and_reserved_stream_ids() {
        assert_eq!(
            StreamPartId::new("", 0),
            Err(InvalidStreamPartId::EmptyStreamId)
        );
        assert!(matches!(
            StreamPartId::new("a#b", 0),
            Err(InvalidStreamPartId::ReservedCharacter(_))
        ));
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!("no-separator".parse::<StreamPartId>().is_err());
        assert!("s#-1".parse::<StreamPartId>().is_err());
        assert!("#0".parse::<StreamPartId>().is_err());
    }

    #[test]
    fn ordering_is_by_stream_then_partition() {
        let a0 = StreamPartId::new("a", 0).unwrap();
        let a1 = StreamPartId::new("a", 1).unwrap();
        let b0 = StreamPartId::new("b", 0).unwrap();
        let mut ids = vec![b0.clone(), a1.clone(), a0.clone()];
        ids.sort();
        assert_eq!(ids, vec![a0, a1, b0]);
    }
}
