//! Data message envelope carried through the overlay.
//!
//! The payload and the signature/encryption metadata are opaque to the node;
//! only the identifiers and the chain reference are interpreted.

use super::stream_part::{InvalidStreamPartId, NodeId, StreamPartId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a message inside its (publisher, chain) sequence.
///
/// Ordering is lexicographic: timestamp first, then sequence number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct MessageRef {
    pub timestamp: u64,
    pub sequence_number: u32,
}

impl MessageRef {
    pub fn new(timestamp: u64, sequence_number: u32) -> Self {
        Self {
            timestamp,
            sequence_number,
        }
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.timestamp, self.sequence_number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId {
    pub stream_part: StreamPartId,
    pub timestamp: u64,
    pub sequence_number: u32,
    pub publisher_id: String,
    pub msg_chain_id: String,
}

impl MessageId {
    pub fn new(
        stream_part: StreamPartId,
        timestamp: u64,
        sequence_number: u32,
        publisher_id: impl Into<String>,
        msg_chain_id: impl Into<String>,
    ) -> Self {
        Self {
            stream_part,
            timestamp,
            sequence_number,
            publisher_id: publisher_id.into(),
            msg_chain_id: msg_chain_id.into(),
        }
    }

    pub fn message_ref(&self) -> MessageRef {
        MessageRef::new(self.timestamp, self.sequence_number)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.stream_part,
            self.publisher_id,
            self.msg_chain_id,
            self.message_ref()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureType {
    #[default]
    None,
    Secp256k1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionType {
    #[default]
    None,
    Aes,
    Rsa,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessage {
    pub message_id: MessageId,
    pub prev_msg_ref: Option<MessageRef>,
    pub content: Vec<u8>,
    #[serde(default)]
    pub signature_type: SignatureType,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub encryption_type: EncryptionType,
}

impl StreamMessage {
    pub fn new(message_id: MessageId, prev_msg_ref: Option<MessageRef>, content: Vec<u8>) -> Self {
        Self {
            message_id,
            prev_msg_ref,
            content,
            signature_type: SignatureType::None,
            signature: None,
            encryption_type: EncryptionType::None,
        }
    }

    pub fn with_signature(mut self, signature_type: SignatureType, signature: String) -> Self {
        self.signature_type = signature_type;
        self.signature = Some(signature);
        self
    }

    pub fn with_encryption(mut self, encryption_type: EncryptionType) -> Self {
        self.encryption_type = encryption_type;
        self
    }

    pub fn stream_part(&self) -> &StreamPartId {
        &self.message_id.stream_part
    }

    pub fn publisher_id(&self) -> &NodeId {
        &self.message_id.publisher_id
    }

    pub fn timestamp(&self) -> u64 {
        self.message_id.timestamp
    }

    pub fn validate(&self) -> Result<(), InvalidStreamPartId> {
        self.message_id.stream_part.validate()
    }
}
