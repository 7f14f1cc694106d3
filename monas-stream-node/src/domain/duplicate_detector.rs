//! Per-chain duplicate and gap detection.
//!
//! One detector exists per stream part. It keeps the last accepted
//! [`MessageRef`] for every (publisher, message chain) pair and classifies each
//! incoming message against it. Out-of-order or missing messages are flagged,
//! never queued.

use super::message::{MessageId, MessageRef};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError {
    /// The declared predecessor is not the last accepted message of the chain.
    /// The message itself is still accepted.
    #[error("gap mismatch: expected previous {expected}, message declared {declared:?}")]
    GapMismatch {
        expected: MessageRef,
        declared: Option<MessageRef>,
    },
    /// The message declares a predecessor that is not strictly before itself.
    #[error("invalid numbering: previous {previous} is not before {current}")]
    InvalidNumbering {
        previous: MessageRef,
        current: MessageRef,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplicateCheck {
    New,
    Duplicate,
    Error(SequenceError),
}

impl DuplicateCheck {
    /// Whether the message must be delivered and propagated.
    pub fn is_deliverable(&self) -> bool {
        matches!(
            self,
            DuplicateCheck::New | DuplicateCheck::Error(SequenceError::GapMismatch { .. })
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ChainKey {
    publisher_id: String,
    msg_chain_id: String,
}

#[derive(Debug, Default)]
pub struct DuplicateMessageDetector {
    last_refs: HashMap<ChainKey, MessageRef>,
}

impl DuplicateMessageDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies the message and advances the chain ledger when it is accepted.
    pub fn mark_and_check(
        &mut self,
        message_id: &MessageId,
        prev_msg_ref: Option<&MessageRef>,
    ) -> DuplicateCheck {
        let current = message_id.message_ref();
        if let Some(previous) = prev_msg_ref {
            if *previous >= current {
                return DuplicateCheck::Error(SequenceError::InvalidNumbering {
                    previous: *previous,
                    current,
                });
            }
        }

        let key = ChainKey {
            publisher_id: message_id.publisher_id.clone(),
            msg_chain_id: message_id.msg_chain_id.clone(),
        };
        let Some(last) = self.last_refs.get_mut(&key) else {
            // First message seen from this chain, joined possibly mid-stream.
            self.last_refs.insert(key, current);
            return DuplicateCheck::New;
        };

        if current <= *last {
            return DuplicateCheck::Duplicate;
        }

        let expected = *last;
        *last = current;
        if prev_msg_ref != Some(&expected) {
            return DuplicateCheck::Error(SequenceError::GapMismatch {
                expected,
                declared: prev_msg_ref.copied(),
            });
        }
        DuplicateCheck::New
    }

    #[cfg(test)]
    pub fn last_ref(&self, publisher_id: &str, msg_chain_id: &str) -> Option<MessageRef> {
        self.last_refs
            .get(&ChainKey {
                publisher_id: publisher_id.to_string(),
                msg_chain_id: msg_chain_id.to_string(),
            })
            .copied()
    }

    #[cfg(test)]
    pub fn chain_count(&self) -> usize {
        self.last_refs.len()
    }
}
