//! Error types for the correlation engine and its group stores.

use correlator_core::{CodecError, CorrelationKey};

/// Errors raised by a [`MessageGroupStore`](crate::store::MessageGroupStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("group store unavailable: {0}")]
    Unavailable(#[from] anyhow::Error),
    #[error("group store capacity of {capacity} groups exceeded")]
    CapacityExceeded { capacity: usize },
    #[error("stored message is corrupt: {0}")]
    Codec(#[from] CodecError),
    #[error("group store is closed")]
    Closed,
}

/// Errors returned by [`CorrelationEngine`](crate::engine::CorrelationEngine).
///
/// Validation failures (`NullPayload`, `MissingCorrelationKey`,
/// `DuplicateSequenceNumber`, `InvalidSequence`) are returned before the store is touched, so the
/// group is never partially mutated.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("message {message_id} has a null payload")]
    NullPayload { message_id: uuid::Uuid },
    #[error("no correlation key could be derived from message {message_id}")]
    MissingCorrelationKey { message_id: uuid::Uuid },
    #[error("group {key} already holds sequence number {sequence_number}")]
    DuplicateSequenceNumber {
        key: CorrelationKey,
        sequence_number: u32,
    },
    #[error("message rejected by group {key}: {reason}")]
    InvalidSequence { key: CorrelationKey, reason: String },
    #[error("delivery failed for group {key} after {delivered} of {total} messages")]
    SinkDelivery {
        key: CorrelationKey,
        delivered: usize,
        total: usize,
    },
    #[error("no output sink configured and no resolvable reply channel for group {key}")]
    UnresolvedOutput { key: CorrelationKey },
    #[error("group processor failed for group {key}: {source}")]
    Processor {
        key: CorrelationKey,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("engine is shutting down")]
    ShuttingDown,
    #[error("invalid engine configuration: {0}")]
    Config(String),
}

impl EngineError {
    /// Whether the error rejected only the offending message and left the
    /// engine and its group intact (the caller may discard or reroute it).
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::NullPayload { .. }
                | Self::MissingCorrelationKey { .. }
                | Self::DuplicateSequenceNumber { .. }
                | Self::InvalidSequence { .. }
        )
    }
}
