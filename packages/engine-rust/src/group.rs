//! Message group: the accumulator for one correlation key.
//!
//! A [`MessageGroup`] is a value snapshot handed out by a
//! [`MessageGroupStore`](crate::store::MessageGroupStore). The store owns the
//! authoritative state; the engine re-reads a fresh snapshot under the key's
//! lock for every operation and never caches one across lock boundaries.

use std::collections::HashSet;

use correlator_core::headers::SEQUENCE_HEADERS;
use correlator_core::{CorrelationKey, Message};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// Bookkeeping persisted alongside a group's messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMetadata {
    /// Wall-clock millis when the first message arrived.
    pub created_at: i64,
    /// Wall-clock millis of the last append or partial release. Drives expiry.
    pub last_modified_at: i64,
    /// Number of members already emitted through partial release.
    pub released_count: usize,
    /// Highest sequence number emitted through partial release. 0 = none.
    pub last_released_sequence: u32,
    /// Sequence size declared by the first member that carried one. Kept
    /// after those members are released so later arrivals are still checked.
    #[serde(default)]
    pub sequence_size: Option<u32>,
}

impl GroupMetadata {
    /// Records the sequence size declared by `message` unless one is already set.
    pub fn observe(&mut self, message: &Message) {
        if self.sequence_size.is_none() {
            self.sequence_size = message.headers().sequence_size();
        }
    }
}

/// How a message relates to the group it is being offered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The message is new and may be appended.
    Append,
    /// The very same message (same id) is already a member.
    AlreadyStored,
}

/// Ordered collection of messages sharing one correlation key.
#[derive(Debug, Clone)]
pub struct MessageGroup {
    key: CorrelationKey,
    messages: Vec<Message>,
    metadata: GroupMetadata,
    complete: bool,
    expired: bool,
}

impl MessageGroup {
    /// Creates an empty group first touched at `now`.
    #[must_use]
    pub fn new(key: CorrelationKey, now: i64) -> Self {
        Self {
            key,
            messages: Vec::new(),
            metadata: GroupMetadata {
                created_at: now,
                last_modified_at: now,
                ..GroupMetadata::default()
            },
            complete: false,
            expired: false,
        }
    }

    /// Rebuilds a group from persisted parts. `messages` must be in insertion order.
    #[must_use]
    pub fn restore(key: CorrelationKey, messages: Vec<Message>, metadata: GroupMetadata) -> Self {
        Self {
            key,
            messages,
            metadata,
            complete: false,
            expired: false,
        }
    }

    /// The correlation key shared by every member.
    #[must_use]
    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }

    /// Members not yet released, in insertion order.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Persisted bookkeeping for this group.
    #[must_use]
    pub fn metadata(&self) -> GroupMetadata {
        self.metadata
    }

    /// Number of members currently held (not yet released).
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether no members are currently held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Logical size: held members plus members already partially released.
    #[must_use]
    pub fn size(&self) -> usize {
        self.messages.len() + self.metadata.released_count
    }

    #[must_use]
    pub fn created_at(&self) -> i64 {
        self.metadata.created_at
    }

    #[must_use]
    pub fn last_modified_at(&self) -> i64 {
        self.metadata.last_modified_at
    }

    #[must_use]
    pub fn last_released_sequence(&self) -> u32 {
        self.metadata.last_released_sequence
    }

    /// The sequence number a resequencer must see next.
    #[must_use]
    pub fn next_expected_sequence(&self) -> u32 {
        self.metadata.last_released_sequence.saturating_add(1)
    }

    /// Whether this snapshot is being released in full by the release strategy.
    ///
    /// Only ever true inside the engine's critical section; forced or partial
    /// releases see `false`.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Whether this snapshot is being force-completed after timing out.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expired
    }

    /// The sequence size declared by the group's members, including members
    /// already released.
    #[must_use]
    pub fn sequence_size(&self) -> Option<u32> {
        self.metadata.sequence_size.or_else(|| {
            self.messages
                .iter()
                .find_map(|m| m.headers().sequence_size())
        })
    }

    /// The member carrying the given sequence number.
    #[must_use]
    pub fn find_sequence(&self, sequence_number: u32) -> Option<&Message> {
        self.messages
            .iter()
            .find(|m| m.headers().sequence_number() == Some(sequence_number))
    }

    /// The first member in insertion order.
    #[must_use]
    pub fn first(&self) -> Option<&Message> {
        self.messages.first()
    }

    /// Members ordered by sequence number; ties and members without a
    /// sequence number keep their insertion order (unnumbered sort last).
    #[must_use]
    pub fn sorted_by_sequence(&self) -> Vec<&Message> {
        let mut sorted: Vec<&Message> = self.messages.iter().collect();
        sorted.sort_by_key(|m| m.headers().sequence_number().unwrap_or(u32::MAX));
        sorted
    }

    /// The maximal run of members numbered `next_expected_sequence()`,
    /// `+1`, `+2`, ... in ascending order. Empty if the next number is missing.
    #[must_use]
    pub fn contiguous_run(&self) -> Vec<&Message> {
        let mut run = Vec::new();
        let mut next = self.next_expected_sequence();
        while let Some(message) = self.find_sequence(next) {
            run.push(message);
            next = next.saturating_add(1);
        }
        run
    }

    /// Snapshot holding only the contiguous run, plus the run's highest
    /// sequence number. `None` when the run is empty.
    #[must_use]
    pub fn releasable_prefix(&self) -> Option<(MessageGroup, u32)> {
        let run = self.contiguous_run();
        let last = run.last()?.headers().sequence_number()?;
        let prefix = MessageGroup {
            key: self.key.clone(),
            messages: run.into_iter().cloned().collect(),
            metadata: self.metadata,
            complete: false,
            expired: false,
        };
        Some((prefix, last))
    }

    /// Decides whether `message` may join this group.
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidSequence`] if the message declares a sequence
    ///   size different from the one already observed in the group.
    /// - [`EngineError::DuplicateSequenceNumber`] if a different message
    ///   already holds the sequence number, or the number was already
    ///   emitted by a partial release.
    pub fn admit(&self, message: &Message) -> Result<Admission, EngineError> {
        if self.messages.iter().any(|m| m.id() == message.id()) {
            return Ok(Admission::AlreadyStored);
        }

        let headers = message.headers();
        if let (Some(declared), Some(observed)) = (headers.sequence_size(), self.sequence_size()) {
            if declared != observed {
                return Err(EngineError::InvalidSequence {
                    key: self.key.clone(),
                    reason: format!(
                        "sequence size {declared} does not match group sequence size {observed}"
                    ),
                });
            }
        }

        if let Some(sequence_number) = headers.sequence_number() {
            if sequence_number <= self.metadata.last_released_sequence
                || self.find_sequence(sequence_number).is_some()
            {
                return Err(EngineError::DuplicateSequenceNumber {
                    key: self.key.clone(),
                    sequence_number,
                });
            }
        }

        Ok(Admission::Append)
    }

    /// Appends a member and bumps `last_modified_at`.
    pub fn push(&mut self, message: Message, now: i64) {
        self.metadata.observe(&message);
        self.messages.push(message);
        self.metadata.last_modified_at = now;
    }

    /// Drops released members, advancing the partial-release watermark.
    ///
    /// Returns the number of members actually removed.
    pub fn release(&mut self, released: &[Uuid], last_released_sequence: u32, now: i64) -> usize {
        let ids: HashSet<&Uuid> = released.iter().collect();
        let before = self.messages.len();
        self.messages.retain(|m| !ids.contains(&m.id()));
        let removed = before - self.messages.len();

        self.metadata.released_count += removed;
        self.metadata.last_released_sequence = self
            .metadata
            .last_released_sequence
            .max(last_released_sequence);
        self.metadata.last_modified_at = now;
        removed
    }

    /// Marks this snapshot as fully releasable.
    pub(crate) fn mark_complete(&mut self) {
        self.complete = true;
    }

    /// Marks this snapshot as timed out.
    pub(crate) fn mark_expired(&mut self) {
        self.expired = true;
    }
}

/// Checks sequence headers that can be validated without the group.
///
/// # Errors
///
/// Returns [`EngineError::InvalidSequence`] for a sequence header that is
/// present but not a non-negative 32-bit integer, for sequence number 0, or
/// for a sequence number beyond the declared sequence size.
pub fn validate_sequence_headers(key: &CorrelationKey, message: &Message) -> Result<(), EngineError> {
    let headers = message.headers();
    let typed = [headers.sequence_number(), headers.sequence_size()];
    for (name, value) in SEQUENCE_HEADERS.into_iter().zip(typed) {
        if value.is_none() {
            if let Some(raw) = headers.get(name) {
                return Err(EngineError::InvalidSequence {
                    key: key.clone(),
                    reason: format!("{name} header {raw:?} is not a non-negative 32-bit integer"),
                });
            }
        }
    }
    match (headers.sequence_number(), headers.sequence_size()) {
        (Some(0), _) => Err(EngineError::InvalidSequence {
            key: key.clone(),
            reason: "sequence numbers start at 1".to_string(),
        }),
        (Some(number), Some(size)) if number > size => Err(EngineError::InvalidSequence {
            key: key.clone(),
            reason: format!("sequence number {number} exceeds sequence size {size}"),
        }),
        _ => Ok(()),
    }
}
