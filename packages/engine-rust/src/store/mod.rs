//! Persistence layer for message groups.
//!
//! Provides the [`MessageGroupStore`] trait and its implementations:
//!
//! - [`InMemoryGroupStore`]: `DashMap`-backed default store with an optional
//!   cap on tracked correlation keys
//! - [`RedbGroupStore`] (feature `redb`): durable store with one record per
//!   `(correlationKey, insertionIndex)` and a `lastModifiedAt` secondary index
//!
//! Stores own group state exclusively. They do not lock per key themselves:
//! the engine serializes all mutation of a key behind that key's lock.

pub mod engines;

use async_trait::async_trait;
use correlator_core::{CorrelationKey, Message};
use uuid::Uuid;

use crate::error::StoreError;
use crate::group::MessageGroup;

pub use engines::memory::InMemoryGroupStore;
#[cfg(feature = "redb")]
pub use engines::redb::RedbGroupStore;

/// Pluggable persistence for message groups.
///
/// Timestamps (`now`, `cutoff`) are supplied by the caller so a single
/// clock source drives both stamping and expiry.
///
/// Used as `Arc<dyn MessageGroupStore>`.
#[async_trait]
pub trait MessageGroupStore: Send + Sync {
    /// Snapshot of the group for `key`, or `None` if no group exists.
    async fn group(&self, key: &CorrelationKey) -> Result<Option<MessageGroup>, StoreError>;

    /// Appends `message` to the group for `key`, creating the group if needed.
    ///
    /// Returns the updated group snapshot.
    async fn add_message(
        &self,
        key: &CorrelationKey,
        message: Message,
        now: i64,
    ) -> Result<MessageGroup, StoreError>;

    /// Removes partially released members and advances the group's watermark.
    ///
    /// Returns the updated snapshot, or `None` if the group does not exist.
    async fn mark_released(
        &self,
        key: &CorrelationKey,
        released: &[Uuid],
        last_released_sequence: u32,
        now: i64,
    ) -> Result<Option<MessageGroup>, StoreError>;

    /// Deletes the group and all of its members, returning what was removed.
    async fn remove_group(&self, key: &CorrelationKey) -> Result<Option<MessageGroup>, StoreError>;

    /// Number of members currently held by the group for `key` (0 if absent).
    async fn message_count(&self, key: &CorrelationKey) -> Result<usize, StoreError>;

    /// Number of groups currently tracked.
    async fn group_count(&self) -> Result<usize, StoreError>;

    /// Keys whose group was last modified strictly before `cutoff`.
    async fn keys_older_than(&self, cutoff: i64) -> Result<Vec<CorrelationKey>, StoreError>;

    /// Release resources. Further calls may fail with [`StoreError::Closed`].
    async fn close(&self) -> Result<(), StoreError>;
}
