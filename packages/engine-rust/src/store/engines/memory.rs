//! In-memory [`MessageGroupStore`] implementation backed by [`DashMap`].
//!
//! Provides concurrent access without external locking. Suitable for
//! development, testing, and production workloads where losing in-flight
//! groups on restart is acceptable.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use correlator_core::{CorrelationKey, Message};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::StoreError;
use crate::group::MessageGroup;
use crate::store::MessageGroupStore;

/// In-memory group store backed by [`DashMap`].
///
/// Groups for different keys live in different shards, so unrelated keys
/// never contend. An optional capacity bounds the number of tracked
/// correlation keys: creating a group beyond it fails with
/// [`StoreError::CapacityExceeded`] rather than evicting accumulated state.
pub struct InMemoryGroupStore {
    groups: DashMap<CorrelationKey, MessageGroup>,
    /// Maximum number of groups. 0 = unbounded.
    capacity: usize,
    /// Group count maintained outside the map so capacity checks never take
    /// a second shard lock while an entry is held.
    group_count: AtomicUsize,
    closed: AtomicBool,
}

impl InMemoryGroupStore {
    /// Creates a new, empty, unbounded store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates a store that tracks at most `capacity` groups (0 = unbounded).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            groups: DashMap::new(),
            capacity,
            group_count: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    /// Claims a slot for a new group, failing when the store is full.
    fn reserve_slot(&self) -> Result<(), StoreError> {
        let capacity = self.capacity;
        self.group_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (capacity == 0 || count < capacity).then_some(count + 1)
            })
            .map(|_| ())
            .map_err(|_| StoreError::CapacityExceeded { capacity })
    }
}

impl Default for InMemoryGroupStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageGroupStore for InMemoryGroupStore {
    async fn group(&self, key: &CorrelationKey) -> Result<Option<MessageGroup>, StoreError> {
        self.ensure_open()?;
        Ok(self.groups.get(key).map(|g| g.clone()))
    }

    async fn add_message(
        &self,
        key: &CorrelationKey,
        message: Message,
        now: i64,
    ) -> Result<MessageGroup, StoreError> {
        self.ensure_open()?;
        match self.groups.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let group = occupied.get_mut();
                group.push(message, now);
                Ok(group.clone())
            }
            Entry::Vacant(vacant) => {
                self.reserve_slot()?;
                let mut group = MessageGroup::new(key.clone(), now);
                group.push(message, now);
                vacant.insert(group.clone());
                Ok(group)
            }
        }
    }

    async fn mark_released(
        &self,
        key: &CorrelationKey,
        released: &[Uuid],
        last_released_sequence: u32,
        now: i64,
    ) -> Result<Option<MessageGroup>, StoreError> {
        self.ensure_open()?;
        Ok(self.groups.get_mut(key).map(|mut group| {
            group.release(released, last_released_sequence, now);
            group.clone()
        }))
    }

    async fn remove_group(&self, key: &CorrelationKey) -> Result<Option<MessageGroup>, StoreError> {
        self.ensure_open()?;
        let removed = self.groups.remove(key).map(|(_, group)| group);
        if removed.is_some() {
            self.group_count.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(removed)
    }

    async fn message_count(&self, key: &CorrelationKey) -> Result<usize, StoreError> {
        self.ensure_open()?;
        Ok(self.groups.get(key).map_or(0, |g| g.len()))
    }

    async fn group_count(&self) -> Result<usize, StoreError> {
        self.ensure_open()?;
        Ok(self.groups.len())
    }

    async fn keys_older_than(&self, cutoff: i64) -> Result<Vec<CorrelationKey>, StoreError> {
        self.ensure_open()?;
        Ok(self
            .groups
            .iter()
            .filter(|entry| entry.value().last_modified_at() < cutoff)
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        self.groups.clear();
        self.group_count.store(0, Ordering::Release);
        Ok(())
    }
}
