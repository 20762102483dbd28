//! Durable [`MessageGroupStore`] backed by an embedded `redb` database.
//!
//! Layout:
//!
//! - `group_messages`: `(correlationKey, insertionIndex) -> MsgPack message`,
//!   one record per member, so a group's members read back in insertion order
//! - `groups`: `correlationKey -> MsgPack StoredGroup` (metadata + next index)
//! - `groups_by_modified`: `(lastModifiedAt, correlationKey) -> ()`, the
//!   secondary index that lets expiry sweeps range-scan stale keys instead of
//!   reading every group
//!
//! Correlation keys are stored in their type-tagged text form
//! ([`CorrelationKey::storage_key`]).
//!
//! Every mutation runs in a single write transaction on the blocking pool.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use correlator_core::{codec, CorrelationKey, Message};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::group::{GroupMetadata, MessageGroup};
use crate::store::MessageGroupStore;

const GROUP_MESSAGES: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("group_messages");
const GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("groups");
const GROUPS_BY_MODIFIED: TableDefinition<(i64, &str), ()> =
    TableDefinition::new("groups_by_modified");

/// Per-group record in the `groups` table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredGroup {
    metadata: GroupMetadata,
    /// Insertion index assigned to the next appended member.
    next_index: u64,
}

fn unavailable(err: impl Into<redb::Error>) -> StoreError {
    StoreError::Unavailable(anyhow::Error::new(err.into()))
}

fn decode_stored_group(bytes: &[u8]) -> Result<StoredGroup, StoreError> {
    rmp_serde::from_slice(bytes)
        .map_err(|e| StoreError::Codec(correlator_core::CodecError::Decode(e)))
}

fn encode_stored_group(group: &StoredGroup) -> Result<Vec<u8>, StoreError> {
    rmp_serde::to_vec_named(group)
        .map_err(|e| StoreError::Codec(correlator_core::CodecError::Encode(e)))
}

/// Durable group store. Survives restarts; groups keep their age so the
/// reaper picks up stale groups left behind by a previous process.
pub struct RedbGroupStore {
    db: Arc<Database>,
    /// Maximum number of groups. 0 = unbounded.
    capacity: usize,
    closed: AtomicBool,
}

impl RedbGroupStore {
    /// Opens (or creates) the database file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the file cannot be opened or
    /// the tables cannot be created.
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Self, StoreError> {
        let db = Database::create(path).map_err(unavailable)?;

        // Read transactions fail on tables that were never created.
        let txn = db.begin_write().map_err(unavailable)?;
        txn.open_table(GROUP_MESSAGES).map_err(unavailable)?;
        txn.open_table(GROUPS).map_err(unavailable)?;
        txn.open_table(GROUPS_BY_MODIFIED).map_err(unavailable)?;
        txn.commit().map_err(unavailable)?;

        Ok(Self {
            db: Arc::new(db),
            capacity,
            closed: AtomicBool::new(false),
        })
    }

    /// Runs `op` against the database on the blocking thread pool.
    async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .map_err(|e| StoreError::Unavailable(e.into()))?
    }
}

/// Reads a group's metadata within a write transaction.
fn read_stored_group(txn: &WriteTransaction, key: &str) -> Result<Option<StoredGroup>, StoreError> {
    let groups = txn.open_table(GROUPS).map_err(unavailable)?;
    let stored = groups.get(key).map_err(unavailable)?;
    stored
        .map(|bytes| decode_stored_group(bytes.value()))
        .transpose()
}

/// Reads a group's members (with their insertion indexes) in insertion order.
fn read_members<T>(table: &T, key: &str) -> Result<Vec<(u64, Message)>, StoreError>
where
    T: ReadableTable<(&'static str, u64), &'static [u8]>,
{
    let mut members = Vec::new();
    for entry in table
        .range((key, 0u64)..=(key, u64::MAX))
        .map_err(unavailable)?
    {
        let (index, bytes) = entry.map_err(unavailable)?;
        members.push((index.value().1, codec::decode(bytes.value())?));
    }
    Ok(members)
}

/// Writes a group's metadata and moves its entry in the modified-time index.
fn write_stored_group(
    txn: &WriteTransaction,
    key: &str,
    previous: Option<&StoredGroup>,
    stored: &StoredGroup,
) -> Result<(), StoreError> {
    let mut index = txn.open_table(GROUPS_BY_MODIFIED).map_err(unavailable)?;
    if let Some(previous) = previous {
        index
            .remove((previous.metadata.last_modified_at, key))
            .map_err(unavailable)?;
    }
    index
        .insert((stored.metadata.last_modified_at, key), ())
        .map_err(unavailable)?;

    let mut groups = txn.open_table(GROUPS).map_err(unavailable)?;
    groups
        .insert(key, encode_stored_group(stored)?.as_slice())
        .map_err(unavailable)?;
    Ok(())
}

fn load_group(db: &Database, key: &CorrelationKey) -> Result<Option<MessageGroup>, StoreError> {
    let stored_key = key.storage_key();
    let txn = db.begin_read().map_err(unavailable)?;
    let groups = txn.open_table(GROUPS).map_err(unavailable)?;
    let Some(stored) = groups
        .get(stored_key.as_str())
        .map_err(unavailable)?
        .map(|bytes| decode_stored_group(bytes.value()))
        .transpose()?
    else {
        return Ok(None);
    };

    let messages = txn.open_table(GROUP_MESSAGES).map_err(unavailable)?;
    let members = read_members(&messages, stored_key.as_str())?
        .into_iter()
        .map(|(_, message)| message)
        .collect();
    Ok(Some(MessageGroup::restore(
        key.clone(),
        members,
        stored.metadata,
    )))
}

#[async_trait]
impl MessageGroupStore for RedbGroupStore {
    async fn group(&self, key: &CorrelationKey) -> Result<Option<MessageGroup>, StoreError> {
        let key = key.clone();
        self.run(move |db| load_group(db, &key)).await
    }

    async fn add_message(
        &self,
        key: &CorrelationKey,
        message: Message,
        now: i64,
    ) -> Result<MessageGroup, StoreError> {
        let key = key.clone();
        let capacity = self.capacity;
        let stored_key = key.storage_key();
        self.run(move |db| {
            let bytes = codec::encode(&message)?;
            let txn = db.begin_write().map_err(unavailable)?;
            let previous = read_stored_group(&txn, stored_key.as_str())?;

            let mut stored = match previous {
                Some(stored) => stored,
                None => {
                    let groups = txn.open_table(GROUPS).map_err(unavailable)?;
                    let count = groups.len().map_err(unavailable)?;
                    if capacity > 0 && count >= capacity as u64 {
                        return Err(StoreError::CapacityExceeded { capacity });
                    }
                    StoredGroup {
                        metadata: GroupMetadata {
                            created_at: now,
                            last_modified_at: now,
                            ..GroupMetadata::default()
                        },
                        next_index: 0,
                    }
                }
            };

            {
                let mut messages = txn.open_table(GROUP_MESSAGES).map_err(unavailable)?;
                messages
                    .insert((stored_key.as_str(), stored.next_index), bytes.as_slice())
                    .map_err(unavailable)?;
            }
            stored.next_index += 1;
            stored.metadata.last_modified_at = now;
            stored.metadata.observe(&message);
            write_stored_group(&txn, stored_key.as_str(), previous.as_ref(), &stored)?;
            txn.commit().map_err(unavailable)?;

            load_group(db, &key)?.ok_or_else(|| {
                StoreError::Unavailable(anyhow::anyhow!("group {key} vanished after commit"))
            })
        })
        .await
    }

    async fn mark_released(
        &self,
        key: &CorrelationKey,
        released: &[Uuid],
        last_released_sequence: u32,
        now: i64,
    ) -> Result<Option<MessageGroup>, StoreError> {
        let key = key.clone();
        let released: HashSet<Uuid> = released.iter().copied().collect();
        let stored_key = key.storage_key();
        self.run(move |db| {
            let txn = db.begin_write().map_err(unavailable)?;
            let Some(previous) = read_stored_group(&txn, stored_key.as_str())? else {
                return Ok(None);
            };

            let removed = {
                let mut messages = txn.open_table(GROUP_MESSAGES).map_err(unavailable)?;
                let doomed: Vec<u64> = read_members(&messages, stored_key.as_str())?
                    .into_iter()
                    .filter(|(_, message)| released.contains(&message.id()))
                    .map(|(index, _)| index)
                    .collect();
                for index in &doomed {
                    messages
                        .remove((stored_key.as_str(), *index))
                        .map_err(unavailable)?;
                }
                doomed.len()
            };

            let mut stored = previous;
            stored.metadata.released_count += removed;
            stored.metadata.last_released_sequence = stored
                .metadata
                .last_released_sequence
                .max(last_released_sequence);
            stored.metadata.last_modified_at = now;
            write_stored_group(&txn, stored_key.as_str(), Some(&previous), &stored)?;
            txn.commit().map_err(unavailable)?;

            load_group(db, &key)
        })
        .await
    }

    async fn remove_group(&self, key: &CorrelationKey) -> Result<Option<MessageGroup>, StoreError> {
        let key = key.clone();
        let stored_key = key.storage_key();
        self.run(move |db| {
            let Some(group) = load_group(db, &key)? else {
                return Ok(None);
            };

            let txn = db.begin_write().map_err(unavailable)?;
            if let Some(stored) = read_stored_group(&txn, stored_key.as_str())? {
                let mut index = txn.open_table(GROUPS_BY_MODIFIED).map_err(unavailable)?;
                index
                    .remove((stored.metadata.last_modified_at, stored_key.as_str()))
                    .map_err(unavailable)?;
            }
            {
                let mut messages = txn.open_table(GROUP_MESSAGES).map_err(unavailable)?;
                let indexes: Vec<u64> = read_members(&messages, stored_key.as_str())?
                    .into_iter()
                    .map(|(index, _)| index)
                    .collect();
                for index in indexes {
                    messages
                        .remove((stored_key.as_str(), index))
                        .map_err(unavailable)?;
                }
                let mut groups = txn.open_table(GROUPS).map_err(unavailable)?;
                groups.remove(stored_key.as_str()).map_err(unavailable)?;
            }
            txn.commit().map_err(unavailable)?;
            Ok(Some(group))
        })
        .await
    }

    async fn message_count(&self, key: &CorrelationKey) -> Result<usize, StoreError> {
        Ok(self.group(key).await?.map_or(0, |g| g.len()))
    }

    async fn group_count(&self) -> Result<usize, StoreError> {
        self.run(|db| {
            let txn = db.begin_read().map_err(unavailable)?;
            let groups = txn.open_table(GROUPS).map_err(unavailable)?;
            let count = groups.len().map_err(unavailable)?;
            usize::try_from(count).map_err(|e| StoreError::Unavailable(e.into()))
        })
        .await
    }

    async fn keys_older_than(&self, cutoff: i64) -> Result<Vec<CorrelationKey>, StoreError> {
        self.run(move |db| {
            let txn = db.begin_read().map_err(unavailable)?;
            let index = txn.open_table(GROUPS_BY_MODIFIED).map_err(unavailable)?;
            let mut keys = Vec::new();
            // "" sorts before every key, so this bound excludes exactly `cutoff`.
            for entry in index.range(..(cutoff, "")).map_err(unavailable)? {
                let (indexed, _) = entry.map_err(unavailable)?;
                let stored_key = indexed.value().1;
                let key = CorrelationKey::parse_storage_key(stored_key).ok_or_else(|| {
                    StoreError::Unavailable(anyhow::anyhow!("malformed group key {stored_key:?}"))
                })?;
                keys.push(key);
            }
            Ok(keys)
        })
        .await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
