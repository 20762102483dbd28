//! Aggregation: combine a group's payloads into a single message.

use std::fmt;

use correlator_core::{headers, Message, MessageBuilder, Value};

use crate::group::MessageGroup;
use crate::processor::GroupProcessor;

/// Combines the members of a group, ordered by sequence number, into one
/// payload. `Ok(None)` swallows the group: it is released with no output.
pub type PayloadCombiner =
    Box<dyn Fn(&[&Message]) -> anyhow::Result<Option<Value>> + Send + Sync>;

/// Emits one message per released group.
///
/// Members are handed to the combiner in sequence-number order (insertion
/// order breaks ties). The output message:
///
/// - carries the `correlationId` of the group
/// - keeps every other header whose value is identical on all members
/// - drops headers whose values conflict, and never copies the sequence
///   headers of its inputs
pub struct AggregatingGroupProcessor {
    combiner: PayloadCombiner,
}

impl AggregatingGroupProcessor {
    /// Collects member payloads into a `Value::Array`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_combiner(|members| {
            Ok(Some(Value::Array(
                members.iter().map(|m| m.payload().clone()).collect(),
            )))
        })
    }

    /// Joins string payloads, in order, into a single string.
    ///
    /// Fails on any non-string payload.
    #[must_use]
    pub fn concatenating() -> Self {
        Self::with_combiner(|members| {
            let mut joined = String::new();
            for member in members {
                let Some(part) = member.payload().as_str() else {
                    anyhow::bail!("message {} does not carry a string payload", member.id());
                };
                joined.push_str(part);
            }
            Ok(Some(Value::String(joined)))
        })
    }

    /// Uses a custom combiner.
    #[must_use]
    pub fn with_combiner<F>(combiner: F) -> Self
    where
        F: Fn(&[&Message]) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        Self {
            combiner: Box::new(combiner),
        }
    }
}

impl Default for AggregatingGroupProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AggregatingGroupProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregatingGroupProcessor").finish_non_exhaustive()
    }
}

impl GroupProcessor for AggregatingGroupProcessor {
    fn process(&self, group: &MessageGroup) -> anyhow::Result<Vec<Message>> {
        let members = group.sorted_by_sequence();
        let Some(payload) = (self.combiner)(&members)? else {
            return Ok(Vec::new());
        };

        let mut builder = MessageBuilder::with_payload(payload);
        if let Some(first) = members.first() {
            for (name, value) in first.headers().iter() {
                if headers::SEQUENCE_HEADERS.contains(&name) {
                    continue;
                }
                if members.iter().all(|m| m.headers().get(name) == Some(value)) {
                    builder = builder.header(name, value.clone());
                }
            }
        }

        let correlation_id = members
            .first()
            .and_then(|m| m.headers().correlation_id().cloned())
            .unwrap_or_else(|| group.key().to_value());
        Ok(vec![builder.correlation_id(correlation_id).build()])
    }
}
