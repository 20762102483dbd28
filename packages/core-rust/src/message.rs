//! Immutable message model: payload plus header map.
//!
//! A [`Message`] never changes once built. Replies and transformed messages
//! are always new messages produced by a [`MessageBuilder`], usually seeded
//! from an existing message via [`MessageBuilder::from_message`] or
//! [`MessageBuilder::copy_headers_if_absent`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::{ClockSource, SystemClock};
use crate::types::{CorrelationKey, Value};

/// Well-known header names.
pub mod headers {
    /// Unique message identifier. Stored as a dedicated field, never in the map.
    pub const ID: &str = "id";
    /// Creation time in millis since epoch. Stored as a dedicated field.
    pub const TIMESTAMP: &str = "timestamp";
    /// Default header used to correlate related messages.
    pub const CORRELATION_ID: &str = "correlationId";
    /// 1-based position of the message within its sequence.
    pub const SEQUENCE_NUMBER: &str = "sequenceNumber";
    /// Total number of messages in the sequence.
    pub const SEQUENCE_SIZE: &str = "sequenceSize";
    /// Name of the sink replies should be routed to when no output is configured.
    pub const REPLY_CHANNEL: &str = "replyChannel";

    /// Headers that describe a message's position in its sequence.
    pub const SEQUENCE_HEADERS: [&str; 2] = [SEQUENCE_NUMBER, SEQUENCE_SIZE];
}

// ---------------------------------------------------------------------------
// MessageHeaders
// ---------------------------------------------------------------------------

/// Header map of a [`Message`].
///
/// `id` and `timestamp` are mandatory and live in dedicated fields; every
/// other header is kept in an ordered map so iteration and serialization
/// are deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeaders {
    id: Uuid,
    timestamp: i64,
    values: BTreeMap<String, Value>,
}

impl MessageHeaders {
    /// Unique message identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Creation time in millis since epoch.
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Looks up an arbitrary header.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Whether a header other than `id`/`timestamp` is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// The raw `correlationId` header value.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&Value> {
        self.values.get(headers::CORRELATION_ID)
    }

    /// The `correlationId` header as a [`CorrelationKey`], if it is a scalar.
    #[must_use]
    pub fn correlation_key(&self) -> Option<CorrelationKey> {
        self.correlation_id().and_then(CorrelationKey::from_value)
    }

    /// The `sequenceNumber` header, if present and a valid `u32`. A malformed
    /// value reads as `None`; check [`MessageHeaders::get`] to tell the cases apart.
    #[must_use]
    pub fn sequence_number(&self) -> Option<u32> {
        self.u32_header(headers::SEQUENCE_NUMBER)
    }

    /// The `sequenceSize` header, if present and a non-negative integer.
    #[must_use]
    pub fn sequence_size(&self) -> Option<u32> {
        self.u32_header(headers::SEQUENCE_SIZE)
    }

    /// The `replyChannel` header, if present and a string.
    #[must_use]
    pub fn reply_channel(&self) -> Option<&str> {
        self.values.get(headers::REPLY_CHANNEL).and_then(Value::as_str)
    }

    /// Iterates all headers except `id` and `timestamp`, in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of headers in the map (excluding `id` and `timestamp`).
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the map holds no headers besides `id` and `timestamp`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn u32_header(&self, name: &str) -> Option<u32> {
        self.values
            .get(name)
            .and_then(Value::as_i64)
            .and_then(|n| u32::try_from(n).ok())
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Immutable payload + headers pair routed through the correlation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    payload: Value,
    headers: MessageHeaders,
}

impl Message {
    /// Shorthand for `MessageBuilder::with_payload(payload).build()`.
    #[must_use]
    pub fn new(payload: impl Into<Value>) -> Self {
        MessageBuilder::with_payload(payload).build()
    }

    /// The message payload.
    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// The message headers.
    #[must_use]
    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    /// Unique message identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.headers.id
    }

    /// Consumes the message, returning its payload.
    #[must_use]
    pub fn into_payload(self) -> Value {
        self.payload
    }
}

// ---------------------------------------------------------------------------
// MessageBuilder
// ---------------------------------------------------------------------------

/// Builder for new [`Message`]s.
///
/// Every built message receives a fresh `id` and a `timestamp` from the
/// builder's clock unless explicitly overridden.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    payload: Value,
    id: Option<Uuid>,
    timestamp: Option<i64>,
    values: BTreeMap<String, Value>,
}

impl MessageBuilder {
    /// Starts a message with the given payload and no headers.
    #[must_use]
    pub fn with_payload(payload: impl Into<Value>) -> Self {
        Self {
            payload: payload.into(),
            id: None,
            timestamp: None,
            values: BTreeMap::new(),
        }
    }

    /// Starts a new message that carries the payload and headers of `message`.
    ///
    /// The `id` and `timestamp` are not carried over.
    #[must_use]
    pub fn from_message(message: &Message) -> Self {
        Self {
            payload: message.payload.clone(),
            id: None,
            timestamp: None,
            values: message.headers.values.clone(),
        }
    }

    /// Overrides the generated message id.
    #[must_use]
    pub fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Overrides the creation timestamp (millis since epoch).
    #[must_use]
    pub fn timestamp(mut self, millis: i64) -> Self {
        self.timestamp = Some(millis);
        self
    }

    /// Sets an arbitrary header, replacing any existing value.
    ///
    /// `id` and `timestamp` are dedicated fields; setting them here is
    /// ignored. Use [`MessageBuilder::id`] and [`MessageBuilder::timestamp`].
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        if name != headers::ID && name != headers::TIMESTAMP {
            self.values.insert(name, value.into());
        }
        self
    }

    /// Removes a header if present.
    #[must_use]
    pub fn remove_header(mut self, name: &str) -> Self {
        self.values.remove(name);
        self
    }

    /// Sets the `correlationId` header.
    #[must_use]
    pub fn correlation_id(self, value: impl Into<Value>) -> Self {
        self.header(headers::CORRELATION_ID, value)
    }

    /// Sets the `sequenceNumber` header.
    #[must_use]
    pub fn sequence_number(self, number: u32) -> Self {
        self.header(headers::SEQUENCE_NUMBER, number)
    }

    /// Sets the `sequenceSize` header.
    #[must_use]
    pub fn sequence_size(self, size: u32) -> Self {
        self.header(headers::SEQUENCE_SIZE, size)
    }

    /// Sets the `replyChannel` header.
    #[must_use]
    pub fn reply_channel(self, name: impl Into<String>) -> Self {
        self.header(headers::REPLY_CHANNEL, Value::String(name.into()))
    }

    /// Copies every header of `source` that is not already set on this builder.
    ///
    /// This is how replies inherit context from the message they answer
    /// without clobbering headers the reply sets itself.
    #[must_use]
    pub fn copy_headers_if_absent(mut self, source: &MessageHeaders) -> Self {
        for (name, value) in &source.values {
            self.values
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
        self
    }

    /// Builds the message, stamping it with the system clock.
    #[must_use]
    pub fn build(self) -> Message {
        self.build_with_clock(&SystemClock)
    }

    /// Builds the message, stamping it with the given clock unless a
    /// timestamp was set explicitly.
    #[must_use]
    pub fn build_with_clock(self, clock: &dyn ClockSource) -> Message {
        Message {
            payload: self.payload,
            headers: MessageHeaders {
                id: self.id.unwrap_or_else(Uuid::new_v4),
                timestamp: self.timestamp.unwrap_or_else(|| clock.now()),
                values: self.values,
            },
        }
    }
}
