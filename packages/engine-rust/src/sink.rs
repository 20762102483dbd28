//! Output and discard sinks, plus reply-channel resolution.
//!
//! A [`MessageSink`] is the engine's only way out. `send` reports success as
//! a plain `bool`: a `false` keeps the group in the store so the release can
//! be retried later.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use correlator_core::Message;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Destination for released or discarded messages.
///
/// Used as `Arc<dyn MessageSink>`.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Delivers `message`. Returns `false` if it was not accepted.
    async fn send(&self, message: Message) -> bool;
}

// ---------------------------------------------------------------------------
// Provided sinks
// ---------------------------------------------------------------------------

/// Accepts and drops every message. The default discard sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl MessageSink for NullSink {
    async fn send(&self, _message: Message) -> bool {
        true
    }
}

/// Bounded tokio channel; waits up to `send_timeout` for queue capacity.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Message>,
    send_timeout: Duration,
}

impl ChannelSink {
    #[must_use]
    pub fn new(tx: mpsc::Sender<Message>, send_timeout: Duration) -> Self {
        Self { tx, send_timeout }
    }

    /// Creates a sink together with the receiving half of its channel.
    #[must_use]
    pub fn channel(capacity: usize, send_timeout: Duration) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx, send_timeout), rx)
    }
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn send(&self, message: Message) -> bool {
        matches!(
            tokio::time::timeout(self.send_timeout, self.tx.send(message)).await,
            Ok(Ok(()))
        )
    }
}

/// In-memory sink that records what it receives.
///
/// Can be switched to refuse deliveries, which is how callers exercise the
/// engine's delivery-failure path.
#[derive(Debug)]
pub struct QueueSink {
    messages: Mutex<Vec<Message>>,
    accepting: AtomicBool,
}

impl QueueSink {
    #[must_use]
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            accepting: AtomicBool::new(true),
        }
    }

    /// Makes subsequent sends succeed (`true`) or fail (`false`).
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Release);
    }

    /// Everything delivered so far, in delivery order.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    /// Removes and returns everything delivered so far.
    #[must_use]
    pub fn drain(&self) -> Vec<Message> {
        std::mem::take(&mut *self.messages.lock())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

impl Default for QueueSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageSink for QueueSink {
    async fn send(&self, message: Message) -> bool {
        if !self.accepting.load(Ordering::Acquire) {
            return false;
        }
        self.messages.lock().push(message);
        true
    }
}

/// Delegates to a synchronous closure.
pub struct FnSink<F> {
    f: F,
}

impl<F> FnSink<F>
where
    F: Fn(Message) -> bool + Send + Sync,
{
    #[must_use]
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> MessageSink for FnSink<F>
where
    F: Fn(Message) -> bool + Send + Sync,
{
    async fn send(&self, message: Message) -> bool {
        (self.f)(message)
    }
}

// ---------------------------------------------------------------------------
// Reply channel resolution
// ---------------------------------------------------------------------------

/// Looks up sinks by the name carried in a message's `replyChannel` header.
///
/// Used as `Arc<dyn SinkResolver>`.
pub trait SinkResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Arc<dyn MessageSink>>;
}

/// Name -> sink registry.
#[derive(Default)]
pub struct MapSinkResolver {
    sinks: DashMap<String, Arc<dyn MessageSink>>,
}

impl MapSinkResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `sink` under `name`, replacing any previous registration.
    pub fn register(&self, name: impl Into<String>, sink: Arc<dyn MessageSink>) {
        self.sinks.insert(name.into(), sink);
    }
}

impl fmt::Debug for MapSinkResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.sinks.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("MapSinkResolver").field("sinks", &names).finish()
    }
}

impl SinkResolver for MapSinkResolver {
    fn resolve(&self, name: &str) -> Option<Arc<dyn MessageSink>> {
        self.sinks.get(name).map(|e| Arc::clone(e.value()))
    }
}
