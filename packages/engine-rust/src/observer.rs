//! Group lifecycle observer trait and composite implementation.
//!
//! Defines [`GroupObserver`] for reacting to what the engine does with a
//! group, and [`CompositeGroupObserver`] which fans notifications out to
//! multiple observers. Observers run under the key's lock, after the store
//! has been updated; they must be quick and must not call back into the
//! engine for the same key.

use std::sync::Arc;

use correlator_core::{CorrelationKey, Message};

use crate::error::EngineError;
use crate::group::MessageGroup;

/// Observer for group lifecycle events inside a
/// [`CorrelationEngine`](crate::engine::CorrelationEngine).
///
/// Every method has an empty default so implementations pick the events
/// they care about.
///
/// Used as `Arc<dyn GroupObserver>`.
pub trait GroupObserver: Send + Sync {
    /// Called after a message was appended to its group.
    fn on_stored(&self, _group: &MessageGroup) {}

    /// Called after a group was released in full and removed.
    fn on_released(&self, _group: &MessageGroup, _outputs: &[Message]) {}

    /// Called after a leading run of a group was released.
    fn on_partial_release(&self, _key: &CorrelationKey, _outputs: &[Message]) {}

    /// Called after an expired group's members went to the discard sink.
    fn on_discarded(&self, _group: &MessageGroup) {}

    /// Called when `accept` rejects a message without touching the store.
    fn on_rejected(&self, _message: &Message, _error: &EngineError) {}
}

/// Observer that ignores every event. The engine default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopGroupObserver;

impl GroupObserver for NoopGroupObserver {}

/// Composite observer that fans out to multiple observers.
#[derive(Default)]
pub struct CompositeGroupObserver {
    observers: Vec<Arc<dyn GroupObserver>>,
}

impl CompositeGroupObserver {
    /// Creates a composite observer with the given list of observers.
    #[must_use]
    pub fn new(observers: Vec<Arc<dyn GroupObserver>>) -> Self {
        Self { observers }
    }

    /// Adds an observer after construction.
    pub fn add(&mut self, observer: Arc<dyn GroupObserver>) {
        self.observers.push(observer);
    }
}

impl GroupObserver for CompositeGroupObserver {
    fn on_stored(&self, group: &MessageGroup) {
        for observer in &self.observers {
            observer.on_stored(group);
        }
    }

    fn on_released(&self, group: &MessageGroup, outputs: &[Message]) {
        for observer in &self.observers {
            observer.on_released(group, outputs);
        }
    }

    fn on_partial_release(&self, key: &CorrelationKey, outputs: &[Message]) {
        for observer in &self.observers {
            observer.on_partial_release(key, outputs);
        }
    }

    fn on_discarded(&self, group: &MessageGroup) {
        for observer in &self.observers {
            observer.on_discarded(group);
        }
    }

    fn on_rejected(&self, message: &Message, error: &EngineError) {
        for observer in &self.observers {
            observer.on_rejected(message, error);
        }
    }
}
