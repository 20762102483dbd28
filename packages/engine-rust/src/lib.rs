//! Correlator Engine — groups related messages and releases each group once.
//!
//! Messages are correlated into [`MessageGroup`]s held by a
//! [`MessageGroupStore`]. A [`ReleaseStrategy`] decides when a group is
//! complete, a [`GroupProcessor`] turns it into outputs, and a
//! [`MessageSink`] delivers them. A background reaper expires groups that
//! never complete.

pub mod config;
pub mod engine;
pub mod error;
pub mod group;
pub mod locks;
pub mod observer;
pub mod processor;
pub mod runtime;
pub mod sink;
pub mod store;
pub mod strategy;

pub use config::EngineConfig;
pub use engine::{AcceptOutcome, CorrelationEngine, CorrelationEngineBuilder};
pub use error::{EngineError, StoreError};
pub use group::{GroupMetadata, MessageGroup};
pub use observer::{CompositeGroupObserver, GroupObserver, NoopGroupObserver};
pub use processor::{AggregatingGroupProcessor, GroupProcessor, ResequencingGroupProcessor};
pub use runtime::{LifecycleState, ReaperTask};
pub use sink::{ChannelSink, FnSink, MapSinkResolver, MessageSink, NullSink, QueueSink, SinkResolver};
#[cfg(feature = "redb")]
pub use store::RedbGroupStore;
pub use store::{InMemoryGroupStore, MessageGroupStore};
pub use strategy::{
    CorrelationStrategy, FnCorrelationStrategy, HeaderCorrelationStrategy,
    MessageCountReleaseStrategy, PredicateReleaseStrategy, ReleaseStrategy,
    SequenceSizeReleaseStrategy,
};
