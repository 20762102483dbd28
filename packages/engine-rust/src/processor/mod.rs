//! Group processors: turn a released group into output messages.
//!
//! - [`AggregatingGroupProcessor`]: many in, one out
//! - [`ResequencingGroupProcessor`]: many in, the same messages out in order
//!
//! A processor runs under the key's lock and sees one immutable snapshot.

pub mod aggregate;
pub mod resequence;

use correlator_core::Message;

use crate::group::MessageGroup;

pub use aggregate::{AggregatingGroupProcessor, PayloadCombiner};
pub use resequence::ResequencingGroupProcessor;

/// Transforms a released group into zero or more output messages.
///
/// Returning an empty vector is valid: the group is consumed and nothing is
/// sent.
///
/// Used as `Arc<dyn GroupProcessor>`.
pub trait GroupProcessor: Send + Sync {
    /// Produces the outputs for `group`.
    ///
    /// # Errors
    ///
    /// Any error is surfaced as
    /// [`EngineError::Processor`](crate::error::EngineError::Processor) and
    /// leaves the group in the store.
    fn process(&self, group: &MessageGroup) -> anyhow::Result<Vec<Message>>;
}
