//! Pluggable decisions of the correlation engine.
//!
//! - [`CorrelationStrategy`]: which group a message belongs to
//! - [`ReleaseStrategy`]: when a group (or a prefix of it) is ready
//!
//! Both are plain synchronous traits used as `Arc<dyn ...>`. They run under
//! the key's lock and must not block.

pub mod correlation;
pub mod release;

pub use correlation::{CorrelationStrategy, FnCorrelationStrategy, HeaderCorrelationStrategy};
pub use release::{
    MessageCountReleaseStrategy, PredicateReleaseStrategy, ReleaseStrategy,
    SequenceSizeReleaseStrategy,
};
