//! Resequencing: re-emit a group's members in sequence order.

use correlator_core::Message;

use crate::group::MessageGroup;
use crate::processor::GroupProcessor;

/// Re-emits members individually, unchanged, in ascending sequence order.
///
/// For a partial release only the run starting right after the last emitted
/// sequence number goes out; a gap halts emission. A group that is being
/// completed or has expired is flushed instead: every member still held goes
/// out in order, gaps skipped and unnumbered members last, since the group
/// is removed afterwards.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResequencingGroupProcessor;

impl GroupProcessor for ResequencingGroupProcessor {
    fn process(&self, group: &MessageGroup) -> anyhow::Result<Vec<Message>> {
        let ordered = if group.is_complete() || group.is_expired() {
            group.sorted_by_sequence()
        } else {
            group.contiguous_run()
        };
        Ok(ordered.into_iter().cloned().collect())
    }
}
