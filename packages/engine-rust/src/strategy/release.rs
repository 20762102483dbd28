//! Release strategies: is a group ready to be emitted?

use crate::group::MessageGroup;

/// Decides when a group is complete.
///
/// Implementations are stateless: the answer depends only on the group
/// snapshot, so asking twice gives the same answer.
///
/// Used as `Arc<dyn ReleaseStrategy>`.
pub trait ReleaseStrategy: Send + Sync {
    /// Whether the whole group should be released now.
    fn can_release(&self, group: &MessageGroup) -> bool;

    /// Whether a leading part of the group can be released ahead of the
    /// rest. Only consulted when partial sequence release is enabled.
    fn can_release_partially(&self, _group: &MessageGroup) -> bool {
        false
    }

    /// Whether this strategy understands partial release at all.
    fn supports_partial_release(&self) -> bool {
        false
    }
}

/// Complete once every member of the declared sequence has arrived.
///
/// Counts members already emitted by a partial release, so a resequenced
/// group completes on its last member. A group whose members declare no
/// `sequenceSize` never completes and is left to the reaper.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceSizeReleaseStrategy;

impl ReleaseStrategy for SequenceSizeReleaseStrategy {
    fn can_release(&self, group: &MessageGroup) -> bool {
        group
            .sequence_size()
            .is_some_and(|size| group.size() == size as usize)
    }

    /// True when the next sequence number after the watermark is present.
    fn can_release_partially(&self, group: &MessageGroup) -> bool {
        group
            .find_sequence(group.next_expected_sequence())
            .is_some()
    }

    fn supports_partial_release(&self) -> bool {
        true
    }
}

/// Complete once the group holds at least `threshold` messages.
#[derive(Debug, Clone, Copy)]
pub struct MessageCountReleaseStrategy {
    threshold: usize,
}

impl MessageCountReleaseStrategy {
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }
}

impl ReleaseStrategy for MessageCountReleaseStrategy {
    fn can_release(&self, group: &MessageGroup) -> bool {
        group.size() >= self.threshold
    }
}

/// Complete when a caller-supplied predicate says so.
pub struct PredicateReleaseStrategy<F> {
    predicate: F,
}

impl<F> PredicateReleaseStrategy<F>
where
    F: Fn(&MessageGroup) -> bool + Send + Sync,
{
    #[must_use]
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> ReleaseStrategy for PredicateReleaseStrategy<F>
where
    F: Fn(&MessageGroup) -> bool + Send + Sync,
{
    fn can_release(&self, group: &MessageGroup) -> bool {
        (self.predicate)(group)
    }
}

#[cfg(test)]
mod tests {
    use correlator_core::{CorrelationKey, Message, MessageBuilder};

    use super::*;

    fn seq(number: u32, size: u32) -> Message {
        MessageBuilder::with_payload(i64::from(number))
            .correlation_id("ABC")
            .sequence_number(number)
            .sequence_size(size)
            .build()
    }

    fn group_with(messages: &[Message]) -> MessageGroup {
        let mut group = MessageGroup::new(CorrelationKey::new("ABC"), 0);
        for message in messages {
            group.push(message.clone(), 0);
        }
        group
    }

    #[test]
    fn sequence_size_releases_only_when_full() {
        let strategy = SequenceSizeReleaseStrategy;
        assert!(!strategy.can_release(&group_with(&[seq(1, 3), seq(3, 3)])));
        assert!(strategy.can_release(&group_with(&[seq(1, 3), seq(3, 3), seq(2, 3)])));
    }

    #[test]
    fn sequence_size_never_releases_without_size() {
        let strategy = SequenceSizeReleaseStrategy;
        let unsized_group = group_with(&[Message::new("a"), Message::new("b")]);
        assert!(!strategy.can_release(&unsized_group));
    }

    #[test]
    fn sequence_size_counts_partially_released_members() {
        let strategy = SequenceSizeReleaseStrategy;
        let first = seq(1, 3);
        let second = seq(2, 3);
        let mut group = group_with(&[first.clone(), second.clone()]);
        group.release(&[first.id(), second.id()], 2, 0);
        assert!(!strategy.can_release(&group));

        group.push(seq(3, 3), 0);
        assert!(strategy.can_release(&group));
    }

    #[test]
    fn partial_release_needs_next_expected_number() {
        let strategy = SequenceSizeReleaseStrategy;
        assert!(strategy.supports_partial_release());
        assert!(!strategy.can_release_partially(&group_with(&[seq(2, 4), seq(4, 4)])));
        assert!(strategy.can_release_partially(&group_with(&[seq(2, 4), seq(1, 4)])));
    }

    #[test]
    fn message_count_threshold() {
        let strategy = MessageCountReleaseStrategy::new(2);
        assert!(!strategy.supports_partial_release());
        assert!(!strategy.can_release(&group_with(&[Message::new("a")])));
        assert!(strategy.can_release(&group_with(&[Message::new("a"), Message::new("b")])));
    }

    #[test]
    fn predicate_strategy_delegates() {
        let strategy = PredicateReleaseStrategy::new(|group: &MessageGroup| {
            group
                .messages()
                .iter()
                .any(|m| m.payload().as_str() == Some("END"))
        });
        assert!(!strategy.can_release(&group_with(&[Message::new("a")])));
        assert!(strategy.can_release(&group_with(&[Message::new("a"), Message::new("END")])));
        assert!(!strategy.can_release_partially(&group_with(&[Message::new("END")])));
    }
}
