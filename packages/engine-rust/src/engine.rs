//! The correlation engine: accept, release, force-complete, expire.
//!
//! Per key, a group moves through:
//!
//! ```text
//! absent -> accumulating -> releasing -> absent
//!                        \-> discarding -> absent
//! ```
//!
//! A partial release keeps the group accumulating. Every transition for a
//! key happens under that key's lock, and the group is always re-read from
//! the store after the lock is taken, so the release decision sees every
//! message appended before it.

use std::sync::Arc;
use std::time::Duration;

use correlator_core::{ClockSource, CorrelationKey, Message, SystemClock};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::group::{validate_sequence_headers, Admission, MessageGroup};
use crate::locks::KeyLocks;
use crate::observer::{GroupObserver, NoopGroupObserver};
use crate::processor::GroupProcessor;
use crate::runtime::{
    BackgroundWorker, GroupReaper, LifecycleController, LifecycleState, ReaperTask,
};
use crate::sink::{MessageSink, NullSink, SinkResolver};
use crate::store::{InMemoryGroupStore, MessageGroupStore};
use crate::strategy::{
    CorrelationStrategy, HeaderCorrelationStrategy, ReleaseStrategy, SequenceSizeReleaseStrategy,
};

// ---------------------------------------------------------------------------
// AcceptOutcome
// ---------------------------------------------------------------------------

/// What `accept` did with a message that was not rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum AcceptOutcome {
    /// Appended; the group is still accumulating.
    Stored,
    /// The same message (same id) was already a member. Nothing changed.
    AlreadyStored,
    /// The group completed, its outputs were delivered, and it was removed.
    Released { outputs: Vec<Message> },
    /// A leading run of the sequence was delivered; the rest keeps waiting.
    PartiallyReleased { outputs: Vec<Message> },
    /// The message was stored and the group was ready, but the output sink
    /// refused a message. The group is kept and retried by the reaper.
    DeliveryFailed { delivered: usize, total: usize },
}

// ---------------------------------------------------------------------------
// CorrelationEngine
// ---------------------------------------------------------------------------

/// Groups related messages and emits each group exactly once.
///
/// Built with [`CorrelationEngine::builder`]. Wrap it in an `Arc` to share
/// it between producers and to run the reaper.
pub struct CorrelationEngine {
    store: Arc<dyn MessageGroupStore>,
    correlation: Arc<dyn CorrelationStrategy>,
    release: Arc<dyn ReleaseStrategy>,
    processor: Arc<dyn GroupProcessor>,
    output: Option<Arc<dyn MessageSink>>,
    discard: Arc<dyn MessageSink>,
    resolver: Option<Arc<dyn SinkResolver>>,
    observer: Arc<dyn GroupObserver>,
    clock: Arc<dyn ClockSource>,
    config: EngineConfig,
    locks: KeyLocks,
    lifecycle: LifecycleController,
    reaper: Mutex<Option<BackgroundWorker<GroupReaper>>>,
}

impl CorrelationEngine {
    /// Starts building an engine around `processor`.
    #[must_use]
    pub fn builder(processor: Arc<dyn GroupProcessor>) -> CorrelationEngineBuilder {
        CorrelationEngineBuilder::new(processor)
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn MessageGroupStore> {
        &self.store
    }

    #[must_use]
    pub fn lifecycle_state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Snapshot of the group currently held for `key`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn group(&self, key: &CorrelationKey) -> Result<Option<MessageGroup>, EngineError> {
        Ok(self.store.group(key).await?)
    }

    /// Offers a message to its group and releases the group if it is ready.
    ///
    /// # Errors
    ///
    /// - [`EngineError::ShuttingDown`] once [`shutdown`](Self::shutdown) began
    /// - [`EngineError::NullPayload`], [`EngineError::MissingCorrelationKey`],
    ///   [`EngineError::DuplicateSequenceNumber`],
    ///   [`EngineError::InvalidSequence`]: the message is rejected and the
    ///   group is left untouched
    /// - [`EngineError::Processor`], [`EngineError::UnresolvedOutput`]: the
    ///   message was stored but the group could not be released
    /// - [`EngineError::Store`] on store failures, including a full store
    pub async fn accept(&self, message: Message) -> Result<AcceptOutcome, EngineError> {
        let Some(_in_flight) = self.lifecycle.enter() else {
            return Err(self.reject(&message, EngineError::ShuttingDown));
        };

        let key = match self.validate(&message) {
            Ok(key) => key,
            Err(err) => return Err(self.reject(&message, err)),
        };

        let _lock = self.locks.lock(&key).await;

        if let Some(existing) = self.store.group(&key).await? {
            match existing.admit(&message) {
                Ok(Admission::Append) => {}
                Ok(Admission::AlreadyStored) => {
                    debug!(key = %key, message_id = %message.id(), "message already stored");
                    return Ok(AcceptOutcome::AlreadyStored);
                }
                Err(err) => return Err(self.reject(&message, err)),
            }
        }

        let now = self.clock.now();
        let message_id = message.id();
        let mut group = self.store.add_message(&key, message, now).await?;
        trace!(key = %key, %message_id, size = group.size(), "message appended");
        self.observer.on_stored(&group);

        if self.release.can_release(&group) {
            group.mark_complete();
            return match self.complete(group).await {
                Ok(outputs) => {
                    debug!(key = %key, outputs = outputs.len(), "group released");
                    Ok(AcceptOutcome::Released { outputs })
                }
                Err(EngineError::SinkDelivery {
                    delivered, total, ..
                }) => {
                    warn!(key = %key, delivered, total, "release delivery failed, group kept");
                    Ok(AcceptOutcome::DeliveryFailed { delivered, total })
                }
                Err(err) => Err(err),
            };
        }

        if self.config.release_partial_sequences && self.release.can_release_partially(&group) {
            return self.release_prefix(&group, now).await;
        }

        Ok(AcceptOutcome::Stored)
    }

    /// Completes the group for `key` now, whatever its state.
    ///
    /// Under the key's lock: a group the release strategy considers complete
    /// is released normally; otherwise its members go through the processor
    /// (when `send_partial_result_on_timeout`) or to the discard sink. The
    /// group is then removed.
    ///
    /// Returns `Ok(false)` when no group exists (already released or
    /// completed by a concurrent caller).
    ///
    /// # Errors
    ///
    /// [`EngineError::SinkDelivery`] leaves the group in place. Processor
    /// and store failures propagate the same way.
    pub async fn force_complete(&self, key: &CorrelationKey) -> Result<bool, EngineError> {
        self.force_complete_stale(key, None).await
    }

    /// Force-completes every group not modified within `older_than`.
    ///
    /// Keys are enumerated without holding any lock; each one is re-checked
    /// under its own lock, so a group that received a message in the
    /// meantime is left alone. Per-key failures are logged and skipped.
    ///
    /// Returns how many groups were completed.
    ///
    /// # Errors
    ///
    /// Fails only if the stale keys cannot be listed, or with
    /// [`EngineError::ShuttingDown`] if the engine is not running.
    pub async fn expire_groups(&self, older_than: Duration) -> Result<usize, EngineError> {
        if self.lifecycle.state() != LifecycleState::Running {
            return Err(EngineError::ShuttingDown);
        }
        let age = i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX);
        let cutoff = self.clock.now().saturating_sub(age);
        let stale = self.store.keys_older_than(cutoff).await?;

        let mut expired = 0;
        for key in stale {
            match self.force_complete_stale(&key, Some(cutoff)).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(EngineError::ShuttingDown) => break,
                Err(err) => warn!(key = %key, error = %err, "failed to expire group"),
            }
        }
        Ok(expired)
    }

    // -- reaper ------------------------------------------------------------

    /// Starts the background reaper if it is not already running.
    pub async fn start_reaper(self: &Arc<Self>) {
        let mut reaper = self.reaper.lock().await;
        if reaper.is_none() {
            let runnable = GroupReaper::new(Arc::downgrade(self));
            *reaper = Some(BackgroundWorker::start(runnable, self.config.reaper_interval()));
            debug!(
                interval_ms = self.config.reaper_interval_ms,
                timeout_ms = self.config.release_timeout_ms,
                "group reaper started"
            );
        }
    }

    /// Asks the reaper to run a sweep now.
    ///
    /// # Errors
    ///
    /// [`EngineError::ShuttingDown`] if the reaper is not running.
    pub async fn request_sweep(&self) -> Result<(), EngineError> {
        self.submit_reaper_task(ReaperTask::SweepNow).await
    }

    /// Asks the reaper to force-complete `key` in the background.
    ///
    /// # Errors
    ///
    /// [`EngineError::ShuttingDown`] if the reaper is not running.
    pub async fn schedule_force_complete(&self, key: CorrelationKey) -> Result<(), EngineError> {
        self.submit_reaper_task(ReaperTask::ForceComplete(key)).await
    }

    async fn submit_reaper_task(&self, task: ReaperTask) -> Result<(), EngineError> {
        let reaper = self.reaper.lock().await;
        match reaper.as_ref() {
            Some(worker) => worker
                .submit(task)
                .await
                .map_err(|_| EngineError::ShuttingDown),
            None => Err(EngineError::ShuttingDown),
        }
    }

    /// Stops accepting work, stops the reaper, waits up to
    /// `drain_timeout_ms` for in-flight calls, then closes the store.
    ///
    /// Returns whether every in-flight call finished before the timeout.
    ///
    /// # Errors
    ///
    /// Propagates a failure to close the store.
    pub async fn shutdown(&self) -> Result<bool, EngineError> {
        self.lifecycle.begin_drain();
        info!("correlation engine draining");

        let worker = self.reaper.lock().await.take();
        if let Some(mut worker) = worker {
            worker.stop().await;
        }

        let drained = self
            .lifecycle
            .wait_for_drain(self.config.drain_timeout())
            .await;
        if !drained {
            warn!(
                in_flight = self.lifecycle.in_flight_count(),
                "drain timed out, closing store with operations in flight"
            );
        }
        self.store.close().await?;
        info!(drained, "correlation engine stopped");
        Ok(drained)
    }

    // -- internals ---------------------------------------------------------

    /// Checks that need neither the lock nor the group.
    fn validate(&self, message: &Message) -> Result<CorrelationKey, EngineError> {
        if message.payload().is_null() {
            return Err(EngineError::NullPayload {
                message_id: message.id(),
            });
        }
        let key = self.correlation.correlation_key(message)?;
        validate_sequence_headers(&key, message)?;
        Ok(key)
    }

    fn reject(&self, message: &Message, err: EngineError) -> EngineError {
        debug!(message_id = %message.id(), error = %err, "message rejected");
        self.observer.on_rejected(message, &err);
        err
    }

    /// `force_complete`, optionally skipping groups touched at or after
    /// `stale_before` once the lock is held.
    async fn force_complete_stale(
        &self,
        key: &CorrelationKey,
        stale_before: Option<i64>,
    ) -> Result<bool, EngineError> {
        let Some(_in_flight) = self.lifecycle.enter() else {
            return Err(EngineError::ShuttingDown);
        };
        let _lock = self.locks.lock(key).await;

        let Some(mut group) = self.store.group(key).await? else {
            debug!(key = %key, "no group to complete");
            return Ok(false);
        };
        if stale_before.is_some_and(|cutoff| group.last_modified_at() >= cutoff) {
            debug!(key = %key, "group modified since sweep began");
            return Ok(false);
        }

        if group.is_empty() {
            // Everything was emitted by partial releases.
            self.store.remove_group(key).await?;
            return Ok(true);
        }

        if self.release.can_release(&group) {
            group.mark_complete();
            let outputs = self.complete(group).await?;
            debug!(key = %key, outputs = outputs.len(), "group released on completion");
        } else if self.config.send_partial_result_on_timeout {
            group.mark_expired();
            let held = group.len();
            let outputs = self.complete(group).await?;
            info!(key = %key, held, outputs = outputs.len(), "expired group released partially");
        } else {
            self.discard_group(&group).await?;
        }
        Ok(true)
    }

    /// Processes, delivers, and removes a group. The caller holds the lock.
    async fn complete(&self, group: MessageGroup) -> Result<Vec<Message>, EngineError> {
        let outputs = self.process(&group)?;
        self.deliver(&group, &outputs).await?;
        self.store.remove_group(group.key()).await?;
        self.observer.on_released(&group, &outputs);
        Ok(outputs)
    }

    async fn release_prefix(
        &self,
        group: &MessageGroup,
        now: i64,
    ) -> Result<AcceptOutcome, EngineError> {
        let Some((prefix, last_sequence)) = group.releasable_prefix() else {
            return Ok(AcceptOutcome::Stored);
        };
        let key = group.key();
        let outputs = self.process(&prefix)?;
        match self.deliver(&prefix, &outputs).await {
            Ok(()) => {}
            Err(EngineError::SinkDelivery {
                delivered, total, ..
            }) => {
                warn!(key = %key, delivered, total, "partial delivery failed, group kept");
                return Ok(AcceptOutcome::DeliveryFailed { delivered, total });
            }
            Err(err) => return Err(err),
        }

        let released: Vec<Uuid> = prefix.messages().iter().map(Message::id).collect();
        self.store
            .mark_released(key, &released, last_sequence, now)
            .await?;
        debug!(key = %key, through = last_sequence, "sequence prefix released");
        self.observer.on_partial_release(key, &outputs);
        Ok(AcceptOutcome::PartiallyReleased { outputs })
    }

    async fn discard_group(&self, group: &MessageGroup) -> Result<(), EngineError> {
        let total = group.len();
        for (delivered, message) in group.messages().iter().enumerate() {
            if !self.discard.send(message.clone()).await {
                warn!(key = %group.key(), delivered, total, "discard delivery failed, group kept");
                return Err(EngineError::SinkDelivery {
                    key: group.key().clone(),
                    delivered,
                    total,
                });
            }
        }
        self.store.remove_group(group.key()).await?;
        self.observer.on_discarded(group);
        info!(key = %group.key(), discarded = total, "expired group discarded");
        Ok(())
    }

    fn process(&self, group: &MessageGroup) -> Result<Vec<Message>, EngineError> {
        self.processor
            .process(group)
            .map_err(|source| EngineError::Processor {
                key: group.key().clone(),
                source,
            })
    }

    async fn deliver(&self, group: &MessageGroup, outputs: &[Message]) -> Result<(), EngineError> {
        if outputs.is_empty() {
            return Ok(());
        }
        let sink = self.output_sink(group, outputs)?;
        let total = outputs.len();
        for (delivered, output) in outputs.iter().enumerate() {
            if !sink.send(output.clone()).await {
                return Err(EngineError::SinkDelivery {
                    key: group.key().clone(),
                    delivered,
                    total,
                });
            }
        }
        Ok(())
    }

    /// The configured output sink, else the sink named by the `replyChannel`
    /// header of the first output, else that of the first group member.
    fn output_sink(
        &self,
        group: &MessageGroup,
        outputs: &[Message],
    ) -> Result<Arc<dyn MessageSink>, EngineError> {
        if let Some(output) = &self.output {
            return Ok(Arc::clone(output));
        }
        let reply_channel = outputs
            .first()
            .and_then(|m| m.headers().reply_channel())
            .or_else(|| group.first().and_then(|m| m.headers().reply_channel()));
        reply_channel
            .zip(self.resolver.as_ref())
            .and_then(|(name, resolver)| resolver.resolve(name))
            .ok_or_else(|| EngineError::UnresolvedOutput {
                key: group.key().clone(),
            })
    }
}

// ---------------------------------------------------------------------------
// CorrelationEngineBuilder
// ---------------------------------------------------------------------------

/// Wires the engine's collaborators.
///
/// Defaults: correlation on the `correlationId` header, release on
/// sequence size, an in-memory store bounded by `max_groups`, a
/// [`NullSink`] for discards, no output sink (reply channels only), the
/// system clock.
pub struct CorrelationEngineBuilder {
    processor: Arc<dyn GroupProcessor>,
    store: Option<Arc<dyn MessageGroupStore>>,
    correlation: Arc<dyn CorrelationStrategy>,
    release: Arc<dyn ReleaseStrategy>,
    output: Option<Arc<dyn MessageSink>>,
    discard: Arc<dyn MessageSink>,
    resolver: Option<Arc<dyn SinkResolver>>,
    observer: Arc<dyn GroupObserver>,
    clock: Arc<dyn ClockSource>,
    config: EngineConfig,
}

impl CorrelationEngineBuilder {
    fn new(processor: Arc<dyn GroupProcessor>) -> Self {
        Self {
            processor,
            store: None,
            correlation: Arc::new(HeaderCorrelationStrategy::default()),
            release: Arc::new(SequenceSizeReleaseStrategy),
            output: None,
            discard: Arc::new(NullSink),
            resolver: None,
            observer: Arc::new(NoopGroupObserver),
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
        }
    }

    #[must_use]
    pub fn store(mut self, store: Arc<dyn MessageGroupStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn correlation_strategy(mut self, strategy: Arc<dyn CorrelationStrategy>) -> Self {
        self.correlation = strategy;
        self
    }

    #[must_use]
    pub fn release_strategy(mut self, strategy: Arc<dyn ReleaseStrategy>) -> Self {
        self.release = strategy;
        self
    }

    #[must_use]
    pub fn output(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.output = Some(sink);
        self
    }

    #[must_use]
    pub fn discard(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.discard = sink;
        self
    }

    #[must_use]
    pub fn sink_resolver(mut self, resolver: Arc<dyn SinkResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn GroupObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Validates the configuration and returns a running engine.
    ///
    /// # Errors
    ///
    /// [`EngineError::Config`] if partial sequence release is enabled with
    /// a release strategy that cannot release partially, or if the reaper
    /// interval is zero.
    pub fn build(self) -> Result<CorrelationEngine, EngineError> {
        if self.config.release_partial_sequences && !self.release.supports_partial_release() {
            return Err(EngineError::Config(
                "release_partial_sequences requires the sequence-size release strategy"
                    .to_string(),
            ));
        }
        if self.config.reaper_interval_ms == 0 {
            return Err(EngineError::Config(
                "reaper_interval_ms must be greater than zero".to_string(),
            ));
        }

        let store = self.store.unwrap_or_else(|| {
            Arc::new(InMemoryGroupStore::with_capacity(self.config.max_groups))
        });
        let engine = CorrelationEngine {
            store,
            correlation: self.correlation,
            release: self.release,
            processor: self.processor,
            output: self.output,
            discard: self.discard,
            resolver: self.resolver,
            observer: self.observer,
            clock: self.clock,
            config: self.config,
            locks: KeyLocks::new(),
            lifecycle: LifecycleController::new(),
            reaper: Mutex::new(None),
        };
        engine.lifecycle.set_running();
        Ok(engine)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use correlator_core::{ManualClock, MessageBuilder, Value};

    use super::*;
    use crate::processor::{AggregatingGroupProcessor, ResequencingGroupProcessor};
    use crate::sink::{MapSinkResolver, QueueSink};
    use crate::strategy::MessageCountReleaseStrategy;

    fn seq(payload: &str, number: u32, size: u32) -> Message {
        MessageBuilder::with_payload(payload)
            .correlation_id("ABC")
            .sequence_number(number)
            .sequence_size(size)
            .build()
    }

    struct Harness {
        engine: Arc<CorrelationEngine>,
        output: Arc<QueueSink>,
        discard: Arc<QueueSink>,
        clock: Arc<ManualClock>,
    }

    fn harness(processor: Arc<dyn GroupProcessor>, config: EngineConfig) -> Harness {
        let output = Arc::new(QueueSink::new());
        let discard = Arc::new(QueueSink::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let engine = CorrelationEngine::builder(processor)
            .output(output.clone())
            .discard(discard.clone())
            .clock(clock.clone())
            .config(config)
            .build()
            .unwrap();
        Harness {
            engine: Arc::new(engine),
            output,
            discard,
            clock,
        }
    }

    fn aggregator() -> Harness {
        harness(
            Arc::new(AggregatingGroupProcessor::concatenating()),
            EngineConfig::default(),
        )
    }

    fn resequencer(partial: bool) -> Harness {
        harness(
            Arc::new(ResequencingGroupProcessor),
            EngineConfig {
                release_partial_sequences: partial,
                ..EngineConfig::default()
            },
        )
    }

    fn payloads(messages: &[Message]) -> Vec<String> {
        messages
            .iter()
            .filter_map(|m| m.payload().as_str().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn aggregates_out_of_order_sequence() {
        let h = aggregator();
        assert_eq!(
            h.engine.accept(seq("123", 1, 3)).await.unwrap(),
            AcceptOutcome::Stored
        );
        h.engine.accept(seq("789", 3, 3)).await.unwrap();
        let outcome = h.engine.accept(seq("456", 2, 3)).await.unwrap();

        let AcceptOutcome::Released { outputs } = outcome else {
            panic!("expected release, got {outcome:?}");
        };
        assert_eq!(payloads(&outputs), vec!["123456789"]);
        assert_eq!(payloads(&h.output.messages()), vec!["123456789"]);
        assert!(h.engine.group(&"ABC".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_key_is_rejected_without_storing() {
        let h = aggregator();
        let err = h.engine.accept(Message::new("orphan")).await.unwrap_err();
        assert!(matches!(err, EngineError::MissingCorrelationKey { .. }));
        assert_eq!(h.engine.store().group_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn null_payload_is_rejected_without_storing() {
        let h = aggregator();
        let message = MessageBuilder::with_payload(Value::Null)
            .correlation_id("ABC")
            .build();
        let err = h.engine.accept(message).await.unwrap_err();
        assert!(matches!(err, EngineError::NullPayload { .. }));
        assert!(err.is_rejection());
        assert_eq!(h.engine.store().group_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn malformed_sequence_number_is_rejected() {
        let h = aggregator();
        h.engine.accept(seq("a", 1, 2)).await.unwrap();
        let message = MessageBuilder::with_payload("b")
            .correlation_id("ABC")
            .header(correlator_core::headers::SEQUENCE_NUMBER, -1)
            .build();
        let err = h.engine.accept(message).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidSequence { .. }));
        assert_eq!(h.engine.store().message_count(&"ABC".into()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn keys_of_different_types_form_separate_groups() {
        let h = aggregator();
        let by_int = MessageBuilder::with_payload("int-key")
            .correlation_id(42)
            .sequence_number(1)
            .sequence_size(2)
            .build();
        let by_string = MessageBuilder::with_payload("str-key")
            .correlation_id("42")
            .sequence_number(2)
            .sequence_size(2)
            .build();

        assert_eq!(h.engine.accept(by_int).await.unwrap(), AcceptOutcome::Stored);
        assert_eq!(h.engine.accept(by_string).await.unwrap(), AcceptOutcome::Stored);
        assert_eq!(h.engine.store().group_count().await.unwrap(), 2);
        assert!(h.output.is_empty());
    }

    #[tokio::test]
    async fn duplicate_sequence_number_leaves_group_intact() {
        let h = aggregator();
        h.engine.accept(seq("a", 1, 3)).await.unwrap();
        let err = h.engine.accept(seq("b", 1, 3)).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::DuplicateSequenceNumber {
                sequence_number: 1,
                ..
            }
        ));

        let group = h.engine.group(&"ABC".into()).await.unwrap().unwrap();
        assert_eq!(payloads(group.messages()), vec!["a"]);
    }

    #[tokio::test]
    async fn identical_resubmission_is_idempotent() {
        let h = aggregator();
        let message = seq("a", 1, 2);
        h.engine.accept(message.clone()).await.unwrap();
        assert_eq!(
            h.engine.accept(message).await.unwrap(),
            AcceptOutcome::AlreadyStored
        );
        assert_eq!(h.engine.store().message_count(&"ABC".into()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn mismatched_sequence_size_is_rejected() {
        let h = aggregator();
        h.engine.accept(seq("a", 1, 3)).await.unwrap();
        let err = h.engine.accept(seq("b", 2, 4)).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidSequence { .. }));
    }

    #[tokio::test]
    async fn sequence_number_beyond_size_is_rejected() {
        let h = aggregator();
        let err = h.engine.accept(seq("a", 4, 3)).await.unwrap_err();
        assert!(err.is_rejection());
        assert_eq!(h.engine.store().group_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delivery_failure_keeps_group_for_retry() {
        let h = aggregator();
        h.output.set_accepting(false);
        h.engine.accept(seq("1", 1, 2)).await.unwrap();
        let outcome = h.engine.accept(seq("2", 2, 2)).await.unwrap();
        assert_eq!(
            outcome,
            AcceptOutcome::DeliveryFailed {
                delivered: 0,
                total: 1
            }
        );
        assert_eq!(h.engine.store().message_count(&"ABC".into()).await.unwrap(), 2);

        h.output.set_accepting(true);
        assert!(h.engine.force_complete(&"ABC".into()).await.unwrap());
        assert_eq!(payloads(&h.output.messages()), vec!["12"]);
        assert!(h.discard.is_empty());
    }

    #[tokio::test]
    async fn force_complete_discards_incomplete_group() {
        let h = aggregator();
        h.engine.accept(seq("1", 1, 3)).await.unwrap();
        h.engine.accept(seq("2", 2, 3)).await.unwrap();

        assert!(h.engine.force_complete(&"ABC".into()).await.unwrap());
        assert_eq!(payloads(&h.discard.messages()), vec!["1", "2"]);
        assert!(h.output.is_empty());
        assert!(!h.engine.force_complete(&"ABC".into()).await.unwrap());
    }

    #[tokio::test]
    async fn failed_discard_keeps_group() {
        let h = aggregator();
        h.engine.accept(seq("1", 1, 3)).await.unwrap();
        h.discard.set_accepting(false);

        let err = h.engine.force_complete(&"ABC".into()).await.unwrap_err();
        assert!(matches!(err, EngineError::SinkDelivery { .. }));
        assert!(h.engine.group(&"ABC".into()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn partial_result_on_timeout_and_new_group_afterwards() {
        let h = harness(
            Arc::new(AggregatingGroupProcessor::concatenating()),
            EngineConfig {
                send_partial_result_on_timeout: true,
                ..EngineConfig::default()
            },
        );
        h.engine.accept(seq("1", 1, 3)).await.unwrap();
        h.engine.accept(seq("3", 3, 3)).await.unwrap();

        assert!(h.engine.force_complete(&"ABC".into()).await.unwrap());
        assert_eq!(payloads(&h.output.messages()), vec!["13"]);

        // The straggler starts a fresh group.
        assert_eq!(
            h.engine.accept(seq("2", 2, 3)).await.unwrap(),
            AcceptOutcome::Stored
        );
        let group = h.engine.group(&"ABC".into()).await.unwrap().unwrap();
        assert_eq!(group.len(), 1);
        assert_eq!(h.output.len(), 1);
    }

    #[tokio::test]
    async fn expire_groups_only_touches_stale_groups() {
        let h = aggregator();
        h.engine
            .accept(
                MessageBuilder::with_payload("old")
                    .correlation_id("old")
                    .sequence_number(1)
                    .sequence_size(2)
                    .build(),
            )
            .await
            .unwrap();
        h.clock.advance(100);
        h.engine.accept(seq("fresh", 1, 2)).await.unwrap();
        h.clock.advance(30);

        let expired = h
            .engine
            .expire_groups(Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(expired, 1);
        assert_eq!(payloads(&h.discard.messages()), vec!["old"]);
        assert!(h.engine.group(&"ABC".into()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn resequencer_releases_in_order() {
        let h = resequencer(false);
        h.engine.accept(seq("3", 3, 3)).await.unwrap();
        h.engine.accept(seq("1", 1, 3)).await.unwrap();
        h.engine.accept(seq("2", 2, 3)).await.unwrap();
        assert_eq!(payloads(&h.output.messages()), vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn resequencer_partial_release_in_runs() {
        let h = resequencer(true);
        assert_eq!(
            h.engine.accept(seq("2", 2, 4)).await.unwrap(),
            AcceptOutcome::Stored
        );
        let outcome = h.engine.accept(seq("1", 1, 4)).await.unwrap();
        assert!(matches!(outcome, AcceptOutcome::PartiallyReleased { .. }));
        assert_eq!(payloads(&h.output.drain()), vec!["1", "2"]);

        h.engine.accept(seq("4", 4, 4)).await.unwrap();
        assert!(h.output.is_empty());
        let outcome = h.engine.accept(seq("3", 3, 4)).await.unwrap();
        assert!(matches!(outcome, AcceptOutcome::Released { .. }));
        assert_eq!(payloads(&h.output.drain()), vec!["3", "4"]);
        assert!(h.engine.group(&"ABC".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resequencer_with_count_strategy_emits_every_member() {
        let output = Arc::new(QueueSink::new());
        let discard = Arc::new(QueueSink::new());
        let engine = CorrelationEngine::builder(Arc::new(ResequencingGroupProcessor))
            .release_strategy(Arc::new(MessageCountReleaseStrategy::new(2)))
            .output(output.clone())
            .discard(discard.clone())
            .build()
            .unwrap();

        engine.accept(seq("2", 2, 3)).await.unwrap();
        let outcome = engine.accept(seq("3", 3, 3)).await.unwrap();

        let AcceptOutcome::Released { outputs } = outcome else {
            panic!("expected release, got {outcome:?}");
        };
        assert_eq!(payloads(&outputs), vec!["2", "3"]);
        assert_eq!(payloads(&output.messages()), vec!["2", "3"]);
        assert!(discard.is_empty());
        assert!(engine.group(&"ABC".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sequence_size_is_enforced_after_group_drains() {
        let h = resequencer(true);
        assert!(matches!(
            h.engine.accept(seq("1", 1, 4)).await.unwrap(),
            AcceptOutcome::PartiallyReleased { .. }
        ));
        let group = h.engine.group(&"ABC".into()).await.unwrap().unwrap();
        assert!(group.is_empty());

        let err = h.engine.accept(seq("2", 2, 9)).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidSequence { .. }));
        assert!(matches!(
            h.engine.accept(seq("2", 2, 4)).await.unwrap(),
            AcceptOutcome::PartiallyReleased { .. }
        ));
        assert_eq!(payloads(&h.output.messages()), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn resequencer_rejects_already_released_number() {
        let h = resequencer(true);
        h.engine.accept(seq("1", 1, 3)).await.unwrap();
        let err = h.engine.accept(seq("1-again", 1, 3)).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateSequenceNumber { .. }));
        assert_eq!(payloads(&h.output.messages()), vec!["1"]);
    }

    #[tokio::test]
    async fn resequencer_single_message_sequence_removes_group() {
        let h = resequencer(true);
        let outcome = h.engine.accept(seq("only", 1, 1)).await.unwrap();
        assert!(matches!(outcome, AcceptOutcome::Released { .. }));
        assert_eq!(h.engine.store().group_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fully_released_prefix_group_is_cleared_on_force_complete() {
        let h = resequencer(true);
        h.engine.accept(seq("1", 1, 3)).await.unwrap();
        assert!(h.engine.force_complete(&"ABC".into()).await.unwrap());
        assert!(h.discard.is_empty());
        assert_eq!(h.engine.store().group_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reply_channel_resolves_output() {
        let replies = Arc::new(QueueSink::new());
        let resolver = Arc::new(MapSinkResolver::new());
        resolver.register("replies", replies.clone());
        let engine = CorrelationEngine::builder(Arc::new(AggregatingGroupProcessor::new()))
            .release_strategy(Arc::new(MessageCountReleaseStrategy::new(1)))
            .sink_resolver(resolver)
            .build()
            .unwrap();

        let message = MessageBuilder::with_payload("x")
            .correlation_id("k")
            .reply_channel("replies")
            .build();
        engine.accept(message).await.unwrap();
        assert_eq!(
            replies.messages()[0].payload(),
            &Value::Array(vec![Value::from("x")])
        );

        let unrouted = MessageBuilder::with_payload("y").correlation_id("k2").build();
        let err = engine.accept(unrouted).await.unwrap_err();
        assert!(matches!(err, EngineError::UnresolvedOutput { .. }));
        assert!(engine.group(&"k2".into()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn processor_failure_keeps_group() {
        let h = harness(
            Arc::new(AggregatingGroupProcessor::with_combiner(|_| {
                anyhow::bail!("combiner exploded")
            })),
            EngineConfig::default(),
        );
        h.engine.accept(seq("1", 1, 1)).await.unwrap_err();
        assert!(h.engine.group(&"ABC".into()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn store_capacity_surfaces_as_store_error() {
        let h = harness(
            Arc::new(AggregatingGroupProcessor::new()),
            EngineConfig {
                max_groups: 1,
                ..EngineConfig::default()
            },
        );
        h.engine.accept(seq("a", 1, 2)).await.unwrap();
        let other = MessageBuilder::with_payload("b")
            .correlation_id("other")
            .build();
        let err = h.engine.accept(other).await.unwrap_err();
        assert!(matches!(err, EngineError::Store(_)));
    }

    #[tokio::test]
    async fn partial_release_requires_sequence_strategy() {
        let result = CorrelationEngine::builder(Arc::new(ResequencingGroupProcessor))
            .release_strategy(Arc::new(MessageCountReleaseStrategy::new(2)))
            .config(EngineConfig {
                release_partial_sequences: true,
                ..EngineConfig::default()
            })
            .build();
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[tokio::test]
    async fn shutdown_rejects_further_work() {
        let h = aggregator();
        h.engine.start_reaper().await;
        h.engine.accept(seq("1", 1, 2)).await.unwrap();

        assert!(h.engine.shutdown().await.unwrap());
        assert_eq!(h.engine.lifecycle_state(), LifecycleState::Stopped);
        assert!(matches!(
            h.engine.accept(seq("2", 2, 2)).await,
            Err(EngineError::ShuttingDown)
        ));
        assert!(matches!(
            h.engine.request_sweep().await,
            Err(EngineError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn reaper_expires_stale_groups() {
        let h = harness(
            Arc::new(AggregatingGroupProcessor::concatenating()),
            EngineConfig {
                release_timeout_ms: 50,
                reaper_interval_ms: 10,
                ..EngineConfig::default()
            },
        );
        h.engine.start_reaper().await;
        h.engine.accept(seq("1", 1, 2)).await.unwrap();

        h.clock.advance(60);
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(payloads(&h.discard.messages()), vec!["1"]);
        assert_eq!(h.engine.store().group_count().await.unwrap(), 0);
        h.engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn reaper_runs_on_demand_tasks() {
        let h = aggregator();
        h.engine.start_reaper().await;
        h.engine.accept(seq("1", 1, 2)).await.unwrap();

        h.engine
            .schedule_force_complete("ABC".into())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(payloads(&h.discard.messages()), vec!["1"]);

        h.engine.request_sweep().await.unwrap();
        h.engine.shutdown().await.unwrap();
    }
}
