//! Periodic expiry of stale groups.
//!
//! The reaper is the engine's only timeout mechanism. On every tick it asks
//! the engine to force-complete groups whose last modification is older
//! than `release_timeout_ms`. Each stale key is handled independently; a
//! failure on one key is logged and retried on the next tick.

use std::sync::Weak;

use async_trait::async_trait;
use correlator_core::CorrelationKey;
use tracing::{debug, info, warn};

use crate::engine::CorrelationEngine;
use crate::error::EngineError;
use crate::runtime::worker::BackgroundRunnable;

/// On-demand work for the reaper, besides its periodic sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaperTask {
    /// Run a sweep now instead of waiting for the next tick.
    SweepNow,
    /// Force-complete one group regardless of its age.
    ForceComplete(CorrelationKey),
}

/// [`BackgroundRunnable`] that expires stale groups.
///
/// Holds a weak reference so the engine can own the worker running it.
#[derive(Debug)]
pub struct GroupReaper {
    engine: Weak<CorrelationEngine>,
}

impl GroupReaper {
    #[must_use]
    pub fn new(engine: Weak<CorrelationEngine>) -> Self {
        Self { engine }
    }

    async fn sweep(&self) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        match engine.expire_groups(engine.config().release_timeout()).await {
            Ok(0) => {}
            Ok(expired) => info!(expired, "reaper expired stale groups"),
            Err(EngineError::ShuttingDown) => {}
            Err(err) => warn!(error = %err, "reaper sweep failed"),
        }
    }
}

#[async_trait]
impl BackgroundRunnable for GroupReaper {
    type Task = ReaperTask;

    async fn run(&mut self, task: ReaperTask) {
        match task {
            ReaperTask::SweepNow => self.sweep().await,
            ReaperTask::ForceComplete(key) => {
                let Some(engine) = self.engine.upgrade() else {
                    return;
                };
                match engine.force_complete(&key).await {
                    Ok(true) => debug!(key = %key, "reaper force-completed group"),
                    Ok(false) => debug!(key = %key, "group already gone"),
                    Err(err) => warn!(key = %key, error = %err, "force completion failed"),
                }
            }
        }
    }

    async fn on_tick(&mut self) {
        self.sweep().await;
    }

    async fn shutdown(&mut self) {
        debug!("group reaper stopped");
    }
}
