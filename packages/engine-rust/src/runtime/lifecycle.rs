//! Engine lifecycle with in-flight operation tracking.
//!
//! Uses `ArcSwap` for lock-free state transitions and an atomic counter with
//! RAII guards so `shutdown` knows when every `accept` and `force_complete`
//! call that got past the gate has finished.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

/// Engine lifecycle state.
///
/// State machine: Starting -> Running -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Engine is being assembled (not yet accepting messages).
    Starting,
    /// Engine accepts messages and force-completes groups.
    Running,
    /// Engine rejects new operations and waits for in-flight ones.
    Draining,
    /// Every in-flight operation finished; the store is closed.
    Stopped,
}

/// Gatekeeper for engine operations during startup and shutdown.
///
/// 1. The engine builder calls `set_running()` once wiring is complete
/// 2. Each operation calls `enter()` and holds the guard until it returns
/// 3. `begin_drain()` moves to Draining; later `enter()` calls fail
/// 4. `wait_for_drain()` blocks until in-flight operations complete
#[derive(Debug)]
pub struct LifecycleController {
    in_flight: Arc<AtomicU64>,
    state: ArcSwap<LifecycleState>,
}

impl LifecycleController {
    /// Creates a new controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(AtomicU64::new(0)),
            state: ArcSwap::from_pointee(LifecycleState::Starting),
        }
    }

    /// Transitions to `Running`.
    pub fn set_running(&self) {
        self.state.store(Arc::new(LifecycleState::Running));
    }

    /// Transitions to `Draining`. New operations are refused from here on.
    pub fn begin_drain(&self) {
        self.state.store(Arc::new(LifecycleState::Draining));
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    /// Registers an operation, or returns `None` unless the engine is running.
    ///
    /// The counter is bumped before the state check so an operation racing
    /// `begin_drain` is either refused or observed by `wait_for_drain`.
    #[must_use]
    pub fn enter(&self) -> Option<InFlightGuard> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let guard = InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        };
        (self.state() == LifecycleState::Running).then_some(guard)
    }

    /// Returns the current number of in-flight operations.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Waits for all in-flight operations to complete, up to `timeout`.
    ///
    /// Returns `true` (and transitions to `Stopped`) if everything drained.
    /// Returns `false` if the timeout expired; the state stays `Draining`.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::Acquire) == 0 {
                self.state.store(Arc::new(LifecycleState::Stopped));
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the in-flight counter when dropped.
///
/// Dropped during unwinding too, so a panicking sink or processor does not
/// wedge `wait_for_drain`.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_refuses_operations() {
        let controller = LifecycleController::new();
        assert_eq!(controller.state(), LifecycleState::Starting);
        assert!(controller.enter().is_none());
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[test]
    fn guards_track_in_flight_operations() {
        let controller = LifecycleController::new();
        controller.set_running();

        let first = controller.enter().unwrap();
        let second = controller.enter().unwrap();
        assert_eq!(controller.in_flight_count(), 2);

        drop(first);
        assert_eq!(controller.in_flight_count(), 1);
        drop(second);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[test]
    fn draining_refuses_new_operations() {
        let controller = LifecycleController::new();
        controller.set_running();
        controller.begin_drain();

        assert_eq!(controller.state(), LifecycleState::Draining);
        assert!(controller.enter().is_none());
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn drain_waits_for_outstanding_guard() {
        let controller = LifecycleController::new();
        controller.set_running();
        let guard = controller.enter().unwrap();
        controller.begin_drain();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        assert!(controller.wait_for_drain(Duration::from_secs(2)).await);
        assert_eq!(controller.state(), LifecycleState::Stopped);
        release.await.unwrap();
    }

    #[tokio::test]
    async fn drain_times_out_while_guard_held() {
        let controller = LifecycleController::new();
        controller.set_running();
        let _guard = controller.enter().unwrap();
        controller.begin_drain();

        assert!(!controller.wait_for_drain(Duration::from_millis(50)).await);
        assert_eq!(controller.state(), LifecycleState::Draining);
    }
}
