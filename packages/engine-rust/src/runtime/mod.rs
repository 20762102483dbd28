//! Runtime plumbing: lifecycle gate, background worker, group reaper.

pub mod lifecycle;
pub mod reaper;
pub mod worker;

pub use lifecycle::{InFlightGuard, LifecycleController, LifecycleState};
pub use reaper::{GroupReaper, ReaperTask};
pub use worker::{BackgroundRunnable, BackgroundWorker};
