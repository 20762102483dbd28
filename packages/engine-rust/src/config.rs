use std::time::Duration;

use serde::Deserialize;

/// Configuration consumed by the correlation engine and its reaper.
///
/// Controls group expiry, the reaper cadence, release behavior on timeout,
/// partial sequence release, store capacity, and sink/drain timeouts.
/// All durations are in milliseconds, mirroring the wire-friendly style of
/// the rest of the configuration surface. Missing fields fall back to
/// [`EngineConfig::default`] when deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Age (since last modification) after which a group is force-completed.
    pub release_timeout_ms: u64,
    /// Interval between reaper sweeps.
    pub reaper_interval_ms: u64,
    /// On timeout, run the group processor on what is present instead of
    /// discarding every member.
    pub send_partial_result_on_timeout: bool,
    /// Release contiguous sequence prefixes as soon as they are present
    /// (resequencer mode). Requires the sequence-size release strategy.
    pub release_partial_sequences: bool,
    /// Maximum number of correlation keys tracked at once. 0 = unbounded.
    pub max_groups: usize,
    /// Maximum time a channel-backed sink waits for queue capacity.
    pub send_timeout_ms: u64,
    /// Maximum time `shutdown` waits for in-flight operations.
    pub drain_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            release_timeout_ms: 60_000,
            reaper_interval_ms: 1_000,
            send_partial_result_on_timeout: false,
            release_partial_sequences: false,
            max_groups: 0,
            send_timeout_ms: 1_000,
            drain_timeout_ms: 5_000,
        }
    }
}

impl EngineConfig {
    /// Parses a configuration from JSON, filling absent fields with defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or names unknown fields.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// `release_timeout_ms` as a [`Duration`].
    #[must_use]
    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }

    /// `reaper_interval_ms` as a [`Duration`].
    #[must_use]
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    /// `send_timeout_ms` as a [`Duration`].
    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// `drain_timeout_ms` as a [`Duration`].
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}
