// ── Runtime engine configuration ──
//
// Timing and sizing knobs for the engine. Callers (the binary, tests)
// build an `EngineConfig` and hand it in; core never reads config files.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a single [`Engine`](crate::Engine) instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long the dispatcher blocks on an empty queue before running
    /// a housekeeping pass.
    pub event_timeout: Duration,
    /// Coalescing window for scene calls.
    pub scene_window: Duration,
    /// Coalescing window for button clicks.
    pub button_window: Duration,
    /// Period of the meter-maintenance loop.
    pub meter_sync_interval: Duration,
    /// Default timeout used by the meter-maintenance loop when it waits
    /// for its own scan results to be applied.
    pub barrier_timeout: Duration,
    /// Size of the task-processor pool.
    pub task_workers: usize,
    /// Attempts per pool task before giving up.
    pub task_retries: u32,
    /// Pause between pool task attempts.
    pub task_retry_delay: Duration,
    /// Debounce between a topology change and the snapshot write.
    pub save_delay: Duration,
    /// Delay before retrying a failed snapshot write.
    pub save_retry_delay: Duration,
    /// Snapshot location. `None` disables persistence.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_timeout: Duration::from_secs(1),
            scene_window: Duration::from_secs(2),
            button_window: Duration::from_secs(2),
            meter_sync_interval: Duration::from_secs(10),
            barrier_timeout: Duration::from_secs(60),
            task_workers: 4,
            task_retries: 3,
            task_retry_delay: Duration::from_secs(2),
            save_delay: Duration::from_secs(1),
            save_retry_delay: Duration::from_secs(10),
            snapshot_path: None,
        }
    }
}
