//! Position reconciliation for listener sync
//!
//! Pure functions that project the host's authoritative position forward,
//! decide whether the local player has drifted far enough to correct, and
//! size the playback buffer for the measured latency. Invoked on a fixed
//! interval by listeners only; the host is the position authority and never
//! reconciles against itself.

use std::time::Duration;

/// Default drift threshold below which no correction is issued (ms).
/// Corrections under this bound would be audible micro-seeks.
const DEFAULT_SYNC_THRESHOLD_MS: u64 = 200;

/// Default interval between reconciliation ticks
const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Default playback buffer at low latency (seconds of audio)
const DEFAULT_BASE_BUFFER_SECS: f64 = 2.0;

/// Latency bound under which the base buffer is used (ms)
const BUFFER_TIER_LOW_MS: u64 = 100;

/// Latency bound above which the buffer is doubled (ms)
const BUFFER_TIER_HIGH_MS: u64 = 300;

/// Buffer multiplier for mid-tier latency
const BUFFER_MID_FACTOR: f64 = 1.5;

/// Buffer multiplier for high-tier latency
const BUFFER_HIGH_FACTOR: f64 = 2.0;

/// Tunable reconciliation parameters
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Drift threshold in milliseconds before a corrective seek is issued
    pub sync_threshold_ms: u64,
    /// Interval between reconciliation ticks
    pub resync_interval: Duration,
    /// Playback buffer at low latency, in seconds of audio
    pub base_buffer_secs: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_threshold_ms: DEFAULT_SYNC_THRESHOLD_MS,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            base_buffer_secs: DEFAULT_BASE_BUFFER_SECS,
        }
    }
}

/// A corrective seek the caller should apply to the local player
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correction {
    /// Position to seek to, in seconds
    pub target_position: f64,
    /// Signed delta from the current position, in milliseconds
    pub offset_ms: f64,
}

impl SyncConfig {
    /// Evaluate one reconciliation tick. Returns the correction to apply,
    /// or `None` when drift is below the threshold.
    pub fn correction(
        &self,
        current_position: f64,
        server_position: f64,
        server_timestamp_ms: i64,
        now_ms: i64,
        latency_ms: u64,
    ) -> Option<Correction> {
        let target = target_position(server_position, server_timestamp_ms, now_ms, latency_ms);
        if needs_resync(current_position, target, self.sync_threshold_ms) {
            Some(Correction {
                target_position: target,
                offset_ms: sync_offset_ms(current_position, target),
            })
        } else {
            None
        }
    }
}

/// Project the authoritative position forward by the wall-clock time elapsed
/// since the host stamped it, plus one-way latency compensation.
pub fn target_position(
    server_position: f64,
    server_timestamp_ms: i64,
    now_ms: i64,
    latency_ms: u64,
) -> f64 {
    let elapsed_secs = (now_ms - server_timestamp_ms) as f64 / 1000.0;
    let projected = server_position + elapsed_secs + latency_ms as f64 / 1000.0;
    projected.max(0.0)
}

/// Whether the drift between the local and projected positions is large
/// enough to warrant a corrective seek.
pub fn needs_resync(current_position: f64, target_position: f64, threshold_ms: u64) -> bool {
    (current_position - target_position).abs() * 1000.0 > threshold_ms as f64
}

/// Signed corrective seek delta in milliseconds (positive = local is behind)
pub fn sync_offset_ms(current_position: f64, target_position: f64) -> f64 {
    (target_position - current_position) * 1000.0
}

/// Playback buffer sized for the measured latency: base under 100 ms, 1.5x
/// between 100-300 ms, 2x above. Trades startup latency for continuity on
/// lossy links.
pub fn buffer_size(latency_ms: u64, base_buffer_secs: f64) -> f64 {
    if latency_ms < BUFFER_TIER_LOW_MS {
        base_buffer_secs
    } else if latency_ms <= BUFFER_TIER_HIGH_MS {
        base_buffer_secs * BUFFER_MID_FACTOR
    } else {
        base_buffer_secs * BUFFER_HIGH_FACTOR
    }
}
