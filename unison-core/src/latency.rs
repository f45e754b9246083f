//! Latency tracking for the relay connection
//!
//! Measures round-trip time (RTT) using ping/pong probe events and provides
//! an estimated one-way latency for position reconciliation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::clock::now_ms;

/// Number of RTT samples to keep for averaging
const RTT_SAMPLE_COUNT: usize = 5;

/// Default latency estimate when no measurements exist
const DEFAULT_LATENCY_MS: u64 = 10;

/// Pending pings older than this are dropped (the pong was lost)
const PENDING_PING_TTL: Duration = Duration::from_secs(10);

/// Tracks round-trip latency to the relay
#[derive(Debug, Default)]
pub struct LatencyTracker {
    /// Pings awaiting a pong, keyed by the sent_at_ms marker
    pending_pings: HashMap<i64, Instant>,
    /// Recent RTT samples in milliseconds
    samples: Vec<u64>,
    /// Cached average RTT
    avg_rtt_ms: u64,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self {
            pending_pings: HashMap::new(),
            samples: Vec::with_capacity(RTT_SAMPLE_COUNT),
            avg_rtt_ms: DEFAULT_LATENCY_MS * 2, // RTT = 2 * one-way
        }
    }

    /// Clear all state (when disconnecting)
    pub fn clear(&mut self) {
        self.pending_pings.clear();
        self.samples.clear();
        self.avg_rtt_ms = DEFAULT_LATENCY_MS * 2;
    }

    /// Create a ping to send. Returns the marker to include in the Ping event.
    pub fn create_ping(&mut self) -> i64 {
        let marker = now_ms();
        self.pending_pings.insert(marker, Instant::now());

        // Drop stale entries whose pong never arrived
        self.pending_pings
            .retain(|_, sent| sent.elapsed() < PENDING_PING_TTL);

        marker
    }

    /// Handle a pong response. Returns the measured RTT if the marker was
    /// one of ours.
    pub fn handle_pong(&mut self, ping_sent_at_ms: i64) -> Option<u64> {
        let sent = self.pending_pings.remove(&ping_sent_at_ms)?;
        let rtt_ms = sent.elapsed().as_millis() as u64;

        self.add_sample(rtt_ms);

        tracing::debug!(
            "Latency probe: RTT={}ms, avg={}ms, one-way={}ms",
            rtt_ms,
            self.avg_rtt_ms,
            self.latency_ms()
        );

        Some(rtt_ms)
    }

    fn add_sample(&mut self, rtt_ms: u64) {
        if self.samples.len() >= RTT_SAMPLE_COUNT {
            self.samples.remove(0);
        }
        self.samples.push(rtt_ms);

        let sum: u64 = self.samples.iter().sum();
        self.avg_rtt_ms = sum / self.samples.len() as u64;
    }

    /// Estimated one-way latency in milliseconds (average RTT / 2).
    /// Returns the default estimate if no measurements exist.
    pub fn latency_ms(&self) -> u64 {
        if self.samples.is_empty() {
            DEFAULT_LATENCY_MS
        } else {
            self.avg_rtt_ms / 2
        }
    }
}
