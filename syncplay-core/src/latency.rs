//! Latency tracking for drift tolerance
//!
//! Two sources feed this:
//! - heartbeat round trips on the push channel, averaged and reported to the authority
//! - per-member latency figures the authority publishes in group snapshots
//!
//! Drift tolerance reads the authority's figure, since that is what the
//! authority itself schedules against.

use std::collections::VecDeque;
use std::time::Duration;

use crate::sync::Participant;

/// Number of RTT samples to keep for averaging
const RTT_SAMPLE_COUNT: usize = 5;

/// Tracks latency for the current group session
#[derive(Debug)]
pub struct LatencyTracker {
    /// Recent heartbeat RTT samples in milliseconds
    samples: VecDeque<u64>,
    /// Latest latency figure the authority reported for a member
    reported_ms: Option<u64>,
    default_latency_ms: u64,
}

impl LatencyTracker {
    pub fn new(default_latency_ms: u64) -> Self {
        Self {
            samples: VecDeque::with_capacity(RTT_SAMPLE_COUNT),
            reported_ms: None,
            default_latency_ms,
        }
    }

    /// Clear all state (when leaving a group)
    pub fn clear(&mut self) {
        self.samples.clear();
        self.reported_ms = None;
    }

    /// Record a heartbeat round trip. Returns the averaged RTT to report upstream.
    pub fn record_round_trip(&mut self, rtt: Duration) -> u64 {
        if self.samples.len() >= RTT_SAMPLE_COUNT {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt.as_millis() as u64);
        let avg = self.average_rtt_ms().unwrap_or_default();
        tracing::debug!("Heartbeat RTT={}ms, avg={}ms", rtt.as_millis(), avg);
        avg
    }

    pub fn average_rtt_ms(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<u64>() / self.samples.len() as u64)
    }

    /// Take the figures from a group snapshot. The largest reported member latency wins;
    /// snapshots without any figures leave the previous value in place.
    pub fn record_members(&mut self, participants: &[Participant]) {
        if let Some(max) = participants.iter().filter_map(|p| p.latency_ms).max() {
            self.reported_ms = Some(max);
        }
    }

    /// Latency estimate for drift tolerance
    pub fn estimated_latency_ms(&self) -> u64 {
        self.reported_ms.unwrap_or(self.default_latency_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str, latency_ms: Option<u64>) -> Participant {
        Participant {
            latency_ms,
            ..Participant::named(name)
        }
    }

    #[test]
    fn test_default_until_reported() {
        let mut tracker = LatencyTracker::new(50);
        assert_eq!(tracker.estimated_latency_ms(), 50);

        tracker.record_members(&[member("alice", None)]);
        assert_eq!(tracker.estimated_latency_ms(), 50);

        tracker.record_members(&[member("alice", Some(120)), member("bob", Some(80))]);
        assert_eq!(tracker.estimated_latency_ms(), 120);

        // Figure-less snapshot keeps the latest figure
        tracker.record_members(&[member("alice", None)]);
        assert_eq!(tracker.estimated_latency_ms(), 120);

        tracker.clear();
        assert_eq!(tracker.estimated_latency_ms(), 50);
    }

    #[test]
    fn test_round_trip_averaging() {
        let mut tracker = LatencyTracker::new(50);
        assert_eq!(tracker.average_rtt_ms(), None);

        tracker.record_round_trip(Duration::from_millis(100));
        tracker.record_round_trip(Duration::from_millis(200));
        let avg = tracker.record_round_trip(Duration::from_millis(150));
        assert_eq!(avg, 150);

        // Only the last five samples count
        for _ in 0..5 {
            tracker.record_round_trip(Duration::from_millis(40));
        }
        assert_eq!(tracker.average_rtt_ms(), Some(40));
    }
}
