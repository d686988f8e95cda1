//! Position reporting and drift detection
//!
//! Owns the [`PositionSnapshot`] baseline. Both our own reports and the
//! authority's positions replace it, so drift is always measured against
//! the freshest known truth. All methods take an explicit `now_ms`.

use crate::config::SyncConfig;

/// A known position and when it was captured (wall clock ms)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionSnapshot {
    pub position_ms: u64,
    pub captured_at_ms: u64,
}

impl PositionSnapshot {
    /// Where playback should be at `now_ms` if it ran uninterrupted
    pub fn projected(&self, now_ms: u64) -> u64 {
        self.position_ms + now_ms.saturating_sub(self.captured_at_ms)
    }
}

#[derive(Debug)]
pub struct PositionSync {
    baseline: Option<PositionSnapshot>,
    last_reported_ms: Option<u64>,
    min_advance_ms: u64,
    min_tolerance_ms: u64,
}

impl PositionSync {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            baseline: None,
            last_reported_ms: None,
            min_advance_ms: config.report_min_advance_ms,
            min_tolerance_ms: config.min_drift_tolerance_ms,
        }
    }

    /// `max(min tolerance, 2 x latency)`
    pub fn tolerance_ms(&self, latency_ms: u64) -> u64 {
        self.min_tolerance_ms.max(latency_ms.saturating_mul(2))
    }

    /// Reports are skipped until the position moved by the minimum advance
    pub fn should_report(&self, position_ms: u64) -> bool {
        match self.last_reported_ms {
            Some(last) => position_ms.abs_diff(last) >= self.min_advance_ms,
            None => true,
        }
    }

    /// A report went through
    pub fn record_report(&mut self, position_ms: u64, now_ms: u64) {
        self.last_reported_ms = Some(position_ms);
        self.baseline = Some(PositionSnapshot {
            position_ms,
            captured_at_ms: now_ms,
        });
    }

    /// The authority told us where playback is
    pub fn record_authoritative(&mut self, position_ms: u64, now_ms: u64) {
        self.baseline = Some(PositionSnapshot {
            position_ms,
            captured_at_ms: now_ms,
        });
    }

    pub fn baseline(&self) -> Option<PositionSnapshot> {
        self.baseline
    }

    /// Compare the actual position with the projected baseline.
    /// Returns the expected position when the gap exceeds `tolerance_ms`.
    pub fn check_drift(&self, actual_ms: u64, now_ms: u64, tolerance_ms: u64) -> Option<u64> {
        let expected = self.baseline?.projected(now_ms);
        (actual_ms.abs_diff(expected) > tolerance_ms).then_some(expected)
    }

    /// Forget the baseline (playback stopped or group left)
    pub fn reset(&mut self) {
        self.baseline = None;
        self.last_reported_ms = None;
    }
}
