//! Wire time units and wall clock helpers
//!
//! The authority speaks 100ns ticks; everything inside the engine is
//! milliseconds.

/// Ticks per millisecond (1 tick = 100ns)
pub const TICKS_PER_MS: i64 = 10_000;

/// Convert wire ticks to milliseconds. Negative ticks clamp to zero.
pub fn ticks_to_ms(ticks: i64) -> u64 {
    if ticks <= 0 {
        0
    } else {
        (ticks / TICKS_PER_MS) as u64
    }
}

/// Convert milliseconds to wire ticks
pub fn ms_to_ticks(ms: u64) -> i64 {
    (ms as i64).saturating_mul(TICKS_PER_MS)
}

/// Current time in milliseconds since UNIX epoch
pub fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_on_whole_milliseconds() {
        for ticks in [0_i64, 10_000, 50_000_000, 36_000_000_000, 123_450_000] {
            assert_eq!(ms_to_ticks(ticks_to_ms(ticks)), ticks);
        }
    }

    #[test]
    fn test_conversion_values() {
        assert_eq!(ms_to_ticks(5000), 50_000_000);
        assert_eq!(ticks_to_ms(100_000_000), 10_000);
        // Sub-millisecond remainder truncates
        assert_eq!(ticks_to_ms(19_999), 1);
        assert_eq!(ticks_to_ms(-10_000), 0);
    }
}
