//! Reconnect backoff

use std::time::Duration;

/// Delay before reconnect attempt `attempt` (0-based): `min(base * 2^attempt, max)`
pub fn reconnect_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(max, |d| d.min(max))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(1000);
    const MAX: Duration = Duration::from_millis(30_000);

    #[test]
    fn test_delay_values() {
        assert_eq!(reconnect_delay(0, BASE, MAX), Duration::from_millis(1000));
        assert_eq!(reconnect_delay(1, BASE, MAX), Duration::from_millis(2000));
        assert_eq!(reconnect_delay(4, BASE, MAX), Duration::from_millis(16_000));
        assert_eq!(reconnect_delay(5, BASE, MAX), MAX);
    }

    #[test]
    fn test_delay_bounded_and_monotonic() {
        let mut previous = Duration::ZERO;
        for attempt in 0..100 {
            let delay = reconnect_delay(attempt, BASE, MAX);
            let expected = 1000u128
                .checked_mul(1u128 << attempt.min(100))
                .map_or(30_000, |ms| ms.min(30_000));
            assert_eq!(delay.as_millis(), expected);
            assert!(delay <= MAX);
            assert!(delay >= previous);
            previous = delay;
        }
    }
}
