//! ---
//! cbx_section: "01-core-runtime"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Time helpers for PWM phase and millisecond conversions."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
use std::time::Duration;

/// Convert a duration into whole milliseconds, saturating at `u64::MAX`.
pub fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Signed difference between an actual and an expected interval, in microseconds.
pub fn jitter_us(actual: Duration, expected: Duration) -> i64 {
    let actual_us = actual.as_secs_f64() * 1_000_000.0;
    let expected_us = expected.as_secs_f64() * 1_000_000.0;
    (actual_us - expected_us).round() as i64
}

/// Position of `elapsed` inside a repeating period.
pub fn phase_in_period(elapsed: Duration, period: Duration) -> Duration {
    if period.is_zero() {
        return Duration::ZERO;
    }
    let period_ns = period.as_nanos();
    let offset = elapsed.as_nanos() % period_ns;
    Duration::from_nanos(offset as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_is_signed() {
        assert_eq!(
            jitter_us(Duration::from_millis(900), Duration::from_secs(1)),
            -100_000
        );
        assert_eq!(
            jitter_us(Duration::from_millis(1002), Duration::from_secs(1)),
            2_000
        );
    }

    #[test]
    fn phase_wraps_at_period() {
        let period = Duration::from_secs(15);
        assert_eq!(
            phase_in_period(Duration::from_secs(31), period),
            Duration::from_secs(1)
        );
        assert_eq!(phase_in_period(Duration::from_secs(7), Duration::ZERO), Duration::ZERO);
    }
}
