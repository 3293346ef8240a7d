/*!
 * Utility functions shared across the Xtralien crates.
 */
use std::time::Duration;

/// Convert a Duration to milliseconds, for log fields and config round-trips
pub fn duration_to_millis(duration: Duration) -> u64 {
    duration.as_secs() * 1000 + u64::from(duration.subsec_millis())
}

/// Convert milliseconds from a config file to a Duration
pub fn millis_to_duration(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_conversions() {
        let duration = Duration::from_millis(1234);
        let millis = duration_to_millis(duration);
        assert_eq!(millis, 1234);
        assert_eq!(millis_to_duration(millis), duration);
    }

    #[test]
    fn test_sub_millisecond_precision_is_dropped() {
        assert_eq!(duration_to_millis(Duration::from_micros(2_500)), 2);
        assert_eq!(duration_to_millis(Duration::ZERO), 0);
    }
}
