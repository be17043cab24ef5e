//! Unix-time helpers. All persisted timestamps are seconds since the epoch
//! as `f64`, matching the scores of the store's sorted sets.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Seconds elapsed since `then` (clamped at zero).
pub fn age_secs(then: f64) -> f64 {
    (unix_now() - then).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_now_is_recent() {
        // Sanity: after 2020, before 2100.
        let now = unix_now();
        assert!(now > 1_577_836_800.0);
        assert!(now < 4_102_444_800.0);
    }

    #[test]
    fn age_is_non_negative() {
        assert_eq!(age_secs(unix_now() + 1000.0), 0.0);
        assert!(age_secs(unix_now() - 5.0) >= 5.0);
    }
}
