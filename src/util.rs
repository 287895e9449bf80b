//! Small time helpers shared by every component.
//!
//! All timestamps placed on queues are seconds relative to the run's
//! `time_offset`; these helpers provide the absolute wall-clock values the
//! offsets are derived from.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as fractional seconds since the Unix epoch.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Current wall-clock time in nanoseconds, used for sequencer step ids.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clocks_are_monotonic_enough() {
        let a = now_secs();
        let b = now_secs();
        assert!(b >= a);
        assert!(now_ns() > 1_600_000_000_000_000_000);
    }
}
