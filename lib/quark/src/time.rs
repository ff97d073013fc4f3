use std::time::{Instant, SystemTime};

/// Tick resolution of [`Clock`]. One tick is one nanosecond.
pub const TICKS_PER_SECOND: i64 = 1_000_000_000;

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Monotonic high-resolution tick source. All protocol timestamps (receive
/// times, filter samples, frame schedules) are ticks from one `Clock`.
#[derive(Debug, Copy, Clone)]
pub struct Clock {
    start: Instant,
}

impl Clock {
    #[inline]
    pub fn new() -> Clock {
        Clock {
            start: Instant::now(),
        }
    }

    /// Ticks elapsed since the clock was created.
    #[inline]
    pub fn ticks(&self) -> i64 {
        let elapsed = self.start.elapsed();
        elapsed.as_secs() as i64 * TICKS_PER_SECOND + i64::from(elapsed.subsec_nanos())
    }

    /// Tick frequency of this clock.
    #[inline]
    pub fn frequency() -> i64 {
        TICKS_PER_SECOND
    }

    /// Converts a tick delta to seconds.
    #[inline]
    pub fn ticks_to_secs(ticks: i64) -> f64 {
        ticks as f64 / TICKS_PER_SECOND as f64
    }

    /// Converts a frame rate into the tick length of one frame.
    #[inline]
    pub fn ticks_per_frame(frames_per_second: u32) -> i64 {
        TICKS_PER_SECOND / i64::from(frames_per_second.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_ticks_monotonic() {
        let clock = Clock::new();
        let a = clock.ticks();
        thread::sleep(Duration::from_millis(2));
        let b = clock.ticks();

        assert!(b > a);
    }

    #[test]
    fn test_ticks_per_frame() {
        assert_eq!(Clock::ticks_per_frame(20), 50_000_000);
        assert_eq!(Clock::ticks_per_frame(0), TICKS_PER_SECOND);
    }

    #[test]
    fn test_ticks_to_secs() {
        assert!((Clock::ticks_to_secs(TICKS_PER_SECOND / 2) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_timestamp() {
        // 2020-01-01 as a floor; this code did not time travel.
        assert!(timestamp_secs() > 1_577_836_800);
    }
}
