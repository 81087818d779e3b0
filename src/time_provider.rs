//! Wall-clock source for the bus core
//!
//! Envelope timestamps, entity-creation backoff and the correlator's reaper
//! cadence all draw from one injected [`Clock`]. Swapping the clock is how
//! the test suite speeds the bus up: waits shrink proportionally rather
//! than being skipped, so backoff steps still grow per attempt and the
//! reaper still ticks more often than requests expire.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Factor test clocks divide waits by.
///
/// Chosen so the correlator's one-second reaper cadence lands on a single
/// millisecond tick under compression.
pub const TEST_SLEEP_COMPRESSION: u32 = 1_000;

/// Floor for compressed waits; every sleep stays a real suspension point
const MIN_COMPRESSED_SLEEP: Duration = Duration::from_micros(500);

/// Wall-clock and timer source consumed by the bus
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    /// The current wall-clock time
    fn now(&self) -> SystemTime;

    /// Suspends the caller for `duration`
    async fn sleep(&self, duration: Duration);
}

/// Production clock backed by system time and tokio timers
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Clock that divides every wait by a compression factor
///
/// Unlike a clock that skips waits outright, compression preserves the
/// relative ordering the bus relies on: the entity manager's linear backoff
/// still waits longer on each attempt, and reaper ticks still interleave
/// with the work they police.
#[derive(Debug, Clone, Copy)]
pub struct TestClock {
    compression: u32,
}

impl TestClock {
    /// A clock compressed by [`TEST_SLEEP_COMPRESSION`]
    #[must_use]
    pub fn new() -> Self {
        Self::compressed_by(TEST_SLEEP_COMPRESSION)
    }

    /// A clock dividing waits by `factor`; zero behaves as one
    #[must_use]
    pub fn compressed_by(factor: u32) -> Self {
        Self {
            compression: factor.max(1),
        }
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for TestClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        let compressed = (duration / self.compression).max(MIN_COMPRESSED_SLEEP);
        tokio::time::sleep(compressed).await;
    }
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// The production clock as a shared handle
#[must_use]
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// A compressed clock for tests
#[must_use]
pub fn test_clock() -> SharedClock {
    Arc::new(TestClock::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::correlator::REAPER_INTERVAL;
    use std::time::Instant;

    #[tokio::test]
    async fn compression_scales_the_reaper_cadence_to_a_millisecond() {
        assert_eq!(
            REAPER_INTERVAL / TEST_SLEEP_COMPRESSION,
            Duration::from_millis(1)
        );

        let clock = TestClock::new();
        let start = Instant::now();
        clock.sleep(REAPER_INTERVAL).await;
        assert!(
            start.elapsed() < REAPER_INTERVAL / 10,
            "reaper-length wait was not compressed"
        );
    }

    #[tokio::test]
    async fn compressed_backoff_keeps_attempt_ordering() {
        let clock = TestClock::compressed_by(100);
        let start = Instant::now();
        // The entity manager's backoff shape: attempt k waits k seconds
        for attempt in 1..=3u32 {
            clock.sleep(Duration::from_secs(u64::from(attempt))).await;
        }
        let elapsed = start.elapsed();
        // Six compressed seconds at 1/100 land around 60ms
        assert!(
            elapsed >= Duration::from_millis(50),
            "waits collapsed entirely: {elapsed:?}"
        );
        assert!(
            elapsed < Duration::from_secs(1),
            "waits were not compressed: {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn system_clock_tracks_wall_time() {
        let clock = SystemClock;
        let before = clock.now();
        clock.sleep(Duration::from_millis(20)).await;
        let after = clock.now();
        assert!(
            after.duration_since(before).unwrap_or_default() >= Duration::from_millis(10),
            "wall clock did not advance across a timed sleep"
        );
    }
}
