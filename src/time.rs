//! Clock abstraction and time helpers.
//!
//! Workers, frame sources, and publishers never call `Instant::now()` or
//! `thread::sleep` directly; they go through a [`Clock`] handle so that
//! reconnection backoff and URL-expiry behaviour can be driven by a stub
//! clock in tests.

use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Time source used by the pipeline.
///
/// `monotonic` is an arbitrary-epoch duration suitable for measuring
/// elapsed time; `wall_ms` is milliseconds since the Unix epoch and is what
/// ends up in event timestamps.
pub trait Clock: Send + Sync {
    fn monotonic(&self) -> Duration;
    fn wall_ms(&self) -> i64;
    fn sleep(&self, duration: Duration);
}

/// Production clock backed by `Instant` and `SystemTime`.
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic(&self) -> Duration {
        self.start.elapsed()
    }

    fn wall_ms(&self) -> i64 {
        wall_clock_ms()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn wall_clock_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_millis() as i64,
        // Clock before epoch; report zero rather than panic.
        Err(_) => 0,
    }
}

/// Manually advanced clock for tests.
///
/// `sleep` does not block: it advances the virtual time and records the
/// requested duration so tests can assert on backoff envelopes.
pub struct StubClock {
    state: Mutex<StubState>,
}

struct StubState {
    now: Duration,
    wall_ms: i64,
    sleeps: Vec<Duration>,
}

impl StubClock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StubState {
                now: Duration::ZERO,
                wall_ms: 0,
                sleeps: Vec::new(),
            }),
        }
    }

    /// Advance virtual time by `duration` (both monotonic and wall clock).
    pub fn advance(&self, duration: Duration) {
        let mut state = self.state.lock().unwrap();
        state.now += duration;
        state.wall_ms += duration.as_millis() as i64;
    }

    pub fn set_wall_ms(&self, wall_ms: i64) {
        self.state.lock().unwrap().wall_ms = wall_ms;
    }

    /// All durations passed to `sleep` so far, oldest first.
    pub fn recorded_sleeps(&self) -> Vec<Duration> {
        self.state.lock().unwrap().sleeps.clone()
    }
}

impl Default for StubClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for StubClock {
    fn monotonic(&self) -> Duration {
        self.state.lock().unwrap().now
    }

    fn wall_ms(&self) -> i64 {
        self.state.lock().unwrap().wall_ms
    }

    fn sleep(&self, duration: Duration) {
        let mut state = self.state.lock().unwrap();
        state.now += duration;
        state.wall_ms += duration.as_millis() as i64;
        state.sleeps.push(duration);
    }
}

/// Render a duration as a short human string for log lines.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs < 60.0 {
        return format!("{:.1}s", secs);
    }
    let minutes = (secs / 60.0) as u64;
    let rem = secs % 60.0;
    if minutes < 60 {
        return format!("{}m {:.0}s", minutes, rem);
    }
    format!("{}h {}m {:.0}s", minutes / 60, minutes % 60, rem)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_clock_advances_and_records_sleeps() {
        let clock = StubClock::new();
        assert_eq!(clock.monotonic(), Duration::ZERO);

        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.monotonic(), Duration::from_secs(5));

        clock.sleep(Duration::from_millis(1500));
        assert_eq!(clock.monotonic(), Duration::from_millis(6500));
        assert_eq!(clock.recorded_sleeps(), vec![Duration::from_millis(1500)]);
    }

    #[test]
    fn stub_clock_wall_ms_tracks_sleep_and_advance() {
        let clock = StubClock::new();
        clock.set_wall_ms(1_000);
        clock.advance(Duration::from_millis(250));
        clock.sleep(Duration::from_millis(750));
        assert_eq!(clock.wall_ms(), 2_000);
    }

    #[test]
    fn format_duration_picks_unit() {
        assert_eq!(format_duration(Duration::from_millis(2300)), "2.3s");
        assert_eq!(format_duration(Duration::from_secs(95)), "1m 35s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.monotonic();
        let b = clock.monotonic();
        assert!(b >= a);
        assert!(clock.wall_ms() > 0);
    }
}
