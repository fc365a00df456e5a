//! Logging setup and elapsed-time helper

use std::sync::Once;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install a fmt subscriber honoring `RUST_LOG`, falling back to `level`
///
/// Safe to call more than once; only the first call installs the subscriber.
pub fn init(level: &str) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        // another global subscriber may already be installed by the host program
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

/// Measures the time since creation or since the previous lap
#[derive(Debug)]
pub struct Timer {
    last: Instant,
}

impl Timer {
    /// Start a new timer
    #[must_use]
    pub fn start() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    /// Seconds elapsed since the start or the previous lap, then restart
    pub fn lap(&mut self) -> f64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        elapsed
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_laps_are_non_negative_and_reset() {
        let mut timer = Timer::start();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let first = timer.lap();
        let second = timer.lap();
        assert!(first >= 0.005);
        assert!(second < first);
    }

    #[test]
    fn test_init_is_idempotent() {
        init("debug");
        init("info");
    }
}
