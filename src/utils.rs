use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of the current Unix time in seconds
pub trait TimeSource: Send + Sync {
    fn unix_now(&self) -> i64;
}

/// Wall-clock time source backed by the system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn unix_now(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Time source that only moves when told to. Useful for tests that need
/// to pin a request to a particular window.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now: AtomicI64,
}

impl ManualTimeSource {
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: i64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn unix_now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Index of the fixed window containing `now`, aligned to the Unix epoch
pub fn window_index(now: i64, window_seconds: u64) -> i64 {
    now.div_euclid(window_seconds as i64)
}

/// Generate the storage key for `key` in the window containing `now`
pub fn generate_window_key(key: &str, window_seconds: u64, now: i64) -> String {
    format!("{}:{}", key, window_index(now, window_seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_key_generation() {
        assert_eq!(generate_window_key("1.2.3.4", 60, 0), "1.2.3.4:0");
        assert_eq!(generate_window_key("1.2.3.4", 60, 59), "1.2.3.4:0");
        assert_eq!(generate_window_key("1.2.3.4", 60, 60), "1.2.3.4:1");
        assert_eq!(generate_window_key("1.2.3.4", 3600, 1_700_000_000), "1.2.3.4:472222");
    }

    #[test]
    fn test_windows_are_globally_aligned() {
        // Two callers starting at different offsets share the same boundary.
        let a = generate_window_key("a", 10, 101);
        let b = generate_window_key("b", 10, 109);
        assert_eq!(a.rsplit(':').next(), b.rsplit(':').next());
        assert_ne!(generate_window_key("a", 10, 109), generate_window_key("a", 10, 110));
    }

    #[test]
    fn test_caller_key_with_colons() {
        let key = generate_window_key("::1", 60, 120);
        assert_eq!(key, "::1:2");
    }

    #[test]
    fn test_manual_time_source() {
        let clock = ManualTimeSource::new(100);
        assert_eq!(clock.unix_now(), 100);
        clock.advance(5);
        assert_eq!(clock.unix_now(), 105);
        clock.set(42);
        assert_eq!(clock.unix_now(), 42);
    }

    #[test]
    fn test_system_time_source_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(SystemTimeSource.unix_now() > 1_577_836_800);
    }
}
