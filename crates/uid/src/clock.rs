//! Monotonic millisecond clock.
//!
//! Wall-clock time can jump backward (NTP corrections, manual changes). Uids
//! embed a timestamp that recovery and branch selection compare, so the clock
//! used to build them must never go back and never repeat a value.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of raw wall-clock milliseconds.
pub type TimeSource = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Strictly increasing millisecond clock.
///
/// Every call to [`MonotonicClock::now_millis`] returns a value greater than
/// any value previously returned by the same clock, even when the underlying
/// time source moves backward.
pub struct MonotonicClock {
    source: TimeSource,
    last: AtomicU64,
}

impl MonotonicClock {
    /// Create a clock backed by the system wall clock.
    pub fn new() -> Self {
        Self::with_source(Arc::new(system_millis))
    }

    /// Create a clock backed by a custom time source.
    pub fn with_source(source: TimeSource) -> Self {
        Self {
            source,
            last: AtomicU64::new(0),
        }
    }

    /// Process-wide clock shared by every generator that does not bring its own.
    pub fn global() -> Arc<MonotonicClock> {
        static GLOBAL: OnceLock<Arc<MonotonicClock>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(MonotonicClock::new())).clone()
    }

    /// Current time in milliseconds since the Unix epoch, strictly increasing.
    pub fn now_millis(&self) -> u64 {
        let wall = (self.source)();
        let mut last = self.last.load(Ordering::SeqCst);
        loop {
            let next = wall.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(observed) => last = observed,
            }
        }
    }

    /// Last value handed out, 0 if the clock was never read.
    pub fn last_millis(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MonotonicClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonotonicClock")
            .field("last", &self.last_millis())
            .finish()
    }
}

fn system_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;

    #[test]
    fn test_clock_is_strictly_increasing() {
        let clock = MonotonicClock::new();

        let mut previous = clock.now_millis();
        for _ in 0..10_000 {
            let now = clock.now_millis();
            assert!(now > previous);
            previous = now;
        }
    }

    #[test]
    fn test_clock_survives_backward_jump() {
        let wall = Arc::new(AtomicI64::new(1_000_000));
        let source = wall.clone();
        let clock = MonotonicClock::with_source(Arc::new(move || {
            source.load(Ordering::SeqCst) as u64
        }));

        let before = clock.now_millis();
        assert_eq!(before, 1_000_000);

        // Wall clock goes back ten seconds
        wall.store(990_000, Ordering::SeqCst);
        let after = clock.now_millis();
        assert!(after > before);

        // And forward again
        wall.store(2_000_000, Ordering::SeqCst);
        assert_eq!(clock.now_millis(), 2_000_000);
    }

    #[test]
    fn test_concurrent_readers_never_see_duplicates() {
        let clock = Arc::new(MonotonicClock::new());
        let mut handles = Vec::new();

        for _ in 0..4 {
            let clock = clock.clone();
            handles.push(std::thread::spawn(move || {
                (0..1_000).map(|_| clock.now_millis()).collect::<Vec<_>>()
            }));
        }

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total);
    }
}
