use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Hybrid logical timestamp attached to every delta.
///
/// Ordering: `physical_ms` then `logical`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct LogicalTime {
    /// Wall-clock milliseconds since UNIX epoch.
    pub physical_ms: u64,
    /// Counter for events within the same millisecond.
    pub logical: u32,
}

impl LogicalTime {
    pub fn new(physical_ms: u64, logical: u32) -> Self {
        Self {
            physical_ms,
            logical,
        }
    }
}

/// Hybrid logical clock producing strictly increasing [`LogicalTime`]s.
///
/// - **Local event**: `physical = max(wall_clock, last.physical)`; the logical
///   counter resets when physical advances and increments otherwise.
/// - **Observe**: replayed timestamps push the clock forward so local events
///   created after a replay order after everything replayed.
#[derive(Debug, Default)]
pub struct LogicalClock {
    last: Mutex<LogicalTime>,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> LogicalTime {
        let wall = wall_clock_ms();
        let mut last = self.last.lock().expect("clock mutex poisoned");
        let physical = wall.max(last.physical_ms);
        let logical = if physical > last.physical_ms {
            0
        } else {
            last.logical + 1
        };
        *last = LogicalTime::new(physical, logical);
        *last
    }

    /// Advance past `seen` if it is ahead of the local state.
    pub fn observe(&self, seen: &LogicalTime) {
        let mut last = self.last.lock().expect("clock mutex poisoned");
        if *seen > *last {
            *last = *seen;
        }
    }

    pub fn last(&self) -> LogicalTime {
        *self.last.lock().expect("clock mutex poisoned")
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_strictly_monotonic() {
        let clock = LogicalClock::new();
        let mut prev = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn observe_pushes_clock_forward() {
        let clock = LogicalClock::new();
        let future = LogicalTime::new(u64::MAX / 2, 7);
        clock.observe(&future);
        assert!(clock.now() > future);
    }

    #[test]
    fn observe_ignores_past() {
        let clock = LogicalClock::new();
        let t = clock.now();
        clock.observe(&LogicalTime::new(1, 0));
        assert_eq!(clock.last(), t);
    }
}
