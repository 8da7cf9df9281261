use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Millisecond timestamp source for envelope `ts` fields.
///
/// Each producing connection owns one. Stamps are monotonically
/// non-decreasing per clock even when the wall clock steps backwards;
/// nothing is globally ordered across connections and receivers never
/// reorder on `ts`.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicI64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_ms(&self) -> i64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        self.last.fetch_max(wall, Ordering::AcqRel).max(wall)
    }
}
