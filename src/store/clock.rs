use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

/// Server-side timestamp source for a store.
///
/// Hands out millisecond timestamps that strictly increase for the lifetime of the
/// store, even when the wall clock stalls or steps backwards.
#[derive(Debug, Default)]
pub struct StoreClock {
    last_ms: AtomicI64,
}

impl StoreClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock that will never hand out a timestamp at or before `last`.
    pub fn starting_after(last: DateTime<Utc>) -> Self {
        Self {
            last_ms: AtomicI64::new(last.timestamp_millis()),
        }
    }

    pub fn next(&self) -> DateTime<Utc> {
        let now_ms = Utc::now().timestamp_millis();
        let mut last = self.last_ms.load(Ordering::Relaxed);
        loop {
            let candidate = now_ms.max(last + 1);
            match self.last_ms.compare_exchange_weak(
                last,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return DateTime::from_timestamp_millis(candidate).unwrap_or_else(Utc::now);
                }
                Err(actual) => last = actual,
            }
        }
    }
}
