//! Process-wide monotonic counters.
//!
//! Version ids, store ids, object ids and auto-generated persistence keys all
//! come from here. Each counter is a single owner of its value with explicit
//! `next`/`current`/`reset` operations, so tests can hand a store its own
//! [`Counter`] and get deterministic versions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

/// A monotonically increasing `u64` counter.
///
/// The first value handed out by [`next`](Counter::next) is `1`, so `0` can
/// stand for "never bumped".
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Create a counter starting at zero.
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Advance the counter and return the new value.
    pub fn next(&self) -> u64 {
        self.value.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The most recently issued value (`0` if none).
    pub fn current(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Rewind the counter to zero.
    ///
    /// Only meaningful for counters owned by a single test; resetting a
    /// shared counter lets ids repeat.
    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

/// Version ids shared by every store that was not given its own counter.
static GLOBAL_UID: LazyLock<Arc<Counter>> = LazyLock::new(|| Arc::new(Counter::new()));

/// Numbering for auto-generated persistence keys.
pub(crate) static STORE_COUNTER: Counter = Counter::new();

/// Store identities, used to claim ownership of nested objects.
pub(crate) static STORE_IDS: Counter = Counter::new();

/// Object identities, used as the reactive cache key.
pub(crate) static OBJECT_IDS: Counter = Counter::new();

/// The process-wide version counter.
pub fn global_uid() -> Arc<Counter> {
    Arc::clone(&GLOBAL_UID)
}
