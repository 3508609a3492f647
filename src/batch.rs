//! Batching of store notifications.
//!
//! Inside [`batch`], scheduled updates are queued instead of run. When the
//! outermost batch exits, the queue is taken, cleared, and every entry runs
//! once in the order it was first scheduled. Updates are deduplicated by
//! `Arc` identity, which is what collapses many writes to one store into one
//! version bump.
//!
//! The nesting depth and queue are per thread. Stores assume the single
//! event-loop thread they are mutated on, so this is the whole process as
//! far as a store is concerned.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use crate::hash::FastIndexMap;

/// A deferred update closure. Scheduling the same `Arc` twice before a flush
/// runs it once.
pub type Updater = Arc<dyn Fn() + Send + Sync>;

struct BatchFrame {
    depth: Cell<usize>,
    pending: RefCell<FastIndexMap<usize, Updater>>,
}

thread_local! {
    static FRAME: BatchFrame = BatchFrame {
        depth: Cell::new(0),
        pending: RefCell::new(FastIndexMap::default()),
    };
}

fn updater_key(update: &Updater) -> usize {
    Arc::as_ptr(update) as *const () as usize
}

/// Run `update` now, or queue it if a batch is open on this thread.
pub fn schedule_update(update: &Updater) {
    let queued = FRAME.with(|frame| {
        if frame.depth.get() == 0 {
            return false;
        }
        let mut pending = frame.pending.borrow_mut();
        if pending.contains_key(&updater_key(update)) {
            cov_mark::hit!(batch_update_deduplicated);
        } else {
            pending.insert(updater_key(update), Arc::clone(update));
        }
        true
    });

    if !queued {
        update();
    }
}

/// Run `f` with notifications deferred until the outermost batch exits.
///
/// Nested calls are allowed; only the outermost one flushes. If `f` panics,
/// the depth is still restored and queued updates still run before the
/// panic continues to unwind.
///
/// ```ignore
/// batch(|| {
///     store.set("a", 1)?;
///     store.set("b", 2)
/// })?; // one notification
/// ```
pub fn batch<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    FRAME.with(|frame| frame.depth.set(frame.depth.get() + 1));
    let _guard = BatchGuard;
    f()
}

/// Whether a batch is open on this thread.
pub fn is_batching() -> bool {
    batch_depth() > 0
}

/// Current nesting depth on this thread.
pub fn batch_depth() -> usize {
    FRAME.with(|frame| frame.depth.get())
}

/// Restores the depth on drop and flushes when it reaches zero.
struct BatchGuard;

impl Drop for BatchGuard {
    fn drop(&mut self) {
        let flushed = FRAME.with(|frame| {
            let depth = frame.depth.get().saturating_sub(1);
            frame.depth.set(depth);
            if depth == 0 {
                Some(std::mem::take(&mut *frame.pending.borrow_mut()))
            } else {
                None
            }
        });

        // The queue is already empty here, so updates scheduled by these
        // closures run immediately.
        if let Some(pending) = flushed {
            for update in pending.into_values() {
                update();
            }
        }
    }
}
