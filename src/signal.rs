use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::hash::FastIndexMap;

/// A zero-argument notification callback.
///
/// Listeners are identified by their `Arc` allocation: subscribing the same
/// `Arc` twice registers it once, and it stays registered until both
/// subscriptions are gone.
pub type Listener = Arc<dyn Fn() + Send + Sync>;

struct Registration {
    listener: Listener,
    handles: usize,
}

type ListenerTable = RwLock<FastIndexMap<usize, Registration>>;

fn listener_key(listener: &Listener) -> usize {
    Arc::as_ptr(listener) as *const () as usize
}

/// The single notification primitive of a store: a version cell plus the
/// listeners to call when it changes.
///
/// Every re-render and every persistence save is ultimately driven by a
/// [`set`](VersionSignal::set) that actually changed the version.
pub struct VersionSignal {
    version: AtomicU64,
    listeners: Arc<ListenerTable>,
}

impl VersionSignal {
    /// Create a signal holding `initial`.
    pub fn new(initial: u64) -> Self {
        Self {
            version: AtomicU64::new(initial),
            listeners: Arc::new(RwLock::new(FastIndexMap::default())),
        }
    }

    /// The current version.
    pub fn get(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Store `version` and notify every listener if it differs from the
    /// current one. Returns whether listeners were notified.
    ///
    /// Listeners run synchronously in subscription order. The table is
    /// snapshotted first, so a listener may subscribe or unsubscribe freely;
    /// changes take effect from the next `set`.
    pub fn set(&self, version: u64) -> bool {
        let previous = self.version.swap(version, Ordering::AcqRel);
        if previous == version {
            cov_mark::hit!(signal_set_same_version);
            return false;
        }

        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .values()
            .map(|registration| registration.listener.clone())
            .collect();
        for listener in listeners {
            notify_isolated(&listener);
        }
        true
    }

    /// Register `listener`; dropping the returned [`Subscription`] removes it.
    pub fn subscribe(&self, listener: Listener) -> Subscription {
        let key = listener_key(&listener);
        self.listeners
            .write()
            .entry(key)
            .or_insert_with(|| Registration {
                listener: listener.clone(),
                handles: 0,
            })
            .handles += 1;
        Subscription {
            table: Arc::downgrade(&self.listeners),
            key,
            _listener: listener,
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl Default for VersionSignal {
    fn default() -> Self {
        Self::new(0)
    }
}

impl std::fmt::Debug for VersionSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionSignal")
            .field("version", &self.get())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Run one listener so that a panic is logged instead of aborting the rest
/// of the fan-out.
fn notify_isolated(listener: &Listener) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener())) {
        cov_mark::hit!(listener_panic_isolated);
        tracing::error!(
            panic = panic_message(payload.as_ref()),
            "store listener panicked, continuing notification"
        );
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

/// RAII handle for a listener registered with [`VersionSignal::subscribe`].
///
/// Dropping the last handle for a listener removes that listener and no
/// other. The handle does not keep the signal alive. It does keep its
/// listener alive, so its key cannot be taken by another listener.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    table: Weak<ListenerTable>,
    key: usize,
    _listener: Listener,
}

impl Subscription {
    /// Remove the listener now.
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Whether the signal this subscription belongs to still exists.
    pub fn is_active(&self) -> bool {
        self.table
            .upgrade()
            .is_some_and(|table| table.read().contains_key(&self.key))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let mut table = table.write();
        if let Some(registration) = table.get_mut(&self.key) {
            registration.handles -= 1;
            if registration.handles == 0 {
                table.shift_remove(&self.key);
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}
