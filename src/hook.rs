//! Binding a store to a host renderer.
//!
//! The renderer is modelled by [`ExternalStore`]: something it can subscribe
//! to and take an integer snapshot of. A [`StoreHook`] is one consumer's
//! render context; it subscribes once and counts the re-renders it forced.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::signal::{Listener, Subscription};
use crate::store::Store;

/// A source a renderer can subscribe to and snapshot.
///
/// A renderer re-renders when a notification arrives and the snapshot has
/// changed since its last render.
pub trait ExternalStore {
    /// Call `listener` on every change.
    fn subscribe(&self, listener: Listener) -> Subscription;

    /// A monotonically increasing change marker.
    fn snapshot(&self) -> u64;
}

impl ExternalStore for Store {
    fn subscribe(&self, listener: Listener) -> Subscription {
        Store::subscribe(self, listener)
    }

    fn snapshot(&self) -> u64 {
        self.version()
    }
}

/// One consumer of a store.
pub struct StoreHook {
    store: Store,
    subscription: Option<Subscription>,
    renders: Arc<AtomicU64>,
}

impl StoreHook {
    /// A hook over `store` that has not subscribed yet.
    pub fn new(store: Store) -> Self {
        Self {
            store,
            subscription: None,
            renders: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Called on every render. Subscribes on the first call; later calls
    /// keep the existing subscription and ignore `rerender`.
    ///
    /// Always returns the same store: changes are signalled through
    /// [`snapshot`](StoreHook::snapshot), never a new store identity.
    pub fn use_store<F>(&mut self, rerender: F) -> &Store
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.subscription.is_some() {
            cov_mark::hit!(hook_already_subscribed);
        } else {
            let renders = Arc::clone(&self.renders);
            let listener: Listener = Arc::new(move || {
                renders.fetch_add(1, Ordering::AcqRel);
                rerender();
            });
            self.subscription = Some(ExternalStore::subscribe(&self.store, listener));
        }
        &self.store
    }

    /// Number of re-renders this hook has forced.
    pub fn snapshot(&self) -> u64 {
        self.renders.load(Ordering::Acquire)
    }

    /// Whether the hook is currently subscribed.
    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    /// Unsubscribe. A later `use_store` subscribes again.
    pub fn teardown(&mut self) {
        self.subscription = None;
    }
}

impl std::fmt::Debug for StoreHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHook")
            .field("subscribed", &self.is_subscribed())
            .field("renders", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Object;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn store() -> Store {
        Store::builder(Object::try_from(json!({ "count": 0 })).unwrap()).build()
    }

    #[test]
    fn subscribes_once_and_counts_renders() {
        let store = store();
        let mut hook = store.hook();
        let rerenders = Arc::new(AtomicUsize::new(0));

        let r = rerenders.clone();
        assert!(hook.use_store(move || {
            r.fetch_add(1, Ordering::Relaxed);
        })
        .ptr_eq(&store));
        {
            cov_mark::check!(hook_already_subscribed);
            let r = rerenders.clone();
            assert!(hook.use_store(move || {
                r.fetch_add(1, Ordering::Relaxed);
            })
            .ptr_eq(&store));
        }

        store.set("count", 1).unwrap();
        store.set("count", 2).unwrap();
        assert_eq!(hook.snapshot(), 2);
        assert_eq!(rerenders.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn teardown_unsubscribes() {
        let store = store();
        let mut hook = store.hook();
        hook.use_store(|| {});
        assert!(hook.is_subscribed());

        hook.teardown();
        store.set("count", 1).unwrap();
        assert_eq!(hook.snapshot(), 0);
        assert!(!hook.is_subscribed());
    }

    #[test]
    fn store_snapshot_is_its_version() {
        let store = store();
        let before = ExternalStore::snapshot(&store);
        store.set("count", 5).unwrap();
        assert!(ExternalStore::snapshot(&store) > before);
        assert_eq!(ExternalStore::snapshot(&store), store.version());
    }
}
