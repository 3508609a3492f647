//! Saving store state to external key-value storage.
//!
//! A persistent store restores its state once at construction and then saves
//! after every notification, either synchronously or debounced. Nothing in
//! here ever fails a store operation: every error goes to the configured
//! [`ErrorHandler`].

mod debounce;
mod storage;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::{Mutex, ReentrantMutex};

use crate::counter::STORE_COUNTER;
use crate::error::{PersistError, StorageError};
use crate::signal::{Subscription, VersionSignal};
use crate::store::StoreCore;
use crate::value::{Value, json_kind};

use self::debounce::Debouncer;
pub use self::storage::{FileStorage, MemoryStorage, StorageBackend};

/// Default debounce window. Zero saves synchronously on every notification.
pub const DEFAULT_DEBOUNCE: Duration = Duration::ZERO;

const AUTO_KEY_PREFIX: &str = "reactive-store-";

/// The saved or restored mapping of field names to values.
pub type Snapshot = IndexMap<String, Value>;

/// Turns a snapshot into the blob written to storage.
pub type SerializeFn = Arc<dyn Fn(&Snapshot) -> Result<String, PersistError> + Send + Sync>;

/// Parses a stored blob back into a snapshot.
pub type DeserializeFn = Arc<dyn Fn(&str) -> Result<Snapshot, PersistError> + Send + Sync>;

/// Receives every persistence failure.
pub type ErrorHandler = Arc<dyn Fn(&PersistError) + Send + Sync>;

/// The default serializer: a JSON object.
pub fn json_serialize(snapshot: &Snapshot) -> Result<String, PersistError> {
    serde_json::to_string(snapshot).map_err(|err| PersistError::Serialize(Box::new(err)))
}

/// The default deserializer. The blob must be a JSON object.
pub fn json_deserialize(blob: &str) -> Result<Snapshot, PersistError> {
    let json: serde_json::Value =
        serde_json::from_str(blob).map_err(|err| PersistError::Deserialize(Box::new(err)))?;
    match json {
        serde_json::Value::Object(map) => Ok(map
            .into_iter()
            .map(|(key, value)| (key, Value::from(value)))
            .collect()),
        other => Err(PersistError::InvalidSnapshot {
            found: json_kind(&other),
        }),
    }
}

fn log_error(err: &PersistError) {
    match std::error::Error::source(err) {
        Some(source) => tracing::error!(error = %err, source = %source, "store persistence failed"),
        None => tracing::error!(error = %err, "store persistence failed"),
    }
}

/// Persistence settings for a store.
///
/// The default is disabled. [`with_storage`](PersistOptions::with_storage)
/// is the usual starting point:
///
/// ```ignore
/// let options = PersistOptions::with_storage(MemoryStorage::new())
///     .key("settings")
///     .debounce(Duration::from_millis(300));
/// ```
#[derive(Clone)]
pub struct PersistOptions {
    enabled: bool,
    key: Option<String>,
    debounce: Duration,
    storage: Option<Arc<dyn StorageBackend>>,
    serialize: SerializeFn,
    deserialize: DeserializeFn,
    on_error: ErrorHandler,
}

impl Default for PersistOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            key: None,
            debounce: DEFAULT_DEBOUNCE,
            storage: None,
            serialize: Arc::new(json_serialize),
            deserialize: Arc::new(json_deserialize),
            on_error: Arc::new(log_error),
        }
    }
}

impl PersistOptions {
    /// Disabled persistence with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enabled persistence into `storage`.
    pub fn with_storage(storage: impl StorageBackend + 'static) -> Self {
        Self::default().enabled(true).storage(Arc::new(storage))
    }

    /// Turn persistence on or off.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Storage key. Without one, an enabled store gets `reactive-store-{n}`.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Wait this long after the last notification before saving.
    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Storage backend. Without one, persistence is a no-op.
    pub fn storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Replace the JSON serializer.
    pub fn serializer<F>(mut self, serialize: F) -> Self
    where
        F: Fn(&Snapshot) -> Result<String, PersistError> + Send + Sync + 'static,
    {
        self.serialize = Arc::new(serialize);
        self
    }

    /// Replace the JSON deserializer.
    pub fn deserializer<F>(mut self, deserialize: F) -> Self
    where
        F: Fn(&str) -> Result<Snapshot, PersistError> + Send + Sync + 'static,
    {
        self.deserialize = Arc::new(deserialize);
        self
    }

    /// Replace the handler that logs persistence failures.
    pub fn on_error<F>(mut self, on_error: F) -> Self
    where
        F: Fn(&PersistError) + Send + Sync + 'static,
    {
        self.on_error = Arc::new(on_error);
        self
    }

    /// Fix the settings for one store. `None` when disabled.
    pub(crate) fn resolve(self) -> Option<PersistConfig> {
        if !self.enabled {
            return None;
        }
        let key = self
            .key
            .unwrap_or_else(|| format!("{AUTO_KEY_PREFIX}{}", STORE_COUNTER.next()));
        Some(PersistConfig {
            key,
            debounce: self.debounce,
            storage: self.storage,
            serialize: self.serialize,
            deserialize: self.deserialize,
            on_error: self.on_error,
        })
    }
}

impl std::fmt::Debug for PersistOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistOptions")
            .field("enabled", &self.enabled)
            .field("key", &self.key)
            .field("debounce", &self.debounce)
            .field("storage", &self.storage.is_some())
            .finish_non_exhaustive()
    }
}

/// Resolved, immutable persistence settings of one store.
pub(crate) struct PersistConfig {
    key: String,
    debounce: Duration,
    storage: Option<Arc<dyn StorageBackend>>,
    serialize: SerializeFn,
    deserialize: DeserializeFn,
    on_error: ErrorHandler,
}

impl PersistConfig {
    /// The backend, if one is configured and reachable.
    fn backend(&self) -> Option<&dyn StorageBackend> {
        self.storage
            .as_deref()
            .filter(|storage| storage.is_available())
    }

    fn report(&self, err: PersistError) {
        (self.on_error)(&err);
    }

    fn storage_error(&self, source: StorageError) -> PersistError {
        PersistError::Storage {
            key: self.key.clone(),
            source,
        }
    }

    /// Read the saved snapshot, if there is a usable one.
    pub(crate) fn restore(&self) -> Option<Snapshot> {
        let backend = self.backend()?;
        let blob = match backend.get_item(&self.key) {
            Ok(Some(blob)) => blob,
            Ok(None) => return None,
            Err(err) => {
                self.report(self.storage_error(err));
                return None;
            }
        };
        match (self.deserialize)(&blob) {
            Ok(snapshot) => {
                tracing::debug!(key = %self.key, fields = snapshot.len(), "restored persisted state");
                Some(snapshot)
            }
            Err(err) => {
                self.report(err);
                None
            }
        }
    }
}

/// The persistence side of one store.
pub(crate) struct Persistence {
    inner: Arc<PersistInner>,
}

struct PersistInner {
    config: PersistConfig,
    core: Weak<StoreCore>,
    /// Keys of the initial state, in order. Only these are saved.
    keys: Vec<String>,
    timer: Mutex<Option<Debouncer>>,
    pending: AtomicBool,
    /// Held from snapshot to write, so saves land in snapshot order.
    saving: ReentrantMutex<()>,
}

impl Persistence {
    pub(crate) fn new(config: PersistConfig, core: Weak<StoreCore>, keys: Vec<String>) -> Self {
        Self {
            inner: Arc::new(PersistInner {
                config,
                core,
                keys,
                timer: Mutex::new(None),
                pending: AtomicBool::new(false),
                saving: ReentrantMutex::new(()),
            }),
        }
    }

    /// Save after every change of `signal`.
    pub(crate) fn attach(&self, signal: &VersionSignal) -> Subscription {
        let weak = Arc::downgrade(&self.inner);
        signal.subscribe(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                PersistInner::schedule(&inner);
            }
        }))
    }

    /// Save immediately, cancelling a pending debounced save.
    pub(crate) fn save_now(&self) {
        self.inner.pending.store(false, Ordering::Release);
        self.inner.save();
    }

    pub(crate) fn clear(&self) {
        let config = &self.inner.config;
        let Some(backend) = config.backend() else {
            return;
        };
        if let Err(err) = backend.remove_item(&config.key) {
            config.report(config.storage_error(err));
        }
    }

    pub(crate) fn key(&self) -> &str {
        &self.inner.config.key
    }
}

impl Drop for Persistence {
    fn drop(&mut self) {
        if self.inner.pending.swap(false, Ordering::AcqRel) {
            cov_mark::hit!(pending_save_flushed_on_drop);
            self.inner.save();
        }
    }
}

impl PersistInner {
    fn schedule(this: &Arc<Self>) {
        if this.config.debounce.is_zero() {
            this.save();
            return;
        }

        this.pending.store(true, Ordering::Release);
        let mut timer = this.timer.lock();
        if let Some(debouncer) = timer.as_ref() {
            if debouncer.notify() {
                return;
            }
        }

        let weak = Arc::downgrade(this);
        let spawned = Debouncer::spawn(
            format!("persist:{}", this.config.key),
            this.config.debounce,
            move || {
                let Some(inner) = weak.upgrade() else {
                    return false;
                };
                if inner.pending.swap(false, Ordering::AcqRel) {
                    inner.save();
                }
                true
            },
        );
        match spawned {
            Ok(debouncer) => {
                debouncer.notify();
                *timer = Some(debouncer);
            }
            Err(err) => {
                *timer = None;
                drop(timer);
                this.config.report(PersistError::Timer(err));
                this.pending.store(false, Ordering::Release);
                this.save();
            }
        }
    }

    fn save(&self) {
        let config = &self.config;
        let Some(backend) = config.backend() else {
            cov_mark::hit!(save_without_backend);
            return;
        };
        let Some(core) = self.core.upgrade() else {
            return;
        };
        let _saving = self.saving.lock();
        let snapshot = core.snapshot_keys(&self.keys);
        let blob = match (config.serialize)(&snapshot) {
            Ok(blob) => blob,
            Err(err) => {
                config.report(err);
                return;
            }
        };
        if let Err(err) = backend.set_item(&config.key, &blob) {
            config.report(config.storage_error(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Object, Store};
    use serde_json::json;

    fn object(json: serde_json::Value) -> Object {
        Object::try_from(json).unwrap()
    }

    fn errors() -> (Arc<Mutex<Vec<String>>>, impl Fn(&PersistError) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        (seen, move |err: &PersistError| seen_clone.lock().push(err.to_string()))
    }

    #[test]
    fn disabled_options_resolve_to_nothing() {
        assert!(PersistOptions::new().resolve().is_none());
        assert!(
            PersistOptions::with_storage(MemoryStorage::new())
                .enabled(false)
                .resolve()
                .is_none()
        );
    }

    #[test]
    fn auto_key_uses_store_counter() {
        let config = PersistOptions::with_storage(MemoryStorage::new())
            .resolve()
            .unwrap();
        let n: u64 = config.key.strip_prefix(AUTO_KEY_PREFIX).unwrap().parse().unwrap();
        assert!(n >= 1);

        let explicit = PersistOptions::with_storage(MemoryStorage::new())
            .key("mine")
            .resolve()
            .unwrap();
        assert_eq!(explicit.key, "mine");
    }

    #[test]
    fn json_deserialize_rejects_non_objects() {
        assert!(matches!(
            json_deserialize("[1, 2]"),
            Err(PersistError::InvalidSnapshot { found: "list" })
        ));
        assert!(matches!(
            json_deserialize("{not json"),
            Err(PersistError::Deserialize(_))
        ));
        let snapshot = json_deserialize(r#"{"b": 1, "a": "x"}"#).unwrap();
        assert_eq!(snapshot.keys().collect::<Vec<_>>(), vec!["b", "a"]);
    }

    #[test]
    fn saves_only_initial_keys() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set_item("app", r#"{"count": 5, "extra": true}"#).unwrap();

        let store = Store::builder(object(json!({ "count": 0, "name": "x" })))
            .persist(PersistOptions::new().enabled(true).storage(storage.clone()).key("app"))
            .build();

        assert_eq!(store.value("count"), Some(Value::Int(5)));
        assert_eq!(store.value("extra"), Some(Value::Bool(true)));

        store.set("count", 6).unwrap();
        assert_eq!(
            storage.get_item("app").unwrap().as_deref(),
            Some(r#"{"count":6,"name":"x"}"#)
        );
    }

    #[test]
    fn corrupt_blob_goes_to_on_error() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set_item("app", "{oops").unwrap();
        let (seen, on_error) = errors();

        let store = Store::builder(object(json!({ "count": 0 })))
            .persist(
                PersistOptions::new()
                    .enabled(true)
                    .storage(storage)
                    .key("app")
                    .on_error(on_error),
            )
            .build();

        assert_eq!(store.value("count"), Some(Value::Int(0)));
        assert_eq!(*seen.lock(), vec!["failed to deserialize persisted state".to_owned()]);
    }

    #[test]
    fn quota_failure_is_reported_not_raised() {
        let (seen, on_error) = errors();
        let store = Store::builder(object(json!({ "text": "" })))
            .persist(
                PersistOptions::with_storage(MemoryStorage::with_quota(16))
                    .key("q")
                    .on_error(on_error),
            )
            .build();

        store.set("text", "this will not fit in sixteen bytes").unwrap();
        assert_eq!(
            store.value("text"),
            Some(Value::from("this will not fit in sixteen bytes"))
        );
        assert_eq!(*seen.lock(), vec!["storage failure for key `q`".to_owned()]);
    }

    #[test]
    fn unavailable_backend_is_a_no_op() {
        struct Offline;
        impl StorageBackend for Offline {
            fn is_available(&self) -> bool {
                false
            }
            fn get_item(&self, _: &str) -> Result<Option<String>, StorageError> {
                Err(StorageError::Unavailable)
            }
            fn set_item(&self, _: &str, _: &str) -> Result<(), StorageError> {
                Err(StorageError::Unavailable)
            }
            fn remove_item(&self, _: &str) -> Result<(), StorageError> {
                Err(StorageError::Unavailable)
            }
        }

        let (seen, on_error) = errors();
        let store = Store::builder(object(json!({ "n": 0 })))
            .persist(PersistOptions::with_storage(Offline).on_error(on_error))
            .build();
        {
            cov_mark::check!(save_without_backend);
            store.set("n", 1).unwrap();
        }
        assert!(store.persist_now());
        assert!(store.clear_persist());
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn persist_now_and_clear() {
        let storage = Arc::new(MemoryStorage::new());
        let store = Store::builder(object(json!({ "n": 1 })))
            .persist(
                PersistOptions::new()
                    .enabled(true)
                    .storage(storage.clone())
                    .key("manual")
                    .debounce(Duration::from_secs(60)),
            )
            .build();

        assert_eq!(store.persistence_key().as_deref(), Some("manual"));
        assert!(storage.is_empty());
        assert!(store.persist_now());
        assert_eq!(storage.get_item("manual").unwrap().as_deref(), Some(r#"{"n":1}"#));

        assert!(store.clear_persist());
        assert!(storage.is_empty());
    }

    struct Failing;

    impl StorageBackend for Failing {
        fn get_item(&self, _: &str) -> Result<Option<String>, StorageError> {
            Err(StorageError::Backend("read failed".into()))
        }
        fn set_item(&self, _: &str, _: &str) -> Result<(), StorageError> {
            Err(StorageError::Backend("write failed".into()))
        }
        fn remove_item(&self, _: &str) -> Result<(), StorageError> {
            Err(StorageError::Backend("remove failed".into()))
        }
    }

    fn storage_failures() -> (Arc<Mutex<Vec<String>>>, impl Fn(&PersistError) + Send + Sync + 'static)
    {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let on_error = move |err: &PersistError| {
            if let PersistError::Storage {
                key,
                source: StorageError::Backend(message),
            } = err
            {
                seen_clone.lock().push(format!("{key}: {message}"));
            }
        };
        (seen, on_error)
    }

    #[test]
    fn failing_read_keeps_initial_state() {
        let (seen, on_error) = storage_failures();
        let store = Store::builder(object(json!({ "n": 3 })))
            .persist(PersistOptions::with_storage(Failing).key("down").on_error(on_error))
            .build();

        assert_eq!(store.value("n"), Some(Value::Int(3)));
        assert_eq!(*seen.lock(), vec!["down: read failed".to_owned()]);
    }

    #[test]
    fn failing_remove_is_reported_not_raised() {
        let (seen, on_error) = storage_failures();
        let store = Store::builder(object(json!({ "n": 3 })))
            .persist(PersistOptions::with_storage(Failing).key("down").on_error(on_error))
            .build();
        seen.lock().clear();

        assert!(store.clear_persist());
        assert_eq!(*seen.lock(), vec!["down: remove failed".to_owned()]);
    }

    #[test]
    fn manual_save_is_not_overtaken_by_a_slower_debounced_save() {
        #[derive(Default)]
        struct SlowFirstWrite {
            inner: MemoryStorage,
            entered: AtomicBool,
        }

        impl StorageBackend for SlowFirstWrite {
            fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
                self.inner.get_item(key)
            }
            fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
                if !self.entered.swap(true, Ordering::AcqRel) {
                    std::thread::sleep(Duration::from_millis(150));
                }
                self.inner.set_item(key, value)
            }
            fn remove_item(&self, key: &str) -> Result<(), StorageError> {
                self.inner.remove_item(key)
            }
        }

        let storage = Arc::new(SlowFirstWrite::default());
        let store = Store::builder(object(json!({ "n": 0 })))
            .persist(
                PersistOptions::with_storage(storage.clone())
                    .key("race")
                    .debounce(Duration::from_millis(10)),
            )
            .build();

        store.set("n", 1).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !storage.entered.load(Ordering::Acquire) {
            assert!(std::time::Instant::now() < deadline, "debounced save never started");
            std::thread::sleep(Duration::from_millis(1));
        }

        store.set("n", 2).unwrap();
        assert!(store.persist_now());
        std::thread::sleep(Duration::from_millis(100));

        assert_eq!(storage.inner.get_item("race").unwrap().as_deref(), Some(r#"{"n":2}"#));
    }

    #[test]
    fn pending_save_is_flushed_on_drop() {
        let storage = Arc::new(MemoryStorage::new());
        let store = Store::builder(object(json!({ "n": 0 })))
            .persist(
                PersistOptions::new()
                    .enabled(true)
                    .storage(storage.clone())
                    .key("flush")
                    .debounce(Duration::from_secs(60)),
            )
            .build();

        store.set("n", 7).unwrap();
        assert!(storage.is_empty());
        {
            cov_mark::check!(pending_save_flushed_on_drop);
            drop(store);
        }
        assert_eq!(storage.get_item("flush").unwrap().as_deref(), Some(r#"{"n":7}"#));
    }
}
