use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::batch::{Updater, batch};
use crate::counter::{Counter, STORE_IDS, global_uid};
use crate::error::StoreError;
use crate::hash::FastIndexMap;
use crate::hook::StoreHook;
use crate::persist::{PersistOptions, Persistence, Snapshot};
use crate::reactive::{Field, ReactiveObject, adopt, evict_replaced, make_reactive, mark_updated};
use crate::signal::{Listener, Subscription, VersionSignal, panic_message};
use crate::value::{Object, StoreId, Value};

struct InternalState {
    fields: FastIndexMap<String, Value>,
    /// Id of the last version bump. Never read by application code.
    identity: u64,
}

/// The part of a store that reactive wrappers and persistence hold on to.
pub(crate) struct StoreCore {
    id: StoreId,
    state: RwLock<InternalState>,
    signal: VersionSignal,
    versions: Arc<Counter>,
    updater: Updater,
}

impl StoreCore {
    fn new(id: StoreId, fields: FastIndexMap<String, Value>, versions: Arc<Counter>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<StoreCore>| {
            let weak = weak.clone();
            let updater: Updater = Arc::new(move || {
                if let Some(core) = weak.upgrade() {
                    core.bump();
                }
            });
            StoreCore {
                id,
                state: RwLock::new(InternalState {
                    fields,
                    identity: 0,
                }),
                signal: VersionSignal::new(0),
                versions,
                updater,
            }
        })
    }

    pub(crate) fn id(&self) -> StoreId {
        self.id
    }

    /// The store's one update closure. Its identity is what lets a batch
    /// collapse every write to this store into a single bump.
    pub(crate) fn updater(&self) -> &Updater {
        &self.updater
    }

    pub(crate) fn signal(&self) -> &VersionSignal {
        &self.signal
    }

    fn bump(&self) {
        let version = self.versions.next();
        self.state.write().identity = version;
        tracing::trace!(store = self.id, version, "store version bumped");
        self.signal.set(version);
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.state.read().fields.get(key).cloned()
    }

    fn contains_key(&self, key: &str) -> bool {
        self.state.read().fields.contains_key(key)
    }

    /// Current values of `keys`, in that order. Missing keys are skipped.
    pub(crate) fn snapshot_keys(&self, keys: &[String]) -> Snapshot {
        let state = self.state.read();
        keys.iter()
            .filter_map(|key| {
                state
                    .fields
                    .get(key)
                    .map(|value| (key.clone(), value.clone()))
            })
            .collect()
    }
}

/// A store action. It receives the store at call time, so it never needs to
/// capture it.
pub type Action = Arc<dyn Fn(&Store, &[Value]) -> Value + Send + Sync>;

/// What a method creator produced.
#[derive(Clone)]
pub enum Method {
    /// A callable action.
    Action(Action),
    /// A value computed once at construction.
    Value(Value),
}

impl Method {
    /// Wrap a closure as an action.
    pub fn action<F>(f: F) -> Self
    where
        F: Fn(&Store, &[Value]) -> Value + Send + Sync + 'static,
    {
        Method::Action(Arc::new(f))
    }

    /// A derived value.
    pub fn value(value: impl Into<Value>) -> Self {
        Method::Value(value.into())
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Action(_) => f.write_str("Action(..)"),
            Method::Value(value) => f.debug_tuple("Value").field(value).finish(),
        }
    }
}

/// Builds one method from the assembled store. Runs once, at construction.
pub type MethodCreator = Box<dyn FnOnce(&Store) -> Method>;

enum MethodSlot {
    Pending,
    Ready(Method),
}

struct StoreInner {
    // Fields drop in order: persistence must go while `core` is still alive
    // so a pending save can be flushed.
    persist_subscription: Option<Subscription>,
    persistence: Option<Persistence>,
    methods: RwLock<FastIndexMap<String, MethodSlot>>,
    core: Arc<StoreCore>,
}

/// A reactive state container.
///
/// Every field of the initial state is readable and assignable through the
/// store; nested objects come back as [`ReactiveObject`]s whose writes notify
/// the same subscribers. Cloning a `Store` clones the handle.
///
/// ```ignore
/// let store = Store::builder(Object::try_from(json!({ "count": 0 }))?)
///     .method("increment", |_| {
///         Method::action(|store, _| {
///             let next = store.value("count").and_then(|v| v.as_i64()).unwrap_or(0) + 1;
///             let _ = store.set("count", next);
///             Value::Null
///         })
///     })
///     .build();
/// store.call("increment", &[])?;
/// ```
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Start building a store over `initial`.
    pub fn builder(initial: Object) -> StoreBuilder {
        StoreBuilder::new(initial)
    }

    /// Read a field, wrapping nested objects.
    pub fn get(&self, key: &str) -> Option<Field> {
        self.inner
            .core
            .get(key)
            .map(|value| make_reactive(value, &self.inner.core))
    }

    /// Read a field as a raw value.
    pub fn value(&self, key: &str) -> Option<Value> {
        self.inner.core.get(key)
    }

    /// Read an object-valued field as a reactive object.
    pub fn object(&self, key: &str) -> Option<ReactiveObject> {
        self.get(key).and_then(Field::into_object)
    }

    /// Assign a top-level field.
    ///
    /// Unknown keys are rejected without notifying. Assigning the current
    /// value is a no-op.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<(), StoreError> {
        let core = &self.inner.core;
        let value = adopt(value.into(), core.id());
        let replaced = {
            let mut state = core.state.write();
            let Some(slot) = state.fields.get_mut(key) else {
                return Err(StoreError::UnknownField(key.to_owned()));
            };
            if slot.is_same(&value) {
                None
            } else {
                Some(std::mem::replace(slot, value))
            }
        };
        let Some(old) = replaced else {
            cov_mark::hit!(store_set_same_value);
            return Ok(());
        };

        evict_replaced(&old);
        mark_updated(core);
        Ok(())
    }

    /// Field names in order.
    pub fn keys(&self) -> Vec<String> {
        self.inner.core.state.read().fields.keys().cloned().collect()
    }

    /// Whether the store has this field.
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.core.contains_key(key)
    }

    /// Current raw values of every field.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.inner.core.state.read();
        state
            .fields
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Notify subscribers unconditionally.
    ///
    /// For state changed in place without going through a setter, such as a
    /// [`List`](crate::List) that was pushed to.
    pub fn update(&self) {
        mark_updated(&self.inner.core);
    }

    /// Assign several fields with a single notification.
    ///
    /// Keys that are not fields of the store are logged and skipped; the
    /// remaining keys are still applied.
    pub fn merge<I, K, V>(&self, partial: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        batch(|| {
            for (key, value) in partial {
                let key = key.into();
                if let Err(StoreError::UnknownField(key)) = self.set(&key, value) {
                    cov_mark::hit!(merge_skips_unknown_field);
                    tracing::warn!(
                        store = self.inner.core.id(),
                        key = %key,
                        "merge skipped unknown field"
                    );
                }
            }
        });
    }

    /// The current version, which is also the render snapshot.
    pub fn version(&self) -> u64 {
        self.inner.core.signal().get()
    }

    /// Call `listener` after every version change.
    pub fn subscribe(&self, listener: Listener) -> Subscription {
        self.inner.core.signal().subscribe(listener)
    }

    /// Invoke the action registered as `name`.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, StoreError> {
        match self.method(name)? {
            Method::Action(action) => Ok(action(self, args)),
            Method::Value(_) => Err(StoreError::NotAnAction(name.to_owned())),
        }
    }

    /// The method registered as `name`.
    ///
    /// While creators are still running, a method whose creator has not run
    /// yet is [`StoreError::MethodNotReady`].
    pub fn method(&self, name: &str) -> Result<Method, StoreError> {
        match self.inner.methods.read().get(name) {
            Some(MethodSlot::Ready(method)) => Ok(method.clone()),
            Some(MethodSlot::Pending) => Err(StoreError::MethodNotReady(name.to_owned())),
            None => Err(StoreError::UnknownMethod(name.to_owned())),
        }
    }

    /// Registered method names, in registration order.
    pub fn method_names(&self) -> Vec<String> {
        self.inner.methods.read().keys().cloned().collect()
    }

    /// Save now, bypassing the debounce window. Returns false when
    /// persistence is disabled.
    pub fn persist_now(&self) -> bool {
        match &self.inner.persistence {
            Some(persistence) => {
                persistence.save_now();
                true
            }
            None => false,
        }
    }

    /// Remove the persisted state. Returns false when persistence is
    /// disabled.
    pub fn clear_persist(&self) -> bool {
        match &self.inner.persistence {
            Some(persistence) => {
                persistence.clear();
                true
            }
            None => false,
        }
    }

    /// The storage key, when persistence is enabled.
    pub fn persistence_key(&self) -> Option<String> {
        self.inner
            .persistence
            .as_ref()
            .map(|persistence| persistence.key().to_owned())
    }

    /// Whether the store saves to a storage backend.
    pub fn is_persistent(&self) -> bool {
        self.inner.persistence.is_some()
    }

    /// A render binding for one consumer of this store.
    pub fn hook(&self) -> StoreHook {
        StoreHook::new(self.clone())
    }

    /// Whether both handles are the same store.
    pub fn ptr_eq(&self, other: &Store) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    #[cfg(test)]
    pub(crate) fn state_identity(&self) -> u64 {
        self.inner.core.state.read().identity
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("id", &self.inner.core.id())
            .field("keys", &self.keys())
            .field("version", &self.version())
            .field("methods", &self.method_names())
            .finish()
    }
}

/// Builder for a [`Store`].
pub struct StoreBuilder {
    initial: Object,
    methods: Vec<(String, MethodCreator)>,
    persist: Option<PersistOptions>,
    versions: Arc<Counter>,
}

impl StoreBuilder {
    fn new(initial: Object) -> Self {
        Self {
            initial,
            methods: Vec::new(),
            persist: None,
            versions: global_uid(),
        }
    }

    /// Register a method. Creators run in registration order once the store
    /// is assembled.
    pub fn method<F>(mut self, name: impl Into<String>, creator: F) -> Self
    where
        F: FnOnce(&Store) -> Method + 'static,
    {
        self.methods.push((name.into(), Box::new(creator)));
        self
    }

    /// Configure persistence.
    pub fn persist(mut self, options: PersistOptions) -> Self {
        self.persist = Some(options);
        self
    }

    /// Draw version ids from `counter` instead of the process-wide one.
    pub fn version_counter(mut self, counter: Arc<Counter>) -> Self {
        self.versions = counter;
        self
    }

    /// Assemble the store.
    ///
    /// Never fails: restore errors go to the persistence error handler and
    /// invalid methods are logged and skipped.
    pub fn build(self) -> Store {
        let config = self.persist.and_then(PersistOptions::resolve);
        let id = STORE_IDS.next();
        let initial_keys = self.initial.keys();

        let mut slots = FastIndexMap::default();
        let mut creators = Vec::with_capacity(self.methods.len());
        for (name, creator) in self.methods {
            if name.is_empty() {
                tracing::warn!(store = id, "method with an empty name skipped");
                continue;
            }
            if initial_keys.contains(&name) {
                tracing::warn!(store = id, method = %name, "method name collides with a state field, skipped");
                continue;
            }
            if slots.contains_key(&name) {
                tracing::warn!(store = id, method = %name, "duplicate method name, keeping the first");
                continue;
            }
            slots.insert(name.clone(), MethodSlot::Pending);
            creators.push((name, creator));
        }

        let mut fields: FastIndexMap<String, Value> = self.initial.entries().into_iter().collect();
        if let Some(snapshot) = config.as_ref().and_then(|config| config.restore()) {
            for (key, value) in snapshot {
                if slots.contains_key(&key) {
                    cov_mark::hit!(restored_key_shadows_method);
                    tracing::warn!(store = id, key = %key, "restored field named like a method, dropped");
                    continue;
                }
                fields.insert(key, value);
            }
        }

        for value in fields.values_mut() {
            *value = adopt(std::mem::take(value), id);
        }
        let core = StoreCore::new(id, fields, self.versions);

        let persistence =
            config.map(|config| Persistence::new(config, Arc::downgrade(&core), initial_keys));
        let persist_subscription = persistence
            .as_ref()
            .map(|persistence| persistence.attach(core.signal()));

        let store = Store {
            inner: Arc::new(StoreInner {
                persist_subscription,
                persistence,
                methods: RwLock::new(slots),
                core,
            }),
        };

        for (name, creator) in creators {
            let store_ref = &store;
            match catch_unwind(AssertUnwindSafe(move || creator(store_ref))) {
                Ok(method) => {
                    store
                        .inner
                        .methods
                        .write()
                        .insert(name, MethodSlot::Ready(method));
                }
                Err(payload) => {
                    cov_mark::hit!(method_creator_panicked);
                    tracing::warn!(
                        store = id,
                        method = %name,
                        panic = panic_message(payload.as_ref()),
                        "method creator panicked, skipped"
                    );
                    store.inner.methods.write().shift_remove(&name);
                }
            }
        }

        tracing::debug!(
            store = id,
            fields = store.inner.core.state.read().fields.len(),
            methods = store.inner.methods.read().len(),
            persistent = store.is_persistent(),
            "store created"
        );
        store
    }
}

/// Create a store from an initial state, named method creators, and
/// optional persistence.
pub fn create_store<I>(initial: Object, methods: I, persist: Option<PersistOptions>) -> Store
where
    I: IntoIterator<Item = (String, MethodCreator)>,
{
    let mut builder = Store::builder(initial);
    builder.methods.extend(methods);
    builder.persist = persist;
    builder.build()
}
