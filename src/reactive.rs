//! Deep reactivity over nested objects.
//!
//! Reading an object-valued field through a store yields a
//! [`ReactiveObject`]: a wrapper whose `set` writes the node's field and
//! schedules a version bump on the owning store. Wrappers are cached per
//! node, so reading the same field twice returns the same wrapper.
//!
//! Only objects are wrapped. Dates, patterns and lists pass through as plain
//! [`Value`]s; a list must be reassigned to notify.

use std::sync::Arc;

use crate::batch::schedule_update;
use crate::cache;
use crate::error::StoreError;
use crate::store::StoreCore;
use crate::value::{List, Object, ObjectId, StoreId, Value};

/// A field read through a store: a plain value, or a reactive view of a
/// nested object.
#[derive(Clone, Debug, PartialEq)]
pub enum Field {
    /// Primitive, date, pattern, list or null.
    Value(Value),
    /// Nested object.
    Object(ReactiveObject),
}

impl Field {
    /// The plain value, unless this is an object.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Field::Value(value) => Some(value),
            Field::Object(_) => None,
        }
    }

    /// The reactive object, if this is one.
    pub fn as_object(&self) -> Option<&ReactiveObject> {
        match self {
            Field::Object(object) => Some(object),
            Field::Value(_) => None,
        }
    }

    /// Take the reactive object, if this is one.
    pub fn into_object(self) -> Option<ReactiveObject> {
        match self {
            Field::Object(object) => Some(object),
            Field::Value(_) => None,
        }
    }

    /// Unwrap into a raw value; objects become their raw node.
    pub fn into_value(self) -> Value {
        match self {
            Field::Value(value) => value,
            Field::Object(object) => Value::Object(object.raw().clone()),
        }
    }

    /// See [`Value::as_i64`].
    pub fn as_i64(&self) -> Option<i64> {
        self.as_value().and_then(Value::as_i64)
    }

    /// See [`Value::as_f64`].
    pub fn as_f64(&self) -> Option<f64> {
        self.as_value().and_then(Value::as_f64)
    }

    /// See [`Value::as_str`].
    pub fn as_str(&self) -> Option<&str> {
        self.as_value().and_then(Value::as_str)
    }

    /// See [`Value::as_bool`].
    pub fn as_bool(&self) -> Option<bool> {
        self.as_value().and_then(Value::as_bool)
    }

    /// See [`Value::as_list`].
    pub fn as_list(&self) -> Option<&List> {
        self.as_value().and_then(Value::as_list)
    }
}

pub(crate) struct WrapperInner {
    raw: Object,
    core: Arc<StoreCore>,
}

impl Drop for WrapperInner {
    fn drop(&mut self) {
        cache::release(self.raw.id(), self);
    }
}

/// Reactive view of a nested object owned by a store.
///
/// Two reads of the same field without an intervening replacement return
/// wrappers that are [`ptr_eq`](ReactiveObject::ptr_eq).
#[derive(Clone)]
pub struct ReactiveObject {
    inner: Arc<WrapperInner>,
}

impl ReactiveObject {
    fn wrap(raw: Object, core: &Arc<StoreCore>) -> Self {
        if let Some(inner) = cache::lookup(raw.id()) {
            cov_mark::hit!(wrapper_cache_hit);
            debug_assert!(Arc::ptr_eq(&inner.core, core));
            return Self { inner };
        }
        let inner = Arc::new(WrapperInner {
            raw,
            core: Arc::clone(core),
        });
        cache::insert(inner.raw.id(), &inner);
        Self { inner }
    }

    /// The wrapped node.
    pub fn raw(&self) -> &Object {
        &self.inner.raw
    }

    /// Identity of the wrapped node.
    pub fn id(&self) -> ObjectId {
        self.inner.raw.id()
    }

    /// Whether both handles are the same wrapper.
    pub fn ptr_eq(&self, other: &ReactiveObject) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Field names in insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.inner.raw.keys()
    }

    /// Whether the object has this field.
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.raw.contains_key(key)
    }

    /// Read a field, wrapping nested objects.
    pub fn get(&self, key: &str) -> Option<Field> {
        self.inner
            .raw
            .get(key)
            .map(|value| make_reactive(value, &self.inner.core))
    }

    /// Read a field as a raw value.
    pub fn value(&self, key: &str) -> Option<Value> {
        self.inner.raw.get(key)
    }

    /// Read an object-valued field as a reactive object.
    pub fn object(&self, key: &str) -> Option<ReactiveObject> {
        self.get(key).and_then(Field::into_object)
    }

    /// Assign a field and notify the store.
    ///
    /// Assigning the value the field already holds does nothing. Replacing
    /// an object evicts its cached wrapper, so the next read wraps the new
    /// object instead of handing out the stale view.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<(), StoreError> {
        let core = &self.inner.core;
        if !self.inner.raw.contains_key(key) {
            return Err(StoreError::UnknownField(key.to_owned()));
        }
        let value = adopt(value.into(), core.id());

        let replaced = self.inner.raw.with_fields_mut(|fields| {
            let slot = fields.get_mut(key)?;
            if slot.is_same(&value) {
                return None;
            }
            Some(std::mem::replace(slot, value))
        });
        let Some(old) = replaced else {
            cov_mark::hit!(reactive_set_same_value);
            return Ok(());
        };

        evict_replaced(&old);
        mark_updated(core);
        Ok(())
    }
}

impl PartialEq for ReactiveObject {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl std::fmt::Debug for ReactiveObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactiveObject")
            .field("raw", &self.inner.raw)
            .field("store", &self.inner.core.id())
            .finish()
    }
}

/// Wrap `value` for reading through the store owning `core`.
pub(crate) fn make_reactive(value: Value, core: &Arc<StoreCore>) -> Field {
    match value {
        Value::Object(raw) => Field::Object(ReactiveObject::wrap(raw, core)),
        other => Field::Value(other),
    }
}

/// Schedule a version bump for the store. Repeated calls inside one batch
/// collapse into one bump.
pub(crate) fn mark_updated(core: &StoreCore) {
    schedule_update(core.updater());
}

/// Drop the cached wrapper of an object that was just replaced.
pub(crate) fn evict_replaced(old: &Value) {
    if let Value::Object(object) = old {
        if cache::evict(object.id()) {
            cov_mark::hit!(replaced_wrapper_evicted);
        }
    }
}

/// Take ownership of every object reachable from `value` for `store`.
///
/// An object already owned by another store is deep-copied first, so two
/// stores never share a node or a cached wrapper.
pub(crate) fn adopt(value: Value, store: StoreId) -> Value {
    match value {
        Value::Object(object) => Value::Object(adopt_object(object, store)),
        other => other,
    }
}

fn adopt_object(object: Object, store: StoreId) -> Object {
    match object.owner() {
        Some(owner) if owner == store => object,
        Some(owner) => {
            cov_mark::hit!(foreign_object_copied);
            tracing::debug!(
                object = object.id().get(),
                owner,
                store,
                "object belongs to another store, adopting a copy"
            );
            let copy = object.deep_copy();
            claim_tree(&copy, store);
            copy
        }
        None => {
            claim_tree(&object, store);
            object
        }
    }
}

fn claim_tree(object: &Object, store: StoreId) {
    if !object.claim(store) {
        return;
    }
    for (key, value) in object.entries() {
        let Value::Object(child) = value else {
            continue;
        };
        let adopted = adopt_object(child.clone(), store);
        if !adopted.ptr_eq(&child) {
            object.with_fields_mut(|fields| {
                fields.insert(key, Value::Object(adopted));
            });
        }
    }
}
