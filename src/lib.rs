#![deny(missing_docs)]

//! Deep reactive state stores.
//!
//! A [`Store`] wraps a plain mapping of fields. Assigning a field, or a field
//! of any nested object read through the store, bumps the store's version and
//! notifies its subscribers. Changes are detected through that version alone;
//! there is no structural diffing.
//!
//! # Quick Start
//!
//! ```ignore
//! use reaktiv_store::{Method, Object, Store, Value, batch};
//! use serde_json::json;
//!
//! let store = Store::builder(Object::try_from(json!({
//!     "count": 0,
//!     "user": { "name": "John" },
//! }))?)
//! .method("increment", |_| {
//!     Method::action(|store, _| {
//!         let count = store.value("count").and_then(|v| v.as_i64()).unwrap_or(0);
//!         let _ = store.set("count", count + 1);
//!         Value::Null
//!     })
//! })
//! .build();
//!
//! let _sub = store.subscribe(Arc::new(|| println!("changed")));
//!
//! store.call("increment", &[])?;                  // one notification
//! store.object("user").unwrap().set("name", "Jane")?; // nested, one more
//!
//! batch(|| {
//!     store.set("count", 10)?;
//!     store.set("count", 11)
//! })?; // one notification for both
//! ```
//!
//! # Core Types
//!
//! - [`Store`] - The state container. Built with [`Store::builder`] or [`create_store`].
//! - [`ReactiveObject`] - Nested object read through a store; writes notify the store.
//! - [`Value`] - A field value. [`Object`] and [`List`] are shared handles.
//! - [`VersionSignal`] - Version cell plus listeners, the one notification primitive.
//! - [`batch`] - Defer notifications until the outermost batch exits.
//!
//! # Reactivity rules
//!
//! - Assigning the value a field already holds does nothing.
//! - Nested objects are wrapped once; two reads return the same wrapper until
//!   the object is replaced.
//! - Lists are not reactive. Mutate in place, then call [`Store::update`], or
//!   assign a new list.
//! - An object can belong to one store only. Handing an object of one store
//!   to another copies it.
//!
//! # Persistence
//!
//! ```ignore
//! let store = Store::builder(initial)
//!     .persist(
//!         PersistOptions::with_storage(FileStorage::new("state"))
//!             .key("settings")
//!             .debounce(Duration::from_millis(300)),
//!     )
//!     .build();
//! // restored from "settings" if present; saved 300ms after the last change
//! ```
//!
//! # Rendering
//!
//! ```ignore
//! let mut hook = store.hook();
//! let store = hook.use_store(|| request_redraw()); // subscribes on first call
//! ```

// Internal modules
mod batch;
mod cache;
mod counter;
mod error;
mod hash;
mod hook;
mod persist;
mod reactive;
mod signal;
mod store;
mod value;

// Core types
pub use reactive::{Field, ReactiveObject};
pub use signal::{Listener, Subscription, VersionSignal};
pub use store::{Action, Method, MethodCreator, Store, StoreBuilder, create_store};
pub use value::{List, Object, ObjectId, Value};

// Batching
pub use batch::{Updater, batch, batch_depth, is_batching, schedule_update};

// Version ids
pub use counter::{Counter, global_uid};

// Persistence
pub use persist::{
    DEFAULT_DEBOUNCE, DeserializeFn, ErrorHandler, FileStorage, MemoryStorage, PersistOptions,
    SerializeFn, Snapshot, StorageBackend, json_deserialize, json_serialize,
};

// Render binding
pub use hook::{ExternalStore, StoreHook};

pub use error::{BoxError, PersistError, StorageError, StoreError};
