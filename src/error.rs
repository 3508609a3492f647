//! Error types.
//!
//! Mutation paths only fail on caller mistakes (an unknown field, a missing
//! method). Persistence failures never surface at a call site: they are
//! handed to the store's error handler as [`PersistError`].

/// Boxed error produced by a pluggable serializer or deserializer.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors returned by store accessors and method calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The key was not part of the object's shape when it was created.
    #[error("`{0}` is not a field of this object")]
    UnknownField(String),
    /// No method was registered under this name.
    #[error("no method named `{0}`")]
    UnknownMethod(String),
    /// The method exists but its creator has not run yet.
    #[error("method `{0}` has not been created yet")]
    MethodNotReady(String),
    /// The name refers to a derived value, which cannot be called.
    #[error("method `{0}` is a derived value, not an action")]
    NotAnAction(String),
    /// A store or snapshot had to be built from an object.
    #[error("expected an object, found {found}")]
    NotAnObject {
        /// Kind of the value that was supplied instead.
        found: &'static str,
    },
}

/// Errors reported by a [`StorageBackend`](crate::StorageBackend).
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backend cannot be used in this environment.
    #[error("storage backend is unavailable")]
    Unavailable,
    /// Writing would exceed the backend's capacity.
    #[error("storage quota of {quota} bytes exceeded ({requested} bytes requested)")]
    QuotaExceeded {
        /// Capacity in bytes.
        quota: usize,
        /// Total bytes the write would have needed.
        requested: usize,
    },
    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Any other backend-specific failure.
    #[error("{0}")]
    Backend(String),
}

/// Failures of the persistence layer, delivered to the `on_error` handler.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// The backend rejected a read, write or removal.
    #[error("storage failure for key `{key}`")]
    Storage {
        /// Storage key the operation targeted.
        key: String,
        /// Underlying backend error.
        #[source]
        source: StorageError,
    },
    /// The state could not be serialized.
    #[error("failed to serialize state")]
    Serialize(#[source] BoxError),
    /// The stored blob could not be parsed.
    #[error("failed to deserialize persisted state")]
    Deserialize(#[source] BoxError),
    /// The stored blob parsed, but is not a mapping of keys to values.
    #[error("persisted state must be an object, found {found}")]
    InvalidSnapshot {
        /// Kind of the top-level value that was found.
        found: &'static str,
    },
    /// The debounce worker thread could not be started.
    #[error("failed to start the persistence timer")]
    Timer(#[source] std::io::Error),
}
