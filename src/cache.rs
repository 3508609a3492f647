//! Identity-keyed cache of reactive wrappers.
//!
//! Maps an [`ObjectId`] to the one wrapper built for that node. Entries are
//! weak, so a wrapper nobody holds is freed and its entry removed by the
//! wrapper's own `Drop`. Because every object is owned by exactly one store
//! (see `reactive::adopt`), an id never maps to a wrapper of another store.

use std::sync::{Arc, LazyLock, Weak};

use papaya::HashMap as PapayaHashMap;

use crate::reactive::WrapperInner;
use crate::value::ObjectId;

/// Global wrapper cache. papaya's lock-free map keeps lookups on the read
/// path cheap; the default hasher is fine for integer keys.
static WRAPPERS: LazyLock<PapayaHashMap<ObjectId, Weak<WrapperInner>>> =
    LazyLock::new(PapayaHashMap::new);

/// The live wrapper for `id`, if any.
pub(crate) fn lookup(id: ObjectId) -> Option<Arc<WrapperInner>> {
    WRAPPERS.pin().get(&id).and_then(Weak::upgrade)
}

/// Record `wrapper` as the wrapper for `id`, replacing a dead entry.
pub(crate) fn insert(id: ObjectId, wrapper: &Arc<WrapperInner>) {
    WRAPPERS.pin().insert(id, Arc::downgrade(wrapper));
}

/// Forget the wrapper for `id`. Returns whether an entry existed.
pub(crate) fn evict(id: ObjectId) -> bool {
    WRAPPERS.pin().remove(&id).is_some()
}

/// Remove the entry for `id` if it still points at `wrapper`.
///
/// Called while `wrapper` is being dropped; a newer wrapper registered for
/// the same id after an eviction is left alone.
pub(crate) fn release(id: ObjectId, wrapper: *const WrapperInner) {
    let guard = WRAPPERS.pin();
    if guard
        .get(&id)
        .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), wrapper))
    {
        guard.remove(&id);
    }
}

/// Whether an entry exists for `id`.
#[cfg(test)]
pub(crate) fn contains(id: ObjectId) -> bool {
    WRAPPERS.pin().get(&id).is_some()
}
