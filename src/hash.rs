//! Fixed-seed hashing for the crate's internal tables.
//!
//! Keys here are ids and pointer addresses produced by this crate, never
//! attacker-controlled input, so a deterministic `foldhash` seed is enough.

use std::hash::BuildHasher;

use foldhash::fast::{FixedState, FoldHasher};
use indexmap::IndexMap;

const SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// Zero-sized `BuildHasher` backed by foldhash with a constant seed.
#[derive(Clone, Copy, Debug, Default)]
pub struct FastHashBuilder;

impl BuildHasher for FastHashBuilder {
    type Hasher = FoldHasher<'static>;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(SEED).build_hasher()
    }
}

/// Insertion-ordered map using [`FastHashBuilder`].
pub type FastIndexMap<K, V> = IndexMap<K, V, FastHashBuilder>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_takes_no_space() {
        assert_eq!(std::mem::size_of::<FastHashBuilder>(), 0);
    }

    #[test]
    fn index_map_keeps_insertion_order() {
        let mut map = FastIndexMap::default();
        map.insert("b", 2);
        map.insert("a", 1);
        map.insert("c", 3);
        let keys: Vec<_> = map.keys().copied().collect();
        assert_eq!(keys, ["b", "a", "c"]);
        assert_eq!(FastHashBuilder.hash_one("a"), FastHashBuilder.hash_one("a"));
    }
}
