//! Refcounted conversion caches.
//!
//! A [`RefCountCache`] maps stream identities to converted artifacts. At most
//! one content hash is live per identity; a hash change swaps the artifact in
//! place without disturbing the refcount. Entries are evicted when the last
//! reference is released.

use crate::error::Result;
use crate::types::{ContentHash, StreamKey};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Shared handle to a cache, injected into sibling nodes via parameter slots.
pub type CacheHandle<A> = Arc<Mutex<RefCountCache<A>>>;

/// Create a fresh shared cache handle.
pub fn shared<A>() -> CacheHandle<A> {
    Arc::new(Mutex::new(RefCountCache::new()))
}

struct Entry<A> {
    hash: ContentHash,
    artifact: Arc<A>,
    refs: u32,
}

/// Outcome of acquiring an artifact.
pub enum Acquired<A> {
    /// First reference at this (key, hash): the artifact was just built.
    Built(Arc<A>),
    /// The artifact already existed; the refcount was bumped.
    Shared(Arc<A>),
}

impl<A> Acquired<A> {
    pub fn artifact(&self) -> &Arc<A> {
        match self {
            Acquired::Built(a) | Acquired::Shared(a) => a,
        }
    }
}

/// Outcome of releasing a reference.
pub enum Released<A> {
    /// Last reference dropped; the entry was evicted.
    Evicted(Arc<A>),
    /// Other references remain.
    StillHeld(u32),
    /// No entry for that key; releasing twice is a no-op.
    Absent,
}

/// Content-hash keyed artifact cache with reference counting.
pub struct RefCountCache<A> {
    entries: HashMap<StreamKey, Entry<A>>,
}

impl<A> Default for RefCountCache<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> RefCountCache<A> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Acquire a reference to the artifact for (key, hash), building it on
    /// first sight. If the key is live under a different hash the artifact is
    /// rebuilt and swapped while keeping the new reference counted.
    pub fn acquire_with(
        &mut self,
        key: &StreamKey,
        hash: &ContentHash,
        build: impl FnOnce() -> Result<A>,
    ) -> Result<Acquired<A>> {
        if let Some(entry) = self.entries.get_mut(key) {
            if entry.hash == *hash {
                entry.refs += 1;
                return Ok(Acquired::Shared(entry.artifact.clone()));
            }
            // Same identity, new content: swap in place, count the new ref.
            let artifact = Arc::new(build()?);
            entry.hash = hash.clone();
            entry.artifact = artifact.clone();
            entry.refs += 1;
            return Ok(Acquired::Built(artifact));
        }
        let artifact = Arc::new(build()?);
        self.entries.insert(
            key.clone(),
            Entry {
                hash: hash.clone(),
                artifact: artifact.clone(),
                refs: 1,
            },
        );
        Ok(Acquired::Built(artifact))
    }

    /// Replace the artifact for an existing key if the hash differs, keeping
    /// the refcount. Returns the new artifact, or `None` when the hash is
    /// unchanged or the key is not cached. A failed build leaves the old
    /// entry live.
    pub fn swap_with(
        &mut self,
        key: &StreamKey,
        hash: &ContentHash,
        build: impl FnOnce() -> Result<A>,
    ) -> Result<Option<Arc<A>>> {
        match self.entries.get_mut(key) {
            Some(entry) if entry.hash != *hash => {
                let artifact = Arc::new(build()?);
                entry.hash = hash.clone();
                entry.artifact = artifact.clone();
                Ok(Some(artifact))
            }
            _ => Ok(None),
        }
    }

    /// Rebuild the artifact in place, keeping the hash and refcount. Used
    /// when a dependency of the artifact changed while its own content did
    /// not. Returns the new artifact, or `None` when the key is not cached.
    /// A failed build leaves the old entry live.
    pub fn rebuild_with(
        &mut self,
        key: &StreamKey,
        build: impl FnOnce() -> Result<A>,
    ) -> Result<Option<Arc<A>>> {
        let Some(entry) = self.entries.get_mut(key) else {
            return Ok(None);
        };
        let artifact = Arc::new(build()?);
        entry.artifact = artifact.clone();
        Ok(Some(artifact))
    }

    /// Release one reference; the last release evicts.
    pub fn release(&mut self, key: &StreamKey) -> Released<A> {
        let Some(entry) = self.entries.get_mut(key) else {
            return Released::Absent;
        };
        if entry.refs > 1 {
            entry.refs -= 1;
            return Released::StillHeld(entry.refs);
        }
        match self.entries.remove(key) {
            Some(entry) => Released::Evicted(entry.artifact),
            None => Released::Absent,
        }
    }

    pub fn get(&self, key: &StreamKey) -> Option<Arc<A>> {
        self.entries.get(key).map(|e| e.artifact.clone())
    }

    /// Current refcount for a key (0 when absent).
    pub fn refs(&self, key: &StreamKey) -> u32 {
        self.entries.get(key).map_or(0, |e| e.refs)
    }

    pub fn hash_of(&self, key: &StreamKey) -> Option<&ContentHash> {
        self.entries.get(key).map(|e| &e.hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything regardless of refcounts (pipeline shutdown).
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ModelKind;
    use proptest::prelude::*;

    fn key(id: &str) -> StreamKey {
        StreamKey::new("src", ModelKind::Mesh, id)
    }

    fn h(s: &str) -> ContentHash {
        ContentHash::from(s)
    }

    #[test]
    fn test_acquire_builds_once_then_shares() {
        let mut cache = RefCountCache::new();
        let mut builds = 0;

        let first = cache
            .acquire_with(&key("m"), &h("h1"), || {
                builds += 1;
                Ok(42u32)
            })
            .unwrap();
        assert!(matches!(first, Acquired::Built(_)));

        let second = cache
            .acquire_with(&key("m"), &h("h1"), || {
                builds += 1;
                Ok(42u32)
            })
            .unwrap();
        assert!(matches!(second, Acquired::Shared(_)));
        assert_eq!(builds, 1);
        assert_eq!(cache.refs(&key("m")), 2);
        assert!(Arc::ptr_eq(first.artifact(), second.artifact()));
    }

    #[test]
    fn test_swap_replaces_only_on_new_hash() {
        let mut cache = RefCountCache::new();
        cache.acquire_with(&key("m"), &h("h1"), || Ok(1u32)).unwrap();
        cache.acquire_with(&key("m"), &h("h1"), || Ok(1u32)).unwrap();

        // Same hash: no-op.
        let same = cache.swap_with(&key("m"), &h("h1"), || Ok(9u32)).unwrap();
        assert!(same.is_none());

        // New hash: artifact replaced, refcount untouched.
        let new = cache.swap_with(&key("m"), &h("h2"), || Ok(2u32)).unwrap();
        assert_eq!(*new.unwrap(), 2);
        assert_eq!(cache.refs(&key("m")), 2);
        assert_eq!(cache.hash_of(&key("m")), Some(&h("h2")));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_failed_swap_keeps_old_entry() {
        let mut cache = RefCountCache::new();
        cache.acquire_with(&key("m"), &h("h1"), || Ok(1u32)).unwrap();

        let result = cache.swap_with(&key("m"), &h("h2"), || {
            Err(crate::error::Error::conversion(&key("m"), "boom"))
        });
        assert!(result.is_err());
        assert_eq!(*cache.get(&key("m")).unwrap(), 1);
        assert_eq!(cache.hash_of(&key("m")), Some(&h("h1")));
    }

    #[test]
    fn test_rebuild_keeps_hash_and_refs() {
        let mut cache = RefCountCache::new();
        cache.acquire_with(&key("m"), &h("h1"), || Ok(1u32)).unwrap();
        cache.acquire_with(&key("m"), &h("h1"), || Ok(1u32)).unwrap();

        let rebuilt = cache.rebuild_with(&key("m"), || Ok(7u32)).unwrap();
        assert_eq!(*rebuilt.unwrap(), 7);
        assert_eq!(cache.refs(&key("m")), 2);
        assert_eq!(cache.hash_of(&key("m")), Some(&h("h1")));

        // Unknown keys are left alone.
        let absent = cache.rebuild_with(&key("x"), || Ok(9u32)).unwrap();
        assert!(absent.is_none());
    }

    #[test]
    fn test_release_evicts_at_zero_and_tolerates_doubles() {
        let mut cache = RefCountCache::new();
        cache.acquire_with(&key("m"), &h("h1"), || Ok(1u32)).unwrap();
        cache.acquire_with(&key("m"), &h("h1"), || Ok(1u32)).unwrap();

        assert!(matches!(cache.release(&key("m")), Released::StillHeld(1)));
        assert!(matches!(cache.release(&key("m")), Released::Evicted(_)));
        assert!(matches!(cache.release(&key("m")), Released::Absent));
        assert!(cache.is_empty());
    }

    proptest! {
        /// Refcount always equals acquires minus releases, floored at zero,
        /// and an entry exists exactly while the count is positive.
        #[test]
        fn prop_refcount_tracks_acquire_release(ops in proptest::collection::vec(any::<bool>(), 1..64)) {
            let mut cache = RefCountCache::new();
            let k = key("m");
            let mut live = 0u32;

            for acquire in ops {
                if acquire {
                    cache.acquire_with(&k, &h("h"), || Ok(0u8)).unwrap();
                    live += 1;
                } else {
                    match cache.release(&k) {
                        Released::Evicted(_) => { prop_assert_eq!(live, 1); live = 0; }
                        Released::StillHeld(n) => { live -= 1; prop_assert_eq!(n, live); }
                        Released::Absent => prop_assert_eq!(live, 0),
                    }
                }
                prop_assert_eq!(cache.refs(&k), live);
                prop_assert_eq!(cache.get(&k).is_some(), live > 0);
            }
        }
    }
}
