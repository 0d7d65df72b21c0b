//! Buffer for stowed blobs not yet migrated into the backend.
//!
//! `stow` makes a blob globally readable immediately by parking it
//! here; the writer migrates buffered blobs into the stowage table on
//! its next cycle and prunes them afterwards. Entries are keyed by the
//! full hash so `load` can serve them without touching the backend.

use std::collections::HashMap;
use std::sync::RwLock;

use cask_hash::Hash;

/// Thread-safe map of stowed-but-unpersisted blobs.
///
/// Lookups from `load` far outnumber inserts and prunes, so the map
/// sits behind a `RwLock`.
#[derive(Default)]
pub struct StowBuffer {
    inner: RwLock<HashMap<Hash, Vec<u8>>>,
}

impl StowBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a blob under its hash. Re-stowing identical content is a
    /// no-op (the bytes are the same by construction).
    pub fn insert(&self, hash: Hash, blob: Vec<u8>) {
        self.inner
            .write()
            .expect("stow buffer lock poisoned")
            .insert(hash, blob);
    }

    /// Copy out the blob for `hash`, if buffered.
    pub fn get(&self, hash: &Hash) -> Option<Vec<u8>> {
        self.inner
            .read()
            .expect("stow buffer lock poisoned")
            .get(hash)
            .cloned()
    }

    /// Copy out every buffered entry. The writer samples this once per
    /// cycle, before it samples the ephemeron table.
    pub fn snapshot(&self) -> Vec<(Hash, Vec<u8>)> {
        self.inner
            .read()
            .expect("stow buffer lock poisoned")
            .iter()
            .map(|(h, blob)| (*h, blob.clone()))
            .collect()
    }

    /// Remove the given entries unconditionally. Used for entries that
    /// now exist in the stowage table, where `load` will find them.
    pub fn remove(&self, hashes: &[Hash]) {
        if hashes.is_empty() {
            return;
        }
        let mut inner = self.inner.write().expect("stow buffer lock poisoned");
        for h in hashes {
            inner.remove(h);
        }
    }

    /// Remove the given entries unless `held` says a live transaction
    /// still protects them. The check runs under the buffer's write
    /// lock so a concurrent re-stow (which registers its ephemeron
    /// first, then inserts here) cannot lose its entry.
    pub fn remove_unless(&self, hashes: &[Hash], held: impl Fn(&Hash) -> bool) {
        if hashes.is_empty() {
            return;
        }
        let mut inner = self.inner.write().expect("stow buffer lock poisoned");
        for h in hashes {
            if !held(h) {
                inner.remove(h);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("stow buffer lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
