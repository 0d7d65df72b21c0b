//! The ephemeron table: volatile references that keep resources alive.
//!
//! Live transactions hold short hashes here — for resources they
//! stowed, and for every hash mentioned by values they read — without
//! anchoring them into the persistent refcounts. The writer refuses to
//! collect any zero-refcount resource that appears in this table, so a
//! resource is safe between `stow` and the commit that anchors it.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use cask_hash::ShortHash;

/// A batch of ephemeron counts, keyed by short hash.
pub type EphMap = HashMap<ShortHash, u64>;

/// Thread-safe multiset of short hashes held by live transactions.
///
/// Reads dominate — the writer probes membership and samples the key
/// set every cycle — so the map sits behind a `RwLock`.
#[derive(Default)]
pub struct EphemeronTable {
    inner: RwLock<EphMap>,
}

impl EphemeronTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every count in `batch` to the table.
    pub fn add(&self, batch: &EphMap) {
        if batch.is_empty() {
            return;
        }
        let mut inner = self.inner.write().expect("ephemeron lock poisoned");
        for (s, n) in batch {
            *inner.entry(*s).or_insert(0) += n;
        }
    }

    /// Subtract every count in `batch`, dropping entries that reach
    /// zero. Releasing more than was added means transaction
    /// bookkeeping is broken, which is an assertion failure.
    pub fn release(&self, batch: &EphMap) {
        if batch.is_empty() {
            return;
        }
        let mut inner = self.inner.write().expect("ephemeron lock poisoned");
        for (s, n) in batch {
            let held = inner.get_mut(s);
            let held = held.unwrap_or_else(|| panic!("released unheld ephemeron {s}"));
            assert!(*held >= *n, "ephemeron count underflow for {s}");
            *held -= n;
            if *held == 0 {
                inner.remove(s);
            }
        }
    }

    /// Whether any live transaction currently holds `s`.
    pub fn contains(&self, s: &ShortHash) -> bool {
        self.inner
            .read()
            .expect("ephemeron lock poisoned")
            .contains_key(s)
    }

    /// The set of held short hashes at this instant. The writer samples
    /// this once per cycle.
    pub fn snapshot(&self) -> HashSet<ShortHash> {
        self.inner
            .read()
            .expect("ephemeron lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    /// Number of distinct held short hashes.
    pub fn len(&self) -> usize {
        self.inner.read().expect("ephemeron lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
