//! Client transactions.
//!
//! A [`Tx`] buffers reads and writes against a snapshot of named
//! roots, stows content-addressed resources, and commits through the
//! writer with optimistic validation: every value it read is an
//! assumption, and the commit succeeds only if all assumptions still
//! hold at apply time.
//!
//! Reads consult the transaction's own write set, then its read set,
//! then the backend. A backend read records the observed value as an
//! assumption and registers an ephemeron for every hash the value
//! mentions, so resources reachable from values this transaction has
//! seen cannot be collected under it.
//!
//! A `Tx` may be shared between threads; operations on it are
//! serialised by its internal mutex.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use cask_hash::{ct_eq, hash, scan_deps, Hash, SHORT_LEN};

use crate::db::Db;
use crate::ephemeron::EphMap;
use crate::error::{EngineError, EngineResult};
use crate::key::Key;
use crate::writer::CommitRequest;

struct TxInner {
    /// Read assumptions: key → value observed (empty = absent).
    reads: HashMap<Key, Vec<u8>>,
    /// Buffered writes: key → value to store (empty = delete).
    writes: HashMap<Key, Vec<u8>>,
    /// This transaction's share of the global ephemeron table.
    eph: EphMap,
}

/// A transaction over a [`Db`].
pub struct Tx {
    db: Db,
    inner: Mutex<TxInner>,
}

/// An in-flight commit submitted with [`Tx::commit_async`].
pub struct PendingCommit {
    rx: oneshot::Receiver<bool>,
}

impl PendingCommit {
    /// Block until the writer decides, returning `false` on conflict.
    pub fn wait(self) -> EngineResult<bool> {
        self.rx.recv().map_err(|_| EngineError::WriterStopped)
    }
}

impl Tx {
    pub(crate) fn new(db: Db) -> Self {
        Self {
            db,
            inner: Mutex::new(TxInner {
                reads: HashMap::new(),
                writes: HashMap::new(),
                eph: EphMap::new(),
            }),
        }
    }

    /// Read a root. Absent keys read as empty. A backend consult
    /// records the value as a read assumption and registers
    /// ephemerons for every hash it mentions.
    pub fn read(&self, key: &[u8]) -> EngineResult<Vec<u8>> {
        let k = Key::normalize(key)?;
        let mut inner = self.inner.lock().expect("tx mutex poisoned");
        if let Some(value) = inner.writes.get(&k) {
            return Ok(value.clone());
        }
        if let Some(value) = inner.reads.get(&k) {
            return Ok(value.clone());
        }

        let shared = self.db.shared();
        let _guard = shared.frames.enter();
        let rtxn = shared.backend.read_txn()?;
        let value = shared
            .backend
            .roots()
            .get(&rtxn, k.as_bytes())?
            .map(<[u8]>::to_vec)
            .unwrap_or_default();

        let mut bump = EphMap::new();
        for dep in scan_deps(&value) {
            *bump.entry(dep.short()).or_insert(0) += 1;
        }
        // Register while still inside the read frame; the one-cycle
        // hold on overwritten mentions covers the remaining window.
        shared.eph.add(&bump);
        drop(rtxn);

        for (s, n) in bump {
            *inner.eph.entry(s).or_insert(0) += n;
        }
        inner.reads.insert(k, value.clone());
        Ok(value)
    }

    /// Read several roots, fetching all keys missing from this
    /// transaction's sets under a single backend snapshot.
    pub fn read_many(&self, keys: &[&[u8]]) -> EngineResult<Vec<Vec<u8>>> {
        let normalized: Vec<Key> = keys
            .iter()
            .map(|k| Key::normalize(k))
            .collect::<EngineResult<_>>()?;
        let mut inner = self.inner.lock().expect("tx mutex poisoned");

        let mut missing: Vec<Key> = Vec::new();
        let mut seen: HashSet<&Key> = HashSet::new();
        for k in &normalized {
            if !inner.writes.contains_key(k) && !inner.reads.contains_key(k) && seen.insert(k) {
                missing.push(k.clone());
            }
        }

        if !missing.is_empty() {
            let shared = self.db.shared();
            let _guard = shared.frames.enter();
            let rtxn = shared.backend.read_txn()?;
            let roots = shared.backend.roots();
            let mut bump = EphMap::new();
            let mut fetched: Vec<(Key, Vec<u8>)> = Vec::with_capacity(missing.len());
            for k in missing {
                let value = roots
                    .get(&rtxn, k.as_bytes())?
                    .map(<[u8]>::to_vec)
                    .unwrap_or_default();
                for dep in scan_deps(&value) {
                    *bump.entry(dep.short()).or_insert(0) += 1;
                }
                fetched.push((k, value));
            }
            shared.eph.add(&bump);
            drop(rtxn);

            for (s, n) in bump {
                *inner.eph.entry(s).or_insert(0) += n;
            }
            for (k, value) in fetched {
                inner.reads.insert(k, value);
            }
        }

        Ok(normalized
            .iter()
            .map(|k| {
                inner
                    .writes
                    .get(k)
                    .or_else(|| inner.reads.get(k))
                    .cloned()
                    .unwrap_or_default()
            })
            .collect())
    }

    /// Buffer a write. An empty value deletes the root at commit.
    pub fn write(&self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        let k = Key::normalize(key)?;
        self.inner
            .lock()
            .expect("tx mutex poisoned")
            .writes
            .insert(k, value.to_vec());
        Ok(())
    }

    /// Set or clear a read assumption directly. `Some(value)` asserts
    /// the root currently holds `value` (empty = absent); `None`
    /// removes any assumption for the key.
    pub fn assume(&self, key: &[u8], value: Option<&[u8]>) -> EngineResult<()> {
        let k = Key::normalize(key)?;
        let mut inner = self.inner.lock().expect("tx mutex poisoned");
        match value {
            Some(v) => {
                inner.reads.insert(k, v.to_vec());
            }
            None => {
                inner.reads.remove(&k);
            }
        }
        Ok(())
    }

    /// Stow a blob: it becomes loadable by hash immediately, is
    /// migrated to persistent stowage by the writer, and is protected
    /// by this transaction's ephemeron until dropped or cleared.
    pub fn stow(&self, value: &[u8]) -> Hash {
        let h = hash(value);
        let shared = self.db.shared();
        let mut inner = self.inner.lock().expect("tx mutex poisoned");

        // Ephemeron before buffer entry: the writer samples the buffer
        // first, so a sampled entry with a live owner is always
        // covered by the ephemeron sample.
        let mut bump = EphMap::new();
        bump.insert(h.short(), 1);
        shared.eph.add(&bump);
        shared.stow_buf.insert(h, value.to_vec());
        *inner.eph.entry(h.short()).or_insert(0) += 1;
        drop(inner);

        self.db.wake_writer();
        h
    }

    /// Load a stowed blob by hash. Checks the stow buffer, then the
    /// stowage table; the stored hash suffix must match the caller's
    /// in constant time before the blob is exposed. Unknown hashes
    /// are `None`.
    pub fn load(&self, h: &Hash) -> EngineResult<Option<Vec<u8>>> {
        self.with_resource(h, |blob| blob.to_vec())
    }

    /// Zero-copy variant of [`Tx::load`]: `f` sees the blob bytes in
    /// place (for persisted resources, directly in the memory map)
    /// and they are valid only for the duration of the call.
    pub fn with_resource<R>(&self, h: &Hash, f: impl FnOnce(&[u8]) -> R) -> EngineResult<Option<R>> {
        let shared = self.db.shared();
        if let Some(blob) = shared.stow_buf.get(h) {
            return Ok(Some(f(&blob)));
        }

        let _guard = shared.frames.enter();
        let rtxn = shared.backend.read_txn()?;
        let Some(stored) = shared.backend.stowage().get(&rtxn, h.short().as_bytes())? else {
            return Ok(None);
        };
        if stored.len() < SHORT_LEN || !ct_eq(&stored[..SHORT_LEN], h.suffix()) {
            return Ok(None);
        }
        Ok(Some(f(&stored[SHORT_LEN..])))
    }

    /// Replace this transaction's ephemeron set with exactly the
    /// hashes mentioned by its current read and write sets, plus
    /// `extras`. The new set is registered before the old one is
    /// released, so nothing reachable is ever momentarily
    /// unprotected.
    pub fn clear_resources(&self, extras: &[Hash]) {
        let mut inner = self.inner.lock().expect("tx mutex poisoned");
        let mut next = EphMap::new();
        for value in inner.reads.values().chain(inner.writes.values()) {
            for dep in scan_deps(value) {
                *next.entry(dep.short()).or_insert(0) += 1;
            }
        }
        for h in extras {
            *next.entry(h.short()).or_insert(0) += 1;
        }

        let shared = self.db.shared();
        shared.eph.add(&next);
        let old = std::mem::replace(&mut inner.eph, next);
        shared.eph.release(&old);
    }

    /// Commit this transaction's writes, validated against its read
    /// assumptions. On success the write set folds into the read set
    /// and the transaction may continue; on conflict (`false`) the
    /// sets are left untouched.
    pub fn commit(&self) -> EngineResult<bool> {
        let mut inner = self.inner.lock().expect("tx mutex poisoned");
        let (reply, rx) = oneshot::channel();
        self.db.submit(CommitRequest {
            reads: inner.reads.clone(),
            writes: inner.writes.clone(),
            reply,
        })?;
        let ok = rx.recv().map_err(|_| EngineError::WriterStopped)?;
        if ok {
            let writes = std::mem::take(&mut inner.writes);
            inner.reads.extend(writes);
        }
        Ok(ok)
    }

    /// Submit the commit without waiting. The transaction's sets are
    /// not folded; use [`Tx::commit`] when the transaction will be
    /// reused after success.
    pub fn commit_async(&self) -> EngineResult<PendingCommit> {
        let inner = self.inner.lock().expect("tx mutex poisoned");
        let (reply, rx) = oneshot::channel();
        self.db.submit(CommitRequest {
            reads: inner.reads.clone(),
            writes: inner.writes.clone(),
            reply,
        })?;
        Ok(PendingCommit { rx })
    }

    /// Fork this transaction: the copy has the same read, write, and
    /// ephemeron sets, with the ephemeron counts duplicated in the
    /// global table.
    pub fn dup(&self) -> Tx {
        let inner = self.inner.lock().expect("tx mutex poisoned");
        self.db.shared().eph.add(&inner.eph);
        Tx {
            db: self.db.clone(),
            inner: Mutex::new(TxInner {
                reads: inner.reads.clone(),
                writes: inner.writes.clone(),
                eph: inner.eph.clone(),
            }),
        }
    }

    /// Report the (normalized) keys whose read assumptions no longer
    /// match the backend — the keys that would make a commit fail
    /// right now.
    pub fn check(&self) -> EngineResult<Vec<Vec<u8>>> {
        let inner = self.inner.lock().expect("tx mutex poisoned");
        if inner.reads.is_empty() {
            return Ok(Vec::new());
        }
        let shared = self.db.shared();
        let _guard = shared.frames.enter();
        let rtxn = shared.backend.read_txn()?;
        let roots = shared.backend.roots();
        let mut stale = Vec::new();
        for (k, assumed) in &inner.reads {
            let current = roots.get(&rtxn, k.as_bytes())?.unwrap_or(&[]);
            if current != assumed.as_slice() {
                stale.push(k.as_bytes().to_vec());
            }
        }
        Ok(stale)
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().expect("tx mutex poisoned");
        if !inner.eph.is_empty() {
            let eph = std::mem::take(&mut inner.eph);
            self.db.shared().eph.release(&eph);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::db::Db;

    fn open_db() -> (tempfile::TempDir, Db) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path(), DbConfig::with_map_size_mb(64)).unwrap();
        (dir, db)
    }

    #[test]
    fn reads_observe_own_writes_immediately() {
        let (_dir, db) = open_db();
        let tx = db.begin();
        tx.write(b"k", b"v").unwrap();
        assert_eq!(tx.read(b"k").unwrap(), b"v".to_vec());
        // The write shadows any recorded assumption.
        tx.write(b"k", b"v2").unwrap();
        assert_eq!(tx.read(b"k").unwrap(), b"v2".to_vec());
    }

    #[test]
    fn check_reports_stale_assumptions() {
        let (_dir, db) = open_db();
        let tx = db.begin();
        assert_eq!(tx.read(b"k").unwrap(), Vec::<u8>::new());
        assert!(tx.check().unwrap().is_empty());

        let other = db.begin();
        other.write(b"k", b"changed").unwrap();
        assert!(other.commit().unwrap());

        assert_eq!(tx.check().unwrap(), vec![b"k".to_vec()]);
    }

    #[test]
    fn assume_sets_and_clears() {
        let (_dir, db) = open_db();
        let tx = db.begin();
        tx.assume(b"k", Some(b"expected")).unwrap();
        assert_eq!(tx.check().unwrap(), vec![b"k".to_vec()]);
        tx.assume(b"k", None).unwrap();
        assert!(tx.check().unwrap().is_empty());
    }

    #[test]
    fn stow_is_loadable_before_any_commit() {
        let (_dir, db) = open_db();
        let tx = db.begin();
        let h = tx.stow(b"fresh blob");
        assert_eq!(tx.load(&h).unwrap(), Some(b"fresh blob".to_vec()));
        // And from a sibling transaction, via the shared buffer.
        let other = db.begin();
        assert_eq!(other.load(&h).unwrap(), Some(b"fresh blob".to_vec()));
    }

    #[test]
    fn with_resource_exposes_blob_bytes() {
        let (_dir, db) = open_db();
        let tx = db.begin();
        let h = tx.stow(b"counted");
        let len = tx.with_resource(&h, |blob| blob.len()).unwrap();
        assert_eq!(len, Some(b"counted".len()));
        let missing = tx
            .with_resource(&cask_hash::hash(b"never stowed"), |blob| blob.len())
            .unwrap();
        assert_eq!(missing, None);
    }

    #[test]
    fn load_rejects_mismatched_suffix() {
        let (_dir, db) = open_db();
        let tx = db.begin();
        let h = tx.stow(b"suffix test");
        // Persist it so the lookup takes the stowage-table path.
        db.gc().unwrap();

        let mut forged = *h.as_bytes();
        let last = forged[cask_hash::HASH_LEN - 1];
        forged[cask_hash::HASH_LEN - 1] = if last == b'b' { b'c' } else { b'b' };
        let forged = Hash::from_bytes(&forged).unwrap();

        assert_eq!(forged.short(), h.short());
        assert_eq!(tx.load(&forged).unwrap(), None);
        assert_eq!(tx.load(&h).unwrap(), Some(b"suffix test".to_vec()));
    }

    #[test]
    fn read_registers_ephemerons_for_mentions() {
        let (_dir, db) = open_db();
        let setup = db.begin();
        let h = setup.stow(b"referenced");
        setup.write(b"root", h.as_bytes()).unwrap();
        assert!(setup.commit().unwrap());
        drop(setup);
        assert!(!db.shared().eph.contains(&h.short()));

        let tx = db.begin();
        let value = tx.read(b"root").unwrap();
        assert_eq!(value, h.as_bytes().to_vec());
        assert!(db.shared().eph.contains(&h.short()));
        drop(tx);
        assert!(!db.shared().eph.contains(&h.short()));
    }

    #[test]
    fn clear_resources_keeps_reachable_hashes() {
        let (_dir, db) = open_db();
        let tx = db.begin();
        let kept = tx.stow(b"kept");
        let dropped = tx.stow(b"dropped");
        tx.write(b"root", kept.as_bytes()).unwrap();

        tx.clear_resources(&[]);
        // `kept` is mentioned by the write set; `dropped` is not.
        assert!(db.shared().eph.contains(&kept.short()));
        assert!(!db.shared().eph.contains(&dropped.short()));
    }

    #[test]
    fn clear_resources_honours_extras() {
        let (_dir, db) = open_db();
        let tx = db.begin();
        let extra = tx.stow(b"extra");
        tx.clear_resources(&[extra]);
        assert!(db.shared().eph.contains(&extra.short()));
        tx.clear_resources(&[]);
        assert!(!db.shared().eph.contains(&extra.short()));
    }

    #[test]
    fn dup_duplicates_ephemeron_counts() {
        let (_dir, db) = open_db();
        let tx = db.begin();
        let h = tx.stow(b"shared");
        let fork = tx.dup();

        drop(tx);
        // The fork still protects the resource.
        assert!(db.shared().eph.contains(&h.short()));
        drop(fork);
        assert!(!db.shared().eph.contains(&h.short()));
    }

    #[test]
    fn commit_async_resolves() {
        let (_dir, db) = open_db();
        let tx = db.begin();
        tx.write(b"k", b"async").unwrap();
        let pending = tx.commit_async().unwrap();
        assert!(pending.wait().unwrap());
        drop(tx);
        assert_eq!(db.read_key(b"k").unwrap(), b"async".to_vec());
    }

    #[test]
    fn dup_carries_read_and_write_sets() {
        let (_dir, db) = open_db();
        let tx = db.begin();
        tx.write(b"k", b"v").unwrap();
        assert_eq!(tx.read(b"other").unwrap(), Vec::<u8>::new());

        let fork = tx.dup();
        assert_eq!(fork.read(b"k").unwrap(), b"v".to_vec());
        // The fork inherited the assumption on `other`; a conflicting
        // commit elsewhere shows up in its check.
        let third = db.begin();
        third.write(b"other", b"moved").unwrap();
        assert!(third.commit().unwrap());
        assert_eq!(fork.check().unwrap(), vec![b"other".to_vec()]);
    }
}
