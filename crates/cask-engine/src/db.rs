//! Database lifecycle and the top-level handle.
//!
//! A [`Db`] owns one on-disk directory: the backend's data files plus a
//! `lockfile` held under an exclusive advisory lock so only one process
//! can serve the directory. Opening spawns the writer thread; dropping
//! the last handle (transactions hold one too) stops it after a final
//! flush and releases the lock. There is no explicit close.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cask_backend::Backend;
use fs2::FileExt;
use tracing::{info, warn};

use crate::config::DbConfig;
use crate::ephemeron::EphemeronTable;
use crate::error::{EngineError, EngineResult};
use crate::frame::FrameCell;
use crate::key::Key;
use crate::stowbuf::StowBuffer;
use crate::tx::Tx;
use crate::writer::{self, CommitRequest, WriterMsg};

/// State shared between client handles, transactions, and the writer.
pub(crate) struct Shared {
    pub(crate) backend: Backend,
    pub(crate) eph: EphemeronTable,
    pub(crate) stow_buf: StowBuffer,
    pub(crate) frames: FrameCell,
    /// Held for the lifetime of the database. Releasing it is what
    /// lets another process open the directory.
    _lockfile: File,
}

/// Owns the writer thread. Dropping the last reference stops the
/// writer: the kill switch is set, a wake unblocks the queue, and the
/// thread is joined after its final flush.
struct WriterHandle {
    sender: flume::Sender<WriterMsg>,
    kill: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for WriterHandle {
    fn drop(&mut self) {
        self.kill.store(true, Ordering::Release);
        let _ = self.sender.send(WriterMsg::Wake);
        if let Some(handle) = self.join.lock().expect("writer handle poisoned").take() {
            handle.join().ok();
        }
    }
}

/// Handle to an open database. Cloning is cheap; all clones share the
/// same backend, writer, and in-memory tables.
#[derive(Clone)]
pub struct Db {
    shared: Arc<Shared>,
    writer: Arc<WriterHandle>,
}

impl Db {
    /// Open (or create) a database directory.
    pub fn open(path: impl AsRef<Path>, config: DbConfig) -> EngineResult<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let lockfile = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path.join("lockfile"))?;
        if lockfile.try_lock_exclusive().is_err() {
            warn!(path = %path.display(), "database directory is already locked");
            return Err(EngineError::DirectoryLocked(path.to_path_buf()));
        }

        let backend = Backend::open(path, config.map_size_mb << 20)?;
        let shared = Arc::new(Shared {
            backend,
            eph: EphemeronTable::new(),
            stow_buf: StowBuffer::new(),
            frames: FrameCell::new(),
            _lockfile: lockfile,
        });

        let (sender, receiver) = flume::unbounded();
        let kill = Arc::new(AtomicBool::new(false));
        let join = writer::spawn(
            Arc::clone(&shared),
            config,
            receiver,
            sender.clone(),
            Arc::clone(&kill),
        )?;

        info!(path = %path.display(), "database opened");
        Ok(Self {
            shared,
            writer: Arc::new(WriterHandle {
                sender,
                kill,
                join: Mutex::new(Some(join)),
            }),
        })
    }

    /// Begin a transaction.
    pub fn begin(&self) -> Tx {
        Tx::new(self.clone())
    }

    /// Read one root directly, bypassing transaction bookkeeping: no
    /// read assumption is recorded and no ephemerons are registered,
    /// so hashes inside the returned value must not be held past the
    /// call without a transaction. Absent keys read as empty.
    pub fn read_key(&self, key: &[u8]) -> EngineResult<Vec<u8>> {
        let k = Key::normalize(key)?;
        let _guard = self.shared.frames.enter();
        let rtxn = self.shared.backend.read_txn()?;
        Ok(self
            .shared
            .backend
            .roots()
            .get(&rtxn, k.as_bytes())?
            .map(<[u8]>::to_vec)
            .unwrap_or_default())
    }

    /// Read several roots under one snapshot. Same caveats as
    /// [`Db::read_key`].
    pub fn read_keys(&self, keys: &[&[u8]]) -> EngineResult<Vec<Vec<u8>>> {
        let normalized: Vec<Key> = keys
            .iter()
            .map(|k| Key::normalize(k))
            .collect::<EngineResult<_>>()?;
        let _guard = self.shared.frames.enter();
        let rtxn = self.shared.backend.read_txn()?;
        let roots = self.shared.backend.roots();
        let mut out = Vec::with_capacity(normalized.len());
        for k in &normalized {
            let value = roots
                .get(&rtxn, k.as_bytes())?
                .map(<[u8]>::to_vec)
                .unwrap_or_default();
            out.push(value);
        }
        Ok(out)
    }

    /// Force one synchronous write cycle: an empty commit is queued
    /// and its reply awaited. Runs one bounded GC pass; repeated calls
    /// drain larger garbage graphs.
    pub fn gc(&self) -> EngineResult<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(CommitRequest {
            reads: HashMap::new(),
            writes: HashMap::new(),
            reply,
        })?;
        rx.recv().map_err(|_| EngineError::WriterStopped)?;
        Ok(())
    }

    /// Flush the backend's memory map to durable storage.
    pub fn sync(&self) -> EngineResult<()> {
        self.shared.backend.sync()?;
        Ok(())
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    pub(crate) fn submit(&self, req: CommitRequest) -> EngineResult<()> {
        self.writer
            .sender
            .send(WriterMsg::Commit(req))
            .map_err(|_| EngineError::WriterStopped)
    }

    pub(crate) fn wake_writer(&self) {
        let _ = self.writer.sender.send(WriterMsg::Wake);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cask_hash::Hash;

    fn open_db() -> (tempfile::TempDir, Db) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("db"), DbConfig::with_map_size_mb(64)).unwrap();
        (dir, db)
    }

    #[test]
    fn open_rejects_locked_directory() {
        let dir = tempfile::tempdir().unwrap();
        let first = Db::open(dir.path(), DbConfig::with_map_size_mb(16)).unwrap();
        let second = Db::open(dir.path(), DbConfig::with_map_size_mb(16));
        assert!(matches!(second, Err(EngineError::DirectoryLocked(_))));
        drop(first);
        // Dropping the last handle releases the lock.
        Db::open(dir.path(), DbConfig::with_map_size_mb(16)).unwrap();
    }

    #[test]
    fn roots_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Db::open(dir.path(), DbConfig::with_map_size_mb(16)).unwrap();
            let tx = db.begin();
            tx.write(b"durable", b"yes").unwrap();
            assert!(tx.commit().unwrap());
        }
        let db = Db::open(dir.path(), DbConfig::with_map_size_mb(16)).unwrap();
        assert_eq!(db.read_key(b"durable").unwrap(), b"yes".to_vec());
    }

    #[test]
    fn direct_reads_see_committed_state() {
        let (_dir, db) = open_db();
        assert_eq!(db.read_key(b"missing").unwrap(), Vec::<u8>::new());

        let tx = db.begin();
        tx.write(b"k1", b"v1").unwrap();
        tx.write(b"k2", b"v2").unwrap();
        assert!(tx.commit().unwrap());

        let values = db.read_keys(&[b"k1", b"k2", b"k3"]).unwrap();
        assert_eq!(
            values,
            vec![b"v1".to_vec(), b"v2".to_vec(), Vec::new()]
        );
    }

    // A root chain `a -> rb -> ra` keeps both resources alive through
    // GC; clearing the root lets GC take the whole chain, respecting
    // the one-cycle hold on overwritten mentions.
    #[test]
    fn chained_roots_survive_then_collect() {
        let (_dir, db) = open_db();
        let tx = db.begin();
        let ra = tx.stow(b"x y");
        let rb_blob = [ra.as_bytes().as_ref(), b" z"].concat();
        let rb = tx.stow(&rb_blob);
        tx.write(b"a", rb.as_bytes()).unwrap();
        assert!(tx.commit().unwrap());
        drop(tx);

        db.gc().unwrap();
        let tx = db.begin();
        assert_eq!(tx.load(&ra).unwrap(), Some(b"x y".to_vec()));
        assert_eq!(tx.load(&rb).unwrap(), Some(rb_blob.clone()));

        tx.write(b"a", b"").unwrap();
        assert!(tx.commit().unwrap());
        drop(tx);

        for _ in 0..3 {
            db.gc().unwrap();
        }

        let tx = db.begin();
        assert_eq!(tx.load(&ra).unwrap(), None);
        assert_eq!(tx.load(&rb).unwrap(), None);
    }

    #[test]
    fn conflicting_commit_rejected() {
        let (_dir, db) = open_db();
        let tx1 = db.begin();
        let tx2 = db.begin();

        // tx2 observes the key empty before tx1 commits.
        assert_eq!(tx2.read(b"k").unwrap(), Vec::<u8>::new());

        tx1.write(b"k", b"1").unwrap();
        assert!(tx1.commit().unwrap());

        tx2.write(b"k", b"2").unwrap();
        assert!(!tx2.commit().unwrap());

        assert_eq!(db.read_key(b"k").unwrap(), b"1".to_vec());
    }

    // Batched reads share one backend snapshot; afterwards the
    // recorded assumptions pin the observed values, so a commit by
    // another transaction surfaces as staleness rather than torn
    // reads.
    #[test]
    fn read_many_is_snapshot_consistent() {
        let (_dir, db) = open_db();
        let tx = db.begin();
        let first = tx.read_many(&[b"k1", b"k2", b"k3"]).unwrap();
        assert_eq!(first, vec![Vec::<u8>::new(), Vec::new(), Vec::new()]);

        let tx2 = db.begin();
        tx2.write(b"k1", b"1").unwrap();
        tx2.write(b"k2", b"2").unwrap();
        tx2.write(b"k3", b"3").unwrap();
        assert!(tx2.commit().unwrap());

        let second = tx.read_many(&[b"k1", b"k2", b"k3"]).unwrap();
        assert_eq!(second, first);
        assert_eq!(tx.check().unwrap().len(), 3);
    }

    #[test]
    fn oversized_key_round_trips() {
        let (_dir, db) = open_db();
        let tx = db.begin();

        assert!(tx.write(b"", b"nope").is_err());

        let long_key = vec![b'k'; 256];
        tx.write(&long_key, b"value").unwrap();
        assert!(tx.commit().unwrap());
        assert_eq!(tx.read(&long_key).unwrap(), b"value".to_vec());
        drop(tx);
        assert_eq!(db.read_key(&long_key).unwrap(), b"value".to_vec());

        // Internally the key is stored in its rewritten form.
        let _guard = db.shared.frames.enter();
        let rtxn = db.shared.backend.read_txn().unwrap();
        let (stored_key, _) = db.shared.backend.roots().first(&rtxn).unwrap().unwrap();
        assert_eq!(stored_key[0], crate::key::REWRITE_MARKER);
    }

    #[test]
    fn stow_load_drop_collect() {
        let (_dir, db) = open_db();
        let tx = db.begin();
        let h = tx.stow(b"abc");
        assert_eq!(tx.load(&h).unwrap(), Some(b"abc".to_vec()));
        drop(tx);

        db.gc().unwrap();

        let tx = db.begin();
        assert_eq!(tx.load(&h).unwrap(), None);
    }

    #[test]
    fn commit_then_reuse_tx() {
        let (_dir, db) = open_db();
        let tx = db.begin();
        tx.write(b"k", b"v1").unwrap();
        assert!(tx.commit().unwrap());
        tx.write(b"k", b"v2").unwrap();
        assert!(tx.commit().unwrap());
        drop(tx);
        assert_eq!(db.read_key(b"k").unwrap(), b"v2".to_vec());
    }

    #[test]
    fn gc_drains_unreferenced_resources() {
        let (_dir, db) = open_db();
        let tx = db.begin();
        let hashes: Vec<Hash> = (0..8u8)
            .map(|i| tx.stow(format!("resource {i}").as_bytes()))
            .collect();

        // Persist them while the transaction's ephemerons protect them.
        db.gc().unwrap();
        drop(tx);

        for _ in 0..3 {
            db.gc().unwrap();
        }

        let tx = db.begin();
        for h in &hashes {
            assert_eq!(tx.load(h).unwrap(), None);
        }
        drop(tx);

        let _guard = db.shared.frames.enter();
        let rtxn = db.shared.backend.read_txn().unwrap();
        assert!(db.shared.backend.stowage().is_empty(&rtxn).unwrap());
        assert!(db.shared.backend.zeroset().is_empty(&rtxn).unwrap());
    }

    #[test]
    fn empty_write_deletes_root() {
        let (_dir, db) = open_db();
        let tx = db.begin();
        tx.write(b"k", b"v").unwrap();
        assert!(tx.commit().unwrap());
        tx.write(b"k", b"").unwrap();
        assert!(tx.commit().unwrap());
        drop(tx);
        assert_eq!(db.read_key(b"k").unwrap(), Vec::<u8>::new());

        let _guard = db.shared.frames.enter();
        let rtxn = db.shared.backend.read_txn().unwrap();
        assert!(db.shared.backend.roots().is_empty(&rtxn).unwrap());
    }

    #[test]
    fn commits_from_concurrent_threads_serialize() {
        let (_dir, db) = open_db();
        let mut handles = Vec::new();
        for i in 0..4u8 {
            let db = db.clone();
            handles.push(std::thread::spawn(move || {
                let tx = db.begin();
                tx.write(format!("key-{i}").as_bytes(), &[i]).unwrap();
                tx.commit().unwrap()
            }));
        }
        for handle in handles {
            // Disjoint keys: every commit must succeed.
            assert!(handle.join().unwrap());
        }
        for i in 0..4u8 {
            assert_eq!(db.read_key(format!("key-{i}").as_bytes()).unwrap(), vec![i]);
        }
    }
}
