//! Memory-mapped storage backend for the cask engine.
//!
//! A thin adapter over LMDB (via `heed`): one environment per database
//! directory, four named tables, read and write transactions, and an
//! explicit fsync. The adapter is deliberately minimal — refcounts,
//! garbage collection, and reader accounting all live a layer up in
//! `cask-engine`.
//!
//! # Configuration
//!
//! The environment is opened with:
//!
//! - `WRITE_MAP` — write-through memory map; reads return pointers into
//!   the map, valid for the lifetime of the read transaction.
//! - `MAP_ASYNC` — commits do not fsync; the engine calls [`Backend::sync`]
//!   once per write cycle instead.
//! - `NO_LOCK` — LMDB's own reader table is disabled. The engine runs its
//!   own two-frame reader/writer interlock, so the backend must not
//!   second-guess it.
//! - `NO_READ_AHEAD` — access patterns here are point lookups; OS
//!   readahead only evicts useful pages.
//!
//! # Tables
//!
//! | Name | Contents |
//! |---|---|
//! | `@` | roots: client key → value |
//! | `$` | stowage: short hash → hash suffix ∥ blob |
//! | `#` | refcounts: short hash → ASCII decimal count |
//! | `0` | zero-set: short hashes with refcount zero |

pub mod error;
mod table;

pub use error::{BackendError, BackendResult};
pub use table::Table;

// Transaction handles are heed's own; re-exported so callers need not
// depend on heed directly.
pub use heed::{RoTxn, RwTxn};

use std::path::Path;

use heed::types::Bytes;
use heed::{Env, EnvFlags, EnvOpenOptions};
use tracing::info;

/// Table name for roots (client key → value).
pub const TABLE_ROOTS: &str = "@";
/// Table name for stowage (short hash → suffix ∥ blob).
pub const TABLE_STOWAGE: &str = "$";
/// Table name for refcounts (short hash → ASCII decimal).
pub const TABLE_REFCOUNTS: &str = "#";
/// Table name for the zero-set (short hashes with refcount zero).
pub const TABLE_ZEROSET: &str = "0";

/// Handle to one open LMDB environment and its four tables.
///
/// Cloning is cheap (the environment is internally reference-counted)
/// and clones share the same map. Only one thread may hold a write
/// transaction at a time; with `NO_LOCK` the backend does not enforce
/// this, the caller must.
#[derive(Clone)]
pub struct Backend {
    env: Env,
    roots: Table,
    stowage: Table,
    refcounts: Table,
    zeroset: Table,
}

impl Backend {
    /// Open (or create) the backend under `dir` with the given maximum
    /// map size in bytes.
    pub fn open(dir: &Path, max_bytes: usize) -> BackendResult<Self> {
        std::fs::create_dir_all(dir)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_bytes)
                .max_dbs(4)
                .flags(
                    EnvFlags::WRITE_MAP
                        | EnvFlags::MAP_ASYNC
                        | EnvFlags::NO_LOCK
                        | EnvFlags::NO_READ_AHEAD,
                )
                .open(dir)?
        };

        let (roots, stowage, refcounts, zeroset) = {
            let mut txn = env.write_txn()?;
            let roots = env.create_database::<Bytes, Bytes>(&mut txn, Some(TABLE_ROOTS))?;
            let stowage = env.create_database::<Bytes, Bytes>(&mut txn, Some(TABLE_STOWAGE))?;
            let refcounts =
                env.create_database::<Bytes, Bytes>(&mut txn, Some(TABLE_REFCOUNTS))?;
            let zeroset = env.create_database::<Bytes, Bytes>(&mut txn, Some(TABLE_ZEROSET))?;
            txn.commit()?;
            (roots, stowage, refcounts, zeroset)
        };

        info!(dir = %dir.display(), max_bytes, "backend opened");

        Ok(Self {
            env,
            roots: Table::new(roots),
            stowage: Table::new(stowage),
            refcounts: Table::new(refcounts),
            zeroset: Table::new(zeroset),
        })
    }

    /// Begin a read transaction. Values read through it are borrowed
    /// from the memory map and live no longer than the transaction.
    pub fn read_txn(&self) -> BackendResult<RoTxn<'_>> {
        Ok(self.env.read_txn()?)
    }

    /// Begin the write transaction. The caller must ensure only one
    /// exists at a time.
    pub fn write_txn(&self) -> BackendResult<RwTxn<'_>> {
        Ok(self.env.write_txn()?)
    }

    /// Flush the memory map to durable storage.
    pub fn sync(&self) -> BackendResult<()> {
        self.env.force_sync()?;
        Ok(())
    }

    /// The roots table (`@`).
    pub fn roots(&self) -> Table {
        self.roots
    }

    /// The stowage table (`$`).
    pub fn stowage(&self) -> Table {
        self.stowage
    }

    /// The refcounts table (`#`).
    pub fn refcounts(&self) -> Table {
        self.refcounts
    }

    /// The zero-set table (`0`).
    pub fn zeroset(&self) -> Table {
        self.zeroset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: usize = 1 << 20;

    #[test]
    fn open_creates_directory_and_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let backend = Backend::open(&path, 16 * MB).unwrap();
        assert!(path.is_dir());

        let rtxn = backend.read_txn().unwrap();
        assert_eq!(backend.roots().len(&rtxn).unwrap(), 0);
        assert_eq!(backend.stowage().len(&rtxn).unwrap(), 0);
    }

    #[test]
    fn put_get_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::open(dir.path(), 16 * MB).unwrap();

        let mut wtxn = backend.write_txn().unwrap();
        backend.roots().put(&mut wtxn, b"key", b"value").unwrap();
        wtxn.commit().unwrap();

        let rtxn = backend.read_txn().unwrap();
        assert_eq!(backend.roots().get(&rtxn, b"key").unwrap(), Some(&b"value"[..]));
        assert_eq!(backend.roots().get(&rtxn, b"other").unwrap(), None);
        drop(rtxn);

        let mut wtxn = backend.write_txn().unwrap();
        assert!(backend.roots().delete(&mut wtxn, b"key").unwrap());
        assert!(!backend.roots().delete(&mut wtxn, b"key").unwrap());
        wtxn.commit().unwrap();
    }

    #[test]
    fn tables_are_disjoint_namespaces() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::open(dir.path(), 16 * MB).unwrap();

        let mut wtxn = backend.write_txn().unwrap();
        backend.roots().put(&mut wtxn, b"k", b"root").unwrap();
        backend.stowage().put(&mut wtxn, b"k", b"stow").unwrap();
        wtxn.commit().unwrap();

        let rtxn = backend.read_txn().unwrap();
        assert_eq!(backend.roots().get(&rtxn, b"k").unwrap(), Some(&b"root"[..]));
        assert_eq!(backend.stowage().get(&rtxn, b"k").unwrap(), Some(&b"stow"[..]));
        assert_eq!(backend.refcounts().get(&rtxn, b"k").unwrap(), None);
    }

    #[test]
    fn put_no_overwrite_preserves_existing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::open(dir.path(), 16 * MB).unwrap();

        let mut wtxn = backend.write_txn().unwrap();
        assert!(backend.stowage().put_no_overwrite(&mut wtxn, b"h", b"one").unwrap());
        assert!(!backend.stowage().put_no_overwrite(&mut wtxn, b"h", b"two").unwrap());
        wtxn.commit().unwrap();

        let rtxn = backend.read_txn().unwrap();
        assert_eq!(backend.stowage().get(&rtxn, b"h").unwrap(), Some(&b"one"[..]));
    }

    #[test]
    fn iteration_is_key_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::open(dir.path(), 16 * MB).unwrap();

        let mut wtxn = backend.write_txn().unwrap();
        for key in [b"c".as_ref(), b"a", b"b"] {
            backend.zeroset().put(&mut wtxn, key, b"").unwrap();
        }
        wtxn.commit().unwrap();

        let rtxn = backend.read_txn().unwrap();
        let keys: Vec<Vec<u8>> = backend
            .zeroset()
            .iter(&rtxn)
            .unwrap()
            .map(|item| item.map(|(k, _)| k.to_vec()))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = Backend::open(dir.path(), 16 * MB).unwrap();
            let mut wtxn = backend.write_txn().unwrap();
            backend.roots().put(&mut wtxn, b"persist", b"me").unwrap();
            wtxn.commit().unwrap();
            backend.sync().unwrap();
        }
        let backend = Backend::open(dir.path(), 16 * MB).unwrap();
        let rtxn = backend.read_txn().unwrap();
        assert_eq!(
            backend.roots().get(&rtxn, b"persist").unwrap(),
            Some(&b"me"[..])
        );
    }

    #[test]
    fn empty_values_are_representable() {
        // The zero-set stores members with empty values.
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::open(dir.path(), 16 * MB).unwrap();

        let mut wtxn = backend.write_txn().unwrap();
        backend.zeroset().put(&mut wtxn, b"member", b"").unwrap();
        wtxn.commit().unwrap();

        let rtxn = backend.read_txn().unwrap();
        assert_eq!(backend.zeroset().get(&rtxn, b"member").unwrap(), Some(&b""[..]));
    }
}
