//! The cask storage engine: a persistent content-addressed key-value
//! store with transactional semantics.
//!
//! Two layers compose into one API:
//!
//! - **Roots** — small named mutable cells holding binary values,
//!   updated through optimistic transactions.
//! - **Stowage** — an immutable content-addressed store of binary blobs
//!   keyed by a secure hash of their contents. Values may mention other
//!   hashes textually; mentions form a reference graph maintained by
//!   persistent refcounts and reclaimed by conservative, incremental GC.
//!
//! Together they represent immutable persistent data structures larger
//! than memory: roots keep live hashes, hashes transitively anchor
//! arbitrarily large graphs, and GC reclaims whatever becomes
//! unreachable.
//!
//! # Architecture
//!
//! - Many client threads hold [`Tx`] objects; each transaction buffers
//!   reads and writes locally and is internally serialised.
//! - One writer thread owns the backend's write transaction. It batches
//!   queued commits, validates read assumptions in arrival order,
//!   maintains refcounts, runs bounded GC, and advances the reader
//!   frame interlock.
//! - An in-memory ephemeron table protects resources referenced only by
//!   live transactions from collection.
//!
//! # Modules
//!
//! - [`db`] — open/close lifecycle, direct reads, forced GC
//! - [`tx`] — the client transaction object
//! - [`writer`] — the serial write/GC actor
//! - [`refcount`] — persistent refcount rows + the zero-set index
//! - [`ephemeron`] — the volatile reference multiset
//! - [`stowbuf`] — stowed-but-unpersisted blobs
//! - [`frame`] — counting reader latches for the two-frame interlock
//! - [`key`] — client key normalization
//! - [`config`], [`error`]

pub mod config;
pub mod db;
pub mod ephemeron;
pub mod error;
pub mod frame;
pub mod key;
pub mod refcount;
pub mod stowbuf;
pub mod tx;
pub mod writer;

pub use cask_hash::{hash, scan_deps, Hash, ShortHash};
pub use config::DbConfig;
pub use db::Db;
pub use error::{EngineError, EngineResult};
pub use key::Key;
pub use tx::{PendingCommit, Tx};
