//! Persistent per-resource reference counts and the zero-set index.
//!
//! Counts live in the `#` table as ASCII decimal (`1..9` then `0..9`*,
//! never a leading zero); absence denotes zero. Short hashes whose
//! count is zero live in the `0` table instead, so GC can find
//! candidates without scanning every refcount row. For any short hash,
//! membership in the two tables is exclusive.

use cask_backend::{Backend, RoTxn, RwTxn, Table};
use cask_hash::ShortHash;

use crate::error::EngineResult;

/// Render a positive count as ASCII decimal.
pub fn encode_count(n: u64) -> Vec<u8> {
    debug_assert!(n > 0, "zero counts are represented by absence");
    n.to_string().into_bytes()
}

/// Parse an ASCII decimal refcount row.
///
/// Rows are written only by [`RefCounts::set`]; a malformed row means
/// the store is corrupt, which is an assertion failure.
pub fn parse_count(bytes: &[u8]) -> u64 {
    assert!(
        !bytes.is_empty() && bytes[0] != b'0' && bytes.iter().all(u8::is_ascii_digit),
        "malformed refcount row: {:?}",
        String::from_utf8_lossy(bytes)
    );
    let text = std::str::from_utf8(bytes).expect("digits are ASCII");
    text.parse::<u64>().expect("decimal refcount overflowed u64")
}

/// Apply a signed delta to a count.
///
/// Decrementing below zero means a resource was released more times
/// than it was referenced — the store is corrupt and the process
/// cannot continue.
pub fn checked_apply(current: u64, delta: i64, s: &ShortHash) -> u64 {
    let next = current as i64 + delta;
    assert!(
        next >= 0,
        "refcount underflow for {s}: {current} {delta:+}"
    );
    next as u64
}

/// Manager for the refcount (`#`) and zero-set (`0`) tables.
///
/// All mutation happens inside the writer's single write transaction;
/// the manager itself holds only copyable table handles.
#[derive(Clone, Copy)]
pub struct RefCounts {
    refcounts: Table,
    zeroset: Table,
}

impl RefCounts {
    pub fn new(backend: &Backend) -> Self {
        Self {
            refcounts: backend.refcounts(),
            zeroset: backend.zeroset(),
        }
    }

    /// Current count for `s`; zero if no row exists.
    pub fn get(&self, txn: &RoTxn, s: &ShortHash) -> EngineResult<u64> {
        Ok(self
            .refcounts
            .get(txn, s.as_bytes())?
            .map(parse_count)
            .unwrap_or(0))
    }

    /// Store the count for `s`, keeping the refcount/zero-set
    /// exclusivity: a zero count moves the row to the zero-set, a
    /// positive count moves it back.
    pub fn set(&self, txn: &mut RwTxn, s: &ShortHash, n: u64) -> EngineResult<()> {
        if n == 0 {
            self.refcounts.delete(txn, s.as_bytes())?;
            self.zeroset.put(txn, s.as_bytes(), b"")?;
        } else {
            self.zeroset.delete(txn, s.as_bytes())?;
            self.refcounts.put(txn, s.as_bytes(), &encode_count(n))?;
        }
        Ok(())
    }

    /// Drop both rows for `s`. Used when the resource itself is
    /// collected.
    pub fn purge(&self, txn: &mut RwTxn, s: &ShortHash) -> EngineResult<()> {
        self.refcounts.delete(txn, s.as_bytes())?;
        self.zeroset.delete(txn, s.as_bytes())?;
        Ok(())
    }

    /// Collect up to `limit` zero-set members passing `keep`, in key
    /// order. Rows are not removed here; the GC apply step purges the
    /// ones it actually collects, so an abandoned cycle leaves the
    /// zero-set intact.
    pub fn take(
        &self,
        txn: &RoTxn,
        limit: usize,
        keep: impl Fn(&ShortHash) -> bool,
    ) -> EngineResult<Vec<ShortHash>> {
        let mut out = Vec::new();
        if limit == 0 {
            return Ok(out);
        }
        for item in self.zeroset.iter(txn)? {
            let (key, _) = item.map_err(cask_backend::BackendError::from)?;
            let s = ShortHash::from_bytes(key).expect("malformed zero-set key");
            if keep(&s) {
                out.push(s);
                if out.len() == limit {
                    break;
                }
            }
        }
        Ok(out)
    }
}
