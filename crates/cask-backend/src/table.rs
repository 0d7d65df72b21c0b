use heed::types::Bytes;
use heed::{Database, RoIter, RoTxn, RwTxn};

use crate::error::BackendResult;

/// One named table: raw byte keys to raw byte values.
///
/// A `Table` is a copyable handle; all access goes through an explicit
/// transaction. Reads are zero-copy — the returned slices point into
/// the memory map and are valid only while the transaction lives.
#[derive(Clone, Copy)]
pub struct Table(Database<Bytes, Bytes>);

impl Table {
    pub(crate) fn new(db: Database<Bytes, Bytes>) -> Self {
        Self(db)
    }

    /// Look up `key`. Returns a slice borrowed from the memory map.
    pub fn get<'t>(&self, txn: &'t RoTxn, key: &[u8]) -> BackendResult<Option<&'t [u8]>> {
        Ok(self.0.get(txn, key)?)
    }

    /// Insert or replace `key`.
    pub fn put(&self, txn: &mut RwTxn, key: &[u8], value: &[u8]) -> BackendResult<()> {
        self.0.put(txn, key, value)?;
        Ok(())
    }

    /// Insert `key` only if absent. Returns `false` (and leaves the
    /// existing value untouched) when the key is already present.
    pub fn put_no_overwrite(
        &self,
        txn: &mut RwTxn,
        key: &[u8],
        value: &[u8],
    ) -> BackendResult<bool> {
        match self
            .0
            .put_with_flags(txn, heed::PutFlags::NO_OVERWRITE, key, value)
        {
            Ok(()) => Ok(true),
            Err(heed::Error::Mdb(heed::MdbError::KeyExist)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove `key`. Returns whether it was present.
    pub fn delete(&self, txn: &mut RwTxn, key: &[u8]) -> BackendResult<bool> {
        Ok(self.0.delete(txn, key)?)
    }

    /// The first entry in key order, if any.
    pub fn first<'t>(&self, txn: &'t RoTxn) -> BackendResult<Option<(&'t [u8], &'t [u8])>> {
        Ok(self.0.first(txn)?)
    }

    /// Cursor over all entries in key order.
    pub fn iter<'t>(&self, txn: &'t RoTxn) -> BackendResult<RoIter<'t, Bytes, Bytes>> {
        Ok(self.0.iter(txn)?)
    }

    /// Number of entries.
    pub fn len(&self, txn: &RoTxn) -> BackendResult<u64> {
        Ok(self.0.len(txn)?)
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self, txn: &RoTxn) -> BackendResult<bool> {
        Ok(self.len(txn)? == 0)
    }
}
