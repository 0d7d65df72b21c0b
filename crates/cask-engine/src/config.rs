use serde::{Deserialize, Serialize};

/// Configuration for opening a [`crate::Db`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DbConfig {
    /// Maximum size of the memory map in mebibytes. The backend rejects
    /// writes past this point, which is fatal to the writer.
    pub map_size_mb: usize,
    /// Base GC candidate quota per write cycle. The effective quota is
    /// `gc_quota_base + 2 × (touched refcount rows)`.
    pub gc_quota_base: usize,
    /// Cascade multiplier: one cycle collects at most
    /// `gc_quota_factor × quota` resources before re-signalling itself.
    pub gc_quota_factor: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            map_size_mb: 1024,
            gc_quota_base: 50,
            gc_quota_factor: 5,
        }
    }
}

impl DbConfig {
    /// A config with the given map size and default GC tuning.
    pub fn with_map_size_mb(map_size_mb: usize) -> Self {
        Self {
            map_size_mb,
            ..Default::default()
        }
    }
}
