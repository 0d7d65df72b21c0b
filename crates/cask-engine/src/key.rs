use std::fmt;

use cask_hash::{hash, HASH_LEN};

use crate::error::{EngineError, EngineResult};

/// Maximum length of a key stored verbatim.
pub const MAX_KEY_LEN: usize = 255;

/// Marker byte prefixing rewritten keys. Below `0x20`, so it can never
/// collide with a verbatim key's first byte.
pub const REWRITE_MARKER: u8 = 0x1A;

/// A normalized root key, safe to hand to the backend.
///
/// Client keys are arbitrary bytes. A key of 1..=255 bytes whose first
/// byte is `>= 0x20` is stored verbatim. Anything else (except the
/// empty key, which is an error) is rewritten to
/// `0x1A ∥ hash(original)` — 61 bytes, deterministic, so the rewrite is
/// invisible to clients: the same client key always lands on the same
/// stored key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(Vec<u8>);

impl Key {
    /// Normalize a client key.
    pub fn normalize(raw: &[u8]) -> EngineResult<Self> {
        if raw.is_empty() {
            return Err(EngineError::InvalidKey("empty"));
        }
        if raw.len() <= MAX_KEY_LEN && raw[0] >= 0x20 {
            return Ok(Self(raw.to_vec()));
        }
        let mut rewritten = Vec::with_capacity(1 + HASH_LEN);
        rewritten.push(REWRITE_MARKER);
        rewritten.extend_from_slice(hash(raw).as_bytes());
        Ok(Self(rewritten))
    }

    /// The stored form of the key.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether this key is a hash rewrite of the client's original.
    pub fn is_rewritten(&self) -> bool {
        self.0[0] == REWRITE_MARKER
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_rewritten() {
            write!(f, "Key(rewritten {})", String::from_utf8_lossy(&self.0[1..9]))
        } else {
            write!(f, "Key({})", String::from_utf8_lossy(&self.0))
        }
    }
}
