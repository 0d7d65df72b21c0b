use std::fmt;
use std::str;

/// Length in bytes of a full content hash.
pub const HASH_LEN: usize = 60;

/// Length in bytes of the short lookup prefix (half the full hash).
pub const SHORT_LEN: usize = HASH_LEN / 2;

/// The 32-symbol base-32 alphabet used to render hashes.
///
/// Vowel-free ASCII consonants, lower then upper case. Being disjoint
/// from whitespace, digits, and punctuation makes embedded hashes
/// self-delimiting inside values that separate fields with any of those.
pub const ALPHABET: &[u8; 32] = b"bcdfghjklmnpqrstBCDFGHJKLMNPQRST";

/// Bytes of BLAKE3 extended output consumed per hash (300 bits used).
const RAW_LEN: usize = 38;

const fn build_membership() -> [bool; 256] {
    let mut table = [false; 256];
    let mut i = 0;
    while i < ALPHABET.len() {
        table[ALPHABET[i] as usize] = true;
        i += 1;
    }
    table
}

/// `IN_ALPHABET[b]` is true iff `b` is one of the 32 hash symbols.
pub(crate) const IN_ALPHABET: [bool; 256] = build_membership();

/// Returns true if `b` is a hash-alphabet symbol.
#[inline]
pub fn is_hash_byte(b: u8) -> bool {
    IN_ALPHABET[b as usize]
}

/// A full 60-byte content hash.
///
/// The first [`SHORT_LEN`] bytes form the [`ShortHash`] used as the
/// stowage lookup key; the remaining bytes are the suffix compared in
/// constant time on lookup.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; HASH_LEN]);

/// The 30-byte lookup prefix of a [`Hash`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShortHash([u8; SHORT_LEN]);

impl Hash {
    /// Wrap raw hash bytes. Returns `None` unless `bytes` is exactly
    /// [`HASH_LEN`] alphabet symbols.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != HASH_LEN || !bytes.iter().all(|&b| is_hash_byte(b)) {
            return None;
        }
        let mut arr = [0u8; HASH_LEN];
        arr.copy_from_slice(bytes);
        Some(Self(arr))
    }

    /// The raw 60 hash bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// The short lookup prefix (first half).
    pub fn short(&self) -> ShortHash {
        let mut arr = [0u8; SHORT_LEN];
        arr.copy_from_slice(&self.0[..SHORT_LEN]);
        ShortHash(arr)
    }

    /// The suffix (second half), compared in constant time on lookup.
    pub fn suffix(&self) -> &[u8] {
        &self.0[SHORT_LEN..]
    }

    /// The hash as text. Always valid ASCII by construction.
    pub fn as_str(&self) -> &str {
        str::from_utf8(&self.0).expect("hash bytes are ASCII")
    }
}

impl ShortHash {
    /// Wrap raw short-hash bytes. Returns `None` unless `bytes` is
    /// exactly [`SHORT_LEN`] alphabet symbols.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != SHORT_LEN || !bytes.iter().all(|&b| is_hash_byte(b)) {
            return None;
        }
        let mut arr = [0u8; SHORT_LEN];
        arr.copy_from_slice(bytes);
        Some(Self(arr))
    }

    /// The raw 30 prefix bytes.
    pub fn as_bytes(&self) -> &[u8; SHORT_LEN] {
        &self.0
    }

    /// The prefix as text.
    pub fn as_str(&self) -> &str {
        str::from_utf8(&self.0).expect("hash bytes are ASCII")
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}..)", &self.as_str()[..8])
    }
}

impl fmt::Display for ShortHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for ShortHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShortHash({}..)", &self.as_str()[..8])
    }
}

/// Hash arbitrary bytes into a [`Hash`].
///
/// BLAKE3 in extended-output mode supplies 38 bytes; the first 300 bits
/// are emitted as 60 base-32 symbols. Deterministic: identical input
/// always yields identical output.
pub fn hash(data: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(data);
    let mut raw = [0u8; RAW_LEN];
    hasher.finalize_xof().fill(&mut raw);
    Hash(encode_base32(&raw))
}

/// Pack the first 300 bits of `raw` into 60 alphabet symbols, 5 bits per
/// symbol, most significant bits first.
fn encode_base32(raw: &[u8; RAW_LEN]) -> [u8; HASH_LEN] {
    let mut out = [0u8; HASH_LEN];
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    let mut i = 0;
    for &byte in raw.iter() {
        acc = (acc << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 && i < HASH_LEN {
            bits -= 5;
            out[i] = ALPHABET[((acc >> bits) & 0x1f) as usize];
            i += 1;
        }
        if i == HASH_LEN {
            break;
        }
    }
    out
}
