//! Content hashing for the cask storage engine.
//!
//! Every stowed resource in cask is addressed by a fixed-width secure hash
//! of its bytes, rendered in a 32-symbol ASCII alphabet so that hashes can
//! be embedded *textually* inside other values and recovered by a
//! conservative scan. This crate provides:
//!
//! - [`Hash`] / [`ShortHash`] — the 60-byte hash and its 30-byte lookup
//!   prefix
//! - [`hash`] — BLAKE3-based content hashing into the base-32 alphabet
//! - [`scan_deps`] — the conservative scanner that finds hash mentions
//!   inside a value
//! - [`ct_eq`] — constant-time byte equality for suffix verification
//!
//! # Encoding
//!
//! A hash is 60 symbols drawn from `bcdfghjklmnpqrstBCDFGHJKLMNPQRST`
//! (32 consonants, upper and lower). The alphabet is deliberately
//! vowel-free and punctuation-free: hash text never forms words, never
//! collides with the whitespace or bracket separators callers use, and a
//! run of exactly 60 alphabet bytes bounded by non-alphabet bytes is
//! self-delimiting under [`scan_deps`].

pub mod ct;
pub mod hash;
pub mod scan;

pub use ct::ct_eq;
pub use hash::{hash, Hash, ShortHash, ALPHABET, HASH_LEN, SHORT_LEN};
pub use scan::scan_deps;
