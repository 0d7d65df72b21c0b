use crate::hash::{is_hash_byte, Hash, HASH_LEN};

/// Scan a value for embedded hash mentions.
///
/// A mention is a maximal run of alphabet symbols of length exactly
/// [`HASH_LEN`], bounded on both sides by a non-alphabet byte or the
/// value boundary. Runs of any other length yield nothing: a 59- or
/// 61-symbol run is not a hash, and two adjacent hashes with no
/// separator between them fuse into a 120-symbol run that matches
/// neither.
///
/// The scan is conservative. False positives (60 alphabet symbols that
/// were never produced by [`crate::hash`]) are harmless: they extend
/// refcount chains for resources that do not exist.
pub fn scan_deps(data: &[u8]) -> Vec<Hash> {
    let mut out = Vec::new();
    let mut run_start: Option<usize> = None;
    for (i, &b) in data.iter().enumerate() {
        match (run_start, is_hash_byte(b)) {
            (None, true) => run_start = Some(i),
            (Some(start), false) => {
                push_if_hash(&mut out, &data[start..i]);
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = run_start {
        push_if_hash(&mut out, &data[start..]);
    }
    out
}

fn push_if_hash(out: &mut Vec<Hash>, run: &[u8]) {
    if run.len() == HASH_LEN {
        if let Some(h) = Hash::from_bytes(run) {
            out.push(h);
        }
    }
}
