use std::collections::hash_map::DefaultHasher;
use std::fmt::Write;
use std::hash::{Hash, Hasher};

/// Fingerprint of a serialized record plus the kernel names built from it.
/// Used for file names only; in-memory lookups compare the full key bytes.
pub fn compute_kernel_set_hash(key_bytes: &[u8], names: &[Option<&str>]) -> u64 {
    let mut hasher = DefaultHasher::new();
    key_bytes.hash(&mut hasher);
    names.hash(&mut hasher);
    hasher.finish()
}

pub fn hex_key(key_bytes: &[u8]) -> String {
    let mut out = String::with_capacity(key_bytes.len() * 2);
    for byte in key_bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
