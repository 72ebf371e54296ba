use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::key::hex_key;

/// Bump when kernel names, argument schemas or the define set change.
pub const KERNEL_CACHE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSetMeta {
    /// Hex image of the serialized compile-time record.
    pub key: String,
    pub record_bytes: usize,
    pub kernels: Vec<Option<String>>,
    pub device: String,
    /// Optional to allow reading older cache files; when absent, treat as incompatible.
    pub version: Option<u32>,
}

impl KernelSetMeta {
    pub fn new(key_bytes: &[u8], names: &[Option<&str>], device: &str) -> Self {
        Self {
            key: hex_key(key_bytes),
            record_bytes: key_bytes.len(),
            kernels: names.iter().map(|n| n.map(str::to_string)).collect(),
            device: device.to_string(),
            version: Some(KERNEL_CACHE_VERSION),
        }
    }
}

pub fn meta_path(cache_dir: &Path, hash_key: u64) -> PathBuf {
    cache_dir.join(format!("{hash_key:016x}.json"))
}

/// Best effort; a cache that cannot be written is logged and skipped.
pub fn persist_kernel_set_meta(cache_dir: &Path, hash_key: u64, meta: &KernelSetMeta) {
    if let Err(err) = std::fs::create_dir_all(cache_dir) {
        log::warn!("bnorm: cannot create kernel cache dir {}: {err}", cache_dir.display());
        return;
    }
    let path = meta_path(cache_dir, hash_key);
    match serde_json::to_vec_pretty(meta) {
        Ok(json) => {
            if let Err(err) = std::fs::write(&path, json) {
                log::warn!("bnorm: failed to persist {}: {err}", path.display());
            }
        }
        Err(err) => log::warn!("bnorm: failed to encode kernel set meta: {err}"),
    }
}

/// Metadata written by a compatible build, if present.
pub fn load_kernel_set_meta(cache_dir: &Path, hash_key: u64) -> Option<KernelSetMeta> {
    let bytes = std::fs::read(meta_path(cache_dir, hash_key)).ok()?;
    let meta: KernelSetMeta = serde_json::from_slice(&bytes).ok()?;
    if meta.version != Some(KERNEL_CACHE_VERSION) {
        log::debug!(
            "bnorm: ignoring kernel cache entry {hash_key:016x} with version {:?}",
            meta.version
        );
        return None;
    }
    Some(meta)
}
