use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::RwLock;

pub const DEFAULT_MAX_SUBGROUP: u32 = 32;
pub const DEFAULT_REDUCTION_CHUNK: u32 = 256;
/// Upper bound on local-reduction work-groups per channel.
pub const MAX_REDUCTION_CHUNKS: usize = 4096;

pub const ENV_MAX_SUBGROUP: &str = "BNORM_MAX_SUBGROUP";
pub const ENV_REDUCTION_CHUNK: &str = "BNORM_REDUCTION_CHUNK";
pub const ENV_KERNEL_CACHE_DIR: &str = "BNORM_KERNEL_CACHE_DIR";

/// Tunables that shape dispatch but never correctness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BnormOptions {
    /// Caps the subgroup width considered by the tiling menu, on top of the
    /// device limit.
    #[serde(default = "default_max_subgroup")]
    pub max_subgroup_size: u32,
    /// Reduction elements folded by one local-reduction work-group.
    #[serde(default = "default_reduction_chunk")]
    pub reduction_chunk: u32,
    /// Where kernel-set metadata is persisted; disabled when absent.
    #[serde(default)]
    pub kernel_cache_dir: Option<PathBuf>,
}

fn default_max_subgroup() -> u32 {
    DEFAULT_MAX_SUBGROUP
}

fn default_reduction_chunk() -> u32 {
    DEFAULT_REDUCTION_CHUNK
}

impl Default for BnormOptions {
    fn default() -> Self {
        Self {
            max_subgroup_size: DEFAULT_MAX_SUBGROUP,
            reduction_chunk: DEFAULT_REDUCTION_CHUNK,
            kernel_cache_dir: None,
        }
    }
}

impl BnormOptions {
    /// Defaults overridden by `BNORM_*` environment variables.
    pub fn from_env() -> Self {
        let mut opts = Self::default();
        if let Some(v) = env_u32(ENV_MAX_SUBGROUP) {
            opts.max_subgroup_size = v;
        }
        if let Some(v) = env_u32(ENV_REDUCTION_CHUNK) {
            opts.reduction_chunk = v;
        }
        if let Ok(dir) = std::env::var(ENV_KERNEL_CACHE_DIR) {
            let trimmed = dir.trim();
            if !trimmed.is_empty() {
                opts.kernel_cache_dir = Some(PathBuf::from(trimmed));
            }
        }
        opts
    }
}

fn env_u32(name: &str) -> Option<u32> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u32>() {
        Ok(parsed) if parsed > 0 => Some(parsed),
        _ => {
            log::warn!("bnorm: ignoring {name}={raw:?}; expected a positive integer");
            None
        }
    }
}

static OPTIONS: Lazy<RwLock<BnormOptions>> = Lazy::new(|| RwLock::new(BnormOptions::from_env()));

pub fn configure_options(options: BnormOptions) {
    if let Ok(mut guard) = OPTIONS.write() {
        *guard = options;
    }
}

pub fn options() -> BnormOptions {
    OPTIONS
        .read()
        .map(|guard| guard.clone())
        .unwrap_or_default()
}
