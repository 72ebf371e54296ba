pub mod key;
pub mod persist;
pub mod registry;

pub use key::{compute_kernel_set_hash, hex_key};
pub use persist::{load_kernel_set_meta, persist_kernel_set_meta, KernelSetMeta, KERNEL_CACHE_VERSION};
pub use registry::KernelSetCache;
