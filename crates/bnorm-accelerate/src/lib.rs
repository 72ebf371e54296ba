//! Kernel selection, cache keys and launch orchestration for batch
//! normalization.
//!
//! A call site goes through three steps: a primitive descriptor
//! ([`BnormFwdPd`] / [`BnormBwdPd`]) validates the request and fixes the
//! compile-time record; the primitive ([`BnormFwd`] / [`BnormBwd`]) asks the
//! kernel provider for the resolved kernel set once; `execute` then binds
//! the run-time record and issues the stage launches in order.

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod kernels;
pub mod params;
pub mod pd;
pub mod primitive;
pub mod simple_provider;
pub mod telemetry;

pub use config::{configure_options, options, BnormOptions};
pub use error::{status_of, BnormError, BnormResult, Status};
pub use kernels::{resolve, KernelId, KernelSet, PipelineMode, ResolvedKernels};
pub use params::{BnormParams, BnormRuntimeParams, Direction, SerializedParams};
pub use pd::{BnormBwdPd, BnormFwdPd, ScratchKey, ScratchpadBooking};
pub use primitive::{BnormBwd, BnormFwd, BwdExecArgs, FwdExecArgs};
pub use simple_provider::{InProcessOptions, InProcessProvider};

/// Register the in-process provider unless a provider is already installed,
/// and make `options` the process-wide tunables.
pub fn initialize_provider_with(options: &BnormOptions) {
    configure_options(options.clone());

    if bnorm_accelerate_api::provider().is_some() {
        return;
    }

    let provider = simple_provider::register_inprocess_provider(
        InProcessOptions::from_bnorm_options(options),
    );
    log::info!(
        "bnorm: using {} (max subgroup {})",
        bnorm_accelerate_api::KernelProvider::device_info(provider),
        options.max_subgroup_size
    );
}

/// Initialize with options read from the environment.
pub fn initialize_provider() {
    initialize_provider_with(&BnormOptions::from_env());
}
