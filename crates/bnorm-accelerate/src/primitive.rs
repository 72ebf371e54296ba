//! Forward and backward primitives: kernel acquisition and the launch
//! sequence for one call.

use bnorm_accelerate_api::{
    GpuBufferHandle, KernelArg, KernelBuildRequest, KernelHandle, KernelProvider, NdRange,
    Submission,
};

use crate::dispatch::DispatchRuntimeParams;
use crate::error::{BnormError, BnormResult};
use crate::kernels::{resolve, KernelId, ResolvedKernels};
use crate::pd::{BnormBwdPd, BnormFwdPd, ScratchKey, ScratchpadBooking};

const F32_BYTES: usize = 4;

/// Caller buffers for one forward call.
#[derive(Debug, Clone, Copy)]
pub struct FwdExecArgs<'a> {
    pub src: &'a GpuBufferHandle,
    pub dst: &'a GpuBufferHandle,
    /// Output when training with computed statistics, input when supplied.
    pub mean: Option<&'a GpuBufferHandle>,
    pub variance: Option<&'a GpuBufferHandle>,
    pub scale: Option<&'a GpuBufferHandle>,
    pub shift: Option<&'a GpuBufferHandle>,
    /// Second addend of the norm+add+relu fusion.
    pub src_add: Option<&'a GpuBufferHandle>,
    pub workspace: Option<&'a GpuBufferHandle>,
}

impl<'a> FwdExecArgs<'a> {
    pub fn new(src: &'a GpuBufferHandle, dst: &'a GpuBufferHandle) -> Self {
        Self {
            src,
            dst,
            mean: None,
            variance: None,
            scale: None,
            shift: None,
            src_add: None,
            workspace: None,
        }
    }
}

/// Caller buffers for one backward call.
#[derive(Debug, Clone, Copy)]
pub struct BwdExecArgs<'a> {
    pub src: &'a GpuBufferHandle,
    pub mean: &'a GpuBufferHandle,
    pub variance: &'a GpuBufferHandle,
    pub diff_dst: &'a GpuBufferHandle,
    pub diff_src: &'a GpuBufferHandle,
    pub scale: Option<&'a GpuBufferHandle>,
    pub workspace: Option<&'a GpuBufferHandle>,
    pub diff_scale: Option<&'a GpuBufferHandle>,
    pub diff_shift: Option<&'a GpuBufferHandle>,
    pub diff_src_add: Option<&'a GpuBufferHandle>,
}

fn require<'a>(
    buffer: Option<&'a GpuBufferHandle>,
    bytes: usize,
    what: &str,
) -> BnormResult<&'a GpuBufferHandle> {
    let buffer =
        buffer.ok_or_else(|| BnormError::invalid_arguments(format!("{what} buffer is required")))?;
    check_size(buffer, bytes, what)?;
    Ok(buffer)
}

fn check_size(buffer: &GpuBufferHandle, bytes: usize, what: &str) -> BnormResult<()> {
    if buffer.bytes < bytes {
        return Err(BnormError::invalid_arguments(format!(
            "{what} buffer holds {} bytes, {bytes} required",
            buffer.bytes
        )));
    }
    Ok(())
}

/// Requests the resolved set from the provider and checks that the response
/// lines up slot for slot.
fn acquire_kernels(
    provider: &dyn KernelProvider,
    resolved: &ResolvedKernels,
) -> BnormResult<Vec<Option<KernelHandle>>> {
    let names = resolved.set.names();
    let request = KernelBuildRequest {
        cache_key: resolved.key.as_bytes(),
        defines: &resolved.defines,
    };
    let kernels = provider
        .build_kernels(&names, &request)
        .map_err(BnormError::Device)?;
    if kernels.len() != names.len() {
        return Err(BnormError::unsupported(format!(
            "provider returned {} kernels for {} slots",
            kernels.len(),
            names.len()
        )));
    }
    for (slot, (name, kernel)) in names.iter().zip(&kernels).enumerate() {
        match (name, kernel) {
            (None, None) => {}
            (Some(want), Some(k)) if k.name() == *want => {}
            (want, got) => {
                return Err(BnormError::unsupported(format!(
                    "slot {slot}: requested {want:?}, provider returned {:?}",
                    got.as_ref().map(|k| k.name().to_string())
                )))
            }
        }
    }
    Ok(kernels)
}

/// Scratch buffers for one call, released when dropped. Declared before the
/// launcher so the submission is finished or dropped first.
struct Scratch<'p> {
    provider: &'p dyn KernelProvider,
    buffers: Vec<(ScratchKey, GpuBufferHandle)>,
}

impl<'p> Scratch<'p> {
    fn alloc(provider: &'p dyn KernelProvider, booking: &ScratchpadBooking) -> BnormResult<Self> {
        let mut scratch = Scratch {
            provider,
            buffers: Vec::new(),
        };
        for (key, bytes) in booking.iter() {
            let handle = provider.alloc(bytes).map_err(BnormError::Device)?;
            scratch.buffers.push((key, handle));
        }
        Ok(scratch)
    }

    fn get(&self, key: ScratchKey) -> BnormResult<&GpuBufferHandle> {
        self.buffers
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, h)| h)
            .ok_or_else(|| BnormError::unsupported(format!("scratch {key:?} was not booked")))
    }
}

impl Drop for Scratch<'_> {
    fn drop(&mut self) {
        for (key, handle) in self.buffers.drain(..) {
            if let Err(err) = self.provider.free(&handle) {
                log::warn!("bnorm: failed to release scratch {key:?}: {err}");
            }
        }
    }
}

/// One submission worth of launches against a resolved kernel set.
struct Launcher<'s, 'k> {
    submission: Box<dyn Submission + 's>,
    resolved: &'k ResolvedKernels,
    kernels: &'k [Option<KernelHandle>],
    rt: KernelArg,
}

impl Launcher<'_, '_> {
    fn launch(
        &mut self,
        id: KernelId,
        dispatch: &DispatchRuntimeParams,
        mut args: Vec<KernelArg>,
    ) -> BnormResult<()> {
        let kernels = self.kernels;
        let kernel = self
            .resolved
            .set
            .slot_of(id)
            .and_then(|slot| kernels.get(slot))
            .and_then(Option::as_ref)
            .ok_or_else(|| BnormError::unsupported(format!("{id} is not part of the kernel set")))?;
        let range: NdRange = dispatch.nd_range();
        log::trace!("bnorm: enqueue {id} gws={:?} lws={:?}", dispatch.gws, dispatch.lws);
        args.push(self.rt.clone());
        self.submission
            .enqueue(kernel, &range, &args)
            .map_err(|err| {
                log::debug!("bnorm: {id} failed, aborting remaining stages");
                BnormError::Device(err)
            })
    }

    fn finish(self) -> BnormResult<()> {
        self.submission.finish().map_err(BnormError::Device)
    }
}

fn buf(handle: &GpuBufferHandle) -> KernelArg {
    KernelArg::Buffer(handle.clone())
}

fn opt(handle: Option<&GpuBufferHandle>) -> KernelArg {
    KernelArg::buffer(handle)
}

pub struct BnormFwd {
    pd: BnormFwdPd,
    resolved: ResolvedKernels,
    kernels: Option<Vec<Option<KernelHandle>>>,
}

impl BnormFwd {
    pub fn new(pd: BnormFwdPd) -> Self {
        let resolved = resolve(pd.conf());
        Self {
            pd,
            resolved,
            kernels: None,
        }
    }

    pub fn pd(&self) -> &BnormFwdPd {
        &self.pd
    }

    pub fn resolved(&self) -> &ResolvedKernels {
        &self.resolved
    }

    pub fn kernels(&self) -> Option<&[Option<KernelHandle>]> {
        self.kernels.as_deref()
    }

    pub fn build_kernels(&mut self, provider: &dyn KernelProvider) -> BnormResult<()> {
        if self.pd.has_zero_dim_memory() {
            log::trace!("bnorm fwd: zero-sized operand, no kernels needed");
            return Ok(());
        }
        self.kernels = Some(acquire_kernels(provider, &self.resolved)?);
        Ok(())
    }

    fn check_args(&self, args: &FwdExecArgs<'_>) -> BnormResult<()> {
        let pd = &self.pd;
        let conf = pd.conf();
        let data_bytes = pd.src_md().size_in_bytes();
        let stat_bytes = pd.src_md().channels() * F32_BYTES;
        check_size(args.src, data_bytes, "src")?;
        check_size(args.dst, data_bytes, "dst")?;
        if conf.is_training() || !conf.calculate_stats() {
            require(args.mean, stat_bytes, "mean")?;
            require(args.variance, stat_bytes, "variance")?;
        }
        if conf.use_scale() {
            require(args.scale, stat_bytes, "scale")?;
        }
        if conf.use_shift() {
            require(args.shift, stat_bytes, "shift")?;
        }
        if conf.fuse_norm_add_relu() {
            require(args.src_add, data_bytes, "src_add")?;
        }
        if let Some(ws) = pd.workspace() {
            require(args.workspace, ws.bytes, "workspace")?;
        }
        Ok(())
    }

    pub fn execute(&self, provider: &dyn KernelProvider, args: &FwdExecArgs<'_>) -> BnormResult<()> {
        if self.pd.has_zero_dim_memory() {
            log::trace!("bnorm fwd: zero-sized operand, nothing to launch");
            return Ok(());
        }
        let kernels = self
            .kernels
            .as_deref()
            .ok_or_else(|| BnormError::invalid_arguments("kernels have not been built"))?;
        self.check_args(args)?;

        let conf = self.pd.conf();
        let rt = self.pd.rt_conf();
        let scratch = Scratch::alloc(provider, self.pd.scratchpad())?;
        let mut launcher = Launcher {
            submission: provider.begin_submission().map_err(BnormError::Device)?,
            resolved: &self.resolved,
            kernels,
            rt: KernelArg::Bytes(rt.to_bytes()),
        };

        let (mean, variance) = if !conf.calculate_stats() || conf.is_training() {
            (
                require(args.mean, 0, "mean")?,
                require(args.variance, 0, "variance")?,
            )
        } else {
            (scratch.get(ScratchKey::Mean)?, scratch.get(ScratchKey::Variance)?)
        };

        if conf.calculate_stats() {
            let partials = scratch.get(ScratchKey::StatPartials)?;
            let partials_sq = scratch.get(ScratchKey::StatPartialsSq)?;
            launcher.launch(
                KernelId::CalcMean,
                &rt.calc_stat_params,
                vec![buf(args.src), buf(partials)],
            )?;
            launcher.launch(
                KernelId::CalcVariance,
                &rt.calc_stat_params,
                vec![buf(args.src), buf(partials_sq)],
            )?;
            launcher.launch(
                KernelId::ReduceMean,
                &rt.reduce_stat_params,
                vec![buf(partials), buf(mean)],
            )?;
            launcher.launch(
                KernelId::ReduceVariance,
                &rt.reduce_stat_params,
                vec![buf(partials_sq), buf(mean), buf(variance)],
            )?;
        }
        launcher.launch(
            KernelId::Fwd,
            &rt.gws_params,
            vec![
                buf(args.src),
                buf(mean),
                buf(variance),
                opt(args.scale),
                opt(args.shift),
                opt(args.src_add),
                buf(args.dst),
                opt(args.workspace),
            ],
        )?;
        launcher.finish()
    }
}

pub struct BnormBwd {
    pd: BnormBwdPd,
    resolved: ResolvedKernels,
    kernels: Option<Vec<Option<KernelHandle>>>,
}

impl BnormBwd {
    pub fn new(pd: BnormBwdPd) -> Self {
        let resolved = resolve(pd.conf());
        Self {
            pd,
            resolved,
            kernels: None,
        }
    }

    pub fn pd(&self) -> &BnormBwdPd {
        &self.pd
    }

    pub fn resolved(&self) -> &ResolvedKernels {
        &self.resolved
    }

    pub fn kernels(&self) -> Option<&[Option<KernelHandle>]> {
        self.kernels.as_deref()
    }

    pub fn build_kernels(&mut self, provider: &dyn KernelProvider) -> BnormResult<()> {
        if self.pd.has_zero_dim_memory() {
            log::trace!("bnorm bwd: zero-sized operand, no kernels needed");
            return Ok(());
        }
        self.kernels = Some(acquire_kernels(provider, &self.resolved)?);
        Ok(())
    }

    fn check_args(&self, args: &BwdExecArgs<'_>) -> BnormResult<()> {
        let pd = &self.pd;
        let conf = pd.conf();
        let data_bytes = pd.src_md().size_in_bytes();
        let stat_bytes = pd.src_md().channels() * F32_BYTES;
        check_size(args.src, data_bytes, "src")?;
        check_size(args.diff_dst, data_bytes, "diff_dst")?;
        check_size(args.diff_src, data_bytes, "diff_src")?;
        check_size(args.mean, stat_bytes, "mean")?;
        check_size(args.variance, stat_bytes, "variance")?;
        if conf.use_scale() {
            require(args.scale, stat_bytes, "scale")?;
            require(args.diff_scale, stat_bytes, "diff_scale")?;
        }
        if conf.use_shift() {
            require(args.diff_shift, stat_bytes, "diff_shift")?;
        }
        if conf.fuse_norm_add_relu() {
            require(args.diff_src_add, data_bytes, "diff_src_add")?;
        }
        if let Some(ws) = pd.workspace() {
            require(args.workspace, ws.bytes, "workspace")?;
        }
        Ok(())
    }

    pub fn execute(&self, provider: &dyn KernelProvider, args: &BwdExecArgs<'_>) -> BnormResult<()> {
        if self.pd.has_zero_dim_memory() {
            log::trace!("bnorm bwd: zero-sized operand, nothing to launch");
            return Ok(());
        }
        let kernels = self
            .kernels
            .as_deref()
            .ok_or_else(|| BnormError::invalid_arguments("kernels have not been built"))?;
        self.check_args(args)?;

        let conf = self.pd.conf();
        let rt = self.pd.rt_conf();
        let scratch = Scratch::alloc(provider, self.pd.scratchpad())?;
        let diff_scale = match args.diff_scale.filter(|_| conf.use_scale()) {
            Some(h) => h,
            None => scratch.get(ScratchKey::DiffScale)?,
        };
        let diff_shift = match args.diff_shift.filter(|_| conf.use_shift()) {
            Some(h) => h,
            None => scratch.get(ScratchKey::DiffShift)?,
        };
        let grad_partials = scratch.get(ScratchKey::GradPartials)?;

        let mut launcher = Launcher {
            submission: provider.begin_submission().map_err(BnormError::Device)?,
            resolved: &self.resolved,
            kernels,
            rt: KernelArg::Bytes(rt.to_bytes()),
        };
        launcher.launch(
            KernelId::CalcStats,
            &rt.calc_stat_params,
            vec![
                buf(args.src),
                buf(args.mean),
                buf(args.diff_dst),
                opt(args.workspace),
                buf(grad_partials),
            ],
        )?;
        launcher.launch(
            KernelId::ReduceStats,
            &rt.reduce_stat_params,
            vec![
                buf(grad_partials),
                buf(args.variance),
                buf(diff_scale),
                buf(diff_shift),
            ],
        )?;
        launcher.launch(
            KernelId::Bwd,
            &rt.gws_params,
            vec![
                buf(args.src),
                buf(args.mean),
                buf(args.variance),
                buf(args.diff_dst),
                opt(args.scale),
                opt(args.workspace),
                buf(diff_scale),
                buf(diff_shift),
                buf(args.diff_src),
                opt(args.diff_src_add),
            ],
        )?;
        launcher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simple_provider::InProcessProvider;
    use bnorm_accelerate_api::{BatchNormDesc, DataType, MemoryDesc, MemoryLayout, NormFlags, PropKind};

    fn training_pd(provider: &InProcessProvider) -> BnormFwdPd {
        let src = MemoryDesc::new(DataType::F32, &[2, 4, 3], MemoryLayout::Plain);
        let desc = BatchNormDesc::forward(PropKind::ForwardTraining, src, NormFlags::default(), 1e-5);
        BnormFwdPd::init(&desc, provider).unwrap()
    }

    #[test]
    fn execute_before_build_is_rejected() {
        let provider = InProcessProvider::default();
        let prim = BnormFwd::new(training_pd(&provider));
        let src = provider.alloc(96).unwrap();
        let err = prim
            .execute(&provider, &FwdExecArgs::new(&src, &src))
            .unwrap_err();
        assert!(matches!(err, BnormError::InvalidArguments(_)));
    }

    #[test]
    fn missing_statistics_buffers_are_rejected_before_launch() {
        let provider = InProcessProvider::default();
        let mut prim = BnormFwd::new(training_pd(&provider));
        prim.build_kernels(&provider).unwrap();
        let src = provider.alloc(96).unwrap();
        let dst = provider.alloc(96).unwrap();
        let err = prim
            .execute(&provider, &FwdExecArgs::new(&src, &dst))
            .unwrap_err();
        assert!(matches!(err, BnormError::InvalidArguments(_)));
        assert!(provider.launch_log().is_empty());
        assert_eq!(provider.live_buffers(), 2);
    }

    #[test]
    fn undersized_buffers_are_rejected() {
        let provider = InProcessProvider::default();
        let mut prim = BnormFwd::new(training_pd(&provider));
        prim.build_kernels(&provider).unwrap();
        let src = provider.alloc(8).unwrap();
        let dst = provider.alloc(96).unwrap();
        assert!(prim
            .execute(&provider, &FwdExecArgs::new(&src, &dst))
            .is_err());
    }
}
