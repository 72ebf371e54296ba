//! Primitive descriptors: validation and record construction.
//!
//! A descriptor either comes back fully formed (compile-time record, run-time
//! record, workspace and scratchpad booked) or fails with
//! [`BnormError::Unsupported`] before anything touches the device.

use bnorm_accelerate_api::{
    BatchNormDesc, DataType, DeviceCapability, EltwiseAlg, KernelProvider, MemoryDesc,
    MemoryLayout, PostOp, WorkspaceDesc,
};
use serde::Serialize;

use crate::config::{self, BnormOptions};
use crate::dispatch::{
    all_dims_mask, round_up, select_reduce_tile, select_tile, stage_params, DIM_IC,
    MAX_TILE_CHANNEL_BLOCK,
};
use crate::error::{BnormError, BnormResult};
use crate::params::{BnormParams, BnormRuntimeParams, Direction};

const F32_BYTES: usize = 4;

fn ensure(ok: bool, what: &str) -> BnormResult<()> {
    if ok {
        Ok(())
    } else {
        log::debug!("bnorm: rejected descriptor: {what}");
        Err(BnormError::unsupported(what))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ScratchKey {
    /// Per-chunk channel sums.
    StatPartials,
    /// Per-chunk channel sums of squares.
    StatPartialsSq,
    /// Mean computed in inference mode, where it is not an output.
    Mean,
    Variance,
    /// Per-chunk `sum((x - mean) * dy)` followed by per-chunk `sum(dy)`.
    GradPartials,
    /// Gradients the main backward kernel needs even when not requested.
    DiffScale,
    DiffShift,
}

/// Auxiliary device memory a call needs, sized from run-time dims.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScratchpadBooking {
    entries: Vec<(ScratchKey, usize)>,
}

impl ScratchpadBooking {
    fn book(&mut self, key: ScratchKey, bytes: usize) {
        if bytes > 0 {
            self.entries.push((key, bytes));
        }
    }

    pub fn size(&self, key: ScratchKey) -> Option<usize> {
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, bytes)| *bytes)
    }

    pub fn total_bytes(&self) -> usize {
        self.entries.iter().map(|(_, bytes)| bytes).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ScratchKey, usize)> + '_ {
        self.entries.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolve `Any` layouts the way callers expect: plain by default, outputs
/// follow their inputs.
fn with_default_layout(md: &MemoryDesc, fallback: MemoryLayout) -> MemoryDesc {
    let mut md = md.clone();
    if !md.layout.is_defined() {
        md.layout = fallback;
    }
    md
}

fn relu_post_op(op: &PostOp) -> Option<f32> {
    match op {
        PostOp::Eltwise {
            alg: EltwiseAlg::Relu,
            alpha,
            beta,
        } if *beta == 0.0 => Some(*alpha),
        _ => None,
    }
}

/// Exactly one relu post-op; leaky slopes are not differentiable through the
/// saved mask, so training only accepts a zero slope.
fn with_relu_post_op(desc: &BatchNormDesc, is_training: bool) -> bool {
    match desc.attr.post_ops.as_slice() {
        [op] => relu_post_op(op).is_some_and(|alpha| !is_training || alpha == 0.0),
        _ => false,
    }
}

fn check_scale_shift_data_type(desc: &BatchNormDesc) -> bool {
    let flags = desc.flags;
    !(flags.use_scale || flags.use_shift) || desc.scale_shift_dtype == DataType::F32
}

fn max_subgroup(engine: &dyn KernelProvider, opts: &BnormOptions) -> u32 {
    engine
        .max_subgroup_size()
        .min(opts.max_subgroup_size)
        .max(1)
}

/// Bytes of the largest per-element buffer a call can need: channels padded
/// to the widest block any stage may pick, at four bytes per element. `None`
/// when that does not fit in `isize`.
fn checked_footprint(src: &MemoryDesc) -> Option<usize> {
    let block = src.layout.channel_block().max(MAX_TILE_CHANNEL_BLOCK);
    let padded_ic = src.channels().checked_next_multiple_of(block)?;
    let elems = src
        .dims
        .iter()
        .skip(2)
        .try_fold(src.mb().checked_mul(padded_ic)?, |acc, &d| acc.checked_mul(d))?;
    elems
        .checked_mul(F32_BYTES.max(src.dtype.size_in_bytes()))
        .filter(|&bytes| bytes <= isize::MAX as usize)
}

/// Flags plus per-stage tiling; everything but the fusion bits.
fn init_conf(
    src: &MemoryDesc,
    direction: Direction,
    engine: &dyn KernelProvider,
    opts: &BnormOptions,
) -> BnormResult<BnormParams> {
    ensure(
        (2..=crate::dispatch::MAX_NDIMS).contains(&src.ndims()),
        "tensor rank must be between 2 and 5",
    )?;
    ensure(
        checked_footprint(src).is_some(),
        "tensor size overflows the address space",
    )?;
    if let MemoryLayout::Blocked { channel_block } = src.layout {
        ensure(
            channel_block.is_power_of_two(),
            "blocked layout needs a power-of-two channel block",
        )?;
    }
    let max_sg = max_subgroup(engine, opts);
    let tile = select_tile(src.layout, src.channels(), max_sg);
    let reduce_tile = select_reduce_tile(max_sg);
    let dtype = src.dtype;

    let mut conf = BnormParams::new(dtype, direction);
    let all_dims = all_dims_mask(src.ndims());
    conf.calc_stat_params = stage_params(&tile, src.layout, all_dims);
    conf.reduce_stat_params = stage_params(&reduce_tile, src.layout, 1 << DIM_IC);
    conf.gws_params = stage_params(&tile, src.layout, all_dims);
    Ok(conf)
}

fn workspace_desc(conf: &BnormParams, src: &MemoryDesc) -> WorkspaceDesc {
    let ws_ic = round_up(src.channels(), conf.workspace_channel_block());
    let mut dims = src.dims.clone();
    if let Some(c) = dims.get_mut(1) {
        *c = ws_ic;
    }
    let bytes = src.mb() * ws_ic * src.spatial();
    WorkspaceDesc {
        dims,
        layout: src.layout,
        bytes,
    }
}

/// Forward primitive descriptor.
#[derive(Debug, Clone)]
pub struct BnormFwdPd {
    desc: BatchNormDesc,
    src_md: MemoryDesc,
    conf: BnormParams,
    rt_conf: BnormRuntimeParams,
    workspace: Option<WorkspaceDesc>,
    scratchpad: ScratchpadBooking,
    opts: BnormOptions,
}

impl BnormFwdPd {
    pub fn init(desc: &BatchNormDesc, engine: &dyn KernelProvider) -> BnormResult<Self> {
        Self::init_with(desc, engine, &config::options())
    }

    pub fn init_with(
        desc: &BatchNormDesc,
        engine: &dyn KernelProvider,
        opts: &BnormOptions,
    ) -> BnormResult<Self> {
        let flags = desc.flags;
        let is_training = desc.is_training();
        let src_dt = desc.src.dtype;

        ensure(desc.is_fwd(), "forward descriptor expected")?;
        ensure(
            matches!(
                src_dt,
                DataType::F32 | DataType::Bf16 | DataType::F16 | DataType::S8
            ),
            "source data type must be f32, bf16, f16 or s8",
        )?;
        ensure(
            src_dt != DataType::F16 || engine.supports(DeviceCapability::Fp16),
            "f16 requires device fp16 support",
        )?;
        let dst = desc
            .dst
            .as_ref()
            .ok_or_else(|| BnormError::unsupported("forward descriptor without destination"))?;
        ensure(
            src_dt == dst.dtype,
            "source and destination data types differ",
        )?;
        ensure(
            src_dt != DataType::S8 || (!is_training && flags.use_global_stats),
            "s8 requires inference with caller-supplied statistics",
        )?;
        ensure(
            check_scale_shift_data_type(desc),
            "scale and shift must be f32",
        )?;
        ensure(
            desc.attr.has_default_values_except_post_ops(),
            "only post-op attributes are supported",
        )?;
        ensure(
            desc.attr.has_default_values() || with_relu_post_op(desc, is_training),
            "post-ops must be a single relu compatible with the propagation kind",
        )?;
        ensure(
            !(flags.fuse_norm_relu && flags.fuse_norm_add_relu),
            "norm+relu and norm+add+relu fusions are exclusive",
        )?;

        let src_md = with_default_layout(&desc.src, MemoryLayout::Plain);
        let dst_md = with_default_layout(dst, src_md.layout);
        ensure(src_md == dst_md, "source and destination memory differ")?;
        ensure(
            engine.supports(DeviceCapability::Subgroups),
            "device lacks subgroup support",
        )?;

        let post_op_slope = desc
            .attr
            .post_ops
            .first()
            .and_then(relu_post_op);
        let relu_negative_slope = post_op_slope.unwrap_or(0.0);
        let fused = flags.fuse_norm_relu || flags.fuse_norm_add_relu;

        let mut conf = init_conf(&src_md, Direction::Forward, engine, opts)?;
        conf.set_flags(
            flags.use_scale,
            flags.use_shift,
            is_training,
            !flags.use_global_stats,
        );
        conf.set_fusion(
            flags.fuse_norm_relu,
            flags.fuse_norm_add_relu,
            fused || post_op_slope.is_some(),
            post_op_slope.is_some_and(|alpha| alpha != 0.0),
        );

        let workspace = (is_training && fused).then(|| workspace_desc(&conf, &src_md));
        let rt_conf =
            BnormRuntimeParams::new(&conf, &src_md, desc.epsilon, relu_negative_slope, opts);

        let mut pd = Self {
            desc: desc.clone(),
            src_md,
            conf,
            rt_conf,
            workspace,
            scratchpad: ScratchpadBooking::default(),
            opts: opts.clone(),
        };
        pd.init_scratchpad();
        log::trace!(
            "bnorm fwd: dtype={src_dt} training={is_training} calc_stats={} ws={:?} scratch={}B",
            pd.conf.calculate_stats(),
            pd.workspace.as_ref().map(|ws| ws.bytes),
            pd.scratchpad.total_bytes()
        );
        Ok(pd)
    }

    fn init_scratchpad(&mut self) {
        if !self.conf.calculate_stats() {
            return;
        }
        let stat_ic = self.rt_conf.stat_ic as usize;
        let partials = self.rt_conf.num_reduction_chunks() * stat_ic * F32_BYTES;
        self.scratchpad.book(ScratchKey::StatPartials, partials);
        self.scratchpad.book(ScratchKey::StatPartialsSq, partials);
        if !self.conf.is_training() {
            self.scratchpad.book(ScratchKey::Mean, stat_ic * F32_BYTES);
            self.scratchpad.book(ScratchKey::Variance, stat_ic * F32_BYTES);
        }
    }

    pub fn desc(&self) -> &BatchNormDesc {
        &self.desc
    }

    pub fn src_md(&self) -> &MemoryDesc {
        &self.src_md
    }

    pub fn conf(&self) -> &BnormParams {
        &self.conf
    }

    pub fn rt_conf(&self) -> &BnormRuntimeParams {
        &self.rt_conf
    }

    pub fn workspace(&self) -> Option<&WorkspaceDesc> {
        self.workspace.as_ref()
    }

    pub fn scratchpad(&self) -> &ScratchpadBooking {
        &self.scratchpad
    }

    pub fn has_zero_dim_memory(&self) -> bool {
        self.desc.has_zero_dim_memory()
    }

    /// Options the descriptor was built with.
    pub fn options(&self) -> &BnormOptions {
        &self.opts
    }

    /// Rebuild only the run-time record for a new shape, under the same
    /// options. The compile-time record is kept, so the new shape must not
    /// change it.
    pub fn with_runtime_shape(
        &self,
        src: &MemoryDesc,
        engine: &dyn KernelProvider,
    ) -> BnormResult<Self> {
        let mut desc = self.desc.clone();
        desc.src = src.clone();
        desc.dst = Some(src.clone());
        let next = Self::init_with(&desc, engine, &self.opts)?;
        ensure(
            next.conf == self.conf,
            "new shape changes the compile-time configuration",
        )?;
        Ok(next)
    }
}

/// Backward primitive descriptor.
#[derive(Debug, Clone)]
pub struct BnormBwdPd {
    desc: BatchNormDesc,
    src_md: MemoryDesc,
    conf: BnormParams,
    rt_conf: BnormRuntimeParams,
    workspace: Option<WorkspaceDesc>,
    scratchpad: ScratchpadBooking,
    opts: BnormOptions,
}

impl BnormBwdPd {
    pub fn init(
        desc: &BatchNormDesc,
        hint_fwd: Option<&BnormFwdPd>,
        engine: &dyn KernelProvider,
    ) -> BnormResult<Self> {
        Self::init_with(desc, hint_fwd, engine, &config::options())
    }

    pub fn init_with(
        desc: &BatchNormDesc,
        hint_fwd: Option<&BnormFwdPd>,
        engine: &dyn KernelProvider,
        opts: &BnormOptions,
    ) -> BnormResult<Self> {
        let flags = desc.flags;
        let src_dt = desc.src.dtype;

        ensure(!desc.is_fwd(), "backward descriptor expected")?;
        ensure(
            matches!(src_dt, DataType::F32 | DataType::Bf16 | DataType::F16),
            "source data type must be f32, bf16 or f16",
        )?;
        ensure(
            src_dt != DataType::F16 || engine.supports(DeviceCapability::Fp16),
            "f16 requires device fp16 support",
        )?;
        let (diff_src, diff_dst) = match (desc.diff_src.as_ref(), desc.diff_dst.as_ref()) {
            (Some(ds), Some(dd)) => (ds, dd),
            _ => return Err(BnormError::unsupported("backward descriptor without gradients")),
        };
        ensure(
            src_dt == diff_src.dtype && diff_src.dtype == diff_dst.dtype,
            "source and gradient data types differ",
        )?;
        ensure(
            check_scale_shift_data_type(desc),
            "scale and shift must be f32",
        )?;
        ensure(
            desc.attr.has_default_values(),
            "backward does not take attributes",
        )?;
        ensure(
            !(flags.fuse_norm_relu && flags.fuse_norm_add_relu),
            "norm+relu and norm+add+relu fusions are exclusive",
        )?;

        let src_md = with_default_layout(&desc.src, MemoryLayout::Plain);
        let diff_dst_md = with_default_layout(diff_dst, src_md.layout);
        let diff_src_md = with_default_layout(diff_src, diff_dst_md.layout);
        ensure(
            diff_src_md == diff_dst_md,
            "gradient memory descriptors differ",
        )?;
        ensure(
            src_md.dims == diff_dst_md.dims,
            "source and gradient shapes differ",
        )?;

        let fused = flags.fuse_norm_relu || flags.fuse_norm_add_relu;
        let mut conf = init_conf(&src_md, Direction::Backward, engine, opts)?;
        conf.set_flags(
            flags.use_scale,
            flags.use_shift,
            false,
            !flags.use_global_stats,
        );
        conf.set_fusion(flags.fuse_norm_relu, flags.fuse_norm_add_relu, fused, false);

        // A fused backward needs the forward mask; an unfused one must not be
        // paired with a forward that wrote one.
        let workspace = fused.then(|| workspace_desc(&conf, &src_md));
        if fused || hint_fwd.is_some() {
            ensure(
                hint_fwd.and_then(BnormFwdPd::workspace) == workspace.as_ref(),
                "workspace does not match the forward hint",
            )?;
        }

        let rt_conf = BnormRuntimeParams::new(&conf, &src_md, desc.epsilon, 0.0, opts);
        let mut pd = Self {
            desc: desc.clone(),
            src_md,
            conf,
            rt_conf,
            workspace,
            scratchpad: ScratchpadBooking::default(),
            opts: opts.clone(),
        };
        pd.init_scratchpad();
        log::trace!(
            "bnorm bwd: dtype={src_dt} ws={:?} scratch={}B",
            pd.workspace.as_ref().map(|ws| ws.bytes),
            pd.scratchpad.total_bytes()
        );
        Ok(pd)
    }

    fn init_scratchpad(&mut self) {
        let stat_ic = self.rt_conf.stat_ic as usize;
        let partials = 2 * self.rt_conf.num_reduction_chunks() * stat_ic * F32_BYTES;
        self.scratchpad.book(ScratchKey::GradPartials, partials);
        if !self.conf.use_scale() {
            self.scratchpad.book(ScratchKey::DiffScale, stat_ic * F32_BYTES);
        }
        if !self.conf.use_shift() {
            self.scratchpad.book(ScratchKey::DiffShift, stat_ic * F32_BYTES);
        }
    }

    pub fn desc(&self) -> &BatchNormDesc {
        &self.desc
    }

    pub fn src_md(&self) -> &MemoryDesc {
        &self.src_md
    }

    pub fn conf(&self) -> &BnormParams {
        &self.conf
    }

    pub fn rt_conf(&self) -> &BnormRuntimeParams {
        &self.rt_conf
    }

    pub fn workspace(&self) -> Option<&WorkspaceDesc> {
        self.workspace.as_ref()
    }

    pub fn scratchpad(&self) -> &ScratchpadBooking {
        &self.scratchpad
    }

    pub fn has_zero_dim_memory(&self) -> bool {
        self.desc.has_zero_dim_memory()
    }

    pub fn options(&self) -> &BnormOptions {
        &self.opts
    }
}
