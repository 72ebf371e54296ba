use anyhow::{anyhow, bail, Result};
use bnorm_accelerate_api::{
    CompiledKernel, DataType, DeviceCapability, GpuBufferHandle, KernelArg, KernelBuildRequest,
    KernelHandle, KernelProvider, MemoryLayout, NdRange, Submission,
};
use once_cell::sync::OnceCell;
use std::any::Any;
use std::collections::HashMap;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::cache::{compute_kernel_set_hash, persist_kernel_set_meta, KernelSetCache, KernelSetMeta};
use crate::config::BnormOptions;
use crate::dispatch::round_up;
use crate::kernels::KernelId;
use crate::params::{BnormParams, BnormRuntimeParams};
use crate::telemetry::{BnormTelemetry, BnormTelemetrySnapshot};

const DEVICE_NAME: &str = "in-process host reference";

#[derive(Debug, Clone)]
pub struct InProcessOptions {
    pub capabilities: Vec<DeviceCapability>,
    pub max_subgroup_size: u32,
    /// Kernel-set metadata is written here on every compile when set.
    pub cache_dir: Option<PathBuf>,
}

impl Default for InProcessOptions {
    fn default() -> Self {
        Self {
            capabilities: vec![DeviceCapability::Fp16, DeviceCapability::Subgroups],
            max_subgroup_size: 16,
            cache_dir: None,
        }
    }
}

impl InProcessOptions {
    pub fn from_bnorm_options(options: &BnormOptions) -> Self {
        Self {
            cache_dir: options.kernel_cache_dir.clone(),
            ..Self::default()
        }
    }
}

/// A "compiled" kernel: the stage identity plus the decoded record it was
/// built from.
#[derive(Debug)]
struct HostKernel {
    id: KernelId,
    conf: BnormParams,
}

impl CompiledKernel for HostKernel {
    fn name(&self) -> &str {
        self.id.name()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

type KernelList = Vec<Option<KernelHandle>>;

pub struct InProcessProvider {
    options: InProcessOptions,
    next_id: AtomicU64,
    buffers: Mutex<HashMap<u64, Vec<u8>>>,
    kernel_sets: KernelSetCache<KernelList>,
    launch_log: Mutex<Vec<String>>,
    telemetry: BnormTelemetry,
}

impl InProcessProvider {
    pub fn new(options: InProcessOptions) -> Self {
        Self {
            options,
            next_id: AtomicU64::new(1),
            buffers: Mutex::new(HashMap::new()),
            kernel_sets: KernelSetCache::new(),
            launch_log: Mutex::new(Vec::new()),
            telemetry: BnormTelemetry::new(),
        }
    }

    pub fn options(&self) -> &InProcessOptions {
        &self.options
    }

    fn buffers(&self) -> Result<MutexGuard<'_, HashMap<u64, Vec<u8>>>> {
        self.buffers
            .lock()
            .map_err(|_| anyhow!("in-process buffer registry poisoned"))
    }

    pub fn upload_f32(&self, data: &[f32]) -> Result<GpuBufferHandle> {
        let handle = self.alloc(data.len() * 4)?;
        self.write_f32(&handle, data)?;
        Ok(handle)
    }

    pub fn write_f32(&self, handle: &GpuBufferHandle, data: &[f32]) -> Result<()> {
        let mut buffers = self.buffers()?;
        store_f32(&mut buffers, handle.buffer_id, data)
    }

    pub fn download_f32(&self, handle: &GpuBufferHandle) -> Result<Vec<f32>> {
        Ok(to_f32s(&self.download_bytes(handle)?))
    }

    pub fn download_bytes(&self, handle: &GpuBufferHandle) -> Result<Vec<u8>> {
        let buffers = self.buffers()?;
        buffers
            .get(&handle.buffer_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown buffer {}", handle.buffer_id))
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.lock().map(|b| b.len()).unwrap_or(0)
    }

    /// Kernel names in the order they were launched.
    pub fn launch_log(&self) -> Vec<String> {
        self.launch_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    pub fn clear_launch_log(&self) {
        if let Ok(mut log) = self.launch_log.lock() {
            log.clear();
        }
    }

    pub fn telemetry(&self) -> BnormTelemetrySnapshot {
        self.telemetry.snapshot()
    }

    pub fn reset_telemetry(&self) {
        self.telemetry.reset();
    }

    pub fn cached_kernel_sets(&self) -> usize {
        self.kernel_sets.len()
    }

    fn compile(&self, names: &[Option<&str>], request: &KernelBuildRequest<'_>) -> Result<KernelList> {
        let conf = BnormParams::from_key_bytes(request.cache_key)?;
        let kernels = names
            .iter()
            .map(|name| {
                name.map(|n| -> Result<KernelHandle> {
                    let id = KernelId::from_name(n).ok_or_else(|| anyhow!("unknown kernel {n}"))?;
                    Ok(Arc::new(HostKernel { id, conf }) as KernelHandle)
                })
                .transpose()
            })
            .collect::<Result<KernelList>>()?;
        self.telemetry.record_build();

        let fingerprint = compute_kernel_set_hash(request.cache_key, names);
        log::debug!(
            "bnorm: compiled {} kernels for key {fingerprint:016x}",
            kernels.iter().flatten().count()
        );
        if let Some(dir) = &self.options.cache_dir {
            let meta = KernelSetMeta::new(request.cache_key, names, DEVICE_NAME);
            persist_kernel_set_meta(dir, fingerprint, &meta);
        }
        Ok(kernels)
    }

    fn run(&self, kernel: &HostKernel, args: &[KernelArg]) -> Result<()> {
        let conf = &kernel.conf;
        let dtype = conf
            .data_type()
            .ok_or_else(|| anyhow!("kernel built from an unknown data type"))?;
        if dtype != DataType::F32 {
            bail!("in-process provider only executes f32 kernels, got {dtype}");
        }
        let rt = match args.last() {
            Some(KernelArg::Bytes(bytes)) => BnormRuntimeParams::from_bytes(bytes)
                .ok_or_else(|| anyhow!("malformed run-time parameter block"))?,
            _ => bail!("{}: missing run-time parameter block", kernel.id),
        };
        let geom = Geometry::new(conf, &rt)?;
        let mut buffers = self.buffers()?;
        let mut ctx = LaunchCtx {
            buffers: &mut buffers,
            args,
            kernel: kernel.id,
        };
        match kernel.id {
            KernelId::CalcMean => calc_partials(&mut ctx, &geom, |x| x),
            KernelId::CalcVariance => calc_partials(&mut ctx, &geom, |x| x * x),
            KernelId::ReduceMean => reduce_mean(&mut ctx, &geom),
            KernelId::ReduceVariance => reduce_variance(&mut ctx, &geom),
            KernelId::Fwd => forward(&mut ctx, &geom, conf),
            KernelId::CalcStats => calc_grad_partials(&mut ctx, &geom, conf),
            KernelId::ReduceStats => reduce_grad_stats(&mut ctx, &geom),
            KernelId::Bwd => backward(&mut ctx, &geom, conf),
        }
    }
}

impl Default for InProcessProvider {
    fn default() -> Self {
        Self::new(InProcessOptions::default())
    }
}

impl KernelProvider for InProcessProvider {
    fn device_info(&self) -> String {
        DEVICE_NAME.to_string()
    }

    fn supports(&self, capability: DeviceCapability) -> bool {
        self.options.capabilities.contains(&capability)
    }

    fn max_subgroup_size(&self) -> u32 {
        self.options.max_subgroup_size
    }

    fn build_kernels(
        &self,
        names: &[Option<&str>],
        request: &KernelBuildRequest<'_>,
    ) -> Result<Vec<Option<KernelHandle>>> {
        let mut key = request.cache_key.to_vec();
        for name in names {
            key.extend_from_slice(name.unwrap_or("").as_bytes());
            key.push(0);
        }
        let (set, hit) = self
            .kernel_sets
            .get_or_try_build(&key, || self.compile(names, request))?;
        self.telemetry.record_cache_lookup(hit);
        Ok(set.as_ref().clone())
    }

    fn alloc(&self, bytes: usize) -> Result<GpuBufferHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.buffers()?.insert(id, vec![0; bytes]);
        Ok(GpuBufferHandle {
            device_id: self.device_id(),
            buffer_id: id,
            bytes,
        })
    }

    fn free(&self, handle: &GpuBufferHandle) -> Result<()> {
        match self.buffers()?.remove(&handle.buffer_id) {
            Some(_) => Ok(()),
            None => Err(anyhow!("unknown buffer {}", handle.buffer_id)),
        }
    }

    fn begin_submission(&self) -> Result<Box<dyn Submission + '_>> {
        self.telemetry.record_submission();
        Ok(Box::new(HostSubmission { provider: self }))
    }
}

/// Launches run to completion inside `enqueue`, which trivially preserves
/// submission order.
struct HostSubmission<'a> {
    provider: &'a InProcessProvider,
}

impl Submission for HostSubmission<'_> {
    fn enqueue(&mut self, kernel: &KernelHandle, range: &NdRange, args: &[KernelArg]) -> Result<()> {
        let host = kernel
            .as_any()
            .downcast_ref::<HostKernel>()
            .ok_or_else(|| anyhow!("{} was not built by the in-process provider", kernel.name()))?;
        log::trace!(
            "bnorm host: launch {} global={:?} local={:?}",
            host.id,
            range.global,
            range.local
        );
        let started = Instant::now();
        self.provider.run(host, args)?;
        self.provider
            .telemetry
            .record_launch(started.elapsed().as_nanos() as u64);
        if let Ok(mut log) = self.provider.launch_log.lock() {
            log.push(host.id.name().to_string());
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

static INSTANCE: OnceCell<InProcessProvider> = OnceCell::new();

/// Register the in-process provider as the global kernel provider.
/// Safe to call multiple times; only the first call installs the provider.
pub fn register_inprocess_provider(options: InProcessOptions) -> &'static InProcessProvider {
    let provider: &'static InProcessProvider =
        INSTANCE.get_or_init(|| InProcessProvider::new(options));
    bnorm_accelerate_api::register_provider(provider);
    provider
}

fn to_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn store_bytes(buffers: &mut HashMap<u64, Vec<u8>>, id: u64, data: &[u8]) -> Result<()> {
    let buffer = buffers
        .get_mut(&id)
        .ok_or_else(|| anyhow!("unknown buffer {id}"))?;
    if buffer.len() < data.len() {
        bail!(
            "buffer {id} holds {} bytes, {} required",
            buffer.len(),
            data.len()
        );
    }
    buffer[..data.len()].copy_from_slice(data);
    Ok(())
}

fn store_f32(buffers: &mut HashMap<u64, Vec<u8>>, id: u64, data: &[f32]) -> Result<()> {
    let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
    store_bytes(buffers, id, &bytes)
}

/// Shape of one launch, decoded from the compile-time and run-time records.
struct Geometry {
    layout: MemoryLayout,
    ic: usize,
    padded_ic: usize,
    ws_ic: usize,
    stat_ic: usize,
    spatial: usize,
    reduction_nelems: usize,
    chunks: usize,
    chunk: usize,
    div: f32,
    eps: f32,
    slope: f32,
}

impl Geometry {
    fn new(conf: &BnormParams, rt: &BnormRuntimeParams) -> Result<Self> {
        let stage = &conf.gws_params;
        let layout = match stage.layout {
            1 => MemoryLayout::Plain,
            2 => MemoryLayout::ChannelsLast,
            3 => MemoryLayout::Blocked {
                channel_block: stage.layout_block,
            },
            other => bail!("unknown layout code {other}"),
        };
        let ic = rt.ic.max(0) as usize;
        Ok(Self {
            layout,
            ic,
            padded_ic: round_up(ic, layout.channel_block()),
            ws_ic: round_up(ic, conf.workspace_channel_block()),
            stat_ic: rt.stat_ic.max(0) as usize,
            spatial: rt.spatial.max(0) as usize,
            reduction_nelems: rt.reduction_nelems.max(0) as usize,
            chunks: rt.num_reduction_chunks(),
            chunk: rt.reduction_chunk.max(1) as usize,
            div: rt.div.max(1) as f32,
            eps: rt.eps,
            slope: rt.relu_negative_slope,
        })
    }

    fn offset(&self, channels: usize, r: usize, c: usize) -> usize {
        let (n, s) = (r / self.spatial, r % self.spatial);
        let spatial = self.spatial;
        match self.layout {
            MemoryLayout::Plain | MemoryLayout::Any => (n * channels + c) * spatial + s,
            MemoryLayout::ChannelsLast => (n * spatial + s) * channels + c,
            MemoryLayout::Blocked { channel_block } => {
                let b = channel_block.max(1) as usize;
                ((n * (channels / b) + c / b) * spatial + s) * b + c % b
            }
        }
    }

    /// Element offset of reduction point `r` (a flattened `(n, spatial)`)
    /// in channel `c`.
    fn src(&self, r: usize, c: usize) -> usize {
        self.offset(self.padded_ic, r, c)
    }

    fn ws(&self, r: usize, c: usize) -> usize {
        self.offset(self.ws_ic, r, c)
    }

    fn chunk_range(&self, k: usize) -> Range<usize> {
        let start = (k * self.chunk).min(self.reduction_nelems);
        start..((k + 1) * self.chunk).min(self.reduction_nelems)
    }

    fn invstd(&self, variance: f32) -> f32 {
        1.0 / (variance + self.eps).sqrt()
    }
}

struct LaunchCtx<'a, 'b> {
    buffers: &'a mut HashMap<u64, Vec<u8>>,
    args: &'b [KernelArg],
    kernel: KernelId,
}

impl LaunchCtx<'_, '_> {
    fn handle(&self, index: usize) -> Result<Option<u64>> {
        match self.args.get(index) {
            Some(KernelArg::Buffer(h)) => Ok(Some(h.buffer_id)),
            Some(KernelArg::Null) => Ok(None),
            _ => bail!("{}: argument {index} is not a buffer", self.kernel),
        }
    }

    fn bytes(&self, index: usize) -> Result<Option<&[u8]>> {
        match self.handle(index)? {
            Some(id) => self
                .buffers
                .get(&id)
                .map(|b| Some(b.as_slice()))
                .ok_or_else(|| anyhow!("unknown buffer {id}")),
            None => Ok(None),
        }
    }

    fn optional(&self, index: usize) -> Result<Option<Vec<f32>>> {
        Ok(self.bytes(index)?.map(to_f32s))
    }

    fn input(&self, index: usize) -> Result<Vec<f32>> {
        self.optional(index)?
            .ok_or_else(|| anyhow!("{}: argument {index} is required", self.kernel))
    }

    fn required_bytes(&self, index: usize) -> Result<Vec<u8>> {
        self.bytes(index)?
            .map(<[u8]>::to_vec)
            .ok_or_else(|| anyhow!("{}: argument {index} is required", self.kernel))
    }

    fn output(&mut self, index: usize, values: &[f32]) -> Result<()> {
        let id = self
            .handle(index)?
            .ok_or_else(|| anyhow!("{}: output {index} is unbound", self.kernel))?;
        store_f32(self.buffers, id, values)
    }

    fn output_bytes(&mut self, index: usize, values: &[u8]) -> Result<()> {
        let id = self
            .handle(index)?
            .ok_or_else(|| anyhow!("{}: output {index} is unbound", self.kernel))?;
        store_bytes(self.buffers, id, values)
    }
}

fn fused(conf: &BnormParams) -> bool {
    conf.fuse_norm_relu() || conf.fuse_norm_add_relu()
}

/// src, partials, rt
fn calc_partials(ctx: &mut LaunchCtx<'_, '_>, g: &Geometry, f: impl Fn(f32) -> f32) -> Result<()> {
    let src = ctx.input(0)?;
    let mut partials = vec![0.0f32; g.chunks * g.stat_ic];
    for k in 0..g.chunks {
        for c in 0..g.ic {
            partials[k * g.stat_ic + c] = g.chunk_range(k).map(|r| f(src[g.src(r, c)])).sum();
        }
    }
    ctx.output(1, &partials)
}

/// partials, mean, rt
fn reduce_mean(ctx: &mut LaunchCtx<'_, '_>, g: &Geometry) -> Result<()> {
    let partials = ctx.input(0)?;
    let mean: Vec<f32> = (0..g.ic)
        .map(|c| (0..g.chunks).map(|k| partials[k * g.stat_ic + c]).sum::<f32>() / g.div)
        .collect();
    ctx.output(1, &mean)
}

/// partials_sq, mean, variance, rt
fn reduce_variance(ctx: &mut LaunchCtx<'_, '_>, g: &Geometry) -> Result<()> {
    let partials = ctx.input(0)?;
    let mean = ctx.input(1)?;
    let variance: Vec<f32> = (0..g.ic)
        .map(|c| {
            let sumsq: f32 = (0..g.chunks).map(|k| partials[k * g.stat_ic + c]).sum();
            (sumsq / g.div - mean[c] * mean[c]).max(0.0)
        })
        .collect();
    ctx.output(2, &variance)
}

/// src, mean, variance, scale, shift, src_add, dst, ws, rt
fn forward(ctx: &mut LaunchCtx<'_, '_>, g: &Geometry, conf: &BnormParams) -> Result<()> {
    let src = ctx.input(0)?;
    let mean = ctx.input(1)?;
    let variance = ctx.input(2)?;
    let scale = if conf.use_scale() { Some(ctx.input(3)?) } else { None };
    let shift = if conf.use_shift() { Some(ctx.input(4)?) } else { None };
    let src_add = if conf.fuse_norm_add_relu() {
        Some(ctx.input(5)?)
    } else {
        None
    };
    let write_ws = conf.is_training() && fused(conf);
    let mut ws = if write_ws {
        Some(vec![0u8; g.reduction_nelems * g.ws_ic])
    } else {
        None
    };

    let mut dst = vec![0.0f32; src.len()];
    for c in 0..g.ic {
        let invstd = g.invstd(variance[c]);
        let gamma = scale.as_ref().map_or(1.0, |s| s[c]);
        let beta = shift.as_ref().map_or(0.0, |s| s[c]);
        for r in 0..g.reduction_nelems {
            let idx = g.src(r, c);
            let mut y = (src[idx] - mean[c]) * invstd * gamma + beta;
            if let Some(add) = &src_add {
                y += add[idx];
            }
            if let Some(ws) = ws.as_mut() {
                ws[g.ws(r, c)] = u8::from(y > 0.0);
            }
            if conf.with_relu() && y <= 0.0 {
                y *= g.slope;
            }
            dst[idx] = y;
        }
    }
    ctx.output(6, &dst)?;
    if let Some(ws) = ws {
        ctx.output_bytes(7, &ws)?;
    }
    Ok(())
}

/// Incoming gradient with the saved activation mask applied.
fn masked_dy(ws: Option<&[u8]>, g: &Geometry, dy: f32, r: usize, c: usize) -> f32 {
    match ws {
        Some(ws) if ws[g.ws(r, c)] == 0 => 0.0,
        _ => dy,
    }
}

fn workspace_for(ctx: &LaunchCtx<'_, '_>, conf: &BnormParams, index: usize) -> Result<Option<Vec<u8>>> {
    if fused(conf) {
        ctx.required_bytes(index).map(Some)
    } else {
        Ok(None)
    }
}

/// src, mean, diff_dst, ws, grad_partials, rt
fn calc_grad_partials(ctx: &mut LaunchCtx<'_, '_>, g: &Geometry, conf: &BnormParams) -> Result<()> {
    let src = ctx.input(0)?;
    let mean = ctx.input(1)?;
    let diff_dst = ctx.input(2)?;
    let ws = workspace_for(ctx, conf, 3)?;

    let shift_base = g.chunks * g.stat_ic;
    let mut partials = vec![0.0f32; 2 * shift_base];
    for k in 0..g.chunks {
        for c in 0..g.ic {
            let (mut dgamma, mut dbeta) = (0.0f32, 0.0f32);
            for r in g.chunk_range(k) {
                let idx = g.src(r, c);
                let dy = masked_dy(ws.as_deref(), g, diff_dst[idx], r, c);
                dgamma += (src[idx] - mean[c]) * dy;
                dbeta += dy;
            }
            partials[k * g.stat_ic + c] = dgamma;
            partials[shift_base + k * g.stat_ic + c] = dbeta;
        }
    }
    ctx.output(4, &partials)
}

/// grad_partials, variance, diff_scale, diff_shift, rt
fn reduce_grad_stats(ctx: &mut LaunchCtx<'_, '_>, g: &Geometry) -> Result<()> {
    let partials = ctx.input(0)?;
    let variance = ctx.input(1)?;
    let shift_base = g.chunks * g.stat_ic;
    let mut diff_scale = vec![0.0f32; g.ic];
    let mut diff_shift = vec![0.0f32; g.ic];
    for c in 0..g.ic {
        let (mut dgamma, mut dbeta) = (0.0f32, 0.0f32);
        for k in 0..g.chunks {
            dgamma += partials[k * g.stat_ic + c];
            dbeta += partials[shift_base + k * g.stat_ic + c];
        }
        diff_scale[c] = dgamma * g.invstd(variance[c]);
        diff_shift[c] = dbeta;
    }
    ctx.output(2, &diff_scale)?;
    ctx.output(3, &diff_shift)
}

/// src, mean, variance, diff_dst, scale, ws, diff_scale, diff_shift,
/// diff_src, diff_src_add, rt
fn backward(ctx: &mut LaunchCtx<'_, '_>, g: &Geometry, conf: &BnormParams) -> Result<()> {
    let src = ctx.input(0)?;
    let mean = ctx.input(1)?;
    let variance = ctx.input(2)?;
    let diff_dst = ctx.input(3)?;
    let scale = if conf.use_scale() { Some(ctx.input(4)?) } else { None };
    let ws = workspace_for(ctx, conf, 5)?;
    let diff_scale = ctx.input(6)?;
    let diff_shift = ctx.input(7)?;

    let mut diff_src = vec![0.0f32; src.len()];
    let mut diff_src_add = if conf.fuse_norm_add_relu() {
        Some(vec![0.0f32; src.len()])
    } else {
        None
    };
    for c in 0..g.ic {
        let invstd = g.invstd(variance[c]);
        let gamma = scale.as_ref().map_or(1.0, |s| s[c]);
        for r in 0..g.reduction_nelems {
            let idx = g.src(r, c);
            let dy = masked_dy(ws.as_deref(), g, diff_dst[idx], r, c);
            if let Some(add) = diff_src_add.as_mut() {
                add[idx] = dy;
            }
            diff_src[idx] = if conf.calculate_stats() {
                let centered = (src[idx] - mean[c]) * invstd;
                gamma * invstd * (dy - diff_shift[c] / g.div - centered * diff_scale[c] / g.div)
            } else {
                gamma * invstd * dy
            };
        }
    }
    ctx.output(8, &diff_src)?;
    if let Some(add) = diff_src_add {
        ctx.output(9, &add)?;
    }
    Ok(())
}
