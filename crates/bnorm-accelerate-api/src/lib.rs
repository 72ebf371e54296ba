//! Collaborator surface for the reusable batch-normalization dispatcher.
//!
//! This crate holds everything the dispatcher consumes but does not own:
//! the read-only primitive descriptor, the device capability query, the
//! kernel provider that compiles and launches kernels, and the opaque buffer
//! handles that flow between calls. Implementations (device backends, the
//! in-process reference provider) live elsewhere and register themselves via
//! [`register_provider`].

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

static PROVIDER: OnceCell<&'static dyn KernelProvider> = OnceCell::new();

/// Install the process-wide kernel provider. Returns `false` when a provider
/// was already registered; the first registration wins.
pub fn register_provider(provider: &'static dyn KernelProvider) -> bool {
    PROVIDER.set(provider).is_ok()
}

/// The process-wide kernel provider, if one has been registered.
pub fn provider() -> Option<&'static dyn KernelProvider> {
    PROVIDER.get().copied()
}

/// Element types understood by the primitive descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataType {
    S8,
    U8,
    F32,
    Bf16,
    F16,
}

impl DataType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DataType::S8 | DataType::U8 => 1,
            DataType::Bf16 | DataType::F16 => 2,
            DataType::F32 => 4,
        }
    }

    /// Stable numeric code. Codes are part of serialized cache keys and must
    /// never be reassigned.
    pub fn code(self) -> u32 {
        match self {
            DataType::S8 => 1,
            DataType::U8 => 2,
            DataType::F32 => 3,
            DataType::Bf16 => 4,
            DataType::F16 => 5,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(DataType::S8),
            2 => Some(DataType::U8),
            3 => Some(DataType::F32),
            4 => Some(DataType::Bf16),
            5 => Some(DataType::F16),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DataType::S8 => "s8",
            DataType::U8 => "u8",
            DataType::F32 => "f32",
            DataType::Bf16 => "bf16",
            DataType::F16 => "f16",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Physical arrangement of an `[N, C, spatial...]` tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum MemoryLayout {
    /// Not chosen yet; resolved to a concrete layout during validation.
    Any,
    /// `N, C, spatial` with spatial innermost.
    Plain,
    /// `N, spatial, C` with channels innermost.
    ChannelsLast,
    /// `N, C/b, spatial, b` with a channel block of `b` innermost.
    Blocked { channel_block: u32 },
}

impl MemoryLayout {
    pub fn is_defined(&self) -> bool {
        !matches!(self, MemoryLayout::Any)
    }

    /// Channels are adjacent in memory, so a subgroup can vectorize across them.
    pub fn channels_contiguous(&self) -> bool {
        matches!(
            self,
            MemoryLayout::ChannelsLast | MemoryLayout::Blocked { .. }
        )
    }

    /// Channel padding granularity imposed by the layout itself.
    pub fn channel_block(&self) -> usize {
        match self {
            MemoryLayout::Blocked { channel_block } => (*channel_block).max(1) as usize,
            _ => 1,
        }
    }

    /// Stable numeric code used in compile-time switches.
    pub fn code(&self) -> u32 {
        match self {
            MemoryLayout::Any => 0,
            MemoryLayout::Plain => 1,
            MemoryLayout::ChannelsLast => 2,
            MemoryLayout::Blocked { .. } => 3,
        }
    }
}

/// Shape, element type and layout of one operand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryDesc {
    pub dtype: DataType,
    /// Logical dims: `[N, C, D?, H?, W?]`.
    pub dims: Vec<usize>,
    pub layout: MemoryLayout,
}

impl MemoryDesc {
    pub fn new(dtype: DataType, dims: &[usize], layout: MemoryLayout) -> Self {
        Self {
            dtype,
            dims: dims.to_vec(),
            layout,
        }
    }

    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    pub fn mb(&self) -> usize {
        self.dims.first().copied().unwrap_or(1)
    }

    pub fn channels(&self) -> usize {
        self.dims.get(1).copied().unwrap_or(1)
    }

    /// Elements per `(n, c)` plane.
    pub fn spatial(&self) -> usize {
        self.dims.iter().skip(2).product()
    }

    pub fn nelems(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn has_zero_dim(&self) -> bool {
        self.dims.iter().any(|&d| d == 0)
    }

    /// Channel count after layout-imposed padding.
    pub fn padded_channels(&self) -> usize {
        let block = self.layout.channel_block();
        self.channels().div_ceil(block) * block
    }

    pub fn size_in_bytes(&self) -> usize {
        self.mb() * self.padded_channels() * self.spatial() * self.dtype.size_in_bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PropKind {
    ForwardTraining,
    ForwardInference,
    Backward,
}

/// Descriptor-level switches requested by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NormFlags {
    pub use_scale: bool,
    pub use_shift: bool,
    /// Mean and variance are supplied by the caller instead of computed.
    pub use_global_stats: bool,
    pub fuse_norm_relu: bool,
    pub fuse_norm_add_relu: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EltwiseAlg {
    Relu,
    Gelu,
    Tanh,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PostOp {
    /// `alpha` is the negative slope for [`EltwiseAlg::Relu`].
    Eltwise {
        alg: EltwiseAlg,
        alpha: f32,
        beta: f32,
    },
    Sum {
        scale: f32,
    },
}

impl PostOp {
    pub fn relu(negative_slope: f32) -> Self {
        PostOp::Eltwise {
            alg: EltwiseAlg::Relu,
            alpha: negative_slope,
            beta: 0.0,
        }
    }
}

/// Primitive attributes. The default value is the empty attribute set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrimitiveAttr {
    #[serde(default)]
    pub post_ops: Vec<PostOp>,
    #[serde(default)]
    pub output_scale: Option<f32>,
}

impl PrimitiveAttr {
    pub fn with_post_op(mut self, op: PostOp) -> Self {
        self.post_ops.push(op);
        self
    }

    pub fn has_default_values(&self) -> bool {
        self.post_ops.is_empty() && self.has_default_values_except_post_ops()
    }

    pub fn has_default_values_except_post_ops(&self) -> bool {
        self.output_scale.is_none()
    }
}

/// Read-only description of one batch-normalization call site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchNormDesc {
    pub prop_kind: PropKind,
    pub src: MemoryDesc,
    /// Forward only.
    pub dst: Option<MemoryDesc>,
    /// Backward only.
    pub diff_src: Option<MemoryDesc>,
    /// Backward only.
    pub diff_dst: Option<MemoryDesc>,
    pub scale_shift_dtype: DataType,
    pub flags: NormFlags,
    pub epsilon: f32,
    #[serde(default)]
    pub attr: PrimitiveAttr,
}

impl BatchNormDesc {
    /// Forward descriptor with `dst` mirroring `src`.
    pub fn forward(prop_kind: PropKind, src: MemoryDesc, flags: NormFlags, epsilon: f32) -> Self {
        let dst = src.clone();
        Self {
            prop_kind,
            src,
            dst: Some(dst),
            diff_src: None,
            diff_dst: None,
            scale_shift_dtype: DataType::F32,
            flags,
            epsilon,
            attr: PrimitiveAttr::default(),
        }
    }

    /// Backward descriptor with both gradients mirroring `src`.
    pub fn backward(src: MemoryDesc, flags: NormFlags, epsilon: f32) -> Self {
        let diff = src.clone();
        Self {
            prop_kind: PropKind::Backward,
            src,
            dst: None,
            diff_src: Some(diff.clone()),
            diff_dst: Some(diff),
            scale_shift_dtype: DataType::F32,
            flags,
            epsilon,
            attr: PrimitiveAttr::default(),
        }
    }

    pub fn with_attr(mut self, attr: PrimitiveAttr) -> Self {
        self.attr = attr;
        self
    }

    pub fn is_fwd(&self) -> bool {
        !matches!(self.prop_kind, PropKind::Backward)
    }

    pub fn is_training(&self) -> bool {
        matches!(self.prop_kind, PropKind::ForwardTraining)
    }

    /// True when any operand has a zero-sized dimension.
    pub fn has_zero_dim_memory(&self) -> bool {
        [
            Some(&self.src),
            self.dst.as_ref(),
            self.diff_src.as_ref(),
            self.diff_dst.as_ref(),
        ]
        .into_iter()
        .flatten()
        .any(MemoryDesc::has_zero_dim)
    }
}

/// Optional device features the dispatcher may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceCapability {
    /// Native half-precision arithmetic.
    Fp16,
    /// Subgroup shuffles and block reads.
    Subgroups,
}

/// Layout of the activation mask a fused forward call leaves behind for its
/// backward counterpart. One byte per element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceDesc {
    /// `[N, padded C, spatial...]`.
    pub dims: Vec<usize>,
    pub layout: MemoryLayout,
    pub bytes: usize,
}

/// Opaque device buffer handed out by a [`KernelProvider`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GpuBufferHandle {
    pub device_id: u32,
    pub buffer_id: u64,
    pub bytes: usize,
}

/// Global and optional local work sizes for one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NdRange {
    pub global: [usize; 3],
    pub local: Option<[usize; 3]>,
}

impl NdRange {
    pub fn work_items(&self) -> usize {
        self.global.iter().product()
    }
}

/// One positional kernel argument.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelArg {
    Buffer(GpuBufferHandle),
    /// Unbound optional buffer.
    Null,
    /// Plain-old-data parameter block.
    Bytes(Vec<u8>),
}

impl KernelArg {
    pub fn buffer(handle: Option<&GpuBufferHandle>) -> Self {
        match handle {
            Some(h) => KernelArg::Buffer(h.clone()),
            None => KernelArg::Null,
        }
    }
}

/// Compile-time switch baked into a kernel build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelDefine {
    pub name: String,
    pub value: i64,
}

impl KernelDefine {
    pub fn new(name: impl Into<String>, value: i64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Everything a provider needs to compile one kernel bundle.
#[derive(Debug, Clone, Copy)]
pub struct KernelBuildRequest<'a> {
    /// Serialized compile-time record; identical keys must map to the same
    /// compiled kernels.
    pub cache_key: &'a [u8],
    pub defines: &'a [KernelDefine],
}

impl KernelBuildRequest<'_> {
    pub fn define(&self, name: &str) -> Option<i64> {
        self.defines
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.value)
    }
}

pub trait CompiledKernel: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Lets a provider recover its own concrete kernel type at launch time.
    fn as_any(&self) -> &dyn std::any::Any;
}

pub type KernelHandle = Arc<dyn CompiledKernel>;

/// An in-order stream of launches. A launch observes the complete output of
/// every launch enqueued before it on the same submission.
pub trait Submission {
    fn enqueue(
        &mut self,
        kernel: &KernelHandle,
        range: &NdRange,
        args: &[KernelArg],
    ) -> anyhow::Result<()>;

    /// Flush the stream and wait until the device has accepted every launch.
    /// Accepted launches may still be running when this returns; see
    /// [`KernelProvider::free`].
    fn finish(self: Box<Self>) -> anyhow::Result<()>;
}

pub trait KernelProvider: Send + Sync {
    fn device_info(&self) -> String;

    fn device_id(&self) -> u32 {
        0
    }

    fn supports(&self, capability: DeviceCapability) -> bool;

    /// Widest subgroup the device can run.
    fn max_subgroup_size(&self) -> u32 {
        16
    }

    /// Compile the named kernels. The result has one entry per requested
    /// name, in order; `None` names must yield `None` handles.
    fn build_kernels(
        &self,
        names: &[Option<&str>],
        request: &KernelBuildRequest<'_>,
    ) -> anyhow::Result<Vec<Option<KernelHandle>>>;

    fn alloc(&self, bytes: usize) -> anyhow::Result<GpuBufferHandle>;

    /// Release a buffer. Callers free per-call scratch as soon as the
    /// submission that used it has finished, so a provider that runs launches
    /// asynchronously must hold the memory until every launch already
    /// accepted against it has completed.
    fn free(&self, handle: &GpuBufferHandle) -> anyhow::Result<()>;

    fn begin_submission(&self) -> anyhow::Result<Box<dyn Submission + '_>>;
}
