//! Compile-time and run-time parameter records.
//!
//! [`BnormParams`] is the only thing that decides which kernel variant gets
//! built. Its raw bytes are the kernel cache key, so the struct is `repr(C)`,
//! `Pod`, and every alignment gap is a named zero field. [`BnormRuntimeParams`]
//! travels to the kernels as a parameter block and never reaches the key.

use bnorm_accelerate_api::{DataType, KernelDefine, MemoryDesc};
use bytemuck::{Pod, Zeroable};
use serde::Serialize;
use std::mem::size_of;

use crate::config::{BnormOptions, MAX_REDUCTION_CHUNKS};
use crate::dispatch::{round_up, DispatchCompileParams, DispatchRuntimeParams};
use crate::error::{BnormError, BnormResult};

/// Bump whenever a field of [`BnormParams`] or [`DispatchCompileParams`]
/// changes meaning, order or width.
pub const PARAMS_LAYOUT_VERSION: u32 = 1;
const HEADER_BYTES: usize = size_of::<u32>();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum Direction {
    Forward = 1,
    Backward = 2,
}

impl Direction {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Direction::Forward),
            2 => Some(Direction::Backward),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Pod, Zeroable, Serialize)]
pub struct BnormParams {
    /// [`DataType::code`].
    pub data_type: u32,
    /// [`Direction`] as `u8`.
    pub direction: u8,

    // 0 or 1 each.
    pub use_scale: u8,
    pub use_shift: u8,
    pub is_training: u8,
    pub fuse_norm_relu: u8,
    pub fuse_norm_add_relu: u8,
    pub with_relu: u8,
    pub with_leaky_relu: u8,
    pub calculate_stats: u8,

    pub _padding: [u8; 3],

    pub calc_stat_params: DispatchCompileParams,
    pub reduce_stat_params: DispatchCompileParams,
    pub gws_params: DispatchCompileParams,
}

/// Version-tagged raw bytes of a [`BnormParams`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SerializedParams(Vec<u8>);

impl SerializedParams {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

fn as_flag(v: bool) -> u8 {
    u8::from(v)
}

impl BnormParams {
    pub const SERIALIZED_LEN: usize = HEADER_BYTES + size_of::<BnormParams>();

    pub fn new(data_type: DataType, direction: Direction) -> Self {
        Self {
            data_type: data_type.code(),
            direction: direction as u8,
            ..Self::zeroed()
        }
    }

    pub fn data_type(&self) -> Option<DataType> {
        DataType::from_code(self.data_type)
    }

    pub fn direction(&self) -> Direction {
        Direction::from_code(self.direction).unwrap_or(Direction::Forward)
    }

    pub fn is_fwd(&self) -> bool {
        self.direction() == Direction::Forward
    }

    pub fn use_scale(&self) -> bool {
        self.use_scale != 0
    }

    pub fn use_shift(&self) -> bool {
        self.use_shift != 0
    }

    pub fn is_training(&self) -> bool {
        self.is_training != 0
    }

    pub fn fuse_norm_relu(&self) -> bool {
        self.fuse_norm_relu != 0
    }

    pub fn fuse_norm_add_relu(&self) -> bool {
        self.fuse_norm_add_relu != 0
    }

    pub fn with_relu(&self) -> bool {
        self.with_relu != 0
    }

    pub fn with_leaky_relu(&self) -> bool {
        self.with_leaky_relu != 0
    }

    pub fn calculate_stats(&self) -> bool {
        self.calculate_stats != 0
    }

    pub(crate) fn set_flags(
        &mut self,
        use_scale: bool,
        use_shift: bool,
        is_training: bool,
        calculate_stats: bool,
    ) {
        self.use_scale = as_flag(use_scale);
        self.use_shift = as_flag(use_shift);
        self.is_training = as_flag(is_training);
        self.calculate_stats = as_flag(calculate_stats);
    }

    pub(crate) fn set_fusion(
        &mut self,
        fuse_norm_relu: bool,
        fuse_norm_add_relu: bool,
        with_relu: bool,
        with_leaky_relu: bool,
    ) {
        self.fuse_norm_relu = as_flag(fuse_norm_relu);
        self.fuse_norm_add_relu = as_flag(fuse_norm_add_relu);
        self.with_relu = as_flag(with_relu);
        self.with_leaky_relu = as_flag(with_leaky_relu);
    }

    /// Layout version followed by the record's raw bytes.
    pub fn serialize(&self) -> SerializedParams {
        let mut out = Vec::with_capacity(Self::SERIALIZED_LEN);
        out.extend_from_slice(&PARAMS_LAYOUT_VERSION.to_le_bytes());
        out.extend_from_slice(bytemuck::bytes_of(self));
        SerializedParams(out)
    }

    pub fn deserialize(serialized: &SerializedParams) -> BnormResult<Self> {
        Self::from_key_bytes(serialized.as_bytes())
    }

    pub fn from_key_bytes(bytes: &[u8]) -> BnormResult<Self> {
        if bytes.len() != Self::SERIALIZED_LEN {
            return Err(BnormError::malformed_key(format!(
                "expected {} bytes, got {}",
                Self::SERIALIZED_LEN,
                bytes.len()
            )));
        }
        let (header, body) = bytes.split_at(HEADER_BYTES);
        let mut version = [0u8; HEADER_BYTES];
        version.copy_from_slice(header);
        let version = u32::from_le_bytes(version);
        if version != PARAMS_LAYOUT_VERSION {
            return Err(BnormError::malformed_key(format!(
                "layout version {version} does not match {PARAMS_LAYOUT_VERSION}"
            )));
        }
        let params: BnormParams = bytemuck::try_pod_read_unaligned(body)
            .map_err(|e| BnormError::malformed_key(format!("record decode failed: {e:?}")))?;
        params.check_well_formed()?;
        Ok(params)
    }

    fn check_well_formed(&self) -> BnormResult<()> {
        if self.data_type().is_none() {
            return Err(BnormError::malformed_key(format!(
                "unknown data type code {}",
                self.data_type
            )));
        }
        if Direction::from_code(self.direction).is_none() {
            return Err(BnormError::malformed_key(format!(
                "unknown direction code {}",
                self.direction
            )));
        }
        let flags = [
            self.use_scale,
            self.use_shift,
            self.is_training,
            self.fuse_norm_relu,
            self.fuse_norm_add_relu,
            self.with_relu,
            self.with_leaky_relu,
            self.calculate_stats,
        ];
        if flags.iter().any(|&f| f > 1) {
            return Err(BnormError::malformed_key("flag byte outside {0, 1}"));
        }
        if self._padding != [0; 3] {
            return Err(BnormError::malformed_key("non-zero padding bytes"));
        }
        for (name, stage) in [
            ("calc_stat", &self.calc_stat_params),
            ("reduce_stat", &self.reduce_stat_params),
            ("gws", &self.gws_params),
        ] {
            if !stage.is_well_formed() {
                return Err(BnormError::malformed_key(format!(
                    "{name} dispatch params are malformed"
                )));
            }
        }
        Ok(())
    }

    /// Channel granularity shared by the statistic buffers: every stage can
    /// walk `stat_ic` channels without a tail.
    pub fn stat_channel_block(&self) -> usize {
        [
            self.calc_stat_params.channel_block,
            self.reduce_stat_params.channel_block,
            self.gws_params.channel_block,
        ]
        .into_iter()
        .max()
        .unwrap_or(1) as usize
    }

    /// Channel granularity of the activation workspace.
    pub fn workspace_channel_block(&self) -> usize {
        (self.gws_params.channel_block as usize).max(self.gws_params.layout_block as usize)
    }

    /// Compile-time switches handed to the kernel provider.
    pub fn kernel_ctx(&self) -> Vec<KernelDefine> {
        let mut defines = vec![
            KernelDefine::new("DATA_TYPE", i64::from(self.data_type)),
            KernelDefine::new("IS_FWD", i64::from(self.is_fwd())),
            KernelDefine::new("USE_SCALE", i64::from(self.use_scale)),
            KernelDefine::new("USE_SHIFT", i64::from(self.use_shift)),
            KernelDefine::new("IS_TRAINING", i64::from(self.is_training)),
            KernelDefine::new("FUSE_BN_RELU", i64::from(self.fuse_norm_relu)),
            KernelDefine::new("FUSE_BN_ADD_RELU", i64::from(self.fuse_norm_add_relu)),
            KernelDefine::new("WITH_RELU", i64::from(self.with_relu)),
            KernelDefine::new("WITH_LEAKY_RELU", i64::from(self.with_leaky_relu)),
            KernelDefine::new("CALCULATE_STATS", i64::from(self.calculate_stats)),
            KernelDefine::new("SRC_LAYOUT", i64::from(self.gws_params.layout)),
            KernelDefine::new("LAYOUT_BLOCK", i64::from(self.gws_params.layout_block)),
            KernelDefine::new("WS_CHANNEL_BLOCK", self.workspace_channel_block() as i64),
        ];
        for (prefix, stage) in [
            ("CALC_STAT", &self.calc_stat_params),
            ("REDUCE_STAT", &self.reduce_stat_params),
            ("GWS", &self.gws_params),
        ] {
            defines.push(KernelDefine::new(
                format!("{prefix}_STRATEGY"),
                i64::from(stage.strategy),
            ));
            defines.push(KernelDefine::new(
                format!("{prefix}_SUBGROUP"),
                i64::from(stage.subgroup_size),
            ));
            defines.push(KernelDefine::new(
                format!("{prefix}_CHANNEL_BLOCK"),
                i64::from(stage.channel_block),
            ));
            defines.push(KernelDefine::new(
                format!("{prefix}_DIM_MASK"),
                stage.dim_mask as i64,
            ));
        }
        defines
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable, Serialize)]
pub struct BnormRuntimeParams {
    /// Distance between consecutive reduction chunks in the partial buffers.
    pub reduce_dim_stride: i64,
    pub calc_stat_params: DispatchRuntimeParams,
    pub reduce_stat_params: DispatchRuntimeParams,
    pub gws_params: DispatchRuntimeParams,

    pub relu_negative_slope: f32,
    pub eps: f32,

    /// Channels covered by statistic buffers, padded to the stage tiling.
    pub stat_ic: i64,
    /// `N * spatial`.
    pub reduction_nelems: i64,
    pub div: i64,
    pub ic: i64,
    pub spatial: i64,
    /// Reduction elements folded by one local-reduction work-group.
    pub reduction_chunk: i64,
}

impl BnormRuntimeParams {
    pub fn new(
        conf: &BnormParams,
        src: &MemoryDesc,
        eps: f32,
        relu_negative_slope: f32,
        opts: &BnormOptions,
    ) -> Self {
        let ic = src.channels();
        let spatial = src.spatial();
        let reduction_nelems = src.mb() * spatial;
        let stat_ic = round_up(ic, conf.stat_channel_block());

        let chunk = (opts.reduction_chunk.max(1) as usize)
            .max(reduction_nelems.div_ceil(MAX_REDUCTION_CHUNKS));
        let num_chunks = reduction_nelems.div_ceil(chunk);

        let calc_stat_params = DispatchRuntimeParams::new(
            [stat_ic, num_chunks, 1],
            conf.calc_stat_params.subgroup_size,
        );
        let reduce_stat_params =
            DispatchRuntimeParams::new([stat_ic, 1, 1], conf.reduce_stat_params.subgroup_size);
        let gws_params = DispatchRuntimeParams::new(
            [stat_ic, reduction_nelems, 1],
            conf.gws_params.subgroup_size,
        );

        Self {
            reduce_dim_stride: stat_ic as i64,
            calc_stat_params,
            reduce_stat_params,
            gws_params,
            relu_negative_slope,
            eps,
            stat_ic: stat_ic as i64,
            reduction_nelems: reduction_nelems as i64,
            div: reduction_nelems as i64,
            ic: ic as i64,
            spatial: spatial as i64,
            reduction_chunk: chunk as i64,
        }
    }

    pub fn num_reduction_chunks(&self) -> usize {
        self.calc_stat_params.gws[1] as usize
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bytemuck::bytes_of(self).to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bytemuck::try_pod_read_unaligned(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{all_dims_mask, select_reduce_tile, select_tile, stage_params};
    use bnorm_accelerate_api::MemoryLayout;

    fn sample() -> BnormParams {
        let layout = MemoryLayout::ChannelsLast;
        let tile = select_tile(layout, 32, 16);
        let reduce = select_reduce_tile(16);
        let mut p = BnormParams::new(DataType::F32, Direction::Forward);
        p.set_flags(true, true, true, true);
        p.calc_stat_params = stage_params(&tile, layout, all_dims_mask(4));
        p.reduce_stat_params = stage_params(&reduce, layout, 1 << 1);
        p.gws_params = stage_params(&tile, layout, all_dims_mask(4));
        p
    }

    #[test]
    fn record_has_no_implicit_padding() {
        assert_eq!(size_of::<DispatchCompileParams>(), 32);
        assert_eq!(size_of::<BnormParams>(), 16 + 3 * 32);
        assert_eq!(BnormParams::SERIALIZED_LEN, 4 + 112);
    }

    #[test]
    fn round_trip() {
        let p = sample();
        let decoded = BnormParams::deserialize(&p.serialize()).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn every_logical_field_changes_the_key() {
        let base = sample();
        let mut variants = Vec::new();
        let mut v = base;
        v.data_type = DataType::Bf16.code();
        variants.push(v);
        let mut v = base;
        v.direction = Direction::Backward as u8;
        variants.push(v);
        for i in 0..8 {
            let mut v = base;
            let flags = [
                &mut v.use_scale,
                &mut v.use_shift,
                &mut v.is_training,
                &mut v.fuse_norm_relu,
                &mut v.fuse_norm_add_relu,
                &mut v.with_relu,
                &mut v.with_leaky_relu,
                &mut v.calculate_stats,
            ];
            *flags.into_iter().nth(i).unwrap() ^= 1;
            variants.push(v);
        }
        let mut v = base;
        v.calc_stat_params.subgroup_size = 8;
        variants.push(v);
        let mut v = base;
        v.reduce_stat_params.channel_block = 8;
        variants.push(v);
        let mut v = base;
        v.gws_params.dim_mask = all_dims_mask(5);
        variants.push(v);

        let base_key = base.serialize();
        let mut keys = vec![base_key.clone()];
        for v in &variants {
            assert_ne!(v, &base);
            let key = v.serialize();
            assert!(!keys.contains(&key), "collision for {v:?}");
            keys.push(key);
        }
    }

    #[test]
    fn wrong_length_is_rejected() {
        let key = sample().serialize().into_bytes();
        let err = BnormParams::from_key_bytes(&key[..key.len() - 1]).unwrap_err();
        assert!(matches!(err, BnormError::MalformedCacheKey(_)));
        let mut long = key.clone();
        long.push(0);
        assert!(BnormParams::from_key_bytes(&long).is_err());
        assert!(BnormParams::from_key_bytes(&[]).is_err());
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut key = sample().serialize().into_bytes();
        key[0] = key[0].wrapping_add(1);
        let err = BnormParams::from_key_bytes(&key).unwrap_err();
        assert!(err.to_string().contains("layout version"));
    }

    #[test]
    fn dirty_padding_is_rejected() {
        let mut key = sample().serialize().into_bytes();
        // header (4) + data_type (4) + direction (1) + flags (8)
        key[4 + 4 + 1 + 8] = 0xff;
        let err = BnormParams::from_key_bytes(&key).unwrap_err();
        assert!(err.to_string().contains("padding"));
    }

    #[test]
    fn runtime_params_track_shape() {
        let p = sample();
        let src = MemoryDesc::new(DataType::F32, &[2, 32, 4, 4], MemoryLayout::ChannelsLast);
        let opts = BnormOptions {
            reduction_chunk: 8,
            ..BnormOptions::default()
        };
        let rt = BnormRuntimeParams::new(&p, &src, 1e-5, 0.0, &opts);
        assert_eq!(rt.ic, 32);
        assert_eq!(rt.reduction_nelems, 32);
        assert_eq!(rt.num_reduction_chunks(), 4);
        assert_eq!(rt.stat_ic % 16, 0);
        let back = BnormRuntimeParams::from_bytes(&rt.to_bytes()).unwrap();
        assert_eq!(back, rt);
    }
}
