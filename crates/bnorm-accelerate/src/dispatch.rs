//! Per-stage tiling descriptors.
//!
//! Every pipeline stage carries two halves: a [`DispatchCompileParams`] that is
//! baked into the kernel build (and therefore into the cache key), and a
//! [`DispatchRuntimeParams`] with the concrete work sizes for one call.

use bnorm_accelerate_api::{MemoryLayout, NdRange};
use bytemuck::{Pod, Zeroable};
use serde::Serialize;

pub const DIM_MB: u32 = 0;
pub const DIM_IC: u32 = 1;
pub const MAX_NDIMS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u32)]
pub enum TileStrategy {
    /// One work-item per element, no subgroup cooperation.
    Scalar = 1,
    /// Subgroup lanes walk adjacent channels.
    ChannelVector = 2,
    /// Subgroup lanes walk adjacent spatial points of one channel.
    SpatialVector = 3,
    /// Dense channel-parallel pass over the partial-sum buffer.
    ChannelReduce = 4,
}

impl TileStrategy {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(TileStrategy::Scalar),
            2 => Some(TileStrategy::ChannelVector),
            3 => Some(TileStrategy::SpatialVector),
            4 => Some(TileStrategy::ChannelReduce),
            _ => None,
        }
    }
}

/// Compile-time tiling for one stage. All fields are fixed width and the
/// struct has no implicit padding; `Pod` derive rejects it otherwise.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable, Serialize)]
pub struct DispatchCompileParams {
    /// Bit `i` set when logical dim `i` is walked by this stage's grid.
    pub dim_mask: u64,
    pub strategy: u32,
    pub layout: u32,
    pub layout_block: u32,
    pub channel_block: u32,
    pub subgroup_size: u32,
    pub vector_width: u32,
}

impl DispatchCompileParams {
    pub fn strategy(&self) -> Option<TileStrategy> {
        TileStrategy::from_code(self.strategy)
    }

    /// Structural sanity used when decoding serialized records.
    pub fn is_well_formed(&self) -> bool {
        let pow2 = |v: u32| v != 0 && v.is_power_of_two();
        self.strategy().is_some()
            && (1..=3).contains(&self.layout)
            && self.dim_mask != 0
            && self.dim_mask >> MAX_NDIMS == 0
            && self.layout_block >= 1
            && pow2(self.channel_block)
            && pow2(self.subgroup_size)
            && self.subgroup_size <= 64
            && pow2(self.vector_width)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileCandidate {
    pub strategy: TileStrategy,
    pub channel_block: u32,
    pub subgroup_size: u32,
    pub vector_width: u32,
}

const fn tile(
    strategy: TileStrategy,
    channel_block: u32,
    subgroup_size: u32,
    vector_width: u32,
) -> TileCandidate {
    TileCandidate {
        strategy,
        channel_block,
        subgroup_size,
        vector_width,
    }
}

/// Ordered widest first; the first admissible entry wins.
pub const TILE_MENU: [TileCandidate; 7] = [
    tile(TileStrategy::ChannelVector, 32, 32, 1),
    tile(TileStrategy::ChannelVector, 16, 16, 1),
    tile(TileStrategy::ChannelVector, 8, 8, 1),
    tile(TileStrategy::SpatialVector, 1, 32, 1),
    tile(TileStrategy::SpatialVector, 1, 16, 1),
    tile(TileStrategy::SpatialVector, 1, 8, 1),
    tile(TileStrategy::Scalar, 1, 1, 1),
];

/// Widest channel block either menu offers.
pub const MAX_TILE_CHANNEL_BLOCK: usize = 32;

pub const REDUCE_TILE_MENU: [TileCandidate; 4] = [
    tile(TileStrategy::ChannelReduce, 32, 32, 1),
    tile(TileStrategy::ChannelReduce, 16, 16, 1),
    tile(TileStrategy::ChannelReduce, 8, 8, 1),
    tile(TileStrategy::ChannelReduce, 1, 1, 1),
];

fn admissible(candidate: &TileCandidate, layout: MemoryLayout, ic: usize, max_sg: u32) -> bool {
    if candidate.subgroup_size > max_sg {
        return false;
    }
    let cb = candidate.channel_block as usize;
    match candidate.strategy {
        TileStrategy::ChannelVector => match layout {
            MemoryLayout::ChannelsLast => ic % cb == 0,
            MemoryLayout::Blocked { channel_block } => channel_block as usize % cb == 0,
            MemoryLayout::Plain | MemoryLayout::Any => false,
        },
        TileStrategy::SpatialVector => matches!(layout, MemoryLayout::Plain),
        TileStrategy::Scalar | TileStrategy::ChannelReduce => true,
    }
}

/// Tiling for the stages that touch the source tensor. Depends only on the
/// layout, channel divisibility and the subgroup limit.
pub fn select_tile(layout: MemoryLayout, ic: usize, max_sg: u32) -> TileCandidate {
    let chosen = TILE_MENU
        .iter()
        .find(|c| admissible(c, layout, ic, max_sg))
        .copied()
        .unwrap_or(TILE_MENU[TILE_MENU.len() - 1]);
    log::trace!(
        "bnorm: tile {:?} cb={} sg={} for layout {:?}, ic={ic}, max_sg={max_sg}",
        chosen.strategy,
        chosen.channel_block,
        chosen.subgroup_size,
        layout
    );
    chosen
}

/// Tiling for the global reduction over the dense partial buffer.
pub fn select_reduce_tile(max_sg: u32) -> TileCandidate {
    REDUCE_TILE_MENU
        .iter()
        .find(|c| c.subgroup_size <= max_sg)
        .copied()
        .unwrap_or(REDUCE_TILE_MENU[REDUCE_TILE_MENU.len() - 1])
}

pub fn all_dims_mask(ndims: usize) -> u64 {
    (1u64 << ndims.min(MAX_NDIMS)) - 1
}

pub fn stage_params(tile: &TileCandidate, layout: MemoryLayout, dim_mask: u64) -> DispatchCompileParams {
    DispatchCompileParams {
        dim_mask,
        strategy: tile.strategy as u32,
        layout: layout.code(),
        layout_block: layout.channel_block() as u32,
        channel_block: tile.channel_block,
        subgroup_size: tile.subgroup_size,
        vector_width: tile.vector_width,
    }
}

/// Concrete grid for one stage of one call.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable, Serialize)]
pub struct DispatchRuntimeParams {
    pub gws: [u64; 3],
    pub lws: [u64; 3],
}

impl DispatchRuntimeParams {
    /// `preferred_local` is shrunk until it divides the first global dim.
    pub fn new(gws: [usize; 3], preferred_local: u32) -> Self {
        let lws0 = local_size(gws[0], preferred_local as usize);
        Self {
            gws: gws.map(|g| g as u64),
            lws: [lws0 as u64, 1, 1],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.gws.iter().any(|&g| g == 0)
    }

    pub fn work_groups(&self) -> u64 {
        self.gws
            .iter()
            .zip(self.lws.iter())
            .map(|(&g, &l)| g.div_ceil(l.max(1)))
            .product()
    }

    pub fn nd_range(&self) -> NdRange {
        NdRange {
            global: self.gws.map(|g| g as usize),
            local: Some(self.lws.map(|l| l as usize)),
        }
    }
}

fn local_size(global: usize, preferred: usize) -> usize {
    if global == 0 {
        return 1;
    }
    let mut lws = preferred.max(1);
    while lws > 1 && global % lws != 0 {
        lws /= 2;
    }
    lws
}

pub fn round_up(value: usize, multiple: usize) -> usize {
    let multiple = multiple.max(1);
    value.div_ceil(multiple) * multiple
}
