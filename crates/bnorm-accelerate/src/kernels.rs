//! Kernel-set resolution.
//!
//! A compile-time record maps to exactly one ordered list of kernel slots.
//! Slot 0 is always the main kernel; unused slots stay `None` so the list
//! length only depends on the direction.
//!
//! Positional argument schemas, in launch order:
//!
//! | kernel                  | arguments |
//! |-------------------------|-----------|
//! | `bnorm_calc_mean`       | src, partials, rt |
//! | `bnorm_calc_variance`   | src, partials_sq, rt |
//! | `bnorm_reduce_mean`     | partials, mean, rt |
//! | `bnorm_reduce_variance` | partials_sq, mean, variance, rt |
//! | `bnorm_fwd`             | src, mean, variance, scale, shift, src_add, dst, ws, rt |
//! | `bnorm_calc_stats`      | src, mean, diff_dst, ws, grad_partials, rt |
//! | `bnorm_reduce_stats`    | grad_partials, variance, diff_scale, diff_shift, rt |
//! | `bnorm_bwd`             | src, mean, variance, diff_dst, scale, ws, diff_scale, diff_shift, diff_src, diff_src_add, rt |
//!
//! `rt` is the byte image of [`BnormRuntimeParams`](crate::params::BnormRuntimeParams).

use bnorm_accelerate_api::KernelDefine;
use serde::Serialize;
use std::fmt;

use crate::params::{BnormParams, Direction, SerializedParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum KernelId {
    Fwd,
    CalcMean,
    CalcVariance,
    ReduceMean,
    ReduceVariance,
    CalcStats,
    ReduceStats,
    Bwd,
}

impl KernelId {
    pub const ALL: [KernelId; 8] = [
        KernelId::Fwd,
        KernelId::CalcMean,
        KernelId::CalcVariance,
        KernelId::ReduceMean,
        KernelId::ReduceVariance,
        KernelId::CalcStats,
        KernelId::ReduceStats,
        KernelId::Bwd,
    ];

    pub fn name(self) -> &'static str {
        match self {
            KernelId::Fwd => "bnorm_fwd",
            KernelId::CalcMean => "bnorm_calc_mean",
            KernelId::CalcVariance => "bnorm_calc_variance",
            KernelId::ReduceMean => "bnorm_reduce_mean",
            KernelId::ReduceVariance => "bnorm_reduce_variance",
            KernelId::CalcStats => "bnorm_calc_stats",
            KernelId::ReduceStats => "bnorm_reduce_stats",
            KernelId::Bwd => "bnorm_bwd",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.name() == name)
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StatsSource {
    /// Mean and variance come from the caller.
    Supplied,
    /// Mean and variance are reduced from the source tensor.
    Computed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FusionKind {
    None,
    NormRelu,
    NormAddRelu,
    /// Relu requested through a post-op rather than a descriptor flag.
    PostOpRelu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PipelineMode {
    Forward {
        stats: StatsSource,
        fusion: FusionKind,
    },
    Backward {
        fusion: FusionKind,
    },
}

impl PipelineMode {
    pub fn of(conf: &BnormParams) -> Self {
        let fusion = if conf.fuse_norm_relu() {
            FusionKind::NormRelu
        } else if conf.fuse_norm_add_relu() {
            FusionKind::NormAddRelu
        } else if conf.with_relu() {
            FusionKind::PostOpRelu
        } else {
            FusionKind::None
        };
        match conf.direction() {
            Direction::Forward => PipelineMode::Forward {
                stats: if conf.calculate_stats() {
                    StatsSource::Computed
                } else {
                    StatsSource::Supplied
                },
                fusion,
            },
            Direction::Backward => PipelineMode::Backward { fusion },
        }
    }
}

pub const FWD_SLOTS: usize = 5;
pub const BWD_SLOTS: usize = 3;

const FWD_SUPPLIED: [Option<KernelId>; FWD_SLOTS] = [Some(KernelId::Fwd), None, None, None, None];
const FWD_COMPUTED: [Option<KernelId>; FWD_SLOTS] = [
    Some(KernelId::Fwd),
    Some(KernelId::CalcMean),
    Some(KernelId::CalcVariance),
    Some(KernelId::ReduceMean),
    Some(KernelId::ReduceVariance),
];
const BWD: [Option<KernelId>; BWD_SLOTS] = [
    Some(KernelId::Bwd),
    Some(KernelId::CalcStats),
    Some(KernelId::ReduceStats),
];

/// Slot table for a mode. Fusion only changes kernel bodies (through the
/// defines), never which kernels exist.
fn slots(mode: PipelineMode) -> &'static [Option<KernelId>] {
    match mode {
        PipelineMode::Forward {
            stats: StatsSource::Supplied,
            ..
        } => &FWD_SUPPLIED,
        PipelineMode::Forward {
            stats: StatsSource::Computed,
            ..
        } => &FWD_COMPUTED,
        PipelineMode::Backward { .. } => &BWD,
    }
}

/// Ordered kernel slots for one compile-time record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct KernelSet {
    pub mode: PipelineMode,
    pub slots: Vec<Option<KernelId>>,
}

impl KernelSet {
    pub fn for_mode(mode: PipelineMode) -> Self {
        Self {
            mode,
            slots: slots(mode).to_vec(),
        }
    }

    /// Kernel names in slot order, `None` where a slot is unused.
    pub fn names(&self) -> Vec<Option<&'static str>> {
        self.slots.iter().map(|slot| slot.map(KernelId::name)).collect()
    }

    pub fn requested(&self) -> impl Iterator<Item = KernelId> + '_ {
        self.slots.iter().flatten().copied()
    }

    pub fn slot_of(&self, id: KernelId) -> Option<usize> {
        self.slots.iter().position(|slot| *slot == Some(id))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Everything needed to request a compiled kernel bundle.
#[derive(Debug, Clone)]
pub struct ResolvedKernels {
    pub key: SerializedParams,
    pub set: KernelSet,
    pub defines: Vec<KernelDefine>,
}

pub fn resolve(conf: &BnormParams) -> ResolvedKernels {
    let set = KernelSet::for_mode(PipelineMode::of(conf));
    log::trace!(
        "bnorm: resolved {:?} -> {:?}",
        set.mode,
        set.requested().map(KernelId::name).collect::<Vec<_>>()
    );
    ResolvedKernels {
        key: conf.serialize(),
        set,
        defines: conf.kernel_ctx(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bnorm_accelerate_api::DataType;

    fn conf(direction: Direction, calculate_stats: bool) -> BnormParams {
        let mut p = BnormParams::new(DataType::F32, direction);
        p.set_flags(true, true, direction == Direction::Forward, calculate_stats);
        p
    }

    #[test]
    fn names_round_trip() {
        for id in KernelId::ALL {
            assert_eq!(KernelId::from_name(id.name()), Some(id));
        }
        assert_eq!(KernelId::from_name("bnorm_nope"), None);
    }

    #[test]
    fn forward_with_computed_stats_uses_five_kernels() {
        let resolved = resolve(&conf(Direction::Forward, true));
        assert_eq!(
            resolved.set.names(),
            vec![
                Some("bnorm_fwd"),
                Some("bnorm_calc_mean"),
                Some("bnorm_calc_variance"),
                Some("bnorm_reduce_mean"),
                Some("bnorm_reduce_variance"),
            ]
        );
    }

    #[test]
    fn forward_with_supplied_stats_keeps_slot_count() {
        let resolved = resolve(&conf(Direction::Forward, false));
        assert_eq!(resolved.set.len(), FWD_SLOTS);
        assert_eq!(resolved.set.requested().collect::<Vec<_>>(), vec![KernelId::Fwd]);
    }

    #[test]
    fn backward_always_uses_three_kernels() {
        for calc in [true, false] {
            let resolved = resolve(&conf(Direction::Backward, calc));
            assert_eq!(
                resolved.set.names(),
                vec![
                    Some("bnorm_bwd"),
                    Some("bnorm_calc_stats"),
                    Some("bnorm_reduce_stats")
                ]
            );
        }
    }

    #[test]
    fn fusion_changes_defines_not_slots() {
        let plain = conf(Direction::Forward, true);
        let mut fused = plain;
        fused.set_fusion(true, false, true, false);
        let a = resolve(&plain);
        let b = resolve(&fused);
        assert_eq!(a.set.slots, b.set.slots);
        assert_ne!(a.set.mode, b.set.mode);
        assert_ne!(a.key, b.key);
        assert_ne!(a.defines, b.defines);
    }
}
