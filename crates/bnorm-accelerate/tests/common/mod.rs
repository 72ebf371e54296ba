#![allow(dead_code)]

use bnorm_accelerate::InProcessProvider;
use bnorm_accelerate_api::{GpuBufferHandle, MemoryDesc, MemoryLayout};

pub const EPS: f32 = 1e-5;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic values in `[-1, 1)`.
pub fn pseudo_random(len: usize, seed: u64) -> Vec<f32> {
    let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            ((state >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
        })
        .collect()
}

/// Logical tensor in `[n][c][spatial]` order plus its shape.
#[derive(Debug, Clone)]
pub struct Logical {
    pub mb: usize,
    pub ic: usize,
    pub spatial: usize,
    pub data: Vec<f32>,
}

impl Logical {
    pub fn random(md: &MemoryDesc, seed: u64) -> Self {
        Self {
            mb: md.mb(),
            ic: md.channels(),
            spatial: md.spatial(),
            data: pseudo_random(md.mb() * md.channels() * md.spatial(), seed),
        }
    }

    pub fn at(&self, n: usize, c: usize, s: usize) -> f32 {
        self.data[(n * self.ic + c) * self.spatial + s]
    }

    pub fn with_data(&self, data: Vec<f32>) -> Self {
        Self {
            data,
            ..self.clone()
        }
    }
}

pub fn physical_index(md: &MemoryDesc, n: usize, c: usize, s: usize) -> usize {
    let channels = md.padded_channels();
    let spatial = md.spatial();
    match md.layout {
        MemoryLayout::Plain | MemoryLayout::Any => (n * channels + c) * spatial + s,
        MemoryLayout::ChannelsLast => (n * spatial + s) * channels + c,
        MemoryLayout::Blocked { channel_block } => {
            let b = channel_block as usize;
            ((n * (channels / b) + c / b) * spatial + s) * b + c % b
        }
    }
}

pub fn to_physical(md: &MemoryDesc, t: &Logical) -> Vec<f32> {
    let mut out = vec![0.0; md.size_in_bytes() / 4];
    for n in 0..t.mb {
        for c in 0..t.ic {
            for s in 0..t.spatial {
                out[physical_index(md, n, c, s)] = t.at(n, c, s);
            }
        }
    }
    out
}

pub fn from_physical(md: &MemoryDesc, physical: &[f32]) -> Logical {
    let (mb, ic, spatial) = (md.mb(), md.channels(), md.spatial());
    let mut data = vec![0.0; mb * ic * spatial];
    for n in 0..mb {
        for c in 0..ic {
            for s in 0..spatial {
                data[(n * ic + c) * spatial + s] = physical[physical_index(md, n, c, s)];
            }
        }
    }
    Logical {
        mb,
        ic,
        spatial,
        data,
    }
}

pub fn upload(provider: &InProcessProvider, md: &MemoryDesc, t: &Logical) -> GpuBufferHandle {
    provider.upload_f32(&to_physical(md, t)).unwrap()
}

pub fn zeros(provider: &InProcessProvider, len: usize) -> GpuBufferHandle {
    provider.upload_f32(&vec![0.0; len]).unwrap()
}

pub fn download(provider: &InProcessProvider, md: &MemoryDesc, h: &GpuBufferHandle) -> Logical {
    from_physical(md, &provider.download_f32(h).unwrap())
}

pub fn stats(t: &Logical) -> (Vec<f32>, Vec<f32>) {
    let m = (t.mb * t.spatial) as f64;
    let mut mean = vec![0.0; t.ic];
    let mut var = vec![0.0; t.ic];
    for c in 0..t.ic {
        let mut sum = 0.0f64;
        for n in 0..t.mb {
            for s in 0..t.spatial {
                sum += t.at(n, c, s) as f64;
            }
        }
        let mu = sum / m;
        let mut sq = 0.0f64;
        for n in 0..t.mb {
            for s in 0..t.spatial {
                let d = t.at(n, c, s) as f64 - mu;
                sq += d * d;
            }
        }
        mean[c] = mu as f32;
        var[c] = (sq / m) as f32;
    }
    (mean, var)
}

/// `y = gamma * (x - mean) / sqrt(var + eps) + beta`, then optional relu.
pub fn reference_forward(
    t: &Logical,
    mean: &[f32],
    var: &[f32],
    gamma: &[f32],
    beta: &[f32],
    relu: bool,
) -> Logical {
    let mut out = t.clone();
    for n in 0..t.mb {
        for c in 0..t.ic {
            let invstd = 1.0 / (var[c] + EPS).sqrt();
            for s in 0..t.spatial {
                let idx = (n * t.ic + c) * t.spatial + s;
                let y = (t.data[idx] - mean[c]) * invstd * gamma[c] + beta[c];
                out.data[idx] = if relu { y.max(0.0) } else { y };
            }
        }
    }
    out
}

pub struct BackwardRef {
    pub diff_src: Logical,
    pub diff_scale: Vec<f32>,
    pub diff_shift: Vec<f32>,
}

/// Training backward over computed statistics.
pub fn reference_backward(
    t: &Logical,
    dy: &Logical,
    mean: &[f32],
    var: &[f32],
    gamma: &[f32],
) -> BackwardRef {
    let m = (t.mb * t.spatial) as f32;
    let mut diff_scale = vec![0.0; t.ic];
    let mut diff_shift = vec![0.0; t.ic];
    for c in 0..t.ic {
        let invstd = 1.0 / (var[c] + EPS).sqrt();
        for n in 0..t.mb {
            for s in 0..t.spatial {
                diff_scale[c] += (t.at(n, c, s) - mean[c]) * dy.at(n, c, s);
                diff_shift[c] += dy.at(n, c, s);
            }
        }
        diff_scale[c] *= invstd;
    }
    let mut diff_src = t.clone();
    for n in 0..t.mb {
        for c in 0..t.ic {
            let invstd = 1.0 / (var[c] + EPS).sqrt();
            for s in 0..t.spatial {
                let idx = (n * t.ic + c) * t.spatial + s;
                let centered = (t.data[idx] - mean[c]) * invstd;
                diff_src.data[idx] = gamma[c]
                    * invstd
                    * (dy.data[idx] - diff_shift[c] / m - centered * diff_scale[c] / m);
            }
        }
    }
    BackwardRef {
        diff_src,
        diff_scale,
        diff_shift,
    }
}

pub fn assert_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        let bound = tol * (1.0 + e.abs());
        assert!(
            (a - e).abs() <= bound,
            "element {i}: got {a}, expected {e} (tol {bound})"
        );
    }
}
