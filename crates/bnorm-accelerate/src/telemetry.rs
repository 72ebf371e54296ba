use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BnormTelemetrySnapshot {
    pub kernel_builds: u64,
    pub kernel_cache_hits: u64,
    pub kernel_cache_misses: u64,
    pub submissions: u64,
    pub launches: u64,
    pub launch_wall_ns: u64,
}

#[derive(Default)]
pub struct BnormTelemetry {
    kernel_builds: AtomicU64,
    kernel_cache_hits: AtomicU64,
    kernel_cache_misses: AtomicU64,
    submissions: AtomicU64,
    launches: AtomicU64,
    launch_wall_ns: AtomicU64,
}

impl BnormTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_build(&self) {
        self.kernel_builds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.kernel_cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.kernel_cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_submission(&self) {
        self.submissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_launch(&self, wall_ns: u64) {
        self.launches.fetch_add(1, Ordering::Relaxed);
        if wall_ns > 0 {
            self.launch_wall_ns.fetch_add(wall_ns, Ordering::Relaxed);
        }
    }

    pub fn reset(&self) {
        self.kernel_builds.store(0, Ordering::Relaxed);
        self.kernel_cache_hits.store(0, Ordering::Relaxed);
        self.kernel_cache_misses.store(0, Ordering::Relaxed);
        self.submissions.store(0, Ordering::Relaxed);
        self.launches.store(0, Ordering::Relaxed);
        self.launch_wall_ns.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BnormTelemetrySnapshot {
        BnormTelemetrySnapshot {
            kernel_builds: self.kernel_builds.load(Ordering::Relaxed),
            kernel_cache_hits: self.kernel_cache_hits.load(Ordering::Relaxed),
            kernel_cache_misses: self.kernel_cache_misses.load(Ordering::Relaxed),
            submissions: self.submissions.load(Ordering::Relaxed),
            launches: self.launches.load(Ordering::Relaxed),
            launch_wall_ns: self.launch_wall_ns.load(Ordering::Relaxed),
        }
    }
}
