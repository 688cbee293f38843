//! CPU and memory accounting.
//!
//! Turns an instance's declared cores, speed and memory into the scheduler
//! tunables and memory sizes written into the domain, taking the host's
//! cgroup hierarchy into account.

use hvagent_core::{CapabilitySnapshot, CgroupVersion, InstanceSpec};

use crate::descriptor::CpuTune;

/// Scheduler period used when no floor adjustment is needed, µs.
pub const DEFAULT_PERIOD: u64 = 100_000;
/// Largest period the scheduler accepts, µs.
pub const MAX_PERIOD: u64 = 1_000_000;
/// Smallest quota the scheduler accepts, µs.
pub const MIN_QUOTA: i64 = 1_000;
/// Shares granted per core per MHz.
pub const CPU_SHARES_SCALE: u64 = 1;
/// Share budget of a whole host under the unified hierarchy.
pub const CGROUP_V2_MAX_WEIGHT_SHARES: u64 = 10_000;
/// Seconds between balloon statistics refreshes.
pub const BALLOON_STATS_PERIOD_SECS: u32 = 10;

/// Relative CPU weight for `cpus` cores at `speed_mhz`.
///
/// On a cgroup v2 host the result is raised to at least the per-core share
/// of the host budget so small guests keep a meaningful weight.
#[must_use]
pub fn cpu_shares(cpus: u32, speed_mhz: u32, caps: &CapabilitySnapshot) -> u64 {
    let shares = u64::from(cpus) * u64::from(speed_mhz) * CPU_SHARES_SCALE;
    match caps.cgroup_version {
        CgroupVersion::V1 => shares,
        CgroupVersion::V2 => {
            let host_cpus = u64::from(caps.host_cpus.max(1));
            let per_core = CGROUP_V2_MAX_WEIGHT_SHARES.div_ceil(host_cpus);
            shares.max(u64::from(cpus) * per_core)
        }
    }
}

/// Quota and period for a guest allowed `pct` of each period.
///
/// The quota never drops below [`MIN_QUOTA`]. When the floor applies the
/// period is stretched so the ratio still matches `pct`, capped at
/// [`MAX_PERIOD`].
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss, clippy::cast_sign_loss)]
pub fn quota_and_period(pct: f64) -> (i64, u64) {
    let raw = (DEFAULT_PERIOD as f64 * pct).round() as i64;
    if raw >= MIN_QUOTA {
        return (raw, DEFAULT_PERIOD);
    }
    let stretched = (MIN_QUOTA as f64 / pct).round();
    let period = if stretched.is_finite() && stretched < MAX_PERIOD as f64 {
        (stretched as u64).max(DEFAULT_PERIOD)
    } else {
        MAX_PERIOD
    };
    (MIN_QUOTA, period)
}

/// Scheduler tunables for cores, speed and an optional hard cap.
#[must_use]
pub fn cpu_tune_for(
    cpus: u32,
    speed_mhz: u32,
    limit: Option<f64>,
    caps: &CapabilitySnapshot,
) -> CpuTune {
    let shares = cpu_shares(cpus, speed_mhz, caps);
    match limit {
        Some(pct) => {
            let (quota, period) = quota_and_period(pct);
            CpuTune { shares, quota, period }
        }
        None => CpuTune { shares, quota: 0, period: 0 },
    }
}

/// Scheduler tunables for an instance.
///
/// Dynamically scaled instances are weighted by their guaranteed speed,
/// others by their offered speed.
#[must_use]
pub fn cpu_tune(spec: &InstanceSpec, caps: &CapabilitySnapshot) -> CpuTune {
    let speed = if spec.enable_dynamic_scaling { spec.min_speed_mhz } else { spec.max_speed_mhz };
    let limit = if spec.limit_cpu_use { spec.cpu_quota_percentage } else { None };
    cpu_tune_for(spec.cpus, speed, limit, caps)
}

/// Memory sizes for a domain, KiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryPlan {
    pub max_kib: u64,
    pub current_kib: u64,
    /// Whether a balloon device is attached.
    pub balloon: bool,
}

/// Size the domain memory.
///
/// With ballooning the guest boots with its guaranteed memory and may grow to
/// the maximum; without it, or when the instance opts out with the
/// `noMemBalloon` detail, it boots with the maximum.
#[must_use]
pub fn memory_plan(spec: &InstanceSpec, ballooning: bool) -> MemoryPlan {
    let max_kib = spec.max_ram_bytes / 1024;
    let opted_out = spec.detail_flag(hvagent_core::instance::detail::NO_MEM_BALLOON);
    if ballooning && !opted_out {
        MemoryPlan { max_kib, current_kib: spec.min_ram_bytes / 1024, balloon: true }
    } else {
        MemoryPlan { max_kib, current_kib: max_kib, balloon: false }
    }
}
