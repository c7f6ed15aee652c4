// CPU shares, quota/period and topology policies

use crate::models::{CpuTopology, CpuTune, HostCapabilities, VmSpec, detail};

/// Upper bound of the cgroup v2 cpu.weight range that shares are scaled into.
pub const CGROUP_V2_UPPER_LIMIT: u64 = 10_000;

pub const DEFAULT_PERIOD: u64 = 10_000;
pub const MIN_QUOTA: i64 = 1000;
pub const MAX_PERIOD: u64 = 1_000_000;

/// `vcpus * (min_speed or speed)`, rescaled under cgroup v2.
pub fn cpu_shares(vcpus: u32, speed_mhz: u32, min_speed_mhz: Option<u32>, host_max_capacity: u64) -> u64 {
    let requested = vcpus as u64 * min_speed_mhz.unwrap_or(speed_mhz) as u64;
    if host_max_capacity > 0 {
        (requested * CGROUP_V2_UPPER_LIMIT).div_ceil(host_max_capacity)
    } else {
        requested
    }
}

/// Hard cap from the quota fraction. `None` unless CPU limiting is requested.
pub fn quota_and_period(limit_cpu_use: bool, quota_fraction: Option<f64>) -> Option<(i64, u64)> {
    if !limit_cpu_use {
        return None;
    }
    let pct = quota_fraction.filter(|p| *p > 0.0)?;
    let mut period = DEFAULT_PERIOD;
    let mut quota = (period as f64 * pct) as i64;
    if quota < MIN_QUOTA {
        quota = MIN_QUOTA;
        period = ((quota as f64 / pct) as u64).min(MAX_PERIOD);
    }
    Some((quota, period))
}

pub fn cpu_tune(spec: &VmSpec, caps: &HostCapabilities) -> CpuTune {
    let shares = cpu_shares(
        spec.vcpus,
        spec.speed_mhz,
        spec.min_speed_mhz,
        caps.host_max_capacity,
    );
    let (quota, period) = match quota_and_period(spec.limit_cpu_use, spec.cpu_quota_percentage) {
        Some((q, p)) => (Some(q), Some(p)),
        None => (None, None),
    };
    CpuTune {
        shares,
        quota,
        period,
    }
}

/// Sockets x cores x threads for `vcpus`. Declared values that do not divide the
/// vCPU count fall back to 1x1, after which 6 or 4 cores per socket are preferred.
pub fn topology(vcpus: u32, cores_per_socket: Option<u32>, threads_per_core: Option<u32>) -> CpuTopology {
    let vcpus = vcpus.max(1);
    let mut cores = cores_per_socket.filter(|c| *c > 0).unwrap_or(1);
    let mut threads = threads_per_core.filter(|t| *t > 0).unwrap_or(1);
    if cores * threads > vcpus || vcpus % (cores * threads) != 0 {
        cores = 1;
        threads = 1;
    }
    if cores == 1 && threads == 1 {
        if vcpus % 6 == 0 {
            cores = 6;
        } else if vcpus % 4 == 0 {
            cores = 4;
        }
        CpuTopology {
            sockets: vcpus / cores,
            cores,
            threads,
        }
    } else {
        CpuTopology {
            sockets: (vcpus / threads) / cores,
            cores,
            threads,
        }
    }
}

pub fn topology_for(spec: &VmSpec) -> CpuTopology {
    let declared = |key: &str| {
        let v = spec.detail_i64(key, 1);
        u32::try_from(v).ok()
    };
    topology(
        spec.vcpus_in_def(),
        declared(detail::CORES_PER_SOCKET),
        declared(detail::THREADS_PER_CORE),
    )
}

/// Number of virtio-scsi controllers: the declared cores-per-socket when it divides
/// the vCPU count, else 6, 4, or one per vCPU.
pub fn scsi_controller_count(vcpus: u32, spec: &VmSpec) -> u32 {
    let declared = spec.detail_i64(detail::CORES_PER_SOCKET, -1);
    if declared > 0 && vcpus as i64 % declared == 0 {
        return declared as u32;
    }
    if vcpus % 6 == 0 {
        6
    } else if vcpus % 4 == 0 {
        4
    } else {
        vcpus.max(1)
    }
}
