// Linux-specific probes: cgroup hierarchy, /proc/cpuinfo, cpufreq, iSCSI initiator, os-release.

use crate::models::CgroupVersion;
use std::path::Path;

/// The unified (v2) hierarchy exposes `cgroup.controllers` at its root; v1 never does.
pub(super) fn cgroup_version(root: &Path) -> CgroupVersion {
    if root.join("cgroup.controllers").is_file() {
        CgroupVersion::V2
    } else {
        CgroupVersion::V1
    }
}

/// First "cpu MHz" value of /proc/cpuinfo, truncated to whole MHz.
pub(super) fn parse_cpuinfo_mhz(content: &str) -> Option<u32> {
    content
        .lines()
        .filter(|l| l.starts_with("cpu MHz"))
        .find_map(|l| l.split_once(':'))
        .and_then(|(_, v)| v.trim().parse::<f64>().ok())
        .filter(|mhz| *mhz > 0.0)
        .map(|mhz| mhz as u32)
}

pub(super) fn read_cpuinfo_mhz(path: &Path) -> Option<u32> {
    let content = std::fs::read_to_string(path).ok()?;
    parse_cpuinfo_mhz(&content)
}

/// cpufreq reports kHz.
pub(super) fn read_cpufreq_max_mhz(path: &Path) -> Option<u32> {
    let khz = std::fs::read_to_string(path).ok()?.trim().parse::<u64>().ok()?;
    let mhz = (khz / 1000) as u32;
    (mhz > 0).then_some(mhz)
}

/// Value of the `InitiatorName=` line, skipping comments.
pub(super) fn parse_iqn(content: &str) -> Option<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#'))
        .find_map(|l| l.strip_prefix("InitiatorName="))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub(super) fn read_iqn(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    parse_iqn(&content)
}

/// PRETTY_NAME from os-release, falling back to NAME.
pub(super) fn parse_os_release(content: &str) -> Option<String> {
    let value = |key: &str| {
        content
            .lines()
            .find_map(|l| l.strip_prefix(key))
            .map(|v| v.trim().trim_matches('"').to_string())
            .filter(|v| !v.is_empty())
    };
    value("PRETTY_NAME=").or_else(|| value("NAME="))
}

pub(super) fn read_os_release(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    parse_os_release(&content)
}
