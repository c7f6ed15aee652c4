// Host capability and registration models

use super::vm::PoolType;
use super::stats::HealthCheckResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CgroupVersion {
    V1,
    V2,
}

/// Firmware paths for UEFI guests, keyed the way the host's uefi properties name them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UefiTables {
    pub loader_legacy: Option<String>,
    pub loader_secure: Option<String>,
    pub nvram_path: Option<String>,
    pub nvram_template_legacy: Option<String>,
    pub nvram_template_secure: Option<String>,
}

impl UefiTables {
    pub fn is_available(&self) -> bool {
        self.loader_legacy.is_some() || self.loader_secure.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskActivitySettings {
    pub enabled: bool,
    pub timeout_secs: u64,
    pub inactive_threshold_ms: u64,
    pub min_file_size_bytes: u64,
}

impl Default for DiskActivitySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: 120,
            inactive_threshold_ms: 30_000,
            min_file_size_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostCapabilities {
    pub cgroup_version: CgroupVersion,
    pub cpu_cores: u32,
    pub cpu_speed_mhz: u32,
    /// `cpu_cores * cpu_speed_mhz` under cgroup v2, 0 under v1.
    pub host_max_capacity: u64,
    pub total_memory_bytes: u64,
    pub arch: String,
    /// Libvirt-encoded (major * 1_000_000 + minor * 1000 + release).
    pub hypervisor_version: u64,
    pub toolstack_version: u64,
    pub uefi: UefiTables,
    pub tpm_supported: bool,
    pub disk_activity: DiskActivitySettings,
}

impl HostCapabilities {
    pub fn is_cgroup_v2(&self) -> bool {
        self.cgroup_version == CgroupVersion::V2
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupInfo {
    pub host_id: String,
    pub guid: String,
    pub zone: String,
    pub pod: String,
    pub cluster: String,
    pub cpus: u32,
    pub speed_mhz: u32,
    pub host_max_capacity: u64,
    pub memory_bytes: u64,
    pub reserved_memory_bytes: u64,
    pub capabilities: String,
    pub hypervisor_version: String,
    pub versions: BTreeMap<String, String>,
    pub iqn: Option<String>,
    pub cpu_arch: String,
    pub guest_cpu_mode: String,
    pub guest_cpu_model: Option<String>,
    pub host_tags: Vec<String>,
    pub secured: bool,
    pub volume_encryption_supported: bool,
    pub instance_conversion_supported: bool,
    pub host_health_check_result: Option<bool>,
}

impl StartupInfo {
    pub fn with_health(mut self, health: HealthCheckResult) -> Self {
        self.host_health_check_result = health.as_bool();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupStoragePool {
    pub uuid: String,
    pub path: String,
    pub pool_type: PoolType,
    pub host: String,
    pub capacity_bytes: u64,
    pub available_bytes: u64,
}
