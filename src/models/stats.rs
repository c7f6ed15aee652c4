// Power state, per-VM statistics and health models

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Hypervisor-native domain state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    ShutOff,
    Crashed,
    PmSuspended,
    #[serde(other)]
    Unknown,
}

impl DomainState {
    /// Parse virsh `domstate` / `dominfo` output ("running", "shut off", "in shutdown").
    pub fn from_virsh(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "no state" | "nostate" => DomainState::NoState,
            "running" => DomainState::Running,
            "idle" | "blocked" => DomainState::Blocked,
            "paused" => DomainState::Paused,
            "in shutdown" | "shutdown" => DomainState::Shutdown,
            "shut off" | "shutoff" => DomainState::ShutOff,
            "crashed" => DomainState::Crashed,
            "pmsuspended" => DomainState::PmSuspended,
            _ => DomainState::Unknown,
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(
            self,
            DomainState::ShutOff | DomainState::Crashed | DomainState::Unknown
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    PowerOn,
    PowerOff,
    PowerUnknown,
}

impl From<DomainState> for PowerState {
    fn from(s: DomainState) -> Self {
        match s {
            DomainState::ShutOff | DomainState::Shutdown => PowerState::PowerOff,
            DomainState::Paused | DomainState::Running | DomainState::Blocked => PowerState::PowerOn,
            DomainState::NoState => PowerState::PowerUnknown,
            _ => PowerState::PowerUnknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthCheckResult {
    Success,
    Failure,
    Ignore,
}

impl HealthCheckResult {
    /// `None` for Ignore, so it is left out of reports.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HealthCheckResult::Success => Some(true),
            HealthCheckResult::Failure => Some(false),
            HealthCheckResult::Ignore => None,
        }
    }
}

/// Deltas since the previous poll. Fields are `None` when the delta was not positive
/// or when this poll only established the baseline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmStats {
    pub vm_name: String,
    pub num_cpus: u32,
    pub cpu_utilization: Option<f64>,
    pub network_read_kbs: Option<f64>,
    pub network_write_kbs: Option<f64>,
    pub disk_read_iops: Option<u64>,
    pub disk_write_iops: Option<u64>,
    pub disk_read_kbs: Option<f64>,
    pub disk_write_kbs: Option<f64>,
    pub memory_kbs: u64,
    pub int_free_memory_kbs: Option<u64>,
    pub int_usable_memory_kbs: Option<u64>,
    pub target_memory_kbs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmDiskStats {
    pub path: String,
    pub io_read: Option<u64>,
    pub io_write: Option<u64>,
    pub bytes_read: Option<u64>,
    pub bytes_write: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStatusReport {
    pub timestamp: u64,
    pub host_id: String,
    /// Only running VMs are reported.
    pub vm_states: BTreeMap<String, PowerState>,
    pub health: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_state_table() {
        assert_eq!(PowerState::from(DomainState::ShutOff), PowerState::PowerOff);
        assert_eq!(PowerState::from(DomainState::Paused), PowerState::PowerOn);
        assert_eq!(PowerState::from(DomainState::Running), PowerState::PowerOn);
        assert_eq!(PowerState::from(DomainState::Blocked), PowerState::PowerOn);
        assert_eq!(PowerState::from(DomainState::NoState), PowerState::PowerUnknown);
        assert_eq!(PowerState::from(DomainState::Shutdown), PowerState::PowerOff);
        assert_eq!(PowerState::from(DomainState::Crashed), PowerState::PowerUnknown);
    }

    #[test]
    fn virsh_state_strings() {
        assert_eq!(DomainState::from_virsh("shut off"), DomainState::ShutOff);
        assert_eq!(DomainState::from_virsh("in shutdown\n"), DomainState::Shutdown);
        assert_eq!(DomainState::from_virsh("weird"), DomainState::Unknown);
    }
}
