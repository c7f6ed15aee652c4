use crate::error::AgentError;
use crate::models::{DiskActivitySettings, UefiTables, VifDriverKind};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub server: ServerConfig,
    pub agent: HostConfig,
    pub hypervisor: HypervisorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub network: NetworkConfig,
    pub scripts: ScriptsConfig,
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub uefi: UefiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    pub host_id: String,
    pub guid: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub pod: String,
    #[serde(default)]
    pub cluster: String,
    /// Comma-separated, duplicates removed at startup.
    #[serde(default)]
    pub host_tags: String,
    #[serde(default = "default_local_storage_path")]
    pub local_storage_path: String,
    #[serde(default)]
    pub local_storage_uuid: Option<String>,
    #[serde(default)]
    pub reserved_memory_mb: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default)]
    pub secured: bool,
    #[serde(default)]
    pub instance_conversion_supported: bool,
    #[serde(default = "default_iqn_file")]
    pub iscsi_initiator_file: String,
}

fn default_local_storage_path() -> String {
    "/var/lib/libvirt/images/".into()
}

fn default_command_timeout_secs() -> u64 {
    3600
}

fn default_iqn_file() -> String {
    "/etc/iscsi/initiatorname.iscsi".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorBackend {
    Virsh,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HypervisorConfig {
    pub backend: HypervisorBackend,
    #[serde(default = "default_uri")]
    pub uri: String,
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    #[serde(default = "default_stop_poll_interval_ms")]
    pub stop_poll_interval_ms: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_guest_cpu_mode")]
    pub guest_cpu_mode: String,
    #[serde(default)]
    pub guest_cpu_model: Option<String>,
    #[serde(default)]
    pub no_kvm_clock: bool,
    #[serde(default)]
    pub rng_enabled: bool,
    #[serde(default = "default_rng_path")]
    pub rng_path: String,
    #[serde(default = "default_rng_rate_bytes")]
    pub rng_rate_bytes: u32,
    #[serde(default = "default_rng_rate_period_ms")]
    pub rng_rate_period_ms: u32,
    #[serde(default)]
    pub ballooning: bool,
    #[serde(default)]
    pub memballoon_stats_period_secs: u32,
    #[serde(default = "default_video_hardware")]
    pub video_hardware: String,
    #[serde(default)]
    pub video_ram_kib: u32,
    #[serde(default = "default_sockets_dir")]
    pub sockets_dir: String,
    #[serde(default = "default_systemvm_iso")]
    pub systemvm_iso_path: String,
    #[serde(default)]
    pub tpm_enabled: bool,
}

fn default_uri() -> String {
    "qemu:///system".into()
}

fn default_stop_timeout_ms() -> u64 {
    120_000
}

fn default_stop_poll_interval_ms() -> u64 {
    2000
}

fn default_call_timeout_secs() -> u64 {
    60
}

fn default_guest_cpu_mode() -> String {
    "host-passthrough".into()
}

fn default_rng_path() -> String {
    "/dev/random".into()
}

fn default_rng_rate_bytes() -> u32 {
    2048
}

fn default_rng_rate_period_ms() -> u32 {
    1000
}

fn default_video_hardware() -> String {
    "cirrus".into()
}

fn default_sockets_dir() -> String {
    "/var/lib/libvirt/qemu".into()
}

fn default_systemvm_iso() -> String {
    "/usr/share/cloudstack-common/vms/systemvm.iso".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoragePoolEntry {
    pub uuid: String,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub disk_activity_check_enabled: bool,
    #[serde(default = "default_activity_timeout")]
    pub disk_activity_check_timeout_secs: u64,
    #[serde(default = "default_activity_threshold")]
    pub disk_activity_inactive_threshold_ms: u64,
    #[serde(default = "default_activity_min_size")]
    pub disk_activity_min_file_size_mb: u64,
    /// Additional locally mounted pools, keyed by uuid.
    #[serde(default)]
    pub pools: Vec<StoragePoolEntry>,
    #[serde(default = "default_nfs_mount_root")]
    pub nfs_mount_root: String,
}

fn default_activity_timeout() -> u64 {
    120
}

fn default_activity_threshold() -> u64 {
    30_000
}

fn default_activity_min_size() -> u64 {
    10
}

fn default_nfs_mount_root() -> String {
    "/mnt".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            disk_activity_check_enabled: false,
            disk_activity_check_timeout_secs: default_activity_timeout(),
            disk_activity_inactive_threshold_ms: default_activity_threshold(),
            disk_activity_min_file_size_mb: default_activity_min_size(),
            pools: Vec::new(),
            nfs_mount_root: default_nfs_mount_root(),
        }
    }
}

impl StorageConfig {
    pub fn disk_activity(&self) -> DiskActivitySettings {
        DiskActivitySettings {
            enabled: self.disk_activity_check_enabled,
            timeout_secs: self.disk_activity_check_timeout_secs,
            inactive_threshold_ms: self.disk_activity_inactive_threshold_ms,
            min_file_size_bytes: self.disk_activity_min_file_size_mb * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeType {
    Native,
    Openvswitch,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub bridge_type: BridgeType,
    pub public_bridge: String,
    pub private_bridge: String,
    #[serde(default)]
    pub guest_bridge: Option<String>,
    /// Traffic type name -> driver key ("bridge", "openvswitch", "overlay").
    #[serde(default)]
    pub vif_drivers: BTreeMap<String, String>,
    #[serde(default = "default_sysfs_net")]
    pub sysfs_net_dir: String,
    /// Link-local bridge for system VM control traffic, created at startup.
    #[serde(default)]
    pub control_bridge: Option<String>,
}

fn default_sysfs_net() -> String {
    "/sys/devices/virtual/net".into()
}

impl NetworkConfig {
    pub fn default_driver(&self) -> VifDriverKind {
        match self.bridge_type {
            BridgeType::Openvswitch => VifDriverKind::OpenVSwitch,
            BridgeType::Native => VifDriverKind::Bridge,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptsConfig {
    pub dir: String,
    #[serde(default)]
    pub health_check: Option<String>,
    #[serde(default = "default_script_timeout")]
    pub timeout_secs: u64,
}

fn default_script_timeout() -> u64 {
    30
}

/// Scripts the agent cannot run without.
pub const REQUIRED_SCRIPTS: &[&str] = &[
    "versions.sh",
    "kvmheartbeat.sh",
    "kvmvmactivity.sh",
    "security_group.py",
    "ovstunnel.py",
    "network_usage.sh",
    "modifyvlan.sh",
];

/// Absolute paths of the required scripts, checked to exist.
#[derive(Debug, Clone)]
pub struct ScriptPaths {
    pub versions: PathBuf,
    pub heartbeat: PathBuf,
    pub vm_activity: PathBuf,
    pub security_group: PathBuf,
    pub ovs_tunnel: PathBuf,
    pub network_usage: PathBuf,
    pub modify_vlan: PathBuf,
    pub health_check: Option<PathBuf>,
}

impl ScriptsConfig {
    /// Resolve every required script under `dir`. A missing one is a configuration error.
    pub fn resolve(&self) -> Result<ScriptPaths, AgentError> {
        let dir = Path::new(&self.dir);
        let find = |name: &str| -> Result<PathBuf, AgentError> {
            let p = dir.join(name);
            if p.is_file() {
                Ok(p)
            } else {
                Err(AgentError::configuration(format!(
                    "unable to find script {} in {}",
                    name,
                    dir.display()
                )))
            }
        };
        Ok(ScriptPaths {
            versions: find("versions.sh")?,
            heartbeat: find("kvmheartbeat.sh")?,
            vm_activity: find("kvmvmactivity.sh")?,
            security_group: find("security_group.py")?,
            ovs_tunnel: find("ovstunnel.py")?,
            network_usage: find("network_usage.sh")?,
            modify_vlan: find("modifyvlan.sh")?,
            health_check: self
                .health_check
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    pub sample_interval_ms: u64,
    /// How often to log agent stats at INFO level.
    pub stats_log_interval_secs: u64,
    /// Max number of status reports kept for /ws/status (slow clients may lag).
    pub broadcast_capacity: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UefiConfig {
    #[serde(rename = "guest.loader.legacy", default)]
    pub loader_legacy: Option<String>,
    #[serde(rename = "guest.loader.secure", default)]
    pub loader_secure: Option<String>,
    #[serde(rename = "guest.nvram.path", default)]
    pub nvram_path: Option<String>,
    #[serde(rename = "guest.nvram.template.legacy", default)]
    pub nvram_template_legacy: Option<String>,
    #[serde(rename = "guest.nvram.template.secure", default)]
    pub nvram_template_secure: Option<String>,
}

impl UefiConfig {
    pub fn tables(&self) -> UefiTables {
        UefiTables {
            loader_legacy: self.loader_legacy.clone(),
            loader_secure: self.loader_secure.clone(),
            nvram_path: self.nvram_path.clone(),
            nvram_template_legacy: self.nvram_template_legacy.clone(),
            nvram_template_secure: self.nvram_template_secure.clone(),
        }
    }
}

impl AgentConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".into());
        let s = std::fs::read_to_string(&path)?;
        Self::load_from_str(&s)
    }

    /// Parse and validate config from a string (e.g. for tests).
    pub fn load_from_str(s: &str) -> anyhow::Result<Self> {
        let config: AgentConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.server.port > 0,
            "server.port must be between 1 and 65535, got {}",
            self.server.port
        );
        anyhow::ensure!(
            !self.agent.host_id.is_empty(),
            "agent.host_id must be non-empty"
        );
        anyhow::ensure!(!self.agent.guid.is_empty(), "agent.guid must be non-empty");
        anyhow::ensure!(
            self.agent.command_timeout_secs > 0,
            "agent.command_timeout_secs must be > 0, got {}",
            self.agent.command_timeout_secs
        );
        anyhow::ensure!(
            self.hypervisor.stop_poll_interval_ms > 0,
            "hypervisor.stop_poll_interval_ms must be > 0, got {}",
            self.hypervisor.stop_poll_interval_ms
        );
        anyhow::ensure!(
            self.hypervisor.stop_timeout_ms >= self.hypervisor.stop_poll_interval_ms,
            "hypervisor.stop_timeout_ms must be >= stop_poll_interval_ms, got {}",
            self.hypervisor.stop_timeout_ms
        );
        anyhow::ensure!(
            self.hypervisor.call_timeout_secs > 0,
            "hypervisor.call_timeout_secs must be > 0, got {}",
            self.hypervisor.call_timeout_secs
        );
        anyhow::ensure!(
            matches!(
                self.hypervisor.guest_cpu_mode.as_str(),
                "host-passthrough" | "host-model" | "custom"
            ),
            "hypervisor.guest_cpu_mode must be host-passthrough, host-model or custom, got {}",
            self.hypervisor.guest_cpu_mode
        );
        anyhow::ensure!(
            self.hypervisor.guest_cpu_mode != "custom" || self.hypervisor.guest_cpu_model.is_some(),
            "hypervisor.guest_cpu_model is required when guest_cpu_mode is custom"
        );
        anyhow::ensure!(
            !self.network.public_bridge.is_empty(),
            "network.public_bridge must be non-empty"
        );
        anyhow::ensure!(
            !self.network.private_bridge.is_empty(),
            "network.private_bridge must be non-empty"
        );
        for (traffic, driver) in &self.network.vif_drivers {
            anyhow::ensure!(
                crate::models::TrafficType::parse(traffic).is_some(),
                "network.vif_drivers: unknown traffic type {}",
                traffic
            );
            anyhow::ensure!(
                VifDriverKind::parse(driver).is_some(),
                "network.vif_drivers.{}: unknown driver {}",
                traffic,
                driver
            );
        }
        anyhow::ensure!(!self.scripts.dir.is_empty(), "scripts.dir must be non-empty");
        anyhow::ensure!(
            self.scripts.timeout_secs > 0,
            "scripts.timeout_secs must be > 0, got {}",
            self.scripts.timeout_secs
        );
        anyhow::ensure!(
            self.monitoring.sample_interval_ms > 0,
            "monitoring.sample_interval_ms must be > 0, got {}",
            self.monitoring.sample_interval_ms
        );
        anyhow::ensure!(
            self.monitoring.stats_log_interval_secs > 0,
            "monitoring.stats_log_interval_secs must be > 0, got {}",
            self.monitoring.stats_log_interval_secs
        );
        anyhow::ensure!(
            self.monitoring.broadcast_capacity > 0,
            "monitoring.broadcast_capacity must be > 0, got {}",
            self.monitoring.broadcast_capacity
        );
        Ok(())
    }

    /// The local storage pool followed by any extra configured pools. A local
    /// pool without a configured uuid gets one derived from its path.
    pub fn local_pools(&self) -> Vec<StoragePoolEntry> {
        let path = self.agent.local_storage_path.clone();
        let uuid = self
            .agent
            .local_storage_uuid
            .clone()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| {
                uuid::Uuid::new_v3(&uuid::Uuid::NAMESPACE_URL, path.as_bytes()).to_string()
            });
        let mut pools = vec![StoragePoolEntry { uuid, path }];
        for extra in &self.storage.pools {
            if !pools.iter().any(|p| p.uuid == extra.uuid) {
                pools.push(extra.clone());
            }
        }
        pools
    }

    /// De-duplicated, trimmed host tags in first-seen order.
    pub fn host_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = Vec::new();
        for tag in self.agent.host_tags.split(',') {
            let tag = tag.trim();
            if !tag.is_empty() && !tags.iter().any(|t| t == tag) {
                tags.push(tag.to_string());
            }
        }
        tags
    }
}
