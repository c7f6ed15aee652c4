// VM specification as received from the orchestrator

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known keys of `VmSpec::details`.
pub mod detail {
    pub const CORES_PER_SOCKET: &str = "cpu.corespersocket";
    pub const THREADS_PER_CORE: &str = "cpu.threadspercore";
    pub const ROOT_DISK_CONTROLLER: &str = "rootDiskController";
    pub const DATA_DISK_CONTROLLER: &str = "dataDiskController";
    pub const NIC_MULTIQUEUE_NUMBER: &str = "nicMultiqueueNumber";
    pub const NIC_PACKED_VIRTQUEUES_ENABLED: &str = "nicPackedVirtQueuesEnabled";
    pub const VIDEO_HARDWARE: &str = "video.hardware";
    pub const VIDEO_RAM: &str = "video.ram";
    pub const IOTHREADS: &str = "iothreads";
    pub const GUEST_CPU_MODE: &str = "guest.cpu.mode";
    pub const GUEST_CPU_MODEL: &str = "guest.cpu.model";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmType {
    User,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestOs {
    /// OS display name, e.g. "Windows Server 2019" or "Ubuntu 22.04".
    pub os: String,
    /// Emulator family used for disk bus selection; `None` when the orchestrator has no mapping.
    #[serde(default)]
    pub platform_emulator: Option<String>,
    #[serde(default = "default_arch")]
    pub arch: String,
    #[serde(default)]
    pub guest_cpu_arch: Option<String>,
}

fn default_arch() -> String {
    "x86_64".into()
}

impl GuestOs {
    /// Architecture the guest runs as; `guest_cpu_arch` wins over the host arch.
    pub fn effective_arch(&self) -> &str {
        self.guest_cpu_arch.as_deref().unwrap_or(&self.arch)
    }

    pub fn is_aarch64(&self) -> bool {
        self.effective_arch() == "aarch64"
    }

    pub fn is_windows(&self) -> bool {
        self.os.starts_with("Windows")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TpmVersion {
    #[serde(rename = "1.2")]
    V1_2,
    #[serde(rename = "2.0")]
    V2_0,
}

impl TpmVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            TpmVersion::V1_2 => "1.2",
            TpmVersion::V2_0 => "2.0",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootOptions {
    #[serde(default)]
    pub uefi: bool,
    #[serde(default)]
    pub secure_boot: bool,
    #[serde(default)]
    pub tpm_version: Option<TpmVersion>,
    /// Kernel command line for system VMs.
    #[serde(default)]
    pub boot_args: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DiskRole {
    Root,
    Data,
    Iso,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolType {
    Filesystem,
    NetworkFilesystem,
    SharedMountPoint,
    #[serde(rename = "RBD")]
    Rbd,
    #[serde(rename = "CLVM")]
    Clvm,
    Gluster,
    PowerFlex,
    StorPool,
    Iscsi,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Qcow2,
    Raw,
    Iso,
    Dir,
}

impl DiskFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
            DiskFormat::Iso => "iso",
            DiskFormat::Dir => "dir",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    None,
    Writeback,
    Writethrough,
    Directsync,
    Unsafe,
}

impl CacheMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::None => "none",
            CacheMode::Writeback => "writeback",
            CacheMode::Writethrough => "writethrough",
            CacheMode::Directsync => "directsync",
            CacheMode::Unsafe => "unsafe",
        }
    }
}

/// Byte/IOPS throttling. Zero means "unset".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimits {
    pub bytes_read_rate: u64,
    pub bytes_read_rate_max: u64,
    pub bytes_read_rate_max_length: u64,
    pub bytes_write_rate: u64,
    pub bytes_write_rate_max: u64,
    pub bytes_write_rate_max_length: u64,
    pub iops_read_rate: u64,
    pub iops_read_rate_max: u64,
    pub iops_read_rate_max_length: u64,
    pub iops_write_rate: u64,
    pub iops_write_rate_max: u64,
    pub iops_write_rate_max_length: u64,
}

impl RateLimits {
    pub fn is_empty(&self) -> bool {
        *self == RateLimits::default()
    }
}

/// Where a volume lives. For ISOs the `path` may be a full `nfs://host/dir/file.iso` URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolRef {
    pub pool_type: PoolType,
    pub uuid: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Remote path (NFS export, RBD pool name, Gluster volume).
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub user_info: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskSpec {
    pub uuid: String,
    pub role: DiskRole,
    /// Device ordering; unique per VM.
    pub seq: u32,
    pub path: String,
    #[serde(default)]
    pub pool: Option<PoolRef>,
    #[serde(default)]
    pub cache_mode: Option<CacheMode>,
    #[serde(default)]
    pub rate_limits: RateLimits,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub shareable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrafficType {
    Guest,
    Public,
    Private,
    Control,
    Management,
    Storage,
}

impl TrafficType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficType::Guest => "Guest",
            TrafficType::Public => "Public",
            TrafficType::Private => "Private",
            TrafficType::Control => "Control",
            TrafficType::Management => "Management",
            TrafficType::Storage => "Storage",
        }
    }

    /// Case-insensitive parse, used for config keys.
    pub fn parse(s: &str) -> Option<Self> {
        [
            TrafficType::Guest,
            TrafficType::Public,
            TrafficType::Private,
            TrafficType::Control,
            TrafficType::Management,
            TrafficType::Storage,
        ]
        .into_iter()
        .find(|t| t.as_str().eq_ignore_ascii_case(s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NicSpec {
    pub mac: String,
    pub traffic_type: TrafficType,
    /// `vlan://N`, `vxlan://N`, `vswitch://KEY` or `untagged`.
    #[serde(default)]
    pub broadcast_uri: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub device_id: u32,
    #[serde(default)]
    pub network_rate_mbps: Option<u32>,
    /// Explicit bridge name; overrides the traffic-type default.
    #[serde(default)]
    pub bridge: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmSpec {
    pub uuid: String,
    pub name: String,
    pub vm_type: VmType,
    pub guest: GuestOs,
    pub vcpus: u32,
    #[serde(default)]
    pub vcpu_max_limit: Option<u32>,
    pub min_ram_bytes: u64,
    pub max_ram_bytes: u64,
    pub speed_mhz: u32,
    #[serde(default)]
    pub min_speed_mhz: Option<u32>,
    #[serde(default)]
    pub limit_cpu_use: bool,
    /// Fraction of one host CPU (0.5 = half a core) applied as a hard cap.
    #[serde(default)]
    pub cpu_quota_percentage: Option<f64>,
    #[serde(default)]
    pub disks: Vec<DiskSpec>,
    #[serde(default)]
    pub nics: Vec<NicSpec>,
    #[serde(default)]
    pub boot: BootOptions,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
    /// Raw domain XML fragments appended for user VMs.
    #[serde(default)]
    pub extra_config: BTreeMap<String, String>,
    #[serde(default)]
    pub vnc_password: Option<String>,
    #[serde(default)]
    pub vnc_addr: Option<String>,
}

impl VmSpec {
    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details.get(key).map(String::as_str)
    }

    /// Integer detail, falling back to `default` when absent or unparsable.
    pub fn detail_i64(&self, key: &str, default: i64) -> i64 {
        self.detail(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    /// vCPU count written into the definition (max when hot-add is allowed).
    pub fn vcpus_in_def(&self) -> u32 {
        self.vcpu_max_limit.unwrap_or(self.vcpus)
    }

    /// Disks ordered by device sequence.
    pub fn sorted_disks(&self) -> Vec<&DiskSpec> {
        let mut disks: Vec<&DiskSpec> = self.disks.iter().collect();
        disks.sort_by_key(|d| d.seq);
        disks
    }
}
