// Compiled domain definition and resolved devices

use super::vm::{CacheMode, DiskFormat, DiskRole, RateLimits, TpmVersion, TrafficType};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskBus {
    Ide,
    Scsi,
    Sata,
    Virtio,
    Usb,
}

impl DiskBus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskBus::Ide => "ide",
            DiskBus::Scsi => "scsi",
            DiskBus::Sata => "sata",
            DiskBus::Virtio => "virtio",
            DiskBus::Usb => "usb",
        }
    }

    /// Case-insensitive parse of a controller name ("scsi", "VIRTIO").
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ide" => Some(DiskBus::Ide),
            "scsi" => Some(DiskBus::Scsi),
            "sata" => Some(DiskBus::Sata),
            "virtio" => Some(DiskBus::Virtio),
            "usb" => Some(DiskBus::Usb),
            _ => None,
        }
    }

    fn label_prefix(&self) -> &'static str {
        match self {
            DiskBus::Ide => "hd",
            DiskBus::Virtio => "vd",
            DiskBus::Scsi | DiskBus::Sata | DiskBus::Usb => "sd",
        }
    }

    /// Guest device name for a sequence number: 0 -> hda/vda/sda, 26 -> sdaa.
    pub fn device_label(&self, seq: u32) -> String {
        let mut n = seq as u64 + 1;
        let mut letters = Vec::new();
        while n > 0 {
            n -= 1;
            letters.push((b'a' + (n % 26) as u8) as char);
            n /= 26;
        }
        let suffix: String = letters.into_iter().rev().collect();
        format!("{}{}", self.label_prefix(), suffix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskDevice {
    Disk,
    Cdrom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkProtocol {
    Rbd,
    Gluster,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskAuth {
    pub username: String,
    pub secret_uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DiskSource {
    File {
        path: String,
    },
    Block {
        dev: String,
    },
    Network {
        protocol: NetworkProtocol,
        name: String,
        host: String,
        port: u16,
        auth: Option<DiskAuth>,
    },
    /// Empty cdrom tray.
    Empty,
}

impl DiskSource {
    /// Path-like identity used to match attached disks.
    pub fn path(&self) -> Option<&str> {
        match self {
            DiskSource::File { path } => Some(path),
            DiskSource::Block { dev } => Some(dev),
            DiskSource::Network { name, .. } => Some(name),
            DiskSource::Empty => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskEncryption {
    pub secret_uuid: String,
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedDisk {
    pub seq: u32,
    pub role: DiskRole,
    pub device: DiskDevice,
    pub source: DiskSource,
    pub bus: DiskBus,
    pub target_dev: String,
    pub format: DiskFormat,
    pub cache: Option<CacheMode>,
    pub serial: Option<String>,
    pub discard_unmap: bool,
    pub qemu_driver: bool,
    pub io_threads: bool,
    pub rate_limits: RateLimits,
    pub encryption: Option<DiskEncryption>,
    pub shareable: bool,
    pub readonly: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VifDriverKind {
    Bridge,
    OpenVSwitch,
    Overlay,
}

impl VifDriverKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bridge" | "native" => Some(VifDriverKind::Bridge),
            "openvswitch" | "ovs" => Some(VifDriverKind::OpenVSwitch),
            "overlay" | "tunnel" => Some(VifDriverKind::Overlay),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedNic {
    pub mac: String,
    pub traffic_type: TrafficType,
    pub driver: VifDriverKind,
    pub bridge: String,
    pub vlan: Option<u32>,
    /// "virtio" for PV-capable guests, else "e1000".
    pub model: String,
    pub queues: Option<u32>,
    pub packed: bool,
    pub rate_mbps: Option<u32>,
    pub device_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BootMode {
    Bios,
    UefiLegacy,
    UefiSecure,
}

impl BootMode {
    pub fn is_uefi(&self) -> bool {
        !matches!(self, BootMode::Bios)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootDevice {
    Cdrom,
    Hd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTopology {
    pub sockets: u32,
    pub cores: u32,
    pub threads: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuDef {
    /// host-passthrough, host-model or custom.
    pub mode: String,
    pub model: Option<String>,
    pub topology: CpuTopology,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTune {
    pub shares: u64,
    pub quota: Option<i64>,
    pub period: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    Pae,
    Apic,
    Acpi,
    Smm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HypervFeatures {
    pub relaxed: bool,
    pub vapic: bool,
    pub spinlock_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockOffset {
    Utc,
    Localtime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockTimer {
    Kvmclock,
    Hypervclock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockDef {
    pub offset: ClockOffset,
    pub timers: Vec<ClockTimer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TermAction {
    Destroy,
    Restart,
}

impl TermAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TermAction::Destroy => "destroy",
            TermAction::Restart => "restart",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermPolicy {
    pub on_poweroff: TermAction,
    pub on_reboot: TermAction,
    pub on_crash: TermAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Device {
    Disk(ResolvedDisk),
    Interface(ResolvedNic),
    ScsiController { index: u32, queues: u32, io_threads: bool },
    Serial,
    Console,
    Graphics { listen: String, passwd: Option<String> },
    Input { kind: String, bus: String },
    Channel { path: String, target: String },
    Watchdog { model: String, action: String },
    Video { model: String, vram_kib: u32 },
    Rng { path: String, rate_bytes: u32, rate_period_ms: u32 },
    Tpm { version: TpmVersion },
    MemBalloon { stats_period_secs: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainDefinition {
    pub name: String,
    pub uuid: String,
    pub description: String,
    pub guest_type: String,
    pub arch: String,
    pub machine_type: String,
    pub boot_mode: BootMode,
    pub loader: Option<String>,
    pub nvram: Option<String>,
    pub nvram_template: Option<String>,
    pub boot_order: Vec<BootDevice>,
    pub kernel_cmdline: Option<String>,
    pub memory_kib: u64,
    pub current_memory_kib: u64,
    pub vcpus: u32,
    pub current_vcpus: u32,
    pub io_threads: u32,
    pub cpu: CpuDef,
    pub cpu_tune: CpuTune,
    pub features: Vec<Feature>,
    pub hyperv: Option<HypervFeatures>,
    pub clock: ClockDef,
    pub term_policy: TermPolicy,
    pub devices: Vec<Device>,
    pub extra_config: Vec<String>,
}

impl DomainDefinition {
    pub fn disks(&self) -> impl Iterator<Item = &ResolvedDisk> {
        self.devices.iter().filter_map(|d| match d {
            Device::Disk(disk) => Some(disk),
            _ => None,
        })
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &ResolvedNic> {
        self.devices.iter().filter_map(|d| match d {
            Device::Interface(nic) => Some(nic),
            _ => None,
        })
    }
}
