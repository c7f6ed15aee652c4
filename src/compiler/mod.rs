// Spec compiler: VmSpec + HostCapabilities -> DomainDefinition

pub mod cpu;
pub mod guest;
mod xml;

pub use guest::{DiskBuses, disk_buses, guest_disk_bus};
pub use xml::{render_disk, render_interface, render_xml};

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::models::{
    BootDevice, CpuDef, Device, DiskBus, DomainDefinition, HostCapabilities, ResolvedDisk,
    ResolvedNic, VmSpec, VmType, detail,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RngSettings {
    pub path: String,
    pub rate_bytes: u32,
    pub rate_period_ms: u32,
}

/// Host-wide knobs the compiler reads. Built once from `AgentConfig`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerConfig {
    pub guest_cpu_mode: String,
    pub guest_cpu_model: Option<String>,
    pub no_kvm_clock: bool,
    pub rng: Option<RngSettings>,
    pub ballooning: bool,
    pub memballoon_stats_period_secs: u32,
    pub video_hardware: String,
    pub video_ram_kib: u32,
    pub sockets_dir: String,
    pub systemvm_iso_path: String,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            guest_cpu_mode: "host-passthrough".into(),
            guest_cpu_model: None,
            no_kvm_clock: false,
            rng: None,
            ballooning: false,
            memballoon_stats_period_secs: 0,
            video_hardware: "cirrus".into(),
            video_ram_kib: 0,
            sockets_dir: "/var/lib/libvirt/qemu".into(),
            systemvm_iso_path: "/usr/share/cloudstack-common/vms/systemvm.iso".into(),
        }
    }
}

impl From<&AgentConfig> for CompilerConfig {
    fn from(cfg: &AgentConfig) -> Self {
        let hv = &cfg.hypervisor;
        Self {
            guest_cpu_mode: hv.guest_cpu_mode.clone(),
            guest_cpu_model: hv.guest_cpu_model.clone(),
            no_kvm_clock: hv.no_kvm_clock,
            rng: hv.rng_enabled.then(|| RngSettings {
                path: hv.rng_path.clone(),
                rate_bytes: hv.rng_rate_bytes,
                rate_period_ms: hv.rng_rate_period_ms,
            }),
            ballooning: hv.ballooning,
            memballoon_stats_period_secs: hv.memballoon_stats_period_secs,
            video_hardware: hv.video_hardware.clone(),
            video_ram_kib: hv.video_ram_kib,
            sockets_dir: hv.sockets_dir.clone(),
            systemvm_iso_path: hv.systemvm_iso_path.clone(),
        }
    }
}

/// NIC model for the guest: virtio when its emulator family has PV drivers.
pub fn nic_model(spec: &VmSpec) -> &'static str {
    let bus = guest_disk_bus(
        spec.guest.platform_emulator.as_deref(),
        false,
        spec.guest.is_aarch64(),
    );
    if bus == DiskBus::Ide { "e1000" } else { "virtio" }
}

fn cpu_def(spec: &VmSpec, cfg: &CompilerConfig) -> CpuDef {
    let mode = spec
        .detail(detail::GUEST_CPU_MODE)
        .map(str::to_string)
        .unwrap_or_else(|| cfg.guest_cpu_mode.clone());
    let model = spec
        .detail(detail::GUEST_CPU_MODEL)
        .map(str::to_string)
        .or_else(|| cfg.guest_cpu_model.clone());
    CpuDef {
        mode,
        model,
        topology: cpu::topology_for(spec),
    }
}

fn base_devices(spec: &VmSpec, cfg: &CompilerConfig) -> Vec<Device> {
    let aarch64 = spec.guest.is_aarch64();
    let mut devices = vec![
        Device::Serial,
        Device::Console,
        Device::Graphics {
            listen: spec.vnc_addr.clone().unwrap_or_else(|| "0.0.0.0".into()),
            passwd: spec.vnc_password.clone(),
        },
        Device::Input {
            kind: "tablet".into(),
            bus: "usb".into(),
        },
    ];
    if aarch64 {
        for kind in ["keyboard", "mouse"] {
            devices.push(Device::Input {
                kind: kind.into(),
                bus: "usb".into(),
            });
        }
    }
    devices.push(Device::Channel {
        path: format!(
            "{}/{}.org.qemu.guest_agent.0",
            cfg.sockets_dir.trim_end_matches('/'),
            spec.name
        ),
        target: "org.qemu.guest_agent.0".into(),
    });
    devices.push(Device::Watchdog {
        model: "i6300esb".into(),
        action: "none".into(),
    });
    let video_model = spec
        .detail(detail::VIDEO_HARDWARE)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| cfg.video_hardware.clone());
    let vram_kib = u32::try_from(spec.detail_i64(detail::VIDEO_RAM, cfg.video_ram_kib as i64))
        .unwrap_or(cfg.video_ram_kib);
    devices.push(Device::Video {
        model: video_model,
        vram_kib,
    });
    if let Some(rng) = &cfg.rng {
        devices.push(Device::Rng {
            path: rng.path.clone(),
            rate_bytes: rng.rate_bytes,
            rate_period_ms: rng.rate_period_ms,
        });
    }
    if let Some(version) = spec.boot.tpm_version {
        devices.push(Device::Tpm { version });
    }
    if disk_buses(spec).root == DiskBus::Scsi {
        let io_threads = spec.detail(detail::IOTHREADS).is_some();
        let queues = spec.vcpus;
        for index in 0..cpu::scsi_controller_count(spec.vcpus, spec) {
            devices.push(Device::ScsiController {
                index,
                queues,
                io_threads,
            });
        }
    }
    if cfg.ballooning {
        devices.push(Device::MemBalloon {
            stats_period_secs: cfg.memballoon_stats_period_secs,
        });
    }
    devices
}

/// Compile everything except storage and network devices, which need external
/// resolution. Pure: identical inputs give identical definitions.
pub fn compile(
    spec: &VmSpec,
    caps: &HostCapabilities,
    cfg: &CompilerConfig,
) -> Result<DomainDefinition, AgentError> {
    if spec.vcpus == 0 {
        return Err(AgentError::configuration(format!(
            "{} requests zero vCPUs",
            spec.name
        )));
    }
    let fw = guest::firmware(spec, &caps.uefi)?;

    let memory_kib = spec.max_ram_bytes / 1024;
    let current_memory_kib = if cfg.ballooning && spec.vm_type == VmType::User {
        spec.min_ram_bytes / 1024
    } else {
        memory_kib
    };

    let extra_config = if spec.vm_type == VmType::User {
        spec.extra_config
            .iter()
            .filter(|(k, _)| !k.starts_with("dpdk"))
            .map(|(_, v)| v.clone())
            .collect()
    } else {
        Vec::new()
    };

    Ok(DomainDefinition {
        name: spec.name.clone(),
        uuid: spec.uuid.clone(),
        description: spec.guest.os.clone(),
        guest_type: "kvm".into(),
        arch: spec.guest.effective_arch().to_string(),
        machine_type: fw.machine_type,
        boot_mode: fw.mode,
        loader: fw.loader,
        nvram: fw.nvram,
        nvram_template: fw.nvram_template,
        boot_order: vec![BootDevice::Cdrom, BootDevice::Hd],
        kernel_cmdline: match spec.vm_type {
            VmType::System => spec.boot.boot_args.clone(),
            VmType::User => None,
        },
        memory_kib,
        current_memory_kib,
        vcpus: spec.vcpus_in_def(),
        current_vcpus: spec.vcpus,
        io_threads: u32::from(spec.detail(detail::IOTHREADS).is_some()),
        cpu: cpu_def(spec, cfg),
        cpu_tune: cpu::cpu_tune(spec, caps),
        features: guest::features(fw.mode),
        hyperv: guest::hyperv(spec),
        clock: guest::clock(spec, caps, cfg.no_kvm_clock),
        term_policy: guest::term_policy(),
        devices: base_devices(spec, cfg),
        extra_config,
    })
}

/// Put resolved disks (by sequence) then NICs ahead of the compiled devices.
pub fn assemble(
    mut def: DomainDefinition,
    mut disks: Vec<ResolvedDisk>,
    nics: Vec<ResolvedNic>,
) -> DomainDefinition {
    disks.sort_by_key(|d| d.seq);
    let mut devices: Vec<Device> = disks.into_iter().map(Device::Disk).collect();
    devices.extend(nics.into_iter().map(Device::Interface));
    devices.append(&mut def.devices);
    def.devices = devices;
    def
}
