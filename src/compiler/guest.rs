// Guest-level policies: disk bus by OS family, firmware, features and clock

use crate::error::AgentError;
use crate::models::{
    BootMode, ClockDef, ClockOffset, ClockTimer, DiskBus, Feature, HostCapabilities,
    HypervFeatures, TermAction, TermPolicy, UefiTables, VmSpec, VmType, detail,
};

/// Lowest toolstack version that understands the kvmclock timer.
pub const MIN_TOOLSTACK_FOR_KVMCLOCK: u64 = 9010;

const SCSI_FAMILIES: &[&str] = &[
    "Fedora",
    "CentOS",
    "Red Hat Enterprise Linux",
    "Debian GNU/Linux",
    "FreeBSD",
    "Oracle",
    "Other PV",
    "Windows",
    "Rocky",
    "Alma",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskBuses {
    pub root: DiskBus,
    pub data: DiskBus,
    pub iso: DiskBus,
}

/// Default bus for an emulator family string. aarch64 guests always get SCSI.
pub fn guest_disk_bus(platform_emulator: Option<&str>, uefi: bool, aarch64: bool) -> DiskBus {
    if aarch64 {
        return DiskBus::Scsi;
    }
    let Some(emulator) = platform_emulator else {
        return DiskBus::Ide;
    };
    if emulator.starts_with("Other PV Virtio-SCSI")
        || emulator.contains("Ubuntu")
        || SCSI_FAMILIES.iter().any(|f| emulator.starts_with(f))
    {
        DiskBus::Scsi
    } else if uefi && emulator.starts_with("Other") {
        DiskBus::Sata
    } else {
        DiskBus::Ide
    }
}

/// Whether the guest has paravirtual drivers, judged by its OS name.
pub fn is_pv_capable(spec: &VmSpec) -> bool {
    guest_disk_bus(Some(&spec.guest.os), false, spec.guest.is_aarch64()) != DiskBus::Ide
}

fn controller_override(spec: &VmSpec, key: &str) -> Option<DiskBus> {
    spec.detail(key)
        .filter(|v| !v.trim().is_empty())
        .and_then(DiskBus::parse)
}

pub fn disk_buses(spec: &VmSpec) -> DiskBuses {
    let aarch64 = spec.guest.is_aarch64();
    let uefi = spec.boot.uefi;
    let root = controller_override(spec, detail::ROOT_DISK_CONTROLLER).unwrap_or_else(|| {
        guest_disk_bus(spec.guest.platform_emulator.as_deref(), uefi, aarch64)
    });
    let data = controller_override(spec, detail::DATA_DISK_CONTROLLER).unwrap_or(
        if root == DiskBus::Scsi {
            DiskBus::Scsi
        } else {
            DiskBus::Virtio
        },
    );
    let iso = if aarch64 {
        DiskBus::Scsi
    } else if uefi {
        DiskBus::Sata
    } else {
        DiskBus::Ide
    };
    DiskBuses { root, data, iso }
}

/// Boot mode plus loader, nvram and nvram template paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firmware {
    pub mode: BootMode,
    pub machine_type: String,
    pub loader: Option<String>,
    pub nvram: Option<String>,
    pub nvram_template: Option<String>,
}

pub fn firmware(spec: &VmSpec, uefi: &UefiTables) -> Result<Firmware, AgentError> {
    let default_machine = if spec.guest.is_aarch64() { "virt" } else { "pc" };
    if !spec.boot.uefi {
        return Ok(Firmware {
            mode: BootMode::Bios,
            machine_type: default_machine.to_string(),
            loader: None,
            nvram: None,
            nvram_template: None,
        });
    }
    let secure = spec.boot.secure_boot;
    let (mode, loader, template) = if secure {
        (
            BootMode::UefiSecure,
            uefi.loader_secure.clone(),
            uefi.nvram_template_secure
                .clone()
                .or_else(|| uefi.nvram_template_legacy.clone()),
        )
    } else {
        (
            BootMode::UefiLegacy,
            uefi.loader_legacy.clone(),
            uefi.nvram_template_legacy.clone(),
        )
    };
    let Some(loader) = loader else {
        return Err(AgentError::configuration(format!(
            "UEFI {} boot requested for {} but no loader is configured",
            if secure { "secure" } else { "legacy" },
            spec.name
        )));
    };
    Ok(Firmware {
        mode,
        machine_type: "q35".to_string(),
        loader: Some(loader),
        nvram: uefi.nvram_path.clone(),
        nvram_template: template,
    })
}

pub fn features(mode: BootMode) -> Vec<Feature> {
    let mut f = vec![Feature::Pae, Feature::Apic, Feature::Acpi];
    if mode == BootMode::UefiSecure {
        f.push(Feature::Smm);
    }
    f
}

/// Hyper-V enlightenments, only for "Windows PV" guests.
pub fn hyperv(spec: &VmSpec) -> Option<HypervFeatures> {
    spec.guest.os.contains("Windows PV").then_some(HypervFeatures {
        relaxed: true,
        vapic: true,
        spinlock_retries: 8096,
    })
}

pub fn clock(spec: &VmSpec, caps: &HostCapabilities, no_kvm_clock: bool) -> ClockDef {
    if spec.guest.is_windows() {
        return ClockDef {
            offset: ClockOffset::Localtime,
            timers: vec![ClockTimer::Hypervclock],
        };
    }
    let timers = if (spec.vm_type != VmType::User || is_pv_capable(spec))
        && caps.toolstack_version >= MIN_TOOLSTACK_FOR_KVMCLOCK
        && !no_kvm_clock
    {
        vec![ClockTimer::Kvmclock]
    } else {
        Vec::new()
    };
    ClockDef {
        offset: ClockOffset::Utc,
        timers,
    }
}

pub fn term_policy() -> TermPolicy {
    TermPolicy {
        on_poweroff: TermAction::Destroy,
        on_reboot: TermAction::Restart,
        on_crash: TermAction::Destroy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_by_os_family() {
        assert_eq!(guest_disk_bus(None, false, false), DiskBus::Ide);
        assert_eq!(guest_disk_bus(Some("Ubuntu 22.04"), false, false), DiskBus::Scsi);
        assert_eq!(guest_disk_bus(Some("Windows 10"), false, false), DiskBus::Scsi);
        assert_eq!(
            guest_disk_bus(Some("Other PV Virtio-SCSI (64-bit)"), false, false),
            DiskBus::Scsi
        );
        assert_eq!(guest_disk_bus(Some("Other (64-bit)"), true, false), DiskBus::Sata);
        assert_eq!(guest_disk_bus(Some("Other (64-bit)"), false, false), DiskBus::Ide);
        assert_eq!(guest_disk_bus(Some("DOS"), false, false), DiskBus::Ide);
    }

    #[test]
    fn aarch64_always_scsi() {
        assert_eq!(guest_disk_bus(None, false, true), DiskBus::Scsi);
        assert_eq!(guest_disk_bus(Some("DOS"), true, true), DiskBus::Scsi);
    }

    fn spec_with_emulator(emulator: Option<&str>) -> VmSpec {
        let mut spec: VmSpec = serde_json::from_str(
            r#"{"uuid":"u","name":"v","vmType":"User","guest":{"os":"Other"},"vcpus":1,
                "minRamBytes":1,"maxRamBytes":1,"speedMhz":1000}"#,
        )
        .unwrap();
        spec.guest.platform_emulator = emulator.map(str::to_string);
        spec
    }

    #[test]
    fn data_bus_is_scsi_only_with_scsi_root() {
        let ide = disk_buses(&spec_with_emulator(None));
        assert_eq!(ide.root, DiskBus::Ide);
        assert_eq!(ide.data, DiskBus::Virtio);
        assert_eq!(ide.iso, DiskBus::Ide);

        let scsi = disk_buses(&spec_with_emulator(Some("Ubuntu")));
        assert_eq!(scsi.root, DiskBus::Scsi);
        assert_eq!(scsi.data, DiskBus::Scsi);
    }

    #[test]
    fn controller_details_override_buses() {
        let mut spec = spec_with_emulator(None);
        spec.details
            .insert(detail::DATA_DISK_CONTROLLER.into(), "SATA".into());
        let buses = disk_buses(&spec);
        assert_eq!(buses.root, DiskBus::Ide);
        assert_eq!(buses.data, DiskBus::Sata);

        spec.details
            .insert(detail::ROOT_DISK_CONTROLLER.into(), "scsi".into());
        spec.details.remove(detail::DATA_DISK_CONTROLLER);
        let buses = disk_buses(&spec);
        assert_eq!(buses.root, DiskBus::Scsi);
        assert_eq!(buses.data, DiskBus::Scsi);
    }

    #[test]
    fn features_add_smm_only_for_secure_boot() {
        assert_eq!(features(BootMode::UefiLegacy).len(), 3);
        assert!(features(BootMode::UefiSecure).contains(&Feature::Smm));
    }

    #[test]
    fn missing_loader_is_configuration_error() {
        let tables = UefiTables {
            loader_legacy: Some("/usr/share/OVMF/OVMF_CODE.fd".into()),
            ..Default::default()
        };
        let mut spec: VmSpec = serde_json::from_str(
            r#"{"uuid":"u","name":"v","vmType":"User","guest":{"os":"Ubuntu"},"vcpus":1,
                "minRamBytes":1,"maxRamBytes":1,"speedMhz":1000,"boot":{"uefi":true,"secureBoot":true}}"#,
        )
        .unwrap();
        let err = firmware(&spec, &tables).unwrap_err();
        assert!(matches!(err, AgentError::Configuration(_)));

        spec.boot.secure_boot = false;
        let fw = firmware(&spec, &tables).unwrap();
        assert_eq!(fw.mode, BootMode::UefiLegacy);
        assert_eq!(fw.machine_type, "q35");
    }
}
