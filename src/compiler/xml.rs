// libvirt domain XML rendering

use crate::hypervisor::domxml::escape;
use crate::models::{
    BootDevice, BootMode, ClockOffset, ClockTimer, Device, DiskSource, DomainDefinition, Feature,
    ResolvedDisk, ResolvedNic, VifDriverKind,
};

fn attr(name: &str, value: &str) -> String {
    format!(" {}='{}'", name, escape(value))
}

fn push_line(out: &mut String, indent: usize, line: &str) {
    for _ in 0..indent {
        out.push_str("  ");
    }
    out.push_str(line);
    out.push('\n');
}

fn iotune(disk: &ResolvedDisk) -> Vec<String> {
    let r = &disk.rate_limits;
    [
        ("read_bytes_sec", r.bytes_read_rate),
        ("read_bytes_sec_max", r.bytes_read_rate_max),
        ("read_bytes_sec_max_length", r.bytes_read_rate_max_length),
        ("write_bytes_sec", r.bytes_write_rate),
        ("write_bytes_sec_max", r.bytes_write_rate_max),
        ("write_bytes_sec_max_length", r.bytes_write_rate_max_length),
        ("read_iops_sec", r.iops_read_rate),
        ("read_iops_sec_max", r.iops_read_rate_max),
        ("read_iops_sec_max_length", r.iops_read_rate_max_length),
        ("write_iops_sec", r.iops_write_rate),
        ("write_iops_sec_max", r.iops_write_rate_max),
        ("write_iops_sec_max_length", r.iops_write_rate_max_length),
    ]
    .into_iter()
    .filter(|(_, v)| *v > 0)
    .map(|(k, v)| format!("<{k}>{v}</{k}>"))
    .collect()
}

fn write_disk(out: &mut String, indent: usize, disk: &ResolvedDisk) {
    let kind = match &disk.source {
        DiskSource::File { .. } | DiskSource::Empty => "file",
        DiskSource::Block { .. } => "block",
        DiskSource::Network { .. } => "network",
    };
    let device = match disk.device {
        crate::models::DiskDevice::Disk => "disk",
        crate::models::DiskDevice::Cdrom => "cdrom",
    };
    push_line(out, indent, &format!("<disk type='{}' device='{}'>", kind, device));
    let i = indent + 1;

    let mut driver = String::from("<driver");
    if disk.qemu_driver {
        driver.push_str(" name='qemu'");
    }
    driver.push_str(&attr("type", disk.format.as_str()));
    if let Some(cache) = disk.cache {
        driver.push_str(&attr("cache", cache.as_str()));
    }
    if disk.discard_unmap {
        driver.push_str(" discard='unmap'");
    }
    if disk.io_threads {
        driver.push_str(" iothread='1'");
    }
    driver.push_str("/>");
    push_line(out, i, &driver);

    match &disk.source {
        DiskSource::File { path } => {
            push_line(out, i, &format!("<source{}/>", attr("file", path)))
        }
        DiskSource::Block { dev } => push_line(out, i, &format!("<source{}/>", attr("dev", dev))),
        DiskSource::Network {
            protocol,
            name,
            host,
            port,
            auth,
        } => {
            let proto = match protocol {
                crate::models::NetworkProtocol::Rbd => "rbd",
                crate::models::NetworkProtocol::Gluster => "gluster",
            };
            push_line(
                out,
                i,
                &format!("<source protocol='{}'{}>", proto, attr("name", name)),
            );
            push_line(
                out,
                i + 1,
                &format!("<host{} port='{}'/>", attr("name", host), port),
            );
            push_line(out, i, "</source>");
            if let Some(auth) = auth {
                push_line(out, i, &format!("<auth{}>", attr("username", &auth.username)));
                push_line(
                    out,
                    i + 1,
                    &format!("<secret type='ceph'{}/>", attr("uuid", &auth.secret_uuid)),
                );
                push_line(out, i, "</auth>");
            }
        }
        DiskSource::Empty => {}
    }
    push_line(
        out,
        i,
        &format!(
            "<target{}{}/>",
            attr("dev", &disk.target_dev),
            attr("bus", disk.bus.as_str())
        ),
    );
    if let Some(serial) = &disk.serial {
        push_line(out, i, &format!("<serial>{}</serial>", escape(serial)));
    }
    let tune = iotune(disk);
    if !tune.is_empty() {
        push_line(out, i, "<iotune>");
        for t in tune {
            push_line(out, i + 1, &t);
        }
        push_line(out, i, "</iotune>");
    }
    if let Some(enc) = &disk.encryption {
        push_line(out, i, &format!("<encryption{}>", attr("format", &enc.format)));
        push_line(
            out,
            i + 1,
            &format!("<secret type='passphrase'{}/>", attr("uuid", &enc.secret_uuid)),
        );
        push_line(out, i, "</encryption>");
    }
    if disk.shareable {
        push_line(out, i, "<shareable/>");
    }
    if disk.readonly {
        push_line(out, i, "<readonly/>");
    }
    push_line(out, indent, "</disk>");
}

fn write_interface(out: &mut String, indent: usize, nic: &ResolvedNic) {
    push_line(out, indent, "<interface type='bridge'>");
    let i = indent + 1;
    push_line(out, i, &format!("<mac{}/>", attr("address", &nic.mac)));
    push_line(out, i, &format!("<source{}/>", attr("bridge", &nic.bridge)));
    if matches!(nic.driver, VifDriverKind::OpenVSwitch | VifDriverKind::Overlay) {
        push_line(out, i, "<virtualport type='openvswitch'/>");
        if let Some(vlan) = nic.vlan {
            push_line(out, i, "<vlan>");
            push_line(out, i + 1, &format!("<tag id='{}'/>", vlan));
            push_line(out, i, "</vlan>");
        }
    }
    push_line(out, i, &format!("<model{}/>", attr("type", &nic.model)));
    if nic.queues.is_some() || nic.packed {
        let mut driver = String::from("<driver");
        if let Some(q) = nic.queues {
            driver.push_str(&format!(" queues='{}'", q));
        }
        if nic.packed {
            driver.push_str(" packed='on'");
        }
        driver.push_str("/>");
        push_line(out, i, &driver);
    }
    if let Some(rate) = nic.rate_mbps.filter(|r| *r > 0) {
        let kbps = rate as u64 * 128;
        push_line(out, i, "<bandwidth>");
        push_line(out, i + 1, &format!("<inbound average='{}' peak='{}'/>", kbps, kbps));
        push_line(out, i + 1, &format!("<outbound average='{}' peak='{}'/>", kbps, kbps));
        push_line(out, i, "</bandwidth>");
    }
    push_line(out, indent, "</interface>");
}

/// Standalone `<disk>` element, as used by attach/detach.
pub fn render_disk(disk: &ResolvedDisk) -> String {
    let mut out = String::new();
    write_disk(&mut out, 0, disk);
    out
}

/// Standalone `<interface>` element, as used by plug/unplug.
pub fn render_interface(nic: &ResolvedNic) -> String {
    let mut out = String::new();
    write_interface(&mut out, 0, nic);
    out
}

fn write_device(out: &mut String, indent: usize, device: &Device) {
    let i = indent + 1;
    match device {
        Device::Disk(d) => write_disk(out, indent, d),
        Device::Interface(n) => write_interface(out, indent, n),
        Device::ScsiController {
            index,
            queues,
            io_threads,
        } => {
            push_line(
                out,
                indent,
                &format!("<controller type='scsi' index='{}' model='virtio-scsi'>", index),
            );
            let iothread = if *io_threads { " iothread='1'" } else { "" };
            push_line(out, i, &format!("<driver queues='{}'{}/>", queues, iothread));
            push_line(out, indent, "</controller>");
        }
        Device::Serial => {
            push_line(out, indent, "<serial type='pty'>");
            push_line(out, i, "<target port='0'/>");
            push_line(out, indent, "</serial>");
        }
        Device::Console => {
            push_line(out, indent, "<console type='pty'>");
            push_line(out, i, "<target port='0'/>");
            push_line(out, indent, "</console>");
        }
        Device::Graphics { listen, passwd } => {
            let mut g = format!("<graphics type='vnc' autoport='yes'{}", attr("listen", listen));
            if let Some(p) = passwd {
                g.push_str(&attr("passwd", p));
            }
            g.push_str("/>");
            push_line(out, indent, &g);
        }
        Device::Input { kind, bus } => push_line(
            out,
            indent,
            &format!("<input{}{}/>", attr("type", kind), attr("bus", bus)),
        ),
        Device::Channel { path, target } => {
            push_line(out, indent, "<channel type='unix'>");
            push_line(out, i, &format!("<source mode='bind'{}/>", attr("path", path)));
            push_line(out, i, &format!("<target type='virtio'{}/>", attr("name", target)));
            push_line(out, indent, "</channel>");
        }
        Device::Watchdog { model, action } => push_line(
            out,
            indent,
            &format!("<watchdog{}{}/>", attr("model", model), attr("action", action)),
        ),
        Device::Video { model, vram_kib } => {
            push_line(out, indent, "<video>");
            let vram = if *vram_kib > 0 {
                format!(" vram='{}'", vram_kib)
            } else {
                String::new()
            };
            push_line(out, i, &format!("<model{}{}/>", attr("type", model), vram));
            push_line(out, indent, "</video>");
        }
        Device::Rng {
            path,
            rate_bytes,
            rate_period_ms,
        } => {
            push_line(out, indent, "<rng model='virtio'>");
            push_line(
                out,
                i,
                &format!("<rate period='{}' bytes='{}'/>", rate_period_ms, rate_bytes),
            );
            push_line(out, i, &format!("<backend model='random'>{}</backend>", escape(path)));
            push_line(out, indent, "</rng>");
        }
        Device::Tpm { version } => {
            push_line(out, indent, "<tpm model='tpm-tis'>");
            push_line(
                out,
                i,
                &format!("<backend type='emulator' version='{}'/>", version.as_str()),
            );
            push_line(out, indent, "</tpm>");
        }
        Device::MemBalloon { stats_period_secs } => {
            push_line(out, indent, "<memballoon model='virtio'>");
            if *stats_period_secs > 0 {
                push_line(out, i, &format!("<stats period='{}'/>", stats_period_secs));
            }
            push_line(out, indent, "</memballoon>");
        }
    }
}

fn write_os(out: &mut String, def: &DomainDefinition) {
    push_line(out, 1, "<os>");
    push_line(
        out,
        2,
        &format!(
            "<type{}{}>hvm</type>",
            attr("arch", &def.arch),
            attr("machine", &def.machine_type)
        ),
    );
    if let Some(loader) = &def.loader {
        let secure = if def.boot_mode == BootMode::UefiSecure {
            "yes"
        } else {
            "no"
        };
        push_line(
            out,
            2,
            &format!(
                "<loader readonly='yes' secure='{}' type='pflash'>{}</loader>",
                secure,
                escape(loader)
            ),
        );
    }
    if let Some(nvram) = &def.nvram {
        let template = def
            .nvram_template
            .as_deref()
            .map(|t| attr("template", t))
            .unwrap_or_default();
        push_line(
            out,
            2,
            &format!(
                "<nvram{}>{}/{}.fd</nvram>",
                template,
                escape(nvram.trim_end_matches('/')),
                escape(&def.uuid)
            ),
        );
    }
    if let Some(cmdline) = &def.kernel_cmdline {
        push_line(out, 2, &format!("<cmdline>{}</cmdline>", escape(cmdline)));
    }
    for dev in &def.boot_order {
        let d = match dev {
            BootDevice::Cdrom => "cdrom",
            BootDevice::Hd => "hd",
        };
        push_line(out, 2, &format!("<boot dev='{}'/>", d));
    }
    push_line(out, 1, "</os>");
}

fn write_features(out: &mut String, def: &DomainDefinition) {
    push_line(out, 1, "<features>");
    for f in &def.features {
        let line = match f {
            Feature::Pae => "<pae/>",
            Feature::Apic => "<apic/>",
            Feature::Acpi => "<acpi/>",
            Feature::Smm => "<smm state='on'/>",
        };
        push_line(out, 2, line);
    }
    if let Some(hv) = &def.hyperv {
        push_line(out, 2, "<hyperv>");
        if hv.relaxed {
            push_line(out, 3, "<relaxed state='on'/>");
        }
        if hv.vapic {
            push_line(out, 3, "<vapic state='on'/>");
        }
        if hv.spinlock_retries > 0 {
            push_line(
                out,
                3,
                &format!("<spinlocks state='on' retries='{}'/>", hv.spinlock_retries),
            );
        }
        push_line(out, 2, "</hyperv>");
    }
    push_line(out, 1, "</features>");
}

/// Full `<domain>` document. Deterministic for a given definition.
pub fn render_xml(def: &DomainDefinition) -> String {
    let mut out = String::new();
    push_line(&mut out, 0, &format!("<domain{}>", attr("type", &def.guest_type)));
    push_line(&mut out, 1, &format!("<name>{}</name>", escape(&def.name)));
    push_line(&mut out, 1, &format!("<uuid>{}</uuid>", escape(&def.uuid)));
    push_line(
        &mut out,
        1,
        &format!("<description>{}</description>", escape(&def.description)),
    );
    push_line(
        &mut out,
        1,
        &format!("<memory unit='KiB'>{}</memory>", def.memory_kib),
    );
    push_line(
        &mut out,
        1,
        &format!(
            "<currentMemory unit='KiB'>{}</currentMemory>",
            def.current_memory_kib
        ),
    );
    push_line(
        &mut out,
        1,
        &format!("<vcpu current='{}'>{}</vcpu>", def.current_vcpus, def.vcpus),
    );
    if def.io_threads > 0 {
        push_line(&mut out, 1, &format!("<iothreads>{}</iothreads>", def.io_threads));
    }

    push_line(&mut out, 1, "<cputune>");
    push_line(&mut out, 2, &format!("<shares>{}</shares>", def.cpu_tune.shares));
    if let (Some(quota), Some(period)) = (def.cpu_tune.quota, def.cpu_tune.period) {
        push_line(&mut out, 2, &format!("<quota>{}</quota>", quota));
        push_line(&mut out, 2, &format!("<period>{}</period>", period));
    }
    push_line(&mut out, 1, "</cputune>");

    write_os(&mut out, def);
    write_features(&mut out, def);

    push_line(&mut out, 1, &format!("<cpu{}>", attr("mode", &def.cpu.mode)));
    if let Some(model) = &def.cpu.model {
        push_line(
            &mut out,
            2,
            &format!("<model fallback='allow'>{}</model>", escape(model)),
        );
    }
    let t = def.cpu.topology;
    push_line(
        &mut out,
        2,
        &format!(
            "<topology sockets='{}' cores='{}' threads='{}'/>",
            t.sockets, t.cores, t.threads
        ),
    );
    push_line(&mut out, 1, "</cpu>");

    let offset = match def.clock.offset {
        ClockOffset::Utc => "utc",
        ClockOffset::Localtime => "localtime",
    };
    if def.clock.timers.is_empty() {
        push_line(&mut out, 1, &format!("<clock offset='{}'/>", offset));
    } else {
        push_line(&mut out, 1, &format!("<clock offset='{}'>", offset));
        for timer in &def.clock.timers {
            let name = match timer {
                ClockTimer::Kvmclock => "kvmclock",
                ClockTimer::Hypervclock => "hypervclock",
            };
            push_line(&mut out, 2, &format!("<timer name='{}' present='yes'/>", name));
        }
        push_line(&mut out, 1, "</clock>");
    }

    let tp = def.term_policy;
    push_line(
        &mut out,
        1,
        &format!("<on_poweroff>{}</on_poweroff>", tp.on_poweroff.as_str()),
    );
    push_line(
        &mut out,
        1,
        &format!("<on_reboot>{}</on_reboot>", tp.on_reboot.as_str()),
    );
    push_line(
        &mut out,
        1,
        &format!("<on_crash>{}</on_crash>", tp.on_crash.as_str()),
    );

    push_line(&mut out, 1, "<devices>");
    for device in &def.devices {
        write_device(&mut out, 2, device);
    }
    push_line(&mut out, 1, "</devices>");

    for fragment in &def.extra_config {
        push_line(&mut out, 1, fragment.trim());
    }
    push_line(&mut out, 0, "</domain>");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::domxml;
    use crate::models::{
        DiskAuth, DiskBus, DiskDevice, DiskFormat, DiskRole, NetworkProtocol, RateLimits,
        TrafficType,
    };

    fn rbd_disk() -> ResolvedDisk {
        ResolvedDisk {
            seq: 1,
            role: DiskRole::Data,
            device: DiskDevice::Disk,
            source: DiskSource::Network {
                protocol: NetworkProtocol::Rbd,
                name: "rbdpool/vol-1".into(),
                host: "10.0.0.5".into(),
                port: 6789,
                auth: Some(DiskAuth {
                    username: "admin".into(),
                    secret_uuid: "pool-uuid".into(),
                }),
            },
            bus: DiskBus::Virtio,
            target_dev: "vdb".into(),
            format: DiskFormat::Raw,
            cache: None,
            serial: Some("abcdef".into()),
            discard_unmap: false,
            qemu_driver: true,
            io_threads: false,
            rate_limits: RateLimits {
                iops_read_rate: 500,
                ..Default::default()
            },
            encryption: None,
            shareable: false,
            readonly: false,
        }
    }

    #[test]
    fn network_disk_renders_host_and_auth() {
        let xml = render_disk(&rbd_disk());
        assert!(xml.starts_with("<disk type='network' device='disk'>"));
        assert!(xml.contains("<source protocol='rbd' name='rbdpool/vol-1'>"));
        assert!(xml.contains("<host name='10.0.0.5' port='6789'/>"));
        assert!(xml.contains("<secret type='ceph' uuid='pool-uuid'/>"));
        assert!(xml.contains("<read_iops_sec>500</read_iops_sec>"));
        assert!(!xml.contains("write_iops_sec"));
        let parsed = domxml::parse_disks(&xml);
        assert_eq!(parsed[0].target_dev, "vdb");
    }

    #[test]
    fn ovs_interface_carries_vlan_tag() {
        let nic = ResolvedNic {
            mac: "02:00:00:00:00:01".into(),
            traffic_type: TrafficType::Guest,
            driver: VifDriverKind::OpenVSwitch,
            bridge: "cloudbr1".into(),
            vlan: Some(100),
            model: "virtio".into(),
            queues: Some(4),
            packed: false,
            rate_mbps: Some(10),
            device_id: 0,
        };
        let xml = render_interface(&nic);
        assert!(xml.contains("<virtualport type='openvswitch'/>"));
        assert!(xml.contains("<tag id='100'/>"));
        assert!(xml.contains("<driver queues='4'/>"));
        assert!(xml.contains("average='1280'"));
    }

    #[test]
    fn linux_bridge_interface_has_no_virtualport() {
        let nic = ResolvedNic {
            mac: "02:00:00:00:00:02".into(),
            traffic_type: TrafficType::Public,
            driver: VifDriverKind::Bridge,
            bridge: "breth0-200".into(),
            vlan: Some(200),
            model: "e1000".into(),
            queues: None,
            packed: false,
            rate_mbps: None,
            device_id: 1,
        };
        let xml = render_interface(&nic);
        assert!(!xml.contains("virtualport"));
        assert!(!xml.contains("<driver"));
        assert_eq!(domxml::parse_interfaces(&xml)[0].bridge.as_deref(), Some("breth0-200"));
    }
}
