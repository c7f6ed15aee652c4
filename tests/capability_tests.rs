// Capability probe and startup registration payload

mod common;

use common::*;
use hostagent::capability::{CapabilityProbe, HostIdentity, ProbePaths};
use hostagent::hypervisor::{HypervisorVersion, MemoryHypervisor};
use hostagent::models::{CgroupVersion, HealthCheckResult};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn probe_paths(root: &Path) -> ProbePaths {
    let cgroup = root.join("cgroup");
    std::fs::create_dir_all(&cgroup).unwrap();
    std::fs::write(cgroup.join("cgroup.controllers"), "cpu io memory\n").unwrap();
    let cpufreq = root.join("cpuinfo_max_freq");
    std::fs::write(&cpufreq, "2400000\n").unwrap();
    let os_release = root.join("os-release");
    std::fs::write(&os_release, "NAME=\"Rocky Linux\"\nPRETTY_NAME=\"Rocky Linux 9.3\"\n").unwrap();
    ProbePaths {
        cgroup_root: cgroup,
        cpufreq_max: cpufreq,
        cpuinfo: root.join("cpuinfo"),
        os_release,
        iqn_file: root.join("missing-iqn"),
    }
}

fn probe(host: &TestHost, hv: MemoryHypervisor) -> CapabilityProbe {
    let identity = HostIdentity::from(&host.config());
    CapabilityProbe::new(Arc::new(hv), host.runner.clone(), identity)
        .with_paths(probe_paths(host.path()))
        .with_versions_script(host.scripts().versions, Duration::from_secs(5))
}

#[tokio::test]
async fn probe_reads_cgroup_speed_and_versions() {
    let host = TestHost::new();
    let hv = MemoryHypervisor::with_version(HypervisorVersion {
        library: 8_000_000,
        hypervisor: 6_002_000,
    });
    let caps = probe(&host, hv).probe().await.unwrap();

    assert_eq!(caps.cgroup_version, CgroupVersion::V2);
    assert_eq!(caps.cpu_speed_mhz, 2400);
    assert!(caps.cpu_cores > 0);
    assert_eq!(
        caps.host_max_capacity,
        u64::from(caps.cpu_cores) * 2400
    );
    assert_eq!(caps.hypervisor_version, 6_002_000);
    assert_eq!(caps.toolstack_version, 8_000_000);
    assert_eq!(caps.arch, std::env::consts::ARCH);
}

#[tokio::test]
async fn cgroup_v1_has_no_host_max_capacity() {
    let host = TestHost::new();
    let mut paths = probe_paths(host.path());
    paths.cgroup_root = host.path().join("no-cgroup2");
    let identity = HostIdentity::from(&host.config());
    let caps = CapabilityProbe::new(Arc::new(MemoryHypervisor::new()), host.runner.clone(), identity)
        .with_paths(paths)
        .probe()
        .await
        .unwrap();
    assert_eq!(caps.cgroup_version, CgroupVersion::V1);
    assert_eq!(caps.host_max_capacity, 0);
}

#[tokio::test]
async fn probe_fails_when_hypervisor_is_unreachable() {
    let host = TestHost::new();
    let hv = MemoryHypervisor::new();
    hv.set_unreachable(true);
    assert!(probe(&host, hv).probe().await.is_err());
}

#[tokio::test]
async fn versions_script_output_is_reported() {
    let host = TestHost::new();
    host.runner
        .respond("versions.sh", 0, "Host.OS=Ubuntu\nHost.OS.Version=22.04\nguest.cpu.mode=host-model\n");
    let p = probe(&host, MemoryHypervisor::new());

    let versions = p.toolstack_versions().await;
    assert_eq!(versions.get("Host.OS").map(String::as_str), Some("Ubuntu"));
    assert_eq!(versions.get("Host.OS.Version").map(String::as_str), Some("22.04"));

    let caps = p.probe().await.unwrap();
    let (info, _) = p.startup_info(&caps, HealthCheckResult::Ignore).await.unwrap();
    assert_eq!(info.guest_cpu_mode, "host-model");
}

#[tokio::test]
async fn os_release_fills_in_missing_host_os() {
    let host = TestHost::new();
    host.runner.respond("versions.sh", 0, "libvirt=9.0.0\n");
    let versions = probe(&host, MemoryHypervisor::new()).toolstack_versions().await;
    assert_eq!(
        versions.get("Host.OS").map(String::as_str),
        Some("Rocky Linux 9.3")
    );
    assert_eq!(versions.get("libvirt").map(String::as_str), Some("9.0.0"));
}

#[tokio::test]
async fn failing_versions_script_reports_only_os() {
    let host = TestHost::new();
    host.runner.respond("versions.sh", 2, "Host.OS=ignored\n");
    let versions = probe(&host, MemoryHypervisor::new()).toolstack_versions().await;
    assert_eq!(versions.len(), 1);
    assert_eq!(
        versions.get("Host.OS").map(String::as_str),
        Some("Rocky Linux 9.3")
    );
}

#[tokio::test]
async fn volume_encryption_needs_luks_and_cryptsetup() {
    let host = TestHost::new();
    let p = probe(&host, MemoryHypervisor::new());
    assert!(!p.volume_encryption_supported().await);

    host.runner
        .respond("qemu-img", 0, "Supported formats: raw qcow2 luks\n");
    assert!(p.volume_encryption_supported().await);

    host.runner.respond("cryptsetup", 127, "");
    assert!(!p.volume_encryption_supported().await);
}

#[tokio::test]
async fn instance_conversion_follows_virt_v2v() {
    let host = TestHost::new();
    let p = probe(&host, MemoryHypervisor::new());
    assert!(p.instance_conversion_supported().await);
    host.runner.respond("virt-v2v", 1, "");
    assert!(!p.instance_conversion_supported().await);
    assert!(
        host.runner
            .calls_to("virt-v2v")
            .iter()
            .all(|a| a == &vec!["--version".to_string()])
    );
}

#[tokio::test]
async fn startup_info_carries_identity_tags_and_health() {
    let host = TestHost::new();
    let p = probe(&host, MemoryHypervisor::new());
    let caps = p.probe().await.unwrap();
    let (info, pools) = p
        .startup_info(&caps, HealthCheckResult::Failure)
        .await
        .unwrap();

    assert_eq!(info.host_id, "7");
    assert_eq!(info.zone, "1");
    assert_eq!(info.host_tags, vec!["ssd", "gpu"]);
    assert_eq!(info.capabilities, "hvm,snapshot");
    assert_eq!(info.hypervisor_version, "7.2.0");
    assert_eq!(info.speed_mhz, 2400);
    assert_eq!(info.iqn, None);
    assert_eq!(info.host_health_check_result, Some(false));
    assert_eq!(pools.len(), 1);
    assert_eq!(pools[0].uuid, LOCAL_POOL_UUID);
    assert_eq!(pools[0].path, host.pool_dir.display().to_string());
}

#[tokio::test]
async fn startup_info_serializes_camel_case() {
    let host = TestHost::new();
    let p = probe(&host, MemoryHypervisor::new());
    let caps = p.probe().await.unwrap();
    let (info, _) = p.startup_info(&caps, HealthCheckResult::Ignore).await.unwrap();
    let json = serde_json::to_value(&info).unwrap();
    assert_eq!(json["hostId"], "7");
    assert_eq!(json["reservedMemoryBytes"], 1024u64 * 1024 * 1024);
    assert!(json["hostHealthCheckResult"].is_null());
}
