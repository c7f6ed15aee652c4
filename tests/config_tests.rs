// Config loading and validation tests

use hostagent::config::{AgentConfig, BridgeType, HypervisorBackend};

const VALID_CONFIG: &str = r#"
[server]
port = 8250
host = "0.0.0.0"

[agent]
host_id = "7"
guid = "6a1d2c3b-host-7"
host_tags = "ssd, gpu,,ssd "
local_storage_path = "/var/lib/libvirt/images"

[hypervisor]
backend = "virsh"

[network]
bridge_type = "native"
public_bridge = "cloudbr0"
private_bridge = "cloudbr1"

[scripts]
dir = "/usr/share/agent/scripts"

[monitoring]
sample_interval_ms = 1000
stats_log_interval_secs = 60
broadcast_capacity = 60
"#;

#[test]
fn test_config_loads_from_str() {
    let config = AgentConfig::load_from_str(VALID_CONFIG).expect("load_from_str");
    assert_eq!(config.server.port, 8250);
    assert_eq!(config.agent.host_id, "7");
    assert_eq!(config.hypervisor.backend, HypervisorBackend::Virsh);
    assert_eq!(config.hypervisor.uri, "qemu:///system");
    assert_eq!(config.hypervisor.guest_cpu_mode, "host-passthrough");
    assert_eq!(config.network.bridge_type, BridgeType::Native);
    assert_eq!(config.network.control_bridge, None);
    assert_eq!(config.agent.command_timeout_secs, 3600);
    assert_eq!(config.scripts.timeout_secs, 30);
    assert_eq!(config.storage.nfs_mount_root, "/mnt");
    assert!(!config.storage.disk_activity_check_enabled);
    assert_eq!(config.monitoring.broadcast_capacity, 60);
}

#[test]
fn test_host_tags_are_trimmed_and_deduplicated() {
    let config = AgentConfig::load_from_str(VALID_CONFIG).unwrap();
    assert_eq!(config.host_tags(), vec!["ssd", "gpu"]);
}

#[test]
fn test_local_pool_uuid_is_derived_from_path() {
    let config = AgentConfig::load_from_str(VALID_CONFIG).unwrap();
    let pools = config.local_pools();
    assert_eq!(pools.len(), 1);
    assert_eq!(pools[0].path, "/var/lib/libvirt/images");
    let again = AgentConfig::load_from_str(VALID_CONFIG).unwrap().local_pools();
    assert_eq!(pools[0].uuid, again[0].uuid);
    assert_eq!(
        uuid::Uuid::parse_str(&pools[0].uuid).unwrap().get_version_num(),
        3
    );
}

#[test]
fn test_extra_pools_are_deduplicated_by_uuid() {
    let toml = VALID_CONFIG.replace(
        "local_storage_path = \"/var/lib/libvirt/images\"",
        "local_storage_path = \"/var/lib/libvirt/images\"\nlocal_storage_uuid = \"p-1\"",
    ) + r#"
[storage]
pools = [
    { uuid = "p-1", path = "/elsewhere" },
    { uuid = "p-2", path = "/data/pool2" },
]
"#;
    let config = AgentConfig::load_from_str(&toml).unwrap();
    let pools = config.local_pools();
    let ids: Vec<&str> = pools.iter().map(|p| p.uuid.as_str()).collect();
    assert_eq!(ids, vec!["p-1", "p-2"]);
    assert_eq!(pools[0].path, "/var/lib/libvirt/images");
}

#[test]
fn test_config_validation_rejects_invalid_port() {
    let bad = VALID_CONFIG.replace("port = 8250", "port = 0");
    let err = AgentConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("server.port"));
}

#[test]
fn test_config_validation_rejects_empty_guid() {
    let bad = VALID_CONFIG.replace("guid = \"6a1d2c3b-host-7\"", "guid = \"\"");
    let err = AgentConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("agent.guid"));
}

#[test]
fn test_config_validation_rejects_unknown_backend() {
    let bad = VALID_CONFIG.replace("backend = \"virsh\"", "backend = \"xen\"");
    assert!(AgentConfig::load_from_str(&bad).is_err());
}

#[test]
fn test_config_validation_rejects_custom_cpu_without_model() {
    let bad = VALID_CONFIG.replace(
        "backend = \"virsh\"",
        "backend = \"virsh\"\nguest_cpu_mode = \"custom\"",
    );
    let err = AgentConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("guest_cpu_model"));
}

#[test]
fn test_config_validation_rejects_stop_timeout_below_poll() {
    let bad = VALID_CONFIG.replace(
        "backend = \"virsh\"",
        "backend = \"virsh\"\nstop_timeout_ms = 10\nstop_poll_interval_ms = 100",
    );
    let err = AgentConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("stop_timeout_ms"));
}

#[test]
fn test_config_validation_rejects_unknown_vif_driver() {
    let bad = VALID_CONFIG.replace(
        "private_bridge = \"cloudbr1\"",
        "private_bridge = \"cloudbr1\"\nvif_drivers = { Guest = \"macvtap\" }",
    );
    let err = AgentConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("vif_drivers"));
}

#[test]
fn test_config_validation_rejects_sample_interval_zero() {
    let bad = VALID_CONFIG.replace("sample_interval_ms = 1000", "sample_interval_ms = 0");
    let err = AgentConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("sample_interval_ms"));
}

#[test]
fn test_config_validation_rejects_broadcast_capacity_zero() {
    let bad = VALID_CONFIG.replace("broadcast_capacity = 60", "broadcast_capacity = 0");
    let err = AgentConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("broadcast_capacity"));
}

#[test]
fn test_missing_agent_section_fails() {
    let bad = VALID_CONFIG.replace("[agent]", "[other]");
    assert!(AgentConfig::load_from_str(&bad).is_err());
}

#[test]
fn test_missing_script_is_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let toml = VALID_CONFIG.replace(
        "/usr/share/agent/scripts",
        &dir.path().display().to_string(),
    );
    let config = AgentConfig::load_from_str(&toml).unwrap();
    let err = config.scripts.resolve().unwrap_err();
    assert!(err.to_string().contains("versions.sh"));
}

#[test]
fn test_uefi_tables_use_dotted_keys() {
    let toml = VALID_CONFIG.to_string()
        + r#"
[uefi]
"guest.loader.secure" = "/usr/share/OVMF/OVMF_CODE.secboot.fd"
"guest.nvram.path" = "/var/lib/libvirt/qemu/nvram/"
"#;
    let config = AgentConfig::load_from_str(&toml).unwrap();
    let tables = config.uefi.tables();
    assert_eq!(
        tables.loader_secure.as_deref(),
        Some("/usr/share/OVMF/OVMF_CODE.secboot.fd")
    );
    assert_eq!(tables.loader_legacy, None);
}
