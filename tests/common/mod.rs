// Shared test helpers
#![allow(dead_code)]

use async_trait::async_trait;
use hostagent::agent::Agent;
use hostagent::config::{AgentConfig, REQUIRED_SCRIPTS, ScriptPaths};
use hostagent::error::AgentError;
use hostagent::hypervisor::MemoryHypervisor;
use hostagent::models::*;
use hostagent::script::{CommandOutput, ScriptRunner};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const LOCAL_POOL_UUID: &str = "1f0b9c2e-5a57-4f3b-9a3c-6c2a0b7e1d11";
pub const VM_NAME: &str = "i-2-10-VM";
pub const GUEST_MAC: &str = "02:00:4c:5a:00:01";

/// Records every invocation and answers from a per-program table. Programs are
/// matched by full path first, then by file name. Unknown programs succeed silently.
#[derive(Default)]
pub struct FakeRunner {
    calls: Mutex<Vec<(String, Vec<String>)>>,
    responses: Mutex<HashMap<String, CommandOutput>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, program: &str, status: i32, stdout: &str) {
        self.responses.lock().unwrap().insert(
            program.to_string(),
            CommandOutput {
                status: Some(status),
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        );
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }

    /// Invocations whose program file name is `name`.
    pub fn calls_to(&self, name: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|(p, _)| file_name(p) == name)
            .map(|(_, a)| a)
            .collect()
    }
}

fn file_name(program: &str) -> &str {
    program.rsplit('/').next().unwrap_or(program)
}

#[async_trait]
impl ScriptRunner for FakeRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        _timeout: Duration,
    ) -> Result<CommandOutput, AgentError> {
        self.calls
            .lock()
            .unwrap()
            .push((program.to_string(), args.to_vec()));
        let responses = self.responses.lock().unwrap();
        Ok(responses
            .get(program)
            .or_else(|| responses.get(file_name(program)))
            .cloned()
            .unwrap_or(CommandOutput {
                status: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            }))
    }
}

/// A host laid out in a tempdir: scripts, a fake sysfs with two bridges, one local pool.
pub struct TestHost {
    pub dir: tempfile::TempDir,
    pub pool_dir: PathBuf,
    pub sysfs: PathBuf,
    pub scripts_dir: PathBuf,
    pub iqn_file: PathBuf,
    pub hv: MemoryHypervisor,
    pub runner: Arc<FakeRunner>,
}

impl TestHost {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let pool_dir = root.join("pool");
        let sysfs = root.join("sysfs");
        let scripts_dir = root.join("scripts");
        std::fs::create_dir_all(&pool_dir).unwrap();
        std::fs::create_dir_all(&scripts_dir).unwrap();
        for script in REQUIRED_SCRIPTS {
            std::fs::write(scripts_dir.join(script), "#!/bin/sh\n").unwrap();
        }
        for (bridge, pif) in [("cloudbr0", "eth0"), ("cloudbr1", "eth1")] {
            std::fs::create_dir_all(sysfs.join(bridge).join("bridge")).unwrap();
            std::fs::create_dir_all(sysfs.join(bridge).join("brif").join(pif)).unwrap();
        }
        let iqn_file = root.join("initiatorname.iscsi");
        std::fs::write(&iqn_file, "InitiatorName=iqn.1994-05.com.redhat:host7\n").unwrap();
        Self {
            dir,
            pool_dir,
            sysfs,
            scripts_dir,
            iqn_file,
            hv: MemoryHypervisor::new(),
            runner: Arc::new(FakeRunner::new()),
        }
    }

    pub fn config_toml(&self) -> String {
        format!(
            r#"
[server]
port = 8250
host = "127.0.0.1"

[agent]
host_id = "7"
guid = "6a1d2c3b-host-7"
zone = "1"
pod = "1"
cluster = "1"
host_tags = "ssd, gpu,ssd"
local_storage_path = "{pool}"
local_storage_uuid = "{pool_uuid}"
reserved_memory_mb = 1024
command_timeout_secs = 30
iscsi_initiator_file = "{iqn}"

[hypervisor]
backend = "memory"
stop_timeout_ms = 300
stop_poll_interval_ms = 20

[network]
bridge_type = "native"
public_bridge = "cloudbr0"
private_bridge = "cloudbr1"
sysfs_net_dir = "{sysfs}"

[scripts]
dir = "{scripts}"
timeout_secs = 5

[monitoring]
sample_interval_ms = 20
stats_log_interval_secs = 60
broadcast_capacity = 16
"#,
            pool = self.pool_dir.display(),
            pool_uuid = LOCAL_POOL_UUID,
            iqn = self.iqn_file.display(),
            sysfs = self.sysfs.display(),
            scripts = self.scripts_dir.display(),
        )
    }

    pub fn config(&self) -> AgentConfig {
        AgentConfig::load_from_str(&self.config_toml()).unwrap()
    }

    pub fn scripts(&self) -> ScriptPaths {
        self.config().scripts.resolve().unwrap()
    }

    pub async fn agent(&self) -> Agent {
        Agent::assemble(
            &self.config(),
            &self.scripts(),
            Arc::new(self.hv.clone()),
            self.runner.clone(),
        )
        .await
        .unwrap()
    }

    /// Create a raw volume file in the local pool.
    pub fn volume(&self, name: &str) -> PathBuf {
        let path = self.pool_dir.join(name);
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        path
    }

    /// Put a non-physical port on a bridge, as a running guest would.
    pub fn add_guest_port(&self, bridge: &str, port: &str) {
        std::fs::create_dir_all(self.sysfs.join(bridge).join("brif").join(port)).unwrap();
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

pub fn disk(uuid: &str, role: DiskRole, seq: u32, path: &str) -> DiskSpec {
    serde_json::from_value(serde_json::json!({
        "uuid": uuid,
        "role": role,
        "seq": seq,
        "path": path,
        "pool": {"poolType": "Filesystem", "uuid": LOCAL_POOL_UUID}
    }))
    .unwrap()
}

pub fn guest_nic(mac: &str, device_id: u32) -> NicSpec {
    serde_json::from_value(serde_json::json!({
        "mac": mac,
        "trafficType": "Guest",
        "deviceId": device_id
    }))
    .unwrap()
}

/// A small Linux user VM with one root volume in the local pool, one guest NIC
/// and an empty cdrom.
pub fn vm_spec(name: &str, root_volume: &str) -> VmSpec {
    serde_json::from_value(serde_json::json!({
        "uuid": "5e2f1d4a-0000-4000-8000-000000000001",
        "name": name,
        "vmType": "User",
        "guest": {"os": "Ubuntu 22.04", "platformEmulator": "Ubuntu"},
        "vcpus": 2,
        "minRamBytes": 512u64 << 20,
        "maxRamBytes": 1u64 << 30,
        "speedMhz": 1000,
        "disks": [
            disk("vol-root", DiskRole::Root, 0, root_volume),
            {"uuid": "cd", "role": "ISO", "seq": 3, "path": ""}
        ],
        "nics": [guest_nic(GUEST_MAC, 0)]
    }))
    .unwrap()
}

pub fn caps() -> HostCapabilities {
    HostCapabilities {
        cgroup_version: CgroupVersion::V2,
        cpu_cores: 8,
        cpu_speed_mhz: 2000,
        host_max_capacity: 16_000,
        total_memory_bytes: 16 << 30,
        arch: "x86_64".into(),
        hypervisor_version: 7_002_000,
        toolstack_version: 9_000_000,
        uefi: UefiTables::default(),
        tpm_supported: false,
        disk_activity: DiskActivitySettings::default(),
    }
}
