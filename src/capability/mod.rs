// Host capability discovery and the startup registration payload

mod linux;

use crate::config::{AgentConfig, ScriptPaths, StoragePoolEntry};
use crate::error::AgentError;
use crate::hypervisor::{Hypervisor, pretty_version};
use crate::models::{
    DiskActivitySettings, HealthCheckResult, HostCapabilities, PoolType, StartupInfo,
    StartupStoragePool, UefiTables,
};
use crate::script::{ScriptRunner, args};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Disks, System};
use tracing::{debug, info, instrument, warn};

const HOST_CAPABILITIES: &[&str] = &["hvm", "snapshot"];
const TOOL_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the Linux probes read from. Overridable so tests can point at a tempdir.
#[derive(Debug, Clone)]
pub struct ProbePaths {
    pub cgroup_root: PathBuf,
    pub cpufreq_max: PathBuf,
    pub cpuinfo: PathBuf,
    pub os_release: PathBuf,
    pub iqn_file: PathBuf,
}

impl Default for ProbePaths {
    fn default() -> Self {
        Self {
            cgroup_root: "/sys/fs/cgroup".into(),
            cpufreq_max: "/sys/devices/system/cpu/cpu0/cpufreq/cpuinfo_max_freq".into(),
            cpuinfo: "/proc/cpuinfo".into(),
            os_release: "/etc/os-release".into(),
            iqn_file: "/etc/iscsi/initiatorname.iscsi".into(),
        }
    }
}

/// Static identity of this host as configured by the operator.
#[derive(Debug, Clone, Default)]
pub struct HostIdentity {
    pub host_id: String,
    pub guid: String,
    pub zone: String,
    pub pod: String,
    pub cluster: String,
    pub reserved_memory_bytes: u64,
    pub host_tags: Vec<String>,
    pub secured: bool,
    pub instance_conversion_supported: bool,
    pub guest_cpu_mode: String,
    pub guest_cpu_model: Option<String>,
    pub local_pools: Vec<StoragePoolEntry>,
}

impl From<&AgentConfig> for HostIdentity {
    fn from(cfg: &AgentConfig) -> Self {
        Self {
            host_id: cfg.agent.host_id.clone(),
            guid: cfg.agent.guid.clone(),
            zone: cfg.agent.zone.clone(),
            pod: cfg.agent.pod.clone(),
            cluster: cfg.agent.cluster.clone(),
            reserved_memory_bytes: cfg.agent.reserved_memory_mb * 1024 * 1024,
            host_tags: cfg.host_tags(),
            secured: cfg.agent.secured,
            instance_conversion_supported: cfg.agent.instance_conversion_supported,
            guest_cpu_mode: cfg.hypervisor.guest_cpu_mode.clone(),
            guest_cpu_model: cfg.hypervisor.guest_cpu_model.clone(),
            local_pools: cfg.local_pools(),
        }
    }
}

pub struct CapabilityProbe {
    hypervisor: Arc<dyn Hypervisor>,
    runner: Arc<dyn ScriptRunner>,
    identity: HostIdentity,
    paths: ProbePaths,
    uefi: UefiTables,
    tpm_enabled: bool,
    disk_activity: DiskActivitySettings,
    versions_script: Option<PathBuf>,
    script_timeout: Duration,
    sys: Arc<std::sync::Mutex<System>>,
    disks: Arc<std::sync::Mutex<Disks>>,
}

impl CapabilityProbe {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        runner: Arc<dyn ScriptRunner>,
        identity: HostIdentity,
    ) -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu_all();
        Self {
            hypervisor,
            runner,
            identity,
            paths: ProbePaths::default(),
            uefi: UefiTables::default(),
            tpm_enabled: false,
            disk_activity: DiskActivitySettings::default(),
            versions_script: None,
            script_timeout: Duration::from_secs(30),
            sys: Arc::new(std::sync::Mutex::new(sys)),
            disks: Arc::new(std::sync::Mutex::new(Disks::new_with_refreshed_list())),
        }
    }

    pub fn from_config(
        cfg: &AgentConfig,
        scripts: &ScriptPaths,
        hypervisor: Arc<dyn Hypervisor>,
        runner: Arc<dyn ScriptRunner>,
    ) -> Self {
        let mut paths = ProbePaths::default();
        paths.iqn_file = PathBuf::from(&cfg.agent.iscsi_initiator_file);
        Self::new(hypervisor, runner, HostIdentity::from(cfg))
            .with_paths(paths)
            .with_firmware(cfg.uefi.tables(), cfg.hypervisor.tpm_enabled)
            .with_disk_activity(cfg.storage.disk_activity())
            .with_versions_script(
                scripts.versions.clone(),
                Duration::from_secs(cfg.scripts.timeout_secs),
            )
    }

    pub fn with_paths(mut self, paths: ProbePaths) -> Self {
        self.paths = paths;
        self
    }

    pub fn with_firmware(mut self, uefi: UefiTables, tpm_enabled: bool) -> Self {
        self.uefi = uefi;
        self.tpm_enabled = tpm_enabled;
        self
    }

    pub fn with_disk_activity(mut self, settings: DiskActivitySettings) -> Self {
        self.disk_activity = settings;
        self
    }

    pub fn with_versions_script(mut self, script: PathBuf, timeout: Duration) -> Self {
        self.versions_script = Some(script);
        self.script_timeout = timeout;
        self
    }

    pub fn identity(&self) -> &HostIdentity {
        &self.identity
    }

    /// Discover what this host can offer. Reads only; nothing on the host changes.
    #[instrument(skip(self), fields(component = "capability", operation = "probe"))]
    pub async fn probe(&self) -> Result<HostCapabilities, AgentError> {
        let sys = self.sys.clone();
        let (cores, sysinfo_mhz, total_memory) = tokio::task::spawn_blocking(move || {
            let mut sys = sys
                .lock()
                .map_err(|e| AgentError::operation(format!("sysinfo lock poisoned: {}", e)))?;
            sys.refresh_memory();
            sys.refresh_cpu_frequency();
            let mhz = sys.cpus().first().map(|c| c.frequency()).unwrap_or(0);
            Ok::<_, AgentError>((sys.cpus().len() as u32, mhz as u32, sys.total_memory()))
        })
        .await
        .map_err(|e| AgentError::operation(format!("sysinfo task join: {}", e)))??;

        let speed = linux::read_cpufreq_max_mhz(&self.paths.cpufreq_max)
            .or((sysinfo_mhz > 0).then_some(sysinfo_mhz))
            .or_else(|| linux::read_cpuinfo_mhz(&self.paths.cpuinfo))
            .unwrap_or(0);
        let cgroup_version = linux::cgroup_version(&self.paths.cgroup_root);
        let version = self.hypervisor.version().await?;

        let mut caps = HostCapabilities {
            cgroup_version,
            cpu_cores: cores,
            cpu_speed_mhz: speed,
            host_max_capacity: 0,
            total_memory_bytes: total_memory,
            arch: std::env::consts::ARCH.to_string(),
            hypervisor_version: version.hypervisor,
            toolstack_version: version.library,
            uefi: self.uefi.clone(),
            tpm_supported: self.tpm_enabled,
            disk_activity: self.disk_activity.clone(),
        };
        if caps.is_cgroup_v2() {
            caps.host_max_capacity = u64::from(cores) * u64::from(speed);
        }
        info!(
            cores,
            speed_mhz = speed,
            ?cgroup_version,
            host_max_capacity = caps.host_max_capacity,
            hypervisor = %pretty_version(version.hypervisor),
            "host capabilities probed"
        );
        Ok(caps)
    }

    /// `key=value` lines printed by the versions script, plus the OS release as
    /// `Host.OS` when the script does not report one. A failing script yields no keys.
    pub async fn toolstack_versions(&self) -> BTreeMap<String, String> {
        let mut versions = match &self.versions_script {
            Some(script) => {
                let program = script.to_string_lossy().into_owned();
                match self.runner.run(&program, &[], self.script_timeout).await {
                    Ok(out) if out.success() => parse_key_values(&out.stdout),
                    Ok(out) => {
                        warn!(status = ?out.status, operation = "versions", "versions script failed");
                        BTreeMap::new()
                    }
                    Err(e) => {
                        warn!(error = %e, operation = "versions", "versions script failed to run");
                        BTreeMap::new()
                    }
                }
            }
            None => BTreeMap::new(),
        };
        if !versions.contains_key("Host.OS")
            && let Some(os) = linux::read_os_release(&self.paths.os_release)
        {
            versions.insert("Host.OS".to_string(), os);
        }
        versions
    }

    pub fn iqn(&self) -> Option<String> {
        linux::read_iqn(&self.paths.iqn_file)
    }

    /// qemu-img must know the luks format and cryptsetup must be runnable.
    pub async fn volume_encryption_supported(&self) -> bool {
        let qemu = self
            .runner
            .run("qemu-img", &args(&["--help"]), TOOL_CHECK_TIMEOUT)
            .await;
        let luks = matches!(&qemu, Ok(out) if out.stdout.contains("luks"));
        if !luks {
            debug!("qemu-img does not support luks");
            return false;
        }
        self.tool_runs("cryptsetup", &["--version"]).await
    }

    pub async fn instance_conversion_supported(&self) -> bool {
        self.identity.instance_conversion_supported
            || self.tool_runs("virt-v2v", &["--version"]).await
    }

    async fn tool_runs(&self, program: &str, list: &[&str]) -> bool {
        match self.runner.run(program, &args(list), TOOL_CHECK_TIMEOUT).await {
            Ok(out) => out.success(),
            Err(e) => {
                debug!(error = %e, tool = program, "tool not available");
                false
            }
        }
    }

    /// Registration payload: host facts plus one pool per local storage path.
    #[instrument(skip(self, caps), fields(component = "capability", operation = "startup_info"))]
    pub async fn startup_info(
        &self,
        caps: &HostCapabilities,
        health: HealthCheckResult,
    ) -> Result<(StartupInfo, Vec<StartupStoragePool>), AgentError> {
        let id = &self.identity;
        let versions = self.toolstack_versions().await;
        let guest_cpu_mode = versions
            .get("guest.cpu.mode")
            .cloned()
            .or_else(|| Some(id.guest_cpu_mode.clone()).filter(|m| !m.is_empty()))
            .unwrap_or_else(|| "host-passthrough".to_string());
        let info = StartupInfo {
            host_id: id.host_id.clone(),
            guid: id.guid.clone(),
            zone: id.zone.clone(),
            pod: id.pod.clone(),
            cluster: id.cluster.clone(),
            cpus: caps.cpu_cores,
            speed_mhz: caps.cpu_speed_mhz,
            host_max_capacity: caps.host_max_capacity,
            memory_bytes: caps.total_memory_bytes,
            reserved_memory_bytes: id.reserved_memory_bytes,
            capabilities: HOST_CAPABILITIES.join(","),
            hypervisor_version: pretty_version(caps.hypervisor_version),
            versions,
            iqn: self.iqn(),
            cpu_arch: caps.arch.clone(),
            guest_cpu_mode,
            guest_cpu_model: id.guest_cpu_model.clone(),
            host_tags: dedup_tags(&id.host_tags),
            secured: id.secured,
            volume_encryption_supported: self.volume_encryption_supported().await,
            instance_conversion_supported: self.instance_conversion_supported().await,
            host_health_check_result: None,
        }
        .with_health(health);

        let pools = self.local_pools().await?;
        Ok((info, pools))
    }

    async fn local_pools(&self) -> Result<Vec<StartupStoragePool>, AgentError> {
        let disks = self.disks.clone();
        let mounts = tokio::task::spawn_blocking(move || {
            let mut guard = disks
                .lock()
                .map_err(|e| AgentError::operation(format!("sysinfo disks lock poisoned: {}", e)))?;
            guard.refresh(false);
            Ok::<_, AgentError>(
                guard
                    .list()
                    .iter()
                    .map(|d| MountSpace {
                        mount_point: d.mount_point().to_path_buf(),
                        total: d.total_space(),
                        available: d.available_space(),
                    })
                    .collect::<Vec<_>>(),
            )
        })
        .await
        .map_err(|e| AgentError::operation(format!("sysinfo task join: {}", e)))??;

        Ok(self
            .identity
            .local_pools
            .iter()
            .map(|p| {
                let (capacity, available) = space_for(&mounts, Path::new(&p.path));
                StartupStoragePool {
                    uuid: p.uuid.clone(),
                    path: p.path.clone(),
                    pool_type: PoolType::Filesystem,
                    host: "localhost".to_string(),
                    capacity_bytes: capacity,
                    available_bytes: available,
                }
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
struct MountSpace {
    mount_point: PathBuf,
    total: u64,
    available: u64,
}

/// Space of the filesystem with the longest mount point containing `path`.
fn space_for(mounts: &[MountSpace], path: &Path) -> (u64, u64) {
    mounts
        .iter()
        .filter(|m| path.starts_with(&m.mount_point))
        .max_by_key(|m| m.mount_point.as_os_str().len())
        .map(|m| (m.total, m.available))
        .unwrap_or((0, 0))
}

fn parse_key_values(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

fn dedup_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
        if !out.iter().any(|t| t == tag) {
            out.push(tag.to_string());
        }
    }
    out
}
