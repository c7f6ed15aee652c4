// VM power states, delta-based statistics and host health

mod health;

pub use health::HealthChecker;

use crate::error::AgentError;
use crate::hypervisor::Hypervisor;
use crate::models::{HealthCheckResult, HostStatusReport, PowerState, VmDiskStats, VmStats};
use dashmap::DashMap;
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

const STATE_READ_RETRIES: usize = 3;

/// Cumulative counters from the previous poll of one VM.
#[derive(Debug, Clone, Copy)]
struct StatsBaseline {
    cpu_time_ns: u64,
    rx_bytes: u64,
    tx_bytes: u64,
    io_read: u64,
    io_write: u64,
    bytes_read: u64,
    bytes_written: u64,
    at: Instant,
}

#[derive(Debug, Clone, Copy, Default)]
struct DiskBaseline {
    io_read: u64,
    io_write: u64,
    bytes_read: u64,
    bytes_written: u64,
}

fn positive(now: u64, before: u64) -> Option<u64> {
    now.checked_sub(before).filter(|d| *d > 0)
}

fn kb(bytes: Option<u64>) -> Option<f64> {
    bytes.map(|b| b as f64 / 1024.0)
}

/// Key of a disk baseline: VM name and the last segment of the disk path.
fn disk_key(vm: &str, path: &str) -> String {
    format!("{}-{}", vm, path.rsplit('/').next().unwrap_or(path))
}

pub struct Reporter {
    hypervisor: Arc<dyn Hypervisor>,
    health: HealthChecker,
    host_id: String,
    baselines: DashMap<String, StatsBaseline>,
    /// Per VM, keyed by `disk_key`.
    disk_baselines: DashMap<String, BTreeMap<String, DiskBaseline>>,
}

impl Reporter {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, health: HealthChecker, host_id: impl Into<String>) -> Self {
        Self {
            hypervisor,
            health,
            host_id: host_id.into(),
            baselines: DashMap::new(),
            disk_baselines: DashMap::new(),
        }
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub async fn check_health(&self) -> HealthCheckResult {
        self.health.check().await
    }

    /// Power state of one VM. Missing VMs, and VMs whose state could not be read
    /// after retries, are PowerOff.
    pub async fn power_state(&self, name: &str) -> PowerState {
        for attempt in 1..=STATE_READ_RETRIES {
            match self.hypervisor.domain_info(name).await {
                Ok(info) => return info.state.into(),
                Err(e) if e.is_not_found() => return PowerState::PowerOff,
                Err(e) => warn!(error = %e, vm = name, attempt, "can't get vm state, retrying"),
            }
        }
        PowerState::PowerOff
    }

    /// Powered-on VMs only; stopped domains may linger in the hypervisor.
    #[instrument(skip(self), fields(component = "reporter", operation = "host_vm_states"))]
    pub async fn host_vm_states(&self) -> Result<BTreeMap<String, PowerState>, AgentError> {
        let names = self.hypervisor.list_domains().await?;
        let infos = join_all(names.iter().map(|name| self.hypervisor.domain_info(name))).await;
        let mut states = BTreeMap::new();
        for (name, info) in names.into_iter().zip(infos) {
            match info {
                Ok(info) => {
                    let state = PowerState::from(info.state);
                    if state == PowerState::PowerOn {
                        states.insert(name, state);
                    }
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(error = %e, vm = %name, "unable to get vm state"),
            }
        }
        Ok(states)
    }

    /// Ping payload and the worker's periodic report.
    pub async fn status_report(&self) -> Result<HostStatusReport, AgentError> {
        let vm_states = self.host_vm_states().await?;
        let health = self.check_health().await.as_bool();
        Ok(HostStatusReport {
            timestamp: chrono::Utc::now().timestamp_millis().max(0) as u64,
            host_id: self.host_id.clone(),
            vm_states,
            health,
        })
    }

    /// Stats for one VM relative to the previous call. `None` when the VM is gone.
    #[instrument(skip(self), fields(component = "reporter", operation = "vm_stats"))]
    pub async fn vm_stats(&self, name: &str) -> Result<Option<VmStats>, AgentError> {
        let info = match self.hypervisor.domain_info(name).await {
            Ok(info) => info,
            Err(e) if e.is_not_found() => {
                self.evict(name);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let now = Instant::now();
        let ifaces = self.hypervisor.interface_counters(name).await?;
        let blocks = self.hypervisor.block_counters(name).await?;

        let rx_bytes = ifaces.iter().map(|i| i.rx_bytes).sum();
        let tx_bytes = ifaces.iter().map(|i| i.tx_bytes).sum();
        let disks = || blocks.iter().filter(|b| b.device == "disk");
        let current = StatsBaseline {
            cpu_time_ns: info.cpu_time_ns,
            rx_bytes,
            tx_bytes,
            io_read: disks().map(|b| b.rd_req).sum(),
            io_write: disks().map(|b| b.wr_req).sum(),
            bytes_read: disks().map(|b| b.rd_bytes).sum(),
            bytes_written: disks().map(|b| b.wr_bytes).sum(),
            at: now,
        };

        let mut stats = VmStats {
            vm_name: name.to_string(),
            num_cpus: info.vcpus,
            memory_kbs: info.max_memory_kib,
            target_memory_kbs: Some(info.memory_kib),
            ..Default::default()
        };
        match self.hypervisor.memory_counters(name).await {
            Ok(mem) => {
                stats.int_free_memory_kbs = mem.unused_kib;
                stats.int_usable_memory_kbs = mem.usable_kib;
            }
            Err(e) => debug!(error = %e, vm = name, "no balloon statistics"),
        }

        if let Some(old) = self.baselines.get(name).map(|b| *b) {
            let elapsed_ms = now.duration_since(old.at).as_millis() as f64;
            if elapsed_ms > 0.0 && info.vcpus > 0 {
                let used = current.cpu_time_ns as f64 - old.cpu_time_ns as f64;
                let utilization = used / (elapsed_ms * 1_000_000.0) / info.vcpus as f64;
                if utilization > 0.0 {
                    stats.cpu_utilization = Some(utilization * 100.0);
                }
            }
            stats.network_read_kbs = kb(positive(current.rx_bytes, old.rx_bytes));
            stats.network_write_kbs = kb(positive(current.tx_bytes, old.tx_bytes));
            stats.disk_read_iops = positive(current.io_read, old.io_read);
            stats.disk_write_iops = positive(current.io_write, old.io_write);
            stats.disk_read_kbs = kb(positive(current.bytes_read, old.bytes_read));
            stats.disk_write_kbs = kb(positive(current.bytes_written, old.bytes_written));
        }
        self.baselines.insert(name.to_string(), current);
        Ok(Some(stats))
    }

    /// Stats for every named VM that still exists.
    pub async fn vm_stats_for(&self, names: &[String]) -> Result<Vec<VmStats>, AgentError> {
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            if let Some(stats) = self.vm_stats(name).await? {
                out.push(stats);
            }
        }
        Ok(out)
    }

    /// Per-disk deltas for one VM; cdrom and floppy devices are skipped.
    #[instrument(skip(self), fields(component = "reporter", operation = "disk_stats"))]
    pub async fn disk_stats(&self, name: &str) -> Result<Vec<VmDiskStats>, AgentError> {
        let blocks = match self.hypervisor.block_counters(name).await {
            Ok(b) => b,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        let mut seen = BTreeMap::new();
        let previous = self
            .disk_baselines
            .get(name)
            .map(|d| d.value().clone())
            .unwrap_or_default();
        for b in blocks.iter().filter(|b| b.device == "disk" && b.path != "-") {
            let key = disk_key(name, &b.path);
            let current = DiskBaseline {
                io_read: b.rd_req,
                io_write: b.wr_req,
                bytes_read: b.rd_bytes,
                bytes_written: b.wr_bytes,
            };
            let mut stat = VmDiskStats {
                path: b.path.rsplit('/').next().unwrap_or(&b.path).to_string(),
                ..Default::default()
            };
            if let Some(old) = previous.get(&key) {
                stat.io_read = positive(current.io_read, old.io_read);
                stat.io_write = positive(current.io_write, old.io_write);
                stat.bytes_read = positive(current.bytes_read, old.bytes_read);
                stat.bytes_write = positive(current.bytes_written, old.bytes_written);
            }
            seen.insert(key, current);
            out.push(stat);
        }
        self.disk_baselines.insert(name.to_string(), seen);
        Ok(out)
    }

    pub async fn disk_stats_for(
        &self,
        names: &[String],
    ) -> Result<BTreeMap<String, Vec<VmDiskStats>>, AgentError> {
        let mut out = BTreeMap::new();
        for name in names {
            out.insert(name.clone(), self.disk_stats(name).await?);
        }
        Ok(out)
    }

    /// Forget baselines of one VM.
    pub fn evict(&self, name: &str) {
        self.baselines.remove(name);
        self.disk_baselines.remove(name);
    }

    /// Drop baselines of VMs that no longer exist. Returns how many were evicted.
    pub async fn evict_missing(&self) -> Result<usize, AgentError> {
        let live = self.hypervisor.list_domains().await?;
        let mut stale: Vec<String> = self
            .baselines
            .iter()
            .map(|e| e.key().clone())
            .chain(self.disk_baselines.iter().map(|e| e.key().clone()))
            .filter(|k| !live.contains(k))
            .collect();
        stale.sort();
        stale.dedup();
        for name in &stale {
            self.evict(name);
        }
        Ok(stale.len())
    }

    pub fn tracked_vms(&self) -> usize {
        self.baselines.len()
    }
}
