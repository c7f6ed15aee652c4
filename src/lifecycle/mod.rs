// Lifecycle controller: start, stop, reboot, migrate and device hot-plug

mod snapshot;

pub use snapshot::{CaptureError, SnapshotMetadata, SnapshotStore, capture, restore};

use crate::compiler::{CompilerConfig, assemble, compile, render_disk, render_interface, render_xml};
use crate::config::HypervisorConfig;
use crate::error::AgentError;
use crate::hypervisor::{Hypervisor, domxml};
use crate::models::{DiskBus, DiskSource, DiskSpec, DomainState, HostCapabilities, NicSpec, VmSpec};
use crate::network::{NetworkResolver, NicOptions};
use crate::storage::{DiskContext, StorageResolver, cdrom_disk};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

const STATE_READ_RETRIES: usize = 3;
const HOTPLUG_NIC_MODEL: &str = "virtio";

/// Where a VM is in its transition. Absent VMs have no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleState {
    Starting,
    Running,
    StopRequested,
    GraceWait,
    ForceStop,
    ShutOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopPolicy {
    pub timeout: Duration,
    pub poll: Duration,
}

impl StopPolicy {
    pub fn from_config(cfg: &HypervisorConfig) -> Self {
        Self {
            timeout: Duration::from_millis(cfg.stop_timeout_ms),
            poll: Duration::from_millis(cfg.stop_poll_interval_ms),
        }
    }
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            poll: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopOutcome {
    pub already_stopped: bool,
    pub forced: bool,
}

pub struct LifecycleController {
    hypervisor: Arc<dyn Hypervisor>,
    storage: Arc<StorageResolver>,
    network: Arc<NetworkResolver>,
    caps: HostCapabilities,
    compiler: CompilerConfig,
    stop: StopPolicy,
    states: DashMap<String, LifecycleState>,
    domain_locks: DashMap<String, Arc<Mutex<()>>>,
    // Device edits read-modify-write the domain XML.
    device_lock: Mutex<()>,
    snapshots: SnapshotStore,
}

impl LifecycleController {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        storage: Arc<StorageResolver>,
        network: Arc<NetworkResolver>,
        caps: HostCapabilities,
        compiler: CompilerConfig,
        stop: StopPolicy,
    ) -> Self {
        Self {
            hypervisor,
            storage,
            network,
            caps,
            compiler,
            stop,
            states: DashMap::new(),
            domain_locks: DashMap::new(),
            device_lock: Mutex::new(()),
            snapshots: SnapshotStore::new(),
        }
    }

    pub fn hypervisor(&self) -> &Arc<dyn Hypervisor> {
        &self.hypervisor
    }

    pub fn network(&self) -> &Arc<NetworkResolver> {
        &self.network
    }

    pub fn capabilities(&self) -> &HostCapabilities {
        &self.caps
    }

    pub fn state(&self, name: &str) -> Option<LifecycleState> {
        self.states.get(name).map(|s| *s)
    }

    pub fn states(&self) -> BTreeMap<String, LifecycleState> {
        self.states
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    /// Snapshot metadata held for a stopped VM.
    pub fn saved_snapshots(&self, name: &str) -> Vec<SnapshotMetadata> {
        self.snapshots.get(name)
    }

    fn set_state(&self, name: &str, state: LifecycleState) {
        self.states.insert(name.to_string(), state);
    }

    fn domain_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.domain_locks
            .entry(name.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Resolve devices and render the full domain XML for `spec` on this host.
    pub async fn definition_xml(&self, spec: &VmSpec) -> Result<String, AgentError> {
        let def = compile(spec, &self.caps, &self.compiler)?;
        let disks = self.storage.resolve_all(spec).await?;
        let nics = self.network.resolve_all(spec).await?;
        Ok(render_xml(&assemble(def, disks, nics)))
    }

    #[instrument(skip(self, spec), fields(component = "lifecycle", operation = "start", vm = %spec.name))]
    pub async fn start(&self, spec: &VmSpec) -> Result<(), AgentError> {
        let lock = self.domain_lock(&spec.name);
        let _guard = lock.lock().await;
        self.set_state(&spec.name, LifecycleState::Starting);
        match self.start_locked(spec).await {
            Ok(()) => {
                self.set_state(&spec.name, LifecycleState::Running);
                info!("vm started");
                Ok(())
            }
            Err(e) => {
                self.states.remove(&spec.name);
                warn!(error = %e, "vm start failed");
                Err(e)
            }
        }
    }

    async fn start_locked(&self, spec: &VmSpec) -> Result<(), AgentError> {
        let xml = self.definition_xml(spec).await?;
        match self.hypervisor.domain_info(&spec.name).await {
            Ok(info) if info.persistent => {
                debug!("dropping persistent definition before create");
                self.hypervisor.undefine(&spec.name).await?;
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        self.hypervisor.create_transient(&xml).await?;
        self.restore_snapshots(&spec.name).await;
        Ok(())
    }

    /// Redefine snapshot metadata captured when the VM was last stopped here.
    pub async fn restore_snapshots(&self, name: &str) {
        let saved = self.snapshots.take(name);
        if !saved.is_empty() {
            restore(self.hypervisor.as_ref(), name, &saved).await;
        }
    }

    #[instrument(skip(self), fields(component = "lifecycle", operation = "stop"))]
    pub async fn stop(&self, name: &str, force: bool) -> Result<StopOutcome, AgentError> {
        let lock = self.domain_lock(name);
        let result = {
            let _guard = lock.lock().await;
            self.stop_locked(name, force).await
        };
        drop(lock);
        self.prune_lock(name);
        result
    }

    async fn stop_locked(&self, name: &str, force: bool) -> Result<StopOutcome, AgentError> {
        const ALREADY_STOPPED: StopOutcome = StopOutcome {
            already_stopped: true,
            forced: false,
        };
        let info = match self.hypervisor.domain_info(name).await {
            Ok(info) => info,
            Err(e) if e.is_not_found() => {
                debug!("domain not found, nothing to stop");
                self.set_state(name, LifecycleState::ShutOff);
                return Ok(ALREADY_STOPPED);
            }
            Err(e) => return Err(e.into()),
        };
        if !info.state.is_active() {
            debug!(state = ?info.state, "domain is not running, nothing to stop");
            self.set_state(name, LifecycleState::ShutOff);
            return Ok(ALREADY_STOPPED);
        }

        let previous = self.state(name);
        self.set_state(name, LifecycleState::StopRequested);
        let xml = match self.hypervisor.domain_xml(name).await {
            Ok(xml) => xml,
            Err(e) if e.is_not_found() => {
                self.set_state(name, LifecycleState::ShutOff);
                return Ok(ALREADY_STOPPED);
            }
            Err(e) => {
                self.restore_state(name, previous);
                return Err(e.into());
            }
        };

        // `removed` tracks whether the metadata is off the domain and must be
        // redefined if the domain survives.
        let (snapshots, removed) = match capture(self.hypervisor.as_ref(), name).await {
            Ok(s) => (s, true),
            Err(e) if e.source.is_connectivity() => {
                self.restore_state(name, previous);
                return Err(e.source);
            }
            Err(e) => {
                warn!(error = %e, operation = "capture_snapshots", "snapshot metadata left on the domain");
                (e.captured, false)
            }
        };

        match self.stop_domain(name, force, info.persistent).await {
            Ok(outcome) => {
                self.snapshots.save(name, snapshots);
                self.release_devices(&xml).await;
                self.set_state(name, LifecycleState::ShutOff);
                info!(forced = outcome.forced, already_stopped = outcome.already_stopped, "vm stopped");
                Ok(outcome)
            }
            Err(e) => {
                if removed {
                    restore(self.hypervisor.as_ref(), name, &snapshots).await;
                }
                self.set_state(name, LifecycleState::Running);
                warn!(error = %e, "vm stop failed");
                Err(e)
            }
        }
    }

    fn restore_state(&self, name: &str, previous: Option<LifecycleState>) {
        match previous {
            Some(state) => self.set_state(name, state),
            None => {
                self.states.remove(name);
            }
        }
    }

    /// Drop the per-domain lock once nobody else holds or waits on it.
    fn prune_lock(&self, name: &str) {
        self.domain_locks
            .remove_if(name, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Forget a `ShutOff` entry after the stop has been answered.
    pub fn forget_stopped(&self, name: &str) {
        self.states
            .remove_if(name, |_, state| *state == LifecycleState::ShutOff);
    }

    /// Number of per-domain locks currently held in the table.
    pub fn tracked_locks(&self) -> usize {
        self.domain_locks.len()
    }

    async fn stop_domain(
        &self,
        name: &str,
        force: bool,
        persistent: bool,
    ) -> Result<StopOutcome, AgentError> {
        if force {
            let destroyed = self.force_stop(name).await?;
            return Ok(StopOutcome {
                already_stopped: !destroyed,
                forced: true,
            });
        }

        self.set_state(name, LifecycleState::GraceWait);
        let graceful = match self.graceful_stop(name, persistent).await {
            Ok(stopped) => stopped,
            Err(e) if e.is_connectivity() => return Err(e),
            Err(e) => {
                // qemu may exit while the control interface is still talking to it.
                debug!(error = %e, "graceful stop reported an error, checking state");
                matches!(
                    self.read_state(name).await?,
                    None | Some(DomainState::ShutOff)
                )
            }
        };
        if graceful {
            return Ok(StopOutcome::default());
        }
        warn!(vm = name, timeout_ms = self.stop.timeout.as_millis() as u64, "graceful stop did not finish, forcing");
        self.force_stop(name).await?;
        Ok(StopOutcome {
            already_stopped: false,
            forced: true,
        })
    }

    /// ACPI shutdown, then poll until the domain is gone or off. `false` on timeout.
    async fn graceful_stop(&self, name: &str, persistent: bool) -> Result<bool, AgentError> {
        match self.hypervisor.shutdown(name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(true),
            Err(e) => return Err(e.into()),
        }
        let deadline = Instant::now() + self.stop.timeout;
        let mut ticker = tokio::time::interval(self.stop.poll.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match self.hypervisor.domain_info(name).await {
                Err(e) if e.is_not_found() => return Ok(true),
                Err(e) => return Err(e.into()),
                Ok(info) if !info.state.is_active() => {
                    if persistent {
                        self.undefine_quietly(name).await?;
                    }
                    return Ok(true);
                }
                Ok(_) => {}
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
        }
    }

    /// Destroy (and undefine when persistent). `false` if there was nothing running.
    async fn force_stop(&self, name: &str) -> Result<bool, AgentError> {
        self.set_state(name, LifecycleState::ForceStop);
        let info = match self.hypervisor.domain_info(name).await {
            Ok(info) => info,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if !info.state.is_active() {
            return Ok(false);
        }
        match self.hypervisor.destroy(name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        if info.persistent {
            self.undefine_quietly(name).await?;
        }
        Ok(true)
    }

    async fn undefine_quietly(&self, name: &str) -> Result<(), AgentError> {
        match self.hypervisor.undefine(name).await {
            Err(e) if !e.is_not_found() => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Domain state, retried because reads can fail while qemu is exiting.
    /// `None` when the domain is gone. A lost connection is returned at once;
    /// other errors only after every retry failed.
    async fn read_state(&self, name: &str) -> Result<Option<DomainState>, AgentError> {
        let mut last = None;
        for _ in 0..STATE_READ_RETRIES {
            match self.hypervisor.domain_info(name).await {
                Ok(info) => return Ok(Some(info.state)),
                Err(e) if e.is_not_found() => return Ok(None),
                Err(e) if e.is_connection() => return Err(e.into()),
                Err(e) => {
                    debug!(error = %e, vm = name, "failed to read domain state");
                    last = Some(e);
                }
            }
        }
        Err(last.map_or_else(
            || AgentError::Operation(format!("state of {} could not be read", name)),
            AgentError::from,
        ))
    }

    /// Remove volume secrets and tear down VIF plumbing of a domain that is gone.
    async fn release_devices(&self, xml: &str) {
        self.storage.revoke_secrets(&domxml::parse_disks(xml)).await;
        for iface in domxml::parse_interfaces(xml) {
            if let Err(e) = self.network.unplug(&iface).await {
                warn!(error = %e, operation = "unplug", mac = %iface.mac, "failed to unplug vif");
            }
        }
    }

    #[instrument(skip(self), fields(component = "lifecycle", operation = "reboot"))]
    pub async fn reboot(&self, name: &str) -> Result<(), AgentError> {
        let lock = self.domain_lock(name);
        let _guard = lock.lock().await;
        self.hypervisor.reboot(name).await?;
        info!("vm rebooted");
        Ok(())
    }

    /// Target side of a migration: plug storage and networks, return the domain XML.
    #[instrument(skip(self, spec), fields(component = "lifecycle", operation = "prepare_migration", vm = %spec.name))]
    pub async fn prepare_migration(&self, spec: &VmSpec) -> Result<String, AgentError> {
        let lock = self.domain_lock(&spec.name);
        let _guard = lock.lock().await;
        self.definition_xml(spec).await
    }

    #[instrument(skip(self), fields(component = "lifecycle", operation = "migrate"))]
    pub async fn migrate(&self, name: &str, destination_uri: &str) -> Result<(), AgentError> {
        let lock = self.domain_lock(name);
        let result = {
            let _guard = lock.lock().await;
            self.migrate_locked(name, destination_uri).await
        };
        drop(lock);
        self.prune_lock(name);
        result
    }

    async fn migrate_locked(&self, name: &str, destination_uri: &str) -> Result<(), AgentError> {
        let xml = self.hypervisor.domain_xml(name).await?;
        // A failed capture leaves the metadata on the domain.
        let snapshots = capture(self.hypervisor.as_ref(), name)
            .await
            .map_err(|e| e.source)?;
        if let Err(e) = self.hypervisor.migrate(name, destination_uri).await {
            restore(self.hypervisor.as_ref(), name, &snapshots).await;
            return Err(e.into());
        }
        self.release_devices(&xml).await;
        self.states.remove(name);
        info!("vm migrated");
        Ok(())
    }

    #[instrument(skip(self, disk), fields(component = "lifecycle", operation = "attach_volume", path = %disk.path))]
    pub async fn attach_volume(&self, vm: &str, disk: &DiskSpec) -> Result<(), AgentError> {
        let _guard = self.device_lock.lock().await;
        let xml = self.hypervisor.domain_xml(vm).await?;
        let bus = domxml::parse_disks(&xml)
            .iter()
            .find(|d| d.device == "disk")
            .and_then(|d| d.bus.as_deref())
            .and_then(DiskBus::parse)
            .filter(|b| *b == DiskBus::Scsi)
            .unwrap_or(DiskBus::Virtio);
        let resolved = self
            .storage
            .resolve(disk, &DiskContext::for_attach(bus, DiskBus::Ide))
            .await?;
        self.hypervisor
            .attach_device(vm, &render_disk(&resolved))
            .await?;
        info!(vm, target = %resolved.target_dev, "volume attached");
        Ok(())
    }

    #[instrument(skip(self, disk), fields(component = "lifecycle", operation = "detach_volume", path = %disk.path))]
    pub async fn detach_volume(&self, vm: &str, disk: &DiskSpec) -> Result<(), AgentError> {
        let _guard = self.device_lock.lock().await;
        let xml = self.hypervisor.domain_xml(vm).await?;
        let path = self.storage.attached_path(disk).await?;
        let Some(found) = domxml::parse_disks(&xml).into_iter().find(|d| {
            d.source
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case(&path))
        }) else {
            return Err(AgentError::operation(format!(
                "disk: {} is not attached before",
                path
            )));
        };
        self.hypervisor.detach_device(vm, &found.raw).await?;
        self.storage
            .revoke_secrets(std::slice::from_ref(&found))
            .await;
        self.storage.disconnect(disk).await;
        info!(vm, target = %found.target_dev, "volume detached");
        Ok(())
    }

    /// Insert or eject media in the VM's cdrom drive.
    #[instrument(skip(self), fields(component = "lifecycle", operation = "attach_iso"))]
    pub async fn attach_iso(&self, vm: &str, iso_path: &str, attach: bool) -> Result<(), AgentError> {
        let _guard = self.device_lock.lock().await;
        let xml = self.hypervisor.domain_xml(vm).await?;
        let cdrom = domxml::parse_disks(&xml)
            .into_iter()
            .find(|d| d.device == "cdrom")
            .ok_or_else(|| AgentError::operation(format!("{} has no cdrom device", vm)))?;
        let source = if attach {
            self.storage.iso_path(iso_path).await?
        } else {
            DiskSource::Empty
        };
        let bus = cdrom
            .bus
            .as_deref()
            .and_then(DiskBus::parse)
            .unwrap_or(DiskBus::Ide);
        let mut disk = cdrom_disk(0, bus, source);
        disk.target_dev = cdrom.target_dev.clone();
        self.hypervisor.update_device(vm, &render_disk(&disk)).await?;
        debug!(vm, attach, "cdrom media changed");
        Ok(())
    }

    /// Hot-plug a NIC. `false` when a NIC with the same MAC is already present.
    #[instrument(skip(self, nic, details), fields(component = "lifecycle", operation = "plug_nic", mac = %nic.mac))]
    pub async fn plug_nic(
        &self,
        vm: &str,
        nic: &NicSpec,
        vcpus: u32,
        details: &BTreeMap<String, String>,
    ) -> Result<bool, AgentError> {
        let _guard = self.device_lock.lock().await;
        let xml = self.hypervisor.domain_xml(vm).await?;
        if domxml::parse_interfaces(&xml)
            .iter()
            .any(|i| i.mac.eq_ignore_ascii_case(&nic.mac))
        {
            debug!(vm, "nic already plugged");
            return Ok(false);
        }
        let opts = NicOptions::from_details(HOTPLUG_NIC_MODEL, details, vcpus);
        let resolved = self.network.resolve(nic, &opts).await?;
        self.hypervisor
            .attach_device(vm, &render_interface(&resolved))
            .await?;
        info!(vm, bridge = %resolved.bridge, "nic plugged");
        Ok(true)
    }

    /// Hot-unplug the NIC with `mac`. `false` when no such NIC is present.
    #[instrument(skip(self), fields(component = "lifecycle", operation = "unplug_nic"))]
    pub async fn unplug_nic(&self, vm: &str, mac: &str) -> Result<bool, AgentError> {
        let _guard = self.device_lock.lock().await;
        let xml = self.hypervisor.domain_xml(vm).await?;
        let Some(iface) = domxml::parse_interfaces(&xml)
            .into_iter()
            .find(|i| i.mac.eq_ignore_ascii_case(mac))
        else {
            debug!(vm, "nic not present");
            return Ok(false);
        };
        self.hypervisor.detach_device(vm, &iface.raw).await?;
        if let Err(e) = self.network.unplug(&iface).await {
            warn!(error = %e, operation = "unplug", mac, "failed to clean up vif");
        }
        info!(vm, "nic unplugged");
        Ok(true)
    }
}
