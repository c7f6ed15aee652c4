// In-process simulated hypervisor for tests and dry runs

use super::domxml;
use super::{
    BlockCounters, DomainInfo, HvResult, Hypervisor, HypervisorVersion, InterfaceCounters,
    MemoryCounters, SecretOutcome, SecretSpec,
};
use crate::error::HypervisorError;
use crate::models::DomainState;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct SimDomain {
    xml: String,
    uuid: String,
    state: DomainState,
    persistent: bool,
    cpu_time_ns: u64,
    vcpus: u32,
    memory_kib: u64,
    interfaces: Vec<InterfaceCounters>,
    blocks: Vec<BlockCounters>,
    memory: MemoryCounters,
    snapshots: BTreeMap<String, String>,
    current_snapshot: Option<String>,
    ignores_shutdown: bool,
}

impl SimDomain {
    fn from_xml(xml: &str, persistent: bool, state: DomainState) -> HvResult<(String, Self)> {
        let name = domxml::domain_name(xml)
            .ok_or_else(|| HypervisorError::failed("define", "domain XML has no <name>"))?;
        let memory_kib = domxml::memory_kib(xml).unwrap_or(0);
        let mut dom = SimDomain {
            xml: xml.to_string(),
            uuid: domxml::domain_uuid(xml).unwrap_or_default(),
            state,
            persistent,
            cpu_time_ns: 0,
            vcpus: domxml::vcpu_count(xml).unwrap_or(1),
            memory_kib,
            interfaces: Vec::new(),
            blocks: Vec::new(),
            memory: MemoryCounters {
                actual_kib: memory_kib,
                unused_kib: None,
                usable_kib: None,
            },
            snapshots: BTreeMap::new(),
            current_snapshot: None,
            ignores_shutdown: false,
        };
        dom.refresh_devices();
        Ok((name, dom))
    }

    /// Re-derive device lists from the XML, keeping counters of devices that survive.
    fn refresh_devices(&mut self) {
        let old_ifaces = std::mem::take(&mut self.interfaces);
        self.interfaces = domxml::parse_interfaces(&self.xml)
            .into_iter()
            .enumerate()
            .map(|(i, nic)| {
                old_ifaces
                    .iter()
                    .find(|o| o.mac.eq_ignore_ascii_case(&nic.mac))
                    .cloned()
                    .unwrap_or(InterfaceCounters {
                        target: nic.target_dev.unwrap_or_else(|| format!("vnet{}", i)),
                        mac: nic.mac,
                        rx_bytes: 0,
                        tx_bytes: 0,
                    })
            })
            .collect();
        let old_blocks = std::mem::take(&mut self.blocks);
        self.blocks = domxml::parse_disks(&self.xml)
            .into_iter()
            .map(|d| {
                old_blocks
                    .iter()
                    .find(|o| o.target == d.target_dev)
                    .cloned()
                    .unwrap_or(BlockCounters {
                        target: d.target_dev,
                        path: d.source.unwrap_or_else(|| "-".into()),
                        device: d.device,
                        ..Default::default()
                    })
            })
            .collect();
    }
}

/// A one-shot failure armed on an operation name.
#[derive(Debug, Clone)]
struct Fault {
    op: String,
    skip: usize,
    connection: bool,
}

#[derive(Debug, Default)]
struct SimState {
    domains: BTreeMap<String, SimDomain>,
    secrets: BTreeMap<String, SecretSpec>,
    unreachable: bool,
    calls: Vec<String>,
    faults: Vec<Fault>,
}

impl SimState {
    fn trip(&mut self, op: &str) -> HvResult<()> {
        let Some(i) = self.faults.iter().position(|f| f.op == op) else {
            return Ok(());
        };
        if self.faults[i].skip > 0 {
            self.faults[i].skip -= 1;
            return Ok(());
        }
        let fault = self.faults.remove(i);
        if fault.connection {
            // The connection stays down until set_unreachable(false).
            self.unreachable = true;
            return Err(HypervisorError::ConnectionFailed(format!(
                "connection lost during {}",
                op
            )));
        }
        Err(HypervisorError::failed(op, "simulated failure"))
    }
}

/// A hypervisor that keeps every domain in memory. Transient domains vanish when
/// they stop, persistent ones stay shut off, matching libvirt semantics.
#[derive(Clone)]
pub struct MemoryHypervisor {
    state: Arc<Mutex<SimState>>,
    version: HypervisorVersion,
}

impl Default for MemoryHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHypervisor {
    pub fn new() -> Self {
        Self::with_version(HypervisorVersion {
            library: 9_000_000,
            hypervisor: 7_002_000,
        })
    }

    pub fn with_version(version: HypervisorVersion) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
            version,
        }
    }

    fn lock(&self) -> HvResult<MutexGuard<'_, SimState>> {
        let guard = self
            .state
            .lock()
            .map_err(|e| HypervisorError::Internal(format!("sim state lock poisoned: {}", e)))?;
        if guard.unreachable {
            return Err(HypervisorError::ConnectionFailed(
                "simulated hypervisor unreachable".into(),
            ));
        }
        Ok(guard)
    }

    fn with_domain<T>(
        &self,
        op: &str,
        name: &str,
        f: impl FnOnce(&mut SimDomain) -> HvResult<T>,
    ) -> HvResult<T> {
        let mut state = self.lock()?;
        state.calls.push(format!("{} {}", op, name));
        state.trip(op)?;
        let dom = state
            .domains
            .get_mut(name)
            .ok_or_else(|| HypervisorError::NotFound(format!("Domain not found: {}", name)))?;
        f(dom)
    }

    /// Drop transient domains that are no longer running.
    fn reap(state: &mut SimState, name: &str) {
        if let Some(d) = state.domains.get(name)
            && !d.persistent
            && !d.state.is_active()
        {
            state.domains.remove(name);
        }
    }

    /// Register a persistent, shut-off domain (as left behind by an earlier `define`).
    pub fn define_persistent(&self, xml: &str) -> HvResult<()> {
        let (name, dom) = SimDomain::from_xml(xml, true, DomainState::ShutOff)?;
        self.lock()?.domains.insert(name, dom);
        Ok(())
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        if let Ok(mut s) = self.state.lock() {
            s.unreachable = unreachable;
        }
    }

    /// Fail the `skip + 1`-th call of `op` (the name recorded in `calls()`).
    pub fn fail_call(&self, op: &str, skip: usize) {
        self.arm(op, skip, false);
    }

    /// Lose the connection on the next call of `op`; every later call fails too.
    pub fn drop_connection_on(&self, op: &str) {
        self.arm(op, 0, true);
    }

    fn arm(&self, op: &str, skip: usize, connection: bool) {
        if let Ok(mut s) = self.state.lock() {
            s.faults.push(Fault {
                op: op.to_string(),
                skip,
                connection,
            });
        }
    }

    /// Make the guest ignore ACPI shutdown requests.
    pub fn set_ignores_shutdown(&self, name: &str, ignores: bool) -> HvResult<()> {
        self.with_domain("set_ignores_shutdown", name, |d| {
            d.ignores_shutdown = ignores;
            Ok(())
        })
    }

    pub fn set_state(&self, name: &str, state: DomainState) -> HvResult<()> {
        self.with_domain("set_state", name, |d| {
            d.state = state;
            Ok(())
        })
    }

    pub fn add_cpu_time(&self, name: &str, ns: u64) -> HvResult<()> {
        self.with_domain("add_cpu_time", name, |d| {
            d.cpu_time_ns += ns;
            Ok(())
        })
    }

    /// Overwrite the counters of one interface (matched by MAC).
    pub fn set_interface_counters(&self, name: &str, mac: &str, rx: u64, tx: u64) -> HvResult<()> {
        self.with_domain("set_interface_counters", name, |d| {
            let iface = d
                .interfaces
                .iter_mut()
                .find(|i| i.mac.eq_ignore_ascii_case(mac))
                .ok_or_else(|| HypervisorError::NotFound(format!("interface {}", mac)))?;
            iface.rx_bytes = rx;
            iface.tx_bytes = tx;
            Ok(())
        })
    }

    /// Overwrite the counters of one disk (matched by target dev).
    pub fn set_block_counters(&self, name: &str, target: &str, counters: BlockCounters) -> HvResult<()> {
        self.with_domain("set_block_counters", name, |d| {
            let block = d
                .blocks
                .iter_mut()
                .find(|b| b.target == target)
                .ok_or_else(|| HypervisorError::NotFound(format!("disk {}", target)))?;
            *block = BlockCounters {
                target: block.target.clone(),
                path: block.path.clone(),
                device: block.device.clone(),
                ..counters
            };
            Ok(())
        })
    }

    pub fn set_memory_counters(&self, name: &str, memory: MemoryCounters) -> HvResult<()> {
        self.with_domain("set_memory_counters", name, |d| {
            d.memory = memory;
            Ok(())
        })
    }

    pub fn add_snapshot(&self, name: &str, snapshot: &str, xml: &str, current: bool) -> HvResult<()> {
        self.with_domain("add_snapshot", name, |d| {
            d.snapshots.insert(snapshot.to_string(), xml.to_string());
            if current {
                d.current_snapshot = Some(snapshot.to_string());
            }
            Ok(())
        })
    }

    pub fn has_domain(&self, name: &str) -> bool {
        self.state
            .lock()
            .map(|s| s.domains.contains_key(name))
            .unwrap_or(false)
    }

    pub fn has_secret(&self, uuid: &str) -> bool {
        self.state
            .lock()
            .map(|s| s.secrets.contains_key(uuid))
            .unwrap_or(false)
    }

    /// Recorded mutating calls, e.g. "undefine i-2-10-VM".
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Hypervisor for MemoryHypervisor {
    async fn version(&self) -> HvResult<HypervisorVersion> {
        self.lock()?;
        Ok(self.version)
    }

    async fn list_domains(&self) -> HvResult<Vec<String>> {
        Ok(self.lock()?.domains.keys().cloned().collect())
    }

    async fn domain_info(&self, name: &str) -> HvResult<DomainInfo> {
        let state = self.lock()?;
        let d = state
            .domains
            .get(name)
            .ok_or_else(|| HypervisorError::NotFound(format!("Domain not found: {}", name)))?;
        Ok(DomainInfo {
            name: name.to_string(),
            uuid: d.uuid.clone(),
            state: d.state,
            persistent: d.persistent,
            cpu_time_ns: d.cpu_time_ns,
            vcpus: d.vcpus,
            max_memory_kib: d.memory_kib,
            memory_kib: d.memory.actual_kib,
        })
    }

    async fn domain_xml(&self, name: &str) -> HvResult<String> {
        let state = self.lock()?;
        state
            .domains
            .get(name)
            .map(|d| d.xml.clone())
            .ok_or_else(|| HypervisorError::NotFound(format!("Domain not found: {}", name)))
    }

    async fn create_transient(&self, xml: &str) -> HvResult<()> {
        let (name, dom) = SimDomain::from_xml(xml, false, DomainState::Running)?;
        let mut state = self.lock()?;
        state.calls.push(format!("create {}", name));
        if let Some(existing) = state.domains.get(&name)
            && existing.state.is_active()
        {
            return Err(HypervisorError::failed(
                "create",
                format!("domain '{}' is already active", name),
            ));
        }
        state.domains.insert(name, dom);
        Ok(())
    }

    async fn undefine(&self, name: &str) -> HvResult<()> {
        let mut state = self.lock()?;
        state.calls.push(format!("undefine {}", name));
        let d = state
            .domains
            .get_mut(name)
            .ok_or_else(|| HypervisorError::NotFound(format!("Domain not found: {}", name)))?;
        if !d.persistent {
            return Err(HypervisorError::failed(
                "undefine",
                "cannot undefine transient domain",
            ));
        }
        d.persistent = false;
        Self::reap(&mut state, name);
        Ok(())
    }

    async fn shutdown(&self, name: &str) -> HvResult<()> {
        let mut state = self.lock()?;
        state.calls.push(format!("shutdown {}", name));
        state.trip("shutdown")?;
        let d = state
            .domains
            .get_mut(name)
            .ok_or_else(|| HypervisorError::NotFound(format!("Domain not found: {}", name)))?;
        if !d.state.is_active() {
            return Err(HypervisorError::failed("shutdown", "domain is not running"));
        }
        if !d.ignores_shutdown {
            d.state = DomainState::ShutOff;
        }
        Self::reap(&mut state, name);
        Ok(())
    }

    async fn destroy(&self, name: &str) -> HvResult<()> {
        let mut state = self.lock()?;
        state.calls.push(format!("destroy {}", name));
        state.trip("destroy")?;
        let d = state
            .domains
            .get_mut(name)
            .ok_or_else(|| HypervisorError::NotFound(format!("Domain not found: {}", name)))?;
        if !d.state.is_active() {
            return Err(HypervisorError::failed("destroy", "domain is not running"));
        }
        d.state = DomainState::ShutOff;
        Self::reap(&mut state, name);
        Ok(())
    }

    async fn reboot(&self, name: &str) -> HvResult<()> {
        self.with_domain("reboot", name, |d| {
            if !d.state.is_active() {
                return Err(HypervisorError::failed("reboot", "domain is not running"));
            }
            d.state = DomainState::Running;
            Ok(())
        })
    }

    async fn migrate(&self, name: &str, destination_uri: &str) -> HvResult<()> {
        let mut state = self.lock()?;
        state.calls.push(format!("migrate {} {}", name, destination_uri));
        let d = state
            .domains
            .get(name)
            .ok_or_else(|| HypervisorError::NotFound(format!("Domain not found: {}", name)))?;
        if !d.state.is_active() {
            return Err(HypervisorError::failed("migrate", "domain is not running"));
        }
        state.domains.remove(name);
        Ok(())
    }

    async fn attach_device(&self, name: &str, xml: &str) -> HvResult<()> {
        self.with_domain("attach_device", name, |d| {
            let Some(pos) = d.xml.rfind("</devices>") else {
                return Err(HypervisorError::failed("attach-device", "no <devices> section"));
            };
            d.xml.insert_str(pos, xml);
            d.refresh_devices();
            Ok(())
        })
    }

    async fn detach_device(&self, name: &str, xml: &str) -> HvResult<()> {
        self.with_domain("detach_device", name, |d| {
            if !d.xml.contains(xml) {
                return Err(HypervisorError::failed(
                    "detach-device",
                    "device not found in domain",
                ));
            }
            d.xml = d.xml.replacen(xml, "", 1);
            d.refresh_devices();
            Ok(())
        })
    }

    async fn update_device(&self, name: &str, xml: &str) -> HvResult<()> {
        self.with_domain("update_device", name, |d| {
            let target = domxml::tag_attr(xml, "target", "dev").unwrap_or_default();
            let existing = domxml::parse_disks(&d.xml)
                .into_iter()
                .find(|disk| disk.target_dev == target)
                .ok_or_else(|| {
                    HypervisorError::failed("update-device", format!("no disk with target {}", target))
                })?;
            d.xml = d.xml.replacen(&existing.raw, xml, 1);
            d.refresh_devices();
            Ok(())
        })
    }

    async fn interface_counters(&self, name: &str) -> HvResult<Vec<InterfaceCounters>> {
        self.with_domain("interface_counters", name, |d| Ok(d.interfaces.clone()))
    }

    async fn block_counters(&self, name: &str) -> HvResult<Vec<BlockCounters>> {
        self.with_domain("block_counters", name, |d| Ok(d.blocks.clone()))
    }

    async fn memory_counters(&self, name: &str) -> HvResult<MemoryCounters> {
        self.with_domain("memory_counters", name, |d| Ok(d.memory))
    }

    async fn snapshot_names(&self, name: &str) -> HvResult<Vec<String>> {
        self.with_domain("snapshot_names", name, |d| {
            Ok(d.snapshots.keys().cloned().collect())
        })
    }

    async fn current_snapshot(&self, name: &str) -> HvResult<Option<String>> {
        self.with_domain("current_snapshot", name, |d| Ok(d.current_snapshot.clone()))
    }

    async fn snapshot_xml(&self, name: &str, snapshot: &str) -> HvResult<String> {
        self.with_domain("snapshot_xml", name, |d| {
            d.snapshots
                .get(snapshot)
                .cloned()
                .ok_or_else(|| HypervisorError::NotFound(format!("snapshot not found: {}", snapshot)))
        })
    }

    async fn delete_snapshot_metadata(&self, name: &str, snapshot: &str) -> HvResult<()> {
        self.with_domain("delete_snapshot_metadata", name, |d| {
            d.snapshots
                .remove(snapshot)
                .ok_or_else(|| HypervisorError::NotFound(format!("snapshot not found: {}", snapshot)))?;
            if d.current_snapshot.as_deref() == Some(snapshot) {
                d.current_snapshot = None;
            }
            Ok(())
        })
    }

    async fn redefine_snapshot(&self, name: &str, xml: &str, current: bool) -> HvResult<()> {
        self.with_domain("redefine_snapshot", name, |d| {
            let snap = domxml::text_of(xml, "name")
                .ok_or_else(|| HypervisorError::failed("snapshot-create", "snapshot XML has no <name>"))?;
            d.snapshots.insert(snap.clone(), xml.to_string());
            if current {
                d.current_snapshot = Some(snap);
            }
            Ok(())
        })
    }

    async fn create_or_get_secret(&self, secret: &SecretSpec) -> HvResult<SecretOutcome> {
        let mut state = self.lock()?;
        state.calls.push(format!("secret {}", secret.uuid));
        state.trip("secret")?;
        if state.secrets.contains_key(&secret.uuid) {
            return Ok(SecretOutcome::Reused);
        }
        state.secrets.insert(secret.uuid.clone(), secret.clone());
        Ok(SecretOutcome::Created)
    }

    async fn remove_secret(&self, uuid: &str) -> HvResult<()> {
        let mut state = self.lock()?;
        state.calls.push(format!("remove_secret {}", uuid));
        state
            .secrets
            .remove(uuid)
            .map(|_| ())
            .ok_or_else(|| HypervisorError::NotFound(format!("Secret not found: {}", uuid)))
    }
}
