// Network resolver: NicSpec -> ResolvedNic through a static VIF driver registry

pub mod bridge;
mod ovs;

pub use ovs::{OvsTunnels, configured_hosts};

use crate::compiler::nic_model;
use crate::config::{NetworkConfig, ScriptPaths};
use crate::error::AgentError;
use crate::hypervisor::domxml::DomainInterface;
use crate::models::{NicSpec, ResolvedNic, TrafficType, VifDriverKind, VmSpec, detail};
use crate::script::{ScriptRunner, args, run_expect_silent};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Parsed NIC broadcast domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastUri {
    Vlan(u32),
    Vxlan(u32),
    /// Overlay network key.
    Vswitch(String),
    Untagged,
}

impl BroadcastUri {
    pub fn parse(uri: Option<&str>) -> Result<Self, AgentError> {
        let Some(uri) = uri.map(str::trim).filter(|u| !u.is_empty()) else {
            return Ok(BroadcastUri::Untagged);
        };
        if uri.eq_ignore_ascii_case("untagged") {
            return Ok(BroadcastUri::Untagged);
        }
        let (scheme, value) = uri
            .split_once("://")
            .ok_or_else(|| AgentError::configuration(format!("bad broadcast uri {}", uri)))?;
        let number = |v: &str| {
            v.parse::<u32>()
                .map_err(|_| AgentError::configuration(format!("bad broadcast uri {}", uri)))
        };
        match scheme.to_ascii_lowercase().as_str() {
            "vlan" if value.eq_ignore_ascii_case("untagged") => Ok(BroadcastUri::Untagged),
            "vlan" => Ok(BroadcastUri::Vlan(number(value)?)),
            "vxlan" => Ok(BroadcastUri::Vxlan(number(value)?)),
            "vswitch" if !value.is_empty() => Ok(BroadcastUri::Vswitch(value.to_string())),
            _ => Err(AgentError::configuration(format!(
                "unsupported broadcast uri {}",
                uri
            ))),
        }
    }

    pub fn vlan(&self) -> Option<u32> {
        match self {
            BroadcastUri::Vlan(v) => Some(*v),
            _ => None,
        }
    }
}

/// Per-VM NIC knobs: model and virtqueue settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicOptions {
    pub model: String,
    pub queues: Option<u32>,
    pub packed: bool,
}

impl NicOptions {
    pub fn for_vm(spec: &VmSpec) -> Self {
        Self::from_details(nic_model(spec), &spec.details, spec.vcpus)
    }

    /// `nicMultiqueueNumber` of -1 means one queue per vCPU.
    pub fn from_details(model: &str, details: &BTreeMap<String, String>, vcpus: u32) -> Self {
        let queues = match details
            .get(detail::NIC_MULTIQUEUE_NUMBER)
            .and_then(|v| v.trim().parse::<i64>().ok())
        {
            Some(-1) => Some(vcpus.max(1)),
            Some(n) if n > 0 => u32::try_from(n).ok(),
            _ => None,
        };
        let packed = details
            .get(detail::NIC_PACKED_VIRTQUEUES_ENABLED)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        Self {
            model: model.to_string(),
            queues,
            packed,
        }
    }
}

/// Driver per traffic type, fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeRegistry {
    default: VifDriverKind,
    overrides: HashMap<TrafficType, VifDriverKind>,
}

impl BridgeRegistry {
    pub fn new(default: VifDriverKind, overrides: HashMap<TrafficType, VifDriverKind>) -> Self {
        Self { default, overrides }
    }

    pub fn from_config(cfg: &NetworkConfig) -> Self {
        let overrides = cfg
            .vif_drivers
            .iter()
            .filter_map(|(t, d)| Some((TrafficType::parse(t)?, VifDriverKind::parse(d)?)))
            .collect();
        Self::new(cfg.default_driver(), overrides)
    }

    pub fn for_traffic(&self, traffic: TrafficType) -> VifDriverKind {
        self.overrides.get(&traffic).copied().unwrap_or(self.default)
    }

    pub fn uses(&self, kind: VifDriverKind) -> bool {
        self.default == kind || self.overrides.values().any(|k| *k == kind)
    }
}

pub struct NetworkResolver {
    registry: BridgeRegistry,
    public_bridge: String,
    private_bridge: String,
    guest_bridge: Option<String>,
    sysfs_net_dir: PathBuf,
    modify_vlan: PathBuf,
    runner: Arc<dyn ScriptRunner>,
    timeout: Duration,
    ovs: OvsTunnels,
    vlan_lock: tokio::sync::Mutex<()>,
}

impl NetworkResolver {
    pub fn new(
        cfg: &NetworkConfig,
        scripts: &ScriptPaths,
        runner: Arc<dyn ScriptRunner>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry: BridgeRegistry::from_config(cfg),
            public_bridge: cfg.public_bridge.clone(),
            private_bridge: cfg.private_bridge.clone(),
            guest_bridge: cfg.guest_bridge.clone(),
            sysfs_net_dir: PathBuf::from(&cfg.sysfs_net_dir),
            modify_vlan: scripts.modify_vlan.clone(),
            ovs: OvsTunnels::new(runner.clone(), scripts.ovs_tunnel.clone(), timeout),
            runner,
            timeout,
            vlan_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &BridgeRegistry {
        &self.registry
    }

    pub fn ovs(&self) -> &OvsTunnels {
        &self.ovs
    }

    fn bridge_for(&self, nic: &NicSpec) -> String {
        if let Some(b) = nic.bridge.as_deref().filter(|b| !b.is_empty()) {
            return b.to_string();
        }
        match nic.traffic_type {
            TrafficType::Public => self.public_bridge.clone(),
            TrafficType::Guest => self
                .guest_bridge
                .clone()
                .unwrap_or_else(|| self.private_bridge.clone()),
            _ => self.private_bridge.clone(),
        }
    }

    /// Existing bridge owner first, then the traffic-type override, then the default.
    pub async fn select_driver(
        &self,
        traffic: TrafficType,
        bridge_name: &str,
        broadcast: &BroadcastUri,
    ) -> VifDriverKind {
        if matches!(broadcast, BroadcastUri::Vswitch(_)) {
            return VifDriverKind::Overlay;
        }
        if bridge::bridge_exists(&self.sysfs_net_dir, bridge_name).await {
            return VifDriverKind::Bridge;
        }
        if (self.registry.uses(VifDriverKind::OpenVSwitch)
            || self.registry.uses(VifDriverKind::Overlay))
            && self.ovs.bridge_exists(bridge_name).await
        {
            return VifDriverKind::OpenVSwitch;
        }
        self.registry.for_traffic(traffic)
    }

    pub async fn resolve_all(&self, spec: &VmSpec) -> Result<Vec<ResolvedNic>, AgentError> {
        let opts = NicOptions::for_vm(spec);
        let mut nics: Vec<&NicSpec> = spec.nics.iter().collect();
        nics.sort_by_key(|n| n.device_id);
        let mut out = Vec::with_capacity(nics.len());
        for nic in nics {
            out.push(self.resolve(nic, &opts).await?);
        }
        Ok(out)
    }

    #[instrument(skip(self, nic, opts), fields(component = "network", mac = %nic.mac))]
    pub async fn resolve(
        &self,
        nic: &NicSpec,
        opts: &NicOptions,
    ) -> Result<ResolvedNic, AgentError> {
        let broadcast = BroadcastUri::parse(nic.broadcast_uri.as_deref())?;
        let base = self.bridge_for(nic);
        let driver = self
            .select_driver(nic.traffic_type, &base, &broadcast)
            .await;
        let (bridge, vlan) = match driver {
            VifDriverKind::Overlay => {
                let key = match &broadcast {
                    BroadcastUri::Vswitch(k) => k.clone(),
                    BroadcastUri::Vlan(n) | BroadcastUri::Vxlan(n) => n.to_string(),
                    BroadcastUri::Untagged => {
                        return Err(AgentError::configuration(format!(
                            "overlay NIC {} has no network key",
                            nic.mac
                        )));
                    }
                };
                let name = format!("OVSTunnel{}", key);
                self.ovs.ensure_bridge(&name).await?;
                (name, None)
            }
            VifDriverKind::OpenVSwitch => (base, broadcast.vlan()),
            VifDriverKind::Bridge => {
                self.linux_bridge(&base, &broadcast, nic.traffic_type)
                    .await?
            }
        };
        debug!(bridge = %bridge, ?driver, ?vlan, "resolved nic");
        Ok(ResolvedNic {
            mac: nic.mac.clone(),
            traffic_type: nic.traffic_type,
            driver,
            bridge,
            vlan,
            model: opts.model.clone(),
            queues: opts.queues,
            packed: opts.packed,
            rate_mbps: nic.network_rate_mbps.filter(|r| *r > 0),
            device_id: nic.device_id,
        })
    }

    async fn linux_bridge(
        &self,
        base: &str,
        broadcast: &BroadcastUri,
        traffic: TrafficType,
    ) -> Result<(String, Option<u32>), AgentError> {
        match broadcast {
            BroadcastUri::Vlan(v) if matches!(traffic, TrafficType::Guest | TrafficType::Public) => {
                let _guard = self.vlan_lock.lock().await;
                let pif = bridge::match_pif(&self.sysfs_net_dir, base)
                    .await
                    .unwrap_or_else(|| base.to_string());
                let name = bridge::vlan_bridge_name(&pif, *v);
                if !bridge::bridge_exists(&self.sysfs_net_dir, &name).await {
                    let script = self.modify_vlan.to_string_lossy().into_owned();
                    let vlan = v.to_string();
                    run_expect_silent(
                        self.runner.as_ref(),
                        &script,
                        &args(&["-v", &vlan, "-p", &pif, "-b", &name, "-o", "add"]),
                        self.timeout,
                    )
                    .await?;
                    info!(bridge = %name, pif = %pif, vlan = v, "created vlan bridge");
                }
                Ok((name, Some(*v)))
            }
            BroadcastUri::Vxlan(n) => {
                let name = format!("brvx-{}", n);
                if !bridge::bridge_exists(&self.sysfs_net_dir, &name).await {
                    return Err(AgentError::operation(format!(
                        "vxlan bridge {} is not present on this host",
                        name
                    )));
                }
                Ok((name, Some(*n)))
            }
            _ => Ok((base.to_string(), None)),
        }
    }

    /// Broadcast URI implied by an existing bridge's physical interface.
    pub async fn broadcast_uri_for_bridge(&self, bridge_name: &str) -> Option<String> {
        let pif = bridge::match_pif(&self.sysfs_net_dir, bridge_name).await?;
        bridge::broadcast_uri_from_pif(bridge_name, &pif)
    }

    fn is_configured_bridge(&self, name: &str) -> bool {
        name == self.public_bridge
            || name == self.private_bridge
            || self.guest_bridge.as_deref() == Some(name)
    }

    /// Tear down a VLAN bridge once the last guest port has left it.
    #[instrument(skip(self, iface), fields(component = "network", operation = "unplug", mac = %iface.mac))]
    pub async fn unplug(&self, iface: &DomainInterface) -> Result<(), AgentError> {
        let Some(name) = iface.bridge.as_deref() else {
            return Ok(());
        };
        if self.is_configured_bridge(name) || bridge::vlan_id_from_bridge(name).is_none() {
            return Ok(());
        }
        let _guard = self.vlan_lock.lock().await;
        let Some(pif) = bridge::match_pif(&self.sysfs_net_dir, name).await else {
            return Ok(());
        };
        let Some(uri) = bridge::broadcast_uri_from_pif(name, &pif) else {
            return Ok(());
        };
        let Some(vlan) = uri.strip_prefix("vlan://") else {
            return Ok(());
        };
        if bridge::has_guest_ports(&self.sysfs_net_dir, name).await {
            debug!(bridge = name, "bridge still in use");
            return Ok(());
        }
        let parent = pif.split('.').next().unwrap_or(&pif);
        let script = self.modify_vlan.to_string_lossy().into_owned();
        run_expect_silent(
            self.runner.as_ref(),
            &script,
            &args(&["-v", vlan, "-p", parent, "-b", name, "-o", "delete"]),
            self.timeout,
        )
        .await?;
        info!(bridge = name, vlan, "removed vlan bridge");
        Ok(())
    }

    /// Link-local bridge for system VM control traffic.
    pub async fn create_control_network(&self, name: &str) -> Result<(), AgentError> {
        if bridge::bridge_exists(&self.sysfs_net_dir, name).await {
            return Ok(());
        }
        run_expect_silent(
            self.runner.as_ref(),
            "ip",
            &args(&["link", "add", "name", name, "type", "bridge"]),
            self.timeout,
        )
        .await?;
        run_expect_silent(
            self.runner.as_ref(),
            "ip",
            &args(&["link", "set", name, "up"]),
            self.timeout,
        )
        .await?;
        info!(bridge = name, "created control network");
        Ok(())
    }

    pub async fn configure_tunnel(
        &self,
        bridge_name: &str,
        key: &str,
        host_id: &str,
    ) -> Result<bool, AgentError> {
        self.ovs.configure_tunnel(bridge_name, key, host_id).await
    }

    pub async fn destroy_tunnel(&self, bridge_name: &str) -> Result<(), AgentError> {
        self.ovs.destroy_tunnel(bridge_name).await
    }
}
