// Component wiring shared by the binary and the integration tests

use crate::capability::CapabilityProbe;
use crate::compiler::CompilerConfig;
use crate::config::{AgentConfig, HypervisorBackend, ScriptPaths};
use crate::dispatcher::Dispatcher;
use crate::error::AgentError;
use crate::hypervisor::{Hypervisor, MemoryHypervisor, VirshHypervisor};
use crate::lifecycle::{LifecycleController, StopPolicy};
use crate::models::{HostCapabilities, HostStatusReport};
use crate::network::NetworkResolver;
use crate::reporter::{HealthChecker, Reporter};
use crate::routes::AppState;
use crate::script::ScriptRunner;
use crate::storage::{LocalPoolManager, StorageResolver};
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;
use tokio::sync::broadcast;

pub fn hypervisor_for(cfg: &AgentConfig, runner: Arc<dyn ScriptRunner>) -> Arc<dyn Hypervisor> {
    match cfg.hypervisor.backend {
        HypervisorBackend::Virsh => Arc::new(VirshHypervisor::new(
            &cfg.hypervisor.uri,
            runner,
            Duration::from_secs(cfg.hypervisor.call_timeout_secs),
        )),
        HypervisorBackend::Memory => Arc::new(MemoryHypervisor::new()),
    }
}

pub struct Agent {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub capabilities: Arc<HostCapabilities>,
    pub probe: Arc<CapabilityProbe>,
    pub network: Arc<NetworkResolver>,
    pub lifecycle: Arc<LifecycleController>,
    pub reporter: Arc<Reporter>,
    pub dispatcher: Arc<Dispatcher>,
}

impl Agent {
    /// Probe the host once and build every component on top of the result.
    pub async fn assemble(
        cfg: &AgentConfig,
        scripts: &ScriptPaths,
        hypervisor: Arc<dyn Hypervisor>,
        runner: Arc<dyn ScriptRunner>,
    ) -> Result<Self, AgentError> {
        let script_timeout = Duration::from_secs(cfg.scripts.timeout_secs);

        let probe = Arc::new(CapabilityProbe::from_config(
            cfg,
            scripts,
            hypervisor.clone(),
            runner.clone(),
        ));
        let capabilities = probe.probe().await?;

        let pools = LocalPoolManager::new(&cfg.storage.nfs_mount_root, runner.clone());
        for pool in cfg.local_pools() {
            pools.add_local_pool(&pool.uuid, &pool.path);
        }
        let storage = Arc::new(StorageResolver::new(
            hypervisor.clone(),
            Arc::new(pools),
            capabilities.disk_activity.clone(),
            cfg.hypervisor.systemvm_iso_path.clone(),
        ));
        let network = Arc::new(NetworkResolver::new(
            &cfg.network,
            scripts,
            runner.clone(),
            script_timeout,
        ));

        let lifecycle = Arc::new(LifecycleController::new(
            hypervisor.clone(),
            storage,
            network.clone(),
            capabilities.clone(),
            CompilerConfig::from(cfg),
            StopPolicy::from_config(&cfg.hypervisor),
        ));
        let health = HealthChecker::new(scripts.health_check.clone(), runner, script_timeout);
        let reporter = Arc::new(Reporter::new(
            hypervisor.clone(),
            health,
            cfg.agent.host_id.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::with_defaults(
            Duration::from_secs(cfg.agent.command_timeout_secs),
            lifecycle.clone(),
            reporter.clone(),
            probe.clone(),
        ));

        Ok(Self {
            hypervisor,
            capabilities: Arc::new(capabilities),
            probe,
            network,
            lifecycle,
            reporter,
            dispatcher,
        })
    }

    pub fn app_state(
        &self,
        status_tx: broadcast::Sender<HostStatusReport>,
        ws_status_connections: Arc<AtomicUsize>,
    ) -> AppState {
        AppState {
            dispatcher: self.dispatcher.clone(),
            reporter: self.reporter.clone(),
            probe: self.probe.clone(),
            capabilities: self.capabilities.clone(),
            status_tx,
            ws_status_connections,
        }
    }
}
