// Open vSwitch bridge and tunnel plumbing via ovs-vsctl and ovstunnel.py

use crate::error::AgentError;
use crate::script::{ScriptRunner, args, run_expect_silent};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

const OVS_VSCTL: &str = "ovs-vsctl";

pub struct OvsTunnels {
    runner: Arc<dyn ScriptRunner>,
    tunnel_script: PathBuf,
    timeout: Duration,
    // ovs-vsctl transactions on the same bridge are not atomic across calls.
    lock: tokio::sync::Mutex<()>,
}

/// Host ids already set up on a bridge, from its `other_config:ovs-host-setup` value.
pub fn configured_hosts(value: &str) -> Vec<String> {
    value
        .trim()
        .trim_matches('"')
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl OvsTunnels {
    pub fn new(runner: Arc<dyn ScriptRunner>, tunnel_script: PathBuf, timeout: Duration) -> Self {
        Self {
            runner,
            tunnel_script,
            timeout,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn bridge_exists(&self, bridge: &str) -> bool {
        match self
            .runner
            .run(OVS_VSCTL, &args(&["br-exists", bridge]), self.timeout)
            .await
        {
            Ok(out) => out.success(),
            Err(e) => {
                debug!(error = %e, bridge, "ovs-vsctl br-exists failed");
                false
            }
        }
    }

    async fn ensure_bridge_locked(&self, bridge: &str) -> Result<(), AgentError> {
        if self.bridge_exists(bridge).await {
            return Ok(());
        }
        run_expect_silent(
            self.runner.as_ref(),
            OVS_VSCTL,
            &args(&[
                "--",
                "--may-exist",
                "add-br",
                bridge,
                "--",
                "set",
                "bridge",
                bridge,
                "other_config:ovs-host-setup='-1'",
            ]),
            self.timeout,
        )
        .await?;
        info!(bridge, "created tunnel bridge");
        Ok(())
    }

    /// Create the tunnel bridge unless it already exists.
    #[instrument(skip(self), fields(component = "network", operation = "ensure_bridge"))]
    pub async fn ensure_bridge(&self, bridge: &str) -> Result<(), AgentError> {
        let _guard = self.lock.lock().await;
        self.ensure_bridge_locked(bridge).await
    }

    /// Run the tunnel setup script for this host unless its id is already recorded on the bridge.
    #[instrument(skip(self), fields(component = "network", operation = "configure_tunnel"))]
    pub async fn configure_tunnel(
        &self,
        bridge: &str,
        key: &str,
        host_id: &str,
    ) -> Result<bool, AgentError> {
        let _guard = self.lock.lock().await;
        self.ensure_bridge_locked(bridge).await?;
        let out = self
            .runner
            .run(
                OVS_VSCTL,
                &args(&["get", "bridge", bridge, "other_config:ovs-host-setup"]),
                self.timeout,
            )
            .await?;
        if out.success() && configured_hosts(&out.stdout).iter().any(|h| h == host_id) {
            debug!(bridge, host_id, "tunnel already configured for host");
            return Ok(false);
        }
        let script = self.tunnel_script.to_string_lossy().into_owned();
        run_expect_silent(
            self.runner.as_ref(),
            &script,
            &args(&[
                "setup_ovs_bridge",
                "--key",
                key,
                "--cs_host_id",
                host_id,
                "--bridge",
                bridge,
            ]),
            self.timeout,
        )
        .await?;
        info!(bridge, key, host_id, "configured tunnel bridge");
        Ok(true)
    }

    #[instrument(skip(self), fields(component = "network", operation = "destroy_tunnel"))]
    pub async fn destroy_tunnel(&self, bridge: &str) -> Result<(), AgentError> {
        let _guard = self.lock.lock().await;
        self.ensure_bridge_locked(bridge).await?;
        let script = self.tunnel_script.to_string_lossy().into_owned();
        run_expect_silent(
            self.runner.as_ref(),
            &script,
            &args(&["destroy_ovs_bridge", "--bridge", bridge]),
            self.timeout,
        )
        .await
    }
}
