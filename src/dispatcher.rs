// Command routing: kind -> handler registry with a command-level timeout

use crate::capability::CapabilityProbe;
use crate::error::AgentError;
use crate::lifecycle::LifecycleController;
use crate::models::{Answer, AnswerPayload, Command, CommandKind};
use crate::network::NetworkResolver;
use crate::reporter::Reporter;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: Command) -> Result<Answer, AgentError>;
}

pub const LIFECYCLE_COMMANDS: &[CommandKind] = &[
    CommandKind::Start,
    CommandKind::Stop,
    CommandKind::Reboot,
    CommandKind::PrepareForMigration,
    CommandKind::Migrate,
    CommandKind::AttachVolume,
    CommandKind::DetachVolume,
    CommandKind::AttachIso,
    CommandKind::PlugNic,
    CommandKind::UnplugNic,
];

pub const REPORTING_COMMANDS: &[CommandKind] = &[
    CommandKind::GetVmStats,
    CommandKind::GetVmDiskStats,
    CommandKind::GetVmState,
    CommandKind::Ping,
    CommandKind::CheckHealth,
];

pub const NETWORK_COMMANDS: &[CommandKind] = &[CommandKind::SetupTunnel, CommandKind::CleanupNetwork];

pub struct Dispatcher {
    handlers: HashMap<CommandKind, Arc<dyn CommandHandler>>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            handlers: HashMap::new(),
            timeout,
        }
    }

    /// Every command this agent understands, wired to its handler.
    pub fn with_defaults(
        timeout: Duration,
        lifecycle: Arc<LifecycleController>,
        reporter: Arc<Reporter>,
        probe: Arc<CapabilityProbe>,
    ) -> Self {
        let mut d = Self::new(timeout);
        let network = lifecycle.network().clone();
        d.register(LIFECYCLE_COMMANDS, Arc::new(LifecycleHandler::new(lifecycle)));
        d.register(
            &[CommandKind::HostStartup],
            Arc::new(StartupHandler::new(probe, reporter.clone())),
        );
        d.register(
            NETWORK_COMMANDS,
            Arc::new(NetworkHandler::new(network, reporter.host_id())),
        );
        d.register(REPORTING_COMMANDS, Arc::new(ReportingHandler::new(reporter)));
        d
    }

    /// Route `kinds` to `handler`, replacing any earlier registration.
    pub fn register(&mut self, kinds: &[CommandKind], handler: Arc<dyn CommandHandler>) {
        for kind in kinds {
            self.handlers.insert(*kind, handler.clone());
        }
    }

    pub fn supports(&self, kind: CommandKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Handler errors become failed answers. Only loss of the hypervisor
    /// connection propagates, so the caller can stop accepting work.
    #[instrument(skip(self, command), fields(component = "dispatcher", kind = ?command.kind()))]
    pub async fn dispatch(&self, command: Command) -> Result<Answer, AgentError> {
        let kind = command.kind();
        let Some(handler) = self.handlers.get(&kind).cloned() else {
            debug!(?kind, "unsupported command");
            return Ok(Answer::Unsupported { command: kind });
        };
        match tokio::time::timeout(self.timeout, handler.handle(command)).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(e)) if e.is_connectivity() => {
                warn!(error = %e, operation = "dispatch", ?kind, "hypervisor connection lost");
                Err(e)
            }
            Ok(Err(e)) => {
                warn!(error = %e, operation = "dispatch", ?kind, "command failed");
                Ok(Answer::failed(&e))
            }
            Err(_) => {
                let e = AgentError::Timeout(format!(
                    "{:?} did not complete within {}s",
                    kind,
                    self.timeout.as_secs()
                ));
                warn!(error = %e, operation = "dispatch", ?kind, "command timed out");
                Ok(Answer::failed(&e))
            }
        }
    }
}

pub struct LifecycleHandler {
    controller: Arc<LifecycleController>,
}

impl LifecycleHandler {
    pub fn new(controller: Arc<LifecycleController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl CommandHandler for LifecycleHandler {
    async fn handle(&self, command: Command) -> Result<Answer, AgentError> {
        let c = &self.controller;
        let answer = match command {
            Command::Start { vm } => {
                c.start(&vm).await?;
                Answer::ok(AnswerPayload::Started { vm_name: vm.name })
            }
            Command::Stop { vm_name, force } => {
                let outcome = c.stop(&vm_name, force).await?;
                c.forget_stopped(&vm_name);
                Answer::ok(AnswerPayload::Stopped {
                    vm_name,
                    already_stopped: outcome.already_stopped,
                    forced: outcome.forced,
                })
            }
            Command::Reboot { vm_name } => {
                c.reboot(&vm_name).await?;
                Answer::empty()
            }
            Command::PrepareForMigration { vm } => {
                let domain_xml = c.prepare_migration(&vm).await?;
                Answer::ok(AnswerPayload::MigrationPrepared { domain_xml })
            }
            Command::Migrate {
                vm_name,
                destination_uri,
            } => {
                c.migrate(&vm_name, &destination_uri).await?;
                info!(vm = %vm_name, destination = %destination_uri, "migration complete");
                Answer::empty()
            }
            Command::AttachVolume { vm_name, disk } => {
                c.attach_volume(&vm_name, &disk).await?;
                Answer::empty()
            }
            Command::DetachVolume { vm_name, disk } => {
                c.detach_volume(&vm_name, &disk).await?;
                Answer::empty()
            }
            Command::AttachIso {
                vm_name,
                iso_path,
                attach,
            } => {
                c.attach_iso(&vm_name, &iso_path, attach).await?;
                Answer::empty()
            }
            Command::PlugNic {
                vm_name,
                nic,
                vcpus,
                details,
            } => {
                let changed = c.plug_nic(&vm_name, &nic, vcpus, &details).await?;
                Answer::ok(AnswerPayload::Changed { changed })
            }
            Command::UnplugNic { vm_name, mac } => {
                let changed = c.unplug_nic(&vm_name, &mac).await?;
                Answer::ok(AnswerPayload::Changed { changed })
            }
            other => Answer::Unsupported {
                command: other.kind(),
            },
        };
        Ok(answer)
    }
}

pub struct ReportingHandler {
    reporter: Arc<Reporter>,
}

impl ReportingHandler {
    pub fn new(reporter: Arc<Reporter>) -> Self {
        Self { reporter }
    }
}

#[async_trait]
impl CommandHandler for ReportingHandler {
    async fn handle(&self, command: Command) -> Result<Answer, AgentError> {
        let r = &self.reporter;
        let answer = match command {
            Command::GetVmStats { vm_names } => Answer::ok(AnswerPayload::VmStats {
                stats: r.vm_stats_for(&vm_names).await?,
            }),
            Command::GetVmDiskStats { vm_names } => Answer::ok(AnswerPayload::DiskStats {
                stats: r.disk_stats_for(&vm_names).await?,
            }),
            Command::GetVmState { vm_name } => Answer::ok(AnswerPayload::State {
                state: r.power_state(&vm_name).await,
            }),
            Command::Ping => {
                let report = r.status_report().await?;
                Answer::ok(AnswerPayload::Ping {
                    host_id: report.host_id,
                    vm_states: report.vm_states,
                    health: report.health,
                })
            }
            Command::CheckHealth => Answer::ok(AnswerPayload::Health {
                result: r.check_health().await,
            }),
            other => Answer::Unsupported {
                command: other.kind(),
            },
        };
        Ok(answer)
    }
}

pub struct StartupHandler {
    probe: Arc<CapabilityProbe>,
    reporter: Arc<Reporter>,
}

impl StartupHandler {
    pub fn new(probe: Arc<CapabilityProbe>, reporter: Arc<Reporter>) -> Self {
        Self { probe, reporter }
    }
}

#[async_trait]
impl CommandHandler for StartupHandler {
    async fn handle(&self, command: Command) -> Result<Answer, AgentError> {
        if command.kind() != CommandKind::HostStartup {
            return Ok(Answer::Unsupported {
                command: command.kind(),
            });
        }
        let caps = self.probe.probe().await?;
        let health = self.reporter.check_health().await;
        let (host, pools) = self.probe.startup_info(&caps, health).await?;
        Ok(Answer::ok(AnswerPayload::Startup {
            host: Box::new(host),
            pools,
        }))
    }
}

pub struct NetworkHandler {
    network: Arc<NetworkResolver>,
    host_id: String,
}

impl NetworkHandler {
    pub fn new(network: Arc<NetworkResolver>, host_id: impl Into<String>) -> Self {
        Self {
            network,
            host_id: host_id.into(),
        }
    }
}

#[async_trait]
impl CommandHandler for NetworkHandler {
    async fn handle(&self, command: Command) -> Result<Answer, AgentError> {
        let answer = match command {
            Command::SetupTunnel { bridge, key } => {
                let changed = self
                    .network
                    .configure_tunnel(&bridge, &key, &self.host_id)
                    .await?;
                Answer::ok(AnswerPayload::Changed { changed })
            }
            Command::CleanupNetwork { bridge } => {
                self.network.destroy_tunnel(&bridge).await?;
                Answer::empty()
            }
            other => Answer::Unsupported {
                command: other.kind(),
            },
        };
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FailureKind;

    struct Scripted(Result<(), fn() -> AgentError>, Duration);

    #[async_trait]
    impl CommandHandler for Scripted {
        async fn handle(&self, _command: Command) -> Result<Answer, AgentError> {
            tokio::time::sleep(self.1).await;
            match &self.0 {
                Ok(()) => Ok(Answer::empty()),
                Err(make) => Err(make()),
            }
        }
    }

    fn dispatcher(handler: Scripted) -> Dispatcher {
        let mut d = Dispatcher::new(Duration::from_secs(5));
        d.register(&[CommandKind::Ping], Arc::new(handler));
        d
    }

    #[tokio::test]
    async fn unregistered_kind_is_unsupported() {
        let d = dispatcher(Scripted(Ok(()), Duration::ZERO));
        let answer = d.dispatch(Command::CheckHealth).await.unwrap();
        assert_eq!(
            answer,
            Answer::Unsupported {
                command: CommandKind::CheckHealth
            }
        );
        assert!(!d.supports(CommandKind::Unknown));
    }

    #[tokio::test]
    async fn operation_error_becomes_failed_answer() {
        let d = dispatcher(Scripted(
            Err(|| AgentError::operation("disk: x is not attached before")),
            Duration::ZERO,
        ));
        match d.dispatch(Command::Ping).await.unwrap() {
            Answer::Failure { kind, message } => {
                assert_eq!(kind, FailureKind::Operation);
                assert!(message.contains("not attached before"));
            }
            other => panic!("unexpected answer {:?}", other),
        }
    }

    #[tokio::test]
    async fn connectivity_error_propagates() {
        let d = dispatcher(Scripted(
            Err(|| AgentError::Connectivity("libvirtd gone".into())),
            Duration::ZERO,
        ));
        assert!(d.dispatch(Command::Ping).await.unwrap_err().is_connectivity());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out() {
        let d = dispatcher(Scripted(Ok(()), Duration::from_secs(60)));
        match d.dispatch(Command::Ping).await.unwrap() {
            Answer::Failure { kind, .. } => assert_eq!(kind, FailureKind::Timeout),
            other => panic!("unexpected answer {:?}", other),
        }
    }
}
