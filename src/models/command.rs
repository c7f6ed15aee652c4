// Command/Answer protocol between orchestrator and agent

use super::host::{StartupInfo, StartupStoragePool};
use super::stats::{HealthCheckResult, PowerState, VmDiskStats, VmStats};
use super::vm::{DiskSpec, NicSpec, VmSpec};
use crate::error::AgentError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    #[serde(rename_all = "camelCase")]
    Start { vm: VmSpec },
    #[serde(rename_all = "camelCase")]
    Stop {
        vm_name: String,
        #[serde(default)]
        force: bool,
    },
    #[serde(rename_all = "camelCase")]
    Reboot { vm_name: String },
    #[serde(rename_all = "camelCase")]
    PrepareForMigration { vm: VmSpec },
    #[serde(rename_all = "camelCase")]
    Migrate {
        vm_name: String,
        destination_uri: String,
    },
    #[serde(rename_all = "camelCase")]
    AttachVolume { vm_name: String, disk: DiskSpec },
    #[serde(rename_all = "camelCase")]
    DetachVolume { vm_name: String, disk: DiskSpec },
    #[serde(rename_all = "camelCase")]
    AttachIso {
        vm_name: String,
        iso_path: String,
        attach: bool,
    },
    #[serde(rename_all = "camelCase")]
    PlugNic {
        vm_name: String,
        nic: NicSpec,
        vcpus: u32,
        /// VM details carrying the NIC queue settings.
        #[serde(default)]
        details: BTreeMap<String, String>,
    },
    #[serde(rename_all = "camelCase")]
    UnplugNic { vm_name: String, mac: String },
    #[serde(rename_all = "camelCase")]
    GetVmStats { vm_names: Vec<String> },
    #[serde(rename_all = "camelCase")]
    GetVmDiskStats { vm_names: Vec<String> },
    #[serde(rename_all = "camelCase")]
    GetVmState { vm_name: String },
    Ping,
    CheckHealth,
    HostStartup,
    #[serde(rename_all = "camelCase")]
    SetupTunnel { bridge: String, key: String },
    #[serde(rename_all = "camelCase")]
    CleanupNetwork { bridge: String },
    /// Anything this agent does not know how to handle.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    Start,
    Stop,
    Reboot,
    PrepareForMigration,
    Migrate,
    AttachVolume,
    DetachVolume,
    AttachIso,
    PlugNic,
    UnplugNic,
    GetVmStats,
    GetVmDiskStats,
    GetVmState,
    Ping,
    CheckHealth,
    HostStartup,
    SetupTunnel,
    CleanupNetwork,
    Unknown,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Start { .. } => CommandKind::Start,
            Command::Stop { .. } => CommandKind::Stop,
            Command::Reboot { .. } => CommandKind::Reboot,
            Command::PrepareForMigration { .. } => CommandKind::PrepareForMigration,
            Command::Migrate { .. } => CommandKind::Migrate,
            Command::AttachVolume { .. } => CommandKind::AttachVolume,
            Command::DetachVolume { .. } => CommandKind::DetachVolume,
            Command::AttachIso { .. } => CommandKind::AttachIso,
            Command::PlugNic { .. } => CommandKind::PlugNic,
            Command::UnplugNic { .. } => CommandKind::UnplugNic,
            Command::GetVmStats { .. } => CommandKind::GetVmStats,
            Command::GetVmDiskStats { .. } => CommandKind::GetVmDiskStats,
            Command::GetVmState { .. } => CommandKind::GetVmState,
            Command::Ping => CommandKind::Ping,
            Command::CheckHealth => CommandKind::CheckHealth,
            Command::HostStartup => CommandKind::HostStartup,
            Command::SetupTunnel { .. } => CommandKind::SetupTunnel,
            Command::CleanupNetwork { .. } => CommandKind::CleanupNetwork,
            Command::Unknown => CommandKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    Configuration,
    NotFound,
    Operation,
    Timeout,
    ExternalTool,
}

impl From<&AgentError> for FailureKind {
    fn from(e: &AgentError) -> Self {
        match e {
            AgentError::Configuration(_) => FailureKind::Configuration,
            AgentError::NotFound(_) => FailureKind::NotFound,
            AgentError::Timeout(_) => FailureKind::Timeout,
            AgentError::ExternalTool { .. } => FailureKind::ExternalTool,
            AgentError::Operation(_) | AgentError::Connectivity(_) => FailureKind::Operation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AnswerPayload {
    None,
    #[serde(rename_all = "camelCase")]
    Started { vm_name: String },
    #[serde(rename_all = "camelCase")]
    Stopped {
        vm_name: String,
        already_stopped: bool,
        forced: bool,
    },
    /// Idempotent edits report whether anything changed.
    Changed {
        changed: bool,
    },
    #[serde(rename_all = "camelCase")]
    MigrationPrepared { domain_xml: String },
    VmStats {
        stats: Vec<VmStats>,
    },
    DiskStats {
        stats: BTreeMap<String, Vec<VmDiskStats>>,
    },
    State {
        state: PowerState,
    },
    Health {
        result: HealthCheckResult,
    },
    #[serde(rename_all = "camelCase")]
    Ping {
        host_id: String,
        vm_states: BTreeMap<String, PowerState>,
        health: Option<bool>,
    },
    Startup {
        host: Box<StartupInfo>,
        pools: Vec<StartupStoragePool>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Answer {
    Success {
        payload: AnswerPayload,
    },
    Failure {
        kind: FailureKind,
        message: String,
    },
    Unsupported {
        command: CommandKind,
    },
}

impl Answer {
    pub fn ok(payload: AnswerPayload) -> Self {
        Answer::Success { payload }
    }

    pub fn empty() -> Self {
        Answer::Success {
            payload: AnswerPayload::None,
        }
    }

    pub fn failed(err: &AgentError) -> Self {
        Answer::Failure {
            kind: err.into(),
            message: err.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Answer::Success { .. })
    }
}
