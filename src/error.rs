// Error taxonomy shared by every component

use thiserror::Error;

/// Failures reported by the hypervisor control interface.
#[derive(Debug, Error)]
pub enum HypervisorError {
    /// The domain (or secret, snapshot) does not exist. Callers branch on this
    /// instead of treating it as a failure.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("hypervisor connection failed: {0}")]
    ConnectionFailed(String),

    #[error("{operation} failed: {message}")]
    OperationFailed { operation: String, message: String },

    #[error("hypervisor call timed out: {0}")]
    Timeout(String),

    #[error("hypervisor internal error: {0}")]
    Internal(String),
}

impl HypervisorError {
    pub fn failed(operation: &str, message: impl Into<String>) -> Self {
        HypervisorError::OperationFailed {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, HypervisorError::NotFound(_))
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, HypervisorError::ConnectionFailed(_))
    }
}

/// Agent-level error categories.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Missing script or property; the agent refuses to start.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Hypervisor or control plane unreachable. The only error allowed past the dispatcher.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Operation(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// Script or tool exited unexpectedly, or printed output where none was expected.
    #[error("external tool {tool} failed: {output}")]
    ExternalTool { tool: String, output: String },
}

impl AgentError {
    pub fn operation(msg: impl Into<String>) -> Self {
        AgentError::Operation(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        AgentError::Configuration(msg.into())
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, AgentError::Connectivity(_))
    }
}

impl From<HypervisorError> for AgentError {
    fn from(e: HypervisorError) -> Self {
        match e {
            HypervisorError::NotFound(m) => AgentError::NotFound(m),
            HypervisorError::ConnectionFailed(m) => AgentError::Connectivity(m),
            HypervisorError::Timeout(m) => AgentError::Timeout(m),
            other => AgentError::Operation(other.to_string()),
        }
    }
}

pub type Result<T, E = AgentError> = std::result::Result<T, E>;
