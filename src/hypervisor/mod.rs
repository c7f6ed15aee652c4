// Hypervisor control interface and its backends

pub mod domxml;
mod memory;
mod virsh;

pub use memory::MemoryHypervisor;
pub use virsh::VirshHypervisor;

use crate::error::HypervisorError;
use crate::models::DomainState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub type HvResult<T> = Result<T, HypervisorError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainInfo {
    pub name: String,
    pub uuid: String,
    pub state: DomainState,
    pub persistent: bool,
    pub cpu_time_ns: u64,
    pub vcpus: u32,
    pub max_memory_kib: u64,
    pub memory_kib: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HypervisorVersion {
    /// Libvirt library version, encoded major * 1_000_000 + minor * 1000 + release.
    pub library: u64,
    pub hypervisor: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceCounters {
    pub target: String,
    pub mac: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockCounters {
    pub target: String,
    pub path: String,
    /// "disk", "cdrom" or "floppy".
    pub device: String,
    pub rd_req: u64,
    pub wr_req: u64,
    pub rd_bytes: u64,
    pub wr_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryCounters {
    pub actual_kib: u64,
    pub unused_kib: Option<u64>,
    pub usable_kib: Option<u64>,
}

/// A volume passphrase secret. Always private and ephemeral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretSpec {
    pub uuid: String,
    pub usage_volume: String,
    pub value: String,
}

impl SecretSpec {
    pub fn to_xml(&self) -> String {
        format!(
            "<secret ephemeral='yes' private='yes'>\n  <uuid>{}</uuid>\n  <usage type='volume'>\n    <volume>{}</volume>\n  </usage>\n</secret>\n",
            domxml::escape(&self.uuid),
            domxml::escape(&self.usage_volume)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretOutcome {
    Created,
    /// A secret with this id already existed and was reused.
    Reused,
}

/// Hypervisor control interface. Every lookup-style call returns
/// `HypervisorError::NotFound` for a missing domain so callers can branch on it.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn version(&self) -> HvResult<HypervisorVersion>;

    /// Names of all domains known to the hypervisor, active or not.
    async fn list_domains(&self) -> HvResult<Vec<String>>;
    async fn domain_info(&self, name: &str) -> HvResult<DomainInfo>;
    async fn domain_xml(&self, name: &str) -> HvResult<String>;

    /// Create and start a domain that disappears once it stops.
    async fn create_transient(&self, xml: &str) -> HvResult<()>;
    async fn undefine(&self, name: &str) -> HvResult<()>;
    async fn shutdown(&self, name: &str) -> HvResult<()>;
    async fn destroy(&self, name: &str) -> HvResult<()>;
    /// ACPI reboot.
    async fn reboot(&self, name: &str) -> HvResult<()>;
    async fn migrate(&self, name: &str, destination_uri: &str) -> HvResult<()>;

    async fn attach_device(&self, name: &str, xml: &str) -> HvResult<()>;
    async fn detach_device(&self, name: &str, xml: &str) -> HvResult<()>;
    async fn update_device(&self, name: &str, xml: &str) -> HvResult<()>;

    async fn interface_counters(&self, name: &str) -> HvResult<Vec<InterfaceCounters>>;
    async fn block_counters(&self, name: &str) -> HvResult<Vec<BlockCounters>>;
    async fn memory_counters(&self, name: &str) -> HvResult<MemoryCounters>;

    async fn snapshot_names(&self, name: &str) -> HvResult<Vec<String>>;
    async fn current_snapshot(&self, name: &str) -> HvResult<Option<String>>;
    async fn snapshot_xml(&self, name: &str, snapshot: &str) -> HvResult<String>;
    /// Removes only the hypervisor's metadata; disk state is untouched.
    async fn delete_snapshot_metadata(&self, name: &str, snapshot: &str) -> HvResult<()>;
    async fn redefine_snapshot(&self, name: &str, xml: &str, current: bool) -> HvResult<()>;

    /// Define the secret, or reuse the existing one with the same uuid.
    async fn create_or_get_secret(&self, secret: &SecretSpec) -> HvResult<SecretOutcome>;
    async fn remove_secret(&self, uuid: &str) -> HvResult<()>;
}

/// Parses "X.Y.Z" into the libvirt integer encoding.
pub fn encode_version(s: &str) -> Option<u64> {
    let mut parts = s.trim().split('.').map(|p| p.parse::<u64>());
    let major = parts.next()?.ok()?;
    let minor = parts.next().unwrap_or(Ok(0)).ok()?;
    let release = parts.next().unwrap_or(Ok(0)).ok()?;
    Some(major * 1_000_000 + minor * 1000 + release)
}

/// Inverse of `encode_version`.
pub fn pretty_version(v: u64) -> String {
    let major = v / 1_000_000;
    let minor = v % 1_000_000 / 1000;
    let release = v % 1000;
    format!("{}.{}.{}", major, minor, release)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_encoding() {
        assert_eq!(encode_version("9.0.0"), Some(9_000_000));
        assert_eq!(encode_version("0.9.10"), Some(9010));
        assert_eq!(encode_version("8.1"), Some(8_001_000));
        assert_eq!(encode_version("x"), None);
        assert_eq!(pretty_version(6_002_000), "6.2.0");
    }

    #[test]
    fn secret_xml_is_private_and_ephemeral() {
        let s = SecretSpec {
            uuid: "abc".into(),
            usage_volume: "/pool/vol".into(),
            value: "pw".into(),
        };
        let xml = s.to_xml();
        assert!(xml.contains("ephemeral='yes' private='yes'"));
        assert!(xml.contains("<volume>/pool/vol</volume>"));
        assert!(!xml.contains("pw"));
    }
}
