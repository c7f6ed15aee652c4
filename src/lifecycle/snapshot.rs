// VM snapshot metadata capture and restore around stop and migration

use crate::error::AgentError;
use crate::hypervisor::Hypervisor;
use dashmap::DashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMetadata {
    pub name: String,
    pub current: bool,
    pub xml: String,
}

/// Metadata removed from domains that have been stopped, kept until the domain
/// is started again on this host.
#[derive(Default)]
pub struct SnapshotStore {
    saved: DashMap<String, Vec<SnapshotMetadata>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save(&self, vm: &str, snapshots: Vec<SnapshotMetadata>) {
        if snapshots.is_empty() {
            self.saved.remove(vm);
        } else {
            self.saved.insert(vm.to_string(), snapshots);
        }
    }

    pub fn take(&self, vm: &str) -> Vec<SnapshotMetadata> {
        self.saved.remove(vm).map(|(_, v)| v).unwrap_or_default()
    }

    pub fn get(&self, vm: &str) -> Vec<SnapshotMetadata> {
        self.saved.get(vm).map(|v| v.value().clone()).unwrap_or_default()
    }
}

/// Metadata deletion failed part-way. Anything already deleted has been
/// redefined, so the domain keeps all of its snapshots; `captured` still holds
/// every record read before the failure.
#[derive(Debug, thiserror::Error)]
#[error("snapshot metadata capture failed: {source}")]
pub struct CaptureError {
    pub captured: Vec<SnapshotMetadata>,
    #[source]
    pub source: AgentError,
}

impl CaptureError {
    fn read(source: impl Into<AgentError>) -> Self {
        Self {
            captured: Vec::new(),
            source: source.into(),
        }
    }
}

/// Record every snapshot (name, current flag, XML), then delete the metadata.
/// All XML is read before anything is deleted. A missing domain has no snapshots.
pub async fn capture(
    hypervisor: &dyn Hypervisor,
    vm: &str,
) -> Result<Vec<SnapshotMetadata>, CaptureError> {
    let names = match hypervisor.snapshot_names(vm).await {
        Ok(names) => names,
        Err(e) if e.is_not_found() => return Ok(Vec::new()),
        Err(e) => return Err(CaptureError::read(e)),
    };
    if names.is_empty() {
        return Ok(Vec::new());
    }
    let current = hypervisor
        .current_snapshot(vm)
        .await
        .map_err(CaptureError::read)?;
    let mut captured = Vec::with_capacity(names.len());
    for name in names {
        let xml = hypervisor
            .snapshot_xml(vm, &name)
            .await
            .map_err(CaptureError::read)?;
        captured.push(SnapshotMetadata {
            current: current.as_deref() == Some(name.as_str()),
            name,
            xml,
        });
    }
    for (deleted, snap) in captured.iter().enumerate() {
        if let Err(e) = hypervisor.delete_snapshot_metadata(vm, &snap.name).await {
            warn!(
                error = %e,
                operation = "delete_snapshot_metadata",
                vm,
                snapshot = %snap.name,
                "snapshot metadata deletion failed, redefining deleted entries"
            );
            restore(hypervisor, vm, &captured[..deleted]).await;
            return Err(CaptureError {
                captured,
                source: e.into(),
            });
        }
    }
    debug!(vm, count = captured.len(), "captured snapshot metadata");
    Ok(captured)
}

/// Redefine captured snapshots. A failure on one snapshot does not stop the rest.
pub async fn restore(hypervisor: &dyn Hypervisor, vm: &str, snapshots: &[SnapshotMetadata]) {
    for snap in snapshots {
        match hypervisor.redefine_snapshot(vm, &snap.xml, snap.current).await {
            Ok(()) => debug!(vm, snapshot = %snap.name, "restored snapshot metadata"),
            Err(e) => warn!(
                error = %e,
                operation = "restore_snapshot",
                vm,
                snapshot = %snap.name,
                "failed to restore snapshot metadata, continuing"
            ),
        }
    }
}
