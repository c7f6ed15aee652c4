// DiskSpec -> ResolvedDisk across the storage pool matrix

use super::{PhysicalDisk, StoragePoolManager, check_volume_activity};
use crate::compiler::{DiskBuses, disk_buses};
use crate::error::AgentError;
use crate::hypervisor::domxml::DomainDisk;
use crate::hypervisor::{Hypervisor, SecretOutcome, SecretSpec};
use crate::models::{
    DiskActivitySettings, DiskAuth, DiskBus, DiskDevice, DiskEncryption, DiskFormat, DiskRole,
    DiskSource, DiskSpec, NetworkProtocol, PoolType, RateLimits, ResolvedDisk, VmSpec, VmType,
    detail,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

const RBD_DEFAULT_PORT: u16 = 6789;
const GLUSTER_DEFAULT_PORT: u16 = 24007;
const SERIAL_LEN: usize = 20;

/// Per-VM inputs that shape every disk: the bus table and iothread flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskContext {
    pub buses: DiskBuses,
    pub io_threads: bool,
}

impl DiskContext {
    pub fn for_vm(spec: &VmSpec) -> Self {
        Self {
            buses: disk_buses(spec),
            io_threads: spec.detail(detail::IOTHREADS).is_some(),
        }
    }

    /// Context for a hot-plugged volume on `bus`.
    pub fn for_attach(bus: DiskBus, iso: DiskBus) -> Self {
        Self {
            buses: DiskBuses {
                root: bus,
                data: bus,
                iso,
            },
            io_threads: false,
        }
    }
}

/// Volume uuid (or path, for shareable volumes) without hyphens, at most 20 chars.
pub fn disk_serial(id: &str) -> String {
    id.chars().filter(|c| *c != '-').take(SERIAL_LEN).collect()
}

/// Deterministic secret id for an encrypted volume path. Source and destination
/// hosts of a migration derive the same id.
pub fn secret_uuid_for(path: &str) -> String {
    uuid::Uuid::new_v3(&uuid::Uuid::NAMESPACE_URL, path.as_bytes()).to_string()
}

pub struct StorageResolver {
    hypervisor: Arc<dyn Hypervisor>,
    pools: Arc<dyn StoragePoolManager>,
    activity: DiskActivitySettings,
    systemvm_iso_path: String,
}

impl StorageResolver {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        pools: Arc<dyn StoragePoolManager>,
        activity: DiskActivitySettings,
        systemvm_iso_path: impl Into<String>,
    ) -> Self {
        Self {
            hypervisor,
            pools,
            activity,
            systemvm_iso_path: systemvm_iso_path.into(),
        }
    }

    pub fn pool_manager(&self) -> &Arc<dyn StoragePoolManager> {
        &self.pools
    }

    /// Every disk of the VM in sequence order. System VMs get the system ISO appended.
    #[instrument(skip(self, spec), fields(component = "storage", vm = %spec.name))]
    pub async fn resolve_all(&self, spec: &VmSpec) -> Result<Vec<ResolvedDisk>, AgentError> {
        let ctx = DiskContext::for_vm(spec);
        let mut out = Vec::with_capacity(spec.disks.len() + 1);
        for disk in spec.sorted_disks() {
            out.push(self.resolve(disk, &ctx).await?);
        }
        if spec.vm_type == VmType::System {
            let seq = out.iter().map(|d| d.seq + 1).max().unwrap_or(0).max(2);
            out.push(cdrom_disk(
                seq,
                ctx.buses.iso,
                DiskSource::File {
                    path: self.systemvm_iso_path.clone(),
                },
            ));
        }
        Ok(out)
    }

    pub async fn resolve(
        &self,
        disk: &DiskSpec,
        ctx: &DiskContext,
    ) -> Result<ResolvedDisk, AgentError> {
        if disk.role == DiskRole::Iso {
            let source = self.iso_source(disk).await?;
            return Ok(cdrom_disk(disk.seq, ctx.buses.iso, source));
        }

        let Some(pool_ref) = &disk.pool else {
            return Err(AgentError::operation(format!(
                "found null pool for volume {}",
                disk.uuid
            )));
        };
        let physical = self
            .pools
            .get_physical_disk(pool_ref.pool_type, &pool_ref.uuid, &disk.path)
            .await?;

        if self.activity.enabled && physical.format == DiskFormat::Qcow2 {
            debug!(path = %physical.path, "checking volume for activity");
            check_volume_activity(Path::new(&physical.path), &self.activity).await?;
        }

        let bus = match disk.role {
            DiskRole::Data => ctx.buses.data,
            _ => ctx.buses.root,
        };
        let (source, format, bus) = source_for(&physical, bus, ctx.buses.data, pool_ref);

        let encryption = match &disk.passphrase {
            Some(passphrase) => Some(self.ensure_secret(&disk.path, passphrase).await?),
            None => None,
        };

        let scsi = ctx.buses.root == DiskBus::Scsi;
        let serial_id = if disk.shareable { &disk.path } else { &disk.uuid };
        Ok(ResolvedDisk {
            seq: disk.seq,
            role: disk.role,
            device: DiskDevice::Disk,
            source,
            bus,
            target_dev: bus.device_label(disk.seq),
            format,
            cache: disk.cache_mode,
            serial: Some(disk_serial(serial_id)),
            discard_unmap: scsi,
            qemu_driver: true,
            io_threads: ctx.io_threads,
            rate_limits: disk.rate_limits.clone(),
            encryption,
            shareable: disk.shareable,
            readonly: false,
        })
    }

    /// Source path the volume shows in a running domain's XML.
    pub async fn attached_path(&self, disk: &DiskSpec) -> Result<String, AgentError> {
        let Some(pool_ref) = &disk.pool else {
            return Err(AgentError::operation(format!(
                "found null pool for volume {}",
                disk.uuid
            )));
        };
        let physical = self
            .pools
            .get_physical_disk(pool_ref.pool_type, &pool_ref.uuid, &disk.path)
            .await?;
        let (source, _, _) = source_for(&physical, DiskBus::Virtio, DiskBus::Virtio, pool_ref);
        Ok(source.path().unwrap_or(&physical.path).to_string())
    }

    /// Release the host side of a detached volume. Failures are logged only.
    pub async fn disconnect(&self, disk: &DiskSpec) {
        let Some(pool_ref) = &disk.pool else {
            return;
        };
        match self
            .pools
            .disconnect_physical_disk(pool_ref.pool_type, &pool_ref.uuid, &disk.path)
            .await
        {
            Ok(true) => debug!(path = %disk.path, "disconnected volume"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, operation = "disconnect", path = %disk.path, "failed to disconnect volume"),
        }
    }

    async fn iso_source(&self, disk: &DiskSpec) -> Result<DiskSource, AgentError> {
        let path = disk.path.trim();
        if path.is_empty() {
            return Ok(DiskSource::Empty);
        }
        if path.contains("://") {
            let Some(idx) = path.rfind('/') else {
                return Err(AgentError::configuration(format!("bad ISO path {}", path)));
            };
            let pool = self.pools.get_storage_pool_by_uri(&path[..idx]).await?;
            let iso = self
                .pools
                .get_physical_disk(pool.pool_type, &pool.uuid, &path[idx + 1..])
                .await?;
            return Ok(DiskSource::File { path: iso.path });
        }
        if let Some(pool_ref) = &disk.pool {
            let iso = self
                .pools
                .get_physical_disk(pool_ref.pool_type, &pool_ref.uuid, path)
                .await?;
            return Ok(DiskSource::File { path: iso.path });
        }
        Ok(DiskSource::File {
            path: path.to_string(),
        })
    }

    /// Resolve an ISO path (as sent with attach-iso) into a cdrom source.
    pub async fn iso_path(&self, path: &str) -> Result<DiskSource, AgentError> {
        let disk = DiskSpec {
            uuid: String::new(),
            role: DiskRole::Iso,
            seq: 0,
            path: path.to_string(),
            pool: None,
            cache_mode: None,
            rate_limits: RateLimits::default(),
            passphrase: None,
            shareable: false,
        };
        self.iso_source(&disk).await
    }

    async fn ensure_secret(
        &self,
        path: &str,
        passphrase: &str,
    ) -> Result<DiskEncryption, AgentError> {
        let spec = SecretSpec {
            uuid: secret_uuid_for(path),
            usage_volume: path.to_string(),
            value: passphrase.to_string(),
        };
        match self.hypervisor.create_or_get_secret(&spec).await? {
            SecretOutcome::Created => debug!(secret = %spec.uuid, "created volume secret"),
            SecretOutcome::Reused => debug!(secret = %spec.uuid, "reusing volume secret"),
        }
        Ok(DiskEncryption {
            secret_uuid: spec.uuid,
            format: "luks".into(),
        })
    }

    /// Remove the secrets of encrypted disks. Missing secrets are ignored; other
    /// failures are logged so the remaining secrets still get removed.
    pub async fn revoke_secrets(&self, disks: &[DomainDisk]) {
        for uuid in disks.iter().filter_map(|d| d.secret_uuid.as_deref()) {
            match self.hypervisor.remove_secret(uuid).await {
                Ok(()) => debug!(secret = %uuid, "removed volume secret"),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(error = %e, operation = "revoke_secrets", secret = %uuid, "failed to remove secret"),
            }
        }
    }
}

/// Read-only cdrom device at `seq` on `bus`.
pub fn cdrom_disk(seq: u32, bus: DiskBus, source: DiskSource) -> ResolvedDisk {
    ResolvedDisk {
        seq,
        role: DiskRole::Iso,
        device: DiskDevice::Cdrom,
        source,
        bus,
        target_dev: bus.device_label(seq),
        format: DiskFormat::Raw,
        cache: None,
        serial: None,
        discard_unmap: false,
        qemu_driver: true,
        io_threads: false,
        rate_limits: RateLimits::default(),
        encryption: None,
        shareable: false,
        readonly: true,
    }
}

fn source_for(
    physical: &PhysicalDisk,
    bus: DiskBus,
    data_bus: DiskBus,
    pool_ref: &crate::models::PoolRef,
) -> (DiskSource, DiskFormat, DiskBus) {
    let pool = &physical.pool;
    let host = || {
        pool.source_host
            .clone()
            .or_else(|| pool_ref.host.clone())
            .unwrap_or_default()
    };
    match pool.pool_type {
        PoolType::Rbd => {
            let username = pool.auth_user.clone().or_else(|| pool_ref.user_info.clone());
            let source = DiskSource::Network {
                protocol: NetworkProtocol::Rbd,
                name: physical.path.replace("rbd:", ""),
                host: host(),
                port: pool
                    .source_port
                    .or(pool_ref.port)
                    .unwrap_or(RBD_DEFAULT_PORT),
                auth: username.map(|username| DiskAuth {
                    username,
                    secret_uuid: pool.uuid.clone(),
                }),
            };
            (source, DiskFormat::Raw, bus)
        }
        PoolType::PowerFlex => {
            let format = if physical.format == DiskFormat::Qcow2 {
                DiskFormat::Qcow2
            } else {
                DiskFormat::Raw
            };
            (
                DiskSource::Block {
                    dev: physical.path.clone(),
                },
                format,
                data_bus,
            )
        }
        PoolType::Gluster => {
            let volume = pool
                .source_dir
                .clone()
                .or_else(|| pool_ref.path.clone())
                .unwrap_or_default()
                .replace('/', "");
            let rel = physical.path.replace(&pool.local_path, "");
            let source = DiskSource::Network {
                protocol: NetworkProtocol::Gluster,
                name: format!("{}{}", volume, rel),
                host: host(),
                port: pool
                    .source_port
                    .or(pool_ref.port)
                    .unwrap_or(GLUSTER_DEFAULT_PORT),
                auth: None,
            };
            (source, DiskFormat::Qcow2, bus)
        }
        _ if pool.pool_type == PoolType::Clvm || physical.format == DiskFormat::Raw => (
            DiskSource::Block {
                dev: physical.path.clone(),
            },
            DiskFormat::Raw,
            bus,
        ),
        _ => (
            DiskSource::File {
                path: physical.path.clone(),
            },
            DiskFormat::Qcow2,
            bus,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::MemoryHypervisor;
    use crate::models::PoolRef;
    use crate::storage::StoragePool;
    use async_trait::async_trait;

    /// Hands out one prepared volume for every lookup.
    struct OneVolumePool {
        disk: PhysicalDisk,
    }

    #[async_trait]
    impl StoragePoolManager for OneVolumePool {
        async fn get_physical_disk(
            &self,
            _pool_type: PoolType,
            _pool_uuid: &str,
            _path: &str,
        ) -> Result<PhysicalDisk, AgentError> {
            Ok(self.disk.clone())
        }

        async fn get_storage_pool_by_uri(&self, uri: &str) -> Result<StoragePool, AgentError> {
            Err(AgentError::NotFound(format!("storage pool {}", uri)))
        }

        async fn copy_physical_disk(
            &self,
            disk: &PhysicalDisk,
            _name: &str,
            _dest: &StoragePool,
        ) -> Result<PhysicalDisk, AgentError> {
            Ok(disk.clone())
        }

        async fn disconnect_physical_disk(
            &self,
            _pool_type: PoolType,
            _pool_uuid: &str,
            _path: &str,
        ) -> Result<bool, AgentError> {
            Ok(false)
        }

        fn pools(&self) -> Vec<StoragePool> {
            vec![self.disk.pool.clone()]
        }
    }

    fn pool(pool_type: PoolType) -> StoragePool {
        StoragePool {
            uuid: "6a1f0c2e-7d3b-4c55-9e0a-3f1b2c4d5e6f".into(),
            pool_type,
            local_path: "/mnt/6a1f0c2e".into(),
            source_host: None,
            source_port: None,
            source_dir: None,
            auth_user: None,
        }
    }

    fn volume(pool: StoragePool, path: &str, format: DiskFormat) -> PhysicalDisk {
        PhysicalDisk {
            name: "vol".into(),
            path: path.into(),
            format,
            size_bytes: 8 << 30,
            pool,
        }
    }

    fn disk_spec(role: DiskRole, seq: u32, pool_type: PoolType) -> DiskSpec {
        DiskSpec {
            uuid: "0f6c2b1a-aaaa-bbbb-cccc-ddddeeeeffff".into(),
            role,
            seq,
            path: "vol-1".into(),
            pool: Some(PoolRef {
                pool_type,
                uuid: "6a1f0c2e-7d3b-4c55-9e0a-3f1b2c4d5e6f".into(),
                host: Some("10.0.0.5".into()),
                port: None,
                path: Some("/gv0".into()),
                user_info: Some("client".into()),
            }),
            cache_mode: None,
            rate_limits: RateLimits::default(),
            passphrase: None,
            shareable: false,
        }
    }

    fn resolver(hv: &MemoryHypervisor, disk: PhysicalDisk) -> StorageResolver {
        StorageResolver::new(
            Arc::new(hv.clone()),
            Arc::new(OneVolumePool { disk }),
            DiskActivitySettings::default(),
            "/usr/share/systemvm.iso",
        )
    }

    fn virtio() -> DiskContext {
        DiskContext::for_attach(DiskBus::Virtio, DiskBus::Ide)
    }

    #[tokio::test]
    async fn rbd_volume_is_a_network_source_with_auth() {
        let mut p = pool(PoolType::Rbd);
        p.source_host = Some("ceph-mon".into());
        p.auth_user = Some("admin".into());
        let r = resolver(&MemoryHypervisor::new(), volume(p, "rbd:cloudstack/vol-1", DiskFormat::Raw));

        let out = r
            .resolve(&disk_spec(DiskRole::Root, 0, PoolType::Rbd), &virtio())
            .await
            .unwrap();
        assert_eq!(out.format, DiskFormat::Raw);
        assert_eq!(
            out.source,
            DiskSource::Network {
                protocol: NetworkProtocol::Rbd,
                name: "cloudstack/vol-1".into(),
                host: "ceph-mon".into(),
                port: RBD_DEFAULT_PORT,
                auth: Some(DiskAuth {
                    username: "admin".into(),
                    secret_uuid: "6a1f0c2e-7d3b-4c55-9e0a-3f1b2c4d5e6f".into(),
                }),
            }
        );
    }

    #[tokio::test]
    async fn rbd_falls_back_to_pool_reference_for_host_and_user() {
        let r = resolver(
            &MemoryHypervisor::new(),
            volume(pool(PoolType::Rbd), "cloudstack/vol-1", DiskFormat::Raw),
        );
        let out = r
            .resolve(&disk_spec(DiskRole::Root, 0, PoolType::Rbd), &virtio())
            .await
            .unwrap();
        let DiskSource::Network { host, auth, .. } = out.source else {
            panic!("expected network source, got {:?}", out.source);
        };
        assert_eq!(host, "10.0.0.5");
        assert_eq!(auth.map(|a| a.username).as_deref(), Some("client"));
    }

    #[tokio::test]
    async fn clvm_volume_is_a_raw_block_device() {
        let r = resolver(
            &MemoryHypervisor::new(),
            volume(pool(PoolType::Clvm), "/dev/vg0/vol-1", DiskFormat::Qcow2),
        );
        let out = r
            .resolve(&disk_spec(DiskRole::Data, 1, PoolType::Clvm), &virtio())
            .await
            .unwrap();
        assert_eq!(out.source, DiskSource::Block { dev: "/dev/vg0/vol-1".into() });
        assert_eq!(out.format, DiskFormat::Raw);
        assert_eq!(out.target_dev, "vdb");
    }

    #[tokio::test]
    async fn raw_file_volume_is_a_block_device() {
        let r = resolver(
            &MemoryHypervisor::new(),
            volume(pool(PoolType::Filesystem), "/mnt/6a1f0c2e/vol-1", DiskFormat::Raw),
        );
        let out = r
            .resolve(&disk_spec(DiskRole::Root, 0, PoolType::Filesystem), &virtio())
            .await
            .unwrap();
        assert!(matches!(out.source, DiskSource::Block { .. }));
        assert_eq!(out.format, DiskFormat::Raw);
    }

    #[tokio::test]
    async fn gluster_volume_is_named_by_volume_and_relative_path() {
        let mut p = pool(PoolType::Gluster);
        p.source_host = Some("gluster-1".into());
        let r = resolver(
            &MemoryHypervisor::new(),
            volume(p, "/mnt/6a1f0c2e/vol-1", DiskFormat::Qcow2),
        );
        let out = r
            .resolve(&disk_spec(DiskRole::Root, 0, PoolType::Gluster), &virtio())
            .await
            .unwrap();
        assert_eq!(
            out.source,
            DiskSource::Network {
                protocol: NetworkProtocol::Gluster,
                name: "gv0/vol-1".into(),
                host: "gluster-1".into(),
                port: GLUSTER_DEFAULT_PORT,
                auth: None,
            }
        );
        assert_eq!(out.format, DiskFormat::Qcow2);
    }

    #[tokio::test]
    async fn powerflex_volume_keeps_qcow2_and_uses_data_bus() {
        let ctx = DiskContext {
            buses: DiskBuses {
                root: DiskBus::Ide,
                data: DiskBus::Virtio,
                iso: DiskBus::Ide,
            },
            io_threads: false,
        };
        let hv = MemoryHypervisor::new();

        let r = resolver(&hv, volume(pool(PoolType::PowerFlex), "/dev/disk/by-id/emc-vol-1", DiskFormat::Qcow2));
        let out = r
            .resolve(&disk_spec(DiskRole::Root, 0, PoolType::PowerFlex), &ctx)
            .await
            .unwrap();
        assert_eq!(out.source, DiskSource::Block { dev: "/dev/disk/by-id/emc-vol-1".into() });
        assert_eq!(out.format, DiskFormat::Qcow2);
        assert_eq!(out.bus, DiskBus::Virtio);
        assert_eq!(out.target_dev, "vda");

        let r = resolver(&hv, volume(pool(PoolType::PowerFlex), "/dev/disk/by-id/emc-vol-1", DiskFormat::Dir));
        let out = r
            .resolve(&disk_spec(DiskRole::Root, 0, PoolType::PowerFlex), &ctx)
            .await
            .unwrap();
        assert_eq!(out.format, DiskFormat::Raw);
    }

    #[tokio::test]
    async fn passphrase_secret_is_created_once_then_revoked() {
        let hv = MemoryHypervisor::new();
        let r = resolver(
            &hv,
            volume(pool(PoolType::Filesystem), "/mnt/6a1f0c2e/vol-1", DiskFormat::Qcow2),
        );
        let mut spec = disk_spec(DiskRole::Root, 0, PoolType::Filesystem);
        spec.passphrase = Some("s3cret".into());
        let expected = secret_uuid_for("vol-1");

        let first = r.resolve(&spec, &virtio()).await.unwrap();
        let second = r.resolve(&spec, &virtio()).await.unwrap();
        let enc = first.encryption.clone().unwrap();
        assert_eq!(enc.secret_uuid, expected);
        assert_eq!(enc.format, "luks");
        assert_eq!(second.encryption, first.encryption);
        assert!(hv.has_secret(&expected));
        let defines = hv
            .calls()
            .iter()
            .filter(|c| *c == &format!("secret {}", expected))
            .count();
        assert_eq!(defines, 2);

        let attached = DomainDisk {
            device: "disk".into(),
            source: Some("/mnt/6a1f0c2e/vol-1".into()),
            target_dev: "vda".into(),
            bus: Some("virtio".into()),
            secret_uuid: Some(expected.clone()),
            raw: String::new(),
        };
        r.revoke_secrets(&[attached.clone()]).await;
        assert!(!hv.has_secret(&expected));
        // Already gone: nothing to report.
        r.revoke_secrets(&[attached]).await;
    }

    #[tokio::test]
    async fn failed_secret_creation_fails_the_disk() {
        let hv = MemoryHypervisor::new();
        hv.fail_call("secret", 0);
        let r = resolver(
            &hv,
            volume(pool(PoolType::Filesystem), "/mnt/6a1f0c2e/vol-1", DiskFormat::Qcow2),
        );
        let mut spec = disk_spec(DiskRole::Root, 0, PoolType::Filesystem);
        spec.passphrase = Some("s3cret".into());
        assert!(r.resolve(&spec, &virtio()).await.is_err());
        assert!(!hv.has_secret(&secret_uuid_for("vol-1")));
    }

    #[test]
    fn serial_strips_hyphens_and_truncates() {
        assert_eq!(
            disk_serial("8b2c6a0e-1111-2222-3333-444455556666"),
            "8b2c6a0e111122223333"
        );
        assert_eq!(disk_serial("abc"), "abc");
    }

    #[test]
    fn secret_uuid_is_stable_per_path() {
        let a = secret_uuid_for("/mnt/pool/vol-1");
        assert_eq!(a, secret_uuid_for("/mnt/pool/vol-1"));
        assert_ne!(a, secret_uuid_for("/mnt/pool/vol-2"));
        assert_eq!(uuid::Uuid::parse_str(&a).unwrap().get_version_num(), 3);
    }
}
