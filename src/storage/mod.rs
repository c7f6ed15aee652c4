// Storage pools, physical disks and the local pool manager

mod activity;
mod resolver;

pub use activity::check_volume_activity;
pub use resolver::{DiskContext, StorageResolver, cdrom_disk, disk_serial, secret_uuid_for};

use crate::error::AgentError;
use crate::models::{DiskFormat, PoolType};
use crate::script::{ScriptRunner, run_expect_silent};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

const QCOW2_MAGIC: [u8; 4] = [b'Q', b'F', b'I', 0xfb];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePool {
    pub uuid: String,
    pub pool_type: PoolType,
    /// Mount point or directory on this host.
    pub local_path: String,
    pub source_host: Option<String>,
    pub source_port: Option<u16>,
    /// Remote export, RBD pool name or Gluster volume.
    pub source_dir: Option<String>,
    pub auth_user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalDisk {
    pub name: String,
    pub path: String,
    pub format: DiskFormat,
    pub size_bytes: u64,
    pub pool: StoragePool,
}

/// Collaborator that knows how volumes map to host paths.
#[async_trait]
pub trait StoragePoolManager: Send + Sync {
    async fn get_physical_disk(
        &self,
        pool_type: PoolType,
        pool_uuid: &str,
        path: &str,
    ) -> Result<PhysicalDisk, AgentError>;

    /// Pool backing a directory URI such as `nfs://host/export/iso`.
    async fn get_storage_pool_by_uri(&self, uri: &str) -> Result<StoragePool, AgentError>;

    async fn copy_physical_disk(
        &self,
        disk: &PhysicalDisk,
        name: &str,
        dest: &StoragePool,
    ) -> Result<PhysicalDisk, AgentError>;

    /// Returns whether anything was disconnected.
    async fn disconnect_physical_disk(
        &self,
        pool_type: PoolType,
        pool_uuid: &str,
        path: &str,
    ) -> Result<bool, AgentError>;

    fn pools(&self) -> Vec<StoragePool>;
}

/// Filesystem-backed pools rooted in configured directories. NFS URIs are mounted
/// on first use under `mount_root/<uuid derived from the URI>`.
pub struct LocalPoolManager {
    pools: DashMap<String, StoragePool>,
    mount_root: PathBuf,
    runner: Arc<dyn ScriptRunner>,
    mount_timeout: Duration,
}

impl LocalPoolManager {
    pub fn new(mount_root: impl Into<PathBuf>, runner: Arc<dyn ScriptRunner>) -> Self {
        Self {
            pools: DashMap::new(),
            mount_root: mount_root.into(),
            runner,
            mount_timeout: Duration::from_secs(60),
        }
    }

    pub fn add_local_pool(&self, uuid: &str, path: &str) {
        self.pools.insert(
            uuid.to_string(),
            StoragePool {
                uuid: uuid.to_string(),
                pool_type: PoolType::Filesystem,
                local_path: path.to_string(),
                source_host: None,
                source_port: None,
                source_dir: None,
                auth_user: None,
            },
        );
    }

    /// Register a pool whose storage lives elsewhere (RBD, Gluster, shared mount).
    pub fn add_pool(&self, pool: StoragePool) {
        self.pools.insert(pool.uuid.clone(), pool);
    }

    fn pool(&self, uuid: &str) -> Result<StoragePool, AgentError> {
        self.pools
            .get(uuid)
            .map(|p| p.value().clone())
            .ok_or_else(|| AgentError::NotFound(format!("storage pool {}", uuid)))
    }

    async fn mount_nfs(&self, host: &str, export: &str) -> Result<StoragePool, AgentError> {
        let uri = format!("nfs://{}{}", host, export);
        let uuid = uuid::Uuid::new_v3(&uuid::Uuid::NAMESPACE_URL, uri.as_bytes()).to_string();
        if let Ok(existing) = self.pool(&uuid) {
            return Ok(existing);
        }
        let mount_point = self.mount_root.join(&uuid);
        tokio::fs::create_dir_all(&mount_point)
            .await
            .map_err(|e| AgentError::operation(format!("unable to create {}: {}", mount_point.display(), e)))?;
        let mount_point_str = mount_point.to_string_lossy().into_owned();
        run_expect_silent(
            self.runner.as_ref(),
            "mount",
            &[
                "-t".to_string(),
                "nfs".to_string(),
                format!("{}:{}", host, export),
                mount_point_str.clone(),
            ],
            self.mount_timeout,
        )
        .await?;
        info!(uri = %uri, mount_point = %mount_point_str, "mounted secondary storage");
        let pool = StoragePool {
            uuid: uuid.clone(),
            pool_type: PoolType::NetworkFilesystem,
            local_path: mount_point_str,
            source_host: Some(host.to_string()),
            source_port: None,
            source_dir: Some(export.to_string()),
            auth_user: None,
        };
        self.pools.insert(uuid, pool.clone());
        Ok(pool)
    }
}

/// Format from the file header: qcow2 magic, `.iso` extension, else raw.
pub async fn sniff_format(path: &Path) -> DiskFormat {
    if path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("iso"))
    {
        return DiskFormat::Iso;
    }
    use tokio::io::AsyncReadExt;
    let mut magic = [0u8; 4];
    match tokio::fs::File::open(path).await {
        Ok(mut f) => match f.read_exact(&mut magic).await {
            Ok(_) if magic == QCOW2_MAGIC => DiskFormat::Qcow2,
            _ => DiskFormat::Raw,
        },
        Err(_) => DiskFormat::Raw,
    }
}

#[async_trait]
impl StoragePoolManager for LocalPoolManager {
    #[instrument(skip(self), fields(component = "storage", operation = "get_physical_disk"))]
    async fn get_physical_disk(
        &self,
        pool_type: PoolType,
        pool_uuid: &str,
        path: &str,
    ) -> Result<PhysicalDisk, AgentError> {
        let pool = self.pool(pool_uuid)?;
        match pool.pool_type {
            PoolType::Rbd | PoolType::Gluster | PoolType::Clvm | PoolType::PowerFlex => {
                // Nothing to stat locally; the device is addressed by name.
                let name = path.rsplit('/').next().unwrap_or(path).to_string();
                return Ok(PhysicalDisk {
                    name,
                    path: path.to_string(),
                    format: if pool.pool_type == PoolType::Gluster {
                        DiskFormat::Qcow2
                    } else {
                        DiskFormat::Raw
                    },
                    size_bytes: 0,
                    pool,
                });
            }
            _ => {}
        }
        let full = if Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            Path::new(&pool.local_path).join(path)
        };
        let meta = tokio::fs::metadata(&full).await.map_err(|e| {
            AgentError::NotFound(format!("volume {} in pool {}: {}", full.display(), pool_uuid, e))
        })?;
        let format = if meta.is_dir() {
            DiskFormat::Dir
        } else {
            sniff_format(&full).await
        };
        debug!(path = %full.display(), ?format, ?pool_type, "found physical disk");
        Ok(PhysicalDisk {
            name: full
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: full.to_string_lossy().into_owned(),
            format,
            size_bytes: meta.len(),
            pool,
        })
    }

    async fn get_storage_pool_by_uri(&self, uri: &str) -> Result<StoragePool, AgentError> {
        let uri = uri.split('?').next().unwrap_or(uri);
        if let Some(rest) = uri.strip_prefix("nfs://") {
            let (host, export) = match rest.find('/') {
                Some(i) => (&rest[..i], &rest[i..]),
                None => (rest, "/"),
            };
            if host.is_empty() {
                return Err(AgentError::configuration(format!("no host in {}", uri)));
            }
            return self.mount_nfs(host, export).await;
        }
        let dir = uri.strip_prefix("file://").unwrap_or(uri);
        if let Some(existing) = self
            .pools
            .iter()
            .find(|p| p.local_path.trim_end_matches('/') == dir.trim_end_matches('/'))
        {
            return Ok(existing.value().clone());
        }
        if !Path::new(dir).is_dir() {
            return Err(AgentError::NotFound(format!("storage directory {}", dir)));
        }
        let uuid = uuid::Uuid::new_v3(&uuid::Uuid::NAMESPACE_URL, dir.as_bytes()).to_string();
        self.add_local_pool(&uuid, dir);
        self.pool(&uuid)
    }

    async fn copy_physical_disk(
        &self,
        disk: &PhysicalDisk,
        name: &str,
        dest: &StoragePool,
    ) -> Result<PhysicalDisk, AgentError> {
        let target = Path::new(&dest.local_path).join(name);
        let bytes = tokio::fs::copy(&disk.path, &target).await.map_err(|e| {
            AgentError::operation(format!(
                "copy {} to {} failed: {}",
                disk.path,
                target.display(),
                e
            ))
        })?;
        Ok(PhysicalDisk {
            name: name.to_string(),
            path: target.to_string_lossy().into_owned(),
            format: disk.format,
            size_bytes: bytes,
            pool: dest.clone(),
        })
    }

    async fn disconnect_physical_disk(
        &self,
        _pool_type: PoolType,
        _pool_uuid: &str,
        _path: &str,
    ) -> Result<bool, AgentError> {
        // Local files stay where they are.
        Ok(false)
    }

    fn pools(&self) -> Vec<StoragePool> {
        let mut pools: Vec<StoragePool> = self.pools.iter().map(|p| p.value().clone()).collect();
        pools.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        pools
    }
}
