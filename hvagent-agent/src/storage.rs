//! Storage pool resolution.
//!
//! The agent does not manage storage; it only asks a resolver where a
//! volume lives and in what format.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use hvagent_core::StoragePoolType;

use crate::config::PoolConfig;
use crate::error::StorageError;

/// Resolved storage pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolHandle {
    pub uuid: String,
    pub pool_type: StoragePoolType,
    /// Mount point, device directory, or network pool name.
    pub root: PathBuf,
    /// Monitor or server for network pools.
    pub source_host: Option<String>,
    pub source_port: Option<u16>,
}

/// Image format of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiskFormat {
    Raw,
    Qcow2,
    Iso,
}

impl DiskFormat {
    /// The libvirt driver type string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw | Self::Iso => "raw",
            Self::Qcow2 => "qcow2",
        }
    }
}

/// A volume resolved to something the hypervisor can open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskHandle {
    /// Host path, or `pool/volume` name for network pools.
    pub path: PathBuf,
    pub format: DiskFormat,
}

/// Storage-resolution capability consumed by the descriptor builder.
pub trait StoragePoolResolver: Send + Sync {
    /// Find a pool by type and UUID.
    ///
    /// # Errors
    /// Returns [`StorageError::PoolNotFound`] if the pool is unknown.
    fn resolve_pool(&self, pool_type: StoragePoolType, uuid: &str)
        -> Result<PoolHandle, StorageError>;

    /// Map a volume path inside `pool` to a physical disk.
    ///
    /// # Errors
    /// Returns [`StorageError::DiskNotFound`] if the volume cannot be mapped.
    fn physical_disk(&self, pool: &PoolHandle, path: &str) -> Result<DiskHandle, StorageError>;
}

/// Resolver over a fixed table of pools, each rooted at a host directory or
/// named network pool.
///
/// Volumes are mapped by joining their path onto the pool root; the format
/// is inferred from the file extension.
#[derive(Debug, Clone, Default)]
pub struct DirectoryPoolResolver {
    pools: BTreeMap<String, PoolConfig>,
}

impl DirectoryPoolResolver {
    /// Create a resolver serving the given pools, keyed by UUID.
    #[must_use]
    pub fn new(pools: BTreeMap<String, PoolConfig>) -> Self {
        Self { pools }
    }
}

impl StoragePoolResolver for DirectoryPoolResolver {
    fn resolve_pool(
        &self,
        pool_type: StoragePoolType,
        uuid: &str,
    ) -> Result<PoolHandle, StorageError> {
        let not_found = || StorageError::PoolNotFound { pool_type, uuid: uuid.to_owned() };
        let pool = self.pools.get(uuid).ok_or_else(not_found)?;
        if pool.pool_type != pool_type {
            return Err(not_found());
        }
        Ok(PoolHandle {
            uuid: uuid.to_owned(),
            pool_type,
            root: pool.path.clone(),
            source_host: pool.source_host.clone(),
            source_port: pool.source_port,
        })
    }

    fn physical_disk(&self, pool: &PoolHandle, path: &str) -> Result<DiskHandle, StorageError> {
        let relative = Path::new(path);
        if path.is_empty() || relative.is_absolute() || path.split('/').any(|c| c == "..") {
            return Err(StorageError::DiskNotFound {
                uuid: pool.uuid.clone(),
                path: path.to_owned(),
                reason: "volume path must be relative to the pool".to_owned(),
            });
        }

        let format = match relative.extension().and_then(|e| e.to_str()) {
            Some("qcow2") => DiskFormat::Qcow2,
            Some("iso") => DiskFormat::Iso,
            _ if pool.pool_type == StoragePoolType::Rbd => DiskFormat::Raw,
            _ if matches!(pool.pool_type, StoragePoolType::Lvm | StoragePoolType::Iscsi) => {
                DiskFormat::Raw
            }
            _ => DiskFormat::Qcow2,
        };

        Ok(DiskHandle { path: pool.root.join(relative), format })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> DirectoryPoolResolver {
        let mut pools = BTreeMap::new();
        pools.insert(
            "p1".to_owned(),
            PoolConfig {
                pool_type: StoragePoolType::NetworkFilesystem,
                path: PathBuf::from("/mnt/p1"),
                source_host: None,
                source_port: None,
            },
        );
        pools.insert(
            "ceph".to_owned(),
            PoolConfig {
                pool_type: StoragePoolType::Rbd,
                path: PathBuf::from("cloudstack"),
                source_host: Some("10.0.0.9".to_owned()),
                source_port: Some(6789),
            },
        );
        DirectoryPoolResolver::new(pools)
    }

    #[test]
    fn resolve_unknown_pool_fails() {
        let r = resolver();
        assert!(matches!(
            r.resolve_pool(StoragePoolType::Filesystem, "nope"),
            Err(StorageError::PoolNotFound { .. })
        ));
    }

    #[test]
    fn resolve_with_wrong_type_fails() {
        let r = resolver();
        assert!(r.resolve_pool(StoragePoolType::Lvm, "p1").is_err());
    }

    #[test]
    fn physical_disk_joins_root_and_infers_format() {
        let r = resolver();
        let pool = match r.resolve_pool(StoragePoolType::NetworkFilesystem, "p1") {
            Ok(p) => p,
            Err(e) => panic!("unexpected error: {e}"),
        };
        let disk = match r.physical_disk(&pool, "vol.qcow2") {
            Ok(d) => d,
            Err(e) => panic!("unexpected error: {e}"),
        };
        assert_eq!(disk.path, PathBuf::from("/mnt/p1/vol.qcow2"));
        assert_eq!(disk.format, DiskFormat::Qcow2);

        let iso = match r.physical_disk(&pool, "boot.iso") {
            Ok(d) => d,
            Err(e) => panic!("unexpected error: {e}"),
        };
        assert_eq!(iso.format, DiskFormat::Iso);
    }

    #[test]
    fn rbd_volumes_are_raw() {
        let r = resolver();
        let pool = match r.resolve_pool(StoragePoolType::Rbd, "ceph") {
            Ok(p) => p,
            Err(e) => panic!("unexpected error: {e}"),
        };
        let disk = match r.physical_disk(&pool, "a1b2c3") {
            Ok(d) => d,
            Err(e) => panic!("unexpected error: {e}"),
        };
        assert_eq!(disk.path, PathBuf::from("cloudstack/a1b2c3"));
        assert_eq!(disk.format, DiskFormat::Raw);
    }

    #[test]
    fn physical_disk_rejects_escaping_paths() {
        let r = resolver();
        let pool = match r.resolve_pool(StoragePoolType::NetworkFilesystem, "p1") {
            Ok(p) => p,
            Err(e) => panic!("unexpected error: {e}"),
        };
        assert!(r.physical_disk(&pool, "../etc/shadow").is_err());
        assert!(r.physical_disk(&pool, "/etc/shadow").is_err());
        assert!(r.physical_disk(&pool, "").is_err());
    }
}
