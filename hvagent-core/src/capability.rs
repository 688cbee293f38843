//! Immutable description of what the host's virtualization stack supports.
//!
//! A [`CapabilitySnapshot`] is produced once by the capability probe and then
//! passed by reference to every component whose behaviour depends on host
//! versions. Refreshing produces a new snapshot; existing ones never change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::version::Version;

/// Minimum libvirt version able to drive `io_uring` disk I/O.
pub const IO_URING_MIN_LIBRARY: Version = Version::new(6, 3, 0);
/// Minimum QEMU version with `io_uring` support.
pub const IO_URING_MIN_EMULATOR: Version = Version::new(5, 0, 0);
/// First QEMU version whose IDE controller handles `discard=unmap` correctly.
pub const IDE_DISCARD_MIN_EMULATOR: Version = Version::new(7, 0, 0);
/// First libvirt version that honours `VIR_DOMAIN_BLOCK_COMMIT_DELETE` on active commits.
pub const COMMIT_DELETE_MIN_LIBRARY: Version = Version::new(6, 6, 0);
/// First libvirt version accepting `VIR_DOMAIN_XML_SECURE` on read-write connections.
pub const SECURE_XML_MIN_LIBRARY: Version = Version::new(1, 0, 0);

/// cgroup hierarchy the host mounts at `/sys/fs/cgroup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CgroupVersion {
    /// Legacy or hybrid hierarchy.
    V1,
    /// Unified hierarchy.
    V2,
}

impl CgroupVersion {
    /// Classifies the filesystem type reported by `stat -fc %T /sys/fs/cgroup/`.
    ///
    /// Only `cgroup2fs` identifies a unified hierarchy; every other answer,
    /// including empty or unrecognised output, is treated as v1.
    #[must_use]
    pub fn from_fs_type(fs_type: &str) -> Self {
        if fs_type.trim() == "cgroup2fs" {
            Self::V2
        } else {
            Self::V1
        }
    }
}

/// Feature flags derived from the detected versions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Disks may use `io='io_uring'`.
    pub io_uring: bool,
    /// Block commit may pass the DELETE flag and rely on libvirt removing the top image.
    pub commit_delete: bool,
    /// IDE disks may use `discard='unmap'`.
    pub ide_discard: bool,
    /// Domain XML may be requested with security-sensitive information.
    pub secure_xml: bool,
}

/// Point-in-time description of the host virtualization stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct CapabilitySnapshot {
    /// Virtualization library (libvirt) version, if detected.
    pub library_version: Option<Version>,
    /// Device emulator (QEMU) version, if detected.
    pub emulator_version: Option<Version>,
    /// cgroup hierarchy version.
    pub cgroup_version: CgroupVersion,
    /// Logical CPUs on the host.
    pub host_cpus: u32,
    /// Flags derived from the versions above.
    pub features: FeatureFlags,
    /// When the probe ran.
    pub probed_at: DateTime<Utc>,
}

impl CapabilitySnapshot {
    /// Build a snapshot and derive its feature flags.
    ///
    /// An undetected version disables every feature gated on it.
    #[must_use]
    pub fn new(
        library_version: Option<Version>,
        emulator_version: Option<Version>,
        cgroup_version: CgroupVersion,
        host_cpus: u32,
    ) -> Self {
        let at_least = |v: Option<Version>, min: Version| v.is_some_and(|v| v >= min);
        let features = FeatureFlags {
            io_uring: at_least(library_version, IO_URING_MIN_LIBRARY)
                && at_least(emulator_version, IO_URING_MIN_EMULATOR),
            commit_delete: at_least(library_version, COMMIT_DELETE_MIN_LIBRARY),
            ide_discard: at_least(emulator_version, IDE_DISCARD_MIN_EMULATOR),
            secure_xml: at_least(library_version, SECURE_XML_MIN_LIBRARY),
        };
        Self {
            library_version,
            emulator_version,
            cgroup_version,
            host_cpus: host_cpus.max(1),
            features,
            probed_at: Utc::now(),
        }
    }

    /// The snapshot assumed when probing fails: nothing detected, every
    /// version-gated feature off, cgroup v1.
    #[must_use]
    pub fn conservative(host_cpus: u32) -> Self {
        Self::new(None, None, CgroupVersion::V1, host_cpus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(lib: u64, emu: u64) -> CapabilitySnapshot {
        CapabilitySnapshot::new(
            Some(Version::from_encoded(lib)),
            Some(Version::from_encoded(emu)),
            CgroupVersion::V1,
            8,
        )
    }

    #[test]
    fn io_uring_requires_both_thresholds() {
        assert!(snapshot(6_003_000, 5_000_000).features.io_uring);
        assert!(!snapshot(6_002_999, 5_000_000).features.io_uring);
        assert!(!snapshot(6_003_000, 4_999_999).features.io_uring);
    }

    #[test]
    fn commit_delete_follows_library_version() {
        assert!(snapshot(6_006_000, 0).features.commit_delete);
        assert!(!snapshot(6_005_999, 9_000_000).features.commit_delete);
    }

    #[test]
    fn conservative_snapshot_disables_everything() {
        let caps = CapabilitySnapshot::conservative(4);
        assert_eq!(caps.features, FeatureFlags::default());
        assert_eq!(caps.cgroup_version, CgroupVersion::V1);
        assert_eq!(caps.host_cpus, 4);
    }

    #[test]
    fn cgroup_fs_type_unknown_output_is_v1() {
        assert_eq!(CgroupVersion::from_fs_type("cgroup2fs\n"), CgroupVersion::V2);
        assert_eq!(CgroupVersion::from_fs_type("tmpfs"), CgroupVersion::V1);
        assert_eq!(CgroupVersion::from_fs_type(""), CgroupVersion::V1);
        assert_eq!(CgroupVersion::from_fs_type("stat: cannot read"), CgroupVersion::V1);
    }
}
