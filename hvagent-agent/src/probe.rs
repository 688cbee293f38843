//! Host capability probe.
//!
//! Detects the libvirt and QEMU versions and the cgroup hierarchy once and
//! folds them into an immutable [`CapabilitySnapshot`]. Probe failures never
//! propagate: whatever could not be detected is treated conservatively.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use hvagent_core::{CapabilitySnapshot, CgroupVersion, Version};

use crate::error::ProbeError;
use crate::process;

/// Raw, unparsed probe output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawCapabilities {
    /// Output of `virsh version`.
    pub version_report: String,
    /// Filesystem type of `/sys/fs/cgroup/`.
    pub cgroup_fs_type: String,
    /// Logical CPUs on the host.
    pub host_cpus: u32,
}

/// Source of raw capability strings.
#[async_trait]
pub trait CapabilitySource: Send + Sync {
    /// Gather the raw probe output.
    ///
    /// # Errors
    /// Returns [`ProbeError::Native`] if the version query cannot be run.
    async fn raw_capabilities(&self) -> Result<RawCapabilities, ProbeError>;
}

/// Probes the host with `virsh version` and `stat -fc %T /sys/fs/cgroup/`.
#[derive(Debug, Clone)]
pub struct VirshCapabilitySource {
    virsh: PathBuf,
    uri: String,
    timeout: Duration,
}

impl VirshCapabilitySource {
    /// Create a probe using the given `virsh` binary and connection URI.
    #[must_use]
    pub fn new(virsh: PathBuf, uri: String, timeout: Duration) -> Self {
        Self { virsh, uri, timeout }
    }
}

#[async_trait]
impl CapabilitySource for VirshCapabilitySource {
    async fn raw_capabilities(&self) -> Result<RawCapabilities, ProbeError> {
        let version_report =
            process::run(&self.virsh, &["-c", self.uri.as_str(), "version"], self.timeout).await?;

        // A failing stat only loses the cgroup hint; v1 is the safe reading.
        let cgroup_fs_type = match process::run(
            Path::new("stat"),
            &["-fc", "%T", "/sys/fs/cgroup/"],
            self.timeout,
        )
        .await
        {
            Ok(out) => out,
            Err(e) => {
                tracing::warn!(error = %e, "cgroup probe failed; assuming cgroup v1");
                String::new()
            }
        };

        Ok(RawCapabilities { version_report, cgroup_fs_type, host_cpus: host_cpus() })
    }
}

/// Run the probe and build a snapshot, falling back to
/// [`CapabilitySnapshot::conservative`] if the source fails.
pub async fn probe(source: &dyn CapabilitySource) -> CapabilitySnapshot {
    match source.raw_capabilities().await {
        Ok(raw) => snapshot_from_raw(&raw),
        Err(e) => {
            tracing::warn!(error = %e, "capability probe failed; using conservative capabilities");
            CapabilitySnapshot::conservative(host_cpus())
        }
    }
}

/// Interpret raw probe output.
///
/// Versions that cannot be parsed are recorded as undetected, which turns
/// off every feature gated on them.
#[must_use]
pub fn snapshot_from_raw(raw: &RawCapabilities) -> CapabilitySnapshot {
    let library = parse_report_line(&raw.version_report, "Using library:")
        .map_err(|e| tracing::warn!(error = %e, "libvirt version not detected"))
        .ok();
    let emulator = parse_report_line(&raw.version_report, "Running hypervisor:")
        .map_err(|e| tracing::warn!(error = %e, "emulator version not detected"))
        .ok();
    let cgroup = CgroupVersion::from_fs_type(&raw.cgroup_fs_type);

    let snapshot = CapabilitySnapshot::new(library, emulator, cgroup, raw.host_cpus);
    tracing::info!(
        library = ?snapshot.library_version.map(|v| v.to_string()),
        emulator = ?snapshot.emulator_version.map(|v| v.to_string()),
        cgroup = ?snapshot.cgroup_version,
        features = ?snapshot.features,
        "host capabilities detected"
    );
    snapshot
}

/// Extract the version from a `virsh version` line such as
/// `Running hypervisor: QEMU 6.2.0`.
///
/// # Errors
/// Returns [`ProbeError::Unrecognised`] if the line is missing or carries no version.
pub fn parse_report_line(report: &str, prefix: &'static str) -> Result<Version, ProbeError> {
    let unrecognised = || ProbeError::Unrecognised { what: prefix, output: report.trim().to_owned() };

    let line = report
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with(prefix))
        .ok_or_else(unrecognised)?;

    line[prefix.len()..]
        .split_whitespace()
        .rev()
        .find_map(|token| token.parse::<Version>().ok())
        .ok_or_else(unrecognised)
}

fn host_cpus() -> u32 {
    std::thread::available_parallelism()
        .map(|n| u32::try_from(n.get()).unwrap_or(u32::MAX))
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NativeError;

    const REPORT: &str = "Compiled against library: libvirt 8.0.0\n\
                          Using library: libvirt 8.0.0\n\
                          Using API: QEMU 8.0.0\n\
                          Running hypervisor: QEMU 6.2.0\n";

    #[test]
    fn parse_report_extracts_both_versions() {
        assert_eq!(
            parse_report_line(REPORT, "Using library:").ok(),
            Some(Version::new(8, 0, 0))
        );
        assert_eq!(
            parse_report_line(REPORT, "Running hypervisor:").ok(),
            Some(Version::new(6, 2, 0))
        );
    }

    #[test]
    fn parse_report_missing_hypervisor_line_is_unrecognised() {
        let report = "Using library: libvirt 8.0.0\n";
        assert!(matches!(
            parse_report_line(report, "Running hypervisor:"),
            Err(ProbeError::Unrecognised { .. })
        ));
    }

    #[test]
    fn snapshot_from_raw_derives_features() {
        let raw = RawCapabilities {
            version_report: REPORT.to_owned(),
            cgroup_fs_type: "cgroup2fs\n".to_owned(),
            host_cpus: 16,
        };
        let caps = snapshot_from_raw(&raw);
        assert_eq!(caps.cgroup_version, CgroupVersion::V2);
        assert!(caps.features.io_uring);
        assert!(caps.features.commit_delete);
        assert!(!caps.features.ide_discard, "QEMU 6.2 predates the IDE discard fix");
    }

    #[test]
    fn garbage_report_disables_version_features() {
        let raw = RawCapabilities {
            version_report: "error: failed to connect to the hypervisor".to_owned(),
            cgroup_fs_type: "tmpfs".to_owned(),
            host_cpus: 4,
        };
        let caps = snapshot_from_raw(&raw);
        assert_eq!(caps.library_version, None);
        assert!(!caps.features.commit_delete);
        assert_eq!(caps.cgroup_version, CgroupVersion::V1);
    }

    struct FailingSource;

    #[async_trait]
    impl CapabilitySource for FailingSource {
        async fn raw_capabilities(&self) -> Result<RawCapabilities, ProbeError> {
            Err(ProbeError::Native(NativeError::ClientNotFound { path: PathBuf::from("virsh") }))
        }
    }

    #[tokio::test]
    async fn probe_failure_yields_conservative_snapshot() {
        let caps = probe(&FailingSource).await;
        assert_eq!(caps.library_version, None);
        assert!(!caps.features.commit_delete, "probe failure must take the non-delete path");
        assert_eq!(caps.cgroup_version, CgroupVersion::V1);
    }
}
