//! Hypervisor client abstraction.
//!
//! The agent never talks to libvirt directly; every native call goes through
//! [`HypervisorConnection`] and [`Domain`]. The production implementation
//! drives the `virsh` CLI (see [`crate::virsh`]); tests substitute in-memory
//! fakes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bitflags::bitflags;
use hvagent_core::DomainName;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::NativeError;

bitflags! {
    /// Flags for [`Domain::block_commit`], numerically equal to libvirt's
    /// `virDomainBlockCommitFlags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BlockCommitFlags: u32 {
        /// Only merge the top layer into its immediate backing file.
        const SHALLOW = 1 << 0;
        /// Delete the merged layers once the commit completes.
        const DELETE = 1 << 1;
        /// The top layer is the active image of a running domain.
        const ACTIVE = 1 << 2;
        /// Keep backing-chain references relative.
        const RELATIVE = 1 << 3;
    }
}

bitflags! {
    /// Flags for [`Domain::xml_desc`], numerically equal to libvirt's
    /// `virDomainXMLFlags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct XmlDescFlags: u32 {
        /// Include security-sensitive fields such as the VNC password.
        const SECURE = 1 << 0;
        /// Describe the persistent rather than the live definition.
        const INACTIVE = 1 << 1;
        /// Expand the CPU model to match the host.
        const UPDATE_CPU = 1 << 2;
        /// Emit only what is needed for migration.
        const MIGRATABLE = 1 << 3;
    }
}

/// Run state of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    Suspended,
}

/// Summary returned by [`Domain::info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainInfo {
    pub state: DomainState,
    pub max_memory_kib: u64,
    pub memory_kib: u64,
    pub vcpus: u32,
    /// Cumulative CPU time in nanoseconds.
    pub cpu_time_ns: u64,
}

/// Per-vCPU entry returned by [`Domain::vcpus_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VcpuInfo {
    pub number: u32,
    /// Host CPU the vCPU last ran on.
    pub physical_cpu: Option<u32>,
    pub cpu_time_ns: u64,
}

/// CPU scheduler tunables. `None` leaves a parameter untouched when setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerParams {
    pub cpu_shares: Option<u64>,
    pub vcpu_period: Option<u64>,
    /// Negative values mean unlimited.
    pub vcpu_quota: Option<i64>,
}

/// Balloon statistics, KiB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub actual_kib: u64,
    pub unused_kib: Option<u64>,
    pub available_kib: Option<u64>,
    pub rss_kib: u64,
}

/// Counters of one network interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceStats {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

/// Counters of one block device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockStats {
    pub read_ops: u64,
    pub read_bytes: u64,
    pub write_ops: u64,
    pub write_bytes: u64,
}

/// Terminal event of a block job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockJobOutcome {
    /// The job finished and the chain has been rewritten.
    Completed,
    /// An active commit reached the synchronised phase and awaits a pivot.
    Ready,
    /// The job failed.
    Failed(String),
    /// The job was aborted.
    Cancelled,
}

/// Progress of a running block job, in the job's own units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockJobProgress {
    pub cur: u64,
    pub end: u64,
}

impl BlockJobProgress {
    /// An active commit whose mirror has caught up and awaits a pivot.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.end > 0 && self.cur == self.end
    }
}

/// Identity of a registered block-job listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// A registered block-job listener.
///
/// `outcome` resolves with the first terminal event for the disk the
/// listener was registered for. The listener stays registered until
/// [`Domain::remove_block_job_listener`] is called.
#[derive(Debug)]
pub struct BlockJobListener {
    pub id: ListenerId,
    pub outcome: oneshot::Receiver<BlockJobOutcome>,
}

/// Connection to the host hypervisor.
///
/// Implementations must be `Send + Sync`; a single connection is shared by
/// all concurrently running command handlers.
#[async_trait]
pub trait HypervisorConnection: Send + Sync {
    /// Look up a defined domain by name.
    ///
    /// # Errors
    /// Returns [`NativeError::DomainNotFound`] if no such domain exists.
    async fn lookup_domain(&self, name: &DomainName) -> Result<Arc<dyn Domain>, NativeError>;

    /// Create and boot a transient domain from its XML description.
    ///
    /// # Errors
    /// Returns [`NativeError::CallFailed`] if the hypervisor rejects the definition.
    async fn create_domain(&self, xml: &str) -> Result<Arc<dyn Domain>, NativeError>;

    /// Check that the connection answers.
    ///
    /// # Errors
    /// Returns the underlying client error if the hypervisor is unreachable.
    async fn is_alive(&self) -> Result<(), NativeError>;
}

/// Handle to one domain.
#[async_trait]
pub trait Domain: Send + Sync {
    /// The domain's name.
    fn name(&self) -> &DomainName;

    /// Request a graceful ACPI shutdown.
    async fn shutdown(&self) -> Result<(), NativeError>;

    /// Stop the domain immediately.
    async fn destroy(&self) -> Result<(), NativeError>;

    /// Start merging `top` into `base` on `disk`. Returns once the job is started.
    async fn block_commit(
        &self,
        disk: &str,
        base: &Path,
        top: &Path,
        bandwidth_mib: u64,
        flags: BlockCommitFlags,
    ) -> Result<(), NativeError>;

    /// Finish an active commit that reported [`BlockJobOutcome::Ready`].
    async fn block_job_pivot(&self, disk: &str) -> Result<(), NativeError>;

    /// Register a listener for block-job events on `disk`.
    async fn register_block_job_listener(&self, disk: &str)
        -> Result<BlockJobListener, NativeError>;

    /// Deregister a listener. Unknown ids are ignored.
    fn remove_block_job_listener(&self, id: ListenerId);

    /// Progress of the block job on `disk`; `None` when no job is running.
    async fn block_job_info(&self, disk: &str) -> Result<Option<BlockJobProgress>, NativeError>;

    /// Image currently backing `disk`; `None` for an empty drive.
    async fn disk_source(&self, disk: &str) -> Result<Option<PathBuf>, NativeError>;

    /// The domain XML.
    async fn xml_desc(&self, flags: XmlDescFlags) -> Result<String, NativeError>;

    /// State, memory, and cumulative CPU time.
    async fn info(&self) -> Result<DomainInfo, NativeError>;

    /// Per-vCPU placement and CPU time.
    async fn vcpus_info(&self) -> Result<Vec<VcpuInfo>, NativeError>;

    /// Current scheduler tunables.
    async fn scheduler_parameters(&self) -> Result<SchedulerParams, NativeError>;

    /// Apply the scheduler tunables that are `Some` to the live domain.
    async fn set_scheduler_parameters(&self, params: &SchedulerParams)
        -> Result<(), NativeError>;

    /// Balloon statistics.
    async fn memory_stats(&self) -> Result<MemoryStats, NativeError>;

    /// Counters for the interface with target device `device`.
    async fn interface_stats(&self, device: &str) -> Result<InterfaceStats, NativeError>;

    /// Counters for the disk with target device `device`.
    async fn block_stats(&self, device: &str) -> Result<BlockStats, NativeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_flags_match_libvirt_values() {
        assert_eq!(BlockCommitFlags::DELETE.bits(), 2);
        assert_eq!(BlockCommitFlags::ACTIVE.bits(), 4);
        assert_eq!((BlockCommitFlags::ACTIVE | BlockCommitFlags::DELETE).bits(), 6);
    }

    #[test]
    fn job_is_ready_once_mirror_caught_up() {
        assert!(BlockJobProgress { cur: 4096, end: 4096 }.is_ready());
        assert!(!BlockJobProgress { cur: 1024, end: 4096 }.is_ready());
        assert!(!BlockJobProgress::default().is_ready(), "an empty job has not started copying");
    }

    #[test]
    fn xml_secure_flag_matches_libvirt_value() {
        assert_eq!(XmlDescFlags::SECURE.bits(), 1);
        assert!(XmlDescFlags::empty().is_empty());
    }
}
