//! Live snapshot merge.
//!
//! Drives an active block commit to completion:
//!
//! ```text
//! INIT -> MERGE_REQUESTED -> RUNNING -> COMPLETED | FAILED | TIMED_OUT -> CLEANUP -> DONE
//! ```
//!
//! One merge runs per domain at a time. The completion listener is
//! registered before the commit is issued, and is removed (with the
//! per-domain permit released) exactly once on every exit path by
//! [`MergeGuard`]'s `Drop`.
//!
//! While waiting, the job's state is also read back from the hypervisor, once
//! right after the commit starts and then every poll interval. A job that
//! became ready or finished before the listener's subscription was live is
//! resolved from that state instead of waiting out the timeout.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hvagent_core::command::MergeSnapshot;
use hvagent_core::{CapabilitySnapshot, DomainName};
use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::AgentConfig;
use crate::error::{AgentError, NativeError};
use crate::native::{BlockCommitFlags, BlockJobOutcome, Domain, HypervisorConnection, ListenerId};

/// Default spacing between job state reads while a merge waits.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Stage of a merge, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeState {
    Init,
    MergeRequested,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cleanup,
    Done,
}

impl fmt::Display for MergeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::MergeRequested => "MERGE_REQUESTED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED_OUT",
            Self::Cleanup => "CLEANUP",
            Self::Done => "DONE",
        };
        f.write_str(s)
    }
}

/// Per-domain merge permits.
///
/// Permits are created on first use and never removed, so two callers can
/// never end up holding distinct permits for the same domain.
#[derive(Debug, Default)]
pub struct PermitRegistry {
    permits: Mutex<HashMap<DomainName, Arc<Mutex<()>>>>,
}

impl PermitRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the permit of `domain`.
    pub async fn acquire(&self, domain: &DomainName) -> OwnedMutexGuard<()> {
        let permit = {
            let mut permits = self.permits.lock().await;
            Arc::clone(permits.entry(domain.clone()).or_default())
        };
        permit.lock_owned().await
    }

    /// Number of domains that have ever held a permit.
    pub async fn len(&self) -> usize {
        self.permits.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// One block-commit request, alive for the duration of a single merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockCommitJob {
    pub domain: DomainName,
    pub disk_label: String,
    pub base: PathBuf,
    pub top: PathBuf,
    pub bandwidth_mib: u64,
    pub flags: BlockCommitFlags,
}

impl BlockCommitJob {
    /// Build the job for a request. DELETE is only set when the installed
    /// library honours it; otherwise the coordinator removes the top layer.
    #[must_use]
    pub fn new(request: &MergeSnapshot, caps: &CapabilitySnapshot, bandwidth_mib: u64) -> Self {
        let mut flags = BlockCommitFlags::ACTIVE;
        if caps.features.commit_delete {
            flags |= BlockCommitFlags::DELETE;
        }
        Self {
            domain: request.domain.clone(),
            disk_label: request.disk_label.clone(),
            base: request.base_path.clone(),
            top: request.top_path.clone(),
            bandwidth_mib,
            flags,
        }
    }

    /// Whether the library deletes the top layer itself.
    #[must_use]
    pub fn deletes_in_library(&self) -> bool {
        self.flags.contains(BlockCommitFlags::DELETE)
    }
}

/// Result of a successful merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeReport {
    pub deleted_by_library: bool,
}

/// Holds the listener registration and the domain permit for one merge and
/// releases both when dropped.
struct MergeGuard {
    domain: Arc<dyn Domain>,
    disk: String,
    listener: Option<ListenerId>,
    state: MergeState,
    _permit: OwnedMutexGuard<()>,
}

impl MergeGuard {
    fn advance(&mut self, next: MergeState) {
        tracing::info!(
            domain = %self.domain.name(),
            disk = %self.disk,
            from = %self.state,
            to = %next,
            "merge state"
        );
        self.state = next;
    }
}

impl Drop for MergeGuard {
    fn drop(&mut self) {
        if self.state != MergeState::Cleanup {
            self.advance(MergeState::Cleanup);
        }
        if let Some(id) = self.listener.take() {
            self.domain.remove_block_job_listener(id);
        }
        self.advance(MergeState::Done);
    }
}

/// Runs live merges with per-domain exclusivity.
#[derive(Debug)]
pub struct MergeCoordinator {
    permits: PermitRegistry,
    timeout: Duration,
    poll_interval: Duration,
    bandwidth_mib: u64,
}

impl MergeCoordinator {
    /// A coordinator bounding permit acquisition and job completion by `timeout` each.
    #[must_use]
    pub fn new(timeout: Duration, bandwidth_mib: u64) -> Self {
        Self {
            permits: PermitRegistry::new(),
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            bandwidth_mib,
        }
    }

    /// Read the job state back every `interval` while waiting for its outcome.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(10));
        self
    }

    #[must_use]
    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.merge_timeout(), config.block_commit_bandwidth_mib)
            .with_poll_interval(config.merge_poll_interval())
    }

    /// The shared permit registry.
    #[must_use]
    pub fn permits(&self) -> &PermitRegistry {
        &self.permits
    }

    /// Merge `request.top_path` into `request.base_path` on a running domain.
    ///
    /// # Errors
    /// - [`AgentError::MergeTimeout`] if the permit or the job outcome does not
    ///   arrive in time. The native job is not cancelled.
    /// - [`AgentError::MergeFailed`] if the job cannot be started, fails, or
    ///   is cancelled.
    /// - [`AgentError::NativeLibrary`] if the domain or listener cannot be set up.
    /// - [`AgentError::Cleanup`] if the merged top layer cannot be removed.
    pub async fn merge(
        &self,
        conn: &dyn HypervisorConnection,
        caps: &CapabilitySnapshot,
        request: &MergeSnapshot,
    ) -> Result<MergeReport, AgentError> {
        let job = BlockCommitJob::new(request, caps, self.bandwidth_mib);
        tracing::info!(
            domain = %job.domain,
            disk = %job.disk_label,
            state = %MergeState::Init,
            delete_in_library = job.deletes_in_library(),
            "merge requested"
        );

        let permit = tokio::time::timeout(self.timeout, self.permits.acquire(&job.domain))
            .await
            .map_err(|_| self.timed_out(&job, "merge permit"))?;

        let domain = conn.lookup_domain(&job.domain).await?;
        let listener = domain.register_block_job_listener(&job.disk_label).await?;
        let mut guard = MergeGuard {
            domain: Arc::clone(&domain),
            disk: job.disk_label.clone(),
            listener: Some(listener.id),
            state: MergeState::Init,
            _permit: permit,
        };

        guard.advance(MergeState::MergeRequested);
        let outcome = match domain
            .block_commit(&job.disk_label, &job.base, &job.top, job.bandwidth_mib, job.flags)
            .await
        {
            Ok(()) => {
                guard.advance(MergeState::Running);
                self.await_outcome(domain.as_ref(), &job, listener.outcome).await
            }
            Err(e) => Err(failed(&job, e.to_string())),
        };

        match &outcome {
            Ok(()) => guard.advance(MergeState::Completed),
            Err(AgentError::MergeTimeout { .. }) => guard.advance(MergeState::TimedOut),
            Err(_) => guard.advance(MergeState::Failed),
        }
        outcome?;

        guard.advance(MergeState::Cleanup);
        if !job.deletes_in_library() {
            remove_top_layer(&job.top).await?;
        }

        Ok(MergeReport { deleted_by_library: job.deletes_in_library() })
    }

    async fn await_outcome(
        &self,
        domain: &dyn Domain,
        job: &BlockCommitJob,
        outcome: oneshot::Receiver<BlockJobOutcome>,
    ) -> Result<(), AgentError> {
        let deadline = Instant::now() + self.timeout;
        let event = tokio::time::timeout_at(deadline, async {
            tokio::select! {
                event = outcome => event.ok(),
                polled = self.poll_job(domain, job) => Some(polled),
            }
        })
        .await
        .map_err(|_| self.timed_out(job, "block job completion"))?;

        match event {
            Some(BlockJobOutcome::Completed) => Ok(()),
            Some(BlockJobOutcome::Ready) => {
                tracing::debug!(domain = %job.domain, disk = %job.disk_label, "active commit ready; pivoting");
                tokio::time::timeout_at(deadline, domain.block_job_pivot(&job.disk_label))
                    .await
                    .map_err(|_| self.timed_out(job, "block job pivot"))?
                    .map_err(|e| failed(job, e.to_string()))
            }
            Some(BlockJobOutcome::Failed(reason)) => Err(failed(job, reason)),
            Some(BlockJobOutcome::Cancelled) => Err(failed(job, "block job was cancelled".to_owned())),
            None => Err(failed(
                job,
                NativeError::ListenerClosed {
                    domain: job.domain.clone(),
                    disk: job.disk_label.clone(),
                }
                .to_string(),
            )),
        }
    }

    /// Resolves once the job's own state is terminal.
    async fn poll_job(&self, domain: &dyn Domain, job: &BlockCommitJob) -> BlockJobOutcome {
        let mut ticks = tokio::time::interval(self.poll_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            if let Some(outcome) = job_state(domain, job).await {
                tracing::debug!(domain = %job.domain, disk = %job.disk_label, ?outcome, "block job state read back");
                return outcome;
            }
        }
    }

    fn timed_out(&self, job: &BlockCommitJob, stage: &'static str) -> AgentError {
        tracing::warn!(
            domain = %job.domain,
            disk = %job.disk_label,
            stage,
            timeout_secs = self.timeout.as_secs(),
            "merge timed out"
        );
        AgentError::MergeTimeout {
            domain: job.domain.clone(),
            disk: job.disk_label.clone(),
            stage,
            after: self.timeout,
        }
    }
}

/// Terminal outcome implied by the job's current state, `None` while it runs
/// or when the state cannot be read.
///
/// An active commit that is gone has either pivoted onto the base layer or
/// ended without doing so; the disk's current source tells which.
async fn job_state(domain: &dyn Domain, job: &BlockCommitJob) -> Option<BlockJobOutcome> {
    let progress = match domain.block_job_info(&job.disk_label).await {
        Ok(progress) => progress,
        Err(e) => {
            tracing::debug!(domain = %job.domain, disk = %job.disk_label, error = %e, "block job info unavailable");
            return None;
        }
    };
    match progress {
        Some(p) if p.is_ready() => Some(BlockJobOutcome::Ready),
        Some(_) => None,
        None => match domain.disk_source(&job.disk_label).await {
            Ok(Some(source)) if source == job.base => Some(BlockJobOutcome::Completed),
            Ok(source) => Some(BlockJobOutcome::Failed(format!(
                "block job ended with {} still backed by {}",
                job.disk_label,
                source.map_or_else(|| "no image".to_owned(), |p| p.display().to_string()),
            ))),
            Err(e) => {
                tracing::debug!(domain = %job.domain, disk = %job.disk_label, error = %e, "disk source unavailable");
                None
            }
        },
    }
}

fn failed(job: &BlockCommitJob, reason: String) -> AgentError {
    AgentError::MergeFailed { domain: job.domain.clone(), disk: job.disk_label.clone(), reason }
}

/// Remove a merged snapshot layer. A file that is already gone counts as removed.
///
/// # Errors
/// Returns [`AgentError::Cleanup`] for any other I/O failure.
pub async fn remove_top_layer(path: &Path) -> Result<(), AgentError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "snapshot layer already absent");
            Ok(())
        }
        Err(source) => Err(AgentError::Cleanup { path: path.to_owned(), source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hvagent_core::{CgroupVersion, Version};

    fn request() -> MergeSnapshot {
        MergeSnapshot {
            domain: "i-2-17-VM".into(),
            disk_label: "vda".to_owned(),
            base_path: PathBuf::from("/mnt/p1/base.qcow2"),
            top_path: PathBuf::from("/mnt/p1/snap.qcow2"),
        }
    }

    #[test]
    fn delete_flag_follows_library_version() {
        let new = CapabilitySnapshot::new(Some(Version::new(6, 6, 0)), None, CgroupVersion::V1, 4);
        let old = CapabilitySnapshot::new(Some(Version::new(6, 5, 0)), None, CgroupVersion::V1, 4);

        let job = BlockCommitJob::new(&request(), &new, 0);
        assert_eq!(job.flags, BlockCommitFlags::ACTIVE | BlockCommitFlags::DELETE);

        let job = BlockCommitJob::new(&request(), &old, 0);
        assert_eq!(job.flags, BlockCommitFlags::ACTIVE);
        assert!(!job.deletes_in_library());

        let job = BlockCommitJob::new(&request(), &CapabilitySnapshot::conservative(4), 0);
        assert!(!job.deletes_in_library(), "unknown library must not use DELETE");
    }

    #[tokio::test]
    async fn registry_hands_out_one_permit_per_domain() {
        let registry = PermitRegistry::new();
        let a: DomainName = "a".into();
        let held = registry.acquire(&a).await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), registry.acquire(&a)).await;
        assert!(blocked.is_err(), "second acquire must wait");

        let other = tokio::time::timeout(Duration::from_millis(50), registry.acquire(&"b".into())).await;
        assert!(other.is_ok(), "other domains are independent");

        drop(held);
        let again = tokio::time::timeout(Duration::from_millis(50), registry.acquire(&a)).await;
        assert!(again.is_ok());
        assert_eq!(registry.len().await, 2, "permits are never pruned");
    }

    #[tokio::test]
    async fn remove_top_layer_tolerates_absence() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        };
        let path = dir.path().join("snap.qcow2");
        if let Err(e) = std::fs::write(&path, b"qcow") {
            panic!("write: {e}");
        }
        assert!(remove_top_layer(&path).await.is_ok());
        assert!(!path.exists());
        assert!(remove_top_layer(&path).await.is_ok(), "second removal is a no-op");
    }

    #[tokio::test]
    async fn remove_top_layer_reports_other_failures() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        };
        // a directory cannot be removed with remove_file
        match remove_top_layer(dir.path()).await {
            Err(AgentError::Cleanup { path, .. }) => assert_eq!(path, dir.path()),
            other => panic!("expected cleanup error, got {other:?}"),
        }
    }

    #[test]
    fn states_render_in_upper_snake_case() {
        assert_eq!(MergeState::MergeRequested.to_string(), "MERGE_REQUESTED");
        assert_eq!(MergeState::TimedOut.to_string(), "TIMED_OUT");
    }
}
