//! Hypervisor client backed by the `virsh` command-line tool.
//!
//! Every call shells out to `virsh -c <uri>`; output is parsed into the
//! typed results of [`crate::native`]. Block-job listeners run a
//! `virsh event --loop` child per registration; job state can also be read
//! directly with `blockjob --info`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use hvagent_core::DomainName;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::NativeError;
use crate::native::{
    BlockCommitFlags, BlockJobListener, BlockJobOutcome, BlockJobProgress, BlockStats, Domain, DomainInfo,
    DomainState, HypervisorConnection, InterfaceStats, ListenerId, MemoryStats, SchedulerParams,
    VcpuInfo, XmlDescFlags,
};
use crate::process;

/// Shared state of all handles created from one connection.
#[derive(Debug)]
struct VirshClient {
    virsh: PathBuf,
    uri: String,
    timeout: Duration,
    next_listener: AtomicU64,
    listeners: std::sync::Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl VirshClient {
    async fn run(&self, args: &[&str]) -> Result<String, NativeError> {
        let mut full = Vec::with_capacity(args.len() + 2);
        full.extend_from_slice(&["-c", self.uri.as_str()]);
        full.extend_from_slice(args);
        process::run(&self.virsh, &full, self.timeout).await
    }
}

/// Connection to a libvirt daemon through `virsh`.
///
/// Cheap to clone; every clone shares the same listener table.
#[derive(Debug, Clone)]
pub struct VirshConnection {
    client: Arc<VirshClient>,
}

impl VirshConnection {
    /// Create a connection. Nothing is executed until the first call.
    #[must_use]
    pub fn new(virsh: PathBuf, uri: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Arc::new(VirshClient {
                virsh,
                uri: uri.into(),
                timeout,
                next_listener: AtomicU64::new(1),
                listeners: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Verify the `virsh` binary can be found.
    ///
    /// # Errors
    /// Returns [`NativeError::ClientNotFound`] if it cannot.
    pub fn check_binary(&self) -> Result<(), NativeError> {
        process::which_binary(&self.client.virsh)
    }

    fn domain(&self, name: DomainName) -> Arc<dyn Domain> {
        Arc::new(VirshDomain { name, client: Arc::clone(&self.client) })
    }
}

#[async_trait]
impl HypervisorConnection for VirshConnection {
    async fn lookup_domain(&self, name: &DomainName) -> Result<Arc<dyn Domain>, NativeError> {
        match self.client.run(&["domuuid", "--domain", name.as_str()]).await {
            Ok(_) => Ok(self.domain(name.clone())),
            Err(NativeError::CallFailed { stderr, .. }) if is_missing_domain(&stderr) => {
                Err(NativeError::DomainNotFound(name.clone()))
            }
            Err(e) => Err(e),
        }
    }

    async fn create_domain(&self, xml: &str) -> Result<Arc<dyn Domain>, NativeError> {
        let path = std::env::temp_dir().join(format!("hvagent-{}.xml", Uuid::new_v4()));
        tokio::fs::write(&path, xml).await?;
        let path_arg = path.display().to_string();
        let result = self.client.run(&["create", "--file", path_arg.as_str()]).await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::debug!(path = %path.display(), error = %e, "failed to remove domain XML");
        }
        let name = parse_created_name(&result?)?;
        tracing::info!(domain = %name, "domain created");
        Ok(self.domain(name))
    }

    async fn is_alive(&self) -> Result<(), NativeError> {
        self.client.run(&["uri"]).await.map(|_| ())
    }
}

/// A domain reached through `virsh`.
#[derive(Debug)]
pub struct VirshDomain {
    name: DomainName,
    client: Arc<VirshClient>,
}

impl VirshDomain {
    async fn run(&self, command: &str, extra: &[&str]) -> Result<String, NativeError> {
        let mut args = vec![command, "--domain", self.name.as_str()];
        args.extend_from_slice(extra);
        match self.client.run(&args).await {
            Err(NativeError::CallFailed { stderr, .. }) if is_missing_domain(&stderr) => {
                Err(NativeError::DomainNotFound(self.name.clone()))
            }
            other => other,
        }
    }
}

#[async_trait]
impl Domain for VirshDomain {
    fn name(&self) -> &DomainName {
        &self.name
    }

    async fn shutdown(&self) -> Result<(), NativeError> {
        self.run("shutdown", &[]).await.map(|_| ())
    }

    async fn destroy(&self) -> Result<(), NativeError> {
        self.run("destroy", &[]).await.map(|_| ())
    }

    async fn block_commit(
        &self,
        disk: &str,
        base: &Path,
        top: &Path,
        bandwidth_mib: u64,
        flags: BlockCommitFlags,
    ) -> Result<(), NativeError> {
        let base = base.display().to_string();
        let top = top.display().to_string();
        let bandwidth = bandwidth_mib.to_string();
        let mut args = vec!["--path", disk, "--base", base.as_str(), "--top", top.as_str()];
        if flags.contains(BlockCommitFlags::ACTIVE) {
            args.push("--active");
        }
        if flags.contains(BlockCommitFlags::DELETE) {
            args.push("--delete");
        }
        if flags.contains(BlockCommitFlags::SHALLOW) {
            args.push("--shallow");
        }
        if flags.contains(BlockCommitFlags::RELATIVE) {
            args.push("--keep-relative");
        }
        if bandwidth_mib > 0 {
            args.extend_from_slice(&["--bandwidth", bandwidth.as_str()]);
        }
        tracing::info!(domain = %self.name, disk, flags = flags.bits(), "starting block commit");
        self.run("blockcommit", &args).await.map(|_| ())
    }

    async fn block_job_pivot(&self, disk: &str) -> Result<(), NativeError> {
        self.run("blockjob", &["--path", disk, "--pivot"]).await.map(|_| ())
    }

    async fn register_block_job_listener(
        &self,
        disk: &str,
    ) -> Result<BlockJobListener, NativeError> {
        // `virsh event` does not acknowledge its subscription; events that fire
        // before it is live are recovered through `block_job_info`.
        let mut child = Command::new(&self.client.virsh)
            .args(["-c", self.client.uri.as_str(), "event", "--domain", self.name.as_str()])
            .args(["--event", "block-job-2", "--loop"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| NativeError::Spawn { command: "virsh event".to_owned(), reason: e.to_string() })?;

        let stdout = child.stdout.take().ok_or_else(|| NativeError::Spawn {
            command: "virsh event".to_owned(),
            reason: "stdout not captured".to_owned(),
        })?;

        let (tx, rx) = oneshot::channel();
        let id = self.client.next_listener.fetch_add(1, Ordering::Relaxed);
        let domain = self.name.clone();
        let disk = disk.to_owned();

        let task = tokio::spawn(async move {
            let _child = child;
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(outcome) = parse_block_job_event(&line, &disk) {
                    tracing::debug!(domain = %domain, disk = %disk, ?outcome, "block job event");
                    let _ = tx.send(outcome);
                    return;
                }
            }
            tracing::warn!(domain = %domain, disk = %disk, "block job event stream ended");
        });

        self.client
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, task);

        Ok(BlockJobListener { id: ListenerId(id), outcome: rx })
    }

    fn remove_block_job_listener(&self, id: ListenerId) {
        let task = self
            .client
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id.0);
        if let Some(task) = task {
            task.abort();
        }
    }

    async fn block_job_info(&self, disk: &str) -> Result<Option<BlockJobProgress>, NativeError> {
        parse_block_job_info(&self.run("blockjob", &["--path", disk, "--info", "--raw"]).await?)
    }

    async fn disk_source(&self, disk: &str) -> Result<Option<PathBuf>, NativeError> {
        parse_disk_source(&self.run("domblklist", &[]).await?, disk)
    }

    async fn xml_desc(&self, flags: XmlDescFlags) -> Result<String, NativeError> {
        let mut args = Vec::new();
        if flags.contains(XmlDescFlags::SECURE) {
            args.push("--security-info");
        }
        if flags.contains(XmlDescFlags::INACTIVE) {
            args.push("--inactive");
        }
        if flags.contains(XmlDescFlags::UPDATE_CPU) {
            args.push("--update-cpu");
        }
        if flags.contains(XmlDescFlags::MIGRATABLE) {
            args.push("--migratable");
        }
        self.run("dumpxml", &args).await
    }

    async fn info(&self) -> Result<DomainInfo, NativeError> {
        parse_dominfo(&self.run("dominfo", &[]).await?)
    }

    async fn vcpus_info(&self) -> Result<Vec<VcpuInfo>, NativeError> {
        parse_vcpuinfo(&self.run("vcpuinfo", &[]).await?)
    }

    async fn scheduler_parameters(&self) -> Result<SchedulerParams, NativeError> {
        Ok(parse_schedinfo(&self.run("schedinfo", &[]).await?))
    }

    async fn set_scheduler_parameters(&self, params: &SchedulerParams) -> Result<(), NativeError> {
        let mut settings = Vec::new();
        if let Some(shares) = params.cpu_shares {
            settings.push(format!("cpu_shares={shares}"));
        }
        if let Some(period) = params.vcpu_period {
            settings.push(format!("vcpu_period={period}"));
        }
        if let Some(quota) = params.vcpu_quota {
            settings.push(format!("vcpu_quota={quota}"));
        }
        if settings.is_empty() {
            return Ok(());
        }
        let mut args = vec!["--live", "--set"];
        args.extend(settings.iter().map(String::as_str));
        self.run("schedinfo", &args).await.map(|_| ())
    }

    async fn memory_stats(&self) -> Result<MemoryStats, NativeError> {
        let raw = self.run("dommemstat", &[]).await?;
        let values = parse_pairs(&raw);
        Ok(MemoryStats {
            actual_kib: values.get("actual").copied().unwrap_or(0),
            unused_kib: values.get("unused").copied(),
            available_kib: values.get("available").copied(),
            rss_kib: values.get("rss").copied().unwrap_or(0),
        })
    }

    async fn interface_stats(&self, device: &str) -> Result<InterfaceStats, NativeError> {
        let raw = self.run("domifstat", &["--interface", device]).await?;
        let values = parse_pairs(&raw);
        Ok(InterfaceStats {
            rx_bytes: values.get("rx_bytes").copied().unwrap_or(0),
            rx_packets: values.get("rx_packets").copied().unwrap_or(0),
            tx_bytes: values.get("tx_bytes").copied().unwrap_or(0),
            tx_packets: values.get("tx_packets").copied().unwrap_or(0),
        })
    }

    async fn block_stats(&self, device: &str) -> Result<BlockStats, NativeError> {
        let raw = self.run("domblkstat", &["--device", device]).await?;
        let values = parse_pairs(&raw);
        Ok(BlockStats {
            read_ops: values.get("rd_req").copied().unwrap_or(0),
            read_bytes: values.get("rd_bytes").copied().unwrap_or(0),
            write_ops: values.get("wr_req").copied().unwrap_or(0),
            write_bytes: values.get("wr_bytes").copied().unwrap_or(0),
        })
    }
}

fn is_missing_domain(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("domain not found") || stderr.contains("failed to get domain")
}

/// Name from `Domain 'x' created from /tmp/y.xml`.
fn parse_created_name(output: &str) -> Result<DomainName, NativeError> {
    output
        .lines()
        .find_map(|l| l.trim().strip_prefix("Domain ")?.split(" created").next().map(str::to_owned))
        .map(|name| DomainName::new(name.trim_matches('\'')))
        .filter(|name| !name.as_str().is_empty())
        .ok_or_else(|| NativeError::Parse { what: "virsh create output", reason: output.trim().to_owned() })
}

/// Interpret a `virsh event` line such as
/// `event 'block-job-2' for domain 'i-1': Active Block Commit for vda ready`.
#[must_use]
pub fn parse_block_job_event(line: &str, disk: &str) -> Option<BlockJobOutcome> {
    if !line.contains("block-job") {
        return None;
    }
    let (_, detail) = line.split_once("': ").or_else(|| line.split_once(": "))?;
    let mut words = detail.split_whitespace().rev();
    let status = words.next()?;
    let target = words.next()?;
    if target != disk {
        return None;
    }
    match status {
        "ready" => Some(BlockJobOutcome::Ready),
        "completed" => Some(BlockJobOutcome::Completed),
        "failed" => Some(BlockJobOutcome::Failed(detail.trim().to_owned())),
        "canceled" | "cancelled" => Some(BlockJobOutcome::Cancelled),
        _ => None,
    }
}

/// `vda: type=Active Block Commit bandwidth=0 cur=1048576 end=1048576`.
/// `--raw` prints nothing when the disk has no job.
fn parse_block_job_info(raw: &str) -> Result<Option<BlockJobProgress>, NativeError> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with("No current block job") {
        return Ok(None);
    }
    let value = |key: &str| {
        raw.split_whitespace()
            .find_map(|word| word.strip_prefix(key))
            .and_then(|v| v.parse::<u64>().ok())
    };
    match (value("cur="), value("end=")) {
        (Some(cur), Some(end)) => Ok(Some(BlockJobProgress { cur, end })),
        _ => Err(NativeError::Parse { what: "blockjob info", reason: raw.to_owned() }),
    }
}

/// Source column of `disk` in a `domblklist` table; `-` is an empty drive.
fn parse_disk_source(raw: &str, disk: &str) -> Result<Option<PathBuf>, NativeError> {
    raw.lines()
        .find_map(|line| {
            let mut cols = line.split_whitespace();
            (cols.next()? == disk).then(|| cols.collect::<Vec<_>>().join(" "))
        })
        .map(|source| (!source.is_empty() && source != "-").then(|| PathBuf::from(source)))
        .ok_or_else(|| NativeError::Parse { what: "domblklist", reason: format!("no disk '{disk}'") })
}

/// `Key:   value` lines, keys lower-cased.
fn parse_fields(raw: &str) -> HashMap<String, String> {
    raw.lines()
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_owned()))
        .collect()
}

/// `key value` or `device key value` lines with numeric values.
fn parse_pairs(raw: &str) -> HashMap<String, u64> {
    raw.lines()
        .filter_map(|l| {
            let mut words = l.split_whitespace().rev();
            let value = words.next()?.parse().ok()?;
            let key = words.next()?;
            Some((key.to_owned(), value))
        })
        .collect()
}

fn parse_state(raw: &str) -> DomainState {
    match raw {
        "running" => DomainState::Running,
        "idle" | "blocked" => DomainState::Blocked,
        "paused" => DomainState::Paused,
        "in shutdown" => DomainState::Shutdown,
        "shut off" => DomainState::Shutoff,
        "crashed" => DomainState::Crashed,
        "pmsuspended" => DomainState::Suspended,
        _ => DomainState::NoState,
    }
}

/// `12.3s` to nanoseconds.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn parse_cpu_time(raw: &str) -> Option<u64> {
    let secs: f64 = raw.trim().trim_end_matches('s').parse().ok()?;
    (secs >= 0.0).then(|| (secs * 1e9).round() as u64)
}

/// `524288 KiB` to KiB.
fn parse_kib(raw: &str) -> Option<u64> {
    raw.split_whitespace().next()?.parse().ok()
}

fn parse_dominfo(raw: &str) -> Result<DomainInfo, NativeError> {
    let fields = parse_fields(raw);
    let field = |key: &'static str| {
        fields.get(key).ok_or_else(|| NativeError::Parse {
            what: "dominfo",
            reason: format!("missing '{key}'"),
        })
    };
    let bad = |key: &'static str| NativeError::Parse { what: "dominfo", reason: format!("invalid '{key}'") };

    Ok(DomainInfo {
        state: parse_state(field("state")?),
        max_memory_kib: parse_kib(field("max memory")?).ok_or_else(|| bad("max memory"))?,
        memory_kib: parse_kib(field("used memory")?).ok_or_else(|| bad("used memory"))?,
        vcpus: field("cpu(s)")?.parse().map_err(|_| bad("cpu(s)"))?,
        // shut-off domains report no CPU time
        cpu_time_ns: fields.get("cpu time").and_then(|v| parse_cpu_time(v)).unwrap_or(0),
    })
}

fn parse_vcpuinfo(raw: &str) -> Result<Vec<VcpuInfo>, NativeError> {
    raw.split("\n\n")
        .map(parse_fields)
        .filter(|f| f.contains_key("vcpu"))
        .map(|f| {
            let number = f
                .get("vcpu")
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| NativeError::Parse { what: "vcpuinfo", reason: "invalid 'VCPU'".to_owned() })?;
            Ok(VcpuInfo {
                number,
                physical_cpu: f.get("cpu").and_then(|v| v.parse().ok()),
                cpu_time_ns: f.get("cpu time").and_then(|v| parse_cpu_time(v)).unwrap_or(0),
            })
        })
        .collect()
}

fn parse_schedinfo(raw: &str) -> SchedulerParams {
    let fields = parse_fields(raw);
    SchedulerParams {
        cpu_shares: fields.get("cpu_shares").and_then(|v| v.parse().ok()),
        vcpu_period: fields.get("vcpu_period").and_then(|v| v.parse().ok()),
        vcpu_quota: fields.get("vcpu_quota").and_then(|v| v.parse().ok()),
    }
}
