//! In-memory hypervisor, storage and probe fakes shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hvagent_agent::config::{AgentConfig, PoolConfig};
use hvagent_agent::error::{NativeError, ProbeError};
use hvagent_agent::native::{
    BlockCommitFlags, BlockJobListener, BlockJobOutcome, BlockJobProgress, BlockStats, Domain, DomainInfo,
    DomainState, HypervisorConnection, InterfaceStats, ListenerId, MemoryStats, SchedulerParams,
    VcpuInfo, XmlDescFlags,
};
use hvagent_agent::probe::{CapabilitySource, RawCapabilities};
use hvagent_agent::storage::DirectoryPoolResolver;
use hvagent_agent::vif::VifRegistry;
use hvagent_agent::AgentContext;
use hvagent_core::samples::SAMPLE_POOL_UUID;
use hvagent_core::{CapabilitySnapshot, CgroupVersion, DomainName, StoragePoolType, Version};
use tokio::sync::oneshot;

/// What a fake block job does once started.
#[derive(Debug, Clone)]
pub enum JobScript {
    /// Report this outcome after the configured delay.
    Report(BlockJobOutcome),
    /// Never report anything.
    Hang,
    /// Drop the event sender without reporting.
    CloseListener,
}

/// Counts block jobs running at once across every fake domain of a connection.
#[derive(Debug, Default)]
pub struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Scriptable domain.
pub struct FakeDomain {
    name: DomainName,
    pub script: Mutex<JobScript>,
    pub job_delay: Duration,
    pub commit_error: Option<String>,
    pub pivot_error: Option<String>,
    pub xml: String,
    in_flight: Arc<InFlight>,
    sender: Arc<Mutex<Option<oneshot::Sender<BlockJobOutcome>>>>,
    next_listener: AtomicU64,
    pub listeners_registered: AtomicUsize,
    pub listeners_removed: AtomicUsize,
    pub pivots: AtomicUsize,
    pub commit_flags: Mutex<Vec<BlockCommitFlags>>,
    pub xml_flags: Mutex<Vec<XmlDescFlags>>,
    pub scheduler: Mutex<Vec<SchedulerParams>>,
    pub lifecycle: Mutex<Vec<&'static str>>,
    /// What `block_job_info` reports; a running, unfinished job by default.
    pub job: Mutex<Option<BlockJobProgress>>,
    /// What `disk_source` reports for every disk.
    pub source: Mutex<Option<PathBuf>>,
    /// Listener registrations and removals in call order.
    pub events: Mutex<Vec<&'static str>>,
    /// Whether `watched` existed at each listener registration.
    pub watched_at_register: Mutex<Vec<bool>>,
    watched: Option<PathBuf>,
    cpu_time_ns: AtomicU64,
}

impl FakeDomain {
    pub fn new(name: &str, in_flight: Arc<InFlight>) -> Self {
        Self {
            name: DomainName::new(name),
            script: Mutex::new(JobScript::Report(BlockJobOutcome::Completed)),
            job_delay: Duration::from_millis(20),
            commit_error: None,
            pivot_error: None,
            xml: format!(
                "<domain><name>{name}</name><devices>\
                 <disk type='file' device='disk'><target dev='vda' bus='virtio'/></disk>\
                 <disk type='file' device='cdrom'><target dev='hdc' bus='ide'/></disk>\
                 <interface type='bridge'><target dev='vnet0'/></interface>\
                 </devices></domain>"
            ),
            in_flight,
            sender: Arc::new(Mutex::new(None)),
            next_listener: AtomicU64::new(1),
            listeners_registered: AtomicUsize::new(0),
            listeners_removed: AtomicUsize::new(0),
            pivots: AtomicUsize::new(0),
            commit_flags: Mutex::new(Vec::new()),
            xml_flags: Mutex::new(Vec::new()),
            scheduler: Mutex::new(Vec::new()),
            lifecycle: Mutex::new(Vec::new()),
            job: Mutex::new(Some(BlockJobProgress { cur: 0, end: 1 << 20 })),
            source: Mutex::new(None),
            events: Mutex::new(Vec::new()),
            watched_at_register: Mutex::new(Vec::new()),
            watched: None,
            cpu_time_ns: AtomicU64::new(0),
        }
    }

    pub fn with_script(self, script: JobScript) -> Self {
        *lock(&self.script) = script;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.job_delay = delay;
        self
    }

    pub fn with_commit_error(mut self, reason: &str) -> Self {
        self.commit_error = Some(reason.to_owned());
        self
    }

    pub fn with_pivot_error(mut self, reason: &str) -> Self {
        self.pivot_error = Some(reason.to_owned());
        self
    }

    pub fn with_job(self, job: Option<BlockJobProgress>) -> Self {
        *lock(&self.job) = job;
        self
    }

    pub fn with_source(self, source: &Path) -> Self {
        *lock(&self.source) = Some(source.to_owned());
        self
    }

    /// Record whether `path` exists each time a listener is registered.
    pub fn watching(mut self, path: &Path) -> Self {
        self.watched = Some(path.to_owned());
        self
    }

    pub fn events(&self) -> Vec<&'static str> {
        lock(&self.events).clone()
    }

    pub fn removed(&self) -> usize {
        self.listeners_removed.load(Ordering::SeqCst)
    }

    pub fn registered(&self) -> usize {
        self.listeners_registered.load(Ordering::SeqCst)
    }
}

/// Locks a std mutex, ignoring poisoning from a panicked test task.
pub fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait]
impl Domain for FakeDomain {
    fn name(&self) -> &DomainName {
        &self.name
    }

    async fn shutdown(&self) -> Result<(), NativeError> {
        lock(&self.lifecycle).push("shutdown");
        Ok(())
    }

    async fn destroy(&self) -> Result<(), NativeError> {
        lock(&self.lifecycle).push("destroy");
        Ok(())
    }

    async fn block_commit(
        &self,
        _disk: &str,
        _base: &Path,
        _top: &Path,
        _bandwidth_mib: u64,
        flags: BlockCommitFlags,
    ) -> Result<(), NativeError> {
        lock(&self.commit_flags).push(flags);
        if let Some(reason) = &self.commit_error {
            return Err(NativeError::CallFailed {
                command: "blockcommit".to_owned(),
                stderr: reason.clone(),
            });
        }

        self.in_flight.enter();
        let script = lock(&self.script).clone();
        let sender = Arc::clone(&self.sender);
        let in_flight = Arc::clone(&self.in_flight);
        let delay = self.job_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match script {
                JobScript::Report(outcome) => {
                    in_flight.leave();
                    if let Some(tx) = lock(&sender).take() {
                        let _ = tx.send(outcome);
                    }
                }
                JobScript::CloseListener => {
                    in_flight.leave();
                    drop(lock(&sender).take());
                }
                JobScript::Hang => {}
            }
        });
        Ok(())
    }

    async fn block_job_pivot(&self, disk: &str) -> Result<(), NativeError> {
        self.pivots.fetch_add(1, Ordering::SeqCst);
        match &self.pivot_error {
            Some(reason) => Err(NativeError::CallFailed {
                command: format!("blockjob --path {disk} --pivot"),
                stderr: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn register_block_job_listener(
        &self,
        _disk: &str,
    ) -> Result<BlockJobListener, NativeError> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.sender) = Some(tx);
        if let Some(path) = &self.watched {
            lock(&self.watched_at_register).push(path.exists());
        }
        lock(&self.events).push("register");
        self.listeners_registered.fetch_add(1, Ordering::SeqCst);
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        Ok(BlockJobListener { id, outcome: rx })
    }

    fn remove_block_job_listener(&self, _id: ListenerId) {
        lock(&self.events).push("remove");
        self.listeners_removed.fetch_add(1, Ordering::SeqCst);
    }

    async fn block_job_info(&self, _disk: &str) -> Result<Option<BlockJobProgress>, NativeError> {
        Ok(*lock(&self.job))
    }

    async fn disk_source(&self, _disk: &str) -> Result<Option<PathBuf>, NativeError> {
        Ok(lock(&self.source).clone())
    }

    async fn xml_desc(&self, flags: XmlDescFlags) -> Result<String, NativeError> {
        lock(&self.xml_flags).push(flags);
        Ok(self.xml.clone())
    }

    async fn info(&self) -> Result<DomainInfo, NativeError> {
        let cpu_time_ns = self.cpu_time_ns.fetch_add(1_000_000_000, Ordering::SeqCst);
        Ok(DomainInfo {
            state: DomainState::Running,
            max_memory_kib: 524_288,
            memory_kib: 262_144,
            vcpus: 2,
            cpu_time_ns,
        })
    }

    async fn vcpus_info(&self) -> Result<Vec<VcpuInfo>, NativeError> {
        Ok(vec![VcpuInfo { number: 0, physical_cpu: Some(0), cpu_time_ns: 0 }])
    }

    async fn scheduler_parameters(&self) -> Result<SchedulerParams, NativeError> {
        Ok(lock(&self.scheduler).last().copied().unwrap_or_default())
    }

    async fn set_scheduler_parameters(&self, params: &SchedulerParams) -> Result<(), NativeError> {
        lock(&self.scheduler).push(*params);
        Ok(())
    }

    async fn memory_stats(&self) -> Result<MemoryStats, NativeError> {
        Err(NativeError::CallFailed {
            command: "dommemstat".to_owned(),
            stderr: "balloon driver not loaded".to_owned(),
        })
    }

    async fn interface_stats(&self, _device: &str) -> Result<InterfaceStats, NativeError> {
        Ok(InterfaceStats { rx_bytes: 4096, rx_packets: 4, tx_bytes: 2048, tx_packets: 2 })
    }

    async fn block_stats(&self, device: &str) -> Result<BlockStats, NativeError> {
        if device != "vda" {
            return Err(NativeError::CallFailed {
                command: "domblkstat".to_owned(),
                stderr: format!("no device {device}"),
            });
        }
        Ok(BlockStats { read_ops: 10, read_bytes: 40_960, write_ops: 5, write_bytes: 20_480 })
    }
}

/// Connection serving a fixed set of fake domains.
#[derive(Default)]
pub struct FakeConnection {
    domains: Mutex<HashMap<DomainName, Arc<FakeDomain>>>,
    pub in_flight: Arc<InFlight>,
    pub created: Mutex<Vec<String>>,
    pub dead: AtomicBool,
}

impl FakeConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh domain sharing this connection's in-flight counter.
    pub fn domain(&self, name: &str) -> FakeDomain {
        FakeDomain::new(name, Arc::clone(&self.in_flight))
    }

    pub fn insert(&self, domain: FakeDomain) -> Arc<FakeDomain> {
        let domain = Arc::new(domain);
        lock(&self.domains).insert(domain.name().clone(), Arc::clone(&domain));
        domain
    }

    pub fn get(&self, name: &str) -> Option<Arc<FakeDomain>> {
        lock(&self.domains).get(&DomainName::new(name)).cloned()
    }
}

#[async_trait]
impl HypervisorConnection for FakeConnection {
    async fn lookup_domain(&self, name: &DomainName) -> Result<Arc<dyn Domain>, NativeError> {
        let found = lock(&self.domains).get(name).cloned();
        match found {
            Some(d) => Ok(d as Arc<dyn Domain>),
            None => Err(NativeError::DomainNotFound(name.clone())),
        }
    }

    async fn create_domain(&self, xml: &str) -> Result<Arc<dyn Domain>, NativeError> {
        let name = xml
            .split_once("<name>")
            .and_then(|(_, rest)| rest.split_once("</name>"))
            .map(|(name, _)| name.to_owned())
            .ok_or_else(|| NativeError::Parse { what: "domain xml", reason: "no name".to_owned() })?;
        lock(&self.created).push(xml.to_owned());
        let domain: Arc<dyn Domain> = self.insert(self.domain(&name));
        Ok(domain)
    }

    async fn is_alive(&self) -> Result<(), NativeError> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(NativeError::CallFailed {
                command: "uri".to_owned(),
                stderr: "failed to connect to the hypervisor".to_owned(),
            });
        }
        Ok(())
    }
}

/// Capability source returning canned probe output.
#[derive(Debug, Clone)]
pub struct FakeProbe {
    pub raw: RawCapabilities,
}

#[async_trait]
impl CapabilitySource for FakeProbe {
    async fn raw_capabilities(&self) -> Result<RawCapabilities, ProbeError> {
        Ok(self.raw.clone())
    }
}

pub fn modern_probe() -> FakeProbe {
    FakeProbe {
        raw: RawCapabilities {
            version_report: "Compiled against library: libvirt 8.0.0\n\
                             Using library: libvirt 8.0.0\n\
                             Using API: QEMU 8.0.0\n\
                             Running hypervisor: QEMU 6.2.0\n"
                .to_owned(),
            cgroup_fs_type: "cgroup2fs".to_owned(),
            host_cpus: 8,
        },
    }
}

/// libvirt 8 / QEMU 7 on cgroup v2: every feature enabled.
pub fn modern_caps() -> CapabilitySnapshot {
    CapabilitySnapshot::new(
        Some(Version::new(8, 0, 0)),
        Some(Version::new(7, 2, 0)),
        CgroupVersion::V2,
        8,
    )
}

/// libvirt 6.0 / QEMU 4.2 on cgroup v1: no version-gated feature.
pub fn legacy_caps() -> CapabilitySnapshot {
    CapabilitySnapshot::new(
        Some(Version::new(6, 0, 0)),
        Some(Version::new(4, 2, 0)),
        CgroupVersion::V1,
        8,
    )
}

/// The sample pool, rooted at `root`.
pub fn sample_pools(root: &Path) -> BTreeMap<String, PoolConfig> {
    let mut pools = BTreeMap::new();
    pools.insert(
        SAMPLE_POOL_UUID.to_owned(),
        PoolConfig {
            pool_type: StoragePoolType::NetworkFilesystem,
            path: root.to_owned(),
            source_host: None,
            source_port: None,
        },
    );
    pools
}

pub fn sample_storage() -> DirectoryPoolResolver {
    DirectoryPoolResolver::new(sample_pools(&PathBuf::from("/mnt/primary")))
}

/// A context over `conn` with the sample pool and default bridges.
pub fn context(conn: Arc<FakeConnection>, caps: CapabilitySnapshot) -> Arc<AgentContext> {
    let mut config = AgentConfig::default();
    config.pools = sample_pools(&PathBuf::from("/mnt/primary"));
    config.max_concurrent_commands = 4;
    let storage = Arc::new(DirectoryPoolResolver::new(config.pools.clone()));
    let vifs = VifRegistry::with_bridges(&config.bridges);
    Arc::new(AgentContext::new(config, conn, storage, vifs, Arc::new(modern_probe()), caps))
}
