//! Shared state handed to every command handler.

use std::sync::Arc;

use hvagent_core::CapabilitySnapshot;
use tokio::sync::RwLock;

use crate::builder::DomainBuilder;
use crate::config::AgentConfig;
use crate::merge::MergeCoordinator;
use crate::native::HypervisorConnection;
use crate::probe::{self, CapabilitySource, VirshCapabilitySource};
use crate::stats::StatsCollector;
use crate::storage::{DirectoryPoolResolver, StoragePoolResolver};
use crate::virsh::VirshConnection;
use crate::vif::VifRegistry;

/// Collaborators and caches shared by all handlers.
///
/// The capability snapshot is swapped whole on refresh; handlers that
/// already hold an `Arc` to the previous snapshot keep using it.
pub struct AgentContext {
    pub config: AgentConfig,
    pub connection: Arc<dyn HypervisorConnection>,
    pub storage: Arc<dyn StoragePoolResolver>,
    pub vifs: VifRegistry,
    pub capability_source: Arc<dyn CapabilitySource>,
    pub stats: StatsCollector,
    pub merges: MergeCoordinator,
    capabilities: RwLock<Arc<CapabilitySnapshot>>,
}

impl AgentContext {
    /// Assemble a context from explicit collaborators.
    #[must_use]
    pub fn new(
        config: AgentConfig,
        connection: Arc<dyn HypervisorConnection>,
        storage: Arc<dyn StoragePoolResolver>,
        vifs: VifRegistry,
        capability_source: Arc<dyn CapabilitySource>,
        capabilities: CapabilitySnapshot,
    ) -> Self {
        let merges = MergeCoordinator::from_config(&config);
        Self {
            config,
            connection,
            storage,
            vifs,
            capability_source,
            stats: StatsCollector::new(),
            merges,
            capabilities: RwLock::new(Arc::new(capabilities)),
        }
    }

    /// Build the production context: `virsh` client, configured storage
    /// pools and bridges, and a freshly probed capability snapshot.
    pub async fn bootstrap(config: AgentConfig) -> Self {
        let connection = VirshConnection::new(
            config.virsh_path.clone(),
            config.connection_uri.clone(),
            config.native_call_timeout(),
        );
        if let Err(e) = connection.check_binary() {
            tracing::warn!(error = %e, "virsh not found; native calls will fail");
        }

        let source: Arc<dyn CapabilitySource> = Arc::new(VirshCapabilitySource::new(
            config.virsh_path.clone(),
            config.connection_uri.clone(),
            config.probe_timeout(),
        ));
        let capabilities = probe::probe(source.as_ref()).await;

        let storage = Arc::new(DirectoryPoolResolver::new(config.pools.clone()));
        let vifs = VifRegistry::with_bridges(&config.bridges);

        tracing::info!(
            uri = %config.connection_uri,
            pools = config.pools.len(),
            max_concurrent_commands = config.max_concurrent_commands,
            "agent context ready"
        );
        Self::new(config, Arc::new(connection), storage, vifs, source, capabilities)
    }

    /// The current capability snapshot.
    pub async fn capabilities(&self) -> Arc<CapabilitySnapshot> {
        Arc::clone(&*self.capabilities.read().await)
    }

    /// Re-probe the host and replace the cached snapshot.
    pub async fn refresh_capabilities(&self) -> Arc<CapabilitySnapshot> {
        let fresh = Arc::new(probe::probe(self.capability_source.as_ref()).await);
        *self.capabilities.write().await = Arc::clone(&fresh);
        fresh
    }

    /// A descriptor builder over this context's collaborators.
    #[must_use]
    pub fn builder(&self) -> DomainBuilder<'_> {
        DomainBuilder::new(&self.config.domain, self.storage.as_ref(), &self.vifs)
    }
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("config", &self.config)
            .field("vifs", &self.vifs)
            .field("merges", &self.merges)
            .finish_non_exhaustive()
    }
}
