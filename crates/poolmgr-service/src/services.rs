//! Construction of the pool manager from its configuration.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::fscache::FunctionServiceCache;
use crate::metadata::{ControllerClient, MetadataCache, MetadataStore};
use crate::pool::{HttpOrchestrator, Orchestrator, PoolRegistry};
use crate::resolver::Resolver;

/// All components of the pool manager, wired together.
///
/// Must be created from within a tokio runtime, since it spawns the idle reaper.
#[derive(Debug, Clone)]
pub struct PoolManager {
    resolver: Resolver,
}

impl PoolManager {
    /// Creates a pool manager talking to the controller and the orchestration agent.
    pub fn new(config: &Config) -> Result<Self> {
        let controller_url = config
            .controller_url
            .clone()
            .context("no controller url configured")?;
        let client = reqwest::Client::builder()
            .timeout(config.metadata.fetch_timeout)
            .build()
            .context("failed to create http client")?;
        let store = ControllerClient::new(client, controller_url);

        let orchestrator =
            HttpOrchestrator::new(&config.orchestrator).context("invalid orchestrator config")?;

        Ok(Self::with_collaborators(
            config,
            Arc::new(store),
            Arc::new(orchestrator),
        ))
    }

    /// Creates a pool manager on top of the given metadata store and orchestrator.
    pub fn with_collaborators(
        config: &Config,
        store: Arc<dyn MetadataStore>,
        orchestrator: Arc<dyn Orchestrator>,
    ) -> Self {
        let fscache = FunctionServiceCache::new();
        let metadata = MetadataCache::new(store, &config.metadata);
        let registry = Arc::new(PoolRegistry::new(
            orchestrator,
            fscache.clone(),
            config.pools,
        ));
        registry.spawn_reaper(config.idle);

        let resolver = Resolver::new(metadata, fscache, registry);
        Self { resolver }
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }
}
