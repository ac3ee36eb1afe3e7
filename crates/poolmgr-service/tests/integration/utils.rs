use std::sync::Arc;
use std::time::Duration;

use poolmgr_service::config::Config;
use poolmgr_service::pool::{ExecutionPool, PoolKey};
use poolmgr_service::services::PoolManager;
use poolmgr_service::types::Identity;
use poolmgr_test::{FakeOrchestrator, InMemoryMetadataStore};

pub use poolmgr_service::error::ResolveError;

/// A pool manager wired to in-memory collaborators.
pub struct TestService {
    pub manager: PoolManager,
    pub store: Arc<InMemoryMetadataStore>,
    pub orchestrator: Arc<FakeOrchestrator>,
}

impl TestService {
    pub async fn resolve(&self, name: &str, uid: &str) -> Result<String, ResolveError> {
        self.manager
            .resolver()
            .resolve(&Identity::new(name, uid))
            .await
    }

    pub fn python_pool(&self) -> Option<Arc<ExecutionPool>> {
        self.manager
            .resolver()
            .pools()
            .pool(&PoolKey::new("python", "python-env:latest"))
    }
}

/// The configuration used by all tests, before `update_config` is applied.
///
/// Pools start out empty and idle reclamation is disabled.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.pools.warm_instances = 0;
    config.pools.creation_timeout = Duration::from_secs(5);
    config.pools.readiness_interval = Duration::from_millis(10);
    config.pools.readiness_timeout = Duration::from_millis(100);
    config.pools.replenish_backoff = Duration::from_millis(10);
    config.idle.max_idle = None;
    config
}

/// Sets up a pool manager serving the `hello` functions from [`poolmgr_test::hello_world`].
pub fn setup_service(
    orchestrator: FakeOrchestrator,
    update_config: impl FnOnce(&mut Config),
) -> TestService {
    poolmgr_test::setup();

    let mut config = test_config();
    update_config(&mut config);

    let store = poolmgr_test::hello_world();
    let orchestrator = Arc::new(orchestrator);
    let manager = PoolManager::with_collaborators(&config, store.clone(), orchestrator.clone());

    TestService {
        manager,
        store,
        orchestrator,
    }
}
