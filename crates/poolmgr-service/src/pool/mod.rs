//! Pools of warm instances, one per environment.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use sentry::SentryFutureExt;
use tokio_util::sync::CancellationToken;

use crate::config::{IdleConfig, PoolConfig};
use crate::fscache::FunctionServiceCache;
use crate::types::Environment;

mod execution;
mod orchestrator;

pub use execution::{ExecutionPool, PoolStats};
pub use orchestrator::{HttpOrchestrator, Instance, Orchestrator};

/// Identifies the pool of an environment.
///
/// Changing the image of an environment results in a new pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub environment: String,
    pub image: String,
}

impl PoolKey {
    pub fn new(environment: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            image: image.into(),
        }
    }

    pub fn for_environment(environment: &Environment) -> Self {
        Self::new(&environment.metadata.name, &environment.image)
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.environment, self.image)
    }
}

/// Lazily creates and owns all [`ExecutionPool`]s.
///
/// Pools live as long as the registry. Dropping the registry stops replenishment and the idle
/// reaper.
pub struct PoolRegistry {
    pools: Mutex<HashMap<PoolKey, Arc<ExecutionPool>>>,
    orchestrator: Arc<dyn Orchestrator>,
    fscache: FunctionServiceCache,
    config: PoolConfig,
    shutdown: CancellationToken,
}

impl fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("pools", &self.pools())
            .field("config", &self.config)
            .finish()
    }
}

impl PoolRegistry {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        fscache: FunctionServiceCache,
        config: PoolConfig,
    ) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            orchestrator,
            fscache,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Returns the pool for `environment`, creating it on first use.
    pub fn get_pool(&self, environment: &Arc<Environment>) -> Arc<ExecutionPool> {
        let key = PoolKey::for_environment(environment);
        let mut pools = self.pools.lock().unwrap();
        if let Some(pool) = pools.get(&key) {
            return Arc::clone(pool);
        }

        tracing::info!(environment = %key, "Creating execution pool");
        metric!(counter("pool.created") += 1, "environment" => &key.environment);
        let pool = ExecutionPool::new(
            key.clone(),
            Arc::clone(environment),
            Arc::clone(&self.orchestrator),
            self.fscache.clone(),
            self.config,
            self.shutdown.child_token(),
        );
        pools.insert(key, Arc::clone(&pool));
        pool
    }

    /// Returns an existing pool.
    pub fn pool(&self, key: &PoolKey) -> Option<Arc<ExecutionPool>> {
        self.pools.lock().unwrap().get(key).cloned()
    }

    /// The number of pools.
    pub fn pools(&self) -> usize {
        self.pools.lock().unwrap().len()
    }

    /// Destroys all specialized instances which have not been used for `max_idle`.
    ///
    /// Returns the number of reaped instances.
    pub async fn reap_idle(&self, max_idle: Duration) -> usize {
        let idle = self.fscache.list_idle(max_idle);

        let reaped = idle.into_iter().filter_map(|svc| {
            // skip instances that were re-specialized, evicted or used in the meantime
            let svc = self.fscache.remove_if_idle(&svc.function, svc.address(), max_idle)?;
            let pool = self.pool(&svc.pool)?;
            tracing::info!(
                function = %svc.function,
                address = svc.address(),
                idle = %humantime::format_duration(svc.idle_for()),
                "Reaping idle function service"
            );
            Some(async move { pool.release(&svc).await })
        });
        let count = join_all(reaped.collect::<Vec<_>>()).await.len();

        if count > 0 {
            metric!(counter("fscache.reaped") += count as i64);
        }
        count
    }

    /// Periodically reaps idle instances in the background.
    ///
    /// Does nothing if idle reclamation is disabled.
    pub fn spawn_reaper(self: &Arc<Self>, config: IdleConfig) {
        let Some(max_idle) = config.max_idle else {
            return;
        };

        let registry = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let reaper = async move {
            let mut interval = tokio::time::interval(config.reap_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.cancelled() => return,
                }
                let Some(registry) = registry.upgrade() else {
                    return;
                };
                registry.reap_idle(max_idle).await;
            }
        };
        tokio::spawn(reaper.bind_hub(sentry::Hub::new_from_top(sentry::Hub::current())));
    }

    /// Stops replenishing all pools and tears down their warm instances.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for PoolRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::types::{Function, Identity};

    #[derive(Default)]
    struct CountingOrchestrator {
        created: AtomicUsize,
        destroyed: AtomicUsize,
    }

    #[async_trait]
    impl Orchestrator for CountingOrchestrator {
        async fn create_instance(&self, _environment: &Environment) -> anyhow::Result<Instance> {
            let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Instance {
                id: format!("instance-{n}"),
                address: format!("10.0.0.{n}:8888"),
            })
        }

        async fn inject(&self, _instance: &Instance, _function: &Function) -> anyhow::Result<()> {
            Ok(())
        }

        async fn probe(&self, _instance: &Instance) -> anyhow::Result<()> {
            Ok(())
        }

        async fn destroy(&self, _instance: &Instance) -> anyhow::Result<()> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn environment(name: &str, image: &str) -> Arc<Environment> {
        Arc::new(Environment {
            metadata: Identity::new(name, "e1"),
            image: image.into(),
            resources: Default::default(),
        })
    }

    fn registry(
        orchestrator: Arc<CountingOrchestrator>,
    ) -> (Arc<PoolRegistry>, FunctionServiceCache) {
        let fscache = FunctionServiceCache::new();
        let config = PoolConfig {
            warm_instances: 0,
            ..Default::default()
        };
        let registry = PoolRegistry::new(orchestrator, fscache.clone(), config);
        (Arc::new(registry), fscache)
    }

    #[tokio::test]
    async fn test_one_pool_per_environment() {
        let (registry, _) = registry(Default::default());

        let python = environment("python", "python-env:latest");
        let a = registry.get_pool(&python);
        let b = registry.get_pool(&python);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.pools(), 1);

        // a new image gets its own pool
        let c = registry.get_pool(&environment("python", "python-env:3.12"));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.pools(), 2);

        assert!(registry.pool(&PoolKey::new("python", "python-env:latest")).is_some());
        assert!(registry.pool(&PoolKey::new("node", "node-env")).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_pool() {
        let (registry, _) = registry(Default::default());
        let python = environment("python", "python-env:latest");

        let tasks = (0..16).map(|_| {
            let registry = Arc::clone(&registry);
            let python = Arc::clone(&python);
            tokio::spawn(async move { registry.get_pool(&python) })
        });
        let pools: Vec<_> = join_all(tasks)
            .await
            .into_iter()
            .map(|pool| pool.unwrap())
            .collect();

        assert!(pools.iter().all(|pool| Arc::ptr_eq(pool, &pools[0])));
        assert_eq!(registry.pools(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_idle() {
        let orchestrator = Arc::new(CountingOrchestrator::default());
        let (registry, fscache) = registry(orchestrator.clone());
        let pool = registry.get_pool(&environment("python", "python-env:latest"));

        let function = |uid: &str| Function {
            metadata: Identity::new("hello", uid),
            environment: Identity::new("python", "e1"),
            package: None,
        };
        let v1 = pool.specialize(&function("v1")).await.unwrap();
        let v2 = pool.specialize(&function("v2")).await.unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        fscache.touch_by_address(v2.address()).unwrap();

        assert_eq!(registry.reap_idle(Duration::from_secs(30)).await, 1);
        assert!(fscache.get(&v1.function).is_err());
        assert!(fscache.get_by_address(v1.address()).is_err());
        assert!(fscache.get(&v2.function).is_ok());
        assert_eq!(orchestrator.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().specialized, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_disabled() {
        let (registry, _) = registry(Default::default());
        // must not spawn anything that keeps the registry alive
        registry.spawn_reaper(IdleConfig {
            max_idle: None,
            reap_interval: Duration::from_secs(1),
        });
        assert_eq!(Arc::strong_count(&registry), 1);
    }
}
