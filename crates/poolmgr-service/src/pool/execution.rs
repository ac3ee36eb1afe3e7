use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::join_all;
use sentry::SentryFutureExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{Instance, Orchestrator, PoolKey};
use crate::config::PoolConfig;
use crate::error::ResolveError;
use crate::fscache::{FuncSvc, FunctionServiceCache};
use crate::types::{Environment, Function, Identity};
use crate::utils::futures::CallOnDrop;

/// A snapshot of the instances owned by an [`ExecutionPool`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Unspecialized instances ready to be claimed.
    pub warm: usize,
    /// Instances currently serving a function.
    pub specialized: usize,
    /// The number of warm instances the pool tries to keep.
    pub target: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    warm: VecDeque<Instance>,
    /// Specialized instances by instance id.
    specialized: HashMap<String, Identity>,
    /// Instances requested from the orchestrator that have not arrived yet.
    creating: usize,
}

/// Warm instances of one environment, and the instances specialized from them.
///
/// The pool keeps `warm_instances` unspecialized instances around. A background task replaces
/// claimed instances, and creates additional ones while specializations are waiting for an
/// instance.
pub struct ExecutionPool {
    key: PoolKey,
    environment: Arc<Environment>,
    orchestrator: Arc<dyn Orchestrator>,
    fscache: FunctionServiceCache,
    config: PoolConfig,
    state: Mutex<PoolState>,
    /// Signaled for every instance added to the warm set.
    available: Notify,
    /// Wakes up the replenisher.
    replenish: Notify,
    /// Number of specializations waiting for a warm instance.
    waiting: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl fmt::Debug for ExecutionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionPool")
            .field("key", &self.key)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ExecutionPool {
    /// Creates the pool and starts replenishing it in the background.
    ///
    /// The pool stops replenishing and tears down its warm instances once `shutdown` is
    /// cancelled. Must be called from within a tokio runtime.
    pub fn new(
        key: PoolKey,
        environment: Arc<Environment>,
        orchestrator: Arc<dyn Orchestrator>,
        fscache: FunctionServiceCache,
        config: PoolConfig,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            key,
            environment,
            orchestrator,
            fscache,
            config,
            state: Mutex::new(PoolState::default()),
            available: Notify::new(),
            replenish: Notify::new(),
            waiting: Arc::new(AtomicUsize::new(0)),
            shutdown,
        });

        let replenisher = Arc::clone(&pool).replenish_loop();
        tokio::spawn(replenisher.bind_hub(sentry::Hub::new_from_top(sentry::Hub::current())));

        pool
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock().unwrap();
        PoolStats {
            warm: state.warm.len(),
            specialized: state.specialized.len(),
            target: self.config.warm_instances,
        }
    }

    /// Turns a warm instance into one serving `function`.
    ///
    /// The resulting [`FuncSvc`] is recorded in the function service cache before it is
    /// returned. An instance that fails to specialize is destroyed, the replenisher replaces it.
    pub async fn specialize(&self, function: &Function) -> Result<FuncSvc, ResolveError> {
        let instance = self.claim().await?;

        let start = Instant::now();
        let result = self.specialize_instance(&instance, function).await;
        metric!(
            timer("specialize.duration") = start.elapsed(),
            "environment" => &self.key.environment,
            "status" => if result.is_ok() { "ok" } else { "failed" },
        );

        if let Err(err) = result {
            tracing::warn!(
                function = %function.metadata,
                address = %instance.address,
                error = %err,
                "Failed to specialize instance"
            );
            self.destroy_instance(&instance).await;
            return Err(err);
        }

        self.state
            .lock()
            .unwrap()
            .specialized
            .insert(instance.id.clone(), function.metadata.clone());

        let svc = FuncSvc::new(
            function.metadata.clone(),
            self.environment.metadata.clone(),
            self.key.clone(),
            instance,
        );
        if let Some(replaced) = self.fscache.put(svc.clone()) {
            tracing::warn!(
                function = %replaced.function,
                address = replaced.address(),
                "Replaced an existing function service"
            );
            if replaced.pool == self.key && replaced.instance != svc.instance {
                self.release(&replaced).await;
            }
        }

        tracing::info!(
            function = %svc.function,
            address = svc.address(),
            "Specialized instance"
        );
        Ok(svc)
    }

    /// Destroys a specialized instance of this pool.
    ///
    /// The caller is responsible for removing it from the function service cache first.
    pub async fn release(&self, svc: &FuncSvc) {
        self.state
            .lock()
            .unwrap()
            .specialized
            .remove(&svc.instance.id);
        self.destroy_instance(&svc.instance).await;
    }

    /// Takes a warm instance out of the pool, waiting up to `creation_timeout` for one.
    async fn claim(&self) -> Result<Instance, ResolveError> {
        let start = Instant::now();
        let result = tokio::time::timeout(self.config.creation_timeout, self.claim_inner()).await;
        metric!(
            timer("pool.claim.duration") = start.elapsed(),
            "environment" => &self.key.environment,
            "status" => if result.is_ok() { "ok" } else { "exhausted" },
        );

        let instance =
            result.map_err(|_| ResolveError::PoolExhausted(self.config.creation_timeout))?;
        self.replenish.notify_one();
        self.report_warm();
        Ok(instance)
    }

    async fn claim_inner(&self) -> Instance {
        if let Some(instance) = self.pop_warm() {
            return instance;
        }

        self.waiting.fetch_add(1, Ordering::SeqCst);
        let _waiting = {
            let waiting = Arc::clone(&self.waiting);
            CallOnDrop::new(move || {
                waiting.fetch_sub(1, Ordering::SeqCst);
            })
        };

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // register before checking, so that no instance added in between goes unnoticed
            notified.as_mut().enable();

            if let Some(instance) = self.pop_warm() {
                return instance;
            }
            self.replenish.notify_one();
            notified.await;
        }
    }

    fn pop_warm(&self) -> Option<Instance> {
        self.state.lock().unwrap().warm.pop_front()
    }

    async fn specialize_instance(
        &self,
        instance: &Instance,
        function: &Function,
    ) -> Result<(), ResolveError> {
        let timeout = self.config.specialize_timeout;
        match tokio::time::timeout(timeout, self.orchestrator.inject(instance, function)).await {
            Err(_) => return Err(ResolveError::Timeout(timeout)),
            Ok(Err(err)) => return Err(ResolveError::SpecializationFailed(format!("{err:#}"))),
            Ok(Ok(())) => {}
        }

        self.wait_ready(instance).await
    }

    /// Probes the instance until it accepts connections.
    ///
    /// Every probe is cut off at the readiness deadline, so a hanging probe cannot extend it.
    async fn wait_ready(&self, instance: &Instance) -> Result<(), ResolveError> {
        let deadline = tokio::time::Instant::now() + self.config.readiness_timeout;
        loop {
            let probe = self.orchestrator.probe(instance);
            let err = match tokio::time::timeout_at(deadline, probe).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) => err,
                Err(_) => anyhow::anyhow!("readiness probe did not finish"),
            };

            if tokio::time::Instant::now() + self.config.readiness_interval > deadline {
                return Err(ResolveError::SpecializationFailed(format!(
                    "instance did not become ready within {}: {err:#}",
                    humantime::format_duration(self.config.readiness_timeout)
                )));
            }
            tokio::time::sleep(self.config.readiness_interval).await;
        }
    }

    async fn destroy_instance(&self, instance: &Instance) {
        metric!(counter("pool.instance.destroyed") += 1, "environment" => &self.key.environment);
        if let Err(err) = self.orchestrator.destroy(instance).await {
            tracing::warn!(
                address = %instance.address,
                error = %format!("{err:#}"),
                "Failed to destroy instance"
            );
        }
    }

    fn report_warm(&self) {
        let warm = self.state.lock().unwrap().warm.len();
        metric!(
            gauge("pool.warm_instances") = warm as u64,
            "environment" => &self.key.environment,
        );
    }

    /// The number of instances to request from the orchestrator right now.
    ///
    /// Reserves them as `creating` in the same step.
    fn reserve_missing(&self) -> usize {
        let target = self.config.warm_instances + self.waiting.load(Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let present = state.warm.len() + state.creating;
        let missing = target.saturating_sub(present);
        state.creating += missing;
        missing
    }

    async fn create_warm_instance(&self) -> bool {
        let result = self.orchestrator.create_instance(&self.environment).await;

        let mut state = self.state.lock().unwrap();
        state.creating -= 1;
        match result {
            Ok(instance) => {
                tracing::debug!(
                    environment = %self.key,
                    address = %instance.address,
                    "Created warm instance"
                );
                state.warm.push_back(instance);
                drop(state);
                self.available.notify_one();
                self.report_warm();
                true
            }
            Err(err) => {
                drop(state);
                tracing::error!(
                    environment = %self.key,
                    error = %format!("{err:#}"),
                    "Failed to create warm instance"
                );
                false
            }
        }
    }

    async fn replenish_loop(self: Arc<Self>) {
        loop {
            let missing = self.reserve_missing();

            if missing == 0 {
                tokio::select! {
                    _ = self.replenish.notified() => continue,
                    _ = self.shutdown.cancelled() => break,
                }
            }

            let created = join_all((0..missing).map(|_| self.create_warm_instance())).await;
            if created.iter().all(|ok| *ok) {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.replenish_backoff) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        self.drain().await;
    }

    /// Destroys all warm instances.
    async fn drain(&self) {
        let warm: Vec<_> = self.state.lock().unwrap().warm.drain(..).collect();
        if warm.is_empty() {
            return;
        }
        tracing::debug!(environment = %self.key, count = warm.len(), "Draining pool");
        join_all(warm.iter().map(|instance| self.destroy_instance(instance))).await;
    }
}
