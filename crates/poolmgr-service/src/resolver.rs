//! Resolution of functions to the address of a running instance.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{FutureExt, Shared};
use sentry::SentryFutureExt;
use tokio::sync::oneshot;

use crate::error::ResolveError;
use crate::fscache::{FuncSvc, FunctionServiceCache};
use crate::metadata::MetadataCache;
use crate::pool::PoolRegistry;
use crate::types::Identity;
use crate::utils::futures::{CallOnDrop, m, measure};

/// Released once the specialization of a function has finished.
///
/// Carries the outcome of the specialization. If the specializing task panicked, the channel is
/// closed instead.
type Barrier = Shared<oneshot::Receiver<Result<String, ResolveError>>>;

/// Specializations currently in flight, by function.
type Ledger = Mutex<HashMap<Identity, Barrier>>;

/// The outcome of admitting a request that missed the function service cache.
enum Admission {
    /// The function was specialized between the first cache lookup and admission.
    Cached(String),
    /// This request started the specialization.
    Leader(Barrier),
    /// Another request is already specializing the function.
    Follower(Barrier),
}

/// Resolves functions to running instances.
///
/// Concurrent requests for the same function are coalesced, so that a function is never
/// specialized more than once at a time. Requests for different functions do not wait on each
/// other. A specialization always runs to completion, even if all requests waiting on it have
/// been dropped, so that the resulting instance is available to later requests.
#[derive(Clone)]
pub struct Resolver {
    inner: Arc<ResolverInner>,
}

struct ResolverInner {
    metadata: MetadataCache,
    fscache: FunctionServiceCache,
    pools: Arc<PoolRegistry>,
    ledger: Ledger,
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self.inner.ledger.lock().unwrap().len();
        f.debug_struct("Resolver")
            .field("fscache", &self.inner.fscache)
            .field("pools", &self.inner.pools)
            .field("pending", &pending)
            .finish()
    }
}

impl Resolver {
    pub fn new(
        metadata: MetadataCache,
        fscache: FunctionServiceCache,
        pools: Arc<PoolRegistry>,
    ) -> Self {
        let inner = ResolverInner {
            metadata,
            fscache,
            pools,
            ledger: Mutex::new(HashMap::new()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn fscache(&self) -> &FunctionServiceCache {
        &self.inner.fscache
    }

    pub fn pools(&self) -> &Arc<PoolRegistry> {
        &self.inner.pools
    }

    /// Returns the address of an instance serving `function`, specializing one if needed.
    ///
    /// The identity has to name an exact version. Identities without `uid` are rejected before
    /// anything is looked up.
    pub async fn resolve(&self, function: &Identity) -> Result<String, ResolveError> {
        if function.name.is_empty() {
            return Err(ResolveError::InvalidArgument("function name is missing".into()));
        }
        if !function.is_versioned() {
            return Err(ResolveError::InvalidArgument(format!(
                "function {} has no uid, refusing to guess the version",
                function.name
            )));
        }

        metric!(counter("resolve.access") += 1);
        if let Ok(svc) = self.inner.fscache.get_and_touch(function) {
            metric!(counter("resolve.cache.hit") += 1);
            return Ok(svc.instance.address);
        }

        match self.admit(function) {
            Admission::Cached(address) => {
                metric!(counter("resolve.cache.hit") += 1);
                Ok(address)
            }
            Admission::Leader(barrier) => {
                barrier.await.unwrap_or(Err(ResolveError::InternalError))
            }
            Admission::Follower(barrier) => {
                metric!(counter("resolve.coalesced") += 1);
                tracing::debug!(function = %function, "Waiting for pending specialization");
                let outcome = barrier.await.unwrap_or(Err(ResolveError::InternalError));

                // the leader's result only tells us whether it succeeded, the cache is the source
                // of truth for the address
                match (self.inner.fscache.get_and_touch(function), outcome) {
                    (Ok(svc), _) => Ok(svc.instance.address),
                    (Err(_), Err(err)) => Err(err),
                    (Err(err), Ok(_)) => Err(err),
                }
            }
        }
    }

    /// Marks the instance listening on `address` as recently used.
    pub fn touch(&self, address: &str) -> Result<(), ResolveError> {
        self.inner.fscache.touch_by_address(address)
    }

    /// Joins a pending specialization of `function`, or starts a new one.
    ///
    /// This is the only place the ledger is modified apart from the cleanup of the specializing
    /// task. The cache is checked again while holding the ledger lock, since a specialization may
    /// have completed since the caller's lookup.
    fn admit(&self, function: &Identity) -> Admission {
        let mut ledger = self.inner.ledger.lock().unwrap();
        if let Some(barrier) = ledger.get(function) {
            return Admission::Follower(barrier.clone());
        }
        if let Ok(svc) = self.inner.fscache.get_and_touch(function) {
            return Admission::Cached(svc.instance.address);
        }

        let (sender, receiver) = oneshot::channel();
        let barrier = receiver.shared();
        ledger.insert(function.clone(), barrier.clone());
        drop(ledger);

        let inner = Arc::clone(&self.inner);
        let function = function.clone();
        let specialization = async move {
            let cleanup = {
                let inner = Arc::clone(&inner);
                let function = function.clone();
                CallOnDrop::new(move || {
                    inner
                        .ledger
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&function);
                })
            };

            let create = inner.create_service(&function);
            let result = measure("create_service", m::result, create).await;

            // unregister before releasing waiters, so no one joins a finished specialization
            drop(cleanup);
            sender.send(result.map(|svc| svc.instance.address)).ok();
        };
        tokio::spawn(specialization.bind_hub(sentry::Hub::new_from_top(sentry::Hub::current())));

        Admission::Leader(barrier)
    }
}

impl ResolverInner {
    async fn create_service(&self, function: &Identity) -> Result<FuncSvc, ResolveError> {
        metric!(
            counter("resolve.cold_start") += 1,
            "function" => &function.name,
            "uid" => &function.uid,
        );
        tracing::debug!(function = %function, "Creating function service");

        let (environment, fnc) = self.metadata.get_function_info(function).await?;
        let pool = self.pools.get_pool(&environment);
        let result = pool.specialize(&fnc).await;

        if let Err(err) = &result {
            tracing::warn!(
                function = %function,
                error = %err,
                "Failed to create function service"
            );
        }
        result
    }
}
