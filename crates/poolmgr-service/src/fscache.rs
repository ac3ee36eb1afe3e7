//! An indexed store of specialized function instances.
//!
//! Every [`FuncSvc`] is reachable by the identity of the function it serves, and by its network
//! address. The latter is used by the router to mark instances as recently used.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use tokio::time::Instant;

use crate::error::ResolveError;
use crate::pool::{Instance, PoolKey};
use crate::types::Identity;

/// A running instance that has been specialized for one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncSvc {
    /// The function this instance serves.
    pub function: Identity,
    /// The environment the instance was created from.
    pub environment: Identity,
    /// The pool which owns the instance.
    pub pool: PoolKey,
    /// The instance itself.
    pub instance: Instance,
    /// When the instance was specialized.
    pub ctime: SystemTime,
    /// When the instance was last resolved or touched.
    pub atime: Instant,
}

impl FuncSvc {
    pub fn new(function: Identity, environment: Identity, pool: PoolKey, instance: Instance) -> Self {
        Self {
            function,
            environment,
            pool,
            instance,
            ctime: SystemTime::now(),
            atime: Instant::now(),
        }
    }

    pub fn address(&self) -> &str {
        &self.instance.address
    }

    /// How long this instance has not been used.
    pub fn idle_for(&self) -> Duration {
        self.atime.elapsed()
    }
}

#[derive(Debug, Default)]
struct Indices {
    by_function: HashMap<Identity, FuncSvc>,
    by_address: HashMap<String, Identity>,
}

impl Indices {
    fn remove_function(&mut self, function: &Identity) -> Option<FuncSvc> {
        let svc = self.by_function.remove(function)?;
        if self.by_address.get(svc.address()) == Some(function) {
            self.by_address.remove(svc.address());
        }
        Some(svc)
    }
}

/// Maps functions to the instances serving them.
///
/// All mutations are atomic with respect to both indices. The cache does not reclaim anything on
/// its own, see [`list_idle`](Self::list_idle) and [`remove`](Self::remove) for the hooks used by
/// the pools.
#[derive(Clone, Default)]
pub struct FunctionServiceCache {
    inner: Arc<RwLock<Indices>>,
}

impl fmt::Debug for FunctionServiceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionServiceCache")
            .field("entries", &self.len())
            .finish()
    }
}

impl FunctionServiceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the instance serving `function`.
    pub fn get(&self, function: &Identity) -> Result<FuncSvc, ResolveError> {
        let indices = self.inner.read().unwrap();
        indices
            .by_function
            .get(function)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(format!("no function service for {function}")))
    }

    /// Looks up the instance serving `function` and marks it as recently used.
    pub fn get_and_touch(&self, function: &Identity) -> Result<FuncSvc, ResolveError> {
        let mut indices = self.inner.write().unwrap();
        let svc = indices
            .by_function
            .get_mut(function)
            .ok_or_else(|| ResolveError::NotFound(format!("no function service for {function}")))?;
        svc.atime = Instant::now();
        Ok(svc.clone())
    }

    /// Looks up the instance listening on `address`.
    pub fn get_by_address(&self, address: &str) -> Result<FuncSvc, ResolveError> {
        let indices = self.inner.read().unwrap();
        indices
            .by_address
            .get(address)
            .and_then(|function| indices.by_function.get(function))
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(format!("no function service at {address}")))
    }

    /// Inserts or replaces the instance serving `svc.function`.
    ///
    /// Returns the replaced instance, if any. An address is only ever indexed for a single
    /// function, so an older entry that claimed the same address is evicted.
    pub fn put(&self, svc: FuncSvc) -> Option<FuncSvc> {
        let mut indices = self.inner.write().unwrap();

        if let Some(previous) = indices.by_address.get(svc.address()).cloned() {
            if previous != svc.function {
                tracing::warn!(
                    address = svc.address(),
                    previous = %previous,
                    function = %svc.function,
                    "Address was reassigned to another function"
                );
                indices.remove_function(&previous);
            }
        }

        let replaced = indices.remove_function(&svc.function);
        indices
            .by_address
            .insert(svc.address().to_owned(), svc.function.clone());
        indices.by_function.insert(svc.function.clone(), svc);
        replaced
    }

    /// Marks the instance listening on `address` as recently used.
    pub fn touch_by_address(&self, address: &str) -> Result<(), ResolveError> {
        let mut indices = self.inner.write().unwrap();
        let Indices {
            by_function,
            by_address,
        } = &mut *indices;

        let svc = by_address
            .get(address)
            .and_then(|function| by_function.get_mut(function))
            .ok_or_else(|| ResolveError::NotFound(format!("no function service at {address}")))?;
        svc.atime = Instant::now();
        Ok(())
    }

    /// Returns all instances that have not been used for at least `max_idle`.
    pub fn list_idle(&self, max_idle: Duration) -> Vec<FuncSvc> {
        let indices = self.inner.read().unwrap();
        indices
            .by_function
            .values()
            .filter(|svc| svc.idle_for() >= max_idle)
            .cloned()
            .collect()
    }

    /// Removes the entry for `function`, but only if it is still served from `address` and has
    /// not been used for at least `max_idle`.
    ///
    /// Both conditions are checked under the write lock, so an entry that was re-specialized or
    /// touched after [`list_idle`](Self::list_idle) is kept.
    pub fn remove_if_idle(
        &self,
        function: &Identity,
        address: &str,
        max_idle: Duration,
    ) -> Option<FuncSvc> {
        let mut indices = self.inner.write().unwrap();
        match indices.by_function.get(function) {
            Some(svc) if svc.address() == address && svc.idle_for() >= max_idle => {
                indices.remove_function(function)
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().by_function.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
