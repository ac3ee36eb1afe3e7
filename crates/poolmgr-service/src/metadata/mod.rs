//! Access to function and environment definitions.
//!
//! Definitions are owned by an external metadata store (the controller). The [`MetadataCache`]
//! sits in front of it and reuses fetched definitions for a fixed TTL.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;

use crate::config::MetadataCacheConfig;
use crate::error::ResolveError;
use crate::types::{Environment, Function, Identity};

mod controller;

pub use controller::ControllerClient;

/// Read access to the metadata store.
#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    /// Fetches the definition of a function.
    ///
    /// Fails with [`ResolveError::NotFound`] if the function does not exist.
    async fn get_function(&self, function: &Identity) -> Result<Function, ResolveError>;

    /// Fetches the definition of an environment.
    ///
    /// Fails with [`ResolveError::NotFound`] if the environment does not exist.
    async fn get_environment(&self, environment: &Identity) -> Result<Environment, ResolveError>;
}

/// A read-through cache of function and environment definitions.
///
/// Entries expire after the configured TTL and are refetched transparently on the next lookup.
/// Failed fetches are never cached. Concurrent lookups of the same missing entry share a single
/// fetch.
#[derive(Clone)]
pub struct MetadataCache {
    store: Arc<dyn MetadataStore>,
    functions: Cache<Identity, Arc<Function>>,
    environments: Cache<Identity, Arc<Environment>>,
    fetch_timeout: Duration,
}

impl fmt::Debug for MetadataCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataCache")
            .field("functions", &self.functions.entry_count())
            .field("environments", &self.environments.entry_count())
            .field("fetch_timeout", &self.fetch_timeout)
            .finish()
    }
}

impl MetadataCache {
    pub fn new(store: Arc<dyn MetadataStore>, config: &MetadataCacheConfig) -> Self {
        let functions = Cache::builder()
            .name("functions")
            .time_to_live(config.ttl)
            .build();
        let environments = Cache::builder()
            .name("environments")
            .time_to_live(config.ttl)
            .build();

        Self {
            store,
            functions,
            environments,
            fetch_timeout: config.fetch_timeout,
        }
    }

    /// Resolves a function to its definition and the definition of its environment.
    pub async fn get_function_info(
        &self,
        function: &Identity,
    ) -> Result<(Arc<Environment>, Arc<Function>), ResolveError> {
        let fnc = self.get_function(function).await?;
        let env = self.get_environment(&fnc.environment).await?;
        Ok((env, fnc))
    }

    pub async fn get_function(&self, function: &Identity) -> Result<Arc<Function>, ResolveError> {
        let init = async {
            tracing::debug!(function = %function, "Getting function from controller");
            let fnc = self.fetch(self.store.get_function(function)).await?;
            Ok::<_, ResolveError>(Arc::new(fnc))
        };
        self.functions
            .try_get_with_by_ref(function, init)
            .await
            .map_err(|err| (*err).clone())
    }

    pub async fn get_environment(
        &self,
        environment: &Identity,
    ) -> Result<Arc<Environment>, ResolveError> {
        let init = async {
            tracing::debug!(environment = %environment, "Getting environment from controller");
            let env = self.fetch(self.store.get_environment(environment)).await?;
            Ok::<_, ResolveError>(Arc::new(env))
        };
        self.environments
            .try_get_with_by_ref(environment, init)
            .await
            .map_err(|err| (*err).clone())
    }

    async fn fetch<T>(
        &self,
        future: impl Future<Output = Result<T, ResolveError>>,
    ) -> Result<T, ResolveError> {
        match tokio::time::timeout(self.fetch_timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(ResolveError::Timeout(self.fetch_timeout)),
        }
    }
}
