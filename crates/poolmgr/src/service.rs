//! Admission control in front of the [`Resolver`].

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use poolmgr_service::config::Config;
use poolmgr_service::metric;
use poolmgr_service::resolver::Resolver;
use poolmgr_service::services::PoolManager;
use poolmgr_service::utils::futures::CallOnDrop;

/// An error returned when the pool manager is already resolving the maximum number of
/// functions concurrently.
#[derive(Debug, Clone, thiserror::Error)]
#[error("maximum number of concurrent requests reached")]
pub struct MaxRequestsError;

/// The underlying service for the HTTP request handlers.
#[derive(Debug, Clone)]
pub struct RequestService {
    manager: PoolManager,
    max_concurrent_requests: Option<usize>,
    current_requests: Arc<AtomicUsize>,
}

impl RequestService {
    pub fn new(manager: PoolManager, config: &Config) -> Self {
        Self {
            manager,
            max_concurrent_requests: config.max_concurrent_requests,
            current_requests: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn resolver(&self) -> &Resolver {
        self.manager.resolver()
    }

    /// Reserves a slot for one in-flight resolution.
    ///
    /// The slot is given back when the returned guard is dropped. Fails if
    /// `max_concurrent_requests` resolutions are already running.
    pub fn admit(&self) -> Result<CallOnDrop, MaxRequestsError> {
        let num_requests = self.current_requests.fetch_add(1, Ordering::Relaxed);
        metric!(gauge("requests.in_flight") = num_requests as u64);

        let guard = {
            let current_requests = Arc::clone(&self.current_requests);
            CallOnDrop::new(move || {
                current_requests.fetch_sub(1, Ordering::Relaxed);
            })
        };

        if let Some(max_concurrent_requests) = self.max_concurrent_requests {
            if num_requests >= max_concurrent_requests {
                metric!(counter("requests.rejected") += 1);
                return Err(MaxRequestsError);
            }
        }

        Ok(guard)
    }
}
