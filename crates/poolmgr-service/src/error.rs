use std::time::Duration;

use thiserror::Error;

/// An error that happens while resolving a function to a running instance.
///
/// This error is shared between all requests that were coalesced into the same specialization,
/// which is why it is [`Clone`] and only carries rendered messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// The request did not fully identify a function.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The function, environment or instance address is unknown.
    #[error("not found: {0}")]
    NotFound(String),
    /// No warm instance became available in time.
    #[error("no warm instance available after {0:?}")]
    PoolExhausted(Duration),
    /// A collaborator did not answer in time.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    /// The metadata store or the orchestrator could not be reached, or returned garbage.
    ///
    /// The attached string contains the upstream's response.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    /// Injecting the function or waiting for the specialized instance to become ready failed.
    #[error("specialization failed: {0}")]
    SpecializationFailed(String),
    /// An unexpected error in the pool manager itself.
    #[error("internal error")]
    InternalError,
}

impl ResolveError {
    /// The HTTP status code this error is surfaced with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidArgument(_) => 400,
            Self::NotFound(_) => 404,
            Self::PoolExhausted(_) | Self::Timeout(_) => 503,
            Self::UpstreamUnavailable(_) | Self::SpecializationFailed(_) | Self::InternalError => {
                500
            }
        }
    }

    /// A short name used to tag metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::NotFound(_) => "not_found",
            Self::PoolExhausted(_) => "pool_exhausted",
            Self::Timeout(_) => "timeout",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::SpecializationFailed(_) => "specialization_failed",
            Self::InternalError => "internal",
        }
    }
}

impl From<reqwest::Error> for ResolveError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::UpstreamUnavailable(format!("request timed out: {err}"));
        }
        if err.is_decode() {
            return Self::UpstreamUnavailable(format!("malformed response: {err}"));
        }
        Self::UpstreamUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ResolveError::InvalidArgument("x".into()).status_code(), 400);
        assert_eq!(ResolveError::NotFound("x".into()).status_code(), 404);
        assert_eq!(
            ResolveError::PoolExhausted(Duration::from_secs(1)).status_code(),
            503
        );
        assert_eq!(ResolveError::Timeout(Duration::from_secs(1)).status_code(), 503);
        assert_eq!(
            ResolveError::UpstreamUnavailable("x".into()).status_code(),
            500
        );
        assert_eq!(
            ResolveError::SpecializationFailed("x".into()).status_code(),
            500
        );
        assert_eq!(ResolveError::InternalError.status_code(), 500);
    }
}
