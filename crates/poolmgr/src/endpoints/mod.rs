use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use poolmgr_service::metric;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;

use crate::service::RequestService;

mod error;
mod get_service;
mod metrics;
mod tap_service;

pub use error::ResponseError;
use metrics::MetricsLayer;

use get_service::get_service_for_function;
use tap_service::tap_service;

pub async fn healthcheck() -> &'static str {
    metric!(counter("healthcheck") += 1);
    "ok"
}

pub fn create_app(service: RequestService) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(MetricsLayer)
        .layer(DefaultBodyLimit::max(1024 * 1024));
    Router::new()
        .route("/v1/getServiceForFunction", post(get_service_for_function))
        .route("/v1/tapService", post(tap_service))
        .with_state(service)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}
