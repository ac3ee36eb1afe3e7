use std::time::Duration;

use futures::future::join_all;
use poolmgr_test::FakeOrchestrator;

use crate::{ResolveError, setup_service};

#[tokio::test]
async fn test_followers_observe_the_same_failure() {
    let service = setup_service(
        FakeOrchestrator::new().with_inject_latency(Duration::from_millis(50)),
        |_| {},
    );
    service.orchestrator.fail_inject(true);

    let requests = (0..5).map(|_| service.resolve("hello", "v1"));
    let errors: Vec<_> = join_all(requests)
        .await
        .into_iter()
        .map(|result| result.unwrap_err())
        .collect();

    assert!(matches!(errors[0], ResolveError::SpecializationFailed(_)));
    assert!(errors.iter().all(|err| *err == errors[0]));
    assert_eq!(service.orchestrator.injections(), 1);
    // the broken instance was discarded
    assert_eq!(service.orchestrator.destroyed().len(), 1);
}

#[tokio::test]
async fn test_failure_is_not_sticky() {
    let service = setup_service(FakeOrchestrator::new(), |_| {});

    service.orchestrator.fail_inject(true);
    let err = service.resolve("hello", "v1").await.unwrap_err();
    assert_eq!(err.status_code(), 500);

    service.orchestrator.fail_inject(false);
    service.resolve("hello", "v1").await.unwrap();
    assert_eq!(service.orchestrator.injections(), 2);
}

#[tokio::test]
async fn test_metadata_outage_is_not_cached() {
    let service = setup_service(FakeOrchestrator::new(), |_| {});

    service.store.set_offline(true);
    let err = service.resolve("hello", "v1").await.unwrap_err();
    assert!(matches!(err, ResolveError::UpstreamUnavailable(_)), "{err:?}");

    service.store.set_offline(false);
    service.resolve("hello", "v1").await.unwrap();
    assert_eq!(service.store.function_fetches(), 2);
}

#[tokio::test]
async fn test_pool_exhausted() {
    let service = setup_service(FakeOrchestrator::new(), |config| {
        config.pools.creation_timeout = Duration::from_millis(100);
    });
    service.orchestrator.fail_create(true);

    let err = service.resolve("hello", "v1").await.unwrap_err();
    assert_eq!(err, ResolveError::PoolExhausted(Duration::from_millis(100)));
    assert_eq!(err.status_code(), 503);
    assert_eq!(service.orchestrator.injections(), 0);
}

#[tokio::test]
async fn test_instance_never_ready() {
    let service = setup_service(FakeOrchestrator::new(), |_| {});
    service.orchestrator.fail_probe(true);

    let err = service.resolve("hello", "v1").await.unwrap_err();
    assert!(matches!(err, ResolveError::SpecializationFailed(_)), "{err:?}");
    assert!(service.manager.resolver().fscache().is_empty());
    assert_eq!(service.orchestrator.destroyed().len(), 1);
}
