use std::time::Duration;

use poolmgr_service::types::Identity;
use poolmgr_test::FakeOrchestrator;

use crate::{ResolveError, setup_service};

#[tokio::test]
async fn test_resolve_specializes_once() {
    let service = setup_service(FakeOrchestrator::new(), |_| {});

    let first = service.resolve("hello", "v1").await.unwrap();
    let second = service.resolve("hello", "v1").await.unwrap();
    assert_eq!(first, "10.0.0.5:8888");
    assert_eq!(first, second);

    assert_eq!(service.orchestrator.injections(), 1);
    assert_eq!(
        service.orchestrator.injected_functions(),
        vec![Identity::new("hello", "v1")]
    );
}

#[tokio::test]
async fn test_missing_uid_is_rejected() {
    let service = setup_service(FakeOrchestrator::new(), |_| {});

    let err = service.resolve("hello", "").await.unwrap_err();
    assert!(matches!(err, ResolveError::InvalidArgument(_)), "{err:?}");
    assert_eq!(err.status_code(), 400);

    let err = service.resolve("", "v1").await.unwrap_err();
    assert!(matches!(err, ResolveError::InvalidArgument(_)), "{err:?}");

    // nothing was looked up or created
    assert_eq!(service.store.function_fetches(), 0);
    assert_eq!(service.manager.resolver().pools().pools(), 0);
    assert_eq!(service.orchestrator.created(), 0);
}

#[tokio::test]
async fn test_unknown_function() {
    let service = setup_service(FakeOrchestrator::new(), |_| {});

    let err = service.resolve("goodbye", "v1").await.unwrap_err();
    assert!(matches!(err, ResolveError::NotFound(_)), "{err:?}");
    assert_eq!(err.status_code(), 404);
    assert_eq!(service.orchestrator.created(), 0);
}

#[tokio::test]
async fn test_touch() {
    let service = setup_service(FakeOrchestrator::new(), |_| {});
    let resolver = service.manager.resolver();

    let err = resolver.touch("10.0.0.5:8888").unwrap_err();
    assert!(matches!(err, ResolveError::NotFound(_)), "{err:?}");

    let address = service.resolve("hello", "v1").await.unwrap();
    resolver.touch(&address).unwrap();
    resolver.touch(&address).unwrap();

    assert!(resolver.touch("10.0.0.99:8888").is_err());
}

#[tokio::test]
async fn test_warm_instances_are_used() {
    let service = setup_service(FakeOrchestrator::new(), |config| {
        config.pools.warm_instances = 2;
    });

    service.resolve("hello", "v1").await.unwrap();
    let pool = service.python_pool().unwrap();

    // the pool refills to its target after the claim
    tokio::time::timeout(Duration::from_secs(5), async {
        while pool.stats().warm < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let stats = pool.stats();
    assert_eq!(stats.specialized, 1);
    assert_eq!(stats.target, 2);
}

#[tokio::test]
async fn test_metadata_is_cached() {
    let service = setup_service(FakeOrchestrator::new(), |_| {});

    service.resolve("hello", "v1").await.unwrap();
    service.resolve("hello", "v2").await.unwrap();

    // both versions share the environment
    assert_eq!(service.store.function_fetches(), 2);
    assert_eq!(service.store.environment_fetches(), 1);
    assert_eq!(service.manager.resolver().pools().pools(), 1);
}
