use std::time::Duration;

use futures::future::join_all;
use poolmgr_test::FakeOrchestrator;
use tokio::time::Instant;

use crate::setup_service;

#[tokio::test]
async fn test_concurrent_requests_are_coalesced() {
    let service = setup_service(
        FakeOrchestrator::new().with_inject_latency(Duration::from_millis(100)),
        |_| {},
    );

    let requests = (0..10).map(|_| service.resolve("hello", "v1"));
    let addresses: Vec<_> = join_all(requests)
        .await
        .into_iter()
        .map(|result| result.unwrap())
        .collect();

    assert!(addresses.iter().all(|address| *address == addresses[0]));
    assert_eq!(service.orchestrator.injections(), 1);
    assert_eq!(service.store.function_fetches(), 1);
    assert_eq!(service.python_pool().unwrap().stats().specialized, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_coalesced_across_threads() {
    let service = std::sync::Arc::new(setup_service(
        FakeOrchestrator::new().with_inject_latency(Duration::from_millis(50)),
        |_| {},
    ));

    let tasks = (0..32).map(|_| {
        let service = service.clone();
        tokio::spawn(async move { service.resolve("hello", "v1").await })
    });
    let addresses: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|result| result.unwrap().unwrap())
        .collect();

    assert!(addresses.iter().all(|address| *address == addresses[0]));
    assert_eq!(service.orchestrator.injections(), 1);
}

/// Two concurrent requests for `hello@v1` share one specialization, while `hello@v2` is
/// specialized independently without waiting for `v1`.
#[tokio::test(start_paused = true)]
async fn test_versions_are_specialized_independently() {
    let latency = Duration::from_millis(100);
    let service = setup_service(FakeOrchestrator::new().with_inject_latency(latency), |_| {});
    let start = Instant::now();

    let first = service.resolve("hello", "v1");
    let second = async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        service.resolve("hello", "v1").await
    };
    let other = async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let address = service.resolve("hello", "v2").await;
        (address, start.elapsed())
    };

    let (first, second, (other, other_elapsed)) = tokio::join!(first, second, other);

    assert_eq!(first.unwrap(), "10.0.0.5:8888");
    assert_eq!(second.unwrap(), "10.0.0.5:8888");
    assert_eq!(other.unwrap(), "10.0.0.6:8888");

    // v2 only waited for its own injection
    assert!(other_elapsed < latency * 2, "{other_elapsed:?}");
    assert_eq!(service.orchestrator.injections(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_request_completes_specialization() {
    let service = setup_service(
        FakeOrchestrator::new().with_inject_latency(Duration::from_millis(100)),
        |_| {},
    );

    let abandoned =
        tokio::time::timeout(Duration::from_millis(10), service.resolve("hello", "v1")).await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_millis(200)).await;
    let pool = service.python_pool().unwrap();
    assert_eq!(pool.stats().specialized, 1);

    // the result of the abandoned specialization is reused
    let address = service.resolve("hello", "v1").await.unwrap();
    assert_eq!(address, "10.0.0.5:8888");
    assert_eq!(service.orchestrator.injections(), 1);
}
