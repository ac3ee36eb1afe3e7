use std::time::Duration;

use poolmgr_service::types::Identity;
use poolmgr_test::FakeOrchestrator;

use crate::setup_service;

#[tokio::test(start_paused = true)]
async fn test_idle_instances_are_reaped() {
    let service = setup_service(FakeOrchestrator::new(), |config| {
        config.idle.max_idle = Some(Duration::from_secs(60));
        config.idle.reap_interval = Duration::from_secs(10);
    });

    let address = service.resolve("hello", "v1").await.unwrap();
    tokio::time::sleep(Duration::from_secs(75)).await;

    let fscache = service.manager.resolver().fscache();
    assert!(fscache.get(&Identity::new("hello", "v1")).is_err());
    assert!(service.manager.resolver().touch(&address).is_err());

    let destroyed = service.orchestrator.destroyed();
    assert_eq!(destroyed.len(), 1);
    assert_eq!(destroyed[0].address, address);
    assert_eq!(service.python_pool().unwrap().stats().specialized, 0);

    // the next request specializes again
    service.resolve("hello", "v1").await.unwrap();
    assert_eq!(service.orchestrator.injections(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_touch_keeps_instances_alive() {
    let service = setup_service(FakeOrchestrator::new(), |config| {
        config.idle.max_idle = Some(Duration::from_secs(60));
        config.idle.reap_interval = Duration::from_secs(10);
    });
    let resolver = service.manager.resolver();

    let address = service.resolve("hello", "v1").await.unwrap();
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_secs(30)).await;
        resolver.touch(&address).unwrap();
    }

    assert!(service.orchestrator.destroyed().is_empty());
    assert_eq!(service.resolve("hello", "v1").await.unwrap(), address);
    assert_eq!(service.orchestrator.injections(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_resolving_keeps_instances_alive() {
    let service = setup_service(FakeOrchestrator::new(), |config| {
        config.idle.max_idle = Some(Duration::from_secs(60));
        config.idle.reap_interval = Duration::from_secs(10);
    });

    let address = service.resolve("hello", "v1").await.unwrap();
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(service.resolve("hello", "v1").await.unwrap(), address);
    }

    assert!(service.orchestrator.destroyed().is_empty());
    assert_eq!(service.orchestrator.injections(), 1);
}
