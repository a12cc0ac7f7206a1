use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use clusterlib::{
    health::{HealthChecker, HealthReport},
    Error, HealthCheckerConfig,
};
use common::{new_factory, new_storage, node_in_app, random_str};

mod common;

struct Alternating {
    report_healthy_next: AtomicBool,
    invocations: AtomicUsize,
}

impl Alternating {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            report_healthy_next: AtomicBool::new(true),
            invocations: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl HealthChecker for Alternating {
    async fn check_health(&self) -> clusterlib::Result<HealthReport> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if self.report_healthy_next.swap(false, Ordering::SeqCst) {
            Ok(HealthReport::healthy("all good"))
        } else {
            self.report_healthy_next.store(true, Ordering::SeqCst);
            Ok(HealthReport::unhealthy("struggling"))
        }
    }
}

fn fast_config() -> HealthCheckerConfig {
    HealthCheckerConfig {
        msecs_per_check_if_healthy: 60,
        msecs_per_check_if_unhealthy: 120,
        msecs_allowed_per_health_check: 1_000,
    }
}

#[tokio::test]
async fn client_state_alternates_with_the_checker() {
    let storage = new_storage();
    let factory = new_factory(&storage).await;
    let node = node_in_app(&factory, &random_str(10), true).await;

    let checker = Alternating::new();
    node.register_health_checker(checker.clone(), fast_config())
        .await
        .expect("registration failed");

    let mut observed = HashSet::new();
    for _ in 0..60 {
        factory.synchronize().await.expect("synchronize failed");
        let state = node.get_client_state();
        if !state.is_empty() {
            observed.insert(state);
        }
        if observed.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(observed.contains("healthy"), "never saw healthy: {observed:?}");
    assert!(observed.contains("unhealthy"), "never saw unhealthy: {observed:?}");
    assert!(checker.invocations.load(Ordering::SeqCst) >= 2);

    node.unregister_health_checker()
        .await
        .expect("unregistration failed");
}

#[tokio::test]
async fn connection_marker_follows_the_registration() {
    let storage = new_storage();
    let factory = new_factory(&storage).await;
    let observer = new_factory(&storage).await;
    let app_name = random_str(10);

    let node = node_in_app(&factory, &app_name, true).await;
    let observed_node = node_in_app(&observer, &app_name, false).await;
    assert!(!observed_node.is_connected());

    let checker = Alternating::new();
    node.register_health_checker(checker, fast_config())
        .await
        .expect("registration failed");

    observer.synchronize().await.expect("synchronize failed");
    assert!(observed_node.is_connected());

    node.unregister_health_checker()
        .await
        .expect("unregistration failed");
    observer.synchronize().await.expect("synchronize failed");
    assert!(!observed_node.is_connected());
}

#[tokio::test]
async fn duplicate_connections_are_rejected() {
    let storage = new_storage();
    let factory = new_factory(&storage).await;
    let other = new_factory(&storage).await;
    let app_name = random_str(10);

    let node = node_in_app(&factory, &app_name, true).await;
    let other_node = node_in_app(&other, &app_name, false).await;

    node.register_health_checker(Alternating::new(), fast_config())
        .await
        .expect("registration failed");

    let err = other_node
        .register_health_checker(Alternating::new(), fast_config())
        .await
        .expect_err("second registration must fail");
    assert!(matches!(err, Error::AlreadyConnected(_)), "got {err}");

    node.unregister_health_checker()
        .await
        .expect("unregistration failed");
}

#[tokio::test]
async fn cadences_must_be_positive() {
    let storage = new_storage();
    let factory = new_factory(&storage).await;
    let node = node_in_app(&factory, &random_str(10), true).await;

    let err = node
        .register_health_checker(
            Alternating::new(),
            HealthCheckerConfig {
                msecs_per_check_if_healthy: 0,
                ..fast_config()
            },
        )
        .await
        .expect_err("a zero cadence must fail");
    assert!(matches!(err, Error::InvalidArguments(_)), "got {err}");

    // The failed registration must not leave the connection marker behind.
    node.register_health_checker(Alternating::new(), fast_config())
        .await
        .expect("registration after a failed attempt failed");
    node.unregister_health_checker()
        .await
        .expect("unregistration failed");
}

#[tokio::test]
async fn unregistering_without_a_checker_is_an_error() {
    let storage = new_storage();
    let factory = new_factory(&storage).await;
    let node = node_in_app(&factory, &random_str(10), true).await;

    let err = node
        .unregister_health_checker()
        .await
        .expect_err("unregistering nothing must fail");
    assert!(matches!(err, Error::InvalidMethod(_)), "got {err}");
}
