use std::time::Duration;

use clusterlib::{Error, Factory, Notifyable};
use common::{new_factory, new_storage, random_str};
use std::sync::Arc;

mod common;

/// The group `<app_name>/g` and its node `<app_name>/g/<node_name>` as one
/// factory sees them.
async fn group_and_node(
    factory: &Factory,
    app_name: &str,
    node_name: &str,
    create: bool,
) -> (Arc<Notifyable>, Arc<Notifyable>) {
    let group = factory
        .get_root()
        .await
        .expect("failed to get root")
        .get_application(app_name, create)
        .await
        .expect("failed to resolve application")
        .expect("application missing")
        .get_group("g", create)
        .await
        .expect("failed to resolve group")
        .expect("group missing");
    let node = group
        .get_node(node_name, true)
        .await
        .expect("failed to resolve node")
        .expect("node missing");
    (group, node)
}

async fn eventually_leader(group: &Arc<Notifyable>, node: &Arc<Notifyable>) -> bool {
    for _ in 0..100 {
        if group.am_i_the_leader(node).await.expect("leader check failed") {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn exactly_one_bidder_wins() {
    let storage = new_storage();
    let app_name = random_str(10);

    let mut contenders = Vec::new();
    for i in 0..3 {
        let factory = new_factory(&storage).await;
        let (group, node) =
            group_and_node(&factory, &app_name, &format!("node-{i}"), true).await;
        contenders.push((factory, group, node));
    }

    let mut winners = 0;
    for (_, group, node) in &contenders {
        if group.try_to_become_leader(node).await.expect("bid failed") {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "expected exactly one winner");

    // Everyone agrees on who leads.
    for (_, group, _) in &contenders {
        let leader = group.get_leader().await.expect("leader lookup failed");
        assert!(leader.is_some());
    }
}

#[tokio::test]
async fn leadership_fails_over_when_the_leader_dies() {
    let storage = new_storage();
    let app_name = random_str(10);

    let mut contenders = Vec::new();
    for i in 0..3 {
        let factory = new_factory(&storage).await;
        let (group, node) =
            group_and_node(&factory, &app_name, &format!("node-{i}"), true).await;
        contenders.push((factory, group, node));
    }

    let mut leader_index = None;
    for (i, (_, group, node)) in contenders.iter().enumerate() {
        if group.try_to_become_leader(node).await.expect("bid failed") {
            leader_index = Some(i);
        }
    }
    let leader_index = leader_index.expect("nobody won the election");

    // Kill the winner; its ephemeral bid disappears with the session.
    let (factory, _, _) = contenders.remove(leader_index);
    factory.close().await;

    let mut new_leaders = 0;
    for (_, group, node) in &contenders {
        if eventually_leader(group, node).await {
            new_leaders += 1;
        }
    }
    assert_eq!(new_leaders, 1, "expected exactly one successor");
}

#[tokio::test]
async fn giving_up_leadership_promotes_the_next_bidder() {
    let storage = new_storage();
    let app_name = random_str(10);

    let first = new_factory(&storage).await;
    let (group_first, node_first) = group_and_node(&first, &app_name, "node-0", true).await;
    let second = new_factory(&storage).await;
    let (group_second, node_second) = group_and_node(&second, &app_name, "node-1", true).await;

    assert!(group_first
        .try_to_become_leader(&node_first)
        .await
        .expect("bid failed"));
    assert!(!group_second
        .try_to_become_leader(&node_second)
        .await
        .expect("bid failed"));

    group_first
        .give_up_leadership()
        .await
        .expect("give up failed");

    assert!(eventually_leader(&group_second, &node_second).await);
    assert!(!group_second
        .am_i_the_leader(&node_first)
        .await
        .expect("leader check failed"));
}

#[tokio::test]
async fn giving_up_without_a_bid_is_an_error() {
    let storage = new_storage();
    let factory = new_factory(&storage).await;
    let (group, _) = group_and_node(&factory, &random_str(10), "node-0", true).await;

    let err = group
        .give_up_leadership()
        .await
        .expect_err("giving up without a bid must fail");
    assert!(matches!(err, Error::InvalidMethod(_)), "got {err}");
}

#[tokio::test]
async fn elections_are_per_group() {
    let storage = new_storage();
    let factory = new_factory(&storage).await;
    let app_name = random_str(10);
    let (group, node) = group_and_node(&factory, &app_name, "node-0", true).await;

    let err = node
        .try_to_become_leader(&node)
        .await
        .expect_err("a node must not hold elections");
    assert!(matches!(err, Error::InvalidMethod(_)), "got {err}");

    assert!(group.try_to_become_leader(&node).await.expect("bid failed"));
    assert!(group.am_i_the_leader(&node).await.expect("leader check failed"));
}
