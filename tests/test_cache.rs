use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use clusterlib::{
    event::{NotifyableEvent, TimerEventHandler},
    repository::{CreateMode, RawEvent, SessionId},
    Error, MemoryStorage, NotifyableKind, Storage, UserEventHandler, UserEventPayload,
};
use common::{new_factory, new_storage, random_application, random_str};
use serde_json::json;
use tokio::sync::mpsc;

mod common;

async fn raw_session(
    storage: &Arc<MemoryStorage>,
) -> (SessionId, mpsc::UnboundedReceiver<RawEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let session = storage.connect(tx).await.expect("failed to open raw session");
    (session, rx)
}

#[tokio::test]
async fn client_state_propagates_through_the_cache() {
    let storage = new_storage();
    let factory = new_factory(&storage).await;
    let app = random_application(&factory).await;
    let node = app
        .get_node("server-0", true)
        .await
        .expect("failed to create node")
        .expect("node missing after create");

    let (session, _rx) = raw_session(&storage).await;
    let client_state_path = format!("{}/_clientState", node.key());
    storage
        .create(session, &client_state_path, "healthy", CreateMode::Persistent)
        .await
        .expect("failed to write client state");

    factory.synchronize().await.expect("synchronize failed");
    assert_eq!(node.get_client_state(), "healthy");
}

#[tokio::test]
async fn group_created_elsewhere_materializes_after_synchronize() {
    let storage = new_storage();
    let observer = new_factory(&storage).await;
    let creator = new_factory(&storage).await;

    let app_name = random_str(10);
    let observer_app = observer
        .get_root()
        .await
        .expect("no root")
        .get_application(&app_name, true)
        .await
        .expect("failed to create application")
        .expect("application missing");
    // Installs the groups watch.
    assert!(observer_app
        .get_group_names()
        .await
        .expect("failed to list groups")
        .is_empty());

    let creator_app = creator
        .get_root()
        .await
        .expect("no root")
        .get_application(&app_name, false)
        .await
        .expect("failed to look up application")
        .expect("application not visible to the second factory");
    creator_app
        .get_group("g15", true)
        .await
        .expect("failed to create group")
        .expect("group missing after create");

    observer.synchronize().await.expect("synchronize failed");

    let names = observer_app
        .get_group_names()
        .await
        .expect("failed to list groups");
    assert!(names.contains(&"g15".to_string()), "missing g15 in {names:?}");
    let group = observer_app
        .get_group("g15", false)
        .await
        .expect("failed to look up group")
        .expect("group not materialized");
    assert!(group.is_ready());
}

#[tokio::test]
async fn ready_state_follows_the_sentinel() {
    let storage = new_storage();
    let factory = new_factory(&storage).await;
    let app = random_application(&factory).await;
    let group = app
        .get_group("g", true)
        .await
        .expect("failed to create group")
        .expect("group missing");
    assert!(group.is_ready());

    let (session, _rx) = raw_session(&storage).await;
    storage
        .set_data(session, group.key(), "not quite", -1)
        .await
        .expect("failed to clobber the sentinel");
    factory.synchronize().await.expect("synchronize failed");
    assert!(!group.is_ready());

    storage
        .set_data(session, group.key(), "ready", -1)
        .await
        .expect("failed to restore the sentinel");
    factory.synchronize().await.expect("synchronize failed");
    assert!(group.is_ready());
}

#[tokio::test]
async fn lookups_intern_one_instance_per_key() {
    let storage = new_storage();
    let factory = new_factory(&storage).await;
    let app = random_application(&factory).await;

    let first = app
        .get_group("g", true)
        .await
        .expect("failed to create group")
        .expect("group missing");
    let second = app
        .get_group("g", false)
        .await
        .expect("failed to look up group")
        .expect("group missing");
    assert!(Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn removed_notifyables_reject_operations() {
    let storage = new_storage();
    let factory = new_factory(&storage).await;
    let app = random_application(&factory).await;
    let plist = app
        .get_property_list("conf", true)
        .await
        .expect("failed to create property list")
        .expect("property list missing");

    plist.remove(false).await.expect("remove failed");
    assert_eq!(plist.state(), clusterlib::NotifyableState::Removed);

    let err = plist.remove(false).await.expect_err("second remove must fail");
    assert!(matches!(err, Error::ObjectRemoved(_)), "got {err}");

    let gone = app
        .get_property_list("conf", false)
        .await
        .expect("lookup failed");
    assert!(gone.is_none());
}

#[tokio::test]
async fn remove_with_children_requires_the_flag() {
    let storage = new_storage();
    let factory = new_factory(&storage).await;
    let app = random_application(&factory).await;
    app.get_group("g", true)
        .await
        .expect("failed to create group")
        .expect("group missing");

    let err = app
        .remove(false)
        .await
        .expect_err("removing a parent without the flag must fail");
    assert!(matches!(err, Error::InvalidMethod(_)), "got {err}");

    app.remove(true).await.expect("recursive remove failed");
    let root = factory.get_root().await.expect("no root");
    let gone = root
        .get_application(&app.name().to_string(), false)
        .await
        .expect("lookup failed");
    assert!(gone.is_none());
}

#[tokio::test]
async fn key_values_round_trip_through_the_repository() {
    let storage = new_storage();
    let writer = new_factory(&storage).await;
    let reader = new_factory(&storage).await;

    let app_name = random_str(10);
    let writer_plist = writer
        .get_root()
        .await
        .expect("no root")
        .get_application(&app_name, true)
        .await
        .expect("failed to create application")
        .expect("application missing")
        .get_property_list("conf", true)
        .await
        .expect("failed to create property list")
        .expect("property list missing");

    let key_values = writer_plist.cached_key_values().expect("not a property list");
    key_values.set("retries", json!(7));
    key_values.publish(false).await.expect("publish failed");
    key_values.load(false).await.expect("reload failed");
    assert_eq!(key_values.get_local("retries"), Some(json!(7)));

    let reader_plist = reader
        .get_root()
        .await
        .expect("no root")
        .get_application(&app_name, false)
        .await
        .expect("failed to look up application")
        .expect("application missing")
        .get_property_list("conf", false)
        .await
        .expect("failed to look up property list")
        .expect("property list missing");
    assert_eq!(
        reader_plist
            .cached_key_values()
            .expect("not a property list")
            .get_local("retries"),
        Some(json!(7))
    );
}

#[tokio::test]
async fn stale_conditional_publish_is_a_version_conflict() {
    let storage = new_storage();
    let winner = new_factory(&storage).await;
    let loser = new_factory(&storage).await;

    let app_name = random_str(10);
    let winner_kv = winner
        .get_root()
        .await
        .expect("no root")
        .get_application(&app_name, true)
        .await
        .expect("failed to create application")
        .expect("application missing")
        .get_property_list("conf", true)
        .await
        .expect("failed to create property list")
        .expect("property list missing");

    let loser_plist = loser
        .get_root()
        .await
        .expect("no root")
        .get_application(&app_name, false)
        .await
        .expect("failed to look up application")
        .expect("application missing")
        .get_property_list("conf", false)
        .await
        .expect("failed to look up property list")
        .expect("property list missing");
    // Drop the loser's instance from its cache so no change handler
    // refreshes its stale version underneath the test.
    loser_plist.release().expect("release failed");

    winner_kv
        .cached_key_values()
        .expect("not a property list")
        .set("who", json!("winner"));
    winner_kv
        .cached_key_values()
        .expect("not a property list")
        .publish(false)
        .await
        .expect("publish failed");

    let loser_kv = loser_plist.cached_key_values().expect("not a property list");
    loser_kv.set("who", json!("loser"));
    let err = loser_kv
        .publish(false)
        .await
        .expect_err("stale publish must fail");
    assert!(matches!(err, Error::PublishVersion(_)), "got {err}");
}

struct RecordingHandler {
    seen: Mutex<Vec<NotifyableEvent>>,
}

#[async_trait]
impl UserEventHandler for RecordingHandler {
    async fn handle_user_event(&self, payload: &UserEventPayload) {
        self.seen.lock().expect("handler lock poisoned").push(payload.event);
    }
}

#[tokio::test]
async fn user_event_handlers_observe_membership_changes() {
    let storage = new_storage();
    let factory = new_factory(&storage).await;
    let app = random_application(&factory).await;
    // Installs the groups watch.
    app.get_group_names().await.expect("failed to list groups");

    let handler = Arc::new(RecordingHandler {
        seen: Mutex::new(Vec::new()),
    });
    factory.register_user_event_handler(app.key(), handler.clone());

    app.get_group("g", true)
        .await
        .expect("failed to create group")
        .expect("group missing");
    factory.synchronize().await.expect("synchronize failed");

    let seen = handler.seen.lock().expect("handler lock poisoned").clone();
    assert!(
        seen.contains(&NotifyableEvent::GroupsChange),
        "no groups change in {seen:?}"
    );

    let as_dyn: Arc<dyn UserEventHandler> = handler.clone();
    assert!(factory.unregister_user_event_handler(app.key(), &as_dyn));
    assert!(!factory.unregister_user_event_handler(app.key(), &as_dyn));
}

struct CountingAlarm {
    fired: AtomicUsize,
}

#[async_trait]
impl TimerEventHandler for CountingAlarm {
    async fn handle_timer_event(&self, _id: clusterlib::sync::TimerId, _alarm_msecs: i64) {
        self.fired.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn factory_timers_fire_and_cancel() {
    let storage = new_storage();
    let factory = new_factory(&storage).await;

    let alarm = Arc::new(CountingAlarm {
        fired: AtomicUsize::new(0),
    });
    factory.schedule_timer_after(20, alarm.clone());
    let cancelled = factory.schedule_timer_after(10_000, alarm.clone());
    assert!(factory.cancel_timer(cancelled));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(alarm.fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn key_value_search_walks_ancestor_property_lists() {
    let storage = new_storage();
    let factory = new_factory(&storage).await;
    let app = random_application(&factory).await;

    let app_plist = app
        .get_property_list("conf", true)
        .await
        .expect("failed to create property list")
        .expect("property list missing");
    let app_kv = app_plist.cached_key_values().expect("not a property list");
    app_kv.set("zone", json!("west"));
    app_kv.publish(false).await.expect("publish failed");

    let group_plist = app
        .get_group("g", true)
        .await
        .expect("failed to create group")
        .expect("group missing")
        .get_property_list("conf", true)
        .await
        .expect("failed to create property list")
        .expect("property list missing");

    let group_kv = group_plist.cached_key_values().expect("not a property list");
    assert_eq!(
        group_kv.get("zone", false).await.expect("local get failed"),
        None
    );
    let (value, found_in) = group_kv
        .get("zone", true)
        .await
        .expect("parent search failed")
        .expect("key not found in any ancestor");
    assert_eq!(value, json!("west"));
    assert_eq!(found_in, app_plist.key());
}
