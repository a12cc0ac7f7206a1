use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use clusterlib::{
    rpc::RESP_QUEUE_KEY, Factory, Notifyable, RpcManager, RpcMethod, RpcRequest,
    JsonRpcResponseHandler, RpcManagerConfig,
};
use common::{new_factory, new_storage, random_str};
use serde_json::{json, Value};

mod common;

struct Echo;

#[async_trait]
impl RpcMethod for Echo {
    fn name(&self) -> String {
        "echo".to_string()
    }

    async fn invoke(&self, params: &[Value], _manager: &RpcManager) -> clusterlib::Result<Value> {
        let mut first = params.first().cloned().unwrap_or(Value::Null);
        if let Some(obj) = first.as_object_mut() {
            obj.remove(RESP_QUEUE_KEY);
        }
        Ok(first)
    }
}

async fn server_queues(
    factory: &Factory,
    app_name: &str,
) -> (Arc<Notifyable>, Arc<Notifyable>) {
    let app = factory
        .get_root()
        .await
        .expect("failed to get root")
        .get_application(app_name, true)
        .await
        .expect("failed to resolve application")
        .expect("application missing");
    let recv = app
        .get_queue("recv", true)
        .await
        .expect("failed to create recv queue")
        .expect("recv queue missing");
    let completed = app
        .get_queue("completed", true)
        .await
        .expect("failed to create completed queue")
        .expect("completed queue missing");
    (recv, completed)
}

#[tokio::test]
async fn request_and_response_round_trip() {
    let storage = new_storage();
    let server = new_factory(&storage).await;
    let client = new_factory(&storage).await;
    let app_name = random_str(10);

    let (recv, completed) = server_queues(&server, &app_name).await;
    let manager = RpcManager::new(
        &server,
        recv.clone(),
        completed,
        RpcManagerConfig::default(),
        None,
    )
    .expect("failed to build manager");
    manager.register_method(Arc::new(Echo));

    let client_app = client
        .get_root()
        .await
        .expect("failed to get root")
        .get_application(&app_name, false)
        .await
        .expect("failed to resolve application")
        .expect("application missing");
    let resp_queue = client_app
        .get_queue("responses", true)
        .await
        .expect("failed to create response queue")
        .expect("response queue missing");
    let client_completed = client_app
        .get_queue("client-completed", true)
        .await
        .expect("failed to create completed queue")
        .expect("completed queue missing");
    JsonRpcResponseHandler::new(&client, resp_queue.clone(), client_completed);

    let mut request = RpcRequest::new(&client, "echo", vec![json!({"x": 1})]);
    request.set_resp_queue_key(resp_queue.key());
    request.send_request(recv.key()).await.expect("send failed");

    assert!(request
        .wait_msecs_response(5_000)
        .await
        .expect("response wait failed"));
    assert_eq!(request.get_response_result().expect("no result"), &json!({"x": 1}));
    assert_eq!(request.get_response_error().expect("no error field"), &Value::Null);
    assert_eq!(
        request.get_response_id().expect("no id field"),
        &Value::from(request.id().expect("no id").to_string())
    );
}

#[tokio::test]
async fn responses_arrive_before_any_wait() {
    // The dispatcher stores by id, so a response that lands before the
    // caller starts waiting is consumed immediately.
    let storage = new_storage();
    let server = new_factory(&storage).await;
    let client = new_factory(&storage).await;
    let app_name = random_str(10);

    let (recv, completed) = server_queues(&server, &app_name).await;
    let manager = RpcManager::new(
        &server,
        recv.clone(),
        completed,
        RpcManagerConfig::default(),
        None,
    )
    .expect("failed to build manager");
    manager.register_method(Arc::new(Echo));

    let client_app = client
        .get_root()
        .await
        .expect("failed to get root")
        .get_application(&app_name, false)
        .await
        .expect("failed to resolve application")
        .expect("application missing");
    let resp_queue = client_app
        .get_queue("responses", true)
        .await
        .expect("failed to create response queue")
        .expect("response queue missing");
    let client_completed = client_app
        .get_queue("client-completed", true)
        .await
        .expect("failed to create completed queue")
        .expect("completed queue missing");
    JsonRpcResponseHandler::new(&client, resp_queue.clone(), client_completed);

    let mut request = RpcRequest::new(&client, "echo", vec![json!({"n": 2})]);
    request.set_resp_queue_key(resp_queue.key());
    request.send_request(recv.key()).await.expect("send failed");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(request
        .wait_msecs_response(1_000)
        .await
        .expect("response wait failed"));
    assert_eq!(request.get_response_result().expect("no result"), &json!({"n": 2}));
}

#[tokio::test]
async fn completed_queue_stays_bounded() {
    let storage = new_storage();
    let server = new_factory(&storage).await;
    let app_name = random_str(10);

    let (recv, completed) = server_queues(&server, &app_name).await;
    let manager = RpcManager::new(
        &server,
        recv.clone(),
        completed.clone(),
        RpcManagerConfig {
            completed_queue_max_size: 2,
        },
        None,
    )
    .expect("failed to build manager");
    manager.register_method(Arc::new(Echo));

    for i in 0..5 {
        let mut request = RpcRequest::new(&server, "echo", vec![json!({"i": i})]);
        request.send_request(recv.key()).await.expect("send failed");
    }

    // Wait for the server to drain its receive queue.
    for _ in 0..100 {
        if recv.queue_empty().await.expect("size failed") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(recv.queue_empty().await.expect("size failed"));
    assert!(completed.queue_size().await.expect("size failed") <= 2);
}

#[tokio::test]
async fn malformed_invocations_land_on_the_completed_queue() {
    let storage = new_storage();
    let server = new_factory(&storage).await;
    let app_name = random_str(10);

    let (recv, completed) = server_queues(&server, &app_name).await;
    let _manager = RpcManager::new(
        &server,
        recv.clone(),
        completed.clone(),
        RpcManagerConfig::default(),
        None,
    )
    .expect("failed to build manager");

    recv.queue_put("this is not an envelope")
        .await
        .expect("put failed");

    let note = completed
        .queue_take_wait_msecs(5_000)
        .await
        .expect("take failed")
        .expect("no note on the completed queue");
    let note: Value = serde_json::from_str(&note).expect("note is not JSON");
    assert!(
        note.as_str().unwrap_or_default().starts_with("Caught exception:"),
        "unexpected note {note}"
    );
}

#[tokio::test]
async fn unknown_methods_produce_error_responses() {
    let storage = new_storage();
    let server = new_factory(&storage).await;
    let client = new_factory(&storage).await;
    let app_name = random_str(10);

    let (recv, completed) = server_queues(&server, &app_name).await;
    let _manager = RpcManager::new(
        &server,
        recv.clone(),
        completed,
        RpcManagerConfig::default(),
        None,
    )
    .expect("failed to build manager");

    let client_app = client
        .get_root()
        .await
        .expect("failed to get root")
        .get_application(&app_name, false)
        .await
        .expect("failed to resolve application")
        .expect("application missing");
    let resp_queue = client_app
        .get_queue("responses", true)
        .await
        .expect("failed to create response queue")
        .expect("response queue missing");
    let client_completed = client_app
        .get_queue("client-completed", true)
        .await
        .expect("failed to create completed queue")
        .expect("completed queue missing");
    JsonRpcResponseHandler::new(&client, resp_queue.clone(), client_completed);

    let mut request = RpcRequest::new(&client, "no-such-method", vec![json!({})]);
    request.set_resp_queue_key(resp_queue.key());
    request.send_request(recv.key()).await.expect("send failed");

    assert!(request
        .wait_msecs_response(5_000)
        .await
        .expect("response wait failed"));
    assert_eq!(request.get_response_result().expect("no result"), &Value::Null);
    assert!(request
        .get_response_error()
        .expect("no error field")
        .as_str()
        .unwrap_or_default()
        .contains("no-such-method"));
}

#[tokio::test]
async fn method_statuses_are_published_to_the_property_list() {
    let storage = new_storage();
    let server = new_factory(&storage).await;
    let app_name = random_str(10);

    let app = server
        .get_root()
        .await
        .expect("failed to get root")
        .get_application(&app_name, true)
        .await
        .expect("failed to resolve application")
        .expect("application missing");
    let (recv, completed) = server_queues(&server, &app_name).await;
    let status_plist = app
        .get_property_list("rpc-status", true)
        .await
        .expect("failed to create property list")
        .expect("property list missing");

    let manager = RpcManager::new(
        &server,
        recv,
        completed,
        RpcManagerConfig::default(),
        Some(status_plist.clone()),
    )
    .expect("failed to build manager");

    assert!(manager
        .set_method_status("first step done", 3, 2)
        .await
        .expect("status publish failed"));
    assert!(manager
        .set_method_status("second step done", 3, 2)
        .await
        .expect("status publish failed"));
    assert!(manager
        .set_method_status("third step done", 3, 2)
        .await
        .expect("status publish failed"));

    let key_values = status_plist.cached_key_values().expect("not a property list");
    key_values.load(false).await.expect("reload failed");
    let status_key = key_values
        .keys()
        .into_iter()
        .find(|k| k.ends_with("request status"))
        .expect("no status key published");
    let statuses = key_values.get_local(&status_key).expect("status entry gone");
    let statuses = statuses.as_array().expect("statuses are not an array");
    // Trimmed to the last two entries.
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0][0], json!("second step done"));
    assert_eq!(statuses[1][0], json!("third step done"));
}
