//! JSON-RPC 1.0 over repository-backed queues.
//!
//! A request envelope is `{"method", "params", "id"}` with
//! `id = hostname:pid:tid:counter`.  The client side correlates responses
//! by id through the response signal map; the server side drains its
//! receive queue, dispatches each envelope to a registered method exactly
//! once, and routes the result to the caller's response queue when one was
//! supplied, falling back to (and bounding) the completed queue.

use {
    crate::{
        cache::{Factory, FactoryOps},
        config::RpcManagerConfig,
        error::{Error, Result},
        event::{UserEventHandler, UserEventPayload},
        ids,
        key::NotifyableKind,
        lock::DistributedLockMode,
        notifyable::Notifyable,
    },
    async_trait::async_trait,
    serde_json::{json, Map, Value},
    std::{
        collections::HashMap,
        sync::{atomic::Ordering, Arc, Mutex, Weak},
    },
    tracing::{debug, warn},
};

/// Params-object key carrying the caller's response queue.
pub const RESP_QUEUE_KEY: &str = "_respQueueKey";

const METHOD_KEY: &str = "method";
const PARAMS_KEY: &str = "params";
const ID_KEY: &str = "id";
const RESULT_KEY: &str = "result";
const ERROR_KEY: &str = "error";

/// Status keys published into the manager's property list are
/// `"<hostname:pid:tid> <suffix>"`.
const REQUEST_SUFFIX: &str = "current request";
const REQUEST_STATUS_SUFFIX: &str = "request status";

const STATUS_LOCK_NAME: &str = "statusUpdate";
const STATUS_LOCK_WAIT_MSECS: i64 = 100;
const RESP_QUEUE_TAKE_MSECS: i64 = 500;
const COMPLETED_DRAIN_TAKE_MSECS: i64 = 100;

/// An envelope is a JSON-RPC 1.0 request iff it carries exactly `method`,
/// `params`, and `id`.
pub fn is_valid_json_rpc_request(envelope: &Map<String, Value>) -> bool {
    envelope.contains_key(METHOD_KEY)
        && envelope.contains_key(PARAMS_KEY)
        && envelope.contains_key(ID_KEY)
        && envelope.len() == 3
}

///
/// Client-side request: send on a destination queue, then rendezvous with
/// the response by id.
///
pub struct RpcRequest {
    ops: Arc<FactoryOps>,
    method: String,
    params: Vec<Value>,
    resp_queue_key: Option<String>,
    id: Option<String>,
    response: Option<Map<String, Value>>,
}

impl RpcRequest {
    pub fn new(factory: &Factory, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            ops: factory.ops().clone(),
            method: method.into(),
            params,
            resp_queue_key: None,
            id: None,
            response: None,
        }
    }

    /// Routes the response to this queue instead of the server's completed
    /// queue.
    pub fn set_resp_queue_key(&mut self, queue_key: impl Into<String>) {
        self.resp_queue_key = Some(queue_key.into());
    }

    pub fn resp_queue_key(&self) -> Option<&str> {
        self.resp_queue_key.as_deref()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    ///
    /// Encodes and enqueues the request on the destination queue,
    /// registering the response rendezvous first.
    ///
    pub async fn send_request(&mut self, destination_queue_key: &str) -> Result<()> {
        let queue = self
            .ops
            .get_notifyable_from_key(NotifyableKind::Queue, destination_queue_key, false)
            .await?
            .ok_or_else(|| {
                Error::InvalidArguments(format!(
                    "no queue at key {destination_queue_key} to send to"
                ))
            })?;

        let id = format!(
            "{}:{}",
            ids::hostname_pid_tid(),
            self.ops.request_counter.fetch_add(1, Ordering::SeqCst)
        );
        self.ops.response_signal_map.add_ref(&id);

        if let Some(resp_queue_key) = &self.resp_queue_key {
            if self.params.is_empty() {
                self.params.push(json!({ RESP_QUEUE_KEY: resp_queue_key }));
            } else {
                let first = self.params[0].as_object_mut().ok_or_else(|| {
                    Error::InvalidArguments(
                        "the first request param must be an object to carry the response queue"
                            .to_string(),
                    )
                })?;
                first.insert(RESP_QUEUE_KEY.to_string(), Value::from(resp_queue_key.clone()));
            }
        }

        let envelope = json!({
            METHOD_KEY: self.method,
            PARAMS_KEY: self.params,
            ID_KEY: id,
        });
        debug!(queue = %queue.key(), %id, method = %self.method, "sending request");
        queue.queue_put(&envelope.to_string()).await?;
        self.id = Some(id);
        Ok(())
    }

    /// Waits for the response without a deadline.
    pub async fn wait_response(&mut self) -> Result<()> {
        if !self.wait_msecs_response(-1).await? {
            return Err(Error::InconsistentInternalState(
                "an unbounded response wait returned empty".to_string(),
            ));
        }
        Ok(())
    }

    ///
    /// Waits up to `msecs` for the response (negative waits forever, zero
    /// polls).  Returns whether the response arrived.
    ///
    pub async fn wait_msecs_response(&mut self, msecs: i64) -> Result<bool> {
        if self.response.is_some() {
            return Ok(true);
        }
        let id = self.id.clone().ok_or_else(|| {
            Error::InvalidMethod("wait_msecs_response called before send_request".to_string())
        })?;

        let usecs = if msecs < 0 { -1 } else { msecs.saturating_mul(1000) };
        if !self.ops.response_signal_map.wait_usecs(&id, usecs).await? {
            return Ok(false);
        }
        self.ops.response_signal_map.remove_ref(&id)?;
        let (_, response) = self.ops.id_responses.remove(&id).ok_or_else(|| {
            Error::InconsistentInternalState(format!("response for {id} was signaled but absent"))
        })?;
        self.response = Some(response);
        Ok(true)
    }

    pub fn get_response(&self) -> Result<&Map<String, Value>> {
        self.response.as_ref().ok_or_else(|| {
            Error::InvalidMethod(format!(
                "response not received yet for {}",
                self.method
            ))
        })
    }

    pub fn get_response_result(&self) -> Result<&Value> {
        self.response_field(RESULT_KEY)
    }

    pub fn get_response_error(&self) -> Result<&Value> {
        self.response_field(ERROR_KEY)
    }

    pub fn get_response_id(&self) -> Result<&Value> {
        self.response_field(ID_KEY)
    }

    fn response_field(&self, field: &str) -> Result<&Value> {
        self.get_response()?.get(field).ok_or_else(|| {
            Error::InconsistentInternalState(format!("no '{field}' in the response envelope"))
        })
    }
}

///
/// A server-side method.  `invoke` runs at most once per received envelope
/// and may publish progress through the manager's status property list.
///
#[async_trait]
pub trait RpcMethod: Send + Sync {
    fn name(&self) -> String;
    async fn invoke(&self, params: &[Value], manager: &RpcManager) -> Result<Value>;
}

///
/// Server side of the fabric: drains a receive queue, dispatches envelopes
/// to registered methods, and publishes results and statuses.
///
pub struct RpcManager {
    ops: Arc<FactoryOps>,
    recv_queue: Arc<Notifyable>,
    completed_queue: Arc<Notifyable>,
    completed_queue_max_size: i32,
    methods: Mutex<HashMap<String, Arc<dyn RpcMethod>>>,
    status_property_list: Option<Arc<Notifyable>>,
}

impl RpcManager {
    ///
    /// Builds the manager and hooks it onto its receive queue's events;
    /// incoming envelopes are served from the factory's user-event worker.
    ///
    pub fn new(
        factory: &Factory,
        recv_queue: Arc<Notifyable>,
        completed_queue: Arc<Notifyable>,
        config: RpcManagerConfig,
        status_property_list: Option<Arc<Notifyable>>,
    ) -> Result<Arc<Self>> {
        if recv_queue.kind() != NotifyableKind::Queue {
            return Err(Error::InvalidArguments("no valid receive queue".to_string()));
        }
        if completed_queue.kind() != NotifyableKind::Queue {
            return Err(Error::InvalidArguments("no valid completed queue".to_string()));
        }
        if config.completed_queue_max_size < -1 {
            return Err(Error::InvalidArguments(
                "no valid completed queue max size".to_string(),
            ));
        }
        if let Some(plist) = &status_property_list {
            if plist.kind() != NotifyableKind::PropertyList {
                return Err(Error::InvalidArguments(
                    "no valid status property list".to_string(),
                ));
            }
        }
        let manager = Arc::new(Self {
            ops: factory.ops().clone(),
            recv_queue,
            completed_queue,
            completed_queue_max_size: config.completed_queue_max_size,
            methods: Mutex::new(HashMap::new()),
            status_property_list,
        });
        let handler = Arc::new(RpcManagerHandler {
            manager: Arc::downgrade(&manager),
        });
        factory.register_user_event_handler(manager.recv_queue.key(), handler);
        Ok(manager)
    }

    pub fn register_method(&self, method: Arc<dyn RpcMethod>) {
        self.methods
            .lock()
            .expect("method table poisoned")
            .insert(method.name(), method);
    }

    pub fn recv_queue(&self) -> &Arc<Notifyable> {
        &self.recv_queue
    }

    pub fn completed_queue(&self) -> &Arc<Notifyable> {
        &self.completed_queue
    }

    ///
    /// Serves one received envelope: decode, publish the starting status,
    /// dispatch, publish the finished status, and route the result.  A
    /// malformed envelope lands on the completed queue as an error string
    /// instead of tearing the server down.
    ///
    pub async fn invoke_and_resp(&self, encoded: &str) -> Result<()> {
        match self.invoke_and_resp_inner(encoded).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let note = Value::from(format!("Caught exception: {e}"));
                warn!(
                    "could not parse or service an invocation, noting it on the completed queue: {e}"
                );
                self.completed_queue.queue_put(&note.to_string()).await?;
                Ok(())
            }
        }
    }

    async fn invoke_and_resp_inner(&self, encoded: &str) -> Result<()> {
        let envelope: Map<String, Value> = serde_json::from_str(encoded).map_err(|e| {
            Error::InvalidArguments(format!("undecodable invocation envelope: {e}"))
        })?;
        if !is_valid_json_rpc_request(&envelope) {
            return Err(Error::InvalidArguments(
                "envelope is not a JSON-RPC 1.0 request".to_string(),
            ));
        }
        let request = Value::Object(envelope.clone());
        self.set_basic_request_status(&request, true, -1).await?;

        let method_name = envelope
            .get(METHOD_KEY)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let params: Vec<Value> = envelope
            .get(PARAMS_KEY)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let id = envelope.get(ID_KEY).cloned().unwrap_or(Value::Null);

        let method = self
            .methods
            .lock()
            .expect("method table poisoned")
            .get(&method_name)
            .cloned();
        let response = match method {
            Some(method) => match method.invoke(&params, self).await {
                Ok(result) => json!({ RESULT_KEY: result, ERROR_KEY: Value::Null, ID_KEY: id }),
                Err(e) => {
                    json!({ RESULT_KEY: Value::Null, ERROR_KEY: e.to_string(), ID_KEY: id })
                }
            },
            None => json!({
                RESULT_KEY: Value::Null,
                ERROR_KEY: format!("no method registered for '{method_name}'"),
                ID_KEY: id,
            }),
        };

        self.set_basic_request_status(&request, false, -1).await?;

        let encoded_response = response.to_string();
        let msecs = ids::current_time_msecs();
        let completed_entry =
            json!([response, msecs, ids::msecs_time_string(msecs)]).to_string();

        let resp_queue_key = params
            .first()
            .and_then(Value::as_object)
            .and_then(|first| first.get(RESP_QUEUE_KEY))
            .and_then(Value::as_str)
            .map(str::to_string);

        match resp_queue_key {
            None => {
                self.completed_queue.queue_put(&completed_entry).await?;
            }
            Some(resp_queue_key) => {
                let resp_queue = self
                    .ops
                    .get_notifyable_from_key(NotifyableKind::Queue, &resp_queue_key, false)
                    .await?;
                match resp_queue {
                    Some(resp_queue) => {
                        resp_queue.queue_put(&encoded_response).await?;
                        if self.completed_queue_max_size == -1 || self.completed_queue_max_size > 0
                        {
                            self.completed_queue.queue_put(&completed_entry).await?;
                        }
                    }
                    None => {
                        warn!(
                            queue = %resp_queue_key,
                            "caller's response queue is unresolvable, using the completed queue"
                        );
                        self.completed_queue.queue_put(&completed_entry).await?;
                    }
                }
            }
        }

        // Bound the completed queue; approximate under concurrent takers.
        while self.completed_queue_max_size != -1
            && self.completed_queue.queue_size().await? > self.completed_queue_max_size as usize
        {
            self.completed_queue
                .queue_take_wait_msecs(COMPLETED_DRAIN_TAKE_MSECS)
                .await?;
        }
        Ok(())
    }

    ///
    /// Appends `[status, epochMsecs, timeString]` to this caller's method
    /// status entry in the status property list, trimming to `max_shown`
    /// entries.  Retries `PublishVersion` losses up to `max_retries`
    /// (negative retries forever).  Returns whether the status went out.
    ///
    pub async fn set_method_status(
        &self,
        status: &str,
        max_retries: i32,
        max_shown: i32,
    ) -> Result<bool> {
        let msecs = ids::current_time_msecs();
        let entry = json!([status, msecs, ids::msecs_time_string(msecs)]);
        self.publish_status(REQUEST_STATUS_SUFFIX, max_retries, move |previous| {
            let mut all: Vec<Value> = previous
                .and_then(|raw| serde_json::from_value(raw.clone()).ok())
                .unwrap_or_default();
            all.push(entry.clone());
            while max_shown != -1 && all.len() > max_shown as usize {
                all.remove(0);
            }
            Value::from(all)
        })
        .await
    }

    ///
    /// Publishes the basic `"Starting the request"` / `"Finished the
    /// request"` status for an envelope being served.
    ///
    pub async fn set_basic_request_status(
        &self,
        request: &Value,
        starting_request: bool,
        max_retries: i32,
    ) -> Result<bool> {
        let status = if starting_request {
            "Starting the request"
        } else {
            "Finished the request"
        };
        let msecs = ids::current_time_msecs();
        let value = json!({
            "request": request,
            "basic status": [status, msecs, ids::msecs_time_string(msecs)],
        });
        self.publish_status(REQUEST_SUFFIX, max_retries, move |_| value.clone())
            .await
    }

    /// The shared lock-edit-publish-retry loop behind both status calls.
    async fn publish_status(
        &self,
        suffix: &str,
        max_retries: i32,
        build: impl Fn(Option<&Value>) -> Value,
    ) -> Result<bool> {
        let Some(plist) = &self.status_property_list else {
            return Ok(false);
        };
        let status_key = format!("{} {}", ids::hostname_pid_tid(), suffix);

        let mut retries = 0;
        while max_retries == -1 || retries <= max_retries {
            let got_lock = plist
                .acquire_lock_wait_msecs(
                    STATUS_LOCK_WAIT_MSECS,
                    STATUS_LOCK_NAME,
                    DistributedLockMode::Exclusive,
                )
                .await?;
            if got_lock {
                let key_values = plist.cached_key_values()?;
                // Refetch so the conditional publish starts from the
                // repository's latest version.
                key_values.load(false).await?;
                let previous = key_values.get_local(&status_key);
                key_values.set(&status_key, build(previous.as_ref()));

                let published = key_values.publish(false).await;
                plist.release_lock(STATUS_LOCK_NAME).await?;
                match published {
                    Ok(_) => return Ok(true),
                    Err(Error::PublishVersion(_)) => {
                        warn!(
                            %status_key,
                            retries, "status publish lost a version race, retrying"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
            retries += 1;
        }
        Ok(false)
    }
}

/// Receive-queue hook: serves every waiting envelope on each queue event.
struct RpcManagerHandler {
    manager: Weak<RpcManager>,
}

#[async_trait]
impl UserEventHandler for RpcManagerHandler {
    async fn handle_user_event(&self, _payload: &UserEventPayload) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        loop {
            let next = match manager.recv_queue.queue_take_wait_msecs(0).await {
                Ok(next) => next,
                Err(e) => {
                    warn!("receive queue drain failed: {e}");
                    return;
                }
            };
            let Some(encoded) = next else {
                return;
            };
            if let Err(e) = manager.invoke_and_resp(&encoded).await {
                warn!("invocation failed terminally: {e}");
            }
        }
    }
}

///
/// Client-side response dispatcher: drains a response queue, stores each
/// envelope by id, and signals the waiting request.  Payloads that are not
/// JSON-RPC envelopes are forwarded to the completed queue rather than
/// dropped.
///
pub struct JsonRpcResponseHandler {
    ops: Weak<FactoryOps>,
    resp_queue: Arc<Notifyable>,
    completed_queue: Arc<Notifyable>,
}

impl JsonRpcResponseHandler {
    /// Builds the dispatcher and hooks it onto the response queue's events.
    pub fn new(
        factory: &Factory,
        resp_queue: Arc<Notifyable>,
        completed_queue: Arc<Notifyable>,
    ) -> Arc<Self> {
        let handler = Arc::new(Self {
            ops: Arc::downgrade(factory.ops()),
            resp_queue,
            completed_queue,
        });
        factory.register_user_event_handler(handler.resp_queue.key(), handler.clone());
        handler
    }
}

#[async_trait]
impl UserEventHandler for JsonRpcResponseHandler {
    async fn handle_user_event(&self, _payload: &UserEventPayload) {
        let Some(ops) = self.ops.upgrade() else {
            return;
        };
        match self.resp_queue.queue_empty().await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                warn!("response queue peek failed: {e}");
                return;
            }
        }

        loop {
            let next = match self
                .resp_queue
                .queue_take_wait_msecs(RESP_QUEUE_TAKE_MSECS)
                .await
            {
                Ok(Some(next)) => next,
                Ok(None) => return,
                Err(e) => {
                    warn!("response queue drain failed: {e}");
                    return;
                }
            };

            let decoded: std::result::Result<Map<String, Value>, _> =
                serde_json::from_str(&next);
            let id = decoded.ok().and_then(|response| {
                response
                    .get(ID_KEY)
                    .and_then(Value::as_str)
                    .map(|id| (id.to_string(), response.clone()))
            });
            match id {
                Some((id, response)) => {
                    debug!(%id, "response received");
                    ops.id_responses.insert(id.clone(), response);
                    ops.response_signal_map.signal(&id);
                }
                None => {
                    warn!("non JSON-RPC payload on the response queue, moving it along");
                    if let Err(e) = self.completed_queue.queue_put(&next).await {
                        warn!("could not forward the bad payload: {e}");
                    }
                }
            }
        }
    }
}
