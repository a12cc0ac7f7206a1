use {
    super::{
        CreateMode, ErrorCode, KeeperState, RawEvent, SessionId, Stat, Storage, StoreResult,
        WatchContext, WatchedEventType, SEQUENCE_NUMBER_WIDTH,
    },
    crate::{
        config::RepositoryConfig,
        error::{Error, Result},
    },
    async_trait::async_trait,
    futures::future::join_all,
    retry::delay::Fixed,
    std::{
        future::Future,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    },
    tokio::sync::{mpsc, Notify},
    tracing::{debug, error, info, trace, warn},
};

/// Synthetic control paths carried in-band on the event channels; never used
/// as real repository paths.
pub(crate) const END_EVENT_PATH: &str = "__END_EVENT__";
pub(crate) const SYNC_EVENT_PATH: &str = "__SYNC__";

const RETRY_DELAY_MSECS: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Disconnected,
    Connecting,
    Connected,
    SessionExpired,
    NoReconnect,
}

///
/// Consumer of user-level repository events.
///
/// Listeners run on the adapter's user-event worker; they may perform
/// repository I/O but must not wait for a watch firing this same worker
/// would have to deliver.
///
#[async_trait]
pub trait RepositoryEventListener: Send + Sync {
    async fn event_received(&self, event: &RawEvent);
}

///
/// Session, watch, and retry layer over a raw store.
///
/// Two worker tasks form the delivery pipeline: the raw-event worker drains
/// the store's channel, folds session transitions into the adapter state,
/// and forwards everything to the user-event channel; the user-event worker
/// dispatches each event either to the dedicated watch listener (events that
/// carry a context) or to every registered listener.  Both exit when the
/// synthetic end event comes through, injected exactly once by
/// `disconnect(true)`.
///
pub struct RepositoryAdapter {
    storage: Arc<dyn Storage>,
    config: RepositoryConfig,
    state: Mutex<AdapterState>,
    state_changed: Notify,
    session: Mutex<Option<SessionId>>,
    raw_tx: mpsc::UnboundedSender<RawEvent>,
    listeners: Mutex<Vec<Arc<dyn RepositoryEventListener>>>,
    watch_listener: Mutex<Option<Arc<dyn RepositoryEventListener>>>,
    end_injected: AtomicBool,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl RepositoryAdapter {
    /// Builds the adapter and starts its two event workers.  No connection
    /// is made until `reconnect`.
    pub fn new(storage: Arc<dyn Storage>, config: RepositoryConfig) -> Arc<Self> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (user_tx, user_rx) = mpsc::unbounded_channel();

        let adapter = Arc::new(Self {
            storage,
            config,
            state: Mutex::new(AdapterState::Disconnected),
            state_changed: Notify::new(),
            session: Mutex::new(None),
            raw_tx,
            listeners: Mutex::new(Vec::new()),
            watch_listener: Mutex::new(None),
            end_injected: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        });

        let raw_worker = tokio::spawn(Self::process_events(adapter.clone(), raw_rx, user_tx));
        let user_worker = tokio::spawn(Self::process_user_events(adapter.clone(), user_rx));
        adapter
            .workers
            .lock()
            .expect("worker lock poisoned")
            .extend([raw_worker, user_worker]);
        adapter
    }

    pub fn state(&self) -> AdapterState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn is_connected(&self) -> bool {
        self.state() == AdapterState::Connected
    }

    pub fn add_listener(&self, listener: Arc<dyn RepositoryEventListener>) {
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .push(listener);
    }

    /// Installs the consumer for events that carry a watch context.
    pub fn set_watch_listener(&self, listener: Arc<dyn RepositoryEventListener>) {
        *self.watch_listener.lock().expect("listener lock poisoned") = Some(listener);
    }

    pub async fn reconnect(&self) -> Result<()> {
        if self.state() == AdapterState::NoReconnect {
            return Err(Error::InvalidMethod(
                "reconnect: no reconnection is allowed".to_string(),
            ));
        }
        self.disconnect(false).await;

        info!(hosts = %self.config.hosts, "connecting to the repository");
        // Enter CONNECTING before the store can emit its session event, so
        // the raw worker's CONNECTED transition is never clobbered.
        self.set_state(AdapterState::Connecting);
        let session = match self.storage.connect(self.raw_tx.clone()).await {
            Ok(session) => session,
            Err(code) => {
                self.set_state(AdapterState::Disconnected);
                return Err(map_code(code, "connect"));
            }
        };
        *self.session.lock().expect("session lock poisoned") = Some(session);
        Ok(())
    }

    /// Tears the session down.  With `final_disconnect` the end event is
    /// injected (exactly once) and the adapter refuses future reconnects.
    pub async fn disconnect(&self, final_disconnect: bool) {
        let session = self.session.lock().expect("session lock poisoned").take();
        if let Some(session) = session {
            if let Err(code) = self.storage.close(session).await {
                error!(?code, "error while closing the repository session");
            }
        }
        if final_disconnect {
            self.set_state(AdapterState::NoReconnect);
            self.inject_end_event();
        } else {
            self.set_state(AdapterState::Disconnected);
        }
    }

    /// Final disconnect plus a join on both event workers.
    pub async fn shutdown(&self) {
        self.disconnect(true).await;
        let workers: Vec<_> = self
            .workers
            .lock()
            .expect("worker lock poisoned")
            .drain(..)
            .collect();
        for result in join_all(workers).await {
            if let Err(e) = result {
                error!("event worker ended abnormally: {e}");
            }
        }
    }

    pub async fn wait_until_connected(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.config.connect_timeout_msecs.max(0) as u64);
        loop {
            let notified = self.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.state() {
                AdapterState::Connected => return Ok(()),
                AdapterState::Disconnected => {
                    return Err(Error::NotConnected(
                        "disconnected; call reconnect() before using the repository".to_string(),
                    ))
                }
                AdapterState::NoReconnect => {
                    return Err(Error::NotConnected("adapter is shut down".to_string()))
                }
                AdapterState::SessionExpired => {
                    if !self.config.auto_reconnect {
                        return Err(Error::NotConnected(
                            "session expired and auto-reconnect is off".to_string(),
                        ));
                    }
                    info!("reconnecting because the current session has expired");
                    Box::pin(self.reconnect()).await?;
                }
                AdapterState::Connecting => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(Error::NotConnected(
                            "timed out while waiting for the repository connection".to_string(),
                        ));
                    }
                }
            }
        }
    }

    async fn verify_connection(&self) -> Result<()> {
        match self.state() {
            AdapterState::Connected => Ok(()),
            AdapterState::Disconnected => Err(Error::NotConnected(
                "disconnected; call reconnect() before using the repository".to_string(),
            )),
            AdapterState::NoReconnect => {
                Err(Error::NotConnected("adapter is shut down".to_string()))
            }
            AdapterState::Connecting | AdapterState::SessionExpired => {
                self.wait_until_connected().await
            }
        }
    }

    fn current_session(&self) -> Result<SessionId> {
        self.session
            .lock()
            .expect("session lock poisoned")
            .ok_or_else(|| Error::NotConnected("no repository session".to_string()))
    }

    fn set_state(&self, new_state: AdapterState) {
        let mut state = self.state.lock().expect("state lock poisoned");
        if *state != new_state {
            info!(from = ?*state, to = ?new_state, "adapter state transition");
            *state = new_state;
            self.state_changed.notify_waiters();
        }
    }

    fn inject_end_event(&self) {
        if !self.end_injected.swap(true, Ordering::SeqCst) {
            let _ = self.raw_tx.send(RawEvent {
                event_type: WatchedEventType::Session,
                state: KeeperState::Expired,
                path: END_EVENT_PATH.to_string(),
                context: None,
            });
        }
    }

    fn is_end_event(event: &RawEvent) -> bool {
        event.event_type == WatchedEventType::Session
            && event.state == KeeperState::Expired
            && event.path == END_EVENT_PATH
            && event.context.is_none()
    }

    async fn process_events(
        self: Arc<Self>,
        mut raw_rx: mpsc::UnboundedReceiver<RawEvent>,
        user_tx: mpsc::UnboundedSender<RawEvent>,
    ) {
        debug!("raw-event worker started");
        while let Some(event) = raw_rx.recv().await {
            if event.event_type == WatchedEventType::Session {
                match event.state {
                    KeeperState::SyncConnected => self.set_state(AdapterState::Connected),
                    KeeperState::Connecting => self.set_state(AdapterState::Connecting),
                    KeeperState::Expired if event.path != END_EVENT_PATH => {
                        self.set_state(AdapterState::SessionExpired)
                    }
                    _ => {}
                }
            }
            trace!(?event.event_type, path = %event.path, "raw event forwarded");
            let end = Self::is_end_event(&event);
            let _ = user_tx.send(event);
            if end {
                break;
            }
        }
        debug!("raw-event worker stopped");
    }

    async fn process_user_events(self: Arc<Self>, mut user_rx: mpsc::UnboundedReceiver<RawEvent>) {
        debug!("user-event worker started");
        while let Some(event) = user_rx.recv().await {
            if Self::is_end_event(&event) {
                break;
            }
            self.handle_async_event(&event).await;
        }
        debug!("user-event worker stopped");
    }

    async fn handle_async_event(&self, event: &RawEvent) {
        let dedicated = match &event.context {
            Some(WatchContext::Broadcast) | None => None,
            Some(_) => self
                .watch_listener
                .lock()
                .expect("listener lock poisoned")
                .clone(),
        };
        match dedicated {
            Some(listener) => listener.event_received(event).await,
            None => {
                let listeners: Vec<_> = self
                    .listeners
                    .lock()
                    .expect("listener lock poisoned")
                    .clone();
                for listener in listeners {
                    listener.event_received(event).await;
                }
            }
        }
    }

    async fn retry_op<A, T, F, Fut>(&self, args: A, mut f: F, what: &str) -> Result<T>
    where
        A: Clone,
        F: FnMut(Arc<dyn Storage>, SessionId, A) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let budget = if self.config.auto_reconnect { 2 } else { 0 };
        let mut delays = Fixed::from_millis(RETRY_DELAY_MSECS).take(budget);
        loop {
            self.verify_connection().await?;
            let session = loop {
                match self.current_session() {
                    Ok(session) => break session,
                    // The CONNECTED transition can land an instant before
                    // the session id is stored; let the connector finish.
                    Err(_) if self.state() == AdapterState::Connected => {
                        tokio::task::yield_now().await
                    }
                    Err(e) => return Err(e),
                }
            };
            match f(self.storage.clone(), session, args.clone()).await {
                Ok(value) => return Ok(value),
                Err(code) if retry_on_error(code) => match delays.next() {
                    Some(delay) => {
                        warn!(?code, what, "retrying repository operation");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(map_code(code, what)),
                },
                Err(code) => return Err(map_code(code, what)),
            }
        }
    }

    ///
    /// Creates a node, optionally materializing missing ancestors first.
    ///
    /// Returns the created path, or `None` when the node already existed.
    ///
    pub async fn create(
        &self,
        path: &str,
        data: &str,
        mode: CreateMode,
        create_ancestors: bool,
    ) -> Result<Option<String>> {
        validate_path(path)?;
        match self.create_inner(path, data, mode).await {
            Ok(created) => Ok(Some(created)),
            Err(Error::NodeExists(_)) => {
                debug!(path, "create: node already exists");
                Ok(None)
            }
            Err(Error::NoNode(_)) if create_ancestors => {
                for prefix in ancestor_paths(path) {
                    match self.create_inner(&prefix, "", CreateMode::Persistent).await {
                        Ok(_) | Err(Error::NodeExists(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                match self.create_inner(path, data, mode).await {
                    Ok(created) => Ok(Some(created)),
                    Err(Error::NodeExists(_)) => Ok(None),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn create_inner(&self, path: &str, data: &str, mode: CreateMode) -> Result<String> {
        self.retry_op(
            (path.to_string(), data.to_string(), mode),
            |storage, session, (path, data, mode)| async move {
                storage.create(session, &path, &data, mode).await
            },
            path,
        )
        .await
    }

    /// Creates a sequence node under `path_prefix` and returns its assigned
    /// sequence number.
    pub async fn create_sequence(
        &self,
        path_prefix: &str,
        data: &str,
        ephemeral: bool,
        create_ancestors: bool,
    ) -> Result<i64> {
        let mode = if ephemeral {
            CreateMode::EphemeralSequential
        } else {
            CreateMode::PersistentSequential
        };
        let created = self
            .create(path_prefix, data, mode, create_ancestors)
            .await?
            .ok_or_else(|| {
                Error::InconsistentInternalState(format!(
                    "sequence create of {path_prefix} reported an existing node"
                ))
            })?;
        if !created.starts_with(path_prefix) {
            return Err(Error::InconsistentInternalState(format!(
                "expected created path {created} to start with {path_prefix}"
            )));
        }
        let (_, sequence) = split_sequence_node(&created)?;
        Ok(sequence)
    }

    ///
    /// Deletes a node; with `recursive`, descendants are removed leaves
    /// first when the node turns out not to be empty.
    ///
    /// Returns false when the node was already gone.
    ///
    pub async fn delete(&self, path: &str, recursive: bool, version: i32) -> Result<bool> {
        validate_path(path)?;
        match self.delete_inner(path, version).await {
            Ok(()) => Ok(true),
            Err(Error::NoNode(_)) => {
                debug!(path, "delete: node already gone");
                Ok(false)
            }
            Err(Error::NotEmpty(_)) if recursive => {
                let mut order = Vec::new();
                let mut stack = vec![path.to_string()];
                while let Some(current) = stack.pop() {
                    stack.extend(self.get_children(&current, None).await?);
                    order.push(current);
                }
                for current in order.iter().rev() {
                    match self.delete_inner(current, -1).await {
                        Ok(()) | Err(Error::NoNode(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_inner(&self, path: &str, version: i32) -> Result<()> {
        self.retry_op(
            (path.to_string(), version),
            |storage, session, (path, version)| async move {
                storage.delete(session, &path, version).await
            },
            path,
        )
        .await
    }

    pub async fn exists(&self, path: &str, watch: Option<WatchContext>) -> Result<Option<Stat>> {
        validate_path(path)?;
        self.retry_op(
            (path.to_string(), watch),
            |storage, session, (path, watch)| async move {
                storage.exists(session, &path, watch).await
            },
            path,
        )
        .await
    }

    /// Reads node data.  `None` when the node does not exist; the watch, if
    /// any, is only installed on a successful read.
    pub async fn get_data(
        &self,
        path: &str,
        watch: Option<WatchContext>,
    ) -> Result<Option<(String, Stat)>> {
        validate_path(path)?;
        let result = self
            .retry_op(
                (path.to_string(), watch),
                |storage, session, (path, watch)| async move {
                    storage.get_data(session, &path, watch).await
                },
                path,
            )
            .await;
        match result {
            Ok(found) => Ok(Some(found)),
            Err(Error::NoNode(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn set_data(&self, path: &str, data: &str, version: i32) -> Result<Stat> {
        validate_path(path)?;
        self.retry_op(
            (path.to_string(), data.to_string(), version),
            |storage, session, (path, data, version)| async move {
                storage.set_data(session, &path, &data, version).await
            },
            path,
        )
        .await
    }

    /// Sorted absolute paths of a node's children; empty when the node does
    /// not exist.
    pub async fn get_children(
        &self,
        path: &str,
        watch: Option<WatchContext>,
    ) -> Result<Vec<String>> {
        validate_path(path)?;
        let result = self
            .retry_op(
                (path.to_string(), watch),
                |storage, session, (path, watch)| async move {
                    storage.get_children(session, &path, watch).await
                },
                path,
            )
            .await;
        let names = match result {
            Ok(names) => names,
            Err(Error::NoNode(_)) => {
                debug!(path, "get_children: node does not exist");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        let mut absolute: Vec<String> = names
            .into_iter()
            .map(|name| {
                if path == "/" {
                    format!("/{name}")
                } else {
                    format!("{path}/{name}")
                }
            })
            .collect();
        absolute.sort();
        Ok(absolute)
    }

    ///
    /// Issues a store sync, then posts the synthetic sync event on the raw
    /// channel.  The store delivers watch firings before the sync completes
    /// and both event queues are FIFO, so every firing produced before this
    /// call reaches the user-event worker ahead of the token.  That ordering
    /// is what `synchronize()` depends on.
    ///
    pub async fn sync(&self, path: &str, token: &str) -> Result<()> {
        validate_path(path)?;
        self.retry_op(
            (path.to_string(),),
            |storage, session, (path,)| async move { storage.sync(session, &path).await },
            path,
        )
        .await?;
        let _ = self.raw_tx.send(RawEvent {
            event_type: WatchedEventType::Session,
            state: KeeperState::SyncConnected,
            path: SYNC_EVENT_PATH.to_string(),
            context: Some(WatchContext::Sync {
                token: token.to_string(),
            }),
        });
        Ok(())
    }
}

/// Reassembles the path of a sequence node from its prefix and number.
pub fn sequence_node_path(path_prefix: &str, sequence: i64) -> String {
    format!("{path_prefix}{sequence:0width$}", width = SEQUENCE_NUMBER_WIDTH)
}

///
/// Splits a sequence node path into its logical name and the fixed-width
/// decimal suffix assigned by the store.
///
pub fn split_sequence_node(sequence_node: &str) -> Result<(String, i64)> {
    if sequence_node.len() < SEQUENCE_NUMBER_WIDTH {
        return Err(Error::InconsistentInternalState(format!(
            "sequence node {sequence_node} is too small to split"
        )));
    }
    let split_at = sequence_node.len() - SEQUENCE_NUMBER_WIDTH;
    let (name, suffix) = sequence_node.split_at(split_at);
    if !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InconsistentInternalState(format!(
            "expected a sequence number but got {suffix}"
        )));
    }
    let sequence = suffix.parse::<i64>().map_err(|e| {
        Error::InconsistentInternalState(format!("unparseable sequence suffix {suffix}: {e}"))
    })?;
    Ok((name.to_string(), sequence))
}

pub fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(Error::InvalidArguments(format!(
            "node path must start with '/' but it was '{path}'"
        )));
    }
    if path.len() > 1 {
        if path.ends_with('/') {
            return Err(Error::InvalidArguments(format!(
                "node path must not end with '/' but it was '{path}'"
            )));
        }
        if path.contains("//") {
            return Err(Error::InvalidArguments(format!(
                "node path must not contain '//' but it was '{path}'"
            )));
        }
    }
    Ok(())
}

/// Proper ancestor paths of `path`, shortest first, excluding the root.
fn ancestor_paths(path: &str) -> Vec<String> {
    let mut prefixes = Vec::new();
    let mut pos = 1;
    while let Some(next) = path[pos..].find('/') {
        prefixes.push(path[..pos + next].to_string());
        pos += next + 1;
    }
    prefixes
}

fn retry_on_error(code: ErrorCode) -> bool {
    matches!(code, ErrorCode::ConnectionLoss | ErrorCode::OperationTimeout)
}

fn map_code(code: ErrorCode, what: &str) -> Error {
    match code {
        ErrorCode::NoNode => Error::NoNode(what.to_string()),
        ErrorCode::NodeExists => Error::NodeExists(what.to_string()),
        ErrorCode::NotEmpty => Error::NotEmpty(what.to_string()),
        ErrorCode::BadVersion => Error::BadVersion(what.to_string()),
        ErrorCode::NoAuth => Error::NoAuth(what.to_string()),
        ErrorCode::InvalidState => Error::InvalidState(what.to_string()),
        ErrorCode::ConnectionLoss => Error::ConnectionLoss(what.to_string()),
        ErrorCode::OperationTimeout => Error::OperationTimeout(what.to_string()),
        ErrorCode::NoChildrenForEphemerals => Error::UnknownErrorCode {
            code: -108,
            message: format!("{what}: ephemerals cannot have children"),
        },
        ErrorCode::Unknown(raw) => Error::UnknownErrorCode {
            code: raw,
            message: what.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::repository::MemoryStorage};

    fn connected_adapter() -> (Arc<MemoryStorage>, Arc<RepositoryAdapter>) {
        let storage = Arc::new(MemoryStorage::new());
        let adapter = RepositoryAdapter::new(storage.clone(), RepositoryConfig::default());
        (storage, adapter)
    }

    #[test]
    fn path_validation_rejects_malformed_paths() {
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/a/b").is_ok());
        assert!(validate_path("a/b").is_err());
        assert!(validate_path("/a/").is_err());
        assert!(validate_path("/a//b").is_err());
    }

    #[test]
    fn sequence_split_round_trips() {
        let (name, seq) = split_sequence_node("/locks/x/EX-0000000042").expect("split failed");
        assert_eq!(name, "/locks/x/EX-");
        assert_eq!(seq, 42);
        assert_eq!(sequence_node_path(&name, seq), "/locks/x/EX-0000000042");
    }

    #[test]
    fn sequence_split_rejects_bad_suffixes() {
        assert!(split_sequence_node("short").is_err());
        assert!(split_sequence_node("/locks/x/EX-00000000ab").is_err());
    }

    #[test]
    fn ancestor_paths_are_proper_prefixes() {
        assert_eq!(ancestor_paths("/a/b/c"), vec!["/a", "/a/b"]);
        assert!(ancestor_paths("/a").is_empty());
    }

    #[tokio::test]
    async fn operations_fail_before_reconnect() {
        let (_storage, adapter) = connected_adapter();
        let err = adapter
            .exists("/a", None)
            .await
            .expect_err("must fail while disconnected");
        assert!(matches!(err, Error::NotConnected(_)));
    }

    #[tokio::test]
    async fn create_with_ancestors_walks_the_prefix_chain() {
        let (_storage, adapter) = connected_adapter();
        adapter.reconnect().await.expect("reconnect failed");
        adapter
            .wait_until_connected()
            .await
            .expect("connect timed out");

        let created = adapter
            .create("/a/b/c", "x", CreateMode::Persistent, true)
            .await
            .expect("create failed");
        assert_eq!(created.as_deref(), Some("/a/b/c"));
        assert!(adapter
            .exists("/a/b", None)
            .await
            .expect("exists failed")
            .is_some());

        // Second create of the same path reports the existing node.
        let again = adapter
            .create("/a/b/c", "x", CreateMode::Persistent, true)
            .await
            .expect("create failed");
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn recursive_delete_removes_descendants_first() {
        let (_storage, adapter) = connected_adapter();
        adapter.reconnect().await.expect("reconnect failed");
        adapter
            .wait_until_connected()
            .await
            .expect("connect timed out");

        adapter
            .create("/a/b/c", "", CreateMode::Persistent, true)
            .await
            .expect("create failed");
        let err = adapter
            .delete("/a", false, -1)
            .await
            .expect_err("non-recursive delete of a parent must fail");
        assert!(matches!(err, Error::NotEmpty(_)));

        assert!(adapter.delete("/a", true, -1).await.expect("delete failed"));
        assert!(adapter
            .exists("/a", None)
            .await
            .expect("exists failed")
            .is_none());
    }

    #[tokio::test]
    async fn expired_session_reconnects_under_the_retry_budget() {
        let (storage, adapter) = connected_adapter();
        adapter.reconnect().await.expect("reconnect failed");
        adapter
            .wait_until_connected()
            .await
            .expect("connect timed out");
        adapter
            .create("/a", "", CreateMode::Persistent, false)
            .await
            .expect("create failed");

        let session = adapter.current_session().expect("no session");
        storage.expire_session(session);

        // The next operation sees the stale session, reconnects, retries.
        assert!(adapter
            .exists("/a", None)
            .await
            .expect("exists failed")
            .is_some());
        assert_ne!(adapter.current_session().expect("no session"), session);
    }
}
