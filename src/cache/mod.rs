use {
    crate::{
        config::RepositoryConfig,
        error::{Error, Result},
        event::{NotifyableEvent, TimerEventHandler, UserEventHandler, UserEventPayload},
        key::{self, NotifyableKind},
        notifyable::Notifyable,
        repository::{
            adapter::RepositoryEventListener, CreateMode, KeeperState, RawEvent,
            RepositoryAdapter, Storage, WatchContext, WatchedEventType,
        },
        sync::{SignalMap, Timer, TimerEvent, TimerId},
    },
    async_trait::async_trait,
    dashmap::DashMap,
    serde_json::{Map, Value},
    std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicI64, Ordering},
            Arc, Mutex, Weak,
        },
    },
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

///
/// Cached JSON documents attached to notifyables.
///
pub mod data;

///
/// Per-path change handlers invoked on watch firings.
///
pub mod handlers;

/// A held advisory lock, recorded process-wide.
pub struct LockRecord {
    pub owner: String,
    pub acquired_msecs: i64,
    pub lock_node_path: String,
}

/// This process's standing in a group's election.
#[derive(Clone)]
pub struct ElectionRecord {
    pub bid: i64,
    pub bid_path: String,
    pub node_key: String,
}

///
/// Shared machinery behind a `Factory`: the adapter, the notifyable
/// interning map, the rendezvous maps, and the event plumbing.  Handed to
/// notifyables and cached documents as a weak reference.
///
pub struct FactoryOps {
    adapter: Arc<RepositoryAdapter>,
    notifyables: DashMap<String, Arc<Notifyable>>,
    pub(crate) signal_map: SignalMap,
    pub(crate) response_signal_map: SignalMap,
    pub(crate) id_responses: DashMap<String, Map<String, Value>>,
    pub(crate) lock_registry: DashMap<(String, String), LockRecord>,
    pub(crate) election_registry: DashMap<String, ElectionRecord>,
    user_handlers: Mutex<HashMap<String, Vec<Arc<dyn UserEventHandler>>>>,
    timer: Timer<Arc<dyn TimerEventHandler>>,
    sync_counter: AtomicI64,
    pub(crate) request_counter: AtomicI64,
    self_ref: Weak<FactoryOps>,
}

impl FactoryOps {
    pub(crate) fn adapter(&self) -> &Arc<RepositoryAdapter> {
        &self.adapter
    }

    pub(crate) fn weak(&self) -> Weak<FactoryOps> {
        self.self_ref.clone()
    }

    /// Internal cache peek: no reference bump, no materialization.
    pub(crate) fn lookup_notifyable(&self, key: &str) -> Option<Arc<Notifyable>> {
        self.notifyables.get(key).map(|entry| entry.clone())
    }

    pub(crate) fn throw_if_removed(&self, key: &str) -> Result<()> {
        match self.lookup_notifyable(key) {
            Some(notifyable) => notifyable.throw_if_removed(),
            None => Ok(()),
        }
    }

    ///
    /// Resolves an interned notifyable, materializing it from the
    /// repository on a miss.  With `create`, a missing repository entry is
    /// created and readied first.
    ///
    pub(crate) async fn get_notifyable_from_key(
        &self,
        kind: NotifyableKind,
        notifyable_key: &str,
        create: bool,
    ) -> Result<Option<Arc<Notifyable>>> {
        if !key::is_valid_key(kind, notifyable_key) {
            return Err(Error::InvalidArguments(format!(
                "{notifyable_key} is not a valid {kind:?} key"
            )));
        }

        if let Some(existing) = self.lookup_notifyable(notifyable_key) {
            existing.incr_ref();
            return Ok(Some(existing));
        }

        if self.adapter.exists(notifyable_key, None).await?.is_none() {
            if !create {
                return Ok(None);
            }
            self.create_repository_entries(kind, notifyable_key).await?;
        }

        let notifyable = Arc::new(Notifyable::new(kind, notifyable_key, self.weak()));
        notifyable.initialize_cached_representation().await?;

        // Another task may have materialized the same key concurrently; the
        // interning map is the single point of truth.
        let interned = self
            .notifyables
            .entry(notifyable_key.to_string())
            .or_insert(notifyable)
            .clone();
        interned.incr_ref();
        Ok(Some(interned))
    }

    /// Creates the znode, its mandatory child containers, and its document
    /// znodes, then publishes the ready sentinel.
    async fn create_repository_entries(&self, kind: NotifyableKind, key_str: &str) -> Result<()> {
        debug!(key = key_str, ?kind, "creating repository entries");
        let _ = self
            .adapter
            .create(key_str, "", CreateMode::Persistent, true)
            .await?;
        for child_kind in kind.allowed_children() {
            let container = key::child_container_path(key_str, *child_kind)?;
            let _ = self
                .adapter
                .create(&container, "", CreateMode::Persistent, false)
                .await?;
        }

        let mut doc_znodes = vec![key::CURRENT_STATE_JSON_OBJECT, key::DESIRED_STATE_JSON_OBJECT];
        match kind {
            NotifyableKind::PropertyList => doc_znodes.push(key::KEYVAL_JSON_OBJECT),
            NotifyableKind::DataDistribution => doc_znodes.push(key::SHARD_JSON_OBJECT),
            NotifyableKind::ProcessSlot => doc_znodes.push(key::PROCESSINFO_JSON_OBJECT),
            NotifyableKind::Node => doc_znodes.push(key::PROCESSSLOTINFO_JSON_OBJECT),
            _ => {}
        }
        for doc in doc_znodes {
            let path = key::internal_znode(key_str, doc);
            let _ = self
                .adapter
                .create(&path, "", CreateMode::Persistent, false)
                .await?;
        }

        self.adapter
            .set_data(key_str, key::READY_VALUE, -1)
            .await?;
        Ok(())
    }

    pub(crate) fn release_notifyable(&self, key: &str) {
        let Some(notifyable) = self.lookup_notifyable(key) else {
            return;
        };
        if notifyable.decr_ref() <= 0 {
            // Idempotent against concurrent re-acquisition: only drop the
            // entry while the count is still at zero.
            self.notifyables
                .remove_if(key, |_, candidate| candidate.ref_count() <= 0);
            debug!(key, "notifyable left the cache");
        }
    }

    pub(crate) fn forget_notifyable(&self, key: &str) {
        self.notifyables.remove(key);
    }

    pub(crate) async fn fire_user_event(&self, key: &str, event: NotifyableEvent) {
        let handlers: Vec<Arc<dyn UserEventHandler>> = {
            let registered = self.user_handlers.lock().expect("handler lock poisoned");
            registered.get(key).cloned().unwrap_or_default()
        };
        if handlers.is_empty() {
            return;
        }
        let payload = UserEventPayload::new(key, event);
        for handler in handlers {
            handler.handle_user_event(&payload).await;
        }
    }

    ///
    /// Strict barrier over the event pipeline: issues a repository sync and
    /// parks until its token has drained the user-event queue behind every
    /// earlier watch firing.
    ///
    pub(crate) async fn synchronize(&self) -> Result<()> {
        let token = format!("sync:{}", self.sync_counter.fetch_add(1, Ordering::SeqCst));
        self.signal_map.add_ref(&token);
        let synced = self.adapter.sync(&key::root_key(), &token).await;
        if synced.is_err() {
            let _ = self.signal_map.remove_ref(&token);
            return synced;
        }
        self.signal_map.wait_usecs(&token, -1).await?;
        self.signal_map.remove_ref(&token)?;
        Ok(())
    }
}

/// Routes adapter events: sync tokens to their waiters, watch firings to
/// the change-handler registry, session transitions to the log.
struct CachedObjectDispatcher {
    ops: Weak<FactoryOps>,
}

#[async_trait]
impl RepositoryEventListener for CachedObjectDispatcher {
    async fn event_received(&self, event: &RawEvent) {
        let Some(ops) = self.ops.upgrade() else {
            return;
        };
        match &event.context {
            Some(WatchContext::Sync { token }) => {
                ops.signal_map.signal(token);
            }
            Some(WatchContext::CachedObject(kind)) => {
                match handlers::dispatch(&ops, *kind, event).await {
                    Ok(Some((key, user_event))) if user_event != NotifyableEvent::NoEvent => {
                        ops.fire_user_event(&key, user_event).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // Handler failures are logged per event; the worker
                        // keeps draining.
                        warn!(?kind, path = %event.path, "change handler failed: {e}");
                    }
                }
            }
            Some(WatchContext::Broadcast) | None => {
                if event.event_type == WatchedEventType::Session
                    && event.state == KeeperState::Expired
                {
                    info!("repository session expired");
                }
            }
        }
    }
}

async fn run_timer_events(mut rx: mpsc::UnboundedReceiver<TimerEvent<Arc<dyn TimerEventHandler>>>) {
    while let Some(event) = rx.recv().await {
        event.payload.handle_timer_event(event.id, event.alarm_msecs).await;
    }
}

///
/// Entry point of the library: owns the repository adapter and the
/// notifyable cache, and hands out interned notifyables starting from the
/// root.
///
pub struct Factory {
    ops: Arc<FactoryOps>,
}

impl Factory {
    ///
    /// Connects to the repository through `storage`, ensures the namespace
    /// base paths exist, and starts the event and timer workers.
    ///
    pub async fn new(storage: Arc<dyn Storage>, config: RepositoryConfig) -> Result<Self> {
        let adapter = RepositoryAdapter::new(storage, config);
        let (timer, timer_rx) = Timer::spawn();

        let ops = Arc::new_cyclic(|self_ref: &Weak<FactoryOps>| FactoryOps {
            adapter,
            notifyables: DashMap::new(),
            signal_map: SignalMap::new(),
            response_signal_map: SignalMap::new(),
            id_responses: DashMap::new(),
            lock_registry: DashMap::new(),
            election_registry: DashMap::new(),
            user_handlers: Mutex::new(HashMap::new()),
            timer,
            sync_counter: AtomicI64::new(0),
            request_counter: AtomicI64::new(0),
            self_ref: self_ref.clone(),
        });

        let dispatcher = Arc::new(CachedObjectDispatcher { ops: ops.weak() });
        ops.adapter.set_watch_listener(dispatcher.clone());
        ops.adapter.add_listener(dispatcher);
        tokio::spawn(run_timer_events(timer_rx));

        ops.adapter.reconnect().await?;
        ops.adapter.wait_until_connected().await?;
        ops.create_repository_entries(NotifyableKind::Root, &key::root_key())
            .await?;

        Ok(Self { ops })
    }

    pub(crate) fn ops(&self) -> &Arc<FactoryOps> {
        &self.ops
    }

    pub async fn get_root(&self) -> Result<Arc<Notifyable>> {
        self.ops
            .get_notifyable_from_key(NotifyableKind::Root, &key::root_key(), false)
            .await?
            .ok_or_else(|| {
                Error::InconsistentInternalState("the root is not materialized".to_string())
            })
    }

    /// Resolves any notifyable by its repository key.
    pub async fn get_notifyable_from_key(
        &self,
        kind: NotifyableKind,
        notifyable_key: &str,
    ) -> Result<Option<Arc<Notifyable>>> {
        self.ops
            .get_notifyable_from_key(kind, notifyable_key, false)
            .await
    }

    /// Barrier: returns once every watch firing produced before this call
    /// has completed its handler.
    pub async fn synchronize(&self) -> Result<()> {
        self.ops.synchronize().await
    }

    pub fn register_user_event_handler(
        &self,
        notifyable_key: &str,
        handler: Arc<dyn UserEventHandler>,
    ) {
        self.ops
            .user_handlers
            .lock()
            .expect("handler lock poisoned")
            .entry(notifyable_key.to_string())
            .or_default()
            .push(handler);
    }

    pub fn unregister_user_event_handler(
        &self,
        notifyable_key: &str,
        handler: &Arc<dyn UserEventHandler>,
    ) -> bool {
        let mut registered = self.ops.user_handlers.lock().expect("handler lock poisoned");
        let Some(handlers) = registered.get_mut(notifyable_key) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|candidate| !Arc::ptr_eq(candidate, handler));
        handlers.len() != before
    }

    pub fn schedule_timer_after(
        &self,
        msecs_from_now: i64,
        handler: Arc<dyn TimerEventHandler>,
    ) -> TimerId {
        self.ops.timer.schedule_after(msecs_from_now, handler)
    }

    pub fn schedule_timer_at(
        &self,
        alarm_msecs: i64,
        handler: Arc<dyn TimerEventHandler>,
    ) -> TimerId {
        self.ops.timer.schedule_at(alarm_msecs, handler)
    }

    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.ops.timer.cancel_alarm(id)
    }

    /// Final disconnect: injects the end event and joins the event workers.
    pub async fn close(&self) {
        self.ops.adapter.shutdown().await;
    }
}
