use {
    crate::{
        cache::{
            data::{
                CachedKeyValues, CachedProcessInfo, CachedProcessSlotInfo, CachedShards,
                CachedState,
            },
            FactoryOps,
        },
        error::{Error, Result},
        event::ChangeKind,
        key::{self, NotifyableKind},
        repository::WatchContext,
    },
    std::sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Mutex, Weak,
    },
    tracing::{debug, trace},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyableState {
    Init,
    Ready,
    Removed,
}

/// Lazily resolved ancestor keys, guarded by the chain lock.  The lock is
/// held only for reading or writing these slots, never across repository
/// I/O.
#[derive(Default)]
struct Chain {
    parent: Option<String>,
    group: Option<String>,
    application: Option<String>,
}

/// Per-group leadership bookkeeping: the well-known paths resolved on first
/// use, the last observed leader, and this process's bid index.
pub(crate) struct Leadership {
    pub(crate) initialized: bool,
    pub(crate) current_leader_path: String,
    pub(crate) bids_path: String,
    pub(crate) bid_prefix_path: String,
    pub(crate) leader_known: bool,
    pub(crate) leader_node_key: Option<String>,
    pub(crate) my_bid: i64,
}

impl Default for Leadership {
    fn default() -> Self {
        Self {
            initialized: false,
            current_leader_path: String::new(),
            bids_path: String::new(),
            bid_prefix_path: String::new(),
            leader_known: false,
            leader_node_key: None,
            my_bid: -1,
        }
    }
}

#[derive(Default)]
pub(crate) struct ClientState {
    pub(crate) state: String,
    pub(crate) description: String,
}

///
/// One cached entity of the namespace.  Kind-specific capabilities (locks,
/// leadership, queue operations, health checking) live in their subsystem
/// modules as further `impl` blocks; everything here is shared: identity,
/// the ready protocol, reference lifecycle, ancestry, and children.
///
/// At most one instance exists per key at any moment; instances are interned
/// by the factory and handed out with a bumped reference count.
///
pub struct Notifyable {
    key: String,
    name: String,
    kind: NotifyableKind,
    ops: Weak<FactoryOps>,
    state: Mutex<NotifyableState>,
    ref_count: AtomicI64,
    chain: Mutex<Chain>,

    current_state: CachedState,
    desired_state: CachedState,
    key_values: Option<CachedKeyValues>,
    shards: Option<CachedShards>,
    process_info: Option<CachedProcessInfo>,
    process_slot_info: Option<CachedProcessSlotInfo>,

    connected: AtomicBool,
    client_state: Mutex<ClientState>,
    pub(crate) health: tokio::sync::Mutex<Option<crate::health::HealthRegistration>>,
    pub(crate) leadership: Mutex<Leadership>,
}

impl Notifyable {
    pub(crate) fn new(kind: NotifyableKind, key_str: &str, ops: Weak<FactoryOps>) -> Self {
        Self {
            key: key_str.to_string(),
            name: key::name_from_key(key_str),
            kind,
            state: Mutex::new(NotifyableState::Init),
            ref_count: AtomicI64::new(0),
            chain: Mutex::new(Chain::default()),
            current_state: CachedState::current(key_str, ops.clone()),
            desired_state: CachedState::desired(key_str, ops.clone()),
            key_values: (kind == NotifyableKind::PropertyList)
                .then(|| CachedKeyValues::new(key_str, ops.clone())),
            shards: (kind == NotifyableKind::DataDistribution)
                .then(|| CachedShards::new(key_str, ops.clone())),
            process_info: (kind == NotifyableKind::ProcessSlot)
                .then(|| CachedProcessInfo::new(key_str, ops.clone())),
            process_slot_info: (kind == NotifyableKind::Node)
                .then(|| CachedProcessSlotInfo::new(key_str, ops.clone())),
            connected: AtomicBool::new(false),
            client_state: Mutex::new(ClientState::default()),
            health: tokio::sync::Mutex::new(None),
            leadership: Mutex::new(Leadership::default()),
            ops,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NotifyableKind {
        self.kind
    }

    pub fn state(&self) -> NotifyableState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn is_ready(&self) -> bool {
        self.state() == NotifyableState::Ready
    }

    pub(crate) fn set_state(&self, new_state: NotifyableState) -> NotifyableState {
        let mut state = self.state.lock().expect("state lock poisoned");
        let old = *state;
        if old != new_state {
            trace!(key = %self.key, ?old, ?new_state, "notifyable state change");
            *state = new_state;
        }
        old
    }

    pub fn throw_if_removed(&self) -> Result<()> {
        if self.state() == NotifyableState::Removed {
            return Err(Error::ObjectRemoved(self.key.clone()));
        }
        Ok(())
    }

    pub(crate) fn ops(&self) -> Result<Arc<FactoryOps>> {
        self.ops.upgrade().ok_or_else(|| {
            Error::InconsistentInternalState("the owning factory is gone".to_string())
        })
    }

    pub(crate) fn incr_ref(&self) -> i64 {
        self.ref_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn decr_ref(&self) -> i64 {
        self.ref_count.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub(crate) fn ref_count(&self) -> i64 {
        self.ref_count.load(Ordering::SeqCst)
    }

    /// Drops the caller's reference; at zero the instance leaves the cache.
    pub fn release(&self) -> Result<()> {
        let ops = self.ops()?;
        ops.release_notifyable(&self.key);
        Ok(())
    }

    ///
    /// Deletes this notifyable from the repository and marks it REMOVED.
    /// With children present the call fails unless `remove_children` is
    /// set, in which case descendants go first.
    ///
    pub async fn remove(&self, remove_children: bool) -> Result<()> {
        self.throw_if_removed()?;
        if self.kind == NotifyableKind::Root {
            return Err(Error::InvalidMethod("the root cannot be removed".to_string()));
        }
        let ops = self.ops()?;

        if !remove_children && self.has_child_notifyables().await? {
            return Err(Error::InvalidMethod(format!(
                "{} still has children; pass remove_children to delete them",
                self.key
            )));
        }

        debug!(key = %self.key, remove_children, "removing notifyable");
        ops.adapter().delete(&self.key, true, -1).await?;
        self.set_state(NotifyableState::Removed);
        ops.forget_notifyable(&self.key);
        Ok(())
    }

    async fn has_child_notifyables(&self) -> Result<bool> {
        let ops = self.ops()?;
        for child_kind in self.kind.allowed_children() {
            let container = key::child_container_path(&self.key, *child_kind)?;
            if !ops.adapter().get_children(&container, None).await?.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /*
     * Ancestry.
     */

    pub async fn get_parent(&self) -> Result<Option<Arc<Notifyable>>> {
        let cached = self.chain.lock().expect("chain lock poisoned").parent.clone();
        let parent_key = match cached {
            Some(parent_key) => parent_key,
            None => {
                let Some(parent_key) = key::parent_key(&self.key) else {
                    return Ok(None);
                };
                self.chain.lock().expect("chain lock poisoned").parent = Some(parent_key.clone());
                parent_key
            }
        };
        let kind = key::kind_from_key(&parent_key)?;
        self.ops()?
            .get_notifyable_from_key(kind, &parent_key, false)
            .await
    }

    /// Nearest enclosing group (or application, which behaves as one).
    pub async fn get_my_group(&self) -> Result<Option<Arc<Notifyable>>> {
        let cached = self.chain.lock().expect("chain lock poisoned").group.clone();
        let group_key = match cached {
            Some(group_key) => group_key,
            None => {
                let Some(group_key) = self.ancestor_key_of(&[
                    NotifyableKind::Group,
                    NotifyableKind::Application,
                ])?
                else {
                    return Ok(None);
                };
                self.chain.lock().expect("chain lock poisoned").group = Some(group_key.clone());
                group_key
            }
        };
        let kind = key::kind_from_key(&group_key)?;
        self.ops()?
            .get_notifyable_from_key(kind, &group_key, false)
            .await
    }

    pub async fn get_my_application(&self) -> Result<Option<Arc<Notifyable>>> {
        let cached = self
            .chain
            .lock()
            .expect("chain lock poisoned")
            .application
            .clone();
        let app_key = match cached {
            Some(app_key) => app_key,
            None => {
                let Some(app_key) = self.ancestor_key_of(&[NotifyableKind::Application])? else {
                    return Ok(None);
                };
                self.chain.lock().expect("chain lock poisoned").application = Some(app_key.clone());
                app_key
            }
        };
        self.ops()?
            .get_notifyable_from_key(NotifyableKind::Application, &app_key, false)
            .await
    }

    fn ancestor_key_of(&self, kinds: &[NotifyableKind]) -> Result<Option<String>> {
        let mut current = key::parent_key(&self.key);
        while let Some(candidate) = current {
            if kinds.contains(&key::kind_from_key(&candidate)?) {
                return Ok(Some(candidate));
            }
            current = key::parent_key(&candidate);
        }
        Ok(None)
    }

    /*
     * Children.
     */

    fn check_child_kind(&self, child_kind: NotifyableKind) -> Result<()> {
        if !self.kind.allowed_children().contains(&child_kind) {
            return Err(Error::InvalidArguments(format!(
                "{:?} notifyables cannot hold {child_kind:?} children",
                self.kind
            )));
        }
        Ok(())
    }

    ///
    /// Names of this notifyable's children of the given kind, leaving a
    /// watch behind so later membership changes reach the cache.
    ///
    pub async fn get_child_names(&self, child_kind: NotifyableKind) -> Result<Vec<String>> {
        self.throw_if_removed()?;
        self.check_child_kind(child_kind)?;
        let ops = self.ops()?;
        let container = key::child_container_path(&self.key, child_kind)?;
        let watch = WatchContext::CachedObject(children_change_kind(child_kind));
        let children = ops.adapter().get_children(&container, Some(watch)).await?;
        Ok(children.iter().map(|c| key::name_from_key(c)).collect())
    }

    /// Fetches (optionally creating) a named child notifyable.
    pub async fn get_child(
        &self,
        child_kind: NotifyableKind,
        name: &str,
        create: bool,
    ) -> Result<Option<Arc<Notifyable>>> {
        self.throw_if_removed()?;
        self.check_child_kind(child_kind)?;
        let child_key = key::child_key(&self.key, child_kind, name)?;
        self.ops()?
            .get_notifyable_from_key(child_kind, &child_key, create)
            .await
    }

    pub async fn get_application_names(&self) -> Result<Vec<String>> {
        self.get_child_names(NotifyableKind::Application).await
    }

    pub async fn get_application(&self, name: &str, create: bool) -> Result<Option<Arc<Notifyable>>> {
        self.get_child(NotifyableKind::Application, name, create).await
    }

    pub async fn get_group_names(&self) -> Result<Vec<String>> {
        self.get_child_names(NotifyableKind::Group).await
    }

    pub async fn get_group(&self, name: &str, create: bool) -> Result<Option<Arc<Notifyable>>> {
        self.get_child(NotifyableKind::Group, name, create).await
    }

    pub async fn get_node_names(&self) -> Result<Vec<String>> {
        self.get_child_names(NotifyableKind::Node).await
    }

    pub async fn get_node(&self, name: &str, create: bool) -> Result<Option<Arc<Notifyable>>> {
        self.get_child(NotifyableKind::Node, name, create).await
    }

    pub async fn get_process_slot_names(&self) -> Result<Vec<String>> {
        self.get_child_names(NotifyableKind::ProcessSlot).await
    }

    pub async fn get_process_slot(
        &self,
        name: &str,
        create: bool,
    ) -> Result<Option<Arc<Notifyable>>> {
        self.get_child(NotifyableKind::ProcessSlot, name, create).await
    }

    pub async fn get_data_distribution_names(&self) -> Result<Vec<String>> {
        self.get_child_names(NotifyableKind::DataDistribution).await
    }

    pub async fn get_data_distribution(
        &self,
        name: &str,
        create: bool,
    ) -> Result<Option<Arc<Notifyable>>> {
        self.get_child(NotifyableKind::DataDistribution, name, create).await
    }

    pub async fn get_property_list_names(&self) -> Result<Vec<String>> {
        self.get_child_names(NotifyableKind::PropertyList).await
    }

    pub async fn get_property_list(
        &self,
        name: &str,
        create: bool,
    ) -> Result<Option<Arc<Notifyable>>> {
        self.get_child(NotifyableKind::PropertyList, name, create).await
    }

    pub async fn get_queue_names(&self) -> Result<Vec<String>> {
        self.get_child_names(NotifyableKind::Queue).await
    }

    pub async fn get_queue(&self, name: &str, create: bool) -> Result<Option<Arc<Notifyable>>> {
        self.get_child(NotifyableKind::Queue, name, create).await
    }

    /*
     * Cached documents.
     */

    pub fn cached_current_state(&self) -> &CachedState {
        &self.current_state
    }

    pub fn cached_desired_state(&self) -> &CachedState {
        &self.desired_state
    }

    pub fn cached_key_values(&self) -> Result<&CachedKeyValues> {
        self.key_values.as_ref().ok_or_else(|| {
            Error::InvalidMethod(format!("{} is not a property list", self.key))
        })
    }

    pub fn cached_shards(&self) -> Result<&CachedShards> {
        self.shards.as_ref().ok_or_else(|| {
            Error::InvalidMethod(format!("{} is not a data distribution", self.key))
        })
    }

    pub fn cached_process_info(&self) -> Result<&CachedProcessInfo> {
        self.process_info
            .as_ref()
            .ok_or_else(|| Error::InvalidMethod(format!("{} is not a process slot", self.key)))
    }

    pub fn cached_process_slot_info(&self) -> Result<&CachedProcessSlotInfo> {
        self.process_slot_info
            .as_ref()
            .ok_or_else(|| Error::InvalidMethod(format!("{} is not a node", self.key)))
    }

    /*
     * Node connection and client state, maintained by the change handlers.
     */

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Last observed client health state, e.g. `"healthy"`.
    pub fn get_client_state(&self) -> String {
        self.client_state
            .lock()
            .expect("client state lock poisoned")
            .state
            .clone()
    }

    pub fn get_client_state_description(&self) -> String {
        self.client_state
            .lock()
            .expect("client state lock poisoned")
            .description
            .clone()
    }

    pub(crate) fn set_client_state(&self, state: String, description: String) {
        let mut guard = self.client_state.lock().expect("client state lock poisoned");
        guard.state = state;
        guard.description = description;
    }

    ///
    /// Installs every watch this notifyable's cached representation depends
    /// on and primes the cached fields.  Called once at materialization.
    ///
    pub(crate) async fn initialize_cached_representation(&self) -> Result<()> {
        let ops = self.ops()?;
        let adapter = ops.adapter();

        // Ready protocol: exists-watch on the key itself; the same watch
        // observes data changes and deletion.
        let stat = adapter
            .exists(
                &self.key,
                Some(WatchContext::CachedObject(ChangeKind::NotifyableStateChange)),
            )
            .await?;
        if stat.is_some() {
            if let Some((data, _)) = adapter.get_data(&self.key, None).await? {
                if data == key::READY_VALUE {
                    self.set_state(NotifyableState::Ready);
                }
            }
        }

        for child_kind in self.kind.allowed_children() {
            let container = key::child_container_path(&self.key, *child_kind)?;
            let watch = WatchContext::CachedObject(children_change_kind(*child_kind));
            adapter.get_children(&container, Some(watch)).await?;
        }

        self.current_state.load(false).await?;
        self.desired_state.load(false).await?;
        if let Some(key_values) = &self.key_values {
            key_values.load(false).await?;
        }
        if let Some(shards) = &self.shards {
            shards.load(false).await?;
        }
        if let Some(process_info) = &self.process_info {
            process_info.load(false).await?;
        }
        if let Some(process_slot_info) = &self.process_slot_info {
            process_slot_info.load(false).await?;
        }

        match self.kind {
            NotifyableKind::Node => {
                let connected_path = key::internal_znode(&self.key, key::CONNECTED);
                let stat = adapter
                    .exists(
                        &connected_path,
                        Some(WatchContext::CachedObject(ChangeKind::NodeConnectionChange)),
                    )
                    .await?;
                self.set_connected(stat.is_some());

                let client_state_path = key::internal_znode(&self.key, key::CLIENT_STATE);
                let stat = adapter
                    .exists(
                        &client_state_path,
                        Some(WatchContext::CachedObject(ChangeKind::NodeClientStateChange)),
                    )
                    .await?;
                if stat.is_some() {
                    if let Some((state, _)) = adapter.get_data(&client_state_path, None).await? {
                        let desc_path = key::internal_znode(&self.key, key::CLIENT_STATE_DESC);
                        let description = adapter
                            .get_data(&desc_path, None)
                            .await?
                            .map(|(d, _)| d)
                            .unwrap_or_default();
                        self.set_client_state(state, description);
                    }
                }
            }
            NotifyableKind::Group | NotifyableKind::Application => {
                crate::election::refresh_leader_cache(&ops, self).await?;
            }
            NotifyableKind::Queue => {
                let elements = key::internal_znode(&self.key, key::QUEUE_ELEMENTS);
                let _ = adapter
                    .create(&elements, "", crate::repository::CreateMode::Persistent, false)
                    .await?;
                adapter
                    .get_children(
                        &elements,
                        Some(WatchContext::CachedObject(ChangeKind::QueueChildChange)),
                    )
                    .await?;
            }
            _ => {}
        }

        Ok(())
    }
}

/// The change-handler classification for membership changes of a child
/// container of the given kind.
pub(crate) fn children_change_kind(child_kind: NotifyableKind) -> ChangeKind {
    match child_kind {
        NotifyableKind::Root => ChangeKind::NotifyableStateChange,
        NotifyableKind::Application => ChangeKind::ApplicationsChange,
        NotifyableKind::Group => ChangeKind::GroupsChange,
        NotifyableKind::Node => ChangeKind::NodesChange,
        NotifyableKind::ProcessSlot => ChangeKind::ProcessSlotsChange,
        NotifyableKind::DataDistribution => ChangeKind::DataDistributionsChange,
        NotifyableKind::PropertyList => ChangeKind::PropertyListsChange,
        NotifyableKind::Queue => ChangeKind::QueuesChange,
    }
}
