use {
    super::{
        CreateMode, ErrorCode, KeeperState, RawEvent, SessionId, Stat, Storage, StoreResult,
        WatchContext, WatchedEventType, SEQUENCE_NUMBER_WIDTH,
    },
    async_trait::async_trait,
    std::{
        collections::{BTreeMap, HashMap},
        sync::Mutex,
    },
    tokio::sync::mpsc,
    tracing::{debug, trace},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum WatchSlot {
    Data,
    Exists,
    Child,
}

struct NodeRec {
    data: String,
    version: i32,
    ephemeral_owner: Option<SessionId>,
    seq_counter: i64,
}

struct SessionRec {
    events: mpsc::UnboundedSender<RawEvent>,
}

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<String, NodeRec>,
    sessions: HashMap<SessionId, SessionRec>,
    watches: HashMap<(String, WatchSlot), Vec<(SessionId, WatchContext)>>,
    next_session: SessionId,
}

///
/// In-process, sequentially consistent repository.
///
/// Every mutation and every watch firing happens under one lock, so watch
/// deliveries across all sessions observe a single total order, and a
/// session's channel sees firings in exactly mutation order.  Watches are
/// one-shot: firing consumes the registration.
///
/// `expire_session` is the failure injection point: it reaps the session's
/// ephemeral nodes (firing the usual deletion watches at other sessions) and
/// posts the expiry event on the session's own channel.
///
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        let storage = Self::default();
        storage
            .inner
            .lock()
            .expect("storage lock poisoned")
            .nodes
            .insert(
                "/".to_string(),
                NodeRec {
                    data: String::new(),
                    version: 0,
                    ephemeral_owner: None,
                    seq_counter: 0,
                },
            );
        storage
    }

    /// Kills a session as if the store expired it: ephemerals vanish and the
    /// session's channel receives the expiry event.
    pub fn expire_session(&self, session: SessionId) {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        inner.reap_ephemerals(session);
        if let Some(rec) = inner.sessions.remove(&session) {
            let _ = rec.events.send(RawEvent {
                event_type: WatchedEventType::Session,
                state: KeeperState::Expired,
                path: String::new(),
                context: None,
            });
        }
        debug!(session, "session expired");
    }
}

impl Inner {
    fn parent_of(path: &str) -> Option<String> {
        if path == "/" {
            return None;
        }
        match path.rfind('/') {
            Some(0) => Some("/".to_string()),
            Some(pos) => Some(path[..pos].to_string()),
            None => None,
        }
    }

    fn child_names(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| !k[prefix.len()..].contains('/'))
            .map(|(k, _)| k[prefix.len()..].to_string())
            .collect()
    }

    fn stat_of(&self, path: &str) -> Option<Stat> {
        self.nodes.get(path).map(|rec| Stat {
            version: rec.version,
            num_children: self.child_names(path).len() as i32,
            is_ephemeral: rec.ephemeral_owner.is_some(),
        })
    }

    fn register_watch(&mut self, path: &str, slot: WatchSlot, session: SessionId, ctx: WatchContext) {
        self.watches
            .entry((path.to_string(), slot))
            .or_default()
            .push((session, ctx));
    }

    fn fire(&mut self, path: &str, slot: WatchSlot, event_type: WatchedEventType) {
        let Some(registered) = self.watches.remove(&(path.to_string(), slot)) else {
            return;
        };
        for (session, ctx) in registered {
            if let Some(rec) = self.sessions.get(&session) {
                trace!(path, ?event_type, session, "watch fired");
                let _ = rec.events.send(RawEvent {
                    event_type,
                    state: KeeperState::SyncConnected,
                    path: path.to_string(),
                    context: Some(ctx),
                });
            }
        }
    }

    fn reap_ephemerals(&mut self, session: SessionId) {
        let doomed: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, rec)| rec.ephemeral_owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in doomed {
            self.nodes.remove(&path);
            self.fire(&path, WatchSlot::Data, WatchedEventType::NodeDeleted);
            self.fire(&path, WatchSlot::Exists, WatchedEventType::NodeDeleted);
            self.fire(&path, WatchSlot::Child, WatchedEventType::NodeDeleted);
            if let Some(parent) = Self::parent_of(&path) {
                self.fire(&parent, WatchSlot::Child, WatchedEventType::NodeChildrenChanged);
            }
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn connect(&self, events: mpsc::UnboundedSender<RawEvent>) -> StoreResult<SessionId> {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        inner.next_session += 1;
        let session = inner.next_session;
        let _ = events.send(RawEvent {
            event_type: WatchedEventType::Session,
            state: KeeperState::SyncConnected,
            path: String::new(),
            context: None,
        });
        inner.sessions.insert(session, SessionRec { events });
        debug!(session, "session opened");
        Ok(session)
    }

    async fn close(&self, session: SessionId) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        inner.reap_ephemerals(session);
        inner.sessions.remove(&session);
        debug!(session, "session closed");
        Ok(())
    }

    async fn create(
        &self,
        session: SessionId,
        path: &str,
        data: &str,
        mode: CreateMode,
    ) -> StoreResult<String> {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        if !inner.sessions.contains_key(&session) {
            return Err(ErrorCode::ConnectionLoss);
        }

        let parent = Inner::parent_of(path).ok_or(ErrorCode::NoNode)?;
        match inner.nodes.get(&parent) {
            None => return Err(ErrorCode::NoNode),
            Some(rec) if rec.ephemeral_owner.is_some() => {
                return Err(ErrorCode::NoChildrenForEphemerals)
            }
            Some(_) => {}
        }

        let actual = if mode.is_sequential() {
            let counter = {
                let parent_rec = inner.nodes.get_mut(&parent).expect("parent checked");
                let counter = parent_rec.seq_counter;
                parent_rec.seq_counter += 1;
                counter
            };
            format!("{path}{counter:0width$}", width = SEQUENCE_NUMBER_WIDTH)
        } else {
            if inner.nodes.contains_key(path) {
                return Err(ErrorCode::NodeExists);
            }
            path.to_string()
        };

        inner.nodes.insert(
            actual.clone(),
            NodeRec {
                data: data.to_string(),
                version: 0,
                ephemeral_owner: mode.is_ephemeral().then_some(session),
                seq_counter: 0,
            },
        );
        inner.fire(&actual, WatchSlot::Exists, WatchedEventType::NodeCreated);
        inner.fire(&parent, WatchSlot::Child, WatchedEventType::NodeChildrenChanged);
        Ok(actual)
    }

    async fn delete(&self, session: SessionId, path: &str, version: i32) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        if !inner.sessions.contains_key(&session) {
            return Err(ErrorCode::ConnectionLoss);
        }
        match inner.nodes.get(path) {
            None => return Err(ErrorCode::NoNode),
            Some(rec) if version >= 0 && rec.version != version => {
                return Err(ErrorCode::BadVersion)
            }
            Some(_) if !inner.child_names(path).is_empty() => return Err(ErrorCode::NotEmpty),
            Some(_) => {}
        }

        inner.nodes.remove(path);
        inner.fire(path, WatchSlot::Data, WatchedEventType::NodeDeleted);
        inner.fire(path, WatchSlot::Exists, WatchedEventType::NodeDeleted);
        inner.fire(path, WatchSlot::Child, WatchedEventType::NodeDeleted);
        if let Some(parent) = Inner::parent_of(path) {
            inner.fire(&parent, WatchSlot::Child, WatchedEventType::NodeChildrenChanged);
        }
        Ok(())
    }

    async fn exists(
        &self,
        session: SessionId,
        path: &str,
        watch: Option<WatchContext>,
    ) -> StoreResult<Option<Stat>> {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        if !inner.sessions.contains_key(&session) {
            return Err(ErrorCode::ConnectionLoss);
        }
        if let Some(ctx) = watch {
            inner.register_watch(path, WatchSlot::Exists, session, ctx);
        }
        Ok(inner.stat_of(path))
    }

    async fn get_data(
        &self,
        session: SessionId,
        path: &str,
        watch: Option<WatchContext>,
    ) -> StoreResult<(String, Stat)> {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        if !inner.sessions.contains_key(&session) {
            return Err(ErrorCode::ConnectionLoss);
        }
        if !inner.nodes.contains_key(path) {
            return Err(ErrorCode::NoNode);
        }
        if let Some(ctx) = watch {
            inner.register_watch(path, WatchSlot::Data, session, ctx);
        }
        let stat = inner.stat_of(path).expect("node checked");
        let data = inner.nodes.get(path).expect("node checked").data.clone();
        Ok((data, stat))
    }

    async fn set_data(
        &self,
        session: SessionId,
        path: &str,
        data: &str,
        version: i32,
    ) -> StoreResult<Stat> {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        if !inner.sessions.contains_key(&session) {
            return Err(ErrorCode::ConnectionLoss);
        }
        match inner.nodes.get_mut(path) {
            None => return Err(ErrorCode::NoNode),
            Some(rec) if version >= 0 && rec.version != version => {
                return Err(ErrorCode::BadVersion)
            }
            Some(rec) => {
                rec.data = data.to_string();
                rec.version += 1;
            }
        }
        inner.fire(path, WatchSlot::Data, WatchedEventType::NodeDataChanged);
        inner.fire(path, WatchSlot::Exists, WatchedEventType::NodeDataChanged);
        Ok(inner.stat_of(path).expect("node checked"))
    }

    async fn get_children(
        &self,
        session: SessionId,
        path: &str,
        watch: Option<WatchContext>,
    ) -> StoreResult<Vec<String>> {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        if !inner.sessions.contains_key(&session) {
            return Err(ErrorCode::ConnectionLoss);
        }
        if !inner.nodes.contains_key(path) {
            return Err(ErrorCode::NoNode);
        }
        if let Some(ctx) = watch {
            inner.register_watch(path, WatchSlot::Child, session, ctx);
        }
        Ok(inner.child_names(path))
    }

    async fn sync(&self, _session: SessionId, _path: &str) -> StoreResult<()> {
        // Mutations deliver their watch firings synchronously under the
        // store lock, so a caller that reaches here already has everything
        // earlier on its channel.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(storage: &MemoryStorage) -> (SessionId, mpsc::UnboundedReceiver<RawEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = storage.connect(tx).await.expect("connect failed");
        (session, rx)
    }

    #[tokio::test]
    async fn create_and_read_back() {
        let storage = MemoryStorage::new();
        let (session, _rx) = open(&storage).await;

        storage
            .create(session, "/a", "x", CreateMode::Persistent)
            .await
            .expect("create failed");
        let (data, stat) = storage
            .get_data(session, "/a", None)
            .await
            .expect("get failed");
        assert_eq!(data, "x");
        assert_eq!(stat.version, 0);
    }

    #[tokio::test]
    async fn sequential_creates_use_fixed_width_suffixes() {
        let storage = MemoryStorage::new();
        let (session, _rx) = open(&storage).await;
        storage
            .create(session, "/q", "", CreateMode::Persistent)
            .await
            .expect("create failed");

        let first = storage
            .create(session, "/q/el-", "1", CreateMode::PersistentSequential)
            .await
            .expect("create failed");
        let second = storage
            .create(session, "/q/el-", "2", CreateMode::PersistentSequential)
            .await
            .expect("create failed");
        assert_eq!(first, "/q/el-0000000000");
        assert_eq!(second, "/q/el-0000000001");
    }

    #[tokio::test]
    async fn conditional_set_rejects_stale_version() {
        let storage = MemoryStorage::new();
        let (session, _rx) = open(&storage).await;
        storage
            .create(session, "/a", "x", CreateMode::Persistent)
            .await
            .expect("create failed");
        storage
            .set_data(session, "/a", "y", 0)
            .await
            .expect("set failed");

        let err = storage
            .set_data(session, "/a", "z", 0)
            .await
            .expect_err("stale set must fail");
        assert_eq!(err, ErrorCode::BadVersion);
    }

    #[tokio::test]
    async fn delete_with_children_reports_not_empty() {
        let storage = MemoryStorage::new();
        let (session, _rx) = open(&storage).await;
        storage
            .create(session, "/a", "", CreateMode::Persistent)
            .await
            .expect("create failed");
        storage
            .create(session, "/a/b", "", CreateMode::Persistent)
            .await
            .expect("create failed");

        let err = storage
            .delete(session, "/a", -1)
            .await
            .expect_err("delete of a parent must fail");
        assert_eq!(err, ErrorCode::NotEmpty);
    }

    #[tokio::test]
    async fn watches_are_one_shot() {
        let storage = MemoryStorage::new();
        let (session, mut rx) = open(&storage).await;
        assert!(matches!(
            rx.recv().await,
            Some(RawEvent {
                event_type: WatchedEventType::Session,
                ..
            })
        ));

        storage
            .create(session, "/a", "", CreateMode::Persistent)
            .await
            .expect("create failed");
        storage
            .get_data(session, "/a", Some(WatchContext::Broadcast))
            .await
            .expect("get failed");

        storage
            .set_data(session, "/a", "1", -1)
            .await
            .expect("set failed");
        storage
            .set_data(session, "/a", "2", -1)
            .await
            .expect("set failed");

        let ev = rx.recv().await.expect("no watch event");
        assert_eq!(ev.event_type, WatchedEventType::NodeDataChanged);
        assert_eq!(ev.path, "/a");
        assert!(rx.try_recv().is_err(), "watch fired more than once");
    }

    #[tokio::test]
    async fn expiry_reaps_ephemerals_and_fires_other_sessions() {
        let storage = MemoryStorage::new();
        let (owner, _owner_rx) = open(&storage).await;
        let (observer, mut observer_rx) = open(&storage).await;
        observer_rx.recv().await.expect("no session event");

        storage
            .create(owner, "/e", "", CreateMode::Ephemeral)
            .await
            .expect("create failed");
        storage
            .exists(observer, "/e", Some(WatchContext::Broadcast))
            .await
            .expect("exists failed");

        storage.expire_session(owner);

        let ev = observer_rx.recv().await.expect("no deletion event");
        assert_eq!(ev.event_type, WatchedEventType::NodeDeleted);
        assert_eq!(ev.path, "/e");
        assert!(storage
            .exists(observer, "/e", None)
            .await
            .expect("exists failed")
            .is_none());
    }
}
