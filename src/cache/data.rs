use {
    super::FactoryOps,
    crate::{
        error::{Error, Result},
        event::ChangeKind,
        key::{self, NotifyableKind},
        repository::WatchContext,
    },
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
    std::sync::{Mutex, Weak},
    tracing::{debug, trace},
};

struct DocInner {
    value: Map<String, Value>,
    version: i32,
    initialized: bool,
}

///
/// A JSON document attached to a notifyable, cached in memory and versioned
/// by the repository.
///
/// `publish` is conditional on the cached version unless told otherwise;
/// losing the race surfaces as `PublishVersion` so the caller can refetch
/// and retry.  `load` installs the document's change watch, which keeps the
/// cache refreshed for every later mutation.
///
pub struct CachedDocument {
    path: String,
    change_kind: ChangeKind,
    notifyable_key: String,
    ops: Weak<FactoryOps>,
    inner: Mutex<DocInner>,
}

impl CachedDocument {
    pub(crate) fn new(
        notifyable_key: &str,
        doc_znode: &str,
        change_kind: ChangeKind,
        ops: Weak<FactoryOps>,
    ) -> Self {
        Self {
            path: key::internal_znode(notifyable_key, doc_znode),
            change_kind,
            notifyable_key: notifyable_key.to_string(),
            ops,
            inner: Mutex::new(DocInner {
                value: Map::new(),
                version: -1,
                initialized: false,
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> i32 {
        self.inner.lock().expect("document lock poisoned").version
    }

    pub fn with_value<R>(&self, f: impl FnOnce(&Map<String, Value>) -> R) -> R {
        f(&self.inner.lock().expect("document lock poisoned").value)
    }

    pub fn with_value_mut<R>(&self, f: impl FnOnce(&mut Map<String, Value>) -> R) -> R {
        f(&mut self.inner.lock().expect("document lock poisoned").value)
    }

    fn ops(&self) -> Result<std::sync::Arc<FactoryOps>> {
        self.ops.upgrade().ok_or_else(|| {
            Error::InconsistentInternalState("the owning factory is gone".to_string())
        })
    }

    ///
    /// Pushes the cached value to the repository.  Returns the new store
    /// version.
    ///
    pub async fn publish(&self, unconditional: bool) -> Result<i32> {
        let ops = self.ops()?;
        ops.throw_if_removed(&self.notifyable_key)?;

        let (encoded, version) = {
            let inner = self.inner.lock().expect("document lock poisoned");
            let encoded = serde_json::to_string(&inner.value).map_err(|e| {
                Error::InconsistentInternalState(format!(
                    "unencodable document at {}: {e}",
                    self.path
                ))
            })?;
            (encoded, inner.version)
        };
        let condition = if unconditional { -1 } else { version };
        trace!(path = %self.path, version, unconditional, "publishing document");

        let stat = match ops.adapter().set_data(&self.path, &encoded, condition).await {
            Ok(stat) => stat,
            Err(Error::BadVersion(msg)) => return Err(Error::PublishVersion(msg)),
            Err(Error::NoNode(msg)) => {
                if version >= 0 {
                    // The document existed before, so the notifyable itself
                    // is gone.
                    return Err(Error::ObjectRemoved(msg));
                }
                let _ = ops
                    .adapter()
                    .create(&self.path, &encoded, crate::repository::CreateMode::Persistent, true)
                    .await?;
                crate::repository::Stat::default()
            }
            Err(e) => return Err(e),
        };

        let mut inner = self.inner.lock().expect("document lock poisoned");
        inner.version = stat.version;
        inner.initialized = true;
        Ok(stat.version)
    }

    ///
    /// Refreshes the cached value from the repository, reinstalling the
    /// document's change watch.  With `set_watches_only` the value and
    /// version are left untouched.
    ///
    pub async fn load(&self, set_watches_only: bool) -> Result<()> {
        let ops = self.ops()?;
        let watch = Some(WatchContext::CachedObject(self.change_kind));
        let Some((data, stat)) = ops.adapter().get_data(&self.path, watch).await? else {
            debug!(path = %self.path, "document znode is gone, keeping cached value");
            return Ok(());
        };
        if set_watches_only {
            return Ok(());
        }

        let decoded = if data.is_empty() {
            None
        } else {
            Some(serde_json::from_str::<Map<String, Value>>(&data).map_err(|e| {
                Error::InconsistentInternalState(format!(
                    "undecodable document at {}: {e}",
                    self.path
                ))
            })?)
        };

        let mut inner = self.inner.lock().expect("document lock poisoned");
        if inner.initialized && stat.version <= inner.version {
            // A watch refresh raced a local publish; the cached value is
            // already at least as new.
            return Ok(());
        }
        inner.version = stat.version;
        inner.initialized = true;
        if let Some(value) = decoded {
            inner.value = value;
        }
        Ok(())
    }
}

///
/// String-to-JSON map backing a property list.
///
pub struct CachedKeyValues {
    doc: CachedDocument,
}

impl CachedKeyValues {
    pub(crate) fn new(notifyable_key: &str, ops: Weak<FactoryOps>) -> Self {
        Self {
            doc: CachedDocument::new(
                notifyable_key,
                key::KEYVAL_JSON_OBJECT,
                ChangeKind::PropertyListValuesChange,
                ops,
            ),
        }
    }

    pub fn doc(&self) -> &CachedDocument {
        &self.doc
    }

    pub fn keys(&self) -> Vec<String> {
        self.doc.with_value(|v| v.keys().cloned().collect())
    }

    pub fn get_local(&self, key: &str) -> Option<Value> {
        self.doc.with_value(|v| v.get(key).cloned())
    }

    ///
    /// Looks a key up, optionally walking ancestor property lists of the
    /// same name.  Returns the value and the key of the property list it
    /// was found in.
    ///
    pub async fn get(&self, key_name: &str, search_parent: bool) -> Result<Option<(Value, String)>> {
        if let Some(value) = self.get_local(key_name) {
            return Ok(Some((value, self.doc.notifyable_key.clone())));
        }
        if !search_parent {
            return Ok(None);
        }

        let ops = self.doc.ops()?;
        let name = key::name_from_key(&self.doc.notifyable_key);
        for ancestor in key::ancestor_property_list_keys(&self.doc.notifyable_key, &name) {
            let Some(plist) = ops
                .get_notifyable_from_key(NotifyableKind::PropertyList, &ancestor, false)
                .await?
            else {
                continue;
            };
            if let Some(value) = plist.cached_key_values()?.get_local(key_name) {
                return Ok(Some((value, ancestor)));
            }
        }
        Ok(None)
    }

    pub fn set(&self, key: &str, value: Value) {
        self.doc.with_value_mut(|v| {
            v.insert(key.to_string(), value);
        });
    }

    pub fn erase(&self, key: &str) -> bool {
        self.doc.with_value_mut(|v| v.remove(key).is_some())
    }

    pub fn clear(&self) {
        self.doc.with_value_mut(|v| v.clear());
    }

    pub async fn publish(&self, unconditional: bool) -> Result<i32> {
        self.doc.publish(unconditional).await
    }

    pub async fn load(&self, set_watches_only: bool) -> Result<()> {
        self.doc.load(set_watches_only).await
    }
}

///
/// Free-form JSON state document (current or desired).
///
pub struct CachedState {
    doc: CachedDocument,
}

impl CachedState {
    pub(crate) fn current(notifyable_key: &str, ops: Weak<FactoryOps>) -> Self {
        Self {
            doc: CachedDocument::new(
                notifyable_key,
                key::CURRENT_STATE_JSON_OBJECT,
                ChangeKind::CurrentStateChange,
                ops,
            ),
        }
    }

    pub(crate) fn desired(notifyable_key: &str, ops: Weak<FactoryOps>) -> Self {
        Self {
            doc: CachedDocument::new(
                notifyable_key,
                key::DESIRED_STATE_JSON_OBJECT,
                ChangeKind::DesiredStateChange,
                ops,
            ),
        }
    }

    pub fn doc(&self) -> &CachedDocument {
        &self.doc
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.doc.with_value(|v| v.get(key).cloned())
    }

    pub fn set(&self, key: &str, value: Value) {
        self.doc.with_value_mut(|v| {
            v.insert(key.to_string(), value);
        });
    }

    pub fn erase(&self, key: &str) -> bool {
        self.doc.with_value_mut(|v| v.remove(key).is_some())
    }

    pub async fn publish(&self, unconditional: bool) -> Result<i32> {
        self.doc.publish(unconditional).await
    }

    pub async fn load(&self, set_watches_only: bool) -> Result<()> {
        self.doc.load(set_watches_only).await
    }
}

/// One shard of a data distribution: a half-open range of the hashed
/// keyspace mapped to a notifyable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub start_range: u64,
    pub end_range: u64,
    pub notifyable_key: String,
    pub priority: i32,
}

const SHARDS_KEY: &str = "shards";

///
/// Shard table of a data distribution.
///
pub struct CachedShards {
    doc: CachedDocument,
}

impl CachedShards {
    pub(crate) fn new(notifyable_key: &str, ops: Weak<FactoryOps>) -> Self {
        Self {
            doc: CachedDocument::new(
                notifyable_key,
                key::SHARD_JSON_OBJECT,
                ChangeKind::ShardsChange,
                ops,
            ),
        }
    }

    pub fn doc(&self) -> &CachedDocument {
        &self.doc
    }

    pub fn get_shards(&self) -> Vec<Shard> {
        self.doc.with_value(|v| {
            v.get(SHARDS_KEY)
                .and_then(|raw| serde_json::from_value(raw.clone()).ok())
                .unwrap_or_default()
        })
    }

    pub fn shard_count(&self) -> usize {
        self.get_shards().len()
    }

    pub fn add_shard(&self, shard: Shard) {
        let mut shards = self.get_shards();
        shards.push(shard);
        self.store(shards);
    }

    /// Drops every shard equal to the argument; reports whether any match
    /// existed.
    pub fn remove_shard(&self, shard: &Shard) -> bool {
        let mut shards = self.get_shards();
        let before = shards.len();
        shards.retain(|s| s != shard);
        let removed = shards.len() != before;
        self.store(shards);
        removed
    }

    /// Keys covering `point`, highest priority first.
    pub fn get_notifyable_keys(&self, point: u64) -> Vec<String> {
        let mut covering: Vec<Shard> = self
            .get_shards()
            .into_iter()
            .filter(|s| s.start_range <= point && point < s.end_range)
            .collect();
        covering.sort_by_key(|s| s.priority);
        covering.into_iter().map(|s| s.notifyable_key).collect()
    }

    fn store(&self, shards: Vec<Shard>) {
        self.doc.with_value_mut(|v| {
            v.insert(
                SHARDS_KEY.to_string(),
                serde_json::to_value(shards).expect("shards always encode"),
            );
        });
    }

    pub async fn publish(&self, unconditional: bool) -> Result<i32> {
        self.doc.publish(unconditional).await
    }

    pub async fn load(&self, set_watches_only: bool) -> Result<()> {
        self.doc.load(set_watches_only).await
    }
}

const ENABLED_KEY: &str = "enabled";
const MAX_PROCESS_SLOTS_KEY: &str = "maxProcessSlots";

///
/// Slot bookkeeping a node publishes for its managers.
///
pub struct CachedProcessSlotInfo {
    doc: CachedDocument,
}

impl CachedProcessSlotInfo {
    pub(crate) fn new(notifyable_key: &str, ops: Weak<FactoryOps>) -> Self {
        Self {
            doc: CachedDocument::new(
                notifyable_key,
                key::PROCESSSLOTINFO_JSON_OBJECT,
                ChangeKind::ProcessSlotInfoChange,
                ops,
            ),
        }
    }

    pub fn doc(&self) -> &CachedDocument {
        &self.doc
    }

    pub fn get_enable(&self) -> bool {
        self.doc
            .with_value(|v| v.get(ENABLED_KEY).and_then(Value::as_bool).unwrap_or(false))
    }

    pub fn set_enable(&self, enabled: bool) {
        self.doc.with_value_mut(|v| {
            v.insert(ENABLED_KEY.to_string(), Value::from(enabled));
        });
    }

    pub fn get_max_process_slots(&self) -> i32 {
        self.doc.with_value(|v| {
            v.get(MAX_PROCESS_SLOTS_KEY)
                .and_then(Value::as_i64)
                .unwrap_or(-1) as i32
        })
    }

    pub fn set_max_process_slots(&self, max: i32) {
        self.doc.with_value_mut(|v| {
            v.insert(MAX_PROCESS_SLOTS_KEY.to_string(), Value::from(max));
        });
    }

    pub async fn publish(&self, unconditional: bool) -> Result<i32> {
        self.doc.publish(unconditional).await
    }

    pub async fn load(&self, set_watches_only: bool) -> Result<()> {
        self.doc.load(set_watches_only).await
    }
}

const HOSTNAME_KEY: &str = "hostname";
const PORTS_KEY: &str = "ports";

///
/// Host and port assignment of a process slot.
///
pub struct CachedProcessInfo {
    doc: CachedDocument,
}

impl CachedProcessInfo {
    pub(crate) fn new(notifyable_key: &str, ops: Weak<FactoryOps>) -> Self {
        Self {
            doc: CachedDocument::new(
                notifyable_key,
                key::PROCESSINFO_JSON_OBJECT,
                ChangeKind::ProcessInfoChange,
                ops,
            ),
        }
    }

    pub fn doc(&self) -> &CachedDocument {
        &self.doc
    }

    pub fn get_hostname(&self) -> Option<String> {
        self.doc
            .with_value(|v| v.get(HOSTNAME_KEY).and_then(|h| h.as_str().map(String::from)))
    }

    pub fn set_hostname(&self, hostname: &str) {
        self.doc.with_value_mut(|v| {
            v.insert(HOSTNAME_KEY.to_string(), Value::from(hostname));
        });
    }

    pub fn get_port_arr(&self) -> Vec<i32> {
        self.doc.with_value(|v| {
            v.get(PORTS_KEY)
                .and_then(|raw| serde_json::from_value(raw.clone()).ok())
                .unwrap_or_default()
        })
    }

    pub fn set_port_arr(&self, ports: &[i32]) {
        self.doc.with_value_mut(|v| {
            v.insert(
                PORTS_KEY.to_string(),
                serde_json::to_value(ports).expect("ports always encode"),
            );
        });
    }

    pub async fn publish(&self, unconditional: bool) -> Result<i32> {
        self.doc.publish(unconditional).await
    }

    pub async fn load(&self, set_watches_only: bool) -> Result<()> {
        self.doc.load(set_watches_only).await
    }
}
