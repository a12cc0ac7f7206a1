use {crate::event::ChangeKind, async_trait::async_trait, tokio::sync::mpsc};

///
/// In-process repository implementing the full wire/watch contract.
///
pub mod memory;

///
/// Session management, retry policy, and the two-queue event pipeline over a
/// raw store.
///
pub mod adapter;

pub use adapter::RepositoryAdapter;
pub use memory::MemoryStorage;

/// Width of the fixed decimal suffix the store appends to sequential nodes.
pub const SEQUENCE_NUMBER_WIDTH: usize = 10;

pub type SessionId = u64;

/// Store-level error codes, beneath the typed error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ConnectionLoss,
    OperationTimeout,
    NoNode,
    NodeExists,
    NotEmpty,
    BadVersion,
    NoAuth,
    NoChildrenForEphemerals,
    InvalidState,
    Unknown(i32),
}

pub type StoreResult<T> = std::result::Result<T, ErrorCode>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchedEventType {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
    Session,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeeperState {
    Disconnected,
    Connecting,
    SyncConnected,
    Expired,
}

/// Node metadata returned by reads and conditional writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    pub version: i32,
    pub num_children: i32,
    pub is_ephemeral: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    PersistentSequential,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

///
/// Context attached to a watch when it is registered, handed back verbatim
/// when the watch fires.  `Broadcast` watches fan out to every registered
/// listener; the others are routed to the owning subsystem.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchContext {
    /// No dedicated consumer: deliver to all listeners.
    Broadcast,
    /// Dispatch through the cached-object change-handler registry.
    CachedObject(ChangeKind),
    /// Rendezvous token for a synchronize barrier.
    Sync { token: String },
}

/// One event out of the repository: a watch firing or a session transition.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub event_type: WatchedEventType,
    pub state: KeeperState,
    pub path: String,
    pub context: Option<WatchContext>,
}

///
/// The only assumption made about the metadata store.
///
/// Implementations must be sequentially consistent, deliver watch firings
/// for a path in mutation order, and honor one-shot watch semantics: a
/// registered watch fires at most once and is consumed by firing.
///
#[async_trait]
pub trait Storage: Send + Sync {
    /// Opens a session; store events for it flow into `events`.
    async fn connect(&self, events: mpsc::UnboundedSender<RawEvent>) -> StoreResult<SessionId>;

    /// Closes a session, reaping its ephemeral nodes.
    async fn close(&self, session: SessionId) -> StoreResult<()>;

    /// Creates a node, returning the actual path (sequential modes append
    /// the fixed-width suffix).
    async fn create(
        &self,
        session: SessionId,
        path: &str,
        data: &str,
        mode: CreateMode,
    ) -> StoreResult<String>;

    /// Deletes a node; `version >= 0` makes the delete conditional.
    async fn delete(&self, session: SessionId, path: &str, version: i32) -> StoreResult<()>;

    async fn exists(
        &self,
        session: SessionId,
        path: &str,
        watch: Option<WatchContext>,
    ) -> StoreResult<Option<Stat>>;

    async fn get_data(
        &self,
        session: SessionId,
        path: &str,
        watch: Option<WatchContext>,
    ) -> StoreResult<(String, Stat)>;

    async fn set_data(
        &self,
        session: SessionId,
        path: &str,
        data: &str,
        version: i32,
    ) -> StoreResult<Stat>;

    /// Child names (relative, unsorted) of a node.
    async fn get_children(
        &self,
        session: SessionId,
        path: &str,
        watch: Option<WatchContext>,
    ) -> StoreResult<Vec<String>>;

    /// Flushes the session's view; completes only after every previously
    /// produced watch firing has been handed to the session's channel.
    async fn sync(&self, session: SessionId, path: &str) -> StoreResult<()>;
}
