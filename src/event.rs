use async_trait::async_trait;

///
/// Externally visible event on a notifyable, delivered to user event
/// handlers registered against the notifyable's key.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyableEvent {
    /// The notifyable finished the ready protocol.
    Ready,
    /// The notifyable's repository entry disappeared.
    Removed,
    /// The ready sentinel changed to something other than `"ready"`.
    StateChange,
    ApplicationsChange,
    GroupsChange,
    NodesChange,
    ProcessSlotsChange,
    DataDistributionsChange,
    PropertyListsChange,
    QueuesChange,
    PropertyListValuesChange,
    ShardsChange,
    CurrentStateChange,
    DesiredStateChange,
    ProcessInfoChange,
    ProcessSlotInfoChange,
    /// A node's ephemeral connection marker appeared or vanished.
    ConnectionChange,
    /// A node's published client health state changed.
    ClientStateChange,
    LeadershipChange,
    /// An element was added to or removed from a queue.
    QueueChildChange,
    /// The watch firing produced no externally visible change.
    NoEvent,
}

///
/// Internal classification of a repository watch: which change handler a
/// firing on the watched path is dispatched to.  Every handler reinstalls
/// its watch before returning so the cache stays live.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    NotifyableStateChange,
    NodeConnectionChange,
    NodeClientStateChange,
    PropertyListValuesChange,
    ShardsChange,
    CurrentStateChange,
    DesiredStateChange,
    ProcessInfoChange,
    ProcessSlotInfoChange,
    ApplicationsChange,
    GroupsChange,
    NodesChange,
    ProcessSlotsChange,
    DataDistributionsChange,
    PropertyListsChange,
    QueuesChange,
    QueueChildChange,
    CurrentLeaderChange,
    LeadershipBidChange,
    PredecessorLockNodeChange,
}

/// What a watch firing turned into, addressed by notifyable key.
#[derive(Debug, Clone)]
pub struct UserEventPayload {
    pub key: String,
    pub event: NotifyableEvent,
}

impl UserEventPayload {
    pub fn new(key: impl Into<String>, event: NotifyableEvent) -> Self {
        Self {
            key: key.into(),
            event,
        }
    }
}

///
/// User-level event callback, registered per notifyable key.
///
/// Handlers run on the factory's user-event worker: they may perform
/// repository I/O, but must never block waiting for a watch firing that the
/// same worker would have to deliver.
///
#[async_trait]
pub trait UserEventHandler: Send + Sync {
    async fn handle_user_event(&self, payload: &UserEventPayload);
}

/// Callback for a delayed alarm scheduled through the factory.
#[async_trait]
pub trait TimerEventHandler: Send + Sync {
    async fn handle_timer_event(&self, id: crate::sync::TimerId, alarm_msecs: i64);
}
