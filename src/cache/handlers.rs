//! Per-path change handlers.
//!
//! Every repository watch the cache installs carries a `ChangeKind`; when
//! the watch fires, the firing is dispatched here.  Each handler refreshes
//! the affected cached state, reinstalls its watch (directly or through the
//! document reload), and reports the externally visible event.  A handler
//! that cannot find its notifyable in the cache drops the firing: the
//! instance was released or removed while the event was in flight.

use {
    super::FactoryOps,
    crate::{
        election,
        error::Result,
        event::{ChangeKind, NotifyableEvent},
        key,
        notifyable::NotifyableState,
        repository::{RawEvent, WatchContext, WatchedEventType},
    },
    std::sync::Arc,
    tracing::{debug, trace},
};

/// Outcome of a handled firing: the notifyable key to notify user handlers
/// under, and the event to deliver.
pub(crate) type Handled = Option<(String, NotifyableEvent)>;

pub(crate) async fn dispatch(
    ops: &Arc<FactoryOps>,
    kind: ChangeKind,
    event: &RawEvent,
) -> Result<Handled> {
    trace!(?kind, path = %event.path, event_type = ?event.event_type, "change handler");
    match kind {
        ChangeKind::NotifyableStateChange => notifyable_state_change(ops, event).await,
        ChangeKind::ApplicationsChange => {
            children_change(ops, event, kind, NotifyableEvent::ApplicationsChange).await
        }
        ChangeKind::GroupsChange => {
            children_change(ops, event, kind, NotifyableEvent::GroupsChange).await
        }
        ChangeKind::NodesChange => {
            children_change(ops, event, kind, NotifyableEvent::NodesChange).await
        }
        ChangeKind::ProcessSlotsChange => {
            children_change(ops, event, kind, NotifyableEvent::ProcessSlotsChange).await
        }
        ChangeKind::DataDistributionsChange => {
            children_change(ops, event, kind, NotifyableEvent::DataDistributionsChange).await
        }
        ChangeKind::PropertyListsChange => {
            children_change(ops, event, kind, NotifyableEvent::PropertyListsChange).await
        }
        ChangeKind::QueuesChange => {
            children_change(ops, event, kind, NotifyableEvent::QueuesChange).await
        }
        ChangeKind::NodeConnectionChange => node_connection_change(ops, event).await,
        ChangeKind::NodeClientStateChange => node_client_state_change(ops, event).await,
        ChangeKind::PropertyListValuesChange => {
            let (notifyable_key, notifyable) = match owner_of(ops, &event.path) {
                Some(found) => found,
                None => return Ok(None),
            };
            notifyable.cached_key_values()?.load(false).await?;
            Ok(Some((notifyable_key, NotifyableEvent::PropertyListValuesChange)))
        }
        ChangeKind::CurrentStateChange => {
            let (notifyable_key, notifyable) = match owner_of(ops, &event.path) {
                Some(found) => found,
                None => return Ok(None),
            };
            notifyable.cached_current_state().load(false).await?;
            Ok(Some((notifyable_key, NotifyableEvent::CurrentStateChange)))
        }
        ChangeKind::DesiredStateChange => {
            let (notifyable_key, notifyable) = match owner_of(ops, &event.path) {
                Some(found) => found,
                None => return Ok(None),
            };
            notifyable.cached_desired_state().load(false).await?;
            Ok(Some((notifyable_key, NotifyableEvent::DesiredStateChange)))
        }
        ChangeKind::ShardsChange => {
            let (notifyable_key, notifyable) = match owner_of(ops, &event.path) {
                Some(found) => found,
                None => return Ok(None),
            };
            notifyable.cached_shards()?.load(false).await?;
            Ok(Some((notifyable_key, NotifyableEvent::ShardsChange)))
        }
        ChangeKind::ProcessInfoChange => {
            let (notifyable_key, notifyable) = match owner_of(ops, &event.path) {
                Some(found) => found,
                None => return Ok(None),
            };
            notifyable.cached_process_info()?.load(false).await?;
            Ok(Some((notifyable_key, NotifyableEvent::ProcessInfoChange)))
        }
        ChangeKind::ProcessSlotInfoChange => {
            let (notifyable_key, notifyable) = match owner_of(ops, &event.path) {
                Some(found) => found,
                None => return Ok(None),
            };
            notifyable.cached_process_slot_info()?.load(false).await?;
            Ok(Some((notifyable_key, NotifyableEvent::ProcessSlotInfoChange)))
        }
        ChangeKind::CurrentLeaderChange => election::current_leader_change(ops, event).await,
        ChangeKind::LeadershipBidChange => election::bid_change(ops, event).await,
        ChangeKind::PredecessorLockNodeChange => {
            // The lock waiter re-examines the bid order itself; all the
            // handler does is wake it.
            ops.signal_map.signal(&event.path);
            Ok(None)
        }
        ChangeKind::QueueChildChange => queue_child_change(ops, event).await,
    }
}

/// The notifyable owning an internal znode, resolved from the znode's
/// parent path.  `None` when the instance is no longer cached.
fn owner_of(ops: &Arc<FactoryOps>, internal_path: &str) -> Option<(String, Arc<crate::notifyable::Notifyable>)> {
    let notifyable_key = parent_path(internal_path)?;
    let notifyable = ops.lookup_notifyable(&notifyable_key)?;
    Some((notifyable_key, notifyable))
}

fn parent_path(path: &str) -> Option<String> {
    match path.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => Some(parent.to_string()),
        _ => None,
    }
}

async fn notifyable_state_change(ops: &Arc<FactoryOps>, event: &RawEvent) -> Result<Handled> {
    let notifyable_key = event.path.clone();
    let Some(notifyable) = ops.lookup_notifyable(&notifyable_key) else {
        debug!(key = %notifyable_key, "state change for an uncached notifyable, dropped");
        return Ok(None);
    };

    if event.event_type == WatchedEventType::NodeDeleted {
        notifyable.set_state(NotifyableState::Removed);
        ops.forget_notifyable(&notifyable_key);
        return Ok(Some((notifyable_key, NotifyableEvent::Removed)));
    }

    let watch = WatchContext::CachedObject(ChangeKind::NotifyableStateChange);
    let stat = ops.adapter().exists(&notifyable_key, Some(watch)).await?;
    if stat.is_none() {
        notifyable.set_state(NotifyableState::Removed);
        ops.forget_notifyable(&notifyable_key);
        return Ok(Some((notifyable_key, NotifyableEvent::Removed)));
    }

    let data = ops
        .adapter()
        .get_data(&notifyable_key, None)
        .await?
        .map(|(data, _)| data)
        .unwrap_or_default();
    let now_ready = data == key::READY_VALUE;
    let old = notifyable.set_state(if now_ready {
        NotifyableState::Ready
    } else {
        NotifyableState::Init
    });
    let user_event = if now_ready && old != NotifyableState::Ready {
        NotifyableEvent::Ready
    } else {
        NotifyableEvent::StateChange
    };
    Ok(Some((notifyable_key, user_event)))
}

async fn children_change(
    ops: &Arc<FactoryOps>,
    event: &RawEvent,
    kind: ChangeKind,
    user_event: NotifyableEvent,
) -> Result<Handled> {
    let Some(parent_key) = parent_path(&event.path) else {
        return Ok(None);
    };
    if ops.lookup_notifyable(&parent_key).is_none() {
        debug!(key = %parent_key, "children change for an uncached notifyable, dropped");
        return Ok(None);
    }
    let watch = WatchContext::CachedObject(kind);
    ops.adapter().get_children(&event.path, Some(watch)).await?;
    Ok(Some((parent_key, user_event)))
}

async fn node_connection_change(ops: &Arc<FactoryOps>, event: &RawEvent) -> Result<Handled> {
    let Some((node_key, node)) = owner_of(ops, &event.path) else {
        return Ok(None);
    };
    let watch = WatchContext::CachedObject(ChangeKind::NodeConnectionChange);
    let stat = ops.adapter().exists(&event.path, Some(watch)).await?;
    node.set_connected(stat.is_some());
    Ok(Some((node_key, NotifyableEvent::ConnectionChange)))
}

async fn node_client_state_change(ops: &Arc<FactoryOps>, event: &RawEvent) -> Result<Handled> {
    let Some((node_key, node)) = owner_of(ops, &event.path) else {
        return Ok(None);
    };
    let watch = WatchContext::CachedObject(ChangeKind::NodeClientStateChange);
    let stat = ops.adapter().exists(&event.path, Some(watch)).await?;
    if stat.is_none() {
        node.set_client_state(String::new(), String::new());
        return Ok(Some((node_key, NotifyableEvent::ClientStateChange)));
    }

    let state = ops
        .adapter()
        .get_data(&event.path, None)
        .await?
        .map(|(data, _)| data)
        .unwrap_or_default();
    let desc_path = key::internal_znode(&node_key, key::CLIENT_STATE_DESC);
    let description = ops
        .adapter()
        .get_data(&desc_path, None)
        .await?
        .map(|(data, _)| data)
        .unwrap_or_default();
    node.set_client_state(state, description);
    Ok(Some((node_key, NotifyableEvent::ClientStateChange)))
}

async fn queue_child_change(ops: &Arc<FactoryOps>, event: &RawEvent) -> Result<Handled> {
    // Wake blocked takers whether or not the queue is still cached.
    ops.signal_map.signal(&event.path);

    let Some(queue_key) = parent_path(&event.path) else {
        return Ok(None);
    };
    if ops.lookup_notifyable(&queue_key).is_none() {
        return Ok(None);
    }
    let watch = WatchContext::CachedObject(ChangeKind::QueueChildChange);
    ops.adapter().get_children(&event.path, Some(watch)).await?;
    Ok(Some((queue_key, NotifyableEvent::QueueChildChange)))
}
