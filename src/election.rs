//! Sequence-node leader election per group.
//!
//! Bids are ephemeral-sequential children of `<group>/_leadershipBids`; the
//! lowest extant bid wins and publishes its node's key into
//! `<group>/_currentLeader`.  Losers watch their immediate predecessor bid,
//! so when a leader's session ends the next bidder re-derives the order and
//! republishes.  `_currentLeader` carries its own watch, which keeps every
//! process's cached leader fresh; between an expiry and the republish the
//! published value is visibly stale.

use {
    crate::{
        cache::{ElectionRecord, FactoryOps},
        error::{Error, Result},
        event::{ChangeKind, NotifyableEvent},
        key,
        key::NotifyableKind,
        notifyable::Notifyable,
        repository::{adapter, CreateMode, RawEvent, WatchContext},
    },
    std::sync::Arc,
    tracing::{debug, info, trace},
};

impl Notifyable {
    fn check_electable(&self) -> Result<()> {
        match self.kind() {
            NotifyableKind::Group | NotifyableKind::Application => Ok(()),
            other => Err(Error::InvalidMethod(format!(
                "{other:?} notifyables do not hold elections"
            ))),
        }
    }

    /// The three well-known leadership paths, resolved once on first use.
    pub(crate) fn leadership_paths(&self) -> (String, String, String) {
        let mut leadership = self.leadership.lock().expect("leadership lock poisoned");
        if !leadership.initialized {
            leadership.initialized = true;
            leadership.current_leader_path = key::internal_znode(self.key(), key::CURRENT_LEADER);
            leadership.bids_path = key::internal_znode(self.key(), key::LEADERSHIP_BIDS);
            leadership.bid_prefix_path =
                format!("{}/{}", leadership.bids_path, key::BID_PREFIX);
        }
        (
            leadership.current_leader_path.clone(),
            leadership.bids_path.clone(),
            leadership.bid_prefix_path.clone(),
        )
    }

    ///
    /// Places (or re-evaluates) this process's leadership bid for `node`.
    /// Returns whether the node is now the published leader.
    ///
    pub async fn try_to_become_leader(&self, node: &Arc<Notifyable>) -> Result<bool> {
        self.throw_if_removed()?;
        self.check_electable()?;
        if node.kind() != NotifyableKind::Node {
            return Err(Error::InvalidArguments(format!(
                "only nodes lead groups, got {:?}",
                node.kind()
            )));
        }
        let ops = self.ops()?;
        let (_, _, bid_prefix) = self.leadership_paths();

        let existing = ops
            .election_registry
            .get(self.key())
            .map(|entry| entry.clone());
        let record = match existing {
            Some(existing) => existing,
            None => {
                let bid = ops
                    .adapter()
                    .create_sequence(&bid_prefix, node.key(), true, true)
                    .await?;
                let record = ElectionRecord {
                    bid,
                    bid_path: adapter::sequence_node_path(&bid_prefix, bid),
                    node_key: node.key().to_string(),
                };
                trace!(bid = %record.bid_path, "leadership bid placed");
                ops.election_registry
                    .insert(self.key().to_string(), record.clone());
                record
            }
        };

        evaluate_election(&ops, self, &record).await
    }

    ///
    /// Whether `node` is the currently published leader of this group.
    ///
    pub async fn am_i_the_leader(&self, node: &Arc<Notifyable>) -> Result<bool> {
        self.check_electable()?;
        let known = {
            let leadership = self.leadership.lock().expect("leadership lock poisoned");
            leadership
                .leader_known
                .then(|| leadership.leader_node_key.clone())
        };
        let leader = match known {
            Some(leader) => leader,
            None => {
                let ops = self.ops()?;
                refresh_leader_cache(&ops, self).await?;
                self.leadership
                    .lock()
                    .expect("leadership lock poisoned")
                    .leader_node_key
                    .clone()
            }
        };
        Ok(leader.as_deref() == Some(node.key()))
    }

    /// The group's published leader, if any.
    pub async fn get_leader(&self) -> Result<Option<Arc<Notifyable>>> {
        self.check_electable()?;
        let leader_key = {
            let leadership = self.leadership.lock().expect("leadership lock poisoned");
            leadership.leader_node_key.clone()
        };
        let leader_key = match leader_key {
            Some(leader_key) => leader_key,
            None => {
                let ops = self.ops()?;
                refresh_leader_cache(&ops, self).await?;
                match self
                    .leadership
                    .lock()
                    .expect("leadership lock poisoned")
                    .leader_node_key
                    .clone()
                {
                    Some(leader_key) => leader_key,
                    None => return Ok(None),
                }
            }
        };
        self.ops()?
            .get_notifyable_from_key(NotifyableKind::Node, &leader_key, false)
            .await
    }

    ///
    /// Withdraws this process's bid.  The published leader entry is left
    /// for the next winner to overwrite; session expiry withdraws bids the
    /// same way.
    ///
    pub async fn give_up_leadership(&self) -> Result<()> {
        self.check_electable()?;
        let ops = self.ops()?;
        let Some((_, record)) = ops.election_registry.remove(self.key()) else {
            return Err(Error::InvalidMethod(format!(
                "no outstanding leadership bid for {}",
                self.key()
            )));
        };
        ops.adapter().delete(&record.bid_path, false, -1).await?;
        let mut leadership = self.leadership.lock().expect("leadership lock poisoned");
        leadership.my_bid = -1;
        debug!(group = %self.key(), "leadership bid withdrawn");
        Ok(())
    }
}

///
/// Re-derives the election outcome for this process's bid: publish when
/// lowest, otherwise watch the immediate predecessor bid.
///
async fn evaluate_election(
    ops: &Arc<FactoryOps>,
    group: &Notifyable,
    record: &ElectionRecord,
) -> Result<bool> {
    let (current_leader_path, bids_path, _) = group.leadership_paths();
    loop {
        let children = ops.adapter().get_children(&bids_path, None).await?;
        let mut bids = Vec::with_capacity(children.len());
        for child in children {
            let (_, sequence) = adapter::split_sequence_node(&child)?;
            bids.push((sequence, child));
        }
        bids.sort();

        let Some(my_pos) = bids.iter().position(|(seq, _)| *seq == record.bid) else {
            // Our bid is gone (the session that placed it expired).
            ops.election_registry.remove(group.key());
            return Ok(false);
        };

        if my_pos == 0 {
            publish_current_leader(ops, &current_leader_path, &record.node_key).await?;
            let mut leadership = group.leadership.lock().expect("leadership lock poisoned");
            leadership.leader_known = true;
            leadership.leader_node_key = Some(record.node_key.clone());
            leadership.my_bid = record.bid;
            info!(group = %group.key(), node = %record.node_key, "became group leader");
            return Ok(true);
        }

        let predecessor = bids[my_pos - 1].1.clone();
        let watch = WatchContext::CachedObject(ChangeKind::LeadershipBidChange);
        if ops
            .adapter()
            .exists(&predecessor, Some(watch))
            .await?
            .is_none()
        {
            // Predecessor vanished before the watch landed; re-derive.
            continue;
        }
        {
            let mut leadership = group.leadership.lock().expect("leadership lock poisoned");
            leadership.my_bid = record.bid;
        }
        return Ok(false);
    }
}

async fn publish_current_leader(
    ops: &Arc<FactoryOps>,
    current_leader_path: &str,
    node_key: &str,
) -> Result<()> {
    match ops.adapter().set_data(current_leader_path, node_key, -1).await {
        Ok(_) => Ok(()),
        Err(Error::NoNode(_)) => {
            let _ = ops
                .adapter()
                .create(current_leader_path, node_key, CreateMode::Persistent, false)
                .await?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Installs the `_currentLeader` watch and primes the cached leader; used
/// at group materialization and by `am_i_the_leader` on a cold cache.
pub(crate) async fn refresh_leader_cache(ops: &Arc<FactoryOps>, group: &Notifyable) -> Result<()> {
    let (current_leader_path, _, _) = group.leadership_paths();
    let watch = WatchContext::CachedObject(ChangeKind::CurrentLeaderChange);
    let stat = ops.adapter().exists(&current_leader_path, Some(watch)).await?;
    let leader = match stat {
        Some(_) => ops
            .adapter()
            .get_data(&current_leader_path, None)
            .await?
            .map(|(data, _)| data)
            .filter(|data| !data.is_empty()),
        None => None,
    };
    let mut leadership = group.leadership.lock().expect("leadership lock poisoned");
    leadership.leader_known = true;
    leadership.leader_node_key = leader;
    Ok(())
}

/*
 * Change handlers.
 */

fn parent_path(path: &str) -> Option<String> {
    match path.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => Some(parent.to_string()),
        _ => None,
    }
}

/// `_currentLeader` changed: refresh the cached leader and re-arm.
pub(crate) async fn current_leader_change(
    ops: &Arc<FactoryOps>,
    event: &RawEvent,
) -> Result<Option<(String, NotifyableEvent)>> {
    let Some(group_key) = parent_path(&event.path) else {
        return Ok(None);
    };
    let Some(group) = ops.lookup_notifyable(&group_key) else {
        return Ok(None);
    };
    refresh_leader_cache(ops, &group).await?;
    Ok(Some((group_key, NotifyableEvent::LeadershipChange)))
}

/// A watched predecessor bid went away: re-derive our standing, publishing
/// if this process's bid is now the lowest.
pub(crate) async fn bid_change(
    ops: &Arc<FactoryOps>,
    event: &RawEvent,
) -> Result<Option<(String, NotifyableEvent)>> {
    let Some(bids_dir) = parent_path(&event.path) else {
        return Ok(None);
    };
    let Some(group_key) = parent_path(&bids_dir) else {
        return Ok(None);
    };
    let Some(group) = ops.lookup_notifyable(&group_key) else {
        return Ok(None);
    };
    let Some(record) = ops
        .election_registry
        .get(&group_key)
        .map(|entry| entry.clone())
    else {
        return Ok(None);
    };
    let won = evaluate_election(ops, &group, &record).await?;
    Ok(won.then(|| (group_key, NotifyableEvent::LeadershipChange)))
}
