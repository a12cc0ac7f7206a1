//! Distributed advisory locks.
//!
//! A lock lives under `<key>/_locks/<name>/` as ephemeral-sequential bids;
//! the lowest extant sequence owns the lock.  Shared bids pass each other,
//! so readers only ever queue behind exclusive bids ahead of them.  A
//! waiter parks on its immediate blocking predecessor through the signal
//! map and re-derives the order whenever the predecessor goes away, which
//! also makes the wait immune to missed firings: a timed-out wait simply
//! re-lists the bids.

use {
    crate::{
        cache::LockRecord,
        error::{Error, Result},
        event::ChangeKind,
        ids, key,
        notifyable::Notifyable,
        repository::{adapter, WatchContext},
    },
    serde_json::{json, Value},
    std::time::Duration,
    tracing::{debug, trace, warn},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributedLockMode {
    Shared,
    Exclusive,
}

impl DistributedLockMode {
    fn bid_prefix(self) -> &'static str {
        match self {
            DistributedLockMode::Shared => "SH-",
            DistributedLockMode::Exclusive => "EX-",
        }
    }

    fn of_bid_name(name: &str) -> Option<Self> {
        if name.starts_with("SH-") {
            Some(DistributedLockMode::Shared)
        } else if name.starts_with("EX-") {
            Some(DistributedLockMode::Exclusive)
        } else {
            None
        }
    }
}

/// The winning bid of a lock, as read from the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub owner_id: String,
    pub sequence_index: i64,
    pub owner_time_msecs: i64,
}

struct Bid {
    path: String,
    sequence: i64,
    mode: DistributedLockMode,
}

const BID_ID_KEY: &str = "id";
const BID_MSECS_KEY: &str = "msecs";

fn bid_data(owner: &str) -> String {
    json!({ BID_ID_KEY: owner, BID_MSECS_KEY: ids::current_time_msecs() }).to_string()
}

async fn list_bids(ops: &crate::cache::FactoryOps, lock_dir: &str) -> Result<Vec<Bid>> {
    let children = ops.adapter().get_children(lock_dir, None).await?;
    let mut bids = Vec::with_capacity(children.len());
    for child in children {
        let (_, sequence) = adapter::split_sequence_node(&child)?;
        let name = key::name_from_key(&child);
        let Some(mode) = DistributedLockMode::of_bid_name(&name) else {
            warn!(bid = %child, "ignoring bid with unknown mode prefix");
            continue;
        };
        bids.push(Bid {
            path: child,
            sequence,
            mode,
        });
    }
    bids.sort_by_key(|bid| bid.sequence);
    Ok(bids)
}

impl Notifyable {
    ///
    /// Acquires the named lock, waiting indefinitely.
    ///
    pub async fn acquire_lock(&self, lock_name: &str, mode: DistributedLockMode) -> Result<()> {
        if !self.acquire_lock_wait_msecs(-1, lock_name, mode).await? {
            return Err(Error::InconsistentInternalState(
                "an unbounded lock wait returned without the lock".to_string(),
            ));
        }
        Ok(())
    }

    ///
    /// Acquires the named lock, giving up after `msecs` (negative waits
    /// forever).  A timed-out attempt withdraws its bid and returns false.
    ///
    pub async fn acquire_lock_wait_msecs(
        &self,
        msecs: i64,
        lock_name: &str,
        mode: DistributedLockMode,
    ) -> Result<bool> {
        self.throw_if_removed()?;
        if lock_name.is_empty() || lock_name.contains('/') {
            return Err(Error::InvalidArguments(format!(
                "bad lock name '{lock_name}'"
            )));
        }
        let ops = self.ops()?;
        let registry_key = (self.key().to_string(), lock_name.to_string());
        if ops.lock_registry.contains_key(&registry_key) {
            return Err(Error::InvalidMethod(format!(
                "lock {lock_name} on {} is already held by this process",
                self.key()
            )));
        }

        let deadline = (msecs >= 0)
            .then(|| tokio::time::Instant::now() + Duration::from_millis(msecs as u64));
        let owner = ids::hostname_pid_tid();
        let lock_dir = key::lock_dir(self.key(), lock_name);
        let bid_prefix = format!("{lock_dir}/{}{owner}-", mode.bid_prefix());

        let sequence = ops
            .adapter()
            .create_sequence(&bid_prefix, &bid_data(&owner), true, true)
            .await?;
        let my_path = adapter::sequence_node_path(&bid_prefix, sequence);
        trace!(bid = %my_path, "lock bid placed");

        loop {
            let bids = list_bids(&ops, &lock_dir).await?;
            let Some(my_pos) = bids.iter().position(|bid| bid.sequence == sequence) else {
                return Err(Error::InconsistentInternalState(format!(
                    "lock bid {my_path} disappeared while waiting"
                )));
            };

            let blocking = bids[..my_pos]
                .iter()
                .filter(|bid| {
                    mode == DistributedLockMode::Exclusive
                        || bid.mode == DistributedLockMode::Exclusive
                })
                .last();
            let Some(predecessor) = blocking else {
                debug!(lock = lock_name, key = %self.key(), "lock acquired");
                ops.lock_registry.insert(
                    registry_key,
                    LockRecord {
                        owner,
                        acquired_msecs: ids::current_time_msecs(),
                        lock_node_path: my_path,
                    },
                );
                return Ok(true);
            };
            let predecessor = predecessor.path.clone();

            ops.signal_map.add_ref(&predecessor);
            let watch = WatchContext::CachedObject(ChangeKind::PredecessorLockNodeChange);
            let stat = match ops.adapter().exists(&predecessor, Some(watch)).await {
                Ok(stat) => stat,
                Err(e) => {
                    let _ = ops.signal_map.remove_ref(&predecessor);
                    return Err(e);
                }
            };
            if stat.is_none() {
                // Gone between the listing and the watch; recompute.
                ops.signal_map.remove_ref(&predecessor)?;
                continue;
            }

            let wait_usecs = match deadline {
                None => -1,
                Some(deadline) => {
                    let now = tokio::time::Instant::now();
                    if deadline <= now {
                        0
                    } else {
                        (deadline - now).as_micros() as i64
                    }
                }
            };
            let woken = ops.signal_map.wait_usecs(&predecessor, wait_usecs).await;
            ops.signal_map.remove_ref(&predecessor)?;
            let woken = woken?;

            if !woken {
                if let Some(deadline) = deadline {
                    if deadline <= tokio::time::Instant::now() {
                        debug!(bid = %my_path, "lock wait timed out, withdrawing bid");
                        ops.adapter().delete(&my_path, false, -1).await?;
                        return Ok(false);
                    }
                }
            }
        }
    }

    ///
    /// Releases a lock this process holds.  Session loss releases held
    /// locks implicitly, since bids are ephemeral.
    ///
    pub async fn release_lock(&self, lock_name: &str) -> Result<()> {
        let ops = self.ops()?;
        let registry_key = (self.key().to_string(), lock_name.to_string());
        let Some((_, record)) = ops.lock_registry.remove(&registry_key) else {
            return Err(Error::InvalidMethod(format!(
                "lock {lock_name} on {} is not held by this process",
                self.key()
            )));
        };
        ops.adapter().delete(&record.lock_node_path, false, -1).await?;
        debug!(lock = lock_name, key = %self.key(), "lock released");
        Ok(())
    }

    /// Whether this process currently holds the named lock.
    pub fn has_lock(&self, lock_name: &str) -> Result<bool> {
        let ops = self.ops()?;
        let registry_key = (self.key().to_string(), lock_name.to_string());
        Ok(ops.lock_registry.contains_key(&registry_key))
    }

    ///
    /// Reads the current winning bid of a lock, clusterwide.  `None` when
    /// nobody holds it.
    ///
    pub async fn get_lock_info(&self, lock_name: &str) -> Result<Option<LockInfo>> {
        let ops = self.ops()?;
        let lock_dir = key::lock_dir(self.key(), lock_name);
        let bids = list_bids(&ops, &lock_dir).await?;
        let Some(winner) = bids.first() else {
            return Ok(None);
        };
        let Some((data, _)) = ops.adapter().get_data(&winner.path, None).await? else {
            return Ok(None);
        };
        let parsed: Value = serde_json::from_str(&data).map_err(|e| {
            Error::InconsistentInternalState(format!(
                "unparseable bid data on {}: {e}",
                winner.path
            ))
        })?;
        let owner_id = parsed
            .get(BID_ID_KEY)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let owner_time_msecs = parsed
            .get(BID_MSECS_KEY)
            .and_then(Value::as_i64)
            .unwrap_or(-1);
        Ok(Some(LockInfo {
            owner_id,
            sequence_index: winner.sequence,
            owner_time_msecs,
        }))
    }
}
