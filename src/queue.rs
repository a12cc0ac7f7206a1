//! Repository-backed FIFO queues.
//!
//! Elements are persistent-sequential children of the queue's
//! `_queueElements` znode; `put` creates one, `take` deletes the lowest on
//! read.  Concurrent takers race on the delete, and the loser moves on to
//! the next element.  Blocked takers park on the signal map keyed by the
//! elements path, which the queue-child change handler signals.

use {
    crate::{
        error::{Error, Result},
        event::ChangeKind,
        key,
        key::NotifyableKind,
        notifyable::Notifyable,
        repository::WatchContext,
    },
    std::time::Duration,
    tracing::trace,
};

impl Notifyable {
    fn check_queue(&self) -> Result<()> {
        if self.kind() != NotifyableKind::Queue {
            return Err(Error::InvalidMethod(format!("{} is not a queue", self.key())));
        }
        Ok(())
    }

    fn elements_path(&self) -> String {
        key::internal_znode(self.key(), key::QUEUE_ELEMENTS)
    }

    ///
    /// Appends an element; returns its sequence number.
    ///
    pub async fn queue_put(&self, data: &str) -> Result<i64> {
        self.throw_if_removed()?;
        self.check_queue()?;
        let ops = self.ops()?;
        let prefix = format!("{}/{}", self.elements_path(), key::QUEUE_ELEMENT_PREFIX);
        let sequence = ops
            .adapter()
            .create_sequence(&prefix, data, false, true)
            .await?;
        trace!(queue = %self.key(), sequence, "queue element added");
        Ok(sequence)
    }

    /// Takes the head element, waiting indefinitely for one to appear.
    pub async fn queue_take(&self) -> Result<String> {
        self.queue_take_wait_msecs(-1).await?.ok_or_else(|| {
            Error::InconsistentInternalState(
                "an unbounded queue take returned without an element".to_string(),
            )
        })
    }

    ///
    /// Takes the head element, waiting up to `msecs` (negative waits
    /// forever, zero polls).  `None` on timeout.
    ///
    pub async fn queue_take_wait_msecs(&self, msecs: i64) -> Result<Option<String>> {
        self.throw_if_removed()?;
        self.check_queue()?;
        let ops = self.ops()?;
        let elements = self.elements_path();
        let deadline = (msecs >= 0)
            .then(|| tokio::time::Instant::now() + Duration::from_millis(msecs as u64));

        loop {
            // Register for wakeups before listing so an element added right
            // after the listing still signals us.
            ops.signal_map.add_ref(&elements);

            let attempt = self.take_first_element(&elements).await;
            let element = match attempt {
                Ok(element) => element,
                Err(e) => {
                    let _ = ops.signal_map.remove_ref(&elements);
                    return Err(e);
                }
            };
            if let Some(data) = element {
                ops.signal_map.remove_ref(&elements)?;
                return Ok(Some(data));
            }

            let wait_usecs = match deadline {
                None => -1,
                Some(deadline) => {
                    let now = tokio::time::Instant::now();
                    if deadline <= now {
                        ops.signal_map.remove_ref(&elements)?;
                        return Ok(None);
                    }
                    (deadline - now).as_micros() as i64
                }
            };
            let woken = ops.signal_map.wait_usecs(&elements, wait_usecs).await;
            ops.signal_map.remove_ref(&elements)?;
            if !woken? {
                if let Some(deadline) = deadline {
                    if deadline <= tokio::time::Instant::now() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// One pass over the current elements: read and delete the first that
    /// survives the delete race.
    async fn take_first_element(&self, elements: &str) -> Result<Option<String>> {
        let ops = self.ops()?;
        let watch = WatchContext::CachedObject(ChangeKind::QueueChildChange);
        // Fixed-width suffixes under a constant prefix make the sorted
        // listing the arrival order.
        let children = ops.adapter().get_children(elements, Some(watch)).await?;
        for child in children {
            let Some((data, _)) = ops.adapter().get_data(&child, None).await? else {
                continue;
            };
            if ops.adapter().delete(&child, false, -1).await? {
                trace!(queue = %self.key(), element = %child, "queue element taken");
                return Ok(Some(data));
            }
            // Another taker won the race; try the next element.
        }
        Ok(None)
    }

    pub async fn queue_size(&self) -> Result<usize> {
        self.throw_if_removed()?;
        self.check_queue()?;
        let ops = self.ops()?;
        Ok(ops
            .adapter()
            .get_children(&self.elements_path(), None)
            .await?
            .len())
    }

    pub async fn queue_empty(&self) -> Result<bool> {
        Ok(self.queue_size().await? == 0)
    }
}
