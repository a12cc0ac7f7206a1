use {
    crate::error::{Error, Result},
    dashmap::DashMap,
    std::sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc,
    },
    tokio::sync::Notify,
    tracing::trace,
};

struct Entry {
    refs: AtomicI64,
    predicate: AtomicBool,
    notify: Notify,
}

///
/// Keyed one-shot rendezvous: a waiter parks on a key until some other task
/// signals that key.  Waiters consume the predicate, signalers set it, so a
/// signal that lands before the wait starts is not lost.
///
/// Keys are reference counted.  `add_ref` must precede `wait_usecs`, and the
/// waiter drops its reference when done; the entry disappears at zero.
///
#[derive(Default)]
pub struct SignalMap {
    entries: DashMap<String, Arc<Entry>>,
}

impl SignalMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ref(&self, key: &str) {
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Entry {
                    refs: AtomicI64::new(0),
                    predicate: AtomicBool::new(false),
                    notify: Notify::new(),
                })
            })
            .clone();
        entry.refs.fetch_add(1, Ordering::SeqCst);
        trace!(key, "signal map ref added");
    }

    /// Sets the predicate and wakes any parked waiter.  Returns false when
    /// nobody holds a reference for the key.
    pub fn signal(&self, key: &str) -> bool {
        match self.entries.get(key) {
            Some(entry) => {
                entry.predicate.store(true, Ordering::SeqCst);
                entry.notify.notify_waiters();
                true
            }
            None => false,
        }
    }

    ///
    /// Parks until the key is signaled or the timeout elapses.
    ///
    /// `usecs < 0` waits forever, `0` polls the predicate once.  Returns
    /// whether the predicate was consumed.
    ///
    pub async fn wait_usecs(&self, key: &str, usecs: i64) -> Result<bool> {
        let entry = self
            .entries
            .get(key)
            .map(|e| e.clone())
            .ok_or_else(|| {
                Error::InconsistentInternalState(format!(
                    "wait on signal map key {key} without a reference"
                ))
            })?;

        let deadline = if usecs < 0 {
            None
        } else {
            Some(tokio::time::Instant::now() + std::time::Duration::from_micros(usecs as u64))
        };

        loop {
            let notified = entry.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking the predicate so a concurrent
            // signal cannot slip between the check and the await.
            notified.as_mut().enable();

            if entry.predicate.swap(false, Ordering::SeqCst) {
                return Ok(true);
            }

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(entry.predicate.swap(false, Ordering::SeqCst));
                    }
                }
            }
        }
    }

    pub fn remove_ref(&self, key: &str) -> Result<()> {
        let remaining = match self.entries.get(key) {
            Some(entry) => entry.refs.fetch_sub(1, Ordering::SeqCst) - 1,
            None => {
                return Err(Error::InconsistentInternalState(format!(
                    "removed a reference for unknown signal map key {key}"
                )))
            }
        };
        if remaining <= 0 {
            self.entries
                .remove_if(key, |_, entry| entry.refs.load(Ordering::SeqCst) <= 0);
        }
        trace!(key, remaining, "signal map ref removed");
        Ok(())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}
