use {
    crate::ids,
    std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicBool, AtomicI64, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    },
    tokio::sync::{mpsc, Notify},
    tracing::{debug, trace},
};

pub type TimerId = i64;

/// Idle wait when the alarm queue is empty.
const IDLE_WAIT_MSECS: i64 = 100;

#[derive(Debug, Clone)]
pub struct TimerEvent<T> {
    pub id: TimerId,
    pub alarm_msecs: i64,
    pub payload: T,
}

struct Inner<T> {
    queue: Mutex<VecDeque<TimerEvent<T>>>,
    changed: Notify,
    next_id: AtomicI64,
    terminate: AtomicBool,
}

///
/// Delayed alarms: a dedicated worker pops events whose alarm time has
/// passed and delivers them on the receiver handed out at spawn time.
///
/// Alarms are expected to be few and short-lived, so cancellation is a
/// linear scan of the pending deque.
///
pub struct Timer<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Timer<T> {
    pub fn spawn() -> (Self, mpsc::UnboundedReceiver<TimerEvent<T>>) {
        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::new()),
            changed: Notify::new(),
            next_id: AtomicI64::new(0),
            terminate: AtomicBool::new(false),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let worker_inner = inner.clone();
        tokio::spawn(async move {
            debug!("timer worker started");
            Self::send_alarms(worker_inner, tx).await;
            debug!("timer worker stopped");
        });
        (Self { inner }, rx)
    }

    pub fn schedule_after(&self, msecs_from_now: i64, payload: T) -> TimerId {
        self.schedule_at(ids::current_time_msecs() + msecs_from_now, payload)
    }

    pub fn schedule_at(&self, alarm_msecs: i64, payload: T) -> TimerId {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut queue = self.inner.queue.lock().expect("timer queue poisoned");
            let pos = queue.partition_point(|ev| ev.alarm_msecs <= alarm_msecs);
            queue.insert(
                pos,
                TimerEvent {
                    id,
                    alarm_msecs,
                    payload,
                },
            );
        }
        self.inner.changed.notify_waiters();
        trace!(id, alarm_msecs, "alarm scheduled");
        id
    }

    /// Removes a pending alarm.  Returns false when it already fired or was
    /// never scheduled.
    pub fn cancel_alarm(&self, id: TimerId) -> bool {
        let mut queue = self.inner.queue.lock().expect("timer queue poisoned");
        match queue.iter().position(|ev| ev.id == id) {
            Some(pos) => {
                queue.remove(pos);
                true
            }
            None => false,
        }
    }

    async fn send_alarms(inner: Arc<Inner<T>>, tx: mpsc::UnboundedSender<TimerEvent<T>>) {
        loop {
            if inner.terminate.load(Ordering::SeqCst) {
                break;
            }

            // Register for wakeups before inspecting the queue so a schedule
            // that lands in between cannot be missed.
            let changed = inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let mut due = Vec::new();
            let wait_msecs = {
                let mut queue = inner.queue.lock().expect("timer queue poisoned");
                let now = ids::current_time_msecs();
                while queue
                    .front()
                    .map(|ev| ev.alarm_msecs <= now)
                    .unwrap_or(false)
                {
                    due.push(queue.pop_front().expect("checked front"));
                }
                match queue.front() {
                    Some(ev) => ev.alarm_msecs - now,
                    None => IDLE_WAIT_MSECS,
                }
            };

            for ev in due {
                trace!(id = ev.id, "alarm fired");
                if tx.send(ev).is_err() {
                    debug!("timer receiver dropped, stopping worker");
                    return;
                }
            }

            let _ = tokio::time::timeout(Duration::from_millis(wait_msecs.max(1) as u64), changed)
                .await;
        }
    }
}

impl<T> Drop for Timer<T> {
    fn drop(&mut self) {
        self.inner.terminate.store(true, Ordering::SeqCst);
        self.inner.changed.notify_waiters();
    }
}
