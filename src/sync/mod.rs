///
/// Refcounted keyed rendezvous used for lock predecessor waits, queue
/// element waits, RPC response waits, and the synchronize barrier.
///
pub mod signal_map;

///
/// Delayed alarms delivered to a worker-owned channel.
///
pub mod timer;

pub use signal_map::SignalMap;
pub use timer::{Timer, TimerEvent, TimerId};
