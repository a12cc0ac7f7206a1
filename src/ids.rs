use {
    chrono::{TimeZone, Utc},
    std::sync::atomic::{AtomicU64, Ordering},
};

/// Process-local discriminator appended when two runtimes share a pid (tests
/// spin several factories inside one process).
static LOCAL_DISCRIMINATOR: AtomicU64 = AtomicU64::new(0);

pub fn hostname() -> String {
    whoami::fallible::hostname().unwrap_or_else(|_| "unknown".into())
}

/// Caller identity in the `hostname:pid:tid` form used for lock bids, RPC
/// request ids, and status keys.
pub fn hostname_pid_tid() -> String {
    format!("{}:{}:{}", hostname(), std::process::id(), thread_discriminator())
}

fn thread_discriminator() -> u64 {
    // ThreadId has no stable numeric accessor; its Debug form carries one.
    let repr = format!("{:?}", std::thread::current().id());
    let digits: String = repr.chars().filter(|c| c.is_ascii_digit()).collect();
    digits
        .parse()
        .unwrap_or_else(|_| LOCAL_DISCRIMINATOR.fetch_add(1, Ordering::Relaxed))
}

pub fn current_time_msecs() -> i64 {
    Utc::now().timestamp_millis()
}

/// Human-readable rendering of an epoch-millisecond stamp, published next to
/// the raw number in RPC results and statuses.
pub fn msecs_time_string(msecs: i64) -> String {
    match Utc.timestamp_millis_opt(msecs).single() {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        None => format!("invalid msecs {msecs}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_has_three_separated_parts() {
        let id = hostname_pid_tid();
        assert_eq!(id.split(':').count(), 3, "unexpected identity {id}");
    }

    #[test]
    fn time_string_is_stable_for_known_msecs() {
        assert_eq!(msecs_time_string(0), "1970-01-01T00:00:00.000Z");
    }
}
