use serde::{Deserialize, Serialize};

///
/// Connection settings for the repository adapter.
///
/// `auto_reconnect` controls both reconnection after session expiry and the
/// adapter's retry budget: with it on, transient repository errors are
/// retried twice; with it off they fail immediately.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub hosts: String,
    pub auto_reconnect: bool,
    pub connect_timeout_msecs: i64,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            hosts: "local".to_string(),
            auto_reconnect: true,
            connect_timeout_msecs: 30_000,
        }
    }
}

///
/// Settings for a server-side RPC manager.
///
/// `completed_queue_max_size` bounds the fallback queue of finished results:
/// `-1` means unbounded, `0` means results go only to caller-supplied
/// response queues.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcManagerConfig {
    pub completed_queue_max_size: i32,
}

impl Default for RpcManagerConfig {
    fn default() -> Self {
        Self {
            completed_queue_max_size: -1,
        }
    }
}

/// Cadences for a registered health checker.  All three must be positive.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthCheckerConfig {
    pub msecs_per_check_if_healthy: i64,
    pub msecs_per_check_if_unhealthy: i64,
    pub msecs_allowed_per_health_check: i64,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self {
            msecs_per_check_if_healthy: 5_000,
            msecs_per_check_if_unhealthy: 1_000,
            msecs_allowed_per_health_check: 30_000,
        }
    }
}
