//! Periodic health checking bound to a node.
//!
//! Registration creates the node's ephemeral `_connected` marker and starts
//! a dedicated worker.  Each round runs the user checker under its allowed
//! deadline, publishes the outcome into the node's client-state znodes and
//! current-state document, then sleeps for the healthy or unhealthy
//! cadence, whichever the last report selects.  Unregistration signals the
//! worker, joins it, and deletes the marker.

use {
    crate::{
        config::HealthCheckerConfig,
        error::{Error, Result},
        ids, key,
        key::NotifyableKind,
        notifyable::Notifyable,
        repository::{CreateMode, RepositoryAdapter},
    },
    async_trait::async_trait,
    std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    },
    tokio::sync::Notify,
    tracing::{debug, error, warn},
};

pub const HEALTHY: &str = "healthy";
pub const UNHEALTHY: &str = "unhealthy";

/// Current-state document keys mirroring the client-state znodes.
pub const CLIENT_STATE_KEY: &str = "clientState";
pub const CLIENT_STATE_DESC_KEY: &str = "clientStateDesc";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub state: HealthState,
    pub description: String,
}

impl HealthReport {
    pub fn healthy(description: impl Into<String>) -> Self {
        Self {
            state: HealthState::Healthy,
            description: description.into(),
        }
    }

    pub fn unhealthy(description: impl Into<String>) -> Self {
        Self {
            state: HealthState::Unhealthy,
            description: description.into(),
        }
    }
}

///
/// User-supplied health probe.  A failed or overrunning check is reported
/// as unhealthy with the failure text as the description.
///
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check_health(&self) -> Result<HealthReport>;
}

struct HealthStop {
    terminate: AtomicBool,
    cond: Notify,
}

pub(crate) struct HealthRegistration {
    stop: Arc<HealthStop>,
    worker: tokio::task::JoinHandle<()>,
}

impl Notifyable {
    fn check_node(&self) -> Result<()> {
        if self.kind() != NotifyableKind::Node {
            return Err(Error::InvalidMethod(format!("{} is not a node", self.key())));
        }
        Ok(())
    }

    pub fn is_healthy(&self) -> bool {
        self.get_client_state() == HEALTHY
    }

    ///
    /// Creates this node's `_connected` marker and starts the health
    /// worker.  Fails with `AlreadyConnected` when another process (or a
    /// previous registration) holds the marker.
    ///
    pub async fn register_health_checker(
        &self,
        checker: Arc<dyn HealthChecker>,
        config: HealthCheckerConfig,
    ) -> Result<()> {
        self.check_node()?;
        self.throw_if_removed()?;
        let ops = self.ops()?;
        let connected_path = key::internal_znode(self.key(), key::CONNECTED);

        let created = ops
            .adapter()
            .create(
                &connected_path,
                &ids::hostname_pid_tid(),
                CreateMode::Ephemeral,
                false,
            )
            .await?;
        if created.is_none() {
            return Err(Error::AlreadyConnected(format!(
                "{} already has a connection marker",
                self.key()
            )));
        }

        // Marker first, validations second, marker removed on failure.
        let validated = if config.msecs_per_check_if_healthy <= 0
            || config.msecs_per_check_if_unhealthy <= 0
            || config.msecs_allowed_per_health_check <= 0
        {
            Err(Error::InvalidArguments(
                "health check cadences must all be positive".to_string(),
            ))
        } else {
            Ok(())
        };
        if let Err(e) = validated {
            let _ = ops.adapter().delete(&connected_path, false, -1).await;
            return Err(e);
        }

        let mut registration = self.health.lock().await;
        if registration.is_some() {
            let _ = ops.adapter().delete(&connected_path, false, -1).await;
            return Err(Error::InvalidMethod(format!(
                "{} already has a registered health checker",
                self.key()
            )));
        }

        // The worker needs an owned handle; the interning map holds it.
        let Some(node) = ops.lookup_notifyable(self.key()) else {
            let _ = ops.adapter().delete(&connected_path, false, -1).await;
            return Err(Error::InconsistentInternalState(format!(
                "{} is not interned in its own factory",
                self.key()
            )));
        };

        let stop = Arc::new(HealthStop {
            terminate: AtomicBool::new(false),
            cond: Notify::new(),
        });
        let worker = tokio::spawn(run_health_checks(node, checker, config, stop.clone()));
        *registration = Some(HealthRegistration { stop, worker });
        Ok(())
    }

    ///
    /// Stops the health worker, joins it, and removes the `_connected`
    /// marker.
    ///
    pub async fn unregister_health_checker(&self) -> Result<()> {
        self.check_node()?;
        let registration = {
            let mut guard = self.health.lock().await;
            guard.take()
        };
        let Some(registration) = registration else {
            return Err(Error::InvalidMethod(format!(
                "{} has no registered health checker",
                self.key()
            )));
        };

        registration.stop.terminate.store(true, Ordering::SeqCst);
        registration.stop.cond.notify_waiters();
        if let Err(e) = registration.worker.await {
            error!(key = %self.key(), "health worker ended abnormally: {e}");
        }

        let ops = self.ops()?;
        let connected_path = key::internal_znode(self.key(), key::CONNECTED);
        ops.adapter().delete(&connected_path, false, -1).await?;
        Ok(())
    }
}

async fn run_health_checks(
    node: Arc<Notifyable>,
    checker: Arc<dyn HealthChecker>,
    config: HealthCheckerConfig,
    stop: Arc<HealthStop>,
) {
    debug!(key = %node.key(), "health worker started");
    let allowed = Duration::from_millis(config.msecs_allowed_per_health_check as u64);

    while !stop.terminate.load(Ordering::SeqCst) {
        let report = match tokio::time::timeout(allowed, checker.check_health()).await {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => HealthReport::unhealthy(e.to_string()),
            Err(_) => HealthReport::unhealthy(format!(
                "health check exceeded {} msecs",
                config.msecs_allowed_per_health_check
            )),
        };

        if let Err(e) = publish_report(&node, &report).await {
            warn!(key = %node.key(), "failed to publish health report: {e}");
        }

        let cadence = match report.state {
            HealthState::Healthy => config.msecs_per_check_if_healthy,
            HealthState::Unhealthy => config.msecs_per_check_if_unhealthy,
        };

        let notified = stop.cond.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if stop.terminate.load(Ordering::SeqCst) {
            break;
        }
        let _ = tokio::time::timeout(Duration::from_millis(cadence as u64), notified).await;
    }
    debug!(key = %node.key(), "health worker stopped");
}

async fn publish_report(node: &Arc<Notifyable>, report: &HealthReport) -> Result<()> {
    let ops = node.ops()?;
    let value = match report.state {
        HealthState::Healthy => HEALTHY,
        HealthState::Unhealthy => UNHEALTHY,
    };

    let state_path = key::internal_znode(node.key(), key::CLIENT_STATE);
    ensure_set(ops.adapter(), &state_path, value).await?;
    let desc_path = key::internal_znode(node.key(), key::CLIENT_STATE_DESC);
    ensure_set(ops.adapter(), &desc_path, &report.description).await?;

    // Mirror into the current-state document for state readers.
    let current_state = node.cached_current_state();
    current_state.set(CLIENT_STATE_KEY, serde_json::Value::from(value));
    current_state.set(
        CLIENT_STATE_DESC_KEY,
        serde_json::Value::from(report.description.clone()),
    );
    current_state.publish(true).await?;
    Ok(())
}

/// Write that creates the znode on first use.
async fn ensure_set(adapter: &Arc<RepositoryAdapter>, path: &str, value: &str) -> Result<()> {
    match adapter.set_data(path, value, -1).await {
        Ok(_) => Ok(()),
        Err(Error::NoNode(_)) => {
            let _ = adapter.create(path, value, CreateMode::Persistent, true).await?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}
