use crate::error::PluginError;
use crate::plugin::session::Session;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// What the monitor watches and repairs.
#[async_trait]
pub trait Supervised: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn current_session(&self) -> Option<Arc<dyn Session>>;

    /// Replace the session, respawning the process if needed.
    ///
    /// Must tolerate being dropped part way: the monitor abandons it on stop.
    async fn reconnect(&self) -> Result<(), PluginError>;

    /// Called once when a reconnect attempt fails; the monitor stops after.
    async fn reconnect_failed(&self, error: PluginError);
}

#[derive(Debug, Clone, Copy)]
pub struct HealthCheckSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Running,
    Stopped,
}

struct Inner {
    state: MonitorState,
    task: Option<JoinHandle<()>>,
}

/// Periodic liveness check for one plugin.
pub struct HealthMonitor {
    settings: HealthCheckSettings,
    shutdown: CancellationToken,
    inner: Mutex<Inner>,
}

impl HealthMonitor {
    pub fn new(settings: HealthCheckSettings) -> Self {
        Self {
            settings,
            shutdown: CancellationToken::new(),
            inner: Mutex::new(Inner {
                state: MonitorState::Idle,
                task: None,
            }),
        }
    }

    pub fn state(&self) -> MonitorState {
        match self.inner.lock() {
            Ok(inner) => inner.state,
            Err(poisoned) => poisoned.into_inner().state,
        }
    }

    /// Start the check loop. Only the first call from `Idle` has an effect.
    pub fn start(&self, target: Arc<dyn Supervised>) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.state != MonitorState::Idle {
            return false;
        }

        inner.state = MonitorState::Running;
        inner.task = Some(tokio::spawn(run(
            target,
            self.settings,
            self.shutdown.clone(),
        )));
        true
    }

    /// Stop the loop and wait for it to finish its current step.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
            inner.state = MonitorState::Stopped;
            inner.task.take()
        };
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run(target: Arc<dyn Supervised>, settings: HealthCheckSettings, shutdown: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + settings.interval, settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::debug!(
        plugin = %target.name(),
        interval_ms = settings.interval.as_millis() as u64,
        "Health monitor started"
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let healthy = tokio::select! {
            _ = shutdown.cancelled() => break,
            healthy = check(target.as_ref(), settings.timeout) => healthy,
        };
        if healthy {
            tracing::trace!(plugin = %target.name(), "Health check passed");
            continue;
        }

        if shutdown.is_cancelled() {
            break;
        }
        tracing::warn!(plugin = %target.name(), "Health check failed, reconnecting");
        // A relaunch can take up to the start timeout; shutdown must not wait for it.
        let reconnected = tokio::select! {
            _ = shutdown.cancelled() => break,
            reconnected = target.reconnect() => reconnected,
        };
        match reconnected {
            Ok(()) => {
                tracing::info!(plugin = %target.name(), "Plugin reconnected");
            }
            Err(_) if shutdown.is_cancelled() => break,
            Err(e) => {
                tracing::error!(plugin = %target.name(), error = %e, "Plugin reconnect failed");
                target.reconnect_failed(e).await;
                break;
            }
        }
    }

    tracing::debug!(plugin = %target.name(), "Health monitor stopped");
}

async fn check(target: &dyn Supervised, limit: Duration) -> bool {
    let Some(session) = target.current_session().await else {
        return false;
    };
    match timeout(limit, session.ping()).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::debug!(plugin = %target.name(), error = %e, "Ping failed");
            false
        }
        Err(_) => {
            tracing::debug!(plugin = %target.name(), "Ping timed out");
            false
        }
    }
}

#[cfg(test)]
#[path = "health_tests.rs"]
mod health_tests;
