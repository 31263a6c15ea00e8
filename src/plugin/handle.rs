use crate::driver::*;
use crate::error::{PluginError, TransportError};
use crate::plugin::health::{HealthCheckSettings, HealthMonitor, Supervised};
use crate::plugin::pool::{SessionProvider, WorkerPool};
use crate::plugin::process::PluginProcess;
use crate::plugin::session::{Launcher, ProcessLauncher, Session};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock};
use tokio_util::sync::CancellationToken;

/// What to do when the health monitor cannot bring a plugin back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectPolicy {
    /// Log and terminate the host process with exit code 1, or cancel
    /// `PluginOptions::exit_signal` when one is set.
    #[default]
    Exit,
    /// Mark the plugin failed; every later call returns an error.
    Fail,
}

#[derive(Debug, Clone)]
pub struct PluginOptions {
    pub pool_size: usize,
    pub health_check: Option<HealthCheckSettings>,
    pub drain_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub start_timeout: Duration,
    pub reconnect_policy: ReconnectPolicy,
    /// Cancelled instead of exiting under `ReconnectPolicy::Exit`, so the
    /// host can tear down every plugin before it exits.
    pub exit_signal: Option<CancellationToken>,
}

impl Default for PluginOptions {
    fn default() -> Self {
        Self {
            pool_size: 16,
            health_check: Some(HealthCheckSettings::default()),
            drain_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(5),
            start_timeout: Duration::from_secs(30),
            reconnect_policy: ReconnectPolicy::Exit,
            exit_signal: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    NotStarted,
    Running,
    Closed,
    Failed,
}

struct State {
    lifecycle: Lifecycle,
    secrets: Secrets,
    session: Option<Arc<dyn Session>>,
    process: Option<PluginProcess>,
}

struct Shared {
    name: String,
    executable: PathBuf,
    options: PluginOptions,
    launcher: Arc<dyn Launcher>,
    state: RwLock<State>,
}

/// A driver served by an external plugin process.
///
/// Nothing is spawned until the first routed call. That call launches the
/// process, builds the worker pool and starts the health monitor; callers
/// arriving meanwhile wait for it to finish.
pub struct Plugin {
    shared: Arc<Shared>,
    pool: OnceCell<WorkerPool>,
    monitor: Option<HealthMonitor>,
}

impl Plugin {
    pub fn new(executable: impl Into<PathBuf>, options: PluginOptions) -> Self {
        let launcher = ProcessLauncher {
            start_timeout: options.start_timeout,
        };
        Self::with_launcher(executable, options, Arc::new(launcher))
    }

    pub fn with_launcher(
        executable: impl Into<PathBuf>,
        options: PluginOptions,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        let executable = executable.into();
        let name = executable
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| executable.display().to_string());
        let monitor = options.health_check.map(HealthMonitor::new);

        Self {
            shared: Arc::new(Shared {
                name,
                executable,
                options,
                launcher,
                state: RwLock::new(State {
                    lifecycle: Lifecycle::NotStarted,
                    secrets: Secrets::new(),
                    session: None,
                    process: None,
                }),
            }),
            pool: OnceCell::new(),
            monitor,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn executable(&self) -> &Path {
        &self.shared.executable
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        self.shared.state.read().await.lifecycle
    }

    pub async fn secrets(&self) -> Secrets {
        self.shared.state.read().await.secrets.clone()
    }

    /// Merge `secrets` into the map passed to the process at spawn.
    ///
    /// Rejected once a session exists; the stored map is left untouched.
    pub async fn update_secrets(&self, secrets: Secrets) -> Result<(), PluginError> {
        let mut state = self.shared.state.write().await;
        if state.lifecycle != Lifecycle::NotStarted || state.session.is_some() {
            return Err(PluginError::SecretsLocked);
        }
        state.secrets.extend(secrets);
        Ok(())
    }

    /// Launch the plugin if needed.
    pub async fn start(&self) -> Result<&WorkerPool, PluginError> {
        self.shared.ensure_usable().await?;
        self.pool
            .get_or_try_init(|| async {
                let mut state = self.shared.state.write().await;
                match state.lifecycle {
                    Lifecycle::NotStarted => {}
                    _ => return Err(self.shared.unusable(state.lifecycle)),
                }

                let connection = self
                    .shared
                    .launcher
                    .launch(&self.shared.executable, &state.secrets)
                    .await?;
                state.session = Some(connection.session);
                state.process = connection.process;
                state.lifecycle = Lifecycle::Running;

                let pool = WorkerPool::new(
                    self.shared.name.clone(),
                    self.shared.options.pool_size,
                    self.shared.clone(),
                );
                if let Some(monitor) = &self.monitor {
                    monitor.start(self.shared.clone());
                }
                tracing::info!(
                    plugin = %self.shared.name,
                    pool_size = pool.size(),
                    "Plugin started"
                );
                Ok::<_, PluginError>(pool)
            })
            .await
    }

    /// Liveness check against the current session, starting the plugin
    /// first if needed.
    pub async fn ping(&self) -> Result<(), PluginError> {
        self.start().await?;
        let session = self.shared.session().await?;
        tokio::time::timeout(self.shared.options.disconnect_timeout, session.ping())
            .await
            .map_err(|_| TransportError::Timeout)??;
        Ok(())
    }

    async fn dispatch(&self, request: Request) -> Result<Response, PluginError> {
        let pool = self.start().await?;
        pool.dispatch(request).await
    }

    async fn call<O>(&self, request: Request) -> O
    where
        O: WithError + TryFrom<Response, Error = Response>,
    {
        let method = request.method();
        match self.dispatch(request).await {
            Ok(response) => O::try_from(response).unwrap_or_else(|other| {
                O::with_error(DriverError::new(format!(
                    "unexpected {} response to {method}",
                    other.method()
                )))
            }),
            Err(e) => O::with_error(e.into()),
        }
    }

    /// Stop the monitor, drain the pool and terminate the process.
    ///
    /// The handle rejects every call afterwards. Safe to call more than once.
    pub async fn close(&self) {
        {
            let mut state = self.shared.state.write().await;
            if state.lifecycle == Lifecycle::Closed {
                return;
            }
            state.lifecycle = Lifecycle::Closed;
        }

        if let Some(monitor) = &self.monitor {
            monitor.stop().await;
        }
        // Waits out a start in flight so its pool is drained too.
        let pool = self
            .pool
            .get_or_try_init(|| async { Err(self.shared.unusable(Lifecycle::Closed)) })
            .await;
        if let Ok(pool) = pool {
            pool.drain(self.shared.options.drain_timeout).await;
        }

        let (session, process) = {
            let mut state = self.shared.state.write().await;
            (state.session.take(), state.process.take())
        };
        terminate(
            &self.shared.name,
            session,
            process,
            self.shared.options.disconnect_timeout,
        )
        .await;
        tracing::info!(plugin = %self.shared.name, "Plugin closed");
    }

    /// Kill the process tree without waiting for calls or the plugin.
    ///
    /// For use after `close` has run out of time. Gives up on the state lock
    /// after `LOCK_WAIT`, leaving the tree to `kill_on_drop`.
    pub async fn kill(&self) {
        let Ok(mut state) = tokio::time::timeout(LOCK_WAIT, self.shared.state.write()).await else {
            tracing::warn!(plugin = %self.shared.name, "Plugin state is locked, cannot kill");
            return;
        };
        state.lifecycle = Lifecycle::Closed;
        state.session = None;
        let process = state.process.take();
        drop(state);

        if let Some(monitor) = &self.monitor {
            // The loop is cancelled either way; only the join is bounded.
            let _ = tokio::time::timeout(LOCK_WAIT, monitor.stop()).await;
        }
        if let Some(pool) = self.pool.get() {
            pool.drain(Duration::ZERO).await;
        }
        if let Some(mut process) = process {
            tracing::warn!(plugin = %self.shared.name, pid = process.pid(), "Killing plugin process tree");
            process.kill_tree().await;
        }
    }
}

const LOCK_WAIT: Duration = Duration::from_millis(500);

impl Shared {
    async fn fail(&self) {
        let (session, process) = {
            let mut state = self.state.write().await;
            if state.lifecycle == Lifecycle::Running {
                state.lifecycle = Lifecycle::Failed;
            }
            (state.session.take(), state.process.take())
        };
        terminate(&self.name, session, process, self.options.disconnect_timeout).await;
    }

    async fn ensure_usable(&self) -> Result<(), PluginError> {
        match self.state.read().await.lifecycle {
            Lifecycle::NotStarted | Lifecycle::Running => Ok(()),
            other => Err(self.unusable(other)),
        }
    }

    fn unusable(&self, lifecycle: Lifecycle) -> PluginError {
        match lifecycle {
            Lifecycle::Failed => PluginError::Failed(self.name.clone()),
            _ => PluginError::Closed(self.name.clone()),
        }
    }
}

#[async_trait]
impl SessionProvider for Shared {
    async fn session(&self) -> Result<Arc<dyn Session>, PluginError> {
        self.state
            .read()
            .await
            .session
            .clone()
            .ok_or_else(|| PluginError::SessionUnavailable(self.name.clone()))
    }
}

#[async_trait]
impl Supervised for Shared {
    fn name(&self) -> &str {
        &self.name
    }

    async fn current_session(&self) -> Option<Arc<dyn Session>> {
        self.state.read().await.session.clone()
    }

    async fn reconnect(&self) -> Result<(), PluginError> {
        let (session, process, secrets) = {
            let mut state = self.state.write().await;
            if state.lifecycle != Lifecycle::Running {
                return Err(self.unusable(state.lifecycle));
            }
            (state.session.take(), state.process.take(), state.secrets.clone())
        };
        terminate(&self.name, session, process, self.options.disconnect_timeout).await;

        // Launched unlocked so close never queues behind a slow start.
        let connection = self.launcher.launch(&self.executable, &secrets).await?;

        let mut state = self.state.write().await;
        if state.lifecycle != Lifecycle::Running {
            let lifecycle = state.lifecycle;
            drop(state);
            terminate(
                &self.name,
                Some(connection.session),
                connection.process,
                self.options.disconnect_timeout,
            )
            .await;
            return Err(self.unusable(lifecycle));
        }
        state.session = Some(connection.session);
        state.process = connection.process;
        Ok(())
    }

    async fn reconnect_failed(&self, error: PluginError) {
        // A close racing the monitor is not a failure.
        if self.state.read().await.lifecycle != Lifecycle::Running {
            return;
        }
        match (self.options.reconnect_policy, &self.options.exit_signal) {
            (ReconnectPolicy::Exit, None) => {
                tracing::error!(
                    plugin = %self.name,
                    error = %error,
                    "Plugin could not be restarted, terminating"
                );
                std::process::exit(1);
            }
            (ReconnectPolicy::Exit, Some(exit)) => {
                tracing::error!(
                    plugin = %self.name,
                    error = %error,
                    "Plugin could not be restarted, requesting host exit"
                );
                self.fail().await;
                exit.cancel();
            }
            (ReconnectPolicy::Fail, _) => {
                tracing::error!(
                    plugin = %self.name,
                    error = %error,
                    "Plugin could not be restarted, marking it failed"
                );
                self.fail().await;
            }
        }
    }
}

/// Disconnect and kill whatever is left of a connection.
async fn terminate(
    name: &str,
    session: Option<Arc<dyn Session>>,
    process: Option<PluginProcess>,
    grace: Duration,
) {
    match (process, session) {
        (Some(process), session) => process.shutdown(session.as_deref(), grace).await,
        (None, Some(session)) => match tokio::time::timeout(grace, session.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(plugin = %name, error = %e, "Session close failed"),
            Err(_) => tracing::warn!(plugin = %name, "Session close timed out"),
        },
        (None, None) => {}
    }
}

#[async_trait]
impl Driver for Plugin {
    async fn authorize(&self, input: AuthorizeInput) -> AuthorizeOutput {
        self.call(Request::Authorize(input)).await
    }

    async fn set_secrets(&self, input: SetSecretsInput) -> SetSecretsOutput {
        match self.update_secrets(input.secrets).await {
            Ok(()) => SetSecretsOutput::default(),
            Err(e) => SetSecretsOutput::with_error(e.into()),
        }
    }

    async fn field_resolve(&self, input: FieldResolveInput) -> FieldResolveOutput {
        self.call(Request::FieldResolve(input)).await
    }

    async fn interface_resolve_type(
        &self,
        input: InterfaceResolveTypeInput,
    ) -> InterfaceResolveTypeOutput {
        self.call(Request::InterfaceResolveType(input)).await
    }

    async fn scalar_parse(&self, input: ScalarParseInput) -> ScalarParseOutput {
        self.call(Request::ScalarParse(input)).await
    }

    async fn scalar_serialize(&self, input: ScalarSerializeInput) -> ScalarSerializeOutput {
        self.call(Request::ScalarSerialize(input)).await
    }

    async fn union_resolve_type(&self, input: UnionResolveTypeInput) -> UnionResolveTypeOutput {
        self.call(Request::UnionResolveType(input)).await
    }

    async fn stream(&self, input: StreamInput) -> StreamOutput {
        self.call(Request::Stream(input)).await
    }

    async fn subscription_connection(
        &self,
        input: SubscriptionConnectionInput,
    ) -> SubscriptionConnectionOutput {
        self.call(Request::SubscriptionConnection(input)).await
    }

    async fn subscription_listen(
        &self,
        input: SubscriptionListenInput,
    ) -> SubscriptionListenOutput {
        self.call(Request::SubscriptionListen(input)).await
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.shared.name)
            .field("executable", &self.shared.executable)
            .field("started", &self.pool.initialized())
            .finish()
    }
}

#[cfg(test)]
#[path = "handle_tests.rs"]
mod handle_tests;
