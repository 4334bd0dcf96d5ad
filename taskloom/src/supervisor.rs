//! Starts the worker process, restarts it when it exits and stops it on request.
//!
//! The worker process is connected through its stdin and stdout, which carry a
//! [`ControlChannel`]. Its stderr is inherited so its logs end up next to the host's.
use std::{
    ffi::OsString,
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::TimeDelta;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    process::{Child, Command},
    sync::watch,
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    backoff::{retry_policy, RetryPolicy, Strategy},
    channel::{
        queue::{QueueClient, SHUTDOWN},
        ActionRouter, ChannelConfig, ChannelError, ControlChannel,
    },
};

/// Configuration of a [`ProcessSupervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub envs: Vec<(OsString, OsString)>,
    /// Consecutive restarts allowed before giving up.
    pub max_restarts: u32,
    /// Delay before each restart, by position in the current streak of restarts.
    pub restart_backoff: RetryPolicy,
    /// A run lasting at least this long resets the streak of restarts.
    pub min_uptime: Duration,
    /// How long to wait for the process to exit before killing it.
    pub shutdown_timeout: Duration,
    pub channel: ChannelConfig,
}

impl SupervisorConfig {
    pub const DEFAULT_MAX_RESTARTS: u32 = 5;
    pub const DEFAULT_RESTART_BACKOFF: RetryPolicy =
        retry_policy(TimeDelta::seconds(1), TimeDelta::seconds(30));
    pub const DEFAULT_MIN_UPTIME: Duration = Duration::from_secs(30);
    pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            max_restarts: Self::DEFAULT_MAX_RESTARTS,
            restart_backoff: Self::DEFAULT_RESTART_BACKOFF,
            min_uptime: Self::DEFAULT_MIN_UPTIME,
            shutdown_timeout: Self::DEFAULT_SHUTDOWN_TIMEOUT,
            channel: ChannelConfig::new(),
        }
    }

    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn with_max_restarts(self, max_restarts: u32) -> Self {
        Self {
            max_restarts,
            ..self
        }
    }

    pub fn with_restart_backoff(self, restart_backoff: RetryPolicy) -> Self {
        Self {
            restart_backoff,
            ..self
        }
    }

    pub fn with_min_uptime(self, min_uptime: Duration) -> Self {
        Self { min_uptime, ..self }
    }

    pub fn with_shutdown_timeout(self, shutdown_timeout: Duration) -> Self {
        Self {
            shutdown_timeout,
            ..self
        }
    }

    pub fn with_channel(self, channel: ChannelConfig) -> Self {
        Self { channel, ..self }
    }
}

/// The observable state of the supervised process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorStatus {
    pub running: bool,
    pub pid: Option<u32>,
    /// Restarts since the supervisor was started.
    pub restart_count: u32,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to spawn the worker process")]
    Spawn(#[source] std::io::Error),
    #[error("The worker process is not running")]
    NotRunning,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("Failed to stop the worker process")]
    ShutdownFailed(#[source] std::io::Error),
    #[error("The worker process was restarted {0} times in a row, giving up")]
    RestartLimit(u32),
}

struct Shared {
    config: SupervisorConfig,
    router: ActionRouter,
    status: watch::Sender<SupervisorStatus>,
    channel: Mutex<Option<ControlChannel>>,
    /// Cancelled when a shutdown is requested.
    stopping: CancellationToken,
    /// Cancelled once supervision has ended.
    finished: CancellationToken,
}

/// Supervises a worker process.
///
/// Dropping the supervisor stops the process in the background, use
/// [`ProcessSupervisor::shutdown`] to wait for it.
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
    monitor: Mutex<Option<JoinHandle<Result<(), SupervisorError>>>>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor").finish_non_exhaustive()
    }
}

impl ProcessSupervisor {
    /// Spawn the worker process and serve `router` to it.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(config: SupervisorConfig, router: ActionRouter) -> Result<Self, SupervisorError> {
        let (status, _) = watch::channel(SupervisorStatus::default());
        let shared = Arc::new(Shared {
            config,
            router,
            status,
            channel: Mutex::new(None),
            stopping: CancellationToken::new(),
            finished: CancellationToken::new(),
        });
        let child = shared.launch()?;
        let monitor = tokio::spawn(shared.clone().supervise(child));

        Ok(Self {
            shared,
            monitor: Mutex::new(Some(monitor)),
        })
    }

    pub fn status(&self) -> SupervisorStatus {
        *self.shared.status.borrow()
    }

    /// Follow status changes.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorStatus> {
        self.shared.status.subscribe()
    }

    /// The channel to the current worker process.
    ///
    /// A restarted process gets a new channel, the previous one is closed.
    pub fn channel(&self) -> Result<ControlChannel, SupervisorError> {
        self.shared
            .channel
            .lock()
            .ok()
            .and_then(|channel| channel.clone())
            .ok_or(SupervisorError::NotRunning)
    }

    /// Call an action served by the worker process.
    pub async fn call<T, U>(&self, action: &str, payload: T) -> Result<U, SupervisorError>
    where
        T: Serialize,
        U: DeserializeOwned,
    {
        Ok(self.channel()?.call(action, payload).await?)
    }

    /// A client for the queue commands of the current worker process.
    pub fn queue_client(&self) -> Result<QueueClient, SupervisorError> {
        self.channel().map(QueueClient::new)
    }

    /// Resolves once supervision has ended, after a shutdown or after giving up on restarts.
    pub async fn stopped(&self) {
        self.shared.finished.cancelled().await
    }

    /// Ask the worker process to stop, killing it if it does not exit in time.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        self.shared.stopping.cancel();
        let monitor = self.monitor.lock().ok().and_then(|mut monitor| monitor.take());
        match monitor {
            Some(monitor) => monitor
                .await
                .map_err(|error| SupervisorError::ShutdownFailed(std::io::Error::other(error)))?,
            None => Ok(()),
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.shared.stopping.cancel();
    }
}

impl Shared {
    fn launch(&self) -> Result<Child, SupervisorError> {
        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .envs(self.config.envs.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(SupervisorError::Spawn)?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(SupervisorError::Spawn(std::io::Error::other(
                "worker process stdio is not piped",
            )));
        };
        let channel = ControlChannel::spawn(stdout, stdin, self.router.clone(), self.config.channel);
        if let Ok(mut current) = self.channel.lock() {
            *current = Some(channel);
        }

        let pid = child.id();
        self.status.send_modify(|status| {
            status.running = true;
            status.pid = pid;
        });
        tracing::info!(?pid, "Worker process started");
        Ok(child)
    }

    fn detach(&self) -> Option<ControlChannel> {
        self.status.send_modify(|status| {
            status.running = false;
            status.pid = None;
        });
        self.channel.lock().ok().and_then(|mut channel| channel.take())
    }

    #[instrument(skip_all, fields(program = ?self.config.program))]
    async fn supervise(self: Arc<Self>, mut child: Child) -> Result<(), SupervisorError> {
        let mut streak = 0;
        let result = loop {
            let started = Instant::now();
            let exit = tokio::select! {
                biased;
                _ = self.stopping.cancelled() => None,
                exit = child.wait() => Some(exit),
            };
            let Some(exit) = exit else {
                break self.stop(child).await;
            };
            if let Some(channel) = self.detach() {
                channel.close();
            }
            match exit {
                Ok(status) => tracing::warn!(%status, "Worker process exited: {status}"),
                Err(error) => tracing::warn!(?error, "Failed to wait for worker process: {error}"),
            }
            if started.elapsed() >= self.config.min_uptime {
                streak = 0;
            }

            child = match self.restart(&mut streak).await {
                Some(child) => child,
                None => break Ok(()),
            };
        };
        self.finished.cancel();
        result
    }

    /// Relaunch the process after a backoff, `None` when giving up or stopping.
    async fn restart(&self, streak: &mut u32) -> Option<Child> {
        loop {
            if *streak >= self.config.max_restarts {
                let error = SupervisorError::RestartLimit(*streak);
                tracing::error!(?error, "{error}");
                return None;
            }
            *streak += 1;
            let delay = self
                .config
                .restart_backoff
                .backoff(*streak)
                .to_std()
                .unwrap_or_default();
            tracing::info!(attempt = *streak, ?delay, "Restarting worker process in {delay:?}");
            tokio::select! {
                biased;
                _ = self.stopping.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            self.status.send_modify(|status| status.restart_count += 1);
            match self.launch() {
                Ok(child) => return Some(child),
                Err(error) => {
                    tracing::error!(?error, "Failed to restart worker process: {error}")
                }
            }
        }
    }

    async fn stop(&self, mut child: Child) -> Result<(), SupervisorError> {
        if let Some(channel) = self.detach() {
            let _ = channel
                .notify(SHUTDOWN, ())
                .inspect_err(|error| tracing::debug!(?error, "Failed to send shutdown: {error}"));
            channel.close();
        }

        match tokio::time::timeout(self.config.shutdown_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(%status, "Worker process stopped: {status}");
                Ok(())
            }
            Ok(Err(error)) => Err(SupervisorError::ShutdownFailed(error)),
            Err(_) => {
                tracing::warn!(
                    timeout = ?self.config.shutdown_timeout,
                    "Worker process did not stop in time, killing it"
                );
                child.kill().await.map_err(SupervisorError::ShutdownFailed)
            }
        }
    }
}
