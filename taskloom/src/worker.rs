//! The worker loop: poll, claim, execute, persist.
use std::{sync::Arc, time::Duration};

use chrono::TimeDelta;
use tokio_util::sync::CancellationToken;

use crate::{
    executor::JobHandler,
    job::runner::JobRunner,
    queue::{QueueError, QueueService},
    store::JobStore,
};

/// Configuration of a [`WorkerLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// How long to sleep when there is no job to run.
    pub poll_interval: Duration,
    /// When set, jobs active for longer than this are treated as failed attempts.
    pub stalled_job_timeout: Option<TimeDelta>,
}

impl WorkerConfig {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

    pub const fn new() -> Self {
        Self {
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            stalled_job_timeout: None,
        }
    }

    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub const fn with_stalled_job_timeout(mut self, stalled_job_timeout: TimeDelta) -> Self {
        self.stalled_job_timeout = Some(stalled_job_timeout);
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the jobs of one partition, one at a time.
pub struct WorkerLoop<S> {
    queue: QueueService<S>,
    name: String,
    runner: JobRunner<S>,
    config: WorkerConfig,
}

impl<S> WorkerLoop<S>
where
    S: JobStore,
{
    pub fn new(queue: QueueService<S>, handler: Arc<dyn JobHandler>, config: WorkerConfig) -> Self {
        Self {
            name: handler.name().to_owned(),
            runner: JobRunner::new(queue.clone(), handler),
            queue,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Claim and run at most one job, returning whether a job ran.
    pub async fn run_once(&self) -> Result<bool, QueueError> {
        if let Some(stalled_after) = self.config.stalled_job_timeout {
            let recovered = self
                .queue
                .recover_stalled_jobs(Some(&self.name), stalled_after)
                .await?;
            if recovered > 0 {
                tracing::warn!(name = %self.name, recovered, "Recovered stalled jobs");
            }
        }

        match self.queue.claim_next(Some(&self.name)).await? {
            Some(job) => {
                self.runner.execute_job(job).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Shutdown is only observed between jobs, a running job always has its outcome persisted.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::debug!(name = %self.name, "Starting worker loop");
        while !shutdown.is_cancelled() {
            match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(error) => {
                    tracing::error!(?error, name = %self.name, "Failed to claim job: {error}")
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        tracing::debug!(name = %self.name, "Worker loop stopped");
    }
}
