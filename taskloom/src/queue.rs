//! The queue service: submission, claiming, outcomes and administration of jobs.
//!
//! Every state change is a conditional update on the [`JobStore`], so any number of services can
//! share one store. Changes are announced as [`QueueEvent`]s to the subscribers of a service.
use std::{
    cmp::max,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::{
    backoff::{RetryPolicy, Strategy, DEFAULT_RETRY_POLICY},
    executor::ExecutionError,
    job::{now, Job, JobId, JobLog, JobOptions, JobStatus, LogLevel},
    store::{CandidateFilter, Condition, JobPatch, JobStore, SortOrder, StoreError},
};

mod event;

pub use event::QueueEvent;

type Result<T> = std::result::Result<T, QueueError>;

/// The failure reason of a cancelled job.
pub const CANCELLED_REASON: &str = "Job cancelled by user";

/// A job to be submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    pub name: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub opts: JobOptions,
}

impl NewJob {
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            data,
            opts: JobOptions::default(),
        }
    }

    pub fn with_opts(self, opts: JobOptions) -> Self {
        Self { opts, ..self }
    }
}

/// The queue of jobs held in a [`JobStore`].
///
/// Clones share the pause flag and the event subscribers.
#[derive(Clone)]
pub struct QueueService<S> {
    store: S,
    retry_policy: RetryPolicy,
    batch_size: usize,
    paused: Arc<AtomicBool>,
    events: broadcast::Sender<QueueEvent>,
}

impl<S: JobStore> QueueService<S> {
    pub const DEFAULT_BATCH_SIZE: usize = 10;
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
    pub const MAX_PRIORITY: i64 = 1_000_000;
    /// Events a lagging subscriber may fall behind by before it misses some.
    pub const EVENT_CAPACITY: usize = 1024;

    pub fn new(store: S) -> Self {
        let (events, _) = broadcast::channel(Self::EVENT_CAPACITY);
        Self {
            store,
            retry_policy: DEFAULT_RETRY_POLICY,
            batch_size: Self::DEFAULT_BATCH_SIZE,
            paused: Default::default(),
            events,
        }
    }

    pub fn with_retry_policy(self, retry_policy: RetryPolicy) -> Self {
        Self {
            retry_policy,
            ..self
        }
    }

    /// The number of candidates fetched at a time when claiming, at least one.
    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            ..self
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Receive the events of this service and of its clones from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    /// Validate and persist a new job.
    pub async fn add_job(
        &self,
        name: impl Into<String>,
        data: serde_json::Value,
        opts: JobOptions,
    ) -> Result<Job> {
        let job = self.build_job(name.into(), data, opts).await?;
        self.insert(job).await
    }

    /// Validate every job before persisting any of them.
    ///
    /// Parents must already exist, a job cannot depend on another job of the same batch.
    pub async fn add_bulk(&self, jobs: impl IntoIterator<Item = NewJob>) -> Result<Vec<Job>> {
        let mut built = Vec::new();
        for (index, NewJob { name, data, opts }) in jobs.into_iter().enumerate() {
            let job = self
                .build_job(name, data, opts)
                .await
                .map_err(|error| match error {
                    QueueError::Validation(reason) => {
                        QueueError::Validation(format!("job {index}: {reason}"))
                    }
                    error => error,
                })?;
            built.push(job);
        }

        let mut added = Vec::with_capacity(built.len());
        for job in built {
            added.push(self.insert(job).await?);
        }
        tracing::debug!(count = added.len(), "Jobs added in bulk");
        Ok(added)
    }

    async fn build_job(
        &self,
        name: String,
        data: serde_json::Value,
        opts: JobOptions,
    ) -> Result<Job> {
        if name.trim().is_empty() {
            return Err(QueueError::Validation("job name must not be empty".to_owned()));
        }
        let priority = match opts.priority.unwrap_or(0) {
            priority if (-Self::MAX_PRIORITY..=Self::MAX_PRIORITY).contains(&priority) => {
                priority as i32
            }
            priority => {
                return Err(QueueError::Validation(format!(
                    "priority {priority} is outside of [-{max}, {max}]",
                    max = Self::MAX_PRIORITY
                )))
            }
        };
        let delay_ms = u64::try_from(opts.delay.unwrap_or(0))
            .map_err(|_| QueueError::Validation("delay must not be negative".to_owned()))?;
        let max_attempts = opts
            .attempts
            .map_or(Ok(Self::DEFAULT_MAX_ATTEMPTS), u32::try_from)
            .ok()
            .filter(|attempts| *attempts >= 1)
            .ok_or_else(|| QueueError::Validation("attempts must be at least 1".to_owned()))?;
        let mut dependency_count = match (opts.parent_job_id, opts.dependency_count) {
            (_, Some(count)) => u32::try_from(count).map_err(|_| {
                QueueError::Validation("dependency count must not be negative".to_owned())
            })?,
            (Some(_), None) => 1,
            (None, None) => 0,
        };
        if dependency_count > 0 && opts.parent_job_id.is_none() {
            return Err(QueueError::Validation(
                "a dependency count requires a parent job".to_owned(),
            ));
        }

        if let Some(parent_id) = opts.parent_job_id {
            let parent = self.store.get_by_id(parent_id).await?.ok_or_else(|| {
                QueueError::Validation(format!("parent job {parent_id} does not exist"))
            })?;
            if parent.status == JobStatus::Completed {
                dependency_count = dependency_count.saturating_sub(1);
            }
        }

        let status = if delay_ms > 0 {
            JobStatus::Delayed
        } else if dependency_count > 0 {
            JobStatus::WaitingDependency
        } else {
            JobStatus::Waiting
        };
        let now = now();
        Ok(Job {
            id: JobId::new(),
            name,
            data,
            status,
            priority,
            delay_ms,
            max_attempts,
            attempts: 0,
            progress: 0,
            parent_job_id: opts.parent_job_id,
            dependency_count,
            result: None,
            failure_reason: None,
            stacktrace: None,
            created_at: now,
            status_changed_at: now,
            processed_on: None,
            finished_on: None,
            opts,
        })
    }

    async fn insert(&self, job: Job) -> Result<Job> {
        let job = self.store.insert(job).await?;
        tracing::debug!(job_id = %job.id, name = %job.name, status = %job.status, "Job added");
        self.emit(QueueEvent::JobAdded {
            job_id: job.id,
            name: job.name.clone(),
            status: job.status,
        });
        Ok(job)
    }

    /// Stop handing out jobs from this service and its clones.
    ///
    /// Running jobs are not affected and other services sharing the store keep claiming.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            tracing::info!("Queue paused");
            self.emit(QueueEvent::QueuePaused);
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            tracing::info!("Queue resumed");
            self.emit(QueueEvent::QueueResumed);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Claim the next eligible job, optionally restricted to one partition.
    ///
    /// Candidates are inspected in priority order, a candidate lost to a concurrent claimer is
    /// skipped. Nothing is claimed while the queue is paused.
    pub async fn claim_next(&self, name: Option<&str>) -> Result<Option<Job>> {
        if self.is_paused() {
            return Ok(None);
        }
        loop {
            let now = now();
            let candidates = self
                .store
                .select_candidates(&CandidateFilter::new(name, now, self.batch_size))
                .await?;
            if candidates.is_empty() {
                return Ok(None);
            }

            // Every candidate that is not claimed here leaves the candidate set, either through
            // the update below or through the concurrent change that made it fail.
            for job in candidates {
                if job.dependency_count > 0 {
                    self.store
                        .update_if(
                            job.id,
                            &Condition::unchanged(&job),
                            &JobPatch::status(JobStatus::WaitingDependency),
                        )
                        .await?;
                    continue;
                }
                let claimed = self
                    .store
                    .update_if(
                        job.id,
                        &Condition::unchanged(&job).with_dependency_count(0),
                        &JobPatch::status(JobStatus::Active)
                            .with_processed_on(Some(now))
                            .with_delay_ms(0)
                            .with_failure_reason(None),
                    )
                    .await?;
                match claimed {
                    Some(job) => {
                        tracing::debug!(job_id = %job.id, name = %job.name, "Job claimed");
                        return Ok(Some(job));
                    }
                    None => {
                        tracing::debug!(job_id = %job.id, "Job claimed by another worker");
                    }
                }
            }
        }
    }

    /// Mark an active job as completed and release the jobs depending on it.
    ///
    /// Returns `None` when the job is not active.
    pub async fn complete_job(
        &self,
        id: JobId,
        result: Option<serde_json::Value>,
    ) -> Result<Option<Job>> {
        let Some(job) = self
            .store
            .update_if(
                id,
                &Condition::status_in([JobStatus::Active]),
                &JobPatch::status(JobStatus::Completed)
                    .with_result(result)
                    .with_progress(100)
                    .with_failure_reason(None)
                    .with_stacktrace(None)
                    .with_finished_on(Some(now())),
            )
            .await?
        else {
            tracing::warn!(job_id = %id, "Cannot complete job {id}, it is not active");
            return Ok(None);
        };

        for child in self.store.select_by_parent(id).await? {
            self.release_dependency(child).await?;
        }

        self.emit(QueueEvent::JobCompleted {
            job_id: job.id,
            name: job.name.clone(),
            result: job.result.clone(),
        });
        Ok(Some(job))
    }

    async fn release_dependency(&self, mut child: Job) -> Result<()> {
        loop {
            if child.dependency_count == 0 {
                return Ok(());
            }
            let remaining = child.dependency_count - 1;
            let mut patch = JobPatch::default().with_dependency_count(remaining);
            if remaining == 0 && child.status == JobStatus::WaitingDependency {
                patch.status = Some(JobStatus::Waiting);
            }
            let condition = Condition::status_in([child.status])
                .with_dependency_count(child.dependency_count);

            if let Some(updated) = self.store.update_if(child.id, &condition, &patch).await? {
                tracing::debug!(
                    job_id = %updated.id,
                    dependency_count = updated.dependency_count,
                    "Dependency released"
                );
                return Ok(());
            }

            match self.store.get_by_id(child.id).await? {
                Some(current) => child = current,
                None => return Ok(()),
            }
        }
    }

    /// Record a failed attempt of an active job.
    ///
    /// The job is delayed for a retry while it has attempts left, otherwise it is failed.
    /// Returns `None` when the job is not active.
    pub async fn fail_job(&self, id: JobId, error: &ExecutionError) -> Result<Option<Job>> {
        match self.store.get_by_id(id).await? {
            Some(job) if job.status == JobStatus::Active => {
                self.fail_attempt(&job, Condition::unchanged(&job), error)
                    .await
            }
            _ => {
                tracing::warn!(job_id = %id, "Cannot fail job {id}, it is not active");
                Ok(None)
            }
        }
    }

    async fn fail_attempt(
        &self,
        job: &Job,
        condition: Condition,
        error: &ExecutionError,
    ) -> Result<Option<Job>> {
        let attempts = job.attempts.saturating_add(1);
        let patch = if job.is_final_attempt() {
            tracing::error!(
                job_id = %job.id,
                attempts,
                ?error,
                "Job {} failed after {attempts} attempts: {error}",
                job.id,
            );
            JobPatch::status(JobStatus::Failed)
                .with_attempts(attempts)
                .with_failure_reason(Some(error.message.clone()))
                .with_stacktrace(error.stacktrace.clone())
                .with_finished_on(Some(now()))
        } else {
            let delay = self.retry_policy.backoff(attempts);
            tracing::warn!(
                job_id = %job.id,
                attempts,
                ?error,
                "Job {} failed and will be retried in {delay}: {error}",
                job.id,
            );
            JobPatch::status(JobStatus::Delayed)
                .with_attempts(attempts)
                .with_delay_ms(u64::try_from(delay.num_milliseconds()).unwrap_or(0))
                .with_failure_reason(Some(error.message.clone()))
        };

        let updated = self.store.update_if(job.id, &condition, &patch).await?;
        if let Some(job) = &updated {
            self.emit(match job.status {
                JobStatus::Delayed => QueueEvent::JobRetrying {
                    job_id: job.id,
                    name: job.name.clone(),
                    attempts: job.attempts,
                    delay_ms: job.delay_ms,
                },
                _ => QueueEvent::JobFailed {
                    job_id: job.id,
                    name: job.name.clone(),
                    attempts: job.attempts,
                    error: error.message.clone(),
                },
            });
        }
        Ok(updated)
    }

    /// Cancel a job that has not started yet.
    pub async fn cancel_job(&self, id: JobId) -> Result<Job> {
        let cancelled = self
            .store
            .update_if(
                id,
                &Condition::status_in(JobStatus::CANCELLABLE),
                &JobPatch::status(JobStatus::Failed)
                    .with_failure_reason(Some(CANCELLED_REASON.to_owned()))
                    .with_finished_on(Some(now())),
            )
            .await?;
        match cancelled {
            Some(job) => {
                tracing::debug!(job_id = %id, "Job cancelled");
                self.emit(QueueEvent::JobFailed {
                    job_id: job.id,
                    name: job.name.clone(),
                    attempts: job.attempts,
                    error: CANCELLED_REASON.to_owned(),
                });
                Ok(job)
            }
            None => Err(self.invalid_state(id, "cancel").await),
        }
    }

    /// Put a failed job back in the queue, granting it at least one more attempt.
    pub async fn retry_job(&self, id: JobId) -> Result<Job> {
        let job = self
            .store
            .get_by_id(id)
            .await?
            .ok_or(QueueError::NotFound(id))?;
        if job.status != JobStatus::Failed {
            return Err(QueueError::InvalidState {
                id,
                status: job.status,
                operation: "retry",
            });
        }
        let retried = self
            .store
            .update_if(
                id,
                &Condition::unchanged(&job),
                &JobPatch::status(JobStatus::Waiting)
                    .with_max_attempts(max(job.max_attempts, job.attempts.saturating_add(1)))
                    .with_delay_ms(0)
                    .with_progress(0)
                    .with_result(None)
                    .with_failure_reason(None)
                    .with_stacktrace(None)
                    .with_processed_on(None)
                    .with_finished_on(None),
            )
            .await?;
        match retried {
            Some(job) => {
                tracing::debug!(job_id = %id, "Job retried");
                self.emit(QueueEvent::JobRetrying {
                    job_id: job.id,
                    name: job.name.clone(),
                    attempts: job.attempts,
                    delay_ms: 0,
                });
                Ok(job)
            }
            None => Err(self.invalid_state(id, "retry").await),
        }
    }

    /// Hold back a job that has not started yet until it is resumed.
    pub async fn pause_job(&self, id: JobId) -> Result<Job> {
        let paused = self
            .store
            .update_if(
                id,
                &Condition::status_in(JobStatus::PAUSABLE),
                &JobPatch::status(JobStatus::Paused),
            )
            .await?;
        match paused {
            Some(job) => {
                tracing::debug!(job_id = %id, "Job paused");
                self.emit(QueueEvent::JobPaused { job_id: job.id });
                Ok(job)
            }
            None => Err(self.invalid_state(id, "pause").await),
        }
    }

    /// Release a paused job.
    ///
    /// It waits for its remaining dependencies, if any, and any delay it had is dropped.
    pub async fn resume_job(&self, id: JobId) -> Result<Job> {
        loop {
            let job = self
                .store
                .get_by_id(id)
                .await?
                .ok_or(QueueError::NotFound(id))?;
            if job.status != JobStatus::Paused {
                return Err(QueueError::InvalidState {
                    id,
                    status: job.status,
                    operation: "resume",
                });
            }
            let status = if job.dependency_count > 0 {
                JobStatus::WaitingDependency
            } else {
                JobStatus::Waiting
            };
            let resumed = self
                .store
                .update_if(
                    id,
                    &Condition::unchanged(&job).with_dependency_count(job.dependency_count),
                    &JobPatch::status(status).with_delay_ms(0),
                )
                .await?;
            if let Some(job) = resumed {
                tracing::debug!(job_id = %id, status = %job.status, "Job resumed");
                self.emit(QueueEvent::JobResumed { job_id: job.id });
                return Ok(job);
            }
        }
    }

    /// Record the progress of an active job.
    pub async fn update_progress(&self, id: JobId, progress: u8) -> Result<Job> {
        if progress > 100 {
            return Err(QueueError::Validation(format!(
                "progress {progress} is outside of [0, 100]"
            )));
        }
        let updated = self
            .store
            .update_if(
                id,
                &Condition::status_in([JobStatus::Active]),
                &JobPatch::default().with_progress(progress),
            )
            .await?;
        match updated {
            Some(job) => {
                self.emit(QueueEvent::JobProgress {
                    job_id: job.id,
                    progress,
                });
                Ok(job)
            }
            None => Err(self.invalid_state(id, "update progress").await),
        }
    }

    /// Append a line to the log of a job, stamped now unless `timestamp` is given.
    pub async fn add_job_log(
        &self,
        id: JobId,
        message: impl Into<String>,
        level: LogLevel,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<JobLog> {
        let message = message.into();
        if message.trim().is_empty() {
            return Err(QueueError::Validation("log message must not be empty".to_owned()));
        }
        if self.store.get_by_id(id).await?.is_none() {
            return Err(QueueError::NotFound(id));
        }
        let log = self
            .store
            .append_log(JobLog {
                job_id: id,
                message,
                level,
                timestamp: timestamp.map_or_else(now, |at| at.trunc_subsecs(3)),
            })
            .await?;
        self.emit(QueueEvent::JobLogAdded { log: log.clone() });
        Ok(log)
    }

    /// The last `limit` log lines of a job, oldest first.
    pub async fn get_job_logs(&self, id: JobId, limit: usize) -> Result<Vec<JobLog>> {
        Ok(self.store.select_logs(id, limit).await?)
    }

    async fn invalid_state(&self, id: JobId, operation: &'static str) -> QueueError {
        match self.store.get_by_id(id).await {
            Ok(Some(job)) => QueueError::InvalidState {
                id,
                status: job.status,
                operation,
            },
            Ok(None) => QueueError::NotFound(id),
            Err(error) => error.into(),
        }
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.store.get_by_id(id).await?)
    }

    pub async fn get_job_status(&self, id: JobId) -> Result<Option<JobStatusReport>> {
        Ok(self.store.get_by_id(id).await?.map(JobStatusReport::from))
    }

    /// The most recently completed jobs.
    pub async fn poll_completed_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        Ok(self
            .store
            .select_by_status(&[JobStatus::Completed], SortOrder::RecentlyFinished, limit)
            .await?)
    }

    /// The most recently failed jobs.
    pub async fn get_failed_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        Ok(self
            .store
            .select_by_status(&[JobStatus::Failed], SortOrder::RecentlyFinished, limit)
            .await?)
    }

    pub async fn get_queue_stats(&self) -> Result<QueueStats> {
        let counts = self.store.count_by_status().await?;
        let count = |status| counts.get(&status).copied().unwrap_or(0);
        Ok(QueueStats {
            waiting: count(JobStatus::Waiting),
            delayed: count(JobStatus::Delayed),
            waiting_dependency: count(JobStatus::WaitingDependency),
            active: count(JobStatus::Active),
            completed: count(JobStatus::Completed),
            failed: count(JobStatus::Failed),
            paused: count(JobStatus::Paused),
            total: counts.values().sum(),
        })
    }

    /// The jobs that could be claimed right now, in the order they would be served.
    pub async fn get_pending_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let now = now();
        let mut pending = Vec::new();
        let mut offset = 0;
        while pending.len() < limit {
            let candidates = self
                .store
                .select_candidates(
                    &CandidateFilter::new(None, now, self.batch_size).with_offset(offset),
                )
                .await?;
            let fetched = candidates.len();
            offset += fetched;
            pending.extend(
                candidates
                    .into_iter()
                    .filter(|job| job.dependency_count == 0),
            );
            if fetched < self.batch_size {
                break;
            }
        }
        pending.truncate(limit);
        Ok(pending)
    }

    /// Delete completed and failed jobs that finished longer ago than `retention`.
    pub async fn cleanup_old_jobs(&self, retention: TimeDelta) -> Result<u64> {
        if retention < TimeDelta::zero() {
            return Err(QueueError::Validation(
                "retention must not be negative".to_owned(),
            ));
        }
        let Some(cutoff) = now().checked_sub_signed(retention) else {
            tracing::debug!(%retention, "Retention reaches before the earliest time");
            return Ok(0);
        };
        let deleted = self.store.delete_finished_before(cutoff).await?;
        tracing::debug!(deleted, %cutoff, "Old jobs cleaned up");
        self.emit(QueueEvent::QueueCleaned { deleted });
        Ok(deleted)
    }

    /// Treat jobs that have been active for longer than `stalled_after` as failed attempts.
    ///
    /// Returns the number of jobs recovered.
    pub async fn recover_stalled_jobs(
        &self,
        name: Option<&str>,
        stalled_after: TimeDelta,
    ) -> Result<u64> {
        if stalled_after < TimeDelta::zero() {
            return Err(QueueError::Validation(
                "stall timeout must not be negative".to_owned(),
            ));
        }
        let Some(cutoff) = now().checked_sub_signed(stalled_after) else {
            return Ok(0);
        };
        let stalled = self
            .store
            .select_by_status(&[JobStatus::Active], SortOrder::Priority, usize::MAX)
            .await?
            .into_iter()
            .filter(|job| name.map_or(true, |name| job.name == name))
            .filter(|job| job.processed_on.is_some_and(|on| on < cutoff));

        let error = ExecutionError::stalled(stalled_after);
        let mut recovered = 0;
        for job in stalled {
            let condition = Condition::unchanged(&job).with_processed_before(cutoff);
            if self.fail_attempt(&job, condition, &error).await?.is_some() {
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}

/// The status of a job as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusReport {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub progress: u8,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub stacktrace: Option<String>,
    pub attempts: u32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub processed_on: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub finished_on: Option<DateTime<Utc>>,
}

impl From<Job> for JobStatusReport {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            name: job.name,
            status: job.status,
            progress: job.progress,
            result: job.result,
            error: job.failure_reason,
            stacktrace: job.stacktrace,
            attempts: job.attempts,
            created_at: job.created_at,
            processed_on: job.processed_on,
            finished_on: job.finished_on,
        }
    }
}

/// Number of jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub waiting: u64,
    pub delayed: u64,
    pub waiting_dependency: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub paused: u64,
    pub total: u64,
}

/// The errors that can be returned by the [`QueueService`].
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Invalid job: {0}")]
    Validation(String),
    #[error("Cannot {operation} job {id} in status {status}")]
    InvalidState {
        id: JobId,
        status: JobStatus,
        operation: &'static str,
    },
    #[error("Job {0} not found")]
    NotFound(JobId),
    #[error("Error communicating with the store")]
    Store(#[from] StoreError),
    #[error("Error encoding or decoding value")]
    Encode(#[from] serde_json::Error),
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::store::memory::InMemoryStore;

    fn queue() -> QueueService<InMemoryStore> {
        QueueService::new(InMemoryStore::new())
    }

    #[tokio::test]
    async fn add_job_rejects_invalid_options() {
        let queue = queue();

        let cases = [
            ("", JobOptions::default()),
            ("job", JobOptions {
                delay: Some(-1),
                ..Default::default()
            }),
            ("job", JobOptions {
                attempts: Some(0),
                ..Default::default()
            }),
            ("job", JobOptions {
                priority: Some(1_000_001),
                ..Default::default()
            }),
            ("job", JobOptions {
                dependency_count: Some(-1),
                ..Default::default()
            }),
            ("job", JobOptions::default().with_dependency_count(2)),
            ("job", JobOptions::default().depends_on(JobId::new())),
        ];

        for (name, opts) in cases {
            let result = queue.add_job(name, json!(null), opts.clone()).await;
            assert_matches!(result, Err(QueueError::Validation(_)), "{name:?} {opts:?}");
        }
        assert_eq!(queue.get_queue_stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn add_job_applies_defaults() {
        let job = queue()
            .add_job("job", json!({"a": 1}), JobOptions::default())
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.priority, 0);
        assert_eq!(job.delay_ms, 0);
        assert_eq!(job.dependency_count, 0);
        assert_eq!(job.created_at, job.status_changed_at);
    }

    #[tokio::test]
    async fn add_job_initial_status() {
        let queue = queue();
        let parent = queue
            .add_job("parent", json!(null), JobOptions::default())
            .await
            .unwrap();

        let delayed = queue
            .add_job(
                "job",
                json!(null),
                JobOptions::default()
                    .with_delay(TimeDelta::seconds(1))
                    .depends_on(parent.id),
            )
            .await
            .unwrap();
        assert_eq!(delayed.status, JobStatus::Delayed);
        assert_eq!(delayed.dependency_count, 1);

        let dependent = queue
            .add_job("job", json!(null), JobOptions::default().depends_on(parent.id))
            .await
            .unwrap();
        assert_eq!(dependent.status, JobStatus::WaitingDependency);
    }

    #[tokio::test]
    async fn add_job_with_completed_parent_counts_dependency_as_met() {
        let queue = queue();
        let parent = queue
            .add_job("parent", json!(null), JobOptions::default())
            .await
            .unwrap();
        queue.claim_next(Some("parent")).await.unwrap().unwrap();
        queue.complete_job(parent.id, None).await.unwrap().unwrap();

        let child = queue
            .add_job("child", json!(null), JobOptions::default().depends_on(parent.id))
            .await
            .unwrap();

        assert_eq!(child.dependency_count, 0);
        assert_eq!(child.status, JobStatus::Waiting);
    }

    #[tokio::test]
    async fn claim_moves_blocked_jobs_to_waiting_dependency() {
        let queue = queue();
        let parent = queue
            .add_job("parent", json!(null), JobOptions::default())
            .await
            .unwrap();
        let child = queue
            .add_job(
                "child",
                json!(null),
                JobOptions::default()
                    .depends_on(parent.id)
                    .with_dependency_count(1),
            )
            .await
            .unwrap();
        // Simulate a job submitted as waiting while still blocked.
        queue
            .store()
            .update_if(
                child.id,
                &Condition::status_in([JobStatus::WaitingDependency]),
                &JobPatch::status(JobStatus::Waiting),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(queue.claim_next(Some("child")).await.unwrap(), None);

        let child = queue.get_job(child.id).await.unwrap().unwrap();
        assert_eq!(child.status, JobStatus::WaitingDependency);
    }

    #[tokio::test]
    async fn claim_next_looks_past_a_full_batch_of_ineligible_jobs() {
        let queue = queue().with_batch_size(2);
        for _ in 0..5 {
            queue
                .add_job(
                    "job",
                    json!(null),
                    JobOptions::default()
                        .with_priority(10)
                        .with_delay(TimeDelta::hours(1)),
                )
                .await
                .unwrap();
        }
        let ready = queue
            .add_job("job", json!(null), JobOptions::default())
            .await
            .unwrap();

        let claimed = queue.claim_next(Some("job")).await.unwrap().unwrap();

        assert_eq!(claimed.id, ready.id);
    }

    #[tokio::test]
    async fn claim_next_respects_partition() {
        let queue = queue();
        queue
            .add_job("other", json!(null), JobOptions::default())
            .await
            .unwrap();

        assert_eq!(queue.claim_next(Some("job")).await.unwrap(), None);
        assert!(queue.claim_next(None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn claim_clears_previous_failure() {
        let queue = queue().with_retry_policy(crate::backoff::retry_policy(
            TimeDelta::zero(),
            TimeDelta::zero(),
        ));
        let job = queue
            .add_job("job", json!(null), JobOptions::default())
            .await
            .unwrap();
        queue.claim_next(None).await.unwrap().unwrap();
        queue.fail_job(job.id, &"boom".into()).await.unwrap().unwrap();

        let claimed = queue.claim_next(None).await.unwrap().unwrap();

        assert_eq!(claimed.status, JobStatus::Active);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.delay_ms, 0);
        assert_eq!(claimed.failure_reason, None);
    }

    #[tokio::test]
    async fn complete_and_fail_require_active_job() {
        let queue = queue();
        let job = queue
            .add_job("job", json!(null), JobOptions::default())
            .await
            .unwrap();

        assert_eq!(queue.complete_job(job.id, None).await.unwrap(), None);
        assert_eq!(queue.fail_job(job.id, &"boom".into()).await.unwrap(), None);
        assert_eq!(queue.fail_job(JobId::new(), &"boom".into()).await.unwrap(), None);

        let job = queue.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn fail_on_final_attempt_keeps_stacktrace() {
        let queue = queue();
        let job = queue
            .add_job("job", json!(null), JobOptions::default().with_max_attempts(1))
            .await
            .unwrap();
        queue.claim_next(None).await.unwrap().unwrap();
        let error = ExecutionError::from("boom").with_stacktrace("at handler");

        let failed = queue.fail_job(job.id, &error).await.unwrap().unwrap();

        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.failure_reason.as_deref(), Some("boom"));
        assert_eq!(failed.stacktrace.as_deref(), Some("at handler"));
        assert!(failed.finished_on.is_some());
    }

    #[tokio::test]
    async fn update_progress_only_for_active_jobs() {
        let queue = queue();
        let job = queue
            .add_job("job", json!(null), JobOptions::default())
            .await
            .unwrap();

        assert_matches!(
            queue.update_progress(job.id, 50).await,
            Err(QueueError::InvalidState { status: JobStatus::Waiting, .. })
        );

        queue.claim_next(None).await.unwrap().unwrap();
        assert_matches!(
            queue.update_progress(job.id, 101).await,
            Err(QueueError::Validation(_))
        );
        let job = queue.update_progress(job.id, 50).await.unwrap();
        assert_eq!(job.progress, 50);
    }

    #[tokio::test]
    async fn recover_stalled_jobs_retries_long_running_jobs() {
        let queue = queue();
        let job = queue
            .add_job("job", json!(null), JobOptions::default())
            .await
            .unwrap();
        queue.claim_next(None).await.unwrap().unwrap();

        assert_eq!(
            queue
                .recover_stalled_jobs(None, TimeDelta::hours(1))
                .await
                .unwrap(),
            0
        );
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(
            queue
                .recover_stalled_jobs(Some("other"), TimeDelta::zero())
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            queue
                .recover_stalled_jobs(Some("job"), TimeDelta::zero())
                .await
                .unwrap(),
            1
        );

        let job = queue.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Delayed);
        assert_eq!(job.attempts, 1);
        assert!(job
            .failure_reason
            .is_some_and(|reason| reason.starts_with("Job stalled")));
    }

    #[tokio::test]
    async fn cleanup_rejects_negative_retention() {
        assert_matches!(
            queue().cleanup_old_jobs(TimeDelta::seconds(-1)).await,
            Err(QueueError::Validation(_))
        );
    }

    #[tokio::test]
    async fn retention_beyond_the_epoch_deletes_nothing() {
        let queue = queue();
        let job = queue
            .add_job("job", json!(null), JobOptions::default())
            .await
            .unwrap();
        queue.claim_next(None).await.unwrap().unwrap();
        queue.complete_job(job.id, None).await.unwrap().unwrap();

        assert_eq!(queue.cleanup_old_jobs(TimeDelta::MAX).await.unwrap(), 0);
        assert!(queue.get_job(job.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stall_timeout_bounds() {
        let queue = queue();
        queue
            .add_job("job", json!(null), JobOptions::default())
            .await
            .unwrap();
        queue.claim_next(None).await.unwrap().unwrap();

        assert_eq!(
            queue.recover_stalled_jobs(None, TimeDelta::MAX).await.unwrap(),
            0
        );
        assert_matches!(
            queue.recover_stalled_jobs(None, TimeDelta::MIN).await,
            Err(QueueError::Validation(_))
        );
        assert_eq!(queue.get_queue_stats().await.unwrap().active, 1);
    }

    #[tokio::test]
    async fn paused_queue_claims_nothing() {
        let queue = queue();
        let mut events = queue.subscribe();
        queue
            .add_job("job", json!(null), JobOptions::default())
            .await
            .unwrap();
        let clone = queue.clone();

        queue.pause();
        queue.pause();
        assert!(clone.is_paused());
        assert_eq!(clone.claim_next(None).await.unwrap(), None);
        assert_eq!(queue.get_pending_jobs(10).await.unwrap().len(), 1);

        clone.resume();
        assert!(!queue.is_paused());
        assert!(queue.claim_next(None).await.unwrap().is_some());

        assert_matches!(events.recv().await, Ok(QueueEvent::JobAdded { .. }));
        assert_matches!(events.recv().await, Ok(QueueEvent::QueuePaused));
        assert_matches!(events.recv().await, Ok(QueueEvent::QueueResumed));
        assert_matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        );
    }

    #[tokio::test]
    async fn lifecycle_events() {
        let queue = queue().with_retry_policy(crate::backoff::retry_policy(
            TimeDelta::zero(),
            TimeDelta::zero(),
        ));
        let mut events = queue.subscribe();
        let job = queue
            .add_job("job", json!(null), JobOptions::default().with_max_attempts(2))
            .await
            .unwrap();

        queue.claim_next(None).await.unwrap().unwrap();
        queue.update_progress(job.id, 30).await.unwrap();
        queue.fail_job(job.id, &"boom".into()).await.unwrap().unwrap();
        queue.claim_next(None).await.unwrap().unwrap();
        queue.complete_job(job.id, Some(json!(7))).await.unwrap().unwrap();

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        assert_eq!(
            received,
            vec![
                QueueEvent::JobAdded {
                    job_id: job.id,
                    name: "job".to_owned(),
                    status: JobStatus::Waiting,
                },
                QueueEvent::JobProgress {
                    job_id: job.id,
                    progress: 30,
                },
                QueueEvent::JobRetrying {
                    job_id: job.id,
                    name: "job".to_owned(),
                    attempts: 1,
                    delay_ms: 0,
                },
                QueueEvent::JobCompleted {
                    job_id: job.id,
                    name: "job".to_owned(),
                    result: Some(json!(7)),
                },
            ]
        );
    }

    #[tokio::test]
    async fn final_failure_and_cancellation_are_failed_events() {
        let queue = queue();
        let failing = queue
            .add_job("job", json!(null), JobOptions::default().with_max_attempts(1))
            .await
            .unwrap();
        let waiting = queue
            .add_job("other", json!(null), JobOptions::default())
            .await
            .unwrap();
        let mut events = queue.subscribe();

        queue.claim_next(Some("job")).await.unwrap().unwrap();
        queue.fail_job(failing.id, &"boom".into()).await.unwrap().unwrap();
        queue.cancel_job(waiting.id).await.unwrap();

        assert_matches!(
            events.try_recv(),
            Ok(QueueEvent::JobFailed { job_id, attempts: 1, error, .. })
                if job_id == failing.id && error == "boom"
        );
        assert_matches!(
            events.try_recv(),
            Ok(QueueEvent::JobFailed { job_id, attempts: 0, error, .. })
                if job_id == waiting.id && error == CANCELLED_REASON
        );
    }

    #[tokio::test]
    async fn add_bulk_names_the_invalid_job() {
        let queue = queue();

        let result = queue
            .add_bulk([
                NewJob::new("job", json!(1)),
                NewJob::new("job", json!(2)).with_opts(JobOptions {
                    attempts: Some(0),
                    ..Default::default()
                }),
            ])
            .await;

        assert_matches!(
            result,
            Err(QueueError::Validation(reason)) if reason.starts_with("job 1:")
        );
        assert_eq!(queue.get_queue_stats().await.unwrap().total, 0);
        assert_eq!(queue.add_bulk([]).await.unwrap(), vec![]);
    }

    #[tokio::test]
    async fn job_log_requires_existing_job_and_message() {
        let queue = queue();
        let job = queue
            .add_job("job", json!(null), JobOptions::default())
            .await
            .unwrap();
        let mut events = queue.subscribe();

        assert_matches!(
            queue
                .add_job_log(JobId::new(), "hello", LogLevel::Info, None)
                .await,
            Err(QueueError::NotFound(_))
        );
        assert_matches!(
            queue.add_job_log(job.id, " ", LogLevel::Info, None).await,
            Err(QueueError::Validation(_))
        );
        let log = queue
            .add_job_log(job.id, "hello", LogLevel::Warn, None)
            .await
            .unwrap();

        assert_eq!(log.level, LogLevel::Warn);
        assert_matches!(events.try_recv(), Ok(QueueEvent::JobLogAdded { log: added }) if added == log);
    }
}
