//! Persistence of jobs.
//!
//! The queue never reads a record and then writes it back. Every transition that matters for
//! mutual exclusion goes through [`JobStore::update_if`], which implementations must apply
//! atomically.
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::job::{Job, JobId, JobLog, JobStatus};

pub mod memory;
#[doc(hidden)]
pub mod testing;

/// A durable store of [`Job`] records.
///
/// Implementations can be checked against the shared contract with [`crate::test_suite`].
#[async_trait]
pub trait JobStore: Clone + Send + Sync + 'static {
    /// Persist a new job as given.
    async fn insert(&self, job: Job) -> Result<Job, StoreError>;

    async fn get_by_id(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Apply `patch` to the job only if the stored record currently matches `condition`.
    ///
    /// Returns the updated job, or `None` when the job does not exist or no longer matches.
    async fn update_if(
        &self,
        id: JobId,
        condition: &Condition,
        patch: &JobPatch,
    ) -> Result<Option<Job>, StoreError>;

    /// Jobs that could be claimed, in the order they should be served.
    ///
    /// These are `waiting` jobs, `delayed` jobs whose delay has elapsed at [`CandidateFilter::now`]
    /// and `waiting_dependency` jobs whose dependencies have all completed, ordered by priority
    /// descending then creation ascending.
    async fn select_candidates(
        &self,
        filter: &CandidateFilter<'_>,
    ) -> Result<Vec<Job>, StoreError>;

    async fn select_by_parent(&self, parent_id: JobId) -> Result<Vec<Job>, StoreError>;

    async fn select_by_status(
        &self,
        statuses: &[JobStatus],
        order: SortOrder,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>, StoreError>;

    /// Delete `completed` and `failed` jobs that finished before the cutoff, with their logs.
    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Append a line to the log of an existing job.
    async fn append_log(&self, log: JobLog) -> Result<JobLog, StoreError>;

    /// The last `limit` log lines of a job, oldest first.
    async fn select_logs(&self, job_id: JobId, limit: usize) -> Result<Vec<JobLog>, StoreError>;
}

/// The errors that can be returned by a [`JobStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Error encoding or decoding data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("System in bad state")]
    BadState,
    #[error("Corrupt job record: {0}")]
    Corrupt(String),
    #[error("Database error: {0}")]
    Database(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// The predicate of a conditional update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub status_in: Vec<JobStatus>,
    pub dependency_count: Option<u32>,
    pub processed_before: Option<DateTime<Utc>>,
    /// Optimistic check that the status has not moved since the job was read.
    pub status_changed_at: Option<DateTime<Utc>>,
}

impl Condition {
    pub fn status_in(statuses: impl IntoIterator<Item = JobStatus>) -> Self {
        Self {
            status_in: statuses.into_iter().collect(),
            dependency_count: None,
            processed_before: None,
            status_changed_at: None,
        }
    }

    /// Matches only while the job is still in the state it was read in.
    pub fn unchanged(job: &Job) -> Self {
        Self {
            status_changed_at: Some(job.status_changed_at),
            ..Self::status_in([job.status])
        }
    }

    pub fn with_dependency_count(self, dependency_count: u32) -> Self {
        Self {
            dependency_count: Some(dependency_count),
            ..self
        }
    }

    pub fn with_processed_before(self, processed_before: DateTime<Utc>) -> Self {
        Self {
            processed_before: Some(processed_before),
            ..self
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status_in.contains(&job.status)
            && self
                .dependency_count
                .map_or(true, |count| job.dependency_count == count)
            && self
                .processed_before
                .map_or(true, |before| job.processed_on.is_some_and(|on| on < before))
            && self
                .status_changed_at
                .map_or(true, |at| job.status_changed_at == at)
    }
}

/// The fields changed by a conditional update, `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub attempts: Option<u32>,
    pub max_attempts: Option<u32>,
    pub delay_ms: Option<u64>,
    pub progress: Option<u8>,
    pub dependency_count: Option<u32>,
    pub result: Option<Option<serde_json::Value>>,
    pub failure_reason: Option<Option<String>>,
    pub stacktrace: Option<Option<String>>,
    pub processed_on: Option<Option<DateTime<Utc>>>,
    pub finished_on: Option<Option<DateTime<Utc>>>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_attempts(self, attempts: u32) -> Self {
        Self {
            attempts: Some(attempts),
            ..self
        }
    }

    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..self
        }
    }

    pub fn with_delay_ms(self, delay_ms: u64) -> Self {
        Self {
            delay_ms: Some(delay_ms),
            ..self
        }
    }

    pub fn with_progress(self, progress: u8) -> Self {
        Self {
            progress: Some(progress),
            ..self
        }
    }

    pub fn with_dependency_count(self, dependency_count: u32) -> Self {
        Self {
            dependency_count: Some(dependency_count),
            ..self
        }
    }

    pub fn with_result(self, result: Option<serde_json::Value>) -> Self {
        Self {
            result: Some(result),
            ..self
        }
    }

    pub fn with_failure_reason(self, failure_reason: Option<String>) -> Self {
        Self {
            failure_reason: Some(failure_reason),
            ..self
        }
    }

    pub fn with_stacktrace(self, stacktrace: Option<String>) -> Self {
        Self {
            stacktrace: Some(stacktrace),
            ..self
        }
    }

    pub fn with_processed_on(self, processed_on: Option<DateTime<Utc>>) -> Self {
        Self {
            processed_on: Some(processed_on),
            ..self
        }
    }

    pub fn with_finished_on(self, finished_on: Option<DateTime<Utc>>) -> Self {
        Self {
            finished_on: Some(finished_on),
            ..self
        }
    }

    /// Apply the patch in place, stamping `status_changed_at` when the status changes.
    pub fn apply(&self, job: &mut Job, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            if status != job.status {
                job.status = status;
                job.status_changed_at = now;
            }
        }
        if let Some(attempts) = self.attempts {
            job.attempts = attempts;
        }
        if let Some(max_attempts) = self.max_attempts {
            job.max_attempts = max_attempts;
        }
        if let Some(delay_ms) = self.delay_ms {
            job.delay_ms = delay_ms;
        }
        if let Some(progress) = self.progress {
            job.progress = progress;
        }
        if let Some(dependency_count) = self.dependency_count {
            job.dependency_count = dependency_count;
        }
        if let Some(result) = &self.result {
            job.result.clone_from(result);
        }
        if let Some(failure_reason) = &self.failure_reason {
            job.failure_reason.clone_from(failure_reason);
        }
        if let Some(stacktrace) = &self.stacktrace {
            job.stacktrace.clone_from(stacktrace);
        }
        if let Some(processed_on) = self.processed_on {
            job.processed_on = processed_on;
        }
        if let Some(finished_on) = self.finished_on {
            job.finished_on = finished_on;
        }
    }
}

/// Selects claim candidates.
#[derive(Debug, Clone, Copy)]
pub struct CandidateFilter<'a> {
    /// Restrict to a single partition.
    pub name: Option<&'a str>,
    /// Delayed jobs are candidates once they are available at this instant.
    pub now: DateTime<Utc>,
    /// The number of leading candidates to skip.
    pub offset: usize,
    pub limit: usize,
}

impl<'a> CandidateFilter<'a> {
    pub fn new(name: Option<&'a str>, now: DateTime<Utc>, limit: usize) -> Self {
        Self {
            name,
            now,
            offset: 0,
            limit,
        }
    }

    pub fn with_offset(self, offset: usize) -> Self {
        Self { offset, ..self }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Most recently finished first.
    RecentlyFinished,
    /// Highest priority first, then oldest first.
    Priority,
}
