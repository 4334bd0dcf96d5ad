//! The job model and its state machine.
use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

pub mod builder;
pub(crate) mod runner;

/// The current time at the millisecond precision the stores persist.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// The unique identifier of a job.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<JobId> for Uuid {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unit of asynchronous work.
///
/// The payload is kept as a [`serde_json::Value`] by the queue and the stores. Executors see a
/// job with their own data type, see [`Job::decode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job<D = serde_json::Value> {
    pub id: JobId,
    /// Selects the handler and the partition of the queue the job belongs to.
    pub name: String,
    pub data: D,
    /// The options as given on submission.
    pub opts: JobOptions,
    pub status: JobStatus,
    pub priority: i32,
    /// Delay in milliseconds, counted from [`Job::status_changed_at`].
    #[serde(rename = "delay")]
    pub delay_ms: u64,
    pub max_attempts: u32,
    pub attempts: u32,
    pub progress: u8,
    pub parent_job_id: Option<JobId>,
    /// The number of dependencies that have not yet completed.
    pub dependency_count: u32,
    pub result: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub stacktrace: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub status_changed_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub processed_on: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub finished_on: Option<DateTime<Utc>>,
}

impl<D> Job<D> {
    /// When a delayed job becomes eligible to be claimed.
    pub fn available_at(&self) -> DateTime<Utc> {
        let delay = TimeDelta::milliseconds(i64::try_from(self.delay_ms).unwrap_or(i64::MAX));
        self.status_changed_at
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// A job is due unless it is delayed and its delay has not yet elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status != JobStatus::Delayed || self.available_at() <= now
    }

    /// Whether a failure of the current attempt exhausts the job.
    pub fn is_final_attempt(&self) -> bool {
        self.attempts.saturating_add(1) >= self.max_attempts
    }

    fn with_data<T>(self, data: T) -> Job<T> {
        Job {
            id: self.id,
            name: self.name,
            data,
            opts: self.opts,
            status: self.status,
            priority: self.priority,
            delay_ms: self.delay_ms,
            max_attempts: self.max_attempts,
            attempts: self.attempts,
            progress: self.progress,
            parent_job_id: self.parent_job_id,
            dependency_count: self.dependency_count,
            result: self.result,
            failure_reason: self.failure_reason,
            stacktrace: self.stacktrace,
            created_at: self.created_at,
            status_changed_at: self.status_changed_at,
            processed_on: self.processed_on,
            finished_on: self.finished_on,
        }
    }
}

impl Job {
    /// Decode the payload into the executor's data type.
    pub fn decode<D: DeserializeOwned>(mut self) -> Result<Job<D>, serde_json::Error> {
        let data = serde_json::from_value(std::mem::take(&mut self.data))?;
        Ok(self.with_data(data))
    }
}

/// The options a job was submitted with.
///
/// Numeric options are kept signed so out of range values coming over the wire are rejected by
/// validation rather than by deserialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    /// Delay before the first attempt in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<i64>,
    /// Maximum number of attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_job_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_count: Option<i64>,
}

impl JobOptions {
    pub fn with_priority(self, priority: i32) -> Self {
        Self {
            priority: Some(priority.into()),
            ..self
        }
    }

    pub fn with_delay(self, delay: TimeDelta) -> Self {
        Self {
            delay: Some(delay.num_milliseconds()),
            ..self
        }
    }

    pub fn with_max_attempts(self, attempts: u32) -> Self {
        Self {
            attempts: Some(attempts.into()),
            ..self
        }
    }

    pub fn depends_on(self, parent_job_id: JobId) -> Self {
        Self {
            parent_job_id: Some(parent_job_id),
            ..self
        }
    }

    pub fn with_dependency_count(self, dependency_count: u32) -> Self {
        Self {
            dependency_count: Some(dependency_count.into()),
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Delayed,
    WaitingDependency,
    Active,
    Completed,
    Failed,
    /// Held back by an administrator until resumed, never claimed.
    Paused,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        Self::Waiting,
        Self::Delayed,
        Self::WaitingDependency,
        Self::Active,
        Self::Completed,
        Self::Failed,
        Self::Paused,
    ];

    /// The statuses from which a job can be claimed.
    pub const CLAIMABLE: [JobStatus; 3] =
        [Self::Waiting, Self::Delayed, Self::WaitingDependency];

    /// The statuses from which a job can be cancelled.
    pub const CANCELLABLE: [JobStatus; 3] = [Self::Waiting, Self::Delayed, Self::Paused];

    /// The statuses from which a job can be paused.
    pub const PAUSABLE: [JobStatus; 3] = [Self::Waiting, Self::Delayed, Self::WaitingDependency];

    pub const FINISHED: [JobStatus; 2] = [Self::Completed, Self::Failed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::WaitingDependency => "waiting_dependency",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the queue may move a job from `self` to `next`.
    ///
    /// Cancelling, pausing, resuming and retrying are administrative transitions and are
    /// included.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Waiting | Delayed | WaitingDependency, Active)
                | (Active, Completed | Delayed | Failed)
                | (Delayed | WaitingDependency, Waiting)
                | (Waiting | Delayed, WaitingDependency)
                | (Waiting | Delayed | Paused, Failed)
                | (Waiting | Delayed | WaitingDependency, Paused)
                | (Paused, Waiting | WaitingDependency)
                | (Failed, Waiting)
        )
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown job status: {0}")]
pub struct UnknownStatus(String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_owned()))
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub const ALL: [LogLevel; 4] = [Self::Debug, Self::Info, Self::Warn, Self::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown log level: {0}")]
pub struct UnknownLogLevel(String);

impl FromStr for LogLevel {
    type Err = UnknownLogLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownLogLevel(s.to_owned()))
    }
}

/// A line written to the log of a job, kept next to the job until it is cleaned up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLog {
    pub job_id: JobId,
    pub message: String,
    pub level: LogLevel,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}
