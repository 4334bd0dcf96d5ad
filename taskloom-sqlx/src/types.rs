use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use sqlx::prelude::FromRow;
use taskloom::{
    job::{Job, JobId, JobLog, JobStatus, LogLevel},
    store::StoreError,
};

/// The columns selected for a job, in the order of [`JobRow`].
pub(crate) const JOB_COLUMNS: &str = "id, name, data, opts, status, priority, delay, \
    max_attempts, attempts, progress, parent_job_id, dependency_count, result, failure_reason, \
    stacktrace, created_at, status_changed_at, processed_on, finished_on";

#[derive(Debug, FromRow)]
pub(crate) struct JobRow {
    pub id: String,
    pub name: String,
    pub data: String,
    pub opts: String,
    pub status: String,
    pub priority: i64,
    pub delay: i64,
    pub max_attempts: i64,
    pub attempts: i64,
    pub progress: i64,
    pub parent_job_id: Option<String>,
    pub dependency_count: i64,
    pub result: Option<String>,
    pub failure_reason: Option<String>,
    pub stacktrace: Option<String>,
    pub created_at: i64,
    pub status_changed_at: i64,
    pub processed_on: Option<i64>,
    pub finished_on: Option<i64>,
}

/// The columns selected for a log line, in the order of [`JobLogRow`].
pub(crate) const LOG_COLUMNS: &str = "job_id, message, level, timestamp";

#[derive(Debug, FromRow)]
pub(crate) struct JobLogRow {
    pub job_id: String,
    pub message: String,
    pub level: String,
    pub timestamp: i64,
}

fn corrupt(column: &str, id: &str, reason: impl Display) -> StoreError {
    StoreError::Corrupt(format!("{column} of job {id}: {reason}"))
}

fn job_id(value: &str, id: &str) -> Result<JobId, StoreError> {
    JobId::from_str(value).map_err(|error| corrupt("id", id, error))
}

fn int<T: TryFrom<i64>>(value: i64, column: &str, id: &str) -> Result<T, StoreError> {
    T::try_from(value).map_err(|_| corrupt(column, id, format!("{value} is out of range")))
}

fn timestamp(value: i64, column: &str, id: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(value)
        .ok_or_else(|| corrupt(column, id, format!("{value} is not a valid timestamp")))
}

pub(crate) fn millis(value: DateTime<Utc>) -> i64 {
    value.timestamp_millis()
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let id = row.id.as_str();
        Ok(Self {
            id: job_id(id, id)?,
            name: row.name.clone(),
            data: serde_json::from_str(&row.data)?,
            opts: serde_json::from_str(&row.opts)?,
            status: JobStatus::from_str(&row.status)
                .map_err(|error| corrupt("status", id, error))?,
            priority: int(row.priority, "priority", id)?,
            delay_ms: int(row.delay, "delay", id)?,
            max_attempts: int(row.max_attempts, "max_attempts", id)?,
            attempts: int(row.attempts, "attempts", id)?,
            progress: int(row.progress, "progress", id)?,
            parent_job_id: row
                .parent_job_id
                .as_deref()
                .map(|parent| job_id(parent, id))
                .transpose()?,
            dependency_count: int(row.dependency_count, "dependency_count", id)?,
            result: row.result.as_deref().map(serde_json::from_str).transpose()?,
            failure_reason: row.failure_reason.clone(),
            stacktrace: row.stacktrace.clone(),
            created_at: timestamp(row.created_at, "created_at", id)?,
            status_changed_at: timestamp(row.status_changed_at, "status_changed_at", id)?,
            processed_on: row
                .processed_on
                .map(|value| timestamp(value, "processed_on", id))
                .transpose()?,
            finished_on: row
                .finished_on
                .map(|value| timestamp(value, "finished_on", id))
                .transpose()?,
        })
    }
}

impl TryFrom<JobLogRow> for JobLog {
    type Error = StoreError;

    fn try_from(row: JobLogRow) -> Result<Self, Self::Error> {
        let id = row.job_id.as_str();
        Ok(Self {
            job_id: job_id(id, id)?,
            level: LogLevel::from_str(&row.level).map_err(|error| corrupt("level", id, error))?,
            timestamp: timestamp(row.timestamp, "timestamp", id)?,
            message: row.message,
        })
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    fn row() -> JobRow {
        JobRow {
            id: "67e55044-10b1-426f-9247-bb680e5fe0c8".to_owned(),
            name: "job".to_owned(),
            data: r#"{"messageId":"m1"}"#.to_owned(),
            opts: "{}".to_owned(),
            status: "waiting_dependency".to_owned(),
            priority: 5,
            delay: 0,
            max_attempts: 3,
            attempts: 0,
            progress: 0,
            parent_job_id: None,
            dependency_count: 1,
            result: None,
            failure_reason: None,
            stacktrace: None,
            created_at: 1_717_200_000_123,
            status_changed_at: 1_717_200_000_123,
            processed_on: None,
            finished_on: None,
        }
    }

    #[test]
    fn decodes_row() {
        let job = Job::try_from(row()).unwrap();

        assert_eq!(job.id.to_string(), "67e55044-10b1-426f-9247-bb680e5fe0c8");
        assert_eq!(job.status, JobStatus::WaitingDependency);
        assert_eq!(job.data, serde_json::json!({"messageId": "m1"}));
        assert_eq!(job.priority, 5);
        assert_eq!(millis(job.created_at), 1_717_200_000_123);
    }

    #[test]
    fn rejects_corrupt_rows() {
        let status = JobRow {
            status: "sleeping".to_owned(),
            ..row()
        };
        let attempts = JobRow {
            attempts: -1,
            ..row()
        };
        let data = JobRow {
            data: "{".to_owned(),
            ..row()
        };

        assert_matches!(Job::try_from(status), Err(StoreError::Corrupt(_)));
        assert_matches!(Job::try_from(attempts), Err(StoreError::Corrupt(_)));
        assert_matches!(Job::try_from(data), Err(StoreError::EncodeDecode(_)));
    }

    #[test]
    fn decodes_log_rows() {
        let row = || JobLogRow {
            job_id: "67e55044-10b1-426f-9247-bb680e5fe0c8".to_owned(),
            message: "fetched 3 pages".to_owned(),
            level: "WARN".to_owned(),
            timestamp: 1_717_200_000_123,
        };

        let log = JobLog::try_from(row()).unwrap();
        assert_eq!(log.level, LogLevel::Warn);
        assert_eq!(millis(log.timestamp), 1_717_200_000_123);

        let level = JobLogRow {
            level: "TRACE".to_owned(),
            ..row()
        };
        assert_matches!(JobLog::try_from(level), Err(StoreError::Corrupt(_)));
    }
}
