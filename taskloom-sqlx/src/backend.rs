use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use taskloom::{
    job::{Job, JobId, JobLog, JobStatus},
    store::{CandidateFilter, Condition, JobPatch, JobStore, SortOrder, StoreError},
};
use tracing::instrument;

use crate::{
    map_err,
    query::{ByStatus, ToQuery, UpdateIf},
    types::{millis, JobLogRow, JobRow, JOB_COLUMNS, LOG_COLUMNS},
    SqliteJobStore,
};

impl SqliteJobStore {
    fn into_jobs(rows: Vec<JobRow>) -> Result<Vec<Job>, StoreError> {
        rows.into_iter().map(TryFrom::try_from).collect()
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip_all, fields(job_id = %job.id, name = %job.name))]
    async fn insert(&self, job: Job) -> Result<Job, StoreError> {
        let query = format!(
            "INSERT INTO taskloom_jobs ({JOB_COLUMNS}) \
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
            RETURNING {JOB_COLUMNS}"
        );
        let row: JobRow = sqlx::query_as(&query)
            .bind(job.id.to_string())
            .bind(job.name.as_str())
            .bind(serde_json::to_string(&job.data)?)
            .bind(serde_json::to_string(&job.opts)?)
            .bind(job.status.as_str())
            .bind(i64::from(job.priority))
            .bind(i64::try_from(job.delay_ms).unwrap_or(i64::MAX))
            .bind(i64::from(job.max_attempts))
            .bind(i64::from(job.attempts))
            .bind(i64::from(job.progress))
            .bind(job.parent_job_id.map(|id| id.to_string()))
            .bind(i64::from(job.dependency_count))
            .bind(job.result.as_ref().map(serde_json::to_string).transpose()?)
            .bind(job.failure_reason.as_deref())
            .bind(job.stacktrace.as_deref())
            .bind(millis(job.created_at))
            .bind(millis(job.status_changed_at))
            .bind(job.processed_on.map(millis))
            .bind(job.finished_on.map(millis))
            .fetch_one(&**self)
            .await
            .map_err(map_err)?;
        row.try_into()
    }

    async fn get_by_id(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM taskloom_jobs WHERE id = ?");
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id.to_string())
            .fetch_optional(&**self)
            .await
            .map_err(map_err)?
            .map(TryFrom::try_from)
            .transpose()
    }

    #[instrument(skip(self, condition, patch))]
    async fn update_if(
        &self,
        id: JobId,
        condition: &Condition,
        patch: &JobPatch,
    ) -> Result<Option<Job>, StoreError> {
        let update = UpdateIf {
            id,
            condition,
            patch,
            now: Utc::now().timestamp_millis(),
        };
        update
            .query()
            .build_query_as::<JobRow>()
            .fetch_optional(&**self)
            .await
            .map_err(map_err)?
            .map(TryFrom::try_from)
            .transpose()
    }

    async fn select_candidates(
        &self,
        filter: &CandidateFilter<'_>,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = filter
            .query()
            .build_query_as::<JobRow>()
            .fetch_all(&**self)
            .await
            .map_err(map_err)?;
        Self::into_jobs(rows)
    }

    async fn select_by_parent(&self, parent_id: JobId) -> Result<Vec<Job>, StoreError> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM taskloom_jobs WHERE parent_job_id = ? \
            ORDER BY created_at ASC, rowid ASC"
        );
        let rows = sqlx::query_as::<_, JobRow>(&query)
            .bind(parent_id.to_string())
            .fetch_all(&**self)
            .await
            .map_err(map_err)?;
        Self::into_jobs(rows)
    }

    async fn select_by_status(
        &self,
        statuses: &[JobStatus],
        order: SortOrder,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let by_status = ByStatus {
            statuses,
            order,
            limit,
        };
        let rows = by_status
            .query()
            .build_query_as::<JobRow>()
            .fetch_all(&**self)
            .await
            .map_err(map_err)?;
        Self::into_jobs(rows)
    }

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM taskloom_jobs GROUP BY status")
                .fetch_all(&**self)
                .await
                .map_err(map_err)?;
        rows.into_iter()
            .map(|(status, count)| {
                let status = status
                    .parse()
                    .map_err(|error| StoreError::Corrupt(format!("{error}")))?;
                Ok::<_, StoreError>((status, u64::try_from(count).unwrap_or(0)))
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        // Children keep running, the foreign keys clear their parent and drop the logs.
        let result = sqlx::query(
            "DELETE FROM taskloom_jobs \
            WHERE status IN ('completed', 'failed') AND finished_on < ?",
        )
        .bind(millis(cutoff))
        .execute(&**self)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected())
    }

    #[instrument(skip_all, fields(job_id = %log.job_id))]
    async fn append_log(&self, log: JobLog) -> Result<JobLog, StoreError> {
        let query = format!(
            "INSERT INTO taskloom_job_logs ({LOG_COLUMNS}) VALUES (?, ?, ?, ?) \
            RETURNING {LOG_COLUMNS}"
        );
        let row: JobLogRow = sqlx::query_as(&query)
            .bind(log.job_id.to_string())
            .bind(log.message.as_str())
            .bind(log.level.as_str())
            .bind(millis(log.timestamp))
            .fetch_one(&**self)
            .await
            .map_err(map_err)?;
        row.try_into()
    }

    async fn select_logs(&self, job_id: JobId, limit: usize) -> Result<Vec<JobLog>, StoreError> {
        let query = format!(
            "SELECT {LOG_COLUMNS} FROM (\
                SELECT id, {LOG_COLUMNS} FROM taskloom_job_logs WHERE job_id = ? \
                ORDER BY id DESC LIMIT ?\
            ) ORDER BY id ASC"
        );
        let rows = sqlx::query_as::<_, JobLogRow>(&query)
            .bind(job_id.to_string())
            .bind(crate::query::limit(limit))
            .fetch_all(&**self)
            .await
            .map_err(map_err)?;
        rows.into_iter().map(TryFrom::try_from).collect()
    }
}
