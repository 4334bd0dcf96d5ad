//! Queue commands served over a [`ControlChannel`].
//!
//! The worker process serves [`queue_router`], the host calls it through a [`QueueClient`].
use std::future::Future;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    job::{Job, JobId, JobLog, JobOptions, LogLevel},
    queue::{JobStatusReport, NewJob, QueueError, QueueService, QueueStats},
    store::JobStore,
};

use super::{ActionRouter, BoxError, ChannelError, ControlChannel};

pub const ADD_JOB: &str = "addJob";
pub const ADD_BULK: &str = "addBulk";
pub const GET_JOB_STATUS: &str = "getJobStatus";
pub const GET_JOB_STATUSES: &str = "getJobStatuses";
pub const POLL_COMPLETED_JOBS: &str = "pollCompletedJobs";
pub const GET_FAILED_JOBS: &str = "getFailedJobs";
pub const GET_QUEUE_STATS: &str = "getQueueStats";
pub const GET_PENDING_JOBS: &str = "getPendingJobs";
pub const RETRY_JOB: &str = "retryJob";
pub const CANCEL_JOB: &str = "cancelJob";
pub const CLEANUP_OLD_JOBS: &str = "cleanupOldJobs";
pub const PAUSE_QUEUE: &str = "pauseQueue";
pub const RESUME_QUEUE: &str = "resumeQueue";
pub const PAUSE_JOB: &str = "pauseJob";
pub const RESUME_JOB: &str = "resumeJob";
pub const ADD_JOB_LOG: &str = "addJobLog";
pub const GET_JOB_LOGS: &str = "getJobLogs";
/// Carries a [`QueueEvent`](crate::queue::QueueEvent) from the worker process to the host, sent
/// as a notification.
pub const QUEUE_EVENT: &str = "queueEvent";
/// Asks the worker process to drain and exit, sent as a notification.
pub const SHUTDOWN: &str = "shutdown";

const DEFAULT_COMPLETED_LIMIT: usize = 50;
const DEFAULT_FAILED_LIMIT: usize = 50;
const DEFAULT_PENDING_LIMIT: usize = 20;
const DEFAULT_LOG_LIMIT: usize = 100;
const DEFAULT_RETENTION: TimeDelta = TimeDelta::hours(24);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddBulkRequest {
    pub jobs: Vec<NewJob>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobIdRequest {
    pub job_id: JobId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobIdsRequest {
    pub job_ids: Vec<JobId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl LimitRequest {
    fn or(request: Option<Self>, default: usize) -> usize {
        request.and_then(|request| request.limit).unwrap_or(default)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub deleted: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStateResponse {
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddJobLogRequest {
    pub job_id: JobId,
    pub message: String,
    #[serde(default)]
    pub level: LogLevel,
    /// Milliseconds since the Unix epoch, now when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLogsRequest {
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

fn route<S, P, T, F, Fut>(
    router: ActionRouter,
    action: &'static str,
    queue: &QueueService<S>,
    f: F,
) -> ActionRouter
where
    S: JobStore,
    P: DeserializeOwned,
    T: Serialize,
    F: Fn(QueueService<S>, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, QueueError>> + Send + 'static,
{
    let queue = queue.clone();
    router.with_action(action, move |payload| {
        let command = serde_json::from_value(payload).map(|params| f(queue.clone(), params));
        async move {
            let output = command?.await?;
            Ok::<_, BoxError>(serde_json::to_value(output)?)
        }
    })
}

/// The actions serving the queue commands on `queue`.
pub fn queue_router<S: JobStore>(queue: &QueueService<S>) -> ActionRouter {
    let router = ActionRouter::new();
    let router = route(router, ADD_JOB, queue, |queue, request: NewJob| async move {
        queue.add_job(request.name, request.data, request.opts).await
    });
    let router = route(router, ADD_BULK, queue, |queue, request: AddBulkRequest| async move {
        queue.add_bulk(request.jobs).await
    });
    let router = route(router, GET_JOB_STATUS, queue, |queue, request: JobIdRequest| async move {
        queue.get_job_status(request.job_id).await
    });
    let router = route(router, GET_JOB_STATUSES, queue, |queue, request: JobIdsRequest| async move {
        let mut reports = Vec::with_capacity(request.job_ids.len());
        for id in request.job_ids {
            reports.push(queue.get_job_status(id).await?);
        }
        Ok(reports)
    });
    let router = route(router, POLL_COMPLETED_JOBS, queue, |queue, request: Option<LimitRequest>| async move {
        queue
            .poll_completed_jobs(LimitRequest::or(request, DEFAULT_COMPLETED_LIMIT))
            .await
    });
    let router = route(router, GET_FAILED_JOBS, queue, |queue, request: Option<LimitRequest>| async move {
        queue
            .get_failed_jobs(LimitRequest::or(request, DEFAULT_FAILED_LIMIT))
            .await
    });
    let router = route(router, GET_QUEUE_STATS, queue, |queue, _: serde::de::IgnoredAny| async move {
        queue.get_queue_stats().await
    });
    let router = route(router, GET_PENDING_JOBS, queue, |queue, request: Option<LimitRequest>| async move {
        queue
            .get_pending_jobs(LimitRequest::or(request, DEFAULT_PENDING_LIMIT))
            .await
    });
    let router = route(router, RETRY_JOB, queue, |queue, request: JobIdRequest| async move {
        queue.retry_job(request.job_id).await
    });
    let router = route(router, CANCEL_JOB, queue, |queue, request: JobIdRequest| async move {
        queue.cancel_job(request.job_id).await
    });
    let router = route(router, CLEANUP_OLD_JOBS, queue, |queue, request: Option<CleanupRequest>| async move {
        let retention = match request.and_then(|request| request.retention_ms) {
            None => DEFAULT_RETENTION,
            Some(retention_ms) => TimeDelta::try_milliseconds(retention_ms).ok_or_else(|| {
                QueueError::Validation(format!("retention of {retention_ms}ms is out of range"))
            })?,
        };
        let deleted = queue.cleanup_old_jobs(retention).await?;
        Ok(CleanupResponse { deleted })
    });
    let router = route(router, PAUSE_QUEUE, queue, |queue, _: serde::de::IgnoredAny| async move {
        queue.pause();
        Ok(QueueStateResponse { paused: queue.is_paused() })
    });
    let router = route(router, RESUME_QUEUE, queue, |queue, _: serde::de::IgnoredAny| async move {
        queue.resume();
        Ok(QueueStateResponse { paused: queue.is_paused() })
    });
    let router = route(router, PAUSE_JOB, queue, |queue, request: JobIdRequest| async move {
        queue.pause_job(request.job_id).await
    });
    let router = route(router, RESUME_JOB, queue, |queue, request: JobIdRequest| async move {
        queue.resume_job(request.job_id).await
    });
    let router = route(router, ADD_JOB_LOG, queue, |queue, request: AddJobLogRequest| async move {
        let timestamp = request
            .timestamp
            .map(|millis| {
                DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
                    QueueError::Validation(format!("timestamp {millis} is out of range"))
                })
            })
            .transpose()?;
        queue
            .add_job_log(request.job_id, request.message, request.level, timestamp)
            .await
    });
    route(router, GET_JOB_LOGS, queue, |queue, request: JobLogsRequest| async move {
        queue
            .get_job_logs(request.job_id, request.limit.unwrap_or(DEFAULT_LOG_LIMIT))
            .await
    })
}

/// Calls the queue commands of a worker process.
#[derive(Clone)]
pub struct QueueClient {
    channel: ControlChannel,
}

impl QueueClient {
    pub fn new(channel: ControlChannel) -> Self {
        Self { channel }
    }

    pub async fn add_job(
        &self,
        name: impl Into<String>,
        data: serde_json::Value,
        opts: JobOptions,
    ) -> Result<Job, ChannelError> {
        let request = NewJob {
            name: name.into(),
            data,
            opts,
        };
        self.channel.call(ADD_JOB, request).await
    }

    /// Add all of `jobs` or, when any of them is invalid, none.
    pub async fn add_bulk(&self, jobs: Vec<NewJob>) -> Result<Vec<Job>, ChannelError> {
        self.channel.call(ADD_BULK, AddBulkRequest { jobs }).await
    }

    pub async fn get_job_status(
        &self,
        job_id: JobId,
    ) -> Result<Option<JobStatusReport>, ChannelError> {
        self.channel
            .call(GET_JOB_STATUS, JobIdRequest { job_id })
            .await
    }

    pub async fn get_job_statuses(
        &self,
        job_ids: Vec<JobId>,
    ) -> Result<Vec<Option<JobStatusReport>>, ChannelError> {
        self.channel
            .call(GET_JOB_STATUSES, JobIdsRequest { job_ids })
            .await
    }

    pub async fn poll_completed_jobs(&self, limit: usize) -> Result<Vec<Job>, ChannelError> {
        self.channel
            .call(POLL_COMPLETED_JOBS, LimitRequest { limit: Some(limit) })
            .await
    }

    pub async fn get_failed_jobs(&self, limit: usize) -> Result<Vec<Job>, ChannelError> {
        self.channel
            .call(GET_FAILED_JOBS, LimitRequest { limit: Some(limit) })
            .await
    }

    pub async fn get_queue_stats(&self) -> Result<QueueStats, ChannelError> {
        self.channel.call(GET_QUEUE_STATS, ()).await
    }

    pub async fn get_pending_jobs(&self, limit: usize) -> Result<Vec<Job>, ChannelError> {
        self.channel
            .call(GET_PENDING_JOBS, LimitRequest { limit: Some(limit) })
            .await
    }

    pub async fn retry_job(&self, job_id: JobId) -> Result<Job, ChannelError> {
        self.channel.call(RETRY_JOB, JobIdRequest { job_id }).await
    }

    pub async fn cancel_job(&self, job_id: JobId) -> Result<Job, ChannelError> {
        self.channel.call(CANCEL_JOB, JobIdRequest { job_id }).await
    }

    /// Delete finished jobs older than `retention`, returning how many were deleted.
    pub async fn cleanup_old_jobs(&self, retention: TimeDelta) -> Result<u64, ChannelError> {
        let request = CleanupRequest {
            retention_ms: Some(retention.num_milliseconds()),
        };
        let response: CleanupResponse = self.channel.call(CLEANUP_OLD_JOBS, request).await?;
        Ok(response.deleted)
    }

    /// Stop the worker process from claiming jobs, returning whether it is paused.
    pub async fn pause_queue(&self) -> Result<bool, ChannelError> {
        let response: QueueStateResponse = self.channel.call(PAUSE_QUEUE, ()).await?;
        Ok(response.paused)
    }

    pub async fn resume_queue(&self) -> Result<bool, ChannelError> {
        let response: QueueStateResponse = self.channel.call(RESUME_QUEUE, ()).await?;
        Ok(response.paused)
    }

    pub async fn pause_job(&self, job_id: JobId) -> Result<Job, ChannelError> {
        self.channel.call(PAUSE_JOB, JobIdRequest { job_id }).await
    }

    pub async fn resume_job(&self, job_id: JobId) -> Result<Job, ChannelError> {
        self.channel.call(RESUME_JOB, JobIdRequest { job_id }).await
    }

    pub async fn add_job_log(
        &self,
        job_id: JobId,
        message: impl Into<String>,
        level: LogLevel,
    ) -> Result<JobLog, ChannelError> {
        let request = AddJobLogRequest {
            job_id,
            message: message.into(),
            level,
            timestamp: None,
        };
        self.channel.call(ADD_JOB_LOG, request).await
    }

    pub async fn get_job_logs(&self, job_id: JobId, limit: usize) -> Result<Vec<JobLog>, ChannelError> {
        self.channel
            .call(GET_JOB_LOGS, JobLogsRequest { job_id, limit: Some(limit) })
            .await
    }

    /// Ask the worker process to drain its workers and exit.
    pub fn shutdown(&self) -> Result<(), ChannelError> {
        self.channel.notify(SHUTDOWN, ())
    }
}
