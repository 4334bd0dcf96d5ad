use serde::{Deserialize, Serialize};

use crate::job::{JobId, JobLog, JobStatus};

/// A change announced by a [`QueueService`](super::QueueService).
///
/// Serialized with the event name in an `event` field, e.g. `{"event":"job.added",...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum QueueEvent {
    #[serde(rename = "job.added")]
    JobAdded {
        job_id: JobId,
        name: String,
        status: JobStatus,
    },
    #[serde(rename = "job.completed")]
    JobCompleted {
        job_id: JobId,
        name: String,
        result: Option<serde_json::Value>,
    },
    /// The job has failed for good, or was cancelled.
    #[serde(rename = "job.failed")]
    JobFailed {
        job_id: JobId,
        name: String,
        attempts: u32,
        error: String,
    },
    /// The job will run again, after `delay_ms`.
    #[serde(rename = "job.retrying")]
    JobRetrying {
        job_id: JobId,
        name: String,
        attempts: u32,
        delay_ms: u64,
    },
    #[serde(rename = "job.progress")]
    JobProgress { job_id: JobId, progress: u8 },
    #[serde(rename = "job.log_added")]
    JobLogAdded { log: JobLog },
    #[serde(rename = "job.paused")]
    JobPaused { job_id: JobId },
    #[serde(rename = "job.resumed")]
    JobResumed { job_id: JobId },
    #[serde(rename = "queue.paused")]
    QueuePaused,
    #[serde(rename = "queue.resumed")]
    QueueResumed,
    #[serde(rename = "queue.cleaned")]
    QueueCleaned { deleted: u64 },
}

impl QueueEvent {
    /// The name the event is serialized under.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JobAdded { .. } => "job.added",
            Self::JobCompleted { .. } => "job.completed",
            Self::JobFailed { .. } => "job.failed",
            Self::JobRetrying { .. } => "job.retrying",
            Self::JobProgress { .. } => "job.progress",
            Self::JobLogAdded { .. } => "job.log_added",
            Self::JobPaused { .. } => "job.paused",
            Self::JobResumed { .. } => "job.resumed",
            Self::QueuePaused => "queue.paused",
            Self::QueueResumed => "queue.resumed",
            Self::QueueCleaned { .. } => "queue.cleaned",
        }
    }

    /// The job the event is about, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::JobAdded { job_id, .. }
            | Self::JobCompleted { job_id, .. }
            | Self::JobFailed { job_id, .. }
            | Self::JobRetrying { job_id, .. }
            | Self::JobProgress { job_id, .. }
            | Self::JobPaused { job_id }
            | Self::JobResumed { job_id } => Some(*job_id),
            Self::JobLogAdded { log } => Some(log.job_id),
            Self::QueuePaused | Self::QueueResumed | Self::QueueCleaned { .. } => None,
        }
    }
}
