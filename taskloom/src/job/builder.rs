use std::marker::PhantomData;

use chrono::TimeDelta;

use crate::{
    executor::Executor,
    job::{Job, JobId, JobOptions},
    queue::{QueueError, QueueService},
    store::JobStore,
};

/// Builds and submits a job for an [`Executor`].
///
/// Obtained with [`Executor::builder`].
pub struct JobBuilder<E>
where
    E: Executor,
{
    data: Option<E::Data>,
    opts: JobOptions,
    _executor: PhantomData<fn() -> E>,
}

impl<E> Default for JobBuilder<E>
where
    E: Executor,
{
    fn default() -> Self {
        Self {
            data: None,
            opts: JobOptions::default(),
            _executor: PhantomData,
        }
    }
}

impl<E> JobBuilder<E>
where
    E: Executor,
{
    pub fn with_data(self, data: E::Data) -> Self {
        Self {
            data: Some(data),
            ..self
        }
    }

    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            opts: self.opts.with_max_attempts(max_attempts),
            ..self
        }
    }

    pub fn with_priority(self, priority: i32) -> Self {
        Self {
            opts: self.opts.with_priority(priority),
            ..self
        }
    }

    pub fn with_delay(self, delay: TimeDelta) -> Self {
        Self {
            opts: self.opts.with_delay(delay),
            ..self
        }
    }

    /// The job will not run before the parent job has completed.
    pub fn depends_on(self, parent_job_id: JobId) -> Self {
        Self {
            opts: self.opts.depends_on(parent_job_id),
            ..self
        }
    }

    pub fn with_dependency_count(self, dependency_count: u32) -> Self {
        Self {
            opts: self.opts.with_dependency_count(dependency_count),
            ..self
        }
    }

    pub async fn enqueue<S: JobStore>(self, queue: &QueueService<S>) -> Result<Job, QueueError> {
        let opts = match self.opts.attempts {
            Some(_) => self.opts,
            None => self.opts.with_max_attempts(E::MAX_ATTEMPTS),
        };
        queue
            .add_job(E::NAME, serde_json::to_value(self.data)?, opts)
            .await
    }
}
