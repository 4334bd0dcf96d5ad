use std::sync::Arc;

use tracing::{instrument, Instrument};

use crate::{
    executor::{ExecutionError, JobHandler},
    queue::QueueService,
    store::JobStore,
};

use super::{Job, JobId};

/// Runs a single claimed job and persists its outcome.
pub(crate) struct JobRunner<S> {
    queue: QueueService<S>,
    handler: Arc<dyn JobHandler>,
}

impl<S> JobRunner<S>
where
    S: JobStore,
{
    pub(crate) fn new(queue: QueueService<S>, handler: Arc<dyn JobHandler>) -> Self {
        Self { queue, handler }
    }

    /// The handler runs on its own task, so a panic is reported as a failed attempt.
    #[instrument(skip(self, job), fields(job_id = %job.id, name = %job.name))]
    pub(crate) async fn execute_job(&self, job: Job) {
        let job_id = job.id;
        let handler = self.handler.clone();
        let timeout = handler.timeout();

        tracing::debug!(%job_id, "Executing job {job_id}");
        let result = tokio::spawn(
            async move {
                match timeout {
                    Some(timeout) => tokio::time::timeout(timeout, handler.handle(job))
                        .await
                        .unwrap_or_else(|_elapsed| Err(ExecutionError::timeout(timeout))),
                    None => handler.handle(job).await,
                }
            }
            .in_current_span(),
        )
        .await;

        match result {
            Ok(Ok(output)) => self.handle_job_complete(job_id, output).await,
            Ok(Err(error)) => self.handle_job_error(job_id, error).await,
            Err(error) => self.handle_job_error(job_id, error.into()).await,
        }
    }

    async fn handle_job_complete(&self, job_id: JobId, output: serde_json::Value) {
        tracing::debug!(%job_id, "Job complete {job_id}");
        let result = (!output.is_null()).then_some(output);
        let _ = self
            .queue
            .complete_job(job_id, result)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to mark job {job_id} as complete, error: {err:?}",
                )
            });
    }

    async fn handle_job_error(&self, job_id: JobId, error: ExecutionError) {
        tracing::debug!(
            %job_id,
            error_type = %error.error_type,
            "Job {job_id} failed: {}",
            error.message
        );
        let _ = self
            .queue
            .fail_job(job_id, &error)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to mark job {job_id} as failed, error: {err:?}",
                )
            });
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;
    use crate::{
        executor::{
            test::{MockExecutionResult, MockReturnExecutor},
            ExecutorHandler,
        },
        job::{JobOptions, JobStatus},
        store::memory::InMemoryStore,
    };

    async fn run(data: MockExecutionResult) -> Job {
        let queue = QueueService::new(InMemoryStore::new());
        let runner = JobRunner::new(queue.clone(), Arc::new(ExecutorHandler::new(MockReturnExecutor)));
        let job = queue
            .add_job(
                "mock_executor",
                serde_json::to_value(data).unwrap(),
                JobOptions::default().with_max_attempts(2),
            )
            .await
            .unwrap();
        let claimed = queue.claim_next(None).await.unwrap().unwrap();

        runner.execute_job(claimed).await;

        queue.get_job(job.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn success_completes_job() {
        let job = run(MockExecutionResult::Done {
            output: "hello".to_owned(),
        })
        .await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!("hello")));
    }

    #[tokio::test]
    async fn error_fails_attempt() {
        let job = run(MockExecutionResult::Error {
            message: "bad input".to_owned(),
        })
        .await;

        assert_eq!(job.status, JobStatus::Delayed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.failure_reason.as_deref(), Some("bad input"));
    }

    #[tokio::test]
    async fn panic_fails_attempt() {
        let job = run(MockExecutionResult::Panic).await;

        assert_eq!(job.status, JobStatus::Delayed);
        assert_eq!(job.failure_reason.as_deref(), Some("job panicked"));
    }

    #[tokio::test]
    async fn timeout_fails_attempt() {
        let job = run(MockExecutionResult::Timeout).await;

        assert_eq!(job.status, JobStatus::Delayed);
        assert!(job
            .failure_reason
            .is_some_and(|reason| reason.starts_with("Job failed to complete within timeout")));
    }
}
