//! A persistent job queue with a worker runtime and an isolated, supervised worker process.
//!
//! Jobs are held in a [`store::JobStore`] and managed through a [`queue::QueueService`]. A
//! [`Taskloom`] runtime runs one [`worker::WorkerLoop`] per registered executor. The worker
//! runtime usually lives in its own process, started and restarted by a
//! [`supervisor::ProcessSupervisor`] and driven over a [`channel::ControlChannel`].
use std::sync::Arc;

use executor::{Executor, ExecutorHandler, JobHandler};
use fxhash::FxHashMap;
use queue::{QueueError, QueueService};
use store::{JobStore, StoreError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use worker::{WorkerConfig, WorkerLoop};

pub mod backoff;
pub mod channel;
pub mod executor;
pub mod job;
pub mod prelude;
pub mod process;
pub mod queue;
pub mod store;
pub mod supervisor;
pub mod worker;

/// The worker runtime: one worker loop per registered handler, all sharing one queue.
///
/// ```
/// # use taskloom::prelude::*;
/// # use taskloom::store::memory::InMemoryStore;
/// # use async_trait::async_trait;
/// struct Greeter;
///
/// #[async_trait]
/// impl Executor for Greeter {
///     type Data = String;
///     type Output = String;
///     const NAME: &'static str = "greet";
///
///     async fn execute(&self, job: Job<Self::Data>) -> Result<Self::Output, ExecutionError> {
///         Ok(format!("Hello {}", job.data))
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), TaskloomError> {
/// let runtime = Taskloom::new(QueueService::new(InMemoryStore::new())).with_executor(Greeter);
/// Greeter::builder()
///     .with_data("world".to_owned())
///     .enqueue(runtime.queue())
///     .await?;
/// runtime.graceful_shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct Taskloom<S: JobStore> {
    queue: QueueService<S>,
    config: WorkerConfig,
    workers: FxHashMap<String, WorkerHandle>,
}

impl<S> Default for Taskloom<S>
where
    S: JobStore + Default,
{
    fn default() -> Self {
        Self::new(QueueService::new(S::default()))
    }
}

#[derive(Debug)]
struct WorkerHandle {
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    async fn graceful_shutdown(&mut self) -> Result<(), TaskloomError> {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|_| TaskloomError::GracefulShutdownFailed)?;
        }
        Ok(())
    }
}

impl<S> Taskloom<S>
where
    S: JobStore,
{
    pub fn new(queue: QueueService<S>) -> Self {
        Self {
            queue,
            config: WorkerConfig::default(),
            workers: Default::default(),
        }
    }

    /// The configuration of the worker loops registered after this call.
    pub fn with_config(self, config: WorkerConfig) -> Self {
        Self { config, ..self }
    }

    pub fn with_executor<E: Executor>(self, executor: E) -> Self {
        self.with_handler(Arc::new(ExecutorHandler::new(executor)))
    }

    /// Start a worker loop for the partition of `handler`.
    ///
    /// A partition is served by a single handler, later registrations for the same name are
    /// ignored.
    pub fn with_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        let name = handler.name().to_owned();
        if self.workers.contains_key(&name) {
            tracing::warn!(%name, "A handler for {name} is already registered");
            return self;
        }

        let shutdown = CancellationToken::new();
        let worker = WorkerLoop::new(self.queue.clone(), handler, self.config);
        let handle = tokio::spawn(worker.run(shutdown.clone()));
        tracing::debug!(%name, "Registered handler for {name}");

        self.workers.insert(
            name,
            WorkerHandle {
                shutdown,
                handle: Some(handle),
            },
        );
        self
    }

    pub fn queue(&self) -> &QueueService<S> {
        &self.queue
    }

    /// The partitions with a running worker loop.
    pub fn partitions(&self) -> impl Iterator<Item = &str> {
        self.workers.keys().map(String::as_str)
    }

    /// Stop every worker loop once its current job has finished.
    pub async fn graceful_shutdown(mut self) -> Result<(), TaskloomError> {
        tracing::debug!("Shutting down taskloom workers");
        futures::future::join_all(
            self.workers
                .values_mut()
                .map(WorkerHandle::graceful_shutdown),
        )
        .await
        .into_iter()
        .collect()
    }
}

#[derive(Debug, Error)]
pub enum TaskloomError {
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
    #[error("Queue operation failed")]
    Queue(#[from] QueueError),
    #[error("Error communicating with the store")]
    Store(#[from] StoreError),
    #[error("Error encoding or decoding value")]
    Encode(#[from] serde_json::Error),
    #[error("Control channel failure")]
    Channel(#[from] channel::ChannelError),
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::{
        executor::{handler_fn, test::SimpleExecutor},
        job::{Job, JobOptions, JobStatus},
        store::memory::InMemoryStore,
    };

    #[tokio::test]
    async fn setup() {
        let runtime = Taskloom::<InMemoryStore>::default().with_executor(SimpleExecutor);

        assert_eq!(runtime.partitions().collect::<Vec<_>>(), vec!["simple_executor"]);
        runtime.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_partitions_are_ignored() {
        let runtime = Taskloom::<InMemoryStore>::default()
            .with_executor(SimpleExecutor)
            .with_executor(SimpleExecutor);

        assert_eq!(runtime.partitions().count(), 1);
        runtime.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn runs_jobs_of_each_partition() {
        let runtime = Taskloom::new(QueueService::new(InMemoryStore::new()))
            .with_config(WorkerConfig::new().with_poll_interval(Duration::from_millis(10)))
            .with_executor(SimpleExecutor)
            .with_handler(Arc::new(handler_fn("double", |job: Job| async move {
                let value: i64 = serde_json::from_value(job.data).map_err(|error| {
                    executor::ExecutionError::from_error(&error)
                })?;
                Ok(json!(value * 2))
            })));
        let simple = SimpleExecutor::builder()
            .with_data("data".to_owned())
            .enqueue(runtime.queue())
            .await
            .unwrap();
        let double = runtime
            .queue()
            .add_job("double", json!(21), JobOptions::default())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while runtime.queue().get_queue_stats().await.unwrap().completed < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let simple = runtime.queue().get_job(simple.id).await.unwrap().unwrap();
        let double = runtime.queue().get_job(double.id).await.unwrap().unwrap();
        assert_eq!(simple.status, JobStatus::Completed);
        assert_eq!(simple.max_attempts, 2);
        assert_eq!(double.result, Some(json!(42)));
        runtime.graceful_shutdown().await.unwrap();
    }
}
