//! Job handlers.
//!
//! An [`Executor`] is a typed handler bound to a partition of the queue through its
//! [`Executor::NAME`]. The worker loop drives handlers through the object safe [`JobHandler`],
//! executors are adapted with [`ExecutorHandler`].
use std::{error::Error, fmt::Display, marker::PhantomData, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::TimeDelta;
use serde::{de::DeserializeOwned, Serialize};
use tokio::task::JoinError;

use crate::job::{builder::JobBuilder, Job};

/// A typed execution unit.
///
/// ```
/// # use taskloom::prelude::*;
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
/// ```
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// The payload of the jobs.
    ///
    /// If this is not needed it can be set to unit `()`.
    type Data: Serialize + DeserializeOwned + Send + 'static;
    /// Stored as the job's result on success.
    type Output: Serialize + Send + 'static;
    /// The name of the executor.
    ///
    /// This is the name of the jobs handled by this executor. It should be unique per store.
    const NAME: &'static str;
    /// The maximum number of attempts for a job before it is marked as failed.
    ///
    /// When enqueuing any given job this can be overridden via [`JobBuilder::with_max_attempts`].
    const MAX_ATTEMPTS: u32 = 3;

    async fn execute(&self, job: Job<Self::Data>) -> Result<Self::Output, ExecutionError>;

    /// An optional bound on the execution time of a single attempt.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn builder() -> JobBuilder<Self>
    where
        Self: Sized,
    {
        JobBuilder::default()
    }
}

/// The untyped handler interface used by the worker loop.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// The partition served by this handler.
    fn name(&self) -> &str;

    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Run the job returning the value to store as its result.
    async fn handle(&self, job: Job) -> Result<serde_json::Value, ExecutionError>;
}

/// Adapts an [`Executor`] into a [`JobHandler`].
pub struct ExecutorHandler<E> {
    executor: Arc<E>,
}

impl<E: Executor> ExecutorHandler<E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor: Arc::new(executor),
        }
    }
}

impl<E: Executor> From<E> for ExecutorHandler<E> {
    fn from(executor: E) -> Self {
        Self::new(executor)
    }
}

#[async_trait]
impl<E: Executor> JobHandler for ExecutorHandler<E> {
    fn name(&self) -> &str {
        E::NAME
    }

    fn timeout(&self) -> Option<Duration> {
        self.executor.timeout()
    }

    async fn handle(&self, job: Job) -> Result<serde_json::Value, ExecutionError> {
        let job = job.decode::<E::Data>().map_err(ExecutionError::decode)?;
        let output = self.executor.execute(job).await?;
        serde_json::to_value(output).map_err(|error| ExecutionError::from_error(&error))
    }
}

/// A handler built from a closure, useful for handlers that do not need a typed payload.
pub struct FnHandler<F, Fut> {
    name: String,
    timeout: Option<Duration>,
    f: F,
    _future: PhantomData<fn() -> Fut>,
}

/// Builds a [`JobHandler`] from an async closure.
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> FnHandler<F, Fut>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<serde_json::Value, ExecutionError>> + Send + 'static,
{
    FnHandler {
        name: name.into(),
        timeout: None,
        f,
        _future: PhantomData,
    }
}

impl<F, Fut> FnHandler<F, Fut> {
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self
        }
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F, Fut>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<serde_json::Value, ExecutionError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn handle(&self, job: Job) -> Result<serde_json::Value, ExecutionError> {
        (self.f)(job).await
    }
}

/// The kind of failure of a job attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorType {
    Panic,
    Timeout,
    /// The payload could not be decoded into the executor's data type.
    Decode,
    /// The job was active for longer than the stalled job timeout.
    Stalled,
    Other(String),
}

impl Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Panic => f.write_str("panic"),
            Self::Timeout => f.write_str("timeout"),
            Self::Decode => f.write_str("decode"),
            Self::Stalled => f.write_str("stalled"),
            Self::Other(error_type) => f.write_str(error_type),
        }
    }
}

/// The failure of a job attempt, persisted as the job's failure reason and stacktrace.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error_type}: {message}")]
pub struct ExecutionError {
    pub error_type: ErrorType,
    pub message: String,
    pub stacktrace: Option<String>,
}

impl ExecutionError {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
            stacktrace: None,
        }
    }

    pub fn with_stacktrace(self, stacktrace: impl Into<String>) -> Self {
        Self {
            stacktrace: Some(stacktrace.into()),
            ..self
        }
    }

    /// Captures an error along with its chain of sources.
    pub fn from_error<E: Error + ?Sized>(error: &E) -> Self {
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        let error = Self::new(ErrorType::Other("error".to_owned()), error.to_string());
        if chain.is_empty() {
            error
        } else {
            error.with_stacktrace(chain.join("\n"))
        }
    }

    pub fn decode(error: serde_json::Error) -> Self {
        Self::new(ErrorType::Decode, format!("Failed to decode job data: {error}"))
    }

    pub fn timeout(timeout: Duration) -> Self {
        Self::new(
            ErrorType::Timeout,
            format!("Job failed to complete within timeout: {timeout:?}"),
        )
    }

    pub fn stalled(stalled_after: TimeDelta) -> Self {
        Self::new(
            ErrorType::Stalled,
            format!("Job stalled, active for more than {stalled_after}"),
        )
    }
}

impl From<String> for ExecutionError {
    fn from(message: String) -> Self {
        Self::new(ErrorType::Other("error".to_owned()), message)
    }
}

impl From<&str> for ExecutionError {
    fn from(message: &str) -> Self {
        message.to_owned().into()
    }
}

impl From<JoinError> for ExecutionError {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self::new(ErrorType::Panic, message)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use assert_matches::assert_matches;
    use serde::{Deserialize, Serialize};

    use super::*;

    pub(crate) struct SimpleExecutor;

    #[async_trait]
    impl Executor for SimpleExecutor {
        type Data = String;
        type Output = ();
        const NAME: &'static str = "simple_executor";
        const MAX_ATTEMPTS: u32 = 2;

        async fn execute(&self, _job: Job<Self::Data>) -> Result<Self::Output, ExecutionError> {
            Ok(())
        }
    }

    pub(crate) struct MockReturnExecutor;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub(crate) enum MockExecutionResult {
        Done { output: String },
        Panic,
        Timeout,
        Error { message: String },
    }

    #[async_trait]
    impl Executor for MockReturnExecutor {
        type Data = MockExecutionResult;
        type Output = String;
        const NAME: &'static str = "mock_executor";
        const MAX_ATTEMPTS: u32 = 2;

        async fn execute(&self, job: Job<Self::Data>) -> Result<Self::Output, ExecutionError> {
            match job.data {
                MockExecutionResult::Done { output } => Ok(output),
                MockExecutionResult::Panic => panic!("job panicked"),
                MockExecutionResult::Timeout => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok("too late".to_owned())
                }
                MockExecutionResult::Error { message } => Err(message.into()),
            }
        }

        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_millis(50))
        }
    }

    #[tokio::test]
    async fn executor_handler_serializes_output() {
        let handler = ExecutorHandler::new(MockReturnExecutor);
        let mut job = Job::raw_job();
        job.data = serde_json::to_value(MockExecutionResult::Done {
            output: "hello".to_owned(),
        })
        .unwrap();

        let output = handler.handle(job).await.unwrap();

        assert_eq!(output, serde_json::json!("hello"));
        assert_eq!(handler.name(), "mock_executor");
        assert_eq!(handler.timeout(), Some(Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn executor_handler_reports_undecodable_data() {
        let handler = ExecutorHandler::new(SimpleExecutor);
        let mut job = Job::raw_job();
        job.data = serde_json::json!({"not": "a string"});

        let error = handler.handle(job).await.unwrap_err();

        assert_eq!(error.error_type, ErrorType::Decode);
    }

    #[tokio::test]
    async fn unit_output_is_null() {
        let handler = ExecutorHandler::new(SimpleExecutor);
        let mut job = Job::raw_job();
        job.data = serde_json::json!("data");

        assert_matches!(handler.handle(job).await, Ok(serde_json::Value::Null));
    }

    #[tokio::test]
    async fn panics_become_execution_errors() {
        let error: ExecutionError = tokio::spawn(async { panic!("boom") })
            .await
            .unwrap_err()
            .into();

        assert_eq!(error.error_type, ErrorType::Panic);
        assert_eq!(error.message, "boom");
    }

    #[test]
    fn from_error_keeps_source_chain() {
        #[derive(Debug, thiserror::Error)]
        #[error("outer")]
        struct Outer(#[source] std::io::Error);

        let error = ExecutionError::from_error(&Outer(std::io::Error::other("inner")));

        assert_eq!(error.message, "outer");
        assert_eq!(error.stacktrace.as_deref(), Some("caused by: inner"));
        assert_eq!(error.to_string(), "error: outer");
    }

    #[tokio::test]
    async fn handler_fn_runs_closure() {
        let handler = handler_fn("echo", |job: Job| async move { Ok(job.data) })
            .with_timeout(Duration::from_secs(1));
        let mut job = Job::raw_job();
        job.data = serde_json::json!([1, 2]);

        assert_eq!(handler.name(), "echo");
        assert_eq!(handler.timeout(), Some(Duration::from_secs(1)));
        assert_eq!(handler.handle(job).await.unwrap(), serde_json::json!([1, 2]));
    }
}
