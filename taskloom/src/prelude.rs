//! The purpose of this module is to alleviate the need to import many of the `[taskloom]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use taskloom::prelude::*;
//! ```
pub use crate::backoff::{BackoffStrategy, Jitter, RetryPolicy, Strategy};
pub use crate::channel::{queue::QueueClient, ActionRouter, ChannelConfig, ControlChannel};
pub use crate::executor::{handler_fn, ExecutionError, Executor, JobHandler};
pub use crate::job::{Job, JobId, JobLog, JobOptions, JobStatus, LogLevel};
pub use crate::process::{HostClient, WorkerProcess};
pub use crate::queue::{NewJob, QueueEvent, QueueService, QueueStats};
pub use crate::supervisor::{ProcessSupervisor, SupervisorConfig};
pub use crate::worker::WorkerConfig;
pub use crate::{Taskloom, TaskloomError};
