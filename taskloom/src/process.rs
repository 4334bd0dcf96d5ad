//! The entry point of the worker process.
//!
//! The worker process serves the queue commands on its stdin and stdout, runs a [`Taskloom`]
//! runtime and drains it when asked to shut down or when the host goes away.
use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::broadcast::{self, error::RecvError},
};
use tokio_util::sync::CancellationToken;

use crate::{
    channel::{
        queue::{queue_router, QUEUE_EVENT, SHUTDOWN},
        ActionRouter, BoxError, ChannelConfig, ChannelError, ControlChannel,
    },
    queue::{QueueEvent, QueueService},
    store::JobStore,
    worker::WorkerConfig,
    Taskloom, TaskloomError,
};

/// Calls the privileged actions served by the host.
#[derive(Clone)]
pub struct HostClient {
    channel: ControlChannel,
}

impl HostClient {
    pub fn new(channel: ControlChannel) -> Self {
        Self { channel }
    }

    pub async fn call<T, U>(&self, action: &str, payload: T) -> Result<U, ChannelError>
    where
        T: Serialize,
        U: DeserializeOwned,
    {
        self.channel.call(action, payload).await
    }

    pub fn notify<T: Serialize>(&self, action: &str, payload: T) -> Result<(), ChannelError> {
        self.channel.notify(action, payload)
    }
}

/// Builder and entry point of a worker process.
pub struct WorkerProcess<S: JobStore> {
    queue: QueueService<S>,
    worker_config: WorkerConfig,
    channel_config: ChannelConfig,
    router: ActionRouter,
    forward_events: bool,
}

impl<S: JobStore> WorkerProcess<S> {
    pub fn new(queue: QueueService<S>) -> Self {
        Self {
            queue,
            worker_config: WorkerConfig::default(),
            channel_config: ChannelConfig::default(),
            router: ActionRouter::new(),
            forward_events: false,
        }
    }

    /// Send every [`QueueEvent`] to the host as a `queueEvent` notification.
    pub fn with_event_forwarding(self) -> Self {
        Self {
            forward_events: true,
            ..self
        }
    }

    pub fn with_worker_config(self, worker_config: WorkerConfig) -> Self {
        Self {
            worker_config,
            ..self
        }
    }

    pub fn with_channel_config(self, channel_config: ChannelConfig) -> Self {
        Self {
            channel_config,
            ..self
        }
    }

    /// Actions served to the host next to the queue commands.
    pub fn with_actions(self, router: ActionRouter) -> Self {
        Self {
            router: self.router.merge(router),
            ..self
        }
    }

    /// Serve the host on stdin and stdout until shutdown.
    ///
    /// Logs must not be written to stdout.
    pub async fn run<F>(self, register: F) -> Result<(), TaskloomError>
    where
        F: FnOnce(Taskloom<S>, HostClient) -> Taskloom<S>,
    {
        self.serve(tokio::io::stdin(), tokio::io::stdout(), register)
            .await
    }

    /// Serve the host on `reader` and `writer` until shutdown.
    ///
    /// `register` adds the handlers to the runtime, they may keep the [`HostClient`] to call the
    /// host. Returns once the runtime has drained, after a `shutdown` request or once the host
    /// has closed its end.
    pub async fn serve<R, W, F>(self, reader: R, writer: W, register: F) -> Result<(), TaskloomError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        F: FnOnce(Taskloom<S>, HostClient) -> Taskloom<S>,
    {
        let shutdown = CancellationToken::new();
        let router = queue_router(&self.queue)
            .merge(self.router)
            .with_action(SHUTDOWN, {
                let shutdown = shutdown.clone();
                move |_| {
                    shutdown.cancel();
                    async { Ok::<_, BoxError>(serde_json::Value::Null) }
                }
            });
        // Subscribe before the first command is served.
        let events = self.forward_events.then(|| self.queue.subscribe());
        let channel = ControlChannel::spawn(reader, writer, router, self.channel_config);
        let stop_forwarding = CancellationToken::new();
        let forwarding = events.map(|events| {
            tokio::spawn(forward_events(
                events,
                channel.clone(),
                stop_forwarding.clone(),
            ))
        });
        let runtime = register(
            Taskloom::new(self.queue).with_config(self.worker_config),
            HostClient::new(channel.clone()),
        );
        tracing::info!(
            partitions = ?runtime.partitions().collect::<Vec<_>>(),
            "Worker process ready"
        );

        tokio::select! {
            _ = shutdown.cancelled() => tracing::info!("Shutdown requested"),
            _ = channel.closed() => tracing::info!("Host closed the control channel"),
        }

        let result = runtime.graceful_shutdown().await;
        stop_forwarding.cancel();
        if let Some(forwarding) = forwarding {
            let _ = forwarding.await;
        }
        channel.close();
        tracing::info!("Worker process stopped");
        result
    }
}

/// Notify the host of every event until `stop`, sending the events already emitted first.
async fn forward_events(
    mut events: broadcast::Receiver<QueueEvent>,
    channel: ControlChannel,
    stop: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            event = events.recv() => event,
            _ = stop.cancelled() => break,
        };
        match event {
            Ok(event) => {
                if let Err(error) = channel.notify(QUEUE_EVENT, &event) {
                    tracing::debug!(?error, "Stopped forwarding queue events: {error}");
                    break;
                }
            }
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Queue events were dropped before reaching the host");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use serde_json::json;
    use tokio::io::duplex;

    use super::*;
    use crate::{
        channel::queue::QueueClient,
        executor::{handler_fn, ExecutionError},
        job::{Job, JobOptions, JobStatus},
        store::memory::InMemoryStore,
    };

    #[tokio::test]
    async fn serves_queue_and_host_actions() {
        let queue = QueueService::new(InMemoryStore::new());
        let (host_writer, worker_reader) = duplex(64 * 1024);
        let (worker_writer, host_reader) = duplex(64 * 1024);
        let host_router = ActionRouter::new().with_action("getApiKey", |_| async {
            Ok::<_, BoxError>(json!("secret-key"))
        });
        let host = ControlChannel::spawn(host_reader, host_writer, host_router, ChannelConfig::new());
        let worker = tokio::spawn(
            WorkerProcess::new(queue.clone())
                .with_worker_config(WorkerConfig::new().with_poll_interval(Duration::from_millis(10)))
                .with_actions(ActionRouter::new().with_action("ping", |_| async {
                    Ok::<_, BoxError>(json!("pong"))
                }))
                .serve(worker_reader, worker_writer, |runtime, host| {
                    runtime.with_handler(std::sync::Arc::new(handler_fn(
                        "process-message",
                        move |_job: Job| {
                            let host = host.clone();
                            async move {
                                let key: String = host
                                    .call("getApiKey", ())
                                    .await
                                    .map_err(|error| ExecutionError::from_error(&error))?;
                                Ok(json!({ "key": key }))
                            }
                        },
                    )))
                }),
        );
        let client = QueueClient::new(host.clone());

        let pong: String = host.call("ping", ()).await.unwrap();
        assert_eq!(pong, "pong");
        let job = client
            .add_job("process-message", json!({}), JobOptions::default())
            .await
            .unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let report = client.get_job_status(job.id).await.unwrap().unwrap();
                if report.status == JobStatus::Completed {
                    break report;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(report.result, Some(json!({"key": "secret-key"})));

        client.shutdown().unwrap();
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        host.closed().await;
    }

    #[tokio::test]
    async fn forwards_queue_events_to_the_host() {
        let queue = QueueService::new(InMemoryStore::new());
        let (host_writer, worker_reader) = duplex(64 * 1024);
        let (worker_writer, host_reader) = duplex(64 * 1024);
        let (sender, mut received) = tokio::sync::mpsc::unbounded_channel();
        let host_router = ActionRouter::new().with_action(QUEUE_EVENT, move |payload| {
            let sender = sender.clone();
            async move {
                sender.send(serde_json::from_value::<QueueEvent>(payload)?)?;
                Ok::<_, BoxError>(serde_json::Value::Null)
            }
        });
        let host = ControlChannel::spawn(host_reader, host_writer, host_router, ChannelConfig::new());
        let worker = tokio::spawn(
            WorkerProcess::new(queue)
                .with_event_forwarding()
                .serve(worker_reader, worker_writer, |runtime, _| runtime),
        );
        let client = QueueClient::new(host.clone());

        let job = client
            .add_job("job", json!(null), JobOptions::default())
            .await
            .unwrap();
        client.pause_queue().await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.job_id(), Some(job.id));
        assert_eq!(event.name(), "job.added");
        let event = tokio::time::timeout(Duration::from_secs(5), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, QueueEvent::QueuePaused);

        client.shutdown().unwrap();
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn stops_when_host_goes_away() {
        let queue = QueueService::new(InMemoryStore::new());
        let (host_writer, worker_reader) = duplex(1024);
        let (worker_writer, _host_reader) = duplex(1024);
        let worker = tokio::spawn(WorkerProcess::new(queue).serve(
            worker_reader,
            worker_writer,
            |runtime, _| runtime,
        ));

        drop(host_writer);

        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
