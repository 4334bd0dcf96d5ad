//! Request/response RPC over a newline delimited JSON stream.
//!
//! Both ends of a [`ControlChannel`] can call actions served by the other end's
//! [`ActionRouter`]. Calls are correlated by a [`RequestId`] and bounded by a timeout.
//!
//! ```
//! # use taskloom::channel::{ActionRouter, BoxError, ChannelConfig, ControlChannel};
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (host_writer, worker_reader) = tokio::io::duplex(1024);
//! let (worker_writer, host_reader) = tokio::io::duplex(1024);
//!
//! let router = ActionRouter::new().with_action("ping", |_| async {
//!     Ok::<_, BoxError>(serde_json::json!("pong"))
//! });
//! let _worker = ControlChannel::spawn(worker_reader, worker_writer, router, ChannelConfig::new());
//! let host = ControlChannel::spawn(
//!     host_reader,
//!     host_writer,
//!     ActionRouter::new(),
//!     ChannelConfig::new(),
//! );
//!
//! let pong: String = host.call("ping", ()).await.unwrap();
//! assert_eq!(pong, "pong");
//! # }
//! ```
use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{FutureExt, SinkExt, StreamExt};
use fxhash::FxHashMap;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot},
};
use tokio_util::{
    codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError},
    sync::CancellationToken,
};

mod message;
pub mod queue;
mod router;

pub use message::{Message, Request, RequestId, Response};
pub use router::{ActionHandler, ActionResult, ActionRouter, BoxError};

/// Configuration of a [`ControlChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// How long [`ControlChannel::call`] waits for a response.
    pub call_timeout: Duration,
    /// Longest accepted line, longer lines are discarded.
    pub max_line_length: usize,
}

impl ChannelConfig {
    pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

    pub const fn new() -> Self {
        Self {
            call_timeout: Self::DEFAULT_CALL_TIMEOUT,
            max_line_length: Self::DEFAULT_MAX_LINE_LENGTH,
        }
    }

    pub const fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub const fn with_max_line_length(mut self, max_line_length: usize) -> Self {
        self.max_line_length = max_line_length;
        self
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The errors that can be returned by a [`ControlChannel`].
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Call to {action} timed out after {after:?}")]
    Timeout { action: String, after: Duration },
    #[error("Control channel closed")]
    Closed,
    #[error("Remote action failed: {0}")]
    Remote(String),
    #[error("Error encoding or decoding value")]
    Encode(#[from] serde_json::Error),
}

type Pending = Mutex<FxHashMap<RequestId, oneshot::Sender<Response>>>;

struct Inner {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Pending,
    config: ChannelConfig,
    /// Cancelled once the incoming stream has ended.
    closed: CancellationToken,
    /// Cancelled to stop writing and release the outgoing stream.
    stop_writing: CancellationToken,
}

/// One end of a control channel.
///
/// Cloning is cheap, all clones share the same stream.
#[derive(Clone)]
pub struct ControlChannel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel").finish_non_exhaustive()
    }
}

impl ControlChannel {
    /// Start serving `router` on `reader` and sending on `writer`.
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn<R, W>(reader: R, writer: W, router: ActionRouter, config: ChannelConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            outbound,
            pending: Default::default(),
            config,
            closed: CancellationToken::new(),
            stop_writing: CancellationToken::new(),
        });

        tokio::spawn(write_messages(
            FramedWrite::new(writer, LinesCodec::new()),
            receiver,
            inner.stop_writing.clone(),
        ));
        tokio::spawn(read_messages(
            FramedRead::new(
                reader,
                LinesCodec::new_with_max_length(config.max_line_length),
            ),
            inner.clone(),
            router,
        ));

        Self { inner }
    }

    /// Call `action` on the other end and decode its result.
    pub async fn call<T, U>(&self, action: &str, payload: T) -> Result<U, ChannelError>
    where
        T: Serialize,
        U: DeserializeOwned,
    {
        self.call_with_timeout(action, payload, self.inner.config.call_timeout)
            .await
    }

    pub async fn call_with_timeout<T, U>(
        &self,
        action: &str,
        payload: T,
        timeout: Duration,
    ) -> Result<U, ChannelError>
    where
        T: Serialize,
        U: DeserializeOwned,
    {
        let payload = serde_json::to_value(payload)?;
        let request_id = RequestId::new();
        let (sender, receiver) = oneshot::channel();
        self.pending()?.insert(request_id.clone(), sender);

        let request = Message::Request(Request {
            request_id: Some(request_id.clone()),
            action: action.to_owned(),
            payload,
        });
        if self.inner.closed.is_cancelled() || self.inner.outbound.send(request).is_err() {
            self.remove_pending(&request_id);
            return Err(ChannelError::Closed);
        }
        tracing::trace!(%request_id, action, "Request sent");

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(response)) => {
                let result = response.into_result().map_err(ChannelError::Remote)?;
                Ok(serde_json::from_value(result)?)
            }
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_elapsed) => {
                self.remove_pending(&request_id);
                tracing::warn!(%request_id, action, "Call to {action} timed out");
                Err(ChannelError::Timeout {
                    action: action.to_owned(),
                    after: timeout,
                })
            }
        }
    }

    /// Send a request that will not be answered.
    pub fn notify<T: Serialize>(&self, action: &str, payload: T) -> Result<(), ChannelError> {
        let request = Message::Request(Request {
            request_id: None,
            action: action.to_owned(),
            payload: serde_json::to_value(payload)?,
        });
        self.inner
            .outbound
            .send(request)
            .map_err(|_| ChannelError::Closed)
    }

    /// Stop writing, flushing what was already sent, which closes the outgoing stream.
    pub fn close(&self) {
        self.inner.stop_writing.cancel();
    }

    /// Resolves once the incoming stream has ended.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    #[cfg(test)]
    fn pending_calls(&self) -> usize {
        self.pending().map_or(0, |pending| pending.len())
    }

    fn pending(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, FxHashMap<RequestId, oneshot::Sender<Response>>>, ChannelError>
    {
        self.inner.pending.lock().map_err(|_| ChannelError::Closed)
    }

    fn remove_pending(&self, request_id: &RequestId) {
        if let Ok(mut pending) = self.pending() {
            pending.remove(request_id);
        }
    }
}

async fn write_messages<W>(
    mut sink: FramedWrite<W, LinesCodec>,
    mut receiver: mpsc::UnboundedReceiver<Message>,
    stop: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let message = tokio::select! {
            biased;
            message = receiver.recv() => message,
            _ = stop.cancelled() => {
                receiver.close();
                receiver.recv().await
            }
        };
        let Some(message) = message else {
            break;
        };
        let line = match serde_json::to_string(&message) {
            Ok(line) => line,
            Err(error) => {
                tracing::error!(?error, "Failed to encode message: {error}");
                continue;
            }
        };
        if let Err(error) = sink.send(line).await {
            tracing::warn!(?error, "Failed to write to control channel: {error}");
            break;
        }
    }
    let _ = SinkExt::<String>::close(&mut sink).await;
    tracing::debug!("Control channel writer stopped");
}

async fn read_messages<R>(
    mut stream: FramedRead<R, LinesCodec>,
    inner: Arc<Inner>,
    router: ActionRouter,
) where
    R: AsyncRead + Unpin,
{
    let router = Arc::new(router);
    while let Some(line) = stream.next().await {
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                tracing::warn!("Discarding control channel line exceeding the maximum length");
                continue;
            }
            Err(LinesCodecError::Io(error)) => {
                tracing::warn!(?error, "Failed to read from control channel: {error}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Message>(&line) {
            Ok(Message::Response(response)) => {
                let sender = inner
                    .pending
                    .lock()
                    .ok()
                    .and_then(|mut pending| pending.remove(&response.request_id));
                match sender {
                    Some(sender) => {
                        let _ = sender.send(response);
                    }
                    None => tracing::debug!(
                        request_id = %response.request_id,
                        "Dropping response to an unknown or expired request"
                    ),
                }
            }
            Ok(Message::Request(request)) => {
                tokio::spawn(handle_request(request, router.clone(), inner.clone()));
            }
            Err(error) => {
                tracing::warn!(?error, "Discarding malformed control channel message: {error}")
            }
        }
    }

    inner.closed.cancel();
    if let Ok(mut pending) = inner.pending.lock() {
        pending.clear();
    }
    tracing::debug!("Control channel reader stopped");
}

async fn handle_request(request: Request, router: Arc<ActionRouter>, inner: Arc<Inner>) {
    let Request {
        request_id,
        action,
        payload,
    } = request;
    let result = AssertUnwindSafe(router.dispatch(&action, payload))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            let message = panic_message(panic.as_ref());
            tracing::error!(%action, "Handler of {action} panicked: {message}");
            Err(format!("Handler panicked: {message}"))
        });
    match request_id {
        Some(request_id) => {
            let response = Message::Response(Response::new(request_id, result));
            if inner.outbound.send(response).is_err() {
                tracing::debug!(%action, "Control channel closed before responding");
            }
        }
        None => {
            if let Err(error) = result {
                tracing::warn!(%action, "Notification {action} failed: {error}");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause")
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use serde_json::json;
    use tokio::io::{duplex, DuplexStream};

    use super::*;

    fn pair(
        host_router: ActionRouter,
        worker_router: ActionRouter,
        config: ChannelConfig,
    ) -> (ControlChannel, ControlChannel) {
        let (host_writer, worker_reader): (DuplexStream, DuplexStream) = duplex(64 * 1024);
        let (worker_writer, host_reader) = duplex(64 * 1024);
        let host = ControlChannel::spawn(host_reader, host_writer, host_router, config);
        let worker = ControlChannel::spawn(worker_reader, worker_writer, worker_router, config);
        (host, worker)
    }

    fn worker_router() -> ActionRouter {
        ActionRouter::new()
            .with_action("add", |payload| async move {
                let (a, b): (i64, i64) = serde_json::from_value(payload)?;
                Ok::<_, BoxError>(json!(a + b))
            })
            .with_action("fail", |_| async {
                Err::<serde_json::Value, BoxError>("broken".into())
            })
            .with_action("panic", |payload| async move {
                if payload.is_null() {
                    panic!("handler exploded");
                }
                Ok::<_, BoxError>(payload)
            })
            .with_action("slow", |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, BoxError>(json!(null))
            })
    }

    #[tokio::test]
    async fn correlates_concurrent_calls() {
        let (host, _worker) = pair(ActionRouter::new(), worker_router(), ChannelConfig::new());

        let results: Vec<i64> = futures::future::join_all(
            (0..10_i64).map(|i| host.call::<_, i64>("add", (i, 100))),
        )
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

        assert_eq!(results, (100..110).collect::<Vec<_>>());
        assert_eq!(host.pending_calls(), 0);
    }

    #[tokio::test]
    async fn both_sides_can_call() {
        let host_router = ActionRouter::new()
            .with_action("secret", |_| async { Ok::<_, BoxError>(json!("s3cr3t")) });
        let (_host, worker) = pair(host_router, worker_router(), ChannelConfig::new());

        let secret: String = worker.call("secret", ()).await.unwrap();

        assert_eq!(secret, "s3cr3t");
    }

    #[tokio::test]
    async fn remote_errors_and_unknown_actions() {
        let (host, _worker) = pair(ActionRouter::new(), worker_router(), ChannelConfig::new());

        assert_matches!(
            host.call::<_, serde_json::Value>("fail", ()).await,
            Err(ChannelError::Remote(error)) if error == "broken"
        );
        assert_matches!(
            host.call::<_, serde_json::Value>("nope", ()).await,
            Err(ChannelError::Remote(error)) if error == "Unknown action: nope"
        );
    }

    #[tokio::test]
    async fn panicking_handler_is_a_remote_error() {
        let (host, _worker) = pair(ActionRouter::new(), worker_router(), ChannelConfig::new());

        let result = host.call::<_, serde_json::Value>("panic", ()).await;

        assert_matches!(
            result,
            Err(ChannelError::Remote(error)) if error == "Handler panicked: handler exploded"
        );
        assert_eq!(host.pending_calls(), 0);
        assert_eq!(host.call::<_, i64>("add", (1, 2)).await.unwrap(), 3);
        assert_eq!(
            host.call::<_, serde_json::Value>("panic", 1).await.unwrap(),
            json!(1)
        );
    }

    #[tokio::test]
    async fn call_times_out() {
        let config = ChannelConfig::new().with_call_timeout(Duration::from_millis(50));
        let (host, _worker) = pair(ActionRouter::new(), worker_router(), config);

        let result = host.call::<_, serde_json::Value>("slow", ()).await;

        assert_matches!(
            result,
            Err(ChannelError::Timeout { action, after })
                if action == "slow" && after == Duration::from_millis(50)
        );
        assert_eq!(host.pending_calls(), 0);
    }

    #[tokio::test]
    async fn notifications_are_not_answered() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let worker_router = ActionRouter::new().with_action("log", move |payload| {
            let sender = sender.clone();
            async move {
                sender.send(payload)?;
                Ok::<_, BoxError>(json!(null))
            }
        });
        let (host, _worker) = pair(ActionRouter::new(), worker_router, ChannelConfig::new());

        host.notify("log", json!({"line": 1})).unwrap();

        assert_eq!(receiver.recv().await, Some(json!({"line": 1})));
        assert_eq!(host.pending_calls(), 0);
    }

    #[tokio::test]
    async fn closing_fails_pending_calls() {
        let (host, worker) = pair(ActionRouter::new(), worker_router(), ChannelConfig::new());
        let call = tokio::spawn({
            let host = host.clone();
            async move { host.call::<_, serde_json::Value>("slow", ()).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        worker.close();

        assert_matches!(call.await.unwrap(), Err(ChannelError::Closed));
        host.closed().await;
        assert!(host.is_closed());
        assert_matches!(
            host.call::<_, serde_json::Value>("add", (1, 2)).await,
            Err(ChannelError::Closed)
        );
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let (mut raw_writer, worker_reader) = duplex(1024);
        let (worker_writer, raw_reader) = duplex(1024);
        let _worker = ControlChannel::spawn(
            worker_reader,
            worker_writer,
            worker_router(),
            ChannelConfig::new(),
        );

        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        raw_writer
            .write_all(b"not json\n\n{\"requestId\":\"7\",\"action\":\"add\",\"payload\":[2,3]}\n")
            .await
            .unwrap();
        let mut lines = BufReader::new(raw_reader).lines();
        let line = lines.next_line().await.unwrap().unwrap();

        assert_eq!(line, r#"{"requestId":"7","success":true,"result":5}"#);
    }

    #[tokio::test]
    async fn numeric_request_ids_are_answered_in_kind() {
        let (mut raw_writer, worker_reader) = duplex(1024);
        let (worker_writer, raw_reader) = duplex(1024);
        let _worker = ControlChannel::spawn(
            worker_reader,
            worker_writer,
            worker_router(),
            ChannelConfig::new(),
        );

        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        raw_writer
            .write_all(b"{\"requestId\":12,\"action\":\"add\",\"payload\":[4,5]}\n")
            .await
            .unwrap();
        let mut lines = BufReader::new(raw_reader).lines();
        let line = lines.next_line().await.unwrap().unwrap();

        assert_eq!(line, r#"{"requestId":12,"success":true,"result":9}"#);
    }
}
