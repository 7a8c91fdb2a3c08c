//! Control channel to a worker process
//!
//! Requests carry a monotonically increasing id and are correlated with their
//! responses through a pending map, so responses may arrive in any order.
//! Unsolicited notifications are dispatched by target id to the handlers that
//! entities register for themselves.
//!
//! All frame writes go through one writer task; any number of requests may be
//! awaiting their responses at the same time.

use crate::error::{Error, Result};
use crate::message::{IncomingMessage, Internal, Method, NotificationFrame, RequestFrame, ResponseFrame};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Handler invoked with `(event, data)` for notifications addressed to one target
pub type NotificationHandler = Arc<dyn Fn(&str, &Value) + Send + Sync>;

struct PendingRequest {
    method: Method,
    tx: oneshot::Sender<Result<Value>>,
}

#[derive(Default)]
struct ChannelState {
    next_id: u32,
    pending: HashMap<u32, PendingRequest>,
    closed: bool,
}

struct Inner {
    state: Mutex<ChannelState>,
    outgoing: mpsc::UnboundedSender<Bytes>,
    subscribers: DashMap<String, Vec<NotificationHandler>>,
    severed: CancellationToken,
}

/// Request/notification channel shared by every entity of one worker
#[derive(Clone)]
pub struct ControlChannel {
    inner: Arc<Inner>,
}

impl ControlChannel {
    /// Start the reader and writer tasks over an already connected byte stream
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::new_with(reader, writer, |_| ()).0
    }

    /// Like [`ControlChannel::new`], but `before_read` runs before the reader
    /// task starts, so handlers it subscribes see the very first frame.
    pub fn new_with<R, W, T>(reader: R, writer: W, before_read: impl FnOnce(&Self) -> T) -> (Self, T)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outgoing, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            state: Mutex::new(ChannelState::default()),
            outgoing,
            subscribers: DashMap::new(),
            severed: CancellationToken::new(),
        });

        tokio::spawn(write_loop(
            FramedWrite::new(writer, LengthDelimitedCodec::new()),
            rx,
            inner.severed.clone(),
        ));

        let channel = Self { inner };
        let subscribed = before_read(&channel);
        tokio::spawn(read_loop(
            FramedRead::new(reader, LengthDelimitedCodec::new()),
            Arc::downgrade(&channel.inner),
        ));

        (channel, subscribed)
    }

    /// Send a request and wait for its response.
    ///
    /// Fails immediately once the channel is closed. There is no timeout and
    /// no retry: the request is written at most once.
    pub async fn request(&self, method: Method, internal: Internal, data: Value) -> Result<Value> {
        let (tx, rx) = oneshot::channel();

        let id = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::ChannelClosed);
            }
            state.next_id = state.next_id.wrapping_add(1);
            let id = state.next_id;
            state.pending.insert(id, PendingRequest { method, tx });
            id
        };

        let frame = RequestFrame {
            id,
            method: method.as_str().to_string(),
            internal,
            data,
        };
        let bytes = match serde_json::to_vec(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.inner.state.lock().pending.remove(&id);
                return Err(e.into());
            }
        };
        if self.inner.outgoing.send(Bytes::from(bytes)).is_err() {
            self.inner.state.lock().pending.remove(&id);
            return Err(Error::ChannelClosed);
        }

        trace!(id, method = %method, "request sent");

        rx.await.unwrap_or(Err(Error::ChannelClosed))
    }

    /// Fire-and-forget request. Failures are logged, never returned.
    pub fn request_detached(&self, method: Method, internal: Internal, data: Value) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(method = %method, "no runtime available, dropping detached request");
            return;
        };
        let channel = self.clone();
        handle.spawn(async move {
            match channel.request(method, internal, data).await {
                Ok(_) => {}
                Err(e @ (Error::ChannelClosed | Error::WorkerFailure(_))) => {
                    debug!(method = %method, error = %e, "detached request dropped");
                }
                Err(e) => warn!(method = %method, error = %e, "detached request failed"),
            }
        });
    }

    /// Register a notification handler for `target_id`
    pub fn subscribe(&self, target_id: impl Into<String>, handler: NotificationHandler) {
        self.inner
            .subscribers
            .entry(target_id.into())
            .or_default()
            .push(handler);
    }

    /// Remove every handler registered for `target_id`
    pub fn unsubscribe(&self, target_id: &str) {
        self.inner.subscribers.remove(target_id);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Number of requests still waiting for a response
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Token cancelled when the read or write side of the stream breaks
    #[must_use]
    pub fn severed(&self) -> CancellationToken {
        self.inner.severed.clone()
    }

    /// Refuse further requests and fail pending ones with `ChannelClosed`
    pub fn close(&self) {
        self.inner.shut(|| Error::ChannelClosed);
    }

    /// The worker is gone: fail every pending request with `WorkerFailure`.
    /// Returns false if the channel was already closed.
    pub fn fail(&self, reason: &str) -> bool {
        self.inner.shut(|| Error::WorkerFailure(reason.to_string()))
    }
}

impl Inner {
    fn shut(&self, error: impl Fn() -> Error) -> bool {
        let pending = {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
            std::mem::take(&mut state.pending)
        };

        if !pending.is_empty() {
            debug!(count = pending.len(), "failing pending requests");
        }
        for (_, request) in pending {
            let _ = request.tx.send(Err(error()));
        }
        true
    }

    fn handle_frame(&self, bytes: &[u8]) {
        match serde_json::from_slice::<IncomingMessage>(bytes) {
            Ok(IncomingMessage::Response(response)) => self.complete(response),
            Ok(IncomingMessage::Notification(notification)) => self.dispatch(notification),
            Err(e) => warn!(error = %e, "dropping malformed frame from worker"),
        }
    }

    fn complete(&self, response: ResponseFrame) {
        let Some(request) = self.state.lock().pending.remove(&response.id) else {
            warn!(id = response.id, "response for unknown request");
            return;
        };

        let result = if let Some(error) = response.error {
            Err(Error::Protocol {
                method: request.method.as_str().to_string(),
                reason: response.reason.unwrap_or(error),
            })
        } else if response.accepted {
            Ok(response.data)
        } else {
            Err(Error::Protocol {
                method: request.method.as_str().to_string(),
                reason: "request not accepted".to_string(),
            })
        };

        trace!(id = response.id, method = %request.method, ok = result.is_ok(), "response received");
        let _ = request.tx.send(result);
    }

    fn dispatch(&self, notification: NotificationFrame) {
        // Clone the handlers out so none runs while the map shard is locked
        let handlers = self
            .subscribers
            .get(&notification.target_id)
            .map(|entry| entry.value().clone());

        match handlers {
            Some(handlers) => {
                for handler in handlers {
                    handler(&notification.event, &notification.data);
                }
            }
            None => debug!(
                target_id = %notification.target_id,
                event = %notification.event,
                "notification for unknown target"
            ),
        }
    }
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, LengthDelimitedCodec>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    severed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if let Err(e) = sink.send(frame).await {
            warn!(error = %e, "control channel write failed");
            severed.cancel();
            return;
        }
    }
    debug!("control channel writer stopped");
}

async fn read_loop<R>(mut stream: FramedRead<R, LengthDelimitedCodec>, inner: Weak<Inner>)
where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = stream.next().await {
        let Some(channel) = inner.upgrade() else {
            return;
        };
        match frame {
            Ok(bytes) => channel.handle_frame(&bytes),
            Err(e) => {
                warn!(error = %e, "control channel read failed");
                break;
            }
        }
    }

    if let Some(channel) = inner.upgrade() {
        channel.shut(|| Error::WorkerFailure("control channel severed".to_string()));
        channel.severed.cancel();
    }
    debug!("control channel reader stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::NotificationFrame;
    use serde_json::json;
    use tokio::io::DuplexStream;

    type WorkerSide = (
        FramedRead<tokio::io::ReadHalf<DuplexStream>, LengthDelimitedCodec>,
        FramedWrite<tokio::io::WriteHalf<DuplexStream>, LengthDelimitedCodec>,
    );

    fn channel_pair() -> (ControlChannel, WorkerSide) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(ours);
        let channel = ControlChannel::new(read, write);
        let (their_read, their_write) = tokio::io::split(theirs);
        (
            channel,
            (
                FramedRead::new(their_read, LengthDelimitedCodec::new()),
                FramedWrite::new(their_write, LengthDelimitedCodec::new()),
            ),
        )
    }

    async fn next_request(
        reader: &mut FramedRead<tokio::io::ReadHalf<DuplexStream>, LengthDelimitedCodec>,
    ) -> RequestFrame {
        let bytes = reader.next().await.unwrap().unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn send_json(
        writer: &mut FramedWrite<tokio::io::WriteHalf<DuplexStream>, LengthDelimitedCodec>,
        value: &impl serde::Serialize,
    ) {
        writer
            .send(Bytes::from(serde_json::to_vec(value).unwrap()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_responses_match_their_requests() {
        let (channel, (mut reader, mut writer)) = channel_pair();

        let first = tokio::spawn({
            let channel = channel.clone();
            async move {
                channel
                    .request(Method::RouterDump, Internal::default(), json!({"n": 1}))
                    .await
            }
        });
        let req1 = next_request(&mut reader).await;

        let second = tokio::spawn({
            let channel = channel.clone();
            async move {
                channel
                    .request(Method::RouterDump, Internal::default(), json!({"n": 2}))
                    .await
            }
        });
        let req2 = next_request(&mut reader).await;
        assert!(req2.id > req1.id);

        send_json(&mut writer, &ResponseFrame::accepted(req2.id, req2.data.clone())).await;
        send_json(&mut writer, &ResponseFrame::accepted(req1.id, req1.data.clone())).await;

        assert_eq!(first.await.unwrap().unwrap(), json!({"n": 1}));
        assert_eq!(second.await.unwrap().unwrap(), json!({"n": 2}));
        assert_eq!(channel.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_error_response_becomes_protocol_error() {
        let (channel, (mut reader, mut writer)) = channel_pair();

        let pending = tokio::spawn({
            let channel = channel.clone();
            async move {
                channel
                    .request(Method::TransportConnect, Internal::default(), Value::Null)
                    .await
            }
        });
        let req = next_request(&mut reader).await;
        assert_eq!(req.method, "transport.connect");
        send_json(&mut writer, &ResponseFrame::rejected(req.id, "Error", "already connected")).await;

        match pending.await.unwrap() {
            Err(Error::Protocol { method, reason }) => {
                assert_eq!(method, "transport.connect");
                assert_eq!(reason, "already connected");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_worker_death_fails_every_pending_request() {
        let (channel, (mut reader, writer)) = channel_pair();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let channel = channel.clone();
            handles.push(tokio::spawn(async move {
                channel
                    .request(Method::WorkerDump, Internal::default(), Value::Null)
                    .await
            }));
        }
        for _ in 0..5 {
            next_request(&mut reader).await;
        }

        drop(reader);
        drop(writer);

        for handle in handles {
            let result = handle.await.unwrap();
            assert!(matches!(result, Err(Error::WorkerFailure(_))), "{result:?}");
        }
        assert!(channel.is_closed());
        channel.severed().cancelled().await;

        let late = channel
            .request(Method::WorkerDump, Internal::default(), Value::Null)
            .await;
        assert!(matches!(late, Err(Error::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_explicit_fail_is_reported_once() {
        let (channel, _worker) = channel_pair();
        assert!(channel.fail("process exited"));
        assert!(!channel.fail("process exited"));
        assert!(matches!(
            channel.request(Method::WorkerDump, Internal::default(), Value::Null).await,
            Err(Error::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_notifications_dispatch_by_target() {
        let (channel, (_reader, mut writer)) = channel_pair();
        let (tx, mut rx) = mpsc::unbounded_channel();

        channel.subscribe(
            "producer-1",
            Arc::new(move |event: &str, data: &Value| {
                let _ = tx.send((event.to_string(), data.clone()));
            }),
        );

        for target in ["nobody", "producer-1"] {
            let frame = NotificationFrame {
                target_id: target.to_string(),
                event: "score".to_string(),
                data: json!([{"score": 10}]),
            };
            send_json(&mut writer, &frame).await;
        }
        send_json(&mut writer, &json!({"garbage": true})).await;

        let (event, data) = rx.recv().await.unwrap();
        assert_eq!(event, "score");
        assert_eq!(data, json!([{"score": 10}]));

        channel.unsubscribe("producer-1");
        let frame = NotificationFrame {
            target_id: "producer-1".to_string(),
            event: "score".to_string(),
            data: Value::Null,
        };
        send_json(&mut writer, &frame).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        assert!(!channel.is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_first_frame_reaches_handler_subscribed_before_read() {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (their_read, their_write) = tokio::io::split(theirs);
        let _their_read = FramedRead::new(their_read, LengthDelimitedCodec::new());
        let mut writer = FramedWrite::new(their_write, LengthDelimitedCodec::new());

        // already buffered when the reader task starts
        let frame = NotificationFrame {
            target_id: "4242".to_string(),
            event: "running".to_string(),
            data: Value::Null,
        };
        send_json(&mut writer, &frame).await;

        let (read, write) = tokio::io::split(ours);
        let (_channel, mut rx) = ControlChannel::new_with(read, write, |channel| {
            let (tx, rx) = mpsc::unbounded_channel();
            channel.subscribe(
                "4242",
                Arc::new(move |event: &str, _data: &Value| {
                    let _ = tx.send(event.to_string());
                }),
            );
            rx
        });

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(event.as_deref(), Some("running"));
    }
}
