//! Payload channel to a worker process
//!
//! Carries binary payloads (RTP/RTCP packets, SCTP messages). Every message is
//! a JSON notification frame immediately followed by one raw frame. Outgoing
//! pairs go through a single writer task as one unit so two notifications
//! never interleave; incoming frames are paired by adjacency.

use crate::message::{Internal, PayloadNotificationFrame};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, trace, warn};

/// Handler invoked with `(event, data, payload)` for one target
pub type PayloadHandler = Arc<dyn Fn(&str, &Value, &Bytes) + Send + Sync>;

struct Inner {
    outgoing: mpsc::UnboundedSender<(Bytes, Bytes)>,
    subscribers: DashMap<String, PayloadHandler>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct PayloadChannel {
    inner: Arc<Inner>,
}

impl PayloadChannel {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outgoing, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            outgoing,
            subscribers: DashMap::new(),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(write_loop(
            FramedWrite::new(writer, LengthDelimitedCodec::new()),
            rx,
        ));
        tokio::spawn(read_loop(
            FramedRead::new(reader, LengthDelimitedCodec::new()),
            Arc::downgrade(&inner),
        ));

        Self { inner }
    }

    /// Queue a notification and its payload. Dropped silently once closed.
    pub fn notify(&self, event: &str, internal: Internal, data: Value, payload: Bytes) {
        if self.is_closed() {
            trace!(event, "payload channel closed, dropping notification");
            return;
        }

        let frame = PayloadNotificationFrame {
            event: event.to_string(),
            target_id: None,
            internal: Some(internal),
            data,
        };
        let header = match serde_json::to_vec(&frame) {
            Ok(header) => Bytes::from(header),
            Err(e) => {
                warn!(event, error = %e, "failed to encode payload notification");
                return;
            }
        };

        if self.inner.outgoing.send((header, payload)).is_err() {
            debug!(event, "payload writer gone, dropping notification");
        }
    }

    /// Register the payload handler for `target_id`, replacing any previous one
    pub fn subscribe(&self, target_id: impl Into<String>, handler: PayloadHandler) {
        self.inner.subscribers.insert(target_id.into(), handler);
    }

    pub fn unsubscribe(&self, target_id: &str) {
        self.inner.subscribers.remove(target_id);
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl Inner {
    fn dispatch(&self, header: PayloadNotificationFrame, payload: &Bytes) {
        let Some(target_id) = header.target_id else {
            warn!(event = %header.event, "payload notification without target");
            return;
        };
        let handler = self
            .subscribers
            .get(&target_id)
            .map(|entry| Arc::clone(entry.value()));

        match handler {
            Some(handler) => handler(&header.event, &header.data, payload),
            None => debug!(
                target_id = %target_id,
                event = %header.event,
                "payload notification for unknown target"
            ),
        }
    }
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, LengthDelimitedCodec>,
    mut rx: mpsc::UnboundedReceiver<(Bytes, Bytes)>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some((header, payload)) = rx.recv().await {
        let written: std::io::Result<()> = async {
            sink.feed(header).await?;
            sink.feed(payload).await?;
            SinkExt::<Bytes>::flush(&mut sink).await
        }
        .await;

        if let Err(e) = written {
            warn!(error = %e, "payload channel write failed");
            return;
        }
    }
    debug!("payload channel writer stopped");
}

async fn read_loop<R>(mut stream: FramedRead<R, LengthDelimitedCodec>, inner: Weak<Inner>)
where
    R: AsyncRead + Unpin,
{
    let mut header: Option<PayloadNotificationFrame> = None;

    while let Some(frame) = stream.next().await {
        let bytes = match frame {
            Ok(bytes) => bytes.freeze(),
            Err(e) => {
                warn!(error = %e, "payload channel read failed");
                break;
            }
        };
        let Some(channel) = inner.upgrade() else {
            return;
        };

        match header.take() {
            Some(pending) => channel.dispatch(pending, &bytes),
            None => match serde_json::from_slice::<PayloadNotificationFrame>(&bytes) {
                Ok(frame) => header = Some(frame),
                Err(e) => warn!(error = %e, "dropping unpaired payload frame"),
            },
        }
    }

    if let Some(channel) = inner.upgrade() {
        channel.closed.store(true, Ordering::Release);
    }
    debug!("payload channel reader stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ProducerId, RouterId, TransportId};
    use serde_json::json;

    fn pair() -> (
        PayloadChannel,
        FramedRead<tokio::io::ReadHalf<tokio::io::DuplexStream>, LengthDelimitedCodec>,
        FramedWrite<tokio::io::WriteHalf<tokio::io::DuplexStream>, LengthDelimitedCodec>,
    ) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(ours);
        let (their_read, their_write) = tokio::io::split(theirs);
        (
            PayloadChannel::new(read, write),
            FramedRead::new(their_read, LengthDelimitedCodec::new()),
            FramedWrite::new(their_write, LengthDelimitedCodec::new()),
        )
    }

    #[tokio::test]
    async fn test_concurrent_notifications_stay_paired() {
        let (channel, mut reader, _writer) = pair();
        let internal = Internal::transport(&RouterId::from("r"), &TransportId::from("t"));

        let mut tasks = Vec::new();
        for task in 0..8 {
            let channel = channel.clone();
            let internal = internal.clone();
            tasks.push(tokio::spawn(async move {
                for n in 0..25 {
                    let tag = format!("{task}-{n}");
                    channel.notify(
                        "producer.send",
                        internal
                            .clone()
                            .with_producer(&ProducerId::from(tag.as_str())),
                        Value::Null,
                        Bytes::from(tag),
                    );
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        for _ in 0..200 {
            let header = reader.next().await.unwrap().unwrap();
            let payload = reader.next().await.unwrap().unwrap();
            let header: PayloadNotificationFrame = serde_json::from_slice(&header).unwrap();
            let producer_id = header.internal.unwrap().producer_id.unwrap();
            assert_eq!(producer_id.as_str().as_bytes(), &payload[..]);
        }
    }

    #[tokio::test]
    async fn test_incoming_frames_paired_by_adjacency() {
        let (channel, _reader, mut writer) = pair();
        let (tx, mut rx) = mpsc::unbounded_channel();

        channel.subscribe(
            "dc-1",
            Arc::new(move |event: &str, data: &Value, payload: &Bytes| {
                let _ = tx.send((event.to_string(), data.clone(), payload.clone()));
            }),
        );

        let header = |target: &str| PayloadNotificationFrame {
            event: "message".to_string(),
            target_id: Some(target.to_string()),
            internal: None,
            data: json!({"ppid": 51}),
        };
        for (target, body) in [("unknown", "skip"), ("dc-1", "hello")] {
            writer
                .send(Bytes::from(serde_json::to_vec(&header(target)).unwrap()))
                .await
                .unwrap();
            writer.send(Bytes::from(body)).await.unwrap();
        }

        let (event, data, payload) = rx.recv().await.unwrap();
        assert_eq!(event, "message");
        assert_eq!(data, json!({"ppid": 51}));
        assert_eq!(&payload[..], b"hello");
    }

    #[tokio::test]
    async fn test_notify_after_close_is_dropped() {
        let (channel, mut reader, _writer) = pair();
        channel.close();
        channel.notify("producer.send", Internal::default(), Value::Null, Bytes::from("x"));
        let next = tokio::time::timeout(std::time::Duration::from_millis(50), reader.next()).await;
        assert!(next.is_err());
    }
}
