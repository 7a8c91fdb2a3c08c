//! Producer: a media stream sent into a transport
//!
//! A producer indexes the consumers that depend on it without owning them.
//! Closing it, by any path, drives each of them through `producer_closed`.
//! A producer nobody consumes is reclaimed by a periodic orphan check.

use crate::bus::EventBus;
use crate::consumer::Consumer;
use crate::error::{Error, Result};
use crate::lifecycle::ClosedFlag;
use crate::message::{Internal, Method};
use crate::router::Router;
use crate::rtp_parameters::{MediaKind, RtpParameters};
use crate::transport::Transport;
use crate::types::{AppData, ConsumerId, ProducerId};
use crate::worker::Channels;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Period of the orphan check
pub const ORPHAN_CHECK_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerType {
    #[default]
    Simple,
    Simulcast,
    Svc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerScore {
    pub encoding_idx: u32,
    pub ssrc: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    pub score: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoOrientation {
    pub camera: bool,
    pub flip: bool,
    pub rotation: u16,
}

/// Producer events. The observer stream gets `Close` for every close path,
/// the application stream gets the specific one.
#[derive(Debug, Clone, PartialEq)]
pub enum ProducerEvent {
    Close,
    TransportClose,
    Pause,
    Resume,
    Score(Vec<ProducerScore>),
    VideoOrientationChange(VideoOrientation),
    Trace(Value),
}

#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub id: Option<ProducerId>,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
    /// Milliseconds to wait before forwarding a key frame request upstream
    pub key_frame_request_delay: u32,
    pub app_data: AppData,
}

impl ProducerOptions {
    #[must_use]
    pub fn new(kind: MediaKind, rtp_parameters: RtpParameters) -> Self {
        Self {
            id: None,
            kind,
            rtp_parameters,
            paused: false,
            key_frame_request_delay: 0,
            app_data: AppData::new(),
        }
    }
}

pub(crate) struct ProducerInit {
    pub(crate) id: ProducerId,
    pub(crate) internal: Internal,
    pub(crate) kind: MediaKind,
    pub(crate) rtp_parameters: RtpParameters,
    pub(crate) producer_type: ProducerType,
    pub(crate) consumable_rtp_parameters: RtpParameters,
    pub(crate) paused: bool,
    pub(crate) direct: bool,
    pub(crate) app_data: AppData,
    pub(crate) transport: Weak<Transport>,
    pub(crate) router: Weak<Router>,
    pub(crate) channels: Channels,
}

pub struct Producer {
    id: ProducerId,
    internal: Internal,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    producer_type: ProducerType,
    consumable_rtp_parameters: RtpParameters,
    direct: bool,
    paused: AtomicBool,
    score: Mutex<Vec<ProducerScore>>,
    app_data: Mutex<AppData>,
    consumers: Mutex<HashMap<ConsumerId, Weak<Consumer>>>,
    closed: ClosedFlag,
    orphan_check: CancellationToken,
    transport: Weak<Transport>,
    router: Weak<Router>,
    channels: Channels,
    app: EventBus<ProducerEvent>,
    observer: EventBus<ProducerEvent>,
}

impl Producer {
    pub(crate) fn new(init: ProducerInit) -> Arc<Self> {
        let producer = Arc::new(Self {
            id: init.id,
            internal: init.internal,
            kind: init.kind,
            rtp_parameters: init.rtp_parameters,
            producer_type: init.producer_type,
            consumable_rtp_parameters: init.consumable_rtp_parameters,
            direct: init.direct,
            paused: AtomicBool::new(init.paused),
            score: Mutex::new(Vec::new()),
            app_data: Mutex::new(init.app_data),
            consumers: Mutex::new(HashMap::new()),
            closed: ClosedFlag::default(),
            orphan_check: CancellationToken::new(),
            transport: init.transport,
            router: init.router,
            channels: init.channels,
            app: EventBus::new(),
            observer: EventBus::new(),
        });

        let weak = Arc::downgrade(&producer);
        producer.channels.control.subscribe(
            producer.id.as_str(),
            Arc::new(move |event: &str, data: &Value| {
                if let Some(producer) = weak.upgrade() {
                    producer.handle_notification(event, data);
                }
            }),
        );
        producer.start_orphan_check();

        producer
    }

    #[must_use]
    pub fn id(&self) -> &ProducerId {
        &self.id
    }

    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        self.kind
    }

    #[must_use]
    pub fn rtp_parameters(&self) -> &RtpParameters {
        &self.rtp_parameters
    }

    #[must_use]
    pub const fn producer_type(&self) -> ProducerType {
        self.producer_type
    }

    /// RTP parameters in the router's payload types, used to build consumers
    #[must_use]
    pub fn consumable_rtp_parameters(&self) -> &RtpParameters {
        &self.consumable_rtp_parameters
    }

    #[must_use]
    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn score(&self) -> Vec<ProducerScore> {
        self.score.lock().clone()
    }

    #[must_use]
    pub fn app_data(&self) -> AppData {
        self.app_data.lock().clone()
    }

    pub fn set_app_data(&self, key: impl Into<String>, value: Value) {
        self.app_data.lock().insert(key.into(), value);
    }

    /// The `source` tag from app data, if any
    #[must_use]
    pub fn source(&self) -> Option<String> {
        self.app_data
            .lock()
            .get("source")
            .and_then(Value::as_str)
            .map(ToString::to_string)
    }

    /// Number of live consumers of this producer
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }

    /// Live consumers of this producer
    #[must_use]
    pub fn consumers(&self) -> Vec<Arc<Consumer>> {
        self.consumers.lock().values().filter_map(Weak::upgrade).collect()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    /// Application events
    pub fn on(&self) -> broadcast::Receiver<ProducerEvent> {
        self.app.subscribe()
    }

    /// Observer events
    pub fn observer(&self) -> broadcast::Receiver<ProducerEvent> {
        self.observer.subscribe()
    }

    /// Close the producer and ask the worker to drop it
    pub fn close(&self) {
        if !self.closed.transition() {
            return;
        }
        debug!(producer_id = %self.id, "producer closed");

        self.teardown();
        if let Some(transport) = self.transport.upgrade() {
            transport.remove_producer(&self.id);
        }
        self.finish(ProducerEvent::Close);

        self.channels
            .control
            .request_detached(Method::ProducerClose, self.internal.clone(), Value::Null);
    }

    /// The owning transport closed; the worker already dropped this producer
    pub(crate) fn transport_closed(&self) {
        if !self.closed.transition() {
            return;
        }
        debug!(producer_id = %self.id, "producer closed by transport");

        self.teardown();
        self.finish(ProducerEvent::TransportClose);
    }

    fn teardown(&self) {
        self.orphan_check.cancel();
        self.channels.control.unsubscribe(self.id.as_str());
        if let Some(router) = self.router.upgrade() {
            router.remove_producer(&self.id);
        }

        let consumers = std::mem::take(&mut *self.consumers.lock());
        for consumer in consumers.into_values().filter_map(|c| c.upgrade()) {
            consumer.producer_closed();
        }
    }

    fn finish(&self, event: ProducerEvent) {
        self.app.emit(event);
        self.observer.emit(ProducerEvent::Close);
        self.app.close();
        self.observer.close();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::closed(format!("Producer {}", self.id)));
        }
        Ok(())
    }

    pub async fn pause(&self) -> Result<()> {
        self.ensure_open()?;
        self.channels
            .control
            .request(Method::ProducerPause, self.internal.clone(), Value::Null)
            .await?;

        if !self.paused.swap(true, Ordering::AcqRel) {
            self.observer.emit(ProducerEvent::Pause);
        }
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        self.ensure_open()?;
        self.channels
            .control
            .request(Method::ProducerResume, self.internal.clone(), Value::Null)
            .await?;

        if self.paused.swap(false, Ordering::AcqRel) {
            self.observer.emit(ProducerEvent::Resume);
        }
        Ok(())
    }

    pub async fn get_stats(&self) -> Result<Value> {
        self.ensure_open()?;
        self.channels
            .control
            .request(Method::ProducerGetStats, self.internal.clone(), Value::Null)
            .await
    }

    pub async fn dump(&self) -> Result<Value> {
        self.ensure_open()?;
        self.channels
            .control
            .request(Method::ProducerDump, self.internal.clone(), Value::Null)
            .await
    }

    /// Enable `trace` notifications of the given types (`rtp`, `keyframe`, `nack`, `pli`, `fir`)
    pub async fn enable_trace_event(&self, types: &[&str]) -> Result<()> {
        self.ensure_open()?;
        self.channels
            .control
            .request(
                Method::ProducerEnableTraceEvent,
                self.internal.clone(),
                json!({ "types": types }),
            )
            .await?;
        Ok(())
    }

    /// Inject an RTP packet. Only producers of a direct transport accept this.
    pub fn send(&self, rtp_packet: Bytes) -> Result<()> {
        self.ensure_open()?;
        if !self.direct {
            return Err(Error::validation("send() is only available on direct transports"));
        }
        self.channels
            .payload
            .notify("producer.send", self.internal.clone(), Value::Null, rtp_packet);
        Ok(())
    }

    pub(crate) fn add_consumer(&self, consumer: &Arc<Consumer>) {
        self.consumers
            .lock()
            .insert(consumer.id().clone(), Arc::downgrade(consumer));
    }

    pub(crate) fn remove_consumer(&self, consumer_id: &ConsumerId) {
        self.consumers.lock().remove(consumer_id);
    }

    fn handle_notification(&self, event: &str, data: &Value) {
        match event {
            "score" => match serde_json::from_value::<Vec<ProducerScore>>(data.clone()) {
                Ok(score) => {
                    *self.score.lock() = score.clone();
                    self.app.emit(ProducerEvent::Score(score.clone()));
                    self.observer.emit(ProducerEvent::Score(score));
                }
                Err(e) => warn!(producer_id = %self.id, error = %e, "malformed score notification"),
            },
            "videoorientationchange" => match serde_json::from_value::<VideoOrientation>(data.clone()) {
                Ok(orientation) => {
                    self.app.emit(ProducerEvent::VideoOrientationChange(orientation));
                    self.observer.emit(ProducerEvent::VideoOrientationChange(orientation));
                }
                Err(e) => warn!(
                    producer_id = %self.id,
                    error = %e,
                    "malformed videoorientationchange notification"
                ),
            },
            "trace" => {
                self.app.emit(ProducerEvent::Trace(data.clone()));
                self.observer.emit(ProducerEvent::Trace(data.clone()));
            }
            _ => warn!(producer_id = %self.id, event, "ignoring unknown producer notification"),
        }
    }

    fn start_orphan_check(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let cancel = self.orphan_check.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(ORPHAN_CHECK_INTERVAL) => {}
                }

                let Some(producer) = weak.upgrade() else {
                    return;
                };
                if producer.consumer_count() == 0 {
                    debug!(producer_id = %producer.id, "producer has no consumers, closing");
                    // Detached so the close never runs inside this check
                    tokio::spawn(async move { producer.close() });
                    return;
                }
            }
        });
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.orphan_check.cancel();
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("paused", &self.paused())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{ConsumerEvent, ConsumerOptions};
    use crate::test_helpers::{
        audio_producer_options, create_router, endpoint_rtp_capabilities, fake_worker,
        webrtc_transport_options,
    };
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (worker, fake) = fake_worker();
        let router = create_router(&worker).await.unwrap();
        let transport = router
            .create_webrtc_transport(webrtc_transport_options())
            .await
            .unwrap();
        let producer = transport.produce(audio_producer_options()).await.unwrap();
        let mut observer = producer.observer();

        producer.close();
        producer.close();

        fake.wait_for_request("producer.close").await;
        transport.dump().await.unwrap();
        assert_eq!(fake.count("producer.close"), 1);
        assert_eq!(observer.recv().await.unwrap(), ProducerEvent::Close);
        assert!(matches!(observer.recv().await, Err(RecvError::Closed)));
        assert!(transport.producer(producer.id()).is_none());
        assert!(router.get_producer(producer.id()).is_none());
    }

    #[tokio::test]
    async fn test_close_cascades_to_every_consumer_once() {
        let (worker, _fake) = fake_worker();
        let router = create_router(&worker).await.unwrap();
        let send = router
            .create_webrtc_transport(webrtc_transport_options())
            .await
            .unwrap();
        let recv = router
            .create_webrtc_transport(webrtc_transport_options())
            .await
            .unwrap();
        let producer = send.produce(audio_producer_options()).await.unwrap();

        let mut consumers = Vec::new();
        for _ in 0..3 {
            let consumer = recv
                .consume(ConsumerOptions::new(
                    producer.id().clone(),
                    endpoint_rtp_capabilities(),
                ))
                .await
                .unwrap();
            let events = consumer.on();
            consumers.push((consumer, events));
        }
        assert_eq!(producer.consumer_count(), 3);
        let mut ids: Vec<ConsumerId> = producer.consumers().iter().map(|c| c.id().clone()).collect();
        ids.sort();
        let mut expected: Vec<ConsumerId> = consumers.iter().map(|(c, _)| c.id().clone()).collect();
        expected.sort();
        assert_eq!(ids, expected);

        let (first, _) = consumers.remove(0);
        first.close();
        let remaining = producer.consumers();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|c| c.id() != first.id()));

        producer.close();

        for (consumer, mut events) in consumers {
            assert_eq!(events.recv().await.unwrap(), ConsumerEvent::ProducerClose);
            assert!(matches!(events.recv().await, Err(RecvError::Closed)));
            assert!(consumer.is_closed());
            assert!(recv.consumer(consumer.id()).is_none());
        }
    }

    #[tokio::test]
    async fn test_pause_notifies_observer_only_on_change() {
        let (worker, fake) = fake_worker();
        let router = create_router(&worker).await.unwrap();
        let transport = router
            .create_webrtc_transport(webrtc_transport_options())
            .await
            .unwrap();
        let producer = transport.produce(audio_producer_options()).await.unwrap();
        let mut observer = producer.observer();

        producer.pause().await.unwrap();
        producer.pause().await.unwrap();
        producer.resume().await.unwrap();
        assert!(!producer.paused());
        assert_eq!(fake.count("producer.pause"), 2);

        assert_eq!(observer.recv().await.unwrap(), ProducerEvent::Pause);
        assert_eq!(observer.recv().await.unwrap(), ProducerEvent::Resume);
    }

    #[tokio::test]
    async fn test_score_notification() {
        let (worker, fake) = fake_worker();
        let router = create_router(&worker).await.unwrap();
        let transport = router
            .create_webrtc_transport(webrtc_transport_options())
            .await
            .unwrap();
        let producer = transport.produce(audio_producer_options()).await.unwrap();
        let mut events = producer.on();

        fake.notify(
            producer.id().as_str(),
            "score",
            json!([{"encodingIdx": 0, "ssrc": 11_111_111, "score": 9}]),
        );

        match events.recv().await.unwrap() {
            ProducerEvent::Score(score) => assert_eq!(score[0].score, 9),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(producer.score().len(), 1);
    }

    #[tokio::test]
    async fn test_send_requires_direct_transport() {
        let (worker, _fake) = fake_worker();
        let router = create_router(&worker).await.unwrap();
        let transport = router
            .create_webrtc_transport(webrtc_transport_options())
            .await
            .unwrap();
        let producer = transport.produce(audio_producer_options()).await.unwrap();

        let err = producer.send(Bytes::from_static(b"rtp")).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_orphan_producer_is_reclaimed() {
        let (worker, fake) = fake_worker();
        let router = create_router(&worker).await.unwrap();
        let transport = router
            .create_webrtc_transport(webrtc_transport_options())
            .await
            .unwrap();
        let producer = transport.produce(audio_producer_options()).await.unwrap();
        let mut observer = producer.observer();

        tokio::time::sleep(ORPHAN_CHECK_INTERVAL + Duration::from_secs(1)).await;

        assert_eq!(observer.recv().await.unwrap(), ProducerEvent::Close);
        assert!(producer.is_closed());
        assert!(router.get_producer(producer.id()).is_none());
        fake.wait_for_request("producer.close").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumed_producer_survives_orphan_check() {
        let (worker, _fake) = fake_worker();
        let router = create_router(&worker).await.unwrap();
        let send = router
            .create_webrtc_transport(webrtc_transport_options())
            .await
            .unwrap();
        let recv = router
            .create_webrtc_transport(webrtc_transport_options())
            .await
            .unwrap();
        let producer = send.produce(audio_producer_options()).await.unwrap();
        let consumer = recv
            .consume(ConsumerOptions::new(
                producer.id().clone(),
                endpoint_rtp_capabilities(),
            ))
            .await
            .unwrap();
        let mut observer = producer.observer();

        tokio::time::sleep(ORPHAN_CHECK_INTERVAL * 3).await;
        assert!(!producer.is_closed());

        consumer.close();
        tokio::time::sleep(ORPHAN_CHECK_INTERVAL).await;
        assert_eq!(observer.recv().await.unwrap(), ProducerEvent::Close);
    }
}
