//! Consumer: one receiver's subscription to a producer

use crate::bus::EventBus;
use crate::error::{Error, Result};
use crate::lifecycle::ClosedFlag;
use crate::message::{Internal, Method};
use crate::producer::Producer;
use crate::rtp_parameters::{MediaKind, RtpCapabilities, RtpParameters};
use crate::transport::Transport;
use crate::types::{AppData, ConsumerId, ProducerId};
use crate::worker::Channels;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerType {
    #[default]
    Simple,
    Simulcast,
    Svc,
    Pipe,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerScore {
    pub score: u8,
    pub producer_score: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerLayers {
    pub spatial_layer: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal_layer: Option<u8>,
}

/// Consumer events. The observer stream gets `Close` for every close path.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerEvent {
    Close,
    TransportClose,
    ProducerClose,
    ProducerPause,
    ProducerResume,
    Pause,
    Resume,
    Score(ConsumerScore),
    LayersChange(Option<ConsumerLayers>),
    Trace(Value),
    /// RTP packet delivered to a consumer of a direct transport
    Rtp(Bytes),
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub producer_id: ProducerId,
    pub rtp_capabilities: RtpCapabilities,
    /// Start locally paused
    pub paused: bool,
    /// Start paused on the producer side until explicitly resumed
    pub producer_paused: bool,
    pub preferred_layers: Option<ConsumerLayers>,
    pub ignore_dtx: bool,
    pub app_data: AppData,
}

impl ConsumerOptions {
    /// Paused, so media only flows once the receiver is ready
    #[must_use]
    pub fn new(producer_id: ProducerId, rtp_capabilities: RtpCapabilities) -> Self {
        Self {
            producer_id,
            rtp_capabilities,
            paused: true,
            producer_paused: false,
            preferred_layers: None,
            ignore_dtx: false,
            app_data: AppData::new(),
        }
    }
}

pub(crate) struct ConsumerInit {
    pub(crate) id: ConsumerId,
    pub(crate) internal: Internal,
    pub(crate) producer_id: ProducerId,
    pub(crate) kind: MediaKind,
    pub(crate) rtp_parameters: RtpParameters,
    pub(crate) consumer_type: ConsumerType,
    pub(crate) paused: bool,
    pub(crate) producer_paused: bool,
    pub(crate) score: ConsumerScore,
    pub(crate) preferred_layers: Option<ConsumerLayers>,
    pub(crate) app_data: AppData,
    pub(crate) producer: Weak<Producer>,
    pub(crate) transport: Weak<Transport>,
    pub(crate) channels: Channels,
}

pub struct Consumer {
    id: ConsumerId,
    internal: Internal,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    consumer_type: ConsumerType,
    paused: AtomicBool,
    producer_paused: AtomicBool,
    priority: AtomicU8,
    score: Mutex<ConsumerScore>,
    preferred_layers: Mutex<Option<ConsumerLayers>>,
    current_layers: Mutex<Option<ConsumerLayers>>,
    app_data: Mutex<AppData>,
    closed: ClosedFlag,
    producer: Weak<Producer>,
    transport: Weak<Transport>,
    channels: Channels,
    app: EventBus<ConsumerEvent>,
    observer: EventBus<ConsumerEvent>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct PriorityResponse {
    priority: u8,
}

impl Consumer {
    pub(crate) fn new(init: ConsumerInit) -> Arc<Self> {
        let consumer = Arc::new(Self {
            id: init.id,
            internal: init.internal,
            producer_id: init.producer_id,
            kind: init.kind,
            rtp_parameters: init.rtp_parameters,
            consumer_type: init.consumer_type,
            paused: AtomicBool::new(init.paused),
            producer_paused: AtomicBool::new(init.producer_paused),
            priority: AtomicU8::new(1),
            score: Mutex::new(init.score),
            preferred_layers: Mutex::new(init.preferred_layers),
            current_layers: Mutex::new(None),
            app_data: Mutex::new(init.app_data),
            closed: ClosedFlag::default(),
            producer: init.producer,
            transport: init.transport,
            channels: init.channels,
            app: EventBus::new(),
            observer: EventBus::new(),
        });

        let weak = Arc::downgrade(&consumer);
        consumer.channels.control.subscribe(
            consumer.id.as_str(),
            Arc::new(move |event: &str, data: &Value| {
                if let Some(consumer) = weak.upgrade() {
                    consumer.handle_notification(event, data);
                }
            }),
        );

        let weak = Arc::downgrade(&consumer);
        consumer.channels.payload.subscribe(
            consumer.id.as_str(),
            Arc::new(move |event: &str, _data: &Value, payload: &Bytes| {
                let Some(consumer) = weak.upgrade() else {
                    return;
                };
                if event == "rtp" {
                    consumer.app.emit(ConsumerEvent::Rtp(payload.clone()));
                } else {
                    warn!(consumer_id = %consumer.id, event, "ignoring unknown consumer payload");
                }
            }),
        );

        consumer
    }

    #[must_use]
    pub fn id(&self) -> &ConsumerId {
        &self.id
    }

    #[must_use]
    pub fn producer_id(&self) -> &ProducerId {
        &self.producer_id
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
    pub const fn consumer_type(&self) -> ConsumerType {
        self.consumer_type
    }

    #[must_use]
    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn producer_paused(&self) -> bool {
        self.producer_paused.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn score(&self) -> ConsumerScore {
        *self.score.lock()
    }

    #[must_use]
    pub fn preferred_layers(&self) -> Option<ConsumerLayers> {
        *self.preferred_layers.lock()
    }

    #[must_use]
    pub fn current_layers(&self) -> Option<ConsumerLayers> {
        *self.current_layers.lock()
    }

    #[must_use]
    pub fn app_data(&self) -> AppData {
        self.app_data.lock().clone()
    }

    pub fn set_app_data(&self, key: impl Into<String>, value: Value) {
        self.app_data.lock().insert(key.into(), value);
    }

    fn app_data_str(&self, key: &str) -> Option<String> {
        self.app_data
            .lock()
            .get(key)
            .and_then(Value::as_str)
            .map(ToString::to_string)
    }

    /// Room this consumer was created for
    #[must_use]
    pub fn room_id(&self) -> Option<String> {
        self.app_data_str("roomId")
    }

    /// Source tag copied from the producer
    #[must_use]
    pub fn source(&self) -> Option<String> {
        self.app_data_str("source")
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    pub fn on(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.app.subscribe()
    }

    pub fn observer(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.observer.subscribe()
    }

    pub fn close(&self) {
        if !self.closed.transition() {
            return;
        }
        debug!(consumer_id = %self.id, "consumer closed");

        self.teardown();
        self.finish(ConsumerEvent::Close);

        self.channels
            .control
            .request_detached(Method::ConsumerClose, self.internal.clone(), Value::Null);
    }

    pub(crate) fn transport_closed(&self) {
        if !self.closed.transition() {
            return;
        }
        debug!(consumer_id = %self.id, "consumer closed by transport");

        self.teardown();
        self.finish(ConsumerEvent::TransportClose);
    }

    /// The source producer closed. Emits `ProducerClose` exactly once.
    pub(crate) fn producer_closed(&self) {
        if !self.closed.transition() {
            return;
        }
        debug!(consumer_id = %self.id, producer_id = %self.producer_id, "consumer closed by producer");

        self.teardown();
        self.finish(ConsumerEvent::ProducerClose);
    }

    fn teardown(&self) {
        self.channels.control.unsubscribe(self.id.as_str());
        self.channels.payload.unsubscribe(self.id.as_str());
        if let Some(producer) = self.producer.upgrade() {
            producer.remove_consumer(&self.id);
        }
        if let Some(transport) = self.transport.upgrade() {
            transport.remove_consumer(&self.id);
        }
    }

    fn finish(&self, event: ConsumerEvent) {
        self.app.emit(event);
        self.observer.emit(ConsumerEvent::Close);
        self.app.close();
        self.observer.close();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::closed(format!("Consumer {}", self.id)));
        }
        Ok(())
    }

    pub async fn pause(&self) -> Result<()> {
        self.ensure_open()?;
        self.channels
            .control
            .request(Method::ConsumerPause, self.internal.clone(), Value::Null)
            .await?;

        if !self.paused.swap(true, Ordering::AcqRel) {
            self.observer.emit(ConsumerEvent::Pause);
        }
        Ok(())
    }

    /// Resume local delivery. A producer-side pause set at creation is lifted
    /// as well, unless the producer itself is paused.
    pub async fn resume(&self) -> Result<()> {
        self.ensure_open()?;
        self.channels
            .control
            .request(Method::ConsumerResume, self.internal.clone(), Value::Null)
            .await?;

        let producer_paused = self.producer.upgrade().is_some_and(|p| p.paused());
        if !producer_paused {
            self.producer_paused.store(false, Ordering::Release);
        }
        if self.paused.swap(false, Ordering::AcqRel) {
            self.observer.emit(ConsumerEvent::Resume);
        }
        Ok(())
    }

    pub async fn set_preferred_layers(&self, layers: ConsumerLayers) -> Result<()> {
        self.ensure_open()?;
        let data = self
            .channels
            .control
            .request(
                Method::ConsumerSetPreferredLayers,
                self.internal.clone(),
                serde_json::to_value(layers)?,
            )
            .await?;

        let applied: Option<ConsumerLayers> = crate::message::decode(data)?;
        *self.preferred_layers.lock() = applied;
        Ok(())
    }

    pub async fn set_priority(&self, priority: u8) -> Result<()> {
        self.ensure_open()?;
        if priority == 0 {
            return Err(Error::validation("priority must be at least 1"));
        }
        let data = self
            .channels
            .control
            .request(
                Method::ConsumerSetPriority,
                self.internal.clone(),
                json!({ "priority": priority }),
            )
            .await?;

        let response: PriorityResponse = crate::message::decode(data)?;
        let applied = if response.priority == 0 { priority } else { response.priority };
        self.priority.store(applied, Ordering::Release);
        Ok(())
    }

    pub async fn unset_priority(&self) -> Result<()> {
        self.set_priority(1).await
    }

    pub async fn request_key_frame(&self) -> Result<()> {
        self.ensure_open()?;
        self.channels
            .control
            .request(Method::ConsumerRequestKeyFrame, self.internal.clone(), Value::Null)
            .await?;
        Ok(())
    }

    pub async fn get_stats(&self) -> Result<Value> {
        self.ensure_open()?;
        self.channels
            .control
            .request(Method::ConsumerGetStats, self.internal.clone(), Value::Null)
            .await
    }

    pub async fn dump(&self) -> Result<Value> {
        self.ensure_open()?;
        self.channels
            .control
            .request(Method::ConsumerDump, self.internal.clone(), Value::Null)
            .await
    }

    pub async fn enable_trace_event(&self, types: &[&str]) -> Result<()> {
        self.ensure_open()?;
        self.channels
            .control
            .request(
                Method::ConsumerEnableTraceEvent,
                self.internal.clone(),
                json!({ "types": types }),
            )
            .await?;
        Ok(())
    }

    fn handle_notification(&self, event: &str, data: &Value) {
        match event {
            "producerclose" => self.producer_closed(),
            "producerpause" => {
                if self.producer_paused.swap(true, Ordering::AcqRel) {
                    return;
                }
                self.app.emit(ConsumerEvent::ProducerPause);
                if !self.paused() {
                    self.observer.emit(ConsumerEvent::Pause);
                }
            }
            "producerresume" => {
                if !self.producer_paused.swap(false, Ordering::AcqRel) {
                    return;
                }
                self.app.emit(ConsumerEvent::ProducerResume);
                if !self.paused() {
                    self.observer.emit(ConsumerEvent::Resume);
                }
            }
            "score" => match serde_json::from_value::<ConsumerScore>(data.clone()) {
                Ok(score) => {
                    *self.score.lock() = score;
                    self.app.emit(ConsumerEvent::Score(score));
                    self.observer.emit(ConsumerEvent::Score(score));
                }
                Err(e) => warn!(consumer_id = %self.id, error = %e, "malformed score notification"),
            },
            "layerschange" => match serde_json::from_value::<Option<ConsumerLayers>>(data.clone()) {
                Ok(layers) => {
                    *self.current_layers.lock() = layers;
                    self.app.emit(ConsumerEvent::LayersChange(layers));
                    self.observer.emit(ConsumerEvent::LayersChange(layers));
                }
                Err(e) => warn!(consumer_id = %self.id, error = %e, "malformed layerschange notification"),
            },
            "trace" => {
                self.app.emit(ConsumerEvent::Trace(data.clone()));
                self.observer.emit(ConsumerEvent::Trace(data.clone()));
            }
            _ => warn!(consumer_id = %self.id, event, "ignoring unknown consumer notification"),
        }
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.id)
            .field("producer_id", &self.producer_id)
            .field("paused", &self.paused())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{
        audio_producer_options, create_router, endpoint_rtp_capabilities, fake_worker,
        video_producer_options, webrtc_transport_options, FakeWorker,
    };
    use crate::worker::Worker;
    use tokio::sync::broadcast::error::RecvError;

    struct Fixture {
        _worker: Arc<Worker>,
        fake: FakeWorker,
        recv: Arc<Transport>,
        producer: Arc<Producer>,
        consumer: Arc<Consumer>,
    }

    async fn fixture(options: crate::producer::ProducerOptions) -> Fixture {
        let (worker, fake) = fake_worker();
        let router = create_router(&worker).await.unwrap();
        let send = router
            .create_webrtc_transport(webrtc_transport_options())
            .await
            .unwrap();
        let recv = router
            .create_webrtc_transport(webrtc_transport_options())
            .await
            .unwrap();
        let producer = send.produce(options).await.unwrap();
        let consumer = recv
            .consume(ConsumerOptions::new(
                producer.id().clone(),
                endpoint_rtp_capabilities(),
            ))
            .await
            .unwrap();
        Fixture {
            _worker: worker,
            fake,
            recv,
            producer,
            consumer,
        }
    }

    #[tokio::test]
    async fn test_consumer_starts_paused() {
        let f = fixture(audio_producer_options()).await;

        assert!(f.consumer.paused());
        assert!(!f.consumer.producer_paused());
        assert_eq!(f.consumer.kind(), MediaKind::Audio);
        assert_eq!(f.consumer.consumer_type(), ConsumerType::Simple);
        assert_eq!(f.consumer.rtp_parameters().codecs[0].payload_type, 100);
        assert_eq!(f.producer.consumer_count(), 1);

        let request = f.fake.wait_for_request("transport.consume").await;
        assert_eq!(request.data["paused"], json!(true));
        assert_eq!(
            request.internal.producer_id.as_ref(),
            Some(f.producer.id())
        );
    }

    #[tokio::test]
    async fn test_resume_emits_on_change() {
        let f = fixture(audio_producer_options()).await;
        let mut observer = f.consumer.observer();

        f.consumer.resume().await.unwrap();
        f.consumer.resume().await.unwrap();
        f.consumer.pause().await.unwrap();

        assert_eq!(observer.recv().await.unwrap(), ConsumerEvent::Resume);
        assert_eq!(observer.recv().await.unwrap(), ConsumerEvent::Pause);
        assert!(f.consumer.paused());
    }

    #[tokio::test]
    async fn test_producer_pause_notifications() {
        let f = fixture(audio_producer_options()).await;
        f.consumer.resume().await.unwrap();
        let mut events = f.consumer.on();
        let mut observer = f.consumer.observer();

        f.fake.notify(f.consumer.id().as_str(), "producerpause", Value::Null);
        f.fake.notify(f.consumer.id().as_str(), "producerpause", Value::Null);
        f.fake.notify(f.consumer.id().as_str(), "producerresume", Value::Null);

        assert_eq!(events.recv().await.unwrap(), ConsumerEvent::ProducerPause);
        assert_eq!(events.recv().await.unwrap(), ConsumerEvent::ProducerResume);
        assert_eq!(observer.recv().await.unwrap(), ConsumerEvent::Pause);
        assert_eq!(observer.recv().await.unwrap(), ConsumerEvent::Resume);
        assert!(!f.consumer.producer_paused());
    }

    #[tokio::test]
    async fn test_producerclose_notification_closes_once() {
        let f = fixture(audio_producer_options()).await;
        let mut events = f.consumer.on();

        f.fake.notify(f.consumer.id().as_str(), "producerclose", Value::Null);
        f.producer.close();

        assert_eq!(events.recv().await.unwrap(), ConsumerEvent::ProducerClose);
        assert!(matches!(events.recv().await, Err(RecvError::Closed)));
        assert!(f.recv.consumer(f.consumer.id()).is_none());
        assert_eq!(f.fake.count("consumer.close"), 0);
    }

    #[tokio::test]
    async fn test_set_priority() {
        let f = fixture(video_producer_options()).await;

        let err = f.consumer.set_priority(0).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(f.fake.count("consumer.setPriority"), 0);

        f.consumer.set_priority(5).await.unwrap();
        assert_eq!(f.consumer.priority(), 5);
        f.consumer.unset_priority().await.unwrap();
        assert_eq!(f.consumer.priority(), 1);
    }

    #[tokio::test]
    async fn test_set_preferred_layers() {
        let f = fixture(video_producer_options()).await;
        let layers = ConsumerLayers {
            spatial_layer: 1,
            temporal_layer: Some(2),
        };

        f.consumer.set_preferred_layers(layers).await.unwrap();
        assert_eq!(f.consumer.preferred_layers(), Some(layers));
    }

    #[tokio::test]
    async fn test_layers_and_score_notifications() {
        let f = fixture(video_producer_options()).await;
        let mut events = f.consumer.on();

        f.fake.notify(
            f.consumer.id().as_str(),
            "layerschange",
            json!({"spatialLayer": 0, "temporalLayer": 1}),
        );
        f.fake.notify(
            f.consumer.id().as_str(),
            "score",
            json!({"score": 7, "producerScore": 8}),
        );

        let layers = ConsumerLayers {
            spatial_layer: 0,
            temporal_layer: Some(1),
        };
        assert_eq!(events.recv().await.unwrap(), ConsumerEvent::LayersChange(Some(layers)));
        let score = ConsumerScore {
            score: 7,
            producer_score: 8,
        };
        assert_eq!(events.recv().await.unwrap(), ConsumerEvent::Score(score));
        assert_eq!(f.consumer.current_layers(), Some(layers));
        assert_eq!(f.consumer.score(), score);
    }

    #[tokio::test]
    async fn test_rtp_payload_delivery() {
        let f = fixture(audio_producer_options()).await;
        let mut events = f.consumer.on();

        f.fake.send_payload(
            f.consumer.id().as_str(),
            "rtp",
            Value::Null,
            Bytes::from_static(b"\x80\x6f\x00\x01"),
        );

        assert_eq!(
            events.recv().await.unwrap(),
            ConsumerEvent::Rtp(Bytes::from_static(b"\x80\x6f\x00\x01"))
        );
    }

    #[tokio::test]
    async fn test_cannot_consume_without_matching_codec() {
        let f = fixture(audio_producer_options()).await;
        let mut capabilities = endpoint_rtp_capabilities();
        capabilities.codecs.retain(|codec| codec.kind == MediaKind::Video);

        let err = f
            .recv
            .consume(ConsumerOptions::new(f.producer.id().clone(), capabilities))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(f.fake.count("transport.consume"), 1);
    }
}
