//! Transports
//!
//! All four variants share one [`Transport`] type. The shared part owns the
//! children and runs the close cascade; the variant part holds the
//! connection fields and interprets variant-specific notifications.

pub mod direct;
pub mod pipe;
pub mod plain;
pub mod sctp;
pub mod webrtc;

use crate::bus::EventBus;
use crate::consumer::{Consumer, ConsumerInit, ConsumerOptions, ConsumerScore, ConsumerType};
use crate::data_consumer::{DataConsumer, DataConsumerInit, DataConsumerOptions};
use crate::data_producer::{DataProducer, DataProducerInit, DataProducerOptions, DataProducerType};
use crate::error::{Error, Result};
use crate::lifecycle::ClosedFlag;
use crate::message::{Internal, Method};
use crate::ortc;
use crate::producer::{Producer, ProducerInit, ProducerOptions, ProducerType};
use crate::router::Router;
use crate::rtp_parameters::{MediaKind, RtpCapabilities, RtpParameters};
use crate::types::{
    AppData, ConsumerId, DataConsumerId, DataProducerId, ProducerId, RouterId, TransportId,
};
use crate::worker::Channels;
use bytes::Bytes;
use direct::DirectTransportData;
use parking_lot::Mutex;
use pipe::{PipeConnectParams, PipeTransportData};
use plain::{PlainConnectParams, PlainTransportData, TransportTuple};
use sctp::{SctpParameters, SctpState, SctpStreamParameters};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use webrtc::{DtlsParameters, DtlsState, IceParameters, IceState, WebRtcTransportData};

/// Transport events. The observer stream additionally reports children as
/// they are created, and gets `Close` for every close path.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Close,
    RouterClose,
    IceStateChange(IceState),
    IceSelectedTupleChange(TransportTuple),
    DtlsStateChange(DtlsState),
    SctpStateChange(SctpState),
    Tuple(TransportTuple),
    RtcpTuple(TransportTuple),
    /// RTCP packet received on a direct transport
    Rtcp(Bytes),
    Trace(Value),
    NewProducer(ProducerId),
    NewConsumer(ConsumerId),
    NewDataProducer(DataProducerId),
    NewDataConsumer(DataConsumerId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebRtc,
    Plain,
    Pipe,
    Direct,
}

/// Variant-specific transport state
#[derive(Debug, Clone)]
pub enum TransportVariant {
    WebRtc(WebRtcTransportData),
    Plain(PlainTransportData),
    Pipe(PipeTransportData),
    Direct(DirectTransportData),
}

impl TransportVariant {
    #[must_use]
    pub const fn kind(&self) -> TransportKind {
        match self {
            Self::WebRtc(_) => TransportKind::WebRtc,
            Self::Plain(_) => TransportKind::Plain,
            Self::Pipe(_) => TransportKind::Pipe,
            Self::Direct(_) => TransportKind::Direct,
        }
    }

    fn handle_notification(
        &mut self,
        event: &str,
        data: &Value,
    ) -> serde_json::Result<Option<TransportEvent>> {
        match self {
            Self::WebRtc(webrtc) => webrtc.handle_notification(event, data),
            Self::Plain(plain) => plain.handle_notification(event, data),
            Self::Pipe(_) | Self::Direct(_) => Ok(None),
        }
    }

    fn on_close(&mut self) {
        if let Self::WebRtc(webrtc) = self {
            webrtc.on_close();
        }
    }

    fn apply_connect_response(&mut self, data: Value) -> Result<()> {
        match self {
            Self::WebRtc(webrtc) => webrtc.apply_connect_response(data),
            Self::Plain(plain) => plain.apply_connect_response(data),
            Self::Pipe(pipe) => pipe.apply_connect_response(data),
            Self::Direct(_) => Ok(()),
        }
    }
}

/// Remote parameters for [`Transport::connect`], one per connectable variant
#[derive(Debug, Clone)]
pub enum ConnectParams {
    WebRtc { dtls_parameters: DtlsParameters },
    Plain(PlainConnectParams),
    Pipe(PipeConnectParams),
}

impl ConnectParams {
    const fn kind(&self) -> TransportKind {
        match self {
            Self::WebRtc { .. } => TransportKind::WebRtc,
            Self::Plain(_) => TransportKind::Plain,
            Self::Pipe(_) => TransportKind::Pipe,
        }
    }

    fn to_request(&self) -> Result<Value> {
        Ok(match self {
            Self::WebRtc { dtls_parameters } => json!({ "dtlsParameters": dtls_parameters }),
            Self::Plain(params) => serde_json::to_value(params)?,
            Self::Pipe(params) => serde_json::to_value(params)?,
        })
    }
}

/// SCTP fields every creation response may carry
#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct SctpInfo {
    pub(crate) sctp_parameters: Option<SctpParameters>,
    pub(crate) sctp_state: Option<SctpState>,
}

#[derive(Default)]
struct Children {
    producers: HashMap<ProducerId, Arc<Producer>>,
    consumers: HashMap<ConsumerId, Arc<Consumer>>,
    data_producers: HashMap<DataProducerId, Arc<DataProducer>>,
    data_consumers: HashMap<DataConsumerId, Arc<DataConsumer>>,
}

pub(crate) struct TransportInit {
    pub(crate) id: TransportId,
    pub(crate) router_id: RouterId,
    pub(crate) variant: TransportVariant,
    pub(crate) sctp: SctpInfo,
    pub(crate) router_rtp_capabilities: Arc<RtpCapabilities>,
    pub(crate) app_data: AppData,
    pub(crate) router: Weak<Router>,
    pub(crate) channels: Channels,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ProduceResponse {
    #[serde(rename = "type")]
    producer_type: ProducerType,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ConsumeResponse {
    paused: bool,
    producer_paused: bool,
    score: ConsumerScore,
}

pub struct Transport {
    id: TransportId,
    internal: Internal,
    variant: Mutex<TransportVariant>,
    sctp_parameters: Option<SctpParameters>,
    sctp_state: Mutex<Option<SctpState>>,
    next_sctp_stream_id: Mutex<u16>,
    router_rtp_capabilities: Arc<RtpCapabilities>,
    app_data: AppData,
    children: Mutex<Children>,
    closed: ClosedFlag,
    router: Weak<Router>,
    channels: Channels,
    app: EventBus<TransportEvent>,
    observer: EventBus<TransportEvent>,
}

impl Transport {
    pub(crate) fn new(init: TransportInit) -> Arc<Self> {
        let transport = Arc::new(Self {
            internal: Internal::transport(&init.router_id, &init.id),
            id: init.id,
            variant: Mutex::new(init.variant),
            sctp_parameters: init.sctp.sctp_parameters,
            sctp_state: Mutex::new(init.sctp.sctp_state),
            next_sctp_stream_id: Mutex::new(0),
            router_rtp_capabilities: init.router_rtp_capabilities,
            app_data: init.app_data,
            children: Mutex::new(Children::default()),
            closed: ClosedFlag::default(),
            router: init.router,
            channels: init.channels,
            app: EventBus::new(),
            observer: EventBus::new(),
        });

        let weak = Arc::downgrade(&transport);
        transport.channels.control.subscribe(
            transport.id.as_str(),
            Arc::new(move |event: &str, data: &Value| {
                if let Some(transport) = weak.upgrade() {
                    transport.handle_notification(event, data);
                }
            }),
        );

        if transport.kind() == TransportKind::Direct {
            let weak = Arc::downgrade(&transport);
            transport.channels.payload.subscribe(
                transport.id.as_str(),
                Arc::new(move |event: &str, _data: &Value, payload: &Bytes| {
                    let Some(transport) = weak.upgrade() else {
                        return;
                    };
                    if event == "rtcp" {
                        transport.app.emit(TransportEvent::Rtcp(payload.clone()));
                    } else {
                        warn!(transport_id = %transport.id, event, "ignoring unknown transport payload");
                    }
                }),
            );
        }

        transport
    }

    #[must_use]
    pub fn id(&self) -> &TransportId {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.variant.lock().kind()
    }

    /// Snapshot of the variant fields
    #[must_use]
    pub fn variant(&self) -> TransportVariant {
        self.variant.lock().clone()
    }

    #[must_use]
    pub fn sctp_parameters(&self) -> Option<SctpParameters> {
        self.sctp_parameters
    }

    #[must_use]
    pub fn sctp_state(&self) -> Option<SctpState> {
        *self.sctp_state.lock()
    }

    #[must_use]
    pub fn app_data(&self) -> &AppData {
        &self.app_data
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    #[must_use]
    pub fn producer(&self, id: &ProducerId) -> Option<Arc<Producer>> {
        self.children.lock().producers.get(id).cloned()
    }

    #[must_use]
    pub fn consumer(&self, id: &ConsumerId) -> Option<Arc<Consumer>> {
        self.children.lock().consumers.get(id).cloned()
    }

    #[must_use]
    pub fn data_producer(&self, id: &DataProducerId) -> Option<Arc<DataProducer>> {
        self.children.lock().data_producers.get(id).cloned()
    }

    #[must_use]
    pub fn data_consumer(&self, id: &DataConsumerId) -> Option<Arc<DataConsumer>> {
        self.children.lock().data_consumers.get(id).cloned()
    }

    pub fn on(&self) -> broadcast::Receiver<TransportEvent> {
        self.app.subscribe()
    }

    pub fn observer(&self) -> broadcast::Receiver<TransportEvent> {
        self.observer.subscribe()
    }

    pub fn close(&self) {
        if !self.closed.transition() {
            return;
        }
        debug!(transport_id = %self.id, "transport closed");

        self.teardown();
        if let Some(router) = self.router.upgrade() {
            router.remove_transport(&self.id);
        }
        self.finish(TransportEvent::Close);

        self.channels
            .control
            .request_detached(Method::TransportClose, self.internal.clone(), Value::Null);
    }

    pub(crate) fn router_closed(&self) {
        if !self.closed.transition() {
            return;
        }
        debug!(transport_id = %self.id, "transport closed by router");

        self.teardown();
        self.finish(TransportEvent::RouterClose);
    }

    fn teardown(&self) {
        self.channels.control.unsubscribe(self.id.as_str());
        self.channels.payload.unsubscribe(self.id.as_str());

        if let Some(state) = self.sctp_state.lock().as_mut() {
            *state = SctpState::Closed;
        }
        self.variant.lock().on_close();

        let children = std::mem::take(&mut *self.children.lock());
        for producer in children.producers.into_values() {
            producer.transport_closed();
        }
        for consumer in children.consumers.into_values() {
            consumer.transport_closed();
        }
        for data_producer in children.data_producers.into_values() {
            data_producer.transport_closed();
        }
        for data_consumer in children.data_consumers.into_values() {
            data_consumer.transport_closed();
        }
    }

    fn finish(&self, event: TransportEvent) {
        self.app.emit(event);
        self.observer.emit(TransportEvent::Close);
        self.app.close();
        self.observer.close();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::closed(format!("Transport {}", self.id)));
        }
        Ok(())
    }

    /// Provide the remote endpoint's parameters
    pub async fn connect(&self, params: ConnectParams) -> Result<()> {
        self.ensure_open()?;
        {
            let variant = self.variant.lock();
            if variant.kind() != params.kind() {
                return Err(Error::Validation(format!(
                    "{:?} connect parameters given to a {:?} transport",
                    params.kind(),
                    variant.kind()
                )));
            }
            match (&*variant, &params) {
                (TransportVariant::Plain(plain), ConnectParams::Plain(p)) => plain.validate_connect(p)?,
                (TransportVariant::Pipe(pipe), ConnectParams::Pipe(p)) => pipe.validate_connect(p)?,
                _ => {}
            }
        }

        let data = self
            .channels
            .control
            .request(Method::TransportConnect, self.internal.clone(), params.to_request()?)
            .await?;

        self.variant.lock().apply_connect_response(data)
    }

    /// Generate new ICE credentials (WebRTC only)
    pub async fn restart_ice(&self) -> Result<IceParameters> {
        self.ensure_open()?;
        if self.kind() != TransportKind::WebRtc {
            return Err(Error::validation("restart_ice() requires a WebRTC transport"));
        }

        let data = self
            .channels
            .control
            .request(Method::TransportRestartIce, self.internal.clone(), Value::Null)
            .await?;
        let response: webrtc::RestartIceResponse = crate::message::decode(data)?;

        if let TransportVariant::WebRtc(webrtc) = &mut *self.variant.lock() {
            webrtc.ice_parameters = response.ice_parameters.clone();
        }
        Ok(response.ice_parameters)
    }

    pub async fn set_max_incoming_bitrate(&self, bitrate: u32) -> Result<()> {
        self.ensure_open()?;
        self.channels
            .control
            .request(
                Method::TransportSetMaxIncomingBitrate,
                self.internal.clone(),
                json!({ "bitrate": bitrate }),
            )
            .await?;
        Ok(())
    }

    pub async fn set_max_outgoing_bitrate(&self, bitrate: u32) -> Result<()> {
        self.ensure_open()?;
        self.channels
            .control
            .request(
                Method::TransportSetMaxOutgoingBitrate,
                self.internal.clone(),
                json!({ "bitrate": bitrate }),
            )
            .await?;
        Ok(())
    }

    /// Fire-and-forget variant of [`Transport::set_max_incoming_bitrate`]
    pub fn set_max_incoming_bitrate_detached(&self, bitrate: u32) {
        if self.is_closed() {
            return;
        }
        self.channels.control.request_detached(
            Method::TransportSetMaxIncomingBitrate,
            self.internal.clone(),
            json!({ "bitrate": bitrate }),
        );
    }

    pub async fn get_stats(&self) -> Result<Value> {
        self.ensure_open()?;
        self.channels
            .control
            .request(Method::TransportGetStats, self.internal.clone(), Value::Null)
            .await
    }

    pub async fn dump(&self) -> Result<Value> {
        self.ensure_open()?;
        self.channels
            .control
            .request(Method::TransportDump, self.internal.clone(), Value::Null)
            .await
    }

    /// Enable `trace` notifications of the given types (`probation`, `bwe`)
    pub async fn enable_trace_event(&self, types: &[&str]) -> Result<()> {
        self.ensure_open()?;
        self.channels
            .control
            .request(
                Method::TransportEnableTraceEvent,
                self.internal.clone(),
                json!({ "types": types }),
            )
            .await?;
        Ok(())
    }

    /// Send an RTCP packet (direct transports only)
    pub fn send_rtcp(&self, rtcp_packet: Bytes) -> Result<()> {
        self.ensure_open()?;
        if self.kind() != TransportKind::Direct {
            return Err(Error::validation("send_rtcp() requires a direct transport"));
        }
        self.channels
            .payload
            .notify("transport.sendRtcp", self.internal.clone(), Value::Null, rtcp_packet);
        Ok(())
    }

    fn router(&self) -> Result<Arc<Router>> {
        self.router
            .upgrade()
            .ok_or_else(|| Error::closed(format!("Router of transport {}", self.id)))
    }

    pub async fn produce(self: &Arc<Self>, options: ProducerOptions) -> Result<Arc<Producer>> {
        self.ensure_open()?;
        let router = self.router()?;

        let id = options.id.unwrap_or_else(ProducerId::random);
        if router.get_producer(&id).is_some() {
            return Err(Error::Validation(format!("a producer with id {id} already exists")));
        }
        if !codecs_match_kind(options.kind, &options.rtp_parameters) {
            return Err(Error::Validation(format!(
                "codec kind does not match producer kind {}",
                options.kind
            )));
        }

        let mapping =
            ortc::get_producer_rtp_parameters_mapping(&options.rtp_parameters, &self.router_rtp_capabilities)?;
        let consumable_rtp_parameters = ortc::get_consumable_rtp_parameters(
            options.kind,
            &options.rtp_parameters,
            &self.router_rtp_capabilities,
            &mapping,
        );

        let internal = self.internal.clone().with_producer(&id);
        let data = self
            .channels
            .control
            .request(
                Method::TransportProduce,
                internal.clone(),
                json!({
                    "kind": options.kind,
                    "rtpParameters": options.rtp_parameters,
                    "rtpMapping": mapping,
                    "keyFrameRequestDelay": options.key_frame_request_delay,
                    "paused": options.paused,
                }),
            )
            .await?;
        let response: ProduceResponse = crate::message::decode(data)?;

        let producer = Producer::new(ProducerInit {
            id: id.clone(),
            internal,
            kind: options.kind,
            rtp_parameters: options.rtp_parameters,
            producer_type: response.producer_type,
            consumable_rtp_parameters,
            paused: options.paused,
            direct: self.kind() == TransportKind::Direct,
            app_data: options.app_data,
            transport: Arc::downgrade(self),
            router: Arc::downgrade(&router),
            channels: self.channels.clone(),
        });

        self.children.lock().producers.insert(id.clone(), Arc::clone(&producer));
        router.add_producer(&producer);
        if self.is_closed() {
            producer.transport_closed();
            return Err(Error::closed(format!("Transport {}", self.id)));
        }

        debug!(transport_id = %self.id, producer_id = %id, kind = %producer.kind(), "producer created");
        self.observer.emit(TransportEvent::NewProducer(id));
        Ok(producer)
    }

    pub async fn consume(self: &Arc<Self>, options: ConsumerOptions) -> Result<Arc<Consumer>> {
        self.ensure_open()?;
        let router = self.router()?;

        let producer = router
            .get_producer(&options.producer_id)
            .ok_or_else(|| Error::Validation(format!("producer {} not found", options.producer_id)))?;

        let pipe = self.kind() == TransportKind::Pipe;
        let rtp_parameters = if pipe {
            producer.consumable_rtp_parameters().clone()
        } else {
            if !ortc::can_consume(producer.consumable_rtp_parameters(), &options.rtp_capabilities) {
                return Err(Error::Validation(format!(
                    "cannot consume producer {}",
                    options.producer_id
                )));
            }
            ortc::get_consumer_rtp_parameters(producer.consumable_rtp_parameters(), &options.rtp_capabilities)?
        };
        let consumer_type = if pipe {
            ConsumerType::Pipe
        } else {
            match producer.producer_type() {
                ProducerType::Simple => ConsumerType::Simple,
                ProducerType::Simulcast => ConsumerType::Simulcast,
                ProducerType::Svc => ConsumerType::Svc,
            }
        };

        let id = ConsumerId::random();
        let internal = self
            .internal
            .clone()
            .with_producer(producer.id())
            .with_consumer(&id);
        let data = self
            .channels
            .control
            .request(
                Method::TransportConsume,
                internal.clone(),
                json!({
                    "kind": producer.kind(),
                    "rtpParameters": rtp_parameters,
                    "type": consumer_type,
                    "consumableRtpEncodings": producer.consumable_rtp_parameters().encodings,
                    "paused": options.paused,
                    "preferredLayers": options.preferred_layers,
                    "ignoreDtx": options.ignore_dtx,
                }),
            )
            .await?;
        let response: ConsumeResponse = crate::message::decode(data)?;

        let consumer = Consumer::new(ConsumerInit {
            id: id.clone(),
            internal,
            producer_id: producer.id().clone(),
            kind: producer.kind(),
            rtp_parameters,
            consumer_type,
            paused: options.paused || response.paused,
            producer_paused: options.producer_paused || response.producer_paused,
            score: response.score,
            preferred_layers: options.preferred_layers,
            app_data: options.app_data,
            producer: Arc::downgrade(&producer),
            transport: Arc::downgrade(self),
            channels: self.channels.clone(),
        });

        self.children.lock().consumers.insert(id.clone(), Arc::clone(&consumer));
        producer.add_consumer(&consumer);
        if producer.is_closed() {
            consumer.producer_closed();
            return Err(Error::closed(format!("Producer {}", producer.id())));
        }
        if self.is_closed() {
            consumer.transport_closed();
            return Err(Error::closed(format!("Transport {}", self.id)));
        }

        debug!(
            transport_id = %self.id,
            consumer_id = %id,
            producer_id = %producer.id(),
            "consumer created"
        );
        self.observer.emit(TransportEvent::NewConsumer(id));
        Ok(consumer)
    }

    pub async fn produce_data(self: &Arc<Self>, options: DataProducerOptions) -> Result<Arc<DataProducer>> {
        self.ensure_open()?;
        let router = self.router()?;

        let id = options.id.unwrap_or_else(DataProducerId::random);
        if router.get_data_producer(&id).is_some() {
            return Err(Error::Validation(format!("a data producer with id {id} already exists")));
        }

        let (data_producer_type, sctp_stream_parameters) = if self.kind() == TransportKind::Direct {
            (DataProducerType::Direct, None)
        } else {
            if self.sctp_parameters.is_none() {
                return Err(Error::validation("SCTP is not enabled on this transport"));
            }
            let params = options
                .sctp_stream_parameters
                .ok_or_else(|| Error::validation("sctpStreamParameters are required"))?;
            (DataProducerType::Sctp, Some(params))
        };

        let internal = self.internal.clone().with_data_producer(&id);
        self.channels
            .control
            .request(
                Method::TransportProduceData,
                internal.clone(),
                json!({
                    "type": data_producer_type,
                    "sctpStreamParameters": sctp_stream_parameters,
                    "label": options.label,
                    "protocol": options.protocol,
                }),
            )
            .await?;

        let data_producer = DataProducer::new(DataProducerInit {
            id: id.clone(),
            internal,
            data_producer_type,
            sctp_stream_parameters,
            label: options.label,
            protocol: options.protocol,
            app_data: options.app_data,
            transport: Arc::downgrade(self),
            router: Arc::downgrade(&router),
            channels: self.channels.clone(),
        });

        self.children
            .lock()
            .data_producers
            .insert(id.clone(), Arc::clone(&data_producer));
        router.add_data_producer(&data_producer);
        if self.is_closed() {
            data_producer.transport_closed();
            return Err(Error::closed(format!("Transport {}", self.id)));
        }

        debug!(transport_id = %self.id, data_producer_id = %id, "data producer created");
        self.observer.emit(TransportEvent::NewDataProducer(id));
        Ok(data_producer)
    }

    fn allocate_sctp_stream_id(&self, parameters: &SctpParameters) -> Result<u16> {
        let in_use: Vec<u16> = self
            .children
            .lock()
            .data_consumers
            .values()
            .filter_map(|c| c.sctp_stream_parameters().map(|p| p.stream_id))
            .collect();

        let mut next = self.next_sctp_stream_id.lock();
        for _ in 0..parameters.mis {
            let candidate = *next;
            *next = (*next + 1) % parameters.mis.max(1);
            if !in_use.contains(&candidate) {
                return Ok(candidate);
            }
        }
        Err(Error::validation("no free SCTP stream id"))
    }

    pub async fn consume_data(self: &Arc<Self>, options: DataConsumerOptions) -> Result<Arc<DataConsumer>> {
        self.ensure_open()?;
        let router = self.router()?;

        let data_producer = router.get_data_producer(&options.data_producer_id).ok_or_else(|| {
            Error::Validation(format!("data producer {} not found", options.data_producer_id))
        })?;

        let (data_consumer_type, sctp_stream_parameters) = if self.kind() == TransportKind::Direct {
            (DataProducerType::Direct, None)
        } else {
            let parameters = self
                .sctp_parameters
                .ok_or_else(|| Error::validation("SCTP is not enabled on this transport"))?;
            let mut stream = data_producer
                .sctp_stream_parameters()
                .unwrap_or_else(|| SctpStreamParameters::ordered(0));
            stream.stream_id = self.allocate_sctp_stream_id(&parameters)?;
            if let Some(ordered) = options.ordered {
                stream.ordered = Some(ordered);
            }
            if options.max_packet_life_time.is_some() || options.max_retransmits.is_some() {
                stream.ordered = Some(false);
                stream.max_packet_life_time = options.max_packet_life_time;
                stream.max_retransmits = options.max_retransmits;
            }
            (DataProducerType::Sctp, Some(stream))
        };

        let id = DataConsumerId::random();
        let internal = self
            .internal
            .clone()
            .with_data_producer(data_producer.id())
            .with_data_consumer(&id);
        self.channels
            .control
            .request(
                Method::TransportConsumeData,
                internal.clone(),
                json!({
                    "type": data_consumer_type,
                    "sctpStreamParameters": sctp_stream_parameters,
                    "label": data_producer.label(),
                    "protocol": data_producer.protocol(),
                }),
            )
            .await?;

        let data_consumer = DataConsumer::new(DataConsumerInit {
            id: id.clone(),
            internal,
            data_producer_id: data_producer.id().clone(),
            data_consumer_type,
            sctp_stream_parameters,
            label: data_producer.label().to_string(),
            protocol: data_producer.protocol().to_string(),
            app_data: options.app_data,
            data_producer: Arc::downgrade(&data_producer),
            transport: Arc::downgrade(self),
            channels: self.channels.clone(),
        });

        self.children
            .lock()
            .data_consumers
            .insert(id.clone(), Arc::clone(&data_consumer));
        data_producer.add_consumer(&data_consumer);
        if data_producer.is_closed() {
            data_consumer.data_producer_closed();
            return Err(Error::closed(format!("DataProducer {}", data_producer.id())));
        }
        if self.is_closed() {
            data_consumer.transport_closed();
            return Err(Error::closed(format!("Transport {}", self.id)));
        }

        debug!(transport_id = %self.id, data_consumer_id = %id, "data consumer created");
        self.observer.emit(TransportEvent::NewDataConsumer(id));
        Ok(data_consumer)
    }

    pub(crate) fn remove_producer(&self, id: &ProducerId) {
        self.children.lock().producers.remove(id);
    }

    pub(crate) fn remove_consumer(&self, id: &ConsumerId) {
        self.children.lock().consumers.remove(id);
    }

    pub(crate) fn remove_data_producer(&self, id: &DataProducerId) {
        self.children.lock().data_producers.remove(id);
    }

    pub(crate) fn remove_data_consumer(&self, id: &DataConsumerId) {
        self.children.lock().data_consumers.remove(id);
    }

    fn handle_notification(&self, event: &str, data: &Value) {
        let parsed = match event {
            "sctpstatechange" => {
                #[derive(Deserialize)]
                #[serde(rename_all = "camelCase")]
                struct SctpStateChange {
                    sctp_state: SctpState,
                }
                serde_json::from_value::<SctpStateChange>(data.clone()).map(|n| {
                    *self.sctp_state.lock() = Some(n.sctp_state);
                    Some(TransportEvent::SctpStateChange(n.sctp_state))
                })
            }
            "trace" => Ok(Some(TransportEvent::Trace(data.clone()))),
            _ => self.variant.lock().handle_notification(event, data),
        };

        match parsed {
            Ok(Some(event)) => {
                self.app.emit(event.clone());
                self.observer.emit(event);
            }
            Ok(None) => warn!(transport_id = %self.id, event, "ignoring unknown transport notification"),
            Err(e) => warn!(transport_id = %self.id, event, error = %e, "malformed transport notification"),
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Whether `kind` matches the MIME type prefix of every codec in `rtp_parameters`
fn codecs_match_kind(kind: MediaKind, rtp_parameters: &RtpParameters) -> bool {
    rtp_parameters
        .media_codecs()
        .all(|codec| codec.mime_type.to_ascii_lowercase().starts_with(kind.mime_prefix()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{ConsumerEvent, ConsumerOptions};
    use crate::producer::ProducerEvent;
    use crate::test_helpers::{
        audio_producer_options, create_router, endpoint_rtp_capabilities, fake_worker,
        video_producer_options, webrtc_transport_options,
    };
    use crate::transport::direct::DirectTransportOptions;
    use crate::transport::webrtc::{DtlsFingerprint, DtlsRole};
    use std::net::IpAddr;
    use tokio::sync::broadcast::error::RecvError;

    fn dtls_parameters() -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "11:22:33".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn test_connect_rejects_other_variant() {
        let (worker, fake) = fake_worker();
        let router = create_router(&worker).await.unwrap();
        let transport = router
            .create_webrtc_transport(webrtc_transport_options())
            .await
            .unwrap();

        let err = transport
            .connect(ConnectParams::Plain(PlainConnectParams {
                ip: Some(IpAddr::from([10, 0, 0, 1])),
                port: Some(5004),
                rtcp_port: None,
                srtp_parameters: None,
            }))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(fake.count("transport.connect"), 0);
    }

    #[tokio::test]
    async fn test_webrtc_connect_applies_local_role() {
        let (worker, fake) = fake_worker();
        let router = create_router(&worker).await.unwrap();
        let transport = router
            .create_webrtc_transport(webrtc_transport_options())
            .await
            .unwrap();
        assert_eq!(transport.kind(), TransportKind::WebRtc);

        transport
            .connect(ConnectParams::WebRtc {
                dtls_parameters: dtls_parameters(),
            })
            .await
            .unwrap();

        let request = fake.wait_for_request("transport.connect").await;
        assert_eq!(request.data["dtlsParameters"]["role"], json!("client"));
        match transport.variant() {
            TransportVariant::WebRtc(webrtc) => {
                assert_eq!(webrtc.dtls_parameters.role, DtlsRole::Server);
                assert_eq!(webrtc.ice_candidates.len(), 1);
            }
            other => panic!("unexpected variant {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_restart_ice() {
        let (worker, _fake) = fake_worker();
        let router = create_router(&worker).await.unwrap();
        let webrtc = router
            .create_webrtc_transport(webrtc_transport_options())
            .await
            .unwrap();
        let direct = router
            .create_direct_transport(DirectTransportOptions::default())
            .await
            .unwrap();

        let ice = webrtc.restart_ice().await.unwrap();
        assert_eq!(ice.username_fragment, "restartedufrag");
        assert!(matches!(
            direct.restart_ice().await.unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_state_notifications_reach_both_streams() {
        let (worker, fake) = fake_worker();
        let router = create_router(&worker).await.unwrap();
        let transport = router
            .create_webrtc_transport(webrtc_transport_options())
            .await
            .unwrap();
        let mut events = transport.on();
        let mut observer = transport.observer();

        fake.notify(
            transport.id().as_str(),
            "icestatechange",
            json!({"iceState": "connected"}),
        );

        let expected = TransportEvent::IceStateChange(IceState::Connected);
        assert_eq!(events.recv().await.unwrap(), expected);
        assert_eq!(observer.recv().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_close_cascades_to_children() {
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
        let producer = send.produce(video_producer_options()).await.unwrap();
        let consumer = recv
            .consume(ConsumerOptions::new(
                producer.id().clone(),
                endpoint_rtp_capabilities(),
            ))
            .await
            .unwrap();
        let mut producer_events = producer.on();
        let mut consumer_events = consumer.on();

        send.close();

        assert_eq!(producer_events.recv().await.unwrap(), ProducerEvent::TransportClose);
        assert_eq!(consumer_events.recv().await.unwrap(), ConsumerEvent::ProducerClose);
        assert!(matches!(consumer_events.recv().await, Err(RecvError::Closed)));
        assert_eq!(router.transport_count(), 1);
        assert!(router.get_producer(producer.id()).is_none());

        fake.wait_for_request("transport.close").await;
        recv.dump().await.unwrap();
        assert_eq!(fake.count("producer.close"), 0);
        assert_eq!(fake.count("consumer.close"), 0);
    }

    #[tokio::test]
    async fn test_produce_validation() {
        let (worker, fake) = fake_worker();
        let router = create_router(&worker).await.unwrap();
        let transport = router
            .create_webrtc_transport(webrtc_transport_options())
            .await
            .unwrap();

        let mut mismatched = audio_producer_options();
        mismatched.kind = MediaKind::Video;
        let err = transport.produce(mismatched).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let producer = transport.produce(audio_producer_options()).await.unwrap();
        let mut duplicate = audio_producer_options();
        duplicate.id = Some(producer.id().clone());
        let err = transport.produce(duplicate).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        assert_eq!(fake.count("transport.produce"), 1);
    }

    #[tokio::test]
    async fn test_consume_unknown_producer() {
        let (worker, _fake) = fake_worker();
        let router = create_router(&worker).await.unwrap();
        let transport = router
            .create_webrtc_transport(webrtc_transport_options())
            .await
            .unwrap();

        let err = transport
            .consume(ConsumerOptions::new(
                ProducerId::new("missing"),
                endpoint_rtp_capabilities(),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_operations_after_close_fail() {
        let (worker, fake) = fake_worker();
        let router = create_router(&worker).await.unwrap();
        let transport = router
            .create_webrtc_transport(webrtc_transport_options())
            .await
            .unwrap();

        transport.close();

        assert!(matches!(transport.dump().await.unwrap_err(), Error::Closed(_)));
        assert!(matches!(
            transport.produce(audio_producer_options()).await.unwrap_err(),
            Error::Closed(_)
        ));
        fake.wait_for_request("transport.close").await;
        assert_eq!(fake.count("transport.dump"), 0);
    }

    #[tokio::test]
    async fn test_direct_transport_rtcp() {
        let (worker, fake) = fake_worker();
        let router = create_router(&worker).await.unwrap();
        let transport = router
            .create_direct_transport(DirectTransportOptions::default())
            .await
            .unwrap();
        let mut events = transport.on();

        transport.send_rtcp(Bytes::from_static(b"rtcp-out")).unwrap();
        let (header, payload) = fake.wait_for_payload("transport.sendRtcp").await;
        assert_eq!(payload, Bytes::from_static(b"rtcp-out"));
        assert_eq!(header.internal.and_then(|i| i.transport_id).as_ref(), Some(transport.id()));

        fake.send_payload(
            transport.id().as_str(),
            "rtcp",
            Value::Null,
            Bytes::from_static(b"rtcp-in"),
        );
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::Rtcp(Bytes::from_static(b"rtcp-in"))
        );
    }
}
