//! Router: a routing domain owning transports
//!
//! Keeps non-owning indexes of every live producer and data producer created
//! on its transports so consumers on any transport can find them by id.

use crate::bus::EventBus;
use crate::config::RouterSettings;
use crate::data_producer::DataProducer;
use crate::error::{Error, Result};
use crate::lifecycle::ClosedFlag;
use crate::message::{Internal, Method};
use crate::ortc;
use crate::producer::Producer;
use crate::rtp_parameters::{RtpCapabilities, RtpCodecCapability};
use crate::transport::direct::{DirectTransportData, DirectTransportOptions};
use crate::transport::pipe::{PipeTransportData, PipeTransportOptions};
use crate::transport::plain::{PlainTransportData, PlainTransportOptions};
use crate::transport::webrtc::{WebRtcTransportData, WebRtcTransportOptions};
use crate::transport::{SctpInfo, Transport, TransportInit, TransportVariant};
use crate::types::{AppData, DataProducerId, ProducerId, RouterId, TransportId};
use crate::worker::{Channels, Worker};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    Close,
    WorkerClose,
    NewTransport(TransportId),
}

#[derive(Debug, Clone, Default)]
pub struct RouterOptions {
    pub media_codecs: Vec<RtpCodecCapability>,
    pub app_data: AppData,
}

impl From<&RouterSettings> for RouterOptions {
    fn from(settings: &RouterSettings) -> Self {
        Self {
            media_codecs: settings.media_codecs.clone(),
            app_data: AppData::new(),
        }
    }
}

pub(crate) struct RouterInit {
    pub(crate) id: RouterId,
    pub(crate) rtp_capabilities: RtpCapabilities,
    pub(crate) app_data: AppData,
    pub(crate) worker: Weak<Worker>,
    pub(crate) channels: Channels,
}

pub struct Router {
    id: RouterId,
    internal: Internal,
    rtp_capabilities: Arc<RtpCapabilities>,
    app_data: AppData,
    transports: Mutex<HashMap<TransportId, Arc<Transport>>>,
    producers: Mutex<HashMap<ProducerId, Weak<Producer>>>,
    data_producers: Mutex<HashMap<DataProducerId, Weak<DataProducer>>>,
    closed: ClosedFlag,
    worker: Weak<Worker>,
    channels: Channels,
    app: EventBus<RouterEvent>,
    observer: EventBus<RouterEvent>,
}

impl Router {
    pub(crate) fn new(init: RouterInit) -> Arc<Self> {
        Arc::new(Self {
            internal: Internal::router(&init.id),
            id: init.id,
            rtp_capabilities: Arc::new(init.rtp_capabilities),
            app_data: init.app_data,
            transports: Mutex::new(HashMap::new()),
            producers: Mutex::new(HashMap::new()),
            data_producers: Mutex::new(HashMap::new()),
            closed: ClosedFlag::default(),
            worker: init.worker,
            channels: init.channels,
            app: EventBus::new(),
            observer: EventBus::new(),
        })
    }

    #[must_use]
    pub fn id(&self) -> &RouterId {
        &self.id
    }

    /// Receive capabilities derived from the configured media codecs
    #[must_use]
    pub fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.rtp_capabilities
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
    pub fn transport_count(&self) -> usize {
        self.transports.lock().len()
    }

    #[must_use]
    pub fn get_producer(&self, id: &ProducerId) -> Option<Arc<Producer>> {
        self.producers.lock().get(id).and_then(Weak::upgrade)
    }

    #[must_use]
    pub fn get_data_producer(&self, id: &DataProducerId) -> Option<Arc<DataProducer>> {
        self.data_producers.lock().get(id).and_then(Weak::upgrade)
    }

    pub fn on(&self) -> broadcast::Receiver<RouterEvent> {
        self.app.subscribe()
    }

    pub fn observer(&self) -> broadcast::Receiver<RouterEvent> {
        self.observer.subscribe()
    }

    /// Whether a receiver with `rtp_capabilities` can consume the producer.
    /// Unknown producers yield false.
    #[must_use]
    pub fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        let Some(producer) = self.get_producer(producer_id) else {
            warn!(router_id = %self.id, producer_id = %producer_id, "can_consume() on unknown producer");
            return false;
        };
        ortc::can_consume(producer.consumable_rtp_parameters(), rtp_capabilities)
    }

    pub fn close(&self) {
        if !self.closed.transition() {
            return;
        }
        debug!(router_id = %self.id, "router closed");

        self.teardown();
        if let Some(worker) = self.worker.upgrade() {
            worker.remove_router(&self.id);
        }
        self.finish(RouterEvent::Close);

        self.channels
            .control
            .request_detached(Method::RouterClose, self.internal.clone(), Value::Null);
    }

    pub(crate) fn worker_closed(&self) {
        if !self.closed.transition() {
            return;
        }
        debug!(router_id = %self.id, "router closed by worker");

        self.teardown();
        self.finish(RouterEvent::WorkerClose);
    }

    fn teardown(&self) {
        let transports = std::mem::take(&mut *self.transports.lock());
        for transport in transports.into_values() {
            transport.router_closed();
        }
        self.producers.lock().clear();
        self.data_producers.lock().clear();
    }

    fn finish(&self, event: RouterEvent) {
        self.app.emit(event);
        self.observer.emit(RouterEvent::Close);
        self.app.close();
        self.observer.close();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::closed(format!("Router {}", self.id)));
        }
        Ok(())
    }

    pub async fn dump(&self) -> Result<Value> {
        self.ensure_open()?;
        self.channels
            .control
            .request(Method::RouterDump, self.internal.clone(), Value::Null)
            .await
    }

    pub async fn create_webrtc_transport(
        self: &Arc<Self>,
        options: WebRtcTransportOptions,
    ) -> Result<Arc<Transport>> {
        if options.listen_ips.is_empty() {
            return Err(Error::validation("listen_ips must not be empty"));
        }
        if !options.enable_udp && !options.enable_tcp {
            return Err(Error::validation("at least one of UDP and TCP must be enabled"));
        }
        let data = serde_json::to_value(&options)?;
        self.create_transport(Method::RouterCreateWebRtcTransport, data, options.app_data, |data| {
            Ok(TransportVariant::WebRtc(crate::message::decode::<WebRtcTransportData>(data)?))
        })
        .await
    }

    pub async fn create_plain_transport(
        self: &Arc<Self>,
        options: PlainTransportOptions,
    ) -> Result<Arc<Transport>> {
        let data = serde_json::to_value(&options)?;
        let (rtcp_mux, comedia) = (options.rtcp_mux, options.comedia);
        self.create_transport(Method::RouterCreatePlainTransport, data, options.app_data, move |data| {
            let mut plain = crate::message::decode::<PlainTransportData>(data)?;
            plain.rtcp_mux = rtcp_mux;
            plain.comedia = comedia;
            Ok(TransportVariant::Plain(plain))
        })
        .await
    }

    pub async fn create_pipe_transport(
        self: &Arc<Self>,
        options: PipeTransportOptions,
    ) -> Result<Arc<Transport>> {
        let data = serde_json::to_value(&options)?;
        let rtx = options.enable_rtx;
        self.create_transport(Method::RouterCreatePipeTransport, data, options.app_data, move |data| {
            let mut pipe = crate::message::decode::<PipeTransportData>(data)?;
            pipe.rtx = rtx;
            Ok(TransportVariant::Pipe(pipe))
        })
        .await
    }

    pub async fn create_direct_transport(
        self: &Arc<Self>,
        options: DirectTransportOptions,
    ) -> Result<Arc<Transport>> {
        let data = serde_json::to_value(&options)?;
        let max_message_size = options.max_message_size;
        self.create_transport(Method::RouterCreateDirectTransport, data, options.app_data, move |_| {
            Ok(TransportVariant::Direct(DirectTransportData { max_message_size }))
        })
        .await
    }

    async fn create_transport(
        self: &Arc<Self>,
        method: Method,
        data: Value,
        app_data: AppData,
        variant: impl FnOnce(Value) -> Result<TransportVariant>,
    ) -> Result<Arc<Transport>> {
        self.ensure_open()?;

        let id = TransportId::random();
        let response = self
            .channels
            .control
            .request(method, Internal::transport(&self.id, &id), data)
            .await?;
        let sctp: SctpInfo = crate::message::decode(response.clone())?;

        let transport = Transport::new(TransportInit {
            id: id.clone(),
            router_id: self.id.clone(),
            variant: variant(response)?,
            sctp,
            router_rtp_capabilities: Arc::clone(&self.rtp_capabilities),
            app_data,
            router: Arc::downgrade(self),
            channels: self.channels.clone(),
        });

        self.transports.lock().insert(id.clone(), Arc::clone(&transport));
        if self.is_closed() {
            transport.router_closed();
            return Err(Error::closed(format!("Router {}", self.id)));
        }

        debug!(router_id = %self.id, transport_id = %id, kind = ?transport.kind(), "transport created");
        self.observer.emit(RouterEvent::NewTransport(id));
        Ok(transport)
    }

    pub(crate) fn remove_transport(&self, id: &TransportId) {
        self.transports.lock().remove(id);
    }

    pub(crate) fn add_producer(&self, producer: &Arc<Producer>) {
        self.producers
            .lock()
            .insert(producer.id().clone(), Arc::downgrade(producer));
    }

    pub(crate) fn remove_producer(&self, id: &ProducerId) {
        self.producers.lock().remove(id);
    }

    pub(crate) fn add_data_producer(&self, data_producer: &Arc<DataProducer>) {
        self.data_producers
            .lock()
            .insert(data_producer.id().clone(), Arc::downgrade(data_producer));
    }

    pub(crate) fn remove_data_producer(&self, id: &DataProducerId) {
        self.data_producers.lock().remove(id);
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
