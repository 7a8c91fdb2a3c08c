//! DataProducer: SCTP (or direct) message source

use crate::bus::EventBus;
use crate::data_consumer::DataConsumer;
use crate::error::{Error, Result};
use crate::lifecycle::ClosedFlag;
use crate::message::{Internal, Method};
use crate::router::Router;
use crate::transport::sctp::SctpStreamParameters;
use crate::transport::Transport;
use crate::types::{AppData, DataConsumerId, DataProducerId};
use crate::worker::Channels;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::debug;

/// SCTP payload protocol identifiers for WebRTC data channels
pub mod ppid {
    pub const STRING: u32 = 51;
    pub const BINARY: u32 = 53;
    pub const EMPTY_STRING: u32 = 56;
    pub const EMPTY_BINARY: u32 = 57;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataProducerType {
    #[default]
    Sctp,
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataProducerEvent {
    Close,
    TransportClose,
}

#[derive(Debug, Clone, Default)]
pub struct DataProducerOptions {
    pub id: Option<DataProducerId>,
    /// Required on SCTP-enabled transports, ignored on direct ones
    pub sctp_stream_parameters: Option<SctpStreamParameters>,
    pub label: String,
    pub protocol: String,
    pub app_data: AppData,
}

pub(crate) struct DataProducerInit {
    pub(crate) id: DataProducerId,
    pub(crate) internal: Internal,
    pub(crate) data_producer_type: DataProducerType,
    pub(crate) sctp_stream_parameters: Option<SctpStreamParameters>,
    pub(crate) label: String,
    pub(crate) protocol: String,
    pub(crate) app_data: AppData,
    pub(crate) transport: Weak<Transport>,
    pub(crate) router: Weak<Router>,
    pub(crate) channels: Channels,
}

pub struct DataProducer {
    id: DataProducerId,
    internal: Internal,
    data_producer_type: DataProducerType,
    sctp_stream_parameters: Option<SctpStreamParameters>,
    label: String,
    protocol: String,
    app_data: AppData,
    consumers: Mutex<HashMap<DataConsumerId, Weak<DataConsumer>>>,
    closed: ClosedFlag,
    transport: Weak<Transport>,
    router: Weak<Router>,
    channels: Channels,
    app: EventBus<DataProducerEvent>,
    observer: EventBus<DataProducerEvent>,
}

impl DataProducer {
    pub(crate) fn new(init: DataProducerInit) -> Arc<Self> {
        Arc::new(Self {
            id: init.id,
            internal: init.internal,
            data_producer_type: init.data_producer_type,
            sctp_stream_parameters: init.sctp_stream_parameters,
            label: init.label,
            protocol: init.protocol,
            app_data: init.app_data,
            consumers: Mutex::new(HashMap::new()),
            closed: ClosedFlag::default(),
            transport: init.transport,
            router: init.router,
            channels: init.channels,
            app: EventBus::new(),
            observer: EventBus::new(),
        })
    }

    #[must_use]
    pub fn id(&self) -> &DataProducerId {
        &self.id
    }

    #[must_use]
    pub const fn data_producer_type(&self) -> DataProducerType {
        self.data_producer_type
    }

    #[must_use]
    pub fn sctp_stream_parameters(&self) -> Option<SctpStreamParameters> {
        self.sctp_stream_parameters
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    #[must_use]
    pub fn app_data(&self) -> &AppData {
        &self.app_data
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    pub fn on(&self) -> broadcast::Receiver<DataProducerEvent> {
        self.app.subscribe()
    }

    pub fn observer(&self) -> broadcast::Receiver<DataProducerEvent> {
        self.observer.subscribe()
    }

    pub fn close(&self) {
        if !self.closed.transition() {
            return;
        }
        debug!(data_producer_id = %self.id, "data producer closed");

        self.teardown();
        if let Some(transport) = self.transport.upgrade() {
            transport.remove_data_producer(&self.id);
        }
        self.finish(DataProducerEvent::Close);

        self.channels
            .control
            .request_detached(Method::DataProducerClose, self.internal.clone(), Value::Null);
    }

    pub(crate) fn transport_closed(&self) {
        if !self.closed.transition() {
            return;
        }
        debug!(data_producer_id = %self.id, "data producer closed by transport");

        self.teardown();
        self.finish(DataProducerEvent::TransportClose);
    }

    fn teardown(&self) {
        self.channels.control.unsubscribe(self.id.as_str());
        if let Some(router) = self.router.upgrade() {
            router.remove_data_producer(&self.id);
        }

        let consumers = std::mem::take(&mut *self.consumers.lock());
        for consumer in consumers.into_values().filter_map(|c| c.upgrade()) {
            consumer.data_producer_closed();
        }
    }

    fn finish(&self, event: DataProducerEvent) {
        self.app.emit(event);
        self.observer.emit(DataProducerEvent::Close);
        self.app.close();
        self.observer.close();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::closed(format!("DataProducer {}", self.id)));
        }
        Ok(())
    }

    /// Send a message to every consumer of this data producer. Only data
    /// producers of a direct transport accept this.
    pub fn send(&self, message: Bytes, ppid: u32) -> Result<()> {
        self.ensure_open()?;
        if self.data_producer_type != DataProducerType::Direct {
            return Err(Error::validation("send() is only available on direct transports"));
        }
        self.channels.payload.notify(
            "dataProducer.send",
            self.internal.clone(),
            json!({ "ppid": ppid }),
            message,
        );
        Ok(())
    }

    pub async fn get_stats(&self) -> Result<Value> {
        self.ensure_open()?;
        self.channels
            .control
            .request(Method::DataProducerGetStats, self.internal.clone(), Value::Null)
            .await
    }

    pub async fn dump(&self) -> Result<Value> {
        self.ensure_open()?;
        self.channels
            .control
            .request(Method::DataProducerDump, self.internal.clone(), Value::Null)
            .await
    }

    pub(crate) fn add_consumer(&self, consumer: &Arc<DataConsumer>) {
        self.consumers
            .lock()
            .insert(consumer.id().clone(), Arc::downgrade(consumer));
    }

    pub(crate) fn remove_consumer(&self, consumer_id: &DataConsumerId) {
        self.consumers.lock().remove(consumer_id);
    }
}

impl std::fmt::Debug for DataProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataProducer")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
