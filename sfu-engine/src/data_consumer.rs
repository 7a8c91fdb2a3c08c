//! DataConsumer: delivers a data producer's messages to one endpoint

use crate::bus::EventBus;
use crate::data_producer::{DataProducer, DataProducerType};
use crate::error::{Error, Result};
use crate::lifecycle::ClosedFlag;
use crate::message::{Internal, Method};
use crate::transport::sctp::SctpStreamParameters;
use crate::transport::Transport;
use crate::types::{AppData, DataConsumerId, DataProducerId};
use crate::worker::Channels;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataConsumerEvent {
    Close,
    TransportClose,
    DataProducerClose,
    SctpSendBufferFull,
    BufferedAmountLow(u32),
    Message { ppid: u32, payload: Bytes },
}

#[derive(Debug, Clone)]
pub struct DataConsumerOptions {
    pub data_producer_id: DataProducerId,
    /// Overrides the data producer's ordering. Unordered delivery may set one
    /// of the partial reliability limits below.
    pub ordered: Option<bool>,
    pub max_packet_life_time: Option<u16>,
    pub max_retransmits: Option<u16>,
    pub app_data: AppData,
}

impl DataConsumerOptions {
    #[must_use]
    pub fn new(data_producer_id: DataProducerId) -> Self {
        Self {
            data_producer_id,
            ordered: None,
            max_packet_life_time: None,
            max_retransmits: None,
            app_data: AppData::new(),
        }
    }
}

pub(crate) struct DataConsumerInit {
    pub(crate) id: DataConsumerId,
    pub(crate) internal: Internal,
    pub(crate) data_producer_id: DataProducerId,
    pub(crate) data_consumer_type: DataProducerType,
    pub(crate) sctp_stream_parameters: Option<SctpStreamParameters>,
    pub(crate) label: String,
    pub(crate) protocol: String,
    pub(crate) app_data: AppData,
    pub(crate) data_producer: Weak<DataProducer>,
    pub(crate) transport: Weak<Transport>,
    pub(crate) channels: Channels,
}

pub struct DataConsumer {
    id: DataConsumerId,
    internal: Internal,
    data_producer_id: DataProducerId,
    data_consumer_type: DataProducerType,
    sctp_stream_parameters: Option<SctpStreamParameters>,
    label: String,
    protocol: String,
    app_data: AppData,
    closed: ClosedFlag,
    data_producer: Weak<DataProducer>,
    transport: Weak<Transport>,
    channels: Channels,
    app: EventBus<DataConsumerEvent>,
    observer: EventBus<DataConsumerEvent>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct BufferedAmount {
    buffered_amount: u32,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct MessageHeader {
    ppid: u32,
}

impl DataConsumer {
    pub(crate) fn new(init: DataConsumerInit) -> Arc<Self> {
        let consumer = Arc::new(Self {
            id: init.id,
            internal: init.internal,
            data_producer_id: init.data_producer_id,
            data_consumer_type: init.data_consumer_type,
            sctp_stream_parameters: init.sctp_stream_parameters,
            label: init.label,
            protocol: init.protocol,
            app_data: init.app_data,
            closed: ClosedFlag::default(),
            data_producer: init.data_producer,
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
            Arc::new(move |event: &str, data: &Value, payload: &Bytes| {
                if let Some(consumer) = weak.upgrade() {
                    consumer.handle_payload(event, data, payload);
                }
            }),
        );

        consumer
    }

    #[must_use]
    pub fn id(&self) -> &DataConsumerId {
        &self.id
    }

    #[must_use]
    pub fn data_producer_id(&self) -> &DataProducerId {
        &self.data_producer_id
    }

    #[must_use]
    pub const fn data_consumer_type(&self) -> DataProducerType {
        self.data_consumer_type
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
    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    pub fn on(&self) -> broadcast::Receiver<DataConsumerEvent> {
        self.app.subscribe()
    }

    pub fn observer(&self) -> broadcast::Receiver<DataConsumerEvent> {
        self.observer.subscribe()
    }

    pub fn close(&self) {
        if !self.closed.transition() {
            return;
        }
        debug!(data_consumer_id = %self.id, "data consumer closed");

        self.teardown();
        self.finish(DataConsumerEvent::Close);

        self.channels
            .control
            .request_detached(Method::DataConsumerClose, self.internal.clone(), Value::Null);
    }

    pub(crate) fn transport_closed(&self) {
        if !self.closed.transition() {
            return;
        }
        self.teardown();
        self.finish(DataConsumerEvent::TransportClose);
    }

    pub(crate) fn data_producer_closed(&self) {
        if !self.closed.transition() {
            return;
        }
        debug!(data_consumer_id = %self.id, "data consumer closed by data producer");

        self.teardown();
        self.finish(DataConsumerEvent::DataProducerClose);
    }

    fn teardown(&self) {
        self.channels.control.unsubscribe(self.id.as_str());
        self.channels.payload.unsubscribe(self.id.as_str());
        if let Some(data_producer) = self.data_producer.upgrade() {
            data_producer.remove_consumer(&self.id);
        }
        if let Some(transport) = self.transport.upgrade() {
            transport.remove_data_consumer(&self.id);
        }
    }

    fn finish(&self, event: DataConsumerEvent) {
        self.app.emit(event);
        self.observer.emit(DataConsumerEvent::Close);
        self.app.close();
        self.observer.close();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::closed(format!("DataConsumer {}", self.id)));
        }
        Ok(())
    }

    pub async fn get_stats(&self) -> Result<Value> {
        self.ensure_open()?;
        self.channels
            .control
            .request(Method::DataConsumerGetStats, self.internal.clone(), Value::Null)
            .await
    }

    pub async fn dump(&self) -> Result<Value> {
        self.ensure_open()?;
        self.channels
            .control
            .request(Method::DataConsumerDump, self.internal.clone(), Value::Null)
            .await
    }

    /// Bytes queued in the SCTP send buffer
    pub async fn get_buffered_amount(&self) -> Result<u32> {
        self.ensure_open()?;
        let data = self
            .channels
            .control
            .request(
                Method::DataConsumerGetBufferedAmount,
                self.internal.clone(),
                Value::Null,
            )
            .await?;
        let response: BufferedAmount = crate::message::decode(data)?;
        Ok(response.buffered_amount)
    }

    pub async fn set_buffered_amount_low_threshold(&self, threshold: u32) -> Result<()> {
        self.ensure_open()?;
        self.channels
            .control
            .request(
                Method::DataConsumerSetBufferedAmountLowThreshold,
                self.internal.clone(),
                json!({ "threshold": threshold }),
            )
            .await?;
        Ok(())
    }

    fn handle_notification(&self, event: &str, data: &Value) {
        match event {
            "dataproducerclose" => self.data_producer_closed(),
            "sctpsendbufferfull" => {
                self.app.emit(DataConsumerEvent::SctpSendBufferFull);
            }
            "bufferedamountlow" => match serde_json::from_value::<BufferedAmount>(data.clone()) {
                Ok(BufferedAmount { buffered_amount }) => {
                    self.app.emit(DataConsumerEvent::BufferedAmountLow(buffered_amount));
                }
                Err(e) => warn!(
                    data_consumer_id = %self.id,
                    error = %e,
                    "malformed bufferedamountlow notification"
                ),
            },
            _ => warn!(data_consumer_id = %self.id, event, "ignoring unknown data consumer notification"),
        }
    }

    fn handle_payload(&self, event: &str, data: &Value, payload: &Bytes) {
        if event != "message" {
            warn!(data_consumer_id = %self.id, event, "ignoring unknown data consumer payload");
            return;
        }
        let ppid = serde_json::from_value::<MessageHeader>(data.clone())
            .map(|header| header.ppid)
            .unwrap_or_default();
        self.app.emit(DataConsumerEvent::Message {
            ppid,
            payload: payload.clone(),
        });
    }
}

impl std::fmt::Debug for DataConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataConsumer")
            .field("id", &self.id)
            .field("data_producer_id", &self.data_producer_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
