//! Frames exchanged with the worker over the control and payload channels

use crate::error::Result;
use crate::types::{ConsumerId, DataConsumerId, DataProducerId, ProducerId, RouterId, TransportId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Correlation key identifying the entity a request targets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Internal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_id: Option<RouterId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_id: Option<TransportId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_id: Option<ProducerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_id: Option<ConsumerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_producer_id: Option<DataProducerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_consumer_id: Option<DataConsumerId>,
}

impl Internal {
    #[must_use]
    pub fn router(router_id: &RouterId) -> Self {
        Self {
            router_id: Some(router_id.clone()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn transport(router_id: &RouterId, transport_id: &TransportId) -> Self {
        Self {
            transport_id: Some(transport_id.clone()),
            ..Self::router(router_id)
        }
    }

    #[must_use]
    pub fn with_producer(mut self, producer_id: &ProducerId) -> Self {
        self.producer_id = Some(producer_id.clone());
        self
    }

    #[must_use]
    pub fn with_consumer(mut self, consumer_id: &ConsumerId) -> Self {
        self.consumer_id = Some(consumer_id.clone());
        self
    }

    #[must_use]
    pub fn with_data_producer(mut self, data_producer_id: &DataProducerId) -> Self {
        self.data_producer_id = Some(data_producer_id.clone());
        self
    }

    #[must_use]
    pub fn with_data_consumer(mut self, data_consumer_id: &DataConsumerId) -> Self {
        self.data_consumer_id = Some(data_consumer_id.clone());
        self
    }
}

/// Request methods understood by the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    WorkerClose,
    WorkerDump,
    WorkerGetResourceUsage,
    WorkerUpdateSettings,
    WorkerCreateRouter,
    RouterClose,
    RouterDump,
    RouterCreateWebRtcTransport,
    RouterCreatePlainTransport,
    RouterCreatePipeTransport,
    RouterCreateDirectTransport,
    TransportClose,
    TransportDump,
    TransportGetStats,
    TransportConnect,
    TransportSetMaxIncomingBitrate,
    TransportSetMaxOutgoingBitrate,
    TransportRestartIce,
    TransportProduce,
    TransportConsume,
    TransportProduceData,
    TransportConsumeData,
    TransportEnableTraceEvent,
    ProducerClose,
    ProducerDump,
    ProducerGetStats,
    ProducerPause,
    ProducerResume,
    ProducerEnableTraceEvent,
    ConsumerClose,
    ConsumerDump,
    ConsumerGetStats,
    ConsumerPause,
    ConsumerResume,
    ConsumerSetPreferredLayers,
    ConsumerSetPriority,
    ConsumerRequestKeyFrame,
    ConsumerEnableTraceEvent,
    DataProducerClose,
    DataProducerDump,
    DataProducerGetStats,
    DataConsumerClose,
    DataConsumerDump,
    DataConsumerGetStats,
    DataConsumerGetBufferedAmount,
    DataConsumerSetBufferedAmountLowThreshold,
}

impl Method {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WorkerClose => "worker.close",
            Self::WorkerDump => "worker.dump",
            Self::WorkerGetResourceUsage => "worker.getResourceUsage",
            Self::WorkerUpdateSettings => "worker.updateSettings",
            Self::WorkerCreateRouter => "worker.createRouter",
            Self::RouterClose => "router.close",
            Self::RouterDump => "router.dump",
            Self::RouterCreateWebRtcTransport => "router.createWebRtcTransport",
            Self::RouterCreatePlainTransport => "router.createPlainTransport",
            Self::RouterCreatePipeTransport => "router.createPipeTransport",
            Self::RouterCreateDirectTransport => "router.createDirectTransport",
            Self::TransportClose => "transport.close",
            Self::TransportDump => "transport.dump",
            Self::TransportGetStats => "transport.getStats",
            Self::TransportConnect => "transport.connect",
            Self::TransportSetMaxIncomingBitrate => "transport.setMaxIncomingBitrate",
            Self::TransportSetMaxOutgoingBitrate => "transport.setMaxOutgoingBitrate",
            Self::TransportRestartIce => "transport.restartIce",
            Self::TransportProduce => "transport.produce",
            Self::TransportConsume => "transport.consume",
            Self::TransportProduceData => "transport.produceData",
            Self::TransportConsumeData => "transport.consumeData",
            Self::TransportEnableTraceEvent => "transport.enableTraceEvent",
            Self::ProducerClose => "producer.close",
            Self::ProducerDump => "producer.dump",
            Self::ProducerGetStats => "producer.getStats",
            Self::ProducerPause => "producer.pause",
            Self::ProducerResume => "producer.resume",
            Self::ProducerEnableTraceEvent => "producer.enableTraceEvent",
            Self::ConsumerClose => "consumer.close",
            Self::ConsumerDump => "consumer.dump",
            Self::ConsumerGetStats => "consumer.getStats",
            Self::ConsumerPause => "consumer.pause",
            Self::ConsumerResume => "consumer.resume",
            Self::ConsumerSetPreferredLayers => "consumer.setPreferredLayers",
            Self::ConsumerSetPriority => "consumer.setPriority",
            Self::ConsumerRequestKeyFrame => "consumer.requestKeyFrame",
            Self::ConsumerEnableTraceEvent => "consumer.enableTraceEvent",
            Self::DataProducerClose => "dataProducer.close",
            Self::DataProducerDump => "dataProducer.dump",
            Self::DataProducerGetStats => "dataProducer.getStats",
            Self::DataConsumerClose => "dataConsumer.close",
            Self::DataConsumerDump => "dataConsumer.dump",
            Self::DataConsumerGetStats => "dataConsumer.getStats",
            Self::DataConsumerGetBufferedAmount => "dataConsumer.getBufferedAmount",
            Self::DataConsumerSetBufferedAmountLowThreshold => {
                "dataConsumer.setBufferedAmountLowThreshold"
            }
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request frame written to the control channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u32,
    pub method: String,
    pub internal: Internal,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// Response frame. Exactly one of `accepted` (with optional data) or `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u32,
    #[serde(default)]
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl ResponseFrame {
    #[must_use]
    pub fn accepted(id: u32, data: Value) -> Self {
        Self {
            id,
            accepted: true,
            error: None,
            reason: None,
            data,
        }
    }

    #[must_use]
    pub fn rejected(id: u32, error: &str, reason: impl Into<String>) -> Self {
        Self {
            id,
            accepted: false,
            error: Some(error.to_string()),
            reason: Some(reason.into()),
            data: Value::Null,
        }
    }
}

/// Unsolicited notification frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationFrame {
    pub target_id: String,
    pub event: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// Anything the worker writes to the control channel
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum IncomingMessage {
    Response(ResponseFrame),
    Notification(NotificationFrame),
}

/// Payload channel notification header, followed on the wire by one raw frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadNotificationFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal: Option<Internal>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// Decode a response body, treating an empty body as the default value
pub(crate) fn decode<T: DeserializeOwned + Default>(data: Value) -> Result<T> {
    if data.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_internal_skips_absent_ids() {
        let internal = Internal::transport(&RouterId::from("r1"), &TransportId::from("t1"))
            .with_producer(&ProducerId::from("p1"));
        assert_eq!(
            serde_json::to_value(&internal).unwrap(),
            json!({"routerId": "r1", "transportId": "t1", "producerId": "p1"})
        );
    }

    #[test]
    fn test_incoming_message_discrimination() {
        let response: IncomingMessage =
            serde_json::from_value(json!({"id": 3, "accepted": true, "data": {"x": 1}})).unwrap();
        assert!(matches!(response, IncomingMessage::Response(ref r) if r.id == 3 && r.accepted));

        let error: IncomingMessage =
            serde_json::from_value(json!({"id": 4, "error": "TypeError", "reason": "bad"})).unwrap();
        assert!(matches!(error, IncomingMessage::Response(ref r) if r.error.is_some()));

        let notification: IncomingMessage =
            serde_json::from_value(json!({"targetId": "p1", "event": "score", "data": []})).unwrap();
        assert!(matches!(notification, IncomingMessage::Notification(ref n) if n.event == "score"));
    }
}
