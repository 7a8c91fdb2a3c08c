//! Request bodies accepted by [`Peer`](crate::Peer) operations

use serde::{Deserialize, Serialize};
use sfu_engine::transport::sctp::{SctpCapabilities, SctpStreamParameters};
use sfu_engine::transport::webrtc::DtlsParameters;
use sfu_engine::{AppData, ConsumerId, MediaKind, RtpParameters, TransportId};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateWebRtcTransportRequest {
    pub force_tcp: bool,
    pub producing: bool,
    pub consuming: bool,
    /// Enables SCTP when present
    pub sctp_capabilities: Option<SctpCapabilities>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectWebRtcTransportRequest {
    pub transport_id: TransportId,
    pub dtls_parameters: DtlsParameters,
}

/// `app_data` must carry `source` and `roomId`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(default)]
    pub app_data: AppData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProduceDataRequest {
    pub sctp_stream_parameters: Option<SctpStreamParameters>,
    pub label: String,
    pub protocol: String,
    pub app_data: AppData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetConsumerPreferredLayersRequest {
    pub consumer_id: ConsumerId,
    pub spatial_layer: u8,
    #[serde(default)]
    pub temporal_layer: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetConsumerPriorityRequest {
    pub consumer_id: ConsumerId,
    pub priority: u8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_produce_request_from_client_json() {
        let request: ProduceRequest = serde_json::from_value(json!({
            "kind": "audio",
            "rtpParameters": {
                "codecs": [{"mimeType": "audio/opus", "payloadType": 111, "clockRate": 48000, "channels": 2}],
                "encodings": [{"ssrc": 1234}]
            },
            "appData": {"source": "mic", "roomId": "lobby"}
        }))
        .unwrap();

        assert_eq!(request.kind, MediaKind::Audio);
        assert_eq!(request.rtp_parameters.codecs[0].payload_type, 111);
        assert_eq!(request.app_data["source"], json!("mic"));
    }

    #[test]
    fn test_create_transport_request_defaults() {
        let request: CreateWebRtcTransportRequest =
            serde_json::from_value(json!({"producing": true})).unwrap();
        assert!(request.producing);
        assert!(!request.consuming);
        assert!(!request.force_tcp);
        assert!(request.sctp_capabilities.is_none());
    }
}
