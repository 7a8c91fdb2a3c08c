//! Plain RTP transport fields, connect parameters and notifications

use super::sctp::NumSctpStreams;
use super::TransportEvent;
use crate::config::ListenIp;
use crate::error::{Error, Result};
use crate::types::AppData;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

/// Local/remote address pair of a transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportTuple {
    pub local_ip: IpAddr,
    pub local_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    pub protocol: TransportProtocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SrtpCryptoSuite {
    #[serde(rename = "AEAD_AES_256_GCM")]
    AeadAes256Gcm,
    #[serde(rename = "AEAD_AES_128_GCM")]
    AeadAes128Gcm,
    #[default]
    #[serde(rename = "AES_CM_128_HMAC_SHA1_80")]
    AesCm128HmacSha1_80,
    #[serde(rename = "AES_CM_128_HMAC_SHA1_32")]
    AesCm128HmacSha1_32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SrtpParameters {
    pub crypto_suite: SrtpCryptoSuite,
    pub key_base64: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlainTransportOptions {
    pub listen_ip: ListenIp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub rtcp_mux: bool,
    pub comedia: bool,
    pub enable_sctp: bool,
    pub num_sctp_streams: NumSctpStreams,
    pub max_sctp_message_size: u32,
    pub enable_srtp: bool,
    pub srtp_crypto_suite: SrtpCryptoSuite,
    #[serde(skip)]
    pub app_data: AppData,
}

impl PlainTransportOptions {
    #[must_use]
    pub fn new(listen_ip: ListenIp) -> Self {
        Self {
            listen_ip,
            port: None,
            rtcp_mux: true,
            comedia: false,
            enable_sctp: false,
            num_sctp_streams: NumSctpStreams::default(),
            max_sctp_message_size: 262_144,
            enable_srtp: false,
            srtp_crypto_suite: SrtpCryptoSuite::default(),
            app_data: AppData::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlainTransportData {
    pub tuple: Option<TransportTuple>,
    pub rtcp_tuple: Option<TransportTuple>,
    pub srtp_parameters: Option<SrtpParameters>,
    pub rtcp_mux: bool,
    pub comedia: bool,
}

/// Remote endpoint of a plain transport. Address fields may be omitted in
/// comedia mode, where the worker learns them from the first packet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlainConnectParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtcp_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub srtp_parameters: Option<SrtpParameters>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ConnectResponse {
    tuple: Option<TransportTuple>,
    rtcp_tuple: Option<TransportTuple>,
    srtp_parameters: Option<SrtpParameters>,
}

#[derive(Deserialize)]
struct TupleNotification {
    tuple: TransportTuple,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RtcpTupleNotification {
    rtcp_tuple: TransportTuple,
}

impl PlainTransportData {
    pub(crate) fn validate_connect(&self, params: &PlainConnectParams) -> Result<()> {
        if self.rtcp_mux && params.rtcp_port.is_some() {
            return Err(Error::validation("rtcpPort must not be given with rtcpMux"));
        }
        if !self.comedia && (params.ip.is_none() || params.port.is_none()) {
            return Err(Error::validation("ip and port are required without comedia"));
        }
        Ok(())
    }

    pub(crate) fn apply_connect_response(&mut self, data: Value) -> Result<()> {
        let response: ConnectResponse = crate::message::decode(data)?;
        if response.tuple.is_some() {
            self.tuple = response.tuple;
        }
        if response.rtcp_tuple.is_some() {
            self.rtcp_tuple = response.rtcp_tuple;
        }
        if response.srtp_parameters.is_some() {
            self.srtp_parameters = response.srtp_parameters;
        }
        Ok(())
    }

    pub(crate) fn handle_notification(
        &mut self,
        event: &str,
        data: &Value,
    ) -> serde_json::Result<Option<TransportEvent>> {
        match event {
            "tuple" => {
                let TupleNotification { tuple } = serde_json::from_value(data.clone())?;
                self.tuple = Some(tuple.clone());
                Ok(Some(TransportEvent::Tuple(tuple)))
            }
            "rtcptuple" => {
                let RtcpTupleNotification { rtcp_tuple } = serde_json::from_value(data.clone())?;
                self.rtcp_tuple = Some(rtcp_tuple.clone());
                Ok(Some(TransportEvent::RtcpTuple(rtcp_tuple)))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connect_validation() {
        let data = PlainTransportData {
            rtcp_mux: true,
            ..PlainTransportData::default()
        };
        let params = PlainConnectParams {
            ip: Some(IpAddr::from([10, 0, 0, 1])),
            port: Some(5004),
            rtcp_port: Some(5005),
            srtp_parameters: None,
        };
        assert!(matches!(data.validate_connect(&params), Err(Error::Validation(_))));

        let comedia = PlainTransportData {
            comedia: true,
            ..PlainTransportData::default()
        };
        assert!(comedia.validate_connect(&PlainConnectParams::default()).is_ok());
    }

    #[test]
    fn test_tuple_notification_updates_fields() {
        let mut data = PlainTransportData::default();
        let event = data
            .handle_notification(
                "tuple",
                &json!({"tuple": {"localIp": "127.0.0.1", "localPort": 40001, "protocol": "udp"}}),
            )
            .unwrap();
        assert!(matches!(event, Some(TransportEvent::Tuple(_))));
        assert_eq!(data.tuple.as_ref().map(|t| t.local_port), Some(40001));
        assert!(data.handle_notification("bogus", &Value::Null).unwrap().is_none());
    }
}
