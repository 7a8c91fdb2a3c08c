//! WebRTC transport: ICE and DTLS state

use super::plain::{TransportProtocol, TransportTuple};
use super::sctp::NumSctpStreams;
use super::TransportEvent;
use crate::config::{ListenIp, WebRtcTransportSettings};
use crate::error::Result;
use crate::types::AppData;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceRole {
    #[default]
    Controlled,
    Controlling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceState {
    #[default]
    New,
    Connected,
    Completed,
    Disconnected,
    Closed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_lite: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: IpAddr,
    pub protocol: TransportProtocol,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    #[default]
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsState {
    #[default]
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    #[serde(default)]
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcTransportOptions {
    pub listen_ips: Vec<ListenIp>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub prefer_tcp: bool,
    pub initial_available_outgoing_bitrate: u32,
    pub enable_sctp: bool,
    pub num_sctp_streams: NumSctpStreams,
    pub max_sctp_message_size: u32,
    pub is_data_channel: bool,
    #[serde(skip)]
    pub app_data: AppData,
}

impl WebRtcTransportOptions {
    /// UDP preferred, TCP allowed, SCTP off
    #[must_use]
    pub fn from_settings(settings: &WebRtcTransportSettings) -> Self {
        Self {
            listen_ips: settings.listen_ips.clone(),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            prefer_tcp: false,
            initial_available_outgoing_bitrate: settings.initial_available_outgoing_bitrate,
            enable_sctp: false,
            num_sctp_streams: NumSctpStreams::default(),
            max_sctp_message_size: settings.max_sctp_message_size,
            is_data_channel: true,
            app_data: AppData::new(),
        }
    }

    /// Restrict the transport to TCP candidates
    pub fn force_tcp(&mut self) {
        self.enable_udp = false;
        self.enable_tcp = true;
        self.prefer_udp = false;
        self.prefer_tcp = true;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebRtcTransportData {
    pub ice_role: IceRole,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub ice_state: IceState,
    pub ice_selected_tuple: Option<TransportTuple>,
    pub dtls_parameters: DtlsParameters,
    pub dtls_state: DtlsState,
    pub dtls_remote_cert: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ConnectResponse {
    dtls_local_role: Option<DtlsRole>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct RestartIceResponse {
    pub(crate) ice_parameters: IceParameters,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IceStateNotification {
    ice_state: IceState,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IceSelectedTupleNotification {
    ice_selected_tuple: TransportTuple,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DtlsStateNotification {
    dtls_state: DtlsState,
    #[serde(default)]
    dtls_remote_cert: Option<String>,
}

impl WebRtcTransportData {
    pub(crate) fn apply_connect_response(&mut self, data: Value) -> Result<()> {
        let response: ConnectResponse = crate::message::decode(data)?;
        if let Some(role) = response.dtls_local_role {
            self.dtls_parameters.role = role;
        }
        Ok(())
    }

    pub(crate) fn handle_notification(
        &mut self,
        event: &str,
        data: &Value,
    ) -> serde_json::Result<Option<TransportEvent>> {
        match event {
            "icestatechange" => {
                let IceStateNotification { ice_state } = serde_json::from_value(data.clone())?;
                self.ice_state = ice_state;
                Ok(Some(TransportEvent::IceStateChange(ice_state)))
            }
            "iceselectedtuplechange" => {
                let IceSelectedTupleNotification { ice_selected_tuple } =
                    serde_json::from_value(data.clone())?;
                self.ice_selected_tuple = Some(ice_selected_tuple.clone());
                Ok(Some(TransportEvent::IceSelectedTupleChange(ice_selected_tuple)))
            }
            "dtlsstatechange" => {
                let notification: DtlsStateNotification = serde_json::from_value(data.clone())?;
                self.dtls_state = notification.dtls_state;
                if notification.dtls_remote_cert.is_some() {
                    self.dtls_remote_cert = notification.dtls_remote_cert;
                }
                Ok(Some(TransportEvent::DtlsStateChange(notification.dtls_state)))
            }
            _ => Ok(None),
        }
    }

    pub(crate) fn on_close(&mut self) {
        self.ice_state = IceState::Closed;
        self.ice_selected_tuple = None;
        self.dtls_state = DtlsState::Closed;
    }
}
