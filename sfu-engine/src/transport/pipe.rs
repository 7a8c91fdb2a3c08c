//! Pipe transport: RTP between two routers, possibly on different hosts

use super::plain::{SrtpCryptoSuite, SrtpParameters, TransportTuple};
use super::sctp::NumSctpStreams;
use crate::config::ListenIp;
use crate::error::{Error, Result};
use crate::types::AppData;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::IpAddr;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipeTransportOptions {
    pub listen_ip: ListenIp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub enable_sctp: bool,
    pub num_sctp_streams: NumSctpStreams,
    pub max_sctp_message_size: u32,
    pub enable_rtx: bool,
    pub enable_srtp: bool,
    pub srtp_crypto_suite: SrtpCryptoSuite,
    #[serde(skip)]
    pub app_data: AppData,
}

impl PipeTransportOptions {
    #[must_use]
    pub fn new(listen_ip: ListenIp) -> Self {
        Self {
            listen_ip,
            port: None,
            enable_sctp: false,
            num_sctp_streams: NumSctpStreams::default(),
            max_sctp_message_size: 268_435_456,
            enable_rtx: false,
            enable_srtp: false,
            srtp_crypto_suite: SrtpCryptoSuite::default(),
            app_data: AppData::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipeTransportData {
    pub tuple: Option<TransportTuple>,
    pub srtp_parameters: Option<SrtpParameters>,
    pub rtx: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipeConnectParams {
    pub ip: IpAddr,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub srtp_parameters: Option<SrtpParameters>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ConnectResponse {
    tuple: Option<TransportTuple>,
}

impl PipeTransportData {
    pub(crate) fn validate_connect(&self, params: &PipeConnectParams) -> Result<()> {
        match (self.srtp_parameters.is_some(), params.srtp_parameters.is_some()) {
            (true, false) => Err(Error::validation("srtpParameters required when SRTP is enabled")),
            (false, true) => Err(Error::validation("srtpParameters given but SRTP is not enabled")),
            _ => Ok(()),
        }
    }

    pub(crate) fn apply_connect_response(&mut self, data: Value) -> Result<()> {
        let response: ConnectResponse = crate::message::decode(data)?;
        if response.tuple.is_some() {
            self.tuple = response.tuple;
        }
        Ok(())
    }
}
