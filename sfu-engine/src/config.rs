//! Engine settings
//!
//! Supplied once as an immutable value when workers, routers and transports
//! are created. Loading from files or the environment happens in the
//! application layer.

use crate::rtp_parameters::{CodecParameters, MediaKind, RtpCodecCapability};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Path of the media worker executable
    pub worker_path: PathBuf,
    /// Number of worker processes to spawn (0 = one per CPU)
    pub num_workers: usize,
    pub worker: WorkerSettings,
    pub router: RouterSettings,
    pub webrtc_transport: WebRtcTransportSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            worker_path: PathBuf::from("mediasoup-worker"),
            num_workers: 0,
            worker: WorkerSettings::default(),
            router: RouterSettings::default(),
            webrtc_transport: WebRtcTransportSettings::default(),
        }
    }
}

impl EngineSettings {
    /// Worker count with the "one per CPU" default resolved
    #[must_use]
    pub fn effective_num_workers(&self) -> usize {
        if self.num_workers > 0 {
            return self.num_workers;
        }
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerLogLevel {
    Debug,
    Warn,
    Error,
    None,
}

impl WorkerLogLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::None => "none",
        }
    }
}

/// Per-process worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub log_level: WorkerLogLevel,
    pub log_tags: Vec<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    /// How long to wait for the worker's `running` notification
    pub startup_timeout_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            log_level: WorkerLogLevel::Warn,
            log_tags: ["info", "ice", "dtls", "rtp", "srtp", "rtcp"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            startup_timeout_secs: 10,
        }
    }
}

/// Router settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    pub media_codecs: Vec<RtpCodecCapability>,
}

fn codec(
    kind: MediaKind,
    mime_type: &str,
    clock_rate: u32,
    channels: Option<u8>,
    parameters: &[(&str, serde_json::Value)],
) -> RtpCodecCapability {
    RtpCodecCapability {
        kind,
        mime_type: mime_type.to_string(),
        preferred_payload_type: None,
        clock_rate,
        channels,
        parameters: parameters
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect::<CodecParameters>(),
        rtcp_feedback: Vec::new(),
    }
}

impl Default for RouterSettings {
    fn default() -> Self {
        use serde_json::json;

        Self {
            media_codecs: vec![
                codec(MediaKind::Audio, "audio/opus", 48000, Some(2), &[]),
                codec(
                    MediaKind::Video,
                    "video/VP8",
                    90000,
                    None,
                    &[("x-google-start-bitrate", json!(1000))],
                ),
                codec(
                    MediaKind::Video,
                    "video/VP9",
                    90000,
                    None,
                    &[("profile-id", json!(2)), ("x-google-start-bitrate", json!(1000))],
                ),
                codec(
                    MediaKind::Video,
                    "video/h264",
                    90000,
                    None,
                    &[
                        ("packetization-mode", json!(1)),
                        ("profile-level-id", json!("4d0032")),
                        ("level-asymmetry-allowed", json!(1)),
                        ("x-google-start-bitrate", json!(1000)),
                    ],
                ),
                codec(
                    MediaKind::Video,
                    "video/h264",
                    90000,
                    None,
                    &[
                        ("packetization-mode", json!(1)),
                        ("profile-level-id", json!("42e01f")),
                        ("level-asymmetry-allowed", json!(1)),
                        ("x-google-start-bitrate", json!(1000)),
                    ],
                ),
            ],
        }
    }
}

/// Address a transport listens on, optionally announced under another address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenIp {
    pub ip: IpAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announced_ip: Option<IpAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcTransportSettings {
    pub listen_ips: Vec<ListenIp>,
    /// Initial outgoing bitrate estimation (bps)
    pub initial_available_outgoing_bitrate: u32,
    pub minimum_available_outgoing_bitrate: u32,
    /// Incoming bitrate ceiling applied after creation (bps, 0 = unlimited)
    pub maximum_incoming_bitrate: u32,
    pub max_sctp_message_size: u32,
}

impl Default for WebRtcTransportSettings {
    fn default() -> Self {
        Self {
            listen_ips: vec![ListenIp {
                ip: IpAddr::from([0, 0, 0, 0]),
                announced_ip: Some(IpAddr::from([127, 0, 0, 1])),
            }],
            initial_available_outgoing_bitrate: 1_000_000,
            minimum_available_outgoing_bitrate: 600_000,
            maximum_incoming_bitrate: 1_500_000,
            max_sctp_message_size: 262_144,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = EngineSettings::default();
        assert!(settings.effective_num_workers() >= 1);
        assert_eq!(settings.router.media_codecs.len(), 5);
        assert!(settings.worker.rtc_min_port < settings.worker.rtc_max_port);
    }

    #[test]
    fn test_settings_deserialize_with_defaults() {
        let settings: EngineSettings =
            serde_json::from_str(r#"{"num_workers": 2, "worker": {"log_level": "debug"}}"#).unwrap();
        assert_eq!(settings.effective_num_workers(), 2);
        assert_eq!(settings.worker.log_level, WorkerLogLevel::Debug);
        assert_eq!(settings.worker.rtc_max_port, 49999);
    }
}
