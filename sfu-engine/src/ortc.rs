//! Capability negotiation between routers, producers and consumers
//!
//! All functions here are pure: they never touch a channel and never mutate
//! entity state. Router construction, `Transport::produce`/`consume` and the
//! `Router::can_consume` predicate are built on top of them.

use crate::error::{Error, Result};
use crate::rtp_parameters::{
    CodecParameters, MediaKind, RtcpFeedback, RtcpParameters, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpEncodingParameters, RtpHeaderExtension, RtpParameters, Rtx,
};
use serde::{Deserialize, Serialize};

/// Dynamic payload types handed out to router codecs, in allocation order
fn dynamic_payload_types() -> impl Iterator<Item = u8> {
    (100..=127).chain(96..=99)
}

/// Header extensions every router advertises
fn supported_header_extensions() -> Vec<RtpHeaderExtension> {
    let ext = |kind, uri: &str, preferred_id| RtpHeaderExtension {
        kind: Some(kind),
        uri: uri.to_string(),
        preferred_id,
        preferred_encrypt: false,
    };
    vec![
        ext(MediaKind::Audio, "urn:ietf:params:rtp-hdrext:sdes:mid", 1),
        ext(MediaKind::Video, "urn:ietf:params:rtp-hdrext:sdes:mid", 1),
        ext(MediaKind::Video, "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id", 2),
        ext(MediaKind::Video, "urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id", 3),
        ext(MediaKind::Audio, "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time", 4),
        ext(MediaKind::Video, "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time", 4),
        ext(MediaKind::Video, "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01", 5),
        ext(MediaKind::Audio, "urn:ietf:params:rtp-hdrext:ssrc-audio-level", 10),
        ext(MediaKind::Video, "urn:3gpp:video-orientation", 11),
    ]
}

fn default_rtcp_feedback(kind: MediaKind) -> Vec<RtcpFeedback> {
    match kind {
        MediaKind::Audio => vec![RtcpFeedback::new("transport-cc", "")],
        MediaKind::Video => vec![
            RtcpFeedback::new("nack", ""),
            RtcpFeedback::new("nack", "pli"),
            RtcpFeedback::new("ccm", "fir"),
            RtcpFeedback::new("goog-remb", ""),
            RtcpFeedback::new("transport-cc", ""),
        ],
    }
}

/// Builds the router's receive capabilities from the configured media codecs.
///
/// Payload types are taken from the codec's preference when free, otherwise
/// from the dynamic range. Every video codec gets an RTX companion.
pub fn generate_router_rtp_capabilities(
    media_codecs: &[RtpCodecCapability],
) -> Result<RtpCapabilities> {
    if media_codecs.is_empty() {
        return Err(Error::validation("router needs at least one media codec"));
    }

    let mut taken: Vec<u8> = media_codecs
        .iter()
        .filter_map(|codec| codec.preferred_payload_type)
        .collect();
    let mut next_free = || -> Result<u8> {
        let pt = dynamic_payload_types()
            .find(|pt| !taken.contains(pt))
            .ok_or_else(|| Error::validation("no more dynamic payload types available"))?;
        taken.push(pt);
        Ok(pt)
    };

    let mut codecs = Vec::with_capacity(media_codecs.len() * 2);
    for codec in media_codecs {
        validate_codec_capability(codec)?;

        let payload_type = match codec.preferred_payload_type {
            Some(pt) => pt,
            None => next_free()?,
        };
        let channels = match codec.kind {
            MediaKind::Audio => Some(codec.channels.unwrap_or(1)),
            MediaKind::Video => None,
        };
        let rtcp_feedback = if codec.rtcp_feedback.is_empty() {
            default_rtcp_feedback(codec.kind)
        } else {
            codec.rtcp_feedback.clone()
        };

        codecs.push(RtpCodecCapability {
            kind: codec.kind,
            mime_type: codec.mime_type.clone(),
            preferred_payload_type: Some(payload_type),
            clock_rate: codec.clock_rate,
            channels,
            parameters: codec.parameters.clone(),
            rtcp_feedback,
        });

        if codec.kind == MediaKind::Video {
            let mut parameters = CodecParameters::new();
            parameters.insert("apt".to_string(), payload_type.into());
            codecs.push(RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/rtx".to_string(),
                preferred_payload_type: Some(next_free()?),
                clock_rate: codec.clock_rate,
                channels: None,
                parameters,
                rtcp_feedback: Vec::new(),
            });
        }
    }

    Ok(RtpCapabilities {
        codecs,
        header_extensions: supported_header_extensions(),
    })
}

fn validate_codec_capability(codec: &RtpCodecCapability) -> Result<()> {
    let mime = codec.mime_type.to_ascii_lowercase();
    if !mime.starts_with(codec.kind.mime_prefix()) || mime.len() <= codec.kind.mime_prefix().len() {
        return Err(Error::Validation(format!(
            "invalid mime type {} for {} codec",
            codec.mime_type, codec.kind
        )));
    }
    if codec.is_rtx() {
        return Err(Error::validation("RTX codecs are added automatically"));
    }
    if codec.clock_rate == 0 {
        return Err(Error::Validation(format!(
            "codec {} has no clock rate",
            codec.mime_type
        )));
    }
    Ok(())
}

/// Common view over codec capabilities and codec parameters for matching
trait CodecView {
    fn mime_type(&self) -> &str;
    fn clock_rate(&self) -> u32;
    fn channels(&self) -> Option<u8>;
    fn parameters(&self) -> &CodecParameters;
}

impl CodecView for RtpCodecCapability {
    fn mime_type(&self) -> &str {
        &self.mime_type
    }
    fn clock_rate(&self) -> u32 {
        self.clock_rate
    }
    fn channels(&self) -> Option<u8> {
        self.channels
    }
    fn parameters(&self) -> &CodecParameters {
        &self.parameters
    }
}

impl CodecView for RtpCodecParameters {
    fn mime_type(&self) -> &str {
        &self.mime_type
    }
    fn clock_rate(&self) -> u32 {
        self.clock_rate
    }
    fn channels(&self) -> Option<u8> {
        self.channels
    }
    fn parameters(&self) -> &CodecParameters {
        &self.parameters
    }
}

fn param_string(params: &CodecParameters, key: &str) -> Option<String> {
    params.get(key).map(|value| match value {
        serde_json::Value::String(s) => s.to_ascii_lowercase(),
        other => other.to_string(),
    })
}

fn codecs_match(a: &impl CodecView, b: &impl CodecView, strict: bool) -> bool {
    let mime = a.mime_type().to_ascii_lowercase();
    if mime != b.mime_type().to_ascii_lowercase() || a.clock_rate() != b.clock_rate() {
        return false;
    }
    if mime.starts_with("audio/") && a.channels().unwrap_or(1) != b.channels().unwrap_or(1) {
        return false;
    }

    match mime.as_str() {
        "video/h264" | "video/h264-svc" => {
            let mode = |p: &CodecParameters| param_string(p, "packetization-mode").unwrap_or_else(|| "0".into());
            if mode(a.parameters()) != mode(b.parameters()) {
                return false;
            }
            if strict {
                let a_profile = param_string(a.parameters(), "profile-level-id");
                let b_profile = param_string(b.parameters(), "profile-level-id");
                if let (Some(a_profile), Some(b_profile)) = (a_profile, b_profile) {
                    // profile_idc + profile_iop, the level may differ
                    if a_profile.get(..4) != b_profile.get(..4) {
                        return false;
                    }
                }
            }
        }
        "video/vp9" if strict => {
            let profile = |p: &CodecParameters| param_string(p, "profile-id").unwrap_or_else(|| "0".into());
            if profile(a.parameters()) != profile(b.parameters()) {
                return false;
            }
        }
        _ => {}
    }

    true
}

fn apt_of(params: &CodecParameters) -> Option<u8> {
    params
        .get("apt")
        .and_then(serde_json::Value::as_u64)
        .and_then(|apt| u8::try_from(apt).ok())
}

/// Payload type and SSRC mapping between what a producer sends and what the
/// router uses internally
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpMapping {
    pub codecs: Vec<RtpMappingCodec>,
    pub encodings: Vec<RtpMappingEncoding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpMappingCodec {
    pub payload_type: u8,
    pub mapped_payload_type: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpMappingEncoding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scalability_mode: Option<String>,
    pub mapped_ssrc: u32,
}

fn random_ssrc() -> u32 {
    // Truncation is intended, any 32 random bits will do
    (uuid::Uuid::new_v4().as_u128() & u128::from(u32::MAX)) as u32
}

/// Maps each producer codec onto a router codec. Fails if any media codec or
/// RTX codec of the producer is unsupported by the router.
pub fn get_producer_rtp_parameters_mapping(
    rtp_parameters: &RtpParameters,
    caps: &RtpCapabilities,
) -> Result<RtpMapping> {
    let mut mapping = RtpMapping::default();

    for codec in rtp_parameters.media_codecs() {
        let matched = caps
            .codecs
            .iter()
            .find(|cap| !cap.is_rtx() && codecs_match(codec, *cap, true))
            .ok_or_else(|| {
                Error::Validation(format!("unsupported codec {}", codec.mime_type))
            })?;
        let mapped_payload_type = matched
            .preferred_payload_type
            .ok_or_else(|| Error::validation("router codec without payload type"))?;
        mapping.codecs.push(RtpMappingCodec {
            payload_type: codec.payload_type,
            mapped_payload_type,
        });
    }

    for codec in rtp_parameters.codecs.iter().filter(|codec| codec.is_rtx()) {
        let apt = apt_of(&codec.parameters)
            .ok_or_else(|| Error::validation("RTX codec without apt parameter"))?;
        let media = mapping
            .codecs
            .iter()
            .find(|m| m.payload_type == apt)
            .copied()
            .ok_or_else(|| Error::validation("RTX codec refers to an unknown payload type"))?;
        let rtx = caps
            .codecs
            .iter()
            .find(|cap| cap.is_rtx() && apt_of(&cap.parameters) == Some(media.mapped_payload_type))
            .and_then(|cap| cap.preferred_payload_type)
            .ok_or_else(|| Error::validation("router has no RTX codec for the producer codec"))?;
        mapping.codecs.push(RtpMappingCodec {
            payload_type: codec.payload_type,
            mapped_payload_type: rtx,
        });
    }

    if mapping.codecs.is_empty() {
        return Err(Error::validation("producer has no media codecs"));
    }

    if rtp_parameters.encodings.is_empty() {
        return Err(Error::validation("producer has no encodings"));
    }
    for encoding in &rtp_parameters.encodings {
        if encoding.ssrc.is_none() && encoding.rid.is_none() {
            return Err(Error::validation("encoding needs an ssrc or a rid"));
        }
        mapping.encodings.push(RtpMappingEncoding {
            ssrc: encoding.ssrc,
            rid: encoding.rid.clone(),
            scalability_mode: encoding.scalability_mode.clone(),
            mapped_ssrc: random_ssrc(),
        });
    }

    Ok(mapping)
}

/// RTP parameters a consumer of this producer may receive, expressed in the
/// router's payload types and SSRCs
#[must_use]
pub fn get_consumable_rtp_parameters(
    kind: MediaKind,
    rtp_parameters: &RtpParameters,
    caps: &RtpCapabilities,
    mapping: &RtpMapping,
) -> RtpParameters {
    let mut codecs = Vec::new();

    for codec in rtp_parameters.media_codecs() {
        let Some(mapped) = mapping
            .codecs
            .iter()
            .find(|m| m.payload_type == codec.payload_type)
        else {
            continue;
        };
        let Some(cap) = caps
            .codecs
            .iter()
            .find(|cap| cap.preferred_payload_type == Some(mapped.mapped_payload_type))
        else {
            continue;
        };

        codecs.push(RtpCodecParameters {
            mime_type: cap.mime_type.clone(),
            payload_type: mapped.mapped_payload_type,
            clock_rate: cap.clock_rate,
            channels: cap.channels,
            parameters: codec.parameters.clone(),
            rtcp_feedback: cap.rtcp_feedback.clone(),
        });

        if let Some(rtx) = caps
            .codecs
            .iter()
            .find(|c| c.is_rtx() && apt_of(&c.parameters) == Some(mapped.mapped_payload_type))
        {
            if let Some(payload_type) = rtx.preferred_payload_type {
                codecs.push(RtpCodecParameters {
                    mime_type: rtx.mime_type.clone(),
                    payload_type,
                    clock_rate: rtx.clock_rate,
                    channels: None,
                    parameters: rtx.parameters.clone(),
                    rtcp_feedback: Vec::new(),
                });
            }
        }
    }

    let header_extensions = caps
        .header_extensions
        .iter()
        .filter(|ext| ext.kind.map_or(true, |k| k == kind))
        .map(|ext| crate::rtp_parameters::RtpHeaderExtensionParameters {
            uri: ext.uri.clone(),
            id: ext.preferred_id,
            encrypt: ext.preferred_encrypt,
        })
        .collect();

    let encodings = mapping
        .encodings
        .iter()
        .zip(&rtp_parameters.encodings)
        .map(|(mapped, original)| RtpEncodingParameters {
            ssrc: Some(mapped.mapped_ssrc),
            rid: None,
            codec_payload_type: None,
            rtx: None,
            dtx: original.dtx,
            scalability_mode: mapped.scalability_mode.clone(),
            max_bitrate: original.max_bitrate,
        })
        .collect();

    RtpParameters {
        mid: None,
        codecs,
        header_extensions,
        encodings,
        rtcp: RtcpParameters {
            cname: rtp_parameters.rtcp.cname.clone(),
            reduced_size: true,
        },
    }
}

/// Whether a receiver with `caps` can consume a stream with the given
/// consumable parameters
#[must_use]
pub fn can_consume(consumable: &RtpParameters, caps: &RtpCapabilities) -> bool {
    consumable.media_codecs().any(|codec| {
        caps.codecs
            .iter()
            .any(|cap| !cap.is_rtx() && codecs_match(codec, cap, true))
    })
}

fn temporal_layers(scalability_mode: Option<&str>) -> u32 {
    scalability_mode
        .and_then(|mode| mode.split_once('T'))
        .and_then(|(_, temporal)| temporal.trim_end_matches("_KEY").parse().ok())
        .unwrap_or(1)
}

/// RTP parameters for a new consumer: the consumable codecs the receiver
/// supports, collapsed into a single encoding
pub fn get_consumer_rtp_parameters(
    consumable: &RtpParameters,
    caps: &RtpCapabilities,
) -> Result<RtpParameters> {
    let mut codecs: Vec<RtpCodecParameters> = consumable
        .media_codecs()
        .filter(|codec| {
            caps.codecs
                .iter()
                .any(|cap| !cap.is_rtx() && codecs_match(*codec, cap, true))
        })
        .cloned()
        .collect();

    if codecs.is_empty() {
        return Err(Error::validation("no compatible media codecs"));
    }

    let receiver_has_rtx = caps.codecs.iter().any(RtpCodecCapability::is_rtx);
    if receiver_has_rtx {
        let kept: Vec<u8> = codecs.iter().map(|c| c.payload_type).collect();
        codecs.extend(
            consumable
                .codecs
                .iter()
                .filter(|c| c.is_rtx() && apt_of(&c.parameters).is_some_and(|apt| kept.contains(&apt)))
                .cloned(),
        );
    }

    let header_extensions = consumable
        .header_extensions
        .iter()
        .filter(|ext| {
            caps.header_extensions
                .iter()
                .any(|cap| cap.uri == ext.uri && cap.preferred_id == ext.id)
        })
        .cloned()
        .collect();

    let first = consumable.encodings.first();
    let scalability_mode = if consumable.encodings.len() > 1 {
        let temporal = temporal_layers(first.and_then(|e| e.scalability_mode.as_deref()));
        Some(format!("L{}T{}", consumable.encodings.len(), temporal))
    } else {
        first.and_then(|e| e.scalability_mode.clone())
    };
    let has_rtx = codecs.iter().any(RtpCodecParameters::is_rtx);
    let encoding = RtpEncodingParameters {
        ssrc: Some(random_ssrc()),
        rtx: has_rtx.then(|| Rtx { ssrc: random_ssrc() }),
        scalability_mode,
        max_bitrate: consumable.encodings.iter().filter_map(|e| e.max_bitrate).max(),
        ..RtpEncodingParameters::default()
    };

    Ok(RtpParameters {
        mid: None,
        codecs,
        header_extensions,
        encodings: vec![encoding],
        rtcp: consumable.rtcp.clone(),
    })
}
