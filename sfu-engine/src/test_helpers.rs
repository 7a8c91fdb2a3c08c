//! Test helpers
//!
//! [`FakeWorker`] stands in for a media worker process. It speaks the
//! control and payload channel protocol over in-memory pipes, records every
//! request, answers with plausible bodies and can push notifications or die
//! on demand.

use crate::channel::ControlChannel;
use crate::config::{RouterSettings, WebRtcTransportSettings};
use crate::error::Result;
use crate::message::{NotificationFrame, PayloadNotificationFrame, RequestFrame, ResponseFrame};
use crate::ortc;
use crate::payload_channel::PayloadChannel;
use crate::rtp_parameters::{
    CodecParameters, MediaKind, RtcpParameters, RtpCapabilities, RtpCodecParameters,
    RtpEncodingParameters, RtpParameters,
};
use crate::producer::ProducerOptions;
use crate::router::{Router, RouterOptions};
use crate::transport::webrtc::WebRtcTransportOptions;
use crate::worker::Worker;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Notify};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

/// Pid reported by fake workers
pub const FAKE_WORKER_PID: u32 = 4242;

const PIPE_CAPACITY: usize = 1 << 20;

enum Outgoing {
    Control(Bytes),
    Payload(Bytes, Bytes),
}

#[derive(Default)]
struct Shared {
    requests: Mutex<Vec<RequestFrame>>,
    payloads: Mutex<Vec<(PayloadNotificationFrame, Bytes)>>,
    responses: Mutex<HashMap<String, Value>>,
    rejections: Mutex<HashMap<String, String>>,
    stalled: Mutex<HashSet<String>>,
    changed: Notify,
}

/// Handle to a fake worker started by [`fake_worker`]
pub struct FakeWorker {
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    kill: CancellationToken,
}

/// Start a fake worker and a [`Worker`] connected to it. Needs a runtime.
#[must_use]
pub fn fake_worker() -> (Arc<Worker>, FakeWorker) {
    let (control_ours, control_theirs) = tokio::io::duplex(PIPE_CAPACITY);
    let (payload_ours, payload_theirs) = tokio::io::duplex(PIPE_CAPACITY);

    let (read, write) = tokio::io::split(control_ours);
    let channel = ControlChannel::new(read, write);
    let (read, write) = tokio::io::split(payload_ours);
    let payload = PayloadChannel::new(read, write);
    let worker = Worker::from_channels(FAKE_WORKER_PID, channel, payload);

    let shared = Arc::new(Shared::default());
    let (outgoing, rx) = mpsc::unbounded_channel();
    let kill = CancellationToken::new();
    tokio::spawn(serve(
        control_theirs,
        payload_theirs,
        Arc::clone(&shared),
        rx,
        kill.clone(),
    ));

    (
        worker,
        FakeWorker {
            shared,
            outgoing,
            kill,
        },
    )
}

impl FakeWorker {
    /// Every request received so far, in arrival order
    #[must_use]
    pub fn requests(&self) -> Vec<RequestFrame> {
        self.shared.requests.lock().clone()
    }

    #[must_use]
    pub fn requests_for(&self, method: &str) -> Vec<RequestFrame> {
        self.shared
            .requests
            .lock()
            .iter()
            .filter(|r| r.method == method)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn count(&self, method: &str) -> usize {
        self.shared
            .requests
            .lock()
            .iter()
            .filter(|r| r.method == method)
            .count()
    }

    /// Wait until at least `n` requests of `method` have arrived
    pub async fn wait_for_requests(&self, method: &str, n: usize) -> Vec<RequestFrame> {
        loop {
            let changed = self.shared.changed.notified();
            let found = self.requests_for(method);
            if found.len() >= n {
                return found;
            }
            changed.await;
        }
    }

    /// Wait for the first request of `method`
    pub async fn wait_for_request(&self, method: &str) -> RequestFrame {
        let mut found = self.wait_for_requests(method, 1).await;
        found.swap_remove(0)
    }

    /// Payload notifications received so far
    #[must_use]
    pub fn payloads(&self) -> Vec<(PayloadNotificationFrame, Bytes)> {
        self.shared.payloads.lock().clone()
    }

    pub async fn wait_for_payload(&self, event: &str) -> (PayloadNotificationFrame, Bytes) {
        loop {
            let changed = self.shared.changed.notified();
            let found = self
                .shared
                .payloads
                .lock()
                .iter()
                .find(|(header, _)| header.event == event)
                .cloned();
            if let Some(found) = found {
                return found;
            }
            changed.await;
        }
    }

    /// Answer future `method` requests with `data`
    pub fn respond_with(&self, method: &str, data: Value) {
        self.shared.responses.lock().insert(method.to_string(), data);
    }

    /// Answer future `method` requests with an error
    pub fn reject(&self, method: &str, reason: &str) {
        self.shared
            .rejections
            .lock()
            .insert(method.to_string(), reason.to_string());
    }

    /// Never answer future `method` requests
    pub fn stall(&self, method: &str) {
        self.shared.stalled.lock().insert(method.to_string());
    }

    /// Answer a request that arrived while its method was stalled
    pub fn answer(&self, request: &RequestFrame, data: Value) {
        if let Ok(bytes) = serde_json::to_vec(&ResponseFrame::accepted(request.id, data)) {
            let _ = self.outgoing.send(Outgoing::Control(Bytes::from(bytes)));
        }
    }

    /// Send a control channel notification
    pub fn notify(&self, target_id: &str, event: &str, data: Value) {
        let frame = NotificationFrame {
            target_id: target_id.to_string(),
            event: event.to_string(),
            data,
        };
        if let Ok(bytes) = serde_json::to_vec(&frame) {
            let _ = self.outgoing.send(Outgoing::Control(Bytes::from(bytes)));
        }
    }

    /// Send a payload channel notification followed by its payload
    pub fn send_payload(&self, target_id: &str, event: &str, data: Value, payload: Bytes) {
        let frame = PayloadNotificationFrame {
            event: event.to_string(),
            target_id: Some(target_id.to_string()),
            internal: None,
            data,
        };
        if let Ok(bytes) = serde_json::to_vec(&frame) {
            let _ = self
                .outgoing
                .send(Outgoing::Payload(Bytes::from(bytes), payload));
        }
    }

    /// Simulate process death: both pipes are dropped
    pub fn kill(&self) {
        self.kill.cancel();
    }
}

impl Shared {
    fn respond(&self, request: &RequestFrame) -> Option<ResponseFrame> {
        if self.stalled.lock().contains(&request.method) {
            return None;
        }
        if let Some(reason) = self.rejections.lock().get(&request.method) {
            return Some(ResponseFrame::rejected(request.id, "Error", reason.clone()));
        }
        let data = match self.responses.lock().get(&request.method) {
            Some(data) => data.clone(),
            None => default_response(request),
        };
        Some(ResponseFrame::accepted(request.id, data))
    }
}

async fn serve(
    control: DuplexStream,
    payload: DuplexStream,
    shared: Arc<Shared>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    kill: CancellationToken,
) {
    let (read, write) = tokio::io::split(control);
    let mut control_in = FramedRead::new(read, LengthDelimitedCodec::new());
    let mut control_out = FramedWrite::new(write, LengthDelimitedCodec::new());
    let (read, write) = tokio::io::split(payload);
    let mut payload_in = FramedRead::new(read, LengthDelimitedCodec::new());
    let mut payload_out = FramedWrite::new(write, LengthDelimitedCodec::new());
    let mut header: Option<PayloadNotificationFrame> = None;

    loop {
        tokio::select! {
            () = kill.cancelled() => return,
            frame = control_in.next() => {
                let Some(Ok(bytes)) = frame else { return };
                let Ok(request) = serde_json::from_slice::<RequestFrame>(&bytes) else {
                    continue;
                };
                let response = shared.respond(&request);
                shared.requests.lock().push(request);
                shared.changed.notify_waiters();

                if let Some(response) = response {
                    let Ok(bytes) = serde_json::to_vec(&response) else { continue };
                    if control_out.send(Bytes::from(bytes)).await.is_err() {
                        return;
                    }
                }
            }
            frame = payload_in.next() => {
                let Some(Ok(bytes)) = frame else { return };
                match header.take() {
                    Some(pending) => {
                        shared.payloads.lock().push((pending, bytes.freeze()));
                        shared.changed.notify_waiters();
                    }
                    None => header = serde_json::from_slice(&bytes).ok(),
                }
            }
            Some(message) = outgoing.recv() => {
                let sent = match message {
                    Outgoing::Control(bytes) => control_out.send(bytes).await,
                    Outgoing::Payload(header, body) => {
                        match payload_out.send(header).await {
                            Ok(()) => payload_out.send(body).await,
                            Err(e) => Err(e),
                        }
                    }
                };
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

fn default_response(request: &RequestFrame) -> Value {
    let data = &request.data;
    match request.method.as_str() {
        "router.createWebRtcTransport" => {
            let mut response = json!({
                "iceRole": "controlled",
                "iceParameters": {
                    "usernameFragment": "fakeufrag",
                    "password": "fakepassword",
                    "iceLite": true,
                },
                "iceCandidates": [{
                    "foundation": "udpcandidate",
                    "priority": 1_076_302_079_u32,
                    "ip": "127.0.0.1",
                    "protocol": "udp",
                    "port": 40000,
                    "type": "host",
                }],
                "iceState": "new",
                "dtlsParameters": {
                    "role": "auto",
                    "fingerprints": [{"algorithm": "sha-256", "value": "AA:BB:CC"}],
                },
                "dtlsState": "new",
            });
            add_sctp(&mut response, data);
            response
        }
        "router.createPlainTransport" => {
            let local_ip = data["listenIp"]["ip"].clone();
            let mut response = json!({
                "tuple": {"localIp": local_ip, "localPort": 40100, "protocol": "udp"},
            });
            if data["rtcpMux"] == json!(false) {
                response["rtcpTuple"] =
                    json!({"localIp": local_ip, "localPort": 40101, "protocol": "udp"});
            }
            add_sctp(&mut response, data);
            response
        }
        "router.createPipeTransport" => {
            let mut response = json!({
                "tuple": {"localIp": data["listenIp"]["ip"], "localPort": 40200, "protocol": "udp"},
            });
            add_sctp(&mut response, data);
            response
        }
        "transport.connect" if data.get("dtlsParameters").is_some() => {
            json!({"dtlsLocalRole": "server"})
        }
        "transport.restartIce" => json!({
            "iceParameters": {
                "usernameFragment": "restartedufrag",
                "password": "restartedpassword",
                "iceLite": true,
            },
        }),
        "transport.produce" => {
            let simulcast = data["rtpParameters"]["encodings"]
                .as_array()
                .is_some_and(|encodings| encodings.len() > 1);
            json!({"type": if simulcast { "simulcast" } else { "simple" }})
        }
        "transport.consume" => json!({
            "paused": data["paused"],
            "producerPaused": false,
            "score": {"score": 10, "producerScore": 10},
        }),
        "consumer.setPreferredLayers" | "consumer.setPriority" => data.clone(),
        "dataConsumer.getBufferedAmount" => json!({"bufferedAmount": 0}),
        "worker.getResourceUsage" => json!({"ru_utime": 120, "ru_stime": 30, "ru_maxrss": 20480}),
        _ => Value::Null,
    }
}

fn add_sctp(response: &mut Value, data: &Value) {
    if data["enableSctp"] != json!(true) {
        return;
    }
    response["sctpParameters"] = json!({
        "port": 5000,
        "OS": data["numSctpStreams"]["OS"],
        "MIS": data["numSctpStreams"]["MIS"],
        "maxMessageSize": data["maxSctpMessageSize"],
    });
    response["sctpState"] = json!("new");
}

/// Router with the default codec set
pub async fn create_router(worker: &Arc<Worker>) -> Result<Arc<Router>> {
    worker
        .create_router(RouterOptions::from(&RouterSettings::default()))
        .await
}

/// WebRTC transport options from the default settings
#[must_use]
pub fn webrtc_transport_options() -> WebRtcTransportOptions {
    WebRtcTransportOptions::from_settings(&WebRtcTransportSettings::default())
}

/// Receive capabilities of an endpoint supporting the default router codecs
#[must_use]
pub fn endpoint_rtp_capabilities() -> RtpCapabilities {
    ortc::generate_router_rtp_capabilities(&RouterSettings::default().media_codecs)
        .unwrap_or_default()
}

fn rtp_parameters(codec: RtpCodecParameters, ssrc: u32) -> RtpParameters {
    RtpParameters {
        mid: None,
        codecs: vec![codec],
        header_extensions: Vec::new(),
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(ssrc),
            ..RtpEncodingParameters::default()
        }],
        rtcp: RtcpParameters {
            cname: Some("fake-endpoint".to_string()),
            reduced_size: true,
        },
    }
}

/// Opus producer options
#[must_use]
pub fn audio_producer_options() -> ProducerOptions {
    let codec = RtpCodecParameters {
        mime_type: "audio/opus".to_string(),
        payload_type: 111,
        clock_rate: 48000,
        channels: Some(2),
        parameters: CodecParameters::new(),
        rtcp_feedback: Vec::new(),
    };
    ProducerOptions::new(MediaKind::Audio, rtp_parameters(codec, 11_111_111))
}

/// VP8 producer options
#[must_use]
pub fn video_producer_options() -> ProducerOptions {
    let codec = RtpCodecParameters {
        mime_type: "video/VP8".to_string(),
        payload_type: 96,
        clock_rate: 90000,
        channels: None,
        parameters: CodecParameters::new(),
        rtcp_feedback: Vec::new(),
    };
    ProducerOptions::new(MediaKind::Video, rtp_parameters(codec, 22_222_222))
}
