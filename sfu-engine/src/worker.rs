//! Worker: one media worker process and its two channels
//!
//! The worker is the failure boundary. When the process exits or either
//! channel is severed, the death is reported once, pending requests fail with
//! `WorkerFailure` and every router is closed without further requests.

use crate::bus::EventBus;
use crate::channel::ControlChannel;
use crate::config::{EngineSettings, WorkerLogLevel, WorkerSettings};
use crate::error::{Error, Result};
use crate::lifecycle::ClosedFlag;
use crate::message::{Internal, Method};
use crate::ortc;
use crate::payload_channel::PayloadChannel;
use crate::router::{Router, RouterInit, RouterOptions};
use crate::types::{AppData, RouterId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Environment variable carrying the payload channel socket path
pub const PAYLOAD_SOCKET_ENV: &str = "SFU_WORKER_PAYLOAD_SOCKET";

/// Both channels of one worker, shared by everything it owns
#[derive(Clone)]
pub(crate) struct Channels {
    pub(crate) control: ControlChannel,
    pub(crate) payload: PayloadChannel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Close,
    /// The process exited or a channel broke
    Died(String),
    NewRouter(RouterId),
}

/// Resource usage as reported by the worker (`getrusage` fields)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerResourceUsage {
    pub ru_utime: u64,
    pub ru_stime: u64,
    pub ru_maxrss: u64,
    pub ru_minflt: u64,
    pub ru_majflt: u64,
    pub ru_nvcsw: u64,
    pub ru_nivcsw: u64,
}

pub struct Worker {
    pid: u32,
    channels: Channels,
    routers: Mutex<HashMap<RouterId, Arc<Router>>>,
    closed: ClosedFlag,
    shutdown: CancellationToken,
    app_data: AppData,
    app: EventBus<WorkerEvent>,
    observer: EventBus<WorkerEvent>,
}

impl Worker {
    /// Spawn a worker process and wait until it reports `running`
    #[cfg(unix)]
    pub async fn spawn(settings: &EngineSettings) -> Result<Arc<Self>> {
        use std::process::Stdio;
        use tokio::net::UnixListener;
        use tokio::process::Command;

        let socket_path =
            std::env::temp_dir().join(format!("sfu-worker-{}.sock", nanoid::nanoid!(12)));
        let listener = UnixListener::bind(&socket_path)?;

        let mut command = Command::new(&settings.worker_path);
        command
            .args(worker_args(&settings.worker))
            .env(PAYLOAD_SOCKET_ENV, &socket_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let spawned = async {
            let mut child = command.spawn()?;
            let pid = child
                .id()
                .ok_or_else(|| Error::WorkerFailure("worker exited during spawn".to_string()))?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| Error::WorkerFailure("worker stdin unavailable".to_string()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| Error::WorkerFailure("worker stdout unavailable".to_string()))?;

            let (channel, running) =
                ControlChannel::new_with(stdout, stdin, |channel| wait_for_running(channel, pid));

            let timeout = Duration::from_secs(settings.worker.startup_timeout_secs);
            let (stream, _) = tokio::time::timeout(timeout, async {
                let accepted = listener.accept().await?;
                running
                    .await
                    .map_err(|_| Error::WorkerFailure("worker exited before running".to_string()))?;
                Ok::<_, Error>(accepted)
            })
            .await
            .map_err(|_| Error::Timeout(format!("worker {pid} did not start in {timeout:?}")))??;

            let (read, write) = stream.into_split();
            let payload = PayloadChannel::new(read, write);
            Ok::<_, Error>(Self::start(pid, Some(child), channel, payload))
        }
        .await;

        let _ = std::fs::remove_file(&socket_path);
        let worker = spawned?;
        info!(pid = worker.pid, "worker started");
        Ok(worker)
    }

    /// Build a worker over already connected channels
    #[must_use]
    pub fn from_channels(pid: u32, channel: ControlChannel, payload: PayloadChannel) -> Arc<Self> {
        Self::start(pid, None, channel, payload)
    }

    fn start(
        pid: u32,
        child: Option<tokio::process::Child>,
        control: ControlChannel,
        payload: PayloadChannel,
    ) -> Arc<Self> {
        let worker = Arc::new(Self {
            pid,
            channels: Channels { control, payload },
            routers: Mutex::new(HashMap::new()),
            closed: ClosedFlag::default(),
            shutdown: CancellationToken::new(),
            app_data: AppData::new(),
            app: EventBus::new(),
            observer: EventBus::new(),
        });

        let weak = Arc::downgrade(&worker);
        let severed = worker.channels.control.severed();
        let shutdown = worker.shutdown.clone();
        tokio::spawn(async move {
            let reason = match child {
                Some(mut child) => {
                    tokio::select! {
                        status = child.wait() => match status {
                            Ok(status) => format!("worker process exited ({status})"),
                            Err(e) => format!("failed to wait for worker process: {e}"),
                        },
                        () = severed.cancelled() => {
                            let _ = child.kill().await;
                            "control channel severed".to_string()
                        }
                        () = shutdown.cancelled() => {
                            let _ = child.kill().await;
                            return;
                        }
                    }
                }
                None => {
                    tokio::select! {
                        () = severed.cancelled() => "control channel severed".to_string(),
                        () = shutdown.cancelled() => return,
                    }
                }
            };

            if let Some(worker) = weak.upgrade() {
                worker.died(&reason);
            }
        });

        worker
    }

    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    #[must_use]
    pub fn app_data(&self) -> &AppData {
        &self.app_data
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    #[must_use]
    pub fn router_count(&self) -> usize {
        self.routers.lock().len()
    }

    pub fn on(&self) -> broadcast::Receiver<WorkerEvent> {
        self.app.subscribe()
    }

    pub fn observer(&self) -> broadcast::Receiver<WorkerEvent> {
        self.observer.subscribe()
    }

    /// Close every router, the channels and the process
    pub fn close(&self) {
        if !self.closed.transition() {
            return;
        }
        info!(pid = self.pid, "worker closed");

        self.shutdown.cancel();
        self.teardown();
        self.app.emit(WorkerEvent::Close);
        self.finish();
    }

    fn died(&self, reason: &str) {
        if !self.closed.transition() {
            return;
        }
        error!(pid = self.pid, reason, "worker died");

        self.channels.control.fail(reason);
        self.teardown();
        self.app.emit(WorkerEvent::Died(reason.to_string()));
        self.finish();
    }

    fn teardown(&self) {
        self.channels.control.close();
        self.channels.payload.close();

        let routers = std::mem::take(&mut *self.routers.lock());
        for router in routers.into_values() {
            router.worker_closed();
        }
    }

    fn finish(&self) {
        self.observer.emit(WorkerEvent::Close);
        self.app.close();
        self.observer.close();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::closed(format!("Worker {}", self.pid)));
        }
        Ok(())
    }

    pub async fn create_router(self: &Arc<Self>, options: RouterOptions) -> Result<Arc<Router>> {
        self.ensure_open()?;
        let rtp_capabilities = ortc::generate_router_rtp_capabilities(&options.media_codecs)?;

        let id = RouterId::random();
        self.channels
            .control
            .request(Method::WorkerCreateRouter, Internal::router(&id), Value::Null)
            .await?;

        let router = Router::new(RouterInit {
            id: id.clone(),
            rtp_capabilities,
            app_data: options.app_data,
            worker: Arc::downgrade(self),
            channels: self.channels.clone(),
        });

        self.routers.lock().insert(id.clone(), Arc::clone(&router));
        if self.is_closed() {
            router.worker_closed();
            return Err(Error::closed(format!("Worker {}", self.pid)));
        }

        debug!(pid = self.pid, router_id = %id, "router created");
        self.observer.emit(WorkerEvent::NewRouter(id));
        Ok(router)
    }

    pub async fn dump(&self) -> Result<Value> {
        self.ensure_open()?;
        self.channels
            .control
            .request(Method::WorkerDump, Internal::default(), Value::Null)
            .await
    }

    pub async fn get_resource_usage(&self) -> Result<WorkerResourceUsage> {
        self.ensure_open()?;
        let data = self
            .channels
            .control
            .request(Method::WorkerGetResourceUsage, Internal::default(), Value::Null)
            .await?;
        crate::message::decode(data)
    }

    pub async fn update_settings(&self, log_level: WorkerLogLevel, log_tags: &[String]) -> Result<()> {
        self.ensure_open()?;
        self.channels
            .control
            .request(
                Method::WorkerUpdateSettings,
                Internal::default(),
                json!({ "logLevel": log_level.as_str(), "logTags": log_tags }),
            )
            .await?;
        Ok(())
    }

    pub(crate) fn remove_router(&self, id: &RouterId) {
        self.routers.lock().remove(id);
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("pid", &self.pid)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Command line arguments for the worker executable
fn worker_args(settings: &WorkerSettings) -> Vec<String> {
    let mut args = vec![format!("--logLevel={}", settings.log_level.as_str())];
    args.extend(settings.log_tags.iter().map(|tag| format!("--logTag={tag}")));
    args.push(format!("--rtcMinPort={}", settings.rtc_min_port));
    args.push(format!("--rtcMaxPort={}", settings.rtc_max_port));
    args
}

/// Resolves once the worker sends `running` with its pid as target
fn wait_for_running(channel: &ControlChannel, pid: u32) -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    let target = pid.to_string();
    let unsubscribe = channel.clone();
    let unsubscribe_target = target.clone();

    channel.subscribe(
        target,
        Arc::new(move |event: &str, _data: &Value| {
            if event == "running" {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(());
                }
                unsubscribe.unsubscribe(&unsubscribe_target);
            }
        }),
    );
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RouterEvent;
    use crate::test_helpers::{
        audio_producer_options, create_router, fake_worker, webrtc_transport_options,
    };
    use crate::transport::TransportEvent;

    #[test]
    fn test_worker_args() {
        let settings = WorkerSettings {
            log_tags: vec!["ice".to_string(), "dtls".to_string()],
            ..WorkerSettings::default()
        };
        assert_eq!(
            worker_args(&settings),
            vec![
                "--logLevel=warn",
                "--logTag=ice",
                "--logTag=dtls",
                "--rtcMinPort=40000",
                "--rtcMaxPort=49999",
            ]
        );
    }

    #[tokio::test]
    async fn test_worker_death_fails_pending_requests_and_closes_graph() {
        let (worker, fake) = fake_worker();
        let router = create_router(&worker).await.unwrap();
        let transport = router
            .create_webrtc_transport(webrtc_transport_options())
            .await
            .unwrap();
        let producer = transport.produce(audio_producer_options()).await.unwrap();
        let mut worker_events = worker.on();
        let mut router_events = router.on();
        let mut transport_events = transport.on();

        fake.stall("producer.getStats");
        let mut pending = Vec::new();
        for _ in 0..3 {
            let producer = Arc::clone(&producer);
            pending.push(tokio::spawn(async move { producer.get_stats().await }));
        }
        fake.wait_for_requests("producer.getStats", 3).await;

        fake.kill();

        for handle in pending {
            let err = handle.await.unwrap().unwrap_err();
            assert!(err.is_worker_failure(), "unexpected error {err:?}");
        }
        assert!(matches!(
            worker_events.recv().await.unwrap(),
            WorkerEvent::Died(_)
        ));
        assert_eq!(router_events.recv().await.unwrap(), RouterEvent::WorkerClose);
        assert_eq!(transport_events.recv().await.unwrap(), TransportEvent::RouterClose);
        assert!(producer.is_closed());
        assert!(worker.is_closed());

        assert!(matches!(
            producer.get_stats().await.unwrap_err(),
            Error::Closed(_)
        ));
        assert!(matches!(
            worker.create_router(RouterOptions::default()).await.unwrap_err(),
            Error::Closed(_)
        ));
    }

    #[tokio::test]
    async fn test_close_is_reported_once() {
        let (worker, _fake) = fake_worker();
        let router = create_router(&worker).await.unwrap();
        let mut events = worker.on();

        worker.close();
        worker.close();

        assert_eq!(events.recv().await.unwrap(), WorkerEvent::Close);
        assert!(events.recv().await.is_err());
        assert!(router.is_closed());
        assert_eq!(worker.router_count(), 0);
    }

    #[tokio::test]
    async fn test_resource_usage() {
        let (worker, _fake) = fake_worker();

        let usage = worker.get_resource_usage().await.unwrap();
        assert_eq!(usage.ru_utime, 120);
        assert_eq!(usage.ru_maxrss, 20480);
    }

    #[tokio::test]
    async fn test_update_settings_request() {
        let (worker, fake) = fake_worker();

        worker
            .update_settings(WorkerLogLevel::Debug, &["ice".to_string()])
            .await
            .unwrap();

        let request = fake.wait_for_request("worker.updateSettings").await;
        assert_eq!(request.data, json!({"logLevel": "debug", "logTags": ["ice"]}));
    }
}
