//! Peer: one participant and everything it owns on the router
//!
//! All state sits behind one async mutex. Every operation fast-checks the
//! closed flag, takes the lock and checks again, so operations on one peer
//! never interleave while different peers proceed independently.
//!
//! Producers, consumers and transports can also close on their own (producer
//! gone, orphan expiry, router closed). A watcher task per entity takes the
//! same lock and drops such entries from the indexes.

use crate::error::{Error, Result};
use crate::request::{
    ConnectWebRtcTransportRequest, CreateWebRtcTransportRequest, ProduceDataRequest,
    ProduceRequest, SetConsumerPreferredLayersRequest, SetConsumerPriorityRequest,
};
use crate::room::Room;
use crate::types::{PeerId, RoomId};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sfu_engine::config::WebRtcTransportSettings;
use sfu_engine::transport::sctp::SctpCapabilities;
use sfu_engine::transport::webrtc::{IceParameters, WebRtcTransportOptions};
use sfu_engine::{
    AppData, ConnectParams, Consumer, ConsumerId, ConsumerLayers, ConsumerOptions, DataConsumer,
    DataConsumerId, DataConsumerOptions, DataProducer, DataProducerId, DataProducerOptions,
    MediaKind, Producer, ProducerId, ProducerOptions, Router, RtpCapabilities, Transport,
    TransportId,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Transport app data flags marking its direction
const PRODUCING: &str = "producing";
const CONSUMING: &str = "consuming";

#[derive(Default)]
struct PeerState {
    rtp_capabilities: Option<RtpCapabilities>,
    sctp_capabilities: Option<SctpCapabilities>,
    rooms: HashMap<RoomId, Weak<Room>>,
    transports: HashMap<TransportId, Arc<Transport>>,
    producers: HashMap<ProducerId, Arc<Producer>>,
    consumers: HashMap<ConsumerId, Arc<Consumer>>,
    data_producers: HashMap<DataProducerId, Arc<DataProducer>>,
    data_consumers: HashMap<DataConsumerId, Arc<DataConsumer>>,
}

impl PeerState {
    fn flagged_transport(&self, flag: &str) -> Option<Arc<Transport>> {
        self.transports
            .values()
            .find(|t| t.app_data().get(flag).and_then(Value::as_bool).unwrap_or(false))
            .cloned()
    }

    fn transport(&self, id: &TransportId) -> Result<Arc<Transport>> {
        self.transports
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Validation(format!("no transport {id}")))
    }

    fn producer(&self, id: &ProducerId) -> Result<Arc<Producer>> {
        self.producers
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Validation(format!("no producer {id}")))
    }

    fn consumer(&self, id: &ConsumerId) -> Result<Arc<Consumer>> {
        self.consumers
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Validation(format!("no consumer {id}")))
    }
}

pub struct Peer {
    id: PeerId,
    display_name: String,
    joined_at: DateTime<Utc>,
    /// Sources this peer may produce
    sources: Vec<String>,
    app_data: AppData,
    router: Arc<Router>,
    transport_settings: WebRtcTransportSettings,
    closed: AtomicBool,
    state: Mutex<PeerState>,
}

impl Peer {
    #[must_use]
    pub fn new(
        id: PeerId,
        display_name: &str,
        sources: Vec<String>,
        app_data: AppData,
        router: Arc<Router>,
        transport_settings: WebRtcTransportSettings,
    ) -> Arc<Self> {
        let display_name = if display_name.trim().is_empty() {
            "Guest".to_string()
        } else {
            display_name.to_string()
        };
        Arc::new(Self {
            id,
            display_name,
            joined_at: Utc::now(),
            sources,
            app_data,
            router,
            transport_settings,
            closed: AtomicBool::new(false),
            state: Mutex::new(PeerState::default()),
        })
    }

    #[must_use]
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    #[must_use]
    pub const fn joined_at(&self) -> DateTime<Utc> {
        self.joined_at
    }

    #[must_use]
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    #[must_use]
    pub fn app_data(&self) -> &AppData {
        &self.app_data
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed(format!("Peer {}", self.id)));
        }
        Ok(())
    }

    /// Fast check, lock, re-check
    async fn lock(&self) -> Result<MutexGuard<'_, PeerState>> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        self.ensure_open()?;
        Ok(state)
    }

    /// Drop an index entry once the entity's observer stream ends
    fn watch<E>(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<E>,
        remove: impl FnOnce(&mut PeerState) + Send + 'static,
    ) where
        E: Clone + Send + 'static,
    {
        let peer = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
            if let Some(peer) = peer.upgrade() {
                remove(&mut *peer.state.lock().await);
            }
        });
    }

    /// Close every transport, and with them everything this peer produced
    /// or consumed
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        let mut state = self.state.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let state = std::mem::take(&mut *state);
        for transport in state.transports.values() {
            transport.close();
        }
        info!(peer_id = %self.id, transports = state.transports.len(), "peer closed");
    }

    pub async fn set_rtp_capabilities(&self, rtp_capabilities: RtpCapabilities) -> Result<()> {
        self.lock().await?.rtp_capabilities = Some(rtp_capabilities);
        Ok(())
    }

    pub async fn set_sctp_capabilities(&self, sctp_capabilities: SctpCapabilities) -> Result<()> {
        self.lock().await?.sctp_capabilities = Some(sctp_capabilities);
        Ok(())
    }

    pub async fn join_room(&self, room: &Arc<Room>) -> Result<()> {
        self.lock()
            .await?
            .rooms
            .insert(room.id().clone(), Arc::downgrade(room));
        Ok(())
    }

    /// Returns false when the peer was not in the room
    pub async fn leave_room(&self, room_id: &RoomId) -> Result<bool> {
        Ok(self.lock().await?.rooms.remove(room_id).is_some())
    }

    /// Rooms this peer is in. Empty once closed.
    pub async fn room_ids(&self) -> Vec<RoomId> {
        match self.lock().await {
            Ok(state) => state.rooms.keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Snapshot of the live producers. Empty once closed.
    pub async fn producers(&self) -> Vec<Arc<Producer>> {
        match self.lock().await {
            Ok(state) => state.producers.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Snapshot of the live consumers. Empty once closed.
    pub async fn consumers(&self) -> Vec<Arc<Consumer>> {
        match self.lock().await {
            Ok(state) => state.consumers.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub async fn producer(&self, producer_id: &ProducerId) -> Option<Arc<Producer>> {
        self.lock().await.ok()?.producers.get(producer_id).cloned()
    }

    pub async fn consumer(&self, consumer_id: &ConsumerId) -> Option<Arc<Consumer>> {
        self.lock().await.ok()?.consumers.get(consumer_id).cloned()
    }

    pub async fn data_producers(&self) -> Vec<Arc<DataProducer>> {
        match self.lock().await {
            Ok(state) => state.data_producers.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Create the sending or the receiving transport. A peer has at most one
    /// of each.
    pub async fn create_webrtc_transport(
        self: &Arc<Self>,
        request: CreateWebRtcTransportRequest,
    ) -> Result<Arc<Transport>> {
        let mut state = self.lock().await?;

        if request.producing == request.consuming {
            return Err(Error::validation(
                "exactly one of producing and consuming must be set",
            ));
        }
        if request.consuming && state.flagged_transport(CONSUMING).is_some() {
            return Err(Error::validation("consuming transport already exists"));
        }
        if request.producing && state.flagged_transport(PRODUCING).is_some() {
            return Err(Error::validation("producing transport already exists"));
        }

        let mut options = WebRtcTransportOptions::from_settings(&self.transport_settings);
        if let Some(sctp) = request.sctp_capabilities.or(state.sctp_capabilities) {
            options.enable_sctp = true;
            options.num_sctp_streams = sctp.num_streams;
        }
        if request.force_tcp {
            options.force_tcp();
        }
        options.app_data.insert(PRODUCING.to_string(), json!(request.producing));
        options.app_data.insert(CONSUMING.to_string(), json!(request.consuming));

        let transport = self.router.create_webrtc_transport(options).await?;
        let id = transport.id().clone();
        state.transports.insert(id.clone(), Arc::clone(&transport));
        self.watch(transport.observer(), {
            let id = id.clone();
            move |state| {
                state.transports.remove(&id);
            }
        });

        if self.transport_settings.maximum_incoming_bitrate > 0 {
            transport.set_max_incoming_bitrate_detached(self.transport_settings.maximum_incoming_bitrate);
        }

        debug!(
            peer_id = %self.id,
            transport_id = %id,
            producing = request.producing,
            "transport created"
        );
        Ok(transport)
    }

    pub async fn connect_webrtc_transport(&self, request: ConnectWebRtcTransportRequest) -> Result<()> {
        let state = self.lock().await?;
        let transport = state.transport(&request.transport_id)?;
        transport
            .connect(ConnectParams::WebRtc {
                dtls_parameters: request.dtls_parameters,
            })
            .await?;
        Ok(())
    }

    /// Produce media for a source. `app_data` needs `source` and `roomId`;
    /// a source can be produced only once.
    pub async fn produce(self: &Arc<Self>, request: ProduceRequest) -> Result<Arc<Producer>> {
        let mut state = self.lock().await?;

        let source = app_data_str(&request.app_data, "source")?;
        let room_id = RoomId::new(app_data_str(&request.app_data, "roomId")?);
        if !state.rooms.contains_key(&room_id) {
            return Err(Error::Validation(format!(
                "peer {} is not in room {room_id}",
                self.id
            )));
        }
        let transport = state
            .flagged_transport(PRODUCING)
            .ok_or_else(|| Error::validation("no producing transport"))?;
        if !self.sources.iter().any(|s| *s == source) {
            return Err(Error::Validation(format!("source {source} is not permitted")));
        }
        if state
            .producers
            .values()
            .any(|p| p.source().as_deref() == Some(source.as_str()))
        {
            return Err(Error::Validation(format!("source {source} is already produced")));
        }

        let mut app_data = request.app_data;
        app_data.insert("peerId".to_string(), json!(self.id.as_str()));
        let mut options = ProducerOptions::new(request.kind, request.rtp_parameters);
        options.app_data = app_data;

        let producer = transport.produce(options).await?;
        let id = producer.id().clone();
        state.producers.insert(id.clone(), Arc::clone(&producer));
        self.watch(producer.observer(), {
            let id = id.clone();
            move |state| {
                state.producers.remove(&id);
            }
        });

        debug!(peer_id = %self.id, producer_id = %id, source = %source, room_id = %room_id, "producer created");
        Ok(producer)
    }

    /// Consume another peer's producer on behalf of `room_id`.
    ///
    /// The consumer starts paused. Video also starts paused on the producer
    /// side until the application resumes it.
    pub async fn consume(
        self: &Arc<Self>,
        producer: &Arc<Producer>,
        room_id: &RoomId,
    ) -> Result<Arc<Consumer>> {
        let mut state = self.lock().await?;

        let rtp_capabilities = state
            .rtp_capabilities
            .clone()
            .ok_or_else(|| Error::validation("rtp capabilities not set"))?;
        if !self.router.can_consume(producer.id(), &rtp_capabilities) {
            warn!(peer_id = %self.id, producer_id = %producer.id(), "cannot consume");
            return Err(Error::Validation(format!(
                "peer {} cannot consume producer {}",
                self.id,
                producer.id()
            )));
        }
        let transport = state
            .flagged_transport(CONSUMING)
            .ok_or_else(|| Error::validation("no consuming transport"))?;

        let mut options = ConsumerOptions::new(producer.id().clone(), rtp_capabilities);
        options.paused = true;
        options.producer_paused = producer.kind() == MediaKind::Video;
        options
            .app_data
            .insert("roomId".to_string(), json!(room_id.as_str()));
        options
            .app_data
            .insert("peerId".to_string(), json!(self.id.as_str()));
        if let Some(source) = producer.source() {
            options.app_data.insert("source".to_string(), json!(source));
        }

        let consumer = transport.consume(options).await?;
        let id = consumer.id().clone();
        state.consumers.insert(id.clone(), Arc::clone(&consumer));
        self.watch(consumer.observer(), {
            let id = id.clone();
            move |state| {
                state.consumers.remove(&id);
            }
        });

        debug!(
            peer_id = %self.id,
            consumer_id = %id,
            producer_id = %producer.id(),
            room_id = %room_id,
            "consumer created"
        );
        Ok(consumer)
    }

    pub async fn produce_data(self: &Arc<Self>, request: ProduceDataRequest) -> Result<Arc<DataProducer>> {
        let mut state = self.lock().await?;
        let transport = state
            .flagged_transport(PRODUCING)
            .ok_or_else(|| Error::validation("no producing transport"))?;

        let mut app_data = request.app_data;
        app_data.insert("peerId".to_string(), json!(self.id.as_str()));
        let data_producer = transport
            .produce_data(DataProducerOptions {
                id: None,
                sctp_stream_parameters: request.sctp_stream_parameters,
                label: request.label,
                protocol: request.protocol,
                app_data,
            })
            .await?;

        let id = data_producer.id().clone();
        state.data_producers.insert(id.clone(), Arc::clone(&data_producer));
        self.watch(data_producer.observer(), {
            let id = id.clone();
            move |state| {
                state.data_producers.remove(&id);
            }
        });

        debug!(peer_id = %self.id, data_producer_id = %id, "data producer created");
        Ok(data_producer)
    }

    pub async fn consume_data(
        self: &Arc<Self>,
        data_producer: &Arc<DataProducer>,
    ) -> Result<Arc<DataConsumer>> {
        let mut state = self.lock().await?;
        let transport = state
            .flagged_transport(CONSUMING)
            .ok_or_else(|| Error::validation("no consuming transport"))?;

        let mut options = DataConsumerOptions::new(data_producer.id().clone());
        options
            .app_data
            .insert("peerId".to_string(), json!(self.id.as_str()));
        let data_consumer = transport.consume_data(options).await?;

        let id = data_consumer.id().clone();
        state.data_consumers.insert(id.clone(), Arc::clone(&data_consumer));
        self.watch(data_consumer.observer(), {
            let id = id.clone();
            move |state| {
                state.data_consumers.remove(&id);
            }
        });

        debug!(peer_id = %self.id, data_consumer_id = %id, "data consumer created");
        Ok(data_consumer)
    }

    pub async fn close_producer(&self, producer_id: &ProducerId) -> Result<()> {
        let mut state = self.lock().await?;
        let producer = state
            .producers
            .remove(producer_id)
            .ok_or_else(|| Error::Validation(format!("no producer {producer_id}")))?;
        producer.close();
        Ok(())
    }

    pub async fn pause_producer(&self, producer_id: &ProducerId) -> Result<()> {
        let state = self.lock().await?;
        state.producer(producer_id)?.pause().await?;
        Ok(())
    }

    pub async fn resume_producer(&self, producer_id: &ProducerId) -> Result<()> {
        let state = self.lock().await?;
        state.producer(producer_id)?.resume().await?;
        Ok(())
    }

    pub async fn close_consumer(&self, consumer_id: &ConsumerId) -> Result<()> {
        let mut state = self.lock().await?;
        let consumer = state
            .consumers
            .remove(consumer_id)
            .ok_or_else(|| Error::Validation(format!("no consumer {consumer_id}")))?;
        consumer.close();
        Ok(())
    }

    pub async fn pause_consumer(&self, consumer_id: &ConsumerId) -> Result<()> {
        let state = self.lock().await?;
        state.consumer(consumer_id)?.pause().await?;
        Ok(())
    }

    pub async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<Arc<Consumer>> {
        let state = self.lock().await?;
        let consumer = state.consumer(consumer_id)?;
        consumer.resume().await?;
        Ok(consumer)
    }

    pub async fn set_consumer_preferred_layers(
        &self,
        request: SetConsumerPreferredLayersRequest,
    ) -> Result<()> {
        let state = self.lock().await?;
        state
            .consumer(&request.consumer_id)?
            .set_preferred_layers(ConsumerLayers {
                spatial_layer: request.spatial_layer,
                temporal_layer: request.temporal_layer,
            })
            .await?;
        Ok(())
    }

    pub async fn set_consumer_priority(&self, request: SetConsumerPriorityRequest) -> Result<()> {
        let state = self.lock().await?;
        state
            .consumer(&request.consumer_id)?
            .set_priority(request.priority)
            .await?;
        Ok(())
    }

    pub async fn request_consumer_key_frame(&self, consumer_id: &ConsumerId) -> Result<()> {
        let state = self.lock().await?;
        state.consumer(consumer_id)?.request_key_frame().await?;
        Ok(())
    }

    pub async fn get_transport_stats(&self, transport_id: &TransportId) -> Result<Value> {
        let state = self.lock().await?;
        Ok(state.transport(transport_id)?.get_stats().await?)
    }

    pub async fn get_producer_stats(&self, producer_id: &ProducerId) -> Result<Value> {
        let state = self.lock().await?;
        Ok(state.producer(producer_id)?.get_stats().await?)
    }

    pub async fn get_consumer_stats(&self, consumer_id: &ConsumerId) -> Result<Value> {
        let state = self.lock().await?;
        Ok(state.consumer(consumer_id)?.get_stats().await?)
    }

    pub async fn restart_ice(&self, transport_id: &TransportId) -> Result<IceParameters> {
        let state = self.lock().await?;
        Ok(state.transport(transport_id)?.restart_ice().await?)
    }

    /// Forget a consumer without closing it
    pub async fn remove_consumer(&self, consumer_id: &ConsumerId) -> Result<()> {
        self.lock()
            .await?
            .consumers
            .remove(consumer_id)
            .map(|_| ())
            .ok_or_else(|| Error::Validation(format!("no consumer {consumer_id}")))
    }

    /// Close the consumers created on behalf of `room_id`
    pub async fn close_consumers_in_room(&self, room_id: &RoomId) -> Result<Vec<ConsumerId>> {
        let mut state = self.lock().await?;
        let ids: Vec<ConsumerId> = state
            .consumers
            .values()
            .filter(|c| c.room_id().as_deref() == Some(room_id.as_str()))
            .map(|c| c.id().clone())
            .collect();
        for id in &ids {
            if let Some(consumer) = state.consumers.remove(id) {
                consumer.close();
            }
        }
        Ok(ids)
    }

    /// Close this peer's producers that nobody consumes once this peer's
    /// own consumers in `exclude_room_id` are discounted.
    ///
    /// Consumers of other peers sharing a room with this peer always count,
    /// whatever room they were created for, so a producer such a peer still
    /// consumes is never closed here.
    pub async fn close_producers_no_consumers(&self, exclude_room_id: &RoomId) -> Result<Vec<ProducerId>> {
        let own_id = self.id.clone();
        self.close_producers_no_consumers_except(exclude_room_id, &own_id)
            .await
    }

    /// Close this peer's producers with no remaining consumer.
    ///
    /// Consumers are gathered from every peer of every room this peer is in.
    /// Those owned by `exclude_peer_id` and created for `exclude_room_id` do
    /// not count. Closing a producer closes its remaining consumers.
    ///
    /// A producer that gains a consumer while the peers are being scanned is
    /// kept.
    pub async fn close_producers_no_consumers_except(
        &self,
        exclude_room_id: &RoomId,
        exclude_peer_id: &PeerId,
    ) -> Result<Vec<ProducerId>> {
        let (candidates, rooms, own_consumers) = {
            let state = self.lock().await?;
            let candidates: HashSet<ProducerId> = state.producers.keys().cloned().collect();
            let rooms: Vec<Arc<Room>> = state.rooms.values().filter_map(Weak::upgrade).collect();
            let own: Vec<Arc<Consumer>> = state.consumers.values().cloned().collect();
            (candidates, rooms, own)
        };
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        // Other peers are locked one at a time with this peer unlocked, so
        // two peers running this concurrently cannot deadlock.
        let mut referenced = HashSet::new();
        let mut seen = HashSet::new();
        let mut visited = HashSet::new();
        for room in &rooms {
            for peer in room.peers() {
                if !visited.insert(peer.id().clone()) {
                    continue;
                }
                let consumers = if peer.id() == &self.id {
                    own_consumers.clone()
                } else {
                    peer.consumers().await
                };
                for consumer in consumers {
                    if !candidates.contains(consumer.producer_id()) {
                        continue;
                    }
                    seen.insert(consumer.id().clone());
                    if consumer.is_closed() {
                        continue;
                    }
                    let excluded = peer.id() == exclude_peer_id
                        && consumer.room_id().as_deref() == Some(exclude_room_id.as_str());
                    if !excluded {
                        referenced.insert(consumer.producer_id().clone());
                    }
                }
            }
        }

        let mut state = self.lock().await?;
        let mut closed = Vec::new();
        for id in candidates.difference(&referenced) {
            let Some(producer) = state.producers.get(id) else {
                continue;
            };
            let consumed_meanwhile = producer.consumers().iter().any(|c| {
                !seen.contains(c.id())
                    && !c.is_closed()
                    && counts_for(c, &rooms, exclude_room_id, exclude_peer_id)
            });
            if consumed_meanwhile {
                debug!(peer_id = %self.id, producer_id = %id, "producer consumed during reclaim, keeping it");
                continue;
            }
            if let Some(producer) = state.producers.remove(id) {
                debug!(peer_id = %self.id, producer_id = %id, "closing producer without consumers");
                producer.close();
                closed.push(id.clone());
            }
        }
        Ok(closed)
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Whether a consumer found after the scan references its producer: its
/// owner is in one of `rooms` and it is not the excluded one
fn counts_for(
    consumer: &Consumer,
    rooms: &[Arc<Room>],
    exclude_room_id: &RoomId,
    exclude_peer_id: &PeerId,
) -> bool {
    let Some(owner) = consumer
        .app_data()
        .get("peerId")
        .and_then(Value::as_str)
        .map(PeerId::from)
    else {
        return false;
    };
    if &owner == exclude_peer_id && consumer.room_id().as_deref() == Some(exclude_room_id.as_str()) {
        return false;
    }
    rooms.iter().any(|room| room.peer(&owner).is_some())
}

fn app_data_str(app_data: &AppData, key: &str) -> Result<String> {
    app_data
        .get(key)
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| Error::Validation(format!("appData.{key} is required")))
}
