//! Meeting manager - top-level orchestration of rooms and peers
//!
//! This module provides:
//! - Peer registry keyed by peer id
//! - Room creation with resource limits
//! - Join and leave flows that reclaim unconsumed producers
//! - Periodic cleanup of empty rooms

use crate::config::MeetingConfig;
use crate::error::{Error, Result};
use crate::peer::Peer;
use crate::room::Room;
use crate::types::{PeerId, RoomId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sfu_engine::{AppData, Router, WebRtcTransportSettings};
use std::sync::{Arc, Weak};
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

/// Meeting manager - owns every peer and room served by one router
pub struct MeetingManager {
    router: Arc<Router>,
    transport_settings: WebRtcTransportSettings,
    config: MeetingConfig,

    /// Active rooms
    rooms: DashMap<RoomId, Arc<Room>>,

    /// Connected peers
    peers: DashMap<PeerId, Arc<Peer>>,
}

impl MeetingManager {
    /// Create a manager. The cleanup task stops once the manager is dropped.
    pub fn new(
        router: Arc<Router>,
        transport_settings: WebRtcTransportSettings,
        config: MeetingConfig,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            router,
            transport_settings,
            config,
            rooms: DashMap::new(),
            peers: DashMap::new(),
        });

        info!(
            router_id = %manager.router.id(),
            max_rooms = manager.config.max_rooms,
            max_peers_per_room = manager.config.max_peers_per_room,
            "Meeting manager initialized"
        );

        if manager.config.cleanup_interval_secs > 0 {
            tokio::spawn(cleanup_task(
                Arc::downgrade(&manager),
                Duration::from_secs(manager.config.cleanup_interval_secs),
            ));
        }

        manager
    }

    #[must_use]
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    #[must_use]
    pub fn config(&self) -> &MeetingConfig {
        &self.config
    }

    /// Register a peer. `sources` falls back to the configured defaults.
    pub fn create_peer(
        &self,
        peer_id: PeerId,
        display_name: &str,
        sources: Option<Vec<String>>,
        app_data: AppData,
    ) -> Result<Arc<Peer>> {
        match self.peers.entry(peer_id.clone()) {
            Entry::Occupied(_) => Err(Error::Validation(format!("peer {peer_id} already exists"))),
            Entry::Vacant(entry) => {
                let peer = Peer::new(
                    peer_id.clone(),
                    display_name,
                    sources.unwrap_or_else(|| self.config.default_sources.clone()),
                    app_data,
                    Arc::clone(&self.router),
                    self.transport_settings.clone(),
                );
                entry.insert(Arc::clone(&peer));
                info!(peer_id = %peer_id, display_name = peer.display_name(), "Created peer");
                Ok(peer)
            }
        }
    }

    #[must_use]
    pub fn peer(&self, peer_id: &PeerId) -> Option<Arc<Peer>> {
        self.peers.get(peer_id).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn room(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Get or create a room
    pub fn get_or_create_room(&self, room_id: RoomId) -> Result<Arc<Room>> {
        if let Some(room) = self.rooms.get(&room_id) {
            debug!(room_id = %room_id, "Room already exists");
            return Ok(Arc::clone(room.value()));
        }

        // 0 = unlimited
        if self.config.max_rooms > 0 && self.rooms.len() >= self.config.max_rooms {
            warn!(
                current_rooms = self.rooms.len(),
                max_rooms = self.config.max_rooms,
                "Room limit reached"
            );
            return Err(Error::LimitReached("maximum number of rooms reached".to_string()));
        }

        let room = Arc::clone(
            self.rooms
                .entry(room_id.clone())
                .or_insert_with(|| Arc::new(Room::new(room_id.clone())))
                .value(),
        );

        info!(room_id = %room_id, total_rooms = self.rooms.len(), "Created new room");
        Ok(room)
    }

    /// Add a peer to a room, creating the room on first join
    pub async fn join_room(&self, peer_id: &PeerId, room_id: RoomId) -> Result<Arc<Room>> {
        let peer = self
            .peer(peer_id)
            .ok_or_else(|| Error::Validation(format!("no peer {peer_id}")))?;

        // Membership is in place before any await, so a cleanup pass never
        // sees this room empty while the join is in flight.
        let room = loop {
            let room = self.get_or_create_room(room_id.clone())?;

            if room.peer(peer_id).is_some() {
                debug!(room_id = %room_id, peer_id = %peer_id, "Peer already in room");
                return Ok(room);
            }

            let peer_count = room.len();
            if self.config.max_peers_per_room > 0 && peer_count >= self.config.max_peers_per_room {
                warn!(
                    room_id = %room_id,
                    current_peers = peer_count,
                    max_peers = self.config.max_peers_per_room,
                    "Peer limit reached for room"
                );
                return Err(Error::LimitReached(format!(
                    "maximum number of peers reached for room {room_id}"
                )));
            }

            room.join(Arc::clone(&peer));

            // A cleanup pass may have dropped the room while it was still empty
            match self.rooms.entry(room_id.clone()) {
                Entry::Occupied(entry) if Arc::ptr_eq(entry.get(), &room) => break room,
                Entry::Occupied(_) => {
                    room.leave(peer_id);
                }
                Entry::Vacant(entry) => {
                    entry.insert(Arc::clone(&room));
                    break room;
                }
            }
        };

        if let Err(e) = peer.join_room(&room).await {
            room.leave(peer_id);
            return Err(e);
        }

        info!(
            room_id = %room_id,
            peer_id = %peer_id,
            peer_count = room.len(),
            "Added peer to room"
        );
        Ok(room)
    }

    /// Remove a peer from a room.
    ///
    /// The peer's consumers for that room are closed first. Then every
    /// remaining member, and finally the leaving peer, closes the producers
    /// nobody consumes anymore.
    pub async fn leave_room(&self, peer_id: &PeerId, room_id: &RoomId) -> Result<()> {
        let peer = self
            .peer(peer_id)
            .ok_or_else(|| Error::Validation(format!("no peer {peer_id}")))?;
        self.leave(&peer, room_id).await
    }

    async fn leave(&self, peer: &Arc<Peer>, room_id: &RoomId) -> Result<()> {
        let room = self
            .room(room_id)
            .ok_or_else(|| Error::Validation(format!("no room {room_id}")))?;
        if room.leave(peer.id()).is_none() {
            return Err(Error::Validation(format!(
                "peer {} is not in room {room_id}",
                peer.id()
            )));
        }
        peer.leave_room(room_id).await?;

        let closed_consumers = peer.close_consumers_in_room(room_id).await?;

        let mut closed_producers = 0;
        for other in room.peers() {
            match other
                .close_producers_no_consumers_except(room_id, peer.id())
                .await
            {
                Ok(closed) => closed_producers += closed.len(),
                Err(e) => warn!(peer_id = %other.id(), error = %e, "Failed to reclaim producers"),
            }
        }
        closed_producers += peer.close_producers_no_consumers(room_id).await?.len();

        info!(
            room_id = %room_id,
            peer_id = %peer.id(),
            closed_consumers = closed_consumers.len(),
            closed_producers,
            "Removed peer from room"
        );
        Ok(())
    }

    /// Leave every room, close the peer and forget it
    pub async fn close_peer(&self, peer_id: &PeerId) -> Result<()> {
        let (_, peer) = self
            .peers
            .remove(peer_id)
            .ok_or_else(|| Error::Validation(format!("no peer {peer_id}")))?;

        for room_id in peer.room_ids().await {
            if let Err(e) = self.leave(&peer, &room_id).await {
                warn!(peer_id = %peer_id, room_id = %room_id, error = %e, "Failed to leave room");
            }
        }
        peer.close().await;

        info!(peer_id = %peer_id, total_peers = self.peers.len(), "Closed peer");
        Ok(())
    }

    /// Close every peer
    pub async fn close(&self) {
        for peer_id in self.peer_ids() {
            if let Err(e) = self.close_peer(&peer_id).await {
                debug!(peer_id = %peer_id, error = %e, "Peer already gone");
            }
        }
        self.rooms.clear();
    }

    #[must_use]
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|entry| entry.key().clone()).collect()
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Drop rooms without members. Returns how many were removed.
    pub fn cleanup_empty_rooms(&self) -> usize {
        let before = self.rooms.len();
        self.rooms.retain(|room_id, room| {
            let keep = !room.is_empty();
            if !keep {
                debug!(room_id = %room_id, "Removed empty room");
            }
            keep
        });
        let removed_count = before.saturating_sub(self.rooms.len());

        if removed_count > 0 {
            info!(
                removed_count,
                remaining_rooms = self.rooms.len(),
                "Cleaned up empty rooms"
            );
        }
        removed_count
    }
}

impl std::fmt::Debug for MeetingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeetingManager")
            .field("router_id", self.router.id())
            .field("rooms", &self.rooms.len())
            .field("peers", &self.peers.len())
            .finish_non_exhaustive()
    }
}

/// Background task for periodic cleanup
async fn cleanup_task(manager: Weak<MeetingManager>, period: Duration) {
    let mut ticker = interval(period);
    // the first tick completes immediately
    ticker.tick().await;
    info!(interval_secs = period.as_secs(), "Starting cleanup task");

    loop {
        ticker.tick().await;
        let Some(manager) = manager.upgrade() else {
            debug!("Meeting manager dropped, stopping cleanup task");
            return;
        };
        manager.cleanup_empty_rooms();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::CreateWebRtcTransportRequest;
    use sfu_engine::test_helpers::{create_router, fake_worker, FakeWorker};
    use sfu_engine::Worker;

    async fn manager_with(config: MeetingConfig) -> (Arc<Worker>, FakeWorker, Arc<MeetingManager>) {
        let (worker, fake) = fake_worker();
        let router = create_router(&worker).await.unwrap();
        let manager = MeetingManager::new(router, WebRtcTransportSettings::default(), config);
        (worker, fake, manager)
    }

    #[tokio::test]
    async fn test_manager_creation() {
        let (_worker, _fake, manager) = manager_with(MeetingConfig::default()).await;
        assert_eq!(manager.room_count(), 0);
        assert_eq!(manager.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_peer_is_rejected() {
        let (_worker, _fake, manager) = manager_with(MeetingConfig::default()).await;
        let peer = manager
            .create_peer(PeerId::from("alice"), "Alice", None, AppData::new())
            .unwrap();
        assert_eq!(peer.sources(), MeetingConfig::default().default_sources.as_slice());

        let err = manager
            .create_peer(PeerId::from("alice"), "Alice", None, AppData::new())
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(manager.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_room_lifecycle() {
        let (_worker, _fake, manager) = manager_with(MeetingConfig::default()).await;
        manager
            .create_peer(PeerId::from("alice"), "Alice", None, AppData::new())
            .unwrap();

        let room_id = RoomId::from("test-room");
        let room = manager.join_room(&PeerId::from("alice"), room_id.clone()).await.unwrap();
        assert_eq!(manager.room_count(), 1);
        assert_eq!(room.len(), 1);

        // joining twice is a no-op
        manager.join_room(&PeerId::from("alice"), room_id.clone()).await.unwrap();
        assert_eq!(room.len(), 1);

        assert_eq!(manager.cleanup_empty_rooms(), 0);
        manager.leave_room(&PeerId::from("alice"), &room_id).await.unwrap();
        assert!(room.is_empty());
        assert_eq!(manager.cleanup_empty_rooms(), 1);
        assert_eq!(manager.room_count(), 0);
    }

    #[tokio::test]
    async fn test_room_limit() {
        let config = MeetingConfig {
            max_rooms: 2,
            ..MeetingConfig::default()
        };
        let (_worker, _fake, manager) = manager_with(config).await;

        manager.get_or_create_room(RoomId::from("room1")).unwrap();
        manager.get_or_create_room(RoomId::from("room2")).unwrap();
        // existing rooms are still returned at the limit
        manager.get_or_create_room(RoomId::from("room1")).unwrap();

        let result = manager.get_or_create_room(RoomId::from("room3"));
        assert!(matches!(result, Err(Error::LimitReached(_))));
    }

    #[tokio::test]
    async fn test_peer_limit() {
        let config = MeetingConfig {
            max_peers_per_room: 2,
            ..MeetingConfig::default()
        };
        let (_worker, _fake, manager) = manager_with(config).await;
        let room_id = RoomId::from("test-room");

        for id in ["peer1", "peer2", "peer3"] {
            manager
                .create_peer(PeerId::from(id), id, None, AppData::new())
                .unwrap();
        }
        manager.join_room(&PeerId::from("peer1"), room_id.clone()).await.unwrap();
        manager.join_room(&PeerId::from("peer2"), room_id.clone()).await.unwrap();

        let result = manager.join_room(&PeerId::from("peer3"), room_id).await;
        assert!(matches!(result, Err(Error::LimitReached(_))));
    }

    #[tokio::test]
    async fn test_unknown_peer_and_room() {
        let (_worker, _fake, manager) = manager_with(MeetingConfig::default()).await;
        let ghost = PeerId::from("ghost");

        assert!(manager.join_room(&ghost, RoomId::from("r")).await.unwrap_err().is_validation());
        assert!(manager.close_peer(&ghost).await.unwrap_err().is_validation());

        manager
            .create_peer(PeerId::from("alice"), "Alice", None, AppData::new())
            .unwrap();
        let err = manager
            .leave_room(&PeerId::from("alice"), &RoomId::from("nowhere"))
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_close_peer_leaves_rooms() {
        let (_worker, fake, manager) = manager_with(MeetingConfig::default()).await;
        let alice = manager
            .create_peer(PeerId::from("alice"), "Alice", None, AppData::new())
            .unwrap();
        let room_a = manager.join_room(alice.id(), RoomId::from("a")).await.unwrap();
        let room_b = manager.join_room(alice.id(), RoomId::from("b")).await.unwrap();

        manager.close_peer(alice.id()).await.unwrap();

        assert!(alice.is_closed());
        assert!(room_a.is_empty());
        assert!(room_b.is_empty());
        assert!(manager.peer(alice.id()).is_none());
        assert_eq!(fake.count("transport.close"), 0);
    }

    #[tokio::test]
    async fn test_cleanup_during_join_keeps_room() {
        let (_worker, fake, manager) = manager_with(MeetingConfig::default()).await;
        let alice = manager
            .create_peer(PeerId::from("alice"), "Alice", None, AppData::new())
            .unwrap();
        let transport = alice
            .create_webrtc_transport(CreateWebRtcTransportRequest {
                producing: true,
                ..CreateWebRtcTransportRequest::default()
            })
            .await
            .unwrap();

        // alice stays locked until her stats request is answered
        fake.stall("transport.getStats");
        let stats = tokio::spawn({
            let (alice, id) = (Arc::clone(&alice), transport.id().clone());
            async move { alice.get_transport_stats(&id).await }
        });
        let stalled = fake.wait_for_request("transport.getStats").await;

        let join = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.join_room(&PeerId::from("alice"), RoomId::from("lobby")).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!join.is_finished());

        assert_eq!(manager.cleanup_empty_rooms(), 0);

        fake.answer(&stalled, serde_json::json!({}));
        let room = join.await.unwrap().unwrap();
        stats.await.unwrap().unwrap();

        let tracked = manager.room(&RoomId::from("lobby")).unwrap();
        assert!(Arc::ptr_eq(&tracked, &room));
        assert_eq!(alice.room_ids().await, vec![RoomId::from("lobby")]);
        manager.leave_room(alice.id(), room.id()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_removes_empty_rooms() {
        let config = MeetingConfig {
            cleanup_interval_secs: 1,
            ..MeetingConfig::default()
        };
        let (_worker, _fake, manager) = manager_with(config).await;
        manager.get_or_create_room(RoomId::from("empty")).unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(manager.room_count(), 0);
    }
}
