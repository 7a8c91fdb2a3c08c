//! Room: a named set of peers
//!
//! Holds shared references only. Peers are owned by the manager and keep a
//! weak back-reference to every room they joined.

use crate::peer::Peer;
use crate::types::{PeerId, RoomId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;

pub struct Room {
    id: RoomId,
    peers: DashMap<PeerId, Arc<Peer>>,
    created_at: DateTime<Utc>,
}

impl Room {
    #[must_use]
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            peers: DashMap::new(),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &RoomId {
        &self.id
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Add a peer. Returns false if it was already a member.
    pub fn join(&self, peer: Arc<Peer>) -> bool {
        self.peers.insert(peer.id().clone(), peer).is_none()
    }

    pub fn leave(&self, peer_id: &PeerId) -> Option<Arc<Peer>> {
        self.peers.remove(peer_id).map(|(_, peer)| peer)
    }

    #[must_use]
    pub fn peer(&self, peer_id: &PeerId) -> Option<Arc<Peer>> {
        self.peers.get(peer_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of the current members
    #[must_use]
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|entry| entry.key().clone()).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("peers", &self.peer_ids())
            .finish_non_exhaustive()
    }
}
