//! Room membership and fan-out.
//!
//! Each room owns one tokio broadcast channel. Frames travel pre-encoded as
//! `(origin, Arc<String>)` pairs, so per-connection forwarders can do the echo
//! check on the origin alone without decoding JSON.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::RoomId;

/// A frame queued for fan-out: the originating session plus the encoded wire
/// message it sent.
pub type RoomFrame = (Uuid, Arc<String>);

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default)]
pub struct RoomStats {
    pub frames_sent: u64,
    pub active_members: usize,
}

/// One room's broadcast channel and member roster.
///
/// All sessions in the room share one channel. A published frame reaches every
/// subscriber, including its sender; skipping the sender is the forwarder's
/// job, keyed on the frame's origin.
pub struct RoomGroup {
    sender: broadcast::Sender<RoomFrame>,
    /// session id -> user id (if authenticated).
    members: Arc<RwLock<HashMap<Uuid, Option<String>>>>,
    capacity: usize,
    frames_sent: AtomicU64,
}

impl RoomGroup {
    /// `capacity` bounds how many frames buffer per member before a lagging
    /// forwarder starts dropping.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Add a session to the room, returning its receiver.
    pub async fn join(
        &self,
        session_id: Uuid,
        user_id: Option<String>,
    ) -> broadcast::Receiver<RoomFrame> {
        let mut members = self.members.write().await;
        members.insert(session_id, user_id);
        self.sender.subscribe()
    }

    /// Add a session only if the room has space. The check and the insert
    /// share one write lock, so concurrent joins cannot overshoot the cap.
    /// Re-joining an existing member always succeeds.
    pub async fn try_join(
        &self,
        session_id: Uuid,
        user_id: Option<String>,
        max_members: usize,
    ) -> Option<broadcast::Receiver<RoomFrame>> {
        let mut members = self.members.write().await;
        if !members.contains_key(&session_id) && members.len() >= max_members {
            return None;
        }
        members.insert(session_id, user_id);
        Some(self.sender.subscribe())
    }

    /// Remove a session. Returns its user id if it was a member.
    pub async fn leave(&self, session_id: &Uuid) -> Option<Option<String>> {
        let mut members = self.members.write().await;
        members.remove(session_id)
    }

    /// Publish a pre-encoded frame to every subscriber.
    ///
    /// Lock-free: broadcast send plus an atomic counter. Returns the number of
    /// receivers that got the frame.
    pub fn publish(&self, origin: Uuid, frame: Arc<String>) -> usize {
        let count = self.sender.send((origin, frame)).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn has_member(&self, session_id: &Uuid) -> bool {
        self.members.read().await.contains_key(session_id)
    }

    /// User ids of authenticated members (deduplicated, unordered).
    pub async fn member_users(&self) -> Vec<String> {
        let members = self.members.read().await;
        let mut users: Vec<String> = members.values().flatten().cloned().collect();
        users.sort();
        users.dedup();
        users
    }

    pub async fn stats(&self) -> RoomStats {
        RoomStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            active_members: self.members.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomFrame> {
        self.sender.subscribe()
    }
}

/// Maps room ids to their broadcast groups.
///
/// Rooms are created on first join and removed once empty, so the map only
/// ever holds rooms with live members.
pub struct RoomHub {
    rooms: Arc<RwLock<HashMap<RoomId, Arc<RoomGroup>>>>,
    default_capacity: usize,
}

impl RoomHub {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
        }
    }

    /// Get or create the group for a room.
    pub async fn get_or_create(&self, room: &RoomId) -> Arc<RoomGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(group) = rooms.get(room) {
                return group.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring the write lock
        if let Some(group) = rooms.get(room) {
            return group.clone();
        }
        let group = Arc::new(RoomGroup::new(self.default_capacity));
        rooms.insert(room.clone(), group.clone());
        group
    }

    pub async fn get(&self, room: &RoomId) -> Option<Arc<RoomGroup>> {
        self.rooms.read().await.get(room).cloned()
    }

    /// Remove a room if it has no members left.
    pub async fn remove_if_empty(&self, room: &RoomId) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(group) = rooms.get(room) {
            if group.member_count().await == 0 {
                rooms.remove(room);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<RoomId> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
