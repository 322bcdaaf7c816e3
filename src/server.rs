//! WebSocket sync server with room-based event routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── RoomHub ── RoomGroup (document:d1) ──┐
//! Client B ──┘              RoomGroup (database:db1)   ├── fan-out
//!                           RoomGroup (user:u1)        │
//!                          ┌───────────┬───────────────┘
//!                          ▼           ▼
//!                       Client A    Client B
//! ```
//!
//! The server relays, it does not interpret: an event frame is published to
//! its room as the raw text it arrived in, and each connection's forwarder
//! drops frames whose origin is its own session. The only frames the server
//! originates itself are `presence:leave` events when a connection drops out
//! of its document rooms.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::membership::RoomHub;
use crate::protocol::{Envelope, Event, RoomId, WireMessage};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum sessions per room
    pub max_members_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_members_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    hub: Arc<RoomHub>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let hub = Arc::new(RoomHub::new(config.broadcast_capacity));
        Self {
            config,
            hub,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the accept loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<RoomHub>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Connection state, established by the hello handshake.
        let mut session_id: Option<Uuid> = None;
        let mut user_id: Option<String> = None;
        // Joined rooms and their forwarder tasks.
        let mut joined: HashMap<RoomId, tokio::task::JoinHandle<()>> = HashMap::new();

        // Forwarders funnel room frames into this per-connection channel; the
        // select loop below owns the socket writer.
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            match WireMessage::decode(&text) {
                                Ok(WireMessage::Hello { session_id: sid, user_id: uid }) => {
                                    // A session identity is fixed for the life
                                    // of the connection: forwarders already
                                    // spawned filter echoes against it.
                                    if session_id.is_some() {
                                        log::warn!("Repeated hello from {addr}, ignoring");
                                        continue;
                                    }
                                    log::info!("Session {sid} ({uid:?}) connected from {addr}");
                                    session_id = Some(sid);
                                    user_id = uid.clone();

                                    // Every authenticated session listens on its
                                    // own user room for notifications.
                                    if let Some(uid) = uid {
                                        Self::join_room(
                                            RoomId::user(&uid),
                                            sid,
                                            Some(uid),
                                            &hub,
                                            &config,
                                            &out_tx,
                                            &mut joined,
                                        )
                                        .await;
                                    }
                                }
                                Ok(WireMessage::JoinRoom { room, user_id: uid }) => {
                                    let Some(sid) = session_id else {
                                        log::warn!("join-room before hello from {addr}");
                                        continue;
                                    };
                                    Self::join_room(
                                        room, sid, uid, &hub, &config, &out_tx, &mut joined,
                                    )
                                    .await;
                                }
                                Ok(WireMessage::LeaveRoom { room, user_id: uid }) => {
                                    let Some(sid) = session_id else { continue };
                                    if let Some(forwarder) = joined.remove(&room) {
                                        forwarder.abort();
                                    }
                                    Self::leave_room(&room, sid, uid, &hub).await;
                                }
                                Ok(WireMessage::Event(envelope)) => {
                                    if session_id.is_none() {
                                        log::warn!("event before hello from {addr}");
                                        continue;
                                    }
                                    // Relay the raw frame; subscribers decode it
                                    // themselves and the origin rides alongside
                                    // for echo filtering.
                                    if let Some(group) = hub.get(&envelope.room).await {
                                        group.publish(envelope.origin, Arc::new(text.to_string()));
                                    } else {
                                        log::debug!(
                                            "Dropping event for memberless room {}",
                                            envelope.room
                                        );
                                    }
                                }
                                Ok(WireMessage::Ping) => {
                                    if let Ok(frame) = WireMessage::Pong.encode() {
                                        if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                                            log::info!("Write to {addr} failed, dropping connection");
                                            break;
                                        }
                                    }
                                }
                                Ok(WireMessage::Pong) => {}
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if ws_sender.send(Message::Pong(data)).await.is_err() {
                                log::info!("Write to {addr} failed, dropping connection");
                                break;
                            }
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Frames forwarded from joined rooms. A failed write means the
                // peer is gone; break so the cleanup below still runs and the
                // session leaves every room it occupied.
                frame = out_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                                log::info!("Write to {addr} failed, dropping connection");
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        // Cleanup: leave every room, announcing presence-leave where due.
        if let Some(sid) = session_id {
            for (room, forwarder) in joined.drain() {
                forwarder.abort();
                Self::leave_room(&room, sid, user_id.clone(), &hub).await;
            }
        }

        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_rooms = hub.room_count().await;
        }

        Ok(())
    }

    /// Join a session to a room and spawn its forwarder task.
    async fn join_room(
        room: RoomId,
        session_id: Uuid,
        user_id: Option<String>,
        hub: &Arc<RoomHub>,
        config: &ServerConfig,
        out_tx: &mpsc::Sender<String>,
        joined: &mut HashMap<RoomId, tokio::task::JoinHandle<()>>,
    ) {
        if joined.contains_key(&room) {
            return;
        }

        let group = hub.get_or_create(&room).await;
        let Some(mut rx) = group
            .try_join(session_id, user_id.clone(), config.max_members_per_room)
            .await
        else {
            log::warn!("Room {room} is full, rejecting session {session_id}");
            hub.remove_if_empty(&room).await;
            return;
        };
        log::info!("Session {session_id} joined room {room}");

        // Presence is announced for document rooms only.
        if room.is_document() {
            if let Some(ref uid) = user_id {
                let envelope = Envelope::new(
                    room.clone(),
                    session_id,
                    user_id.clone(),
                    Event::PresenceJoin {
                        user_id: uid.clone(),
                    },
                );
                if let Ok(frame) = WireMessage::Event(envelope).encode() {
                    group.publish(session_id, Arc::new(frame));
                }
            }
        }

        // Forwarder: room frames to this connection, minus its own.
        let out_tx = out_tx.clone();
        let room_name = room.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok((origin, frame)) => {
                        if origin == session_id {
                            continue;
                        }
                        if out_tx.send((*frame).clone()).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!(
                            "Session {session_id} lagged by {n} frames in room {room_name}"
                        );
                    }
                    Err(_) => break,
                }
            }
        });
        joined.insert(room, forwarder);
    }

    /// Remove a session from a room, announcing presence-leave for document
    /// rooms, and drop the room once empty.
    async fn leave_room(room: &RoomId, session_id: Uuid, user_id: Option<String>, hub: &Arc<RoomHub>) {
        let Some(group) = hub.get(room).await else {
            return;
        };
        if group.leave(&session_id).await.is_none() {
            return;
        }
        log::info!("Session {session_id} left room {room}");

        if room.is_document() {
            if let Some(uid) = user_id.clone() {
                let envelope = Envelope::new(
                    room.clone(),
                    session_id,
                    user_id,
                    Event::PresenceLeave { user_id: uid },
                );
                if let Ok(frame) = WireMessage::Event(envelope).encode() {
                    group.publish(session_id, Arc::new(frame));
                }
            }
        }

        if hub.remove_if_empty(room).await {
            log::info!("Room {room} removed (empty)");
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.hub.room_count().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn hub(&self) -> &Arc<RoomHub> {
        &self.hub
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_members_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[test]
    fn test_server_custom_config() {
        let config = ServerConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            max_members_per_room: 50,
            broadcast_capacity: 512,
        };
        let server = SyncServer::new(config);
        assert_eq!(server.bind_addr(), "0.0.0.0:8080");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_frames, 0);
        assert_eq!(stats.total_bytes, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_join_and_leave_room_lifecycle() {
        let server = SyncServer::with_defaults();
        let config = ServerConfig::default();
        let session = Uuid::new_v4();
        let (out_tx, _out_rx) = mpsc::channel(8);
        let mut joined = HashMap::new();

        let room = RoomId::database("db1");
        SyncServer::join_room(
            room.clone(),
            session,
            Some("u1".into()),
            server.hub(),
            &config,
            &out_tx,
            &mut joined,
        )
        .await;

        assert!(joined.contains_key(&room));
        assert_eq!(server.hub().room_count().await, 1);

        let forwarder = joined.remove(&room).unwrap();
        forwarder.abort();
        SyncServer::leave_room(&room, session, Some("u1".into()), server.hub()).await;
        assert_eq!(server.hub().room_count().await, 0);
    }

    #[tokio::test]
    async fn test_room_capacity_enforced() {
        let server = SyncServer::with_defaults();
        let config = ServerConfig {
            max_members_per_room: 1,
            ..ServerConfig::default()
        };
        let (out_tx, _out_rx) = mpsc::channel(8);
        let room = RoomId::document("d1");

        let mut joined_a = HashMap::new();
        SyncServer::join_room(
            room.clone(),
            Uuid::new_v4(),
            None,
            server.hub(),
            &config,
            &out_tx,
            &mut joined_a,
        )
        .await;
        assert!(joined_a.contains_key(&room));

        let mut joined_b = HashMap::new();
        SyncServer::join_room(
            room.clone(),
            Uuid::new_v4(),
            None,
            server.hub(),
            &config,
            &out_tx,
            &mut joined_b,
        )
        .await;
        assert!(!joined_b.contains_key(&room));

        let group = server.hub().get(&room).await.unwrap();
        assert_eq!(group.member_count().await, 1);
    }

    #[tokio::test]
    async fn test_leave_announces_presence_for_document_rooms() {
        let server = SyncServer::with_defaults();
        let room = RoomId::document("d1");
        let group = server.hub().get_or_create(&room).await;

        let leaver = Uuid::new_v4();
        let watcher = Uuid::new_v4();
        let _leaver_rx = group.join(leaver, Some("u1".into())).await;
        let mut watcher_rx = group.join(watcher, Some("u2".into())).await;

        SyncServer::leave_room(&room, leaver, Some("u1".into()), server.hub()).await;

        let (origin, frame) = watcher_rx.recv().await.unwrap();
        assert_eq!(origin, leaver);
        match WireMessage::decode(&frame).unwrap() {
            WireMessage::Event(envelope) => {
                assert_eq!(
                    envelope.event,
                    Event::PresenceLeave {
                        user_id: "u1".to_string()
                    }
                );
            }
            other => panic!("Expected event frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_leave_user_room_is_silent() {
        let server = SyncServer::with_defaults();
        let room = RoomId::user("u1");
        let group = server.hub().get_or_create(&room).await;

        let leaver = Uuid::new_v4();
        let watcher = Uuid::new_v4();
        let _leaver_rx = group.join(leaver, Some("u1".into())).await;
        let mut watcher_rx = group.join(watcher, Some("u1".into())).await;

        SyncServer::leave_room(&room, leaver, Some("u1".into()), server.hub()).await;

        assert!(watcher_rx.try_recv().is_err());
    }
}
