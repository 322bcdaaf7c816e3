//! WebSocket sync client connecting the entity stores to the sync server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with room rejoin)
//! - Publishing confirmed mutations as room-addressed envelopes
//! - Incoming event dispatch through the [`EventRouter`]
//! - Offline queue for events published while disconnected

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use futures_util::{SinkExt, StreamExt};
use uuid::Uuid;

use crate::protocol::{Envelope, Event, ProtocolError, RoomId, WireMessage};
use crate::router::EventRouter;
use crate::store::Publish;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL, e.g. `ws://127.0.0.1:9090`.
    pub server_url: String,
    /// Authenticated user, if any. Rides on every envelope.
    pub user_id: Option<String>,
    /// Maximum events held while disconnected.
    pub offline_queue_size: usize,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            user_id: None,
            offline_queue_size: 10_000,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Offline queue for envelopes published while disconnected.
///
/// Queued frames are replayed in order on reconnection.
pub struct OfflineQueue {
    queue: VecDeque<String>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an encoded frame for later replay. Returns false when full.
    pub fn enqueue(&mut self, frame: String) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(frame);
        true
    }

    /// Drain all queued frames in publish order.
    pub fn drain(&mut self) -> Vec<String> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|f| f.len()).sum()
    }
}

/// The sync client.
///
/// Owns one server connection, one session identity, and the dispatch path
/// into the stores. Cloning shares the underlying connection.
#[derive(Clone)]
pub struct SyncClient {
    config: ClientConfig,
    /// Session identity; stamped as `origin` on every published envelope.
    session_id: Uuid,
    router: EventRouter,
    state: Arc<RwLock<ConnectionState>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    /// Channel into the WebSocket writer task; `None` while disconnected.
    outgoing_tx: Arc<RwLock<Option<mpsc::Sender<String>>>>,
    /// Rooms to rejoin after a reconnect.
    joined_rooms: Arc<Mutex<Vec<RoomId>>>,
}

impl SyncClient {
    pub fn new(config: ClientConfig, router: EventRouter) -> Self {
        let queue_size = config.offline_queue_size;
        Self {
            config,
            session_id: router.session_id(),
            router,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(queue_size))),
            outgoing_tx: Arc::new(RwLock::new(None)),
            joined_rooms: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Connect to the server and spawn the reader/writer tasks.
    ///
    /// Sends the `hello` handshake, rejoins previously joined rooms, and
    /// replays the offline queue.
    pub async fn connect(&self) -> Result<(), ProtocolError> {
        let rejoin = !self.joined_rooms.lock().await.is_empty();
        {
            let mut state = self.state.write().await;
            match *state {
                // Already live (or a connect is in progress): a second socket
                // would double-dispatch every event until the first one died.
                ConnectionState::Connected
                | ConnectionState::Connecting
                | ConnectionState::Reconnecting => return Ok(()),
                ConnectionState::Disconnected => {
                    *state = if rejoin {
                        ConnectionState::Reconnecting
                    } else {
                        ConnectionState::Connecting
                    };
                }
            }
        }

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.config.server_url).await
        {
            Ok(ok) => ok,
            Err(e) => {
                log::warn!("Connection to {} failed: {e}", self.config.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };

        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        *self.outgoing_tx.write().await = Some(out_tx.clone());

        // Writer task: forward the outgoing channel to the socket. When the
        // channel closes (disconnect), close the socket behind it.
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer
                    .send(tokio_tungstenite::tungstenite::Message::Text(frame.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Handshake must be the first frame on the connection.
        let hello = WireMessage::Hello {
            session_id: self.session_id,
            user_id: self.config.user_id.clone(),
        };
        out_tx
            .send(hello.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        // Rejoin rooms from before the disconnect.
        for room in self.joined_rooms.lock().await.iter() {
            let join = WireMessage::JoinRoom {
                room: room.clone(),
                user_id: self.config.user_id.clone(),
            };
            out_tx
                .send(join.encode()?)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }

        *self.state.write().await = ConnectionState::Connected;

        // Replay offline queue in publish order.
        {
            let queued = self.offline_queue.lock().await.drain();
            if !queued.is_empty() {
                log::info!("Replaying {} queued events", queued.len());
                for frame in queued {
                    out_tx
                        .send(frame)
                        .await
                        .map_err(|_| ProtocolError::ConnectionClosed)?;
                }
            }
        }

        // Reader task: dispatch incoming frames into the stores.
        let router = self.router.clone();
        let state = self.state.clone();
        let outgoing_tx = self.outgoing_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Text(text)) => {
                        match WireMessage::decode(&text) {
                            Ok(WireMessage::Event(envelope)) => router.dispatch(&envelope),
                            Ok(WireMessage::Ping) => {
                                let tx = outgoing_tx.read().await.as_ref().cloned();
                                if let (Some(tx), Ok(frame)) = (tx, WireMessage::Pong.encode()) {
                                    let _ = tx.send(frame).await;
                                }
                            }
                            Ok(WireMessage::Pong) => {}
                            Ok(other) => {
                                log::debug!("Ignoring unexpected frame: {other:?}");
                            }
                            Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *outgoing_tx.write().await = None;
            *state.write().await = ConnectionState::Disconnected;
            log::info!("Server connection lost");
        });

        Ok(())
    }

    /// Join a room and remember it for reconnects.
    pub async fn join_room(&self, room: RoomId) -> Result<(), ProtocolError> {
        {
            let mut rooms = self.joined_rooms.lock().await;
            if !rooms.contains(&room) {
                rooms.push(room.clone());
            }
        }
        let join = WireMessage::JoinRoom {
            room,
            user_id: self.config.user_id.clone(),
        };
        self.send_frame(join.encode()?).await
    }

    /// Leave a room and forget it.
    pub async fn leave_room(&self, room: RoomId) -> Result<(), ProtocolError> {
        self.joined_rooms.lock().await.retain(|r| r != &room);
        let leave = WireMessage::LeaveRoom {
            room,
            user_id: self.config.user_id.clone(),
        };
        self.send_frame(leave.encode()?).await
    }

    /// Publish a confirmed mutation to a room.
    ///
    /// While disconnected, the encoded envelope is queued for replay.
    pub async fn publish(&self, room: RoomId, event: Event) -> Result<(), ProtocolError> {
        let envelope = Envelope::new(
            room,
            self.session_id,
            self.config.user_id.clone(),
            event,
        );
        let frame = WireMessage::Event(envelope).encode()?;

        if *self.state.read().await != ConnectionState::Connected {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(frame) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }
        self.send_frame(frame).await
    }

    /// Drain the stores' outbound channel into the transport.
    ///
    /// Stores emit a [`Publish`] per confirmed mutation; this pump turns each
    /// into a published envelope. Runs until the channel closes.
    pub fn spawn_outbound_pump(&self, mut rx: mpsc::UnboundedReceiver<Publish>) {
        let client = self.clone();
        tokio::spawn(async move {
            while let Some(publish) = rx.recv().await {
                if let Err(e) = client.publish(publish.room, publish.event).await {
                    log::warn!("Failed to publish confirmed mutation: {e}");
                }
            }
        });
    }

    /// Send a protocol-level ping.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send_frame(WireMessage::Ping.encode()?).await
    }

    /// Close the connection. Dropping the outgoing sender ends the writer
    /// task, which closes the socket; the server then announces presence
    /// departures for any document rooms this session was in.
    pub async fn disconnect(&self) {
        *self.outgoing_tx.write().await = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    async fn send_frame(&self, frame: String) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.read().await;
        match tx.as_ref() {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    pub fn server_url(&self) -> &str {
        &self.config.server_url
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }

    pub async fn joined_rooms(&self) -> Vec<RoomId> {
        self.joined_rooms.lock().await.clone()
    }
}
