//! End-to-end tests: a real server, real WebSocket clients, room fan-out,
//! echo suppression, offline replay, and presence on disconnect.

use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

use tessera_sync::client::{ClientConfig, ConnectionState, SyncClient};
use tessera_sync::entity::DatabaseRow;
use tessera_sync::ledger::OptimisticLedger;
use tessera_sync::protocol::{Envelope, Event, RoomId, WireMessage};
use tessera_sync::router::{EventRouter, Stores};
use tessera_sync::server::{ServerConfig, SyncServer};
use tessera_sync::store::{
    CommentStore, DatabaseStore, DocumentStore, NotificationStore, StoreContext,
};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return its URL.
async fn start_test_server() -> String {
    let (url, _server) = start_observable_server().await;
    url
}

/// Start a server and keep a handle for inspecting its hub and stats.
async fn start_observable_server() -> (String, Arc<SyncServer>) {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_members_per_room: 10,
        broadcast_capacity: 64,
    };
    let server = Arc::new(SyncServer::new(config));
    let runner = server.clone();
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    // Give the server time to bind
    sleep(Duration::from_millis(50)).await;
    (format!("ws://127.0.0.1:{port}"), server)
}

fn make_client(url: &str, user: &str) -> SyncClient {
    let ctx = StoreContext::new(OptimisticLedger::new());
    let stores = Stores {
        documents: DocumentStore::new(ctx.clone()),
        database: DatabaseStore::new(ctx.clone()),
        comments: CommentStore::new(ctx.clone()),
        notifications: NotificationStore::new(ctx),
    };
    let router = EventRouter::new(Arc::new(stores), Uuid::new_v4());
    SyncClient::new(ClientConfig::new(url).with_user(user), router)
}

/// Poll until `check` passes or the deadline expires.
async fn wait_for(check: impl Fn() -> bool) {
    let deadline = Duration::from_secs(2);
    timeout(deadline, async {
        while !check() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let url = start_test_server().await;
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_connects() {
    let url = start_test_server().await;
    let client = make_client(&url, "alice");

    client.connect().await.unwrap();
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_event_propagates_between_clients() {
    let url = start_test_server().await;
    let room = RoomId::database("db1");

    let alice = make_client(&url, "alice");
    alice.connect().await.unwrap();
    alice.join_room(room.clone()).await.unwrap();

    let bob = make_client(&url, "bob");
    bob.connect().await.unwrap();
    bob.join_room(room.clone()).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    alice
        .publish(
            room,
            Event::RowCreate {
                row: DatabaseRow::new("row-1", "db1", 0),
            },
        )
        .await
        .unwrap();

    // Bob's store receives the row through the router.
    let bob_router = bob.router().clone();
    wait_for(move || !bob_router.stores().database.database_rows("db1").is_empty()).await;
    let rows = bob.router().stores().database.database_rows("db1");
    assert_eq!(rows[0].id, "row-1");
}

#[tokio::test]
async fn test_no_echo_back_to_publisher() {
    let url = start_test_server().await;
    let room = RoomId::database("db1");

    let alice = make_client(&url, "alice");
    alice.connect().await.unwrap();
    alice.join_room(room.clone()).await.unwrap();

    let bob = make_client(&url, "bob");
    bob.connect().await.unwrap();
    bob.join_room(room.clone()).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    alice
        .publish(
            room,
            Event::RowCreate {
                row: DatabaseRow::new("row-1", "db1", 0),
            },
        )
        .await
        .unwrap();

    let bob_router = bob.router().clone();
    wait_for(move || !bob_router.stores().database.database_rows("db1").is_empty()).await;

    // Alice's own store never saw the event come back: the server skipped her
    // connection, and her router would have suppressed it regardless.
    assert!(alice.router().stores().database.database_rows("db1").is_empty());
}

#[tokio::test]
async fn test_rooms_isolate_events() {
    let url = start_test_server().await;

    let alice = make_client(&url, "alice");
    alice.connect().await.unwrap();
    alice.join_room(RoomId::database("db1")).await.unwrap();

    let bob = make_client(&url, "bob");
    bob.connect().await.unwrap();
    bob.join_room(RoomId::database("db2")).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    alice
        .publish(
            RoomId::database("db1"),
            Event::RowCreate {
                row: DatabaseRow::new("row-1", "db1", 0),
            },
        )
        .await
        .unwrap();
    sleep(Duration::from_millis(200)).await;

    // Bob is in a different room and sees nothing.
    assert!(bob.router().stores().database.database_rows("db1").is_empty());
}

#[tokio::test]
async fn test_offline_publish_replays_on_connect() {
    let url = start_test_server().await;
    let room = RoomId::database("db1");

    let bob = make_client(&url, "bob");
    bob.connect().await.unwrap();
    bob.join_room(room.clone()).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    // Alice publishes before ever connecting; the event is queued.
    let alice = make_client(&url, "alice");
    alice
        .publish(
            room,
            Event::RowCreate {
                row: DatabaseRow::new("row-1", "db1", 0),
            },
        )
        .await
        .unwrap();
    assert_eq!(alice.offline_queue_len().await, 1);

    alice.connect().await.unwrap();

    let bob_router = bob.router().clone();
    wait_for(move || !bob_router.stores().database.database_rows("db1").is_empty()).await;
    assert_eq!(alice.offline_queue_len().await, 0);
}

#[tokio::test]
async fn test_presence_leave_on_disconnect() {
    let url = start_test_server().await;
    let room = RoomId::document("d1");

    // Watcher: a raw WebSocket peer observing the document room.
    let (mut watcher, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let watcher_session = Uuid::new_v4();
    watcher
        .send(tokio_tungstenite::tungstenite::Message::Text(
            WireMessage::Hello {
                session_id: watcher_session,
                user_id: Some("watcher".to_string()),
            }
            .encode()
            .unwrap()
            .into(),
        ))
        .await
        .unwrap();
    watcher
        .send(tokio_tungstenite::tungstenite::Message::Text(
            WireMessage::JoinRoom {
                room: room.clone(),
                user_id: Some("watcher".to_string()),
            }
            .encode()
            .unwrap()
            .into(),
        ))
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;

    // Alice joins the same document room, then drops her connection.
    let alice = make_client(&url, "alice");
    alice.connect().await.unwrap();
    alice.join_room(room.clone()).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    alice.disconnect().await;

    // The watcher sees presence:join then presence:leave for alice.
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        let frame = match timeout(Duration::from_millis(500), watcher.next()).await {
            Ok(Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text)))) => text,
            Ok(Some(Ok(_))) => continue,
            _ => break,
        };
        if let Ok(WireMessage::Event(envelope)) = WireMessage::decode(&frame) {
            seen.push(envelope.event);
        }
        if seen.contains(&Event::PresenceLeave {
            user_id: "alice".to_string(),
        }) {
            break;
        }
    }

    assert!(seen.contains(&Event::PresenceJoin {
        user_id: "alice".to_string()
    }));
    assert!(seen.contains(&Event::PresenceLeave {
        user_id: "alice".to_string()
    }));
}

#[tokio::test]
async fn test_abrupt_peer_death_frees_room_membership() {
    let (url, server) = start_observable_server().await;
    let room = RoomId::document("d1");

    // Watcher observes the document room.
    let (mut watcher, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let watcher_session = Uuid::new_v4();
    for frame in [
        WireMessage::Hello {
            session_id: watcher_session,
            user_id: Some("watcher".to_string()),
        },
        WireMessage::JoinRoom {
            room: room.clone(),
            user_id: Some("watcher".to_string()),
        },
    ] {
        watcher
            .send(tokio_tungstenite::tungstenite::Message::Text(
                frame.encode().unwrap().into(),
            ))
            .await
            .unwrap();
    }

    // Ghost joins the same room, then its socket resets without a close
    // handshake, as if the process was killed.
    let (mut ghost, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    for frame in [
        WireMessage::Hello {
            session_id: Uuid::new_v4(),
            user_id: Some("ghost".to_string()),
        },
        WireMessage::JoinRoom {
            room: room.clone(),
            user_id: Some("ghost".to_string()),
        },
    ] {
        ghost
            .send(tokio_tungstenite::tungstenite::Message::Text(
                frame.encode().unwrap().into(),
            ))
            .await
            .unwrap();
    }
    sleep(Duration::from_millis(50)).await;
    if let tokio_tungstenite::MaybeTlsStream::Plain(tcp) = ghost.get_ref() {
        tcp.set_linger(Some(Duration::from_secs(0))).unwrap();
    }
    drop(ghost);

    // Keep traffic flowing so the server writes to the dead socket, and wait
    // for the server-originated presence:leave for the ghost.
    let mut saw_leave = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline && !saw_leave {
        let envelope = Envelope::new(
            room.clone(),
            watcher_session,
            Some("watcher".to_string()),
            Event::DocArchive {
                id: "d1".to_string(),
            },
        );
        watcher
            .send(tokio_tungstenite::tungstenite::Message::Text(
                WireMessage::Event(envelope).encode().unwrap().into(),
            ))
            .await
            .unwrap();

        while let Ok(Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text)))) =
            timeout(Duration::from_millis(100), watcher.next()).await
        {
            if let Ok(WireMessage::Event(env)) = WireMessage::decode(&text) {
                if env.event
                    == (Event::PresenceLeave {
                        user_id: "ghost".to_string(),
                    })
                {
                    saw_leave = true;
                    break;
                }
            }
        }
    }
    assert!(saw_leave, "dead session was never removed from the room");

    // The room holds only the watcher now.
    let group = server.hub().get(&room).await.unwrap();
    assert_eq!(group.member_users().await, vec!["watcher".to_string()]);
}

#[tokio::test]
async fn test_repeated_hello_is_ignored() {
    let (url, server) = start_observable_server().await;

    let (mut socket, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let first = Uuid::new_v4();
    socket
        .send(tokio_tungstenite::tungstenite::Message::Text(
            WireMessage::Hello {
                session_id: first,
                user_id: Some("u1".to_string()),
            }
            .encode()
            .unwrap()
            .into(),
        ))
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;

    // The hello auto-joined the user room under the first session id.
    let user_room = server.hub().get(&RoomId::user("u1")).await.unwrap();
    assert!(user_room.has_member(&first).await);

    // A second hello must not re-identify the established connection.
    socket
        .send(tokio_tungstenite::tungstenite::Message::Text(
            WireMessage::Hello {
                session_id: Uuid::new_v4(),
                user_id: Some("u2".to_string()),
            }
            .encode()
            .unwrap()
            .into(),
        ))
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;

    assert!(server.hub().get(&RoomId::user("u2")).await.is_none());
    assert!(user_room.has_member(&first).await);
}

#[tokio::test]
async fn test_connect_while_connected_is_a_no_op() {
    let (url, server) = start_observable_server().await;
    let alice = make_client(&url, "alice");

    alice.connect().await.unwrap();
    alice.connect().await.unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(alice.connection_state().await, ConnectionState::Connected);
    // One socket only: the second connect was a no-op.
    assert_eq!(server.stats().await.total_connections, 1);
}

#[tokio::test]
async fn test_ping_pong() {
    let url = start_test_server().await;
    let (mut socket, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    socket
        .send(tokio_tungstenite::tungstenite::Message::Text(
            WireMessage::Ping.encode().unwrap().into(),
        ))
        .await
        .unwrap();

    let frame = timeout(Duration::from_secs(2), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match frame {
        tokio_tungstenite::tungstenite::Message::Text(text) => {
            assert_eq!(WireMessage::decode(&text).unwrap(), WireMessage::Pong);
        }
        other => panic!("Expected text frame, got {other:?}"),
    }
}
