//! Wire protocol for entity-change events and room control.
//!
//! Frames are JSON text messages:
//! ```text
//! ┌────────────────┬──────────────────────────────────────────────┐
//! │ WireMessage    │ {"type":"event","payload":{Envelope}}         │
//! │ Envelope       │ {room, origin, user_id, event:{type,payload}} │
//! └────────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! The event set is closed: an envelope whose `type` is not in [`Event`] fails
//! to decode, and callers drop it rather than erroring. Room addressing uses
//! `document:<id>`, `database:<id>` and `user:<id>` string keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::entity::{
    Comment, DatabaseProperty, DatabaseRow, Document, DocumentPatch, Notification,
};

/// A pub/sub room scoping broadcast of entity-change events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum RoomId {
    /// A document, its comments, and its presence.
    Document(String),
    /// Rows, cells, and properties of one database block.
    Database(String),
    /// Notifications and favorites targeted at one user.
    User(String),
}

impl RoomId {
    pub fn document(id: impl Into<String>) -> Self {
        RoomId::Document(id.into())
    }

    pub fn database(id: impl Into<String>) -> Self {
        RoomId::Database(id.into())
    }

    pub fn user(id: impl Into<String>) -> Self {
        RoomId::User(id.into())
    }

    /// Whether this is a `document:*` room (the only kind that emits
    /// presence-leave on disconnect).
    pub fn is_document(&self) -> bool {
        matches!(self, RoomId::Document(_))
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomId::Document(id) => write!(f, "document:{id}"),
            RoomId::Database(id) => write!(f, "database:{id}"),
            RoomId::User(id) => write!(f, "user:{id}"),
        }
    }
}

impl From<RoomId> for String {
    fn from(room: RoomId) -> String {
        room.to_string()
    }
}

impl TryFrom<String> for RoomId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.split_once(':') {
            Some(("document", id)) if !id.is_empty() => Ok(RoomId::Document(id.to_string())),
            Some(("database", id)) if !id.is_empty() => Ok(RoomId::Database(id.to_string())),
            Some(("user", id)) if !id.is_empty() => Ok(RoomId::User(id.to_string())),
            _ => Err(ProtocolError::UnknownRoom(value)),
        }
    }
}

/// One cell edit inside a batch update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CellEdit {
    pub row_id: String,
    pub property_id: String,
    pub value: serde_json::Value,
}

/// The closed set of entity-change events carried between clients.
///
/// Serialized as `{type, payload}`; unknown types fail to decode and are
/// dropped by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum Event {
    #[serde(rename = "doc:create")]
    DocCreate {
        document: Document,
        parent_id: Option<String>,
    },
    #[serde(rename = "doc:update")]
    DocUpdate { id: String, patch: DocumentPatch },
    #[serde(rename = "doc:archive")]
    DocArchive { id: String },
    #[serde(rename = "doc:restore")]
    DocRestore { id: String },

    #[serde(rename = "db:row:create")]
    RowCreate { row: DatabaseRow },
    #[serde(rename = "db:row:update")]
    RowUpdate {
        database_id: String,
        row_id: String,
        order: u32,
    },
    #[serde(rename = "db:row:delete")]
    RowDelete {
        database_id: String,
        row_id: String,
    },
    #[serde(rename = "db:cell:update")]
    CellUpdate {
        database_id: String,
        row_id: String,
        property_id: String,
        value: serde_json::Value,
    },
    #[serde(rename = "db:cells:batch")]
    CellsBatch {
        database_id: String,
        edits: Vec<CellEdit>,
    },
    #[serde(rename = "db:property:create")]
    PropertyCreate { property: DatabaseProperty },
    #[serde(rename = "db:property:update")]
    PropertyUpdate {
        database_id: String,
        property_id: String,
        name: String,
    },
    #[serde(rename = "db:property:delete")]
    PropertyDelete {
        database_id: String,
        property_id: String,
    },

    #[serde(rename = "comment:create")]
    CommentCreate { comment: Comment },
    #[serde(rename = "comment:update")]
    CommentUpdate {
        page_id: String,
        comment_id: String,
        body: String,
    },
    #[serde(rename = "comment:resolve")]
    CommentResolve {
        page_id: String,
        comment_id: String,
        resolved: bool,
    },
    #[serde(rename = "comment:delete")]
    CommentDelete {
        page_id: String,
        comment_id: String,
    },

    #[serde(rename = "notification:create")]
    NotificationCreate { notification: Notification },
    #[serde(rename = "notification:read")]
    NotificationRead { id: String },
    #[serde(rename = "notification:read-all")]
    NotificationReadAll,
    #[serde(rename = "notification:delete")]
    NotificationDelete { id: String },

    #[serde(rename = "presence:join")]
    PresenceJoin { user_id: String },
    #[serde(rename = "presence:leave")]
    PresenceLeave { user_id: String },
}

impl Event {
    /// The wire name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            Event::DocCreate { .. } => "doc:create",
            Event::DocUpdate { .. } => "doc:update",
            Event::DocArchive { .. } => "doc:archive",
            Event::DocRestore { .. } => "doc:restore",
            Event::RowCreate { .. } => "db:row:create",
            Event::RowUpdate { .. } => "db:row:update",
            Event::RowDelete { .. } => "db:row:delete",
            Event::CellUpdate { .. } => "db:cell:update",
            Event::CellsBatch { .. } => "db:cells:batch",
            Event::PropertyCreate { .. } => "db:property:create",
            Event::PropertyUpdate { .. } => "db:property:update",
            Event::PropertyDelete { .. } => "db:property:delete",
            Event::CommentCreate { .. } => "comment:create",
            Event::CommentUpdate { .. } => "comment:update",
            Event::CommentResolve { .. } => "comment:resolve",
            Event::CommentDelete { .. } => "comment:delete",
            Event::NotificationCreate { .. } => "notification:create",
            Event::NotificationRead { .. } => "notification:read",
            Event::NotificationReadAll => "notification:read-all",
            Event::NotificationDelete { .. } => "notification:delete",
            Event::PresenceJoin { .. } => "presence:join",
            Event::PresenceLeave { .. } => "presence:leave",
        }
    }
}

/// A room-addressed event with its originating session.
///
/// `origin` drives echo suppression: the server never needs it decoded (it
/// rides next to the payload), and receivers drop envelopes whose origin is
/// their own session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub room: RoomId,
    pub origin: Uuid,
    pub user_id: Option<String>,
    pub event: Event,
}

impl Envelope {
    pub fn new(room: RoomId, origin: Uuid, user_id: Option<String>, event: Event) -> Self {
        Self {
            room,
            origin,
            user_id,
            event,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Top-level frames exchanged with the sync server.
///
/// `hello` must be the first message on a connection; `join-room` and
/// `leave-room` are client-to-server only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum WireMessage {
    #[serde(rename = "hello")]
    Hello {
        session_id: Uuid,
        user_id: Option<String>,
    },
    #[serde(rename = "join-room")]
    JoinRoom {
        room: RoomId,
        user_id: Option<String>,
    },
    #[serde(rename = "leave-room")]
    LeaveRoom {
        room: RoomId,
        user_id: Option<String>,
    },
    #[serde(rename = "event")]
    Event(Envelope),
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
}

impl WireMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    UnknownRoom(String),
    ConnectionClosed,
    Timeout,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::UnknownRoom(room) => write!(f, "Unknown room address: {room}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_roundtrip() {
        for room in [
            RoomId::document("doc-1"),
            RoomId::database("db-1"),
            RoomId::user("user-1"),
        ] {
            let text = room.to_string();
            let parsed = RoomId::try_from(text).unwrap();
            assert_eq!(parsed, room);
        }
    }

    #[test]
    fn test_room_id_display_scheme() {
        assert_eq!(RoomId::document("d1").to_string(), "document:d1");
        assert_eq!(RoomId::database("db1").to_string(), "database:db1");
        assert_eq!(RoomId::user("u1").to_string(), "user:u1");
    }

    #[test]
    fn test_room_id_rejects_garbage() {
        assert!(RoomId::try_from("workspace:w1".to_string()).is_err());
        assert!(RoomId::try_from("document".to_string()).is_err());
        assert!(RoomId::try_from("document:".to_string()).is_err());
    }

    #[test]
    fn test_envelope_roundtrip() {
        let origin = Uuid::new_v4();
        let envelope = Envelope::new(
            RoomId::database("db1"),
            origin,
            Some("user-1".to_string()),
            Event::CellUpdate {
                database_id: "db1".to_string(),
                row_id: "r1".to_string(),
                property_id: "propA".to_string(),
                value: serde_json::json!(42),
            },
        );

        let encoded = envelope.encode().unwrap();
        let decoded = Envelope::decode(&encoded).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.origin, origin);
    }

    #[test]
    fn test_event_names_on_the_wire() {
        let event = Event::DocArchive {
            id: "d1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "doc:archive");
        assert_eq!(event.name(), "doc:archive");
    }

    #[test]
    fn test_unknown_event_type_fails_decode() {
        let text = r#"{"room":"document:d1","origin":"00000000-0000-0000-0000-000000000000","user_id":null,"event":{"type":"doc:frobnicate","payload":{"id":"d1"}}}"#;
        assert!(Envelope::decode(text).is_err());
    }

    #[test]
    fn test_malformed_frame_fails_decode() {
        assert!(WireMessage::decode("{not json").is_err());
        assert!(Envelope::decode("[]").is_err());
    }

    #[test]
    fn test_wire_message_join_leave_roundtrip() {
        let join = WireMessage::JoinRoom {
            room: RoomId::document("d1"),
            user_id: Some("u1".to_string()),
        };
        let leave = WireMessage::LeaveRoom {
            room: RoomId::document("d1"),
            user_id: Some("u1".to_string()),
        };

        for msg in [join, leave, WireMessage::Ping, WireMessage::Pong] {
            let encoded = msg.encode().unwrap();
            assert_eq!(WireMessage::decode(&encoded).unwrap(), msg);
        }
    }

    #[test]
    fn test_wire_message_event_passthrough() {
        let envelope = Envelope::new(
            RoomId::user("u1"),
            Uuid::new_v4(),
            None,
            Event::NotificationReadAll,
        );
        let msg = WireMessage::Event(envelope.clone());
        let encoded = msg.encode().unwrap();
        match WireMessage::decode(&encoded).unwrap() {
            WireMessage::Event(decoded) => assert_eq!(decoded, envelope),
            other => panic!("Expected event frame, got {other:?}"),
        }
    }

    #[test]
    fn test_hello_first_frame() {
        let session = Uuid::new_v4();
        let hello = WireMessage::Hello {
            session_id: session,
            user_id: Some("u1".to_string()),
        };
        let encoded = hello.encode().unwrap();
        match WireMessage::decode(&encoded).unwrap() {
            WireMessage::Hello { session_id, .. } => assert_eq!(session_id, session),
            other => panic!("Expected hello frame, got {other:?}"),
        }
    }
}
