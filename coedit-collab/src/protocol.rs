//! Boundary messages between editor sessions and the room engine.
//!
//! Both directions are serde enums, externally tagged with camelCase names:
//!
//! ```text
//! {"joinRoom":{"roomId":"r1","username":"ada"}}
//! {"editInsert":{"roomId":"r1","afterPosition":null,"grapheme":"h"}}
//! {"docDelta":{"roomId":"r1","version":3,"kind":"insert","position":[…],"grapheme":"h"}}
//! ```
//!
//! Text frames carry JSON, binary frames carry the same enums bincode-encoded
//! (standard config).
//!
//! Ordering: a room's document messages (`snapshot`, `docDelta`, `insertAck`)
//! reach each session in commit order, so versions only grow. A session that
//! fell behind gets a fresh `snapshot` instead of the deltas it missed.
//! Clients replace their replica on every `snapshot` and apply deltas
//! idempotently.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use coedit_core::{CharEntry, Delta, Position};

use crate::presence::{SelectionRange, Vec2};

/// Longest grapheme (in bytes) accepted from a client.
pub const MAX_GRAPHEME_BYTES: usize = 16;

/// Wire encoding of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    #[default]
    Json,
    Bincode,
}

/// Client → core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    JoinRoom {
        room_id: String,
        username: String,
    },
    /// Insert after `after_position`, or at the end of the document.
    EditInsert {
        room_id: String,
        after_position: Option<Position>,
        grapheme: String,
    },
    /// Insert before the first character.
    EditInsertFront {
        room_id: String,
        grapheme: String,
    },
    EditDelete {
        room_id: String,
        position: Position,
    },
    /// A delta whose position the client allocated itself.
    RemoteDelta {
        room_id: String,
        delta: Delta,
    },
    LeaveRoom {
        room_id: String,
        username: String,
    },
    CursorMove {
        room_id: String,
        username: String,
        position: Vec2,
    },
    Highlight {
        room_id: String,
        username: String,
        selected_text: String,
        selection_range: SelectionRange,
    },
    HighlightOff {
        room_id: String,
        username: String,
    },
    TypingStart {
        room_id: String,
        username: String,
    },
    TypingStop {
        room_id: String,
        username: String,
    },
    Ping,
}

/// Kind of document change carried by [`ServerMessage::DocDelta`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeltaKind {
    Insert,
    Delete,
}

/// Core → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Sent once, to the joining session only.
    Snapshot {
        room_id: String,
        version: u64,
        document: String,
        entries: Vec<CharEntry>,
        members: Vec<String>,
    },
    DocDelta {
        room_id: String,
        version: u64,
        kind: DeltaKind,
        position: Position,
        grapheme: Option<String>,
    },
    /// The position allocated for the sender's own `editInsert`.
    InsertAck {
        room_id: String,
        version: u64,
        position: Position,
        grapheme: String,
    },
    /// The sender's `editInsert` anchor was deleted first; nothing was inserted.
    InsertRejected {
        room_id: String,
        after_position: Position,
        grapheme: String,
    },
    MemberList {
        room_id: String,
        users: Vec<String>,
    },
    CursorUpdate {
        room_id: String,
        username: String,
        position: Vec2,
    },
    HighlightUpdate {
        room_id: String,
        username: String,
        selected_text: String,
        selection_range: SelectionRange,
    },
    HighlightRemoved {
        room_id: String,
        username: String,
    },
    TypingUpdate {
        room_id: String,
        username: String,
        is_typing: bool,
    },
    /// The room's state was discarded; clients must rejoin.
    RoomFault {
        room_id: String,
        reason: String,
    },
    Error {
        message: String,
    },
    Pong,
}

impl ServerMessage {
    /// The delta notification for an applied change.
    pub fn doc_delta(room_id: &str, version: u64, delta: Delta) -> Self {
        match delta {
            Delta::Insert { position, grapheme } => ServerMessage::DocDelta {
                room_id: room_id.to_string(),
                version,
                kind: DeltaKind::Insert,
                position,
                grapheme: Some(grapheme),
            },
            Delta::Delete { position } => ServerMessage::DocDelta {
                room_id: room_id.to_string(),
                version,
                kind: DeltaKind::Delete,
                position,
                grapheme: None,
            },
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error { message: message.into() }
    }

    /// Room of a message that carries document state.
    pub fn document_room(&self) -> Option<&str> {
        match self {
            ServerMessage::Snapshot { room_id, .. }
            | ServerMessage::DocDelta { room_id, .. }
            | ServerMessage::InsertAck { room_id, .. } => Some(room_id),
            _ => None,
        }
    }

    /// Serialize in the given wire format.
    pub fn encode(&self, format: WireFormat) -> Result<Vec<u8>, ProtocolError> {
        encode(self, format)
    }

    pub fn decode(bytes: &[u8], format: WireFormat) -> Result<Self, ProtocolError> {
        decode(bytes, format)
    }

    /// Turn a `docDelta` back into a [`Delta`] for a client replica.
    pub fn as_delta(&self) -> Option<Delta> {
        match self {
            ServerMessage::DocDelta { kind: DeltaKind::Insert, position, grapheme: Some(g), .. } => {
                Some(Delta::Insert { position: position.clone(), grapheme: g.clone() })
            }
            ServerMessage::DocDelta { kind: DeltaKind::Delete, position, .. } => {
                Some(Delta::Delete { position: position.clone() })
            }
            _ => None,
        }
    }
}

impl ClientMessage {
    pub fn encode(&self, format: WireFormat) -> Result<Vec<u8>, ProtocolError> {
        encode(self, format)
    }

    pub fn decode(bytes: &[u8], format: WireFormat) -> Result<Self, ProtocolError> {
        decode(bytes, format)
    }

    /// Room the message targets, if any.
    pub fn room_id(&self) -> Option<&str> {
        match self {
            ClientMessage::JoinRoom { room_id, .. }
            | ClientMessage::EditInsert { room_id, .. }
            | ClientMessage::EditInsertFront { room_id, .. }
            | ClientMessage::EditDelete { room_id, .. }
            | ClientMessage::RemoteDelta { room_id, .. }
            | ClientMessage::LeaveRoom { room_id, .. }
            | ClientMessage::CursorMove { room_id, .. }
            | ClientMessage::Highlight { room_id, .. }
            | ClientMessage::HighlightOff { room_id, .. }
            | ClientMessage::TypingStart { room_id, .. }
            | ClientMessage::TypingStop { room_id, .. } => Some(room_id),
            ClientMessage::Ping => None,
        }
    }

    /// Username the message speaks for, if it carries one.
    pub fn username(&self) -> Option<&str> {
        match self {
            ClientMessage::JoinRoom { username, .. }
            | ClientMessage::LeaveRoom { username, .. }
            | ClientMessage::CursorMove { username, .. }
            | ClientMessage::Highlight { username, .. }
            | ClientMessage::HighlightOff { username, .. }
            | ClientMessage::TypingStart { username, .. }
            | ClientMessage::TypingStop { username, .. } => Some(username),
            _ => None,
        }
    }

    /// Reject malformed operations before they reach the rooms.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if let Some(room_id) = self.room_id() {
            if room_id.trim().is_empty() {
                return Err(ProtocolError::Malformed("missing room id".into()));
            }
        }
        if let Some(username) = self.username() {
            if username.trim().is_empty() {
                return Err(ProtocolError::Malformed("empty username".into()));
            }
        }
        match self {
            ClientMessage::EditInsert { grapheme, .. }
            | ClientMessage::EditInsertFront { grapheme, .. }
            | ClientMessage::RemoteDelta { delta: Delta::Insert { grapheme, .. }, .. } => {
                validate_grapheme(grapheme)
            }
            _ => Ok(()),
        }
    }
}

fn validate_grapheme(grapheme: &str) -> Result<(), ProtocolError> {
    if grapheme.is_empty() {
        return Err(ProtocolError::Malformed("empty grapheme".into()));
    }
    if grapheme.len() > MAX_GRAPHEME_BYTES {
        return Err(ProtocolError::Malformed(format!(
            "grapheme of {} bytes exceeds {MAX_GRAPHEME_BYTES}",
            grapheme.len()
        )));
    }
    Ok(())
}

fn encode<T: Serialize>(value: &T, format: WireFormat) -> Result<Vec<u8>, ProtocolError> {
    match format {
        WireFormat::Json => serde_json::to_vec(value)
            .map_err(|e| ProtocolError::SerializationError(e.to_string())),
        WireFormat::Bincode => bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string())),
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8], format: WireFormat) -> Result<T, ProtocolError> {
    match format {
        WireFormat::Json => serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string())),
        WireFormat::Bincode => {
            let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
            Ok(value)
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// Structurally valid but unacceptable operation.
    Malformed(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::Malformed(e) => write!(f, "Malformed operation: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use coedit_core::{FixedClock, PositionAllocator, SiteId};

    fn position() -> Position {
        let mut alloc = PositionAllocator::with_clock(SiteId::from_u128(7), FixedClock(42));
        alloc.between(None, None).unwrap()
    }

    #[test]
    fn test_join_json_shape() {
        let json = r#"{"joinRoom":{"roomId":"r1","username":"ada"}}"#;
        let msg = ClientMessage::decode(json.as_bytes(), WireFormat::Json).unwrap();
        assert_eq!(
            msg,
            ClientMessage::JoinRoom { room_id: "r1".into(), username: "ada".into() }
        );
    }

    #[test]
    fn test_insert_without_anchor_json() {
        let json = r#"{"editInsert":{"roomId":"r1","afterPosition":null,"grapheme":"h"}}"#;
        let msg = ClientMessage::decode(json.as_bytes(), WireFormat::Json).unwrap();
        match msg {
            ClientMessage::EditInsert { after_position, grapheme, .. } => {
                assert!(after_position.is_none());
                assert_eq!(grapheme, "h");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_ping_json_is_bare_string() {
        let bytes = ClientMessage::Ping.encode(WireFormat::Json).unwrap();
        assert_eq!(bytes, br#""ping""#);
    }

    #[test]
    fn test_server_message_field_names() {
        let msg = ServerMessage::TypingUpdate {
            room_id: "r".into(),
            username: "ada".into(),
            is_typing: true,
        };
        let json = String::from_utf8(msg.encode(WireFormat::Json).unwrap()).unwrap();
        assert_eq!(json, r#"{"typingUpdate":{"roomId":"r","username":"ada","isTyping":true}}"#);
    }

    #[test]
    fn test_doc_delta_through_bincode() {
        let msg = ServerMessage::doc_delta(
            "r",
            4,
            Delta::Insert { position: position(), grapheme: "x".into() },
        );
        let bytes = msg.encode(WireFormat::Bincode).unwrap();
        let back = ServerMessage::decode(&bytes, WireFormat::Bincode).unwrap();
        assert_eq!(back, msg);
        assert_eq!(
            back.as_delta(),
            Some(Delta::Insert { position: position(), grapheme: "x".into() })
        );
    }

    #[test]
    fn test_remote_delta_through_json() {
        let msg = ClientMessage::RemoteDelta {
            room_id: "r".into(),
            delta: Delta::Delete { position: position() },
        };
        let bytes = msg.encode(WireFormat::Json).unwrap();
        assert_eq!(ClientMessage::decode(&bytes, WireFormat::Json).unwrap(), msg);
    }

    #[test]
    fn test_delete_delta_has_no_grapheme() {
        let msg = ServerMessage::doc_delta("r", 1, Delta::Delete { position: position() });
        match &msg {
            ServerMessage::DocDelta { kind, grapheme, .. } => {
                assert_eq!(*kind, DeltaKind::Delete);
                assert!(grapheme.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(msg.as_delta(), Some(Delta::Delete { .. })));
    }

    #[test]
    fn test_full_text_replace_is_not_a_message() {
        let json = r#"{"textChange":{"roomId":"r1","newText":"everything"}}"#;
        assert!(ClientMessage::decode(json.as_bytes(), WireFormat::Json).is_err());
    }

    #[test]
    fn test_validate_rejects_missing_room() {
        let msg = ClientMessage::JoinRoom { room_id: " ".into(), username: "ada".into() };
        assert_eq!(
            msg.validate(),
            Err(ProtocolError::Malformed("missing room id".into()))
        );
    }

    #[test]
    fn test_validate_rejects_empty_username() {
        let msg = ClientMessage::TypingStart { room_id: "r".into(), username: "".into() };
        assert!(msg.validate().is_err());
    }

    #[test]
    fn test_validate_grapheme_bounds() {
        let empty = ClientMessage::EditInsert {
            room_id: "r".into(),
            after_position: None,
            grapheme: String::new(),
        };
        assert!(empty.validate().is_err());

        let long = ClientMessage::EditInsertFront { room_id: "r".into(), grapheme: "x".repeat(17) };
        assert!(long.validate().is_err());

        let ok = ClientMessage::EditInsertFront { room_id: "r".into(), grapheme: "👍".into() };
        assert!(ok.validate().is_ok());
        assert!(ClientMessage::Ping.validate().is_ok());
    }

    #[test]
    fn test_decode_garbage() {
        assert!(ClientMessage::decode(&[0xFF, 0xFE, 0xFD], WireFormat::Bincode).is_err());
        assert!(ClientMessage::decode(b"{not json", WireFormat::Json).is_err());
    }

    #[test]
    fn test_document_messages_name_their_room() {
        let delta = ServerMessage::doc_delta("r", 1, Delta::Delete { position: position() });
        assert_eq!(delta.document_room(), Some("r"));

        let rejected = ServerMessage::InsertRejected {
            room_id: "r".into(),
            after_position: position(),
            grapheme: "b".into(),
        };
        let json = String::from_utf8(rejected.encode(WireFormat::Json).unwrap()).unwrap();
        assert!(json.starts_with(r#"{"insertRejected":{"roomId":"r","afterPosition":"#));
        assert_eq!(rejected.document_room(), None);

        let members = ServerMessage::MemberList { room_id: "r".into(), users: Vec::new() };
        assert_eq!(members.document_room(), None);
    }

    #[test]
    fn test_accessors() {
        let msg = ClientMessage::CursorMove {
            room_id: "r".into(),
            username: "ada".into(),
            position: Vec2::new(1.0, 2.0),
        };
        assert_eq!(msg.room_id(), Some("r"));
        assert_eq!(msg.username(), Some("ada"));
        assert_eq!(ClientMessage::Ping.room_id(), None);
    }
}
