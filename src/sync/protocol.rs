//! JSON WebSocket protocol for presence, document and whiteboard events.
//!
//! Every frame is a text message `{"event": "<name>", "data": <payload>}`.
//! CRDT and awareness blobs are opaque to the server and travel as base64
//! strings so that they can be relayed byte-for-byte.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{ResourceId, UserId};

/// Maximum accepted frame size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

/// Events sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Join a resource room
    #[serde(rename = "subscribe")]
    Subscribe { resource_id: ResourceId },

    /// Leave a single resource room
    #[serde(rename = "unsubscribe")]
    Unsubscribe { resource_id: ResourceId },

    /// Request the current online set
    #[serde(rename = "presence:get")]
    PresenceGet(ResourceId),

    #[serde(rename = "board:load")]
    BoardLoad { board_id: ResourceId },

    #[serde(rename = "drawing")]
    Drawing {
        board_id: ResourceId,
        object: BoardObject,
    },

    #[serde(rename = "object:modified")]
    ObjectModified {
        board_id: ResourceId,
        object: BoardObject,
    },

    #[serde(rename = "objects:removed")]
    ObjectsRemoved {
        board_id: ResourceId,
        object_ids: Vec<String>,
    },

    #[serde(rename = "canvas:cleared")]
    CanvasCleared { board_id: ResourceId },

    #[serde(rename = "doc:load")]
    DocLoad { document_id: ResourceId },

    /// Incremental CRDT update (opaque)
    #[serde(rename = "doc:update")]
    DocUpdate {
        document_id: ResourceId,
        #[serde(with = "base64_bytes")]
        update: Vec<u8>,
    },

    /// Ephemeral cursor/presence blob (opaque)
    #[serde(rename = "doc:awareness")]
    DocAwareness {
        document_id: ResourceId,
        #[serde(with = "base64_bytes")]
        awareness_update: Vec<u8>,
    },
}

impl ClientEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Subscribe { .. } => "subscribe",
            ClientEvent::Unsubscribe { .. } => "unsubscribe",
            ClientEvent::PresenceGet(_) => "presence:get",
            ClientEvent::BoardLoad { .. } => "board:load",
            ClientEvent::Drawing { .. } => "drawing",
            ClientEvent::ObjectModified { .. } => "object:modified",
            ClientEvent::ObjectsRemoved { .. } => "objects:removed",
            ClientEvent::CanvasCleared { .. } => "canvas:cleared",
            ClientEvent::DocLoad { .. } => "doc:load",
            ClientEvent::DocUpdate { .. } => "doc:update",
            ClientEvent::DocAwareness { .. } => "doc:awareness",
        }
    }

    /// Resource the event targets
    pub fn resource_id(&self) -> &str {
        match self {
            ClientEvent::Subscribe { resource_id }
            | ClientEvent::Unsubscribe { resource_id }
            | ClientEvent::PresenceGet(resource_id) => resource_id,
            ClientEvent::BoardLoad { board_id }
            | ClientEvent::Drawing { board_id, .. }
            | ClientEvent::ObjectModified { board_id, .. }
            | ClientEvent::ObjectsRemoved { board_id, .. }
            | ClientEvent::CanvasCleared { board_id } => board_id,
            ClientEvent::DocLoad { document_id }
            | ClientEvent::DocUpdate { document_id, .. }
            | ClientEvent::DocAwareness { document_id, .. } => document_id,
        }
    }
}

/// Events sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    #[serde(rename = "subscribed")]
    Subscribed { resource_id: ResourceId },

    #[serde(rename = "unsubscribed")]
    Unsubscribed { resource_id: ResourceId },

    #[serde(rename = "presence:state")]
    PresenceState {
        resource_id: ResourceId,
        user_ids: Vec<UserId>,
    },

    #[serde(rename = "user:joined")]
    UserJoined {
        resource_id: ResourceId,
        user: UserInfo,
    },

    #[serde(rename = "user:left")]
    UserLeft {
        resource_id: ResourceId,
        user_id: UserId,
    },

    #[serde(rename = "board:state")]
    BoardState {
        board_id: ResourceId,
        content: Value,
    },

    #[serde(rename = "drawing")]
    Drawing {
        board_id: ResourceId,
        object: BoardObject,
    },

    #[serde(rename = "object:modified")]
    ObjectModified {
        board_id: ResourceId,
        object: BoardObject,
    },

    #[serde(rename = "objects:removed")]
    ObjectsRemoved {
        board_id: ResourceId,
        object_ids: Vec<String>,
    },

    #[serde(rename = "canvas:cleared")]
    CanvasCleared { board_id: ResourceId },

    /// Full CRDT snapshot for a newly loaded client
    #[serde(rename = "doc:state")]
    DocState {
        document_id: ResourceId,
        #[serde(with = "base64_bytes")]
        state: Vec<u8>,
    },

    #[serde(rename = "doc:update")]
    DocUpdate {
        document_id: ResourceId,
        #[serde(with = "base64_bytes")]
        update: Vec<u8>,
    },

    #[serde(rename = "doc:awareness")]
    DocAwareness {
        document_id: ResourceId,
        #[serde(with = "base64_bytes")]
        awareness_update: Vec<u8>,
    },

    /// Error response, only ever sent to the offending client
    #[serde(rename = "error")]
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resource_id: Option<ResourceId>,
    },
}

/// Public profile of a user joining a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: UserId,
    pub username: String,
    pub color: String,
}

/// A whiteboard shape record.
///
/// The server never interprets shape fields; only `id` is used to correlate
/// modifications and removals across clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoardObject(pub Map<String, Value>);

impl BoardObject {
    /// Client-assigned identity, if present and non-empty
    pub fn id(&self) -> Option<&str> {
        self.0
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }
}

/// Error codes for server responses, written by variant name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidMessage,
    Unauthorized,
    ResourceNotFound,
    MalformedUpdate,
    ServerError,
    NotSubscribed,
    NotLoaded,
    RoomLimit,
}

/// Protocol codec for encoding/decoding events
pub struct EventCodec;

impl EventCodec {
    /// Encode a server event to a text frame
    pub fn encode_server(event: &ServerEvent) -> Result<String, ProtocolError> {
        let text = serde_json::to_string(event)?;
        check_size(text.len())?;
        Ok(text)
    }

    /// Decode a client event from a text frame
    pub fn decode_client(text: &str) -> Result<ClientEvent, ProtocolError> {
        check_size(text.len())?;
        if text.trim().is_empty() {
            return Err(ProtocolError::InvalidFormat("Empty frame".to_string()));
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Create an error response event
    pub fn error_response(
        code: ErrorCode,
        message: impl Into<String>,
        resource_id: Option<ResourceId>,
    ) -> ServerEvent {
        ServerEvent::Error {
            code,
            message: message.into(),
            resource_id,
        }
    }
}

fn check_size(len: usize) -> Result<(), ProtocolError> {
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(len, MAX_MESSAGE_SIZE));
    }
    Ok(())
}

/// Serde adapter that carries raw bytes as a standard base64 string
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_subscribe() {
        let event = EventCodec::decode_client(r#"{"event":"subscribe","data":{"resourceId":"doc-1"}}"#)
            .unwrap();
        match event {
            ClientEvent::Subscribe { resource_id } => assert_eq!(resource_id, "doc-1"),
            other => panic!("Wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_decode_presence_get_bare_string() {
        let event = EventCodec::decode_client(r#"{"event":"presence:get","data":"board-7"}"#).unwrap();
        assert_eq!(event.name(), "presence:get");
        assert_eq!(event.resource_id(), "board-7");
    }

    #[test]
    fn test_doc_update_bytes_are_base64() {
        let event = ServerEvent::DocUpdate {
            document_id: "doc-1".to_string(),
            update: vec![0, 1, 2, 250, 255],
        };
        let text = EventCodec::encode_server(&event).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["event"], "doc:update");
        assert_eq!(value["data"]["documentId"], "doc-1");
        assert_eq!(value["data"]["update"], "AAEC+v8=");
        assert_eq!(serde_json::from_str::<ServerEvent>(&text).unwrap(), event);
    }

    #[test]
    fn test_awareness_field_name() {
        let text = r#"{"event":"doc:awareness","data":{"documentId":"d","awarenessUpdate":"AQI="}}"#;
        match EventCodec::decode_client(text).unwrap() {
            ClientEvent::DocAwareness { awareness_update, .. } => {
                assert_eq!(awareness_update, vec![1, 2]);
            }
            other => panic!("Wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_board_object_id() {
        let object: BoardObject =
            serde_json::from_value(json!({"id": "s1", "type": "rect", "left": 10})).unwrap();
        assert_eq!(object.id(), Some("s1"));

        let anonymous: BoardObject = serde_json::from_value(json!({"type": "circle"})).unwrap();
        assert_eq!(anonymous.id(), None);

        let empty: BoardObject = serde_json::from_value(json!({"id": ""})).unwrap();
        assert_eq!(empty.id(), None);
    }

    #[test]
    fn test_objects_removed_wire_shape() {
        let event = ServerEvent::ObjectsRemoved {
            board_id: "b1".to_string(),
            object_ids: vec!["a".to_string()],
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"event": "objects:removed", "data": {"boardId": "b1", "objectIds": ["a"]}})
        );
    }

    #[test]
    fn test_error_omits_missing_resource() {
        let event = EventCodec::error_response(ErrorCode::Unauthorized, "Invalid token", None);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["data"]["code"], "Unauthorized");
        assert!(value["data"].get("resourceId").is_none());

        let event = EventCodec::error_response(
            ErrorCode::NotSubscribed,
            "Not subscribed to doc-1",
            Some("doc-1".to_string()),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["data"]["code"], "NotSubscribed");
        assert_eq!(value["data"]["resourceId"], "doc-1");
    }

    #[test]
    fn test_invalid_frames() {
        assert!(matches!(
            EventCodec::decode_client("   "),
            Err(ProtocolError::InvalidFormat(_))
        ));
        assert!(matches!(
            EventCodec::decode_client(r#"{"event":"teleport","data":{}}"#),
            Err(ProtocolError::Serialization(_))
        ));
        assert!(EventCodec::decode_client(
            r#"{"event":"doc:update","data":{"documentId":"d","update":"%%%"}}"#
        )
        .is_err());
    }
}
