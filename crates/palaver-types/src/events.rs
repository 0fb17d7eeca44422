use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Frames sent FROM client TO server over the room WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Post a message to the room, optionally as a threaded reply.
    ChatMessage {
        content: String,
        #[serde(default)]
        parent_id: Option<Uuid>,
    },

    /// Typing indicator. Ephemeral, never stored.
    Typing { is_typing: bool },
}

/// Events pushed by the server to every connection in a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomEvent {
    /// A message was persisted and is being fanned out.
    ChatMessage {
        message_id: Uuid,
        sender_id: Uuid,
        sender_username: String,
        content: String,
        timestamp: DateTime<Utc>,
        parent_id: Option<Uuid>,
    },

    /// An authenticated user connected to the room.
    UserJoin {
        user_id: Uuid,
        username: String,
        timestamp: DateTime<Utc>,
    },

    /// An authenticated user disconnected from the room.
    UserLeave {
        user_id: Uuid,
        username: String,
        timestamp: DateTime<Utc>,
    },

    /// Someone started or stopped typing.
    Typing {
        user_id: Uuid,
        username: String,
        is_typing: bool,
    },

    /// Failure acknowledgment, delivered only to the originating session.
    Error { code: String, message: String },
}

/// Decode failure for an inbound frame. Fatal to the originating connection.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not an object with a string `type` field")]
    MissingType,

    #[error("malformed `{frame_type}` frame: {source}")]
    BadPayload {
        frame_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Outcome of decoding one inbound text frame.
///
/// Unrecognized `type` values decode to `Ignored` so that newer clients can
/// send frames older servers don't know about. A payload that fails to decode
/// for a *known* type is an error.
#[derive(Debug, PartialEq)]
pub enum FrameDecode {
    Frame(ClientFrame),
    Ignored,
}

impl ClientFrame {
    pub fn decode(text: &str) -> Result<FrameDecode, DecodeError> {
        let value: serde_json::Value = serde_json::from_str(text)?;

        let frame_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(DecodeError::MissingType)?;

        match frame_type {
            "chat_message" | "typing" => {
                let frame_type = frame_type.to_string();
                let frame = serde_json::from_value::<ClientFrame>(value)
                    .map_err(|source| DecodeError::BadPayload { frame_type, source })?;
                Ok(FrameDecode::Frame(frame))
            }
            _ => Ok(FrameDecode::Ignored),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_chat_message() {
        let decoded = ClientFrame::decode(r#"{"type":"chat_message","content":"hi"}"#).unwrap();
        assert_eq!(
            decoded,
            FrameDecode::Frame(ClientFrame::ChatMessage {
                content: "hi".into(),
                parent_id: None,
            })
        );
    }

    #[test]
    fn decode_chat_message_with_parent() {
        let parent = Uuid::new_v4();
        let text = format!(r#"{{"type":"chat_message","content":"re","parent_id":"{parent}"}}"#);
        match ClientFrame::decode(&text).unwrap() {
            FrameDecode::Frame(ClientFrame::ChatMessage { parent_id, .. }) => {
                assert_eq!(parent_id, Some(parent));
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn decode_typing() {
        let decoded = ClientFrame::decode(r#"{"type":"typing","is_typing":true}"#).unwrap();
        assert_eq!(
            decoded,
            FrameDecode::Frame(ClientFrame::Typing { is_typing: true })
        );
    }

    #[test]
    fn unknown_type_is_ignored() {
        let decoded = ClientFrame::decode(r#"{"type":"ping","nonce":42}"#).unwrap();
        assert_eq!(decoded, FrameDecode::Ignored);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(
            ClientFrame::decode("{not json"),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn missing_type_is_an_error() {
        assert!(matches!(
            ClientFrame::decode(r#"{"content":"hi"}"#),
            Err(DecodeError::MissingType)
        ));
    }

    #[test]
    fn known_type_with_bad_payload_is_an_error() {
        assert!(matches!(
            ClientFrame::decode(r#"{"type":"typing","is_typing":"yes"}"#),
            Err(DecodeError::BadPayload { .. })
        ));
    }

    #[test]
    fn room_event_wire_shape() {
        let event = RoomEvent::Typing {
            user_id: Uuid::nil(),
            username: "alice".into(),
            is_typing: false,
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(json["type"], "typing");
        assert_eq!(json["username"], "alice");
        assert_eq!(json["is_typing"], false);
    }
}
