use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::MessageResponse;

/// Frames sent FROM client TO server over WebSocket.
///
/// Wire shape is flat: `{"type": "typing.start", "conversation_id": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "ping")]
    Ping,

    /// Subscribe this connection to a conversation's fan-out group.
    #[serde(rename = "join_conversation")]
    JoinConversation { conversation_id: Uuid },

    #[serde(rename = "leave_conversation")]
    LeaveConversation { conversation_id: Uuid },

    #[serde(rename = "typing.start")]
    TypingStart { conversation_id: Uuid },

    #[serde(rename = "typing.stop")]
    TypingStop { conversation_id: Uuid },

    /// Mark everything up to `message_id` as read.
    #[serde(rename = "message.read")]
    MessageRead {
        conversation_id: Uuid,
        message_id: Uuid,
    },

    #[serde(rename = "p2p.offer")]
    P2pOffer {
        target_user_id: Uuid,
        session_id: Uuid,
        payload: serde_json::Value,
    },

    #[serde(rename = "p2p.answer")]
    P2pAnswer {
        target_user_id: Uuid,
        session_id: Uuid,
        payload: serde_json::Value,
    },

    #[serde(rename = "p2p.ice")]
    P2pIce {
        target_user_id: Uuid,
        session_id: Uuid,
        payload: serde_json::Value,
    },

    /// Hub-relay fallback for P2P message content. The payload is an
    /// opaque encrypted blob; the hub forwards it without interpretation.
    #[serde(rename = "p2p.message")]
    P2pMessage {
        target_user_id: Uuid,
        message: serde_json::Value,
    },
}

/// Events sent FROM server TO clients over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// First frame on every connection.
    #[serde(rename = "connection_established")]
    ConnectionEstablished { user_id: Uuid, username: String },

    #[serde(rename = "pong")]
    Pong,

    #[serde(rename = "error")]
    Error { message: String },

    #[serde(rename = "message.new")]
    MessageNew { message: MessageResponse },

    #[serde(rename = "message.edited")]
    MessageEdited { message: MessageResponse },

    #[serde(rename = "message.deleted")]
    MessageDeleted {
        conversation_id: Uuid,
        message_id: Uuid,
        for_everyone: bool,
    },

    /// A participant's read cursor moved.
    #[serde(rename = "message.read")]
    MessageRead {
        conversation_id: Uuid,
        user_id: Uuid,
        up_to_message_id: Uuid,
        read_at: DateTime<Utc>,
    },

    #[serde(rename = "participant.joined")]
    ParticipantJoined {
        conversation_id: Uuid,
        user_id: Uuid,
        username: String,
    },

    #[serde(rename = "participant.left")]
    ParticipantLeft {
        conversation_id: Uuid,
        user_id: Uuid,
        /// Set when the removal triggered a group rekey.
        group_key_version: Option<i64>,
    },

    #[serde(rename = "typing.start")]
    TypingStart {
        conversation_id: Uuid,
        user_id: Uuid,
        username: String,
    },

    #[serde(rename = "typing.stop")]
    TypingStop {
        conversation_id: Uuid,
        user_id: Uuid,
    },

    #[serde(rename = "reaction.add")]
    ReactionAdd {
        conversation_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        username: String,
        emoji: String,
    },

    #[serde(rename = "reaction.remove")]
    ReactionRemove {
        conversation_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        emoji: String,
    },

    #[serde(rename = "presence.update")]
    PresenceUpdate {
        user_id: Uuid,
        username: String,
        online: bool,
    },

    #[serde(rename = "p2p.offer")]
    P2pOffer {
        from_user_id: Uuid,
        session_id: Uuid,
        payload: serde_json::Value,
    },

    #[serde(rename = "p2p.answer")]
    P2pAnswer {
        from_user_id: Uuid,
        session_id: Uuid,
        payload: serde_json::Value,
    },

    #[serde(rename = "p2p.ice")]
    P2pIce {
        from_user_id: Uuid,
        session_id: Uuid,
        payload: serde_json::Value,
    },

    #[serde(rename = "p2p.message")]
    P2pMessage {
        from_user_id: Uuid,
        message: serde_json::Value,
    },
}

impl ServerEvent {
    pub fn unknown_type(kind: &str) -> Self {
        Self::Error {
            message: format!("Unknown message type: {}", kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_wire_shape_is_flat() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"typing.start","conversation_id":"6a7e79a4-cc41-4a23-9eb8-cdf6ba57a87e"}"#,
        )
        .unwrap();
        assert!(matches!(frame, ClientFrame::TypingStart { .. }));
    }

    #[test]
    fn unknown_inbound_type_fails_to_parse() {
        let result = serde_json::from_str::<ClientFrame>(r#"{"type":"selfdestruct"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn error_event_names_the_unknown_type() {
        let event = ServerEvent::unknown_type("selfdestruct");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("Unknown message type: selfdestruct"));
    }

    #[test]
    fn p2p_payload_roundtrips_untouched() {
        let raw = r#"{"type":"p2p.ice","target_user_id":"6a7e79a4-cc41-4a23-9eb8-cdf6ba57a87e","session_id":"0b9e7f3c-8f5b-4f7e-9f2a-1c2d3e4f5a6b","payload":{"candidate":"candidate:1 1 UDP 2122252543 192.0.2.1 54400 typ host"}}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        let ClientFrame::P2pIce { payload, .. } = &frame else {
            panic!("expected p2p.ice");
        };
        assert_eq!(
            payload["candidate"],
            "candidate:1 1 UDP 2122252543 192.0.2.1 54400 typ host"
        );
    }
}
