//! Signaling message types

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages from participant to rendezvous service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    CreateRoom { room_id: String },
    JoinRoom { room_id: String },
    ReconnectToRoom { room_id: String },
    /// Opaque setup payload forwarded to the other member of the room
    Relay { room_id: String, payload: Value },
}

/// Messages from rendezvous service to participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    RoomCreated { room_id: String },
    RoomJoined { room_id: String },
    RoomFull { room_id: String },
    RoomNotFound { room_id: String },
    ReconnectedToRoom { room_id: String },
    ReconnectionFailed { room_id: String },
    OtherUserJoined { peer_id: String },
    UserReconnected { peer_id: String },
    UserDisconnected { peer_id: String },
    Relay {
        room_id: String,
        from: String,
        payload: Value,
    },
    Error { message: String },
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        // Serializing these variants cannot fail: all fields are strings or JSON values
        serde_json::to_string(self).unwrap_or_else(|_| "{\"type\":\"error\"}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_wire_shape() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"joinRoom","roomId":"4821"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::JoinRoom {
                room_id: "4821".to_string()
            }
        );

        let relay = ClientMessage::Relay {
            room_id: "4821".to_string(),
            payload: json!({"kind": "offer", "addr": "10.0.0.1:4000"}),
        };
        let value = serde_json::to_value(&relay).unwrap();
        assert_eq!(value["type"], "relay");
        assert_eq!(value["roomId"], "4821");
        assert_eq!(value["payload"]["kind"], "offer");
    }

    #[test]
    fn test_server_message_wire_shape() {
        let value = serde_json::to_value(ServerMessage::OtherUserJoined {
            peer_id: "abc".to_string(),
        })
        .unwrap();
        assert_eq!(value, json!({"type": "otherUserJoined", "peerId": "abc"}));

        let value = serde_json::to_value(ServerMessage::ReconnectionFailed {
            room_id: "1".to_string(),
        })
        .unwrap();
        assert_eq!(value, json!({"type": "reconnectionFailed", "roomId": "1"}));
    }

    #[test]
    fn test_unknown_message_type_is_rejected() {
        let parsed = serde_json::from_str::<ClientMessage>(r#"{"type":"offer","roomId":"1"}"#);
        assert!(parsed.is_err());
    }
}
