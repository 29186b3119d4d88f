//! Wire vocabulary of the signaling socket.
//!
//! Every frame is a JSON text frame `{"event": "<name>", "data": {...}}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{ErrorCode, SignalError, SignalResult},
    presence::{ConnectionId, Member, Role, RoomId},
};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub room: RoomId,
    #[serde(default)]
    pub role: Role,
    pub device_name: String,
    #[serde(default)]
    pub device_mode: Option<String>,
    #[serde(default)]
    pub push_token: Option<String>,
    #[serde(default)]
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub room: RoomId,
    #[serde(default)]
    pub target_id: Option<ConnectionId>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallReply {
    pub target_id: ConnectionId,
}

/// An SDP offer/answer or ICE candidate. `payload` is never looked at.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    #[serde(default)]
    pub target_id: Option<ConnectionId>,
    #[serde(default)]
    pub room: Option<RoomId>,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ping {
    #[serde(default)]
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    Join(JoinRequest),
    Leave(Empty),
    CallRequest(CallRequest),
    CallAccept(CallReply),
    CallBusy(CallReply),
    EndCall(CallReply),
    Offer(SignalEnvelope),
    Answer(SignalEnvelope),
    Candidate(SignalEnvelope),
    Ping(Ping),
}

impl ClientEvent {
    /// Parses one text frame. A missing or null `data` reads as `{}`.
    pub fn parse(text: &str) -> SignalResult<Self> {
        let mut frame: Value = serde_json::from_str(text)
            .map_err(|e| SignalError::Validation(format!("malformed frame: {e}")))?;

        let Some(obj) = frame.as_object_mut() else {
            return Err(SignalError::Validation("frame must be a JSON object".into()));
        };
        if obj.get("data").is_none_or(Value::is_null) {
            obj.insert("data".into(), Value::Object(Default::default()));
        }

        serde_json::from_value(frame).map_err(|e| SignalError::Validation(e.to_string()))
    }
}

/// A relayed offer, answer or candidate, stamped with who sent it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Relayed {
    pub sender_id: ConnectionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<ConnectionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomId>,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    Welcome { id: ConnectionId },
    MemberJoined(Member),
    MemberLeft { id: ConnectionId },
    ElderList(Vec<Member>),
    #[serde(rename_all = "camelCase")]
    CallRequest { sender_id: ConnectionId, room: RoomId },
    #[serde(rename_all = "camelCase")]
    CallAccept { sender_id: ConnectionId },
    #[serde(rename_all = "camelCase")]
    CallBusy { sender_id: ConnectionId },
    #[serde(rename_all = "camelCase")]
    EndCall { sender_id: ConnectionId },
    Offer(Relayed),
    Answer(Relayed),
    Candidate(Relayed),
    Pong,
    Error { code: ErrorCode, message: String },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        use ServerEvent::*;
        match self {
            Welcome { .. } => "welcome",
            MemberJoined(_) => "member-joined",
            MemberLeft { .. } => "member-left",
            ElderList(_) => "elder-list",
            CallRequest { .. } => "call-request",
            CallAccept { .. } => "call-accept",
            CallBusy { .. } => "call-busy",
            EndCall { .. } => "end-call",
            Offer(_) => "offer",
            Answer(_) => "answer",
            Candidate(_) => "candidate",
            Pong => "pong",
            Error { .. } => "error",
        }
    }
}

impl From<&SignalError> for ServerEvent {
    fn from(err: &SignalError) -> Self {
        let message = match err {
            SignalError::Store(_) => "internal error".to_owned(),
            other => other.to_string(),
        };
        ServerEvent::Error { code: err.code(), message }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_join() {
        let frame = r#"{"event":"join","data":{"room":"r1","role":"elder","deviceName":"阿公","pushToken":"tok"}}"#;
        let ClientEvent::Join(join) = ClientEvent::parse(frame).unwrap() else {
            panic!("not a join");
        };
        assert_eq!(join.room, "r1");
        assert_eq!(join.role, Role::Elder);
        assert_eq!(join.device_name, "阿公");
        assert_eq!(join.push_token.as_deref(), Some("tok"));
        assert_eq!(join.device_mode, None);
    }

    #[test]
    fn unknown_role_is_tolerated() {
        let frame = r#"{"event":"join","data":{"room":"r1","role":"caretaker","deviceName":"x"}}"#;
        let ClientEvent::Join(join) = ClientEvent::parse(frame).unwrap() else {
            panic!("not a join");
        };
        assert_eq!(join.role, Role::Unknown);
    }

    #[test]
    fn data_may_be_omitted_for_empty_events() {
        assert_eq!(ClientEvent::parse(r#"{"event":"leave"}"#).unwrap(), ClientEvent::Leave(Empty {}));
        assert_eq!(
            ClientEvent::parse(r#"{"event":"ping","data":null}"#).unwrap(),
            ClientEvent::Ping(Ping::default())
        );
    }

    #[test]
    fn rejects_unknown_and_incomplete_frames() {
        for frame in [
            "not json",
            "[1,2]",
            r#"{"event":"teleport","data":{}}"#,
            r#"{"event":"join","data":{"role":"elder"}}"#,
            r#"{"event":"call-accept","data":{}}"#,
        ] {
            assert!(
                matches!(ClientEvent::parse(frame), Err(SignalError::Validation(_))),
                "{frame} should be rejected"
            );
        }
    }

    #[test]
    fn relayed_offer_wire_shape() {
        let sender = ConnectionId::new();
        let event = ServerEvent::Offer(Relayed {
            sender_id: sender,
            target_id: None,
            room: Some("r1".into()),
            payload: json!({"sdp": "v=0"}),
        });
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "event": "offer",
                "data": {"senderId": sender, "room": "r1", "payload": {"sdp": "v=0"}}
            })
        );
    }

    #[test]
    fn member_snapshot_hides_push_token() {
        let member = Member::new(ConnectionId::new(), Role::Elder, "tablet").with_push_token("secret");
        let value = serde_json::to_value(ServerEvent::MemberJoined(member)).unwrap();
        assert_eq!(value["data"]["deviceName"], "tablet");
        assert_eq!(value["data"]["role"], "elder");
        assert!(value["data"].get("pushToken").is_none());
    }

    #[test]
    fn call_events_use_camel_case() {
        let sender = ConnectionId::new();
        let value = serde_json::to_value(ServerEvent::CallRequest { sender_id: sender, room: "r".into() }).unwrap();
        assert_eq!(value, json!({"event": "call-request", "data": {"senderId": sender, "room": "r"}}));
        assert_eq!(serde_json::to_value(ServerEvent::Pong).unwrap(), json!({"event": "pong"}));
    }
}
