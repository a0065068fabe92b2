//! Wire format of the websocket: JSON text frames `{"event", "data", "ref"?}`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::GetField;
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::presence::PresenceStatus;
use crate::rooms::RoomId;

pub const PRESENCE_HEARTBEAT: &str = "presence:heartbeat";
pub const PRESENCE_STATUS: &str = "presence:status";
pub const PRESENCE_UPDATE: &str = "presence:update";
pub const MESSAGE_SEND: &str = "message:send";
pub const MESSAGE_NEW: &str = "message:new";
pub const MESSAGE_HISTORY: &str = "message:history";
pub const ROOM_JOIN: &str = "room:join";
pub const ROOM_LEAVE: &str = "room:leave";
pub const POLL_CREATE: &str = "poll:create";
pub const POLL_CREATED: &str = "poll:created";
pub const POLL_VOTE: &str = "poll:vote";
pub const POLL_UPDATED: &str = "poll:updated";
pub const POLL_CLOSE: &str = "poll:close";
pub const POLL_CLOSED: &str = "poll:closed";
pub const POLL_DELETE: &str = "poll:delete";
pub const POLL_DELETED: &str = "poll:deleted";
pub const POLL_LIST: &str = "poll:list";
pub const RESYNC: &str = "resync";
pub const ACK: &str = "ack";
pub const ERROR: &str = "error";

/// A decoded inbound frame before its payload is interpreted.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub event: String,
    pub data: Value,
    pub reference: Option<Value>,
}

impl InboundFrame {
    pub fn parse(text: &str) -> CoreResult<Self> {
        let value: Value = serde_json::from_str(text)?;
        let event = value.get_str_field("event")?;
        let data = value
            .get("data")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        Ok(Self {
            event,
            data,
            reference: value.get("ref").cloned(),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub identity_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusPayload {
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub room_id: RoomId,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPayload {
    pub room_id: RoomId,
    pub limit: Option<usize>,
    pub before_seq: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPayload {
    pub room_id: RoomId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePollPayload {
    pub question: String,
    pub description: Option<String>,
    pub options: Vec<String>,
    pub created_by: Option<String>,
    #[serde(default)]
    pub allow_multiple_votes: bool,
    pub room_id: Option<RoomId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VotePayload {
    pub poll_id: Uuid,
    pub user_id: Option<String>,
    pub option_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollIdPayload {
    pub poll_id: Uuid,
}

/// Every event a client may send.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Heartbeat(HeartbeatPayload),
    SetStatus(StatusPayload),
    SendMessage(SendMessagePayload),
    History(HistoryPayload),
    JoinRoom(RoomPayload),
    LeaveRoom(RoomPayload),
    CreatePoll(CreatePollPayload),
    Vote(VotePayload),
    ClosePoll(PollIdPayload),
    DeletePoll(PollIdPayload),
    ListPolls,
}

impl ClientEvent {
    /// `Ok(None)` for event names we do not know; malformed payloads are errors.
    pub fn decode(name: &str, data: Value) -> CoreResult<Option<Self>> {
        let event = match name {
            PRESENCE_HEARTBEAT => Self::Heartbeat(payload(data)?),
            PRESENCE_STATUS => Self::SetStatus(payload(data)?),
            MESSAGE_SEND => Self::SendMessage(payload(data)?),
            MESSAGE_HISTORY => Self::History(payload(data)?),
            ROOM_JOIN => Self::JoinRoom(payload(data)?),
            ROOM_LEAVE => Self::LeaveRoom(payload(data)?),
            POLL_CREATE => Self::CreatePoll(payload(data)?),
            POLL_VOTE => Self::Vote(payload(data)?),
            POLL_CLOSE => Self::ClosePoll(payload(data)?),
            POLL_DELETE => Self::DeletePoll(payload(data)?),
            POLL_LIST => Self::ListPolls,
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

fn payload<T: DeserializeOwned>(data: Value) -> CoreResult<T> {
    // A missing payload reads as an empty object so optional-only payloads work.
    let data = if data.is_null() {
        Value::Object(Default::default())
    } else {
        data
    };
    serde_json::from_value(data).map_err(|e| CoreError::invalid(e.to_string()))
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    event: &'a str,
    data: &'a T,
}

/// Serialize a server frame once so it can be shared by every subscriber.
pub fn encode<T: Serialize>(event: &str, data: &T) -> Arc<str> {
    match serde_json::to_string(&Envelope { event, data }) {
        Ok(text) => Arc::from(text),
        Err(e) => {
            tracing::error!(event, error = %e, "failed to encode frame");
            Arc::from(format!(
                r#"{{"event":"{ERROR}","data":{{"kind":"transport","code":"encode_failed","requestEvent":"{event}"}}}}"#
            ))
        }
    }
}

/// Direct answer to the connection that sent a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ack {
        request_event: String,
        reference: Option<Value>,
        result: Value,
    },
    Error {
        request_event: String,
        reference: Option<Value>,
        error: CoreError,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AckBody<'a> {
    request_event: &'a str,
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    reference: Option<&'a Value>,
    result: &'a Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    request_event: &'a str,
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    reference: Option<&'a Value>,
    kind: ErrorKind,
    code: &'static str,
    message: String,
}

impl Reply {
    pub fn ack(request_event: &str, reference: Option<Value>, result: Value) -> Self {
        Self::Ack {
            request_event: request_event.to_owned(),
            reference,
            result,
        }
    }

    pub fn error(request_event: &str, reference: Option<Value>, error: CoreError) -> Self {
        Self::Error {
            request_event: request_event.to_owned(),
            reference,
            error,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    pub fn encode(&self) -> Arc<str> {
        match self {
            Self::Ack {
                request_event,
                reference,
                result,
            } => encode(
                ACK,
                &AckBody {
                    request_event,
                    reference: reference.as_ref(),
                    result,
                },
            ),
            Self::Error {
                request_event,
                reference,
                error,
            } => encode(
                ERROR,
                &ErrorBody {
                    request_event,
                    reference: reference.as_ref(),
                    kind: error.kind(),
                    code: error.code(),
                    message: error.to_string(),
                },
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_frame_with_ref() {
        let frame = InboundFrame::parse(r#"{"event":"poll:list","ref":7}"#).unwrap();
        assert_eq!(frame.event, "poll:list");
        assert_eq!(frame.reference, Some(json!(7)));
        assert!(frame.data.is_object());
    }

    #[test]
    fn frame_without_event_is_invalid() {
        assert!(matches!(
            InboundFrame::parse(r#"{"data":{}}"#),
            Err(CoreError::Validation(_))
        ));
        assert!(InboundFrame::parse("not json").is_err());
    }

    #[test]
    fn unknown_events_decode_to_none() {
        assert!(ClientEvent::decode("reaction:add", json!({})).unwrap().is_none());
    }

    #[test]
    fn malformed_payload_is_validation_error() {
        let err = ClientEvent::decode(POLL_VOTE, json!({"pollId": "nope"})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn decodes_vote() {
        let poll = Uuid::now_v7();
        let option = Uuid::now_v7();
        let event = ClientEvent::decode(
            POLL_VOTE,
            json!({"pollId": poll, "userId": "A", "optionId": option}),
        )
        .unwrap()
        .unwrap();
        match event {
            ClientEvent::Vote(v) => {
                assert_eq!(v.poll_id, poll);
                assert_eq!(v.user_id.as_deref(), Some("A"));
                assert_eq!(v.option_id, option);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn heartbeat_payload_is_optional() {
        let event = ClientEvent::decode(PRESENCE_HEARTBEAT, Value::Null).unwrap();
        assert!(matches!(event, Some(ClientEvent::Heartbeat(_))));
    }

    #[test]
    fn error_reply_shape() {
        let reply = Reply::error(POLL_VOTE, Some(json!("r1")), CoreError::PollClosed);
        let value: Value = serde_json::from_str(&reply.encode()).unwrap();
        assert_eq!(value["event"], "error");
        assert_eq!(value["data"]["kind"], "state");
        assert_eq!(value["data"]["code"], "poll_closed");
        assert_eq!(value["data"]["ref"], "r1");
        assert_eq!(value["data"]["requestEvent"], "poll:vote");
    }

    #[test]
    fn ack_omits_missing_ref() {
        let reply = Reply::ack(POLL_LIST, None, json!([]));
        let value: Value = serde_json::from_str(&reply.encode()).unwrap();
        assert_eq!(value["event"], "ack");
        assert!(value["data"].get("ref").is_none());
    }
}
