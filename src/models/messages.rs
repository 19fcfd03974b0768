use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::{MessageId, RoomId, UserId};

/// Kind tag carried on the wire as `messageType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Text,
    Image,
}

/// Payload of a message. A text message carries content, an image message
/// carries a file reference, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Text(String),
    Image { file_url: String },
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Text(_) => MessageKind::Text,
            MessageBody::Image { .. } => MessageKind::Image,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            MessageBody::Text(content) => Some(content),
            MessageBody::Image { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidBody {
    #[error("{0:?} message is missing its payload")]
    Missing(MessageKind),
    #[error("{0:?} message carries both content and a file reference")]
    Both(MessageKind),
}

/// `messageType` plus the two mutually exclusive payload fields, as sent
/// and received on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBody {
    message_type: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_url: Option<String>,
}

impl TryFrom<WireBody> for MessageBody {
    type Error = InvalidBody;

    fn try_from(wire: WireBody) -> Result<Self, Self::Error> {
        let content = wire.content.filter(|c| !c.is_empty());
        let file_url = wire.file_url.filter(|f| !f.is_empty());

        match (wire.message_type, content, file_url) {
            (kind, Some(_), Some(_)) => Err(InvalidBody::Both(kind)),
            (MessageKind::Text, Some(content), None) => Ok(MessageBody::Text(content)),
            (MessageKind::Image, None, Some(file_url)) => Ok(MessageBody::Image { file_url }),
            (kind, _, _) => Err(InvalidBody::Missing(kind)),
        }
    }
}

impl From<MessageBody> for WireBody {
    fn from(body: MessageBody) -> Self {
        match body {
            MessageBody::Text(content) => Self {
                message_type: MessageKind::Text,
                content: Some(content),
                file_url: None,
            },
            MessageBody::Image { file_url } => Self {
                message_type: MessageKind::Image,
                content: None,
                file_url: Some(file_url),
            },
        }
    }
}

/// A delivered chat message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireChatMessage", into = "WireChatMessage")]
pub struct ChatMessage {
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub body: MessageBody,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }
}

/// One terminal line: `[2026-01-01 12:00] #101 user 7: hello`.
impl fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let when = self.created_at.format("%Y-%m-%d %H:%M");
        write!(f, "[{when}] #{} user {}: ", self.id, self.sender_id)?;
        match &self.body {
            MessageBody::Text(content) => f.write_str(content),
            MessageBody::Image { file_url } => write!(f, "[image] {file_url}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireChatMessage {
    #[serde(alias = "id")]
    message_id: MessageId,
    room_id: RoomId,
    sender_id: UserId,
    #[serde(flatten)]
    body: WireBody,
    #[serde(with = "timestamp")]
    created_at: DateTime<Utc>,
}

impl TryFrom<WireChatMessage> for ChatMessage {
    type Error = InvalidBody;

    fn try_from(wire: WireChatMessage) -> Result<Self, Self::Error> {
        Ok(Self {
            id: wire.message_id,
            room_id: wire.room_id,
            sender_id: wire.sender_id,
            body: wire.body.try_into()?,
            created_at: wire.created_at,
        })
    }
}

impl From<ChatMessage> for WireChatMessage {
    fn from(m: ChatMessage) -> Self {
        Self {
            message_id: m.id,
            room_id: m.room_id,
            sender_id: m.sender_id,
            body: m.body.into(),
            created_at: m.created_at,
        }
    }
}

/// Body of a send request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "WireBody")]
pub struct NewMessage {
    pub body: MessageBody,
}

impl NewMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            body: MessageBody::Text(content.into()),
        }
    }

    pub fn image(file_url: impl Into<String>) -> Self {
        Self {
            body: MessageBody::Image {
                file_url: file_url.into(),
            },
        }
    }

    /// Returns a reason when the message must not be submitted.
    pub fn validate(&self) -> Result<(), String> {
        match &self.body {
            MessageBody::Text(content) if content.trim().is_empty() => {
                Err("Message content cannot be empty".to_string())
            }
            MessageBody::Image { file_url } if file_url.trim().is_empty() => {
                Err("Image message needs a file reference".to_string())
            }
            _ => Ok(()),
        }
    }
}

impl From<NewMessage> for WireBody {
    fn from(m: NewMessage) -> Self {
        m.body.into()
    }
}

/// One page of room history.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    #[serde(alias = "content", alias = "items")]
    pub messages: Vec<ChatMessage>,
    /// Cursor for the next (older) page; `None` once history is exhausted.
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Request body for the read-status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadStatusUpdate {
    pub last_read_message_id: MessageId,
}

/// Read-status endpoint response, echoing what the server accepted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadStatus {
    pub room_id: RoomId,
    pub last_read_message_id: MessageId,
}

/// Parses an RFC 3339 timestamp, or a zone-less one taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Ok(ts.with_timezone(&Utc)),
        Err(_) => NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").map(|n| n.and_utc()),
    }
}

mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}
