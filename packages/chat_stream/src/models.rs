//! Chat data model.
//!
//! Server-confirmed records ([`Session`], [`Message`]) mirror the backend's
//! JSON shapes. Locally created user messages are [`ProvisionalMessage`]s
//! with a UUID id, so they can never be confused with a server integer id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Server-assigned chat session identifier.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub i64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-assigned message identifier.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Locally assigned id of a message the server has not confirmed yet.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct ProvisionalId(pub Uuid);

impl ProvisionalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProvisionalId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProvisionalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "local-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A chat session as listed by the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: i64,
    pub title: String,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub updated_at: DateTime<Utc>,
}

/// A server-confirmed message. Immutable once received.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    /// Absent on duplex frames; the codec fills it from the connection scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub role: Role,
    pub content: String,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

/// A user message shown before the server has confirmed it.
#[derive(Clone, Debug, PartialEq)]
pub struct ProvisionalMessage {
    pub id: ProvisionalId,
    pub session_id: SessionId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// One entry of the active session's message sequence.
#[derive(Clone, Debug, PartialEq)]
pub enum ThreadMessage {
    Confirmed(Message),
    Provisional(ProvisionalMessage),
}

impl ThreadMessage {
    pub fn role(&self) -> Role {
        match self {
            ThreadMessage::Confirmed(m) => m.role,
            ThreadMessage::Provisional(_) => Role::User,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            ThreadMessage::Confirmed(m) => &m.content,
            ThreadMessage::Provisional(p) => &p.content,
        }
    }

    pub fn confirmed_id(&self) -> Option<MessageId> {
        match self {
            ThreadMessage::Confirmed(m) => Some(m.id),
            ThreadMessage::Provisional(_) => None,
        }
    }

    pub fn provisional_id(&self) -> Option<ProvisionalId> {
        match self {
            ThreadMessage::Provisional(p) => Some(p.id),
            ThreadMessage::Confirmed(_) => None,
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, ThreadMessage::Provisional(_))
    }
}

/// A session together with its full message history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionWithMessages {
    #[serde(flatten)]
    pub session: Session,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// One page of the session list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionPage {
    pub sessions: Vec<Session>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Result of a synchronous send: both confirmed halves of the exchange.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessagePair {
    pub user_message: Message,
    pub assistant_message: Message,
}

/// Timestamps arrive either as RFC 3339 or as naive ISO 8601 (implicitly UTC).
pub(crate) mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).ok_or_else(|| D::Error::custom(format!("invalid timestamp: {raw}")))
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }
}
