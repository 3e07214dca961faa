use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transport-assigned message id (opaque string).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EventId(pub String);

/// Conversation key; one rolling session per key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionKey(pub String);

/// Stable sender identity. The transport exposes no durable account id, so the
/// profile triple stands in for one. Two senders sharing all three fields are
/// indistinguishable to the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SenderKey {
    pub signature: String,
    pub nickname: String,
    pub province: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConversationKind {
    Direct,
    Group,
}

/// A decoded inbound chat event. Immutable once received; the transport
/// adapter owns frame parsing.
#[derive(Clone, Debug)]
pub struct InboundEvent {
    pub id: EventId,
    pub created_at: DateTime<Utc>,
    pub sender: SenderKey,
    pub kind: ConversationKind,
    pub session_key: SessionKey,
    /// Group display name; `None` for direct chats.
    pub conversation_name: Option<String>,
    /// Where the reply goes (transport-specific address).
    pub destination: Destination,
    pub text: String,
    /// Per-sender API credential; overrides the adapter's default key when set.
    pub credential: Option<String>,
}

/// Transport-specific reply address (user name, room id, ...).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Destination(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyKind {
    Text,
    Image,
    Voice,
    Error,
    Info,
}

/// Outbound reply handed to the transport adapter.
#[derive(Clone, Debug)]
pub struct Reply {
    pub kind: ReplyKind,
    pub payload: String,
}

impl Reply {
    pub fn text(payload: impl Into<String>) -> Self {
        Self {
            kind: ReplyKind::Text,
            payload: payload.into(),
        }
    }

    pub fn info(payload: impl Into<String>) -> Self {
        Self {
            kind: ReplyKind::Info,
            payload: payload.into(),
        }
    }

    pub fn error(payload: impl Into<String>) -> Self {
        Self {
            kind: ReplyKind::Error,
            payload: payload.into(),
        }
    }
}
