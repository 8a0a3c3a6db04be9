use crate::error::{ChatError, ChatResult};
use crate::models::user::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Canonical conversation identifier.
///
/// Direct conversations use the derived form `min(a,b) + "_" + max(a,b)`, so
/// both participants always arrive at the same id. Store-assigned opaque ids
/// are accepted wherever a `ConversationId` is taken; once a conversation
/// record exists its id is never recomputed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Derive the canonical id for a direct conversation between two users.
    ///
    /// Pure; `direct(a, b) == direct(b, a)`. A user may not chat with
    /// themself.
    pub fn direct(a: &UserId, b: &UserId) -> ChatResult<Self> {
        if a == b {
            return Err(ChatError::InvalidConversation);
        }
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Ok(Self(format!("{lo}_{hi}")))
    }

    /// Wrap a store-assigned opaque id.
    pub fn assigned(id: Uuid) -> Self {
        Self(id.to_string())
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable conversation record. Exactly two participants, fixed at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub participant_a: UserId,
    pub participant_b: UserId,
    pub created_at: DateTime<Utc>,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_sender_id: Option<UserId>,
}

impl ConversationRecord {
    pub fn is_participant(&self, user: &UserId) -> bool {
        &self.participant_a == user || &self.participant_b == user
    }

    /// The participant other than `user`, if `user` is a participant.
    pub fn peer_of(&self, user: &UserId) -> Option<&UserId> {
        if &self.participant_a == user {
            Some(&self.participant_b)
        } else if &self.participant_b == user {
            Some(&self.participant_a)
        } else {
            None
        }
    }
}

/// Per-user conversation listing entry: record plus the viewer's unread count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation: ConversationRecord,
    pub unread_count: i64,
}
