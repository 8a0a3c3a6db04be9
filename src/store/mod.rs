//! Durable message store — the source of truth for conversations, messages
//! and unread counters.
//!
//! Two implementations share one contract: [`MemoryStore`] for in-process use
//! and tests, [`PostgresStore`] for production. Appends are atomic per
//! conversation: sequence numbers and server timestamps are strictly
//! increasing, the last-message summary is updated, and the recipient's
//! unread counter is incremented in the same write.

use crate::error::ChatResult;
use crate::models::{ConversationId, ConversationRecord, ConversationSummary, Message, UserId};
use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Create the canonical direct conversation between two users.
    /// Idempotent: returns the existing record when it already exists.
    async fn create_direct(&self, a: &UserId, b: &UserId) -> ChatResult<ConversationRecord>;

    async fn conversation(&self, id: &ConversationId) -> ChatResult<Option<ConversationRecord>>;

    /// All conversations the user participates in, most recent activity
    /// first, each with the user's unread count.
    async fn conversations_for(&self, user: &UserId) -> ChatResult<Vec<ConversationSummary>>;

    /// Append a message. Atomically assigns sequence and server timestamp,
    /// updates the conversation summary and increments the recipient's
    /// unread counter.
    async fn append(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        recipient_id: &UserId,
        content: &str,
    ) -> ChatResult<Message>;

    /// Ordered, restartable firehose of one conversation's messages.
    /// Starts with catch-up of rows with sequence > `since_sequence`, then
    /// live deliveries. Dropping the subscription releases it.
    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
        since_sequence: i64,
    ) -> ChatResult<Subscription>;

    /// Reset the user's unread counter and flip `read` on messages addressed
    /// to them. Idempotent; succeeds when no messages exist.
    async fn mark_read(&self, user_id: &UserId, conversation_id: &ConversationId)
        -> ChatResult<()>;

    async fn unread_count(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
    ) -> ChatResult<i64>;

    /// Full ordered history (ascending by sequence).
    async fn history(&self, conversation_id: &ConversationId) -> ChatResult<Vec<Message>>;
}

/// A live, append-only view of one conversation's message sequence.
///
/// Producers may hand the channel both catch-up rows and live broadcasts;
/// the monotonic sequence filter here guarantees a delivered sequence is
/// never re-emitted on the same subscription.
pub struct Subscription {
    backlog: std::collections::VecDeque<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
    last_sequence: i64,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Message>, since_sequence: i64) -> Self {
        Self::with_backlog(Vec::new(), rx, since_sequence)
    }

    /// Backlog rows (the catch-up query result) are drained before live
    /// deliveries; live copies of backlog rows fall to the sequence filter.
    pub(crate) fn with_backlog(
        backlog: Vec<Message>,
        rx: mpsc::UnboundedReceiver<Message>,
        since_sequence: i64,
    ) -> Self {
        Self {
            backlog: backlog.into(),
            rx,
            last_sequence: since_sequence,
        }
    }

    /// Next message in strictly increasing sequence order, or `None` once
    /// the store side has gone away.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            let message = match self.backlog.pop_front() {
                Some(m) => m,
                None => self.rx.recv().await?,
            };
            if message.sequence > self.last_sequence {
                self.last_sequence = message.sequence;
                return Some(message);
            }
        }
    }

    /// Sequence of the last delivered message; feed this back into
    /// `subscribe` to restart without duplicates.
    pub fn last_sequence(&self) -> i64 {
        self.last_sequence
    }
}
