//! Read-through accessor over the store's unread counters.
//!
//! The counter itself lives in the store and is incremented by `append`;
//! this wrapper adds the bounded-backoff retry policy for transient store
//! failures. Both operations are safe to call before any messages exist.

use crate::error::ChatResult;
use crate::models::{ConversationId, UserId};
use crate::retry::{with_retry, RetryConfig};
use crate::store::MessageStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct UnreadCounters {
    store: Arc<dyn MessageStore>,
    retry: RetryConfig,
}

impl UnreadCounters {
    pub fn new(store: Arc<dyn MessageStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Unread count for (user, conversation); 0 when nothing exists yet.
    pub async fn get(&self, user_id: &UserId, conversation_id: &ConversationId) -> ChatResult<i64> {
        with_retry(&self.retry, || {
            self.store.unread_count(user_id, conversation_id)
        })
        .await
    }

    /// Reset the counter and flip `read` on the user's messages. Idempotent.
    pub async fn mark_read(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
    ) -> ChatResult<()> {
        with_retry(&self.retry, || self.store.mark_read(user_id, conversation_id)).await
    }
}
