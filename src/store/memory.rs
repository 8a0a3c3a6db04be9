//! In-process store implementation.
//!
//! Semantics are identical to the Postgres store; appends and fanout happen
//! under one lock, which is what makes sequence assignment atomic and
//! broadcast order equal to commit order.

use crate::error::{ChatError, ChatResult};
use crate::metrics;
use crate::models::{ConversationId, ConversationRecord, ConversationSummary, Message, MessageId, UserId};
use crate::store::{MessageStore, Subscription};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

#[derive(Default)]
struct UnreadRecord {
    count: i64,
    last_message_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    conversations: HashMap<ConversationId, ConversationRecord>,
    messages: HashMap<ConversationId, Vec<Message>>,
    unread: HashMap<(UserId, ConversationId), UnreadRecord>,
    subscribers: HashMap<ConversationId, Vec<mpsc::UnboundedSender<Message>>>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create_direct(&self, a: &UserId, b: &UserId) -> ChatResult<ConversationRecord> {
        let id = ConversationId::direct(a, b)?;
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.conversations.get(&id) {
            return Ok(existing.clone());
        }
        let record = ConversationRecord {
            id: id.clone(),
            participant_a: a.clone(),
            participant_b: b.clone(),
            created_at: Utc::now(),
            last_message: None,
            last_message_at: None,
            last_sender_id: None,
        };
        inner.conversations.insert(id, record.clone());
        Ok(record)
    }

    async fn conversation(&self, id: &ConversationId) -> ChatResult<Option<ConversationRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.conversations.get(id).cloned())
    }

    async fn conversations_for(&self, user: &UserId) -> ChatResult<Vec<ConversationSummary>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<ConversationSummary> = inner
            .conversations
            .values()
            .filter(|c| c.is_participant(user))
            .map(|c| ConversationSummary {
                conversation: c.clone(),
                unread_count: inner
                    .unread
                    .get(&(user.clone(), c.id.clone()))
                    .map(|u| u.count)
                    .unwrap_or(0),
            })
            .collect();
        out.sort_by(|x, y| {
            y.conversation
                .last_message_at
                .cmp(&x.conversation.last_message_at)
        });
        Ok(out)
    }

    async fn append(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        recipient_id: &UserId,
        content: &str,
    ) -> ChatResult<Message> {
        if content.trim().is_empty() {
            return Err(ChatError::EmptyContent);
        }

        let mut inner = self.inner.lock().await;

        let record = inner
            .conversations
            .get(conversation_id)
            .ok_or(ChatError::ConversationNotFound)?;
        // Participants are fixed at creation; validate against the record,
        // never trust caller input.
        if !record.is_participant(sender_id) || record.peer_of(sender_id) != Some(recipient_id) {
            return Err(ChatError::Unauthorized);
        }

        let existing = inner.messages.entry(conversation_id.clone()).or_default();
        let sequence = existing.last().map(|m| m.sequence).unwrap_or(0) + 1;
        // Server clock, nudged forward when two appends land in the same
        // instant, so timestamps stay strictly increasing per conversation.
        let floor = existing
            .last()
            .map(|m| m.created_at + ChronoDuration::microseconds(1));
        let created_at = match floor {
            Some(f) if f > Utc::now() => f,
            _ => Utc::now(),
        };

        let message = Message {
            id: MessageId::generate(),
            conversation_id: conversation_id.clone(),
            sender_id: sender_id.clone(),
            recipient_id: recipient_id.clone(),
            content: content.to_string(),
            sequence,
            created_at,
            read: false,
        };
        existing.push(message.clone());

        let record = inner
            .conversations
            .get_mut(conversation_id)
            .expect("conversation checked above");
        record.last_message = Some(message.content.clone());
        record.last_message_at = Some(created_at);
        record.last_sender_id = Some(sender_id.clone());

        let unread = inner
            .unread
            .entry((recipient_id.clone(), conversation_id.clone()))
            .or_default();
        unread.count += 1;
        unread.last_message_at = Some(created_at);

        // Fanout under the same lock: broadcast order == commit order.
        if let Some(list) = inner.subscribers.get_mut(conversation_id) {
            list.retain(|tx| tx.send(message.clone()).is_ok());
        }

        metrics::MESSAGES_APPENDED.inc();
        Ok(message)
    }

    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
        since_sequence: i64,
    ) -> ChatResult<Subscription> {
        let mut inner = self.inner.lock().await;
        if !inner.conversations.contains_key(conversation_id) {
            return Err(ChatError::ConversationNotFound);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        // Catch-up goes into the channel before the sender is registered for
        // live fanout; both happen under the lock, so no message can be
        // missed or delivered out of order.
        if let Some(messages) = inner.messages.get(conversation_id) {
            for message in messages.iter().filter(|m| m.sequence > since_sequence) {
                let _ = tx.send(message.clone());
            }
        }
        inner
            .subscribers
            .entry(conversation_id.clone())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx, since_sequence))
    }

    async fn mark_read(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
    ) -> ChatResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.conversations.contains_key(conversation_id) {
            return Err(ChatError::ConversationNotFound);
        }
        if let Some(unread) = inner
            .unread
            .get_mut(&(user_id.clone(), conversation_id.clone()))
        {
            unread.count = 0;
        }
        if let Some(messages) = inner.messages.get_mut(conversation_id) {
            for message in messages.iter_mut() {
                if &message.recipient_id == user_id {
                    message.read = true;
                }
            }
        }
        Ok(())
    }

    async fn unread_count(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
    ) -> ChatResult<i64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .unread
            .get(&(user_id.clone(), conversation_id.clone()))
            .map(|u| u.count)
            .unwrap_or(0))
    }

    async fn history(&self, conversation_id: &ConversationId) -> ChatResult<Vec<Message>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> (UserId, UserId) {
        (UserId::new("alice"), UserId::new("bob"))
    }

    #[tokio::test]
    async fn create_direct_is_idempotent() {
        let store = MemoryStore::new();
        let (a, b) = users();
        let first = store.create_direct(&a, &b).await.unwrap();
        let second = store.create_direct(&b, &a).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn append_validates_content_and_participants() {
        let store = MemoryStore::new();
        let (a, b) = users();
        let conv = store.create_direct(&a, &b).await.unwrap();

        assert!(matches!(
            store.append(&conv.id, &a, &b, "   ").await,
            Err(ChatError::EmptyContent)
        ));
        let mallory = UserId::new("mallory");
        assert!(matches!(
            store.append(&conv.id, &mallory, &b, "hi").await,
            Err(ChatError::Unauthorized)
        ));
        assert!(matches!(
            store.append(&conv.id, &a, &mallory, "hi").await,
            Err(ChatError::Unauthorized)
        ));
        assert!(matches!(
            store
                .append(&ConversationId::from_raw("missing"), &a, &b, "hi")
                .await,
            Err(ChatError::ConversationNotFound)
        ));
    }

    #[tokio::test]
    async fn sequences_and_timestamps_are_strictly_increasing() {
        let store = MemoryStore::new();
        let (a, b) = users();
        let conv = store.create_direct(&a, &b).await.unwrap();

        let mut prev: Option<Message> = None;
        for i in 0..50 {
            let m = store
                .append(&conv.id, &a, &b, &format!("m{i}"))
                .await
                .unwrap();
            if let Some(p) = prev {
                assert_eq!(m.sequence, p.sequence + 1);
                assert!(m.created_at > p.created_at);
            }
            prev = Some(m);
        }
    }

    #[tokio::test]
    async fn concurrent_appends_get_distinct_sequences() {
        let store = MemoryStore::new();
        let (a, b) = users();
        let conv = store.create_direct(&a, &b).await.unwrap();

        let s1 = store.clone();
        let s2 = store.clone();
        let (id1, a1, b1) = (conv.id.clone(), a.clone(), b.clone());
        let (id2, a2, b2) = (conv.id.clone(), a.clone(), b.clone());
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { s1.append(&id1, &a1, &b1, "from a").await }),
            tokio::spawn(async move { s2.append(&id2, &b2, &a2, "from b").await }),
        );
        let m1 = r1.unwrap().unwrap();
        let m2 = r2.unwrap().unwrap();
        assert_ne!(m1.sequence, m2.sequence);
        assert_eq!(m1.sequence.min(m2.sequence), 1);
        assert_eq!(m1.sequence.max(m2.sequence), 2);
    }

    #[tokio::test]
    async fn subscription_replays_and_follows_without_duplicates() {
        let store = MemoryStore::new();
        let (a, b) = users();
        let conv = store.create_direct(&a, &b).await.unwrap();

        store.append(&conv.id, &a, &b, "one").await.unwrap();
        store.append(&conv.id, &b, &a, "two").await.unwrap();

        let mut sub = store.subscribe(&conv.id, 0).await.unwrap();
        store.append(&conv.id, &a, &b, "three").await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(sub.recv().await.unwrap().sequence);
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(sub.last_sequence(), 3);

        // Restart from where we left off: nothing is re-emitted.
        let mut resumed = store.subscribe(&conv.id, sub.last_sequence()).await.unwrap();
        store.append(&conv.id, &b, &a, "four").await.unwrap();
        assert_eq!(resumed.recv().await.unwrap().sequence, 4);
    }

    #[tokio::test]
    async fn unread_counts_and_mark_read_idempotence() {
        let store = MemoryStore::new();
        let (a, b) = users();
        let conv = store.create_direct(&a, &b).await.unwrap();

        // Resilient before any messages exist.
        assert_eq!(store.unread_count(&b, &conv.id).await.unwrap(), 0);

        store.append(&conv.id, &a, &b, "hi").await.unwrap();
        store.append(&conv.id, &a, &b, "there").await.unwrap();
        assert_eq!(store.unread_count(&b, &conv.id).await.unwrap(), 2);
        assert_eq!(store.unread_count(&a, &conv.id).await.unwrap(), 0);

        store.mark_read(&b, &conv.id).await.unwrap();
        store.mark_read(&b, &conv.id).await.unwrap();
        assert_eq!(store.unread_count(&b, &conv.id).await.unwrap(), 0);

        let history = store.history(&conv.id).await.unwrap();
        assert!(history.iter().all(|m| m.read));
    }

    #[tokio::test]
    async fn conversations_for_orders_by_activity() {
        let store = MemoryStore::new();
        let a = UserId::new("a");
        let b = UserId::new("b");
        let c = UserId::new("c");
        let ab = store.create_direct(&a, &b).await.unwrap();
        let ac = store.create_direct(&a, &c).await.unwrap();

        store.append(&ab.id, &b, &a, "old").await.unwrap();
        store.append(&ac.id, &c, &a, "new").await.unwrap();

        let list = store.conversations_for(&a).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].conversation.id, ac.id);
        assert_eq!(list[0].unread_count, 1);
        assert_eq!(list[1].conversation.id, ab.id);
    }
}
