//! Ephemeral typing state.
//!
//! A `true` state auto-expires after the configured window unless refreshed.
//! Expiry is a scheduled clear per set, guarded by a generation counter so a
//! refresh invalidates the older timer; nothing polls and nothing persists.

use crate::metrics;
use crate::models::{ConversationId, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

type Key = (ConversationId, UserId);

#[derive(Clone)]
pub struct TypingTracker {
    inner: Arc<RwLock<HashMap<Key, u64>>>,
    generation: Arc<AtomicU64>,
    expiry: Duration,
}

impl TypingTracker {
    pub fn new(expiry: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
            expiry,
        }
    }

    pub async fn set_typing(&self, conversation_id: &ConversationId, user_id: &UserId, is_typing: bool) {
        let key = (conversation_id.clone(), user_id.clone());
        if !is_typing {
            self.inner.write().await.remove(&key);
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.write().await.insert(key.clone(), generation);

        let inner = Arc::clone(&self.inner);
        let expiry = self.expiry;
        tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            let mut map = inner.write().await;
            // Only the newest timer for this key may clear it.
            if map.get(&key) == Some(&generation) {
                map.remove(&key);
                metrics::TYPING_EXPIRIES.inc();
            }
        });
    }

    pub async fn is_typing(&self, conversation_id: &ConversationId, user_id: &UserId) -> bool {
        self.inner
            .read()
            .await
            .contains_key(&(conversation_id.clone(), user_id.clone()))
    }

    pub async fn typing_users(&self, conversation_id: &ConversationId) -> Vec<UserId> {
        self.inner
            .read()
            .await
            .keys()
            .filter(|(c, _)| c == conversation_id)
            .map(|(_, u)| u.clone())
            .collect()
    }
}
