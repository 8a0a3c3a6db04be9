//! Postgres-backed store implementation.
//!
//! Appends run in one transaction: the conversation row is locked, the next
//! sequence and a strictly-greater server timestamp are assigned from the
//! row itself, the message is inserted, the summary updated and the
//! recipient's unread counter incremented with an atomic upsert. The
//! subscriber registry lock is held across commit so live fanout order
//! always matches commit order.

use crate::error::{ChatError, ChatResult};
use crate::metrics;
use crate::models::{ConversationId, ConversationRecord, ConversationSummary, Message, MessageId, UserId};
use crate::store::{MessageStore, Subscription};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{migrate::Migrator, Pool, Postgres, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

type SubscriberMap = HashMap<ConversationId, Vec<mpsc::UnboundedSender<Message>>>;

#[derive(Clone)]
pub struct PostgresStore {
    pool: Pool<Postgres>,
    subscribers: Arc<Mutex<SubscriberMap>>,
}

impl PostgresStore {
    /// Wrap an existing pool and run embedded migrations (idempotent).
    pub async fn new(pool: Pool<Postgres>) -> ChatResult<Self> {
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| ChatError::Config(format!("migrations failed: {e}")))?;
        Ok(Self {
            pool,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub async fn connect(database_url: &str) -> ChatResult<Self> {
        let pool = Pool::<Postgres>::connect(database_url).await?;
        Self::new(pool).await
    }

    fn message_from_row(row: &PgRow) -> Message {
        let id: Uuid = row.get("id");
        let conversation_id: String = row.get("conversation_id");
        let sender_id: String = row.get("sender_id");
        let recipient_id: String = row.get("recipient_id");
        Message {
            id: MessageId(id),
            conversation_id: ConversationId::from_raw(conversation_id),
            sender_id: UserId::new(sender_id),
            recipient_id: UserId::new(recipient_id),
            content: row.get("content"),
            sequence: row.get("sequence"),
            created_at: row.get("created_at"),
            read: row.get("read"),
        }
    }

    fn record_from_row(row: &PgRow) -> ConversationRecord {
        let id: String = row.get("id");
        let participant_a: String = row.get("participant_a");
        let participant_b: String = row.get("participant_b");
        let last_sender_id: Option<String> = row.get("last_sender_id");
        ConversationRecord {
            id: ConversationId::from_raw(id),
            participant_a: UserId::new(participant_a),
            participant_b: UserId::new(participant_b),
            created_at: row.get("created_at"),
            last_message: row.get("last_message"),
            last_message_at: row.get("last_message_at"),
            last_sender_id: last_sender_id.map(UserId::new),
        }
    }
}

#[async_trait]
impl MessageStore for PostgresStore {
    async fn create_direct(&self, a: &UserId, b: &UserId) -> ChatResult<ConversationRecord> {
        let id = ConversationId::direct(a, b)?;
        // Participants are stored in canonical (sorted) order to match the
        // derived id regardless of which side created the conversation.
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        sqlx::query(
            "INSERT INTO conversations (id, participant_a, participant_b) \
             VALUES ($1, $2, $3) ON CONFLICT (id) DO NOTHING",
        )
        .bind(id.as_str())
        .bind(lo.as_str())
        .bind(hi.as_str())
        .execute(&self.pool)
        .await?;

        self.conversation(&id)
            .await?
            .ok_or(ChatError::ConversationNotFound)
    }

    async fn conversation(&self, id: &ConversationId) -> ChatResult<Option<ConversationRecord>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(Self::record_from_row))
    }

    async fn conversations_for(&self, user: &UserId) -> ChatResult<Vec<ConversationSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT c.*, COALESCE(u.count, 0) AS unread_count
            FROM conversations c
            LEFT JOIN unread_counters u
              ON u.conversation_id = c.id AND u.user_id = $1
            WHERE c.participant_a = $1 OR c.participant_b = $1
            ORDER BY c.last_message_at DESC NULLS LAST
            "#,
        )
        .bind(user.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ConversationSummary {
                conversation: Self::record_from_row(row),
                unread_count: row.get("unread_count"),
            })
            .collect())
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

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT participant_a, participant_b FROM conversations WHERE id = $1 FOR UPDATE",
        )
        .bind(conversation_id.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(ChatError::ConversationNotFound)?;

        let participant_a = UserId::new(row.get::<String, _>("participant_a"));
        let participant_b = UserId::new(row.get::<String, _>("participant_b"));
        let valid_pair = (sender_id == &participant_a && recipient_id == &participant_b)
            || (sender_id == &participant_b && recipient_id == &participant_a);
        if !valid_pair {
            return Err(ChatError::Unauthorized);
        }

        // The locked row is the monotonic write-ordering primitive: sequence
        // comes from last_sequence + 1, the timestamp is forced past the
        // previous one when wall clocks tie.
        let row = sqlx::query(
            r#"
            UPDATE conversations
            SET last_sequence   = last_sequence + 1,
                last_message    = $2,
                last_sender_id  = $3,
                last_message_at = GREATEST(
                    now(),
                    COALESCE(last_message_at, to_timestamp(0)) + interval '1 microsecond'
                )
            WHERE id = $1
            RETURNING last_sequence, last_message_at
            "#,
        )
        .bind(conversation_id.as_str())
        .bind(content)
        .bind(sender_id.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let sequence: i64 = row.get("last_sequence");
        let created_at: DateTime<Utc> = row.get("last_message_at");

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

        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, sender_id, recipient_id, content, sequence, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(message.id.0)
        .bind(conversation_id.as_str())
        .bind(sender_id.as_str())
        .bind(recipient_id.as_str())
        .bind(content)
        .bind(sequence)
        .bind(created_at)
        .execute(&mut *tx)
        .await?;

        // Atomic server-side increment, never read-modify-write.
        sqlx::query(
            r#"
            INSERT INTO unread_counters (user_id, conversation_id, count, last_message_at)
            VALUES ($1, $2, 1, $3)
            ON CONFLICT (user_id, conversation_id) DO UPDATE
            SET count = unread_counters.count + 1,
                last_message_at = EXCLUDED.last_message_at
            "#,
        )
        .bind(recipient_id.as_str())
        .bind(conversation_id.as_str())
        .bind(created_at)
        .execute(&mut *tx)
        .await?;

        let mut registry = self.subscribers.lock().await;
        tx.commit().await?;
        if let Some(list) = registry.get_mut(conversation_id) {
            list.retain(|tx| tx.send(message.clone()).is_ok());
        }
        drop(registry);

        metrics::MESSAGES_APPENDED.inc();
        Ok(message)
    }

    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
        since_sequence: i64,
    ) -> ChatResult<Subscription> {
        let exists: Option<i64> =
            sqlx::query_scalar("SELECT 1::bigint FROM conversations WHERE id = $1")
                .bind(conversation_id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        if exists.is_none() {
            return Err(ChatError::ConversationNotFound);
        }

        // Register for live fanout before the catch-up query so nothing
        // committed in between is missed; the subscription's sequence filter
        // drops the overlap.
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .await
            .entry(conversation_id.clone())
            .or_default()
            .push(tx);

        let rows = sqlx::query(
            "SELECT * FROM messages WHERE conversation_id = $1 AND sequence > $2 \
             ORDER BY sequence ASC",
        )
        .bind(conversation_id.as_str())
        .bind(since_sequence)
        .fetch_all(&self.pool)
        .await?;
        let backlog = rows.iter().map(Self::message_from_row).collect();

        Ok(Subscription::with_backlog(backlog, rx, since_sequence))
    }

    async fn mark_read(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
    ) -> ChatResult<()> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<i64> =
            sqlx::query_scalar("SELECT 1::bigint FROM conversations WHERE id = $1")
                .bind(conversation_id.as_str())
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(ChatError::ConversationNotFound);
        }

        sqlx::query(
            "UPDATE unread_counters SET count = 0 WHERE user_id = $1 AND conversation_id = $2",
        )
        .bind(user_id.as_str())
        .bind(conversation_id.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE messages SET \"read\" = TRUE \
             WHERE conversation_id = $1 AND recipient_id = $2 AND NOT \"read\"",
        )
        .bind(conversation_id.as_str())
        .bind(user_id.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn unread_count(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
    ) -> ChatResult<i64> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT count FROM unread_counters WHERE user_id = $1 AND conversation_id = $2",
        )
        .bind(user_id.as_str())
        .bind(conversation_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(count.unwrap_or(0))
    }

    async fn history(&self, conversation_id: &ConversationId) -> ChatResult<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE conversation_id = $1 ORDER BY sequence ASC",
        )
        .bind(conversation_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::message_from_row).collect())
    }
}
