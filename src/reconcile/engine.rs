//! The merge algorithm.
//!
//! One conversation view is fed by two independent sources: the store
//! subscription (durable, ordered, eventually consistent) and the push
//! transport (immediate, at-most-once, unordered relative to the store).
//! The engine folds both into a single duplicate-free, timestamp-ordered
//! sequence.
//!
//! Identity rules:
//! - a durable entry is keyed by its store id;
//! - a not-yet-durable entry (optimistic local send, or a transport copy
//!   that raced ahead of the store) is keyed provisionally by
//!   (sender, content) within a bounded time window;
//! - when the store catches up, the provisional entry is replaced in place —
//!   it keeps its position and merely acquires durable identity, so the
//!   caller never observes a reorder or a flicker.

use crate::metrics;
use crate::models::{Message, MessageId, UserId};
use crate::transport::WireMessage;
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Shown optimistically; not yet confirmed durable.
    Pending,
    /// Confirmed by the store (directly or via a transport echo carrying
    /// store identity).
    Durable,
    /// Never resolved within the timeout; caller should offer a retry.
    Failed,
}

/// Stable handle for a provisional entry, valid for the life of the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryKey(u64);

#[derive(Debug, Clone)]
pub struct ViewEntry {
    pub key: EntryKey,
    pub id: Option<MessageId>,
    pub sequence: Option<i64>,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
    pub status: EntryStatus,
    /// Local wall-clock instant the entry first appeared; drives expiry.
    first_seen: DateTime<Utc>,
}

/// Outcome of feeding one event into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// New entry inserted in order.
    Inserted,
    /// A provisional entry was resolved in place.
    Resolved,
    /// A copy of something already present; discarded.
    Duplicate,
}

pub struct ReconcileEngine {
    entries: Vec<ViewEntry>,
    /// The local user. Only their sends may fail and be re-armed; entries
    /// from anyone else are never candidates for resubmission.
    me: UserId,
    window: Duration,
    resolve_timeout: Duration,
    next_key: u64,
}

impl ReconcileEngine {
    pub fn new(
        me: UserId,
        window: std::time::Duration,
        resolve_timeout: std::time::Duration,
    ) -> Self {
        Self {
            entries: Vec::new(),
            me,
            window: Duration::from_std(window).unwrap_or_else(|_| Duration::seconds(5)),
            resolve_timeout: Duration::from_std(resolve_timeout)
                .unwrap_or_else(|_| Duration::seconds(30)),
            next_key: 0,
        }
    }

    pub fn entries(&self) -> &[ViewEntry] {
        &self.entries
    }

    pub fn get(&self, key: EntryKey) -> Option<&ViewEntry> {
        self.entries.iter().find(|e| e.key == key)
    }

    /// Record an optimistic local send. The entry appears immediately with
    /// a client timestamp and stays at a stable position while it resolves.
    pub fn push_local(
        &mut self,
        sender_id: UserId,
        recipient_id: UserId,
        content: String,
        now: DateTime<Utc>,
    ) -> EntryKey {
        let key = self.fresh_key();
        let entry = ViewEntry {
            key,
            id: None,
            sequence: None,
            sender_id,
            recipient_id,
            content,
            timestamp: now,
            read: false,
            status: EntryStatus::Pending,
            first_seen: now,
        };
        let pos = self.insert_position(&entry);
        self.entries.insert(pos, entry);
        key
    }

    /// Fold in a message delivered by the store subscription. The store is
    /// canonical: it resolves matching provisional entries, its fields win
    /// over any transport-carried ones, and once an entry has its canonical
    /// timestamp it sits at its canonical position — every view that drains
    /// the same subscription converges on the same order.
    pub fn apply_store(&mut self, message: &Message) -> Applied {
        if let Some(idx) = self.entries.iter().position(|e| {
            e.id == Some(message.id) || (e.sequence.is_some() && e.sequence == Some(message.sequence))
        }) {
            // Already known durably; absorb canonical fields (read flips
            // arrive this way).
            self.absorb_canonical(idx, message);
            metrics::DUPLICATES_SUPPRESSED.inc();
            return Applied::Duplicate;
        }

        if let Some(idx) = self.provisional_match(
            &message.sender_id,
            &message.content,
            message.created_at,
        ) {
            self.absorb_canonical(idx, message);
            return Applied::Resolved;
        }

        let key = self.fresh_key();
        let entry = ViewEntry {
            key,
            id: Some(message.id),
            sequence: Some(message.sequence),
            sender_id: message.sender_id.clone(),
            recipient_id: message.recipient_id.clone(),
            content: message.content.clone(),
            timestamp: message.created_at,
            read: message.read,
            status: EntryStatus::Durable,
            first_seen: Utc::now(),
        };
        let pos = self.insert_position(&entry);
        self.entries.insert(pos, entry);
        Applied::Inserted
    }

    /// Fold in a transport-delivered copy (a remote `new_message` or the
    /// echo of our own send). If the store already delivered the same id,
    /// the transport copy is discarded — the store wins.
    pub fn apply_transport(&mut self, message: &WireMessage, now: DateTime<Utc>) -> Applied {
        if let Some(id) = message.id {
            if let Some(entry) = self.entries.iter_mut().find(|e| e.id == Some(id)) {
                // Store copy (or an earlier echo) got here first.
                if entry.status == EntryStatus::Pending {
                    entry.status = EntryStatus::Durable;
                }
                metrics::DUPLICATES_SUPPRESSED.inc();
                return Applied::Duplicate;
            }
        }

        if let Some(idx) =
            self.provisional_match(&message.sender_id, &message.content, message.timestamp)
        {
            // Echo of an optimistic entry. A durable echo carries the
            // server-assigned identity and timestamp; absorb both so the
            // entry lands at its canonical position.
            if message.id.is_some() {
                let mut entry = self.entries.remove(idx);
                entry.id = message.id;
                entry.sequence = message.sequence;
                entry.timestamp = message.timestamp;
                entry.status = EntryStatus::Durable;
                let pos = self.insert_position(&entry);
                self.entries.insert(pos, entry);
            }
            return Applied::Resolved;
        }

        let key = self.fresh_key();
        let durable = message.id.is_some();
        let entry = ViewEntry {
            key,
            id: message.id,
            sequence: message.sequence,
            sender_id: message.sender_id.clone(),
            recipient_id: message.recipient_id.clone(),
            content: message.content.clone(),
            timestamp: message.timestamp,
            read: false,
            status: if durable {
                EntryStatus::Durable
            } else {
                EntryStatus::Pending
            },
            first_seen: now,
        };
        let pos = self.insert_position(&entry);
        self.entries.insert(pos, entry);
        Applied::Inserted
    }

    /// Handle provisional entries unresolved past the resolve timeout. The
    /// local user's sends become `Failed` and are returned for a retry
    /// affordance — never dropped silently. An unconfirmed remote copy is
    /// not ours to resend: it is removed, and the store echo, if it ever
    /// lands, re-inserts it with durable identity.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<EntryKey> {
        let me = self.me.clone();
        let resolve_timeout = self.resolve_timeout;
        let mut failed = Vec::new();
        self.entries.retain_mut(|entry| {
            if entry.status != EntryStatus::Pending
                || now - entry.first_seen <= resolve_timeout
            {
                return true;
            }
            if entry.sender_id == me {
                entry.status = EntryStatus::Failed;
                failed.push(entry.key);
                metrics::ENTRIES_FAILED.inc();
                true
            } else {
                false
            }
        });
        failed
    }

    /// Mark a provisional local send failed immediately (permanent append
    /// error).
    pub fn fail(&mut self, key: EntryKey) -> bool {
        match self.entries.iter_mut().find(|e| e.key == key) {
            Some(entry) if entry.status == EntryStatus::Pending && entry.sender_id == self.me => {
                entry.status = EntryStatus::Failed;
                metrics::ENTRIES_FAILED.inc();
                true
            }
            _ => false,
        }
    }

    /// Re-arm a failed local send for resubmission. The timestamp moves to
    /// the resend instant so the eventual durable echo falls inside the
    /// window.
    pub fn rearm(&mut self, key: EntryKey, now: DateTime<Utc>) -> bool {
        match self.entries.iter_mut().find(|e| e.key == key) {
            Some(entry) if entry.status == EntryStatus::Failed && entry.sender_id == self.me => {
                entry.status = EntryStatus::Pending;
                entry.first_seen = now;
                entry.timestamp = now;
                true
            }
            _ => false,
        }
    }

    /// Local mirror of the store's `mark_read`.
    pub fn mark_read_for(&mut self, user_id: &UserId) {
        for entry in &mut self.entries {
            if &entry.recipient_id == user_id {
                entry.read = true;
            }
        }
    }

    /// Overwrite an entry with the store's canonical fields and move it to
    /// its canonical position.
    fn absorb_canonical(&mut self, idx: usize, message: &Message) {
        let mut entry = self.entries.remove(idx);
        entry.id = Some(message.id);
        entry.sequence = Some(message.sequence);
        entry.timestamp = message.created_at;
        entry.read = message.read;
        entry.status = EntryStatus::Durable;
        let pos = self.insert_position(&entry);
        self.entries.insert(pos, entry);
    }

    fn fresh_key(&mut self) -> EntryKey {
        self.next_key += 1;
        EntryKey(self.next_key)
    }

    /// Provisional identity: same sender and content, timestamps within the
    /// reconciliation window, and not yet durably identified. Failed entries
    /// still match so a late store echo resolves them.
    fn provisional_match(
        &self,
        sender_id: &UserId,
        content: &str,
        timestamp: DateTime<Utc>,
    ) -> Option<usize> {
        self.entries.iter().position(|e| {
            e.id.is_none()
                && &e.sender_id == sender_id
                && e.content == content
                && (e.timestamp - timestamp).abs() <= self.window
        })
    }

    /// Ordering: timestamp ascending; ties break by store sequence when both
    /// sides have one, else by insertion order (append after equals).
    fn insert_position(&self, entry: &ViewEntry) -> usize {
        self.entries
            .iter()
            .position(|existing| match entry.timestamp.cmp(&existing.timestamp) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Greater => false,
                std::cmp::Ordering::Equal => match (entry.sequence, existing.sequence) {
                    (Some(a), Some(b)) => a < b,
                    _ => false,
                },
            })
            .unwrap_or(self.entries.len())
    }
}
