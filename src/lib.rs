//! chat-core: reliable, ordered, deduplicated direct-message delivery over
//! two transports — a durable message store (source of truth) and a
//! low-latency socket push channel — with per-conversation unread counters
//! and typing presence.
//!
//! The [`reconcile::ConversationView`] actor is the entry point: it merges
//! the store subscription and transport events into one consistent,
//! growing sequence per conversation.

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod presence;
pub mod reconcile;
pub mod retry;
pub mod store;
pub mod transport;
pub mod unread;

pub use config::Config;
pub use error::{ChatError, ChatResult, ErrorKind};
pub use models::{ConversationId, Message, MessageId, UserId, UserProfile};
pub use presence::TypingTracker;
pub use reconcile::{ConversationView, EntryKey, EntryStatus, ViewEntry};
pub use store::{MemoryStore, MessageStore, PostgresStore, Subscription};
pub use transport::{ConnectionState, TransportClient, TransportEvent};
pub use unread::UnreadCounters;
