//! Reconciliation: merging the store's durable history with transport push
//! events into one consistent per-conversation view.

pub mod engine;
pub mod view;

pub use engine::{Applied, EntryKey, EntryStatus, ReconcileEngine, ViewEntry};
pub use view::ConversationView;
