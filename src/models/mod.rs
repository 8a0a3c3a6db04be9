pub mod conversation;
pub mod message;
pub mod user;

pub use conversation::{ConversationId, ConversationRecord, ConversationSummary};
pub use message::{Message, MessageId};
pub use user::{UserDirectory, UserId, UserProfile};
