//! Socket protocol frames.
//!
//! One JSON object per frame, discriminated by `type`. Field names follow
//! the socket server's event payloads.

use crate::error::{ChatError, ChatResult};
use crate::models::{ConversationId, MessageId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Message payload as carried on the wire. `id` and `sequence` are present
/// only once the server has persisted the message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireEvent {
    #[serde(rename = "authenticate")]
    Authenticate {
        user_id: UserId,
        display_name: String,
    },
    #[serde(rename = "authenticated")]
    Authenticated,
    #[serde(rename = "auth_error")]
    AuthError { message: String },
    #[serde(rename = "send_message")]
    SendMessage {
        #[serde(flatten)]
        message: WireMessage,
    },
    #[serde(rename = "new_message")]
    NewMessage {
        #[serde(flatten)]
        message: WireMessage,
    },
    #[serde(rename = "message_sent")]
    MessageSent {
        #[serde(flatten)]
        message: WireMessage,
    },
    #[serde(rename = "typing")]
    Typing {
        recipient_id: UserId,
        is_typing: bool,
    },
    #[serde(rename = "user_typing")]
    UserTyping {
        user_id: UserId,
        is_typing: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
    },
    #[serde(rename = "mark_as_read")]
    MarkAsRead { conversation_id: ConversationId },
    #[serde(rename = "disconnect")]
    Disconnect,
    #[serde(rename = "error")]
    Error { message: String },
}

/// Write half of a socket connection.
#[async_trait]
pub trait WireSender: Send + 'static {
    async fn send(&mut self, event: WireEvent) -> ChatResult<()>;
}

/// Read half of a socket connection. `Ok(None)` is a clean close.
#[async_trait]
pub trait WireReceiver: Send + 'static {
    async fn recv(&mut self) -> ChatResult<Option<WireEvent>>;
}

/// In-process wire over channels. Used by tests and by embedded fake
/// servers; `pair()` yields the client-side and server-side halves of one
/// connection.
pub struct ChannelWire;

pub struct ChannelSender(mpsc::UnboundedSender<WireEvent>);
pub struct ChannelReceiver(mpsc::UnboundedReceiver<WireEvent>);

impl ChannelWire {
    #[allow(clippy::type_complexity)]
    pub fn pair() -> (
        (ChannelSender, ChannelReceiver),
        (ChannelSender, ChannelReceiver),
    ) {
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        (
            (ChannelSender(client_tx), ChannelReceiver(client_rx)),
            (ChannelSender(server_tx), ChannelReceiver(server_rx)),
        )
    }
}

#[async_trait]
impl WireSender for ChannelSender {
    async fn send(&mut self, event: WireEvent) -> ChatResult<()> {
        self.0
            .send(event)
            .map_err(|_| ChatError::Transport("peer closed".into()))
    }
}

#[async_trait]
impl WireReceiver for ChannelReceiver {
    async fn recv(&mut self) -> ChatResult<Option<WireEvent>> {
        Ok(self.0.recv().await)
    }
}
