//! Push transport client.
//!
//! One authenticated socket connection per user session. Delivery is
//! at-most-once and unordered relative to the store; the store subscription,
//! not the transport, is the recovery path after a disconnect. Reconnection
//! is caller-driven: open a fresh wire and call [`TransportClient::connect`]
//! again.

use crate::error::{ChatError, ChatResult};
use crate::models::{ConversationId, UserId};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::warn;

pub mod wire;
pub mod ws;

pub use wire::{ChannelWire, WireEvent, WireMessage, WireReceiver, WireSender};

/// Observable lifecycle of a client handle. The connect-and-authenticate
/// handshake runs to completion inside [`TransportClient::connect`], so a
/// handle is `Ready` from birth; any transport error lands it in
/// `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Ready,
    Disconnected,
}

/// Events emitted while the connection is `Ready`.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    MessageReceived(WireMessage),
    /// Confirmation of one of our own sent messages.
    MessageEchoed(WireMessage),
    TypingChanged {
        user_id: UserId,
        is_typing: bool,
        conversation_id: Option<ConversationId>,
    },
    AuthError(String),
    Disconnected,
}

struct Inner {
    user_id: UserId,
    sender: Mutex<Box<dyn WireSender>>,
    state: RwLock<ConnectionState>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.reader.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

#[derive(Clone)]
pub struct TransportClient {
    inner: Arc<Inner>,
}

impl TransportClient {
    /// Authenticate over an open wire and start the reader task.
    ///
    /// Authentication completes before anything else is accepted: the
    /// returned client is `Ready`, and a rejected handshake surfaces as
    /// `AuthRejected` without ever emitting events.
    pub async fn connect<S, R>(
        sender: S,
        mut receiver: R,
        user_id: UserId,
        display_name: &str,
    ) -> ChatResult<(TransportClient, mpsc::UnboundedReceiver<TransportEvent>)>
    where
        S: WireSender,
        R: WireReceiver,
    {
        let mut sender: Box<dyn WireSender> = Box::new(sender);
        sender
            .send(WireEvent::Authenticate {
                user_id: user_id.clone(),
                display_name: display_name.to_string(),
            })
            .await?;

        // Authenticating: nothing but the handshake outcome is accepted.
        loop {
            match receiver.recv().await? {
                Some(WireEvent::Authenticated) => break,
                Some(WireEvent::AuthError { message }) => {
                    return Err(ChatError::AuthRejected(message))
                }
                Some(other) => {
                    warn!(event = ?other, "ignoring pre-auth frame");
                }
                None => return Err(ChatError::Disconnected),
            }
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            user_id,
            sender: Mutex::new(sender),
            state: RwLock::new(ConnectionState::Ready),
            reader: std::sync::Mutex::new(None),
        });

        let state = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            read_loop(&mut receiver, &events_tx, &state).await;
        });
        if let Ok(mut guard) = inner.reader.lock() {
            *guard = Some(handle);
        }

        Ok((TransportClient { inner }, events_rx))
    }

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    pub fn user_id(&self) -> &UserId {
        &self.inner.user_id
    }

    /// Push a message to the recipient. Returns the wire payload so callers
    /// can correlate the echo; delivery is not guaranteed — the store is the
    /// durable record.
    pub async fn send(
        &self,
        recipient_id: &UserId,
        content: &str,
        conversation_id: Option<&ConversationId>,
    ) -> ChatResult<WireMessage> {
        self.ensure_ready().await?;
        let message = WireMessage {
            id: None,
            sender_id: self.inner.user_id.clone(),
            recipient_id: recipient_id.clone(),
            content: content.to_string(),
            timestamp: Utc::now(),
            conversation_id: conversation_id.cloned(),
            sequence: None,
        };
        self.send_event(WireEvent::SendMessage {
            message: message.clone(),
        })
        .await?;
        Ok(message)
    }

    pub async fn mark_read(&self, conversation_id: &ConversationId) -> ChatResult<()> {
        self.ensure_ready().await?;
        self.send_event(WireEvent::MarkAsRead {
            conversation_id: conversation_id.clone(),
        })
        .await
    }

    pub async fn set_typing(&self, recipient_id: &UserId, is_typing: bool) -> ChatResult<()> {
        self.ensure_ready().await?;
        self.send_event(WireEvent::Typing {
            recipient_id: recipient_id.clone(),
            is_typing,
        })
        .await
    }

    /// Explicit close: best-effort goodbye frame, then tear down the reader.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.write().await;
            if *state == ConnectionState::Disconnected {
                return;
            }
            *state = ConnectionState::Disconnected;
        }
        let mut sender = self.inner.sender.lock().await;
        let _ = sender.send(WireEvent::Disconnect).await;
        if let Ok(mut guard) = self.inner.reader.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }

    async fn ensure_ready(&self) -> ChatResult<()> {
        match *self.inner.state.read().await {
            ConnectionState::Ready => Ok(()),
            _ => Err(ChatError::NotAuthenticated),
        }
    }

    async fn send_event(&self, event: WireEvent) -> ChatResult<()> {
        let mut sender = self.inner.sender.lock().await;
        if let Err(e) = sender.send(event).await {
            // A failed write means the connection is gone.
            *self.inner.state.write().await = ConnectionState::Disconnected;
            return Err(e);
        }
        Ok(())
    }
}

async fn read_loop<R: WireReceiver>(
    receiver: &mut R,
    events: &mpsc::UnboundedSender<TransportEvent>,
    inner: &Inner,
) {
    loop {
        match receiver.recv().await {
            Ok(Some(event)) => match event {
                WireEvent::NewMessage { message } => {
                    let _ = events.send(TransportEvent::MessageReceived(message));
                }
                WireEvent::MessageSent { message } => {
                    let _ = events.send(TransportEvent::MessageEchoed(message));
                }
                WireEvent::UserTyping {
                    user_id,
                    is_typing,
                    conversation_id,
                } => {
                    let _ = events.send(TransportEvent::TypingChanged {
                        user_id,
                        is_typing,
                        conversation_id,
                    });
                }
                WireEvent::AuthError { message } => {
                    let _ = events.send(TransportEvent::AuthError(message));
                    break;
                }
                WireEvent::Error { message } => {
                    warn!(%message, "transport error frame");
                }
                WireEvent::Disconnect => break,
                other => {
                    warn!(event = ?other, "unexpected frame from server");
                }
            },
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "transport read failed");
                break;
            }
        }
    }
    *inner.state.write().await = ConnectionState::Disconnected;
    let _ = events.send(TransportEvent::Disconnected);
}
