#![allow(dead_code)]

//! In-process socket server for integration tests.
//!
//! Speaks the real wire protocol over [`ChannelWire`] pairs and persists
//! through the same [`MemoryStore`] the views subscribe to, so every test
//! exercises the genuine dual-delivery situation: each message reaches a
//! view twice, once over the socket and once through the store subscription.

use chat_core::error::ChatResult;
use chat_core::models::{ConversationId, UserId};
use chat_core::store::{MemoryStore, MessageStore};
use chat_core::transport::wire::{ChannelReceiver, ChannelSender};
use chat_core::transport::{
    ChannelWire, TransportClient, TransportEvent, WireEvent, WireMessage, WireReceiver, WireSender,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

type Clients = Arc<Mutex<HashMap<UserId, ChannelSender>>>;

pub struct FakeServer {
    store: Arc<MemoryStore>,
    clients: Clients,
    denied: Arc<Mutex<HashSet<UserId>>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            clients: Arc::new(Mutex::new(HashMap::new())),
            denied: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn store(&self) -> Arc<MemoryStore> {
        Arc::clone(&self.store)
    }

    /// Make the next handshake for `user` fail with `auth_error`.
    pub async fn deny(&self, user: &str) {
        self.denied.lock().await.insert(UserId::new(user));
    }

    /// Open a connection and run the client handshake to completion.
    pub async fn connect(
        &self,
        user: &str,
        display_name: &str,
    ) -> ChatResult<(TransportClient, mpsc::UnboundedReceiver<TransportEvent>)> {
        let ((client_tx, client_rx), (server_tx, server_rx)) = ChannelWire::pair();
        tokio::spawn(serve(
            Arc::clone(&self.store),
            Arc::clone(&self.clients),
            Arc::clone(&self.denied),
            server_tx,
            server_rx,
        ));
        TransportClient::connect(client_tx, client_rx, UserId::new(user), display_name).await
    }
}

async fn serve(
    store: Arc<MemoryStore>,
    clients: Clients,
    denied: Arc<Mutex<HashSet<UserId>>>,
    mut tx: ChannelSender,
    mut rx: ChannelReceiver,
) {
    let user = match rx.recv().await {
        Ok(Some(WireEvent::Authenticate { user_id, .. })) => {
            if denied.lock().await.contains(&user_id) {
                let _ = tx
                    .send(WireEvent::AuthError {
                        message: "authentication rejected".into(),
                    })
                    .await;
                return;
            }
            if tx.send(WireEvent::Authenticated).await.is_err() {
                return;
            }
            user_id
        }
        _ => return,
    };
    clients.lock().await.insert(user.clone(), tx);

    while let Ok(Some(frame)) = rx.recv().await {
        match frame {
            WireEvent::SendMessage { message } => {
                handle_send(&store, &clients, &user, message).await;
            }
            WireEvent::Typing {
                recipient_id,
                is_typing,
            } => {
                let conversation_id = ConversationId::direct(&user, &recipient_id).ok();
                send_to(
                    &clients,
                    &recipient_id,
                    WireEvent::UserTyping {
                        user_id: user.clone(),
                        is_typing,
                        conversation_id,
                    },
                )
                .await;
            }
            WireEvent::MarkAsRead { conversation_id } => {
                let _ = store.mark_read(&user, &conversation_id).await;
            }
            WireEvent::Disconnect => break,
            _ => {}
        }
    }
    clients.lock().await.remove(&user);
}

async fn handle_send(
    store: &Arc<MemoryStore>,
    clients: &Clients,
    sender: &UserId,
    message: WireMessage,
) {
    let conversation_id = match message.conversation_id.clone() {
        Some(id) => id,
        None => match ConversationId::direct(sender, &message.recipient_id) {
            Ok(id) => id,
            Err(e) => {
                send_to(
                    clients,
                    sender,
                    WireEvent::Error {
                        message: e.to_string(),
                    },
                )
                .await;
                return;
            }
        },
    };

    if store.create_direct(sender, &message.recipient_id).await.is_err() {
        send_to(
            clients,
            sender,
            WireEvent::Error {
                message: "invalid conversation".into(),
            },
        )
        .await;
        return;
    }

    match store
        .append(&conversation_id, sender, &message.recipient_id, &message.content)
        .await
    {
        Ok(stored) => {
            let wire = WireMessage {
                id: Some(stored.id),
                sender_id: stored.sender_id.clone(),
                recipient_id: stored.recipient_id.clone(),
                content: stored.content.clone(),
                timestamp: stored.created_at,
                conversation_id: Some(stored.conversation_id.clone()),
                sequence: Some(stored.sequence),
            };
            send_to(
                clients,
                sender,
                WireEvent::MessageSent {
                    message: wire.clone(),
                },
            )
            .await;
            send_to(
                clients,
                &stored.recipient_id,
                WireEvent::NewMessage { message: wire },
            )
            .await;
        }
        Err(e) => {
            send_to(
                clients,
                sender,
                WireEvent::Error {
                    message: e.to_string(),
                },
            )
            .await;
        }
    }
}

async fn send_to(clients: &Clients, user: &UserId, event: WireEvent) {
    let mut map = clients.lock().await;
    if let Some(tx) = map.get_mut(user) {
        let _ = tx.send(event).await;
    }
}

/// Poll a view until its merged entries satisfy `pred`, or fail the test.
pub async fn wait_for_entries<F>(
    view: &chat_core::reconcile::ConversationView,
    pred: F,
) -> Vec<chat_core::reconcile::ViewEntry>
where
    F: Fn(&[chat_core::reconcile::ViewEntry]) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let entries = view.entries().await.expect("view closed");
        if pred(&entries) {
            return entries;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached; entries: {entries:#?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
