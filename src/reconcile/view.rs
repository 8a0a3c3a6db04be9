//! One actor per open conversation view.
//!
//! The actor owns the store subscription and the transport event feed,
//! folds both into the [`ReconcileEngine`], and drives the send path:
//! transport first while connected, direct store append otherwise. All
//! resources are scoped to the actor task; closing (or dropping) the view
//! releases the subscription and the task on every exit path.

use crate::config::Config;
use crate::error::{ChatError, ChatResult};
use crate::models::{ConversationId, UserId};
use crate::presence::TypingTracker;
use crate::reconcile::engine::{EntryKey, EntryStatus, ReconcileEngine, ViewEntry};
use crate::retry::{with_retry, RetryConfig};
use crate::store::{MessageStore, Subscription};
use crate::transport::{TransportClient, TransportEvent};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

enum Command {
    Send {
        content: String,
        reply: oneshot::Sender<ChatResult<EntryKey>>,
    },
    Retry {
        key: EntryKey,
        reply: oneshot::Sender<ChatResult<()>>,
    },
    MarkRead {
        reply: oneshot::Sender<ChatResult<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<ViewEntry>>,
    },
    SetTyping {
        is_typing: bool,
    },
    PeerTyping {
        reply: oneshot::Sender<bool>,
    },
    Close,
}

pub struct ConversationView {
    conversation_id: ConversationId,
    cmd_tx: mpsc::UnboundedSender<Command>,
    updates: watch::Receiver<u64>,
    task: Option<JoinHandle<()>>,
}

impl ConversationView {
    /// Open a view of the direct conversation between `me` and `peer`.
    ///
    /// Creates the canonical conversation when it does not exist yet, then
    /// subscribes to the store from sequence 0. `transport` is optional:
    /// without it (or after it disconnects) the view runs in store-only
    /// mode — higher latency, same durability.
    pub async fn open(
        store: Arc<dyn MessageStore>,
        transport: Option<(TransportClient, mpsc::UnboundedReceiver<TransportEvent>)>,
        me: UserId,
        peer: UserId,
        config: &Config,
    ) -> ChatResult<ConversationView> {
        let record = store.create_direct(&me, &peer).await?;
        let subscription = store.subscribe(&record.id, 0).await?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (updates_tx, updates_rx) = watch::channel(0);

        let (transport, transport_events) = match transport {
            Some((client, events)) => (Some(client), Some(events)),
            None => (None, None),
        };

        let engine =
            ReconcileEngine::new(me.clone(), config.reconcile_window, config.resolve_timeout);
        let actor = Actor {
            store,
            transport,
            me,
            peer,
            conversation_id: record.id.clone(),
            engine,
            typing: TypingTracker::new(config.typing_expiry),
            reconcile_window: config.reconcile_window,
            retry: config.retry.clone(),
            in_flight: HashMap::new(),
            updates: updates_tx,
        };

        let task = tokio::spawn(actor.run(subscription, transport_events, cmd_rx));

        Ok(ConversationView {
            conversation_id: record.id,
            cmd_tx,
            updates: updates_rx,
            task: Some(task),
        })
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Bumped on every change to the merged view; callers re-query
    /// `entries` when it ticks.
    pub fn updates(&self) -> watch::Receiver<u64> {
        self.updates.clone()
    }

    /// Send a message: one optimistic entry, one eventual durable record.
    pub async fn send(&self, content: impl Into<String>) -> ChatResult<EntryKey> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send {
                content: content.into(),
                reply,
            })
            .map_err(|_| ChatError::Disconnected)?;
        rx.await.map_err(|_| ChatError::Disconnected)?
    }

    /// Resubmit a failed entry.
    pub async fn retry(&self, key: EntryKey) -> ChatResult<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Retry { key, reply })
            .map_err(|_| ChatError::Disconnected)?;
        rx.await.map_err(|_| ChatError::Disconnected)?
    }

    pub async fn mark_read(&self) -> ChatResult<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::MarkRead { reply })
            .map_err(|_| ChatError::Disconnected)?;
        rx.await.map_err(|_| ChatError::Disconnected)?
    }

    /// Current merged view, ordered per the reconciliation rules.
    pub async fn entries(&self) -> ChatResult<Vec<ViewEntry>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Snapshot { reply })
            .map_err(|_| ChatError::Disconnected)?;
        rx.await.map_err(|_| ChatError::Disconnected)
    }

    /// Best-effort typing signal to the peer; a no-op in store-only mode.
    pub fn set_typing(&self, is_typing: bool) {
        let _ = self.cmd_tx.send(Command::SetTyping { is_typing });
    }

    pub async fn peer_typing(&self) -> ChatResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::PeerTyping { reply })
            .map_err(|_| ChatError::Disconnected)?;
        rx.await.map_err(|_| ChatError::Disconnected)
    }

    /// Orderly shutdown; also happens on drop.
    pub async fn close(mut self) {
        let _ = self.cmd_tx.send(Command::Close);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ConversationView {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Close);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Actor {
    store: Arc<dyn MessageStore>,
    transport: Option<TransportClient>,
    me: UserId,
    peer: UserId,
    conversation_id: ConversationId,
    engine: ReconcileEngine,
    typing: TypingTracker,
    reconcile_window: Duration,
    retry: RetryConfig,
    /// Entries fired via transport, awaiting a durable echo.
    in_flight: HashMap<EntryKey, DateTime<Utc>>,
    updates: watch::Sender<u64>,
}

impl Actor {
    async fn run(
        mut self,
        subscription: Subscription,
        transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    ) {
        let mut subscription = Some(subscription);
        let mut transport_events = transport_events;
        let mut tick = tokio::time::interval(Duration::from_millis(500));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                message = next_store_message(&mut subscription) => {
                    match message {
                        Some(m) => {
                            self.engine.apply_store(&m);
                            self.bump();
                        }
                        None => {
                            warn!(conversation = %self.conversation_id, "store subscription ended");
                            subscription = None;
                        }
                    }
                }
                event = next_transport_event(&mut transport_events) => {
                    match event {
                        Some(ev) => self.on_transport_event(ev).await,
                        None => transport_events = None,
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Close) | None => break,
                        Some(cmd) => self.on_command(cmd).await,
                    }
                }
                _ = tick.tick() => {
                    self.settle_in_flight().await;
                    let now = Utc::now();
                    let before = self.engine.entries().len();
                    let failed = self.engine.expire(now);
                    if !failed.is_empty() {
                        for key in &failed {
                            self.in_flight.remove(key);
                        }
                        warn!(conversation = %self.conversation_id, count = failed.len(),
                            "entries failed to resolve; retry available");
                    }
                    // expire may also have dropped unconfirmed remote copies
                    if !failed.is_empty() || self.engine.entries().len() != before {
                        self.bump();
                    }
                }
            }
        }
        // Subscription and transport feed drop here, releasing their
        // registrations on every exit path.
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::MessageReceived(message) | TransportEvent::MessageEchoed(message) => {
                if message
                    .conversation_id
                    .as_ref()
                    .is_some_and(|c| c != &self.conversation_id)
                {
                    return;
                }
                self.engine.apply_transport(&message, Utc::now());
                self.bump();
            }
            TransportEvent::TypingChanged {
                user_id,
                is_typing,
                conversation_id,
            } => {
                if conversation_id
                    .as_ref()
                    .is_some_and(|c| c != &self.conversation_id)
                {
                    return;
                }
                self.typing
                    .set_typing(&self.conversation_id, &user_id, is_typing)
                    .await;
            }
            TransportEvent::AuthError(message) => {
                warn!(%message, "transport auth error; falling back to store-only mode");
                self.transport = None;
            }
            TransportEvent::Disconnected => {
                debug!(conversation = %self.conversation_id,
                    "transport disconnected; store-only mode until reconnect");
                self.transport = None;
            }
        }
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send { content, reply } => {
                let _ = reply.send(self.send_message(content).await);
            }
            Command::Retry { key, reply } => {
                let _ = reply.send(self.retry_entry(key).await);
            }
            Command::MarkRead { reply } => {
                let _ = reply.send(self.mark_read().await);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.engine.entries().to_vec());
            }
            Command::SetTyping { is_typing } => {
                if let Some(transport) = &self.transport {
                    if let Err(e) = transport.set_typing(&self.peer, is_typing).await {
                        debug!(error = %e, "typing signal dropped");
                    }
                }
            }
            Command::PeerTyping { reply } => {
                let _ = reply.send(self.typing.is_typing(&self.conversation_id, &self.peer).await);
            }
            Command::Close => unreachable!("handled in the loop"),
        }
    }

    /// Validation, one optimistic entry, then transport-first dispatch.
    async fn send_message(&mut self, content: String) -> ChatResult<EntryKey> {
        if content.trim().is_empty() {
            return Err(ChatError::EmptyContent);
        }
        let now = Utc::now();
        let key = self
            .engine
            .push_local(self.me.clone(), self.peer.clone(), content.clone(), now);
        self.bump();
        self.dispatch(key, &content, now).await;
        Ok(key)
    }

    async fn retry_entry(&mut self, key: EntryKey) -> ChatResult<()> {
        let now = Utc::now();
        if !self.engine.rearm(key, now) {
            return Err(ChatError::DeliveryFailed);
        }
        let content = self
            .engine
            .get(key)
            .map(|e| e.content.clone())
            .ok_or(ChatError::DeliveryFailed)?;
        self.bump();
        self.dispatch(key, &content, now).await;
        Ok(())
    }

    /// Durable reset first; the socket notification is advisory.
    async fn mark_read(&mut self) -> ChatResult<()> {
        with_retry(&self.retry, || {
            self.store.mark_read(&self.me, &self.conversation_id)
        })
        .await?;
        self.engine.mark_read_for(&self.me);
        self.bump();
        if let Some(transport) = &self.transport {
            if let Err(e) = transport.mark_read(&self.conversation_id).await {
                debug!(error = %e, "read receipt not sent over transport");
            }
        }
        Ok(())
    }

    /// Transport first while connected; direct store append otherwise.
    async fn dispatch(&mut self, key: EntryKey, content: &str, now: DateTime<Utc>) {
        if let Some(transport) = &self.transport {
            match transport
                .send(&self.peer, content, Some(&self.conversation_id))
                .await
            {
                Ok(_) => {
                    self.in_flight.insert(key, now);
                    return;
                }
                Err(e) => {
                    debug!(error = %e, "transport send failed; appending to store directly");
                }
            }
        }
        self.append_direct(key, content).await;
    }

    /// Durable fallback path. The engine folds the appended row back in, so
    /// the optimistic entry resolves exactly as if the echo had arrived.
    async fn append_direct(&mut self, key: EntryKey, content: &str) {
        let result = with_retry(&self.retry, || {
            self.store
                .append(&self.conversation_id, &self.me, &self.peer, content)
        })
        .await;
        match result {
            Ok(message) => {
                self.engine.apply_store(&message);
                self.bump();
            }
            Err(e) => {
                warn!(error = %e, "store append failed; marking entry failed");
                self.engine.fail(key);
                self.bump();
            }
        }
    }

    /// Transport sends whose echo has not shown up within the reconcile
    /// window fall back to a direct append — but only after re-checking
    /// that no durable echo arrived, so one logical message never produces
    /// two store records.
    async fn settle_in_flight(&mut self) {
        let now = Utc::now();
        let window = chrono::Duration::from_std(self.reconcile_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(5));

        let overdue: Vec<EntryKey> = self
            .in_flight
            .iter()
            .filter(|(_, sent_at)| now - **sent_at > window)
            .map(|(key, _)| *key)
            .collect();

        for key in overdue {
            self.in_flight.remove(&key);
            let entry = match self.engine.get(key) {
                Some(e) => e,
                None => continue,
            };
            if entry.status != EntryStatus::Pending {
                continue; // durable echo arrived in the meantime
            }
            let content = entry.content.clone();
            debug!(conversation = %self.conversation_id,
                "no echo within the reconcile window; falling back to store append");
            self.append_direct(key, &content).await;
        }
    }

    fn bump(&self) {
        self.updates.send_modify(|v| *v += 1);
    }
}

async fn next_store_message(
    subscription: &mut Option<Subscription>,
) -> Option<crate::models::Message> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_transport_event(
    events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, MessageStore};
    use crate::transport::wire::{ChannelReceiver, ChannelSender, ChannelWire, WireEvent, WireMessage, WireReceiver, WireSender};

    /// Authenticated transport over an in-process wire; the returned server
    /// halves keep the connection alive and let the test inject frames.
    async fn scripted_transport(
        user: &str,
    ) -> (
        TransportClient,
        mpsc::UnboundedReceiver<TransportEvent>,
        ChannelSender,
        ChannelReceiver,
    ) {
        let ((client_tx, client_rx), (mut server_tx, mut server_rx)) = ChannelWire::pair();
        let handshake = tokio::spawn(async move {
            match server_rx.recv().await.unwrap() {
                Some(WireEvent::Authenticate { .. }) => {
                    server_tx.send(WireEvent::Authenticated).await.unwrap();
                }
                other => panic!("expected authenticate, got {other:?}"),
            }
            (server_tx, server_rx)
        });
        let (client, events) =
            TransportClient::connect(client_tx, client_rx, UserId::new(user), user)
                .await
                .unwrap();
        let (server_tx, server_rx) = handshake.await.unwrap();
        (client, events, server_tx, server_rx)
    }

    fn push(sender: &str, recipient: &str, content: &str) -> WireEvent {
        WireEvent::NewMessage {
            message: WireMessage {
                id: None,
                sender_id: UserId::new(sender),
                recipient_id: UserId::new(recipient),
                content: content.to_string(),
                timestamp: Utc::now(),
                conversation_id: None,
                sequence: None,
            },
        }
    }

    async fn entries_where<F>(view: &ConversationView, pred: F) -> Vec<ViewEntry>
    where
        F: Fn(&[ViewEntry]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let entries = view.entries().await.expect("view closed");
            if pred(&entries) {
                return entries;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached: {entries:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn unresolved_remote_push_is_never_resent_as_our_own() {
        let (client, events, mut server_tx, _server_rx) = scripted_transport("alice").await;
        let store = Arc::new(MemoryStore::new());
        let config = Config {
            resolve_timeout: Duration::from_millis(200),
            ..Config::default()
        };
        let view = ConversationView::open(
            store.clone(),
            Some((client, events)),
            UserId::new("alice"),
            UserId::new("bob"),
            &config,
        )
        .await
        .unwrap();

        // a push from bob whose durable record never materializes
        server_tx.send(push("bob", "alice", "bob's words")).await.unwrap();
        let entries = entries_where(&view, |e| e.len() == 1).await;
        let key = entries[0].key;
        assert_eq!(entries[0].sender_id, UserId::new("bob"));

        // past the resolve timeout the copy is dropped, not marked retryable
        entries_where(&view, |e| e.is_empty()).await;
        assert!(matches!(
            view.retry(key).await,
            Err(ChatError::DeliveryFailed)
        ));
        assert!(store.history(view.conversation_id()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn typing_for_another_conversation_is_ignored() {
        let (client, events, mut server_tx, _server_rx) = scripted_transport("alice").await;
        let store = Arc::new(MemoryStore::new());
        let view = ConversationView::open(
            store,
            Some((client, events)),
            UserId::new("alice"),
            UserId::new("bob"),
            &Config::default(),
        )
        .await
        .unwrap();

        server_tx
            .send(WireEvent::UserTyping {
                user_id: UserId::new("bob"),
                is_typing: true,
                conversation_id: Some(ConversationId::from_raw("bob_carol")),
            })
            .await
            .unwrap();
        // the feed is ordered: once the follow-up push is visible, the
        // typing frame above has been processed
        server_tx.send(push("bob", "alice", "sentinel")).await.unwrap();
        entries_where(&view, |e| e.len() == 1).await;
        assert!(!view.peer_typing().await.unwrap());

        let here = ConversationId::direct(&UserId::new("alice"), &UserId::new("bob")).unwrap();
        server_tx
            .send(WireEvent::UserTyping {
                user_id: UserId::new("bob"),
                is_typing: true,
                conversation_id: Some(here),
            })
            .await
            .unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !view.peer_typing().await.unwrap() {
            assert!(tokio::time::Instant::now() < deadline, "typing never arrived");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
