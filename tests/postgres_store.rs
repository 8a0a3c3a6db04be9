//! Contract tests for the Postgres store. They need a live database, so they
//! are ignored by default: set DATABASE_URL to a disposable test database and
//! run `cargo test -- --ignored`.

use chat_core::error::ChatError;
use chat_core::models::UserId;
use chat_core::store::{MessageStore, PostgresStore};
use std::env;
use uuid::Uuid;

async fn store() -> PostgresStore {
    let url = env::var("DATABASE_URL").expect("DATABASE_URL must point at a test database");
    PostgresStore::connect(&url).await.expect("connect + migrate")
}

// Fresh participants per run; conversation ids derive from user ids, so
// reruns never collide with leftover rows.
fn unique_user(tag: &str) -> UserId {
    UserId::new(format!("{tag}-{}", Uuid::new_v4()))
}

#[tokio::test]
#[ignore]
async fn create_direct_is_idempotent_and_canonical() {
    let store = store().await;
    let a = unique_user("alice");
    let b = unique_user("bob");
    let first = store.create_direct(&a, &b).await.unwrap();
    let second = store.create_direct(&b, &a).await.unwrap();
    assert_eq!(first.id, second.id);
    assert!(first.is_participant(&a) && first.is_participant(&b));
}

#[tokio::test]
#[ignore]
async fn full_delivery_cycle() {
    let store = store().await;
    let a = unique_user("alice");
    let b = unique_user("bob");
    let conv = store.create_direct(&a, &b).await.unwrap();

    let mut sub = store.subscribe(&conv.id, 0).await.unwrap();
    let m1 = store.append(&conv.id, &a, &b, "one").await.unwrap();
    let m2 = store.append(&conv.id, &b, &a, "two").await.unwrap();
    assert_eq!(m1.sequence, 1);
    assert_eq!(m2.sequence, 2);
    assert!(m2.created_at > m1.created_at);

    assert_eq!(sub.recv().await.unwrap().id, m1.id);
    assert_eq!(sub.recv().await.unwrap().id, m2.id);

    assert_eq!(store.unread_count(&b, &conv.id).await.unwrap(), 1);
    store.mark_read(&b, &conv.id).await.unwrap();
    store.mark_read(&b, &conv.id).await.unwrap();
    assert_eq!(store.unread_count(&b, &conv.id).await.unwrap(), 0);

    let history = store.history(&conv.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].read);
    assert!(!history[1].read);

    let summaries = store.conversations_for(&a).await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].conversation.last_message.as_deref(), Some("two"));
    assert_eq!(summaries[0].unread_count, 1);
}

#[tokio::test]
#[ignore]
async fn append_rejects_outsiders_and_empty_content() {
    let store = store().await;
    let a = unique_user("alice");
    let b = unique_user("bob");
    let conv = store.create_direct(&a, &b).await.unwrap();

    assert!(matches!(
        store.append(&conv.id, &a, &b, "  ").await,
        Err(ChatError::EmptyContent)
    ));
    let mallory = unique_user("mallory");
    assert!(matches!(
        store.append(&conv.id, &mallory, &b, "hi").await,
        Err(ChatError::Unauthorized)
    ));
    assert!(store.history(&conv.id).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore]
async fn subscription_resumes_without_duplicates() {
    let store = store().await;
    let a = unique_user("alice");
    let b = unique_user("bob");
    let conv = store.create_direct(&a, &b).await.unwrap();

    store.append(&conv.id, &a, &b, "one").await.unwrap();
    store.append(&conv.id, &a, &b, "two").await.unwrap();

    let mut sub = store.subscribe(&conv.id, 0).await.unwrap();
    assert_eq!(sub.recv().await.unwrap().sequence, 1);
    assert_eq!(sub.recv().await.unwrap().sequence, 2);

    let mut resumed = store.subscribe(&conv.id, sub.last_sequence()).await.unwrap();
    store.append(&conv.id, &b, &a, "three").await.unwrap();
    assert_eq!(resumed.recv().await.unwrap().sequence, 3);
}
