//! Integration tests for the durable replica: upsert identity, ordering,
//! conversation derivation, incremental diff, and the logout wipe.

use tidemark::records::{Contact, Message, ThreadKind};
use tidemark::store::LocalStore;

fn message(id: &str, sender: &str, recipient: &str, created_at: i64) -> Message {
    Message {
        id: id.to_string(),
        conversation_id: String::new(),
        sender_id: sender.to_string(),
        recipient_id: recipient.to_string(),
        body: Some("hi".to_string()),
        created_at,
        read_at: None,
        delivered_at: None,
        edited_at: None,
        deleted_at: None,
        thread: ThreadKind::Direct,
        reactions: Vec::new(),
    }
}

#[tokio::test]
async fn derived_conversation_is_queryable() {
    let store = LocalStore::open_in_memory().unwrap();
    store.put_message(&message("m1", "u1", "u2", 100)).await;

    let messages = store.conversation_messages("u1:u2").await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, "m1");
    assert_eq!(messages[0].conversation_id, "u1:u2");
}

#[tokio::test]
async fn derivation_is_symmetric_across_directions() {
    let store = LocalStore::open_in_memory().unwrap();
    store.put_message(&message("m1", "u1", "u2", 100)).await;
    store.put_message(&message("m2", "u2", "u1", 200)).await;

    let messages = store.conversation_messages("u1:u2").await;
    assert_eq!(messages.len(), 2);
}

#[tokio::test]
async fn reads_sort_ascending_regardless_of_insertion_order() {
    let store = LocalStore::open_in_memory().unwrap();
    store.put_message(&message("m1", "u1", "u2", 100)).await;
    store.put_message(&message("m2", "u1", "u2", 50)).await;

    let messages = store.conversation_messages("u1:u2").await;
    let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, ["m2", "m1"]);
}

#[tokio::test]
async fn equal_timestamps_tie_break_on_id() {
    let store = LocalStore::open_in_memory().unwrap();
    store.put_message(&message("mb", "u1", "u2", 100)).await;
    store.put_message(&message("ma", "u1", "u2", 100)).await;

    let messages = store.conversation_messages("u1:u2").await;
    let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, ["ma", "mb"]);
}

#[tokio::test]
async fn upsert_by_id_overwrites_in_place() {
    let store = LocalStore::open_in_memory().unwrap();
    let mut msg = message("m1", "u1", "u2", 100);
    store.put_message(&msg).await;
    msg.body = Some("hi there".to_string());
    store.put_message(&msg).await;

    let messages = store.conversation_messages("u1:u2").await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].body.as_deref(), Some("hi there"));
}

#[tokio::test]
async fn replaying_the_same_put_is_idempotent() {
    let store = LocalStore::open_in_memory().unwrap();
    let msg = message("m1", "u1", "u2", 100);
    for _ in 0..5 {
        store.put_message(&msg).await;
    }
    let messages = store.conversation_messages("u1:u2").await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0], {
        let mut expected = msg.clone();
        expected.conversation_id = "u1:u2".to_string();
        expected
    });
}

#[tokio::test]
async fn batch_put_matches_single_puts() {
    let store = LocalStore::open_in_memory().unwrap();
    let batch: Vec<Message> = (0..10)
        .map(|i| message(&format!("m{i}"), "u1", "u2", 100 + i))
        .collect();
    store.put_messages(&batch).await;

    assert_eq!(store.conversation_messages("u1:u2").await.len(), 10);
    let conv = store.conversation("u1:u2").await.unwrap();
    assert_eq!(conv.last_message_at, 109);
}

#[tokio::test]
async fn messages_since_is_an_incremental_diff() {
    let store = LocalStore::open_in_memory().unwrap();
    store.put_message(&message("m1", "u1", "u2", 100)).await;
    store.put_message(&message("m2", "u1", "u2", 200)).await;

    let diff = store.messages_since(150).await;
    assert_eq!(diff.len(), 1);
    assert_eq!(diff[0].id, "m2");

    // An old message edited after the watermark re-enters the diff.
    let mut edited = message("m1", "u1", "u2", 100);
    edited.body = Some("edited".to_string());
    edited.edited_at = Some(300);
    store.put_message(&edited).await;

    let diff = store.messages_since(150).await;
    let ids: Vec<&str> = diff.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, ["m1", "m2"]);

    // Deletion after the watermark keeps the tombstone visible to sync.
    store.mark_message_deleted("m1", 400).await;
    let diff = store.messages_since(350).await;
    assert_eq!(diff.len(), 1);
    assert_eq!(diff[0].id, "m1");
    assert!(diff[0].body.is_none());
}

#[tokio::test]
async fn conversations_sort_by_recency() {
    let store = LocalStore::open_in_memory().unwrap();
    store.put_message(&message("m1", "u1", "u2", 100)).await;
    store.put_message(&message("m2", "u1", "u3", 300)).await;
    store.put_message(&message("m3", "u1", "u4", 200)).await;

    let conversations = store.conversations_by_recency().await;
    let ids: Vec<&str> = conversations.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, ["u1:u3", "u1:u4", "u1:u2"]);
}

#[tokio::test]
async fn contacts_are_indexed_by_org_and_name() {
    let store = LocalStore::open_in_memory().unwrap();
    let contact = |id: &str, org: &str, name: &str| Contact {
        id: id.to_string(),
        org_id: org.to_string(),
        display_name: name.to_string(),
        email: None,
        avatar_url: None,
        updated_at: 1,
    };
    store
        .put_contacts(&[
            contact("c1", "org-1", "Zoe"),
            contact("c2", "org-1", "Ana"),
            contact("c3", "org-2", "Mel"),
        ])
        .await;

    let names: Vec<String> = store
        .contacts_by_org("org-1")
        .await
        .into_iter()
        .map(|c| c.display_name)
        .collect();
    assert_eq!(names, ["Ana", "Zoe"]);
    assert_eq!(store.contact("c3").await.unwrap().org_id, "org-2");
}

#[tokio::test]
async fn clear_all_wipes_every_collection() {
    let store = LocalStore::open_in_memory().unwrap();
    store.set_session_user("u1").await;
    store.set_cursor("messages", "cur-1").await;
    store.set_last_sync_at(500).await;
    store.put_message(&message("m1", "u1", "u2", 100)).await;
    store
        .put_contacts(&[Contact {
            id: "c1".to_string(),
            org_id: "org-1".to_string(),
            display_name: "Ana".to_string(),
            email: None,
            avatar_url: None,
            updated_at: 1,
        }])
        .await;
    store
        .put_assistant_message(&tidemark::records::AssistantMessage {
            id: "a1".to_string(),
            sender_id: "u1".to_string(),
            body: Some("ask".to_string()),
            created_at: 100,
            read_at: None,
            edited_at: None,
            deleted_at: None,
        })
        .await;

    store.clear_all().await;

    let stats = store.stats().await;
    assert_eq!(stats.messages, 0);
    assert_eq!(stats.conversations, 0);
    assert_eq!(stats.contacts, 0);
    assert_eq!(stats.assistant_messages, 0);
    assert_eq!(stats.meta_entries, 0);
    assert!(stats.last_sync_at.is_none());
    assert!(store.cursor("messages").await.is_none());
    assert!(store.session_user().await.is_none());
}

#[tokio::test]
async fn stats_count_each_collection() {
    let store = LocalStore::open_in_memory().unwrap();
    store.put_message(&message("m1", "u1", "u2", 100)).await;
    store.put_message(&message("m2", "u3", "u4", 100)).await;
    store.set_last_sync_at(900).await;

    let stats = store.stats().await;
    assert_eq!(stats.messages, 2);
    assert_eq!(stats.conversations, 2);
    assert_eq!(stats.last_sync_at, Some(900));
}

#[tokio::test]
async fn empty_reads_are_not_errors() {
    let store = LocalStore::open_in_memory().unwrap();
    assert!(store.conversation_messages("nope").await.is_empty());
    assert!(store.message("nope").await.is_none());
    assert!(store.conversation("nope").await.is_none());
    assert!(store.conversations_by_recency().await.is_empty());
    assert!(store.messages_since(0).await.is_empty());
    // Receipt for an unknown id is a silent no-op.
    store.mark_message_read("nope", 100).await;
    store.mark_message_deleted("nope", 100).await;
}
