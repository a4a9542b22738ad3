/// Integration tests for the store adapter
/// Exercises conversation bootstrap, the message lifecycle transitions,
/// and the unread-counter invariants through direct DB calls
use duo_chat_server::db::models::{MessageStatus, MessageType};
use duo_chat_server::db::{create_test_pool, Database, DbPool};

async fn seed_pair(pool: &DbPool) -> (String, String, String) {
    let alice = Database::create_user(pool, "alice", "ehash-a", "phash-a")
        .await
        .expect("Failed to create alice");
    let bob = Database::create_user(pool, "bob", "ehash-b", "phash-b")
        .await
        .expect("Failed to create bob");
    let conv = Database::create_conversation(pool, &alice.id, &bob.id)
        .await
        .expect("Failed to create conversation");
    (alice.id, bob.id, conv.id)
}

/// The quantified unread invariant: a participant's counter always equals
/// the number of inbound messages they have not read.
async fn assert_unread_invariant(pool: &DbPool, conv_id: &str, user_id: &str) {
    let messages = Database::list_messages(pool, conv_id, 1000)
        .await
        .expect("Failed to list messages");
    let expected = messages
        .iter()
        .filter(|m| m.sender_id != user_id && !m.read_by.contains(&user_id.to_string()))
        .count() as i64;
    let actual = Database::unread_count(pool, conv_id, user_id)
        .await
        .expect("Failed to read counter");
    assert_eq!(
        actual, expected,
        "unread counter diverged from unread inbound messages"
    );
}

#[tokio::test]
async fn test_conversation_bootstrap_workflow() {
    let pool = create_test_pool();
    let (alice_id, bob_id, conv_id) = seed_pair(&pool).await;

    // The pair resolves to the same conversation from either side
    let from_alice = Database::get_conversation_by_pair(&pool, &alice_id, &bob_id)
        .await
        .expect("Query failed")
        .expect("Conversation not found");
    let from_bob = Database::get_conversation_by_pair(&pool, &bob_id, &alice_id)
        .await
        .expect("Query failed")
        .expect("Conversation not found");
    assert_eq!(from_alice.id, conv_id);
    assert_eq!(from_bob.id, conv_id);

    // Both participants list it
    let alice_convs = Database::list_conversations_for(&pool, &alice_id)
        .await
        .expect("Query failed");
    assert_eq!(alice_convs.len(), 1);
    assert!(alice_convs[0].is_participant(&bob_id));
}

#[tokio::test]
async fn test_message_lifecycle_happy_path() {
    let pool = create_test_pool();
    let (alice_id, bob_id, conv_id) = seed_pair(&pool).await;

    let (message, unread) = Database::record_message(
        &pool,
        &conv_id,
        &alice_id,
        &bob_id,
        "hello bob",
        MessageType::Text,
    )
    .await
    .expect("Failed to record message");
    assert_eq!(message.status, MessageStatus::Sent);
    assert_eq!(unread, 1);
    assert_unread_invariant(&pool, &conv_id, &bob_id).await;

    let delivered = Database::mark_delivered(&pool, &message.id, "2026-02-01T10:00:01Z")
        .await
        .expect("Transition failed");
    assert!(delivered);

    let read = Database::mark_read(&pool, &message.id, &bob_id, "2026-02-01T10:00:02Z")
        .await
        .expect("Transition failed")
        .expect("Read should transition");
    assert_eq!(read.status, MessageStatus::Read);
    assert!(read.is_read);
    assert_eq!(read.read_by, vec![bob_id.clone()]);
    assert_eq!(read.delivered_at.as_deref(), Some("2026-02-01T10:00:01Z"));
    assert_unread_invariant(&pool, &conv_id, &bob_id).await;
}

#[tokio::test]
async fn test_status_never_regresses() {
    let pool = create_test_pool();
    let (alice_id, bob_id, conv_id) = seed_pair(&pool).await;
    let (message, _) =
        Database::record_message(&pool, &conv_id, &alice_id, &bob_id, "hi", MessageType::Text)
            .await
            .expect("Failed to record message");

    // Direct sent -> read, then a stale delivered attempt
    Database::mark_read(&pool, &message.id, &bob_id, "2026-02-01T10:00:01Z")
        .await
        .expect("Transition failed")
        .expect("Read should transition");
    let regressed = Database::mark_delivered(&pool, &message.id, "2026-02-01T10:00:02Z")
        .await
        .expect("Transition failed");
    assert!(!regressed);

    let stored = Database::get_message(&pool, &message.id)
        .await
        .expect("Query failed")
        .expect("Message not found");
    assert_eq!(stored.status, MessageStatus::Read);
    // The read stamped delivered_at; the stale attempt did not overwrite it
    assert_eq!(stored.delivered_at.as_deref(), Some("2026-02-01T10:00:01Z"));
}

#[tokio::test]
async fn test_interleaved_sends_and_reads_keep_invariant() {
    let pool = create_test_pool();
    let (alice_id, bob_id, conv_id) = seed_pair(&pool).await;

    let (m1, _) =
        Database::record_message(&pool, &conv_id, &alice_id, &bob_id, "a1", MessageType::Text)
            .await
            .expect("record");
    Database::record_message(&pool, &conv_id, &bob_id, &alice_id, "b1", MessageType::Text)
        .await
        .expect("record");
    let (m3, _) =
        Database::record_message(&pool, &conv_id, &alice_id, &bob_id, "a2", MessageType::Text)
            .await
            .expect("record");

    assert_unread_invariant(&pool, &conv_id, &alice_id).await;
    assert_unread_invariant(&pool, &conv_id, &bob_id).await;

    Database::mark_read(&pool, &m3.id, &bob_id, "2026-02-01T10:00:01Z")
        .await
        .expect("Transition failed");
    assert_unread_invariant(&pool, &conv_id, &bob_id).await;

    Database::mark_read(&pool, &m1.id, &bob_id, "2026-02-01T10:00:02Z")
        .await
        .expect("Transition failed");
    assert_unread_invariant(&pool, &conv_id, &alice_id).await;
    assert_unread_invariant(&pool, &conv_id, &bob_id).await;
}

#[tokio::test]
async fn test_bulk_read_after_partial_single_reads() {
    let pool = create_test_pool();
    let (alice_id, bob_id, conv_id) = seed_pair(&pool).await;

    let mut ids = Vec::new();
    for i in 0..4 {
        let (m, _) = Database::record_message(
            &pool,
            &conv_id,
            &alice_id,
            &bob_id,
            &format!("msg {i}"),
            MessageType::Text,
        )
        .await
        .expect("record");
        ids.push(m.id);
    }

    // One message read individually first
    Database::mark_read(&pool, &ids[1], &bob_id, "2026-02-01T10:00:01Z")
        .await
        .expect("Transition failed")
        .expect("Read should transition");

    // Bulk read covers only the remaining three
    let updated = Database::mark_all_read(&pool, &conv_id, &bob_id, "2026-02-01T10:00:02Z")
        .await
        .expect("Bulk read failed");
    assert_eq!(updated.len(), 3);
    assert!(!updated.iter().any(|m| m.id == ids[1]));

    assert_unread_invariant(&pool, &conv_id, &bob_id).await;

    // readBy stays a set: exactly one receipt per message
    for id in &ids {
        let stored = Database::get_message(&pool, id)
            .await
            .expect("Query failed")
            .expect("Message not found");
        assert_eq!(stored.read_by, vec![bob_id.clone()]);
        assert_eq!(stored.status, MessageStatus::Read);
    }
}

#[tokio::test]
async fn test_pending_sweep_matches_offline_backlog() {
    let pool = create_test_pool();
    let (alice_id, bob_id, conv_id) = seed_pair(&pool).await;

    // Three messages accumulate while Bob is offline; one gets read via
    // another path and must drop out of the sweep
    let mut ids = Vec::new();
    for i in 0..3 {
        let (m, _) = Database::record_message(
            &pool,
            &conv_id,
            &alice_id,
            &bob_id,
            &format!("msg {i}"),
            MessageType::Text,
        )
        .await
        .expect("record");
        ids.push(m.id);
    }
    Database::mark_read(&pool, &ids[0], &bob_id, "2026-02-01T10:00:01Z")
        .await
        .expect("Transition failed");

    let pending = Database::pending_inbound_for(&pool, &bob_id)
        .await
        .expect("Query failed");
    let pending_ids: Vec<&str> = pending.iter().map(|p| p.message_id.as_str()).collect();
    assert_eq!(pending_ids, vec![ids[1].as_str(), ids[2].as_str()]);

    let sweep_ids: Vec<String> = pending.iter().map(|p| p.message_id.clone()).collect();
    let changed = Database::mark_delivered_bulk(&pool, &sweep_ids, "2026-02-01T10:00:02Z")
        .await
        .expect("Bulk transition failed");
    assert_eq!(changed, 2);

    // Counters are delivery-independent: still two unread for Bob
    assert_eq!(
        Database::unread_count(&pool, &conv_id, &bob_id)
            .await
            .expect("Query failed"),
        2
    );
    assert_unread_invariant(&pool, &conv_id, &bob_id).await;
}

#[tokio::test]
async fn test_conversation_preview_tracks_latest_message() {
    let pool = create_test_pool();
    let (alice_id, bob_id, conv_id) = seed_pair(&pool).await;

    Database::record_message(&pool, &conv_id, &alice_id, &bob_id, "first", MessageType::Text)
        .await
        .expect("record");
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let (latest, _) = Database::record_message(
        &pool,
        &conv_id,
        &bob_id,
        &alice_id,
        "second",
        MessageType::Text,
    )
    .await
    .expect("record");

    let conv = Database::get_conversation(&pool, &conv_id)
        .await
        .expect("Query failed")
        .expect("Conversation not found");
    assert_eq!(conv.last_message_id.as_deref(), Some(latest.id.as_str()));
    assert_eq!(conv.last_message_content.as_deref(), Some("second"));
    assert_eq!(conv.last_message_time.as_deref(), Some(latest.created_at.as_str()));
}

#[tokio::test]
async fn test_image_and_file_message_types_roundtrip() {
    let pool = create_test_pool();
    let (alice_id, bob_id, conv_id) = seed_pair(&pool).await;

    let (image, _) = Database::record_message(
        &pool,
        &conv_id,
        &alice_id,
        &bob_id,
        "https://cdn.example/pic.png",
        MessageType::Image,
    )
    .await
    .expect("record");
    let stored = Database::get_message(&pool, &image.id)
        .await
        .expect("Query failed")
        .expect("Message not found");
    assert_eq!(stored.message_type, MessageType::Image);
}
