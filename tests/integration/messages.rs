use chat_archiver::db::{AddOutcome, Timing};
use chat_archiver::model::{Attachment, MessageUpdate, SYNTHETIC_ID_BOUND};

use crate::common::{test_db, test_message};

fn at(millis: i64, realtime: bool) -> Timing {
    Timing { millis, realtime }
}

fn update(id: u64) -> MessageUpdate {
    MessageUpdate {
        id,
        channel_id: 42,
        content: None,
        edited_timestamp: None,
        pinned: None,
        flags: None,
        attachments: None,
        embeds: None,
        components: None,
        author: None,
    }
}

#[tokio::test]
async fn test_edit_keeps_the_old_content_in_history() {
    let db = test_db();
    db.add_message_snapshot(test_message(42, 7, 900, "a"), at(1000, false))
        .await
        .unwrap();

    let edit = MessageUpdate {
        content: Some("b".into()),
        edited_timestamp: Some("2024-03-01T13:00:00+00:00".into()),
        ..update(42)
    };
    let outcome = db.add_message_partial(edit, at(2000, true)).await.unwrap();
    assert_eq!(outcome, AddOutcome::Another);

    let latest: String =
        db.query_one("SELECT content FROM latest_message_snapshots WHERE id = 42");
    assert_eq!(latest, "b");
    let previous: String =
        db.query_one("SELECT content FROM previous_message_snapshots WHERE id = 42");
    assert_eq!(previous, "a");
    let total: i64 = db.query_one(
        "SELECT (SELECT COUNT(*) FROM latest_message_snapshots WHERE id = 42)
              + (SELECT COUNT(*) FROM previous_message_snapshots WHERE id = 42)",
    );
    assert_eq!(total, 2);
}

#[tokio::test]
async fn test_author_snapshot_is_harvested() {
    let db = test_db();
    db.add_message_snapshot(test_message(1, 7, 900, "hi"), at(1000, false))
        .await
        .unwrap();
    let username: String = db.query_one("SELECT username FROM latest_user_snapshots WHERE id = 900");
    assert_eq!(username, "author");
}

#[tokio::test]
async fn test_webhook_identities_get_distinct_synthetic_authors() {
    let db = test_db();

    let mut first = test_message(1, 7, 0, "from hook");
    first.webhook_id = Some(5555);
    first.author.username = "Alice Bridge".into();
    db.add_message_snapshot(first, at(1000, false)).await.unwrap();

    let mut second = test_message(2, 7, 0, "from hook too");
    second.webhook_id = Some(5555);
    second.author.username = "Bob Bridge".into();
    db.add_message_snapshot(second, at(2000, false)).await.unwrap();

    let mut third = test_message(3, 7, 0, "again");
    third.webhook_id = Some(5555);
    third.author.username = "Alice Bridge".into();
    db.add_message_snapshot(third, at(3000, false)).await.unwrap();

    let a: i64 = db.query_one("SELECT author_id FROM latest_message_snapshots WHERE id = 1");
    let b: i64 = db.query_one("SELECT author_id FROM latest_message_snapshots WHERE id = 2");
    let c: i64 = db.query_one("SELECT author_id FROM latest_message_snapshots WHERE id = 3");
    assert_ne!(a, b);
    assert_eq!(a, c);
    assert!((a as u64) < SYNTHETIC_ID_BOUND);
    assert!((b as u64) < SYNTHETIC_ID_BOUND);
}

#[tokio::test]
async fn test_embed_backfill_mutates_latest_in_place() {
    let db = test_db();
    db.add_message_snapshot(test_message(42, 7, 900, "a link"), at(1000, false))
        .await
        .unwrap();

    // No edited_timestamp: the platform unfurled a link.
    let unfurl = MessageUpdate {
        embeds: Some(vec![serde_json::json!({"title": "preview"})]),
        ..update(42)
    };
    let outcome = db.add_message_partial(unfurl, at(2000, true)).await.unwrap();
    assert_eq!(outcome, AddOutcome::SameAsLatest);

    let embeds: String = db.query_one("SELECT embeds FROM latest_message_snapshots WHERE id = 42");
    assert!(embeds.contains("preview"));
    let history: i64 =
        db.query_one("SELECT COUNT(*) FROM previous_message_snapshots WHERE id = 42");
    assert_eq!(history, 0);
}

#[tokio::test]
async fn test_unedited_update_touching_content_is_skipped() {
    let db = test_db();
    db.add_message_snapshot(test_message(42, 7, 900, "original"), at(1000, false))
        .await
        .unwrap();

    let bogus = MessageUpdate {
        content: Some("should not land".into()),
        embeds: Some(vec![serde_json::json!({"title": "x"})]),
        ..update(42)
    };
    let outcome = db.add_message_partial(bogus, at(2000, true)).await.unwrap();
    assert_eq!(outcome, AddOutcome::SameAsLatest);

    let content: String =
        db.query_one("SELECT content FROM latest_message_snapshots WHERE id = 42");
    assert_eq!(content, "original");
}

#[tokio::test]
async fn test_attachments_are_recorded() {
    let db = test_db();
    let mut message = test_message(42, 7, 900, "with file");
    message.attachments.push(Attachment {
        id: 4242,
        filename: "notes.txt".into(),
        size: 321,
        url: "https://cdn.discordapp.com/attachments/7/4242/notes.txt".into(),
        content_type: Some("text/plain".into()),
    });
    db.add_message_snapshot(message, at(1000, false)).await.unwrap();

    let filename: String = db.query_one("SELECT filename FROM attachments WHERE id = 4242");
    assert_eq!(filename, "notes.txt");
}

#[tokio::test]
async fn test_deleted_messages_are_marked_not_removed() {
    let db = test_db();
    db.add_message_snapshot(test_message(42, 7, 900, "doomed"), at(1000, false))
        .await
        .unwrap();
    db.mark_message_deleted(42, at(2000, true)).await.unwrap();

    let deleted: i64 = db.query_one("SELECT _deleted FROM latest_message_snapshots WHERE id = 42");
    assert_eq!(Timing::decode(deleted).millis, 2000);
    let content: String =
        db.query_one("SELECT content FROM latest_message_snapshots WHERE id = 42");
    assert_eq!(content, "doomed");
}

#[tokio::test]
async fn test_search_finds_message_content() {
    let db = test_db();
    db.add_message_snapshot(test_message(1, 7, 900, "the quick brown fox"), at(1000, false))
        .await
        .unwrap();
    db.add_message_snapshot(test_message(2, 7, 900, "something else"), at(2000, false))
        .await
        .unwrap();

    let hits = db.search_messages("fox".into()).await.unwrap();
    assert_eq!(hits, vec![1]);
}
