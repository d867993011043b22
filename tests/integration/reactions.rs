use chat_archiver::db::Timing;
use chat_archiver::model::{Emoji, ReactionKind};

use crate::common::{test_db, test_message};

fn at(millis: i64) -> Timing {
    Timing {
        millis,
        realtime: true,
    }
}

fn sparkles() -> Emoji {
    Emoji {
        id: None,
        name: Some("✨".to_string()),
    }
}

#[tokio::test]
async fn test_reaction_lifecycle() {
    let db = test_db();
    db.add_message_snapshot(test_message(7, 1, 900, "react to me"), at(500))
        .await
        .unwrap();

    db.add_reaction_placement(7, sparkles(), ReactionKind::Normal, 42, at(1000))
        .await
        .unwrap();
    db.remove_reaction(7, sparkles(), 42, at(2000)).await.unwrap();

    let rows: i64 = db.query_one("SELECT COUNT(*) FROM reactions WHERE message_id = 7");
    assert_eq!(rows, 1);
    let start: i64 = db.query_one("SELECT start_time FROM reactions WHERE message_id = 7");
    assert_eq!(Timing::decode(start).millis, 1000);
    let end: i64 = db.query_one("SELECT end_time FROM reactions WHERE message_id = 7");
    assert_eq!(Timing::decode(end).millis, 2000);
}

#[tokio::test]
async fn test_initial_load_uses_epoch_sentinel() {
    let db = test_db();
    db.add_initial_reactions(7, sparkles(), ReactionKind::Normal, vec![42, 43])
        .await
        .unwrap();

    let rows: i64 = db.query_one("SELECT COUNT(*) FROM reactions WHERE message_id = 7");
    assert_eq!(rows, 2);
    // Zero start means "existed since before archival".
    let starts: i64 =
        db.query_one("SELECT COUNT(*) FROM reactions WHERE message_id = 7 AND start_time = 0");
    assert_eq!(starts, 2);
}

#[tokio::test]
async fn test_initial_load_dedups_against_open_rows() {
    let db = test_db();
    // Realtime placement first, then the initial load lists the same user.
    db.add_reaction_placement(7, sparkles(), ReactionKind::Normal, 42, at(1000))
        .await
        .unwrap();
    db.add_initial_reactions(7, sparkles(), ReactionKind::Normal, vec![42])
        .await
        .unwrap();

    let rows: i64 = db.query_one("SELECT COUNT(*) FROM reactions WHERE message_id = 7");
    assert_eq!(rows, 1);
    let start: i64 = db.query_one("SELECT start_time FROM reactions WHERE message_id = 7");
    assert_eq!(Timing::decode(start).millis, 1000);
}

#[tokio::test]
async fn test_reacting_again_after_removal_opens_a_new_row() {
    let db = test_db();
    db.add_reaction_placement(7, sparkles(), ReactionKind::Normal, 42, at(1000))
        .await
        .unwrap();
    db.remove_reaction(7, sparkles(), 42, at(2000)).await.unwrap();
    db.add_reaction_placement(7, sparkles(), ReactionKind::Normal, 42, at(3000))
        .await
        .unwrap();

    let rows: i64 = db.query_one("SELECT COUNT(*) FROM reactions WHERE message_id = 7");
    assert_eq!(rows, 2);
    let open: i64 =
        db.query_one("SELECT COUNT(*) FROM reactions WHERE message_id = 7 AND end_time IS NULL");
    assert_eq!(open, 1);
}

#[tokio::test]
async fn test_burst_and_normal_are_distinct_placements() {
    let db = test_db();
    db.add_reaction_placement(7, sparkles(), ReactionKind::Normal, 42, at(1000))
        .await
        .unwrap();
    db.add_reaction_placement(7, sparkles(), ReactionKind::Burst, 42, at(1100))
        .await
        .unwrap();

    let rows: i64 = db.query_one("SELECT COUNT(*) FROM reactions WHERE message_id = 7");
    assert_eq!(rows, 2);
}

#[tokio::test]
async fn test_remove_all_closes_every_open_placement() {
    let db = test_db();
    let thumbs = Emoji {
        id: Some(777),
        name: Some("custom".to_string()),
    };
    db.add_reaction_placement(7, sparkles(), ReactionKind::Normal, 42, at(1000))
        .await
        .unwrap();
    db.add_reaction_placement(7, thumbs.clone(), ReactionKind::Normal, 43, at(1100))
        .await
        .unwrap();

    db.remove_all_reactions(7, None, at(2000)).await.unwrap();
    let open: i64 =
        db.query_one("SELECT COUNT(*) FROM reactions WHERE message_id = 7 AND end_time IS NULL");
    assert_eq!(open, 0);
}

#[tokio::test]
async fn test_remove_all_for_one_emoji_leaves_the_rest() {
    let db = test_db();
    let custom = Emoji {
        id: Some(777),
        name: Some("custom".to_string()),
    };
    db.add_reaction_placement(7, sparkles(), ReactionKind::Normal, 42, at(1000))
        .await
        .unwrap();
    db.add_reaction_placement(7, custom.clone(), ReactionKind::Normal, 43, at(1100))
        .await
        .unwrap();

    db.remove_all_reactions(7, Some(custom), at(2000)).await.unwrap();
    let open: i64 =
        db.query_one("SELECT COUNT(*) FROM reactions WHERE message_id = 7 AND end_time IS NULL");
    assert_eq!(open, 1);
}
