use std::sync::{Arc, Mutex};

use chat_archiver::db::Timing;
use chat_archiver::rest::{ArchivedThreadKind, RestClient};
use chat_archiver::sync::backfill::{
    run_message_sync, run_thread_list_sync, MessageSyncTask, SyncOutcome, ThreadListTask,
};
use chat_archiver::sync::Event;
use tokio_util::sync::CancellationToken;

use crate::common::{history_page, query_param, spawn_stub_api, test_db, test_message};

fn message_task(
    db: chat_archiver::db::DbHandle,
    rest: RestClient,
    channel_id: u64,
    known_last: Option<u64>,
) -> MessageSyncTask {
    MessageSyncTask {
        db,
        rest,
        token: CancellationToken::new(),
        channel_id,
        known_last_message_id: known_last,
        no_reactions: false,
    }
}

#[tokio::test]
async fn test_fresh_backfill_fetches_three_pages_for_250_messages() {
    let requests: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let log = requests.clone();
    let api = spawn_stub_api(move |path| {
        log.lock().unwrap().push(path.to_string());
        if path.starts_with("/channels/7/messages?") {
            let after = query_param(path, "after").unwrap_or(0);
            (200, history_page(250, after, 7))
        } else {
            (404, "{}".into())
        }
    })
    .await;

    let db = test_db();
    let rest = RestClient::with_base_url("Bot test", &api.base_url).unwrap();
    let outcome =
        run_message_sync(message_task(db.handle(), rest, 7, Some(250))).await;
    assert!(matches!(outcome, SyncOutcome::Complete), "{outcome:?}");

    // Three fetches: 100, 100, 50.
    assert_eq!(requests.lock().unwrap().len(), 3);
    let ids = db.get_message_ids(7).await.unwrap();
    assert_eq!(ids, (1..=250).collect::<Vec<u64>>());

    // Everything came from pagination: realtime flag clear on every row.
    let realtime_rows: i64 = db.query_one(
        "SELECT COUNT(*) FROM latest_message_snapshots WHERE channel_id = 7 AND _timestamp % 2 = 1",
    );
    assert_eq!(realtime_rows, 0);
}

#[tokio::test]
async fn test_resume_starts_at_the_stored_maximum() {
    let db = test_db();

    // First pass: the channel holds 250 messages.
    let api = spawn_stub_api(|path| {
        let after = query_param(path, "after").unwrap_or(0);
        (200, history_page(250, after, 7))
    })
    .await;
    let rest = RestClient::with_base_url("Bot test", &api.base_url).unwrap();
    run_message_sync(message_task(db.handle(), rest, 7, Some(250))).await;

    // Second pass after a restart: 100 new messages have arrived.
    let requests: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let log = requests.clone();
    let api = spawn_stub_api(move |path| {
        log.lock().unwrap().push(path.to_string());
        let after = query_param(path, "after").unwrap_or(0);
        (200, history_page(350, after, 7))
    })
    .await;
    let rest = RestClient::with_base_url("Bot test", &api.base_url).unwrap();
    let outcome = run_message_sync(message_task(db.handle(), rest, 7, Some(350))).await;
    assert!(matches!(outcome, SyncOutcome::Complete), "{outcome:?}");

    let first_request = requests.lock().unwrap()[0].clone();
    assert!(first_request.contains("after=250"), "{first_request}");

    let ids = db.get_message_ids(7).await.unwrap();
    assert_eq!(ids.len(), 350);
    // No row was rewritten.
    let history: i64 = db.query_one("SELECT COUNT(*) FROM previous_message_snapshots");
    assert_eq!(history, 0);
}

#[tokio::test]
async fn test_backfill_skips_when_store_already_has_the_known_last() {
    let db = test_db();
    db.add_message_snapshot(test_message(250, 7, 900, "tail"), Timing::now(true))
        .await
        .unwrap();

    let api = spawn_stub_api(|_| (500, "{}".into())).await;
    let rest = RestClient::with_base_url("Bot test", &api.base_url).unwrap();
    let outcome = run_message_sync(message_task(db.handle(), rest, 7, Some(250))).await;
    assert!(matches!(outcome, SyncOutcome::UpToDate), "{outcome:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_backfill_stops_where_realtime_already_wrote() {
    let db = test_db();

    // The stub holds the second page until the test has injected a realtime
    // write into the range that page covers.
    let (unblock_tx, unblock_rx) = std::sync::mpsc::channel::<()>();
    let gate = Mutex::new(unblock_rx);
    let api = spawn_stub_api(move |path| {
        let after = query_param(path, "after").unwrap_or(0);
        if after == 100 {
            let _ = gate.lock().unwrap().recv();
        }
        (200, history_page(300, after, 7))
    })
    .await;

    let rest = RestClient::with_base_url("Bot test", &api.base_url).unwrap();
    let handle = tokio::spawn(run_message_sync(message_task(
        db.handle(),
        rest,
        7,
        Some(300),
    )));

    // Wait for the first page to land, then play the racing dispatch.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while db.get_last_message_id(7).await.unwrap() != Some(100) {
        assert!(std::time::Instant::now() < deadline, "first page never landed");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    let mut realtime = test_message(150, 7, 900, "message 150");
    realtime.author.username = "poster".into();
    realtime.guild_id = None;
    db.add_message_snapshot(realtime, Timing::now(true)).await.unwrap();
    unblock_tx.send(()).unwrap();

    let outcome = handle.await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Complete), "{outcome:?}");

    // The join point: backfill filled up to the realtime write and stopped.
    let ids = db.get_message_ids(7).await.unwrap();
    assert_eq!(ids, (1..=150).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_backfill_collects_initial_reactions() {
    let page = serde_json::json!([{
        "id": "1",
        "channel_id": "7",
        "author": {"id": "900", "username": "poster"},
        "content": "popular",
        "timestamp": "2024-03-01T12:00:00+00:00",
        "pinned": false,
        "type": 0,
        "attachments": [],
        "embeds": [],
        "reactions": [{
            "count": 2,
            "emoji": {"id": null, "name": "✨"},
            "count_details": {"normal": 2, "burst": 0},
        }],
    }]);
    let api = spawn_stub_api(move |path| {
        if path.contains("/reactions/") {
            (
                200,
                r#"[{"id": "42", "username": "fan"}, {"id": "43", "username": "other"}]"#.into(),
            )
        } else {
            (200, page.to_string())
        }
    })
    .await;

    let db = test_db();
    let rest = RestClient::with_base_url("Bot test", &api.base_url).unwrap();
    let outcome = run_message_sync(message_task(db.handle(), rest, 7, Some(1))).await;
    assert!(matches!(outcome, SyncOutcome::Complete), "{outcome:?}");

    let placements: i64 = db.query_one("SELECT COUNT(*) FROM reactions WHERE message_id = 1");
    assert_eq!(placements, 2);
    // Initial loads carry the before-archival sentinel.
    let epoch: i64 =
        db.query_one("SELECT COUNT(*) FROM reactions WHERE message_id = 1 AND start_time = 0");
    assert_eq!(epoch, 2);
    // Reactor user snapshots were harvested.
    let fan: String = db.query_one("SELECT username FROM latest_user_snapshots WHERE id = 42");
    assert_eq!(fan, "fan");
}

#[tokio::test]
async fn test_no_reactions_skips_reactor_enumeration() {
    let page = serde_json::json!([{
        "id": "1",
        "channel_id": "7",
        "author": {"id": "900", "username": "poster"},
        "content": "popular",
        "timestamp": "2024-03-01T12:00:00+00:00",
        "pinned": false,
        "type": 0,
        "attachments": [],
        "embeds": [],
        "reactions": [{"count": 1, "emoji": {"id": null, "name": "✨"}}],
    }]);
    let api = spawn_stub_api(move |path| {
        assert!(
            !path.contains("/reactions/"),
            "reaction route fetched with --no-reactions"
        );
        (200, page.to_string())
    })
    .await;

    let db = test_db();
    let rest = RestClient::with_base_url("Bot test", &api.base_url).unwrap();
    let mut task = message_task(db.handle(), rest, 7, Some(1));
    task.no_reactions = true;
    let outcome = run_message_sync(task).await;
    assert!(matches!(outcome, SyncOutcome::Complete), "{outcome:?}");
    let placements: i64 = db.query_one("SELECT COUNT(*) FROM reactions");
    assert_eq!(placements, 0);
}

#[tokio::test]
async fn test_denied_backfill_hangs_until_aborted() {
    let api = spawn_stub_api(|_| (403, r#"{"message": "Missing Access"}"#.into())).await;
    let db = test_db();
    let rest = RestClient::with_base_url("Bot test", &api.base_url).unwrap();

    let task = message_task(db.handle(), rest, 7, Some(10));
    let token = task.token.clone();
    let handle = tokio::spawn(run_message_sync(task));

    // Give it time to hit the 403 and park, then abort as the
    // permission-change path would.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(!handle.is_finished());
    token.cancel();
    let outcome = handle.await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Aborted), "{outcome:?}");
}

#[tokio::test]
async fn test_thread_enumeration_reports_each_thread() {
    let body = serde_json::json!({
        "threads": [
            {
                "id": "71",
                "type": 11,
                "guild_id": "100",
                "name": "old thread",
                "parent_id": "7",
                "last_message_id": "400",
                "thread_metadata": {"archived": true, "locked": false},
            },
            {
                "id": "72",
                "type": 12,
                "guild_id": "100",
                "name": "older private thread",
                "parent_id": "7",
                "thread_metadata": {"archived": true, "locked": false},
            },
        ],
        "has_more": false,
    });
    let api = spawn_stub_api(move |path| {
        assert!(path.starts_with("/channels/7/threads/archived/public"));
        (200, body.to_string())
    })
    .await;

    let db = test_db();
    let rest = RestClient::with_base_url("Bot test", &api.base_url).unwrap();
    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
    let task = ThreadListTask {
        db: db.handle(),
        rest,
        token: CancellationToken::new(),
        guild_id: 100,
        channel_id: 7,
        kind: ArchivedThreadKind::Public,
        events: events_tx,
    };
    let outcome = run_thread_list_sync(task).await;
    assert!(matches!(outcome, SyncOutcome::Complete), "{outcome:?}");

    // Both threads got channel snapshots.
    let rows: i64 =
        db.query_one("SELECT COUNT(*) FROM latest_channel_snapshots WHERE parent_id = 7");
    assert_eq!(rows, 2);

    // And both were reported for message-sync scheduling.
    let mut discovered = Vec::new();
    while let Ok(event) = events_rx.try_recv() {
        if let Event::ThreadDiscovered { thread, .. } = event {
            discovered.push((thread.id, thread.private));
        }
    }
    discovered.sort_unstable();
    assert_eq!(discovered, vec![(71, false), (72, true)]);
}
