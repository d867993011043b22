use chat_archiver::db::Timing;

use crate::common::{test_db, test_message};

fn at(millis: i64) -> Timing {
    Timing {
        millis,
        realtime: false,
    }
}

#[tokio::test]
async fn test_last_message_id_tracks_the_channel_maximum() {
    let db = test_db();
    assert_eq!(db.get_last_message_id(7).await.unwrap(), None);

    for (i, id) in [3u64, 1, 5].iter().enumerate() {
        db.add_message_snapshot(
            test_message(*id, 7, 900, &format!("m{id}")),
            at(1000 + i as i64),
        )
        .await
        .unwrap();
    }
    db.add_message_snapshot(test_message(9, 8, 900, "other channel"), at(2000))
        .await
        .unwrap();

    assert_eq!(db.get_last_message_id(7).await.unwrap(), Some(5));
    assert_eq!(db.get_last_message_id(8).await.unwrap(), Some(9));
}

#[tokio::test]
async fn test_message_ids_come_back_ascending() {
    let db = test_db();
    for (i, id) in [30u64, 10, 20].iter().enumerate() {
        db.add_message_snapshot(test_message(*id, 7, 900, "x"), at(1000 + i as i64))
            .await
            .unwrap();
    }
    assert_eq!(db.get_message_ids(7).await.unwrap(), vec![10, 20, 30]);
}

#[tokio::test]
async fn test_guild_member_sync_records_the_full_set() {
    let db = test_db();
    let ids: Vec<u64> = (1..=100).collect();
    db.sync_guild_members(1, ids.clone(), at(1000)).await.unwrap();

    let stored: String = db.query_one("SELECT user_ids FROM guild_member_sync WHERE guild_id = 1");
    let parsed: Vec<String> = serde_json::from_str(&stored).unwrap();
    assert_eq!(parsed.len(), 100);
    assert_eq!(parsed[0], "1");
    assert_eq!(parsed[99], "100");
}

#[tokio::test]
async fn test_iterators_list_guilds_and_channels() {
    let db = test_db();
    db.add_guild_snapshot(1, Some("alpha".into()), None, at(1000))
        .await
        .unwrap();
    db.add_guild_snapshot(2, Some("beta".into()), None, at(1001))
        .await
        .unwrap();

    let mut channel = chat_archiver::model::Channel {
        id: 7,
        kind: 0,
        guild_id: Some(1),
        name: Some("general".into()),
        topic: None,
        position: Some(0),
        nsfw: None,
        parent_id: None,
        last_message_id: None,
        message_count: None,
        owner_id: None,
        permission_overwrites: None,
        thread_metadata: None,
    };
    db.add_channel_snapshot(channel.clone(), at(1002)).await.unwrap();
    channel.id = 8;
    channel.name = Some("archive".into());
    db.add_channel_snapshot(channel, at(1003)).await.unwrap();

    let guilds = db.iter_guilds().await.unwrap();
    assert_eq!(
        guilds,
        vec![(1, Some("alpha".into())), (2, Some("beta".into()))]
    );
    let channels = db.iter_channels(1).await.unwrap();
    assert_eq!(
        channels,
        vec![(7, Some("general".into())), (8, Some("archive".into()))]
    );
}

#[tokio::test]
async fn test_transaction_wraps_a_batch() {
    let db = test_db();
    db.begin().await.unwrap();
    for id in 1..=10u64 {
        db.add_message_snapshot(test_message(id, 7, 900, "batched"), at(1000 + id as i64))
            .await
            .unwrap();
    }
    db.commit().await.unwrap();
    assert_eq!(db.get_message_ids(7).await.unwrap().len(), 10);
}
