//! Entity-specific write and query operations, dispatched from the writer
//! thread. Everything here runs on the writer's own connection.

use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::model::{self, Emoji, Message, MessageUpdate, ReactionKind};

use super::snapshot::{self, CHANNELS, GUILDS, MEMBERS, MESSAGES, ROLES, USERS};
use super::{AddOutcome, DbError, DbRequest, Timing};

/// Attachment URLs are expected to point at the platform CDN.
const CDN_URL_PREFIX: &str = "https://cdn.discordapp.com/attachments/";

pub(crate) fn handle_request(conn: &Connection, request: DbRequest) {
    match request {
        DbRequest::Begin { reply } => {
            let _ = reply.send(exec(conn, "BEGIN"));
        }
        DbRequest::Commit { reply } => {
            let _ = reply.send(exec(conn, "COMMIT"));
        }
        DbRequest::Optimize { reply } => {
            let _ = reply.send(exec(conn, "PRAGMA optimize;"));
        }
        // Close is consumed by the writer loop itself.
        DbRequest::Close { reply } => {
            let _ = reply.send(Ok(()));
        }

        DbRequest::AddGuildSnapshot {
            id,
            name,
            owner_id,
            timing,
            reply,
        } => {
            let result = snapshot::add(
                conn,
                &GUILDS,
                &[Value::Integer(id as i64)],
                &[],
                &[text_value(name), opt_id_value(owner_id)],
                timing,
            );
            let _ = reply.send(result);
        }

        DbRequest::AddChannelSnapshot {
            channel,
            timing,
            reply,
        } => {
            let _ = reply.send(add_channel(conn, &channel, timing));
        }

        DbRequest::AddRoleSnapshot {
            guild_id,
            role,
            timing,
            reply,
        } => {
            let result = snapshot::add(
                conn,
                &ROLES,
                &[Value::Integer(role.id as i64)],
                &[Value::Integer(guild_id as i64)],
                &[
                    Value::Text(role.name.clone()),
                    Value::Integer(role.permissions as i64),
                    Value::Integer(role.position),
                    Value::Integer(role.color),
                    Value::Integer(role.hoist as i64),
                    Value::Integer(role.mentionable as i64),
                ],
                timing,
            );
            let _ = reply.send(result);
        }

        DbRequest::AddMemberSnapshot {
            guild_id,
            user_id,
            nick,
            roles,
            joined_at,
            timing,
            reply,
        } => {
            let mut sorted = roles;
            sorted.sort_unstable();
            let result = snapshot::add(
                conn,
                &MEMBERS,
                &[
                    Value::Integer(guild_id as i64),
                    Value::Integer(user_id as i64),
                ],
                &[],
                &[
                    text_value(nick),
                    Value::Text(ids_json(&sorted)),
                    text_value(joined_at),
                ],
                timing,
            );
            let _ = reply.send(result);
        }

        DbRequest::AddMemberLeave {
            guild_id,
            user_id,
            timing,
            reply,
        } => {
            let result = snapshot::add(
                conn,
                &MEMBERS,
                &[
                    Value::Integer(guild_id as i64),
                    Value::Integer(user_id as i64),
                ],
                &[],
                &[Value::Null, Value::Null, Value::Null],
                timing,
            );
            let _ = reply.send(result);
        }

        DbRequest::AddUserSnapshot {
            user,
            timing,
            reply,
        } => {
            let _ = reply.send(add_user(conn, &user, timing));
        }

        DbRequest::AddMessageSnapshot {
            message,
            timing,
            reply,
        } => {
            let _ = reply.send(add_message(conn, &message, timing));
        }

        DbRequest::AddMessagePartial {
            update,
            timing,
            reply,
        } => {
            let _ = reply.send(add_message_partial(conn, &update, timing));
        }

        DbRequest::MarkMessageDeleted { id, timing, reply } => {
            let _ = reply.send(snapshot::mark_deleted(
                conn,
                &MESSAGES,
                &[Value::Integer(id as i64)],
                timing,
            ));
        }
        DbRequest::MarkChannelDeleted { id, timing, reply } => {
            let _ = reply.send(snapshot::mark_deleted(
                conn,
                &CHANNELS,
                &[Value::Integer(id as i64)],
                timing,
            ));
        }
        DbRequest::MarkRoleDeleted { id, timing, reply } => {
            let _ = reply.send(snapshot::mark_deleted(
                conn,
                &ROLES,
                &[Value::Integer(id as i64)],
                timing,
            ));
        }
        DbRequest::MarkGuildDeleted { id, timing, reply } => {
            let _ = reply.send(snapshot::mark_deleted(
                conn,
                &GUILDS,
                &[Value::Integer(id as i64)],
                timing,
            ));
        }

        DbRequest::AddInitialReactions {
            message_id,
            emoji,
            kind,
            user_ids,
            reply,
        } => {
            let _ = reply.send(add_reactions(
                conn,
                message_id,
                &emoji,
                kind,
                &user_ids,
                Timing::EPOCH,
            ));
        }

        DbRequest::AddReactionPlacement {
            message_id,
            emoji,
            kind,
            user_id,
            timing,
            reply,
        } => {
            let _ = reply.send(add_reactions(
                conn,
                message_id,
                &emoji,
                kind,
                &[user_id],
                timing,
            ));
        }

        DbRequest::RemoveReaction {
            message_id,
            emoji,
            user_id,
            timing,
            reply,
        } => {
            let _ = reply.send(remove_reaction(conn, message_id, &emoji, user_id, timing));
        }

        DbRequest::RemoveAllReactions {
            message_id,
            emoji,
            timing,
            reply,
        } => {
            let _ = reply.send(remove_all_reactions(conn, message_id, emoji.as_ref(), timing));
        }

        DbRequest::SyncGuildMembers {
            guild_id,
            user_ids,
            timing,
            reply,
        } => {
            let mut sorted = user_ids;
            sorted.sort_unstable();
            let result = conn
                .execute(
                    "INSERT INTO guild_member_sync (guild_id, _timestamp, user_ids) VALUES (?1, ?2, ?3)",
                    params![guild_id as i64, timing.encode(), ids_json(&sorted)],
                )
                .map(|_| ())
                .map_err(DbError::from);
            let _ = reply.send(result);
        }

        DbRequest::GetLastMessageId { channel_id, reply } => {
            let result = conn
                .query_row(
                    "SELECT MAX(id) FROM latest_message_snapshots WHERE channel_id = ?1",
                    params![channel_id as i64],
                    |row| row.get::<_, Option<i64>>(0),
                )
                .map(|max| max.map(|id| id as u64))
                .map_err(DbError::from);
            let _ = reply.send(result);
        }

        DbRequest::GetMessageIds { channel_id, reply } => {
            let _ = reply.send(query_ids(
                conn,
                "SELECT id FROM latest_message_snapshots WHERE channel_id = ?1 ORDER BY id",
                Some(channel_id as i64),
            ));
        }

        DbRequest::SearchMessages { query, reply } => {
            let result = (|| {
                let mut stmt = conn.prepare(
                    "SELECT message_id FROM message_fts WHERE message_fts MATCH ?1 ORDER BY message_id",
                )?;
                let ids = stmt
                    .query_map(params![query], |row| row.get::<_, i64>(0))?
                    .filter_map(|r| r.ok())
                    .map(|id| id as u64)
                    .collect();
                Ok(ids)
            })();
            let _ = reply.send(result);
        }

        DbRequest::IterGuilds { reply } => {
            let result = (|| {
                let mut stmt =
                    conn.prepare("SELECT id, name FROM latest_guild_snapshots ORDER BY id")?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((row.get::<_, i64>(0)? as u64, row.get::<_, Option<String>>(1)?))
                    })?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })();
            let _ = reply.send(result);
        }

        DbRequest::IterChannels { guild_id, reply } => {
            let result = (|| {
                let mut stmt = conn.prepare(
                    "SELECT id, name FROM latest_channel_snapshots WHERE guild_id = ?1 ORDER BY id",
                )?;
                let rows = stmt
                    .query_map(params![guild_id as i64], |row| {
                        Ok((row.get::<_, i64>(0)? as u64, row.get::<_, Option<String>>(1)?))
                    })?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })();
            let _ = reply.send(result);
        }
    }
}

fn exec(conn: &Connection, sql: &str) -> Result<(), DbError> {
    conn.execute_batch(sql)?;
    Ok(())
}

fn text_value(text: Option<String>) -> Value {
    match text {
        Some(text) => Value::Text(text),
        None => Value::Null,
    }
}

fn opt_id_value(id: Option<u64>) -> Value {
    match id {
        Some(id) => Value::Integer(id as i64),
        None => Value::Null,
    }
}

fn ids_json(ids: &[u64]) -> String {
    serde_json::to_string(&ids.iter().map(|id| id.to_string()).collect::<Vec<_>>())
        .unwrap_or_else(|_| "[]".into())
}

fn json_value<T: serde::Serialize>(value: &T) -> Value {
    match serde_json::to_string(value) {
        Ok(text) => Value::Text(text),
        Err(_) => Value::Null,
    }
}

fn query_ids(
    conn: &Connection,
    sql: &str,
    param: Option<i64>,
) -> Result<Vec<u64>, DbError> {
    let mut stmt = conn.prepare(sql)?;
    let map = |row: &rusqlite::Row<'_>| row.get::<_, i64>(0);
    let rows = match param {
        Some(param) => stmt.query_map(params![param], map)?.collect::<Vec<_>>(),
        None => stmt.query_map([], map)?.collect::<Vec<_>>(),
    };
    Ok(rows
        .into_iter()
        .filter_map(|r| r.ok())
        .map(|id| id as u64)
        .collect())
}

fn add_channel(
    conn: &Connection,
    channel: &model::Channel,
    timing: Timing,
) -> Result<AddOutcome, DbError> {
    // Overwrites are sorted by principal so equality is order-independent.
    let overwrites = channel.permission_overwrites.as_ref().map(|overwrites| {
        let mut sorted = overwrites.clone();
        sorted.sort_by_key(|o| o.id);
        sorted
    });
    let (archived, locked) = match &channel.thread_metadata {
        Some(meta) => (
            Value::Integer(meta.archived as i64),
            Value::Integer(meta.locked as i64),
        ),
        None => (Value::Null, Value::Null),
    };

    snapshot::add(
        conn,
        &CHANNELS,
        &[Value::Integer(channel.id as i64)],
        &[
            opt_id_value(channel.guild_id),
            Value::Integer(channel.kind as i64),
        ],
        &[
            text_value(channel.name.clone()),
            text_value(channel.topic.clone()),
            match channel.position {
                Some(p) => Value::Integer(p),
                None => Value::Null,
            },
            opt_id_value(channel.parent_id),
            match channel.nsfw {
                Some(nsfw) => Value::Integer(nsfw as i64),
                None => Value::Null,
            },
            match &overwrites {
                Some(overwrites) => json_value(overwrites),
                None => Value::Null,
            },
            archived,
            locked,
        ],
        timing,
    )
}

fn add_user(conn: &Connection, user: &model::User, timing: Timing) -> Result<AddOutcome, DbError> {
    snapshot::add(
        conn,
        &USERS,
        &[Value::Integer(user.id as i64)],
        &[],
        &[
            Value::Text(user.username.clone()),
            text_value(user.discriminator.clone()),
            text_value(user.global_name.clone()),
            snapshot::image_hash_value(user.avatar.as_deref()),
            match user.bot {
                Some(bot) => Value::Integer(bot as i64),
                None => Value::Null,
            },
        ],
        timing,
    )
}

/// Distinct webhook identities (same webhook id, different name or avatar)
/// map to distinct synthetic author ids below the snowflake range.
fn webhook_user_id(
    conn: &Connection,
    webhook_id: u64,
    username: &str,
    avatar: Option<&str>,
) -> Result<i64, DbError> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT internal_id FROM webhook_users
             WHERE webhook_id = ?1 AND username IS ?2 AND avatar IS ?3",
            params![webhook_id as i64, username, avatar],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    conn.execute(
        "INSERT INTO webhook_users (webhook_id, username, avatar) VALUES (?1, ?2, ?3)",
        params![webhook_id as i64, username, avatar],
    )?;
    Ok(conn.last_insert_rowid())
}

fn add_message(conn: &Connection, message: &Message, timing: Timing) -> Result<AddOutcome, DbError> {
    let author_id = match message.webhook_id {
        Some(webhook_id) => {
            let synthetic = webhook_user_id(
                conn,
                webhook_id,
                &message.author.username,
                message.author.avatar.as_deref(),
            )?;
            debug_assert!((synthetic as u64) < model::SYNTHETIC_ID_BOUND);
            synthetic
        }
        None => {
            // Harvest an author snapshot from every message observed.
            add_user(conn, &message.author, timing)?;
            message.author.id as i64
        }
    };

    let created_at = message
        .timestamp
        .as_deref()
        .and_then(model::parse_timestamp_millis);
    let edited_at = message
        .edited_timestamp
        .as_deref()
        .and_then(model::parse_timestamp_millis);

    let outcome = snapshot::add(
        conn,
        &MESSAGES,
        &[Value::Integer(message.id as i64)],
        &[
            Value::Integer(message.channel_id as i64),
            opt_id_value(message.guild_id),
            Value::Integer(author_id),
            Value::Integer(message.kind as i64),
            match created_at {
                Some(millis) => Value::Integer(millis),
                None => Value::Null,
            },
        ],
        &[
            Value::Text(message.content.clone()),
            match edited_at {
                Some(millis) => Value::Integer(millis),
                None => Value::Null,
            },
            match message.flags {
                Some(flags) => Value::Integer(flags as i64),
                None => Value::Null,
            },
            Value::Integer(message.pinned as i64),
            json_value(&message.embeds),
            json_value(&message.components),
        ],
        timing,
    )?;

    if matches!(outcome, AddOutcome::First | AddOutcome::Another) {
        for attachment in &message.attachments {
            if !attachment.url.starts_with(CDN_URL_PREFIX) {
                debug!(url = %attachment.url, "attachment URL outside the expected CDN");
            }
            conn.execute(
                "INSERT OR IGNORE INTO attachments (id, message_id, filename, size, url, content_type)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    attachment.id as i64,
                    message.id as i64,
                    attachment.filename,
                    attachment.size as i64,
                    attachment.url,
                    attachment.content_type,
                ],
            )?;
        }
        snapshot::upsert_fts(conn, message.id as i64, &message.content);
    }

    Ok(outcome)
}

fn add_message_partial(
    conn: &Connection,
    update: &MessageUpdate,
    timing: Timing,
) -> Result<AddOutcome, DbError> {
    if update.edited_timestamp.is_none() {
        // Embed backfill: the platform re-sends a message when a link
        // unfurls, without marking it edited. The latest snapshot mutates in
        // place; no history row.
        if update.content.is_some()
            || update.flags.is_some()
            || update.components.is_some()
            || update.attachments.is_some()
        {
            warn!(
                id = update.id,
                "unedited message update touches more than embeds, skipping"
            );
            return Ok(AddOutcome::SameAsLatest);
        }
        let Some(embeds) = &update.embeds else {
            return Ok(AddOutcome::SameAsLatest);
        };
        let updated = conn.execute(
            "UPDATE latest_message_snapshots SET embeds = ?1 WHERE id = ?2",
            params![
                serde_json::to_string(embeds).unwrap_or_else(|_| "[]".into()),
                update.id as i64
            ],
        )?;
        if updated == 0 {
            return Ok(AddOutcome::PartialNoSnapshot);
        }
        debug!(id = update.id, "embed backfill applied in place");
        return Ok(AddOutcome::SameAsLatest);
    }

    let mut partial: Vec<(&str, Value)> = Vec::new();
    if let Some(content) = &update.content {
        partial.push(("content", Value::Text(content.clone())));
    }
    if let Some(edited) = update
        .edited_timestamp
        .as_deref()
        .and_then(model::parse_timestamp_millis)
    {
        partial.push(("edited_at", Value::Integer(edited)));
    }
    if let Some(flags) = update.flags {
        partial.push(("flags", Value::Integer(flags as i64)));
    }
    if let Some(pinned) = update.pinned {
        partial.push(("pinned", Value::Integer(pinned as i64)));
    }
    if let Some(embeds) = &update.embeds {
        partial.push(("embeds", json_value(embeds)));
    }
    if let Some(components) = &update.components {
        partial.push(("components", json_value(components)));
    }

    let outcome = snapshot::add_partial(
        conn,
        &MESSAGES,
        &[Value::Integer(update.id as i64)],
        &partial,
        timing,
    )?;

    if outcome == AddOutcome::Another {
        if let Some(content) = &update.content {
            snapshot::upsert_fts(conn, update.id as i64, content);
        }
    }

    Ok(outcome)
}

/// Unicode emoji have no id; zero keeps the UNIQUE constraint honest, since
/// SQLite treats NULLs as pairwise distinct.
fn emoji_key(conn: &Connection, emoji: &Emoji) -> Result<i64, DbError> {
    let emoji_id = emoji.id.map(|id| id as i64).unwrap_or(0);
    let name = emoji.name.as_deref().unwrap_or("");
    let existing: Option<i64> = conn
        .query_row(
            "SELECT internal_id FROM reaction_emojis WHERE emoji_id = ?1 AND name = ?2",
            params![emoji_id, name],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    conn.execute(
        "INSERT INTO reaction_emojis (emoji_id, name) VALUES (?1, ?2)",
        params![emoji_id, name],
    )?;
    Ok(conn.last_insert_rowid())
}

fn add_reactions(
    conn: &Connection,
    message_id: u64,
    emoji: &Emoji,
    kind: ReactionKind,
    user_ids: &[u64],
    timing: Timing,
) -> Result<(), DbError> {
    let emoji_key = emoji_key(conn, emoji)?;
    let burst = matches!(kind, ReactionKind::Burst) as i64;

    for user_id in user_ids {
        // An open placement means this user already reacted; initial loads
        // overlapping realtime placements dedup here.
        let open: Option<i64> = conn
            .query_row(
                "SELECT rowid FROM reactions
                 WHERE message_id = ?1 AND emoji = ?2 AND user_id = ?3 AND burst = ?4
                   AND end_time IS NULL",
                params![message_id as i64, emoji_key, *user_id as i64, burst],
                |row| row.get(0),
            )
            .optional()?;
        if open.is_some() {
            continue;
        }
        conn.execute(
            "INSERT INTO reactions (message_id, emoji, user_id, burst, start_time)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message_id as i64,
                emoji_key,
                *user_id as i64,
                burst,
                timing.encode()
            ],
        )?;
    }
    Ok(())
}

fn remove_reaction(
    conn: &Connection,
    message_id: u64,
    emoji: &Emoji,
    user_id: u64,
    timing: Timing,
) -> Result<(), DbError> {
    let emoji_key = emoji_key(conn, emoji)?;
    conn.execute(
        "UPDATE reactions SET end_time = ?1
         WHERE message_id = ?2 AND emoji = ?3 AND user_id = ?4 AND end_time IS NULL",
        params![timing.encode(), message_id as i64, emoji_key, user_id as i64],
    )?;
    Ok(())
}

fn remove_all_reactions(
    conn: &Connection,
    message_id: u64,
    emoji: Option<&Emoji>,
    timing: Timing,
) -> Result<(), DbError> {
    match emoji {
        Some(emoji) => {
            let emoji_key = emoji_key(conn, emoji)?;
            conn.execute(
                "UPDATE reactions SET end_time = ?1
                 WHERE message_id = ?2 AND emoji = ?3 AND end_time IS NULL",
                params![timing.encode(), message_id as i64, emoji_key],
            )?;
        }
        None => {
            conn.execute(
                "UPDATE reactions SET end_time = ?1
                 WHERE message_id = ?2 AND end_time IS NULL",
                params![timing.encode(), message_id as i64],
            )?;
        }
    }
    Ok(())
}
