//! Generic snapshot protocol shared by every entity kind.
//!
//! A kind is described by its table pair plus three column groups: the key,
//! the fixed columns written once at insert, and the monitored columns whose
//! change produces a new snapshot.

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use tracing::debug;

use super::{AddOutcome, DbError, Timing};

pub(crate) struct SnapshotTable {
    pub latest: &'static str,
    pub previous: &'static str,
    pub key: &'static [&'static str],
    pub fixed: &'static [&'static str],
    pub monitored: &'static [&'static str],
}

pub(crate) const GUILDS: SnapshotTable = SnapshotTable {
    latest: "latest_guild_snapshots",
    previous: "previous_guild_snapshots",
    key: &["id"],
    fixed: &[],
    monitored: &["name", "owner_id"],
};

pub(crate) const CHANNELS: SnapshotTable = SnapshotTable {
    latest: "latest_channel_snapshots",
    previous: "previous_channel_snapshots",
    key: &["id"],
    fixed: &["guild_id", "kind"],
    monitored: &[
        "name",
        "topic",
        "position",
        "parent_id",
        "nsfw",
        "overwrites",
        "thread_archived",
        "thread_locked",
    ],
};

pub(crate) const ROLES: SnapshotTable = SnapshotTable {
    latest: "latest_role_snapshots",
    previous: "previous_role_snapshots",
    key: &["id"],
    fixed: &["guild_id"],
    monitored: &[
        "name",
        "permissions",
        "position",
        "color",
        "hoist",
        "mentionable",
    ],
};

pub(crate) const MEMBERS: SnapshotTable = SnapshotTable {
    latest: "latest_member_snapshots",
    previous: "previous_member_snapshots",
    key: &["guild_id", "user_id"],
    fixed: &[],
    monitored: &["nick", "roles", "joined_at"],
};

pub(crate) const USERS: SnapshotTable = SnapshotTable {
    latest: "latest_user_snapshots",
    previous: "previous_user_snapshots",
    key: &["id"],
    fixed: &[],
    monitored: &["username", "discriminator", "global_name", "avatar", "bot"],
};

pub(crate) const MESSAGES: SnapshotTable = SnapshotTable {
    latest: "latest_message_snapshots",
    previous: "previous_message_snapshots",
    key: &["id"],
    fixed: &["channel_id", "guild_id", "author_id", "kind", "created_at"],
    monitored: &["content", "edited_at", "flags", "pinned", "embeds", "components"],
};

fn where_clause(key: &[&str]) -> String {
    key.iter()
        .enumerate()
        .map(|(i, col)| format!("{col} = ?{}", i + 1))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// The latest row's timestamp and monitored values, if one exists.
fn load_latest(
    conn: &Connection,
    table: &SnapshotTable,
    key_vals: &[Value],
) -> Result<Option<(i64, Vec<Value>)>, rusqlite::Error> {
    let sql = format!(
        "SELECT _timestamp, {} FROM {} WHERE {}",
        table.monitored.join(", "),
        table.latest,
        where_clause(table.key),
    );
    conn.query_row(&sql, params_from_iter(key_vals.iter()), |row| {
        let timestamp: i64 = row.get(0)?;
        let mut values = Vec::with_capacity(table.monitored.len());
        for i in 0..table.monitored.len() {
            values.push(row.get::<_, Value>(i + 1)?);
        }
        Ok((timestamp, values))
    })
    .optional()
}

fn insert_latest(
    conn: &Connection,
    table: &SnapshotTable,
    key_vals: &[Value],
    fixed_vals: &[Value],
    monitored_vals: &[Value],
    timing: Timing,
) -> Result<(), rusqlite::Error> {
    let mut cols: Vec<&str> = table.key.to_vec();
    cols.push("_timestamp");
    cols.extend_from_slice(table.fixed);
    cols.extend_from_slice(table.monitored);
    let placeholders: Vec<String> = (1..=cols.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table.latest,
        cols.join(", "),
        placeholders.join(", "),
    );

    let mut values: Vec<Value> = key_vals.to_vec();
    values.push(Value::Integer(timing.encode()));
    values.extend_from_slice(fixed_vals);
    values.extend_from_slice(monitored_vals);
    conn.execute(&sql, params_from_iter(values.iter()))?;
    Ok(())
}

fn replace_latest(
    conn: &Connection,
    table: &SnapshotTable,
    key_vals: &[Value],
    monitored_vals: &[Value],
    timing: Timing,
) -> Result<(), rusqlite::Error> {
    // History first: copy the current latest row verbatim.
    let copy = format!(
        "INSERT INTO {} SELECT * FROM {} WHERE {}",
        table.previous,
        table.latest,
        where_clause(table.key),
    );
    conn.execute(&copy, params_from_iter(key_vals.iter()))?;

    let assignments: Vec<String> = std::iter::once("_timestamp".to_string())
        .chain(table.monitored.iter().map(|c| c.to_string()))
        .enumerate()
        .map(|(i, col)| format!("{col} = ?{}", key_vals.len() + i + 1))
        .collect();
    let sql = format!(
        "UPDATE {} SET {} WHERE {}",
        table.latest,
        assignments.join(", "),
        where_clause(table.key),
    );

    let mut values: Vec<Value> = key_vals.to_vec();
    values.push(Value::Integer(timing.encode()));
    values.extend_from_slice(monitored_vals);
    conn.execute(&sql, params_from_iter(values.iter()))?;
    Ok(())
}

fn entity_id(key_vals: &[Value]) -> u64 {
    key_vals
        .iter()
        .find_map(|v| match v {
            Value::Integer(i) => Some(*i as u64),
            _ => None,
        })
        .unwrap_or(0)
}

/// Full snapshot add. Insert on absence, no-op on equality, history copy
/// plus in-place update on change.
pub(crate) fn add(
    conn: &Connection,
    table: &SnapshotTable,
    key_vals: &[Value],
    fixed_vals: &[Value],
    monitored_vals: &[Value],
    timing: Timing,
) -> Result<AddOutcome, DbError> {
    match load_latest(conn, table, key_vals)? {
        None => {
            insert_latest(conn, table, key_vals, fixed_vals, monitored_vals, timing)?;
            Ok(AddOutcome::First)
        }
        Some((stored_timestamp, stored_values)) => {
            if stored_values == monitored_vals {
                return Ok(AddOutcome::SameAsLatest);
            }
            if timing.encode() <= stored_timestamp {
                return Err(DbError::TimestampOrder {
                    table: table.latest,
                    id: entity_id(key_vals),
                });
            }
            replace_latest(conn, table, key_vals, monitored_vals, timing)?;
            Ok(AddOutcome::Another)
        }
    }
}

/// Partial add: merge the provided columns over the latest row, then follow
/// the full-add rules. Without a base row there is nothing to merge into.
pub(crate) fn add_partial(
    conn: &Connection,
    table: &SnapshotTable,
    key_vals: &[Value],
    partial: &[(&str, Value)],
    timing: Timing,
) -> Result<AddOutcome, DbError> {
    let Some((stored_timestamp, stored_values)) = load_latest(conn, table, key_vals)? else {
        return Ok(AddOutcome::PartialNoSnapshot);
    };

    let mut merged = stored_values.clone();
    for (col, value) in partial {
        match table.monitored.iter().position(|c| c == col) {
            Some(i) => merged[i] = value.clone(),
            None => debug!(column = col, "partial update touches unmonitored column"),
        }
    }

    if merged == stored_values {
        return Ok(AddOutcome::SameAsLatest);
    }
    if timing.encode() <= stored_timestamp {
        return Err(DbError::TimestampOrder {
            table: table.latest,
            id: entity_id(key_vals),
        });
    }
    replace_latest(conn, table, key_vals, &merged, timing)?;
    Ok(AddOutcome::Another)
}

/// Set the deletion marker on the latest row, if one exists.
pub(crate) fn mark_deleted(
    conn: &Connection,
    table: &SnapshotTable,
    key_vals: &[Value],
    timing: Timing,
) -> Result<(), DbError> {
    let sql = format!(
        "UPDATE {} SET _deleted = ?{} WHERE {}",
        table.latest,
        key_vals.len() + 1,
        where_clause(table.key),
    );
    let mut values: Vec<Value> = key_vals.to_vec();
    values.push(Value::Integer(timing.encode()));
    let updated = conn.execute(&sql, params_from_iter(values.iter()))?;
    if updated == 0 {
        debug!(table = table.latest, id = entity_id(key_vals), "deletion for unseen entity");
    }
    Ok(())
}

/// Image hashes matching the CDN pattern compact to 17 bytes: one animation
/// flag byte plus the 16 raw hash bytes. Everything else stays text.
pub fn compact_image_hash(hash: &str) -> Option<Vec<u8>> {
    let (animated, hex_part) = match hash.strip_prefix("a_") {
        Some(rest) => (1u8, rest),
        None => (0u8, hash),
    };
    if hex_part.len() != 32 || !hex_part.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let bytes = hex::decode(hex_part).ok()?;
    let mut out = Vec::with_capacity(17);
    out.push(animated);
    out.extend_from_slice(&bytes);
    Some(out)
}

pub(crate) fn image_hash_value(hash: Option<&str>) -> Value {
    match hash {
        None => Value::Null,
        Some(hash) => match compact_image_hash(hash) {
            Some(bytes) => Value::Blob(bytes),
            None => {
                debug!(hash, "image hash does not match CDN pattern, storing as text");
                Value::Text(hash.to_string())
            }
        },
    }
}

pub(crate) fn upsert_fts(conn: &Connection, message_id: i64, content: &str) {
    let _ = conn.execute(
        "DELETE FROM message_fts WHERE message_id = ?1",
        [message_id],
    );
    let _ = conn.execute(
        "INSERT INTO message_fts (message_id, content) VALUES (?1, ?2)",
        rusqlite::params![message_id, content],
    );
}
