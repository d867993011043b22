//! Single-writer snapshot store.
//!
//! All persisted state flows through one dedicated thread owning the SQLite
//! connection. Every other component holds a [`DbHandle`] and speaks the
//! typed request surface; the writer compares each observation against the
//! latest stored snapshot and appends only on inequality, so history is
//! never overwritten.

pub mod schema;
pub mod snapshot;
pub mod store;

use std::path::Path;
use std::sync::mpsc as std_mpsc;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::Connection;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::info;

use crate::model::{
    ChannelId, Emoji, GuildId, Message, MessageId, MessageUpdate, ReactionKind, UserId,
};

/// Observation time plus how it was observed. Stored as
/// `(millis << 1) | realtime`; zero means "existed before archival".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timing {
    pub millis: i64,
    pub realtime: bool,
}

impl Timing {
    /// Sentinel for "existed since before archival started".
    pub const EPOCH: Timing = Timing {
        millis: 0,
        realtime: false,
    };

    pub fn now(realtime: bool) -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Timing { millis, realtime }
    }

    pub fn encode(self) -> i64 {
        (self.millis << 1) | (self.realtime as i64)
    }

    pub fn decode(raw: i64) -> Self {
        Timing {
            millis: raw >> 1,
            realtime: raw & 1 == 1,
        }
    }
}

/// Result of a snapshot add.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// No row existed for this id; inserted.
    First,
    /// The latest row differed; it was copied to history and replaced.
    Another,
    /// Field-by-field equal to the latest row; nothing written.
    SameAsLatest,
    /// Partial update with no stored base to merge into.
    PartialNoSnapshot,
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A changed snapshot arrived with a timestamp not newer than the stored
    /// one. This can only be a caller bug and is fatal.
    #[error("snapshot timestamp not increasing for {table} id {id}")]
    TimestampOrder { table: &'static str, id: u64 },
    #[error("database writer has shut down")]
    Closed,
}

type Reply<T> = oneshot::Sender<Result<T, DbError>>;

/// Typed request surface. Commands, point mutations, and queries all
/// serialize through the writer thread.
pub enum DbRequest {
    Begin {
        reply: Reply<()>,
    },
    Commit {
        reply: Reply<()>,
    },
    Optimize {
        reply: Reply<()>,
    },
    Close {
        reply: Reply<()>,
    },

    AddGuildSnapshot {
        id: GuildId,
        name: Option<String>,
        owner_id: Option<UserId>,
        timing: Timing,
        reply: Reply<AddOutcome>,
    },
    AddChannelSnapshot {
        channel: crate::model::Channel,
        timing: Timing,
        reply: Reply<AddOutcome>,
    },
    AddRoleSnapshot {
        guild_id: GuildId,
        role: crate::model::Role,
        timing: Timing,
        reply: Reply<AddOutcome>,
    },
    AddMemberSnapshot {
        guild_id: GuildId,
        user_id: UserId,
        nick: Option<String>,
        roles: Vec<u64>,
        joined_at: Option<String>,
        timing: Timing,
        reply: Reply<AddOutcome>,
    },
    /// The distinguished "this user left" form: all membership fields null,
    /// so a later rejoin is representable as another snapshot.
    AddMemberLeave {
        guild_id: GuildId,
        user_id: UserId,
        timing: Timing,
        reply: Reply<AddOutcome>,
    },
    AddUserSnapshot {
        user: crate::model::User,
        timing: Timing,
        reply: Reply<AddOutcome>,
    },
    AddMessageSnapshot {
        message: Box<Message>,
        timing: Timing,
        reply: Reply<AddOutcome>,
    },
    AddMessagePartial {
        update: Box<MessageUpdate>,
        timing: Timing,
        reply: Reply<AddOutcome>,
    },
    MarkMessageDeleted {
        id: MessageId,
        timing: Timing,
        reply: Reply<()>,
    },
    MarkChannelDeleted {
        id: ChannelId,
        timing: Timing,
        reply: Reply<()>,
    },
    MarkRoleDeleted {
        id: u64,
        timing: Timing,
        reply: Reply<()>,
    },
    MarkGuildDeleted {
        id: GuildId,
        timing: Timing,
        reply: Reply<()>,
    },

    AddInitialReactions {
        message_id: MessageId,
        emoji: Emoji,
        kind: ReactionKind,
        user_ids: Vec<UserId>,
        reply: Reply<()>,
    },
    AddReactionPlacement {
        message_id: MessageId,
        emoji: Emoji,
        kind: ReactionKind,
        user_id: UserId,
        timing: Timing,
        reply: Reply<()>,
    },
    RemoveReaction {
        message_id: MessageId,
        emoji: Emoji,
        user_id: UserId,
        timing: Timing,
        reply: Reply<()>,
    },
    /// Close every open placement on a message, optionally for one emoji.
    RemoveAllReactions {
        message_id: MessageId,
        emoji: Option<Emoji>,
        timing: Timing,
        reply: Reply<()>,
    },

    SyncGuildMembers {
        guild_id: GuildId,
        user_ids: Vec<UserId>,
        timing: Timing,
        reply: Reply<()>,
    },

    GetLastMessageId {
        channel_id: ChannelId,
        reply: Reply<Option<MessageId>>,
    },
    GetMessageIds {
        channel_id: ChannelId,
        reply: Reply<Vec<MessageId>>,
    },
    SearchMessages {
        query: String,
        reply: Reply<Vec<MessageId>>,
    },
    IterGuilds {
        reply: Reply<Vec<(GuildId, Option<String>)>>,
    },
    IterChannels {
        guild_id: GuildId,
        reply: Reply<Vec<(ChannelId, Option<String>)>>,
    },
}

/// Cloneable handle to the writer thread.
#[derive(Clone)]
pub struct DbHandle {
    tx: std_mpsc::Sender<DbRequest>,
}

/// Open (or create) the store and start the writer thread.
pub fn open(path: &Path) -> Result<DbHandle, DbError> {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    schema::migrate(&conn)?;

    let (tx, rx) = std_mpsc::channel::<DbRequest>();
    std::thread::Builder::new()
        .name("db-writer".into())
        .spawn(move || writer_loop(conn, rx))
        .expect("failed to spawn database writer thread");

    info!(path = %path.display(), "database open");
    Ok(DbHandle { tx })
}

fn writer_loop(conn: Connection, rx: std_mpsc::Receiver<DbRequest>) {
    while let Ok(request) = rx.recv() {
        match request {
            DbRequest::Close { reply } => {
                let result = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
                let _ = reply.send(result.map_err(DbError::from));
                break;
            }
            other => store::handle_request(&conn, other),
        }
    }
}

macro_rules! ask {
    ($self:expr, $variant:ident { $($field:ident $(: $value:expr)?),* $(,)? }) => {{
        let (reply, rx) = oneshot::channel();
        $self
            .tx
            .send(DbRequest::$variant { $($field $(: $value)?,)* reply })
            .map_err(|_| DbError::Closed)?;
        rx.await.map_err(|_| DbError::Closed)?
    }};
}

impl DbHandle {
    pub async fn begin(&self) -> Result<(), DbError> {
        ask!(self, Begin {})
    }

    pub async fn commit(&self) -> Result<(), DbError> {
        ask!(self, Commit {})
    }

    pub async fn optimize(&self) -> Result<(), DbError> {
        ask!(self, Optimize {})
    }

    pub async fn close(&self) -> Result<(), DbError> {
        ask!(self, Close {})
    }

    pub async fn add_guild_snapshot(
        &self,
        id: GuildId,
        name: Option<String>,
        owner_id: Option<UserId>,
        timing: Timing,
    ) -> Result<AddOutcome, DbError> {
        ask!(self, AddGuildSnapshot { id, name, owner_id, timing })
    }

    pub async fn add_channel_snapshot(
        &self,
        channel: crate::model::Channel,
        timing: Timing,
    ) -> Result<AddOutcome, DbError> {
        ask!(self, AddChannelSnapshot { channel, timing })
    }

    pub async fn add_role_snapshot(
        &self,
        guild_id: GuildId,
        role: crate::model::Role,
        timing: Timing,
    ) -> Result<AddOutcome, DbError> {
        ask!(self, AddRoleSnapshot { guild_id, role, timing })
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn add_member_snapshot(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        nick: Option<String>,
        roles: Vec<u64>,
        joined_at: Option<String>,
        timing: Timing,
    ) -> Result<AddOutcome, DbError> {
        ask!(self, AddMemberSnapshot {
            guild_id,
            user_id,
            nick,
            roles,
            joined_at,
            timing,
        })
    }

    pub async fn add_member_leave(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        timing: Timing,
    ) -> Result<AddOutcome, DbError> {
        ask!(self, AddMemberLeave { guild_id, user_id, timing })
    }

    pub async fn add_user_snapshot(
        &self,
        user: crate::model::User,
        timing: Timing,
    ) -> Result<AddOutcome, DbError> {
        ask!(self, AddUserSnapshot { user, timing })
    }

    pub async fn add_message_snapshot(
        &self,
        message: Message,
        timing: Timing,
    ) -> Result<AddOutcome, DbError> {
        ask!(self, AddMessageSnapshot { message: Box::new(message), timing })
    }

    pub async fn add_message_partial(
        &self,
        update: MessageUpdate,
        timing: Timing,
    ) -> Result<AddOutcome, DbError> {
        ask!(self, AddMessagePartial { update: Box::new(update), timing })
    }

    pub async fn mark_message_deleted(&self, id: MessageId, timing: Timing) -> Result<(), DbError> {
        ask!(self, MarkMessageDeleted { id, timing })
    }

    pub async fn mark_channel_deleted(&self, id: ChannelId, timing: Timing) -> Result<(), DbError> {
        ask!(self, MarkChannelDeleted { id, timing })
    }

    pub async fn mark_role_deleted(&self, id: u64, timing: Timing) -> Result<(), DbError> {
        ask!(self, MarkRoleDeleted { id, timing })
    }

    pub async fn mark_guild_deleted(&self, id: GuildId, timing: Timing) -> Result<(), DbError> {
        ask!(self, MarkGuildDeleted { id, timing })
    }

    pub async fn add_initial_reactions(
        &self,
        message_id: MessageId,
        emoji: Emoji,
        kind: ReactionKind,
        user_ids: Vec<UserId>,
    ) -> Result<(), DbError> {
        ask!(self, AddInitialReactions {
            message_id,
            emoji,
            kind,
            user_ids,
        })
    }

    pub async fn add_reaction_placement(
        &self,
        message_id: MessageId,
        emoji: Emoji,
        kind: ReactionKind,
        user_id: UserId,
        timing: Timing,
    ) -> Result<(), DbError> {
        ask!(self, AddReactionPlacement {
            message_id,
            emoji,
            kind,
            user_id,
            timing,
        })
    }

    pub async fn remove_reaction(
        &self,
        message_id: MessageId,
        emoji: Emoji,
        user_id: UserId,
        timing: Timing,
    ) -> Result<(), DbError> {
        ask!(self, RemoveReaction {
            message_id,
            emoji,
            user_id,
            timing,
        })
    }

    pub async fn remove_all_reactions(
        &self,
        message_id: MessageId,
        emoji: Option<Emoji>,
        timing: Timing,
    ) -> Result<(), DbError> {
        ask!(self, RemoveAllReactions { message_id, emoji, timing })
    }

    pub async fn sync_guild_members(
        &self,
        guild_id: GuildId,
        user_ids: Vec<UserId>,
        timing: Timing,
    ) -> Result<(), DbError> {
        ask!(self, SyncGuildMembers { guild_id, user_ids, timing })
    }

    pub async fn get_last_message_id(
        &self,
        channel_id: ChannelId,
    ) -> Result<Option<MessageId>, DbError> {
        ask!(self, GetLastMessageId { channel_id })
    }

    pub async fn get_message_ids(
        &self,
        channel_id: ChannelId,
    ) -> Result<Vec<MessageId>, DbError> {
        ask!(self, GetMessageIds { channel_id })
    }

    pub async fn search_messages(&self, query: String) -> Result<Vec<MessageId>, DbError> {
        ask!(self, SearchMessages { query })
    }

    pub async fn iter_guilds(&self) -> Result<Vec<(GuildId, Option<String>)>, DbError> {
        ask!(self, IterGuilds {})
    }

    pub async fn iter_channels(
        &self,
        guild_id: GuildId,
    ) -> Result<Vec<(ChannelId, Option<String>)>, DbError> {
        ask!(self, IterChannels { guild_id })
    }
}
