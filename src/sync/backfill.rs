//! The concurrent pagination loops: message history backfill and archived
//! thread enumeration. Each runs as its own task holding clones of the REST
//! client and database handle plus an abort token; everything else stays
//! with the orchestrator.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::ThreadInfo;
use crate::db::{AddOutcome, DbError, DbHandle, Timing};
use crate::model::{ChannelId, Emoji, GuildId, Message, MessageId, ReactionKind, User};
use crate::rest::{ArchivedThreadKind, ResetGate, RestClient, RestError, PAGE_LIMIT};

use super::Event;

/// How long a backfill that lost access waits for the permission-change
/// path to abort it before giving up on its own.
const HANG_CEILING: Duration = Duration::from_secs(15 * 60);

#[derive(Debug)]
pub enum SyncOutcome {
    /// Paginated to the end, or met already-stored history (the
    /// realtime/backfill join point).
    Complete,
    /// The store already held everything the cache knew about.
    UpToDate,
    Aborted,
    /// Lost access and nobody reassigned the work within the ceiling.
    NoAccess,
    /// The account's credentials were rejected mid-operation.
    AuthFailed,
    Failed(String),
}

#[derive(Debug, Error)]
enum SyncError {
    #[error(transparent)]
    Rest(#[from] RestError),
    #[error(transparent)]
    Db(#[from] DbError),
}

pub struct MessageSyncTask {
    pub db: DbHandle,
    pub rest: RestClient,
    pub token: CancellationToken,
    pub channel_id: ChannelId,
    pub known_last_message_id: Option<MessageId>,
    pub no_reactions: bool,
}

pub struct ThreadListTask {
    pub db: DbHandle,
    pub rest: RestClient,
    pub token: CancellationToken,
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub kind: ArchivedThreadKind,
    pub events: mpsc::UnboundedSender<Event>,
}

pub async fn run_message_sync(task: MessageSyncTask) -> SyncOutcome {
    match message_sync(&task).await {
        Ok(outcome) => outcome,
        Err(err) => map_error(err, &task.token).await,
    }
}

pub async fn run_thread_list_sync(task: ThreadListTask) -> SyncOutcome {
    match thread_list_sync(&task).await {
        Ok(outcome) => outcome,
        Err(err) => map_error(err, &task.token).await,
    }
}

async fn map_error(err: SyncError, token: &CancellationToken) -> SyncOutcome {
    match err {
        SyncError::Rest(RestError::Aborted) => SyncOutcome::Aborted,
        SyncError::Rest(RestError::AuthFailed) => SyncOutcome::AuthFailed,
        // Usually a transient permission flux; the permission-change path is
        // expected to abort this operation and start a replacement shortly.
        SyncError::Rest(RestError::Denied(status)) => {
            warn!(status, "backfill lost access, waiting to be reassigned");
            match tokio::time::timeout(HANG_CEILING, token.cancelled()).await {
                Ok(()) => SyncOutcome::Aborted,
                Err(_) => SyncOutcome::NoAccess,
            }
        }
        other => SyncOutcome::Failed(other.to_string()),
    }
}

async fn wait_gate(gate: &ResetGate, token: &CancellationToken) -> Result<(), RestError> {
    tokio::select! {
        _ = token.cancelled() => Err(RestError::Aborted),
        _ = gate.ready() => Ok(()),
    }
}

/// Paginate channel history from the last stored message forward.
///
/// Pages arrive newest-first but are inserted oldest-first, so the store's
/// max id always marks a contiguous prefix of history and resumption from
/// it is safe at any interruption point. Reactionless messages batch into
/// one transaction per page; each message with reactions gets its reactor
/// enumeration plus its own transaction.
async fn message_sync(task: &MessageSyncTask) -> Result<SyncOutcome, SyncError> {
    let stored_max = task.db.get_last_message_id(task.channel_id).await?;
    if let (Some(stored), Some(known)) = (stored_max, task.known_last_message_id) {
        if stored >= known {
            return Ok(SyncOutcome::UpToDate);
        }
    }

    let mut cursor = stored_max.unwrap_or(0);
    let mut gate = ResetGate::immediate();

    loop {
        wait_gate(&gate, &task.token).await?;
        let (page, next_gate) = task
            .rest
            .get_channel_messages(task.channel_id, cursor, &task.token)
            .await?;
        gate = next_gate;

        if page.is_empty() {
            return Ok(SyncOutcome::Complete);
        }
        let full_page = page.len() >= PAGE_LIMIT;

        let mut batch_open = false;
        // Newest-first within the page; insert oldest-first.
        for message in page.iter().rev() {
            if task.token.is_cancelled() {
                if batch_open {
                    task.db.commit().await?;
                }
                return Ok(SyncOutcome::Aborted);
            }
            cursor = cursor.max(message.id);

            let wants_reactions = !task.no_reactions && !message.reactions.is_empty();
            if !wants_reactions {
                if !batch_open {
                    task.db.begin().await?;
                    batch_open = true;
                }
                let outcome = task
                    .db
                    .add_message_snapshot(message.clone(), Timing::now(false))
                    .await?;
                if outcome != AddOutcome::First {
                    // Realtime already stored this id: the join point.
                    task.db.commit().await?;
                    debug!(channel = task.channel_id, id = message.id, "met stored history");
                    return Ok(SyncOutcome::Complete);
                }
            } else {
                if batch_open {
                    task.db.commit().await?;
                    batch_open = false;
                }
                // Enumerate reactors before opening the transaction.
                let loads = fetch_initial_reactions(task, message).await?;

                task.db.begin().await?;
                let outcome = task
                    .db
                    .add_message_snapshot(message.clone(), Timing::now(false))
                    .await?;
                for (emoji, kind, users) in loads {
                    for user in &users {
                        task.db
                            .add_user_snapshot(user.clone(), Timing::now(false))
                            .await?;
                    }
                    let ids: Vec<u64> = users.iter().map(|u| u.id).collect();
                    task.db
                        .add_initial_reactions(message.id, emoji, kind, ids)
                        .await?;
                }
                task.db.commit().await?;

                if outcome != AddOutcome::First {
                    debug!(channel = task.channel_id, id = message.id, "met stored history");
                    return Ok(SyncOutcome::Complete);
                }
            }
        }
        if batch_open {
            task.db.commit().await?;
        }

        if !full_page {
            return Ok(SyncOutcome::Complete);
        }
    }
}

/// Fetch every (emoji, kind) reactor list for one message, each with its own
/// ascending-id pagination.
async fn fetch_initial_reactions(
    task: &MessageSyncTask,
    message: &Message,
) -> Result<Vec<(Emoji, ReactionKind, Vec<User>)>, SyncError> {
    let mut out = Vec::new();

    for group in &message.reactions {
        let mut kinds = Vec::new();
        match &group.count_details {
            Some(details) => {
                if details.normal > 0 {
                    kinds.push(ReactionKind::Normal);
                }
                if details.burst > 0 {
                    kinds.push(ReactionKind::Burst);
                }
            }
            None => kinds.push(ReactionKind::Normal),
        }
        if kinds.is_empty() {
            kinds.push(ReactionKind::Normal);
        }

        let route = group.emoji.reaction_route();
        for kind in kinds {
            let mut users: Vec<User> = Vec::new();
            let mut after = 0u64;
            let mut gate = ResetGate::immediate();
            loop {
                wait_gate(&gate, &task.token).await?;
                let (page, next_gate) = task
                    .rest
                    .get_reaction_users(
                        task.channel_id,
                        message.id,
                        &route,
                        kind,
                        after,
                        &task.token,
                    )
                    .await?;
                gate = next_gate;

                if page.is_empty() {
                    break;
                }
                let short = page.len() < PAGE_LIMIT;
                if let Some(last) = page.last() {
                    after = last.id;
                }
                users.extend(page);
                if short {
                    break;
                }
            }
            out.push((group.emoji.clone(), kind, users));
        }
    }

    Ok(out)
}

/// Paginate an archived-thread listing, recording a channel snapshot for
/// every thread and reporting each back for message-sync scheduling. The
/// `before` cursor advances to the oldest thread id seen.
async fn thread_list_sync(task: &ThreadListTask) -> Result<SyncOutcome, SyncError> {
    let mut before: Option<String> = None;
    let mut gate = ResetGate::immediate();

    loop {
        wait_gate(&gate, &task.token).await?;
        let (page, next_gate) = task
            .rest
            .list_archived_threads(task.channel_id, task.kind, before.as_deref(), &task.token)
            .await?;
        gate = next_gate;

        if page.threads.is_empty() {
            return Ok(SyncOutcome::Complete);
        }

        let mut oldest: Option<u64> = None;
        for thread in &page.threads {
            task.db
                .add_channel_snapshot(thread.clone(), Timing::now(false))
                .await?;
            oldest = Some(oldest.map_or(thread.id, |o: u64| o.min(thread.id)));
            if let Some(info) = ThreadInfo::from_channel(thread) {
                let _ = task.events.send(Event::ThreadDiscovered {
                    guild_id: task.guild_id,
                    thread: info,
                });
            }
        }

        if !page.has_more {
            return Ok(SyncOutcome::Complete);
        }
        before = oldest.map(|id| id.to_string());
    }
}
