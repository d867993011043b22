//! The sync orchestrator.
//!
//! One task owns the cache and every account's registries. It merges gateway
//! dispatches from all accounts with completion notices from backfill tasks
//! into a single ordered stream of database writes, picks the least-loaded
//! eligible account for each new job, and aborts and hands off work when
//! permissions shift under it.

pub mod backfill;

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{
    pick_least_gateway_loaded, pick_least_rest_loaded, AccountIx, AccountState, CachedGuild,
    ChannelSyncInfo, SyncKind, SyncOp, ThreadInfo,
};
use crate::db::{DbHandle, Timing};
use crate::gateway::{self, GatewayEvent, GatewayOptions};
use crate::model::{
    self, Channel, ChannelId, Guild, GuildId, Member, Message, MessageUpdate, Role, UserId,
};
use crate::rest::{ArchivedThreadKind, RestClient};

use backfill::{MessageSyncTask, SyncOutcome, ThreadListTask};

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Empty means "every visible server".
    pub guild_filter: HashSet<GuildId>,
    /// Disable all backfill; realtime archival only.
    pub no_sync: bool,
    /// Skip reaction enumeration and reaction dispatches.
    pub no_reactions: bool,
    /// Periodic progress summaries to the log.
    pub stats: bool,
}

/// Everything the orchestrator reacts to, from any source.
pub enum Event {
    Gateway {
        ix: AccountIx,
        event: GatewayEvent,
    },
    SyncFinished {
        ix: AccountIx,
        kind: SyncKind,
        parent_id: ChannelId,
        target_id: ChannelId,
        outcome: SyncOutcome,
    },
    /// A thread-list sync found a thread worth backfilling.
    ThreadDiscovered {
        guild_id: GuildId,
        thread: ThreadInfo,
    },
}

pub struct Orchestrator {
    db: DbHandle,
    options: SyncOptions,
    accounts: Vec<AccountState>,
    cache: HashMap<GuildId, CachedGuild>,
    /// Member enumerations waiting for an account slot to free up.
    pending_member_requests: VecDeque<GuildId>,
    all_ready: bool,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Connect a gateway session per token and assemble the orchestrator.
    pub fn new(
        db: DbHandle,
        tokens: &[String],
        options: SyncOptions,
        shutdown: CancellationToken,
    ) -> Result<Self, crate::rest::RestError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut accounts = Vec::with_capacity(tokens.len());
        for (ix, token) in tokens.iter().enumerate() {
            let (handle, mut gateway_rx) = gateway::connect(GatewayOptions::new(token));
            let rest = RestClient::new(token)?;
            let name = format!("account-{}", ix + 1);

            // Forward this account's gateway stream into the shared queue.
            let tx = events_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = gateway_rx.recv().await {
                    if tx.send(Event::Gateway { ix, event }).is_err() {
                        break;
                    }
                }
            });

            accounts.push(AccountState::new(name, token.clone(), handle, rest));
        }

        Ok(Orchestrator {
            db,
            options,
            accounts,
            cache: HashMap::new(),
            pending_member_requests: VecDeque::new(),
            all_ready: false,
            events_tx,
            events_rx,
            shutdown,
        })
    }

    pub async fn run(mut self) -> Result<(), crate::Error> {
        let mut stats = tokio::time::interval(std::time::Duration::from_secs(60));
        stats.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.shut_down().await;
                    return Ok(());
                }
                _ = stats.tick(), if self.options.stats => {
                    self.log_stats();
                }
                event = self.events_rx.recv() => {
                    let Some(event) = event else {
                        self.shut_down().await;
                        return Ok(());
                    };
                    if let Err(err) = self.handle_event(event).await {
                        error!(error = %err, "fatal error, shutting down");
                        self.shutdown.cancel();
                        self.shut_down().await;
                        return Err(err);
                    }
                }
            }
        }
    }

    async fn shut_down(&mut self) {
        info!("shutting down");
        for account in &mut self.accounts {
            account.gateway.destroy();
            account.abort_all();
        }
        if let Err(err) = self.db.optimize().await {
            warn!(error = %err, "optimize on shutdown failed");
        }
        if let Err(err) = self.db.close().await {
            warn!(error = %err, "database close failed");
        }
    }

    fn log_stats(&self) {
        for account in &self.accounts {
            if account.removed {
                continue;
            }
            info!(
                account = %account.name,
                rest_ops = account.rest_ops,
                gateway_ops = account.gateway_ops,
                message_syncs = account.message_syncs.len() + account.private_thread_syncs.len(),
                thread_lists = account.public_thread_list_syncs.len()
                    + account.private_thread_list_syncs.len()
                    + account.joined_thread_list_syncs.len(),
                "sync progress"
            );
        }
    }

    fn guild_allowed(&self, guild_id: GuildId) -> bool {
        self.options.guild_filter.is_empty() || self.options.guild_filter.contains(&guild_id)
    }

    async fn handle_event(&mut self, event: Event) -> Result<(), crate::Error> {
        match event {
            Event::Gateway { ix, event } => self.handle_gateway_event(ix, event).await,
            Event::SyncFinished {
                ix,
                kind,
                parent_id,
                target_id,
                outcome,
            } => {
                self.handle_sync_finished(ix, kind, parent_id, target_id, outcome);
                Ok(())
            }
            Event::ThreadDiscovered { guild_id, thread } => {
                self.spawn_thread_message_sync(guild_id, thread);
                Ok(())
            }
        }
    }

    async fn handle_gateway_event(
        &mut self,
        ix: AccountIx,
        event: GatewayEvent,
    ) -> Result<(), crate::Error> {
        match event {
            GatewayEvent::Connecting => {
                debug!(account = %self.accounts[ix].name, "gateway connecting");
                Ok(())
            }
            GatewayEvent::ConnectionLost {
                was_connected,
                code,
                reason,
            } => {
                debug!(
                    account = %self.accounts[ix].name,
                    was_connected, ?code, %reason, "gateway connection lost"
                );
                Ok(())
            }
            GatewayEvent::SessionLost => {
                self.handle_session_lost(ix);
                Ok(())
            }
            GatewayEvent::Dispatch { dispatch, live } => {
                let name = dispatch.name;
                match self.handle_dispatch(ix, &name, dispatch.data, live).await {
                    // A payload this archiver cannot parse is logged and
                    // skipped, not fatal.
                    Err(crate::Error::Payload(err)) => {
                        warn!(event = %name, error = %err, "malformed dispatch payload, skipping");
                        Ok(())
                    }
                    other => other,
                }
            }
            GatewayEvent::Error(err) => self.handle_gateway_error(ix, err),
        }
    }

    /// Any in-flight member enumeration on this account died with the
    /// session; the bulk pass will request it again when appropriate.
    fn handle_session_lost(&mut self, ix: AccountIx) {
        let account = &mut self.accounts[ix];
        if let Some(guild_id) = account.member_request.take() {
            account.gateway_ops = account.gateway_ops.saturating_sub(1);
            account.member_buffer.clear();
            if let Some(guild) = self.cache.get_mut(&guild_id) {
                guild.member_ids = None;
            }
            warn!(
                account = %self.accounts[ix].name,
                guild_id, "member enumeration lost with session"
            );
            self.dispatch_pending_member_request();
        }
    }

    fn handle_gateway_error(
        &mut self,
        ix: AccountIx,
        err: gateway::GatewayError,
    ) -> Result<(), crate::Error> {
        match err {
            gateway::GatewayError::AuthenticationFailed => {
                warn!(account = %self.accounts[ix].name, "credentials expired, removing account");
                self.remove_account(ix);
                if self.accounts.iter().all(|a| a.removed) {
                    warn!("no accounts remain");
                    self.shutdown.cancel();
                }
                Ok(())
            }
            other => Err(crate::Error::Gateway(other)),
        }
    }

    /// Disconnect an account: abort exactly the operations in its
    /// registries, hand what can be handed to the remaining accounts, and
    /// drop it from every channel set.
    fn remove_account(&mut self, ix: AccountIx) {
        self.accounts[ix].gateway.destroy();

        let message_syncs: Vec<SyncOp> =
            self.accounts[ix].message_syncs.values().cloned().collect();
        let private_syncs: Vec<SyncOp> = self.accounts[ix]
            .private_thread_syncs
            .values()
            .cloned()
            .collect();
        self.accounts[ix].abort_all();
        self.accounts[ix].removed = true;
        self.accounts[ix].member_request = None;
        self.accounts[ix].member_buffer.clear();
        self.accounts[ix].gateway_ops = 0;

        for guild in self.cache.values_mut() {
            guild.forget_account(ix);
        }

        for op in message_syncs {
            self.respawn_message_sync(op, SyncKind::Messages, ix);
        }
        for op in private_syncs {
            self.respawn_message_sync(op, SyncKind::PrivateThreadMessages, ix);
        }
        self.dispatch_pending_member_request();
    }

    async fn handle_dispatch(
        &mut self,
        ix: AccountIx,
        name: &str,
        data: serde_json::Value,
        live: bool,
    ) -> Result<(), crate::Error> {
        let timing = Timing::now(live);
        match name {
            "READY" => {
                let ready: ReadyData = serde_json::from_value(data)?;
                let account = &mut self.accounts[ix];
                account.user_id = ready.user.id;
                account.pending_guilds = ready.guilds.iter().map(|g| g.id).collect();
                info!(
                    account = %account.name,
                    guilds = account.pending_guilds.len(),
                    "account connected"
                );
                self.check_account_ready(ix);
                Ok(())
            }
            "RESUMED" => Ok(()),
            "GUILD_CREATE" => {
                let guild: Guild = serde_json::from_value(data)?;
                self.handle_guild_create(ix, guild, timing).await
            }
            "GUILD_UPDATE" => {
                let guild: Guild = serde_json::from_value(data)?;
                self.handle_guild_update(guild, timing).await
            }
            "GUILD_DELETE" => {
                let data: GuildRef = serde_json::from_value(data)?;
                // An outage also arrives as GUILD_DELETE, flagged unavailable.
                if data.unavailable != Some(true) {
                    self.db.mark_guild_deleted(data.id, timing).await?;
                }
                Ok(())
            }
            "GUILD_ROLE_CREATE" | "GUILD_ROLE_UPDATE" => {
                let data: RoleData = serde_json::from_value(data)?;
                self.handle_role_upsert(data.guild_id, data.role, timing).await
            }
            "GUILD_ROLE_DELETE" => {
                let data: RoleDeleteData = serde_json::from_value(data)?;
                self.db.mark_role_deleted(data.role_id, timing).await?;
                if let Some(guild) = self.cache.get_mut(&data.guild_id) {
                    guild.role_permissions.remove(&data.role_id);
                    for account in guild.accounts.values_mut() {
                        account.role_ids.retain(|id| *id != data.role_id);
                    }
                }
                self.sweep_guild_permissions(data.guild_id);
                Ok(())
            }
            "GUILD_MEMBER_UPDATE" => {
                let member: MemberData = serde_json::from_value(data)?;
                self.handle_member_update(member, timing).await
            }
            "GUILD_MEMBER_REMOVE" => {
                let data: MemberRemoveData = serde_json::from_value(data)?;
                self.db
                    .add_member_leave(data.guild_id, data.user.id, timing)
                    .await?;
                self.db.add_user_snapshot(data.user.clone(), timing).await?;
                if let Some(guild) = self.cache.get_mut(&data.guild_id) {
                    if let Some(members) = guild.member_ids.as_mut() {
                        members.remove(&data.user.id);
                    }
                }
                Ok(())
            }
            "GUILD_MEMBERS_CHUNK" => {
                let chunk: MembersChunk = serde_json::from_value(data)?;
                self.handle_members_chunk(ix, chunk, timing).await
            }
            "CHANNEL_CREATE" => {
                let channel: Channel = serde_json::from_value(data)?;
                self.handle_channel_create(channel, timing).await
            }
            "CHANNEL_UPDATE" => {
                let channel: Channel = serde_json::from_value(data)?;
                self.handle_channel_update(channel, timing).await
            }
            "CHANNEL_DELETE" => {
                let channel: Channel = serde_json::from_value(data)?;
                self.db.mark_channel_deleted(channel.id, timing).await?;
                self.abort_syncs_for_target(channel.id);
                Ok(())
            }
            "THREAD_CREATE" => {
                let thread: Channel = serde_json::from_value(data)?;
                self.db.add_channel_snapshot(thread.clone(), timing).await?;
                if self.all_ready {
                    if let (Some(guild_id), Some(info)) =
                        (thread.guild_id, ThreadInfo::from_channel(&thread))
                    {
                        self.spawn_thread_message_sync(guild_id, info);
                    }
                }
                Ok(())
            }
            "THREAD_UPDATE" => {
                let thread: Channel = serde_json::from_value(data)?;
                self.db.add_channel_snapshot(thread, timing).await?;
                Ok(())
            }
            "THREAD_DELETE" => {
                let thread: Channel = serde_json::from_value(data)?;
                self.db.mark_channel_deleted(thread.id, timing).await?;
                self.abort_syncs_for_target(thread.id);
                Ok(())
            }
            "THREAD_LIST_SYNC" => {
                let data: ThreadListSyncData = serde_json::from_value(data)?;
                for thread in data.threads {
                    self.db.add_channel_snapshot(thread.clone(), timing).await?;
                    if let Some(info) = ThreadInfo::from_channel(&thread) {
                        self.spawn_thread_message_sync(data.guild_id, info);
                    }
                }
                Ok(())
            }
            "MESSAGE_CREATE" => {
                let message: Message = serde_json::from_value(data)?;
                self.db.add_message_snapshot(message, timing).await?;
                Ok(())
            }
            "MESSAGE_UPDATE" => {
                let update: MessageUpdate = serde_json::from_value(data)?;
                if let Some(author) = update.author.clone() {
                    if author.id != 0 {
                        self.db.add_user_snapshot(author, timing).await?;
                    }
                }
                self.db.add_message_partial(update, timing).await?;
                Ok(())
            }
            "MESSAGE_DELETE" => {
                let data: MessageRef = serde_json::from_value(data)?;
                self.db.mark_message_deleted(data.id, timing).await?;
                Ok(())
            }
            "MESSAGE_DELETE_BULK" => {
                let data: MessageBulkDelete = serde_json::from_value(data)?;
                for id in data.ids {
                    self.db.mark_message_deleted(id, timing).await?;
                }
                Ok(())
            }
            "MESSAGE_REACTION_ADD" => {
                if self.options.no_reactions {
                    return Ok(());
                }
                let data: ReactionData = serde_json::from_value(data)?;
                if let Some(user) = data.member.as_ref().and_then(|m| m.user.clone()) {
                    self.db.add_user_snapshot(user, timing).await?;
                }
                let kind = if data.burst {
                    model::ReactionKind::Burst
                } else {
                    model::ReactionKind::Normal
                };
                self.db
                    .add_reaction_placement(data.message_id, data.emoji, kind, data.user_id, timing)
                    .await?;
                Ok(())
            }
            "MESSAGE_REACTION_REMOVE" => {
                if self.options.no_reactions {
                    return Ok(());
                }
                let data: ReactionData = serde_json::from_value(data)?;
                self.db
                    .remove_reaction(data.message_id, data.emoji, data.user_id, timing)
                    .await?;
                Ok(())
            }
            "MESSAGE_REACTION_REMOVE_ALL" => {
                if self.options.no_reactions {
                    return Ok(());
                }
                let data: MessageRef2 = serde_json::from_value(data)?;
                self.db
                    .remove_all_reactions(data.message_id, None, timing)
                    .await?;
                Ok(())
            }
            "MESSAGE_REACTION_REMOVE_EMOJI" => {
                if self.options.no_reactions {
                    return Ok(());
                }
                let data: ReactionEmojiRemoveData = serde_json::from_value(data)?;
                self.db
                    .remove_all_reactions(data.message_id, Some(data.emoji), timing)
                    .await?;
                Ok(())
            }
            other => {
                debug!(event = other, "unhandled dispatch");
                Ok(())
            }
        }
    }

    async fn handle_guild_create(
        &mut self,
        ix: AccountIx,
        guild: Guild,
        timing: Timing,
    ) -> Result<(), crate::Error> {
        if guild.unavailable == Some(true) {
            return Ok(());
        }

        // Persist the server, its roles, and its channels.
        self.db
            .add_guild_snapshot(guild.id, guild.name.clone(), guild.owner_id, timing)
            .await?;
        for role in &guild.roles {
            self.db
                .add_role_snapshot(guild.id, role.clone(), timing)
                .await?;
        }
        for channel in guild.channels.iter().chain(guild.threads.iter()) {
            self.db
                .add_channel_snapshot(channel.clone(), timing)
                .await?;
        }

        let user_id = self.accounts[ix].user_id;
        let cached = self
            .cache
            .entry(guild.id)
            .or_insert_with(|| CachedGuild::new(&guild));

        // Reuse of an existing cache entry still refreshes roles/channels.
        cached.name = guild.name.clone();
        cached.owner_id = guild.owner_id;
        cached.role_permissions = guild.roles.iter().map(|r| (r.id, r.permissions)).collect();
        for channel in &guild.channels {
            if channel.is_text_like() {
                cached.index_channel(channel);
            }
        }

        // This account's own member record carries its role set.
        let own_roles = guild
            .members
            .iter()
            .find(|m| m.user.as_ref().map(|u| u.id) == Some(user_id))
            .map(|m| m.roles.clone())
            .unwrap_or_default();
        cached.accounts.insert(
            ix,
            crate::cache::GuildAccount {
                role_ids: own_roles,
                permissions: crate::permissions::Permissions::empty(),
            },
        );
        cached.recompute_guild_permissions(ix, user_id);

        let channel_ids: Vec<ChannelId> = cached.channels.keys().copied().collect();
        for channel_id in channel_ids {
            self.recompute_channel_for_account(guild.id, channel_id, ix);
        }

        self.accounts[ix].pending_guilds.remove(&guild.id);
        self.check_account_ready(ix);

        // A server appearing after the bulk pass gets its sync scheduled now.
        if self.all_ready && self.guild_allowed(guild.id) && !self.options.no_sync {
            self.schedule_guild_sync(guild.id);
        }
        Ok(())
    }

    async fn handle_guild_update(
        &mut self,
        guild: Guild,
        timing: Timing,
    ) -> Result<(), crate::Error> {
        self.db
            .add_guild_snapshot(guild.id, guild.name.clone(), guild.owner_id, timing)
            .await?;
        let mut owner_changed = false;
        if let Some(cached) = self.cache.get_mut(&guild.id) {
            cached.name = guild.name.clone();
            owner_changed = cached.owner_id != guild.owner_id;
            cached.owner_id = guild.owner_id;
        }
        if owner_changed {
            self.sweep_guild_permissions(guild.id);
        }
        Ok(())
    }

    async fn handle_role_upsert(
        &mut self,
        guild_id: GuildId,
        role: Role,
        timing: Timing,
    ) -> Result<(), crate::Error> {
        self.db.add_role_snapshot(guild_id, role.clone(), timing).await?;
        let changed = match self.cache.get_mut(&guild_id) {
            Some(guild) => {
                let previous = guild.role_permissions.insert(role.id, role.permissions);
                previous != Some(role.permissions)
            }
            None => false,
        };
        if changed {
            self.sweep_guild_permissions(guild_id);
        }
        Ok(())
    }

    async fn handle_member_update(
        &mut self,
        member: MemberData,
        timing: Timing,
    ) -> Result<(), crate::Error> {
        self.db
            .add_member_snapshot(
                member.guild_id,
                member.user.id,
                member.nick.clone(),
                member.roles.clone(),
                member.joined_at.clone(),
                timing,
            )
            .await?;
        self.db.add_user_snapshot(member.user.clone(), timing).await?;

        // Our own member: the role set drives permissions.
        let own_ix: Vec<AccountIx> = self
            .accounts
            .iter()
            .enumerate()
            .filter(|(_, a)| !a.removed && a.user_id == member.user.id)
            .map(|(ix, _)| ix)
            .collect();
        if own_ix.is_empty() {
            return Ok(());
        }
        let mut touched = false;
        if let Some(guild) = self.cache.get_mut(&member.guild_id) {
            for ix in &own_ix {
                if let Some(account) = guild.accounts.get_mut(ix) {
                    account.role_ids = member.roles.clone();
                    touched = true;
                }
            }
        }
        if touched {
            self.sweep_guild_permissions(member.guild_id);
        }
        Ok(())
    }

    async fn handle_members_chunk(
        &mut self,
        ix: AccountIx,
        chunk: MembersChunk,
        timing: Timing,
    ) -> Result<(), crate::Error> {
        let requested = self.accounts[ix].member_request == Some(chunk.guild_id);
        for member in &chunk.members {
            let Some(user) = &member.user else { continue };
            self.db.add_user_snapshot(user.clone(), timing).await?;
            self.db
                .add_member_snapshot(
                    chunk.guild_id,
                    user.id,
                    member.nick.clone(),
                    member.roles.clone(),
                    member.joined_at.clone(),
                    timing,
                )
                .await?;
            if requested {
                self.accounts[ix].member_buffer.insert(user.id);
            }
        }

        if requested && chunk.chunk_index + 1 >= chunk.chunk_count {
            let account = &mut self.accounts[ix];
            let members: HashSet<UserId> = std::mem::take(&mut account.member_buffer);
            account.member_request = None;
            account.gateway_ops = account.gateway_ops.saturating_sub(1);

            let ids: Vec<UserId> = {
                let mut ids: Vec<UserId> = members.iter().copied().collect();
                ids.sort_unstable();
                ids
            };
            info!(guild_id = chunk.guild_id, members = ids.len(), "member enumeration complete");
            if let Some(guild) = self.cache.get_mut(&chunk.guild_id) {
                guild.member_ids = Some(members);
            }
            self.db
                .sync_guild_members(chunk.guild_id, ids, timing)
                .await?;
            self.dispatch_pending_member_request();
        }
        Ok(())
    }

    async fn handle_channel_create(
        &mut self,
        channel: Channel,
        timing: Timing,
    ) -> Result<(), crate::Error> {
        self.db.add_channel_snapshot(channel.clone(), timing).await?;
        let Some(guild_id) = channel.guild_id else {
            return Ok(());
        };
        if !channel.is_text_like() {
            return Ok(());
        }
        if let Some(guild) = self.cache.get_mut(&guild_id) {
            guild.index_channel(&channel);
        }
        self.resweep_channel(guild_id, channel.id);
        Ok(())
    }

    async fn handle_channel_update(
        &mut self,
        channel: Channel,
        timing: Timing,
    ) -> Result<(), crate::Error> {
        self.db.add_channel_snapshot(channel.clone(), timing).await?;
        let Some(guild_id) = channel.guild_id else {
            return Ok(());
        };
        if !channel.is_text_like() {
            return Ok(());
        }

        // Compare the incoming overwrites to the previously cached ones and
        // recompute only on inequality.
        let new_overwrites = crate::cache::overwrite_map(&channel);
        let mut changed = true;
        match self.cache.get_mut(&guild_id) {
            Some(guild) => match guild.channels.get_mut(&channel.id) {
                Some(cached) => {
                    cached.name = channel.name.clone();
                    if cached.overwrites == new_overwrites {
                        changed = false;
                    } else {
                        cached.overwrites = new_overwrites;
                    }
                }
                None => guild.index_channel(&channel),
            },
            None => changed = false,
        }
        if changed {
            self.resweep_channel(guild_id, channel.id);
        }
        Ok(())
    }

    fn check_account_ready(&mut self, ix: AccountIx) {
        {
            let account = &mut self.accounts[ix];
            if account.ready || !account.pending_guilds.is_empty() || account.user_id == 0 {
                return;
            }
            account.ready = true;
            info!(account = %account.name, "account ready");
        }

        if !self.all_ready && self.accounts.iter().all(|a| a.removed || a.ready) {
            self.all_ready = true;
            info!("all accounts ready");
            if !self.options.no_sync {
                self.initial_bulk_pass();
            }
        }
    }

    /// The initial pass over every cached server: member enumeration plus
    /// the per-channel sync trio.
    fn initial_bulk_pass(&mut self) {
        let guild_ids: Vec<GuildId> = self
            .cache
            .keys()
            .copied()
            .filter(|id| self.guild_allowed(*id))
            .collect();
        for guild_id in guild_ids {
            self.schedule_guild_sync(guild_id);
        }
    }

    fn schedule_guild_sync(&mut self, guild_id: GuildId) {
        self.request_guild_members(guild_id);

        let channel_ids: Vec<ChannelId> = self
            .cache
            .get(&guild_id)
            .map(|g| g.channels.keys().copied().collect())
            .unwrap_or_default();
        for channel_id in channel_ids {
            self.schedule_channel_sync(guild_id, channel_id);
        }
    }

    /// One in-flight member request per account; the account with the
    /// smallest gateway operation count takes the job. With every account
    /// busy the request queues until a slot frees up.
    fn request_guild_members(&mut self, guild_id: GuildId) {
        let available = self
            .accounts
            .iter()
            .enumerate()
            .filter(|(_, a)| !a.removed && a.ready && a.member_request.is_none())
            .min_by_key(|(_, a)| a.gateway_ops)
            .map(|(ix, _)| ix);
        let Some(ix) = available else {
            if pick_least_gateway_loaded(&self.accounts).is_some() {
                self.pending_member_requests.push_back(guild_id);
            }
            return;
        };
        let account = &mut self.accounts[ix];
        account.member_request = Some(guild_id);
        account.member_buffer.clear();
        account.gateway_ops += 1;
        account
            .gateway
            .request_guild_members(guild_id, guild_id.to_string());
        debug!(account = %account.name, guild_id, "requesting members");
    }

    /// A member-request slot opened; dispatch the next queued enumeration.
    fn dispatch_pending_member_request(&mut self) {
        if let Some(guild_id) = self.pending_member_requests.pop_front() {
            self.request_guild_members(guild_id);
        }
    }

    /// Spawn the initial trio for one channel: message sync, public thread
    /// enumeration, thread message syncs for startup-active threads, and a
    /// private thread enumeration where some account may manage threads.
    fn schedule_channel_sync(&mut self, guild_id: GuildId, channel_id: ChannelId) {
        let Some(guild) = self.cache.get_mut(&guild_id) else {
            return;
        };
        let Some(channel) = guild.channels.get_mut(&channel_id) else {
            return;
        };
        // Sync-info is single-use: once scheduled it is gone.
        let Some(sync_info) = channel.sync_info.take() else {
            return;
        };
        if channel.accounts_with_read.is_empty() {
            return;
        }
        let has_manage = !channel.accounts_with_manage_threads.is_empty();

        self.spawn_channel_message_sync(guild_id, channel_id, &sync_info);
        self.spawn_thread_list_sync(guild_id, channel_id, ArchivedThreadKind::Public);
        for thread in &sync_info.active_threads {
            self.spawn_thread_message_sync(guild_id, thread.clone());
        }
        if has_manage {
            self.spawn_thread_list_sync(guild_id, channel_id, ArchivedThreadKind::Private);
        } else {
            self.spawn_thread_list_sync(guild_id, channel_id, ArchivedThreadKind::JoinedPrivate);
        }
    }

    /// True if any account holds a message sync for this (parent, target).
    fn message_sync_exists(&self, parent_id: ChannelId, target_id: ChannelId) -> bool {
        self.accounts
            .iter()
            .any(|a| a.has_message_sync(parent_id, target_id))
    }

    fn spawn_channel_message_sync(
        &mut self,
        guild_id: GuildId,
        channel_id: ChannelId,
        sync_info: &ChannelSyncInfo,
    ) {
        if self.message_sync_exists(channel_id, channel_id) {
            return;
        }
        let Some(ix) = self.pick_reader(guild_id, channel_id) else {
            return;
        };
        let op = SyncOp {
            token: self.shutdown.child_token(),
            guild_id,
            parent_id: channel_id,
            target_id: channel_id,
            thread: None,
            last_message_id: sync_info.last_message_id,
        };
        self.start_message_sync(ix, SyncKind::Messages, op);
    }

    fn spawn_thread_message_sync(&mut self, guild_id: GuildId, thread: ThreadInfo) {
        if self.options.no_sync || self.message_sync_exists(thread.parent_id, thread.id) {
            return;
        }
        let (kind, ix) = if thread.private {
            let Some(ix) = self.pick_thread_manager(guild_id, thread.parent_id) else {
                return;
            };
            (SyncKind::PrivateThreadMessages, ix)
        } else {
            let Some(ix) = self.pick_reader(guild_id, thread.parent_id) else {
                return;
            };
            (SyncKind::Messages, ix)
        };
        let op = SyncOp {
            token: self.shutdown.child_token(),
            guild_id,
            parent_id: thread.parent_id,
            target_id: thread.id,
            last_message_id: thread.last_message_id,
            thread: Some(thread),
        };
        self.start_message_sync(ix, kind, op);
    }

    fn pick_reader(&self, guild_id: GuildId, channel_id: ChannelId) -> Option<AccountIx> {
        let channel = self.cache.get(&guild_id)?.channels.get(&channel_id)?;
        pick_least_rest_loaded(&self.accounts, &channel.accounts_with_read)
    }

    fn pick_thread_manager(&self, guild_id: GuildId, channel_id: ChannelId) -> Option<AccountIx> {
        let channel = self.cache.get(&guild_id)?.channels.get(&channel_id)?;
        pick_least_rest_loaded(&self.accounts, &channel.accounts_with_manage_threads)
    }

    fn start_message_sync(&mut self, ix: AccountIx, kind: SyncKind, op: SyncOp) {
        let db = self.db.clone();
        let events = self.events_tx.clone();
        let no_reactions = self.options.no_reactions;

        let account = &mut self.accounts[ix];
        account.register(kind, op.clone());
        account.rest_ops += 1;

        let task = MessageSyncTask {
            db,
            rest: account.rest.clone(),
            token: op.token.clone(),
            channel_id: op.target_id,
            known_last_message_id: op.last_message_id,
            no_reactions,
        };
        let (parent_id, target_id) = (op.parent_id, op.target_id);
        debug!(
            account = %account.name,
            channel = target_id,
            "starting message sync"
        );
        tokio::spawn(async move {
            let outcome = backfill::run_message_sync(task).await;
            let _ = events.send(Event::SyncFinished {
                ix,
                kind,
                parent_id,
                target_id,
                outcome,
            });
        });
    }

    fn spawn_thread_list_sync(
        &mut self,
        guild_id: GuildId,
        channel_id: ChannelId,
        thread_kind: ArchivedThreadKind,
    ) {
        let (registry_kind, ix) = match thread_kind {
            ArchivedThreadKind::Public => {
                let Some(ix) = self.pick_reader(guild_id, channel_id) else {
                    return;
                };
                (SyncKind::PublicThreadList, ix)
            }
            ArchivedThreadKind::Private => {
                let Some(ix) = self.pick_thread_manager(guild_id, channel_id) else {
                    return;
                };
                (SyncKind::PrivateThreadList, ix)
            }
            ArchivedThreadKind::JoinedPrivate => {
                let Some(ix) = self.pick_reader(guild_id, channel_id) else {
                    return;
                };
                (SyncKind::JoinedPrivateThreadList, ix)
            }
        };

        if self.list_sync_exists(registry_kind, channel_id) {
            return;
        }

        let op = SyncOp {
            token: self.shutdown.child_token(),
            guild_id,
            parent_id: channel_id,
            target_id: channel_id,
            thread: None,
            last_message_id: None,
        };
        let db = self.db.clone();
        let events = self.events_tx.clone();
        let discovered = self.events_tx.clone();

        let account = &mut self.accounts[ix];
        account.register(registry_kind, op.clone());
        account.rest_ops += 1;

        let task = ThreadListTask {
            db,
            rest: account.rest.clone(),
            token: op.token.clone(),
            guild_id,
            channel_id,
            kind: thread_kind,
            events: discovered,
        };
        debug!(
            account = %account.name,
            channel = channel_id,
            ?thread_kind,
            "starting thread enumeration"
        );
        tokio::spawn(async move {
            let outcome = backfill::run_thread_list_sync(task).await;
            let _ = events.send(Event::SyncFinished {
                ix,
                kind: registry_kind,
                parent_id: channel_id,
                target_id: channel_id,
                outcome,
            });
        });
    }

    fn list_sync_exists(&self, kind: SyncKind, channel_id: ChannelId) -> bool {
        self.accounts.iter().any(|a| match kind {
            SyncKind::PublicThreadList => a.public_thread_list_syncs.contains_key(&channel_id),
            SyncKind::PrivateThreadList => a.private_thread_list_syncs.contains_key(&channel_id),
            SyncKind::JoinedPrivateThreadList => {
                a.joined_thread_list_syncs.contains_key(&channel_id)
            }
            _ => false,
        })
    }

    fn handle_sync_finished(
        &mut self,
        ix: AccountIx,
        kind: SyncKind,
        parent_id: ChannelId,
        target_id: ChannelId,
        outcome: SyncOutcome,
    ) {
        {
            let account = &mut self.accounts[ix];
            // Handoff paths drain the registry (and the counter) up front;
            // only a still-registered operation counts down here.
            if account.unregister(kind, parent_id, target_id) {
                account.rest_ops = account.rest_ops.saturating_sub(1);
            }
        }
        match &outcome {
            SyncOutcome::Complete | SyncOutcome::UpToDate => {
                debug!(channel = target_id, ?outcome, "sync finished");
            }
            SyncOutcome::Aborted => {
                debug!(channel = target_id, "sync aborted");
            }
            SyncOutcome::NoAccess => {
                warn!(channel = target_id, "sync stuck without access, gave up");
            }
            SyncOutcome::AuthFailed => {
                warn!(
                    account = %self.accounts[ix].name,
                    "credentials rejected during sync, removing account"
                );
                self.remove_account(ix);
                if self.accounts.iter().all(|a| a.removed) {
                    warn!("no accounts remain");
                    self.shutdown.cancel();
                }
            }
            SyncOutcome::Failed(reason) => {
                warn!(channel = target_id, %reason, "sync failed");
            }
        }
    }

    /// Abort every sync operation targeting a deleted channel or thread.
    /// The completion notices clean up the registries.
    fn abort_syncs_for_target(&mut self, target_id: ChannelId) {
        for account in &self.accounts {
            let keys: Vec<(ChannelId, ChannelId)> = account
                .message_syncs
                .keys()
                .chain(account.private_thread_syncs.keys())
                .filter(|(parent, target)| *parent == target_id || *target == target_id)
                .copied()
                .collect();
            for key in keys {
                if let Some(op) = account.message_syncs.get(&key) {
                    op.abort();
                }
                if let Some(op) = account.private_thread_syncs.get(&key) {
                    op.abort();
                }
            }
            for registry in [
                &account.public_thread_list_syncs,
                &account.private_thread_list_syncs,
                &account.joined_thread_list_syncs,
            ] {
                if let Some(op) = registry.get(&target_id) {
                    op.abort();
                }
            }
        }
    }

    /// Recompute the permission sets of every channel in a guild, for every
    /// account, and act on the transitions.
    fn sweep_guild_permissions(&mut self, guild_id: GuildId) {
        let channel_ids: Vec<ChannelId> = self
            .cache
            .get(&guild_id)
            .map(|g| g.channels.keys().copied().collect())
            .unwrap_or_default();

        // Refresh guild-level bitfields first; channel sets derive from them.
        let account_info: Vec<(AccountIx, UserId)> = self
            .accounts
            .iter()
            .enumerate()
            .filter(|(_, a)| !a.removed)
            .map(|(ix, a)| (ix, a.user_id))
            .collect();
        if let Some(guild) = self.cache.get_mut(&guild_id) {
            for (ix, user_id) in &account_info {
                guild.recompute_guild_permissions(*ix, *user_id);
            }
        }

        for channel_id in channel_ids {
            self.resweep_channel(guild_id, channel_id);
        }
    }

    fn recompute_channel_for_account(
        &mut self,
        guild_id: GuildId,
        channel_id: ChannelId,
        ix: AccountIx,
    ) -> Option<(bool, bool, bool, bool)> {
        let user_id = self.accounts[ix].user_id;
        self.cache
            .get_mut(&guild_id)?
            .recompute_channel_membership(channel_id, ix, user_id)
    }

    /// Recompute one channel's sets for all accounts and handle every
    /// resulting transition: aborts, handoffs, and first-reader spawns.
    fn resweep_channel(&mut self, guild_id: GuildId, channel_id: ChannelId) {
        let account_ixs: Vec<AccountIx> = self
            .accounts
            .iter()
            .enumerate()
            .filter(|(_, a)| !a.removed)
            .map(|(ix, _)| ix)
            .collect();

        let had_any_reader = self
            .cache
            .get(&guild_id)
            .and_then(|g| g.channels.get(&channel_id))
            .map(|c| !c.accounts_with_read.is_empty())
            .unwrap_or(false);

        let mut lost_read = Vec::new();
        let mut lost_manage = Vec::new();
        for ix in account_ixs {
            let Some((had_read, has_read, had_manage, has_manage)) =
                self.recompute_channel_for_account(guild_id, channel_id, ix)
            else {
                continue;
            };
            if had_read && !has_read {
                lost_read.push(ix);
            }
            if had_manage && !has_manage {
                lost_manage.push(ix);
            }
        }

        for ix in lost_read {
            self.handle_read_loss(ix, channel_id);
        }
        for ix in lost_manage {
            self.handle_manage_loss(ix, channel_id);
        }

        let has_any_reader = self
            .cache
            .get(&guild_id)
            .and_then(|g| g.channels.get(&channel_id))
            .map(|c| !c.accounts_with_read.is_empty())
            .unwrap_or(false);

        // A channel becoming visible for the first time gets the full trio.
        if self.all_ready
            && !self.options.no_sync
            && !had_any_reader
            && has_any_reader
            && self.guild_allowed(guild_id)
        {
            let needs_schedule = self
                .cache
                .get(&guild_id)
                .and_then(|g| g.channels.get(&channel_id))
                .map(|c| c.sync_info.is_some())
                .unwrap_or(false);
            if needs_schedule {
                self.schedule_channel_sync(guild_id, channel_id);
            } else {
                // Already synced once; restart the trio from stored state.
                self.spawn_channel_message_sync(
                    guild_id,
                    channel_id,
                    &ChannelSyncInfo::default(),
                );
                self.spawn_thread_list_sync(guild_id, channel_id, ArchivedThreadKind::Public);
                let has_manage = self
                    .cache
                    .get(&guild_id)
                    .and_then(|g| g.channels.get(&channel_id))
                    .map(|c| !c.accounts_with_manage_threads.is_empty())
                    .unwrap_or(false);
                if has_manage {
                    self.spawn_thread_list_sync(guild_id, channel_id, ArchivedThreadKind::Private);
                }
            }
        }
    }

    /// An account lost read on a channel: abort its message sync there and
    /// all private-thread message syncs under it, then hand each to another
    /// read-capable account where one exists.
    fn handle_read_loss(&mut self, ix: AccountIx, channel_id: ChannelId) {
        debug!(account = %self.accounts[ix].name, channel = channel_id, "read access lost");

        let mut to_respawn: Vec<(SyncKind, SyncOp)> = Vec::new();
        {
            let account = &mut self.accounts[ix];
            let message_keys: Vec<(ChannelId, ChannelId)> = account
                .message_syncs
                .keys()
                .filter(|(parent, _)| *parent == channel_id)
                .copied()
                .collect();
            for key in message_keys {
                if let Some(op) = account.message_syncs.remove(&key) {
                    op.abort();
                    account.rest_ops = account.rest_ops.saturating_sub(1);
                    to_respawn.push((SyncKind::Messages, op));
                }
            }
            let private_keys: Vec<(ChannelId, ChannelId)> = account
                .private_thread_syncs
                .keys()
                .filter(|(parent, _)| *parent == channel_id)
                .copied()
                .collect();
            for key in private_keys {
                if let Some(op) = account.private_thread_syncs.remove(&key) {
                    op.abort();
                    account.rest_ops = account.rest_ops.saturating_sub(1);
                    to_respawn.push((SyncKind::PrivateThreadMessages, op));
                }
            }
            for registry_kind in [SyncKind::PublicThreadList, SyncKind::JoinedPrivateThreadList] {
                let registry = match registry_kind {
                    SyncKind::PublicThreadList => &mut account.public_thread_list_syncs,
                    _ => &mut account.joined_thread_list_syncs,
                };
                if let Some(op) = registry.remove(&channel_id) {
                    op.abort();
                    account.rest_ops = account.rest_ops.saturating_sub(1);
                    to_respawn.push((registry_kind, op));
                }
            }
        }

        for (kind, op) in to_respawn {
            match kind {
                SyncKind::Messages | SyncKind::PrivateThreadMessages => {
                    self.respawn_message_sync(op, kind, ix);
                }
                SyncKind::PublicThreadList => {
                    self.spawn_thread_list_sync(op.guild_id, channel_id, ArchivedThreadKind::Public);
                }
                SyncKind::JoinedPrivateThreadList => {
                    self.spawn_thread_list_sync(
                        op.guild_id,
                        channel_id,
                        ArchivedThreadKind::JoinedPrivate,
                    );
                }
                SyncKind::PrivateThreadList => {}
            }
        }
    }

    /// An account lost manage-threads: its private thread list sync and
    /// private-thread message syncs move to another capable account.
    fn handle_manage_loss(&mut self, ix: AccountIx, channel_id: ChannelId) {
        debug!(account = %self.accounts[ix].name, channel = channel_id, "manage-threads lost");

        let mut to_respawn: Vec<(SyncKind, SyncOp)> = Vec::new();
        {
            let account = &mut self.accounts[ix];
            if let Some(op) = account.private_thread_list_syncs.remove(&channel_id) {
                op.abort();
                account.rest_ops = account.rest_ops.saturating_sub(1);
                to_respawn.push((SyncKind::PrivateThreadList, op));
            }
            let private_keys: Vec<(ChannelId, ChannelId)> = account
                .private_thread_syncs
                .keys()
                .filter(|(parent, _)| *parent == channel_id)
                .copied()
                .collect();
            for key in private_keys {
                if let Some(op) = account.private_thread_syncs.remove(&key) {
                    op.abort();
                    account.rest_ops = account.rest_ops.saturating_sub(1);
                    to_respawn.push((SyncKind::PrivateThreadMessages, op));
                }
            }
        }

        for (kind, op) in to_respawn {
            match kind {
                SyncKind::PrivateThreadList => {
                    self.spawn_thread_list_sync(op.guild_id, channel_id, ArchivedThreadKind::Private);
                }
                SyncKind::PrivateThreadMessages => {
                    self.respawn_message_sync(op, kind, ix);
                }
                _ => {}
            }
        }
    }

    /// Restart an aborted message sync on a different account, if any
    /// eligible one remains.
    fn respawn_message_sync(&mut self, op: SyncOp, kind: SyncKind, previous_ix: AccountIx) {
        let picked = match kind {
            SyncKind::PrivateThreadMessages => self.pick_thread_manager(op.guild_id, op.parent_id),
            _ => self.pick_reader(op.guild_id, op.parent_id),
        };
        let Some(ix) = picked.filter(|ix| *ix != previous_ix) else {
            debug!(channel = op.target_id, "no replacement account for sync");
            return;
        };
        let new_op = SyncOp {
            token: self.shutdown.child_token(),
            ..op
        };
        self.start_message_sync(ix, kind, new_op);
    }
}

// --- Dispatch payload shapes ---

#[derive(Debug, Deserialize)]
struct ReadyData {
    user: model::User,
    #[serde(default)]
    guilds: Vec<GuildRef>,
}

#[derive(Debug, Deserialize)]
struct GuildRef {
    #[serde(with = "model::snowflake")]
    id: GuildId,
    #[serde(default)]
    unavailable: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RoleData {
    #[serde(with = "model::snowflake")]
    guild_id: GuildId,
    role: Role,
}

#[derive(Debug, Deserialize)]
struct RoleDeleteData {
    #[serde(with = "model::snowflake")]
    guild_id: GuildId,
    #[serde(with = "model::snowflake")]
    role_id: u64,
}

#[derive(Debug, Deserialize)]
struct MemberData {
    #[serde(with = "model::snowflake")]
    guild_id: GuildId,
    user: model::User,
    #[serde(default)]
    nick: Option<String>,
    #[serde(default, with = "model::snowflake_vec")]
    roles: Vec<u64>,
    #[serde(default)]
    joined_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MemberRemoveData {
    #[serde(with = "model::snowflake")]
    guild_id: GuildId,
    user: model::User,
}

#[derive(Debug, Deserialize)]
struct MembersChunk {
    #[serde(with = "model::snowflake")]
    guild_id: GuildId,
    #[serde(default)]
    members: Vec<Member>,
    #[serde(default)]
    chunk_index: u32,
    #[serde(default)]
    chunk_count: u32,
}

#[derive(Debug, Deserialize)]
struct ThreadListSyncData {
    #[serde(with = "model::snowflake")]
    guild_id: GuildId,
    #[serde(default)]
    threads: Vec<Channel>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    #[serde(with = "model::snowflake")]
    id: u64,
}

#[derive(Debug, Deserialize)]
struct MessageRef2 {
    #[serde(with = "model::snowflake")]
    message_id: u64,
}

#[derive(Debug, Deserialize)]
struct MessageBulkDelete {
    #[serde(with = "model::snowflake_vec")]
    ids: Vec<u64>,
}

#[derive(Debug, Deserialize)]
struct ReactionData {
    #[serde(with = "model::snowflake")]
    user_id: UserId,
    #[serde(with = "model::snowflake")]
    message_id: u64,
    emoji: model::Emoji,
    #[serde(default)]
    burst: bool,
    #[serde(default)]
    member: Option<Member>,
}

#[derive(Debug, Deserialize)]
struct ReactionEmojiRemoveData {
    #[serde(with = "model::snowflake")]
    message_id: u64,
    emoji: model::Emoji,
}
