//! The authoritative runtime picture: cached servers with their channels and
//! role bitfields, per-account derived permission sets, and the per-account
//! registries of ongoing sync operations.
//!
//! Everything here is plain owned data mutated only by the orchestrator
//! task; sync loops receive clones of the context they need plus an abort
//! token, never references into the cache.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tokio_util::sync::CancellationToken;

use crate::gateway::GatewayHandle;
use crate::model::{Channel, ChannelId, Guild, GuildId, MessageId, RoleId, UserId};
use crate::permissions::{self, OverwriteMap, Permissions};
use crate::rest::RestClient;

/// Accounts are addressed by their index in the orchestrator's account list.
pub type AccountIx = usize;

/// Descriptor for a thread discovered at startup or by enumeration. Threads
/// are not cached persistently; this is just enough context to start (or
/// restart) a message sync.
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub id: ChannelId,
    pub name: Option<String>,
    pub parent_id: ChannelId,
    pub private: bool,
    pub last_message_id: Option<MessageId>,
    pub message_count: Option<u64>,
}

impl ThreadInfo {
    pub fn from_channel(channel: &Channel) -> Option<ThreadInfo> {
        if !channel.is_thread() {
            return None;
        }
        Some(ThreadInfo {
            id: channel.id,
            name: channel.name.clone(),
            parent_id: channel.parent_id?,
            private: channel.is_private_thread(),
            last_message_id: channel.last_message_id,
            message_count: channel.message_count,
        })
    }
}

/// Present only between the server-create dispatch and the scheduling of the
/// initial sync; cleared to `None` afterwards.
#[derive(Debug, Clone, Default)]
pub struct ChannelSyncInfo {
    pub last_message_id: Option<MessageId>,
    pub message_count: Option<u64>,
    pub active_threads: Vec<ThreadInfo>,
}

#[derive(Debug)]
pub struct CachedChannel {
    pub id: ChannelId,
    pub guild_id: GuildId,
    pub kind: u8,
    pub name: Option<String>,
    pub overwrites: OverwriteMap,
    pub accounts_with_read: BTreeSet<AccountIx>,
    pub accounts_with_manage_threads: BTreeSet<AccountIx>,
    pub sync_info: Option<ChannelSyncInfo>,
}

impl CachedChannel {
    fn new(guild_id: GuildId, channel: &Channel) -> CachedChannel {
        CachedChannel {
            id: channel.id,
            guild_id,
            kind: channel.kind,
            name: channel.name.clone(),
            overwrites: overwrite_map(channel),
            accounts_with_read: BTreeSet::new(),
            accounts_with_manage_threads: BTreeSet::new(),
            sync_info: Some(ChannelSyncInfo {
                last_message_id: channel.last_message_id,
                message_count: channel.message_count,
                active_threads: Vec::new(),
            }),
        }
    }
}

pub fn overwrite_map(channel: &Channel) -> OverwriteMap {
    channel
        .permission_overwrites
        .as_ref()
        .map(|overwrites| {
            overwrites
                .iter()
                .map(|o| (o.id, (o.allow, o.deny)))
                .collect()
        })
        .unwrap_or_default()
}

/// An account's standing in one server: the roles it holds and the derived
/// server-level bitfield.
#[derive(Debug, Clone, Default)]
pub struct GuildAccount {
    pub role_ids: Vec<RoleId>,
    pub permissions: Permissions,
}

#[derive(Debug)]
pub struct CachedGuild {
    pub id: GuildId,
    pub name: Option<String>,
    pub owner_id: Option<UserId>,
    pub role_permissions: HashMap<RoleId, u64>,
    pub channels: BTreeMap<ChannelId, CachedChannel>,
    /// `None` until a member enumeration has completed.
    pub member_ids: Option<HashSet<UserId>>,
    pub accounts: HashMap<AccountIx, GuildAccount>,
}

impl CachedGuild {
    pub fn new(guild: &Guild) -> CachedGuild {
        let mut cached = CachedGuild {
            id: guild.id,
            name: guild.name.clone(),
            owner_id: guild.owner_id,
            role_permissions: guild
                .roles
                .iter()
                .map(|r| (r.id, r.permissions))
                .collect(),
            channels: BTreeMap::new(),
            member_ids: None,
            accounts: HashMap::new(),
        };
        for channel in &guild.channels {
            if channel.is_text_like() {
                cached.index_channel(channel);
            }
        }
        // Active threads at startup belong to their parent's sync-info.
        for thread in &guild.threads {
            if let Some(info) = ThreadInfo::from_channel(thread) {
                if let Some(parent) = cached.channels.get_mut(&info.parent_id) {
                    if let Some(sync_info) = parent.sync_info.as_mut() {
                        sync_info.active_threads.push(info);
                    }
                }
            }
        }
        cached
    }

    /// Insert or refresh a channel, keeping derived account sets intact
    /// until the next recompute.
    pub fn index_channel(&mut self, channel: &Channel) {
        match self.channels.get_mut(&channel.id) {
            Some(existing) => {
                existing.name = channel.name.clone();
                existing.overwrites = overwrite_map(channel);
            }
            None => {
                self.channels
                    .insert(channel.id, CachedChannel::new(self.id, channel));
            }
        }
    }

    /// Recompute one account's derived server permissions from its role set.
    pub fn recompute_guild_permissions(&mut self, ix: AccountIx, user_id: UserId) {
        let Some(account) = self.accounts.get_mut(&ix) else {
            return;
        };
        account.permissions = permissions::compute_guild_permissions(
            &account.role_ids,
            self.id,
            self.owner_id,
            user_id,
            &self.role_permissions,
        );
    }

    /// Recompute the read / manage-threads sets of one channel for one
    /// account. Returns `(had_read, has_read, had_manage, has_manage)` so
    /// the orchestrator can react to transitions.
    pub fn recompute_channel_membership(
        &mut self,
        channel_id: ChannelId,
        ix: AccountIx,
        user_id: UserId,
    ) -> Option<(bool, bool, bool, bool)> {
        let account = self.accounts.get(&ix)?.clone();
        let guild_id = self.id;
        let channel = self.channels.get_mut(&channel_id)?;

        let perms = permissions::compute_channel_permissions(
            account.permissions,
            guild_id,
            user_id,
            &account.role_ids,
            &channel.overwrites,
        );

        let had_read = channel.accounts_with_read.contains(&ix);
        let had_manage = channel.accounts_with_manage_threads.contains(&ix);
        let has_read = perms.can_read_history();
        let has_manage = perms.can_manage_threads();

        if has_read {
            channel.accounts_with_read.insert(ix);
        } else {
            channel.accounts_with_read.remove(&ix);
        }
        if has_manage {
            channel.accounts_with_manage_threads.insert(ix);
        } else {
            channel.accounts_with_manage_threads.remove(&ix);
        }

        Some((had_read, has_read, had_manage, has_manage))
    }

    /// Drop an account from every channel set, e.g. on disconnect.
    pub fn forget_account(&mut self, ix: AccountIx) {
        self.accounts.remove(&ix);
        for channel in self.channels.values_mut() {
            channel.accounts_with_read.remove(&ix);
            channel.accounts_with_manage_threads.remove(&ix);
        }
    }
}

/// Which registry a sync operation lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    Messages,
    PrivateThreadMessages,
    PublicThreadList,
    PrivateThreadList,
    JoinedPrivateThreadList,
}

/// One ongoing backfill: the abort handle plus enough context to restart the
/// same operation on a different account.
#[derive(Debug, Clone)]
pub struct SyncOp {
    pub token: CancellationToken,
    pub guild_id: GuildId,
    pub parent_id: ChannelId,
    pub target_id: ChannelId,
    pub thread: Option<ThreadInfo>,
    pub last_message_id: Option<MessageId>,
}

impl SyncOp {
    pub fn abort(&self) {
        self.token.cancel();
    }
}

/// Runtime state for one configured account: credentials, connection
/// handles, load counters, and the five registries of ongoing work.
pub struct AccountState {
    pub name: String,
    pub token: String,
    pub user_id: UserId,
    pub gateway: GatewayHandle,
    pub rest: RestClient,
    /// Number of ongoing REST-paginating operations; drives account choice.
    pub rest_ops: usize,
    /// Number of ongoing gateway operations (member enumerations).
    pub gateway_ops: usize,
    /// Servers announced by READY that have not yet delivered server-create.
    pub pending_guilds: HashSet<GuildId>,
    pub ready: bool,
    /// Removed after an auth failure; skipped by all selection.
    pub removed: bool,
    /// In-flight member enumeration, at most one per account.
    pub member_request: Option<GuildId>,
    pub member_buffer: HashSet<UserId>,

    pub message_syncs: HashMap<(ChannelId, ChannelId), SyncOp>,
    pub private_thread_syncs: HashMap<(ChannelId, ChannelId), SyncOp>,
    pub public_thread_list_syncs: HashMap<ChannelId, SyncOp>,
    pub private_thread_list_syncs: HashMap<ChannelId, SyncOp>,
    pub joined_thread_list_syncs: HashMap<ChannelId, SyncOp>,
}

impl AccountState {
    pub fn new(name: String, token: String, gateway: GatewayHandle, rest: RestClient) -> Self {
        AccountState {
            name,
            token,
            user_id: 0,
            gateway,
            rest,
            rest_ops: 0,
            gateway_ops: 0,
            pending_guilds: HashSet::new(),
            ready: false,
            removed: false,
            member_request: None,
            member_buffer: HashSet::new(),
            message_syncs: HashMap::new(),
            private_thread_syncs: HashMap::new(),
            public_thread_list_syncs: HashMap::new(),
            private_thread_list_syncs: HashMap::new(),
            joined_thread_list_syncs: HashMap::new(),
        }
    }

    /// True when a message sync for this (parent, target) is registered
    /// here, in either message registry.
    pub fn has_message_sync(&self, parent_id: ChannelId, target_id: ChannelId) -> bool {
        self.message_syncs.contains_key(&(parent_id, target_id))
            || self.private_thread_syncs.contains_key(&(parent_id, target_id))
    }

    pub fn register(&mut self, kind: SyncKind, op: SyncOp) {
        match kind {
            SyncKind::Messages => {
                self.message_syncs.insert((op.parent_id, op.target_id), op);
            }
            SyncKind::PrivateThreadMessages => {
                self.private_thread_syncs
                    .insert((op.parent_id, op.target_id), op);
            }
            SyncKind::PublicThreadList => {
                self.public_thread_list_syncs.insert(op.parent_id, op);
            }
            SyncKind::PrivateThreadList => {
                self.private_thread_list_syncs.insert(op.parent_id, op);
            }
            SyncKind::JoinedPrivateThreadList => {
                self.joined_thread_list_syncs.insert(op.parent_id, op);
            }
        }
    }

    /// Returns whether the operation was still registered; handoff paths
    /// drain entries early, and the eventual completion notice must not
    /// double-count.
    pub fn unregister(&mut self, kind: SyncKind, parent_id: ChannelId, target_id: ChannelId) -> bool {
        match kind {
            SyncKind::Messages => self.message_syncs.remove(&(parent_id, target_id)).is_some(),
            SyncKind::PrivateThreadMessages => self
                .private_thread_syncs
                .remove(&(parent_id, target_id))
                .is_some(),
            SyncKind::PublicThreadList => {
                self.public_thread_list_syncs.remove(&parent_id).is_some()
            }
            SyncKind::PrivateThreadList => {
                self.private_thread_list_syncs.remove(&parent_id).is_some()
            }
            SyncKind::JoinedPrivateThreadList => {
                self.joined_thread_list_syncs.remove(&parent_id).is_some()
            }
        }
    }

    /// Abort and drain every registered operation. Disconnecting an account
    /// must abort exactly the operations in these registries.
    pub fn abort_all(&mut self) {
        for op in self.message_syncs.values() {
            op.abort();
        }
        for op in self.private_thread_syncs.values() {
            op.abort();
        }
        for op in self.public_thread_list_syncs.values() {
            op.abort();
        }
        for op in self.private_thread_list_syncs.values() {
            op.abort();
        }
        for op in self.joined_thread_list_syncs.values() {
            op.abort();
        }
        self.message_syncs.clear();
        self.private_thread_syncs.clear();
        self.public_thread_list_syncs.clear();
        self.private_thread_list_syncs.clear();
        self.joined_thread_list_syncs.clear();
        self.rest_ops = 0;
    }
}

/// Pick the least-loaded eligible account by REST load. Ties break by
/// iteration order.
pub fn pick_least_rest_loaded<'a>(
    accounts: &'a [AccountState],
    eligible: impl IntoIterator<Item = &'a AccountIx>,
) -> Option<AccountIx> {
    eligible
        .into_iter()
        .copied()
        .filter(|ix| !accounts[*ix].removed)
        .min_by_key(|ix| accounts[*ix].rest_ops)
}

/// Pick the least-loaded account by gateway load from all live accounts.
pub fn pick_least_gateway_loaded(accounts: &[AccountState]) -> Option<AccountIx> {
    accounts
        .iter()
        .enumerate()
        .filter(|(_, a)| !a.removed && a.ready)
        .min_by_key(|(_, a)| a.gateway_ops)
        .map(|(ix, _)| ix)
}
