//! Effective permission computation over the platform's 64-bit bitfields.
//!
//! Everything here is pure: callers pass role bitfields and overwrite maps,
//! nothing touches the cache or the network.

use std::collections::HashMap;

use bitflags::bitflags;

use crate::model::{RoleId, UserId};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u64 {
        const ADMINISTRATOR = 1 << 3;
        const MANAGE_CHANNELS = 1 << 4;
        const MANAGE_GUILD = 1 << 5;
        const VIEW_CHANNEL = 1 << 10;
        const SEND_MESSAGES = 1 << 11;
        const MANAGE_MESSAGES = 1 << 13;
        const READ_MESSAGE_HISTORY = 1 << 16;
        const MANAGE_ROLES = 1 << 28;
        const MANAGE_THREADS = 1 << 34;

        // Unknown bits must survive round trips.
        const _ = !0;
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Permissions::empty()
    }
}

impl Permissions {
    pub fn can_read_history(self) -> bool {
        self.contains(Permissions::VIEW_CHANNEL | Permissions::READ_MESSAGE_HISTORY)
    }

    pub fn can_manage_threads(self) -> bool {
        self.can_read_history() && self.contains(Permissions::MANAGE_THREADS)
    }
}

/// A channel overwrite pair, keyed by principal (role or member id).
pub type OverwriteMap = HashMap<u64, (u64, u64)>;

/// OR of the account's role bitfields. `ADMINISTRATOR` or guild ownership
/// grants everything.
pub fn compute_guild_permissions(
    role_ids: &[RoleId],
    guild_id: u64,
    owner_id: Option<UserId>,
    account_user_id: UserId,
    role_permissions: &HashMap<RoleId, u64>,
) -> Permissions {
    if owner_id == Some(account_user_id) {
        return Permissions::all();
    }

    // The @everyone role shares the guild id and applies to every member.
    let mut bits = role_permissions.get(&guild_id).copied().unwrap_or(0);
    for role_id in role_ids {
        bits |= role_permissions.get(role_id).copied().unwrap_or(0);
    }

    let perms = Permissions::from_bits_retain(bits);
    if perms.contains(Permissions::ADMINISTRATOR) {
        Permissions::all()
    } else {
        perms
    }
}

/// Applies channel overwrites to a guild-level bitfield in the platform's
/// documented order: @everyone overwrite, then role overwrites (deny before
/// allow, both OR'd across roles), then the member overwrite.
pub fn compute_channel_permissions(
    guild_permissions: Permissions,
    guild_id: u64,
    account_user_id: UserId,
    role_ids: &[RoleId],
    overwrites: &OverwriteMap,
) -> Permissions {
    if guild_permissions.contains(Permissions::ADMINISTRATOR) {
        return Permissions::all();
    }

    let mut bits = guild_permissions.bits();

    if let Some((allow, deny)) = overwrites.get(&guild_id) {
        bits &= !deny;
        bits |= allow;
    }

    let mut role_allow = 0u64;
    let mut role_deny = 0u64;
    for role_id in role_ids {
        if let Some((allow, deny)) = overwrites.get(role_id) {
            role_allow |= allow;
            role_deny |= deny;
        }
    }
    bits &= !role_deny;
    bits |= role_allow;

    if let Some((allow, deny)) = overwrites.get(&account_user_id) {
        bits &= !deny;
        bits |= allow;
    }

    Permissions::from_bits_retain(bits)
}
