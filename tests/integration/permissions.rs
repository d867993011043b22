use std::collections::HashMap;

use chat_archiver::permissions::{
    compute_channel_permissions, compute_guild_permissions, OverwriteMap, Permissions,
};

const GUILD: u64 = 100;
const ME: u64 = 7;

fn roles(entries: &[(u64, u64)]) -> HashMap<u64, u64> {
    entries.iter().copied().collect()
}

#[test]
fn test_guild_permissions_or_of_roles() {
    let role_perms = roles(&[
        (GUILD, Permissions::VIEW_CHANNEL.bits()),
        (200, Permissions::READ_MESSAGE_HISTORY.bits()),
    ]);
    let perms = compute_guild_permissions(&[200], GUILD, Some(1), ME, &role_perms);
    assert!(perms.can_read_history());
    assert!(!perms.contains(Permissions::MANAGE_THREADS));
}

#[test]
fn test_owner_gets_everything() {
    let perms = compute_guild_permissions(&[], GUILD, Some(ME), ME, &roles(&[]));
    assert_eq!(perms, Permissions::all());
}

#[test]
fn test_administrator_gets_everything() {
    let role_perms = roles(&[(300, Permissions::ADMINISTRATOR.bits())]);
    let perms = compute_guild_permissions(&[300], GUILD, Some(1), ME, &role_perms);
    assert_eq!(perms, Permissions::all());
}

#[test]
fn test_everyone_overwrite_applies_first() {
    let base = Permissions::VIEW_CHANNEL | Permissions::READ_MESSAGE_HISTORY;
    let mut overwrites = OverwriteMap::new();
    overwrites.insert(GUILD, (0, Permissions::VIEW_CHANNEL.bits()));
    let perms = compute_channel_permissions(base, GUILD, ME, &[], &overwrites);
    assert!(!perms.contains(Permissions::VIEW_CHANNEL));
    assert!(perms.contains(Permissions::READ_MESSAGE_HISTORY));
}

#[test]
fn test_role_allow_beats_role_deny() {
    // Deny and allow masks are each OR'd across roles; allow applies after
    // deny, so one role granting a bit wins over another denying it.
    let base = Permissions::VIEW_CHANNEL;
    let mut overwrites = OverwriteMap::new();
    overwrites.insert(200, (0, Permissions::VIEW_CHANNEL.bits()));
    overwrites.insert(201, (Permissions::VIEW_CHANNEL.bits(), 0));
    let perms = compute_channel_permissions(base, GUILD, ME, &[200, 201], &overwrites);
    assert!(perms.contains(Permissions::VIEW_CHANNEL));
}

#[test]
fn test_member_overwrite_applies_last() {
    let base = Permissions::VIEW_CHANNEL | Permissions::READ_MESSAGE_HISTORY;
    let mut overwrites = OverwriteMap::new();
    overwrites.insert(200, (0, Permissions::READ_MESSAGE_HISTORY.bits()));
    overwrites.insert(ME, (Permissions::READ_MESSAGE_HISTORY.bits(), 0));
    let perms = compute_channel_permissions(base, GUILD, ME, &[200], &overwrites);
    assert!(perms.can_read_history());
}

#[test]
fn test_admin_ignores_channel_denies() {
    let mut overwrites = OverwriteMap::new();
    overwrites.insert(GUILD, (0, Permissions::VIEW_CHANNEL.bits()));
    let perms = compute_channel_permissions(Permissions::all(), GUILD, ME, &[], &overwrites);
    assert_eq!(perms, Permissions::all());
}

#[test]
fn test_required_mask_check() {
    let base = Permissions::VIEW_CHANNEL;
    let perms = compute_channel_permissions(base, GUILD, ME, &[], &OverwriteMap::new());
    let required = Permissions::VIEW_CHANNEL | Permissions::READ_MESSAGE_HISTORY;
    assert_ne!(perms & required, required);
}

#[test]
fn test_manage_threads_requires_read() {
    let perms = Permissions::MANAGE_THREADS;
    assert!(!perms.can_manage_threads());
    let full = Permissions::MANAGE_THREADS
        | Permissions::VIEW_CHANNEL
        | Permissions::READ_MESSAGE_HISTORY;
    assert!(full.can_manage_threads());
}
