use chat_archiver::cache::{CachedGuild, SyncKind, SyncOp, ThreadInfo};
use chat_archiver::model::{Channel, Guild, Member, Overwrite, Role};
use chat_archiver::permissions::Permissions;

const ME: u64 = 7;

fn role(id: u64, permissions: Permissions) -> Role {
    Role {
        id,
        name: format!("role-{id}"),
        permissions: permissions.bits(),
        position: 0,
        color: 0,
        hoist: false,
        mentionable: false,
    }
}

fn text_channel(id: u64, overwrites: Vec<Overwrite>) -> Channel {
    Channel {
        id,
        kind: 0,
        guild_id: Some(100),
        name: Some(format!("channel-{id}")),
        topic: None,
        position: Some(0),
        nsfw: None,
        parent_id: None,
        last_message_id: Some(500),
        message_count: None,
        owner_id: None,
        permission_overwrites: Some(overwrites),
        thread_metadata: None,
    }
}

fn guild_with_channel(overwrites: Vec<Overwrite>) -> Guild {
    Guild {
        id: 100,
        name: Some("guild".into()),
        owner_id: Some(1),
        unavailable: None,
        roles: vec![
            role(
                100,
                Permissions::VIEW_CHANNEL | Permissions::READ_MESSAGE_HISTORY,
            ),
            role(200, Permissions::MANAGE_THREADS),
        ],
        channels: vec![text_channel(7, overwrites)],
        threads: vec![],
        members: vec![Member {
            user: Some(crate::common::test_user(ME, "me")),
            nick: None,
            roles: vec![200],
            joined_at: None,
        }],
    }
}

fn ready_guild(overwrites: Vec<Overwrite>) -> CachedGuild {
    let mut cached = CachedGuild::new(&guild_with_channel(overwrites));
    cached.accounts.insert(
        0,
        chat_archiver::cache::GuildAccount {
            role_ids: vec![200],
            permissions: Permissions::empty(),
        },
    );
    cached.recompute_guild_permissions(0, ME);
    cached
}

#[test]
fn test_read_set_follows_computed_permissions() {
    let mut cached = ready_guild(vec![]);
    let (had_read, has_read, _, has_manage) =
        cached.recompute_channel_membership(7, 0, ME).unwrap();
    assert!(!had_read);
    assert!(has_read);
    assert!(has_manage);
    assert!(cached.channels[&7].accounts_with_read.contains(&0));
    assert!(cached.channels[&7].accounts_with_manage_threads.contains(&0));
}

#[test]
fn test_overwrite_denying_view_empties_the_read_set() {
    let deny_everyone = Overwrite {
        id: 100, // @everyone shares the guild id
        kind: 0,
        allow: 0,
        deny: Permissions::VIEW_CHANNEL.bits(),
    };
    let mut cached = ready_guild(vec![deny_everyone]);
    let (_, has_read, _, _) = cached.recompute_channel_membership(7, 0, ME).unwrap();
    assert!(!has_read);
    assert!(cached.channels[&7].accounts_with_read.is_empty());
}

#[test]
fn test_losing_a_role_reports_the_transition() {
    let mut cached = ready_guild(vec![]);
    cached.recompute_channel_membership(7, 0, ME).unwrap();

    // The everyone role loses read access.
    cached.role_permissions.insert(100, 0);
    cached.recompute_guild_permissions(0, ME);
    let (had_read, has_read, had_manage, _) =
        cached.recompute_channel_membership(7, 0, ME).unwrap();
    assert!(had_read);
    assert!(!has_read);
    assert!(had_manage);
}

#[test]
fn test_forget_account_sweeps_every_set() {
    let mut cached = ready_guild(vec![]);
    cached.recompute_channel_membership(7, 0, ME).unwrap();
    cached.forget_account(0);
    assert!(cached.channels[&7].accounts_with_read.is_empty());
    assert!(cached.channels[&7].accounts_with_manage_threads.is_empty());
    assert!(!cached.accounts.contains_key(&0));
}

#[test]
fn test_startup_threads_land_in_parent_sync_info() {
    let mut guild = guild_with_channel(vec![]);
    guild.threads.push(Channel {
        id: 71,
        kind: 11,
        guild_id: Some(100),
        name: Some("old discussion".into()),
        topic: None,
        position: None,
        nsfw: None,
        parent_id: Some(7),
        last_message_id: Some(400),
        message_count: Some(12),
        owner_id: None,
        permission_overwrites: None,
        thread_metadata: None,
    });
    let cached = CachedGuild::new(&guild);
    let info = cached.channels[&7].sync_info.as_ref().unwrap();
    assert_eq!(info.active_threads.len(), 1);
    assert_eq!(info.active_threads[0].id, 71);
    assert_eq!(info.last_message_id, Some(500));
}

// --- Registries and account selection ---

fn sync_op(parent: u64, target: u64) -> SyncOp {
    SyncOp {
        token: tokio_util::sync::CancellationToken::new(),
        guild_id: 100,
        parent_id: parent,
        target_id: target,
        thread: None,
        last_message_id: None,
    }
}

fn account(name: &str) -> chat_archiver::cache::AccountState {
    // Point the connection task at a dead local port; these tests only
    // exercise registries, not the session.
    let mut options = chat_archiver::gateway::GatewayOptions::new("Bot test-token");
    options.gateway_url = "ws://127.0.0.1:9".into();
    let (gateway, _events) = chat_archiver::gateway::connect(options);
    let rest = chat_archiver::rest::RestClient::new("Bot test-token").unwrap();
    chat_archiver::cache::AccountState::new(name.into(), "Bot test-token".into(), gateway, rest)
}

#[tokio::test]
async fn test_registries_track_message_syncs_across_kinds() {
    let mut acct = account("a");
    acct.register(SyncKind::Messages, sync_op(7, 7));
    acct.register(SyncKind::PrivateThreadMessages, sync_op(7, 71));

    assert!(acct.has_message_sync(7, 7));
    assert!(acct.has_message_sync(7, 71));
    assert!(!acct.has_message_sync(7, 72));

    acct.unregister(SyncKind::Messages, 7, 7);
    assert!(!acct.has_message_sync(7, 7));
}

#[tokio::test]
async fn test_abort_all_cancels_and_drains_every_registry() {
    let mut acct = account("a");
    let op = sync_op(7, 7);
    let token = op.token.clone();
    acct.register(SyncKind::Messages, op);
    acct.register(SyncKind::PublicThreadList, sync_op(7, 7));
    acct.rest_ops = 2;

    acct.abort_all();
    assert!(token.is_cancelled());
    assert!(!acct.has_message_sync(7, 7));
    assert!(acct.public_thread_list_syncs.is_empty());
    assert_eq!(acct.rest_ops, 0);
}

#[tokio::test]
async fn test_least_loaded_selection_breaks_ties_in_order() {
    let mut accounts = vec![account("a"), account("b"), account("c")];
    accounts[0].rest_ops = 2;
    accounts[1].rest_ops = 1;
    accounts[2].rest_ops = 1;

    let eligible: std::collections::BTreeSet<usize> = [0, 1, 2].into_iter().collect();
    let picked = chat_archiver::cache::pick_least_rest_loaded(&accounts, &eligible);
    // b and c tie; iteration order prefers the earlier index.
    assert_eq!(picked, Some(1));

    accounts[1].removed = true;
    let picked = chat_archiver::cache::pick_least_rest_loaded(&accounts, &eligible);
    assert_eq!(picked, Some(2));
}
