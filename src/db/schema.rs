use rusqlite::Connection;

/// Create all tables. Every statement is idempotent, so this doubles as the
/// migration path for databases created by earlier versions.
///
/// Each snapshot kind gets a `latest_*` table (one row per entity) and a
/// `previous_*` table (zero or more history rows). The column lists of the
/// two must stay identical: history copies are `INSERT INTO previous SELECT
/// * FROM latest`.
pub fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS latest_guild_snapshots (
            id INTEGER PRIMARY KEY,
            _timestamp INTEGER NOT NULL,
            _deleted INTEGER,
            name TEXT,
            owner_id INTEGER
        );
        CREATE TABLE IF NOT EXISTS previous_guild_snapshots (
            id INTEGER NOT NULL,
            _timestamp INTEGER NOT NULL,
            _deleted INTEGER,
            name TEXT,
            owner_id INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_previous_guilds ON previous_guild_snapshots(id);

        CREATE TABLE IF NOT EXISTS latest_channel_snapshots (
            id INTEGER PRIMARY KEY,
            _timestamp INTEGER NOT NULL,
            _deleted INTEGER,
            guild_id INTEGER,
            kind INTEGER NOT NULL,
            name TEXT,
            topic TEXT,
            position INTEGER,
            parent_id INTEGER,
            nsfw INTEGER,
            overwrites TEXT,
            thread_archived INTEGER,
            thread_locked INTEGER
        );
        CREATE TABLE IF NOT EXISTS previous_channel_snapshots (
            id INTEGER NOT NULL,
            _timestamp INTEGER NOT NULL,
            _deleted INTEGER,
            guild_id INTEGER,
            kind INTEGER NOT NULL,
            name TEXT,
            topic TEXT,
            position INTEGER,
            parent_id INTEGER,
            nsfw INTEGER,
            overwrites TEXT,
            thread_archived INTEGER,
            thread_locked INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_previous_channels ON previous_channel_snapshots(id);
        CREATE INDEX IF NOT EXISTS idx_latest_channels_guild ON latest_channel_snapshots(guild_id);

        CREATE TABLE IF NOT EXISTS latest_role_snapshots (
            id INTEGER PRIMARY KEY,
            _timestamp INTEGER NOT NULL,
            _deleted INTEGER,
            guild_id INTEGER NOT NULL,
            name TEXT,
            permissions INTEGER NOT NULL,
            position INTEGER,
            color INTEGER,
            hoist INTEGER,
            mentionable INTEGER
        );
        CREATE TABLE IF NOT EXISTS previous_role_snapshots (
            id INTEGER NOT NULL,
            _timestamp INTEGER NOT NULL,
            _deleted INTEGER,
            guild_id INTEGER NOT NULL,
            name TEXT,
            permissions INTEGER NOT NULL,
            position INTEGER,
            color INTEGER,
            hoist INTEGER,
            mentionable INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_previous_roles ON previous_role_snapshots(id);

        CREATE TABLE IF NOT EXISTS latest_member_snapshots (
            guild_id INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            _timestamp INTEGER NOT NULL,
            _deleted INTEGER,
            nick TEXT,
            roles TEXT,
            joined_at TEXT,
            PRIMARY KEY (guild_id, user_id)
        );
        CREATE TABLE IF NOT EXISTS previous_member_snapshots (
            guild_id INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            _timestamp INTEGER NOT NULL,
            _deleted INTEGER,
            nick TEXT,
            roles TEXT,
            joined_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_previous_members ON previous_member_snapshots(guild_id, user_id);

        CREATE TABLE IF NOT EXISTS latest_user_snapshots (
            id INTEGER PRIMARY KEY,
            _timestamp INTEGER NOT NULL,
            _deleted INTEGER,
            username TEXT,
            discriminator TEXT,
            global_name TEXT,
            avatar,
            bot INTEGER
        );
        CREATE TABLE IF NOT EXISTS previous_user_snapshots (
            id INTEGER NOT NULL,
            _timestamp INTEGER NOT NULL,
            _deleted INTEGER,
            username TEXT,
            discriminator TEXT,
            global_name TEXT,
            avatar,
            bot INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_previous_users ON previous_user_snapshots(id);

        CREATE TABLE IF NOT EXISTS latest_message_snapshots (
            id INTEGER PRIMARY KEY,
            _timestamp INTEGER NOT NULL,
            _deleted INTEGER,
            channel_id INTEGER NOT NULL,
            guild_id INTEGER,
            author_id INTEGER NOT NULL,
            kind INTEGER NOT NULL,
            created_at INTEGER,
            content TEXT,
            edited_at INTEGER,
            flags INTEGER,
            pinned INTEGER,
            embeds TEXT,
            components TEXT
        );
        CREATE TABLE IF NOT EXISTS previous_message_snapshots (
            id INTEGER NOT NULL,
            _timestamp INTEGER NOT NULL,
            _deleted INTEGER,
            channel_id INTEGER NOT NULL,
            guild_id INTEGER,
            author_id INTEGER NOT NULL,
            kind INTEGER NOT NULL,
            created_at INTEGER,
            content TEXT,
            edited_at INTEGER,
            flags INTEGER,
            pinned INTEGER,
            embeds TEXT,
            components TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_previous_messages ON previous_message_snapshots(id);
        CREATE INDEX IF NOT EXISTS idx_latest_messages_channel
            ON latest_message_snapshots(channel_id, id);

        CREATE TABLE IF NOT EXISTS attachments (
            id INTEGER PRIMARY KEY,
            message_id INTEGER NOT NULL,
            filename TEXT NOT NULL,
            size INTEGER NOT NULL,
            url TEXT NOT NULL,
            content_type TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(message_id);

        CREATE TABLE IF NOT EXISTS reaction_emojis (
            internal_id INTEGER PRIMARY KEY AUTOINCREMENT,
            emoji_id INTEGER,
            name TEXT,
            UNIQUE(emoji_id, name)
        );

        CREATE TABLE IF NOT EXISTS reactions (
            message_id INTEGER NOT NULL,
            emoji INTEGER NOT NULL REFERENCES reaction_emojis(internal_id),
            user_id INTEGER NOT NULL,
            burst INTEGER NOT NULL DEFAULT 0,
            start_time INTEGER NOT NULL,
            end_time INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_reactions_message ON reactions(message_id, emoji, user_id);

        CREATE TABLE IF NOT EXISTS webhook_users (
            internal_id INTEGER PRIMARY KEY AUTOINCREMENT,
            webhook_id INTEGER NOT NULL,
            username TEXT,
            avatar TEXT,
            UNIQUE(webhook_id, username, avatar)
        );

        CREATE TABLE IF NOT EXISTS guild_member_sync (
            guild_id INTEGER NOT NULL,
            _timestamp INTEGER NOT NULL,
            user_ids TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_guild_member_sync ON guild_member_sync(guild_id);

        CREATE VIRTUAL TABLE IF NOT EXISTS message_fts USING fts5(
            message_id UNINDEXED,
            content,
            tokenize='porter unicode61'
        );",
    )
}
