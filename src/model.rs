use serde::{Deserialize, Serialize};

pub type GuildId = u64;
pub type ChannelId = u64;
pub type MessageId = u64;
pub type UserId = u64;
pub type RoleId = u64;
pub type EmojiId = u64;

/// Synthetic author ids minted for webhook users live below this bound so
/// they can never collide with a platform snowflake.
pub const SYNTHETIC_ID_BOUND: u64 = 1 << 48;

/// The platform serializes 64-bit ids as decimal strings.
pub mod snowflake {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Same as `snowflake`, for optional/nullable fields.
pub mod snowflake_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<u64>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(v) => s.serialize_some(&v.to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        match raw {
            Some(raw) => raw.parse().map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Lists of ids (role lists, member lists) come as lists of strings.
pub mod snowflake_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u64], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(v.iter().map(u64::to_string))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u64>, D::Error> {
        let raw = Vec::<String>::deserialize(d)?;
        raw.iter()
            .map(|s| s.parse().map_err(serde::de::Error::custom))
            .collect()
    }
}

/// One frame of the event bus protocol, both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    #[serde(with = "snowflake")]
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub discriminator: Option<String>,
    #[serde(default)]
    pub global_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub bot: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default, with = "snowflake_vec")]
    pub roles: Vec<RoleId>,
    #[serde(default)]
    pub joined_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    #[serde(with = "snowflake")]
    pub id: RoleId,
    pub name: String,
    /// 64-bit permission bitfield, decimal string on the wire.
    #[serde(with = "snowflake")]
    pub permissions: u64,
    #[serde(default)]
    pub position: i64,
    #[serde(default)]
    pub color: i64,
    #[serde(default)]
    pub hoist: bool,
    #[serde(default)]
    pub mentionable: bool,
}

/// A channel permission overwrite. `kind` 0 targets a role, 1 a member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Overwrite {
    #[serde(with = "snowflake")]
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(with = "snowflake")]
    pub allow: u64,
    #[serde(with = "snowflake")]
    pub deny: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMetadata {
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub archive_timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    #[serde(with = "snowflake")]
    pub id: ChannelId,
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default, with = "snowflake_opt")]
    pub guild_id: Option<GuildId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub position: Option<i64>,
    #[serde(default)]
    pub nsfw: Option<bool>,
    #[serde(default, with = "snowflake_opt")]
    pub parent_id: Option<ChannelId>,
    #[serde(default, with = "snowflake_opt")]
    pub last_message_id: Option<MessageId>,
    #[serde(default)]
    pub message_count: Option<u64>,
    #[serde(default, with = "snowflake_opt")]
    pub owner_id: Option<UserId>,
    #[serde(default)]
    pub permission_overwrites: Option<Vec<Overwrite>>,
    #[serde(default)]
    pub thread_metadata: Option<ThreadMetadata>,
}

/// Channel kinds the archiver reads message history from.
pub const TEXT_CHANNEL: u8 = 0;
pub const VOICE_CHANNEL: u8 = 2;
pub const ANNOUNCEMENT_CHANNEL: u8 = 5;
pub const ANNOUNCEMENT_THREAD: u8 = 10;
pub const PUBLIC_THREAD: u8 = 11;
pub const PRIVATE_THREAD: u8 = 12;
pub const FORUM_CHANNEL: u8 = 15;

impl Channel {
    /// Text-like: a channel whose message history can be paginated.
    pub fn is_text_like(&self) -> bool {
        matches!(
            self.kind,
            TEXT_CHANNEL | VOICE_CHANNEL | ANNOUNCEMENT_CHANNEL | FORUM_CHANNEL
        )
    }

    pub fn is_thread(&self) -> bool {
        matches!(
            self.kind,
            ANNOUNCEMENT_THREAD | PUBLIC_THREAD | PRIVATE_THREAD
        )
    }

    pub fn is_private_thread(&self) -> bool {
        self.kind == PRIVATE_THREAD
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guild {
    #[serde(with = "snowflake")]
    pub id: GuildId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, with = "snowflake_opt")]
    pub owner_id: Option<UserId>,
    #[serde(default)]
    pub unavailable: Option<bool>,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub threads: Vec<Channel>,
    /// Only the connecting account's own member is guaranteed present here.
    #[serde(default)]
    pub members: Vec<Member>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(with = "snowflake")]
    pub id: u64,
    pub filename: String,
    #[serde(default)]
    pub size: u64,
    pub url: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Emoji {
    #[serde(default, with = "snowflake_opt")]
    pub id: Option<EmojiId>,
    #[serde(default)]
    pub name: Option<String>,
}

impl Emoji {
    /// The path segment used when enumerating reactors: `name:id` for custom
    /// emoji, the literal character for built-ins.
    pub fn reaction_route(&self) -> String {
        match (self.id, &self.name) {
            (Some(id), Some(name)) => format!("{name}:{id}"),
            (_, Some(name)) => name.clone(),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReactionKind {
    Normal,
    Burst,
}

impl ReactionKind {
    pub fn as_query(self) -> u8 {
        match self {
            ReactionKind::Normal => 0,
            ReactionKind::Burst => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionGroup {
    pub count: u64,
    pub emoji: Emoji,
    #[serde(default)]
    pub count_details: Option<ReactionCountDetails>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionCountDetails {
    #[serde(default)]
    pub normal: u64,
    #[serde(default)]
    pub burst: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(with = "snowflake")]
    pub id: MessageId,
    #[serde(with = "snowflake")]
    pub channel_id: ChannelId,
    #[serde(default, with = "snowflake_opt")]
    pub guild_id: Option<GuildId>,
    pub author: User,
    #[serde(default)]
    pub member: Option<Member>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub edited_timestamp: Option<String>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default, rename = "type")]
    pub kind: u8,
    #[serde(default)]
    pub flags: Option<u64>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub embeds: Vec<serde_json::Value>,
    #[serde(default)]
    pub components: Vec<serde_json::Value>,
    #[serde(default)]
    pub reactions: Vec<ReactionGroup>,
    #[serde(default, with = "snowflake_opt")]
    pub webhook_id: Option<u64>,
}

/// The subset of message fields a `MESSAGE_UPDATE` dispatch may carry.
/// Everything except the ids is optional; absent means "unchanged".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageUpdate {
    #[serde(with = "snowflake")]
    pub id: MessageId,
    #[serde(with = "snowflake")]
    pub channel_id: ChannelId,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub edited_timestamp: Option<String>,
    #[serde(default)]
    pub pinned: Option<bool>,
    #[serde(default)]
    pub flags: Option<u64>,
    #[serde(default)]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(default)]
    pub embeds: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub components: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub author: Option<User>,
}

/// Parse a platform ISO-8601 timestamp into epoch milliseconds.
pub fn parse_timestamp_millis(raw: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp_millis())
}
