use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Cid, ConnectionId, MessageId, MessageKind, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "health.check")]
    HealthCheck,
    #[serde(rename = "connection.changed")]
    ConnectionChanged,
    #[serde(rename = "connection.recovered")]
    ConnectionRecovered,
    #[serde(rename = "message.new")]
    MessageNew,
    #[serde(rename = "message.updated")]
    MessageUpdated,
    #[serde(rename = "message.deleted")]
    MessageDeleted,
    #[serde(rename = "message.read")]
    MessageRead,
    #[serde(rename = "reaction.new")]
    ReactionNew,
    #[serde(rename = "reaction.updated")]
    ReactionUpdated,
    #[serde(rename = "reaction.deleted")]
    ReactionDeleted,
    #[serde(rename = "typing.start")]
    TypingStart,
    #[serde(rename = "typing.stop")]
    TypingStop,
    #[serde(rename = "member.added")]
    MemberAdded,
    #[serde(rename = "member.updated")]
    MemberUpdated,
    #[serde(rename = "member.removed")]
    MemberRemoved,
    #[serde(rename = "channel.updated")]
    ChannelUpdated,
    #[serde(rename = "channel.deleted")]
    ChannelDeleted,
    #[serde(rename = "channel.hidden")]
    ChannelHidden,
    #[serde(rename = "channel.visible")]
    ChannelVisible,
    #[serde(rename = "channel.truncated")]
    ChannelTruncated,
    #[serde(rename = "user.watching.start")]
    UserWatchingStart,
    #[serde(rename = "user.watching.stop")]
    UserWatchingStop,
    #[serde(rename = "user.presence.changed")]
    UserPresenceChanged,
    #[serde(rename = "user.updated")]
    UserUpdated,
    #[serde(rename = "notification.message_new")]
    NotificationMessageNew,
    #[serde(rename = "notification.mark_read")]
    NotificationMarkRead,
    #[serde(other)]
    Unknown,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HealthCheck => "health.check",
            Self::ConnectionChanged => "connection.changed",
            Self::ConnectionRecovered => "connection.recovered",
            Self::MessageNew => "message.new",
            Self::MessageUpdated => "message.updated",
            Self::MessageDeleted => "message.deleted",
            Self::MessageRead => "message.read",
            Self::ReactionNew => "reaction.new",
            Self::ReactionUpdated => "reaction.updated",
            Self::ReactionDeleted => "reaction.deleted",
            Self::TypingStart => "typing.start",
            Self::TypingStop => "typing.stop",
            Self::MemberAdded => "member.added",
            Self::MemberUpdated => "member.updated",
            Self::MemberRemoved => "member.removed",
            Self::ChannelUpdated => "channel.updated",
            Self::ChannelDeleted => "channel.deleted",
            Self::ChannelHidden => "channel.hidden",
            Self::ChannelVisible => "channel.visible",
            Self::ChannelTruncated => "channel.truncated",
            Self::UserWatchingStart => "user.watching.start",
            Self::UserWatchingStop => "user.watching.stop",
            Self::UserPresenceChanged => "user.presence.changed",
            Self::UserUpdated => "user.updated",
            Self::NotificationMessageNew => "notification.message_new",
            Self::NotificationMarkRead => "notification.mark_read",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl User {
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            image: None,
            role: None,
            online: false,
            last_active: None,
            updated_at: None,
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub message_id: MessageId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(default = "default_reaction_score")]
    pub score: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_reaction_score() -> u32 {
    1
}

impl Reaction {
    pub fn author(&self) -> Option<&UserId> {
        self.user_id
            .as_ref()
            .or_else(|| self.user.as_ref().map(|user| &user.id))
    }

    /// A reaction is identified by who reacted and with what type.
    pub fn same_identity(&self, other: &Reaction) -> bool {
        self.kind == other.kind && self.author().is_some() && self.author() == other.author()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<Cid>,
    #[serde(default)]
    pub text: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    #[serde(default)]
    pub show_in_channel: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub latest_reactions: Vec<Reaction>,
    #[serde(default)]
    pub own_reactions: Vec<Reaction>,
    #[serde(default)]
    pub reaction_counts: BTreeMap<String, u32>,
    #[serde(default)]
    pub reaction_scores: BTreeMap<String, u32>,
    #[serde(default)]
    pub reply_count: u32,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub silent: bool,
    #[serde(default)]
    pub shadowed: bool,
}

impl Message {
    pub fn new(id: impl Into<MessageId>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            cid: None,
            text: String::new(),
            kind: MessageKind::Regular,
            user: None,
            parent_id: None,
            show_in_channel: false,
            created_at,
            updated_at: None,
            deleted_at: None,
            latest_reactions: Vec::new(),
            own_reactions: Vec::new(),
            reaction_counts: BTreeMap::new(),
            reaction_scores: BTreeMap::new(),
            reply_count: 0,
            pinned: false,
            silent: false,
            shadowed: false,
        }
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.user.as_ref().map(|user| &user.id)
    }

    /// Replies that are not mirrored into the main list.
    pub fn is_thread_only(&self) -> bool {
        self.parent_id.is_some() && !self.show_in_channel
    }

    pub fn sort_key(&self) -> (DateTime<Utc>, &MessageId) {
        (self.created_at, &self.id)
    }

    /// Timestamp used for last-write-wins comparisons.
    pub fn version(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_role: Option<String>,
    #[serde(default)]
    pub banned: bool,
    #[serde(default)]
    pub shadow_banned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Member {
    pub fn for_user(user: User) -> Self {
        Self {
            user_id: Some(user.id.clone()),
            user: Some(user),
            channel_role: None,
            banned: false,
            shadow_banned: false,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn member_id(&self) -> Option<&UserId> {
        self.user_id
            .as_ref()
            .or_else(|| self.user.as_ref().map(|user| &user.id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub cid: Cid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated_at: Option<DateTime<Utc>>,
    /// `None` when the payload did not say.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden: Option<bool>,
    #[serde(default)]
    pub frozen: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_count: Option<u32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ChannelInfo {
    pub fn new(cid: Cid) -> Self {
        Self {
            cid,
            name: None,
            created_at: None,
            updated_at: None,
            last_message_at: None,
            deleted_at: None,
            truncated_at: None,
            hidden: None,
            frozen: false,
            member_count: None,
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRead {
    pub user: User,
    pub last_read: DateTime<Utc>,
    #[serde(default)]
    pub unread_messages: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_message_id: Option<MessageId>,
}

/// Full channel state as returned by a channel query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub channel: ChannelInfo,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub read: Vec<ChannelRead>,
    #[serde(default)]
    pub watchers: Vec<User>,
    #[serde(default)]
    pub watcher_count: u32,
}

impl ChannelSnapshot {
    pub fn empty(cid: Cid) -> Self {
        Self {
            channel: ChannelInfo::new(cid),
            messages: Vec::new(),
            members: Vec::new(),
            read: Vec::new(),
            watchers: Vec::new(),
            watcher_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventType,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<Cid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction: Option<Reaction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<Member>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub me: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watcher_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_unread_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_channels: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<ConnectionId>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hard_delete: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub clear_history: bool,
}

impl Event {
    pub fn new(kind: EventType) -> Self {
        Self {
            kind,
            created_at: Utc::now(),
            cid: None,
            message: None,
            reaction: None,
            channel: None,
            member: None,
            user: None,
            me: None,
            parent_id: None,
            watcher_count: None,
            unread_count: None,
            total_unread_count: None,
            unread_channels: None,
            online: None,
            connection_id: None,
            hard_delete: false,
            clear_history: false,
        }
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_cid(mut self, cid: Cid) -> Self {
        self.cid = Some(cid);
        self
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.message = Some(message);
        self
    }

    pub fn with_reaction(mut self, reaction: Reaction) -> Self {
        self.reaction = Some(reaction);
        self
    }

    pub fn with_user(mut self, user: User) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_member(mut self, member: Member) -> Self {
        self.member = Some(member);
        self
    }

    pub fn with_channel(mut self, channel: ChannelInfo) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_watcher_count(mut self, watcher_count: u32) -> Self {
        self.watcher_count = Some(watcher_count);
        self
    }

    pub fn with_online(mut self, online: bool) -> Self {
        self.online = Some(online);
        self
    }

    /// The channel this event targets, if any.
    pub fn target_cid(&self) -> Option<&Cid> {
        self.cid
            .as_ref()
            .or_else(|| self.channel.as_ref().map(|channel| &channel.cid))
            .or_else(|| self.message.as_ref().and_then(|message| message.cid.as_ref()))
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.user.as_ref().map(|user| &user.id)
    }
}

/// Outbound keepalive frame.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckFrame {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub client_id: String,
}

impl HealthCheckFrame {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            kind: EventType::HealthCheck,
            client_id: client_id.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub channel_cids: Vec<Cid>,
    pub last_sync_at: DateTime<Utc>,
    #[serde(default)]
    pub watch: bool,
    #[serde(default)]
    pub with_inaccessible_cids: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncResponse {
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub inaccessible_cids: Vec<Cid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryChannelsRequest {
    pub filter_conditions: serde_json::Value,
    pub sort: Vec<SortOption>,
    pub state: bool,
    pub watch: bool,
    pub presence: bool,
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortOption {
    pub field: String,
    pub direction: i8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryChannelsResponse {
    #[serde(default)]
    pub channels: Vec<ChannelSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_health_check_frame_with_me_and_connection_id() {
        let raw = r#"{
            "type": "health.check",
            "created_at": "2024-05-01T10:00:00Z",
            "connection_id": "conn-1",
            "me": {"id": "alice", "name": "Alice", "online": true, "total_unread_count": 3}
        }"#;
        let event: Event = serde_json::from_str(raw).expect("event");
        assert_eq!(event.kind, EventType::HealthCheck);
        assert_eq!(event.connection_id, Some(ConnectionId::new("conn-1")));
        let me = event.me.expect("me");
        assert_eq!(me.id, UserId::new("alice"));
        assert!(me.online);
        assert_eq!(me.extra.get("total_unread_count"), Some(&serde_json::json!(3)));
    }

    #[test]
    fn unknown_event_types_decode_as_unknown() {
        let raw = r#"{"type":"poll.vote_casted","created_at":"2024-05-01T10:00:00Z"}"#;
        let event: Event = serde_json::from_str(raw).expect("event");
        assert_eq!(event.kind, EventType::Unknown);
    }

    #[test]
    fn target_cid_falls_back_to_message_cid() {
        let mut message = Message::new("m1", "2024-05-01T10:00:00Z".parse().expect("ts"));
        message.cid = Some(Cid::new("messaging", "a"));
        let event = Event::new(EventType::MessageNew).with_message(message);
        assert_eq!(event.target_cid(), Some(&Cid::new("messaging", "a")));
    }

    #[test]
    fn reaction_identity_requires_same_user_and_type() {
        let mut like = Reaction {
            message_id: MessageId::new("m1"),
            kind: "like".into(),
            user_id: Some(UserId::new("bob")),
            user: None,
            score: 1,
            created_at: None,
            updated_at: None,
        };
        let other = like.clone();
        assert!(like.same_identity(&other));
        like.kind = "love".into();
        assert!(!like.same_identity(&other));
    }
}
