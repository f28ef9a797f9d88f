//! Local cache of one watched channel.
//!
//! Every mutation is idempotent and tolerant of out-of-order delivery: the
//! message list is kept sorted by `(created_at, id)`, updates are
//! last-write-wins by `updated_at`, and reactions are counted once per
//! `(user, type)` identity.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use chat_shared::{
    domain::{Cid, MessageId, MessageKind, UserId},
    protocol::{ChannelInfo, ChannelSnapshot, Event, EventType, Member, Message, Reaction, User},
};
use chrono::{DateTime, Utc};
use tokio::time::{Duration, Instant};

use crate::{client_state::ClientState, store::Applied};

const RECENT_MESSAGE_WINDOW: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadState {
    pub last_read: DateTime<Utc>,
    pub unread_messages: u32,
    pub last_read_message_id: Option<MessageId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingIndicator {
    pub started_at: Instant,
    pub last_keystroke: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Location {
    Main,
    Thread(MessageId),
}

type ReactionIdentity = (UserId, String);

/// Bounded memory of recently seen message ids, so a duplicate
/// `message.new` is recognised even when the list is not the live tail.
#[derive(Debug, Default)]
struct RecentIds {
    order: VecDeque<MessageId>,
    ids: HashSet<MessageId>,
}

impl RecentIds {
    fn insert(&mut self, id: &MessageId) -> bool {
        if !self.ids.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id.clone());
        if self.order.len() > RECENT_MESSAGE_WINDOW {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        true
    }

    fn clear(&mut self) {
        self.order.clear();
        self.ids.clear();
    }
}

#[derive(Debug)]
pub struct ChannelState {
    cid: Cid,
    info: ChannelInfo,
    messages: Vec<Message>,
    threads: HashMap<MessageId, Vec<Message>>,
    locations: HashMap<MessageId, Location>,
    reads: HashMap<UserId, ReadState>,
    watchers: BTreeSet<UserId>,
    members: HashMap<UserId, Member>,
    typing: HashMap<UserId, TypingIndicator>,
    watcher_count: u32,
    is_up_to_date: bool,
    last_message_at: Option<DateTime<Utc>>,
    unread_count: u32,
    recent_ids: RecentIds,
    reaction_identities: HashMap<MessageId, HashSet<ReactionIdentity>>,
    latest_reactions_limit: usize,
}

impl ChannelState {
    pub fn new(cid: Cid, latest_reactions_limit: usize) -> Self {
        Self {
            info: ChannelInfo::new(cid.clone()),
            cid,
            messages: Vec::new(),
            threads: HashMap::new(),
            locations: HashMap::new(),
            reads: HashMap::new(),
            watchers: BTreeSet::new(),
            members: HashMap::new(),
            typing: HashMap::new(),
            watcher_count: 0,
            is_up_to_date: false,
            last_message_at: None,
            unread_count: 0,
            recent_ids: RecentIds::default(),
            reaction_identities: HashMap::new(),
            latest_reactions_limit: latest_reactions_limit.max(1),
        }
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn info(&self) -> &ChannelInfo {
        &self.info
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        match self.locations.get(id)? {
            Location::Main => self.messages.iter().find(|m| &m.id == id),
            Location::Thread(parent) => self.threads.get(parent)?.iter().find(|m| &m.id == id),
        }
    }

    pub fn contains_message(&self, id: &MessageId) -> bool {
        self.locations.contains_key(id)
    }

    /// Replies to `parent`, including ones also shown in the main list.
    pub fn thread_replies(&self, parent: &MessageId) -> Vec<&Message> {
        let mut replies: Vec<&Message> = self
            .threads
            .get(parent)
            .into_iter()
            .flatten()
            .chain(
                self.messages
                    .iter()
                    .filter(|m| m.parent_id.as_ref() == Some(parent)),
            )
            .collect();
        replies.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        replies
    }

    pub fn read(&self, user_id: &UserId) -> Option<&ReadState> {
        self.reads.get(user_id)
    }

    pub fn reads(&self) -> impl Iterator<Item = (&UserId, &ReadState)> {
        self.reads.iter()
    }

    pub fn watchers(&self) -> impl Iterator<Item = &UserId> {
        self.watchers.iter()
    }

    /// Watchers resolved through the shared user index.
    pub fn watcher_users<'a>(&'a self, client: &'a ClientState) -> Vec<&'a User> {
        self.watchers
            .iter()
            .filter_map(|user_id| client.user(user_id))
            .collect()
    }

    pub fn member(&self, user_id: &UserId) -> Option<&Member> {
        self.members.get(user_id)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn typing_users(&self) -> Vec<&UserId> {
        let mut users: Vec<&UserId> = self.typing.keys().collect();
        users.sort();
        users
    }

    pub fn watcher_count(&self) -> u32 {
        self.watcher_count
    }

    /// The watcher count only describes the live channel while the cache is
    /// the live tail.
    pub fn live_watcher_count(&self) -> Option<u32> {
        self.is_up_to_date.then_some(self.watcher_count)
    }

    pub fn is_up_to_date(&self) -> bool {
        self.is_up_to_date
    }

    pub fn is_hidden(&self) -> bool {
        self.info.hidden.unwrap_or(false)
    }

    pub fn last_message_at(&self) -> Option<DateTime<Utc>> {
        self.last_message_at
    }

    pub fn unread_count(&self) -> u32 {
        self.unread_count
    }

    /// Replaces the whole cache with a server snapshot of the live tail.
    pub fn hydrate(&mut self, snapshot: ChannelSnapshot, client: &mut ClientState) {
        self.messages.clear();
        self.threads.clear();
        self.locations.clear();
        self.reaction_identities.clear();
        self.recent_ids.clear();
        self.reads.clear();
        self.watchers.clear();
        self.members.clear();
        self.typing.clear();

        self.info = snapshot.channel;
        self.watcher_count = snapshot.watcher_count;
        self.is_up_to_date = true;

        for message in snapshot.messages {
            self.recent_ids.insert(&message.id);
            self.upsert(message, client);
        }
        self.last_message_at = self.info.last_message_at.max(self.tail_created_at());

        for member in snapshot.members {
            self.add_member(member, client);
        }
        for user in snapshot.watchers {
            client.update_user_reference(&user, &self.cid);
            self.watchers.insert(user.id);
        }
        let me = client.me_id().cloned();
        for read in snapshot.read {
            client.update_user_reference(&read.user, &self.cid);
            if me.as_ref() == Some(&read.user.id) {
                self.unread_count = read.unread_messages;
            }
            self.reads.insert(
                read.user.id,
                ReadState {
                    last_read: read.last_read,
                    unread_messages: read.unread_messages,
                    last_read_message_id: read.last_read_message_id,
                },
            );
        }
    }

    /// Loads a page that is not necessarily the live tail, e.g. the window
    /// around a message the user jumped to.
    pub fn replace_window(
        &mut self,
        messages: Vec<Message>,
        is_latest: bool,
        client: &mut ClientState,
    ) {
        self.messages.clear();
        self.locations.retain(|_, location| *location != Location::Main);
        let locations = &self.locations;
        self.reaction_identities.retain(|id, _| locations.contains_key(id));
        for message in messages {
            self.recent_ids.insert(&message.id);
            self.upsert(message, client);
        }
        self.is_up_to_date = is_latest;
        if is_latest {
            self.last_message_at = self.last_message_at.max(self.tail_created_at());
        }
    }

    /// Merges an older page into the current list.
    pub fn prepend_history(&mut self, older: Vec<Message>, client: &mut ClientState) -> usize {
        let mut added = 0;
        for message in older {
            let known = self.contains_message(&message.id);
            self.recent_ids.insert(&message.id);
            if self.upsert(message, client) && !known {
                added += 1;
            }
        }
        added
    }

    pub fn apply(&mut self, event: &Event, client: &mut ClientState, now: Instant) -> Applied {
        let mut outcome = match event.watcher_count {
            Some(count) if count != self.watcher_count => {
                self.watcher_count = count;
                Applied::Changed
            }
            Some(_) => Applied::Unchanged,
            None => Applied::Ignored,
        };

        let handled = match event.kind {
            EventType::MessageNew | EventType::NotificationMessageNew => {
                self.on_message_new(event, client)
            }
            EventType::MessageUpdated => self.on_message_updated(event, client),
            EventType::MessageDeleted => self.on_message_deleted(event, client),
            EventType::MessageRead | EventType::NotificationMarkRead => {
                self.on_message_read(event, client)
            }
            EventType::ReactionNew => self.on_reaction(event, client, ReactionOp::Add),
            EventType::ReactionUpdated => self.on_reaction(event, client, ReactionOp::Replace),
            EventType::ReactionDeleted => self.on_reaction(event, client, ReactionOp::Remove),
            EventType::TypingStart => self.on_typing(event, client, now, true),
            EventType::TypingStop => self.on_typing(event, client, now, false),
            EventType::MemberAdded | EventType::MemberUpdated => {
                match event.member.clone().or_else(|| event.user.clone().map(Member::for_user)) {
                    Some(member) => self.add_member(member, client),
                    None => Applied::Ignored,
                }
            }
            EventType::MemberRemoved => {
                let user_id = event
                    .member
                    .as_ref()
                    .and_then(|member| member.member_id())
                    .or_else(|| event.user_id());
                match user_id {
                    Some(user_id) => Applied::from_changed(self.members.remove(user_id).is_some()),
                    None => Applied::Ignored,
                }
            }
            EventType::UserWatchingStart => match &event.user {
                Some(user) => {
                    let referenced = client.update_user_reference(user, &self.cid);
                    referenced.or(self.watchers.insert(user.id.clone()))
                }
                None => Applied::Ignored,
            },
            EventType::UserWatchingStop => match event.user_id() {
                Some(user_id) => Applied::from_changed(self.watchers.remove(user_id)),
                None => Applied::Ignored,
            },
            EventType::ChannelUpdated => self.on_channel_updated(event),
            EventType::ChannelHidden => {
                let mut changed = !self.is_hidden();
                self.info.hidden = Some(true);
                if event.clear_history {
                    changed |= self.truncate(None);
                }
                Applied::from_changed(changed)
            }
            EventType::ChannelVisible => {
                let changed = self.is_hidden();
                self.info.hidden = Some(false);
                Applied::from_changed(changed)
            }
            EventType::ChannelTruncated => self.on_channel_truncated(event, client),
            EventType::ChannelDeleted => {
                let deleted_at = event
                    .channel
                    .as_ref()
                    .and_then(|channel| channel.deleted_at)
                    .unwrap_or(event.created_at);
                let changed = self.info.deleted_at != Some(deleted_at);
                self.info.deleted_at = Some(deleted_at);
                Applied::from_changed(self.truncate(None) || changed)
            }
            _ => Applied::Ignored,
        };
        outcome = outcome.merge(handled);
        outcome
    }

    /// Drops typing indicators whose last keystroke is older than `timeout`.
    pub fn sweep_typing(&mut self, now: Instant, timeout: Duration) -> Vec<UserId> {
        let mut expired: Vec<UserId> = self
            .typing
            .iter()
            .filter(|(_, indicator)| now.saturating_duration_since(indicator.last_keystroke) > timeout)
            .map(|(user_id, _)| user_id.clone())
            .collect();
        for user_id in &expired {
            self.typing.remove(user_id);
        }
        expired.sort();
        expired
    }

    fn on_message_new(&mut self, event: &Event, client: &mut ClientState) -> Applied {
        let Some(message) = event.message.clone() else {
            return Applied::Ignored;
        };
        let first_delivery =
            !self.contains_message(&message.id) && self.recent_ids.insert(&message.id);
        let own = message
            .user_id()
            .map(|user_id| client.is_me(user_id))
            .unwrap_or(false);
        let thread_only = message.is_thread_only();
        let created_at = message.created_at;
        let parent_id = message.parent_id.clone();
        let counts_as_unread = !own
            && !thread_only
            && !message.silent
            && !message.shadowed
            && !matches!(message.kind, MessageKind::System | MessageKind::Deleted);

        let mut changed = false;
        if self.is_up_to_date || thread_only {
            changed |= self.upsert(message, client);
        } else if let Some(user) = &message.user {
            changed |= client.update_user_reference(user, &self.cid).is_changed();
        }

        if !thread_only && self.last_message_at.map_or(true, |last| created_at > last) {
            self.last_message_at = Some(created_at);
            changed = true;
        }

        if first_delivery {
            if let Some(parent_id) = parent_id {
                if let Some(parent) = self.message_mut(&parent_id) {
                    parent.reply_count += 1;
                    changed = true;
                }
            }
            if own {
                if let Some(me) = client.me_id().cloned() {
                    changed |= self.advance_read(me, created_at);
                }
                changed |= self.unread_count != 0;
                self.unread_count = 0;
            } else if counts_as_unread {
                self.unread_count += 1;
                changed = true;
            }
        }
        if let Some(unread) = event.unread_count.filter(|_| !own) {
            changed |= self.unread_count != unread;
            self.unread_count = unread;
        }
        Applied::from_changed(changed)
    }

    fn on_message_updated(&mut self, event: &Event, client: &mut ClientState) -> Applied {
        let Some(message) = event.message.clone() else {
            return Applied::Ignored;
        };
        if !self.contains_message(&message.id) {
            return Applied::Ignored;
        }
        Applied::from_changed(self.upsert(message, client))
    }

    fn on_message_deleted(&mut self, event: &Event, client: &mut ClientState) -> Applied {
        let Some(message) = event.message.clone() else {
            return Applied::Ignored;
        };
        if event.hard_delete {
            let anchored = self.last_message_at == Some(message.created_at);
            let removed = self.remove_message(&message.id);
            if let Some(parent_id) = removed.as_ref().and_then(|m| m.parent_id.clone()) {
                if let Some(parent) = self.message_mut(&parent_id) {
                    parent.reply_count = parent.reply_count.saturating_sub(1);
                }
            }
            let removed = removed.is_some();
            if !removed && !anchored {
                return Applied::Ignored;
            }
            if anchored || self.is_up_to_date {
                self.last_message_at = self.tail_created_at();
            }
            return Applied::Changed;
        }

        let Some(existing) = self.message(&message.id).cloned() else {
            return Applied::Ignored;
        };
        let mut tombstone = message;
        if tombstone.kind != MessageKind::Deleted {
            tombstone.kind = MessageKind::Deleted;
        }
        if tombstone.deleted_at.is_none() {
            tombstone.deleted_at = Some(event.created_at);
        }
        // Position is fixed by the original message, not the tombstone.
        tombstone.created_at = existing.created_at;
        tombstone.parent_id = existing.parent_id.clone();
        tombstone.show_in_channel = existing.show_in_channel;
        if tombstone.updated_at.is_none() {
            tombstone.updated_at = tombstone.deleted_at.max(existing.updated_at);
        }
        Applied::from_changed(self.upsert(tombstone, client))
    }

    fn on_message_read(&mut self, event: &Event, client: &mut ClientState) -> Applied {
        let user = match (&event.user, client.me()) {
            (Some(user), _) => user.clone(),
            (None, Some(me)) if event.kind == EventType::NotificationMarkRead => me.clone(),
            _ => return Applied::Ignored,
        };
        let mut changed = client.update_user_reference(&user, &self.cid).is_changed();
        let own = client.is_me(&user.id);
        changed |= self.advance_read(user.id, event.created_at);
        if own {
            changed |= self.unread_count != 0;
            self.unread_count = 0;
        }
        Applied::from_changed(changed)
    }

    fn on_typing(
        &mut self,
        event: &Event,
        client: &mut ClientState,
        now: Instant,
        started: bool,
    ) -> Applied {
        let Some(user) = &event.user else {
            return Applied::Ignored;
        };
        if !started {
            return Applied::from_changed(self.typing.remove(&user.id).is_some());
        }
        client.update_user_reference(user, &self.cid);
        let indicator = self.typing.entry(user.id.clone()).or_insert(TypingIndicator {
            started_at: now,
            last_keystroke: now,
        });
        indicator.last_keystroke = now;
        Applied::Changed
    }

    fn on_channel_updated(&mut self, event: &Event) -> Applied {
        let Some(channel) = &event.channel else {
            return Applied::Ignored;
        };
        if let (Some(incoming), Some(stored)) = (channel.updated_at, self.info.updated_at) {
            if incoming < stored {
                return Applied::Unchanged;
            }
        }
        let mut info = channel.clone();
        info.cid = self.cid.clone();
        // Local-only flags survive updates that do not mention them.
        info.hidden = info.hidden.or(self.info.hidden);
        info.truncated_at = info.truncated_at.or(self.info.truncated_at);
        info.deleted_at = info.deleted_at.or(self.info.deleted_at);
        if info == self.info {
            return Applied::Unchanged;
        }
        if let Some(last) = info.last_message_at {
            if self.last_message_at.map_or(true, |current| last > current) {
                self.last_message_at = Some(last);
            }
        }
        self.info = info;
        Applied::Changed
    }

    fn on_channel_truncated(&mut self, event: &Event, client: &mut ClientState) -> Applied {
        let truncated_at = event.channel.as_ref().and_then(|channel| channel.truncated_at);
        let mut changed = self.truncate(truncated_at);
        if let Some(at) = truncated_at {
            changed |= self.info.truncated_at != Some(at);
            self.info.truncated_at = Some(at);
        }
        if let Some(message) = event.message.clone() {
            self.recent_ids.insert(&message.id);
            changed |= self.upsert(message, client);
            self.last_message_at = self.tail_created_at();
        }
        changed |= self.unread_count != 0;
        self.unread_count = 0;
        Applied::from_changed(changed)
    }

    /// Removes messages created at or before `until`, or all when `None`.
    fn truncate(&mut self, until: Option<DateTime<Utc>>) -> bool {
        let doomed: Vec<MessageId> = self
            .messages
            .iter()
            .chain(self.threads.values().flatten())
            .filter(|message| until.map_or(true, |at| message.created_at <= at))
            .map(|message| message.id.clone())
            .collect();
        if doomed.is_empty() {
            return false;
        }
        for id in &doomed {
            self.remove_message(id);
        }
        self.last_message_at = self.tail_created_at();
        true
    }

    fn add_member(&mut self, member: Member, client: &mut ClientState) -> Applied {
        let Some(user_id) = member.member_id().cloned() else {
            return Applied::Ignored;
        };
        let mut changed = false;
        if let Some(user) = &member.user {
            changed |= client.update_user_reference(user, &self.cid).is_changed();
        }
        let mut stored = member;
        stored.user_id = Some(user_id.clone());
        stored.user = None;
        if let Some(existing) = self.members.get(&user_id) {
            if let (Some(incoming), Some(current)) = (stored.updated_at, existing.updated_at) {
                if incoming < current {
                    return Applied::from_changed(changed);
                }
            }
            if *existing == stored {
                return Applied::from_changed(changed);
            }
        }
        self.members.insert(user_id, stored);
        Applied::Changed
    }

    /// Moves `reads[user]` forward. Never moves it backwards.
    fn advance_read(&mut self, user_id: UserId, at: DateTime<Utc>) -> bool {
        match self.reads.get_mut(&user_id) {
            Some(read) if read.last_read >= at => false,
            Some(read) => {
                read.last_read = at;
                read.unread_messages = 0;
                true
            }
            None => {
                self.reads.insert(
                    user_id,
                    ReadState {
                        last_read: at,
                        unread_messages: 0,
                        last_read_message_id: None,
                    },
                );
                true
            }
        }
    }

    fn on_reaction(&mut self, event: &Event, client: &mut ClientState, op: ReactionOp) -> Applied {
        let Some(reaction) = event.reaction.clone() else {
            return Applied::Ignored;
        };
        let Some(author) = reaction.author().cloned() else {
            return Applied::Ignored;
        };
        if !self.contains_message(&reaction.message_id) {
            return Applied::Ignored;
        }
        if let Some(user) = &reaction.user {
            client.update_user_reference(user, &self.cid);
        }
        let own = client.is_me(&author);
        let limit = self.latest_reactions_limit;
        let message_id = reaction.message_id.clone();
        let reaction = strip_reaction(reaction);

        let server_copy = event
            .message
            .as_ref()
            .filter(|message| message.id == message_id)
            .cloned();

        let identities = self.reaction_identities.entry(message_id.clone()).or_default();
        let Some(message) =
            find_message_mut(&mut self.messages, &mut self.threads, &self.locations, &message_id)
        else {
            return Applied::Ignored;
        };
        let before = message.clone();

        match server_copy {
            Some(server) if server.version() >= message.version() => {
                message.reaction_counts = server.reaction_counts;
                message.reaction_scores = server.reaction_scores;
                message.latest_reactions =
                    server.latest_reactions.into_iter().map(strip_reaction).collect();
                message.updated_at = server.updated_at.or(message.updated_at);
                apply_own_reaction(message, &reaction, own, op);
                *identities = identities_of(message);
            }
            _ => {
                apply_local_reaction(message, identities, &reaction, op, limit);
                apply_own_reaction(message, &reaction, own, op);
            }
        }
        Applied::from_changed(*message != before)
    }

    fn message_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        find_message_mut(&mut self.messages, &mut self.threads, &self.locations, id)
    }

    fn tail_created_at(&self) -> Option<DateTime<Utc>> {
        self.messages.last().map(|message| message.created_at)
    }

    /// Ordered insert-or-replace by id. Returns whether anything changed.
    fn upsert(&mut self, mut message: Message, client: &mut ClientState) -> bool {
        absorb_users(&mut message, client, &self.cid);

        if let Some(existing) = self.message(&message.id) {
            if message.version() < existing.version() {
                return false;
            }
            if message.own_reactions.is_empty() {
                message.own_reactions = existing.own_reactions.clone();
            }
            if *existing == message {
                return false;
            }
            self.remove_message(&message.id);
        }

        self.reaction_identities
            .insert(message.id.clone(), identities_of(&message));
        let location = match &message.parent_id {
            Some(parent) if message.is_thread_only() => Location::Thread(parent.clone()),
            _ => Location::Main,
        };
        let list = match &location {
            Location::Main => &mut self.messages,
            Location::Thread(parent) => self.threads.entry(parent.clone()).or_default(),
        };
        let index = list.partition_point(|m| m.sort_key() < message.sort_key());
        self.locations.insert(message.id.clone(), location);
        list.insert(index, message);
        true
    }

    fn remove_message(&mut self, id: &MessageId) -> Option<Message> {
        let location = self.locations.remove(id)?;
        self.reaction_identities.remove(id);
        let removed = match location {
            Location::Main => {
                let index = self.messages.iter().position(|m| &m.id == id)?;
                Some(self.messages.remove(index))
            }
            Location::Thread(parent) => {
                let replies = self.threads.get_mut(&parent)?;
                let index = replies.iter().position(|m| &m.id == id)?;
                let removed = replies.remove(index);
                if replies.is_empty() {
                    self.threads.remove(&parent);
                }
                Some(removed)
            }
        };
        if let Some(replies) = self.threads.remove(id) {
            for reply in replies {
                self.locations.remove(&reply.id);
                self.reaction_identities.remove(&reply.id);
            }
        }
        removed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReactionOp {
    Add,
    Replace,
    Remove,
}

fn find_message_mut<'a>(
    messages: &'a mut [Message],
    threads: &'a mut HashMap<MessageId, Vec<Message>>,
    locations: &HashMap<MessageId, Location>,
    id: &MessageId,
) -> Option<&'a mut Message> {
    match locations.get(id)? {
        Location::Main => messages.iter_mut().find(|m| &m.id == id),
        Location::Thread(parent) => threads.get_mut(parent)?.iter_mut().find(|m| &m.id == id),
    }
}

fn identity(reaction: &Reaction) -> Option<ReactionIdentity> {
    reaction
        .author()
        .map(|author| (author.clone(), reaction.kind.clone()))
}

fn identities_of(message: &Message) -> HashSet<ReactionIdentity> {
    message
        .latest_reactions
        .iter()
        .chain(message.own_reactions.iter())
        .filter_map(identity)
        .collect()
}

fn strip_reaction(mut reaction: Reaction) -> Reaction {
    if let Some(user) = reaction.user.take() {
        reaction.user_id = reaction.user_id.or(Some(user.id));
    }
    reaction
}

fn absorb_users(message: &mut Message, client: &mut ClientState, cid: &Cid) {
    if let Some(user) = message.user.take() {
        client.update_user_reference(&user, cid);
        message.user = Some(User::new(user.id));
    }
    for reaction in message
        .latest_reactions
        .iter_mut()
        .chain(message.own_reactions.iter_mut())
    {
        if let Some(user) = &reaction.user {
            client.update_user_reference(user, cid);
        }
        *reaction = strip_reaction(reaction.clone());
    }
}

fn decrement(counts: &mut BTreeMap<String, u32>, kind: &str, by: u32) {
    if let Some(count) = counts.get_mut(kind) {
        *count = count.saturating_sub(by);
        if *count == 0 {
            counts.remove(kind);
        }
    }
}

fn remove_counted(
    message: &mut Message,
    identities: &mut HashSet<ReactionIdentity>,
    matches: impl Fn(&Reaction) -> bool,
) {
    let removed: Vec<Reaction> = message
        .latest_reactions
        .iter()
        .chain(message.own_reactions.iter())
        .filter(|r| matches(r))
        .cloned()
        .collect();
    let mut seen = HashSet::new();
    for reaction in removed {
        let Some(key) = identity(&reaction) else {
            continue;
        };
        if !seen.insert(key.clone()) {
            continue;
        }
        if identities.remove(&key) {
            decrement(&mut message.reaction_counts, &reaction.kind, 1);
            decrement(&mut message.reaction_scores, &reaction.kind, reaction.score);
        }
    }
    message.latest_reactions.retain(|r| !matches(r));
}

fn apply_local_reaction(
    message: &mut Message,
    identities: &mut HashSet<ReactionIdentity>,
    reaction: &Reaction,
    op: ReactionOp,
    limit: usize,
) {
    let Some(key) = identity(reaction) else {
        return;
    };
    match op {
        ReactionOp::Remove => {
            remove_counted(message, identities, |r| r.same_identity(reaction));
            if identities.remove(&key) {
                decrement(&mut message.reaction_counts, &reaction.kind, 1);
                decrement(&mut message.reaction_scores, &reaction.kind, reaction.score);
            }
        }
        ReactionOp::Add | ReactionOp::Replace => {
            if op == ReactionOp::Replace {
                let author = key.0.clone();
                remove_counted(message, identities, |r| {
                    r.author() == Some(&author) && r.kind != reaction.kind
                });
            }
            if identities.insert(key) {
                *message
                    .reaction_counts
                    .entry(reaction.kind.clone())
                    .or_insert(0) += 1;
                *message
                    .reaction_scores
                    .entry(reaction.kind.clone())
                    .or_insert(0) += reaction.score;
            }
            message.latest_reactions.retain(|r| !r.same_identity(reaction));
            message.latest_reactions.push(reaction.clone());
            let overflow = message.latest_reactions.len().saturating_sub(limit);
            message.latest_reactions.drain(..overflow);
        }
    }
}

fn apply_own_reaction(message: &mut Message, reaction: &Reaction, own: bool, op: ReactionOp) {
    if !own {
        return;
    }
    match op {
        ReactionOp::Remove => message.own_reactions.retain(|r| !r.same_identity(reaction)),
        ReactionOp::Add => {
            message.own_reactions.retain(|r| !r.same_identity(reaction));
            message.own_reactions.push(reaction.clone());
        }
        ReactionOp::Replace => {
            message.own_reactions.clear();
            message.own_reactions.push(reaction.clone());
        }
    }
}

#[cfg(test)]
#[path = "tests/channel_state_tests.rs"]
mod tests;
