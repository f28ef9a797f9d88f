use std::collections::HashMap;

use chat_shared::{
    domain::{Cid, UserId},
    protocol::{ChannelSnapshot, Event, EventType},
};
use chrono::{DateTime, Utc};
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::{channel_state::ChannelState, client_state::ClientState};

/// Outcome of applying an event to local state.
///
/// `Ignored` covers events that reference something this client does not
/// hold (an unwatched channel, a message never fetched); these are absorbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    Unchanged,
    Ignored,
}

impl Applied {
    pub fn from_changed(changed: bool) -> Self {
        if changed {
            Self::Changed
        } else {
            Self::Unchanged
        }
    }

    pub fn is_changed(self) -> bool {
        self == Self::Changed
    }

    pub fn or(self, changed: bool) -> Self {
        if changed {
            Self::Changed
        } else {
            self
        }
    }

    pub fn merge(self, other: Applied) -> Self {
        match (self, other) {
            (Self::Changed, _) | (_, Self::Changed) => Self::Changed,
            (Self::Unchanged, _) | (_, Self::Unchanged) => Self::Unchanged,
            _ => Self::Ignored,
        }
    }
}

/// Owned container for everything the client caches: the shared user index,
/// one state per watched channel, and the sync cursor.
#[derive(Debug)]
pub struct ChatStore {
    client: ClientState,
    channels: HashMap<Cid, ChannelState>,
    sync_cursor: Option<DateTime<Utc>>,
    latest_reactions_limit: usize,
}

impl ChatStore {
    pub fn new(latest_reactions_limit: usize) -> Self {
        Self {
            client: ClientState::new(),
            channels: HashMap::new(),
            sync_cursor: None,
            latest_reactions_limit: latest_reactions_limit.max(1),
        }
    }

    pub fn client(&self) -> &ClientState {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut ClientState {
        &mut self.client
    }

    pub fn channel(&self, cid: &Cid) -> Option<&ChannelState> {
        self.channels.get(cid)
    }

    pub fn channel_mut(&mut self, cid: &Cid) -> Option<&mut ChannelState> {
        self.channels.get_mut(cid)
    }

    pub fn is_watching(&self, cid: &Cid) -> bool {
        self.channels.contains_key(cid)
    }

    pub fn watched_cids(&self) -> Vec<Cid> {
        let mut cids: Vec<Cid> = self.channels.keys().cloned().collect();
        cids.sort();
        cids
    }

    /// Creates the channel state on first watch, or replaces it with the
    /// fresh server snapshot.
    pub fn watch(&mut self, snapshot: ChannelSnapshot) -> &ChannelState {
        let cid = snapshot.channel.cid.clone();
        let limit = self.latest_reactions_limit;
        let channel = self
            .channels
            .entry(cid.clone())
            .or_insert_with(|| ChannelState::new(cid, limit));
        channel.hydrate(snapshot, &mut self.client);
        channel
    }

    /// Destroys the channel state and releases its user references.
    pub fn unwatch(&mut self, cid: &Cid) -> bool {
        if self.channels.remove(cid).is_none() {
            return false;
        }
        let pruned = self.client.drop_channel_references(cid);
        debug!(%cid, pruned = pruned.len(), "state: channel unwatched");
        true
    }

    pub fn sync_cursor(&self) -> Option<DateTime<Utc>> {
        self.sync_cursor
    }

    /// Keeps the earliest unsynced point when several gaps pile up before a
    /// recovery completes.
    pub fn record_sync_cursor(&mut self, at: DateTime<Utc>) {
        self.sync_cursor = Some(match self.sync_cursor {
            Some(existing) => existing.min(at),
            None => at,
        });
    }

    pub fn clear_sync_cursor(&mut self) {
        self.sync_cursor = None;
    }

    /// The single application routine for live and replayed events.
    pub fn apply(&mut self, event: &Event, now: Instant) -> Applied {
        let mut outcome = match event.kind {
            EventType::HealthCheck => match &event.me {
                Some(me) => self.client.set_me(me),
                None => Applied::Unchanged,
            },
            EventType::UserPresenceChanged => match &event.user {
                Some(user) => self
                    .client
                    .update_presence(user, event.online, event.created_at),
                None => Applied::Ignored,
            },
            EventType::UserUpdated => match &event.user {
                Some(user) => self.client.update_user(user),
                None => Applied::Ignored,
            },
            EventType::NotificationMarkRead | EventType::NotificationMessageNew => self
                .client
                .set_unread_counts(event.total_unread_count, event.unread_channels),
            _ => Applied::Ignored,
        };

        if let Some(cid) = event.target_cid() {
            match self.channels.get_mut(cid) {
                Some(channel) => {
                    outcome = outcome.merge(channel.apply(event, &mut self.client, now));
                }
                None => {
                    debug!(%cid, event_type = %event.kind, "state: event for unwatched channel");
                }
            }
        }
        outcome
    }

    /// Removes typing indicators older than `timeout` across all channels.
    pub fn sweep_typing(&mut self, now: Instant, timeout: Duration) -> Vec<(Cid, UserId)> {
        let mut expired = Vec::new();
        for (cid, channel) in self.channels.iter_mut() {
            for user_id in channel.sweep_typing(now, timeout) {
                expired.push((cid.clone(), user_id));
            }
        }
        expired.sort();
        expired
    }

    pub fn clear(&mut self) {
        self.channels.clear();
        self.client.clear();
        self.sync_cursor = None;
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
