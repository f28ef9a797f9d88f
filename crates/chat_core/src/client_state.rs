//! Process-wide index of the last known record for every observed user.
//!
//! Channel states refer to users by id only and resolve them here, so a
//! presence change is visible from every channel without per-channel copies.

use std::collections::{HashMap, HashSet};

use chat_shared::{
    domain::{Cid, UserId},
    protocol::User,
};
use chrono::{DateTime, Utc};

use crate::store::Applied;

#[derive(Debug, Default)]
pub struct ClientState {
    users: HashMap<UserId, User>,
    user_channel_references: HashMap<UserId, HashSet<Cid>>,
    me: Option<UserId>,
    total_unread_count: u32,
    unread_channels: u32,
}

impl ClientState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(&self, user_id: &UserId) -> Option<&User> {
        self.users.get(user_id)
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn me(&self) -> Option<&User> {
        self.me.as_ref().and_then(|id| self.users.get(id))
    }

    pub fn me_id(&self) -> Option<&UserId> {
        self.me.as_ref()
    }

    pub fn is_me(&self, user_id: &UserId) -> bool {
        self.me.as_ref() == Some(user_id)
    }

    pub fn total_unread_count(&self) -> u32 {
        self.total_unread_count
    }

    pub fn unread_channels(&self) -> u32 {
        self.unread_channels
    }

    pub fn set_me(&mut self, user: &User) -> Applied {
        let changed = self.me.as_ref() != Some(&user.id);
        self.me = Some(user.id.clone());
        if let Some(total) = unread_counter(user, "total_unread_count") {
            self.total_unread_count = total;
        }
        if let Some(channels) = unread_counter(user, "unread_channels") {
            self.unread_channels = channels;
        }
        self.update_user(user).or(changed)
    }

    pub fn set_unread_counts(&mut self, total: Option<u32>, channels: Option<u32>) -> Applied {
        let mut changed = false;
        if let Some(total) = total {
            changed |= self.total_unread_count != total;
            self.total_unread_count = total;
        }
        if let Some(channels) = channels {
            changed |= self.unread_channels != channels;
            self.unread_channels = channels;
        }
        Applied::from_changed(changed)
    }

    /// Merges `user` into the shared record. A snapshot older than the stored
    /// one (by `updated_at`) is ignored.
    pub fn update_user(&mut self, user: &User) -> Applied {
        let Some(existing) = self.users.get_mut(&user.id) else {
            self.users.insert(user.id.clone(), user.clone());
            return Applied::Changed;
        };

        if is_older(user.updated_at, existing.updated_at) {
            return Applied::Unchanged;
        }

        let merged = merge_user(existing, user);
        if merged == *existing {
            return Applied::Unchanged;
        }
        *existing = merged;
        Applied::Changed
    }

    /// Presence frames carry a partial user; only the presence fields move.
    pub fn update_presence(
        &mut self,
        user: &User,
        online: Option<bool>,
        at: DateTime<Utc>,
    ) -> Applied {
        let online = online.unwrap_or(user.online);
        let Some(existing) = self.users.get_mut(&user.id) else {
            let mut fresh = user.clone();
            fresh.online = online;
            fresh.last_active = user.last_active.or(Some(at));
            self.users.insert(user.id.clone(), fresh);
            return Applied::Changed;
        };
        let last_active = user.last_active.or(Some(at)).max(existing.last_active);
        if existing.online == online && existing.last_active == last_active {
            return Applied::Unchanged;
        }
        existing.online = online;
        existing.last_active = last_active;
        Applied::Changed
    }

    /// Records that `cid` currently cares about `user`, merging the snapshot.
    pub fn update_user_reference(&mut self, user: &User, cid: &Cid) -> Applied {
        let applied = self.update_user(user);
        let inserted = self
            .user_channel_references
            .entry(user.id.clone())
            .or_default()
            .insert(cid.clone());
        applied.or(inserted)
    }

    pub fn channels_referencing(&self, user_id: &UserId) -> impl Iterator<Item = &Cid> {
        self.user_channel_references
            .get(user_id)
            .into_iter()
            .flat_map(|cids| cids.iter())
    }

    /// Forgets every reference held by `cid` and prunes users no other
    /// channel references. The local user is never pruned.
    pub fn drop_channel_references(&mut self, cid: &Cid) -> Vec<UserId> {
        let mut orphaned = Vec::new();
        self.user_channel_references.retain(|user_id, cids| {
            cids.remove(cid);
            if cids.is_empty() {
                orphaned.push(user_id.clone());
                false
            } else {
                true
            }
        });
        orphaned.retain(|user_id| self.me.as_ref() != Some(user_id));
        for user_id in &orphaned {
            self.users.remove(user_id);
        }
        orphaned.sort();
        orphaned
    }

    pub fn clear(&mut self) {
        self.users.clear();
        self.user_channel_references.clear();
        self.me = None;
        self.total_unread_count = 0;
        self.unread_channels = 0;
    }
}

/// Counters that do not fit a `u32` are ignored rather than wrapped.
fn unread_counter(user: &User, key: &str) -> Option<u32> {
    let raw = user.extra.get(key)?.as_u64()?;
    u32::try_from(raw).ok()
}

fn is_older(incoming: Option<DateTime<Utc>>, stored: Option<DateTime<Utc>>) -> bool {
    matches!((incoming, stored), (Some(incoming), Some(stored)) if incoming < stored)
}

fn merge_user(existing: &User, incoming: &User) -> User {
    let mut merged = incoming.clone();
    merged.name = incoming.name.clone().or_else(|| existing.name.clone());
    merged.image = incoming.image.clone().or_else(|| existing.image.clone());
    merged.role = incoming.role.clone().or_else(|| existing.role.clone());
    merged.last_active = incoming.last_active.max(existing.last_active);
    merged.updated_at = incoming.updated_at.or(existing.updated_at);
    let mut extra = existing.extra.clone();
    extra.extend(incoming.extra.clone());
    merged.extra = extra;
    merged
}

#[cfg(test)]
#[path = "tests/client_state_tests.rs"]
mod tests;
