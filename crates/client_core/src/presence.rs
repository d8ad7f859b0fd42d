use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::domain::{PresenceStatus, UserId};
use shared::protocol::UserSummary;

#[derive(Debug, Clone)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub username: Option<String>,
    pub status: PresenceStatus,
    pub last_active_at: Option<DateTime<Utc>>,
}

/// Last-writer-wins presence map, seeded from the directory bootstrap and
/// mutated only by inbound presence events.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    records: HashMap<UserId, PresenceRecord>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&mut self, users: &[UserSummary]) {
        for user in users {
            let record = self
                .records
                .entry(user.user_id)
                .or_insert_with(|| PresenceRecord {
                    user_id: user.user_id,
                    username: None,
                    status: PresenceStatus::Offline,
                    last_active_at: None,
                });
            record.username = Some(user.username.clone());
            record.status = user.status;
            if user.last_active_at.is_some() {
                record.last_active_at = user.last_active_at;
            }
        }
    }

    /// Applies one presence event. The most recent event wins outright.
    pub fn apply(
        &mut self,
        user_id: UserId,
        status: PresenceStatus,
        last_active_at: Option<DateTime<Utc>>,
    ) -> bool {
        let record = self.records.entry(user_id).or_insert_with(|| PresenceRecord {
            user_id,
            username: None,
            status: PresenceStatus::Offline,
            last_active_at: None,
        });
        let changed = record.status != status;
        record.status = status;
        if last_active_at.is_some() {
            record.last_active_at = last_active_at;
        }
        changed
    }

    /// Learns a username observed on a message payload. Returns true when
    /// the directory changed.
    pub fn note_username(&mut self, user_id: UserId, username: &str) -> bool {
        let record = self.records.entry(user_id).or_insert_with(|| PresenceRecord {
            user_id,
            username: None,
            status: PresenceStatus::Offline,
            last_active_at: None,
        });
        if record.username.as_deref() == Some(username) {
            return false;
        }
        record.username = Some(username.to_string());
        true
    }

    pub fn status_of(&self, user_id: UserId) -> PresenceStatus {
        self.records
            .get(&user_id)
            .map(|r| r.status)
            .unwrap_or(PresenceStatus::Offline)
    }

    pub fn record(&self, user_id: UserId) -> Option<&PresenceRecord> {
        self.records.get(&user_id)
    }
}

/// One row of the UI-facing private-chat list.
#[derive(Debug, Clone)]
pub struct ChatListEntry {
    pub with: UserId,
    pub username: Option<String>,
    pub status: PresenceStatus,
    pub unread: u32,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Sort contract: chats with unread messages first, then online peers
/// before offline ones, then most recent activity, with the peer id as the
/// deterministic tie-break.
pub fn chat_list_order(a: &ChatListEntry, b: &ChatListEntry) -> Ordering {
    (b.unread > 0)
        .cmp(&(a.unread > 0))
        .then_with(|| {
            (b.status == PresenceStatus::Online).cmp(&(a.status == PresenceStatus::Online))
        })
        .then_with(|| b.last_activity.cmp(&a.last_activity))
        .then_with(|| a.with.0.cmp(&b.with.0))
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod presence_tests;
