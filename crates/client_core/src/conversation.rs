use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration as TimeDelta, Utc};
use shared::domain::{MessageId, RoomId, UserId};
use shared::protocol::MessagePayload;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationKey {
    Room(RoomId),
    Private(UserId),
}

/// Client-generated identity a message keeps for its whole local lifetime,
/// before and after server confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EchoId(pub Uuid);

impl EchoId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOrigin {
    Optimistic,
    Confirmed,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub local_id: EchoId,
    pub server_id: Option<MessageId>,
    pub sender_id: UserId,
    pub sender_username: Option<String>,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub origin: MessageOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Confirmed a pending local echo in place.
    ReplacedOptimistic { local_id: EchoId },
    /// New entry inserted at its timestamp position.
    Inserted,
    /// Server id already seen; event dropped.
    Duplicate,
}

#[derive(Debug, Clone, Copy)]
pub struct ActivationOutcome {
    pub needs_history: bool,
    pub cleared_unread: bool,
}

#[derive(Debug, Default)]
struct Conversation {
    messages: Vec<Message>,
    seen_server_ids: HashSet<MessageId>,
    unread: u32,
    open: bool,
    typing: HashMap<UserId, DateTime<Utc>>,
    history_loaded: bool,
    last_message_at: Option<DateTime<Utc>>,
}

/// Per-conversation message sequences, unread counters, typing sets and
/// private-chat visibility. Purely in-memory; the owner serializes access.
pub struct ConversationStore {
    self_id: UserId,
    match_window: TimeDelta,
    conversations: HashMap<ConversationKey, Conversation>,
    active: Option<ConversationKey>,
}

impl ConversationStore {
    pub fn new(self_id: UserId, match_window: std::time::Duration) -> Self {
        let match_window =
            TimeDelta::from_std(match_window).unwrap_or_else(|_| TimeDelta::seconds(5));
        Self {
            self_id,
            match_window,
            conversations: HashMap::new(),
            active: None,
        }
    }

    pub fn active_key(&self) -> Option<ConversationKey> {
        self.active
    }

    pub fn is_active(&self, key: ConversationKey) -> bool {
        self.active == Some(key)
    }

    /// Brings a conversation into focus. Unread resets here; live messages
    /// arriving while it stays focused never count as unread.
    pub fn activate(&mut self, key: ConversationKey) -> ActivationOutcome {
        self.active = Some(key);
        let convo = self.conversations.entry(key).or_default();
        let cleared_unread = convo.unread > 0;
        convo.unread = 0;
        ActivationOutcome {
            needs_history: !convo.history_loaded,
            cleared_unread,
        }
    }

    /// Frees message memory when the UI navigates away. Unread and
    /// visibility survive; history is refetched on the next activation.
    pub fn release(&mut self, key: ConversationKey) {
        if self.active == Some(key) {
            self.active = None;
        }
        if let Some(convo) = self.conversations.get_mut(&key) {
            convo.messages.clear();
            convo.seen_server_ids.clear();
            convo.typing.clear();
            convo.history_loaded = false;
        }
    }

    pub fn append_optimistic(
        &mut self,
        key: ConversationKey,
        content: String,
        now: DateTime<Utc>,
    ) -> Message {
        let message = Message {
            local_id: EchoId::generate(),
            server_id: None,
            sender_id: self.self_id,
            sender_username: None,
            content,
            sent_at: now,
            origin: MessageOrigin::Optimistic,
        };
        let convo = self.conversations.entry(key).or_default();
        convo.messages.push(message.clone());
        convo.last_message_at = max_time(convo.last_message_at, now);
        message
    }

    /// Reconciles one confirmed message: server-id idempotence first, then
    /// the pending-echo heuristic, otherwise a timestamp-ordered insert.
    /// Returns the outcome and a copy of the stored entry.
    pub fn upsert_confirmed(
        &mut self,
        key: ConversationKey,
        payload: &MessagePayload,
    ) -> (Reconciliation, Option<Message>) {
        self.reconcile_one(key, payload, true)
    }

    /// Merges a history page. Idempotent; does not touch unread counters.
    /// Returns the number of entries that changed the conversation.
    pub fn merge_history(&mut self, key: ConversationKey, messages: &[MessagePayload]) -> usize {
        let mut changed = 0;
        for payload in messages {
            let (outcome, _) = self.reconcile_one(key, payload, false);
            if outcome != Reconciliation::Duplicate {
                changed += 1;
            }
        }
        let convo = self.conversations.entry(key).or_default();
        convo.history_loaded = true;
        changed
    }

    fn reconcile_one(
        &mut self,
        key: ConversationKey,
        payload: &MessagePayload,
        count_unread: bool,
    ) -> (Reconciliation, Option<Message>) {
        let self_id = self.self_id;
        let window = self.match_window;
        let active = self.active == Some(key);
        let convo = self.conversations.entry(key).or_default();

        if !convo.seen_server_ids.insert(payload.message_id) {
            debug!(message_id = payload.message_id.0, "store: dropping duplicate message");
            return (Reconciliation::Duplicate, None);
        }
        convo.last_message_at = max_time(convo.last_message_at, payload.sent_at);

        if payload.sender_id == self_id {
            let pending = convo.messages.iter_mut().find(|m| {
                m.server_id.is_none()
                    && m.origin == MessageOrigin::Optimistic
                    && m.content == payload.content
                    && (payload.sent_at - m.sent_at).abs() <= window
            });
            if let Some(existing) = pending {
                existing.server_id = Some(payload.message_id);
                existing.sent_at = payload.sent_at;
                existing.origin = MessageOrigin::Confirmed;
                if existing.sender_username.is_none() {
                    existing.sender_username = payload.sender_username.clone();
                }
                let local_id = existing.local_id;
                let snapshot = existing.clone();
                return (
                    Reconciliation::ReplacedOptimistic { local_id },
                    Some(snapshot),
                );
            }
        }

        let message = Message {
            local_id: EchoId::generate(),
            server_id: Some(payload.message_id),
            sender_id: payload.sender_id,
            sender_username: payload.sender_username.clone(),
            content: payload.content.clone(),
            sent_at: payload.sent_at,
            origin: MessageOrigin::Confirmed,
        };

        // Walk back from the tail; already-stored entries never reorder.
        let mut index = convo.messages.len();
        while index > 0 && convo.messages[index - 1].sent_at > message.sent_at {
            index -= 1;
        }
        convo.messages.insert(index, message.clone());

        if count_unread && payload.sender_id != self_id && !active {
            convo.unread += 1;
        }

        (Reconciliation::Inserted, Some(message))
    }

    pub fn typing_started(
        &mut self,
        key: ConversationKey,
        user_id: UserId,
        deadline: DateTime<Utc>,
    ) -> bool {
        if user_id == self.self_id {
            return false;
        }
        let convo = self.conversations.entry(key).or_default();
        convo.typing.insert(user_id, deadline).is_none()
    }

    pub fn typing_stopped(&mut self, key: ConversationKey, user_id: UserId) -> bool {
        match self.conversations.get_mut(&key) {
            Some(convo) => convo.typing.remove(&user_id).is_some(),
            None => false,
        }
    }

    /// Drops expired typing entries; returns the keys whose set changed.
    pub fn sweep_typing(&mut self, now: DateTime<Utc>) -> Vec<ConversationKey> {
        let mut changed = Vec::new();
        for (key, convo) in &mut self.conversations {
            let before = convo.typing.len();
            convo.typing.retain(|_, deadline| *deadline > now);
            if convo.typing.len() != before {
                changed.push(*key);
            }
        }
        changed
    }

    pub fn typing_users(&self, key: ConversationKey) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .conversations
            .get(&key)
            .map(|c| c.typing.keys().copied().collect())
            .unwrap_or_default();
        users.sort();
        users
    }

    /// Flips private-chat visibility. Closing hides the chat from lists but
    /// keeps its history.
    pub fn set_visibility(&mut self, with: UserId, open: bool) -> bool {
        let convo = self
            .conversations
            .entry(ConversationKey::Private(with))
            .or_default();
        let changed = convo.open != open;
        convo.open = open;
        changed
    }

    /// Seeds list ordering data from the chat-summary bootstrap without
    /// touching messages or unread state.
    pub fn seed_chat_activity(&mut self, with: UserId, last_message_at: Option<DateTime<Utc>>) {
        let convo = self
            .conversations
            .entry(ConversationKey::Private(with))
            .or_default();
        if let Some(at) = last_message_at {
            convo.last_message_at = max_time(convo.last_message_at, at);
        }
    }

    pub fn is_open(&self, with: UserId) -> bool {
        self.conversations
            .get(&ConversationKey::Private(with))
            .map(|c| c.open)
            .unwrap_or(false)
    }

    pub fn clear_unread(&mut self, key: ConversationKey) -> bool {
        match self.conversations.get_mut(&key) {
            Some(convo) if convo.unread > 0 => {
                convo.unread = 0;
                true
            }
            _ => false,
        }
    }

    pub fn messages(&self, key: ConversationKey) -> &[Message] {
        self.conversations
            .get(&key)
            .map(|c| c.messages.as_slice())
            .unwrap_or(&[])
    }

    pub fn unread(&self, key: ConversationKey) -> u32 {
        self.conversations.get(&key).map(|c| c.unread).unwrap_or(0)
    }

    pub fn total_unread(&self) -> u32 {
        self.conversations.values().map(|c| c.unread).sum()
    }

    pub fn last_message_at(&self, key: ConversationKey) -> Option<DateTime<Utc>> {
        self.conversations.get(&key).and_then(|c| c.last_message_at)
    }

    /// Paging cursor for older history: the earliest confirmed entry.
    pub fn oldest_server_id(&self, key: ConversationKey) -> Option<MessageId> {
        self.conversations
            .get(&key)
            .and_then(|c| c.messages.iter().find_map(|m| m.server_id))
    }

    /// Private chats as (peer, unread, last message time, visibility) rows
    /// for the chat-list assembly.
    pub fn private_chats(&self) -> Vec<(UserId, u32, Option<DateTime<Utc>>, bool)> {
        self.conversations
            .iter()
            .filter_map(|(key, convo)| match key {
                ConversationKey::Private(with) => {
                    Some((*with, convo.unread, convo.last_message_at, convo.open))
                }
                ConversationKey::Room(_) => None,
            })
            .collect()
    }
}

fn max_time(current: Option<DateTime<Utc>>, candidate: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match current {
        Some(existing) if existing >= candidate => Some(existing),
        _ => Some(candidate),
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod conversation_tests;
