use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use chrono::Utc;
use shared::domain::{MessageId, UserId};
use shared::protocol::{ChatSummary, ClientRequest, MessagePayload, Target};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::connection::ConnectionManager;
use crate::conversation::{
    ConversationKey, ConversationStore, EchoId, Message, Reconciliation,
};
use crate::ClientEvent;

/// Turns user send-actions into optimistic entries plus wire frames, and
/// folds confirmed server events back into the store without duplicating.
pub struct MessageReconciler {
    self_id: UserId,
    history_page_size: u32,
    typing_ttl: Duration,
    store: Mutex<ConversationStore>,
    connection: Arc<ConnectionManager>,
    events: broadcast::Sender<ClientEvent>,
}

impl MessageReconciler {
    pub fn new(
        self_id: UserId,
        history_page_size: u32,
        typing_ttl: Duration,
        store: ConversationStore,
        connection: Arc<ConnectionManager>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            self_id,
            history_page_size,
            typing_ttl,
            store: Mutex::new(store),
            connection,
            events,
        }
    }

    /// Optimistic send: the local echo lands in the store before the frame
    /// goes out, and a failed emit leaves the echo pending rather than
    /// erroring. A later history refetch settles it either way.
    pub async fn send_message(
        &self,
        key: ConversationKey,
        content: &str,
    ) -> anyhow::Result<EchoId> {
        let content = content.trim();
        if content.is_empty() {
            bail!("message content is empty");
        }

        let now = Utc::now();
        let message = {
            let mut store = self.store.lock().await;
            store.append_optimistic(key, content.to_string(), now)
        };
        let local_id = message.local_id;
        let _ = self.events.send(ClientEvent::MessageUpserted { key, message });

        let frame = match key {
            ConversationKey::Room(room_id) => ClientRequest::SendRoomMessage {
                room_id,
                sender_id: self.self_id,
                content: content.to_string(),
                sent_at: now,
            },
            ConversationKey::Private(to) => ClientRequest::SendPrivateMessage {
                to,
                sender_id: self.self_id,
                content: content.to_string(),
                sent_at: now,
            },
        };
        if let Err(error) = self.connection.send(frame).await {
            warn!("send: emit failed, echo stays pending until resync: {error}");
        }
        Ok(local_id)
    }

    pub async fn on_confirmed(&self, key: ConversationKey, payload: MessagePayload) {
        let (outcome, stored, active) = {
            let mut store = self.store.lock().await;
            let (outcome, stored) = store.upsert_confirmed(key, &payload);
            (outcome, stored, store.is_active(key))
        };

        if outcome == Reconciliation::Duplicate {
            return;
        }
        if let Some(message) = stored {
            let _ = self.events.send(ClientEvent::MessageUpserted { key, message });
        }
        if matches!(key, ConversationKey::Private(_)) {
            let _ = self.events.send(ClientEvent::ChatListChanged);
        }

        // Focused conversations stay read; acknowledge instead of counting.
        if active && payload.sender_id != self.self_id {
            let frame = ClientRequest::MarkAsRead {
                target: target_of(key),
            };
            if let Err(error) = self.connection.send(frame).await {
                debug!("read-ack: send failed: {error}");
            }
        }
    }

    pub async fn on_history(&self, key: ConversationKey, messages: &[MessagePayload]) {
        let changed = {
            let mut store = self.store.lock().await;
            store.merge_history(key, messages)
        };
        debug!(changed, "history: merged page");
        let _ = self.events.send(ClientEvent::ConversationLoaded { key });
    }

    /// Focuses a conversation: resets unread (acknowledging to the server),
    /// makes a private chat visible, and pulls history on first focus.
    pub async fn activate(&self, key: ConversationKey) {
        let (outcome, newly_opened) = {
            let mut store = self.store.lock().await;
            let outcome = store.activate(key);
            let newly_opened = match key {
                ConversationKey::Private(with) if !store.is_open(with) => {
                    store.set_visibility(with, true);
                    true
                }
                _ => false,
            };
            (outcome, newly_opened)
        };

        if outcome.cleared_unread {
            let frame = ClientRequest::MarkAsRead {
                target: target_of(key),
            };
            if let Err(error) = self.connection.send(frame).await {
                debug!("read-ack: send failed: {error}");
            }
            let _ = self.events.send(ClientEvent::ChatListChanged);
        }
        if newly_opened {
            if let ConversationKey::Private(with) = key {
                if let Err(error) = self.connection.send(ClientRequest::OpenChat { with }).await {
                    debug!("visibility: open_chat send failed: {error}");
                }
                let _ = self.events.send(ClientEvent::ChatListChanged);
            }
        }
        if outcome.needs_history {
            self.refetch_history(key).await;
        }
    }

    pub async fn release(&self, key: ConversationKey) {
        let mut store = self.store.lock().await;
        store.release(key);
    }

    pub async fn refetch_history(&self, key: ConversationKey) {
        self.request_history(key, None).await;
    }

    /// Pages backwards from the earliest confirmed entry.
    pub async fn fetch_older_history(&self, key: ConversationKey) {
        let before = {
            let store = self.store.lock().await;
            store.oldest_server_id(key)
        };
        self.request_history(key, before).await;
    }

    async fn request_history(&self, key: ConversationKey, before: Option<MessageId>) {
        let frame = match key {
            ConversationKey::Room(room_id) => ClientRequest::GetRoomMessages {
                room_id,
                before,
                limit: self.history_page_size,
            },
            ConversationKey::Private(with) => ClientRequest::GetPrivateMessages {
                with,
                before,
                limit: self.history_page_size,
            },
        };
        if let Err(error) = self.connection.send(frame).await {
            debug!("history: fetch request failed: {error}");
        }
    }

    pub async fn open_chat(&self, with: UserId) {
        let changed = {
            let mut store = self.store.lock().await;
            store.set_visibility(with, true)
        };
        if changed {
            if let Err(error) = self.connection.send(ClientRequest::OpenChat { with }).await {
                debug!("visibility: open_chat send failed: {error}");
            }
            let _ = self.events.send(ClientEvent::ChatListChanged);
        }
    }

    pub async fn close_chat(&self, with: UserId) {
        let changed = {
            let mut store = self.store.lock().await;
            let key = ConversationKey::Private(with);
            if store.is_active(key) {
                store.release(key);
            }
            store.set_visibility(with, false)
        };
        if changed {
            if let Err(error) = self.connection.send(ClientRequest::CloseChat { with }).await {
                debug!("visibility: close_chat send failed: {error}");
            }
            let _ = self.events.send(ClientEvent::ChatListChanged);
        }
    }

    pub async fn mark_chat_read(&self, with: UserId) {
        let changed = {
            let mut store = self.store.lock().await;
            store.clear_unread(ConversationKey::Private(with))
        };
        if let Err(error) = self
            .connection
            .send(ClientRequest::MarkChatAsRead { with })
            .await
        {
            debug!("read-ack: mark_chat_as_read send failed: {error}");
        }
        if changed {
            let _ = self.events.send(ClientEvent::ChatListChanged);
        }
    }

    pub async fn on_visibility_changed(&self, with: UserId, open: bool) {
        let changed = {
            let mut store = self.store.lock().await;
            store.set_visibility(with, open)
        };
        if changed {
            let _ = self.events.send(ClientEvent::ChatListChanged);
        }
    }

    pub async fn on_typing(&self, key: ConversationKey, user_id: UserId) {
        let deadline = Utc::now()
            + chrono::Duration::from_std(self.typing_ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(6));
        let changed = {
            let mut store = self.store.lock().await;
            store.typing_started(key, user_id, deadline)
        };
        if changed {
            self.emit_typing(key).await;
        }
    }

    pub async fn on_stop_typing(&self, key: ConversationKey, user_id: UserId) {
        let changed = {
            let mut store = self.store.lock().await;
            store.typing_stopped(key, user_id)
        };
        if changed {
            self.emit_typing(key).await;
        }
    }

    pub async fn sweep_typing(&self) {
        let changed = {
            let mut store = self.store.lock().await;
            store.sweep_typing(Utc::now())
        };
        for key in changed {
            self.emit_typing(key).await;
        }
    }

    pub async fn send_typing(&self, key: ConversationKey, active: bool) {
        let target = target_of(key);
        let frame = if active {
            ClientRequest::Typing { target }
        } else {
            ClientRequest::StopTyping { target }
        };
        if let Err(error) = self.connection.send(frame).await {
            debug!("typing: send failed: {error}");
        }
    }

    pub async fn seed_chats(&self, chats: &[ChatSummary]) {
        let mut changed = false;
        {
            let mut store = self.store.lock().await;
            for chat in chats {
                changed |= store.set_visibility(chat.with, chat.open);
                store.seed_chat_activity(chat.with, chat.last_message_at);
            }
        }
        if changed {
            let _ = self.events.send(ClientEvent::ChatListChanged);
        }
    }

    pub async fn active_key(&self) -> Option<ConversationKey> {
        self.store.lock().await.active_key()
    }

    pub async fn messages_snapshot(&self, key: ConversationKey) -> Vec<Message> {
        self.store.lock().await.messages(key).to_vec()
    }

    pub async fn unread(&self, key: ConversationKey) -> u32 {
        self.store.lock().await.unread(key)
    }

    pub async fn total_unread(&self) -> u32 {
        self.store.lock().await.total_unread()
    }

    pub async fn private_chats(
        &self,
    ) -> Vec<(UserId, u32, Option<chrono::DateTime<Utc>>, bool)> {
        self.store.lock().await.private_chats()
    }

    async fn emit_typing(&self, key: ConversationKey) {
        let users = {
            let store = self.store.lock().await;
            store.typing_users(key)
        };
        let _ = self.events.send(ClientEvent::TypingChanged { key, users });
    }
}

fn target_of(key: ConversationKey) -> Target {
    match key {
        ConversationKey::Room(room_id) => Target::Room { room_id },
        ConversationKey::Private(user_id) => Target::User { user_id },
    }
}
