use std::collections::HashSet;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use media_engine::{
    IceServer, LocalMediaHandle, MediaConstraints, MediaEngine, PeerConnection, TrackKind,
};
use shared::domain::{CallType, PresenceStatus, RoomId, UserId};
use shared::protocol::{ClientRequest, MessagePayload, RoomSummary, ServerEvent, Target};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod bootstrap;
pub mod call;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod presence;
pub mod reconcile;
mod scheduler;
pub mod transport;

pub use call::{CallError, CallLogRecord, CallOutcome, CallPhase, CallRole, CallSnapshot};
pub use config::{load_settings, SyncSettings};
pub use connection::{ConnectionError, ConnectionState, TerminationKind};
pub use conversation::{ConversationKey, EchoId, Message, MessageOrigin};
pub use presence::ChatListEntry;

use crate::bootstrap::{DirectoryApi, MissingDirectoryApi};
use crate::call::CallCoordinator;
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::conversation::ConversationStore;
use crate::presence::{chat_list_order, PresenceTracker};
use crate::reconcile::MessageReconciler;
use crate::scheduler::TimerHandle;
use crate::transport::EventChannelConnector;

/// Identity of the signed-in user. Passed by value to every subsystem that
/// needs it; nothing reads identity from globals.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: UserId,
    pub username: String,
    pub auth_token: Option<String>,
}

/// Everything the UI layer needs to react to, in the order it happened.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectionChanged(ConnectionState),
    SessionResumed {
        session_id: String,
    },
    AuthRejected {
        message: String,
    },
    SessionTerminated {
        kind: TerminationKind,
        reason: Option<String>,
    },
    MessageUpserted {
        key: ConversationKey,
        message: Message,
    },
    ConversationLoaded {
        key: ConversationKey,
    },
    TypingChanged {
        key: ConversationKey,
        users: Vec<UserId>,
    },
    PresenceChanged {
        user_id: UserId,
        status: PresenceStatus,
    },
    ChatListChanged,
    RoomsUpdated(Vec<RoomSummary>),
    IncomingCall {
        from: UserId,
        username: String,
        call_type: CallType,
    },
    CallPhaseChanged {
        peer: UserId,
        phase: CallPhase,
    },
    CallRemoteTrack {
        peer: UserId,
        track_id: String,
        kind: TrackKind,
    },
    CallFault {
        peer: UserId,
        message: String,
    },
    CallLog(CallLogRecord),
    Error(String),
}

struct MissingMediaEngine;

#[async_trait]
impl MediaEngine for MissingMediaEngine {
    async fn get_local_media(
        &self,
        _constraints: MediaConstraints,
    ) -> anyhow::Result<Arc<dyn LocalMediaHandle>> {
        Err(anyhow!("media engine not configured"))
    }

    async fn create_peer_connection(
        &self,
        _ice_servers: &[IceServer],
    ) -> anyhow::Result<Arc<dyn PeerConnection>> {
        Err(anyhow!("media engine not configured"))
    }
}

struct ClientState {
    started: bool,
    session_id: Option<String>,
    joined_rooms: HashSet<RoomId>,
    rooms: Vec<RoomSummary>,
    dispatch_task: Option<JoinHandle<()>>,
    status_task: Option<JoinHandle<()>>,
    typing_sweeper: Option<TimerHandle>,
}

/// Client-side synchronization core: one websocket session, the local
/// conversation state it feeds, presence, and at most one call. UIs drive
/// it through the async methods and render from [`ClientEvent`]s.
pub struct SyncClient {
    session: Session,
    settings: Arc<SyncSettings>,
    connection: Arc<ConnectionManager>,
    reconciler: Arc<MessageReconciler>,
    presence: Mutex<PresenceTracker>,
    calls: Arc<CallCoordinator>,
    directory: Arc<dyn DirectoryApi>,
    inner: Mutex<ClientState>,
    events: broadcast::Sender<ClientEvent>,
}

impl SyncClient {
    /// Client with no media engine or directory API. Messaging and presence
    /// work; calls and bootstrap fetches fail with a clear error.
    pub fn new(session: Session, connector: Arc<dyn EventChannelConnector>) -> Arc<Self> {
        Self::new_with_dependencies(
            session,
            Arc::new(load_settings()),
            connector,
            Arc::new(MissingMediaEngine),
            Arc::new(MissingDirectoryApi),
        )
    }

    /// Client with directory bootstrap but no media engine, for frontends
    /// that do messaging and presence only.
    pub fn new_with_directory(
        session: Session,
        settings: Arc<SyncSettings>,
        connector: Arc<dyn EventChannelConnector>,
        directory: Arc<dyn DirectoryApi>,
    ) -> Arc<Self> {
        Self::new_with_dependencies(
            session,
            settings,
            connector,
            Arc::new(MissingMediaEngine),
            directory,
        )
    }

    pub fn new_with_dependencies(
        session: Session,
        settings: Arc<SyncSettings>,
        connector: Arc<dyn EventChannelConnector>,
        media: Arc<dyn MediaEngine>,
        directory: Arc<dyn DirectoryApi>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let connection = ConnectionManager::new(session.clone(), Arc::clone(&settings), connector);
        let store = ConversationStore::new(session.user_id, settings.match_window);
        let reconciler = Arc::new(MessageReconciler::new(
            session.user_id,
            settings.history_page_size,
            settings.typing_ttl,
            store,
            Arc::clone(&connection),
            events.clone(),
        ));
        let calls = Arc::new(CallCoordinator::new(
            session.clone(),
            Arc::clone(&settings),
            Arc::clone(&connection),
            media,
            events.clone(),
        ));
        Arc::new(Self {
            session,
            settings,
            connection,
            reconciler,
            presence: Mutex::new(PresenceTracker::new()),
            calls,
            directory,
            inner: Mutex::new(ClientState {
                started: false,
                session_id: None,
                joined_rooms: HashSet::new(),
                rooms: Vec::new(),
                dispatch_task: None,
                status_task: None,
                typing_sweeper: None,
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.connection.state().await
    }

    pub async fn session_id(&self) -> Option<String> {
        self.inner.lock().await.session_id.clone()
    }

    /// Spawns the event pumps and starts connecting. Idempotence is on the
    /// caller: a second `start` without a `stop` is an error.
    pub async fn start(self: &Arc<Self>) -> Result<(), ConnectionError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.started {
                return Err(ConnectionError::AlreadyRunning);
            }
            inner.started = true;
            inner.dispatch_task = Some(self.spawn_dispatch());
            inner.status_task = Some(self.spawn_status());
            inner.typing_sweeper = Some(self.spawn_typing_sweeper());
        }
        info!(user_id = self.session.user_id.0, "client: starting");
        self.connection.connect().await
    }

    /// Graceful shutdown: hang up any live call while signaling is still
    /// there, then tear the connection and the pumps down.
    pub async fn stop(&self) {
        match self.calls.hang_up().await {
            Ok(()) | Err(CallError::NoActiveCall) => {}
            Err(error) => debug!("stop: hangup failed: {error}"),
        }
        self.connection.disconnect().await;
        let mut inner = self.inner.lock().await;
        inner.started = false;
        inner.session_id = None;
        if let Some(task) = inner.dispatch_task.take() {
            task.abort();
        }
        if let Some(task) = inner.status_task.take() {
            task.abort();
        }
        inner.typing_sweeper = None;
        info!(user_id = self.session.user_id.0, "client: stopped");
    }

    /// Manual retry after the reconnect policy gave up.
    pub async fn retry(&self) -> Result<(), ConnectionError> {
        self.connection.retry().await
    }

    pub async fn note_user_activity(&self) {
        self.connection.note_user_activity().await;
    }

    // ---- messaging ----

    pub async fn send_message(
        &self,
        key: ConversationKey,
        content: &str,
    ) -> anyhow::Result<EchoId> {
        self.connection.note_user_activity().await;
        self.reconciler.send_message(key, content).await
    }

    pub async fn join_room(&self, room_id: RoomId) -> Result<(), ConnectionError> {
        {
            let mut inner = self.inner.lock().await;
            inner.joined_rooms.insert(room_id);
        }
        self.connection.send(ClientRequest::JoinRoom { room_id }).await
    }

    pub async fn leave_room(&self, room_id: RoomId) -> Result<(), ConnectionError> {
        {
            let mut inner = self.inner.lock().await;
            inner.joined_rooms.remove(&room_id);
        }
        let key = ConversationKey::Room(room_id);
        if self.reconciler.active_key().await == Some(key) {
            self.reconciler.release(key).await;
        }
        self.connection.send(ClientRequest::LeaveRoom { room_id }).await
    }

    /// Brings a conversation into focus: unread resets, a private chat
    /// becomes visible, and history loads on first focus.
    pub async fn activate_conversation(&self, key: ConversationKey) {
        self.connection.note_user_activity().await;
        self.reconciler.activate(key).await;
    }

    pub async fn release_conversation(&self, key: ConversationKey) {
        self.reconciler.release(key).await;
    }

    pub async fn open_chat(&self, with: UserId) {
        self.reconciler.open_chat(with).await;
    }

    pub async fn close_chat(&self, with: UserId) {
        self.reconciler.close_chat(with).await;
    }

    pub async fn mark_chat_read(&self, with: UserId) {
        self.reconciler.mark_chat_read(with).await;
    }

    pub async fn set_typing(&self, key: ConversationKey, active: bool) {
        self.connection.note_user_activity().await;
        self.reconciler.send_typing(key, active).await;
    }

    pub async fn load_older_history(&self, key: ConversationKey) {
        self.reconciler.fetch_older_history(key).await;
    }

    pub async fn messages(&self, key: ConversationKey) -> Vec<Message> {
        self.reconciler.messages_snapshot(key).await
    }

    pub async fn unread(&self, key: ConversationKey) -> u32 {
        self.reconciler.unread(key).await
    }

    pub async fn total_unread(&self) -> u32 {
        self.reconciler.total_unread().await
    }

    pub async fn rooms(&self) -> Vec<RoomSummary> {
        self.inner.lock().await.rooms.clone()
    }

    /// Visible private chats merged with presence, in display order.
    pub async fn chat_list(&self) -> Vec<ChatListEntry> {
        let chats = self.reconciler.private_chats().await;
        let presence = self.presence.lock().await;
        let mut entries: Vec<ChatListEntry> = chats
            .into_iter()
            .filter(|(_, _, _, open)| *open)
            .map(|(with, unread, last_activity, _)| ChatListEntry {
                with,
                username: presence.record(with).and_then(|r| r.username.clone()),
                status: presence.status_of(with),
                unread,
                last_activity,
            })
            .collect();
        entries.sort_by(chat_list_order);
        entries
    }

    pub async fn presence_of(&self, user_id: UserId) -> PresenceStatus {
        self.presence.lock().await.status_of(user_id)
    }

    // ---- calls ----

    pub async fn start_call(&self, peer: UserId, call_type: CallType) -> Result<(), CallError> {
        self.connection.note_user_activity().await;
        self.calls.start_call(peer, call_type).await
    }

    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.calls.accept_call().await
    }

    pub async fn reject_call(&self, reason: Option<String>) -> Result<(), CallError> {
        self.calls.reject_call(reason).await
    }

    pub async fn hang_up(&self) -> Result<(), CallError> {
        self.calls.hang_up().await
    }

    pub async fn active_call(&self) -> Option<CallSnapshot> {
        self.calls.active_call().await
    }

    // ---- event pumps ----

    fn spawn_dispatch(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        let mut frames = self.connection.subscribe_frames();
        tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(event) => client.dispatch(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("dispatch: dropped {missed} server events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_status(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        let mut status = self.connection.subscribe_status();
        tokio::spawn(async move {
            loop {
                match status.recv().await {
                    Ok(event) => client.on_connection_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("status: dropped {missed} connection events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_typing_sweeper(self: &Arc<Self>) -> TimerHandle {
        let client = Arc::clone(self);
        scheduler::schedule_repeating(self.settings.typing_sweep_interval, move || {
            let client = Arc::clone(&client);
            async move {
                client.reconciler.sweep_typing().await;
            }
        })
    }

    async fn on_connection_event(self: &Arc<Self>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged(state) => {
                // Call signaling rides the realtime connection; losing it
                // mid-call fails the call.
                if matches!(
                    state,
                    ConnectionState::Reconnecting
                        | ConnectionState::Disconnected
                        | ConnectionState::Failed
                ) {
                    self.calls.force_end_active().await;
                }
                let _ = self.events.send(ClientEvent::ConnectionChanged(state));
            }
            ConnectionEvent::Resumed { session_id } => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.session_id = Some(session_id.clone());
                }
                let _ = self.events.send(ClientEvent::SessionResumed { session_id });
                self.resume().await;
            }
            ConnectionEvent::HandshakeRejected { message } => {
                let _ = self.events.send(ClientEvent::AuthRejected { message });
            }
            ConnectionEvent::Terminated { kind, reason } => {
                self.calls.force_end_active().await;
                let _ = self
                    .events
                    .send(ClientEvent::SessionTerminated { kind, reason });
            }
        }
    }

    /// Runs after every successful handshake: refresh directory state,
    /// rejoin rooms, and refetch whatever conversation is in focus so
    /// anything missed while offline reconciles in.
    async fn resume(self: &Arc<Self>) {
        match self.directory.fetch_users().await {
            Ok(users) => {
                {
                    let mut presence = self.presence.lock().await;
                    presence.seed(&users);
                }
                let _ = self.events.send(ClientEvent::ChatListChanged);
            }
            Err(error) => debug!("resume: user directory fetch failed: {error:#}"),
        }
        match self.directory.fetch_chats(self.session.user_id).await {
            Ok(chats) => self.reconciler.seed_chats(&chats).await,
            Err(error) => debug!("resume: chat list fetch failed: {error:#}"),
        }
        match self.directory.fetch_rooms().await {
            Ok(rooms) => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.rooms = rooms.clone();
                }
                let _ = self.events.send(ClientEvent::RoomsUpdated(rooms));
            }
            Err(error) => debug!("resume: room list fetch failed: {error:#}"),
        }

        let joined: Vec<RoomId> = {
            let inner = self.inner.lock().await;
            inner.joined_rooms.iter().copied().collect()
        };
        for room_id in joined {
            if let Err(error) = self.connection.send(ClientRequest::JoinRoom { room_id }).await {
                debug!(room_id = room_id.0, "resume: rejoin failed: {error}");
            }
        }

        if let Some(key) = self.reconciler.active_key().await {
            self.reconciler.refetch_history(key).await;
        }
    }

    async fn dispatch(self: &Arc<Self>, event: ServerEvent) {
        self.calls.handle_server_event(&event).await;
        match event {
            ServerEvent::RoomMessage { room_id, message } => {
                self.note_author(&message).await;
                self.reconciler
                    .on_confirmed(ConversationKey::Room(room_id), message)
                    .await;
            }
            ServerEvent::PrivateMessage { to, message } => {
                let key = if message.sender_id == self.session.user_id {
                    ConversationKey::Private(to)
                } else {
                    ConversationKey::Private(message.sender_id)
                };
                self.note_author(&message).await;
                self.reconciler.on_confirmed(key, message).await;
            }
            ServerEvent::RoomMessages { room_id, messages } => {
                for message in &messages {
                    self.note_author(message).await;
                }
                self.reconciler
                    .on_history(ConversationKey::Room(room_id), &messages)
                    .await;
            }
            ServerEvent::PrivateMessages { with, messages } => {
                for message in &messages {
                    self.note_author(message).await;
                }
                self.reconciler
                    .on_history(ConversationKey::Private(with), &messages)
                    .await;
            }
            ServerEvent::Typing { target, user_id } => {
                self.reconciler
                    .on_typing(conversation_key_for(target, user_id), user_id)
                    .await;
            }
            ServerEvent::StopTyping { target, user_id } => {
                self.reconciler
                    .on_stop_typing(conversation_key_for(target, user_id), user_id)
                    .await;
            }
            ServerEvent::UserStatusChanged {
                user_id,
                status,
                last_active_at,
            } => {
                let changed = {
                    let mut presence = self.presence.lock().await;
                    presence.apply(user_id, status, last_active_at)
                };
                if changed {
                    let _ = self
                        .events
                        .send(ClientEvent::PresenceChanged { user_id, status });
                    let _ = self.events.send(ClientEvent::ChatListChanged);
                }
            }
            ServerEvent::ChatVisibilityChanged { with, open } => {
                self.reconciler.on_visibility_changed(with, open).await;
            }
            ServerEvent::Error(error) => {
                warn!("server: {error}");
                let _ = self.events.send(ClientEvent::Error(error.to_string()));
            }
            // Call signaling was already routed to the coordinator above.
            ServerEvent::IncomingCall { .. }
            | ServerEvent::CallAccepted { .. }
            | ServerEvent::CallRejected { .. }
            | ServerEvent::CallCancelled { .. }
            | ServerEvent::CallEnded { .. }
            | ServerEvent::CallOffer { .. }
            | ServerEvent::CallAnswer { .. }
            | ServerEvent::IceCandidate { .. } => {}
            // Handshake and termination frames are consumed by the
            // connection manager before fan-out.
            ServerEvent::Authenticated { .. }
            | ServerEvent::AuthFailed { .. }
            | ServerEvent::ForceLogout { .. }
            | ServerEvent::UserSuspended { .. }
            | ServerEvent::UserDeleted { .. } => {
                debug!("dispatch: ignoring out-of-band frame");
            }
        }
    }

    /// Usernames ride on message payloads; fold them into the directory so
    /// the chat list can label peers we have never fetched.
    async fn note_author(&self, message: &MessagePayload) {
        let Some(username) = message.sender_username.as_deref() else {
            return;
        };
        let changed = {
            let mut presence = self.presence.lock().await;
            presence.note_username(message.sender_id, username)
        };
        if changed {
            let _ = self.events.send(ClientEvent::ChatListChanged);
        }
    }
}

fn conversation_key_for(target: Target, other: UserId) -> ConversationKey {
    match target {
        Target::Room { room_id } => ConversationKey::Room(room_id),
        // A private target names the local user; the conversation is keyed
        // by the other side.
        Target::User { .. } => ConversationKey::Private(other),
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod lib_tests;
