//! Doubles shared by the in-crate test modules: a scriptable event channel
//! and connector, a fake media engine with an operation log, and a canned
//! directory API.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use media_engine::{
    IceCandidate, IceServer, LocalMediaHandle, MediaConstraints, MediaEngine, PeerConnection,
    PeerConnectionEvent, SdpKind, SessionDescription,
};
use shared::domain::{MessageId, UserId};
use shared::protocol::{
    ChatSummary, ClientRequest, MessagePayload, RoomSummary, ServerEvent, UserSummary,
};
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::bootstrap::DirectoryApi;
use crate::config::SyncSettings;
use crate::transport::{EventChannel, EventChannelConnector, TransportError};
use crate::Session;

pub fn test_session(user_id: i64) -> Session {
    Session {
        user_id: UserId(user_id),
        username: format!("user-{user_id}"),
        auth_token: None,
    }
}

/// Short intervals so reconnects, heartbeats and ring timeouts all land
/// within a test run.
pub fn test_settings() -> SyncSettings {
    SyncSettings {
        heartbeat_interval: Duration::from_millis(25),
        activity_window: Duration::from_millis(80),
        handshake_timeout: Duration::from_millis(250),
        reconnect_base_delay: Duration::from_millis(5),
        reconnect_max_delay: Duration::from_millis(20),
        reconnect_max_attempts: 3,
        match_window: Duration::from_secs(5),
        history_page_size: 50,
        typing_ttl: Duration::from_millis(60),
        typing_sweep_interval: Duration::from_millis(15),
        ice_queue_cap: 4,
        ring_timeout: Duration::from_millis(100),
        media_error_grace: Duration::from_millis(20),
        ice_servers: vec![],
    }
}

/// Fixed base instant so ordering assertions read as offsets.
pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0).single().expect("valid timestamp")
}

pub fn payload(id: i64, sender: i64, content: &str, sent_at: DateTime<Utc>) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(id),
        sender_id: UserId(sender),
        sender_username: Some(format!("user-{sender}")),
        content: content.to_string(),
        sent_at,
    }
}

pub async fn recv_event<T: Clone + Send + 'static>(rx: &mut broadcast::Receiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream closed")
}

// ---- event channel double ----

pub struct FakeChannel {
    sent: Mutex<Vec<ClientRequest>>,
    inbound: Mutex<mpsc::UnboundedReceiver<ServerEvent>>,
    closed: AtomicBool,
    fail_sends: AtomicBool,
}

impl FakeChannel {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedSender<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            inbound: Mutex::new(rx),
            closed: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
        });
        (channel, tx)
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn sent_frames(&self) -> Vec<ClientRequest> {
        self.sent.lock().await.clone()
    }

    /// Polls until at least `count` outbound frames have been captured.
    pub async fn wait_for_frames(&self, count: usize) -> Vec<ClientRequest> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let frames = self.sent.lock().await.clone();
            if frames.len() >= count {
                return frames;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {count} frames, captured {}", frames.len());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl EventChannel for FakeChannel {
    async fn send(&self, request: ClientRequest) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::InvalidUrl {
                url: "fake://".into(),
                reason: "sends disabled".into(),
            });
        }
        self.sent.lock().await.push(request);
        Ok(())
    }

    async fn next_event(&self) -> Option<ServerEvent> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.inbound.lock().await.recv().await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeConnector {
    script: Mutex<VecDeque<Result<Arc<FakeChannel>, TransportError>>>,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            connects: AtomicUsize::new(0),
        })
    }

    /// Scripts a successful connection; returns the channel and its inbound
    /// feed. Dropping the feed simulates a server-side disconnect.
    pub async fn push_ok(&self) -> (Arc<FakeChannel>, mpsc::UnboundedSender<ServerEvent>) {
        let (channel, tx) = FakeChannel::new();
        self.script.lock().await.push_back(Ok(Arc::clone(&channel)));
        (channel, tx)
    }

    /// Scripts a connection that immediately handshakes successfully.
    pub async fn push_authenticated(
        &self,
        session_id: &str,
    ) -> (Arc<FakeChannel>, mpsc::UnboundedSender<ServerEvent>) {
        let (channel, tx) = self.push_ok().await;
        tx.send(ServerEvent::Authenticated {
            session_id: session_id.to_string(),
        })
        .expect("inbound feed open");
        (channel, tx)
    }

    pub async fn push_err(&self) {
        self.script.lock().await.push_back(Err(TransportError::InvalidUrl {
            url: "fake://".into(),
            reason: "scripted connect failure".into(),
        }));
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventChannelConnector for FakeConnector {
    async fn connect(&self) -> Result<Arc<dyn EventChannel>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().await.pop_front() {
            Some(Ok(channel)) => Ok(channel as Arc<dyn EventChannel>),
            Some(Err(error)) => Err(error),
            None => Err(TransportError::InvalidUrl {
                url: "fake://".into(),
                reason: "script exhausted".into(),
            }),
        }
    }
}

// ---- media engine double ----

pub struct FakeMediaEngine {
    ops: Arc<Mutex<Vec<String>>>,
    pc_events: broadcast::Sender<PeerConnectionEvent>,
    fail_media: AtomicBool,
    fail_offer: Arc<AtomicBool>,
    fail_remote: Arc<AtomicBool>,
}

impl FakeMediaEngine {
    pub fn new() -> Arc<Self> {
        let (pc_events, _) = broadcast::channel(64);
        Arc::new(Self {
            ops: Arc::new(Mutex::new(Vec::new())),
            pc_events,
            fail_media: AtomicBool::new(false),
            fail_offer: Arc::new(AtomicBool::new(false)),
            fail_remote: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn fail_media(&self) {
        self.fail_media.store(true, Ordering::SeqCst);
    }

    pub fn fail_offer(&self) {
        self.fail_offer.store(true, Ordering::SeqCst);
    }

    pub fn fail_remote_description(&self) {
        self.fail_remote.store(true, Ordering::SeqCst);
    }

    /// Feeds an event to every peer connection created by this engine.
    pub fn emit(&self, event: PeerConnectionEvent) {
        let _ = self.pc_events.send(event);
    }

    pub async fn op_log(&self) -> Vec<String> {
        self.ops.lock().await.clone()
    }

    pub async fn wait_for_op(&self, op: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if self.ops.lock().await.iter().any(|entry| entry == op) {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for op {op:?}, log: {:?}", self.op_log().await);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl MediaEngine for FakeMediaEngine {
    async fn get_local_media(
        &self,
        constraints: MediaConstraints,
    ) -> anyhow::Result<Arc<dyn LocalMediaHandle>> {
        if self.fail_media.load(Ordering::SeqCst) {
            anyhow::bail!("no capture device");
        }
        self.ops.lock().await.push("get_local_media".into());
        Ok(Arc::new(FakeLocalMedia {
            ops: Arc::clone(&self.ops),
            constraints,
        }))
    }

    async fn create_peer_connection(
        &self,
        _ice_servers: &[IceServer],
    ) -> anyhow::Result<Arc<dyn PeerConnection>> {
        self.ops.lock().await.push("create_peer_connection".into());
        Ok(Arc::new(FakePeerConnection {
            ops: Arc::clone(&self.ops),
            events: self.pc_events.clone(),
            fail_offer: Arc::clone(&self.fail_offer),
            fail_remote: Arc::clone(&self.fail_remote),
        }))
    }
}

struct FakeLocalMedia {
    ops: Arc<Mutex<Vec<String>>>,
    constraints: MediaConstraints,
}

#[async_trait]
impl LocalMediaHandle for FakeLocalMedia {
    fn constraints(&self) -> MediaConstraints {
        self.constraints
    }

    async fn stop(&self) {
        self.ops.lock().await.push("stop_local_media".into());
    }
}

struct FakePeerConnection {
    ops: Arc<Mutex<Vec<String>>>,
    events: broadcast::Sender<PeerConnectionEvent>,
    fail_offer: Arc<AtomicBool>,
    fail_remote: Arc<AtomicBool>,
}

fn kind_label(kind: SdpKind) -> &'static str {
    match kind {
        SdpKind::Offer => "offer",
        SdpKind::Answer => "answer",
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn attach_local_media(&self, _media: Arc<dyn LocalMediaHandle>) -> anyhow::Result<()> {
        self.ops.lock().await.push("attach_local_media".into());
        Ok(())
    }

    async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
        if self.fail_offer.load(Ordering::SeqCst) {
            anyhow::bail!("offer negotiation refused");
        }
        self.ops.lock().await.push("create_offer".into());
        Ok(SessionDescription::offer("sdp-offer"))
    }

    async fn create_answer(&self) -> anyhow::Result<SessionDescription> {
        self.ops.lock().await.push("create_answer".into());
        Ok(SessionDescription::answer("sdp-answer"))
    }

    async fn set_local_description(&self, description: SessionDescription) -> anyhow::Result<()> {
        self.ops
            .lock()
            .await
            .push(format!("set_local:{}", kind_label(description.kind)));
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> anyhow::Result<()> {
        if self.fail_remote.load(Ordering::SeqCst) {
            anyhow::bail!("remote description refused");
        }
        self.ops
            .lock()
            .await
            .push(format!("set_remote:{}", kind_label(description.kind)));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()> {
        self.ops
            .lock()
            .await
            .push(format!("add_candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.ops.lock().await.push("close".into());
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<PeerConnectionEvent> {
        self.events.subscribe()
    }
}

// ---- directory double ----

pub struct FakeDirectory {
    pub users: Mutex<Vec<UserSummary>>,
    pub chats: Mutex<Vec<ChatSummary>>,
    pub rooms: Mutex<Vec<RoomSummary>>,
    fetches: AtomicUsize,
}

impl FakeDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            users: Mutex::new(Vec::new()),
            chats: Mutex::new(Vec::new()),
            rooms: Mutex::new(Vec::new()),
            fetches: AtomicUsize::new(0),
        })
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DirectoryApi for FakeDirectory {
    async fn fetch_rooms(&self) -> anyhow::Result<Vec<RoomSummary>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.rooms.lock().await.clone())
    }

    async fn fetch_users(&self) -> anyhow::Result<Vec<UserSummary>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.users.lock().await.clone())
    }

    async fn fetch_chats(&self, _user_id: UserId) -> anyhow::Result<Vec<ChatSummary>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.chats.lock().await.clone())
    }
}
