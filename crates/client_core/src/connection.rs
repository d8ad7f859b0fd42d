use std::sync::Arc;
use std::time::{Duration, Instant};

use shared::protocol::{ClientRequest, ServerEvent};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::SyncSettings;
use crate::scheduler::{self, TimerHandle};
use crate::transport::{EventChannel, EventChannelConnector, TransportError};
use crate::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationKind {
    ForcedLogout,
    Suspended,
    Deleted,
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    /// Fired after every successful handshake, first connect included.
    /// Subscribers re-issue their resume operations on this.
    Resumed { session_id: String },
    HandshakeRejected { message: String },
    Terminated {
        kind: TerminationKind,
        reason: Option<String>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("not connected")]
    NotConnected,
    #[error("connection supervisor already running")]
    AlreadyRunning,
    #[error("retry is only valid after the connection has failed")]
    NotFailed,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

enum EstablishError {
    Transport(TransportError),
    ChannelClosed,
    HandshakeTimeout,
    AuthRejected(String),
}

enum LoopExit {
    Closed,
    Terminated,
}

/// Owns the event channel: authenticate handshake, heartbeat, reconnect with
/// bounded exponential backoff, and fan-out of inbound frames. Terminal
/// server events (forced logout, suspension, deletion) are intercepted here
/// and never trigger automatic reconnection.
pub struct ConnectionManager {
    session: Session,
    settings: Arc<SyncSettings>,
    connector: Arc<dyn EventChannelConnector>,
    inner: Mutex<ConnectionInner>,
    frames: broadcast::Sender<ServerEvent>,
    status: broadcast::Sender<ConnectionEvent>,
}

struct ConnectionInner {
    state: ConnectionState,
    attempt: u32,
    channel: Option<Arc<dyn EventChannel>>,
    supervisor: Option<JoinHandle<()>>,
    heartbeat: Option<TimerHandle>,
    last_user_active: Option<Instant>,
}

impl ConnectionManager {
    pub fn new(
        session: Session,
        settings: Arc<SyncSettings>,
        connector: Arc<dyn EventChannelConnector>,
    ) -> Arc<Self> {
        let (frames, _) = broadcast::channel(1024);
        let (status, _) = broadcast::channel(64);
        Arc::new(Self {
            session,
            settings,
            connector,
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Disconnected,
                attempt: 0,
                channel: None,
                supervisor: None,
                heartbeat: None,
                last_user_active: None,
            }),
            frames,
            status,
        })
    }

    pub fn subscribe_frames(&self) -> broadcast::Receiver<ServerEvent> {
        self.frames.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.status.subscribe()
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Starts the connection supervisor. Valid from `Disconnected` and, as
    /// the manual retry path, from `Failed`.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ConnectionError> {
        {
            let mut inner = self.inner.lock().await;
            match inner.state {
                ConnectionState::Disconnected | ConnectionState::Failed => {}
                _ => return Err(ConnectionError::AlreadyRunning),
            }
            inner.attempt = 0;
            inner.state = ConnectionState::Connecting;
            inner.supervisor = Some(self.spawn_supervisor());
        }
        let _ = self
            .status
            .send(ConnectionEvent::StateChanged(ConnectionState::Connecting));
        Ok(())
    }

    /// Manual retry after the supervisor gave up.
    pub async fn retry(self: &Arc<Self>) -> Result<(), ConnectionError> {
        if self.state().await != ConnectionState::Failed {
            return Err(ConnectionError::NotFailed);
        }
        self.connect().await
    }

    pub async fn disconnect(&self) {
        let (channel, changed) = {
            let mut inner = self.inner.lock().await;
            if let Some(task) = inner.supervisor.take() {
                task.abort();
            }
            inner.heartbeat = None;
            let channel = inner.channel.take();
            let changed = inner.state != ConnectionState::Disconnected;
            inner.state = ConnectionState::Disconnected;
            (channel, changed)
        };
        if let Some(channel) = channel {
            channel.close().await;
        }
        if changed {
            let _ = self
                .status
                .send(ConnectionEvent::StateChanged(ConnectionState::Disconnected));
        }
    }

    pub(crate) async fn send(&self, request: ClientRequest) -> Result<(), ConnectionError> {
        let channel = {
            let inner = self.inner.lock().await;
            if inner.state != ConnectionState::Connected {
                return Err(ConnectionError::NotConnected);
            }
            inner.channel.clone()
        };
        match channel {
            Some(channel) => Ok(channel.send(request).await?),
            None => Err(ConnectionError::NotConnected),
        }
    }

    /// Coalesces local user activity into at most one `user_active` frame
    /// per configured window.
    pub async fn note_user_activity(&self) {
        let channel = {
            let mut inner = self.inner.lock().await;
            if inner.state != ConnectionState::Connected {
                return;
            }
            if let Some(last) = inner.last_user_active {
                if last.elapsed() < self.settings.activity_window {
                    return;
                }
            }
            inner.last_user_active = Some(Instant::now());
            inner.channel.clone()
        };
        if let Some(channel) = channel {
            if let Err(error) = channel.send(ClientRequest::UserActive).await {
                debug!("activity: send failed: {error}");
            }
        }
    }

    fn spawn_supervisor(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run().await;
        })
    }

    async fn run(self: Arc<Self>) {
        loop {
            let attempt = { self.inner.lock().await.attempt };
            let connecting = if attempt == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            };
            self.set_state(connecting).await;

            match self.establish().await {
                Ok(channel) => {
                    if let LoopExit::Terminated = self.read_loop(channel).await {
                        return;
                    }
                }
                Err(EstablishError::AuthRejected(message)) => {
                    warn!("connect: handshake rejected: {message}");
                    let _ = self
                        .status
                        .send(ConnectionEvent::HandshakeRejected { message });
                    self.fail().await;
                    return;
                }
                Err(EstablishError::Transport(error)) => {
                    debug!("connect: transport error: {error}");
                }
                Err(EstablishError::ChannelClosed) => {
                    debug!("connect: channel closed during handshake");
                }
                Err(EstablishError::HandshakeTimeout) => {
                    debug!("connect: handshake timed out");
                }
            }

            let delay = {
                let mut inner = self.inner.lock().await;
                inner.heartbeat = None;
                inner.channel = None;
                inner.attempt += 1;
                if inner.attempt >= self.settings.reconnect_max_attempts {
                    None
                } else {
                    Some(backoff_delay(&self.settings, inner.attempt - 1))
                }
            };
            match delay {
                None => {
                    warn!(
                        attempts = self.settings.reconnect_max_attempts,
                        "connect: giving up after max attempts"
                    );
                    self.fail().await;
                    return;
                }
                Some(delay) => {
                    info!(
                        delay_ms = delay.as_millis() as u64,
                        "connect: retrying after backoff"
                    );
                    self.set_state(ConnectionState::Reconnecting).await;
                    time::sleep(delay).await;
                }
            }
        }
    }

    async fn establish(self: &Arc<Self>) -> Result<Arc<dyn EventChannel>, EstablishError> {
        let channel = self
            .connector
            .connect()
            .await
            .map_err(EstablishError::Transport)?;

        let hello = ClientRequest::Authenticate {
            user_id: self.session.user_id,
            username: self.session.username.clone(),
            token: self.session.auth_token.clone(),
        };
        channel
            .send(hello)
            .await
            .map_err(EstablishError::Transport)?;

        let handshake = time::timeout(self.settings.handshake_timeout, async {
            loop {
                match channel.next_event().await {
                    None => return Err(EstablishError::ChannelClosed),
                    Some(ServerEvent::Authenticated { session_id }) => return Ok(session_id),
                    Some(ServerEvent::AuthFailed { message }) => {
                        return Err(EstablishError::AuthRejected(message))
                    }
                    Some(other) => {
                        debug!("handshake: ignoring pre-auth event: {other:?}");
                    }
                }
            }
        })
        .await;

        let session_id = match handshake {
            Ok(result) => result?,
            Err(_elapsed) => {
                channel.close().await;
                return Err(EstablishError::HandshakeTimeout);
            }
        };

        {
            let mut inner = self.inner.lock().await;
            inner.attempt = 0;
            inner.state = ConnectionState::Connected;
            inner.channel = Some(Arc::clone(&channel));
            inner.heartbeat = Some(self.spawn_heartbeat(Arc::clone(&channel)));
            inner.last_user_active = None;
        }
        info!(user_id = self.session.user_id.0, "connect: session established");
        let _ = self
            .status
            .send(ConnectionEvent::StateChanged(ConnectionState::Connected));
        let _ = self.status.send(ConnectionEvent::Resumed { session_id });
        Ok(channel)
    }

    fn spawn_heartbeat(&self, channel: Arc<dyn EventChannel>) -> TimerHandle {
        scheduler::schedule_repeating(self.settings.heartbeat_interval, move || {
            let channel = Arc::clone(&channel);
            async move {
                if let Err(error) = channel.send(ClientRequest::Heartbeat).await {
                    debug!("heartbeat: send failed: {error}");
                }
            }
        })
    }

    async fn read_loop(&self, channel: Arc<dyn EventChannel>) -> LoopExit {
        while let Some(event) = channel.next_event().await {
            if let Some((kind, reason)) = termination_of(&event) {
                warn!("session: terminated by server: {kind:?}");
                {
                    let mut inner = self.inner.lock().await;
                    inner.heartbeat = None;
                    inner.channel = None;
                    inner.state = ConnectionState::Disconnected;
                }
                channel.close().await;
                let _ = self.status.send(ConnectionEvent::Terminated { kind, reason });
                let _ = self
                    .status
                    .send(ConnectionEvent::StateChanged(ConnectionState::Disconnected));
                return LoopExit::Terminated;
            }
            let _ = self.frames.send(event);
        }
        debug!("connect: event channel closed");
        LoopExit::Closed
    }

    async fn set_state(&self, state: ConnectionState) {
        let changed = {
            let mut inner = self.inner.lock().await;
            let changed = inner.state != state;
            inner.state = state;
            changed
        };
        if changed {
            let _ = self.status.send(ConnectionEvent::StateChanged(state));
        }
    }

    async fn fail(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.heartbeat = None;
            inner.channel = None;
            inner.state = ConnectionState::Failed;
        }
        let _ = self
            .status
            .send(ConnectionEvent::StateChanged(ConnectionState::Failed));
    }
}

/// `min(base * 2^k, cap)` where `k` counts consecutive failures so far.
pub(crate) fn backoff_delay(settings: &SyncSettings, failures: u32) -> Duration {
    let exponent = failures.min(16);
    let delay = settings.reconnect_base_delay.saturating_mul(1u32 << exponent);
    delay.min(settings.reconnect_max_delay)
}

fn termination_of(event: &ServerEvent) -> Option<(TerminationKind, Option<String>)> {
    match event {
        ServerEvent::ForceLogout { reason } => {
            Some((TerminationKind::ForcedLogout, reason.clone()))
        }
        ServerEvent::UserSuspended { reason } => {
            Some((TerminationKind::Suspended, reason.clone()))
        }
        ServerEvent::UserDeleted { reason } => Some((TerminationKind::Deleted, reason.clone())),
        _ => None,
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod connection_tests;
