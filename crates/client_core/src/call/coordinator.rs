use std::sync::Arc;

use media_engine::MediaEngine;
use shared::domain::{CallType, UserId};
use shared::protocol::{ClientRequest, ServerEvent};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::call::{CallError, CallOutcome, CallPhase, CallRole, CallSession, CallSignal, CallSnapshot};
use crate::config::SyncSettings;
use crate::connection::ConnectionManager;
use crate::{ClientEvent, Session};

/// Owns at most one [`CallSession`] at a time and routes inbound call
/// signaling to it. A second incoming call while one is live gets an
/// automatic busy rejection and never becomes a session.
pub struct CallCoordinator {
    session: Session,
    settings: Arc<SyncSettings>,
    connection: Arc<ConnectionManager>,
    media: Arc<dyn MediaEngine>,
    events: broadcast::Sender<ClientEvent>,
    active: Mutex<Option<Arc<CallSession>>>,
}

impl CallCoordinator {
    pub(crate) fn new(
        session: Session,
        settings: Arc<SyncSettings>,
        connection: Arc<ConnectionManager>,
        media: Arc<dyn MediaEngine>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            session,
            settings,
            connection,
            media,
            events,
            active: Mutex::new(None),
        }
    }

    /// Place an outbound call. Fails with [`CallError::Busy`] while another
    /// call is live.
    pub async fn start_call(&self, peer: UserId, call_type: CallType) -> Result<(), CallError> {
        let mut active = self.active.lock().await;
        if let Some(existing) = active.as_ref() {
            if existing.phase().await != CallPhase::Ended {
                return Err(CallError::Busy);
            }
        }
        debug!(
            user_id = self.session.user_id.0,
            peer = peer.0,
            "call: placing outbound call"
        );
        let session = CallSession::new(
            peer,
            call_type,
            CallRole::Initiator,
            Arc::clone(&self.settings),
            Arc::clone(&self.connection),
            Arc::clone(&self.media),
            self.events.clone(),
        );
        // Stored before start so a failed initiate is still owned here:
        // the media grace timer needs the session alive to end and log it.
        *active = Some(Arc::clone(&session));
        session.start().await?;
        Ok(())
    }

    pub async fn accept_call(&self) -> Result<(), CallError> {
        let session = self.require_active().await?;
        session.accept().await
    }

    pub async fn reject_call(&self, reason: Option<String>) -> Result<(), CallError> {
        let session = self.require_active().await?;
        let result = session.reject(reason).await;
        self.prune().await;
        result
    }

    pub async fn hang_up(&self) -> Result<(), CallError> {
        let session = self.require_active().await?;
        session.hangup().await;
        self.prune().await;
        Ok(())
    }

    pub async fn active_call(&self) -> Option<CallSnapshot> {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(session) => {
                let snapshot = session.snapshot().await;
                (snapshot.phase != CallPhase::Ended).then_some(snapshot)
            }
            None => None,
        }
    }

    /// Feed call-related server events through; everything else is ignored.
    pub(crate) async fn handle_server_event(&self, event: &ServerEvent) {
        match event {
            ServerEvent::IncomingCall { from, call_type } => {
                self.on_incoming(from.user_id, from.username.clone(), *call_type).await;
            }
            ServerEvent::CallAccepted { from } => self.deliver(*from, CallSignal::Accepted).await,
            ServerEvent::CallRejected { from, reason } => {
                self.deliver(
                    *from,
                    CallSignal::Rejected {
                        reason: reason.clone(),
                    },
                )
                .await;
            }
            ServerEvent::CallCancelled { from } => self.deliver(*from, CallSignal::Cancelled).await,
            ServerEvent::CallEnded { from } => self.deliver(*from, CallSignal::Ended).await,
            ServerEvent::CallOffer { from, sdp } => {
                self.deliver(*from, CallSignal::Offer { sdp: sdp.clone() }).await;
            }
            ServerEvent::CallAnswer { from, sdp } => {
                self.deliver(*from, CallSignal::Answer { sdp: sdp.clone() }).await;
            }
            ServerEvent::IceCandidate { from, candidate } => {
                self.deliver(*from, CallSignal::Candidate(candidate.clone())).await;
            }
            _ => {}
        }
    }

    /// The websocket dropped or the session was terminated server-side; any
    /// live call cannot survive that.
    pub(crate) async fn force_end_active(&self) {
        let session = { self.active.lock().await.take() };
        if let Some(session) = session {
            if session.phase().await != CallPhase::Ended {
                warn!(peer = session.peer().0, "call: force-ending, signaling lost");
                session.end(CallOutcome::Failed).await;
            }
        }
    }

    async fn on_incoming(&self, from: UserId, username: String, call_type: CallType) {
        let mut active = self.active.lock().await;
        if let Some(existing) = active.as_ref() {
            if existing.phase().await != CallPhase::Ended {
                info!(from = from.0, "call: busy, auto-rejecting incoming call");
                let frame = ClientRequest::RejectCall {
                    to: from,
                    reason: Some("busy".to_string()),
                };
                if let Err(error) = self.connection.send(frame).await {
                    warn!(from = from.0, "call: could not signal busy: {error}");
                }
                return;
            }
        }
        let session = CallSession::new(
            from,
            call_type,
            CallRole::Receiver,
            Arc::clone(&self.settings),
            Arc::clone(&self.connection),
            Arc::clone(&self.media),
            self.events.clone(),
        );
        session.ring().await;
        *active = Some(session);
        let _ = self.events.send(ClientEvent::IncomingCall {
            from,
            username,
            call_type,
        });
    }

    async fn deliver(&self, from: UserId, signal: CallSignal) {
        let session = { self.active.lock().await.clone() };
        match session {
            Some(session) if session.peer() == from => {
                session.handle_signal(signal).await;
                self.prune().await;
            }
            _ => debug!(from = from.0, "call: dropping signal with no matching session"),
        }
    }

    async fn require_active(&self) -> Result<Arc<CallSession>, CallError> {
        self.active
            .lock()
            .await
            .clone()
            .ok_or(CallError::NoActiveCall)
    }

    async fn prune(&self) {
        let mut active = self.active.lock().await;
        let ended = match active.as_ref() {
            Some(session) => session.phase().await == CallPhase::Ended,
            None => false,
        };
        if ended {
            *active = None;
        }
    }
}
