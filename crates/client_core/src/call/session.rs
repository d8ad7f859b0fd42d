use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration as TimeDelta, Utc};
use media_engine::{
    IceCandidate, LocalMediaHandle, MediaConstraints, MediaEngine, PeerConnection,
    PeerConnectionEvent, SessionDescription, TransportState,
};
use shared::domain::{CallType, UserId};
use shared::protocol::{ClientRequest, IceCandidatePayload};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::call::{CallError, CallLogRecord, CallOutcome, CallPhase, CallRole, CallSignal};
use crate::config::SyncSettings;
use crate::connection::ConnectionManager;
use crate::scheduler::{self, TimerHandle};
use crate::ClientEvent;

/// Where SDP negotiation stands. Signals that do not fit the current
/// sub-state are duplicates or reordered frames and get dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Negotiation {
    None,
    OfferSent,
    OfferReceived,
    Answered,
}

#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub peer: UserId,
    pub call_type: CallType,
    pub role: CallRole,
    pub phase: CallPhase,
}

struct CallState {
    phase: CallPhase,
    negotiation: Negotiation,
    local_media: Option<Arc<dyn LocalMediaHandle>>,
    peer_connection: Option<Arc<dyn PeerConnection>>,
    pc_events_task: Option<JoinHandle<()>>,
    /// Remote candidates that arrived before the remote description.
    pending_candidates: VecDeque<IceCandidatePayload>,
    remote_description_applied: bool,
    connected_at: Option<DateTime<Utc>>,
    ring_timer: Option<TimerHandle>,
    grace_timer: Option<TimerHandle>,
}

/// One voice or video call with a single peer, from first ring to the
/// terminal `Ended` phase. All mutation goes through the state lock, and
/// negotiation steps run to completion under it so signals apply in the
/// order they arrived.
pub struct CallSession {
    peer: UserId,
    call_type: CallType,
    role: CallRole,
    started_at: DateTime<Utc>,
    settings: Arc<SyncSettings>,
    connection: Arc<ConnectionManager>,
    media: Arc<dyn MediaEngine>,
    events: broadcast::Sender<ClientEvent>,
    state: Mutex<CallState>,
}

impl CallSession {
    pub(crate) fn new(
        peer: UserId,
        call_type: CallType,
        role: CallRole,
        settings: Arc<SyncSettings>,
        connection: Arc<ConnectionManager>,
        media: Arc<dyn MediaEngine>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer,
            call_type,
            role,
            started_at: Utc::now(),
            settings,
            connection,
            media,
            events,
            state: Mutex::new(CallState {
                phase: CallPhase::Idle,
                negotiation: Negotiation::None,
                local_media: None,
                peer_connection: None,
                pc_events_task: None,
                pending_candidates: VecDeque::new(),
                remote_description_applied: false,
                connected_at: None,
                ring_timer: None,
                grace_timer: None,
            }),
        })
    }

    pub fn peer(&self) -> UserId {
        self.peer
    }

    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub async fn phase(&self) -> CallPhase {
        self.state.lock().await.phase
    }

    pub async fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            peer: self.peer,
            call_type: self.call_type,
            role: self.role,
            phase: self.state.lock().await.phase,
        }
    }

    /// Outbound path: ring the peer. Local media and the peer connection are
    /// set up before any signaling leaves the device, so a media failure
    /// never produces a ghost ring on the other side.
    pub(crate) async fn start(self: &Arc<Self>) -> Result<(), CallError> {
        {
            let mut st = self.state.lock().await;
            if st.phase != CallPhase::Idle {
                return Err(CallError::AlreadyStarted);
            }
            self.set_phase(&mut st, CallPhase::Ringing);
        }

        if let Err(error) = self.setup_media().await {
            self.on_media_failure("initiate", &error).await;
            return Err(CallError::Media(error.to_string()));
        }

        let frame = ClientRequest::InitiateCall {
            to: self.peer,
            call_type: self.call_type,
        };
        if let Err(error) = self.connection.send(frame).await {
            warn!(peer = self.peer.0, "call: could not signal initiate: {error}");
            self.end(CallOutcome::Failed).await;
            return Err(CallError::Signaling(error.to_string()));
        }
        info!(peer = self.peer.0, call_type = ?self.call_type, "call: ringing peer");

        let mut st = self.state.lock().await;
        if st.phase == CallPhase::Ringing {
            st.ring_timer = Some(self.spawn_ring_timer());
        }
        Ok(())
    }

    /// Inbound path: mark the session ringing and arm the ring timer. Media
    /// is not touched until the user accepts.
    pub(crate) async fn ring(self: &Arc<Self>) {
        let mut st = self.state.lock().await;
        if st.phase != CallPhase::Idle {
            return;
        }
        self.set_phase(&mut st, CallPhase::Ringing);
        st.ring_timer = Some(self.spawn_ring_timer());
    }

    /// Receiver accepts: acquire media, then tell the initiator we are ready
    /// for its offer.
    pub async fn accept(self: &Arc<Self>) -> Result<(), CallError> {
        {
            let mut st = self.state.lock().await;
            if self.role != CallRole::Receiver || st.phase != CallPhase::Ringing {
                return Err(CallError::NotRinging);
            }
            st.ring_timer = None;
            self.set_phase(&mut st, CallPhase::Connecting);
        }

        if let Err(error) = self.setup_media().await {
            self.on_media_failure("accept", &error).await;
            return Err(CallError::Media(error.to_string()));
        }

        if let Err(error) = self.connection.send(ClientRequest::AcceptCall { to: self.peer }).await {
            warn!(peer = self.peer.0, "call: could not signal accept: {error}");
            self.end(CallOutcome::Failed).await;
            return Err(CallError::Signaling(error.to_string()));
        }
        info!(peer = self.peer.0, "call: accepted");
        Ok(())
    }

    /// Receiver declines a ringing call.
    pub async fn reject(self: &Arc<Self>, reason: Option<String>) -> Result<(), CallError> {
        {
            let st = self.state.lock().await;
            if self.role != CallRole::Receiver || st.phase != CallPhase::Ringing {
                return Err(CallError::NotRinging);
            }
        }
        let frame = ClientRequest::RejectCall {
            to: self.peer,
            reason,
        };
        if let Err(error) = self.connection.send(frame).await {
            warn!(peer = self.peer.0, "call: could not signal reject: {error}");
        }
        self.end(CallOutcome::Rejected).await;
        Ok(())
    }

    /// Local hangup from any live phase. The outcome and the wire frame both
    /// depend on how far the call got.
    pub async fn hangup(self: &Arc<Self>) {
        let (phase, role) = {
            let st = self.state.lock().await;
            (st.phase, self.role)
        };
        let (frame, outcome) = match (phase, role) {
            (CallPhase::Ringing, CallRole::Initiator) => (
                Some(ClientRequest::CancelCall { to: self.peer }),
                CallOutcome::Cancelled,
            ),
            (CallPhase::Ringing, CallRole::Receiver) => (
                Some(ClientRequest::RejectCall {
                    to: self.peer,
                    reason: None,
                }),
                CallOutcome::Rejected,
            ),
            (CallPhase::Connecting, _) => (
                Some(ClientRequest::EndCall { to: self.peer }),
                CallOutcome::Cancelled,
            ),
            (CallPhase::Connected, _) => (
                Some(ClientRequest::EndCall { to: self.peer }),
                CallOutcome::Completed,
            ),
            (CallPhase::Idle | CallPhase::Ended, _) => (None, CallOutcome::Completed),
        };
        let Some(frame) = frame else {
            debug!(peer = self.peer.0, "call: hangup on inactive session ignored");
            return;
        };
        if let Err(error) = self.connection.send(frame).await {
            warn!(peer = self.peer.0, "call: could not signal hangup: {error}");
        }
        self.end(outcome).await;
    }

    pub(crate) async fn handle_signal(self: &Arc<Self>, signal: CallSignal) {
        match signal {
            CallSignal::Accepted => self.on_accepted().await,
            CallSignal::Rejected { reason } => self.on_rejected(reason).await,
            CallSignal::Cancelled | CallSignal::Ended => self.on_remote_end().await,
            CallSignal::Offer { sdp } => self.on_offer(sdp).await,
            CallSignal::Answer { sdp } => self.on_answer(sdp).await,
            CallSignal::Candidate(candidate) => self.on_candidate(candidate).await,
        }
    }

    /// Initiator side: the peer accepted, so produce and send the offer.
    async fn on_accepted(self: &Arc<Self>) {
        let offer = {
            let mut st = self.state.lock().await;
            if self.role != CallRole::Initiator
                || st.phase != CallPhase::Ringing
                || st.negotiation != Negotiation::None
            {
                debug!(peer = self.peer.0, "call: ignoring unexpected call-accepted");
                return;
            }
            st.ring_timer = None;
            self.set_phase(&mut st, CallPhase::Connecting);
            let Some(pc) = st.peer_connection.clone() else {
                drop(st);
                warn!(peer = self.peer.0, "call: accepted without a peer connection");
                self.end(CallOutcome::Failed).await;
                return;
            };
            let offer = match pc.create_offer().await {
                Ok(offer) => offer,
                Err(error) => {
                    drop(st);
                    warn!(peer = self.peer.0, "call: offer creation failed: {error}");
                    self.end(CallOutcome::Failed).await;
                    return;
                }
            };
            if let Err(error) = pc.set_local_description(offer.clone()).await {
                drop(st);
                warn!(peer = self.peer.0, "call: local offer rejected: {error}");
                self.end(CallOutcome::Failed).await;
                return;
            }
            st.negotiation = Negotiation::OfferSent;
            offer
        };

        let frame = ClientRequest::CallOffer {
            to: self.peer,
            sdp: offer.sdp,
        };
        if let Err(error) = self.connection.send(frame).await {
            warn!(peer = self.peer.0, "call: could not send offer: {error}");
            self.end(CallOutcome::Failed).await;
        }
    }

    /// Receiver side: apply the offer, answer it, and release any candidates
    /// queued while the remote description was missing.
    async fn on_offer(self: &Arc<Self>, sdp: String) {
        let answer = {
            let mut st = self.state.lock().await;
            if self.role != CallRole::Receiver
                || st.phase != CallPhase::Connecting
                || st.negotiation != Negotiation::None
            {
                debug!(peer = self.peer.0, "call: ignoring duplicate or early offer");
                return;
            }
            let Some(pc) = st.peer_connection.clone() else {
                drop(st);
                warn!(peer = self.peer.0, "call: offer arrived without a peer connection");
                self.end(CallOutcome::Failed).await;
                return;
            };
            if let Err(error) = pc.set_remote_description(SessionDescription::offer(sdp)).await {
                drop(st);
                warn!(peer = self.peer.0, "call: remote offer rejected: {error}");
                self.end(CallOutcome::Failed).await;
                return;
            }
            st.negotiation = Negotiation::OfferReceived;
            Self::flush_pending_candidates(&mut st, &pc).await;
            let answer = match pc.create_answer().await {
                Ok(answer) => answer,
                Err(error) => {
                    drop(st);
                    warn!(peer = self.peer.0, "call: answer creation failed: {error}");
                    self.end(CallOutcome::Failed).await;
                    return;
                }
            };
            if let Err(error) = pc.set_local_description(answer.clone()).await {
                drop(st);
                warn!(peer = self.peer.0, "call: local answer rejected: {error}");
                self.end(CallOutcome::Failed).await;
                return;
            }
            st.negotiation = Negotiation::Answered;
            answer
        };

        let frame = ClientRequest::CallAnswer {
            to: self.peer,
            sdp: answer.sdp,
        };
        if let Err(error) = self.connection.send(frame).await {
            warn!(peer = self.peer.0, "call: could not send answer: {error}");
            self.end(CallOutcome::Failed).await;
        }
    }

    /// Initiator side: the answer to our offer.
    async fn on_answer(self: &Arc<Self>, sdp: String) {
        let mut st = self.state.lock().await;
        if self.role != CallRole::Initiator || st.negotiation != Negotiation::OfferSent {
            debug!(peer = self.peer.0, "call: ignoring duplicate or early answer");
            return;
        }
        let Some(pc) = st.peer_connection.clone() else {
            return;
        };
        if let Err(error) = pc.set_remote_description(SessionDescription::answer(sdp)).await {
            drop(st);
            warn!(peer = self.peer.0, "call: remote answer rejected: {error}");
            self.end(CallOutcome::Failed).await;
            return;
        }
        st.negotiation = Negotiation::Answered;
        Self::flush_pending_candidates(&mut st, &pc).await;
    }

    /// Remote candidates apply immediately once the remote description is in
    /// place; before that they queue, oldest dropped past the cap.
    async fn on_candidate(self: &Arc<Self>, candidate: IceCandidatePayload) {
        let mut st = self.state.lock().await;
        if st.phase == CallPhase::Ended || st.phase == CallPhase::Idle {
            debug!(peer = self.peer.0, "call: dropping candidate for inactive session");
            return;
        }
        if st.remote_description_applied {
            if let Some(pc) = st.peer_connection.clone() {
                if let Err(error) = pc.add_ice_candidate(wire_candidate(candidate)).await {
                    warn!(peer = self.peer.0, "call: candidate rejected: {error}");
                }
            }
            return;
        }
        if st.pending_candidates.len() >= self.settings.ice_queue_cap {
            st.pending_candidates.pop_front();
            warn!(peer = self.peer.0, "call: candidate queue full, dropping oldest");
        }
        st.pending_candidates.push_back(candidate);
    }

    async fn on_rejected(self: &Arc<Self>, reason: Option<String>) {
        {
            let st = self.state.lock().await;
            if self.role != CallRole::Initiator || st.phase != CallPhase::Ringing {
                debug!(peer = self.peer.0, "call: ignoring stray call-rejected");
                return;
            }
        }
        info!(
            peer = self.peer.0,
            reason = reason.as_deref().unwrap_or("declined"),
            "call: peer rejected"
        );
        self.end(CallOutcome::Rejected).await;
    }

    /// Remote cancel or hangup. The outcome depends on how far the call got
    /// on this side.
    async fn on_remote_end(self: &Arc<Self>) {
        let phase = self.state.lock().await.phase;
        let outcome = match phase {
            CallPhase::Ringing => match self.role {
                CallRole::Receiver => CallOutcome::Missed,
                CallRole::Initiator => CallOutcome::Cancelled,
            },
            CallPhase::Connecting => CallOutcome::Cancelled,
            CallPhase::Connected => CallOutcome::Completed,
            CallPhase::Idle | CallPhase::Ended => return,
        };
        self.end(outcome).await;
    }

    async fn on_ring_timeout(self: &Arc<Self>) {
        {
            let st = self.state.lock().await;
            if st.phase != CallPhase::Ringing {
                return;
            }
        }
        info!(peer = self.peer.0, role = ?self.role, "call: ring timed out");
        match self.role {
            CallRole::Initiator => {
                let frame = ClientRequest::CancelCall { to: self.peer };
                if let Err(error) = self.connection.send(frame).await {
                    warn!(peer = self.peer.0, "call: could not signal cancel: {error}");
                }
                self.end(CallOutcome::Cancelled).await;
            }
            CallRole::Receiver => self.end(CallOutcome::Missed).await,
        }
    }

    async fn on_pc_event(self: &Arc<Self>, event: PeerConnectionEvent) {
        match event {
            PeerConnectionEvent::IceCandidate(candidate) => {
                if self.phase().await == CallPhase::Ended {
                    return;
                }
                let frame = ClientRequest::IceCandidate {
                    to: self.peer,
                    candidate: media_candidate(candidate),
                };
                if let Err(error) = self.connection.send(frame).await {
                    warn!(peer = self.peer.0, "call: could not send candidate: {error}");
                }
            }
            PeerConnectionEvent::RemoteTrackAdded { track_id, kind } => {
                self.promote_connected().await;
                let _ = self.events.send(ClientEvent::CallRemoteTrack {
                    peer: self.peer,
                    track_id,
                    kind,
                });
            }
            PeerConnectionEvent::TransportStateChanged(state) => match state {
                TransportState::Connected => self.promote_connected().await,
                TransportState::Failed => {
                    warn!(peer = self.peer.0, "call: transport failed");
                    self.end(CallOutcome::Failed).await;
                }
                TransportState::Closed => {
                    if self.phase().await != CallPhase::Ended {
                        self.end(CallOutcome::Failed).await;
                    }
                }
                TransportState::Disconnected => {
                    warn!(peer = self.peer.0, "call: transport interrupted, awaiting recovery");
                }
                TransportState::New | TransportState::Connecting => {}
            },
        }
    }

    async fn promote_connected(self: &Arc<Self>) {
        let mut st = self.state.lock().await;
        if st.phase != CallPhase::Connecting {
            return;
        }
        st.connected_at = Some(Utc::now());
        self.set_phase(&mut st, CallPhase::Connected);
        info!(peer = self.peer.0, "call: media flowing");
    }

    /// Terminal transition. Idempotent: the first caller wins, emits the
    /// call log, and tears down media; later calls are no-ops.
    pub(crate) async fn end(self: &Arc<Self>, outcome: CallOutcome) {
        // The timer handles abort their task when dropped, and end() may be
        // running on one of those very tasks. They stay alive in this scope
        // until the teardown and the log emit are done.
        let (pc_task, pc, local_media, connected_at, _timers) = {
            let mut st = self.state.lock().await;
            if st.phase == CallPhase::Ended {
                return;
            }
            st.phase = CallPhase::Ended;
            st.pending_candidates.clear();
            (
                st.pc_events_task.take(),
                st.peer_connection.take(),
                st.local_media.take(),
                st.connected_at,
                (st.ring_timer.take(), st.grace_timer.take()),
            )
        };
        if let Some(media) = local_media {
            media.stop().await;
        }
        if let Some(pc) = pc {
            if let Err(error) = pc.close().await {
                debug!(peer = self.peer.0, "call: peer connection close failed: {error}");
            }
        }

        let ended_at = Utc::now();
        let duration = connected_at
            .map(|at| ended_at - at)
            .unwrap_or_else(TimeDelta::zero);
        info!(peer = self.peer.0, outcome = ?outcome, "call: ended");
        let _ = self.events.send(ClientEvent::CallPhaseChanged {
            peer: self.peer,
            phase: CallPhase::Ended,
        });
        let _ = self.events.send(ClientEvent::CallLog(CallLogRecord {
            peer: self.peer,
            call_type: self.call_type,
            role: self.role,
            outcome,
            started_at: self.started_at,
            connected_at,
            ended_at,
            duration,
        }));
        // Aborted last: end() may be running on this very task when a
        // transport failure is what ended the call. Events arriving in the
        // gap are phase-guarded no-ops.
        if let Some(task) = pc_task {
            task.abort();
        }
    }

    /// Acquire the local track(s) and a peer connection, wiring its event
    /// stream back into this session. Rolls back on partial failure.
    async fn setup_media(self: &Arc<Self>) -> anyhow::Result<()> {
        let constraints = match self.call_type {
            CallType::Voice => MediaConstraints::voice(),
            CallType::Video => MediaConstraints::video(),
        };
        let local_media = self.media.get_local_media(constraints).await?;
        let pc = match self.media.create_peer_connection(&self.settings.ice_servers).await {
            Ok(pc) => pc,
            Err(error) => {
                local_media.stop().await;
                return Err(error);
            }
        };
        if let Err(error) = pc.attach_local_media(Arc::clone(&local_media)).await {
            local_media.stop().await;
            let _ = pc.close().await;
            return Err(error);
        }

        let task = self.spawn_pc_event_task(&pc);
        let mut st = self.state.lock().await;
        if st.phase == CallPhase::Ended {
            drop(st);
            task.abort();
            local_media.stop().await;
            let _ = pc.close().await;
            anyhow::bail!("call ended during media setup");
        }
        st.local_media = Some(local_media);
        st.peer_connection = Some(pc);
        st.pc_events_task = Some(task);
        Ok(())
    }

    fn spawn_pc_event_task(self: &Arc<Self>, pc: &Arc<dyn PeerConnection>) -> JoinHandle<()> {
        let mut events = pc.subscribe_events();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("call: dropped {missed} peer connection events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(session) = weak.upgrade() else {
                    break;
                };
                session.on_pc_event(event).await;
            }
        })
    }

    fn spawn_ring_timer(self: &Arc<Self>) -> TimerHandle {
        let weak = Arc::downgrade(self);
        scheduler::schedule_once(self.settings.ring_timeout, async move {
            if let Some(session) = weak.upgrade() {
                session.on_ring_timeout().await;
            }
        })
    }

    /// Surface the failure to the UI, then force-end once the grace period
    /// lapses so the peer-facing teardown still happens.
    async fn on_media_failure(self: &Arc<Self>, context: &str, error: &anyhow::Error) {
        warn!(peer = self.peer.0, "call: media failure during {context}: {error:#}");
        let _ = self.events.send(ClientEvent::CallFault {
            peer: self.peer,
            message: error.to_string(),
        });
        let weak = Arc::downgrade(self);
        let timer = scheduler::schedule_once(self.settings.media_error_grace, async move {
            if let Some(session) = weak.upgrade() {
                session.end(CallOutcome::Failed).await;
            }
        });
        let mut st = self.state.lock().await;
        if st.phase != CallPhase::Ended {
            st.grace_timer = Some(timer);
        }
    }

    async fn flush_pending_candidates(st: &mut CallState, pc: &Arc<dyn PeerConnection>) {
        st.remote_description_applied = true;
        let queued: Vec<IceCandidatePayload> = st.pending_candidates.drain(..).collect();
        if !queued.is_empty() {
            debug!("call: applying {} queued candidates", queued.len());
        }
        for candidate in queued {
            if let Err(error) = pc.add_ice_candidate(wire_candidate(candidate)).await {
                warn!("call: queued candidate rejected: {error}");
            }
        }
    }

    fn set_phase(&self, st: &mut CallState, phase: CallPhase) {
        st.phase = phase;
        let _ = self.events.send(ClientEvent::CallPhaseChanged {
            peer: self.peer,
            phase,
        });
    }
}

fn wire_candidate(payload: IceCandidatePayload) -> IceCandidate {
    IceCandidate {
        candidate: payload.candidate,
        sdp_mid: payload.sdp_mid,
        sdp_mline_index: payload.sdp_mline_index,
    }
}

fn media_candidate(candidate: IceCandidate) -> IceCandidatePayload {
    IceCandidatePayload {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
    }
}
