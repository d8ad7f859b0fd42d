use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as TimeDelta;
use media_engine::{IceCandidate, MediaEngine, PeerConnectionEvent, TrackKind, TransportState};
use shared::domain::{CallType, UserId};
use shared::protocol::{CallerInfo, ClientRequest, IceCandidatePayload, ServerEvent};
use tokio::sync::{broadcast, mpsc};

use super::*;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::test_support::{
    recv_event, test_session, test_settings, FakeChannel, FakeConnector, FakeMediaEngine,
};
use crate::ClientEvent;

const PEER: UserId = UserId(2);
const OTHER: UserId = UserId(3);

struct Harness {
    coordinator: CallCoordinator,
    channel: Arc<FakeChannel>,
    media: Arc<FakeMediaEngine>,
    events: broadcast::Sender<ClientEvent>,
    _feed: mpsc::UnboundedSender<ServerEvent>,
}

/// Coordinator over a live fake connection. The inbound feed stays open so
/// the connection holds `Connected` for the whole test.
async fn harness() -> Harness {
    let connector = FakeConnector::new();
    let (channel, feed) = connector.push_authenticated("sess-call").await;
    let settings = Arc::new(test_settings());
    let connection = ConnectionManager::new(test_session(1), Arc::clone(&settings), connector);
    connection.connect().await.expect("connect starts");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while connection.state().await != ConnectionState::Connected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "connection never established"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let media = FakeMediaEngine::new();
    let (events, _) = broadcast::channel(256);
    let coordinator = CallCoordinator::new(
        test_session(1),
        settings,
        connection,
        Arc::clone(&media) as Arc<dyn MediaEngine>,
        events.clone(),
    );
    Harness {
        coordinator,
        channel,
        media,
        events,
        _feed: feed,
    }
}

fn caller(user_id: UserId) -> CallerInfo {
    CallerInfo {
        user_id,
        username: format!("user-{}", user_id.0),
    }
}

fn ice(candidate: &str) -> IceCandidatePayload {
    IceCandidatePayload {
        candidate: candidate.to_string(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
    }
}

/// Outbound frames minus the connection chatter.
async fn call_frames(channel: &FakeChannel) -> Vec<ClientRequest> {
    channel
        .sent_frames()
        .await
        .into_iter()
        .filter(|frame| {
            !matches!(
                frame,
                ClientRequest::Authenticate { .. }
                    | ClientRequest::Heartbeat
                    | ClientRequest::UserActive
            )
        })
        .collect()
}

async fn wait_for_call_frames(channel: &FakeChannel, count: usize) -> Vec<ClientRequest> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let frames = call_frames(channel).await;
        if frames.len() >= count {
            return frames;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {count} call frames, got {frames:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_phase(events: &mut broadcast::Receiver<ClientEvent>, want: CallPhase) {
    loop {
        if let ClientEvent::CallPhaseChanged { phase, .. } = recv_event(events).await {
            if phase == want {
                return;
            }
        }
    }
}

async fn wait_for_log(events: &mut broadcast::Receiver<ClientEvent>) -> CallLogRecord {
    loop {
        if let ClientEvent::CallLog(record) = recv_event(events).await {
            return record;
        }
    }
}

async fn ops_named(media: &FakeMediaEngine, op: &str) -> usize {
    media
        .op_log()
        .await
        .iter()
        .filter(|entry| entry.as_str() == op)
        .count()
}

#[tokio::test]
async fn outbound_call_runs_to_completion() {
    let h = harness().await;
    let mut events = h.events.subscribe();

    h.coordinator
        .start_call(PEER, CallType::Voice)
        .await
        .expect("call starts");
    assert_eq!(
        h.media.op_log().await,
        vec!["get_local_media", "create_peer_connection", "attach_local_media"]
    );
    let frames = call_frames(&h.channel).await;
    assert!(matches!(
        frames[0],
        ClientRequest::InitiateCall {
            to: PEER,
            call_type: CallType::Voice
        }
    ));
    wait_for_phase(&mut events, CallPhase::Ringing).await;

    h.coordinator
        .handle_server_event(&ServerEvent::CallAccepted { from: PEER })
        .await;
    assert_eq!(ops_named(&h.media, "create_offer").await, 1);
    assert_eq!(ops_named(&h.media, "set_local:offer").await, 1);
    let frames = call_frames(&h.channel).await;
    assert!(matches!(
        &frames[1],
        ClientRequest::CallOffer { to: PEER, sdp } if sdp == "sdp-offer"
    ));

    h.coordinator
        .handle_server_event(&ServerEvent::CallAnswer {
            from: PEER,
            sdp: "their-answer".into(),
        })
        .await;
    assert_eq!(ops_named(&h.media, "set_remote:answer").await, 1);
    // A replayed answer changes nothing.
    h.coordinator
        .handle_server_event(&ServerEvent::CallAnswer {
            from: PEER,
            sdp: "their-answer".into(),
        })
        .await;
    assert_eq!(ops_named(&h.media, "set_remote:answer").await, 1);

    h.media
        .emit(PeerConnectionEvent::TransportStateChanged(TransportState::Connected));
    wait_for_phase(&mut events, CallPhase::Connected).await;
    let snapshot = h.coordinator.active_call().await.expect("still active");
    assert_eq!(snapshot.phase, CallPhase::Connected);
    assert_eq!(snapshot.peer, PEER);
    assert_eq!(snapshot.role, CallRole::Initiator);

    h.coordinator.hang_up().await.expect("hangs up");
    let frames = call_frames(&h.channel).await;
    assert!(matches!(frames.last(), Some(ClientRequest::EndCall { to: PEER })));
    let record = wait_for_log(&mut events).await;
    assert_eq!(record.outcome, CallOutcome::Completed);
    assert_eq!(record.role, CallRole::Initiator);
    assert_eq!(record.peer, PEER);
    assert!(record.connected_at.is_some());
    assert!(record.duration >= TimeDelta::zero());

    assert_eq!(ops_named(&h.media, "stop_local_media").await, 1);
    assert_eq!(ops_named(&h.media, "close").await, 1);
    assert!(h.coordinator.active_call().await.is_none());
}

#[tokio::test]
async fn inbound_call_answers_offer_and_flushes_queued_candidates() {
    let h = harness().await;
    let mut events = h.events.subscribe();

    h.coordinator
        .handle_server_event(&ServerEvent::IncomingCall {
            from: caller(PEER),
            call_type: CallType::Video,
        })
        .await;
    let (from, username, call_type) = loop {
        if let ClientEvent::IncomingCall {
            from,
            username,
            call_type,
        } = recv_event(&mut events).await
        {
            break (from, username, call_type);
        }
    };
    assert_eq!(from, PEER);
    assert_eq!(username, "user-2");
    assert_eq!(call_type, CallType::Video);
    // Nothing touches the microphone or camera until the user answers.
    assert!(h.media.op_log().await.is_empty());
    let snapshot = h.coordinator.active_call().await.expect("ringing");
    assert_eq!(snapshot.phase, CallPhase::Ringing);
    assert_eq!(snapshot.role, CallRole::Receiver);

    h.coordinator
        .handle_server_event(&ServerEvent::IceCandidate {
            from: PEER,
            candidate: ice("c1"),
        })
        .await;

    h.coordinator.accept_call().await.expect("accepts");
    let frames = call_frames(&h.channel).await;
    assert!(matches!(frames.last(), Some(ClientRequest::AcceptCall { to: PEER })));

    h.coordinator
        .handle_server_event(&ServerEvent::IceCandidate {
            from: PEER,
            candidate: ice("c2"),
        })
        .await;

    h.coordinator
        .handle_server_event(&ServerEvent::CallOffer {
            from: PEER,
            sdp: "their-offer".into(),
        })
        .await;
    assert_eq!(
        h.media.op_log().await,
        vec![
            "get_local_media",
            "create_peer_connection",
            "attach_local_media",
            "set_remote:offer",
            "add_candidate:c1",
            "add_candidate:c2",
            "create_answer",
            "set_local:answer",
        ]
    );
    let frames = call_frames(&h.channel).await;
    assert!(matches!(
        &frames[1],
        ClientRequest::CallAnswer { to: PEER, sdp } if sdp == "sdp-answer"
    ));

    // With the remote description in place, candidates apply straight away.
    h.coordinator
        .handle_server_event(&ServerEvent::IceCandidate {
            from: PEER,
            candidate: ice("c3"),
        })
        .await;
    assert_eq!(ops_named(&h.media, "add_candidate:c3").await, 1);
}

#[tokio::test]
async fn candidate_queue_keeps_only_the_newest() {
    let h = harness().await;
    h.coordinator
        .handle_server_event(&ServerEvent::IncomingCall {
            from: caller(PEER),
            call_type: CallType::Voice,
        })
        .await;
    h.coordinator.accept_call().await.expect("accepts");
    for name in ["c1", "c2", "c3", "c4", "c5"] {
        h.coordinator
            .handle_server_event(&ServerEvent::IceCandidate {
                from: PEER,
                candidate: ice(name),
            })
            .await;
    }
    h.coordinator
        .handle_server_event(&ServerEvent::CallOffer {
            from: PEER,
            sdp: "their-offer".into(),
        })
        .await;
    let applied: Vec<String> = h
        .media
        .op_log()
        .await
        .into_iter()
        .filter(|op| op.starts_with("add_candidate:"))
        .collect();
    assert_eq!(
        applied,
        vec![
            "add_candidate:c2",
            "add_candidate:c3",
            "add_candidate:c4",
            "add_candidate:c5",
        ]
    );
}

#[tokio::test]
async fn replayed_offer_is_ignored() {
    let h = harness().await;
    h.coordinator
        .handle_server_event(&ServerEvent::IncomingCall {
            from: caller(PEER),
            call_type: CallType::Voice,
        })
        .await;
    h.coordinator.accept_call().await.expect("accepts");
    for _ in 0..2 {
        h.coordinator
            .handle_server_event(&ServerEvent::CallOffer {
                from: PEER,
                sdp: "their-offer".into(),
            })
            .await;
    }
    assert_eq!(ops_named(&h.media, "set_remote:offer").await, 1);
    assert_eq!(ops_named(&h.media, "create_answer").await, 1);
    let answers = call_frames(&h.channel)
        .await
        .into_iter()
        .filter(|frame| matches!(frame, ClientRequest::CallAnswer { .. }))
        .count();
    assert_eq!(answers, 1);
}

#[tokio::test]
async fn rejecting_a_ring_signals_and_logs() {
    let h = harness().await;
    let mut events = h.events.subscribe();
    h.coordinator
        .handle_server_event(&ServerEvent::IncomingCall {
            from: caller(PEER),
            call_type: CallType::Voice,
        })
        .await;
    h.coordinator
        .reject_call(Some("in a meeting".into()))
        .await
        .expect("rejects");

    let frames = call_frames(&h.channel).await;
    assert!(matches!(
        &frames[0],
        ClientRequest::RejectCall { to: PEER, reason: Some(reason) } if reason == "in a meeting"
    ));
    let record = wait_for_log(&mut events).await;
    assert_eq!(record.outcome, CallOutcome::Rejected);
    assert_eq!(record.role, CallRole::Receiver);
    assert!(record.connected_at.is_none());
    assert_eq!(record.duration, TimeDelta::zero());
    assert!(h.coordinator.active_call().await.is_none());
    assert!(h.media.op_log().await.is_empty());
}

#[tokio::test]
async fn remote_cancel_while_ringing_is_missed() {
    let h = harness().await;
    h.coordinator
        .handle_server_event(&ServerEvent::IncomingCall {
            from: caller(PEER),
            call_type: CallType::Voice,
        })
        .await;
    let mut events = h.events.subscribe();
    h.coordinator
        .handle_server_event(&ServerEvent::CallCancelled { from: PEER })
        .await;
    let record = wait_for_log(&mut events).await;
    assert_eq!(record.outcome, CallOutcome::Missed);
    assert!(h.coordinator.active_call().await.is_none());

    // A second cancel has no session left to land on.
    h.coordinator
        .handle_server_event(&ServerEvent::CallCancelled { from: PEER })
        .await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, ClientEvent::CallLog(_)),
            "the terminal log must be emitted once"
        );
    }
}

#[tokio::test]
async fn unanswered_outbound_ring_cancels() {
    let h = harness().await;
    let mut events = h.events.subscribe();
    h.coordinator
        .start_call(PEER, CallType::Voice)
        .await
        .expect("call starts");
    let record = wait_for_log(&mut events).await;
    assert_eq!(record.outcome, CallOutcome::Cancelled);
    let frames = call_frames(&h.channel).await;
    assert!(matches!(frames.last(), Some(ClientRequest::CancelCall { to: PEER })));
}

#[tokio::test]
async fn unanswered_inbound_ring_is_missed() {
    let h = harness().await;
    let mut events = h.events.subscribe();
    h.coordinator
        .handle_server_event(&ServerEvent::IncomingCall {
            from: caller(PEER),
            call_type: CallType::Voice,
        })
        .await;
    let record = wait_for_log(&mut events).await;
    assert_eq!(record.outcome, CallOutcome::Missed);
    assert!(call_frames(&h.channel).await.is_empty());
}

#[tokio::test]
async fn second_call_is_rejected_busy() {
    let h = harness().await;
    h.coordinator
        .start_call(PEER, CallType::Voice)
        .await
        .expect("call starts");
    let mut events = h.events.subscribe();

    assert!(matches!(
        h.coordinator.start_call(OTHER, CallType::Voice).await,
        Err(CallError::Busy)
    ));

    h.coordinator
        .handle_server_event(&ServerEvent::IncomingCall {
            from: caller(OTHER),
            call_type: CallType::Voice,
        })
        .await;
    let frames = call_frames(&h.channel).await;
    assert!(matches!(
        frames.last(),
        Some(ClientRequest::RejectCall { to: OTHER, reason: Some(reason) }) if reason == "busy"
    ));
    assert_eq!(
        h.coordinator.active_call().await.expect("original call").peer,
        PEER
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, ClientEvent::IncomingCall { .. }),
            "busy calls must not surface"
        );
    }
}

#[tokio::test]
async fn media_failure_faults_then_fails_the_call() {
    let h = harness().await;
    h.media.fail_media();
    let mut events = h.events.subscribe();

    let result = h.coordinator.start_call(PEER, CallType::Voice).await;
    assert!(matches!(result, Err(CallError::Media(_))));

    let message = loop {
        if let ClientEvent::CallFault { message, .. } = recv_event(&mut events).await {
            break message;
        }
    };
    assert!(message.contains("no capture device"));

    // The grace period lapses, then the terminal log lands.
    let record = wait_for_log(&mut events).await;
    assert_eq!(record.outcome, CallOutcome::Failed);
    assert!(record.connected_at.is_none());
    // The peer never heard about this call.
    assert!(call_frames(&h.channel).await.is_empty());
    assert!(h.media.op_log().await.is_empty());
}

#[tokio::test]
async fn transport_failure_ends_the_call() {
    let h = harness().await;
    let mut events = h.events.subscribe();
    h.coordinator
        .start_call(PEER, CallType::Voice)
        .await
        .expect("call starts");
    h.coordinator
        .handle_server_event(&ServerEvent::CallAccepted { from: PEER })
        .await;
    h.media
        .emit(PeerConnectionEvent::TransportStateChanged(TransportState::Failed));
    let record = wait_for_log(&mut events).await;
    assert_eq!(record.outcome, CallOutcome::Failed);
}

#[tokio::test]
async fn remote_track_promotes_and_remote_end_completes() {
    let h = harness().await;
    let mut events = h.events.subscribe();
    h.coordinator
        .handle_server_event(&ServerEvent::IncomingCall {
            from: caller(PEER),
            call_type: CallType::Video,
        })
        .await;
    h.coordinator.accept_call().await.expect("accepts");
    h.coordinator
        .handle_server_event(&ServerEvent::CallOffer {
            from: PEER,
            sdp: "their-offer".into(),
        })
        .await;

    h.media.emit(PeerConnectionEvent::RemoteTrackAdded {
        track_id: "track-9".into(),
        kind: TrackKind::Video,
    });
    wait_for_phase(&mut events, CallPhase::Connected).await;
    let (track_id, kind) = loop {
        if let ClientEvent::CallRemoteTrack { track_id, kind, .. } = recv_event(&mut events).await {
            break (track_id, kind);
        }
    };
    assert_eq!(track_id, "track-9");
    assert_eq!(kind, TrackKind::Video);

    h.coordinator
        .handle_server_event(&ServerEvent::CallEnded { from: PEER })
        .await;
    let record = wait_for_log(&mut events).await;
    assert_eq!(record.outcome, CallOutcome::Completed);
    assert!(record.connected_at.is_some());
}

#[tokio::test]
async fn hangup_mid_negotiation_is_cancelled() {
    let h = harness().await;
    let mut events = h.events.subscribe();
    h.coordinator
        .start_call(PEER, CallType::Voice)
        .await
        .expect("call starts");
    h.coordinator
        .handle_server_event(&ServerEvent::CallAccepted { from: PEER })
        .await;
    h.coordinator.hang_up().await.expect("hangs up");

    let frames = call_frames(&h.channel).await;
    assert!(matches!(frames.last(), Some(ClientRequest::EndCall { to: PEER })));
    let record = wait_for_log(&mut events).await;
    assert_eq!(record.outcome, CallOutcome::Cancelled);
    assert!(h.coordinator.active_call().await.is_none());
}

#[tokio::test]
async fn signals_from_other_users_are_dropped() {
    let h = harness().await;
    h.coordinator
        .start_call(PEER, CallType::Voice)
        .await
        .expect("call starts");
    h.coordinator
        .handle_server_event(&ServerEvent::CallAccepted { from: OTHER })
        .await;
    assert_eq!(ops_named(&h.media, "create_offer").await, 0);
    assert_eq!(
        h.coordinator.active_call().await.expect("still ringing").phase,
        CallPhase::Ringing
    );
}

#[tokio::test]
async fn local_candidates_are_relayed_to_the_peer() {
    let h = harness().await;
    h.coordinator
        .start_call(PEER, CallType::Voice)
        .await
        .expect("call starts");
    h.media.emit(PeerConnectionEvent::IceCandidate(IceCandidate {
        candidate: "local-c1".into(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
    }));
    let frames = wait_for_call_frames(&h.channel, 2).await;
    match &frames[1] {
        ClientRequest::IceCandidate { to, candidate } => {
            assert_eq!(*to, PEER);
            assert_eq!(candidate.candidate, "local-c1");
        }
        other => panic!("expected a candidate frame, got {other:?}"),
    }
}

#[tokio::test]
async fn call_controls_require_a_matching_session() {
    let h = harness().await;
    assert!(matches!(
        h.coordinator.accept_call().await,
        Err(CallError::NoActiveCall)
    ));
    assert!(matches!(
        h.coordinator.hang_up().await,
        Err(CallError::NoActiveCall)
    ));

    h.coordinator
        .start_call(PEER, CallType::Voice)
        .await
        .expect("call starts");
    // The outbound side cannot accept its own call.
    assert!(matches!(
        h.coordinator.accept_call().await,
        Err(CallError::NotRinging)
    ));
}
