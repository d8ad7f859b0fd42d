mod coordinator;
mod session;

pub use coordinator::CallCoordinator;
pub use session::{CallSession, CallSnapshot};

use chrono::{DateTime, Duration as TimeDelta, Utc};
use shared::domain::{CallType, UserId};
use shared::protocol::IceCandidatePayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    Ringing,
    Connecting,
    Connected,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Initiator,
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Completed,
    Missed,
    Cancelled,
    Rejected,
    Failed,
}

/// Emitted exactly once per call session, on entering the terminal phase.
#[derive(Debug, Clone)]
pub struct CallLogRecord {
    pub peer: UserId,
    pub call_type: CallType,
    pub role: CallRole,
    pub outcome: CallOutcome,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    /// Zero unless the call reached `Connected`.
    pub duration: TimeDelta,
}

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("another call is already active")]
    Busy,
    #[error("no active call")]
    NoActiveCall,
    #[error("call is not ringing")]
    NotRinging,
    #[error("call already started")]
    AlreadyStarted,
    #[error("media setup failed: {0}")]
    Media(String),
    #[error("signaling failed: {0}")]
    Signaling(String),
}

/// Inbound signaling, already routed to the session it belongs to.
#[derive(Debug, Clone)]
pub(crate) enum CallSignal {
    Accepted,
    Rejected { reason: Option<String> },
    Cancelled,
    Ended,
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate(IceCandidatePayload),
}

#[cfg(test)]
#[path = "tests/call_tests.rs"]
mod call_tests;
