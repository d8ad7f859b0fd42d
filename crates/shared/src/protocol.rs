use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{CallType, MessageId, PresenceStatus, RoomId, UserId},
    error::ApiError,
};

/// Conversation addressed by a typing or read-state frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    Room { room_id: RoomId },
    User { user_id: UserId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    Authenticate {
        user_id: UserId,
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    Heartbeat,
    UserActive,
    JoinRoom {
        room_id: RoomId,
    },
    LeaveRoom {
        room_id: RoomId,
    },
    SendRoomMessage {
        room_id: RoomId,
        sender_id: UserId,
        content: String,
        sent_at: DateTime<Utc>,
    },
    SendPrivateMessage {
        to: UserId,
        sender_id: UserId,
        content: String,
        sent_at: DateTime<Utc>,
    },
    GetRoomMessages {
        room_id: RoomId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before: Option<MessageId>,
        limit: u32,
    },
    GetPrivateMessages {
        with: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before: Option<MessageId>,
        limit: u32,
    },
    Typing {
        target: Target,
    },
    StopTyping {
        target: Target,
    },
    MarkAsRead {
        target: Target,
    },
    MarkChatAsRead {
        with: UserId,
    },
    OpenChat {
        with: UserId,
    },
    CloseChat {
        with: UserId,
    },
    #[serde(rename = "initiate-call")]
    InitiateCall {
        to: UserId,
        call_type: CallType,
    },
    #[serde(rename = "call-accepted")]
    AcceptCall {
        to: UserId,
    },
    #[serde(rename = "call-rejected")]
    RejectCall {
        to: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename = "call-cancelled")]
    CancelCall {
        to: UserId,
    },
    #[serde(rename = "call-ended")]
    EndCall {
        to: UserId,
    },
    #[serde(rename = "call-offer")]
    CallOffer {
        to: UserId,
        sdp: String,
    },
    #[serde(rename = "call-answer")]
    CallAnswer {
        to: UserId,
        sdp: String,
    },
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        to: UserId,
        candidate: IceCandidatePayload,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallerInfo {
    pub user_id: UserId,
    pub username: String,
}

/// ICE candidate as relayed between peers. Field names follow the
/// RTCIceCandidate JSON shape so browser peers interoperate unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    pub user_id: UserId,
    pub username: String,
    pub status: PresenceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSummary {
    pub with: UserId,
    pub open: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    Authenticated {
        session_id: String,
    },
    AuthFailed {
        message: String,
    },
    RoomMessage {
        room_id: RoomId,
        message: MessagePayload,
    },
    /// Private messages carry the recipient; the conversation peer is the
    /// other side of whichever end the local user is.
    PrivateMessage {
        to: UserId,
        message: MessagePayload,
    },
    RoomMessages {
        room_id: RoomId,
        messages: Vec<MessagePayload>,
    },
    PrivateMessages {
        with: UserId,
        messages: Vec<MessagePayload>,
    },
    Typing {
        target: Target,
        user_id: UserId,
    },
    StopTyping {
        target: Target,
        user_id: UserId,
    },
    UserStatusChanged {
        user_id: UserId,
        status: PresenceStatus,
        #[serde(default)]
        last_active_at: Option<DateTime<Utc>>,
    },
    ChatVisibilityChanged {
        with: UserId,
        open: bool,
    },
    #[serde(rename = "incoming-call")]
    IncomingCall {
        from: CallerInfo,
        call_type: CallType,
    },
    #[serde(rename = "call-accepted")]
    CallAccepted {
        from: UserId,
    },
    #[serde(rename = "call-rejected")]
    CallRejected {
        from: UserId,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename = "call-cancelled")]
    CallCancelled {
        from: UserId,
    },
    #[serde(rename = "call-ended")]
    CallEnded {
        from: UserId,
    },
    #[serde(rename = "call-offer")]
    CallOffer {
        from: UserId,
        sdp: String,
    },
    #[serde(rename = "call-answer")]
    CallAnswer {
        from: UserId,
        sdp: String,
    },
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        from: UserId,
        candidate: IceCandidatePayload,
    },
    ForceLogout {
        #[serde(default)]
        reason: Option<String>,
    },
    UserSuspended {
        #[serde(default)]
        reason: Option<String>,
    },
    UserDeleted {
        #[serde(default)]
        reason: Option<String>,
    },
    Error(ApiError),
}
