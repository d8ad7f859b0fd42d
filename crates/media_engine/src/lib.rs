use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn voice() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    pub fn video() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerConnectionEvent {
    IceCandidate(IceCandidate),
    TransportStateChanged(TransportState),
    RemoteTrackAdded { track_id: String, kind: TrackKind },
}

/// Captured local media. Held by the call session for the lifetime of the
/// call and stopped on teardown.
#[async_trait]
pub trait LocalMediaHandle: Send + Sync {
    fn constraints(&self) -> MediaConstraints;
    async fn stop(&self);
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn attach_local_media(&self, media: Arc<dyn LocalMediaHandle>) -> anyhow::Result<()>;
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;
    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> anyhow::Result<()>;
    async fn set_remote_description(&self, description: SessionDescription)
        -> anyhow::Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;
    fn subscribe_events(&self) -> broadcast::Receiver<PeerConnectionEvent>;
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn get_local_media(
        &self,
        constraints: MediaConstraints,
    ) -> anyhow::Result<Arc<dyn LocalMediaHandle>>;
    async fn create_peer_connection(
        &self,
        ice_servers: &[IceServer],
    ) -> anyhow::Result<Arc<dyn PeerConnection>>;
}
