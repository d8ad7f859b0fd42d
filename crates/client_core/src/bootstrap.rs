use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use shared::domain::UserId;
use shared::protocol::{ChatSummary, RoomSummary, UserSummary};

/// REST reads that seed local state on every (re)connect: the room list,
/// the user directory, and the private-chat list.
#[async_trait]
pub trait DirectoryApi: Send + Sync {
    async fn fetch_rooms(&self) -> Result<Vec<RoomSummary>>;
    async fn fetch_users(&self) -> Result<Vec<UserSummary>>;
    async fn fetch_chats(&self, user_id: UserId) -> Result<Vec<ChatSummary>>;
}

pub struct HttpDirectoryApi {
    http: Client,
    base_url: String,
}

impl HttpDirectoryApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: Client::new(),
            base_url,
        }
    }
}

#[async_trait]
impl DirectoryApi for HttpDirectoryApi {
    async fn fetch_rooms(&self) -> Result<Vec<RoomSummary>> {
        let res = self
            .http
            .get(format!("{}/rooms", self.base_url))
            .send()
            .await?
            .error_for_status()?;
        res.json().await.context("failed to decode room list")
    }

    async fn fetch_users(&self) -> Result<Vec<UserSummary>> {
        let res = self
            .http
            .get(format!("{}/users", self.base_url))
            .send()
            .await?
            .error_for_status()?;
        res.json().await.context("failed to decode user directory")
    }

    async fn fetch_chats(&self, user_id: UserId) -> Result<Vec<ChatSummary>> {
        let res = self
            .http
            .get(format!("{}/users/{}/chats", self.base_url, user_id.0))
            .send()
            .await?
            .error_for_status()?;
        res.json().await.context("failed to decode chat list")
    }
}

pub struct MissingDirectoryApi;

#[async_trait]
impl DirectoryApi for MissingDirectoryApi {
    async fn fetch_rooms(&self) -> Result<Vec<RoomSummary>> {
        Err(anyhow!("directory api not configured"))
    }

    async fn fetch_users(&self) -> Result<Vec<UserSummary>> {
        Err(anyhow!("directory api not configured"))
    }

    async fn fetch_chats(&self, _user_id: UserId) -> Result<Vec<ChatSummary>> {
        Err(anyhow!("directory api not configured"))
    }
}
