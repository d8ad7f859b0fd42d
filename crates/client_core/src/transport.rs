use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use shared::protocol::{ClientRequest, ServerEvent};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid server url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One live, ordered, bidirectional connection to the server. Implementations
/// must deliver inbound events in the order the server sent them and report
/// closure by returning `None` from `next_event`.
#[async_trait]
pub trait EventChannel: Send + Sync {
    async fn send(&self, request: ClientRequest) -> Result<(), TransportError>;
    async fn next_event(&self) -> Option<ServerEvent>;
    async fn close(&self);
}

#[async_trait]
pub trait EventChannelConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn EventChannel>, TransportError>;
}

/// Maps the HTTP endpoint users configure onto the websocket endpoint the
/// event channel lives at.
pub fn event_channel_url(server_url: &str) -> Result<Url, TransportError> {
    let trimmed = server_url.trim_end_matches('/');
    let ws_url = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}/ws")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}/ws")
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        format!("{trimmed}/ws")
    } else {
        return Err(TransportError::InvalidUrl {
            url: server_url.to_string(),
            reason: "expected an http://, https://, ws:// or wss:// url".into(),
        });
    };

    Url::parse(&ws_url).map_err(|error| TransportError::InvalidUrl {
        url: server_url.to_string(),
        reason: error.to_string(),
    })
}

pub struct WsConnector {
    endpoint: Url,
}

impl WsConnector {
    pub fn new(server_url: &str) -> Result<Self, TransportError> {
        Ok(Self {
            endpoint: event_channel_url(server_url)?,
        })
    }
}

#[async_trait]
impl EventChannelConnector for WsConnector {
    async fn connect(&self) -> Result<Arc<dyn EventChannel>, TransportError> {
        let (stream, _) = connect_async(self.endpoint.as_str()).await?;
        let (writer, reader) = stream.split();
        debug!(endpoint = %self.endpoint, "ws: channel opened");
        Ok(Arc::new(WsEventChannel {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        }))
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsEventChannel {
    writer: Mutex<SplitSink<WsStream, Message>>,
    reader: Mutex<SplitStream<WsStream>>,
}

#[async_trait]
impl EventChannel for WsEventChannel {
    async fn send(&self, request: ClientRequest) -> Result<(), TransportError> {
        let text = serde_json::to_string(&request)?;
        let mut writer = self.writer.lock().await;
        writer.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn next_event(&self) -> Option<ServerEvent> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                    Ok(event) => return Some(event),
                    Err(error) => {
                        warn!("ws: skipping malformed frame: {error}");
                    }
                },
                Some(Ok(Message::Binary(_))) => {
                    debug!("ws: ignoring binary frame");
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) => return None,
                Some(Err(error)) => {
                    warn!("ws: read failed: {error}");
                    return None;
                }
                None => return None,
            }
        }
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.send(Message::Close(None)).await;
    }
}
