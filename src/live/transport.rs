//! Interchangeable subscription backends for the live channel. Each backend
//! only knows how to open its transport and pull the next event; reconnect
//! policy lives in the client.

use crate::live::hub::LiveEvent;
use futures_util::stream::BoxStream;
use futures_util::{SinkExt, StreamExt};
use league_api::League;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Bidirectional push.
    WebSocket,
    /// Server-sent event stream.
    Sse,
    /// Fixed-interval polling.
    Polling,
}

impl TransportKind {
    /// Preference order when negotiating.
    pub const PREFERENCE: [TransportKind; 3] =
        [TransportKind::WebSocket, TransportKind::Sse, TransportKind::Polling];
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::Sse => "sse",
            TransportKind::Polling => "polling",
        })
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("server answered HTTP {0}")]
    Status(u16),
    #[error("connection closed")]
    Closed,
    #[error("read failed: {0}")]
    Read(String),
    #[error("undecodable event: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Start, pull events, stop. `next_event` returning an error means the
/// transport is gone and must be started again.
#[allow(async_fn_in_trait)]
pub trait Subscription {
    fn kind(&self) -> TransportKind;
    async fn start(&mut self) -> Result<(), TransportError>;
    async fn next_event(&mut self) -> Result<LiveEvent, TransportError>;
    async fn stop(&mut self);
}

/// Turn an `http(s)://` base into the matching `ws(s)://` base.
fn websocket_base(base: &str) -> String {
    if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_owned()
    }
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

pub struct WebSocketBackend {
    url: String,
    stream: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl WebSocketBackend {
    pub fn new(base: &str, league: League) -> Self {
        let url = format!("{}/live/ws?league={league}", websocket_base(base.trim_end_matches('/')));
        Self { url, stream: None }
    }
}

impl Subscription for WebSocketBackend {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn start(&mut self) -> Result<(), TransportError> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn next_event(&mut self) -> Result<LiveEvent, TransportError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(TransportError::Closed);
        };
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(serde_json::from_str(&text)?),
                Some(Ok(Message::Close(_))) | None => {
                    self.stream = None;
                    return Err(TransportError::Closed);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.stream = None;
                    return Err(TransportError::Read(e.to_string()));
                }
            }
        }
    }

    async fn stop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.send(Message::Close(None)).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Server-sent events
// ---------------------------------------------------------------------------

pub struct SseBackend {
    url: String,
    http: reqwest::Client,
    body: Option<BoxStream<'static, reqwest::Result<Vec<u8>>>>,
    /// Raw bytes; only complete frames are decoded.
    buffer: Vec<u8>,
}

impl SseBackend {
    pub fn new(base: &str, league: League, http: reqwest::Client) -> Self {
        let url = format!("{}/live/sse?league={league}", base.trim_end_matches('/'));
        Self { url, http, body: None, buffer: Vec::new() }
    }

    fn push_chunk(&mut self, chunk: &[u8]) {
        self.buffer.extend(chunk.iter().copied().filter(|&b| b != b'\r'));
    }

    /// Pop one complete event frame's `data` payload from the buffer.
    fn take_frame(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") else {
                return Ok(None);
            };
            let frame: Vec<u8> = self.buffer.drain(..end + 2).collect();
            let frame = std::str::from_utf8(&frame)
                .map_err(|e| TransportError::Read(format!("event stream is not UTF-8: {e}")))?;
            let data = frame
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|d| d.strip_prefix(' ').unwrap_or(d))
                .collect::<Vec<_>>()
                .join("\n");
            // comment-only frames are keep-alives
            if !data.is_empty() {
                return Ok(Some(data));
            }
        }
    }
}

impl Subscription for SseBackend {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn start(&mut self) -> Result<(), TransportError> {
        let response = self
            .http
            .get(&self.url)
            .header("accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }
        self.buffer.clear();
        self.body = Some(response.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec())).boxed());
        Ok(())
    }

    async fn next_event(&mut self) -> Result<LiveEvent, TransportError> {
        loop {
            if let Some(data) = self.take_frame()? {
                return Ok(serde_json::from_str(&data)?);
            }
            let Some(body) = self.body.as_mut() else {
                return Err(TransportError::Closed);
            };
            match body.next().await {
                Some(Ok(chunk)) => self.push_chunk(&chunk),
                Some(Err(e)) => {
                    self.body = None;
                    return Err(TransportError::Read(e.to_string()));
                }
                None => {
                    self.body = None;
                    return Err(TransportError::Closed);
                }
            }
        }
    }

    async fn stop(&mut self) {
        self.body = None;
        self.buffer.clear();
    }
}

// ---------------------------------------------------------------------------
// Polling
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PollResponse {
    cursor: u64,
    #[serde(default)]
    events: Vec<LiveEvent>,
}

pub struct PollingBackend {
    url: String,
    league: League,
    http: reqwest::Client,
    interval: Duration,
    cursor: Option<u64>,
    queue: VecDeque<LiveEvent>,
}

impl PollingBackend {
    pub fn new(base: &str, league: League, http: reqwest::Client, interval: Duration) -> Self {
        let url = format!("{}/live/poll?league={league}", base.trim_end_matches('/'));
        Self { url, league, http, interval, cursor: None, queue: VecDeque::new() }
    }

    async fn poll(&self, cursor: Option<u64>) -> Result<PollResponse, TransportError> {
        let url = match cursor {
            Some(cursor) => format!("{}&since={cursor}", self.url),
            None => self.url.clone(),
        };
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }
        let body = response.text().await.map_err(|e| TransportError::Read(e.to_string()))?;
        Ok(serde_json::from_str(&body)?)
    }
}

impl Subscription for PollingBackend {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    /// The first successful poll stands in for the push transports'
    /// `connected` event.
    async fn start(&mut self) -> Result<(), TransportError> {
        let first = self.poll(self.cursor).await?;
        self.queue.clear();
        self.queue.push_back(LiveEvent::connected(self.league));
        self.queue.extend(first.events);
        self.cursor = Some(first.cursor);
        Ok(())
    }

    async fn next_event(&mut self) -> Result<LiveEvent, TransportError> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Ok(event);
            }
            tokio::time::sleep(self.interval).await;
            let page = self.poll(self.cursor).await?;
            debug!("{}: poll returned {} events", self.league, page.events.len());
            self.cursor = Some(page.cursor);
            self.queue.extend(page.events);
        }
    }

    async fn stop(&mut self) {
        self.queue.clear();
    }
}

/// The backend chosen at startup.
pub enum Backend {
    WebSocket(WebSocketBackend),
    Sse(SseBackend),
    Polling(PollingBackend),
}

impl Subscription for Backend {
    fn kind(&self) -> TransportKind {
        match self {
            Backend::WebSocket(b) => b.kind(),
            Backend::Sse(b) => b.kind(),
            Backend::Polling(b) => b.kind(),
        }
    }

    async fn start(&mut self) -> Result<(), TransportError> {
        match self {
            Backend::WebSocket(b) => b.start().await,
            Backend::Sse(b) => b.start().await,
            Backend::Polling(b) => b.start().await,
        }
    }

    async fn next_event(&mut self) -> Result<LiveEvent, TransportError> {
        match self {
            Backend::WebSocket(b) => b.next_event().await,
            Backend::Sse(b) => b.next_event().await,
            Backend::Polling(b) => b.next_event().await,
        }
    }

    async fn stop(&mut self) {
        match self {
            Backend::WebSocket(b) => b.stop().await,
            Backend::Sse(b) => b.stop().await,
            Backend::Polling(b) => b.stop().await,
        }
    }
}
