use crate::live::hub::{EventKind, LiveEvent};
use crate::live::transport::{
    Backend, PollingBackend, SseBackend, Subscription, TransportKind, WebSocketBackend,
};
use league_api::League;
use log::{debug, error, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// A session this long counts as healthy even if it carried no updates.
const STABLE_SESSION: Duration = Duration::from_secs(30);

/// What a live endpoint offers, as answered by `GET /live/capabilities`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub transports: Vec<TransportKind>,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed connections tolerated before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 8,
        }
    }
}

impl ReconnectPolicy {
    /// `min(initial * 2^(attempt-1), max)` before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.initial_delay.saturating_mul(1u32 << exp).min(self.max_delay)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter_range = (base.as_millis() as u64) / 5;
        if jitter_range == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_range))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The server acknowledged the (re)connection.
    Connected { transport: TransportKind },
    Update(LiveEvent),
    /// Non-fatal error reported by the server, e.g. the consumer lagged.
    ServerError(String),
    /// The transport dropped; a reconnect follows.
    Disconnected { reason: String },
    /// Reconnect budget exhausted. Nothing follows.
    ConnectionError { attempts: u32, reason: String },
}

/// Consumer side of the live channel: probes once, picks the best transport
/// both ends support, and keeps it connected.
pub struct LiveClient {
    base_url: String,
    league: League,
    allowed: Vec<TransportKind>,
    reconnect: ReconnectPolicy,
    http: reqwest::Client,
    events: mpsc::Sender<ClientEvent>,
}

impl LiveClient {
    pub fn new(base_url: impl Into<String>, league: League, events: mpsc::Sender<ClientEvent>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            league,
            allowed: TransportKind::PREFERENCE.to_vec(),
            reconnect: ReconnectPolicy::default(),
            http: reqwest::Client::new(),
            events,
        }
    }

    /// Restrict the transports this client may use.
    pub fn allow(mut self, transports: &[TransportKind]) -> Self {
        self.allowed = transports.to_vec();
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub async fn probe(&self) -> Option<Capabilities> {
        let url = format!("{}/live/capabilities", self.base_url);
        let response = match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!("capability probe answered HTTP {}", response.status());
                return None;
            }
            Err(e) => {
                warn!("capability probe failed: {e}");
                return None;
            }
        };
        response.json::<Capabilities>().await.ok()
    }

    /// Best transport offered by the server and allowed here. Without a
    /// successful probe only polling is assumed to work.
    pub fn choose(&self, capabilities: Option<&Capabilities>) -> Option<TransportKind> {
        TransportKind::PREFERENCE.into_iter().find(|kind| {
            self.allowed.contains(kind)
                && match capabilities {
                    Some(caps) => caps.transports.contains(kind),
                    None => *kind == TransportKind::Polling,
                }
        })
    }

    fn backend(&self, kind: TransportKind, poll_interval: Duration) -> Backend {
        match kind {
            TransportKind::WebSocket => Backend::WebSocket(WebSocketBackend::new(&self.base_url, self.league)),
            TransportKind::Sse => Backend::Sse(SseBackend::new(&self.base_url, self.league, self.http.clone())),
            TransportKind::Polling => Backend::Polling(PollingBackend::new(
                &self.base_url,
                self.league,
                self.http.clone(),
                poll_interval,
            )),
        }
    }

    /// Negotiate, then connect and forward events until the receiver is
    /// dropped or the reconnect budget runs out.
    pub async fn run(self) {
        let capabilities = self.probe().await;
        let Some(kind) = self.choose(capabilities.as_ref()) else {
            let _ = self
                .events
                .send(ClientEvent::ConnectionError {
                    attempts: 0,
                    reason: "no allowed transport is offered".into(),
                })
                .await;
            return;
        };
        let poll_interval = capabilities
            .map(|c| Duration::from_millis(c.poll_interval_ms.max(100)))
            .unwrap_or(Duration::from_secs(5));
        let mut backend = self.backend(kind, poll_interval);
        info!("{}: live updates via {kind}", self.league);

        let mut failures = 0u32;
        loop {
            let reason = match backend.start().await {
                Ok(()) => {
                    let connected_at = Instant::now();
                    // the handshake alone does not prove the session works
                    let mut delivered = false;
                    let reason = loop {
                        tokio::select! {
                            _ = self.events.closed() => {
                                backend.stop().await;
                                return;
                            }
                            next = backend.next_event() => match next {
                                Ok(event) => {
                                    delivered |= event.kind != EventKind::Connected;
                                    if !self.forward(kind, event).await {
                                        backend.stop().await;
                                        return;
                                    }
                                }
                                Err(e) => break e.to_string(),
                            }
                        }
                    };
                    if delivered || connected_at.elapsed() >= STABLE_SESSION {
                        failures = 0;
                    }
                    if self.events.send(ClientEvent::Disconnected { reason: reason.clone() }).await.is_err() {
                        return;
                    }
                    reason
                }
                Err(e) => e.to_string(),
            };

            failures += 1;
            if failures > self.reconnect.max_attempts {
                error!("{}: giving up on {kind} after {failures} attempts: {reason}", self.league);
                let _ = self
                    .events
                    .send(ClientEvent::ConnectionError { attempts: failures, reason })
                    .await;
                return;
            }

            let delay = self.reconnect.delay(failures);
            warn!("{}: {kind} connection lost ({reason}); retry {failures} in {delay:?}", self.league);
            tokio::select! {
                _ = self.events.closed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn forward(&self, transport: TransportKind, event: LiveEvent) -> bool {
        debug!("{}: {:?} event", self.league, event.kind);
        let event = match event.kind {
            EventKind::Connected => ClientEvent::Connected { transport },
            EventKind::Update => ClientEvent::Update(event),
            EventKind::Error => ClientEvent::ServerError(event.message.unwrap_or_default()),
        };
        self.events.send(event).await.is_ok()
    }
}
