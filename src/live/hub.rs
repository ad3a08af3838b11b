use chrono::Utc;
use league_api::{CanonicalGame, League};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Connected,
    Update,
    Error,
}

/// One change notification as it goes over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: i64,
    pub league: League,
    #[serde(default)]
    pub changed_records: Vec<CanonicalGame>,
    /// Position in the hub's history; only update events carry one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl LiveEvent {
    pub fn connected(league: League) -> Self {
        Self {
            kind: EventKind::Connected,
            timestamp: Utc::now().timestamp(),
            league,
            changed_records: Vec::new(),
            sequence: None,
            message: None,
        }
    }

    pub fn error(league: League, message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Error,
            message: Some(message.into()),
            ..Self::connected(league)
        }
    }

    fn update(league: League, sequence: u64, changed_records: Vec<CanonicalGame>) -> Self {
        Self {
            kind: EventKind::Update,
            sequence: Some(sequence),
            changed_records,
            ..Self::connected(league)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    pub emit_interval_ms: u64,
    /// Update events retained for polling consumers.
    pub history: usize,
    /// Per-league broadcast buffer; a consumer further behind than this lags.
    pub channel_capacity: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self { emit_interval_ms: 1_000, history: 256, channel_capacity: 512 }
    }
}

impl LiveConfig {
    pub fn emit_interval(&self) -> Duration {
        Duration::from_millis(self.emit_interval_ms.max(1))
    }
}

struct HubInner {
    config: LiveConfig,
    channels: HashMap<League, broadcast::Sender<LiveEvent>>,
    /// Changes waiting for the next emission, deduplicated by game id.
    pending: Mutex<HashMap<League, BTreeMap<String, CanonicalGame>>>,
    history: Mutex<VecDeque<LiveEvent>>,
    sequence: AtomicU64,
}

/// Per-league fan-out of changed records. Ingestion publishes into a buffer;
/// the emitter drains it on a fixed interval so consumers receive at most one
/// update per league per interval.
#[derive(Clone)]
pub struct LiveHub {
    inner: Arc<HubInner>,
}

impl LiveHub {
    pub fn new(config: LiveConfig) -> Self {
        let capacity = config.channel_capacity.max(1);
        let channels = League::ALL
            .iter()
            .map(|league| (*league, broadcast::channel(capacity).0))
            .collect();
        Self {
            inner: Arc::new(HubInner {
                config,
                channels,
                pending: Mutex::new(HashMap::new()),
                history: Mutex::new(VecDeque::new()),
                sequence: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &LiveConfig {
        &self.inner.config
    }

    /// Dropping the returned subscription unsubscribes.
    pub fn subscribe(&self, league: League) -> Subscription {
        Subscription { league, rx: self.sender(league).subscribe() }
    }

    pub fn subscriber_count(&self, league: League) -> usize {
        self.sender(league).receiver_count()
    }

    fn sender(&self, league: League) -> &broadcast::Sender<LiveEvent> {
        // every league gets a channel at construction
        &self.inner.channels[&league]
    }

    /// Queue changed records for the next emission. Never blocks on consumers.
    pub fn publish(&self, league: League, records: Vec<CanonicalGame>) {
        let mut pending = self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let buffer = pending.entry(league).or_default();
        for record in records {
            buffer.insert(record.id.clone(), record);
        }
        trace!("{league}: {} changes pending", buffer.len());
    }

    /// Emit one update event per league with pending changes. Returns the
    /// number of events emitted.
    pub fn flush(&self) -> usize {
        let drained: Vec<(League, BTreeMap<String, CanonicalGame>)> = {
            let mut pending = self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let mut drained: Vec<_> = pending.drain().filter(|(_, b)| !b.is_empty()).collect();
            drained.sort_by_key(|(league, _)| *league);
            drained
        };

        let emitted = drained.len();
        for (league, records) in drained {
            // sequence assigned under the history lock so `since` never hands
            // out a cursor ahead of the retained events
            let event = {
                let mut history = self.inner.history.lock().unwrap_or_else(PoisonError::into_inner);
                let sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1;
                let event = LiveEvent::update(league, sequence, records.into_values().collect());
                history.push_back(event.clone());
                while history.len() > self.inner.config.history {
                    history.pop_front();
                }
                event
            };
            let sequence = event.sequence.unwrap_or_default();

            // no subscribers is not an error; pollers read the history
            let receivers = self.sender(league).send(event).unwrap_or(0);
            debug!("{league}: update #{sequence} sent to {receivers} subscribers");
        }
        emitted
    }

    /// Latest assigned sequence number.
    pub fn cursor(&self) -> u64 {
        self.inner.sequence.load(Ordering::SeqCst)
    }

    /// Retained update events after `cursor`, optionally for one league, and
    /// the cursor to resume from.
    pub fn since(&self, league: Option<League>, cursor: u64) -> (u64, Vec<LiveEvent>) {
        let history = self.inner.history.lock().unwrap_or_else(PoisonError::into_inner);
        let events = history
            .iter()
            .filter(|e| e.sequence.is_some_and(|seq| seq > cursor))
            .filter(|e| league.is_none_or(|l| l == e.league))
            .cloned()
            .collect();
        (self.cursor(), events)
    }

    /// Flush on a fixed interval until the process exits.
    pub async fn run_emitter(self) {
        let mut ticker = tokio::time::interval(self.inner.config.emit_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.flush();
        }
    }
}

/// A consumer's view of one league's events.
pub struct Subscription {
    league: League,
    rx: broadcast::Receiver<LiveEvent>,
}

impl Subscription {
    pub fn league(&self) -> League {
        self.league
    }

    /// Next event, or `None` once the hub is gone. A consumer that fell behind
    /// gets an error event saying how many updates it missed, then resumes.
    pub async fn next(&mut self) -> Option<LiveEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(RecvError::Lagged(missed)) => Some(LiveEvent::error(
                self.league,
                format!("consumer lagged; {missed} updates dropped"),
            )),
            Err(RecvError::Closed) => None,
        }
    }
}
