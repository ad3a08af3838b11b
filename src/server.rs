//! HTTP surface: health, run log, manual triggers and the server side of the
//! live channel (WebSocket, event stream, polling).

use crate::live::client::Capabilities;
use crate::live::hub::{LiveEvent, LiveHub, Subscription};
use crate::live::transport::TransportKind;
use crate::orchestrator::IngestionOrchestrator;
use crate::state::messages::IngestRequest;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{NaiveDate, Utc};
use futures_util::stream::{self, Stream, StreamExt};
use league_api::resilience::{BreakerPhase, BreakerRegistry};
use league_api::{League, SlateParams};
use log::{debug, error, info};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

const DEFAULT_RUN_LIMIT: usize = 20;
const MAX_RUN_LIMIT: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<IngestionOrchestrator>,
    pub hub: LiveHub,
    pub breakers: Arc<BreakerRegistry>,
    pub triggers: mpsc::Sender<IngestRequest>,
    pub started_at: i64,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<IngestionOrchestrator>,
        hub: LiveHub,
        breakers: Arc<BreakerRegistry>,
        triggers: mpsc::Sender<IngestRequest>,
    ) -> Self {
        Self { orchestrator, hub, breakers, triggers, started_at: Utc::now().timestamp() }
    }
}

/// A JSON `{"error": ...}` body with a status.
#[derive(Debug)]
pub struct HttpError(StatusCode, String);

impl HttpError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self(StatusCode::BAD_REQUEST, message.into())
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self(StatusCode::NOT_FOUND, message.into())
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

fn parse_league(raw: &str) -> Result<League, HttpError> {
    raw.parse::<League>().map_err(|e| HttpError::bad_request(e.to_string()))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/runs", get(runs))
        .route("/trigger/{league}", post(trigger))
        .route("/live/capabilities", get(capabilities))
        .route("/live/ws", get(live_ws))
        .route("/live/sse", get(live_sse))
        .route("/live/poll", get(live_poll))
        .with_state(state)
}

pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("listening on http://{addr}");
    }
    axum::serve(listener, router(state)).with_graceful_shutdown(shutdown).await
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Result<Json<Value>, HttpError> {
    let breakers = state.breakers.snapshot();
    let degraded = breakers.iter().any(|b| b.state != BreakerPhase::Closed);

    let leagues = state.orchestrator.leagues();
    let last_runs = state
        .orchestrator
        .store()
        .blocking(move |store| {
            let mut last_runs = serde_json::Map::new();
            for league in leagues {
                let last = store.recent_runs(Some(league), 1)?;
                last_runs.insert(league.code().to_owned(), json!(last.first()));
            }
            Ok(last_runs)
        })
        .await
        .map_err(|e| HttpError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(json!({
        "status": if degraded { "degraded" } else { "ok" },
        "startedAt": state.started_at,
        "leagues": state.orchestrator.leagues(),
        "running": state.orchestrator.running(),
        "breakers": breakers,
        "lastRuns": last_runs,
        "liveCursor": state.hub.cursor(),
    })))
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    league: Option<String>,
    limit: Option<usize>,
}

async fn runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Value>, HttpError> {
    let league = query.league.as_deref().map(parse_league).transpose()?;
    let limit = query.limit.unwrap_or(DEFAULT_RUN_LIMIT).clamp(1, MAX_RUN_LIMIT);
    let runs = state
        .orchestrator
        .store()
        .blocking(move |store| store.recent_runs(league, limit))
        .await
        .map_err(|e| HttpError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({ "runs": runs })))
}

#[derive(Debug, Deserialize)]
struct TriggerQuery {
    week: Option<u32>,
    date: Option<NaiveDate>,
    season: Option<i32>,
}

/// Queue a slate pass. The pass itself runs on the ingest worker; the caller
/// follows it through `/runs`.
async fn trigger(
    State(state): State<AppState>,
    Path(league): Path<String>,
    Query(query): Query<TriggerQuery>,
) -> Result<(StatusCode, Json<Value>), HttpError> {
    let league = league
        .parse::<League>()
        .map_err(|e| HttpError::not_found(e.to_string()))?;
    if state.orchestrator.adapter(league).is_none() {
        return Err(HttpError::not_found(format!("{league} is not enabled")));
    }

    let params = match (query.week, query.date) {
        (Some(_), Some(_)) => return Err(HttpError::bad_request("pass either week or date, not both")),
        (Some(week), None) => SlateParams::week(query.season, week),
        (None, Some(date)) => SlateParams::date(query.season, date),
        (None, None) => SlateParams { season: query.season, ..SlateParams::current() },
    };

    match state.triggers.try_send(IngestRequest::Slate { league, params }) {
        Ok(()) => {
            debug!("{league}: manual {} pass queued", params.unit);
            Ok((
                StatusCode::ACCEPTED,
                Json(json!({ "league": league, "unit": params.unit.to_string(), "queued": true })),
            ))
        }
        Err(TrySendError::Full(_)) => Err(HttpError(
            StatusCode::SERVICE_UNAVAILABLE,
            "ingest queue is full".into(),
        )),
        Err(TrySendError::Closed(_)) => {
            error!("trigger for {league} dropped: ingest worker is gone");
            Err(HttpError(StatusCode::SERVICE_UNAVAILABLE, "ingest worker is not running".into()))
        }
    }
}

// ---------------------------------------------------------------------------
// Live channel
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LiveQuery {
    league: String,
}

async fn capabilities(State(state): State<AppState>) -> Json<Capabilities> {
    Json(Capabilities {
        transports: TransportKind::PREFERENCE.to_vec(),
        poll_interval_ms: state.hub.config().emit_interval_ms,
    })
}

async fn live_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<LiveQuery>,
) -> Result<Response, HttpError> {
    let league = parse_league(&query.league)?;
    // subscribe before the upgrade so nothing emitted meanwhile is missed
    let subscription = state.hub.subscribe(league);
    Ok(ws.on_upgrade(move |socket| stream_socket(socket, league, subscription)))
}

async fn send_event(socket: &mut WebSocket, event: &LiveEvent) -> bool {
    let Ok(text) = serde_json::to_string(event) else {
        return false;
    };
    socket.send(Message::Text(text.into())).await.is_ok()
}

async fn stream_socket(mut socket: WebSocket, league: League, mut subscription: Subscription) {
    debug!("{league}: websocket subscriber joined");
    if !send_event(&mut socket, &LiveEvent::connected(league)).await {
        return;
    }

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
            event = subscription.next() => {
                let Some(event) = event else { break };
                if !send_event(&mut socket, &event).await {
                    break;
                }
            }
        }
    }
    debug!("{league}: websocket subscriber left");
}

async fn live_sse(
    State(state): State<AppState>,
    Query(query): Query<LiveQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, HttpError> {
    let league = parse_league(&query.league)?;
    let subscription = state.hub.subscribe(league);

    let connected = stream::once(async move { LiveEvent::connected(league) });
    let updates = stream::unfold(subscription, |mut subscription| async move {
        subscription.next().await.map(|event| (event, subscription))
    });
    let events = connected
        .chain(updates)
        .map(|event| Event::default().json_data(&event));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
struct PollQuery {
    league: Option<String>,
    since: Option<u64>,
}

/// Without `since` the caller only learns where to start from.
async fn live_poll(
    State(state): State<AppState>,
    Query(query): Query<PollQuery>,
) -> Result<Json<Value>, HttpError> {
    let league = query.league.as_deref().map(parse_league).transpose()?;
    let (cursor, events) = match query.since {
        Some(since) => state.hub.since(league, since),
        None => (state.hub.cursor(), Vec::new()),
    };
    Ok(Json(json!({ "cursor": cursor, "events": events })))
}
