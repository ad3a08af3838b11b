use crate::live::hub::LiveHub;
use crate::store::{CanonicalStore, StoreError, UpsertOutcome};
use chrono::{NaiveDate, Utc};
use league_api::client::{ApiError, ProviderAdapter};
use league_api::{CanonicalGame, League, Slate, SlateParams};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::Notify;

/// Longest accepted weekly backfill.
pub const MAX_BACKFILL_WEEKS: u32 = 25;
/// Longest accepted dated backfill, in days.
pub const MAX_BACKFILL_DAYS: i64 = 366;

// ---------------------------------------------------------------------------
// Run records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Slate,
    Backfill,
    Reference,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Slate => "slate",
            RunKind::Backfill => "backfill",
            RunKind::Reference => "reference",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "slate" => Some(RunKind::Slate),
            "backfill" => Some(RunKind::Backfill),
            "reference" => Some(RunKind::Reference),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Running,
    Succeeded,
    /// Completed, but some records or units failed.
    Partial,
    /// No upstream response could be obtained.
    Failed,
    Cancelled,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Running => "running",
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::Partial => "partial",
            RunOutcome::Failed => "failed",
            RunOutcome::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunOutcome::Running),
            "succeeded" => Some(RunOutcome::Succeeded),
            "partial" => Some(RunOutcome::Partial),
            "failed" => Some(RunOutcome::Failed),
            "cancelled" => Some(RunOutcome::Cancelled),
            _ => None,
        }
    }
}

/// Summary of one ingestion pass. Built up while the pass runs, then
/// finalized and persisted once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionRun {
    pub id: String,
    pub league: League,
    pub kind: RunKind,
    /// Human-readable unit or range, e.g. "week 3" or "weeks 1..18".
    pub scope: String,
    pub outcome: RunOutcome,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub records_processed: u64,
    pub records_inserted: u64,
    pub records_updated: u64,
    pub records_failed: u64,
    pub errors: Vec<String>,
}

impl IngestionRun {
    fn start(league: League, kind: RunKind, scope: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!(
                "{}-{}-{:04x}",
                league.code(),
                now.timestamp_millis(),
                rand::random::<u16>()
            ),
            league,
            kind,
            scope: scope.into(),
            outcome: RunOutcome::Running,
            started_at: now.timestamp(),
            completed_at: None,
            records_processed: 0,
            records_inserted: 0,
            records_updated: 0,
            records_failed: 0,
            errors: Vec::new(),
        }
    }

    fn fail_record(&mut self, error: impl fmt::Display) {
        self.records_failed += 1;
        self.errors.push(error.to_string());
    }

    fn finish(&mut self, outcome: Option<RunOutcome>) {
        self.completed_at = Some(Utc::now().timestamp());
        self.outcome = outcome.unwrap_or(if self.errors.is_empty() && self.records_failed == 0 {
            RunOutcome::Succeeded
        } else {
            RunOutcome::Partial
        });
    }
}

// ---------------------------------------------------------------------------
// Errors, ranges, cancellation
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("an ingestion pass for {0} is already running")]
    AlreadyRunning(League),
    #[error("no provider configured for {0}")]
    NotConfigured(League),
    #[error("invalid backfill range: {0}")]
    InvalidRange(String),
    /// No upstream response at all; the failed run has been persisted.
    #[error("{} run {} failed: {source}", .run.league, .run.id)]
    Upstream {
        run: Box<IngestionRun>,
        #[source]
        source: ApiError,
    },
    #[error("{} run {} cancelled after {} records", .run.league, .run.id, .run.records_processed)]
    Cancelled { run: Box<IngestionRun> },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    /// The persisted run behind a run-level failure, if there is one.
    pub fn run(&self) -> Option<&IngestionRun> {
        match self {
            IngestError::Upstream { run, .. } | IngestError::Cancelled { run } => Some(run),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillRange {
    Weeks { start: u32, end: u32 },
    Dates { start: NaiveDate, end: NaiveDate },
}

impl BackfillRange {
    pub fn validate(&self) -> Result<(), IngestError> {
        match *self {
            BackfillRange::Weeks { start, end } => {
                if start == 0 || end < start {
                    return Err(IngestError::InvalidRange(format!("weeks {start}..{end}")));
                }
                if end - start + 1 > MAX_BACKFILL_WEEKS {
                    return Err(IngestError::InvalidRange(format!(
                        "weeks {start}..{end} spans more than {MAX_BACKFILL_WEEKS} weeks"
                    )));
                }
            }
            BackfillRange::Dates { start, end } => {
                if end < start {
                    return Err(IngestError::InvalidRange(format!("{start}..{end} is inverted")));
                }
                if (end - start).num_days() + 1 > MAX_BACKFILL_DAYS {
                    return Err(IngestError::InvalidRange(format!(
                        "{start}..{end} spans more than {MAX_BACKFILL_DAYS} days"
                    )));
                }
            }
        }
        Ok(())
    }

    /// One slate query per unit, in order.
    pub fn units(&self, season: Option<i32>) -> Vec<SlateParams> {
        match *self {
            BackfillRange::Weeks { start, end } => {
                (start..=end).map(|week| SlateParams::week(season, week)).collect()
            }
            BackfillRange::Dates { start, end } => start
                .iter_days()
                .take_while(|day| *day <= end)
                .map(|day| SlateParams::date(season, day))
                .collect(),
        }
    }
}

impl fmt::Display for BackfillRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackfillRange::Weeks { start, end } => write!(f, "weeks {start}..{end}"),
            BackfillRange::Dates { start, end } => write!(f, "{start}..{end}"),
        }
    }
}

/// Cooperative cancellation for long backfills, checked between units.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Held while a pass runs; releases the league on drop.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<League>>,
    released: &'a Notify,
    league: League,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.league);
        self.released.notify_waiters();
    }
}

pub struct IngestionOrchestrator {
    adapters: HashMap<League, ProviderAdapter>,
    store: Arc<CanonicalStore>,
    hub: Option<LiveHub>,
    in_flight: Mutex<HashSet<League>>,
    released: Notify,
}

impl IngestionOrchestrator {
    pub fn new(store: Arc<CanonicalStore>) -> Self {
        Self {
            adapters: HashMap::new(),
            store,
            hub: None,
            in_flight: Mutex::new(HashSet::new()),
            released: Notify::new(),
        }
    }

    pub fn with_adapter(mut self, adapter: ProviderAdapter) -> Self {
        self.adapters.insert(adapter.league(), adapter);
        self
    }

    pub fn with_hub(mut self, hub: LiveHub) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn store(&self) -> &Arc<CanonicalStore> {
        &self.store
    }

    pub fn leagues(&self) -> Vec<League> {
        let mut leagues: Vec<League> = self.adapters.keys().copied().collect();
        leagues.sort();
        leagues
    }

    pub fn adapter(&self, league: League) -> Option<&ProviderAdapter> {
        self.adapters.get(&league)
    }

    /// Leagues with a pass currently in flight.
    pub fn running(&self) -> Vec<League> {
        let mut running: Vec<League> = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect();
        running.sort();
        running
    }

    pub fn is_running(&self, league: League) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&league)
    }

    /// Resolves once no pass for `league` is in flight.
    pub async fn wait_idle(&self, league: League) {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            // register before checking so a release in between is not missed
            released.as_mut().enable();
            if !self.is_running(league) {
                return;
            }
            released.await;
        }
    }

    fn claim(&self, league: League) -> Result<(&ProviderAdapter, InFlight<'_>), IngestError> {
        let adapter = self.adapters.get(&league).ok_or(IngestError::NotConfigured(league))?;
        let mut set = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(league) {
            return Err(IngestError::AlreadyRunning(league));
        }
        Ok((adapter, InFlight { set: &self.in_flight, released: &self.released, league }))
    }

    /// Fetch one slate and upsert every record. Per-record problems are
    /// counted in the run; only a failed fetch fails the run as a whole.
    pub async fn run_slate(
        &self,
        league: League,
        params: SlateParams,
    ) -> Result<IngestionRun, IngestError> {
        let (adapter, _guard) = self.claim(league)?;
        let mut run = IngestionRun::start(league, RunKind::Slate, scope_of(&params));
        info!("{league}: starting {} pass ({})", run.scope, adapter.kind());

        match adapter.get_games(&params).await {
            Ok(slate) => {
                let changed = self.apply_slate(slate, &mut run).await;
                self.publish(league, changed);
                self.complete(run, None).await
            }
            Err(source) => {
                run.errors.push(source.to_string());
                let run = self.complete(run, Some(RunOutcome::Failed)).await?;
                Err(IngestError::Upstream { run: Box::new(run), source })
            }
        }
    }

    /// Run one slate pass per unit of `range`, sequentially, into a single
    /// aggregate run. A unit whose fetch fails is recorded and skipped; the
    /// backfill only fails if no unit got an upstream response.
    pub async fn backfill(
        &self,
        league: League,
        range: BackfillRange,
        season: Option<i32>,
        cancel: &CancelToken,
    ) -> Result<IngestionRun, IngestError> {
        range.validate()?;
        let (adapter, _guard) = self.claim(league)?;
        let units = range.units(season);
        let mut run = IngestionRun::start(league, RunKind::Backfill, range.to_string());
        info!("{league}: starting backfill over {range} ({} units)", units.len());

        let mut responded = false;
        let mut last_error = None;
        for params in units {
            if cancel.is_cancelled() {
                warn!("{league}: backfill cancelled before {}", params.unit);
                let run = self.complete(run, Some(RunOutcome::Cancelled)).await?;
                return Err(IngestError::Cancelled { run: Box::new(run) });
            }

            match adapter.get_games(&params).await {
                Ok(slate) => {
                    responded = true;
                    debug!("{league}: {} returned {} records", params.unit, slate.len());
                    let changed = self.apply_slate(slate, &mut run).await;
                    self.publish(league, changed);
                }
                Err(err) => {
                    warn!("{league}: {} failed: {err}", params.unit);
                    run.errors.push(format!("{}: {err}", params.unit));
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(source) if !responded => {
                let run = self.complete(run, Some(RunOutcome::Failed)).await?;
                Err(IngestError::Upstream { run: Box::new(run), source })
            }
            _ => self.complete(run, None).await,
        }
    }

    /// Refresh teams and standings for a league.
    pub async fn refresh_reference(
        &self,
        league: League,
        season: Option<i32>,
    ) -> Result<IngestionRun, IngestError> {
        let (adapter, _guard) = self.claim(league)?;
        let season = season.unwrap_or_else(|| league.season_for(Utc::now()));
        let mut run = IngestionRun::start(league, RunKind::Reference, format!("season {season}"));

        let mut responded = false;
        let mut last_error = None;

        match adapter.get_teams().await {
            Ok(teams) => {
                responded = true;
                run.records_processed += teams.len() as u64;
                let written = self
                    .store
                    .blocking(move |store| {
                        Ok(teams
                            .into_iter()
                            .map(|team| {
                                let outcome = store.upsert_team(&team);
                                (team.external_id, outcome)
                            })
                            .collect::<Vec<_>>())
                    })
                    .await?;
                for (external_id, outcome) in written {
                    match outcome {
                        Ok(outcome) => count(&mut run, outcome),
                        Err(e) => run.fail_record(format!("team {external_id}: {e}")),
                    }
                }
            }
            Err(err) => {
                run.errors.push(format!("teams: {err}"));
                last_error = Some(err);
            }
        }

        match adapter.get_standings(Some(season)).await {
            Ok(standings) => {
                responded = true;
                run.records_processed += standings.len() as u64;
                let written = self
                    .store
                    .blocking(move |store| {
                        Ok(standings
                            .into_iter()
                            .map(|standing| {
                                let outcome = store.upsert_standing(&standing);
                                (standing.team_id, outcome)
                            })
                            .collect::<Vec<_>>())
                    })
                    .await?;
                for (team_id, outcome) in written {
                    match outcome {
                        Ok(outcome) => count(&mut run, outcome),
                        Err(e) => run.fail_record(format!("standing {team_id}: {e}")),
                    }
                }
            }
            Err(err) => {
                run.errors.push(format!("standings: {err}"));
                last_error = Some(err);
            }
        }

        match last_error {
            Some(source) if !responded => {
                let run = self.complete(run, Some(RunOutcome::Failed)).await?;
                Err(IngestError::Upstream { run: Box::new(run), source })
            }
            _ => self.complete(run, None).await,
        }
    }

    /// Upsert a slate into the store, returning the records that changed.
    async fn apply_slate(&self, slate: Slate, run: &mut IngestionRun) -> Vec<CanonicalGame> {
        run.records_processed += slate.len() as u64;
        for rejected in slate.rejected {
            debug!("{}: {rejected}", run.league);
            run.fail_record(rejected);
        }

        let games = slate.games;
        let pending = games.len();
        let written = self
            .store
            .blocking(move |store| {
                Ok(games
                    .into_iter()
                    .map(|game| {
                        let outcome = store.upsert_game(&game);
                        (game, outcome)
                    })
                    .collect::<Vec<_>>())
            })
            .await;
        let written = match written {
            Ok(written) => written,
            Err(e) => {
                error!("{}: store task failed: {e}", run.league);
                run.records_failed += pending as u64;
                run.errors.push(format!("persisting {pending} games: {e}"));
                return Vec::new();
            }
        };

        let mut changed = Vec::new();
        for (game, outcome) in written {
            match outcome {
                Ok(outcome) => {
                    count(run, outcome);
                    if outcome.is_change() {
                        changed.push(game);
                    }
                }
                Err(e) => {
                    debug!("{}: persisting {} failed: {e}", run.league, game.id);
                    run.fail_record(format!("game {}: {e}", game.external_id));
                }
            }
        }
        changed
    }

    fn publish(&self, league: League, changed: Vec<CanonicalGame>) {
        if let Some(hub) = &self.hub
            && !changed.is_empty()
        {
            hub.publish(league, changed);
        }
    }

    async fn complete(
        &self,
        mut run: IngestionRun,
        outcome: Option<RunOutcome>,
    ) -> Result<IngestionRun, IngestError> {
        run.finish(outcome);
        let summary = format!(
            "{} {} run {} {}: processed={} inserted={} updated={} failed={}",
            run.league,
            run.kind.as_str(),
            run.id,
            run.outcome.as_str(),
            run.records_processed,
            run.records_inserted,
            run.records_updated,
            run.records_failed,
        );
        match run.outcome {
            RunOutcome::Failed => error!("{summary}"),
            _ => info!("{summary}"),
        }
        self.store
            .blocking(move |store| store.record_run(&run).map(|()| run))
            .await
            .map_err(IngestError::from)
    }
}

fn count(run: &mut IngestionRun, outcome: UpsertOutcome) {
    match outcome {
        UpsertOutcome::Inserted => run.records_inserted += 1,
        UpsertOutcome::Updated { .. } => run.records_updated += 1,
    }
}

fn scope_of(params: &SlateParams) -> String {
    match params.season {
        Some(season) => format!("{} ({season})", params.unit),
        None => params.unit.to_string(),
    }
}
