//! SQLite-backed canonical record set and ingestion run log.
//!
//! Every write goes through one connection guarded by a mutex and runs in an
//! `IMMEDIATE` transaction, so two passes racing on the same game id are
//! serialized and neither update is lost.

use crate::orchestrator::{IngestionRun, RunKind, RunOutcome};
use league_api::{CanonicalGame, CanonicalStanding, CanonicalTeam, GameStatus, League};
use log::debug;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::task::JoinError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store task failed: {0}")]
    Task(#[from] JoinError),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// What an upsert did to the target row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// The row existed. `changed` is false when the incoming record only
    /// refreshed `updated_at`.
    Updated { changed: bool },
}

impl UpsertOutcome {
    pub fn is_change(&self) -> bool {
        !matches!(self, UpsertOutcome::Updated { changed: false })
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS games (
    id           TEXT PRIMARY KEY,
    league       TEXT NOT NULL,
    external_id  TEXT NOT NULL,
    season_id    TEXT NOT NULL,
    home_team_id TEXT NOT NULL,
    away_team_id TEXT NOT NULL,
    scheduled_at INTEGER NOT NULL,
    status       TEXT NOT NULL,
    home_score   INTEGER,
    away_score   INTEGER,
    venue        TEXT,
    attendance   INTEGER,
    updated_at   INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS games_league_scheduled ON games (league, scheduled_at);

CREATE TABLE IF NOT EXISTS ingestion_runs (
    id                TEXT PRIMARY KEY,
    league            TEXT NOT NULL,
    kind              TEXT NOT NULL,
    scope             TEXT NOT NULL,
    outcome           TEXT NOT NULL,
    started_at        INTEGER NOT NULL,
    completed_at      INTEGER,
    records_processed INTEGER NOT NULL,
    records_inserted  INTEGER NOT NULL,
    records_updated   INTEGER NOT NULL,
    records_failed    INTEGER NOT NULL,
    errors            TEXT NOT NULL,
    error_message     TEXT
);
CREATE INDEX IF NOT EXISTS ingestion_runs_started ON ingestion_runs (started_at DESC);

CREATE TABLE IF NOT EXISTS teams (
    id           TEXT PRIMARY KEY,
    league       TEXT NOT NULL,
    external_id  TEXT NOT NULL,
    name         TEXT NOT NULL,
    abbreviation TEXT,
    location     TEXT
);

CREATE TABLE IF NOT EXISTS standings (
    league     TEXT NOT NULL,
    season_id  TEXT NOT NULL,
    team_id    TEXT NOT NULL,
    wins       INTEGER NOT NULL,
    losses     INTEGER NOT NULL,
    ties       INTEGER NOT NULL,
    win_pct    REAL,
    rank       INTEGER,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (league, season_id, team_id)
);
";

const GAME_COLUMNS: &str = "id, league, external_id, season_id, home_team_id, away_team_id, \
    scheduled_at, status, home_score, away_score, venue, attendance, updated_at";

const RUN_COLUMNS: &str = "id, league, kind, scope, outcome, started_at, completed_at, \
    records_processed, records_inserted, records_updated, records_failed, errors";

pub struct CanonicalStore {
    conn: Mutex<Connection>,
}

impl CanonicalStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::bootstrap(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Run `op` against the store on tokio's blocking pool. Async callers go
    /// through here; the connection lock and sqlite I/O never sit on a
    /// runtime worker thread.
    pub async fn blocking<T, F>(self: &Arc<Self>, op: F) -> StoreResult<T>
    where
        F: FnOnce(&CanonicalStore) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || op(&store)).await?
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // a panic mid-transaction rolls back on drop, so the connection is still usable
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Games
    // -----------------------------------------------------------------------

    /// Insert the game, or overwrite its mutable fields (status, scores,
    /// attendance, updated_at) if the id already exists. Identity columns are
    /// never rewritten.
    pub fn upsert_game(&self, game: &CanonicalGame) -> StoreResult<UpsertOutcome> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = tx
            .query_row(
                &format!("SELECT {GAME_COLUMNS} FROM games WHERE id = ?1"),
                params![game.id],
                game_from_row,
            )
            .optional()?;

        let outcome = match existing {
            None => {
                tx.execute(
                    &format!(
                        "INSERT INTO games ({GAME_COLUMNS}) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                    ),
                    params![
                        game.id,
                        game.league.code(),
                        game.external_id,
                        game.season_id,
                        game.home_team_id,
                        game.away_team_id,
                        game.scheduled_at,
                        game.status.as_str(),
                        game.home_score,
                        game.away_score,
                        game.venue,
                        game.attendance,
                        game.updated_at,
                    ],
                )?;
                UpsertOutcome::Inserted
            }
            Some(stored) => {
                tx.execute(
                    "UPDATE games
                     SET status = ?2, home_score = ?3, away_score = ?4, attendance = ?5, updated_at = ?6
                     WHERE id = ?1",
                    params![
                        game.id,
                        game.status.as_str(),
                        game.home_score,
                        game.away_score,
                        game.attendance,
                        game.updated_at,
                    ],
                )?;
                if stored.status != game.status {
                    debug!("{}: status {} -> {}", game.id, stored.status.as_str(), game.status.as_str());
                }
                UpsertOutcome::Updated { changed: stored.mutable_fields_differ(game) }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    pub fn get_game(&self, id: &str) -> StoreResult<Option<CanonicalGame>> {
        let conn = self.conn();
        let game = conn
            .query_row(
                &format!("SELECT {GAME_COLUMNS} FROM games WHERE id = ?1"),
                params![id],
                game_from_row,
            )
            .optional()?;
        Ok(game)
    }

    pub fn count_games(&self, league: Option<League>) -> StoreResult<usize> {
        let conn = self.conn();
        let count: i64 = match league {
            Some(league) => conn.query_row(
                "SELECT COUNT(*) FROM games WHERE league = ?1",
                params![league.code()],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM games", [], |row| row.get(0))?,
        };
        Ok(count as usize)
    }

    // -----------------------------------------------------------------------
    // Reference data
    // -----------------------------------------------------------------------

    pub fn upsert_team(&self, team: &CanonicalTeam) -> StoreResult<UpsertOutcome> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing: Option<(String, Option<String>, Option<String>)> = tx
            .query_row(
                "SELECT name, abbreviation, location FROM teams WHERE id = ?1",
                params![team.id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        tx.execute(
            "INSERT INTO teams (id, league, external_id, name, abbreviation, location)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                abbreviation = excluded.abbreviation,
                location = excluded.location",
            params![
                team.id,
                team.league.code(),
                team.external_id,
                team.name,
                team.abbreviation,
                team.location,
            ],
        )?;
        tx.commit()?;

        Ok(match existing {
            None => UpsertOutcome::Inserted,
            Some((name, abbreviation, location)) => UpsertOutcome::Updated {
                changed: name != team.name
                    || abbreviation != team.abbreviation
                    || location != team.location,
            },
        })
    }

    pub fn upsert_standing(&self, standing: &CanonicalStanding) -> StoreResult<UpsertOutcome> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing: Option<(i64, i64, i64, Option<i64>)> = tx
            .query_row(
                "SELECT wins, losses, ties, rank FROM standings
                 WHERE league = ?1 AND season_id = ?2 AND team_id = ?3",
                params![standing.league.code(), standing.season_id, standing.team_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        tx.execute(
            "INSERT INTO standings
                (league, season_id, team_id, wins, losses, ties, win_pct, rank, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(league, season_id, team_id) DO UPDATE SET
                wins = excluded.wins,
                losses = excluded.losses,
                ties = excluded.ties,
                win_pct = excluded.win_pct,
                rank = excluded.rank,
                updated_at = excluded.updated_at",
            params![
                standing.league.code(),
                standing.season_id,
                standing.team_id,
                standing.wins,
                standing.losses,
                standing.ties,
                standing.win_pct,
                standing.rank,
                standing.updated_at,
            ],
        )?;
        tx.commit()?;

        Ok(match existing {
            None => UpsertOutcome::Inserted,
            Some(prev) => UpsertOutcome::Updated {
                changed: prev
                    != (standing.wins, standing.losses, standing.ties, standing.rank),
            },
        })
    }

    pub fn standings(&self, league: League, season_id: &str) -> StoreResult<Vec<CanonicalStanding>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT team_id, wins, losses, ties, win_pct, rank, updated_at FROM standings
             WHERE league = ?1 AND season_id = ?2
             ORDER BY rank IS NULL, rank, team_id",
        )?;
        let rows = stmt.query_map(params![league.code(), season_id], |row| {
            Ok(CanonicalStanding {
                league,
                season_id: season_id.to_owned(),
                team_id: row.get(0)?,
                wins: row.get(1)?,
                losses: row.get(2)?,
                ties: row.get(3)?,
                win_pct: row.get(4)?,
                rank: row.get(5)?,
                updated_at: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // -----------------------------------------------------------------------
    // Run log
    // -----------------------------------------------------------------------

    /// Persist a finalized run. Runs are append-only.
    pub fn record_run(&self, run: &IngestionRun) -> StoreResult<()> {
        let errors = serde_json::to_string(&run.errors)?;
        let error_message = (!run.errors.is_empty()).then(|| run.errors.join("; "));
        let conn = self.conn();
        conn.execute(
            &format!(
                "INSERT INTO ingestion_runs ({RUN_COLUMNS}, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                run.id,
                run.league.code(),
                run.kind.as_str(),
                run.scope,
                run.outcome.as_str(),
                run.started_at,
                run.completed_at,
                run.records_processed as i64,
                run.records_inserted as i64,
                run.records_updated as i64,
                run.records_failed as i64,
                errors,
                error_message,
            ],
        )?;
        Ok(())
    }

    /// Most recent runs first.
    pub fn recent_runs(&self, league: Option<League>, limit: usize) -> StoreResult<Vec<IngestionRun>> {
        let conn = self.conn();
        let limit = limit as i64;
        let raw = match league {
            Some(league) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RUN_COLUMNS} FROM ingestion_runs WHERE league = ?1
                     ORDER BY started_at DESC, rowid DESC LIMIT ?2"
                ))?;
                let rows = stmt
                    .query_map(params![league.code(), limit], raw_run_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RUN_COLUMNS} FROM ingestion_runs
                     ORDER BY started_at DESC, rowid DESC LIMIT ?1"
                ))?;
                let rows = stmt
                    .query_map(params![limit], raw_run_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        raw.into_iter()
            .map(|(mut run, errors)| {
                run.errors = serde_json::from_str(&errors)?;
                Ok(run)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn invalid_text(idx: usize) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(idx, "unrecognized value".into(), Type::Text)
}

fn league_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<League> {
    let code: String = row.get(idx)?;
    code.parse().map_err(|_| invalid_text(idx))
}

fn game_from_row(row: &Row<'_>) -> rusqlite::Result<CanonicalGame> {
    let status: String = row.get(7)?;
    Ok(CanonicalGame {
        id: row.get(0)?,
        league: league_at(row, 1)?,
        external_id: row.get(2)?,
        season_id: row.get(3)?,
        home_team_id: row.get(4)?,
        away_team_id: row.get(5)?,
        scheduled_at: row.get(6)?,
        status: GameStatus::parse(&status).ok_or_else(|| invalid_text(7))?,
        home_score: row.get(8)?,
        away_score: row.get(9)?,
        venue: row.get(10)?,
        attendance: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

/// The run plus its still-encoded error list.
fn raw_run_from_row(row: &Row<'_>) -> rusqlite::Result<(IngestionRun, String)> {
    let kind: String = row.get(2)?;
    let outcome: String = row.get(4)?;
    let run = IngestionRun {
        id: row.get(0)?,
        league: league_at(row, 1)?,
        kind: RunKind::parse(&kind).ok_or_else(|| invalid_text(2))?,
        scope: row.get(3)?,
        outcome: RunOutcome::parse(&outcome).ok_or_else(|| invalid_text(4))?,
        started_at: row.get(5)?,
        completed_at: row.get(6)?,
        records_processed: row.get::<_, i64>(7)? as u64,
        records_inserted: row.get::<_, i64>(8)? as u64,
        records_updated: row.get::<_, i64>(9)? as u64,
        records_failed: row.get::<_, i64>(10)? as u64,
        errors: Vec::new(),
    };
    Ok((run, row.get(11)?))
}
