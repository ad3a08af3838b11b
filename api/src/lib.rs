pub mod cache;
pub mod client;
pub mod espn;
pub mod resilience;
pub mod sportsdata;
pub mod statsapi;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Leagues
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum League {
    Nfl,
    Nba,
    Mlb,
    Nhl,
}

impl League {
    pub const ALL: [League; 4] = [League::Nfl, League::Nba, League::Mlb, League::Nhl];

    pub fn code(&self) -> &'static str {
        match self {
            League::Nfl => "nfl",
            League::Nba => "nba",
            League::Mlb => "mlb",
            League::Nhl => "nhl",
        }
    }

    /// Football is scheduled in weeks; every other league publishes daily slates.
    pub fn uses_weekly_slates(&self) -> bool {
        matches!(self, League::Nfl)
    }

    /// Season label for a point in time. Leagues whose season straddles the
    /// new year are labelled by the year the season started.
    pub fn season_for(&self, at: DateTime<Utc>) -> i32 {
        match self {
            League::Mlb => at.year(),
            League::Nfl => {
                if at.month() <= 2 { at.year() - 1 } else { at.year() }
            }
            League::Nba | League::Nhl => {
                if at.month() <= 7 { at.year() - 1 } else { at.year() }
            }
        }
    }
}

impl fmt::Display for League {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown league: {0}")]
pub struct UnknownLeague(pub String);

impl FromStr for League {
    type Err = UnknownLeague;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nfl" => Ok(League::Nfl),
            "nba" => Ok(League::Nba),
            "mlb" => Ok(League::Mlb),
            "nhl" => Ok(League::Nhl),
            _ => Err(UnknownLeague(s.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------
// Canonical records, independent of any wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    #[default]
    Scheduled,
    Live,
    Final,
    Postponed,
    Cancelled,
}

impl GameStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameStatus::Scheduled => "scheduled",
            GameStatus::Live => "live",
            GameStatus::Final => "final",
            GameStatus::Postponed => "postponed",
            GameStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(GameStatus::Scheduled),
            "live" => Some(GameStatus::Live),
            "final" => Some(GameStatus::Final),
            "postponed" => Some(GameStatus::Postponed),
            "cancelled" => Some(GameStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalGame {
    pub id: String,
    pub league: League,
    pub external_id: String,
    pub season_id: String,
    pub home_team_id: String,
    pub away_team_id: String,
    /// Epoch seconds.
    pub scheduled_at: i64,
    pub status: GameStatus,
    pub home_score: Option<i64>,
    pub away_score: Option<i64>,
    pub venue: Option<String>,
    pub attendance: Option<i64>,
    pub updated_at: i64,
}

impl CanonicalGame {
    /// Deterministic row id. Two records with the same league and external id
    /// always land on the same row.
    pub fn canonical_id(league: League, external_id: &str) -> String {
        format!("{}-{}", league.code(), external_id.trim())
    }

    /// Whether any field an update is allowed to touch differs.
    pub fn mutable_fields_differ(&self, other: &CanonicalGame) -> bool {
        self.status != other.status
            || self.home_score != other.home_score
            || self.away_score != other.away_score
            || self.attendance != other.attendance
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalTeam {
    pub id: String,
    pub league: League,
    pub external_id: String,
    pub name: String,
    pub abbreviation: Option<String>,
    pub location: Option<String>,
}

impl CanonicalTeam {
    pub fn canonical_id(league: League, external_id: &str) -> String {
        format!("{}-team-{}", league.code(), external_id.trim())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalStanding {
    pub league: League,
    pub season_id: String,
    pub team_id: String,
    pub wins: i64,
    pub losses: i64,
    pub ties: i64,
    pub win_pct: Option<f64>,
    pub rank: Option<i64>,
    pub updated_at: i64,
}

/// Win percentage with ties counted as half a win.
pub fn win_pct(wins: i64, losses: i64, ties: i64) -> Option<f64> {
    let played = wins + losses + ties;
    if played <= 0 {
        return None;
    }
    Some((wins as f64 + ties as f64 / 2.0) / played as f64)
}

// ---------------------------------------------------------------------------
// Normalization output
// ---------------------------------------------------------------------------

/// A game as extracted from an upstream payload, before the required-field
/// check. Every optional field already carries its documented default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GameDraft {
    pub external_id: Option<String>,
    pub season: Option<String>,
    pub home_team: Option<String>,
    pub away_team: Option<String>,
    pub scheduled_at: Option<i64>,
    pub status: GameStatus,
    pub home_score: Option<i64>,
    pub away_score: Option<i64>,
    pub venue: Option<String>,
    pub attendance: Option<i64>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("game {external_id}: missing required field `{field}`")]
    Missing { external_id: String, field: &'static str },
    #[error("game {external_id}: invalid `{field}`: {reason}")]
    Invalid { external_id: String, field: &'static str, reason: String },
}

impl ValidationError {
    pub fn external_id(&self) -> &str {
        match self {
            ValidationError::Missing { external_id, .. }
            | ValidationError::Invalid { external_id, .. } => external_id,
        }
    }
}

const UNKNOWN_ID: &str = "<unknown>";

impl GameDraft {
    /// Check required fields and build the canonical record.
    ///
    /// `season_hint` is used when the payload carries no season; otherwise the
    /// season falls back to the calendar year of `scheduled_at`.
    pub fn validate(
        self,
        league: League,
        season_hint: Option<i32>,
        now: i64,
    ) -> Result<CanonicalGame, ValidationError> {
        let external_id = non_blank(self.external_id).ok_or_else(|| ValidationError::Missing {
            external_id: UNKNOWN_ID.into(),
            field: "externalId",
        })?;
        let missing = |field| ValidationError::Missing { external_id: external_id.clone(), field };

        let home = non_blank(self.home_team).ok_or_else(|| missing("homeTeamId"))?;
        let away = non_blank(self.away_team).ok_or_else(|| missing("awayTeamId"))?;
        let scheduled_at = self.scheduled_at.ok_or_else(|| missing("scheduledAt"))?;

        if home == away {
            return Err(ValidationError::Invalid {
                external_id,
                field: "awayTeamId",
                reason: format!("same team on both sides ({home})"),
            });
        }
        for (field, score) in [("homeScore", self.home_score), ("awayScore", self.away_score)] {
            if let Some(value) = score
                && value < 0
            {
                return Err(ValidationError::Invalid {
                    external_id,
                    field,
                    reason: format!("negative score {value}"),
                });
            }
        }

        let season_id = non_blank(self.season)
            .or_else(|| season_hint.map(|s| s.to_string()))
            .or_else(|| DateTime::from_timestamp(scheduled_at, 0).map(|dt| dt.year().to_string()))
            .ok_or_else(|| missing("seasonId"))?;

        Ok(CanonicalGame {
            id: CanonicalGame::canonical_id(league, &external_id),
            league,
            external_id,
            season_id,
            home_team_id: CanonicalTeam::canonical_id(league, &home),
            away_team_id: CanonicalTeam::canonical_id(league, &away),
            scheduled_at,
            status: self.status,
            home_score: self.home_score,
            away_score: self.away_score,
            venue: non_blank(self.venue),
            attendance: self.attendance.filter(|a| *a >= 0),
            updated_at: now,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_owned()).filter(|v| !v.is_empty())
}

/// A record the adapter could not turn into a canonical game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRecord {
    pub external_id: Option<String>,
    pub reason: String,
}

impl fmt::Display for RejectedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.external_id {
            Some(id) if !self.reason.contains(id.as_str()) => write!(f, "game {id}: {}", self.reason),
            _ => f.write_str(&self.reason),
        }
    }
}

impl From<ValidationError> for RejectedRecord {
    fn from(err: ValidationError) -> Self {
        let external_id = match err.external_id() {
            UNKNOWN_ID => None,
            id => Some(id.to_owned()),
        };
        RejectedRecord { external_id, reason: err.to_string() }
    }
}

/// One upstream query's worth of games.
#[derive(Debug, Clone, Default)]
pub struct Slate {
    pub games: Vec<CanonicalGame>,
    pub rejected: Vec<RejectedRecord>,
}

impl Slate {
    pub fn len(&self) -> usize {
        self.games.len() + self.rejected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Query parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlateUnit {
    /// Whatever the upstream considers today's slate.
    #[default]
    Current,
    Week(u32),
    Date(NaiveDate),
}

impl fmt::Display for SlateUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlateUnit::Current => f.write_str("current"),
            SlateUnit::Week(week) => write!(f, "week {week}"),
            SlateUnit::Date(date) => write!(f, "{date}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlateParams {
    pub season: Option<i32>,
    pub unit: SlateUnit,
}

impl SlateParams {
    pub fn current() -> Self {
        Self::default()
    }

    pub fn week(season: Option<i32>, week: u32) -> Self {
        Self { season, unit: SlateUnit::Week(week) }
    }

    pub fn date(season: Option<i32>, date: NaiveDate) -> Self {
        Self { season, unit: SlateUnit::Date(date) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn draft() -> GameDraft {
        GameDraft {
            external_id: Some("401547417".into()),
            season: Some("2024".into()),
            home_team: Some("12".into()),
            away_team: Some("7".into()),
            scheduled_at: Some(1_725_580_800),
            status: GameStatus::Final,
            home_score: Some(27),
            away_score: Some(20),
            venue: Some("  Arrowhead Stadium ".into()),
            attendance: None,
        }
    }

    #[test]
    fn canonical_id_is_pure_function_of_league_and_external_id() {
        assert_eq!(CanonicalGame::canonical_id(League::Nfl, "401547417"), "nfl-401547417");
        assert_eq!(
            CanonicalGame::canonical_id(League::Nfl, " 401547417 "),
            CanonicalGame::canonical_id(League::Nfl, "401547417")
        );
        assert_ne!(
            CanonicalGame::canonical_id(League::Nfl, "1"),
            CanonicalGame::canonical_id(League::Nhl, "1")
        );
    }

    #[test]
    fn validate_builds_canonical_record() {
        let game = draft().validate(League::Nfl, None, 99).unwrap();
        assert_eq!(game.id, "nfl-401547417");
        assert_eq!(game.home_team_id, "nfl-team-12");
        assert_eq!(game.away_team_id, "nfl-team-7");
        assert_eq!(game.venue.as_deref(), Some("Arrowhead Stadium"));
        assert_eq!(game.updated_at, 99);
    }

    #[test]
    fn validate_rejects_missing_team_id() {
        let err = GameDraft { away_team: Some("   ".into()), ..draft() }
            .validate(League::Nfl, None, 0)
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::Missing { external_id: "401547417".into(), field: "awayTeamId" }
        );
        let rejected = RejectedRecord::from(err);
        assert!(rejected.to_string().contains("401547417"));
    }

    #[test]
    fn validate_rejects_negative_scores_and_same_team() {
        assert!(GameDraft { home_score: Some(-1), ..draft() }.validate(League::Nfl, None, 0).is_err());
        assert!(GameDraft { away_team: Some("12".into()), ..draft() }.validate(League::Nfl, None, 0).is_err());
    }

    #[test]
    fn season_falls_back_to_hint_then_schedule_year() {
        let hinted = GameDraft { season: None, ..draft() }.validate(League::Nfl, Some(2023), 0).unwrap();
        assert_eq!(hinted.season_id, "2023");
        let derived = GameDraft { season: None, ..draft() }.validate(League::Nfl, None, 0).unwrap();
        assert_eq!(derived.season_id, "2024");
    }

    #[test]
    fn missing_external_id_rejects_without_id() {
        let rejected: RejectedRecord = GameDraft { external_id: None, ..draft() }
            .validate(League::Nba, None, 0)
            .unwrap_err()
            .into();
        assert_eq!(rejected.external_id, None);
    }

    #[test]
    fn mutable_field_comparison_ignores_identity_and_timestamp() {
        let a = draft().validate(League::Nfl, None, 1).unwrap();
        let mut b = a.clone();
        b.updated_at = 2;
        b.venue = Some("Elsewhere".into());
        assert!(!a.mutable_fields_differ(&b));
        b.status = GameStatus::Live;
        assert!(a.mutable_fields_differ(&b));
    }

    #[test]
    fn league_parses_case_insensitively() {
        assert_eq!("NFL".parse::<League>(), Ok(League::Nfl));
        assert!("xfl".parse::<League>().is_err());
    }

    #[test]
    fn season_label_tracks_league_calendar() {
        let jan = Utc.with_ymd_and_hms(2025, 1, 12, 0, 0, 0).unwrap();
        let oct = Utc.with_ymd_and_hms(2024, 10, 12, 0, 0, 0).unwrap();
        assert_eq!(League::Nfl.season_for(jan), 2024);
        assert_eq!(League::Nba.season_for(jan), 2024);
        assert_eq!(League::Mlb.season_for(oct), 2024);
        assert_eq!(League::Nhl.season_for(oct), 2024);
    }

    #[test]
    fn win_pct_counts_ties_as_half() {
        assert_eq!(win_pct(0, 0, 0), None);
        assert_eq!(win_pct(8, 8, 1), Some(8.5 / 17.0));
    }
}
