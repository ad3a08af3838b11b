//! MLB StatsAPI: `/schedule` groups games under `dates[].games[]`; statuses
//! are single-letter coded game states.

use crate::client::{
    ApiError, ApiResult, Endpoint, ExtractedGames, ProviderKind, ProviderStrategy, StatusMap,
    epoch_from_rfc3339, float_field, id_field, int_field, parse_each,
};
use crate::{
    CanonicalStanding, CanonicalTeam, GameDraft, GameStatus, League, SlateParams, SlateUnit,
    win_pct,
};
use serde::Deserialize;
use serde_json::Value;

pub const BASE_URL: &str = "https://statsapi.mlb.com/api/v1";

pub const STATUS_MAP: StatusMap = StatusMap::new(
    "statsapi",
    &[
        ("S", GameStatus::Scheduled),
        ("P", GameStatus::Scheduled),
        ("PW", GameStatus::Scheduled),
        ("I", GameStatus::Live),
        ("M", GameStatus::Live),
        ("N", GameStatus::Live),
        ("F", GameStatus::Final),
        ("FT", GameStatus::Final),
        ("FR", GameStatus::Final),
        ("O", GameStatus::Final),
        ("OR", GameStatus::Final),
        ("D", GameStatus::Postponed),
        ("DR", GameStatus::Postponed),
        ("C", GameStatus::Cancelled),
        ("CR", GameStatus::Cancelled),
        // abstract game state
        ("Preview", GameStatus::Scheduled),
        ("Live", GameStatus::Live),
        ("Final", GameStatus::Final),
    ],
);

pub static STRATEGY: ProviderStrategy = ProviderStrategy {
    kind: ProviderKind::StatsApi,
    status_map: STATUS_MAP,
    auth_header: None,
    default_base_url,
    games_endpoint,
    teams_endpoint,
    standings_endpoint,
    extract_games,
    extract_teams,
    extract_standings,
};

pub fn default_base_url(_league: League) -> String {
    BASE_URL.to_owned()
}

/// StatsAPI sport ids; only baseball is served at the top level.
fn sport_id(league: League) -> ApiResult<u32> {
    match league {
        League::Mlb => Ok(1),
        other => Err(ApiError::Config(format!("statsapi does not serve {other}"))),
    }
}

pub fn games_endpoint(league: League, params: &SlateParams) -> ApiResult<Endpoint> {
    let mut endpoint = Endpoint::new("schedule")
        .param("sportId", sport_id(league)?)
        .param("hydrate", "team,venue,gameInfo");
    match params.unit {
        SlateUnit::Current => {}
        SlateUnit::Week(_) => {
            return Err(ApiError::Config(format!("{league} has no weekly slates")));
        }
        SlateUnit::Date(date) => {
            let day = date.format("%Y-%m-%d").to_string();
            endpoint = endpoint.param("startDate", &day).param("endDate", &day);
        }
    }
    if let Some(season) = params.season {
        endpoint = endpoint.param("season", season);
    }
    Ok(endpoint)
}

pub fn teams_endpoint(_league: League, season: i32) -> Endpoint {
    Endpoint::new("teams").param("sportId", 1).param("season", season)
}

pub fn standings_endpoint(_league: League, season: i32) -> Endpoint {
    // American and National leagues
    Endpoint::new("standings")
        .param("leagueId", "103,104")
        .param("season", season)
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ScheduleGame {
    game_pk: Option<i64>,
    game_date: Option<String>,
    season: Option<Value>,
    status: Option<GameState>,
    teams: Option<Matchup>,
    venue: Option<Venue>,
    game_info: Option<GameInfo>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GameState {
    coded_game_state: Option<String>,
    abstract_game_state: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Matchup {
    home: Option<Side>,
    away: Option<Side>,
}

#[derive(Debug, Deserialize, Default)]
struct Side {
    team: Option<TeamRef>,
    score: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
struct TeamRef {
    id: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
struct Venue {
    name: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct GameInfo {
    attendance: Option<i64>,
}

impl ScheduleGame {
    fn into_draft(self, status_map: &StatusMap) -> GameDraft {
        let state = self.status.unwrap_or_default();
        let candidates: Vec<&str> = [
            state.coded_game_state.as_deref(),
            state.abstract_game_state.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect();
        let status = status_map.resolve(&candidates);

        let teams = self.teams.unwrap_or_default();
        let (home, away) = (teams.home.unwrap_or_default(), teams.away.unwrap_or_default());
        let team_id = |side: &Side| side.team.as_ref().and_then(|t| t.id).map(|id| id.to_string());

        GameDraft {
            external_id: self.game_pk.map(|pk| pk.to_string()),
            season: id_field(self.season.as_ref()),
            home_team: team_id(&home),
            away_team: team_id(&away),
            scheduled_at: self.game_date.as_deref().and_then(epoch_from_rfc3339),
            status,
            home_score: home.score,
            away_score: away.score,
            venue: self.venue.and_then(|v| v.name),
            attendance: self.game_info.and_then(|g| g.attendance),
        }
    }
}

pub fn extract_games(payload: &Value, status_map: &StatusMap) -> ApiResult<ExtractedGames> {
    let Some(root) = payload.as_object() else {
        return Err(ApiError::malformed("statsapi schedule", "expected a JSON object"));
    };
    let dates = match root.get("dates") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(dates)) => dates,
        Some(_) => return Err(ApiError::malformed("statsapi schedule", "`dates` is not an array")),
    };

    let mut records = Vec::new();
    for day in dates {
        let Some(games) = day.get("games").and_then(Value::as_array) else {
            continue;
        };
        records.extend(
            parse_each::<ScheduleGame>(games, |v| id_field(v.get("gamePk")))
                .into_iter()
                .map(|game| game.map(|g| g.into_draft(status_map))),
        );
    }
    Ok(records)
}

pub fn extract_teams(payload: &Value, league: League) -> ApiResult<Vec<CanonicalTeam>> {
    let teams = payload
        .get("teams")
        .and_then(Value::as_array)
        .ok_or_else(|| ApiError::malformed("statsapi teams", "missing `teams` array"))?;

    Ok(teams
        .iter()
        .filter_map(|team| {
            let external_id = id_field(team.get("id"))?;
            let name = team.get("name").and_then(Value::as_str)?.to_owned();
            Some(CanonicalTeam {
                id: CanonicalTeam::canonical_id(league, &external_id),
                league,
                external_id,
                name,
                abbreviation: team.get("abbreviation").and_then(Value::as_str).map(str::to_owned),
                location: team.get("locationName").and_then(Value::as_str).map(str::to_owned),
            })
        })
        .collect())
}

pub fn extract_standings(
    payload: &Value,
    league: League,
    season_id: &str,
    now: i64,
) -> ApiResult<Vec<CanonicalStanding>> {
    let records = payload
        .get("records")
        .and_then(Value::as_array)
        .ok_or_else(|| ApiError::malformed("statsapi standings", "missing `records` array"))?;

    Ok(records
        .iter()
        .filter_map(|division| division.get("teamRecords").and_then(Value::as_array))
        .flatten()
        .filter_map(|row| {
            let team_ext = id_field(row.pointer("/team/id"))?;
            let wins = int_field(row.get("wins")).unwrap_or(0);
            let losses = int_field(row.get("losses")).unwrap_or(0);
            Some(CanonicalStanding {
                league,
                season_id: season_id.to_owned(),
                team_id: CanonicalTeam::canonical_id(league, &team_ext),
                wins,
                losses,
                ties: 0,
                win_pct: float_field(row.get("winningPercentage"))
                    .or_else(|| win_pct(wins, losses, 0)),
                rank: int_field(row.get("leagueRank")).or_else(|| int_field(row.get("divisionRank"))),
                updated_at: now,
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    #[test]
    fn schedule_endpoint_by_date() {
        let date = NaiveDate::from_ymd_opt(2024, 7, 4).unwrap();
        let endpoint = games_endpoint(League::Mlb, &SlateParams::date(Some(2024), date)).unwrap();
        assert_eq!(
            endpoint.url(BASE_URL).unwrap().as_str(),
            "https://statsapi.mlb.com/api/v1/schedule?sportId=1&hydrate=team%2Cvenue%2CgameInfo\
             &startDate=2024-07-04&endDate=2024-07-04&season=2024"
        );
        assert!(games_endpoint(League::Mlb, &SlateParams::week(None, 1)).is_err());
        assert!(games_endpoint(League::Nba, &SlateParams::current()).is_err());
    }

    #[test]
    fn schedule_games_across_dates() {
        let payload = json!({"dates": [
            {"date": "2024-07-04", "games": [{
                "gamePk": 745001,
                "gameDate": "2024-07-04T23:05:00Z",
                "season": "2024",
                "status": {"codedGameState": "F", "abstractGameState": "Final"},
                "teams": {
                    "home": {"team": {"id": 147}, "score": 5},
                    "away": {"team": {"id": 111}, "score": 3}
                },
                "venue": {"name": "Yankee Stadium"},
                "gameInfo": {"attendance": 46123}
            }]},
            {"date": "2024-07-05", "games": [{
                "gamePk": 745002,
                "gameDate": "2024-07-05T23:05:00Z",
                "status": {"codedGameState": "D"},
                "teams": {"home": {"team": {"id": 147}}, "away": {"team": {"id": 111}}}
            }, {
                "gamePk": "not-a-number"
            }]}
        ]});
        let records = extract_games(&payload, &STATUS_MAP).unwrap();
        assert_eq!(records.len(), 3);

        let first = records[0].as_ref().unwrap();
        assert_eq!(first.external_id.as_deref(), Some("745001"));
        assert_eq!(first.status, GameStatus::Final);
        assert_eq!(first.attendance, Some(46123));
        assert_eq!(first.home_score, Some(5));

        let second = records[1].as_ref().unwrap();
        assert_eq!(second.status, GameStatus::Postponed);
        assert_eq!(second.home_score, None);

        let bad = records[2].as_ref().unwrap_err();
        assert_eq!(bad.external_id.as_deref(), Some("not-a-number"));
    }

    #[test]
    fn standings_flatten_divisions() {
        let payload = json!({"records": [
            {"teamRecords": [{"team": {"id": 147}, "wins": 94, "losses": 68, "winningPercentage": ".580", "leagueRank": "1"}]},
            {"teamRecords": [{"team": {"id": 111}, "wins": 81, "losses": 81, "divisionRank": "3"}]}
        ]});
        let rows = extract_standings(&payload, League::Mlb, "2024", 0).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].team_id, "mlb-team-147");
        assert_eq!(rows[0].win_pct, Some(0.58));
        assert_eq!(rows[0].rank, Some(1));
        assert_eq!(rows[1].win_pct, Some(0.5));
        assert_eq!(rows[1].rank, Some(3));
    }

    #[test]
    fn teams_list() {
        let payload = json!({"teams": [{"id": 147, "name": "New York Yankees", "abbreviation": "NYY", "locationName": "Bronx"}]});
        let teams = extract_teams(&payload, League::Mlb).unwrap();
        assert_eq!(teams[0].id, "mlb-team-147");
        assert_eq!(teams[0].location.as_deref(), Some("Bronx"));
    }
}
