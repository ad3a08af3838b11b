//! Commercial multi-sport provider (api-sports family). Every response is an
//! envelope `{ "errors": ..., "response": [...] }`; a non-empty `errors`
//! member means the request was refused even when the HTTP status is 200.

use crate::client::{
    ApiError, ApiResult, Endpoint, ExtractedGames, PermanentKind, ProviderKind, ProviderStrategy,
    StatusMap, epoch_from_rfc3339, float_field, id_field, int_field,
};
use crate::{
    CanonicalStanding, CanonicalTeam, GameDraft, GameStatus, League, RejectedRecord, SlateParams,
    SlateUnit, win_pct,
};
use chrono::Utc;
use serde_json::Value;

pub const AUTH_HEADER: &str = "x-apisports-key";

pub const STATUS_MAP: StatusMap = StatusMap::new(
    "sportsdata",
    &[
        ("NS", GameStatus::Scheduled),
        ("TBD", GameStatus::Scheduled),
        ("Q1", GameStatus::Live),
        ("Q2", GameStatus::Live),
        ("Q3", GameStatus::Live),
        ("Q4", GameStatus::Live),
        ("OT", GameStatus::Live),
        ("HT", GameStatus::Live),
        ("BT", GameStatus::Live),
        ("LIVE", GameStatus::Live),
        ("IN", GameStatus::Live),
        ("P1", GameStatus::Live),
        ("P2", GameStatus::Live),
        ("P3", GameStatus::Live),
        ("PT", GameStatus::Live),
        ("FT", GameStatus::Final),
        ("AOT", GameStatus::Final),
        ("AET", GameStatus::Final),
        ("AP", GameStatus::Final),
        ("FR", GameStatus::Final),
        ("PST", GameStatus::Postponed),
        ("POST", GameStatus::Postponed),
        ("SUSP", GameStatus::Postponed),
        ("INTR", GameStatus::Postponed),
        ("CANC", GameStatus::Cancelled),
        ("ABD", GameStatus::Cancelled),
        ("AWD", GameStatus::Cancelled),
    ],
);

pub static STRATEGY: ProviderStrategy = ProviderStrategy {
    kind: ProviderKind::SportsData,
    status_map: STATUS_MAP,
    auth_header: Some(AUTH_HEADER),
    default_base_url,
    games_endpoint,
    teams_endpoint,
    standings_endpoint,
    extract_games,
    extract_teams,
    extract_standings,
};

pub fn default_base_url(league: League) -> String {
    let host = match league {
        League::Nfl => "v1.american-football",
        League::Nba => "v1.basketball",
        League::Mlb => "v1.baseball",
        League::Nhl => "v1.hockey",
    };
    format!("https://{host}.api-sports.io")
}

fn league_id(league: League) -> u32 {
    match league {
        League::Nfl => 1,
        League::Nba => 12,
        League::Mlb => 1,
        League::Nhl => 57,
    }
}

/// Basketball seasons span two calendar years ("2024-2025").
fn season_param(league: League, season: i32) -> String {
    match league {
        League::Nba => format!("{season}-{}", season + 1),
        _ => season.to_string(),
    }
}

pub fn games_endpoint(league: League, params: &SlateParams) -> ApiResult<Endpoint> {
    let date = match params.unit {
        SlateUnit::Current => Utc::now().date_naive(),
        SlateUnit::Date(date) => date,
        SlateUnit::Week(_) => {
            return Err(ApiError::Config(
                "sportsdata serves dated slates only; use a date range".into(),
            ));
        }
    };
    let mut endpoint = Endpoint::new("games")
        .param("league", league_id(league))
        .param("date", date.format("%Y-%m-%d"));
    if let Some(season) = params.season {
        endpoint = endpoint.param("season", season_param(league, season));
    }
    Ok(endpoint)
}

pub fn teams_endpoint(league: League, season: i32) -> Endpoint {
    Endpoint::new("teams")
        .param("league", league_id(league))
        .param("season", season_param(league, season))
}

pub fn standings_endpoint(league: League, season: i32) -> Endpoint {
    Endpoint::new("standings")
        .param("league", league_id(league))
        .param("season", season_param(league, season))
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

fn response_items<'a>(payload: &'a Value, target: &str) -> ApiResult<&'a Vec<Value>> {
    let Some(root) = payload.as_object() else {
        return Err(ApiError::malformed(target, "expected a JSON object"));
    };

    let refused = match root.get("errors") {
        Some(Value::Array(errors)) if !errors.is_empty() => Some(Value::Array(errors.clone())),
        Some(Value::Object(errors)) if !errors.is_empty() => Some(Value::Object(errors.clone())),
        _ => None,
    };
    if let Some(errors) = refused {
        return Err(ApiError::Permanent {
            kind: PermanentKind::Rejected(errors.to_string()),
            target: target.to_owned(),
        });
    }

    root.get("response")
        .and_then(Value::as_array)
        .ok_or_else(|| ApiError::malformed(target, "missing `response` array"))
}

// ---------------------------------------------------------------------------
// Games
// ---------------------------------------------------------------------------

/// American football nests game facts under `game`; the other sports keep
/// them at the top level.
fn game_draft(item: &Value, status_map: &StatusMap) -> Result<GameDraft, RejectedRecord> {
    let game = item.get("game").unwrap_or(item);
    let external_id = id_field(game.get("id"));
    if !game.is_object() {
        return Err(RejectedRecord {
            external_id,
            reason: "malformed record: expected an object".into(),
        });
    }

    let short = game.pointer("/status/short").and_then(Value::as_str);
    let status = status_map.resolve(short.as_slice());

    let scheduled_at = int_field(game.get("timestamp"))
        .or_else(|| int_field(game.pointer("/date/timestamp")))
        .or_else(|| game.get("date").and_then(Value::as_str).and_then(epoch_from_rfc3339));

    let score = |side: &str| {
        let node = item.pointer(&format!("/scores/{side}"))?;
        match node {
            Value::Object(obj) => int_field(obj.get("total")),
            other => int_field(Some(other)),
        }
    };

    Ok(GameDraft {
        external_id,
        season: id_field(item.pointer("/league/season")),
        home_team: id_field(item.pointer("/teams/home/id")),
        away_team: id_field(item.pointer("/teams/away/id")),
        scheduled_at,
        status,
        home_score: score("home"),
        away_score: score("away"),
        venue: game
            .pointer("/venue/name")
            .or_else(|| item.pointer("/arena/name"))
            .and_then(Value::as_str)
            .map(str::to_owned),
        attendance: int_field(game.get("attendance")),
    })
}

pub fn extract_games(payload: &Value, status_map: &StatusMap) -> ApiResult<ExtractedGames> {
    let items = response_items(payload, "sportsdata games")?;
    Ok(items.iter().map(|item| game_draft(item, status_map)).collect())
}

// ---------------------------------------------------------------------------
// Teams and standings
// ---------------------------------------------------------------------------

pub fn extract_teams(payload: &Value, league: League) -> ApiResult<Vec<CanonicalTeam>> {
    let items = response_items(payload, "sportsdata teams")?;
    Ok(items
        .iter()
        .filter_map(|team| {
            let external_id = id_field(team.get("id"))?;
            let name = team.get("name").and_then(Value::as_str)?.to_owned();
            Some(CanonicalTeam {
                id: CanonicalTeam::canonical_id(league, &external_id),
                league,
                external_id,
                name,
                abbreviation: team.get("code").and_then(Value::as_str).map(str::to_owned),
                location: team.get("city").and_then(Value::as_str).map(str::to_owned),
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
    let items = response_items(payload, "sportsdata standings")?;

    // basketball and hockey group rows per conference: [[row, ...], ...]
    let rows = items.iter().flat_map(|item| match item {
        Value::Array(group) => group.iter().collect::<Vec<_>>(),
        row => vec![row],
    });

    Ok(rows
        .filter_map(|row| {
            let team_ext = id_field(row.pointer("/team/id"))?;
            let wins = int_field(row.get("won"))
                .or_else(|| int_field(row.pointer("/games/win/total")))
                .unwrap_or(0);
            let losses = int_field(row.get("lost"))
                .or_else(|| int_field(row.pointer("/games/lose/total")))
                .unwrap_or(0);
            let ties = int_field(row.get("ties")).unwrap_or(0);
            Some(CanonicalStanding {
                league,
                season_id: season_id.to_owned(),
                team_id: CanonicalTeam::canonical_id(league, &team_ext),
                wins,
                losses,
                ties,
                win_pct: float_field(row.pointer("/games/win/percentage"))
                    .or_else(|| win_pct(wins, losses, ties)),
                rank: int_field(row.get("position")),
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
    fn games_endpoint_uses_league_and_season_format() {
        let date = NaiveDate::from_ymd_opt(2024, 12, 25).unwrap();
        let endpoint = games_endpoint(League::Nba, &SlateParams::date(Some(2024), date)).unwrap();
        assert_eq!(
            endpoint.url("http://h").unwrap().as_str(),
            "http://h/games?league=12&date=2024-12-25&season=2024-2025"
        );
        assert!(games_endpoint(League::Nfl, &SlateParams::week(None, 2)).is_err());
    }

    #[test]
    fn errors_member_is_a_permanent_rejection() {
        let payload = json!({"errors": {"token": "Error/Missing application key."}, "response": []});
        let err = extract_games(&payload, &STATUS_MAP).unwrap_err();
        assert!(matches!(err, ApiError::Permanent { kind: PermanentKind::Rejected(_), .. }));
        assert!(!err.is_retryable());

        let ok = json!({"errors": [], "response": []});
        assert!(extract_games(&ok, &STATUS_MAP).unwrap().is_empty());
        assert!(extract_games(&json!({"errors": []}), &STATUS_MAP).is_err());
    }

    #[test]
    fn basketball_and_football_shapes() {
        let payload = json!({"errors": [], "response": [
            {
                "id": 1001,
                "date": "2024-12-25T17:00:00+00:00",
                "timestamp": 1735146000,
                "status": {"short": "FT"},
                "league": {"season": "2024-2025"},
                "teams": {"home": {"id": 20}, "away": {"id": 5}},
                "scores": {"home": {"total": 117}, "away": {"total": 114}},
                "arena": {"name": "Madison Square Garden"}
            },
            {
                "game": {"id": 77, "date": {"timestamp": 1725814800}, "status": {"short": "Q3"}, "venue": {"name": "Lambeau Field"}},
                "league": {"season": 2024},
                "teams": {"home": {"id": 9}, "away": {"id": 3}},
                "scores": {"home": {"total": 14}, "away": {"total": null}}
            },
            {
                "id": 1002,
                "timestamp": 1735160000,
                "status": {"short": "XYZ"},
                "teams": {"home": {"id": 1}, "away": {"id": 2}},
                "scores": {"home": 3, "away": 2}
            },
            "garbage"
        ]});
        let records = extract_games(&payload, &STATUS_MAP).unwrap();
        assert_eq!(records.len(), 4);

        let nba = records[0].as_ref().unwrap();
        assert_eq!(nba.external_id.as_deref(), Some("1001"));
        assert_eq!(nba.status, GameStatus::Final);
        assert_eq!(nba.scheduled_at, Some(1735146000));
        assert_eq!(nba.home_score, Some(117));
        assert_eq!(nba.venue.as_deref(), Some("Madison Square Garden"));
        assert_eq!(nba.season.as_deref(), Some("2024-2025"));

        let nfl = records[1].as_ref().unwrap();
        assert_eq!(nfl.external_id.as_deref(), Some("77"));
        assert_eq!(nfl.status, GameStatus::Live);
        assert_eq!(nfl.scheduled_at, Some(1725814800));
        assert_eq!(nfl.away_score, None);
        assert_eq!(nfl.season.as_deref(), Some("2024"));

        let hockey = records[2].as_ref().unwrap();
        assert_eq!(hockey.status, GameStatus::Scheduled);
        assert_eq!(hockey.home_score, Some(3));

        assert!(records[3].is_err());
    }

    #[test]
    fn grouped_standings_are_flattened() {
        let payload = json!({"errors": [], "response": [[
            {"position": 1, "team": {"id": 20}, "games": {"win": {"total": 50, "percentage": "0.610"}, "lose": {"total": 32}}},
            {"position": 2, "team": {"id": 5}, "games": {"win": {"total": 41}, "lose": {"total": 41}}}
        ]]});
        let rows = extract_standings(&payload, League::Nba, "2024", 0).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].wins, 50);
        assert_eq!(rows[0].win_pct, Some(0.61));
        assert_eq!(rows[1].win_pct, Some(0.5));
        assert_eq!(rows[1].rank, Some(2));
    }
}
