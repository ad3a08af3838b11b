/// ESPN site API: raw wire types and the field mapping into canonical records.
/// Scores arrive as strings; standings live under the sibling `/apis/v2/` tree.
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

pub const STATUS_MAP: StatusMap = StatusMap::new(
    "espn",
    &[
        ("STATUS_SCHEDULED", GameStatus::Scheduled),
        ("STATUS_TIME_TBD", GameStatus::Scheduled),
        ("STATUS_IN_PROGRESS", GameStatus::Live),
        ("STATUS_FIRST_HALF", GameStatus::Live),
        ("STATUS_SECOND_HALF", GameStatus::Live),
        ("STATUS_HALFTIME", GameStatus::Live),
        ("STATUS_END_PERIOD", GameStatus::Live),
        ("STATUS_OVERTIME", GameStatus::Live),
        ("STATUS_SHOOTOUT", GameStatus::Live),
        ("STATUS_RAIN_DELAY", GameStatus::Live),
        ("STATUS_DELAYED", GameStatus::Postponed),
        ("STATUS_FINAL", GameStatus::Final),
        ("STATUS_FINAL_OT", GameStatus::Final),
        ("STATUS_FINAL_SO", GameStatus::Final),
        ("STATUS_FULL_TIME", GameStatus::Final),
        ("STATUS_POSTPONED", GameStatus::Postponed),
        ("STATUS_SUSPENDED", GameStatus::Postponed),
        ("STATUS_CANCELED", GameStatus::Cancelled),
        ("STATUS_CANCELLED", GameStatus::Cancelled),
        ("STATUS_FORFEIT", GameStatus::Cancelled),
        // coarse state, used when the detailed name is unknown
        ("pre", GameStatus::Scheduled),
        ("in", GameStatus::Live),
        ("post", GameStatus::Final),
    ],
);

pub static STRATEGY: ProviderStrategy = ProviderStrategy {
    kind: ProviderKind::Espn,
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

fn sport_path(league: League) -> &'static str {
    match league {
        League::Nfl => "football/nfl",
        League::Nba => "basketball/nba",
        League::Mlb => "baseball/mlb",
        League::Nhl => "hockey/nhl",
    }
}

pub fn default_base_url(league: League) -> String {
    format!("https://site.api.espn.com/apis/site/v2/sports/{}", sport_path(league))
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

pub fn games_endpoint(league: League, params: &SlateParams) -> ApiResult<Endpoint> {
    let endpoint = Endpoint::new("scoreboard");
    Ok(match params.unit {
        SlateUnit::Current => endpoint,
        SlateUnit::Week(week) => {
            if !league.uses_weekly_slates() {
                return Err(ApiError::Config(format!("{league} has no weekly slates")));
            }
            let endpoint = endpoint.param("seasontype", 2).param("week", week);
            match params.season {
                Some(season) => endpoint.param("dates", season),
                None => endpoint,
            }
        }
        SlateUnit::Date(date) => endpoint.param("dates", date.format("%Y%m%d")),
    })
}

pub fn teams_endpoint(_league: League, _season: i32) -> Endpoint {
    Endpoint::new("teams")
}

pub fn standings_endpoint(_league: League, season: i32) -> Endpoint {
    Endpoint::new("standings")
        .param("season", season)
        .rebased(standings_base)
}

/// `.../apis/site/v2/sports/...` → `.../apis/v2/sports/...`
fn standings_base(base: &str) -> String {
    base.replacen("/apis/site/v2/", "/apis/v2/", 1)
}

// ---------------------------------------------------------------------------
// Scoreboard wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default, Clone)]
pub struct EspnEvent {
    /// String or number; see `id_field`.
    pub id: Option<Value>,
    pub date: Option<String>, // ISO 8601, often without seconds
    pub season: Option<EspnSeason>,
    pub status: Option<EspnStatus>,
    pub competitions: Option<Vec<EspnCompetition>>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct EspnSeason {
    pub year: Option<i32>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct EspnStatus {
    #[serde(rename = "type")]
    pub status_type: Option<EspnStatusType>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct EspnStatusType {
    pub name: Option<String>,  // "STATUS_SCHEDULED", "STATUS_IN_PROGRESS", "STATUS_FINAL"
    pub state: Option<String>, // "pre" | "in" | "post"
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct EspnCompetition {
    pub date: Option<String>,
    pub attendance: Option<Value>,
    pub venue: Option<EspnVenue>,
    pub competitors: Option<Vec<EspnCompetitor>>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct EspnVenue {
    #[serde(rename = "fullName")]
    pub full_name: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct EspnCompetitor {
    pub id: Option<Value>,
    #[serde(rename = "homeAway")]
    pub home_away: Option<String>,
    pub team: Option<EspnTeamRef>,
    pub score: Option<Value>, // usually a string, occasionally a number or object
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct EspnTeamRef {
    pub id: Option<Value>,
}

impl EspnCompetitor {
    fn team_id(&self) -> Option<String> {
        self.team
            .as_ref()
            .and_then(|t| id_field(t.id.as_ref()))
            .or_else(|| id_field(self.id.as_ref()))
    }

    fn score(&self) -> Option<i64> {
        match &self.score {
            Some(Value::Object(obj)) => int_field(obj.get("value")),
            other => int_field(other.as_ref()),
        }
    }
}

impl EspnEvent {
    fn into_draft(self, status_map: &StatusMap) -> GameDraft {
        let status_type = self.status.and_then(|s| s.status_type).unwrap_or_default();
        let candidates: Vec<&str> = [status_type.name.as_deref(), status_type.state.as_deref()]
            .into_iter()
            .flatten()
            .collect();
        let status = status_map.resolve(&candidates);

        let competition = self
            .competitions
            .and_then(|c| c.into_iter().next())
            .unwrap_or_default();
        let competitors = competition.competitors.unwrap_or_default();
        let side = |which: &str| {
            competitors
                .iter()
                .find(|c| c.home_away.as_deref().is_some_and(|h| h.eq_ignore_ascii_case(which)))
        };
        let (home, away) = (side("home"), side("away"));

        // zeros are reported before puck drop; only trust scores once play started
        let scored = matches!(status, GameStatus::Live | GameStatus::Final);
        let score_of = |c: Option<&EspnCompetitor>| c.and_then(|c| c.score()).filter(|_| scored);

        GameDraft {
            external_id: id_field(self.id.as_ref()),
            season: self.season.and_then(|s| s.year).map(|y| y.to_string()),
            home_team: home.and_then(|c| c.team_id()),
            away_team: away.and_then(|c| c.team_id()),
            scheduled_at: self
                .date
                .or(competition.date)
                .as_deref()
                .and_then(epoch_from_rfc3339),
            status,
            home_score: score_of(home),
            away_score: score_of(away),
            venue: competition.venue.and_then(|v| v.full_name),
            attendance: int_field(competition.attendance.as_ref()).filter(|a| *a > 0),
        }
    }
}

pub fn extract_games(payload: &Value, status_map: &StatusMap) -> ApiResult<ExtractedGames> {
    let Some(root) = payload.as_object() else {
        return Err(ApiError::malformed("espn scoreboard", "expected a JSON object"));
    };
    let events = match root.get("events") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(events)) => events,
        Some(_) => return Err(ApiError::malformed("espn scoreboard", "`events` is not an array")),
    };

    Ok(parse_each::<EspnEvent>(events, |v| id_field(v.get("id")))
        .into_iter()
        .map(|event| event.map(|e| e.into_draft(status_map)))
        .collect())
}

// ---------------------------------------------------------------------------
// Teams and standings
// ---------------------------------------------------------------------------

pub fn extract_teams(payload: &Value, league: League) -> ApiResult<Vec<CanonicalTeam>> {
    let teams = payload
        .pointer("/sports/0/leagues/0/teams")
        .and_then(Value::as_array)
        .ok_or_else(|| ApiError::malformed("espn teams", "missing sports[0].leagues[0].teams"))?;

    Ok(teams
        .iter()
        .filter_map(|entry| {
            let team = entry.get("team").unwrap_or(entry);
            let external_id = id_field(team.get("id"))?;
            let name = team
                .get("displayName")
                .or_else(|| team.get("name"))
                .and_then(Value::as_str)?
                .to_owned();
            Some(CanonicalTeam {
                id: CanonicalTeam::canonical_id(league, &external_id),
                league,
                external_id,
                name,
                abbreviation: team.get("abbreviation").and_then(Value::as_str).map(str::to_owned),
                location: team.get("location").and_then(Value::as_str).map(str::to_owned),
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
    if !payload.is_object() {
        return Err(ApiError::malformed("espn standings", "expected a JSON object"));
    }
    let mut entries = Vec::new();
    collect_entries(payload, &mut entries);

    Ok(entries
        .into_iter()
        .filter_map(|entry| {
            let team_ext = id_field(entry.pointer("/team/id"))?;
            let stat = |name: &str| {
                entry
                    .get("stats")
                    .and_then(Value::as_array)
                    .and_then(|stats| {
                        stats.iter().find(|s| {
                            s.get("name").and_then(Value::as_str) == Some(name)
                                || s.get("type").and_then(Value::as_str) == Some(name)
                        })
                    })
                    .and_then(|s| s.get("value"))
            };
            let wins = int_field(stat("wins")).unwrap_or(0);
            let losses = int_field(stat("losses")).unwrap_or(0);
            let ties = int_field(stat("ties")).unwrap_or(0);
            Some(CanonicalStanding {
                league,
                season_id: season_id.to_owned(),
                team_id: CanonicalTeam::canonical_id(league, &team_ext),
                wins,
                losses,
                ties,
                win_pct: float_field(stat("winPercent")).or_else(|| win_pct(wins, losses, ties)),
                rank: int_field(stat("playoffSeed")).or_else(|| int_field(stat("rank"))),
                updated_at: now,
            })
        })
        .collect())
}

/// Standings nest conference → division → entries to varying depth.
fn collect_entries<'a>(node: &'a Value, out: &mut Vec<&'a Value>) {
    if let Some(entries) = node.pointer("/standings/entries").and_then(Value::as_array) {
        out.extend(entries);
    }
    if let Some(children) = node.get("children").and_then(Value::as_array) {
        for child in children {
            collect_entries(child, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn event(id: &str, status: &str, state: &str, home_score: Value) -> Value {
        json!({
            "id": id,
            "date": "2024-10-13T20:25Z",
            "season": {"year": 2024},
            "status": {"type": {"name": status, "state": state}},
            "competitions": [{
                "attendance": 0,
                "venue": {"fullName": "Arrowhead"},
                "competitors": [
                    {"homeAway": "away", "team": {"id": "12"}, "score": "10"},
                    {"homeAway": "home", "team": {"id": "7"}, "score": home_score}
                ]
            }]
        })
    }

    #[test]
    fn weekly_and_dated_endpoints() {
        let week = games_endpoint(League::Nfl, &SlateParams::week(Some(2024), 6)).unwrap();
        assert_eq!(week.url("http://h").unwrap().as_str(), "http://h/scoreboard?seasontype=2&week=6&dates=2024");

        let date = NaiveDate::from_ymd_opt(2024, 11, 2).unwrap();
        let dated = games_endpoint(League::Nhl, &SlateParams::date(None, date)).unwrap();
        assert_eq!(dated.url("http://h").unwrap().as_str(), "http://h/scoreboard?dates=20241102");

        assert!(games_endpoint(League::Nhl, &SlateParams::week(None, 3)).is_err());
    }

    #[test]
    fn standings_use_sibling_api_tree() {
        let url = standings_endpoint(League::Nfl, 2024)
            .url(&default_base_url(League::Nfl))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://site.api.espn.com/apis/v2/sports/football/nfl/standings?season=2024"
        );
    }

    #[test]
    fn scoreboard_events_become_drafts() {
        let payload = json!({"events": [
            event("1", "STATUS_FINAL", "post", json!("27")),
            event("2", "STATUS_WHATEVER", "in", json!(3)),
            event("3", "STATUS_SCHEDULED", "pre", json!("0")),
        ]});
        let drafts: Vec<GameDraft> = extract_games(&payload, &STATUS_MAP)
            .unwrap()
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(drafts[0].status, GameStatus::Final);
        assert_eq!(drafts[0].home_team.as_deref(), Some("7"));
        assert_eq!(drafts[0].away_team.as_deref(), Some("12"));
        assert_eq!(drafts[0].home_score, Some(27));
        assert_eq!(drafts[0].attendance, None);
        assert_eq!(drafts[0].season.as_deref(), Some("2024"));
        assert_eq!(drafts[1].status, GameStatus::Live);
        assert_eq!(drafts[1].home_score, Some(3));
        assert_eq!(drafts[2].status, GameStatus::Scheduled);
        assert_eq!(drafts[2].home_score, None);
    }

    #[test]
    fn numeric_ids_are_normalized_to_strings() {
        let mut numeric = event("1", "STATUS_FINAL", "post", json!(24));
        numeric["id"] = json!(401_547_417);
        numeric["competitions"][0]["competitors"][0]["team"]["id"] = json!(12);
        numeric["competitions"][0]["competitors"][1] = json!({"homeAway": "home", "id": 7, "score": 24});

        let records = extract_games(&json!({"events": [numeric]}), &STATUS_MAP).unwrap();
        let draft = records[0].as_ref().unwrap();
        assert_eq!(draft.external_id.as_deref(), Some("401547417"));
        assert_eq!(draft.away_team.as_deref(), Some("12"));
        assert_eq!(draft.home_team.as_deref(), Some("7"));
    }

    #[test]
    fn malformed_event_is_rejected_individually() {
        let payload = json!({"events": [
            event("1", "STATUS_FINAL", "post", json!("27")),
            {"id": "2", "competitions": "oops"},
        ]});
        let records = extract_games(&payload, &STATUS_MAP).unwrap();
        assert!(records[0].is_ok());
        let rejected = records[1].as_ref().unwrap_err();
        assert_eq!(rejected.external_id.as_deref(), Some("2"));
    }

    #[test]
    fn empty_or_missing_events_is_an_empty_slate() {
        assert!(extract_games(&json!({}), &STATUS_MAP).unwrap().is_empty());
        assert!(extract_games(&json!({"events": []}), &STATUS_MAP).unwrap().is_empty());
        assert!(extract_games(&json!([1, 2]), &STATUS_MAP).is_err());
        assert!(extract_games(&json!({"events": {}}), &STATUS_MAP).is_err());
    }

    #[test]
    fn teams_are_read_from_nested_league() {
        let payload = json!({"sports": [{"leagues": [{"teams": [
            {"team": {"id": "7", "displayName": "Kansas City Chiefs", "abbreviation": "KC", "location": "Kansas City"}},
            {"team": {"abbreviation": "??"}}
        ]}]}]});
        let teams = extract_teams(&payload, League::Nfl).unwrap();
        assert_eq!(teams.len(), 1);
        assert_eq!(teams[0].id, "nfl-team-7");
        assert_eq!(teams[0].abbreviation.as_deref(), Some("KC"));
        assert!(extract_teams(&json!({}), League::Nfl).is_err());
    }

    #[test]
    fn standings_walk_nested_groups() {
        let entry = |id: &str, w: i64, l: i64| {
            json!({"team": {"id": id}, "stats": [
                {"name": "wins", "value": w},
                {"name": "losses", "value": l},
                {"name": "playoffSeed", "value": 1.0}
            ]})
        };
        let payload = json!({"children": [
            {"standings": {"entries": [entry("7", 15, 2)]}},
            {"children": [{"standings": {"entries": [entry("12", 4, 13)]}}]}
        ]});
        let rows = extract_standings(&payload, League::Nfl, "2024", 100).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].team_id, "nfl-team-7");
        assert_eq!(rows[0].rank, Some(1));
        let pct = rows[1].win_pct.unwrap();
        assert!((pct - 4.0 / 17.0).abs() < 1e-9);
    }
}
