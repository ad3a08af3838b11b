use crate::cache::{CacheKey, ResponseCache};
use crate::resilience::ResilienceGuard;
use crate::{
    CanonicalStanding, CanonicalTeam, GameDraft, GameStatus, League, RejectedRecord, Slate,
    SlateParams,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use log::{debug, warn};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transient upstream failure for {target}: {kind}")]
    Transient { kind: TransientKind, target: String },
    #[error("permanent upstream failure for {target}: {kind}")]
    Permanent { kind: PermanentKind, target: String },
    #[error("service unavailable: circuit breaker open for {provider}")]
    BreakerOpen { provider: String },
    #[error("configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransientKind {
    #[error("timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP {0}")]
    Status(u16),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PermanentKind {
    #[error("HTTP {0}")]
    Status(u16),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl ApiError {
    /// Timeouts, network failures and 5xx-class responses.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Transient { .. })
    }

    pub fn is_breaker_open(&self) -> bool {
        matches!(self, ApiError::BreakerOpen { .. })
    }

    pub fn from_status(status: u16, target: &str) -> Self {
        let target = target.to_owned();
        match status {
            408 | 429 | 500..=599 => ApiError::Transient { kind: TransientKind::Status(status), target },
            _ => ApiError::Permanent { kind: PermanentKind::Status(status), target },
        }
    }

    pub fn malformed(target: &str, detail: impl fmt::Display) -> Self {
        ApiError::Permanent {
            kind: PermanentKind::Malformed(detail.to_string()),
            target: target.to_owned(),
        }
    }

    fn from_reqwest(err: reqwest::Error, target: &str) -> Self {
        let target = target.to_owned();
        if err.is_timeout() {
            ApiError::Transient { kind: TransientKind::Timeout, target }
        } else if err.is_builder() {
            ApiError::Config(format!("invalid request for {target}: {err}"))
        } else if err.is_decode() {
            ApiError::Permanent { kind: PermanentKind::Malformed(err.to_string()), target }
        } else {
            ApiError::Transient { kind: TransientKind::Network(err.to_string()), target }
        }
    }
}

// ---------------------------------------------------------------------------
// Status vocabulary
// ---------------------------------------------------------------------------

/// Upstream status vocabulary → canonical status. Matching ignores case and
/// surrounding whitespace.
#[derive(Debug, Clone, Copy)]
pub struct StatusMap {
    provider: &'static str,
    entries: &'static [(&'static str, GameStatus)],
}

impl StatusMap {
    pub const fn new(provider: &'static str, entries: &'static [(&'static str, GameStatus)]) -> Self {
        Self { provider, entries }
    }

    pub fn lookup(&self, raw: &str) -> Option<GameStatus> {
        let raw = raw.trim();
        self.entries
            .iter()
            .find(|(code, _)| code.eq_ignore_ascii_case(raw))
            .map(|(_, status)| *status)
    }

    /// First candidate with a mapping wins. Unmapped or absent values fall
    /// back to `Scheduled` with a warning, never an error.
    pub fn resolve(&self, candidates: &[&str]) -> GameStatus {
        if let Some(status) = candidates.iter().find_map(|raw| self.lookup(raw)) {
            return status;
        }
        if candidates.is_empty() {
            warn!("{}: record carries no status, defaulting to scheduled", self.provider);
        } else {
            warn!(
                "{}: unmapped status {:?}, defaulting to scheduled",
                self.provider, candidates
            );
        }
        GameStatus::Scheduled
    }
}

// ---------------------------------------------------------------------------
// Provider strategies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// The league's official statistics service.
    StatsApi,
    /// Commercial multi-sport data provider.
    SportsData,
    /// Public scoreboard feed.
    Espn,
}

impl ProviderKind {
    pub fn key(&self) -> &'static str {
        match self {
            ProviderKind::StatsApi => "statsapi",
            ProviderKind::SportsData => "sportsdata",
            ProviderKind::Espn => "espn",
        }
    }

    pub fn strategy(&self) -> &'static ProviderStrategy {
        match self {
            ProviderKind::StatsApi => &crate::statsapi::STRATEGY,
            ProviderKind::SportsData => &crate::sportsdata::STRATEGY,
            ProviderKind::Espn => &crate::espn::STRATEGY,
        }
    }

    /// Provider used for a league unless configuration says otherwise.
    pub fn default_for(league: League) -> Self {
        match league {
            League::Nfl | League::Nhl => ProviderKind::Espn,
            League::Nba => ProviderKind::SportsData,
            League::Mlb => ProviderKind::StatsApi,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for ProviderKind {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "statsapi" => Ok(ProviderKind::StatsApi),
            "sportsdata" => Ok(ProviderKind::SportsData),
            "espn" => Ok(ProviderKind::Espn),
            other => Err(ApiError::Config(format!("unknown provider: {other}"))),
        }
    }
}

/// A logical upstream endpoint, relative to the adapter's base address.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub path: String,
    pub params: Vec<(String, String)>,
    /// Some providers serve an endpoint from a sibling base address.
    pub rebase: Option<fn(&str) -> String>,
}

impl Endpoint {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), params: Vec::new(), rebase: None }
    }

    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.params.push((key.to_owned(), value.to_string()));
        self
    }

    pub fn rebased(mut self, rebase: fn(&str) -> String) -> Self {
        self.rebase = Some(rebase);
        self
    }

    /// Absolute URL with the query percent-encoded.
    pub fn url(&self, base: &str) -> ApiResult<Url> {
        let base = match self.rebase {
            Some(rebase) => rebase(base),
            None => base.to_owned(),
        };
        let joined = format!("{}/{}", base.trim_end_matches('/'), self.path.trim_start_matches('/'));
        let url = if self.params.is_empty() {
            Url::parse(&joined)
        } else {
            Url::parse_with_params(&joined, &self.params)
        };
        url.map_err(|e| ApiError::Config(format!("invalid url {joined}: {e}")))
    }
}

pub type ExtractedGames = Vec<Result<GameDraft, RejectedRecord>>;

/// Everything that differs between upstreams: where to call, how to
/// authenticate, what the status codes mean and how to pull fields out.
#[derive(Debug)]
pub struct ProviderStrategy {
    pub kind: ProviderKind,
    pub status_map: StatusMap,
    /// Header carrying the API key, when the provider requires one.
    pub auth_header: Option<&'static str>,
    pub default_base_url: fn(League) -> String,
    pub games_endpoint: fn(League, &SlateParams) -> ApiResult<Endpoint>,
    pub teams_endpoint: fn(League, i32) -> Endpoint,
    pub standings_endpoint: fn(League, i32) -> Endpoint,
    pub extract_games: fn(&Value, &StatusMap) -> ApiResult<ExtractedGames>,
    pub extract_teams: fn(&Value, League) -> ApiResult<Vec<CanonicalTeam>>,
    pub extract_standings: fn(&Value, League, &str, i64) -> ApiResult<Vec<CanonicalStanding>>,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtl {
    pub games: Duration,
    pub standings: Duration,
    pub teams: Duration,
}

impl Default for CacheTtl {
    fn default() -> Self {
        Self {
            games: Duration::from_secs(60),
            standings: Duration::from_secs(600),
            teams: Duration::from_secs(86_400),
        }
    }
}

/// Fetches one league from one upstream and normalizes the payloads into
/// canonical records, going through the shared cache and resilience guard.
#[derive(Debug, Clone)]
pub struct ProviderAdapter {
    league: League,
    strategy: &'static ProviderStrategy,
    base_url: String,
    api_key: Option<String>,
    client: Client,
    cache: Arc<ResponseCache>,
    guard: ResilienceGuard,
    ttl: CacheTtl,
}

impl ProviderAdapter {
    pub fn new(
        league: League,
        kind: ProviderKind,
        cache: Arc<ResponseCache>,
        guard: ResilienceGuard,
    ) -> Self {
        let strategy = kind.strategy();
        Self {
            league,
            strategy,
            base_url: (strategy.default_base_url)(league),
            api_key: None,
            client: Client::builder()
                .user_agent(concat!("slatewire/", env!("CARGO_PKG_VERSION"), " (league ingestion)"))
                .build()
                .unwrap_or_default(),
            cache,
            guard,
            ttl: CacheTtl::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.trim().is_empty());
        self
    }

    pub fn with_ttl(mut self, ttl: CacheTtl) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn league(&self) -> League {
        self.league
    }

    pub fn kind(&self) -> ProviderKind {
        self.strategy.kind
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Key of the breaker guarding this upstream, shared by every league on it.
    pub fn provider_key(&self) -> &'static str {
        self.strategy.kind.key()
    }

    /// Fetch one slate. Records that fail extraction or validation are
    /// returned in `Slate::rejected` rather than failing the call.
    pub async fn get_games(&self, params: &SlateParams) -> ApiResult<Slate> {
        let endpoint = (self.strategy.games_endpoint)(self.league, params)?;
        let status_map = &self.strategy.status_map;
        let extracted = self
            .fetch(&endpoint, self.ttl.games, |payload| {
                (self.strategy.extract_games)(payload, status_map)
            })
            .await?;

        let now = Utc::now().timestamp();
        let mut slate = Slate::default();
        for record in extracted {
            let validated = record.and_then(|draft| {
                draft
                    .validate(self.league, params.season, now)
                    .map_err(RejectedRecord::from)
            });
            match validated {
                Ok(game) => slate.games.push(game),
                Err(rejected) => {
                    debug!("{}/{}: rejected record: {rejected}", self.provider_key(), self.league);
                    slate.rejected.push(rejected);
                }
            }
        }
        Ok(slate)
    }

    pub async fn get_standings(&self, season: Option<i32>) -> ApiResult<Vec<CanonicalStanding>> {
        let season = season.unwrap_or_else(|| self.league.season_for(Utc::now()));
        let endpoint = (self.strategy.standings_endpoint)(self.league, season);
        let season_id = season.to_string();
        let now = Utc::now().timestamp();
        self.fetch(&endpoint, self.ttl.standings, |payload| {
            (self.strategy.extract_standings)(payload, self.league, &season_id, now)
        })
        .await
    }

    pub async fn get_teams(&self) -> ApiResult<Vec<CanonicalTeam>> {
        let season = self.league.season_for(Utc::now());
        let endpoint = (self.strategy.teams_endpoint)(self.league, season);
        self.fetch(&endpoint, self.ttl.teams, |payload| {
            (self.strategy.extract_teams)(payload, self.league)
        })
        .await
    }

    /// Cache → guarded network call → parse. The payload is cached only once
    /// it has been fetched and parsed successfully.
    async fn fetch<T>(
        &self,
        endpoint: &Endpoint,
        ttl: Duration,
        parse: impl Fn(&Value) -> ApiResult<T>,
    ) -> ApiResult<T> {
        let cache_provider = format!("{}:{}", self.provider_key(), self.league);
        let key = CacheKey::new(&cache_provider, &endpoint.path, endpoint.params.as_slice());
        if let Some(payload) = self.cache.get(&key) {
            debug!("cache hit: {}", key.as_str());
            return parse(&payload);
        }

        if let Some(header) = self.strategy.auth_header
            && self.api_key.is_none()
        {
            return Err(ApiError::Config(format!(
                "{} requires an API key ({header} header)",
                self.provider_key()
            )));
        }

        let url = endpoint.url(&self.base_url)?;
        let payload = self.guard.call(self.provider_key(), || self.get_json(&url)).await?;
        let parsed = parse(&payload)?;
        self.cache.set(key, payload, ttl);
        Ok(parsed)
    }

    async fn get_json(&self, url: &Url) -> ApiResult<Value> {
        let mut request = self.client.get(url.clone());
        if let (Some(header), Some(key)) = (self.strategy.auth_header, self.api_key.as_deref()) {
            request = request.header(header, key);
        }

        let target = url.as_str();
        let response = request.send().await.map_err(|e| ApiError::from_reqwest(e, target))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::from_status(status.as_u16(), target));
        }
        response.json::<Value>().await.map_err(|e| ApiError::from_reqwest(e, target))
    }
}

// ---------------------------------------------------------------------------
// Field helpers shared by the extractors
// ---------------------------------------------------------------------------

/// Integer from a number or a numeric string; anything else is `None`.
pub(crate) fn int_field(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| s.parse::<f64>().ok().map(|f| f.round() as i64))
        }
        _ => None,
    }
}

/// Float from a number or a numeric string.
pub(crate) fn float_field(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Id from a string or a number.
pub(crate) fn id_field(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_owned()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Epoch seconds from an RFC 3339 timestamp, tolerating a missing seconds
/// component ("2024-09-08T17:00Z").
pub(crate) fn epoch_from_rfc3339(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp());
    }
    let naive = raw.strip_suffix('Z').unwrap_or(raw);
    NaiveDateTime::parse_from_str(naive, "%Y-%m-%dT%H:%M")
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

/// Deserialize each element of an array individually so one malformed record
/// does not sink the rest.
pub(crate) fn parse_each<T: serde::de::DeserializeOwned>(
    items: &[Value],
    id_of: impl Fn(&Value) -> Option<String>,
) -> Vec<Result<T, RejectedRecord>> {
    items
        .iter()
        .map(|item| {
            serde_json::from_value::<T>(item.clone()).map_err(|e| RejectedRecord {
                external_id: id_of(item),
                reason: format!("malformed record: {e}"),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{BreakerConfig, BreakerPhase, BreakerRegistry, RetryPolicy};
    use mockito::Matcher;
    use serde_json::json;

    fn guard(max_attempts: u32, threshold: u32, cooldown: Duration) -> ResilienceGuard {
        ResilienceGuard::new(
            RetryPolicy {
                timeout: Duration::from_secs(2),
                max_attempts,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            Arc::new(BreakerRegistry::new(BreakerConfig {
                failure_threshold: threshold,
                success_threshold: 1,
                cooldown,
                half_open_max_probes: 1,
            })),
        )
    }

    fn espn_adapter(base: &str, guard: ResilienceGuard) -> ProviderAdapter {
        ProviderAdapter::new(League::Nfl, ProviderKind::Espn, Arc::new(ResponseCache::new()), guard)
            .with_base_url(base)
    }

    fn scoreboard() -> Value {
        json!({
            "events": [{
                "id": "401",
                "date": "2024-09-08T17:00Z",
                "season": {"year": 2024},
                "status": {"type": {"name": "STATUS_FINAL", "state": "post"}},
                "competitions": [{
                    "attendance": 70123,
                    "venue": {"fullName": "Lambeau Field"},
                    "competitors": [
                        {"homeAway": "home", "team": {"id": "9"}, "score": "24"},
                        {"homeAway": "away", "team": {"id": "3"}, "score": "17"}
                    ]
                }]
            }]
        })
    }

    #[test]
    fn status_codes_classify_into_taxonomy() {
        assert!(ApiError::from_status(503, "u").is_retryable());
        assert!(ApiError::from_status(429, "u").is_retryable());
        assert!(!ApiError::from_status(404, "u").is_retryable());
        assert!(!ApiError::from_status(401, "u").is_retryable());
    }

    #[test]
    fn status_map_defaults_unmapped_values_to_scheduled() {
        let map = StatusMap::new("test", &[("F", GameStatus::Final), ("FT", GameStatus::Final)]);
        assert_eq!(map.resolve(&["ft"]), GameStatus::Final);
        assert_eq!(map.resolve(&["??", "F"]), GameStatus::Final);
        assert_eq!(map.resolve(&["WEIRD"]), GameStatus::Scheduled);
        assert_eq!(map.resolve(&[]), GameStatus::Scheduled);
    }

    #[test]
    fn endpoint_urls_join_base_path_and_params() {
        let endpoint = Endpoint::new("/scoreboard").param("week", 3).param("seasontype", 2);
        assert_eq!(
            endpoint.url("http://host/api/").unwrap().as_str(),
            "http://host/api/scoreboard?week=3&seasontype=2"
        );
        assert_eq!(Endpoint::new("teams").url("http://host").unwrap().as_str(), "http://host/teams");
    }

    #[test]
    fn endpoint_query_values_are_percent_encoded() {
        let endpoint = Endpoint::new("search").param("team", "Montréal & Co").param("q", "a=b");
        let url = endpoint.url("http://host").unwrap();
        assert_eq!(url.as_str(), "http://host/search?team=Montr%C3%A9al+%26+Co&q=a%3Db");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs[0], ("team".to_string(), "Montréal & Co".to_string()));
        assert!(Endpoint::new("x").url("not a url").is_err());
    }

    #[test]
    fn field_helpers_tolerate_strings_and_numbers() {
        assert_eq!(int_field(Some(&json!("24"))), Some(24));
        assert_eq!(int_field(Some(&json!(24))), Some(24));
        assert_eq!(int_field(Some(&json!("-"))), None);
        assert_eq!(int_field(None), None);
        assert_eq!(id_field(Some(&json!(12))), Some("12".into()));
        assert_eq!(id_field(Some(&json!(""))), None);
        assert_eq!(float_field(Some(&json!(".543"))), Some(0.543));
        assert_eq!(epoch_from_rfc3339("2024-09-08T17:00Z"), Some(1_725_814_800));
        assert_eq!(epoch_from_rfc3339("2024-09-08T17:00:00Z"), Some(1_725_814_800));
    }

    #[tokio::test]
    async fn get_games_normalizes_and_caches() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/scoreboard")
            .match_query(Matcher::UrlEncoded("week".into(), "1".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(scoreboard().to_string())
            .expect(1)
            .create_async()
            .await;

        let adapter = espn_adapter(&server.url(), guard(3, 5, Duration::from_secs(30)));
        let params = SlateParams::week(Some(2024), 1);
        let first = adapter.get_games(&params).await.unwrap();
        let second = adapter.get_games(&params).await.unwrap();
        mock.assert_async().await;

        assert_eq!(first.games.len(), 1);
        let game = &first.games[0];
        assert_eq!(game.id, "nfl-401");
        assert_eq!(game.status, GameStatus::Final);
        assert_eq!(game.home_score, Some(24));
        assert_eq!(game.attendance, Some(70123));
        assert_eq!(game.venue.as_deref(), Some("Lambeau Field"));
        assert_eq!(first.games, second.games);
    }

    #[tokio::test]
    async fn failures_are_never_cached() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("GET", "/scoreboard")
            .match_query(Matcher::Any)
            .with_status(503)
            .expect(1)
            .create_async()
            .await;

        let adapter = espn_adapter(&server.url(), guard(1, 5, Duration::from_secs(30)));
        let params = SlateParams::week(None, 2);
        assert!(adapter.get_games(&params).await.is_err());
        failing.assert_async().await;
        failing.remove_async().await;

        let recovered = server
            .mock("GET", "/scoreboard")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(scoreboard().to_string())
            .expect(1)
            .create_async()
            .await;
        let slate = adapter.get_games(&params).await.unwrap();
        recovered.assert_async().await;
        assert_eq!(slate.games.len(), 1);
    }

    #[tokio::test]
    async fn client_errors_fail_immediately() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/scoreboard")
            .match_query(Matcher::Any)
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let adapter = espn_adapter(&server.url(), guard(4, 5, Duration::from_secs(30)));
        let err = adapter.get_games(&SlateParams::week(None, 1)).await.unwrap_err();
        mock.assert_async().await;
        assert!(matches!(
            err,
            ApiError::Permanent { kind: PermanentKind::Status(404), .. }
        ));
    }

    #[tokio::test]
    async fn malformed_body_is_permanent_and_not_cached() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/scoreboard")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("<html>maintenance</html>")
            .expect(2)
            .create_async()
            .await;

        let adapter = espn_adapter(&server.url(), guard(3, 5, Duration::from_secs(30)));
        for _ in 0..2 {
            let err = adapter.get_games(&SlateParams::week(None, 1)).await.unwrap_err();
            assert!(matches!(err, ApiError::Permanent { kind: PermanentKind::Malformed(_), .. }));
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn breaker_opens_after_repeated_503_and_recovers() {
        let mut server = mockito::Server::new_async().await;
        let unavailable = server
            .mock("GET", "/scoreboard")
            .match_query(Matcher::Any)
            .with_status(503)
            .expect(5)
            .create_async()
            .await;

        let guard = guard(1, 5, Duration::from_millis(100));
        let breakers = guard.breakers().clone();
        let adapter = espn_adapter(&server.url(), guard);
        let params = SlateParams::week(None, 1);

        for _ in 0..5 {
            let err = adapter.get_games(&params).await.unwrap_err();
            assert!(err.is_retryable());
        }
        assert_eq!(breakers.breaker("espn").phase(), BreakerPhase::Open);

        let err = adapter.get_games(&params).await.unwrap_err();
        assert!(err.is_breaker_open());
        unavailable.assert_async().await;
        unavailable.remove_async().await;

        let healthy = server
            .mock("GET", "/scoreboard")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(scoreboard().to_string())
            .expect(1)
            .create_async()
            .await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        let slate = adapter.get_games(&params).await.unwrap();
        healthy.assert_async().await;
        assert_eq!(slate.games.len(), 1);
        assert_eq!(breakers.breaker("espn").phase(), BreakerPhase::Closed);
    }

    #[tokio::test]
    async fn keyed_provider_without_key_is_a_config_error() {
        let adapter = ProviderAdapter::new(
            League::Nba,
            ProviderKind::SportsData,
            Arc::new(ResponseCache::new()),
            guard(1, 5, Duration::from_secs(1)),
        )
        .with_base_url("http://127.0.0.1:9");
        let err = adapter.get_teams().await.unwrap_err();
        assert!(matches!(err, ApiError::Config(_)));
    }

    #[tokio::test]
    async fn keyed_provider_sends_auth_header() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/teams")
            .match_query(Matcher::Any)
            .match_header("x-apisports-key", "secret")
            .with_status(200)
            .with_body(json!({"errors": [], "response": [{"id": 5, "name": "Boston Celtics", "code": "BOS"}]}).to_string())
            .create_async()
            .await;

        let adapter = ProviderAdapter::new(
            League::Nba,
            ProviderKind::SportsData,
            Arc::new(ResponseCache::new()),
            guard(1, 5, Duration::from_secs(1)),
        )
        .with_base_url(server.url())
        .with_api_key(Some("secret".into()));
        let teams = adapter.get_teams().await.unwrap();
        mock.assert_async().await;
        assert_eq!(teams.len(), 1);
        assert_eq!(teams[0].id, "nba-team-5");
    }
}
