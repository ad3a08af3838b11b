use crate::live::hub::{LiveConfig, LiveHub};
use crate::orchestrator::IngestionOrchestrator;
use crate::store::CanonicalStore;
use anyhow::{Context, bail};
use league_api::League;
use league_api::cache::ResponseCache;
use league_api::client::{CacheTtl, ProviderAdapter, ProviderKind};
use league_api::resilience::{BreakerConfig, BreakerRegistry, ResilienceGuard, RetryPolicy};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const CONFIG_ENV: &str = "SLATEWIRE_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub database: PathBuf,
    pub bind: String,
    /// Default `EnvFilter` directive; `RUST_LOG` wins when set.
    pub log_level: String,
    pub schedule_secs: u64,
    pub reference_secs: u64,
    pub sportsdata_key: Option<String>,
    pub resilience: ResilienceSettings,
    pub cache: CacheSettings,
    pub live: LiveConfig,
    /// Keyed by league code.
    pub leagues: BTreeMap<String, LeagueSettings>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            database: PathBuf::from("slatewire.db"),
            bind: "127.0.0.1:8790".into(),
            log_level: "info".into(),
            schedule_secs: 900,
            reference_secs: 86_400,
            sportsdata_key: None,
            resilience: ResilienceSettings::default(),
            cache: CacheSettings::default(),
            live: LiveConfig::default(),
            leagues: League::ALL
                .iter()
                .map(|l| (l.code().to_owned(), LeagueSettings::default()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceSettings {
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cooldown_secs: u64,
    pub half_open_max_probes: u32,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        let breaker = BreakerConfig::default();
        Self {
            timeout_secs: retry.timeout.as_secs(),
            max_attempts: retry.max_attempts,
            base_delay_ms: retry.base_delay.as_millis() as u64,
            max_delay_ms: retry.max_delay.as_millis() as u64,
            failure_threshold: breaker.failure_threshold,
            success_threshold: breaker.success_threshold,
            cooldown_secs: breaker.cooldown.as_secs(),
            half_open_max_probes: breaker.half_open_max_probes,
        }
    }
}

impl ResilienceSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_secs(self.timeout_secs.max(1)),
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms)),
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold.max(1),
            success_threshold: self.success_threshold.max(1),
            cooldown: Duration::from_secs(self.cooldown_secs),
            half_open_max_probes: self.half_open_max_probes.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub games_ttl_secs: u64,
    pub standings_ttl_secs: u64,
    pub teams_ttl_secs: u64,
    /// How often expired entries are purged while serving.
    pub sweep_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        let ttl = CacheTtl::default();
        Self {
            games_ttl_secs: ttl.games.as_secs(),
            standings_ttl_secs: ttl.standings.as_secs(),
            teams_ttl_secs: ttl.teams.as_secs(),
            sweep_secs: 300,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> CacheTtl {
        CacheTtl {
            games: Duration::from_secs(self.games_ttl_secs),
            standings: Duration::from_secs(self.standings_ttl_secs),
            teams: Duration::from_secs(self.teams_ttl_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeagueSettings {
    pub enabled: bool,
    /// Falls back to the league's usual provider.
    pub provider: Option<ProviderKind>,
    pub base_url: Option<String>,
    /// Overrides `sportsdata_key` for this league.
    pub api_key: Option<String>,
}

impl Default for LeagueSettings {
    fn default() -> Self {
        Self { enabled: true, provider: None, base_url: None, api_key: None }
    }
}

impl LeagueSettings {
    pub fn provider_for(&self, league: League) -> ProviderKind {
        self.provider.unwrap_or_else(|| ProviderKind::default_for(league))
    }
}

impl AppSettings {
    /// Defaults, then the TOML file named by `SLATEWIRE_CONFIG`, then
    /// `SLATEWIRE_*` environment overrides (a `.env` file counts).
    pub fn load() -> anyhow::Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!("loaded environment from {}", path.display());
        }
        let mut settings = match std::env::var(CONFIG_ENV) {
            Ok(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config file {path}"))?;
                let settings = Self::parse_toml(&text).with_context(|| format!("parsing {path}"))?;
                info!("configuration loaded from {path}");
                settings
            }
            Err(_) => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    pub fn parse_toml(text: &str) -> anyhow::Result<Self> {
        let mut settings: Self = toml::from_str(text)?;
        for code in settings.leagues.keys() {
            if code.parse::<League>().is_err() {
                bail!("unknown league in [leagues]: {code}");
            }
        }
        // a partial [leagues] table still leaves the others enabled
        for league in League::ALL {
            settings.leagues.entry(league.code().to_owned()).or_default();
        }
        Ok(settings)
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(db) = lookup("SLATEWIRE_DB") {
            self.database = PathBuf::from(db);
        }
        if let Some(bind) = lookup("SLATEWIRE_BIND") {
            self.bind = bind;
        }
        if let Some(level) = lookup("SLATEWIRE_LOG") {
            self.log_level = level;
        }
        if let Some(secs) = lookup("SLATEWIRE_SCHEDULE_SECS") {
            let secs: u64 = secs
                .trim()
                .parse()
                .with_context(|| format!("SLATEWIRE_SCHEDULE_SECS must be a number of seconds, got {secs:?}"))?;
            if secs == 0 {
                bail!("SLATEWIRE_SCHEDULE_SECS must be positive");
            }
            self.schedule_secs = secs;
        }
        if let Some(key) = lookup("SLATEWIRE_SPORTSDATA_KEY").filter(|k| !k.trim().is_empty()) {
            self.sportsdata_key = Some(key);
        }
        Ok(())
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_secs.max(1))
    }

    pub fn reference_interval(&self) -> Duration {
        Duration::from_secs(self.reference_secs.max(60))
    }

    pub fn enabled_leagues(&self) -> Vec<League> {
        League::ALL
            .into_iter()
            .filter(|league| self.league(*league).enabled)
            .collect()
    }

    pub fn league(&self, league: League) -> LeagueSettings {
        self.leagues.get(league.code()).cloned().unwrap_or_default()
    }

    /// Adapter for one league, sharing the given cache and guard.
    pub fn adapter(&self, league: League, cache: Arc<ResponseCache>, guard: ResilienceGuard) -> ProviderAdapter {
        let settings = self.league(league);
        let kind = settings.provider_for(league);
        let api_key = settings.api_key.clone().or_else(|| match kind {
            ProviderKind::SportsData => self.sportsdata_key.clone(),
            _ => None,
        });
        let mut adapter = ProviderAdapter::new(league, kind, cache, guard)
            .with_api_key(api_key)
            .with_ttl(self.cache.ttl());
        if let Some(base_url) = settings.base_url {
            adapter = adapter.with_base_url(base_url);
        }
        adapter
    }

    /// Wire every enabled league's adapter into an orchestrator, all sharing
    /// `cache`. The returned registry is the one the adapters report breaker
    /// state to.
    pub fn build_orchestrator(
        &self,
        store: Arc<CanonicalStore>,
        cache: Arc<ResponseCache>,
        hub: Option<LiveHub>,
    ) -> (IngestionOrchestrator, Arc<BreakerRegistry>) {
        let breakers = Arc::new(BreakerRegistry::new(self.resilience.breaker_config()));
        let guard = ResilienceGuard::new(self.resilience.retry_policy(), breakers.clone());

        let mut orchestrator = IngestionOrchestrator::new(store);
        for league in self.enabled_leagues() {
            let adapter = self.adapter(league, cache.clone(), guard.clone());
            info!("{league}: ingesting from {} at {}", adapter.kind(), adapter.base_url());
            orchestrator = orchestrator.with_adapter(adapter);
        }
        if let Some(hub) = hub {
            orchestrator = orchestrator.with_hub(hub);
        }
        (orchestrator, breakers)
    }
}
