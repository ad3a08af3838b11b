use anyhow::{Context, bail};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use league_api::cache::ResponseCache;
use league_api::{League, SlateParams};
use log::{error, info, warn};
use slatewire::live::hub::LiveHub;
use slatewire::orchestrator::{BackfillRange, CancelToken, IngestError, IngestionOrchestrator, IngestionRun};
use slatewire::server::{self, AppState};
use slatewire::state::app_settings::AppSettings;
use slatewire::state::refresher::PeriodicRefresher;
use slatewire::state::worker::IngestWorker;
use slatewire::store::CanonicalStore;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Pending trigger requests before the HTTP surface answers 503.
const TRIGGER_QUEUE: usize = 64;

#[derive(Debug, Parser)]
#[command(name = "slatewire", version, about = "Multi-provider sports slate ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP surface, live hub, scheduler and ingest worker.
    Serve,
    /// One slate pass.
    Run {
        league: League,
        #[arg(long, conflicts_with = "date")]
        week: Option<u32>,
        /// YYYY-MM-DD
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        season: Option<i32>,
    },
    /// Ingest a range of weeks or days.
    Backfill {
        league: League,
        /// Inclusive week range, e.g. 1..18
        #[arg(long, value_parser = parse_weeks, required_unless_present = "from", conflicts_with = "from")]
        weeks: Option<BackfillRange>,
        #[arg(long, requires = "to")]
        from: Option<NaiveDate>,
        #[arg(long, requires = "from")]
        to: Option<NaiveDate>,
        #[arg(long)]
        season: Option<i32>,
    },
    /// Refresh teams and standings.
    Reference {
        league: League,
        #[arg(long)]
        season: Option<i32>,
    },
    /// Print recent ingestion runs as JSON.
    Runs {
        #[arg(long)]
        league: Option<League>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Ask a running server for breaker states and last runs.
    Health,
}

fn parse_weeks(raw: &str) -> Result<BackfillRange, String> {
    let (start, end) = raw
        .split_once("..")
        .ok_or_else(|| format!("expected START..END, got {raw:?}"))?;
    let start = start.trim().parse::<u32>().map_err(|e| format!("start week: {e}"))?;
    let end = end.trim().trim_start_matches('=').parse::<u32>().map_err(|e| format!("end week: {e}"))?;
    Ok(BackfillRange::Weeks { start, end })
}

fn init_logging(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = AppSettings::load()?;
    init_logging(&settings.log_level);

    match cli.command {
        Command::Serve => serve(settings).await,
        Command::Run { league, week, date, season } => {
            let params = match (week, date) {
                (Some(week), _) => SlateParams::week(season, week),
                (None, Some(date)) => SlateParams::date(season, date),
                (None, None) => SlateParams { season, ..SlateParams::current() },
            };
            let orchestrator = one_shot(&settings, league)?;
            report(orchestrator.run_slate(league, params).await)
        }
        Command::Backfill { league, weeks, from, to, season } => {
            let range = match (weeks, from, to) {
                (Some(range), _, _) => range,
                (None, Some(start), Some(end)) => BackfillRange::Dates { start, end },
                _ => bail!("pass --weeks A..B or --from/--to"),
            };
            let orchestrator = one_shot(&settings, league)?;
            let cancel = CancelToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, stopping after the current unit");
                    on_interrupt.cancel();
                }
            });
            report(orchestrator.backfill(league, range, season, &cancel).await)
        }
        Command::Reference { league, season } => {
            let orchestrator = one_shot(&settings, league)?;
            report(orchestrator.refresh_reference(league, season).await)
        }
        Command::Runs { league, limit } => {
            let store = CanonicalStore::open(&settings.database)
                .with_context(|| format!("opening {}", settings.database.display()))?;
            let runs = store.recent_runs(league, limit)?;
            println!("{}", serde_json::to_string_pretty(&runs)?);
            Ok(())
        }
        Command::Health => {
            let url = format!("http://{}/health", settings.bind);
            let body: serde_json::Value = reqwest::get(&url)
                .await
                .with_context(|| format!("no server answering at {url}"))?
                .json()
                .await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
    }
}

fn one_shot(settings: &AppSettings, league: League) -> anyhow::Result<IngestionOrchestrator> {
    if !settings.league(league).enabled {
        bail!("{league} is disabled in the configuration");
    }
    let store = CanonicalStore::open(&settings.database)
        .with_context(|| format!("opening {}", settings.database.display()))?;
    let (orchestrator, _) =
        settings.build_orchestrator(Arc::new(store), Arc::new(ResponseCache::new()), None);
    Ok(orchestrator)
}

fn report(result: Result<IngestionRun, IngestError>) -> anyhow::Result<()> {
    match result {
        Ok(run) => {
            println!("{}", serde_json::to_string_pretty(&run)?);
            Ok(())
        }
        Err(err) => {
            if let Some(run) = err.run() {
                println!("{}", serde_json::to_string_pretty(run)?);
            }
            Err(err.into())
        }
    }
}

async fn serve(settings: AppSettings) -> anyhow::Result<()> {
    let store = CanonicalStore::open(&settings.database)
        .with_context(|| format!("opening {}", settings.database.display()))?;
    let hub = LiveHub::new(settings.live);
    let cache = Arc::new(ResponseCache::new());
    let (orchestrator, breakers) =
        settings.build_orchestrator(Arc::new(store), cache.clone(), Some(hub.clone()));
    let orchestrator = Arc::new(orchestrator);
    if orchestrator.leagues().is_empty() {
        bail!("every league is disabled; nothing to ingest");
    }

    let (ingest_tx, ingest_rx) = mpsc::channel(TRIGGER_QUEUE);
    let worker_task = tokio::spawn(IngestWorker::new(orchestrator.clone(), ingest_rx).run());
    let refresher_task = tokio::spawn(
        PeriodicRefresher::new(
            ingest_tx.clone(),
            orchestrator.leagues(),
            settings.schedule_interval(),
            settings.reference_interval(),
        )
        .run(),
    );
    let emitter_task = tokio::spawn(hub.clone().run_emitter());
    let sweeper_task = tokio::spawn(cache.sweep_every(settings.cache.sweep_interval()));

    let listener = TcpListener::bind(&settings.bind)
        .await
        .with_context(|| format!("binding {}", settings.bind))?;
    let state = AppState::new(orchestrator, hub, breakers, ingest_tx);
    let result = server::serve(listener, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {e}");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
    })
    .await;

    refresher_task.abort();
    worker_task.abort();
    emitter_task.abort();
    sweeper_task.abort();
    result.context("http server failed")
}
