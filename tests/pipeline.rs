use league_api::cache::ResponseCache;
use league_api::client::{ApiError, ProviderAdapter, ProviderKind};
use league_api::resilience::{BreakerConfig, BreakerPhase, BreakerRegistry, ResilienceGuard, RetryPolicy};
use league_api::{CanonicalGame, GameStatus, League, SlateParams};
use mockito::Matcher;
use serde_json::{Value, json};
use slatewire::orchestrator::{BackfillRange, CancelToken, IngestError, IngestionOrchestrator, RunOutcome};
use slatewire::store::CanonicalStore;
use std::sync::Arc;
use std::time::Duration;

fn guard(breakers: Arc<BreakerRegistry>) -> ResilienceGuard {
    let policy = RetryPolicy {
        timeout: Duration::from_secs(2),
        max_attempts: 1,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(1),
    };
    ResilienceGuard::new(policy, breakers)
}

fn nfl_pipeline(base_url: &str, breakers: Arc<BreakerRegistry>) -> IngestionOrchestrator {
    let adapter = ProviderAdapter::new(League::Nfl, ProviderKind::Espn, Arc::new(ResponseCache::new()), guard(breakers))
        .with_base_url(base_url);
    let store = Arc::new(CanonicalStore::open_in_memory().unwrap());
    IngestionOrchestrator::new(store).with_adapter(adapter)
}

fn espn_event(id: &str, home: Option<&str>, state: &str, scores: (u32, u32)) -> Value {
    let name = match state {
        "pre" => "STATUS_SCHEDULED",
        "in" => "STATUS_IN_PROGRESS",
        _ => "STATUS_FINAL",
    };
    let mut home_side = json!({"homeAway": "home", "score": scores.0.to_string()});
    if let Some(home) = home {
        home_side["team"] = json!({"id": home});
    }
    json!({
        "id": id,
        "date": "2024-09-08T17:00Z",
        "status": {"type": {"name": name, "state": state}},
        "competitions": [{"competitors": [
            home_side,
            {"homeAway": "away", "team": {"id": "20"}, "score": scores.1.to_string()}
        ]}]
    })
}

#[tokio::test]
async fn slate_with_new_changed_and_invalid_games() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/scoreboard")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            json!({"events": [
                espn_event("401", Some("10"), "post", (31, 3)),
                espn_event("402", Some("11"), "post", (21, 14)),
                espn_event("403", None, "post", (7, 0)),
            ]})
            .to_string(),
        )
        .create_async()
        .await;

    let orch = nfl_pipeline(&server.url(), Arc::new(BreakerRegistry::new(BreakerConfig::default())));
    let before = CanonicalGame {
        id: "nfl-402".into(),
        league: League::Nfl,
        external_id: "402".into(),
        season_id: "2024".into(),
        home_team_id: "nfl-team-11".into(),
        away_team_id: "nfl-team-20".into(),
        scheduled_at: 1_725_814_800,
        status: GameStatus::Scheduled,
        home_score: Some(21),
        away_score: Some(14),
        venue: None,
        attendance: None,
        updated_at: 1_725_000_000,
    };
    orch.store().upsert_game(&before).unwrap();

    let run = orch.run_slate(League::Nfl, SlateParams::current()).await.unwrap();
    assert_eq!(
        (run.records_inserted, run.records_updated, run.records_failed),
        (1, 1, 1),
        "{run:?}"
    );
    assert_eq!(run.errors.len(), 1);
    assert!(run.errors[0].contains("403"), "{:?}", run.errors);
    assert_eq!(run.outcome, RunOutcome::Partial);

    let after = orch.store().get_game("nfl-402").unwrap().unwrap();
    assert_eq!(after.status, GameStatus::Final);
    assert_eq!((after.home_score, after.away_score), (Some(21), Some(14)));
    assert!(orch.store().get_game("nfl-403").unwrap().is_none());
    assert_eq!(orch.store().count_games(Some(League::Nfl)).unwrap(), 2);
}

#[tokio::test]
async fn breaker_opens_short_circuits_and_recovers() {
    let mut server = mockito::Server::new_async().await;
    let failing = server
        .mock("GET", "/scoreboard")
        .match_query(Matcher::Any)
        .with_status(503)
        .expect(5)
        .create_async()
        .await;

    let breakers = Arc::new(BreakerRegistry::new(BreakerConfig {
        failure_threshold: 5,
        success_threshold: 1,
        cooldown: Duration::from_millis(150),
        half_open_max_probes: 1,
    }));
    let orch = nfl_pipeline(&server.url(), breakers.clone());

    for _ in 0..5 {
        let err = orch.run_slate(League::Nfl, SlateParams::current()).await.unwrap_err();
        let IngestError::Upstream { source, .. } = err else {
            panic!("expected an upstream failure");
        };
        assert!(source.is_retryable(), "{source}");
    }
    assert_eq!(breakers.breaker("espn").phase(), BreakerPhase::Open);

    let err = orch.run_slate(League::Nfl, SlateParams::current()).await.unwrap_err();
    let IngestError::Upstream { run, source } = err else {
        panic!("expected an upstream failure");
    };
    assert!(matches!(source, ApiError::BreakerOpen { .. }), "{source}");
    assert_eq!(run.outcome, RunOutcome::Failed);
    // the sixth pass never reached the upstream
    failing.assert_async().await;

    failing.remove_async().await;
    let _healthy = server
        .mock("GET", "/scoreboard")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(json!({"events": [espn_event("401", Some("10"), "post", (24, 10))]}).to_string())
        .expect(1)
        .create_async()
        .await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let run = orch.run_slate(League::Nfl, SlateParams::current()).await.unwrap();
    assert_eq!(run.records_inserted, 1);
    assert_eq!(breakers.breaker("espn").phase(), BreakerPhase::Closed);

    // six failed passes and the recovery are all on record
    let runs = orch.store().recent_runs(Some(League::Nfl), 10).unwrap();
    assert_eq!(runs.len(), 7);
    assert_eq!(runs[0].outcome, RunOutcome::Succeeded);
    assert!(runs[1..].iter().all(|r| r.outcome == RunOutcome::Failed));
}

#[tokio::test]
async fn eighteen_week_backfill_aggregates_every_unit() {
    let mut server = mockito::Server::new_async().await;
    let mut mocks = Vec::new();
    for week in 1..=18u32 {
        let mut events = vec![
            espn_event(&format!("w{week}"), Some("10"), "post", (week, 0)),
            espn_event("opener", Some("12"), "post", (20, 17)),
        ];
        if week % 2 == 0 {
            events.push(espn_event(&format!("bad{week}"), None, "post", (0, 0)));
        }
        let mock = server
            .mock("GET", "/scoreboard")
            .match_query(Matcher::UrlEncoded("week".into(), week.to_string()))
            .with_status(200)
            .with_body(json!({ "events": events }).to_string())
            .expect(1)
            .create_async()
            .await;
        mocks.push(mock);
    }

    let orch = nfl_pipeline(&server.url(), Arc::new(BreakerRegistry::new(BreakerConfig::default())));
    let run = orch
        .backfill(League::Nfl, BackfillRange::Weeks { start: 1, end: 18 }, None, &CancelToken::new())
        .await
        .unwrap();

    for mock in &mocks {
        mock.assert_async().await;
    }
    // one new game per week plus "opener" once; "opener" is re-seen 17 times
    assert_eq!(run.records_processed, 18 * 2 + 9);
    assert_eq!(run.records_inserted, 19);
    assert_eq!(run.records_updated, 17);
    assert_eq!(run.records_failed, 9);

    let expected: Vec<String> = (1..=18).filter(|w| w % 2 == 0).map(|w| format!("bad{w}")).collect();
    assert_eq!(run.errors.len(), expected.len());
    for (error, id) in run.errors.iter().zip(&expected) {
        assert!(error.contains(id.as_str()), "{error} should name {id}");
    }
    assert_eq!(run.scope, "weeks 1..18");
    assert_eq!(orch.store().recent_runs(None, 10).unwrap(), vec![run]);
}
