use league_api::resilience::{BreakerConfig, BreakerRegistry};
use league_api::{CanonicalGame, GameStatus, League};
use slatewire::live::client::{ClientEvent, LiveClient};
use slatewire::live::hub::{LiveConfig, LiveHub};
use slatewire::live::transport::TransportKind;
use slatewire::orchestrator::IngestionOrchestrator;
use slatewire::server::{self, AppState};
use slatewire::store::CanonicalStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

async fn live_server() -> (String, LiveHub) {
    let hub = LiveHub::new(LiveConfig { emit_interval_ms: 20, ..LiveConfig::default() });
    tokio::spawn(hub.clone().run_emitter());

    let store = Arc::new(CanonicalStore::open_in_memory().unwrap());
    let orchestrator = Arc::new(IngestionOrchestrator::new(store).with_hub(hub.clone()));
    let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default()));
    let (triggers, _) = mpsc::channel(1);
    let state = AppState::new(orchestrator, hub.clone(), breakers, triggers);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(server::serve(listener, state, std::future::pending()));
    (base, hub)
}

fn game(ext: &str, home_score: i64) -> CanonicalGame {
    CanonicalGame {
        id: CanonicalGame::canonical_id(League::Mlb, ext),
        league: League::Mlb,
        external_id: ext.into(),
        season_id: "2024".into(),
        home_team_id: "mlb-team-147".into(),
        away_team_id: "mlb-team-111".into(),
        scheduled_at: 1_711_900_000,
        status: GameStatus::Live,
        home_score: Some(home_score),
        away_score: Some(2),
        venue: Some("Yankee Stadium".into()),
        attendance: None,
        updated_at: 1_711_900_000,
    }
}

async fn next(rx: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no client event within 5s")
        .expect("client stopped")
}

async fn first_update(rx: &mut mpsc::Receiver<ClientEvent>, hub: &LiveHub) -> ClientEvent {
    // keep publishing until one lands; the subscription may trail the connect
    for score in 3.. {
        hub.publish(League::Mlb, vec![game("745001", score)]);
        match tokio::time::timeout(Duration::from_millis(300), rx.recv()).await {
            Ok(Some(event)) => return event,
            Ok(None) => panic!("client stopped"),
            Err(_) if score < 20 => continue,
            Err(_) => panic!("no update delivered"),
        }
    }
    unreachable!()
}

#[tokio::test]
async fn client_negotiates_websocket_and_receives_updates() {
    let (base, hub) = live_server().await;
    let (tx, mut rx) = mpsc::channel(16);
    let client = tokio::spawn(LiveClient::new(base, League::Mlb, tx).run());

    assert_eq!(next(&mut rx).await, ClientEvent::Connected { transport: TransportKind::WebSocket });
    let ClientEvent::Update(event) = first_update(&mut rx, &hub).await else {
        panic!("expected an update");
    };
    assert_eq!(event.league, League::Mlb);
    assert_eq!(event.changed_records[0].id, "mlb-745001");

    drop(rx);
    tokio::time::timeout(Duration::from_secs(5), client).await.unwrap().unwrap();
}

#[tokio::test]
async fn polling_only_client_sees_the_same_updates() {
    let (base, hub) = live_server().await;
    let (tx, mut rx) = mpsc::channel(16);
    let client = tokio::spawn(
        LiveClient::new(base, League::Mlb, tx)
            .allow(&[TransportKind::Polling])
            .run(),
    );

    assert_eq!(next(&mut rx).await, ClientEvent::Connected { transport: TransportKind::Polling });
    let ClientEvent::Update(event) = first_update(&mut rx, &hub).await else {
        panic!("expected an update");
    };
    assert!(event.sequence.is_some());
    assert_eq!(event.changed_records[0].venue.as_deref(), Some("Yankee Stadium"));

    drop(rx);
    tokio::time::timeout(Duration::from_secs(5), client).await.unwrap().unwrap();
}
