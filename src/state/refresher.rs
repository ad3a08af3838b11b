use crate::state::messages::IngestRequest;
use league_api::{League, SlateParams};
use log::{debug, info};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};

/// Scheduled triggers: the current slate for every enabled league on each
/// schedule tick, and teams/standings on the slower reference tick. Both fire
/// once at startup; when the ticks coincide the slates go out first.
pub struct PeriodicRefresher {
    ingest_requests: mpsc::Sender<IngestRequest>,
    leagues: Vec<League>,
    slate_every: Duration,
    reference_every: Duration,
}

impl PeriodicRefresher {
    pub fn new(
        ingest_requests: mpsc::Sender<IngestRequest>,
        leagues: Vec<League>,
        slate_every: Duration,
        reference_every: Duration,
    ) -> Self {
        Self { ingest_requests, leagues, slate_every, reference_every }
    }

    pub async fn run(self) {
        let mut slate_interval = interval(self.slate_every);
        let mut reference_interval = interval(self.reference_every);
        slate_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        reference_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "refresher: {} leagues, slates every {:?}, reference every {:?}",
            self.leagues.len(),
            self.slate_every,
            self.reference_every
        );

        loop {
            let requests: Vec<IngestRequest> = tokio::select! {
                biased;
                _ = slate_interval.tick() => self
                    .leagues
                    .iter()
                    .map(|&league| IngestRequest::Slate { league, params: SlateParams::current() })
                    .collect(),
                _ = reference_interval.tick() => self
                    .leagues
                    .iter()
                    .map(|&league| IngestRequest::Reference { league, season: None })
                    .collect(),
            };

            for request in requests {
                debug!("refresher: triggering {}", request.league());
                if self.ingest_requests.send(request).await.is_err() {
                    info!("refresher stopped: worker is gone");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_for_every_league_and_stops_with_worker() {
        let (tx, mut rx) = mpsc::channel(16);
        let refresher = PeriodicRefresher::new(
            tx,
            vec![League::Nfl, League::Mlb],
            Duration::from_millis(20),
            Duration::from_secs(3600),
        );
        let task = tokio::spawn(refresher.run());

        let mut slates = Vec::new();
        let mut references = 0;
        while slates.len() < 4 {
            match rx.recv().await.unwrap() {
                IngestRequest::Slate { league, params } => {
                    assert_eq!(params, SlateParams::current());
                    slates.push(league);
                }
                IngestRequest::Reference { .. } => references += 1,
                other => panic!("unexpected request: {other:?}"),
            }
        }
        assert_eq!(&slates[..2], &[League::Nfl, League::Mlb]);
        assert!(references <= 2);

        drop(rx);
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
