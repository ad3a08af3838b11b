use crate::orchestrator::{BackfillRange, CancelToken, IngestionRun};
use league_api::{League, SlateParams};

#[derive(Debug, Clone)]
pub enum IngestRequest {
    Slate { league: League, params: SlateParams },
    Backfill {
        league: League,
        range: BackfillRange,
        season: Option<i32>,
        cancel: CancelToken,
    },
    /// Teams and standings.
    Reference { league: League, season: Option<i32> },
}

impl IngestRequest {
    pub fn league(&self) -> League {
        match self {
            IngestRequest::Slate { league, .. }
            | IngestRequest::Backfill { league, .. }
            | IngestRequest::Reference { league, .. } => *league,
        }
    }
}

#[derive(Debug)]
pub enum IngestResponse {
    /// The pass ran to completion; outcome may still be partial.
    Completed { run: IngestionRun },
    /// Another pass for the league was in flight.
    Skipped { league: League },
    Failed {
        league: League,
        message: String,
        run: Option<IngestionRun>,
    },
}
