use crate::orchestrator::{IngestError, IngestionOrchestrator};
use crate::state::messages::{IngestRequest, IngestResponse};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Times a reference refresh waits out a busy league before giving up.
const REFERENCE_ATTEMPTS: u32 = 3;

/// Receives trigger requests from the refresher and the HTTP surface and runs
/// each as its own task. Passes for different leagues overlap; a second
/// request for a busy league is turned away by the orchestrator.
pub struct IngestWorker {
    orchestrator: Arc<IngestionOrchestrator>,
    requests: mpsc::Receiver<IngestRequest>,
    responses: Option<mpsc::Sender<IngestResponse>>,
}

impl IngestWorker {
    pub fn new(
        orchestrator: Arc<IngestionOrchestrator>,
        requests: mpsc::Receiver<IngestRequest>,
    ) -> Self {
        Self { orchestrator, requests, responses: None }
    }

    /// Report every finished request on `responses`.
    pub fn with_responses(mut self, responses: mpsc::Sender<IngestResponse>) -> Self {
        self.responses = Some(responses);
        self
    }

    pub async fn run(mut self) {
        while let Some(request) = self.requests.recv().await {
            debug!("{}: ingest request received", request.league());
            let orchestrator = self.orchestrator.clone();
            let responses = self.responses.clone();
            tokio::spawn(async move {
                let response = handle(&orchestrator, request).await;
                if let Some(responses) = responses
                    && let Err(e) = responses.send(response).await
                {
                    error!("Failed to send ingest response: {e}");
                }
            });
        }
        info!("ingest worker stopped: request channel closed");
    }
}

pub async fn handle(orchestrator: &IngestionOrchestrator, request: IngestRequest) -> IngestResponse {
    let league = request.league();
    let result = match request {
        IngestRequest::Slate { league, params } => orchestrator.run_slate(league, params).await,
        IngestRequest::Backfill { league, range, season, cancel } => {
            orchestrator.backfill(league, range, season, &cancel).await
        }
        IngestRequest::Reference { league, season } => {
            // the reference tick lands on a slate tick; queue behind that pass
            let mut attempt = 1;
            loop {
                match orchestrator.refresh_reference(league, season).await {
                    Err(IngestError::AlreadyRunning(_)) if attempt < REFERENCE_ATTEMPTS => {
                        debug!("{league}: reference refresh waiting for the running pass");
                        attempt += 1;
                        orchestrator.wait_idle(league).await;
                    }
                    result => break result,
                }
            }
        }
    };

    match result {
        Ok(run) => IngestResponse::Completed { run },
        Err(IngestError::AlreadyRunning(league)) => {
            warn!("{league}: pass already in flight, request skipped");
            IngestResponse::Skipped { league }
        }
        Err(err) => {
            let run = err.run().cloned();
            IngestResponse::Failed { league, message: err.to_string(), run }
        }
    }
}
