use std::sync::Arc;

use chrono::NaiveDate;
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::{
    BatchFailure, BatchFetchError, BatchFetcher, BatchSpec, BatchState, CrawlerState, FetchError,
    RepositoryPersister, StorageError,
};

/// A worker crawler, pulling batches from the shared state until none is left.
pub struct WorkerCrawler {
    /// The worker number, for logs.
    id: usize,
    fetcher: Arc<dyn BatchFetcher>,
    persister: Arc<dyn RepositoryPersister>,
    state: Arc<CrawlerState>,
    cancellation: CancellationToken,
    /// The date of the star snapshots, fixed for the whole run.
    snapshot_date: NaiveDate,
}

impl WorkerCrawler {
    /// Creates a new `WorkerCrawler` instance with the given fetcher and persister.
    pub fn new(
        id: usize,
        fetcher: Arc<dyn BatchFetcher>,
        persister: Arc<dyn RepositoryPersister>,
        state: Arc<CrawlerState>,
        cancellation: CancellationToken,
        snapshot_date: NaiveDate,
    ) -> Self {
        Self {
            id,
            fetcher,
            persister,
            state,
            cancellation,
            snapshot_date,
        }
    }

    /// Processes pending batches until the queue is drained or the run is cancelled.
    pub async fn run(&self) {
        while !self.cancellation.is_cancelled() {
            let Some(batch) = self.state.pop_batch().await else {
                break;
            };
            info!("Worker #{} processing {batch}", self.id);
            self.process_batch(&batch).await;
            warn!("{}", self.state.state_summary().await);
        }
        info!("Worker #{} stopped", self.id);
    }

    async fn process_batch(&self, batch: &BatchSpec) {
        self.state.transition(batch, BatchState::Fetching).await;
        let fetched = match self.fetcher.fetch_batch(batch).await {
            Ok(fetched) => fetched,
            Err(BatchFetchError {
                error: FetchError::Cancelled,
                ..
            }) => {
                self.state.record_skipped(batch).await;
                return;
            }
            Err(BatchFetchError { error, attempts }) => {
                if error.is_run_fatal() {
                    error!("Cancelling the run after a run-fatal error: {error}");
                    self.cancellation.cancel();
                }
                self.state
                    .record_failure(BatchFailure::new(
                        batch.clone(),
                        &error.to_string(),
                        attempts,
                    ))
                    .await;
                return;
            }
        };
        debug!(
            "{batch} fetched {} repositories over {} page(s)",
            fetched.repositories().len(),
            fetched.pages()
        );
        if let Some(rate_limit) = fetched.rate_limit() {
            self.state
                .update_current_api_rate_limit(rate_limit.to_owned())
                .await;
        }
        self.state.transition(batch, BatchState::Succeeded).await;

        self.state.transition(batch, BatchState::Writing).await;
        match self
            .persister
            .persist(fetched.repositories(), self.snapshot_date)
            .await
        {
            Ok(report) => {
                info!(
                    "{batch} committed: {} new, {} refreshed, {} snapshots",
                    report.repositories_inserted,
                    report.repositories_updated,
                    report.snapshots_inserted
                );
                self.state.record_committed(batch, &report).await;
            }
            Err(e) => {
                if let StorageError::IntegrityViolation(message) = e.last_error() {
                    error!(
                        "Storage integrity violation on {batch}, the schema or the writes are inconsistent: {message}"
                    );
                }
                self.state
                    .record_failure(BatchFailure::new(
                        batch.clone(),
                        &e.to_string(),
                        e.attempts(),
                    ))
                    .await;
            }
        }
    }
}
