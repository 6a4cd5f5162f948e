use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use log::{error, info};
use tokio::sync::RwLock;

use super::{BatchFailure, BatchSpec, BatchState, FetcherRateLimit, PersistReport, RunSummary};

/// The state of a crawl run, shared by all the workers
#[derive(Debug, Default)]
pub struct CrawlerState {
    /// Batches waiting for a worker, in dispatch order
    pending_batches: RwLock<VecDeque<BatchSpec>>,

    /// The current state of every batch of the run
    batch_states: RwLock<HashMap<usize, BatchState>>,

    /// The failed batches
    failures: RwLock<Vec<BatchFailure>>,

    /// The total number of repositories persisted
    total_persisted_repositories: RwLock<u32>,

    /// The total number of repositories inserted for the first time
    total_inserted_repositories: RwLock<u32>,

    /// The total number of snapshots inserted
    total_inserted_snapshots: RwLock<u32>,

    /// The API rate limit last reported by the server
    current_api_rate_limit: RwLock<FetcherRateLimit>,
}

impl CrawlerState {
    /// Pushes batches at the back of the queue, in order.
    pub async fn push_batches(&self, batches: Vec<BatchSpec>) {
        let mut batch_states = self.batch_states.write().await;
        let mut pending_batches = self.pending_batches.write().await;
        for batch in batches {
            batch_states.insert(batch.index(), BatchState::Pending);
            pending_batches.push_back(batch);
        }
    }

    /// Pops the next pending batch.
    pub async fn pop_batch(&self) -> Option<BatchSpec> {
        let mut pending_batches = self.pending_batches.write().await;

        pending_batches.pop_front()
    }

    /// Moves a batch to a new state.
    pub async fn transition(&self, batch: &BatchSpec, state: BatchState) {
        let mut batch_states = self.batch_states.write().await;
        let previous = batch_states.insert(batch.index(), state);
        info!(
            "Batch #{} {} -> {state}",
            batch.index(),
            previous.unwrap_or(BatchState::Pending)
        );
    }

    /// Retrieves the state of a batch.
    pub async fn get_batch_state(&self, index: usize) -> Option<BatchState> {
        let batch_states = self.batch_states.read().await;
        batch_states.get(&index).copied()
    }

    /// Records a committed batch.
    pub async fn record_committed(&self, batch: &BatchSpec, report: &PersistReport) {
        *self.total_persisted_repositories.write().await += report.repositories_persisted();
        *self.total_inserted_repositories.write().await += report.repositories_inserted;
        *self.total_inserted_snapshots.write().await += report.snapshots_inserted;
        self.transition(batch, BatchState::Committed).await;
    }

    /// Records a failed batch.
    pub async fn record_failure(&self, failure: BatchFailure) {
        error!("{failure}");
        self.transition(&failure.batch, BatchState::Failed).await;
        let mut failures = self.failures.write().await;
        failures.push(failure);
    }

    /// Records a batch abandoned because of cancellation.
    pub async fn record_skipped(&self, batch: &BatchSpec) {
        self.transition(batch, BatchState::Skipped).await;
    }

    /// Marks all the batches still pending as skipped, returning how many were.
    pub async fn skip_pending_batches(&self) -> usize {
        let skipped: Vec<BatchSpec> = {
            let mut pending_batches = self.pending_batches.write().await;
            pending_batches.drain(..).collect()
        };
        for batch in &skipped {
            self.record_skipped(batch).await;
        }

        skipped.len()
    }

    /// Counts the batches in a given state.
    pub async fn count_batches(&self, state: BatchState) -> usize {
        let batch_states = self.batch_states.read().await;
        batch_states.values().filter(|s| **s == state).count()
    }

    /// Whether every batch reached a terminal state.
    pub async fn has_completed(&self) -> bool {
        let batch_states = self.batch_states.read().await;
        batch_states.values().all(|state| state.is_terminal())
    }

    /// Retrieves the total number of persisted repositories.
    pub async fn get_total_persisted_repositories(&self) -> u32 {
        *self.total_persisted_repositories.read().await
    }

    /// Updates the API rate limit.
    pub async fn update_current_api_rate_limit(&self, rate_limit: FetcherRateLimit) {
        let mut api_rate_limit = self.current_api_rate_limit.write().await;
        *api_rate_limit = rate_limit;
    }

    /// Retrieves the current API rate limit.
    pub async fn get_current_api_rate_limit(&self) -> FetcherRateLimit {
        let api_rate_limit = self.current_api_rate_limit.read().await;
        api_rate_limit.to_owned()
    }

    /// Returns the summary of the state.
    pub async fn state_summary(&self) -> String {
        let committed = self.count_batches(BatchState::Committed).await;
        let failed = self.count_batches(BatchState::Failed).await;
        let total_batches = self.batch_states.read().await.len();
        let total_buffered_batches = self.pending_batches.read().await.len();
        let total_persisted_repositories = self.get_total_persisted_repositories().await;
        let current_api_rate_limit = self.get_current_api_rate_limit().await;

        format!(
            "Batches: done={committed}/{total_batches}, failed={failed}, buffered={total_buffered_batches}, Repositories: persisted={total_persisted_repositories}, {current_api_rate_limit}",
        )
    }

    /// Builds the run summary.
    pub async fn summary(&self, elapsed: Duration, cancelled: bool) -> RunSummary {
        RunSummary {
            succeeded: self.count_batches(BatchState::Committed).await,
            failed: self.count_batches(BatchState::Failed).await,
            skipped: self.count_batches(BatchState::Skipped).await,
            repositories_persisted: *self.total_persisted_repositories.read().await,
            repositories_inserted: *self.total_inserted_repositories.read().await,
            snapshots_inserted: *self.total_inserted_snapshots.read().await,
            elapsed,
            cancelled,
            failures: self.failures.read().await.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batches(count: usize) -> Vec<BatchSpec> {
        (0..count)
            .map(|index| BatchSpec::new(index, "stars:1", index as u32 * 10, 10, 10))
            .collect()
    }

    #[tokio::test]
    async fn pops_batches_in_dispatch_order() {
        let state = CrawlerState::default();
        state.push_batches(batches(3)).await;

        assert_eq!(Some(0), state.pop_batch().await.map(|b| b.index()));
        assert_eq!(Some(1), state.pop_batch().await.map(|b| b.index()));
        assert_eq!(Some(2), state.pop_batch().await.map(|b| b.index()));
        assert_eq!(None, state.pop_batch().await);
    }

    #[tokio::test]
    async fn has_completed_only_when_all_batches_are_terminal() {
        let state = CrawlerState::default();
        let batches = batches(2);
        state.push_batches(batches.clone()).await;
        assert!(!state.has_completed().await);

        state
            .record_committed(&batches[0], &PersistReport::default())
            .await;
        state.transition(&batches[1], BatchState::Writing).await;
        assert!(!state.has_completed().await);

        state
            .record_failure(BatchFailure::new(batches[1].clone(), "boom", 1))
            .await;
        assert!(state.has_completed().await);
    }

    #[tokio::test]
    async fn skips_pending_batches() {
        let state = CrawlerState::default();
        state.push_batches(batches(3)).await;
        let first = state.pop_batch().await.unwrap();
        state
            .record_committed(&first, &PersistReport::default())
            .await;

        let skipped = state.skip_pending_batches().await;

        assert_eq!(2, skipped);
        assert_eq!(Some(BatchState::Skipped), state.get_batch_state(2).await);
        assert!(state.has_completed().await);
    }

    #[tokio::test]
    async fn summary_aggregates_batches_and_counters() {
        let state = CrawlerState::default();
        let batches = batches(3);
        state.push_batches(batches.clone()).await;
        state
            .record_committed(
                &batches[0],
                &PersistReport {
                    repositories_inserted: 8,
                    repositories_updated: 2,
                    snapshots_inserted: 10,
                    snapshots_ignored: 0,
                },
            )
            .await;
        state
            .record_failure(BatchFailure::new(batches[1].clone(), "boom", 5))
            .await;
        state.record_skipped(&batches[2]).await;

        let summary = state.summary(Duration::from_secs(1), true).await;

        assert_eq!(
            RunSummary {
                succeeded: 1,
                failed: 1,
                skipped: 1,
                repositories_persisted: 10,
                repositories_inserted: 8,
                snapshots_inserted: 10,
                elapsed: Duration::from_secs(1),
                cancelled: true,
                failures: vec![BatchFailure::new(batches[1].clone(), "boom", 5)],
            },
            summary
        );
    }

    #[tokio::test]
    async fn update_and_get_current_api_rate_limit() {
        let state = CrawlerState::default();

        state
            .update_current_api_rate_limit(FetcherRateLimit::dummy())
            .await;

        assert_eq!(
            FetcherRateLimit::dummy(),
            state.get_current_api_rate_limit().await
        );
    }
}
