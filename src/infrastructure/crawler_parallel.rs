use std::{sync::Arc, time::Duration};

use anyhow::anyhow;
use chrono::NaiveDate;
use log::{error, info, warn};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::{
    BatchFetcher, BatchSpec, CrawlerState, RepositoryCrawler, RepositoryPersister, RunSummary,
    StdResult, WorkerCrawler,
};

/// A parallel crawler that uses a bounded pool of workers to crawl batches concurrently.
pub struct ParallelCrawler {
    /// The batch fetcher shared by the workers
    fetcher: Arc<dyn BatchFetcher>,

    /// The persister shared by the workers
    persister: Arc<dyn RepositoryPersister>,

    /// The run cancellation token
    cancellation: CancellationToken,

    /// The number of workers
    max_concurrency: usize,

    /// The delay between starting each worker
    delay_between_workers: Duration,

    /// The date of the star snapshots
    snapshot_date: NaiveDate,
}

impl ParallelCrawler {
    /// Creates a new `ParallelCrawler` instance.
    pub fn new(
        fetcher: Arc<dyn BatchFetcher>,
        persister: Arc<dyn RepositoryPersister>,
        cancellation: CancellationToken,
        max_concurrency: usize,
        delay_between_workers: Duration,
        snapshot_date: NaiveDate,
    ) -> Self {
        Self {
            fetcher,
            persister,
            cancellation,
            max_concurrency,
            delay_between_workers,
            snapshot_date,
        }
    }
}

#[async_trait::async_trait]
impl RepositoryCrawler for ParallelCrawler {
    async fn crawl(&self, batches: Vec<BatchSpec>) -> StdResult<RunSummary> {
        if batches.is_empty() {
            return Err(anyhow!("No batches to crawl"));
        }
        let start = Instant::now();
        let total_workers = self.max_concurrency.clamp(1, batches.len());
        let state = Arc::new(CrawlerState::default());
        state.push_batches(batches).await;

        let mut handles = Vec::with_capacity(total_workers);
        for id in 0..total_workers {
            if !handles.is_empty() {
                tokio::select! {
                    _ = self.cancellation.cancelled() => break,
                    _ = sleep(self.delay_between_workers) => {}
                }
            }
            let worker = WorkerCrawler::new(
                id,
                self.fetcher.clone(),
                self.persister.clone(),
                state.clone(),
                self.cancellation.clone(),
                self.snapshot_date,
            );
            handles.push(tokio::spawn(async move { worker.run().await }));
            info!("Started worker {}/{total_workers}", handles.len());
        }

        let mut worker_error = None;
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker crashed: {e}");
                worker_error.get_or_insert(e);
            }
        }
        if let Some(e) = worker_error {
            warn!(
                "Partial state at the worker crash: {}",
                state.summary(start.elapsed(), true).await
            );
            return Err(e.into());
        }
        let skipped = state.skip_pending_batches().await;
        if skipped > 0 {
            warn!("Run cancelled, {skipped} batches were never dispatched");
        }

        Ok(state
            .summary(start.elapsed(), self.cancellation.is_cancelled())
            .await)
    }
}
