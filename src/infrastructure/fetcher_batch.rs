use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    BackoffController, BackoffPolicy, BatchFetchError, BatchFetcher, BatchSpec, FetchError,
    FetchedBatch, FetcherRateLimit, RepositoryFetcher, RetryDecision, SearchPage,
    SearchPageRequest, TokenBucketRateLimiter,
};

/// Fetches a batch page by page, behind the shared rate limiter and with retries.
pub struct PaginatedBatchFetcher {
    /// The fetcher of single pages.
    fetcher: Arc<dyn RepositoryFetcher>,

    /// The point budget shared by all the workers.
    rate_limiter: Arc<TokenBucketRateLimiter>,

    /// The retry policy of each page call.
    backoff_policy: BackoffPolicy,

    /// The run cancellation token.
    cancellation: CancellationToken,

    /// The points debited for one page.
    page_cost: u32,

    /// The last server side budget reported, shared by all the batches.
    server_rate_limit: Mutex<Option<FetcherRateLimit>>,
}

impl PaginatedBatchFetcher {
    /// Creates a new `PaginatedBatchFetcher` instance.
    pub fn new(
        fetcher: Arc<dyn RepositoryFetcher>,
        rate_limiter: Arc<TokenBucketRateLimiter>,
        backoff_policy: BackoffPolicy,
        cancellation: CancellationToken,
        page_cost: u32,
    ) -> Self {
        Self {
            fetcher,
            rate_limiter,
            backoff_policy,
            cancellation,
            page_cost,
            server_rate_limit: Mutex::new(None),
        }
    }

    /// Fetches one page, retrying it as long as the backoff controller allows.
    ///
    /// A call that was throttled is retried on the permit it already paid for. A call that
    /// was already sent when the run is cancelled is left to complete, but never retried.
    /// No call is sent while the last reported server budget is spent.
    async fn fetch_page(
        &self,
        batch: &BatchSpec,
        request: &SearchPageRequest,
    ) -> Result<SearchPage, BatchFetchError> {
        let mut controller = BackoffController::new(
            self.backoff_policy.clone(),
            self.cancellation.clone(),
            &format!(
                "batch={} query=\"{}\" after={:?}",
                batch.index(),
                batch.query(),
                request.after
            ),
        );
        let mut needs_permit = true;
        loop {
            if needs_permit {
                if !self.wait_for_server_budget().await {
                    return Err(BatchFetchError::new(
                        FetchError::Cancelled,
                        controller.attempts(),
                    ));
                }
                tokio::select! {
                    _ = self.cancellation.cancelled() => {
                        return Err(BatchFetchError::new(FetchError::Cancelled, controller.attempts()));
                    }
                    _ = self.rate_limiter.acquire(self.page_cost) => {}
                }
            }
            let error = match self.fetcher.fetch(request).await {
                Ok(page) => {
                    *self.server_rate_limit.lock().await = Some(page.rate_limit().to_owned());
                    return Ok(page);
                }
                Err(error) => error,
            };

            match controller.decide(&error) {
                RetryDecision::Fail if self.cancellation.is_cancelled() => {
                    return Err(BatchFetchError::new(
                        FetchError::Cancelled,
                        controller.attempts(),
                    ));
                }
                RetryDecision::Fail => {
                    return Err(BatchFetchError::new(error, controller.attempts()));
                }
                RetryDecision::RetryImmediately => {}
                RetryDecision::RetryAfter(delay) => {
                    if !controller.wait(delay).await {
                        return Err(BatchFetchError::new(
                            FetchError::Cancelled,
                            controller.attempts(),
                        ));
                    }
                }
            }
            needs_permit = !matches!(error, FetchError::Throttled { .. });
        }
    }

    /// Waits for the server side budget to reset when the last reported one is spent.
    ///
    /// Returns `false` if the run was cancelled meanwhile.
    async fn wait_for_server_budget(&self) -> bool {
        let Some(rate_limit) = self.server_rate_limit.lock().await.clone() else {
            return true;
        };
        if !rate_limit.is_exceeded() {
            return true;
        }
        let delay = match rate_limit.duration_until_reset(Utc::now()) {
            Ok(delay) if delay.is_zero() => return true,
            Ok(delay) => delay,
            Err(e) => {
                warn!("Server budget is spent, but its reset is unknown: {e}");
                return true;
            }
        };
        info!("Server budget is spent, waiting {delay:?} for the reset ({rate_limit})");

        tokio::select! {
            _ = self.cancellation.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

#[async_trait::async_trait]
impl BatchFetcher for PaginatedBatchFetcher {
    async fn fetch_batch(&self, batch: &BatchSpec) -> Result<FetchedBatch, BatchFetchError> {
        let size = batch.size() as usize;
        let mut repositories = Vec::with_capacity(size);
        let mut pages = 0;
        let mut consumed = 0;
        let mut exhausted = false;
        let mut rate_limit = None;
        let mut next_request = Some(batch.first_page_request());

        while let Some(request) = next_request.take() {
            let SearchPage {
                repositories: fetched,
                end_cursor,
                has_next_page,
                rate_limit: page_rate_limit,
                edges,
            } = self.fetch_page(batch, &request).await?;
            pages += 1;
            consumed += edges;
            debug!(
                "Batch #{} page {pages}: {} repositories over {edges}/{} results",
                batch.index(),
                fetched.len(),
                request.first()
            );
            repositories.extend(fetched);
            rate_limit = Some(page_rate_limit);

            if edges < request.first() as usize || !has_next_page {
                exhausted = consumed < size;
            } else {
                next_request = batch.next_page_request(consumed, end_cursor);
            }
        }
        repositories.truncate(size);
        if exhausted {
            info!(
                "{batch} exhausted the search results after {} repositories",
                repositories.len()
            );
        }

        Ok(FetchedBatch::new(repositories, pages, exhausted, rate_limit))
    }
}
