use crate::{BatchSpec, RunSummary, StdResult};

/// A trait for crawling GitHub repositories and their star counts.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait RepositoryCrawler: Sync + Send {
    /// Crawls the batches until each of them is committed, failed or skipped.
    async fn crawl(&self, batches: Vec<BatchSpec>) -> StdResult<RunSummary>;
}
