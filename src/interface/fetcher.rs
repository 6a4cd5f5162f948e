use crate::{BatchFetchError, BatchSpec, FetchError, FetchedBatch, SearchPage, SearchPageRequest};

/// A trait for fetching one page of repository data from the API.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait RepositoryFetcher: Sync + Send {
    /// Fetches one page of repositories from the API.
    async fn fetch(&self, request: &SearchPageRequest) -> Result<SearchPage, FetchError>;
}

/// A trait for fetching all the repositories of a batch.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait BatchFetcher: Sync + Send {
    /// Fetches the repositories of the batch, in upstream order.
    async fn fetch_batch(&self, batch: &BatchSpec) -> Result<FetchedBatch, BatchFetchError>;
}
