use super::{FetcherRateLimit, Repository};

/// One page of search results and its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPage {
    /// Retrieved repositories, in upstream order
    pub(crate) repositories: Vec<Repository>,

    /// The cursor of the last item of the page
    pub(crate) end_cursor: Option<String>,

    /// Whether the query has more results
    pub(crate) has_next_page: bool,

    /// The API rate limit information
    pub(crate) rate_limit: FetcherRateLimit,

    /// The number of result slots the page consumed, including the ones that were dropped
    pub(crate) edges: usize,
}

impl SearchPage {
    /// Creates a new `SearchPage` instance.
    pub fn new(
        repositories: Vec<Repository>,
        end_cursor: Option<String>,
        has_next_page: bool,
        rate_limit: FetcherRateLimit,
    ) -> Self {
        let edges = repositories.len();

        Self {
            repositories,
            end_cursor,
            has_next_page,
            rate_limit,
            edges,
        }
    }

    /// Sets the number of result slots returned upstream, when some of them were dropped.
    pub fn with_edges(mut self, edges: usize) -> Self {
        self.edges = edges.max(self.repositories.len());
        self
    }

    /// Retrieves the list of repositories.
    pub fn repositories(&self) -> &[Repository] {
        &self.repositories
    }

    /// Retrieves the number of result slots returned upstream.
    pub fn edges(&self) -> usize {
        self.edges
    }

    /// Retrieves the API rate limit information.
    pub fn rate_limit(&self) -> &FetcherRateLimit {
        &self.rate_limit
    }
}

/// All the repositories of one batch, walked over one or more pages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedBatch {
    /// Retrieved repositories, in upstream order
    pub(crate) repositories: Vec<Repository>,

    /// Number of pages fetched
    pub(crate) pages: u32,

    /// Whether the upstream ran out of results before the batch was full
    pub(crate) exhausted: bool,

    /// The last API rate limit information reported
    pub(crate) rate_limit: Option<FetcherRateLimit>,
}

impl FetchedBatch {
    /// Creates a new `FetchedBatch` instance.
    pub fn new(
        repositories: Vec<Repository>,
        pages: u32,
        exhausted: bool,
        rate_limit: Option<FetcherRateLimit>,
    ) -> Self {
        Self {
            repositories,
            pages,
            exhausted,
            rate_limit,
        }
    }

    /// Retrieves the list of repositories.
    pub fn repositories(&self) -> &[Repository] {
        &self.repositories
    }

    /// Retrieves the number of pages fetched.
    pub fn pages(&self) -> u32 {
        self.pages
    }

    /// Whether the upstream returned fewer repositories than requested.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Retrieves the last reported API rate limit.
    pub fn rate_limit(&self) -> Option<&FetcherRateLimit> {
        self.rate_limit.as_ref()
    }
}
